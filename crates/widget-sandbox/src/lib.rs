#![warn(missing_docs)]

//! # widget-sandbox
//!
//! Isolated execution of user-authored widget scripts.
//!
//! A widget script is the body of an async JavaScript function. It runs in a
//! fresh deno_core isolate inside a separate worker process (or a dedicated
//! thread, see [`launcher`]) with no filesystem, environment, or network
//! access. Its only capability is `fetchData(url, options)`, which the host
//! performs on the script's behalf through a [`FetchDispatcher`].
//!
//! ## Security model
//!
//! - **Process isolation**: The evaluator runs in `widget-worker` with a cleared environment
//! - **Structured channel**: Host and sandbox exchange only the typed messages in [`ipc`]
//! - **Single capability**: `fetchData` is the sole bridge out; it forwards method, headers and body only
//! - **Fresh runtime per script**: No state leaks between executions
//! - **Execution ceiling**: Every call is abandoned after a fixed timeout
//! - **Allow-list results**: Only `value`, `label` and `color` cross back to the caller

pub mod bridge;
pub mod error;
pub mod evaluator;
pub mod ipc;
pub mod launcher;
pub mod ops;
pub mod proxy;
pub mod result;
pub mod widget;

pub use bridge::{BridgeConfig, SandboxBridge};
pub use error::{ProxyError, SandboxError};
pub use ipc::{FetchOptions, FetchReply};
pub use evaluator::WorkerConfig;
pub use launcher::{ChildProcessLauncher, InProcessLauncher, SandboxLauncher};
pub use proxy::HttpFetcher;
pub use result::ScriptResult;

/// Performs a network request on behalf of sandboxed code.
///
/// On the host this is the real network proxy ([`HttpFetcher`]). Inside the
/// isolated environment it is the IPC bridge that forwards `fetchData` calls
/// to the host ([`evaluator::IpcFetchBridge`]). Sandbox code never sees which.
#[async_trait::async_trait]
pub trait FetchDispatcher: Send + Sync {
    /// Perform one request.
    ///
    /// Any HTTP status is a successful reply; only failures to obtain a
    /// response at all are errors.
    async fn fetch(&self, url: &str, options: FetchOptions) -> Result<FetchReply, ProxyError>;
}
