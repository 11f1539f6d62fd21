//! Error types for the widget sandbox.

use thiserror::Error;

/// Errors surfaced to callers of [`SandboxBridge`](crate::bridge::SandboxBridge).
///
/// Every variant is local to a single `execute_script` call except
/// [`SandboxError::Destroyed`] and [`SandboxError::SandboxExited`], which are
/// delivered to every call outstanding at teardown.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// No result or error arrived within the execution ceiling.
    #[error("script timeout ({}s)", secs(.timeout_ms))]
    Timeout {
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The user script threw, rejected, or failed to parse.
    #[error("{message}")]
    Script {
        /// The error description reported by the evaluator.
        message: String,
    },

    /// The sandbox was torn down while the call was outstanding.
    #[error("sandbox destroyed")]
    Destroyed,

    /// The isolated environment exited or its channel broke.
    #[error("sandbox exited unexpectedly")]
    SandboxExited,

    /// The isolated environment did not announce readiness in time.
    #[error("sandbox did not become ready within {timeout_ms}ms")]
    StartupTimeout {
        /// Configured startup timeout in milliseconds.
        timeout_ms: u64,
    },

    /// Script source exceeds the configured maximum size.
    #[error("script exceeds maximum size of {max} bytes (got {actual})")]
    CodeTooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// V8 heap memory limit was exceeded.
    #[error("V8 heap limit exceeded")]
    HeapLimitExceeded,

    /// The isolated environment could not be created.
    #[error("failed to launch sandbox: {0}")]
    Launch(#[from] anyhow::Error),

    /// Reading or writing an IPC frame failed.
    #[error("sandbox IPC error: {0}")]
    Ipc(#[from] std::io::Error),

    /// A payload could not be (de)serialized.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn secs(ms: &u64) -> f64 {
    *ms as f64 / 1000.0
}

impl SandboxError {
    /// Build a [`SandboxError::Script`], substituting a generic message for an
    /// absent or empty one.
    pub fn script(message: Option<String>) -> Self {
        match message {
            Some(message) if !message.is_empty() => Self::Script { message },
            _ => Self::Script {
                message: "Script error".into(),
            },
        }
    }
}

/// Failures of the network proxy procedure.
///
/// The `Display` text is exactly what the user script observes as the
/// rejection message of `fetchData`.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The request could not be built (bad URL, bad method, bad header).
    #[error("{0}")]
    InvalidRequest(String),

    /// DNS, connect, TLS or other transport-level failure.
    #[error("{0}")]
    Transport(String),

    /// The response body could not be read as text.
    #[error("{0}")]
    Body(String),

    /// The IPC channel to the host closed before a response arrived.
    #[error("fetch channel closed: {0}")]
    ChannelClosed(String),
}

// Both cross task and thread boundaries.
const _: fn() = || {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<SandboxError>();
    assert_bounds::<ProxyError>();
};
