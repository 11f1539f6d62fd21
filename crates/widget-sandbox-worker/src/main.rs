//! Widget sandbox worker: isolated child process for script evaluation.
//!
//! This binary is spawned by [`widget_sandbox::ChildProcessLauncher`] in the
//! host process. It announces readiness on stdout, then evaluates every
//! `executeScript` it receives on stdin in a fresh V8 isolate. `fetchData`
//! calls are proxied through the host via the IPC protocol.
//!
//! **Security**: This process runs with a clean environment. Its only channel
//! to the outside world is the host's pipe.

use anyhow::{Context, Result};
use tokio::io::{self, BufReader};
use widget_sandbox::evaluator::{self, WorkerConfig};
use widget_sandbox::launcher::WORKER_CONFIG_ENV;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let config: WorkerConfig = match std::env::var(WORKER_CONFIG_ENV) {
        Ok(json) => serde_json::from_str(&json)
            .with_context(|| format!("invalid {WORKER_CONFIG_ENV}"))?,
        Err(_) => WorkerConfig::default(),
    };

    // The launcher already clears the environment; a worker started by hand
    // gets the same treatment.
    let env_keys: Vec<String> = std::env::vars().map(|(k, _)| k).collect();
    for key in env_keys {
        std::env::remove_var(&key);
    }

    // The host discards stderr unless WIDGET_DEBUG is set on its side.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::WARN)
        .init();

    if let Err(e) = evaluator::serve(config, BufReader::new(io::stdin()), io::stdout())
        .await
    {
        tracing::warn!(target: "widget::sandbox::worker", error = %e, "sandbox worker stopped");
        return Err(e);
    }
    Ok(())
}
