//! Launchers create the isolated environment and hand the bridge its channel.
//!
//! [`ChildProcessLauncher`] spawns `widget-worker` with a clean environment and
//! talks to it over stdin/stdout. [`InProcessLauncher`] runs the same evaluator
//! on a dedicated thread over an in-memory pipe, which is what tests and
//! embedders without a separate binary use.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};

use crate::error::SandboxError;
use crate::evaluator::{self, WorkerConfig};

/// File name of the worker binary.
pub const WORKER_BIN_NAME: &str = "widget-worker";

/// Environment variable overriding the worker binary location (absolute path).
pub const WORKER_BIN_ENV: &str = "WIDGET_WORKER_BIN";

/// Environment variable carrying the JSON [`WorkerConfig`] into the worker.
pub const WORKER_CONFIG_ENV: &str = "WIDGET_WORKER_CONFIG";

/// Environment variable that lets the worker's stderr through to ours.
pub const DEBUG_ENV: &str = "WIDGET_DEBUG";

/// The host's ends of a freshly launched environment.
pub struct SandboxIo {
    /// Frames coming from the sandbox.
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Frames going to the sandbox.
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// The worker process, if there is one. Killed when dropped.
    pub process: Option<Child>,
}

/// Creates isolated environments for a [`SandboxBridge`](crate::SandboxBridge).
///
/// Called from within a tokio runtime. The environment must send
/// `sandboxReady` once it accepts scripts.
pub trait SandboxLauncher: Send + Sync {
    /// Start one environment.
    fn launch(&self) -> Result<SandboxIo, SandboxError>;
}

/// Spawns the `widget-worker` binary as the isolated environment.
#[derive(Debug, Clone, Default)]
pub struct ChildProcessLauncher {
    config: WorkerConfig,
    worker_bin: Option<PathBuf>,
}

impl ChildProcessLauncher {
    /// Create a launcher that locates the worker binary on each launch.
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            worker_bin: None,
        }
    }

    /// Use an explicit worker binary instead of searching for one.
    pub fn with_worker_bin(mut self, path: impl Into<PathBuf>) -> Self {
        self.worker_bin = Some(path.into());
        self
    }
}

impl SandboxLauncher for ChildProcessLauncher {
    fn launch(&self) -> Result<SandboxIo, SandboxError> {
        let worker_bin = match &self.worker_bin {
            Some(path) => {
                validate_binary_permissions(path)?;
                path.clone()
            }
            None => find_worker_binary()?,
        };
        let config_json = serde_json::to_string(&self.config)?;

        let mut child = Command::new(&worker_bin)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(if std::env::var_os(DEBUG_ENV).is_some() {
                std::process::Stdio::inherit()
            } else {
                std::process::Stdio::null()
            })
            .env_clear()
            .env(WORKER_CONFIG_ENV, config_json)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SandboxError::Launch(anyhow::anyhow!(
                    "failed to spawn worker at {}: {}",
                    worker_bin.display(),
                    e
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Launch(anyhow::anyhow!("no stdin on child")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Launch(anyhow::anyhow!("no stdout on child")))?;

        tracing::debug!(
            target: "widget::sandbox::launcher",
            worker = %worker_bin.display(),
            pid = ?child.id(),
            "worker spawned"
        );

        Ok(SandboxIo {
            reader: Box::new(BufReader::new(stdout)),
            writer: Box::new(stdin),
            process: Some(child),
        })
    }
}

/// Runs the evaluator on a dedicated thread inside this process.
#[derive(Debug, Clone, Default)]
pub struct InProcessLauncher {
    config: WorkerConfig,
}

impl InProcessLauncher {
    /// Create an in-process launcher.
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }
}

impl SandboxLauncher for InProcessLauncher {
    fn launch(&self) -> Result<SandboxIo, SandboxError> {
        let (host, sandbox) = tokio::io::duplex(64 * 1024);
        let config = self.config.clone();

        std::thread::Builder::new()
            .name("widget-sandbox".into())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        // Dropping `sandbox` closes the pipe; the host sees an exit.
                        tracing::error!(
                            target: "widget::sandbox::launcher",
                            error = %e,
                            "failed to create sandbox runtime"
                        );
                        return;
                    }
                };
                let (reader, writer) = tokio::io::split(sandbox);
                if let Err(e) = rt.block_on(evaluator::serve(config, reader, writer)) {
                    tracing::warn!(
                        target: "widget::sandbox::launcher",
                        error = %e,
                        "in-process sandbox stopped"
                    );
                }
            })
            .map_err(|e| {
                SandboxError::Launch(anyhow::anyhow!("failed to spawn sandbox thread: {e}"))
            })?;

        let (reader, writer) = tokio::io::split(host);
        Ok(SandboxIo {
            reader: Box::new(reader),
            writer: Box::new(writer),
            process: None,
        })
    }
}

/// Find the `widget-worker` binary.
///
/// Search order:
/// 1. `WIDGET_WORKER_BIN` environment variable (must be absolute path)
/// 2. Same directory as the current executable, or its parent
///
/// On Unix, rejects world-writable binaries (mode & 0o002 != 0).
pub fn find_worker_binary() -> Result<PathBuf, SandboxError> {
    locate_worker_binary(
        std::env::var(WORKER_BIN_ENV).ok(),
        std::env::current_exe().ok(),
    )
}

fn locate_worker_binary(
    env_override: Option<String>,
    current_exe: Option<PathBuf>,
) -> Result<PathBuf, SandboxError> {
    if let Some(path) = env_override {
        let p = PathBuf::from(&path);
        if !p.is_absolute() {
            return Err(SandboxError::Launch(anyhow::anyhow!(
                "{WORKER_BIN_ENV} must be an absolute path, got: {path}"
            )));
        }
        if p.exists() {
            validate_binary_permissions(&p)?;
            return Ok(p);
        }
    }

    // Test binaries live in target/<profile>/deps/, the worker one level up.
    if let Some(dir) = current_exe.as_deref().and_then(Path::parent) {
        for candidate in [Some(dir), dir.parent()].into_iter().flatten() {
            let worker = candidate.join(WORKER_BIN_NAME);
            if worker.exists() {
                validate_binary_permissions(&worker)?;
                return Ok(worker);
            }
        }
    }

    Err(SandboxError::Launch(anyhow::anyhow!(
        "{WORKER_BIN_NAME} binary not found. Set {WORKER_BIN_ENV} or install it alongside the host binary"
    )))
}

/// Validate binary file permissions (Unix only).
///
/// Rejects world-writable binaries.
fn validate_binary_permissions(_path: &Path) -> Result<(), SandboxError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = std::fs::metadata(_path).map_err(|e| {
            SandboxError::Launch(anyhow::anyhow!(
                "cannot read metadata for {}: {}",
                _path.display(),
                e
            ))
        })?;
        let mode = metadata.permissions().mode();
        if mode & 0o002 != 0 {
            return Err(SandboxError::Launch(anyhow::anyhow!(
                "insecure permissions on worker binary {}: mode {:o} is world-writable",
                _path.display(),
                mode,
            )));
        }
    }
    Ok(())
}
