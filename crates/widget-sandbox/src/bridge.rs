//! SandboxBridge: host-side owner of the isolated script environment.
//!
//! The bridge creates at most one isolated environment at a time (through a
//! [`SandboxLauncher`]), submits scripts to it, matches responses to callers
//! by correlation id, enforces the execution ceiling, and performs network
//! requests on the sandbox's behalf through a [`FetchDispatcher`].
//!
//! All bookkeeping lives in one mutex-guarded [`State`]. Removing an entry
//! from the pending map is the only way a script call is settled: the
//! response path, the timeout path, teardown and caller cancellation all race
//! through that removal and exactly one of them wins.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::SandboxError;
use crate::ipc::{
    decode_frame, read_message_with_limit, write_message, HostMessage, SandboxMessage,
    DEFAULT_MAX_IPC_MESSAGE_SIZE,
};
use crate::launcher::{SandboxIo, SandboxLauncher};
use crate::result::ScriptResult;
use crate::FetchDispatcher;

/// Configuration for the host bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Hard ceiling for one `execute_script` call.
    pub timeout: Duration,
    /// How long `init_sandbox` waits for the environment to announce readiness.
    pub startup_timeout: Duration,
    /// Maximum script size in bytes.
    pub max_code_size: usize,
    /// Maximum size of a single frame read from the sandbox.
    pub max_ipc_message_size: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            startup_timeout: Duration::from_secs(10),
            max_code_size: 64 * 1024, // 64 KB
            max_ipc_message_size: DEFAULT_MAX_IPC_MESSAGE_SIZE,
        }
    }
}

/// Why a session ended. Decides the error delivered to waiting callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    Destroyed,
    Exited,
}

impl Teardown {
    fn error(self) -> SandboxError {
        match self {
            Teardown::Destroyed => SandboxError::Destroyed,
            Teardown::Exited => SandboxError::SandboxExited,
        }
    }
}

type ScriptReply = Result<ScriptResult, SandboxError>;

struct PendingScript {
    tx: oneshot::Sender<ScriptReply>,
    submitted_at: Instant,
}

/// One live isolated environment and the tasks pumping its channel.
struct Session {
    generation: u64,
    outbound: mpsc::UnboundedSender<HostMessage>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    // Killed on drop.
    _process: Option<Child>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

#[derive(Default)]
struct State {
    session: Option<Session>,
    ready: bool,
    ready_waiters: Vec<oneshot::Sender<Result<(), SandboxError>>>,
    pending: HashMap<u64, PendingScript>,
}

impl State {
    fn is_current(&self, generation: u64) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.generation == generation)
    }
}

struct Inner {
    config: BridgeConfig,
    launcher: Arc<dyn SandboxLauncher>,
    fetcher: Arc<dyn FetchDispatcher>,
    next_script_id: AtomicU64,
    next_generation: AtomicU64,
    state: Mutex<State>,
}

/// Host-side handle to the isolated environment.
///
/// Create one per application and share it (e.g. behind an `Arc`) with every
/// component that runs widget scripts. Dropping it tears the sandbox down.
pub struct SandboxBridge {
    inner: Arc<Inner>,
}

impl SandboxBridge {
    /// Create a bridge. No environment is started until [`init_sandbox`](Self::init_sandbox)
    /// or [`execute_script`](Self::execute_script) is called.
    pub fn new(
        config: BridgeConfig,
        launcher: Arc<dyn SandboxLauncher>,
        fetcher: Arc<dyn FetchDispatcher>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                launcher,
                fetcher,
                next_script_id: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// The bridge configuration.
    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Whether the current environment has announced readiness.
    pub fn is_ready(&self) -> bool {
        self.inner.lock().ready
    }

    /// Number of script calls still waiting for an outcome.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Ensure exactly one isolated environment exists and wait until it is ready.
    ///
    /// Concurrent callers share a single launch. Once ready, further calls
    /// return immediately.
    pub async fn init_sandbox(&self) -> Result<(), SandboxError> {
        let (generation, ready_rx) = {
            let mut state = self.inner.lock();
            if state.ready {
                return Ok(());
            }
            let existing = state.session.as_ref().map(|s| s.generation);
            let generation = match existing {
                Some(generation) => generation,
                None => {
                    let session = self.inner.start_session()?;
                    let generation = session.generation;
                    tracing::info!(
                        target: "widget::sandbox::bridge",
                        generation,
                        "sandbox launched, waiting for readiness"
                    );
                    state.session = Some(session);
                    generation
                }
            };
            let (tx, rx) = oneshot::channel();
            state.ready_waiters.push(tx);
            (generation, rx)
        };

        // Bound first so `ready_rx` is dropped before abandoned waiters are pruned.
        let waited = tokio::time::timeout(self.inner.config.startup_timeout, ready_rx).await;
        match waited {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_closed)) => Err(SandboxError::Destroyed),
            Err(_elapsed) => {
                self.inner.abandon_startup(generation);
                Err(SandboxError::StartupTimeout {
                    timeout_ms: self.inner.config.startup_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Run a script in the isolated environment and return its sanitized result.
    ///
    /// Starts the environment first if needed. Fails with
    /// [`SandboxError::Timeout`] when nothing arrives within the configured
    /// ceiling, [`SandboxError::Script`] when the script fails, and
    /// [`SandboxError::Destroyed`] when the sandbox is torn down meanwhile.
    pub async fn execute_script(&self, code: &str) -> Result<ScriptResult, SandboxError> {
        let max = self.inner.config.max_code_size;
        if code.len() > max {
            return Err(SandboxError::CodeTooLarge {
                max,
                actual: code.len(),
            });
        }

        if !self.is_ready() {
            self.init_sandbox().await?;
        }

        let script_id = self.inner.next_script_id.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = oneshot::channel();

        {
            let mut state = self.inner.lock();
            let outbound = match (&state.session, state.ready) {
                (Some(session), true) => session.outbound.clone(),
                _ => return Err(SandboxError::Destroyed),
            };
            state.pending.insert(
                script_id,
                PendingScript {
                    tx,
                    submitted_at: Instant::now(),
                },
            );
            let msg = HostMessage::ExecuteScript {
                script_id,
                code: code.to_string(),
            };
            if outbound.send(msg).is_err() {
                state.pending.remove(&script_id);
                return Err(SandboxError::SandboxExited);
            }
        }

        tracing::debug!(
            target: "widget::sandbox::bridge",
            script_id,
            code_len = code.len(),
            "script submitted"
        );

        // Dropping this future (caller cancellation) must not leave the entry behind.
        let _guard = PendingGuard {
            inner: &self.inner,
            script_id,
        };

        match tokio::time::timeout(self.inner.config.timeout, &mut rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_closed)) => Err(SandboxError::Destroyed),
            Err(_elapsed) => {
                if self.inner.take_pending(script_id).is_some() {
                    tracing::warn!(
                        target: "widget::sandbox::bridge",
                        script_id,
                        timeout_ms = self.inner.config.timeout.as_millis() as u64,
                        "script timed out"
                    );
                    Err(SandboxError::Timeout {
                        timeout_ms: self.inner.config.timeout.as_millis() as u64,
                    })
                } else {
                    // The response path committed first; its reply is in flight.
                    rx.await.unwrap_or(Err(SandboxError::Destroyed))
                }
            }
        }
    }

    /// Tear down the isolated environment.
    ///
    /// Every outstanding `execute_script` call fails with
    /// [`SandboxError::Destroyed`]. A no-op when no environment exists.
    pub fn destroy_sandbox(&self) {
        self.inner.teardown(None, Teardown::Destroyed);
    }
}

impl Drop for SandboxBridge {
    fn drop(&mut self) {
        self.inner.teardown(None, Teardown::Destroyed);
    }
}

struct PendingGuard<'a> {
    inner: &'a Arc<Inner>,
    script_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.take_pending(self.script_id);
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_pending(&self, script_id: u64) -> Option<PendingScript> {
        self.lock().pending.remove(&script_id)
    }

    /// Forget readiness waiters that gave up. When nobody is left waiting on
    /// `generation`, drop it so the next call launches a fresh environment.
    fn abandon_startup(&self, generation: u64) {
        let abandoned = {
            let mut state = self.lock();
            if !state.is_current(generation) || state.ready {
                return;
            }
            state.ready_waiters.retain(|w| !w.is_closed());
            state.ready_waiters.is_empty()
        };
        if abandoned {
            tracing::warn!(
                target: "widget::sandbox::bridge",
                generation,
                "sandbox never became ready, discarding it"
            );
            self.teardown(Some(generation), Teardown::Exited);
        }
    }

    fn start_session(self: &Arc<Self>) -> Result<Session, SandboxError> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let SandboxIo {
            reader,
            writer,
            process,
        } = self.launcher.launch()?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(write_loop(
            Arc::downgrade(self),
            generation,
            writer,
            outbound_rx,
        ));
        let reader = tokio::spawn(read_loop(
            Arc::downgrade(self),
            generation,
            reader,
            outbound_tx.clone(),
            self.config.max_ipc_message_size,
        ));

        Ok(Session {
            generation,
            outbound: outbound_tx,
            reader,
            writer,
            _process: process,
        })
    }

    /// Route one inbound message from the sandbox.
    fn dispatch(
        &self,
        generation: u64,
        msg: SandboxMessage,
        outbound: &mpsc::UnboundedSender<HostMessage>,
    ) {
        match msg {
            SandboxMessage::SandboxReady => {
                let waiters = {
                    let mut state = self.lock();
                    if !state.is_current(generation) {
                        return;
                    }
                    state.ready = true;
                    std::mem::take(&mut state.ready_waiters)
                };
                tracing::info!(
                    target: "widget::sandbox::bridge",
                    generation,
                    waiters = waiters.len(),
                    "sandbox ready"
                );
                for waiter in waiters {
                    let _ = waiter.send(Ok(()));
                }
            }
            SandboxMessage::ScriptResult { script_id, result } => {
                self.settle(script_id, Ok(ScriptResult::sanitize(&result)));
            }
            SandboxMessage::ScriptError { script_id, error } => {
                self.settle(script_id, Err(SandboxError::script(error)));
            }
            SandboxMessage::FetchRequest {
                request_id,
                url,
                options,
            } => {
                let fetcher = self.fetcher.clone();
                let outbound = outbound.clone();
                tokio::spawn(async move {
                    tracing::debug!(
                        target: "widget::sandbox::proxy",
                        request_id,
                        url = %url,
                        "proxying fetch"
                    );
                    let outcome = fetcher.fetch(&url, options.unwrap_or_default()).await;
                    if let Err(e) = &outcome {
                        tracing::debug!(
                            target: "widget::sandbox::proxy",
                            request_id,
                            error = %e,
                            "fetch failed"
                        );
                    }
                    if outbound
                        .send(HostMessage::fetch_response(request_id, outcome))
                        .is_err()
                    {
                        tracing::debug!(
                            target: "widget::sandbox::proxy",
                            request_id,
                            "sandbox gone before fetch response could be delivered"
                        );
                    }
                });
            }
        }
    }

    fn settle(&self, script_id: u64, reply: ScriptReply) {
        let Some(pending) = self.take_pending(script_id) else {
            tracing::debug!(
                target: "widget::sandbox::bridge",
                script_id,
                "dropping outcome for unknown or already settled script"
            );
            return;
        };
        tracing::debug!(
            target: "widget::sandbox::bridge",
            script_id,
            ok = reply.is_ok(),
            elapsed_ms = pending.submitted_at.elapsed().as_millis() as u64,
            "script settled"
        );
        let _ = pending.tx.send(reply);
    }

    /// End the current session (or only `generation`, when given) and fail
    /// everything waiting on it.
    fn teardown(&self, generation: Option<u64>, reason: Teardown) {
        let (session, pending, waiters) = {
            let mut state = self.lock();
            if let Some(generation) = generation {
                if !state.is_current(generation) {
                    return;
                }
            }
            let Some(session) = state.session.take() else {
                return;
            };
            state.ready = false;
            (
                session,
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.ready_waiters),
            )
        };

        match reason {
            Teardown::Destroyed => tracing::info!(
                target: "widget::sandbox::bridge",
                generation = session.generation,
                pending = pending.len(),
                "sandbox destroyed"
            ),
            Teardown::Exited => tracing::warn!(
                target: "widget::sandbox::bridge",
                generation = session.generation,
                pending = pending.len(),
                "sandbox exited"
            ),
        }
        drop(session);

        for (_, p) in pending {
            let _ = p.tx.send(Err(reason.error()));
        }
        for waiter in waiters {
            let _ = waiter.send(Err(reason.error()));
        }
    }
}

async fn read_loop(
    inner: Weak<Inner>,
    generation: u64,
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    outbound: mpsc::UnboundedSender<HostMessage>,
    max_size: usize,
) {
    loop {
        let frame = read_message_with_limit::<Value, _>(&mut reader, max_size).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match frame {
            Ok(Some(frame)) => match decode_frame::<SandboxMessage>(frame) {
                Some(msg) => inner.dispatch(generation, msg, &outbound),
                None => tracing::debug!(
                    target: "widget::sandbox::bridge",
                    "ignoring sandbox frame without a recognised type"
                ),
            },
            Ok(None) => {
                inner.teardown(Some(generation), Teardown::Exited);
                return;
            }
            Err(e) => {
                tracing::warn!(target: "widget::sandbox::bridge", error = %e, "sandbox IPC read failed");
                inner.teardown(Some(generation), Teardown::Exited);
                return;
            }
        }
    }
}

async fn write_loop(
    inner: Weak<Inner>,
    generation: u64,
    mut writer: Box<dyn AsyncWrite + Send + Unpin>,
    mut outbound: mpsc::UnboundedReceiver<HostMessage>,
) {
    while let Some(msg) = outbound.recv().await {
        if let Err(e) = write_message(&mut writer, &msg).await {
            tracing::warn!(target: "widget::sandbox::bridge", error = %e, "sandbox IPC write failed");
            if let Some(inner) = inner.upgrade() {
                inner.teardown(Some(generation), Teardown::Exited);
            }
            return;
        }
    }
}
