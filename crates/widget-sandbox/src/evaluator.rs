//! Isolated script evaluator: the sandbox side of the bridge.
//!
//! [`serve`] speaks the IPC protocol over any reader/writer pair: it announces
//! readiness, runs each `executeScript` in a fresh V8 isolate, and relays
//! `fetchData` calls to the host as `fetchRequest` messages.
//!
//! V8 isolates are `!Send`, so every script runs on its own OS thread with a
//! single-threaded tokio runtime. Several scripts may be in flight at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

use crate::error::{ProxyError, SandboxError};
use crate::ipc::{
    decode_frame, read_message_with_limit, write_message, FetchOptions, FetchReply, HostMessage,
    SandboxMessage, DEFAULT_MAX_IPC_MESSAGE_SIZE,
};
use crate::ops::{widget_ext, ScriptSettled};
use crate::FetchDispatcher;

/// Limits applied inside the isolated environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// V8 heap limit in bytes.
    pub max_heap_size: usize,
    /// Hard stop for a single script, in milliseconds. Keeps abandoned or
    /// CPU-bound scripts from holding a thread forever.
    pub watchdog_ms: u64,
    /// Maximum size of a single frame read from the host.
    pub max_ipc_message_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_heap_size: 64 * 1024 * 1024, // 64 MB
            watchdog_ms: 12_000,
            max_ipc_message_size: DEFAULT_MAX_IPC_MESSAGE_SIZE,
        }
    }
}

impl WorkerConfig {
    fn watchdog(&self) -> Duration {
        Duration::from_millis(self.watchdog_ms)
    }
}

/// How a single script run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptOutcome {
    /// The function returned (or its promise resolved) with this value.
    Returned(Value),
    /// Compilation failed, the function threw, or the run was terminated.
    Threw(String),
    /// The promise never settled and no work was left to drive it.
    Unsettled,
}

impl ScriptOutcome {
    /// The message to post back for `script_id`, if any.
    pub fn into_message(self, script_id: u64) -> Option<SandboxMessage> {
        match self {
            ScriptOutcome::Returned(result) => Some(SandboxMessage::ScriptResult { script_id, result }),
            ScriptOutcome::Threw(error) => Some(SandboxMessage::ScriptError {
                script_id,
                error: Some(error),
            }),
            ScriptOutcome::Unsettled => None,
        }
    }
}

/// Captures the ops, installs `fetchData` and the one-shot runner, then strips
/// everything else a script could use to reach outside its function body.
const BOOTSTRAP: &str = r#"
((ops) => {
    const settle = (json) => ops.op_widget_settle(json);
    const log = (...args) => ops.op_widget_log(args.map(String).join(" "));
    const fetchOp = ops.op_widget_fetch;
    const stringify = JSON.stringify;
    const message = (e) => (e && e.message) ? String(e.message) : String(e);

    const fetchData = async (url, options) => {
        const opts = {};
        if (options) {
            if (options.method !== undefined && options.method !== null) {
                opts.method = String(options.method);
            }
            if (options.headers) {
                const headers = {};
                for (const [k, v] of Object.entries(options.headers)) {
                    headers[k] = String(v);
                }
                opts.headers = headers;
            }
            if (options.body !== undefined && options.body !== null) {
                opts.body = String(options.body);
            }
        }
        return await fetchOp(String(url), stringify(opts));
    };

    Object.defineProperty(globalThis, "__widgetRun", {
        configurable: true,
        value: (body) => {
            delete globalThis.__widgetRun;
            Promise.resolve()
                .then(() => body(fetchData))
                .then(
                    (value) => {
                        let json;
                        try {
                            json = stringify({ ok: value });
                        } catch (e) {
                            json = stringify({ error: message(e) });
                        }
                        settle(json);
                    },
                    (e) => settle(stringify({ error: message(e) })),
                );
        },
    });

    globalThis.console = Object.freeze({ log, info: log, warn: log, error: log, debug: log });

    // `__bootstrap.core` exposes every builtin op, including raw stdout writes.
    delete globalThis.Deno;
    delete globalThis.__bootstrap;
    delete globalThis.eval;
    const constructors = [
        Function,
        (async function(){}).constructor,
        (function*(){}).constructor,
        (async function*(){}).constructor,
    ];
    for (const ctor of constructors) {
        Object.defineProperty(ctor.prototype, "constructor", {
            value: undefined, configurable: false, writable: false
        });
    }
    delete globalThis.Function;
})(Deno.core.ops);
"#;

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

/// V8 near-heap-limit callback. Terminates execution and grants 1MB grace
/// for the termination to propagate.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to the boxed HeapLimitState owned by `run_script`,
    // which outlives the event loop that can trigger this callback.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

fn create_runtime(max_heap_size: usize, fetcher: Arc<dyn FetchDispatcher>) -> JsRuntime {
    let create_params = v8::CreateParams::default().heap_limits(0, max_heap_size);

    let runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![widget_ext::init_ops_and_esm()],
        create_params: Some(create_params),
        ..Default::default()
    });
    runtime.op_state().borrow_mut().put(fetcher);
    runtime
}

/// Run one script in a brand new isolate on the current thread.
///
/// `code` is the body of `async (fetchData) => { ... }`. Must be called from a
/// thread that owns no other isolate.
pub async fn run_script(
    config: &WorkerConfig,
    code: &str,
    fetcher: Arc<dyn FetchDispatcher>,
) -> ScriptOutcome {
    let mut runtime = create_runtime(config.max_heap_size, fetcher);

    if let Err(e) = runtime.execute_script("[widget:bootstrap]", BOOTSTRAP) {
        return ScriptOutcome::Threw(format!("sandbox bootstrap failed: {e}"));
    }

    let heap_state = Box::new(HeapLimitState {
        handle: runtime.v8_isolate().thread_safe_handle(),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
    );

    // CPU watchdog for synchronous loops the event loop timeout cannot interrupt.
    let watchdog_handle = runtime.v8_isolate().thread_safe_handle();
    let timed_out = Arc::new(AtomicBool::new(false));
    let watchdog_timed_out = timed_out.clone();
    let watchdog_after = config.watchdog();
    let (cancel_tx, cancel_rx) = std::sync::mpsc::channel::<()>();

    let watchdog = std::thread::spawn(move || {
        if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) =
            cancel_rx.recv_timeout(watchdog_after)
        {
            watchdog_timed_out.store(true, Ordering::SeqCst);
            watchdog_handle.terminate_execution();
        }
    });

    let wrapped = format!("__widgetRun(async (fetchData) => {{\n{code}\n}});");

    let exec_error = match runtime.execute_script("[widget:script]", wrapped) {
        Ok(_) => match tokio::time::timeout(
            watchdog_after,
            runtime.run_event_loop(PollEventLoopOptions::default()),
        )
        .await
        {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => {
                timed_out.store(true, Ordering::SeqCst);
                None
            }
        },
        Err(e) => Some(e.to_string()),
    };

    // The watchdog must be gone before the isolate is dropped.
    let _ = cancel_tx.send(());
    let _ = watchdog.join();

    let outcome = if heap_state.triggered.load(Ordering::SeqCst) {
        ScriptOutcome::Threw(SandboxError::HeapLimitExceeded.to_string())
    } else if timed_out.load(Ordering::SeqCst) {
        ScriptOutcome::Threw(format!(
            "script terminated after {}ms",
            config.watchdog_ms
        ))
    } else {
        let settled = {
            let state = runtime.op_state();
            let state = state.borrow();
            state.try_borrow::<ScriptSettled>().map(|s| s.0.clone())
        };
        match (settled, exec_error) {
            (Some(json), _) => settle_envelope(&json),
            (None, Some(message)) => ScriptOutcome::Threw(message),
            (None, None) => ScriptOutcome::Unsettled,
        }
    };

    // The heap callback points into `heap_state`; the isolate goes first.
    drop(runtime);
    drop(heap_state);
    outcome
}

fn settle_envelope(json: &str) -> ScriptOutcome {
    let envelope: Value = match serde_json::from_str(json) {
        Ok(v) => v,
        Err(e) => return ScriptOutcome::Threw(format!("malformed script result: {e}")),
    };
    if let Some(error) = envelope.get("error") {
        let message = match error {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return ScriptOutcome::Threw(message);
    }
    // `undefined` is dropped by JSON.stringify, leaving `{}`.
    ScriptOutcome::Returned(envelope.get("ok").cloned().unwrap_or(Value::Null))
}

type FetchWaiters = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<FetchReply, ProxyError>>>>>;

/// Fetch dispatcher that proxies `fetchData` calls through IPC to the host.
///
/// Sends a `fetchRequest` and waits for the `fetchResponse` with the same id.
/// There is no timeout here: an unanswered request stays pending until the
/// script's watchdog ends the run.
pub struct IpcFetchBridge {
    outbound: mpsc::UnboundedSender<SandboxMessage>,
    waiters: FetchWaiters,
    next_id: AtomicU64,
}

impl IpcFetchBridge {
    fn resolve(&self, request_id: u64, reply: Result<FetchReply, ProxyError>) {
        let waiter = self
            .waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&request_id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(reply);
            }
            None => tracing::debug!(
                target: "widget::sandbox::evaluator",
                request_id,
                "dropping response for unknown fetch request"
            ),
        }
    }
}

#[async_trait::async_trait]
impl FetchDispatcher for IpcFetchBridge {
    async fn fetch(&self, url: &str, options: FetchOptions) -> Result<FetchReply, ProxyError> {
        let request_id = self.next_id.fetch_add(1, Ordering::SeqCst);

        // Register before sending so a fast response cannot miss its waiter.
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request_id, tx);

        let request = SandboxMessage::FetchRequest {
            request_id,
            url: url.to_string(),
            options: Some(options),
        };
        if self.outbound.send(request).is_err() {
            self.waiters
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&request_id);
            return Err(ProxyError::ChannelClosed("host connection closed".into()));
        }

        rx.await
            .map_err(|_| ProxyError::ChannelClosed("response dropped".into()))?
    }
}

fn spawn_script(
    config: WorkerConfig,
    script_id: u64,
    code: String,
    fetcher: Arc<dyn FetchDispatcher>,
    outbound: mpsc::UnboundedSender<SandboxMessage>,
) {
    let thread_outbound = outbound.clone();
    let spawned = std::thread::Builder::new()
        .name(format!("widget-script-{script_id}"))
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = thread_outbound.send(SandboxMessage::ScriptError {
                        script_id,
                        error: Some(format!("failed to create tokio runtime: {e}")),
                    });
                    return;
                }
            };

            let outcome = rt.block_on(run_script(&config, &code, fetcher));
            match outcome.into_message(script_id) {
                Some(msg) => {
                    let _ = thread_outbound.send(msg);
                }
                None => tracing::debug!(
                    target: "widget::sandbox::evaluator",
                    script_id,
                    "script never settled"
                ),
            }
        });

    if let Err(e) = spawned {
        let _ = outbound.send(SandboxMessage::ScriptError {
            script_id,
            error: Some(format!("failed to spawn script thread: {e}")),
        });
    }
}

async fn read_host<R>(
    config: WorkerConfig,
    mut reader: R,
    outbound: mpsc::UnboundedSender<SandboxMessage>,
    bridge: Arc<IpcFetchBridge>,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
{
    let fetcher: Arc<dyn FetchDispatcher> = bridge.clone();
    loop {
        let frame =
            read_message_with_limit::<Value, _>(&mut reader, config.max_ipc_message_size)
                .await
                .context("failed to read message from host")?;
        let Some(frame) = frame else {
            return Ok(());
        };

        match decode_frame::<HostMessage>(frame) {
            Some(HostMessage::ExecuteScript { script_id, code }) => {
                tracing::debug!(
                    target: "widget::sandbox::evaluator",
                    script_id,
                    code_len = code.len(),
                    "executing script"
                );
                spawn_script(
                    config.clone(),
                    script_id,
                    code,
                    fetcher.clone(),
                    outbound.clone(),
                );
            }
            Some(HostMessage::FetchResponse {
                request_id,
                body,
                status,
                error,
            }) => {
                let reply = match error {
                    Some(error) => Err(ProxyError::Transport(error)),
                    None => Ok(FetchReply {
                        body: body.unwrap_or_default(),
                        status: status.unwrap_or_default(),
                    }),
                };
                bridge.resolve(request_id, reply);
            }
            None => tracing::debug!(
                target: "widget::sandbox::evaluator",
                "ignoring host frame without a recognised type"
            ),
        }
    }
}

/// Serve the sandbox side of the protocol until the host closes its end.
///
/// Sends `sandboxReady` first, then answers every `executeScript` with at most
/// one `scriptResult` or `scriptError`.
pub async fn serve<R, W>(config: WorkerConfig, reader: R, mut writer: W) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    write_message(&mut writer, &SandboxMessage::SandboxReady)
        .await
        .context("failed to announce readiness")?;

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<SandboxMessage>();
    let bridge = Arc::new(IpcFetchBridge {
        outbound: outbound_tx.clone(),
        waiters: FetchWaiters::default(),
        next_id: AtomicU64::new(1),
    });

    let mut inbound = tokio::spawn(read_host(config, reader, outbound_tx, bridge));

    loop {
        tokio::select! {
            msg = outbound_rx.recv() => {
                let Some(msg) = msg else { break };
                write_message(&mut writer, &msg)
                    .await
                    .context("failed to write message to host")?;
            }
            done = &mut inbound => {
                return match done {
                    Ok(result) => result,
                    Err(e) => Err(anyhow::anyhow!("host reader task failed: {e}")),
                };
            }
        }
    }

    inbound.abort();
    Ok(())
}
