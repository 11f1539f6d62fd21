//! deno_core op definitions for the widget evaluator.
//!
//! The `#[op2]` macro generates additional public items (v8 function pointers,
//! metadata structs) that cannot carry doc comments.
#![allow(missing_docs)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use deno_core::op2;
use deno_core::OpState;
use deno_error::JsErrorBox;

use crate::ipc::FetchOptions;
use crate::FetchDispatcher;

/// Settlement envelope stored in OpState once the user function finishes.
///
/// Holds `{"ok": <value>}` or `{"error": <message>}` as JSON text.
pub struct ScriptSettled(pub String);

/// Log a message from sandbox code (`console.log` and friends).
#[op2(fast)]
pub fn op_widget_log(#[string] msg: &str) {
    tracing::debug!(target: "widget::sandbox::js", "{}", msg);
}

/// Record how the user function settled.
#[op2(fast)]
pub fn op_widget_settle(state: &mut OpState, #[string] json: &str) {
    state.put(ScriptSettled(json.to_string()));
}

/// Perform `fetchData(url, options)` through the [`FetchDispatcher`] in OpState.
///
/// Resolves to the response body whatever the HTTP status. Rejects with the
/// proxy's error text when no response could be obtained.
#[op2(async)]
#[string]
pub async fn op_widget_fetch(
    op_state: Rc<RefCell<OpState>>,
    #[string] url: String,
    #[string] options_json: String,
) -> Result<String, JsErrorBox> {
    let options: FetchOptions = serde_json::from_str(&options_json)
        .map_err(|e| JsErrorBox::generic(format!("invalid fetch options: {e}")))?;

    let dispatcher = {
        let st = op_state.borrow();
        st.borrow::<Arc<dyn FetchDispatcher>>().clone()
    };

    tracing::debug!(target: "widget::sandbox::js", url = %url, "fetchData dispatched");

    let reply = dispatcher
        .fetch(&url, options)
        .await
        .map_err(|e| JsErrorBox::generic(e.to_string()))?;

    Ok(reply.body)
}

deno_core::extension!(
    widget_ext,
    ops = [op_widget_log, op_widget_settle, op_widget_fetch],
);
