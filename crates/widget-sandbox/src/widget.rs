//! Quick-link widgets whose displayed value comes from a user script.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::bridge::SandboxBridge;
use crate::error::SandboxError;
use crate::result::{ScriptResult, PLACEHOLDER_VALUE};

/// A persisted quick-link tile with an attached script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "widget", rename_all = "camelCase")]
pub struct QuickLinkWidget {
    /// Display name, also the cache key.
    pub name: String,
    /// Body of the async function that produces the value. Opaque to the host.
    #[serde(default)]
    pub script: String,
    /// Icon or emoji shown next to the value.
    #[serde(default)]
    pub icon: String,
    /// Link opened when the tile is activated.
    #[serde(default)]
    pub url: String,
    /// Refresh period for callers that re-run the widget; `0` means never.
    #[serde(default, rename = "refreshIntervalSeconds", alias = "refreshInterval")]
    pub refresh_interval_secs: u64,
    /// Last successful value, if one was ever cached.
    #[serde(default)]
    pub last_result: Option<String>,
}

/// What a widget tile shows after a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WidgetView {
    /// Widget name.
    pub name: String,
    /// Widget icon.
    pub icon: String,
    /// The value to render.
    pub display_value: String,
    /// CSS color hint from the script, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// `name | label | Error: message`, with absent parts left out.
    pub tooltip: String,
    /// Why the last run failed, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WidgetView {
    /// Derive the view from a run outcome and the previously shown result.
    ///
    /// `outcome` is `None` when the widget was not run at all. A failed or
    /// skipped run keeps showing `previous`, label and color included.
    pub fn build(
        widget: &QuickLinkWidget,
        outcome: Option<Result<&ScriptResult, &SandboxError>>,
        previous: Option<&ScriptResult>,
    ) -> Self {
        let error = outcome.and_then(|o| o.err()).map(|e| e.to_string());
        let shown = outcome.and_then(|o| o.ok()).or(previous);

        let display_value = shown
            .map(|r| r.value.clone())
            .unwrap_or_else(|| PLACEHOLDER_VALUE.to_string());

        let tooltip = [
            Some(widget.name.clone()),
            shown.and_then(|r| r.label.clone()),
            error.as_ref().map(|e| format!("Error: {e}")),
        ]
        .into_iter()
        .flatten()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" | ");

        Self {
            name: widget.name.clone(),
            icon: widget.icon.clone(),
            display_value,
            color: shown.and_then(|r| r.color.clone()),
            tooltip,
            error,
        }
    }
}

/// The single last-result slot kept per widget.
pub trait ResultCache: Send + Sync {
    /// The cached value for `widget`, if any.
    fn last_result(&self, widget: &str) -> Option<String>;

    /// Replace the cached value for `widget`.
    fn store(&self, widget: &str, value: &str) -> std::io::Result<()>;
}

/// A [`ResultCache`] that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryCache {
    values: Mutex<HashMap<String, String>>,
}

impl ResultCache for MemoryCache {
    fn last_result(&self, widget: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(widget)
            .cloned()
    }

    fn store(&self, widget: &str, value: &str) -> std::io::Result<()> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(widget.to_string(), value.to_string());
        Ok(())
    }
}

/// Runs widget scripts through a shared [`SandboxBridge`].
pub struct WidgetRunner {
    bridge: Arc<SandboxBridge>,
    cache: Arc<dyn ResultCache>,
    // Full last result per widget for this process; the cache keeps only the value.
    shown: Mutex<HashMap<String, ScriptResult>>,
}

impl WidgetRunner {
    /// Create a runner.
    pub fn new(bridge: Arc<SandboxBridge>, cache: Arc<dyn ResultCache>) -> Self {
        Self {
            bridge,
            cache,
            shown: Mutex::new(HashMap::new()),
        }
    }

    fn previous(&self, widget: &QuickLinkWidget) -> Option<ScriptResult> {
        let shown = self
            .shown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&widget.name)
            .cloned();
        shown.or_else(|| {
            self.cache
                .last_result(&widget.name)
                .or_else(|| widget.last_result.clone())
                .map(|value| ScriptResult {
                    value,
                    label: None,
                    color: None,
                })
        })
    }

    /// Run `widget` once and return what its tile should show.
    ///
    /// A widget without a script is not run. Failures are reported in the
    /// view and never retried.
    pub async fn run(&self, widget: &QuickLinkWidget) -> WidgetView {
        let previous = self.previous(widget);

        if widget.script.is_empty() {
            return WidgetView::build(widget, None, previous.as_ref());
        }

        let outcome = match self.bridge.init_sandbox().await {
            Ok(()) => self.bridge.execute_script(&widget.script).await,
            Err(e) => Err(e),
        };

        match &outcome {
            Ok(result) => {
                self.shown
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(widget.name.clone(), result.clone());
                if let Err(e) = self.cache.store(&widget.name, &result.value) {
                    tracing::warn!(
                        target: "widget::sandbox::widget",
                        widget = %widget.name,
                        error = %e,
                        "failed to cache widget result"
                    );
                }
            }
            Err(e) => tracing::info!(
                target: "widget::sandbox::widget",
                widget = %widget.name,
                error = %e,
                "widget script failed"
            ),
        }

        WidgetView::build(widget, Some(outcome.as_ref()), previous.as_ref())
    }
}
