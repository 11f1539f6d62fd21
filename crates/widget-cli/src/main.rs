#![warn(missing_docs)]

//! widgets: run quick-link widget scripts in an isolated sandbox.
//!
//! Scripts never run in this process: they are evaluated by `widget-worker`
//! (or an in-process evaluator thread) and can reach the network only through
//! the host's `fetchData` proxy.

mod cache;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;
use widget_config::{ExecutionMode, SandboxOverrides, WidgetEntry, WidgetsConfig};
use widget_sandbox::widget::{QuickLinkWidget, WidgetRunner, WidgetView};
use widget_sandbox::{
    BridgeConfig, ChildProcessLauncher, HttpFetcher, InProcessLauncher, SandboxBridge,
    SandboxLauncher, WorkerConfig,
};

use crate::cache::JsonFileCache;

#[derive(Debug, Parser)]
#[command(name = "widgets", version, about = "Run quick-link widget scripts in an isolated sandbox")]
struct Cli {
    /// Config file (defaults to $WIDGET_CONFIG, then ./widgets.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// File holding the last successful value of each widget.
    #[arg(long, global = true, default_value = "widget-cache.json")]
    cache: PathBuf,

    /// Override the configured execution mode.
    #[arg(long, global = true, value_enum)]
    mode: Option<ModeArg>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one script and print its sanitized result as JSON.
    Run {
        /// Script file, or `-` to read from stdin.
        file: PathBuf,
    },
    /// Run every configured widget once.
    List,
    /// Re-run widgets on their refresh intervals until Ctrl-C.
    Watch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    ChildProcess,
    InProcess,
}

impl From<ModeArg> for ExecutionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::ChildProcess => ExecutionMode::ChildProcess,
            ModeArg::InProcess => ExecutionMode::InProcess,
        }
    }
}

/// Build the bridge and worker configs from config overrides.
fn build_sandbox_config(overrides: &SandboxOverrides) -> (BridgeConfig, WorkerConfig) {
    let mut bridge = BridgeConfig::default();
    let mut worker = WorkerConfig::default();
    if let Some(timeout) = overrides.timeout_secs {
        bridge.timeout = Duration::from_secs(timeout);
    }
    if let Some(timeout) = overrides.startup_timeout_secs {
        bridge.startup_timeout = Duration::from_secs(timeout);
    }
    if let Some(kb) = overrides.max_code_kb {
        bridge.max_code_size = kb * 1024;
    }
    if let Some(mb) = overrides.max_ipc_message_size_mb {
        bridge.max_ipc_message_size = mb * 1024 * 1024;
        worker.max_ipc_message_size = mb * 1024 * 1024;
    }
    if let Some(mb) = overrides.max_heap_mb {
        worker.max_heap_size = mb * 1024 * 1024;
    }
    // The worker gives up shortly after the host has.
    worker.watchdog_ms = bridge.timeout.as_millis() as u64 + 2_000;
    (bridge, worker)
}

fn build_bridge(overrides: &SandboxOverrides, mode: ExecutionMode) -> SandboxBridge {
    let (bridge_config, worker_config) = build_sandbox_config(overrides);
    let launcher: Arc<dyn SandboxLauncher> = match mode {
        ExecutionMode::ChildProcess => Arc::new(ChildProcessLauncher::new(worker_config)),
        ExecutionMode::InProcess => Arc::new(InProcessLauncher::new(worker_config)),
    };
    tracing::debug!(?mode, timeout = ?bridge_config.timeout, "sandbox configured");
    SandboxBridge::new(bridge_config, launcher, Arc::new(HttpFetcher::new()))
}

fn to_widget(entry: &WidgetEntry) -> QuickLinkWidget {
    QuickLinkWidget {
        name: entry.name.clone(),
        script: entry.script.clone(),
        icon: entry.icon.clone(),
        url: entry.url.clone(),
        refresh_interval_secs: entry.refresh_interval_secs,
        last_result: None,
    }
}

fn format_view(view: &WidgetView) -> String {
    let mut line = String::new();
    if !view.icon.is_empty() {
        line.push_str(&view.icon);
        line.push(' ');
    }
    line.push_str(&view.name);
    line.push_str(": ");
    line.push_str(&view.display_value);
    if let Some(error) = &view.error {
        line.push_str(&format!("  [error: {error}]"));
    }
    line
}

fn load_config(explicit: Option<&Path>) -> Result<WidgetsConfig> {
    match WidgetsConfig::locate(explicit) {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            WidgetsConfig::from_file_with_env(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))
        }
        None => {
            tracing::info!("no config file found, using defaults");
            Ok(WidgetsConfig::default())
        }
    }
}

async fn read_script(file: &Path) -> Result<String> {
    if file == Path::new("-") {
        let mut code = String::new();
        tokio::io::stdin()
            .read_to_string(&mut code)
            .await
            .context("failed to read script from stdin")?;
        Ok(code)
    } else {
        tokio::fs::read_to_string(file)
            .await
            .with_context(|| format!("failed to read script {}", file.display()))
    }
}

async fn run_once(bridge: &SandboxBridge, file: &Path) -> Result<()> {
    let code = read_script(file).await?;
    let result = bridge.execute_script(&code).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn list(runner: Arc<WidgetRunner>, widgets: Vec<QuickLinkWidget>) -> Result<()> {
    // Widgets are independent; run them side by side and print in config order.
    let handles: Vec<_> = widgets
        .into_iter()
        .map(|widget| {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run(&widget).await })
        })
        .collect();

    for handle in handles {
        let view = handle.await.context("widget task failed")?;
        println!("{}", format_view(&view));
    }
    Ok(())
}

async fn watch(runner: Arc<WidgetRunner>, widgets: Vec<QuickLinkWidget>) -> Result<()> {
    let mut tasks = tokio::task::JoinSet::new();
    for widget in widgets {
        let runner = runner.clone();
        tasks.spawn(async move {
            let period = widget.refresh_interval_secs;
            if period == 0 {
                println!("{}", format_view(&runner.run(&widget).await));
                return;
            }
            let mut interval = tokio::time::interval(Duration::from_secs(period));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                println!("{}", format_view(&runner.run(&widget).await));
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("stopping");
    tasks.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.as_deref())?;
    let mode = cli
        .mode
        .map(ExecutionMode::from)
        .or(config.sandbox.execution_mode)
        .unwrap_or_default();
    let bridge = Arc::new(build_bridge(&config.sandbox, mode));

    let outcome = match &cli.command {
        Command::Run { file } => run_once(&bridge, file).await,
        Command::List | Command::Watch => {
            let cache = Arc::new(JsonFileCache::open(&cli.cache));
            let runner = Arc::new(WidgetRunner::new(bridge.clone(), cache));
            let widgets: Vec<_> = config.widgets.iter().map(to_widget).collect();
            if widgets.is_empty() {
                tracing::warn!("no widgets configured");
            }
            if matches!(cli.command, Command::List) {
                list(runner, widgets).await
            } else {
                watch(runner, widgets).await
            }
        }
    };

    bridge.destroy_sandbox();
    outcome
}
