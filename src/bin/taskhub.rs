//! CLI binary for taskhub.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use taskhub::tasks::{DispatchOutcome, TaskOptions};
use taskhub::{HubConfig, Payload, RuntimeEvent, TaskHub};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// taskhub: scheduled and event-driven task automation.
#[derive(Parser)]
#[command(name = "taskhub", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Start the hub and run until Ctrl+C.
    Run,

    /// List discovered module templates.
    Modules,

    /// List task instances.
    Tasks,

    /// Create a task instance from a module template.
    Create {
        /// Module type of the template.
        module_type: String,
        /// Name of the new instance.
        name: String,
        /// Static input as `key=value` (value parsed as JSON, else string).
        #[arg(short, long = "input", value_parser = parse_pair)]
        inputs: Vec<(String, Value)>,
        /// Setting as `key=value` (value parsed as JSON, else string).
        #[arg(short, long = "setting", value_parser = parse_pair)]
        settings: Vec<(String, Value)>,
        /// Create the instance disabled.
        #[arg(long)]
        disabled: bool,
        /// Persist the instance state to `state.json`.
        #[arg(long)]
        persist_state: bool,
    },

    /// Delete a task instance and its directory.
    Delete {
        name: String,
    },

    /// Rename a task instance.
    Rename {
        old: String,
        new: String,
    },

    /// Enable a task instance.
    Enable {
        name: String,
    },

    /// Disable a task instance.
    Disable {
        name: String,
    },

    /// Run a task instance once in this process and wait for the outcome.
    Exec {
        name: String,
        /// Payload field as `key=value` (value parsed as JSON, else string).
        #[arg(short, long = "input", value_parser = parse_pair)]
        inputs: Vec<(String, Value)>,
        /// Seconds to wait for the run to finish.
        #[arg(long, default_value_t = 300)]
        timeout: u64,
    },

    /// Write the default configuration file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(HubConfig::default_config_path);

    match cli.command.unwrap_or(Command::Run) {
        Command::InitConfig { force } => init_config(&config_path, force),
        Command::Run => run(load_config(&config_path)?).await,
        command => manage(load_config(&config_path)?, command).await,
    }
}

/// Stderr plus a daily-rotated file under the logs directory.
fn init_tracing() -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("taskhub=info"));
    let stderr = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let logs = taskhub::hub_dirs::logs_dir();
    let (file, guard) = match std::fs::create_dir_all(&logs) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(&logs, "taskhub.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        Err(e) => {
            eprintln!("file logging disabled: cannot create {}: {e}", logs.display());
            (None, None)
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .init();
    guard
}

fn load_config(path: &std::path::Path) -> anyhow::Result<HubConfig> {
    HubConfig::load_or_default(path)
        .with_context(|| format!("loading config from {}", path.display()))
}

fn init_config(path: &std::path::Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    HubConfig::default().save_to_file(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

async fn run(config: HubConfig) -> anyhow::Result<()> {
    println!("taskhub v{}", env!("CARGO_PKG_VERSION"));
    let hub = TaskHub::start(config).await?;

    for (dir, reason) in &hub.discovery().skipped {
        println!("  skipped template {}: {reason}", dir.display());
    }
    for (dir, reason) in &hub.load_report().skipped {
        println!("  skipped task {}: {reason}", dir.display());
    }
    println!(
        "\n{} module(s), {} task(s). Press Ctrl+C to stop.\n",
        hub.discovery().loaded.len(),
        hub.tasks().names().len()
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl+C")?;
    info!("received Ctrl+C, shutting down...");
    hub.shutdown().await;
    Ok(())
}

/// Commands that work on the task tree without touching the broker.
async fn manage(mut config: HubConfig, command: Command) -> anyhow::Result<()> {
    config.task_defaults.autostart = false;
    let hub = TaskHub::offline(config).await?;
    let tasks = hub.tasks();

    let result = match command {
        Command::Modules => {
            for template in hub.modules().templates() {
                let manifest = &template.manifest;
                println!(
                    "{:<24} {:<10} {:<8} {}",
                    manifest.module_type,
                    manifest.trigger_kind(),
                    manifest.version,
                    manifest.description
                );
            }
            Ok(())
        }
        Command::Tasks => {
            for summary in tasks.list() {
                let next = tasks
                    .next_run(&summary.name)
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_default();
                println!(
                    "{:<24} {:<20} {:<10} {:<8} {}",
                    summary.name,
                    summary.module_type,
                    summary.status,
                    if summary.enabled { "enabled" } else { "disabled" },
                    next
                );
            }
            Ok(())
        }
        Command::Create {
            module_type,
            name,
            inputs,
            settings,
            disabled,
            persist_state,
        } => {
            let options = TaskOptions {
                enabled: disabled.then_some(false),
                persist_state,
                inputs: inputs.into_iter().collect(),
                settings: settings.into_iter().collect(),
                ..TaskOptions::default()
            };
            tasks
                .create(&module_type, &name, options)
                .map(|()| println!("Created {name} from {module_type}"))
                .map_err(anyhow::Error::from)
        }
        Command::Delete { name } => tasks
            .delete(&name)
            .map(|()| println!("Deleted {name}"))
            .map_err(anyhow::Error::from),
        Command::Rename { old, new } => tasks
            .rename(&old, &new)
            .map(|()| println!("Renamed {old} to {new}"))
            .map_err(anyhow::Error::from),
        Command::Enable { name } => tasks
            .update_config(&name, |config| config.enabled = true)
            .map(|_| println!("Enabled {name}"))
            .map_err(anyhow::Error::from),
        Command::Disable { name } => tasks
            .update_config(&name, |config| config.enabled = false)
            .map(|_| println!("Disabled {name}"))
            .map_err(anyhow::Error::from),
        Command::Exec {
            name,
            inputs,
            timeout,
        } => {
            let payload: Payload = inputs.into_iter().collect();
            exec_once(&hub, &name, &payload, Duration::from_secs(timeout)).await
        }
        Command::Run | Command::InitConfig { .. } => Ok(()),
    };

    hub.shutdown().await;
    result
}

async fn exec_once(
    hub: &TaskHub,
    name: &str,
    payload: &Payload,
    timeout: Duration,
) -> anyhow::Result<()> {
    let mut events = hub.subscribe_events();
    match hub.tasks().run_now(name, payload)? {
        DispatchOutcome::Rejected(reason) => anyhow::bail!("{name} was not run: {reason:?}"),
        DispatchOutcome::Started | DispatchOutcome::Queued { .. } => {}
    }

    let outcome = tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(RuntimeEvent::TaskLog {
                    task,
                    level,
                    message,
                }) if task == name => println!("[{level}] {message}"),
                Ok(RuntimeEvent::TaskSucceeded {
                    task,
                    attempt,
                    duration_ms,
                }) if task == name => {
                    println!("{name} succeeded on attempt {attempt} in {duration_ms} ms");
                    return Ok(());
                }
                Ok(RuntimeEvent::TaskFailed {
                    task,
                    attempts,
                    error,
                }) if task == name => {
                    anyhow::bail!("{name} failed after {attempts} attempt(s): {error}");
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => anyhow::bail!("event channel closed"),
            }
        }
    })
    .await;
    match outcome {
        Ok(result) => result,
        Err(_) => anyhow::bail!("{name} did not finish within {}s", timeout.as_secs()),
    }
}

fn parse_pair(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    if key.is_empty() {
        return Err(format!("empty key in `{raw}`"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_owned()));
    Ok((key.to_owned(), value))
}
