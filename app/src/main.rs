mod config;
mod desktop;
mod probe_ipc;
mod probe_process;

use std::collections::BTreeSet;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wa_sender_core::import::{self, ColumnMapping, RecordIndexGenerator, Row};
use wa_sender_core::notify::{DiagnosticsReporter, FanoutReporter, LogReporter, StatusEvent, StatusReporter};
use wa_sender_core::reminder::ReminderService;
use wa_sender_core::settings::{load_settings, update_settings};
use wa_sender_core::{
    diagnostics, open_store, template, CoreError, DocumentStore, MessageQueueStore, SendOrchestrator, SendRun,
    VerificationRegistry, VerificationRun,
};

use crate::config::{AppConfig, CONFIG_FILE};
use crate::desktop::DesktopAutomation;
use crate::probe_process::PythonProbe;

#[derive(Parser)]
#[command(name = "wa-sender", version, about = "Queue and send templated WhatsApp messages")]
struct Cli {
    /// Directory holding the queue database and logs
    #[arg(long, env = "WA_SENDER_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Path to config.toml (defaults to <data-dir>/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import rows from a JSON array of objects
    Import {
        rows: PathBuf,
        /// JSON object mapping placeholder names to column headers
        #[arg(long)]
        mapping: Option<PathBuf>,
    },
    /// List queued messages in processing order
    Queue,
    /// List filed messages
    History,
    /// Postpone a queued message
    Snooze { record_index: i64, minutes: u32 },
    /// Remove a queued message
    Delete { record_index: i64 },
    ClearQueue,
    ClearHistory,
    /// Queue numbers for verification
    AddNumber {
        #[arg(required = true)]
        numbers: Vec<String>,
    },
    /// Remove a verification entry by position
    RemoveNumber { index: usize },
    ClearNumbers,
    /// Run the verification queue
    Verify,
    /// List verification entries
    Numbers,
    /// Print verified numbers with their OCR text
    ExportVerified,
    /// Send every eligible message
    Send,
    /// Show or change settings
    Settings {
        #[arg(long)]
        template: Option<String>,
        #[arg(long)]
        minutes: Option<u32>,
        #[arg(long)]
        seconds: Option<u32>,
        #[arg(long)]
        notifications: Option<bool>,
    },
    /// Remind about waiting messages on the configured interval
    Remind {
        /// Check once and exit
        #[arg(long)]
        once: bool,
    },
    /// Print recent diagnostic events
    Diagnostics {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

struct App {
    config: AppConfig,
    store: Arc<dyn DocumentStore>,
    queue: Arc<MessageQueueStore>,
    registry: Arc<VerificationRegistry>,
    reporter: Arc<dyn StatusReporter>,
}

impl App {
    fn open(config: AppConfig) -> Result<Self, CoreError> {
        let store: Arc<dyn DocumentStore> = Arc::new(open_store(config.store_path())?);
        let reporter: Arc<dyn StatusReporter> = Arc::new(
            FanoutReporter::new()
                .with(Arc::new(LogReporter))
                .with(Arc::new(DiagnosticsReporter::new(config.log_dir()))),
        );
        let queue = Arc::new(MessageQueueStore::new(store.clone()));
        let registry = Arc::new(VerificationRegistry::load(
            store.clone(),
            reporter.clone(),
            config.verification,
        )?);

        let recovered = queue.recover_interrupted()?;
        let reset = registry.recover_interrupted()?;
        if recovered.reset_to_pending + recovered.moved_to_history + reset > 0 {
            info!(
                pending = recovered.reset_to_pending,
                filed = recovered.moved_to_history,
                numbers = reset,
                "recovered interrupted work"
            );
        }
        Ok(Self { config, store, queue, registry, reporter })
    }

    fn probe(&self, timeout: std::time::Duration) -> Arc<PythonProbe> {
        Arc::new(PythonProbe::new(
            self.config.python.clone(),
            self.config.verifier_script.clone(),
            timeout,
            Some(self.config.log_dir()),
        ))
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CoreError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, CoreError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| CoreError::InvalidArgument(format!("read {}: {}", path.display(), e)))?;
    Ok(serde_json::from_str(&raw)?)
}

fn headers(rows: &[Row]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for row in rows {
        for key in row.keys() {
            if seen.insert(key.clone()) {
                out.push(key.clone());
            }
        }
    }
    out
}

/// Runs `work` until it finishes or Ctrl-C arrives. On Ctrl-C `cancel` is
/// called and `work` is still driven to completion.
async fn until_interrupted<F, T>(work: F, cancel: impl Fn()) -> T
where
    F: Future<Output = T>,
{
    tokio::pin!(work);
    tokio::select! {
        out = &mut work => return out,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupt received, stopping after the current step");
            cancel();
        }
    }
    work.await
}

async fn run_import(app: &App, rows_path: &Path, mapping_path: Option<&Path>) -> Result<(), CoreError> {
    let rows: Vec<Row> = read_json(rows_path)?;
    let settings = load_settings(app.store.as_ref())?;
    let mapping: ColumnMapping = match mapping_path {
        Some(path) => read_json(path)?,
        None => {
            let placeholders = template::extract_placeholders(&settings.message_template);
            import::suggest_mapping(&placeholders, &headers(&rows))
        }
    };
    let missing = import::missing_mappings(&settings.message_template, &mapping);
    if missing.iter().any(|name| name == import::PHONE_PLACEHOLDER) {
        return Err(CoreError::InvalidArgument("no column mapped to phone_number".to_string()));
    }
    if !missing.is_empty() {
        warn!("unmapped placeholders stay literal: {}", missing.join(", "));
    }

    let ids = RecordIndexGenerator::new();
    let summary = import::import_rows_with_progress(&rows, &mapping, &app.queue, &app.registry, &ids, |step| {
        eprintln!("{}", step);
    })?;
    app.reporter.report(StatusEvent::ImportCompleted(summary.clone()));
    print_json(&summary)
}

async fn run_verify(app: &App) -> Result<(), CoreError> {
    let probe = app.probe(app.config.verification.probe_timeout());
    let run = until_interrupted(app.registry.process_queue(probe.as_ref()), || app.registry.cancel()).await?;
    match run {
        VerificationRun::AlreadyRunning => eprintln!("verification already running"),
        VerificationRun::Finished(summary) => println!(
            "verified={} not_verified={} errors={} cancelled={}",
            summary.verified, summary.not_verified, summary.errors, summary.cancelled
        ),
    }
    Ok(())
}

async fn run_send(app: &App) -> Result<(), CoreError> {
    let probe = app.probe(app.config.send.probe_timeout());
    let automation = Arc::new(DesktopAutomation::new(&app.config, probe));
    let orchestrator = SendOrchestrator::new(
        app.store.clone(),
        app.queue.clone(),
        app.registry.clone(),
        automation,
        app.reporter.clone(),
        app.config.send,
    );
    let run = until_interrupted(orchestrator.process_queue_messages(), || orchestrator.cancel()).await?;
    match run {
        SendRun::AlreadyRunning => eprintln!("send already running"),
        SendRun::NoTemplate => {
            return Err(CoreError::InvalidArgument(
                "no message template; set one with `settings --template`".to_string(),
            ))
        }
        SendRun::Finished(summary) => println!(
            "committed={} unverified={} failed={} attempted={} skipped={} cancelled={}",
            summary.committed,
            summary.unverified,
            summary.failed,
            summary.attempted,
            summary.skipped,
            summary.cancelled
        ),
    }
    Ok(())
}

async fn run_remind(app: &App, once: bool) -> Result<(), CoreError> {
    let service = ReminderService::new(app.store.clone(), app.queue.clone(), app.reporter.clone());
    if once {
        match service.check_once()? {
            Some(message) => println!("next: {} ({})", message.display_name(), message.record_index),
            None => println!("nothing waiting"),
        }
        return Ok(());
    }
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(true);
        }
    });
    service.run(rx).await;
    Ok(())
}

async fn dispatch(app: &App, command: Commands) -> Result<(), CoreError> {
    match command {
        Commands::Import { rows, mapping } => run_import(app, &rows, mapping.as_deref()).await,
        Commands::Queue => print_json(&app.queue.ordered(Utc::now())),
        Commands::History => print_json(&app.queue.history()),
        Commands::Snooze { record_index, minutes } => {
            if !app.queue.snooze(record_index, minutes)? {
                eprintln!("no queued message {}", record_index);
            }
            Ok(())
        }
        Commands::Delete { record_index } => {
            if !app.queue.delete(record_index)? {
                eprintln!("no queued message {}", record_index);
            }
            Ok(())
        }
        Commands::ClearQueue => {
            println!("removed {}", app.queue.clear_queue()?);
            Ok(())
        }
        Commands::ClearHistory => {
            println!("removed {}", app.queue.clear_history()?);
            Ok(())
        }
        Commands::AddNumber { numbers } => print_json(&app.registry.add_bulk(numbers.as_slice())?),
        Commands::RemoveNumber { index } => {
            if !app.registry.remove(index)? {
                eprintln!("no verification entry at {}", index);
            }
            Ok(())
        }
        Commands::ClearNumbers => {
            println!("removed {}", app.registry.clear()?);
            Ok(())
        }
        Commands::Verify => run_verify(app).await,
        Commands::Numbers => print_json(&app.registry.items()),
        Commands::ExportVerified => print_json(&app.registry.verified_export()),
        Commands::Send => run_send(app).await,
        Commands::Settings { template, minutes, seconds, notifications } => {
            let settings = update_settings(app.store.as_ref(), |s| {
                if let Some(text) = template {
                    s.message_template = text;
                }
                if let Some(m) = minutes {
                    s.notification_minutes = m;
                }
                if let Some(sec) = seconds {
                    s.notification_seconds = sec;
                }
                if let Some(on) = notifications {
                    s.notifications_enabled = on;
                }
            })?;
            print_json(&settings)
        }
        Commands::Remind { once } => run_remind(app, once).await,
        Commands::Diagnostics { limit } => {
            let events = diagnostics::read_recent(&app.config.log_dir(), limit)
                .map_err(|e| CoreError::Persistence(e.to_string()))?;
            print_json(&events)
        }
    }
}

fn load_config(cli: &Cli) -> Result<AppConfig, CoreError> {
    let base = cli
        .data_dir
        .clone()
        .unwrap_or_else(|| AppConfig::default().data_dir);
    let path = cli.config.clone().unwrap_or_else(|| base.join(CONFIG_FILE));
    let mut config = AppConfig::load(&path)?;
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}", err);
            return ExitCode::FAILURE;
        }
    };
    let log_dir = config.log_dir();
    let result = match App::open(config) {
        Ok(app) => dispatch(&app, cli.command).await,
        Err(err) => Err(err),
    }
    .map_err(|e| e.to_string());

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if let Err(log_err) = diagnostics::log_event(&log_dir, "command_error", &err) {
                warn!("diagnostics log write failed: {}", log_err);
            }
            eprintln!("{}", err);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serde_json::json;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn headers_keep_first_seen_order_without_repeats() {
        let rows: Vec<Row> = serde_json::from_value(json!([
            {"Phone": "1", "Name": "a"},
            {"Amount": "5", "Name": "b"}
        ]))
        .expect("rows");
        assert_eq!(headers(&rows), vec!["Name", "Phone", "Amount"]);
    }

    #[tokio::test]
    async fn finished_work_returns_without_cancelling() {
        let cancelled = std::cell::Cell::new(false);
        let out = until_interrupted(async { 7 }, || cancelled.set(true)).await;
        assert_eq!(out, 7);
        assert!(!cancelled.get());
    }
}
