use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod cli;
mod config;

use cli::Cli;
use cli::commands::Commands;
use conduit::coordination::ReadinessGate;
use conduit::ConduitError;
use conduit::events::{ErrorReporter, Event, EventBus, EventKind};
use conduit::id;
use conduit::storage::{EventLog, LogLoss, LogReader, LossCallback};
use conduit::transport::ToolClient;
use config::Config;

fn setup_logging(level: &str) -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("conduit")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("conduit.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

/// Event plumbing for one CLI session: bus, workspace log and session id.
///
/// `ready` settles once the log is attached; no tool client is handed out
/// before that, so every transport event is audited.
struct Session {
    id: String,
    bus: EventBus,
    log: EventLog,
    ready: ReadinessGate,
}

impl Session {
    async fn start(workspace: &Path, config: &Config) -> Result<Self> {
        let ready = ReadinessGate::new();
        let reporter: ErrorReporter = Arc::new(|event: &Event, err: &ConduitError| {
            log::warn!("handler for {} failed: {}", event.kind, err);
        });
        let bus = EventBus::with_error_reporter(reporter);

        let on_loss: LossCallback = Arc::new(|loss: LogLoss| {
            log::warn!("event log lost {}: {}", loss.record, loss.error);
            eprintln!("{} {} ({})", "lost log record:".red(), loss.record, loss.error);
        });
        let log = EventLog::open_for_workspace(&bus, workspace, &config.event_log, on_loss)
            .context("Failed to open event log")?;

        let id = id::generate_session_id();
        bus.publish(EventKind::AppReady, id.clone(), serde_json::json!({"workspaceId": log.workspace_id()}))
            .await;
        bus.publish(EventKind::SessionStarted, id.clone(), serde_json::json!({})).await;
        info!("Session {} started in workspace {}", id, log.workspace_id());
        ready.mark_ready();

        Ok(Self { id, bus, log, ready })
    }

    async fn client(&self, name: &str, config: &Config) -> Result<ToolClient> {
        self.ready.wait().await.context("Session is not ready")?;
        let server = config.server(name)?.clone();
        Ok(ToolClient::new(name, server)
            .with_env_policy(config.env.policy())
            .with_timeouts(config.rpc.timeouts())
            .with_events(self.bus.clone(), self.id.clone()))
    }

    async fn finish(self) -> Result<()> {
        self.bus
            .publish(EventKind::SessionEnded, self.id.clone(), serde_json::json!({}))
            .await;
        self.log.dispose().await.context("Failed to flush event log")?;
        let stats = self.log.stats();
        info!("Session {} ended: {} records written, {} lost", self.id, stats.written, stats.lost);
        Ok(())
    }
}

async fn run_application(cli: &Cli, config: &Config) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        info!("Verbose mode enabled");
    }

    match &cli.command {
        Commands::Servers => handle_servers_command(config),
        Commands::Tools { server } => handle_tools_command(cli, server, config).await,
        Commands::Call { server, tool, args } => handle_call_command(cli, server, tool, args, config).await,
        Commands::Log { offset } => handle_log_command(cli, *offset, config),
    }
}

fn handle_servers_command(config: &Config) -> Result<()> {
    if config.servers.is_empty() {
        println!("{}", "No servers configured".yellow());
        return Ok(());
    }
    for (name, server) in &config.servers {
        println!("{:<20} {:<6} {}", name.green(), server.kind().cyan(), server.target());
    }
    Ok(())
}

async fn handle_tools_command(cli: &Cli, server: &str, config: &Config) -> Result<()> {
    let session = Session::start(&cli.workspace_dir(), config).await?;
    let client = session.client(server, config).await?;

    let outcome = client.list_tools().await;
    client.close().await;
    let finished = session.finish().await;

    let tools = outcome.context(format!("Failed to list tools on '{}'", server))?;
    println!("{} {} tools on {}", "Found".green(), tools.len(), server);
    for tool in &tools {
        match &tool.description {
            Some(description) => println!("  {:<24} {}", tool.name.cyan(), description),
            None => println!("  {}", tool.name.cyan()),
        }
    }
    finished
}

async fn handle_call_command(cli: &Cli, server: &str, tool: &str, args: &str, config: &Config) -> Result<()> {
    let arguments: Value = serde_json::from_str(args).context("--args must be a JSON value")?;

    let session = Session::start(&cli.workspace_dir(), config).await?;
    let client = session.client(server, config).await?;

    let outcome = client.call_tool(tool, arguments).await;
    client.close().await;
    let finished = session.finish().await;

    let output = outcome.context(format!("Call to '{}' on '{}' failed", tool, server))?;
    let label = if output.is_error { "Tool error".red() } else { "Result".green() };
    println!("{} ({}ms)", label, output.duration_ms);
    match output.text() {
        Some(text) => println!("{}", text),
        None => println!("{}", serde_json::to_string_pretty(&output.result)?),
    }
    finished
}

fn handle_log_command(cli: &Cli, offset: u64, config: &Config) -> Result<()> {
    let workspace_id = id::workspace_id(cli.workspace_dir());
    let path = config.event_log.path_for(&workspace_id);
    info!("Reading event log {} from offset {}", path.display(), offset);

    let mut reader = LogReader::at_offset(&path, offset);
    let batch = reader.read_available().context(format!("Failed to read {}", path.display()))?;

    let mut current_session: Option<String> = None;
    for record in &batch.records {
        if current_session.as_deref() != Some(record.session_id.as_str()) {
            let started = id::session_timestamp(&record.session_id)
                .map(id::format_ms)
                .unwrap_or_default();
            println!("{} {} {}", "session".bold(), record.session_id, started.dimmed());
            current_session = Some(record.session_id.clone());
        }
        if record.duration_ms > 0 {
            println!("  {:<24} {}ms", record.kind.cyan(), record.duration_ms);
        } else {
            println!("  {}", record.kind.cyan());
        }
    }

    println!(
        "{} {} records, next offset {}",
        "Read".green(),
        batch.records.len(),
        batch.next_offset
    );
    if batch.skipped > 0 {
        println!("{} {} malformed lines skipped", "Warning:".yellow(), batch.skipped);
    }
    if batch.truncated_tail {
        println!("{} incomplete trailing record discarded", "Warning:".yellow());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    // Setup logging
    let level = if cli.is_verbose() {
        "debug"
    } else {
        config.log_level.as_deref().unwrap_or("info")
    };
    setup_logging(level).context("Failed to setup logging")?;

    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    run_application(&cli, &config).await.context("Application failed")?;

    Ok(())
}
