// orchestrator-service-rs/src/main.rs
// Main Entry Point for the dispatch CLI
// Wires config, history, oracles, executor and the remote channel together

use std::path::{Path, PathBuf};
use std::sync::Arc;

use action_ledger::{HistoryLedger, HistorySink};
use anyhow::{bail, Context};
use clap::Parser;
use config_rs::DispatchConfig;
use executor::{ShellSpec, SupervisedExecutor};
use llm_service::{LlmClient, LlmCodeGenerator, TextOracle};
use orchestrator::cli::{self, CliCommand, LineReader, TerminalConfirmer};
use orchestrator::status::labels;
use orchestrator::{
    Dispatcher, ListenerSummary, NullStatusSink, RealtimeDbRemote, RemoteListener,
    RequestCorrelator, Session, StatusSink,
};
use reflection::ResultAnalyzer;
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "dispatch-cli", version, about = "Natural-language command dispatch")]
struct Args {
    /// TOML configuration file.
    #[arg(long, env = "DISPATCH_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Never connect to the remote store, even if it is configured.
    #[arg(long)]
    local_only: bool,

    /// Run one request and exit.
    #[arg(long, conflicts_with = "listen_only")]
    request: Option<String>,

    /// Serve remote commands only, without the interactive prompt.
    #[arg(long, conflicts_with = "local_only")]
    listen_only: bool,

    /// Directory `export` writes session files to.
    #[arg(long, default_value = ".")]
    export_dir: PathBuf,
}

fn extra(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

struct App {
    dispatcher: Arc<Dispatcher>,
    remote: Option<Arc<RealtimeDbRemote>>,
    listener: Option<JoinHandle<ListenerSummary>>,
    shutdown: watch::Sender<bool>,
    model: String,
    export_dir: PathBuf,
}

impl App {
    fn session(&self) -> &Session {
        self.dispatcher.session()
    }

    fn listener_active(&self) -> bool {
        self.listener
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    async fn publish(&self, status: &str, extra: Map<String, Value>) {
        self.dispatcher.publish(status, extra).await;
    }

    async fn run_request(&self, input: &LineReader, request: &str) {
        println!("\nProcessing: {}", request);
        let confirmer = TerminalConfirmer::new(input);
        match self.dispatcher.dispatch_local(request, &confirmer).await {
            Ok(record) => println!("{}", cli::render_outcome(&record, self.session().device_id())),
            Err(err) => {
                error!(error = %err, "local request failed");
                println!("Error: {}", err);
                self.publish(labels::ERROR, extra(&[("error_message", json!(err.to_string()))]))
                    .await;
            }
        }
    }

    async fn show_remote(&self) {
        let session = self.session();
        println!("\nDevice ID: {}", session.device_id());
        println!("Remote Configured: {}", if self.remote.is_some() { "Yes" } else { "No" });
        println!(
            "Command Listener: {}",
            if self.listener_active() { "Active" } else { "Inactive" }
        );
        if let Some(remote) = &self.remote {
            match remote.ping().await {
                Ok(()) => println!("Remote Test: SUCCESS"),
                Err(err) => println!("Remote Test: FAILED - {}", err),
            }
        }
    }

    /// Returns false when the operator asked to quit.
    async fn handle(&self, input: &LineReader, line: &str) -> bool {
        let session = self.session();
        match CliCommand::parse(line) {
            CliCommand::Empty => {}
            CliCommand::Quit => {
                println!("Goodbye.");
                self.publish(labels::OFFLINE, extra(&[("message", json!("Device going offline"))]))
                    .await;
                return false;
            }
            CliCommand::Help => println!("{}", cli::render_help(session.device_id())),
            CliCommand::History => println!("{}", cli::render_history(&session.recent_commands(10))),
            CliCommand::Safety(None) => println!(
                "Safety mode: {}",
                if session.safety_mode() { "ENABLED" } else { "DISABLED" }
            ),
            CliCommand::Safety(Some(enabled)) => {
                session.set_safety_mode(enabled);
                println!("Safety mode: {}", if enabled { "ENABLED" } else { "DISABLED" });
                self.publish(labels::CONFIG_CHANGED, extra(&[("safety_mode", json!(enabled))]))
                    .await;
            }
            CliCommand::Timeout(None) => {
                println!("Current timeout: {}s", session.timeout_seconds())
            }
            CliCommand::Timeout(Some(secs)) => {
                if session.set_timeout_seconds(secs) {
                    println!("Timeout set to: {}s", secs);
                    self.publish(labels::CONFIG_CHANGED, extra(&[("timeout_seconds", json!(secs))]))
                        .await;
                }
            }
            CliCommand::InvalidTimeout(value) => {
                println!("Invalid timeout value {:?}. Please use a positive number.", value)
            }
            CliCommand::Stats => println!(
                "{}",
                cli::render_stats(
                    &session.stats(),
                    &self.model,
                    self.remote.is_some(),
                    self.listener_active()
                )
            ),
            CliCommand::Export => match session.export_to(
                &self.export_dir,
                &self.model,
                self.remote.is_some(),
                self.listener_active(),
            ) {
                Ok(path) => println!("Session data exported to: {}", path.display()),
                Err(err) => println!("Export failed: {}", err),
            },
            CliCommand::Clear => {
                print!("\x1B[2J\x1B[1;1H");
                println!("Ready. Device ID: {}", session.device_id());
            }
            CliCommand::Remote => self.show_remote().await,
            CliCommand::Request(request) => self.run_request(input, &request).await,
        }
        true
    }

    async fn repl(&self) {
        let input = LineReader::stdin();
        let session = self.session();
        println!("Command dispatch ready");
        println!("Device ID: {}", session.device_id());
        println!("Model: {}", self.model);
        println!("Safety: {}", if session.safety_mode() { "ON" } else { "OFF" });
        println!("Timeout: {}s", session.timeout_seconds());
        println!(
            "Remote: {}",
            if self.remote.is_some() { "Connected" } else { "Disconnected" }
        );
        println!("Type 'help' for commands or 'quit' to exit.");

        let prompt = format!("\nDISPATCH[{}] > ", session.device_id());
        loop {
            let line = tokio::select! {
                line = input.prompt(&prompt) => line,
                _ = tokio::signal::ctrl_c() => {
                    println!("\nTerminated by user");
                    self.publish(labels::OFFLINE, extra(&[("message", json!("Device terminated by user"))]))
                        .await;
                    break;
                }
            };

            match line {
                Ok(Some(line)) => {
                    if !self.handle(&input, &line).await {
                        break;
                    }
                }
                Ok(None) => {
                    self.publish(labels::OFFLINE, extra(&[("message", json!("Device going offline"))]))
                        .await;
                    break;
                }
                Err(err) => {
                    error!(error = %err, "critical error in interactive mode");
                    println!("Critical error: {}", err);
                    self.publish(labels::ERROR, extra(&[("error_message", json!(err.to_string()))]))
                        .await;
                    break;
                }
            }
        }
    }

    async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.listener {
            match handle.await {
                Ok(summary) => info!(
                    completed = summary.completed,
                    rejected = summary.rejected,
                    "remote listener drained"
                ),
                Err(err) => warn!(error = %err, "remote listener task failed"),
            }
        }
    }
}

fn open_history(path: &Path) -> anyhow::Result<Arc<dyn HistorySink>> {
    let ledger = HistoryLedger::open(path)
        .with_context(|| format!("opening history ledger {}", path.display()))?;
    Ok(Arc::new(ledger))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = DispatchConfig::load_with_path(args.config.as_deref())
        .context("loading configuration")?;
    let _log_guard = orchestrator::logging::init_logging(&config.logging)?;

    let shell = ShellSpec::from_name(&config.executor.shell)
        .with_context(|| format!("unknown executor.shell {:?}", config.executor.shell))?;
    let runner = SupervisedExecutor::new(shell.clone()).with_poll_interval(
        std::time::Duration::from_millis(config.executor.poll_interval_ms),
    );

    let client = LlmClient::from_settings(&config.llm)
        .context("LLM client could not be configured (is LLM_API_KEY set?)")?;
    let model = client.model().to_string();
    let oracle: Arc<dyn TextOracle> = Arc::new(client);
    let generator = Arc::new(LlmCodeGenerator::new(oracle.clone(), shell.name()));
    let analyzer = ResultAnalyzer::new(oracle);

    let session = Arc::new(Session::new(
        config.device.id.clone(),
        config.session.safety_mode,
        config.session.timeout_seconds,
    ));

    let remote = if config.remote.enabled && !args.local_only {
        Some(Arc::new(RealtimeDbRemote::from_settings(
            &config.remote,
            session.device_id(),
        )?))
    } else {
        None
    };
    if args.listen_only && remote.is_none() {
        bail!("--listen-only needs remote.enabled and remote.database_url");
    }

    let status: Arc<dyn StatusSink> = match &remote {
        Some(remote) => remote.clone() as Arc<dyn StatusSink>,
        None => Arc::new(NullStatusSink),
    };
    let correlator = Arc::new(RequestCorrelator::new(open_history(
        &config.history.ledger_path,
    )?));
    let dispatcher = Arc::new(Dispatcher::new(
        generator,
        Arc::new(runner),
        analyzer,
        correlator,
        status,
        session.clone(),
    ));

    let (shutdown, shutdown_rx) = watch::channel(false);
    let listener = remote.as_ref().map(|remote| {
        warn!("remote DANGEROUS commands run without confirmation, even with safety mode on");
        RemoteListener::new(
            dispatcher.clone(),
            remote.clone(),
            remote.clone(),
            config.remote.max_concurrent,
        )
        .spawn(shutdown_rx.clone())
    });

    info!(
        device_id = %session.device_id(),
        model = %model,
        shell = shell.name(),
        remote = remote.is_some(),
        "dispatch engine started"
    );

    let app = App {
        dispatcher,
        remote,
        listener,
        shutdown,
        model,
        export_dir: args.export_dir,
    };
    app.publish(labels::READY, extra(&[("message", json!("Device ready for commands"))]))
        .await;

    if let Some(request) = args.request {
        let input = LineReader::stdin();
        app.run_request(&input, &request).await;
        app.publish(labels::OFFLINE, extra(&[("message", json!("Device going offline"))]))
            .await;
    } else if args.listen_only {
        println!("Listening for remote commands on device {}", session.device_id());
        tokio::signal::ctrl_c()
            .await
            .context("waiting for interrupt")?;
        app.publish(labels::OFFLINE, extra(&[("message", json!("Device terminated by user"))]))
            .await;
    } else {
        app.repl().await;
    }

    app.stop().await;
    Ok(())
}
