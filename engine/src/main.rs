//! Cutover - Entry Point
//!
//! Deploys a version of a containerized service to one environment, or rolls
//! it back, and optionally serves the deployment status over HTTP.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cutover::config::DeploymentConfig;
use cutover::deploy::command::ShellRunner;
use cutover::deploy::fsm::DeploymentState;
use cutover::deploy::{HistorySnapshot, Orchestrator};
use cutover::filesys::file::File;
use cutover::health::ReqwestProbe;
use cutover::logs::{init_logging, LogOptions};
use cutover::metrics::HttpMetricsBackend;
use cutover::models::deployment::{DeployOptions, DeploymentStatus, RollbackInfo, StepStatus};
use cutover::server::{serve, ServerState};
use cutover::telemetry::SysinfoProbe;
use cutover::utils::version_info;

const DEFAULT_CONFIG: &str = "cutover.json";

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version_info()) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("{}", e),
        }
        return ExitCode::SUCCESS;
    }

    match run(&cli_args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("{} {:#}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

/// Run the requested action; `Ok(false)` when the deployment or rollback failed
async fn run(cli_args: &HashMap<String, String>) -> anyhow::Result<bool> {
    let config_path = cli_args
        .get("config")
        .cloned()
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let config = DeploymentConfig::load(&File::new(&config_path))
        .await
        .with_context(|| format!("loading configuration from {}", config_path))?;

    // Initialize logging
    let mut log_options = LogOptions {
        log_level: config.log_level,
        json_format: cli_args.contains_key("log-json"),
        ..Default::default()
    };
    if let Some(dir) = cli_args.get("log-dir") {
        log_options.file = true;
        log_options.log_dir = PathBuf::from(dir);
    }
    let _log_guard = init_logging(log_options).context("initializing logging")?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        await_shutdown_signal().await;
        signal_token.cancel();
    });

    let metrics = HttpMetricsBackend::from_settings(&config.monitoring)
        .context("configuring the metrics backend")?;
    let probe = ReqwestProbe::new().context("building the health probe client")?;
    let orchestrator = Arc::new(
        Orchestrator::new(
            config.clone(),
            Arc::new(ShellRunner::new()),
            Arc::new(probe),
            Arc::new(metrics),
            Arc::new(SysinfoProbe),
        )
        .with_shutdown(shutdown.clone()),
    );

    let history_file = cli_args.get("history-file").map(File::new);
    if let Some(file) = &history_file {
        if file.exists().await {
            let snapshot: HistorySnapshot = file
                .read_json()
                .await
                .with_context(|| format!("reading history from {}", file.path().display()))?;
            orchestrator.restore(snapshot).await;
        }
    }

    let server = if cli_args.contains_key("serve") {
        let token = shutdown.clone();
        let (addr, handle) = serve(
            &config.server,
            Arc::new(ServerState::new(orchestrator.clone())),
            async move { token.cancelled().await },
        )
        .await
        .context("starting the status server")?;
        info!("Status server listening on {}", addr);
        Some(handle)
    } else {
        None
    };

    let mut succeeded = true;
    if let Some(version) = cli_args.get("deploy") {
        let options = DeployOptions {
            dry_run: cli_args.contains_key("dry-run"),
            force: cli_args.contains_key("force"),
            skip_tests: cli_args.contains_key("skip-tests"),
        };
        info!("Deploying {} to {} with {:?}", version, config.environment, options);

        let result = orchestrator.deploy(version, options).await;
        if let Some(status) = orchestrator.get_status().await {
            print_status(&status);
        }
        if let Err(e) = result {
            eprintln!("{} {}", "deployment failed:".red().bold(), e);
            succeeded = false;
        }
    } else if let Some(reason) = cli_args.get("rollback") {
        let reason = if reason == "true" {
            "manual rollback"
        } else {
            reason.as_str()
        };
        match orchestrator.rollback(reason).await {
            Ok(info) => print_rollback(&info),
            Err(e) => {
                eprintln!("{} {}", "rollback failed:".red().bold(), e);
                succeeded = false;
            }
        }
    } else if server.is_none() {
        warn!("Nothing to do: pass --deploy=<version>, --rollback or --serve");
    }

    if let Some(file) = &history_file {
        file.write_json(&orchestrator.snapshot().await)
            .await
            .with_context(|| format!("writing history to {}", file.path().display()))?;
    }

    if let Some(handle) = server {
        info!("Serving status until shutdown");
        shutdown.cancelled().await;
        handle.await.context("status server task")??;
    }

    Ok(succeeded)
}

fn print_status(status: &DeploymentStatus) {
    let state = status.state().to_string();
    let state = match status.state() {
        DeploymentState::Completed => state.green().bold(),
        DeploymentState::Failed => state.red().bold(),
        DeploymentState::RolledBack => state.yellow().bold(),
        _ => state.normal(),
    };
    let mode = if status.dry_run { " (dry-run)" } else { "" };
    println!(
        "{} {} to {} [{}]{}: {}",
        "deployment".bold(),
        status.version,
        status.environment,
        status.strategy,
        mode,
        state
    );

    for step in &status.steps {
        let marker = match step.status {
            StepStatus::Completed => "ok".green(),
            StepStatus::Failed => "failed".red(),
            StepStatus::Skipped => "skipped".dimmed(),
            StepStatus::Running => "running".cyan(),
            StepStatus::Pending => "pending".normal(),
        };
        println!("  {:<24} {}", step.name, marker);
        if let Some(error) = &step.error {
            println!("  {:<24} {}", "", error.red());
        }
    }
    for warning in &status.warnings {
        println!("  {} {}", "warning:".yellow(), warning);
    }
    for error in &status.errors {
        println!("  {} {}", "error:".red(), error);
    }
    if let Some(ms) = status.metrics.duration_ms {
        println!("  took {:.1}s", ms as f64 / 1000.0);
    }
}

fn print_rollback(info: &RollbackInfo) {
    println!(
        "{} {} -> {}: {}",
        "rollback".bold(),
        info.from_version,
        info.to_version,
        "completed".green().bold()
    );
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            _ => {
                warn!("Unable to install signal handlers, falling back to Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, cancelling...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, cancelling...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl+C received, cancelling...");
    }
}
