use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use mblrun::config::{self, AppConfig};
use mblrun::engine::TaskEngine;
use mblrun::errors::{EngineError, EngineResult};
use mblrun::logging::FileTaskLogger;
use mblrun::mbl;
use mblrun::protocol::prompts;
use mblrun::remote::{BridgeController, RemoteDesktopController};
use mblrun::server::TaskServer;
use mblrun::vision::HttpVisionClient;

#[derive(Parser)]
#[command(name = "mblrun", version, about = "Run MBL automation tasks against a remote desktop")]
struct Cli {
    /// Path to config.toml (defaults to exe-adjacent, then working directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Lex, parse and validate a task file without executing it.
    Check { file: PathBuf },
    /// Execute a task file.
    Run {
        file: PathBuf,
        /// Task input, repeatable: --param name=value
        #[arg(long = "param", value_name = "NAME=VALUE")]
        params: Vec<String>,
    },
    /// Start the TCP task service.
    Serve,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load .env file if present (ignore error if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let exit_code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "fatal");
            eprintln!("error: {e}");
            2
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> EngineResult<i32> {
    match cli.command {
        Command::Check { file } => check(&file).await,
        Command::Run { file, params } => {
            let config = load_config(cli.config.as_ref())?;
            run_task(&config, &file, params).await
        }
        Command::Serve => {
            let config = load_config(cli.config.as_ref())?;
            serve(config).await
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> EngineResult<AppConfig> {
    match path {
        Some(path) => config::load_config_from(path),
        None => config::load_config(),
    }
}

async fn check(file: &PathBuf) -> EngineResult<i32> {
    let source = tokio::fs::read_to_string(file).await?;
    let file_name = file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    match mbl::parse_task(&source, &file_name) {
        Ok(task) => {
            println!(
                "OK: task \"{}\" ({} inputs, {} steps)",
                task.name,
                task.inputs.len(),
                task.steps.len()
            );
            Ok(0)
        }
        Err(EngineError::Validation(errors)) => {
            for error in &errors {
                println!("invalid: {error}");
            }
            Ok(1)
        }
        Err(e) => {
            println!("invalid: {e}");
            Ok(1)
        }
    }
}

async fn run_task(config: &AppConfig, file: &PathBuf, params: Vec<String>) -> EngineResult<i32> {
    let source = tokio::fs::read_to_string(file).await?;
    let file_name = file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let task = mbl::parse_task(&source, &file_name)?;
    let parameters = parse_params(&params)?;

    let (engine, controller) = build_engine(config);
    let cancel = CancellationToken::new();

    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling task");
            ctrl_c_token.cancel();
        }
    });

    controller.connect(&cancel).await?;
    let result = engine.execute(&task, parameters, cancel).await;
    let _ = controller.disconnect().await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(if result.success { 0 } else { 1 })
}

async fn serve(config: AppConfig) -> EngineResult<i32> {
    let (engine, controller) = build_engine(&config);
    let logger: Arc<FileTaskLogger> = Arc::new(FileTaskLogger::new(&config.logging.directory));

    let server = Arc::new(TaskServer::new(
        engine,
        controller.clone(),
        logger,
        config.server.tasks_dir.clone(),
        config.server.bind.clone(),
    ));

    let connect_token = server.shutdown_token();
    if let Err(e) = controller.connect(&connect_token).await {
        tracing::warn!(error = %e, "bridge not reachable at startup; use 'reconnect'");
    }

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    server.serve().await?;
    Ok(0)
}

fn build_engine(config: &AppConfig) -> (Arc<TaskEngine>, Arc<BridgeController>) {
    let controller = Arc::new(BridgeController::new(
        config.remote.clone(),
        config.engine.typing_delay_ms,
    ));
    let system_prompt = prompts::system_prompt(config.remote.width, config.remote.height);
    let vision = Arc::new(HttpVisionClient::new(&config.vision, system_prompt));
    let logger = Arc::new(FileTaskLogger::new(&config.logging.directory));
    let engine = Arc::new(TaskEngine::new(
        controller.clone(),
        vision,
        logger,
        config.engine.clone(),
    ));
    (engine, controller)
}

fn parse_params(raw: &[String]) -> EngineResult<HashMap<String, String>> {
    let mut params = HashMap::new();
    for entry in raw {
        let Some((name, value)) = entry.split_once('=') else {
            return Err(EngineError::Config(format!(
                "invalid --param '{entry}', expected NAME=VALUE"
            )));
        };
        params.insert(name.trim().to_string(), value.to_string());
    }
    Ok(params)
}
