mod engine;
mod io;
mod logging;
mod resource;
mod txn;
mod watch;
mod worker;

#[cfg(test)]
mod test_utils;

use clap::Parser;
use engine::{ProjectKey, ResourceEngine};
use logging::{LogConfig, init_logging};
use resource::ResourceIndex;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{Level, info};
use worker::{WorkerClient, WorkerClientConfig, methods};

/// CLI arguments for the i18n status engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Project root directory to scan for translation resources (defaults to current directory)
    #[arg(long, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Path to the worker executable (overrides I18N_WORKER_PATH env var)
    #[arg(long, value_name = "PATH")]
    worker_path: Option<String>,

    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file path (overrides I18N_LOG_FILE env var)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Run a project-wide diagnosis through the worker process
    #[arg(long)]
    diagnose: bool,

    /// Keep watching the resource roots and reprint the summary on changes
    #[arg(long)]
    watch: bool,
}

/// Resolve worker path from CLI args and environment
fn resolve_worker_path(worker_path_arg: Option<String>) -> String {
    // Priority: CLI arg > I18N_WORKER_PATH env var > "i18n-status-core" default
    worker_path_arg
        .or_else(|| std::env::var("I18N_WORKER_PATH").ok())
        .unwrap_or_else(|| "i18n-status-core".to_string())
}

/// Condensed view of one project's index for terminal output
fn index_summary(start_dir: &Path, index: &ResourceIndex) -> serde_json::Value {
    json!({
        "project": start_dir.display().to_string(),
        "languages": index.languages(),
        "namespaces": index.namespaces(),
        "keys": index.key_count(),
        "files": index.files().len(),
        "errors": index
            .errors()
            .map(|error| json!({
                "file": error.file.display().to_string(),
                "language": error.language,
                "message": error.message,
            }))
            .collect::<Vec<_>>(),
    })
}

/// Run `doctor/diagnose` through the worker, streaming progress to stderr.
/// Ctrl-C cancels cooperatively via the token file instead of killing the
/// worker.
async fn run_diagnosis(
    worker_path: String,
    project_root: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Using worker: {}", worker_path);

    let config = WorkerClientConfig::new(&worker_path).with_working_dir(project_root);
    let mut client = WorkerClient::new(config);

    client
        .on_notification(methods::DOCTOR_PROGRESS, |notification| {
            let params = notification.params.unwrap_or(serde_json::Value::Null);
            let message = params["message"].as_str().unwrap_or("working");
            match (
                params["file_processed"].as_u64(),
                params["file_total"].as_u64(),
            ) {
                (Some(processed), Some(total)) => {
                    eprintln!("[doctor] {message} ({processed}/{total})");
                }
                _ => eprintln!("[doctor] {message}"),
            }
        })
        .await;

    if let Err(e) = client.start().await {
        eprintln!("Failed to start worker '{}': {}", worker_path, e);
        std::process::exit(1);
    }

    let params = json!({ "root": project_root.display().to_string() });
    log_rpc_message!(Level::DEBUG, "outgoing", methods::DOCTOR_DIAGNOSE, &params);
    let call = client
        .send_cancellable_request(methods::DOCTOR_DIAGNOSE, Some(params))
        .await?;

    let cancel = call.cancel_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, asking the worker to stop early");
            if let Err(e) = cancel.cancel().await {
                eprintln!("Failed to write cancel token: {e}");
            }
        }
    });

    let outcome = call.wait().await;
    interrupt.abort();

    let failed = outcome.is_err();
    match outcome {
        Ok(result) => {
            log_rpc_message!(Level::DEBUG, "incoming", methods::DOCTOR_DIAGNOSE, &result);
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Err(e) => eprintln!("Diagnosis failed: {e}"),
    }

    client.stop().await?;
    client.wait_for_stop(Duration::from_secs(10)).await;
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

/// Watch the project's roots, folding change events into the index and
/// reprinting the summary until interrupted
async fn run_watch(
    engine: &mut ResourceEngine,
    key: &ProjectKey,
    project_root: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let mode = engine.watch_project(key)?;
    info!("Watching for resource changes in {:?} mode", mode);
    eprintln!(
        "Watching {} for changes (Ctrl-C to stop)",
        project_root.display()
    );

    loop {
        tokio::select! {
            maybe_change = engine.next_change() => {
                let Some((event_key, event)) = maybe_change else {
                    break;
                };
                engine.handle_change(&event_key, &event)?;
                let start_dir = engine.start_dir(&event_key)?.to_path_buf();
                let index = engine.index(&event_key).await?;
                println!("{}", serde_json::to_string_pretty(&index_summary(&start_dir, index))?);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping watch");
                break;
            }
        }
    }

    engine.stop_watching(key);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Extract values before moving
    let log_level = args.log_level.clone();
    let log_file = args.log_file.clone();
    let root_arg = args.root.clone();

    // Initialize logging with configuration from env vars and CLI args
    let log_config = LogConfig::from_env().with_overrides(log_level, log_file);

    if let Err(e) = init_logging(log_config) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    // Resolve project root directory
    let project_root = root_arg.unwrap_or_else(|| {
        std::env::current_dir().unwrap_or_else(|e| {
            eprintln!("Failed to get current directory: {e}");
            std::process::exit(1);
        })
    });

    info!(
        "Starting resource engine with project root: {}",
        project_root.display()
    );

    let mut engine = ResourceEngine::new();
    let key = match engine.resolve_project(&project_root).await {
        Ok(key) => key,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let index = engine.index(&key).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&index_summary(&project_root, index))?
    );

    if args.diagnose {
        let worker_path = resolve_worker_path(args.worker_path);
        run_diagnosis(worker_path, &project_root).await?;
    }

    if args.watch {
        run_watch(&mut engine, &key, &project_root).await?;
    }

    Ok(())
}
