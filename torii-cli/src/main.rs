//! The torii server binary: configuration loading, log setup, signal
//! glue. Everything interesting lives in the library crates.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use torii::Server;
use torii::core::graceful::Shutdown;
use torii::core::{RuntimeContext, ServerConfig};

#[derive(Debug, Parser)]
#[command(name = "torii", about = "multi-protocol static web server", version)]
struct Args {
    /// JSON configuration file (keys as documented in ServerConfig).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured listen port.
    #[arg(long)]
    port: Option<u16>,

    /// Override the configured content root.
    #[arg(long)]
    root: Option<PathBuf>,

    /// Override the configured log level.
    #[arg(long)]
    log_level: Option<String>,
}

fn load_config(args: &Args) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .map_err(|err| format!("{}: {err}", path.display()))?;
            serde_json::from_str(&raw).map_err(|err| format!("{}: {err}", path.display()))?
        }
        None => ServerConfig::default(),
    };

    if let Some(port) = args.port {
        config.listen_port = port;
    }
    if let Some(root) = &args.root {
        config.root_path = root.clone();
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    Ok(config)
}

/// Installs the subscriber: stderr by default, a daily-rolled file when
/// `logDirectory` is configured. The guard must outlive the runtime so
/// buffered lines flush on shutdown.
fn init_tracing(config: &ServerConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match &config.log_directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "torii.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args)?;
    let _log_guard = init_tracing(&config);

    let workers = config.worker_threads();
    tracing::info!(
        workers,
        port = config.listen_port,
        root = %config.root_path.display(),
        ssl = config.enable_ssl,
        http2 = config.enable_http2,
        "starting torii"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let ctx = Arc::new(RuntimeContext::new(config)?);
        let server = Arc::new(Server::new(ctx)?);

        let shutdown = Shutdown::default();
        shutdown.spawn_task_fn(move |guard| async move {
            if let Err(err) = server.serve(guard).await {
                tracing::error!(%err, "server terminated");
            }
        });

        shutdown
            .shutdown_with_limit(Duration::from_secs(30))
            .await
            .map_err(|err| std::io::Error::other(err.to_string()))?;
        tracing::info!("bye");
        Ok::<_, Box<dyn std::error::Error>>(())
    })
}
