mod handler;

use clap::Parser;
use daze_proto::config::load_server_config;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::time::Duration;

#[derive(Parser)]
#[command(name = "daze-server", about = "daze proxy server — obfuscated tunnel endpoint")]
struct Cli {
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:51958")]
    listen: String,

    /// Path to config file (optional; built-in defaults apply otherwise)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = load_server_config(cli.config.as_deref())?;

    let log_level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    tracing::info!("daze-server starting");

    let handshake_timeout = Duration::from_secs(config.limits.handshake_timeout_sec);
    let max_conns = config.limits.max_connections as usize;

    let listener = TcpListener::bind(&cli.listen).await?;
    tracing::info!("listening on {}", cli.listen);

    let semaphore = Arc::new(Semaphore::new(max_conns));

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, addr) = result?;
                let sem = semaphore.clone();

                tokio::spawn(async move {
                    let _permit = match sem.try_acquire() {
                        Ok(p) => p,
                        Err(_) => {
                            tracing::warn!("connection limit reached, rejecting {}", addr);
                            return;
                        }
                    };

                    if let Err(e) = handler::handle_client(stream, addr, handshake_timeout).await {
                        tracing::debug!("client {} error: {}", addr, e);
                    }
                });
            }
            _ = shutdown_signal() => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    tracing::info!("daze-server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to setup SIGTERM handler");

    tokio::select! {
        _ = ctrl_c => {},
        _ = sigterm.recv() => {},
    }
}
