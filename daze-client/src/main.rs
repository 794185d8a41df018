mod dialer;
mod registry;
mod routing;
mod socks5;

use clap::{Parser, Subcommand};
use daze_proto::config::load_client_config;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

#[derive(Parser)]
#[command(name = "daze-client", about = "daze proxy client — SOCKS5 ingress with geo-routed tunneling")]
struct Cli {
    /// Local SOCKS5 listen address
    #[arg(short, long, default_value = "127.0.0.1:51959")]
    listen: String,

    /// Remote daze-server address
    #[arg(short, long, default_value = "127.0.0.1:51958")]
    server: String,

    /// Path to config file (optional; built-in defaults apply otherwise)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override log level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Launch a child process with `all_proxy` pointed at this client's
    /// listen address (mirrors the original `daze.py cmd` helper).
    Cmd {
        #[arg(trailing_var_arg = true, required = true)]
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Some(Command::Cmd { args }) = &cli.command {
        return run_cmd(&cli.listen, args).await;
    }

    let config = load_client_config(cli.config.as_deref())?;

    let log_level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    tracing::info!("daze-client starting");

    let server_addr: SocketAddr = cli
        .server
        .parse()
        .map_err(|e| format!("invalid server address: {}", e))?;

    let registry_cfg = &config.registry;
    let cache_path = PathBuf::from(&registry_cfg.cache_path);
    let source_url = registry_cfg.source_url.clone();
    let max_age = Duration::from_secs(registry_cfg.refresh_days * 24 * 60 * 60);

    let registry_text = registry::load(&cache_path, &source_url, max_age, fetch_via_http).await?;
    let router = Arc::new(routing::Router::from_registry_text(&registry_text, &registry_cfg.country));

    let listener = TcpListener::bind(&cli.listen).await?;
    tracing::info!("SOCKS5 listening on {}", cli.listen);

    let semaphore = Arc::new(Semaphore::new(config.limits.max_connections as usize));

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer) = result?;
                let router = router.clone();
                let sem = semaphore.clone();

                tokio::spawn(async move {
                    let _permit = match sem.try_acquire() {
                        Ok(p) => p,
                        Err(_) => {
                            tracing::warn!("connection limit reached, rejecting {}", peer);
                            return;
                        }
                    };

                    if let Err(e) = socks5::handle(stream, router, server_addr).await {
                        tracing::debug!("client {} error: {}", peer, e);
                    }
                });
            }
            _ = shutdown_signal() => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    tracing::info!("daze-client stopped");
    Ok(())
}

async fn fetch_via_http(url: &str) -> std::io::Result<String> {
    reqwest::get(url)
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?
        .text()
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}

async fn run_cmd(listen_addr: &str, args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let (program, rest) = args.split_first().ok_or("no command given")?;
    let status = tokio::process::Command::new(program)
        .args(rest)
        .env("all_proxy", format!("socks5://{}", listen_addr))
        .status()
        .await?;
    std::process::exit(status.code().unwrap_or(1));
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
