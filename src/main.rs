mod config;
mod connection;
mod dispatch;
mod handler;
mod listener;
mod mapping;
mod server;
mod sniff;
mod socks;
mod state;

use crate::config::{Cli, ProxyConfig};
use crate::handler::SERVICE_NAME;
use crate::server::{Control, ProxyServer};
use clap::Parser;
use color_eyre::eyre::Result;

use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("shortlink_proxy=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let args = Cli::parse();
    let config = ProxyConfig::from_cli(args);
    let config_file = config.config_file.clone();

    let server = ProxyServer::bind(config).await?;

    info!(
        "{} (SOCKS5+HTTP) listening on {}",
        SERVICE_NAME,
        server.local_addr()
    );
    info!("Mapping file: {}", config_file.display());
    info!("Send SIGUSR1 to reload mappings: kill -USR1 {}", std::process::id());

    let (control_tx, control_rx) = mpsc::channel(8);
    forward_signals(control_tx)?;

    server.run(control_rx).await?;
    Ok(())
}

/// SIGUSR1 reloads, SIGINT/SIGTERM shut down
#[cfg(unix)]
fn forward_signals(tx: mpsc::Sender<Control>) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut reload = signal(SignalKind::user_defined1())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = reload.recv() => {
                    info!("Received SIGUSR1");
                    Control::Reload
                }
                _ = interrupt.recv() => {
                    info!("Received SIGINT");
                    Control::Shutdown
                }
                _ = terminate.recv() => {
                    info!("Received SIGTERM");
                    Control::Shutdown
                }
            };
            if tx.send(event).await.is_err() {
                break;
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn forward_signals(tx: mpsc::Sender<Control>) -> std::io::Result<()> {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C");
            if tx.send(Control::Shutdown).await.is_err() {
                break;
            }
        }
    });
    Ok(())
}
