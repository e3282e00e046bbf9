// Beam signaling server: WebSocket presence broker for beam nodes and browser clients.

mod config;
mod server;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "beam-signal", version, about = "Beam signaling server")]
struct Cli {
    /// Config file (default: ~/.config/beam/signal.toml, then /etc/beam/signal.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Listen address
    #[arg(long)]
    bind: Option<String>,
    /// Listen port
    #[arg(long, short)]
    port: Option<u16>,
    /// Seconds between heartbeat probes
    #[arg(long)]
    heartbeat_secs: Option<u64>,
    /// Seconds of silence before a session is dropped
    #[arg(long)]
    session_timeout_secs: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut cfg = config::load(cli.config.as_deref())?;
    if let Some(bind) = cli.bind {
        cfg.bind = bind;
    }
    if let Some(port) = cli.port {
        cfg.port = port;
    }
    if let Some(s) = cli.heartbeat_secs {
        cfg.heartbeat_secs = s;
    }
    if let Some(s) = cli.session_timeout_secs {
        cfg.session_timeout_secs = s;
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let addr = format!("{}:{}", cfg.bind, cfg.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        tracing::info!(%addr, "signaling server listening");

        let (stop_tx, stop_rx) = watch::channel(false);
        let settings = server::HubSettings {
            heartbeat_interval: cfg.heartbeat_interval(),
            session_timeout: cfg.session_timeout(),
        };
        let server = tokio::spawn(server::run_server(listener, settings, stop_rx));
        shutdown_signal().await?;
        tracing::info!("shutting down");
        let _ = stop_tx.send(true);
        server.await??;
        Ok::<(), anyhow::Error>(())
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
