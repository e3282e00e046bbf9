// Beam node: LAN or signaling-assisted peer discovery, direct channels, file transfer and chat.

mod commands;
mod config;
mod discovery;
mod node;
mod signaling;
mod transport;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use beam_core::init::{classify_io, on_init_failure};
use beam_core::{Action, Backoff, LinkStatus, PeerId, PeerSession, RetryPolicy, SessionConfig};
use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::config::Mode;
use crate::node::{Node, NodeEvent, NodeSettings};

#[derive(Parser)]
#[command(name = "beam-node", version, about = "Beam peer node")]
struct Cli {
    /// Config file (default: ~/.config/beam/node.toml, then /etc/beam/node.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Discovery mode
    #[arg(long, value_enum)]
    mode: Option<Mode>,
    /// Signaling server URL (global mode)
    #[arg(long, value_name = "URL")]
    signal_url: Option<String>,
    /// Discovery UDP port
    #[arg(long)]
    discovery_port: Option<u16>,
    /// Direct channel TCP port
    #[arg(long)]
    transport_port: Option<u16>,
    /// Directory for received files
    #[arg(long, value_name = "DIR")]
    download_dir: Option<PathBuf>,
    /// Host advertised to the signaling server
    #[arg(long)]
    advertise_host: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    // stdout belongs to the interactive surface.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut cfg = config::load(cli.config.as_deref())?;
    if let Some(m) = cli.mode {
        cfg.mode = m;
    }
    if let Some(url) = cli.signal_url {
        cfg.signal_url = url;
    }
    if let Some(p) = cli.discovery_port {
        cfg.discovery_port = p;
    }
    if let Some(p) = cli.transport_port {
        cfg.transport_port = p;
    }
    if let Some(dir) = cli.download_dir {
        cfg.download_dir = dir;
    }
    if let Some(host) = cli.advertise_host {
        cfg.advertise_host = Some(host);
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let local = PeerId::generate();
        let mut session = PeerSession::with_config(
            local.clone(),
            SessionConfig {
                chunk_size: cfg.chunk_size,
                connect_timeout: Duration::from_secs(cfg.connect_timeout_secs),
                ..SessionConfig::default()
            },
        );
        let policy = RetryPolicy::registration_with(cfg.register_attempts);
        let listener = match bind_transport(cfg.transport_port, policy).await {
            Ok(l) => l,
            Err(e) => {
                if let Some(Action::LinkStatusChanged(status)) =
                    session.set_link_status(LinkStatus::Error(format!("{e:#}")))
                {
                    println!("status: {status}");
                }
                return Err(e);
            }
        };
        let transport_port = listener.local_addr()?.port();
        tracing::info!(%local, port = transport_port, mode = ?cfg.mode, "node starting");
        println!("you are {local} (type /help for commands)");

        let endpoint = match cfg.mode {
            Mode::Global => cfg
                .advertise_host
                .clone()
                .or_else(|| node::detect_advertise_host(&cfg.signal_url))
                .map(|host| format!("{host}:{transport_port}")),
            Mode::Local => None,
        };
        let settings = NodeSettings {
            mode: cfg.mode,
            signal_url: cfg.signal_url.clone(),
            signal_retry: RetryPolicy::signaling(),
            discovery_port: cfg.discovery_port,
            transport_port,
            download_dir: cfg.download_dir.clone(),
            endpoint,
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(transport::run_listener(listener, local, events_tx.clone()));
        tokio::spawn(read_stdin(events_tx.clone()));

        let mut node = Node::new(session, settings, events_tx);
        node.start().await.context("starting peer discovery")?;
        node.run(events_rx, async {
            if let Err(e) = shutdown_signal().await {
                tracing::warn!(error = %e, "signal handler unavailable");
                std::future::pending::<()>().await;
            }
        })
        .await;
        println!("bye");
        Ok::<(), anyhow::Error>(())
    })
}

/// Bind the direct channel listener, retrying transient failures up to the policy's cap.
async fn bind_transport(port: u16, policy: RetryPolicy) -> anyhow::Result<TcpListener> {
    let mut backoff = Backoff::new(policy);
    loop {
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                let err = classify_io(&e);
                let Some(delay) = on_init_failure(&err, &mut backoff) else {
                    return Err(err).with_context(|| format!("binding transport port {port}"));
                };
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// One command per line; EOF leaves the node running until a signal arrives.
async fn read_stdin(events: mpsc::UnboundedSender<NodeEvent>) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match commands::parse(&line) {
                Some(Ok(cmd)) => {
                    if events.send(NodeEvent::Command(cmd)).is_err() {
                        return;
                    }
                }
                Some(Err(msg)) => println!("{msg}"),
                None => {}
            },
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "stdin read failed");
                return;
            }
        }
    }
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
