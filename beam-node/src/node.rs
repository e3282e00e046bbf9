//! Node actor: owns the peer session and every channel handle, applies events from the network
//! tasks and stdin in arrival order, and executes the session's actions.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use beam_core::init::RetryPolicy;
use beam_core::{
    Action, ChannelId, DataMessage, Direction, LinkStatus, Payload, PeerId, PeerSession, ReceivedFile,
    SignalMessage, TransferRecord, TransferStatus, DEFAULT_PACING,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::commands::{self, Command};
use crate::config::Mode;
use crate::discovery::Discovery;
use crate::signaling::{self, SignalCommand};
use crate::transport::{self, ChannelHandle};

/// Cadence of presence sweeps and connection timeout checks.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Everything the actor reacts to.
pub enum NodeEvent {
    Announce { peer: PeerId, addr: SocketAddr },
    Leave { peer: PeerId },
    Incoming { peer: PeerId, stream: TcpStream },
    Dialed { peer: PeerId, channel: ChannelId, stream: TcpStream },
    DialFailed { peer: PeerId, channel: ChannelId, error: String },
    Data { peer: PeerId, channel: ChannelId, msg: DataMessage },
    ChannelClosed { peer: PeerId, channel: ChannelId, error: Option<String> },
    Signal(SignalMessage),
    SignalingUp,
    SignalingDown,
    SignalingGaveUp,
    Command(Command),
}

#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub mode: Mode,
    pub signal_url: String,
    pub signal_retry: RetryPolicy,
    pub discovery_port: u16,
    /// Bound direct channel port.
    pub transport_port: u16,
    pub download_dir: PathBuf,
    /// `host:port` advertised through signaling.
    pub endpoint: Option<String>,
}

pub struct Node {
    session: PeerSession,
    settings: NodeSettings,
    events: mpsc::UnboundedSender<NodeEvent>,
    addresses: HashMap<PeerId, String>,
    channels: HashMap<ChannelId, ChannelHandle>,
    pending_dials: HashMap<ChannelId, JoinHandle<()>>,
    discovery: Option<Discovery>,
    signal_tx: Option<mpsc::UnboundedSender<SignalCommand>>,
    signal_task: Option<JoinHandle<()>>,
}

impl Node {
    pub fn new(session: PeerSession, settings: NodeSettings, events: mpsc::UnboundedSender<NodeEvent>) -> Self {
        Self {
            session,
            settings,
            events,
            addresses: HashMap::new(),
            channels: HashMap::new(),
            pending_dials: HashMap::new(),
            discovery: None,
            signal_tx: None,
            signal_task: None,
        }
    }

    /// Start peer discovery for the configured mode.
    pub async fn start(&mut self) -> std::io::Result<()> {
        match self.settings.mode {
            Mode::Local => self.start_discovery().await,
            Mode::Global => {
                self.start_signaling();
                Ok(())
            }
        }
    }

    /// Process events until `/quit` or `shutdown` resolves, then leave gracefully.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<NodeEvent>, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut pump = tokio::time::interval(DEFAULT_PACING);
        pump.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                ev = events.recv() => {
                    let Some(ev) = ev else { break };
                    if !self.handle_event(ev).await {
                        break;
                    }
                }
                _ = pump.tick(), if self.session.has_pending_outbound() => {
                    let actions = self.session.pump_outbound();
                    self.execute(actions);
                }
                _ = sweep.tick() => {
                    let now = Instant::now();
                    let mut actions = self.session.tick(now);
                    if self.discovery.is_some() {
                        actions.extend(self.session.sweep_presence(now));
                    }
                    self.execute(actions);
                }
                _ = &mut shutdown => break,
            }
        }
        self.shutdown().await;
    }

    async fn handle_event(&mut self, ev: NodeEvent) -> bool {
        let now = Instant::now();
        match ev {
            NodeEvent::Announce { peer, addr } => {
                self.addresses.insert(peer.clone(), addr.to_string());
                let actions = self.session.on_presence_announce(peer, now);
                self.execute(actions);
            }
            NodeEvent::Leave { peer } => {
                let actions = self.session.on_presence_leave(&peer);
                self.execute(actions);
            }
            NodeEvent::Incoming { peer, stream } => {
                let (channel, actions) = self.session.on_incoming_channel(&peer, now);
                let rejected = actions
                    .iter()
                    .any(|a| matches!(a, Action::CloseChannel { channel: c, .. } if *c == channel));
                self.execute(actions);
                if !rejected {
                    self.channels
                        .insert(channel, transport::run_channel(stream, peer.clone(), channel, self.events.clone()));
                    let actions = self.session.on_channel_open(&peer, channel);
                    self.execute(actions);
                }
            }
            NodeEvent::Dialed { peer, channel, stream } => {
                if self.pending_dials.remove(&channel).is_none() {
                    tracing::debug!(%peer, channel, "dial completed after cancellation");
                    return true;
                }
                self.channels
                    .insert(channel, transport::run_channel(stream, peer.clone(), channel, self.events.clone()));
                let actions = self.session.on_channel_open(&peer, channel);
                self.execute(actions);
            }
            NodeEvent::DialFailed { peer, channel, error } => {
                self.pending_dials.remove(&channel);
                let actions = self.session.on_channel_error(&peer, channel, &error, now);
                self.execute(actions);
            }
            NodeEvent::Data { peer, channel, msg } => {
                let actions = self.session.on_data(&peer, channel, msg);
                self.execute(actions);
            }
            NodeEvent::ChannelClosed { peer, channel, error } => {
                self.channels.remove(&channel);
                let actions = match error {
                    Some(e) => self.session.on_channel_error(&peer, channel, &e, now),
                    None => self.session.on_channel_closed(&peer, channel, now),
                };
                self.execute(actions);
            }
            NodeEvent::Signal(msg) => {
                let actions = self.session.on_signal(msg, now);
                self.execute(actions);
            }
            NodeEvent::SignalingUp => self.set_status(LinkStatus::Connected),
            NodeEvent::SignalingDown => self.set_status(LinkStatus::Disconnected),
            NodeEvent::SignalingGaveUp => {
                self.signal_tx = None;
                self.signal_task = None;
                self.set_status(LinkStatus::Error("signaling server unreachable".to_string()));
                println!("signaling unreachable; falling back to LAN discovery");
                if let Err(e) = self.start_discovery().await {
                    tracing::error!(error = %e, "LAN discovery failed to start");
                }
            }
            NodeEvent::Command(cmd) => return self.handle_command(cmd).await,
        }
        true
    }

    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Peers => {
                let live = self.session.live_peers();
                let known = self.session.known_peers();
                println!("you are {}", self.session.local_id());
                for peer in &known {
                    let mark = if live.contains(peer) { "connected" } else { "seen" };
                    println!("  {peer} ({mark})");
                }
                for peer in live.iter().filter(|p| !known.contains(p)) {
                    println!("  {peer} (connected)");
                }
            }
            Command::Connect(peer) => {
                let actions = self.session.connect_to(&peer, Instant::now());
                self.execute(actions);
            }
            Command::Send { path, peers } => {
                let bytes = match tokio::fs::read(&path).await {
                    Ok(b) => b,
                    Err(e) => {
                        println!("cannot read {}: {e}", path.display());
                        return true;
                    }
                };
                let targets = if peers.is_empty() {
                    self.session.live_peers().to_vec()
                } else {
                    peers
                };
                if targets.is_empty() {
                    println!("no connected peers");
                    return true;
                }
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "file".to_string());
                let payload = Payload::new(name, mime_for(&path), bytes);
                let actions = self.session.send_payload(&targets, payload);
                self.execute(actions);
            }
            Command::Transfers => {
                if self.session.transfers().is_empty() {
                    println!("no transfers");
                }
                for record in self.session.transfers() {
                    println!("  {}", describe(record));
                }
            }
            Command::Chat(text) => {
                let (_, actions) = self.session.send_chat_message(&text);
                if actions.is_empty() {
                    println!("(no connected peers; message kept locally)");
                }
                self.execute(actions);
            }
            Command::Help => println!("{}", commands::HELP),
            Command::Quit => return false,
        }
        true
    }

    fn execute(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Dial { peer, channel } => self.dial(peer, channel),
                Action::CloseChannel { channel, .. } => {
                    if let Some(task) = self.pending_dials.remove(&channel) {
                        task.abort();
                    }
                    if let Some(handle) = self.channels.remove(&channel) {
                        tracing::debug!(peer = %handle.peer, channel, "closing channel");
                    }
                }
                Action::SendData { peer, channel, message } => {
                    let sent = self.channels.get(&channel).is_some_and(|c| c.send(message));
                    if !sent {
                        tracing::debug!(%peer, channel, "send on closed channel dropped");
                    }
                }
                Action::Signal(msg) => {
                    if let Some(tx) = &self.signal_tx {
                        let _ = tx.send(SignalCommand::Send(msg));
                    }
                }
                Action::PeerDiscovered { peer, endpoint } => {
                    if let Some(ep) = endpoint {
                        self.addresses.insert(peer.clone(), ep);
                    }
                    println!("peer discovered: {peer}");
                }
                Action::PeerLeft(peer) => {
                    self.addresses.remove(&peer);
                    println!("peer left: {peer}");
                }
                Action::ConnectionOpened(peer) => println!("connected: {peer}"),
                Action::ConnectionClosed { peer, reason } => match reason {
                    Some(r) => println!("disconnected: {peer} ({r})"),
                    None => println!("disconnected: {peer}"),
                },
                Action::Notice(n) => println!("notice: {n}"),
                Action::Transfer(record) => {
                    tracing::debug!(peer = %record.peer, file = %record.file_name, progress = record.progress, "transfer progress");
                    if record.status != TransferStatus::InProgress {
                        println!("{}", describe(&record));
                    }
                }
                Action::FileReceived { peer, file } => {
                    let dir = self.settings.download_dir.clone();
                    tokio::spawn(async move {
                        match save_file(&dir, &file).await {
                            Ok(path) => println!("saved {} from {peer} to {}", file.file_name, path.display()),
                            Err(e) => println!("could not save {} from {peer}: {e}", file.file_name),
                        }
                    });
                }
                Action::ChatReceived(m) => println!("[{}] {}", m.sender, m.text),
                Action::LinkStatusChanged(status) => {
                    tracing::info!(%status, "link status changed");
                    println!("status: {status}");
                }
            }
        }
    }

    fn dial(&mut self, peer: PeerId, channel: ChannelId) {
        let Some(addr) = self.addresses.get(&peer).cloned() else {
            let actions = self
                .session
                .on_channel_error(&peer, channel, "no known address", Instant::now());
            self.execute(actions);
            return;
        };
        let task = transport::dial(
            self.session.local_id().clone(),
            peer,
            addr,
            channel,
            self.session.config().connect_timeout,
            self.events.clone(),
        );
        self.pending_dials.insert(channel, task);
    }

    fn set_status(&mut self, status: LinkStatus) {
        if let Some(action) = self.session.set_link_status(status) {
            self.execute(vec![action]);
        }
    }

    async fn start_discovery(&mut self) -> std::io::Result<()> {
        if self.discovery.is_some() {
            return Ok(());
        }
        let discovery = Discovery::start(
            self.session.local_id().clone(),
            self.settings.discovery_port,
            self.settings.transport_port,
            self.events.clone(),
        )
        .await?;
        self.discovery = Some(discovery);
        self.set_status(LinkStatus::Connected);
        Ok(())
    }

    fn start_signaling(&mut self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let register = self.session.register_message(self.settings.endpoint.clone());
        let task = signaling::spawn(
            self.settings.signal_url.clone(),
            register,
            self.settings.signal_retry,
            self.events.clone(),
            rx,
        );
        self.signal_tx = Some(tx);
        self.signal_task = Some(task);
    }

    async fn shutdown(&mut self) {
        let signaling = self.signal_tx.is_some();
        let actions = self.session.shutdown(signaling);
        self.execute(actions);
        if let Some(tx) = self.signal_tx.take() {
            let _ = tx.send(SignalCommand::Shutdown);
        }
        if let Some(task) = self.signal_task.take() {
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }
        if let Some(discovery) = self.discovery.take() {
            discovery.send_leave().await;
        }
        for (_, task) in self.pending_dials.drain() {
            task.abort();
        }
        self.channels.clear();
        self.set_status(LinkStatus::Disconnected);
    }
}

fn describe(record: &TransferRecord) -> String {
    let arrow = match record.direction {
        Direction::Incoming => "<-",
        Direction::Outgoing => "->",
    };
    let status = match &record.status {
        TransferStatus::InProgress => format!("{}%", record.progress),
        TransferStatus::Completed => "done".to_string(),
        TransferStatus::Failed(reason) => format!("failed: {reason}"),
    };
    format!(
        "{arrow} {} {} ({} bytes) {status}",
        record.peer, record.file_name, record.file_size
    )
}

/// MIME type from the file extension.
pub fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "md" | "log" => "text/plain",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        _ => beam_core::chunk::DEFAULT_MIME_TYPE,
    }
}

/// Final path component of a received name; never escapes the download directory.
fn safe_file_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty() && n != "." && n != "..")
        .unwrap_or_else(|| "received.bin".to_string())
}

/// `name`, `name-1`, `name-2`, ... keeping the extension.
fn candidate_name(name: &str, n: u32) -> String {
    if n == 0 {
        return name.to_string();
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}-{n}.{ext}"),
        _ => format!("{name}-{n}"),
    }
}

async fn save_file(dir: &Path, file: &ReceivedFile) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let name = safe_file_name(&file.file_name);
    for n in 0..1000 {
        let path = dir.join(candidate_name(&name, n));
        match tokio::fs::OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(mut f) => {
                f.write_all(&file.bytes).await?;
                f.flush().await?;
                return Ok(path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::new(std::io::ErrorKind::AlreadyExists, "no free file name"))
}

/// Local address the OS would use to reach the signaling server. No packets are sent.
pub fn detect_advertise_host(signal_url: &str) -> Option<String> {
    let authority = signal_url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(signal_url)
        .split('/')
        .next()?;
    let socket = std::net::UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect(authority).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    if ip.is_unspecified() {
        return None;
    }
    Some(ip.to_string())
}
