//! Host-driven API: PeerSession receives events from the host, returns actions.
//!
//! Composes the presence store, the connection manager, chunked transfers and the chat log
//! for one local peer. The host owns every socket and timer; it feeds events in the order they
//! happen and executes the returned actions in order.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::chat::{ChatLog, ChatMessage};
use crate::chunk::{InboundTransfer, OutboundTransfer, Payload, ReceivedFile, TransferError, DEFAULT_CHUNK_SIZE};
use crate::connection::{
    ChannelId, ConnectionAction, ConnectionManager, ConnectionState, Notice, NoticeKind, DEFAULT_CONNECT_TIMEOUT,
};
use crate::identity::PeerId;
use crate::init::LinkStatus;
use crate::presence::{PresenceStore, DEFAULT_PRESENCE_TTL};
use crate::protocol::{DataMessage, SignalMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub chunk_size: usize,
    pub presence_ttl: Duration,
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            presence_ttl: DEFAULT_PRESENCE_TTL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    InProgress,
    Completed,
    Failed(String),
}

/// Observable row for one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    pub peer: PeerId,
    pub file_name: String,
    pub direction: Direction,
    pub file_size: u64,
    pub progress: u8,
    pub status: TransferStatus,
}

/// Action for the host to perform or surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open a direct channel to `peer` and tag it with `channel`.
    Dial { peer: PeerId, channel: ChannelId },
    CloseChannel { peer: PeerId, channel: ChannelId },
    SendData {
        peer: PeerId,
        channel: ChannelId,
        message: DataMessage,
    },
    /// Send to the signaling channel.
    Signal(SignalMessage),
    /// First sighting. Emitted before any `Dial` for the same peer.
    PeerDiscovered { peer: PeerId, endpoint: Option<String> },
    PeerLeft(PeerId),
    ConnectionOpened(PeerId),
    ConnectionClosed { peer: PeerId, reason: Option<String> },
    Notice(Notice),
    /// Snapshot after a transfer row changed.
    Transfer(TransferRecord),
    FileReceived { peer: PeerId, file: ReceivedFile },
    ChatReceived(ChatMessage),
    LinkStatusChanged(LinkStatus),
}

struct InboundEntry {
    transfer: InboundTransfer,
    record: usize,
}

struct OutboundEntry {
    peer: PeerId,
    channel: ChannelId,
    transfer: OutboundTransfer,
    record: usize,
}

/// Main coordinator for one local peer.
pub struct PeerSession {
    local: PeerId,
    config: SessionConfig,
    presence: PresenceStore,
    connections: ConnectionManager,
    inbound: HashMap<(PeerId, String), InboundEntry>,
    /// Send order. A later entry with the same peer and file name waits for the earlier one.
    outbound: Vec<OutboundEntry>,
    /// Peers currently known through the signaling channel's roster.
    signaled: HashSet<PeerId>,
    records: Vec<TransferRecord>,
    chat: ChatLog,
    link: LinkStatus,
}

impl PeerSession {
    pub fn new(local: PeerId) -> Self {
        Self::with_config(local, SessionConfig::default())
    }

    pub fn with_config(local: PeerId, config: SessionConfig) -> Self {
        let mut connections = ConnectionManager::new(local.clone());
        connections.set_connect_timeout(config.connect_timeout);
        connections.set_redial_cooldown(config.connect_timeout);
        Self {
            local,
            config,
            presence: PresenceStore::new(),
            connections,
            inbound: HashMap::new(),
            outbound: Vec::new(),
            signaled: HashSet::new(),
            records: Vec::new(),
            chat: ChatLog::new(),
            link: LinkStatus::Initializing,
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// `register` message for the signaling channel.
    pub fn register_message(&self, endpoint: Option<String>) -> SignalMessage {
        SignalMessage::Register {
            peer_id: self.local.clone(),
            endpoint,
        }
    }

    pub fn disconnect_message(&self) -> SignalMessage {
        SignalMessage::Disconnect {
            peer_id: self.local.clone(),
        }
    }

    /// Message from the signaling channel.
    pub fn on_signal(&mut self, msg: SignalMessage, now: Instant) -> Vec<Action> {
        match msg {
            SignalMessage::PeersList { peers, mut endpoints } => {
                // The roster is authoritative: peers missing from it left while we were away.
                let roster: HashSet<PeerId> = peers.iter().cloned().collect();
                let mut gone: Vec<PeerId> = self.signaled.difference(&roster).cloned().collect();
                gone.sort();
                let mut actions = Vec::new();
                for peer in gone {
                    tracing::debug!(%peer, "peer absent from roster");
                    actions.extend(self.on_departure(&peer));
                }
                self.signaled = roster;
                self.signaled.remove(&self.local);
                for peer in peers {
                    let endpoint = endpoints.remove(&peer);
                    actions.extend(self.on_sighting(peer, endpoint, now));
                }
                actions
            }
            SignalMessage::PeerJoined { peer_id, endpoint } => {
                if peer_id != self.local {
                    self.signaled.insert(peer_id.clone());
                }
                self.on_sighting(peer_id, endpoint, now)
            }
            SignalMessage::PeerLeft { peer_id } => self.on_departure(&peer_id),
            SignalMessage::Heartbeat => vec![Action::Signal(SignalMessage::Heartbeat)],
            other => {
                tracing::warn!(?other, "unexpected signaling message from server dropped");
                Vec::new()
            }
        }
    }

    /// LAN announcement seen. Refreshes presence; may dial.
    pub fn on_presence_announce(&mut self, peer: PeerId, now: Instant) -> Vec<Action> {
        self.on_sighting(peer, None, now)
    }

    /// LAN leave frame seen.
    pub fn on_presence_leave(&mut self, peer: &PeerId) -> Vec<Action> {
        self.on_departure(peer)
    }

    /// Expire presence records older than the configured ttl. Each expiry reports `PeerLeft` once.
    pub fn sweep_presence(&mut self, now: Instant) -> Vec<Action> {
        let expired = self.presence.sweep_expired(now, self.config.presence_ttl);
        let mut actions = Vec::new();
        for record in expired {
            tracing::debug!(peer = %record.peer_id, "presence expired");
            let conn = self.connections.on_peer_departed(&record.peer_id);
            actions.extend(self.map_all(conn));
            actions.push(Action::PeerLeft(record.peer_id));
        }
        actions
    }

    /// Periodic tick: connection attempt timeouts.
    pub fn tick(&mut self, now: Instant) -> Vec<Action> {
        let conn = self.connections.tick(now);
        self.map_all(conn)
    }

    /// Manual connect request from the UI.
    pub fn connect_to(&mut self, peer: &PeerId, now: Instant) -> Vec<Action> {
        let conn = self.connections.connect_to(peer, now);
        self.map_all(conn)
    }

    /// Remote peer opened a channel. The host tags it with the returned id; a `CloseChannel`
    /// for that id in the actions means the channel lost arbitration.
    pub fn on_incoming_channel(&mut self, peer: &PeerId, now: Instant) -> (ChannelId, Vec<Action>) {
        let (id, conn) = self.connections.on_incoming_channel(peer, now);
        (id, self.map_all(conn))
    }

    pub fn on_channel_open(&mut self, peer: &PeerId, channel: ChannelId) -> Vec<Action> {
        let conn = self.connections.on_channel_open(peer, channel);
        self.map_all(conn)
    }

    pub fn on_channel_closed(&mut self, peer: &PeerId, channel: ChannelId, now: Instant) -> Vec<Action> {
        let conn = self.connections.on_channel_closed(peer, channel, now);
        self.map_all(conn)
    }

    pub fn on_channel_error(&mut self, peer: &PeerId, channel: ChannelId, cause: &str, now: Instant) -> Vec<Action> {
        let conn = self.connections.on_channel_error(peer, channel, cause, now);
        self.map_all(conn)
    }

    /// Application message received on a direct channel.
    pub fn on_data(&mut self, peer: &PeerId, channel: ChannelId, msg: DataMessage) -> Vec<Action> {
        if self.connections.open_channel(peer) != Some(channel) {
            tracing::debug!(%peer, channel, "data on stale channel dropped");
            return Vec::new();
        }
        match msg {
            DataMessage::FileMetadata {
                file_name,
                file_size,
                file_type,
                total_chunks,
                checksum,
            } => self.on_file_metadata(peer, file_name, file_size, file_type, total_chunks, checksum),
            DataMessage::FileChunk {
                file_name,
                chunk_index,
                total_chunks,
                chunk,
            } => self.on_file_chunk(peer, file_name, chunk_index, total_chunks, &chunk),
            DataMessage::FileComplete { file_name } => self.on_file_complete(peer, file_name),
            DataMessage::ChatMessage { message } => {
                if self.chat.push(message.clone()) {
                    vec![Action::ChatReceived(message)]
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// Start sending `payload` to each listed peer. Peers without an Open channel get a notice.
    pub fn send_payload(&mut self, peers: &[PeerId], payload: Payload) -> Vec<Action> {
        let mut actions = Vec::new();
        for peer in peers {
            let Some(channel) = self.connections.open_channel(peer) else {
                actions.push(Action::Notice(Notice {
                    peer: peer.clone(),
                    kind: NoticeKind::NotConnected,
                }));
                continue;
            };
            let transfer = OutboundTransfer::new(payload.clone(), self.config.chunk_size);
            let record = self.push_record(TransferRecord {
                peer: peer.clone(),
                file_name: transfer.file_name().to_string(),
                direction: Direction::Outgoing,
                file_size: transfer.file_size(),
                progress: 0,
                status: TransferStatus::InProgress,
            });
            tracing::debug!(%peer, file = %payload.file_name, chunks = transfer.total_chunks(), "outbound transfer queued");
            self.outbound.push(OutboundEntry {
                peer: peer.clone(),
                channel,
                transfer,
                record,
            });
            actions.push(Action::Transfer(self.records[record].clone()));
        }
        actions
    }

    /// Advance every outbound transfer by one message. Call on the pacing cadence.
    ///
    /// The receiver keys transfers by peer and file name, so a second send of the same name to
    /// the same peer stays queued until the first one has sent its completion.
    pub fn pump_outbound(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        let mut busy: HashSet<(PeerId, String)> = HashSet::new();
        for entry in &mut self.outbound {
            if !busy.insert((entry.peer.clone(), entry.transfer.file_name().to_string())) {
                continue;
            }
            let Some(message) = entry.transfer.next_message() else {
                continue;
            };
            let is_chunk = matches!(message, DataMessage::FileChunk { .. });
            actions.push(Action::SendData {
                peer: entry.peer.clone(),
                channel: entry.channel,
                message,
            });
            let record = &mut self.records[entry.record];
            if is_chunk {
                record.progress = entry.transfer.progress();
                actions.push(Action::Transfer(record.clone()));
            }
            if entry.transfer.is_finished() {
                record.progress = 100;
                record.status = TransferStatus::Completed;
                actions.push(Action::Transfer(record.clone()));
            }
        }
        self.outbound.retain(|e| !e.transfer.is_finished());
        actions
    }

    pub fn has_pending_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Append a local chat line and send it to every open peer.
    pub fn send_chat_message(&mut self, text: &str) -> (ChatMessage, Vec<Action>) {
        let message = ChatMessage::new(self.local.clone(), text);
        self.chat.push(message.clone());
        let actions = self
            .connections
            .live_peers()
            .iter()
            .filter_map(|peer| {
                self.connections.open_channel(peer).map(|channel| Action::SendData {
                    peer: peer.clone(),
                    channel,
                    message: DataMessage::ChatMessage {
                        message: message.clone(),
                    },
                })
            })
            .collect();
        (message, actions)
    }

    /// Record the host's transport status. Emits a change event only when it differs.
    pub fn set_link_status(&mut self, status: LinkStatus) -> Option<Action> {
        if self.link == status {
            return None;
        }
        self.link = status.clone();
        Some(Action::LinkStatusChanged(status))
    }

    /// Close every channel and, when signaling is in use, announce departure.
    pub fn shutdown(&mut self, signaling: bool) -> Vec<Action> {
        let conn = self.connections.close_all();
        let mut actions = self.map_all(conn);
        if signaling {
            actions.push(Action::Signal(self.disconnect_message()));
        }
        actions
    }

    pub fn live_peers(&self) -> &[PeerId] {
        self.connections.live_peers()
    }

    pub fn known_peers(&self) -> Vec<PeerId> {
        self.presence.peers()
    }

    pub fn connection_state(&self, peer: &PeerId) -> Option<ConnectionState> {
        self.connections.state(peer)
    }

    pub fn transfers(&self) -> &[TransferRecord] {
        &self.records
    }

    pub fn chat_messages(&self) -> &[ChatMessage] {
        self.chat.messages()
    }

    pub fn link_status(&self) -> &LinkStatus {
        &self.link
    }

    fn on_sighting(&mut self, peer: PeerId, endpoint: Option<String>, now: Instant) -> Vec<Action> {
        if peer == self.local {
            return Vec::new();
        }
        let mut actions = Vec::new();
        if self.presence.upsert(&peer, now) {
            tracing::debug!(%peer, "peer discovered");
            actions.push(Action::PeerDiscovered {
                peer: peer.clone(),
                endpoint,
            });
        }
        let conn = self.connections.on_peer_discovered(&peer, now);
        actions.extend(self.map_all(conn));
        actions
    }

    fn on_departure(&mut self, peer: &PeerId) -> Vec<Action> {
        self.signaled.remove(peer);
        let known = self.presence.remove(peer).is_some();
        let conn = self.connections.on_peer_departed(peer);
        let mut actions = self.map_all(conn);
        if known {
            actions.push(Action::PeerLeft(peer.clone()));
        }
        actions
    }

    fn on_file_metadata(
        &mut self,
        peer: &PeerId,
        file_name: String,
        file_size: u64,
        file_type: String,
        total_chunks: u32,
        checksum: Option<String>,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        let key = (peer.clone(), file_name.clone());
        if let Some(old) = self.inbound.remove(&key) {
            actions.extend(self.fail_record(old.record, &TransferError::Superseded));
        }
        let record = self.push_record(TransferRecord {
            peer: peer.clone(),
            file_name: file_name.clone(),
            direction: Direction::Incoming,
            file_size,
            progress: 0,
            status: TransferStatus::InProgress,
        });
        match InboundTransfer::from_metadata(file_name, file_size, file_type, total_chunks, checksum) {
            Ok(transfer) => {
                self.records[record].progress = transfer.progress();
                self.inbound.insert(key, InboundEntry { transfer, record });
                actions.push(Action::Transfer(self.records[record].clone()));
            }
            Err(e) => {
                tracing::warn!(%peer, error = %e, "rejected file metadata");
                actions.extend(self.fail_record(record, &e));
            }
        }
        actions
    }

    fn on_file_chunk(
        &mut self,
        peer: &PeerId,
        file_name: String,
        chunk_index: u32,
        total_chunks: u32,
        chunk: &str,
    ) -> Vec<Action> {
        let key = (peer.clone(), file_name);
        let Some(entry) = self.inbound.get_mut(&key) else {
            tracing::warn!(%peer, file = %key.1, chunk_index, "chunk for unknown transfer dropped");
            return Vec::new();
        };
        match entry.transfer.accept_chunk(chunk_index, total_chunks, chunk) {
            Ok(progress) => {
                let record = &mut self.records[entry.record];
                record.progress = progress;
                vec![Action::Transfer(record.clone())]
            }
            Err(e) => {
                tracing::warn!(%peer, file = %key.1, error = %e, "bad chunk, transfer discarded");
                let record = entry.record;
                self.inbound.remove(&key);
                self.fail_record(record, &e)
            }
        }
    }

    fn on_file_complete(&mut self, peer: &PeerId, file_name: String) -> Vec<Action> {
        let key = (peer.clone(), file_name);
        let Some(entry) = self.inbound.remove(&key) else {
            tracing::warn!(%peer, file = %key.1, "completion for unknown transfer dropped");
            return Vec::new();
        };
        match entry.transfer.finish() {
            Ok(file) => {
                let record = &mut self.records[entry.record];
                record.progress = 100;
                record.status = TransferStatus::Completed;
                vec![
                    Action::Transfer(record.clone()),
                    Action::FileReceived {
                        peer: peer.clone(),
                        file,
                    },
                ]
            }
            Err(e) => {
                tracing::warn!(%peer, file = %key.1, error = %e, "transfer failed at completion");
                self.fail_record(entry.record, &e)
            }
        }
    }

    /// Discard every transfer with `peer`, reporting each as failed.
    fn drop_transfers(&mut self, peer: &PeerId) -> Vec<Action> {
        let mut failed: Vec<usize> = Vec::new();
        self.inbound.retain(|(p, _), e| {
            if p == peer {
                failed.push(e.record);
                false
            } else {
                true
            }
        });
        self.outbound.retain(|e| {
            if &e.peer == peer {
                failed.push(e.record);
                false
            } else {
                true
            }
        });
        failed.sort_unstable();
        failed
            .into_iter()
            .flat_map(|r| self.fail_record(r, &TransferError::ConnectionLost))
            .collect()
    }

    fn fail_record(&mut self, record: usize, err: &TransferError) -> Vec<Action> {
        let row = &mut self.records[record];
        row.status = TransferStatus::Failed(err.to_string());
        vec![Action::Transfer(row.clone())]
    }

    fn push_record(&mut self, record: TransferRecord) -> usize {
        self.records.push(record);
        self.records.len() - 1
    }

    fn map_all(&mut self, actions: Vec<ConnectionAction>) -> Vec<Action> {
        actions.into_iter().flat_map(|a| self.map(a)).collect()
    }

    fn map(&mut self, action: ConnectionAction) -> Vec<Action> {
        match action {
            ConnectionAction::Dial { peer, channel } => vec![Action::Dial { peer, channel }],
            ConnectionAction::Close { peer, channel } => vec![Action::CloseChannel { peer, channel }],
            ConnectionAction::Opened { peer, .. } => vec![Action::ConnectionOpened(peer)],
            ConnectionAction::Closed { peer, reason } => {
                let mut out = self.drop_transfers(&peer);
                out.push(Action::ConnectionClosed { peer, reason });
                out
            }
            ConnectionAction::Notice(n) => vec![Action::Notice(n)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::DEFAULT_MIME_TYPE;

    fn open_pair(now: Instant) -> (PeerSession, ChannelId, PeerId) {
        let mut s = PeerSession::new(PeerId::from("alice"));
        let bob = PeerId::from("bob");
        let actions = s.on_presence_announce(bob.clone(), now);
        let channel = actions
            .iter()
            .find_map(|a| match a {
                Action::Dial { channel, .. } => Some(*channel),
                _ => None,
            })
            .expect("alice dials bob");
        s.on_channel_open(&bob, channel);
        (s, channel, bob)
    }

    fn statuses(s: &PeerSession) -> Vec<TransferStatus> {
        s.transfers().iter().map(|r| r.status.clone()).collect()
    }

    #[test]
    fn discovery_precedes_dial() {
        let mut s = PeerSession::new(PeerId::from("alice"));
        let actions = s.on_presence_announce(PeerId::from("bob"), Instant::now());
        assert!(matches!(actions[0], Action::PeerDiscovered { .. }));
        assert!(matches!(actions[1], Action::Dial { .. }));
    }

    #[test]
    fn own_announcement_ignored() {
        let mut s = PeerSession::new(PeerId::from("alice"));
        assert!(s.on_presence_announce(PeerId::from("alice"), Instant::now()).is_empty());
        assert!(s.known_peers().is_empty());
    }

    #[test]
    fn peers_list_carries_endpoints() {
        let mut s = PeerSession::new(PeerId::from("zed"));
        let mut endpoints = std::collections::BTreeMap::new();
        endpoints.insert(PeerId::from("amy"), "10.0.0.2:7000".to_string());
        let actions = s.on_signal(
            SignalMessage::PeersList {
                peers: vec![PeerId::from("amy")],
                endpoints,
            },
            Instant::now(),
        );
        assert_eq!(
            actions,
            vec![Action::PeerDiscovered {
                peer: PeerId::from("amy"),
                endpoint: Some("10.0.0.2:7000".into())
            }]
        );
    }

    #[test]
    fn heartbeat_is_answered() {
        let mut s = PeerSession::new(PeerId::from("a"));
        assert_eq!(
            s.on_signal(SignalMessage::Heartbeat, Instant::now()),
            vec![Action::Signal(SignalMessage::Heartbeat)]
        );
    }

    #[test]
    fn swept_peer_left_once_and_channel_closed() {
        let t0 = Instant::now();
        let (mut s, channel, bob) = open_pair(t0);
        let actions = s.sweep_presence(t0 + Duration::from_secs(6));
        assert!(actions.contains(&Action::CloseChannel {
            peer: bob.clone(),
            channel
        }));
        assert_eq!(
            actions.iter().filter(|a| matches!(a, Action::PeerLeft(_))).count(),
            1
        );
        assert!(s.sweep_presence(t0 + Duration::from_secs(12)).is_empty());
        assert!(s.live_peers().is_empty());
    }

    #[test]
    fn outbound_pump_sends_in_order() {
        let now = Instant::now();
        let (mut s, _, bob) = open_pair(now);
        s.config.chunk_size = 16;
        let bytes: Vec<u8> = (0..40u8).collect();
        s.send_payload(&[bob.clone()], Payload::new("x.bin", DEFAULT_MIME_TYPE, bytes));
        let mut kinds = Vec::new();
        while s.has_pending_outbound() {
            for a in s.pump_outbound() {
                if let Action::SendData { message, .. } = a {
                    kinds.push(match message {
                        DataMessage::FileMetadata { .. } => "meta",
                        DataMessage::FileChunk { .. } => "chunk",
                        DataMessage::FileComplete { .. } => "complete",
                        DataMessage::ChatMessage { .. } => "chat",
                    });
                }
            }
        }
        assert_eq!(kinds, vec!["meta", "chunk", "chunk", "chunk", "complete"]);
        assert_eq!(statuses(&s), vec![TransferStatus::Completed]);
        assert_eq!(s.transfers()[0].progress, 100);
    }

    #[test]
    fn send_to_unconnected_peer_is_notice() {
        let mut s = PeerSession::new(PeerId::from("a"));
        let actions = s.send_payload(&[PeerId::from("b")], Payload::new("f", DEFAULT_MIME_TYPE, vec![1u8]));
        assert!(matches!(
            actions.as_slice(),
            [Action::Notice(Notice { kind: NoticeKind::NotConnected, .. })]
        ));
        assert!(s.transfers().is_empty());
    }

    #[test]
    fn stale_channel_data_dropped() {
        let now = Instant::now();
        let (mut s, channel, bob) = open_pair(now);
        let msg = DataMessage::FileComplete { file_name: "f".into() };
        assert!(s.on_data(&bob, channel + 100, msg).is_empty());
    }

    #[test]
    fn new_metadata_supersedes_in_progress() {
        let now = Instant::now();
        let (mut s, channel, bob) = open_pair(now);
        let meta = DataMessage::FileMetadata {
            file_name: "f".into(),
            file_size: 10,
            file_type: DEFAULT_MIME_TYPE.into(),
            total_chunks: 1,
            checksum: None,
        };
        s.on_data(&bob, channel, meta.clone());
        s.on_data(&bob, channel, meta);
        assert!(matches!(statuses(&s)[0], TransferStatus::Failed(_)));
        assert_eq!(statuses(&s)[1], TransferStatus::InProgress);
    }

    #[test]
    fn chat_fans_out_and_dedupes() {
        let now = Instant::now();
        let (mut s, channel, bob) = open_pair(now);
        let (msg, actions) = s.send_chat_message("hello");
        assert_eq!(actions.len(), 1);
        assert_eq!(s.chat_messages().len(), 1);

        let remote = ChatMessage::new(bob.clone(), "hi back");
        let got = s.on_data(&bob, channel, DataMessage::ChatMessage { message: remote.clone() });
        assert_eq!(got, vec![Action::ChatReceived(remote.clone())]);
        assert!(s.on_data(&bob, channel, DataMessage::ChatMessage { message: remote }).is_empty());
        assert_eq!(s.chat_messages()[0], msg);
    }

    #[test]
    fn link_status_changes_reported_once() {
        let mut s = PeerSession::new(PeerId::from("a"));
        assert!(s.set_link_status(LinkStatus::Initializing).is_none());
        assert_eq!(
            s.set_link_status(LinkStatus::Connected),
            Some(Action::LinkStatusChanged(LinkStatus::Connected))
        );
        assert!(s.set_link_status(LinkStatus::Connected).is_none());
    }

    fn roster(names: &[&str]) -> SignalMessage {
        SignalMessage::PeersList {
            peers: names.iter().map(|n| PeerId::from(*n)).collect(),
            endpoints: Default::default(),
        }
    }

    #[test]
    fn peers_missing_from_fresh_roster_are_dropped() {
        let now = Instant::now();
        let mut s = PeerSession::new(PeerId::from("zed"));
        s.on_signal(roster(&["ghost", "amy"]), now);
        s.on_signal(
            SignalMessage::PeerJoined {
                peer_id: PeerId::from("bea"),
                endpoint: None,
            },
            now,
        );

        // Signaling link dropped; ghost left meanwhile. The reconnect roster no longer lists it.
        let actions = s.on_signal(roster(&["amy", "bea", "zed"]), now);
        assert_eq!(actions, vec![Action::PeerLeft(PeerId::from("ghost"))]);
        let mut known = s.known_peers();
        known.sort();
        assert_eq!(known, vec![PeerId::from("amy"), PeerId::from("bea")]);

        assert!(s.on_signal(roster(&["amy", "bea"]), now).is_empty());
    }

    #[test]
    fn roster_leaves_lan_only_peers_alone() {
        let now = Instant::now();
        let mut s = PeerSession::new(PeerId::from("zed"));
        s.on_presence_announce(PeerId::from("lan-peer"), now);
        assert!(s.on_signal(roster(&[]), now).is_empty());
        assert_eq!(s.known_peers(), vec![PeerId::from("lan-peer")]);
    }

    #[test]
    fn same_name_sends_to_one_peer_are_serialized() {
        let now = Instant::now();
        let (mut alice, _, bob_id) = open_pair(now);
        alice.config.chunk_size = 8;
        let alice_id = alice.local_id().clone();
        let mut bob = PeerSession::new(bob_id.clone());
        let (bob_ch, rejected) = bob.on_incoming_channel(&alice_id, now);
        assert!(rejected.is_empty());
        bob.on_channel_open(&alice_id, bob_ch);

        let first: Vec<u8> = b"first payload, twenty".to_vec();
        let second: Vec<u8> = b"second payload, other".to_vec();
        alice.send_payload(&[bob_id.clone()], Payload::new("x.txt", "text/plain", first.clone()));
        alice.send_payload(&[bob_id.clone()], Payload::new("x.txt", "text/plain", second.clone()));

        let mut delivered = Vec::new();
        while alice.has_pending_outbound() {
            for action in alice.pump_outbound() {
                if let Action::SendData { message, .. } = action {
                    for got in bob.on_data(&alice_id, bob_ch, message) {
                        if let Action::FileReceived { file, .. } = got {
                            delivered.push(file.bytes);
                        }
                    }
                }
            }
        }
        assert_eq!(delivered, vec![first, second]);
        assert_eq!(statuses(&alice), vec![TransferStatus::Completed, TransferStatus::Completed]);
        assert_eq!(statuses(&bob), vec![TransferStatus::Completed, TransferStatus::Completed]);
    }

    #[test]
    fn every_accepted_chunk_reports_progress() {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        let now = Instant::now();
        let (mut s, channel, bob) = open_pair(now);
        s.on_data(
            &bob,
            channel,
            DataMessage::FileMetadata {
                file_name: "big".into(),
                file_size: 1000,
                file_type: DEFAULT_MIME_TYPE.into(),
                total_chunks: 1000,
                checksum: None,
            },
        );
        // 1 of 1000 and 2 of 1000 both round down to 0%, yet each chunk is reported.
        for index in 0..2u32 {
            let actions = s.on_data(
                &bob,
                channel,
                DataMessage::FileChunk {
                    file_name: "big".into(),
                    chunk_index: index,
                    total_chunks: 1000,
                    chunk: STANDARD.encode([index as u8]),
                },
            );
            assert!(matches!(actions.as_slice(), [Action::Transfer(r)] if r.progress == 0));
        }
    }

    #[test]
    fn shutdown_closes_and_disconnects() {
        let now = Instant::now();
        let (mut s, channel, bob) = open_pair(now);
        let actions = s.shutdown(true);
        assert!(actions.contains(&Action::CloseChannel { peer: bob, channel }));
        assert!(matches!(actions.last(), Some(Action::Signal(SignalMessage::Disconnect { .. }))));
    }
}
