//! Connection manager: one direct channel per remote peer.
//!
//! The side with the lexicographically lesser identity dials on discovery; the other waits.
//! If two channels for the same peer coexist anyway (manual connect, re-dial, races), the
//! channel whose initiator has the lesser identity survives; for two channels from the same
//! initiator the newer one survives. Both ends apply the same rule and agree on the survivor.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::identity::PeerId;

/// Default bound on a single connection attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Manager-allocated handle naming one direct channel.
pub type ChannelId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

/// Peer-scoped, dismissable report. Never affects the local link status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub peer: PeerId,
    pub kind: NoticeKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeKind {
    SelfConnect,
    AlreadyActive,
    Unreachable(String),
    TimedOut,
    NotConnected,
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            NoticeKind::SelfConnect => write!(f, "cannot connect to own identity {}", self.peer),
            NoticeKind::AlreadyActive => write!(f, "already connected or connecting to {}", self.peer),
            NoticeKind::Unreachable(cause) => write!(f, "peer {} unreachable: {cause}", self.peer),
            NoticeKind::TimedOut => write!(f, "connection to {} timed out", self.peer),
            NoticeKind::NotConnected => write!(f, "no open connection to {}", self.peer),
        }
    }
}

/// What the host must do (Dial, Close) or observe (Opened, Closed, Notice).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    Dial { peer: PeerId, channel: ChannelId },
    Close { peer: PeerId, channel: ChannelId },
    Opened { peer: PeerId, channel: ChannelId },
    /// An Open channel left the live set; its in-flight transfers are void.
    Closed { peer: PeerId, reason: Option<String> },
    Notice(Notice),
}

#[derive(Debug, Clone)]
struct Channel {
    id: ChannelId,
    initiator: PeerId,
    state: ConnectionState,
    started_at: Instant,
    ended_at: Option<Instant>,
}

#[derive(Debug)]
struct PeerEntry {
    channel: Channel,
    last_error: Option<String>,
}

pub struct ConnectionManager {
    local: PeerId,
    connect_timeout: Duration,
    redial_cooldown: Duration,
    next_channel: ChannelId,
    peers: HashMap<PeerId, PeerEntry>,
    live: Vec<PeerId>,
}

impl ConnectionManager {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            redial_cooldown: DEFAULT_CONNECT_TIMEOUT,
            next_channel: 1,
            peers: HashMap::new(),
            live: Vec::new(),
        }
    }

    pub fn set_connect_timeout(&mut self, timeout: Duration) {
        self.connect_timeout = timeout;
    }

    /// Minimum time after a channel ended before discovery may dial the same peer again.
    pub fn set_redial_cooldown(&mut self, cooldown: Duration) {
        self.redial_cooldown = cooldown;
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local
    }

    /// Peer seen via presence or signaling. Dials only if we hold the lesser identity.
    pub fn on_peer_discovered(&mut self, peer: &PeerId, now: Instant) -> Vec<ConnectionAction> {
        if *peer == self.local || !self.local.initiates_to(peer) {
            return Vec::new();
        }
        match self.peers.get(peer) {
            Some(entry) if !entry.channel.state.is_terminal() => Vec::new(),
            Some(entry)
                if entry
                    .channel
                    .ended_at
                    .is_some_and(|t| now.saturating_duration_since(t) < self.redial_cooldown) =>
            {
                Vec::new()
            }
            _ => vec![self.dial(peer, now)],
        }
    }

    /// Manual connect: initiates regardless of identity order.
    pub fn connect_to(&mut self, peer: &PeerId, now: Instant) -> Vec<ConnectionAction> {
        if *peer == self.local {
            return vec![notice(peer, NoticeKind::SelfConnect)];
        }
        if self.is_active(peer) {
            return vec![notice(peer, NoticeKind::AlreadyActive)];
        }
        vec![self.dial(peer, now)]
    }

    /// Remote peer opened a channel to us. Returns the channel id the host must tag it with,
    /// plus actions; a `Close` for that id means the channel lost arbitration.
    pub fn on_incoming_channel(&mut self, peer: &PeerId, now: Instant) -> (ChannelId, Vec<ConnectionAction>) {
        let id = self.alloc_channel();
        let incoming = Channel {
            id,
            initiator: peer.clone(),
            state: ConnectionState::Connecting,
            started_at: now,
            ended_at: None,
        };
        if *peer == self.local {
            return (id, vec![ConnectionAction::Close { peer: peer.clone(), channel: id }]);
        }
        let existing = match self.peers.get(peer) {
            Some(entry) if !entry.channel.state.is_terminal() => entry.channel.clone(),
            _ => {
                self.install(peer, incoming);
                return (id, Vec::new());
            }
        };

        let incoming_wins = if existing.initiator == incoming.initiator {
            true
        } else {
            incoming.initiator < existing.initiator
        };
        if !incoming_wins {
            tracing::debug!(%peer, channel = id, kept = existing.id, "duplicate channel rejected");
            return (id, vec![ConnectionAction::Close { peer: peer.clone(), channel: id }]);
        }

        tracing::debug!(%peer, channel = id, replaced = existing.id, "duplicate channel replaces existing");
        let mut actions = vec![ConnectionAction::Close {
            peer: peer.clone(),
            channel: existing.id,
        }];
        if existing.state == ConnectionState::Open {
            self.live.retain(|p| p != peer);
            actions.push(ConnectionAction::Closed {
                peer: peer.clone(),
                reason: Some("replaced by duplicate channel".to_string()),
            });
        }
        self.install(peer, incoming);
        (id, actions)
    }

    /// Handshake finished. Stale channel ids are ignored.
    pub fn on_channel_open(&mut self, peer: &PeerId, channel: ChannelId) -> Vec<ConnectionAction> {
        let Some(entry) = self.current_mut(peer, channel) else {
            tracing::debug!(%peer, channel, "open event for stale channel ignored");
            return Vec::new();
        };
        if entry.channel.state != ConnectionState::Connecting {
            return Vec::new();
        }
        entry.channel.state = ConnectionState::Open;
        entry.last_error = None;
        self.live.push(peer.clone());
        vec![ConnectionAction::Opened {
            peer: peer.clone(),
            channel,
        }]
    }

    /// Graceful teardown reported by the transport.
    pub fn on_channel_closed(&mut self, peer: &PeerId, channel: ChannelId, now: Instant) -> Vec<ConnectionAction> {
        let Some(entry) = self.current_mut(peer, channel) else {
            return Vec::new();
        };
        let was = entry.channel.state;
        if was.is_terminal() {
            return Vec::new();
        }
        entry.channel.state = ConnectionState::Closed;
        entry.channel.ended_at = Some(now);
        match was {
            ConnectionState::Open => {
                self.live.retain(|p| p != peer);
                vec![ConnectionAction::Closed {
                    peer: peer.clone(),
                    reason: None,
                }]
            }
            _ => {
                let cause = "closed before open".to_string();
                entry.last_error = Some(cause.clone());
                vec![notice(peer, NoticeKind::Unreachable(cause))]
            }
        }
    }

    /// Transport error on a channel: Failed, removed from live set, notice raised.
    pub fn on_channel_error(
        &mut self,
        peer: &PeerId,
        channel: ChannelId,
        cause: &str,
        now: Instant,
    ) -> Vec<ConnectionAction> {
        let Some(entry) = self.current_mut(peer, channel) else {
            tracing::debug!(%peer, channel, "error for stale channel ignored");
            return Vec::new();
        };
        let was = entry.channel.state;
        if was.is_terminal() {
            return Vec::new();
        }
        entry.channel.state = ConnectionState::Failed;
        entry.channel.ended_at = Some(now);
        entry.last_error = Some(cause.to_string());
        let mut actions = vec![ConnectionAction::Close {
            peer: peer.clone(),
            channel,
        }];
        if was == ConnectionState::Open {
            self.live.retain(|p| p != peer);
            actions.push(ConnectionAction::Closed {
                peer: peer.clone(),
                reason: Some(cause.to_string()),
            });
        }
        actions.push(notice(peer, NoticeKind::Unreachable(cause.to_string())));
        actions
    }

    /// Peer announced departure or was swept: tear down whatever channel we hold.
    pub fn on_peer_departed(&mut self, peer: &PeerId) -> Vec<ConnectionAction> {
        let Some(entry) = self.peers.remove(peer) else {
            return Vec::new();
        };
        let mut actions = Vec::new();
        if !entry.channel.state.is_terminal() {
            actions.push(ConnectionAction::Close {
                peer: peer.clone(),
                channel: entry.channel.id,
            });
        }
        if entry.channel.state == ConnectionState::Open {
            self.live.retain(|p| p != peer);
            actions.push(ConnectionAction::Closed {
                peer: peer.clone(),
                reason: Some("peer left".to_string()),
            });
        }
        actions
    }

    /// Expire connection attempts older than the connect timeout.
    pub fn tick(&mut self, now: Instant) -> Vec<ConnectionAction> {
        let timeout = self.connect_timeout;
        let mut expired: Vec<(PeerId, ChannelId)> = self
            .peers
            .iter()
            .filter(|(_, e)| {
                e.channel.state == ConnectionState::Connecting
                    && now.saturating_duration_since(e.channel.started_at) > timeout
            })
            .map(|(p, e)| (p.clone(), e.channel.id))
            .collect();
        expired.sort();
        let mut actions = Vec::new();
        for (peer, channel) in expired {
            if let Some(entry) = self.peers.get_mut(&peer) {
                entry.channel.state = ConnectionState::Failed;
                entry.channel.ended_at = Some(now);
                entry.last_error = Some("connection attempt timed out".to_string());
            }
            tracing::debug!(%peer, channel, "connection attempt timed out");
            actions.push(ConnectionAction::Close {
                peer: peer.clone(),
                channel,
            });
            actions.push(notice(&peer, NoticeKind::TimedOut));
        }
        actions
    }

    /// Close every channel (shutdown).
    pub fn close_all(&mut self) -> Vec<ConnectionAction> {
        let mut peers: Vec<PeerId> = self.peers.keys().cloned().collect();
        peers.sort();
        peers.iter().flat_map(|p| self.on_peer_departed(p)).collect()
    }

    /// Peers with an Open channel, in the order they opened.
    pub fn live_peers(&self) -> &[PeerId] {
        &self.live
    }

    pub fn is_open(&self, peer: &PeerId) -> bool {
        self.state(peer) == Some(ConnectionState::Open)
    }

    pub fn is_active(&self, peer: &PeerId) -> bool {
        self.state(peer).is_some_and(|s| !s.is_terminal())
    }

    pub fn state(&self, peer: &PeerId) -> Option<ConnectionState> {
        self.peers.get(peer).map(|e| e.channel.state)
    }

    /// Channel currently bound to `peer`, if it is Open.
    pub fn open_channel(&self, peer: &PeerId) -> Option<ChannelId> {
        self.peers
            .get(peer)
            .filter(|e| e.channel.state == ConnectionState::Open)
            .map(|e| e.channel.id)
    }

    /// Most recent error for `peer`; cleared when a channel opens.
    pub fn last_error(&self, peer: &PeerId) -> Option<&str> {
        self.peers.get(peer).and_then(|e| e.last_error.as_deref())
    }

    fn dial(&mut self, peer: &PeerId, now: Instant) -> ConnectionAction {
        let id = self.alloc_channel();
        let channel = Channel {
            id,
            initiator: self.local.clone(),
            state: ConnectionState::Connecting,
            started_at: now,
            ended_at: None,
        };
        self.install(peer, channel);
        tracing::debug!(%peer, channel = id, "dialing");
        ConnectionAction::Dial {
            peer: peer.clone(),
            channel: id,
        }
    }

    fn install(&mut self, peer: &PeerId, channel: Channel) {
        let last_error = self.peers.remove(peer).and_then(|e| e.last_error);
        self.peers.insert(peer.clone(), PeerEntry { channel, last_error });
    }

    fn current_mut(&mut self, peer: &PeerId, channel: ChannelId) -> Option<&mut PeerEntry> {
        self.peers.get_mut(peer).filter(|e| e.channel.id == channel)
    }

    fn alloc_channel(&mut self) -> ChannelId {
        let id = self.next_channel;
        self.next_channel += 1;
        id
    }
}

fn notice(peer: &PeerId, kind: NoticeKind) -> ConnectionAction {
    ConnectionAction::Notice(Notice {
        peer: peer.clone(),
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dialed(actions: &[ConnectionAction]) -> Option<ChannelId> {
        actions.iter().find_map(|a| match a {
            ConnectionAction::Dial { channel, .. } => Some(*channel),
            _ => None,
        })
    }

    fn closes(actions: &[ConnectionAction], id: ChannelId) -> bool {
        actions
            .iter()
            .any(|a| matches!(a, ConnectionAction::Close { channel, .. } if *channel == id))
    }

    #[test]
    fn lesser_identity_initiates() {
        let now = Instant::now();
        let alice = PeerId::from("alice");
        let bob = PeerId::from("bob");
        let mut a = ConnectionManager::new(alice.clone());
        let mut b = ConnectionManager::new(bob.clone());
        assert!(dialed(&a.on_peer_discovered(&bob, now)).is_some());
        assert!(b.on_peer_discovered(&alice, now).is_empty());
        assert_eq!(a.state(&bob), Some(ConnectionState::Connecting));
        assert_eq!(b.state(&alice), None);
    }

    #[test]
    fn rediscovery_while_active_is_noop() {
        let now = Instant::now();
        let mut a = ConnectionManager::new(PeerId::from("a"));
        let b = PeerId::from("b");
        a.on_peer_discovered(&b, now);
        assert!(a.on_peer_discovered(&b, now).is_empty());
    }

    #[test]
    fn open_adds_to_live_set_in_order() {
        let now = Instant::now();
        let mut a = ConnectionManager::new(PeerId::from("a"));
        let c = PeerId::from("c");
        let b = PeerId::from("b");
        let ch_c = dialed(&a.on_peer_discovered(&c, now)).unwrap();
        let ch_b = dialed(&a.on_peer_discovered(&b, now)).unwrap();
        a.on_channel_open(&c, ch_c);
        a.on_channel_open(&b, ch_b);
        assert_eq!(a.live_peers(), &[c.clone(), b.clone()]);
        assert_eq!(a.open_channel(&b), Some(ch_b));
    }

    #[test]
    fn simultaneous_connects_keep_lesser_initiator_on_both_sides() {
        let now = Instant::now();
        let alice = PeerId::from("alice");
        let bob = PeerId::from("bob");
        let mut a = ConnectionManager::new(alice.clone());
        let mut b = ConnectionManager::new(bob.clone());

        let a_out = dialed(&a.connect_to(&bob, now)).unwrap();
        let b_out = dialed(&b.connect_to(&alice, now)).unwrap();

        // Alice receives Bob's channel: hers (initiator alice) survives.
        let (a_in, actions) = a.on_incoming_channel(&bob, now);
        assert!(closes(&actions, a_in));
        assert!(!closes(&actions, a_out));

        // Bob receives Alice's channel: it replaces his own dial.
        let (b_in, actions) = b.on_incoming_channel(&alice, now);
        assert!(closes(&actions, b_out));
        assert!(!closes(&actions, b_in));

        a.on_channel_open(&bob, a_out);
        b.on_channel_open(&alice, b_in);
        // Late open for the losing dial is ignored.
        assert!(b.on_channel_open(&alice, b_out).is_empty());
        assert_eq!(a.live_peers(), &[bob]);
        assert_eq!(b.live_peers(), &[alice]);
    }

    #[test]
    fn redial_from_same_initiator_replaces_open_channel() {
        let now = Instant::now();
        let mut b = ConnectionManager::new(PeerId::from("b"));
        let a = PeerId::from("a");
        let (first, _) = b.on_incoming_channel(&a, now);
        b.on_channel_open(&a, first);
        let (second, actions) = b.on_incoming_channel(&a, now);
        assert!(closes(&actions, first));
        assert!(actions
            .iter()
            .any(|x| matches!(x, ConnectionAction::Closed { .. })));
        assert!(b.live_peers().is_empty());
        b.on_channel_open(&a, second);
        assert_eq!(b.open_channel(&a), Some(second));
    }

    #[test]
    fn connect_to_self_or_active_is_notice() {
        let now = Instant::now();
        let me = PeerId::from("me");
        let other = PeerId::from("other");
        let mut m = ConnectionManager::new(me.clone());
        assert!(matches!(
            m.connect_to(&me, now).as_slice(),
            [ConnectionAction::Notice(Notice { kind: NoticeKind::SelfConnect, .. })]
        ));
        m.connect_to(&other, now);
        assert!(matches!(
            m.connect_to(&other, now).as_slice(),
            [ConnectionAction::Notice(Notice { kind: NoticeKind::AlreadyActive, .. })]
        ));
    }

    #[test]
    fn attempt_times_out_then_redials_after_cooldown() {
        let t0 = Instant::now();
        let mut a = ConnectionManager::new(PeerId::from("a"));
        let b = PeerId::from("b");
        let ch = dialed(&a.on_peer_discovered(&b, t0)).unwrap();
        assert!(a.tick(t0 + Duration::from_secs(4)).is_empty());
        let t1 = t0 + Duration::from_secs(6);
        let actions = a.tick(t1);
        assert!(closes(&actions, ch));
        assert!(actions.iter().any(
            |x| matches!(x, ConnectionAction::Notice(Notice { kind: NoticeKind::TimedOut, .. }))
        ));
        assert_eq!(a.state(&b), Some(ConnectionState::Failed));
        assert!(a.last_error(&b).is_some());
        // Late open from the timed-out attempt is ignored.
        assert!(a.on_channel_open(&b, ch).is_empty());
        assert!(a.on_peer_discovered(&b, t1 + Duration::from_secs(1)).is_empty());
        let again = a.on_peer_discovered(&b, t1 + DEFAULT_CONNECT_TIMEOUT);
        assert!(dialed(&again).is_some());
    }

    #[test]
    fn error_on_open_channel_removes_from_live_set() {
        let now = Instant::now();
        let mut a = ConnectionManager::new(PeerId::from("a"));
        let b = PeerId::from("b");
        let ch = dialed(&a.on_peer_discovered(&b, now)).unwrap();
        a.on_channel_open(&b, ch);
        let actions = a.on_channel_error(&b, ch, "reset", now);
        assert!(actions.iter().any(|x| matches!(x, ConnectionAction::Closed { .. })));
        assert!(a.live_peers().is_empty());
        assert_eq!(a.state(&b), Some(ConnectionState::Failed));
        // Second report for the same channel is a no-op.
        assert!(a.on_channel_error(&b, ch, "reset", now).is_empty());
        assert!(a.on_channel_closed(&b, ch, now).is_empty());
    }

    #[test]
    fn graceful_close_and_open_clears_error() {
        let now = Instant::now();
        let mut a = ConnectionManager::new(PeerId::from("a"));
        let b = PeerId::from("b");
        let ch = dialed(&a.connect_to(&b, now)).unwrap();
        a.on_channel_error(&b, ch, "refused", now);
        assert_eq!(a.last_error(&b), Some("refused"));
        let ch2 = dialed(&a.connect_to(&b, now)).unwrap();
        a.on_channel_open(&b, ch2);
        assert_eq!(a.last_error(&b), None);
        let actions = a.on_channel_closed(&b, ch2, now);
        assert_eq!(
            actions,
            vec![ConnectionAction::Closed {
                peer: b.clone(),
                reason: None
            }]
        );
        assert_eq!(a.state(&b), Some(ConnectionState::Closed));
    }

    #[test]
    fn departure_tears_down_channel() {
        let now = Instant::now();
        let mut a = ConnectionManager::new(PeerId::from("a"));
        let b = PeerId::from("b");
        let ch = dialed(&a.on_peer_discovered(&b, now)).unwrap();
        a.on_channel_open(&b, ch);
        let actions = a.on_peer_departed(&b);
        assert!(closes(&actions, ch));
        assert!(a.live_peers().is_empty());
        assert_eq!(a.state(&b), None);
        assert!(a.on_peer_departed(&b).is_empty());
    }
}
