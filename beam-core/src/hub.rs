//! Signal hub: server-side signaling state. One instance per server, owned by a single task.
//! Host passes session events, hub returns send/terminate actions.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::identity::PeerId;
use crate::protocol::SignalMessage;
use crate::wire;

/// Interval between heartbeat probes.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// A session silent for longer than this is terminated.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// Transport handle for one connected client, allocated by the host.
pub type SessionId = u64;

/// Action for the host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubAction {
    Send(SessionId, SignalMessage),
    /// Close the transport. No further messages are routed to this session.
    Terminate(SessionId),
}

struct Registration {
    peer_id: PeerId,
    endpoint: Option<String>,
    seq: u64,
}

struct Session {
    registration: Option<Registration>,
    last_activity: Instant,
}

pub struct SignalHub {
    sessions: HashMap<SessionId, Session>,
    by_peer: HashMap<PeerId, SessionId>,
    next_seq: u64,
    session_timeout: Duration,
}

impl SignalHub {
    pub fn new(session_timeout: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            by_peer: HashMap::new(),
            next_seq: 0,
            session_timeout,
        }
    }

    /// New transport connection. Not yet associated with an identity.
    pub fn on_connect(&mut self, session: SessionId, now: Instant) {
        self.sessions.insert(
            session,
            Session {
                registration: None,
                last_activity: now,
            },
        );
    }

    /// Transport-level traffic that carries no message (ping/pong). Refreshes liveness.
    pub fn on_activity(&mut self, session: SessionId, now: Instant) {
        if let Some(s) = self.sessions.get_mut(&session) {
            s.last_activity = now;
        }
    }

    /// Raw text frame from a client. Malformed input is logged and dropped.
    pub fn on_text(&mut self, session: SessionId, text: &str, now: Instant) -> Vec<HubAction> {
        if !self.sessions.contains_key(&session) {
            return vec![];
        }
        self.on_activity(session, now);
        match wire::decode_signal(text) {
            Ok(msg) => self.on_message(session, msg, now),
            Err(e) => {
                tracing::warn!(session, error = %e, "dropping malformed signaling message");
                vec![]
            }
        }
    }

    /// Decoded message from a client.
    pub fn on_message(&mut self, session: SessionId, msg: SignalMessage, now: Instant) -> Vec<HubAction> {
        if !self.sessions.contains_key(&session) {
            return vec![];
        }
        self.on_activity(session, now);
        match msg {
            SignalMessage::Register { peer_id, endpoint } => self.register(session, peer_id, endpoint),
            SignalMessage::Disconnect { peer_id } => self.disconnect(session, &peer_id),
            SignalMessage::Heartbeat => vec![],
            other => {
                tracing::warn!(session, message = ?other, "dropping server-bound message of unexpected type");
                vec![]
            }
        }
    }

    /// Transport closed without an explicit `disconnect`. Treated identically to one.
    pub fn on_closed(&mut self, session: SessionId) -> Vec<HubAction> {
        let Some(s) = self.sessions.remove(&session) else {
            return vec![];
        };
        let mut actions = Vec::new();
        if let Some(reg) = s.registration {
            if self.by_peer.get(&reg.peer_id) == Some(&session) {
                self.by_peer.remove(&reg.peer_id);
                tracing::info!(peer = %reg.peer_id, "peer session closed");
                actions.extend(self.broadcast(None, SignalMessage::PeerLeft { peer_id: reg.peer_id }));
            }
        }
        actions
    }

    /// Liveness probe. Terminates silent sessions and heartbeats the rest.
    pub fn probe(&mut self, now: Instant) -> Vec<HubAction> {
        let mut ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        ids.sort_unstable();

        let timeout = self.session_timeout;
        let (expired, alive): (Vec<SessionId>, Vec<SessionId>) = ids.into_iter().partition(|id| {
            self.sessions
                .get(id)
                .map(|s| now.saturating_duration_since(s.last_activity) > timeout)
                .unwrap_or(false)
        });

        let mut departed = Vec::new();
        let mut actions = Vec::new();
        for id in expired {
            if let Some(s) = self.sessions.remove(&id) {
                actions.push(HubAction::Terminate(id));
                if let Some(reg) = s.registration {
                    if self.by_peer.get(&reg.peer_id) == Some(&id) {
                        self.by_peer.remove(&reg.peer_id);
                        tracing::info!(peer = %reg.peer_id, "session timed out");
                        departed.push(reg.peer_id);
                    }
                }
            }
        }
        for id in alive {
            actions.push(HubAction::Send(id, SignalMessage::Heartbeat));
        }
        for peer_id in departed {
            actions.extend(self.broadcast(None, SignalMessage::PeerLeft { peer_id }));
        }
        actions
    }

    /// Registered identities in registration order.
    pub fn registered_peers(&self) -> Vec<PeerId> {
        self.registrations_in_order()
            .into_iter()
            .map(|(_, reg)| reg.peer_id.clone())
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn register(&mut self, session: SessionId, peer_id: PeerId, endpoint: Option<String>) -> Vec<HubAction> {
        let mut actions = Vec::new();

        let previous = self
            .sessions
            .get_mut(&session)
            .and_then(|s| s.registration.take());
        if let Some(prev) = previous {
            if prev.peer_id != peer_id && self.by_peer.get(&prev.peer_id) == Some(&session) {
                self.by_peer.remove(&prev.peer_id);
                actions.extend(self.broadcast(Some(session), SignalMessage::PeerLeft { peer_id: prev.peer_id }));
            }
        }

        if let Some(&holder) = self.by_peer.get(&peer_id) {
            if holder != session {
                tracing::info!(peer = %peer_id, old = holder, new = session, "identity re-registered; superseding old session");
                self.sessions.remove(&holder);
                actions.push(HubAction::Terminate(holder));
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(s) = self.sessions.get_mut(&session) {
            s.registration = Some(Registration {
                peer_id: peer_id.clone(),
                endpoint: endpoint.clone(),
                seq,
            });
        }
        self.by_peer.insert(peer_id.clone(), session);
        tracing::info!(peer = %peer_id, total = self.by_peer.len(), "peer registered");

        actions.extend(self.broadcast(
            Some(session),
            SignalMessage::PeerJoined {
                peer_id: peer_id.clone(),
                endpoint,
            },
        ));

        let mut peers = Vec::new();
        let mut endpoints = BTreeMap::new();
        for (id, reg) in self.registrations_in_order() {
            if id == session {
                continue;
            }
            peers.push(reg.peer_id.clone());
            if let Some(ep) = &reg.endpoint {
                endpoints.insert(reg.peer_id.clone(), ep.clone());
            }
        }
        actions.push(HubAction::Send(session, SignalMessage::PeersList { peers, endpoints }));
        actions
    }

    fn disconnect(&mut self, session: SessionId, peer_id: &PeerId) -> Vec<HubAction> {
        let owns = self
            .sessions
            .get(&session)
            .and_then(|s| s.registration.as_ref())
            .map(|reg| &reg.peer_id == peer_id)
            .unwrap_or(false);
        if !owns {
            tracing::warn!(session, peer = %peer_id, "disconnect for an identity this session does not hold");
            return vec![];
        }
        if let Some(s) = self.sessions.get_mut(&session) {
            s.registration = None;
        }
        self.by_peer.remove(peer_id);
        tracing::info!(peer = %peer_id, "peer disconnected");
        self.broadcast(Some(session), SignalMessage::PeerLeft { peer_id: peer_id.clone() })
    }

    /// Send `msg` to every registered session except `exclude`.
    fn broadcast(&self, exclude: Option<SessionId>, msg: SignalMessage) -> Vec<HubAction> {
        self.registrations_in_order()
            .into_iter()
            .filter(|(id, _)| Some(*id) != exclude)
            .map(|(id, _)| HubAction::Send(id, msg.clone()))
            .collect()
    }

    fn registrations_in_order(&self) -> Vec<(SessionId, &Registration)> {
        let mut regs: Vec<(SessionId, &Registration)> = self
            .sessions
            .iter()
            .filter_map(|(id, s)| s.registration.as_ref().map(|r| (*id, r)))
            .collect();
        regs.sort_by_key(|(_, r)| r.seq);
        regs
    }
}

impl Default for SignalHub {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TIMEOUT)
    }
}
