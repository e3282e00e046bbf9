//! LAN discovery: UDP multicast presence announcements and leave frames.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use beam_core::wire::{decode_presence, encode_presence};
use beam_core::{PeerId, PresenceFrame, PROTOCOL_VERSION};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::node::NodeEvent;

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 60);
/// Interval between self-announcements.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1);

/// Running discovery. Dropping it stops both loops.
pub struct Discovery {
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
    local: PeerId,
    tasks: Vec<JoinHandle<()>>,
}

impl Discovery {
    /// Join the multicast group and start announcing `transport_port`.
    pub async fn start(
        local: PeerId,
        discovery_port: u16,
        transport_port: u16,
        events: mpsc::UnboundedSender<NodeEvent>,
    ) -> std::io::Result<Self> {
        let socket = Arc::new(make_multicast_socket(discovery_port)?);
        let dest = SocketAddr::from((MULTICAST_GROUP, discovery_port));
        let announce = encode_presence(&PresenceFrame::Announce {
            protocol_version: PROTOCOL_VERSION,
            peer_id: local.clone(),
            listen_port: transport_port,
        })
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let announce_task = tokio::spawn(announce_loop(socket.clone(), announce, dest));
        let recv_task = tokio::spawn(recv_loop(socket.clone(), local.clone(), events));
        tracing::info!(port = discovery_port, "LAN discovery started");
        Ok(Self {
            socket,
            dest,
            local,
            tasks: vec![announce_task, recv_task],
        })
    }

    /// Announce graceful departure.
    pub async fn send_leave(&self) {
        let frame = match encode_presence(&PresenceFrame::Leave {
            peer_id: self.local.clone(),
        }) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode leave frame");
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&frame, self.dest).await {
            tracing::debug!(error = %e, "failed to send leave frame");
        }
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_multicast_loop_v4(true)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn announce_loop(socket: Arc<UdpSocket>, frame: Vec<u8>, dest: SocketAddr) {
    let mut interval = tokio::time::interval(ANNOUNCE_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = socket.send_to(&frame, dest).await {
            tracing::debug!(error = %e, "announce failed");
        }
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, local: PeerId, events: mpsc::UnboundedSender<NodeEvent>) {
    let mut buf = vec![0u8; 65536];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(x) => x,
            Err(e) => {
                tracing::warn!(error = %e, "discovery receive failed");
                tokio::time::sleep(ANNOUNCE_INTERVAL).await;
                continue;
            }
        };
        let Some(ev) = classify(&buf[..n], from, &local) else {
            continue;
        };
        if events.send(ev).is_err() {
            return;
        }
    }
}

/// Turn one datagram into a node event. Own frames, other versions and garbage yield None.
fn classify(datagram: &[u8], from: SocketAddr, local: &PeerId) -> Option<NodeEvent> {
    let (frame, _) = match decode_presence(datagram) {
        Ok(x) => x,
        Err(e) => {
            tracing::debug!(%from, error = %e, "ignoring undecodable presence frame");
            return None;
        }
    };
    match frame {
        PresenceFrame::Announce {
            protocol_version,
            peer_id,
            listen_port,
        } => {
            if protocol_version != PROTOCOL_VERSION || peer_id == *local {
                return None;
            }
            Some(NodeEvent::Announce {
                peer: peer_id,
                addr: SocketAddr::new(from.ip(), listen_port),
            })
        }
        PresenceFrame::Leave { peer_id } => {
            if peer_id == *local {
                return None;
            }
            Some(NodeEvent::Leave { peer: peer_id })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from() -> SocketAddr {
        "192.168.1.20:45678".parse().unwrap()
    }

    #[test]
    fn announce_maps_to_transport_address() {
        let frame = encode_presence(&PresenceFrame::Announce {
            protocol_version: PROTOCOL_VERSION,
            peer_id: PeerId::from("other"),
            listen_port: 45679,
        })
        .unwrap();
        match classify(&frame, from(), &PeerId::from("me")) {
            Some(NodeEvent::Announce { peer, addr }) => {
                assert_eq!(peer, PeerId::from("other"));
                assert_eq!(addr, "192.168.1.20:45679".parse().unwrap());
            }
            _ => panic!("expected announce"),
        }
    }

    #[test]
    fn own_and_foreign_version_frames_ignored() {
        let me = PeerId::from("me");
        let own = encode_presence(&PresenceFrame::Announce {
            protocol_version: PROTOCOL_VERSION,
            peer_id: me.clone(),
            listen_port: 1,
        })
        .unwrap();
        let future = encode_presence(&PresenceFrame::Announce {
            protocol_version: PROTOCOL_VERSION + 1,
            peer_id: PeerId::from("other"),
            listen_port: 1,
        })
        .unwrap();
        assert!(classify(&own, from(), &me).is_none());
        assert!(classify(&future, from(), &me).is_none());
        assert!(classify(b"\x03\x00\x00\x00abc", from(), &me).is_none());
    }

    #[test]
    fn leave_is_forwarded() {
        let frame = encode_presence(&PresenceFrame::Leave {
            peer_id: PeerId::from("other"),
        })
        .unwrap();
        assert!(matches!(
            classify(&frame, from(), &PeerId::from("me")),
            Some(NodeEvent::Leave { .. })
        ));
    }
}
