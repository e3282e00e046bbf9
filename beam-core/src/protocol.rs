//! Beam wire protocol: signaling messages, data channel messages, LAN presence frames.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::chat::ChatMessage;
use crate::identity::PeerId;

/// Current protocol version. Used in LAN announcements and the direct channel handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Signaling messages exchanged with the signaling channel. JSON, `type` discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    /// Client announces its identity.
    Register {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
        /// Dialable address hint for non-browser channel providers.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },
    /// Reply to `Register`: every other registered peer, in registration order.
    PeersList {
        peers: Vec<PeerId>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        endpoints: BTreeMap<PeerId, String>,
    },
    PeerJoined {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },
    PeerLeft {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    /// Graceful departure.
    Disconnect {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    /// Liveness probe (server → client) and its reply (client → server).
    Heartbeat,
}

/// Application messages exchanged over an open direct channel. JSON, `type` discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DataMessage {
    FileMetadata {
        #[serde(rename = "fileName")]
        file_name: String,
        #[serde(rename = "fileSize")]
        file_size: u64,
        #[serde(rename = "fileType")]
        file_type: String,
        #[serde(rename = "totalChunks")]
        total_chunks: u32,
        /// Lower-case hex SHA-256 of the whole payload.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checksum: Option<String>,
    },
    FileChunk {
        #[serde(rename = "fileName")]
        file_name: String,
        #[serde(rename = "chunkIndex")]
        chunk_index: u32,
        #[serde(rename = "totalChunks")]
        total_chunks: u32,
        /// Base64 of the chunk bytes.
        chunk: String,
    },
    FileComplete {
        #[serde(rename = "fileName")]
        file_name: String,
    },
    ChatMessage { message: ChatMessage },
}

/// LAN presence frames (multicast). Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceFrame {
    /// Periodic self-announcement with the direct channel listen port.
    Announce {
        protocol_version: u8,
        peer_id: PeerId,
        listen_port: u16,
    },
    /// Graceful leave.
    Leave { peer_id: PeerId },
}
