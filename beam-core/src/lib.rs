//! Beam core: peer presence, connection arbitration and chunked transfer.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod chat;
pub mod chunk;
pub mod connection;
pub mod hub;
pub mod identity;
pub mod init;
pub mod integrity;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod wire;

pub use chat::{ChatLog, ChatMessage};
pub use chunk::{Payload, ReceivedFile, TransferError, DEFAULT_CHUNK_SIZE, DEFAULT_PACING};
pub use connection::{ChannelId, ConnectionManager, ConnectionState, Notice, NoticeKind};
pub use hub::{HubAction, SessionId, SignalHub};
pub use identity::PeerId;
pub use init::{Backoff, InitError, LinkStatus, RetryPolicy};
pub use protocol::{DataMessage, PresenceFrame, SignalMessage, PROTOCOL_VERSION};
pub use session::{Action, Direction, PeerSession, SessionConfig, TransferRecord, TransferStatus};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
