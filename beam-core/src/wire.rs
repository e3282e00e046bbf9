//! Encoding: JSON text for signaling and data messages; length-prefix (4 bytes LE) framing
//! for stream transports and LAN presence frames.

use crate::protocol::{DataMessage, PresenceFrame, SignalMessage};

const LEN_SIZE: usize = 4;
/// Largest frame accepted on a stream transport.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Prefix `payload` with its 4-byte LE length.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Split one frame from the front of `bytes`. Returns the payload and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` until the whole frame is present.
pub fn decode_frame(bytes: &[u8]) -> Result<(&[u8], usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = frame_len(&bytes[..LEN_SIZE])?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok((&bytes[LEN_SIZE..LEN_SIZE + len], LEN_SIZE + len))
}

/// Parse a 4-byte LE length header, rejecting oversized frames.
pub fn frame_len(header: &[u8]) -> Result<usize, FrameDecodeError> {
    let header: [u8; LEN_SIZE] = header
        .get(..LEN_SIZE)
        .and_then(|h| h.try_into().ok())
        .ok_or(FrameDecodeError::NeedMore)?;
    let len = u32::from_le_bytes(header);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

pub fn encode_presence(frame: &PresenceFrame) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(frame)?;
    encode_frame(&payload)
}

pub fn decode_presence(bytes: &[u8]) -> Result<(PresenceFrame, usize), FrameDecodeError> {
    let (payload, consumed) = decode_frame(bytes)?;
    let frame = bincode::deserialize(payload)?;
    Ok((frame, consumed))
}

pub fn encode_signal(msg: &SignalMessage) -> Result<String, FrameEncodeError> {
    Ok(serde_json::to_string(msg)?)
}

pub fn decode_signal(text: &str) -> Result<SignalMessage, FrameDecodeError> {
    Ok(serde_json::from_str(text)?)
}

/// JSON bytes of a data message, ready for `encode_frame` or a message-oriented channel.
pub fn encode_data(msg: &DataMessage) -> Result<Vec<u8>, FrameEncodeError> {
    Ok(serde_json::to_vec(msg)?)
}

pub fn decode_data(bytes: &[u8]) -> Result<DataMessage, FrameDecodeError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Error encoding a message (serializer failure or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("json encode error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Error decoding a message (need more bytes, too large, or malformed payload).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerId;
    use crate::protocol::PROTOCOL_VERSION;

    fn sample_announce() -> PresenceFrame {
        PresenceFrame::Announce {
            protocol_version: PROTOCOL_VERSION,
            peer_id: PeerId::generate(),
            listen_port: 45679,
        }
    }

    #[test]
    fn presence_frame_roundtrip() {
        let frame = sample_announce();
        let bytes = encode_presence(&frame).unwrap();
        let (decoded, n) = decode_presence(&bytes).unwrap();
        assert_eq!(n, bytes.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn partial_read_need_more() {
        let bytes = encode_presence(&sample_announce()).unwrap();
        assert!(matches!(
            decode_frame(&bytes[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&bytes[..super::LEN_SIZE]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn multiple_frames_in_one_buffer() {
        let a = encode_frame(br#"{"type":"file-complete","fileName":"a"}"#).unwrap();
        let b = encode_presence(&PresenceFrame::Leave {
            peer_id: PeerId::from("x"),
        })
        .unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&a);
        buf.extend_from_slice(&b);
        let (first, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, a.len());
        assert!(matches!(
            decode_data(first).unwrap(),
            DataMessage::FileComplete { .. }
        ));
        let (second, n2) = decode_presence(&buf[n1..]).unwrap();
        assert_eq!(n2, b.len());
        assert!(matches!(second, PresenceFrame::Leave { .. }));
    }

    #[test]
    fn oversized_header_rejected() {
        let header = (MAX_FRAME_LEN + 1).to_le_bytes();
        assert!(matches!(
            decode_frame(&header),
            Err(FrameDecodeError::TooLarge)
        ));
    }

    #[test]
    fn malformed_signal_is_an_error() {
        assert!(matches!(
            decode_signal("{not json"),
            Err(FrameDecodeError::Json(_))
        ));
    }
}
