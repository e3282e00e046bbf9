//! Chunked transfer: split an outbound payload into indexed chunks, track inbound chunks,
//! reassemble only when every index is present.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::integrity;
use crate::protocol::DataMessage;

/// Default chunk size in bytes. Kept small so each message stays far below channel limits.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024; // 16 KiB

/// Default delay between two chunk sends on one channel.
pub const DEFAULT_PACING: Duration = Duration::from_millis(10);

/// Upper bound on chunks accepted from a single metadata message.
pub const MAX_TOTAL_CHUNKS: u32 = 1 << 20;

/// MIME type used when the sender does not know better.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Number of chunks for `len` bytes. Zero bytes means zero chunks.
pub fn chunk_count(len: usize, chunk_size: usize) -> u32 {
    let size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    };
    len.div_ceil(size) as u32
}

/// Percentage of `done` over `total`, 100 for an empty transfer.
pub fn percent(done: u32, total: u32) -> u8 {
    if total == 0 {
        return 100;
    }
    ((u64::from(done.min(total)) * 100) / u64::from(total)) as u8
}

/// A file to send. Bytes are shared between the per-peer outbound transfers.
#[derive(Debug, Clone)]
pub struct Payload {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Arc<[u8]>,
}

impl Payload {
    pub fn new(file_name: impl Into<String>, mime_type: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            bytes: bytes.into(),
        }
    }
}

/// Outbound side of one transfer to one peer: metadata, chunks in ascending order, completion.
#[derive(Debug)]
pub struct OutboundTransfer {
    payload: Payload,
    chunk_size: usize,
    total_chunks: u32,
    next_chunk_index: u32,
    metadata_sent: bool,
    complete_sent: bool,
}

impl OutboundTransfer {
    pub fn new(payload: Payload, chunk_size: usize) -> Self {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        let total_chunks = chunk_count(payload.bytes.len(), chunk_size);
        Self {
            payload,
            chunk_size,
            total_chunks,
            next_chunk_index: 0,
            metadata_sent: false,
            complete_sent: false,
        }
    }

    pub fn file_name(&self) -> &str {
        &self.payload.file_name
    }

    pub fn file_size(&self) -> u64 {
        self.payload.bytes.len() as u64
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// Next message in send order, or None once the completion marker went out.
    pub fn next_message(&mut self) -> Option<DataMessage> {
        if !self.metadata_sent {
            self.metadata_sent = true;
            return Some(DataMessage::FileMetadata {
                file_name: self.payload.file_name.clone(),
                file_size: self.file_size(),
                file_type: self.payload.mime_type.clone(),
                total_chunks: self.total_chunks,
                checksum: Some(integrity::checksum_hex(&self.payload.bytes)),
            });
        }
        if self.next_chunk_index < self.total_chunks {
            let index = self.next_chunk_index;
            let start = index as usize * self.chunk_size;
            let end = (start + self.chunk_size).min(self.payload.bytes.len());
            self.next_chunk_index += 1;
            return Some(DataMessage::FileChunk {
                file_name: self.payload.file_name.clone(),
                chunk_index: index,
                total_chunks: self.total_chunks,
                chunk: BASE64.encode(&self.payload.bytes[start..end]),
            });
        }
        if !self.complete_sent {
            self.complete_sent = true;
            return Some(DataMessage::FileComplete {
                file_name: self.payload.file_name.clone(),
            });
        }
        None
    }

    /// `(chunksSent / totalChunks) * 100`.
    pub fn progress(&self) -> u8 {
        percent(self.next_chunk_index, self.total_chunks)
    }

    pub fn is_finished(&self) -> bool {
        self.complete_sent
    }
}

/// A fully reassembled inbound payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Inbound side of one transfer: sparse buffer indexed by chunk index.
#[derive(Debug)]
pub struct InboundTransfer {
    file_name: String,
    file_size: u64,
    mime_type: String,
    total_chunks: u32,
    chunks: Vec<Option<Vec<u8>>>,
    received_count: u32,
    checksum: Option<String>,
}

impl InboundTransfer {
    /// Allocate the reception buffer from a `file-metadata` message.
    pub fn from_metadata(
        file_name: String,
        file_size: u64,
        mime_type: String,
        total_chunks: u32,
        checksum: Option<String>,
    ) -> Result<Self, TransferError> {
        if total_chunks > MAX_TOTAL_CHUNKS {
            return Err(TransferError::InvalidMetadata(format!(
                "{total_chunks} chunks exceeds limit of {MAX_TOTAL_CHUNKS}"
            )));
        }
        if u64::from(total_chunks) > file_size || (file_size > 0 && total_chunks == 0) {
            return Err(TransferError::InvalidMetadata(format!(
                "{total_chunks} chunks cannot carry {file_size} bytes"
            )));
        }
        Ok(Self {
            file_name,
            file_size,
            mime_type,
            total_chunks,
            chunks: vec![None; total_chunks as usize],
            received_count: 0,
            checksum,
        })
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn received_count(&self) -> u32 {
        self.received_count
    }

    /// Decode and store one chunk. Out-of-order arrival is fine; duplicates are not counted twice.
    pub fn accept_chunk(&mut self, chunk_index: u32, total_chunks: u32, encoded: &str) -> Result<u8, TransferError> {
        if total_chunks != self.total_chunks {
            return Err(TransferError::TotalMismatch {
                expected: self.total_chunks,
                got: total_chunks,
            });
        }
        let slot = self
            .chunks
            .get_mut(chunk_index as usize)
            .ok_or(TransferError::IndexOutOfRange {
                index: chunk_index,
                total: total_chunks,
            })?;
        let bytes = BASE64.decode(encoded)?;
        if slot.is_none() {
            *slot = Some(bytes);
            self.received_count += 1;
        }
        Ok(self.progress())
    }

    /// `(receivedCount / totalChunks) * 100`.
    pub fn progress(&self) -> u8 {
        percent(self.received_count, self.total_chunks)
    }

    /// Indices not yet received, ascending.
    pub fn missing(&self) -> Vec<u32> {
        self.chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_none())
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// On the completion marker: reassemble in index order, or fail if anything is missing.
    pub fn finish(self) -> Result<ReceivedFile, TransferError> {
        let missing = self.missing();
        if !missing.is_empty() {
            return Err(TransferError::MissingChunks { missing });
        }
        let mut bytes = Vec::with_capacity(self.file_size as usize);
        for chunk in self.chunks.into_iter().flatten() {
            bytes.extend_from_slice(&chunk);
        }
        if bytes.len() as u64 != self.file_size {
            return Err(TransferError::SizeMismatch {
                expected: self.file_size,
                actual: bytes.len() as u64,
            });
        }
        if let Some(expected) = &self.checksum {
            if !integrity::verify_payload(&bytes, expected) {
                return Err(TransferError::ChecksumMismatch);
            }
        }
        Ok(ReceivedFile {
            file_name: self.file_name,
            mime_type: self.mime_type,
            bytes,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),
    #[error("chunk index {index} out of range for {total} chunks")]
    IndexOutOfRange { index: u32, total: u32 },
    #[error("chunk claims {got} total chunks, metadata announced {expected}")]
    TotalMismatch { expected: u32, got: u32 },
    #[error("chunk is not valid base64: {0}")]
    BadEncoding(#[from] base64::DecodeError),
    #[error("{} chunk(s) missing at completion", missing.len())]
    MissingChunks { missing: Vec<u32> },
    #[error("reassembled {actual} bytes, metadata announced {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("connection closed mid-transfer")]
    ConnectionLost,
    #[error("superseded by a new transfer with the same name")]
    Superseded,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_of(len: usize) -> Payload {
        let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        Payload::new("data.bin", DEFAULT_MIME_TYPE, bytes)
    }

    /// Drain an outbound transfer into an inbound one, delivering chunks in the given order.
    fn transfer(payload: Payload, chunk_size: usize, reorder: bool) -> Result<ReceivedFile, TransferError> {
        let mut out = OutboundTransfer::new(payload, chunk_size);
        let mut messages = Vec::new();
        while let Some(m) = out.next_message() {
            messages.push(m);
        }
        let complete = messages.pop().expect("completion marker");
        let metadata = messages.remove(0);
        if reorder {
            messages.reverse();
        }
        let mut inbound = match metadata {
            DataMessage::FileMetadata {
                file_name,
                file_size,
                file_type,
                total_chunks,
                checksum,
            } => InboundTransfer::from_metadata(file_name, file_size, file_type, total_chunks, checksum)?,
            other => panic!("expected metadata first, got {other:?}"),
        };
        for m in messages {
            if let DataMessage::FileChunk {
                chunk_index,
                total_chunks,
                chunk,
                ..
            } = m
            {
                inbound.accept_chunk(chunk_index, total_chunks, &chunk)?;
            }
        }
        assert!(matches!(complete, DataMessage::FileComplete { .. }));
        inbound.finish()
    }

    #[test]
    fn chunk_counts() {
        assert_eq!(chunk_count(0, 30), 0);
        assert_eq!(chunk_count(29, 30), 1);
        assert_eq!(chunk_count(30, 30), 1);
        assert_eq!(chunk_count(31, 30), 2);
        assert_eq!(chunk_count(100, 30), 4);
        assert_eq!(chunk_count(DEFAULT_CHUNK_SIZE * 2, 0), 2);
    }

    #[test]
    fn roundtrip_edge_sizes() {
        let size = 64;
        for len in [0, size - 1, size, size * 5 + 3] {
            let original = payload_of(len);
            let received = transfer(original.clone(), size, false).unwrap();
            assert_eq!(received.bytes.as_slice(), &original.bytes[..], "len {len}");
            assert_eq!(received.file_name, "data.bin");
        }
    }

    #[test]
    fn roundtrip_out_of_order() {
        let original = payload_of(1000);
        let received = transfer(original.clone(), 64, true).unwrap();
        assert_eq!(received.bytes.as_slice(), &original.bytes[..]);
    }

    #[test]
    fn send_order_is_metadata_chunks_complete() {
        let mut out = OutboundTransfer::new(payload_of(100), 30);
        assert!(matches!(out.next_message(), Some(DataMessage::FileMetadata { total_chunks: 4, .. })));
        for expected in 0..4 {
            match out.next_message() {
                Some(DataMessage::FileChunk { chunk_index, .. }) => assert_eq!(chunk_index, expected),
                other => panic!("expected chunk {expected}, got {other:?}"),
            }
        }
        assert_eq!(out.progress(), 100);
        assert!(matches!(out.next_message(), Some(DataMessage::FileComplete { .. })));
        assert!(out.is_finished());
        assert!(out.next_message().is_none());
    }

    #[test]
    fn progress_after_each_chunk() {
        let mut out = OutboundTransfer::new(payload_of(100), 25);
        out.next_message();
        let mut seen = Vec::new();
        for _ in 0..4 {
            out.next_message();
            seen.push(out.progress());
        }
        assert_eq!(seen, vec![25, 50, 75, 100]);
    }

    #[test]
    fn missing_chunk_fails_at_completion() {
        let mut inbound = InboundTransfer::from_metadata("f".into(), 90, DEFAULT_MIME_TYPE.into(), 3, None).unwrap();
        let chunk = BASE64.encode([7u8; 30]);
        inbound.accept_chunk(0, 3, &chunk).unwrap();
        inbound.accept_chunk(2, 3, &chunk).unwrap();
        assert_eq!(inbound.missing(), vec![1]);
        assert_eq!(
            inbound.finish(),
            Err(TransferError::MissingChunks { missing: vec![1] })
        );
    }

    #[test]
    fn duplicate_chunk_not_double_counted() {
        let mut inbound = InboundTransfer::from_metadata("f".into(), 60, DEFAULT_MIME_TYPE.into(), 2, None).unwrap();
        let chunk = BASE64.encode([1u8; 30]);
        assert_eq!(inbound.accept_chunk(0, 2, &chunk).unwrap(), 50);
        assert_eq!(inbound.accept_chunk(0, 2, &chunk).unwrap(), 50);
        assert_eq!(inbound.received_count(), 1);
        assert!(inbound.finish().is_err());
    }

    #[test]
    fn out_of_range_and_mismatched_total_rejected() {
        let mut inbound = InboundTransfer::from_metadata("f".into(), 60, DEFAULT_MIME_TYPE.into(), 2, None).unwrap();
        let chunk = BASE64.encode([1u8; 30]);
        assert!(matches!(
            inbound.accept_chunk(2, 2, &chunk),
            Err(TransferError::IndexOutOfRange { index: 2, total: 2 })
        ));
        assert!(matches!(
            inbound.accept_chunk(0, 3, &chunk),
            Err(TransferError::TotalMismatch { expected: 2, got: 3 })
        ));
        assert!(matches!(
            inbound.accept_chunk(0, 2, "***"),
            Err(TransferError::BadEncoding(_))
        ));
    }

    #[test]
    fn checksum_mismatch_is_not_delivered() {
        let mut inbound =
            InboundTransfer::from_metadata("f".into(), 4, DEFAULT_MIME_TYPE.into(), 1, Some(integrity::checksum_hex(b"abcd")))
                .unwrap();
        inbound.accept_chunk(0, 1, &BASE64.encode(b"abce")).unwrap();
        assert_eq!(inbound.finish(), Err(TransferError::ChecksumMismatch));
    }

    #[test]
    fn size_mismatch_is_not_delivered() {
        let mut inbound = InboundTransfer::from_metadata("f".into(), 10, DEFAULT_MIME_TYPE.into(), 1, None).unwrap();
        inbound.accept_chunk(0, 1, &BASE64.encode(b"abc")).unwrap();
        assert!(matches!(
            inbound.finish(),
            Err(TransferError::SizeMismatch { expected: 10, actual: 3 })
        ));
    }

    #[test]
    fn implausible_metadata_rejected() {
        assert!(InboundTransfer::from_metadata("f".into(), 10, DEFAULT_MIME_TYPE.into(), 0, None).is_err());
        assert!(InboundTransfer::from_metadata("f".into(), 2, DEFAULT_MIME_TYPE.into(), 3, None).is_err());
        assert!(InboundTransfer::from_metadata("f".into(), u64::MAX, DEFAULT_MIME_TYPE.into(), u32::MAX, None).is_err());
        assert!(InboundTransfer::from_metadata("f".into(), 0, DEFAULT_MIME_TYPE.into(), 0, None).is_ok());
    }
}
