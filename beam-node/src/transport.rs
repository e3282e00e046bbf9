//! Direct channels over TCP: listener (incoming), dialer (outbound), handshake, length-prefixed
//! JSON frames. Every channel reports back to the node actor tagged with its channel id.

use std::time::Duration;

use beam_core::wire::{self, FrameDecodeError};
use beam_core::{ChannelId, DataMessage, PeerId, PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::node::NodeEvent;

const LEN_SIZE: usize = 4;
const MAX_IDENTITY_LEN: usize = u8::MAX as usize;

/// Send our version and identity, read the remote's. Both sides run the same exchange.
pub async fn handshake<S>(stream: &mut S, local: &PeerId) -> std::io::Result<PeerId>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&handshake_bytes(local)?).await?;
    stream.flush().await?;

    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != PROTOCOL_VERSION {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unsupported protocol version {}", head[0]),
        ));
    }
    let mut id = vec![0u8; head[1] as usize];
    stream.read_exact(&mut id).await?;
    let id = String::from_utf8(id).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    if id.is_empty() {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "empty peer identity"));
    }
    Ok(PeerId::new(id))
}

fn handshake_bytes(local: &PeerId) -> std::io::Result<Vec<u8>> {
    let id = local.as_str().as_bytes();
    if id.len() > MAX_IDENTITY_LEN {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "identity too long"));
    }
    let mut out = Vec::with_capacity(2 + id.len());
    out.push(PROTOCOL_VERSION);
    out.push(id.len() as u8);
    out.extend_from_slice(id);
    Ok(out)
}

/// Accept incoming channels. Each handshake runs in its own task so a slow client blocks nobody.
pub async fn run_listener(listener: TcpListener, local: PeerId, events: mpsc::UnboundedSender<NodeEvent>) {
    loop {
        let (mut stream, addr) = match listener.accept().await {
            Ok(x) => x,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let local = local.clone();
        let events = events.clone();
        tokio::spawn(async move {
            match handshake(&mut stream, &local).await {
                Ok(peer) => {
                    tracing::debug!(%peer, %addr, "incoming channel");
                    let _ = events.send(NodeEvent::Incoming { peer, stream });
                }
                Err(e) => tracing::debug!(%addr, error = %e, "incoming handshake failed"),
            }
        });
    }
}

/// Dial `addr` for `channel`. Reports `Dialed` on success, `DialFailed` otherwise.
pub fn dial(
    local: PeerId,
    peer: PeerId,
    addr: String,
    channel: ChannelId,
    timeout: Duration,
    events: mpsc::UnboundedSender<NodeEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let attempt = async {
            let mut stream = TcpStream::connect(&addr).await?;
            let remote = handshake(&mut stream, &local).await?;
            if remote != peer {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("expected {peer}, reached {remote}"),
                ));
            }
            Ok::<TcpStream, std::io::Error>(stream)
        };
        let ev = match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(stream)) => NodeEvent::Dialed { peer, channel, stream },
            Ok(Err(e)) => NodeEvent::DialFailed {
                peer,
                channel,
                error: beam_core::init::classify_dial(&e).to_string(),
            },
            Err(_) => NodeEvent::DialFailed {
                peer,
                channel,
                error: "connect timed out".to_string(),
            },
        };
        let _ = events.send(ev);
    })
}

/// Live channel owned by the node actor. Dropping it closes the socket.
pub struct ChannelHandle {
    pub peer: PeerId,
    tx: mpsc::UnboundedSender<DataMessage>,
    reader: JoinHandle<()>,
}

impl ChannelHandle {
    pub fn send(&self, msg: DataMessage) -> bool {
        self.tx.send(msg).is_ok()
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Start reader and writer tasks for an established stream.
pub fn run_channel(
    stream: TcpStream,
    peer: PeerId,
    channel: ChannelId,
    events: mpsc::UnboundedSender<NodeEvent>,
) -> ChannelHandle {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<DataMessage>();

    let writer_events = events.clone();
    let writer_peer = peer.clone();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let frame = match wire::encode_data(&msg).and_then(|json| wire::encode_frame(&json)) {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!(peer = %writer_peer, error = %e, "dropping unencodable message");
                    continue;
                }
            };
            if let Err(e) = writer.write_all(&frame).await {
                let _ = writer_events.send(NodeEvent::ChannelClosed {
                    peer: writer_peer.clone(),
                    channel,
                    error: Some(e.to_string()),
                });
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let reader_peer = peer.clone();
    let reader = tokio::spawn(async move {
        let error = read_frames(&mut reader, &reader_peer, channel, &events).await.err();
        let _ = events.send(NodeEvent::ChannelClosed {
            peer: reader_peer,
            channel,
            error: error.map(|e| e.to_string()),
        });
    });

    ChannelHandle { peer, tx, reader }
}

/// Read frames until EOF (Ok) or a transport error (Err). Undecodable messages are dropped.
async fn read_frames<R>(
    reader: &mut R,
    peer: &PeerId,
    channel: ChannelId,
    events: &mpsc::UnboundedSender<NodeEvent>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut len_buf = [0u8; LEN_SIZE];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }
        let len = wire::frame_len(&len_buf).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        match wire::decode_data(&payload) {
            Ok(msg) => {
                if events
                    .send(NodeEvent::Data {
                        peer: peer.clone(),
                        channel,
                        msg,
                    })
                    .is_err()
                {
                    return Ok(());
                }
            }
            Err(FrameDecodeError::Json(e)) => {
                tracing::warn!(%peer, error = %e, "dropping malformed data message");
            }
            Err(e) => return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        }
    }
}
