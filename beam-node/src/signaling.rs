//! Signaling client: WebSocket to the signaling server with register-on-connect and bounded
//! reconnect backoff. Reports up/down transitions and every server message to the node actor.

use beam_core::init::{Backoff, RetryPolicy};
use beam_core::wire;
use beam_core::SignalMessage;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::node::NodeEvent;

/// Actor → signaling task.
#[derive(Debug)]
pub enum SignalCommand {
    Send(SignalMessage),
    /// Flush pending sends, close the socket and stop reconnecting.
    Shutdown,
}

enum SessionEnd {
    Lost,
    Shutdown,
}

/// Keep a signaling session alive. `register` is sent after every (re)connect.
pub fn spawn(
    url: String,
    register: SignalMessage,
    policy: RetryPolicy,
    events: mpsc::UnboundedSender<NodeEvent>,
    mut commands: mpsc::UnboundedReceiver<SignalCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = Backoff::new(policy);
        loop {
            match connect_async(url.as_str()).await {
                Ok((ws, _)) => {
                    backoff.reset();
                    tracing::info!(%url, "signaling connected");
                    match run_session(ws, &register, &events, &mut commands).await {
                        SessionEnd::Shutdown => return,
                        SessionEnd::Lost => {
                            tracing::warn!(%url, "signaling connection lost");
                            if events.send(NodeEvent::SignalingDown).is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(e) => tracing::warn!(%url, error = %e, "signaling connect failed"),
            }

            let Some(delay) = backoff.next_delay() else {
                tracing::warn!(%url, attempts = backoff.attempts(), "signaling unreachable, giving up");
                let _ = events.send(NodeEvent::SignalingGaveUp);
                return;
            };
            tracing::debug!(delay_ms = delay.as_millis() as u64, "signaling reconnect scheduled");
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    cmd = commands.recv() => match cmd {
                        // Sends while offline are stale by the time we reconnect.
                        Some(SignalCommand::Send(_)) => continue,
                        Some(SignalCommand::Shutdown) | None => return,
                    },
                }
            }
        }
    })
}

async fn run_session<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    register: &SignalMessage,
    events: &mpsc::UnboundedSender<NodeEvent>,
    commands: &mut mpsc::UnboundedReceiver<SignalCommand>,
) -> SessionEnd
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut write, mut read) = ws.split();
    let register_text = match wire::encode_signal(register) {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(error = %e, "cannot encode register message");
            return SessionEnd::Lost;
        }
    };
    if write.send(Message::Text(register_text.into())).await.is_err() {
        return SessionEnd::Lost;
    }
    if events.send(NodeEvent::SignalingUp).is_err() {
        return SessionEnd::Shutdown;
    }

    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => match wire::decode_signal(text.as_str()) {
                    Ok(msg) => {
                        if events.send(NodeEvent::Signal(msg)).is_err() {
                            return SessionEnd::Shutdown;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "dropping malformed signaling message"),
                },
                Some(Ok(Message::Close(_))) | None => return SessionEnd::Lost,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "signaling socket error");
                    return SessionEnd::Lost;
                }
            },
            cmd = commands.recv() => match cmd {
                Some(SignalCommand::Send(msg)) => {
                    let text = match wire::encode_signal(&msg) {
                        Ok(t) => t,
                        Err(e) => {
                            tracing::warn!(error = %e, "cannot encode signaling message");
                            continue;
                        }
                    };
                    if write.send(Message::Text(text.into())).await.is_err() {
                        return SessionEnd::Lost;
                    }
                }
                Some(SignalCommand::Shutdown) | None => {
                    let _ = write.send(Message::Close(None)).await;
                    let _ = write.close().await;
                    return SessionEnd::Shutdown;
                }
            },
        }
    }
}
