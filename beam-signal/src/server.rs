//! WebSocket front end for the signal hub. One actor task owns the hub; each socket gets a
//! reader loop and a writer task that talk to it over channels.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use beam_core::hub::{HubAction, SessionId, SignalHub};
use beam_core::wire;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

/// How long a terminated client gets to answer our Close before the socket is dropped.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Hub timing.
#[derive(Debug, Clone, Copy)]
pub struct HubSettings {
    pub heartbeat_interval: Duration,
    pub session_timeout: Duration,
}

/// Socket task → actor.
enum HubEvent {
    Connected {
        session: SessionId,
        addr: SocketAddr,
        tx: mpsc::UnboundedSender<Outgoing>,
    },
    Text {
        session: SessionId,
        text: String,
    },
    Activity {
        session: SessionId,
    },
    Closed {
        session: SessionId,
    },
}

/// Actor → socket writer.
#[derive(Debug)]
enum Outgoing {
    Text(String),
    Close,
}

/// Accept WebSocket clients on `listener` until `shutdown` flips to true.
pub async fn run_server(
    listener: TcpListener,
    settings: HubSettings,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let actor = tokio::spawn(run_hub(event_rx, settings, shutdown.clone()));

    let mut next_session: SessionId = 1;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(x) => x,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let session = next_session;
                next_session += 1;
                tokio::spawn(handle_socket(stream, addr, session, event_tx.clone()));
            }
            _ = shutdown.changed() => break,
        }
    }
    drop(event_tx);
    actor.await?;
    Ok(())
}

/// Single owner of hub state. Applies events in arrival order and runs the liveness probe.
async fn run_hub(
    mut events: mpsc::UnboundedReceiver<HubEvent>,
    settings: HubSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut hub = SignalHub::new(settings.session_timeout);
    let mut writers: HashMap<SessionId, mpsc::UnboundedSender<Outgoing>> = HashMap::new();
    let mut probe = tokio::time::interval_at(
        tokio::time::Instant::now() + settings.heartbeat_interval,
        settings.heartbeat_interval,
    );
    probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            ev = events.recv() => {
                let Some(ev) = ev else { break };
                let now = Instant::now();
                let actions = match ev {
                    HubEvent::Connected { session, addr, tx } => {
                        tracing::debug!(session, %addr, "client connected");
                        hub.on_connect(session, now);
                        writers.insert(session, tx);
                        Vec::new()
                    }
                    HubEvent::Text { session, text } => hub.on_text(session, &text, now),
                    HubEvent::Activity { session } => {
                        hub.on_activity(session, now);
                        Vec::new()
                    }
                    HubEvent::Closed { session } => {
                        writers.remove(&session);
                        hub.on_closed(session)
                    }
                };
                apply(actions, &mut writers);
            }
            _ = probe.tick() => {
                let actions = hub.probe(Instant::now());
                apply(actions, &mut writers);
            }
            _ = shutdown.changed() => break,
        }
    }
    for (_, tx) in writers.drain() {
        let _ = tx.send(Outgoing::Close);
    }
    tracing::info!(registered = hub.registered_peers().len(), "signal hub stopped");
}

fn apply(actions: Vec<HubAction>, writers: &mut HashMap<SessionId, mpsc::UnboundedSender<Outgoing>>) {
    for action in actions {
        match action {
            HubAction::Send(session, msg) => {
                let Some(tx) = writers.get(&session) else {
                    continue;
                };
                match wire::encode_signal(&msg) {
                    Ok(text) => {
                        let _ = tx.send(Outgoing::Text(text));
                    }
                    Err(e) => tracing::warn!(session, error = %e, "failed to encode signaling message"),
                }
            }
            HubAction::Terminate(session) => {
                if let Some(tx) = writers.remove(&session) {
                    tracing::info!(session, "terminating session");
                    let _ = tx.send(Outgoing::Close);
                }
            }
        }
    }
}

/// Per-socket task: handshake, then pump frames both ways until either side closes.
async fn handle_socket(stream: TcpStream, addr: SocketAddr, session: SessionId, events: mpsc::UnboundedSender<HubEvent>) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!(%addr, error = %e, "websocket handshake failed");
            return;
        }
    };
    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();
    if events.send(HubEvent::Connected { session, addr, tx }).is_err() {
        return;
    }

    let mut writer = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Outgoing::Text(text) => {
                    if write.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outgoing::Close => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        let _ = write.close().await;
    });

    let mut writer_done = false;
    loop {
        tokio::select! {
            frame = read.next() => {
                let ev = match frame {
                    Some(Ok(Message::Text(text))) => HubEvent::Text {
                        session,
                        text: text.to_string(),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => HubEvent::Activity { session },
                    Some(Err(e)) => {
                        tracing::debug!(session, error = %e, "socket error");
                        break;
                    }
                };
                if events.send(ev).is_err() {
                    break;
                }
            }
            // Close sent (terminated) or the write side failed.
            _ = &mut writer => {
                writer_done = true;
                break;
            }
        }
    }
    if writer_done {
        let drained = tokio::time::timeout(CLOSE_GRACE, async {
            while let Some(Ok(frame)) = read.next().await {
                if matches!(frame, Message::Close(_)) {
                    break;
                }
            }
        })
        .await;
        if drained.is_err() {
            tracing::debug!(session, %addr, "client ignored close; dropping socket");
        }
    }
    let _ = events.send(HubEvent::Closed { session });
    writer.abort();
}
