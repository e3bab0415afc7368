//! One live client connection: a reader task and a writer task sharing a
//! duplex WebSocket and a bounded outbound queue.
//!
//! The queue is the backpressure boundary.  Fan-out never blocks on a slow
//! peer: enqueue is non-blocking, and a full queue gets the session evicted
//! and its connection closed.  Closing the queue (via the close signal) is
//! the sole termination signal for the writer.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chat_protocol::Envelope;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::Identity;
use crate::error::HubError;
use crate::hub::{EventOrigin, HubHandle, InboundEvent};

/// Outbound queue capacity, in frames.
pub const OUTBOUND_QUEUE_CAP: usize = 256;

/// Read deadline; refreshed by any inbound frame, liveness probes included.
pub const READ_DEADLINE: Duration = Duration::from_secs(60);
/// Write deadline per batch.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(10);
/// Ping interval -- 90% of the peer's 60 s read deadline.
pub const PING_INTERVAL: Duration = Duration::from_secs(54);
/// Token validation plus membership registration must finish inside this.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// A frame queued for the writer.
#[derive(Debug)]
pub enum Frame {
    Text(String),
    Pong(Vec<u8>),
}

#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueError {
    /// Queue at capacity: the session is unhealthy and must be evicted.
    Full,
    Closed,
}

/// The hub-facing half of a session: identity, the outbound queue sender,
/// the close signal, and the joined-room set (mutated only under the hub's
/// index lock).
pub struct SessionHandle {
    pub conn_id: Uuid,
    pub user_id: Uuid,
    outbound: mpsc::Sender<Frame>,
    closed: watch::Sender<bool>,
    joined: Mutex<HashSet<Uuid>>,
}

/// The writer-task half: the queue receiver and the close signal.
pub struct SessionRx {
    pub frames: mpsc::Receiver<Frame>,
    pub closed: watch::Receiver<bool>,
}

impl SessionHandle {
    pub fn new(user_id: Uuid) -> (Arc<Self>, SessionRx) {
        let (outbound, frames) = mpsc::channel(OUTBOUND_QUEUE_CAP);
        let (closed_tx, closed_rx) = watch::channel(false);
        let handle = Arc::new(SessionHandle {
            conn_id: Uuid::new_v4(),
            user_id,
            outbound,
            closed: closed_tx,
            joined: Mutex::new(HashSet::new()),
        });
        (
            handle,
            SessionRx {
                frames,
                closed: closed_rx,
            },
        )
    }

    /// Non-blocking enqueue.  `Full` means the peer cannot keep up.
    pub fn enqueue(&self, frame: Frame) -> Result<(), EnqueueError> {
        if *self.closed.borrow() {
            return Err(EnqueueError::Closed);
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    pub fn enqueue_envelope(&self, envelope: &Envelope) -> Result<(), EnqueueError> {
        match serde_json::to_string(envelope) {
            Ok(json) => self.enqueue(Frame::Text(json)),
            Err(e) => {
                warn!(error = %e, "failed to serialize outbound envelope");
                Ok(())
            }
        }
    }

    /// Signal the writer to drain and exit.  Idempotent.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn record_joined(&self, chats: &[Uuid]) {
        self.joined.lock().unwrap().extend(chats.iter().copied());
    }

    pub fn joined_snapshot(&self) -> Vec<Uuid> {
        self.joined.lock().unwrap().iter().copied().collect()
    }
}

/// Drive one upgraded connection to completion: register with the hub, run
/// the writer task and the read loop, unregister on exit.
pub async fn run(socket: WebSocket, hub: HubHandle, identity: Identity) {
    let (handle, rx) = SessionHandle::new(identity.user_id);
    let conn_id = handle.conn_id;

    let (mut sink, stream) = socket.split();

    // Register inside the handshake deadline; the membership query happens
    // in the hub loop before the ack.
    let registered = tokio::time::timeout(HANDSHAKE_TIMEOUT, hub.register(Arc::clone(&handle)))
        .await
        .unwrap_or(Err(HubError::ShuttingDown));
    if let Err(e) = registered {
        warn!(user_id = %identity.user_id, error = %e, "session registration failed");
        if let Ok(json) = serde_json::to_string(&e.to_envelope()) {
            let _ = sink.send(Message::Text(json)).await;
        }
        let _ = sink.close().await;
        // A timed-out register may still land in the hub afterwards;
        // unregistering is a no-op otherwise.
        hub.unregister(conn_id, identity.user_id).await;
        return;
    }
    info!(user_id = %identity.user_id, conn_id = %conn_id, "session registered");

    let writer = tokio::spawn(write_loop(sink, rx));
    read_loop(stream, &hub, &handle).await;

    hub.unregister(conn_id, identity.user_id).await;
    handle.close();
    let _ = writer.await;
    info!(user_id = %identity.user_id, conn_id = %conn_id, "session ended");
}

/// Reader: deadline-bounded receive, envelope parse, server-side sender
/// stamping, hand-off to the hub's broadcast channel.
async fn read_loop(
    mut stream: futures_util::stream::SplitStream<WebSocket>,
    hub: &HubHandle,
    handle: &Arc<SessionHandle>,
) {
    loop {
        let msg = match tokio::time::timeout(READ_DEADLINE, stream.next()).await {
            Err(_) => {
                debug!(conn_id = %handle.conn_id, "read deadline expired");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(conn_id = %handle.conn_id, error = %e, "read error");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(text) => {
                match serde_json::from_str::<Envelope>(&text) {
                    Ok(mut envelope) => {
                        // Never trust the client-supplied sender.
                        envelope.sender = handle.user_id;
                        hub.broadcast(InboundEvent {
                            envelope,
                            origin: EventOrigin::Local {
                                conn_id: handle.conn_id,
                            },
                        })
                        .await;
                    }
                    Err(e) => {
                        let err = HubError::Validation(format!("undecodable envelope: {e}"));
                        let _ = handle.enqueue_envelope(&err.to_envelope());
                    }
                }
            }
            Message::Ping(data) => {
                // Liveness probe: answer and fall through, which resets the
                // deadline for the next recv.
                let _ = handle.enqueue(Frame::Pong(data));
            }
            Message::Pong(_) => {}
            Message::Close(_) => break,
            Message::Binary(_) => {
                let err = HubError::Validation("binary frames are not supported".to_owned());
                let _ = handle.enqueue_envelope(&err.to_envelope());
            }
        }
    }
}

/// Writer: waits on the queue or the ping timer.  A ready frame is written
/// together with everything else already queued, coalescing fan-out bursts
/// into one batch without coalescing across I/O stalls.
async fn write_loop(
    mut sink: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: SessionRx,
) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await; // immediate first tick

    loop {
        tokio::select! {
            biased;
            _ = rx.closed.changed() => {
                if *rx.closed.borrow() {
                    break;
                }
            }
            frame = rx.frames.recv() => {
                let Some(frame) = frame else { break };
                let mut batch = vec![frame];
                while let Ok(more) = rx.frames.try_recv() {
                    batch.push(more);
                }
                let wrote = tokio::time::timeout(WRITE_DEADLINE, async {
                    for frame in batch {
                        let msg = match frame {
                            Frame::Text(text) => Message::Text(text),
                            Frame::Pong(data) => Message::Pong(data),
                        };
                        sink.feed(msg).await?;
                    }
                    sink.flush().await
                })
                .await;
                match wrote {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(error = %e, "write failed, closing connection");
                        break;
                    }
                    Err(_) => {
                        debug!("write deadline expired, closing connection");
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                let sent = tokio::time::timeout(WRITE_DEADLINE, sink.send(Message::Ping(Vec::new()))).await;
                if !matches!(sent, Ok(Ok(()))) {
                    break;
                }
            }
        }
    }
    // Closing the sink sends a Close frame, which makes the reader observe
    // EOF and fire Unregister.
    let _ = sink.close().await;
}
