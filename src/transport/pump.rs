//! Per-socket connection pump
//!
//! Each socket runs two tasks. The reader enforces the pong deadline and
//! routes inbound text frames; the writer drains the client's mailbox under
//! a write deadline and emits keepalive pings. They share nothing but the
//! mailbox and the two socket halves.
//!
//! The pump owns the full socket lifetime: whatever path the reader exits
//! through, the hub membership is released before the pump returns, so no
//! handler can leak a registration.

use crate::hub::Hub;
use crate::rtc::Signal;
use crate::session::{Room, Stream};
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Duration, Instant, MissedTickBehavior};

/// Maximum inbound frame size.
pub const READ_LIMIT: usize = 512 * 1024;

/// A socket that produces nothing for this long is considered dead.
/// Any received frame, pongs included, extends the deadline.
pub const READ_DEADLINE: Duration = Duration::from_secs(60);

/// Per-frame write allowance; a blocked client terminates the writer.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(10);

/// Keepalive ping period, 9/10 of the read deadline.
pub const PING_PERIOD: Duration = Duration::from_secs(54);

/// What a socket's inbound text frames mean.
pub enum Inbound {
    /// Every frame is fanned out on the hub (chat sockets).
    Chat(Hub),
    /// Signals are routed; everything else is broadcast on the room hub.
    Room(Arc<Room>),
    /// Signals only (stream broadcaster and viewer sockets).
    Stream(Arc<Stream>),
    /// Frames are ignored (read-only viewers).
    ReadOnly,
}

impl Inbound {
    async fn handle(&self, text: &str) {
        match self {
            Inbound::Chat(hub) => hub.broadcast(text.to_string()).await,
            Inbound::Room(room) => {
                // Signal frames are routed through the peer manager; any
                // other frame is a chat/control payload for the hub.
                match Signal::from_json(text) {
                    Ok(signal) => {
                        if let Err(e) = room.submit_signal(signal) {
                            warn!("room {}: signal refused: {}", room.id, e);
                        }
                    }
                    Err(_) => room.hub.broadcast(text.to_string()).await,
                }
            }
            Inbound::Stream(stream) => match Signal::from_json(text) {
                Ok(signal) => {
                    if let Err(e) = stream.submit_signal(signal) {
                        warn!("stream {}: signal refused: {}", stream.id, e);
                    }
                }
                // Protocol errors are logged and dropped; the socket stays open.
                Err(e) => warn!("stream {}: bad signal frame: {}", stream.id, e),
            },
            Inbound::ReadOnly => {}
        }
    }
}

/// Run the pump until the socket dies or the hub releases the mailbox.
///
/// The caller must have registered `client_id` (with the sender side of
/// `mailbox_rx`) on `hub`; the pump unregisters it on every exit path.
pub async fn run(
    socket: WebSocket,
    hub: Hub,
    client_id: &str,
    mailbox_rx: mpsc::Receiver<String>,
    inbound: Inbound,
) {
    let (sink, mut source) = socket.split();
    let writer = tokio::spawn(write_loop(sink, mailbox_rx));

    loop {
        match timeout(READ_DEADLINE, source.next()).await {
            Err(_) => {
                debug!("client {}: pong deadline expired", client_id);
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!("client {}: socket error: {}", client_id, e);
                break;
            }
            Ok(Some(Ok(Message::Text(text)))) => inbound.handle(text.as_str()).await,
            Ok(Some(Ok(Message::Close(frame)))) => {
                if let Some(frame) = frame {
                    if frame.code != axum::extract::ws::close_code::NORMAL {
                        debug!("client {}: close code {}", client_id, frame.code);
                    }
                }
                break;
            }
            // Pings are answered by the socket layer; pongs and binary
            // frames only serve to extend the read deadline.
            Ok(Some(Ok(_))) => {}
        }
    }

    // Single cleanup point: dropping the membership closes the mailbox,
    // which in turn lets the writer drain and exit.
    hub.unregister(client_id).await;
    let _ = writer.await;
}

async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<String>) {
    let mut ping = interval_at(Instant::now() + PING_PERIOD, PING_PERIOD);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ping.tick() => {
                match timeout(WRITE_DEADLINE, sink.send(Message::Ping(Bytes::new()))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
            frame = rx.recv() => match frame {
                // Mailbox closed by the hub: say goodbye and stop.
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                Some(first) => {
                    let out = coalesce(first, &mut rx);
                    match timeout(WRITE_DEADLINE, sink.send(Message::Text(out.into()))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            debug!("write error: {}", e);
                            break;
                        }
                        Err(_) => {
                            warn!("write deadline exceeded, dropping client");
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Append whatever is already queued behind `first`, newline-separated, so
/// one wakeup flushes the whole backlog in a single text message.
fn coalesce(first: String, rx: &mut mpsc::Receiver<String>) -> String {
    let mut out = first;
    while let Ok(next) = rx.try_recv() {
        out.push('\n');
        out.push_str(&next);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_coalesce_joins_backlog() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.try_send("b".to_string()).unwrap();
        tx.try_send("c".to_string()).unwrap();
        assert_eq!(coalesce("a".to_string(), &mut rx), "a\nb\nc");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_coalesce_single_frame() {
        let (_tx, mut rx) = mpsc::channel::<String>(8);
        assert_eq!(coalesce("only".to_string(), &mut rx), "only");
    }

    #[test]
    fn test_ping_period_inside_read_deadline() {
        assert!(PING_PERIOD < READ_DEADLINE);
    }
}
