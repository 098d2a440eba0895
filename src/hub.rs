//! Per-session fan-out bus
//!
//! A hub maintains the set of sockets attached to one session and delivers
//! broadcast frames to each of them in order. A dedicated task is the sole
//! owner of the membership map; registration, deregistration, and broadcast
//! all arrive over channels, so no locks are shared with the sockets.
//!
//! Delivery never blocks the producer: each member has a bounded mailbox and
//! a member whose mailbox is full is evicted on the spot. The hub task is
//! the only holder of a member's mailbox sender, so the mailbox is closed
//! exactly once, when the member is removed.

use crate::rtc::Identity;
use crate::session::events;
use log::{debug, info};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Outbound frames buffered per socket before the member is evicted.
pub const MAILBOX_CAPACITY: usize = 256;

/// Broadcast frames kept for replay to new members.
pub const HISTORY_CAPACITY: usize = 100;

/// A socket's membership record: identity snapshot plus the mailbox the
/// connection pump drains.
struct Client {
    identity: Identity,
    mailbox: mpsc::Sender<String>,
}

/// Registration request handed to the hub task.
pub struct Registration {
    pub id: String,
    pub identity: Identity,
    pub mailbox: mpsc::Sender<String>,
}

enum Control {
    SendTo(String, String),
    Close,
}

/// Cloneable handle to one hub task.
#[derive(Clone)]
pub struct Hub {
    broadcast_tx: mpsc::Sender<String>,
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<String>,
    control_tx: mpsc::Sender<Control>,
    members: Arc<AtomicUsize>,
}

impl Hub {
    /// Spawn a hub task. `history` is the replay ring size; 0 disables
    /// replay entirely (streams use it for the viewer hub).
    pub fn spawn(session_id: String, history: usize) -> Hub {
        let (broadcast_tx, broadcast_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (register_tx, register_rx) = mpsc::channel(16);
        let (unregister_tx, unregister_rx) = mpsc::channel(16);
        let (control_tx, control_rx) = mpsc::channel(16);
        let members = Arc::new(AtomicUsize::new(0));

        let task = HubTask {
            session_id,
            clients: HashMap::new(),
            history: VecDeque::new(),
            history_capacity: history,
            members: members.clone(),
        };
        tokio::spawn(task.run(broadcast_rx, register_rx, unregister_rx, control_rx));

        Hub {
            broadcast_tx,
            register_tx,
            unregister_tx,
            control_tx,
            members,
        }
    }

    /// Attach a socket. The hub takes sole ownership of the mailbox sender.
    pub async fn register(&self, registration: Registration) {
        let _ = self.register_tx.send(registration).await;
    }

    /// Detach a socket; a no-op if it was already evicted.
    pub async fn unregister(&self, id: &str) {
        let _ = self.unregister_tx.send(id.to_string()).await;
    }

    /// Queue a frame for delivery to every member, in order.
    pub async fn broadcast(&self, frame: String) {
        let _ = self.broadcast_tx.send(frame).await;
    }

    /// Deliver a frame to a single member, if present.
    pub async fn send_to(&self, id: &str, frame: String) {
        let _ = self
            .control_tx
            .send(Control::SendTo(id.to_string(), frame))
            .await;
    }

    /// Drop every member (closing each mailbox) and stop the hub task.
    pub async fn close(&self) {
        let _ = self.control_tx.send(Control::Close).await;
    }

    pub fn member_count(&self) -> usize {
        self.members.load(Ordering::Relaxed)
    }
}

struct HubTask {
    session_id: String,
    clients: HashMap<String, Client>,
    history: VecDeque<String>,
    history_capacity: usize,
    members: Arc<AtomicUsize>,
}

impl HubTask {
    async fn run(
        mut self,
        mut broadcast_rx: mpsc::Receiver<String>,
        mut register_rx: mpsc::Receiver<Registration>,
        mut unregister_rx: mpsc::Receiver<String>,
        mut control_rx: mpsc::Receiver<Control>,
    ) {
        loop {
            tokio::select! {
                Some(frame) = broadcast_rx.recv() => self.deliver(frame),
                Some(registration) = register_rx.recv() => self.register(registration),
                Some(id) = unregister_rx.recv() => self.unregister(&id),
                control = control_rx.recv() => match control {
                    Some(Control::SendTo(id, frame)) => self.send_to(&id, frame),
                    Some(Control::Close) | None => {
                        // Flush frames queued before the close was requested
                        // (e.g. a terminal session event).
                        while let Ok(frame) = broadcast_rx.try_recv() {
                            self.deliver(frame);
                        }
                        break;
                    }
                },
                else => break,
            }
        }
        self.clients.clear();
        self.members.store(0, Ordering::Relaxed);
        debug!("hub {}: stopped", self.session_id);
    }

    fn register(&mut self, registration: Registration) {
        let Registration {
            id,
            identity,
            mailbox,
        } = registration;

        // At most one membership per client ID; a stale entry is replaced
        // (and its old mailbox closed by the drop).
        if self.clients.remove(&id).is_some() {
            debug!("hub {}: replaced stale member {}", self.session_id, id);
            self.members.fetch_sub(1, Ordering::Relaxed);
        }

        // Best-effort history replay; a mailbox that cannot take the replay
        // frame simply starts without it.
        if !self.history.is_empty() {
            let frames: Vec<&str> = self.history.iter().map(String::as_str).collect();
            let _ = mailbox.try_send(events::history_frame(&frames));
        }

        let joined = events::user_joined_frame(&identity);
        self.clients.insert(id.clone(), Client { identity, mailbox });
        self.members.fetch_add(1, Ordering::Relaxed);
        info!(
            "hub {}: member {} joined ({} total)",
            self.session_id,
            id,
            self.clients.len()
        );
        self.fan_out(&joined);
    }

    fn unregister(&mut self, id: &str) {
        if let Some(client) = self.clients.remove(id) {
            self.members.fetch_sub(1, Ordering::Relaxed);
            info!(
                "hub {}: member {} left ({} total)",
                self.session_id,
                id,
                self.clients.len()
            );
            let left = events::user_left_frame(&client.identity);
            self.fan_out(&left);
        }
    }

    fn deliver(&mut self, frame: String) {
        if self.history_capacity > 0 {
            if self.history.len() == self.history_capacity {
                self.history.pop_front();
            }
            self.history.push_back(frame.clone());
        }
        self.fan_out(&frame);
    }

    fn send_to(&mut self, id: &str, frame: String) {
        let evict = match self.clients.get(id) {
            Some(client) => client.mailbox.try_send(frame).is_err(),
            None => false,
        };
        if evict {
            self.evict(id);
        }
    }

    /// Non-blocking delivery to every member; members that cannot keep up
    /// are evicted, never waited on.
    fn fan_out(&mut self, frame: &str) {
        let mut evicted: Vec<String> = Vec::new();
        for (id, client) in &self.clients {
            if client.mailbox.try_send(frame.to_string()).is_err() {
                evicted.push(id.clone());
            }
        }
        for id in evicted {
            self.evict(&id);
        }
    }

    fn evict(&mut self, id: &str) {
        if self.clients.remove(id).is_some() {
            self.members.fetch_sub(1, Ordering::Relaxed);
            info!("hub {}: evicted slow member {}", self.session_id, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtc::Role;
    use tokio::time::{sleep, timeout, Duration};

    fn identity(user: &str) -> Identity {
        Identity::new(user, user, Role::Participant)
    }

    async fn attach(hub: &Hub, id: &str) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        hub.register(Registration {
            id: id.to_string(),
            identity: identity(id),
            mailbox: tx,
        })
        .await;
        rx
    }

    async fn settle() {
        sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_broadcast_order_preserved() {
        let hub = Hub::spawn("s1".to_string(), 0);
        let mut rx = attach(&hub, "a").await;
        settle().await;
        // drop the join event
        let _ = rx.recv().await;

        for i in 0..20 {
            hub.broadcast(format!("frame-{}", i)).await;
        }
        settle().await;

        let mut seen = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            seen.push(frame);
        }
        let expected: Vec<String> = (0..20).map(|i| format!("frame-{}", i)).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_slow_member_evicted() {
        let hub = Hub::spawn("s1".to_string(), 0);
        let mut slow = attach(&hub, "slow").await;
        let mut fast = attach(&hub, "fast").await;
        settle().await;
        assert_eq!(hub.member_count(), 2);

        // Never drain `slow`; push well past its mailbox capacity.
        for i in 0..(MAILBOX_CAPACITY + 64) {
            hub.broadcast(format!("frame-{}", i)).await;
            if i % 64 == 0 {
                while fast.try_recv().is_ok() {}
            }
        }
        settle().await;
        while fast.try_recv().is_ok() {}

        assert_eq!(hub.member_count(), 1);

        // The evicted mailbox is closed: after draining what was buffered,
        // recv reports closure rather than blocking.
        while slow.try_recv().is_ok() {}
        assert!(timeout(Duration::from_secs(1), slow.recv())
            .await
            .expect("mailbox should be closed")
            .is_none());

        // Survivors keep receiving.
        hub.broadcast("after-eviction".to_string()).await;
        settle().await;
        let mut frames = Vec::new();
        while let Ok(f) = fast.try_recv() {
            frames.push(f);
        }
        assert!(frames.iter().any(|f| f == "after-eviction"));
    }

    #[tokio::test]
    async fn test_history_replay_oldest_first() {
        let hub = Hub::spawn("s1".to_string(), HISTORY_CAPACITY);
        let mut first = attach(&hub, "first").await;
        settle().await;

        for i in 0..5 {
            hub.broadcast(format!("msg-{}", i)).await;
        }
        settle().await;
        while first.try_recv().is_ok() {}

        let mut late = attach(&hub, "late").await;
        settle().await;

        let replay = late.recv().await.expect("history frame");
        let parsed: serde_json::Value = serde_json::from_str(&replay).unwrap();
        assert_eq!(parsed["type"], "system");
        assert_eq!(parsed["event"], "history");
        let messages = parsed["data"]["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0], "msg-0");
        assert_eq!(messages[4], "msg-4");
    }

    #[tokio::test]
    async fn test_unregister_emits_user_left() {
        let hub = Hub::spawn("s1".to_string(), 0);
        let mut a = attach(&hub, "a").await;
        let _b = attach(&hub, "b").await;
        settle().await;
        while a.try_recv().is_ok() {}

        hub.unregister("b").await;
        settle().await;

        let frame = a.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["event"], "user_left");
        assert_eq!(parsed["data"]["user_id"], "b");
        assert_eq!(hub.member_count(), 1);
    }

    #[tokio::test]
    async fn test_close_drops_all_mailboxes() {
        let hub = Hub::spawn("s1".to_string(), 0);
        let mut a = attach(&hub, "a").await;
        settle().await;

        hub.close().await;
        settle().await;

        while a.try_recv().is_ok() {}
        assert!(a.recv().await.is_none());
        assert_eq!(hub.member_count(), 0);
    }
}
