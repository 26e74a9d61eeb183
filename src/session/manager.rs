//! Session manager (C7): owns the client-id manager, message queue, and
//! timeout manager, and binds each TCP connection to a `ClientSession`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::domain_types::{ClientId, ConnectionId, MessageId, QueueCapacity};
use crate::session::client_id::ClientIdManager;
use crate::session::message_queue::MessageQueue;
use crate::session::timeout_manager::{TimeoutEvent, TimeoutManager};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const CLIENT_ID_MAX_AGE: Duration = Duration::from_secs(3600);
const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(7200);

/// State owned by the session manager for one live TCP connection.
#[derive(Debug, Clone)]
pub struct ClientSession {
    /// Identity of the underlying TCP connection.
    pub connection_id: ConnectionId,
    /// The client id this connection registered, if any.
    pub client_id: Option<ClientId>,
    /// When this session was created.
    pub created_at: Instant,
    /// When this session's connection last decoded a request.
    pub last_activity_at: Instant,
    /// The most recent ack-required message delivered on this connection,
    /// awaiting a wire `ACK`/`NAK` that (unlike C5's internal bookkeeping)
    /// carries no message id of its own. The payload is retained alongside
    /// the id since `MessageQueue::nak` needs it to re-enqueue on retain.
    pub pending_ack: Option<(MessageId, Vec<u8>)>,
}

impl ClientSession {
    fn new(connection_id: ConnectionId) -> Self {
        let now = Instant::now();
        Self {
            connection_id,
            client_id: None,
            created_at: now,
            last_activity_at: now,
            pending_ack: None,
        }
    }
}

/// Owns C4/C5/C6 plus the connection-id -> session map, and drives the
/// periodic cleanup sweep.
pub struct SessionManager {
    sessions: DashMap<ConnectionId, ClientSession>,
    client_ids: ClientIdManager,
    /// Per-client message queue (C5).
    pub queue: MessageQueue,
    /// Per-transaction timeout manager (C6).
    pub timeouts: TimeoutManager,
}

impl SessionManager {
    /// Builds a session manager and spawns its background cleanup task and
    /// timer wheel. Returns the manager plus the channel of timeout events
    /// callers (typically the dispatcher) must drain to emit error frames.
    #[must_use]
    pub fn spawn(
        queue_capacity: QueueCapacity,
        default_timeout_secs: u64,
        max_timeout_secs: u64,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TimeoutEvent>) {
        let (timeouts, timeout_events) = TimeoutManager::spawn(default_timeout_secs, max_timeout_secs);
        let manager = Arc::new(Self {
            sessions: DashMap::new(),
            client_ids: ClientIdManager::new(),
            queue: MessageQueue::new(queue_capacity),
            timeouts,
        });

        let cleanup_manager = Arc::clone(&manager);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => cleanup_manager.run_cleanup().await,
                }
            }
        });

        (manager, timeout_events)
    }

    /// Registers a newly accepted connection and returns its session id.
    #[must_use]
    pub fn open_session(&self) -> ConnectionId {
        let connection_id = ConnectionId::generate();
        self.sessions.insert(connection_id, ClientSession::new(connection_id));
        connection_id
    }

    /// Updates `last_activity_at` for a session; called on every decoded
    /// request.
    pub fn record_activity(&self, connection_id: ConnectionId) {
        if let Some(mut session) = self.sessions.get_mut(&connection_id) {
            session.last_activity_at = Instant::now();
        }
    }

    /// The client-id manager (C4), exposed for the dispatcher's
    /// registration/duplicate-kill logic.
    #[must_use]
    pub fn client_ids(&self) -> &ClientIdManager {
        &self.client_ids
    }

    /// Binds `client_id` to `connection_id`'s session once registration
    /// with the client-id manager has succeeded.
    pub fn bind_client_id(&self, connection_id: ConnectionId, client_id: ClientId) {
        if let Some(mut session) = self.sessions.get_mut(&connection_id) {
            session.client_id = Some(client_id);
        }
    }

    /// Records that `msg_id` (carrying `payload`) was just delivered on
    /// `connection_id` and is awaiting an `ACK`/`NAK`.
    pub fn record_delivery(&self, connection_id: ConnectionId, msg_id: MessageId, payload: Vec<u8>) {
        if let Some(mut session) = self.sessions.get_mut(&connection_id) {
            session.pending_ack = Some((msg_id, payload));
        }
    }

    /// Takes the message id and payload awaiting `ACK`/`NAK` on
    /// `connection_id`, if any.
    pub fn take_pending_ack(&self, connection_id: ConnectionId) -> Option<(MessageId, Vec<u8>)> {
        self.sessions.get_mut(&connection_id).and_then(|mut session| session.pending_ack.take())
    }

    /// Closes a session: frees its client id, cancels its timers, and
    /// removes it from the session map.
    pub async fn close(&self, connection_id: ConnectionId) {
        if let Some((_, session)) = self.sessions.remove(&connection_id) {
            if let Some(client_id) = session.client_id {
                self.client_ids.unregister(&client_id);
                self.timeouts.cancel_client(client_id).await;
            }
            info!(%connection_id, "session closed");
        }
    }

    /// Returns the session bound to `connection_id`, if it is still open.
    #[must_use]
    pub fn session(&self, connection_id: ConnectionId) -> Option<ClientSession> {
        self.sessions.get(&connection_id).map(|entry| entry.clone())
    }

    async fn run_cleanup(&self) {
        let now = Instant::now();
        self.queue.cleanup_expired(now).await;

        let idle: Vec<ConnectionId> = self
            .sessions
            .iter()
            .filter(|entry| now.duration_since(entry.last_activity_at) >= SESSION_IDLE_TIMEOUT)
            .map(|entry| entry.connection_id)
            .collect();
        for connection_id in idle {
            self.close(connection_id).await;
        }

        let stale_ids: Vec<ClientId> = self
            .sessions
            .iter()
            .filter(|entry| now.duration_since(entry.created_at) >= CLIENT_ID_MAX_AGE)
            .filter_map(|entry| entry.client_id.clone())
            .collect();
        for client_id in stale_ids {
            self.client_ids.unregister(&client_id);
        }
    }

    /// Walks every open session and closes it, then stops the timer wheel.
    /// Used by the shutdown path; bounded by the caller's grace period.
    pub async fn shutdown(&self) {
        let connection_ids: Vec<ConnectionId> =
            self.sessions.iter().map(|entry| entry.connection_id).collect();
        for connection_id in connection_ids {
            self.close(connection_id).await;
        }
        self.timeouts.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_session_should_be_retrievable() {
        let token = CancellationToken::new();
        let (manager, _events) = SessionManager::spawn(QueueCapacity::default(), 30, 3600, token.clone());
        let connection_id = manager.open_session();
        assert!(manager.session(connection_id).is_some());
        token.cancel();
    }

    #[tokio::test]
    async fn close_should_remove_session_and_free_client_id() {
        let token = CancellationToken::new();
        let (manager, _events) = SessionManager::spawn(QueueCapacity::default(), 30, 3600, token.clone());
        let connection_id = manager.open_session();
        let client_id = ClientId::try_new("COBOL001").expect("valid");
        manager.client_ids().register(client_id.clone(), connection_id).expect("registers");
        manager.bind_client_id(connection_id, client_id.clone());

        manager.close(connection_id).await;

        assert!(manager.session(connection_id).is_none());
        assert!(manager.client_ids().lookup(&client_id).is_none());
        token.cancel();
    }
}
