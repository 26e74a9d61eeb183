//! Conversation manager (C8): tracks multi-message dialogues keyed by a
//! generated conversation id, enforcing sequence ordering, a bounded
//! simultaneous-ACTIVE cap, a bounded per-conversation history, and expiry
//! of idle conversations.
//!
//! Structurally a near-direct generalization of the teacher's
//! `ConversationManagerImpl` (`DashMap` + `AtomicU64` counter + a periodic
//! `cleanup_expired_conversations` sweep), adapted to a monotonically
//! increasing numeric id (spec.md §4.8) rather than the teacher's
//! `ConversationId(Uuid)` — see `DESIGN.md` for that divergence.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain_types::{ClientId, ConvId, ConversationHistoryCap, LtermName, MaxConversations, TxnCode};
use crate::error::ConversationError;

const STARTING_CONV_ID: u64 = 1001;
const DEFAULT_CONVERSATION_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const COMPLETED_PURGE_DELAY: Duration = Duration::from_secs(5 * 60);

/// Lifecycle state of a [`ConversationState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationStatus {
    /// Accepting further messages.
    Active,
    /// Ended normally (the last message's `last` flag was set).
    Completed,
    /// Ended abnormally.
    Aborted,
    /// Timed out from inactivity before reaching a terminal message.
    Expired,
    /// Holding for a follow-on message the protocol expects but has not yet
    /// sent (reserved for handlers that need to park a conversation).
    Waiting,
    /// Suspended pending an external event (reserved, same rationale as
    /// `Waiting`).
    Suspended,
}

impl ConversationStatus {
    /// Whether this status is terminal: no further transitions are valid.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Expired)
    }
}

/// One multi-message dialogue's tracked state.
#[derive(Debug, Clone)]
pub struct ConversationState {
    /// Positive, unique identifier for this conversation.
    pub conv_id: ConvId,
    /// The client this conversation belongs to.
    pub client_id: ClientId,
    /// The lterm this conversation is bound to.
    pub lterm: LtermName,
    /// The transaction code that started this conversation.
    pub txn_code: TxnCode,
    /// Current lifecycle status.
    pub status: ConversationStatus,
    /// When this conversation was started.
    pub created_at: Instant,
    /// When a message for this conversation was last observed.
    pub last_activity_at: Instant,
    /// When this conversation reached a terminal status, if it has.
    pub ended_at: Option<Instant>,
    /// Set when `abort` records a reason.
    pub error_msg: Option<String>,
    /// Total messages observed (including the one that started it).
    pub message_count: u64,
    /// Bounded history of message payloads, oldest first, capped at
    /// `history_cap` per spec.md §9 ("a memory guard, not a semantic
    /// property").
    pub history: VecDeque<Vec<u8>>,
    /// Free-form attribute bag a handler may stash conversation-scoped state in.
    pub attributes: std::collections::HashMap<String, String>,
}

/// The client/lterm/conv-id/last-flag/payload a dispatcher extracts from an
/// incoming request to hand to [`ConversationManager::update`].
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// The claimed client id.
    pub client_id: ClientId,
    /// The claimed lterm.
    pub lterm: LtermName,
    /// The claimed conversation id.
    pub conv_id: ConvId,
    /// Whether the OTMA `last` flag was set.
    pub last: bool,
    /// The message's data payload, appended to history.
    pub payload: Vec<u8>,
}

/// Owns every tracked conversation and the counter that allocates new ids.
pub struct ConversationManager {
    conversations: Arc<DashMap<ConvId, ConversationState>>,
    counter: Arc<AtomicU64>,
    max_conversations: MaxConversations,
    history_cap: ConversationHistoryCap,
    conversation_timeout: Duration,
}

impl Clone for ConversationManager {
    fn clone(&self) -> Self {
        Self {
            conversations: Arc::clone(&self.conversations),
            counter: Arc::clone(&self.counter),
            max_conversations: self.max_conversations,
            history_cap: self.history_cap,
            conversation_timeout: self.conversation_timeout,
        }
    }
}

impl ConversationManager {
    /// Builds a manager and spawns its periodic expiry sweep (default every
    /// 5 minutes, per spec.md §4.8).
    #[must_use]
    pub fn spawn(
        max_conversations: MaxConversations,
        history_cap: ConversationHistoryCap,
        shutdown: CancellationToken,
    ) -> Self {
        Self::spawn_with_timeout(max_conversations, history_cap, DEFAULT_CONVERSATION_TIMEOUT, shutdown)
    }

    /// As [`spawn`](Self::spawn), with an overridden idle timeout (primarily
    /// for tests).
    #[must_use]
    pub fn spawn_with_timeout(
        max_conversations: MaxConversations,
        history_cap: ConversationHistoryCap,
        conversation_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        let manager = Self {
            conversations: Arc::new(DashMap::new()),
            counter: Arc::new(AtomicU64::new(STARTING_CONV_ID)),
            max_conversations,
            history_cap,
            conversation_timeout,
        };

        let sweeper = manager.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL.min(conversation_timeout));
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => sweeper.expire_idle(),
                }
            }
        });

        manager
    }

    fn next_conv_id(&self) -> ConvId {
        let raw = self.counter.fetch_add(1, Ordering::Relaxed);
        ConvId::try_new(raw).expect("counter starts at 1001 and only increases")
    }

    fn active_count(&self) -> usize {
        self.conversations.iter().filter(|e| e.status == ConversationStatus::Active).count()
    }

    /// Starts a new ACTIVE conversation, failing with
    /// [`ConversationError::CapacityExceeded`] if `max_conversations` are
    /// already ACTIVE.
    pub fn start(
        &self,
        client_id: ClientId,
        lterm: LtermName,
        txn_code: TxnCode,
    ) -> Result<ConversationState, ConversationError> {
        if self.active_count() >= usize::from(self.max_conversations) {
            return Err(ConversationError::CapacityExceeded);
        }
        let now = Instant::now();
        let state = ConversationState {
            conv_id: self.next_conv_id(),
            client_id,
            lterm,
            txn_code,
            status: ConversationStatus::Active,
            created_at: now,
            last_activity_at: now,
            ended_at: None,
            error_msg: None,
            message_count: 1,
            history: VecDeque::new(),
            attributes: std::collections::HashMap::new(),
        };
        self.conversations.insert(state.conv_id, state.clone());
        debug!(conv_id = %state.conv_id, client = %state.client_id, "conversation started");
        Ok(state)
    }

    /// Returns the current state of `conv_id`, refreshing its
    /// `last_activity_at`.
    pub fn get(&self, conv_id: ConvId) -> Result<ConversationState, ConversationError> {
        let mut entry =
            self.conversations.get_mut(&conv_id).ok_or(ConversationError::NotFound(conv_id))?;
        entry.last_activity_at = Instant::now();
        Ok(entry.clone())
    }

    /// Confirms `msg` belongs to `state`'s client/lterm/conv-id tuple.
    pub fn validate(state: &ConversationState, msg: &IncomingMessage) -> Result<(), ConversationError> {
        if state.status.is_terminal() {
            return Err(ConversationError::AlreadyTerminated(state.conv_id));
        }
        if state.conv_id != msg.conv_id || state.client_id != msg.client_id || state.lterm != msg.lterm
        {
            return Err(ConversationError::SequenceMismatch { conv_id: msg.conv_id });
        }
        Ok(())
    }

    /// Validates and folds `msg` into `conv_id`'s tracked state: increments
    /// the message count, appends to the bounded history, and transitions to
    /// COMPLETED if `msg.last` is set.
    pub fn update(&self, msg: &IncomingMessage) -> Result<ConversationState, ConversationError> {
        let mut entry = self
            .conversations
            .get_mut(&msg.conv_id)
            .ok_or(ConversationError::NotFound(msg.conv_id))?;
        Self::validate(&entry, msg)?;

        entry.last_activity_at = Instant::now();
        entry.message_count += 1;
        entry.history.push_back(msg.payload.clone());
        while entry.history.len() > usize::from(self.history_cap) {
            entry.history.pop_front();
        }
        if msg.last {
            entry.status = ConversationStatus::Completed;
            entry.ended_at = Some(Instant::now());
        }
        let snapshot = entry.clone();
        drop(entry);

        if msg.last {
            self.schedule_purge(msg.conv_id);
        }
        Ok(snapshot)
    }

    /// Explicitly ends `conv_id` as COMPLETED (used by transaction
    /// completion when the response itself, rather than the request,
    /// carries the last flag) and schedules its purge after 5 minutes.
    pub fn end(&self, conv_id: ConvId) -> Result<(), ConversationError> {
        let mut entry =
            self.conversations.get_mut(&conv_id).ok_or(ConversationError::NotFound(conv_id))?;
        if entry.status.is_terminal() {
            return Err(ConversationError::AlreadyTerminated(conv_id));
        }
        entry.status = ConversationStatus::Completed;
        entry.ended_at = Some(Instant::now());
        drop(entry);
        self.schedule_purge(conv_id);
        Ok(())
    }

    /// Aborts `conv_id` immediately, recording `reason` and purging it
    /// without delay.
    pub fn abort(&self, conv_id: ConvId, reason: impl Into<String>) -> Result<(), ConversationError> {
        let mut entry =
            self.conversations.get_mut(&conv_id).ok_or(ConversationError::NotFound(conv_id))?;
        if entry.status.is_terminal() {
            return Err(ConversationError::AlreadyTerminated(conv_id));
        }
        entry.status = ConversationStatus::Aborted;
        entry.error_msg = Some(reason.into());
        entry.ended_at = Some(Instant::now());
        drop(entry);
        self.conversations.remove(&conv_id);
        Ok(())
    }

    fn schedule_purge(&self, conv_id: ConvId) {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(COMPLETED_PURGE_DELAY).await;
            manager.conversations.remove(&conv_id);
        });
    }

    fn expire_idle(&self) {
        let now = Instant::now();
        let expired: Vec<ConvId> = self
            .conversations
            .iter()
            .filter(|e| {
                e.status == ConversationStatus::Active
                    && now.duration_since(e.last_activity_at) >= self.conversation_timeout
            })
            .map(|e| e.conv_id)
            .collect();
        for conv_id in &expired {
            if let Some(mut entry) = self.conversations.get_mut(conv_id) {
                entry.status = ConversationStatus::Expired;
                entry.ended_at = Some(now);
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired idle conversations");
        }
    }

    /// Number of conversations currently tracked, in any status.
    #[must_use]
    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    /// Whether no conversations are currently tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }
}
