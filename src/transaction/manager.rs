//! Transaction-state manager (C9).
//!
//! Grounded on the teacher's `MessageRouter` trait shape (async methods
//! returning `Result<_, RouterError>`) for the `start`/`complete`/`abort`
//! envelope, and on `ConversationManagerImpl` for the terminal-state
//! bookkeeping idiom; `InvalidTransition` mirrors the teacher's
//! `RegistryError::InvalidStateTransition { from, to }`.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

use crate::codec::frame::{IrmHeader, OtmaHeader};
use crate::conversation::manager::{ConversationManager, IncomingMessage};
use crate::domain_types::{ClientId, ConvId, LtermName, TxnCode, TxnId};
use crate::error::{GatewayError, TransactionError};

/// Category a request was classified into from its OTMA flags, per
/// spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// A single-shot, non-conversational transaction request.
    Transaction,
    /// Part of a multi-message conversation (see [`super::super::conversation`]).
    Conversational,
    /// A response frame flowing back toward a client.
    Response,
    /// A client-originated command (e.g. `ACK`/`NAK`/`CANCEL_TIMER`).
    Command,
    /// A status/system message, handled outside C10/C9 entirely in practice.
    Status,
}

/// Lifecycle status of a [`TransactionState`]. Only `Started` may transition;
/// the other two are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Accepted and awaiting completion or abort.
    Started,
    /// Completed normally.
    Completed,
    /// Aborted, with a recorded reason.
    Aborted,
}

impl TransactionStatus {
    const fn name(self) -> &'static str {
        match self {
            Self::Started => "STARTED",
            Self::Completed => "COMPLETED",
            Self::Aborted => "ABORTED",
        }
    }
}

/// The request fields needed to `start` a transaction.
#[derive(Debug, Clone)]
pub struct StartRequest {
    /// The requesting client.
    pub client_id: ClientId,
    /// The transaction code to run.
    pub txn_code: TxnCode,
    /// The destination lterm.
    pub lterm: LtermName,
    /// How this request was classified from its OTMA flags.
    pub message_type: MessageType,
    /// The conversation this request belongs to, if it named one. `None`
    /// for a conversational first message (a new conversation is started).
    pub conv_id: Option<ConvId>,
    /// The raw request payload, kept for diagnostics and conversation history.
    pub request_msg: Vec<u8>,
    /// The originating IRM header, retained so a timeout firing after this
    /// request has left the dispatcher's local scope can still echo it back
    /// in an error frame.
    pub request_irm: IrmHeader,
    /// The originating OTMA header, if any, retained for the same reason.
    pub request_otma: Option<OtmaHeader>,
}

/// A handler's (or caller's) response to a started transaction.
#[derive(Debug, Clone)]
pub struct ResponseMsg {
    /// The response payload.
    pub payload: Vec<u8>,
    /// Whether this is the final message of a conversation.
    pub last: bool,
}

/// A single in-flight (or recently finished) transaction's tracked state.
#[derive(Debug, Clone)]
pub struct TransactionState {
    /// Server-synthesized transaction id, `TXN<epoch>_<seq>`.
    pub txn_id: TxnId,
    /// The requesting client.
    pub client_id: ClientId,
    /// The transaction code.
    pub txn_code: TxnCode,
    /// The destination lterm.
    pub lterm: LtermName,
    /// The request's classified message type.
    pub message_type: MessageType,
    /// Whether this transaction is part of a conversation.
    pub conversational: bool,
    /// The conversation this transaction belongs to, if conversational.
    pub conv_id: Option<ConvId>,
    /// Current lifecycle status.
    pub status: TransactionStatus,
    /// When this transaction started.
    pub start_time: Instant,
    /// When this transaction reached a terminal status, if it has.
    pub end_time: Option<Instant>,
    /// The original request payload.
    pub request_msg: Vec<u8>,
    /// The originating IRM header (see [`StartRequest::request_irm`]).
    pub request_irm: IrmHeader,
    /// The originating OTMA header, if any.
    pub request_otma: Option<OtmaHeader>,
    /// The response payload, once completed.
    pub response_msg: Option<Vec<u8>>,
    /// The abort reason, once aborted.
    pub error_msg: Option<String>,
}

/// Owns every tracked transaction and the conversation manager (C8) that
/// conversational transactions fold into.
pub struct TransactionManager {
    transactions: Arc<DashMap<TxnId, TransactionState>>,
    seq: Arc<AtomicU64>,
    conversations: ConversationManager,
}

impl TransactionManager {
    /// Builds a manager over an already-spawned [`ConversationManager`].
    #[must_use]
    pub fn new(conversations: ConversationManager) -> Self {
        Self { transactions: Arc::new(DashMap::new()), seq: Arc::new(AtomicU64::new(1)), conversations }
    }

    /// The conversation manager this transaction manager folds conversational
    /// requests into, exposed for handlers that need direct C8 access
    /// (e.g. to inspect history).
    #[must_use]
    pub fn conversations(&self) -> &ConversationManager {
        &self.conversations
    }

    fn next_txn_id(&self) -> TxnId {
        let epoch = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs());
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        TxnId::try_new(format!("TXN{epoch}_{seq}")).expect("synthesized id respects the length bound")
    }

    /// Synthesizes a transaction id and, for conversational requests, either
    /// starts a new conversation (when `conv_id` is absent) or validates and
    /// updates an existing one.
    pub fn start(&self, request: StartRequest) -> Result<TransactionState, GatewayError> {
        let conversational = matches!(request.message_type, MessageType::Conversational);
        let conv_id = if conversational {
            match request.conv_id {
                Some(conv_id) => {
                    let msg = IncomingMessage {
                        client_id: request.client_id.clone(),
                        lterm: request.lterm.clone(),
                        conv_id,
                        last: false,
                        payload: request.request_msg.clone(),
                    };
                    self.conversations.update(&msg)?;
                    Some(conv_id)
                }
                None => {
                    let state = self.conversations.start(
                        request.client_id.clone(),
                        request.lterm.clone(),
                        request.txn_code.clone(),
                    )?;
                    Some(state.conv_id)
                }
            }
        } else {
            None
        };

        let txn_id = self.next_txn_id();
        let state = TransactionState {
            txn_id: txn_id.clone(),
            client_id: request.client_id,
            txn_code: request.txn_code,
            lterm: request.lterm,
            message_type: request.message_type,
            conversational,
            conv_id,
            status: TransactionStatus::Started,
            start_time: Instant::now(),
            end_time: None,
            request_msg: request.request_msg,
            request_irm: request.request_irm,
            request_otma: request.request_otma,
            response_msg: None,
            error_msg: None,
        };
        self.transactions.insert(txn_id, state.clone());
        Ok(state)
    }

    /// Returns the current state of `txn_id`.
    pub fn get(&self, txn_id: &TxnId) -> Result<TransactionState, GatewayError> {
        self.transactions
            .get(txn_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| TransactionError::NotFound(txn_id.clone()).into())
    }

    /// Transitions `txn_id` STARTED -> COMPLETED, recording `response`. If
    /// the transaction is conversational and `response.last` is set, ends
    /// its C8 conversation.
    pub fn complete(&self, txn_id: &TxnId, response: ResponseMsg) -> Result<TransactionState, GatewayError> {
        let mut entry = self
            .transactions
            .get_mut(txn_id)
            .ok_or_else(|| TransactionError::NotFound(txn_id.clone()))?;
        if entry.status != TransactionStatus::Started {
            return Err(TransactionError::InvalidTransition {
                txn_id: txn_id.clone(),
                from: entry.status.name(),
                to: TransactionStatus::Completed.name(),
            }
            .into());
        }
        entry.status = TransactionStatus::Completed;
        entry.end_time = Some(Instant::now());
        entry.response_msg = Some(response.payload);
        let conv_id = entry.conv_id;
        let conversational = entry.conversational;
        let snapshot = entry.clone();
        drop(entry);

        if conversational && response.last {
            if let Some(conv_id) = conv_id {
                self.conversations.end(conv_id)?;
            }
        }
        Ok(snapshot)
    }

    /// Transitions `txn_id` STARTED -> ABORTED, recording `reason`. If the
    /// transaction is conversational, aborts its C8 conversation too.
    pub fn abort(
        &self,
        txn_id: &TxnId,
        reason: impl Into<String>,
    ) -> Result<TransactionState, GatewayError> {
        let reason = reason.into();
        let mut entry = self
            .transactions
            .get_mut(txn_id)
            .ok_or_else(|| TransactionError::NotFound(txn_id.clone()))?;
        if entry.status != TransactionStatus::Started {
            return Err(TransactionError::InvalidTransition {
                txn_id: txn_id.clone(),
                from: entry.status.name(),
                to: TransactionStatus::Aborted.name(),
            }
            .into());
        }
        entry.status = TransactionStatus::Aborted;
        entry.end_time = Some(Instant::now());
        entry.error_msg = Some(reason.clone());
        let conv_id = entry.conv_id;
        let conversational = entry.conversational;
        let snapshot = entry.clone();
        drop(entry);

        if conversational {
            if let Some(conv_id) = conv_id {
                self.conversations.abort(conv_id, reason)?;
            }
        }
        Ok(snapshot)
    }

    /// Runs `start`, then `processor`, then `complete` or `abort` depending
    /// on the processor's outcome.
    pub async fn process<F, Fut>(
        &self,
        request: StartRequest,
        processor: F,
    ) -> Result<TransactionState, GatewayError>
    where
        F: FnOnce(TransactionState) -> Fut,
        Fut: Future<Output = Result<ResponseMsg, String>>,
    {
        let started = self.start(request)?;
        let txn_id = started.txn_id.clone();
        match processor(started).await {
            Ok(response) => self.complete(&txn_id, response),
            Err(reason) => self.abort(&txn_id, reason),
        }
    }

    /// Number of transactions currently tracked, in any status.
    #[must_use]
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    /// Whether no transactions are currently tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}
