//! Error taxonomy for the gateway.
//!
//! Mirrors the error categories: protocol, security, conversation,
//! transaction, pool, and system-level failures each get their own enum so
//! call sites can match on exactly the variants relevant to them, and a
//! top-level [`GatewayError`] aggregates all of them for callers (such as
//! the dispatcher) that need a single error type to propagate with `?`.

use thiserror::Error;

use crate::domain_types::{ClientId, ConvId, TxnId};

/// Errors raised while decoding or encoding a framed message (C2/C3).
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Declared total length fell outside `[36, 10 MiB]`.
    #[error("invalid total length {length} (expected 36..=10485760)")]
    InvalidLength {
        /// The length value that was rejected.
        length: u32,
    },

    /// Fewer bytes were available than a declared length required.
    #[error("underflow: needed {needed} bytes, had {available}")]
    Underflow {
        /// Bytes required to complete the declared frame.
        needed: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// A segment's `LL` field was outside `[4, 32768]`.
    #[error("bad segment length {length} (expected 4..=32768)")]
    BadSegmentLength {
        /// The rejected `LL` value.
        length: u16,
    },

    /// The IRM's architecture byte named a level this codec does not support.
    #[error("unsupported architecture level {level}")]
    UnsupportedArchitecture {
        /// The rejected architecture byte.
        level: u8,
    },

    /// The IRM fixed or user portion failed a structural check.
    #[error("malformed IRM header: {reason}")]
    BadIrm {
        /// Human-readable reason, also suitable for the error frame's message field.
        reason: String,
    },
}

/// Errors raised while parsing or validating a security context (C10).
#[derive(Debug, Error)]
pub enum SecurityError {
    /// The header's auth-method byte could not be turned into a token.
    #[error("failed to parse security token: {reason}")]
    TokenParse {
        /// Reason the token could not be parsed.
        reason: String,
    },

    /// The token's `expires_at` is in the past relative to the check time.
    #[error("security token expired")]
    TokenExpired,

    /// The auth-method byte named a method this parser does not support.
    #[error("unsupported authentication method {method}")]
    UnsupportedAuth {
        /// The rejected auth-method byte.
        method: u8,
    },

    /// The principal lacks authority to execute the named transaction.
    #[error("principal {user_id} is not authorized to execute transaction {txn_code}")]
    UnauthorizedTransaction {
        /// The principal's user id.
        user_id: String,
        /// The transaction code that was denied.
        txn_code: String,
    },

    /// The principal lacks authority over the named resource.
    #[error("principal {user_id} is not authorized to access resource {resource}")]
    UnauthorizedResource {
        /// The principal's user id.
        user_id: String,
        /// The resource that was denied.
        resource: String,
    },

    /// A general validation failure not covered by the more specific variants.
    #[error("security validation failed: {reason}")]
    ValidationFailed {
        /// Reason validation failed.
        reason: String,
    },
}

/// Errors raised by the conversation manager (C8).
#[derive(Debug, Error)]
pub enum ConversationError {
    /// No conversation is registered under the given id.
    #[error("conversation {0} not found")]
    NotFound(ConvId),

    /// `max_conversations` ACTIVE conversations are already tracked.
    #[error("conversation capacity exceeded")]
    CapacityExceeded,

    /// An incoming message's client/lterm/conv-id tuple did not match the
    /// conversation's recorded state.
    #[error("message does not match conversation {conv_id} (client or lterm mismatch)")]
    SequenceMismatch {
        /// The conversation the message claimed to belong to.
        conv_id: ConvId,
    },

    /// The conversation is already in a terminal state (COMPLETED, ABORTED,
    /// or EXPIRED).
    #[error("conversation {0} is already terminated")]
    AlreadyTerminated(ConvId),
}

/// Errors raised by the transaction-state manager (C9).
#[derive(Debug, Error)]
pub enum TransactionError {
    /// No transaction is registered under the given id.
    #[error("transaction {0} not found")]
    NotFound(TxnId),

    /// No registered handler declared it can handle this request.
    #[error("no handler registered for transaction code {0}")]
    HandlerNotFound(String),

    /// The transaction's C6 timer fired before a response was produced.
    #[error("transaction {0} timed out")]
    Timeout(TxnId),

    /// An invalid state transition was attempted (e.g. completing a
    /// COMPLETED transaction).
    #[error("invalid transition for transaction {txn_id}: {from} -> {to}")]
    InvalidTransition {
        /// The transaction whose state machine rejected the transition.
        txn_id: TxnId,
        /// The state it was in.
        from: &'static str,
        /// The state the caller tried to move it to.
        to: &'static str,
    },

    /// The handler itself returned an error while processing the request.
    #[error("handler failed to process transaction {txn_id}: {reason}")]
    ProcessingError {
        /// The transaction being processed.
        txn_id: TxnId,
        /// The handler's error message.
        reason: String,
    },
}

/// Errors raised by the backend connection pool (C12).
#[derive(Debug, Error)]
pub enum PoolError {
    /// No backend is registered under the requested name, or none are in
    /// rotation.
    #[error("no backends available")]
    NoBackends,

    /// `acquire` did not obtain a connection within its timeout.
    #[error("timed out acquiring a connection from backend {0}")]
    AcquireTimeout(String),

    /// Establishing a new connection to the backend failed.
    #[error("failed to connect to backend {backend}: {reason}")]
    ConnectFailed {
        /// The backend that could not be reached.
        backend: String,
        /// The underlying failure reason.
        reason: String,
    },
}

/// System-level failures that are not specific to one subsystem.
#[derive(Debug, Error)]
pub enum SystemError {
    /// A per-client queue rejected an enqueue because it was at capacity.
    #[error("queue full for client {0}")]
    QueueFull(ClientId),

    /// The process is out of memory or hit a configured resource ceiling.
    #[error("out of memory")]
    OutOfMemory,

    /// The server is mid-shutdown and cannot accept more work.
    #[error("server is shutting down")]
    Shutdown,
}

/// Aggregate error type for call sites (the dispatcher, the server loop)
/// that need to propagate any subsystem's failure with a single `?`.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A protocol framing/codec failure (C2/C3).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A security parsing/validation failure (C10).
    #[error(transparent)]
    Security(#[from] SecurityError),

    /// A conversation-manager failure (C8).
    #[error(transparent)]
    Conversation(#[from] ConversationError),

    /// A transaction-manager failure (C9).
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// A backend-pool failure (C12).
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// A system-level failure.
    #[error(transparent)]
    System(#[from] SystemError),

    /// Configuration failed validation at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An I/O failure on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Return-code / reason-code pair attached to every error frame, per the
/// user-visible failure contract: "every error frame carries a
/// human-readable 80-byte message field ... alongside numeric return/reason
/// codes suitable for automated dispatch by the client."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnReason {
    /// The numeric return code.
    pub return_code: u16,
    /// The numeric reason code, qualifying the return code.
    pub reason_code: u16,
}

impl GatewayError {
    /// Maps this error onto the return/reason code pair an error frame
    /// should carry, per §7's propagation policy.
    #[must_use]
    pub fn return_reason(&self) -> ReturnReason {
        match self {
            GatewayError::Transaction(TransactionError::Timeout(_)) => {
                ReturnReason { return_code: 408, reason_code: 1 }
            }
            GatewayError::Security(_) => ReturnReason { return_code: 9001, reason_code: 1 },
            GatewayError::Pool(_) => ReturnReason { return_code: 503, reason_code: 1 },
            GatewayError::Protocol(ProtocolError::InvalidLength { .. }) => {
                ReturnReason { return_code: 12, reason_code: 2 }
            }
            GatewayError::Protocol(_) => ReturnReason { return_code: 12, reason_code: 1 },
            GatewayError::Conversation(_) | GatewayError::Transaction(_) => {
                ReturnReason { return_code: 16, reason_code: 2 }
            }
            GatewayError::System(SystemError::QueueFull(_)) => {
                ReturnReason { return_code: 0, reason_code: 0 }
            }
            _ => ReturnReason { return_code: 16, reason_code: 1 },
        }
    }

    /// The human-readable message to place in an error frame's 80-byte
    /// message field (truncated by the caller if necessary).
    #[must_use]
    pub fn user_message(&self) -> String {
        self.to_string()
    }
}
