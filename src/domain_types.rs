//! Shared, validated domain primitives used across the gateway.
//!
//! Every value that crosses a module boundary with a documented range or
//! format constraint is wrapped in a `nutype` newtype here rather than
//! passed around as a bare `u8`/`String`/`usize`. This makes illegal values
//! (an architecture level of 9, an empty client id, a zero-sized segment
//! buffer) unrepresentable instead of merely rejected at runtime.

use nutype::nutype;
use serde::{Deserialize, Serialize};

/// Client-supplied or server-generated identifier for a logical IMS client.
///
/// Format: 1-8 characters drawn from `[A-Z0-9]`, matching the wire field's
/// 8-byte mainframe-encoded slot once right-trimmed of pad characters.
#[nutype(
    validate(len_char_min = 1, len_char_max = 8, predicate = |s: &str| s.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRef, TryFrom)
)]
pub struct ClientId(String);

/// A server-assigned transaction identifier, `TXN<epoch>_<seq>`.
#[nutype(
    validate(len_char_min = 1, len_char_max = 64),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRef, TryFrom)
)]
pub struct TxnId(String);

/// Monotonically increasing conversation identifier, positive by construction.
#[nutype(
    validate(greater = 0),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
        TryFrom, Into
    )
)]
pub struct ConvId(u64);

/// Unique identifier for a single framed message, used for ack/nak correlation.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display))]
pub struct MessageId(uuid::Uuid);

impl MessageId {
    /// Generates a fresh, random message id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(uuid::Uuid::new_v4())
    }
}

/// Identifier of one accepted TCP connection, independent of any client id
/// that connection may later register.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display))]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    /// Generates a fresh connection id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(uuid::Uuid::new_v4())
    }
}

/// 8-character LTERM (logical terminal) destination name.
#[nutype(
    validate(len_char_min = 1, len_char_max = 8),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRef, TryFrom)
)]
pub struct LtermName(String);

/// 8-character transaction code selecting a handler.
#[nutype(
    validate(len_char_min = 1, len_char_max = 8),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRef, TryFrom)
)]
pub struct TxnCode(String);

/// IRM architecture level, constrained to the five wire-documented values.
#[nutype(
    validate(less_or_equal = 5),
    derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, TryFrom, Into)
)]
pub struct ArchitectureLevel(u8);

/// Maximum outbound segment payload size, bounded per the wire format
/// (`4 ≤ LL ≤ 32768`, minus the 4-byte LL/ZZ prefix).
#[nutype(
    validate(greater_or_equal = 8, less_or_equal = 32768),
    default = 32768,
    derive(
        Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, TryFrom, Into, Default
    )
)]
pub struct MaxSegmentSize(usize);

/// Per-client bounded queue capacity.
#[nutype(
    validate(greater = 0),
    default = 1000,
    derive(
        Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, TryFrom, Into, Default
    )
)]
pub struct QueueCapacity(usize);

/// Maximum number of simultaneously ACTIVE conversations.
#[nutype(
    validate(greater = 0),
    default = 1000,
    derive(
        Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, TryFrom, Into, Default
    )
)]
pub struct MaxConversations(usize);

/// Bounded per-conversation message history length (a memory guard, not a
/// semantic property).
#[nutype(
    validate(greater = 0),
    default = 100,
    derive(
        Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, TryFrom, Into, Default
    )
)]
pub struct ConversationHistoryCap(usize);

/// TCP listen port.
#[nutype(
    default = 9999,
    derive(
        Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, TryFrom, Into, Default
    )
)]
pub struct PortNumber(u16);

/// Backend connection pool weight, used by the weighted round-robin balancer.
#[nutype(
    validate(greater = 0),
    default = 1,
    derive(
        Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, TryFrom, Into, Default
    )
)]
pub struct BackendWeight(u32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_should_reject_lowercase() {
        assert!(ClientId::try_new("cobol001").is_err());
    }

    #[test]
    fn client_id_should_accept_valid_format() {
        assert!(ClientId::try_new("COBOL001").is_ok());
    }

    #[test]
    fn client_id_should_reject_empty() {
        assert!(ClientId::try_new("").is_err());
    }

    #[test]
    fn client_id_should_reject_too_long() {
        assert!(ClientId::try_new("ABCDEFGHI").is_err());
    }

    #[test]
    fn conv_id_should_reject_zero() {
        assert!(ConvId::try_new(0).is_err());
    }

    #[test]
    fn conv_id_should_accept_positive() {
        assert!(ConvId::try_new(1001).is_ok());
    }

    #[test]
    fn max_segment_size_should_enforce_wire_bounds() {
        assert!(MaxSegmentSize::try_new(4).is_err());
        assert!(MaxSegmentSize::try_new(33000).is_err());
        assert!(MaxSegmentSize::try_new(8).is_ok());
        assert!(MaxSegmentSize::try_new(32768).is_ok());
    }
}
