//! Per-connection session state (C7), built from a client-id manager (C4),
//! a per-client message queue (C5), and a transaction timeout manager (C6).

pub mod client_id;
pub mod manager;
pub mod message_queue;
pub mod timeout_manager;

pub use client_id::{ClientIdError, ClientIdManager};
pub use manager::{ClientSession, SessionManager};
pub use message_queue::{MessageQueue, QueuedMessage};
pub use timeout_manager::{TimeoutEvent, TimeoutManager};
