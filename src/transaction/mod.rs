//! Transaction-state lifecycle (C9): tracks a single in-flight request from
//! `start` through `complete`/`abort`, and folds conversational requests
//! into the C8 conversation manager.

pub mod manager;

pub use manager::{
    MessageType, ResponseMsg, StartRequest, TransactionManager, TransactionState, TransactionStatus,
};
