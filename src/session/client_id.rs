//! Client-id generation and registration (C4): unique ids with a
//! duplicate-kill policy, enforcing at most one connection per client id.

use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use thiserror::Error;
use tracing::{info, warn};

use crate::domain_types::{ClientId, ConnectionId};

const SEQUENCE_MODULUS: u32 = 100_000;
const DEFAULT_PREFIX: &str = "GEN";

/// Errors raised by [`ClientIdManager`].
#[derive(Debug, Error)]
pub enum ClientIdError {
    /// `register` was called for an id that is already held by a live
    /// connection and `handle_duplicate` was not used.
    #[error("client id {0} is already registered")]
    AlreadyRegistered(ClientId),
}

/// Generates, registers, and unregisters client ids, enforcing that at most
/// one connection holds any given id at a time.
///
/// One `DashMap` protects the registry: single-key reads/writes are
/// lock-free, and the two-step "evict then insert" duplicate-kill sequence
/// is performed under the map's own per-shard lock via `entry`.
pub struct ClientIdManager {
    registrations: DashMap<ClientId, ConnectionId>,
    sequence: AtomicU32,
}

impl Default for ClientIdManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientIdManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self { registrations: DashMap::new(), sequence: AtomicU32::new(0) }
    }

    /// Generates an id of the form `<prefix><5-digit-sequence>`, retrying on
    /// collision with the live set.
    #[must_use]
    pub fn generate(&self) -> ClientId {
        loop {
            let seq = self.sequence.fetch_add(1, Ordering::Relaxed) % SEQUENCE_MODULUS;
            let candidate = format!("{DEFAULT_PREFIX}{seq:05}");
            if let Ok(client_id) = ClientId::try_new(candidate) {
                if !self.registrations.contains_key(&client_id) {
                    return client_id;
                }
            }
        }
    }

    /// Registers `client_id` for `conn_id`. Fails if the id is already held.
    pub fn register(&self, client_id: ClientId, conn_id: ConnectionId) -> Result<(), ClientIdError> {
        match self.registrations.entry(client_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ClientIdError::AlreadyRegistered(client_id))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(conn_id);
                Ok(())
            }
        }
    }

    /// Removes `client_id` from the registry, if present.
    pub fn unregister(&self, client_id: &ClientId) {
        self.registrations.remove(client_id);
    }

    /// Handles a registration request for an id that may already be held.
    ///
    /// When `cancel_existing` is true, forcibly evicts the prior holder and
    /// registers `conn_id`, returning the evicted connection id. Otherwise
    /// returns [`ClientIdError::AlreadyRegistered`] without changing state.
    pub fn handle_duplicate(
        &self,
        client_id: ClientId,
        conn_id: ConnectionId,
        cancel_existing: bool,
    ) -> Result<Option<ConnectionId>, ClientIdError> {
        match self.registrations.entry(client_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if cancel_existing {
                    let evicted = entry.insert(conn_id);
                    info!(%client_id, %evicted, "evicted prior holder of duplicate client id");
                    Ok(Some(evicted))
                } else {
                    warn!(%client_id, "rejected duplicate client id registration");
                    Err(ClientIdError::AlreadyRegistered(client_id))
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(conn_id);
                Ok(None)
            }
        }
    }

    /// Returns the connection currently holding `client_id`, if any.
    #[must_use]
    pub fn lookup(&self, client_id: &ClientId) -> Option<ConnectionId> {
        self.registrations.get(client_id).map(|entry| *entry.value())
    }

    /// Number of client ids currently registered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Whether no client ids are currently registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}
