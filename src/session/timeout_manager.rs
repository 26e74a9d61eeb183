//! Transaction timeout manager (C6): a single cooperative task driving a
//! timer wheel (`tokio_util::time::DelayQueue`), mapping the IRM's one-byte
//! timeout field to a duration per the documented policy.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::time::DelayQueue;
use tracing::{trace, warn};

use crate::domain_types::{ClientId, TxnId};

const DEFAULT_SECONDS: u64 = 30;
const DEFAULT_MAX_SECONDS: u64 = 3600;

/// Maps the IRM timeout byte to a duration: `0` uses the configured
/// default; `1..=180` is taken literally as seconds; `181..=255` doubles
/// the value and clamps to `max_seconds`.
#[must_use]
pub fn timeout_byte_to_duration(byte: u8, default_seconds: u64, max_seconds: u64) -> Duration {
    let seconds = match byte {
        0 => default_seconds,
        1..=180 => u64::from(byte),
        value => (u64::from(value) * 2).min(max_seconds),
    };
    Duration::from_secs(seconds)
}

/// A transaction's C6 timer fired before it completed.
#[derive(Debug, Clone)]
pub struct TimeoutEvent {
    /// The transaction that timed out.
    pub txn_id: TxnId,
    /// The client the transaction belonged to.
    pub client: ClientId,
}

enum Command {
    Start { txn_id: TxnId, client: ClientId, duration: Duration },
    Cancel(TxnId),
    CancelClient { client: ClientId, reply: oneshot::Sender<usize> },
    Extend { txn_id: TxnId, add: Duration, reply: oneshot::Sender<bool> },
    Shutdown,
}

/// Handle to the background timer task. Cloning is cheap (it clones the
/// command channel); the task itself stops when every handle is dropped or
/// [`shutdown`](Self::shutdown) is called.
#[derive(Clone)]
pub struct TimeoutManager {
    commands: mpsc::UnboundedSender<Command>,
    default_seconds: u64,
    max_seconds: u64,
}

impl TimeoutManager {
    /// Spawns the background task and returns a handle plus the channel of
    /// fired [`TimeoutEvent`]s.
    #[must_use]
    pub fn spawn(default_seconds: u64, max_seconds: u64) -> (Self, mpsc::UnboundedReceiver<TimeoutEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(cmd_rx, event_tx));
        (Self { commands: cmd_tx, default_seconds, max_seconds }, event_rx)
    }

    /// Starts a timer for `txn_id` derived from the IRM's raw timeout byte.
    pub fn start(&self, txn_id: TxnId, client: ClientId, timeout_byte: u8) {
        let duration = timeout_byte_to_duration(timeout_byte, self.default_seconds, self.max_seconds);
        let _ = self.commands.send(Command::Start { txn_id, client, duration });
    }

    /// Cancels a single transaction's timer, if still pending.
    pub fn cancel(&self, txn_id: TxnId) {
        let _ = self.commands.send(Command::Cancel(txn_id));
    }

    /// Cancels every pending timer for `client`.
    ///
    /// The returned count reflects how many timers this implementation
    /// found and removed at call time; callers must not rely on it for
    /// correctness (it is informational only, matching the documented
    /// contract for this operation).
    pub async fn cancel_client(&self, client: ClientId) -> usize {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(Command::CancelClient { client, reply: reply_tx }).is_err() {
            return 0;
        }
        reply_rx.await.unwrap_or(0)
    }

    /// Extends a pending timer's remaining duration by `add`. Returns
    /// whether the timer was still pending.
    pub async fn extend(&self, txn_id: TxnId, add: Duration) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(Command::Extend { txn_id, add, reply: reply_tx }).is_err() {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Stops the background task.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

async fn run(mut commands: mpsc::UnboundedReceiver<Command>, events: mpsc::UnboundedSender<TimeoutEvent>) {
    let mut wheel: DelayQueue<TxnId> = DelayQueue::new();
    let mut keys: HashMap<TxnId, (tokio_util::time::delay_queue::Key, ClientId)> = HashMap::new();
    let mut by_client: HashMap<ClientId, HashSet<TxnId>> = HashMap::new();

    loop {
        tokio::select! {
            maybe_cmd = commands.recv() => {
                match maybe_cmd {
                    Some(Command::Start { txn_id, client, duration }) => {
                        let key = wheel.insert(txn_id.clone(), duration);
                        by_client.entry(client.clone()).or_default().insert(txn_id.clone());
                        keys.insert(txn_id, (key, client));
                    }
                    Some(Command::Cancel(txn_id)) => {
                        if let Some((key, client)) = keys.remove(&txn_id) {
                            wheel.try_remove(&key);
                            if let Some(set) = by_client.get_mut(&client) {
                                set.remove(&txn_id);
                            }
                        }
                    }
                    Some(Command::CancelClient { client, reply }) => {
                        let mut count = 0;
                        if let Some(txn_ids) = by_client.remove(&client) {
                            for txn_id in txn_ids {
                                if let Some((key, _)) = keys.remove(&txn_id) {
                                    wheel.try_remove(&key);
                                    count += 1;
                                }
                            }
                        }
                        let _ = reply.send(count);
                    }
                    Some(Command::Extend { txn_id, add, reply }) => {
                        let found = if let Some((key, _)) = keys.get(&txn_id) {
                            let new_deadline = wheel.deadline(key) + add;
                            wheel.reset_at(key, new_deadline);
                            true
                        } else {
                            false
                        };
                        let _ = reply.send(found);
                    }
                    Some(Command::Shutdown) | None => break,
                }
            }
            Some(expired) = wheel.next() => {
                let txn_id = expired.into_inner();
                if let Some((_, client)) = keys.remove(&txn_id) {
                    if let Some(set) = by_client.get_mut(&client) {
                        set.remove(&txn_id);
                    }
                    trace!(%txn_id, %client, "transaction timer fired");
                    if events.send(TimeoutEvent { txn_id, client }).is_err() {
                        warn!("timeout event receiver dropped; continuing to drain timers");
                    }
                }
            }
        }
    }
}
