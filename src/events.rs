//! # Events — Progress Bus
//!
//! Publish/subscribe fabric between producers (block runs, single-exponent
//! jobs) and observers. Each block id or job id is a topic; each observer
//! connection holds one [`Subscription`], a bounded channel registered under
//! that topic.
//!
//! ## Delivery
//!
//! | Situation | Behavior |
//! |-----------|----------|
//! | Subscriber has room | Message queued for it |
//! | Subscriber buffer full | Message dropped for that subscriber only, counted |
//! | Subscriber gone | Sender pruned on the next publish |
//! | `close(topic)` | Topic set removed; every channel ends after its backlog |
//!
//! `publish` never blocks and never fails. The subscriber set is snapshotted
//! under the lock and sent to after releasing it, so observers may come and go
//! during a publish.
//!
//! End-of-stream is the channel closing: [`Subscription::recv`] returns `None`
//! once the topic is closed and the backlog is consumed. Because closure is a
//! channel state rather than a queued message, it reaches subscribers whose
//! buffer was full at close time.
//!
//! Block runs use [`BlockBus`] (topics are block ids); jobs use [`JobBus`]
//! (topics are job uuids).

use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::lock_or_recover;

/// Default per-subscriber buffer.
pub const DEFAULT_BUFFER: usize = 256;

/// Messages carried on a block topic. Serialized without a tag; each variant's
/// field set identifies it.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BusMessage {
    /// Engine checkpoint for one candidate.
    Progress { block_id: i64, candidate: i64, pct: u64 },
    /// Snapshot after a unit completes.
    Coverage {
        block_id: i64,
        last_candidate: i64,
        tested: i64,
        total: i64,
    },
    /// Terminal message of a run. `stopped` is omitted when start found
    /// nothing to do.
    Finished {
        block_id: i64,
        tested: i64,
        total: i64,
        done: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        stopped: Option<bool>,
    },
    /// Stop acknowledged; the run is draining.
    Stopped { block_id: i64, stopped: bool },
}

/// Engine checkpoint of a single-exponent job. `digest` is the hex SHA-256
/// of the residue at `iteration`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobProgress {
    pub iteration: u64,
    pub pct: u64,
    pub digest: String,
}

/// JSON text of a bus message, `{}` if it cannot be encoded.
pub fn to_json<M: Serialize>(message: &M) -> String {
    serde_json::to_string(message).unwrap_or_else(|_| "{}".to_string())
}

pub type BlockBus = ProgressBus<i64, BusMessage>;
pub type BlockSubscription = Subscription<i64, BusMessage>;
pub type JobBus = ProgressBus<Uuid, JobProgress>;
pub type JobSubscription = Subscription<Uuid, JobProgress>;

type Sender<M> = mpsc::Sender<Arc<M>>;

struct Topics<K, M> {
    inner: Mutex<HashMap<K, HashMap<u64, Sender<M>>>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

impl<K: Eq + Hash, M> Topics<K, M> {
    fn remove(&self, topic: &K, id: u64) -> bool {
        let mut map = lock_or_recover(&self.inner);
        let Some(set) = map.get_mut(topic) else {
            return false;
        };
        let removed = set.remove(&id).is_some();
        if set.is_empty() {
            map.remove(topic);
        }
        removed
    }
}

/// One observer's channel on a topic. Dropping it unsubscribes.
pub struct Subscription<K: Eq + Hash, M> {
    topic: K,
    id: u64,
    rx: mpsc::Receiver<Arc<M>>,
    topics: Weak<Topics<K, M>>,
}

impl<K: Eq + Hash + Copy, M> Subscription<K, M> {
    pub fn topic(&self) -> K {
        self.topic
    }

    /// Next message, or `None` once the topic has been closed and the
    /// backlog is drained.
    pub async fn recv(&mut self) -> Option<Arc<M>> {
        self.rx.recv().await
    }

    /// Non-blocking receive. `Err(Disconnected)` is end-of-stream.
    pub fn try_recv(&mut self) -> Result<Arc<M>, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }
}

impl<K: Eq + Hash, M> Drop for Subscription<K, M> {
    fn drop(&mut self) {
        if let Some(topics) = self.topics.upgrade() {
            topics.remove(&self.topic, self.id);
        }
    }
}

/// Topic registry shared by publishers and observer connections.
pub struct ProgressBus<K, M> {
    topics: Arc<Topics<K, M>>,
    buffer: usize,
}

impl<K: Eq + Hash + Copy + Debug, M> Default for ProgressBus<K, M> {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl<K: Eq + Hash + Copy + Debug, M> ProgressBus<K, M> {
    pub fn new(buffer: usize) -> Self {
        ProgressBus {
            topics: Arc::new(Topics {
                inner: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                dropped: AtomicU64::new(0),
            }),
            buffer: buffer.max(1),
        }
    }

    /// Per-subscriber channel capacity.
    pub fn buffer(&self) -> usize {
        self.buffer
    }

    /// Register a new channel under `topic`.
    pub fn subscribe(&self, topic: K) -> Subscription<K, M> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.topics.next_id.fetch_add(1, Ordering::Relaxed);
        lock_or_recover(&self.topics.inner)
            .entry(topic)
            .or_default()
            .insert(id, tx);
        Subscription {
            topic,
            id,
            rx,
            topics: Arc::downgrade(&self.topics),
        }
    }

    /// Remove a subscription's channel. Returns whether it was still
    /// registered (false after the topic was closed).
    pub fn unsubscribe(&self, sub: &Subscription<K, M>) -> bool {
        self.topics.remove(&sub.topic, sub.id)
    }

    /// Deliver to every channel registered on `topic` at the time of the
    /// call. Returns the number of channels that accepted the message.
    pub fn publish(&self, topic: K, message: M) -> usize {
        let snapshot: Vec<(u64, Sender<M>)> = match lock_or_recover(&self.topics.inner).get(&topic)
        {
            Some(set) => set.iter().map(|(id, tx)| (*id, tx.clone())).collect(),
            None => return 0,
        };
        let message = Arc::new(message);
        let mut delivered = 0;
        for (id, tx) in snapshot {
            match tx.try_send(Arc::clone(&message)) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.topics.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        ?topic,
                        subscriber = id,
                        "subscriber buffer full, message dropped"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.topics.remove(&topic, id);
                }
            }
        }
        delivered
    }

    /// End the stream for every current subscriber of `topic` and clear the
    /// set. Later subscribers start a fresh set.
    pub fn close(&self, topic: K) -> usize {
        let removed = lock_or_recover(&self.topics.inner).remove(&topic);
        removed.map(|set| set.len()).unwrap_or(0)
    }

    pub fn subscriber_count(&self, topic: K) -> usize {
        lock_or_recover(&self.topics.inner)
            .get(&topic)
            .map(|set| set.len())
            .unwrap_or(0)
    }

    pub fn total_subscribers(&self) -> usize {
        lock_or_recover(&self.topics.inner)
            .values()
            .map(|set| set.len())
            .sum()
    }

    /// Deliveries dropped because a subscriber buffer was full.
    pub fn dropped(&self) -> u64 {
        self.topics.dropped.load(Ordering::Relaxed)
    }
}
