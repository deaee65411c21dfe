use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Unique subscriber identifier. Ids are minted from uuid v7, so a removed
/// subscriber's id never comes back.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub String);

impl Default for SubscriberId {
    fn default() -> Self {
        Self(format!("sub_{}", Uuid::now_v7()))
    }
}

impl SubscriberId {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a targeted send did not reach its subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("send queue full")]
    QueueFull,
    #[error("channel closed")]
    Closed,
    #[error("no such subscriber")]
    Unknown,
}

/// An open output channel plus its liveness flag.
pub struct Subscriber {
    pub id: SubscriberId,
    tx: mpsc::Sender<Arc<String>>,
    open: AtomicBool,
}

impl Subscriber {
    fn new(id: SubscriberId, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            id,
            tx,
            open: AtomicBool::new(true),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    fn try_send(&self, frame: Arc<String>) -> Result<(), SendError> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SendError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }
}

/// Registry of currently-open subscribers for one delivery pattern.
///
/// The streaming and duplex sides each hold their own instance, so a
/// subscriber lives in exactly one registry. All sends are best-effort
/// `try_send`: a slow or dead subscriber can never stall a fan-out.
pub struct SubscriberRegistry {
    subscribers: DashMap<SubscriberId, Arc<Subscriber>>,
    queue_capacity: usize,
}

/// Outcome of one pruning fan-out pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub removed: usize,
}

impl SubscriberRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            queue_capacity,
        }
    }

    /// Add a subscriber and hand back its id plus the receiving end of its
    /// frame queue.
    pub fn register(&self) -> (SubscriberId, mpsc::Receiver<Arc<String>>) {
        let id = SubscriberId::new();
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.subscribers
            .insert(id.clone(), Arc::new(Subscriber::new(id.clone(), tx)));
        (id, rx)
    }

    /// Remove a subscriber. The entry is marked closed first so an
    /// in-flight fan-out still holding it skips it.
    pub fn unregister(&self, id: &SubscriberId) -> bool {
        match self.subscribers.remove(id) {
            Some((_, subscriber)) => {
                subscriber.open.store(false, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Flip a subscriber to closed without removing it. Periodic duplex
    /// fan-out skips closed entries; the connection teardown removes them.
    pub fn mark_closed(&self, id: &SubscriberId) {
        if let Some(subscriber) = self.subscribers.get(id) {
            subscriber.open.store(false, Ordering::Relaxed);
        }
    }

    pub fn contains(&self, id: &SubscriberId) -> bool {
        self.subscribers.contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Drop every subscriber (process shutdown).
    pub fn clear(&self) {
        self.subscribers.clear();
    }

    /// Send one frame to one subscriber.
    pub fn send_to(&self, id: &SubscriberId, frame: Arc<String>) -> Result<(), SendError> {
        match self.subscribers.get(id) {
            Some(subscriber) => subscriber.try_send(frame),
            None => Err(SendError::Unknown),
        }
    }

    /// Deliver the shared frame to every subscriber, pruning those whose
    /// channel failed. One bad channel never affects the others.
    pub fn fan_out(&self, frame: &Arc<String>) -> FanOut {
        let mut delivered = 0;
        let mut failed = Vec::new();
        for entry in self.subscribers.iter() {
            match entry.value().try_send(Arc::clone(frame)) {
                Ok(()) => delivered += 1,
                Err(reason) => {
                    tracing::warn!(
                        subscriber = %entry.key(),
                        %reason,
                        "dropping subscriber after failed delivery"
                    );
                    failed.push(entry.key().clone());
                }
            }
        }
        for id in &failed {
            self.unregister(id);
        }
        FanOut {
            delivered,
            removed: failed.len(),
        }
    }

    /// Deliver the shared frame to every open subscriber except `skip`.
    /// Closed subscribers are passed over, not removed.
    pub fn fan_out_open(&self, frame: &Arc<String>, skip: Option<&SubscriberId>) -> usize {
        let mut delivered = 0;
        for entry in self.subscribers.iter() {
            if Some(entry.key()) == skip || !entry.value().is_open() {
                continue;
            }
            if entry.value().try_send(Arc::clone(frame)).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}
