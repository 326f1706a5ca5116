//! Notification Hub - per-asset multicast of estimates
//!
//! Each subscriber owns a bounded queue. Publishing never waits: when a
//! subscriber's queue is full the new estimate is dropped for that
//! subscriber only and its existing backlog is kept.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;

use crate::types::{AssetId, Estimate};

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

pub type SubscriptionId = u64;

#[derive(Debug)]
struct Subscriber {
    id: SubscriptionId,
    tx: mpsc::Sender<Estimate>,
}

/// Receiving end of one subscription
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    asset: AssetId,
    rx: mpsc::Receiver<Estimate>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn asset(&self) -> &AssetId {
        &self.asset
    }

    /// Next estimate, or `None` once unsubscribed (after the backlog drains)
    pub async fn recv(&mut self) -> Option<Estimate> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Estimate, TryRecvError> {
        self.rx.try_recv()
    }

    pub fn into_stream(self) -> ReceiverStream<Estimate> {
        ReceiverStream::new(self.rx)
    }
}

/// Outcome of one publish call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    /// Subscribers whose queue was full
    pub dropped: usize,
    /// Subscribers found cancelled and removed
    pub reclaimed: usize,
}

#[derive(Debug)]
pub struct NotificationHub {
    subscribers: RwLock<HashMap<AssetId, Vec<Subscriber>>>,
    capacity: usize,
    next_id: AtomicU64,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl NotificationHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<AssetId, Vec<Subscriber>>> {
        self.subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<AssetId, Vec<Subscriber>>> {
        self.subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self, asset: &AssetId) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.write()
            .entry(asset.clone())
            .or_default()
            .push(Subscriber { id, tx });
        tracing::debug!(asset = %asset, id, "subscriber added");
        Subscription {
            id,
            asset: asset.clone(),
            rx,
        }
    }

    /// Close and remove a subscription. Returns false if it was not registered.
    pub fn unsubscribe(&self, asset: &AssetId, id: SubscriptionId) -> bool {
        let mut subscribers = self.write();
        let Some(list) = subscribers.get_mut(asset) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != id);
        let removed = list.len() < before;
        if list.is_empty() {
            subscribers.remove(asset);
        }
        if removed {
            tracing::debug!(asset = %asset, id, "subscriber removed");
        }
        removed
    }

    /// Non-blocking fan-out of `estimate` to every subscriber of its asset.
    pub fn publish(&self, estimate: &Estimate) -> Delivery {
        let mut delivery = Delivery::default();
        let mut closed = Vec::new();
        {
            let subscribers = self.read();
            let Some(list) = subscribers.get(&estimate.asset) else {
                return delivery;
            };
            for sub in list {
                match sub.tx.try_send(estimate.clone()) {
                    Ok(()) => delivery.delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        delivery.dropped += 1;
                        tracing::debug!(asset = %estimate.asset, id = sub.id, "subscriber queue full, update dropped");
                    }
                    Err(TrySendError::Closed(_)) => closed.push(sub.id),
                }
            }
        }

        if !closed.is_empty() {
            let mut subscribers = self.write();
            if let Some(list) = subscribers.get_mut(&estimate.asset) {
                list.retain(|s| !closed.contains(&s.id));
                if list.is_empty() {
                    subscribers.remove(&estimate.asset);
                }
            }
            delivery.reclaimed = closed.len();
        }
        delivery
    }

    /// Remove subscribers whose receiving side has gone away. Returns how many.
    pub fn reap_closed(&self) -> usize {
        let mut subscribers = self.write();
        let mut reclaimed = 0;
        subscribers.retain(|asset, list| {
            let before = list.len();
            list.retain(|s| !s.tx.is_closed());
            let gone = before - list.len();
            if gone > 0 {
                tracing::debug!(asset = %asset, reclaimed = gone, "cancelled subscribers reclaimed");
            }
            reclaimed += gone;
            !list.is_empty()
        });
        reclaimed
    }

    /// Drop every sender so all subscriptions end once drained.
    pub fn close_all(&self) -> usize {
        let mut subscribers = self.write();
        let count = subscribers.values().map(Vec::len).sum();
        subscribers.clear();
        if count > 0 {
            tracing::info!(count, "all subscriptions closed");
        }
        count
    }

    pub fn subscriber_count(&self, asset: &AssetId) -> usize {
        self.read().get(asset).map(Vec::len).unwrap_or(0)
    }
}
