use super::store::Batch;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Per-field request from one subscriber.
///
/// `seconds > 0`  : trailing window of history, then live updates.
/// `seconds == 0` : live updates only.
/// `seconds == -1`: single most recent point, then live updates.
/// `back_records` : caps the historical points regardless of the window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub back_records: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

struct Subscriber {
    filters: HashMap<String, FieldFilter>,
    tx: mpsc::Sender<Batch>,
}

/// Live subscription table: who wants which fields, and the bounded outbound
/// queue to reach them. A subscriber whose queue overflows is evicted rather
/// than allowed to block publishers.
pub struct SubscriptionSet {
    inner: Mutex<HashMap<SubscriberId, Subscriber>>,
}

impl SubscriptionSet {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()) }
    }

    /// Registers a connection before any subscribe request arrives.
    pub fn register(&self, id: SubscriberId, tx: mpsc::Sender<Batch>) {
        self.inner.lock().insert(id, Subscriber { filters: HashMap::new(), tx });
    }

    /// Applies filters for a subscriber. A field already subscribed gets its
    /// filter replaced (last subscribe wins per field); other fields keep
    /// their existing filters.
    pub fn apply_filters(&self, id: SubscriberId, filters: HashMap<String, FieldFilter>) {
        let mut inner = self.inner.lock();
        if let Some(sub) = inner.get_mut(&id) {
            for (field, filter) in filters {
                sub.filters.insert(field, filter);
            }
        }
    }

    pub fn remove(&self, id: SubscriberId) {
        self.inner.lock().remove(&id);
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.inner.lock().contains_key(&id)
    }

    /// Widest positive window any current subscriber has requested.
    pub fn max_window(&self) -> Option<f64> {
        let inner = self.inner.lock();
        inner
            .values()
            .flat_map(|s| s.filters.values())
            .map(|f| f.seconds)
            .filter(|s| *s > 0.0)
            .fold(None, |acc: Option<f64>, s| Some(acc.map_or(s, |a| a.max(s))))
    }

    /// Pushes freshly-published points to every subscriber whose filters
    /// match. Queues that are full or closed get the subscriber evicted.
    pub fn fanout(&self, data: &Batch) {
        let mut inner = self.inner.lock();
        let mut evicted = Vec::new();
        for (id, sub) in inner.iter() {
            let mut delivery = Batch::new();
            for (field, points) in data {
                if sub.filters.contains_key(field) && !points.is_empty() {
                    delivery.insert(field.clone(), points.clone());
                }
            }
            if delivery.is_empty() {
                continue;
            }
            if sub.tx.try_send(delivery).is_err() {
                evicted.push(*id);
            }
        }
        for id in evicted {
            eprintln!("[cache] evicting slow or closed subscriber {:?}", id.0);
            inner.remove(&id);
        }
    }
}
