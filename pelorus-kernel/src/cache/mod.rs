/**
 * CACHED DATA SERVER - Bounded per-field history with pub/sub fan-out
 *
 * ROLE:
 * Buffers recent (timestamp, value) history per field and serves it to many
 * concurrent subscribers (console, display widgets) with push updates over a
 * JSON-lines TCP protocol. The kernel's own status, health and forwarded
 * stderr streams are recorded through the same hub, so they are replayable by
 * any console that attaches later.
 *
 * STRUCTURE:
 * - store.rs         : per-field ring buffers + retention policy + metadata
 * - subscriptions.rs : per-subscriber filters and live fan-out bookkeeping
 * - server.rs        : TCP listener, one task per connection, wire protocol
 */

pub mod server;
pub mod store;
pub mod subscriptions;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use store::{Batch, CacheStore, FieldMetadata, RetentionPolicy};
use subscriptions::{FieldFilter, SubscriberId, SubscriptionSet};

/// One shared entry point for publishing and subscribing, used by the TCP
/// server and by in-process publishers (manager status, supervisor stderr,
/// kernel health) alike.
pub struct CachedDataHub {
    pub store: CacheStore,
    pub subs: SubscriptionSet,
    /// Serializes publish against subscribe so an initial history batch and
    /// the live stream never overlap (no duplicated point on the seam).
    seq: Mutex<()>,
}

impl CachedDataHub {
    pub fn new(policy: RetentionPolicy) -> Arc<Self> {
        Arc::new(Self {
            store: CacheStore::new(policy),
            subs: SubscriptionSet::new(),
            seq: Mutex::new(()),
        })
    }

    /// Appends records to the per-field history and pushes them to every
    /// matching subscriber. Unknown fields are created implicitly.
    pub fn publish(&self, mut data: Batch, metadata: Option<HashMap<String, FieldMetadata>>) {
        for points in data.values_mut() {
            points.sort_by(|a, b| a.0.total_cmp(&b.0));
        }
        let _guard = self.seq.lock();
        self.store.publish(&data, metadata.as_ref());
        self.subs.fanout(&data);
    }

    /// Publishes a single value for one field, stamped with the current time.
    pub fn publish_now(&self, field: &str, value: serde_json::Value) {
        let mut data = Batch::new();
        data.insert(field.to_string(), vec![(store::now_ts(), value)]);
        self.publish(data, None);
    }

    /// Applies a subscriber's field filters (replace-per-field for fields it
    /// already subscribed to) and returns the initial history batch those
    /// filters call for. Subsequent points arrive through the subscriber's
    /// registered channel.
    pub fn subscribe(&self, id: SubscriberId, filters: HashMap<String, FieldFilter>) -> Batch {
        let _guard = self.seq.lock();
        let mut initial = Batch::new();
        for (field, filter) in &filters {
            let points = if filter.seconds > 0.0 {
                self.store
                    .window(field, filter.seconds, filter.back_records)
            } else if filter.seconds < 0.0 {
                // -1: exactly the single most recent point, then live.
                self.store.latest(field).into_iter().collect()
            } else {
                // 0: nothing retroactively.
                Vec::new()
            };
            if !points.is_empty() {
                initial.insert(field.clone(), points);
            }
        }
        self.subs.apply_filters(id, filters);
        self.store.set_subscriber_window(self.subs.max_window());
        initial
    }

    /// Drops every subscription for a departed subscriber and lets retention
    /// shrink back toward what the remaining subscribers need.
    pub fn unsubscribe(&self, id: SubscriberId) {
        let _guard = self.seq.lock();
        self.subs.remove(id);
        self.store.set_subscriber_window(self.subs.max_window());
    }
}

#[cfg(test)]
mod tests {
    use super::store::Point;
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn hub() -> Arc<CachedDataHub> {
        CachedDataHub::new(RetentionPolicy {
            baseline_age_secs: 86_400.0,
            max_records: 10_000,
        })
    }

    fn attach(hub: &CachedDataHub) -> (SubscriberId, mpsc::Receiver<Batch>) {
        let id = SubscriberId::new();
        let (tx, rx) = mpsc::channel(16);
        hub.subs.register(id, tx);
        (id, rx)
    }

    fn one_field(field: &str, points: Vec<Point>) -> Batch {
        let mut b = Batch::new();
        b.insert(field.to_string(), points);
        b
    }

    #[tokio::test]
    async fn test_latest_only_subscription_then_live() {
        let hub = hub();
        hub.publish(one_field("Pitch", vec![(10.0, json!(1.2)), (11.0, json!(1.3))]), None);

        let (id, mut rx) = attach(&hub);
        let mut filters = HashMap::new();
        filters.insert("Pitch".to_string(), FieldFilter { seconds: -1.0, back_records: None });
        let initial = hub.subscribe(id, filters);
        // Exactly the single most recent point at subscribe time.
        assert_eq!(initial["Pitch"], vec![(11.0, json!(1.3))]);

        hub.publish(one_field("Pitch", vec![(12.0, json!(1.4))]), None);
        hub.publish(one_field("Pitch", vec![(13.0, json!(1.5))]), None);
        let b1 = rx.recv().await.unwrap();
        let b2 = rx.recv().await.unwrap();
        assert_eq!(b1["Pitch"], vec![(12.0, json!(1.4))]);
        assert_eq!(b2["Pitch"], vec![(13.0, json!(1.5))]);
    }

    #[tokio::test]
    async fn test_zero_seconds_returns_nothing_retroactively() {
        let hub = hub();
        hub.publish(one_field("Speed", vec![(5.0, json!(9.9))]), None);

        let (id, mut rx) = attach(&hub);
        let mut filters = HashMap::new();
        filters.insert("Speed".to_string(), FieldFilter { seconds: 0.0, back_records: None });
        let initial = hub.subscribe(id, filters);
        assert!(initial.is_empty());

        hub.publish(one_field("Speed", vec![(6.0, json!(10.1))]), None);
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch["Speed"], vec![(6.0, json!(10.1))]);
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_filter_per_field() {
        let hub = hub();
        hub.publish(
            one_field("Depth", vec![(1.0, json!(100)), (2.0, json!(101)), (3.0, json!(102))]),
            None,
        );

        let (id, _rx) = attach(&hub);
        let mut filters = HashMap::new();
        filters.insert("Depth".to_string(), FieldFilter { seconds: 3600.0, back_records: None });
        let initial = hub.subscribe(id, filters);
        assert_eq!(initial["Depth"].len(), 3);

        // Later subscribe for the same field replaces the filter wholesale.
        let mut filters = HashMap::new();
        filters.insert("Depth".to_string(), FieldFilter { seconds: -1.0, back_records: None });
        let initial = hub.subscribe(id, filters);
        assert_eq!(initial["Depth"], vec![(3.0, json!(102))]);
        assert_eq!(hub.subs.max_window(), None);
    }

    #[tokio::test]
    async fn test_retention_follows_largest_subscriber_window() {
        let hub = hub();
        let (a, _rx_a) = attach(&hub);
        let (b, _rx_b) = attach(&hub);

        let mut short = HashMap::new();
        short.insert("X".to_string(), FieldFilter { seconds: 10.0, back_records: None });
        hub.subscribe(a, short);
        let mut long = HashMap::new();
        long.insert("X".to_string(), FieldFilter { seconds: 3600.0, back_records: None });
        hub.subscribe(b, long);
        assert_eq!(hub.subs.max_window(), Some(3600.0));

        // After the wide subscriber leaves, retention shrinks toward 10s.
        hub.unsubscribe(b);
        assert_eq!(hub.subs.max_window(), Some(10.0));
        hub.unsubscribe(a);
        assert_eq!(hub.subs.max_window(), None);
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_dropped_not_blocking() {
        let hub = hub();
        let id = SubscriberId::new();
        let (tx, rx) = mpsc::channel(1);
        hub.subs.register(id, tx);
        let mut filters = HashMap::new();
        filters.insert("Y".to_string(), FieldFilter { seconds: 0.0, back_records: None });
        hub.subscribe(id, filters);

        // Queue capacity 1: the second publish overflows and evicts the
        // subscriber instead of blocking the publisher.
        hub.publish(one_field("Y", vec![(1.0, json!(1))]), None);
        hub.publish(one_field("Y", vec![(2.0, json!(2))]), None);
        assert!(!hub.subs.contains(id));
        drop(rx);
    }
}
