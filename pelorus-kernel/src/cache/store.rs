use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use time::OffsetDateTime;

/// One cached sample: (unix timestamp in seconds, value).
pub type Point = (f64, serde_json::Value);

/// field name -> points, the unit of publish and of delivery.
pub type Batch = HashMap<String, Vec<Point>>;

/// Current unix time as a float, the timestamp convention of the wire format.
pub fn now_ts() -> f64 {
    OffsetDateTime::now_utc().unix_timestamp_nanos() as f64 / 1e9
}

/// Declared metadata for a field, supplied at publish time and served by the
/// "describe" request for the metadata browser.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldMetadata {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub units: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub device_type_field: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    /// History age kept when no subscriber asks for a wider window.
    pub baseline_age_secs: f64,
    /// Hard cap on points per field regardless of age.
    pub max_records: usize,
}

struct CachedField {
    /// Oldest first, non-decreasing timestamps, ties kept in arrival order.
    history: VecDeque<Point>,
    metadata: Option<FieldMetadata>,
}

impl CachedField {
    fn new() -> Self {
        Self { history: VecDeque::new(), metadata: None }
    }

    /// Inserts keeping timestamp order. Late arrivals (older than the newest
    /// point) are placed at their sorted position, after any equal timestamps,
    /// so the history is never reordered afterwards.
    fn insert(&mut self, point: Point) {
        match self.history.back() {
            Some(last) if last.0 > point.0 => {
                let pos = self.history.partition_point(|p| p.0 <= point.0);
                self.history.insert(pos, point);
            }
            _ => self.history.push_back(point),
        }
    }

    fn trim(&mut self, max_age: f64, max_records: usize) {
        if let Some(&(newest, _)) = self.history.back() {
            let cutoff = newest - max_age;
            while matches!(self.history.front(), Some(&(ts, _)) if ts < cutoff) {
                self.history.pop_front();
            }
        }
        while self.history.len() > max_records {
            self.history.pop_front();
        }
    }
}

pub struct CacheStore {
    fields: Mutex<HashMap<String, CachedField>>,
    policy: RetentionPolicy,
    /// Widest window requested across current subscribers, recomputed by the
    /// hub whenever subscriptions change. None means nobody is subscribed.
    subscriber_window: Mutex<Option<f64>>,
}

impl CacheStore {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            fields: Mutex::new(HashMap::new()),
            policy,
            subscriber_window: Mutex::new(None),
        }
    }

    fn effective_age(&self) -> f64 {
        // A wide subscriber widens retention beyond the baseline; with no
        // subscribers the baseline keeps status/stderr streams replayable.
        match *self.subscriber_window.lock() {
            Some(w) => w.max(self.policy.baseline_age_secs),
            None => self.policy.baseline_age_secs,
        }
    }

    pub fn set_subscriber_window(&self, window: Option<f64>) {
        *self.subscriber_window.lock() = window;
    }

    /// Appends points to each named field, creating unknown fields
    /// implicitly, then trims per the retention policy.
    pub fn publish(&self, data: &Batch, metadata: Option<&HashMap<String, FieldMetadata>>) {
        let max_age = self.effective_age();
        let mut fields = self.fields.lock();
        for (name, points) in data {
            let field = fields.entry(name.clone()).or_insert_with(CachedField::new);
            for point in points {
                field.insert(point.clone());
            }
            field.trim(max_age, self.policy.max_records);
        }
        if let Some(meta) = metadata {
            for (name, m) in meta {
                let field = fields.entry(name.clone()).or_insert_with(CachedField::new);
                field.metadata = Some(m.clone());
            }
        }
    }

    /// Points within the trailing `seconds` window anchored at the most
    /// recent point, optionally capped to the newest `back_records`.
    pub fn window(&self, field: &str, seconds: f64, back_records: Option<usize>) -> Vec<Point> {
        let fields = self.fields.lock();
        let Some(f) = fields.get(field) else { return Vec::new() };
        let Some(&(newest, _)) = f.history.back() else { return Vec::new() };
        let cutoff = newest - seconds;
        let mut points: Vec<Point> = f
            .history
            .iter()
            .filter(|(ts, _)| *ts >= cutoff)
            .cloned()
            .collect();
        if let Some(cap) = back_records {
            if points.len() > cap {
                points.drain(..points.len() - cap);
            }
        }
        points
    }

    pub fn latest(&self, field: &str) -> Option<Point> {
        self.fields.lock().get(field).and_then(|f| f.history.back().cloned())
    }

    /// Metadata for every known field; fields published without metadata
    /// report an empty record.
    pub fn describe(&self) -> HashMap<String, FieldMetadata> {
        self.fields
            .lock()
            .iter()
            .map(|(name, f)| (name.clone(), f.metadata.clone().unwrap_or_default()))
            .collect()
    }

    pub fn field_count(&self) -> usize {
        self.fields.lock().len()
    }
}
