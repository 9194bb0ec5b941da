use crate::cache::CachedDataHub;
use crate::manager::LoggerManager;
use crate::store::ConfigStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task;

#[derive(Debug, Serialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub cruise_id: Option<String>,
    pub definition_version: u64,
    pub active_mode: String,
    pub loggers_total: u32,
    pub loggers_running: u32,
    pub loggers_failed: u32,
    pub cache_fields: u32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self { start_time: Instant::now() }
    }

    pub async fn get_health(
        &self,
        store: &ConfigStore,
        manager: &LoggerManager,
        hub: &CachedDataHub,
    ) -> KernelHealth {
        let snap = store.snapshot();
        let status = manager.get_status().await;
        let running = status.values().filter(|s| s.running == Some(true)).count();
        let failed = status.values().filter(|s| s.failed).count();
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            cruise_id: snap.definition.cruise_id.clone(),
            definition_version: snap.version,
            active_mode: snap.active_mode,
            loggers_total: status.len() as u32,
            loggers_running: running as u32,
            loggers_failed: failed as u32,
            cache_fields: hub.store.field_count() as u32,
        }
    }

    /// Republishes the kernel health snapshot into the cached data server
    /// every 30s under `status:kernel`, so consoles see it like any field.
    pub fn spawn_health_publisher(
        &self,
        store: Arc<ConfigStore>,
        manager: Arc<LoggerManager>,
        hub: Arc<CachedDataHub>,
    ) {
        let tracker = self.clone();
        task::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                let health = tracker.get_health(&store, &manager, &hub).await;
                if let Ok(value) = serde_json::to_value(&health) {
                    hub.publish_now("status:kernel", value);
                    println!(
                        "[health] published kernel health (uptime: {}s, running: {}/{})",
                        health.uptime_seconds, health.loggers_running, health.loggers_total
                    );
                }
            }
        });
    }
}
