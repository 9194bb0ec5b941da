/**
 * LOGGER MANAGER - Desired-state reconciliation across all loggers
 *
 * ROLE:
 * Keeps the set of running supervisors consistent with the active mode of the
 * current cruise definition, with minimal disruption: on a mode change or
 * reload only the loggers whose resolved config content actually changed are
 * restarted. Failed pipelines are retried on a bounded budget with
 * exponential backoff, and every failure, retry and exhaustion is surfaced as
 * a status record through the cached data server, not just logged.
 *
 * CONCURRENCY:
 * One async mutex per logger slot. Within one logger, stop fully completes
 * before the replacement start begins (two processes must never hold the
 * same serial port). Across loggers, reconciliation runs concurrently; the
 * monitor tick skips slots that are mid-transition instead of waiting.
 */

use crate::cache::CachedDataHub;
use crate::config::RetryConf;
use crate::cruise::CruiseDefinition;
use crate::store::{resolve_mode, ConfigStore, LoggerTarget, StoreError};
use crate::supervisor::{LoggerSupervisor, ProcessBackend, RunState};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Healthy monitor ticks a restarted pipeline must survive before its retry
/// budget resets. The budget bounds a crash loop, not the total number of
/// recovered incidents over a cruise.
const STABLE_TICKS_BEFORE_RESET: u32 = 3;

/// Restart budget: a few immediate retries, then exponential backoff
/// (first x factor^n, clamped to max), then give up and stay failed.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub immediate_retries: u32,
    pub backoff_first: Duration,
    pub backoff_factor: f64,
    pub backoff_max: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn from_conf(conf: &RetryConf) -> Self {
        Self {
            immediate_retries: conf.immediate_retries,
            backoff_first: Duration::from_secs(conf.backoff_first_secs),
            backoff_factor: conf.backoff_factor,
            backoff_max: Duration::from_secs(conf.backoff_max_secs),
            max_attempts: conf.max_attempts,
        }
    }

    /// Delay before retry number `attempt` (0-indexed over attempts already
    /// made), or None once the budget is exhausted.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        if attempt < self.immediate_retries {
            return Some(Duration::ZERO);
        }
        let n = (attempt - self.immediate_retries).min(i32::MAX as u32) as i32;
        let max_secs = self.backoff_max.as_secs_f64();
        let secs = self.backoff_first.as_secs_f64() * self.backoff_factor.powi(n);
        if !secs.is_finite() || secs < 0.0 || secs > max_secs {
            Some(self.backoff_max)
        } else {
            Some(Duration::from_secs_f64(secs))
        }
    }
}

/// Per-logger view served to the console. The ternary `running` is what the
/// console colors indicators with: Some(true) = running as it should,
/// Some(false) = should be running but is not (alarm), None = not running
/// and correctly so (off on purpose, or dispatched to another host).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoggerStatus {
    pub config_name: Option<String>,
    pub running: Option<bool>,
    pub failed: bool,
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum DispatchState {
    /// Runs (or is off) under this kernel.
    Local,
    /// Config is tagged for a host another kernel claims.
    Elsewhere(String),
    /// Config is tagged for a host nobody claims: configuration warning.
    Unclaimed(String),
}

struct LoggerSlot {
    supervisor: LoggerSupervisor,
    dispatch: DispatchState,
    /// Config name recorded for status when the logger runs elsewhere.
    remote_config: Option<String>,
    restart_attempts: u32,
    next_retry_at: Option<tokio::time::Instant>,
    exhausted_reported: bool,
    /// Consecutive monitor ticks the pipeline has been seen alive since its
    /// last restart.
    healthy_ticks: u32,
}

impl LoggerSlot {
    fn new(name: &str, backend: Arc<dyn ProcessBackend>, stop_grace: Duration) -> Self {
        Self {
            supervisor: LoggerSupervisor::new(name.to_string(), backend, stop_grace),
            dispatch: DispatchState::Local,
            remote_config: None,
            restart_attempts: 0,
            next_retry_at: None,
            exhausted_reported: false,
            healthy_ticks: 0,
        }
    }

    fn status(&mut self) -> LoggerStatus {
        match &self.dispatch {
            DispatchState::Elsewhere(host) => LoggerStatus {
                config_name: self.remote_config.clone(),
                running: None,
                failed: false,
                pid: None,
                warning: Some(format!("dispatched to host '{host}'")),
            },
            DispatchState::Unclaimed(host) => LoggerStatus {
                config_name: self.remote_config.clone(),
                running: Some(false),
                failed: false,
                pid: None,
                warning: Some(format!("no kernel claims host '{host}'")),
            },
            DispatchState::Local => {
                let alive = self.supervisor.is_alive();
                let failed = self.supervisor.state() == RunState::Failed;
                let running = if self.supervisor.current_config_name().is_none()
                    || self.supervisor.is_intentionally_off()
                {
                    None
                } else {
                    Some(alive)
                };
                LoggerStatus {
                    config_name: self.supervisor.current_config_name().map(str::to_string),
                    running,
                    failed,
                    pid: self.supervisor.pid(),
                    warning: self.supervisor.failed_reason().map(str::to_string),
                }
            }
        }
    }
}

type SharedSlot = Arc<AsyncMutex<LoggerSlot>>;

/// Host identity and fan-out handles each reconciliation task needs.
#[derive(Clone)]
struct ReconcileCtx {
    hub: Arc<CachedDataHub>,
    host_id: Option<String>,
    peer_hosts: Vec<String>,
}

pub struct ManagerOptions {
    pub host_id: Option<String>,
    pub peer_hosts: Vec<String>,
    pub stop_grace: Duration,
    pub retry: RetryPolicy,
}

pub struct LoggerManager {
    store: Arc<ConfigStore>,
    hub: Arc<CachedDataHub>,
    backend: Arc<dyn ProcessBackend>,
    options: ManagerOptions,
    slots: Mutex<HashMap<String, SharedSlot>>,
}

impl LoggerManager {
    pub fn new(
        store: Arc<ConfigStore>,
        hub: Arc<CachedDataHub>,
        backend: Arc<dyn ProcessBackend>,
        options: ManagerOptions,
    ) -> Self {
        let manager = Self {
            store,
            hub,
            backend,
            options,
            slots: Mutex::new(HashMap::new()),
        };
        let snap = manager.store.snapshot();
        for name in snap.definition.loggers.keys() {
            manager.slot_or_create(name);
        }
        manager
    }

    fn slot_or_create(&self, name: &str) -> SharedSlot {
        let mut slots = self.slots.lock();
        slots
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(AsyncMutex::new(LoggerSlot::new(
                    name,
                    self.backend.clone(),
                    self.options.stop_grace,
                )))
            })
            .clone()
    }

    fn ctx(&self) -> ReconcileCtx {
        ReconcileCtx {
            hub: self.hub.clone(),
            host_id: self.options.host_id.clone(),
            peer_hosts: self.options.peer_hosts.clone(),
        }
    }

    /// Switches the active mode, starting/stopping only what changed.
    pub async fn apply_mode(&self, mode: &str) -> Result<(), ManagerError> {
        let snap = self.store.snapshot();
        let targets = self.store.set_mode(snap.version, mode)?;
        eprintln!("[manager] applying mode '{mode}' ({} loggers)", targets.len());
        self.reconcile_all(targets).await;
        Ok(())
    }

    /// Manual per-logger override; leaves every other logger undisturbed and
    /// does not change the active mode.
    pub async fn apply_single_logger_config(
        &self,
        logger: &str,
        config_name: &str,
    ) -> Result<(), ManagerError> {
        let snap = self.store.snapshot();
        let target = self
            .store
            .resolve_logger_config(snap.version, logger, config_name)?;
        let slot = self.slot_or_create(logger);
        reconcile(self.ctx(), logger.to_string(), slot, target).await;
        Ok(())
    }

    /// Installs a freshly-loaded definition and reconciles against the
    /// carried-over active mode. Loggers whose resolved config is identical
    /// keep their process; vanished loggers are stopped and dropped.
    pub async fn reload(&self, definition: CruiseDefinition) -> Result<(), ManagerError> {
        let snap = self.store.replace(definition);
        eprintln!(
            "[manager] definition v{} loaded, active mode '{}'",
            snap.version, snap.active_mode
        );

        let mut removed = Vec::new();
        {
            let mut slots = self.slots.lock();
            slots.retain(|name, slot| {
                let keep = snap.definition.loggers.contains_key(name);
                if !keep {
                    removed.push((name.clone(), slot.clone()));
                }
                keep
            });
        }
        for (name, slot) in removed {
            eprintln!("[manager] logger '{name}' removed by reload, stopping");
            slot.lock().await.supervisor.stop().await;
        }
        for name in snap.definition.loggers.keys() {
            self.slot_or_create(name);
        }

        let targets = resolve_mode(&snap.definition, &snap.active_mode)?;
        self.reconcile_all(targets).await;
        Ok(())
    }

    /// Reconciles every targeted logger concurrently; one slow stop never
    /// delays unrelated loggers.
    async fn reconcile_all(&self, targets: HashMap<String, LoggerTarget>) {
        let ctx = self.ctx();
        let mut tasks = JoinSet::new();
        for (logger, target) in targets {
            let slot = self.slot_or_create(&logger);
            let ctx = ctx.clone();
            tasks.spawn(reconcile(ctx, logger, slot, target));
        }
        while tasks.join_next().await.is_some() {}
    }

    /// Periodic failure sweep. Non-blocking: slots busy with an in-flight
    /// start/stop are skipped and picked up on the next tick.
    pub async fn monitor_tick(&self) {
        let slots: Vec<(String, SharedSlot)> = self
            .slots
            .lock()
            .iter()
            .map(|(n, s)| (n.clone(), s.clone()))
            .collect();

        for (name, slot) in slots {
            let Ok(mut slot) = slot.try_lock() else { continue };
            if slot.dispatch != DispatchState::Local {
                continue;
            }
            if !slot.supervisor.is_failed() {
                // A restarted pipeline that stays up earns its budget back;
                // isolated recovered crashes never accumulate into exhaustion.
                if slot.restart_attempts > 0 && slot.supervisor.is_alive() {
                    slot.healthy_ticks += 1;
                    if slot.healthy_ticks >= STABLE_TICKS_BEFORE_RESET {
                        eprintln!("[manager] {name}: stable after restart, retry budget reset");
                        slot.restart_attempts = 0;
                        slot.next_retry_at = None;
                        slot.exhausted_reported = false;
                        slot.healthy_ticks = 0;
                    }
                }
                continue;
            }
            slot.healthy_ticks = 0;

            let attempt = slot.restart_attempts;
            match self.options.retry.delay(attempt) {
                None => {
                    if !slot.exhausted_reported {
                        eprintln!(
                            "[manager] {name}: retry budget exhausted after {attempt} attempts, leaving failed"
                        );
                        slot.exhausted_reported = true;
                        self.publish_status(&name, &mut slot);
                    }
                }
                Some(delay) => {
                    let now = tokio::time::Instant::now();
                    match slot.next_retry_at {
                        None if !delay.is_zero() => {
                            eprintln!(
                                "[manager] {name}: pipeline failed, retry {attempt} in {delay:?}"
                            );
                            slot.next_retry_at = Some(now + delay);
                            self.publish_status(&name, &mut slot);
                        }
                        Some(due) if now < due => {}
                        _ => {
                            slot.next_retry_at = None;
                            slot.restart_attempts += 1;
                            let Some((config_name, config)) = slot
                                .supervisor
                                .current_config_name()
                                .map(str::to_string)
                                .zip(slot.supervisor.current_config().cloned())
                            else {
                                continue;
                            };
                            eprintln!(
                                "[manager] {name}: restart attempt {}",
                                slot.restart_attempts
                            );
                            if let Err(e) = slot.supervisor.start(&config_name, &config).await {
                                eprintln!("[manager] {name}: restart failed: {e}");
                            }
                            self.publish_status(&name, &mut slot);
                        }
                    }
                }
            }
        }
    }

    /// Per-logger ternary status for the console and the REST surface.
    pub async fn get_status(&self) -> HashMap<String, LoggerStatus> {
        let slots: Vec<(String, SharedSlot)> = self
            .slots
            .lock()
            .iter()
            .map(|(n, s)| (n.clone(), s.clone()))
            .collect();
        let mut out = HashMap::new();
        for (name, slot) in slots {
            let mut slot = slot.lock().await;
            out.insert(name, slot.status());
        }
        out
    }

    /// Stops every supervised process; used at kernel shutdown.
    pub async fn shutdown_all(&self) {
        eprintln!("[manager] stopping all loggers");
        let slots: Vec<SharedSlot> = self.slots.lock().values().cloned().collect();
        let mut tasks = JoinSet::new();
        for slot in slots {
            tasks.spawn(async move {
                slot.lock().await.supervisor.stop().await;
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    fn publish_status(&self, logger: &str, slot: &mut LoggerSlot) {
        publish_status(&self.hub, logger, slot);
    }
}

fn publish_status(hub: &CachedDataHub, logger: &str, slot: &mut LoggerSlot) {
    let status = slot.status();
    if let Ok(value) = serde_json::to_value(&status) {
        hub.publish_now(&format!("status:logger:{logger}"), value);
    }
}

/// Brings one logger to its target config. Stop fully completes before the
/// replacement start; an unchanged, healthy logger is left untouched.
async fn reconcile(ctx: ReconcileCtx, logger: String, slot: SharedSlot, target: LoggerTarget) {
    let mut slot = slot.lock().await;

    if let Some(host) = &target.config.host_id {
        let local = ctx.host_id.as_deref() == Some(host.as_str());
        if !local {
            slot.supervisor.stop().await;
            slot.remote_config = Some(target.config_name.clone());
            if ctx.peer_hosts.iter().any(|h| h == host) {
                eprintln!(
                    "[manager] {logger}: '{}' dispatched to host '{host}'",
                    target.config_name
                );
                slot.dispatch = DispatchState::Elsewhere(host.clone());
            } else {
                eprintln!("[manager] warning: {logger}: no kernel claims host '{host}'");
                slot.dispatch = DispatchState::Unclaimed(host.clone());
            }
            publish_status(&ctx.hub, &logger, &mut slot);
            return;
        }
    }
    slot.dispatch = DispatchState::Local;
    slot.remote_config = None;

    // Unchanged by name and by resolved content, and healthy: leave it alone.
    if slot.supervisor.current_config_name() == Some(target.config_name.as_str())
        && slot.supervisor.current_config() == Some(&target.config)
    {
        let healthy = if target.config.is_runnable() {
            slot.supervisor.is_alive()
        } else {
            !slot.supervisor.is_failed()
        };
        if healthy {
            return;
        }
    }

    slot.restart_attempts = 0;
    slot.next_retry_at = None;
    slot.exhausted_reported = false;
    slot.healthy_ticks = 0;
    slot.supervisor.stop().await;
    if let Err(e) = slot.supervisor.start(&target.config_name, &target.config).await {
        eprintln!("[manager] {logger}: start failed: {e}");
    }
    publish_status(&ctx.hub, &logger, &mut slot);
}

/// Spawns the periodic failure monitor, one tick every `interval`.
pub fn spawn_monitor(manager: Arc<LoggerManager>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            manager.monitor_tick().await;
        }
    });
}
