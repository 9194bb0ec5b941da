/**
 * PELORUS KERNEL - Entry point of the data-acquisition manager
 *
 * ROLE: Orchestration of all modules: config, cruise definition, logger
 * manager, cached data server, health, REST API. Boots the system, brings
 * the active mode up, and keeps supervised pipelines consistent with it.
 *
 * ARCHITECTURE: One async event loop for sockets and timers; one isolated
 * OS process per active logger pipeline (blocking serial/UDP reads must
 * never stall the kernel loop).
 */

mod cache;
mod config;
mod cruise;
mod health;
mod http;
mod manager;
mod pipeline;
mod store;
mod supervisor;

use crate::cache::store::RetentionPolicy;
use crate::cache::CachedDataHub;
use crate::cruise::CruiseDefinition;
use crate::health::HealthTracker;
use crate::manager::{LoggerManager, ManagerOptions, RetryPolicy};
use crate::store::ConfigStore;
use crate::supervisor::OsProcessBackend;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    // Environment overrides from .env, if present
    dotenvy::dotenv().ok();

    let cfg = config::load_config().await;

    // Cruise definition is required; a kernel with nothing to supervise is a
    // misconfiguration, not a degraded mode.
    let definition = match CruiseDefinition::load(&cfg.definition_path).await {
        Ok(def) => {
            println!(
                "[kernel] loaded cruise definition '{}' ({} loggers, {} modes)",
                def.cruise_id.as_deref().unwrap_or("unnamed"),
                def.loggers.len(),
                def.modes.len()
            );
            def
        }
        Err(e) => {
            eprintln!("[kernel] failed to load {}: {e}", cfg.definition_path);
            std::process::exit(1);
        }
    };

    let store = Arc::new(ConfigStore::new(definition));
    let hub = CachedDataHub::new(RetentionPolicy {
        baseline_age_secs: cfg.cache_retention.baseline_age_secs as f64,
        max_records: cfg.cache_retention.max_records,
    });

    // Cached data server: consoles, widgets and runner processes all speak
    // the same JSON-lines protocol to this port.
    let cache_listener = match TcpListener::bind(&cfg.cache_bind).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("[kernel] failed to bind cache server on {}: {e}", cfg.cache_bind);
            std::process::exit(1);
        }
    };
    println!("[kernel] cached data server on {}", cfg.cache_bind);
    tokio::spawn(cache::server::serve(hub.clone(), cache_listener));

    // Runners connect back over loopback regardless of the listen address.
    let cds_addr = cfg.cache_bind.replace("0.0.0.0", "127.0.0.1");
    let backend = Arc::new(OsProcessBackend {
        runner_binary: cfg.runner_binary.clone(),
        log_level: cfg.runner_log_level.clone(),
        cds_addr: Some(cds_addr),
        hub: hub.clone(),
    });

    let manager = Arc::new(LoggerManager::new(
        store.clone(),
        hub.clone(),
        backend,
        ManagerOptions {
            host_id: cfg.host_id.clone(),
            peer_hosts: cfg.peer_hosts.clone(),
            stop_grace: Duration::from_secs(cfg.stop_grace_secs),
            retry: RetryPolicy::from_conf(&cfg.retry),
        },
    ));

    // Bring the boot mode up (default_mode unless the definition says else)
    let boot_mode = store.snapshot().active_mode;
    if let Err(e) = manager.apply_mode(&boot_mode).await {
        eprintln!("[kernel] failed to apply boot mode '{boot_mode}': {e}");
    }

    // Periodic failure sweep with retry/backoff
    manager::spawn_monitor(manager.clone(), Duration::from_secs(cfg.monitor_interval_secs));

    // Kernel self-health, republished through the cache like any field
    let health = HealthTracker::new();
    health.spawn_health_publisher(store.clone(), manager.clone(), hub.clone());

    let app_state = http::AppState {
        store,
        manager: manager.clone(),
        hub,
        health,
        cfg: cfg.clone(),
    };
    let app = http::build_router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    println!("[kernel] listening on http://{addr}");
    let listener = TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            eprintln!("[kernel] shutdown requested");
        })
        .await
        .unwrap();

    // Stop every supervised pipeline before exiting
    manager.shutdown_all().await;
}
