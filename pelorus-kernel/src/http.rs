/**
 * REST API - Control surface of the Pelorus kernel
 *
 * ROLE:
 * Exposes the operator-facing command surface consumed by the web console
 * and CLI tooling: list loggers and their selectable configs, read the
 * per-logger ternary status, switch modes, override one logger, reload the
 * cruise definition, and read kernel health.
 *
 * SECURITY:
 * Every route except /health requires the x-api-key header, validated in a
 * middleware layer before any handler runs (PELORUS_API_KEY).
 */

use crate::cache::CachedDataHub;
use crate::config::KernelConfig;
use crate::cruise::{CruiseDefinition, CruiseError};
use crate::health::{HealthTracker, KernelHealth};
use crate::manager::{LoggerManager, LoggerStatus, ManagerError};
use crate::store::{ConfigStore, StoreError};
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ConfigStore>,
    pub manager: Arc<LoggerManager>,
    pub hub: Arc<CachedDataHub>,
    pub health: HealthTracker,
    pub cfg: KernelConfig,
}

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var("PELORUS_API_KEY").unwrap_or_default();
    if expected.is_empty() {
        eprintln!("SECURITY: PELORUS_API_KEY not set - API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/cruise", get(get_cruise))
        .route("/cruise/reload", post(reload_cruise))
        .route("/mode", post(set_mode))
        .route("/loggers", get(get_loggers))
        .route("/loggers/{name}", get(get_logger))
        .route("/loggers/{name}/configs", get(get_logger_configs))
        .route("/loggers/{name}/config", post(set_logger_config))
        .with_state(app_state)
        .layer(middleware::from_fn(require_api_key))
}

fn store_error_code(err: &StoreError) -> StatusCode {
    match err {
        StoreError::UnknownMode(_)
        | StoreError::UnknownLogger(_)
        | StoreError::UnknownConfig(_) => StatusCode::NOT_FOUND,
        StoreError::ConfigNotForLogger { .. } => StatusCode::BAD_REQUEST,
        StoreError::StaleDefinition { .. } => StatusCode::CONFLICT,
    }
}

fn manager_error_reply(err: ManagerError) -> (StatusCode, Json<serde_json::Value>) {
    let code = match &err {
        ManagerError::Store(e) => store_error_code(e),
    };
    (code, Json(json!({ "ok": false, "msg": err.to_string() })))
}

#[derive(serde::Serialize)]
struct CruiseView {
    cruise_id: Option<String>,
    version: u64,
    active_mode: String,
    default_mode: String,
    modes: Vec<String>,
    loggers: Vec<String>,
}

// GET /cruise (active definition summary)
async fn get_cruise(State(app): State<AppState>) -> Json<CruiseView> {
    let snap = app.store.snapshot();
    let mut modes: Vec<String> = snap.definition.modes.keys().cloned().collect();
    modes.sort();
    let mut loggers: Vec<String> = snap.definition.loggers.keys().cloned().collect();
    loggers.sort();
    Json(CruiseView {
        cruise_id: snap.definition.cruise_id.clone(),
        version: snap.version,
        active_mode: snap.active_mode,
        default_mode: snap.definition.default_mode.clone(),
        modes,
        loggers,
    })
}

// GET /loggers (every logger with its ternary status)
async fn get_loggers(State(app): State<AppState>) -> Json<HashMap<String, LoggerStatus>> {
    Json(app.manager.get_status().await)
}

// GET /loggers/{name} (detail)
async fn get_logger(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<LoggerStatus>, StatusCode> {
    let mut status = app.manager.get_status().await;
    match status.remove(&name) {
        Some(s) => Ok(Json(s)),
        None => Err(StatusCode::NOT_FOUND),
    }
}

// GET /loggers/{name}/configs (selectable configs, in menu order)
async fn get_logger_configs(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Vec<String>>, StatusCode> {
    let snap = app.store.snapshot();
    match snap.definition.loggers.get(&name) {
        Some(configs) => Ok(Json(configs.clone())),
        None => Err(StatusCode::NOT_FOUND),
    }
}

#[derive(Debug, Deserialize)]
struct SetModeBody {
    mode: String,
}

// POST /mode (switch the active mode)
async fn set_mode(
    State(app): State<AppState>,
    Json(body): Json<SetModeBody>,
) -> (StatusCode, Json<serde_json::Value>) {
    match app.manager.apply_mode(&body.mode).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "ok": true, "mode": body.mode }))),
        Err(e) => manager_error_reply(e),
    }
}

#[derive(Debug, Deserialize)]
struct SetConfigBody {
    config: String,
}

// POST /loggers/{name}/config (manual per-logger override)
async fn set_logger_config(
    State(app): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<SetConfigBody>,
) -> (StatusCode, Json<serde_json::Value>) {
    match app.manager.apply_single_logger_config(&name, &body.config).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "ok": true, "logger": name, "config": body.config })),
        ),
        Err(e) => manager_error_reply(e),
    }
}

#[derive(Debug, Deserialize)]
struct ReloadBody {
    /// Definition file to load; defaults to the path the kernel booted with.
    path: Option<String>,
}

// POST /cruise/reload (load a new definition, replace atomically)
async fn reload_cruise(
    State(app): State<AppState>,
    Json(body): Json<ReloadBody>,
) -> (StatusCode, Json<serde_json::Value>) {
    let path = body.path.unwrap_or_else(|| app.cfg.definition_path.clone());
    let definition = match CruiseDefinition::load(&path).await {
        Ok(def) => def,
        Err(e @ CruiseError::Validation(_)) => {
            // The previous definition stays active; report every broken
            // reference so the operator can fix the file in one pass.
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "ok": false, "msg": e.to_string() })),
            );
        }
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "ok": false, "msg": e.to_string() })),
            );
        }
    };
    match app.manager.reload(definition).await {
        Ok(()) => {
            let snap = app.store.snapshot();
            (
                StatusCode::OK,
                Json(json!({ "ok": true, "version": snap.version, "path": path })),
            )
        }
        Err(e) => manager_error_reply(e),
    }
}

// GET /system/health (kernel self-health)
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    let health = app.health.get_health(&app.store, &app.manager, &app.hub).await;
    Json(health)
}
