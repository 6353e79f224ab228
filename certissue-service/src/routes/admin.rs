//! Operator endpoints

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use certissue_core::{CounterScope, Serial, TargetId};
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;
use crate::state::AppState;
use crate::store::{BatchId, Payload};

/// Header carrying the caller's requester id
pub const ADMIN_HEADER: &str = "x-admin-id";

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<i64, ServiceError> {
    headers
        .get(ADMIN_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|id| state.is_admin(*id))
        .ok_or(ServiceError::NotOperator)
}

#[derive(Deserialize)]
pub struct BulkSendRequest {
    pub message: String,
    /// Defaults to every requester known to the ledger
    #[serde(default)]
    pub targets: Option<Vec<i64>>,
}

#[derive(Serialize)]
pub struct BulkSendResponse {
    pub success: bool,
    pub batch_id: BatchId,
    pub targets: usize,
}

/// POST /admin/bulk_send
pub async fn bulk_send(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<BulkSendRequest>,
) -> Result<Json<BulkSendResponse>, ServiceError> {
    let admin = require_admin(&state, &headers)?;

    if req.message.trim().is_empty() {
        return Err(ServiceError::ValidationError("Message is empty".to_string()));
    }

    let targets: Vec<TargetId> = match req.targets {
        Some(ids) => ids.into_iter().map(TargetId).collect(),
        None => state
            .ledger
            .requesters()?
            .into_iter()
            .map(TargetId::from)
            .collect(),
    };
    let count = targets.len();

    let batch_id = state
        .queue
        .start_bulk_send(targets, Payload::text(req.message), state.notifier.clone());

    tracing::info!(admin, batch_id = %batch_id, targets = count, "Bulk send requested");

    Ok(Json(BulkSendResponse {
        success: true,
        batch_id,
        targets: count,
    }))
}

#[derive(Serialize)]
pub struct CounterResponse {
    pub success: bool,
    pub scope: String,
    pub value: u64,
    /// Zero-padded, as printed on certificates
    pub formatted: String,
}

/// GET /admin/counter/:scope
pub async fn get_counter(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(scope): Path<String>,
) -> Result<Json<CounterResponse>, ServiceError> {
    require_admin(&state, &headers)?;

    let scope = CounterScope::parse(&scope);
    let value = state.counter.current(&scope)?;

    Ok(Json(CounterResponse {
        success: true,
        scope: scope.key(),
        value,
        formatted: Serial(value).to_string(),
    }))
}

#[derive(Serialize)]
pub struct OfferingStats {
    pub offering: String,
    pub title: String,
    pub issued: u64,
}

#[derive(Serialize)]
pub struct CounterStats {
    pub scope: String,
    pub value: u64,
}

#[derive(Serialize)]
pub struct StatsResponse {
    pub success: bool,
    pub offerings: Vec<OfferingStats>,
    pub counters: Vec<CounterStats>,
    pub pending_notifications: usize,
    pub maintenance: bool,
}

/// GET /admin/stats
pub async fn get_stats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<StatsResponse>, ServiceError> {
    require_admin(&state, &headers)?;

    let issued = state.ledger.count_by_offering()?;
    let offerings = state
        .catalog
        .offerings()
        .iter()
        .map(|o| OfferingStats {
            offering: o.id.to_string(),
            title: o.title.clone(),
            issued: issued
                .iter()
                .find(|(id, _)| id == &o.id)
                .map(|(_, n)| *n)
                .unwrap_or(0),
        })
        .collect();

    let counters = state
        .catalog
        .scopes()
        .into_iter()
        .map(|scope| -> Result<CounterStats, ServiceError> {
            Ok(CounterStats {
                value: state.counter.current(&scope)?,
                scope: scope.key(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Json(StatsResponse {
        success: true,
        offerings,
        counters,
        pending_notifications: state.queue.outstanding(),
        maintenance: state.maintenance.is_enabled(),
    }))
}

#[derive(Deserialize)]
pub struct MaintenanceRequest {
    pub enabled: bool,
}

#[derive(Serialize)]
pub struct MaintenanceResponse {
    pub success: bool,
    pub maintenance: bool,
}

/// POST /admin/maintenance
pub async fn set_maintenance(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<MaintenanceRequest>,
) -> Result<Json<MaintenanceResponse>, ServiceError> {
    let admin = require_admin(&state, &headers)?;

    state.maintenance.set(req.enabled);
    tracing::info!(admin, enabled = req.enabled, "Maintenance toggled");

    Ok(Json(MaintenanceResponse {
        success: true,
        maintenance: state.maintenance.is_enabled(),
    }))
}
