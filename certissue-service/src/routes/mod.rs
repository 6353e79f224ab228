//! HTTP routes for the service

mod admin;
mod requester;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub use admin::ADMIN_HEADER;

/// Create the router with all routes
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/requesters/:id/actions", post(requester::post_action))
        .route("/admin/bulk_send", post(admin::bulk_send))
        .route("/admin/counter/:scope", get(admin::get_counter))
        .route("/admin/stats", get(admin::get_stats))
        .route("/admin/maintenance", post(admin::set_maintenance))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
