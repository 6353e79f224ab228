//! Requester action endpoint

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use certissue_core::{Action, RequesterId};
use serde::Serialize;

use crate::gate::Admission;
use crate::state::AppState;
use crate::workflow::Reply;

#[derive(Serialize)]
pub struct ActionResponse {
    pub success: bool,
    pub reply: Reply,
    pub message: String,
}

/// POST /requesters/:id/actions
///
/// Operators skip maintenance and throttling.
pub async fn post_action(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(action): Json<Action>,
) -> Json<ActionResponse> {
    let requester = RequesterId(id);

    let reply = if state.is_admin(id) {
        state.engine.handle(requester, action).await
    } else if state.maintenance.is_enabled() {
        Reply::Maintenance
    } else {
        match state.limiter.admit(requester) {
            Admission::Allow => state.engine.handle(requester, action).await,
            Admission::Warn => Reply::SlowDown,
            Admission::Drop => Reply::Ignored,
        }
    };

    Json(ActionResponse {
        success: true,
        message: reply.message(),
        reply,
    })
}
