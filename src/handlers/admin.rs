use axum::{
    Json,
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{info, warn};

use crate::auth::bearer_token;
use crate::models::{ErrorBody, RemovedResponse};
use crate::state::AppState;

// Requires the admin token; with none configured every request is refused
pub async fn require_admin(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let authorized = match (state.admin_token.as_deref(), bearer_token(request.headers())) {
        (Some(expected), Some(given)) => given == expected,
        _ => false,
    };
    if authorized {
        return next.run(request).await;
    }

    warn!(path = %request.uri().path(), "Rejected management request without admin token");
    let body = ErrorBody {
        success: false,
        error: "Authentication required: admin token".to_string(),
        retry_after: None,
    };
    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}

pub async fn reset_rate_limit(
    State(state): State<Arc<AppState>>,
    Path(identifier): Path<String>,
) -> Json<RemovedResponse> {
    let removed = state.limiter.reset(&identifier);
    info!(identifier = %identifier, removed, "Rate limit entries reset");
    Json(RemovedResponse {
        success: true,
        removed,
    })
}

pub async fn unblock_source(State(state): State<Arc<AppState>>, Path(ip): Path<String>) -> Json<RemovedResponse> {
    let removed = state.abuse.unblock(&ip);
    info!(ip = %ip, removed, "Abuse tracking cleared");
    Json(RemovedResponse {
        success: true,
        removed: usize::from(removed),
    })
}
