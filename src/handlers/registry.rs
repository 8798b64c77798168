use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::warn;

use crate::models::{ErrorBody, InstanceView, RegisterResponse, RemovedResponse, ServiceView};
use crate::registry::InstanceConfig;
use crate::state::AppState;

fn error_response(status: StatusCode, error: String) -> Response {
    let body = ErrorBody {
        success: false,
        error,
        retry_after: None,
    };
    (status, Json(body)).into_response()
}

pub async fn register_instance(
    State(state): State<Arc<AppState>>,
    Json(config): Json<InstanceConfig>,
) -> Response {
    match state.registry.register(config) {
        Ok(instance) => {
            let body = RegisterResponse {
                success: true,
                instance_id: instance.id.clone(),
                instance: InstanceView::from(&instance),
            };
            (StatusCode::CREATED, Json(body)).into_response()
        }
        Err(err) => {
            warn!(error = %err, "Rejected instance registration");
            error_response(StatusCode::BAD_REQUEST, err.to_string())
        }
    }
}

pub async fn deregister_instance(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Json<RemovedResponse> {
    let removed = state.registry.deregister(&id);
    Json(RemovedResponse {
        success: true,
        removed: usize::from(removed),
    })
}

pub async fn heartbeat(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    if state.registry.heartbeat(&id) {
        Json(serde_json::json!({ "success": true })).into_response()
    } else {
        error_response(StatusCode::NOT_FOUND, format!("unknown instance {id}"))
    }
}

// All instances of every service, whatever their health
pub async fn list_services(State(state): State<Arc<AppState>>) -> Json<Vec<ServiceView>> {
    let services = state
        .registry
        .services()
        .into_iter()
        .map(|name| {
            let instances = state.registry.instances(&name).iter().map(InstanceView::from).collect();
            ServiceView { name, instances }
        })
        .collect();
    Json(services)
}

// Healthy instances only
pub async fn discover_service(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Json<Vec<InstanceView>> {
    Json(state.registry.discover(&name).iter().map(InstanceView::from).collect())
}
