mod admin;
mod health;
mod metrics;
mod proxy;
mod registry;

use axum::{
    Router, middleware,
    routing::{delete, get, post},
};
use std::sync::Arc;

use crate::state::AppState;

pub use admin::{require_admin, reset_rate_limit, unblock_source};
pub use health::health_handler;
pub use metrics::metrics_handler;
pub use proxy::gateway_handler;
pub use registry::{deregister_instance, discover_service, heartbeat, list_services, register_instance};

pub const MANAGEMENT_PREFIX: &str = "/_gateway";

// Health and metrics are always served; the management API only exists
// when an admin token is configured. Everything else goes through the pipeline.
pub fn router(state: Arc<AppState>) -> Router {
    let mut internal = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler));

    if state.admin_token.is_some() {
        internal = internal.merge(management(state.clone()));
    }

    Router::new()
        .nest(MANAGEMENT_PREFIX, internal)
        .fallback(gateway_handler)
        .with_state(state)
}

fn management(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/registry/instances", post(register_instance))
        .route("/registry/instances/{id}", delete(deregister_instance))
        .route("/registry/instances/{id}/heartbeat", post(heartbeat))
        .route("/registry/services", get(list_services))
        .route("/registry/services/{name}", get(discover_service))
        .route("/rate-limits/{identifier}", delete(reset_rate_limit))
        .route("/blocks/{ip}", delete(unblock_source))
        .route_layer(middleware::from_fn_with_state(state, require_admin))
}
