use axum::{
    extract::{Request, State},
    response::Response,
};
use std::sync::Arc;

use crate::state::AppState;

// Every path outside /_gateway goes through the gateway pipeline
pub async fn gateway_handler(State(state): State<Arc<AppState>>, request: Request) -> Response {
    state.gateway.handle(request).await
}
