use std::sync::Arc;

use crate::abuse::AbuseGuard;
use crate::gateway::Gateway;
use crate::rate_limit::RateLimiter;
use crate::registry::ServiceRegistry;

// app's shared state

pub struct AppState {
    pub gateway: Gateway,
    pub registry: Arc<ServiceRegistry>,
    pub limiter: Arc<RateLimiter>, // same instance the gateway checks
    pub abuse: Arc<AbuseGuard>,
    pub admin_token: Option<String>, // guards /_gateway management routes
}
