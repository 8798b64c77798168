use async_trait::async_trait;
use axum::response::Response;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::gateway::InboundRequest;

// Serves a request in-process when a service has no reachable instance.
#[async_trait]
pub trait FallbackHandler: Send + Sync {
    async fn handle(&self, request: InboundRequest) -> Response;
}

#[async_trait]
impl<F, Fut> FallbackHandler for F
where
    F: Fn(InboundRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Response> + Send + 'static,
{
    async fn handle(&self, request: InboundRequest) -> Response {
        (self)(request).await
    }
}

// service name -> local handler, fixed at startup
#[derive(Clone, Default)]
pub struct LocalFallbackDispatcher {
    handlers: HashMap<String, Arc<dyn FallbackHandler>>,
}

impl LocalFallbackDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, service: impl Into<String>, handler: impl FallbackHandler + 'static) -> Self {
        self.handlers.insert(service.into(), Arc::new(handler));
        self
    }

    pub fn has(&self, service: &str) -> bool {
        self.handlers.contains_key(service)
    }

    pub fn services(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    // `None` when no handler is registered for `service`.
    pub async fn dispatch(&self, service: &str, request: InboundRequest) -> Option<Response> {
        let handler = self.handlers.get(service)?;
        Some(handler.handle(request).await)
    }
}
