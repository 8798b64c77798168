#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Request, Response, StatusCode};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use estate_gateway::abuse::{AbuseConfig, AbuseGuard};
use estate_gateway::auth::{Principal, StaticTokenAuthenticator};
use estate_gateway::client::ClientConfig;
use estate_gateway::error::TransportError;
use estate_gateway::fallback::LocalFallbackDispatcher;
use estate_gateway::gateway::{Gateway, GatewayBuilder};
use estate_gateway::handlers;
use estate_gateway::rate_limit::{RateLimitConfig, RateLimiter, default_categories};
use estate_gateway::registry::{InstanceConfig, RegistryConfig, ServiceRegistry};
use estate_gateway::routes::default_routes;
use estate_gateway::security::{SecurityEvent, SecurityEventKind, SecurityEventSink};
use estate_gateway::state::AppState;
use estate_gateway::transport::{OutboundRequest, OutboundResponse, Transport};

pub const AGENT_TOKEN: &str = "t-agent";
pub const MANAGER_TOKEN: &str = "t-manager";
pub const ADMIN_TOKEN: &str = "t-ops";

type Reply = dyn Fn(&OutboundRequest) -> Result<OutboundResponse, TransportError> + Send + Sync;

// Answers outbound requests from a closure and remembers what was sent
pub struct MockTransport {
    reply: Box<Reply>,
    sent: Mutex<Vec<OutboundRequest>>,
    calls: AtomicUsize,
}

impl MockTransport {
    pub fn new(
        reply: impl Fn(&OutboundRequest) -> Result<OutboundResponse, TransportError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            reply: Box::new(reply),
            sent: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn ok(body: &'static str) -> Self {
        Self::new(move |_| Ok(json_response(200, body)))
    }

    pub fn unreachable() -> Self {
        Self::new(|_| Err(TransportError::Connect("connection refused".into())))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<OutboundRequest> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: OutboundRequest) -> Result<OutboundResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = (self.reply)(&request);
        self.sent.lock().push(request);
        reply
    }
}

pub fn json_response(status: u16, body: &str) -> OutboundResponse {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", "application/json".parse().unwrap());
    OutboundResponse {
        status: StatusCode::from_u16(status).unwrap(),
        headers,
        body: Bytes::from(body.to_string()),
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SecurityEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events.lock().clone()
    }

    pub fn of_kind(&self, kind: SecurityEventKind) -> Vec<SecurityEvent> {
        self.events().into_iter().filter(|e| e.kind == kind).collect()
    }
}

impl SecurityEventSink for RecordingSink {
    fn record(&self, event: SecurityEvent) {
        self.events.lock().push(event);
    }
}

fn principal(user_id: &str, role: &str, permissions: &[&str]) -> Principal {
    Principal {
        user_id: user_id.into(),
        email: format!("{user_id}@example.com"),
        role: role.into(),
        permissions: permissions.iter().map(|p| p.to_string()).collect(),
    }
}

pub fn tokens() -> HashMap<String, Principal> {
    HashMap::from([
        (AGENT_TOKEN.to_string(), principal("u-agent", "agent", &["properties:read"])),
        (
            MANAGER_TOKEN.to_string(),
            principal("u-manager", "manager", &["properties:create", "properties:update"]),
        ),
        (ADMIN_TOKEN.to_string(), principal("u-ops", "super_admin", &[])),
    ])
}

pub fn instance(name: &str, port: u16) -> InstanceConfig {
    InstanceConfig {
        name: name.into(),
        version: "1.0.0".into(),
        host: "10.0.0.5".into(),
        port,
        protocol: "http".into(),
        health_endpoint: "/health".into(),
        metadata: HashMap::new(),
    }
}

pub struct Harness {
    pub app: Router,
    pub registry: Arc<ServiceRegistry>,
    pub limiter: Arc<RateLimiter>,
    pub abuse: Arc<AbuseGuard>,
    pub transport: Arc<MockTransport>,
    pub events: Arc<RecordingSink>,
}

pub struct HarnessBuilder {
    transport: MockTransport,
    categories: HashMap<String, RateLimitConfig>,
    abuse: AbuseConfig,
    fallbacks: LocalFallbackDispatcher,
    admin_token: Option<String>,
    max_body_bytes: Option<usize>,
}

impl HarnessBuilder {
    pub fn new(transport: MockTransport) -> Self {
        Self {
            transport,
            categories: default_categories(),
            abuse: AbuseConfig::default(),
            fallbacks: LocalFallbackDispatcher::new(),
            admin_token: None,
            max_body_bytes: None,
        }
    }

    pub fn category(mut self, name: &str, config: RateLimitConfig) -> Self {
        self.categories.insert(name.to_string(), config);
        self
    }

    pub fn abuse(mut self, config: AbuseConfig) -> Self {
        self.abuse = config;
        self
    }

    pub fn fallbacks(mut self, fallbacks: LocalFallbackDispatcher) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    pub fn admin_token(mut self, token: &str) -> Self {
        self.admin_token = Some(token.to_string());
        self
    }

    pub fn max_body_bytes(mut self, max: usize) -> Self {
        self.max_body_bytes = Some(max);
        self
    }

    pub fn build(self) -> Harness {
        let transport = Arc::new(self.transport);
        let events = Arc::new(RecordingSink::default());
        let registry = Arc::new(ServiceRegistry::new(transport.clone(), RegistryConfig::default()));
        let limiter = Arc::new(RateLimiter::new(self.categories).unwrap());
        let abuse = Arc::new(AbuseGuard::new(self.abuse, events.clone()));

        let mut builder: GatewayBuilder =
            Gateway::builder(default_routes(), registry.clone(), transport.clone(), events.clone())
                .rate_limiter(limiter.clone())
                .abuse_guard(abuse.clone())
                .authenticator(Arc::new(StaticTokenAuthenticator::new(tokens())))
                .client_config(ClientConfig {
                    retries: 1,
                    ..ClientConfig::default()
                })
                .fallbacks(self.fallbacks);
        if let Some(max) = self.max_body_bytes {
            builder = builder.max_body_bytes(max);
        }
        let gateway = builder.build().unwrap();

        let state = Arc::new(AppState {
            gateway,
            registry: registry.clone(),
            limiter: limiter.clone(),
            abuse: abuse.clone(),
            admin_token: self.admin_token,
        });

        Harness {
            app: handlers::router(state),
            registry,
            limiter,
            abuse,
            transport,
            events,
        }
    }
}

impl Harness {
    // Registers an instance of `service` and marks it healthy.
    pub fn healthy_instance(&self, service: &str, port: u16) -> String {
        let registered = self.registry.register(instance(service, port)).unwrap();
        assert!(self.registry.heartbeat(&registered.id));
        registered.id
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        use tower::ServiceExt;
        self.app.clone().oneshot(request).await.unwrap()
    }
}

pub fn request(method: &str, uri: &str, ip: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("x-forwarded-for", ip)
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
