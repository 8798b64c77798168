// The request pipeline.
//
// Every inbound request goes through, in order: abuse guard, route match,
// admission control, authentication and permission check (when the route
// asks for them), then dispatch to the owning service with a local
// fallback. Rejections short-circuit as `GatewayError`s; anything
// unexpected, panics included, becomes a generic 500 plus a security event.

use axum::body::{Body, Bytes};
use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Uri, header};
use axum::response::{IntoResponse, Response};
use futures::{FutureExt, StreamExt};
use serde_json::json;
use std::any::Any;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::abuse::{AbuseConfig, AbuseGuard, AbuseVerdict};
use crate::auth::{Authenticator, Principal, StaticTokenAuthenticator, bearer_token};
use crate::client::{ClientConfig, RequestOptions, ResilientClient};
use crate::error::{ConfigError, GatewayError};
use crate::fallback::LocalFallbackDispatcher;
use crate::metrics::{
    FALLBACK_DISPATCH_TOTAL, RATE_LIMITED_TOTAL, REQUEST_LATENCY, REQUEST_TOTAL, RESPONSES_BY_STATUS,
};
use crate::rate_limit::{RateLimiter, default_categories};
use crate::registry::ServiceRegistry;
use crate::routes::{RouteConfig, RouteTable};
use crate::security::{SecurityEvent, SecurityEventKind, SecurityEventSink, Severity, apply_security_headers};
use crate::transport::{OutboundResponse, Transport};

pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

// Checked in order; the first one present names the client.
const SOURCE_IP_HEADERS: [&str; 3] = ["x-forwarded-for", "x-real-ip", "cf-connecting-ip"];

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const USER_ID_HEADER: &str = "x-user-id";
const USER_ROLE_HEADER: &str = "x-user-role";
const REQUEST_ID_HEADER: &str = "x-request-id";

// A request that passed every check, as handed to a service or fallback.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub source_ip: String,
    pub principal: Option<Principal>,
}

pub struct Gateway {
    routes: RouteTable,
    abuse: Arc<AbuseGuard>,
    limiter: Arc<RateLimiter>,
    authenticator: Arc<dyn Authenticator>,
    clients: HashMap<String, ResilientClient>,
    fallbacks: LocalFallbackDispatcher,
    events: Arc<dyn SecurityEventSink>,
    max_body_bytes: usize,
}

pub struct GatewayBuilder {
    routes: RouteTable,
    registry: Arc<ServiceRegistry>,
    transport: Arc<dyn Transport>,
    events: Arc<dyn SecurityEventSink>,
    limiter: Option<Arc<RateLimiter>>,
    abuse: Option<Arc<AbuseGuard>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    client_config: ClientConfig,
    fallbacks: LocalFallbackDispatcher,
    max_body_bytes: usize,
}

impl GatewayBuilder {
    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn abuse_guard(mut self, abuse: Arc<AbuseGuard>) -> Self {
        self.abuse = Some(abuse);
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn client_config(mut self, config: ClientConfig) -> Self {
        self.client_config = config;
        self
    }

    pub fn fallbacks(mut self, fallbacks: LocalFallbackDispatcher) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    pub fn max_body_bytes(mut self, max: usize) -> Self {
        self.max_body_bytes = max;
        self
    }

    pub fn build(self) -> Result<Gateway, ConfigError> {
        let limiter = match self.limiter {
            Some(limiter) => limiter,
            None => Arc::new(RateLimiter::new(default_categories())?),
        };
        let abuse = self
            .abuse
            .unwrap_or_else(|| Arc::new(AbuseGuard::new(AbuseConfig::default(), self.events.clone())));
        let authenticator = self
            .authenticator
            .unwrap_or_else(|| Arc::new(StaticTokenAuthenticator::default()));

        // one client, and so one breaker, per routed service
        let clients = self
            .routes
            .services()
            .into_iter()
            .map(|service| {
                let client = ResilientClient::new(
                    service.clone(),
                    self.registry.clone(),
                    self.transport.clone(),
                    self.client_config.clone(),
                );
                (service, client)
            })
            .collect();

        Ok(Gateway {
            routes: self.routes,
            abuse,
            limiter,
            authenticator,
            clients,
            fallbacks: self.fallbacks,
            events: self.events,
            max_body_bytes: self.max_body_bytes,
        })
    }
}

impl Gateway {
    pub fn builder(
        routes: RouteTable,
        registry: Arc<ServiceRegistry>,
        transport: Arc<dyn Transport>,
        events: Arc<dyn SecurityEventSink>,
    ) -> GatewayBuilder {
        GatewayBuilder {
            routes,
            registry,
            transport,
            events,
            limiter: None,
            abuse: None,
            authenticator: None,
            client_config: ClientConfig::default(),
            fallbacks: LocalFallbackDispatcher::new(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn client(&self, service: &str) -> Option<&ResilientClient> {
        self.clients.get(service)
    }

    pub async fn handle(&self, request: Request<Body>) -> Response {
        let started = Instant::now();
        REQUEST_TOTAL.inc();

        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip());
        let source_ip = client_ip(request.headers(), peer);
        let path = request.uri().path().to_string();
        let user_agent = request
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let outcome = AssertUnwindSafe(self.process(request, &source_ip))
            .catch_unwind()
            .await;

        let mut response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                if let GatewayError::Internal(detail) = &err {
                    self.report_internal(&source_ip, &path, user_agent, detail);
                }
                err.into_response()
            }
            Err(panic) => {
                let detail = panic_message(panic.as_ref());
                self.report_internal(&source_ip, &path, user_agent, &detail);
                GatewayError::Internal(detail).into_response()
            }
        };

        let elapsed = started.elapsed();
        if let Ok(value) = HeaderValue::from_str(&format!("{}ms", elapsed.as_millis())) {
            response.headers_mut().insert("x-response-time", value);
        }
        apply_security_headers(response.headers_mut());

        RESPONSES_BY_STATUS
            .with_label_values(&[response.status().as_str()])
            .inc();
        REQUEST_LATENCY.observe(elapsed.as_secs_f64());
        response
    }

    async fn process(&self, request: Request<Body>, source_ip: &str) -> Result<Response, GatewayError> {
        match self.abuse.check(source_ip) {
            AbuseVerdict::Allow => {}
            AbuseVerdict::Throttle { retry_after } => {
                return Err(GatewayError::AbuseThrottled { retry_after });
            }
            AbuseVerdict::Block { retry_after } => {
                return Err(GatewayError::AbuseBlocked { retry_after });
            }
        }

        let (parts, body) = request.into_parts();
        let path = parts.uri.path().to_string();

        let route = self
            .routes
            .match_route(&parts.method, &path)
            .ok_or_else(|| GatewayError::RouteNotFound {
                method: parts.method.to_string(),
                path: path.clone(),
            })?;

        let decision = self.limiter.check(source_ip, &route.rate_limit_category);
        if !decision.allowed {
            RATE_LIMITED_TOTAL.inc();
            self.events.record(
                SecurityEvent::new(SecurityEventKind::RateLimitExceeded, Severity::Low, source_ip)
                    .with_path(path.as_str())
                    .with_details(json!({
                        "category": route.rate_limit_category,
                        "limit": decision.limit,
                    })),
            );
            return Err(GatewayError::AdmissionRejected(decision));
        }

        let principal = if route.auth {
            Some(self.authenticate(&parts.headers, source_ip, &path).await?)
        } else {
            None
        };

        if !route.permissions.is_empty() {
            let authorized = principal
                .as_ref()
                .is_some_and(|p| p.is_authorized(&route.permissions));
            if !authorized {
                let mut required: Vec<&String> = route.permissions.iter().collect();
                required.sort();
                self.events.record(
                    SecurityEvent::new(SecurityEventKind::AccessDenied, Severity::Medium, source_ip)
                        .with_path(path.as_str())
                        .with_details(json!({
                            "userId": principal.as_ref().map(|p| p.user_id.as_str()),
                            "role": principal.as_ref().map(|p| p.role.as_str()),
                            "required": required,
                        })),
                );
                return Err(GatewayError::Unauthorized);
            }
        }

        let body = read_body(body, self.max_body_bytes).await?;

        let inbound = InboundRequest {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
            source_ip: source_ip.to_string(),
            principal,
        };

        let mut response = self.dispatch(route, inbound).await?;
        decision.apply_headers(response.headers_mut());
        Ok(response)
    }

    async fn authenticate(&self, headers: &HeaderMap, source_ip: &str, path: &str) -> Result<Principal, GatewayError> {
        let Some(token) = bearer_token(headers) else {
            return Err(GatewayError::Unauthenticated("missing bearer token"));
        };

        match self.authenticator.verify(token).await {
            Some(principal) => Ok(principal),
            None => {
                self.events.record(
                    SecurityEvent::new(SecurityEventKind::AuthFailure, Severity::Low, source_ip).with_path(path),
                );
                Err(GatewayError::Unauthenticated("invalid or expired token"))
            }
        }
    }

    async fn dispatch(&self, route: &RouteConfig, request: InboundRequest) -> Result<Response, GatewayError> {
        let target = request
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();

        if let Some(client) = self.clients.get(&route.service) {
            let options = RequestOptions {
                method: request.method.clone(),
                headers: forward_headers(&request),
                body: (!request.body.is_empty()).then(|| request.body.clone()),
                timeout: None,
                retries: None,
            };
            match client.send(&target, options).await {
                Ok(upstream) => return Ok(upstream_response(upstream)),
                Err(err) => warn!(
                    service = %route.service,
                    target = %target,
                    error = %err,
                    "Dispatch failed, trying local fallback"
                ),
            }
        }

        match self.fallbacks.dispatch(&route.service, request).await {
            Some(response) => {
                FALLBACK_DISPATCH_TOTAL.inc();
                debug!(service = %route.service, "Served by local fallback");
                Ok(response)
            }
            None => Err(GatewayError::BackendUnavailable {
                service: route.service.clone(),
            }),
        }
    }

    fn report_internal(&self, source_ip: &str, path: &str, user_agent: Option<String>, detail: &str) {
        error!(ip = source_ip, path = path, error = detail, "Unhandled gateway error");
        self.events.record(
            SecurityEvent::new(SecurityEventKind::InternalError, Severity::Medium, source_ip)
                .with_path(path)
                .with_user_agent(user_agent)
                .with_details(json!({ "error": detail })),
        );
    }
}

// Client address from proxy headers, else the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> String {
    for name in SOURCE_IP_HEADERS {
        let first = headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = first {
            return ip.to_string();
        }
    }
    peer.map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

// Buffers the body, refusing it once it grows past `limit`; a stream that
// breaks off (client gone, bad chunking) is the client's fault, not a size issue.
async fn read_body(body: Body, limit: usize) -> Result<Bytes, GatewayError> {
    let mut stream = body.into_data_stream();
    let mut buf = Vec::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| GatewayError::BadRequest(err.to_string()))?;
        if buf.len() + chunk.len() > limit {
            return Err(GatewayError::PayloadTooLarge);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(buf))
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

// Headers sent downstream: client headers minus hop-by-hop and identity
// headers, plus forwarding and identity set by the gateway.
fn forward_headers(request: &InboundRequest) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in request.headers.iter() {
        if is_hop_by_hop(name)
            || *name == header::HOST
            || *name == header::CONTENT_LENGTH
            || name.as_str() == USER_ID_HEADER
            || name.as_str() == USER_ROLE_HEADER
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if !headers.contains_key("x-forwarded-for") {
        if let Ok(ip) = HeaderValue::from_str(&request.source_ip) {
            headers.insert("x-forwarded-for", ip);
        }
    }
    if !headers.contains_key(REQUEST_ID_HEADER) {
        if let Ok(id) = HeaderValue::from_str(&Uuid::new_v4().to_string()) {
            headers.insert(REQUEST_ID_HEADER, id);
        }
    }
    if let Some(principal) = &request.principal {
        if let Ok(id) = HeaderValue::from_str(&principal.user_id) {
            headers.insert(USER_ID_HEADER, id);
        }
        if let Ok(role) = HeaderValue::from_str(&principal.role) {
            headers.insert(USER_ROLE_HEADER, role);
        }
    }
    headers
}

fn upstream_response(upstream: OutboundResponse) -> Response {
    let mut response = Response::new(Body::from(upstream.body));
    *response.status_mut() = upstream.status;
    for (name, value) in upstream.headers.iter() {
        if is_hop_by_hop(name) || *name == header::CONTENT_LENGTH {
            continue;
        }
        response.headers_mut().append(name.clone(), value.clone());
    }
    response
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
