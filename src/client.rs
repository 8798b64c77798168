// Client for one downstream service: instance lookup through the registry,
// per-attempt timeout, retries with exponential backoff, and a circuit
// breaker.
//
// The breaker is trip-and-cooldown: after `failure_threshold` consecutive
// failed calls it rejects everything for `reset_timeout`, then closes fully
// and lets traffic through again with the failure count reset. There is no
// half-open probe phase.

use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderValue, Method, header};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::error::ClientError;
use crate::metrics::CIRCUIT_OPENED_TOTAL;
use crate::registry::ServiceRegistry;
use crate::transport::{OutboundRequest, OutboundResponse, Transport};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub timeout: Duration,
    // Attempts per call, including the first
    pub retries: u32,
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub backoff_base: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retries: 3,
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            backoff_base: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
}

impl RequestOptions {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            ..Default::default()
        }
    }

    fn json<B: Serialize>(method: Method, body: &B) -> Result<Self, ClientError> {
        let encoded = serde_json::to_vec(body).map_err(ClientError::Encode)?;
        let mut options = Self::new(method);
        options
            .headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        options.body = Some(Bytes::from(encoded));
        Ok(options)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerState {
    pub consecutive_failures: u32,
    // `Some` while the circuit is open
    pub opened_at: Option<Instant>,
}

impl CircuitBreakerState {
    pub fn is_open(&self) -> bool {
        self.opened_at.is_some()
    }
}

pub struct ResilientClient {
    service: String,
    registry: Arc<ServiceRegistry>,
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    breaker: Mutex<CircuitBreakerState>,
}

impl ResilientClient {
    pub fn new(
        service: impl Into<String>,
        registry: Arc<ServiceRegistry>,
        transport: Arc<dyn Transport>,
        config: ClientConfig,
    ) -> Self {
        Self {
            service: service.into(),
            registry,
            transport,
            config,
            breaker: Mutex::new(CircuitBreakerState {
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn breaker_state(&self) -> CircuitBreakerState {
        *self.breaker.lock()
    }

    // Sends `path` to a healthy instance and returns the raw 2xx response.
    pub async fn send(&self, path: &str, options: RequestOptions) -> Result<OutboundResponse, ClientError> {
        self.admit()?;

        let url = self
            .registry
            .get_service_url(&self.service, path)
            .ok_or_else(|| ClientError::NoHealthyInstances(self.service.clone()))?;

        let attempts = options.retries.unwrap_or(self.config.retries).max(1);
        let timeout = options.timeout.unwrap_or(self.config.timeout);
        let mut attempt = 0;

        loop {
            let request = OutboundRequest {
                method: options.method.clone(),
                url: url.clone(),
                headers: options.headers.clone(),
                body: options.body.clone(),
            };

            let err = match tokio::time::timeout(timeout, self.transport.send(request)).await {
                Ok(Ok(res)) if res.status.is_success() => {
                    self.record_success();
                    return Ok(res);
                }
                Ok(Ok(res)) => ClientError::Status(res.status),
                Ok(Err(err)) => ClientError::Transport(err),
                Err(_) => ClientError::Timeout(timeout),
            };

            attempt += 1;
            debug!(
                service = %self.service,
                url = %url,
                attempt,
                error = %err,
                "Upstream attempt failed"
            );
            if attempt >= attempts {
                self.record_failure();
                return Err(err);
            }
            sleep(self.config.backoff_base * 2u32.pow(attempt - 1)).await;
        }
    }

    pub async fn request<T: DeserializeOwned>(&self, path: &str, options: RequestOptions) -> Result<T, ClientError> {
        let res = self.send(path, options).await?;
        serde_json::from_slice(&res.body).map_err(ClientError::Decode)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        self.request(path, RequestOptions::new(Method::GET)).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ClientError> {
        self.request(path, RequestOptions::json(Method::POST, body)?).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ClientError> {
        self.request(path, RequestOptions::json(Method::PUT, body)?).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        self.request(path, RequestOptions::new(Method::DELETE)).await
    }

    fn admit(&self) -> Result<(), ClientError> {
        let mut breaker = self.breaker.lock();
        let Some(opened_at) = breaker.opened_at else {
            return Ok(());
        };

        let open_for = Instant::now().saturating_duration_since(opened_at);
        if open_for <= self.config.reset_timeout {
            return Err(ClientError::CircuitOpen {
                service: self.service.clone(),
                retry_in: self.config.reset_timeout - open_for,
            });
        }

        info!(service = %self.service, "Circuit breaker closed after cooldown");
        breaker.opened_at = None;
        breaker.consecutive_failures = 0;
        Ok(())
    }

    fn record_success(&self) {
        let mut breaker = self.breaker.lock();
        breaker.consecutive_failures = 0;
        breaker.opened_at = None;
    }

    fn record_failure(&self) {
        let mut breaker = self.breaker.lock();
        breaker.consecutive_failures += 1;

        if breaker.consecutive_failures >= self.config.failure_threshold && breaker.opened_at.is_none() {
            breaker.opened_at = Some(Instant::now());
            CIRCUIT_OPENED_TOTAL.inc();
            warn!(
                service = %self.service,
                failures = breaker.consecutive_failures,
                reset_secs = self.config.reset_timeout.as_secs(),
                "Circuit breaker opened"
            );
        }
    }
}
