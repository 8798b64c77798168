use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, interval};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RegistryError;
use crate::metrics::HEALTHY_INSTANCES;
use crate::transport::{OutboundRequest, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

fn default_protocol() -> String {
    "http".to_string()
}

fn default_health_endpoint() -> String {
    "/health".to_string()
}

// What a service sends to register itself
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceConfig {
    pub name: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_health_endpoint")]
    pub health_endpoint: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl InstanceConfig {
    fn validate(&self) -> Result<(), RegistryError> {
        if self.name.trim().is_empty() {
            return Err(RegistryError::InvalidInstance("name is empty".into()));
        }
        if self.host.trim().is_empty() {
            return Err(RegistryError::InvalidInstance("host is empty".into()));
        }
        if self.port == 0 {
            return Err(RegistryError::InvalidInstance("port must be non-zero".into()));
        }
        if self.protocol != "http" && self.protocol != "https" {
            return Err(RegistryError::InvalidInstance(format!(
                "unsupported protocol {}",
                self.protocol
            )));
        }
        Ok(())
    }
}

// One registered instance of a service
#[derive(Debug, Clone)]
pub struct ServiceInstance {
    pub id: String,
    pub name: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub health_endpoint: String,
    pub metadata: HashMap<String, String>,
    pub status: HealthStatus,
    // registration counts as the first heartbeat
    pub last_heartbeat: Instant,
    pub registered_at: DateTime<Utc>,
}

impl ServiceInstance {
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }

    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url(), path)
        } else {
            format!("{}/{}", self.base_url(), path)
        }
    }

    pub fn health_url(&self) -> String {
        self.url_for(&self.health_endpoint)
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub health_interval: Duration,
    pub probe_timeout: Duration,
    // How long a heartbeat covers for an unreachable health endpoint
    pub heartbeat_grace: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            heartbeat_grace: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
enum ProbeOutcome {
    Healthy,
    Failing(u16),
    Unreachable(String),
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeOutcome::Healthy => write!(f, "healthy"),
            ProbeOutcome::Failing(status) => write!(f, "responded {status}"),
            ProbeOutcome::Unreachable(reason) => write!(f, "unreachable: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub checked: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub unknown: usize,
}

// Directory of service instances, health-checked and handed out round-robin
pub struct ServiceRegistry {
    services: DashMap<String, Vec<ServiceInstance>>,
    cursors: DashMap<String, usize>,
    transport: Arc<dyn Transport>,
    config: RegistryConfig,
}

impl ServiceRegistry {
    pub fn new(transport: Arc<dyn Transport>, config: RegistryConfig) -> Self {
        Self {
            services: DashMap::new(),
            cursors: DashMap::new(),
            transport,
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn register(&self, config: InstanceConfig) -> Result<ServiceInstance, RegistryError> {
        config.validate()?;

        let instance = ServiceInstance {
            id: format!("{}-{}", config.name, Uuid::new_v4().simple()),
            name: config.name,
            version: config.version,
            host: config.host,
            port: config.port,
            protocol: config.protocol,
            health_endpoint: config.health_endpoint,
            metadata: config.metadata,
            status: HealthStatus::Unknown,
            last_heartbeat: Instant::now(),
            registered_at: Utc::now(),
        };

        info!(
            service = %instance.name,
            instance = %instance.id,
            url = %instance.base_url(),
            "Registered service instance"
        );
        self.services
            .entry(instance.name.clone())
            .or_default()
            .push(instance.clone());
        Ok(instance)
    }

    // Returns whether anything was removed; unknown ids are a no-op.
    pub fn deregister(&self, instance_id: &str) -> bool {
        let mut emptied = None;
        let mut removed = false;

        for mut entry in self.services.iter_mut() {
            if let Some(pos) = entry.iter().position(|i| i.id == instance_id) {
                entry.remove(pos);
                removed = true;
                if entry.is_empty() {
                    emptied = Some(entry.key().clone());
                }
                break;
            }
        }

        if let Some(name) = emptied {
            self.services.remove_if(&name, |_, instances| instances.is_empty());
        }
        if removed {
            info!(instance = instance_id, "Deregistered service instance");
        }
        removed
    }

    // Healthy instances of `service_name`, in registration order.
    pub fn discover(&self, service_name: &str) -> Vec<ServiceInstance> {
        self.services
            .get(service_name)
            .map(|instances| {
                instances
                    .iter()
                    .filter(|i| i.status == HealthStatus::Healthy)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    // Next healthy instance (round-robin)
    pub fn get_instance(&self, service_name: &str) -> Option<ServiceInstance> {
        let healthy = self.discover(service_name);
        if healthy.is_empty() {
            return None;
        }

        let mut cursor = self.cursors.entry(service_name.to_string()).or_insert(0);
        // the list may have shrunk since the last pick
        let idx = *cursor % healthy.len();
        *cursor = (idx + 1) % healthy.len();
        healthy.into_iter().nth(idx)
    }

    pub fn get_service_url(&self, service_name: &str, path: &str) -> Option<String> {
        self.get_instance(service_name).map(|i| i.url_for(path))
    }

    // Liveness reported by the instance itself; returns false for unknown ids.
    pub fn heartbeat(&self, instance_id: &str) -> bool {
        let now = Instant::now();
        self.with_instance(instance_id, |instance| {
            if instance.status != HealthStatus::Healthy {
                info!(instance = instance_id, "Instance is now healthy (heartbeat)");
            }
            instance.status = HealthStatus::Healthy;
            instance.last_heartbeat = now;
        })
        .is_some()
    }

    // Every instance of `service_name`, whatever its status.
    pub fn instances(&self, service_name: &str) -> Vec<ServiceInstance> {
        self.services
            .get(service_name)
            .map(|instances| instances.clone())
            .unwrap_or_default()
    }

    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn instance(&self, instance_id: &str) -> Option<ServiceInstance> {
        self.with_instance(instance_id, |instance| instance.clone())
    }

    fn with_instance<R>(&self, instance_id: &str, f: impl FnOnce(&mut ServiceInstance) -> R) -> Option<R> {
        for mut entry in self.services.iter_mut() {
            if let Some(instance) = entry.iter_mut().find(|i| i.id == instance_id) {
                return Some(f(instance));
            }
        }
        None
    }

    // Probes every registered instance once and applies the results.
    pub async fn run_health_checks(&self) -> HealthSummary {
        let targets: Vec<(String, String)> = self
            .services
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .map(|i| (i.id.clone(), i.health_url()))
                    .collect::<Vec<_>>()
            })
            .collect();

        let probes = targets.into_iter().map(|(id, url)| async move {
            let outcome = self.probe(&url).await;
            (id, outcome)
        });
        let results = join_all(probes).await;

        let now = Instant::now();
        for (id, outcome) in results {
            self.apply_probe(&id, outcome, now);
        }

        let summary = self.summary();
        HEALTHY_INSTANCES.set(summary.healthy as f64);
        debug!(?summary, "Health sweep finished");
        summary
    }

    async fn probe(&self, url: &str) -> ProbeOutcome {
        let timeout = self.config.probe_timeout;
        match tokio::time::timeout(timeout, self.transport.send(OutboundRequest::get(url))).await {
            Ok(Ok(res)) if res.status.is_success() => ProbeOutcome::Healthy,
            Ok(Ok(res)) => ProbeOutcome::Failing(res.status.as_u16()),
            Ok(Err(err)) => ProbeOutcome::Unreachable(err.to_string()),
            Err(_) => ProbeOutcome::Unreachable(format!("no answer within {timeout:?}")),
        }
    }

    // An HTTP answer decides; a recent heartbeat only covers for no answer.
    fn apply_probe(&self, instance_id: &str, outcome: ProbeOutcome, now: Instant) {
        let grace = self.config.heartbeat_grace;

        self.with_instance(instance_id, |instance| {
            let next = match &outcome {
                ProbeOutcome::Healthy => HealthStatus::Healthy,
                ProbeOutcome::Failing(_) => HealthStatus::Unhealthy,
                ProbeOutcome::Unreachable(_) => {
                    if now.saturating_duration_since(instance.last_heartbeat) < grace {
                        instance.status
                    } else {
                        HealthStatus::Unhealthy
                    }
                }
            };

            if next != instance.status {
                match next {
                    HealthStatus::Healthy => {
                        info!(instance = %instance.id, url = %instance.base_url(), "Instance is now healthy")
                    }
                    _ => warn!(
                        instance = %instance.id,
                        url = %instance.base_url(),
                        probe = %outcome,
                        "Instance is now unhealthy"
                    ),
                }
            }
            instance.status = next;
        });
    }

    pub fn summary(&self) -> HealthSummary {
        let mut summary = HealthSummary::default();
        for entry in self.services.iter() {
            for instance in entry.value() {
                summary.checked += 1;
                match instance.status {
                    HealthStatus::Healthy => summary.healthy += 1,
                    HealthStatus::Unhealthy => summary.unhealthy += 1,
                    HealthStatus::Unknown => summary.unknown += 1,
                }
            }
        }
        summary
    }
}

// Health check loop - one sweep per interval
pub async fn health_checker(registry: Arc<ServiceRegistry>) {
    let mut interval = interval(registry.config().health_interval);

    info!(
        interval = ?registry.config().health_interval,
        "Health checker started"
    );

    loop {
        interval.tick().await;
        registry.run_health_checks().await;
    }
}
