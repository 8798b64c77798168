use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::abuse::AbuseConfig;
use crate::auth::Principal;
use crate::client::ClientConfig;
use crate::error::ConfigError;
use crate::gateway::DEFAULT_MAX_BODY_BYTES;
use crate::rate_limit::{RateLimitConfig, default_categories};
use crate::registry::{InstanceConfig, RegistryConfig};
use crate::routes::{RouteSpec, RouteTable, default_routes};

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "estate-gateway")]
#[command(about = "API gateway for the estate listing services")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    // Static service instances (comma-separated name=host:port)
    // Example: "property-service=localhost:3001,user-service=localhost:3002"
    #[arg(short, long, default_value = "")]
    pub services: String,

    // JSON file with routes, rate limits and tokens
    #[arg(short, long)]
    pub config: Option<String>,

    // Health check interval in seconds
    #[arg(long, default_value_t = 30)]
    pub health_interval: u64,

    // Health probe timeout in seconds
    #[arg(long, default_value_t = 5)]
    pub probe_timeout: u64,

    // Seconds a heartbeat keeps an unreachable instance's status
    #[arg(long, default_value_t = 60)]
    pub heartbeat_grace: u64,

    // Per-attempt upstream timeout in seconds
    #[arg(long, default_value_t = 5)]
    pub upstream_timeout: u64,

    // Attempts per upstream call
    #[arg(long, default_value_t = 3)]
    pub retries: u32,

    // Failed calls before a service's circuit opens
    #[arg(long, default_value_t = 5)]
    pub failure_threshold: u32,

    // Seconds an open circuit rejects calls
    #[arg(long, default_value_t = 60)]
    pub circuit_reset: u64,

    // Requests per second from one source that trigger a ban
    #[arg(long, default_value_t = 100)]
    pub burst_threshold: u32,

    // Requests per second from one source before throttling
    #[arg(long, default_value_t = 50)]
    pub max_rps: u32,

    // Ban duration in seconds
    #[arg(long, default_value_t = 3600)]
    pub block_duration: u64,

    // Largest accepted request body
    #[arg(long, default_value_t = DEFAULT_MAX_BODY_BYTES)]
    pub max_body_bytes: usize,

    // Bearer token required on /_gateway management routes
    #[arg(long)]
    pub admin_token: Option<String>,
}

impl Args {
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            health_interval: Duration::from_secs(self.health_interval),
            probe_timeout: Duration::from_secs(self.probe_timeout),
            heartbeat_grace: Duration::from_secs(self.heartbeat_grace),
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(self.upstream_timeout),
            retries: self.retries,
            failure_threshold: self.failure_threshold,
            reset_timeout: Duration::from_secs(self.circuit_reset),
            ..ClientConfig::default()
        }
    }

    pub fn abuse_config(&self) -> Result<AbuseConfig, ConfigError> {
        let config = AbuseConfig {
            burst_threshold: self.burst_threshold,
            max_requests_per_second: self.max_rps,
            block_duration: Duration::from_secs(self.block_duration),
            ..AbuseConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}

// Contents of --config; every section is optional
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileConfig {
    #[serde(default)]
    pub routes: Option<Vec<RouteSpec>>,
    #[serde(default)]
    pub rate_limits: Option<HashMap<String, RateLimitConfig>>,
    #[serde(default)]
    pub tokens: HashMap<String, Principal>,
}

impl FileConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn route_table(&self) -> Result<RouteTable, ConfigError> {
        match &self.routes {
            Some(specs) => RouteTable::from_specs(specs.clone()),
            None => Ok(default_routes()),
        }
    }

    pub fn rate_limit_categories(&self) -> HashMap<String, RateLimitConfig> {
        self.rate_limits.clone().unwrap_or_else(default_categories)
    }
}

// Parse "name=host:port,..." into instances to register at startup
pub fn parse_static_services(services: &str) -> Result<Vec<InstanceConfig>, ConfigError> {
    services
        .split(',')
        .map(|s| s.trim()) // remove spaces
        .filter(|s| !s.is_empty()) // remove empty strings
        .map(parse_service)
        .collect()
}

fn parse_service(spec: &str) -> Result<InstanceConfig, ConfigError> {
    let invalid = || ConfigError::InvalidService(spec.to_string());

    let (name, target) = spec.split_once('=').ok_or_else(invalid)?;
    let (protocol, address) = match target.split_once("://") {
        Some((protocol, address)) => (protocol.to_string(), address),
        None => ("http".to_string(), target),
    };
    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    let port: u16 = port.trim_end_matches('/').parse().map_err(|_| invalid())?;

    if name.trim().is_empty() || host.is_empty() {
        return Err(invalid());
    }

    Ok(InstanceConfig {
        name: name.trim().to_string(),
        version: "static".to_string(),
        host: host.to_string(),
        port,
        protocol,
        health_endpoint: "/health".to_string(),
        metadata: HashMap::from([("source".to_string(), "cli".to_string())]),
    })
}
