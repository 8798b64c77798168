use serde::Serialize;
use std::collections::HashMap;

use crate::registry::{HealthStatus, ServiceInstance};

// Body of every rejection the gateway produces
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

// Registry API view of an instance
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceView {
    pub id: String,
    pub name: String,
    pub version: String,
    pub url: String,
    pub health_endpoint: String,
    pub metadata: HashMap<String, String>,
    pub status: HealthStatus,
    pub registered_at: String,
    pub last_heartbeat_secs_ago: u64,
}

impl From<&ServiceInstance> for InstanceView {
    fn from(instance: &ServiceInstance) -> Self {
        Self {
            id: instance.id.clone(),
            name: instance.name.clone(),
            version: instance.version.clone(),
            url: instance.base_url(),
            health_endpoint: instance.health_endpoint.clone(),
            metadata: instance.metadata.clone(),
            status: instance.status,
            registered_at: instance.registered_at.to_rfc3339(),
            last_heartbeat_secs_ago: instance.last_heartbeat.elapsed().as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub success: bool,
    pub instance_id: String,
    pub instance: InstanceView,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovedResponse {
    pub success: bool,
    pub removed: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceView {
    pub name: String,
    pub instances: Vec<InstanceView>,
}
