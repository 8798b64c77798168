// Static route table: which service owns a path, and what a request must
// pass before it gets there.

use axum::http::Method;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

use crate::error::ConfigError;
use crate::rate_limit::DEFAULT_CATEGORY;

#[derive(Debug, Clone, PartialEq)]
pub struct RouteConfig {
    pub service: String,
    pub path_prefix: String,
    pub auth: bool,
    pub rate_limit_category: String,
    pub methods: HashSet<Method>,
    // Any one of these is enough; empty means no permission check
    pub permissions: HashSet<String>,
}

impl RouteConfig {
    // Prefix match on whole path segments.
    pub fn matches(&self, method: &Method, path: &str) -> bool {
        if !self.methods.contains(method) {
            return false;
        }
        let prefix = self.path_prefix.trim_end_matches('/');
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

fn default_category() -> String {
    DEFAULT_CATEGORY.to_string()
}

// Route as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    pub service: String,
    pub path_prefix: String,
    #[serde(default)]
    pub auth: bool,
    #[serde(default = "default_category")]
    pub rate_limit_category: String,
    pub methods: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl TryFrom<RouteSpec> for RouteConfig {
    type Error = ConfigError;

    fn try_from(spec: RouteSpec) -> Result<Self, Self::Error> {
        let invalid = |reason: String| ConfigError::InvalidRoute {
            prefix: spec.path_prefix.clone(),
            reason,
        };

        if !spec.path_prefix.starts_with('/') {
            return Err(invalid("pathPrefix must start with '/'".into()));
        }
        if spec.service.trim().is_empty() {
            return Err(invalid("service is empty".into()));
        }
        if spec.methods.is_empty() {
            return Err(invalid("at least one method is required".into()));
        }
        if !spec.permissions.is_empty() && !spec.auth {
            return Err(invalid("permissions require auth".into()));
        }

        let methods = spec
            .methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                    .map_err(|_| invalid(format!("unknown method {m}")))
            })
            .collect::<Result<HashSet<_>, _>>()?;

        Ok(RouteConfig {
            service: spec.service,
            path_prefix: spec.path_prefix,
            auth: spec.auth,
            rate_limit_category: spec.rate_limit_category,
            methods,
            permissions: spec.permissions.into_iter().collect(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: Vec<RouteConfig>,
}

impl RouteTable {
    pub fn new(routes: Vec<RouteConfig>) -> Self {
        Self { routes }
    }

    pub fn from_specs(specs: Vec<RouteSpec>) -> Result<Self, ConfigError> {
        let routes = specs
            .into_iter()
            .map(RouteConfig::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(routes))
    }

    // First route, in table order, that accepts the method and path.
    pub fn match_route(&self, method: &Method, path: &str) -> Option<&RouteConfig> {
        self.routes.iter().find(|r| r.matches(method, path))
    }

    pub fn services(&self) -> BTreeSet<String> {
        self.routes.iter().map(|r| r.service.clone()).collect()
    }

    pub fn routes(&self) -> &[RouteConfig] {
        &self.routes
    }
}

fn route(
    service: &str,
    path_prefix: &str,
    methods: &[Method],
    auth: bool,
    rate_limit_category: &str,
    permissions: &[&str],
) -> RouteConfig {
    RouteConfig {
        service: service.to_string(),
        path_prefix: path_prefix.to_string(),
        auth,
        rate_limit_category: rate_limit_category.to_string(),
        methods: methods.iter().cloned().collect(),
        permissions: permissions.iter().map(|p| p.to_string()).collect(),
    }
}

// Route table for the listing services.
pub fn default_routes() -> RouteTable {
    use Method as M;

    RouteTable::new(vec![
        // properties: public reads, permissioned writes
        route("property-service", "/api/v1/properties", &[M::GET], false, "api", &[]),
        route("property-service", "/api/v1/properties", &[M::POST], true, "api", &["properties:create"]),
        route(
            "property-service",
            "/api/v1/properties",
            &[M::PUT, M::PATCH],
            true,
            "api",
            &["properties:update"],
        ),
        route("property-service", "/api/v1/properties", &[M::DELETE], true, "api", &["properties:delete"]),
        route("search-service", "/api/v1/search", &[M::GET, M::POST], false, "search", &[]),
        route("user-service", "/api/v1/auth", &[M::POST], false, "auth", &[]),
        route("user-service", "/api/v1/users", &[M::GET, M::PUT, M::PATCH], true, "api", &[]),
        route("user-service", "/api/v1/users", &[M::DELETE], true, "api", &["users:delete"]),
        route(
            "user-service",
            "/api/v1/admin",
            &[M::GET, M::POST, M::PUT, M::PATCH, M::DELETE],
            true,
            "admin",
            &["admin:access"],
        ),
    ])
}
