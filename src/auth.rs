use async_trait::async_trait;
use axum::http::{HeaderMap, header};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

pub const SUPER_ADMIN_ROLE: &str = "super_admin";

// Identity behind a verified bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub user_id: String,
    pub email: String,
    pub role: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl Principal {
    pub fn is_super_admin(&self) -> bool {
        self.role == SUPER_ADMIN_ROLE
    }

    // Super admins pass every check; everyone else needs one of `required`.
    pub fn is_authorized(&self, required: &HashSet<String>) -> bool {
        required.is_empty()
            || self.is_super_admin()
            || self.permissions.iter().any(|p| required.contains(p))
    }
}

// Token verification lives outside the gateway; this is the seam.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn verify(&self, token: &str) -> Option<Principal>;
}

// Fixed token -> principal map, loaded from the config file
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, Principal>,
}

impl StaticTokenAuthenticator {
    pub fn new(tokens: HashMap<String, Principal>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn verify(&self, token: &str) -> Option<Principal> {
        self.tokens.get(token).cloned()
    }
}

// Token from `Authorization: Bearer <token>`, if well formed.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    if scheme.eq_ignore_ascii_case("bearer") && !token.is_empty() {
        Some(token)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn principal(role: &str, permissions: &[&str]) -> Principal {
        Principal {
            user_id: "u-1".into(),
            email: "agent@example.com".into(),
            role: role.into(),
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[test]
    fn any_required_permission_is_enough() {
        let required: HashSet<String> = ["properties:create", "properties:import"]
            .iter()
            .map(|p| p.to_string())
            .collect();

        assert!(principal("agent", &["properties:import"]).is_authorized(&required));
        assert!(!principal("agent", &["properties:read"]).is_authorized(&required));
        assert!(principal(SUPER_ADMIN_ROLE, &[]).is_authorized(&required));
        assert!(principal("viewer", &[]).is_authorized(&HashSet::new()));
    }

    #[test]
    fn bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("bearer  xyz "));
        assert_eq!(bearer_token(&headers), Some("xyz"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwYXNz"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }

    #[tokio::test]
    async fn static_tokens_verify() {
        let mut tokens = HashMap::new();
        tokens.insert("t-agent".to_string(), principal("agent", &["properties:create"]));
        let auth = StaticTokenAuthenticator::new(tokens);

        assert_eq!(auth.verify("t-agent").await.unwrap().role, "agent");
        assert!(auth.verify("t-unknown").await.is_none());
    }
}
