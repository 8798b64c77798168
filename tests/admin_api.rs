mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use std::time::Duration;

use common::{HarnessBuilder, MockTransport, body_json, request};
use estate_gateway::abuse::AbuseConfig;

fn register_body(port: u16) -> Body {
    Body::from(
        json!({
            "name": "property-service",
            "version": "2.1.0",
            "host": "10.0.0.7",
            "port": port,
            "metadata": { "zone": "eu-1" }
        })
        .to_string(),
    )
}

const OPS_TOKEN: &str = "ops-secret";

fn admin(method: &str, uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {OPS_TOKEN}"))
}

fn post_json(uri: &str, body: Body) -> Request<Body> {
    admin("POST", uri)
        .header("content-type", "application/json")
        .body(body)
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    admin("GET", uri).body(Body::empty()).unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    admin("DELETE", uri).body(Body::empty()).unwrap()
}

fn anonymous(method: &str, uri: &str) -> Request<Body> {
    Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn instance_lifecycle_through_the_registry_api() {
    let harness = HarnessBuilder::new(MockTransport::ok("{}")).admin_token(OPS_TOKEN).build();

    let response = harness
        .send(post_json("/_gateway/registry/instances", register_body(3001)))
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    let id = body["instanceId"].as_str().unwrap().to_string();
    assert!(id.starts_with("property-service-"));
    assert_eq!(body["instance"]["url"], "http://10.0.0.7:3001");
    assert_eq!(body["instance"]["healthEndpoint"], "/health");
    assert_eq!(body["instance"]["status"], "unknown");

    // not discoverable until it is known healthy
    let discovered = body_json(harness.send(get("/_gateway/registry/services/property-service")).await).await;
    assert_eq!(discovered, json!([]));

    let response = harness
        .send(post_json(&format!("/_gateway/registry/instances/{id}/heartbeat"), Body::empty()))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let discovered = body_json(harness.send(get("/_gateway/registry/services/property-service")).await).await;
    assert_eq!(discovered.as_array().unwrap().len(), 1);
    assert_eq!(discovered[0]["id"], id.as_str());
    assert_eq!(discovered[0]["metadata"]["zone"], "eu-1");

    let services = body_json(harness.send(get("/_gateway/registry/services")).await).await;
    assert_eq!(services[0]["name"], "property-service");
    assert_eq!(services[0]["instances"][0]["status"], "healthy");

    let response = harness
        .send(delete(&format!("/_gateway/registry/instances/{id}")))
        .await;
    assert_eq!(body_json(response).await, json!({ "success": true, "removed": 1 }));
    assert!(harness.registry.services().is_empty());

    // unknown ids are a no-op
    let response = harness
        .send(delete(&format!("/_gateway/registry/instances/{id}")))
        .await;
    assert_eq!(body_json(response).await["removed"], 0);

    let response = harness
        .send(post_json(&format!("/_gateway/registry/instances/{id}/heartbeat"), Body::empty()))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_registrations_are_rejected() {
    let harness = HarnessBuilder::new(MockTransport::ok("{}")).admin_token(OPS_TOKEN).build();

    let body = Body::from(json!({ "name": "", "version": "1", "host": "10.0.0.7", "port": 3001 }).to_string());
    let response = harness.send(post_json("/_gateway/registry/instances", body)).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["success"], false);
    assert!(harness.registry.services().is_empty());
}

#[tokio::test]
async fn admin_token_guards_management_routes_only() {
    let harness = HarnessBuilder::new(MockTransport::ok("{}")).admin_token(OPS_TOKEN).build();

    let response = harness.send(anonymous("GET", "/_gateway/registry/services")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = harness
        .send(
            Request::builder()
                .uri("/_gateway/registry/services")
                .header("authorization", "Bearer wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = harness.send(get("/_gateway/registry/services")).await;
    assert_eq!(response.status(), StatusCode::OK);

    // health and metrics stay open for probes and scrapers
    assert_eq!(harness.send(anonymous("GET", "/_gateway/health")).await.status(), StatusCode::OK);
    assert_eq!(harness.send(anonymous("GET", "/_gateway/metrics")).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn management_routes_are_absent_without_admin_token() {
    let harness = HarnessBuilder::new(MockTransport::ok("{}"))
        .abuse(AbuseConfig {
            burst_threshold: 3,
            max_requests_per_second: 3,
            window: Duration::from_secs(60),
            block_duration: Duration::from_secs(3600),
        })
        .build();
    harness.healthy_instance("property-service", 3001);
    let listing = || request("GET", "/api/v1/properties", "192.0.2.99").body(Body::empty()).unwrap();

    for _ in 0..3 {
        harness.send(listing()).await;
    }
    assert_eq!(harness.send(listing()).await.status(), StatusCode::FORBIDDEN);

    // the banned source cannot lift its own ban or limits
    for uri in ["/_gateway/blocks/192.0.2.99", "/_gateway/rate-limits/192.0.2.99"] {
        let response = harness
            .send(request("DELETE", uri, "192.0.2.99").body(Body::empty()).unwrap())
            .await;
        assert_ne!(response.status(), StatusCode::OK);
    }
    assert!(harness.abuse.is_blocked("192.0.2.99"));
    assert_eq!(harness.send(listing()).await.status(), StatusCode::FORBIDDEN);

    // nor can anyone else, token or not
    let response = harness
        .send(request("DELETE", "/_gateway/blocks/192.0.2.99", "192.0.2.100").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(harness.send(delete("/_gateway/blocks/192.0.2.99")).await.status(), StatusCode::NOT_FOUND);
    assert!(harness.abuse.is_blocked("192.0.2.99"));

    // and no one can slip an instance into the rotation
    let response = harness
        .send(post_json("/_gateway/registry/instances", register_body(9999)))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(harness.registry.instances("property-service").len(), 1);

    assert_eq!(harness.send(anonymous("GET", "/_gateway/health")).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn health_reports_instance_summary() {
    let harness = HarnessBuilder::new(MockTransport::ok("{}")).admin_token(OPS_TOKEN).build();
    harness.healthy_instance("property-service", 3001);
    harness.registry.register(common::instance("search-service", 4000)).unwrap();

    let body = body_json(harness.send(get("/_gateway/health")).await).await;

    assert_eq!(body["status"], "healthy");
    assert_eq!(body["services"], 2);
    assert_eq!(body["instances"]["healthy"], 1);
    assert_eq!(body["instances"]["unknown"], 1);
}

#[tokio::test]
async fn metrics_are_exposed_in_text_format() {
    let harness = HarnessBuilder::new(MockTransport::ok("{}")).admin_token(OPS_TOKEN).build();
    // touch the pipeline so the request counters exist
    harness
        .send(request("GET", "/nowhere", "192.0.2.90").body(Body::empty()).unwrap())
        .await;

    let response = harness.send(get("/_gateway/metrics")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("gateway_requests_total"));
}

#[tokio::test]
async fn operators_can_clear_limits_and_bans() {
    let harness = HarnessBuilder::new(MockTransport::ok("{}"))
        .admin_token(OPS_TOKEN)
        .abuse(AbuseConfig {
            burst_threshold: 2,
            max_requests_per_second: 2,
            window: Duration::from_secs(60),
            block_duration: Duration::from_secs(3600),
        })
        .build();
    harness.healthy_instance("property-service", 3001);
    let listing = || request("GET", "/api/v1/properties", "192.0.2.77").body(Body::empty()).unwrap();

    assert_eq!(harness.send(listing()).await.status(), StatusCode::OK);
    assert_eq!(harness.send(listing()).await.status(), StatusCode::FORBIDDEN);
    assert!(harness.abuse.is_blocked("192.0.2.77"));

    let response = harness.send(delete("/_gateway/blocks/192.0.2.77")).await;
    assert_eq!(body_json(response).await, json!({ "success": true, "removed": 1 }));
    assert!(!harness.abuse.is_blocked("192.0.2.77"));
    assert_eq!(harness.send(listing()).await.status(), StatusCode::OK);

    let response = harness.send(delete("/_gateway/rate-limits/192.0.2.77")).await;
    assert_eq!(body_json(response).await, json!({ "success": true, "removed": 1 }));
    assert!(harness.limiter.entry("192.0.2.77", "api").is_none());
}
