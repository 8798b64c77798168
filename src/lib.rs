// Gateway core for the estate listing services.
//
// One process sits in front of the property, user and search services and
// decides, per request, whether the caller may pass and where the request
// goes. `gateway::Gateway` is the pipeline; `handlers::router` wires it
// and the `/_gateway` management API into an axum router.

pub mod abuse;
pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod fallback;
pub mod gateway;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod rate_limit;
pub mod registry;
pub mod routes;
pub mod security;
pub mod state;
pub mod store;
pub mod transport;
pub mod worker;
