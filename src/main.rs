use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use estate_gateway::abuse::AbuseGuard;
use estate_gateway::auth::StaticTokenAuthenticator;
use estate_gateway::config::{Args, FileConfig, parse_static_services};
use estate_gateway::gateway::Gateway;
use estate_gateway::handlers;
use estate_gateway::rate_limit::RateLimiter;
use estate_gateway::registry::{ServiceRegistry, health_checker};
use estate_gateway::security::ChannelEventSink;
use estate_gateway::state::AppState;
use estate_gateway::transport::ReqwestTransport;
use estate_gateway::worker::{SWEEP_INTERVAL, security_event_worker, sweep_worker};

const EVENT_QUEUE_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "estate_gateway=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // parse cli arguments
    let args = Args::parse();
    let file_config = match &args.config {
        Some(path) => FileConfig::load(path).with_context(|| format!("loading {path}"))?,
        None => FileConfig::default(),
    };

    let routes = file_config.route_table()?;
    let limiter = Arc::new(RateLimiter::new(file_config.rate_limit_categories())?);

    let http = reqwest::Client::builder()
        .build()
        .context("building HTTP client")?;
    let transport = Arc::new(ReqwestTransport::new(http));

    let registry = Arc::new(ServiceRegistry::new(transport.clone(), args.registry_config()));
    for instance in parse_static_services(&args.services)? {
        let registered = registry.register(instance)?;
        info!(service = %registered.name, url = %registered.base_url(), "Registered static instance");
    }

    let (events, event_rx) = ChannelEventSink::new(EVENT_QUEUE_CAPACITY);
    let events = Arc::new(events);
    let abuse = Arc::new(AbuseGuard::new(args.abuse_config()?, events.clone()));

    if file_config.tokens.is_empty() {
        warn!("No tokens configured, authenticated routes will reject every request");
    }
    let authenticator = Arc::new(StaticTokenAuthenticator::new(file_config.tokens.clone()));

    let gateway = Gateway::builder(routes, registry.clone(), transport, events)
        .rate_limiter(limiter.clone())
        .abuse_guard(abuse.clone())
        .authenticator(authenticator)
        .client_config(args.client_config())
        .max_body_bytes(args.max_body_bytes)
        .build()?;

    // spawn the background workers
    tokio::spawn(health_checker(registry.clone()));
    tokio::spawn(sweep_worker(limiter.clone(), abuse.clone(), SWEEP_INTERVAL));
    tokio::spawn(security_event_worker(event_rx));

    if args.admin_token.is_none() {
        warn!("No admin token set, /_gateway management routes are disabled");
    }

    let state = Arc::new(AppState {
        gateway,
        registry,
        limiter,
        abuse,
        admin_token: args.admin_token.clone(),
    });
    let app = handlers::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    info!(%addr, "Gateway listening");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}
