use anyhow::Context;
use clap::Parser;
use relay::bridge::{run_bridge, Bridge};
use relay::config::Config;
use relay::db::PgStore;
use relay::gateway::CommandGateway;
use relay::live::LiveFeed;
use relay::metrics;
use relay::mqtt::{self, Publisher};
use relay::query::QueryService;
use relay::rest::{self, AppState};
use relay::shutdown;
use relay::store::{MemoryStore, Store};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();

    info!("Starting relay");
    info!("MQTT broker: {}:{}", config.mqtt_host, config.mqtt_port);
    info!("HTTP server: {}", config.http_addr);

    metrics::init_metrics();

    let store: Arc<dyn Store> = if config.memory_store {
        warn!("Using in-memory store; nothing will survive a restart");
        Arc::new(MemoryStore::new())
    } else {
        info!("Database: {}", config.redacted_database_url());
        let store = PgStore::connect(
            &config.database_url,
            config.db_max_connections,
            config.db_max_retries,
        )
        .await
        .context("failed to connect to database")?;
        Arc::new(store)
    };

    let api_token = config.api_token();
    if api_token.is_none() {
        warn!("API_TOKEN not set; dashboard API is unauthenticated");
    }

    let settings = config.mqtt_settings();
    let (publisher, eventloop) = mqtt::connect(&settings);
    let connected = publisher.connected_flag();
    let publisher: Arc<dyn Publisher> = Arc::new(publisher);

    let live = LiveFeed::new(config.live_capacity);
    let bridge = Arc::new(Bridge::new(
        store.clone(),
        publisher.clone(),
        live.clone(),
        config.default_device_id.clone(),
    ));

    info!("Inbound channel capacity: {}", config.inbound_capacity);
    let (tx, rx) = mpsc::channel(config.inbound_capacity);

    let mut mqtt_handle = tokio::spawn(async move {
        if let Err(e) = mqtt::run_mqtt(eventloop, connected, tx).await {
            error!("MQTT task failed: {}", e);
        }
    });

    let mut bridge_handle = tokio::spawn(run_bridge(rx, bridge));

    let state = AppState::new(
        QueryService::new(store.clone()),
        CommandGateway::new(publisher.clone()),
        live,
        api_token,
        settings,
    );
    let app = rest::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.http_addr))?;

    info!("HTTP server listening on {}", config.http_addr);

    let mut server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    tokio::select! {
        _ = &mut mqtt_handle => {
            error!("MQTT task terminated");
        }
        _ = &mut bridge_handle => {
            error!("Bridge worker terminated");
        }
        _ = &mut server_handle => {
            error!("HTTP server terminated");
        }
        _ = shutdown::signal() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
    // Live streams never end on their own, so the server is stopped outright.
    server_handle.abort();
    shutdown::teardown(
        publisher.as_ref(),
        mqtt_handle,
        bridge_handle,
        store,
        shutdown::SHUTDOWN_GRACE,
    )
    .await;
    Ok(())
}
