mod broker;
mod cache;
mod config;
mod dispatch;
mod errors;
mod events;
mod history;
mod influx;
mod metrics;
mod model;
mod mqtt;
mod rest;
mod stats;
mod store;
mod sync;

use axum::{routing::get, Router};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = config::Config::from_env();

    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("Starting silo telemetry ingestor");
    info!("MQTT broker: {}:{}", config.mqtt_broker, config.mqtt_port);
    info!("HTTP server: {}", config.http_addr);
    info!(
        "Database: {}",
        config.database_url.split('@').last().unwrap_or("***")
    );
    info!("Time-series store: {}", config.influx_url);

    // Initialize metrics
    metrics::init_metrics();

    // Connect to database and run migrations
    let store = match store::PgStore::connect(&config.database_url, config.query_timeout).await {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    let hub = broker::TopicBroker::new();
    let cache = cache::LatestCache::new(config.cache_capacity);
    let engine = sync::SyncEngine::new(store.clone(), config.kind_conflict);
    let dispatcher = Arc::new(dispatch::IngestionDispatcher::new(
        engine,
        hub.clone(),
        cache.clone(),
        config
            .device_topic_spec
            .as_deref()
            .map(dispatch::TopicMap::from_spec)
            .unwrap_or_else(dispatch::TopicMap::standard),
    ));

    let influx = match influx::InfluxClient::new(
        &config.influx_url,
        &config.influx_database,
        &config.influx_measurement,
        config.query_timeout,
    ) {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to build time-series client: {}", e);
            std::process::exit(1);
        }
    };

    let mqtt_status = mqtt::ConnectionStatus::new();

    // Generate client ID
    let client_id = format!("ingestor-{}", uuid::Uuid::new_v4());
    let mqtt_handle = {
        let status = mqtt_status.clone();
        let broker = config.mqtt_broker.clone();
        let port = config.mqtt_port;
        let topics = config.mqtt_topics.clone();
        tokio::spawn(async move {
            if let Err(e) =
                mqtt::run_mqtt(broker, port, client_id, topics, dispatcher, status).await
            {
                error!("MQTT task failed: {}", e);
            }
        })
    };

    // Build HTTP app with REST API and metrics endpoint
    let state = rest::AppState {
        store: store.clone(),
        broker: hub,
        cache,
        reader: Arc::new(history::TimeSeriesReader::new(influx)),
        stats: Arc::new(stats::StatsAggregator::new(store)),
        mqtt_status,
    };
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(state));

    // Start HTTP server
    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    tokio::select! {
        _ = mqtt_handle => {
            error!("MQTT task terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
