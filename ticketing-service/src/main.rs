use anyhow::Result;
use clap::Parser;
use rdkafka::config::ClientConfig;
use rdkafka::producer::FutureProducer;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ticketing_service::api;
use ticketing_service::clock::SystemClock;
use ticketing_service::config::Config;
use ticketing_service::outbox::{KafkaPublisher, OutboxProcessor};
use ticketing_service::store::memory::MemoryStore;
use ticketing_service::store::postgres::PgStore;
use ticketing_service::store::TicketingStore;
use ticketing_service::Engine;

async fn connect_store(config: &Config) -> Result<Arc<dyn TicketingStore>> {
    let Some(database_url) = &config.database_url else {
        warn!("DATABASE_URL is not set, using the in-memory store; nothing will be persisted");
        return Ok(Arc::new(MemoryStore::new()));
    };

    Ok(Arc::new(PgStore::connect(database_url, config.database_pool_size).await?))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tower_http=info")),
        )
        .init();
    let config = Config::parse();

    let engine_config = config.engine()?;
    let registry = config.gateway_registry()?;
    let store = connect_store(&config).await?;

    let engine = Arc::new(Engine::new(
        store.clone(),
        registry,
        Arc::new(SystemClock),
        engine_config,
    ));

    match &config.kafka_brokers {
        Some(brokers) => {
            let producer: FutureProducer = ClientConfig::new()
                .set("bootstrap.servers", brokers)
                .set("message.timeout.ms", "5000")
                .create()?;
            let publisher = Arc::new(KafkaPublisher::new(producer, config.delivery_topic.clone()));
            let outbox_processor =
                OutboxProcessor::new(store.clone(), publisher, Duration::from_secs(5));

            tokio::spawn(async move {
                outbox_processor.run().await;
            });
        }
        None => warn!("KAFKA_BROKERS is not set, ticket deliveries stay queued in the outbox"),
    }

    let sweeper = engine.sweeper.clone();
    tokio::spawn(async move {
        sweeper.run().await;
    });

    let app_state = api::AppState {
        engine,
        staff_tokens: Arc::new(
            config
                .staff_tokens
                .iter()
                .map(|token| token.trim().to_string())
                .filter(|token| !token.is_empty())
                .collect(),
        ),
    };
    if app_state.staff_tokens.is_empty() {
        warn!("STAFF_TOKENS is empty, operator and scanner endpoints will reject every request");
    }

    let app = api::create_router(app_state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;

    info!("Ticketing service started on port {}", config.port);

    axum::serve(listener, app).await?;

    Ok(())
}
