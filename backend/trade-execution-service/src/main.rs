//! Trade Execution Service - exactly-once order execution from Kafka
//!
//! Environment variables:
//! - DATABASE_URL: PostgreSQL URL holding `trade_executions` and `processed_messages`
//! - DATABASE_MAX_CONNECTIONS: Pool size (default: 10)
//! - KAFKA_BROKERS: Kafka broker addresses (default: "localhost:9092")
//! - KAFKA_GROUP_ID: Consumer group ID (default: "trade-execution-service")
//! - KAFKA_TRADE_ORDERS_TOPIC: Topic to consume (default: "trade.orders")
//! - KAFKA_DLQ_TOPIC: Quarantine topic (default: "trade.orders.dlq")
//! - IDEMPOTENT_CONSUMER_*: Retry, timeout and retention tuning

use idempotent_consumer::{
    ConsumptionLoop, FanoutOutcomeSink, IdempotencyCoordinator, KafkaDeadLetterQueue,
    KafkaMessageSource, KafkaSourceConfig, PgDedupStore, PrometheusOutcomeSink, RetentionSweeper,
    TracingOutcomeSink,
};
use rdkafka::config::ClientConfig;
use rdkafka::producer::FutureProducer;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use trade_execution_service::{Config, TradeProcessor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trade_execution_service=info,idempotent_consumer=info".into()),
        )
        .json()
        .init();

    info!("Starting Trade Execution Service");

    let config = Config::from_env()?;
    info!(
        kafka_brokers = %config.kafka_brokers,
        kafka_topic = %config.trade_orders_topic,
        dlq_topic = %config.dlq_topic,
        max_retries = config.consumer.max_retries,
        "Configuration loaded"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await?;

    let store = Arc::new(PgDedupStore::new(pool.clone()));
    store.migrate().await?;
    trade_execution_service::migrate(&pool).await?;
    info!("Database migrations applied");

    let coordinator = Arc::new(IdempotencyCoordinator::new(
        store.clone(),
        Arc::new(TradeProcessor::new()),
        config.consumer.processing_timeout(),
    ));

    let source = Arc::new(KafkaMessageSource::new(&KafkaSourceConfig::new(
        config.kafka_brokers.clone(),
        config.kafka_group_id.clone(),
        vec![config.trade_orders_topic.clone()],
    ))?);

    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", &config.kafka_brokers)
        .set("enable.idempotence", "true")
        .set("acks", "all")
        .set("message.timeout.ms", "30000")
        .create()?;
    let dead_letter = Arc::new(KafkaDeadLetterQueue::new(producer, config.dlq_topic.clone()));

    let metrics = PrometheusOutcomeSink::new("trade-execution-service")?;
    let sink = Arc::new(
        FanoutOutcomeSink::new()
            .with(Arc::new(TracingOutcomeSink))
            .with(Arc::new(metrics)),
    );

    // Setup shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl+c");
            return;
        }
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let sweeper = RetentionSweeper::new(
        store.clone(),
        config.consumer.dedup_retention(),
        config.consumer.sweep_interval(),
    );
    let sweeper_handle = tokio::spawn(sweeper.run(shutdown_rx.clone()));

    info!("Starting consumption loop");
    let consumption = ConsumptionLoop::new(
        coordinator,
        source,
        sink,
        dead_letter,
        config.consumer.loop_settings(),
    );
    if let Err(e) = consumption.run(shutdown_rx).await {
        error!(error = %e, "Consumption loop error");
    }

    let _ = sweeper_handle.await;
    pool.close().await;

    info!("Trade Execution Service stopped");
    Ok(())
}
