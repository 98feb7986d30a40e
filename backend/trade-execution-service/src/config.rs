use idempotent_consumer::ConsumerConfig;
use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub kafka_brokers: String,
    pub kafka_group_id: String,
    pub trade_orders_topic: String,
    pub dlq_topic: String,
    pub consumer: ConsumerConfig,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL not set"))?;

        let database_max_connections = env::var("DATABASE_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|e| anyhow::anyhow!("DATABASE_MAX_CONNECTIONS must be a valid u32: {e}"))?;

        Ok(Config {
            database_url,
            database_max_connections,
            kafka_brokers: env::var("KAFKA_BROKERS")
                .unwrap_or_else(|_| "localhost:9092".to_string()),
            kafka_group_id: env::var("KAFKA_GROUP_ID")
                .unwrap_or_else(|_| "trade-execution-service".to_string()),
            trade_orders_topic: env::var("KAFKA_TRADE_ORDERS_TOPIC")
                .unwrap_or_else(|_| "trade.orders".to_string()),
            dlq_topic: env::var("KAFKA_DLQ_TOPIC")
                .unwrap_or_else(|_| "trade.orders.dlq".to_string()),
            consumer: ConsumerConfig::from_env()?,
        })
    }
}
