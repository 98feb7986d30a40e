//! Trade execution service
//!
//! Consumes orders from `trade.orders` and records each execution exactly
//! once, using the idempotent consumer library with the order id as the
//! dedup key.

pub mod config;
pub mod models;
pub mod processor;

pub use config::Config;
pub use models::{OrderSide, TradeExecution, TradeOrder};
pub use processor::TradeProcessor;

/// Apply the service's own migrations (`trade_executions`)
pub async fn migrate(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator.run(pool).await?;
    Ok(())
}
