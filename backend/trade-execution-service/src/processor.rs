//! Trade execution as a business processor
//!
//! The execution row is written through the dedup transaction, so the trade
//! and its dedup record commit or roll back together.

use async_trait::async_trait;
use idempotent_consumer::{BusinessProcessor, Message, PgDedupTransaction, ProcessingError};
use tracing::info;

use crate::models::{TradeExecution, TradeOrder};

/// Parse and validate an order; malformed orders fail permanently
pub fn parse_order(message: &Message) -> Result<TradeOrder, ProcessingError> {
    let order: TradeOrder = serde_json::from_slice(&message.payload)
        .map_err(|e| ProcessingError::permanent(format!("malformed order payload: {e}")))?;
    order.validate(&message.key)?;
    Ok(order)
}

fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        // Constraint and data errors repeat on every retry
        sqlx::Error::Database(db_err) => !matches!(
            db_err.code().as_deref(),
            Some(code) if code.starts_with("22") || code.starts_with("23")
        ),
        _ => true,
    }
}

#[derive(Debug, Default, Clone)]
pub struct TradeProcessor;

impl TradeProcessor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BusinessProcessor<PgDedupTransaction> for TradeProcessor {
    type Output = TradeExecution;

    async fn execute(
        &self,
        message: &Message,
        tx: &mut PgDedupTransaction,
    ) -> Result<TradeExecution, ProcessingError> {
        let order = parse_order(message)?;
        let execution = TradeExecution::fill(&order);

        sqlx::query(
            r#"
            INSERT INTO trade_executions
                (execution_id, order_id, account_id, symbol, side, quantity, price, notional, executed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(execution.execution_id)
        .bind(&execution.order_id)
        .bind(&execution.account_id)
        .bind(&execution.symbol)
        .bind(execution.side.as_str())
        .bind(execution.quantity)
        .bind(execution.price)
        .bind(execution.notional)
        .bind(execution.executed_at)
        .execute(tx.connection())
        .await
        .map_err(|e| {
            if is_transient(&e) {
                ProcessingError::transient(format!("failed to record execution: {e}"))
            } else {
                ProcessingError::permanent(format!("execution rejected by ledger: {e}"))
            }
        })?;

        info!(
            order_id = %execution.order_id,
            execution_id = %execution.execution_id,
            symbol = %execution.symbol,
            side = execution.side.as_str(),
            notional = %execution.notional,
            "Trade executed"
        );

        Ok(execution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(key: &str, payload: &str) -> Message {
        Message::new(key, "trade.orders", 0, 0, payload.as_bytes().to_vec())
    }

    #[test]
    fn test_parse_order_accepts_valid_payload() {
        let order = parse_order(&message(
            "ORD-42",
            r#"{"order_id":"ORD-42","account_id":"ACC-1","symbol":"ETH-USD","side":"sell","quantity":"2","price":"3100"}"#,
        ))
        .unwrap();
        assert_eq!(order.symbol, "ETH-USD");
    }

    #[test]
    fn test_parse_order_malformed_is_permanent() {
        let err = parse_order(&message("ORD-42", "not json")).unwrap_err();
        assert!(matches!(err, ProcessingError::Permanent(_)));
    }

    #[test]
    fn test_pool_errors_are_transient() {
        assert!(is_transient(&sqlx::Error::PoolTimedOut));
    }
}
