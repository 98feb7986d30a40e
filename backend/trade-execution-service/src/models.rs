use chrono::{DateTime, Utc};
use idempotent_consumer::ProcessingError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const MAX_SYMBOL_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

/// Order placed on `trade.orders`; `order_id` doubles as the dedup key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeOrder {
    pub order_id: String,
    pub account_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: Decimal,
}

impl TradeOrder {
    /// Reject orders that can never execute, whatever the retry
    pub fn validate(&self, message_key: &str) -> Result<(), ProcessingError> {
        if self.order_id != message_key {
            return Err(ProcessingError::permanent(format!(
                "order_id {} does not match message key {}",
                self.order_id, message_key
            )));
        }
        if self.account_id.is_empty() {
            return Err(ProcessingError::permanent("account_id is empty"));
        }
        if self.symbol.is_empty() || self.symbol.len() > MAX_SYMBOL_LEN {
            return Err(ProcessingError::permanent(format!(
                "invalid symbol {:?}",
                self.symbol
            )));
        }
        if self.quantity <= Decimal::ZERO {
            return Err(ProcessingError::permanent(format!(
                "quantity must be positive, got {}",
                self.quantity
            )));
        }
        if self.price <= Decimal::ZERO {
            return Err(ProcessingError::permanent(format!(
                "price must be positive, got {}",
                self.price
            )));
        }
        Ok(())
    }

    pub fn notional(&self) -> Decimal {
        self.quantity * self.price
    }
}

/// Row written to `trade_executions`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeExecution {
    pub execution_id: Uuid,
    pub order_id: String,
    pub account_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: Decimal,
    pub notional: Decimal,
    pub executed_at: DateTime<Utc>,
}

impl TradeExecution {
    pub fn fill(order: &TradeOrder) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            order_id: order.order_id.clone(),
            account_id: order.account_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: order.quantity,
            price: order.price,
            notional: order.notional(),
            executed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn order() -> TradeOrder {
        TradeOrder {
            order_id: "ORD-42".to_string(),
            account_id: "ACC-7".to_string(),
            symbol: "BTC-USD".to_string(),
            side: OrderSide::Buy,
            quantity: Decimal::from_str("0.5").unwrap(),
            price: Decimal::from_str("64000.10").unwrap(),
        }
    }

    #[test]
    fn test_order_parses_from_json() {
        let parsed: TradeOrder = serde_json::from_str(
            r#"{"order_id":"ORD-42","account_id":"ACC-7","symbol":"BTC-USD",
                "side":"buy","quantity":"0.5","price":"64000.10"}"#,
        )
        .unwrap();
        assert_eq!(parsed, order());
    }

    #[test]
    fn test_validate_accepts_well_formed_order() {
        order().validate("ORD-42").unwrap();
    }

    #[test]
    fn test_validate_rejects_permanently() {
        let mismatched = order().validate("ORD-43").unwrap_err();
        assert!(matches!(mismatched, ProcessingError::Permanent(_)));

        let zero_qty = TradeOrder {
            quantity: Decimal::ZERO,
            ..order()
        };
        assert!(matches!(
            zero_qty.validate("ORD-42"),
            Err(ProcessingError::Permanent(_))
        ));

        let negative_price = TradeOrder {
            price: Decimal::from_str("-1").unwrap(),
            ..order()
        };
        assert!(negative_price.validate("ORD-42").is_err());
    }

    #[test]
    fn test_fill_computes_notional() {
        let execution = TradeExecution::fill(&order());
        assert_eq!(execution.notional, Decimal::from_str("32000.050").unwrap());
        assert_eq!(execution.order_id, "ORD-42");
    }
}
