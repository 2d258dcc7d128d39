//! Matching Engine Types
//!
//! Shared types and DTOs for the matching engine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

use crate::models::{Outcome, OrderResponse, OrderSide, OrderType, TradeResponse};

// ============================================================================
// Price Key
// ============================================================================

/// Book price key with 4 decimal precision for exact ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PriceKey(i64);

const PRICE_SCALE: i64 = 10_000;

impl PriceKey {
    /// Create a PriceKey from a Decimal price. Prices reaching the book are
    /// already validated to 4dp, so truncation here is lossless.
    pub fn from_decimal(price: Decimal) -> Self {
        let scaled = (price * Decimal::from(PRICE_SCALE)).trunc();
        let value = scaled
            .mantissa()
            .checked_div(10i128.pow(scaled.scale()))
            .unwrap_or(0);
        PriceKey(value as i64)
    }

    /// Convert back to Decimal.
    pub fn to_decimal(&self) -> Decimal {
        Decimal::from(self.0) / Decimal::from(PRICE_SCALE)
    }

    /// Get raw value
    pub fn raw(&self) -> i64 {
        self.0
    }
}

impl Ord for PriceKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for PriceKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ============================================================================
// Book Order
// ============================================================================

/// A resting order as held by the in-memory book. A non-owning view: the
/// authoritative copy of the order lives in the store.
#[derive(Debug, Clone)]
pub struct BookOrder {
    pub id: Uuid,
    pub user_id: Uuid,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub remaining: Decimal,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Match Plan
// ============================================================================

/// A single planned execution against a resting maker order.
#[derive(Debug, Clone)]
pub struct Fill {
    pub maker_order_id: Uuid,
    pub maker_user_id: Uuid,
    /// Execution price is always the maker's resting price.
    pub price: Decimal,
    pub quantity: Decimal,
    /// True when this fill exhausts the maker's remaining quantity.
    pub exhausts_maker: bool,
}

/// The outcome of a read-only scan of the opposite side of the book.
///
/// Nothing in the book is touched while planning; the plan is applied to
/// the book only after the store transaction that realizes it commits.
#[derive(Debug, Clone, Default)]
pub struct MatchPlan {
    pub fills: Vec<Fill>,
    /// Resting orders skipped because they belong to the taker.
    pub self_skips: Vec<Uuid>,
    pub taker_remaining: Decimal,
}

impl MatchPlan {
    pub fn filled_quantity(&self) -> Decimal {
        self.fills.iter().map(|f| f.quantity).sum()
    }
}

// ============================================================================
// Engine Commands & Results
// ============================================================================

/// Typed submission command handed to the engine by the API boundary.
/// Authentication has already resolved `user_id`; every field is explicit.
#[derive(Debug, Clone)]
pub struct SubmitOrder {
    pub user_id: Uuid,
    pub market_id: Uuid,
    pub outcome: Outcome,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub quantity: Decimal,
    pub idempotency_key: Option<String>,
}

/// Successful submission: the order's final state plus the trades it
/// produced, in execution order. Serializable so idempotent resubmission
/// can replay the stored outcome verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitAccepted {
    pub order: OrderResponse,
    pub trades: Vec<TradeResponse>,
}

/// Result of a cancellation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelAccepted {
    pub order: OrderResponse,
}

// ============================================================================
// Snapshots
// ============================================================================

/// One aggregated price level: remaining quantity and resting order count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelView {
    pub price: Decimal,
    pub quantity: Decimal,
    pub orders: u32,
}

/// Aggregated book snapshot for API responses and bus fan-out.
#[derive(Debug, Clone, Serialize)]
pub struct BookSnapshot {
    pub market_id: Uuid,
    pub outcome: Outcome,
    pub bids: Vec<LevelView>,
    pub asks: Vec<LevelView>,
    pub sequence: u64,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_price_key_conversion() {
        let price = dec!(0.4375);
        let key = PriceKey::from_decimal(price);
        assert_eq!(key.to_decimal(), price);
        assert_eq!(key.raw(), 4375);
    }

    #[test]
    fn test_price_key_ordering() {
        let p1 = PriceKey::from_decimal(dec!(0.40));
        let p2 = PriceKey::from_decimal(dec!(0.41));
        assert!(p1 < p2);
    }

    #[test]
    fn test_plan_filled_quantity() {
        let plan = MatchPlan {
            fills: vec![
                Fill {
                    maker_order_id: Uuid::new_v4(),
                    maker_user_id: Uuid::new_v4(),
                    price: dec!(0.40),
                    quantity: dec!(60),
                    exhausts_maker: true,
                },
                Fill {
                    maker_order_id: Uuid::new_v4(),
                    maker_user_id: Uuid::new_v4(),
                    price: dec!(0.41),
                    quantity: dec!(15),
                    exhausts_maker: false,
                },
            ],
            self_skips: vec![],
            taker_remaining: dec!(0),
        };
        assert_eq!(plan.filled_quantity(), dec!(75));
    }
}
