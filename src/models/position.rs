use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::market::Outcome;

/// Share holding keyed by (user, market, outcome). `quantity` never goes
/// negative; `avg_price` is the VWAP cost basis and moves only on buys.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Position {
    pub user_id: Uuid,
    pub market_id: Uuid,
    pub outcome: Outcome,
    pub quantity: Decimal,
    pub avg_price: Decimal,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionResponse {
    pub market_id: Uuid,
    pub outcome: Outcome,
    pub quantity: Decimal,
    pub avg_price: Decimal,
}

impl From<Position> for PositionResponse {
    fn from(position: Position) -> Self {
        Self {
            market_id: position.market_id,
            outcome: position.outcome,
            quantity: position.quantity,
            avg_price: position.avg_price,
        }
    }
}
