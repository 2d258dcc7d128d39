use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "market_status", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum MarketStatus {
    Open,
    Closed,
    Resolved,
}

impl fmt::Display for MarketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketStatus::Open => write!(f, "OPEN"),
            MarketStatus::Closed => write!(f, "CLOSED"),
            MarketStatus::Resolved => write!(f, "RESOLVED"),
        }
    }
}

/// Binary market outcome side. Every order and position is denominated in
/// one of the two outcome share classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "outcome_side", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Yes,
    No,
}

impl Outcome {
    pub fn opposite(&self) -> Outcome {
        match self {
            Outcome::Yes => Outcome::No,
            Outcome::No => Outcome::Yes,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Yes => write!(f, "YES"),
            Outcome::No => write!(f, "NO"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Market {
    pub id: Uuid,
    pub slug: String,
    pub question: String,
    pub category: String,
    pub status: MarketStatus,
    /// Set exactly when status is RESOLVED.
    pub outcome: Option<Outcome>,
    pub close_time: Option<DateTime<Utc>>,
    pub resolve_time: Option<DateTime<Utc>>,
    pub resolution_source: Option<String>,
    pub yes_price: Decimal,
    pub no_price: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Market {
    pub fn is_tradable(&self) -> bool {
        self.status == MarketStatus::Open
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateMarketRequest {
    pub slug: String,
    pub question: String,
    pub category: String,
    pub close_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct ResolveMarketRequest {
    pub outcome: Outcome,
    pub resolution_source: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketResponse {
    pub market_id: Uuid,
    pub slug: String,
    pub question: String,
    pub category: String,
    pub status: MarketStatus,
    pub outcome: Option<Outcome>,
    pub yes_price: Decimal,
    pub no_price: Decimal,
    #[serde(serialize_with = "super::datetime_as_millis::serialize")]
    pub created_at: DateTime<Utc>,
}

impl From<Market> for MarketResponse {
    fn from(market: Market) -> Self {
        Self {
            market_id: market.id,
            slug: market.slug,
            question: market.question,
            category: market.category,
            status: market.status,
            outcome: market.outcome,
            yes_price: market.yes_price,
            no_price: market.no_price,
            created_at: market.created_at,
        }
    }
}
