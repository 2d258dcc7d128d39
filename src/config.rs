//! Application configuration.
//!
//! All knobs load from environment variables (a `.env` file is honored in
//! development). Engine limits default to the documented values so a bare
//! environment boots a working exchange.

use rust_decimal::Decimal;
use serde::Deserialize;

fn default_port() -> u16 {
    8080
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_price_tick() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_quantity_tick() -> Decimal {
    Decimal::ONE
}

fn default_initial_balance() -> Decimal {
    Decimal::from(100)
}

fn default_max_open_orders_per_market() -> u32 {
    1_000
}

fn default_max_open_orders_per_user() -> u32 {
    100
}

fn default_max_per_order_quantity() -> Decimal {
    Decimal::from(1_000_000)
}

fn default_idempotency_retention_hours() -> i64 {
    24
}

fn default_store_retry_limit() -> u32 {
    3
}

fn default_submit_deadline_ms() -> u64 {
    5_000
}

fn default_jwt_expiry_seconds() -> u64 {
    86_400
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_environment")]
    pub environment: String,

    pub jwt_secret: String,
    #[serde(default = "default_jwt_expiry_seconds")]
    pub jwt_expiry_seconds: u64,
    #[serde(default)]
    pub auth_disabled: bool,

    // Engine limits
    #[serde(default = "default_price_tick")]
    pub price_tick: Decimal,
    #[serde(default = "default_quantity_tick")]
    pub quantity_tick: Decimal,
    #[serde(default = "default_initial_balance")]
    pub initial_balance: Decimal,
    #[serde(default = "default_max_open_orders_per_market")]
    pub max_open_orders_per_market: u32,
    #[serde(default = "default_max_open_orders_per_user")]
    pub max_open_orders_per_user: u32,
    /// Optional per-(user, market, outcome) share cap. Disabled when unset.
    #[serde(default)]
    pub max_shares_per_user_market: Option<Decimal>,
    #[serde(default = "default_max_per_order_quantity")]
    pub max_per_order_quantity: Decimal,
    #[serde(default = "default_idempotency_retention_hours")]
    pub idempotency_retention_hours: i64,
    #[serde(default = "default_store_retry_limit")]
    pub store_retry_limit: u32,
    #[serde(default = "default_submit_deadline_ms")]
    pub submit_deadline_ms: u64,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;
        Ok(cfg.try_deserialize()?)
    }

    pub fn is_auth_disabled(&self) -> bool {
        self.auth_disabled
    }
}

/// The subset of configuration the matching engine consumes. Kept separate
/// so the engine can be constructed in tests without a full AppConfig.
#[derive(Debug, Clone)]
pub struct EngineLimits {
    pub price_tick: Decimal,
    pub quantity_tick: Decimal,
    pub initial_balance: Decimal,
    pub max_open_orders_per_market: u32,
    pub max_open_orders_per_user: u32,
    pub max_shares_per_user_market: Option<Decimal>,
    pub max_per_order_quantity: Decimal,
    pub idempotency_retention_hours: i64,
    pub store_retry_limit: u32,
    pub submit_deadline_ms: u64,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            price_tick: default_price_tick(),
            quantity_tick: default_quantity_tick(),
            initial_balance: default_initial_balance(),
            max_open_orders_per_market: default_max_open_orders_per_market(),
            max_open_orders_per_user: default_max_open_orders_per_user(),
            max_shares_per_user_market: None,
            max_per_order_quantity: default_max_per_order_quantity(),
            idempotency_retention_hours: default_idempotency_retention_hours(),
            store_retry_limit: default_store_retry_limit(),
            submit_deadline_ms: default_submit_deadline_ms(),
        }
    }
}

impl From<&AppConfig> for EngineLimits {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            price_tick: cfg.price_tick,
            quantity_tick: cfg.quantity_tick,
            initial_balance: cfg.initial_balance,
            max_open_orders_per_market: cfg.max_open_orders_per_market,
            max_open_orders_per_user: cfg.max_open_orders_per_user,
            max_shares_per_user_market: cfg.max_shares_per_user_market,
            max_per_order_quantity: cfg.max_per_order_quantity,
            idempotency_retention_hours: cfg.idempotency_retention_hours,
            store_retry_limit: cfg.store_retry_limit,
            submit_deadline_ms: cfg.submit_deadline_ms,
        }
    }
}
