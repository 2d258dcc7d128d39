//! Pre-trade validation.
//!
//! The full check ladder runs over rows the engine has already loaded;
//! the first failure rejects the submission and nothing is touched. The
//! ladder's order is part of the contract: a closed market is reported
//! before a bad price, a bad price before missing funds.

use rust_decimal::Decimal;

use super::ledger::{buy_escrow, Funds};
use super::types::SubmitOrder;
use crate::config::EngineLimits;
use crate::decimal;
use crate::error::EngineError;
use crate::models::{Market, OrderSide, OrderType};

/// Everything the ladder needs, pre-loaded by the engine inside its
/// transaction so the checks themselves stay pure.
#[derive(Debug, Clone)]
pub struct SubmitContext {
    pub market: Market,
    pub funds: Funds,
    /// Owned shares of (user, market, outcome); zero when no position row.
    pub position_quantity: Decimal,
    /// Unfilled quantity across the user's resting BUYs on this
    /// (market, outcome), for the share-cap projection.
    pub resting_buy_remaining: Decimal,
    /// Open/partial orders currently resting in this market.
    pub market_open_orders: u32,
    /// Open/partial orders the user has across all markets.
    pub user_open_orders: u32,
}

/// Run the pre-trade ladder. Returns the BUY escrow to reserve (zero for SELL).
pub fn validate(
    cmd: &SubmitOrder,
    ctx: &SubmitContext,
    limits: &EngineLimits,
) -> Result<Decimal, EngineError> {
    // 1. Market lifecycle
    if !ctx.market.is_tradable() {
        return Err(EngineError::MarketNotTradable);
    }

    // 2. Shape: LIMIT carries a price; a price on a MARKET order is
    // ignored downstream.
    if cmd.order_type == OrderType::Limit && cmd.price.is_none() {
        return Err(EngineError::InvalidInput(
            "limit order requires a price".to_string(),
        ));
    }

    // 3. Quantity domain
    if cmd.quantity <= Decimal::ZERO {
        return Err(EngineError::InvalidInput(
            "quantity must be positive".to_string(),
        ));
    }
    if !decimal::fits_scale(cmd.quantity) || !decimal::is_on_tick(cmd.quantity, limits.quantity_tick)
    {
        return Err(EngineError::InvalidInput(format!(
            "quantity must be a multiple of {}",
            limits.quantity_tick
        )));
    }
    if cmd.quantity > limits.max_per_order_quantity {
        return Err(EngineError::LimitExceeded(format!(
            "quantity above per-order maximum {}",
            limits.max_per_order_quantity
        )));
    }

    // 4. Price domain (LIMIT only; MARKET ignores any supplied price)
    if let Some(price) = cmd.price.filter(|_| cmd.order_type == OrderType::Limit) {
        if price <= Decimal::ZERO || price >= Decimal::ONE {
            return Err(EngineError::InvalidInput(
                "price must be strictly between 0 and 1".to_string(),
            ));
        }
        if !decimal::fits_scale(price) || !decimal::is_on_tick(price, limits.price_tick) {
            return Err(EngineError::InvalidInput(format!(
                "price must be a multiple of {}",
                limits.price_tick
            )));
        }
    }

    // 5/6. Side-specific reservation
    let escrow = match cmd.side {
        OrderSide::Buy => {
            let required = buy_escrow(cmd.order_type, cmd.price, cmd.quantity);
            if ctx.funds.available < required {
                return Err(EngineError::InsufficientFunds {
                    required,
                    available: ctx.funds.available,
                });
            }
            required
        }
        OrderSide::Sell => {
            if ctx.position_quantity < cmd.quantity {
                return Err(EngineError::InsufficientShares {
                    requested: cmd.quantity,
                    owned: ctx.position_quantity,
                });
            }
            Decimal::ZERO
        }
    };

    // 7. Caps
    if ctx.market_open_orders >= limits.max_open_orders_per_market {
        return Err(EngineError::LimitExceeded(
            "market open-order limit reached".to_string(),
        ));
    }
    if ctx.user_open_orders >= limits.max_open_orders_per_user {
        return Err(EngineError::LimitExceeded(
            "user open-order limit reached".to_string(),
        ));
    }
    if let Some(cap) = limits.max_shares_per_user_market {
        if cmd.side == OrderSide::Buy {
            let projected = ctx.position_quantity + ctx.resting_buy_remaining + cmd.quantity;
            if projected > cap {
                return Err(EngineError::LimitExceeded(format!(
                    "position cap {cap} would be exceeded"
                )));
            }
        }
    }

    Ok(escrow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MarketStatus, Outcome};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn open_market() -> Market {
        Market {
            id: Uuid::new_v4(),
            slug: "btc-100k-2026".to_string(),
            question: "Will BTC close above 100k in 2026?".to_string(),
            category: "crypto".to_string(),
            status: MarketStatus::Open,
            outcome: None,
            close_time: None,
            resolve_time: None,
            resolution_source: None,
            yes_price: dec!(0.5),
            no_price: dec!(0.5),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    fn ctx(market: Market) -> SubmitContext {
        SubmitContext {
            market,
            funds: Funds {
                available: dec!(10000),
                locked: dec!(0),
            },
            position_quantity: dec!(0),
            resting_buy_remaining: dec!(0),
            market_open_orders: 0,
            user_open_orders: 0,
        }
    }

    fn buy_limit(price: Decimal, quantity: Decimal) -> SubmitOrder {
        SubmitOrder {
            user_id: Uuid::new_v4(),
            market_id: Uuid::new_v4(),
            outcome: Outcome::Yes,
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            price: Some(price),
            quantity,
            idempotency_key: None,
        }
    }

    #[test]
    fn test_accepts_valid_buy_and_returns_escrow() {
        let escrow = validate(
            &buy_limit(dec!(0.40), dec!(80)),
            &ctx(open_market()),
            &EngineLimits::default(),
        )
        .unwrap();
        assert_eq!(escrow, dec!(32));
    }

    #[test]
    fn test_rejects_non_open_market() {
        let mut market = open_market();
        market.status = MarketStatus::Resolved;
        market.outcome = Some(Outcome::Yes);
        let err = validate(
            &buy_limit(dec!(0.40), dec!(80)),
            &ctx(market),
            &EngineLimits::default(),
        )
        .unwrap_err();
        assert_eq!(err.code(), "MARKET_NOT_TRADABLE");
    }

    #[test]
    fn test_rejects_price_out_of_domain() {
        let limits = EngineLimits::default();
        let context = ctx(open_market());
        for bad in [dec!(0), dec!(1), dec!(1.2), dec!(-0.4)] {
            let err = validate(&buy_limit(bad, dec!(10)), &context, &limits).unwrap_err();
            assert_eq!(err.code(), "INVALID_INPUT");
        }
        // Off the default 0.01 tick.
        let err = validate(&buy_limit(dec!(0.405), dec!(10)), &context, &limits).unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[test]
    fn test_rejects_limit_without_price() {
        let mut cmd = buy_limit(dec!(0.40), dec!(10));
        cmd.price = None;
        let err = validate(&cmd, &ctx(open_market()), &EngineLimits::default()).unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[test]
    fn test_rejects_insufficient_funds() {
        // available=10000 cannot escrow 0.50 x 100000 = 50000.
        let err = validate(
            &buy_limit(dec!(0.50), dec!(100000)),
            &ctx(open_market()),
            &EngineLimits::default(),
        )
        .unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_FUNDS");
    }

    #[test]
    fn test_rejects_sell_beyond_position() {
        let mut cmd = buy_limit(dec!(0.35), dec!(60));
        cmd.side = OrderSide::Sell;
        let mut context = ctx(open_market());
        context.position_quantity = dec!(0);
        let err = validate(&cmd, &context, &EngineLimits::default()).unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_SHARES");

        context.position_quantity = dec!(60);
        assert!(validate(&cmd, &context, &EngineLimits::default()).is_ok());
    }

    #[test]
    fn test_market_buy_escrows_worst_case() {
        let mut cmd = buy_limit(dec!(0.40), dec!(80));
        cmd.order_type = OrderType::Market;
        cmd.price = None;
        let escrow = validate(&cmd, &ctx(open_market()), &EngineLimits::default()).unwrap();
        assert_eq!(escrow, dec!(80));
    }

    #[test]
    fn test_open_order_caps() {
        let mut limits = EngineLimits::default();
        limits.max_open_orders_per_user = 1;
        let mut context = ctx(open_market());
        context.user_open_orders = 1;
        let err = validate(&buy_limit(dec!(0.40), dec!(10)), &context, &limits).unwrap_err();
        assert_eq!(err.code(), "LIMIT_EXCEEDED");
    }

    #[test]
    fn test_share_cap_projects_resting_buys() {
        let mut limits = EngineLimits::default();
        limits.max_shares_per_user_market = Some(dec!(100));
        let mut context = ctx(open_market());
        context.position_quantity = dec!(50);
        context.resting_buy_remaining = dec!(30);

        let err = validate(&buy_limit(dec!(0.40), dec!(30)), &context, &limits).unwrap_err();
        assert_eq!(err.code(), "LIMIT_EXCEEDED");
        assert!(validate(&buy_limit(dec!(0.40), dec!(20)), &context, &limits).is_ok());
    }
}
