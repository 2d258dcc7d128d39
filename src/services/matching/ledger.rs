//! Per-fill balance and position arithmetic.
//!
//! Pure functions over decimals: the engine calls these inside its store
//! transaction, and the invariant suite exercises them without a database.
//! The identity `total = available + locked` is preserved by construction:
//! every movement here either transfers between the two buckets or adds
//! seller proceeds to `available`.

use rust_decimal::Decimal;

use crate::decimal::{debit, Underflow};
use crate::models::{OrderType, Position};

/// Cash buckets for one user, detached from the persistence row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Funds {
    pub available: Decimal,
    pub locked: Decimal,
}

impl Funds {
    pub fn total(&self) -> Decimal {
        self.available + self.locked
    }
}

/// Share holding for one (user, market, outcome).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Holding {
    pub quantity: Decimal,
    pub avg_price: Decimal,
}

impl Holding {
    pub fn empty() -> Self {
        Self {
            quantity: Decimal::ZERO,
            avg_price: Decimal::ZERO,
        }
    }
}

impl From<&Position> for Holding {
    fn from(position: &Position) -> Self {
        Self {
            quantity: position.quantity,
            avg_price: position.avg_price,
        }
    }
}

/// Worst-case price of a binary share; MARKET BUY escrow is capped here.
pub fn market_buy_cap() -> Decimal {
    Decimal::ONE
}

/// The escrow a BUY must reserve up front: `price x quantity` for LIMIT,
/// the worst-case cap for MARKET. SELLs reserve shares, not cash.
pub fn buy_escrow(order_type: OrderType, price: Option<Decimal>, quantity: Decimal) -> Decimal {
    let per_share = match order_type {
        OrderType::Limit => price.unwrap_or_else(market_buy_cap),
        OrderType::Market => market_buy_cap(),
    };
    per_share * quantity
}

/// Move `amount` from `available` into `locked`.
pub fn reserve(funds: Funds, amount: Decimal) -> Result<Funds, Underflow> {
    Ok(Funds {
        available: debit(funds.available, amount)?,
        locked: funds.locked + amount,
    })
}

/// Move `amount` from `locked` back into `available`.
pub fn release(funds: Funds, amount: Decimal) -> Result<Funds, Underflow> {
    Ok(Funds {
        available: funds.available + amount,
        locked: debit(funds.locked, amount)?,
    })
}

/// Consume buyer escrow for one fill. The reservation was taken at
/// `reserved_price` per share; the execution happened at the maker's
/// `exec_price <= reserved_price`. The executed value leaves `locked` in
/// exchange for shares; the price-improvement remainder returns to
/// `available` so the lock never exceeds the open orders backing it.
pub fn settle_buyer_fill(
    funds: Funds,
    reserved_price: Decimal,
    exec_price: Decimal,
    quantity: Decimal,
) -> Result<Funds, Underflow> {
    let reserved = reserved_price * quantity;
    let improvement = (reserved_price - exec_price) * quantity;
    Ok(Funds {
        available: funds.available + improvement,
        locked: debit(funds.locked, reserved)?,
    })
}

/// Credit seller proceeds for one fill; realized now, never escrowed.
pub fn settle_seller_fill(funds: Funds, exec_price: Decimal, quantity: Decimal) -> Funds {
    Funds {
        available: funds.available + exec_price * quantity,
        locked: funds.locked,
    }
}

/// Fold a buy fill into a holding: quantity grows, cost basis becomes the
/// running VWAP.
pub fn apply_buy(holding: Holding, quantity: Decimal, price: Decimal) -> Holding {
    let new_quantity = holding.quantity + quantity;
    let avg_price = if new_quantity.is_zero() {
        Decimal::ZERO
    } else {
        (holding.quantity * holding.avg_price + quantity * price) / new_quantity
    };
    Holding {
        quantity: new_quantity,
        avg_price,
    }
}

/// Fold a sell fill into a holding: quantity shrinks, cost basis untouched.
pub fn apply_sell(holding: Holding, quantity: Decimal) -> Result<Holding, Underflow> {
    Ok(Holding {
        quantity: debit(holding.quantity, quantity)?,
        avg_price: holding.avg_price,
    })
}

/// Escrow still backing the unfilled remainder of a resting BUY.
pub fn open_buy_reservation(price: Decimal, quantity: Decimal, filled: Decimal) -> Decimal {
    price * (quantity - filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderType;
    use rust_decimal_macros::dec;

    fn funds(available: Decimal, locked: Decimal) -> Funds {
        Funds { available, locked }
    }

    #[test]
    fn test_buy_escrow() {
        assert_eq!(
            buy_escrow(OrderType::Limit, Some(dec!(0.40)), dec!(80)),
            dec!(32)
        );
        assert_eq!(buy_escrow(OrderType::Market, None, dec!(80)), dec!(80));
    }

    #[test]
    fn test_reserve_and_release_preserve_total() {
        let start = funds(dec!(10000), dec!(0));
        let reserved = reserve(start, dec!(32)).unwrap();
        assert_eq!(reserved, funds(dec!(9968), dec!(32)));
        assert_eq!(reserved.total(), start.total());

        let released = release(reserved, dec!(32)).unwrap();
        assert_eq!(released, start);
    }

    #[test]
    fn test_reserve_rejects_overdraft() {
        let start = funds(dec!(10000), dec!(0));
        assert!(reserve(start, dec!(50000)).is_err());
    }

    #[test]
    fn test_buyer_fill_at_own_price() {
        // Resting maker BUY @0.40 filled 60: escrow consumed exactly.
        let start = funds(dec!(9968), dec!(32));
        let after = settle_buyer_fill(start, dec!(0.40), dec!(0.40), dec!(60)).unwrap();
        assert_eq!(after, funds(dec!(9968), dec!(8)));
        assert_eq!(after.total(), dec!(9976));
    }

    #[test]
    fn test_buyer_fill_with_price_improvement() {
        // Taker BUY limit 0.50 reserved 0.50/share, fills at 0.40: the
        // 0.10/share improvement returns to available.
        let start = funds(dec!(50), dec!(50));
        let after = settle_buyer_fill(start, dec!(0.50), dec!(0.40), dec!(100)).unwrap();
        assert_eq!(after.locked, dec!(0));
        assert_eq!(after.available, dec!(60));
        // Total dropped by exactly the executed value.
        assert_eq!(start.total() - after.total(), dec!(40));
    }

    #[test]
    fn test_seller_fill_credits_available() {
        let start = funds(dec!(10000), dec!(0));
        let after = settle_seller_fill(start, dec!(0.40), dec!(60));
        assert_eq!(after, funds(dec!(10024), dec!(0)));
    }

    #[test]
    fn test_vwap_on_buys_only() {
        let holding = apply_buy(Holding::empty(), dec!(60), dec!(0.40));
        assert_eq!(holding.quantity, dec!(60));
        assert_eq!(holding.avg_price, dec!(0.40));

        let holding = apply_buy(holding, dec!(60), dec!(0.50));
        assert_eq!(holding.quantity, dec!(120));
        assert_eq!(holding.avg_price, dec!(0.45));

        let holding = apply_sell(holding, dec!(100)).unwrap();
        assert_eq!(holding.quantity, dec!(20));
        assert_eq!(holding.avg_price, dec!(0.45));
    }

    #[test]
    fn test_sell_cannot_go_negative() {
        let holding = Holding {
            quantity: dec!(10),
            avg_price: dec!(0.30),
        };
        assert!(apply_sell(holding, dec!(11)).is_err());
    }

    #[test]
    fn test_open_buy_reservation_partial_fill() {
        assert_eq!(open_buy_reservation(dec!(0.40), dec!(80), dec!(20)), dec!(24));
        assert_eq!(open_buy_reservation(dec!(0.40), dec!(80), dec!(60)), dec!(8));
    }

    #[test]
    fn test_fill_conservation() {
        // Single fill q=60 p=0.40: buyer cash -24, seller cash +24,
        // buyer shares +60, seller shares -60.
        let buyer = funds(dec!(9968), dec!(32));
        let seller = funds(dec!(10000), dec!(0));
        let buyer_after = settle_buyer_fill(buyer, dec!(0.40), dec!(0.40), dec!(60)).unwrap();
        let seller_after = settle_seller_fill(seller, dec!(0.40), dec!(60));

        assert_eq!(buyer.total() - buyer_after.total(), dec!(24));
        assert_eq!(seller_after.total() - seller.total(), dec!(24));
    }
}
