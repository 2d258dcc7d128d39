//! Order Matching Module
//!
//! The correctness-critical core: per-market books, pre-trade validation,
//! the transactional submission pipeline, and the fill ledger.
//!
//! # Architecture
//!
//! ```text
//! API Handler
//!   |
//! ExchangeEngine (one actor task per market)
//!   |- Validator  (pure pre-trade checks)
//!   |- Orderbook  (plan matches read-only, apply after commit)
//!   |- ledger     (escrow / VWAP arithmetic)
//!   |- Store      (single transaction per submission, bounded retries)
//!   `- EventSink  (publish strictly after commit)
//! ```
//!
//! The books are never authoritative across restarts; `BookRegistry`
//! rehydrates them from the store on startup.

mod engine;
mod orderbook;
mod registry;
mod types;
mod validator;

pub mod ledger;

pub use engine::ExchangeEngine;
pub use orderbook::Orderbook;
pub use registry::{BookRegistry, MarketBooks};
pub use types::*;
pub use validator::{validate, SubmitContext};

#[cfg(test)]
mod flow_tests {
    //! End-to-end walks of the matching and ledger layers, mirroring the
    //! exchange's seed scenarios without a store.

    use super::ledger::{self, Funds, Holding};
    use super::orderbook::Orderbook;
    use super::types::BookOrder;
    use crate::models::{Outcome, OrderSide, OrderType};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn resting(user: Uuid, side: OrderSide, price: Decimal, quantity: Decimal) -> BookOrder {
        BookOrder {
            id: Uuid::new_v4(),
            user_id: user,
            side,
            price,
            quantity,
            remaining: quantity,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn empty_book_bid_then_matching_sell() {
        let book = Orderbook::new(Uuid::new_v4(), Outcome::Yes);
        let user_a = Uuid::new_v4();
        let user_b = Uuid::new_v4();

        // A submits BUY YES @0.40 x 80: escrow 32 locks, the bid rests.
        let mut funds_a = Funds {
            available: dec!(10000),
            locked: dec!(0),
        };
        let escrow = ledger::buy_escrow(OrderType::Limit, Some(dec!(0.40)), dec!(80));
        funds_a = ledger::reserve(funds_a, escrow).unwrap();
        assert_eq!(funds_a.available, dec!(9968));
        assert_eq!(funds_a.locked, dec!(32));

        let bid = resting(user_a, OrderSide::Buy, dec!(0.40), dec!(80));
        let bid_id = bid.id;
        book.insert(bid);
        assert_eq!(book.snapshot(10).bids.len(), 1);

        // B sells 60 into the bid: one trade at the maker's 0.40.
        let plan = book.match_plan(user_b, OrderSide::Sell, Some(dec!(0.35)), dec!(60));
        assert_eq!(plan.fills.len(), 1);
        let fill = &plan.fills[0];
        assert_eq!(fill.price, dec!(0.40));
        assert_eq!(fill.quantity, dec!(60));
        assert_eq!(plan.taker_remaining, dec!(0));

        // Settle the fill: A is the buyer at its own resting price.
        funds_a = ledger::settle_buyer_fill(funds_a, dec!(0.40), fill.price, fill.quantity).unwrap();
        let mut funds_b = Funds {
            available: dec!(10000),
            locked: dec!(0),
        };
        funds_b = ledger::settle_seller_fill(funds_b, fill.price, fill.quantity);

        let position_a = ledger::apply_buy(Holding::empty(), fill.quantity, fill.price);
        let position_b = ledger::apply_sell(
            Holding {
                quantity: dec!(60),
                avg_price: dec!(0.30),
            },
            fill.quantity,
        )
        .unwrap();

        assert_eq!(funds_a.available, dec!(9968));
        assert_eq!(funds_a.locked, dec!(8));
        assert_eq!(funds_a.total(), dec!(9976));
        assert_eq!(funds_b.available, dec!(10024));
        assert_eq!(funds_b.locked, dec!(0));
        assert_eq!(position_a.quantity, dec!(60));
        assert_eq!(position_a.avg_price, dec!(0.40));
        assert_eq!(position_b.quantity, dec!(0));

        // Remaining lock backs exactly the unfilled 20 shares.
        assert_eq!(
            funds_a.locked,
            ledger::open_buy_reservation(dec!(0.40), dec!(80), dec!(60))
        );

        book.apply_plan(&plan);
        assert!(book.contains(&bid_id));
        assert_eq!(book.snapshot(10).bids[0].quantity, dec!(20));
    }

    #[test]
    fn mid_quote_produces_no_trade() {
        let book = Orderbook::new(Uuid::new_v4(), Outcome::Yes);
        book.insert(resting(Uuid::new_v4(), OrderSide::Buy, dec!(0.44), dec!(40)));
        book.insert(resting(Uuid::new_v4(), OrderSide::Sell, dec!(0.50), dec!(60)));

        let snapshot = book.snapshot(10);
        assert_eq!(snapshot.bids[0].price, dec!(0.44));
        assert_eq!(snapshot.bids[0].quantity, dec!(40));
        assert_eq!(snapshot.bids[0].orders, 1);
        assert_eq!(snapshot.asks[0].price, dec!(0.50));
        assert_eq!(snapshot.asks[0].quantity, dec!(60));

        // A buyer bidding below the ask crosses nothing.
        let plan = book.match_plan(Uuid::new_v4(), OrderSide::Buy, Some(dec!(0.44)), dec!(10));
        assert!(plan.fills.is_empty());
    }

    #[test]
    fn cancel_after_partial_fill_releases_exact_escrow() {
        // BUY @0.40 x 80 filled 20: cancel releases 24, keeps none.
        let mut funds = Funds {
            available: dec!(9968),
            locked: dec!(32),
        };
        // The 20 filled shares consumed 8 of the lock already.
        funds = ledger::settle_buyer_fill(funds, dec!(0.40), dec!(0.40), dec!(20)).unwrap();
        assert_eq!(funds.locked, dec!(24));

        let release = ledger::open_buy_reservation(dec!(0.40), dec!(80), dec!(20));
        assert_eq!(release, dec!(24));
        funds = ledger::release(funds, release).unwrap();
        assert_eq!(funds.locked, dec!(0));
        assert_eq!(funds.available, dec!(10000) - dec!(0.40) * dec!(20));
    }

    #[test]
    fn market_buy_consumes_book_then_cancels_residual() {
        let book = Orderbook::new(Uuid::new_v4(), Outcome::Yes);
        book.insert(resting(Uuid::new_v4(), OrderSide::Sell, dec!(0.50), dec!(30)));

        let taker = Uuid::new_v4();
        let mut funds = Funds {
            available: dec!(100),
            locked: dec!(0),
        };
        let cap = ledger::buy_escrow(OrderType::Market, None, dec!(50));
        assert_eq!(cap, dec!(50));
        funds = ledger::reserve(funds, cap).unwrap();

        let plan = book.match_plan(taker, OrderSide::Buy, None, dec!(50));
        assert_eq!(plan.fills.len(), 1);
        assert_eq!(plan.taker_remaining, dec!(20));

        // Fill 30 at 0.50 against a 1.00/share reservation.
        let fill = &plan.fills[0];
        funds = ledger::settle_buyer_fill(funds, Decimal::ONE, fill.price, fill.quantity).unwrap();
        // Residual cancels with its unused worst-case escrow returned.
        funds = ledger::release(funds, Decimal::ONE * plan.taker_remaining).unwrap();

        assert_eq!(funds.locked, dec!(0));
        // Net spend is exactly the executed value 0.50 x 30 = 15.
        assert_eq!(funds.available, dec!(85));
    }

    #[test]
    fn self_trade_is_skipped_and_limit_rests() {
        let book = Orderbook::new(Uuid::new_v4(), Outcome::Yes);
        let user = Uuid::new_v4();
        let own_bid = resting(user, OrderSide::Buy, dec!(0.40), dec!(80));
        let own_bid_id = own_bid.id;
        book.insert(own_bid);

        let plan = book.match_plan(user, OrderSide::Sell, Some(dec!(0.35)), dec!(60));
        assert!(plan.fills.is_empty());
        assert_eq!(plan.self_skips, vec![own_bid_id]);

        // The sell rests normally at its own price; the bid is untouched.
        book.apply_plan(&plan);
        book.insert(resting(user, OrderSide::Sell, dec!(0.35), dec!(60)));
        let snapshot = book.snapshot(10);
        assert_eq!(snapshot.bids[0].quantity, dec!(80));
        assert_eq!(snapshot.asks[0].price, dec!(0.35));
        assert_eq!(snapshot.asks[0].quantity, dec!(60));
    }

    #[test]
    fn resolution_pays_winners_and_releases_escrow() {
        // A holds YES 30 and a resting BUY @0.40 x 40 (locked 16);
        // B holds NO 20. Market resolves YES.
        let mut funds_a = Funds {
            available: dec!(84),
            locked: dec!(16),
        };
        let funds_b = Funds {
            available: dec!(100),
            locked: dec!(0),
        };

        // Winning YES shares pay one unit each.
        funds_a.available += dec!(30) * Decimal::ONE;
        // The resting order cancels, releasing its full reservation.
        let release = ledger::open_buy_reservation(dec!(0.40), dec!(40), dec!(0));
        assert_eq!(release, dec!(16));
        funds_a = ledger::release(funds_a, release).unwrap();

        assert_eq!(funds_a.available, dec!(130));
        assert_eq!(funds_a.locked, dec!(0));
        // B's losing NO shares pay nothing.
        assert_eq!(funds_b.total(), dec!(100));

        // Cash change equals winnings plus released escrow.
        assert_eq!(funds_a.total() - dec!(100), dec!(30));
    }

    #[test]
    fn time_priority_at_equal_price() {
        let book = Orderbook::new(Uuid::new_v4(), Outcome::Yes);
        let early = resting(Uuid::new_v4(), OrderSide::Sell, dec!(0.40), dec!(10));
        let early_id = early.id;
        let late = resting(Uuid::new_v4(), OrderSide::Sell, dec!(0.40), dec!(10));
        book.insert(early);
        book.insert(late);

        let plan = book.match_plan(Uuid::new_v4(), OrderSide::Buy, Some(dec!(0.40)), dec!(5));
        assert_eq!(plan.fills.len(), 1);
        assert_eq!(plan.fills[0].maker_order_id, early_id);
    }

    #[test]
    fn execution_price_is_always_the_makers() {
        let book = Orderbook::new(Uuid::new_v4(), Outcome::No);
        book.insert(resting(Uuid::new_v4(), OrderSide::Sell, dec!(0.30), dec!(10)));

        // Taker willing to pay up to 0.90 still trades at 0.30.
        let plan = book.match_plan(Uuid::new_v4(), OrderSide::Buy, Some(dec!(0.90)), dec!(10));
        assert_eq!(plan.fills[0].price, dec!(0.30));
    }
}
