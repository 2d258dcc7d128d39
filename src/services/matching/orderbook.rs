//! Orderbook Implementation
//!
//! Per-(market, outcome) book with price-time priority. Matching is split
//! into a read-only planning scan and a post-commit apply step: the book
//! reflects only committed state, so a failed store transaction never
//! leaves phantom fills in memory.

use super::types::*;
use crate::models::{Outcome, OrderSide};
use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering as AtomicOrdering};
use uuid::Uuid;

/// One side's price-indexed ladder of FIFO queues.
type Ladder = BTreeMap<PriceKey, VecDeque<BookOrder>>;

pub struct Orderbook {
    market_id: Uuid,
    outcome: Outcome,

    /// Bids keyed ascending; best bid is the last key.
    bids: RwLock<Ladder>,

    /// Asks keyed ascending; best ask is the first key.
    asks: RwLock<Ladder>,

    /// Order ID to (side, price_key) mapping for O(log n) cancellation.
    order_index: DashMap<Uuid, (OrderSide, PriceKey)>,

    /// Bumped on every committed mutation; stamped onto snapshots.
    sequence: AtomicU64,

    order_count: AtomicI64,
}

impl Orderbook {
    pub fn new(market_id: Uuid, outcome: Outcome) -> Self {
        Self {
            market_id,
            outcome,
            bids: RwLock::new(BTreeMap::new()),
            asks: RwLock::new(BTreeMap::new()),
            order_index: DashMap::new(),
            sequence: AtomicU64::new(0),
            order_count: AtomicI64::new(0),
        }
    }

    pub fn market_id(&self) -> Uuid {
        self.market_id
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn order_count(&self) -> i64 {
        self.order_count.load(AtomicOrdering::Relaxed)
    }

    pub fn sequence(&self) -> u64 {
        self.sequence.load(AtomicOrdering::Relaxed)
    }

    fn bump_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, AtomicOrdering::Relaxed) + 1
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        let bids = self.bids.read();
        bids.keys().next_back().map(|p| p.to_decimal())
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        let asks = self.asks.read();
        asks.keys().next().map(|p| p.to_decimal())
    }

    pub fn contains(&self, order_id: &Uuid) -> bool {
        self.order_index.contains_key(order_id)
    }

    /// Insert a resting order at the tail of its price level.
    ///
    /// Pre: the order is not already present and `remaining > 0`.
    pub fn insert(&self, order: BookOrder) {
        debug_assert!(order.remaining > Decimal::ZERO);
        debug_assert!(!self.order_index.contains_key(&order.id));

        let key = PriceKey::from_decimal(order.price);
        let side = order.side;
        let order_id = order.id;

        match side {
            OrderSide::Buy => {
                let mut bids = self.bids.write();
                bids.entry(key).or_insert_with(VecDeque::new).push_back(order);
            }
            OrderSide::Sell => {
                let mut asks = self.asks.write();
                asks.entry(key).or_insert_with(VecDeque::new).push_back(order);
            }
        }

        self.order_index.insert(order_id, (side, key));
        self.order_count.fetch_add(1, AtomicOrdering::Relaxed);
        self.bump_sequence();
    }

    /// Unlink an order from its price level; drops the level when emptied.
    /// Returns None if the order is not resting here.
    pub fn remove(&self, order_id: Uuid) -> Option<BookOrder> {
        let (side, key) = self.order_index.remove(&order_id)?.1;

        let entry = {
            let mut ladder = match side {
                OrderSide::Buy => self.bids.write(),
                OrderSide::Sell => self.asks.write(),
            };
            let queue = ladder.get_mut(&key)?;
            let pos = queue.iter().position(|o| o.id == order_id)?;
            let entry = queue.remove(pos);
            if queue.is_empty() {
                ladder.remove(&key);
            }
            entry
        };

        if entry.is_some() {
            self.order_count.fetch_sub(1, AtomicOrdering::Relaxed);
            self.bump_sequence();
        }

        entry
    }

    /// Scan the opposite side for matches without mutating anything.
    ///
    /// For a BUY taker, resting asks are consumed in ascending price order
    /// (FIFO within a level) while `ask.price <= limit`; a `None` limit
    /// (MARKET) is unbounded. Symmetric for SELL. Resting orders owned by
    /// the taker are skipped and reported, never crossed.
    pub fn match_plan(
        &self,
        taker_user_id: Uuid,
        taker_side: OrderSide,
        limit_price: Option<Decimal>,
        quantity: Decimal,
    ) -> MatchPlan {
        let mut plan = MatchPlan {
            taker_remaining: quantity,
            ..Default::default()
        };

        let ladder = match taker_side {
            OrderSide::Buy => self.asks.read(),
            OrderSide::Sell => self.bids.read(),
        };

        // BUY walks asks ascending, SELL walks bids descending.
        let levels: Vec<(&PriceKey, &VecDeque<BookOrder>)> = match taker_side {
            OrderSide::Buy => ladder.iter().collect(),
            OrderSide::Sell => ladder.iter().rev().collect(),
        };

        for (key, queue) in levels {
            if plan.taker_remaining <= Decimal::ZERO {
                break;
            }

            let level_price = key.to_decimal();
            if let Some(limit) = limit_price {
                let crossed = match taker_side {
                    OrderSide::Buy => level_price <= limit,
                    OrderSide::Sell => level_price >= limit,
                };
                if !crossed {
                    break;
                }
            }

            for maker in queue.iter() {
                if plan.taker_remaining <= Decimal::ZERO {
                    break;
                }
                if maker.user_id == taker_user_id {
                    plan.self_skips.push(maker.id);
                    continue;
                }

                let fill_qty = plan.taker_remaining.min(maker.remaining);
                plan.taker_remaining -= fill_qty;
                plan.fills.push(Fill {
                    maker_order_id: maker.id,
                    maker_user_id: maker.user_id,
                    price: maker.price,
                    quantity: fill_qty,
                    exhausts_maker: fill_qty == maker.remaining,
                });
            }
        }

        plan
    }

    /// Apply a committed plan: decrement maker remainders, unlink exhausted
    /// makers. Called only after the store transaction commits.
    pub fn apply_plan(&self, plan: &MatchPlan) {
        for fill in &plan.fills {
            let Some(index_entry) = self.order_index.get(&fill.maker_order_id) else {
                tracing::warn!(
                    order_id = %fill.maker_order_id,
                    "committed fill references an order missing from the book"
                );
                continue;
            };
            let (side, key) = *index_entry;
            drop(index_entry);

            let mut ladder = match side {
                OrderSide::Buy => self.bids.write(),
                OrderSide::Sell => self.asks.write(),
            };
            let Some(queue) = ladder.get_mut(&key) else {
                continue;
            };
            if let Some(pos) = queue.iter().position(|o| o.id == fill.maker_order_id) {
                queue[pos].remaining -= fill.quantity;
                if queue[pos].remaining <= Decimal::ZERO {
                    queue.remove(pos);
                    self.order_index.remove(&fill.maker_order_id);
                    self.order_count.fetch_sub(1, AtomicOrdering::Relaxed);
                }
            }
            if queue.is_empty() {
                ladder.remove(&key);
            }
        }
        if !plan.fills.is_empty() {
            self.bump_sequence();
        }
    }

    /// Aggregated view: per level, the sum of unfilled remainders and the
    /// count of resting orders. Bids best-first, asks best-first.
    pub fn snapshot(&self, depth: usize) -> BookSnapshot {
        let mut bid_levels = Vec::new();
        let mut ask_levels = Vec::new();

        {
            let bids = self.bids.read();
            for (key, orders) in bids.iter().rev().take(depth) {
                bid_levels.push(LevelView {
                    price: key.to_decimal(),
                    quantity: orders.iter().map(|o| o.remaining).sum(),
                    orders: orders.len() as u32,
                });
            }
        }
        {
            let asks = self.asks.read();
            for (key, orders) in asks.iter().take(depth) {
                ask_levels.push(LevelView {
                    price: key.to_decimal(),
                    quantity: orders.iter().map(|o| o.remaining).sum(),
                    orders: orders.len() as u32,
                });
            }
        }

        BookSnapshot {
            market_id: self.market_id,
            outcome: self.outcome,
            bids: bid_levels,
            asks: ask_levels,
            sequence: self.sequence(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn book() -> Orderbook {
        Orderbook::new(Uuid::new_v4(), Outcome::Yes)
    }

    fn resting(
        user: Uuid,
        side: OrderSide,
        price: Decimal,
        quantity: Decimal,
    ) -> BookOrder {
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
    fn test_insert_and_remove() {
        let book = book();
        let order = resting(Uuid::new_v4(), OrderSide::Buy, dec!(0.40), dec!(80));
        let order_id = order.id;

        book.insert(order);
        assert_eq!(book.order_count(), 1);
        assert!(book.contains(&order_id));

        let removed = book.remove(order_id);
        assert!(removed.is_some());
        assert_eq!(book.order_count(), 0);
        assert!(!book.contains(&order_id));
        assert!(book.remove(order_id).is_none());
    }

    #[test]
    fn test_best_bid_ask() {
        let book = book();
        let user = Uuid::new_v4();

        book.insert(resting(user, OrderSide::Buy, dec!(0.44), dec!(40)));
        book.insert(resting(user, OrderSide::Buy, dec!(0.42), dec!(10)));
        book.insert(resting(user, OrderSide::Sell, dec!(0.50), dec!(60)));
        book.insert(resting(user, OrderSide::Sell, dec!(0.55), dec!(5)));

        assert_eq!(book.best_bid(), Some(dec!(0.44)));
        assert_eq!(book.best_ask(), Some(dec!(0.50)));
    }

    #[test]
    fn test_match_plan_walks_price_then_time() {
        let book = book();
        let maker_a = Uuid::new_v4();
        let maker_b = Uuid::new_v4();

        let first = resting(maker_a, OrderSide::Sell, dec!(0.40), dec!(30));
        let first_id = first.id;
        let second = resting(maker_b, OrderSide::Sell, dec!(0.40), dec!(30));
        let second_id = second.id;
        let worse = resting(maker_b, OrderSide::Sell, dec!(0.45), dec!(50));
        let worse_id = worse.id;

        book.insert(first);
        book.insert(second);
        book.insert(worse);

        let plan = book.match_plan(Uuid::new_v4(), OrderSide::Buy, Some(dec!(0.45)), dec!(70));
        assert_eq!(plan.fills.len(), 3);
        assert_eq!(plan.fills[0].maker_order_id, first_id);
        assert_eq!(plan.fills[0].price, dec!(0.40));
        assert_eq!(plan.fills[1].maker_order_id, second_id);
        assert_eq!(plan.fills[2].maker_order_id, worse_id);
        assert_eq!(plan.fills[2].quantity, dec!(10));
        assert_eq!(plan.taker_remaining, dec!(0));
    }

    #[test]
    fn test_match_plan_respects_limit() {
        let book = book();
        book.insert(resting(Uuid::new_v4(), OrderSide::Sell, dec!(0.50), dec!(60)));

        let plan = book.match_plan(Uuid::new_v4(), OrderSide::Buy, Some(dec!(0.44)), dec!(40));
        assert!(plan.fills.is_empty());
        assert_eq!(plan.taker_remaining, dec!(40));
    }

    #[test]
    fn test_match_plan_skips_own_orders() {
        let book = book();
        let user = Uuid::new_v4();
        let own = resting(user, OrderSide::Buy, dec!(0.40), dec!(80));
        let own_id = own.id;
        book.insert(own);

        let plan = book.match_plan(user, OrderSide::Sell, Some(dec!(0.35)), dec!(60));
        assert!(plan.fills.is_empty());
        assert_eq!(plan.self_skips, vec![own_id]);
        assert_eq!(plan.taker_remaining, dec!(60));
        // Skipping must not disturb the resting order.
        assert!(book.contains(&own_id));
    }

    #[test]
    fn test_match_plan_skips_self_but_fills_deeper() {
        let book = book();
        let user = Uuid::new_v4();
        let other = Uuid::new_v4();

        book.insert(resting(user, OrderSide::Buy, dec!(0.40), dec!(80)));
        let deeper = resting(other, OrderSide::Buy, dec!(0.38), dec!(25));
        let deeper_id = deeper.id;
        book.insert(deeper);

        let plan = book.match_plan(user, OrderSide::Sell, Some(dec!(0.35)), dec!(60));
        assert_eq!(plan.self_skips.len(), 1);
        assert_eq!(plan.fills.len(), 1);
        assert_eq!(plan.fills[0].maker_order_id, deeper_id);
        assert_eq!(plan.fills[0].price, dec!(0.38));
        assert_eq!(plan.fills[0].quantity, dec!(25));
        assert_eq!(plan.taker_remaining, dec!(35));
    }

    #[test]
    fn test_plan_is_read_only_until_applied() {
        let book = book();
        let maker = resting(Uuid::new_v4(), OrderSide::Sell, dec!(0.40), dec!(50));
        let maker_id = maker.id;
        book.insert(maker);

        let plan = book.match_plan(Uuid::new_v4(), OrderSide::Buy, Some(dec!(0.40)), dec!(50));
        assert_eq!(plan.fills.len(), 1);
        // Not applied yet: the maker still rests untouched.
        assert!(book.contains(&maker_id));
        assert_eq!(book.snapshot(10).asks[0].quantity, dec!(50));

        book.apply_plan(&plan);
        assert!(!book.contains(&maker_id));
        assert!(book.snapshot(10).asks.is_empty());
    }

    #[test]
    fn test_apply_plan_partial_fill_keeps_remainder() {
        let book = book();
        let maker = resting(Uuid::new_v4(), OrderSide::Buy, dec!(0.40), dec!(80));
        let maker_id = maker.id;
        book.insert(maker);

        let plan = book.match_plan(Uuid::new_v4(), OrderSide::Sell, Some(dec!(0.35)), dec!(60));
        book.apply_plan(&plan);

        assert!(book.contains(&maker_id));
        let snapshot = book.snapshot(10);
        assert_eq!(snapshot.bids.len(), 1);
        assert_eq!(snapshot.bids[0].quantity, dec!(20));
        assert_eq!(snapshot.bids[0].orders, 1);
    }

    #[test]
    fn test_snapshot_aggregates_levels() {
        let book = book();
        let user = Uuid::new_v4();
        book.insert(resting(user, OrderSide::Buy, dec!(0.44), dec!(40)));
        book.insert(resting(user, OrderSide::Buy, dec!(0.44), dec!(15)));
        book.insert(resting(user, OrderSide::Sell, dec!(0.50), dec!(60)));

        let snapshot = book.snapshot(10);
        assert_eq!(
            snapshot.bids,
            vec![LevelView {
                price: dec!(0.44),
                quantity: dec!(55),
                orders: 2,
            }]
        );
        assert_eq!(
            snapshot.asks,
            vec![LevelView {
                price: dec!(0.50),
                quantity: dec!(60),
                orders: 1,
            }]
        );
    }

    #[test]
    fn test_sequence_bumps_on_mutation() {
        let book = book();
        let start = book.sequence();
        let order = resting(Uuid::new_v4(), OrderSide::Buy, dec!(0.40), dec!(10));
        let order_id = order.id;
        book.insert(order);
        assert!(book.sequence() > start);
        let after_insert = book.sequence();
        book.remove(order_id);
        assert!(book.sequence() > after_insert);
    }
}
