//! Book registry.
//!
//! Owns the in-memory books, two per market (one per outcome). Books are
//! built lazily on first reference and are never authoritative across
//! restarts: a cold start replays open orders from the store in
//! `created_at` order so time priority survives the restart exactly.

use dashmap::DashMap;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use super::orderbook::Orderbook;
use super::types::BookOrder;
use crate::db::store;
use crate::models::{MarketStatus, Outcome};

pub struct MarketBooks {
    pub yes: Orderbook,
    pub no: Orderbook,
}

impl MarketBooks {
    fn new(market_id: Uuid) -> Self {
        Self {
            yes: Orderbook::new(market_id, Outcome::Yes),
            no: Orderbook::new(market_id, Outcome::No),
        }
    }

    pub fn book(&self, outcome: Outcome) -> &Orderbook {
        match outcome {
            Outcome::Yes => &self.yes,
            Outcome::No => &self.no,
        }
    }
}

#[derive(Default)]
pub struct BookRegistry {
    books: DashMap<Uuid, Arc<MarketBooks>>,
}

impl BookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The books for a market, constructing empty ones on first reference.
    pub fn books(&self, market_id: Uuid) -> Arc<MarketBooks> {
        self.books
            .entry(market_id)
            .or_insert_with(|| Arc::new(MarketBooks::new(market_id)))
            .clone()
    }

    /// Drop a market's books, e.g. after resolution.
    pub fn drop_market(&self, market_id: Uuid) {
        self.books.remove(&market_id);
    }

    pub fn market_count(&self) -> usize {
        self.books.len()
    }

    /// Rebuild the books of every OPEN market from the store. Orders arrive
    /// oldest first, so insertion order reproduces time priority.
    pub async fn warm_up(&self, pool: &PgPool) -> Result<usize, sqlx::Error> {
        let markets = store::list_markets(pool, Some(MarketStatus::Open)).await?;
        let mut restored = 0usize;

        for market in markets {
            let orders = store::list_open_orders(pool, market.id).await?;
            if orders.is_empty() {
                continue;
            }
            let books = self.books(market.id);
            for order in orders {
                let Some(price) = order.price else {
                    tracing::warn!(order_id = %order.id, "open order without a price, skipping");
                    continue;
                };
                books.book(order.outcome).insert(BookOrder {
                    id: order.id,
                    user_id: order.user_id,
                    side: order.side,
                    price,
                    quantity: order.quantity,
                    remaining: order.remaining(),
                    created_at: order.created_at,
                });
                restored += 1;
            }
        }

        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lazy_construction_and_reuse() {
        let registry = BookRegistry::new();
        let market_id = Uuid::new_v4();

        let first = registry.books(market_id);
        let second = registry.books(market_id);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.market_count(), 1);

        registry.drop_market(market_id);
        assert_eq!(registry.market_count(), 0);
    }

    #[test]
    fn test_books_are_per_outcome() {
        let registry = BookRegistry::new();
        let market_id = Uuid::new_v4();
        let books = registry.books(market_id);

        assert_eq!(books.book(Outcome::Yes).outcome(), Outcome::Yes);
        assert_eq!(books.book(Outcome::No).outcome(), Outcome::No);
        assert_eq!(books.yes.market_id(), market_id);
    }
}
