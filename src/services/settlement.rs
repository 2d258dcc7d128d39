//! Settlement Service
//!
//! Runs when a market transitions to RESOLVED: pays each winning position
//! one unit per share, zeroes every position (rows are retained for
//! history), cancels resting orders and releases their BUY escrow. The
//! whole pass is one store transaction scoped to the market, and re-running
//! it against an already-settled market is a no-op.

use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgPool;
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

use crate::db::store;
use crate::error::EngineError;
use crate::models::{
    BalanceResponse, MarketStatus, OrderEventKind, OrderSide, OrderStatus, Outcome,
};
use crate::services::matching::ledger::{self, Funds};

/// How far a settlement request got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementStatus {
    Completed,
    /// The market is RESOLVED but the settlement transaction failed; it is
    /// being retried asynchronously.
    Pending,
    /// Positions were already zero and no orders were resting.
    AlreadySettled,
}

#[derive(Debug, Clone, Serialize)]
pub struct SettlementReport {
    pub market_id: Uuid,
    pub outcome: Outcome,
    pub status: SettlementStatus,
    pub winners_paid: u32,
    pub total_payout: Decimal,
    pub orders_cancelled: u32,
    pub escrow_released: Decimal,
    /// Final balances of every touched user, for event fan-out.
    #[serde(skip)]
    pub balances: Vec<(Uuid, BalanceResponse)>,
}

pub struct SettlementService;

impl SettlementService {
    /// Settle one resolved market. Caller retries on failure; the market's
    /// status flip has already been committed by the admin surface.
    pub async fn settle_market(
        pool: &PgPool,
        market_id: Uuid,
    ) -> Result<SettlementReport, EngineError> {
        let mut tx = pool.begin().await?;

        let market = store::find_market(&mut *tx, market_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("market {market_id}")))?;
        if market.status != MarketStatus::Resolved {
            return Err(EngineError::InvalidInput(
                "market is not resolved".to_string(),
            ));
        }
        let winning = market
            .outcome
            .ok_or_else(|| EngineError::Internal("resolved market without outcome".to_string()))?;

        let positions = store::list_positions_for_market(&mut *tx, market_id).await?;
        let open_orders = store::list_open_orders(&mut *tx, market_id).await?;

        let has_live_positions = positions.iter().any(|p| p.quantity > Decimal::ZERO);
        if !has_live_positions && open_orders.is_empty() {
            return Ok(SettlementReport {
                market_id,
                outcome: winning,
                status: SettlementStatus::AlreadySettled,
                winners_paid: 0,
                total_payout: Decimal::ZERO,
                orders_cancelled: 0,
                escrow_released: Decimal::ZERO,
                balances: Vec::new(),
            });
        }

        let mut funds: HashMap<Uuid, Funds> = HashMap::new();
        let mut winners_paid = 0u32;
        let mut total_payout = Decimal::ZERO;
        let mut escrow_released = Decimal::ZERO;

        // Winners collect one unit per share; every position is then zeroed.
        for position in &positions {
            if position.quantity <= Decimal::ZERO {
                continue;
            }
            if position.outcome == winning {
                let payout = position.quantity * Decimal::ONE;
                let entry =
                    load_funds(&mut tx, &mut funds, position.user_id).await?;
                entry.available += payout;
                winners_paid += 1;
                total_payout += payout;
            }
            store::upsert_position(
                &mut tx,
                position.user_id,
                position.market_id,
                position.outcome,
                Decimal::ZERO,
                position.avg_price,
            )
            .await?;
        }

        // Resting orders are cancelled; BUY escrow returns to the owner.
        let mut orders_cancelled = 0u32;
        for order in &open_orders {
            if order.side == OrderSide::Buy {
                let price = order.price.ok_or_else(|| {
                    EngineError::Internal("resting buy without a price".to_string())
                })?;
                let release = ledger::open_buy_reservation(price, order.quantity, order.filled);
                let entry = load_funds(&mut tx, &mut funds, order.user_id).await?;
                *entry = ledger::release(*entry, release)
                    .map_err(|e| EngineError::Internal(e.to_string()))?;
                escrow_released += release;
            }
            store::update_order_status(&mut tx, order.id, OrderStatus::Cancelled).await?;
            store::append_order_event(
                &mut tx,
                order.id,
                OrderEventKind::Cancelled,
                serde_json::json!({ "reason": "MARKET_RESOLVED" }),
            )
            .await?;
            orders_cancelled += 1;
        }

        let mut balances = Vec::with_capacity(funds.len());
        for (user_id, user_funds) in &funds {
            store::update_balance(&mut tx, *user_id, user_funds.available, user_funds.locked)
                .await?;
            balances.push((
                *user_id,
                BalanceResponse {
                    available: user_funds.available,
                    locked: user_funds.locked,
                    total: user_funds.total(),
                },
            ));
        }

        tx.commit().await?;

        info!(
            market_id = %market_id,
            outcome = %winning,
            winners_paid,
            %total_payout,
            orders_cancelled,
            "market settled"
        );

        Ok(SettlementReport {
            market_id,
            outcome: winning,
            status: SettlementStatus::Completed,
            winners_paid,
            total_payout,
            orders_cancelled,
            escrow_released,
            balances,
        })
    }
}

async fn load_funds<'a>(
    tx: &mut store::Tx<'_>,
    funds: &'a mut HashMap<Uuid, Funds>,
    user_id: Uuid,
) -> Result<&'a mut Funds, EngineError> {
    if !funds.contains_key(&user_id) {
        // Settlement only touches users that already traded, so the row
        // exists; the zero fallback keeps first-touch semantics anyway.
        let balance = store::balance_for_update(tx, user_id, Decimal::ZERO).await?;
        funds.insert(
            user_id,
            Funds {
                available: balance.available,
                locked: balance.locked,
            },
        );
    }
    Ok(funds.get_mut(&user_id).expect("entry just inserted"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_screaming() {
        let json = serde_json::to_string(&SettlementStatus::AlreadySettled).unwrap();
        assert_eq!(json, "\"ALREADY_SETTLED\"");
    }

    // The settlement arithmetic itself (payout = quantity x 1, escrow
    // release = price x remaining) is covered by the ledger tests; the
    // transaction walk requires a live database.
}
