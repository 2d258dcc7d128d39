//! Store operations.
//!
//! Every row the engine and settlement touch goes through these helpers.
//! Mutating operations take the open transaction so a whole submission
//! commits or aborts as one unit; reads that back API queries take any
//! executor. Monetary columns are NUMERIC bound as `rust_decimal::Decimal`.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sqlx::{PgExecutor, Postgres, Transaction};
use uuid::Uuid;

use crate::models::{
    Balance, Market, MarketStatus, Order, OrderEvent, OrderEventKind, OrderSide, OrderStatus,
    Outcome, Position, Trade, User,
};

pub type Tx<'a> = Transaction<'a, Postgres>;

// ============================================================================
// Markets
// ============================================================================

pub async fn find_market<'e>(
    executor: impl PgExecutor<'e>,
    market_id: Uuid,
) -> Result<Option<Market>, sqlx::Error> {
    sqlx::query_as::<_, Market>("SELECT * FROM markets WHERE id = $1")
        .bind(market_id)
        .fetch_optional(executor)
        .await
}

pub async fn find_market_by_slug<'e>(
    executor: impl PgExecutor<'e>,
    slug: &str,
) -> Result<Option<Market>, sqlx::Error> {
    sqlx::query_as::<_, Market>("SELECT * FROM markets WHERE slug = $1")
        .bind(slug)
        .fetch_optional(executor)
        .await
}

pub async fn list_markets<'e>(
    executor: impl PgExecutor<'e>,
    status: Option<MarketStatus>,
) -> Result<Vec<Market>, sqlx::Error> {
    match status {
        Some(status) => {
            sqlx::query_as::<_, Market>(
                "SELECT * FROM markets WHERE status = $1 ORDER BY created_at DESC",
            )
            .bind(status)
            .fetch_all(executor)
            .await
        }
        None => {
            sqlx::query_as::<_, Market>("SELECT * FROM markets ORDER BY created_at DESC")
                .fetch_all(executor)
                .await
        }
    }
}

pub async fn create_market(tx: &mut Tx<'_>, market: &Market) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO markets (id, slug, question, category, status, outcome, close_time,
                             resolve_time, resolution_source, yes_price, no_price,
                             created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12)
        "#,
    )
    .bind(market.id)
    .bind(&market.slug)
    .bind(&market.question)
    .bind(&market.category)
    .bind(market.status)
    .bind(market.outcome)
    .bind(market.close_time)
    .bind(market.resolve_time)
    .bind(market.resolution_source.as_deref())
    .bind(market.yes_price)
    .bind(market.no_price)
    .bind(market.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Flip a market to RESOLVED with its terminal outcome. Returns false when
/// the market was not in a resolvable state (already resolved or missing).
pub async fn mark_market_resolved(
    tx: &mut Tx<'_>,
    market_id: Uuid,
    outcome: Outcome,
    resolution_source: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE markets
        SET status = 'RESOLVED', outcome = $2, resolution_source = $3,
            resolve_time = NOW(), updated_at = NOW()
        WHERE id = $1 AND status <> 'RESOLVED'
        "#,
    )
    .bind(market_id)
    .bind(outcome)
    .bind(resolution_source)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn update_market_marks(
    tx: &mut Tx<'_>,
    market_id: Uuid,
    yes_price: Decimal,
    no_price: Decimal,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE markets SET yes_price = $2, no_price = $3, updated_at = NOW() WHERE id = $1",
    )
    .bind(market_id)
    .bind(yes_price)
    .bind(no_price)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

// ============================================================================
// Balances
// ============================================================================

/// Fetch the user's balance row under a row lock, creating it with the
/// configured starting funds on first touch.
pub async fn balance_for_update(
    tx: &mut Tx<'_>,
    user_id: Uuid,
    initial_balance: Decimal,
) -> Result<Balance, sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO balances (user_id, available, locked, created_at, updated_at)
        VALUES ($1, $2, 0, NOW(), NOW())
        ON CONFLICT (user_id) DO NOTHING
        "#,
    )
    .bind(user_id)
    .bind(initial_balance)
    .execute(&mut **tx)
    .await?;

    sqlx::query_as::<_, Balance>("SELECT * FROM balances WHERE user_id = $1 FOR UPDATE")
        .bind(user_id)
        .fetch_one(&mut **tx)
        .await
}

pub async fn find_balance<'e>(
    executor: impl PgExecutor<'e>,
    user_id: Uuid,
) -> Result<Option<Balance>, sqlx::Error> {
    sqlx::query_as::<_, Balance>("SELECT * FROM balances WHERE user_id = $1")
        .bind(user_id)
        .fetch_optional(executor)
        .await
}

pub async fn update_balance(
    tx: &mut Tx<'_>,
    user_id: Uuid,
    available: Decimal,
    locked: Decimal,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE balances SET available = $2, locked = $3, updated_at = NOW() WHERE user_id = $1",
    )
    .bind(user_id)
    .bind(available)
    .bind(locked)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

// ============================================================================
// Positions
// ============================================================================

pub async fn find_position<'e>(
    executor: impl PgExecutor<'e>,
    user_id: Uuid,
    market_id: Uuid,
    outcome: Outcome,
) -> Result<Option<Position>, sqlx::Error> {
    sqlx::query_as::<_, Position>(
        "SELECT * FROM positions WHERE user_id = $1 AND market_id = $2 AND outcome = $3",
    )
    .bind(user_id)
    .bind(market_id)
    .bind(outcome)
    .fetch_optional(executor)
    .await
}

pub async fn upsert_position(
    tx: &mut Tx<'_>,
    user_id: Uuid,
    market_id: Uuid,
    outcome: Outcome,
    quantity: Decimal,
    avg_price: Decimal,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO positions (user_id, market_id, outcome, quantity, avg_price, updated_at)
        VALUES ($1, $2, $3, $4, $5, NOW())
        ON CONFLICT (user_id, market_id, outcome) DO UPDATE SET
            quantity = $4,
            avg_price = $5,
            updated_at = NOW()
        "#,
    )
    .bind(user_id)
    .bind(market_id)
    .bind(outcome)
    .bind(quantity)
    .bind(avg_price)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn list_positions_for_market<'e>(
    executor: impl PgExecutor<'e>,
    market_id: Uuid,
) -> Result<Vec<Position>, sqlx::Error> {
    sqlx::query_as::<_, Position>("SELECT * FROM positions WHERE market_id = $1")
        .bind(market_id)
        .fetch_all(executor)
        .await
}

pub async fn list_positions_for_user<'e>(
    executor: impl PgExecutor<'e>,
    user_id: Uuid,
) -> Result<Vec<Position>, sqlx::Error> {
    sqlx::query_as::<_, Position>(
        "SELECT * FROM positions WHERE user_id = $1 AND quantity > 0 ORDER BY updated_at DESC",
    )
    .bind(user_id)
    .fetch_all(executor)
    .await
}

// ============================================================================
// Orders
// ============================================================================

pub async fn create_order(tx: &mut Tx<'_>, order: &Order) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO orders (id, user_id, market_id, outcome, side, order_type, price,
                            quantity, filled, status, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11)
        "#,
    )
    .bind(order.id)
    .bind(order.user_id)
    .bind(order.market_id)
    .bind(order.outcome)
    .bind(order.side)
    .bind(order.order_type)
    .bind(order.price)
    .bind(order.quantity)
    .bind(order.filled)
    .bind(order.status)
    .bind(order.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn find_order<'e>(
    executor: impl PgExecutor<'e>,
    order_id: Uuid,
) -> Result<Option<Order>, sqlx::Error> {
    sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = $1")
        .bind(order_id)
        .fetch_optional(executor)
        .await
}

pub async fn find_order_for_update(
    tx: &mut Tx<'_>,
    order_id: Uuid,
) -> Result<Option<Order>, sqlx::Error> {
    sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = $1 FOR UPDATE")
        .bind(order_id)
        .fetch_optional(&mut **tx)
        .await
}

pub async fn update_order_fill(
    tx: &mut Tx<'_>,
    order_id: Uuid,
    filled: Decimal,
    status: OrderStatus,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE orders SET filled = $2, status = $3, updated_at = NOW() WHERE id = $1")
        .bind(order_id)
        .bind(filled)
        .bind(status)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn update_order_status(
    tx: &mut Tx<'_>,
    order_id: Uuid,
    status: OrderStatus,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE orders SET status = $2, updated_at = NOW() WHERE id = $1")
        .bind(order_id)
        .bind(status)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Open and partially filled orders of one market, oldest first. Startup
/// book rebuilds rely on this ordering to reproduce time priority exactly.
pub async fn list_open_orders<'e>(
    executor: impl PgExecutor<'e>,
    market_id: Uuid,
) -> Result<Vec<Order>, sqlx::Error> {
    sqlx::query_as::<_, Order>(
        r#"
        SELECT * FROM orders
        WHERE market_id = $1 AND status IN ('OPEN', 'PARTIAL')
        ORDER BY created_at ASC, id ASC
        "#,
    )
    .bind(market_id)
    .fetch_all(executor)
    .await
}

pub async fn list_user_orders<'e>(
    executor: impl PgExecutor<'e>,
    user_id: Uuid,
    limit: i64,
) -> Result<Vec<Order>, sqlx::Error> {
    sqlx::query_as::<_, Order>(
        "SELECT * FROM orders WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2",
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(executor)
    .await
}

pub async fn count_open_orders_market<'e>(
    executor: impl PgExecutor<'e>,
    market_id: Uuid,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM orders WHERE market_id = $1 AND status IN ('OPEN', 'PARTIAL')",
    )
    .bind(market_id)
    .fetch_one(executor)
    .await
}

pub async fn count_open_orders_user<'e>(
    executor: impl PgExecutor<'e>,
    user_id: Uuid,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM orders WHERE user_id = $1 AND status IN ('OPEN', 'PARTIAL')",
    )
    .bind(user_id)
    .fetch_one(executor)
    .await
}

/// Unfilled quantity across the user's resting BUYs on one
/// (market, outcome); feeds the share-cap projection.
pub async fn sum_resting_buy_remaining<'e>(
    executor: impl PgExecutor<'e>,
    user_id: Uuid,
    market_id: Uuid,
    outcome: Outcome,
) -> Result<Decimal, sqlx::Error> {
    let sum: Option<Decimal> = sqlx::query_scalar(
        r#"
        SELECT SUM(quantity - filled) FROM orders
        WHERE user_id = $1 AND market_id = $2 AND outcome = $3
          AND side = $4 AND status IN ('OPEN', 'PARTIAL')
        "#,
    )
    .bind(user_id)
    .bind(market_id)
    .bind(outcome)
    .bind(OrderSide::Buy)
    .fetch_one(executor)
    .await?;
    Ok(sum.unwrap_or(Decimal::ZERO))
}

// ============================================================================
// Trades
// ============================================================================

pub async fn create_trade(tx: &mut Tx<'_>, trade: &Trade) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO trades (id, market_id, outcome, buy_order_id, sell_order_id,
                            buyer_id, seller_id, price, quantity, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(trade.id)
    .bind(trade.market_id)
    .bind(trade.outcome)
    .bind(trade.buy_order_id)
    .bind(trade.sell_order_id)
    .bind(trade.buyer_id)
    .bind(trade.seller_id)
    .bind(trade.price)
    .bind(trade.quantity)
    .bind(trade.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn list_trades<'e>(
    executor: impl PgExecutor<'e>,
    market_id: Uuid,
    limit: i64,
) -> Result<Vec<Trade>, sqlx::Error> {
    sqlx::query_as::<_, Trade>(
        "SELECT * FROM trades WHERE market_id = $1 ORDER BY created_at DESC, id DESC LIMIT $2",
    )
    .bind(market_id)
    .bind(limit)
    .fetch_all(executor)
    .await
}

pub async fn list_user_trades<'e>(
    executor: impl PgExecutor<'e>,
    user_id: Uuid,
    limit: i64,
) -> Result<Vec<Trade>, sqlx::Error> {
    sqlx::query_as::<_, Trade>(
        r#"
        SELECT * FROM trades WHERE buyer_id = $1 OR seller_id = $1
        ORDER BY created_at DESC, id DESC LIMIT $2
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(executor)
    .await
}

/// Prices of the most recent trades of one outcome, newest first. The mark
/// price is the mean of at most the ten latest.
pub async fn recent_trade_prices<'e>(
    executor: impl PgExecutor<'e>,
    market_id: Uuid,
    outcome: Outcome,
    limit: i64,
) -> Result<Vec<Decimal>, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        SELECT price FROM trades WHERE market_id = $1 AND outcome = $2
        ORDER BY created_at DESC, id DESC LIMIT $3
        "#,
    )
    .bind(market_id)
    .bind(outcome)
    .bind(limit)
    .fetch_all(executor)
    .await
}

// ============================================================================
// Order events
// ============================================================================

pub async fn append_order_event(
    tx: &mut Tx<'_>,
    order_id: Uuid,
    kind: OrderEventKind,
    payload: serde_json::Value,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO order_events (id, order_id, kind, payload, created_at)
        VALUES ($1, $2, $3, $4, NOW())
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(order_id)
    .bind(kind)
    .bind(payload)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn list_order_events<'e>(
    executor: impl PgExecutor<'e>,
    order_id: Uuid,
) -> Result<Vec<OrderEvent>, sqlx::Error> {
    sqlx::query_as::<_, OrderEvent>(
        "SELECT * FROM order_events WHERE order_id = $1 ORDER BY created_at ASC, id ASC",
    )
    .bind(order_id)
    .fetch_all(executor)
    .await
}

// ============================================================================
// Idempotency
// ============================================================================

/// The stored outcome of a prior commit under this key, if one exists
/// inside the retention window.
pub async fn find_idempotent<'e>(
    executor: impl PgExecutor<'e>,
    user_id: Uuid,
    key: &str,
    retention: Duration,
) -> Result<Option<serde_json::Value>, sqlx::Error> {
    let cutoff: DateTime<Utc> = Utc::now() - retention;
    sqlx::query_scalar(
        r#"
        SELECT response FROM idempotency_keys
        WHERE user_id = $1 AND key = $2 AND created_at > $3
        "#,
    )
    .bind(user_id)
    .bind(key)
    .bind(cutoff)
    .fetch_optional(executor)
    .await
}

pub async fn save_idempotent(
    tx: &mut Tx<'_>,
    user_id: Uuid,
    key: &str,
    response: &serde_json::Value,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO idempotency_keys (user_id, key, response, created_at)
        VALUES ($1, $2, $3, NOW())
        ON CONFLICT (user_id, key) DO NOTHING
        "#,
    )
    .bind(user_id)
    .bind(key)
    .bind(response)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Lazily drop expired keys; called opportunistically from the engine.
pub async fn reap_idempotency_keys<'e>(
    executor: impl PgExecutor<'e>,
    retention: Duration,
) -> Result<u64, sqlx::Error> {
    let cutoff: DateTime<Utc> = Utc::now() - retention;
    let result = sqlx::query("DELETE FROM idempotency_keys WHERE created_at <= $1")
        .bind(cutoff)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

// ============================================================================
// Users
// ============================================================================

pub async fn find_user<'e>(
    executor: impl PgExecutor<'e>,
    user_id: Uuid,
) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(executor)
        .await
}

pub async fn ensure_user(tx: &mut Tx<'_>, user_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO users (id, role, created_at)
        VALUES ($1, 'USER', NOW())
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(user_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
