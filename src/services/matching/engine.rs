//! Matching Engine
//!
//! Owns the transactional order lifecycle: validate, escrow, match,
//! settle fills, persist, then publish. One actor task per market
//! serializes every write for that market, so book mutation needs no
//! intra-market locking and arrival order is execution order. Balances
//! are the only cross-market resource; the store's row locks plus bounded
//! conflict retries arbitrate those.

use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::ledger::{self, Funds, Holding};
use super::orderbook::Orderbook;
use super::registry::BookRegistry;
use super::types::*;
use super::validator::{self, SubmitContext};
use crate::config::EngineLimits;
use crate::db::store;
use crate::error::{is_serialization_conflict, EngineError};
use crate::events::{EventSink, ExchangeEvent};
use crate::metrics::names as metric_names;
use crate::models::{
    BalanceResponse, Order, OrderEventKind, OrderResponse, OrderSide, OrderStatus, OrderType,
    Outcome, Trade, TradeResponse,
};
use crate::services::settlement::{SettlementReport, SettlementService, SettlementStatus};

/// Mailbox depth per market worker; admission blocks (bounded by the
/// caller deadline) once a market is this far behind.
const MAILBOX_DEPTH: usize = 256;

enum MarketCommand {
    Submit(
        Box<SubmitOrder>,
        oneshot::Sender<Result<SubmitAccepted, EngineError>>,
    ),
    Cancel {
        order_id: Uuid,
        user_id: Uuid,
        reply: oneshot::Sender<Result<CancelAccepted, EngineError>>,
    },
    Resolve {
        outcome: Outcome,
        reply: oneshot::Sender<Result<SettlementReport, EngineError>>,
    },
}

/// Shared state each market worker operates on.
#[derive(Clone)]
struct WorkerCtx {
    market_id: Uuid,
    pool: PgPool,
    registry: Arc<BookRegistry>,
    events: Arc<EventSink>,
    limits: EngineLimits,
}

pub struct ExchangeEngine {
    pool: PgPool,
    registry: Arc<BookRegistry>,
    events: Arc<EventSink>,
    limits: EngineLimits,
    workers: DashMap<Uuid, mpsc::Sender<MarketCommand>>,
}

impl ExchangeEngine {
    pub fn new(
        pool: PgPool,
        registry: Arc<BookRegistry>,
        events: Arc<EventSink>,
        limits: EngineLimits,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            registry,
            events,
            limits,
            workers: DashMap::new(),
        })
    }

    fn worker(&self, market_id: Uuid) -> mpsc::Sender<MarketCommand> {
        self.workers
            .entry(market_id)
            .or_insert_with(|| {
                spawn_worker(WorkerCtx {
                    market_id,
                    pool: self.pool.clone(),
                    registry: self.registry.clone(),
                    events: self.events.clone(),
                    limits: self.limits.clone(),
                })
            })
            .clone()
    }

    /// Race a command into the market's mailbox against the admission
    /// deadline; once queued, the command will execute.
    async fn admit(
        &self,
        market_id: Uuid,
        command: MarketCommand,
        deadline: Option<Duration>,
    ) -> Result<(), EngineError> {
        let deadline =
            deadline.unwrap_or_else(|| Duration::from_millis(self.limits.submit_deadline_ms));
        let sender = self.worker(market_id);
        match tokio::time::timeout(deadline, sender.send(command)).await {
            Err(_) => Err(EngineError::Timeout),
            Ok(Err(_)) => Err(EngineError::Internal(
                "market worker is not running".to_string(),
            )),
            Ok(Ok(())) => Ok(()),
        }
    }

    pub async fn submit_order(
        &self,
        cmd: SubmitOrder,
        deadline: Option<Duration>,
    ) -> Result<SubmitAccepted, EngineError> {
        let market_id = cmd.market_id;
        let (reply, rx) = oneshot::channel();
        self.admit(market_id, MarketCommand::Submit(Box::new(cmd), reply), deadline)
            .await?;
        rx.await
            .map_err(|_| EngineError::Internal("market worker dropped the reply".to_string()))?
    }

    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        user_id: Uuid,
    ) -> Result<CancelAccepted, EngineError> {
        // Route by the order's market so cancellation serializes with
        // matching; ownership is re-checked inside the transaction.
        let order = store::find_order(&self.pool, order_id)
            .await
            .map_err(EngineError::from)?
            .ok_or_else(|| EngineError::NotFound(format!("order {order_id}")))?;

        let (reply, rx) = oneshot::channel();
        self.admit(
            order.market_id,
            MarketCommand::Cancel {
                order_id,
                user_id,
                reply,
            },
            None,
        )
        .await?;
        rx.await
            .map_err(|_| EngineError::Internal("market worker dropped the reply".to_string()))?
    }

    /// Invoked by the admin surface after the RESOLVED flip is persisted.
    pub async fn on_market_resolved(
        &self,
        market_id: Uuid,
        outcome: Outcome,
    ) -> Result<SettlementReport, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.admit(market_id, MarketCommand::Resolve { outcome, reply }, None)
            .await?;
        rx.await
            .map_err(|_| EngineError::Internal("market worker dropped the reply".to_string()))?
    }

    pub fn orderbook(&self, market_id: Uuid, outcome: Outcome, depth: usize) -> BookSnapshot {
        self.registry.books(market_id).book(outcome).snapshot(depth)
    }
}

fn spawn_worker(ctx: WorkerCtx) -> mpsc::Sender<MarketCommand> {
    let (sender, mut receiver) = mpsc::channel(MAILBOX_DEPTH);
    tokio::spawn(async move {
        debug!(market_id = %ctx.market_id, "market worker started");
        while let Some(command) = receiver.recv().await {
            match command {
                MarketCommand::Submit(cmd, reply) => {
                    let _ = reply.send(handle_submit(&ctx, *cmd).await);
                }
                MarketCommand::Cancel {
                    order_id,
                    user_id,
                    reply,
                } => {
                    let _ = reply.send(handle_cancel(&ctx, order_id, user_id).await);
                }
                MarketCommand::Resolve { outcome, reply } => {
                    let _ = reply.send(handle_resolve(&ctx, outcome).await);
                }
            }
        }
        debug!(market_id = %ctx.market_id, "market worker stopped");
    });
    sender
}

fn store_err(err: sqlx::Error) -> EngineError {
    if is_serialization_conflict(&err) {
        EngineError::Conflict
    } else {
        err.into()
    }
}

async fn retry_backoff(attempt: u32) {
    let jitter: u64 = rand::thread_rng().gen_range(5..25);
    tokio::time::sleep(Duration::from_millis(jitter * (attempt as u64 + 1))).await;
}

// ============================================================================
// Submission
// ============================================================================

async fn handle_submit(ctx: &WorkerCtx, cmd: SubmitOrder) -> Result<SubmitAccepted, EngineError> {
    let started = Instant::now();

    // A matching idempotency key inside the retention window replays the
    // prior outcome verbatim; no new state is created.
    if let Some(key) = &cmd.idempotency_key {
        let retention = chrono::Duration::hours(ctx.limits.idempotency_retention_hours);
        if let Some(prior) = store::find_idempotent(&ctx.pool, cmd.user_id, key, retention)
            .await
            .map_err(store_err)?
        {
            let prior: SubmitAccepted = serde_json::from_value(prior)
                .map_err(|e| EngineError::Internal(format!("stored idempotent reply: {e}")))?;
            debug!(user_id = %cmd.user_id, %key, "idempotent resubmission replayed");
            return Ok(prior);
        }
    }

    let mut attempt = 0u32;
    let result = loop {
        match submit_once(ctx, &cmd).await {
            Err(EngineError::Conflict) if attempt < ctx.limits.store_retry_limit => {
                attempt += 1;
                warn!(
                    market_id = %ctx.market_id,
                    attempt,
                    "store conflict during submission, retrying with fresh reads"
                );
                retry_backoff(attempt).await;
            }
            other => break other,
        }
    };

    metrics::histogram!(metric_names::ORDER_MATCH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    metrics::counter!(metric_names::ORDERS_SUBMITTED_TOTAL).increment(1);
    result
}

async fn submit_once(ctx: &WorkerCtx, cmd: &SubmitOrder) -> Result<SubmitAccepted, EngineError> {
    let mut tx = ctx.pool.begin().await.map_err(store_err)?;

    // Fresh reads; the first failed check rejects with no side effects.
    let market = store::find_market(&mut *tx, cmd.market_id)
        .await
        .map_err(store_err)?
        .ok_or(EngineError::MarketNotTradable)?;

    store::ensure_user(&mut tx, cmd.user_id).await.map_err(store_err)?;
    let balance = store::balance_for_update(&mut tx, cmd.user_id, ctx.limits.initial_balance)
        .await
        .map_err(store_err)?;
    let position = store::find_position(&mut *tx, cmd.user_id, cmd.market_id, cmd.outcome)
        .await
        .map_err(store_err)?;
    let resting_buy_remaining =
        store::sum_resting_buy_remaining(&mut *tx, cmd.user_id, cmd.market_id, cmd.outcome)
            .await
            .map_err(store_err)?;
    let market_open_orders = store::count_open_orders_market(&mut *tx, cmd.market_id)
        .await
        .map_err(store_err)?;
    let user_open_orders = store::count_open_orders_user(&mut *tx, cmd.user_id)
        .await
        .map_err(store_err)?;

    let context = SubmitContext {
        market: market.clone(),
        funds: Funds {
            available: balance.available,
            locked: balance.locked,
        },
        position_quantity: position
            .as_ref()
            .map(|p| p.quantity)
            .unwrap_or(Decimal::ZERO),
        resting_buy_remaining,
        market_open_orders: market_open_orders as u32,
        user_open_orders: user_open_orders as u32,
    };
    let escrow = validator::validate(cmd, &context, &ctx.limits)?;

    let order_id = Uuid::new_v4();
    let created_at = Utc::now();
    // A price supplied on a MARKET order is ignored, not stored.
    let order_price = match cmd.order_type {
        OrderType::Limit => cmd.price,
        OrderType::Market => None,
    };

    // Escrow: a BUY moves cash into `locked`; a SELL's reservation is the
    // already-verified position.
    let mut funds: HashMap<Uuid, Funds> = HashMap::new();
    let mut taker_funds = context.funds;
    if cmd.side == OrderSide::Buy {
        taker_funds = ledger::reserve(taker_funds, escrow)
            .map_err(|e| EngineError::Internal(e.to_string()))?;
    }
    funds.insert(cmd.user_id, taker_funds);

    let mut holdings: HashMap<Uuid, Holding> = HashMap::new();
    holdings.insert(
        cmd.user_id,
        position.as_ref().map(Holding::from).unwrap_or_else(Holding::empty),
    );

    // Plan against the committed book; nothing in memory moves yet.
    let books = ctx.registry.books(cmd.market_id);
    let book = books.book(cmd.outcome);
    let plan = book.match_plan(cmd.user_id, cmd.side, order_price, cmd.quantity);

    // The taker row exists before any trade or event references it.
    let taker_row = Order {
        id: order_id,
        user_id: cmd.user_id,
        market_id: cmd.market_id,
        outcome: cmd.outcome,
        side: cmd.side,
        order_type: cmd.order_type,
        price: order_price,
        quantity: cmd.quantity,
        filled: Decimal::ZERO,
        status: OrderStatus::Open,
        created_at,
        updated_at: created_at,
    };
    store::create_order(&mut tx, &taker_row).await.map_err(store_err)?;
    store::append_order_event(
        &mut tx,
        order_id,
        OrderEventKind::Created,
        serde_json::json!({
            "side": cmd.side,
            "type": cmd.order_type,
            "price": order_price,
            "quantity": cmd.quantity,
        }),
    )
    .await
    .map_err(store_err)?;

    // The per-share price the taker's BUY escrow was reserved at; fills at
    // better maker prices refund the difference.
    let taker_reserved_price = match (cmd.side, cmd.order_type) {
        (OrderSide::Buy, OrderType::Limit) => cmd.price.ok_or_else(|| {
            EngineError::Internal("validated limit buy without a price".to_string())
        })?,
        (OrderSide::Buy, OrderType::Market) => ledger::market_buy_cap(),
        _ => Decimal::ZERO,
    };

    let mut trades: Vec<Trade> = Vec::with_capacity(plan.fills.len());
    for (index, fill) in plan.fills.iter().enumerate() {
        let maker = store::find_order_for_update(&mut tx, fill.maker_order_id)
            .await
            .map_err(store_err)?
            .ok_or_else(|| {
                EngineError::Internal(format!("maker order {} vanished", fill.maker_order_id))
            })?;

        load_funds(&mut tx, &mut funds, maker.user_id).await?;
        load_holding(&mut tx, &mut holdings, maker.user_id, cmd.market_id, cmd.outcome).await?;

        let (buyer_id, seller_id, buy_order_id, sell_order_id, buyer_reserved_price) =
            match cmd.side {
                OrderSide::Buy => (
                    cmd.user_id,
                    maker.user_id,
                    order_id,
                    maker.id,
                    taker_reserved_price,
                ),
                OrderSide::Sell => (maker.user_id, cmd.user_id, maker.id, order_id, fill.price),
            };

        // Buyer escrow is consumed, seller proceeds are realised now.
        let buyer_funds = funds
            .get_mut(&buyer_id)
            .expect("buyer funds loaded above");
        *buyer_funds =
            ledger::settle_buyer_fill(*buyer_funds, buyer_reserved_price, fill.price, fill.quantity)
                .map_err(|e| EngineError::Internal(e.to_string()))?;
        let seller_funds = funds
            .get_mut(&seller_id)
            .expect("seller funds loaded above");
        *seller_funds = ledger::settle_seller_fill(*seller_funds, fill.price, fill.quantity);

        let buyer_holding = holdings
            .get_mut(&buyer_id)
            .expect("buyer holding loaded above");
        *buyer_holding = ledger::apply_buy(*buyer_holding, fill.quantity, fill.price);
        let seller_holding = holdings
            .get_mut(&seller_id)
            .expect("seller holding loaded above");
        *seller_holding = ledger::apply_sell(*seller_holding, fill.quantity)
            .map_err(|e| EngineError::Internal(e.to_string()))?;

        let maker_filled = maker.filled + fill.quantity;
        let maker_status = if maker_filled >= maker.quantity {
            OrderStatus::Filled
        } else {
            OrderStatus::Partial
        };
        store::update_order_fill(&mut tx, maker.id, maker_filled, maker_status)
            .await
            .map_err(store_err)?;

        // Microsecond offsets give trades of one batch a total order that
        // survives equal wall-clock reads.
        let trade = Trade {
            id: Uuid::new_v4(),
            market_id: cmd.market_id,
            outcome: cmd.outcome,
            buy_order_id,
            sell_order_id,
            buyer_id,
            seller_id,
            price: fill.price,
            quantity: fill.quantity,
            created_at: created_at + chrono::Duration::microseconds(index as i64 + 1),
        };
        store::create_trade(&mut tx, &trade).await.map_err(store_err)?;

        let trade_payload = serde_json::json!({
            "trade_id": trade.id,
            "price": trade.price,
            "quantity": trade.quantity,
        });
        store::append_order_event(&mut tx, order_id, OrderEventKind::Trade, trade_payload.clone())
            .await
            .map_err(store_err)?;
        store::append_order_event(&mut tx, maker.id, OrderEventKind::Trade, trade_payload)
            .await
            .map_err(store_err)?;

        trades.push(trade);
    }

    // Matcher skipped the taker's own resting orders; record each skip on
    // the taker, never touching the maker.
    for skipped in &plan.self_skips {
        store::append_order_event(
            &mut tx,
            order_id,
            OrderEventKind::SelfTradePrevented,
            serde_json::json!({ "resting_order_id": skipped }),
        )
        .await
        .map_err(store_err)?;
    }

    // Residual handling: a LIMIT remainder rests; a MARKET remainder
    // cancels and returns its unused worst-case escrow.
    let filled = plan.filled_quantity();
    let remaining = cmd.quantity - filled;
    let taker_status = if remaining.is_zero() {
        OrderStatus::Filled
    } else {
        match cmd.order_type {
            OrderType::Limit => {
                if filled.is_zero() {
                    OrderStatus::Open
                } else {
                    OrderStatus::Partial
                }
            }
            OrderType::Market => {
                if cmd.side == OrderSide::Buy {
                    let unused = taker_reserved_price * remaining;
                    let taker_funds = funds
                        .get_mut(&cmd.user_id)
                        .expect("taker funds inserted above");
                    *taker_funds = ledger::release(*taker_funds, unused)
                        .map_err(|e| EngineError::Internal(e.to_string()))?;
                }
                store::append_order_event(
                    &mut tx,
                    order_id,
                    OrderEventKind::Cancelled,
                    serde_json::json!({ "reason": "INSUFFICIENT_LIQUIDITY" }),
                )
                .await
                .map_err(store_err)?;
                OrderStatus::Cancelled
            }
        }
    };
    store::update_order_fill(&mut tx, order_id, filled, taker_status)
        .await
        .map_err(store_err)?;

    for (user_id, user_funds) in &funds {
        store::update_balance(&mut tx, *user_id, user_funds.available, user_funds.locked)
            .await
            .map_err(store_err)?;
    }
    for (user_id, holding) in &holdings {
        store::upsert_position(
            &mut tx,
            *user_id,
            cmd.market_id,
            cmd.outcome,
            holding.quantity,
            holding.avg_price,
        )
        .await
        .map_err(store_err)?;
    }

    // The traded outcome's mark moves to the mean of its last ten prints;
    // the other outcome keeps its previous mark.
    let (mut yes_price, mut no_price) = (market.yes_price, market.no_price);
    if !trades.is_empty() {
        let prices = store::recent_trade_prices(&mut *tx, cmd.market_id, cmd.outcome, 10)
            .await
            .map_err(store_err)?;
        if let Some(mark) = mean_price(&prices) {
            match cmd.outcome {
                Outcome::Yes => yes_price = mark,
                Outcome::No => no_price = mark,
            }
            store::update_market_marks(&mut tx, cmd.market_id, yes_price, no_price)
                .await
                .map_err(store_err)?;
        }
    }

    let final_order = Order {
        filled,
        status: taker_status,
        ..taker_row
    };
    let accepted = SubmitAccepted {
        order: OrderResponse::from(final_order),
        trades: trades.iter().cloned().map(TradeResponse::from).collect(),
    };

    if let Some(key) = &cmd.idempotency_key {
        let stored = serde_json::to_value(&accepted)
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        store::save_idempotent(&mut tx, cmd.user_id, key, &stored)
            .await
            .map_err(store_err)?;
    }

    tx.commit().await.map_err(store_err)?;

    // Commit first, book second: a failed commit leaves memory untouched.
    book.apply_plan(&plan);
    if taker_status == OrderStatus::Open || taker_status == OrderStatus::Partial {
        if let Some(price) = order_price {
            book.insert(BookOrder {
                id: order_id,
                user_id: cmd.user_id,
                side: cmd.side,
                price,
                quantity: cmd.quantity,
                remaining,
                created_at,
            });
        }
    }

    metrics::counter!(metric_names::TRADES_EXECUTED_TOTAL).increment(trades.len() as u64);

    info!(
        market_id = %cmd.market_id,
        order_id = %order_id,
        status = %taker_status,
        %filled,
        trades = trades.len(),
        "order processed"
    );

    publish_submit_events(ctx, book, cmd, &accepted, &trades, &funds).await;

    Ok(accepted)
}

async fn publish_submit_events(
    ctx: &WorkerCtx,
    book: &Orderbook,
    cmd: &SubmitOrder,
    accepted: &SubmitAccepted,
    trades: &[Trade],
    funds: &HashMap<Uuid, Funds>,
) {
    ctx.events
        .publish(ExchangeEvent::OrderCreated {
            market_id: cmd.market_id,
            user_id: cmd.user_id,
            order: accepted.order.clone(),
        })
        .await;
    for trade in trades {
        ctx.events
            .publish(ExchangeEvent::TradeExecuted {
                market_id: trade.market_id,
                outcome: trade.outcome,
                trade: TradeResponse::from(trade.clone()),
                buyer_id: trade.buyer_id,
                seller_id: trade.seller_id,
            })
            .await;
    }
    ctx.events
        .publish(ExchangeEvent::OrderBookUpdated {
            market_id: cmd.market_id,
            outcome: cmd.outcome,
            snapshot: book.snapshot(50),
        })
        .await;
    for (user_id, user_funds) in funds {
        ctx.events
            .publish(ExchangeEvent::BalanceUpdated {
                user_id: *user_id,
                balance: BalanceResponse {
                    available: user_funds.available,
                    locked: user_funds.locked,
                    total: user_funds.total(),
                },
            })
            .await;
    }
}

async fn load_funds(
    tx: &mut store::Tx<'_>,
    funds: &mut HashMap<Uuid, Funds>,
    user_id: Uuid,
) -> Result<(), EngineError> {
    if !funds.contains_key(&user_id) {
        let balance = store::balance_for_update(tx, user_id, Decimal::ZERO)
            .await
            .map_err(store_err)?;
        funds.insert(
            user_id,
            Funds {
                available: balance.available,
                locked: balance.locked,
            },
        );
    }
    Ok(())
}

async fn load_holding(
    tx: &mut store::Tx<'_>,
    holdings: &mut HashMap<Uuid, Holding>,
    user_id: Uuid,
    market_id: Uuid,
    outcome: Outcome,
) -> Result<(), EngineError> {
    if !holdings.contains_key(&user_id) {
        let position = store::find_position(&mut **tx, user_id, market_id, outcome)
            .await
            .map_err(store_err)?;
        holdings.insert(
            user_id,
            position.as_ref().map(Holding::from).unwrap_or_else(Holding::empty),
        );
    }
    Ok(())
}

/// Arithmetic mean of recent trade prices, quantized to the canonical
/// 4dp; `None` when there are none.
fn mean_price(prices: &[Decimal]) -> Option<Decimal> {
    if prices.is_empty() {
        return None;
    }
    let sum: Decimal = prices.iter().copied().sum();
    Some(crate::decimal::quantize(sum / Decimal::from(prices.len())))
}

// ============================================================================
// Cancellation
// ============================================================================

async fn handle_cancel(
    ctx: &WorkerCtx,
    order_id: Uuid,
    user_id: Uuid,
) -> Result<CancelAccepted, EngineError> {
    let mut attempt = 0u32;
    let result = loop {
        match cancel_once(ctx, order_id, user_id).await {
            Err(EngineError::Conflict) if attempt < ctx.limits.store_retry_limit => {
                attempt += 1;
                retry_backoff(attempt).await;
            }
            other => break other,
        }
    };
    if result.is_ok() {
        metrics::counter!(metric_names::ORDERS_CANCELLED_TOTAL).increment(1);
    }
    result
}

async fn cancel_once(
    ctx: &WorkerCtx,
    order_id: Uuid,
    user_id: Uuid,
) -> Result<CancelAccepted, EngineError> {
    let mut tx = ctx.pool.begin().await.map_err(store_err)?;

    let order = store::find_order_for_update(&mut tx, order_id)
        .await
        .map_err(store_err)?
        .ok_or_else(|| EngineError::NotFound(format!("order {order_id}")))?;
    if order.user_id != user_id {
        return Err(EngineError::Forbidden);
    }
    if order.status.is_terminal() {
        return Err(EngineError::NotCancellable);
    }

    // A BUY's unfilled reservation returns to available funds.
    let mut released_funds = None;
    if order.side == OrderSide::Buy {
        let price = order
            .price
            .ok_or_else(|| EngineError::Internal("resting buy without a price".to_string()))?;
        let release = ledger::open_buy_reservation(price, order.quantity, order.filled);
        let balance = store::balance_for_update(&mut tx, user_id, Decimal::ZERO)
            .await
            .map_err(store_err)?;
        let after = ledger::release(
            Funds {
                available: balance.available,
                locked: balance.locked,
            },
            release,
        )
        .map_err(|e| EngineError::Internal(e.to_string()))?;
        store::update_balance(&mut tx, user_id, after.available, after.locked)
            .await
            .map_err(store_err)?;
        released_funds = Some(after);
    }

    store::update_order_status(&mut tx, order_id, OrderStatus::Cancelled)
        .await
        .map_err(store_err)?;
    store::append_order_event(
        &mut tx,
        order_id,
        OrderEventKind::Cancelled,
        serde_json::json!({ "reason": "USER_REQUEST" }),
    )
    .await
    .map_err(store_err)?;

    tx.commit().await.map_err(store_err)?;

    let market_id = order.market_id;
    let outcome = order.outcome;
    let books = ctx.registry.books(market_id);
    let book = books.book(outcome);
    // No-op when the order never rested (e.g. cancelled between fills).
    book.remove(order_id);

    let cancelled = Order {
        status: OrderStatus::Cancelled,
        ..order
    };
    let response = OrderResponse::from(cancelled);

    info!(order_id = %order_id, user_id = %user_id, "order cancelled");

    ctx.events
        .publish(ExchangeEvent::OrderCancelled {
            market_id,
            user_id,
            order: response.clone(),
        })
        .await;
    ctx.events
        .publish(ExchangeEvent::OrderBookUpdated {
            market_id,
            outcome,
            snapshot: book.snapshot(50),
        })
        .await;
    if let Some(after) = released_funds {
        ctx.events
            .publish(ExchangeEvent::BalanceUpdated {
                user_id,
                balance: BalanceResponse {
                    available: after.available,
                    locked: after.locked,
                    total: after.total(),
                },
            })
            .await;
    }

    Ok(CancelAccepted { order: response })
}

// ============================================================================
// Resolution
// ============================================================================

async fn handle_resolve(
    ctx: &WorkerCtx,
    outcome: Outcome,
) -> Result<SettlementReport, EngineError> {
    match SettlementService::settle_market(&ctx.pool, ctx.market_id).await {
        Ok(report) => {
            finish_settlement(ctx, &report).await;
            Ok(report)
        }
        Err(err) => {
            // The RESOLVED flip is already committed; keep retrying in the
            // background and report the market as settlement-pending.
            error!(
                market_id = %ctx.market_id,
                "settlement failed, scheduling retries: {err}"
            );
            spawn_settlement_retry(ctx.clone());
            Ok(SettlementReport {
                market_id: ctx.market_id,
                outcome,
                status: SettlementStatus::Pending,
                winners_paid: 0,
                total_payout: Decimal::ZERO,
                orders_cancelled: 0,
                escrow_released: Decimal::ZERO,
                balances: Vec::new(),
            })
        }
    }
}

async fn finish_settlement(ctx: &WorkerCtx, report: &SettlementReport) {
    ctx.registry.drop_market(report.market_id);
    metrics::counter!(metric_names::SETTLEMENTS_TOTAL).increment(1);

    ctx.events
        .publish(ExchangeEvent::MarketResolved {
            market_id: report.market_id,
            outcome: report.outcome,
        })
        .await;
    for (user_id, balance) in &report.balances {
        ctx.events
            .publish(ExchangeEvent::BalanceUpdated {
                user_id: *user_id,
                balance: balance.clone(),
            })
            .await;
    }
}

fn spawn_settlement_retry(ctx: WorkerCtx) {
    tokio::spawn(async move {
        let mut delay = Duration::from_secs(5);
        loop {
            tokio::time::sleep(delay).await;
            match SettlementService::settle_market(&ctx.pool, ctx.market_id).await {
                Ok(report) => {
                    info!(market_id = %ctx.market_id, "deferred settlement completed");
                    finish_settlement(&ctx, &report).await;
                    break;
                }
                Err(err) => {
                    warn!(market_id = %ctx.market_id, "settlement retry failed: {err}");
                    delay = (delay * 2).min(Duration::from_secs(300));
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_mean_price() {
        assert_eq!(mean_price(&[]), None);
        assert_eq!(mean_price(&[dec!(0.40)]), Some(dec!(0.40)));
        assert_eq!(
            mean_price(&[dec!(0.40), dec!(0.50), dec!(0.60)]),
            Some(dec!(0.50))
        );
    }

    #[test]
    fn test_mean_price_is_quantized() {
        // 1/3 would otherwise carry maximum scale.
        let mark = mean_price(&[dec!(0.10), dec!(0.10), dec!(0.20)]).unwrap();
        assert_eq!(mark, dec!(0.1333));
    }

    #[test]
    fn test_mean_price_stays_in_unit_interval() {
        let prices: Vec<Decimal> = (1..=10).map(|i| Decimal::new(i, 2)).collect();
        let mark = mean_price(&prices).unwrap();
        assert!(mark > Decimal::ZERO && mark < Decimal::ONE);
    }

    // The full submit/cancel/resolve pipelines run inside store
    // transactions; integration coverage requires a database connection.
}
