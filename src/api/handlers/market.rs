//! Market API Handlers
//!
//! Catalog reads, the public orderbook/trade feeds, and the admin
//! resolution entry point that hands settlement to the engine.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::middleware::AuthUser;
use crate::db::store;
use crate::error::EngineError;
use crate::models::{
    CreateMarketRequest, Market, MarketResponse, MarketStatus, Outcome, ResolveMarketRequest,
    TradeResponse,
};
use crate::services::matching::BookSnapshot;
use crate::services::settlement::{SettlementReport, SettlementStatus};
use crate::utils::response::ApiResponse;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ListMarketsQuery {
    pub status: Option<MarketStatus>,
}

/// GET /markets
pub async fn list_markets(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListMarketsQuery>,
) -> Result<Json<ApiResponse<Vec<MarketResponse>>>, EngineError> {
    let markets = store::list_markets(&state.db.pool, query.status).await?;
    let response = markets.into_iter().map(MarketResponse::from).collect();
    Ok(Json(ApiResponse::success(response)))
}

/// GET /markets/:market_id
pub async fn get_market(
    State(state): State<Arc<AppState>>,
    Path(market_id): Path<Uuid>,
) -> Result<Json<ApiResponse<MarketResponse>>, EngineError> {
    let market = store::find_market(&state.db.pool, market_id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("market {market_id}")))?;
    Ok(Json(ApiResponse::success(MarketResponse::from(market))))
}

/// Admin: create a market, OPEN with both marks seeded at 0.5.
/// POST /markets
pub async fn create_market(
    State(state): State<Arc<AppState>>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateMarketRequest>,
) -> Result<(StatusCode, Json<ApiResponse<MarketResponse>>), EngineError> {
    if !auth_user.is_admin() {
        return Err(EngineError::Forbidden);
    }
    if req.slug.is_empty() || req.question.is_empty() {
        return Err(EngineError::InvalidInput(
            "slug and question are required".to_string(),
        ));
    }
    if store::find_market_by_slug(&state.db.pool, &req.slug)
        .await?
        .is_some()
    {
        return Err(EngineError::InvalidInput(format!(
            "slug {} is already taken",
            req.slug
        )));
    }

    let now = Utc::now();
    let market = Market {
        id: Uuid::new_v4(),
        slug: req.slug,
        question: req.question,
        category: req.category,
        status: MarketStatus::Open,
        outcome: None,
        close_time: req.close_time,
        resolve_time: None,
        resolution_source: None,
        yes_price: Decimal::new(5, 1),
        no_price: Decimal::new(5, 1),
        created_at: now,
        updated_at: now,
    };

    let mut tx = state.db.pool.begin().await.map_err(EngineError::from)?;
    store::create_market(&mut tx, &market).await?;
    tx.commit().await.map_err(EngineError::from)?;

    tracing::info!(market_id = %market.id, slug = %market.slug, "market created");
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(MarketResponse::from(market))),
    ))
}

#[derive(Debug, Serialize)]
pub struct ResolveMarketResponse {
    pub market: MarketResponse,
    pub settlement: SettlementReport,
    /// "settled" or "resolved; settlement pending"
    pub detail: &'static str,
}

/// Admin: resolve a market, then settle it.
/// POST /markets/:market_id/resolve
pub async fn resolve_market(
    State(state): State<Arc<AppState>>,
    Extension(auth_user): Extension<AuthUser>,
    Path(market_id): Path<Uuid>,
    Json(req): Json<ResolveMarketRequest>,
) -> Result<Json<ApiResponse<ResolveMarketResponse>>, EngineError> {
    if !auth_user.is_admin() {
        return Err(EngineError::Forbidden);
    }

    let market = store::find_market(&state.db.pool, market_id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("market {market_id}")))?;

    match (market.status, market.outcome) {
        // Re-resolution with the same outcome re-runs idempotent settlement.
        (MarketStatus::Resolved, Some(existing)) if existing == req.outcome => {}
        (MarketStatus::Resolved, _) => {
            return Err(EngineError::InvalidInput(
                "market is already resolved with a different outcome".to_string(),
            ));
        }
        _ => {
            let mut tx = state.db.pool.begin().await.map_err(EngineError::from)?;
            let flipped =
                store::mark_market_resolved(&mut tx, market_id, req.outcome, &req.resolution_source)
                    .await?;
            if !flipped {
                return Err(EngineError::Conflict);
            }
            tx.commit().await.map_err(EngineError::from)?;
            tracing::info!(
                market_id = %market_id,
                outcome = %req.outcome,
                source = %req.resolution_source,
                "market resolved"
            );
        }
    }

    // The RESOLVED flip is durable; settlement pays out winners, cancels
    // resting orders and purges the books.
    let settlement = state.engine.on_market_resolved(market_id, req.outcome).await?;
    let detail = match settlement.status {
        SettlementStatus::Pending => "resolved; settlement pending",
        _ => "settled",
    };

    let market = store::find_market(&state.db.pool, market_id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("market {market_id}")))?;

    Ok(Json(ApiResponse::success(ResolveMarketResponse {
        market: MarketResponse::from(market),
        settlement,
        detail,
    })))
}

#[derive(Debug, Deserialize)]
pub struct OrderbookQuery {
    pub outcome: Option<Outcome>,
    pub depth: Option<usize>,
}

/// GET /markets/:market_id/orderbook
pub async fn get_orderbook(
    State(state): State<Arc<AppState>>,
    Path(market_id): Path<Uuid>,
    Query(query): Query<OrderbookQuery>,
) -> Result<Json<ApiResponse<BookSnapshot>>, EngineError> {
    // Verify the market exists so unknown ids 404 instead of returning an
    // empty lazily created book.
    store::find_market(&state.db.pool, market_id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("market {market_id}")))?;

    let outcome = query.outcome.unwrap_or(Outcome::Yes);
    let depth = query.depth.unwrap_or(50).min(200);
    let snapshot = state.engine.orderbook(market_id, outcome, depth);
    Ok(Json(ApiResponse::success(snapshot)))
}

#[derive(Debug, Deserialize)]
pub struct TradesQuery {
    pub limit: Option<i64>,
}

/// GET /markets/:market_id/trades
pub async fn get_trades(
    State(state): State<Arc<AppState>>,
    Path(market_id): Path<Uuid>,
    Query(query): Query<TradesQuery>,
) -> Result<Json<ApiResponse<Vec<TradeResponse>>>, EngineError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let trades = store::list_trades(&state.db.pool, market_id, limit).await?;
    let response = trades.into_iter().map(TradeResponse::from).collect();
    Ok(Json(ApiResponse::success(response)))
}
