//! Account API Handlers
//!
//! Read models over the authoritative balance, position, order and trade
//! tables. Nothing here mutates state.

use axum::{
    extract::{Query, State},
    Extension, Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::middleware::AuthUser;
use crate::db::store;
use crate::error::EngineError;
use crate::models::{
    BalanceResponse, OrderResponse, Outcome, PositionResponse, TradeResponse, UserProfile,
};
use crate::utils::response::ApiResponse;
use crate::AppState;

/// GET /account/profile
pub async fn get_profile(
    State(state): State<Arc<AppState>>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<ApiResponse<UserProfile>>, EngineError> {
    // Materialize the user row lazily; identity itself is owned by auth.
    let user = match store::find_user(&state.db.pool, auth_user.user_id).await? {
        Some(user) => user,
        None => {
            let mut tx = state.db.pool.begin().await.map_err(EngineError::from)?;
            store::ensure_user(&mut tx, auth_user.user_id).await?;
            tx.commit().await.map_err(EngineError::from)?;
            store::find_user(&state.db.pool, auth_user.user_id)
                .await?
                .ok_or_else(|| EngineError::Internal("user row vanished".to_string()))?
        }
    };
    Ok(Json(ApiResponse::success(UserProfile::from(user))))
}

/// GET /account/balance
pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<ApiResponse<BalanceResponse>>, EngineError> {
    let response = match store::find_balance(&state.db.pool, auth_user.user_id).await? {
        Some(balance) => BalanceResponse::from(balance),
        // First-ever touch materializes this exact row on the first order.
        None => BalanceResponse {
            available: state.config.initial_balance,
            locked: Decimal::ZERO,
            total: state.config.initial_balance,
        },
    };
    Ok(Json(ApiResponse::success(response)))
}

/// GET /account/positions
pub async fn get_positions(
    State(state): State<Arc<AppState>>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<ApiResponse<Vec<PositionResponse>>>, EngineError> {
    let positions = store::list_positions_for_user(&state.db.pool, auth_user.user_id).await?;
    let response = positions.into_iter().map(PositionResponse::from).collect();
    Ok(Json(ApiResponse::success(response)))
}

#[derive(Debug, Serialize)]
pub struct PortfolioPosition {
    pub market_id: Uuid,
    pub outcome: Outcome,
    pub quantity: Decimal,
    pub avg_price: Decimal,
    /// Last mark for this outcome, when the market still exists.
    pub mark_price: Option<Decimal>,
    pub mark_value: Option<Decimal>,
}

#[derive(Debug, Serialize)]
pub struct PortfolioResponse {
    pub balance: BalanceResponse,
    pub positions: Vec<PortfolioPosition>,
    /// Cash total plus marked position value.
    pub portfolio_value: Decimal,
}

/// GET /account/portfolio
pub async fn get_portfolio(
    State(state): State<Arc<AppState>>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<ApiResponse<PortfolioResponse>>, EngineError> {
    let balance = match store::find_balance(&state.db.pool, auth_user.user_id).await? {
        Some(balance) => BalanceResponse::from(balance),
        None => BalanceResponse {
            available: state.config.initial_balance,
            locked: Decimal::ZERO,
            total: state.config.initial_balance,
        },
    };

    let positions = store::list_positions_for_user(&state.db.pool, auth_user.user_id).await?;

    let market_ids: Vec<Uuid> = positions.iter().map(|p| p.market_id).collect();
    let marks: HashMap<Uuid, (Decimal, Decimal)> = if market_ids.is_empty() {
        HashMap::new()
    } else {
        sqlx::query_as::<_, (Uuid, Decimal, Decimal)>(
            "SELECT id, yes_price, no_price FROM markets WHERE id = ANY($1)",
        )
        .bind(&market_ids)
        .fetch_all(&state.db.pool)
        .await
        .map_err(EngineError::from)?
        .into_iter()
        .map(|(id, yes, no)| (id, (yes, no)))
        .collect()
    };

    let mut portfolio_value = balance.total;
    let positions = positions
        .into_iter()
        .map(|p| {
            let mark_price = marks.get(&p.market_id).map(|(yes, no)| match p.outcome {
                Outcome::Yes => *yes,
                Outcome::No => *no,
            });
            let mark_value = mark_price.map(|mark| mark * p.quantity);
            if let Some(value) = mark_value {
                portfolio_value += value;
            }
            PortfolioPosition {
                market_id: p.market_id,
                outcome: p.outcome,
                quantity: p.quantity,
                avg_price: p.avg_price,
                mark_price,
                mark_value,
            }
        })
        .collect();

    Ok(Json(ApiResponse::success(PortfolioResponse {
        balance,
        positions,
        portfolio_value,
    })))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

/// GET /account/orders
pub async fn get_orders(
    State(state): State<Arc<AppState>>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<ApiResponse<Vec<OrderResponse>>>, EngineError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let orders = store::list_user_orders(&state.db.pool, auth_user.user_id, limit).await?;
    let response = orders.into_iter().map(OrderResponse::from).collect();
    Ok(Json(ApiResponse::success(response)))
}

/// GET /account/trades
pub async fn get_trades(
    State(state): State<Arc<AppState>>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<ApiResponse<Vec<TradeResponse>>>, EngineError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let trades = store::list_user_trades(&state.db.pool, auth_user.user_id, limit).await?;
    let response = trades.into_iter().map(TradeResponse::from).collect();
    Ok(Json(ApiResponse::success(response)))
}
