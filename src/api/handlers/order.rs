//! Order API Handlers
//!
//! The HTTP boundary hands typed commands to the engine; every rejection
//! surfaces as a stable error code from the engine taxonomy.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Extension, Json,
};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::auth::middleware::AuthUser;
use crate::db::store;
use crate::error::EngineError;
use crate::models::{CreateOrderRequest, OrderEvent, OrderResponse};
use crate::services::matching::{CancelAccepted, SubmitAccepted, SubmitOrder};
use crate::utils::response::ApiResponse;
use crate::AppState;

/// Create a new order
/// POST /orders
pub async fn create_order(
    State(state): State<Arc<AppState>>,
    Extension(auth_user): Extension<AuthUser>,
    headers: HeaderMap,
    Json(req): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<ApiResponse<SubmitAccepted>>), EngineError> {
    req.validate()
        .map_err(|e| EngineError::InvalidInput(e.to_string()))?;

    // The header wins over the body field when both are present.
    let idempotency_key = headers
        .get("Idempotency-Key")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
        .or(req.idempotency_key);

    let accepted = state
        .engine
        .submit_order(
            SubmitOrder {
                user_id: auth_user.user_id,
                market_id: req.market_id,
                outcome: req.outcome,
                side: req.side,
                order_type: req.order_type,
                price: req.price,
                quantity: req.quantity,
                idempotency_key,
            },
            None,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(ApiResponse::success(accepted))))
}

/// Cancel an order
/// DELETE /orders/:order_id
pub async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Extension(auth_user): Extension<AuthUser>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<ApiResponse<CancelAccepted>>, EngineError> {
    let cancelled = state
        .engine
        .cancel_order(order_id, auth_user.user_id)
        .await?;
    Ok(Json(ApiResponse::success(cancelled)))
}

/// Append-only event log for one order (owner or admin only)
/// GET /orders/:order_id/events
pub async fn get_order_events(
    State(state): State<Arc<AppState>>,
    Extension(auth_user): Extension<AuthUser>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<OrderEvent>>>, EngineError> {
    let order = store::find_order(&state.db.pool, order_id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("order {order_id}")))?;
    if order.user_id != auth_user.user_id && !auth_user.is_admin() {
        return Err(EngineError::Forbidden);
    }
    let events = store::list_order_events(&state.db.pool, order_id).await?;
    Ok(Json(ApiResponse::success(events)))
}

/// Get one order (owner or admin only)
/// GET /orders/:order_id
pub async fn get_order(
    State(state): State<Arc<AppState>>,
    Extension(auth_user): Extension<AuthUser>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<ApiResponse<OrderResponse>>, EngineError> {
    let order = store::find_order(&state.db.pool, order_id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("order {order_id}")))?;
    if order.user_id != auth_user.user_id && !auth_user.is_admin() {
        return Err(EngineError::Forbidden);
    }
    Ok(Json(ApiResponse::success(OrderResponse::from(order))))
}
