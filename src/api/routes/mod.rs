use axum::{
    middleware as axum_middleware,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;

use crate::api::handlers;
use crate::auth::middleware::auth_middleware;
use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    // Public routes (no auth required)
    let public_routes = Router::new()
        .route("/markets", get(handlers::market::list_markets))
        .route("/markets/:market_id", get(handlers::market::get_market))
        .route("/markets/:market_id/orderbook", get(handlers::market::get_orderbook))
        .route("/markets/:market_id/trades", get(handlers::market::get_trades));

    // Protected routes (auth required)
    let protected_routes = Router::new()
        // Orders
        .route("/orders", post(handlers::order::create_order))
        .route("/orders/:order_id", get(handlers::order::get_order))
        .route("/orders/:order_id/events", get(handlers::order::get_order_events))
        .route("/orders/:order_id", delete(handlers::order::cancel_order))
        // Account
        .route("/account/profile", get(handlers::account::get_profile))
        .route("/account/balance", get(handlers::account::get_balance))
        .route("/account/positions", get(handlers::account::get_positions))
        .route("/account/portfolio", get(handlers::account::get_portfolio))
        .route("/account/orders", get(handlers::account::get_orders))
        .route("/account/trades", get(handlers::account::get_trades))
        // Admin
        .route("/admin/markets", post(handlers::market::create_market))
        .route("/admin/markets/:market_id/resolve", post(handlers::market::resolve_market))
        .layer(axum_middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
}
