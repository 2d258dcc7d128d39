use axum::{routing::get, Router};
use std::sync::Arc;

use crate::AppState;

pub fn create_router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new().route("/", get(super::handler::ws_upgrade))
}
