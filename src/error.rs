//! Engine error taxonomy.
//!
//! Every rejection the core can surface maps to a stable code and a
//! documented HTTP status. A submission either commits entirely or leaves
//! no trace; these errors are the only externally visible failure states.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::utils::response::ApiResponse;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("market is not tradable")]
    MarketNotTradable,

    #[error("insufficient funds: required escrow {required}, available {available}")]
    InsufficientFunds {
        required: rust_decimal::Decimal,
        available: rust_decimal::Decimal,
    },

    #[error("insufficient shares: selling {requested}, owned {owned}")]
    InsufficientShares {
        requested: rust_decimal::Decimal,
        owned: rust_decimal::Decimal,
    },

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden")]
    Forbidden,

    #[error("order is not cancellable")]
    NotCancellable,

    #[error("store conflict: retries exhausted")]
    Conflict,

    #[error("queue admission deadline elapsed")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable machine-readable code, as documented in the API contract.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidInput(_) => "INVALID_INPUT",
            EngineError::MarketNotTradable => "MARKET_NOT_TRADABLE",
            EngineError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            EngineError::InsufficientShares { .. } => "INSUFFICIENT_SHARES",
            EngineError::LimitExceeded(_) => "LIMIT_EXCEEDED",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::Forbidden => "FORBIDDEN",
            EngineError::NotCancellable => "NOT_CANCELLABLE",
            EngineError::Conflict => "CONFLICT",
            EngineError::Timeout => "TIMEOUT",
            EngineError::Internal(_) => "INTERNAL",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            EngineError::InvalidInput(_)
            | EngineError::MarketNotTradable
            | EngineError::InsufficientFunds { .. }
            | EngineError::InsufficientShares { .. }
            | EngineError::LimitExceeded(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Forbidden => StatusCode::FORBIDDEN,
            EngineError::NotCancellable | EngineError::Conflict => StatusCode::CONFLICT,
            EngineError::Timeout => StatusCode::REQUEST_TIMEOUT,
            EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => EngineError::NotFound("row not found".to_string()),
            other => EngineError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("internal engine error: {}", self);
        }
        let body = ApiResponse::<()>::error(self.code(), &self.to_string());
        (status, Json(body)).into_response()
    }
}

/// True when the store reported a serialization / deadlock conflict that a
/// fresh-read retry can resolve (SQLSTATE 40001 and 40P01).
pub fn is_serialization_conflict(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("40001") | Some("40P01")),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(EngineError::MarketNotTradable.code(), "MARKET_NOT_TRADABLE");
        assert_eq!(EngineError::Conflict.code(), "CONFLICT");
        assert_eq!(EngineError::Timeout.code(), "TIMEOUT");
    }

    #[test]
    fn statuses_match_contract() {
        assert_eq!(EngineError::NotCancellable.status(), StatusCode::CONFLICT);
        assert_eq!(EngineError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            EngineError::NotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(EngineError::Timeout.status(), StatusCode::REQUEST_TIMEOUT);
    }
}
