//! Event emission.
//!
//! The engine publishes events strictly after a successful commit, from
//! the market's owning task, so per-market delivery order is commit order.
//! Events fan out on two paths: an in-process broadcast channel feeding
//! the WebSocket layer, and Redis pub/sub for external consumers. Each
//! envelope carries `{event_id, commit_ts}` so at-least-once delivery can
//! be deduplicated downstream. A missing Redis degrades to broadcast-only.

use redis::aio::ConnectionManager;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{BalanceResponse, OrderResponse, Outcome, TradeResponse};
use crate::services::matching::BookSnapshot;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExchangeEvent {
    OrderCreated {
        market_id: Uuid,
        user_id: Uuid,
        order: OrderResponse,
    },
    OrderCancelled {
        market_id: Uuid,
        user_id: Uuid,
        order: OrderResponse,
    },
    TradeExecuted {
        market_id: Uuid,
        outcome: Outcome,
        trade: TradeResponse,
        buyer_id: Uuid,
        seller_id: Uuid,
    },
    OrderBookUpdated {
        market_id: Uuid,
        outcome: Outcome,
        snapshot: BookSnapshot,
    },
    MarketResolved {
        market_id: Uuid,
        outcome: Outcome,
    },
    BalanceUpdated {
        user_id: Uuid,
        balance: BalanceResponse,
    },
}

impl ExchangeEvent {
    /// The bus channels this event lands on.
    pub fn channels(&self) -> Vec<String> {
        match self {
            ExchangeEvent::OrderCreated { user_id, .. }
            | ExchangeEvent::OrderCancelled { user_id, .. } => {
                vec![format!("user:{user_id}")]
            }
            ExchangeEvent::TradeExecuted {
                market_id,
                buyer_id,
                seller_id,
                ..
            } => vec![
                format!("trades:{market_id}"),
                format!("user:{buyer_id}"),
                format!("user:{seller_id}"),
            ],
            ExchangeEvent::OrderBookUpdated {
                market_id, outcome, ..
            } => vec![format!("orderbook:{market_id}:{outcome}")],
            ExchangeEvent::MarketResolved { market_id, .. } => {
                vec![format!("markets:{market_id}")]
            }
            ExchangeEvent::BalanceUpdated { user_id, .. } => vec![format!("user:{user_id}")],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub commit_ts: i64,
    #[serde(flatten)]
    pub event: ExchangeEvent,
}

pub struct EventSink {
    broadcast: broadcast::Sender<EventEnvelope>,
    redis: Option<ConnectionManager>,
}

impl EventSink {
    pub fn new(redis: Option<ConnectionManager>) -> Self {
        let (broadcast, _) = broadcast::channel(4096);
        Self { broadcast, redis }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.broadcast.subscribe()
    }

    /// Publish one committed event. Never fails the caller: a full
    /// broadcast channel or an unreachable Redis is logged and dropped,
    /// at-least-once semantics come from consumers replaying the store.
    pub async fn publish(&self, event: ExchangeEvent) {
        let envelope = EventEnvelope {
            event_id: Uuid::new_v4(),
            commit_ts: chrono::Utc::now().timestamp_millis(),
            event,
        };

        // In-process fan-out; an error only means no subscribers.
        let _ = self.broadcast.send(envelope.clone());

        if let Some(redis) = &self.redis {
            let payload = match serde_json::to_string(&envelope) {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::error!("failed to serialize event envelope: {err}");
                    return;
                }
            };
            let mut conn = redis.clone();
            for channel in envelope.event.channels() {
                let result: Result<i64, redis::RedisError> = redis::cmd("PUBLISH")
                    .arg(&channel)
                    .arg(&payload)
                    .query_async(&mut conn)
                    .await;
                if let Err(err) = result {
                    tracing::warn!("failed to publish event to {channel}: {err}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_channel_names() {
        let market_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let event = ExchangeEvent::BalanceUpdated {
            user_id,
            balance: BalanceResponse {
                available: dec!(100),
                locked: dec!(0),
                total: dec!(100),
            },
        };
        assert_eq!(event.channels(), vec![format!("user:{user_id}")]);

        let resolved = ExchangeEvent::MarketResolved {
            market_id,
            outcome: Outcome::Yes,
        };
        assert_eq!(resolved.channels(), vec![format!("markets:{market_id}")]);
    }

    #[tokio::test]
    async fn test_broadcast_without_redis() {
        let sink = EventSink::new(None);
        let mut rx = sink.subscribe();

        let market_id = Uuid::new_v4();
        sink.publish(ExchangeEvent::MarketResolved {
            market_id,
            outcome: Outcome::No,
        })
        .await;

        let envelope = rx.recv().await.unwrap();
        assert!(matches!(
            envelope.event,
            ExchangeEvent::MarketResolved { market_id: m, .. } if m == market_id
        ));
    }
}
