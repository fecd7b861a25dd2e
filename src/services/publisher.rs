//! Outbound price publication for external consumers
//!
//! Every persisted price is published as JSON on a Redis pub/sub channel.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{info, trace};

use crate::error::PublishError;
use crate::models::event::PriceEvent;

pub const DEFAULT_PRICE_CHANNEL: &str = "prise:prices";

#[async_trait]
pub trait PricePublisher: Send + Sync {
    async fn publish(&self, event: &PriceEvent) -> Result<(), PublishError>;
}

/// JSON payload of a price event
pub fn encode_event(event: &PriceEvent) -> Result<String, PublishError> {
    Ok(serde_json::to_string(event)?)
}

/// Publishes price events on a Redis channel
#[derive(Clone)]
pub struct RedisPricePublisher {
    connection: ConnectionManager,
    channel: String,
}

impl RedisPricePublisher {
    /// Connects to `url`. The connection manager reconnects on its own after
    /// the initial connection succeeds.
    pub async fn connect(url: &str, channel: impl Into<String>) -> Result<Self, PublishError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_connection_manager().await?;
        let channel = channel.into();
        info!(channel = %channel, "Connected price publisher to Redis");
        Ok(Self { connection, channel })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl PricePublisher for RedisPricePublisher {
    async fn publish(&self, event: &PriceEvent) -> Result<(), PublishError> {
        let payload = encode_event(event)?;
        let mut connection = self.connection.clone();
        // No subscribers is not a failure
        let receivers: i64 = connection.publish(&self.channel, payload).await?;
        trace!(
            channel = %self.channel,
            receivers = receivers,
            time = event.time,
            tx_id = event.tx_id,
            tx_swap_idx = event.tx_swap_idx,
            "Published price event"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> PriceEvent {
        PriceEvent {
            asset_id: 2,
            quote_asset_id: 1,
            provider: 3,
            time: 1_700_000_000,
            tx_id: 9,
            tx_swap_idx: 0,
            price: 0.5,
            amount1: "1000000".to_string(),
            amount2: "2000000".to_string(),
            operation: 0,
        }
    }

    #[test]
    fn test_event_payload() {
        let payload = encode_event(&event()).unwrap();
        let decoded: PriceEvent = serde_json::from_str(&payload).unwrap();
        assert_eq!(decoded, event());

        let raw: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(raw["amount1"], "1000000");
        assert_eq!(raw["tx_swap_idx"], 0);
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_url() {
        let result = RedisPricePublisher::connect("not-a-redis-url", DEFAULT_PRICE_CHANNEL).await;
        assert!(matches!(result, Err(PublishError::Redis(_))));
    }

    #[tokio::test]
    #[ignore = "requires TEST_REDIS_URL"]
    async fn test_subscriber_receives_published_price() {
        use futures_util::StreamExt;

        let url = std::env::var("TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let channel = format!("prise:test:{}", chrono::Utc::now().timestamp_micros());

        let client = redis::Client::open(url.as_str()).unwrap();
        let mut pubsub = client.get_async_pubsub().await.unwrap();
        pubsub.subscribe(&channel).await.unwrap();

        let publisher = RedisPricePublisher::connect(&url, channel.clone()).await.unwrap();
        publisher.publish(&event()).await.unwrap();

        let message = pubsub.on_message().next().await.unwrap();
        let payload: String = message.get_payload().unwrap();
        assert_eq!(message.get_channel_name(), channel);
        assert_eq!(serde_json::from_str::<PriceEvent>(&payload).unwrap(), event());
    }
}
