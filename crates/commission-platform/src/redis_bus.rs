use anyhow::{Context, Result};
use redis::aio::PubSub;
use redis::{AsyncCommands, Client, Msg};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Pub/sub link between the commission service and the ops worker.
#[derive(Clone)]
pub struct RedisBus {
    client: Client,
}

impl RedisBus {
    pub fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).context("invalid REDIS_URL")?;
        Ok(Self { client })
    }

    /// Publishes `payload` as JSON and returns how many subscribers received it.
    pub async fn publish_json<T: Serialize>(&self, channel: &str, payload: &T) -> Result<i64> {
        let serialized = serde_json::to_string(payload)
            .with_context(|| format!("failed to encode message for {channel}"))?;
        let mut connection = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("failed to open redis connection")?;
        let receivers: i64 = connection
            .publish(channel, serialized)
            .await
            .with_context(|| format!("failed to publish to {channel}"))?;
        Ok(receivers)
    }

    pub async fn subscribe(&self, channel: &str) -> Result<PubSub> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("failed to open redis pubsub connection")?;
        pubsub
            .subscribe(channel)
            .await
            .with_context(|| format!("failed to subscribe to {channel}"))?;
        Ok(pubsub)
    }
}

/// Decodes a message received from [`RedisBus::subscribe`].
pub fn decode_message<T: DeserializeOwned>(msg: &Msg) -> Result<T> {
    let payload: String = msg.get_payload().context("message payload is not text")?;
    decode_json(msg.get_channel_name(), &payload)
}

pub fn decode_json<T: DeserializeOwned>(channel: &str, payload: &str) -> Result<T> {
    serde_json::from_str(payload).with_context(|| format!("malformed message on {channel}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::StatsRefreshRequested;

    #[test]
    fn malformed_payload_names_the_channel() {
        let err = decode_json::<StatsRefreshRequested>("commissions.stats", "{\"beneficiary_id\":1}")
            .unwrap_err();
        assert!(format!("{err:#}").contains("commissions.stats"));
    }

    #[test]
    fn unparsable_url_is_refused() {
        assert!(RedisBus::connect("not a url").is_err());
    }
}
