use anyhow::Result;
use redis::{AsyncCommands, Client};
use serde::Serialize;
use tracing::debug;

pub const CHANNEL_BOOKINGS_CONFIRMED: &str = "bookings.confirmed";
pub const CHANNEL_BOOKINGS_CANCELLED: &str = "bookings.cancelled";
pub const CHANNEL_PAYOUTS_COMPLETED: &str = "payouts.completed";
pub const CHANNEL_NOTIFICATIONS_EMAIL: &str = "notifications.email";

#[derive(Clone)]
pub struct RedisBus {
    client: Client,
}

impl RedisBus {
    pub fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub async fn publish_json<T: Serialize>(&self, channel: &str, payload: &T) -> Result<()> {
        let mut connection = self.client.get_multiplexed_async_connection().await?;
        let serialized = serde_json::to_string(payload)?;
        let receivers: i64 = connection.publish(channel, serialized).await?;
        debug!("published to {channel}, {receivers} receivers");
        Ok(())
    }
}
