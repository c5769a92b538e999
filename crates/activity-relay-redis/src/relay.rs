//! Redis Pub/Sub room relay

use activity_relay::relay::deliver_relayed;
use activity_relay::{Error, Result, RoomDelivery, RoomRegistry, RoomRelay};
use async_trait::async_trait;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::{timed, RedisConnection};

/// Default Pub/Sub channel
pub const ROOMS_CHANNEL: &str = "relay:rooms";

/// Forwards room deliveries between relay instances over Redis Pub/Sub
///
/// # Message Format
///
/// Every publication is a JSON [`RoomDelivery`]:
///
/// ```json
/// {
///     "origin": "instance-a",
///     "rooms": ["consultants", "user:r1", "event:PAGE_SYNC"],
///     "message": {"event": "reader-activity", "data": {"userId": "r1"}}
/// }
/// ```
pub struct RedisRoomRelay {
    redis_url: String,
    channel: String,
    publisher: RedisConnection,
}

impl RedisRoomRelay {
    pub fn new(redis_url: impl Into<String>, publisher: RedisConnection) -> Self {
        Self {
            redis_url: redis_url.into(),
            channel: ROOMS_CHANNEL.to_string(),
            publisher,
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }
}

#[async_trait]
impl RoomRelay for RedisRoomRelay {
    async fn publish(&self, delivery: &RoomDelivery) -> Result<()> {
        let payload = serde_json::to_string(delivery).map_err(|e| Error::Relay(e.to_string()))?;
        let mut conn = self.publisher.manager().await.map_err(Error::Relay)?;

        timed(
            redis::cmd("PUBLISH")
                .arg(&self.channel)
                .arg(payload)
                .query_async::<i64>(&mut conn),
        )
        .await
        .map_err(Error::Relay)?;
        Ok(())
    }

    async fn start(&self, registry: RoomRegistry, cancel: CancellationToken) -> Result<()> {
        info!(channel = %self.channel, "Starting Redis room relay");

        let client = redis::Client::open(self.redis_url.as_str()).map_err(|e| Error::Relay(e.to_string()))?;
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| Error::Relay(e.to_string()))?;
        pubsub
            .subscribe(&self.channel)
            .await
            .map_err(|e| Error::Relay(e.to_string()))?;
        info!(channel = %self.channel, "Subscribed");

        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = stream.next() => {
                        match msg {
                            Some(msg) => {
                                let Ok(payload) = msg.get_payload::<String>() else {
                                    continue;
                                };
                                match serde_json::from_str::<RoomDelivery>(&payload) {
                                    Ok(delivery) => {
                                        deliver_relayed(&registry, delivery).await;
                                    }
                                    Err(e) => warn!(error = %e, "Ignoring malformed relay message"),
                                }
                            }
                            None => {
                                warn!("Redis stream ended");
                                break;
                            }
                        }
                    }
                }
            }

            info!("Redis room relay stopped");
        });

        Ok(())
    }

    async fn close(&self) {
        self.publisher.disconnect().await;
    }

    fn name(&self) -> &'static str {
        "Redis Pub/Sub"
    }
}
