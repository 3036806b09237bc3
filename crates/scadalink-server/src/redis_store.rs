//! Redis backed fast store and time-series store.
//!
//! Commands go through a shared [`ConnectionManager`]; every subscription
//! opens its own pub/sub connection whose messages are forwarded onto a
//! [`NotificationStream`] by a background task.

use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use async_trait::async_trait;
use scadalink_core::{PointId, TimeSeriesRecord};

use crate::backend::{
    FastStore, Notification, NotificationStream, StoreResult, TimeSeriesStore, NOTIFICATION_BUFFER,
};
use crate::error::StoreError;

/// Key prefix of the per-point sorted sets holding history.
pub const HISTORY_KEY_PREFIX: &str = "history:";

fn store_error(e: RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::Backend(e.to_string())
    }
}

pub struct RedisFastStore {
    client: Client,
    conn: ConnectionManager,
}

impl RedisFastStore {
    /// Connect and enable keyspace notifications for string commands.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url).map_err(store_error)?;
        let mut conn = ConnectionManager::new(client.clone())
            .await
            .map_err(store_error)?;

        let enabled: Result<(), RedisError> = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("K$")
            .query_async(&mut conn)
            .await;
        if let Err(e) = enabled {
            // Managed instances often forbid CONFIG; they must be set up by hand.
            warn!(error = %e, "Cannot enable keyspace notifications");
        }

        info!(%url, "Connected to Redis");
        Ok(Self { client, conn })
    }

    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    async fn forward(&self, pubsub: redis::aio::PubSub) -> NotificationStream {
        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        debug!(channel = msg.get_channel_name(), error = %e, "Undecodable payload");
                        continue;
                    }
                };
                let notification = Notification {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                };
                if tx.send(notification).await.is_err() {
                    break;
                }
            }
            debug!("Pub/sub forwarder stopped");
        });
        rx
    }
}

#[async_trait]
impl FastStore for RedisFastStore {
    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        conn.exists(key).await.map_err(store_error)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(store_error)
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.set(key, value).await.map_err(store_error)
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _receivers: i64 = conn.publish(channel, payload).await.map_err(store_error)?;
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> StoreResult<NotificationStream> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(store_error)?;
        pubsub.psubscribe(pattern).await.map_err(store_error)?;
        Ok(self.forward(pubsub).await)
    }

    async fn subscribe(&self, channels: &[String]) -> StoreResult<NotificationStream> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(store_error)?;
        for channel in channels {
            pubsub.subscribe(channel).await.map_err(store_error)?;
        }
        Ok(self.forward(pubsub).await)
    }
}

/// Time-series store keeping each point's records in a sorted set scored by
/// timestamp.
pub struct RedisTimeSeries {
    conn: ConnectionManager,
}

impl RedisTimeSeries {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn key(point: &PointId) -> String {
        format!("{HISTORY_KEY_PREFIX}{}-{}", point.rtu(), point.ioa())
    }
}

#[async_trait]
impl TimeSeriesStore for RedisTimeSeries {
    async fn latest(&self, point: &PointId) -> StoreResult<Option<TimeSeriesRecord>> {
        let mut conn = self.conn.clone();
        let newest: Vec<String> = conn
            .zrevrange(Self::key(point), 0, 0)
            .await
            .map_err(store_error)?;
        newest
            .first()
            .map(|json| serde_json::from_str(json).map_err(|e| StoreError::Decode(e.to_string())))
            .transpose()
    }

    async fn append(&self, record: TimeSeriesRecord) -> StoreResult<()> {
        let json = serde_json::to_string(&record).map_err(|e| StoreError::Decode(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _added: i64 = conn
            .zadd(Self::key(&record.point_id()), json, record.timestamp)
            .await
            .map_err(store_error)?;
        Ok(())
    }
}
