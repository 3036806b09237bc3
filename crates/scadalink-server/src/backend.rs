//! Collaborator interfaces.
//!
//! The services never talk to a concrete database or device stack. They are
//! handed trait objects for:
//!
//! - [`FastStore`]: key/value store with pub/sub and keyspace notifications
//! - [`TimeSeriesStore`]: append-only observation history
//! - [`DesiredStateSource`]: the RTU descriptor list and its change feed
//! - [`RtuLink`]: the device protocol stack
//!
//! In-memory implementations live in [`crate::memory`]; the Redis backed
//! ones in `redis_store` behind the `redis-store` feature.

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use scadalink_core::{DescriptorList, PointId, RtuAddress, TimeSeriesRecord};

use crate::error::{LinkError, StoreError};

pub type StoreResult<T> = Result<T, StoreError>;

/// Capacity of the channel behind every [`NotificationStream`].
pub const NOTIFICATION_BUFFER: usize = 1024;

/// A message received on a pub/sub channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// The concrete channel the message was published on.
    pub channel: String,
    pub payload: String,
}

/// Feed of pub/sub messages. Dropping the receiver ends the subscription.
pub type NotificationStream = mpsc::Receiver<Notification>;

#[async_trait]
pub trait FastStore: Send + Sync {
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Store `value` under `key`. Emits a keyspace notification.
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()>;

    /// Subscribe to every channel matching a glob pattern.
    async fn psubscribe(&self, pattern: &str) -> StoreResult<NotificationStream>;

    /// Subscribe to an exact set of channels.
    async fn subscribe(&self, channels: &[String]) -> StoreResult<NotificationStream>;
}

#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// Most recent record for a point, by timestamp.
    async fn latest(&self, point: &PointId) -> StoreResult<Option<TimeSeriesRecord>>;

    async fn append(&self, record: TimeSeriesRecord) -> StoreResult<()>;
}

/// Source of the RTU descriptor list.
#[async_trait]
pub trait DesiredStateSource: Send + Sync {
    /// Read the full, current descriptor list.
    ///
    /// Undecodable entries are returned as rejected issues, not as an error.
    async fn load(&self) -> StoreResult<DescriptorList>;

    /// Change feed. The revision is bumped whenever the list may have changed.
    fn watch(&self) -> watch::Receiver<u64>;
}

/// The device protocol stack as seen by the supervisor and command router.
#[async_trait]
pub trait RtuLink: Send + Sync {
    async fn connect(&self, rtu: &RtuAddress) -> Result<(), LinkError>;

    /// Health probe (protocol test frame) on an established connection.
    async fn test_frame(&self, rtu: &RtuAddress) -> Result<(), LinkError>;

    async fn disconnect(&self, rtu: &RtuAddress);

    async fn select(&self, rtu: &RtuAddress, ioa: &str, value: &str) -> Result<(), LinkError>;

    async fn operate(&self, rtu: &RtuAddress, ioa: &str, value: &str) -> Result<(), LinkError>;
}
