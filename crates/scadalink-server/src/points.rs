//! Point store: delivery mode decisions and poll reference counting.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use scadalink_core::{DeliveryMode, PointEntry, PointId, PointTable, PointValue, Release};

use crate::backend::FastStore;
use crate::error::StoreError;

/// One row of [`PointStore::snapshot`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PointStatus {
    pub point: PointId,
    #[serde(flatten)]
    pub entry: PointEntry,
}

/// Decides how each point reaches clients and tracks poll-mode points.
///
/// A point is delivered by push when the fast store already holds its value
/// key at subscribe time; otherwise it is polled from the time-series store
/// and reference counted here. The mode of an actively polled point is not
/// re-evaluated until its count drops back to zero.
pub struct PointStore {
    table: RwLock<PointTable>,
    fast: Arc<dyn FastStore>,
}

impl PointStore {
    pub fn new(fast: Arc<dyn FastStore>) -> Self {
        Self {
            table: RwLock::new(PointTable::new()),
            fast,
        }
    }

    /// Add one subscription and return the mode it is served with.
    ///
    /// The fast store is queried without holding the table lock. The active
    /// poll check is repeated afterwards so a point that became polled in the
    /// meantime stays polled.
    pub async fn subscribe(&self, point: &PointId) -> Result<DeliveryMode, StoreError> {
        if let Some(count) = self.acquire_if_polled(point).await {
            debug!(point = %point, count, "Poll subscription added");
            return Ok(DeliveryMode::Poll);
        }

        let pushed = self.fast.exists(&point.value_key()).await?;

        let mut table = self.table.write().await;
        if table.is_active_poll(point) {
            let count = table.acquire_poll(point);
            debug!(point = %point, count, "Poll subscription added");
            return Ok(DeliveryMode::Poll);
        }
        if pushed {
            debug!(point = %point, "Point served by push");
            return Ok(DeliveryMode::Push);
        }

        let count = table.acquire_poll(point);
        debug!(point = %point, count, "Point switched to poll");
        Ok(DeliveryMode::Poll)
    }

    async fn acquire_if_polled(&self, point: &PointId) -> Option<u32> {
        let mut table = self.table.write().await;
        table
            .is_active_poll(point)
            .then(|| table.acquire_poll(point))
    }

    /// Drop one subscription that was granted `granted`.
    pub async fn unsubscribe(&self, point: &PointId, granted: DeliveryMode) -> Option<Release> {
        if granted == DeliveryMode::Push {
            return None;
        }

        let release = self.table.write().await.release_poll(point);
        match release {
            Release::Decremented(0) => debug!(point = %point, "Last poll subscription released"),
            Release::Decremented(count) => debug!(point = %point, count, "Poll subscription released"),
            Release::AlreadyZero | Release::Untracked => {
                warn!(point = %point, ?release, "Poll release without a matching subscription")
            }
        }
        Some(release)
    }

    /// Points with at least one poll subscriber.
    pub async fn active_poll_points(&self) -> Vec<PointId> {
        self.table.read().await.active_poll_points()
    }

    /// Store a polled value; true when subscribers must be told.
    pub async fn record_value(&self, point: &PointId, value: PointValue, at: DateTime<Utc>) -> bool {
        self.table.write().await.record_value(point, value, at)
    }

    /// Current mode of a point, if it is actively polled.
    pub async fn mode_of(&self, point: &PointId) -> Option<DeliveryMode> {
        self.table.read().await.mode_of(point)
    }

    pub async fn poll_ref_count(&self, point: &PointId) -> u32 {
        self.table
            .read()
            .await
            .get(point)
            .map_or(0, |e| e.poll_ref_count)
    }

    /// Every tracked poll point, sorted by id.
    pub async fn snapshot(&self) -> Vec<PointStatus> {
        let table = self.table.read().await;
        let mut rows: Vec<PointStatus> = table
            .iter()
            .map(|(point, entry)| PointStatus {
                point: point.clone(),
                entry: entry.clone(),
            })
            .collect();
        rows.sort_by(|a, b| a.point.cmp(&b.point));
        rows
    }
}
