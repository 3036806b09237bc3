//! Poll scheduler for points with no realtime feed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use scadalink_core::PointValue;

use crate::backend::TimeSeriesStore;
use crate::router::SubscriptionRouter;

/// Periodically reads the latest record of every actively polled point and
/// emits it to subscribers when it changed.
pub struct PollScheduler {
    timeseries: Arc<dyn TimeSeriesStore>,
    router: Arc<SubscriptionRouter>,
    interval: Duration,
}

impl PollScheduler {
    pub fn new(
        timeseries: Arc<dyn TimeSeriesStore>,
        router: Arc<SubscriptionRouter>,
        interval: Duration,
    ) -> Self {
        Self {
            timeseries,
            router,
            interval,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.interval, "Poll scheduler started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let emitted = self.tick().await;
                    if emitted > 0 {
                        debug!(emitted, "Values polled");
                    }
                }
            }
        }

        info!("Poll scheduler stopped");
    }

    /// One scan over the active poll points. Returns how many changed.
    pub async fn tick(&self) -> usize {
        let points = self.router.points();
        let mut emitted = 0;

        for point in points.active_poll_points().await {
            let value = match self.timeseries.latest(&point).await {
                Ok(Some(record)) => record.value,
                Ok(None) => PointValue::unknown(),
                Err(e) => {
                    warn!(point = %point, error = %e, "History query failed");
                    continue;
                }
            };

            if points.record_value(&point, value.clone(), Utc::now()).await {
                self.router.fanout(&point, &value).await;
                emitted += 1;
            }
        }

        emitted
    }
}
