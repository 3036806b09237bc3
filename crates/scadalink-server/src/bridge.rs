//! Realtime bridge: fast-store keyspace notifications to client fan-out.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use scadalink_core::point::{DATA_KEY_PREFIX, KEYSPACE_PREFIX, VALUE_KEY_SUFFIX};
use scadalink_core::{PointId, PointValue};

use crate::backend::{FastStore, Notification, NotificationStream};
use crate::router::SubscriptionRouter;

/// Keyspace pattern covering every point value key.
pub fn value_pattern() -> String {
    format!("{KEYSPACE_PREFIX}{DATA_KEY_PREFIX}*{VALUE_KEY_SUFFIX}")
}

/// Wait between subscription attempts after the feed fails or closes.
pub const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Forwards push-mode value changes to subscribed clients.
///
/// Losing the notification feed is never fatal: the bridge subscribes again
/// after [`RESUBSCRIBE_DELAY`] until it is cancelled.
pub struct RealtimeBridge {
    fast: Arc<dyn FastStore>,
    router: Arc<SubscriptionRouter>,
    resubscribe_delay: Duration,
}

impl RealtimeBridge {
    pub fn new(fast: Arc<dyn FastStore>, router: Arc<SubscriptionRouter>) -> Self {
        Self {
            fast,
            router,
            resubscribe_delay: RESUBSCRIBE_DELAY,
        }
    }

    pub fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }

    /// Subscribe to value notifications and forward them until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let pattern = value_pattern();

        loop {
            let subscribed = tokio::select! {
                _ = cancel.cancelled() => break,
                subscribed = self.fast.psubscribe(&pattern) => subscribed,
            };
            match subscribed {
                Ok(mut notifications) => {
                    info!(%pattern, "Realtime bridge subscribed");
                    if !self.forward(&mut notifications, &cancel).await {
                        break;
                    }
                    warn!(%pattern, "Keyspace notification feed closed, resubscribing");
                }
                Err(e) => {
                    warn!(%pattern, error = %e, "Cannot subscribe to keyspace notifications");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.resubscribe_delay) => {}
            }
        }

        info!("Realtime bridge stopped");
    }

    /// Drain one feed. Returns false when cancelled, true when the feed closed.
    async fn forward(&self, notifications: &mut NotificationStream, cancel: &CancellationToken) -> bool {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                notification = notifications.recv() => match notification {
                    Some(notification) => {
                        self.handle(&notification).await;
                    }
                    None => return true,
                },
            }
        }
    }

    /// Process one notification. Returns the number of clients reached.
    pub async fn handle(&self, notification: &Notification) -> usize {
        let point = match PointId::from_keyspace_channel(&notification.channel) {
            Ok(point) => point,
            Err(e) => {
                debug!(channel = %notification.channel, error = %e, "Skipping notification");
                return 0;
            }
        };

        let raw = match self.fast.get(&point.value_key()).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!(point = %point, event = %notification.payload, "Value key gone");
                return 0;
            }
            Err(e) => {
                warn!(point = %point, error = %e, "Cannot read pushed value");
                return 0;
            }
        };

        if self.router.points().mode_of(&point).await.is_some() {
            warn!(point = %point, "Pushed value for a point that is also being polled");
        }

        self.router
            .fanout(&point, &PointValue::from_raw(&raw))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryFastStore;
    use crate::points::PointStore;
    use pretty_assertions::assert_eq;
    use scadalink_protocol::ServerMessage;
    use uuid::Uuid;

    fn setup() -> (Arc<MemoryFastStore>, Arc<SubscriptionRouter>, RealtimeBridge) {
        let fast = Arc::new(MemoryFastStore::new());
        let points = Arc::new(PointStore::new(fast.clone()));
        let router = Arc::new(SubscriptionRouter::new(points, 16));
        let bridge = RealtimeBridge::new(fast.clone(), router.clone());
        (fast, router, bridge)
    }

    #[test]
    fn test_value_pattern() {
        assert_eq!(value_pattern(), "__keyspace@0__:data:*.value");
    }

    #[tokio::test]
    async fn test_handle_forwards_value() {
        let (fast, router, bridge) = setup();
        let p = PointId::new("10.0.0.5:2404", "100");
        fast.set(&p.value_key(), "147").await.unwrap();

        let c = Uuid::new_v4();
        let mut rx = router.connect(c).await;
        router.register(&c, &p).await.unwrap();

        let notification = Notification {
            channel: "__keyspace@0__:data:10.0.0.5:2404-100.value".to_string(),
            payload: "set".to_string(),
        };
        assert_eq!(bridge.handle(&notification).await, 1);
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerMessage::UpdateDataPoint {
                point: p,
                d: PointValue::from(147i64),
            }
        );
    }

    #[tokio::test]
    async fn test_handle_skips_unparseable() {
        let (_, _, bridge) = setup();
        let notification = Notification {
            channel: "__keyspace@0__:connections:10.0.0.5:2404.active".to_string(),
            payload: "set".to_string(),
        };
        assert_eq!(bridge.handle(&notification).await, 0);
    }

    #[tokio::test]
    async fn test_run_until_cancelled() {
        let (fast, router, bridge) = setup();
        let p = PointId::new("10.0.0.5:2404", "100");
        fast.set(&p.value_key(), "1").await.unwrap();
        let c = Uuid::new_v4();
        let mut rx = router.connect(c).await;
        router.register(&c, &p).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(bridge.run(cancel.clone()));
        while fast.subscriber_count().await == 0 {
            tokio::task::yield_now().await;
        }

        fast.set(&p.value_key(), "2").await.unwrap();
        let update = rx.recv().await.unwrap();
        assert_eq!(
            update,
            ServerMessage::UpdateDataPoint {
                point: p,
                d: PointValue::from(2i64),
            }
        );

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_resubscribes_after_feed_closes() {
        let (fast, router, bridge) = setup();
        let bridge = bridge.with_resubscribe_delay(Duration::from_millis(10));
        let p = PointId::new("10.0.0.5:2404", "100");
        fast.set(&p.value_key(), "1").await.unwrap();
        let c = Uuid::new_v4();
        let mut rx = router.connect(c).await;
        router.register(&c, &p).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(bridge.run(cancel.clone()));
        while fast.subscriber_count().await == 0 {
            tokio::task::yield_now().await;
        }

        fast.close_subscriptions().await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while fast.subscriber_count().await == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("bridge did not resubscribe");

        fast.set(&p.value_key(), "3").await.unwrap();
        let update = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            update,
            ServerMessage::UpdateDataPoint {
                point: p,
                d: PointValue::from(3i64),
            }
        );

        cancel.cancel();
        handle.await.unwrap();
    }
}
