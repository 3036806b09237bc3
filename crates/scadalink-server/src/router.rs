//! Subscription router.
//!
//! Ties client subscription sets to the point store: registering a point
//! decides its delivery mode and takes a poll reference when needed,
//! unregistering and disconnecting give the references back, and
//! [`SubscriptionRouter::fanout`] delivers updates to exactly the clients
//! holding a point.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use scadalink_core::{DeliveryMode, PointId, PointValue};
use scadalink_protocol::ServerMessage;

use crate::error::RouterError;
use crate::points::PointStore;
use crate::registry::{deliver, ClientId, ClientRegistry, Insert};

pub struct SubscriptionRouter {
    registry: ClientRegistry,
    points: Arc<PointStore>,
    queue_depth: usize,
}

impl SubscriptionRouter {
    pub fn new(points: Arc<PointStore>, queue_depth: usize) -> Self {
        Self {
            registry: ClientRegistry::new(),
            points,
            queue_depth,
        }
    }

    pub fn points(&self) -> &Arc<PointStore> {
        &self.points
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    /// Start tracking a client. Messages for it arrive on the returned queue.
    pub async fn connect(&self, client: ClientId) -> mpsc::Receiver<ServerMessage> {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        if let Some(stale) = self.registry.connect(client, tx).await {
            // Id reuse: treat the old session as disconnected.
            self.release_all(stale).await;
        }
        debug!(client = %client, "Client connected");
        rx
    }

    /// Subscribe a client to a point.
    ///
    /// Registering a point the client already holds returns the mode granted
    /// the first time and leaves reference counts untouched.
    pub async fn register(&self, client: &ClientId, point: &PointId) -> Result<DeliveryMode, RouterError> {
        if !self.registry.contains(client).await {
            return Err(RouterError::UnknownClient(*client));
        }
        if let Some(mode) = self.registry.granted(client, point).await {
            debug!(client = %client, point = %point, %mode, "Already registered");
            return Ok(mode);
        }

        let mode = self.points.subscribe(point).await?;
        match self.registry.insert(client, point, mode).await {
            Insert::Added => {
                debug!(client = %client, point = %point, %mode, "Registered");
                Ok(mode)
            }
            Insert::Existing(existing) => {
                // Lost a race with a concurrent register of the same point.
                self.points.unsubscribe(point, mode).await;
                Ok(existing)
            }
            Insert::UnknownClient => {
                // Disconnected while subscribing.
                self.points.unsubscribe(point, mode).await;
                Err(RouterError::UnknownClient(*client))
            }
        }
    }

    /// Unsubscribe a client from a point. Unknown points are ignored.
    pub async fn unregister(&self, client: &ClientId, point: &PointId) {
        if let Some(mode) = self.registry.remove(client, point).await {
            self.points.unsubscribe(point, mode).await;
            debug!(client = %client, point = %point, "Unregistered");
        }
    }

    /// Drop a client and release every point it held.
    pub async fn on_disconnect(&self, client: &ClientId) {
        if let Some(points) = self.registry.remove_client(client).await {
            let count = points.len();
            self.release_all(points).await;
            info!(client = %client, released = count, "Client disconnected");
        }
    }

    async fn release_all(&self, points: impl IntoIterator<Item = (PointId, DeliveryMode)>) {
        for (point, mode) in points {
            self.points.unsubscribe(&point, mode).await;
        }
    }

    /// Deliver an update to every client subscribed to `point`.
    ///
    /// Never waits on a client queue. Returns the number of clients reached.
    pub async fn fanout(&self, point: &PointId, value: &PointValue) -> usize {
        let targets = self.registry.targets(point).await;
        let mut delivered = 0;
        for (client, sender) in &targets {
            let message = ServerMessage::UpdateDataPoint {
                point: point.clone(),
                d: value.clone(),
            };
            if deliver(client, sender, message) {
                delivered += 1;
            }
        }
        debug!(point = %point, delivered, "Fan-out");
        delivered
    }

    /// Queue a direct reply for one client.
    pub async fn send_to(&self, client: &ClientId, message: ServerMessage) -> bool {
        self.registry.send(client, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FastStore;
    use crate::memory::MemoryFastStore;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn router() -> (Arc<MemoryFastStore>, SubscriptionRouter) {
        let fast = Arc::new(MemoryFastStore::new());
        let points = Arc::new(PointStore::new(fast.clone()));
        (fast, SubscriptionRouter::new(points, 16))
    }

    fn point(ioa: &str) -> PointId {
        PointId::new("10.0.0.5:2404", ioa)
    }

    #[tokio::test]
    async fn test_register_unknown_client() {
        let (_, router) = router();
        let result = router.register(&Uuid::new_v4(), &point("1")).await;
        assert!(matches!(result, Err(RouterError::UnknownClient(_))));
        assert_eq!(router.points().poll_ref_count(&point("1")).await, 0);
    }

    #[tokio::test]
    async fn test_reregistration_is_idempotent() {
        let (_, router) = router();
        let c = Uuid::new_v4();
        let _rx = router.connect(c).await;

        assert_eq!(router.register(&c, &point("1")).await.unwrap(), DeliveryMode::Poll);
        assert_eq!(router.register(&c, &point("1")).await.unwrap(), DeliveryMode::Poll);
        assert_eq!(router.points().poll_ref_count(&point("1")).await, 1);

        router.unregister(&c, &point("1")).await;
        router.unregister(&c, &point("1")).await;
        assert_eq!(router.points().poll_ref_count(&point("1")).await, 0);
    }

    #[tokio::test]
    async fn test_refcount_matches_subscribers() {
        let (_, router) = router();
        let clients: Vec<ClientId> = (0..5).map(|_| Uuid::new_v4()).collect();
        let mut queues = Vec::new();
        for c in &clients {
            queues.push(router.connect(*c).await);
        }

        let p = point("42");
        // Interleaved register / unregister, including repeats and strays.
        let ops: [(usize, bool); 12] = [
            (0, true),
            (1, true),
            (0, true),
            (2, true),
            (3, false),
            (1, false),
            (1, false),
            (4, true),
            (2, false),
            (3, true),
            (0, false),
            (2, false),
        ];
        for (i, register) in ops {
            if register {
                router.register(&clients[i], &p).await.unwrap();
            } else {
                router.unregister(&clients[i], &p).await;
            }
            let mut holders = 0;
            for c in &clients {
                if router.registry().points_of(c).await.contains(&p) {
                    holders += 1;
                }
            }
            assert_eq!(router.points().poll_ref_count(&p).await, holders);
        }
    }

    #[tokio::test]
    async fn test_disconnect_releases_everything() {
        let (fast, router) = router();
        fast.set(&point("9").value_key(), "1").await.unwrap();

        let c = Uuid::new_v4();
        let _rx = router.connect(c).await;
        for ioa in ["1", "2", "3", "9"] {
            router.register(&c, &point(ioa)).await.unwrap();
        }
        assert_eq!(router.points().active_poll_points().await.len(), 3);

        router.on_disconnect(&c).await;
        assert!(router.points().active_poll_points().await.is_empty());
        assert!(router.registry().is_empty().await);

        // A second disconnect finds nothing to release.
        router.on_disconnect(&c).await;
        for ioa in ["1", "2", "3"] {
            assert_eq!(router.points().poll_ref_count(&point(ioa)).await, 0);
        }
    }

    #[tokio::test]
    async fn test_fanout_reaches_only_subscribers() {
        let (_, router) = router();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut rx_a = router.connect(a).await;
        let mut rx_b = router.connect(b).await;
        router.register(&a, &point("1")).await.unwrap();
        router.register(&b, &point("2")).await.unwrap();

        let delivered = router.fanout(&point("1"), &PointValue::from(5i64)).await;
        assert_eq!(delivered, 1);
        assert_eq!(
            rx_a.try_recv().unwrap(),
            ServerMessage::UpdateDataPoint {
                point: point("1"),
                d: PointValue::from(5i64),
            }
        );
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fanout_skips_stalled_client() {
        let fast = Arc::new(MemoryFastStore::new());
        let router = SubscriptionRouter::new(Arc::new(PointStore::new(fast)), 1);
        let (slow, fast_client) = (Uuid::new_v4(), Uuid::new_v4());
        let _rx_slow = router.connect(slow).await;
        let mut rx_fast = router.connect(fast_client).await;
        for c in [&slow, &fast_client] {
            router.register(c, &point("1")).await.unwrap();
        }

        assert_eq!(router.fanout(&point("1"), &PointValue::from(1i64)).await, 2);
        rx_fast.recv().await.unwrap();
        // The slow client's queue is still full; the other one is served.
        assert_eq!(router.fanout(&point("1"), &PointValue::from(2i64)).await, 1);
    }
}
