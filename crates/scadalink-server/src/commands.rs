//! Command routing from pub/sub channels to connected RTUs.
//!
//! Each connected RTU gets a route: a listener on its `select:` and
//! `operate:` channels feeding a bounded queue, and an executor draining the
//! queue into the device link one command at a time. Routes only exist while
//! the RTU is connected, so commands for an RTU that is down are dropped.
//! A route whose channel feed ends is cancelled and counts as detached, so
//! the supervisor's next health probe attaches a fresh one.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use scadalink_core::{Command, CommandKind, RtuAddress};

use crate::backend::{FastStore, NotificationStream, RtuLink};
use crate::error::StoreError;

struct Route {
    queue: mpsc::Sender<Command>,
    cancel: CancellationToken,
}

impl Route {
    fn is_live(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

pub struct CommandRouter {
    fast: Arc<dyn FastStore>,
    link: Arc<dyn RtuLink>,
    queue_depth: usize,
    routes: RwLock<HashMap<RtuAddress, Route>>,
    shutdown: CancellationToken,
}

impl CommandRouter {
    pub fn new(
        fast: Arc<dyn FastStore>,
        link: Arc<dyn RtuLink>,
        queue_depth: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            fast,
            link,
            queue_depth,
            routes: RwLock::new(HashMap::new()),
            shutdown,
        }
    }

    /// Start accepting commands for `rtu`. Attaching a live route is a no-op;
    /// a route whose feed ended is replaced.
    pub async fn attach(&self, rtu: &RtuAddress) -> Result<(), StoreError> {
        if self.is_attached(rtu).await {
            return Ok(());
        }

        let channels = [rtu.select_channel(), rtu.operate_channel()];
        let notifications = self.fast.subscribe(&channels).await?;

        let mut routes = self.routes.write().await;
        if routes.get(rtu).is_some_and(Route::is_live) {
            return Ok(());
        }

        let (queue, rx) = mpsc::channel(self.queue_depth);
        let cancel = self.shutdown.child_token();
        tokio::spawn(listen(rtu.clone(), notifications, queue.clone(), cancel.clone()));
        tokio::spawn(execute(rtu.clone(), rx, self.link.clone(), cancel.clone()));
        routes.insert(rtu.clone(), Route { queue, cancel });

        info!(rtu = %rtu, "Command channels attached");
        Ok(())
    }

    /// Stop accepting commands for `rtu`; queued ones are discarded.
    pub async fn detach(&self, rtu: &RtuAddress) -> bool {
        match self.routes.write().await.remove(rtu) {
            Some(route) => {
                route.cancel.cancel();
                info!(rtu = %rtu, "Command channels detached");
                true
            }
            None => false,
        }
    }

    /// True while `rtu` has a route whose listener is still running.
    pub async fn is_attached(&self, rtu: &RtuAddress) -> bool {
        self.routes.read().await.get(rtu).is_some_and(Route::is_live)
    }

    /// Queue a command directly. Dropped when `rtu` has no route or its
    /// queue is full; commands are never retried.
    pub async fn submit(&self, rtu: &RtuAddress, command: Command) -> bool {
        let queue = match self.routes.read().await.get(rtu).filter(|r| r.is_live()) {
            Some(route) => route.queue.clone(),
            None => {
                warn!(rtu = %rtu, kind = %command.kind, ioa = %command.ioa, "No connection, command dropped");
                return false;
            }
        };
        enqueue(rtu, &queue, command)
    }

    /// Detach every route.
    pub async fn detach_all(&self) {
        for (_, route) in self.routes.write().await.drain() {
            route.cancel.cancel();
        }
    }
}

fn enqueue(rtu: &RtuAddress, queue: &mpsc::Sender<Command>, command: Command) -> bool {
    match queue.try_send(command) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(command)) => {
            warn!(rtu = %rtu, ioa = %command.ioa, "Command queue full, command dropped");
            false
        }
        Err(mpsc::error::TrySendError::Closed(command)) => {
            warn!(rtu = %rtu, ioa = %command.ioa, "Command route closed, command dropped");
            false
        }
    }
}

async fn listen(
    rtu: RtuAddress,
    mut notifications: NotificationStream,
    queue: mpsc::Sender<Command>,
    cancel: CancellationToken,
) {
    loop {
        let notification = tokio::select! {
            _ = cancel.cancelled() => break,
            n = notifications.recv() => match n {
                Some(n) => n,
                None => {
                    warn!(rtu = %rtu, "Command feed closed, route cancelled");
                    cancel.cancel();
                    break;
                }
            },
        };

        let command = CommandKind::from_channel(&notification.channel)
            .and_then(|(kind, _)| Command::parse(kind, &notification.payload));
        match command {
            Ok(command) => {
                debug!(rtu = %rtu, kind = %command.kind, ioa = %command.ioa, "Command received");
                enqueue(&rtu, &queue, command);
            }
            Err(e) => {
                warn!(rtu = %rtu, channel = %notification.channel, error = %e, "Ignoring malformed command");
            }
        }
    }
}

async fn execute(
    rtu: RtuAddress,
    mut queue: mpsc::Receiver<Command>,
    link: Arc<dyn RtuLink>,
    cancel: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            _ = cancel.cancelled() => break,
            c = queue.recv() => match c {
                Some(c) => c,
                None => break,
            },
        };

        let sent = async {
            match command.kind {
                CommandKind::Select => link.select(&rtu, &command.ioa, &command.value).await,
                CommandKind::Operate => link.operate(&rtu, &command.ioa, &command.value).await,
            }
        };
        // A device that stops answering must not outlive the route.
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                warn!(rtu = %rtu, kind = %command.kind, ioa = %command.ioa, "Command abandoned, route detached");
                break;
            }
            result = sent => result,
        };
        match result {
            Ok(()) => info!(rtu = %rtu, kind = %command.kind, ioa = %command.ioa, value = %command.value, "Command sent"),
            Err(e) => warn!(rtu = %rtu, kind = %command.kind, ioa = %command.ioa, error = %e, "Command failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryFastStore, SimulatedLink};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn rtu() -> RtuAddress {
        "10.0.0.5:2404".parse().unwrap()
    }

    fn setup(depth: usize) -> (Arc<MemoryFastStore>, Arc<SimulatedLink>, CommandRouter) {
        let fast = Arc::new(MemoryFastStore::new());
        let link = Arc::new(SimulatedLink::new());
        let router = CommandRouter::new(fast.clone(), link.clone(), depth, CancellationToken::new());
        (fast, link, router)
    }

    async fn wait_for_commands(link: &SimulatedLink, count: usize) -> Vec<(RtuAddress, Command)> {
        for _ in 0..200 {
            let executed = link.executed().await;
            if executed.len() >= count {
                return executed;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        link.executed().await
    }

    #[tokio::test]
    async fn test_published_commands_reach_link() {
        let (fast, link, router) = setup(8);
        link.connect(&rtu()).await.unwrap();
        router.attach(&rtu()).await.unwrap();

        fast.publish("select:10.0.0.5:2404", "6000>1").await.unwrap();
        fast.publish("operate:10.0.0.5:2404", r#"{"ioa": "6000", "value": 1}"#)
            .await
            .unwrap();

        let executed = wait_for_commands(&link, 2).await;
        assert_eq!(
            executed,
            vec![
                (rtu(), Command::new(CommandKind::Select, "6000", "1")),
                (rtu(), Command::new(CommandKind::Operate, "6000", "1")),
            ]
        );
    }

    #[tokio::test]
    async fn test_submit_without_route_is_dropped() {
        let (_, link, router) = setup(8);
        link.connect(&rtu()).await.unwrap();

        assert!(!router.submit(&rtu(), Command::new(CommandKind::Operate, "1", "0")).await);
        assert!(link.executed().await.is_empty());
    }

    #[tokio::test]
    async fn test_detach_stops_delivery() {
        let (fast, link, router) = setup(8);
        link.connect(&rtu()).await.unwrap();
        router.attach(&rtu()).await.unwrap();
        assert!(router.submit(&rtu(), Command::new(CommandKind::Select, "1", "1")).await);
        wait_for_commands(&link, 1).await;

        assert!(router.detach(&rtu()).await);
        assert!(!router.is_attached(&rtu()).await);
        assert!(!router.submit(&rtu(), Command::new(CommandKind::Operate, "1", "1")).await);
        fast.publish("operate:10.0.0.5:2404", "1>1").await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(link.executed().await.len(), 1);
    }

    #[tokio::test]
    async fn test_attach_is_idempotent() {
        let (fast, _, router) = setup(8);
        router.attach(&rtu()).await.unwrap();
        router.attach(&rtu()).await.unwrap();
        assert_eq!(fast.subscriber_count().await, 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_ignored() {
        let (fast, link, router) = setup(8);
        link.connect(&rtu()).await.unwrap();
        router.attach(&rtu()).await.unwrap();

        fast.publish("operate:10.0.0.5:2404", "no-delimiter").await.unwrap();
        fast.publish("operate:10.0.0.5:2404", "7>a>b").await.unwrap();

        let executed = wait_for_commands(&link, 1).await;
        assert_eq!(executed, vec![(rtu(), Command::new(CommandKind::Operate, "7", "a>b"))]);
    }

    #[tokio::test]
    async fn test_closed_feed_detaches_and_reattach_restores_delivery() {
        let (fast, link, router) = setup(8);
        link.connect(&rtu()).await.unwrap();
        router.attach(&rtu()).await.unwrap();

        fast.close_subscriptions().await;
        let mut detached = false;
        for _ in 0..200 {
            if !router.is_attached(&rtu()).await {
                detached = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(detached);
        assert!(!router.submit(&rtu(), Command::new(CommandKind::Operate, "1", "1")).await);

        router.attach(&rtu()).await.unwrap();
        assert!(router.is_attached(&rtu()).await);
        fast.publish("operate:10.0.0.5:2404", "6000>1").await.unwrap();
        let executed = wait_for_commands(&link, 1).await;
        assert_eq!(executed, vec![(rtu(), Command::new(CommandKind::Operate, "6000", "1"))]);
    }

    #[tokio::test]
    async fn test_detach_cancels_hanging_command() {
        let (_, link, router) = setup(8);
        link.connect(&rtu()).await.unwrap();
        link.set_commands_hanging(&rtu(), true).await;
        router.attach(&rtu()).await.unwrap();
        // Test handle, router, executor.
        assert_eq!(Arc::strong_count(&link), 3);

        assert!(router.submit(&rtu(), Command::new(CommandKind::Operate, "6000", "1")).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(router.detach(&rtu()).await);

        let mut released = false;
        for _ in 0..200 {
            if Arc::strong_count(&link) == 2 {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(released, "executor still running after detach");
        assert!(link.executed().await.is_empty());
    }
}
