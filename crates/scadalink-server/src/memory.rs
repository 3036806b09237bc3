//! In-memory collaborators.
//!
//! Used by the demo binary when no external store is configured, and by the
//! tests. [`MemoryFastStore`] mimics the parts of Redis the gateway relies
//! on, including `__keyspace@0__:<key>` notifications on every `set`.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, trace};

use scadalink_core::point::KEYSPACE_PREFIX;
use scadalink_core::{
    ChannelPattern, Command, CommandKind, DescriptorList, PointId, RtuAddress, RtuDescriptor,
    TimeSeriesRecord,
};

use crate::backend::{
    DesiredStateSource, FastStore, Notification, NotificationStream, RtuLink, StoreResult,
    TimeSeriesStore, NOTIFICATION_BUFFER,
};
use crate::error::{LinkError, StoreError};

enum Filter {
    Pattern(ChannelPattern),
    Channels(HashSet<String>),
}

impl Filter {
    fn accepts(&self, channel: &str) -> bool {
        match self {
            Filter::Pattern(pattern) => pattern.matches(channel),
            Filter::Channels(channels) => channels.contains(channel),
        }
    }
}

struct Subscriber {
    filter: Filter,
    tx: mpsc::Sender<Notification>,
}

/// Key/value store with pub/sub, held in process memory.
#[derive(Default)]
pub struct MemoryFastStore {
    values: RwLock<HashMap<String, String>>,
    subscribers: RwLock<Vec<Subscriber>>,
}

impl MemoryFastStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions. Closed ones are pruned on publish.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .await
            .iter()
            .filter(|s| !s.tx.is_closed())
            .count()
    }

    /// End every open subscription, as a dropped pub/sub connection would.
    pub async fn close_subscriptions(&self) {
        self.subscribers.write().await.clear();
    }

    async fn add_subscriber(&self, filter: Filter) -> NotificationStream {
        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        self.subscribers.write().await.push(Subscriber { filter, tx });
        rx
    }
}

#[async_trait]
impl FastStore for MemoryFastStore {
    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.values.read().await.contains_key(key))
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.values
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        self.publish(&format!("{KEYSPACE_PREFIX}{key}"), "set").await
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        let mut subscribers = self.subscribers.write().await;
        subscribers.retain(|s| !s.tx.is_closed());

        let mut delivered = 0usize;
        for subscriber in subscribers.iter().filter(|s| s.filter.accepts(channel)) {
            let notification = Notification {
                channel: channel.to_string(),
                payload: payload.to_string(),
            };
            if subscriber.tx.try_send(notification).is_ok() {
                delivered += 1;
            } else {
                debug!(channel, "Subscriber queue full, notification dropped");
            }
        }
        trace!(channel, delivered, "Published");
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> StoreResult<NotificationStream> {
        Ok(self
            .add_subscriber(Filter::Pattern(ChannelPattern::new(pattern)))
            .await)
    }

    async fn subscribe(&self, channels: &[String]) -> StoreResult<NotificationStream> {
        let channels = channels.iter().cloned().collect();
        Ok(self.add_subscriber(Filter::Channels(channels)).await)
    }
}

/// Time-series store held in process memory.
///
/// Individual points can be made to fail, to exercise error paths.
#[derive(Default)]
pub struct MemoryTimeSeries {
    records: RwLock<HashMap<PointId, Vec<TimeSeriesRecord>>>,
    failing: RwLock<HashSet<PointId>>,
}

impl MemoryTimeSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `latest` fail for `point` until cleared.
    pub async fn set_failing(&self, point: &PointId, failing: bool) {
        let mut set = self.failing.write().await;
        if failing {
            set.insert(point.clone());
        } else {
            set.remove(point);
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl TimeSeriesStore for MemoryTimeSeries {
    async fn latest(&self, point: &PointId) -> StoreResult<Option<TimeSeriesRecord>> {
        if self.failing.read().await.contains(point) {
            return Err(StoreError::Unavailable(format!("history for {point}")));
        }
        Ok(self
            .records
            .read()
            .await
            .get(point)
            .and_then(|records| records.iter().max_by_key(|r| r.timestamp))
            .cloned())
    }

    async fn append(&self, record: TimeSeriesRecord) -> StoreResult<()> {
        self.records
            .write()
            .await
            .entry(record.point_id())
            .or_default()
            .push(record);
        Ok(())
    }
}

/// Descriptor list held in memory; [`replace`](Self::replace) bumps the revision.
pub struct MemoryDesiredState {
    descriptors: RwLock<Vec<RtuDescriptor>>,
    revision: watch::Sender<u64>,
}

impl MemoryDesiredState {
    pub fn new(descriptors: Vec<RtuDescriptor>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            descriptors: RwLock::new(descriptors),
            revision,
        }
    }

    /// Swap in a new descriptor list and signal the change feed.
    pub async fn replace(&self, descriptors: Vec<RtuDescriptor>) {
        *self.descriptors.write().await = descriptors;
        self.revision.send_modify(|rev| *rev += 1);
    }
}

#[async_trait]
impl DesiredStateSource for MemoryDesiredState {
    async fn load(&self) -> StoreResult<DescriptorList> {
        Ok(DescriptorList::from(self.descriptors.read().await.clone()))
    }

    fn watch(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}

#[derive(Default)]
struct LinkState {
    unreachable: HashSet<RtuAddress>,
    hanging: HashSet<RtuAddress>,
    hanging_commands: HashSet<RtuAddress>,
    failing_probes: HashSet<RtuAddress>,
    connected: HashSet<RtuAddress>,
    connect_attempts: HashMap<RtuAddress, u32>,
    executed: Vec<(RtuAddress, Command)>,
}

/// Device link simulator.
///
/// Every RTU is reachable unless told otherwise. Executed commands are
/// recorded so callers can inspect what reached a device.
#[derive(Default)]
pub struct SimulatedLink {
    state: Mutex<LinkState>,
}

impl SimulatedLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make connect attempts to `rtu` fail immediately.
    pub async fn set_unreachable(&self, rtu: &RtuAddress, unreachable: bool) {
        toggle(&mut self.state.lock().await.unreachable, rtu, unreachable);
    }

    /// Make connect attempts to `rtu` never complete.
    pub async fn set_hanging(&self, rtu: &RtuAddress, hanging: bool) {
        toggle(&mut self.state.lock().await.hanging, rtu, hanging);
    }

    /// Make select/operate on `rtu` never complete.
    pub async fn set_commands_hanging(&self, rtu: &RtuAddress, hanging: bool) {
        toggle(&mut self.state.lock().await.hanging_commands, rtu, hanging);
    }

    /// Make health probes on `rtu` fail.
    pub async fn set_probe_failing(&self, rtu: &RtuAddress, failing: bool) {
        toggle(&mut self.state.lock().await.failing_probes, rtu, failing);
    }

    pub async fn is_connected(&self, rtu: &RtuAddress) -> bool {
        self.state.lock().await.connected.contains(rtu)
    }

    pub async fn connect_attempts(&self, rtu: &RtuAddress) -> u32 {
        self.state
            .lock()
            .await
            .connect_attempts
            .get(rtu)
            .copied()
            .unwrap_or(0)
    }

    /// Commands that reached a connected device, in execution order.
    pub async fn executed(&self) -> Vec<(RtuAddress, Command)> {
        self.state.lock().await.executed.clone()
    }

    async fn execute(&self, rtu: &RtuAddress, command: Command) -> Result<(), LinkError> {
        let hanging = self.state.lock().await.hanging_commands.contains(rtu);
        if hanging {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock().await;
        if !state.connected.contains(rtu) {
            return Err(LinkError::NotConnected);
        }
        debug!(rtu = %rtu, kind = %command.kind, ioa = %command.ioa, "Command executed");
        state.executed.push((rtu.clone(), command));
        Ok(())
    }
}

fn toggle(set: &mut HashSet<RtuAddress>, rtu: &RtuAddress, on: bool) {
    if on {
        set.insert(rtu.clone());
    } else {
        set.remove(rtu);
    }
}

#[async_trait]
impl RtuLink for SimulatedLink {
    async fn connect(&self, rtu: &RtuAddress) -> Result<(), LinkError> {
        let hanging = {
            let mut state = self.state.lock().await;
            *state.connect_attempts.entry(rtu.clone()).or_default() += 1;
            if state.unreachable.contains(rtu) {
                return Err(LinkError::Unreachable(rtu.to_string()));
            }
            state.hanging.contains(rtu)
        };
        if hanging {
            std::future::pending::<()>().await;
        }
        self.state.lock().await.connected.insert(rtu.clone());
        Ok(())
    }

    async fn test_frame(&self, rtu: &RtuAddress) -> Result<(), LinkError> {
        let mut state = self.state.lock().await;
        if !state.connected.contains(rtu) {
            return Err(LinkError::NotConnected);
        }
        if state.failing_probes.contains(rtu) {
            state.connected.remove(rtu);
            return Err(LinkError::Timeout);
        }
        Ok(())
    }

    async fn disconnect(&self, rtu: &RtuAddress) {
        self.state.lock().await.connected.remove(rtu);
    }

    async fn select(&self, rtu: &RtuAddress, ioa: &str, value: &str) -> Result<(), LinkError> {
        self.execute(rtu, Command::new(CommandKind::Select, ioa, value))
            .await
    }

    async fn operate(&self, rtu: &RtuAddress, ioa: &str, value: &str) -> Result<(), LinkError> {
        self.execute(rtu, Command::new(CommandKind::Operate, ioa, value))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use scadalink_core::PointValue;

    #[tokio::test]
    async fn test_set_emits_keyspace_notification() {
        let store = MemoryFastStore::new();
        let mut rx = store
            .psubscribe("__keyspace@0__:data:*.value")
            .await
            .unwrap();

        store.set("data:10.0.0.5:2404-100.ASDU", "M_ME_NB_1").await.unwrap();
        store.set("data:10.0.0.5:2404-100.value", "147").await.unwrap();

        let n = rx.recv().await.unwrap();
        assert_eq!(n.channel, "__keyspace@0__:data:10.0.0.5:2404-100.value");
        assert_eq!(n.payload, "set");
        assert!(rx.try_recv().is_err());
        assert_eq!(
            store.get("data:10.0.0.5:2404-100.value").await.unwrap().as_deref(),
            Some("147")
        );
    }

    #[tokio::test]
    async fn test_exact_subscription() {
        let store = MemoryFastStore::new();
        let mut rx = store
            .subscribe(&["operate:10.0.0.5:2404".to_string()])
            .await
            .unwrap();

        store.publish("select:10.0.0.5:2404", "1>0").await.unwrap();
        store.publish("operate:10.0.0.5:2404", "1>1").await.unwrap();

        let n = rx.recv().await.unwrap();
        assert_eq!(n.payload, "1>1");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let store = MemoryFastStore::new();
        let rx = store.subscribe(&["a".to_string()]).await.unwrap();
        assert_eq!(store.subscriber_count().await, 1);

        drop(rx);
        store.publish("a", "x").await.unwrap();
        assert_eq!(store.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_latest_record() {
        let ts = MemoryTimeSeries::new();
        let point = PointId::new("10.0.0.5:2404", "100");
        assert_eq!(ts.latest(&point).await.unwrap(), None);

        for (value, at) in [(1i64, 2000), (3, 1000)] {
            ts.append(TimeSeriesRecord::good(&point, PointValue::from(value), "M_ME_NB_1", at))
                .await
                .unwrap();
        }
        let latest = ts.latest(&point).await.unwrap().unwrap();
        assert_eq!(latest.value, PointValue::from(1i64));

        ts.set_failing(&point, true).await;
        assert!(ts.latest(&point).await.is_err());
    }

    #[tokio::test]
    async fn test_desired_state_revision() {
        let source = MemoryDesiredState::new(vec![]);
        let mut rx = source.watch();
        assert!(!rx.has_changed().unwrap());

        source
            .replace(vec![RtuDescriptor::new("10.0.0.5", true, "IFS_A")])
            .await;
        assert!(rx.has_changed().unwrap());
        assert_eq!(source.load().await.unwrap().descriptors.len(), 1);
    }

    #[tokio::test]
    async fn test_simulated_link() {
        let link = SimulatedLink::new();
        let rtu: RtuAddress = "10.0.0.5:2404".parse().unwrap();

        assert_eq!(link.operate(&rtu, "6000", "1").await, Err(LinkError::NotConnected));
        link.connect(&rtu).await.unwrap();
        link.operate(&rtu, "6000", "1").await.unwrap();
        assert_eq!(link.executed().await.len(), 1);

        link.set_probe_failing(&rtu, true).await;
        assert!(link.test_frame(&rtu).await.is_err());
        assert!(!link.is_connected(&rtu).await);

        link.set_unreachable(&rtu, true).await;
        assert!(link.connect(&rtu).await.is_err());
        assert_eq!(link.connect_attempts(&rtu).await, 2);
    }
}
