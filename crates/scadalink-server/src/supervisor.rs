//! RTU connection supervisor.
//!
//! Reconciles the live connection set against the desired set on a fixed
//! interval. Each cycle:
//!
//! 1. reloads and validates the descriptor list if the change feed fired
//!    (always on the first cycle), tearing down removed RTUs and adding new
//!    ones as `Disconnected`;
//! 2. runs one step per connection, all concurrently: connect attempts for
//!    `Disconnected`/`Failed` RTUs, health probes for `Connected` ones.
//!
//! The `connections:<rtu>.active` flag in the fast store mirrors each
//! connection's state, and command channels are attached exactly while an
//! RTU is connected.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use scadalink_core::{ConnectionState, DesiredSet, GatewayConfig, RetryPolicy, RtuAddress};

use crate::backend::{DesiredStateSource, FastStore, RtuLink};
use crate::commands::CommandRouter;
use crate::error::LinkError;

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub fleet: String,
    pub fleet_limit: usize,
    pub interval: Duration,
    pub connect_timeout: Duration,
    pub probe_timeout: Duration,
    pub retry: RetryPolicy,
}

impl SupervisorSettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            fleet: config.fleet.clone(),
            fleet_limit: config.fleet_limit,
            interval: config.supervisor_interval(),
            connect_timeout: config.connect_timeout(),
            probe_timeout: config.probe_timeout(),
            retry: config.retry.clone(),
        }
    }
}

/// Externally visible state of one connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub address: RtuAddress,
    pub state: ConnectionState,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// Shared view of the connection table, refreshed after every cycle.
pub type StatusHandle = Arc<RwLock<Vec<ConnectionStatus>>>;

/// What a reconciliation cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub reloaded: bool,
    pub added: Vec<RtuAddress>,
    pub removed: Vec<RtuAddress>,
    pub connected: Vec<RtuAddress>,
    pub failed: Vec<RtuAddress>,
    pub lost: Vec<RtuAddress>,
}

struct RtuConnection {
    address: RtuAddress,
    state: ConnectionState,
    last_health_check_at: Option<DateTime<Utc>>,
    retry_after: Option<Instant>,
    failures: u32,
}

impl RtuConnection {
    fn new(address: RtuAddress) -> Self {
        Self {
            address,
            state: ConnectionState::Disconnected,
            last_health_check_at: None,
            retry_after: None,
            failures: 0,
        }
    }

    fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            address: self.address.clone(),
            state: self.state,
            last_health_check_at: self.last_health_check_at,
            consecutive_failures: self.failures,
        }
    }
}

enum Step {
    Waiting,
    Connected,
    Failed,
    Healthy,
    Lost,
}

/// Everything a per-connection step needs, split from the connection table
/// so steps can borrow it while the table is borrowed mutably.
struct LinkContext {
    link: Arc<dyn RtuLink>,
    fast: Arc<dyn FastStore>,
    commands: Arc<CommandRouter>,
    settings: SupervisorSettings,
}

impl LinkContext {
    async fn set_active(&self, rtu: &RtuAddress, active: bool) {
        let flag = if active { "1" } else { "0" };
        if let Err(e) = self.fast.set(&rtu.active_key(), flag).await {
            warn!(rtu = %rtu, error = %e, "Cannot update connection flag");
        }
    }

    async fn attach_commands(&self, rtu: &RtuAddress) {
        if let Err(e) = self.commands.attach(rtu).await {
            warn!(rtu = %rtu, error = %e, "Cannot attach command channels");
        }
    }

    async fn step(&self, conn: &mut RtuConnection, now: Instant) -> (RtuAddress, Step) {
        let step = match conn.state {
            ConnectionState::Disconnected | ConnectionState::Failed => {
                if conn.retry_after.is_some_and(|at| now < at) {
                    Step::Waiting
                } else {
                    self.connect(conn, now).await
                }
            }
            ConnectionState::Connected => self.probe(conn).await,
            ConnectionState::Connecting => Step::Waiting,
        };
        (conn.address.clone(), step)
    }

    async fn connect(&self, conn: &mut RtuConnection, now: Instant) -> Step {
        let rtu = conn.address.clone();
        conn.state = ConnectionState::Connecting;
        debug!(rtu = %rtu, "Connecting");

        let result = timeout(self.settings.connect_timeout, self.link.connect(&rtu))
            .await
            .unwrap_or(Err(LinkError::Timeout));

        match result {
            Ok(()) => {
                conn.state = ConnectionState::Connected;
                conn.last_health_check_at = Some(Utc::now());
                conn.retry_after = None;
                conn.failures = 0;
                self.set_active(&rtu, true).await;
                self.attach_commands(&rtu).await;
                info!(rtu = %rtu, "RTU connected");
                Step::Connected
            }
            Err(e) => {
                self.link.disconnect(&rtu).await;
                conn.state = ConnectionState::Failed;
                conn.failures = conn.failures.saturating_add(1);
                let delay = self.settings.retry.delay(conn.failures);
                conn.retry_after = (!delay.is_zero()).then(|| now + delay);
                self.set_active(&rtu, false).await;
                warn!(rtu = %rtu, error = %e, failures = conn.failures, retry_in = ?delay, "Connect failed");
                Step::Failed
            }
        }
    }

    async fn probe(&self, conn: &mut RtuConnection) -> Step {
        let rtu = conn.address.clone();
        let result = timeout(self.settings.probe_timeout, self.link.test_frame(&rtu))
            .await
            .unwrap_or(Err(LinkError::Timeout));

        match result {
            Ok(()) => {
                conn.last_health_check_at = Some(Utc::now());
                if !self.commands.is_attached(&rtu).await {
                    self.attach_commands(&rtu).await;
                }
                Step::Healthy
            }
            Err(e) => {
                conn.state = ConnectionState::Disconnected;
                self.commands.detach(&rtu).await;
                self.link.disconnect(&rtu).await;
                self.set_active(&rtu, false).await;
                warn!(rtu = %rtu, error = %e, "Health probe failed, connection lost");
                Step::Lost
            }
        }
    }
}

pub struct RtuSupervisor {
    source: Arc<dyn DesiredStateSource>,
    revision: watch::Receiver<u64>,
    reload_pending: bool,
    desired: DesiredSet,
    connections: BTreeMap<RtuAddress, RtuConnection>,
    ctx: LinkContext,
    status: StatusHandle,
}

impl RtuSupervisor {
    pub fn new(
        source: Arc<dyn DesiredStateSource>,
        link: Arc<dyn RtuLink>,
        fast: Arc<dyn FastStore>,
        commands: Arc<CommandRouter>,
        settings: SupervisorSettings,
    ) -> Self {
        let revision = source.watch();
        Self {
            source,
            revision,
            reload_pending: true,
            desired: DesiredSet::default(),
            connections: BTreeMap::new(),
            ctx: LinkContext {
                link,
                fast,
                commands,
                settings,
            },
            status: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn status_handle(&self) -> StatusHandle {
        self.status.clone()
    }

    pub fn connections(&self) -> Vec<ConnectionStatus> {
        self.connections.values().map(RtuConnection::status).collect()
    }

    pub fn state_of(&self, rtu: &RtuAddress) -> Option<ConnectionState> {
        self.connections.get(rtu).map(|c| c.state)
    }

    /// Reconcile until cancelled, then tear everything down.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.ctx.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            fleet = %self.ctx.settings.fleet,
            interval = ?self.ctx.settings.interval,
            "RTU supervisor started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
            }
        }

        self.shutdown().await;
        info!("RTU supervisor stopped");
    }

    /// One reconciliation cycle.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();

        let changed = self.revision.has_changed().unwrap_or(false);
        if self.reload_pending || changed {
            self.reconcile(&mut report).await;
        }

        let now = Instant::now();
        let ctx = &self.ctx;
        let steps = join_all(
            self.connections
                .values_mut()
                .map(|conn| ctx.step(conn, now)),
        )
        .await;

        for (rtu, step) in steps {
            match step {
                Step::Connected => report.connected.push(rtu),
                Step::Failed => report.failed.push(rtu),
                Step::Lost => report.lost.push(rtu),
                Step::Waiting | Step::Healthy => {}
            }
        }

        self.publish_status().await;
        report
    }

    /// Tear down every connection.
    pub async fn shutdown(&mut self) {
        let addresses: Vec<RtuAddress> = self.connections.keys().cloned().collect();
        for rtu in &addresses {
            self.teardown(rtu).await;
        }
        self.desired = DesiredSet::default();
        self.publish_status().await;
    }

    async fn reconcile(&mut self, report: &mut CycleReport) {
        self.revision.borrow_and_update();

        let list = match self.source.load().await {
            Ok(list) => list,
            Err(e) => {
                self.reload_pending = true;
                warn!(error = %e, "Cannot load RTU descriptors, keeping current set");
                return;
            }
        };
        self.reload_pending = false;
        report.reloaded = true;

        let settings = &self.ctx.settings;
        let (next, issues) =
            DesiredSet::from_descriptors(&list.descriptors, &settings.fleet, settings.fleet_limit);
        for issue in list.rejected.iter().chain(&issues) {
            warn!(fleet = %settings.fleet, %issue, "Descriptor issue");
        }

        let diff = self.desired.diff(&next);
        for rtu in &diff.removed {
            self.teardown(rtu).await;
            info!(rtu = %rtu, "RTU removed");
        }
        for rtu in &diff.added {
            self.connections
                .insert(rtu.clone(), RtuConnection::new(rtu.clone()));
            self.ctx.set_active(rtu, false).await;
            debug!(rtu = %rtu, "RTU added");
        }

        if !diff.is_empty() {
            info!(
                added = diff.added.len(),
                removed = diff.removed.len(),
                total = next.len(),
                "Desired set changed"
            );
        }

        self.desired = next;
        report.added = diff.added;
        report.removed = diff.removed;
    }

    async fn teardown(&mut self, rtu: &RtuAddress) {
        if self.connections.remove(rtu).is_none() {
            return;
        }
        self.ctx.commands.detach(rtu).await;
        self.ctx.link.disconnect(rtu).await;
        self.ctx.set_active(rtu, false).await;
    }

    async fn publish_status(&self) {
        *self.status.write().await = self.connections();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_source::FileDesiredState;
    use crate::memory::{MemoryDesiredState, MemoryFastStore, SimulatedLink};
    use pretty_assertions::assert_eq;
    use scadalink_core::{Command, CommandKind, RtuDescriptor};

    struct Fixture {
        source: Arc<MemoryDesiredState>,
        link: Arc<SimulatedLink>,
        fast: Arc<MemoryFastStore>,
        commands: Arc<CommandRouter>,
        supervisor: RtuSupervisor,
    }

    fn settings() -> SupervisorSettings {
        SupervisorSettings {
            fleet: "IFS_A".to_string(),
            fleet_limit: 100,
            interval: Duration::from_millis(100),
            connect_timeout: Duration::from_millis(50),
            probe_timeout: Duration::from_millis(50),
            retry: RetryPolicy::Fixed,
        }
    }

    fn fixture(hosts: &[&str], settings: SupervisorSettings) -> Fixture {
        let source = Arc::new(MemoryDesiredState::new(descriptors(hosts)));
        let link = Arc::new(SimulatedLink::new());
        let fast = Arc::new(MemoryFastStore::new());
        let commands = Arc::new(CommandRouter::new(
            fast.clone(),
            link.clone(),
            8,
            CancellationToken::new(),
        ));
        let supervisor = RtuSupervisor::new(
            source.clone(),
            link.clone(),
            fast.clone(),
            commands.clone(),
            settings,
        );
        Fixture {
            source,
            link,
            fast,
            commands,
            supervisor,
        }
    }

    fn descriptors(hosts: &[&str]) -> Vec<RtuDescriptor> {
        hosts
            .iter()
            .map(|h| RtuDescriptor::new(*h, true, "IFS_A"))
            .collect()
    }

    fn addr(host: &str) -> RtuAddress {
        host.parse().unwrap()
    }

    async fn active_flag(fast: &MemoryFastStore, rtu: &RtuAddress) -> Option<String> {
        fast.get(&rtu.active_key()).await.unwrap()
    }

    #[tokio::test]
    async fn test_first_cycle_connects_everything() {
        let mut f = fixture(&["10.0.0.1", "10.0.0.2"], settings());

        let report = f.supervisor.run_cycle().await;
        assert!(report.reloaded);
        assert_eq!(report.added, vec![addr("10.0.0.1"), addr("10.0.0.2")]);
        assert_eq!(report.connected, vec![addr("10.0.0.1"), addr("10.0.0.2")]);

        for host in ["10.0.0.1", "10.0.0.2"] {
            assert_eq!(active_flag(&f.fast, &addr(host)).await.as_deref(), Some("1"));
            assert!(f.commands.is_attached(&addr(host)).await);
        }

        // Nothing changed: no reload, probes only.
        let report = f.supervisor.run_cycle().await;
        assert!(!report.reloaded);
        assert!(report.connected.is_empty());
        assert_eq!(f.link.connect_attempts(&addr("10.0.0.1")).await, 1);
    }

    #[tokio::test]
    async fn test_desired_set_change_applied_in_one_cycle() {
        let (a, b, c) = (addr("10.0.0.1"), addr("10.0.0.2"), addr("10.0.0.3"));
        let mut f = fixture(&["10.0.0.1", "10.0.0.2"], settings());
        f.supervisor.run_cycle().await;

        f.source.replace(descriptors(&["10.0.0.2", "10.0.0.3"])).await;
        let report = f.supervisor.run_cycle().await;

        assert_eq!(report.removed, vec![a.clone()]);
        assert_eq!(report.added, vec![c.clone()]);
        assert_eq!(report.connected, vec![c.clone()]);

        assert_eq!(f.supervisor.state_of(&a), None);
        assert!(!f.link.is_connected(&a).await);
        assert!(!f.commands.is_attached(&a).await);
        assert_eq!(active_flag(&f.fast, &a).await.as_deref(), Some("0"));

        // b was left alone.
        assert_eq!(f.link.connect_attempts(&b).await, 1);
        assert_eq!(f.supervisor.state_of(&b), Some(ConnectionState::Connected));
        assert_eq!(f.supervisor.state_of(&c), Some(ConnectionState::Connected));
    }

    #[tokio::test]
    async fn test_unreachable_rtu_fails_and_retries() {
        let rtu = addr("10.0.0.9");
        let mut f = fixture(&["10.0.0.9"], settings());
        f.link.set_unreachable(&rtu, true).await;

        let report = f.supervisor.run_cycle().await;
        assert_eq!(report.failed, vec![rtu.clone()]);
        assert_eq!(f.supervisor.state_of(&rtu), Some(ConnectionState::Failed));
        assert_eq!(active_flag(&f.fast, &rtu).await.as_deref(), Some("0"));
        assert!(!f.commands.is_attached(&rtu).await);

        f.supervisor.run_cycle().await;
        assert_eq!(f.link.connect_attempts(&rtu).await, 2);

        f.link.set_unreachable(&rtu, false).await;
        let report = f.supervisor.run_cycle().await;
        assert_eq!(report.connected, vec![rtu.clone()]);
        assert_eq!(active_flag(&f.fast, &rtu).await.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_failed_probe_detaches_commands() {
        let rtu = addr("10.0.0.1");
        let mut f = fixture(&["10.0.0.1"], settings());
        f.supervisor.run_cycle().await;
        assert!(
            f.commands
                .submit(&rtu, Command::new(CommandKind::Select, "6000", "1"))
                .await
        );

        f.link.set_probe_failing(&rtu, true).await;
        let report = f.supervisor.run_cycle().await;
        assert_eq!(report.lost, vec![rtu.clone()]);
        assert_eq!(f.supervisor.state_of(&rtu), Some(ConnectionState::Disconnected));
        assert_eq!(active_flag(&f.fast, &rtu).await.as_deref(), Some("0"));

        assert!(
            !f.commands
                .submit(&rtu, Command::new(CommandKind::Operate, "6000", "1"))
                .await
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        let executed = f.link.executed().await;
        assert!(executed
            .iter()
            .all(|(_, c)| c.kind == CommandKind::Select));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_rtu_does_not_delay_others() {
        let (slow, quick) = (addr("10.0.0.1"), addr("10.0.0.2"));
        let mut f = fixture(&["10.0.0.1", "10.0.0.2"], settings());
        f.link.set_hanging(&slow, true).await;

        let started = Instant::now();
        let report = f.supervisor.run_cycle().await;
        assert!(started.elapsed() < Duration::from_millis(100));

        assert_eq!(report.connected, vec![quick]);
        assert_eq!(report.failed, vec![slow.clone()]);
        assert_eq!(f.supervisor.state_of(&slow), Some(ConnectionState::Failed));
    }

    #[tokio::test]
    async fn test_fleet_limit_caps_connections() {
        let hosts: Vec<String> = (1..=150).map(|i| format!("10.0.1.{i}")).collect();
        let host_refs: Vec<&str> = hosts.iter().map(String::as_str).collect();
        let mut f = fixture(&host_refs, settings());

        let report = f.supervisor.run_cycle().await;
        assert_eq!(report.added.len(), 100);
        assert_eq!(f.supervisor.connections().len(), 100);
        assert_eq!(f.supervisor.status_handle().read().await.len(), 100);
        assert_eq!(f.supervisor.state_of(&addr("10.0.1.101")), None);
    }

    #[tokio::test]
    async fn test_other_fleets_and_disabled_ignored() {
        let mut f = fixture(&[], settings());
        f.source
            .replace(vec![
                RtuDescriptor::new("10.0.0.1", true, "IFS_A"),
                RtuDescriptor::new("10.0.0.2", false, "IFS_A"),
                RtuDescriptor::new("10.0.0.3", true, "IFS_B"),
                RtuDescriptor::new("not a host", true, "IFS_A"),
            ])
            .await;

        let report = f.supervisor.run_cycle().await;
        assert_eq!(report.added, vec![addr("10.0.0.1")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exponential_backoff() {
        let rtu = addr("10.0.0.1");
        let mut s = settings();
        s.retry = RetryPolicy::Exponential {
            base_ms: 1000,
            max_ms: 4000,
        };
        let mut f = fixture(&["10.0.0.1"], s);
        f.link.set_unreachable(&rtu, true).await;

        f.supervisor.run_cycle().await;
        f.supervisor.run_cycle().await;
        assert_eq!(f.link.connect_attempts(&rtu).await, 1);

        tokio::time::advance(Duration::from_millis(1000)).await;
        f.supervisor.run_cycle().await;
        assert_eq!(f.link.connect_attempts(&rtu).await, 2);

        // Second failure doubles the wait.
        tokio::time::advance(Duration::from_millis(1000)).await;
        f.supervisor.run_cycle().await;
        assert_eq!(f.link.connect_attempts(&rtu).await, 2);
        tokio::time::advance(Duration::from_millis(1000)).await;
        f.supervisor.run_cycle().await;
        assert_eq!(f.link.connect_attempts(&rtu).await, 3);
    }

    #[tokio::test]
    async fn test_shutdown_tears_down() {
        let rtu = addr("10.0.0.1");
        let mut f = fixture(&["10.0.0.1"], settings());
        f.supervisor.run_cycle().await;

        f.supervisor.shutdown().await;
        assert!(f.supervisor.connections().is_empty());
        assert!(!f.link.is_connected(&rtu).await);
        assert!(!f.commands.is_attached(&rtu).await);
        assert_eq!(active_flag(&f.fast, &rtu).await.as_deref(), Some("0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_cancelled() {
        let rtu = addr("10.0.0.1");
        let f = fixture(&["10.0.0.1"], settings());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(f.supervisor.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(f.link.is_connected(&rtu).await);

        cancel.cancel();
        handle.await.unwrap();
        assert!(!f.link.is_connected(&rtu).await);
    }

    #[tokio::test]
    async fn test_malformed_descriptor_does_not_block_valid_ones() {
        let path = std::env::temp_dir().join(format!("scadalink-rtus-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"[{"RTU": "10.0.0.1", "enabled": true, "IFS": "IFS_A"},
                {"RTU": "10.0.0.2", "enabled": 2, "IFS": "IFS_A"},
                {"RTU": "10.0.0.3", "enabled": true, "IFS": "IFS_A"}]"#,
        )
        .unwrap();

        let link = Arc::new(SimulatedLink::new());
        let fast = Arc::new(MemoryFastStore::new());
        let commands = Arc::new(CommandRouter::new(
            fast.clone(),
            link.clone(),
            8,
            CancellationToken::new(),
        ));
        let mut supervisor = RtuSupervisor::new(
            Arc::new(FileDesiredState::new(&path)),
            link.clone(),
            fast.clone(),
            commands,
            settings(),
        );

        let report = supervisor.run_cycle().await;
        assert!(report.reloaded);
        assert_eq!(report.connected, vec![addr("10.0.0.1"), addr("10.0.0.3")]);
        assert_eq!(supervisor.state_of(&addr("10.0.0.2")), None);
        assert!(link.is_connected(&addr("10.0.0.1")).await);
        std::fs::remove_file(&path).unwrap();
    }
}
