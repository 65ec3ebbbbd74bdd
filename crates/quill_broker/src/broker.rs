//! Broker lifecycle: startup, steady state and orderly shutdown.
//!
//! The controller owns every resource a running broker holds. Startup acquires
//! them in dependency order and, if any step fails, hands whatever it already
//! holds to the same release path a normal shutdown uses. Shutdown flushes and
//! checkpoints every partition before letting go of storage, then stops the
//! network side and leaves the membership.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::{self, JoinHandle};
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::census::{ContextKind, ThreadCensus};
use crate::channel::{Connector, RequestChannelManager, TcpConnector};
use crate::checkpoint::RecoveryCheckpointStore;
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::listener::{ControlListener, ControlView};
use crate::log::LogManager;
use crate::membership::{MembershipService, Registration};
use crate::types::{BrokerState, NodeId, TopicPartition};

/// Transitions kept for `state_transitions`.
const TRANSITION_HISTORY: usize = 64;

#[derive(Debug)]
pub struct StartupFailure {
    pub error: BrokerError,
    /// `NotRunning` if nothing had been acquired yet, else `ShuttingDown`.
    pub state_at_failure: BrokerState,
}

#[derive(Debug)]
pub enum StartupOutcome {
    Started,
    Failed(StartupFailure),
}

impl StartupOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started)
    }

    pub fn failure(&self) -> Option<&StartupFailure> {
        match self {
            Self::Started => None,
            Self::Failed(failure) => Some(failure),
        }
    }

    pub fn into_result(self) -> Result<(), BrokerError> {
        match self {
            Self::Started => Ok(()),
            Self::Failed(failure) => Err(failure.error),
        }
    }
}

#[derive(Debug)]
pub struct ShutdownReport {
    /// `false` when the broker was already stopped.
    pub performed: bool,
    /// Failures tolerated along the way.
    pub errors: Vec<BrokerError>,
    pub elapsed: Duration,
}

type SharedLogs = Arc<Mutex<LogManager>>;

fn lock_logs(logs: &SharedLogs) -> MutexGuard<'_, LogManager> {
    logs.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Checkpointer {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Everything a running (or half-started) broker holds.
#[derive(Default)]
struct Resources {
    logs: Option<SharedLogs>,
    listener: Option<ControlListener>,
    checkpointer: Option<Checkpointer>,
    channels: Option<Arc<RequestChannelManager>>,
    registered: bool,
}

impl Drop for Resources {
    /// `release` empties every field, so anything left here belongs to a
    /// startup that was dropped midway.
    fn drop(&mut self) {
        if let Some(checkpointer) = self.checkpointer.take() {
            checkpointer.cancel.cancel();
            checkpointer.task.abort();
        }
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        if let Some(channels) = self.channels.take() {
            if let Ok(handle) = Handle::try_current() {
                handle.spawn(async move {
                    let _ = channels.shutdown().await;
                });
            }
        }
    }
}

/// Returns the broker to `NOT_RUNNING` if `startup` is dropped before it
/// settles on an outcome.
struct StartupGuard<'a> {
    controller: &'a BrokerLifecycleController,
    connected: bool,
    armed: bool,
}

impl<'a> StartupGuard<'a> {
    fn new(controller: &'a BrokerLifecycleController) -> Self {
        Self {
            controller,
            connected: false,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StartupGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::warn!(
            node_id = self.controller.config.node_id,
            "startup abandoned before completion"
        );
        if self.connected {
            let membership = self.controller.membership.clone();
            if let Ok(handle) = Handle::try_current() {
                handle.spawn(async move { membership.disconnect().await });
            }
        }
        self.controller.transition(BrokerState::NotRunning);
    }
}

fn membership_timeout(timeout: Duration) -> BrokerError {
    BrokerError::DependencyTimeout {
        service: "membership".to_string(),
        timeout,
    }
}

pub struct BrokerLifecycleController {
    config: BrokerConfig,
    membership: Arc<dyn MembershipService>,
    connector: Arc<dyn Connector>,
    census: ThreadCensus,
    control_view: Arc<ControlView>,
    /// `Some` exactly while the broker is running; serializes transitions.
    lifecycle: tokio::sync::Mutex<Option<Resources>>,
    state_tx: watch::Sender<BrokerState>,
    transitions: Mutex<VecDeque<BrokerState>>,
}

impl BrokerLifecycleController {
    pub fn new(config: BrokerConfig, membership: Arc<dyn MembershipService>) -> Self {
        let (state_tx, _) = watch::channel(BrokerState::NotRunning);
        Self {
            config,
            membership,
            connector: Arc::new(TcpConnector),
            census: ThreadCensus::new(),
            control_view: Arc::new(ControlView::new()),
            lifecycle: tokio::sync::Mutex::new(None),
            state_tx,
            transitions: Mutex::new(VecDeque::from([BrokerState::NotRunning])),
        }
    }

    /// Replace the connector used by the controller's request channels.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Register contexts in a shared census instead of a private one.
    pub fn with_census(mut self, census: ThreadCensus) -> Self {
        self.census = census;
        self
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn state(&self) -> BrokerState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<BrokerState> {
        self.state_tx.subscribe()
    }

    /// Recent states in the order they were entered, oldest first.
    pub fn state_transitions(&self) -> Vec<BrokerState> {
        self.transitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    pub fn census(&self) -> &ThreadCensus {
        &self.census
    }

    pub fn census_prefix(&self) -> String {
        format!("{}/", self.config.census_prefix())
    }

    pub fn control_view(&self) -> Arc<ControlView> {
        self.control_view.clone()
    }

    pub fn leader_for(&self, tp: &TopicPartition) -> Option<NodeId> {
        self.control_view.leader_for(tp)
    }

    pub async fn control_listen_addr(&self) -> Option<SocketAddr> {
        self.lifecycle
            .lock()
            .await
            .as_ref()
            .and_then(|res| res.listener.as_ref())
            .map(ControlListener::local_addr)
    }

    /// The controller's request channels; `None` unless running with the
    /// controller role.
    pub async fn channel_manager(&self) -> Option<Arc<RequestChannelManager>> {
        self.lifecycle
            .lock()
            .await
            .as_ref()
            .and_then(|res| res.channels.clone())
    }

    fn transition(&self, next: BrokerState) {
        let previous = self.state_tx.send_replace(next);
        {
            let mut history = self.transitions.lock().unwrap_or_else(PoisonError::into_inner);
            if history.len() == TRANSITION_HISTORY {
                history.pop_front();
            }
            history.push_back(next);
        }
        tracing::info!(
            node_id = self.config.node_id,
            from = %previous,
            to = %next,
            "broker state transition"
        );
    }

    /// Bring the broker to `RUNNING`, or report why it could not.
    pub async fn startup(&self) -> StartupOutcome {
        let mut slot = self.lifecycle.lock().await;
        let current = self.state();
        if current != BrokerState::NotRunning || slot.is_some() {
            return StartupOutcome::Failed(StartupFailure {
                error: BrokerError::InvalidState {
                    expected: BrokerState::NotRunning,
                    actual: current,
                },
                state_at_failure: current,
            });
        }

        let started = Instant::now();
        self.transition(BrokerState::Starting);
        let mut guard = StartupGuard::new(self);

        let timeout = self.config.registration_timeout;
        let connected = match time::timeout(timeout, self.membership.connect(timeout)).await {
            Ok(result) => result,
            Err(_) => Err(membership_timeout(timeout)),
        };
        if let Err(error) = connected {
            tracing::error!(
                node_id = self.config.node_id,
                error = %error,
                "membership connect failed before startup"
            );
            guard.disarm();
            self.transition(BrokerState::NotRunning);
            return StartupOutcome::Failed(StartupFailure {
                error,
                state_at_failure: BrokerState::NotRunning,
            });
        }
        guard.connected = true;

        let mut resources = Resources::default();
        match self.acquire(&mut resources).await {
            Ok(()) => {
                *slot = Some(resources);
                guard.disarm();
                self.transition(BrokerState::Running);
                tracing::info!(
                    node_id = self.config.node_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "broker started"
                );
                StartupOutcome::Started
            }
            Err(error) => {
                tracing::error!(
                    node_id = self.config.node_id,
                    error = %error,
                    "broker startup failed; releasing acquired resources"
                );
                self.transition(BrokerState::ShuttingDown);
                for err in self.release(resources).await {
                    tracing::warn!(error = %err, "release after failed startup");
                }
                self.membership.disconnect().await;
                guard.disarm();
                self.transition(BrokerState::NotRunning);
                StartupOutcome::Failed(StartupFailure {
                    error,
                    state_at_failure: BrokerState::ShuttingDown,
                })
            }
        }
    }

    async fn acquire(&self, res: &mut Resources) -> Result<(), BrokerError> {
        let dirs = self.config.storage_dirs.clone();
        let logs = task::spawn_blocking(move || LogManager::open(&dirs, RecoveryCheckpointStore::new()))
            .await
            .map_err(|err| anyhow::anyhow!("log recovery task failed: {err}"))??;
        tracing::info!(
            node_id = self.config.node_id,
            partitions = logs.partitions().len(),
            "storage directories acquired"
        );
        let logs = Arc::new(Mutex::new(logs));
        res.logs = Some(logs.clone());

        let prefix = self.config.census_prefix();
        let listener = ControlListener::bind(
            &self.config.listen_control,
            self.control_view.clone(),
            &self.census,
            &prefix,
        )
        .await?;
        let control_addr = listener.local_addr();
        res.listener = Some(listener);

        if let Some(interval) = self.config.checkpoint_interval {
            let cancel = CancellationToken::new();
            let task = self.census.spawn(
                format!("{prefix}/checkpointer"),
                ContextKind::Background,
                run_checkpointer(logs, interval, cancel.clone()),
            );
            res.checkpointer = Some(Checkpointer { cancel, task });
        }

        if self.config.has_controller_role {
            let channels = Arc::new(RequestChannelManager::new(
                self.config.channel_config(),
                self.connector.clone(),
                self.census.clone(),
            ));
            for (node, addr) in &self.config.peers {
                channels.add_node(*node, addr.clone());
            }
            channels.start().map_err(anyhow::Error::from)?;
            res.channels = Some(channels);
        }

        let registration = Registration {
            node_id: self.config.node_id,
            control_addr: control_addr.to_string(),
        };
        let timeout = self.config.registration_timeout;
        match time::timeout(timeout, self.membership.register(&registration, timeout)).await {
            Ok(result) => result?,
            Err(_) => return Err(membership_timeout(timeout)),
        }
        res.registered = true;
        Ok(())
    }

    /// Stop the broker. Idempotent; concurrent callers wait for the first.
    pub async fn shutdown(&self) -> ShutdownReport {
        let started = Instant::now();
        let mut slot = self.lifecycle.lock().await;
        let Some(resources) = slot.take() else {
            tracing::debug!(node_id = self.config.node_id, "shutdown requested while not running");
            return ShutdownReport {
                performed: false,
                errors: Vec::new(),
                elapsed: started.elapsed(),
            };
        };

        tracing::info!(node_id = self.config.node_id, "broker shutting down");
        self.transition(BrokerState::ShuttingDown);
        let errors = self.release(resources).await;
        for err in &errors {
            tracing::error!(node_id = self.config.node_id, error = %err, "shutdown step failed");
        }
        self.transition(BrokerState::NotRunning);

        let leftover = self.census.live_contexts(&self.census_prefix());
        if !leftover.is_empty() {
            tracing::error!(
                node_id = self.config.node_id,
                contexts = ?leftover,
                "contexts still alive after shutdown"
            );
        }
        let elapsed = started.elapsed();
        tracing::info!(
            node_id = self.config.node_id,
            elapsed_ms = elapsed.as_millis() as u64,
            tolerated_errors = errors.len(),
            "broker stopped"
        );
        ShutdownReport {
            performed: true,
            errors,
            elapsed,
        }
    }

    /// Release `res` in shutdown order, continuing past failures.
    async fn release(&self, mut res: Resources) -> Vec<BrokerError> {
        let mut errors = Vec::new();
        let budget = self.config.channel_shutdown_timeout;

        if let Some(checkpointer) = res.checkpointer.take() {
            checkpointer.cancel.cancel();
            let abort = checkpointer.task.abort_handle();
            if time::timeout(budget, checkpointer.task).await.is_err() {
                abort.abort();
                errors.push(BrokerError::ShutdownTimeout {
                    component: "checkpointer".to_string(),
                    budget,
                });
            }
        }

        if let Some(logs) = res.logs.take() {
            let flushed = task::spawn_blocking(move || {
                let mut logs = lock_logs(&logs);
                let errors = logs.checkpoint_all(true);
                logs.close();
                errors
            })
            .await;
            match flushed {
                Ok(flush_errors) => errors.extend(flush_errors),
                Err(err) => errors.push(anyhow::anyhow!("final checkpoint task failed: {err}").into()),
            }
        }

        if let Some(channels) = res.channels.take() {
            if channels.shutdown().await.is_err() {
                errors.push(BrokerError::ShutdownTimeout {
                    component: "request channel manager".to_string(),
                    budget,
                });
            }
        }

        if let Some(listener) = res.listener.take() {
            if let Err(err) = listener.shutdown(budget).await {
                errors.push(err);
            }
        }

        if res.registered {
            let timeout = self.config.registration_timeout;
            match time::timeout(timeout, self.membership.deregister(self.config.node_id, timeout)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => errors.push(err),
                Err(_) => errors.push(membership_timeout(timeout)),
            }
        }
        errors
    }

    fn running_logs(&self, slot: &Option<Resources>) -> Result<SharedLogs, BrokerError> {
        let state = self.state();
        match slot.as_ref().and_then(|res| res.logs.clone()) {
            Some(logs) if state == BrokerState::Running => Ok(logs),
            _ => Err(BrokerError::InvalidState {
                expected: BrokerState::Running,
                actual: state,
            }),
        }
    }

    pub async fn create_partition(&self, tp: &TopicPartition) -> Result<(), BrokerError> {
        let slot = self.lifecycle.lock().await;
        let logs = self.running_logs(&slot)?;
        let tp = tp.clone();
        task::spawn_blocking(move || lock_logs(&logs).create_partition(&tp))
            .await
            .map_err(|err| anyhow::anyhow!("create partition task failed: {err}"))?
    }

    /// Buffer `records`; returns the offset of the first one.
    pub async fn append(&self, tp: &TopicPartition, records: Vec<Bytes>) -> Result<u64, BrokerError> {
        let slot = self.lifecycle.lock().await;
        let logs = self.running_logs(&slot)?;
        let tp = tp.clone();
        task::spawn_blocking(move || lock_logs(&logs).append(&tp, records))
            .await
            .map_err(|err| anyhow::anyhow!("append task failed: {err}"))?
    }

    pub async fn read(&self, tp: &TopicPartition, from_offset: u64) -> Result<Vec<Bytes>, BrokerError> {
        let slot = self.lifecycle.lock().await;
        let logs = self.running_logs(&slot)?;
        let tp = tp.clone();
        task::spawn_blocking(move || lock_logs(&logs).read(&tp, from_offset))
            .await
            .map_err(|err| anyhow::anyhow!("read task failed: {err}"))?
    }

    /// Flush every partition and rewrite every checkpoint now.
    pub async fn flush(&self) -> Result<(), BrokerError> {
        let slot = self.lifecycle.lock().await;
        let logs = self.running_logs(&slot)?;
        let errors = task::spawn_blocking(move || lock_logs(&logs).checkpoint_all(false))
            .await
            .map_err(|err| anyhow::anyhow!("flush task failed: {err}"))?;
        match errors.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn run_checkpointer(logs: SharedLogs, interval: Duration, cancel: CancellationToken) {
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let logs = logs.clone();
        match task::spawn_blocking(move || lock_logs(&logs).checkpoint_all(false)).await {
            Ok(errors) => {
                for err in errors {
                    tracing::warn!(error = %err, "background checkpoint failed");
                }
            }
            Err(err) => tracing::warn!(error = ?err, "background checkpoint task join failure"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::membership::StaticMembership;

    fn broker(dir: &std::path::Path, membership: Arc<StaticMembership>) -> BrokerLifecycleController {
        let mut config = BrokerConfig::single_node(1, vec![dir.join("d0")]);
        config.registration_timeout = Duration::from_millis(100);
        BrokerLifecycleController::new(config, membership)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn startup_and_shutdown_walk_the_state_machine() {
        let root = tempfile::tempdir().unwrap();
        let membership = Arc::new(StaticMembership::new());
        let broker = broker(root.path(), membership.clone());

        assert!(broker.startup().await.is_started());
        assert_eq!(broker.state(), BrokerState::Running);
        assert!(membership.members().contains_key(&1));
        assert!(broker.control_listen_addr().await.is_some());
        assert!(broker.channel_manager().await.is_none());

        let report = broker.shutdown().await;
        assert!(report.performed);
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert_eq!(
            broker.state_transitions(),
            vec![
                BrokerState::NotRunning,
                BrokerState::Starting,
                BrokerState::Running,
                BrokerState::ShuttingDown,
                BrokerState::NotRunning,
            ]
        );
        assert!(membership.members().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_startup_is_invalid() {
        let root = tempfile::tempdir().unwrap();
        let broker = broker(root.path(), Arc::new(StaticMembership::new()));
        assert!(broker.startup().await.is_started());
        let outcome = broker.startup().await;
        let failure = outcome.failure().unwrap();
        assert_eq!(failure.error.kind(), FailureKind::InvalidState);
        assert_eq!(failure.state_at_failure, BrokerState::Running);
        assert_eq!(broker.state(), BrokerState::Running);
        broker.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreachable_membership_fails_before_acquiring_anything() {
        let root = tempfile::tempdir().unwrap();
        let membership = Arc::new(StaticMembership::new());
        membership.set_reachable(false);
        let broker = broker(root.path(), membership);

        let outcome = broker.startup().await;
        let failure = outcome.failure().unwrap();
        assert_eq!(failure.error.kind(), FailureKind::DependencyTimeout);
        assert_eq!(failure.state_at_failure, BrokerState::NotRunning);
        assert!(!broker.state_transitions().contains(&BrokerState::ShuttingDown));
        assert!(!root.path().join("d0").exists());
    }

    struct HangingConnect;

    #[async_trait::async_trait]
    impl MembershipService for HangingConnect {
        async fn connect(&self, _timeout: Duration) -> Result<(), BrokerError> {
            std::future::pending().await
        }

        async fn register(&self, _registration: &Registration, _timeout: Duration) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn deregister(&self, _node: NodeId, _timeout: Duration) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn disconnect(&self) {}
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn hanging_membership_connect_is_bounded_by_registration_timeout() {
        let root = tempfile::tempdir().unwrap();
        let mut config = BrokerConfig::single_node(1, vec![root.path().join("d0")]);
        config.registration_timeout = Duration::from_millis(300);
        let broker = BrokerLifecycleController::new(config, Arc::new(HangingConnect));

        let outcome = time::timeout(Duration::from_secs(3), broker.startup())
            .await
            .expect("startup must not outlive the registration timeout");
        let failure = outcome.failure().unwrap();
        assert_eq!(failure.error.kind(), FailureKind::DependencyTimeout);
        assert_eq!(failure.state_at_failure, BrokerState::NotRunning);
        assert_eq!(broker.state(), BrokerState::NotRunning);
        assert!(!broker.shutdown().await.performed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_startup_returns_to_not_running_and_can_retry() {
        let root = tempfile::tempdir().unwrap();
        let membership = Arc::new(StaticMembership::new());
        membership.set_accepting(false);
        let mut config = BrokerConfig::single_node(1, vec![root.path().join("d0")]);
        config.registration_timeout = Duration::from_secs(30);
        config.checkpoint_interval = None;
        let broker = BrokerLifecycleController::new(config, membership.clone());

        assert!(time::timeout(Duration::from_millis(300), broker.startup()).await.is_err());
        assert_eq!(broker.state(), BrokerState::NotRunning);
        assert_eq!(
            broker.state_transitions(),
            vec![BrokerState::NotRunning, BrokerState::Starting, BrokerState::NotRunning]
        );
        let deadline = Instant::now() + Duration::from_secs(5);
        while !broker.census().live_contexts("broker-1/").is_empty() {
            assert!(Instant::now() < deadline, "abandoned startup left contexts behind");
            time::sleep(Duration::from_millis(10)).await;
        }

        membership.set_accepting(true);
        assert!(broker.startup().await.is_started());
        assert!(membership.members().contains_key(&1));
        let report = broker.shutdown().await;
        assert!(report.errors.is_empty(), "{:?}", report.errors);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn data_api_requires_running() {
        let root = tempfile::tempdir().unwrap();
        let broker = broker(root.path(), Arc::new(StaticMembership::new()));
        let tp = TopicPartition::new("orders", 0);
        let err = broker.append(&tp, vec![Bytes::from_static(b"x")]).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::InvalidState);

        assert!(broker.startup().await.is_started());
        broker.create_partition(&tp).await.unwrap();
        assert_eq!(broker.append(&tp, vec![Bytes::from_static(b"x")]).await.unwrap(), 0);
        broker.flush().await.unwrap();
        broker.shutdown().await;

        let err = broker.read(&tp, 0).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::InvalidState);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn background_checkpointer_runs_and_stops() {
        let root = tempfile::tempdir().unwrap();
        let mut config = BrokerConfig::single_node(5, vec![root.path().join("d0")]);
        config.checkpoint_interval = Some(Duration::from_millis(20));
        let broker = BrokerLifecycleController::new(config, Arc::new(StaticMembership::new()));
        assert!(broker.startup().await.is_started());
        assert!(broker
            .census()
            .live_contexts("broker-5/")
            .iter()
            .any(|name| name == "broker-5/checkpointer"));

        let tp = TopicPartition::new("orders", 0);
        broker.create_partition(&tp).await.unwrap();
        broker.append(&tp, vec![Bytes::from_static(b"tick")]).await.unwrap();
        let checkpoint = RecoveryCheckpointStore::new();
        let dir = root.path().join("d0");
        let deadline = Instant::now() + Duration::from_secs(5);
        while checkpoint.read_checkpoint(&dir).unwrap().get(&tp) != Some(&1) {
            assert!(Instant::now() < deadline, "checkpointer never ran");
            time::sleep(Duration::from_millis(10)).await;
        }

        broker.shutdown().await;
        assert!(broker.census().live_contexts("broker-5/").is_empty());
    }
}
