//! Controller-to-node request channels.
//!
//! The manager keeps one FIFO queue per destination node, each drained by a
//! dedicated sender task that connects lazily, sends requests one at a time
//! and reconnects after a failed send. `send_request` only enqueues. Shutdown
//! cancels every sender (dropping its connection, which interrupts blocked
//! I/O) and joins them under a budget that does not depend on the request
//! timeout.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::census::{ContextKind, ThreadCensus};
use crate::frame::{self, ACK};
use crate::types::{NodeId, TopicPartition};

/// Control-plane request sent by the controller to a broker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    LeaderAndIsr {
        partition: TopicPartition,
        leader: NodeId,
        leader_epoch: u32,
        isr: Vec<NodeId>,
    },
    UpdateMetadata {
        alive_nodes: Vec<NodeId>,
    },
    StopReplica {
        partition: TopicPartition,
        delete: bool,
    },
}

/// A request as it travels on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlEnvelope {
    pub controller_id: NodeId,
    pub controller_epoch: u64,
    pub correlation_id: u64,
    pub request: ControlRequest,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {addr} failed: {reason}")]
    ConnectFailure { addr: String, reason: String },
    #[error("send to {addr} failed: {reason}")]
    SendFailure { addr: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("request channel manager is not running")]
    NotRunning,
    #[error("unknown destination node {0}")]
    UnknownDestination(NodeId),
    #[error("request channel manager must be started inside a tokio runtime")]
    NoRuntime,
    #[error("encode control request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("{stragglers} request senders did not stop within {budget:?}")]
    ShutdownTimeout { stragglers: usize, budget: Duration },
}

/// Opens connections to destination nodes.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, addr: &str, timeout: Duration) -> Result<Box<dyn Connection>, TransportError>;
}

/// One established connection; used by a single sender at a time.
#[async_trait]
pub trait Connection: Send {
    /// Deliver one payload and wait for the peer's acknowledgement.
    async fn send(&mut self, payload: &[u8], timeout: Duration) -> Result<(), TransportError>;
    async fn close(&mut self);
}

/// Plain TCP connector speaking the framed control protocol.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpConnector;

struct TcpConnection {
    addr: String,
    stream: TcpStream,
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: &str, timeout: Duration) -> Result<Box<dyn Connection>, TransportError> {
        let stream = match time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                return Err(TransportError::ConnectFailure {
                    addr: addr.to_string(),
                    reason: err.to_string(),
                })
            }
            Err(_) => {
                return Err(TransportError::ConnectFailure {
                    addr: addr.to_string(),
                    reason: format!("timed out after {timeout:?}"),
                })
            }
        };
        let _ = stream.set_nodelay(true);
        Ok(Box::new(TcpConnection {
            addr: addr.to_string(),
            stream,
        }))
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send(&mut self, payload: &[u8], timeout: Duration) -> Result<(), TransportError> {
        let wire = frame::encode(payload);
        let stream = &mut self.stream;
        let exchange = async move {
            stream.write_all(&wire).await?;
            stream.flush().await?;
            let ack = stream.read_u8().await?;
            if ack != ACK {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unexpected ack byte {ack:#04x}"),
                ));
            }
            Ok(())
        };
        let reason = match time::timeout(timeout, exchange).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(err)) => err.to_string(),
            Err(_) => format!("no ack within {timeout:?}"),
        };
        Err(TransportError::SendFailure {
            addr: self.addr.clone(),
            reason,
        })
    }

    async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

/// Tuning for a `RequestChannelManager`.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Prefix for census names, normally `broker-<id>`.
    pub census_prefix: String,
    pub controller_id: NodeId,
    pub controller_epoch: u64,
    /// Per-attempt bound on connect and on send-until-ack.
    pub request_timeout: Duration,
    pub retry_backoff: Duration,
    /// `None` retries until shutdown.
    pub max_send_attempts: Option<u32>,
    pub shutdown_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            census_prefix: "broker-0".to_string(),
            controller_id: 0,
            controller_epoch: 0,
            request_timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_millis(100),
            max_send_attempts: None,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Default)]
struct DestinationStats {
    queued: AtomicU64,
    sent: AtomicU64,
    send_failures: AtomicU64,
    connects: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time counters for one destination.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DestinationStatsSnapshot {
    pub queued: u64,
    pub sent: u64,
    pub send_failures: u64,
    pub connects: u64,
    pub dropped: u64,
}

impl DestinationStats {
    fn snapshot(&self) -> DestinationStatsSnapshot {
        DestinationStatsSnapshot {
            queued: self.queued.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

struct QueuedRequest {
    correlation_id: u64,
    payload: Bytes,
}

/// Queue and sender task for one destination.
struct Destination {
    tx: mpsc::UnboundedSender<QueuedRequest>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Running {
    handle: Handle,
    cancel: CancellationToken,
    queues: HashMap<NodeId, Destination>,
}

enum Phase {
    Idle,
    Running(Running),
    Stopped,
}

struct ManagerState {
    phase: Phase,
    nodes: HashMap<NodeId, String>,
    stats: BTreeMap<NodeId, Arc<DestinationStats>>,
}

/// Dispatches control requests to cluster members.
pub struct RequestChannelManager {
    config: ChannelConfig,
    connector: Arc<dyn Connector>,
    census: ThreadCensus,
    state: Mutex<ManagerState>,
    next_correlation_id: AtomicU64,
}

impl RequestChannelManager {
    pub fn new(config: ChannelConfig, connector: Arc<dyn Connector>, census: ThreadCensus) -> Self {
        Self {
            config,
            connector,
            census,
            state: Mutex::new(ManagerState {
                phase: Phase::Idle,
                nodes: HashMap::new(),
                stats: BTreeMap::new(),
            }),
            next_correlation_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start accepting requests. Sender tasks run on the calling runtime.
    pub fn start(&self) -> Result<(), ChannelError> {
        let handle = Handle::try_current().map_err(|_| ChannelError::NoRuntime)?;
        let mut state = self.lock();
        if matches!(state.phase, Phase::Running(_)) {
            return Ok(());
        }
        state.phase = Phase::Running(Running {
            handle,
            cancel: CancellationToken::new(),
            queues: HashMap::new(),
        });
        tracing::info!(
            owner = %self.config.census_prefix,
            destinations = state.nodes.len(),
            "request channel manager started"
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        matches!(self.lock().phase, Phase::Running(_))
    }

    /// Add or re-address a destination. A live queue keeps its old address
    /// until the node is removed.
    pub fn add_node(&self, node: NodeId, addr: impl Into<String>) {
        let addr = addr.into();
        tracing::debug!(node_id = node, addr = %addr, "request channel destination added");
        self.lock().nodes.insert(node, addr);
    }

    /// Forget a destination and stop its sender, abandoning queued requests.
    pub async fn remove_node(&self, node: NodeId) {
        let destination = {
            let mut state = self.lock();
            state.nodes.remove(&node);
            match &mut state.phase {
                Phase::Running(running) => running.queues.remove(&node),
                _ => None,
            }
        };
        let Some(destination) = destination else {
            return;
        };
        destination.cancel.cancel();
        drop(destination.tx);
        let abort = destination.task.abort_handle();
        if time::timeout(self.config.shutdown_timeout, destination.task).await.is_err() {
            abort.abort();
            tracing::error!(
                node_id = node,
                budget = ?self.config.shutdown_timeout,
                "request sender did not stop after node removal; aborted"
            );
        }
    }

    /// Enqueue `request` for `destination` and return immediately.
    pub fn send_request(&self, destination: NodeId, request: ControlRequest) -> Result<(), ChannelError> {
        let mut state = self.lock();
        let ManagerState { phase, nodes, stats } = &mut *state;
        let Phase::Running(running) = phase else {
            return Err(ChannelError::NotRunning);
        };
        let addr = nodes
            .get(&destination)
            .ok_or(ChannelError::UnknownDestination(destination))?;

        let correlation_id = self.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        let envelope = ControlEnvelope {
            controller_id: self.config.controller_id,
            controller_epoch: self.config.controller_epoch,
            correlation_id,
            request,
        };
        let payload = Bytes::from(serde_json::to_vec(&envelope)?);
        let stats = stats.entry(destination).or_default().clone();

        let Running {
            handle,
            cancel: parent,
            queues,
        } = running;
        let queue = queues.entry(destination).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let cancel = parent.child_token();
            let sender = Sender {
                destination,
                addr: addr.clone(),
                connector: self.connector.clone(),
                config: self.config.clone(),
                stats: stats.clone(),
            };
            let task = self.census.spawn_on(
                handle,
                format!("{}/channel-sender/node-{destination}", self.config.census_prefix),
                ContextKind::Foreground,
                sender.run(rx, cancel.clone()),
            );
            Destination { tx, cancel, task }
        });

        stats.queued.fetch_add(1, Ordering::Relaxed);
        if queue
            .tx
            .send(QueuedRequest {
                correlation_id,
                payload,
            })
            .is_err()
        {
            // The sender only exits on cancellation, which implies shutdown.
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(ChannelError::NotRunning);
        }
        Ok(())
    }

    /// Per-destination counters, including destinations whose queue is gone.
    pub fn stats(&self) -> BTreeMap<NodeId, DestinationStatsSnapshot> {
        self.lock()
            .stats
            .iter()
            .map(|(node, stats)| (*node, stats.snapshot()))
            .collect()
    }

    /// Stop every sender within `shutdown_timeout`. Idempotent.
    pub async fn shutdown(&self) -> Result<(), ChannelError> {
        let running = {
            let mut state = self.lock();
            if !matches!(state.phase, Phase::Running(_)) {
                return Ok(());
            }
            match std::mem::replace(&mut state.phase, Phase::Stopped) {
                Phase::Running(running) => running,
                _ => return Ok(()),
            }
        };

        running.cancel.cancel();
        let mut tasks = Vec::with_capacity(running.queues.len());
        for (_, destination) in running.queues {
            drop(destination.tx);
            tasks.push(destination.task);
        }
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        let budget = self.config.shutdown_timeout;
        match time::timeout(budget, join_all(tasks)).await {
            Ok(results) => {
                for result in results {
                    if let Err(err) = result {
                        if err.is_panic() {
                            tracing::error!(error = ?err, "request sender panicked");
                        }
                    }
                }
                tracing::info!(owner = %self.config.census_prefix, "request channel manager stopped");
                Ok(())
            }
            Err(_) => {
                let stragglers = aborts.iter().filter(|abort| !abort.is_finished()).count();
                for abort in aborts {
                    abort.abort();
                }
                tracing::error!(
                    owner = %self.config.census_prefix,
                    stragglers,
                    budget = ?budget,
                    "request senders ignored cancellation; aborted"
                );
                Err(ChannelError::ShutdownTimeout { stragglers, budget })
            }
        }
    }
}

/// State owned by one destination's sender task.
struct Sender {
    destination: NodeId,
    addr: String,
    connector: Arc<dyn Connector>,
    config: ChannelConfig,
    stats: Arc<DestinationStats>,
}

enum Attempt {
    Delivered,
    Dropped,
    Cancelled,
}

impl Sender {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<QueuedRequest>, cancel: CancellationToken) {
        let mut conn: Option<Box<dyn Connection>> = None;
        loop {
            let request = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(request) => request,
                    None => break,
                },
            };
            match self.deliver_with_retry(&mut conn, &request, &cancel).await {
                Attempt::Delivered | Attempt::Dropped => {}
                Attempt::Cancelled => break,
            }
        }
        // Dropping the connection closes the socket without waiting on the peer.
        drop(conn);
        tracing::debug!(node_id = self.destination, "request sender exited");
    }

    async fn deliver_with_retry(
        &self,
        conn: &mut Option<Box<dyn Connection>>,
        request: &QueuedRequest,
        cancel: &CancellationToken,
    ) -> Attempt {
        let mut attempts = 0u32;
        loop {
            attempts = attempts.saturating_add(1);
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Attempt::Cancelled,
                result = self.deliver_once(conn, &request.payload) => result,
            };
            let err = match result {
                Ok(()) => {
                    self.stats.sent.fetch_add(1, Ordering::Relaxed);
                    return Attempt::Delivered;
                }
                Err(err) => err,
            };

            self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
            if let Some(mut broken) = conn.take() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Attempt::Cancelled,
                    _ = broken.close() => {}
                }
            }
            if self
                .config
                .max_send_attempts
                .is_some_and(|max| attempts >= max)
            {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    node_id = self.destination,
                    correlation_id = request.correlation_id,
                    attempts,
                    error = %err,
                    "dropping control request after exhausting send attempts"
                );
                return Attempt::Dropped;
            }
            tracing::debug!(
                node_id = self.destination,
                correlation_id = request.correlation_id,
                attempts,
                error = %err,
                "control request send failed; reconnecting"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Attempt::Cancelled,
                _ = time::sleep(self.config.retry_backoff) => {}
            }
        }
    }

    async fn deliver_once(
        &self,
        conn: &mut Option<Box<dyn Connection>>,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        if conn.is_none() {
            let fresh = self
                .connector
                .connect(&self.addr, self.config.request_timeout)
                .await?;
            self.stats.connects.fetch_add(1, Ordering::Relaxed);
            *conn = Some(fresh);
        }
        match conn.as_mut() {
            Some(connection) => connection.send(payload, self.config.request_timeout).await,
            None => Err(TransportError::SendFailure {
                addr: self.addr.clone(),
                reason: "connection unavailable".to_string(),
            }),
        }
    }
}
