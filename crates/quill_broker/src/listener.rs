//! Control-plane listener: the receiving end of a controller's request channel.
//!
//! Each accepted connection carries a sequence of frames holding JSON
//! `ControlEnvelope`s. Every decoded request is applied to the broker's
//! `ControlView` and acknowledged with a single byte.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::census::{ContextKind, ThreadCensus};
use crate::channel::{ControlEnvelope, ControlRequest};
use crate::error::BrokerError;
use crate::frame::{self, ACK};
use crate::types::{NodeId, TopicPartition};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartitionLeadership {
    pub leader: NodeId,
    pub leader_epoch: u32,
    pub isr_len: usize,
}

#[derive(Default)]
struct ViewState {
    controller_epoch: u64,
    leaders: HashMap<TopicPartition, PartitionLeadership>,
    stopped: BTreeSet<TopicPartition>,
    alive_nodes: Vec<NodeId>,
    applied: u64,
    fenced: u64,
}

/// The broker's view of cluster leadership as dictated by the controller.
#[derive(Default)]
pub struct ControlView {
    state: Mutex<ViewState>,
}

impl ControlView {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ViewState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply one request. Requests from an older controller epoch are fenced
    /// and return `false`.
    pub fn apply(&self, envelope: &ControlEnvelope) -> bool {
        let mut state = self.lock();
        if envelope.controller_epoch < state.controller_epoch {
            state.fenced += 1;
            tracing::warn!(
                controller_id = envelope.controller_id,
                controller_epoch = envelope.controller_epoch,
                current_epoch = state.controller_epoch,
                "ignoring control request from stale controller"
            );
            return false;
        }
        state.controller_epoch = envelope.controller_epoch;
        match &envelope.request {
            ControlRequest::LeaderAndIsr {
                partition,
                leader,
                leader_epoch,
                isr,
            } => {
                let stale = state
                    .leaders
                    .get(partition)
                    .is_some_and(|current| current.leader_epoch > *leader_epoch);
                if !stale {
                    state.stopped.remove(partition);
                    state.leaders.insert(
                        partition.clone(),
                        PartitionLeadership {
                            leader: *leader,
                            leader_epoch: *leader_epoch,
                            isr_len: isr.len(),
                        },
                    );
                }
            }
            ControlRequest::UpdateMetadata { alive_nodes } => {
                state.alive_nodes = alive_nodes.clone();
            }
            ControlRequest::StopReplica { partition, delete } => {
                state.leaders.remove(partition);
                state.stopped.insert(partition.clone());
                tracing::info!(partition = %partition, delete, "replica stopped by controller");
            }
        }
        state.applied += 1;
        true
    }

    pub fn leader_for(&self, tp: &TopicPartition) -> Option<NodeId> {
        self.lock().leaders.get(tp).map(|l| l.leader)
    }

    pub fn leadership(&self, tp: &TopicPartition) -> Option<PartitionLeadership> {
        self.lock().leaders.get(tp).copied()
    }

    pub fn is_stopped(&self, tp: &TopicPartition) -> bool {
        self.lock().stopped.contains(tp)
    }

    pub fn alive_nodes(&self) -> Vec<NodeId> {
        self.lock().alive_nodes.clone()
    }

    pub fn controller_epoch(&self) -> u64 {
        self.lock().controller_epoch
    }

    pub fn applied_count(&self) -> u64 {
        self.lock().applied
    }

    pub fn fenced_count(&self) -> u64 {
        self.lock().fenced
    }
}

/// Accept loop plus its connection handlers.
pub struct ControlListener {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ControlListener {
    /// Bind `addr` and start accepting. Contexts are registered under
    /// `<census_prefix>/control-listener`.
    pub async fn bind(
        addr: &str,
        view: Arc<ControlView>,
        census: &ThreadCensus,
        census_prefix: &str,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind control listener on {addr}"))?;
        let local_addr = listener.local_addr().context("control listener address")?;
        let cancel = CancellationToken::new();
        let task = census.spawn(
            format!("{census_prefix}/control-listener"),
            ContextKind::Foreground,
            accept_loop(
                listener,
                view,
                census.clone(),
                census_prefix.to_string(),
                cancel.clone(),
            ),
        );
        tracing::info!(addr = %local_addr, "control listener bound");
        Ok(Self {
            local_addr,
            cancel,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop without waiting for the accept loop to wind down.
    pub(crate) fn abort(self) {
        self.cancel.cancel();
        self.task.abort();
    }

    /// Stop accepting, drop every open connection and wait for the tasks.
    pub async fn shutdown(self, budget: Duration) -> Result<(), BrokerError> {
        self.cancel.cancel();
        let abort = self.task.abort_handle();
        match time::timeout(budget, self.task).await {
            Ok(_) => Ok(()),
            Err(_) => {
                abort.abort();
                Err(BrokerError::ShutdownTimeout {
                    component: "control listener".to_string(),
                    budget,
                })
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    view: Arc<ControlView>,
    census: ThreadCensus,
    census_prefix: String,
    cancel: CancellationToken,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let guard = census.register(
                        format!("{census_prefix}/control-conn/{peer}"),
                        ContextKind::Foreground,
                    );
                    let view = view.clone();
                    connections.spawn(async move {
                        let _guard = guard;
                        if let Err(err) = serve_connection(stream, &view).await {
                            tracing::debug!(peer = %peer, error = ?err, "control connection closed");
                        }
                    });
                }
                Err(err) => {
                    tracing::warn!(error = ?err, "control listener accept failed");
                    time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }
    connections.shutdown().await;
    tracing::info!("control listener stopped");
}

async fn serve_connection(mut stream: TcpStream, view: &ControlView) -> anyhow::Result<()> {
    let _ = stream.set_nodelay(true);
    while let Some(payload) = frame::read_frame(&mut stream).await.context("read control frame")? {
        let envelope: ControlEnvelope =
            serde_json::from_slice(&payload).context("decode control envelope")?;
        tracing::debug!(
            controller_id = envelope.controller_id,
            correlation_id = envelope.correlation_id,
            "control request received"
        );
        view.apply(&envelope);
        stream.write_all(&[ACK]).await.context("write control ack")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Connection, Connector, TcpConnector};

    fn envelope(epoch: u64, request: ControlRequest) -> ControlEnvelope {
        ControlEnvelope {
            controller_id: 1,
            controller_epoch: epoch,
            correlation_id: 1,
            request,
        }
    }

    fn leader_and_isr(leader: NodeId, leader_epoch: u32) -> ControlRequest {
        ControlRequest::LeaderAndIsr {
            partition: TopicPartition::new("orders", 0),
            leader,
            leader_epoch,
            isr: vec![1, 2],
        }
    }

    #[test]
    fn stale_controller_epoch_is_fenced() {
        let view = ControlView::new();
        assert!(view.apply(&envelope(5, leader_and_isr(2, 1))));
        assert!(!view.apply(&envelope(4, leader_and_isr(3, 2))));
        assert_eq!(view.leader_for(&TopicPartition::new("orders", 0)), Some(2));
        assert_eq!(view.fenced_count(), 1);
        assert_eq!(view.controller_epoch(), 5);
    }

    #[test]
    fn older_leader_epoch_does_not_replace_newer() {
        let view = ControlView::new();
        view.apply(&envelope(1, leader_and_isr(2, 7)));
        view.apply(&envelope(1, leader_and_isr(3, 6)));
        let leadership = view.leadership(&TopicPartition::new("orders", 0)).unwrap();
        assert_eq!(leadership.leader, 2);
        assert_eq!(leadership.isr_len, 2);
    }

    #[test]
    fn stop_replica_clears_leadership() {
        let view = ControlView::new();
        let tp = TopicPartition::new("orders", 0);
        view.apply(&envelope(1, leader_and_isr(2, 1)));
        view.apply(&envelope(
            1,
            ControlRequest::StopReplica {
                partition: tp.clone(),
                delete: false,
            },
        ));
        assert_eq!(view.leader_for(&tp), None);
        assert!(view.is_stopped(&tp));
        assert_eq!(view.applied_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn listener_acks_and_applies_framed_requests() {
        let census = ThreadCensus::new();
        let view = Arc::new(ControlView::new());
        let listener = ControlListener::bind("127.0.0.1:0", view.clone(), &census, "broker-3")
            .await
            .unwrap();
        let addr = listener.local_addr().to_string();

        let mut conn = TcpConnector.connect(&addr, Duration::from_secs(5)).await.unwrap();
        let request = envelope(
            2,
            ControlRequest::UpdateMetadata {
                alive_nodes: vec![1, 3],
            },
        );
        conn.send(&serde_json::to_vec(&request).unwrap(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(view.alive_nodes(), vec![1, 3]);
        assert_eq!(census.count_foreign_contexts("broker-3/control-conn/"), 1);

        listener.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(census.count_foreign_contexts("broker-3/"), 0);
        conn.close().await;
    }
}
