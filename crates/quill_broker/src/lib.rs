//! Quill broker node: recovery checkpoints, partition logs, the broker
//! lifecycle state machine and the controller's request channels.

pub mod broker;
pub mod census;
pub mod channel;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod frame;
pub mod listener;
pub mod log;
pub mod membership;
pub mod types;

use std::future::Future;
use std::sync::Arc;

pub use broker::{BrokerLifecycleController, ShutdownReport, StartupFailure, StartupOutcome};
pub use census::{ContextKind, ThreadCensus};
pub use channel::{
    ChannelConfig, ChannelError, Connection, Connector, ControlEnvelope, ControlRequest,
    RequestChannelManager, TcpConnector, TransportError,
};
pub use checkpoint::{PartitionOffsets, RecoveryCheckpointStore};
pub use config::{BrokerConfig, NodeArgs};
pub use error::{BrokerError, FailureKind};
pub use membership::{MembershipService, Registration, StaticMembership, TcpMembership};
pub use types::{BrokerState, NodeId, TopicPartition};

/// Start a broker from CLI arguments and run it until `shutdown` resolves.
pub async fn run_node_with_shutdown<F>(args: NodeArgs, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = Result<(), std::io::Error>> + Send,
{
    let membership: Arc<dyn MembershipService> = match &args.membership_addr {
        Some(addr) => Arc::new(TcpMembership::new(addr.clone())),
        None => Arc::new(StaticMembership::new()),
    };
    let config = args.into_config()?;
    let broker = BrokerLifecycleController::new(config, membership);

    if let StartupOutcome::Failed(failure) = broker.startup().await {
        tracing::error!(
            state_at_failure = %failure.state_at_failure,
            kind = ?failure.error.kind(),
            "broker failed to start"
        );
        return Err(failure.error.into());
    }

    if let Err(err) = shutdown.await {
        tracing::warn!(error = ?err, "shutdown signal failed; stopping anyway");
    }
    let report = broker.shutdown().await;
    anyhow::ensure!(
        report.errors.is_empty(),
        "shutdown completed with {} tolerated errors",
        report.errors.len()
    );
    Ok(())
}
