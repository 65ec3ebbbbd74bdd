//! Broker configuration and its command-line form.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use crate::channel::ChannelConfig;
use crate::types::NodeId;

/// Everything a `BrokerLifecycleController` needs; built directly by
/// embedding code and tests, or from `NodeArgs` by the binary.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub node_id: NodeId,
    /// Control-plane listen address; port 0 picks a free one.
    pub listen_control: String,
    pub storage_dirs: Vec<PathBuf>,
    pub has_controller_role: bool,
    pub controller_epoch: u64,
    /// Control addresses of the other brokers, used when acting as controller.
    pub peers: BTreeMap<NodeId, String>,
    pub registration_timeout: Duration,
    pub request_timeout: Duration,
    pub retry_backoff: Duration,
    pub max_send_attempts: Option<u32>,
    /// Budget for stopping request senders and the control listener.
    pub channel_shutdown_timeout: Duration,
    /// `None` disables background checkpointing.
    pub checkpoint_interval: Option<Duration>,
}

impl BrokerConfig {
    /// Defaults for a lone broker on a loopback ephemeral port.
    pub fn single_node(node_id: NodeId, storage_dirs: Vec<PathBuf>) -> Self {
        Self {
            node_id,
            listen_control: "127.0.0.1:0".to_string(),
            storage_dirs,
            has_controller_role: false,
            controller_epoch: 1,
            peers: BTreeMap::new(),
            registration_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_millis(100),
            max_send_attempts: None,
            channel_shutdown_timeout: Duration::from_secs(5),
            checkpoint_interval: Some(Duration::from_secs(30)),
        }
    }

    /// Prefix under which this broker registers its contexts.
    pub fn census_prefix(&self) -> String {
        format!("broker-{}", self.node_id)
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            census_prefix: self.census_prefix(),
            controller_id: self.node_id,
            controller_epoch: self.controller_epoch,
            request_timeout: self.request_timeout,
            retry_backoff: self.retry_backoff,
            max_send_attempts: self.max_send_attempts,
            shutdown_timeout: self.channel_shutdown_timeout,
        }
    }
}

/// CLI options for running a broker node.
#[derive(Parser, Debug, Clone)]
pub struct NodeArgs {
    #[arg(long, env = "QUILL_NODE_ID")]
    pub node_id: NodeId,

    #[arg(long, env = "QUILL_LISTEN_CONTROL", default_value = "127.0.0.1:9093")]
    pub listen_control: String,

    /// Comma-separated storage directories.
    #[arg(long, env = "QUILL_STORAGE_DIRS")]
    pub storage_dirs: String,

    /// Run the controller role: dispatch control requests to `--peers`.
    #[arg(long, env = "QUILL_CONTROLLER", default_value_t = false)]
    pub controller: bool,

    #[arg(long, env = "QUILL_CONTROLLER_EPOCH", default_value_t = 1)]
    pub controller_epoch: u64,

    /// Comma-separated list like: `2@127.0.0.1:9094,3@127.0.0.1:9095`
    #[arg(long, env = "QUILL_PEERS", default_value = "")]
    pub peers: String,

    /// Membership service address; without it the broker registers in-process.
    #[arg(long, env = "QUILL_MEMBERSHIP_ADDR")]
    pub membership_addr: Option<String>,

    #[arg(long, env = "QUILL_REGISTRATION_TIMEOUT_MS", default_value_t = 5_000)]
    pub registration_timeout_ms: u64,

    /// Per-attempt bound on control request connect and delivery.
    #[arg(long, env = "QUILL_REQUEST_TIMEOUT_MS", default_value_t = 30_000)]
    pub request_timeout_ms: u64,

    #[arg(long, env = "QUILL_RETRY_BACKOFF_MS", default_value_t = 100)]
    pub retry_backoff_ms: u64,

    /// `0` retries until shutdown.
    #[arg(long, env = "QUILL_MAX_SEND_ATTEMPTS", default_value_t = 0)]
    pub max_send_attempts: u32,

    #[arg(long, env = "QUILL_CHANNEL_SHUTDOWN_TIMEOUT_MS", default_value_t = 5_000)]
    pub channel_shutdown_timeout_ms: u64,

    /// Background checkpoint interval; `0` disables it.
    #[arg(long, env = "QUILL_CHECKPOINT_INTERVAL_MS", default_value_t = 30_000)]
    pub checkpoint_interval_ms: u64,
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms.max(1))
}

impl NodeArgs {
    pub fn into_config(self) -> anyhow::Result<BrokerConfig> {
        let storage_dirs: Vec<PathBuf> = self
            .storage_dirs
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect();
        anyhow::ensure!(!storage_dirs.is_empty(), "storage_dirs is empty");
        let peers = parse_peers(&self.peers)?;
        anyhow::ensure!(
            !peers.contains_key(&self.node_id),
            "peer list contains this node ({})",
            self.node_id
        );
        Ok(BrokerConfig {
            node_id: self.node_id,
            listen_control: self.listen_control,
            storage_dirs,
            has_controller_role: self.controller,
            controller_epoch: self.controller_epoch,
            peers,
            registration_timeout: millis(self.registration_timeout_ms),
            request_timeout: millis(self.request_timeout_ms),
            retry_backoff: millis(self.retry_backoff_ms),
            max_send_attempts: (self.max_send_attempts > 0).then_some(self.max_send_attempts),
            channel_shutdown_timeout: millis(self.channel_shutdown_timeout_ms),
            checkpoint_interval: (self.checkpoint_interval_ms > 0)
                .then(|| Duration::from_millis(self.checkpoint_interval_ms)),
        })
    }
}

/// Parse `id@host:port,...`; an empty string yields no peers.
pub fn parse_peers(input: &str) -> anyhow::Result<BTreeMap<NodeId, String>> {
    let mut out = BTreeMap::new();
    for part in input.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (id, addr) = part
            .split_once('@')
            .with_context(|| format!("invalid peer entry (expected id@host:port): {part}"))?;
        let id: NodeId = id.parse().context("invalid peer id")?;
        anyhow::ensure!(addr.contains(':'), "invalid peer addr (missing port): {addr}");
        anyhow::ensure!(out.insert(id, addr.to_string()).is_none(), "duplicate peer id {id}");
    }
    Ok(out)
}
