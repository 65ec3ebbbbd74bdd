//! Identifiers and the observable broker state shared across modules.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Cluster member identifier.
pub type NodeId = u64;

/// A single partition of a topic.
///
/// Rendered as `topic-partition`, which is both the partition directory name
/// inside a storage directory and the key used in recovery checkpoints.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: u32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

impl FromStr for TopicPartition {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Topics may contain '-', so the partition is whatever follows the last one.
        let (topic, partition) = s
            .rsplit_once('-')
            .ok_or_else(|| anyhow::anyhow!("invalid topic partition (expected topic-N): {s}"))?;
        anyhow::ensure!(!topic.is_empty(), "invalid topic partition (empty topic): {s}");
        let partition = partition
            .parse::<u32>()
            .map_err(|err| anyhow::anyhow!("invalid partition number in {s}: {err}"))?;
        Ok(Self::new(topic, partition))
    }
}

/// Lifecycle state of a broker process as seen by supervisors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BrokerState {
    NotRunning,
    Starting,
    Running,
    ShuttingDown,
}

impl BrokerState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotRunning => "NOT_RUNNING",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}

impl fmt::Display for BrokerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
