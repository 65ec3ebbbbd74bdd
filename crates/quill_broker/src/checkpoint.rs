//! Durable recovery checkpoints, one file per storage directory.
//!
//! A checkpoint maps each partition hosted by the directory to its recovery
//! point: the offset below which every record is known to be flushed. Restart
//! recovery only has to validate what lies beyond it.
//!
//! The file is a JSON envelope carrying a CRC32 of the serialized payload. It is
//! replaced atomically (temp file, fsync, rename, directory fsync), so a reader
//! sees either the previous checkpoint or the new one, never a torn mix.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::types::TopicPartition;

/// File name of the checkpoint inside a storage directory.
pub const CHECKPOINT_FILE: &str = "recovery-point-offset-checkpoint";
const CHECKPOINT_TMP_FILE: &str = "recovery-point-offset-checkpoint.tmp";
const CHECKPOINT_VERSION: u32 = 1;

/// Recovery point per partition.
pub type PartitionOffsets = BTreeMap<TopicPartition, u64>;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct CheckpointPayload {
    offsets: BTreeMap<String, u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointEnvelope {
    version: u32,
    checksum_crc32: u32,
    payload: CheckpointPayload,
}

/// Reads and writes recovery checkpoints.
#[derive(Clone, Copy, Debug, Default)]
pub struct RecoveryCheckpointStore;

impl RecoveryCheckpointStore {
    pub fn new() -> Self {
        Self
    }

    pub fn checkpoint_path(dir: &Path) -> PathBuf {
        dir.join(CHECKPOINT_FILE)
    }

    /// Durably replace the checkpoint for `dir`.
    ///
    /// Returns only after the new file and its directory entry are synced.
    pub fn write_checkpoint(&self, dir: &Path, offsets: &PartitionOffsets) -> Result<(), BrokerError> {
        let path = Self::checkpoint_path(dir);
        let bytes = encode_checkpoint(offsets)?;
        write_atomically(dir, &path, &bytes).map_err(|err| BrokerError::storage_failure(&path, err))
    }

    /// Return the last durably written checkpoint for `dir`, or an empty map if
    /// none was ever written.
    pub fn read_checkpoint(&self, dir: &Path) -> Result<PartitionOffsets, BrokerError> {
        let path = Self::checkpoint_path(dir);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(PartitionOffsets::new()),
            Err(err) => return Err(BrokerError::storage_failure(&path, err)),
        };
        decode_checkpoint(&bytes).map_err(|err| BrokerError::corruption(&path, format!("{err:#}")))
    }
}

fn payload_checksum(payload: &CheckpointPayload) -> anyhow::Result<u32> {
    let bytes = serde_json::to_vec(payload).context("serialize checkpoint payload")?;
    Ok(crc32fast::hash(&bytes))
}

fn encode_checkpoint(offsets: &PartitionOffsets) -> anyhow::Result<Vec<u8>> {
    let payload = CheckpointPayload {
        offsets: offsets
            .iter()
            .map(|(tp, offset)| (tp.to_string(), *offset))
            .collect(),
    };
    let envelope = CheckpointEnvelope {
        version: CHECKPOINT_VERSION,
        checksum_crc32: payload_checksum(&payload)?,
        payload,
    };
    serde_json::to_vec_pretty(&envelope).context("serialize checkpoint envelope")
}

fn decode_checkpoint(bytes: &[u8]) -> anyhow::Result<PartitionOffsets> {
    let envelope: CheckpointEnvelope =
        serde_json::from_slice(bytes).context("parse checkpoint envelope")?;
    anyhow::ensure!(
        envelope.version == CHECKPOINT_VERSION,
        "unsupported checkpoint version {}",
        envelope.version
    );
    let actual = payload_checksum(&envelope.payload)?;
    anyhow::ensure!(
        actual == envelope.checksum_crc32,
        "checkpoint checksum mismatch (expected={}, actual={})",
        envelope.checksum_crc32,
        actual
    );

    let mut offsets = PartitionOffsets::new();
    for (key, offset) in envelope.payload.offsets {
        let tp: TopicPartition = key.parse()?;
        offsets.insert(tp, offset);
    }
    Ok(offsets)
}

fn write_atomically(dir: &Path, path: &Path, bytes: &[u8]) -> io::Result<()> {
    // The directory is owned by the broker; never create it behind its back.
    if !fs::metadata(dir)?.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} is not a directory", dir.display()),
        ));
    }
    let tmp_path = dir.join(CHECKPOINT_TMP_FILE);
    {
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(bytes)?;
        tmp.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    sync_dir(dir)
}

#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
