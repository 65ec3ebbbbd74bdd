//! Partition record logs and the per-directory log manager.
//!
//! Each partition lives in `<storage>/<topic>-<partition>/records.log` as a
//! sequence of CRC-checked frames; a record's offset is its index. Appends are
//! buffered in memory and only reach disk on `flush`, which also advances the
//! partition's recovery point.
//!
//! At startup every partition is validated against the directory's recovery
//! checkpoint. A directory that still carries the clean-shutdown marker must
//! be intact end to end. Otherwise a torn tail past the recovery point is
//! truncated, while damage at or below it is reported as corruption.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use fs2::FileExt;

use crate::checkpoint::{sync_dir, PartitionOffsets, RecoveryCheckpointStore};
use crate::error::BrokerError;
use crate::frame::{self, FRAME_HEADER_LEN, MAX_FRAME_LEN};
use crate::types::TopicPartition;

/// Record file inside a partition directory.
pub const LOG_FILE: &str = "records.log";
/// Present in a storage directory only between a clean shutdown and the next startup.
pub const CLEAN_SHUTDOWN_MARKER: &str = ".clean_shutdown";
/// Advisory lock held for as long as a broker owns the directory.
pub const LOCK_FILE: &str = ".lock";

/// Outcome of scanning a record file.
struct ScanResult {
    records: Vec<Bytes>,
    valid_bytes: u64,
    damage: Option<String>,
}

fn scan_log_file(path: &Path) -> io::Result<ScanResult> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Ok(ScanResult {
                records: Vec::new(),
                valid_bytes: 0,
                damage: None,
            })
        }
        Err(err) => return Err(err),
    };
    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    let mut valid_bytes = 0u64;
    let damage = loop {
        let mut header = [0u8; FRAME_HEADER_LEN];
        match read_full(&mut reader, &mut header)? {
            0 => break None,
            n if n < FRAME_HEADER_LEN => {
                break Some(format!("partial frame header at byte {valid_bytes}"))
            }
            _ => {}
        }
        let (len, expected) = frame::parse_header(&header);
        if len > MAX_FRAME_LEN {
            break Some(format!("frame length {len} at byte {valid_bytes} exceeds limit"));
        }
        let mut payload = vec![0u8; len];
        if read_full(&mut reader, &mut payload)? < len {
            break Some(format!("partial frame payload at byte {valid_bytes}"));
        }
        if frame::checksum(&payload) != expected {
            break Some(format!(
                "checksum mismatch for offset {} at byte {valid_bytes}",
                records.len()
            ));
        }
        valid_bytes += (FRAME_HEADER_LEN + len) as u64;
        records.push(Bytes::from(payload));
    };
    Ok(ScanResult {
        records,
        valid_bytes,
        damage,
    })
}

/// Read until `buf` is full or EOF; returns the number of bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

/// One partition's records and its durable prefix.
pub struct PartitionLog {
    tp: TopicPartition,
    path: PathBuf,
    file: File,
    records: Vec<Bytes>,
    /// Number of records known to be on disk; doubles as the recovery point.
    flushed: u64,
}

impl PartitionLog {
    /// Create an empty log in `partition_dir`.
    fn create(tp: TopicPartition, partition_dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(partition_dir)?;
        let path = partition_dir.join(LOG_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.sync_all()?;
        if let Some(parent) = partition_dir.parent() {
            sync_dir(parent)?;
        }
        Ok(Self {
            tp,
            path,
            file,
            records: Vec::new(),
            flushed: 0,
        })
    }

    /// Open and validate an existing partition log.
    fn recover(
        tp: TopicPartition,
        partition_dir: &Path,
        recovery_point: u64,
        clean_shutdown: bool,
    ) -> Result<Self, BrokerError> {
        let path = partition_dir.join(LOG_FILE);
        let scan = scan_log_file(&path).map_err(|err| BrokerError::storage_failure(&path, err))?;
        let recovered = scan.records.len() as u64;

        if let Some(damage) = scan.damage {
            if clean_shutdown {
                return Err(BrokerError::corruption(
                    &path,
                    format!("{damage} in a cleanly shut down log"),
                ));
            }
            if recovered < recovery_point {
                return Err(BrokerError::corruption(
                    &path,
                    format!("{damage} below recovery point {recovery_point}"),
                ));
            }
            tracing::warn!(
                partition = %tp,
                damage = %damage,
                kept_records = recovered,
                "truncating torn log tail after unclean shutdown"
            );
            truncate_to(&path, scan.valid_bytes)
                .map_err(|err| BrokerError::storage_failure(&path, err))?;
        }
        if recovered < recovery_point {
            return Err(BrokerError::corruption(
                &path,
                format!("log ends at offset {recovered} before recovery point {recovery_point}"),
            ));
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| BrokerError::storage_failure(&path, err))?;
        Ok(Self {
            tp,
            path,
            file,
            records: scan.records,
            flushed: recovered,
        })
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.tp
    }

    pub fn log_end_offset(&self) -> u64 {
        self.records.len() as u64
    }

    pub fn recovery_point(&self) -> u64 {
        self.flushed
    }

    /// Buffer records; returns the offset assigned to the first one.
    pub fn append(&mut self, records: Vec<Bytes>) -> u64 {
        let base = self.log_end_offset();
        self.records.extend(records);
        base
    }

    /// Records from `from` to the log end, flushed or not.
    pub fn read(&self, from: u64) -> Vec<Bytes> {
        let start = usize::try_from(from).unwrap_or(usize::MAX).min(self.records.len());
        self.records[start..].to_vec()
    }

    /// Write the unflushed tail and sync it.
    pub fn flush(&mut self) -> io::Result<()> {
        self.flush_with(|file, tail| write_tail(BufWriter::new(file), tail))
    }

    /// Flush through `write`. A failed write is cut back off the file, so the
    /// next flush rewrites the whole tail instead of appending a second copy.
    fn flush_with<F>(&mut self, write: F) -> io::Result<()>
    where
        F: FnOnce(&mut File, &[Bytes]) -> io::Result<()>,
    {
        let start = self.flushed as usize;
        if start >= self.records.len() {
            return Ok(());
        }
        let committed = self.file.metadata()?.len();
        let written = write(&mut self.file, &self.records[start..]).and_then(|()| self.file.sync_data());
        if let Err(err) = written {
            if let Err(rollback) = self.file.set_len(committed).and_then(|()| self.file.sync_data()) {
                tracing::error!(
                    path = %self.path.display(),
                    error = %rollback,
                    committed,
                    "could not cut partial flush back"
                );
            }
            return Err(err);
        }
        self.flushed = self.records.len() as u64;
        Ok(())
    }
}

fn write_tail<W: Write>(mut out: W, records: &[Bytes]) -> io::Result<()> {
    for record in records {
        frame::write_frame(&mut out, record)?;
    }
    out.flush()
}

fn truncate_to(path: &Path, len: u64) -> io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_all()
}

/// One acquired storage directory and the partitions it hosts.
struct StorageDir {
    path: PathBuf,
    lock: File,
    logs: BTreeMap<TopicPartition, PartitionLog>,
}

impl StorageDir {
    fn recovery_points(&self) -> PartitionOffsets {
        self.logs
            .iter()
            .map(|(tp, log)| (tp.clone(), log.recovery_point()))
            .collect()
    }
}

/// Owns every storage directory of one broker.
pub struct LogManager {
    dirs: Vec<StorageDir>,
    checkpoints: RecoveryCheckpointStore,
}

impl LogManager {
    /// Lock every directory, read its checkpoint and recover its partitions.
    ///
    /// Directories acquired before a failure are released when the partially
    /// built manager is dropped.
    pub fn open(paths: &[PathBuf], checkpoints: RecoveryCheckpointStore) -> Result<Self, BrokerError> {
        let mut dirs = Vec::with_capacity(paths.len());
        for path in paths {
            dirs.push(open_storage_dir(path, &checkpoints)?);
        }
        // Markers only go once every directory loaded, so a failed startup
        // leaves them for the next attempt.
        for dir in &dirs {
            let marker = dir.path.join(CLEAN_SHUTDOWN_MARKER);
            match fs::remove_file(&marker) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(BrokerError::storage_failure(&marker, err)),
            }
        }
        Ok(Self { dirs, checkpoints })
    }

    pub fn dir_paths(&self) -> Vec<PathBuf> {
        self.dirs.iter().map(|dir| dir.path.clone()).collect()
    }

    pub fn partitions(&self) -> Vec<TopicPartition> {
        self.dirs
            .iter()
            .flat_map(|dir| dir.logs.keys().cloned())
            .collect()
    }

    /// Storage directory hosting `tp`, if any.
    pub fn dir_of(&self, tp: &TopicPartition) -> Option<&Path> {
        self.dirs
            .iter()
            .find(|dir| dir.logs.contains_key(tp))
            .map(|dir| dir.path.as_path())
    }

    /// Create `tp` in the directory hosting the fewest partitions. Existing
    /// partitions are left as they are.
    pub fn create_partition(&mut self, tp: &TopicPartition) -> Result<(), BrokerError> {
        if self.dir_of(tp).is_some() {
            return Ok(());
        }
        let dir = self
            .dirs
            .iter_mut()
            .min_by_key(|dir| dir.logs.len())
            .ok_or_else(|| anyhow::anyhow!("no storage directories configured"))?;
        let partition_dir = dir.path.join(tp.to_string());
        let log = PartitionLog::create(tp.clone(), &partition_dir)
            .map_err(|err| BrokerError::storage_failure(&partition_dir, err))?;
        tracing::info!(partition = %tp, dir = %dir.path.display(), "created partition log");
        dir.logs.insert(tp.clone(), log);
        Ok(())
    }

    fn log_mut(&mut self, tp: &TopicPartition) -> Result<&mut PartitionLog, BrokerError> {
        self.dirs
            .iter_mut()
            .find_map(|dir| dir.logs.get_mut(tp))
            .ok_or_else(|| BrokerError::UnknownPartition(tp.clone()))
    }

    pub fn append(&mut self, tp: &TopicPartition, records: Vec<Bytes>) -> Result<u64, BrokerError> {
        Ok(self.log_mut(tp)?.append(records))
    }

    pub fn read(&self, tp: &TopicPartition, from: u64) -> Result<Vec<Bytes>, BrokerError> {
        self.dirs
            .iter()
            .find_map(|dir| dir.logs.get(tp))
            .map(|log| log.read(from))
            .ok_or_else(|| BrokerError::UnknownPartition(tp.clone()))
    }

    /// Flush every log and rewrite every directory's checkpoint.
    ///
    /// Best effort: a failing log or directory is reported and the rest still
    /// proceed. With `mark_clean`, directories whose checkpoint was written get
    /// the clean-shutdown marker.
    pub fn checkpoint_all(&mut self, mark_clean: bool) -> Vec<BrokerError> {
        let mut errors = Vec::new();
        for dir in &mut self.dirs {
            let mut dir_ok = true;
            for log in dir.logs.values_mut() {
                if let Err(err) = log.flush() {
                    dir_ok = false;
                    errors.push(BrokerError::storage_failure(&log.path, err));
                }
            }
            // Recovery points of logs that failed to flush did not advance, so
            // the checkpoint stays truthful either way.
            if let Err(err) = self
                .checkpoints
                .write_checkpoint(&dir.path, &dir.recovery_points())
            {
                errors.push(err);
                continue;
            }
            if mark_clean && dir_ok {
                let marker = dir.path.join(CLEAN_SHUTDOWN_MARKER);
                if let Err(err) = File::create(&marker).and_then(|f| f.sync_all()) {
                    errors.push(BrokerError::storage_failure(&marker, err));
                }
            }
        }
        errors
    }

    /// Release every directory lock and file handle.
    pub fn close(&mut self) {
        for dir in self.dirs.drain(..) {
            if let Err(err) = dir.lock.unlock() {
                tracing::warn!(error = ?err, dir = %dir.path.display(), "storage dir unlock failed");
            }
        }
    }
}

fn open_storage_dir(path: &Path, checkpoints: &RecoveryCheckpointStore) -> Result<StorageDir, BrokerError> {
    fs::create_dir_all(path).map_err(|err| BrokerError::storage_failure(path, err))?;
    let lock_path = path.join(LOCK_FILE);
    let lock = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .map_err(|err| BrokerError::storage_failure(&lock_path, err))?;
    lock.try_lock_exclusive()
        .map_err(|err| BrokerError::storage_failure(&lock_path, err))?;

    let clean_shutdown = path.join(CLEAN_SHUTDOWN_MARKER).exists();
    let recovery_points = checkpoints.read_checkpoint(path)?;

    let mut logs = BTreeMap::new();
    let entries = fs::read_dir(path).map_err(|err| BrokerError::storage_failure(path, err))?;
    for entry in entries {
        let entry = entry.map_err(|err| BrokerError::storage_failure(path, err))?;
        let is_dir = entry
            .file_type()
            .map_err(|err| BrokerError::storage_failure(entry.path(), err))?
            .is_dir();
        if !is_dir {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        let Ok(tp) = name.parse::<TopicPartition>() else {
            tracing::debug!(entry = %name, dir = %path.display(), "skipping non-partition directory");
            continue;
        };
        let recovery_point = recovery_points.get(&tp).copied().unwrap_or(0);
        let log = PartitionLog::recover(tp.clone(), &entry.path(), recovery_point, clean_shutdown)?;
        logs.insert(tp, log);
    }

    // A checkpointed partition whose directory vanished lost durable data.
    if let Some((tp, offset)) = recovery_points
        .iter()
        .find(|(tp, offset)| **offset > 0 && !logs.contains_key(*tp))
    {
        return Err(BrokerError::corruption(
            path.join(tp.to_string()),
            format!("partition missing but checkpointed at offset {offset}"),
        ));
    }

    tracing::info!(
        dir = %path.display(),
        partitions = logs.len(),
        clean_shutdown,
        "loaded storage directory"
    );
    Ok(StorageDir { path: path.to_path_buf(), lock, logs })
}
