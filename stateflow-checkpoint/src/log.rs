//! Checkpoint log implementations.
//!
//! [`MemoryLog`] keeps the materialized index only; [`FileLog`] appends
//! framed records to a single file and rebuilds the index by replaying
//! them on open. Both resolve reads last-write-wins.

use crate::error::CheckpointError;
use crate::keypath::KeyPath;
use crate::record::{CheckpointOp, CheckpointRecord};
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Fsync policy for file-backed writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsyncPolicy {
    /// Fsync after every write (safest, slowest).
    #[default]
    EveryWrite,
    /// Fsync after N writes.
    EveryN(u32),
    /// Never fsync automatically (caller must call sync).
    Never,
}

/// File log configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Path of the checkpoint file.
    pub path: PathBuf,
    /// Fsync policy.
    pub fsync_policy: FsyncPolicy,
}

impl LogConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fsync_policy: FsyncPolicy::default(),
        }
    }

    pub fn with_fsync_policy(mut self, policy: FsyncPolicy) -> Self {
        self.fsync_policy = policy;
        self
    }
}

/// An append-only (key path, value bytes) log with last-write-wins reads.
pub trait CheckpointLog: Send + Sync {
    /// Appends a value at an exact key path.
    fn store(&self, path: &KeyPath, value: &[u8]) -> Result<(), CheckpointError>;

    /// Last-write-wins lookup by exact key path.
    fn get(&self, path: &KeyPath) -> Result<Option<Bytes>, CheckpointError>;

    /// Logically deletes every record whose key path lies beneath `prefix`.
    fn remove_subtree(&self, prefix: &KeyPath) -> Result<(), CheckpointError>;

    /// Snapshot of every live (key path, value) pair, in first-write order.
    fn entries(&self) -> Result<Vec<(KeyPath, Bytes)>, CheckpointError>;

    /// Forces buffered writes to durable storage.
    fn sync(&self) -> Result<(), CheckpointError>;
}

/// Materialized last-write-wins view, shared by both log kinds.
#[derive(Default)]
struct Index {
    entries: Vec<(KeyPath, Bytes)>,
}

impl Index {
    fn put(&mut self, path: KeyPath, value: Bytes) {
        match self.entries.iter_mut().find(|(k, _)| *k == path) {
            Some((_, v)) => *v = value,
            None => self.entries.push((path, value)),
        }
    }

    fn get(&self, path: &KeyPath) -> Option<Bytes> {
        self.entries
            .iter()
            .find(|(k, _)| k == path)
            .map(|(_, v)| v.clone())
    }

    fn remove_subtree(&mut self, prefix: &KeyPath) {
        self.entries.retain(|(k, _)| !k.starts_with(prefix));
    }
}

/// In-memory checkpoint log for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryLog {
    index: RwLock<Index>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointLog for MemoryLog {
    fn store(&self, path: &KeyPath, value: &[u8]) -> Result<(), CheckpointError> {
        self.index
            .write()
            .put(path.clone(), Bytes::copy_from_slice(value));
        Ok(())
    }

    fn get(&self, path: &KeyPath) -> Result<Option<Bytes>, CheckpointError> {
        Ok(self.index.read().get(path))
    }

    fn remove_subtree(&self, prefix: &KeyPath) -> Result<(), CheckpointError> {
        self.index.write().remove_subtree(prefix);
        Ok(())
    }

    fn entries(&self) -> Result<Vec<(KeyPath, Bytes)>, CheckpointError> {
        Ok(self.index.read().entries.clone())
    }

    fn sync(&self) -> Result<(), CheckpointError> {
        Ok(())
    }
}

/// File-backed checkpoint log.
///
/// Records are appended to a single file; opening replays them in order,
/// applying puts and subtree removals to rebuild the live index. An
/// incomplete trailing record (a torn final write) is dropped silently.
pub struct FileLog {
    config: LogConfig,
    file: Mutex<File>,
    index: RwLock<Index>,
    writes_since_sync: AtomicU64,
    closed: AtomicBool,
}

impl FileLog {
    /// Opens or creates a checkpoint log at the configured path.
    pub fn open(config: LogConfig) -> Result<Self, CheckpointError> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&config.path)?;

        let index = Self::replay(&mut file)?;
        tracing::debug!(
            path = %config.path.display(),
            live_entries = index.entries.len(),
            "checkpoint log opened"
        );

        Ok(Self {
            config,
            file: Mutex::new(file),
            index: RwLock::new(index),
            writes_since_sync: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    fn replay(file: &mut File) -> Result<Index, CheckpointError> {
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;
        let mut buf = BytesMut::from(&raw[..]);

        let mut index = Index::default();
        let mut offset = 0u64;
        while let Some(record) = CheckpointRecord::decode(&mut buf, offset)? {
            offset += record.disk_size() as u64;
            let (path, subtree) = KeyPath::decode(&record.key)?;
            match record.op {
                CheckpointOp::Put => index.put(path, record.value),
                CheckpointOp::RemoveSubtree => {
                    debug_assert!(subtree);
                    index.remove_subtree(&path);
                }
            }
        }
        Ok(index)
    }

    fn append(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CheckpointError::Closed);
        }
        let encoded = record.encode()?;
        {
            let mut file = self.file.lock();
            file.write_all(&encoded)?;
        }
        self.maybe_sync()
    }

    fn maybe_sync(&self) -> Result<(), CheckpointError> {
        match self.config.fsync_policy {
            FsyncPolicy::EveryWrite => self.sync(),
            FsyncPolicy::EveryN(n) => {
                let writes = self.writes_since_sync.fetch_add(1, Ordering::AcqRel) + 1;
                if writes >= n as u64 {
                    self.writes_since_sync.store(0, Ordering::Release);
                    self.sync()
                } else {
                    Ok(())
                }
            }
            FsyncPolicy::Never => Ok(()),
        }
    }

    /// Closes the log, syncing outstanding writes. Further writes fail.
    pub fn close(&self) -> Result<(), CheckpointError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.file.lock().sync_data()?;
        Ok(())
    }
}

impl CheckpointLog for FileLog {
    fn store(&self, path: &KeyPath, value: &[u8]) -> Result<(), CheckpointError> {
        let record = CheckpointRecord::put(path.encode(), Bytes::copy_from_slice(value));
        self.append(&record)?;
        self.index
            .write()
            .put(path.clone(), Bytes::copy_from_slice(value));
        Ok(())
    }

    fn get(&self, path: &KeyPath) -> Result<Option<Bytes>, CheckpointError> {
        Ok(self.index.read().get(path))
    }

    fn remove_subtree(&self, prefix: &KeyPath) -> Result<(), CheckpointError> {
        let record = CheckpointRecord::remove_subtree(prefix.encode_subtree());
        self.append(&record)?;
        self.index.write().remove_subtree(prefix);
        Ok(())
    }

    fn entries(&self) -> Result<Vec<(KeyPath, Bytes)>, CheckpointError> {
        Ok(self.index.read().entries.clone())
    }

    fn sync(&self) -> Result<(), CheckpointError> {
        self.file.lock().sync_data()?;
        Ok(())
    }
}
