//! Durable driver-binding records.
//!
//! A record is the only state that outlives a single invocation: written
//! when a VF is rebound to a userspace driver at setup, read back and
//! deleted by the release that undoes it, possibly in a different process
//! after a node reboot. Without the record the VF's previous kernel driver
//! cannot be reconstructed.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("no binding record for container {container_id} interface {ifname}")]
    NotFound { container_id: String, ifname: String },

    #[error("failed to access binding record at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("binding record at {path} is not valid JSON: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, RecordError>;

/// Everything needed to reverse a userspace-driver binding later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindRecord {
    pub pci_addr: String,
    /// Kernel driver captured right before the unbind.
    pub kernel_driver: String,
    pub userspace_driver: String,
    pub container_id: String,
    pub ifname: String,
    pub vf: u32,
}

/// Persistence for [`BindRecord`], keyed by container id and interface.
///
/// Single-writer/single-reader handoff: setup saves once, release loads and
/// deletes once. Backed by a directory in production and by memory in tests.
pub trait RecordStore {
    fn save(&self, record: &BindRecord) -> Result<()>;
    fn load(&self, container_id: &str, ifname: &str) -> Result<BindRecord>;
    fn delete(&self, container_id: &str, ifname: &str) -> Result<()>;
}

/// One JSON file per record under a base directory.
#[derive(Debug, Clone)]
pub struct FileRecordStore {
    base_dir: PathBuf,
}

impl FileRecordStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn record_path(&self, container_id: &str, ifname: &str) -> PathBuf {
        self.base_dir.join(format!("{container_id}-{ifname}.json"))
    }

    fn io_err(path: &Path, source: io::Error) -> RecordError {
        RecordError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl RecordStore for FileRecordStore {
    fn save(&self, record: &BindRecord) -> Result<()> {
        fs::create_dir_all(&self.base_dir).map_err(|e| Self::io_err(&self.base_dir, e))?;
        let path = self.record_path(&record.container_id, &record.ifname);
        let data = serde_json::to_vec_pretty(record).map_err(|source| RecordError::Malformed {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, data).map_err(|e| Self::io_err(&path, e))
    }

    fn load(&self, container_id: &str, ifname: &str) -> Result<BindRecord> {
        let path = self.record_path(container_id, ifname);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(RecordError::NotFound {
                    container_id: container_id.to_string(),
                    ifname: ifname.to_string(),
                });
            }
            Err(e) => return Err(Self::io_err(&path, e)),
        };
        serde_json::from_slice(&data).map_err(|source| RecordError::Malformed { path, source })
    }

    fn delete(&self, container_id: &str, ifname: &str) -> Result<()> {
        let path = self.record_path(container_id, ifname);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_err(&path, e)),
        }
    }
}

/// In-memory store for tests.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<(String, String), BindRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordStore for MemoryRecordStore {
    fn save(&self, record: &BindRecord) -> Result<()> {
        self.records.lock().unwrap().insert(
            (record.container_id.clone(), record.ifname.clone()),
            record.clone(),
        );
        Ok(())
    }

    fn load(&self, container_id: &str, ifname: &str) -> Result<BindRecord> {
        self.records
            .lock()
            .unwrap()
            .get(&(container_id.to_string(), ifname.to_string()))
            .cloned()
            .ok_or_else(|| RecordError::NotFound {
                container_id: container_id.to_string(),
                ifname: ifname.to_string(),
            })
    }

    fn delete(&self, container_id: &str, ifname: &str) -> Result<()> {
        self.records
            .lock()
            .unwrap()
            .remove(&(container_id.to_string(), ifname.to_string()));
        Ok(())
    }
}
