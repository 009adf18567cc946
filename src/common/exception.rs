use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::common::config::DiskId;

/// Errors surfaced by the disk I/O manager.
///
/// A reader's terminal status is cloned out to every later `get_next` caller,
/// so I/O sources are kept behind an `Arc`.
#[derive(Error, Debug, Clone)]
pub enum IoMgrError {
    #[error("Reader was cancelled")]
    Cancelled,
    #[error("Memory limit exceeded")]
    MemLimitExceeded,
    #[error("Invalid scan range. Bad disk id: {disk_id} (num disks: {num_disks})")]
    InvalidDiskId { disk_id: DiskId, num_disks: usize },
    #[error("Invalid scan range: {0}")]
    InvalidScanRange(String),
    #[error("Reader handle is stale or was never registered")]
    InvalidReader,
    #[error("Failed to open file {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        source: Arc<io::Error>,
    },
    #[error("Could not seek to {offset} in file {}: {source}", .path.display())]
    Seek {
        path: PathBuf,
        offset: u64,
        source: Arc<io::Error>,
    },
    #[error("Error reading from {} at byte offset {offset}: {source}", .path.display())]
    Read {
        path: PathBuf,
        offset: u64,
        source: Arc<io::Error>,
    },
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Failed to spawn disk thread: {0}")]
    ThreadSpawn(String),
}

impl IoMgrError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, IoMgrError::Cancelled)
    }

    pub fn is_io(&self) -> bool {
        matches!(
            self,
            IoMgrError::Open { .. } | IoMgrError::Seek { .. } | IoMgrError::Read { .. }
        )
    }
}

pub type IoMgrResult<T> = Result<T, IoMgrError>;
