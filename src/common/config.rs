use std::fs;

use crate::common::exception::{IoMgrError, IoMgrResult};

pub const DEFAULT_READ_SIZE: usize = 8 * 1024 * 1024; // size of one I/O buffer in bytes
pub const DEFAULT_THREADS_PER_DISK: usize = 1; // worker threads per disk queue
pub const MIN_QUEUE_CAPACITY: usize = 4; // lower bound on a reader's buffer quota
pub const MAX_QUEUE_CAPACITY: usize = 256; // upper bound on a reader's buffer quota

pub type DiskId = usize; // index of a disk queue
pub type RangeId = usize; // index into a reader's range table
pub type GroupId = usize; // index into a reader's group table

/// Block device name prefixes that never back a data directory.
const VIRTUAL_BLOCK_DEVICES: [&str; 4] = ["loop", "ram", "zram", "dm-"];

/// Runtime configuration for the disk I/O manager.
#[derive(Debug, Clone)]
pub struct IoMgrConfig {
    /// Number of disk queues. Zero means "detect from the host".
    pub num_disks: usize,
    pub threads_per_disk: usize,
    /// Bytes read per request; also the size of every pooled buffer.
    pub read_size: usize,
    pub min_queue_capacity: usize,
    pub max_queue_capacity: usize,
}

impl Default for IoMgrConfig {
    fn default() -> Self {
        Self {
            num_disks: 0,
            threads_per_disk: DEFAULT_THREADS_PER_DISK,
            read_size: DEFAULT_READ_SIZE,
            min_queue_capacity: MIN_QUEUE_CAPACITY,
            max_queue_capacity: MAX_QUEUE_CAPACITY,
        }
    }
}

impl IoMgrConfig {
    /// Builds a configuration from the defaults, overridden by any `DISKIO_*`
    /// environment variables that are set and parse as integers.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            num_disks: env_usize("DISKIO_NUM_DISKS", defaults.num_disks),
            threads_per_disk: env_usize("DISKIO_THREADS_PER_DISK", defaults.threads_per_disk),
            read_size: env_usize("DISKIO_READ_SIZE", defaults.read_size),
            min_queue_capacity: env_usize("DISKIO_MIN_QUEUE_CAPACITY", defaults.min_queue_capacity),
            max_queue_capacity: env_usize("DISKIO_MAX_QUEUE_CAPACITY", defaults.max_queue_capacity),
        }
    }

    pub fn with_num_disks(mut self, num_disks: usize) -> Self {
        self.num_disks = num_disks;
        self
    }

    pub fn with_threads_per_disk(mut self, threads_per_disk: usize) -> Self {
        self.threads_per_disk = threads_per_disk;
        self
    }

    pub fn with_read_size(mut self, read_size: usize) -> Self {
        self.read_size = read_size;
        self
    }

    /// Number of disk queues the manager will create.
    pub fn effective_num_disks(&self) -> usize {
        if self.num_disks == 0 {
            detect_num_disks()
        } else {
            self.num_disks
        }
    }

    pub fn validate(&self) -> IoMgrResult<()> {
        if self.threads_per_disk == 0 {
            return Err(IoMgrError::Config(
                "threads_per_disk must be at least 1".to_string(),
            ));
        }
        if self.read_size == 0 {
            return Err(IoMgrError::Config("read_size must be non-zero".to_string()));
        }
        if self.min_queue_capacity == 0 || self.min_queue_capacity > self.max_queue_capacity {
            return Err(IoMgrError::Config(format!(
                "invalid queue capacity bounds [{}, {}]",
                self.min_queue_capacity, self.max_queue_capacity
            )));
        }
        Ok(())
    }
}

/// Suggested number of scan ranges a client should keep in flight.
pub fn default_parallel_scan_ranges() -> usize {
    2 * num_cpus::get()
}

/// Counts physical block devices under `/sys/block`, falling back to one disk
/// when the listing is unavailable.
pub fn detect_num_disks() -> usize {
    let Ok(entries) = fs::read_dir("/sys/block") else {
        return 1;
    };
    let count = entries
        .filter_map(Result::ok)
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            !VIRTUAL_BLOCK_DEVICES
                .iter()
                .any(|prefix| name.starts_with(prefix))
        })
        .count();
    count.max(1)
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}
