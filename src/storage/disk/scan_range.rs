use std::any::Any;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::common::config::{DiskId, GroupId};
use crate::storage::disk::file_system::ReadSeek;

/// Opaque client payload carried alongside a range and handed back with
/// every buffer read from it.
pub type ScanRangeMetaData = Arc<dyn Any + Send + Sync>;

/// A contiguous byte interval of one file, read from one disk.
#[derive(Clone)]
pub struct ScanRange {
    file: PathBuf,
    offset: u64,
    len: u64,
    disk_id: DiskId,
    meta_data: Option<ScanRangeMetaData>,
}

impl ScanRange {
    pub fn new(file: impl Into<PathBuf>, offset: u64, len: u64, disk_id: DiskId) -> Self {
        Self {
            file: file.into(),
            offset,
            len,
            disk_id,
            meta_data: None,
        }
    }

    pub fn with_meta_data(mut self, meta_data: ScanRangeMetaData) -> Self {
        self.meta_data = Some(meta_data);
        self
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn disk_id(&self) -> DiskId {
        self.disk_id
    }

    pub fn meta_data(&self) -> Option<&ScanRangeMetaData> {
        self.meta_data.as_ref()
    }

    /// Downcasts the payload to `T`, if one of that type was attached.
    pub fn meta_data_as<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.meta_data.as_ref()?.downcast_ref::<T>()
    }
}

impl fmt::Debug for ScanRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanRange")
            .field("file", &self.file)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("disk_id", &self.disk_id)
            .field("has_meta_data", &self.meta_data.is_some())
            .finish()
    }
}

impl fmt::Display for ScanRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "file={} disk_id={} offset={} len={}",
            self.file.display(),
            self.disk_id,
            self.offset,
            self.len
        )
    }
}

/// Ranges that must be started together: once any member is scheduled, every
/// other member is committed to be read as well.
#[derive(Debug, Clone, Default)]
pub struct ScanRangeGroup {
    ranges: Vec<ScanRange>,
}

impl ScanRangeGroup {
    pub fn new(ranges: Vec<ScanRange>) -> Self {
        Self { ranges }
    }

    pub fn ranges(&self) -> &[ScanRange] {
        &self.ranges
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn into_ranges(self) -> Vec<ScanRange> {
        self.ranges
    }
}

impl From<Vec<ScanRange>> for ScanRangeGroup {
    fn from(ranges: Vec<ScanRange>) -> Self {
        Self::new(ranges)
    }
}

/// Where a range sits in its reader's scheduling. The per-disk queues mirror
/// this tag and are checked against it by the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RangeState {
    /// Waiting on its disk's unscheduled queue.
    Unscheduled,
    /// A group sibling started; must be read before any new range on the disk.
    Committed,
    /// Started, not being read right now; waiting on the in-flight queue.
    InFlight,
    /// A disk thread owns the cursor and is reading.
    Reading,
    /// End of range reached or the read failed.
    Finished,
}

/// Open file and read position of a started range. Moves into the disk
/// thread for the duration of a read and back into the range table after.
#[derive(Default)]
pub(crate) struct RangeCursor {
    pub(crate) file: Option<Box<dyn ReadSeek>>,
    pub(crate) bytes_read: u64,
}

impl RangeCursor {
    pub(crate) fn close(&mut self) {
        self.file = None;
    }

    pub(crate) fn is_open(&self) -> bool {
        self.file.is_some()
    }
}

/// One row of a reader's range table.
pub(crate) struct RangeSlot {
    pub(crate) range: Arc<ScanRange>,
    pub(crate) group: Option<GroupId>,
    pub(crate) state: RangeState,
    /// `None` while a disk thread holds the cursor.
    pub(crate) cursor: Option<RangeCursor>,
    /// Buffers of this range queued or being filled.
    pub(crate) num_io_buffers: usize,
}

impl RangeSlot {
    pub(crate) fn new(range: ScanRange, group: Option<GroupId>) -> Self {
        Self {
            range: Arc::new(range),
            group,
            state: RangeState::Unscheduled,
            cursor: Some(RangeCursor::default()),
            num_io_buffers: 0,
        }
    }

    pub(crate) fn disk_id(&self) -> DiskId {
        self.range.disk_id()
    }
}
