use std::fmt;
use std::sync::Arc;

use crate::buffer::io_buffer_pool::IoBuffer;
use crate::common::config::RangeId;
use crate::common::exception::IoMgrError;
use crate::common::mem_limit::MemLimit;
use crate::storage::disk::disk_io_mgr::IoMgrInner;
use crate::storage::disk::reader_context::ReaderContext;
use crate::storage::disk::scan_range::ScanRange;

/// A completed read waiting on a reader's ready queue. Still owned by the
/// I/O manager and counted in the reader's used buffers.
pub(crate) struct ReadBuffer {
    pub(crate) range_id: RangeId,
    pub(crate) scan_range: Arc<ScanRange>,
    /// `None` when the read failed; the buffer has already gone back to the pool.
    pub(crate) buffer: Option<IoBuffer>,
    pub(crate) len: usize,
    pub(crate) eosr: bool,
    pub(crate) scan_range_offset: u64,
    pub(crate) status: Option<IoMgrError>,
}

impl ReadBuffer {
    pub(crate) fn is_ok(&self) -> bool {
        self.status.is_none()
    }
}

/// The reader a delivered buffer is counted against. The generation guards
/// against the reader's slot having been recycled before the buffer returns.
pub(crate) struct BufferOwner {
    pub(crate) reader: Arc<ReaderContext>,
    pub(crate) generation: u64,
}

/// A filled buffer handed to a consumer by `get_next` or `read`.
///
/// The consumer owns the bytes until it calls [`BufferDescriptor::return_buffer`]
/// or drops the descriptor; either one hands the memory back to the pool.
pub struct BufferDescriptor {
    io_mgr: Arc<IoMgrInner>,
    owner: Option<BufferOwner>,
    mem_limit: Option<Arc<MemLimit>>,
    scan_range: Arc<ScanRange>,
    buffer: Option<IoBuffer>,
    len: usize,
    eosr: bool,
    scan_range_offset: u64,
}

impl BufferDescriptor {
    /// Turns a successful read from the ready queue into a consumer-owned
    /// descriptor.
    pub(crate) fn new(
        io_mgr: Arc<IoMgrInner>,
        owner: BufferOwner,
        mem_limit: Option<Arc<MemLimit>>,
        read: ReadBuffer,
    ) -> Self {
        debug_assert!(read.is_ok() && read.buffer.is_some());
        Self {
            io_mgr,
            owner: Some(owner),
            mem_limit,
            scan_range: read.scan_range,
            buffer: read.buffer,
            len: read.len,
            eosr: read.eosr,
            scan_range_offset: read.scan_range_offset,
        }
    }

    pub fn scan_range(&self) -> &ScanRange {
        &self.scan_range
    }

    /// The bytes read. Shorter than the buffer capacity for the last read of a
    /// range or when the file ended early.
    pub fn buffer(&self) -> &[u8] {
        match &self.buffer {
            Some(buffer) => &buffer[..self.len],
            None => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True if this is the last buffer of its scan range.
    pub fn eosr(&self) -> bool {
        self.eosr
    }

    /// Offset of the first byte of this buffer within its scan range.
    pub fn scan_range_offset(&self) -> u64 {
        self.scan_range_offset
    }

    /// Hands the buffer back to the I/O manager.
    pub fn return_buffer(self) {
        drop(self);
    }

    /// Stops counting this buffer against its reader so the reader can be
    /// unregistered while the descriptor lives on.
    pub(crate) fn detach_owner(&mut self) -> Option<BufferOwner> {
        self.owner.take()
    }
}

impl Drop for BufferDescriptor {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.io_mgr
                .return_buffer(self.owner.take(), self.mem_limit.as_deref(), buffer);
        }
    }
}

impl fmt::Debug for BufferDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferDescriptor")
            .field("scan_range", &self.scan_range)
            .field("len", &self.len)
            .field("eosr", &self.eosr)
            .field("scan_range_offset", &self.scan_range_offset)
            .finish()
    }
}
