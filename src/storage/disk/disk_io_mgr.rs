//! Disk I/O manager.
//!
//! Readers register, hand over scan ranges and pull filled buffers back with
//! [`DiskIoMgr::get_next`]. Each disk has a fixed set of worker threads that
//! pick readers off the disk's queue, choose a range to read for them, read
//! one buffer's worth outside every lock, and queue the result on the reader.
//!
//! # Core Responsibilities
//! - Running the per-disk worker threads
//! - Moving buffers between the pool, the disk threads and the consumer
//! - Enforcing process and reader memory limits
//! - Cooperative cancellation and unregistration of readers
//!
//! # Lock order
//! A reader's lock may be held while taking a disk queue lock, the buffer
//! pool lock or a resource pool lock. Never the other way around.

use std::io::{self, Read, Seek, SeekFrom};
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use log::{debug, info, trace, warn};
use parking_lot::MutexGuard;

use crate::buffer::io_buffer_pool::{IoBuffer, IoBufferPool};
use crate::common::config::{DiskId, IoMgrConfig, RangeId};
use crate::common::exception::{IoMgrError, IoMgrResult};
use crate::common::mem_limit::MemLimit;
use crate::concurrency::thread_resource_mgr::{ResourcePool, ThreadAvailableCb, ThreadResourceMgr};
use crate::storage::disk::buffer_descriptor::{BufferDescriptor, BufferOwner, ReadBuffer};
use crate::storage::disk::disk_queue::DiskQueue;
use crate::storage::disk::file_system::{FileSystem, LocalFileSystem};
use crate::storage::disk::reader_cache::{ReaderCache, ReaderHandle};
use crate::storage::disk::reader_context::{
    ReaderContext, ReaderLifecycle, ReaderState, ScheduledRead,
};
use crate::storage::disk::scan_range::{RangeCursor, RangeState, ScanRange, ScanRangeGroup};

/// Result of `get_next` and `try_get_next`: the next buffer, if any, and
/// whether every range of the reader has now been delivered.
pub type NextBuffer = (Option<BufferDescriptor>, bool);

/// A read returned by a disk thread, on its way back into the reader.
struct CompletedRead {
    reader: Arc<ReaderContext>,
    range_id: RangeId,
    scan_range: Arc<ScanRange>,
    cursor: RangeCursor,
    buffer: IoBuffer,
    /// Bytes read and whether the range ended.
    result: IoMgrResult<(usize, bool)>,
}

/// State shared between the public handle, the disk threads and every
/// outstanding buffer descriptor.
pub(crate) struct IoMgrInner {
    config: IoMgrConfig,
    num_disks: usize,
    disk_queues: Vec<DiskQueue>,
    buffer_pool: IoBufferPool,
    reader_cache: ReaderCache,
    thread_mgr: Arc<ThreadResourceMgr>,
    shut_down: AtomicBool,
    num_buffers_in_readers: AtomicUsize,
    total_bytes_read: AtomicU64,
}

impl IoMgrInner {
    fn read_loop(&self, disk_id: DiskId) {
        debug!("Disk thread for disk {} started", disk_id);
        while let Some(read) = self.get_next_scan_range(disk_id) {
            let completed = self.read_range(read);
            self.handle_read_finished(disk_id, completed);
        }
        debug!("Disk thread for disk {} stopped", disk_id);
    }

    /// Blocks until some reader queued on `disk_id` has a range to read.
    ///
    /// # Returns
    /// `None` only on shutdown.
    fn get_next_scan_range(&self, disk_id: DiskId) -> Option<ScheduledRead> {
        let queue = &self.disk_queues[disk_id];
        loop {
            let reader = queue.wait_for_reader(&self.shut_down)?;
            self.check_mem_limits(&reader);

            let mut state = reader.state.lock();
            debug_assert_ne!(state.lifecycle, ReaderLifecycle::Inactive);
            if state.is_cancelled() {
                // The last thread out releases this disk's reference.
                if reader.decrement_threads_in_read(disk_id) == 0 {
                    state.disk_states[disk_id].num_remaining_ranges = 0;
                    reader.decrement_disk_ref_count(&mut state);
                    state.disk_states[disk_id].done = true;
                }
                continue;
            }

            match reader.get_scan_range(&mut state, disk_id, &self.buffer_pool, &self.disk_queues) {
                Some(read) => {
                    // Requeue right away so other threads on this disk can
                    // start the reader's other ranges.
                    queue.enqueue_reader(Arc::clone(&reader));
                    return Some(read);
                }
                None => {
                    reader.decrement_threads_in_read(disk_id);
                }
            }
        }
    }

    fn check_mem_limits(&self, reader: &Arc<ReaderContext>) {
        let (reader_limit, generation) = {
            let state = reader.state.lock();
            (state.mem_limit.clone(), state.generation)
        };
        let reader_exceeded = reader_limit
            .as_ref()
            .is_some_and(|limit| limit.limit_exceeded());
        let mut process_exceeded = self.buffer_pool.process_limit_exceeded();
        if process_exceeded && !reader_exceeded {
            // Free buffers may be all that is over the limit.
            self.buffer_pool.gc_buffers();
            process_exceeded = self.buffer_pool.process_limit_exceeded();
        }
        if reader_exceeded || process_exceeded {
            warn!(
                "Memory limit exceeded (reader: {}, process: {}), cancelling reader {}",
                reader_exceeded,
                process_exceeded,
                reader.slot()
            );
            self.cancel_reader_internal(reader, generation, IoMgrError::MemLimitExceeded);
        }
    }

    /// Fills the buffer from the range's file. Runs without any lock held.
    fn read_range(&self, read: ScheduledRead) -> CompletedRead {
        let ScheduledRead {
            reader,
            range_id,
            scan_range,
            mut cursor,
            mut buffer,
            file_system,
        } = read;

        let max_read = self.config.read_size.min(buffer.len());
        let result = open_scan_range(file_system.as_ref(), &scan_range, &mut cursor)
            .and_then(|()| read_from_scan_range(&scan_range, &mut cursor, &mut buffer[..max_read]));

        match &result {
            Ok((len, eosr)) => {
                trace!(
                    "Read {} bytes from {} (eosr={})",
                    len, scan_range, eosr
                );
                reader.add_bytes_read(*len as u64);
                self.total_bytes_read.fetch_add(*len as u64, Ordering::Relaxed);
            }
            Err(err) => warn!(
                "Read of {} through {} failed: {}",
                scan_range,
                file_system.name(),
                err
            ),
        }

        CompletedRead {
            reader,
            range_id,
            scan_range,
            cursor,
            buffer,
            result,
        }
    }

    /// Puts a finished read back into its reader and wakes one consumer.
    fn handle_read_finished(&self, disk_id: DiskId, completed: CompletedRead) {
        let CompletedRead {
            reader,
            range_id,
            scan_range,
            mut cursor,
            buffer,
            result,
        } = completed;

        let mut state = reader.state.lock();
        reader.decrement_threads_in_read(disk_id);
        state.num_buffers_in_disk_threads -= 1;

        if state.is_cancelled() {
            cursor.close();
            let slot = &mut state.ranges[range_id];
            slot.cursor = Some(cursor);
            slot.state = RangeState::Finished;
            slot.num_io_buffers -= 1;
            state.num_used_buffers -= 1;
            self.buffer_pool
                .return_free_buffer(state.mem_limit.as_deref(), buffer);

            if self.disk_queues[disk_id].is_idle_for(&reader) {
                debug_assert!(!state.disk_states[disk_id].done);
                state.disk_states[disk_id].num_remaining_ranges = 0;
                reader.decrement_disk_ref_count(&mut state);
                state.disk_states[disk_id].done = true;
            }
            return;
        }

        let ready = match result {
            Err(err) => {
                cursor.close();
                let slot = &mut state.ranges[range_id];
                slot.cursor = Some(cursor);
                slot.state = RangeState::Finished;
                slot.num_io_buffers -= 1;
                state.num_used_buffers -= 1;
                state.disk_states[disk_id].num_remaining_ranges -= 1;
                self.buffer_pool
                    .return_free_buffer(state.mem_limit.as_deref(), buffer);
                ReadBuffer {
                    range_id,
                    scan_range,
                    buffer: None,
                    len: 0,
                    eosr: true,
                    scan_range_offset: 0,
                    status: Some(err),
                }
            }
            Ok((len, eosr)) => {
                let scan_range_offset = cursor.bytes_read - len as u64;
                if eosr {
                    cursor.close();
                    state.disk_states[disk_id].num_remaining_ranges -= 1;
                } else {
                    state.disk_states[disk_id].in_flight_ranges.push_back(range_id);
                }
                let slot = &mut state.ranges[range_id];
                slot.cursor = Some(cursor);
                slot.state = if eosr {
                    RangeState::Finished
                } else {
                    RangeState::InFlight
                };
                ReadBuffer {
                    range_id,
                    scan_range,
                    buffer: Some(buffer),
                    len,
                    eosr,
                    scan_range_offset,
                    status: None,
                }
            }
        };

        state.ready_buffers.push_back(ready);
        reader.sync_ready_count(&state);
        if state.ready_buffers.len() >= state.io_buffers_quota {
            // The consumer is falling behind; back off this reader.
            let quota = state.io_buffers_quota - 1;
            reader.set_max_io_buffers(&mut state, quota, &self.disk_queues);
        }
        debug_assert!(reader.validate(&state), "{}", reader.debug_string(&state));
        drop(state);
        reader.buffer_ready.notify_one();
    }

    /// Moves the reader to `Cancelled` with `status` unless it already left
    /// `Active` or was re-registered since `generation`.
    fn cancel_reader_internal(&self, reader: &Arc<ReaderContext>, generation: u64, status: IoMgrError) {
        // Clear the callback before taking the reader lock; the callback
        // itself locks the reader.
        let pool = {
            let state = reader.state.lock();
            if state.generation != generation || state.lifecycle != ReaderLifecycle::Active {
                return;
            }
            state.resource_pool.clone()
        };
        if let Some(pool) = pool {
            pool.set_thread_available_cb(None);
        }

        let (ready, mem_limit) = {
            let mut state = reader.state.lock();
            if state.generation != generation || state.lifecycle != ReaderLifecycle::Active {
                return;
            }
            debug!("Cancelling reader {}: {}", reader.slot(), status);
            state.status = Some(status);
            state.lifecycle = ReaderLifecycle::Cancelled;

            let ready = mem::take(&mut state.ready_buffers);
            reader.sync_ready_count(&state);
            for read in ready.iter().filter(|read| read.buffer.is_some()) {
                state.num_used_buffers -= 1;
                state.ranges[read.range_id].num_io_buffers -= 1;
            }

            // Every disk must see the cancellation to release its reference.
            let num_unscheduled = state.unscheduled_disks.len();
            reader.schedule_new_disks(&mut state, &self.disk_queues, num_unscheduled);
            debug_assert!(reader.validate(&state), "{}", reader.debug_string(&state));
            (ready, state.mem_limit.clone())
        };

        reader.buffer_ready.notify_all();

        for buffer in ready.into_iter().filter_map(|read| read.buffer) {
            self.buffer_pool
                .return_free_buffer(mem_limit.as_deref(), buffer);
        }
    }

    /// Called when the reader's resource pool frees a thread token.
    fn thread_available(&self, reader: &Arc<ReaderContext>, generation: u64, pool: &ResourcePool) {
        let mut state = reader.state.lock();
        if state.generation != generation || state.lifecycle != ReaderLifecycle::Active {
            return;
        }
        let num_available = pool.num_available_threads();
        reader.schedule_new_disks(&mut state, &self.disk_queues, num_available);
    }

    /// Takes back a buffer a consumer is done with.
    pub(crate) fn return_buffer(
        &self,
        owner: Option<BufferOwner>,
        mem_limit: Option<&MemLimit>,
        buffer: IoBuffer,
    ) {
        self.buffer_pool.return_free_buffer(mem_limit, buffer);
        let prev = self.num_buffers_in_readers.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
        if let Some(owner) = owner {
            let mut state = owner.reader.state.lock();
            if state.generation == owner.generation && state.lifecycle != ReaderLifecycle::Inactive {
                debug_assert!(state.num_buffers_in_reader > 0);
                state.num_buffers_in_reader -= 1;
            }
        }
    }

    fn validate_scan_range(&self, range: &ScanRange) -> IoMgrResult<()> {
        if range.disk_id() >= self.num_disks {
            return Err(IoMgrError::InvalidDiskId {
                disk_id: range.disk_id(),
                num_disks: self.num_disks,
            });
        }
        if range.is_empty() {
            return Err(IoMgrError::InvalidScanRange(format!("empty range: {}", range)));
        }
        Ok(())
    }
}

fn open_scan_range(
    file_system: &dyn FileSystem,
    range: &ScanRange,
    cursor: &mut RangeCursor,
) -> IoMgrResult<()> {
    if cursor.is_open() {
        return Ok(());
    }
    let mut file = file_system
        .open(range.file())
        .map_err(|e| IoMgrError::Open {
            path: range.file().to_path_buf(),
            source: Arc::new(e),
        })?;
    file.seek(SeekFrom::Start(range.offset()))
        .map_err(|e| IoMgrError::Seek {
            path: range.file().to_path_buf(),
            offset: range.offset(),
            source: Arc::new(e),
        })?;
    cursor.file = Some(file);
    Ok(())
}

/// Reads the next chunk of the range into `buffer`.
///
/// # Returns
/// Bytes read and whether the range is exhausted. Hitting end of file before
/// the range's length also ends the range.
fn read_from_scan_range(
    range: &ScanRange,
    cursor: &mut RangeCursor,
    buffer: &mut [u8],
) -> IoMgrResult<(usize, bool)> {
    let read_offset = range.offset() + cursor.bytes_read;
    let read_error = |source: io::Error| IoMgrError::Read {
        path: range.file().to_path_buf(),
        offset: read_offset,
        source: Arc::new(source),
    };
    let Some(file) = cursor.file.as_mut() else {
        return Err(read_error(io::Error::other("scan range is not open")));
    };

    let remaining = range.len() - cursor.bytes_read;
    let bytes_to_read = remaining.min(buffer.len() as u64) as usize;
    let mut filled = 0;
    let mut eosr = false;
    while filled < bytes_to_read {
        match file.read(&mut buffer[filled..bytes_to_read]) {
            Ok(0) => {
                eosr = true;
                break;
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(read_error(e)),
        }
    }
    cursor.bytes_read += filled as u64;
    if cursor.bytes_read == range.len() {
        eosr = true;
    }
    Ok((filled, eosr))
}

/// Multi-disk scan range reader.
///
/// Dropping the manager stops and joins every disk thread. Buffers still
/// held by consumers stay valid and go back to the (now idle) pool when
/// returned.
pub struct DiskIoMgr {
    inner: Arc<IoMgrInner>,
    disk_threads: Vec<JoinHandle<()>>,
}

impl DiskIoMgr {
    /// Creates the manager and starts `threads_per_disk` threads per disk.
    ///
    /// # Parameters
    /// - `config`: disk count, threads, read size and quota bounds.
    /// - `thread_mgr`: source of the resource pools used by synchronous reads.
    ///
    /// # Returns
    /// The running manager, or an error if the configuration is invalid or a
    /// thread could not be spawned.
    pub fn new(config: IoMgrConfig, thread_mgr: Arc<ThreadResourceMgr>) -> IoMgrResult<Self> {
        config.validate()?;
        let num_disks = config.effective_num_disks();

        let inner = Arc::new(IoMgrInner {
            num_disks,
            disk_queues: (0..num_disks).map(DiskQueue::new).collect(),
            buffer_pool: IoBufferPool::new(config.read_size),
            reader_cache: ReaderCache::new(
                num_disks,
                config.min_queue_capacity,
                config.max_queue_capacity,
            ),
            thread_mgr,
            shut_down: AtomicBool::new(false),
            num_buffers_in_readers: AtomicUsize::new(0),
            total_bytes_read: AtomicU64::new(0),
            config,
        });

        let mut disk_threads = Vec::with_capacity(num_disks * inner.config.threads_per_disk);
        for disk_id in 0..num_disks {
            for thread_idx in 0..inner.config.threads_per_disk {
                let worker = Arc::clone(&inner);
                let spawned = thread::Builder::new()
                    .name(format!("disk-io-{}-{}", disk_id, thread_idx))
                    .spawn(move || worker.read_loop(disk_id));
                match spawned {
                    Ok(handle) => disk_threads.push(handle),
                    Err(e) => {
                        // Dropping the partial manager stops the threads
                        // already running.
                        drop(DiskIoMgr {
                            inner,
                            disk_threads,
                        });
                        return Err(IoMgrError::ThreadSpawn(e.to_string()));
                    }
                }
            }
        }

        info!(
            "Disk I/O manager started: {} disks, {} threads per disk, {} byte reads",
            num_disks, inner.config.threads_per_disk, inner.config.read_size
        );
        Ok(Self {
            inner,
            disk_threads,
        })
    }

    /// Registers a new reader.
    ///
    /// # Parameters
    /// - `file_system`: opens the reader's files; `None` reads local files.
    /// - `resource_pool`: thread tokens that bound how many ranges the reader
    ///   starts at once.
    /// - `mem_limit`: charged for every buffer read on the reader's behalf.
    /// - `max_io_buffers`: initial buffer quota; zero lets the manager pick.
    pub fn register_reader(
        &self,
        file_system: Option<Arc<dyn FileSystem>>,
        resource_pool: Arc<ResourcePool>,
        mem_limit: Option<Arc<MemLimit>>,
        max_io_buffers: usize,
    ) -> ReaderHandle {
        let reader = self.inner.reader_cache.get_new_reader();
        let file_system = file_system.unwrap_or_else(|| Arc::new(LocalFileSystem));
        let generation = {
            let mut state = reader.state.lock();
            state.reset(
                file_system,
                Arc::clone(&resource_pool),
                mem_limit,
                reader.min_queue_capacity(),
            );
            reader.sync_ready_count(&state);
            reader.set_max_io_buffers(&mut state, max_io_buffers, &self.inner.disk_queues);
            state.generation
        };
        reader.reset_bytes_read();

        resource_pool.reserve_optional_tokens(1);
        let weak_inner = Arc::downgrade(&self.inner);
        let weak_reader = Arc::downgrade(&reader);
        let cb: ThreadAvailableCb = Arc::new(move |pool: &ResourcePool| {
            if let (Some(inner), Some(reader)) = (weak_inner.upgrade(), weak_reader.upgrade()) {
                inner.thread_available(&reader, generation, pool);
            }
        });
        resource_pool.set_thread_available_cb(Some(cb));

        debug!("Registered reader {} (generation {})", reader.slot(), generation);
        ReaderHandle::new(reader.slot(), generation)
    }

    /// Cancels the reader, waits for every disk thread to let go of it and
    /// returns it to the cache. The handle is invalid afterwards.
    pub fn unregister_reader(&self, handle: ReaderHandle) -> IoMgrResult<()> {
        let reader = self.inner.reader_cache.get(handle)?;
        drop(reader.lock_checked(handle.generation())?);
        self.inner
            .cancel_reader_internal(&reader, handle.generation(), IoMgrError::Cancelled);

        let mut state = reader.lock_checked(handle.generation())?;
        while state.num_disks_with_ranges > 0 && state.generation == handle.generation() {
            reader.disks_complete.wait(&mut state);
        }
        // A concurrent unregister of the same handle may have finished while
        // this one waited.
        if state.generation != handle.generation() || state.lifecycle == ReaderLifecycle::Inactive {
            return Err(IoMgrError::InvalidReader);
        }
        debug_assert!(state.ready_buffers.is_empty());
        debug_assert_eq!(
            state.num_used_buffers, 0,
            "{}",
            reader.debug_string(&state)
        );
        if state.num_buffers_in_reader > 0 {
            warn!(
                "Reader {} unregistered with {} buffers not yet returned",
                handle.slot(),
                state.num_buffers_in_reader
            );
        }
        for cursor in state.ranges.iter_mut().filter_map(|slot| slot.cursor.as_mut()) {
            cursor.close();
        }
        self.inner.reader_cache.return_reader(&reader, &mut state);
        drop(state);

        debug!("Unregistered reader {}", handle.slot());
        Ok(())
    }

    /// Cancels the reader. Buffers already queued go back to the pool and
    /// blocked `get_next` callers return [`IoMgrError::Cancelled`]. Calling it
    /// again has no further effect.
    pub fn cancel_reader(&self, handle: ReaderHandle) -> IoMgrResult<()> {
        let reader = self.inner.reader_cache.get(handle)?;
        drop(reader.lock_checked(handle.generation())?);
        self.inner
            .cancel_reader_internal(&reader, handle.generation(), IoMgrError::Cancelled);
        Ok(())
    }

    /// Queues ranges on their disks. Fails without adding anything if any
    /// range names a disk that does not exist or is empty.
    pub fn add_scan_ranges(&self, handle: ReaderHandle, ranges: Vec<ScanRange>) -> IoMgrResult<()> {
        for range in &ranges {
            self.inner.validate_scan_range(range)?;
        }
        let reader = self.inner.reader_cache.get(handle)?;
        let mut state = reader.lock_checked(handle.generation())?;
        if state.is_cancelled() {
            return Err(state.cancel_status());
        }

        let num_ranges = ranges.len();
        let ranges = ranges.into_iter().map(|range| (range, None)).collect();
        reader.add_scan_ranges(&mut state, ranges, &self.inner.disk_queues);
        debug!("Added {} scan ranges to reader {}", num_ranges, handle.slot());
        debug_assert!(reader.validate(&state), "{}", reader.debug_string(&state));
        Ok(())
    }

    /// Queues groups of ranges. Groups of one range are queued as plain
    /// ranges. The reader's quota is raised to fit the largest group.
    pub fn add_scan_range_groups(
        &self,
        handle: ReaderHandle,
        groups: Vec<ScanRangeGroup>,
    ) -> IoMgrResult<()> {
        for range in groups.iter().flat_map(|group| group.ranges()) {
            self.inner.validate_scan_range(range)?;
        }
        let reader = self.inner.reader_cache.get(handle)?;
        let mut state = reader.lock_checked(handle.generation())?;
        if state.is_cancelled() {
            return Err(state.cancel_status());
        }

        let max_group_size = groups
            .iter()
            .map(ScanRangeGroup::len)
            .filter(|&len| len > 1)
            .max()
            .unwrap_or(0);
        if max_group_size > 0 {
            // A group can only start once the quota covers all its members.
            state.min_num_buffers = state.min_num_buffers.max(max_group_size);
            if max_group_size > state.io_buffers_quota {
                reader.set_max_io_buffers(&mut state, max_group_size, &self.inner.disk_queues);
            }
        }

        let mut ranges = Vec::new();
        for group in groups {
            match group.len() {
                0 => {}
                1 => ranges.extend(group.into_ranges().into_iter().map(|range| (range, None))),
                len => {
                    let group_id = state.groups.len();
                    state.groups.push(Vec::with_capacity(len));
                    ranges.extend(
                        group
                            .into_ranges()
                            .into_iter()
                            .map(|range| (range, Some(group_id))),
                    );
                }
            }
        }
        reader.add_scan_ranges(&mut state, ranges, &self.inner.disk_queues);
        debug_assert!(reader.validate(&state), "{}", reader.debug_string(&state));
        Ok(())
    }

    /// Returns the next filled buffer, blocking until one is ready.
    ///
    /// # Returns
    /// - `Ok((Some(buffer), eos))`: `eos` is true if this was the reader's last buffer.
    /// - `Ok((None, true))`: every range was already delivered.
    /// - `Err(_)`: the reader was cancelled, hit a memory limit, or this
    ///   buffer's read failed. The reader is cancelled in every case.
    pub fn get_next(&self, handle: ReaderHandle) -> IoMgrResult<NextBuffer> {
        let reader = self.inner.reader_cache.get(handle)?;
        let mut state = reader.lock_checked(handle.generation())?;
        loop {
            if state.is_cancelled() {
                return Err(state.cancel_status());
            }
            if !state.ready_buffers.is_empty() {
                break;
            }
            if state.num_remaining_ranges == 0 {
                return Ok((None, true));
            }
            reader.buffer_ready.wait(&mut state);
            if state.generation != handle.generation()
                || state.lifecycle == ReaderLifecycle::Inactive
            {
                return Err(IoMgrError::InvalidReader);
            }
        }
        self.deliver_next(&reader, state)
    }

    /// Like [`DiskIoMgr::get_next`] but never blocks.
    ///
    /// # Returns
    /// `Ok((None, false))` if no buffer is ready yet.
    pub fn try_get_next(&self, handle: ReaderHandle) -> IoMgrResult<NextBuffer> {
        let reader = self.inner.reader_cache.get(handle)?;
        let state = reader.lock_checked(handle.generation())?;
        if state.is_cancelled() {
            return Err(state.cancel_status());
        }
        if state.ready_buffers.is_empty() {
            return Ok((None, state.num_remaining_ranges == 0));
        }
        self.deliver_next(&reader, state)
    }

    /// Pops the head of a non-empty ready queue and hands it to the consumer.
    fn deliver_next(
        &self,
        reader: &Arc<ReaderContext>,
        mut state: MutexGuard<'_, ReaderState>,
    ) -> IoMgrResult<NextBuffer> {
        let Some(read) = state.ready_buffers.pop_front() else {
            return Ok((None, state.num_remaining_ranges == 0));
        };
        reader.sync_ready_count(&state);

        if let Some(err) = read.status {
            // A failed read finishes its range and ends the reader.
            state.num_finished_ranges += 1;
            state.num_remaining_ranges -= 1;
            let generation = state.generation;
            drop(state);
            self.inner
                .cancel_reader_internal(reader, generation, err.clone());
            return Err(err);
        }

        let mut eos = false;
        if read.eosr {
            state.num_finished_ranges += 1;
            state.num_remaining_ranges -= 1;
            if state.num_remaining_ranges == 0 {
                eos = true;
                reader.buffer_ready.notify_all();
            }
        }
        state.num_used_buffers -= 1;
        state.num_buffers_in_reader += 1;
        self.inner
            .num_buffers_in_readers
            .fetch_add(1, Ordering::AcqRel);

        reader.range_buffer_delivered(&mut state, read.range_id, read.eosr);

        if state.ready_buffers.is_empty() {
            // The consumer caught up; read further ahead.
            let quota = state.io_buffers_quota * 2;
            reader.set_max_io_buffers(&mut state, quota, &self.inner.disk_queues);
        }
        reader.schedule_new_disks(&mut state, &self.inner.disk_queues, 1);
        debug_assert!(reader.validate(&state), "{}", reader.debug_string(&state));

        let owner = BufferOwner {
            reader: Arc::clone(reader),
            generation: state.generation,
        };
        let mem_limit = state.mem_limit.clone();
        drop(state);

        let buffer = BufferDescriptor::new(Arc::clone(&self.inner), owner, mem_limit, read);
        Ok((Some(buffer), eos))
    }

    /// Reads one range synchronously through a temporary reader.
    ///
    /// The range must fit in a single buffer.
    pub fn read(
        &self,
        file_system: Option<Arc<dyn FileSystem>>,
        range: ScanRange,
    ) -> IoMgrResult<BufferDescriptor> {
        self.inner.validate_scan_range(&range)?;
        if range.len() > self.inner.config.read_size as u64 {
            return Err(IoMgrError::InvalidScanRange(format!(
                "synchronous read of {} bytes exceeds the {} byte read size",
                range.len(),
                self.inner.config.read_size
            )));
        }

        let pool = self.inner.thread_mgr.register_pool();
        let handle = self.register_reader(file_system, Arc::clone(&pool), None, 1);
        let reader = self.inner.reader_cache.get(handle)?;
        reader.state.lock().sync_reader = true;

        let result = match self
            .add_scan_ranges(handle, vec![range])
            .and_then(|()| self.get_next(handle))
        {
            Ok((Some(mut buffer), eos)) => {
                debug_assert!(eos);
                // The buffer outlives the temporary reader.
                if let Some(owner) = buffer.detach_owner() {
                    owner.reader.state.lock().num_buffers_in_reader -= 1;
                }
                Ok(buffer)
            }
            Ok((None, _)) => Err(IoMgrError::InvalidScanRange(
                "synchronous read produced no data".to_string(),
            )),
            Err(err) => Err(err),
        };

        let unregistered = self.unregister_reader(handle);
        self.inner.thread_mgr.unregister_pool(&pool);
        let buffer = result?;
        unregistered?;
        Ok(buffer)
    }

    /// Overrides the reader's buffer quota, within the configured bounds.
    pub fn set_max_io_buffers(&self, handle: ReaderHandle, max_buffers: usize) -> IoMgrResult<()> {
        let reader = self.inner.reader_cache.get(handle)?;
        let mut state = reader.lock_checked(handle.generation())?;
        reader.set_max_io_buffers(&mut state, max_buffers, &self.inner.disk_queues);
        Ok(())
    }

    pub fn set_process_mem_limit(&self, limit: Option<Arc<MemLimit>>) {
        self.inner.buffer_pool.set_process_mem_limit(limit);
    }

    /// The reader's current buffer quota.
    pub fn queue_capacity(&self, handle: ReaderHandle) -> IoMgrResult<usize> {
        let reader = self.inner.reader_cache.get(handle)?;
        let state = reader.lock_checked(handle.generation())?;
        Ok(state.io_buffers_quota)
    }

    /// Buffers waiting on the reader's ready queue. Does not take the reader
    /// lock.
    pub fn queue_size(&self, handle: ReaderHandle) -> IoMgrResult<usize> {
        Ok(self.inner.reader_cache.get(handle)?.num_ready_buffers())
    }

    /// Bytes read from disk for the reader since it was registered.
    pub fn reader_bytes_read(&self, handle: ReaderHandle) -> IoMgrResult<u64> {
        Ok(self.inner.reader_cache.get(handle)?.bytes_read())
    }

    pub fn num_disks(&self) -> usize {
        self.inner.num_disks
    }

    pub fn read_buffer_size(&self) -> usize {
        self.inner.config.read_size
    }

    pub fn thread_mgr(&self) -> &Arc<ThreadResourceMgr> {
        &self.inner.thread_mgr
    }

    pub fn num_allocated_buffers(&self) -> usize {
        self.inner.buffer_pool.num_allocated_buffers()
    }

    pub fn num_free_buffers(&self) -> usize {
        self.inner.buffer_pool.num_free_buffers()
    }

    /// Buffers delivered to consumers and not yet returned.
    pub fn num_buffers_in_readers(&self) -> usize {
        self.inner.num_buffers_in_readers.load(Ordering::Acquire)
    }

    pub fn total_bytes_read(&self) -> u64 {
        self.inner.total_bytes_read.load(Ordering::Relaxed)
    }

    /// Frees every pooled buffer not in use.
    pub fn gc_io_buffers(&self) -> usize {
        self.inner.buffer_pool.gc_buffers()
    }

    /// Checks every registered reader and the global buffer accounting. The
    /// accounting check is only meaningful while no thread is inside the
    /// manager.
    pub fn validate(&self) -> bool {
        let mut valid = true;
        let mut owned_by_readers = 0;
        for reader in self.inner.reader_cache.all_readers() {
            let state = reader.state.lock();
            if state.lifecycle == ReaderLifecycle::Inactive {
                continue;
            }
            valid &= reader.validate(&state);
            owned_by_readers += state.num_used_buffers;
        }
        let outstanding = owned_by_readers + self.num_buffers_in_readers();
        let allocated = self.num_allocated_buffers();
        let free = self.num_free_buffers();
        if allocated != free + outstanding {
            warn!(
                "Buffer accounting mismatch: {} allocated, {} free, {} outstanding",
                allocated, free, outstanding
            );
            valid = false;
        }
        valid
    }

    pub fn debug_string(&self) -> String {
        let mut out = format!(
            "Disk I/O manager: {} disks, {} allocated buffers, {} free, {} in readers\nDisk queues:",
            self.inner.num_disks,
            self.num_allocated_buffers(),
            self.num_free_buffers(),
            self.num_buffers_in_readers()
        );
        for queue in &self.inner.disk_queues {
            out.push_str(&format!("\n  {}: {} readers queued", queue.disk_id(), queue.len()));
        }
        out.push('\n');
        out.push_str(&self.inner.reader_cache.debug_string());
        out
    }

    pub fn num_registered_readers(&self) -> usize {
        self.inner.reader_cache.num_readers() - self.inner.reader_cache.num_inactive_readers()
    }
}

impl Drop for DiskIoMgr {
    fn drop(&mut self) {
        self.inner.shut_down.store(true, Ordering::Release);
        for queue in &self.inner.disk_queues {
            queue.wake_all();
        }
        for handle in self.disk_threads.drain(..) {
            if let Err(e) = handle.join() {
                info!("Failed to join disk thread: {:?}", e);
            }
        }

        // Release the disk references of readers that were still queued.
        for queue in &self.inner.disk_queues {
            for reader in queue.drain() {
                let mut state = reader.state.lock();
                let disk_state = &mut state.disk_states[queue.disk_id()];
                if !disk_state.done {
                    disk_state.done = true;
                    reader.decrement_disk_ref_count(&mut state);
                }
            }
        }

        if !self.inner.reader_cache.validate_all_inactive() {
            warn!(
                "Disk I/O manager shut down with readers still registered:\n{}",
                self.inner.reader_cache.debug_string()
            );
        }
        self.inner.buffer_pool.gc_buffers();
        info!("Disk I/O manager shut down");
    }
}
