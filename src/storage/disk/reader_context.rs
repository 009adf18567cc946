//! Per-reader scheduling state.
//!
//! A [`ReaderContext`] holds everything the I/O manager tracks for one
//! registered reader: its lifecycle, buffer quota, range table, per-disk
//! queues of ranges and the queue of filled buffers waiting for the consumer.
//!
//! # Core Responsibilities
//! - Choosing the next range a disk thread reads for this reader
//! - Adapting the buffer quota to how fast the consumer drains buffers
//! - Committing every range of a group once the first one starts
//! - Tracking which disks still hold work so unregistration can wait for them
//!
//! All state lives behind one mutex. The only exception is the per-disk count
//! of threads currently working for the reader, which disk threads bump while
//! holding their disk queue lock.

use std::collections::VecDeque;
use std::fmt::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use log::error;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::buffer::io_buffer_pool::{IoBuffer, IoBufferPool};
use crate::common::config::{DiskId, GroupId, RangeId};
use crate::common::exception::{IoMgrError, IoMgrResult};
use crate::common::mem_limit::MemLimit;
use crate::concurrency::thread_resource_mgr::ResourcePool;
use crate::storage::disk::buffer_descriptor::ReadBuffer;
use crate::storage::disk::disk_queue::DiskQueue;
use crate::storage::disk::file_system::{FileSystem, LocalFileSystem};
use crate::storage::disk::scan_range::{RangeCursor, RangeSlot, RangeState, ScanRange};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReaderLifecycle {
    Active,
    Cancelled,
    /// Sitting in the reader cache, not registered.
    Inactive,
}

/// Scheduling state of one reader on one disk.
#[derive(Debug)]
pub(crate) struct PerDiskState {
    /// No ranges left and no disk reference held.
    pub(crate) done: bool,
    /// Ranges on this disk that have not reached end of range.
    pub(crate) num_remaining_ranges: usize,
    pub(crate) unscheduled_ranges: VecDeque<RangeId>,
    pub(crate) in_flight_ranges: VecDeque<RangeId>,
    pub(crate) committed_ranges: VecDeque<RangeId>,
}

impl Default for PerDiskState {
    fn default() -> Self {
        Self {
            done: true,
            num_remaining_ranges: 0,
            unscheduled_ranges: VecDeque::new(),
            in_flight_ranges: VecDeque::new(),
            committed_ranges: VecDeque::new(),
        }
    }
}

pub(crate) struct ReaderState {
    /// Bumped on every registration; handles from earlier registrations stop
    /// matching.
    pub(crate) generation: u64,
    pub(crate) lifecycle: ReaderLifecycle,
    /// First error seen. Set together with the move to `Cancelled`.
    pub(crate) status: Option<IoMgrError>,
    pub(crate) file_system: Arc<dyn FileSystem>,
    pub(crate) resource_pool: Option<Arc<ResourcePool>>,
    pub(crate) mem_limit: Option<Arc<MemLimit>>,
    pub(crate) sync_reader: bool,

    pub(crate) num_disks_with_ranges: usize,
    pub(crate) io_buffers_quota: usize,
    pub(crate) min_num_buffers: usize,
    /// Buffers being filled plus successful buffers on the ready queue.
    pub(crate) num_used_buffers: usize,
    pub(crate) num_buffers_in_disk_threads: usize,
    /// Buffers delivered to the consumer and not yet returned.
    pub(crate) num_buffers_in_reader: usize,
    /// Ranges whose last buffer has not been delivered.
    pub(crate) num_remaining_ranges: usize,
    pub(crate) num_finished_ranges: usize,
    pub(crate) num_committed_ranges: usize,

    pub(crate) ready_buffers: VecDeque<ReadBuffer>,
    pub(crate) ranges: Vec<RangeSlot>,
    pub(crate) groups: Vec<Vec<RangeId>>,
    pub(crate) disk_states: Vec<PerDiskState>,
    /// Disks with work that were not put back on their queue; rescheduled
    /// round robin as buffers or threads free up.
    pub(crate) unscheduled_disks: VecDeque<DiskId>,
}

impl ReaderState {
    fn new(num_disks: usize) -> Self {
        Self {
            generation: 0,
            lifecycle: ReaderLifecycle::Inactive,
            status: None,
            file_system: Arc::new(LocalFileSystem),
            resource_pool: None,
            mem_limit: None,
            sync_reader: false,
            num_disks_with_ranges: 0,
            io_buffers_quota: 0,
            min_num_buffers: 0,
            num_used_buffers: 0,
            num_buffers_in_disk_threads: 0,
            num_buffers_in_reader: 0,
            num_remaining_ranges: 0,
            num_finished_ranges: 0,
            num_committed_ranges: 0,
            ready_buffers: VecDeque::new(),
            ranges: Vec::new(),
            groups: Vec::new(),
            disk_states: (0..num_disks).map(|_| PerDiskState::default()).collect(),
            unscheduled_disks: VecDeque::new(),
        }
    }

    /// Prepares a cached context for a new registration.
    pub(crate) fn reset(
        &mut self,
        file_system: Arc<dyn FileSystem>,
        resource_pool: Arc<ResourcePool>,
        mem_limit: Option<Arc<MemLimit>>,
        min_num_buffers: usize,
    ) {
        debug_assert_eq!(self.lifecycle, ReaderLifecycle::Inactive);
        debug_assert!(self.ready_buffers.is_empty());
        let num_disks = self.disk_states.len();
        let generation = self.generation + 1;
        *self = Self::new(num_disks);
        self.generation = generation;
        self.lifecycle = ReaderLifecycle::Active;
        self.file_system = file_system;
        self.resource_pool = Some(resource_pool);
        self.mem_limit = mem_limit;
        self.min_num_buffers = min_num_buffers;
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.lifecycle == ReaderLifecycle::Cancelled
    }

    /// The error to hand callers once the reader is cancelled.
    pub(crate) fn cancel_status(&self) -> IoMgrError {
        self.status.clone().unwrap_or(IoMgrError::Cancelled)
    }
}

/// Work handed from a reader to a disk thread: one range, its cursor and an
/// empty buffer to fill.
pub(crate) struct ScheduledRead {
    pub(crate) reader: Arc<ReaderContext>,
    pub(crate) range_id: RangeId,
    pub(crate) scan_range: Arc<ScanRange>,
    pub(crate) cursor: RangeCursor,
    pub(crate) buffer: IoBuffer,
    pub(crate) file_system: Arc<dyn FileSystem>,
}

enum StartRange {
    Started(RangeId),
    /// The disk was put on the unscheduled list.
    Declined,
    /// Nothing to start; fall back to continuing an in-flight range.
    Unavailable,
}

pub(crate) struct ReaderContext {
    slot: usize,
    min_queue_capacity: usize,
    max_queue_capacity: usize,
    pub(crate) state: Mutex<ReaderState>,
    /// Signalled when a buffer lands on the ready queue, on end of stream and
    /// on cancellation.
    pub(crate) buffer_ready: Condvar,
    /// Signalled when the last disk reference is released.
    pub(crate) disks_complete: Condvar,
    threads_in_read: Box<[AtomicUsize]>,
    num_ready_buffers: AtomicUsize,
    bytes_read: AtomicU64,
}

impl ReaderContext {
    pub(crate) fn new(
        slot: usize,
        num_disks: usize,
        min_queue_capacity: usize,
        max_queue_capacity: usize,
    ) -> Self {
        Self {
            slot,
            min_queue_capacity,
            max_queue_capacity,
            state: Mutex::new(ReaderState::new(num_disks)),
            buffer_ready: Condvar::new(),
            disks_complete: Condvar::new(),
            threads_in_read: (0..num_disks).map(|_| AtomicUsize::new(0)).collect(),
            num_ready_buffers: AtomicUsize::new(0),
            bytes_read: AtomicU64::new(0),
        }
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    pub(crate) fn min_queue_capacity(&self) -> usize {
        self.min_queue_capacity
    }

    /// Locks the state if `generation` is still the current registration.
    pub(crate) fn lock_checked(&self, generation: u64) -> IoMgrResult<MutexGuard<'_, ReaderState>> {
        let state = self.state.lock();
        if state.generation != generation || state.lifecycle == ReaderLifecycle::Inactive {
            return Err(IoMgrError::InvalidReader);
        }
        Ok(state)
    }

    pub(crate) fn threads_in_read(&self, disk_id: DiskId) -> usize {
        self.threads_in_read[disk_id].load(Ordering::Acquire)
    }

    pub(crate) fn increment_threads_in_read(&self, disk_id: DiskId) {
        self.threads_in_read[disk_id].fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the count after the decrement.
    pub(crate) fn decrement_threads_in_read(&self, disk_id: DiskId) -> usize {
        let prev = self.threads_in_read[disk_id].fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "thread count underflow on disk {}", disk_id);
        prev - 1
    }

    /// Length of the ready queue, readable without the reader lock.
    pub(crate) fn num_ready_buffers(&self) -> usize {
        self.num_ready_buffers.load(Ordering::Acquire)
    }

    pub(crate) fn sync_ready_count(&self, state: &ReaderState) {
        self.num_ready_buffers
            .store(state.ready_buffers.len(), Ordering::Release);
    }

    pub(crate) fn add_bytes_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub(crate) fn reset_bytes_read(&self) {
        self.bytes_read.store(0, Ordering::Relaxed);
    }

    /// Sets the buffer quota, clamped to the configured capacity bounds and
    /// never below the reader's minimum. Growing the quota puts that many
    /// unscheduled disks back on their queues.
    pub(crate) fn set_max_io_buffers(
        self: &Arc<Self>,
        state: &mut ReaderState,
        max_buffers: usize,
        disk_queues: &[DiskQueue],
    ) {
        if state.lifecycle != ReaderLifecycle::Active {
            return;
        }
        let quota = max_buffers
            .min(self.max_queue_capacity)
            .max(self.min_queue_capacity)
            .max(state.min_num_buffers);
        if quota == state.io_buffers_quota {
            return;
        }
        let added = quota.saturating_sub(state.io_buffers_quota);
        state.io_buffers_quota = quota;
        if added > 0 {
            self.schedule_new_disks(state, disk_queues, added);
        }
    }

    /// Moves up to `max_disks` disks from the unscheduled list back onto their
    /// disk queues, oldest first.
    pub(crate) fn schedule_new_disks(
        self: &Arc<Self>,
        state: &mut ReaderState,
        disk_queues: &[DiskQueue],
        max_disks: usize,
    ) {
        for _ in 0..max_disks {
            let Some(disk_id) = state.unscheduled_disks.pop_front() else {
                break;
            };
            disk_queues[disk_id].enqueue_reader(Arc::clone(self));
        }
    }

    fn enqueue_unscheduled_disk(&self, state: &mut ReaderState, disk_id: DiskId) {
        debug_assert!(state.disk_states[disk_id].committed_ranges.is_empty());
        debug_assert!(!state.unscheduled_disks.contains(&disk_id));
        state.unscheduled_disks.push_back(disk_id);
    }

    /// Releases one disk reference. Wakes an unregistering caller when the
    /// last one goes.
    pub(crate) fn decrement_disk_ref_count(&self, state: &mut ReaderState) {
        debug_assert!(state.num_disks_with_ranges > 0);
        state.num_disks_with_ranges -= 1;
        if state.num_disks_with_ranges == 0 {
            self.disks_complete.notify_all();
        }
    }

    /// Appends ranges to the range table and queues them on their disks.
    /// Disks that had no work take a disk reference and are scheduled.
    pub(crate) fn add_scan_ranges(
        self: &Arc<Self>,
        state: &mut ReaderState,
        ranges: Vec<(ScanRange, Option<GroupId>)>,
        disk_queues: &[DiskQueue],
    ) {
        debug_assert_eq!(state.lifecycle, ReaderLifecycle::Active);
        let mut num_new_disks = 0;
        for (range, group) in ranges {
            let disk_id = range.disk_id();
            let range_id = state.ranges.len();
            state.ranges.push(RangeSlot::new(range, group));
            if let Some(group_id) = group {
                state.groups[group_id].push(range_id);
            }

            if state.disk_states[disk_id].done {
                state.disk_states[disk_id].done = false;
                state.num_disks_with_ranges += 1;
                num_new_disks += 1;
                self.enqueue_unscheduled_disk(state, disk_id);
            }
            let disk_state = &mut state.disk_states[disk_id];
            disk_state.unscheduled_ranges.push_back(range_id);
            disk_state.num_remaining_ranges += 1;
            state.num_remaining_ranges += 1;
        }
        self.schedule_new_disks(state, disk_queues, num_new_disks);
    }

    /// Picks the next range to read on `disk_id` and hands out a buffer for it.
    ///
    /// In priority order:
    /// 1. a committed range on this disk,
    /// 2. nothing, if committed ranges elsewhere need the remaining quota,
    /// 3. nothing, if the quota is used up,
    /// 4. a new range, if its whole group fits in the quota and a thread
    ///    token is available,
    /// 5. the next in-flight range.
    ///
    /// # Returns
    /// `None` if this disk has nothing to read right now. The disk is then
    /// either released (no ranges left) or parked on the unscheduled list.
    pub(crate) fn get_scan_range(
        self: &Arc<Self>,
        state: &mut ReaderState,
        disk_id: DiskId,
        buffer_pool: &IoBufferPool,
        disk_queues: &[DiskQueue],
    ) -> Option<ScheduledRead> {
        debug_assert!(self.validate(state), "{}", self.debug_string(state));
        debug_assert_eq!(state.lifecycle, ReaderLifecycle::Active);

        if state.disk_states[disk_id].num_remaining_ranges == 0 {
            self.decrement_disk_ref_count(state);
            state.disk_states[disk_id].done = true;
            self.schedule_new_disks(state, disk_queues, 1);
            return None;
        }

        let buffers_remaining = state.io_buffers_quota as isize
            - state.num_used_buffers as isize
            - state.num_committed_ranges as isize;

        let range_id = if let Some(range_id) =
            state.disk_states[disk_id].committed_ranges.pop_front()
        {
            state.num_committed_ranges -= 1;
            range_id
        } else if state.num_committed_ranges as isize >= buffers_remaining {
            // Let a disk holding committed ranges use what quota is left.
            self.schedule_new_disks(state, disk_queues, 1);
            self.enqueue_unscheduled_disk(state, disk_id);
            return None;
        } else if state.num_used_buffers >= state.io_buffers_quota {
            self.enqueue_unscheduled_disk(state, disk_id);
            return None;
        } else {
            match self.start_unscheduled_range(state, disk_id, buffers_remaining, disk_queues) {
                StartRange::Started(range_id) => range_id,
                StartRange::Declined => return None,
                StartRange::Unavailable => {
                    match state.disk_states[disk_id].in_flight_ranges.pop_front() {
                        Some(range_id) => range_id,
                        None => {
                            self.schedule_new_disks(state, disk_queues, 1);
                            self.enqueue_unscheduled_disk(state, disk_id);
                            return None;
                        }
                    }
                }
            }
        };

        let (scan_range, cursor) = {
            let slot = &mut state.ranges[range_id];
            debug_assert!(matches!(
                slot.state,
                RangeState::Unscheduled | RangeState::Committed | RangeState::InFlight
            ));
            debug_assert!(slot.cursor.is_some());
            slot.state = RangeState::Reading;
            slot.num_io_buffers += 1;
            (Arc::clone(&slot.range), slot.cursor.take().unwrap_or_default())
        };
        let buffer = buffer_pool.get_free_buffer(state.mem_limit.as_deref());
        state.num_used_buffers += 1;
        state.num_buffers_in_disk_threads += 1;

        Some(ScheduledRead {
            reader: Arc::clone(self),
            range_id,
            scan_range,
            cursor,
            buffer,
            file_system: Arc::clone(&state.file_system),
        })
    }

    fn start_unscheduled_range(
        self: &Arc<Self>,
        state: &mut ReaderState,
        disk_id: DiskId,
        buffers_remaining: isize,
        disk_queues: &[DiskQueue],
    ) -> StartRange {
        let Some(&range_id) = state.disk_states[disk_id].unscheduled_ranges.front() else {
            return StartRange::Unavailable;
        };
        let group = state.ranges[range_id].group;
        if let Some(group_id) = group {
            // Starting a group commits every member, so the quota must fit
            // all of them.
            if buffers_remaining < state.groups[group_id].len() as isize {
                self.schedule_new_disks(state, disk_queues, 1);
                self.enqueue_unscheduled_disk(state, disk_id);
                return StartRange::Declined;
            }
        }

        let token_acquired = state
            .resource_pool
            .as_ref()
            .is_none_or(|pool| pool.try_acquire_thread_token());
        if !token_acquired {
            return StartRange::Unavailable;
        }

        state.disk_states[disk_id].unscheduled_ranges.pop_front();
        if let Some(group_id) = group {
            self.commit_group(state, group_id, range_id);
            // Any parked disk may now hold a committed sibling.
            let num_disks = state.disk_states.len();
            self.schedule_new_disks(state, disk_queues, num_disks);
        }
        StartRange::Started(range_id)
    }

    /// Accounts for one buffer of `range_id` leaving the ready queue.
    ///
    /// A grouped range with no buffer queued or being read moves from
    /// in-flight to committed, so its next read goes ahead of new work.
    pub(crate) fn range_buffer_delivered(&self, state: &mut ReaderState, range_id: RangeId, eosr: bool) {
        let slot = &mut state.ranges[range_id];
        slot.num_io_buffers -= 1;
        if slot.group.is_none() || eosr || slot.num_io_buffers > 0 {
            return;
        }
        debug_assert_eq!(slot.state, RangeState::InFlight);
        slot.state = RangeState::Committed;
        let disk_id = slot.disk_id();
        let disk_state = &mut state.disk_states[disk_id];
        if let Some(pos) = disk_state.in_flight_ranges.iter().position(|&id| id == range_id) {
            disk_state.in_flight_ranges.remove(pos);
        }
        disk_state.committed_ranges.push_back(range_id);
        state.num_committed_ranges += 1;
    }

    /// Moves every member of `group_id` other than `started` from its disk's
    /// unscheduled queue to the committed queue.
    fn commit_group(&self, state: &mut ReaderState, group_id: GroupId, started: RangeId) {
        let members = state.groups[group_id].clone();
        for range_id in members.into_iter().filter(|&id| id != started) {
            debug_assert_eq!(state.ranges[range_id].state, RangeState::Unscheduled);
            let disk_id = state.ranges[range_id].disk_id();
            let disk_state = &mut state.disk_states[disk_id];
            if let Some(pos) = disk_state
                .unscheduled_ranges
                .iter()
                .position(|&id| id == range_id)
            {
                disk_state.unscheduled_ranges.remove(pos);
            }
            disk_state.committed_ranges.push_back(range_id);
            state.ranges[range_id].state = RangeState::Committed;
            state.num_committed_ranges += 1;
        }
    }

    /// Checks the reader's bookkeeping. Logs every violation found.
    pub(crate) fn validate(&self, state: &ReaderState) -> bool {
        let mut valid = true;
        let mut fail = |msg: String| {
            error!("Reader {} invalid: {}", self.slot, msg);
            valid = false;
        };

        if state.lifecycle == ReaderLifecycle::Inactive {
            fail("reader is inactive".to_string());
            return false;
        }
        let active = state.lifecycle == ReaderLifecycle::Active;

        let mut num_committed = 0;
        let mut num_busy_disks = 0;
        for (disk_id, disk_state) in state.disk_states.iter().enumerate() {
            let queued = disk_state.unscheduled_ranges.len()
                + disk_state.in_flight_ranges.len()
                + disk_state.committed_ranges.len();
            if disk_state.done {
                if self.threads_in_read(disk_id) > 0 {
                    fail(format!("disk {} is done with threads still reading", disk_id));
                }
                if active && queued > 0 {
                    fail(format!("disk {} is done with {} ranges queued", disk_id, queued));
                }
            } else {
                num_busy_disks += 1;
            }
            if active && queued > disk_state.num_remaining_ranges {
                fail(format!(
                    "disk {} has {} queued ranges but only {} remaining",
                    disk_id, queued, disk_state.num_remaining_ranges
                ));
            }

            let queues = [
                (&disk_state.unscheduled_ranges, RangeState::Unscheduled),
                (&disk_state.in_flight_ranges, RangeState::InFlight),
                (&disk_state.committed_ranges, RangeState::Committed),
            ];
            for (queue, expected) in queues {
                for &range_id in queue {
                    let slot = &state.ranges[range_id];
                    if slot.state != expected || slot.disk_id() != disk_id {
                        fail(format!(
                            "range {} queued as {:?} on disk {} but tagged {:?} on disk {}",
                            range_id,
                            expected,
                            disk_id,
                            slot.state,
                            slot.disk_id()
                        ));
                    }
                }
            }
            num_committed += disk_state.committed_ranges.len();
        }

        if num_busy_disks != state.num_disks_with_ranges {
            fail(format!(
                "{} disks hold ranges but num_disks_with_ranges is {}",
                num_busy_disks, state.num_disks_with_ranges
            ));
        }
        if num_committed != state.num_committed_ranges {
            fail(format!(
                "{} committed ranges queued but {} counted",
                num_committed, state.num_committed_ranges
            ));
        }

        let num_ok_ready = state.ready_buffers.iter().filter(|b| b.is_ok()).count();
        if state.num_buffers_in_disk_threads + num_ok_ready != state.num_used_buffers {
            fail(format!(
                "used buffers {} != in disk threads {} + ready {}",
                state.num_used_buffers, state.num_buffers_in_disk_threads, num_ok_ready
            ));
        }
        if self.num_ready_buffers() != state.ready_buffers.len() {
            fail(format!(
                "ready buffer counter {} != queue length {}",
                self.num_ready_buffers(),
                state.ready_buffers.len()
            ));
        }
        if active && state.io_buffers_quota < state.min_num_buffers {
            fail(format!(
                "quota {} below minimum {}",
                state.io_buffers_quota, state.min_num_buffers
            ));
        }
        if active && state.num_remaining_ranges == 0 && !state.ready_buffers.is_empty() {
            fail("no remaining ranges but buffers are ready".to_string());
        }

        if active {
            for (group_id, members) in state.groups.iter().enumerate() {
                let started = members
                    .iter()
                    .any(|&id| state.ranges[id].state != RangeState::Unscheduled);
                for &range_id in members {
                    let slot = &state.ranges[range_id];
                    if started && slot.state == RangeState::Unscheduled {
                        fail(format!(
                            "group {} started but range {} is unscheduled",
                            group_id, range_id
                        ));
                    }
                    if slot.state == RangeState::InFlight && slot.num_io_buffers == 0 {
                        fail(format!(
                            "grouped range {} in flight with no queued buffers",
                            range_id
                        ));
                    }
                }
            }
        }

        valid
    }

    pub(crate) fn debug_string(&self, state: &ReaderState) -> String {
        let mut out = String::new();
        let _ = write!(
            out,
            "  Reader: {} (state={:?} sync={} status={} #ready_buffers={} #used_buffers={} \
             #num_buffers_in_reader={} #finished_scan_ranges={} #disk_with_ranges={} \
             #disks={} #committed={} quota={} min_buffers={})",
            self.slot,
            state.lifecycle,
            state.sync_reader,
            state
                .status
                .as_ref()
                .map_or_else(|| "ok".to_string(), ToString::to_string),
            state.ready_buffers.len(),
            state.num_used_buffers,
            state.num_buffers_in_reader,
            state.num_finished_ranges,
            state.num_disks_with_ranges,
            state.disk_states.len(),
            state.num_committed_ranges,
            state.io_buffers_quota,
            state.min_num_buffers,
        );
        for (disk_id, disk_state) in state.disk_states.iter().enumerate() {
            let _ = write!(
                out,
                "\n    {}: done={} #threads_in_read={} #remaining={} #unscheduled={} \
                 #in_flight={} #committed={}",
                disk_id,
                disk_state.done,
                self.threads_in_read(disk_id),
                disk_state.num_remaining_ranges,
                disk_state.unscheduled_ranges.len(),
                disk_state.in_flight_ranges.len(),
                disk_state.committed_ranges.len(),
            );
        }
        out
    }
}
