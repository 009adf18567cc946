use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::common::config::DiskId;
use crate::storage::disk::reader_context::ReaderContext;

/// FIFO of readers with work on one disk, served by that disk's threads.
///
/// A reader appears at most once. Whether a reader is "on the queue" is
/// answered from the queue itself under its lock, so the fact cannot drift
/// from the queue contents.
pub(crate) struct DiskQueue {
    disk_id: DiskId,
    readers: Mutex<VecDeque<Arc<ReaderContext>>>,
    work_available: Condvar,
}

impl DiskQueue {
    pub(crate) fn new(disk_id: DiskId) -> Self {
        Self {
            disk_id,
            readers: Mutex::new(VecDeque::new()),
            work_available: Condvar::new(),
        }
    }

    pub(crate) fn disk_id(&self) -> DiskId {
        self.disk_id
    }

    /// Appends a reader and wakes one disk thread.
    pub(crate) fn enqueue_reader(&self, reader: Arc<ReaderContext>) {
        {
            let mut readers = self.readers.lock();
            debug_assert!(
                !readers.iter().any(|r| Arc::ptr_eq(r, &reader)),
                "reader queued twice on disk {}",
                self.disk_id
            );
            readers.push_back(reader);
        }
        self.work_available.notify_one();
    }

    /// Blocks until a reader is queued or `shut_down` is set.
    ///
    /// The popped reader's read-thread count for this disk is incremented
    /// before the disk lock is released, so a reader is never seen as both
    /// off the queue and idle while a thread is about to work on it.
    pub(crate) fn wait_for_reader(&self, shut_down: &AtomicBool) -> Option<Arc<ReaderContext>> {
        let mut readers = self.readers.lock();
        loop {
            if shut_down.load(Ordering::Acquire) {
                return None;
            }
            if let Some(reader) = readers.pop_front() {
                reader.increment_threads_in_read(self.disk_id);
                return Some(reader);
            }
            self.work_available.wait(&mut readers);
        }
    }

    /// True if no thread is reading for `reader` on this disk and the reader
    /// is not waiting on this queue.
    pub(crate) fn is_idle_for(&self, reader: &Arc<ReaderContext>) -> bool {
        let readers = self.readers.lock();
        reader.threads_in_read(self.disk_id) == 0
            && !readers.iter().any(|r| Arc::ptr_eq(r, reader))
    }

    pub(crate) fn len(&self) -> usize {
        self.readers.lock().len()
    }

    /// Wakes every thread so it can observe the shutdown flag.
    pub(crate) fn wake_all(&self) {
        let _readers = self.readers.lock();
        self.work_available.notify_all();
    }

    pub(crate) fn drain(&self) -> Vec<Arc<ReaderContext>> {
        self.readers.lock().drain(..).collect()
    }
}
