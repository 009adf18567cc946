use std::collections::VecDeque;
use std::fmt::Write;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::common::exception::{IoMgrError, IoMgrResult};
use crate::storage::disk::reader_context::{ReaderContext, ReaderLifecycle, ReaderState};

/// Identifies one registration of a reader.
///
/// Slots are recycled, so the handle also carries the registration's
/// generation. Using a handle after its reader was unregistered fails with
/// [`IoMgrError::InvalidReader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReaderHandle {
    slot: usize,
    generation: u64,
}

impl ReaderHandle {
    pub(crate) fn new(slot: usize, generation: u64) -> Self {
        Self { slot, generation }
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Default)]
struct CacheSlots {
    all_readers: Vec<Arc<ReaderContext>>,
    inactive_readers: VecDeque<usize>,
}

/// Arena of reader contexts. Contexts are created on demand and reused after
/// unregistration; they are never freed while the manager lives.
pub(crate) struct ReaderCache {
    num_disks: usize,
    min_queue_capacity: usize,
    max_queue_capacity: usize,
    slots: Mutex<CacheSlots>,
}

impl ReaderCache {
    pub(crate) fn new(num_disks: usize, min_queue_capacity: usize, max_queue_capacity: usize) -> Self {
        Self {
            num_disks,
            min_queue_capacity,
            max_queue_capacity,
            slots: Mutex::new(CacheSlots::default()),
        }
    }

    /// Returns an inactive context, creating one if none is cached. The caller
    /// must reset it before use.
    pub(crate) fn get_new_reader(&self) -> Arc<ReaderContext> {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.inactive_readers.pop_front() {
            return Arc::clone(&slots.all_readers[slot]);
        }
        let slot = slots.all_readers.len();
        let reader = Arc::new(ReaderContext::new(
            slot,
            self.num_disks,
            self.min_queue_capacity,
            self.max_queue_capacity,
        ));
        slots.all_readers.push(Arc::clone(&reader));
        debug!("Allocated reader context in slot {}", slot);
        reader
    }

    /// Marks a context inactive and makes its slot available again.
    ///
    /// `state` is the context's own locked state. Only the caller that moves
    /// the context out of a registered lifecycle gets to recycle the slot, so
    /// a slot is never queued twice.
    pub(crate) fn return_reader(&self, reader: &ReaderContext, state: &mut ReaderState) {
        debug_assert_ne!(state.lifecycle, ReaderLifecycle::Inactive);
        state.lifecycle = ReaderLifecycle::Inactive;
        let mut slots = self.slots.lock();
        debug_assert!(!slots.inactive_readers.contains(&reader.slot()));
        slots.inactive_readers.push_back(reader.slot());
    }

    /// Looks up the context behind a handle. The generation is checked when
    /// the caller locks the context.
    pub(crate) fn get(&self, handle: ReaderHandle) -> IoMgrResult<Arc<ReaderContext>> {
        self.slots
            .lock()
            .all_readers
            .get(handle.slot())
            .cloned()
            .ok_or(IoMgrError::InvalidReader)
    }

    pub(crate) fn all_readers(&self) -> Vec<Arc<ReaderContext>> {
        self.slots.lock().all_readers.clone()
    }

    pub(crate) fn num_readers(&self) -> usize {
        self.slots.lock().all_readers.len()
    }

    pub(crate) fn num_inactive_readers(&self) -> usize {
        self.slots.lock().inactive_readers.len()
    }

    /// True if no reader is registered.
    pub(crate) fn validate_all_inactive(&self) -> bool {
        self.all_readers()
            .iter()
            .all(|reader| reader.state.lock().lifecycle == ReaderLifecycle::Inactive)
    }

    pub(crate) fn debug_string(&self) -> String {
        let mut out = String::from("Readers:");
        for reader in self.all_readers() {
            let state = reader.state.lock();
            if state.lifecycle != ReaderLifecycle::Inactive {
                let _ = write!(out, "\n{}", reader.debug_string(&state));
            }
        }
        out
    }
}
