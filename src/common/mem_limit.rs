use std::sync::atomic::{AtomicI64, Ordering};

/// Tracks bytes consumed against a fixed limit.
///
/// Consumption is updated with atomics so buffer allocation paths can charge
/// and release without taking a lock. A negative limit means "unlimited".
#[derive(Debug)]
pub struct MemLimit {
    limit: i64,
    consumption: AtomicI64,
}

impl MemLimit {
    pub fn new(limit: i64) -> Self {
        Self {
            limit,
            consumption: AtomicI64::new(0),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(-1)
    }

    pub fn consume(&self, bytes: i64) {
        self.consumption.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn release(&self, bytes: i64) {
        let prev = self.consumption.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes, "released more memory than was consumed");
    }

    pub fn limit_exceeded(&self) -> bool {
        self.limit >= 0 && self.limit < self.consumption()
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    pub fn consumption(&self) -> i64 {
        self.consumption.load(Ordering::Acquire)
    }
}
