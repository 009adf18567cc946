//! Pool of fixed-size I/O buffers shared by every reader of a disk I/O manager.
//!
//! Buffers are recycled through a free list rather than handed back to the
//! allocator. The process memory limit is charged once per allocation and
//! released only when [`IoBufferPool::gc_buffers`] drops the free list. A
//! reader's memory limit is charged each time one of its reads takes a buffer
//! and released when the buffer comes back.

use std::sync::Arc;

use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::common::mem_limit::MemLimit;

/// Owned storage for one I/O buffer.
pub type IoBuffer = Box<[u8]>;

#[derive(Debug, Default)]
struct FreeList {
    buffers: Vec<IoBuffer>,
    num_allocated: usize,
}

#[derive(Debug)]
pub struct IoBufferPool {
    buffer_size: usize,
    free_list: Mutex<FreeList>,
    process_mem_limit: RwLock<Option<Arc<MemLimit>>>,
}

impl IoBufferPool {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            free_list: Mutex::new(FreeList::default()),
            process_mem_limit: RwLock::new(None),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn set_process_mem_limit(&self, limit: Option<Arc<MemLimit>>) {
        *self.process_mem_limit.write() = limit;
    }

    pub fn process_limit_exceeded(&self) -> bool {
        self.process_mem_limit
            .read()
            .as_ref()
            .is_some_and(|limit| limit.limit_exceeded())
    }

    /// Takes a buffer off the free list, allocating a new one if the list is
    /// empty.
    ///
    /// # Parameters
    /// - `reader_limit`: memory limit of the reader the buffer is read for, if any.
    ///
    /// # Returns
    /// A buffer of exactly `buffer_size` bytes. Its contents are unspecified.
    pub fn get_free_buffer(&self, reader_limit: Option<&MemLimit>) -> IoBuffer {
        let recycled = {
            let mut free_list = self.free_list.lock();
            let buffer = free_list.buffers.pop();
            if buffer.is_none() {
                free_list.num_allocated += 1;
            }
            buffer
        };
        let buffer = match recycled {
            Some(buffer) => buffer,
            None => {
                if let Some(limit) = self.process_mem_limit.read().as_ref() {
                    limit.consume(self.buffer_size as i64);
                }
                vec![0u8; self.buffer_size].into_boxed_slice()
            }
        };
        if let Some(limit) = reader_limit {
            limit.consume(self.buffer_size as i64);
        }
        buffer
    }

    /// Puts a buffer back on the free list and releases it from the reader's
    /// memory limit.
    pub fn return_free_buffer(&self, reader_limit: Option<&MemLimit>, buffer: IoBuffer) {
        debug_assert_eq!(buffer.len(), self.buffer_size);
        if let Some(limit) = reader_limit {
            limit.release(self.buffer_size as i64);
        }
        let mut free_list = self.free_list.lock();
        free_list.buffers.push(buffer);
        debug_assert!(free_list.buffers.len() <= free_list.num_allocated);
    }

    /// Frees every buffer on the free list and releases them from the process
    /// memory limit.
    ///
    /// # Returns
    /// The number of buffers freed.
    pub fn gc_buffers(&self) -> usize {
        let freed = {
            let mut free_list = self.free_list.lock();
            let freed = std::mem::take(&mut free_list.buffers);
            free_list.num_allocated -= freed.len();
            freed
        };
        if freed.is_empty() {
            return 0;
        }
        if let Some(limit) = self.process_mem_limit.read().as_ref() {
            limit.release((freed.len() * self.buffer_size) as i64);
        }
        debug!("Garbage collected {} io buffers", freed.len());
        freed.len()
    }

    pub fn num_allocated_buffers(&self) -> usize {
        self.free_list.lock().num_allocated
    }

    pub fn num_free_buffers(&self) -> usize {
        self.free_list.lock().buffers.len()
    }

    /// Buffers currently checked out of the pool.
    pub fn num_outstanding_buffers(&self) -> usize {
        let free_list = self.free_list.lock();
        free_list.num_allocated - free_list.buffers.len()
    }
}
