//! Scanner thread accounting.
//!
//! A [`ThreadResourceMgr`] owns the process-wide thread quota and divides it
//! evenly between registered [`ResourcePool`]s. Each pool hands out thread
//! tokens to the work that runs on its behalf. The disk I/O manager asks for a
//! token before starting a new scan range, so the number of ranges a reader
//! has open at once is bounded by the threads available to consume them.
//!
//! # Core Responsibilities
//! - Fair division of the system quota between pools
//! - Required and optional token acquisition
//! - Notifying a pool's owner when a token becomes available

use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

/// Invoked with the pool whenever one of its tokens may have become free.
pub type ThreadAvailableCb = Arc<dyn Fn(&ResourcePool) + Send + Sync>;

#[derive(Debug, Default)]
struct TokenState {
    num_threads: usize,
    num_reserved_optional: usize,
    quota: usize,
}

impl TokenState {
    /// Optional reservations let a pool run at least that many threads even
    /// when its fair share is smaller.
    fn effective_quota(&self) -> usize {
        self.quota.max(self.num_reserved_optional)
    }
}

pub struct ResourcePool {
    tokens: Mutex<TokenState>,
    thread_available_cb: Mutex<Option<ThreadAvailableCb>>,
}

impl ResourcePool {
    fn new() -> Self {
        Self {
            tokens: Mutex::new(TokenState::default()),
            thread_available_cb: Mutex::new(None),
        }
    }

    /// Acquires a token regardless of quota. Used by threads that must run.
    pub fn acquire_thread_token(&self) {
        self.tokens.lock().num_threads += 1;
    }

    /// Acquires a token only if the pool is under its quota.
    pub fn try_acquire_thread_token(&self) -> bool {
        let mut tokens = self.tokens.lock();
        if tokens.num_threads >= tokens.effective_quota() {
            return false;
        }
        tokens.num_threads += 1;
        true
    }

    /// Returns a token and notifies the pool's owner.
    pub fn release_thread_token(&self) {
        {
            let mut tokens = self.tokens.lock();
            debug_assert!(tokens.num_threads > 0, "released a token that was never acquired");
            tokens.num_threads = tokens.num_threads.saturating_sub(1);
        }
        self.notify_thread_available();
    }

    pub fn reserve_optional_tokens(&self, num: usize) {
        self.tokens.lock().num_reserved_optional = num;
    }

    pub fn num_threads(&self) -> usize {
        self.tokens.lock().num_threads
    }

    pub fn quota(&self) -> usize {
        self.tokens.lock().effective_quota()
    }

    pub fn num_available_threads(&self) -> usize {
        let tokens = self.tokens.lock();
        tokens.effective_quota().saturating_sub(tokens.num_threads)
    }

    /// Installs or clears the availability callback.
    ///
    /// A notification already in progress cloned the old callback before
    /// releasing the lock, so it may still run once after this returns.
    /// Callbacks must tolerate a reader that has since gone away.
    pub fn set_thread_available_cb(&self, cb: Option<ThreadAvailableCb>) {
        *self.thread_available_cb.lock() = cb;
    }

    /// Sets the fair-share quota. Returns true if the quota grew.
    fn set_quota(&self, quota: usize) -> bool {
        let mut tokens = self.tokens.lock();
        let grew = quota > tokens.quota;
        tokens.quota = quota;
        grew
    }

    fn notify_thread_available(&self) {
        // Clone the callback out so it runs without the callback lock held.
        let cb = self.thread_available_cb.lock().clone();
        if let Some(cb) = cb {
            if self.num_available_threads() > 0 {
                cb(self);
            }
        }
    }
}

pub struct ThreadResourceMgr {
    system_threads_quota: usize,
    pools: Mutex<Vec<Arc<ResourcePool>>>,
}

impl ThreadResourceMgr {
    /// Creates a manager with `threads_quota` threads to share. Zero uses the
    /// number of logical CPUs.
    pub fn new(threads_quota: usize) -> Self {
        let system_threads_quota = if threads_quota == 0 {
            num_cpus::get()
        } else {
            threads_quota
        };
        debug!(
            "Thread resource manager created with quota {}",
            system_threads_quota
        );
        Self {
            system_threads_quota,
            pools: Mutex::new(Vec::new()),
        }
    }

    pub fn system_threads_quota(&self) -> usize {
        self.system_threads_quota
    }

    pub fn register_pool(&self) -> Arc<ResourcePool> {
        let pool = Arc::new(ResourcePool::new());
        let grown = {
            let mut pools = self.pools.lock();
            pools.push(Arc::clone(&pool));
            self.update_pool_quotas(&pools)
        };
        Self::notify_pools(grown);
        pool
    }

    pub fn unregister_pool(&self, pool: &Arc<ResourcePool>) {
        let grown = {
            let mut pools = self.pools.lock();
            pools.retain(|p| !Arc::ptr_eq(p, pool));
            self.update_pool_quotas(&pools)
        };
        Self::notify_pools(grown);
    }

    pub fn num_pools(&self) -> usize {
        self.pools.lock().len()
    }

    fn update_pool_quotas(&self, pools: &[Arc<ResourcePool>]) -> Vec<Arc<ResourcePool>> {
        if pools.is_empty() {
            return Vec::new();
        }
        let quota = (self.system_threads_quota / pools.len()).max(1);
        pools
            .iter()
            .filter(|pool| pool.set_quota(quota))
            .cloned()
            .collect()
    }

    fn notify_pools(pools: Vec<Arc<ResourcePool>>) {
        for pool in pools {
            pool.notify_thread_available();
        }
    }
}
