//! Priority-arbitrated admission to fixed memory budgets.
//!
//! Four named pools, each with a byte budget and two priority levels.
//! Requests are served FIFO within a priority, high before normal. A request
//! larger than the whole budget is admitted alone, once the pool is idle.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::{
    REGISTRY_MEMORY_BUDGET, REPAIR_MEMORY_BUDGET, USER_DOWNLOAD_MEMORY_BUDGET,
    USER_UPLOAD_MEMORY_BUDGET,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryPriority {
    Normal,
    High,
}

/// Pool classes, each with an independent budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryClass {
    Registry,
    UserUpload,
    UserDownload,
    Repair,
}

struct Waiter {
    id: u64,
    bytes: u64,
    tx: oneshot::Sender<()>,
}

struct PoolState {
    available: u64,
    next_waiter_id: u64,
    high: VecDeque<Waiter>,
    normal: VecDeque<Waiter>,
}

pub struct MemoryPool {
    name: &'static str,
    budget: u64,
    state: Mutex<PoolState>,
}

impl MemoryPool {
    fn new(name: &'static str, budget: u64) -> Arc<Self> {
        Arc::new(Self {
            name,
            budget,
            state: Mutex::new(PoolState {
                available: budget,
                next_waiter_id: 0,
                high: VecDeque::new(),
                normal: VecDeque::new(),
            }),
        })
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn budget(&self) -> u64 {
        self.budget
    }

    #[must_use]
    pub fn available(&self) -> u64 {
        self.state.lock().available
    }

    /// True if `bytes` can be granted right now given the pool state.
    /// Oversized requests are admitted only against a completely idle pool.
    fn fits(&self, state: &PoolState, bytes: u64) -> bool {
        if bytes > self.budget {
            return state.available == self.budget;
        }
        bytes <= state.available
    }

    fn grant(&self, state: &mut PoolState, bytes: u64) {
        state.available = state.available.saturating_sub(bytes);
    }

    /// Block until `bytes` can be reserved or the token is cancelled.
    /// Returns `None` on cancellation; the reservation is released via the
    /// returned guard's `Drop`.
    pub async fn request(
        self: &Arc<Self>,
        bytes: u64,
        priority: MemoryPriority,
        cancel: &CancellationToken,
    ) -> Option<MemoryGrant> {
        if bytes == 0 {
            return Some(MemoryGrant {
                pool: self.clone(),
                bytes: 0,
            });
        }
        let (rx, id) = {
            let mut state = self.state.lock();
            let queue_empty = match priority {
                MemoryPriority::High => state.high.is_empty(),
                MemoryPriority::Normal => state.high.is_empty() && state.normal.is_empty(),
            };
            if queue_empty && self.fits(&state, bytes) {
                self.grant(&mut state, bytes);
                return Some(MemoryGrant {
                    pool: self.clone(),
                    bytes,
                });
            }
            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            let waiter = Waiter { id, bytes, tx };
            match priority {
                MemoryPriority::High => state.high.push_back(waiter),
                MemoryPriority::Normal => state.normal.push_back(waiter),
            }
            (rx, id)
        };

        tokio::select! {
            res = rx => match res {
                Ok(()) => Some(MemoryGrant { pool: self.clone(), bytes }),
                // Pool dropped the waiter; treat as cancellation.
                Err(_) => None,
            },
            _ = cancel.cancelled() => {
                self.remove_waiter(id, bytes);
                None
            }
        }
    }

    /// Remove a cancelled waiter. If the grant already fired, the memory is
    /// returned instead.
    fn remove_waiter(&self, id: u64, bytes: u64) {
        let mut state = self.state.lock();
        let before = state.high.len() + state.normal.len();
        state.high.retain(|w| w.id != id);
        state.normal.retain(|w| w.id != id);
        if state.high.len() + state.normal.len() == before {
            // Already granted between cancellation and cleanup.
            state.available = (state.available + bytes).min(self.budget);
            self.wake_waiters(&mut state);
        }
    }

    fn return_bytes(&self, bytes: u64) {
        let mut state = self.state.lock();
        state.available = (state.available + bytes).min(self.budget);
        self.wake_waiters(&mut state);
    }

    /// Grant queued requests in FIFO order, high priority first, stopping at
    /// the first request that does not fit.
    fn wake_waiters(&self, state: &mut PoolState) {
        loop {
            let queue = if !state.high.is_empty() {
                &mut state.high
            } else if !state.normal.is_empty() {
                &mut state.normal
            } else {
                return;
            };
            let bytes = queue.front().map(|w| w.bytes).unwrap_or(0);
            let fits = if bytes > self.budget {
                state.available == self.budget
            } else {
                bytes <= state.available
            };
            if !fits {
                return;
            }
            let waiter = queue.pop_front().expect("front checked above");
            state.available = state.available.saturating_sub(waiter.bytes);
            if waiter.tx.send(()).is_err() {
                // Receiver went away before the grant landed.
                state.available = (state.available + waiter.bytes).min(self.budget);
            }
        }
    }
}

/// RAII reservation; returns the bytes to the pool on drop.
pub struct MemoryGrant {
    pool: Arc<MemoryPool>,
    bytes: u64,
}

impl MemoryGrant {
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for MemoryGrant {
    fn drop(&mut self) {
        if self.bytes > 0 {
            self.pool.return_bytes(self.bytes);
        }
    }
}

/// The four pools.
pub struct MemoryManager {
    registry: Arc<MemoryPool>,
    user_upload: Arc<MemoryPool>,
    user_download: Arc<MemoryPool>,
    repair: Arc<MemoryPool>,
}

impl MemoryManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: MemoryPool::new("registry", REGISTRY_MEMORY_BUDGET),
            user_upload: MemoryPool::new("user-upload", USER_UPLOAD_MEMORY_BUDGET),
            user_download: MemoryPool::new("user-download", USER_DOWNLOAD_MEMORY_BUDGET),
            repair: MemoryPool::new("repair", REPAIR_MEMORY_BUDGET),
        }
    }

    #[must_use]
    pub fn pool(&self, class: MemoryClass) -> &Arc<MemoryPool> {
        match class {
            MemoryClass::Registry => &self.registry,
            MemoryClass::UserUpload => &self.user_upload,
            MemoryClass::UserDownload => &self.user_download,
            MemoryClass::Repair => &self.repair,
        }
    }
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new()
    }
}
