//! Bounded buffer pools.
//!
//! A [`BufferPool`] hands out fixed-size [`Buffer`]s and recycles their
//! storage when they drop. Pools have a configure/activate lifecycle:
//! configuration is only mutable while the pool is inactive with no
//! buffers outstanding, activation preallocates the configured minimum
//! all-or-nothing, and deactivation flushes waiters immediately while
//! outstanding buffers drain back lazily.
//!
//! Exhaustion discipline: at the configured maximum, `acquire` blocks
//! until a release, or fails with [`FlowError::Flushing`] right away when
//! the caller asks not to wait. A flushing or inactive pool always fails
//! acquisition with `Flushing`.
//!
//! # Example
//!
//! ```rust
//! use sluice::pool::{AcquireParams, BufferPool, PoolConfig};
//!
//! let pool = BufferPool::new("frames");
//! pool.set_config(PoolConfig { buffer_size: 4096, min_buffers: 2, max_buffers: 8 })?;
//! pool.set_active(true)?;
//!
//! let buf = pool.acquire(AcquireParams::default()).unwrap();
//! assert_eq!(buf.len(), 4096);
//! drop(buf); // storage returns to the pool
//! # Ok::<(), sluice::Error>(())
//! ```

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tracing::{debug, error, warn};

use crate::buffer::Buffer;
use crate::clock::ClockTime;
use crate::flow::FlowError;
use crate::{Error, Result};

// ============================================================================
// Configuration
// ============================================================================

/// Pool sizing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Size in bytes of every buffer the pool hands out.
    pub buffer_size: usize,
    /// Buffers preallocated on activation.
    pub min_buffers: usize,
    /// Upper bound on buffers in existence; 0 means unbounded.
    pub max_buffers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: 4096,
            min_buffers: 0,
            max_buffers: 0,
        }
    }
}

impl PoolConfig {
    fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::InvalidConfig("buffer_size must be non-zero".into()));
        }
        if self.max_buffers != 0 && self.min_buffers > self.max_buffers {
            return Err(Error::InvalidConfig(format!(
                "min_buffers {} exceeds max_buffers {}",
                self.min_buffers, self.max_buffers
            )));
        }
        Ok(())
    }
}

/// Options for one acquisition.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcquireParams {
    /// Fail with `Flushing` instead of blocking when the pool is at its
    /// maximum.
    pub dont_wait: bool,
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    /// Buffers handed out over the pool's lifetime.
    pub acquired: u64,
    /// Times an acquire had to block.
    pub waits: u64,
    /// Buffers currently held by consumers.
    pub outstanding: usize,
    /// Buffers sitting in the free list.
    pub free: usize,
    /// Buffers in existence (free + outstanding).
    pub allocated: usize,
}

// ============================================================================
// Allocator
// ============================================================================

/// Provides backing storage for pool buffers.
pub trait Allocator: Send + Sync {
    /// Allocate zero-initialized storage of `size` bytes.
    fn alloc(&self, size: usize) -> Result<BytesMut>;
}

/// Plain heap allocator.
#[derive(Debug, Default)]
pub struct HeapAllocator;

impl Allocator for HeapAllocator {
    fn alloc(&self, size: usize) -> Result<BytesMut> {
        let mut data = BytesMut::with_capacity(size);
        data.resize(size, 0);
        Ok(data)
    }
}

// ============================================================================
// BufferPool
// ============================================================================

struct PoolState {
    config: PoolConfig,
    active: bool,
    flushing: bool,
    free: Vec<BytesMut>,
    /// Buffers in existence: free list plus outstanding.
    allocated: usize,
    outstanding: usize,
    acquired: u64,
    waits: u64,
}

pub(crate) struct PoolInner {
    name: String,
    allocator: Arc<dyn Allocator>,
    state: Mutex<PoolState>,
    /// Signaled when a buffer returns or the pool starts flushing.
    available: Condvar,
    /// Signaled when `outstanding` reaches zero.
    drained: Condvar,
}

/// A pool of fixed-size reusable buffers. Handles are cheap clones
/// sharing one pool.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create an inactive pool with the default config and heap storage.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_allocator(name, Arc::new(HeapAllocator))
    }

    /// Create an inactive pool with custom backing storage.
    pub fn with_allocator(name: impl Into<String>, allocator: Arc<dyn Allocator>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                allocator,
                state: Mutex::new(PoolState {
                    config: PoolConfig::default(),
                    active: false,
                    flushing: false,
                    free: Vec::new(),
                    allocated: 0,
                    outstanding: 0,
                    acquired: 0,
                    waits: 0,
                }),
                available: Condvar::new(),
                drained: Condvar::new(),
            }),
        }
    }

    /// The pool's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current configuration.
    pub fn config(&self) -> PoolConfig {
        self.inner.state.lock().unwrap().config
    }

    /// Replace the configuration.
    ///
    /// Only permitted while the pool is inactive and fully drained.
    pub fn set_config(&self, config: PoolConfig) -> Result<()> {
        config.validate()?;
        let mut state = self.inner.state.lock().unwrap();
        if state.active {
            return Err(Error::InvalidState(format!(
                "pool {} is active; deactivate before reconfiguring",
                self.inner.name
            )));
        }
        if state.outstanding > 0 {
            return Err(Error::InvalidState(format!(
                "pool {} has {} outstanding buffers",
                self.inner.name, state.outstanding
            )));
        }
        state.config = config;
        Ok(())
    }

    /// Whether the pool is active.
    pub fn is_active(&self) -> bool {
        self.inner.state.lock().unwrap().active
    }

    /// Whether the pool is refusing acquisitions.
    pub fn is_flushing(&self) -> bool {
        let state = self.inner.state.lock().unwrap();
        state.flushing || !state.active
    }

    /// Activate or deactivate the pool.
    ///
    /// Activation preallocates `min_buffers`; if any allocation fails the
    /// whole activation rolls back and the pool stays inactive.
    /// Deactivation drops the free list at once, fails pending and future
    /// acquires with `Flushing`, and reclaims outstanding buffers as they
    /// drop.
    pub fn set_active(&self, active: bool) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if state.active == active {
            return Ok(());
        }

        if active {
            state.config.validate()?;
            let min = state.config.min_buffers;
            let size = state.config.buffer_size;
            let mut preallocated = Vec::with_capacity(min);
            for _ in 0..min {
                match self.inner.allocator.alloc(size) {
                    Ok(data) => preallocated.push(data),
                    Err(e) => {
                        warn!(
                            pool = %self.inner.name,
                            got = preallocated.len(),
                            wanted = min,
                            "preallocation failed, rolling back activation"
                        );
                        return Err(e);
                    }
                }
            }
            state.allocated += preallocated.len();
            state.free.extend(preallocated);
            state.active = true;
            state.flushing = false;
            debug!(pool = %self.inner.name, preallocated = min, "pool activated");
        } else {
            state.active = false;
            let freed = state.free.len();
            state.free.clear();
            state.allocated -= freed;
            debug!(
                pool = %self.inner.name,
                freed,
                outstanding = state.outstanding,
                "pool deactivated"
            );
            // Wake blocked acquirers so they observe the shutdown.
            self.inner.available.notify_all();
            if state.outstanding == 0 {
                self.inner.drained.notify_all();
            }
        }
        Ok(())
    }

    /// Gate acquisitions without deactivating.
    pub fn set_flushing(&self, flushing: bool) {
        let mut state = self.inner.state.lock().unwrap();
        state.flushing = flushing;
        if flushing {
            self.inner.available.notify_all();
        }
        debug!(pool = %self.inner.name, flushing, "pool flushing changed");
    }

    /// Acquire a buffer.
    ///
    /// Fails with [`FlowError::Flushing`] when the pool is inactive or
    /// flushing, and when the pool is at its maximum and
    /// [`AcquireParams::dont_wait`] is set. Otherwise blocks until a
    /// buffer is released.
    pub fn acquire(&self, params: AcquireParams) -> std::result::Result<Buffer, FlowError> {
        let inner = &self.inner;
        let mut state = inner.state.lock().unwrap();

        let data = loop {
            if !state.active || state.flushing {
                return Err(FlowError::Flushing);
            }
            if let Some(data) = state.free.pop() {
                break data;
            }
            let max = state.config.max_buffers;
            if max == 0 || state.allocated < max {
                let size = state.config.buffer_size;
                match inner.allocator.alloc(size) {
                    Ok(data) => {
                        state.allocated += 1;
                        break data;
                    }
                    Err(e) => {
                        error!(pool = %inner.name, %e, "buffer allocation failed");
                        return Err(FlowError::Error);
                    }
                }
            }
            if params.dont_wait {
                return Err(FlowError::Flushing);
            }
            state.waits += 1;
            crate::metrics::record_pool_wait(&inner.name);
            state = inner.available.wait(state).unwrap();
        };

        state.acquired += 1;
        state.outstanding += 1;
        crate::metrics::record_pool_acquire(&inner.name);
        crate::metrics::set_pool_outstanding(&inner.name, state.outstanding);
        Ok(Buffer::from_pool(
            data,
            PoolClaim {
                pool: inner.clone(),
            },
        ))
    }

    /// Acquire without ever blocking. Sugar for a `dont_wait` acquire.
    pub fn try_acquire(&self) -> std::result::Result<Buffer, FlowError> {
        self.acquire(AcquireParams { dont_wait: true })
    }

    /// Block until every outstanding buffer has returned.
    ///
    /// A NONE timeout waits indefinitely.
    pub fn wait_drained(&self, timeout: ClockTime) -> Result<()> {
        let deadline = timeout.to_option().map(|t| Instant::now() + Duration::from(t));
        let mut state = self.inner.state.lock().unwrap();
        while state.outstanding > 0 {
            let wait_for = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout(format!(
                            "pool {} still has {} outstanding buffers",
                            self.inner.name, state.outstanding
                        )));
                    }
                    deadline - now
                }
                None => Duration::from_secs(3600),
            };
            let (guard, _) = self.inner.drained.wait_timeout(state, wait_for).unwrap();
            state = guard;
        }
        Ok(())
    }

    /// Snapshot of the pool's counters.
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock().unwrap();
        PoolStats {
            acquired: state.acquired,
            waits: state.waits,
            outstanding: state.outstanding,
            free: state.free.len(),
            allocated: state.allocated,
        }
    }
}

impl PoolInner {
    fn release(self: &Arc<Self>, mut data: BytesMut) {
        let mut state = self.state.lock().unwrap();
        state.outstanding -= 1;
        if state.active && !state.flushing {
            let size = state.config.buffer_size;
            if data.len() != size {
                data.resize(size, 0);
            }
            state.free.push(data);
            self.available.notify_one();
        } else {
            // Lazy reclamation after deactivation.
            state.allocated -= 1;
            drop(data);
        }
        crate::metrics::set_pool_outstanding(&self.name, state.outstanding);
        if state.outstanding == 0 {
            self.drained.notify_all();
        }
    }
}

/// Ticket carried by pooled buffers; returns storage on drop of the
/// buffer.
pub(crate) struct PoolClaim {
    pool: Arc<PoolInner>,
}

impl PoolClaim {
    pub(crate) fn release(self, data: BytesMut) {
        self.pool.release(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn small_pool(min: usize, max: usize) -> BufferPool {
        let pool = BufferPool::new("test");
        pool.set_config(PoolConfig {
            buffer_size: 64,
            min_buffers: min,
            max_buffers: max,
        })
        .unwrap();
        pool
    }

    #[test]
    fn test_config_validation() {
        let pool = BufferPool::new("cfg");
        assert!(pool
            .set_config(PoolConfig {
                buffer_size: 0,
                min_buffers: 0,
                max_buffers: 0,
            })
            .is_err());
        assert!(pool
            .set_config(PoolConfig {
                buffer_size: 64,
                min_buffers: 5,
                max_buffers: 2,
            })
            .is_err());
    }

    #[test]
    fn test_config_immutable_while_active() {
        let pool = small_pool(1, 4);
        pool.set_active(true).unwrap();
        assert!(pool.set_config(PoolConfig::default()).is_err());

        pool.set_active(false).unwrap();
        assert!(pool.set_config(PoolConfig::default()).is_ok());
    }

    #[test]
    fn test_config_immutable_with_outstanding() {
        let pool = small_pool(0, 4);
        pool.set_active(true).unwrap();
        let buf = pool.acquire(AcquireParams::default()).unwrap();
        pool.set_active(false).unwrap();

        assert!(pool.set_config(PoolConfig::default()).is_err());
        drop(buf);
        assert!(pool.set_config(PoolConfig::default()).is_ok());
    }

    #[test]
    fn test_activation_preallocates_min() {
        let pool = small_pool(3, 8);
        pool.set_active(true).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.allocated, 3);
        assert_eq!(stats.free, 3);
        assert_eq!(stats.outstanding, 0);
    }

    #[test]
    fn test_activation_rollback_on_alloc_failure() {
        struct FailingAllocator {
            successes: AtomicUsize,
        }
        impl Allocator for FailingAllocator {
            fn alloc(&self, size: usize) -> Result<BytesMut> {
                if self.successes.fetch_sub(1, Ordering::SeqCst) == 0 {
                    return Err(Error::AllocationFailed("synthetic".into()));
                }
                let mut b = BytesMut::with_capacity(size);
                b.resize(size, 0);
                Ok(b)
            }
        }

        let pool = BufferPool::with_allocator(
            "failing",
            Arc::new(FailingAllocator {
                successes: AtomicUsize::new(2),
            }),
        );
        pool.set_config(PoolConfig {
            buffer_size: 64,
            min_buffers: 4,
            max_buffers: 4,
        })
        .unwrap();

        assert!(pool.set_active(true).is_err());
        assert!(!pool.is_active());
        assert_eq!(pool.stats().allocated, 0);
    }

    #[test]
    fn test_acquire_inactive_is_flushing() {
        let pool = small_pool(0, 2);
        assert_eq!(
            pool.acquire(AcquireParams::default()).unwrap_err(),
            FlowError::Flushing
        );
    }

    #[test]
    fn test_bounded_acquire_and_dont_wait() {
        let pool = small_pool(2, 2);
        pool.set_active(true).unwrap();

        let a = pool.acquire(AcquireParams::default()).unwrap();
        let b = pool.acquire(AcquireParams::default()).unwrap();
        assert_eq!(a.len(), 64);

        // At the cap a non-waiting acquire reports exhaustion as Flushing.
        assert_eq!(pool.try_acquire().unwrap_err(), FlowError::Flushing);

        drop(a);
        let c = pool.try_acquire().unwrap();
        assert_eq!(pool.stats().outstanding, 2);
        drop(b);
        drop(c);
        assert_eq!(pool.stats().outstanding, 0);
        assert_eq!(pool.stats().allocated, 2);
    }

    #[test]
    fn test_unbounded_growth() {
        let pool = small_pool(0, 0);
        pool.set_active(true).unwrap();
        let held: Vec<_> = (0..10)
            .map(|_| pool.acquire(AcquireParams::default()).unwrap())
            .collect();
        assert_eq!(pool.stats().allocated, 10);
        drop(held);
        assert_eq!(pool.stats().free, 10);
    }

    #[test]
    fn test_blocking_acquire_unblocked_by_release() {
        let pool = small_pool(1, 1);
        pool.set_active(true).unwrap();
        let held = pool.acquire(AcquireParams::default()).unwrap();

        let waiter = std::thread::spawn({
            let pool = pool.clone();
            move || pool.acquire(AcquireParams::default()).map(|b| b.len())
        });

        std::thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());
        drop(held);

        assert_eq!(waiter.join().unwrap().unwrap(), 64);
        assert!(pool.stats().waits >= 1);
    }

    #[test]
    fn test_blocking_acquire_unblocked_by_flush() {
        let pool = small_pool(1, 1);
        pool.set_active(true).unwrap();
        let _held = pool.acquire(AcquireParams::default()).unwrap();

        let waiter = std::thread::spawn({
            let pool = pool.clone();
            move || pool.acquire(AcquireParams::default()).err()
        });

        std::thread::sleep(Duration::from_millis(30));
        pool.set_flushing(true);
        assert_eq!(waiter.join().unwrap(), Some(FlowError::Flushing));

        // Clearing the gate admits acquires again once space exists.
        pool.set_flushing(false);
        assert!(pool.is_active());
    }

    #[test]
    fn test_deactivate_reclaims_lazily() {
        let pool = small_pool(2, 4);
        pool.set_active(true).unwrap();
        let held = pool.acquire(AcquireParams::default()).unwrap();

        pool.set_active(false).unwrap();
        // Free list dropped immediately, outstanding stays.
        let stats = pool.stats();
        assert_eq!(stats.free, 0);
        assert_eq!(stats.outstanding, 1);
        assert_eq!(stats.allocated, 1);

        drop(held);
        let stats = pool.stats();
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.allocated, 0);
    }

    #[test]
    fn test_wait_drained() {
        let pool = small_pool(0, 2);
        pool.set_active(true).unwrap();
        let held = pool.acquire(AcquireParams::default()).unwrap();

        assert!(pool.wait_drained(ClockTime::from_millis(30)).is_err());

        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            drop(held);
        });
        pool.wait_drained(ClockTime::from_secs(5)).unwrap();
        releaser.join().unwrap();
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn test_recycled_storage_keeps_size() {
        let pool = small_pool(1, 1);
        pool.set_active(true).unwrap();

        let mut buf = pool.acquire(AcquireParams::default()).unwrap();
        buf.data_mut()[..4].copy_from_slice(b"mark");
        drop(buf);

        let buf = pool.acquire(AcquireParams::default()).unwrap();
        assert_eq!(buf.len(), 64);
        // Only one buffer ever existed.
        assert_eq!(pool.stats().allocated, 1);
        assert_eq!(pool.stats().acquired, 2);
    }
}
