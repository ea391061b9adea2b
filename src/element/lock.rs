//! Reentrant lock serializing state transitions.
//!
//! An element's transition hook may call back into the element (posting
//! messages, adding pads, even requesting a further state change), so the
//! lock guarding transitions must be reentrant for the owning thread.
//! Rather than relying on a platform recursive mutex, [`StateLock`] keeps
//! an explicit owner and depth, which makes the reentrancy observable and
//! identical everywhere.

use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

#[derive(Default)]
struct Owner {
    thread: Option<ThreadId>,
    depth: usize,
}

/// A mutex that the same thread may lock again while already holding it.
///
/// Other threads block until the owner has dropped every guard. The lock
/// protects a *region* (the transition walk), not data; the element's
/// state fields live behind their own plain mutex so readers never touch
/// this lock.
#[derive(Default)]
pub struct StateLock {
    owner: Mutex<Owner>,
    released: Condvar,
}

impl StateLock {
    /// Create an unheld lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock, blocking if another thread holds it. Reentrant:
    /// the owning thread nests without blocking.
    pub fn lock(&self) -> StateLockGuard<'_> {
        let me = thread::current().id();
        let mut owner = self.owner.lock().unwrap();
        loop {
            match owner.thread {
                None => {
                    owner.thread = Some(me);
                    owner.depth = 1;
                    break;
                }
                Some(holder) if holder == me => {
                    owner.depth += 1;
                    break;
                }
                Some(_) => {
                    owner = self.released.wait(owner).unwrap();
                }
            }
        }
        StateLockGuard { lock: self }
    }

    /// Acquire the lock only if free or already owned by this thread.
    pub fn try_lock(&self) -> Option<StateLockGuard<'_>> {
        let me = thread::current().id();
        let mut owner = self.owner.lock().unwrap();
        match owner.thread {
            None => {
                owner.thread = Some(me);
                owner.depth = 1;
                Some(StateLockGuard { lock: self })
            }
            Some(holder) if holder == me => {
                owner.depth += 1;
                Some(StateLockGuard { lock: self })
            }
            Some(_) => None,
        }
    }

    /// Whether the calling thread currently holds the lock.
    pub fn is_held_by_current(&self) -> bool {
        let owner = self.owner.lock().unwrap();
        owner.thread == Some(thread::current().id())
    }

    /// Nesting depth of the current owner; 0 when free.
    pub fn depth(&self) -> usize {
        self.owner.lock().unwrap().depth
    }
}

/// Guard for a held [`StateLock`]. Dropping the outermost guard releases
/// the lock and wakes one waiting thread.
pub struct StateLockGuard<'a> {
    lock: &'a StateLock,
}

impl Drop for StateLockGuard<'_> {
    fn drop(&mut self) {
        let mut owner = self.lock.owner.lock().unwrap();
        owner.depth -= 1;
        if owner.depth == 0 {
            owner.thread = None;
            self.lock.released.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_lock_and_release() {
        let lock = StateLock::new();
        assert_eq!(lock.depth(), 0);
        {
            let _guard = lock.lock();
            assert!(lock.is_held_by_current());
            assert_eq!(lock.depth(), 1);
        }
        assert!(!lock.is_held_by_current());
        assert_eq!(lock.depth(), 0);
    }

    #[test]
    fn test_reentrant_same_thread() {
        let lock = StateLock::new();
        let _outer = lock.lock();
        let _middle = lock.lock();
        {
            let _inner = lock.lock();
            assert_eq!(lock.depth(), 3);
        }
        assert_eq!(lock.depth(), 2);
        assert!(lock.is_held_by_current());
    }

    #[test]
    fn test_try_lock_contended() {
        let lock = Arc::new(StateLock::new());
        let guard = lock.lock();

        let other = std::thread::spawn({
            let lock = lock.clone();
            move || lock.try_lock().is_some()
        });
        assert!(!other.join().unwrap());

        // Same thread still nests.
        assert!(lock.try_lock().is_some());
        drop(guard);
    }

    #[test]
    fn test_other_thread_blocks_until_release() {
        let lock = Arc::new(StateLock::new());
        let guard = lock.lock();

        let waiter = std::thread::spawn({
            let lock = lock.clone();
            move || {
                let _guard = lock.lock();
                // Owned by this thread now.
                lock.is_held_by_current()
            }
        });

        std::thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());

        drop(guard);
        assert!(waiter.join().unwrap());
        assert_eq!(lock.depth(), 0);
    }

    #[test]
    fn test_release_requires_all_guards_dropped() {
        let lock = Arc::new(StateLock::new());
        let outer = lock.lock();
        let inner = lock.lock();

        let waiter = std::thread::spawn({
            let lock = lock.clone();
            move || {
                let _guard = lock.lock();
            }
        });

        drop(inner);
        std::thread::sleep(Duration::from_millis(30));
        // One guard remains; the waiter must still be blocked.
        assert!(!waiter.is_finished());

        drop(outer);
        waiter.join().unwrap();
    }
}
