//! Streaming task threads.
//!
//! A [`Task`] owns one dedicated OS thread that repeatedly invokes a
//! closure. The closure's [`TaskPoll`] verdict steers the loop: keep
//! going, park, or end. Pausing keeps the thread alive and parked on a
//! condvar, so resuming is cheap; stopping ends the thread, and a later
//! start spawns a fresh one running the same closure.
//!
//! Pads drive their pull-mode streaming loops with a task, and a slaved
//! clock drives its master sampling with one. The closure must not block
//! indefinitely on its own: anything it waits on needs an external unblock
//! path (pool flush, clock unschedule) so `pause`/`stop` take effect at
//! the next iteration boundary.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, trace};

use crate::{Error, Result};

/// Verdict returned by a task's repeat closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPoll {
    /// Run the closure again.
    Continue,
    /// Park the thread until the task is started again.
    Pause,
    /// End the loop and let the thread exit.
    Stop,
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskState {
    /// No live thread (initial state, or after stop).
    #[default]
    Stopped,
    /// Thread is running the closure.
    Started,
    /// Thread is alive but parked.
    Paused,
}

struct TaskGuts {
    state: TaskState,
    handle: Option<JoinHandle<()>>,
}

struct TaskInner {
    name: String,
    guts: Mutex<TaskGuts>,
    cond: Condvar,
    func: Mutex<Box<dyn FnMut() -> TaskPoll + Send>>,
}

/// A repeating closure on its own named thread.
///
/// Handles are cheap clones sharing one task. Stop and join the task
/// before dropping the last handle; a running thread keeps itself alive
/// otherwise.
///
/// # Example
///
/// ```rust
/// use sluice::task::{Task, TaskPoll};
///
/// let task = Task::new("ticker", move || {
///     // one iteration of work
///     TaskPoll::Continue
/// });
/// task.start().unwrap();
/// task.pause().unwrap();
/// task.start().unwrap();
/// task.stop();
/// task.join().unwrap();
/// ```
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    /// Create a task around a repeat closure. The thread is not spawned
    /// until [`start`](Self::start).
    pub fn new(name: impl Into<String>, func: impl FnMut() -> TaskPoll + Send + 'static) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                name: name.into(),
                guts: Mutex::new(TaskGuts {
                    state: TaskState::Stopped,
                    handle: None,
                }),
                cond: Condvar::new(),
                func: Mutex::new(Box::new(func)),
            }),
        }
    }

    /// The task's name. Also used as the thread name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.inner.guts.lock().unwrap().state
    }

    /// Start or resume the task.
    ///
    /// Spawns the thread when stopped, wakes it when paused, and is a
    /// no-op when already started.
    pub fn start(&self) -> Result<()> {
        loop {
            let mut guts = self.inner.guts.lock().unwrap();
            match guts.state {
                TaskState::Started => return Ok(()),
                TaskState::Paused => {
                    guts.state = TaskState::Started;
                    self.inner.cond.notify_all();
                    return Ok(());
                }
                TaskState::Stopped => {
                    // A previous thread may still be winding down; reap it
                    // before spawning the next one.
                    if let Some(handle) = guts.handle.take() {
                        drop(guts);
                        handle
                            .join()
                            .map_err(|_| Error::Task("streaming thread panicked".into()))?;
                        continue;
                    }
                    guts.state = TaskState::Started;
                    let inner = self.inner.clone();
                    let handle = thread::Builder::new()
                        .name(self.inner.name.clone())
                        .spawn(move || run_loop(inner))
                        .map_err(|e| Error::Task(e.to_string()))?;
                    guts.handle = Some(handle);
                    debug!(task = %self.inner.name, "task started");
                    return Ok(());
                }
            }
        }
    }

    /// Park the task. The thread stays alive; a no-op when stopped.
    pub fn pause(&self) -> Result<()> {
        let mut guts = self.inner.guts.lock().unwrap();
        if guts.state == TaskState::Started {
            guts.state = TaskState::Paused;
            debug!(task = %self.inner.name, "task paused");
        }
        Ok(())
    }

    /// Ask the task to stop. Does not wait for the thread to exit; use
    /// [`join`](Self::join) for that.
    pub fn stop(&self) {
        let mut guts = self.inner.guts.lock().unwrap();
        if guts.state != TaskState::Stopped {
            guts.state = TaskState::Stopped;
            self.inner.cond.notify_all();
            debug!(task = %self.inner.name, "task stopping");
        }
    }

    /// Wait for the task's thread to exit.
    ///
    /// Stops the task first if still running. Fails when called from the
    /// task's own thread.
    pub fn join(&self) -> Result<()> {
        self.stop();
        let handle = {
            let mut guts = self.inner.guts.lock().unwrap();
            guts.handle.take()
        };
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return Err(Error::Task("task cannot join itself".into()));
            }
            handle
                .join()
                .map_err(|_| Error::Task("streaming thread panicked".into()))?;
        }
        Ok(())
    }
}

fn run_loop(inner: Arc<TaskInner>) {
    trace!(task = %inner.name, "task loop entered");
    loop {
        {
            let mut guts = inner.guts.lock().unwrap();
            while guts.state == TaskState::Paused {
                guts = inner.cond.wait(guts).unwrap();
            }
            if guts.state == TaskState::Stopped {
                break;
            }
        }

        let poll = (inner.func.lock().unwrap())();
        match poll {
            TaskPoll::Continue => {}
            TaskPoll::Pause => {
                let mut guts = inner.guts.lock().unwrap();
                if guts.state == TaskState::Started {
                    guts.state = TaskState::Paused;
                }
            }
            TaskPoll::Stop => {
                inner.guts.lock().unwrap().state = TaskState::Stopped;
                break;
            }
        }
    }
    trace!(task = %inner.name, "task loop left");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    fn counting_task(counter: Arc<AtomicU64>) -> Task {
        Task::new("counter", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(1));
            TaskPoll::Continue
        })
    }

    #[test]
    fn test_start_runs_closure() {
        let counter = Arc::new(AtomicU64::new(0));
        let task = counting_task(counter.clone());
        assert_eq!(task.state(), TaskState::Stopped);

        task.start().unwrap();
        assert_eq!(task.state(), TaskState::Started);
        thread::sleep(Duration::from_millis(30));
        assert!(counter.load(Ordering::SeqCst) > 0);

        task.join().unwrap();
        assert_eq!(task.state(), TaskState::Stopped);
    }

    #[test]
    fn test_pause_parks_without_exiting() {
        let counter = Arc::new(AtomicU64::new(0));
        let task = counting_task(counter.clone());
        task.start().unwrap();
        thread::sleep(Duration::from_millis(20));

        task.pause().unwrap();
        assert_eq!(task.state(), TaskState::Paused);
        // Let any in-flight iteration finish, then verify no progress.
        thread::sleep(Duration::from_millis(10));
        let parked_at = counter.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(counter.load(Ordering::SeqCst), parked_at);

        // Resume continues on the same thread.
        task.start().unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(counter.load(Ordering::SeqCst) > parked_at);

        task.join().unwrap();
    }

    #[test]
    fn test_restart_after_stop() {
        let counter = Arc::new(AtomicU64::new(0));
        let task = counting_task(counter.clone());

        task.start().unwrap();
        thread::sleep(Duration::from_millis(10));
        task.join().unwrap();
        let first_run = counter.load(Ordering::SeqCst);

        task.start().unwrap();
        thread::sleep(Duration::from_millis(10));
        task.join().unwrap();
        assert!(counter.load(Ordering::SeqCst) > first_run);
    }

    #[test]
    fn test_closure_pause_verdict() {
        let counter = Arc::new(AtomicU64::new(0));
        let task = Task::new("self-pausing", {
            let counter = counter.clone();
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                TaskPoll::Pause
            }
        });

        task.start().unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(task.state(), TaskState::Paused);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        task.start().unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        task.join().unwrap();
    }

    #[test]
    fn test_closure_stop_verdict() {
        let task = Task::new("one-shot", move || TaskPoll::Stop);
        task.start().unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(task.state(), TaskState::Stopped);
        task.join().unwrap();
    }

    #[test]
    fn test_pause_when_stopped_is_noop() {
        let task = Task::new("idle", move || TaskPoll::Continue);
        task.pause().unwrap();
        assert_eq!(task.state(), TaskState::Stopped);
    }
}
