//! Scheduled waits against a clock.
//!
//! A [`ClockId`] is a handle to a wait entry: a target time on a clock's
//! reported timeline, optionally repeating. Waits are blocking and are
//! woken either by time passing or by [`ClockId::unschedule`], which kills
//! the entry permanently. Waiters re-check the clock in short slices so a
//! calibration change moves a pending deadline without a wakeup.

use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use tracing::trace;

use super::{ClockInner, ClockTime};

/// Result of waiting on a [`ClockId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockReturn {
    /// The target time was reached while waiting.
    Ok,
    /// The target time had already passed when the wait began.
    Early,
    /// The entry was unscheduled (or its clock is gone).
    Unscheduled,
    /// The entry's target or interval is not a valid time.
    Badtime,
}

/// Observable state of a wait entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitStatus {
    /// Not fired yet (or re-armed, for periodic entries).
    #[default]
    Pending,
    /// Last wait fired at its target.
    Ok,
    /// Last wait found its target already passed.
    Early,
    /// Entry is dead; all waits return immediately.
    Unscheduled,
}

struct EntryState {
    target: ClockTime,
    status: WaitStatus,
    unscheduled: bool,
}

struct ClockEntry {
    clock: Weak<ClockInner>,
    /// NONE for single-shot entries.
    interval: ClockTime,
    state: Mutex<EntryState>,
    cond: Condvar,
}

/// Handle to a scheduled wait entry on a clock.
///
/// Clones share the entry, so one thread can block in [`wait`](Self::wait)
/// while another calls [`unschedule`](Self::unschedule).
#[derive(Clone)]
pub struct ClockId {
    entry: Arc<ClockEntry>,
}

impl ClockId {
    pub(super) fn new_single_shot(clock: Weak<ClockInner>, time: ClockTime) -> Self {
        Self {
            entry: Arc::new(ClockEntry {
                clock,
                interval: ClockTime::NONE,
                state: Mutex::new(EntryState {
                    target: time,
                    status: WaitStatus::Pending,
                    unscheduled: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub(super) fn new_periodic(
        clock: Weak<ClockInner>,
        start: ClockTime,
        interval: ClockTime,
    ) -> Self {
        Self {
            entry: Arc::new(ClockEntry {
                clock,
                interval,
                state: Mutex::new(EntryState {
                    target: start,
                    status: WaitStatus::Pending,
                    unscheduled: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Current target time on the clock's reported timeline.
    ///
    /// For periodic entries this advances by the interval after each fire.
    pub fn time(&self) -> ClockTime {
        self.entry.state.lock().unwrap().target
    }

    /// Repeat interval, or `ClockTime::NONE` for single-shot entries.
    #[inline]
    pub fn interval(&self) -> ClockTime {
        self.entry.interval
    }

    /// Check whether this entry repeats.
    #[inline]
    pub fn is_periodic(&self) -> bool {
        self.entry.interval.is_some()
    }

    /// Outcome of the most recent wait.
    pub fn status(&self) -> WaitStatus {
        self.entry.state.lock().unwrap().status
    }

    /// Block until the entry's target time is reached.
    ///
    /// Returns [`ClockReturn::Early`] without blocking when the target had
    /// already passed on entry, [`ClockReturn::Unscheduled`] when the entry
    /// was killed or its clock dropped, and [`ClockReturn::Badtime`] for
    /// entries scheduled with invalid times. Periodic entries re-arm at
    /// `target + interval` after each fire and can be waited on again.
    pub fn wait(&self) -> ClockReturn {
        let entry = &self.entry;
        let mut state = entry.state.lock().unwrap();

        if state.unscheduled {
            return ClockReturn::Unscheduled;
        }
        if state.target.is_none()
            || (self.is_periodic() && self.entry.interval == ClockTime::ZERO)
        {
            return ClockReturn::Badtime;
        }

        let Some(clock) = entry.clock.upgrade() else {
            state.status = WaitStatus::Unscheduled;
            state.unscheduled = true;
            return ClockReturn::Unscheduled;
        };

        state.status = WaitStatus::Pending;
        let entered_early = clock.time() >= state.target;

        loop {
            if state.unscheduled {
                state.status = WaitStatus::Unscheduled;
                return ClockReturn::Unscheduled;
            }
            let now = clock.time();
            if now >= state.target {
                break;
            }
            // Short slices so calibration changes and unschedule are
            // picked up promptly.
            let remaining =
                Duration::from(state.target - now).min(Duration::from_millis(10));
            let (guard, _) = entry.cond.wait_timeout(state, remaining).unwrap();
            state = guard;
        }

        let ret = if entered_early {
            state.status = WaitStatus::Early;
            ClockReturn::Early
        } else {
            state.status = WaitStatus::Ok;
            ClockReturn::Ok
        };
        if self.is_periodic() {
            state.target = state.target + self.entry.interval;
        }
        trace!(target = %state.target, ?ret, "clock id fired");
        ret
    }

    /// Kill the entry. Permanent: pending waits wake with
    /// [`ClockReturn::Unscheduled`] and all later waits return the same.
    pub fn unschedule(&self) {
        let mut state = self.entry.state.lock().unwrap();
        state.unscheduled = true;
        state.status = WaitStatus::Unscheduled;
        self.entry.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Clock, ManualSource};
    use super::*;
    use std::time::Instant;

    fn manual_clock() -> (Arc<ManualSource>, Clock) {
        let src = Arc::new(ManualSource::new());
        (src.clone(), Clock::new(src))
    }

    #[test]
    fn test_wait_early_when_target_passed() {
        let (src, clock) = manual_clock();
        src.set_time(ClockTime::from_secs(10));

        let id = clock.new_single_shot_id(ClockTime::from_secs(5));
        assert_eq!(id.wait(), ClockReturn::Early);
        assert_eq!(id.status(), WaitStatus::Early);
    }

    #[test]
    fn test_wait_badtime_for_none_target() {
        let (_, clock) = manual_clock();
        let id = clock.new_single_shot_id(ClockTime::NONE);
        assert_eq!(id.wait(), ClockReturn::Badtime);
    }

    #[test]
    fn test_wait_fires_when_time_advances() {
        let (src, clock) = manual_clock();
        let id = clock.new_single_shot_id(ClockTime::from_millis(50));

        let advancer = std::thread::spawn({
            let src = src.clone();
            move || {
                std::thread::sleep(Duration::from_millis(30));
                src.set_time(ClockTime::from_millis(60));
            }
        });

        assert_eq!(id.wait(), ClockReturn::Ok);
        assert_eq!(id.status(), WaitStatus::Ok);
        advancer.join().unwrap();
    }

    #[test]
    fn test_wait_real_clock() {
        let clock = Clock::system();
        let target = clock.time() + ClockTime::from_millis(30);
        let id = clock.new_single_shot_id(target);

        let started = Instant::now();
        assert_eq!(id.wait(), ClockReturn::Ok);
        assert!(started.elapsed() >= Duration::from_millis(25));
        assert!(clock.time() >= target);
    }

    #[test]
    fn test_unschedule_wakes_waiter_and_is_permanent() {
        let (_, clock) = manual_clock();
        let id = clock.new_single_shot_id(ClockTime::from_secs(100));

        let waiter = std::thread::spawn({
            let id = id.clone();
            move || id.wait()
        });
        std::thread::sleep(Duration::from_millis(20));
        id.unschedule();

        assert_eq!(waiter.join().unwrap(), ClockReturn::Unscheduled);
        assert_eq!(id.wait(), ClockReturn::Unscheduled);
        assert_eq!(id.status(), WaitStatus::Unscheduled);
    }

    #[test]
    fn test_periodic_advances_target() {
        let (src, clock) = manual_clock();
        let id = clock.new_periodic_id(ClockTime::from_millis(10), ClockTime::from_millis(10));
        assert!(id.is_periodic());

        src.set_time(ClockTime::from_millis(15));
        assert_eq!(id.wait(), ClockReturn::Early);
        assert_eq!(id.time(), ClockTime::from_millis(20));

        src.set_time(ClockTime::from_millis(25));
        assert_eq!(id.wait(), ClockReturn::Early);
        assert_eq!(id.time(), ClockTime::from_millis(30));

        id.unschedule();
        assert_eq!(id.wait(), ClockReturn::Unscheduled);
    }

    #[test]
    fn test_periodic_zero_interval_is_badtime() {
        let (_, clock) = manual_clock();
        let id = clock.new_periodic_id(ClockTime::from_millis(10), ClockTime::ZERO);
        assert_eq!(id.wait(), ClockReturn::Badtime);
    }

    #[test]
    fn test_wait_unscheduled_when_clock_dropped() {
        let (_, clock) = manual_clock();
        let id = clock.new_single_shot_id(ClockTime::from_secs(1));
        drop(clock);
        assert_eq!(id.wait(), ClockReturn::Unscheduled);
    }
}
