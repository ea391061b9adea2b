//! Master-slave clock coupling.
//!
//! A slaved clock keeps reporting time from its own source but regresses
//! its calibration against periodic samples of a master clock, so both
//! report the same timeline within the fit error. Sampling runs on a
//! dedicated task that waits on a periodic entry scheduled on the master.

use std::sync::{Arc, Weak};

use tracing::{debug, trace};

use super::{Clock, ClockFlags, ClockId, ClockInner, ClockReturn, ClockTime};
use crate::task::{Task, TaskPoll};

/// Parameters governing observation collection while slaved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlaveConfig {
    /// Number of samples kept for the regression.
    pub window_size: usize,
    /// Samples required before the first regression is applied.
    pub window_threshold: usize,
    /// Interval between master samples.
    pub timeout: ClockTime,
}

impl Default for SlaveConfig {
    fn default() -> Self {
        Self {
            window_size: 32,
            window_threshold: 4,
            timeout: ClockTime::from_millis(100),
        }
    }
}

pub(super) struct MasterLink {
    master: Weak<ClockInner>,
    id: ClockId,
    sampler: Task,
}

impl Clock {
    /// Get the slaving parameters.
    pub fn slave_config(&self) -> SlaveConfig {
        *self.inner.slave_config.lock().unwrap()
    }

    /// Replace the slaving parameters. Takes effect on the next
    /// [`set_master`](Self::set_master) call.
    pub fn set_slave_config(&self, config: SlaveConfig) -> crate::Result<()> {
        if config.window_size < 2 || config.window_threshold < 2 {
            return Err(crate::Error::InvalidConfig(
                "slave window must hold at least two samples".into(),
            ));
        }
        if config.timeout.is_none() || config.timeout == ClockTime::ZERO {
            return Err(crate::Error::InvalidConfig(
                "slave sampling timeout must be a positive time".into(),
            ));
        }
        *self.inner.slave_config.lock().unwrap() = config;
        Ok(())
    }

    /// Slave this clock to `master`, or stop slaving with `None`.
    ///
    /// Starts a sampling task that observes the master every
    /// [`SlaveConfig::timeout`] and feeds the observations into this
    /// clock's calibration. The master is held weakly; if it goes away the
    /// sampling stops on its own. Passing a new master replaces the old
    /// link, and the observation window starts fresh either way.
    pub fn set_master(&self, master: Option<&Clock>) -> crate::Result<()> {
        let old = self.inner.master.lock().unwrap().take();
        if let Some(link) = old {
            link.id.unschedule();
            let _ = link.sampler.join();
            debug!(clock = %self.name(), "unslaved");
        }
        self.inner.observations.lock().unwrap().clear();

        let Some(master) = master else {
            return Ok(());
        };

        if Arc::ptr_eq(&self.inner, &master.inner) {
            return Err(crate::Error::InvalidConfig(
                "clock cannot slave to itself".into(),
            ));
        }
        if !self.flags().contains(ClockFlags::CAN_SET_MASTER) {
            return Err(crate::Error::InvalidConfig(format!(
                "clock {} cannot be slaved",
                self.name()
            )));
        }
        if !master.flags().contains(ClockFlags::CAN_BE_MASTER) {
            return Err(crate::Error::InvalidConfig(format!(
                "clock {} cannot act as a master",
                master.name()
            )));
        }

        let timeout = self.slave_config().timeout;
        let id = master.new_periodic_id(master.time() + timeout, timeout);

        let slave_weak = Arc::downgrade(&self.inner);
        let master_weak = Arc::downgrade(&master.inner);
        let sample_id = id.clone();
        let sampler = Task::new(format!("clock-slave-{}", self.name()), move || {
            match sample_id.wait() {
                ClockReturn::Ok | ClockReturn::Early => {
                    let (Some(slave), Some(master)) =
                        (slave_weak.upgrade(), master_weak.upgrade())
                    else {
                        return TaskPoll::Stop;
                    };
                    let slave = Clock { inner: slave };
                    let internal = slave.internal_time();
                    let external = master.time();
                    if let Some(r_squared) = slave.add_observation(internal, external) {
                        trace!(clock = %slave.name(), r_squared, "slave regression applied");
                    }
                    TaskPoll::Continue
                }
                ClockReturn::Unscheduled | ClockReturn::Badtime => TaskPoll::Stop,
            }
        });
        sampler.start()?;

        debug!(
            clock = %self.name(),
            master = %master.name(),
            interval = %timeout,
            "slaved to master"
        );
        *self.inner.master.lock().unwrap() = Some(MasterLink {
            master: Arc::downgrade(&master.inner),
            id,
            sampler,
        });
        Ok(())
    }

    /// The current master, if one is set and still alive.
    pub fn master(&self) -> Option<Clock> {
        self.inner
            .master
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|link| link.master.upgrade())
            .map(|inner| Clock { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::super::ManualSource;
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_set_master_rejects_self() {
        let clock = Clock::system();
        assert!(clock.set_master(Some(&clock)).is_err());
    }

    #[test]
    fn test_set_master_checks_flags() {
        let slave = Clock::with_flags(Arc::new(ManualSource::new()), ClockFlags::NONE);
        let master = Clock::system();
        assert!(slave.set_master(Some(&master)).is_err());

        let slave = Clock::system();
        let master =
            Clock::with_flags(Arc::new(ManualSource::new()), ClockFlags::CAN_SET_MASTER);
        assert!(slave.set_master(Some(&master)).is_err());
    }

    #[test]
    fn test_unslave_without_master_is_noop() {
        let clock = Clock::system();
        assert!(clock.set_master(None).is_ok());
        assert!(clock.master().is_none());
    }

    #[test]
    fn test_slave_config_validation() {
        let clock = Clock::system();
        let bad = SlaveConfig {
            window_threshold: 1,
            ..SlaveConfig::default()
        };
        assert!(clock.set_slave_config(bad).is_err());
        let bad = SlaveConfig {
            timeout: ClockTime::ZERO,
            ..SlaveConfig::default()
        };
        assert!(clock.set_slave_config(bad).is_err());
    }

    #[test]
    fn test_slave_tracks_manual_master() {
        let master_src = Arc::new(ManualSource::new());
        let master = Clock::new(master_src.clone());
        let slave_src = Arc::new(ManualSource::new());
        let slave = Clock::new(slave_src.clone());

        slave
            .set_slave_config(SlaveConfig {
                window_size: 16,
                window_threshold: 4,
                timeout: ClockTime::from_millis(20),
            })
            .unwrap();
        slave.set_master(Some(&master)).unwrap();
        assert!(slave.master().is_some());

        // Master advances twice as fast as the slave's raw source. Real
        // sleeps let the sampler observe each step.
        for i in 1..=12u64 {
            master_src.set_time(ClockTime::from_millis(i * 20));
            slave_src.set_time(ClockTime::from_millis(i * 10));
            std::thread::sleep(Duration::from_millis(15));
        }

        let drift = slave.time().abs_diff(master.time());
        assert!(
            drift < ClockTime::from_millis(25),
            "slave should track master, drift = {drift}"
        );
        let rate = slave.calibration().rate();
        assert!((rate - 2.0).abs() < 0.2, "regressed rate = {rate}");

        slave.set_master(None).unwrap();
        assert!(slave.master().is_none());
    }
}
