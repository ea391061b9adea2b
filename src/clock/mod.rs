//! Clock and time types for pipeline synchronization.
//!
//! This module provides:
//! - [`ClockTime`]: A nanosecond timestamp type (8 bytes, Copy)
//! - [`TimeSource`]: Trait for raw monotonic time sources
//! - [`Clock`]: A calibratable clock built on a time source
//! - [`ClockId`]: Scheduled wait entries (single-shot and periodic)
//! - [`SlaveConfig`]: Parameters for slaving one clock to another
//!
//! A [`Clock`] reads raw time from its [`TimeSource`] and maps it through a
//! [`Calibration`] (offset plus rate) before reporting it. The calibration
//! can be set directly, or derived continuously from observations of a
//! master clock, which is how two pipelines on different time bases agree
//! on a common timeline. Reported time never goes backwards even when the
//! calibration jumps.

mod id;
mod slave;

pub use id::{ClockId, ClockReturn, WaitStatus};
pub use slave::SlaveConfig;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

// ============================================================================
// ClockTime
// ============================================================================

/// Time in nanoseconds (8 bytes, Copy).
///
/// This is the fundamental time type in Sluice. It represents time as
/// nanoseconds since an arbitrary epoch (usually clock creation).
///
/// # Special Values
///
/// - `ClockTime::ZERO`: Zero time
/// - `ClockTime::NONE`: Invalid/unset time (sentinel value)
/// - `ClockTime::MAX`: Maximum representable time
///
/// # Examples
///
/// ```rust
/// use sluice::clock::ClockTime;
///
/// let t1 = ClockTime::from_secs(1);
/// let t2 = ClockTime::from_millis(500);
/// let t3 = t1 + t2;
///
/// assert_eq!(t3.millis(), 1500);
/// assert_eq!(format!("{}", t3), "1.500s");
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ClockTime(u64);

/// Signed difference between two clock times, in nanoseconds.
pub type ClockTimeDiff = i64;

impl ClockTime {
    /// Zero time.
    pub const ZERO: Self = Self(0);

    /// Maximum representable time (one less than NONE sentinel).
    pub const MAX: Self = Self(u64::MAX - 1);

    /// Invalid/unset time (sentinel value).
    pub const NONE: Self = Self(u64::MAX);

    /// Create from nanoseconds.
    #[inline]
    pub const fn from_nanos(ns: u64) -> Self {
        Self(ns)
    }

    /// Create from microseconds.
    #[inline]
    pub const fn from_micros(us: u64) -> Self {
        Self(us.saturating_mul(1_000))
    }

    /// Create from milliseconds.
    #[inline]
    pub const fn from_millis(ms: u64) -> Self {
        Self(ms.saturating_mul(1_000_000))
    }

    /// Create from seconds.
    #[inline]
    pub const fn from_secs(s: u64) -> Self {
        Self(s.saturating_mul(1_000_000_000))
    }

    /// Get as nanoseconds.
    #[inline]
    pub const fn nanos(self) -> u64 {
        self.0
    }

    /// Get as microseconds (truncated).
    #[inline]
    pub const fn micros(self) -> u64 {
        self.0 / 1_000
    }

    /// Get as milliseconds (truncated).
    #[inline]
    pub const fn millis(self) -> u64 {
        self.0 / 1_000_000
    }

    /// Get as seconds (truncated).
    #[inline]
    pub const fn secs(self) -> u64 {
        self.0 / 1_000_000_000
    }

    /// Check if this is the NONE sentinel value.
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u64::MAX
    }

    /// Check if this is a valid time (not NONE).
    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != u64::MAX
    }

    /// Convert to Option, returning None for the NONE sentinel.
    #[inline]
    pub const fn to_option(self) -> Option<Self> {
        if self.is_none() { None } else { Some(self) }
    }

    /// Saturating addition. Returns NONE if either operand is NONE.
    #[inline]
    pub const fn saturating_add(self, rhs: Self) -> Self {
        if self.is_none() || rhs.is_none() {
            return Self::NONE;
        }
        let result = self.0.saturating_add(rhs.0);
        // Don't overflow into NONE
        if result == u64::MAX {
            Self::MAX
        } else {
            Self(result)
        }
    }

    /// Saturating subtraction. Returns NONE if either operand is NONE.
    #[inline]
    pub const fn saturating_sub(self, rhs: Self) -> Self {
        if self.is_none() || rhs.is_none() {
            return Self::NONE;
        }
        Self(self.0.saturating_sub(rhs.0))
    }

    /// Checked subtraction. Returns None if either operand is NONE or underflow.
    #[inline]
    pub const fn checked_sub(self, rhs: Self) -> Option<Self> {
        if self.is_none() || rhs.is_none() {
            return None;
        }
        match self.0.checked_sub(rhs.0) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Checked addition. Returns None if either operand is NONE or overflow.
    #[inline]
    pub const fn checked_add(self, rhs: Self) -> Option<Self> {
        if self.is_none() || rhs.is_none() {
            return None;
        }
        match self.0.checked_add(rhs.0) {
            Some(v) if v != u64::MAX => Some(Self(v)),
            _ => None,
        }
    }

    /// Calculate absolute difference between two times.
    #[inline]
    pub const fn abs_diff(self, other: Self) -> Self {
        if self.is_none() || other.is_none() {
            return Self::NONE;
        }
        Self(self.0.abs_diff(other.0))
    }

    /// Signed difference `self - other` in nanoseconds.
    ///
    /// Returns 0 if either operand is NONE. Saturates at the i64 range.
    #[inline]
    pub const fn diff(self, other: Self) -> ClockTimeDiff {
        if self.is_none() || other.is_none() {
            return 0;
        }
        let d = self.0 as i128 - other.0 as i128;
        if d > i64::MAX as i128 {
            i64::MAX
        } else if d < i64::MIN as i128 {
            i64::MIN
        } else {
            d as i64
        }
    }

    /// Multiply by a scalar.
    #[inline]
    pub const fn saturating_mul(self, rhs: u64) -> Self {
        if self.is_none() {
            return Self::NONE;
        }
        let result = self.0.saturating_mul(rhs);
        if result == u64::MAX {
            Self::MAX
        } else {
            Self(result)
        }
    }
}

impl std::ops::Add for ClockTime {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Self) -> Self {
        self.saturating_add(rhs)
    }
}

impl std::ops::AddAssign for ClockTime {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        *self = self.saturating_add(rhs);
    }
}

impl std::ops::Sub for ClockTime {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Self) -> Self {
        self.saturating_sub(rhs)
    }
}

impl std::ops::SubAssign for ClockTime {
    #[inline]
    fn sub_assign(&mut self, rhs: Self) {
        *self = self.saturating_sub(rhs);
    }
}

impl From<Duration> for ClockTime {
    #[inline]
    fn from(d: Duration) -> Self {
        Self(d.as_nanos() as u64)
    }
}

impl From<ClockTime> for Duration {
    #[inline]
    fn from(t: ClockTime) -> Self {
        if t.is_none() {
            Duration::ZERO
        } else {
            Duration::from_nanos(t.0)
        }
    }
}

impl std::fmt::Display for ClockTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_none() {
            write!(f, "NONE")
        } else {
            let secs = self.secs();
            let ms = (self.0 / 1_000_000) % 1000;
            write!(f, "{}.{:03}s", secs, ms)
        }
    }
}

// ============================================================================
// Clock Capabilities
// ============================================================================

/// Capabilities and characteristics of a clock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct ClockFlags(u32);

impl ClockFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Clock can be used as a timing reference for other clocks.
    pub const CAN_BE_MASTER: Self = Self(1 << 0);
    /// Clock can slave to another clock (adjust its calibration).
    pub const CAN_SET_MASTER: Self = Self(1 << 1);

    /// Check if a flag is set.
    #[inline]
    pub const fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    /// Set a flag.
    #[inline]
    pub const fn insert(self, flag: Self) -> Self {
        Self(self.0 | flag.0)
    }

    /// Clear a flag.
    #[inline]
    pub const fn remove(self, flag: Self) -> Self {
        Self(self.0 & !flag.0)
    }

    /// Combine flags using bitwise OR.
    #[inline]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

// ============================================================================
// TimeSource
// ============================================================================

/// A raw monotonic time source.
///
/// Implementations must never report decreasing time. The value feeds a
/// [`Clock`]'s calibration; it is not meaningful to applications directly.
pub trait TimeSource: Send + Sync {
    /// Get the current raw time.
    fn now(&self) -> ClockTime;

    /// Get source resolution.
    fn resolution(&self) -> ClockTime {
        ClockTime::from_nanos(1)
    }

    /// Get a human-readable name for the source.
    fn name(&self) -> &str {
        "unknown"
    }
}

/// System monotonic time source.
///
/// Uses `std::time::Instant` for monotonic time measurement.
/// Time is relative to when the source was created.
pub struct MonotonicSource {
    epoch: Instant,
    name: String,
}

impl MonotonicSource {
    /// Create a new monotonic source with the current instant as epoch.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            name: "system-monotonic".to_string(),
        }
    }

    /// Create a monotonic source with a custom name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            epoch: Instant::now(),
            name: name.into(),
        }
    }
}

impl Default for MonotonicSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicSource {
    #[inline]
    fn now(&self) -> ClockTime {
        ClockTime::from_nanos(self.epoch.elapsed().as_nanos() as u64)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A time source advanced by hand.
///
/// Reports whatever time was last stored, which makes clock behavior
/// deterministic for tests and for externally stepped simulations.
pub struct ManualSource {
    time: AtomicU64,
    name: String,
}

impl ManualSource {
    /// Create a manual source starting at zero.
    pub fn new() -> Self {
        Self {
            time: AtomicU64::new(0),
            name: "manual".to_string(),
        }
    }

    /// Set the reported time. Must not go backwards.
    pub fn set_time(&self, time: ClockTime) {
        self.time.fetch_max(time.nanos(), Ordering::AcqRel);
    }

    /// Advance the reported time by `delta`.
    pub fn advance(&self, delta: ClockTime) {
        if delta.is_some() {
            self.time.fetch_add(delta.nanos(), Ordering::AcqRel);
        }
    }
}

impl Default for ManualSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for ManualSource {
    #[inline]
    fn now(&self) -> ClockTime {
        ClockTime::from_nanos(self.time.load(Ordering::Acquire))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// Calibration
// ============================================================================

/// Linear mapping from a clock's raw time to its reported time.
///
/// `external = (internal - internal_ref) * rate_num / rate_denom + external_ref`
///
/// The identity calibration reports raw time unchanged. Slaving replaces
/// the calibration continuously with regressed values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Calibration {
    /// Raw-time reference point.
    pub internal: ClockTime,
    /// Reported-time value at the reference point.
    pub external: ClockTime,
    /// Rate numerator.
    pub rate_num: u64,
    /// Rate denominator.
    pub rate_denom: u64,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            internal: ClockTime::ZERO,
            external: ClockTime::ZERO,
            rate_num: 1,
            rate_denom: 1,
        }
    }
}

impl Calibration {
    /// Check whether this calibration maps raw time unchanged.
    pub fn is_identity(&self) -> bool {
        self.internal == self.external && self.rate_num == self.rate_denom
    }

    /// Rate as a float, for diagnostics.
    pub fn rate(&self) -> f64 {
        self.rate_num as f64 / self.rate_denom as f64
    }

    /// Map a raw time to reported time.
    pub fn adjust(&self, internal: ClockTime) -> ClockTime {
        if internal.is_none() {
            return ClockTime::NONE;
        }
        let internal = internal.nanos() as i128;
        let iref = self.internal.nanos() as i128;
        let eref = self.external.nanos() as i128;
        let external =
            (internal - iref) * self.rate_num as i128 / self.rate_denom as i128 + eref;
        clamp_time(external)
    }

    /// Map a reported time back to raw time. Inverse of [`adjust`](Self::adjust).
    pub fn unadjust(&self, external: ClockTime) -> ClockTime {
        if external.is_none() || self.rate_num == 0 {
            return ClockTime::NONE;
        }
        let external = external.nanos() as i128;
        let iref = self.internal.nanos() as i128;
        let eref = self.external.nanos() as i128;
        let internal =
            (external - eref) * self.rate_denom as i128 / self.rate_num as i128 + iref;
        clamp_time(internal)
    }
}

#[inline]
const fn clamp_time(ns: i128) -> ClockTime {
    if ns <= 0 {
        ClockTime::ZERO
    } else if ns >= (u64::MAX - 1) as i128 {
        ClockTime::MAX
    } else {
        ClockTime::from_nanos(ns as u64)
    }
}

// ============================================================================
// Observation window
// ============================================================================

/// Bounded window of (internal, external) samples for slaving regression.
struct ObservationWindow {
    samples: VecDeque<(u64, u64)>,
}

impl ObservationWindow {
    fn new() -> Self {
        Self {
            samples: VecDeque::new(),
        }
    }

    fn push(&mut self, internal: u64, external: u64, window_size: usize) {
        while self.samples.len() >= window_size.max(1) {
            self.samples.pop_front();
        }
        self.samples.push_back((internal, external));
    }

    fn clear(&mut self) {
        self.samples.clear();
    }

    /// Least-squares fit over the window, centered on the first sample.
    ///
    /// Returns the regressed calibration and the fit's coefficient of
    /// determination, or None when the window is degenerate (fewer than
    /// two distinct internal times, or a non-positive slope).
    fn regress(&self) -> Option<(Calibration, f64)> {
        let n = self.samples.len();
        if n < 2 {
            return None;
        }
        let (x0, y0) = self.samples[0];

        let mut sx = 0.0f64;
        let mut sy = 0.0f64;
        for &(x, y) in &self.samples {
            sx += (x - x0) as f64;
            sy += (y as i128 - y0 as i128) as f64;
        }
        let mx = sx / n as f64;
        let my = sy / n as f64;

        let mut sxx = 0.0f64;
        let mut syy = 0.0f64;
        let mut sxy = 0.0f64;
        for &(x, y) in &self.samples {
            let dx = (x - x0) as f64 - mx;
            let dy = (y as i128 - y0 as i128) as f64 - my;
            sxx += dx * dx;
            syy += dy * dy;
            sxy += dx * dy;
        }
        if sxx == 0.0 {
            return None;
        }

        let slope = sxy / sxx;
        if slope <= 0.0 {
            return None;
        }
        let r_squared = if syy == 0.0 {
            1.0
        } else {
            (sxy * sxy) / (sxx * syy)
        };

        // Rate as a fixed-denominator fraction; 2^32 gives sub-ppb steps.
        const DENOM: u64 = 1 << 32;
        let rate_num = (slope * DENOM as f64).round() as u64;
        if rate_num == 0 {
            return None;
        }

        let internal_ref = x0 as i128 + mx.round() as i128;
        let external_ref = y0 as i128 + my.round() as i128;

        let calibration = Calibration {
            internal: clamp_time(internal_ref),
            external: clamp_time(external_ref),
            rate_num,
            rate_denom: DENOM,
        };
        Some((calibration, r_squared))
    }
}

// ============================================================================
// Clock
// ============================================================================

/// A calibratable clock.
///
/// Wraps a [`TimeSource`] and reports its raw time mapped through the
/// current [`Calibration`]. Handles are cheap clones sharing one clock;
/// reported time is globally monotonic across all handles.
///
/// # Example
///
/// ```rust
/// use sluice::clock::Clock;
///
/// let clock = Clock::system();
/// let t1 = clock.time();
/// let t2 = clock.time();
/// assert!(t2 >= t1);
/// ```
#[derive(Clone)]
pub struct Clock {
    pub(crate) inner: Arc<ClockInner>,
}

pub(crate) struct ClockInner {
    source: Arc<dyn TimeSource>,
    flags: ClockFlags,
    calibration: Mutex<Calibration>,
    /// Highest time ever reported, for the monotonic clamp.
    last_time: AtomicU64,
    observations: Mutex<ObservationWindow>,
    slave_config: Mutex<SlaveConfig>,
    master: Mutex<Option<slave::MasterLink>>,
}

impl Clock {
    /// Create a clock over an arbitrary time source.
    pub fn new(source: Arc<dyn TimeSource>) -> Self {
        Self::with_flags(
            source,
            ClockFlags::CAN_BE_MASTER.union(ClockFlags::CAN_SET_MASTER),
        )
    }

    /// Create a clock with explicit capability flags.
    pub fn with_flags(source: Arc<dyn TimeSource>, flags: ClockFlags) -> Self {
        Self {
            inner: Arc::new(ClockInner {
                source,
                flags,
                calibration: Mutex::new(Calibration::default()),
                last_time: AtomicU64::new(0),
                observations: Mutex::new(ObservationWindow::new()),
                slave_config: Mutex::new(SlaveConfig::default()),
                master: Mutex::new(None),
            }),
        }
    }

    /// Create a clock over the system monotonic source.
    pub fn system() -> Self {
        Self::new(Arc::new(MonotonicSource::new()))
    }

    /// Get the clock's name (from its source).
    pub fn name(&self) -> String {
        self.inner.source.name().to_string()
    }

    /// Get the clock's capability flags.
    #[inline]
    pub fn flags(&self) -> ClockFlags {
        self.inner.flags
    }

    /// Get the source resolution.
    pub fn resolution(&self) -> ClockTime {
        self.inner.source.resolution()
    }

    /// Get the raw, uncalibrated source time.
    #[inline]
    pub fn internal_time(&self) -> ClockTime {
        self.inner.source.now()
    }

    /// Get the current reported time.
    ///
    /// This is the calibrated source time, clamped so that consecutive
    /// reads never decrease even when the calibration jumps backwards.
    pub fn time(&self) -> ClockTime {
        self.inner.time()
    }

    /// Get the current calibration.
    pub fn calibration(&self) -> Calibration {
        *self.inner.calibration.lock().unwrap()
    }

    /// Replace the calibration.
    ///
    /// Fails if the rate is not positive or a reference is NONE. Reported
    /// time remains monotonic across the change.
    pub fn set_calibration(&self, calibration: Calibration) -> crate::Result<()> {
        if calibration.rate_num == 0 || calibration.rate_denom == 0 {
            return Err(crate::Error::InvalidConfig(
                "calibration rate must be positive".into(),
            ));
        }
        if calibration.internal.is_none() || calibration.external.is_none() {
            return Err(crate::Error::InvalidConfig(
                "calibration references must be valid times".into(),
            ));
        }
        debug!(
            clock = %self.name(),
            rate = calibration.rate(),
            "set calibration"
        );
        *self.inner.calibration.lock().unwrap() = calibration;
        Ok(())
    }

    /// Map a raw source time through the current calibration.
    ///
    /// Unlike [`time`](Self::time), no monotonic clamp is applied.
    pub fn adjust(&self, internal: ClockTime) -> ClockTime {
        self.inner.calibration.lock().unwrap().adjust(internal)
    }

    /// Map a reported time back to raw source time.
    pub fn unadjust(&self, external: ClockTime) -> ClockTime {
        self.inner.calibration.lock().unwrap().unadjust(external)
    }

    /// Feed one (internal, external) sample and re-regress the calibration.
    ///
    /// `internal` is this clock's raw time, `external` the time another
    /// clock reported at the same moment. Once the window holds at least
    /// the configured threshold of samples, the regressed calibration is
    /// installed and the fit's R² is returned.
    pub fn add_observation(&self, internal: ClockTime, external: ClockTime) -> Option<f64> {
        let (calibration, r_squared) = self.add_observation_unapplied(internal, external)?;
        // Keep failures quiet; the next sample will try again.
        let _ = self.set_calibration(calibration);
        Some(r_squared)
    }

    /// Feed one sample and compute, but do not install, the regression.
    pub fn add_observation_unapplied(
        &self,
        internal: ClockTime,
        external: ClockTime,
    ) -> Option<(Calibration, f64)> {
        self.inner.add_observation_unapplied(internal, external)
    }

    /// Create a wait entry that fires once at `time` (reported time).
    pub fn new_single_shot_id(&self, time: ClockTime) -> ClockId {
        ClockId::new_single_shot(Arc::downgrade(&self.inner), time)
    }

    /// Create a wait entry that fires at `start` and then every `interval`.
    pub fn new_periodic_id(&self, start: ClockTime, interval: ClockTime) -> ClockId {
        ClockId::new_periodic(Arc::downgrade(&self.inner), start, interval)
    }
}

impl ClockInner {
    pub(crate) fn time(&self) -> ClockTime {
        let internal = self.source.now();
        let adjusted = self.calibration.lock().unwrap().adjust(internal);
        let prev = self.last_time.fetch_max(adjusted.nanos(), Ordering::AcqRel);
        ClockTime::from_nanos(prev.max(adjusted.nanos()))
    }

    fn add_observation_unapplied(
        &self,
        internal: ClockTime,
        external: ClockTime,
    ) -> Option<(Calibration, f64)> {
        if internal.is_none() || external.is_none() {
            return None;
        }
        let (window_size, threshold) = {
            let cfg = self.slave_config.lock().unwrap();
            (cfg.window_size, cfg.window_threshold)
        };

        let mut window = self.observations.lock().unwrap();
        window.push(internal.nanos(), external.nanos(), window_size);
        crate::metrics::record_clock_observation(self.source.name());
        trace!(
            clock = self.source.name(),
            %internal,
            %external,
            samples = window.samples.len(),
            "clock observation"
        );

        if window.samples.len() < threshold.max(2) {
            return None;
        }
        window.regress()
    }
}
