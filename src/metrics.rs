//! Metrics collection using metrics-rs.

use metrics::{counter, gauge, Unit};
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const STATE_CHANGES: &str = "sluice_state_changes";
const PAD_PUSHES: &str = "sluice_pad_pushes";
const PAD_EVENTS: &str = "sluice_pad_events";
const POOL_ACQUIRED: &str = "sluice_pool_acquired";
const POOL_WAITS: &str = "sluice_pool_waits";
const POOL_OUTSTANDING: &str = "sluice_pool_outstanding";
const CLOCK_OBSERVATIONS: &str = "sluice_clock_observations";
const BUS_MESSAGES: &str = "sluice_bus_messages";

/// Initialize metrics descriptions.
///
/// Call this once at application startup before using any metrics.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return; // Already initialized
    }

    metrics::describe_counter!(
        STATE_CHANGES,
        Unit::Count,
        "Completed element state transitions"
    );
    metrics::describe_counter!(PAD_PUSHES, Unit::Count, "Buffers pushed through pads");
    metrics::describe_counter!(PAD_EVENTS, Unit::Count, "Events sent through pads");
    metrics::describe_counter!(POOL_ACQUIRED, Unit::Count, "Buffers acquired from pools");
    metrics::describe_counter!(
        POOL_WAITS,
        Unit::Count,
        "Acquisitions that blocked on an exhausted pool"
    );
    metrics::describe_gauge!(
        POOL_OUTSTANDING,
        Unit::Count,
        "Buffers currently held by consumers"
    );
    metrics::describe_counter!(
        CLOCK_OBSERVATIONS,
        Unit::Count,
        "Master clock samples fed to slaved clocks"
    );
    metrics::describe_counter!(BUS_MESSAGES, Unit::Count, "Messages posted on element buses");
}

/// Record a completed state transition.
#[inline]
pub fn record_state_change(element: &str, transition: &'static str) {
    counter!(STATE_CHANGES, "element" => element.to_string(), "transition" => transition)
        .increment(1);
}

/// Record a buffer pushed through a pad.
#[inline]
pub fn record_pad_push(pad: &str) {
    counter!(PAD_PUSHES, "pad" => pad.to_string()).increment(1);
}

/// Record an event sent through a pad.
#[inline]
pub fn record_pad_event(pad: &str, event: &'static str) {
    counter!(PAD_EVENTS, "pad" => pad.to_string(), "event" => event).increment(1);
}

/// Record a pool acquisition.
#[inline]
pub fn record_pool_acquire(pool: &str) {
    counter!(POOL_ACQUIRED, "pool" => pool.to_string()).increment(1);
}

/// Record an acquisition that had to block.
#[inline]
pub fn record_pool_wait(pool: &str) {
    counter!(POOL_WAITS, "pool" => pool.to_string()).increment(1);
}

/// Record the number of buffers out with consumers.
#[inline]
pub fn set_pool_outstanding(pool: &str, outstanding: usize) {
    gauge!(POOL_OUTSTANDING, "pool" => pool.to_string()).set(outstanding as f64);
}

/// Record a clock observation sample.
#[inline]
pub fn record_clock_observation(clock: &str) {
    counter!(CLOCK_OBSERVATIONS, "clock" => clock.to_string()).increment(1);
}

/// Record a bus message post.
#[inline]
pub fn record_bus_message(kind: &'static str) {
    counter!(BUS_MESSAGES, "kind" => kind).increment(1);
}
