//! Elements: stateful processing nodes.
//!
//! An [`Element`] owns pads, walks the state ladder
//! `Null ⇄ Ready ⇄ Paused ⇄ Playing` one adjacent step at a time, and
//! posts progress on its [`Bus`]. Behavior lives in an [`ElementImpl`]:
//! the element calls its `change_state` hook once per step and interprets
//! the verdict.
//!
//! A hook may answer [`Async`](StateChangeSuccess::Async) for an upward
//! step that needs time (a sink waiting for its first buffer). The walk
//! stops with the step half done; the streaming thread finishes it later
//! with [`continue_state`](Element::continue_state), which commits,
//! resumes the walk to the original target, and posts `AsyncDone` once
//! settled. A downward request while prerolling does not wait: the
//! half-done step is committed and the walk proceeds down immediately.
//!
//! Around the hooks the element does the scheduling chores itself: pads
//! activate entering `Paused` and deactivate leaving it, registered
//! buffer pools must drain before `Null`, and the base-time bookkeeping
//! that freezes running time across pauses happens on the
//! `Paused ⇄ Playing` edges.
//!
//! ```rust,ignore
//! let element = Element::new("filesink", SinkImpl::default());
//! element.add_pad(Pad::new("sink", PadDirection::Sink))?;
//!
//! match element.set_state(State::Playing)? {
//!     StateChangeSuccess::Async => {
//!         let (result, state, _) = element.get_state(ClockTime::from_secs(5));
//!         result?;
//!         assert_eq!(state, State::Playing);
//!     }
//!     _ => {}
//! }
//! ```

mod lock;
mod state;

pub use lock::{StateLock, StateLockGuard};
pub use state::{
    State, StateChange, StateChangeError, StateChangeResult, StateChangeSuccess,
};

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::bus::{Bus, ErrorCode, Message};
use crate::clock::{Clock, ClockTime};
use crate::pad::Pad;
use crate::pool::BufferPool;
use crate::{Error, Result};

// ============================================================================
// ElementImpl
// ============================================================================

/// The behavior of an element, bound at construction.
///
/// The element core walks states, runs pads, and posts messages; the
/// implementation contributes what each transition means: open a device
/// on `NullToReady`, start a streaming task on `PausedToPlaying`, and so
/// on.
pub trait ElementImpl: Send + Sync + 'static {
    /// React to one state transition.
    ///
    /// Return [`Async`](StateChangeSuccess::Async) when an upward step
    /// completes later (finish with [`Element::continue_state`]),
    /// [`NoPreroll`](StateChangeSuccess::NoPreroll) when the element is
    /// live and `Paused` produces no data to wait for. Errors stop the
    /// walk at the last committed state.
    fn change_state(&self, element: &Element, transition: StateChange) -> StateChangeResult {
        let _ = (element, transition);
        Ok(StateChangeSuccess::Success)
    }
}

// ============================================================================
// Element
// ============================================================================

struct StateFields {
    /// Last committed state.
    current: State,
    /// To-state of a half-done asynchronous step.
    next: Option<State>,
    /// Final target while a walk is unresolved, None when settled.
    pending: Option<State>,
    /// What the most recent `set_state` asked for.
    target: State,
    /// Result reported for the settled state.
    last_result: StateChangeResult,
    /// Set once a transition reported NoPreroll; makes later returns to
    /// `Paused` report NoPreroll too. Cleared when leaving `Paused`
    /// downward.
    no_preroll: bool,
}

impl Default for StateFields {
    fn default() -> Self {
        Self {
            current: State::Null,
            next: None,
            pending: None,
            target: State::Null,
            last_result: Ok(StateChangeSuccess::Success),
            no_preroll: false,
        }
    }
}

struct ElementInner {
    name: String,
    imp: Box<dyn ElementImpl>,
    /// Serializes whole state walks; reentrant so hooks may drive their
    /// own element.
    state_lock: StateLock,
    fields: Mutex<StateFields>,
    /// Signaled at every commit, abort, and failure; pairs with `fields`.
    state_cond: Condvar,
    pads: Mutex<Vec<Pad>>,
    pools: Mutex<Vec<BufferPool>>,
    clock: Mutex<Option<Clock>>,
    /// Pipeline time at which running time 0 happened, in nanoseconds.
    base_time: AtomicI64,
    /// Running time accumulated before the last pause, in nanoseconds.
    start_time: AtomicI64,
    bus: Mutex<Bus>,
}

/// A stateful node owning pads. Handles are cheap clones sharing one
/// element.
#[derive(Clone)]
pub struct Element {
    inner: Arc<ElementInner>,
}

impl std::fmt::Debug for Element {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fields = self.inner.fields.lock().unwrap();
        f.debug_struct("Element")
            .field("name", &self.inner.name)
            .field("current", &fields.current)
            .field("pending", &fields.pending)
            .finish()
    }
}

impl Element {
    /// Create an element in `Null` with the given behavior.
    pub fn new(name: impl Into<String>, imp: impl ElementImpl) -> Self {
        Self {
            inner: Arc::new(ElementInner {
                name: name.into(),
                imp: Box::new(imp),
                state_lock: StateLock::new(),
                fields: Mutex::new(StateFields::default()),
                state_cond: Condvar::new(),
                pads: Mutex::new(Vec::new()),
                pools: Mutex::new(Vec::new()),
                clock: Mutex::new(None),
                base_time: AtomicI64::new(0),
                start_time: AtomicI64::new(0),
                bus: Mutex::new(Bus::default()),
            }),
        }
    }

    /// The element's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    /// Request a target state and walk towards it.
    ///
    /// The walk takes one adjacent step at a time, committing and posting
    /// `StateChanged` per step. Returns `Success` (or `NoPreroll`) when
    /// settled, `Async` when a step is pending, and an error when a hook
    /// failed; the element then rests at the last committed state.
    ///
    /// While an asynchronous step is unresolved, a new upward request
    /// only re-aims the walk. A request for `Ready` or `Null` commits the
    /// half-done step on the spot and walks down synchronously; downward
    /// steps are never asynchronous.
    pub fn set_state(&self, target: State) -> StateChangeResult {
        let _guard = self.inner.state_lock.lock();
        debug!(element = %self.inner.name, target = target.name(), "state requested");

        let forced = {
            let mut fields = self.inner.fields.lock().unwrap();
            fields.target = target;

            if fields.pending.is_some() && target > State::Ready {
                fields.pending = Some(target);
                fields.last_result = Ok(StateChangeSuccess::Async);
                debug!(
                    element = %self.inner.name,
                    target = target.name(),
                    "pending state change re-aimed"
                );
                return Ok(StateChangeSuccess::Async);
            }
            if fields.pending.is_none() && fields.current == target {
                return fields.last_result;
            }

            if fields.pending.is_some() {
                // Preroll can never finish on the way down; finish the
                // half-done step so the downward walk starts from a real
                // state.
                let forced = fields.next.take().map(|next| {
                    let old = fields.current;
                    fields.current = next;
                    (old, next)
                });
                fields.pending = None;
                fields.last_result = Ok(StateChangeSuccess::Success);
                forced
            } else {
                None
            }
        };

        if let Some((old, new)) = forced {
            self.inner.state_cond.notify_all();
            warn!(
                element = %self.inner.name,
                "asynchronous state change cut short by downward request"
            );
            self.post_state_changed(old, new, Some(target));
        }

        self.walk()
    }

    /// Finish a transition that a hook answered with `Async`.
    ///
    /// Commits the half-done step with the given verdict, resumes the
    /// walk to the original target, and posts `AsyncDone` once it
    /// settles. Called from the streaming thread that completed the
    /// preroll. An `Async` verdict makes no sense here and is treated as
    /// `Success`.
    pub fn continue_state(&self, verdict: StateChangeSuccess) -> StateChangeResult {
        let _guard = self.inner.state_lock.lock();
        let verdict = match verdict {
            StateChangeSuccess::Async => {
                warn!(element = %self.inner.name, "async verdict in continue_state");
                StateChangeSuccess::Success
            }
            other => other,
        };

        let transition = {
            let fields = self.inner.fields.lock().unwrap();
            match fields.next {
                Some(next) => StateChange::between(fields.current, next),
                None => None,
            }
        };
        let Some(transition) = transition else {
            warn!(element = %self.inner.name, "continue_state without a pending transition");
            return self.inner.fields.lock().unwrap().last_result;
        };

        self.commit_transition(transition, verdict);
        let result = self.walk();

        if matches!(
            result,
            Ok(StateChangeSuccess::Success | StateChangeSuccess::NoPreroll)
        ) {
            debug!(element = %self.inner.name, "asynchronous state change finished");
            self.post_message(Message::AsyncDone {
                element: self.inner.name.clone(),
            });
        }
        result
    }

    /// Abandon an unresolved state change.
    ///
    /// Waiters in [`get_state`](Self::get_state) observe a failure; the
    /// element stays at its last committed state. A no-op when nothing is
    /// pending.
    pub fn abort_state(&self) {
        let _guard = self.inner.state_lock.lock();
        let mut fields = self.inner.fields.lock().unwrap();
        if fields.pending.is_none() && fields.next.is_none() {
            return;
        }
        fields.pending = None;
        fields.next = None;
        fields.target = fields.current;
        fields.last_result = Err(StateChangeError);
        drop(fields);
        self.inner.state_cond.notify_all();
        warn!(element = %self.inner.name, "state change aborted");
    }

    /// The settled result, current state, and unresolved target.
    ///
    /// Blocks while a state change is unresolved, up to `timeout`
    /// ([`ClockTime::NONE`] waits indefinitely). On timeout the result is
    /// `Ok(Async)` alongside the still-pending target.
    pub fn get_state(&self, timeout: ClockTime) -> (StateChangeResult, State, Option<State>) {
        let deadline = timeout
            .to_option()
            .map(|t| Instant::now() + Duration::from(t));
        let mut fields = self.inner.fields.lock().unwrap();
        while fields.pending.is_some() {
            match deadline {
                None => fields = self.inner.state_cond.wait(fields).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return (
                            Ok(StateChangeSuccess::Async),
                            fields.current,
                            fields.pending,
                        );
                    }
                    let (guard, _) = self
                        .inner
                        .state_cond
                        .wait_timeout(fields, deadline - now)
                        .unwrap();
                    fields = guard;
                }
            }
        }
        (fields.last_result, fields.current, None)
    }

    /// The last committed state.
    pub fn current_state(&self) -> State {
        self.inner.fields.lock().unwrap().current
    }

    /// The unresolved target, if a state change is in progress.
    pub fn pending_state(&self) -> Option<State> {
        self.inner.fields.lock().unwrap().pending
    }

    /// The to-state of a half-done asynchronous step, if any.
    pub fn next_state(&self) -> Option<State> {
        self.inner.fields.lock().unwrap().next
    }

    /// What the most recent state request asked for.
    pub fn target_state(&self) -> State {
        self.inner.fields.lock().unwrap().target
    }

    /// The result reported for the last settled state, without blocking.
    pub fn last_state_result(&self) -> StateChangeResult {
        self.inner.fields.lock().unwrap().last_result
    }

    /// Step towards `fields.target` until settled, failed, or async.
    fn walk(&self) -> StateChangeResult {
        loop {
            let (current, target) = {
                let fields = self.inner.fields.lock().unwrap();
                (fields.current, fields.target)
            };
            // The target is re-read every step; a reentrant set_state
            // from a hook may have re-aimed or even finished the walk.
            if current == target {
                let mut fields = self.inner.fields.lock().unwrap();
                fields.pending = None;
                let result = fields.last_result;
                drop(fields);
                self.inner.state_cond.notify_all();
                return result;
            }
            let Some(transition) = StateChange::step_towards(current, target) else {
                return Err(StateChangeError);
            };
            if self.perform_transition(transition)? == StateChangeSuccess::Async {
                return Ok(StateChangeSuccess::Async);
            }
        }
    }

    /// Run one transition: core chores, then the hook, then bookkeeping
    /// for its verdict.
    fn perform_transition(&self, transition: StateChange) -> StateChangeResult {
        trace!(element = %self.inner.name, transition = transition.name(), "transition");

        if let Err(e) = self.prepare_transition(transition) {
            return self.fail_transition(transition, e.to_string());
        }

        match self.inner.imp.change_state(self, transition) {
            Ok(StateChangeSuccess::Async) if !transition.is_upward() => {
                warn!(
                    element = %self.inner.name,
                    transition = transition.name(),
                    "downward transition cannot be asynchronous"
                );
                self.commit_transition(transition, StateChangeSuccess::Success);
                Ok(StateChangeSuccess::Success)
            }
            Ok(StateChangeSuccess::Async) => {
                let mut fields = self.inner.fields.lock().unwrap();
                fields.next = Some(transition.to_state());
                fields.pending = Some(fields.target);
                fields.last_result = Ok(StateChangeSuccess::Async);
                drop(fields);
                debug!(
                    element = %self.inner.name,
                    transition = transition.name(),
                    "transition continues asynchronously"
                );
                Ok(StateChangeSuccess::Async)
            }
            Ok(verdict) => {
                self.commit_transition(transition, verdict);
                Ok(verdict)
            }
            Err(_) => self.fail_transition(
                transition,
                format!("{} failed", transition.name()),
            ),
        }
    }

    /// The scheduling chores the core owns, done before the hook runs.
    fn prepare_transition(&self, transition: StateChange) -> Result<()> {
        match transition {
            StateChange::NullToReady => Ok(()),
            StateChange::ReadyToPaused => {
                self.set_start_time(ClockTime::ZERO);
                self.activate_pads(true)
            }
            StateChange::PausedToPlaying => {
                self.distribute_base_time();
                Ok(())
            }
            StateChange::PlayingToPaused => {
                self.freeze_running_time();
                Ok(())
            }
            StateChange::PausedToReady => self.activate_pads(false),
            StateChange::ReadyToNull => self.drain_pools(),
        }
    }

    fn commit_transition(&self, transition: StateChange, verdict: StateChangeSuccess) {
        let new = transition.to_state();
        let (old, pending) = {
            let mut fields = self.inner.fields.lock().unwrap();
            let old = fields.current;
            fields.current = new;
            fields.next = None;
            if verdict == StateChangeSuccess::NoPreroll {
                fields.no_preroll = true;
            }
            if !transition.is_upward() && new <= State::Ready {
                fields.no_preroll = false;
            }
            let settled = new == fields.target;
            let mut reported = verdict;
            if settled && new == State::Paused && fields.no_preroll {
                reported = StateChangeSuccess::NoPreroll;
            }
            fields.pending = if settled { None } else { Some(fields.target) };
            fields.last_result = Ok(reported);
            (old, fields.pending)
        };
        self.inner.state_cond.notify_all();
        self.post_state_changed(old, new, pending);
    }

    fn fail_transition(&self, transition: StateChange, detail: String) -> StateChangeResult {
        {
            let mut fields = self.inner.fields.lock().unwrap();
            fields.pending = None;
            fields.next = None;
            fields.target = fields.current;
            fields.last_result = Err(StateChangeError);
        }
        self.inner.state_cond.notify_all();
        warn!(
            element = %self.inner.name,
            transition = transition.name(),
            %detail,
            "state change failed"
        );
        self.post_message(Message::Error {
            element: self.inner.name.clone(),
            code: ErrorCode::State,
            message: detail,
        });
        Err(StateChangeError)
    }

    fn post_state_changed(&self, old: State, new: State, pending: Option<State>) {
        if let Some(transition) = StateChange::between(old, new) {
            crate::metrics::record_state_change(&self.inner.name, transition.name());
        }
        debug!(
            element = %self.inner.name,
            old = old.name(),
            new = new.name(),
            pending = pending.map(State::name),
            "state changed"
        );
        self.post_message(Message::StateChanged {
            element: self.inner.name.clone(),
            old,
            new,
            pending,
        });
    }

    // ------------------------------------------------------------------
    // Pads
    // ------------------------------------------------------------------

    /// Add a pad. Pad names are unique within an element.
    ///
    /// A pad added while the element is already `Paused` or above is
    /// activated on the spot, so late pads follow the element's state.
    pub fn add_pad(&self, pad: Pad) -> Result<()> {
        {
            let mut pads = self.inner.pads.lock().unwrap();
            if pads.iter().any(|p| p.name() == pad.name()) {
                return Err(Error::InvalidState(format!(
                    "element {} already has a pad named {}",
                    self.inner.name,
                    pad.name()
                )));
            }
            pads.push(pad.clone());
        }
        if self.current_state() >= State::Paused {
            pad.set_active(true)?;
        }
        debug!(element = %self.inner.name, pad = pad.name(), "pad added");
        Ok(())
    }

    /// Remove a pad by name: unlink it, deactivate it, and release its
    /// streaming task.
    pub fn remove_pad(&self, name: &str) -> Result<()> {
        let pad = {
            let mut pads = self.inner.pads.lock().unwrap();
            let index = pads
                .iter()
                .position(|p| p.name() == name)
                .ok_or_else(|| {
                    Error::InvalidState(format!(
                        "element {} has no pad named {}",
                        self.inner.name, name
                    ))
                })?;
            pads.remove(index)
        };
        if pad.is_linked() {
            pad.unlink()?;
        }
        pad.set_active(false)?;
        pad.stop_task()?;
        debug!(element = %self.inner.name, pad = name, "pad removed");
        Ok(())
    }

    /// Look up a pad by name.
    pub fn static_pad(&self, name: &str) -> Option<Pad> {
        self.inner
            .pads
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.name() == name)
            .cloned()
    }

    /// All pads.
    pub fn pads(&self) -> Vec<Pad> {
        self.inner.pads.lock().unwrap().clone()
    }

    /// All src pads.
    pub fn src_pads(&self) -> Vec<Pad> {
        self.inner
            .pads
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.is_src())
            .cloned()
            .collect()
    }

    /// All sink pads.
    pub fn sink_pads(&self) -> Vec<Pad> {
        self.inner
            .pads
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.is_sink())
            .cloned()
            .collect()
    }

    fn activate_pads(&self, active: bool) -> Result<()> {
        let pads = self.pads();
        let mut first_err = None;
        let (src, sink): (Vec<_>, Vec<_>) = pads.into_iter().partition(|p| p.is_src());
        for pad in src.iter().chain(sink.iter()) {
            if let Err(e) = pad.set_active(active) {
                warn!(
                    element = %self.inner.name,
                    pad = pad.name(),
                    active,
                    error = %e,
                    "pad activation failed"
                );
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        if active && first_err.is_some() {
            // A failed sweep leaves no pad half up.
            for pad in src.iter().chain(sink.iter()) {
                let _ = pad.set_active(false);
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // Pools
    // ------------------------------------------------------------------

    /// Register a buffer pool with the element's lifecycle.
    ///
    /// Registered pools gate the `Ready` to `Null` transition: they are
    /// deactivated and the walk blocks until every outstanding buffer has
    /// returned.
    pub fn register_pool(&self, pool: BufferPool) {
        debug!(element = %self.inner.name, pool = pool.name(), "pool registered");
        self.inner.pools.lock().unwrap().push(pool);
    }

    /// All registered pools.
    pub fn pools(&self) -> Vec<BufferPool> {
        self.inner.pools.lock().unwrap().clone()
    }

    fn drain_pools(&self) -> Result<()> {
        let pools = self.pools();
        for pool in &pools {
            pool.set_active(false)?;
            pool.wait_drained(ClockTime::NONE)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Clock and time
    // ------------------------------------------------------------------

    /// Set or clear the clock this element synchronizes against.
    pub fn set_clock(&self, clock: Option<Clock>) {
        *self.inner.clock.lock().unwrap() = clock;
    }

    /// The element's clock.
    pub fn clock(&self) -> Option<Clock> {
        self.inner.clock.lock().unwrap().clone()
    }

    /// Set the base time: the clock time at which running time is zero.
    pub fn set_base_time(&self, base: i64) {
        self.inner.base_time.store(base, Ordering::SeqCst);
    }

    /// The base time in nanoseconds of clock time.
    pub fn base_time(&self) -> i64 {
        self.inner.base_time.load(Ordering::SeqCst)
    }

    /// Set the running time accumulated before the next start.
    pub fn set_start_time(&self, start: ClockTime) {
        let nanos = if start.is_none() { 0 } else { start.nanos() as i64 };
        self.inner.start_time.store(nanos, Ordering::SeqCst);
    }

    /// Running time accumulated up to the last pause.
    pub fn start_time(&self) -> ClockTime {
        ClockTime::from_nanos(self.inner.start_time.load(Ordering::SeqCst).max(0) as u64)
    }

    /// The element's position on the running-time axis, NONE without a
    /// usable clock.
    pub fn running_time(&self) -> ClockTime {
        let Some(clock) = self.clock() else {
            return ClockTime::NONE;
        };
        let now = clock.time();
        if now.is_none() {
            return ClockTime::NONE;
        }
        let rt = now.nanos() as i64 - self.base_time();
        ClockTime::from_nanos(rt.max(0) as u64)
    }

    /// Entering `Playing`: pick the base time so running time resumes
    /// from where the last pause froze it.
    fn distribute_base_time(&self) {
        let Some(clock) = self.clock() else { return };
        let now = clock.time();
        if now.is_none() {
            return;
        }
        let start = self.inner.start_time.load(Ordering::SeqCst);
        let base = now.nanos() as i64 - start;
        self.inner.base_time.store(base, Ordering::SeqCst);
        debug!(
            element = %self.inner.name,
            base_time = base,
            start_time = start,
            "base time set"
        );
    }

    /// Leaving `Playing`: remember how much running time has elapsed.
    fn freeze_running_time(&self) {
        let Some(clock) = self.clock() else { return };
        let now = clock.time();
        if now.is_none() {
            return;
        }
        let elapsed = (now.nanos() as i64 - self.base_time()).max(0);
        self.inner.start_time.store(elapsed, Ordering::SeqCst);
        debug!(element = %self.inner.name, start_time = elapsed, "running time frozen");
    }

    // ------------------------------------------------------------------
    // Bus
    // ------------------------------------------------------------------

    /// The element's bus.
    pub fn bus(&self) -> Bus {
        self.inner.bus.lock().unwrap().clone()
    }

    /// Replace the element's bus, typically to share one across a
    /// pipeline.
    pub fn set_bus(&self, bus: Bus) {
        *self.inner.bus.lock().unwrap() = bus;
    }

    /// Post a message on the element's bus.
    pub fn post_message(&self, message: Message) {
        self.bus().post(message);
    }

    /// Post a fatal error about this element.
    pub fn post_error(&self, code: ErrorCode, message: impl Into<String>) {
        self.post_message(Message::Error {
            element: self.inner.name.clone(),
            code,
            message: message.into(),
        });
    }

    /// Post a non-fatal warning about this element.
    pub fn post_warning(&self, message: impl Into<String>) {
        self.post_message(Message::Warning {
            element: self.inner.name.clone(),
            message: message.into(),
        });
    }
}

impl Drop for ElementInner {
    fn drop(&mut self) {
        let current = self.fields.lock().unwrap().current;
        if current != State::Null {
            warn!(
                element = %self.name,
                state = current.name(),
                "element dropped without reaching null"
            );
        }
    }
}
