//! Pads: the data-flow endpoints of elements.
//!
//! A [`Pad`] is a directional connection point. Source pads push buffers
//! and events downstream to the sink pad they are linked to; sink pads in
//! pull mode drag buffers upstream from their peer instead. The element
//! owning a pad installs hooks (chain, getrange, event, activate, unlock)
//! and drives the pad's lifecycle through [`set_active`](Pad::set_active)
//! as part of its own state transitions.
//!
//! ```text
//!  element A                    element B
//!  ┌───────────[src]──── push ───▶[sink]───────────┐
//!  │            ▲                    │ chain hook  │
//!  └────────────┘                    ▼             │
//!            get_range ◀── pull ── pull_range      │
//! ```
//!
//! Data-flow calls resolve their guards in a fixed order: flushing first,
//! then end-of-stream, then link presence. A deactivated pad is flushing
//! by definition, so data is rejected with [`FlowError::Flushing`] rather
//! than reaching a half-torn-down element.
//!
//! Sticky events (stream-start, caps, segment, tags, eos) are remembered
//! latest-wins on the pad and replayed in precedence order to a peer
//! before the next buffer flows, so linking late or re-activating never
//! loses the stream preamble. Deactivation keeps sticky events; only a
//! flush-stop with `reset_time` clears them.

use std::sync::{Arc, Mutex, Weak};

use smallvec::SmallVec;
use tracing::{debug, error, trace, warn};

use crate::buffer::Buffer;
use crate::event::{Caps, Event, EventType};
use crate::flow::{FlowError, FlowResult};
use crate::task::{Task, TaskPoll};
use crate::{Error, Result};

// ============================================================================
// Vocabulary
// ============================================================================

/// Direction of a pad, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PadDirection {
    /// Produces data; the outgoing side of an element.
    Src,
    /// Consumes data; the incoming side of an element.
    Sink,
}

impl PadDirection {
    /// Stable lowercase name, for logs.
    pub fn name(self) -> &'static str {
        match self {
            PadDirection::Src => "src",
            PadDirection::Sink => "sink",
        }
    }
}

/// Scheduling mode of a pad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PadMode {
    /// Not activated.
    #[default]
    None,
    /// Upstream drives: buffers arrive via [`Pad::push`] → chain hook.
    Push,
    /// Downstream drives: a streaming task loops [`Pad::pull_range`].
    Pull,
}

impl PadMode {
    /// Stable lowercase name, for logs.
    pub fn name(self) -> &'static str {
        match self {
            PadMode::None => "none",
            PadMode::Push => "push",
            PadMode::Pull => "pull",
        }
    }
}

/// Why two pads could not be linked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PadLinkError {
    /// Link must go from a src pad to a sink pad.
    #[error("pads have the same or wrong direction")]
    WrongDirection,
    /// One of the pads already has a peer.
    #[error("pad is already linked")]
    WasLinked,
    /// The sink's caps acceptor refused the stream.
    #[error("peer refused the link")]
    Refused,
}

// ============================================================================
// Hook signatures
// ============================================================================

/// Chain hook: a sink pad consumes one buffer.
pub type ChainFn = dyn Fn(&Pad, Buffer) -> FlowResult + Send + Sync;

/// Getrange hook: a src pad produces `size` bytes at `offset`.
pub type GetRangeFn = dyn Fn(&Pad, u64, usize) -> std::result::Result<Buffer, FlowError> + Send + Sync;

/// Event hook: a pad reacts to an event; `false` rejects it.
pub type EventFn = dyn Fn(&Pad, &Event) -> bool + Send + Sync;

/// Activation hook: the element chooses how to (de)activate the pad.
pub type ActivateFn = dyn Fn(&Pad, bool) -> Result<()> + Send + Sync;

/// Unlock hook: anything blocked inside a data-flow hook must return.
pub type UnlockFn = dyn Fn(&Pad) + Send + Sync;

/// Caps acceptance predicate, injected by the negotiation layer.
///
/// The core never interprets caps; it only asks this predicate whether a
/// stream with the given caps may enter the pad.
pub type CapsAcceptor = dyn Fn(&Caps) -> bool + Send + Sync;

#[derive(Default)]
struct PadHooks {
    chain: Option<Arc<ChainFn>>,
    getrange: Option<Arc<GetRangeFn>>,
    event: Option<Arc<EventFn>>,
    activate: Option<Arc<ActivateFn>>,
    unlock: Option<Arc<UnlockFn>>,
    acceptor: Option<Arc<CapsAcceptor>>,
}

// ============================================================================
// Pad
// ============================================================================

struct PadState {
    mode: PadMode,
    active: bool,
    flushing: bool,
    eos: bool,
    peer: Option<Weak<PadInner>>,
    /// Sticky events, kept in replay (precedence) order.
    sticky: SmallVec<[Event; 4]>,
    /// Bumped on every sticky store; used to detect stores that race a
    /// replay in progress.
    sticky_serial: u64,
    /// Sticky events not yet delivered to the current peer.
    events_pending: bool,
}

struct PadInner {
    name: String,
    direction: PadDirection,
    state: Mutex<PadState>,
    hooks: Mutex<PadHooks>,
    task: Mutex<Option<Task>>,
}

/// A data-flow endpoint. Handles are cheap clones sharing one pad.
///
/// Pads are created inactive and flushing; the owning element activates
/// them when it moves to `Paused` and above. See the
/// [module docs](self) for the data-flow and event rules.
#[derive(Clone)]
pub struct Pad {
    inner: Arc<PadInner>,
}

impl std::fmt::Debug for Pad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("Pad")
            .field("name", &self.inner.name)
            .field("direction", &self.inner.direction)
            .field("mode", &state.mode)
            .field("active", &state.active)
            .field("flushing", &state.flushing)
            .finish()
    }
}

impl Pad {
    /// Create an unlinked, inactive pad.
    pub fn new(name: impl Into<String>, direction: PadDirection) -> Self {
        Self {
            inner: Arc::new(PadInner {
                name: name.into(),
                direction,
                state: Mutex::new(PadState {
                    mode: PadMode::None,
                    active: false,
                    // Inactive pads reject data.
                    flushing: true,
                    eos: false,
                    peer: None,
                    sticky: SmallVec::new(),
                    sticky_serial: 0,
                    events_pending: false,
                }),
                hooks: Mutex::new(PadHooks::default()),
                task: Mutex::new(None),
            }),
        }
    }

    fn from_inner(inner: Arc<PadInner>) -> Self {
        Self { inner }
    }

    /// The pad's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The pad's direction.
    #[inline]
    pub fn direction(&self) -> PadDirection {
        self.inner.direction
    }

    /// Check whether this is a src pad.
    #[inline]
    pub fn is_src(&self) -> bool {
        self.inner.direction == PadDirection::Src
    }

    /// Check whether this is a sink pad.
    #[inline]
    pub fn is_sink(&self) -> bool {
        self.inner.direction == PadDirection::Sink
    }

    /// Whether two handles refer to the same pad.
    pub fn ptr_eq(&self, other: &Pad) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Current scheduling mode.
    pub fn mode(&self) -> PadMode {
        self.inner.state.lock().unwrap().mode
    }

    /// Whether the pad is activated.
    pub fn is_active(&self) -> bool {
        self.inner.state.lock().unwrap().active
    }

    /// Whether the pad rejects data-flow calls.
    pub fn is_flushing(&self) -> bool {
        self.inner.state.lock().unwrap().flushing
    }

    // ------------------------------------------------------------------
    // Hooks
    // ------------------------------------------------------------------

    /// Install the chain hook (sink pads; consumes pushed buffers).
    pub fn set_chain(&self, f: impl Fn(&Pad, Buffer) -> FlowResult + Send + Sync + 'static) {
        self.inner.hooks.lock().unwrap().chain = Some(Arc::new(f));
    }

    /// Install the getrange hook (src pads; serves pulled ranges).
    pub fn set_getrange(
        &self,
        f: impl Fn(&Pad, u64, usize) -> std::result::Result<Buffer, FlowError> + Send + Sync + 'static,
    ) {
        self.inner.hooks.lock().unwrap().getrange = Some(Arc::new(f));
    }

    /// Install the event hook, called for every delivered event.
    pub fn set_event(&self, f: impl Fn(&Pad, &Event) -> bool + Send + Sync + 'static) {
        self.inner.hooks.lock().unwrap().event = Some(Arc::new(f));
    }

    /// Install the activation hook consulted by [`set_active`](Self::set_active).
    ///
    /// The hook picks the scheduling mode by calling
    /// [`activate_mode`](Self::activate_mode) itself. Without a hook,
    /// activation defaults to push mode.
    pub fn set_activate(&self, f: impl Fn(&Pad, bool) -> Result<()> + Send + Sync + 'static) {
        self.inner.hooks.lock().unwrap().activate = Some(Arc::new(f));
    }

    /// Install the unlock hook, fired when the pad turns flushing so
    /// blocked data-flow hooks return promptly.
    pub fn set_unlock(&self, f: impl Fn(&Pad) + Send + Sync + 'static) {
        self.inner.hooks.lock().unwrap().unlock = Some(Arc::new(f));
    }

    /// Install the caps acceptance predicate (sink pads).
    ///
    /// Consulted at link time against the peer's sticky caps and again
    /// whenever a caps event is delivered. Without one, all caps pass.
    pub fn set_acceptor(&self, f: impl Fn(&Caps) -> bool + Send + Sync + 'static) {
        self.inner.hooks.lock().unwrap().acceptor = Some(Arc::new(f));
    }

    fn fire_unlock(&self) {
        let unlock = self.inner.hooks.lock().unwrap().unlock.clone();
        if let Some(unlock) = unlock {
            unlock(self);
        }
    }

    // ------------------------------------------------------------------
    // Linking
    // ------------------------------------------------------------------

    /// Link this src pad to a sink pad.
    ///
    /// The link is refused when the directions do not match, either pad
    /// already has a peer, or the sink's caps acceptor rejects this pad's
    /// sticky caps. Peer references are weak in both directions; a pad
    /// never keeps its peer alive.
    pub fn link(&self, peer: &Pad) -> std::result::Result<(), PadLinkError> {
        if self.inner.direction != PadDirection::Src || peer.inner.direction != PadDirection::Sink
        {
            return Err(PadLinkError::WrongDirection);
        }

        // Consult the acceptor before committing anything; negotiation
        // content itself lives outside the core.
        let caps = self.sticky_event(EventType::Caps);
        if let Some(Event::Caps { caps }) = caps {
            let acceptor = peer.inner.hooks.lock().unwrap().acceptor.clone();
            if let Some(acceptor) = acceptor {
                if !acceptor(&caps) {
                    debug!(src = %self.inner.name, sink = %peer.inner.name, %caps, "link refused by acceptor");
                    return Err(PadLinkError::Refused);
                }
            }
        }

        // Src side locked first, everywhere two pad locks are held.
        let mut src = self.inner.state.lock().unwrap();
        let mut sink = peer.inner.state.lock().unwrap();
        if src.peer.as_ref().is_some_and(|w| w.strong_count() > 0)
            || sink.peer.as_ref().is_some_and(|w| w.strong_count() > 0)
        {
            return Err(PadLinkError::WasLinked);
        }
        src.peer = Some(Arc::downgrade(&peer.inner));
        sink.peer = Some(Arc::downgrade(&self.inner));
        // The new peer has seen none of our stickies yet.
        src.events_pending = !src.sticky.is_empty();

        debug!(src = %self.inner.name, sink = %peer.inner.name, "pads linked");
        Ok(())
    }

    /// Break the link with the current peer, from either side.
    pub fn unlink(&self) -> Result<()> {
        let peer = self
            .peer()
            .ok_or_else(|| Error::InvalidState(format!("pad {} is not linked", self.inner.name)))?;
        let (src, sink) = match self.inner.direction {
            PadDirection::Src => (&self.inner, &peer.inner),
            PadDirection::Sink => (&peer.inner, &self.inner),
        };
        let mut src_state = src.state.lock().unwrap();
        let mut sink_state = sink.state.lock().unwrap();
        src_state.peer = None;
        src_state.events_pending = false;
        sink_state.peer = None;
        debug!(src = %src.name, sink = %sink.name, "pads unlinked");
        Ok(())
    }

    /// The current peer, if linked and still alive.
    ///
    /// A dead weak reference (peer dropped without unlinking) is cleaned
    /// up here, so a stale link degrades to "not linked".
    pub fn peer(&self) -> Option<Pad> {
        let mut state = self.inner.state.lock().unwrap();
        match state.peer.as_ref().and_then(Weak::upgrade) {
            Some(inner) => Some(Pad::from_inner(inner)),
            None => {
                state.peer = None;
                None
            }
        }
    }

    /// Whether the pad has a live peer.
    pub fn is_linked(&self) -> bool {
        self.peer().is_some()
    }

    // ------------------------------------------------------------------
    // Activation
    // ------------------------------------------------------------------

    /// Activate or deactivate the pad, as driven by the owning element.
    ///
    /// With an activation hook installed the hook decides the mode;
    /// otherwise activation defaults to push mode and deactivation tears
    /// down whatever mode is current.
    pub fn set_active(&self, active: bool) -> Result<()> {
        let hook = self.inner.hooks.lock().unwrap().activate.clone();
        if let Some(hook) = hook {
            return hook(self, active);
        }
        if active {
            self.activate_mode(PadMode::Push, true)
        } else {
            let mode = self.mode();
            if mode == PadMode::None {
                return Ok(());
            }
            self.activate_mode(mode, false)
        }
    }

    /// Activate or deactivate the pad in a specific scheduling mode.
    ///
    /// Re-activating in the current mode is a no-op. Activating in a
    /// different mode while active deactivates the old mode first.
    /// Deactivation turns the pad flushing, fires the unlock hook so any
    /// blocked data-flow call returns [`FlowError::Flushing`], and parks
    /// (not destroys) the streaming task of a pull-mode pad. Sticky
    /// events survive deactivation.
    pub fn activate_mode(&self, mode: PadMode, active: bool) -> Result<()> {
        if mode == PadMode::None {
            return Err(Error::InvalidState(format!(
                "pad {}: mode none cannot be requested explicitly",
                self.inner.name
            )));
        }

        let (current_mode, is_active) = {
            let state = self.inner.state.lock().unwrap();
            (state.mode, state.active)
        };

        if active {
            if is_active && current_mode == mode {
                return Ok(());
            }
            if is_active {
                // Mode switch: the old mode comes down first.
                self.activate_mode(current_mode, false)?;
            }
            self.activate(mode)
        } else {
            if !is_active {
                return Ok(());
            }
            self.deactivate(current_mode)
        }
    }

    fn activate(&self, mode: PadMode) -> Result<()> {
        if mode == PadMode::Pull {
            match self.inner.direction {
                PadDirection::Src => {
                    // A pull src serves getrange calls; nothing to drive.
                    if self.inner.hooks.lock().unwrap().getrange.is_none() {
                        return Err(Error::InvalidState(format!(
                            "pad {}: pull mode requires a getrange hook",
                            self.inner.name
                        )));
                    }
                }
                PadDirection::Sink => {
                    // A pull sink drives the stream; it needs a task to
                    // loop in and a peer to pull from. The peer comes up
                    // in pull mode with us.
                    if self.inner.task.lock().unwrap().is_none() {
                        return Err(Error::Task(format!(
                            "pad {}: pull mode requires a streaming task",
                            self.inner.name
                        )));
                    }
                    let peer = self.peer().ok_or_else(|| {
                        Error::InvalidState(format!(
                            "pad {}: pull mode requires a linked peer",
                            self.inner.name
                        ))
                    })?;
                    peer.activate_mode(PadMode::Pull, true)?;
                }
            }
        }

        {
            let mut state = self.inner.state.lock().unwrap();
            state.mode = mode;
            state.active = true;
            state.flushing = false;
            if !state.sticky.is_empty() {
                // A peer linked while we were down has seen nothing yet.
                state.events_pending = true;
            }
        }

        if mode == PadMode::Pull && self.inner.direction == PadDirection::Sink {
            if let Some(task) = self.inner.task.lock().unwrap().as_ref() {
                task.start()?;
            }
        }

        debug!(pad = %self.inner.name, mode = mode.name(), "pad activated");
        Ok(())
    }

    fn deactivate(&self, mode: PadMode) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.flushing = true;
        }
        // Unblock anything stuck inside a data-flow hook before parking.
        self.fire_unlock();

        if mode == PadMode::Pull && self.inner.direction == PadDirection::Sink {
            if let Some(task) = self.inner.task.lock().unwrap().as_ref() {
                task.pause()?;
            }
        }

        {
            let mut state = self.inner.state.lock().unwrap();
            state.active = false;
            state.mode = PadMode::None;
        }
        debug!(pad = %self.inner.name, mode = mode.name(), "pad deactivated");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Streaming task
    // ------------------------------------------------------------------

    /// Install the streaming-loop closure for this pad.
    ///
    /// The task thread runs `func` repeatedly while the pad is active and
    /// not flushing; a flushing pad parks its loop until reactivated.
    /// Pull-mode sink pads must have a task installed before activation.
    pub fn set_task(&self, mut func: impl FnMut() -> TaskPoll + Send + 'static) {
        let weak = Arc::downgrade(&self.inner);
        let task = Task::new(format!("{}:loop", self.inner.name), move || {
            let Some(inner) = weak.upgrade() else {
                return TaskPoll::Stop;
            };
            if inner.state.lock().unwrap().flushing {
                return TaskPoll::Pause;
            }
            func()
        });
        *self.inner.task.lock().unwrap() = Some(task);
    }

    /// Start (or resume) the pad's streaming task.
    pub fn start_task(&self) -> Result<()> {
        match self.inner.task.lock().unwrap().as_ref() {
            Some(task) => task.start(),
            None => Err(Error::Task(format!(
                "pad {} has no streaming task installed",
                self.inner.name
            ))),
        }
    }

    /// Park the pad's streaming task, keeping its thread for cheap
    /// resumption.
    pub fn pause_task(&self) -> Result<()> {
        if let Some(task) = self.inner.task.lock().unwrap().as_ref() {
            task.pause()?;
        }
        Ok(())
    }

    /// Stop the pad's streaming task and release it.
    ///
    /// The loop closure is dropped with the task; install a new one with
    /// [`set_task`](Self::set_task) before activating pull mode again.
    pub fn stop_task(&self) -> Result<()> {
        let task = self.inner.task.lock().unwrap().take();
        if let Some(task) = task {
            task.join()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Data flow
    // ------------------------------------------------------------------

    /// Push a buffer downstream from this src pad.
    ///
    /// Any sticky events the peer has not yet seen are delivered first.
    /// Guards resolve as flushing, then EOS, then link presence.
    pub fn push(&self, buffer: Buffer) -> FlowResult {
        if self.inner.direction != PadDirection::Src {
            error!(pad = %self.inner.name, "push called on a sink pad");
            return Err(FlowError::Error);
        }
        let peer = {
            let state = self.inner.state.lock().unwrap();
            if state.flushing {
                return Err(FlowError::Flushing);
            }
            if state.eos {
                return Err(FlowError::Eos);
            }
            match state.peer.as_ref().and_then(Weak::upgrade) {
                Some(peer) => peer,
                None => return Err(FlowError::NotLinked),
            }
        };

        self.forward_stickies(&peer)?;
        crate::metrics::record_pad_push(&self.inner.name);
        Pad::from_inner(peer).chain(buffer)
    }

    /// Deliver a buffer into this sink pad's chain hook.
    ///
    /// Entry point of the push data plane; called by the peer's
    /// [`push`](Self::push) or directly by tests and adapters.
    pub fn chain(&self, buffer: Buffer) -> FlowResult {
        if self.inner.direction != PadDirection::Sink {
            error!(pad = %self.inner.name, "chain called on a src pad");
            return Err(FlowError::Error);
        }
        {
            let state = self.inner.state.lock().unwrap();
            if state.flushing {
                return Err(FlowError::Flushing);
            }
            if state.eos {
                return Err(FlowError::Eos);
            }
        }
        let chain = self.inner.hooks.lock().unwrap().chain.clone();
        match chain {
            Some(chain) => chain(self, buffer),
            None => {
                error!(pad = %self.inner.name, "no chain hook installed");
                Err(FlowError::Error)
            }
        }
    }

    /// Pull `size` bytes at `offset` from this sink pad's peer.
    ///
    /// The buffer is dropped and [`FlowError::Flushing`] returned when
    /// the pad went flushing while the pull was in flight.
    pub fn pull_range(&self, offset: u64, size: usize) -> std::result::Result<Buffer, FlowError> {
        if self.inner.direction != PadDirection::Sink {
            error!(pad = %self.inner.name, "pull_range called on a src pad");
            return Err(FlowError::Error);
        }
        let peer = {
            let state = self.inner.state.lock().unwrap();
            if state.flushing {
                return Err(FlowError::Flushing);
            }
            if state.eos {
                return Err(FlowError::Eos);
            }
            match state.peer.as_ref().and_then(Weak::upgrade) {
                Some(peer) => peer,
                None => return Err(FlowError::NotLinked),
            }
        };

        let buffer = Pad::from_inner(peer).get_range(offset, size)?;
        if self.inner.state.lock().unwrap().flushing {
            // Flushed mid-pull; the data belongs to the old stream.
            return Err(FlowError::Flushing);
        }
        Ok(buffer)
    }

    /// Serve a range from this src pad's getrange hook.
    pub fn get_range(&self, offset: u64, size: usize) -> std::result::Result<Buffer, FlowError> {
        if self.inner.direction != PadDirection::Src {
            error!(pad = %self.inner.name, "get_range called on a sink pad");
            return Err(FlowError::Error);
        }
        {
            let state = self.inner.state.lock().unwrap();
            if state.flushing {
                return Err(FlowError::Flushing);
            }
            if state.eos {
                return Err(FlowError::Eos);
            }
        }
        let getrange = self.inner.hooks.lock().unwrap().getrange.clone();
        match getrange {
            Some(getrange) => getrange(self, offset, size),
            None => {
                error!(pad = %self.inner.name, "no getrange hook installed");
                Err(FlowError::Error)
            }
        }
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Send an event downstream from this src pad.
    ///
    /// Sticky events are stored latest-wins and delivered to the peer in
    /// precedence order before the next buffer; storing succeeds even
    /// while unlinked. The flush pair is handled out of band: flush-start
    /// passes a flushing pad and turns both pads flushing, flush-stop
    /// clears flushing (and the sticky store, with `reset_time`) on both.
    pub fn push_event(&self, event: Event) -> std::result::Result<(), FlowError> {
        if self.inner.direction != PadDirection::Src {
            error!(pad = %self.inner.name, "push_event called on a sink pad");
            return Err(FlowError::Error);
        }
        let etype = event.event_type();

        match etype {
            EventType::FlushStart => {
                self.inner.state.lock().unwrap().flushing = true;
                self.fire_unlock();
                if let Some(peer) = self.peer() {
                    peer.send_event(event)?;
                }
                Ok(())
            }
            EventType::FlushStop => {
                let reset_time = matches!(event, Event::FlushStop { reset_time: true });
                {
                    let mut state = self.inner.state.lock().unwrap();
                    state.flushing = false;
                    state.eos = false;
                    if reset_time {
                        state.sticky.clear();
                        state.events_pending = false;
                    }
                }
                if let Some(peer) = self.peer() {
                    peer.send_event(event)?;
                }
                Ok(())
            }
            _ => {
                let peer = {
                    let mut state = self.inner.state.lock().unwrap();
                    if state.flushing {
                        return Err(FlowError::Flushing);
                    }
                    if state.eos && etype != EventType::StreamStart {
                        return Err(FlowError::Eos);
                    }
                    if event.is_sticky() {
                        store_sticky(&mut state, event.clone());
                        state.events_pending = true;
                        match etype {
                            EventType::Eos => state.eos = true,
                            EventType::StreamStart => state.eos = false,
                            _ => {}
                        }
                    }
                    state.peer.as_ref().and_then(Weak::upgrade)
                };

                trace!(pad = %self.inner.name, event = event.name(), "push event");
                match peer {
                    Some(peer) => {
                        if event.is_sticky() {
                            // Delivered as part of the replay, in order
                            // with every other pending sticky. A delivery
                            // failure keeps it pending for the next try.
                            if let Err(e) = self.forward_stickies(&peer) {
                                trace!(pad = %self.inner.name, error = %e, "sticky replay deferred");
                            }
                            Ok(())
                        } else {
                            self.forward_stickies(&peer)?;
                            Pad::from_inner(peer).send_event(event)
                        }
                    }
                    None if event.is_sticky() => Ok(()),
                    None => Err(FlowError::NotLinked),
                }
            }
        }
    }

    /// Deliver an event into this sink pad.
    ///
    /// Entry point of downstream event flow. The acceptor gates caps
    /// events; the event hook sees every delivered event and may reject
    /// it; accepted sticky events are stored on this pad too, observable
    /// via [`sticky_event`](Self::sticky_event).
    pub fn send_event(&self, event: Event) -> std::result::Result<(), FlowError> {
        if self.inner.direction != PadDirection::Sink {
            error!(pad = %self.inner.name, "send_event called on a src pad");
            return Err(FlowError::Error);
        }
        let etype = event.event_type();

        match etype {
            EventType::FlushStart => {
                self.inner.state.lock().unwrap().flushing = true;
                self.fire_unlock();
                debug!(pad = %self.inner.name, "flush start");
                self.call_event_hook(&event)?;
                crate::metrics::record_pad_event(&self.inner.name, event.name());
                Ok(())
            }
            EventType::FlushStop => {
                let reset_time = matches!(event, Event::FlushStop { reset_time: true });
                {
                    let mut state = self.inner.state.lock().unwrap();
                    state.flushing = false;
                    state.eos = false;
                    if reset_time {
                        state.sticky.clear();
                    }
                }
                debug!(pad = %self.inner.name, reset_time, "flush stop");
                self.call_event_hook(&event)?;
                crate::metrics::record_pad_event(&self.inner.name, event.name());
                Ok(())
            }
            _ => {
                {
                    let state = self.inner.state.lock().unwrap();
                    if state.flushing {
                        return Err(FlowError::Flushing);
                    }
                    if state.eos && etype != EventType::StreamStart {
                        return Err(FlowError::Eos);
                    }
                }

                if let Event::Caps { caps } = &event {
                    let acceptor = self.inner.hooks.lock().unwrap().acceptor.clone();
                    if let Some(acceptor) = acceptor {
                        if !acceptor(caps) {
                            warn!(pad = %self.inner.name, %caps, "caps refused");
                            return Err(FlowError::NotNegotiated);
                        }
                    }
                }

                self.call_event_hook(&event)?;

                if event.is_sticky() {
                    let mut state = self.inner.state.lock().unwrap();
                    match etype {
                        EventType::Eos => state.eos = true,
                        EventType::StreamStart => state.eos = false,
                        _ => {}
                    }
                    store_sticky(&mut state, event.clone());
                }
                trace!(pad = %self.inner.name, event = event.name(), "event delivered");
                crate::metrics::record_pad_event(&self.inner.name, event.name());
                Ok(())
            }
        }
    }

    fn call_event_hook(&self, event: &Event) -> std::result::Result<(), FlowError> {
        let hook = self.inner.hooks.lock().unwrap().event.clone();
        if let Some(hook) = hook {
            if !hook(self, event) {
                warn!(pad = %self.inner.name, event = event.name(), "event rejected by hook");
                return Err(FlowError::Error);
            }
        }
        Ok(())
    }

    /// Deliver every sticky event the peer has not seen, in precedence
    /// order. Pending state clears only when the whole replay lands and
    /// no new sticky was stored meanwhile.
    fn forward_stickies(&self, peer: &Arc<PadInner>) -> std::result::Result<(), FlowError> {
        let (events, serial) = {
            let state = self.inner.state.lock().unwrap();
            if !state.events_pending {
                return Ok(());
            }
            (state.sticky.to_vec(), state.sticky_serial)
        };

        let peer = Pad::from_inner(peer.clone());
        for event in events {
            trace!(pad = %self.inner.name, event = event.name(), "replaying sticky");
            peer.send_event(event)?;
        }

        let mut state = self.inner.state.lock().unwrap();
        if state.sticky_serial == serial {
            state.events_pending = false;
        }
        Ok(())
    }

    /// The stored sticky event of a type, if any.
    pub fn sticky_event(&self, etype: EventType) -> Option<Event> {
        self.inner
            .state
            .lock()
            .unwrap()
            .sticky
            .iter()
            .find(|e| e.event_type() == etype)
            .cloned()
    }

    /// All stored sticky events, in replay order.
    pub fn sticky_events(&self) -> Vec<Event> {
        self.inner.state.lock().unwrap().sticky.to_vec()
    }
}

fn store_sticky(state: &mut PadState, event: Event) {
    let etype = event.event_type();
    state.sticky_serial += 1;
    if etype == EventType::StreamStart {
        // A new stream obsoletes the previous end-of-stream marker.
        state.sticky.retain(|e| e.event_type() != EventType::Eos);
    }
    match state.sticky.iter().position(|e| e.event_type() == etype) {
        Some(i) => state.sticky[i] = event,
        None => {
            let at = state
                .sticky
                .iter()
                .position(|e| e.event_type() > etype)
                .unwrap_or(state.sticky.len());
            state.sticky.insert(at, event);
        }
    }
}
