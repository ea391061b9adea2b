//! State vocabulary for the element state machine.
//!
//! Elements live on the ordered ladder `Null < Ready < Paused < Playing`
//! and only ever move one rung at a time. [`StateChange`] names the six
//! adjacent transitions; a multi-rung request is expanded into a sequence
//! of them by [`step_towards`](StateChange::step_towards).

use std::fmt;

// ============================================================================
// State
// ============================================================================

/// The four element states, in ascending order of liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum State {
    /// Initial state; no resources held.
    #[default]
    Null,
    /// Resources for operation are allocated.
    Ready,
    /// Pads are active and data can preroll, but the clock does not run.
    Paused,
    /// Data flows and the clock runs.
    Playing,
}

impl State {
    /// Stable lowercase name, for logs and messages.
    pub fn name(self) -> &'static str {
        match self {
            State::Null => "null",
            State::Ready => "ready",
            State::Paused => "paused",
            State::Playing => "playing",
        }
    }

    /// The adjacent state one rung toward `target`, or None when already
    /// there.
    pub fn step_towards(self, target: State) -> Option<State> {
        use State::*;
        match self.cmp(&target) {
            std::cmp::Ordering::Equal => None,
            std::cmp::Ordering::Less => Some(match self {
                Null => Ready,
                Ready => Paused,
                _ => Playing,
            }),
            std::cmp::Ordering::Greater => Some(match self {
                Playing => Paused,
                Paused => Ready,
                _ => Null,
            }),
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// StateChange
// ============================================================================

/// One adjacent transition between two [`State`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateChange {
    /// Allocate resources.
    NullToReady,
    /// Activate pads and start prerolling.
    ReadyToPaused,
    /// Start the clock and let data run.
    PausedToPlaying,
    /// Stop the clock; data may still preroll.
    PlayingToPaused,
    /// Deactivate pads and stop streaming.
    PausedToReady,
    /// Release resources.
    ReadyToNull,
}

impl StateChange {
    /// Build the transition between two adjacent states. Returns None for
    /// non-adjacent or identical pairs.
    pub fn between(from: State, to: State) -> Option<Self> {
        use State::*;
        match (from, to) {
            (Null, Ready) => Some(StateChange::NullToReady),
            (Ready, Paused) => Some(StateChange::ReadyToPaused),
            (Paused, Playing) => Some(StateChange::PausedToPlaying),
            (Playing, Paused) => Some(StateChange::PlayingToPaused),
            (Paused, Ready) => Some(StateChange::PausedToReady),
            (Ready, Null) => Some(StateChange::ReadyToNull),
            _ => None,
        }
    }

    /// The next single-step transition on the way from `current` toward
    /// `target`, or None when already there.
    pub fn step_towards(current: State, target: State) -> Option<Self> {
        let next = current.step_towards(target)?;
        StateChange::between(current, next)
    }

    /// The state this transition leaves.
    pub fn from_state(self) -> State {
        match self {
            StateChange::NullToReady => State::Null,
            StateChange::ReadyToPaused => State::Ready,
            StateChange::PausedToPlaying => State::Paused,
            StateChange::PlayingToPaused => State::Playing,
            StateChange::PausedToReady => State::Paused,
            StateChange::ReadyToNull => State::Ready,
        }
    }

    /// The state this transition enters.
    pub fn to_state(self) -> State {
        match self {
            StateChange::NullToReady => State::Ready,
            StateChange::ReadyToPaused => State::Paused,
            StateChange::PausedToPlaying => State::Playing,
            StateChange::PlayingToPaused => State::Paused,
            StateChange::PausedToReady => State::Ready,
            StateChange::ReadyToNull => State::Null,
        }
    }

    /// Whether this transition climbs the ladder.
    #[inline]
    pub fn is_upward(self) -> bool {
        self.to_state() > self.from_state()
    }

    /// Stable name of the transition, for logs and metrics.
    pub fn name(self) -> &'static str {
        match self {
            StateChange::NullToReady => "null-to-ready",
            StateChange::ReadyToPaused => "ready-to-paused",
            StateChange::PausedToPlaying => "paused-to-playing",
            StateChange::PlayingToPaused => "playing-to-paused",
            StateChange::PausedToReady => "paused-to-ready",
            StateChange::ReadyToNull => "ready-to-null",
        }
    }
}

impl fmt::Display for StateChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Results
// ============================================================================

/// Successful outcome of a state change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StateChangeSuccess {
    /// The transition completed.
    #[default]
    Success,
    /// The transition needs more time; completion arrives later via
    /// `get_state` or an `AsyncDone` bus message.
    Async,
    /// The transition completed, but the element is live and cannot
    /// preroll data in `Paused`.
    NoPreroll,
}

/// A state transition failed; the element stays in its last good state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("state change failed")]
pub struct StateChangeError;

/// Outcome of a state change request.
pub type StateChangeResult = Result<StateChangeSuccess, StateChangeError>;
