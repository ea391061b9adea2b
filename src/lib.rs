//! # Sluice
//!
//! A streaming pipeline scheduling core: element state machine, pad
//! data-flow with push and pull modes, bounded buffer pools, and a
//! calibratable pipeline clock.
//!
//! Sluice is the layer underneath a media framework. It knows nothing about
//! formats or codecs; it moves opaque buffers between pads, walks elements
//! through `Null ⇄ Ready ⇄ Paused ⇄ Playing`, prerolls asynchronously, and
//! keeps distributed clocks in agreement.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sluice::prelude::*;
//!
//! let clock = Clock::system();
//! let element = Element::new("source", MyImpl::default());
//! element.set_clock(Some(clock.clone()));
//!
//! element.set_state(State::Playing)?;
//! let (result, current, _pending) = element.get_state(ClockTime::from_secs(5));
//! assert_eq!(current, State::Playing);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod bus;
pub mod clock;
pub mod element;
pub mod error;
pub mod event;
pub mod flow;
pub mod metrics;
pub mod pad;
pub mod pool;
pub mod task;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::buffer::{Buffer, BufferFlags, BufferMeta};
    pub use crate::bus::{Bus, Message};
    pub use crate::clock::{Clock, ClockId, ClockReturn, ClockTime, ClockTimeDiff};
    pub use crate::element::{
        Element, ElementImpl, State, StateChange, StateChangeError, StateChangeResult,
        StateChangeSuccess,
    };
    pub use crate::error::{Error, Result};
    pub use crate::event::{Event, EventType, Segment};
    pub use crate::flow::{FlowError, FlowResult, FlowSuccess};
    pub use crate::pad::{Pad, PadDirection, PadMode};
    pub use crate::pool::{AcquireParams, BufferPool, PoolConfig};
    pub use crate::task::{Task, TaskPoll, TaskState};
}

pub use error::{Error, Result};
