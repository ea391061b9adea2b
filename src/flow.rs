//! Data-flow results passed along pad chains.
//!
//! Every push and pull on a pad resolves to a [`FlowResult`]. Success means
//! the buffer was consumed (or produced); the error side carries the
//! sentinels that make a pipeline steerable: a flushing pad rejects data
//! without that being a programming error, an EOS pad refuses more input,
//! an unlinked pad reports `NotLinked`.
//!
//! ```text
//! src.push(buf) ──> peer chain fn ──> Ok(FlowSuccess::Ok)
//!                        │
//!                        └──────────> Err(FlowError::Flushing)   (expected)
//!                        └──────────> Err(FlowError::Error)      (fatal)
//! ```
//!
//! Sentinels propagate upstream with `?` until a streaming loop decides to
//! pause, stop, or tear down. Only [`FlowError::Error`] is fatal, and the
//! element that first produces it must post an error message on the bus
//! before returning it.

use std::fmt;

/// Successful outcome of a pad data-flow operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowSuccess {
    /// Data was accepted (push) or produced (pull).
    #[default]
    Ok,
}

/// Non-success outcome of a pad data-flow operation.
///
/// Ordered roughly by severity; everything except [`FlowError::Error`] is
/// an expected signal that steers scheduling rather than reporting a bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowError {
    /// Pad has no peer.
    NotLinked,

    /// Pad is flushing or inactive; the buffer was not consumed.
    ///
    /// Also returned by pool acquisition when the pool is being shut down
    /// or a non-waiting acquire finds it exhausted.
    Flushing,

    /// Pad already saw end-of-stream; no further data is accepted.
    Eos,

    /// Peer refused the stream's caps; reconfiguration is required.
    NotNegotiated,

    /// Fatal error. The producer must post an error message on the bus
    /// before returning this.
    Error,
}

/// Result of a pad data-flow operation.
pub type FlowResult = std::result::Result<FlowSuccess, FlowError>;

impl FlowError {
    /// Check whether this sentinel means the pipeline is broken, as
    /// opposed to being reconfigured or shut down.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, FlowError::Error | FlowError::NotNegotiated)
    }

    /// Check whether this sentinel is part of normal shutdown or flush
    /// handling and should be silently absorbed by streaming loops.
    #[inline]
    pub fn is_expected(&self) -> bool {
        matches!(self, FlowError::Flushing | FlowError::Eos)
    }

    /// Stable lowercase name, for logs and messages.
    pub fn name(&self) -> &'static str {
        match self {
            FlowError::NotLinked => "not-linked",
            FlowError::Flushing => "flushing",
            FlowError::Eos => "eos",
            FlowError::NotNegotiated => "not-negotiated",
            FlowError::Error => "error",
        }
    }
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::error::Error for FlowError {}
