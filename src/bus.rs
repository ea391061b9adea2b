//! Message bus for asynchronous element-to-application signaling.
//!
//! Elements post [`Message`]s (state changes, errors, end of stream) and
//! the application observes them from any thread or task. Posting never
//! blocks: slow receivers lag and skip old messages rather than back up
//! the streaming threads.

use std::fmt;
use std::future::Future;
use tokio::sync::broadcast;
use tracing::{error, warn};

use crate::element::State;

/// Classification of a posted error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// A state transition failed.
    State,
    /// The data plane failed fatally.
    Flow,
    /// Buffer allocation or pool lifecycle failure.
    Pool,
    /// Clock or synchronization failure.
    Clock,
    /// A resource outside the pipeline failed.
    Resource,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::State => "state",
            ErrorCode::Flow => "flow",
            ErrorCode::Pool => "pool",
            ErrorCode::Clock => "clock",
            ErrorCode::Resource => "resource",
        };
        f.write_str(name)
    }
}

/// Messages posted by elements during operation.
#[derive(Debug, Clone)]
pub enum Message {
    /// An element committed a state transition.
    StateChanged {
        /// Name of the element.
        element: String,
        /// State before the transition.
        old: State,
        /// State after the transition.
        new: State,
        /// Remaining target when mid-walk, None when settled.
        pending: Option<State>,
    },

    /// An element finished an asynchronous state transition.
    AsyncDone {
        /// Name of the element.
        element: String,
    },

    /// An element reached end of stream.
    Eos {
        /// Name of the element.
        element: String,
    },

    /// A fatal error occurred in an element.
    Error {
        /// Name of the element.
        element: String,
        /// Error classification.
        code: ErrorCode,
        /// Human-readable description.
        message: String,
    },

    /// A non-fatal issue occurred in an element.
    Warning {
        /// Name of the element.
        element: String,
        /// Human-readable description.
        message: String,
    },
}

impl Message {
    /// Stable lowercase name of the message kind, for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::StateChanged { .. } => "state-changed",
            Message::AsyncDone { .. } => "async-done",
            Message::Eos { .. } => "eos",
            Message::Error { .. } => "error",
            Message::Warning { .. } => "warning",
        }
    }

    /// Name of the element the message is about.
    pub fn element(&self) -> &str {
        match self {
            Message::StateChanged { element, .. }
            | Message::AsyncDone { element }
            | Message::Eos { element }
            | Message::Error { element, .. }
            | Message::Warning { element, .. } => element,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::StateChanged {
                element,
                old,
                new,
                pending,
            } => match pending {
                Some(pending) => write!(
                    f,
                    "{}: {:?} -> {:?} (pending {:?})",
                    element, old, new, pending
                ),
                None => write!(f, "{}: {:?} -> {:?}", element, old, new),
            },
            Message::AsyncDone { element } => write!(f, "{}: async done", element),
            Message::Eos { element } => write!(f, "{}: EOS", element),
            Message::Error {
                element,
                code,
                message,
            } => write!(f, "Error ({}) in {}: {}", code, element, message),
            Message::Warning { element, message } => {
                write!(f, "Warning in {}: {}", element, message)
            }
        }
    }
}

/// Posting side of a message bus.
///
/// Clones share the channel. Dropping every receiver does not make
/// posting fail; messages are simply discarded.
#[derive(Clone)]
pub struct Bus {
    sender: broadcast::Sender<Message>,
}

impl Bus {
    /// Create a bus with the given buffered capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Post a message.
    ///
    /// Returns the number of receivers that will see it. Returns 0 when
    /// nobody is subscribed (which is fine).
    pub fn post(&self, message: Message) -> usize {
        match &message {
            Message::Error {
                element,
                code,
                message,
            } => error!(element = %element, %code, %message, "bus error"),
            Message::Warning { element, message } => {
                warn!(element = %element, %message, "bus warning")
            }
            _ => {}
        }
        crate::metrics::record_bus_message(message.kind());
        self.sender.send(message).unwrap_or(0)
    }

    /// Create a receiver for messages posted after this call.
    pub fn subscribe(&self) -> BusReceiver {
        BusReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Create a stream of messages.
    pub fn stream(&self) -> BusStream {
        BusStream::new(self.subscribe())
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(256) // Default capacity
    }
}

/// Receiving side of a message bus.
///
/// Multiple receivers can subscribe to a single bus.
pub struct BusReceiver {
    receiver: broadcast::Receiver<Message>,
}

impl BusReceiver {
    /// Receive the next message.
    ///
    /// Returns `None` if every bus handle has been dropped.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    // We missed some messages, continue to get the next one
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive a message without blocking.
    ///
    /// Returns `None` if nothing is pending or the bus is gone.
    pub fn try_recv(&mut self) -> Option<Message> {
        loop {
            match self.receiver.try_recv() {
                Ok(message) => return Some(message),
                Err(broadcast::error::TryRecvError::Lagged(_)) => {
                    // We missed some messages, try again
                    continue;
                }
                Err(_) => return None,
            }
        }
    }

    /// Wait for end of stream.
    ///
    /// Returns `Ok(())` on EOS, `Err(description)` on a posted error.
    pub async fn wait_eos(&mut self) -> Result<(), String> {
        while let Some(message) = self.recv().await {
            match message {
                Message::Eos { .. } => return Ok(()),
                Message::Error { .. } => return Err(message.to_string()),
                _ => continue,
            }
        }
        Err("Message bus closed unexpectedly".to_string())
    }

    /// Wait for an asynchronous state change to finish.
    ///
    /// Returns the element's name on `AsyncDone`, `Err(description)` on a
    /// posted error.
    pub async fn wait_async_done(&mut self) -> Result<String, String> {
        while let Some(message) = self.recv().await {
            match message {
                Message::AsyncDone { element } => return Ok(element),
                Message::Error { .. } => return Err(message.to_string()),
                _ => continue,
            }
        }
        Err("Message bus closed unexpectedly".to_string())
    }
}

/// A stream adapter for receiving messages.
///
/// Implements `Stream` for use with async iteration.
pub struct BusStream {
    receiver: BusReceiver,
}

impl BusStream {
    /// Create a new message stream from a receiver.
    pub fn new(receiver: BusReceiver) -> Self {
        Self { receiver }
    }
}

impl futures::Stream for BusStream {
    type Item = Message;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        // Use a pinned future for the async recv
        let fut = self.receiver.recv();
        tokio::pin!(fut);
        fut.poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_post_recv() {
        let bus = Bus::new(16);
        let mut receiver = bus.subscribe();

        bus.post(Message::Eos {
            element: "sink".to_string(),
        });

        let message = receiver.recv().await.unwrap();
        assert!(matches!(message, Message::Eos { .. }));
        assert_eq!(message.element(), "sink");
    }

    #[tokio::test]
    async fn test_multiple_receivers() {
        let bus = Bus::new(16);
        let mut receiver1 = bus.subscribe();
        let mut receiver2 = bus.subscribe();

        bus.post(Message::StateChanged {
            element: "demux".to_string(),
            old: State::Ready,
            new: State::Paused,
            pending: Some(State::Playing),
        });

        // Both receivers should get the message
        let m1 = receiver1.recv().await.unwrap();
        let m2 = receiver2.recv().await.unwrap();

        assert!(matches!(m1, Message::StateChanged { .. }));
        assert!(matches!(m2, Message::StateChanged { .. }));
    }

    #[tokio::test]
    async fn test_wait_eos() {
        let bus = Bus::new(16);
        let mut receiver = bus.subscribe();

        let poster = bus.clone();
        tokio::spawn(async move {
            poster.post(Message::StateChanged {
                element: "src".to_string(),
                old: State::Null,
                new: State::Ready,
                pending: None,
            });
            poster.post(Message::Eos {
                element: "sink".to_string(),
            });
        });

        assert!(receiver.wait_eos().await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_eos_error() {
        let bus = Bus::new(16);
        let mut receiver = bus.subscribe();

        let poster = bus.clone();
        tokio::spawn(async move {
            poster.post(Message::Error {
                element: "sink".to_string(),
                code: ErrorCode::Flow,
                message: "stream broke".to_string(),
            });
        });

        let result = receiver.wait_eos().await;
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("stream broke"));
    }

    #[tokio::test]
    async fn test_wait_async_done() {
        let bus = Bus::new(16);
        let mut receiver = bus.subscribe();

        let poster = bus.clone();
        tokio::spawn(async move {
            poster.post(Message::AsyncDone {
                element: "sink".to_string(),
            });
        });

        assert_eq!(receiver.wait_async_done().await.unwrap(), "sink");
    }

    #[tokio::test]
    async fn test_stream_adapter() {
        use futures::StreamExt;

        let bus = Bus::new(16);
        let mut stream = bus.stream();

        bus.post(Message::Eos {
            element: "sink".to_string(),
        });
        bus.post(Message::AsyncDone {
            element: "demux".to_string(),
        });

        let first = stream.next().await.unwrap();
        assert_eq!(first.kind(), "eos");
        let second = stream.next().await.unwrap();
        assert_eq!(second.element(), "demux");
    }

    #[test]
    fn test_try_recv_empty() {
        let bus = Bus::new(16);
        let mut receiver = bus.subscribe();
        assert!(receiver.try_recv().is_none());

        bus.post(Message::Eos {
            element: "sink".to_string(),
        });
        assert!(receiver.try_recv().is_some());
    }

    #[test]
    fn test_post_without_receivers() {
        let bus = Bus::new(16);
        assert_eq!(
            bus.post(Message::Eos {
                element: "sink".to_string()
            }),
            0
        );
    }

    #[test]
    fn test_message_display() {
        let message = Message::Error {
            element: "mux".to_string(),
            code: ErrorCode::Pool,
            message: "exhausted".to_string(),
        };
        assert_eq!(format!("{}", message), "Error (pool) in mux: exhausted");

        let message = Message::Eos {
            element: "sink".to_string(),
        };
        assert_eq!(format!("{}", message), "sink: EOS");
    }
}
