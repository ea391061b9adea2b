//! Events that flow through pads alongside buffers.
//!
//! Events describe the stream (`StreamStart`, `Caps`, `Segment`, `Tags`,
//! `Eos`) or steer scheduling (`FlushStart`, `FlushStop`). The describing
//! kind is *sticky*: a pad remembers the latest event of each sticky type
//! and replays them to a peer before data flows, so late links and
//! reactivations see a coherent stream preamble.
//!
//! Sticky types have a fixed precedence, the order in which a preamble
//! must arrive: stream-start, caps, segment, tags, eos.

use smallvec::SmallVec;

use crate::clock::ClockTime;

// ============================================================================
// EventType
// ============================================================================

/// Discriminant of an [`Event`].
///
/// Declaration order of the sticky types is their replay precedence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventType {
    /// Start of a new stream.
    StreamStart,
    /// Media type of the stream.
    Caps,
    /// Timeline window for subsequent buffers.
    Segment,
    /// Stream metadata.
    Tags,
    /// End of stream.
    Eos,
    /// Enter flushing: discard data, unblock waiters.
    FlushStart,
    /// Leave flushing: accept data again.
    FlushStop,
    /// Application-defined event.
    Custom,
}

impl EventType {
    /// Whether a pad retains the latest event of this type.
    #[inline]
    pub fn is_sticky(self) -> bool {
        matches!(
            self,
            EventType::StreamStart
                | EventType::Caps
                | EventType::Segment
                | EventType::Tags
                | EventType::Eos
        )
    }

    /// Whether the event travels in-band with the data stream.
    ///
    /// `FlushStart` is out-of-band: it overtakes queued data and is
    /// handled even by flushing pads.
    #[inline]
    pub fn is_serialized(self) -> bool {
        !matches!(self, EventType::FlushStart)
    }

    /// Stable lowercase name, for logs.
    pub fn name(self) -> &'static str {
        match self {
            EventType::StreamStart => "stream-start",
            EventType::Caps => "caps",
            EventType::Segment => "segment",
            EventType::Tags => "tags",
            EventType::Eos => "eos",
            EventType::FlushStart => "flush-start",
            EventType::FlushStop => "flush-stop",
            EventType::Custom => "custom",
        }
    }
}

// ============================================================================
// Caps
// ============================================================================

/// An opaque media-type token.
///
/// Sluice does not interpret caps beyond equality; what a media type
/// means, and whether two are compatible, is the embedder's business
/// (see [`CapsAcceptor`](crate::pad::CapsAcceptor)).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Caps {
    media_type: String,
}

impl Caps {
    /// Create caps for a media type.
    pub fn new(media_type: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
        }
    }

    /// The media type string.
    #[inline]
    pub fn media_type(&self) -> &str {
        &self.media_type
    }
}

impl std::fmt::Display for Caps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.media_type)
    }
}

// ============================================================================
// Segment
// ============================================================================

/// The stream-time window that subsequent buffers belong to.
///
/// Converts positions inside the window to running time: the monotonic
/// timeline that synchronization works against.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Segment {
    /// Playback rate. 1.0 is normal forward playback.
    pub rate: f64,
    /// Start of the window in stream time.
    pub start: ClockTime,
    /// End of the window, NONE for unbounded.
    pub stop: ClockTime,
    /// Current position in stream time.
    pub position: ClockTime,
    /// Running time accumulated by earlier segments.
    pub base: ClockTime,
}

impl Default for Segment {
    fn default() -> Self {
        Self {
            rate: 1.0,
            start: ClockTime::ZERO,
            stop: ClockTime::NONE,
            position: ClockTime::ZERO,
            base: ClockTime::ZERO,
        }
    }
}

impl Segment {
    /// Convert a stream-time position inside the segment to running time.
    ///
    /// Returns NONE for positions outside the segment window, a zero
    /// rate, or NONE inputs.
    pub fn to_running_time(&self, position: ClockTime) -> ClockTime {
        if position.is_none() || self.start.is_none() || self.rate == 0.0 {
            return ClockTime::NONE;
        }
        if position < self.start {
            return ClockTime::NONE;
        }
        if self.stop.is_some() && position > self.stop {
            return ClockTime::NONE;
        }
        let offset = position - self.start;
        let scaled = (offset.nanos() as f64 / self.rate.abs()).round() as u64;
        self.base + ClockTime::from_nanos(scaled)
    }
}

// ============================================================================
// TagList
// ============================================================================

/// Stream metadata as a small key/value list. Inserting an existing key
/// replaces its value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TagList {
    entries: SmallVec<[(String, String); 4]>,
}

impl TagList {
    /// Create an empty tag list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a tag.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    /// Look up a tag.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Number of tags.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the list holds no tags.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(key, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

// ============================================================================
// Event
// ============================================================================

/// An event traveling through the pipeline.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// A new stream begins.
    StreamStart {
        /// Identifier of the stream, unique within the pipeline.
        stream_id: String,
    },
    /// The stream's media type.
    Caps {
        /// The media type token.
        caps: Caps,
    },
    /// The timeline window for subsequent buffers.
    Segment {
        /// The window.
        segment: Segment,
    },
    /// Stream metadata.
    Tags {
        /// The tags.
        tags: TagList,
    },
    /// No more data will arrive on this stream.
    Eos,
    /// Discard pending data and unblock; pads turn flushing.
    FlushStart,
    /// Leave flushing and accept data again.
    FlushStop {
        /// Also forget stream position and stored sticky events.
        reset_time: bool,
    },
    /// Application-defined event.
    Custom {
        /// Identifying name.
        name: String,
    },
}

impl Event {
    /// This event's type discriminant.
    pub fn event_type(&self) -> EventType {
        match self {
            Event::StreamStart { .. } => EventType::StreamStart,
            Event::Caps { .. } => EventType::Caps,
            Event::Segment { .. } => EventType::Segment,
            Event::Tags { .. } => EventType::Tags,
            Event::Eos => EventType::Eos,
            Event::FlushStart => EventType::FlushStart,
            Event::FlushStop { .. } => EventType::FlushStop,
            Event::Custom { .. } => EventType::Custom,
        }
    }

    /// Whether a pad retains this event for replay.
    #[inline]
    pub fn is_sticky(&self) -> bool {
        self.event_type().is_sticky()
    }

    /// Stable lowercase name of the event's type.
    pub fn name(&self) -> &'static str {
        self.event_type().name()
    }
}
