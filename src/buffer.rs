//! Buffers: the unit of data flow.
//!
//! A [`Buffer`] owns a chunk of bytes plus [`BufferMeta`] timing metadata.
//! Buffers acquired from a [`BufferPool`](crate::pool::BufferPool) carry a
//! claim back to their pool; dropping the buffer returns the storage for
//! reuse. Detach with [`Buffer::copy_deep`] when data must outlive the
//! pool.

use bytes::BytesMut;

use crate::clock::ClockTime;
use crate::pool::PoolClaim;

/// Offset value meaning "no offset known".
pub const OFFSET_NONE: u64 = u64::MAX;

// ============================================================================
// BufferFlags
// ============================================================================

/// Per-buffer marker flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct BufferFlags(u32);

impl BufferFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Buffer is the first after a discontinuity in the stream.
    pub const DISCONT: Self = Self(1 << 0);
    /// Buffer can be decoded independently of earlier data.
    pub const SYNC_POINT: Self = Self(1 << 1);
    /// Buffer carries no data, only a span of stream time.
    pub const GAP: Self = Self(1 << 2);
    /// Buffer data is known to be damaged.
    pub const CORRUPTED: Self = Self(1 << 3);

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
// BufferMeta
// ============================================================================

/// Timing and ordering metadata attached to a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferMeta {
    /// Presentation timestamp.
    pub pts: ClockTime,
    /// Decode timestamp.
    pub dts: ClockTime,
    /// Duration covered by this buffer.
    pub duration: ClockTime,
    /// Byte or sample offset in the stream, [`OFFSET_NONE`] if unknown.
    pub offset: u64,
    /// Monotonic sequence number assigned by the producer.
    pub sequence: u64,
    /// Marker flags.
    pub flags: BufferFlags,
}

impl Default for BufferMeta {
    fn default() -> Self {
        Self {
            pts: ClockTime::NONE,
            dts: ClockTime::NONE,
            duration: ClockTime::NONE,
            offset: OFFSET_NONE,
            sequence: 0,
            flags: BufferFlags::NONE,
        }
    }
}

// ============================================================================
// Buffer
// ============================================================================

/// A chunk of stream data with metadata.
///
/// # Example
///
/// ```rust
/// use sluice::buffer::{Buffer, BufferFlags};
/// use sluice::clock::ClockTime;
///
/// let buf = Buffer::from_data(&b"payload"[..])
///     .with_pts(ClockTime::from_millis(40))
///     .with_flags(BufferFlags::SYNC_POINT);
///
/// assert_eq!(buf.len(), 7);
/// assert_eq!(buf.meta().pts, ClockTime::from_millis(40));
/// ```
pub struct Buffer {
    /// None only transiently during drop.
    data: Option<BytesMut>,
    meta: BufferMeta,
    claim: Option<PoolClaim>,
}

impl Buffer {
    /// Create an unpooled, zero-filled buffer of `size` bytes.
    pub fn with_size(size: usize) -> Self {
        let mut data = BytesMut::with_capacity(size);
        data.resize(size, 0);
        Self {
            data: Some(data),
            meta: BufferMeta::default(),
            claim: None,
        }
    }

    /// Create an unpooled buffer from existing bytes.
    pub fn from_data(data: impl Into<BytesMut>) -> Self {
        Self {
            data: Some(data.into()),
            meta: BufferMeta::default(),
            claim: None,
        }
    }

    /// Create a buffer whose storage belongs to a pool.
    pub(crate) fn from_pool(data: BytesMut, claim: PoolClaim) -> Self {
        Self {
            data: Some(data),
            meta: BufferMeta::default(),
            claim: Some(claim),
        }
    }

    /// Read access to the payload.
    #[inline]
    pub fn data(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }

    /// Write access to the payload.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }

    /// Payload length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.as_ref().map_or(0, |d| d.len())
    }

    /// Check if the payload is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The buffer's metadata.
    #[inline]
    pub fn meta(&self) -> &BufferMeta {
        &self.meta
    }

    /// Mutable access to the buffer's metadata.
    #[inline]
    pub fn meta_mut(&mut self) -> &mut BufferMeta {
        &mut self.meta
    }

    /// Whether the storage returns to a pool on drop.
    #[inline]
    pub fn is_pooled(&self) -> bool {
        self.claim.is_some()
    }

    /// Set the presentation timestamp.
    pub fn with_pts(mut self, pts: ClockTime) -> Self {
        self.meta.pts = pts;
        self
    }

    /// Set the decode timestamp.
    pub fn with_dts(mut self, dts: ClockTime) -> Self {
        self.meta.dts = dts;
        self
    }

    /// Set the duration.
    pub fn with_duration(mut self, duration: ClockTime) -> Self {
        self.meta.duration = duration;
        self
    }

    /// Set the stream offset.
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.meta.offset = offset;
        self
    }

    /// Set the sequence number.
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.meta.sequence = sequence;
        self
    }

    /// Set marker flags.
    pub fn with_flags(mut self, flags: BufferFlags) -> Self {
        self.meta.flags = flags;
        self
    }

    /// Deep-copy into an unpooled buffer, keeping metadata.
    ///
    /// The copy has no pool claim, so it can outlive the pool the
    /// original came from.
    pub fn copy_deep(&self) -> Buffer {
        Buffer {
            data: Some(BytesMut::from(self.data())),
            meta: self.meta,
            claim: None,
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(claim) = self.claim.take() {
            if let Some(data) = self.data.take() {
                claim.release(data);
            }
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len())
            .field("pts", &self.meta.pts)
            .field("sequence", &self.meta.sequence)
            .field("pooled", &self.is_pooled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_size_zero_filled() {
        let buf = Buffer::with_size(16);
        assert_eq!(buf.len(), 16);
        assert!(buf.data().iter().all(|&b| b == 0));
        assert!(!buf.is_pooled());
    }

    #[test]
    fn test_from_data_and_mutation() {
        let mut buf = Buffer::from_data(&b"abc"[..]);
        assert_eq!(buf.data(), b"abc");
        buf.data_mut()[0] = b'x';
        assert_eq!(buf.data(), b"xbc");
    }

    #[test]
    fn test_meta_builders() {
        let buf = Buffer::from_data(&b"z"[..])
            .with_pts(ClockTime::from_millis(10))
            .with_dts(ClockTime::from_millis(8))
            .with_duration(ClockTime::from_millis(2))
            .with_offset(512)
            .with_sequence(7)
            .with_flags(BufferFlags::DISCONT.union(BufferFlags::SYNC_POINT));

        let meta = buf.meta();
        assert_eq!(meta.pts, ClockTime::from_millis(10));
        assert_eq!(meta.dts, ClockTime::from_millis(8));
        assert_eq!(meta.duration, ClockTime::from_millis(2));
        assert_eq!(meta.offset, 512);
        assert_eq!(meta.sequence, 7);
        assert!(meta.flags.contains(BufferFlags::DISCONT));
        assert!(meta.flags.contains(BufferFlags::SYNC_POINT));
        assert!(!meta.flags.contains(BufferFlags::GAP));
    }

    #[test]
    fn test_default_meta_is_unset() {
        let meta = BufferMeta::default();
        assert!(meta.pts.is_none());
        assert!(meta.dts.is_none());
        assert!(meta.duration.is_none());
        assert_eq!(meta.offset, OFFSET_NONE);
    }

    #[test]
    fn test_copy_deep_detaches() {
        let original = Buffer::from_data(&b"data"[..]).with_sequence(3);
        let mut copy = original.copy_deep();

        copy.data_mut()[0] = b'D';
        assert_eq!(original.data(), b"data");
        assert_eq!(copy.data(), b"Data");
        assert_eq!(copy.meta().sequence, 3);
        assert!(!copy.is_pooled());
    }

    #[test]
    fn test_flag_ops() {
        let f = BufferFlags::NONE.insert(BufferFlags::GAP);
        assert!(f.contains(BufferFlags::GAP));
        let f = f.remove(BufferFlags::GAP);
        assert!(!f.contains(BufferFlags::GAP));
        assert_eq!(f, BufferFlags::NONE);
    }
}
