//! Growable byte accumulator with big-endian integer codecs.
//!
//! `ByteBuffer` is the staging area services use to build outbound frames and
//! to collect partial inbound frames until a whole one has arrived. The write
//! cursor is the end of the underlying `BytesMut`; the read cursor is its
//! start, advanced as values are consumed. Reads never go past the write
//! cursor.
//!
//! All integers are big-endian and fixed-width. Framing is the caller's job.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::BufferError;

/// Default initial capacity for a new buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Byte accumulator with read/write cursors.
///
/// Not synchronized. Wrap it in a lock if it must be shared (as
/// [`crate::Connection::buffer`] does).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ByteBuffer {
    buf: BytesMut,
}

impl ByteBuffer {
    /// Create an empty buffer with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }

    /// Create an empty buffer able to hold `capacity` bytes before growing.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: BytesMut::with_capacity(capacity) }
    }

    /// Number of readable bytes (distance between the cursors).
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when there is nothing left to read.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes the buffer can hold without reallocating.
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Discard all readable bytes, keeping the allocation.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Readable bytes, without consuming them.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Append raw bytes.
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Append a UTF-8 string without any length prefix.
    pub fn write_str(&mut self, s: &str) {
        self.buf.extend_from_slice(s.as_bytes());
    }

    /// Append one byte.
    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    /// Append a big-endian `u16`.
    pub fn write_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    /// Append a big-endian `u32`.
    pub fn write_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    /// Append a big-endian `u64`.
    pub fn write_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    /// Consume one byte.
    pub fn read_u8(&mut self) -> Result<u8, BufferError> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    /// Consume a big-endian `u16`.
    pub fn read_u16(&mut self) -> Result<u16, BufferError> {
        self.ensure(2)?;
        Ok(self.buf.get_u16())
    }

    /// Consume a big-endian `u32`.
    pub fn read_u32(&mut self) -> Result<u32, BufferError> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    /// Consume a big-endian `u64`.
    pub fn read_u64(&mut self) -> Result<u64, BufferError> {
        self.ensure(8)?;
        Ok(self.buf.get_u64())
    }

    /// Read a big-endian `u32` without consuming it.
    ///
    /// Handy for length-prefixed framing: peek the length, then wait until
    /// `len() >= 4 + length` before splitting the frame off.
    pub fn peek_u32(&self) -> Result<u32, BufferError> {
        self.ensure(4)?;
        let mut head = &self.buf[..4];
        Ok(head.get_u32())
    }

    /// Consume exactly `n` bytes.
    pub fn read_bytes(&mut self, n: usize) -> Result<Bytes, BufferError> {
        self.ensure(n)?;
        Ok(self.buf.split_to(n).freeze())
    }

    /// Split off the first `n` readable bytes as an independent buffer.
    pub fn split_to(&mut self, n: usize) -> Result<ByteBuffer, BufferError> {
        self.ensure(n)?;
        Ok(Self { buf: self.buf.split_to(n) })
    }

    /// Take every readable byte, leaving the buffer empty.
    pub fn take_all(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    fn ensure(&self, needed: usize) -> Result<(), BufferError> {
        let available = self.buf.len();
        if available < needed {
            return Err(BufferError::Underflow { needed, available });
        }
        Ok(())
    }
}

impl From<&[u8]> for ByteBuffer {
    fn from(data: &[u8]) -> Self {
        Self { buf: BytesMut::from(data) }
    }
}

impl AsRef<[u8]> for ByteBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn integers_are_big_endian() {
        let mut buf = ByteBuffer::new();
        buf.write_u16(0x0102);
        buf.write_u32(0x0304_0506);
        buf.write_u64(0x0708_090a_0b0c_0d0e);

        assert_eq!(buf.as_slice(), &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14]);
    }

    #[test]
    fn reads_consume_in_write_order() {
        let mut buf = ByteBuffer::new();
        buf.write_u8(7);
        buf.write_u16(513);
        buf.write_u32(70_000);
        buf.write_u64(u64::MAX - 1);
        buf.write_str("hi");

        assert_eq!(buf.read_u8().unwrap(), 7);
        assert_eq!(buf.read_u16().unwrap(), 513);
        assert_eq!(buf.read_u32().unwrap(), 70_000);
        assert_eq!(buf.read_u64().unwrap(), u64::MAX - 1);
        assert_eq!(&buf.read_bytes(2).unwrap()[..], b"hi");
        assert!(buf.is_empty());
    }

    #[test]
    fn underflow_consumes_nothing() {
        let mut buf = ByteBuffer::from(&[0xAA, 0xBB, 0xCC][..]);

        let err = buf.read_u32().unwrap_err();
        assert_eq!(err, BufferError::Underflow { needed: 4, available: 3 });
        assert_eq!(buf.len(), 3);

        assert_eq!(buf.read_u16().unwrap(), 0xAABB);
        assert_eq!(buf.read_u8().unwrap(), 0xCC);
        assert!(matches!(buf.read_u8(), Err(BufferError::Underflow { needed: 1, available: 0 })));
    }

    #[test]
    fn peek_does_not_advance() {
        let mut buf = ByteBuffer::new();
        buf.write_u32(5);
        buf.write_bytes(b"hello");

        assert_eq!(buf.peek_u32().unwrap(), 5);
        assert_eq!(buf.len(), 9);

        let len = buf.read_u32().unwrap() as usize;
        let frame = buf.split_to(len).unwrap();
        assert_eq!(frame.as_slice(), b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn clear_keeps_capacity() {
        let mut buf = ByteBuffer::with_capacity(64);
        buf.write_bytes(&[1; 32]);
        let cap = buf.capacity();

        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), cap);
    }

    #[test]
    fn take_all_empties_buffer() {
        let mut buf = ByteBuffer::new();
        buf.write_bytes(b"abc");

        let taken = buf.take_all();
        assert_eq!(&taken[..], b"abc");
        assert!(buf.is_empty());
    }

    proptest! {
        /// Property: reads never go past the write cursor, whatever the mix
        /// of widths requested.
        #[test]
        fn prop_reads_never_pass_write_cursor(
            data in proptest::collection::vec(any::<u8>(), 0..64),
            widths in proptest::collection::vec(
                prop_oneof![Just(1usize), Just(2), Just(4), Just(8)],
                0..32,
            ),
        ) {
            let mut buf = ByteBuffer::from(&data[..]);
            let mut consumed = 0usize;

            for width in widths {
                let before = buf.len();
                let ok = match width {
                    1 => buf.read_u8().is_ok(),
                    2 => buf.read_u16().is_ok(),
                    4 => buf.read_u32().is_ok(),
                    _ => buf.read_u64().is_ok(),
                };
                if ok {
                    consumed += width;
                    prop_assert_eq!(buf.len(), before - width);
                } else {
                    prop_assert!(before < width);
                    prop_assert_eq!(buf.len(), before);
                }
            }

            prop_assert_eq!(consumed + buf.len(), data.len());
        }
    }
}
