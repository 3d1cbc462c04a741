//! Byte queue used for packet assembly and response building.

use std::cmp;

const DEFAULT_CAPACITY: usize = 2048;

/// A contiguous byte queue with separate read and write cursors.
///
/// Incoming socket data is appended at the write head while the packet
/// parser consumes from the read head. Compaction moves the pending bytes
/// back to the start of the allocation so the backing storage is reused
/// instead of growing without bound.
pub struct Buffer {
    data: Vec<u8>,
    read_head: usize,
    write_head: usize,
    limit: Option<usize>,
}

impl Buffer {
    /// Creates an unbounded buffer. Writes never fail.
    pub fn new() -> Self {
        Buffer {
            data: vec![0; DEFAULT_CAPACITY],
            read_head: 0,
            write_head: 0,
            limit: None,
        }
    }

    /// Creates a buffer that refuses to hold more than `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Buffer {
            data: vec![0; cmp::min(DEFAULT_CAPACITY, limit)],
            read_head: 0,
            write_head: 0,
            limit: Some(limit),
        }
    }

    /// Creates a buffer whose pending contents are `data`.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len();
        Buffer {
            data,
            read_head: 0,
            write_head: len,
            limit: None,
        }
    }

    /// Number of bytes available for reading.
    pub fn read_available(&self) -> usize {
        self.write_head - self.read_head
    }

    /// Appends `data`, growing the backing storage if necessary.
    ///
    /// Returns `false` without writing anything if this buffer is bounded
    /// and the write would exceed its limit.
    pub fn write(&mut self, data: &[u8]) -> bool {
        if !self.ensure_space(data.len()) {
            return false;
        }
        self.data[self.write_head..self.write_head + data.len()].copy_from_slice(data);
        self.write_head += data.len();
        true
    }

    /// Appends a single byte.
    pub fn write_u8(&mut self, byte: u8) -> bool {
        self.write(&[byte])
    }

    /// Appends the UTF-8 bytes of `s`.
    pub fn write_str(&mut self, s: &str) -> bool {
        self.write(s.as_bytes())
    }

    /// Makes room for about `hint` more bytes and returns the writable
    /// tail of the buffer. Call `mark_written` with the number of bytes
    /// actually placed there.
    ///
    /// Unbounded buffers return at least `hint` bytes; bounded buffers may
    /// return less (possibly an empty slice).
    pub fn reserve(&mut self, hint: usize) -> &mut [u8] {
        if self.write_head + hint > self.data.len() {
            self.compact();
        }
        if self.write_head + hint > self.data.len() {
            let needed = self.write_head + hint;
            let grown = match self.limit {
                Some(limit) => cmp::min(needed, limit),
                None => needed,
            };
            if grown > self.data.len() {
                self.data.resize(grown, 0);
            }
        }
        &mut self.data[self.write_head..]
    }

    /// Marks `size` bytes of previously reserved space as written.
    pub fn mark_written(&mut self, size: usize) {
        debug_assert!(self.write_head + size <= self.data.len());
        self.write_head += size;
    }

    /// Copies `out.len()` bytes into `out` and consumes them.
    ///
    /// Returns `false` and leaves `out` untouched if fewer bytes are
    /// pending.
    pub fn read_into(&mut self, out: &mut [u8]) -> bool {
        if self.read_available() < out.len() {
            return false;
        }
        out.copy_from_slice(&self.data[self.read_head..self.read_head + out.len()]);
        self.read_head += out.len();
        true
    }

    /// Consumes and returns the next byte.
    pub fn read_u8(&mut self) -> Option<u8> {
        if self.read_available() == 0 {
            return None;
        }
        let byte = self.data[self.read_head];
        self.read_head += 1;
        Some(byte)
    }

    /// Consumes `len` bytes and returns them as a string.
    pub fn read_string(&mut self, len: usize) -> Option<String> {
        if self.read_available() < len {
            return None;
        }
        let s = String::from_utf8_lossy(&self.data[self.read_head..self.read_head + len])
            .into_owned();
        self.read_head += len;
        Some(s)
    }

    /// The pending bytes, without consuming them.
    pub fn peek(&self) -> &[u8] {
        &self.data[self.read_head..self.write_head]
    }

    /// Consumes `size` bytes without looking at them.
    pub fn mark_read(&mut self, size: usize) {
        debug_assert!(self.read_head + size <= self.write_head);
        self.read_head += size;
    }

    /// Discards all pending bytes.
    pub fn clear(&mut self) {
        self.read_head = 0;
        self.write_head = 0;
    }

    /// Moves the pending bytes to the front of the backing storage.
    pub fn compact(&mut self) {
        let range = self.read_head..self.write_head;
        self.data.copy_within(range, 0);
        self.write_head -= self.read_head;
        self.read_head = 0;
    }

    /// Copies the pending bytes out into a fresh vector.
    pub fn get_data(&self) -> Vec<u8> {
        self.peek().to_vec()
    }

    /// The pending bytes as a (lossily decoded) string.
    pub fn get_string(&self) -> String {
        String::from_utf8_lossy(self.peek()).into_owned()
    }

    /// Makes sure `size` more bytes fit behind the write head, compacting
    /// and then growing the backing storage as needed.
    ///
    /// Returns `false`, leaving the buffer untouched apart from the
    /// compaction, if growing that far would exceed a bounded buffer's
    /// limit.
    fn ensure_space(&mut self, size: usize) -> bool {
        if self.write_head + size > self.data.len() {
            self.compact();
        }
        let needed = self.write_head + size;
        if let Some(limit) = self.limit {
            if needed > limit {
                return false;
            }
        }
        if needed > self.data.len() {
            self.data.resize(needed, 0);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read() {
        let mut buf = Buffer::new();
        assert!(buf.write(b"hello"));
        assert_eq!(buf.read_available(), 5);
        let mut out = [0; 5];
        assert!(buf.read_into(&mut out));
        assert_eq!(&out, b"hello");
        assert_eq!(buf.read_available(), 0);
    }

    #[test]
    fn short_read_leaves_output_untouched() {
        let mut buf = Buffer::new();
        buf.write(b"ab");
        let mut out = [0xff; 4];
        assert!(!buf.read_into(&mut out));
        assert_eq!(out, [0xff; 4]);
        assert_eq!(buf.read_available(), 2);
    }

    #[test]
    fn bounded_buffer_rejects_overflow() {
        let mut buf = Buffer::with_limit(4);
        assert!(buf.write(b"abcd"));
        assert!(!buf.write(b"e"));
        assert_eq!(buf.get_data(), b"abcd");
    }

    #[test]
    fn bounded_buffer_reuses_consumed_space() {
        let mut buf = Buffer::with_limit(4);
        assert!(buf.write(b"abcd"));
        buf.mark_read(2);
        // Compaction frees the two consumed bytes.
        assert!(buf.write(b"ef"));
        assert_eq!(buf.get_data(), b"cdef");
    }

    #[test]
    fn growth_past_initial_capacity() {
        let mut buf = Buffer::new();
        let big = vec![0xaa; DEFAULT_CAPACITY * 2 + 17];
        assert!(buf.write(&big));
        assert_eq!(buf.get_data(), big);
    }

    #[test]
    fn reserve_and_mark_written() {
        let mut buf = Buffer::new();
        buf.write(b"xy");
        buf.mark_read(2);
        {
            let space = buf.reserve(8);
            assert!(space.len() >= 8);
            space[..3].copy_from_slice(b"abc");
        }
        buf.mark_written(3);
        assert_eq!(buf.get_string(), "abc");
    }

    #[test]
    fn compact_preserves_pending_bytes() {
        let mut buf = Buffer::new();
        buf.write(b"0123456789");
        buf.mark_read(4);
        buf.compact();
        assert_eq!(buf.get_data(), b"456789");
        assert_eq!(buf.read_u8(), Some(b'4'));
    }

    #[test]
    fn read_string_and_peek() {
        let mut buf = Buffer::from_vec(b"target.xml:0,fff".to_vec());
        assert_eq!(buf.read_string(10).as_deref(), Some("target.xml"));
        assert_eq!(buf.peek(), b":0,fff");
        assert_eq!(buf.read_string(99), None);
    }
}
