//! Growable byte buffer with read and write cursors.
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! |                   |     (CONTENT)    |                  |
//! +-------------------+------------------+------------------+
//! 0      <=      read_index   <=    write_index    <=    capacity
//! ```
//!
//! The first [`CHEAP_PREPEND`] bytes are reserved so a length header can be
//! written in front of already-buffered content without moving it.

use std::io::{self, IoSliceMut, Read, Write};

/// Size of the reserved prefix region.
pub const CHEAP_PREPEND: usize = 8;
/// Writable bytes a fresh buffer starts with.
pub const INITIAL_SIZE: usize = 1024;
/// Stack scratch used by [`Buffer::read_from`] when the writable tail is small.
pub const EXTRA_READ_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct Buffer {
    buffer: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a buffer with `initial_size` writable bytes after the prefix.
    pub fn with_capacity(initial_size: usize) -> Self {
        Self {
            buffer: vec![0; CHEAP_PREPEND + initial_size],
            read_index: CHEAP_PREPEND,
            write_index: CHEAP_PREPEND,
        }
    }

    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.write_index - self.read_index
    }

    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.buffer.len() - self.write_index
    }

    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.read_index
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readable_bytes() == 0
    }

    /// The readable region, without consuming it.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.buffer[self.read_index..self.write_index]
    }

    /// Consumes `len` readable bytes.
    ///
    /// Consuming everything resets both cursors to the prefix boundary so later
    /// appends reuse the space without reallocating.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.read_index += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.read_index = CHEAP_PREPEND;
        self.write_index = CHEAP_PREPEND;
    }

    /// Consumes up to `len` bytes and returns them.
    pub fn retrieve_as_bytes(&mut self, len: usize) -> Vec<u8> {
        let len = len.min(self.readable_bytes());
        let bytes = self.peek()[..len].to_vec();
        self.retrieve(len);
        bytes
    }

    /// Consumes up to `len` bytes as a string, replacing invalid UTF-8.
    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        let bytes = self.retrieve_as_bytes(len);
        match String::from_utf8(bytes) {
            Ok(s) => s,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        }
    }

    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable_bytes())
    }

    pub fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        self.buffer[self.write_index..self.write_index + data.len()].copy_from_slice(data);
        self.write_index += data.len();
    }

    /// Writes `data` immediately in front of the readable region.
    ///
    /// # Panics
    ///
    /// Panics if `data` is longer than [`prependable_bytes`](Self::prependable_bytes).
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(
            data.len() <= self.prependable_bytes(),
            "prepend of {} bytes exceeds {} prependable bytes",
            data.len(),
            self.prependable_bytes()
        );
        self.read_index -= data.len();
        self.buffer[self.read_index..self.read_index + data.len()].copy_from_slice(data);
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buffer.resize(self.write_index + len, 0);
        } else {
            // enough room overall: slide the content back to the prefix boundary
            let readable = self.readable_bytes();
            self.buffer
                .copy_within(self.read_index..self.write_index, CHEAP_PREPEND);
            self.read_index = CHEAP_PREPEND;
            self.write_index = self.read_index + readable;
        }
    }

    /// Performs one vectored read into the writable tail plus a 64 KiB stack
    /// scratch region, appending whatever spilled into the scratch.
    ///
    /// Returns the number of bytes read; `Ok(0)` means end of stream.
    pub fn read_from<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_READ_SIZE];
        let writable = self.writable_bytes();

        let n = {
            let (_, tail) = self.buffer.split_at_mut(self.write_index);
            let mut slices = [IoSliceMut::new(tail), IoSliceMut::new(&mut extra)];
            // a tail of at least 64 KiB is enough on its own
            let count = if writable < EXTRA_READ_SIZE { 2 } else { 1 };
            reader.read_vectored(&mut slices[..count])?
        };

        if n <= writable {
            self.write_index += n;
        } else {
            self.write_index = self.buffer.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    /// Writes the whole readable region in a single call.
    ///
    /// Nothing is consumed; the caller retrieves the returned count and retries
    /// the remainder later.
    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> io::Result<usize> {
        writer.write(self.peek())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_cursors(buf: &Buffer) {
        assert!(CHEAP_PREPEND <= buf.read_index);
        assert!(buf.read_index <= buf.write_index);
        assert!(buf.write_index <= buf.capacity());
    }

    #[test]
    fn test_new_buffer_layout() {
        let buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn test_append_then_retrieve_string() {
        let mut buf = Buffer::new();
        buf.append(b"hello, reactor");
        assert_eq!(buf.readable_bytes(), 14);

        assert_eq!(buf.retrieve_as_string(5), "hello");
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND + 5);
        assert_eq!(buf.retrieve_all_as_string(), ", reactor");
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn test_cursor_invariant_over_mixed_operations() {
        let mut buf = Buffer::with_capacity(16);
        let mut appended = 0usize;
        let mut retrieved = 0usize;

        for round in 0..200usize {
            let chunk = vec![(round % 251) as u8; (round * 7) % 37];
            buf.append(&chunk);
            appended += chunk.len();
            assert_cursors(&buf);

            let take = (round * 5) % 29;
            let take = take.min(buf.readable_bytes());
            buf.retrieve(take);
            retrieved += take;
            assert_cursors(&buf);

            assert_eq!(buf.readable_bytes(), appended - retrieved);
        }
    }

    #[test]
    fn test_growth_keeps_readable_bytes() {
        let mut buf = Buffer::with_capacity(8);
        buf.append(b"abcdef");
        let old_readable = buf.readable_bytes();

        let big = vec![b'x'; 100];
        buf.append(&big);

        assert!(buf.capacity() >= old_readable + big.len());
        assert_eq!(&buf.peek()[..6], b"abcdef");
        assert_eq!(buf.readable_bytes(), 106);
    }

    #[test]
    fn test_make_space_compacts_instead_of_reallocating() {
        let mut buf = Buffer::with_capacity(32);
        buf.append(&[1u8; 24]);
        buf.retrieve(20);
        let capacity = buf.capacity();

        // 8 writable + 20 reclaimable prefix is enough for 16 more
        buf.append(&[2u8; 16]);

        assert_eq!(buf.capacity(), capacity);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        assert_eq!(buf.peek(), [[1u8; 4].as_slice(), [2u8; 16].as_slice()].concat());
    }

    #[test]
    fn test_retrieve_more_than_readable_resets() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        buf.retrieve(100);
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn test_prepend_header() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend(&7u32.to_be_bytes());

        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(&buf.peek()[..4], &[0, 0, 0, 7]);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND - 4);
    }

    #[test]
    #[should_panic(expected = "exceeds")]
    fn test_prepend_overflow_panics() {
        let mut buf = Buffer::new();
        buf.prepend(&[0u8; CHEAP_PREPEND + 1]);
    }

    #[test]
    fn test_read_from_spills_into_scratch() {
        let mut buf = Buffer::with_capacity(16);
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();
        let mut reader = data.as_slice();

        let mut total = 0;
        loop {
            let n = buf.read_from(&mut reader).unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }

        assert_eq!(total, data.len());
        assert_eq!(buf.peek(), data.as_slice());
    }

    #[test]
    fn test_write_to_does_not_consume() {
        let mut buf = Buffer::new();
        buf.append(b"queued output");

        let mut sink = Vec::new();
        let n = buf.write_to(&mut sink).unwrap();

        assert_eq!(n, 13);
        assert_eq!(sink, b"queued output");
        assert_eq!(buf.readable_bytes(), 13);

        buf.retrieve(n);
        assert!(buf.is_empty());
    }
}
