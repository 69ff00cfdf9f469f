//! Growable ring buffer for per-connection I/O.
//!
//! Each connection owns two: inbound holds bytes read from the socket that
//! the codec has not framed yet, outbound holds framed bytes the socket has
//! not accepted yet. Appends go to the tail, consumption happens at the head.
//!
//! ## Growth
//!
//! Capacity is always zero or a power of two. When an append does not fit,
//! the buffer is reallocated to the next power of two that does and the live
//! bytes are moved to the front. Nothing is allocated until the first append.

use std::io::{self, IoSlice, Read, Write};

/// Smallest non-zero allocation.
const MIN_CAPACITY: usize = 1024;

/// Byte ring buffer with amortized O(1) append and consume.
#[derive(Debug, Default)]
pub struct RingBuffer {
    buf: Box<[u8]>,
    /// Index of the first live byte.
    head: usize,
    /// Number of live bytes.
    len: usize,
}

impl RingBuffer {
    /// Create an empty buffer without allocating.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a buffer able to hold `capacity` bytes before growing.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut rb = Self::new();
        rb.reserve(capacity);
        rb
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Free space before the buffer has to grow.
    pub fn available(&self) -> usize {
        self.capacity() - self.len
    }

    /// Make room for at least `additional` more bytes.
    pub fn reserve(&mut self, additional: usize) {
        let needed = self.len + additional;
        if needed <= self.capacity() {
            return;
        }

        let new_cap = needed.max(MIN_CAPACITY).next_power_of_two();
        let mut new_buf = vec![0u8; new_cap].into_boxed_slice();
        let (a, b) = self.as_slices();
        new_buf[..a.len()].copy_from_slice(a);
        new_buf[a.len()..a.len() + b.len()].copy_from_slice(b);

        self.buf = new_buf;
        self.head = 0;
    }

    /// Append bytes at the tail, growing as needed.
    pub fn write(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.reserve(data.len());

        let cap = self.capacity();
        let tail = (self.head + self.len) % cap;
        let first = data.len().min(cap - tail);
        self.buf[tail..tail + first].copy_from_slice(&data[..first]);
        self.buf[..data.len() - first].copy_from_slice(&data[first..]);
        self.len += data.len();
    }

    /// Live bytes as two slices: head part, then the wrapped part.
    pub fn as_slices(&self) -> (&[u8], &[u8]) {
        if self.len == 0 {
            return (&[], &[]);
        }
        let cap = self.capacity();
        let end = self.head + self.len;
        if end <= cap {
            (&self.buf[self.head..end], &[])
        } else {
            (&self.buf[self.head..], &self.buf[..end - cap])
        }
    }

    /// Up to `n` bytes from the head without consuming them.
    pub fn peek(&self, n: usize) -> (&[u8], &[u8]) {
        let n = n.min(self.len);
        let (a, b) = self.as_slices();
        if n <= a.len() {
            (&a[..n], &[])
        } else {
            (a, &b[..n - a.len()])
        }
    }

    /// Rearrange storage so every live byte is in one slice.
    pub fn make_contiguous(&mut self) -> &[u8] {
        if self.head + self.len > self.capacity() {
            self.buf.rotate_left(self.head);
            self.head = 0;
        }
        let start = self.head;
        &self.buf[start..start + self.len]
    }

    /// Drop up to `n` bytes from the head, returning how many were dropped.
    pub fn shift(&mut self, n: usize) -> usize {
        let n = n.min(self.len);
        self.len -= n;
        self.head = if self.len == 0 {
            0
        } else {
            (self.head + n) % self.capacity()
        };
        n
    }

    /// Copy bytes from the head into `out`, consuming them.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let (a, b) = self.peek(out.len());
        let (a_len, b_len) = (a.len(), b.len());
        out[..a_len].copy_from_slice(a);
        out[a_len..a_len + b_len].copy_from_slice(b);
        self.shift(a_len + b_len)
    }

    /// Discard all bytes, keeping the allocation.
    pub fn reset(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    /// Discard all bytes and release the allocation.
    pub fn release(&mut self) {
        *self = Self::new();
    }

    /// One read from `reader` of at most `max` bytes straight into free space.
    ///
    /// Returns the byte count from the underlying `read` call, so `Ok(0)`
    /// means end of stream.
    pub fn read_from<R: Read>(&mut self, reader: &mut R, max: usize) -> io::Result<usize> {
        let max = max.max(1);
        self.reserve(max);

        let cap = self.capacity();
        let tail = (self.head + self.len) % cap;
        let contiguous = if tail >= self.head || self.len == 0 {
            cap - tail
        } else {
            self.head - tail
        };
        let want = max.min(contiguous);

        let n = reader.read(&mut self.buf[tail..tail + want])?;
        self.len += n;
        Ok(n)
    }

    /// Write buffered bytes to `writer` until it would block or the buffer
    /// is empty, consuming what was accepted.
    ///
    /// `WouldBlock` is not an error here; the returned count tells how much
    /// went out.
    pub fn write_to<W: Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let mut total = 0;
        while !self.is_empty() {
            let (a, b) = self.as_slices();
            let slices = [IoSlice::new(a), IoSlice::new(b)];
            let iov = if b.is_empty() { &slices[..1] } else { &slices[..] };
            match writer.write_vectored(iov) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => {
                    self.shift(n);
                    total += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }
}
