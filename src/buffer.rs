//! Resizable byte buffer with a cheap-prepend area and a scatter-read
//! helper.
//!
//! Layout is a single contiguous vector carved into three regions:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! +-------------------+------------------+------------------+
//! 0               reader             writer            capacity
//! ```
//!
//! Invariant: `0 <= reader <= writer <= capacity`. A fixed reserve at the
//! front lets protocol code prefix a header in O(1) without moving the
//! payload.

use std::io;
use std::os::fd::RawFd;

/// Bytes reserved at the front for O(1) header prepending.
pub const CHEAP_PREPEND: usize = 8;

/// Default initial capacity of the readable/writable region.
pub const INITIAL_SIZE: usize = 1024;

/// Size of the stack spill area used by [`Buffer::read_fd`].
const EXTRA_BUF_SIZE: usize = 65536;

pub struct Buffer {
    buf: Vec<u8>,
    reader: usize,
    writer: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::new()
    }
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial: usize) -> Buffer {
        Buffer {
            buf: vec![0; CHEAP_PREPEND + initial],
            reader: CHEAP_PREPEND,
            writer: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader
    }

    /// Total size of the underlying storage.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// The readable region.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader..self.writer]
    }

    /// Offset of the first CRLF in the readable region.
    pub fn find_crlf(&self) -> Option<usize> {
        self.find_crlf_from(0)
    }

    /// Offset of the first CRLF at or after `from` (offsets are relative
    /// to the start of the readable region).
    pub fn find_crlf_from(&self, from: usize) -> Option<usize> {
        self.peek()[from..]
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|pos| pos + from)
    }

    /// Discard `n` readable bytes from the front.
    pub fn retrieve(&mut self, n: usize) {
        assert!(n <= self.readable_bytes());
        if n < self.readable_bytes() {
            self.reader += n;
        } else {
            self.retrieve_all();
        }
    }

    /// Discard everything up to (but not including) offset `end` of the
    /// readable region.
    pub fn retrieve_until(&mut self, end: usize) {
        self.retrieve(end);
    }

    /// Discard all readable bytes. Both indices snap back to the prepend
    /// head; this is the only shrink policy.
    pub fn retrieve_all(&mut self) {
        self.reader = CHEAP_PREPEND;
        self.writer = CHEAP_PREPEND;
    }

    pub fn retrieve_as_bytes(&mut self, n: usize) -> Vec<u8> {
        assert!(n <= self.readable_bytes());
        let out = self.peek()[..n].to_vec();
        self.retrieve(n);
        out
    }

    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        self.retrieve_as_bytes(self.readable_bytes())
    }

    /// Like [`Buffer::retrieve_as_bytes`] but lossily decoded as UTF-8.
    pub fn retrieve_as_string(&mut self, n: usize) -> String {
        String::from_utf8_lossy(&self.retrieve_as_bytes(n)).into_owned()
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.writer..self.writer + data.len()].copy_from_slice(data);
        self.writer += data.len();
    }

    /// Prefix `data` in front of the readable region. Requires
    /// `prependable_bytes() >= data.len()`.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader -= data.len();
        self.buf[self.reader..self.reader + data.len()].copy_from_slice(data);
    }

    pub fn append_u16(&mut self, v: u16) {
        self.append(&v.to_be_bytes());
    }

    pub fn append_u32(&mut self, v: u32) {
        self.append(&v.to_be_bytes());
    }

    pub fn append_u64(&mut self, v: u64) {
        self.append(&v.to_be_bytes());
    }

    /// Big-endian read of the first two readable bytes, without
    /// consuming them. Byte-level decode, safe at any alignment.
    pub fn peek_u16(&self) -> u16 {
        assert!(self.readable_bytes() >= 2);
        u16::from_be_bytes(self.peek()[..2].try_into().unwrap())
    }

    pub fn peek_u32(&self) -> u32 {
        assert!(self.readable_bytes() >= 4);
        u32::from_be_bytes(self.peek()[..4].try_into().unwrap())
    }

    pub fn peek_u64(&self) -> u64 {
        assert!(self.readable_bytes() >= 8);
        u64::from_be_bytes(self.peek()[..8].try_into().unwrap())
    }

    pub fn read_u16(&mut self) -> u16 {
        let v = self.peek_u16();
        self.retrieve(2);
        v
    }

    pub fn read_u32(&mut self) -> u32 {
        let v = self.peek_u32();
        self.retrieve(4);
        v
    }

    pub fn read_u64(&mut self) -> u64 {
        let v = self.peek_u64();
        self.retrieve(8);
        v
    }

    /// Compact and release excess storage, keeping room for `reserve`
    /// more writable bytes.
    pub fn shrink(&mut self, reserve: usize) {
        let readable = self.readable_bytes();
        self.buf.copy_within(self.reader..self.writer, CHEAP_PREPEND);
        self.reader = CHEAP_PREPEND;
        self.writer = CHEAP_PREPEND + readable;
        self.buf.truncate(self.writer + reserve);
        self.buf.shrink_to_fit();
    }

    fn ensure_writable(&mut self, n: usize) {
        if self.writable_bytes() < n {
            self.make_space(n);
        }
    }

    fn make_space(&mut self, n: usize) {
        if self.writable_bytes() + self.prependable_bytes() < n + CHEAP_PREPEND {
            // Cannot fit even after reclaiming prepend slack: grow to
            // exactly what is needed.
            self.buf.resize(self.writer + n, 0);
        } else {
            // Shift readable bytes up against the prepend reserve.
            let readable = self.readable_bytes();
            self.buf.copy_within(self.reader..self.writer, CHEAP_PREPEND);
            self.reader = CHEAP_PREPEND;
            self.writer = CHEAP_PREPEND + readable;
        }
    }

    /// Scatter-read from `fd` into the buffer tail plus a 64 KiB stack
    /// spill, appending any spill overflow. One syscall per call; a
    /// small buffer still absorbs bursty reads.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();
        let mut iov = [
            libc::iovec {
                iov_base: self.buf[self.writer..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra.len(),
            },
        ];
        // Skip the spill when the buffer tail is already large enough.
        let iovcnt = if writable < EXTRA_BUF_SIZE { 2 } else { 1 };
        let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), iovcnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.writer += n;
        } else {
            self.writer = self.buf.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};
    use std::os::fd::AsRawFd;

    #[test]
    fn fresh_buffer_indices() {
        let buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn append_retrieve_round_trip() {
        let mut buf = Buffer::new();
        buf.append(b"hello, world");
        assert_eq!(buf.readable_bytes(), 12);
        assert_eq!(buf.peek(), b"hello, world");
        assert_eq!(buf.retrieve_as_string(5), "hello");
        assert_eq!(buf.readable_bytes(), 7);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND + 5);
        buf.retrieve_all();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
    }

    #[test]
    fn prepend_then_retrieve_restores_state() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend(&7u32.to_be_bytes());
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND - 4);
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.read_u32(), 7);
        assert_eq!(buf.peek(), b"payload");
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn growth_reclaims_prepend_slack_first() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'x'; 800]);
        buf.retrieve(500);
        // 300 readable; 224 writable + 508 prependable is enough for 400
        // once shifted, so capacity must not change.
        let cap = buf.capacity();
        buf.append(&vec![b'y'; 400]);
        assert_eq!(buf.capacity(), cap);
        assert_eq!(buf.readable_bytes(), 700);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn growth_reallocates_when_needed() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'x'; 1000]);
        buf.append(&vec![b'y'; 2000]);
        assert_eq!(buf.readable_bytes(), 3000);
        assert_eq!(&buf.peek()[..1000], &vec![b'x'; 1000][..]);
        assert_eq!(&buf.peek()[1000..], &vec![b'y'; 2000][..]);
    }

    #[test]
    fn find_crlf() {
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\nHost: x\r\n");
        assert_eq!(buf.find_crlf(), Some(14));
        assert_eq!(buf.find_crlf_from(15), Some(23));
        assert_eq!(buf.find_crlf_from(24), None);
        buf.retrieve_until(16);
        assert_eq!(buf.peek(), b"Host: x\r\n");
    }

    #[test]
    fn integer_accessors_are_big_endian() {
        let mut buf = Buffer::new();
        buf.append_u16(0x0102);
        buf.append_u32(0x03040506);
        buf.append_u64(0x0708090a0b0c0d0e);
        assert_eq!(buf.peek()[..2], [1, 2]);
        assert_eq!(buf.read_u16(), 0x0102);
        assert_eq!(buf.read_u32(), 0x03040506);
        assert_eq!(buf.read_u64(), 0x0708090a0b0c0d0e);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn shrink_compacts() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'x'; 4000]);
        buf.retrieve(3900);
        buf.shrink(0);
        assert_eq!(buf.readable_bytes(), 100);
        assert_eq!(buf.capacity(), CHEAP_PREPEND + 100);
        assert_eq!(buf.peek(), &vec![b'x'; 100][..]);
    }

    #[test]
    fn read_fd_absorbs_large_payload_into_small_buffer() {
        let payload: Vec<u8> = (0..131072u32).map(|i| (i % 251) as u8).collect();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&payload).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let mut buf = Buffer::with_capacity(1024);
        let mut total = 0;
        while total < payload.len() {
            let n = buf.read_fd(file.as_raw_fd()).unwrap();
            assert!(n > 0);
            total += n;
        }
        assert_eq!(buf.readable_bytes(), payload.len());
        assert_eq!(buf.peek(), &payload[..]);
    }

    #[test]
    fn read_fd_first_read_uses_the_spill() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&vec![b'z'; 131072]).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let mut buf = Buffer::with_capacity(1024);
        let n = buf.read_fd(file.as_raw_fd()).unwrap();
        // Tail (1 KiB) plus the full 64 KiB spill.
        assert_eq!(n, 1024 + 65536);
        assert_eq!(buf.readable_bytes(), n);
    }
}
