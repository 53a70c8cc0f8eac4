//! Growable byte buffer used for connection input/output.
//!
//! Layout:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! |    prependable    |     readable     |     writable     |
//! +-------------------+------------------+------------------+
//! 0              read_index         write_index          capacity
//! ```
//!
//! The first [`RESERVED_PREPEND_SIZE`] bytes are kept free so a caller can
//! stamp a small length header in front of already-appended payload without
//! copying it.

use std::os::fd::BorrowedFd;

use nix::sys::uio::readv;
use std::io::IoSliceMut;

use crate::error::{Error, Result};

/// Bytes reserved at the front for [`Buffer::prepend`].
pub const RESERVED_PREPEND_SIZE: usize = 8;

/// Initial payload capacity (on top of the prepend reservation).
pub const INITIAL_SIZE: usize = 1024;

/// Size of the stack scratch area used by [`Buffer::read_from_fd`]. Large
/// enough to absorb a full gigabit burst between two poll cycles.
const EXTRA_BUF_SIZE: usize = 65536;

#[derive(Debug)]
pub struct Buffer {
    storage: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial: usize) -> Self {
        Buffer {
            storage: vec![0; RESERVED_PREPEND_SIZE + initial],
            read_index: RESERVED_PREPEND_SIZE,
            write_index: RESERVED_PREPEND_SIZE,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.write_index - self.read_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.storage.len() - self.write_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.read_index
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readable_bytes() == 0
    }

    /// Zero-copy view of the readable region.
    pub fn peek(&self) -> &[u8] {
        &self.storage[self.read_index..self.write_index]
    }

    /// Consumes `n` bytes from the front of the readable region.
    pub fn retrieve(&mut self, n: usize) {
        assert!(n <= self.readable_bytes());
        if n < self.readable_bytes() {
            self.read_index += n;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.read_index = RESERVED_PREPEND_SIZE;
        self.write_index = RESERVED_PREPEND_SIZE;
    }

    /// Consumes and returns the first `n` readable bytes unchanged.
    pub fn retrieve_as_bytes(&mut self, n: usize) -> Vec<u8> {
        assert!(n <= self.readable_bytes());
        let bytes = self.storage[self.read_index..self.read_index + n].to_vec();
        self.retrieve(n);
        bytes
    }

    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        let n = self.readable_bytes();
        self.retrieve_as_bytes(n)
    }

    /// Lossy UTF-8 view of the consumed bytes; for binary payloads use
    /// [`Buffer::retrieve_as_bytes`].
    pub fn retrieve_as_string(&mut self, n: usize) -> String {
        assert!(n <= self.readable_bytes());
        let s = String::from_utf8_lossy(&self.storage[self.read_index..self.read_index + n])
            .into_owned();
        self.retrieve(n);
        s
    }

    pub fn retrieve_all_as_string(&mut self) -> String {
        let n = self.readable_bytes();
        self.retrieve_as_string(n)
    }

    /// Appends `data` after the readable region. Always succeeds: frees space
    /// by compacting first and only grows the backing storage when the
    /// compacted buffer is still too small.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.storage[self.write_index..self.write_index + data.len()].copy_from_slice(data);
        self.write_index += data.len();
    }

    /// Writes `data` immediately in front of the readable region, into the
    /// reserved header space. Fails when the request exceeds what is left of
    /// the reservation.
    pub fn prepend(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.prependable_bytes() {
            return Err(Error::PrependOverflow(data.len()));
        }
        self.read_index -= data.len();
        self.storage[self.read_index..self.read_index + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Reads from `fd` with a vectored read into the remaining writable space
    /// plus a 64 KiB stack scratch area, so a bursty peer cannot force a
    /// reallocation mid-read. Scratch overflow is folded back via `append`.
    ///
    /// Returns the byte count (0 means the peer closed its write side).
    pub fn read_from_fd(&mut self, fd: BorrowedFd<'_>) -> nix::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();

        let n = {
            let (_, tail) = self.storage.split_at_mut(self.write_index);
            if writable < EXTRA_BUF_SIZE {
                let mut iov = [IoSliceMut::new(tail), IoSliceMut::new(&mut extra)];
                readv(fd, &mut iov)?
            } else {
                let mut iov = [IoSliceMut::new(tail)];
                readv(fd, &mut iov)?
            }
        };

        if n <= writable {
            self.write_index += n;
        } else {
            self.write_index = self.storage.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    /// Makes room for `len` more bytes: compact (shift readable bytes back to
    /// the reservation boundary) when the total slack suffices, otherwise
    /// grow the storage and compact.
    fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() >= len {
            return;
        }
        if self.writable_bytes() + self.prependable_bytes() - RESERVED_PREPEND_SIZE < len {
            self.storage.resize(self.write_index + len, 0);
        }
        self.compact();
        debug_assert!(self.writable_bytes() >= len);
    }

    fn compact(&mut self) {
        if self.read_index == RESERVED_PREPEND_SIZE {
            return;
        }
        let readable = self.readable_bytes();
        self.storage
            .copy_within(self.read_index..self.write_index, RESERVED_PREPEND_SIZE);
        self.read_index = RESERVED_PREPEND_SIZE;
        self.write_index = self.read_index + readable;
        debug_assert_eq!(readable, self.readable_bytes());
    }
}
