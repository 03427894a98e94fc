//! Fixed-capacity directional byte buffer (C1).
//!
//! One buffer stages bytes for one direction of one connection: either it is
//! filling from a `recv` or draining via a `send`, never both at once.

use std::io::{self, Read, Write};

use tracing::debug;

use crate::error::BufferError;

/// Capacity of one directional buffer.
pub const BUF_CAP: usize = 16_348;

/// A fixed-capacity staging area with a filled length (`size`) and a
/// consumed-by-send offset (`read_pos`).
///
/// Invariant: `0 <= read_pos <= size <= BUF_CAP`. On a completed drain both
/// reset to zero. Crossing from draining to filling (or back) always passes
/// through the empty state first.
pub struct DirectionalBuffer {
    data: Box<[u8; BUF_CAP]>,
    size: usize,
    read_pos: usize,
}

impl Default for DirectionalBuffer {
    fn default() -> Self {
        Self { data: Box::new([0; BUF_CAP]), size: 0, read_pos: 0 }
    }
}

impl DirectionalBuffer {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    fn remaining_capacity(&self) -> usize {
        BUF_CAP - self.size
    }

    /// Drains the buffer into `sink`. Precondition: `size > 0`.
    ///
    /// All-or-nothing: on a full drain both offsets reset to zero and `Ok(())`
    /// is returned; on a partial write `read_pos` advances and the caller must
    /// retry the same logical send later (no byte is ever re-sent or skipped).
    pub fn send<W: Write>(&mut self, sink: &mut W) -> Result<(), BufferError> {
        debug_assert!(self.size > 0, "send called on an empty buffer");

        while self.read_pos < self.size {
            match sink.write(&self.data[self.read_pos..self.size]) {
                Ok(0) => {
                    debug!("buffer send: write returned 0, treating as disconnect");
                    return Err(BufferError::Disconnect);
                }
                Ok(n) => self.read_pos += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Err(BufferError::WouldBlock);
                }
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    return Err(BufferError::Disconnect);
                }
                Err(e) => return Err(BufferError::Io(e)),
            }
        }

        self.reset();
        Ok(())
    }

    /// Fills from `source`. Precondition: `size == 0 && read_pos == 0`.
    ///
    /// Opportunistic: any bytes obtained before the kernel blocks count as
    /// success, since the caller doesn't know the eventual message size up
    /// front. A zero-byte read before any data arrives is `WouldBlock`. A
    /// clean EOF always surfaces as `Disconnect`, even if this same call
    /// already buffered some bytes first — the caller checks `size()` to
    /// tell a disconnect-with-residual-data (flush then half-close) apart
    /// from a disconnect-with-nothing-pending (full teardown).
    pub fn recv<R: Read>(&mut self, source: &mut R) -> Result<(), BufferError> {
        debug_assert!(self.size == 0 && self.read_pos == 0, "recv called on a non-empty buffer");

        let mut got_any = false;
        while self.remaining_capacity() > 0 {
            match source.read(&mut self.data[self.size..BUF_CAP]) {
                Ok(0) => return Err(BufferError::Disconnect),
                Ok(n) => {
                    self.size += n;
                    got_any = true;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return if got_any { Ok(()) } else { Err(BufferError::WouldBlock) };
                }
                Err(e) => return Err(BufferError::Io(e)),
            }
        }
        Ok(())
    }

    #[inline]
    fn reset(&mut self) {
        self.size = 0;
        self.read_pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recv_then_send_roundtrip() {
        let mut buf = DirectionalBuffer::default();
        let mut src: &[u8] = b"hello world";
        buf.recv(&mut src).unwrap();
        assert_eq!(buf.size(), 11);

        let mut sink = Vec::new();
        buf.send(&mut sink).unwrap();
        assert_eq!(sink, b"hello world");
        assert!(buf.is_empty());
    }

    #[test]
    fn recv_on_clean_eof_with_no_prior_data_is_disconnect() {
        let mut buf = DirectionalBuffer::default();
        let mut src: &[u8] = b"";
        let err = buf.recv(&mut src).unwrap_err();
        assert!(matches!(err, BufferError::Disconnect));
    }

    #[test]
    fn recv_disconnect_after_some_data_keeps_the_data_but_still_errors() {
        struct HalfThenEof {
            first: Option<&'static [u8]>,
        }
        impl Read for HalfThenEof {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                match self.first.take() {
                    Some(chunk) => {
                        buf[..chunk.len()].copy_from_slice(chunk);
                        Ok(chunk.len())
                    }
                    None => Ok(0),
                }
            }
        }

        let mut buf = DirectionalBuffer::default();
        let mut src = HalfThenEof { first: Some(b"partial") };
        let err = buf.recv(&mut src).unwrap_err();
        assert!(matches!(err, BufferError::Disconnect));
        // The bytes obtained before the EOF read are still there for the
        // forwarding handler to flush.
        assert_eq!(buf.size(), 7);
    }

    #[test]
    fn partial_send_resumes_at_read_pos() {
        struct Flaky {
            allowed: usize,
        }
        impl Write for Flaky {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                if self.allowed == 0 {
                    return Err(io::Error::from(io::ErrorKind::WouldBlock));
                }
                let n = buf.len().min(self.allowed);
                self.allowed -= n;
                Ok(n)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut buf = DirectionalBuffer::default();
        let mut src: &[u8] = b"0123456789";
        buf.recv(&mut src).unwrap();

        let mut sink = Flaky { allowed: 4 };
        let err = buf.send(&mut sink).unwrap_err();
        assert!(matches!(err, BufferError::WouldBlock));
        assert_eq!(buf.read_pos, 4);
        assert_eq!(buf.size, 10);

        let mut sink = Flaky { allowed: 100 };
        buf.send(&mut sink).unwrap();
        assert!(buf.is_empty());
    }
}
