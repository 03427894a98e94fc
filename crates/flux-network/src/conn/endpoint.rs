//! One side of a connection pair: a socket handle, an encryption flag
//! (implicit in which [`CryptoPhase`] it's in), and — once encrypted — an
//! owned framed-stream state. The framed-stream state is either absent
//! (plaintext or pre-handshake) or fully initialized; there is no partial
//! state in between.

use std::{
    io::{self, Read, Write},
    os::fd::{AsRawFd, RawFd},
};

use mio::{Interest, Token, event::Source, net::TcpStream};
use tracing::trace;

use crate::{
    crypto::{FramedCryptoStream, Handshake, HandshakeOutcome, SharedKey},
    error::FramingError,
};

enum CryptoPhase {
    Plain,
    Handshaking(Handshake),
    Ready(FramedCryptoStream),
}

pub struct Endpoint {
    stream: TcpStream,
    crypto: CryptoPhase,
}

impl Endpoint {
    pub fn plain(stream: TcpStream) -> Self {
        Self { stream, crypto: CryptoPhase::Plain }
    }

    pub fn encrypted(stream: TcpStream) -> Self {
        Self { stream, crypto: CryptoPhase::Handshaking(Handshake::new()) }
    }

    #[inline]
    pub fn is_handshaking(&self) -> bool {
        matches!(self.crypto, CryptoPhase::Handshaking(_))
    }

    #[inline]
    pub fn is_encrypted(&self) -> bool {
        !matches!(self.crypto, CryptoPhase::Plain)
    }

    #[inline]
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Drives one handshake step. Panics if called outside the handshaking
    /// phase — the connection state machine only invokes this while the
    /// endpoint's state is `HANDSHAKING`.
    pub fn step_handshake(&mut self) -> Result<HandshakeOutcome, FramingError> {
        match &mut self.crypto {
            CryptoPhase::Handshaking(hs) => hs.step(&mut self.stream),
            _ => unreachable!("step_handshake called outside the handshaking phase"),
        }
    }

    /// Transitions from handshaking to the data phase once the handshake
    /// yields a shared key.
    pub fn finish_handshake(&mut self, shared: SharedKey) {
        debug_assert!(self.is_handshaking());
        self.crypto = CryptoPhase::Ready(FramedCryptoStream::new(shared));
    }

    /// Whether this endpoint currently has a send in progress that must be
    /// drained before a new message can be started (framed sides only).
    pub fn send_in_progress(&self) -> bool {
        match &self.crypto {
            CryptoPhase::Ready(fs) => fs.send_in_progress(),
            _ => false,
        }
    }

    pub fn recv(&mut self, out: &mut [u8]) -> Result<usize, FramingError> {
        let result = match &mut self.crypto {
            CryptoPhase::Plain => match self.stream.read(out) {
                Ok(n) => Ok(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Err(FramingError::WouldBlock),
                Err(e) => Err(e.into()),
            },
            CryptoPhase::Ready(fs) => fs.recv(&mut self.stream, out),
            CryptoPhase::Handshaking(_) => unreachable!("recv called before handshake completed"),
        };
        if let Ok(n) = result {
            trace!(fd = self.stream.as_raw_fd(), bytes = n, "recv");
        }
        result
    }

    pub fn send(&mut self, bytes: &[u8]) -> Result<usize, FramingError> {
        let result = match &mut self.crypto {
            CryptoPhase::Plain => match self.stream.write(bytes) {
                Ok(0) => Err(FramingError::Disconnect),
                Ok(n) => Ok(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Err(FramingError::WouldBlock),
                Err(e) => Err(e.into()),
            },
            CryptoPhase::Ready(fs) => fs.send(&mut self.stream, bytes),
            CryptoPhase::Handshaking(_) => unreachable!("send called before handshake completed"),
        };
        if let Ok(n) = result {
            trace!(fd = self.stream.as_raw_fd(), bytes = n, "send");
        }
        result
    }
}

/// Bridges the endpoint's own recv contract onto `std::io::Read` so the
/// connection layer can hand an `Endpoint` straight to
/// [`crate::buffer::DirectionalBuffer::recv`], uniformly for plaintext and
/// encrypted sides.
impl Read for Endpoint {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.recv(buf) {
            Ok(n) => Ok(n),
            Err(FramingError::WouldBlock) => Err(io::ErrorKind::WouldBlock.into()),
            Err(FramingError::Disconnect) => Ok(0),
            Err(FramingError::CryptoError) => Err(io::Error::other("crypto authentication failed")),
            Err(FramingError::InvalidFrame(msg)) => Err(io::Error::other(msg)),
            Err(FramingError::Io(e)) => Err(e),
            Err(FramingError::WantRead | FramingError::WantWrite) => {
                unreachable!("handshake outcomes never escape recv")
            }
        }
    }
}

impl Write for Endpoint {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.send(buf) {
            Ok(n) => Ok(n),
            Err(FramingError::WouldBlock) => Err(io::ErrorKind::WouldBlock.into()),
            Err(FramingError::Disconnect) => Err(io::ErrorKind::BrokenPipe.into()),
            Err(FramingError::CryptoError) => Err(io::Error::other("crypto authentication failed")),
            Err(FramingError::InvalidFrame(msg)) => Err(io::Error::other(msg)),
            Err(FramingError::Io(e)) => Err(e),
            Err(FramingError::WantRead | FramingError::WantWrite) => {
                unreachable!("handshake outcomes never escape send")
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for Endpoint {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl Source for Endpoint {
    fn register(&mut self, registry: &mio::Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.stream.register(registry, token, interests)
    }

    fn reregister(&mut self, registry: &mio::Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.stream.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
        self.stream.deregister(registry)
    }
}
