//! Error taxonomy for the forwarding core.
//!
//! Each subsystem gets its own enum so callers can match precisely; the
//! connection state machine composes them into [`ProxyError`] at the seam
//! where a fatal error needs to propagate out of a callback.

use thiserror::Error;

/// Outcome of a single send/recv attempt against a byte buffer or endpoint.
#[derive(Error, Debug)]
pub enum BufferError {
    #[error("would block")]
    WouldBlock,
    #[error("peer disconnected")]
    Disconnect,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the readiness registry (C2).
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("descriptor already registered")]
    Duplicate,
    #[error("registry at capacity")]
    AtCapacity,
    #[error("unknown descriptor")]
    NotFound,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the framed crypto stream (C3).
#[derive(Error, Debug)]
pub enum FramingError {
    #[error("would block")]
    WouldBlock,
    #[error("peer disconnected")]
    Disconnect,
    #[error("crypto authentication failed")]
    CryptoError,
    #[error("handshake needs a readable event")]
    WantRead,
    #[error("handshake needs a writable event")]
    WantWrite,
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from socket utilities (C4).
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("could not resolve {0}")]
    Resolve(String),
    #[error("connect failed: {0}")]
    Connect(#[from] std::io::Error),
    #[error("no candidate addresses resolved")]
    NoCandidates,
}

/// Top-level, per-connection-fatal error. Anything that reaches this
/// variant tears down the connection context that produced it; it never
/// propagates out of the event loop (see `Registry::run_loop`'s contract).
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error("upstream unreachable: {0}")]
    ConnectError(#[from] SocketError),
    #[error("registry full, dropping accept")]
    MaxEvents,
    #[error("transient accept failure")]
    IncompleteAccept,
}
