//! NaCl-style authenticated encryption for the framed stream (C3).

mod keys;
mod stream;

pub use keys::{KeyPair, SharedKey};
pub use stream::{FramedCryptoStream, Handshake, HandshakeOutcome, MAX_PLAINTEXT};
