//! Framed crypto stream (C3): a length-prefixed, per-message-nonce
//! authenticated stream layered over one non-blocking byte stream, exposing
//! a byte-oriented `send`/`recv` interface the connection state machine
//! drives exactly like a plaintext socket.
//!
//! Wire format per message: `u16` big-endian length, a 24-byte nonce, then
//! exactly `length` bytes of ciphertext. The ciphertext is the full
//! `crypto_box_afternm` output buffer — plaintext padded with
//! [`ZERO_PAD_LEN`] leading zero bytes in, [`BOX_ZERO_PAD_LEN`] leading zero
//! bytes guaranteed out — so `length == effective_plaintext_len + ZERO_PAD_LEN`
//! and decoding strips `ZERO_PAD_LEN` bytes back off.
//!
//! Like [`crate::buffer::DirectionalBuffer`], this holds only the staging
//! state; the underlying stream is passed in on every call rather than
//! owned, so the connection layer can keep one socket handle regardless of
//! which phase (plaintext, handshaking, encrypted) it's currently in.

use std::io::{self, Read, Write};

use tracing::debug;

use crate::{
    crypto::keys::{
        KeyPair, NONCE_LEN, PUBLIC_KEY_LEN, SharedKey, ZERO_PAD_LEN, open_afternm, random_bytes,
        seal_afternm,
    },
    error::FramingError,
};

/// Maximum plaintext payload carried by a single message.
pub const MAX_PLAINTEXT: usize = 4_096;
const LEN_FIELD_LEN: usize = 2;
const HEADER_LEN: usize = LEN_FIELD_LEN + NONCE_LEN;
const MAX_CT_LEN: usize = MAX_PLAINTEXT + ZERO_PAD_LEN;
const MAX_FRAME_LEN: usize = HEADER_LEN + MAX_CT_LEN;

/// Result of one non-blocking handshake step.
pub enum HandshakeOutcome {
    WantRead,
    WantWrite,
    Done(SharedKey),
}

/// Drives the ephemeral-keypair handshake without ever blocking: each
/// `step` call either makes progress and loops internally, or returns
/// `WantRead`/`WantWrite` for the driver to re-arm interest and retry later.
pub struct Handshake {
    keypair: KeyPair,
    phase: HandshakePhase,
}

enum HandshakePhase {
    SendPublicKey { sent: usize },
    RecvPublicKey { buf: [u8; PUBLIC_KEY_LEN], have: usize },
}

impl Handshake {
    pub fn new() -> Self {
        Self { keypair: KeyPair::generate(), phase: HandshakePhase::SendPublicKey { sent: 0 } }
    }

    pub fn step<S: Read + Write>(&mut self, stream: &mut S) -> Result<HandshakeOutcome, FramingError> {
        loop {
            match &mut self.phase {
                HandshakePhase::SendPublicKey { sent } => {
                    while *sent < PUBLIC_KEY_LEN {
                        match stream.write(&self.keypair.public[*sent..]) {
                            Ok(0) => return Err(FramingError::Disconnect),
                            Ok(n) => *sent += n,
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                                return Ok(HandshakeOutcome::WantWrite);
                            }
                            Err(e) => return Err(e.into()),
                        }
                    }
                    self.phase = HandshakePhase::RecvPublicKey { buf: [0; PUBLIC_KEY_LEN], have: 0 };
                }
                HandshakePhase::RecvPublicKey { buf, have } => {
                    while *have < PUBLIC_KEY_LEN {
                        match stream.read(&mut buf[*have..]) {
                            Ok(0) => return Err(FramingError::Disconnect),
                            Ok(n) => *have += n,
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                                return Ok(HandshakeOutcome::WantRead);
                            }
                            Err(e) => return Err(e.into()),
                        }
                    }
                    let shared = SharedKey::derive(&self.keypair.secret, buf);
                    debug!("handshake complete, shared key derived");
                    return Ok(HandshakeOutcome::Done(shared));
                }
            }
        }
    }
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RxPhase {
    Header,
    Ciphertext,
    Draining,
}

enum ReadStep {
    Complete,
    WouldBlock,
    Eof,
}

/// Staging state for one length-framed, authenticated direction. Constructed
/// once a [`Handshake`] has completed and handed over its [`SharedKey`].
pub struct FramedCryptoStream {
    shared: SharedKey,

    rx_phase: RxPhase,
    hdr_buf: [u8; HEADER_LEN],
    hdr_have: usize,
    declared_len: usize,
    nonce: [u8; NONCE_LEN],
    ct_buf: [u8; MAX_CT_LEN],
    ct_have: usize,
    pt_buf: [u8; MAX_CT_LEN],
    pt_pos: usize,
    pt_len: usize,

    tx_pending: [u8; MAX_FRAME_LEN],
    tx_pending_len: usize,
    tx_pending_pos: usize,
    tx_eff_len: usize,
}

impl FramedCryptoStream {
    pub fn new(shared: SharedKey) -> Self {
        Self {
            shared,
            rx_phase: RxPhase::Header,
            hdr_buf: [0; HEADER_LEN],
            hdr_have: 0,
            declared_len: 0,
            nonce: [0; NONCE_LEN],
            ct_buf: [0; MAX_CT_LEN],
            ct_have: 0,
            pt_buf: [0; MAX_CT_LEN],
            pt_pos: 0,
            pt_len: 0,
            tx_pending: [0; MAX_FRAME_LEN],
            tx_pending_len: 0,
            tx_pending_pos: 0,
            tx_eff_len: 0,
        }
    }

    fn read_step<S: Read>(&mut self, stream: &mut S, complete_at: usize) -> Result<ReadStep, FramingError> {
        let (buf_is_header, have) = match self.rx_phase {
            RxPhase::Header => (true, self.hdr_have),
            RxPhase::Ciphertext => (false, self.ct_have),
            RxPhase::Draining => unreachable!("read_step called while draining"),
        };
        debug_assert!(have < complete_at);

        let read_result = if buf_is_header {
            stream.read(&mut self.hdr_buf[have..complete_at])
        } else {
            stream.read(&mut self.ct_buf[have..complete_at])
        };

        match read_result {
            Ok(0) => Ok(ReadStep::Eof),
            Ok(n) => {
                if buf_is_header {
                    self.hdr_have += n;
                    Ok(if self.hdr_have == complete_at { ReadStep::Complete } else { ReadStep::WouldBlock })
                } else {
                    self.ct_have += n;
                    Ok(if self.ct_have == complete_at { ReadStep::Complete } else { ReadStep::WouldBlock })
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadStep::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }

    fn decrypt(&mut self) -> Result<(), FramingError> {
        open_afternm(
            &self.shared,
            &self.nonce,
            &self.ct_buf[..self.declared_len],
            &mut self.pt_buf[..self.declared_len],
        )?;
        self.pt_len = self.declared_len - ZERO_PAD_LEN;
        self.pt_pos = 0;
        Ok(())
    }

    fn reset_rx(&mut self) {
        self.hdr_buf = [0; HEADER_LEN];
        self.hdr_have = 0;
        self.ct_buf = [0; MAX_CT_LEN];
        self.ct_have = 0;
        self.pt_buf = [0; MAX_CT_LEN];
        self.pt_pos = 0;
        self.pt_len = 0;
        self.declared_len = 0;
        self.rx_phase = RxPhase::Header;
    }

    /// Reads up to `out.len()` plaintext bytes from `stream`. `Ok(0)`
    /// signals a clean disconnect at a message boundary (matching
    /// raw-stream EOF semantics); `Err(WouldBlock)` means try again on the
    /// next readable event; any other `Err` is fatal to the connection.
    pub fn recv<S: Read>(&mut self, stream: &mut S, out: &mut [u8]) -> Result<usize, FramingError> {
        loop {
            match self.rx_phase {
                RxPhase::Header => match self.read_step(stream, HEADER_LEN)? {
                    ReadStep::Eof => return Ok(0),
                    ReadStep::WouldBlock => return Err(FramingError::WouldBlock),
                    ReadStep::Complete => {
                        let len = u16::from_be_bytes([self.hdr_buf[0], self.hdr_buf[1]]) as usize;
                        if !(ZERO_PAD_LEN..=MAX_CT_LEN).contains(&len) {
                            return Err(FramingError::InvalidFrame("declared length out of range"));
                        }
                        self.nonce.copy_from_slice(&self.hdr_buf[LEN_FIELD_LEN..HEADER_LEN]);
                        self.declared_len = len;
                        self.rx_phase = RxPhase::Ciphertext;
                    }
                },
                RxPhase::Ciphertext => match self.read_step(stream, self.declared_len)? {
                    ReadStep::Eof => return Ok(0),
                    ReadStep::WouldBlock => return Err(FramingError::WouldBlock),
                    ReadStep::Complete => {
                        self.decrypt()?;
                        self.rx_phase = RxPhase::Draining;
                    }
                },
                RxPhase::Draining => {
                    let remaining = self.pt_len - self.pt_pos;
                    let n = out.len().min(remaining);
                    let src_start = ZERO_PAD_LEN + self.pt_pos;
                    out[..n].copy_from_slice(&self.pt_buf[src_start..src_start + n]);
                    self.pt_pos += n;
                    if self.pt_pos == self.pt_len {
                        self.reset_rx();
                    }
                    return Ok(n);
                }
            }
        }
    }

    /// Encrypts and sends `bytes` onto `stream`, truncated to
    /// [`MAX_PLAINTEXT`] per message. While a previous message is still
    /// draining, `bytes` is ignored and the in-flight message continues
    /// draining — the caller must re-invoke with the same logical sequence
    /// until this returns `Ok`.
    pub fn send<S: Write>(&mut self, stream: &mut S, bytes: &[u8]) -> Result<usize, FramingError> {
        if self.tx_pending_len == 0 {
            let eff_len = bytes.len().min(MAX_PLAINTEXT);
            let padded_len = eff_len + ZERO_PAD_LEN;

            let mut nonce = [0u8; NONCE_LEN];
            random_bytes(&mut nonce);

            let mut padded_pt = [0u8; MAX_CT_LEN];
            padded_pt[ZERO_PAD_LEN..padded_len].copy_from_slice(&bytes[..eff_len]);

            let mut ct = [0u8; MAX_CT_LEN];
            seal_afternm(&self.shared, &nonce, &padded_pt[..padded_len], &mut ct[..padded_len]);

            self.tx_pending[0..LEN_FIELD_LEN].copy_from_slice(&(padded_len as u16).to_be_bytes());
            self.tx_pending[LEN_FIELD_LEN..HEADER_LEN].copy_from_slice(&nonce);
            self.tx_pending[HEADER_LEN..HEADER_LEN + padded_len].copy_from_slice(&ct[..padded_len]);

            self.tx_pending_len = HEADER_LEN + padded_len;
            self.tx_pending_pos = 0;
            self.tx_eff_len = eff_len;
        }

        while self.tx_pending_pos < self.tx_pending_len {
            match stream.write(&self.tx_pending[self.tx_pending_pos..self.tx_pending_len]) {
                Ok(0) => return Err(FramingError::Disconnect),
                Ok(n) => self.tx_pending_pos += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Err(FramingError::WouldBlock);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let eff_len = self.tx_eff_len;
        self.tx_pending = [0; MAX_FRAME_LEN];
        self.tx_pending_len = 0;
        self.tx_pending_pos = 0;
        Ok(eff_len)
    }

    #[inline]
    pub fn send_in_progress(&self) -> bool {
        self.tx_pending_pos < self.tx_pending_len
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, collections::VecDeque, rc::Rc};

    use super::*;

    /// An in-memory duplex pipe pair for exercising both sides of the
    /// handshake and framing state machines without real sockets.
    #[derive(Clone)]
    struct Pipe {
        inbound: Rc<RefCell<VecDeque<u8>>>,
        outbound: Rc<RefCell<VecDeque<u8>>>,
    }

    fn pipe_pair() -> (Pipe, Pipe) {
        let a_to_b = Rc::new(RefCell::new(VecDeque::new()));
        let b_to_a = Rc::new(RefCell::new(VecDeque::new()));
        (
            Pipe { inbound: b_to_a.clone(), outbound: a_to_b.clone() },
            Pipe { inbound: a_to_b, outbound: b_to_a },
        )
    }

    impl Read for Pipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut q = self.inbound.borrow_mut();
            if q.is_empty() {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            let n = buf.len().min(q.len());
            for slot in buf.iter_mut().take(n) {
                *slot = q.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for Pipe {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.outbound.borrow_mut().extend(buf.iter().copied());
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn handshake_to_completion(
        a: &mut Handshake,
        pa: &mut Pipe,
        b: &mut Handshake,
        pb: &mut Pipe,
    ) -> (SharedKey, SharedKey) {
        let (mut ka, mut kb) = (None, None);
        for _ in 0..64 {
            if ka.is_none() {
                if let Ok(HandshakeOutcome::Done(k)) = a.step(pa) {
                    ka = Some(k);
                }
            }
            if kb.is_none() {
                if let Ok(HandshakeOutcome::Done(k)) = b.step(pb) {
                    kb = Some(k);
                }
            }
            if ka.is_some() && kb.is_some() {
                break;
            }
        }
        (ka.unwrap(), kb.unwrap())
    }

    #[test]
    fn handshake_then_roundtrip_small_message() {
        let (mut pa, mut pb) = pipe_pair();
        let mut ha = Handshake::new();
        let mut hb = Handshake::new();
        let (ka, kb) = handshake_to_completion(&mut ha, &mut pa, &mut hb, &mut pb);

        let mut sa = FramedCryptoStream::new(ka);
        let mut sb = FramedCryptoStream::new(kb);

        assert_eq!(sa.send(&mut pa, b"hello").unwrap(), 5);
        let mut out = [0u8; 64];
        let n = sb.recv(&mut pb, &mut out).unwrap();
        assert_eq!(&out[..n], b"hello");
    }

    #[test]
    fn byte_at_a_time_reassembly() {
        let (mut pa, mut pb) = pipe_pair();
        let mut ha = Handshake::new();
        let mut hb = Handshake::new();
        let (ka, kb) = handshake_to_completion(&mut ha, &mut pa, &mut hb, &mut pb);

        let mut sa = FramedCryptoStream::new(ka);
        let mut sb = FramedCryptoStream::new(kb);

        let msg = vec![0xABu8; 500];
        assert_eq!(sa.send(&mut pa, &msg).unwrap(), 500);

        // Starve the receive side down to one byte of "network" visibility
        // at a time by draining the shared queue manually.
        let all: Vec<u8> = pb.inbound.borrow_mut().drain(..).collect();

        let mut received = Vec::new();
        for byte in all {
            pb.inbound.borrow_mut().push_back(byte);
            loop {
                let mut out = [0u8; 16];
                match sb.recv(&mut pb, &mut out) {
                    Ok(0) => break,
                    Ok(n) => received.extend_from_slice(&out[..n]),
                    Err(FramingError::WouldBlock) => break,
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
        }
        assert_eq!(received, msg);
    }

    #[test]
    fn exactly_max_plaintext_is_one_message() {
        let (mut pa, mut pb) = pipe_pair();
        let mut ha = Handshake::new();
        let mut hb = Handshake::new();
        let (ka, kb) = handshake_to_completion(&mut ha, &mut pa, &mut hb, &mut pb);
        let mut sa = FramedCryptoStream::new(ka);
        let mut sb = FramedCryptoStream::new(kb);

        let msg = vec![7u8; MAX_PLAINTEXT];
        assert_eq!(sa.send(&mut pa, &msg).unwrap(), MAX_PLAINTEXT);
        assert_eq!(sa.tx_eff_len + ZERO_PAD_LEN, MAX_PLAINTEXT + ZERO_PAD_LEN);

        let mut received = Vec::new();
        loop {
            let mut out = vec![0u8; MAX_PLAINTEXT];
            match sb.recv(&mut pb, &mut out) {
                Ok(0) => break,
                Ok(n) => {
                    received.extend_from_slice(&out[..n]);
                    if received.len() == MAX_PLAINTEXT {
                        break;
                    }
                }
                Err(FramingError::WouldBlock) => break,
                Err(e) => panic!("{e}"),
            }
        }
        assert_eq!(received, msg);
    }

    #[test]
    fn oversized_message_requires_two_sends() {
        let (mut pa, mut pb) = pipe_pair();
        let mut ha = Handshake::new();
        let mut hb = Handshake::new();
        let (ka, _kb) = handshake_to_completion(&mut ha, &mut pa, &mut hb, &mut pb);
        let mut sa = FramedCryptoStream::new(ka);

        let msg = vec![1u8; MAX_PLAINTEXT + 1];
        let first = sa.send(&mut pa, &msg).unwrap();
        assert_eq!(first, MAX_PLAINTEXT);
        let second = sa.send(&mut pa, &msg[first..]).unwrap();
        assert_eq!(second, 1);
    }

    #[test]
    fn bit_flip_in_ciphertext_fails_authentication() {
        let (mut pa, mut pb) = pipe_pair();
        let mut ha = Handshake::new();
        let mut hb = Handshake::new();
        let (ka, kb) = handshake_to_completion(&mut ha, &mut pa, &mut hb, &mut pb);
        let mut sa = FramedCryptoStream::new(ka);
        let mut sb = FramedCryptoStream::new(kb);

        sa.send(&mut pa, b"tamper me").unwrap();
        // Flip a bit inside the ciphertext body, past the header.
        {
            let mut q = pb.inbound.borrow_mut();
            let idx = HEADER_LEN + ZERO_PAD_LEN + 1;
            if let Some(byte) = q.get_mut(idx) {
                *byte ^= 0x01;
            }
        }
        let mut out = [0u8; 64];
        let err = sb.recv(&mut pb, &mut out).unwrap_err();
        assert!(matches!(err, FramingError::CryptoError));
    }
}
