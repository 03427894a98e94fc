//! Thin safe wrapper around libsodium's `crypto_box` family.
//!
//! Mirrors the calling convention the original proxy this system descends
//! from relies on: plaintext is sealed with a 32-byte leading zero region
//! (`crypto_box_ZEROBYTES`), and the resulting ciphertext carries a 16-byte
//! leading zero region (`crypto_box_BOXZEROBYTES`) as part of the same
//! fixed-size buffer. We precompute the shared key once per handshake with
//! `crypto_box_beforenm` and use the `_afternm` seal/open variants for every
//! message afterwards, rather than re-deriving it per message.

use std::sync::Once;

use libsodium_sys as sodium;

use crate::error::FramingError;

pub const PUBLIC_KEY_LEN: usize = sodium::crypto_box_PUBLICKEYBYTES as usize;
pub const SECRET_KEY_LEN: usize = sodium::crypto_box_SECRETKEYBYTES as usize;
pub const SHARED_KEY_LEN: usize = sodium::crypto_box_BEFORENMBYTES as usize;
pub const NONCE_LEN: usize = sodium::crypto_box_NONCEBYTES as usize;
/// Leading zero bytes required on the plaintext side of the in-place API.
pub const ZERO_PAD_LEN: usize = sodium::crypto_box_ZEROBYTES as usize;
/// Leading zero bytes libsodium guarantees on the ciphertext side.
pub const BOX_ZERO_PAD_LEN: usize = sodium::crypto_box_BOXZEROBYTES as usize;

static SODIUM_INIT: Once = Once::new();

fn ensure_init() {
    SODIUM_INIT.call_once(|| {
        // Returns 0 on success, 1 if already initialised, -1 on failure; both
        // non-negative results leave the library usable.
        if unsafe { sodium::sodium_init() } < 0 {
            panic!("libsodium failed to initialise");
        }
    });
}

#[derive(Clone, Copy)]
pub struct KeyPair {
    pub public: [u8; PUBLIC_KEY_LEN],
    pub secret: [u8; SECRET_KEY_LEN],
}

impl KeyPair {
    pub fn generate() -> Self {
        ensure_init();
        let mut public = [0u8; PUBLIC_KEY_LEN];
        let mut secret = [0u8; SECRET_KEY_LEN];
        let rc = unsafe { sodium::crypto_box_keypair(public.as_mut_ptr(), secret.as_mut_ptr()) };
        assert_eq!(rc, 0, "crypto_box_keypair failed");
        Self { public, secret }
    }
}

#[derive(Clone, Copy)]
pub struct SharedKey(pub [u8; SHARED_KEY_LEN]);

impl SharedKey {
    /// Precomputes the shared symmetric key from our secret key and the
    /// peer's ephemeral public key (`crypto_box_beforenm`).
    pub fn derive(our_secret: &[u8; SECRET_KEY_LEN], peer_public: &[u8; PUBLIC_KEY_LEN]) -> Self {
        ensure_init();
        let mut shared = [0u8; SHARED_KEY_LEN];
        let rc = unsafe {
            sodium::crypto_box_beforenm(shared.as_mut_ptr(), peer_public.as_ptr(), our_secret.as_ptr())
        };
        assert_eq!(rc, 0, "crypto_box_beforenm failed");
        Self(shared)
    }
}

/// Draws `buf.len()` cryptographically random bytes (used for nonces).
pub fn random_bytes(buf: &mut [u8]) {
    ensure_init();
    unsafe { sodium::randombytes_buf(buf.as_mut_ptr().cast(), buf.len()) };
}

/// Seals `zero_padded_plaintext` (already `ZERO_PAD_LEN` zero bytes followed
/// by the real plaintext) into `out`, both of the same length, via
/// `crypto_box_afternm`. `out`'s first `BOX_ZERO_PAD_LEN` bytes come back
/// zero; the rest is the authentication tag followed by the ciphertext.
pub fn seal_afternm(shared: &SharedKey, nonce: &[u8; NONCE_LEN], zero_padded_plaintext: &[u8], out: &mut [u8]) {
    debug_assert_eq!(zero_padded_plaintext.len(), out.len());
    let rc = unsafe {
        sodium::crypto_box_afternm(
            out.as_mut_ptr(),
            zero_padded_plaintext.as_ptr(),
            zero_padded_plaintext.len() as u64,
            nonce.as_ptr(),
            shared.0.as_ptr(),
        )
    };
    assert_eq!(rc, 0, "crypto_box_afternm failed");
}

/// Opens `zero_padded_ciphertext` (the full on-wire body, still carrying its
/// leading `BOX_ZERO_PAD_LEN` zero bytes) into `out`. Returns
/// [`FramingError::CryptoError`] on authentication failure.
pub fn open_afternm(
    shared: &SharedKey,
    nonce: &[u8; NONCE_LEN],
    zero_padded_ciphertext: &[u8],
    out: &mut [u8],
) -> Result<(), FramingError> {
    debug_assert_eq!(zero_padded_ciphertext.len(), out.len());
    let rc = unsafe {
        sodium::crypto_box_open_afternm(
            out.as_mut_ptr(),
            zero_padded_ciphertext.as_ptr(),
            zero_padded_ciphertext.len() as u64,
            nonce.as_ptr(),
            shared.0.as_ptr(),
        )
    };
    if rc == 0 { Ok(()) } else { Err(FramingError::CryptoError) }
}
