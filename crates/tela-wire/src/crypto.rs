//! Cryptographic primitives for packet protection and key derivation.
//!
//! Every ePacket body is protected with ChaCha20-Poly1305 using a key
//! derived from a root via HKDF-SHA256. The unencrypted frame header is
//! authenticated as AEAD associated data, so a peer cannot tamper with
//! addressing or type information without failing the tag check.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

/// Length of an AEAD key in bytes.
pub const KEY_LEN: usize = 32;
/// Length of an AEAD nonce in bytes.
pub const NONCE_LEN: usize = 12;
/// Length of the Poly1305 authentication tag in bytes.
pub const TAG_LEN: usize = 16;

/// Errors from AEAD seal/open operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// The authentication tag did not verify; ciphertext or associated
    /// data were modified, or the wrong key was used.
    #[error("authentication failed")]
    AuthFailure,
    /// The ciphertext is shorter than the authentication tag.
    #[error("ciphertext too short: got {0} bytes")]
    TooShort(usize),
}

/// Encrypt `plaintext`, authenticating `aad` alongside it.
///
/// Returns `ciphertext ‖ tag` (the output is `plaintext.len() + TAG_LEN`
/// bytes).
///
/// # Examples
///
/// ```
/// use tela_wire::crypto;
///
/// let key = [7u8; 32];
/// let nonce = [1u8; 12];
/// let sealed = crypto::seal(&key, &nonce, b"header", b"payload");
/// assert_eq!(sealed.len(), 7 + crypto::TAG_LEN);
/// let opened = crypto::open(&key, &nonce, b"header", &sealed).unwrap();
/// assert_eq!(opened, b"payload");
/// ```
#[must_use]
pub fn seal(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN], aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .expect("ChaCha20-Poly1305 encryption is infallible for in-memory buffers")
}

/// Decrypt `ciphertext ‖ tag`, verifying `aad` was not modified.
///
/// # Errors
///
/// Returns [`CryptoError::AuthFailure`] if the tag does not verify and
/// [`CryptoError::TooShort`] if the input cannot contain a tag.
pub fn open(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::TooShort(ciphertext.len()));
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::AuthFailure)
}

/// HKDF-SHA256 key derivation.
///
/// Derives a ChaCha20-Poly1305 key from `base` using the caller's `salt`
/// and `info`. The same inputs always produce the same key; any differing
/// input byte produces an unrelated key.
///
/// # Examples
///
/// ```
/// use tela_wire::crypto;
///
/// let root = [0x42u8; 32];
/// let a = crypto::derive_key(&root, b"salt", b"info");
/// let b = crypto::derive_key(&root, b"salt", b"other");
/// assert_ne!(a, b);
/// ```
#[must_use]
pub fn derive_key(base: &[u8; KEY_LEN], salt: &[u8], info: &[u8]) -> [u8; KEY_LEN] {
    let hk = Hkdf::<Sha256>::new(Some(salt), base);
    let mut okm = [0u8; KEY_LEN];
    hk.expand(info, &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}
