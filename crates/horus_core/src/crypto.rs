//! Crypto facade.
//!
//! Thin wrappers around the cryptographic primitives the decoder relies on:
//!
//! - **Authenticated symmetric decryption**: XChaCha20-Poly1305 with a
//!   detached tag. The wire format for every ciphertext in the system is
//!   `tag[16] ‖ nonce[24] ‖ body`, i.e. 40 bytes of non-secret metadata
//!   ahead of the encrypted body. Tag verification is constant-time.
//! - **Signature verification**: Ed25519. The decoder only ever verifies;
//!   signing keys exist solely at the headend.
//! - **Key derivation**: SHAKE256. Tree-child derivation hashes
//!   `parent ‖ side_key` down to a 16-byte child; leaf expansion hashes a
//!   16-byte tree key up to a 32-byte symmetric key; the keyed expansion
//!   used by the entropy pool hashes `seed ‖ index` to 64-byte blocks.
//!
//! ## Fault-injection discipline
//!
//! These wrappers are pure: after every call into this module the caller is
//! expected to insert a small randomized delay
//! ([`crate::fiproc::EntropyPool::small_delay`]) so the timing of a pass or
//! fail result is decoupled from the next observable action. The KDFs are
//! not themselves evaluated redundantly; a glitched derivation yields a
//! garbage key that fails the subsequent authenticated decryption.

use chacha20poly1305::{AeadInPlace, Key, KeyInit, Tag, XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signature, VerifyingKey};
use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::Shake256;
use zeroize::Zeroize;

/// Symmetric key length (256 bits).
pub const SYMMETRIC_KEY_LEN: usize = 32;

/// Nonce length for XChaCha20-Poly1305 (192 bits).
pub const SYMMETRIC_NONCE_LEN: usize = 24;

/// Poly1305 authentication tag length (128 bits).
pub const SYMMETRIC_MAC_LEN: usize = 16;

/// Non-secret metadata carried by every ciphertext: tag followed by nonce.
pub const SYMMETRIC_METADATA_LEN: usize = SYMMETRIC_MAC_LEN + SYMMETRIC_NONCE_LEN;

/// Ed25519 public key length.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Ed25519 signature length.
pub const SIGNATURE_LEN: usize = 64;

/// Tree-key length. Interior nodes of the timestamp tree are 128-bit keys.
pub const TREE_KEY_LEN: usize = 16;

/// Length of the global left/right direction keys mixed into each
/// tree-child derivation.
pub const TREE_SIDE_KEY_LEN: usize = 32;

/// Crypto facade error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// Authentication tag verification failed during decryption.
    AuthenticationFailed,
    /// Signature verification failed, or the public key failed to decode.
    BadSignature,
    /// Ciphertext length does not match the expected plaintext length plus
    /// metadata.
    LengthMismatch,
}

impl core::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::AuthenticationFailed => write!(f, "authentication tag verification failed"),
            Self::BadSignature => write!(f, "signature verification failed"),
            Self::LengthMismatch => write!(f, "ciphertext length mismatch"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Decrypt an authenticated ciphertext.
///
/// `ciphertext` must be exactly `plaintext.len() + SYMMETRIC_METADATA_LEN`
/// bytes: 16-byte tag, 24-byte nonce, then the encrypted body. On success
/// the body is written into `plaintext`. On authentication failure the
/// output buffer is zeroized; nothing unauthenticated ever reaches a caller.
pub fn decrypt_symmetric(
    plaintext: &mut [u8],
    ciphertext: &[u8],
    key: &[u8; SYMMETRIC_KEY_LEN],
) -> Result<(), CryptoError> {
    if ciphertext.len() != plaintext.len() + SYMMETRIC_METADATA_LEN {
        return Err(CryptoError::LengthMismatch);
    }

    let (tag, rest) = ciphertext.split_at(SYMMETRIC_MAC_LEN);
    let (nonce, body) = rest.split_at(SYMMETRIC_NONCE_LEN);
    plaintext.copy_from_slice(body);

    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    match cipher.decrypt_in_place_detached(
        XNonce::from_slice(nonce),
        b"",
        plaintext,
        Tag::from_slice(tag),
    ) {
        Ok(()) => Ok(()),
        Err(_) => {
            plaintext.zeroize();
            Err(CryptoError::AuthenticationFailed)
        }
    }
}

/// Verify an Ed25519 signature over `message`.
///
/// Uses strict verification: signatures that are valid only under the
/// malleable RFC 8032 rules are rejected.
pub fn verify_asymmetric(
    signature: &[u8; SIGNATURE_LEN],
    message: &[u8],
    pubkey: &[u8; PUBLIC_KEY_LEN],
) -> Result<(), CryptoError> {
    let key = VerifyingKey::from_bytes(pubkey).map_err(|_| CryptoError::BadSignature)?;
    let sig = Signature::from_bytes(signature);
    key.verify_strict(message, &sig)
        .map_err(|_| CryptoError::BadSignature)
}

/// Derive a child tree key: `SHAKE256(parent ‖ side_key)` truncated to
/// 16 bytes.
///
/// `side_key` is one of the two global direction keys; which one is chosen
/// by the bit of the timestamp path being walked.
pub fn kdf_tree_child(
    parent: &[u8; TREE_KEY_LEN],
    side_key: &[u8; TREE_SIDE_KEY_LEN],
) -> [u8; TREE_KEY_LEN] {
    let mut xof = Shake256::default();
    xof.update(parent);
    xof.update(side_key);

    let mut child = [0u8; TREE_KEY_LEN];
    xof.finalize_xof().read(&mut child);
    child
}

/// Expand a leaf tree key into the 32-byte symmetric key that encrypts the
/// frame at that leaf's timestamp: `SHAKE256(tree_key)` at 32-byte width.
pub fn kdf_tree_leaf(tree_key: &[u8; TREE_KEY_LEN]) -> [u8; SYMMETRIC_KEY_LEN] {
    let mut xof = Shake256::default();
    xof.update(tree_key);

    let mut sym = [0u8; SYMMETRIC_KEY_LEN];
    xof.finalize_xof().read(&mut sym);
    sym
}

/// Keyed 64-byte expansion: `SHAKE256(key ‖ le32(index))`.
///
/// Used by the entropy pool to stretch a small TRNG seed into pool-sized
/// blocks without touching the TRNG again.
pub fn keyed_expand_64(key: &[u8], index: u32) -> [u8; 64] {
    let mut xof = Shake256::default();
    xof.update(key);
    xof.update(&index.to_le_bytes());

    let mut block = [0u8; 64];
    xof.finalize_xof().read(&mut block);
    block
}
