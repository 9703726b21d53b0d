//! Per-device build-time secrets.
//!
//! Each decoder is provisioned at build time with its identity and the key
//! material required to validate broadcast traffic. On the target these
//! values are compiled in and linker-patched per device; the simulator
//! loads them from a secrets file. Nothing here is ever written at runtime.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{PUBLIC_KEY_LEN, SYMMETRIC_KEY_LEN, TREE_SIDE_KEY_LEN};

/// The compiled-in secrets of one decoder.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DeviceSecrets {
    /// This decoder's 32-bit identity. Subscription updates are encrypted
    /// to one decoder id; a packet for another device fails decryption.
    pub decoder_id: u32,
    /// Public half of the headend signing key. Every frame and update
    /// packet is verified against it.
    pub encoder_public_key: [u8; PUBLIC_KEY_LEN],
    /// Per-device symmetric key under which subscription updates addressed
    /// to this decoder are encrypted.
    pub id_key: [u8; SYMMETRIC_KEY_LEN],
    /// Global direction key mixed in when descending to a left child of the
    /// timestamp tree.
    pub left_tree_key: [u8; TREE_SIDE_KEY_LEN],
    /// Global direction key mixed in when descending to a right child.
    pub right_tree_key: [u8; TREE_SIDE_KEY_LEN],
}
