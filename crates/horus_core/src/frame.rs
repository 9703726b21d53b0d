//! Frame packets and the decode pipeline.
//!
//! A frame arrives wrapped twice: the outer layer is encrypted under the
//! channel key and binds the timestamp to the channel; the inner layer is
//! encrypted under a per-timestamp key derived from the subscription's tree
//! cover and binds the payload to that single timestamp. The whole payload
//! is signed by the headend.
//!
//! Broadcast reception is lossy and replayable, so early failures
//! (unknown channel, bad signature, stale timestamp, timestamp outside the
//! subscription) are benign and simply drop the frame. Failures that can
//! only exist if someone forged past an earlier gate (inner layers failing
//! to decrypt *after* the signature verified, an impossible frame length)
//! are attacks and engage the lockout.

use zeroize::Zeroize;

use crate::board::Board;
use crate::crypto::{self, SIGNATURE_LEN, SYMMETRIC_METADATA_LEN};
use crate::dispatch::Decoder;
use crate::transport::{self, MsgType};
use crate::{bytes, fiproc, subscription, tree, util};

/// Largest frame payload a packet can carry.
pub const MAX_FRAME_SIZE: usize = 64;

/// Decrypted innermost layer: length word plus frame bytes.
pub const FRAME_DATA_LEN: usize = 4 + MAX_FRAME_SIZE;

/// Decrypted middle layer: timestamp, inner ciphertext, pad.
pub const TIMESTAMPED_FRAME_LEN: usize = 8 + SYMMETRIC_METADATA_LEN + FRAME_DATA_LEN + 4;

/// Signed portion of a frame packet: channel id plus outer ciphertext.
pub const FRAME_PAYLOAD_LEN: usize = 4 + SYMMETRIC_METADATA_LEN + TIMESTAMPED_FRAME_LEN;

/// Total frame packet size: payload plus trailing signature.
pub const FRAME_PACKET_LEN: usize = FRAME_PAYLOAD_LEN + SIGNATURE_LEN;

/// Frame decode pipeline errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// No valid subscription covers the packet's channel. Benign.
    NoSubscription,
    /// The headend signature over the payload did not verify. Benign:
    /// broadcast noise corrupts signatures routinely.
    BadSignature,
    /// The frame's timestamp does not advance the monotonicity cursor.
    /// Benign: replay and reorder happen naturally on broadcast.
    NotMonotonic,
    /// The timestamp falls outside the subscription interval. Benign:
    /// common around expiry.
    OutOfRange,
    /// Tampering was detected and the lockout has already been served.
    AttackLockedOut,
}

impl core::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NoSubscription => write!(f, "no subscription for channel"),
            Self::BadSignature => write!(f, "bad frame signature"),
            Self::NotMonotonic => write!(f, "frame timestamp not monotonic"),
            Self::OutOfRange => write!(f, "timestamp outside subscription"),
            Self::AttackLockedOut => write!(f, "frame rejected"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Monotonicity cursor over accepted frames.
///
/// Reset at power-on, never persisted. A frame must carry a timestamp
/// strictly greater than the last *successfully decoded* frame's; the
/// cursor advances only at the end of a successful decode, so a frame that
/// fails a later pipeline stage does not burn its timestamp.
pub struct TimestampMonitor {
    received_first_frame: bool,
    current_timestamp: u64,
}

impl TimestampMonitor {
    /// Fresh cursor: the next frame, whatever its timestamp, is admitted.
    pub const fn new() -> Self {
        Self {
            received_first_frame: false,
            current_timestamp: 0,
        }
    }

    /// Whether a frame at `t` would advance the cursor.
    pub fn admits(&self, t: u64) -> bool {
        !self.received_first_frame || t > self.current_timestamp
    }

    /// Advance the cursor to `t` after a successful decode.
    fn advance(&mut self, t: u64) {
        self.received_first_frame = true;
        self.current_timestamp = t;
    }
}

impl Default for TimestampMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Board> Decoder<B> {
    /// Decode one frame packet and, on success, emit the plaintext frame to
    /// the host as the `D` response.
    pub(crate) fn decode_frame(&mut self, packet: &[u8; FRAME_PACKET_LEN]) -> Result<(), DecodeError> {
        let channel = bytes::load_le32(&packet[..4]);
        let sub = subscription::get_subscription_by_channel(&self.board, channel);
        self.small_delay();
        let Some(sub) = sub else {
            return Err(DecodeError::NoSubscription);
        };

        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(&packet[FRAME_PAYLOAD_LEN..]);
        let sig_failed = crypto::verify_asymmetric(
            &signature,
            &packet[..FRAME_PAYLOAD_LEN],
            &self.secrets.encoder_public_key,
        )
        .is_err();
        self.small_delay();
        if fiproc::redundant_any(|| sig_failed) {
            // Signatures break under ordinary broadcast noise; only
            // failures behind a passing signature indicate an attack.
            return Err(DecodeError::BadSignature);
        }

        self.small_delay();
        let mut timestamped = [0u8; TIMESTAMPED_FRAME_LEN];
        let outer_failed = crypto::decrypt_symmetric(
            &mut timestamped,
            &packet[4..FRAME_PAYLOAD_LEN],
            &sub.kch,
        )
        .is_err();
        self.small_delay();
        if fiproc::redundant_any(|| outer_failed) {
            // A corrupted layer under an intact signature cannot happen by
            // accident.
            self.attack();
            return Err(DecodeError::AttackLockedOut);
        }

        let timestamp = bytes::load_le64(&timestamped[..8]);

        self.small_delay();
        if !self.clock.admits(timestamp) {
            return Err(DecodeError::NotMonotonic);
        }

        let located = tree::key_index_for_time(&sub, timestamp);
        self.small_delay();
        let Some((index, vertex)) = located else {
            return Err(DecodeError::OutOfRange);
        };

        self.small_delay();
        let mut kt = match fiproc::redundant_compute(|| {
            tree::derive_tree_key(timestamp, &sub.ktree[index], vertex, &self.secrets)
        }) {
            Ok(key) => key,
            // Diverging derivations mean one run was faulted.
            Err(_) => util::halt_and_catch_fire(),
        };

        let mut frame_data = [0u8; FRAME_DATA_LEN];
        let inner_failed = crypto::decrypt_symmetric(
            &mut frame_data,
            &timestamped[8..8 + SYMMETRIC_METADATA_LEN + FRAME_DATA_LEN],
            &kt,
        )
        .is_err();
        kt.zeroize();
        self.small_delay();
        if fiproc::redundant_any(|| inner_failed) {
            self.attack();
            return Err(DecodeError::AttackLockedOut);
        }

        let length = bytes::load_le32(&frame_data[..4]) as usize;
        self.small_delay();
        let length_forged = length > MAX_FRAME_SIZE;
        if fiproc::redundant_any(|| length_forged) {
            // Forged plaintext behind two valid layers: unambiguous attack.
            self.attack();
            return Err(DecodeError::AttackLockedOut);
        }

        // The frame is good; only now does it consume its timestamp.
        self.clock.advance(timestamp);

        transport::send_msg(&mut self.board, MsgType::Decode, &frame_data[4..4 + length]);
        Ok(())
    }
}
