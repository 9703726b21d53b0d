//! Subscription records, the slotted flash store, and the update pipeline.
//!
//! A subscription authorizes one channel for an inclusive timestamp
//! interval. It carries the channel's outer key and a minimal node-cover of
//! the interval in the timestamp tree; the cover is what lets a compact
//! record unlock any per-timestamp key inside the interval and none outside
//! it.
//!
//! ## Flash layout
//!
//! The store is nine fixed slots, one flash page each, at a known address.
//! Slot 0 is the channel-0 subscription baked in at build time (every
//! decoder is implicitly subscribed to channel 0) and is never rewritten.
//! A slot is valid iff its trailing magic word matches
//! [`SUBSCRIPTION_MAGIC`]; because the magic sits at the end of the record
//! and flash programs in address order, a torn write leaves the slot
//! invalid rather than half-trusted.
//!
//! ## Update policy
//!
//! A verified, decrypted record replaces the slot already holding its
//! channel if one exists, otherwise it takes the first free slot. Reuse
//! before fill keeps at most one valid slot per channel and stops an
//! attacker from fragmenting the store with a parade of new channels.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::board::{Board, FLASH_PAGE_SIZE};
use crate::crypto::{SIGNATURE_LEN, SYMMETRIC_KEY_LEN, SYMMETRIC_METADATA_LEN, TREE_KEY_LEN};
use crate::dispatch::Decoder;
use crate::{bytes, crypto, fiproc, util};

/// Number of subscription slots, including the baked-in channel-0 slot.
pub const MAX_CHANNEL_COUNT: usize = 9;

/// Maximum number of tree keys a cover can carry.
pub const MAX_TREE_KEYS: usize = 126;

/// Validity sentinel, written last within a slot. `BNYA` little-endian.
pub const SUBSCRIPTION_MAGIC: u32 = 0x41594E42;

/// On-flash record size: tree keys, channel key, interval, metadata, pad.
pub const SUBSCRIPTION_RECORD_LEN: usize = 2080;

/// Signed portion of an update packet: decoder id plus ciphertext.
pub const UPDATE_PAYLOAD_LEN: usize = 4 + SYMMETRIC_METADATA_LEN + SUBSCRIPTION_RECORD_LEN;

/// Total update packet size: payload plus trailing signature.
pub const UPDATE_PACKET_LEN: usize = UPDATE_PAYLOAD_LEN + SIGNATURE_LEN;

const KCH_OFFSET: usize = MAX_TREE_KEYS * TREE_KEY_LEN;
const START_OFFSET: usize = KCH_OFFSET + SYMMETRIC_KEY_LEN;
const END_OFFSET: usize = START_OFFSET + 8;
const CHANNEL_OFFSET: usize = END_OFFSET + 8;
const KEY_COUNT_OFFSET: usize = CHANNEL_OFFSET + 4;
const MAGIC_OFFSET: usize = KEY_COUNT_OFFSET + 4;

/// One subscription record, as stored in a flash slot.
///
/// Key material is zeroized when a parsed copy goes out of scope.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Subscription {
    /// Minimal node-cover of `[start, end]`, canonical left-to-right order.
    /// Only the first `key_count` entries are populated.
    pub ktree: [[u8; TREE_KEY_LEN]; MAX_TREE_KEYS],
    /// Outer channel key; decrypts the timestamped middle layer of a frame.
    pub kch: [u8; SYMMETRIC_KEY_LEN],
    /// First authorized timestamp, inclusive.
    pub start: u64,
    /// Last authorized timestamp, inclusive.
    pub end: u64,
    /// The channel this record authorizes.
    pub channel: u32,
    /// Number of populated `ktree` entries; `1..=126` after validation.
    pub key_count: u32,
    /// Validity sentinel; equals [`SUBSCRIPTION_MAGIC`] in a valid slot.
    pub magic: u32,
}

impl Subscription {
    /// Parse a record from its exact on-flash encoding.
    ///
    /// Parsing cannot fail; validity is the caller's magic check.
    pub fn parse(raw: &[u8; SUBSCRIPTION_RECORD_LEN]) -> Self {
        let mut ktree = [[0u8; TREE_KEY_LEN]; MAX_TREE_KEYS];
        for (i, key) in ktree.iter_mut().enumerate() {
            key.copy_from_slice(&raw[i * TREE_KEY_LEN..(i + 1) * TREE_KEY_LEN]);
        }

        let mut kch = [0u8; SYMMETRIC_KEY_LEN];
        kch.copy_from_slice(&raw[KCH_OFFSET..START_OFFSET]);

        Self {
            ktree,
            kch,
            start: bytes::load_le64(&raw[START_OFFSET..]),
            end: bytes::load_le64(&raw[END_OFFSET..]),
            channel: bytes::load_le32(&raw[CHANNEL_OFFSET..]),
            key_count: bytes::load_le32(&raw[KEY_COUNT_OFFSET..]),
            magic: bytes::load_le32(&raw[MAGIC_OFFSET..]),
        }
    }

    /// Encode the record into its on-flash layout, pad zeroed.
    pub fn to_bytes(&self) -> [u8; SUBSCRIPTION_RECORD_LEN] {
        let mut raw = [0u8; SUBSCRIPTION_RECORD_LEN];
        for (i, key) in self.ktree.iter().enumerate() {
            raw[i * TREE_KEY_LEN..(i + 1) * TREE_KEY_LEN].copy_from_slice(key);
        }
        raw[KCH_OFFSET..START_OFFSET].copy_from_slice(&self.kch);
        bytes::store_le64(self.start, &mut raw[START_OFFSET..]);
        bytes::store_le64(self.end, &mut raw[END_OFFSET..]);
        bytes::store_le32(self.channel, &mut raw[CHANNEL_OFFSET..]);
        bytes::store_le32(self.key_count, &mut raw[KEY_COUNT_OFFSET..]);
        bytes::store_le32(self.magic, &mut raw[MAGIC_OFFSET..]);
        raw
    }
}

/// Subscription update pipeline errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateError {
    /// The decrypted record targets channel 0, which is immutable. Benign.
    ImmutableChannel,
    /// All user slots hold other channels. Benign.
    StoreFull,
    /// Tampering was detected and the lockout has already been served.
    AttackLockedOut,
}

impl core::fmt::Display for UpdateError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::ImmutableChannel => write!(f, "channel 0 subscription is immutable"),
            Self::StoreFull => write!(f, "subscription store full"),
            Self::AttackLockedOut => write!(f, "subscription update rejected"),
        }
    }
}

impl std::error::Error for UpdateError {}

/// Flash address of slot `index`.
pub fn slot_addr<B: Board>(board: &B, index: usize) -> u32 {
    util::assert_or_halt(index < MAX_CHANNEL_COUNT);
    board.subscription_base() + (index * FLASH_PAGE_SIZE) as u32
}

/// Snapshot the raw bytes of slot `index`.
fn read_slot<B: Board>(board: &B, index: usize) -> [u8; SUBSCRIPTION_RECORD_LEN] {
    let mut raw = [0u8; SUBSCRIPTION_RECORD_LEN];
    board.flash_read(slot_addr(board, index), &mut raw);
    raw
}

/// Return the subscription in slot `index` if the slot is valid.
pub fn get_subscription<B: Board>(board: &B, index: usize) -> Option<Subscription> {
    if index >= MAX_CHANNEL_COUNT {
        return None;
    }
    let record = Subscription::parse(&read_slot(board, index));
    if record.magic == SUBSCRIPTION_MAGIC {
        Some(record)
    } else {
        None
    }
}

/// Find the valid subscription for `channel`, scanning slots in order.
pub fn get_subscription_by_channel<B: Board>(board: &B, channel: u32) -> Option<Subscription> {
    (0..MAX_CHANNEL_COUNT)
        .filter_map(|index| get_subscription(board, index))
        .find(|record| record.channel == channel)
}

/// Erase slot `index` and program `record` into it.
///
/// The record must already carry the valid magic: a successful write yields
/// a valid slot, so writing anything else would plant a half-trusted record.
fn write_slot<B: Board>(board: &mut B, index: usize, record: &[u8; SUBSCRIPTION_RECORD_LEN]) {
    util::assert_or_halt(bytes::load_le32(&record[MAGIC_OFFSET..]) == SUBSCRIPTION_MAGIC);

    let addr = slot_addr(board, index);
    util::assert_or_halt(board.flash_erase_page(addr).is_ok());
    util::assert_or_halt(board.flash_write(addr, record).is_ok());
}

impl<B: Board> Decoder<B> {
    /// Ingest one subscription update packet.
    ///
    /// Verify the headend signature over the payload, decrypt the record
    /// under this device's `ID_KEY`, validate it, and persist it per the
    /// reuse-then-fill policy. Updates are addressed to a single decoder,
    /// so a failed signature or decryption is tampering, not noise; both
    /// engage the lockout, as does a decrypted record whose interval, key
    /// count, or magic is inconsistent despite the passing signature.
    pub(crate) fn update_subscription(
        &mut self,
        packet: &[u8; UPDATE_PACKET_LEN],
    ) -> Result<(), UpdateError> {
        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(&packet[UPDATE_PAYLOAD_LEN..]);

        let sig_failed = crypto::verify_asymmetric(
            &signature,
            &packet[..UPDATE_PAYLOAD_LEN],
            &self.secrets.encoder_public_key,
        )
        .is_err();
        self.small_delay();
        if fiproc::redundant_any(|| sig_failed) {
            self.attack();
            return Err(UpdateError::AttackLockedOut);
        }

        // Decryption under the id key is also the addressing check: a
        // packet built for another decoder id fails here.
        let mut plain = [0u8; SUBSCRIPTION_RECORD_LEN];
        let decrypt_failed = crypto::decrypt_symmetric(
            &mut plain,
            &packet[4..UPDATE_PAYLOAD_LEN],
            &self.secrets.id_key,
        )
        .is_err();
        self.small_delay();
        if fiproc::redundant_any(|| decrypt_failed) {
            self.attack();
            return Err(UpdateError::AttackLockedOut);
        }

        let record = Subscription::parse(&plain);
        plain.zeroize();

        self.small_delay();
        if record.channel == 0 {
            // Not an attack: the packet is authentic, the request merely
            // asks for something no decoder permits.
            return Err(UpdateError::ImmutableChannel);
        }

        self.small_delay();
        let interval_invalid = record.end < record.start;
        if fiproc::redundant_any(|| interval_invalid) {
            self.attack();
            return Err(UpdateError::AttackLockedOut);
        }

        self.small_delay();
        let count_invalid = record.key_count == 0 || record.key_count > MAX_TREE_KEYS as u32;
        if fiproc::redundant_any(|| count_invalid) {
            self.attack();
            return Err(UpdateError::AttackLockedOut);
        }

        self.small_delay();
        let magic_invalid = record.magic != SUBSCRIPTION_MAGIC;
        if fiproc::redundant_any(|| magic_invalid) {
            self.attack();
            return Err(UpdateError::AttackLockedOut);
        }

        // Reuse the slot already holding this channel, if any. Slot 0 is
        // never touched.
        for index in 1..MAX_CHANNEL_COUNT {
            self.small_delay();
            if let Some(existing) = get_subscription(&self.board, index) {
                if existing.channel == record.channel {
                    write_slot(&mut self.board, index, &record.to_bytes());
                    return Ok(());
                }
            }
        }

        // Otherwise take the first invalid slot.
        for index in 1..MAX_CHANNEL_COUNT {
            self.small_delay();
            if get_subscription(&self.board, index).is_none() {
                write_slot(&mut self.board, index, &record.to_bytes());
                return Ok(());
            }
        }

        Err(UpdateError::StoreFull)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::sim::SimBoard;

    fn sample_record(channel: u32) -> Subscription {
        let mut ktree = [[0u8; TREE_KEY_LEN]; MAX_TREE_KEYS];
        ktree[0] = [0xA1; TREE_KEY_LEN];
        ktree[1] = [0xB2; TREE_KEY_LEN];
        Subscription {
            ktree,
            kch: [0xC3; SYMMETRIC_KEY_LEN],
            start: 0x1000,
            end: 0xFFFF_0000_0000,
            channel,
            key_count: 2,
            magic: SUBSCRIPTION_MAGIC,
        }
    }

    #[test]
    fn record_layout_roundtrip() {
        let record = sample_record(7);
        let raw = record.to_bytes();

        assert_eq!(&raw[..TREE_KEY_LEN], &[0xA1; TREE_KEY_LEN]);
        assert_eq!(bytes::load_le32(&raw[CHANNEL_OFFSET..]), 7);
        assert_eq!(bytes::load_le32(&raw[MAGIC_OFFSET..]), SUBSCRIPTION_MAGIC);
        // Pad bytes terminate the record.
        assert_eq!(&raw[MAGIC_OFFSET + 4..], &[0u8; 4]);

        let parsed = Subscription::parse(&raw);
        assert_eq!(parsed.start, record.start);
        assert_eq!(parsed.end, record.end);
        assert_eq!(parsed.key_count, 2);
        assert_eq!(parsed.ktree[1], record.ktree[1]);
    }

    #[test]
    fn erased_slot_is_invalid() {
        let board = SimBoard::new();
        assert!(get_subscription(&board, 1).is_none());
        assert!(get_subscription_by_channel(&board, 1).is_none());
    }

    #[test]
    fn out_of_range_slot_is_invalid() {
        let board = SimBoard::new();
        assert!(get_subscription(&board, MAX_CHANNEL_COUNT).is_none());
    }

    #[test]
    fn written_slot_is_found_by_channel() {
        let mut board = SimBoard::new();
        let record = sample_record(5);
        write_slot(&mut board, 2, &record.to_bytes());

        let found = get_subscription_by_channel(&board, 5).expect("slot should be valid");
        assert_eq!(found.channel, 5);
        assert_eq!(found.kch, record.kch);
        assert!(get_subscription_by_channel(&board, 6).is_none());
    }

    #[test]
    #[should_panic(expected = "unrecoverable fault")]
    fn writing_record_without_magic_halts() {
        let mut board = SimBoard::new();
        let mut record = sample_record(5);
        record.magic = 0;
        write_slot(&mut board, 2, &record.to_bytes());
    }

    #[test]
    fn torn_write_leaves_slot_invalid() {
        let mut board = SimBoard::new();
        let record = sample_record(3);

        // Power fails one byte into the magic word.
        board.set_flash_budget(MAGIC_OFFSET + 1);
        write_slot(&mut board, 1, &record.to_bytes());

        assert!(board.is_dead());
        assert!(get_subscription(&board, 1).is_none());
    }
}
