//! Key-tree navigation and per-timestamp key derivation.
//!
//! The timestamp space `[0, 2^64)` is viewed as the leaves of a complete
//! binary tree of height 64. A node at depth `bits` covers every timestamp
//! whose high `bits` bits equal the node's prefix. A subscription stores
//! the minimal set of node keys whose subtrees exactly tile its interval;
//! from any one of those keys, repeated child derivation reaches every leaf
//! under it and no leaf outside it.
//!
//! Navigation re-runs the cover construction in reverse: walking levels
//! bottom-up, a range whose edges align to a full level contracts upward,
//! and an edge that cannot contract is exactly where the headend packaged a
//! key: either the one covering the requested timestamp, in which case the
//! search ends, or one to discard from the matching end of the stored list.

use zeroize::Zeroize;

use crate::crypto::{self, SYMMETRIC_KEY_LEN, TREE_KEY_LEN};
use crate::secrets::DeviceSecrets;
use crate::subscription::Subscription;
use crate::{fiproc, util};

/// Height of the timestamp tree; leaves are full 64-bit timestamps.
pub const MAX_TREE_HEIGHT: u8 = 64;

/// A node of the timestamp tree.
///
/// Covers every timestamp whose high `bits` bits equal `prefix`. `bits` of
/// 64 is a leaf; 0 is the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vertex {
    /// The node's path from the root, in the low `bits` bits.
    pub prefix: u64,
    /// Depth of the node; number of meaningful bits in `prefix`.
    pub bits: u8,
}

/// Locate the cover node whose subtree contains timestamp `t`.
///
/// Returns the index of that node's key within the subscription's stored
/// cover and the node's position, or `None` when `t` lies outside
/// `[start, end]`, evaluated with the triple-read discipline, since this
/// range check is what stands between an expired subscription and a key.
///
/// The loop maintains `start_prefix <= t <= end_prefix` and
/// `start_idx <= end_idx` (at the current level); violating either, or
/// over/underflowing a cursor, is an unrecoverable navigator fault.
pub fn key_index_for_time(sub: &Subscription, t: u64) -> Option<(usize, Vertex)> {
    util::assert_or_halt(sub.key_count >= 1);
    util::assert_or_halt(sub.key_count as usize <= crate::subscription::MAX_TREE_KEYS);

    let out_of_range = t < sub.start || sub.end < t;
    if fiproc::redundant_any(|| out_of_range) {
        return None;
    }

    let mut start_idx = 0usize;
    let mut end_idx = sub.key_count as usize - 1;

    let mut start_prefix = sub.start;
    let mut end_prefix = sub.end;
    let mut t = t;
    let mut bits = MAX_TREE_HEIGHT;

    loop {
        util::assert_or_halt(start_prefix <= t && t <= end_prefix);
        util::assert_or_halt(start_idx <= end_idx);

        if start_prefix & 1 == 0 && end_prefix & 1 == 1 {
            // Both edges align to a full sibling pair: contract one level.
            start_prefix >>= 1;
            end_prefix >>= 1;
            t >>= 1;
            bits -= 1;
        } else if start_prefix & 1 == 1 {
            // The left edge is itself a packaged node at this level.
            if start_prefix == t {
                return Some((
                    start_idx,
                    Vertex {
                        prefix: start_prefix,
                        bits,
                    },
                ));
            }
            // Packaged but not ours; discard it from the front.
            start_prefix = match start_prefix.checked_add(1) {
                Some(next) => next,
                None => util::halt_and_catch_fire(),
            };
            start_idx += 1;
        } else {
            // The right edge is a packaged node at this level.
            if end_prefix == t {
                return Some((
                    end_idx,
                    Vertex {
                        prefix: end_prefix,
                        bits,
                    },
                ));
            }
            // Packaged but not ours; discard it from the back.
            end_prefix = match end_prefix.checked_sub(1) {
                Some(prev) => prev,
                None => util::halt_and_catch_fire(),
            };
            end_idx = match end_idx.checked_sub(1) {
                Some(prev) => prev,
                None => util::halt_and_catch_fire(),
            };
        }
    }
}

/// Walk from a node key down `bits` levels along `prefix`, most significant
/// path bit first.
fn walk_to_leaf(
    path_prefix: u64,
    path_bits: u8,
    node_key: &[u8; TREE_KEY_LEN],
    secrets: &DeviceSecrets,
) -> [u8; TREE_KEY_LEN] {
    let mut key = *node_key;
    for level in 0..path_bits {
        let bit = path_bits - level - 1;
        let side = if path_prefix & (1u64 << bit) == 0 {
            &secrets.left_tree_key
        } else {
            &secrets.right_tree_key
        };
        key = crypto::kdf_tree_child(&key, side);
    }
    key
}

/// Derive the 32-byte symmetric key for timestamp `t` from the cover node
/// at `position` holding `node_key`.
///
/// If the cover node is itself the leaf, the tree key is used directly;
/// otherwise the remaining `64 - bits` levels are walked by the bits of
/// `t`, left or right per bit. Either way the leaf tree key is expanded to
/// the symmetric width and the intermediate is zeroized.
pub fn derive_tree_key(
    t: u64,
    node_key: &[u8; TREE_KEY_LEN],
    position: Vertex,
    secrets: &DeviceSecrets,
) -> [u8; SYMMETRIC_KEY_LEN] {
    let mut leaf_key = if position.bits == MAX_TREE_HEIGHT {
        util::assert_or_halt(position.prefix == t);
        *node_key
    } else if position.bits == 0 {
        // Root cover: the full timestamp is the path.
        util::assert_or_halt(position.prefix == 0);
        walk_to_leaf(t, MAX_TREE_HEIGHT, node_key, secrets)
    } else {
        let below = MAX_TREE_HEIGHT - position.bits;
        util::assert_or_halt(t >> below == position.prefix);
        // Strip the node's prefix; what remains of `t` is the path down.
        walk_to_leaf(t ^ (position.prefix << below), below, node_key, secrets)
    };

    let symmetric = crypto::kdf_tree_leaf(&leaf_key);
    leaf_key.zeroize();
    symmetric
}
