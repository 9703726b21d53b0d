//! Fault-injection countermeasures.
//!
//! The attack model assumes an adversary who can glitch the clock or supply
//! voltage precisely enough to make a single instruction misbehave: one
//! skipped branch, one corrupted load, per decision point. Three
//! countermeasures are woven through every security decision:
//!
//! 1. **Randomized delays** decouple the timing of a security check from
//!    the observable actions around it, so a glitch cannot be aimed at the
//!    check. The small delay draws from a pre-filled entropy pool and never
//!    touches the TRNG (it runs inside time-critical code); the large
//!    ranged delay spins for a fresh 16-bit TRNG count and runs once per
//!    dispatched command.
//! 2. **Triple-read predicates** evaluate a security-gating condition three
//!    times. Blocking conditions are OR-combined so a single glitched read
//!    still blocks; allowing conditions are AND-combined so a single
//!    glitched read still blocks. Reads go through [`black_box`] so the
//!    optimizer cannot fold them into one.
//! 3. **Redundant computation** runs a derivation twice and compares the
//!    results in constant time; divergence means a fault was injected into
//!    one of the runs.
//!
//! ## Entropy pool
//!
//! A 128-byte pool refreshed by keyed SHAKE256 expansion of an 8-byte TRNG
//! seed. Fresh blocks are XORed over the previous contents so residual
//! entropy is never discarded. The dispatcher tops the pool up between
//! requests; drawing from an exhausted pool is an unrecoverable fault.

use core::hint::black_box;
use core::sync::atomic::{compiler_fence, Ordering};

use zeroize::Zeroize;

use crate::board::Board;
use crate::{bytes, crypto, rng, util};

/// Entropy pool size in bytes.
pub const POOL_SIZE: usize = 128;

/// Refill threshold: the dispatcher refills when fewer than this many bytes
/// remain, so a single request can never drain the pool mid-pipeline.
pub const POOL_REFILL_WATERMARK: usize = 64;

/// TRNG seed bytes stretched into each pool refresh.
const POOL_SEED_LEN: usize = 8;

/// Fault detection error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// Redundant computation produced diverging results.
    RedundantMismatch,
}

impl core::fmt::Display for FaultError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::RedundantMismatch => write!(f, "redundant computation mismatch detected"),
        }
    }
}

impl std::error::Error for FaultError {}

/// Pre-generated entropy for time-critical randomized delays.
pub struct EntropyPool {
    pool: [u8; POOL_SIZE],
    /// Next unread byte; `POOL_SIZE` means unset or exhausted.
    cursor: usize,
}

impl EntropyPool {
    /// Create an unset pool. It must be refilled before the first draw.
    pub const fn new() -> Self {
        Self {
            pool: [0u8; POOL_SIZE],
            cursor: POOL_SIZE,
        }
    }

    /// Remaining unread bytes.
    #[inline]
    fn remaining(&self) -> usize {
        POOL_SIZE - self.cursor
    }

    /// Whether the pool has no bytes left to draw.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Whether the pool is below the refill watermark.
    pub fn is_low(&self) -> bool {
        self.remaining() < POOL_REFILL_WATERMARK
    }

    /// Refresh the pool from the TRNG.
    ///
    /// Fetches an 8-byte debiased seed, stretches it to [`POOL_SIZE`] bytes
    /// with keyed SHAKE256 expansion over two block indices, and XORs the
    /// result into the existing pool contents. Resets the cursor.
    pub fn refill<B: Board>(&mut self, board: &mut B) {
        let mut seed = [0u8; POOL_SEED_LEN];
        rng::fill_unbiased(board, &mut seed);

        for i in 0..2u32 {
            let mut block = crypto::keyed_expand_64(&seed, i);
            bytes::xor_bytes(&block, &mut self.pool[i as usize * 64..(i as usize + 1) * 64]);
            block.zeroize();
        }

        seed.zeroize();
        self.cursor = 0;
    }

    /// Spin for 0..=255 ticks drawn from the pool.
    ///
    /// Must not reach the TRNG; the pool was filled ahead of time exactly so
    /// this can run between crypto calls without a timing tell. Halts if the
    /// pool is exhausted, which the dispatcher watermark makes unreachable.
    pub fn small_delay<B: Board>(&mut self, board: &mut B) {
        util::assert_or_halt(!self.is_empty());
        let ticks = self.pool[self.cursor];
        self.cursor += 1;
        board.delay_ticks(u32::from(ticks));
    }
}

impl Default for EntropyPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Spin for a fresh 16-bit TRNG count.
///
/// Run once per dispatched command, before handling it, to desynchronize
/// the pipeline from the request's arrival time. The TRNG round-trip itself
/// adds a couple of milliseconds of jitter on top of the spin.
pub fn ranged_delay<B: Board>(board: &mut B) {
    let spin = rng::random_u16(board);
    board.delay_ticks(u32::from(spin));
}

/// Evaluate a blocking condition three times; any tripped read blocks.
///
/// Use for conditions that must *stop* an action (signature failed,
/// out of range): the attacker has to win three glitches in a row to slip
/// past, instead of one.
#[inline]
pub fn redundant_any<F: FnMut() -> bool>(mut read: F) -> bool {
    let first = black_box(read());
    let second = black_box(read());
    let third = black_box(read());
    first | second | third
}

/// Evaluate an allowing condition three times; any failed read blocks.
///
/// Use for conditions that must *permit* an action: a single glitched read
/// turns into a denial, never an allowance.
#[inline]
pub fn redundant_all<F: FnMut() -> bool>(mut read: F) -> bool {
    let first = black_box(read());
    let second = black_box(read());
    let third = black_box(read());
    first & second & third
}

/// Run a key derivation twice and require identical results.
///
/// The comparison is constant-time and the second copy is zeroized before
/// returning. A mismatch means one of the runs was faulted.
pub fn redundant_compute<const N: usize, F: Fn() -> [u8; N]>(
    compute: F,
) -> Result<[u8; N], FaultError> {
    let first = compute();
    // Keep the two runs as distinct computations.
    compiler_fence(Ordering::SeqCst);
    let mut second = compute();

    let matched = crate::ct::ct_eq(&first, &second);
    second.zeroize();

    if matched {
        Ok(first)
    } else {
        Err(FaultError::RedundantMismatch)
    }
}
