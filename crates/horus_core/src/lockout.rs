//! Attack lockout, persisted across resets.
//!
//! When tampering is detected the decoder must stop serving requests for a
//! fixed interval, and a power cycle must not shorten it: the counter lives
//! in its own flash page and is rewritten after every elapsed period, so
//! cutting power mid-lockout costs the attacker at most one period. On boot
//! the counter is replayed before the first host byte is read.
//!
//! A counter larger than the maximum period count can only come from
//! attacker-induced flash corruption; it is clamped to the maximum rather
//! than trusted.

use crate::board::Board;
use crate::{bytes, util};

/// Number of lockout periods written when an attack is detected.
pub const LOCKOUT_MAX_PERIODS: u32 = 60;

/// Length of one lockout period in microseconds.
pub const LOCKOUT_PERIOD_US: u32 = 100_000;

/// Read the persisted period counter.
fn read_counter<B: Board>(board: &B) -> u32 {
    let mut word = [0u8; 4];
    board.flash_read(board.lockout_addr(), &mut word);
    bytes::load_le32(&word)
}

/// Persist a new period counter: page erase, then program.
///
/// Flash primitives failing here is unrecoverable; a lockout that cannot be
/// persisted must not be skippable either.
fn persist_counter<B: Board>(board: &mut B, periods: u32) {
    let addr = board.lockout_addr();
    util::assert_or_halt(board.flash_erase_page(addr).is_ok());
    util::assert_or_halt(board.flash_write(addr, &periods.to_le_bytes()).is_ok());
}

/// Serve out any remaining lockout time.
///
/// Runs on every boot before the first request, and immediately after an
/// attack is recorded. While the counter is positive: delay one period,
/// decrement, persist. The final zero is persisted explicitly so the next
/// boot starts clean.
pub fn lockout_process<B: Board>(board: &mut B) {
    let mut periods = read_counter(board);

    if periods > LOCKOUT_MAX_PERIODS {
        periods = LOCKOUT_MAX_PERIODS;
        persist_counter(board, periods);
    }

    // The clamped value must be what flash now holds; divergence means the
    // read or the write above was glitched.
    util::assert_or_halt(periods == read_counter(board));

    while periods > 0 {
        board.delay_us(LOCKOUT_PERIOD_US);
        periods -= 1;
        persist_counter(board, periods);
    }

    util::assert_or_halt(periods == 0);
    persist_counter(board, 0);
}

/// Record an attack and serve the full lockout before returning.
///
/// Callers treat this as the end of the current request: the counter is
/// forced to [`LOCKOUT_MAX_PERIODS`], persisted, and then served in full.
/// Power-cycling mid-way resumes from the persisted remainder at next boot.
pub fn attack_detected<B: Board>(board: &mut B) {
    persist_counter(board, LOCKOUT_MAX_PERIODS);
    lockout_process(board);
}
