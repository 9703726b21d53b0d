//! Hardware abstraction.
//!
//! Everything the security pipeline needs from the hardware goes through the
//! [`Board`] trait: the flash controller, the TRNG, the host UART byte link,
//! and the delay timers. The pipeline itself contains no peripheral code, so
//! the exact same request handling runs on the target board and on the
//! in-memory [`sim::SimBoard`] backend used by the test-suite and the
//! host-side simulator.
//!
//! ## Memory protection
//!
//! On hardware, [`Board::init`] is where the MPU is configured before any
//! host byte is read: flash execute + read-only, SRAM read-write no-execute
//! (minus an 8 KiB execute + read-only carve-out at the SRAM base for the
//! self-flashing helpers), peripherals read-write no-execute, everything
//! else disabled. The software backend has nothing to protect and treats it
//! as a no-op.

pub mod sim;

/// Flash erase/program granularity in bytes. One subscription slot occupies
/// exactly one page so that a slot update is a single erase-then-program
/// cycle.
pub const FLASH_PAGE_SIZE: usize = 8192;

/// Flash controller error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    /// Page erase did not complete.
    Erase,
    /// Program operation did not complete.
    Write,
}

impl core::fmt::Display for FlashError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Erase => write!(f, "flash page erase failed"),
            Self::Write => write!(f, "flash program failed"),
        }
    }
}

impl std::error::Error for FlashError {}

/// Peripheral access for the decoder pipeline.
///
/// Implementations are expected to be strictly sequential: the pipeline is
/// single-threaded and request-driven, `read_byte` blocks until a host byte
/// arrives, and flash operations block until the controller signals
/// completion.
pub trait Board {
    /// One-time hardware bring-up: memory protection, clocks, UART, TRNG.
    /// Called once, before the lockout replay and before any host byte is
    /// read.
    fn init(&mut self);

    /// Read one raw 32-bit word from the hardware TRNG.
    ///
    /// Raw words may be biased; consumers go through
    /// [`crate::rng::fill_unbiased`] rather than using this directly.
    fn trng_word(&mut self) -> u32;

    /// Busy-wait for `ticks` timer ticks.
    fn delay_ticks(&mut self, ticks: u32);

    /// Busy-wait for `us` microseconds.
    fn delay_us(&mut self, us: u32);

    /// Base flash address of subscription slot 0. Slot `i` lives at
    /// `subscription_base() + i * FLASH_PAGE_SIZE`.
    fn subscription_base(&self) -> u32;

    /// Flash address of the page holding the persistent lockout counter.
    fn lockout_addr(&self) -> u32;

    /// Copy `out.len()` bytes of flash starting at `addr` into `out`.
    ///
    /// Flash is memory-mapped on the target; this is an infallible read.
    fn flash_read(&self, addr: u32, out: &mut [u8]);

    /// Erase the flash page containing `addr`. Erased flash reads `0xFF`.
    fn flash_erase_page(&mut self, addr: u32) -> Result<(), FlashError>;

    /// Program `data` into flash starting at `addr`. The target page must
    /// have been erased first. Bytes are programmed in address order, which
    /// is what makes "magic written last" a meaningful torn-write guard.
    fn flash_write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Blocking read of one byte from the host link.
    fn read_byte(&mut self) -> u8;

    /// Blocking write of one byte to the host link.
    fn write_byte(&mut self, byte: u8);
}
