//! Software board backend.
//!
//! `SimBoard` is a byte-accurate software model of the decoder's peripherals:
//! a 512 KiB flash array with page erase semantics, queued UART streams, a
//! deterministic xorshift "TRNG", and delay timers that record instead of
//! spinning. The test-suite drives whole request/response conversations
//! against it, and the host-side simulator binary wraps it with real I/O.
//!
//! Two test-only affordances:
//!
//! - **Attentive host**: with auto-ACK enabled (the default), every
//!   ACK-expecting header or body chunk the decoder transmits is answered by
//!   queuing an ACK header on the receive side, so tests only enqueue
//!   request bytes.
//! - **Power cuts**: a flash write budget limits how many bytes may still be
//!   programmed. Once it runs out the board is "dead": flash and UART
//!   silently stop accepting writes, which is how torn subscription writes
//!   and interrupted lockouts are simulated.

use std::collections::VecDeque;

use super::{Board, FlashError, FLASH_PAGE_SIZE};
use crate::transport;

/// Simulated flash base address (mirrors the target memory map).
pub const SIM_FLASH_BASE: u32 = 0x1000_0000;

/// Simulated flash size: 512 KiB.
pub const SIM_FLASH_LEN: usize = 512 * 1024;

/// Simulated address of subscription slot 0.
pub const SIM_SUBSCRIPTION_BASE: u32 = 0x1006_0000;

/// Simulated address of the lockout counter page.
pub const SIM_LOCKOUT_ADDR: u32 = 0x1007_2000;

/// Where the auto-ACK parser is within the decoder's transmit stream.
enum TxPhase {
    /// Collecting a 4-byte header.
    Header,
    /// Consuming a message body.
    Body {
        msg_type: u8,
        remaining: usize,
        chunk_fill: usize,
    },
}

/// In-memory board: flash, UART queues, deterministic TRNG, recorded delays.
pub struct SimBoard {
    flash: Vec<u8>,
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    rng_state: u64,
    ticks_slept: u64,
    us_slept: u64,
    auto_ack: bool,
    tx_phase: TxPhase,
    tx_header: Vec<u8>,
    flash_budget: Option<usize>,
    dead: bool,
    dead_read_idx: usize,
}

impl SimBoard {
    /// Create a board with blank flash: subscription pages erased (`0xFF`),
    /// the lockout page zeroed the way the linker zeroes it in a fresh
    /// image.
    pub fn new() -> Self {
        Self::with_seed(0x9E37_79B9_7F4A_7C15)
    }

    /// Create a board whose TRNG stream is seeded with `seed`.
    pub fn with_seed(seed: u64) -> Self {
        let mut flash = vec![0xFFu8; SIM_FLASH_LEN];
        let lockout = (SIM_LOCKOUT_ADDR - SIM_FLASH_BASE) as usize;
        flash[lockout..lockout + FLASH_PAGE_SIZE].fill(0);

        Self {
            flash,
            rx: VecDeque::new(),
            tx: Vec::new(),
            rng_state: if seed == 0 { 1 } else { seed },
            ticks_slept: 0,
            us_slept: 0,
            auto_ack: true,
            tx_phase: TxPhase::Header,
            tx_header: Vec::with_capacity(transport::MSG_HEADER_LEN),
            flash_budget: None,
            dead: false,
            dead_read_idx: 0,
        }
    }

    /// Patch bytes directly into the flash image, bypassing erase/program
    /// semantics. This is the linker: baking slot 0 or seeding a lockout
    /// counter happens here.
    pub fn load_flash(&mut self, addr: u32, data: &[u8]) {
        let start = self.offset(addr);
        self.flash[start..start + data.len()].copy_from_slice(data);
    }

    /// Read back a flash range for inspection.
    pub fn flash_bytes(&self, addr: u32, len: usize) -> Vec<u8> {
        let start = self.offset(addr);
        self.flash[start..start + len].to_vec()
    }

    /// Queue bytes on the host-to-decoder link.
    pub fn push_host_bytes(&mut self, data: &[u8]) {
        self.rx.extend(data);
    }

    /// Drain everything the decoder has transmitted so far.
    pub fn take_device_bytes(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.tx)
    }

    /// Number of unread host bytes still queued.
    pub fn pending_host_bytes(&self) -> usize {
        self.rx.len()
    }

    /// Disable or enable the attentive-host auto-ACK behavior.
    pub fn set_auto_ack(&mut self, enabled: bool) {
        self.auto_ack = enabled;
    }

    /// Allow at most `bytes` further flash-program bytes, then cut power.
    pub fn set_flash_budget(&mut self, bytes: usize) {
        self.flash_budget = Some(bytes);
    }

    /// Whether a simulated power cut has occurred.
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Total busy-wait ticks the decoder has requested.
    pub fn ticks_slept(&self) -> u64 {
        self.ticks_slept
    }

    /// Total microseconds the decoder has requested.
    pub fn us_slept(&self) -> u64 {
        self.us_slept
    }

    fn offset(&self, addr: u32) -> usize {
        let off = addr
            .checked_sub(SIM_FLASH_BASE)
            .unwrap_or_else(|| panic!("sim: address {addr:#010x} below flash"))
            as usize;
        assert!(off < SIM_FLASH_LEN, "sim: address {addr:#010x} beyond flash");
        off
    }

    /// Feed one transmitted byte to the attentive-host parser and queue any
    /// ACK the real host would send back.
    fn observe_tx_byte(&mut self, byte: u8) {
        let mut ack_owed: Option<u8> = None;

        match self.tx_phase {
            TxPhase::Header => {
                self.tx_header.push(byte);
                if self.tx_header.len() == transport::MSG_HEADER_LEN {
                    let msg_type = self.tx_header[1];
                    let len = u16::from_le_bytes([self.tx_header[2], self.tx_header[3]]) as usize;
                    self.tx_header.clear();

                    ack_owed = Some(msg_type);
                    if len > 0 {
                        self.tx_phase = TxPhase::Body {
                            msg_type,
                            remaining: len,
                            chunk_fill: 0,
                        };
                    }
                }
            }
            TxPhase::Body {
                msg_type,
                ref mut remaining,
                ref mut chunk_fill,
            } => {
                *remaining -= 1;
                *chunk_fill += 1;
                if *chunk_fill == transport::MSG_CHUNK_SIZE || *remaining == 0 {
                    ack_owed = Some(msg_type);
                    *chunk_fill = 0;
                    if *remaining == 0 {
                        self.tx_phase = TxPhase::Header;
                    }
                }
            }
        }

        if let Some(msg_type) = ack_owed {
            if self.wants_ack(msg_type) {
                self.queue_ack();
            }
        }
    }

    fn wants_ack(&self, msg_type: u8) -> bool {
        self.auto_ack && msg_type != b'A' && msg_type != b'G'
    }

    fn queue_ack(&mut self) {
        self.rx
            .extend([transport::MSG_MAGIC, b'A', 0x00, 0x00]);
    }

    /// Consume up to `want` bytes of flash-program budget, cutting power if
    /// it runs out.
    fn consume_budget(&mut self, want: usize) -> usize {
        match self.flash_budget {
            None => want,
            Some(ref mut budget) => {
                let granted = want.min(*budget);
                *budget -= granted;
                if granted < want {
                    self.dead = true;
                }
                granted
            }
        }
    }
}

impl Default for SimBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl Board for SimBoard {
    fn init(&mut self) {
        // Nothing to bring up; MPU and peripherals exist only on the target.
    }

    fn trng_word(&mut self) -> u32 {
        // xorshift64*
        let mut x = self.rng_state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.rng_state = x;
        (x.wrapping_mul(0x2545_F491_4F6C_DD1D) >> 32) as u32
    }

    fn delay_ticks(&mut self, ticks: u32) {
        self.ticks_slept += u64::from(ticks);
    }

    fn delay_us(&mut self, us: u32) {
        self.us_slept += u64::from(us);
    }

    fn subscription_base(&self) -> u32 {
        SIM_SUBSCRIPTION_BASE
    }

    fn lockout_addr(&self) -> u32 {
        SIM_LOCKOUT_ADDR
    }

    fn flash_read(&self, addr: u32, out: &mut [u8]) {
        let start = self.offset(addr);
        out.copy_from_slice(&self.flash[start..start + out.len()]);
    }

    fn flash_erase_page(&mut self, addr: u32) -> Result<(), FlashError> {
        if self.dead {
            return Ok(());
        }
        if self.flash_budget == Some(0) {
            self.dead = true;
            return Ok(());
        }
        let start = self.offset(addr);
        assert!(
            start % FLASH_PAGE_SIZE == 0,
            "sim: erase of unaligned address {addr:#010x}"
        );
        self.flash[start..start + FLASH_PAGE_SIZE].fill(0xFF);
        Ok(())
    }

    fn flash_write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        if self.dead {
            return Ok(());
        }
        let start = self.offset(addr);
        let granted = self.consume_budget(data.len());
        self.flash[start..start + granted].copy_from_slice(&data[..granted]);
        Ok(())
    }

    fn read_byte(&mut self) -> u8 {
        if self.dead {
            // A dead board produces an endless ACK stream so whatever
            // handshake was in flight when power failed terminates; every
            // byte the decoder emits afterwards is discarded anyway.
            const ACK: [u8; 4] = [0x25, b'A', 0x00, 0x00];
            let byte = ACK[self.dead_read_idx % ACK.len()];
            self.dead_read_idx += 1;
            return byte;
        }
        self.rx
            .pop_front()
            .expect("sim: decoder read with no host bytes queued")
    }

    fn write_byte(&mut self, byte: u8) {
        if self.dead {
            return;
        }
        self.tx.push(byte);
        self.observe_tx_byte(byte);
    }
}
