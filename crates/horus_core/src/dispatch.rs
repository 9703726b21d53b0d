//! Top-level request dispatcher.
//!
//! One `Decoder` owns the board, the entropy pool, the monotonicity cursor,
//! and the device secrets, and services host requests strictly one at a
//! time: top up the entropy pool, read one framed request into a zeroed
//! buffer, desynchronize with a ranged delay, then dispatch on the type
//! byte. There are no interrupts, no background tasks, and no way to abort
//! a request once its handling has begun, including a lockout, which may
//! take minutes across power cycles before the next request is read.

use zeroize::Zeroize;

use crate::board::Board;
use crate::fiproc::EntropyPool;
use crate::frame::{TimestampMonitor, FRAME_PACKET_LEN};
use crate::secrets::DeviceSecrets;
use crate::subscription::{UPDATE_PACKET_LEN, MAX_CHANNEL_COUNT};
use crate::transport::{self, MsgType};
use crate::{bytes, fiproc, lockout, subscription};

/// Receive buffer size; a subscription update is the largest valid request.
pub const MAX_REQUEST_LEN: usize = UPDATE_PACKET_LEN;

/// The decoder: hardware plus every piece of process-wide mutable state.
pub struct Decoder<B: Board> {
    pub(crate) board: B,
    pub(crate) pool: EntropyPool,
    pub(crate) clock: TimestampMonitor,
    pub(crate) secrets: DeviceSecrets,
}

impl<B: Board> Decoder<B> {
    /// Assemble a decoder from its board and compiled-in secrets.
    pub fn new(board: B, secrets: DeviceSecrets) -> Self {
        Self {
            board,
            pool: EntropyPool::new(),
            clock: TimestampMonitor::new(),
            secrets,
        }
    }

    /// One-time boot sequence: bring up the hardware, then serve any
    /// persisted lockout before the first host byte is read.
    pub fn boot(&mut self) {
        self.board.init();
        lockout::lockout_process(&mut self.board);
    }

    /// Service requests forever.
    pub fn run(&mut self) -> ! {
        loop {
            self.service_one();
        }
    }

    /// Service exactly one host request.
    pub fn service_one(&mut self) {
        if self.pool.is_low() {
            self.pool.refill(&mut self.board);
        }

        let mut request = [0u8; MAX_REQUEST_LEN];
        let received = transport::recv_msg(&mut self.board, &mut request);
        fiproc::ranged_delay(&mut self.board);

        match received {
            Ok((type_byte, len)) => match MsgType::from_byte(type_byte) {
                Some(MsgType::List) => self.handle_list_msg(len),
                Some(MsgType::Decode) => self.handle_decode_msg(&request, len),
                Some(MsgType::Subscribe) => self.handle_subscribe_msg(&request, len),
                _ => self.send_error("invalid message type"),
            },
            Err(_) => self.send_error("failed to get message"),
        }

        request.zeroize();
    }

    fn handle_list_msg(&mut self, len: u16) {
        if len != 0 {
            self.send_error("invalid list message length");
            return;
        }
        self.list_subscriptions();
    }

    fn handle_decode_msg(&mut self, request: &[u8; MAX_REQUEST_LEN], len: u16) {
        if len as usize != FRAME_PACKET_LEN {
            self.send_error("invalid decode message length");
            return;
        }

        let mut packet = [0u8; FRAME_PACKET_LEN];
        packet.copy_from_slice(&request[..FRAME_PACKET_LEN]);
        if let Err(err) = self.decode_frame(&packet) {
            self.send_error(&err.to_string());
        }
    }

    fn handle_subscribe_msg(&mut self, request: &[u8; MAX_REQUEST_LEN], len: u16) {
        if len as usize != UPDATE_PACKET_LEN {
            self.send_error("invalid subscribe message length");
            return;
        }

        match self.update_subscription(request) {
            // Zero-length acknowledgement; the stored record is the result.
            Ok(()) => transport::send_msg(&mut self.board, MsgType::Subscribe, &[]),
            Err(err) => self.send_error(&err.to_string()),
        }
    }

    /// Answer a list request: metadata of every valid user slot, skipping
    /// the channel-0 slot. Infallible.
    fn list_subscriptions(&mut self) {
        let mut response = [0u8; 4 + 20 * (MAX_CHANNEL_COUNT - 1)];
        let mut count = 0u32;
        let mut offset = 4usize;

        for index in 1..MAX_CHANNEL_COUNT {
            if let Some(record) = subscription::get_subscription(&self.board, index) {
                bytes::store_le32(record.channel, &mut response[offset..]);
                bytes::store_le64(record.start, &mut response[offset + 4..]);
                bytes::store_le64(record.end, &mut response[offset + 12..]);
                offset += 20;
                count += 1;
            }
        }

        bytes::store_le32(count, &mut response[..4]);
        transport::send_msg(&mut self.board, MsgType::List, &response[..offset]);
    }

    fn send_error(&mut self, text: &str) {
        transport::send_msg(&mut self.board, MsgType::Error, text.as_bytes());
    }

    /// Pool-backed small randomized delay; inserted after every crypto call
    /// and before every security decision in the pipelines.
    pub(crate) fn small_delay(&mut self) {
        self.pool.small_delay(&mut self.board);
    }

    /// Record an attack and serve the full lockout before returning. The
    /// current request is abandoned by the caller immediately afterwards.
    pub(crate) fn attack(&mut self) {
        lockout::attack_detected(&mut self.board);
    }

    /// Borrow the underlying board, e.g. to inspect simulated peripherals.
    pub fn board(&self) -> &B {
        &self.board
    }

    /// Mutably borrow the underlying board, e.g. to queue host bytes.
    pub fn board_mut(&mut self) -> &mut B {
        &mut self.board
    }
}
