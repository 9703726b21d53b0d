//! Framed host transport.
//!
//! The host link is a raw byte pipe; this module implements the framed
//! request/response contract on top of it. A message starts with a 4-byte
//! header (magic `0x25`, a type byte, and a 16-bit little-endian payload
//! length) followed by the payload in 256-byte chunks. After a non-debug
//! header and after every chunk, the sender waits for an ACK header from
//! the receiver. Debug messages skip the handshake entirely.
//!
//! The receiver is defensive about a hostile or confused peer: garbage
//! ahead of a header is skipped byte-by-byte until a magic byte appears,
//! and a body longer than the receive buffer is drained and ACKed but
//! discarded so the link stays in sync.

use crate::board::Board;
use crate::util;

/// Message header length in bytes.
pub const MSG_HEADER_LEN: usize = 4;

/// Payload chunk size between ACKs.
pub const MSG_CHUNK_SIZE: usize = 256;

/// Header magic byte, `%`.
pub const MSG_MAGIC: u8 = 0x25;

/// Host message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    /// `D`: decode a frame packet.
    Decode,
    /// `S`: ingest a subscription update.
    Subscribe,
    /// `L`: list stored subscriptions.
    List,
    /// `A`: acknowledgement.
    Ack,
    /// `E`: error report.
    Error,
    /// `G`: debug text, no handshake.
    Debug,
    /// `%`: the magic byte itself.
    Magic,
}

impl MsgType {
    /// Decode a wire type byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'D' => Some(Self::Decode),
            b'S' => Some(Self::Subscribe),
            b'L' => Some(Self::List),
            b'A' => Some(Self::Ack),
            b'E' => Some(Self::Error),
            b'G' => Some(Self::Debug),
            b'%' => Some(Self::Magic),
            _ => None,
        }
    }

    /// The wire type byte.
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Decode => b'D',
            Self::Subscribe => b'S',
            Self::List => b'L',
            Self::Ack => b'A',
            Self::Error => b'E',
            Self::Debug => b'G',
            Self::Magic => b'%',
        }
    }
}

/// Transport error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// A request body exceeded the receive buffer. The body was drained and
    /// ACKed to keep the link in sync, then discarded.
    Oversized {
        /// Length the header announced.
        len: u16,
    },
    /// The peer sent something other than an ACK during the handshake.
    AckExpected,
}

impl core::fmt::Display for TransportError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Oversized { len } => write!(f, "request body of {len} bytes exceeds buffer"),
            Self::AckExpected => write!(f, "expected ack from host"),
        }
    }
}

impl std::error::Error for TransportError {}

fn send_header<B: Board>(board: &mut B, msg_type: u8, len: u16) {
    board.write_byte(MSG_MAGIC);
    board.write_byte(msg_type);
    let [lo, hi] = len.to_le_bytes();
    board.write_byte(lo);
    board.write_byte(hi);
}

/// Read the next header, discarding bytes until a magic byte appears.
fn recv_header<B: Board>(board: &mut B) -> (u8, u16) {
    loop {
        if board.read_byte() == MSG_MAGIC {
            break;
        }
    }

    let msg_type = board.read_byte();
    let lo = board.read_byte();
    let hi = board.read_byte();
    (msg_type, u16::from_le_bytes([lo, hi]))
}

fn send_ack<B: Board>(board: &mut B) {
    send_header(board, MsgType::Ack.to_byte(), 0);
}

fn recv_ack<B: Board>(board: &mut B) -> Result<(), TransportError> {
    let (msg_type, len) = recv_header(board);
    if msg_type == MsgType::Ack.to_byte() && len == 0 {
        Ok(())
    } else {
        Err(TransportError::AckExpected)
    }
}

/// Send one message to the host.
///
/// Non-debug messages wait for an ACK after the header and after each
/// 256-byte chunk. A peer that answers with anything else has violated the
/// protocol; the rest of the message is silently dropped and the next
/// request starts from a clean header boundary.
pub fn send_msg<B: Board>(board: &mut B, msg_type: MsgType, payload: &[u8]) {
    util::assert_or_halt(payload.len() <= u16::MAX as usize);

    send_header(board, msg_type.to_byte(), payload.len() as u16);
    let handshake = msg_type != MsgType::Debug;
    if handshake && recv_ack(board).is_err() {
        return;
    }

    for chunk in payload.chunks(MSG_CHUNK_SIZE) {
        for &byte in chunk {
            board.write_byte(byte);
        }
        if handshake && recv_ack(board).is_err() {
            return;
        }
    }
}

/// Receive one message from the host into `buf`.
///
/// Returns the raw type byte and the payload length. The full announced
/// body is always drained and ACKed chunk-by-chunk, but bytes beyond the
/// buffer are discarded and the message is reported as oversized.
pub fn recv_msg<B: Board>(board: &mut B, buf: &mut [u8]) -> Result<(u8, u16), TransportError> {
    let (msg_type, len) = recv_header(board);
    send_ack(board);

    let total = len as usize;
    let mut offset = 0usize;
    while offset < total {
        let chunk = (total - offset).min(MSG_CHUNK_SIZE);
        for i in 0..chunk {
            let byte = board.read_byte();
            if offset + i < buf.len() {
                buf[offset + i] = byte;
            }
        }
        offset += chunk;
        send_ack(board);
    }

    if total <= buf.len() {
        Ok((msg_type, len))
    } else {
        Err(TransportError::Oversized { len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::sim::SimBoard;

    /// Parse a device transmit stream into (type, payload) messages.
    fn parse_stream(mut bytes: &[u8]) -> Vec<(u8, Vec<u8>)> {
        let mut out = Vec::new();
        while !bytes.is_empty() {
            assert_eq!(bytes[0], MSG_MAGIC, "device sent unframed bytes");
            let msg_type = bytes[1];
            let len = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
            out.push((msg_type, bytes[4..4 + len].to_vec()));
            bytes = &bytes[4 + len..];
        }
        out
    }

    fn request(msg_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![MSG_MAGIC, msg_type];
        bytes.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn recv_plain_request() {
        let mut board = SimBoard::new();
        board.push_host_bytes(&request(b'L', &[]));

        let mut buf = [0u8; 16];
        assert_eq!(recv_msg(&mut board, &mut buf), Ok((b'L', 0)));

        // The device ACKed the header.
        assert_eq!(parse_stream(&board.take_device_bytes()), vec![(b'A', vec![])]);
    }

    #[test]
    fn recv_chunked_body_acks_each_chunk() {
        let payload = vec![0x5Au8; 600];
        let mut board = SimBoard::new();
        board.push_host_bytes(&request(b'S', &payload));

        let mut buf = [0u8; 1024];
        assert_eq!(recv_msg(&mut board, &mut buf), Ok((b'S', 600)));
        assert_eq!(&buf[..600], &payload[..]);

        // Header ACK plus one per 256-byte chunk (256 + 256 + 88).
        let acks = parse_stream(&board.take_device_bytes());
        assert_eq!(acks.len(), 4);
        assert!(acks.iter().all(|(t, p)| *t == b'A' && p.is_empty()));
    }

    #[test]
    fn recv_skips_garbage_before_magic() {
        let mut board = SimBoard::new();
        board.push_host_bytes(&[0x00, 0x41, 0xFE]);
        board.push_host_bytes(&request(b'L', &[]));

        let mut buf = [0u8; 16];
        assert_eq!(recv_msg(&mut board, &mut buf), Ok((b'L', 0)));
    }

    #[test]
    fn recv_drains_and_rejects_oversized_body() {
        let payload = vec![0xEEu8; 300];
        let mut board = SimBoard::new();
        board.push_host_bytes(&request(b'S', &payload));

        let mut buf = [0u8; 64];
        assert_eq!(
            recv_msg(&mut board, &mut buf),
            Err(TransportError::Oversized { len: 300 })
        );
        // Link stays in sync: every byte consumed, every chunk ACKed.
        assert_eq!(board.pending_host_bytes(), 0);
        let acks = parse_stream(&board.take_device_bytes());
        assert_eq!(acks.len(), 3);
    }

    #[test]
    fn send_waits_for_acks_between_chunks() {
        let mut board = SimBoard::new();
        let payload = vec![0x11u8; 300];
        send_msg(&mut board, MsgType::Error, &payload);

        let msgs = parse_stream(&board.take_device_bytes());
        assert_eq!(msgs, vec![(b'E', payload)]);
        // All auto-queued host ACKs were consumed.
        assert_eq!(board.pending_host_bytes(), 0);
    }

    #[test]
    fn send_debug_skips_handshake() {
        let mut board = SimBoard::new();
        board.set_auto_ack(false);
        send_msg(&mut board, MsgType::Debug, b"boot ok");

        let msgs = parse_stream(&board.take_device_bytes());
        assert_eq!(msgs, vec![(b'G', b"boot ok".to_vec())]);
    }

    #[test]
    fn send_aborts_on_handshake_violation() {
        let mut board = SimBoard::new();
        board.set_auto_ack(false);
        // Host answers the header with an error instead of an ACK.
        board.push_host_bytes(&request(b'E', &[]));
        send_msg(&mut board, MsgType::List, &[1, 2, 3]);

        // Header went out, body did not.
        let raw = board.take_device_bytes();
        assert_eq!(raw.len(), MSG_HEADER_LEN);
    }

    #[test]
    fn type_bytes_roundtrip() {
        for ty in [
            MsgType::Decode,
            MsgType::Subscribe,
            MsgType::List,
            MsgType::Ack,
            MsgType::Error,
            MsgType::Debug,
            MsgType::Magic,
        ] {
            assert_eq!(MsgType::from_byte(ty.to_byte()), Some(ty));
        }
        assert_eq!(MsgType::from_byte(0x00), None);
    }
}
