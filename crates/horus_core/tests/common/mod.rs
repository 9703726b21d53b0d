//! Test-side headend.
//!
//! The deployment toolchain (secrets generation, subscription packaging,
//! frame encoding) lives outside the decoder. The integration tests need a
//! compliant counterpart to exercise the device against, so this module
//! reimplements it: deterministic secrets, minimal interval covers, the
//! exact wire and flash encodings, and the signing/encryption conventions
//! the decoder verifies.

#![allow(dead_code)]

use std::cell::Cell;

use chacha20poly1305::{AeadInPlace, Key, KeyInit, XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signer, SigningKey};
use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::Shake256;

use horus_core::board::sim::{SimBoard, SIM_SUBSCRIPTION_BASE};
use horus_core::board::FLASH_PAGE_SIZE;
use horus_core::crypto;
use horus_core::dispatch::Decoder;
use horus_core::secrets::DeviceSecrets;
use horus_core::subscription::{
    Subscription, MAX_TREE_KEYS, SUBSCRIPTION_MAGIC, SUBSCRIPTION_RECORD_LEN,
};
use horus_core::transport::{MSG_HEADER_LEN, MSG_MAGIC};
use horus_core::tree::Vertex;

/// SHAKE256 of a domain label, at any width.
fn shake<const N: usize>(parts: &[&[u8]]) -> [u8; N] {
    let mut xof = Shake256::default();
    for part in parts {
        xof.update(part);
    }
    let mut out = [0u8; N];
    xof.finalize_xof().read(&mut out);
    out
}

/// A deterministic deployment: every key is derived from fixed labels, so
/// tests are reproducible and two `Headend` instances agree byte-for-byte.
pub struct Headend {
    signing: SigningKey,
    id_root_key: [u8; 32],
    left_tree_key: [u8; 32],
    right_tree_key: [u8; 32],
    nonce_counter: Cell<u64>,
}

impl Headend {
    pub fn new() -> Self {
        Self {
            signing: SigningKey::from_bytes(&shake(&[b"horus-test/signing"])),
            id_root_key: shake(&[b"horus-test/id-root"]),
            left_tree_key: shake(&[b"horus-test/left"]),
            right_tree_key: shake(&[b"horus-test/right"]),
            nonce_counter: Cell::new(1),
        }
    }

    /// Outer key of a channel.
    pub fn channel_key(&self, channel: u32) -> [u8; 32] {
        shake(&[b"horus-test/kch", &channel.to_le_bytes()])
    }

    /// Root tree key of a channel.
    fn tree_root(&self, channel: u32) -> [u8; 16] {
        shake(&[b"horus-test/tree-root", &channel.to_le_bytes()])
    }

    /// Per-device id key: `SHAKE256(le32(id) ‖ id_root_key)`.
    pub fn id_key(&self, decoder_id: u32) -> [u8; 32] {
        shake(&[&decoder_id.to_le_bytes(), &self.id_root_key])
    }

    /// The secrets baked into decoder `decoder_id` at build time.
    pub fn device_secrets(&self, decoder_id: u32) -> DeviceSecrets {
        DeviceSecrets {
            decoder_id,
            encoder_public_key: self.signing.verifying_key().to_bytes(),
            id_key: self.id_key(decoder_id),
            left_tree_key: self.left_tree_key,
            right_tree_key: self.right_tree_key,
        }
    }

    /// Tree key of an arbitrary vertex: walk from the channel root, most
    /// significant path bit first.
    pub fn tree_key(&self, channel: u32, vertex: Vertex) -> [u8; 16] {
        let mut key = self.tree_root(channel);
        for i in (0..vertex.bits).rev() {
            let side = if vertex.prefix & (1u64 << i) == 0 {
                &self.left_tree_key
            } else {
                &self.right_tree_key
            };
            key = crypto::kdf_tree_child(&key, side);
        }
        key
    }

    /// Symmetric key a compliant encoder uses for `(channel, t)`.
    pub fn leaf_symmetric_key(&self, channel: u32, t: u64) -> [u8; 32] {
        crypto::kdf_tree_leaf(&self.tree_key(channel, Vertex { prefix: t, bits: 64 }))
    }

    /// Encrypt in the system's wire format: `tag[16] ‖ nonce[24] ‖ body`.
    pub fn encrypt(&self, key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
        let counter = self.nonce_counter.get();
        self.nonce_counter.set(counter + 1);
        let mut nonce = [0u8; 24];
        nonce[..8].copy_from_slice(&counter.to_le_bytes());
        nonce[8..16].copy_from_slice(b"horusenc");

        let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
        let mut body = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(XNonce::from_slice(&nonce), b"", &mut body)
            .unwrap();

        let mut out = Vec::with_capacity(plaintext.len() + 40);
        out.extend_from_slice(tag.as_slice());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&body);
        out
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }

    /// A plaintext subscription record covering `[start, end]` on `channel`.
    pub fn subscription_record(&self, channel: u32, start: u64, end: u64) -> Subscription {
        let vertices = vertices_for_range(start, end);
        assert!(vertices.len() <= MAX_TREE_KEYS, "cover exceeds slot capacity");

        let mut ktree = [[0u8; 16]; MAX_TREE_KEYS];
        for (slot, vertex) in ktree.iter_mut().zip(&vertices) {
            *slot = self.tree_key(channel, *vertex);
        }

        Subscription {
            ktree,
            kch: self.channel_key(channel),
            start,
            end,
            channel,
            key_count: vertices.len() as u32,
            magic: SUBSCRIPTION_MAGIC,
        }
    }

    /// A signed, encrypted update packet carrying an arbitrary record.
    pub fn update_from_record(
        &self,
        decoder_id: u32,
        record: &[u8; SUBSCRIPTION_RECORD_LEN],
    ) -> Vec<u8> {
        let ciphertext = self.encrypt(&self.id_key(decoder_id), record);

        let mut payload = Vec::with_capacity(4 + ciphertext.len());
        payload.extend_from_slice(&decoder_id.to_le_bytes());
        payload.extend_from_slice(&ciphertext);

        let signature = self.sign(&payload);
        payload.extend_from_slice(&signature);
        payload
    }

    /// A well-formed update packet for `[start, end]` on `channel`.
    pub fn subscription_update(
        &self,
        decoder_id: u32,
        channel: u32,
        start: u64,
        end: u64,
    ) -> Vec<u8> {
        let record = self.subscription_record(channel, start, end).to_bytes();
        self.update_from_record(decoder_id, &record)
    }

    /// A frame packet: inner layer under the per-timestamp key, middle layer
    /// under the channel key, signature over the whole payload.
    pub fn encode_frame(&self, channel: u32, frame: &[u8], timestamp: u64) -> Vec<u8> {
        assert!(frame.len() <= 64);

        let mut frame_data = [0u8; 68];
        frame_data[..4].copy_from_slice(&(frame.len() as u32).to_le_bytes());
        frame_data[4..4 + frame.len()].copy_from_slice(frame);

        let inner = self.encrypt(&self.leaf_symmetric_key(channel, timestamp), &frame_data);

        let mut timestamped = Vec::with_capacity(120);
        timestamped.extend_from_slice(&timestamp.to_le_bytes());
        timestamped.extend_from_slice(&inner);
        timestamped.extend_from_slice(&[0u8; 4]);

        let outer = self.encrypt(&self.channel_key(channel), &timestamped);

        let mut payload = Vec::with_capacity(164);
        payload.extend_from_slice(&channel.to_le_bytes());
        payload.extend_from_slice(&outer);

        let signature = self.sign(&payload);
        payload.extend_from_slice(&signature);
        payload
    }
}

impl Default for Headend {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimal node-cover of `[start, end]`: canonical left-to-right order,
/// fronts first, then the contracted middle, then backs innermost-first.
pub fn vertices_for_range(start: u64, end: u64) -> Vec<Vertex> {
    assert!(start <= end);

    let mut front = Vec::new();
    let mut back = Vec::new();
    let mut start = start;
    let mut end = end;
    let mut bits = 64u8;

    while start != end {
        if start & 1 == 0 && end & 1 == 1 {
            start >>= 1;
            end >>= 1;
            bits -= 1;
        } else if start & 1 == 1 {
            front.push(Vertex {
                prefix: start,
                bits,
            });
            start += 1;
        } else {
            back.push(Vertex { prefix: end, bits });
            end -= 1;
        }
    }

    front.push(Vertex {
        prefix: start,
        bits,
    });
    front.extend(back.into_iter().rev());
    front
}

/// The baked channel-0 subscription: full timestamp range.
pub fn channel0_record(headend: &Headend) -> Subscription {
    headend.subscription_record(0, 0, u64::MAX)
}

/// A board with slot 0 linker-patched the way a flash image is built.
pub fn provisioned_board(headend: &Headend) -> SimBoard {
    let mut board = SimBoard::new();
    board.load_flash(SIM_SUBSCRIPTION_BASE, &channel0_record(headend).to_bytes());
    board
}

/// A booted decoder for device `decoder_id` with channel 0 baked in.
pub fn booted_decoder(headend: &Headend, decoder_id: u32) -> Decoder<SimBoard> {
    let mut decoder = Decoder::new(provisioned_board(headend), headend.device_secrets(decoder_id));
    decoder.boot();
    decoder
}

/// Frame a request the way the host does.
pub fn request(msg_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut bytes = vec![MSG_MAGIC, msg_type];
    bytes.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

/// Push one request and service it.
pub fn submit(decoder: &mut Decoder<SimBoard>, msg_type: u8, payload: &[u8]) {
    decoder.board_mut().push_host_bytes(&request(msg_type, payload));
    decoder.service_one();
}

/// Parse a device transmit stream into `(type, payload)` messages.
pub fn parse_stream(mut bytes: &[u8]) -> Vec<(u8, Vec<u8>)> {
    let mut out = Vec::new();
    while !bytes.is_empty() {
        assert!(bytes.len() >= MSG_HEADER_LEN, "truncated header");
        assert_eq!(bytes[0], MSG_MAGIC, "unframed device bytes");
        let msg_type = bytes[1];
        let len = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
        out.push((msg_type, bytes[4..4 + len].to_vec()));
        bytes = &bytes[4 + len..];
    }
    out
}

/// Drain the device stream, dropping the ACKs it sent while receiving.
pub fn responses(decoder: &mut Decoder<SimBoard>) -> Vec<(u8, Vec<u8>)> {
    parse_stream(&decoder.board_mut().take_device_bytes())
        .into_iter()
        .filter(|(msg_type, _)| *msg_type != b'A')
        .collect()
}

/// Count of valid user slots (slot 0 excluded).
pub fn occupied_user_slots(decoder: &Decoder<SimBoard>) -> Vec<usize> {
    (1..9)
        .filter(|&i| horus_core::subscription::get_subscription(decoder.board(), i).is_some())
        .collect()
}

/// Raw bytes of a slot, for torn-write inspection.
pub fn slot_bytes(board: &SimBoard, index: usize) -> Vec<u8> {
    board.flash_bytes(
        SIM_SUBSCRIPTION_BASE + (index * FLASH_PAGE_SIZE) as u32,
        SUBSCRIPTION_RECORD_LEN,
    )
}
