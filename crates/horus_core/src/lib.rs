//! # horus_core
//!
//! Firmware core of the Horus satellite-TV decoder for a secure broadcast
//! system. The decoder receives encrypted, signed frame packets on numbered
//! channels and emits the plaintext frame only while it holds a valid
//! subscription covering that channel and timestamp; signed, device-addressed
//! subscription updates are validated and persisted to flash across power
//! cycles.
//!
//! The device operates in a physically hostile environment: the host link is
//! attacker-controlled, and the attacker can glitch the clock or supply
//! voltage and power-cycle the board at will. Every security decision in this
//! crate is therefore hardened with randomized delays, triple-read
//! predicates, and redundant computation, and every attack-indicated failure
//! engages a flash-persisted lockout.
//!
//! ## Stack
//!
//! | Concern | Implementation |
//! |---------|----------------|
//! | Authenticated encryption | XChaCha20-Poly1305 (detached tag) via `chacha20poly1305` |
//! | Packet signatures | Ed25519 via `ed25519-dalek` |
//! | Key derivation | SHAKE256 XOF via `sha3` |
//! | Constant-time comparison | `subtle` |
//! | Secret hygiene | `zeroize` |
//!
//! ## Hardware model
//!
//! All peripheral access goes through the [`board::Board`] trait: flash
//! (page-erase and program), the TRNG, the host UART byte link, and the busy
//! and microsecond delay timers. The same pipeline binary-for-binary services
//! requests on the target board and on the in-memory [`board::sim::SimBoard`]
//! used by the test-suite and the host-side simulator.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![warn(clippy::all)]

/// Little-endian load/store helpers for the wire and flash codecs
pub mod bytes;

/// Constant-time byte comparison - uses the audited `subtle` crate
pub mod ct;

/// Crypto facade: authenticated decryption, signature verification, tree KDFs
pub mod crypto;

/// Von-Neumann-debiased true random number generation
pub mod rng;

/// Fault-injection countermeasures: entropy pool, randomized delays,
/// redundant predicates and redundant computation
pub mod fiproc;

/// Hardware abstraction: the `Board` trait and the software board backend
pub mod board;

/// Attack lockout, persisted across resets
pub mod lockout;

/// Per-device build-time secrets
pub mod secrets;

/// Subscription records, the slotted flash store, and the update pipeline
pub mod subscription;

/// Key-tree navigation and per-timestamp key derivation
pub mod tree;

/// Frame packets and the decode pipeline
pub mod frame;

/// Framed host transport: headers, ACK handshake, chunked bodies
pub mod transport;

/// Top-level request dispatcher
pub mod dispatch;

/// Unrecoverable-fault handling
pub mod util;

/// Prelude with commonly used types
pub mod prelude {
    pub use crate::board::{sim::SimBoard, Board, FlashError};
    pub use crate::dispatch::Decoder;
    pub use crate::frame::DecodeError;
    pub use crate::secrets::DeviceSecrets;
    pub use crate::subscription::{Subscription, UpdateError};
    pub use crate::transport::MsgType;
    pub use crate::tree::Vertex;
}
