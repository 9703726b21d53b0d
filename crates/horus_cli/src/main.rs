//! Horus decoder simulator CLI.
//!
//! Runs the unmodified `horus_core` firmware pipeline on a workstation:
//! flash is a 512 KiB image file, the host link is stdio, the TRNG is the
//! operating system's entropy source, and delays really elapse. The same
//! tool prepares and inspects flash images.
//!
//! # Environment Variables
//!
//! - `HORUS_SECRETS` - path to the device secrets file (fallback for
//!   `--secrets`)
//!
//! # Usage
//!
//! ```bash
//! # Prepare a flash image with a baked channel-0 record
//! horus-decoder flash-init --image decoder.flash --slot0 channel0.bin
//!
//! # Serve the framed protocol on stdio (logs go to stderr)
//! horus-decoder run --image decoder.flash --secrets decoder.json
//!
//! # Show the subscription slots and lockout counter of an image
//! horus-decoder inspect --image decoder.flash
//! ```

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use clap::{Parser, Subcommand};
use serde::Deserialize;

use horus_core::board::sim::{SIM_FLASH_BASE, SIM_FLASH_LEN, SIM_LOCKOUT_ADDR, SIM_SUBSCRIPTION_BASE};
use horus_core::board::{Board, FlashError, FLASH_PAGE_SIZE};
use horus_core::dispatch::Decoder;
use horus_core::secrets::DeviceSecrets;
use horus_core::subscription::{
    Subscription, MAX_CHANNEL_COUNT, SUBSCRIPTION_MAGIC, SUBSCRIPTION_RECORD_LEN,
};

/// Environment variable naming the device secrets file.
const ENV_HORUS_SECRETS: &str = "HORUS_SECRETS";

/// Horus decoder - firmware core simulator and flash tooling.
#[derive(Parser)]
#[command(name = "horus-decoder")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Service the framed request/response protocol on stdio.
    Run {
        /// Flash image file; created blank if missing.
        #[arg(long)]
        image: PathBuf,
        /// Device secrets file (JSON). Falls back to $HORUS_SECRETS.
        #[arg(long)]
        secrets: Option<PathBuf>,
    },
    /// Create a blank flash image, optionally baking a slot-0 record.
    FlashInit {
        /// Flash image file to create.
        #[arg(long)]
        image: PathBuf,
        /// A 2080-byte plaintext subscription record for slot 0.
        #[arg(long)]
        slot0: Option<PathBuf>,
        /// Overwrite an existing image.
        #[arg(long)]
        force: bool,
    },
    /// Print the subscription slots and lockout counter of an image.
    Inspect {
        /// Flash image file to read.
        #[arg(long)]
        image: PathBuf,
    },
}

/// On-disk secrets format, keys base64-encoded.
#[derive(Deserialize)]
struct SecretsFile {
    #[serde(rename = "DECODER_ID")]
    decoder_id: u32,
    #[serde(rename = "ENCODER_PUBLIC_KEY")]
    encoder_public_key: String,
    #[serde(rename = "ID_KEY")]
    id_key: String,
    #[serde(rename = "LEFT_TREE_KEY")]
    left_tree_key: String,
    #[serde(rename = "RIGHT_TREE_KEY")]
    right_tree_key: String,
}

fn decode_key<const N: usize>(field: &str, value: &str) -> Result<[u8; N]> {
    let raw = BASE64
        .decode(value)
        .with_context(|| format!("{field}: invalid base64"))?;
    let key: [u8; N] = raw
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("{field}: expected {N} bytes, got {}", raw.len()))?;
    Ok(key)
}

fn load_secrets(path: &Path) -> Result<DeviceSecrets> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading secrets file {}", path.display()))?;
    let file: SecretsFile = serde_json::from_str(&text).context("parsing secrets file")?;

    Ok(DeviceSecrets {
        decoder_id: file.decoder_id,
        encoder_public_key: decode_key("ENCODER_PUBLIC_KEY", &file.encoder_public_key)?,
        id_key: decode_key("ID_KEY", &file.id_key)?,
        left_tree_key: decode_key("LEFT_TREE_KEY", &file.left_tree_key)?,
        right_tree_key: decode_key("RIGHT_TREE_KEY", &file.right_tree_key)?,
    })
}

/// A blank flash image: erased pages, zeroed lockout page.
fn blank_image() -> Vec<u8> {
    let mut image = vec![0xFFu8; SIM_FLASH_LEN];
    let lockout = (SIM_LOCKOUT_ADDR - SIM_FLASH_BASE) as usize;
    image[lockout..lockout + FLASH_PAGE_SIZE].fill(0);
    image
}

/// Workstation board: file-backed flash, stdio host link, OS entropy.
struct HostBoard {
    flash: Vec<u8>,
    image_path: PathBuf,
    stdin: std::io::Stdin,
    stdout: std::io::Stdout,
}

impl HostBoard {
    fn open(image_path: PathBuf) -> Result<Self> {
        let flash = match std::fs::read(&image_path) {
            Ok(data) => {
                if data.len() != SIM_FLASH_LEN {
                    bail!(
                        "{}: expected a {SIM_FLASH_LEN}-byte image, got {}",
                        image_path.display(),
                        data.len()
                    );
                }
                data
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(image = %image_path.display(), "creating blank flash image");
                let image = blank_image();
                std::fs::write(&image_path, &image)?;
                image
            }
            Err(err) => return Err(err).context("reading flash image"),
        };

        Ok(Self {
            flash,
            image_path,
            stdin: std::io::stdin(),
            stdout: std::io::stdout(),
        })
    }

    fn offset(&self, addr: u32) -> usize {
        let offset = addr.checked_sub(SIM_FLASH_BASE).expect("address below flash") as usize;
        assert!(offset < SIM_FLASH_LEN, "address beyond flash");
        offset
    }

    /// Write the image back to disk after every mutation, so a killed
    /// simulator behaves like a power-cycled board.
    fn persist(&self) -> Result<(), FlashError> {
        std::fs::write(&self.image_path, &self.flash).map_err(|err| {
            tracing::error!(%err, "failed to persist flash image");
            FlashError::Write
        })
    }
}

impl Board for HostBoard {
    fn init(&mut self) {
        tracing::info!(image = %self.image_path.display(), "decoder boot");
    }

    fn trng_word(&mut self) -> u32 {
        let mut word = [0u8; 4];
        getrandom::getrandom(&mut word).expect("operating system entropy unavailable");
        u32::from_le_bytes(word)
    }

    fn delay_ticks(&mut self, ticks: u32) {
        for _ in 0..ticks {
            std::hint::spin_loop();
        }
    }

    fn delay_us(&mut self, us: u32) {
        std::thread::sleep(std::time::Duration::from_micros(u64::from(us)));
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
        let start = self.offset(addr);
        assert!(start % FLASH_PAGE_SIZE == 0, "unaligned page erase");
        self.flash[start..start + FLASH_PAGE_SIZE].fill(0xFF);
        self.persist().map_err(|_| FlashError::Erase)
    }

    fn flash_write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        let start = self.offset(addr);
        self.flash[start..start + data.len()].copy_from_slice(data);
        self.persist()
    }

    fn read_byte(&mut self) -> u8 {
        let mut byte = [0u8; 1];
        match self.stdin.read_exact(&mut byte) {
            Ok(()) => byte[0],
            Err(_) => {
                // Host hung up; a board with no host has nothing left to do.
                tracing::info!("host link closed, exiting");
                std::process::exit(0);
            }
        }
    }

    fn write_byte(&mut self, byte: u8) {
        // Flush per byte: the ACK handshake deadlocks behind buffering.
        let _ = self.stdout.write_all(&[byte]);
        let _ = self.stdout.flush();
    }
}

fn cmd_run(image: PathBuf, secrets: Option<PathBuf>) -> Result<()> {
    let secrets_path = secrets
        .or_else(|| std::env::var_os(ENV_HORUS_SECRETS).map(PathBuf::from))
        .context("no secrets file: pass --secrets or set HORUS_SECRETS")?;
    let secrets = load_secrets(&secrets_path)?;
    tracing::info!(decoder_id = secrets.decoder_id, "secrets loaded");

    let board = HostBoard::open(image)?;
    let mut decoder = Decoder::new(board, secrets);
    decoder.boot();
    decoder.run()
}

fn cmd_flash_init(image: PathBuf, slot0: Option<PathBuf>, force: bool) -> Result<()> {
    if image.exists() && !force {
        bail!("{} exists; pass --force to overwrite", image.display());
    }

    let mut data = blank_image();
    if let Some(record_path) = slot0 {
        let record = std::fs::read(&record_path)
            .with_context(|| format!("reading slot-0 record {}", record_path.display()))?;
        if record.len() != SUBSCRIPTION_RECORD_LEN {
            bail!(
                "{}: a subscription record is {SUBSCRIPTION_RECORD_LEN} bytes, got {}",
                record_path.display(),
                record.len()
            );
        }
        let base = (SIM_SUBSCRIPTION_BASE - SIM_FLASH_BASE) as usize;
        data[base..base + SUBSCRIPTION_RECORD_LEN].copy_from_slice(&record);
    }

    std::fs::write(&image, &data).with_context(|| format!("writing {}", image.display()))?;
    tracing::info!(image = %image.display(), "flash image written");
    Ok(())
}

fn cmd_inspect(image: PathBuf) -> Result<()> {
    let data = std::fs::read(&image).with_context(|| format!("reading {}", image.display()))?;
    if data.len() != SIM_FLASH_LEN {
        bail!("{}: not a flash image", image.display());
    }

    let sub_base = (SIM_SUBSCRIPTION_BASE - SIM_FLASH_BASE) as usize;
    for slot in 0..MAX_CHANNEL_COUNT {
        let start = sub_base + slot * FLASH_PAGE_SIZE;
        let raw: &[u8; SUBSCRIPTION_RECORD_LEN] = data[start..start + SUBSCRIPTION_RECORD_LEN]
            .try_into()
            .expect("image length checked above");
        let record = Subscription::parse(raw);
        if record.magic == SUBSCRIPTION_MAGIC {
            println!(
                "slot {slot}: channel {} [{:#018x}, {:#018x}] keys {}",
                record.channel, record.start, record.end, record.key_count
            );
        } else {
            println!("slot {slot}: empty");
        }
    }

    let lockout_offset = (SIM_LOCKOUT_ADDR - SIM_FLASH_BASE) as usize;
    let lockout = u32::from_le_bytes([
        data[lockout_offset],
        data[lockout_offset + 1],
        data[lockout_offset + 2],
        data[lockout_offset + 3],
    ]);
    println!("lockout counter: {lockout}");
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Commands::Run { image, secrets } => cmd_run(image, secrets),
        Commands::FlashInit { image, slot0, force } => cmd_flash_init(image, slot0, force),
        Commands::Inspect { image } => cmd_inspect(image),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_secrets(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("decoder.json");
        let encoded = BASE64.encode([7u8; 32]);
        let json = format!(
            r#"{{
                "DECODER_ID": 42,
                "ENCODER_PUBLIC_KEY": "{encoded}",
                "ID_KEY": "{encoded}",
                "LEFT_TREE_KEY": "{encoded}",
                "RIGHT_TREE_KEY": "{encoded}"
            }}"#
        );
        std::fs::write(&path, json).unwrap();
        path
    }

    #[test]
    fn secrets_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let secrets = load_secrets(&write_secrets(&dir)).unwrap();
        assert_eq!(secrets.decoder_id, 42);
        assert_eq!(secrets.id_key, [7u8; 32]);
    }

    #[test]
    fn secrets_file_rejects_short_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        let short = BASE64.encode([7u8; 16]);
        std::fs::write(
            &path,
            format!(
                r#"{{"DECODER_ID": 1, "ENCODER_PUBLIC_KEY": "{short}",
                   "ID_KEY": "{short}", "LEFT_TREE_KEY": "{short}",
                   "RIGHT_TREE_KEY": "{short}"}}"#
            ),
        )
        .unwrap();
        assert!(load_secrets(&path).is_err());
    }

    #[test]
    fn flash_init_bakes_slot0() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("decoder.flash");
        let record_path = dir.path().join("channel0.bin");

        let mut record = vec![0u8; SUBSCRIPTION_RECORD_LEN];
        record[2072..2076].copy_from_slice(&SUBSCRIPTION_MAGIC.to_le_bytes());
        std::fs::write(&record_path, &record).unwrap();

        cmd_flash_init(image.clone(), Some(record_path), false).unwrap();

        let data = std::fs::read(&image).unwrap();
        assert_eq!(data.len(), SIM_FLASH_LEN);
        let base = (SIM_SUBSCRIPTION_BASE - SIM_FLASH_BASE) as usize;
        assert_eq!(&data[base..base + SUBSCRIPTION_RECORD_LEN], &record[..]);

        // Refuses to clobber without --force.
        assert!(cmd_flash_init(image.clone(), None, false).is_err());
        assert!(cmd_flash_init(image, None, true).is_ok());
    }

    #[test]
    fn blank_image_has_zeroed_lockout_page() {
        let image = blank_image();
        let lockout = (SIM_LOCKOUT_ADDR - SIM_FLASH_BASE) as usize;
        assert_eq!(&image[lockout..lockout + 4], &[0, 0, 0, 0]);
        assert_eq!(image[lockout - 1], 0xFF);
    }
}
