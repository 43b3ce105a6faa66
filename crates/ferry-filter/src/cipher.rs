//! Passphrase-keyed block cipher stage.
//!
//! Stream layout:
//!
//! ```text
//! header  = "FERRYENC" | version u8 | kdf rounds u32 | salt [16] | nonce prefix [7]
//! segment = AES-256-GCM(plaintext up to 64 KiB) | tag [16]
//! ```
//!
//! Each segment nonce is the prefix, a big-endian segment counter and a flag
//! byte set only on the final segment, so reordering, dropping or appending
//! segments fails authentication. The header is bound to every segment as
//! associated data.
//!
//! The key is PBKDF2-HMAC-SHA256 over the passphrase and the per-stream
//! salt, expanded through HKDF. The round count travels in the header so it
//! can be raised without breaking existing files.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::chain::Filter;
use crate::error::{FilterError, FilterResult};

pub const MAGIC: &[u8; 8] = b"FERRYENC";
pub const VERSION: u8 = 2;
pub const SEGMENT_SIZE: usize = 64 * 1024;

const SALT_LEN: usize = 16;
const PREFIX_LEN: usize = 7;
const TAG_LEN: usize = 16;
pub const HEADER_LEN: usize = MAGIC.len() + 1 + 4 + SALT_LEN + PREFIX_LEN;
const KDF_INFO: &[u8] = b"ferry-cipher-v2";

/// PBKDF2 rounds for new streams.
pub const KDF_ROUNDS: u32 = 100_000;
/// Streams claiming fewer rounds are refused.
pub const MIN_KDF_ROUNDS: u32 = 1_000;
/// Upper bound so a forged header cannot stall the reader.
const MAX_KDF_ROUNDS: u32 = 10_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherMode {
    Encrypt,
    Decrypt,
}

pub struct CipherBlock {
    mode: CipherMode,
    passphrase: Zeroizing<Vec<u8>>,
    cipher: Option<Aes256Gcm>,
    header: Vec<u8>,
    prefix: [u8; PREFIX_LEN],
    counter: u32,
    header_sent: bool,
    buffer: Vec<u8>,
}

impl CipherBlock {
    pub fn new(mode: CipherMode, passphrase: &[u8]) -> FilterResult<Self> {
        Self::with_rounds(mode, passphrase, KDF_ROUNDS)
    }

    /// `rounds` only applies when encrypting; decryption takes it from the header.
    pub fn with_rounds(mode: CipherMode, passphrase: &[u8], rounds: u32) -> FilterResult<Self> {
        check_rounds(rounds)?;
        if passphrase.is_empty() {
            return Err(FilterError::Cipher("passphrase must not be empty".into()));
        }
        let mut block = Self {
            mode,
            passphrase: Zeroizing::new(passphrase.to_vec()),
            cipher: None,
            header: Vec::with_capacity(HEADER_LEN),
            prefix: [0; PREFIX_LEN],
            counter: 0,
            header_sent: false,
            buffer: Vec::new(),
        };
        if mode == CipherMode::Encrypt {
            let mut salt = [0u8; SALT_LEN];
            OsRng.fill_bytes(&mut salt);
            OsRng.fill_bytes(&mut block.prefix);
            block.header.extend_from_slice(MAGIC);
            block.header.push(VERSION);
            block.header.extend_from_slice(&rounds.to_be_bytes());
            block.header.extend_from_slice(&salt);
            block.header.extend_from_slice(&block.prefix);
            block.cipher = Some(derive_cipher(&block.passphrase, &salt, rounds)?);
        }
        Ok(block)
    }

    pub fn encrypt(passphrase: &[u8]) -> FilterResult<Self> {
        Self::new(CipherMode::Encrypt, passphrase)
    }

    pub fn decrypt(passphrase: &[u8]) -> FilterResult<Self> {
        Self::new(CipherMode::Decrypt, passphrase)
    }

    pub fn mode(&self) -> CipherMode {
        self.mode
    }

    fn nonce(&self, last: bool) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..PREFIX_LEN].copy_from_slice(&self.prefix);
        nonce[PREFIX_LEN..PREFIX_LEN + 4].copy_from_slice(&self.counter.to_be_bytes());
        nonce[11] = u8::from(last);
        nonce
    }

    fn advance(&mut self) -> FilterResult<()> {
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| FilterError::Cipher("segment counter exhausted".into()))?;
        Ok(())
    }

    fn seal(&mut self, plain: &[u8], last: bool, output: &mut Vec<u8>) -> FilterResult<()> {
        let nonce = self.nonce(last);
        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| FilterError::Cipher("cipher not initialized".into()))?;
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plain, aad: &self.header })
            .map_err(|_| FilterError::Cipher("unable to encrypt segment".into()))?;
        output.extend_from_slice(&sealed);
        self.advance()
    }

    fn open(&mut self, sealed: &[u8], last: bool, output: &mut Vec<u8>) -> FilterResult<()> {
        let nonce = self.nonce(last);
        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| FilterError::Cipher("cipher not initialized".into()))?;
        let plain = cipher
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: sealed, aad: &self.header })
            .map_err(|_| {
                FilterError::Cipher(
                    "unable to decrypt segment: wrong passphrase or corrupt data".into(),
                )
            })?;
        output.extend_from_slice(&plain);
        self.advance()
    }

    /// Consume the header once enough bytes have arrived.
    fn read_header(&mut self) -> FilterResult<bool> {
        if self.cipher.is_some() {
            return Ok(true);
        }
        if self.buffer.len() < HEADER_LEN {
            return Ok(false);
        }
        let header: Vec<u8> = self.buffer.drain(..HEADER_LEN).collect();
        if &header[..MAGIC.len()] != MAGIC {
            return Err(FilterError::Cipher("not an encrypted stream (bad magic)".into()));
        }
        let version = header[MAGIC.len()];
        if version != VERSION {
            return Err(FilterError::Cipher(format!("unsupported cipher version {version}")));
        }
        let rounds_at = MAGIC.len() + 1;
        let mut rounds = [0u8; 4];
        rounds.copy_from_slice(&header[rounds_at..rounds_at + 4]);
        let rounds = u32::from_be_bytes(rounds);
        check_rounds(rounds)?;
        let salt_at = rounds_at + 4;
        let salt = &header[salt_at..salt_at + SALT_LEN];
        self.prefix.copy_from_slice(&header[salt_at + SALT_LEN..]);
        self.cipher = Some(derive_cipher(&self.passphrase, salt, rounds)?);
        self.header = header;
        Ok(true)
    }

    fn process_encrypt(&mut self, input: &[u8], output: &mut Vec<u8>) -> FilterResult<()> {
        if !self.header_sent {
            output.extend_from_slice(&self.header);
            self.header_sent = true;
        }
        self.buffer.extend_from_slice(input);
        // The final segment must be sealed with the last flag, so always keep one back.
        while self.buffer.len() > SEGMENT_SIZE {
            let segment: Vec<u8> = self.buffer.drain(..SEGMENT_SIZE).collect();
            self.seal(&segment, false, output)?;
        }
        Ok(())
    }

    fn process_decrypt(&mut self, input: &[u8], output: &mut Vec<u8>) -> FilterResult<()> {
        self.buffer.extend_from_slice(input);
        if !self.read_header()? {
            return Ok(());
        }
        while self.buffer.len() > SEGMENT_SIZE + TAG_LEN {
            let segment: Vec<u8> = self.buffer.drain(..SEGMENT_SIZE + TAG_LEN).collect();
            self.open(&segment, false, output)?;
        }
        Ok(())
    }
}

fn check_rounds(rounds: u32) -> FilterResult<()> {
    if !(MIN_KDF_ROUNDS..=MAX_KDF_ROUNDS).contains(&rounds) {
        return Err(FilterError::Cipher(format!(
            "kdf rounds {rounds} outside {MIN_KDF_ROUNDS}..={MAX_KDF_ROUNDS}"
        )));
    }
    Ok(())
}

fn derive_cipher(passphrase: &[u8], salt: &[u8], rounds: u32) -> FilterResult<Aes256Gcm> {
    let mut stretched = Zeroizing::new([0u8; 32]);
    pbkdf2_hmac::<Sha256>(passphrase, salt, rounds, &mut stretched[..]);
    let mut key = Zeroizing::new([0u8; 32]);
    Hkdf::<Sha256>::new(Some(salt), &stretched[..])
        .expand(KDF_INFO, &mut key[..])
        .map_err(|_| FilterError::Cipher("key derivation failed".into()))?;
    Aes256Gcm::new_from_slice(&key[..])
        .map_err(|_| FilterError::Cipher("invalid key length".into()))
}

impl Filter for CipherBlock {
    fn name(&self) -> &str {
        match self.mode {
            CipherMode::Encrypt => "cipher-encrypt",
            CipherMode::Decrypt => "cipher-decrypt",
        }
    }

    fn process(&mut self, input: &[u8], output: &mut Vec<u8>) -> FilterResult<()> {
        match self.mode {
            CipherMode::Encrypt => self.process_encrypt(input, output),
            CipherMode::Decrypt => self.process_decrypt(input, output),
        }
    }

    fn finish(&mut self, output: &mut Vec<u8>) -> FilterResult<()> {
        match self.mode {
            CipherMode::Encrypt => {
                if !self.header_sent {
                    output.extend_from_slice(&self.header);
                    self.header_sent = true;
                }
                let tail = std::mem::take(&mut self.buffer);
                self.seal(&tail, true, output)
            }
            CipherMode::Decrypt => {
                if !self.read_header()? {
                    return Err(FilterError::Cipher("encrypted stream truncated in header".into()));
                }
                if self.buffer.len() < TAG_LEN {
                    return Err(FilterError::Cipher("encrypted stream truncated".into()));
                }
                let tail = std::mem::take(&mut self.buffer);
                self.open(&tail, true, output)
            }
        }
    }
}
