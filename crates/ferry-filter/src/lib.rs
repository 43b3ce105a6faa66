//! Composable stream filters for ferry.
//!
//! A [`FilterChain`] is an ordered list of stateful [`Filter`] stages placed
//! between a storage driver's raw bytes and the caller. Stages may buffer, so
//! one input chunk can produce zero or more output bytes; `finish` flushes
//! each stage's tail exactly once.
//!
//! # Stages
//!
//! - [`CipherBlock`]: AES-256-GCM in authenticated segments, keyed from a passphrase
//! - [`Compress`] / [`Decompress`]: streaming gz, lz4 and zstd
//! - [`HashFilter`]: SHA-256 of the bytes passing through
//! - [`SizeFilter`]: byte count
//!
//! Stage order is the caller's responsibility here; the storage facade always
//! compresses before encrypting on write and decrypts before decompressing on read.

pub mod chain;
pub mod cipher;
pub mod compress;
pub mod error;
pub mod hash;

pub use chain::{Filter, FilterChain, FilterOutput, FilterResults};
pub use cipher::{CipherBlock, CipherMode};
pub use compress::{CompressType, Compress, Decompress, DEFAULT_LEVEL};
pub use error::{FilterError, FilterResult};
pub use hash::{HashFilter, SizeFilter};

#[cfg(test)]
mod tests {
    use super::*;

    fn write_chain(pass: &[u8]) -> FilterChain {
        FilterChain::new()
            .with(SizeFilter::new("size"))
            .with(HashFilter::sha256("sha256"))
            .with(Compress::new(CompressType::Zst, DEFAULT_LEVEL).unwrap())
            .with(CipherBlock::encrypt(pass).unwrap())
            .with(SizeFilter::new("repo-size"))
    }

    fn read_chain(pass: &[u8]) -> FilterChain {
        FilterChain::new()
            .with(CipherBlock::decrypt(pass).unwrap())
            .with(Decompress::new(CompressType::Zst).unwrap())
            .with(SizeFilter::new("size"))
            .with(HashFilter::sha256("sha256"))
    }

    fn pump(chain: &mut FilterChain, data: &[u8], chunk: usize) -> FilterResult<Vec<u8>> {
        let mut out = Vec::new();
        for piece in data.chunks(chunk) {
            out.extend(chain.process(piece)?);
        }
        out.extend(chain.finish()?);
        Ok(out)
    }

    #[test]
    fn compress_then_encrypt_roundtrip() {
        let data: Vec<u8> = b"SELECT * FROM pg_class;\n".repeat(20_000);

        let mut writer = write_chain(b"repo-pass");
        let stored = pump(&mut writer, &data, 65_000).unwrap();
        let written = writer.results();
        assert_eq!(written.size("size"), Some(data.len() as u64));
        assert_eq!(written.size("repo-size"), Some(stored.len() as u64));
        assert!(stored.len() < data.len());
        assert!(stored.starts_with(cipher::MAGIC));

        let mut reader = read_chain(b"repo-pass");
        let restored = pump(&mut reader, &stored, 12_345).unwrap();
        assert_eq!(restored, data);
        assert_eq!(reader.results().hash("sha256"), written.hash("sha256"));
    }

    #[test]
    fn wrong_key_surfaces_as_cipher_error() {
        let mut writer = write_chain(b"right");
        let stored = pump(&mut writer, b"payload", 3).unwrap();
        let err = pump(&mut read_chain(b"wrong"), &stored, 1024).unwrap_err();
        let err: ferry_types::StorageError = err.into();
        assert_eq!(err.kind(), ferry_types::ErrorKind::Cipher);
    }
}
