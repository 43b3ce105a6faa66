use std::fmt;
use std::io::Write;
use std::str::FromStr;

use flate2::write::{GzDecoder, GzEncoder};
use lz4_flex::frame::{BlockMode, BlockSize, FrameEncoder, FrameInfo};
use serde::{Deserialize, Serialize};
use zstd::stream::raw::{Decoder, Encoder, Operation, OutBuffer};

use crate::chain::Filter;
use crate::error::{FilterError, FilterResult};

/// Default zstd level.
pub const DEFAULT_LEVEL: i32 = 3;
const SCRATCH_SIZE: usize = 128 * 1024;

/// Compression applied to repository files.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressType {
    #[default]
    None,
    Gz,
    Lz4,
    Zst,
}

impl CompressType {
    /// File extension appended to compressed files, without the dot.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Gz => Some("gz"),
            Self::Lz4 => Some("lz4"),
            Self::Zst => Some("zst"),
        }
    }

    /// Level used when none is configured. lz4 has a single level.
    pub fn default_level(&self) -> i32 {
        match self {
            Self::None => 0,
            Self::Gz => 6,
            Self::Lz4 => 1,
            Self::Zst => DEFAULT_LEVEL,
        }
    }
}

impl fmt::Display for CompressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension().unwrap_or("none"))
    }
}

impl FromStr for CompressType {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "gz" | "gzip" => Ok(Self::Gz),
            "lz4" => Ok(Self::Lz4),
            "zst" | "zstd" => Ok(Self::Zst),
            other => Err(FilterError::Compression(format!("unknown compression type '{other}'"))),
        }
    }
}

fn codec_err(action: &str, err: impl fmt::Display) -> FilterError {
    FilterError::Compression(format!("unable to {action}: {err}"))
}

fn truncated() -> FilterError {
    FilterError::Compression("compressed stream is truncated or empty".into())
}

/// Streaming compression stage for one [`CompressType`].
pub struct Compress {
    encoder: Encoding,
}

enum Encoding {
    Zst { encoder: Encoder<'static>, scratch: Vec<u8> },
    Gz(GzEncoder<Vec<u8>>),
    /// Taken by `finish`, which consumes the encoder.
    Lz4(Option<FrameEncoder<Vec<u8>>>),
}

impl Compress {
    /// Encoder for `kind` at `level`, clamped to the codec's range.
    pub fn new(kind: CompressType, level: i32) -> FilterResult<Self> {
        let encoder = match kind {
            CompressType::None => {
                return Err(FilterError::Compression("no compression type selected".into()))
            }
            CompressType::Zst => Encoding::Zst {
                encoder: Encoder::new(level).map_err(|e| codec_err("create zst encoder", e))?,
                scratch: vec![0; SCRATCH_SIZE],
            },
            CompressType::Gz => {
                let level = level.clamp(0, 9) as u32;
                Encoding::Gz(GzEncoder::new(Vec::new(), flate2::Compression::new(level)))
            }
            CompressType::Lz4 => {
                let info = FrameInfo::new()
                    .block_size(BlockSize::Max64KB)
                    .block_mode(BlockMode::Independent);
                Encoding::Lz4(Some(FrameEncoder::with_frame_info(info, Vec::new())))
            }
        };
        Ok(Self { encoder })
    }
}

impl Filter for Compress {
    fn name(&self) -> &str {
        "compress"
    }

    fn process(&mut self, mut input: &[u8], output: &mut Vec<u8>) -> FilterResult<()> {
        match &mut self.encoder {
            Encoding::Zst { encoder, scratch } => {
                while !input.is_empty() {
                    let status = encoder
                        .run_on_buffers(input, scratch)
                        .map_err(|e| codec_err("compress", e))?;
                    output.extend_from_slice(&scratch[..status.bytes_written]);
                    input = &input[status.bytes_read..];
                }
            }
            Encoding::Gz(encoder) => {
                encoder.write_all(input).map_err(|e| codec_err("compress", e))?;
                output.append(encoder.get_mut());
            }
            Encoding::Lz4(encoder) => {
                let encoder = encoder.as_mut().ok_or_else(|| codec_err("compress", "stream finished"))?;
                encoder.write_all(input).map_err(|e| codec_err("compress", e))?;
                output.append(encoder.get_mut());
            }
        }
        Ok(())
    }

    fn finish(&mut self, output: &mut Vec<u8>) -> FilterResult<()> {
        match &mut self.encoder {
            Encoding::Zst { encoder, scratch } => loop {
                let mut out = OutBuffer::around(&mut scratch[..]);
                let remaining = encoder
                    .finish(&mut out, false)
                    .map_err(|e| codec_err("finish compression", e))?;
                let written = out.pos();
                output.extend_from_slice(&scratch[..written]);
                if remaining == 0 {
                    return Ok(());
                }
            },
            Encoding::Gz(encoder) => {
                encoder.try_finish().map_err(|e| codec_err("finish compression", e))?;
                output.append(encoder.get_mut());
                Ok(())
            }
            Encoding::Lz4(encoder) => {
                if let Some(encoder) = encoder.take() {
                    let mut tail = encoder.finish().map_err(|e| codec_err("finish compression", e))?;
                    output.append(&mut tail);
                }
                Ok(())
            }
        }
    }
}

/// Streaming decompression stage for one [`CompressType`].
///
/// Fails at `finish` when the input ended inside a frame, so a truncated
/// stream never yields silently shortened output.
pub struct Decompress {
    decoder: Decoding,
}

enum Decoding {
    Zst {
        decoder: Decoder<'static>,
        scratch: Vec<u8>,
        /// zstd's hint of bytes still expected; zero only on a frame boundary.
        frame_remaining: usize,
    },
    Gz(GzDecoder<Vec<u8>>),
    Lz4(Lz4Reader),
}

impl Decompress {
    pub fn new(kind: CompressType) -> FilterResult<Self> {
        let decoder = match kind {
            CompressType::None => {
                return Err(FilterError::Compression("no compression type selected".into()))
            }
            CompressType::Zst => Decoding::Zst {
                decoder: Decoder::new().map_err(|e| codec_err("create zst decoder", e))?,
                scratch: vec![0; SCRATCH_SIZE],
                frame_remaining: 1,
            },
            CompressType::Gz => Decoding::Gz(GzDecoder::new(Vec::new())),
            CompressType::Lz4 => Decoding::Lz4(Lz4Reader::new()),
        };
        Ok(Self { decoder })
    }
}

fn zst_drain(
    decoder: &mut Decoder<'static>,
    scratch: &mut [u8],
    frame_remaining: &mut usize,
    mut input: &[u8],
    output: &mut Vec<u8>,
) -> FilterResult<()> {
    loop {
        let status = decoder
            .run_on_buffers(input, scratch)
            .map_err(|e| codec_err("decompress", e))?;
        output.extend_from_slice(&scratch[..status.bytes_written]);
        input = &input[status.bytes_read..];
        *frame_remaining = status.remaining;

        let output_full = status.bytes_written == scratch.len();
        let stalled = status.bytes_read == 0 && status.bytes_written == 0;
        if (input.is_empty() && !output_full) || stalled {
            return Ok(());
        }
    }
}

impl Filter for Decompress {
    fn name(&self) -> &str {
        "decompress"
    }

    fn process(&mut self, input: &[u8], output: &mut Vec<u8>) -> FilterResult<()> {
        if input.is_empty() {
            return Ok(());
        }
        match &mut self.decoder {
            Decoding::Zst { decoder, scratch, frame_remaining } => {
                zst_drain(decoder, scratch, frame_remaining, input, output)
            }
            Decoding::Gz(decoder) => {
                decoder.write_all(input).map_err(|e| codec_err("decompress", e))?;
                output.append(decoder.get_mut());
                Ok(())
            }
            Decoding::Lz4(reader) => reader.process(input, output),
        }
    }

    fn finish(&mut self, output: &mut Vec<u8>) -> FilterResult<()> {
        match &mut self.decoder {
            Decoding::Zst { decoder, scratch, frame_remaining } => {
                if *frame_remaining != 0 {
                    zst_drain(decoder, scratch, frame_remaining, &[], output)?;
                }
                if *frame_remaining != 0 {
                    return Err(truncated());
                }
                Ok(())
            }
            Decoding::Gz(decoder) => {
                // flate2 reports a missing header or trailer as corrupt input
                decoder.try_finish().map_err(|_| truncated())?;
                output.append(decoder.get_mut());
                Ok(())
            }
            Decoding::Lz4(reader) => reader.finish(),
        }
    }
}

const LZ4_MAGIC: u32 = 0x184D_2204;
const LZ4_FLG_VERSION: u8 = 0b0100_0000;
const LZ4_FLG_INDEPENDENT: u8 = 0b0010_0000;
const LZ4_FLG_BLOCK_CHECKSUM: u8 = 0b0001_0000;
const LZ4_FLG_CONTENT_SIZE: u8 = 0b0000_1000;
const LZ4_FLG_CONTENT_CHECKSUM: u8 = 0b0000_0100;
const LZ4_FLG_DICT_ID: u8 = 0b0000_0001;
const LZ4_UNCOMPRESSED_BIT: u32 = 0x8000_0000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lz4State {
    Header,
    Block,
    Trailer,
    Done,
}

/// Push-based reader for the lz4 frame format.
///
/// Input is buffered until a whole header or block is available, so no
/// more than one block is held at a time. Linked blocks and dictionaries
/// are rejected. Checksums are consumed but not verified.
struct Lz4Reader {
    pending: Vec<u8>,
    state: Lz4State,
    block_max: usize,
    block_checksum: bool,
    content_checksum: bool,
    scratch: Vec<u8>,
}

impl Lz4Reader {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
            state: Lz4State::Header,
            block_max: 0,
            block_checksum: false,
            content_checksum: false,
            scratch: Vec::new(),
        }
    }

    fn word(&self, at: usize) -> u32 {
        u32::from_le_bytes([
            self.pending[at],
            self.pending[at + 1],
            self.pending[at + 2],
            self.pending[at + 3],
        ])
    }

    fn process(&mut self, input: &[u8], output: &mut Vec<u8>) -> FilterResult<()> {
        self.pending.extend_from_slice(input);
        let mut at = 0;
        while let Some(used) = self.step(at, output)? {
            at += used;
        }
        self.pending.drain(..at);
        Ok(())
    }

    /// Consume one unit at `at`; `None` when more input is needed.
    fn step(&mut self, at: usize, output: &mut Vec<u8>) -> FilterResult<Option<usize>> {
        let available = self.pending.len() - at;
        match self.state {
            Lz4State::Header => {
                if available < 7 {
                    return Ok(None);
                }
                if self.word(at) != LZ4_MAGIC {
                    return Err(FilterError::Compression("not an lz4 frame".into()));
                }
                let flags = self.pending[at + 4];
                if flags & 0b1100_0000 != LZ4_FLG_VERSION {
                    return Err(FilterError::Compression("unsupported lz4 frame version".into()));
                }
                if flags & LZ4_FLG_INDEPENDENT == 0 || flags & LZ4_FLG_DICT_ID != 0 {
                    return Err(FilterError::Compression(
                        "lz4 frames with linked blocks or dictionaries are not supported".into(),
                    ));
                }
                self.block_max = match (self.pending[at + 5] >> 4) & 0x7 {
                    4 => 64 * 1024,
                    5 => 256 * 1024,
                    6 => 1024 * 1024,
                    7 => 4 * 1024 * 1024,
                    other => {
                        return Err(FilterError::Compression(format!("invalid lz4 block size code {other}")))
                    }
                };
                self.block_checksum = flags & LZ4_FLG_BLOCK_CHECKSUM != 0;
                self.content_checksum = flags & LZ4_FLG_CONTENT_CHECKSUM != 0;
                let length = 7 + if flags & LZ4_FLG_CONTENT_SIZE != 0 { 8 } else { 0 };
                if available < length {
                    return Ok(None);
                }
                self.state = Lz4State::Block;
                Ok(Some(length))
            }
            Lz4State::Block => {
                if available < 4 {
                    return Ok(None);
                }
                let word = self.word(at);
                if word == 0 {
                    self.state = Lz4State::Trailer;
                    return Ok(Some(4));
                }
                let size = (word & !LZ4_UNCOMPRESSED_BIT) as usize;
                if size > self.block_max {
                    return Err(FilterError::Compression(format!(
                        "lz4 block of {size} bytes exceeds the frame maximum of {}",
                        self.block_max
                    )));
                }
                let length = 4 + size + if self.block_checksum { 4 } else { 0 };
                if available < length {
                    return Ok(None);
                }
                let data = &self.pending[at + 4..at + 4 + size];
                if word & LZ4_UNCOMPRESSED_BIT != 0 {
                    output.extend_from_slice(data);
                } else {
                    self.scratch.resize(self.block_max, 0);
                    let written = lz4_flex::block::decompress_into(data, &mut self.scratch)
                        .map_err(|e| codec_err("decompress", e))?;
                    output.extend_from_slice(&self.scratch[..written]);
                }
                Ok(Some(length))
            }
            Lz4State::Trailer => {
                let length = if self.content_checksum { 4 } else { 0 };
                if available < length {
                    return Ok(None);
                }
                self.state = Lz4State::Done;
                Ok(Some(length))
            }
            // concatenated frames
            Lz4State::Done if available > 0 => {
                self.state = Lz4State::Header;
                Ok(Some(0))
            }
            Lz4State::Done => Ok(None),
        }
    }

    fn finish(&mut self) -> FilterResult<()> {
        if self.state != Lz4State::Done || !self.pending.is_empty() {
            return Err(truncated());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const KINDS: [CompressType; 3] = [CompressType::Gz, CompressType::Lz4, CompressType::Zst];

    fn run(filter: &mut dyn Filter, data: &[u8], chunk: usize) -> FilterResult<Vec<u8>> {
        let mut out = Vec::new();
        for piece in data.chunks(chunk.max(1)) {
            filter.process(piece, &mut out)?;
        }
        filter.finish(&mut out)?;
        Ok(out)
    }

    fn compress(kind: CompressType, data: &[u8]) -> Vec<u8> {
        run(&mut Compress::new(kind, kind.default_level()).unwrap(), data, 4096).unwrap()
    }

    fn decompress(kind: CompressType, data: &[u8]) -> FilterResult<Vec<u8>> {
        run(&mut Decompress::new(kind).unwrap(), data, 1000)
    }

    fn counting() -> Vec<u8> {
        (0..50_000u32).flat_map(|i| i.to_le_bytes()).collect()
    }

    #[test]
    fn repetitive_data_shrinks() {
        let data = vec![0xABu8; 1_000_000];
        for kind in KINDS {
            let packed = compress(kind, &data);
            assert!(packed.len() < data.len() / 100, "{kind} packed to {}", packed.len());
            assert_eq!(decompress(kind, &packed).unwrap(), data, "{kind}");
        }
    }

    #[test]
    fn empty_input_roundtrip() {
        for kind in KINDS {
            let packed = compress(kind, b"");
            assert!(!packed.is_empty(), "{kind}");
            assert_eq!(decompress(kind, &packed).unwrap(), b"", "{kind}");
        }
    }

    #[test]
    fn gz_output_is_a_gzip_member() {
        let packed = compress(CompressType::Gz, b"archive-push");
        assert_eq!(&packed[..2], &[0x1f, 0x8b]);
        let mut reader = flate2::read::GzDecoder::new(&packed[..]);
        let mut plain = String::new();
        std::io::Read::read_to_string(&mut reader, &mut plain).unwrap();
        assert_eq!(plain, "archive-push");
    }

    #[test]
    fn gz_truncated_by_one_byte_fails() {
        let packed = compress(CompressType::Gz, &counting());
        let err = decompress(CompressType::Gz, &packed[..packed.len() - 1]).unwrap_err();
        assert!(matches!(err, FilterError::Compression(_)));
    }

    #[test]
    fn lz4_output_is_a_standard_frame() {
        let data = counting();
        let packed = compress(CompressType::Lz4, &data);
        assert_eq!(&packed[..4], &LZ4_MAGIC.to_le_bytes());
        let mut reader = lz4_flex::frame::FrameDecoder::new(&packed[..]);
        let mut plain = Vec::new();
        std::io::Read::read_to_end(&mut reader, &mut plain).unwrap();
        assert_eq!(plain, data);
    }

    #[test]
    fn lz4_truncated_by_one_byte_fails() {
        let packed = compress(CompressType::Lz4, &counting());
        let err = decompress(CompressType::Lz4, &packed[..packed.len() - 1]).unwrap_err();
        assert!(matches!(err, FilterError::Compression(_)));
    }

    #[test]
    fn lz4_block_cut_mid_way_fails() {
        let packed = compress(CompressType::Lz4, &counting());
        let err = decompress(CompressType::Lz4, &packed[..packed.len() / 2]).unwrap_err();
        assert!(err.to_string().contains("truncated"), "{err}");
    }

    #[test]
    fn lz4_concatenated_frames() {
        let mut packed = compress(CompressType::Lz4, b"first ");
        packed.extend(compress(CompressType::Lz4, b"second"));
        assert_eq!(decompress(CompressType::Lz4, &packed).unwrap(), b"first second");
    }

    #[test]
    fn lz4_linked_blocks_rejected() {
        let info = FrameInfo::new().block_mode(BlockMode::Linked);
        let mut encoder = FrameEncoder::with_frame_info(info, Vec::new());
        encoder.write_all(b"linked").unwrap();
        let packed = encoder.finish().unwrap();
        let err = decompress(CompressType::Lz4, &packed).unwrap_err();
        assert!(err.to_string().contains("linked blocks"), "{err}");
    }

    #[test]
    fn zst_truncated_by_one_byte_fails() {
        let packed = compress(CompressType::Zst, &counting());
        let err = decompress(CompressType::Zst, &packed[..packed.len() - 1]).unwrap_err();
        assert!(matches!(err, FilterError::Compression(_)));
    }

    #[test]
    fn empty_compressed_stream_fails() {
        for kind in KINDS {
            assert!(matches!(decompress(kind, b""), Err(FilterError::Compression(_))), "{kind}");
        }
    }

    #[test]
    fn garbage_fails() {
        for kind in KINDS {
            let err = decompress(kind, b"definitely not compressed data").unwrap_err();
            assert!(matches!(err, FilterError::Compression(_)), "{kind}");
        }
    }

    #[test]
    fn none_has_no_codec() {
        assert!(Compress::new(CompressType::None, 0).is_err());
        assert!(Decompress::new(CompressType::None).is_err());
    }

    #[test]
    fn compress_type_parse() {
        assert_eq!("zst".parse::<CompressType>().unwrap(), CompressType::Zst);
        assert_eq!("gzip".parse::<CompressType>().unwrap(), CompressType::Gz);
        assert_eq!("lz4".parse::<CompressType>().unwrap(), CompressType::Lz4);
        assert_eq!("none".parse::<CompressType>().unwrap(), CompressType::None);
        assert!("xz".parse::<CompressType>().is_err());
        assert_eq!(CompressType::Gz.extension(), Some("gz"));
        assert_eq!(CompressType::Lz4.to_string(), "lz4");
        assert_eq!(CompressType::None.extension(), None);
    }

    fn any_kind() -> impl Strategy<Value = CompressType> {
        prop::sample::select(KINDS.to_vec())
    }

    proptest! {
        #[test]
        fn roundtrip_any_bytes(
            kind in any_kind(),
            data in proptest::collection::vec(any::<u8>(), 0..100_000),
            chunk in 1usize..20_000,
        ) {
            let packed = run(&mut Compress::new(kind, 1).unwrap(), &data, chunk).unwrap();
            let plain = run(&mut Decompress::new(kind).unwrap(), &packed, chunk).unwrap();
            prop_assert_eq!(plain, data);
        }

        #[test]
        fn truncation_never_silent(kind in any_kind(), data in proptest::collection::vec(any::<u8>(), 1..10_000)) {
            let packed = run(&mut Compress::new(kind, 1).unwrap(), &data, 512).unwrap();
            let result = run(&mut Decompress::new(kind).unwrap(), &packed[..packed.len() - 1], 512);
            prop_assert!(matches!(result, Err(FilterError::Compression(_))));
        }
    }
}
