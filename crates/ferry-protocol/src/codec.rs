use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{Frame, BLOCK_ABORT, BLOCK_END, BLOCK_ERROR, MAX_BLOCK_SIZE, MAX_FRAME_SIZE};

/// One unit of a block stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Block {
    Data(Vec<u8>),
    End,
    Abort,
    /// The sender hit an error; an error frame follows.
    Error,
}

/// Codec for protocol frames and payload blocks.
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a frame: [4 bytes len][1 byte tag][payload]
    pub fn encode(frame: &Frame) -> ProtocolResult<Vec<u8>> {
        let payload =
            bincode::serialize(frame).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        let len = (payload.len() + 1) as u32;
        let mut buf = Vec::with_capacity(4 + 1 + payload.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.push(frame.type_tag());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Decode a framed message. Returns (frame, bytes_consumed).
    pub fn decode(data: &[u8]) -> ProtocolResult<(Frame, usize)> {
        if data.len() < 5 {
            return Err(ProtocolError::Framing("too short".into()));
        }
        let len = Self::frame_len(read_u32(data))?;
        let total = 4 + len;
        if data.len() < total {
            return Err(ProtocolError::Framing(format!(
                "incomplete: have {}, need {}",
                data.len(),
                total
            )));
        }
        let frame = Self::decode_body(data[4], &data[5..total])?;
        Ok((frame, total))
    }

    /// Validate a frame length header and return it as a byte count.
    fn frame_len(len: u32) -> ProtocolResult<usize> {
        let len = len as usize;
        if len < 1 {
            return Err(ProtocolError::Framing("zero-length frame".into()));
        }
        if len - 1 > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: len - 1,
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(len)
    }

    fn decode_body(tag: u8, payload: &[u8]) -> ProtocolResult<Frame> {
        if !matches!(tag, 1 | 2 | 3 | 255) {
            return Err(ProtocolError::InvalidFrameType(tag));
        }
        let frame: Frame = bincode::deserialize(payload)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        if frame.type_tag() != tag {
            return Err(ProtocolError::Framing(format!(
                "tag {tag} does not match {} payload",
                frame.type_name()
            )));
        }
        Ok(frame)
    }

    /// Encode a block: [4 bytes len][data]. Empty data is not a block; use [`Self::encode_end`].
    pub fn encode_block(data: &[u8], out: &mut Vec<u8>) -> ProtocolResult<()> {
        if data.is_empty() {
            return Err(ProtocolError::Framing("empty data block".into()));
        }
        for chunk in data.chunks(MAX_BLOCK_SIZE) {
            out.extend_from_slice(&(chunk.len() as u32).to_be_bytes());
            out.extend_from_slice(chunk);
        }
        Ok(())
    }

    pub fn encode_end(out: &mut Vec<u8>) {
        out.extend_from_slice(&BLOCK_END.to_be_bytes());
    }

    pub fn encode_abort(out: &mut Vec<u8>) {
        out.extend_from_slice(&BLOCK_ABORT.to_be_bytes());
    }

    /// Decode one block. Returns (block, bytes_consumed).
    pub fn decode_block(data: &[u8]) -> ProtocolResult<(Block, usize)> {
        if data.len() < 4 {
            return Err(ProtocolError::Framing("block header too short".into()));
        }
        match Self::block_len(read_u32(data))? {
            Ok(len) => {
                let total = 4 + len;
                if data.len() < total {
                    return Err(ProtocolError::Framing(format!(
                        "incomplete block: have {}, need {}",
                        data.len(),
                        total
                    )));
                }
                Ok((Block::Data(data[4..total].to_vec()), total))
            }
            Err(marker) => Ok((marker, 4)),
        }
    }

    /// Either a data length or a marker block.
    fn block_len(len: u32) -> ProtocolResult<Result<usize, Block>> {
        match len {
            BLOCK_END => Ok(Err(Block::End)),
            BLOCK_ABORT => Ok(Err(Block::Abort)),
            BLOCK_ERROR => Ok(Err(Block::Error)),
            n if n as usize > MAX_BLOCK_SIZE => Err(ProtocolError::Framing(format!(
                "block of {n} bytes exceeds maximum {MAX_BLOCK_SIZE}"
            ))),
            n => Ok(Ok(n as usize)),
        }
    }

    pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> ProtocolResult<Frame> {
        let mut header = [0u8; 5];
        reader.read_exact(&mut header).await?;
        let len = Self::frame_len(read_u32(&header))?;
        let mut payload = vec![0u8; len - 1];
        reader.read_exact(&mut payload).await?;
        Self::decode_body(header[4], &payload)
    }

    pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> ProtocolResult<()> {
        let bytes = Self::encode(frame)?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn read_block<R: AsyncRead + Unpin>(reader: &mut R) -> ProtocolResult<Block> {
        let mut header = [0u8; 4];
        reader.read_exact(&mut header).await?;
        match Self::block_len(read_u32(&header))? {
            Ok(len) => {
                let mut data = vec![0u8; len];
                reader.read_exact(&mut data).await?;
                Ok(Block::Data(data))
            }
            Err(marker) => Ok(marker),
        }
    }

    /// Write data as one or more blocks; empty data writes nothing.
    pub async fn write_block<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> ProtocolResult<()> {
        for chunk in data.chunks(MAX_BLOCK_SIZE) {
            writer.write_all(&(chunk.len() as u32).to_be_bytes()).await?;
            writer.write_all(chunk).await?;
        }
        Ok(())
    }

    pub async fn write_marker<W: AsyncWrite + Unpin>(writer: &mut W, marker: u32) -> ProtocolResult<()> {
        writer.write_all(&marker.to_be_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

fn read_u32(data: &[u8]) -> u32 {
    u32::from_be_bytes([data[0], data[1], data[2], data[3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::*;
    use ferry_types::ErrorKind;
    use proptest::prelude::*;

    macro_rules! roundtrip_test {
        ($name:ident, $frame:expr) => {
            #[test]
            fn $name() {
                let frame = $frame;
                let encoded = FrameCodec::encode(&frame).unwrap();
                let (decoded, consumed) = FrameCodec::decode(&encoded).unwrap();
                assert_eq!(consumed, encoded.len());
                assert_eq!(decoded, frame);
            }
        };
    }

    roundtrip_test!(greeting_roundtrip, Frame::Greeting(Greeting::current()));

    roundtrip_test!(command_roundtrip, Frame::command(
        commands::STORAGE_OPEN_WRITE,
        vec![
            Param::from("backup/20240101F/pg_data/base/1/1259"),
            Param::UInt(0o640),
            Param::Null,
            Param::Bool(true),
            Param::List(vec![Param::Int(-1), Param::Binary(vec![0, 1, 2])]),
        ],
    ));

    roundtrip_test!(response_roundtrip, Frame::response(vec![Param::Bool(false)]));

    roundtrip_test!(error_roundtrip, Frame::Error {
        kind: ErrorKind::NotFound,
        message: "unable to open missing file '/repo/archive.info'".into(),
    });

    #[test]
    fn decode_truncated() {
        let err = FrameCodec::decode(&[0, 0, 0]).unwrap_err();
        assert!(matches!(err, ProtocolError::Framing(_)));
    }

    #[test]
    fn decode_zero_length() {
        let data = [0u8, 0, 0, 0, 0];
        let err = FrameCodec::decode(&data).unwrap_err();
        assert!(matches!(err, ProtocolError::Framing(_)));
    }

    #[test]
    fn decode_oversized() {
        let len = (MAX_FRAME_SIZE as u32) + 2;
        let mut data = len.to_be_bytes().to_vec();
        data.push(2);
        let err = FrameCodec::decode(&data).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[test]
    fn decode_unknown_tag() {
        let mut encoded = FrameCodec::encode(&Frame::response(vec![])).unwrap();
        encoded[4] = 9;
        assert!(matches!(FrameCodec::decode(&encoded), Err(ProtocolError::InvalidFrameType(9))));
    }

    #[test]
    fn decode_tag_payload_mismatch() {
        let mut encoded = FrameCodec::encode(&Frame::response(vec![])).unwrap();
        encoded[4] = 2;
        assert!(matches!(FrameCodec::decode(&encoded), Err(ProtocolError::Framing(_))));
    }

    #[test]
    fn markers_decode() {
        let mut buf = Vec::new();
        FrameCodec::encode_end(&mut buf);
        FrameCodec::encode_abort(&mut buf);
        assert_eq!(FrameCodec::decode_block(&buf).unwrap(), (Block::End, 4));
        assert_eq!(FrameCodec::decode_block(&buf[4..]).unwrap(), (Block::Abort, 4));
    }

    #[test]
    fn oversized_block_rejected() {
        let data = ((MAX_BLOCK_SIZE + 1) as u32).to_be_bytes();
        assert!(matches!(FrameCodec::decode_block(&data), Err(ProtocolError::Framing(_))));
    }

    #[test]
    fn empty_block_rejected() {
        let mut buf = Vec::new();
        assert!(FrameCodec::encode_block(&[], &mut buf).is_err());
    }

    #[tokio::test]
    async fn async_frames_and_blocks_share_stream() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let writer = tokio::spawn(async move {
            FrameCodec::write_frame(&mut a, &Frame::response(vec![Param::Bool(true)])).await.unwrap();
            FrameCodec::write_block(&mut a, &vec![7u8; 3000]).await.unwrap();
            FrameCodec::write_marker(&mut a, BLOCK_END).await.unwrap();
            FrameCodec::write_frame(&mut a, &Frame::response(vec![])).await.unwrap();
        });

        assert_eq!(
            FrameCodec::read_frame(&mut b).await.unwrap(),
            Frame::response(vec![Param::Bool(true)])
        );
        assert_eq!(FrameCodec::read_block(&mut b).await.unwrap(), Block::Data(vec![7u8; 3000]));
        assert_eq!(FrameCodec::read_block(&mut b).await.unwrap(), Block::End);
        assert_eq!(FrameCodec::read_frame(&mut b).await.unwrap(), Frame::response(vec![]));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn closed_stream_is_io_eof() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        match FrameCodec::read_frame(&mut b).await {
            Err(ProtocolError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected {other:?}"),
        }
    }

    proptest! {
        #[test]
        fn block_stream_reassembles(
            chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..3000), 0..20)
        ) {
            let mut wire = Vec::new();
            let mut expected = Vec::new();
            for chunk in &chunks {
                if !chunk.is_empty() {
                    FrameCodec::encode_block(chunk, &mut wire).unwrap();
                }
                expected.extend_from_slice(chunk);
            }
            FrameCodec::encode_end(&mut wire);

            let mut received = Vec::new();
            let mut at = 0;
            loop {
                let (block, used) = FrameCodec::decode_block(&wire[at..]).unwrap();
                at += used;
                match block {
                    Block::Data(data) => received.extend(data),
                    Block::End => break,
                    other => panic!("unexpected {other:?}"),
                }
            }
            prop_assert_eq!(at, wire.len());
            prop_assert_eq!(received, expected);
        }
    }
}
