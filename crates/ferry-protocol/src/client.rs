use ferry_transport::BoxChannel;
use tokio::io::{AsyncWriteExt, BufStream};
use tracing::{debug, trace};

use crate::codec::{Block, FrameCodec};
use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{commands, Frame, Greeting, Param, BLOCK_ABORT, BLOCK_END};

/// Client end of one protocol channel.
///
/// Every method takes `&mut self`, so a channel carries at most one
/// outstanding request. Parallel operations open more channels.
pub struct ProtocolClient {
    peer: String,
    stream: BufStream<BoxChannel>,
    broken: bool,
}

impl std::fmt::Debug for ProtocolClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolClient")
            .field("peer", &self.peer)
            .field("broken", &self.broken)
            .finish()
    }
}

impl ProtocolClient {
    /// Read the server greeting, verify it, and round-trip a `noop` so that a
    /// server failing at startup is reported here rather than on first use.
    pub async fn open(peer: impl Into<String>, channel: BoxChannel) -> ProtocolResult<Self> {
        Self::open_expecting(peer, channel, &Greeting::current()).await
    }

    pub async fn open_expecting(
        peer: impl Into<String>,
        channel: BoxChannel,
        expected: &Greeting,
    ) -> ProtocolResult<Self> {
        let mut client = Self {
            peer: peer.into(),
            stream: BufStream::new(channel),
            broken: false,
        };
        match client.read_frame().await? {
            Frame::Greeting(greeting) => {
                expected.check(&greeting)?;
                debug!(target: "ferry::protocol", peer = %client.peer, ?greeting, "greeting accepted");
            }
            Frame::Error { kind, message } => return Err(client.remote(kind, message)),
            other => {
                return Err(ProtocolError::UnexpectedFrame {
                    expected: "Greeting",
                    found: other.type_name(),
                })
            }
        }
        client.request(commands::NOOP, Vec::new()).await?;
        Ok(client)
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// False once a framing or I/O failure has left the channel unusable.
    pub fn is_healthy(&self) -> bool {
        !self.broken
    }

    fn track<T>(&mut self, result: ProtocolResult<T>) -> ProtocolResult<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                self.broken = true;
            }
        }
        result
    }

    fn remote(&self, kind: ferry_types::ErrorKind, message: String) -> ProtocolError {
        ProtocolError::Remote {
            kind,
            message: format!("raised from {}: {message}", self.peer),
        }
    }

    async fn read_frame(&mut self) -> ProtocolResult<Frame> {
        let result = FrameCodec::read_frame(&mut self.stream).await;
        self.track(result)
    }

    /// Send a command and wait for its single response.
    pub async fn request(&mut self, command: &str, params: Vec<Param>) -> ProtocolResult<Vec<Param>> {
        self.send(command, params).await?;
        self.response().await
    }

    /// Send a command without waiting; the caller reads the response (and any blocks).
    pub async fn send(&mut self, command: &str, params: Vec<Param>) -> ProtocolResult<()> {
        trace!(target: "ferry::protocol", peer = %self.peer, command, "request");
        let frame = Frame::command(command, params);
        let result = FrameCodec::write_frame(&mut self.stream, &frame).await;
        self.track(result)
    }

    /// Read the next response, re-raising a peer error with its original kind.
    pub async fn response(&mut self) -> ProtocolResult<Vec<Param>> {
        match self.read_frame().await? {
            Frame::Response { values } => Ok(values),
            Frame::Error { kind, message } => Err(self.remote(kind, message)),
            other => {
                let err = ProtocolError::UnexpectedFrame {
                    expected: "Response",
                    found: other.type_name(),
                };
                self.track(Err(err))
            }
        }
    }

    /// Next payload block of a read stream, `None` at the end marker.
    pub async fn read_block(&mut self) -> ProtocolResult<Option<Vec<u8>>> {
        let result = FrameCodec::read_block(&mut self.stream).await;
        match self.track(result)? {
            Block::Data(data) => Ok(Some(data)),
            Block::End => Ok(None),
            Block::Error => match self.response().await {
                Err(err) => Err(err),
                Ok(_) => self.track(Err(ProtocolError::Framing(
                    "error marker not followed by an error frame".into(),
                ))),
            },
            Block::Abort => self.track(Err(ProtocolError::Framing(
                "unexpected abort marker in read stream".into(),
            ))),
        }
    }

    pub async fn write_block(&mut self, data: &[u8]) -> ProtocolResult<()> {
        let result = FrameCodec::write_block(&mut self.stream, data).await;
        self.track(result)
    }

    pub async fn write_end(&mut self) -> ProtocolResult<()> {
        let result = FrameCodec::write_marker(&mut self.stream, BLOCK_END).await;
        self.track(result)
    }

    pub async fn write_abort(&mut self) -> ProtocolResult<()> {
        let result = FrameCodec::write_marker(&mut self.stream, BLOCK_ABORT).await;
        self.track(result)
    }

    /// Ask the peer to exit and release the channel without waiting for a reply.
    pub async fn close(mut self) {
        if self.is_healthy() {
            let _ = FrameCodec::write_frame(&mut self.stream, &Frame::command(commands::EXIT, Vec::new())).await;
        }
        if let Err(err) = self.stream.shutdown().await {
            debug!(target: "ferry::protocol", peer = %self.peer, error = %err, "channel shutdown failed");
        }
    }
}
