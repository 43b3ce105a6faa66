use async_trait::async_trait;
use ferry_transport::BoxChannel;
use ferry_types::{StorageError, StorageResult};
use tokio::io::{AsyncWriteExt, BufStream};
use tracing::{debug, trace, warn};

use crate::codec::{Block, FrameCodec};
use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{commands, Frame, Greeting, Param, BLOCK_ERROR};

/// Dispatches one command on the server side.
///
/// A handler answers through the [`ServerSession`]: exactly one terminal
/// response per command, preceded by any stream blocks. Returning an error
/// sends it to the client as an error frame instead.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(
        &self,
        command: &str,
        params: Vec<Param>,
        session: &mut ServerSession,
    ) -> StorageResult<()>;
}

/// Server end of one channel, handed to the command handler.
pub struct ServerSession {
    stream: BufStream<BoxChannel>,
    /// A read stream is open: the client is waiting for blocks, not a frame.
    streaming: bool,
    broken: bool,
}

impl ServerSession {
    fn new(channel: BoxChannel) -> Self {
        Self {
            stream: BufStream::new(channel),
            streaming: false,
            broken: false,
        }
    }

    fn track<T>(&mut self, result: ProtocolResult<T>) -> StorageResult<T> {
        result.map_err(|err| {
            if err.is_fatal() {
                self.broken = true;
            }
            err.into()
        })
    }

    async fn write_frame(&mut self, frame: &Frame) -> StorageResult<()> {
        let result = FrameCodec::write_frame(&mut self.stream, frame).await;
        self.track(result)
    }

    pub async fn respond(&mut self, values: Vec<Param>) -> StorageResult<()> {
        self.write_frame(&Frame::response(values)).await
    }

    /// Respond, then open a block stream toward the client.
    pub async fn respond_stream(&mut self, values: Vec<Param>) -> StorageResult<()> {
        self.respond(values).await?;
        self.streaming = true;
        Ok(())
    }

    pub async fn write_block(&mut self, data: &[u8]) -> StorageResult<()> {
        let result = FrameCodec::write_block(&mut self.stream, data).await;
        self.track(result)
    }

    pub async fn write_end(&mut self) -> StorageResult<()> {
        let result = FrameCodec::write_marker(&mut self.stream, crate::message::BLOCK_END).await;
        self.streaming = false;
        self.track(result)
    }

    /// Next block of a client write stream.
    pub async fn read_block(&mut self) -> StorageResult<Block> {
        let result = FrameCodec::read_block(&mut self.stream).await;
        let block = self.track(result)?;
        if block == Block::Error {
            self.broken = true;
            return Err(StorageError::ProtocolFraming(
                "error marker is not valid in a write stream".into(),
            ));
        }
        Ok(block)
    }

    /// Report an error as the terminal frame of the current command.
    async fn send_error(&mut self, err: &StorageError) -> StorageResult<()> {
        if self.streaming {
            let result = FrameCodec::write_marker(&mut self.stream, BLOCK_ERROR).await;
            self.track(result)?;
            self.streaming = false;
        }
        self.write_frame(&Frame::Error {
            kind: err.kind(),
            message: err.message().to_string(),
        })
        .await
    }
}

/// How a served session ended without error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client sent `exit`.
    Exit,
    /// The channel reached end of stream first.
    Disconnected,
}

/// Serves protocol commands on a channel until the client exits or disconnects.
pub struct ProtocolServer<H> {
    greeting: Greeting,
    handler: H,
}

impl<H: CommandHandler> ProtocolServer<H> {
    pub fn new(handler: H) -> Self {
        Self {
            greeting: Greeting::current(),
            handler,
        }
    }

    pub fn with_greeting(mut self, greeting: Greeting) -> Self {
        self.greeting = greeting;
        self
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub async fn serve(&self, channel: BoxChannel) -> StorageResult<SessionEnd> {
        let mut session = ServerSession::new(channel);
        session.write_frame(&Frame::Greeting(self.greeting.clone())).await?;

        loop {
            let frame = match FrameCodec::read_frame(&mut session.stream).await {
                Ok(frame) => frame,
                Err(ProtocolError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!(target: "ferry::protocol", "client disconnected");
                    return Ok(SessionEnd::Disconnected);
                }
                Err(err) => return Err(err.into()),
            };

            let (command, params) = match frame {
                Frame::Command { command, params } => (command, params),
                other => {
                    return Err(ProtocolError::UnexpectedFrame {
                        expected: "Command",
                        found: other.type_name(),
                    }
                    .into())
                }
            };
            trace!(target: "ferry::protocol", %command, params = params.len(), "command");

            match command.as_str() {
                commands::EXIT => {
                    debug!(target: "ferry::protocol", "client requested exit");
                    let _ = session.stream.shutdown().await;
                    return Ok(SessionEnd::Exit);
                }
                commands::NOOP => session.respond(Vec::new()).await?,
                _ => {
                    if let Err(err) = self.handler.handle(&command, params, &mut session).await {
                        if session.broken {
                            warn!(target: "ferry::protocol", %command, error = %err, "channel failed");
                            return Err(err);
                        }
                        debug!(target: "ferry::protocol", %command, error = %err, "command failed");
                        session.send_error(&err).await?;
                    }
                }
            }
        }
    }
}
