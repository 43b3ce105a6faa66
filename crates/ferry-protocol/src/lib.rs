//! Remote protocol for ferry.
//!
//! Proxies storage operations to a peer process running the same engine over
//! any [`ferry_transport::Channel`]. The server speaks first with a
//! [`Greeting`]; after that the client sends one [`Frame::Command`] at a time
//! and receives exactly one terminal [`Frame::Response`] or [`Frame::Error`].
//!
//! Streamed payloads travel as length-prefixed blocks between the opening
//! response and the terminal frame, ended by a zero-length block. A writer may
//! abandon its stream with the abort marker; a server that fails mid read
//! stream sends the error marker followed by its error frame.
//!
//! Errors raised by the peer keep their [`ferry_types::ErrorKind`] on this side.

pub mod client;
pub mod codec;
pub mod error;
pub mod message;
pub mod server;

pub use client::ProtocolClient;
pub use codec::{Block, FrameCodec};
pub use error::{ProtocolError, ProtocolResult};
pub use message::{
    commands, Frame, Greeting, Param, Params, MAX_BLOCK_SIZE, MAX_FRAME_SIZE, PROTOCOL_NAME,
    PROTOCOL_SERVICE, PROTOCOL_VERSION,
};
pub use server::{CommandHandler, ProtocolServer, ServerSession, SessionEnd};
