//! Byte-oriented duplex channels for ferry.
//!
//! Every remote path in ferry ends in one of these:
//!
//! - [`connect_tcp`]: TCP with a bounded connect timeout and retry with backoff
//! - [`TlsConnector`]: rustls session over that TCP channel, with trust-root
//!   and host-name validation
//! - [`ExecChannel`]: a spawned child process's stdin/stdout (e.g. `ssh host ferry remote`)
//!
//! Reads and writes on network channels go through [`TimeoutStream`], which
//! reports a stalled call as `TimedOut`, distinct from a reset.

pub mod config;
pub mod error;
pub mod exec;
pub mod retry;
pub mod socket;
pub mod timeout;
pub mod tls;

pub use config::{TlsConfig, TransportConfig};
pub use error::{TransportError, TransportResult};
pub use exec::{ExecChannel, ExecProcess};
pub use retry::RetryPolicy;
pub use socket::{connect_tcp, connect_with};
pub use timeout::TimeoutStream;
pub use tls::{TlsConnector, TlsStream};

use tokio::io::{AsyncRead, AsyncWrite};

/// Any duplex byte channel usable by the protocol and HTTP layers.
pub trait Channel: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Channel for T {}

pub type BoxChannel = Box<dyn Channel>;
