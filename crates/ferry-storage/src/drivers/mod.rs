//! Storage drivers, one per backend.

pub mod azure;
pub mod gcs;
pub mod memory;
pub mod object;
pub mod posix;
pub mod remote;
pub mod s3;
pub mod sftp;

pub use azure::{Azure, AzureDriver, AzureKey, DEFAULT_BLOCK_SIZE};
pub use gcs::{Gcs, GcsDriver, DEFAULT_CHUNK_SIZE};
pub use memory::MemoryDriver;
pub use object::{ObjectApi, ObjectDriver};
pub use posix::PosixDriver;
pub use remote::{Connector, ExecConnector, Link, RemoteDriver, TcpConnector};
pub use s3::{S3Credentials, S3Driver, UriStyle, MIN_PART_SIZE, S3};
pub use sftp::{SftpDriver, SftpFs, SftpHandle, SftpStat, Ssh2Fs, SshSettings};
