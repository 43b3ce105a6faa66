//! Storage facade and drivers for ferry.
//!
//! Every upper layer talks to a repository through [`Storage`]: it resolves
//! and validates paths, checks the driver's capability set, and wraps each
//! stream in the filter chain (compression, encryption, hashing). Drivers
//! only move raw bytes.
//!
//! # Drivers
//!
//! - [`PosixDriver`] -- local filesystem with atomic temp-file writes
//! - [`S3Driver`], [`AzureDriver`], [`GcsDriver`] -- object stores over HTTPS
//! - [`SftpDriver`] -- a directory on an SFTP server
//! - [`RemoteDriver`] -- a peer's storage over the ferry protocol
//! - [`MemoryDriver`] -- in-memory, for tests and embedding
//!
//! # Rules
//!
//! 1. No path outside the storage root reaches a driver.
//! 2. An unsupported operation fails before the driver is called.
//! 3. Atomic writes are invisible at their final name until closed.
//! 4. Errors keep their kind across drivers and the remote protocol.

pub mod config;
pub mod context;
pub mod driver;
pub mod drivers;
pub mod path;
pub mod server;
pub mod storage;
pub mod stream;
pub mod wire;

pub use config::{DriverConfig, FerryConfig, RepoConfig, Secret};
pub use context::StorageContext;
pub use driver::{DriverRead, DriverWrite, PathCreateOptions, ReadOptions, StorageDriver, WriteOptions};
pub use drivers::{
    AzureDriver, GcsDriver, MemoryDriver, ObjectApi, ObjectDriver, PosixDriver, RemoteDriver,
    S3Driver, SftpDriver,
};
pub use path::{ExpressionMap, PathExpression};
pub use server::StorageHandler;
pub use storage::{ListOptions, Storage};
pub use stream::{StorageRead, StorageWrite, RESULT_HASH, RESULT_REPO_SIZE, RESULT_SIZE};
