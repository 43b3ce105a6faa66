//! Foundation types for ferry.
//!
//! Every other ferry crate depends on `ferry-types`. It holds the pieces that
//! must look identical on both sides of a process boundary: the error taxonomy,
//! the metadata snapshot of a path, and the capability set a driver declares.
//!
//! # Key Types
//!
//! - [`StorageError`] -- one variant per error kind; survives the remote protocol
//! - [`ErrorKind`] -- serializable discriminant used on the wire
//! - [`StorageInfo`] -- point-in-time metadata of a file, path, link, or object
//! - [`CapabilitySet`] -- the fixed set of operations a driver supports

pub mod capability;
pub mod error;
pub mod info;

pub use capability::{Capability, CapabilitySet};
pub use error::{ErrorKind, StorageError, StorageResult};
pub use info::{StorageInfo, StorageType};
