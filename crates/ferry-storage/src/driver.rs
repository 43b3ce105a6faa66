use async_trait::async_trait;
use ferry_types::{CapabilitySet, StorageError, StorageInfo, StorageResult};

/// Default mode for files created without an explicit mode.
pub const DEFAULT_MODE_FILE: u32 = 0o640;
/// Default mode for paths created without an explicit mode.
pub const DEFAULT_MODE_PATH: u32 = 0o750;

/// One storage backend over a root path.
///
/// Every path handed to a driver is absolute and has already been validated
/// by the [`crate::Storage`] facade, which also checks [`capabilities`]
/// before dispatching. Drivers therefore never see a path outside their root
/// or a call they did not declare.
///
/// Operations that most backends lack have default bodies that fail with
/// `CapabilityUnsupported`.
///
/// [`capabilities`]: StorageDriver::capabilities
#[async_trait]
pub trait StorageDriver: Send + Sync + std::fmt::Debug {
    /// Short backend name used in messages ("posix", "s3", ...).
    fn name(&self) -> &'static str;

    /// Absolute root path every operation is confined to.
    fn root(&self) -> &str;

    fn capabilities(&self) -> CapabilitySet;

    /// Metadata of `path`; a missing path yields [`StorageInfo::missing`].
    async fn info(&self, path: &str, follow_links: bool) -> StorageResult<StorageInfo>;

    /// Entries directly below `path`, in no particular order.
    ///
    /// A missing `path` fails with `NotFound` where the backend can tell.
    async fn list(&self, path: &str) -> StorageResult<Vec<StorageInfo>>;

    /// Open `path` for reading; `None` when it is missing and
    /// `options.ignore_missing` is set.
    async fn open_read(
        &self,
        path: &str,
        options: &ReadOptions,
    ) -> StorageResult<Option<Box<dyn DriverRead>>>;

    async fn open_write(&self, path: &str, options: &WriteOptions)
        -> StorageResult<Box<dyn DriverWrite>>;

    async fn remove(&self, path: &str, error_on_missing: bool) -> StorageResult<()>;

    async fn path_create(&self, path: &str, _options: &PathCreateOptions) -> StorageResult<()> {
        Err(unsupported(self.name(), "create path", path))
    }

    /// Remove a path; a missing path is not an error.
    async fn path_remove(&self, path: &str, _recurse: bool) -> StorageResult<()> {
        Err(unsupported(self.name(), "remove path", path))
    }

    async fn path_sync(&self, path: &str) -> StorageResult<()> {
        Err(unsupported(self.name(), "sync path", path))
    }

    /// Release pooled connections and peer processes. The driver stays
    /// usable and reconnects on demand.
    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}

fn unsupported(driver: &str, action: &str, path: &str) -> StorageError {
    StorageError::CapabilityUnsupported(format!("{driver} driver cannot {action} '{path}'"))
}

/// Raw byte source of one open read stream.
#[async_trait]
pub trait DriverRead: Send {
    /// Next chunk of bytes, `None` at end of stream.
    async fn read(&mut self) -> StorageResult<Option<Vec<u8>>>;

    /// Release the underlying resource. Dropping without `close` also
    /// releases it, without reporting errors.
    async fn close(self: Box<Self>) -> StorageResult<()>;
}

/// Raw byte sink of one open write stream.
///
/// Dropping a writer without calling [`close`](DriverWrite::close) discards
/// the write: an atomic destination never becomes visible.
#[async_trait]
pub trait DriverWrite: Send {
    async fn write(&mut self, data: &[u8]) -> StorageResult<()>;

    /// Commit the write, making it visible at its final name.
    async fn close(self: Box<Self>) -> StorageResult<()>;

    /// Discard the write.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadOptions {
    pub ignore_missing: bool,
    pub offset: u64,
    pub limit: Option<u64>,
    /// False for content stored without compression; skips decompression.
    pub compressible: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            ignore_missing: false,
            offset: 0,
            limit: None,
            compressible: true,
        }
    }
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incompressible(mut self) -> Self {
        self.compressible = false;
        self
    }

    pub fn ignore_missing(mut self) -> Self {
        self.ignore_missing = true;
        self
    }

    pub fn range(mut self, offset: u64, limit: Option<u64>) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }
}

/// Options of one write stream, every field with its default.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteOptions {
    /// File mode; the driver default when `None`.
    pub mode: Option<u32>,
    pub user: Option<String>,
    pub group: Option<String>,
    /// Modification time to set on close, seconds since the epoch.
    pub time_modified: Option<i64>,
    pub create_parent_paths: bool,
    pub sync_file: bool,
    pub sync_path: bool,
    /// Write under a temporary name and rename into place on close.
    pub atomic: bool,
    /// False for content that is already compressed; skips compression.
    pub compressible: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            mode: None,
            user: None,
            group: None,
            time_modified: None,
            create_parent_paths: true,
            sync_file: true,
            sync_path: true,
            atomic: true,
            compressible: true,
        }
    }
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn owner(mut self, user: Option<String>, group: Option<String>) -> Self {
        self.user = user;
        self.group = group;
        self
    }

    pub fn time_modified(mut self, time: i64) -> Self {
        self.time_modified = Some(time);
        self
    }

    /// No syncs and no atomic rename: for scratch files.
    pub fn fast(mut self) -> Self {
        self.sync_file = false;
        self.sync_path = false;
        self.atomic = false;
        self
    }

    pub fn no_parent_paths(mut self) -> Self {
        self.create_parent_paths = false;
        self
    }

    pub fn incompressible(mut self) -> Self {
        self.compressible = false;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathCreateOptions {
    pub mode: Option<u32>,
    pub error_on_exists: bool,
    /// Create missing parents too.
    pub recurse: bool,
}

impl Default for PathCreateOptions {
    fn default() -> Self {
        Self {
            mode: None,
            error_on_exists: false,
            recurse: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_defaults_are_durable() {
        let options = WriteOptions::default();
        assert!(options.atomic && options.sync_file && options.sync_path);
        assert!(options.create_parent_paths && options.compressible);

        let scratch = WriteOptions::new().fast().incompressible();
        assert!(!scratch.atomic && !scratch.sync_file && !scratch.compressible);
    }

    #[test]
    fn read_range() {
        let options = ReadOptions::new().ignore_missing().range(10, Some(5));
        assert!(options.ignore_missing);
        assert_eq!((options.offset, options.limit), (10, Some(5)));
    }
}
