use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use ferry_types::{CapabilitySet, StorageError, StorageInfo, StorageResult};

use crate::driver::{
    DriverRead, DriverWrite, PathCreateOptions, ReadOptions, StorageDriver, WriteOptions,
    DEFAULT_MODE_FILE, DEFAULT_MODE_PATH,
};
use crate::path;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Entry {
    File {
        data: Vec<u8>,
        mode: u32,
        time_modified: i64,
        user: Option<String>,
        group: Option<String>,
    },
    Path {
        mode: u32,
    },
}

type Entries = Arc<RwLock<BTreeMap<String, Entry>>>;

fn read_lock(entries: &Entries) -> RwLockReadGuard<'_, BTreeMap<String, Entry>> {
    entries.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock(entries: &Entries) -> RwLockWriteGuard<'_, BTreeMap<String, Entry>> {
    entries.write().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory driver for tests and embedding.
///
/// Paths exist explicitly (created with `path_create`) or implicitly (a
/// parent of any stored file). Writes become visible only on close. The
/// capability set is configurable, and writes can be made to fail after a
/// given number of bytes to exercise interrupted transfers.
pub struct MemoryDriver {
    root: String,
    capabilities: CapabilitySet,
    entries: Entries,
    calls: AtomicU64,
    fail_after: Option<u64>,
}

impl MemoryDriver {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            capabilities: CapabilitySet::all(),
            entries: Arc::new(RwLock::new(BTreeMap::new())),
            calls: AtomicU64::new(0),
            fail_after: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Make every write stream fail once it has been given more than `bytes`.
    pub fn fail_writes_after(mut self, bytes: u64) -> Self {
        self.fail_after = Some(bytes);
        self
    }

    /// Number of driver operations invoked so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of stored files.
    pub fn len(&self) -> usize {
        read_lock(&self.entries)
            .values()
            .filter(|entry| matches!(entry, Entry::File { .. }))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes across all stored files.
    pub fn total_bytes(&self) -> u64 {
        read_lock(&self.entries)
            .values()
            .map(|entry| match entry {
                Entry::File { data, .. } => data.len() as u64,
                Entry::Path { .. } => 0,
            })
            .sum()
    }

    /// Sorted list of every stored file and explicit path.
    pub fn paths(&self) -> Vec<String> {
        read_lock(&self.entries).keys().cloned().collect()
    }

    /// Stored bytes of a file, as written by the last committed stream.
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        match read_lock(&self.entries).get(path) {
            Some(Entry::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    fn count(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn is_path(&self, map: &BTreeMap<String, Entry>, path: &str) -> bool {
        if path == self.root || path == "/" {
            return true;
        }
        if matches!(map.get(path), Some(Entry::Path { .. })) {
            return true;
        }
        let prefix = format!("{path}/");
        map.range(prefix.clone()..)
            .next()
            .is_some_and(|(key, _)| key.starts_with(&prefix))
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new("/")
    }
}

impl std::fmt::Debug for MemoryDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDriver")
            .field("root", &self.root)
            .field("capabilities", &self.capabilities)
            .field("file_count", &self.len())
            .finish()
    }
}

fn entry_info(name: &str, entry: &Entry) -> StorageInfo {
    match entry {
        Entry::File {
            data,
            mode,
            time_modified,
            user,
            group,
        } => {
            let mut info = StorageInfo::file(data.len() as u64, *time_modified).with_name(name);
            info.mode = Some(*mode);
            info.user = user.clone();
            info.group = group.clone();
            info
        }
        Entry::Path { mode } => {
            let mut info = StorageInfo::path().with_name(name);
            info.mode = Some(*mode);
            info
        }
    }
}

#[async_trait]
impl StorageDriver for MemoryDriver {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn root(&self) -> &str {
        &self.root
    }

    fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    async fn info(&self, path: &str, _follow_links: bool) -> StorageResult<StorageInfo> {
        self.count();
        let map = read_lock(&self.entries);
        Ok(match map.get(path) {
            Some(entry) => entry_info("", entry),
            None if self.is_path(&map, path) => StorageInfo::path(),
            None => StorageInfo::missing(),
        })
    }

    async fn list(&self, path: &str) -> StorageResult<Vec<StorageInfo>> {
        self.count();
        let map = read_lock(&self.entries);
        if !self.is_path(&map, path) {
            return Err(StorageError::NotFound(format!(
                "unable to list files for missing path '{path}'"
            )));
        }
        let prefix = if path == "/" { "/".to_string() } else { format!("{path}/") };
        let mut entries: BTreeMap<String, StorageInfo> = BTreeMap::new();
        for (key, entry) in map.range(prefix.clone()..) {
            let Some(rest) = key.strip_prefix(&prefix) else {
                break;
            };
            match rest.split_once('/') {
                Some((child, _)) => {
                    entries
                        .entry(child.to_string())
                        .or_insert_with(|| StorageInfo::path().with_name(child));
                }
                None => {
                    entries.insert(rest.to_string(), entry_info(rest, entry));
                }
            }
        }
        Ok(entries.into_values().collect())
    }

    async fn open_read(
        &self,
        path: &str,
        options: &ReadOptions,
    ) -> StorageResult<Option<Box<dyn DriverRead>>> {
        self.count();
        let map = read_lock(&self.entries);
        let data = match map.get(path) {
            Some(Entry::File { data, .. }) => data,
            _ if options.ignore_missing => return Ok(None),
            _ => {
                return Err(StorageError::NotFound(format!(
                    "unable to open missing file '{path}' for read"
                )))
            }
        };
        let start = (options.offset as usize).min(data.len());
        let end = match options.limit {
            Some(limit) => start.saturating_add(limit as usize).min(data.len()),
            None => data.len(),
        };
        Ok(Some(Box::new(MemoryRead {
            data: data[start..end].to_vec(),
            position: 0,
        })))
    }

    async fn open_write(
        &self,
        path: &str,
        options: &WriteOptions,
    ) -> StorageResult<Box<dyn DriverWrite>> {
        self.count();
        if !options.create_parent_paths {
            let map = read_lock(&self.entries);
            if let Some(parent) = path::parent(path) {
                if !self.is_path(&map, parent) {
                    return Err(StorageError::NotFound(format!(
                        "unable to open file '{path}' for write: missing parent path"
                    )));
                }
            }
        }
        Ok(Box::new(MemoryWrite {
            entries: Arc::clone(&self.entries),
            path: path.to_string(),
            buffer: Vec::new(),
            options: options.clone(),
            fail_after: self.fail_after,
        }))
    }

    async fn remove(&self, path: &str, error_on_missing: bool) -> StorageResult<()> {
        self.count();
        let mut map = write_lock(&self.entries);
        match map.get(path) {
            Some(Entry::File { .. }) => {
                map.remove(path);
                Ok(())
            }
            _ if error_on_missing => Err(StorageError::NotFound(format!(
                "unable to remove missing file '{path}'"
            ))),
            _ => Ok(()),
        }
    }

    async fn path_create(&self, path: &str, options: &PathCreateOptions) -> StorageResult<()> {
        self.count();
        let mut map = write_lock(&self.entries);
        if self.is_path(&map, path) {
            if options.error_on_exists {
                return Err(StorageError::AlreadyExists(format!(
                    "unable to create path '{path}': already exists"
                )));
            }
            return Ok(());
        }
        if !options.recurse {
            if let Some(parent) = path::parent(path) {
                if !self.is_path(&map, parent) {
                    return Err(StorageError::NotFound(format!(
                        "unable to create path '{path}': missing parent"
                    )));
                }
            }
        }
        map.insert(
            path.to_string(),
            Entry::Path {
                mode: options.mode.unwrap_or(DEFAULT_MODE_PATH),
            },
        );
        Ok(())
    }

    async fn path_remove(&self, path: &str, recurse: bool) -> StorageResult<()> {
        self.count();
        let mut map = write_lock(&self.entries);
        let prefix = format!("{path}/");
        let children: Vec<String> = map
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| key.clone())
            .collect();
        if !children.is_empty() && !recurse {
            return Err(StorageError::Io(format!(
                "unable to remove path '{path}': path is not empty"
            )));
        }
        for child in children {
            map.remove(&child);
        }
        map.remove(path);
        Ok(())
    }

    async fn path_sync(&self, _path: &str) -> StorageResult<()> {
        self.count();
        Ok(())
    }
}

struct MemoryRead {
    data: Vec<u8>,
    position: usize,
}

#[async_trait]
impl DriverRead for MemoryRead {
    async fn read(&mut self) -> StorageResult<Option<Vec<u8>>> {
        if self.position >= self.data.len() {
            return Ok(None);
        }
        let end = (self.position + CHUNK_SIZE).min(self.data.len());
        let chunk = self.data[self.position..end].to_vec();
        self.position = end;
        Ok(Some(chunk))
    }

    async fn close(self: Box<Self>) -> StorageResult<()> {
        Ok(())
    }
}

struct MemoryWrite {
    entries: Entries,
    path: String,
    buffer: Vec<u8>,
    options: WriteOptions,
    fail_after: Option<u64>,
}

#[async_trait]
impl DriverWrite for MemoryWrite {
    async fn write(&mut self, data: &[u8]) -> StorageResult<()> {
        if let Some(limit) = self.fail_after {
            if (self.buffer.len() + data.len()) as u64 > limit {
                return Err(StorageError::Io(format!(
                    "unable to write '{}': injected failure after {limit} bytes",
                    self.path
                )));
            }
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    async fn close(self: Box<Self>) -> StorageResult<()> {
        let this = *self;
        let entry = Entry::File {
            data: this.buffer,
            mode: this.options.mode.unwrap_or(DEFAULT_MODE_FILE),
            time_modified: this
                .options
                .time_modified
                .unwrap_or_else(|| chrono::Utc::now().timestamp()),
            user: this.options.user,
            group: this.options.group,
        };
        write_lock(&this.entries).insert(this.path, entry);
        Ok(())
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn put(driver: &MemoryDriver, path: &str, data: &[u8]) {
        let mut write = driver.open_write(path, &WriteOptions::default()).await.unwrap();
        write.write(data).await.unwrap();
        write.close().await.unwrap();
    }

    async fn get(driver: &MemoryDriver, path: &str, options: ReadOptions) -> Option<Vec<u8>> {
        let mut read = driver.open_read(path, &options).await.unwrap()?;
        let mut data = Vec::new();
        while let Some(chunk) = read.read().await.unwrap() {
            data.extend(chunk);
        }
        Some(data)
    }

    #[tokio::test]
    async fn write_visible_only_after_close() {
        let driver = MemoryDriver::new("/repo");
        let mut write = driver.open_write("/repo/a/file", &WriteOptions::default()).await.unwrap();
        write.write(b"hello").await.unwrap();
        assert!(!driver.info("/repo/a/file", true).await.unwrap().exists());
        write.close().await.unwrap();

        let info = driver.info("/repo/a/file", true).await.unwrap();
        assert!(info.is_file());
        assert_eq!(info.size, 5);
        assert!(driver.info("/repo/a", true).await.unwrap().is_path());
    }

    #[tokio::test]
    async fn dropped_write_leaves_nothing() {
        let driver = MemoryDriver::new("/repo");
        let mut write = driver.open_write("/repo/file", &WriteOptions::default()).await.unwrap();
        write.write(b"partial").await.unwrap();
        drop(write);
        assert!(driver.is_empty());
    }

    #[tokio::test]
    async fn injected_failure() {
        let driver = MemoryDriver::new("/repo").fail_writes_after(4);
        let mut write = driver.open_write("/repo/file", &WriteOptions::default()).await.unwrap();
        write.write(b"1234").await.unwrap();
        let err = write.write(b"5").await.unwrap_err();
        assert_eq!(err.kind(), ferry_types::ErrorKind::Io);
    }

    #[tokio::test]
    async fn ranged_and_missing_reads() {
        let driver = MemoryDriver::new("/repo");
        put(&driver, "/repo/f", b"0123456789").await;
        assert_eq!(get(&driver, "/repo/f", ReadOptions::new().range(2, Some(3))).await.unwrap(), b"234");
        assert_eq!(get(&driver, "/repo/f", ReadOptions::new().range(8, None)).await.unwrap(), b"89");
        assert!(get(&driver, "/repo/none", ReadOptions::new().ignore_missing()).await.is_none());
        let err = driver.open_read("/repo/none", &ReadOptions::new()).await.err().unwrap();
        assert_eq!(err.kind(), ferry_types::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn list_collapses_nested_paths() {
        let driver = MemoryDriver::new("/repo");
        put(&driver, "/repo/b/one", b"1").await;
        put(&driver, "/repo/b/two/three", b"3").await;
        put(&driver, "/repo/a", b"a").await;
        put(&driver, "/repository", b"x").await;

        let names: Vec<_> = driver.list("/repo").await.unwrap().into_iter().map(|i| (i.name, i.kind)).collect();
        assert_eq!(
            names,
            vec![
                ("a".to_string(), ferry_types::StorageType::File),
                ("b".to_string(), ferry_types::StorageType::Path)
            ]
        );
        assert_eq!(driver.list("/repo/b").await.unwrap().len(), 2);
        assert!(driver.list("/repo/none").await.is_err());
    }

    #[tokio::test]
    async fn path_lifecycle() {
        let driver = MemoryDriver::new("/repo");
        let options = PathCreateOptions {
            error_on_exists: true,
            ..Default::default()
        };
        driver.path_create("/repo/p", &options).await.unwrap();
        let err = driver.path_create("/repo/p", &options).await.unwrap_err();
        assert_eq!(err.kind(), ferry_types::ErrorKind::AlreadyExists);

        put(&driver, "/repo/p/f", b"x").await;
        assert!(driver.path_remove("/repo/p", false).await.is_err());
        driver.path_remove("/repo/p", true).await.unwrap();
        assert!(driver.paths().is_empty());
    }

    #[tokio::test]
    async fn remove_missing() {
        let driver = MemoryDriver::new("/repo");
        driver.remove("/repo/none", false).await.unwrap();
        let err = driver.remove("/repo/none", true).await.unwrap_err();
        assert_eq!(err.kind(), ferry_types::ErrorKind::NotFound);
        assert_eq!(driver.calls(), 2);
    }
}
