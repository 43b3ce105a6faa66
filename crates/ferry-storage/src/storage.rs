use std::sync::Arc;
use std::time::Duration;

use ferry_filter::{
    CipherBlock, Compress, CompressType, Decompress, FilterChain, FilterResults, HashFilter,
    SizeFilter,
};
use ferry_types::{Capability, CapabilitySet, StorageError, StorageInfo, StorageResult, StorageType};
use regex::Regex;
use tracing::debug;
use zeroize::Zeroizing;

use crate::driver::{PathCreateOptions, ReadOptions, StorageDriver, WriteOptions};
use crate::path::{self, PathExpression};
use crate::stream::{StorageRead, StorageWrite, RESULT_HASH, RESULT_REPO_SIZE, RESULT_SIZE};

/// Options for [`Storage::info_list`].
#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    /// Regular expression the entry name must match.
    pub pattern: Option<String>,
    /// Descend into paths; nested names are relative to the listed path.
    pub recurse: bool,
    /// Fail with `NotFound` instead of returning an empty list.
    pub error_on_missing: bool,
}

impl ListOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn recurse(mut self) -> Self {
        self.recurse = true;
        self
    }

    pub fn error_on_missing(mut self) -> Self {
        self.error_on_missing = true;
        self
    }
}

/// The single entry point to a configured repository or location.
///
/// Every path is resolved and validated here before it reaches the driver,
/// every call is checked against the driver's capability set, and every
/// stream gets its filter chain assembled here: compress then encrypt on
/// write, decrypt then decompress on read.
///
/// `Storage` is immutable once built and cheap to clone.
#[derive(Clone)]
pub struct Storage {
    driver: Arc<dyn StorageDriver>,
    writable: bool,
    expression: Option<Arc<dyn PathExpression>>,
    compress: CompressType,
    compress_level: i32,
    cipher_pass: Option<Arc<Zeroizing<String>>>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("driver", &self.driver.name())
            .field("root", &self.driver.root())
            .field("writable", &self.writable)
            .field("compress", &self.compress)
            .field("encrypted", &self.cipher_pass.is_some())
            .finish()
    }
}

const EXISTS_WAIT_POLL: Duration = Duration::from_millis(100);

impl Storage {
    /// Read-only storage over `driver`.
    pub fn new(driver: Arc<dyn StorageDriver>) -> Self {
        Self {
            driver,
            writable: false,
            expression: None,
            compress: CompressType::None,
            compress_level: ferry_filter::DEFAULT_LEVEL,
            cipher_pass: None,
        }
    }

    pub fn writable(mut self) -> Self {
        self.writable = true;
        self
    }

    pub fn with_expression(mut self, expression: Arc<dyn PathExpression>) -> Self {
        self.expression = Some(expression);
        self
    }

    pub fn with_compress(mut self, compress: CompressType, level: i32) -> Self {
        self.compress = compress;
        self.compress_level = level;
        self
    }

    pub fn with_cipher(mut self, passphrase: impl Into<String>) -> Self {
        self.cipher_pass = Some(Arc::new(Zeroizing::new(passphrase.into())));
        self
    }

    pub fn root(&self) -> &str {
        self.driver.root()
    }

    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.driver.capabilities()
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Release the driver's pooled connections and peer processes.
    pub async fn close(&self) -> StorageResult<()> {
        self.driver.close().await
    }

    /// Absolute path for a caller path, after expression expansion and
    /// validation.
    pub fn path_of(&self, path: &str) -> StorageResult<String> {
        path::resolve(self.driver.root(), path, self.expression.as_deref())
    }

    fn require(&self, capability: Capability, path: &str) -> StorageResult<()> {
        let mutating = matches!(
            capability,
            Capability::Write
                | Capability::Remove
                | Capability::PathCreate
                | Capability::PathRemove
                | Capability::PathSync
        );
        if mutating && !self.writable {
            return Err(StorageError::ReadOnly(format!(
                "unable to {capability} '{path}': storage is read-only"
            )));
        }
        if !self.driver.capabilities().contains(capability) {
            return Err(StorageError::CapabilityUnsupported(format!(
                "unable to {capability} '{path}': {} driver does not support {capability}",
                self.driver.name()
            )));
        }
        Ok(())
    }

    /// Resolve `path` and check `capability` before anything reaches the driver.
    fn prepare(&self, capability: Capability, path: &str) -> StorageResult<String> {
        let resolved = self.path_of(path)?;
        self.require(capability, &resolved)?;
        Ok(resolved)
    }

    // -----------------------------------------------------------------------
    // Metadata
    // -----------------------------------------------------------------------

    /// Metadata of `path`, `NotFound` when it is missing.
    pub async fn info(&self, path: &str, follow_links: bool) -> StorageResult<StorageInfo> {
        let resolved = self.prepare(Capability::Info, path)?;
        let info = self.driver.info(&resolved, follow_links).await?;
        if !info.exists() {
            return Err(StorageError::NotFound(format!(
                "unable to get info for missing path/file '{resolved}'"
            )));
        }
        Ok(info)
    }

    /// Metadata of `path`, or a missing entry.
    pub async fn info_ignore_missing(&self, path: &str, follow_links: bool) -> StorageResult<StorageInfo> {
        let resolved = self.prepare(Capability::Info, path)?;
        self.driver.info(&resolved, follow_links).await
    }

    /// True when `path` is a file.
    pub async fn exists(&self, path: &str) -> StorageResult<bool> {
        Ok(self.info_ignore_missing(path, true).await?.is_file())
    }

    /// True when `path` is a path (directory or object prefix).
    pub async fn path_exists(&self, path: &str) -> StorageResult<bool> {
        Ok(self.info_ignore_missing(path, true).await?.is_path())
    }

    /// Poll [`exists`](Storage::exists) until the file appears or `timeout`
    /// elapses.
    pub async fn exists_wait(&self, path: &str, timeout: Duration) -> StorageResult<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.exists(path).await? {
                return Ok(true);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(EXISTS_WAIT_POLL.min(deadline - now)).await;
        }
    }

    /// Sorted entry names below `path`, optionally filtered by a regular expression.
    pub async fn list(&self, path: &str, pattern: Option<&str>) -> StorageResult<Vec<String>> {
        let options = ListOptions {
            pattern: pattern.map(str::to_string),
            ..ListOptions::default()
        };
        Ok(self
            .info_list(path, &options)
            .await?
            .into_iter()
            .map(|info| info.name)
            .collect())
    }

    /// Entries below `path` with their metadata, sorted by name.
    pub async fn info_list(&self, path: &str, options: &ListOptions) -> StorageResult<Vec<StorageInfo>> {
        let resolved = self.prepare(Capability::List, path)?;
        let pattern = options
            .pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| StorageError::Config(format!("invalid list expression: {e}")))?;

        let mut entries = match self.driver.list(&resolved).await {
            Ok(entries) => entries,
            Err(StorageError::NotFound(_)) if !options.error_on_missing => Vec::new(),
            Err(err) => return Err(err),
        };

        if options.recurse {
            let mut pending: Vec<String> = entries
                .iter()
                .filter(|info| info.kind == StorageType::Path)
                .map(|info| info.name.clone())
                .collect();
            while let Some(relative) = pending.pop() {
                let children = match self.driver.list(&path::join(&resolved, &relative)).await {
                    Ok(children) => children,
                    Err(StorageError::NotFound(_)) => continue,
                    Err(err) => return Err(err),
                };
                for mut child in children {
                    child.name = format!("{relative}/{}", child.name);
                    if child.kind == StorageType::Path {
                        pending.push(child.name.clone());
                    }
                    entries.push(child);
                }
            }
        }

        if let Some(pattern) = &pattern {
            entries.retain(|info| pattern.is_match(&info.name));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    // -----------------------------------------------------------------------
    // Streams
    // -----------------------------------------------------------------------

    fn read_chain(&self, options: &ReadOptions) -> StorageResult<FilterChain> {
        let mut chain = FilterChain::new().with(SizeFilter::new(RESULT_REPO_SIZE));
        if let Some(pass) = &self.cipher_pass {
            chain.push(CipherBlock::decrypt(pass.as_bytes())?);
        }
        if options.compressible && self.compress != CompressType::None {
            chain.push(Decompress::new(self.compress)?);
        }
        chain.push(SizeFilter::new(RESULT_SIZE));
        chain.push(HashFilter::sha256(RESULT_HASH));
        Ok(chain)
    }

    fn write_chain(&self, options: &WriteOptions) -> StorageResult<FilterChain> {
        let mut chain = FilterChain::new()
            .with(SizeFilter::new(RESULT_SIZE))
            .with(HashFilter::sha256(RESULT_HASH));
        if options.compressible && self.compress != CompressType::None {
            chain.push(Compress::new(self.compress, self.compress_level)?);
        }
        if let Some(pass) = &self.cipher_pass {
            chain.push(CipherBlock::encrypt(pass.as_bytes())?);
        }
        chain.push(SizeFilter::new(RESULT_REPO_SIZE));
        Ok(chain)
    }

    pub async fn open_read(&self, path: &str, options: ReadOptions) -> StorageResult<StorageRead> {
        let resolved = self.prepare(Capability::Read, path)?;
        let chain = self.read_chain(&options)?;
        let driver = self.driver.open_read(&resolved, &options).await?;
        debug!(
            target: "ferry::storage",
            driver = self.driver.name(),
            path = %resolved,
            exists = driver.is_some(),
            offset = options.offset,
            limit = ?options.limit,
            "open read"
        );
        Ok(StorageRead::new(resolved, driver, chain))
    }

    pub async fn open_write(&self, path: &str, options: WriteOptions) -> StorageResult<StorageWrite> {
        let resolved = self.prepare(Capability::Write, path)?;
        let chain = self.write_chain(&options)?;
        let driver = self.driver.open_write(&resolved, &options).await?;
        debug!(
            target: "ferry::storage",
            driver = self.driver.name(),
            path = %resolved,
            atomic = options.atomic,
            "open write"
        );
        Ok(StorageWrite::new(resolved, driver, chain))
    }

    /// Whole content of `path`; `None` when missing and `ignore_missing` is set.
    pub async fn get(&self, path: &str, ignore_missing: bool) -> StorageResult<Option<Vec<u8>>> {
        let mut options = ReadOptions::new();
        options.ignore_missing = ignore_missing;
        let mut read = self.open_read(path, options).await?;
        if !read.exists() {
            return Ok(None);
        }
        let data = read.read_all().await?;
        read.close().await?;
        Ok(Some(data))
    }

    /// Write `data` to `path` with default options.
    pub async fn put(&self, path: &str, data: &[u8]) -> StorageResult<FilterResults> {
        let mut write = self.open_write(path, WriteOptions::default()).await?;
        write.write(data).await?;
        write.close().await
    }

    /// Stream `source` into `destination`; false (and nothing written) when
    /// the source was missing.
    pub async fn copy(mut source: StorageRead, mut destination: StorageWrite) -> StorageResult<bool> {
        if !source.exists() {
            destination.abort().await?;
            return Ok(false);
        }
        while let Some(chunk) = source.read().await? {
            destination.write(&chunk).await?;
        }
        source.close().await?;
        destination.close().await?;
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    pub async fn remove(&self, path: &str, error_on_missing: bool) -> StorageResult<()> {
        let resolved = self.prepare(Capability::Remove, path)?;
        debug!(target: "ferry::storage", driver = self.driver.name(), path = %resolved, "remove");
        self.driver.remove(&resolved, error_on_missing).await
    }

    pub async fn path_create(&self, path: &str, options: PathCreateOptions) -> StorageResult<()> {
        let resolved = self.prepare(Capability::PathCreate, path)?;
        debug!(target: "ferry::storage", driver = self.driver.name(), path = %resolved, "path create");
        self.driver.path_create(&resolved, &options).await
    }

    pub async fn path_remove(&self, path: &str, recurse: bool) -> StorageResult<()> {
        let resolved = self.prepare(Capability::PathRemove, path)?;
        debug!(target: "ferry::storage", driver = self.driver.name(), path = %resolved, recurse, "path remove");
        self.driver.path_remove(&resolved, recurse).await
    }

    pub async fn path_sync(&self, path: &str) -> StorageResult<()> {
        let resolved = self.prepare(Capability::PathSync, path)?;
        self.driver.path_sync(&resolved).await
    }
}
