use ferry_filter::{FilterChain, FilterResults};
use ferry_types::{StorageError, StorageResult};
use tracing::{debug, trace};

use crate::driver::{DriverRead, DriverWrite};

/// Filter result name: plaintext byte count.
pub const RESULT_SIZE: &str = "size";
/// Filter result name: SHA-256 of the plaintext.
pub const RESULT_HASH: &str = "sha256";
/// Filter result name: bytes exchanged with the driver.
pub const RESULT_REPO_SIZE: &str = "repo-size";

/// One open read stream: driver bytes passed through the read filter chain.
///
/// A stream opened with `ignore_missing` on an absent target has no driver
/// and reads as empty; [`StorageRead::exists`] tells the two apart.
pub struct StorageRead {
    path: String,
    driver: Option<Box<dyn DriverRead>>,
    chain: FilterChain,
    exists: bool,
    eof: bool,
}

impl std::fmt::Debug for StorageRead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageRead")
            .field("path", &self.path)
            .field("exists", &self.exists)
            .field("eof", &self.eof)
            .field("filters", &self.chain.names())
            .finish()
    }
}

impl StorageRead {
    pub(crate) fn new(path: String, driver: Option<Box<dyn DriverRead>>, chain: FilterChain) -> Self {
        let exists = driver.is_some();
        Self {
            path,
            driver,
            chain,
            exists,
            eof: !exists,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// False when the target was missing and the stream was opened with
    /// `ignore_missing`.
    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Next chunk of filtered bytes, `None` at end of stream.
    ///
    /// Filters that buffer may consume several driver chunks before producing
    /// output; empty outputs are never returned.
    pub async fn read(&mut self) -> StorageResult<Option<Vec<u8>>> {
        loop {
            if self.eof {
                return Ok(None);
            }
            let Some(driver) = self.driver.as_mut() else {
                self.eof = true;
                return Ok(None);
            };
            let output = match driver.read().await {
                Ok(Some(chunk)) => self.chain.process(&chunk).map_err(|e| self.fail(e.into())),
                Ok(None) => {
                    self.eof = true;
                    let tail = self.chain.finish().map_err(|e| self.fail(e.into()));
                    if let Some(driver) = self.driver.take() {
                        driver.close().await?;
                    }
                    tail
                }
                Err(err) => Err(self.fail(err)),
            }?;
            if !output.is_empty() {
                return Ok(Some(output));
            }
        }
    }

    /// Read to end of stream.
    pub async fn read_all(&mut self) -> StorageResult<Vec<u8>> {
        let mut data = Vec::new();
        while let Some(chunk) = self.read().await? {
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }

    fn fail(&mut self, err: StorageError) -> StorageError {
        self.eof = true;
        self.driver = None;
        err.with_context(format!("unable to read '{}'", self.path))
    }

    /// Filter results so far; complete once the stream reached its end.
    pub fn results(&self) -> FilterResults {
        self.chain.results()
    }

    /// Release the stream, returning its filter results.
    pub async fn close(mut self) -> StorageResult<FilterResults> {
        if let Some(driver) = self.driver.take() {
            driver.close().await?;
        }
        Ok(self.chain.results())
    }
}

/// One open write stream: caller bytes passed through the write filter chain
/// to the driver.
///
/// Nothing is visible at the destination until [`close`](StorageWrite::close)
/// succeeds when the write is atomic. Dropping the stream, or any failed
/// write, discards it.
pub struct StorageWrite {
    path: String,
    driver: Option<Box<dyn DriverWrite>>,
    chain: FilterChain,
}

impl std::fmt::Debug for StorageWrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageWrite")
            .field("path", &self.path)
            .field("open", &self.driver.is_some())
            .field("filters", &self.chain.names())
            .finish()
    }
}

impl StorageWrite {
    pub(crate) fn new(path: String, driver: Box<dyn DriverWrite>, chain: FilterChain) -> Self {
        Self {
            path,
            driver: Some(driver),
            chain,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn closed(&self) -> StorageError {
        StorageError::Io(format!("unable to write '{}': stream is closed", self.path))
    }

    async fn discard(&mut self, err: StorageError) -> StorageError {
        if let Some(driver) = self.driver.take() {
            if let Err(abort) = driver.abort().await {
                debug!(target: "ferry::storage", path = %self.path, error = %abort, "abort after failed write");
            }
        }
        err.with_context(format!("unable to write '{}'", self.path))
    }

    pub async fn write(&mut self, data: &[u8]) -> StorageResult<()> {
        if self.driver.is_none() {
            return Err(self.closed());
        }
        let output = match self.chain.process(data) {
            Ok(output) => output,
            Err(err) => return Err(self.discard(err.into()).await),
        };
        if output.is_empty() {
            return Ok(());
        }
        let result = match self.driver.as_mut() {
            Some(driver) => driver.write(&output).await,
            None => return Err(self.closed()),
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) => Err(self.discard(err).await),
        }
    }

    /// Flush the filter tails and commit the write.
    pub async fn close(mut self) -> StorageResult<FilterResults> {
        let tail = match self.chain.finish() {
            Ok(tail) => tail,
            Err(err) => return Err(self.discard(err.into()).await),
        };
        let Some(mut driver) = self.driver.take() else {
            return Err(self.closed());
        };
        if !tail.is_empty() {
            if let Err(err) = driver.write(&tail).await {
                self.driver = Some(driver);
                return Err(self.discard(err).await);
            }
        }
        driver
            .close()
            .await
            .map_err(|e| e.with_context(format!("unable to close '{}'", self.path)))?;
        let results = self.chain.results();
        trace!(target: "ferry::storage", path = %self.path, ?results, "write closed");
        Ok(results)
    }

    /// Discard everything written so far.
    pub async fn abort(mut self) -> StorageResult<()> {
        match self.driver.take() {
            Some(driver) => driver.abort().await,
            None => Ok(()),
        }
    }
}
