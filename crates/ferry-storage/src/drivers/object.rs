use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use ferry_http::HttpResponse;
use ferry_types::{CapabilitySet, StorageError, StorageInfo, StorageResult};
use tracing::{debug, warn};

use crate::driver::{DriverRead, DriverWrite, ReadOptions, StorageDriver, WriteOptions};

/// Largest ranged GET issued by one read call.
pub const READ_CHUNK: u64 = 4 * 1024 * 1024;

/// One page of a bucket listing. Names are full keys.
#[derive(Clone, Debug, Default)]
pub struct ListPage {
    pub objects: Vec<StorageInfo>,
    /// Common prefixes, each ending in `/`.
    pub prefixes: Vec<String>,
    /// Continuation token for the next page.
    pub next: Option<String>,
}

/// Bytes of one ranged GET and the object size when the provider reported it.
#[derive(Clone, Debug, Default)]
pub struct RangeChunk {
    pub data: Bytes,
    pub total: Option<u64>,
}

/// An in-progress multipart (or block, or resumable) upload.
#[derive(Clone, Debug)]
pub struct Upload {
    pub key: String,
    /// Provider upload id; empty where the provider has none.
    pub id: String,
    /// Per-part tag needed by the commit (ETag, block id).
    pub parts: Vec<String>,
    /// Bytes uploaded so far.
    pub offset: u64,
}

impl Upload {
    pub fn new(key: &str, id: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            id: id.into(),
            parts: Vec::new(),
            offset: 0,
        }
    }
}

/// Provider-specific half of an object-store driver: one signed request
/// per method. [`ObjectDriver`] builds the storage semantics on top.
#[async_trait]
pub trait ObjectApi: Send + Sync + std::fmt::Debug + 'static {
    fn name(&self) -> &'static str;

    /// Buffer size at which a write switches to a multipart upload.
    fn part_size(&self) -> usize;

    async fn head(&self, key: &str) -> StorageResult<Option<StorageInfo>>;

    /// `length` bytes from `start`; `None` when the object is missing.
    async fn get_range(&self, key: &str, start: u64, length: u64) -> StorageResult<Option<RangeChunk>>;

    /// One listing page under `prefix`; with `recurse` unset, keys below
    /// the next `/` are rolled up into prefixes.
    async fn list_page(&self, prefix: &str, recurse: bool, token: Option<&str>) -> StorageResult<ListPage>;

    async fn put(&self, key: &str, body: Bytes) -> StorageResult<()>;

    /// Delete one object; a missing object is not an error.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    async fn upload_begin(&self, key: &str) -> StorageResult<Upload>;

    /// Upload the next part. `last` marks the final part, which may be empty.
    async fn upload_part(&self, upload: &mut Upload, body: Bytes, last: bool) -> StorageResult<()>;

    async fn upload_complete(&self, upload: &Upload) -> StorageResult<()>;

    async fn upload_abort(&self, upload: &Upload) -> StorageResult<()>;

    /// Release idle connections to the service.
    async fn close(&self) {}
}

/// `Range` header value for `length` bytes from `start`.
pub fn range_header(start: u64, length: u64) -> String {
    format!("bytes={}-{}", start, start + length.max(1) - 1)
}

/// Interpret the response to a ranged GET.
pub fn range_response(response: HttpResponse, start: u64, context: &str) -> StorageResult<Option<RangeChunk>> {
    match response.status {
        404 => Ok(None),
        // range starts at or past the end, including any read of an empty object
        416 => Ok(Some(RangeChunk::default())),
        206 => {
            let total = response
                .header("content-range")
                .and_then(|range| range.rsplit_once('/'))
                .and_then(|(_, total)| total.parse().ok());
            Ok(Some(RangeChunk {
                data: response.body,
                total,
            }))
        }
        200 => {
            // provider ignored the range and sent the whole object
            let total = response.body.len() as u64;
            let from = start.min(total) as usize;
            Ok(Some(RangeChunk {
                data: response.body.slice(from..),
                total: Some(total),
            }))
        }
        _ => Err(response.error(context)),
    }
}

/// Parse an RFC 3339 or RFC 2822 timestamp into epoch seconds.
pub fn parse_time(value: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(value)
        .or_else(|_| chrono::DateTime::parse_from_rfc2822(value))
        .ok()
        .map(|time| time.timestamp())
}

/// Object-store driver over any [`ObjectApi`].
///
/// Paths map to keys by dropping the leading `/`; a path exists when any key
/// lies below it. Listing follows continuation tokens until the provider has
/// none, so callers see one set regardless of page count.
#[derive(Debug)]
pub struct ObjectDriver<A> {
    api: Arc<A>,
    root: String,
}

impl<A: ObjectApi> ObjectDriver<A> {
    pub fn new(api: A, root: impl Into<String>) -> Self {
        Self {
            api: Arc::new(api),
            root: root.into(),
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    fn key(path: &str) -> &str {
        path.trim_start_matches('/')
    }

    fn prefix(path: &str) -> String {
        match Self::key(path) {
            "" => String::new(),
            key => format!("{key}/"),
        }
    }

    async fn list_all(&self, prefix: &str, recurse: bool) -> StorageResult<ListPage> {
        let mut all = ListPage::default();
        let mut token: Option<String> = None;
        let mut pages = 0usize;
        loop {
            let page = self.api.list_page(prefix, recurse, token.as_deref()).await?;
            pages += 1;
            all.objects.extend(page.objects);
            all.prefixes.extend(page.prefixes);
            match page.next {
                Some(next) if !next.is_empty() => token = Some(next),
                _ => break,
            }
        }
        debug!(
            target: "ferry::storage",
            driver = self.api.name(),
            prefix,
            pages,
            objects = all.objects.len(),
            "listed"
        );
        Ok(all)
    }
}

#[async_trait]
impl<A: ObjectApi> StorageDriver for ObjectDriver<A> {
    fn name(&self) -> &'static str {
        self.api.name()
    }

    fn root(&self) -> &str {
        &self.root
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::object_store()
    }

    async fn info(&self, path: &str, _follow_links: bool) -> StorageResult<StorageInfo> {
        let key = Self::key(path);
        if key.is_empty() {
            return Ok(StorageInfo::path());
        }
        if let Some(info) = self.api.head(key).await? {
            return Ok(info);
        }
        let page = self.api.list_page(&Self::prefix(path), false, None).await?;
        if page.objects.is_empty() && page.prefixes.is_empty() {
            Ok(StorageInfo::missing())
        } else {
            Ok(StorageInfo::path())
        }
    }

    async fn list(&self, path: &str) -> StorageResult<Vec<StorageInfo>> {
        let prefix = Self::prefix(path);
        let page = self.list_all(&prefix, false).await?;
        let mut entries = Vec::with_capacity(page.objects.len() + page.prefixes.len());
        for mut object in page.objects {
            if let Some(name) = object.name.strip_prefix(&prefix) {
                if !name.is_empty() {
                    object.name = name.to_string();
                    entries.push(object);
                }
            }
        }
        for common in page.prefixes {
            if let Some(name) = common.strip_prefix(&prefix) {
                let name = name.trim_end_matches('/');
                if !name.is_empty() {
                    entries.push(StorageInfo::path().with_name(name));
                }
            }
        }
        Ok(entries)
    }

    async fn open_read(
        &self,
        path: &str,
        options: &ReadOptions,
    ) -> StorageResult<Option<Box<dyn DriverRead>>> {
        let key = Self::key(path).to_string();
        let mut read = ObjectRead {
            api: Arc::clone(&self.api),
            key,
            position: options.offset,
            end: options.limit.map(|limit| options.offset.saturating_add(limit)),
            pending: None,
            done: false,
        };
        match read.fetch().await? {
            Some(first) => {
                read.pending = Some(first);
                Ok(Some(Box::new(read)))
            }
            None if options.ignore_missing => Ok(None),
            None => Err(StorageError::NotFound(format!(
                "unable to open missing file '{path}' for read"
            ))),
        }
    }

    async fn open_write(
        &self,
        path: &str,
        _options: &WriteOptions,
    ) -> StorageResult<Box<dyn DriverWrite>> {
        Ok(Box::new(ObjectWrite {
            api: Arc::clone(&self.api),
            key: Self::key(path).to_string(),
            buffer: Vec::new(),
            part_size: self.api.part_size().max(1),
            upload: None,
            finished: false,
        }))
    }

    async fn remove(&self, path: &str, error_on_missing: bool) -> StorageResult<()> {
        let key = Self::key(path);
        if error_on_missing && self.api.head(key).await?.is_none() {
            return Err(StorageError::NotFound(format!("unable to remove missing file '{path}'")));
        }
        self.api.delete(key).await
    }

    async fn path_remove(&self, path: &str, recurse: bool) -> StorageResult<()> {
        let page = self.list_all(&Self::prefix(path), true).await?;
        if !recurse && !page.objects.is_empty() {
            return Err(StorageError::Io(format!(
                "unable to remove path '{path}': path is not empty"
            )));
        }
        for object in &page.objects {
            self.api.delete(&object.name).await?;
        }
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        self.api.close().await;
        Ok(())
    }
}

struct ObjectRead<A> {
    api: Arc<A>,
    key: String,
    position: u64,
    /// Exclusive end of the requested range.
    end: Option<u64>,
    pending: Option<Vec<u8>>,
    done: bool,
}

impl<A: ObjectApi> ObjectRead<A> {
    /// Fetch the next chunk; `None` when the object is missing.
    async fn fetch(&mut self) -> StorageResult<Option<Vec<u8>>> {
        let length = match self.end {
            Some(end) => end.saturating_sub(self.position).min(READ_CHUNK),
            None => READ_CHUNK,
        };
        if length == 0 {
            self.done = true;
            return Ok(Some(Vec::new()));
        }
        let Some(chunk) = self.api.get_range(&self.key, self.position, length).await? else {
            return Ok(None);
        };
        let data = chunk.data;
        self.position += data.len() as u64;
        let at_end = chunk.total.is_some_and(|total| self.position >= total)
            || self.end.is_some_and(|end| self.position >= end);
        if (data.len() as u64) < length || at_end {
            self.done = true;
        }
        Ok(Some(data.to_vec()))
    }
}

#[async_trait]
impl<A: ObjectApi> DriverRead for ObjectRead<A> {
    async fn read(&mut self) -> StorageResult<Option<Vec<u8>>> {
        loop {
            if let Some(pending) = self.pending.take() {
                if !pending.is_empty() {
                    return Ok(Some(pending));
                }
            }
            if self.done {
                return Ok(None);
            }
            let next = self.fetch().await?.ok_or_else(|| {
                StorageError::NotFound(format!("object '{}' removed during read", self.key))
            })?;
            self.pending = Some(next);
        }
    }

    async fn close(self: Box<Self>) -> StorageResult<()> {
        Ok(())
    }
}

/// Buffers a write; one PUT when it fits in a part, a multipart upload
/// otherwise. A write dropped before `close` aborts its upload in the
/// background, best effort.
struct ObjectWrite<A: ObjectApi> {
    api: Arc<A>,
    key: String,
    buffer: Vec<u8>,
    part_size: usize,
    upload: Option<Upload>,
    finished: bool,
}

impl<A: ObjectApi> ObjectWrite<A> {
    async fn send_part(&mut self, part: Vec<u8>, last: bool) -> StorageResult<()> {
        if self.upload.is_none() {
            let upload = self.api.upload_begin(&self.key).await?;
            debug!(target: "ferry::storage", driver = self.api.name(), key = %self.key, "multipart upload begin");
            self.upload = Some(upload);
        }
        let result = match self.upload.as_mut() {
            Some(upload) => self.api.upload_part(upload, Bytes::from(part), last).await,
            None => Ok(()),
        };
        if let Err(err) = result {
            self.abort_upload().await;
            return Err(err);
        }
        Ok(())
    }

    async fn abort_upload(&mut self) {
        self.finished = true;
        if let Some(upload) = self.upload.take() {
            match self.api.upload_abort(&upload).await {
                Ok(()) => debug!(target: "ferry::storage", key = %upload.key, "multipart upload aborted"),
                Err(err) => warn!(target: "ferry::storage", key = %upload.key, error = %err, "multipart abort failed"),
            }
        }
    }
}

#[async_trait]
impl<A: ObjectApi> DriverWrite for ObjectWrite<A> {
    async fn write(&mut self, data: &[u8]) -> StorageResult<()> {
        self.buffer.extend_from_slice(data);
        while self.buffer.len() >= self.part_size {
            let part: Vec<u8> = self.buffer.drain(..self.part_size).collect();
            self.send_part(part, false).await?;
        }
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> StorageResult<()> {
        let rest = std::mem::take(&mut self.buffer);
        if self.upload.is_none() {
            self.finished = true;
            return self.api.put(&self.key, Bytes::from(rest)).await;
        }
        self.send_part(rest, true).await?;
        let result = match &self.upload {
            Some(upload) => self.api.upload_complete(upload).await,
            None => Ok(()),
        };
        match result {
            Ok(()) => {
                self.finished = true;
                debug!(target: "ferry::storage", driver = self.api.name(), key = %self.key, "multipart upload complete");
                Ok(())
            }
            Err(err) => {
                self.abort_upload().await;
                Err(err)
            }
        }
    }

    async fn abort(mut self: Box<Self>) -> StorageResult<()> {
        self.abort_upload().await;
        Ok(())
    }
}

impl<A: ObjectApi> Drop for ObjectWrite<A> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Some(upload) = self.upload.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let api = Arc::clone(&self.api);
        runtime.spawn(async move {
            if let Err(err) = api.upload_abort(&upload).await {
                warn!(target: "ferry::storage", key = %upload.key, error = %err, "multipart abort failed");
            }
        });
    }
}

/// HMAC-SHA256 used by the request signers.
pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> StorageResult<Vec<u8>> {
    use hmac::{Hmac, Mac};

    let mut mac = Hmac::<sha2::Sha256>::new_from_slice(key)
        .map_err(|e| StorageError::Config(format!("invalid signing key: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Decode an XML response body.
pub(crate) fn from_xml<T: serde::de::DeserializeOwned>(body: &Bytes, context: &str) -> StorageResult<T> {
    let text = std::str::from_utf8(body).map_err(|e| StorageError::Provider {
        status: None,
        message: format!("{context}: {e}"),
    })?;
    quick_xml::de::from_str(text).map_err(|e| StorageError::Provider {
        status: None,
        message: format!("{context}: invalid response: {e}"),
    })
}

/// File metadata from the headers of a HEAD response.
pub(crate) fn info_from_headers(response: &HttpResponse) -> StorageInfo {
    let size = response
        .header("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let time = response.header("last-modified").and_then(parse_time).unwrap_or(0);
    let mut info = StorageInfo::file(size, time);
    info.etag = response.header("etag").map(|e| e.trim_matches('"').to_string());
    info
}
