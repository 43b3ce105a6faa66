//! Google Cloud Storage JSON API with bearer-token authorization.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use ferry_http::{encode_component, HttpRequest, HttpResponse, HttpSend, Method};
use ferry_types::{StorageError, StorageInfo, StorageResult};
use serde::Deserialize;
use zeroize::Zeroizing;

use super::object::{
    parse_time, range_header, range_response, ListPage, ObjectApi, ObjectDriver, RangeChunk, Upload,
};

/// Resumable chunks must be a multiple of this size, except the last.
pub const CHUNK_QUANTUM: usize = 256 * 1024;

pub const DEFAULT_CHUNK_SIZE: usize = 16 * CHUNK_QUANTUM;

pub type GcsDriver = ObjectDriver<Gcs>;

pub struct Gcs {
    http: Arc<dyn HttpSend>,
    bucket: String,
    token: Option<Zeroizing<String>>,
    chunk_size: usize,
}

impl std::fmt::Debug for Gcs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gcs")
            .field("bucket", &self.bucket)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

impl Gcs {
    /// Without a token requests go out unauthenticated, as for a public
    /// bucket or a local emulator.
    pub fn new(http: Arc<dyn HttpSend>, bucket: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http,
            bucket: bucket.into(),
            token: token.map(Zeroizing::new),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Chunk size, rounded up to a whole number of quanta.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.div_ceil(CHUNK_QUANTUM).max(1) * CHUNK_QUANTUM;
        self
    }

    fn object_path(&self, key: &str) -> String {
        format!("/storage/v1/b/{}/o/{}", self.bucket, encode_component(key))
    }

    fn upload_path(&self) -> String {
        format!("/upload/storage/v1/b/{}/o", self.bucket)
    }

    async fn send(&self, mut request: HttpRequest) -> StorageResult<HttpResponse> {
        if let Some(token) = &self.token {
            request.set_header("authorization", format!("Bearer {}", token.as_str()));
        }
        self.http.send(request).await
    }
}

fn from_json<T: serde::de::DeserializeOwned>(body: &Bytes, context: &str) -> StorageResult<T> {
    serde_json::from_slice(body).map_err(|e| StorageError::Provider {
        status: None,
        message: format!("{context}: invalid response: {e}"),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GcsObject {
    name: String,
    /// Decimal string in the JSON API.
    size: Option<String>,
    updated: Option<String>,
    etag: Option<String>,
    md5_hash: Option<String>,
}

impl GcsObject {
    fn into_info(self) -> StorageInfo {
        let size = self.size.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0);
        let time = self.updated.as_deref().and_then(parse_time).unwrap_or(0);
        let mut info = StorageInfo::file(size, time).with_name(self.name);
        info.etag = self.etag;
        info.checksum = self.md5_hash;
        info
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GcsList {
    #[serde(default)]
    items: Vec<GcsObject>,
    #[serde(default)]
    prefixes: Vec<String>,
    next_page_token: Option<String>,
}

/// `upload_id` query value of a resumable session URI.
fn session_id(location: &str) -> Option<String> {
    let (_, query) = location.split_once('?')?;
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("upload_id="))
        .map(str::to_string)
}

#[async_trait]
impl ObjectApi for Gcs {
    fn name(&self) -> &'static str {
        "gcs"
    }

    fn part_size(&self) -> usize {
        self.chunk_size
    }

    async fn head(&self, key: &str) -> StorageResult<Option<StorageInfo>> {
        let context = format!("unable to get info for '{key}'");
        let response = self.send(HttpRequest::new(Method::Get, self.object_path(key))).await?;
        if response.status == 404 {
            return Ok(None);
        }
        let response = response.check(&context)?;
        let object: GcsObject = from_json(&response.body, &context)?;
        Ok(Some(object.into_info().with_name("")))
    }

    async fn get_range(&self, key: &str, start: u64, length: u64) -> StorageResult<Option<RangeChunk>> {
        let request = HttpRequest::new(Method::Get, self.object_path(key))
            .query("alt", "media")
            .header("range", range_header(start, length));
        let response = self.send(request).await?;
        range_response(response, start, &format!("unable to read '{key}'"))
    }

    async fn list_page(&self, prefix: &str, recurse: bool, token: Option<&str>) -> StorageResult<ListPage> {
        let mut request = HttpRequest::new(Method::Get, format!("/storage/v1/b/{}/o", self.bucket));
        if !prefix.is_empty() {
            request = request.query("prefix", prefix);
        }
        if !recurse {
            request = request.query("delimiter", "/");
        }
        if let Some(token) = token {
            request = request.query("pageToken", token);
        }
        let context = format!("unable to list '{prefix}'");
        let response = self.send(request).await?.check(&context)?;
        let list: GcsList = from_json(&response.body, &context)?;
        Ok(ListPage {
            objects: list.items.into_iter().map(GcsObject::into_info).collect(),
            prefixes: list.prefixes,
            next: list.next_page_token,
        })
    }

    async fn put(&self, key: &str, body: Bytes) -> StorageResult<()> {
        let request = HttpRequest::new(Method::Post, self.upload_path())
            .query("uploadType", "media")
            .query("name", key)
            .header("content-type", "application/octet-stream")
            .body(body);
        self.send(request).await?.check(&format!("unable to write '{key}'"))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let response = self.send(HttpRequest::new(Method::Delete, self.object_path(key))).await?;
        if response.status != 404 {
            response.check(&format!("unable to remove '{key}'"))?;
        }
        Ok(())
    }

    async fn upload_begin(&self, key: &str) -> StorageResult<Upload> {
        let context = format!("unable to begin upload of '{key}'");
        let request = HttpRequest::new(Method::Post, self.upload_path())
            .query("uploadType", "resumable")
            .query("name", key);
        let response = self.send(request).await?.check(&context)?;
        let id = response
            .header("location")
            .and_then(session_id)
            .ok_or_else(|| StorageError::Provider {
                status: Some(response.status),
                message: format!("{context}: no session in response"),
            })?;
        Ok(Upload::new(key, id))
    }

    async fn upload_part(&self, upload: &mut Upload, body: Bytes, last: bool) -> StorageResult<()> {
        let length = body.len() as u64;
        let total = if last {
            (upload.offset + length).to_string()
        } else {
            "*".to_string()
        };
        let range = if length == 0 {
            format!("bytes */{total}")
        } else {
            format!("bytes {}-{}/{total}", upload.offset, upload.offset + length - 1)
        };
        let request = HttpRequest::new(Method::Put, self.upload_path())
            .query("uploadType", "resumable")
            .query("upload_id", upload.id.clone())
            .header("content-range", range)
            .body(body);
        let response = self.send(request).await?;
        // 308 acknowledges an intermediate chunk
        if !(response.status == 308 && !last) {
            response.check(&format!("unable to upload chunk of '{}'", upload.key))?;
        }
        upload.parts.push(String::new());
        upload.offset += length;
        Ok(())
    }

    async fn upload_complete(&self, _upload: &Upload) -> StorageResult<()> {
        // the final chunk finalizes the object
        Ok(())
    }

    async fn upload_abort(&self, upload: &Upload) -> StorageResult<()> {
        let request = HttpRequest::new(Method::Delete, self.upload_path())
            .query("uploadType", "resumable")
            .query("upload_id", upload.id.clone());
        let response = self.send(request).await?;
        // a cancelled session answers 499
        if !matches!(response.status, 404 | 499) {
            response.check(&format!("unable to abort upload of '{}'", upload.key))?;
        }
        Ok(())
    }

    async fn close(&self) {
        self.http.close().await
    }
}
