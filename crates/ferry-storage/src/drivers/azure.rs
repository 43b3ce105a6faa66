//! Azure Blob Storage object API, with shared-key or SAS authorization.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use ferry_http::{encode_path, HttpRequest, HttpResponse, HttpSend, Method};
use ferry_types::{StorageError, StorageInfo, StorageResult};
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use zeroize::Zeroizing;

use super::object::{
    from_xml, hmac_sha256, info_from_headers, parse_time, range_header, range_response, ListPage,
    ObjectApi, ObjectDriver, RangeChunk, Upload,
};

pub const API_VERSION: &str = "2021-08-06";

/// Default block size for staged uploads.
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024 * 1024;

pub type AzureDriver = ObjectDriver<Azure>;

#[derive(Clone)]
pub enum AzureKey {
    /// Decoded account key.
    Shared(Zeroizing<Vec<u8>>),
    /// Decoded SAS query parameters.
    Sas(Vec<(String, String)>),
}

impl std::fmt::Debug for AzureKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shared(_) => f.write_str("Shared(<redacted>)"),
            Self::Sas(_) => f.write_str("Sas(<redacted>)"),
        }
    }
}

impl AzureKey {
    /// Account key in its base64 form.
    pub fn shared(key: &str) -> StorageResult<Self> {
        let decoded = STANDARD
            .decode(key.trim())
            .map_err(|e| StorageError::Config(format!("azure key is not valid base64: {e}")))?;
        Ok(Self::Shared(Zeroizing::new(decoded)))
    }

    /// SAS token as issued, with or without the leading `?`.
    pub fn sas(token: &str) -> Self {
        let pairs = token
            .trim_start_matches('?')
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
                (
                    percent_decode_str(name).decode_utf8_lossy().into_owned(),
                    percent_decode_str(value).decode_utf8_lossy().into_owned(),
                )
            })
            .collect();
        Self::Sas(pairs)
    }
}

#[derive(Debug)]
pub struct Azure {
    http: Arc<dyn HttpSend>,
    account: String,
    container: String,
    key: AzureKey,
    block_size: usize,
}

impl Azure {
    pub fn new(
        http: Arc<dyn HttpSend>,
        account: impl Into<String>,
        container: impl Into<String>,
        key: AzureKey,
    ) -> Self {
        Self {
            http,
            account: account.into(),
            container: container.into(),
            key,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    fn container_path(&self) -> String {
        format!("/{}", self.container)
    }

    fn blob_path(&self, key: &str) -> String {
        format!("/{}/{}", self.container, encode_path(key))
    }

    async fn send(&self, mut request: HttpRequest) -> StorageResult<HttpResponse> {
        self.authorize(&mut request, Utc::now())?;
        self.http.send(request).await
    }

    fn authorize(&self, request: &mut HttpRequest, now: DateTime<Utc>) -> StorageResult<()> {
        request.set_header("x-ms-date", now.format("%a, %d %b %Y %H:%M:%S GMT").to_string());
        request.set_header("x-ms-version", API_VERSION);
        match &self.key {
            AzureKey::Sas(pairs) => {
                for (name, value) in pairs {
                    request.query.insert(name.clone(), value.clone());
                }
            }
            AzureKey::Shared(key) => {
                let to_sign = string_to_sign(request, &self.account);
                let signature = STANDARD.encode(hmac_sha256(key, to_sign.as_bytes())?);
                request.set_header("authorization", format!("SharedKey {}:{signature}", self.account));
            }
        }
        Ok(())
    }
}

/// Shared-key string to sign for a request.
fn string_to_sign(request: &HttpRequest, account: &str) -> String {
    let header = |name: &str| request.headers.get(name).map(String::as_str).unwrap_or("");
    let length = match request.body.len() {
        0 => String::new(),
        length => length.to_string(),
    };

    let mut out = format!(
        "{}\n{}\n{}\n{}\n{}\n{}\n\n{}\n{}\n{}\n{}\n{}\n",
        request.method,
        header("content-encoding"),
        header("content-language"),
        length,
        header("content-md5"),
        header("content-type"),
        header("if-modified-since"),
        header("if-match"),
        header("if-none-match"),
        header("if-unmodified-since"),
        header("range"),
    );
    for (name, value) in request.headers.range("x-ms-".to_string()..) {
        if !name.starts_with("x-ms-") {
            break;
        }
        out.push_str(&format!("{name}:{}\n", value.trim()));
    }
    out.push_str(&format!("/{account}{}", request.path));
    for (name, value) in &request.query {
        out.push_str(&format!("\n{}:{value}", name.to_ascii_lowercase()));
    }
    out
}

/// Block ids must all have the same length within a blob.
fn block_id(number: usize) -> String {
    STANDARD.encode(format!("{number:010}"))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EnumerationResults {
    #[serde(default)]
    blobs: BlobList,
    next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlobList {
    #[serde(default)]
    blob: Vec<BlobItem>,
    #[serde(default)]
    blob_prefix: Vec<BlobPrefix>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlobItem {
    name: String,
    properties: BlobProperties,
}

#[derive(Debug, Deserialize)]
struct BlobProperties {
    #[serde(rename = "Last-Modified")]
    last_modified: Option<String>,
    #[serde(rename = "Content-Length", default)]
    content_length: u64,
    #[serde(rename = "Etag")]
    etag: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlobPrefix {
    name: String,
}

#[async_trait]
impl ObjectApi for Azure {
    fn name(&self) -> &'static str {
        "azure"
    }

    fn part_size(&self) -> usize {
        self.block_size
    }

    async fn head(&self, key: &str) -> StorageResult<Option<StorageInfo>> {
        let response = self.send(HttpRequest::new(Method::Head, self.blob_path(key))).await?;
        match response.status {
            404 => Ok(None),
            _ => {
                let response = response.check(&format!("unable to get info for '{key}'"))?;
                Ok(Some(info_from_headers(&response)))
            }
        }
    }

    async fn get_range(&self, key: &str, start: u64, length: u64) -> StorageResult<Option<RangeChunk>> {
        let request = HttpRequest::new(Method::Get, self.blob_path(key))
            .header("range", range_header(start, length));
        let response = self.send(request).await?;
        range_response(response, start, &format!("unable to read '{key}'"))
    }

    async fn list_page(&self, prefix: &str, recurse: bool, token: Option<&str>) -> StorageResult<ListPage> {
        let mut request = HttpRequest::new(Method::Get, self.container_path())
            .query("restype", "container")
            .query("comp", "list");
        if !prefix.is_empty() {
            request = request.query("prefix", prefix);
        }
        if !recurse {
            request = request.query("delimiter", "/");
        }
        if let Some(token) = token {
            request = request.query("marker", token);
        }
        let context = format!("unable to list '{prefix}'");
        let response = self.send(request).await?.check(&context)?;
        let result: EnumerationResults = from_xml(&response.body, &context)?;

        let objects = result
            .blobs
            .blob
            .into_iter()
            .map(|blob| {
                let time = blob.properties.last_modified.as_deref().and_then(parse_time).unwrap_or(0);
                let mut info = StorageInfo::file(blob.properties.content_length, time).with_name(blob.name);
                info.etag = blob.properties.etag;
                info
            })
            .collect();
        Ok(ListPage {
            objects,
            prefixes: result.blobs.blob_prefix.into_iter().map(|p| p.name).collect(),
            next: result.next_marker.filter(|marker| !marker.is_empty()),
        })
    }

    async fn put(&self, key: &str, body: Bytes) -> StorageResult<()> {
        let request = HttpRequest::new(Method::Put, self.blob_path(key))
            .header("x-ms-blob-type", "BlockBlob")
            .body(body);
        self.send(request).await?.check(&format!("unable to write '{key}'"))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let response = self.send(HttpRequest::new(Method::Delete, self.blob_path(key))).await?;
        if response.status != 404 {
            response.check(&format!("unable to remove '{key}'"))?;
        }
        Ok(())
    }

    async fn upload_begin(&self, key: &str) -> StorageResult<Upload> {
        // blocks are staged against the blob name; nothing to open
        Ok(Upload::new(key, ""))
    }

    async fn upload_part(&self, upload: &mut Upload, body: Bytes, _last: bool) -> StorageResult<()> {
        if body.is_empty() {
            return Ok(());
        }
        let id = block_id(upload.parts.len() + 1);
        let length = body.len() as u64;
        let request = HttpRequest::new(Method::Put, self.blob_path(&upload.key))
            .query("comp", "block")
            .query("blockid", id.clone())
            .body(body);
        self.send(request)
            .await?
            .check(&format!("unable to stage block of '{}'", upload.key))?;
        upload.parts.push(id);
        upload.offset += length;
        Ok(())
    }

    async fn upload_complete(&self, upload: &Upload) -> StorageResult<()> {
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?><BlockList>");
        for id in &upload.parts {
            xml.push_str(&format!("<Latest>{id}</Latest>"));
        }
        xml.push_str("</BlockList>");
        let request = HttpRequest::new(Method::Put, self.blob_path(&upload.key))
            .query("comp", "blocklist")
            .body(xml);
        self.send(request)
            .await?
            .check(&format!("unable to commit blocks of '{}'", upload.key))?;
        Ok(())
    }

    async fn upload_abort(&self, _upload: &Upload) -> StorageResult<()> {
        // uncommitted blocks expire on their own
        Ok(())
    }

    async fn close(&self) {
        self.http.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{ReadOptions, StorageDriver, WriteOptions};
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct FakeAzure {
        blobs: Mutex<BTreeMap<String, Vec<u8>>>,
        staged: Mutex<BTreeMap<String, Vec<u8>>>,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl FakeAzure {
        fn list(&self, request: &HttpRequest) -> HttpResponse {
            let prefix = request.query.get("prefix").cloned().unwrap_or_default();
            let start: usize = request.query.get("marker").map(|m| m.parse().unwrap()).unwrap_or(0);
            let blobs = self.blobs.lock().unwrap();
            let mut entries: Vec<String> = Vec::new();
            for (name, data) in blobs.iter().filter(|(name, _)| name.starts_with(&prefix)) {
                let rest = &name[prefix.len()..];
                let entry = match rest.find('/') {
                    Some(at) if request.query.contains_key("delimiter") => {
                        format!("<BlobPrefix><Name>{prefix}{}</Name></BlobPrefix>", &rest[..=at])
                    }
                    _ => format!(
                        "<Blob><Name>{name}</Name><Properties>\
                         <Last-Modified>Tue, 02 Jan 2024 03:04:05 GMT</Last-Modified>\
                         <Etag>0x8D</Etag><Content-Length>{}</Content-Length></Properties></Blob>",
                        data.len()
                    ),
                };
                if entries.last() != Some(&entry) {
                    entries.push(entry);
                }
            }
            let page: String = entries.iter().skip(start).take(2).cloned().collect();
            let next = if start + 2 < entries.len() {
                format!("<NextMarker>{}</NextMarker>", start + 2)
            } else {
                "<NextMarker/>".to_string()
            };
            HttpResponse::new(200).with_body(format!(
                "<?xml version=\"1.0\" encoding=\"utf-8\"?>\
                 <EnumerationResults ContainerName=\"box\"><Blobs>{page}</Blobs>{next}</EnumerationResults>"
            ))
        }
    }

    #[async_trait]
    impl HttpSend for FakeAzure {
        async fn send(&self, request: HttpRequest) -> StorageResult<HttpResponse> {
            self.requests.lock().unwrap().push(request.clone());
            let key = request.path.trim_start_matches("/box").trim_start_matches('/').to_string();
            let comp = request.query.get("comp").map(String::as_str);
            let response = match (request.method, comp) {
                (Method::Get, Some("list")) => self.list(&request),
                (Method::Head, _) => match self.blobs.lock().unwrap().get(&key) {
                    Some(data) => HttpResponse::new(200).with_header("content-length", data.len().to_string()),
                    None => HttpResponse::new(404),
                },
                (Method::Get, _) => match self.blobs.lock().unwrap().get(&key) {
                    Some(data) => HttpResponse::new(200).with_body(data.clone()),
                    None => HttpResponse::new(404),
                },
                (Method::Put, Some("block")) => {
                    let id = request.query["blockid"].clone();
                    self.staged.lock().unwrap().insert(id, request.body.to_vec());
                    HttpResponse::new(201)
                }
                (Method::Put, Some("blocklist")) => {
                    let body = String::from_utf8(request.body.to_vec()).unwrap();
                    let mut staged = self.staged.lock().unwrap();
                    let mut data = Vec::new();
                    for part in body.split("<Latest>").skip(1) {
                        let id = part.split("</Latest>").next().unwrap();
                        data.extend(staged.remove(id).unwrap());
                    }
                    self.blobs.lock().unwrap().insert(key, data);
                    HttpResponse::new(201)
                }
                (Method::Put, None) => {
                    assert_eq!(request.headers["x-ms-blob-type"], "BlockBlob");
                    self.blobs.lock().unwrap().insert(key, request.body.to_vec());
                    HttpResponse::new(201)
                }
                (Method::Delete, _) => {
                    self.blobs.lock().unwrap().remove(&key);
                    HttpResponse::new(202)
                }
                _ => HttpResponse::new(400),
            };
            Ok(response)
        }
    }

    fn driver(fake: &Arc<FakeAzure>, key: AzureKey, block_size: usize) -> AzureDriver {
        ObjectDriver::new(
            Azure::new(fake.clone(), "account", "box", key).with_block_size(block_size),
            "/",
        )
    }

    fn shared() -> AzureKey {
        AzureKey::shared(&STANDARD.encode(b"not a real key")).unwrap()
    }

    #[test]
    fn string_to_sign_layout() {
        let mut request = HttpRequest::new(Method::Put, "/box/dir/file")
            .query("comp", "block")
            .query("blockid", "MDA=")
            .header("range", "bytes=0-9")
            .body("abc");
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        Azure::new(Arc::new(FakeAzure::default()), "account", "box", shared())
            .authorize(&mut request, now)
            .unwrap();

        let expected = "PUT\n\n\n3\n\n\n\n\n\n\n\nbytes=0-9\n\
                        x-ms-date:Tue, 02 Jan 2024 03:04:05 GMT\n\
                        x-ms-version:2021-08-06\n\
                        /account/box/dir/file\nblockid:MDA=\ncomp:block";
        assert_eq!(string_to_sign(&request, "account"), expected);
        assert!(request.headers["authorization"].starts_with("SharedKey account:"));
    }

    #[test]
    fn sas_token_is_decoded_into_query() {
        let key = AzureKey::sas("?sv=2021-08-06&sig=a%2Bb%3D&sp=rwdl");
        let mut request = HttpRequest::new(Method::Get, "/box/file");
        Azure::new(Arc::new(FakeAzure::default()), "account", "box", key)
            .authorize(&mut request, Utc::now())
            .unwrap();
        assert_eq!(request.query["sig"], "a+b=");
        assert!(request.query_string().contains("sig=a%2Bb%3D"));
        assert!(!request.headers.contains_key("authorization"));
    }

    #[test]
    fn bad_shared_key_is_config_error() {
        let err = AzureKey::shared("not base64!").unwrap_err();
        assert_eq!(err.kind(), ferry_types::ErrorKind::Config);
    }

    #[tokio::test]
    async fn list_pages_by_marker() {
        let fake = Arc::new(FakeAzure::default());
        {
            let mut blobs = fake.blobs.lock().unwrap();
            for name in ["repo/a", "repo/b", "repo/c", "repo/sub/d", "repo/sub/e", "other"] {
                blobs.insert(name.into(), vec![0; 3]);
            }
        }
        let driver = driver(&fake, shared(), 8);
        let mut names: Vec<_> = driver
            .list("/repo")
            .await
            .unwrap()
            .into_iter()
            .map(|e| { let is_path = e.is_path(); (e.name, is_path) })
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                ("a".to_string(), false),
                ("b".to_string(), false),
                ("c".to_string(), false),
                ("sub".to_string(), true),
            ]
        );
        let lists = fake
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.query.get("comp").map(String::as_str) == Some("list"))
            .count();
        assert_eq!(lists, 2);
    }

    #[tokio::test]
    async fn staged_blocks_commit_in_order() {
        let fake = Arc::new(FakeAzure::default());
        let driver = driver(&fake, shared(), 4);
        let data: Vec<u8> = (0..11u8).collect();
        let mut file = driver.open_write("/repo/blob", &WriteOptions::default()).await.unwrap();
        file.write(&data).await.unwrap();
        file.close().await.unwrap();

        assert_eq!(fake.blobs.lock().unwrap()["repo/blob"], data);
        assert!(fake.staged.lock().unwrap().is_empty());

        let mut read = driver.open_read("/repo/blob", &ReadOptions::new().range(2, None)).await.unwrap().unwrap();
        let mut out = Vec::new();
        while let Some(chunk) = read.read().await.unwrap() {
            out.extend(chunk);
        }
        assert_eq!(out, &data[2..]);
    }

    #[tokio::test]
    async fn small_blob_is_single_put() {
        let fake = Arc::new(FakeAzure::default());
        let driver = driver(&fake, AzureKey::sas("sig=x"), 64);
        let mut file = driver.open_write("/one", &WriteOptions::default()).await.unwrap();
        file.write(b"hello").await.unwrap();
        file.close().await.unwrap();
        assert_eq!(fake.blobs.lock().unwrap()["one"], b"hello");
        assert!(driver.info("/one", false).await.unwrap().is_file());
        driver.remove("/one", true).await.unwrap();
        assert!(fake.blobs.lock().unwrap().is_empty());
    }
}
