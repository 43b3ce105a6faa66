use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ferry_http::{HttpClient, HttpSend};
use ferry_transport::TlsConnector;
use ferry_types::{StorageError, StorageResult};
use tracing::debug;
use zeroize::Zeroizing;

use crate::config::{DriverConfig, FerryConfig};
use crate::driver::StorageDriver;
use crate::drivers::{
    Azure, AzureDriver, AzureKey, Connector, ExecConnector, Gcs, GcsDriver, PosixDriver,
    RemoteDriver, S3Credentials, S3Driver, SftpDriver, Ssh2Fs, SshSettings, TcpConnector,
    UriStyle, S3,
};
use crate::storage::Storage;

/// Builds storages from a loaded [`FerryConfig`].
///
/// Drivers handed out are tracked; [`close`](StorageContext::close) releases
/// their connections and peer processes at teardown.
#[derive(Debug, Clone)]
pub struct StorageContext {
    config: Arc<FerryConfig>,
    opened: Arc<Mutex<Vec<Arc<dyn StorageDriver>>>>,
}

impl StorageContext {
    pub fn new(config: FerryConfig) -> Self {
        Self {
            config: Arc::new(config),
            opened: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn config(&self) -> &FerryConfig {
        &self.config
    }

    fn http(&self, host: &str, port: u16) -> StorageResult<Arc<dyn HttpSend>> {
        let tls = TlsConnector::new(&self.config.tls)?;
        let client = HttpClient::new(host, port, tls, self.config.transport.clone());
        Ok(Arc::new(client.retrying()))
    }

    /// Driver for the configured repository, without filters.
    ///
    /// Remote and sftp drivers connect here, so an unreachable peer fails now rather
    /// than on first use.
    pub async fn driver(&self) -> StorageResult<Arc<dyn StorageDriver>> {
        let repo = &self.config.repo;
        let root = repo.path.clone();
        let driver: Arc<dyn StorageDriver> = match &repo.driver {
            DriverConfig::Posix(posix) => {
                Arc::new(PosixDriver::new(root).with_modes(posix.mode_file, posix.mode_path))
            }
            DriverConfig::S3(s3) => {
                let credentials = match (&s3.key, &s3.secret) {
                    (Some(key), Some(secret)) => S3Credentials::new(
                        key.clone(),
                        secret.expose(),
                        s3.token.as_ref().map(|token| token.expose().to_string()),
                    ),
                    _ => S3Credentials::from_env()?,
                };
                let host = match s3.uri_style {
                    UriStyle::Host => format!("{}.{}", s3.bucket, s3.endpoint),
                    UriStyle::Path => s3.endpoint.clone(),
                };
                let authority = if s3.port == 443 {
                    host.clone()
                } else {
                    format!("{host}:{}", s3.port)
                };
                let api = S3::new(
                    self.http(&host, s3.port)?,
                    s3.bucket.clone(),
                    s3.region.clone(),
                    authority,
                    s3.uri_style,
                    credentials,
                )
                .with_part_size(s3.part_size);
                Arc::new(S3Driver::new(api, root))
            }
            DriverConfig::Azure(azure) => {
                let key = match (&azure.key, &azure.sas) {
                    (Some(key), _) => AzureKey::shared(key.expose())?,
                    (None, Some(sas)) => AzureKey::sas(sas.expose()),
                    (None, None) => {
                        return Err(StorageError::Config("azure needs a key or sas".into()))
                    }
                };
                let api = Azure::new(
                    self.http(&azure.host(), azure.port)?,
                    azure.account.clone(),
                    azure.container.clone(),
                    key,
                )
                .with_block_size(azure.block_size);
                Arc::new(AzureDriver::new(api, root))
            }
            DriverConfig::Gcs(gcs) => {
                let api = Gcs::new(
                    self.http(&gcs.endpoint, gcs.port)?,
                    gcs.bucket.clone(),
                    gcs.token.as_ref().map(|token| token.expose().to_string()),
                )
                .with_chunk_size(gcs.chunk_size);
                Arc::new(GcsDriver::new(api, root))
            }
            DriverConfig::Remote(remote) => {
                let connector: Arc<dyn Connector> = match (&remote.host, remote.port) {
                    (Some(host), Some(port)) if remote.command.is_empty() => {
                        let tcp = TcpConnector::new(host.clone(), port, self.config.transport.clone());
                        if remote.tls {
                            Arc::new(tcp.with_tls(TlsConnector::new(&self.config.tls)?))
                        } else {
                            Arc::new(tcp)
                        }
                    }
                    _ => Arc::new(ExecConnector::new(remote.command.clone())),
                };
                Arc::new(RemoteDriver::connect(connector).await?)
            }
            DriverConfig::Sftp(sftp) => {
                let transport = &self.config.transport;
                let fs = Ssh2Fs::new(SshSettings {
                    host: sftp.host.clone(),
                    port: sftp.port,
                    user: sftp.user.clone(),
                    key_priv: sftp.key_priv.clone().into(),
                    key_pub: sftp.key_pub.clone().map(Into::into),
                    key_passphrase: sftp
                        .key_passphrase
                        .as_ref()
                        .map(|pass| Arc::new(Zeroizing::new(pass.expose().to_string()))),
                    host_fingerprint: sftp.host_fingerprint.clone(),
                    connect_timeout: Duration::from_millis(transport.connect_timeout_ms),
                    io_timeout: Duration::from_millis(transport.io_timeout_ms),
                });
                let driver = SftpDriver::new(Arc::new(fs), root).with_modes(sftp.mode_file, sftp.mode_path);
                Arc::new(driver.connect().await?)
            }
        };
        debug!(
            target: "ferry::storage",
            driver = driver.name(),
            root = driver.root(),
            "repository driver ready"
        );
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&driver));
        Ok(driver)
    }

    /// Close every driver built so far, reporting the first failure.
    pub async fn close(&self) -> StorageResult<()> {
        let drivers = std::mem::take(&mut *self.opened.lock().unwrap_or_else(PoisonError::into_inner));
        let mut result = Ok(());
        for driver in drivers {
            if let Err(err) = driver.close().await {
                if result.is_ok() {
                    result = Err(err.with_context(format!("unable to close {} driver", driver.name())));
                }
            }
        }
        result
    }

    /// The repository storage with the configured compression and cipher.
    pub async fn repo(&self, writable: bool) -> StorageResult<Storage> {
        let repo = &self.config.repo;
        let mut storage = Storage::new(self.driver().await?)
            .with_compress(repo.compress, repo.compress_level());
        if let Some(pass) = &repo.cipher_pass {
            storage = storage.with_cipher(pass.expose());
        }
        Ok(if writable { storage.writable() } else { storage })
    }

    /// Writable local storage rooted at `path`, without filters.
    pub fn local(&self, path: impl Into<String>) -> Storage {
        Storage::new(Arc::new(PosixDriver::new(path))).writable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Secret;
    use crate::driver::WriteOptions;
    use ferry_filter::CompressType;
    use ferry_types::ErrorKind;

    fn posix_config(root: &std::path::Path) -> FerryConfig {
        let mut config = FerryConfig::default();
        config.repo.path = root.display().to_string();
        config
    }

    #[tokio::test]
    async fn posix_repo_with_filters() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = posix_config(dir.path());
        config.repo.compress = CompressType::Zst;
        config.repo.cipher_pass = Some(Secret::new("pass"));
        let context = StorageContext::new(config);

        let repo = context.repo(true).await.unwrap();
        assert_eq!(repo.driver_name(), "posix");
        repo.put("archive/file", b"segment").await.unwrap();
        assert_eq!(repo.get("archive/file", false).await.unwrap().unwrap(), b"segment");

        let raw = std::fs::read(dir.path().join("archive/file")).unwrap();
        assert_ne!(raw, b"segment");

        let read_only = context.repo(false).await.unwrap();
        let err = read_only.remove("archive/file", false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReadOnly);
    }

    #[tokio::test]
    async fn every_codec_reads_back() {
        for (kind, magic) in [
            (CompressType::Gz, &[0x1f, 0x8b][..]),
            (CompressType::Lz4, &[0x04, 0x22, 0x4d, 0x18][..]),
            (CompressType::Zst, &[0x28, 0xb5, 0x2f, 0xfd][..]),
        ] {
            let dir = tempfile::tempdir().unwrap();
            let mut config = posix_config(dir.path());
            config.repo.compress = kind;
            let repo = StorageContext::new(config).repo(true).await.unwrap();
            repo.put("backup.info", b"[backup:current]").await.unwrap();
            let raw = std::fs::read(dir.path().join("backup.info")).unwrap();
            assert!(raw.starts_with(magic), "{kind}");
            assert_eq!(repo.get("backup.info", false).await.unwrap().unwrap(), b"[backup:current]");
        }
    }

    #[tokio::test]
    async fn local_storage_is_plain() {
        let dir = tempfile::tempdir().unwrap();
        let context = StorageContext::new(FerryConfig::default());
        let local = context.local(dir.path().display().to_string());
        let mut write = local.open_write("spool", WriteOptions::default()).await.unwrap();
        write.write(b"plain").await.unwrap();
        write.close().await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("spool")).unwrap(), b"plain");
    }

    #[tokio::test]
    async fn bad_azure_key_is_config_error() {
        let config = FerryConfig::from_toml(
            "[repo.driver]\ntype = \"azure\"\naccount = \"a\"\ncontainer = \"c\"\nkey = \"!!not base64!!\"",
        )
        .unwrap();
        let err = StorageContext::new(config).driver().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[tokio::test]
    async fn unreachable_remote_fails_at_connect() {
        let config = FerryConfig::from_toml(
            "[repo.driver]\ntype = \"remote\"\ncommand = [\"/nonexistent/ferry-remote\"]",
        )
        .unwrap();
        assert!(StorageContext::new(config).driver().await.is_err());
    }

    #[tokio::test]
    async fn unreachable_sftp_fails_at_connect() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = FerryConfig::from_toml(&format!(
            "[repo.driver]\ntype = \"sftp\"\nhost = \"127.0.0.1\"\nport = {port}\nuser = \"u\"\nkey_priv = \"/nonexistent/key\""
        ))
        .unwrap();
        let context = StorageContext::new(config);
        let err = context.driver().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connectivity);
        assert!(context.opened.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn close_releases_every_driver() {
        let dir = tempfile::tempdir().unwrap();
        let context = StorageContext::new(posix_config(dir.path()));
        let repo = context.repo(true).await.unwrap();
        let _read_only = context.repo(false).await.unwrap();
        assert_eq!(context.opened.lock().unwrap().len(), 2);

        context.close().await.unwrap();
        assert!(context.opened.lock().unwrap().is_empty());
        repo.put("after-close", b"still usable").await.unwrap();
    }
}
