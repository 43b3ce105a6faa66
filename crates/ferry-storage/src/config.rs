use std::path::{Path, PathBuf};

use ferry_filter::CompressType;
use ferry_transport::{TlsConfig, TransportConfig};
use ferry_types::{StorageError, StorageResult};
use serde::{Deserialize, Deserializer};
use zeroize::Zeroizing;

use crate::driver::{DEFAULT_MODE_FILE, DEFAULT_MODE_PATH};
use crate::drivers::{UriStyle, DEFAULT_BLOCK_SIZE, DEFAULT_CHUNK_SIZE, MIN_PART_SIZE};

/// Config file read when neither a path nor `FERRY_CONFIG` is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ferry/ferry.toml";

pub const ENV_CONFIG: &str = "FERRY_CONFIG";
pub const ENV_CIPHER_PASS: &str = "FERRY_CIPHER_PASS";

/// A configured secret. Never shown by `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(Zeroizing<String>);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<redacted>")
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

/// Process configuration, loaded once at startup.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct FerryConfig {
    /// `tracing` filter directive for the binary.
    pub log_level: String,
    pub transport: TransportConfig,
    pub tls: TlsConfig,
    pub repo: RepoConfig,
}

impl Default for FerryConfig {
    fn default() -> Self {
        Self {
            log_level: "warn".into(),
            transport: TransportConfig::default(),
            tls: TlsConfig::default(),
            repo: RepoConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    /// Repository root: a directory for posix, a key prefix for object stores.
    pub path: String,
    pub driver: DriverConfig,
    pub cipher_pass: Option<Secret>,
    pub compress: CompressType,
    /// Codec level; the codec's own default when unset.
    pub compress_level: Option<i32>,
}

impl RepoConfig {
    pub fn compress_level(&self) -> i32 {
        self.compress_level.unwrap_or_else(|| self.compress.default_level())
    }
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            path: "/var/lib/ferry".into(),
            driver: DriverConfig::default(),
            cipher_pass: None,
            compress: CompressType::None,
            compress_level: None,
        }
    }
}

/// Backend of the repository, selected by `type`.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DriverConfig {
    Posix(PosixConfig),
    S3(S3Config),
    Azure(AzureConfig),
    Gcs(GcsConfig),
    Remote(RemoteConfig),
    Sftp(SftpConfig),
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::Posix(PosixConfig::default())
    }
}

impl DriverConfig {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Posix(_) => "posix",
            Self::S3(_) => "s3",
            Self::Azure(_) => "azure",
            Self::Gcs(_) => "gcs",
            Self::Remote(_) => "remote",
            Self::Sftp(_) => "sftp",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PosixConfig {
    pub mode_file: u32,
    pub mode_path: u32,
}

impl Default for PosixConfig {
    fn default() -> Self {
        Self {
            mode_file: DEFAULT_MODE_FILE,
            mode_path: DEFAULT_MODE_PATH,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct S3Config {
    pub bucket: String,
    pub endpoint: String,
    pub region: String,
    pub port: u16,
    pub uri_style: UriStyle,
    /// Access key id; with `secret`, overrides the `AWS_*` environment.
    pub key: Option<String>,
    pub secret: Option<Secret>,
    pub token: Option<Secret>,
    pub part_size: usize,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            endpoint: String::new(),
            region: String::new(),
            port: 443,
            uri_style: UriStyle::Host,
            key: None,
            secret: None,
            token: None,
            part_size: MIN_PART_SIZE,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AzureConfig {
    pub account: String,
    pub container: String,
    /// Defaults to `<account>.blob.core.windows.net`.
    pub host: Option<String>,
    pub port: u16,
    /// Shared account key, base64.
    pub key: Option<Secret>,
    pub sas: Option<Secret>,
    pub block_size: usize,
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            account: String::new(),
            container: String::new(),
            host: None,
            port: 443,
            key: None,
            sas: None,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl AzureConfig {
    pub fn host(&self) -> String {
        self.host
            .clone()
            .unwrap_or_else(|| format!("{}.blob.core.windows.net", self.account))
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct GcsConfig {
    pub bucket: String,
    pub endpoint: String,
    pub port: u16,
    pub token: Option<Secret>,
    pub chunk_size: usize,
}

impl Default for GcsConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            endpoint: "storage.googleapis.com".into(),
            port: 443,
            token: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Command spawned to reach the peer, e.g. `["ssh", "db1", "ferry", "remote"]`.
    pub command: Vec<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Wrap the TCP channel in TLS.
    pub tls: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SftpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Private key file used for public key authentication.
    pub key_priv: String,
    /// Public key file; derived from the private key when unset.
    pub key_pub: Option<String>,
    pub key_passphrase: Option<Secret>,
    /// Hex SHA-256 of the server host key.
    pub host_fingerprint: Option<String>,
    pub mode_file: u32,
    pub mode_path: u32,
}

impl Default for SftpConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            user: String::new(),
            key_priv: String::new(),
            key_pub: None,
            key_passphrase: None,
            host_fingerprint: None,
            mode_file: DEFAULT_MODE_FILE,
            mode_path: DEFAULT_MODE_PATH,
        }
    }
}

fn required(value: &str, driver: &str, field: &str) -> StorageResult<()> {
    if value.is_empty() {
        return Err(StorageError::Config(format!("{driver} {field} must be set")));
    }
    Ok(())
}

impl FerryConfig {
    /// Parse TOML text and check it.
    pub fn from_toml(text: &str) -> StorageResult<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| StorageError::Config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> StorageResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| StorageError::Config(format!("unable to read '{}': {e}", path.display())))?;
        Self::from_toml(&text)
            .map_err(|e| e.with_context(format!("config '{}'", path.display())))
    }

    /// Load from `path`, else `FERRY_CONFIG`, else [`DEFAULT_CONFIG_PATH`]
    /// when it exists; then apply environment overrides.
    pub fn load(path: Option<&Path>) -> StorageResult<Self> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(ENV_CONFIG).map(PathBuf::from));
        let mut config = match explicit {
            Some(path) => Self::from_file(&path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Fill settings the file left out from the environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.repo.cipher_pass.is_none() {
            self.repo.cipher_pass = lookup(ENV_CIPHER_PASS)
                .filter(|pass| !pass.is_empty())
                .map(Secret::new);
        }
    }

    pub fn validate(&self) -> StorageResult<()> {
        if !self.repo.path.starts_with('/') {
            return Err(StorageError::Config(format!(
                "repo path '{}' must be absolute",
                self.repo.path
            )));
        }
        match &self.repo.driver {
            DriverConfig::Posix(_) => {}
            DriverConfig::S3(s3) => {
                required(&s3.bucket, "s3", "bucket")?;
                required(&s3.endpoint, "s3", "endpoint")?;
                required(&s3.region, "s3", "region")?;
                if s3.part_size < MIN_PART_SIZE {
                    return Err(StorageError::Config(format!(
                        "s3 part_size {} is below the minimum {MIN_PART_SIZE}",
                        s3.part_size
                    )));
                }
                if s3.key.is_some() != s3.secret.is_some() {
                    return Err(StorageError::Config("s3 key and secret must be set together".into()));
                }
            }
            DriverConfig::Azure(azure) => {
                required(&azure.account, "azure", "account")?;
                required(&azure.container, "azure", "container")?;
                if azure.key.is_some() == azure.sas.is_some() {
                    return Err(StorageError::Config(
                        "azure needs exactly one of key or sas".into(),
                    ));
                }
            }
            DriverConfig::Gcs(gcs) => {
                required(&gcs.bucket, "gcs", "bucket")?;
                required(&gcs.endpoint, "gcs", "endpoint")?;
            }
            DriverConfig::Remote(remote) => {
                let tcp = remote.host.is_some() && remote.port.is_some();
                if remote.command.is_empty() == !tcp {
                    return Err(StorageError::Config(
                        "remote needs either command or host and port".into(),
                    ));
                }
            }
            DriverConfig::Sftp(sftp) => {
                required(&sftp.host, "sftp", "host")?;
                required(&sftp.user, "sftp", "user")?;
                required(&sftp.key_priv, "sftp", "key_priv")?;
                if let Some(fingerprint) = &sftp.host_fingerprint {
                    if fingerprint.len() != 64 || hex::decode(fingerprint).is_err() {
                        return Err(StorageError::Config(
                            "sftp host_fingerprint must be a hex SHA-256 digest".into(),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}
