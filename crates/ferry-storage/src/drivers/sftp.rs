//! SFTP driver.
//!
//! libssh2 is blocking, so every call runs on tokio's blocking pool through
//! the [`SftpFs`] seam. [`Ssh2Fs`] holds one ssh session, opened on first use
//! and again after [`close`](StorageDriver::close) or a dropped connection.

use std::fmt;
use std::io::{self, ErrorKind as IoKind, Read, Seek, SeekFrom, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use ferry_types::{Capability, CapabilitySet, StorageError, StorageInfo, StorageResult, StorageType};
use ssh2::{ErrorCode, FileStat, HashType, OpenFlags, OpenType, Session, Sftp};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::driver::{
    DriverRead, DriverWrite, PathCreateOptions, ReadOptions, StorageDriver, WriteOptions,
    DEFAULT_MODE_FILE, DEFAULT_MODE_PATH,
};
use crate::drivers::posix::TEMP_SUFFIX;
use crate::path;

const CHUNK_SIZE: usize = 64 * 1024;

// SFTP status codes
const FX_NO_SUCH_FILE: i32 = 2;
const FX_PERMISSION_DENIED: i32 = 3;
const FX_NO_SUCH_PATH: i32 = 10;
const FX_FILE_ALREADY_EXISTS: i32 = 11;

// libssh2 session codes
const SSH_SOCKET_SEND: i32 = -7;
const SSH_TIMEOUT: i32 = -9;
const SSH_SOCKET_DISCONNECT: i32 = -13;
const SSH_AUTHENTICATION_FAILED: i32 = -18;
const SSH_PUBLICKEY_UNVERIFIED: i32 = -19;
const SSH_SOCKET_RECV: i32 = -43;

/// Attributes of one remote entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SftpStat {
    pub kind: StorageType,
    pub size: u64,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub time_modified: i64,
}

/// Open remote file being written.
pub trait SftpHandle: Write + Send {
    fn fsync(&mut self) -> io::Result<()>;
    fn set_stat(&mut self, mode: u32, time_modified: Option<i64>) -> io::Result<()>;
}

/// Blocking file operations of one SFTP server.
pub trait SftpFs: Send + Sync + fmt::Debug + 'static {
    /// Open the session now instead of on first use.
    fn connect(&self) -> io::Result<()> {
        Ok(())
    }
    fn stat(&self, path: &str, follow_links: bool) -> io::Result<SftpStat>;
    /// Entries below `path`, links not followed, without `.` and `..`.
    fn read_dir(&self, path: &str) -> io::Result<Vec<(String, SftpStat)>>;
    fn read_link(&self, path: &str) -> io::Result<String>;
    fn open_read(&self, path: &str, offset: u64) -> io::Result<Box<dyn Read + Send>>;
    /// Create or truncate `path`.
    fn create(&self, path: &str, mode: u32) -> io::Result<Box<dyn SftpHandle>>;
    fn mkdir(&self, path: &str, mode: u32) -> io::Result<()>;
    fn rmdir(&self, path: &str) -> io::Result<()>;
    fn unlink(&self, path: &str) -> io::Result<()>;
    fn rename(&self, from: &str, to: &str) -> io::Result<()>;
    fn disconnect(&self) -> io::Result<()> {
        Ok(())
    }
}

async fn blocking<T, F>(fs: &Arc<dyn SftpFs>, op: F) -> io::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn SftpFs) -> io::Result<T> + Send + 'static,
{
    let fs = Arc::clone(fs);
    tokio::task::spawn_blocking(move || op(fs.as_ref()))
        .await
        .unwrap_or_else(|err| Err(io::Error::new(IoKind::Other, format!("sftp task failed: {err}"))))
}

/// Connection settings of an [`Ssh2Fs`].
#[derive(Clone)]
pub struct SshSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_priv: PathBuf,
    pub key_pub: Option<PathBuf>,
    pub key_passphrase: Option<Arc<Zeroizing<String>>>,
    /// Hex SHA-256 of the server host key; unchecked when unset.
    pub host_fingerprint: Option<String>,
    pub connect_timeout: Duration,
    /// Per call; zero waits forever.
    pub io_timeout: Duration,
}

impl fmt::Debug for SshSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("key_priv", &self.key_priv)
            .field("host_fingerprint", &self.host_fingerprint)
            .finish_non_exhaustive()
    }
}

fn ssh_error(err: ssh2::Error) -> io::Error {
    let kind = match err.code() {
        ErrorCode::SFTP(FX_NO_SUCH_FILE | FX_NO_SUCH_PATH) => IoKind::NotFound,
        ErrorCode::SFTP(FX_PERMISSION_DENIED) => IoKind::PermissionDenied,
        ErrorCode::SFTP(FX_FILE_ALREADY_EXISTS) => IoKind::AlreadyExists,
        ErrorCode::Session(SSH_TIMEOUT) => IoKind::TimedOut,
        ErrorCode::Session(SSH_AUTHENTICATION_FAILED | SSH_PUBLICKEY_UNVERIFIED) => {
            IoKind::PermissionDenied
        }
        ErrorCode::Session(SSH_SOCKET_SEND | SSH_SOCKET_RECV | SSH_SOCKET_DISCONNECT) => {
            IoKind::ConnectionReset
        }
        _ => IoKind::Other,
    };
    io::Error::new(kind, err)
}

struct Ssh2Session {
    session: Session,
    sftp: Sftp,
}

/// [`SftpFs`] over libssh2 with public key authentication.
pub struct Ssh2Fs {
    settings: SshSettings,
    connection: Mutex<Option<Arc<Ssh2Session>>>,
}

impl fmt::Debug for Ssh2Fs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ssh2Fs").field("settings", &self.settings).finish_non_exhaustive()
    }
}

impl Ssh2Fs {
    pub fn new(settings: SshSettings) -> Self {
        Self {
            settings,
            connection: Mutex::new(None),
        }
    }

    fn open(&self) -> io::Result<Ssh2Session> {
        let settings = &self.settings;
        let address = (settings.host.as_str(), settings.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(IoKind::NotFound, format!("unable to resolve '{}'", settings.host))
            })?;
        let tcp = TcpStream::connect_timeout(&address, settings.connect_timeout)?;

        let mut session = Session::new().map_err(ssh_error)?;
        session.set_tcp_stream(tcp);
        session.set_timeout(settings.io_timeout.as_millis().min(u32::MAX as u128) as u32);
        session.handshake().map_err(ssh_error)?;

        if let Some(expected) = &settings.host_fingerprint {
            let actual = session
                .host_key_hash(HashType::Sha256)
                .map(hex::encode)
                .ok_or_else(|| io::Error::new(IoKind::Other, "server sent no host key"))?;
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(io::Error::new(
                    IoKind::PermissionDenied,
                    format!("host key {actual} of '{}' does not match the configured fingerprint", settings.host),
                ));
            }
        }

        session
            .userauth_pubkey_file(
                &settings.user,
                settings.key_pub.as_deref(),
                &settings.key_priv,
                settings.key_passphrase.as_ref().map(|pass| pass.as_str()),
            )
            .map_err(|err| {
                let err = ssh_error(err);
                io::Error::new(err.kind(), format!("public key authentication failed: {err}"))
            })?;
        let sftp = session.sftp().map_err(ssh_error)?;
        debug!(
            target: "ferry::storage",
            host = %settings.host,
            port = settings.port,
            user = %settings.user,
            "sftp session established"
        );
        Ok(Ssh2Session { session, sftp })
    }

    fn session(&self) -> io::Result<Arc<Ssh2Session>> {
        let mut connection = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = connection.as_ref() {
            return Ok(Arc::clone(session));
        }
        let session = Arc::new(self.open()?);
        *connection = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Run `op` on the session; a broken connection is dropped so the next
    /// call reconnects.
    fn with<T>(&self, op: impl FnOnce(&Sftp) -> Result<T, ssh2::Error>) -> io::Result<T> {
        let session = self.session()?;
        op(&session.sftp).map_err(|err| {
            let err = ssh_error(err);
            if matches!(err.kind(), IoKind::ConnectionReset | IoKind::TimedOut) {
                self.connection.lock().unwrap_or_else(PoisonError::into_inner).take();
            }
            err
        })
    }
}

fn stat_of(stat: &FileStat) -> SftpStat {
    let kind = if stat.is_file() {
        StorageType::File
    } else if stat.is_dir() {
        StorageType::Path
    } else if stat.file_type().is_symlink() {
        StorageType::Link
    } else {
        StorageType::Special
    };
    SftpStat {
        kind,
        size: stat.size.unwrap_or(0),
        mode: stat.perm.map(|perm| perm & 0o7777),
        uid: stat.uid,
        gid: stat.gid,
        time_modified: stat.mtime.unwrap_or(0) as i64,
    }
}

impl SftpHandle for ssh2::File {
    fn fsync(&mut self) -> io::Result<()> {
        ssh2::File::fsync(self).map_err(ssh_error)
    }

    fn set_stat(&mut self, mode: u32, time_modified: Option<i64>) -> io::Result<()> {
        let time = time_modified.map(|time| time.max(0) as u64);
        self.setstat(FileStat {
            size: None,
            uid: None,
            gid: None,
            perm: Some(mode),
            atime: time,
            mtime: time,
        })
        .map_err(ssh_error)
    }
}

impl SftpFs for Ssh2Fs {
    fn connect(&self) -> io::Result<()> {
        self.session().map(drop)
    }

    fn stat(&self, path: &str, follow_links: bool) -> io::Result<SftpStat> {
        let stat = self.with(|sftp| {
            if follow_links {
                sftp.stat(Path::new(path))
            } else {
                sftp.lstat(Path::new(path))
            }
        })?;
        Ok(stat_of(&stat))
    }

    fn read_dir(&self, path: &str) -> io::Result<Vec<(String, SftpStat)>> {
        let entries = self.with(|sftp| sftp.readdir(Path::new(path)))?;
        Ok(entries
            .iter()
            .filter_map(|(entry, stat)| {
                let name = entry.file_name()?.to_string_lossy().into_owned();
                Some((name, stat_of(stat)))
            })
            .collect())
    }

    fn read_link(&self, path: &str) -> io::Result<String> {
        let target = self.with(|sftp| sftp.readlink(Path::new(path)))?;
        Ok(target.to_string_lossy().into_owned())
    }

    fn open_read(&self, path: &str, offset: u64) -> io::Result<Box<dyn Read + Send>> {
        let mut file = self.with(|sftp| sftp.open(Path::new(path)))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))?;
        }
        Ok(Box::new(file))
    }

    fn create(&self, path: &str, mode: u32) -> io::Result<Box<dyn SftpHandle>> {
        let flags = OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE;
        let file = self.with(|sftp| sftp.open_mode(Path::new(path), flags, mode as i32, OpenType::File))?;
        Ok(Box::new(file))
    }

    fn mkdir(&self, path: &str, mode: u32) -> io::Result<()> {
        self.with(|sftp| sftp.mkdir(Path::new(path), mode as i32))
    }

    fn rmdir(&self, path: &str) -> io::Result<()> {
        self.with(|sftp| sftp.rmdir(Path::new(path)))
    }

    fn unlink(&self, path: &str) -> io::Result<()> {
        self.with(|sftp| sftp.unlink(Path::new(path)))
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        self.with(|sftp| sftp.rename(Path::new(from), Path::new(to), None))
    }

    fn disconnect(&self) -> io::Result<()> {
        let taken = self.connection.lock().unwrap_or_else(PoisonError::into_inner).take();
        match taken {
            Some(session) => session
                .session
                .disconnect(None, "closing", None)
                .map_err(ssh_error),
            None => Ok(()),
        }
    }
}

fn stat_info(stat: &SftpStat, name: &str, link_destination: Option<String>) -> StorageInfo {
    let mut info = StorageInfo::new(stat.kind).with_name(name);
    if stat.kind == StorageType::File {
        info.size = stat.size;
    }
    info.time_modified = stat.time_modified;
    info.mode = stat.mode;
    info.user_id = stat.uid;
    info.group_id = stat.gid;
    info.link_destination = link_destination;
    info
}

fn create_path(fs: &dyn SftpFs, path: &str, mode: u32, error_on_exists: bool, recurse: bool) -> io::Result<()> {
    match fs.mkdir(path, mode) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == IoKind::NotFound && recurse => {
            if let Some(parent) = path::parent(path) {
                create_path(fs, parent, mode, false, true)?;
            }
            fs.mkdir(path, mode)
        }
        // many servers report an existing directory as a generic failure
        Err(err) => match fs.stat(path, true) {
            Ok(_) if error_on_exists => Err(io::Error::new(IoKind::AlreadyExists, "path already exists")),
            Ok(stat) if stat.kind == StorageType::Path => Ok(()),
            _ => Err(err),
        },
    }
}

fn remove_path(fs: &dyn SftpFs, path: &str, recurse: bool) -> io::Result<()> {
    if recurse {
        let entries = match fs.read_dir(path) {
            Ok(entries) => entries,
            Err(err) if err.kind() == IoKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        for (name, stat) in entries {
            let child = path::join(path, &name);
            if stat.kind == StorageType::Path {
                remove_path(fs, &child, true)?;
            } else {
                match fs.unlink(&child) {
                    Err(err) if err.kind() != IoKind::NotFound => return Err(err),
                    _ => {}
                }
            }
        }
    }
    match fs.rmdir(path) {
        Err(err) if err.kind() != IoKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// Rename into place; servers that refuse to overwrite get the old file
/// removed first.
fn replace(fs: &dyn SftpFs, from: &str, to: &str) -> io::Result<()> {
    match fs.rename(from, to) {
        Ok(()) => Ok(()),
        Err(err) => match fs.stat(to, false) {
            Ok(_) => {
                fs.unlink(to)?;
                fs.rename(from, to)
            }
            Err(_) => Err(err),
        },
    }
}

/// Driver for a directory tree on an SFTP server.
#[derive(Clone, Debug)]
pub struct SftpDriver {
    fs: Arc<dyn SftpFs>,
    root: String,
    mode_file: u32,
    mode_path: u32,
}

impl SftpDriver {
    pub fn new(fs: Arc<dyn SftpFs>, root: impl Into<String>) -> Self {
        Self {
            fs,
            root: root.into(),
            mode_file: DEFAULT_MODE_FILE,
            mode_path: DEFAULT_MODE_PATH,
        }
    }

    pub fn with_modes(mut self, mode_file: u32, mode_path: u32) -> Self {
        self.mode_file = mode_file;
        self.mode_path = mode_path;
        self
    }

    /// Open the session now so a bad host or key fails at startup.
    pub async fn connect(self) -> StorageResult<Self> {
        blocking(&self.fs, |fs| fs.connect())
            .await
            .map_err(|e| StorageError::from_io(e, "connect sftp session for", &self.root))?;
        Ok(self)
    }
}

#[async_trait]
impl StorageDriver for SftpDriver {
    fn name(&self) -> &'static str {
        "sftp"
    }

    fn root(&self) -> &str {
        &self.root
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::all().without(Capability::PathSync)
    }

    async fn info(&self, path: &str, follow_links: bool) -> StorageResult<StorageInfo> {
        let target = path.to_string();
        let result = blocking(&self.fs, move |fs| {
            let stat = fs.stat(&target, follow_links)?;
            let link = match stat.kind {
                StorageType::Link => fs.read_link(&target).ok(),
                _ => None,
            };
            Ok((stat, link))
        })
        .await;
        match result {
            Ok((stat, link)) => Ok(stat_info(&stat, "", link)),
            Err(err) if err.kind() == IoKind::NotFound => Ok(StorageInfo::missing()),
            Err(err) => Err(StorageError::from_io(err, "get info for", path)),
        }
    }

    async fn list(&self, path: &str) -> StorageResult<Vec<StorageInfo>> {
        let target = path.to_string();
        blocking(&self.fs, move |fs| {
            let entries = fs.read_dir(&target)?;
            Ok(entries
                .iter()
                .map(|(name, stat)| {
                    let link = match stat.kind {
                        StorageType::Link => fs.read_link(&path::join(&target, name)).ok(),
                        _ => None,
                    };
                    stat_info(stat, name, link)
                })
                .collect())
        })
        .await
        .map_err(|e| StorageError::from_io(e, "list files for path", path))
    }

    async fn open_read(
        &self,
        path: &str,
        options: &ReadOptions,
    ) -> StorageResult<Option<Box<dyn DriverRead>>> {
        let target = path.to_string();
        let offset = options.offset;
        let file = match blocking(&self.fs, move |fs| fs.open_read(&target, offset)).await {
            Ok(file) => file,
            Err(err) if err.kind() == IoKind::NotFound && options.ignore_missing => return Ok(None),
            Err(err) => return Err(StorageError::from_io(err, "open file for read", path)),
        };
        Ok(Some(Box::new(SftpRead {
            file: Some(file),
            path: path.to_string(),
            remaining: options.limit,
        })))
    }

    async fn open_write(
        &self,
        path: &str,
        options: &WriteOptions,
    ) -> StorageResult<Box<dyn DriverWrite>> {
        let temp = if options.atomic {
            format!("{path}{TEMP_SUFFIX}")
        } else {
            path.to_string()
        };
        let mode = options.mode.unwrap_or(self.mode_file);
        let parent = match path::parent(path) {
            Some(parent) if options.create_parent_paths => Some(parent.to_string()),
            _ => None,
        };
        let mode_path = self.mode_path;
        let target = temp.clone();
        let handle = blocking(&self.fs, move |fs| match fs.create(&target, mode) {
            Err(err) if err.kind() == IoKind::NotFound => match &parent {
                Some(parent) => {
                    create_path(fs, parent, mode_path, false, true)?;
                    fs.create(&target, mode)
                }
                None => Err(err),
            },
            result => result,
        })
        .await
        .map_err(|e| StorageError::from_io(e, "open file for write", &temp))?;

        Ok(Box::new(SftpWrite {
            fs: Arc::clone(&self.fs),
            handle: Some(handle),
            path: path.to_string(),
            temp,
            mode,
            options: options.clone(),
            committed: false,
        }))
    }

    async fn remove(&self, path: &str, error_on_missing: bool) -> StorageResult<()> {
        let target = path.to_string();
        match blocking(&self.fs, move |fs| fs.unlink(&target)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == IoKind::NotFound && !error_on_missing => Ok(()),
            Err(err) => Err(StorageError::from_io(err, "remove file", path)),
        }
    }

    async fn path_create(&self, path: &str, options: &PathCreateOptions) -> StorageResult<()> {
        let target = path.to_string();
        let mode = options.mode.unwrap_or(self.mode_path);
        let (error_on_exists, recurse) = (options.error_on_exists, options.recurse);
        blocking(&self.fs, move |fs| create_path(fs, &target, mode, error_on_exists, recurse))
            .await
            .map_err(|e| StorageError::from_io(e, "create path", path))
    }

    async fn path_remove(&self, path: &str, recurse: bool) -> StorageResult<()> {
        let target = path.to_string();
        blocking(&self.fs, move |fs| remove_path(fs, &target, recurse))
            .await
            .map_err(|e| StorageError::from_io(e, "remove path", path))
    }

    async fn close(&self) -> StorageResult<()> {
        blocking(&self.fs, |fs| fs.disconnect())
            .await
            .map_err(|e| StorageError::from_io(e, "disconnect sftp session for", &self.root))
    }
}

struct SftpRead {
    /// Lent to the blocking pool during each read.
    file: Option<Box<dyn Read + Send>>,
    path: String,
    remaining: Option<u64>,
}

#[async_trait]
impl DriverRead for SftpRead {
    async fn read(&mut self) -> StorageResult<Option<Vec<u8>>> {
        let want = match self.remaining {
            Some(0) => return Ok(None),
            Some(remaining) => (remaining as usize).min(CHUNK_SIZE),
            None => CHUNK_SIZE,
        };
        let Some(mut file) = self.file.take() else {
            return Err(StorageError::Io(format!("unable to read '{}': stream failed earlier", self.path)));
        };
        let (file, result) = tokio::task::spawn_blocking(move || {
            let mut buffer = vec![0u8; want];
            let result = file.read(&mut buffer).map(|read| {
                buffer.truncate(read);
                buffer
            });
            (file, result)
        })
        .await
        .map_err(|e| StorageError::Io(format!("unable to read '{}': {e}", self.path)))?;
        self.file = Some(file);

        let buffer = result.map_err(|e| StorageError::from_io(e, "read", &self.path))?;
        if buffer.is_empty() {
            return Ok(None);
        }
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= buffer.len() as u64;
        }
        Ok(Some(buffer))
    }

    async fn close(self: Box<Self>) -> StorageResult<()> {
        Ok(())
    }
}

/// Write stream; an uncommitted atomic write removes its temporary file on drop.
struct SftpWrite {
    fs: Arc<dyn SftpFs>,
    handle: Option<Box<dyn SftpHandle>>,
    path: String,
    temp: String,
    mode: u32,
    options: WriteOptions,
    committed: bool,
}

impl SftpWrite {
    fn closed(&self, action: &str) -> StorageError {
        StorageError::Io(format!("unable to {action} '{}': already closed", self.path))
    }
}

#[async_trait]
impl DriverWrite for SftpWrite {
    async fn write(&mut self, data: &[u8]) -> StorageResult<()> {
        let mut handle = self.handle.take().ok_or_else(|| self.closed("write"))?;
        let data = data.to_vec();
        let (handle, result) = tokio::task::spawn_blocking(move || {
            let result = handle.write_all(&data);
            (handle, result)
        })
        .await
        .map_err(|e| StorageError::Io(format!("unable to write '{}': {e}", self.temp)))?;
        self.handle = Some(handle);
        result.map_err(|e| StorageError::from_io(e, "write", &self.temp))
    }

    async fn close(mut self: Box<Self>) -> StorageResult<()> {
        let mut handle = self.handle.take().ok_or_else(|| self.closed("close"))?;
        if self.options.user.is_some() || self.options.group.is_some() {
            debug!(target: "ferry::storage", path = %self.path, "ownership is not set over sftp");
        }
        let (temp, path, mode) = (self.temp.clone(), self.path.clone(), self.mode);
        let (sync, atomic, time) = (self.options.sync_file, self.options.atomic, self.options.time_modified);
        let result = blocking(&self.fs, move |fs| {
            handle.flush()?;
            if sync {
                handle.fsync()?;
            }
            // the server umask may have narrowed the requested mode
            handle.set_stat(mode, time)?;
            drop(handle);
            if atomic {
                replace(fs, &temp, &path)?;
            }
            Ok(())
        })
        .await;
        result.map_err(|e| StorageError::from_io(e, "close", &self.temp))?;
        self.committed = true;
        debug!(target: "ferry::storage", path = %self.path, atomic = self.options.atomic, "file written over sftp");
        Ok(())
    }

    async fn abort(mut self: Box<Self>) -> StorageResult<()> {
        self.handle = None;
        if !self.options.atomic {
            return Ok(());
        }
        self.committed = true;
        let temp = self.temp.clone();
        match blocking(&self.fs, move |fs| fs.unlink(&temp)).await {
            Err(err) if err.kind() != IoKind::NotFound => {
                Err(StorageError::from_io(err, "remove temporary file", &self.temp))
            }
            _ => Ok(()),
        }
    }
}

impl Drop for SftpWrite {
    fn drop(&mut self) {
        if self.committed || !self.options.atomic {
            return;
        }
        self.handle = None;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(target: "ferry::storage", temp = %self.temp, "no runtime to remove abandoned temporary file");
            return;
        };
        let fs = Arc::clone(&self.fs);
        let temp = std::mem::take(&mut self.temp);
        runtime.spawn_blocking(move || match fs.unlink(&temp) {
            Err(err) if err.kind() != IoKind::NotFound => {
                warn!(target: "ferry::storage", %temp, error = %err, "unable to remove abandoned temporary file");
            }
            _ => {}
        });
    }
}
