use std::fs::Metadata;
use std::io::ErrorKind as IoKind;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use ferry_types::{CapabilitySet, StorageError, StorageInfo, StorageResult, StorageType};
use nix::unistd::{Gid, Group, Uid, User};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::driver::{
    DriverRead, DriverWrite, PathCreateOptions, ReadOptions, StorageDriver, WriteOptions,
    DEFAULT_MODE_FILE, DEFAULT_MODE_PATH,
};
use crate::path;

/// Suffix of the temporary name an atomic write goes to before the rename.
pub const TEMP_SUFFIX: &str = ".ferry.tmp";

const CHUNK_SIZE: usize = 64 * 1024;

/// Local filesystem driver.
#[derive(Clone, Debug)]
pub struct PosixDriver {
    root: String,
    mode_file: u32,
    mode_path: u32,
}

impl PosixDriver {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
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

    async fn create_parent(&self, path: &str) -> StorageResult<()> {
        if let Some(parent) = path::parent(path) {
            fs::DirBuilder::new()
                .recursive(true)
                .mode(self.mode_path)
                .create(parent)
                .await
                .map_err(|e| StorageError::from_io(e, "create path", parent))?;
        }
        Ok(())
    }
}

fn user_name(uid: u32) -> Option<String> {
    User::from_uid(Uid::from_raw(uid)).ok().flatten().map(|user| user.name)
}

fn group_name(gid: u32) -> Option<String> {
    Group::from_gid(Gid::from_raw(gid)).ok().flatten().map(|group| group.name)
}

fn resolve_owner(user: Option<&str>, group: Option<&str>) -> StorageResult<(Option<Uid>, Option<Gid>)> {
    let uid = match user {
        Some(name) => Some(
            User::from_name(name)
                .map_err(|e| StorageError::Io(format!("unable to look up user '{name}': {e}")))?
                .ok_or_else(|| StorageError::Config(format!("unknown user '{name}'")))?
                .uid,
        ),
        None => None,
    };
    let gid = match group {
        Some(name) => Some(
            Group::from_name(name)
                .map_err(|e| StorageError::Io(format!("unable to look up group '{name}': {e}")))?
                .ok_or_else(|| StorageError::Config(format!("unknown group '{name}'")))?
                .gid,
        ),
        None => None,
    };
    Ok((uid, gid))
}

async fn metadata_info(path: &str, name: &str, metadata: &Metadata) -> StorageInfo {
    let file_type = metadata.file_type();
    let kind = if file_type.is_file() {
        StorageType::File
    } else if file_type.is_dir() {
        StorageType::Path
    } else if file_type.is_symlink() {
        StorageType::Link
    } else {
        StorageType::Special
    };

    let mut info = StorageInfo::new(kind).with_name(name);
    if kind == StorageType::File {
        info.size = metadata.len();
    }
    info.time_modified = metadata.mtime();
    info.user_id = Some(metadata.uid());
    info.user = user_name(metadata.uid());
    info.group_id = Some(metadata.gid());
    info.group = group_name(metadata.gid());
    info.mode = Some(metadata.mode() & 0o7777);
    if kind == StorageType::Link {
        info.link_destination = fs::read_link(path)
            .await
            .ok()
            .map(|target| target.to_string_lossy().into_owned());
    }
    info
}

/// Flush a directory entry to disk.
async fn sync_path(path: &str) -> StorageResult<()> {
    let dir = File::open(path)
        .await
        .map_err(|e| StorageError::from_io(e, "open path for sync", path))?;
    dir.sync_all()
        .await
        .map_err(|e| StorageError::from_io(e, "sync path", path))
}

#[async_trait]
impl StorageDriver for PosixDriver {
    fn name(&self) -> &'static str {
        "posix"
    }

    fn root(&self) -> &str {
        &self.root
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::all()
    }

    async fn info(&self, path: &str, follow_links: bool) -> StorageResult<StorageInfo> {
        let result = if follow_links {
            fs::metadata(path).await
        } else {
            fs::symlink_metadata(path).await
        };
        match result {
            Ok(metadata) => Ok(metadata_info(path, "", &metadata).await),
            Err(err) if err.kind() == IoKind::NotFound => Ok(StorageInfo::missing()),
            Err(err) => Err(StorageError::from_io(err, "get info for", path)),
        }
    }

    async fn list(&self, path: &str) -> StorageResult<Vec<StorageInfo>> {
        let mut dir = fs::read_dir(path)
            .await
            .map_err(|e| StorageError::from_io(e, "list files for path", path))?;
        let mut entries = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| StorageError::from_io(e, "list files for path", path))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let full = path::join(path, &name);
            match fs::symlink_metadata(&full).await {
                Ok(metadata) => entries.push(metadata_info(&full, &name, &metadata).await),
                // removed between the directory read and the stat
                Err(err) if err.kind() == IoKind::NotFound => continue,
                Err(err) => return Err(StorageError::from_io(err, "get info for", &full)),
            }
        }
        Ok(entries)
    }

    async fn open_read(
        &self,
        path: &str,
        options: &ReadOptions,
    ) -> StorageResult<Option<Box<dyn DriverRead>>> {
        let mut file = match File::open(path).await {
            Ok(file) => file,
            Err(err) if err.kind() == IoKind::NotFound && options.ignore_missing => return Ok(None),
            Err(err) => return Err(StorageError::from_io(err, "open file for read", path)),
        };
        if options.offset > 0 {
            file.seek(std::io::SeekFrom::Start(options.offset))
                .await
                .map_err(|e| StorageError::from_io(e, "seek in file", path))?;
        }
        Ok(Some(Box::new(PosixRead {
            file,
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
        let mut open = OpenOptions::new();
        open.write(true).create(true).truncate(true).mode(mode);
        let file = match open.open(&temp).await {
            Ok(file) => file,
            Err(err) if err.kind() == IoKind::NotFound && options.create_parent_paths => {
                self.create_parent(path).await?;
                open.open(&temp)
                    .await
                    .map_err(|e| StorageError::from_io(e, "open file for write", &temp))?
            }
            Err(err) => return Err(StorageError::from_io(err, "open file for write", &temp)),
        };
        // the umask may have narrowed the requested mode
        file.set_permissions(std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|e| StorageError::from_io(e, "set mode on", &temp))?;

        Ok(Box::new(PosixWrite {
            file: Some(file),
            path: path.to_string(),
            temp,
            options: options.clone(),
            committed: false,
        }))
    }

    async fn remove(&self, path: &str, error_on_missing: bool) -> StorageResult<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == IoKind::NotFound && !error_on_missing => Ok(()),
            Err(err) => Err(StorageError::from_io(err, "remove file", path)),
        }
    }

    async fn path_create(&self, path: &str, options: &PathCreateOptions) -> StorageResult<()> {
        if options.error_on_exists && fs::symlink_metadata(path).await.is_ok() {
            return Err(StorageError::AlreadyExists(format!(
                "unable to create path '{path}': already exists"
            )));
        }
        let result = fs::DirBuilder::new()
            .recursive(options.recurse)
            .mode(options.mode.unwrap_or(self.mode_path))
            .create(path)
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == IoKind::AlreadyExists && !options.error_on_exists => Ok(()),
            Err(err) => Err(StorageError::from_io(err, "create path", path)),
        }
    }

    async fn path_remove(&self, path: &str, recurse: bool) -> StorageResult<()> {
        let result = if recurse {
            fs::remove_dir_all(path).await
        } else {
            fs::remove_dir(path).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == IoKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::from_io(err, "remove path", path)),
        }
    }

    async fn path_sync(&self, path: &str) -> StorageResult<()> {
        sync_path(path).await
    }
}

struct PosixRead {
    file: File,
    path: String,
    remaining: Option<u64>,
}

#[async_trait]
impl DriverRead for PosixRead {
    async fn read(&mut self) -> StorageResult<Option<Vec<u8>>> {
        let want = match self.remaining {
            Some(0) => return Ok(None),
            Some(remaining) => (remaining as usize).min(CHUNK_SIZE),
            None => CHUNK_SIZE,
        };
        let mut buffer = vec![0u8; want];
        let read = self
            .file
            .read(&mut buffer)
            .await
            .map_err(|e| StorageError::from_io(e, "read", &self.path))?;
        if read == 0 {
            return Ok(None);
        }
        buffer.truncate(read);
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= read as u64;
        }
        Ok(Some(buffer))
    }

    async fn close(self: Box<Self>) -> StorageResult<()> {
        Ok(())
    }
}

/// Write stream; an uncommitted atomic write removes its temporary file on drop.
struct PosixWrite {
    file: Option<File>,
    path: String,
    temp: String,
    options: WriteOptions,
    committed: bool,
}

impl PosixWrite {
    async fn commit(&mut self) -> StorageResult<()> {
        let Some(mut file) = self.file.take() else {
            return Err(StorageError::Io(format!("unable to close '{}': already closed", self.path)));
        };
        file.flush()
            .await
            .map_err(|e| StorageError::from_io(e, "flush", &self.temp))?;
        if self.options.sync_file {
            file.sync_all()
                .await
                .map_err(|e| StorageError::from_io(e, "sync file", &self.temp))?;
        }

        if self.options.user.is_some() || self.options.group.is_some() {
            let (uid, gid) = resolve_owner(self.options.user.as_deref(), self.options.group.as_deref())?;
            nix::unistd::chown(self.temp.as_str(), uid, gid).map_err(|e| {
                StorageError::from_io(std::io::Error::from(e), "set ownership for", &self.temp)
            })?;
        }
        if let Some(time) = self.options.time_modified {
            let modified = SystemTime::UNIX_EPOCH + Duration::from_secs(time.max(0) as u64);
            let std_file = file.into_std().await;
            std_file
                .set_modified(modified)
                .map_err(|e| StorageError::from_io(e, "set modification time for", &self.temp))?;
        } else {
            drop(file);
        }

        if self.options.atomic {
            fs::rename(&self.temp, &self.path)
                .await
                .map_err(|e| StorageError::from_io(e, "move temporary file to", &self.path))?;
        }
        self.committed = true;

        if self.options.sync_path {
            if let Some(parent) = path::parent(&self.path) {
                sync_path(parent).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DriverWrite for PosixWrite {
    async fn write(&mut self, data: &[u8]) -> StorageResult<()> {
        let file = self.file.as_mut().ok_or_else(|| {
            StorageError::Io(format!("unable to write '{}': already closed", self.path))
        })?;
        file.write_all(data)
            .await
            .map_err(|e| StorageError::from_io(e, "write", &self.temp))
    }

    async fn close(mut self: Box<Self>) -> StorageResult<()> {
        self.commit().await?;
        debug!(target: "ferry::storage", path = %self.path, atomic = self.options.atomic, "file written");
        Ok(())
    }

    async fn abort(mut self: Box<Self>) -> StorageResult<()> {
        self.file = None;
        if self.options.atomic {
            self.committed = true;
            match fs::remove_file(&self.temp).await {
                Ok(()) => {}
                Err(err) if err.kind() == IoKind::NotFound => {}
                Err(err) => return Err(StorageError::from_io(err, "remove temporary file", &self.temp)),
            }
        }
        Ok(())
    }
}

impl Drop for PosixWrite {
    fn drop(&mut self) {
        if self.committed || !self.options.atomic {
            return;
        }
        self.file = None;
        if let Err(err) = std::fs::remove_file(&self.temp) {
            if err.kind() != IoKind::NotFound {
                warn!(target: "ferry::storage", temp = %self.temp, error = %err, "unable to remove abandoned temporary file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_types::ErrorKind;

    fn driver(dir: &tempfile::TempDir) -> (PosixDriver, String) {
        let root = dir.path().to_string_lossy().into_owned();
        (PosixDriver::new(root.clone()), root)
    }

    async fn put(driver: &PosixDriver, path: &str, data: &[u8], options: &WriteOptions) {
        let mut write = driver.open_write(path, options).await.unwrap();
        write.write(data).await.unwrap();
        write.close().await.unwrap();
    }

    async fn get(driver: &PosixDriver, path: &str, options: &ReadOptions) -> Option<Vec<u8>> {
        let mut read = driver.open_read(path, options).await.unwrap()?;
        let mut data = Vec::new();
        while let Some(chunk) = read.read().await.unwrap() {
            data.extend(chunk);
        }
        read.close().await.unwrap();
        Some(data)
    }

    #[tokio::test]
    async fn atomic_write_renames_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let (driver, root) = driver(&dir);
        let path = format!("{root}/sub/dir/file");

        let mut write = driver.open_write(&path, &WriteOptions::default()).await.unwrap();
        write.write(&vec![7u8; 200_000]).await.unwrap();
        assert!(!driver.info(&path, true).await.unwrap().exists());
        assert!(driver.info(&format!("{path}{TEMP_SUFFIX}"), true).await.unwrap().is_file());
        write.close().await.unwrap();

        let info = driver.info(&path, true).await.unwrap();
        assert!(info.is_file());
        assert_eq!(info.size, 200_000);
        assert_eq!(info.mode, Some(DEFAULT_MODE_FILE));
        assert!(!driver.info(&format!("{path}{TEMP_SUFFIX}"), true).await.unwrap().exists());
    }

    #[tokio::test]
    async fn abandoned_write_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (driver, root) = driver(&dir);
        let path = format!("{root}/file");

        let mut write = driver.open_write(&path, &WriteOptions::default()).await.unwrap();
        write.write(b"partial").await.unwrap();
        drop(write);
        assert!(driver.list(&root).await.unwrap().is_empty());

        let mut write = driver.open_write(&path, &WriteOptions::default()).await.unwrap();
        write.write(b"partial").await.unwrap();
        write.abort().await.unwrap();
        assert!(driver.list(&root).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ranged_and_missing_reads() {
        let dir = tempfile::tempdir().unwrap();
        let (driver, root) = driver(&dir);
        let path = format!("{root}/file");
        put(&driver, &path, b"0123456789", &WriteOptions::new().fast()).await;

        assert_eq!(get(&driver, &path, &ReadOptions::new()).await.unwrap(), b"0123456789");
        assert_eq!(get(&driver, &path, &ReadOptions::new().range(3, Some(4))).await.unwrap(), b"3456");
        assert_eq!(get(&driver, &path, &ReadOptions::new().range(9, Some(10))).await.unwrap(), b"9");
        assert!(get(&driver, &format!("{root}/none"), &ReadOptions::new().ignore_missing()).await.is_none());

        let err = driver.open_read(&format!("{root}/none"), &ReadOptions::new()).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.message().contains("/none"));
    }

    #[tokio::test]
    async fn mode_and_time_modified() {
        let dir = tempfile::tempdir().unwrap();
        let (driver, root) = driver(&dir);
        let path = format!("{root}/file");
        put(&driver, &path, b"x", &WriteOptions::new().mode(0o600).time_modified(1_700_000_000)).await;

        let info = driver.info(&path, true).await.unwrap();
        assert_eq!(info.mode, Some(0o600));
        assert_eq!(info.time_modified, 1_700_000_000);
    }

    #[tokio::test]
    async fn missing_parent_without_create() {
        let dir = tempfile::tempdir().unwrap();
        let (driver, root) = driver(&dir);
        let err = driver
            .open_write(&format!("{root}/a/b"), &WriteOptions::new().no_parent_paths())
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn list_and_links() {
        let dir = tempfile::tempdir().unwrap();
        let (driver, root) = driver(&dir);
        put(&driver, &format!("{root}/file"), b"abc", &WriteOptions::default()).await;
        driver.path_create(&format!("{root}/dir"), &PathCreateOptions::default()).await.unwrap();
        std::os::unix::fs::symlink("file", format!("{root}/link")).unwrap();

        let mut entries = driver.list(&root).await.unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        let kinds: Vec<_> = entries.iter().map(|i| (i.name.as_str(), i.kind)).collect();
        assert_eq!(
            kinds,
            vec![("dir", StorageType::Path), ("file", StorageType::File), ("link", StorageType::Link)]
        );
        assert_eq!(entries[2].link_destination.as_deref(), Some("file"));
        assert!(driver.info(&format!("{root}/link"), true).await.unwrap().is_file());

        let err = driver.list(&format!("{root}/none")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn path_operations() {
        let dir = tempfile::tempdir().unwrap();
        let (driver, root) = driver(&dir);
        let path = format!("{root}/a/b");

        let strict = PathCreateOptions { error_on_exists: true, recurse: false, mode: None };
        let err = driver.path_create(&path, &strict).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        driver.path_create(&path, &PathCreateOptions::default()).await.unwrap();
        driver.path_create(&path, &PathCreateOptions::default()).await.unwrap();
        let err = driver.path_create(&path, &strict).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(driver.info(&path, true).await.unwrap().mode, Some(DEFAULT_MODE_PATH));

        driver.path_sync(&path).await.unwrap();
        put(&driver, &format!("{path}/f"), b"x", &WriteOptions::default()).await;
        assert!(driver.path_remove(&format!("{root}/a"), false).await.is_err());
        driver.path_remove(&format!("{root}/a"), true).await.unwrap();
        driver.path_remove(&format!("{root}/a"), true).await.unwrap();
        assert!(!driver.info(&path, true).await.unwrap().exists());

        driver.remove(&format!("{root}/none"), false).await.unwrap();
        assert_eq!(
            driver.remove(&format!("{root}/none"), true).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }
}
