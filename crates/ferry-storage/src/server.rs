use std::sync::Arc;

use async_trait::async_trait;
use ferry_protocol::{commands, Block, CommandHandler, Param, Params, ServerSession, MAX_BLOCK_SIZE};
use ferry_types::{StorageError, StorageResult};
use tracing::debug;

use crate::driver::{PathCreateOptions, ReadOptions, StorageDriver, WriteOptions};
use crate::path;
use crate::wire::encode_info;

/// Serves storage commands against a local driver.
///
/// This is the far end of [`crate::drivers::RemoteDriver`]: every command
/// maps to one driver call on raw bytes. Filters run on the requesting side
/// only, so data crosses the channel in its stored form.
#[derive(Debug, Clone)]
pub struct StorageHandler {
    driver: Arc<dyn StorageDriver>,
}

impl StorageHandler {
    pub fn new(driver: Arc<dyn StorageDriver>) -> Self {
        Self { driver }
    }

    /// Paths arrive already resolved by the peer; they must still stay in
    /// this driver's root.
    fn checked<'a>(&self, path: &'a str) -> StorageResult<&'a str> {
        path::validate(path)?;
        if !path.starts_with('/') || !path::within_root(self.driver.root(), path) {
            return Err(StorageError::PathValidation(format!(
                "absolute path '{path}' is not in base path '{}'",
                self.driver.root()
            )));
        }
        Ok(path)
    }

    async fn open_read(&self, params: &mut Params<'_>, session: &mut ServerSession) -> StorageResult<()> {
        let path = self.checked(params.str()?)?;
        let mut options = ReadOptions::new();
        options.ignore_missing = params.bool()?;
        options.offset = params.u64()?;
        options.limit = params.opt_u64()?;

        let Some(mut reader) = self.driver.open_read(path, &options).await? else {
            return session.respond(vec![Param::Bool(false)]).await;
        };
        session.respond_stream(vec![Param::Bool(true)]).await?;
        let mut sent = 0u64;
        while let Some(chunk) = reader.read().await? {
            for block in chunk.chunks(MAX_BLOCK_SIZE) {
                session.write_block(block).await?;
            }
            sent += chunk.len() as u64;
        }
        session.write_end().await?;
        reader.close().await?;
        debug!(target: "ferry::storage", %path, bytes = sent, "served read");
        session.respond(Vec::new()).await
    }

    async fn open_write(&self, params: &mut Params<'_>, session: &mut ServerSession) -> StorageResult<()> {
        let path = self.checked(params.str()?)?;
        let options = WriteOptions {
            mode: params.opt_u32()?,
            user: params.opt_str()?.map(str::to_string),
            group: params.opt_str()?.map(str::to_string),
            time_modified: params.opt_i64()?,
            create_parent_paths: params.bool()?,
            sync_file: params.bool()?,
            sync_path: params.bool()?,
            atomic: params.bool()?,
            compressible: false,
        };

        let mut writer = self.driver.open_write(path, &options).await?;
        session.respond(Vec::new()).await?;

        let mut received = 0u64;
        loop {
            match session.read_block().await? {
                Block::Data(data) => {
                    if let Err(err) = writer.write(&data).await {
                        drain(session).await?;
                        let _ = writer.abort().await;
                        return Err(err);
                    }
                    received += data.len() as u64;
                }
                Block::End => {
                    writer.close().await?;
                    debug!(target: "ferry::storage", %path, bytes = received, "served write");
                    return session.respond(Vec::new()).await;
                }
                Block::Abort | Block::Error => {
                    writer.abort().await?;
                    debug!(target: "ferry::storage", %path, "write aborted by peer");
                    return session.respond(Vec::new()).await;
                }
            }
        }
    }
}

/// Consume the rest of a write stream after a local failure, so the error
/// frame lands after the peer's final block.
async fn drain(session: &mut ServerSession) -> StorageResult<()> {
    loop {
        match session.read_block().await? {
            Block::Data(_) => continue,
            _ => return Ok(()),
        }
    }
}

#[async_trait]
impl CommandHandler for StorageHandler {
    async fn handle(&self, command: &str, params: Vec<Param>, session: &mut ServerSession) -> StorageResult<()> {
        let mut params = Params::new(&params);
        match command {
            commands::STORAGE_FEATURE => {
                session
                    .respond(vec![
                        Param::from(self.driver.root()),
                        Param::UInt(self.driver.capabilities().bits().into()),
                    ])
                    .await
            }
            commands::STORAGE_INFO => {
                let path = self.checked(params.str()?)?;
                let info = self.driver.info(path, params.bool()?).await?;
                session.respond(vec![encode_info(&info)]).await
            }
            commands::STORAGE_LIST => {
                let path = self.checked(params.str()?)?;
                let entries = self.driver.list(path).await?;
                session
                    .respond(vec![Param::List(entries.iter().map(encode_info).collect())])
                    .await
            }
            commands::STORAGE_OPEN_READ => self.open_read(&mut params, session).await,
            commands::STORAGE_OPEN_WRITE => self.open_write(&mut params, session).await,
            commands::STORAGE_REMOVE => {
                let path = self.checked(params.str()?)?;
                self.driver.remove(path, params.bool()?).await?;
                session.respond(Vec::new()).await
            }
            commands::STORAGE_PATH_CREATE => {
                let path = self.checked(params.str()?)?;
                let options = PathCreateOptions {
                    mode: params.opt_u32()?,
                    error_on_exists: params.bool()?,
                    recurse: params.bool()?,
                };
                self.driver.path_create(path, &options).await?;
                session.respond(Vec::new()).await
            }
            commands::STORAGE_PATH_REMOVE => {
                let path = self.checked(params.str()?)?;
                self.driver.path_remove(path, params.bool()?).await?;
                session.respond(Vec::new()).await
            }
            commands::STORAGE_PATH_SYNC => {
                let path = self.checked(params.str()?)?;
                self.driver.path_sync(path).await?;
                session.respond(Vec::new()).await
            }
            other => Err(StorageError::CapabilityUnsupported(format!(
                "invalid command '{other}'"
            ))),
        }
    }
}
