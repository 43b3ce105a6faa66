use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use ferry_protocol::{commands, Param, Params, ProtocolClient, MAX_BLOCK_SIZE};
use ferry_transport::{connect_tcp, BoxChannel, ExecChannel, ExecProcess, TlsConnector, TransportConfig};
use ferry_types::{CapabilitySet, StorageError, StorageInfo, StorageResult};
use tracing::{debug, warn};

use crate::driver::{DriverRead, DriverWrite, PathCreateOptions, ReadOptions, StorageDriver, WriteOptions};
use crate::wire::decode_info;

/// Idle channels kept for reuse per remote.
const MAX_IDLE: usize = 4;

/// Time a remote process gets to exit after `exit` before it is killed.
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// A fresh channel to a peer, as produced by a [`Connector`].
pub struct Link {
    /// Peer name used in error messages.
    pub peer: String,
    pub channel: BoxChannel,
    /// Set when the peer is a child process that must be reaped on close.
    pub process: Option<ExecProcess>,
}

impl Link {
    pub fn new(peer: impl Into<String>, channel: BoxChannel) -> Self {
        Self {
            peer: peer.into(),
            channel,
            process: None,
        }
    }
}

/// Opens a fresh channel to a peer serving the storage protocol.
#[async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug {
    async fn connect(&self) -> StorageResult<Link>;
}

/// Runs a command (typically `ssh host ferry remote`) and talks over its
/// stdin and stdout.
#[derive(Debug, Clone)]
pub struct ExecConnector {
    argv: Vec<String>,
}

impl ExecConnector {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

#[async_trait]
impl Connector for ExecConnector {
    async fn connect(&self) -> StorageResult<Link> {
        let (channel, process) = ExecChannel::spawn(&self.argv)?;
        Ok(Link {
            peer: channel.command().to_string(),
            channel: Box::new(channel),
            process: Some(process),
        })
    }
}

/// Connects to a listening remote over TCP, optionally wrapped in TLS.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
    transport: TransportConfig,
    tls: Option<TlsConnector>,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16, transport: TransportConfig) -> Self {
        Self {
            host: host.into(),
            port,
            transport,
            tls: None,
        }
    }

    pub fn with_tls(mut self, tls: TlsConnector) -> Self {
        self.tls = Some(tls);
        self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> StorageResult<Link> {
        let peer = format!("{}:{}", self.host, self.port);
        // TlsStream::poll_shutdown sends close_notify, so the protocol
        // client's shutdown is an orderly TLS close.
        let channel: BoxChannel = match &self.tls {
            Some(tls) => Box::new(tls.connect(&self.host, self.port, &self.transport).await?),
            None => Box::new(connect_tcp(&self.host, self.port, &self.transport).await?),
        };
        Ok(Link::new(peer, channel))
    }
}

/// A protocol client and, for exec peers, the process serving it.
#[derive(Debug)]
struct Session {
    client: ProtocolClient,
    process: Option<ExecProcess>,
}

impl Session {
    /// Send `exit`, shut the channel down, then reap the peer process.
    async fn close(self) -> StorageResult<()> {
        let peer = self.client.peer().to_string();
        self.client.close().await;
        if let Some(process) = self.process {
            let status = process.wait(EXIT_GRACE).await?;
            if !status.success() {
                return Err(StorageError::Connectivity(format!(
                    "remote '{peer}' exited with {status}"
                )));
            }
        }
        debug!(target: "ferry::storage", %peer, "remote channel closed");
        Ok(())
    }
}

/// Protocol clients for one remote. A client serves one request at a time,
/// so concurrent operations each check out their own.
#[derive(Debug)]
struct ClientPool {
    connector: Arc<dyn Connector>,
    idle: Mutex<Vec<Session>>,
}

impl ClientPool {
    async fn checkout(&self) -> StorageResult<Session> {
        let idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop();
        if let Some(session) = idle {
            return Ok(session);
        }
        let link = self.connector.connect().await?;
        let client = ProtocolClient::open(link.peer, link.channel).await?;
        debug!(target: "ferry::storage", peer = client.peer(), "remote channel open");
        Ok(Session { client, process: link.process })
    }

    /// Return a session for reuse. Broken sessions are dropped, which kills
    /// an exec peer; surplus healthy ones are closed in the background.
    fn checkin(&self, session: Session) {
        if !session.client.is_healthy() {
            warn!(target: "ferry::storage", peer = session.client.peer(), "discarding broken remote channel");
            return;
        }
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < MAX_IDLE {
            idle.push(session);
        } else {
            drop(idle);
            tokio::spawn(async move {
                if let Err(err) = session.close().await {
                    warn!(target: "ferry::storage", error = %err, "surplus remote channel closed badly");
                }
            });
        }
    }

    /// Close every idle session, reporting the first failure. Sessions
    /// still checked out are killed when dropped.
    async fn close(&self) -> StorageResult<()> {
        let sessions = std::mem::take(&mut *self.idle.lock().unwrap_or_else(PoisonError::into_inner));
        let mut result = Ok(());
        for session in sessions {
            if let Err(err) = session.close().await {
                warn!(target: "ferry::storage", error = %err, "remote channel closed badly");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }
}

/// Driver that forwards every operation to a peer's [`crate::StorageHandler`].
///
/// The peer's root and capability set are adopted at connect time, so the
/// local facade rejects unsupported calls before they cross the channel.
/// Errors raised on the peer keep their kind here.
#[derive(Debug)]
pub struct RemoteDriver {
    pool: Arc<ClientPool>,
    root: String,
    capabilities: CapabilitySet,
}

impl RemoteDriver {
    pub async fn connect(connector: Arc<dyn Connector>) -> StorageResult<Self> {
        let pool = Arc::new(ClientPool {
            connector,
            idle: Mutex::new(Vec::new()),
        });
        let mut session = pool.checkout().await?;
        let result = session.client.request(commands::STORAGE_FEATURE, Vec::new()).await;
        let peer = session.client.peer().to_string();
        pool.checkin(session);

        let values = result?;
        let mut params = Params::new(&values);
        let root = params.str()?.to_string();
        let bits = params.u64()?;
        let bits = u16::try_from(bits).map_err(|_| {
            StorageError::ProtocolFraming(format!("capability set {bits:#x} out of range"))
        })?;
        let capabilities = CapabilitySet::from_bits(bits);
        debug!(target: "ferry::storage", %peer, %root, capabilities = bits, "remote storage ready");
        Ok(Self { pool, root, capabilities })
    }

    async fn request(&self, command: &str, params: Vec<Param>) -> StorageResult<Vec<Param>> {
        let mut session = self.pool.checkout().await?;
        let result = session.client.request(command, params).await;
        self.pool.checkin(session);
        Ok(result?)
    }
}

fn first(values: &[Param]) -> StorageResult<&Param> {
    values
        .first()
        .ok_or_else(|| StorageError::ProtocolFraming("empty response from remote".into()))
}

#[async_trait]
impl StorageDriver for RemoteDriver {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn root(&self) -> &str {
        &self.root
    }

    fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    async fn info(&self, path: &str, follow_links: bool) -> StorageResult<StorageInfo> {
        let values = self
            .request(commands::STORAGE_INFO, vec![path.into(), follow_links.into()])
            .await?;
        Ok(decode_info(first(&values)?)?)
    }

    async fn list(&self, path: &str) -> StorageResult<Vec<StorageInfo>> {
        let values = self.request(commands::STORAGE_LIST, vec![path.into()]).await?;
        let entries = Params::new(&values).list()?;
        entries
            .iter()
            .map(|entry| decode_info(entry).map_err(StorageError::from))
            .collect()
    }

    async fn open_read(
        &self,
        path: &str,
        options: &ReadOptions,
    ) -> StorageResult<Option<Box<dyn DriverRead>>> {
        let params = vec![
            path.into(),
            options.ignore_missing.into(),
            options.offset.into(),
            Param::opt_u64(options.limit),
        ];
        let mut session = self.pool.checkout().await?;
        let result = session.client.request(commands::STORAGE_OPEN_READ, params).await;
        let values = match result {
            Ok(values) => values,
            Err(err) => {
                self.pool.checkin(session);
                return Err(err.into());
            }
        };
        match first(&values)? {
            Param::Bool(true) => Ok(Some(Box::new(RemoteRead {
                pool: Arc::clone(&self.pool),
                session: Some(session),
            }))),
            _ => {
                self.pool.checkin(session);
                Ok(None)
            }
        }
    }

    async fn open_write(
        &self,
        path: &str,
        options: &WriteOptions,
    ) -> StorageResult<Box<dyn DriverWrite>> {
        let params = vec![
            path.into(),
            options.mode.map_or(Param::Null, Param::from),
            Param::opt_str(options.user.as_deref()),
            Param::opt_str(options.group.as_deref()),
            options.time_modified.map_or(Param::Null, Param::from),
            options.create_parent_paths.into(),
            options.sync_file.into(),
            options.sync_path.into(),
            options.atomic.into(),
        ];
        let mut session = self.pool.checkout().await?;
        if let Err(err) = session.client.request(commands::STORAGE_OPEN_WRITE, params).await {
            self.pool.checkin(session);
            return Err(err.into());
        }
        Ok(Box::new(RemoteWrite {
            pool: Arc::clone(&self.pool),
            session: Some(session),
        }))
    }

    async fn remove(&self, path: &str, error_on_missing: bool) -> StorageResult<()> {
        self.request(commands::STORAGE_REMOVE, vec![path.into(), error_on_missing.into()])
            .await?;
        Ok(())
    }

    async fn path_create(&self, path: &str, options: &PathCreateOptions) -> StorageResult<()> {
        let params = vec![
            path.into(),
            options.mode.map_or(Param::Null, Param::from),
            options.error_on_exists.into(),
            options.recurse.into(),
        ];
        self.request(commands::STORAGE_PATH_CREATE, params).await?;
        Ok(())
    }

    async fn path_remove(&self, path: &str, recurse: bool) -> StorageResult<()> {
        self.request(commands::STORAGE_PATH_REMOVE, vec![path.into(), recurse.into()])
            .await?;
        Ok(())
    }

    async fn path_sync(&self, path: &str) -> StorageResult<()> {
        self.request(commands::STORAGE_PATH_SYNC, vec![path.into()]).await?;
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        self.pool.close().await
    }
}

fn closed() -> StorageError {
    StorageError::ProtocolFraming("remote stream already finished".into())
}

/// Read stream over a checked-out client. A stream dropped before its end
/// takes the channel with it; the pool opens a new one on demand.
struct RemoteRead {
    pool: Arc<ClientPool>,
    session: Option<Session>,
}

impl RemoteRead {
    /// Consume the terminal response and return the session to the pool.
    async fn finish(&mut self) -> StorageResult<()> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        let result = session.client.response().await;
        self.pool.checkin(session);
        result?;
        Ok(())
    }
}

#[async_trait]
impl DriverRead for RemoteRead {
    async fn read(&mut self) -> StorageResult<Option<Vec<u8>>> {
        let Some(session) = self.session.as_mut() else {
            return Ok(None);
        };
        match session.client.read_block().await {
            Ok(Some(block)) => Ok(Some(block)),
            Ok(None) => {
                self.finish().await?;
                Ok(None)
            }
            Err(err) => {
                // a peer error ends the stream but leaves the channel usable
                if let Some(session) = self.session.take() {
                    self.pool.checkin(session);
                }
                Err(err.into())
            }
        }
    }

    async fn close(mut self: Box<Self>) -> StorageResult<()> {
        while self.session.is_some() {
            self.read().await?;
        }
        Ok(())
    }
}

struct RemoteWrite {
    pool: Arc<ClientPool>,
    session: Option<Session>,
}

impl RemoteWrite {
    /// Send the closing marker, then collect the peer's verdict.
    async fn finish(&mut self, abort: bool) -> StorageResult<()> {
        let mut session = self.session.take().ok_or_else(closed)?;
        let sent = if abort {
            session.client.write_abort().await
        } else {
            session.client.write_end().await
        };
        let result = match sent {
            Ok(()) => session.client.response().await,
            Err(err) => Err(err),
        };
        self.pool.checkin(session);
        result?;
        Ok(())
    }
}

#[async_trait]
impl DriverWrite for RemoteWrite {
    async fn write(&mut self, data: &[u8]) -> StorageResult<()> {
        let session = self.session.as_mut().ok_or_else(closed)?;
        for block in data.chunks(MAX_BLOCK_SIZE) {
            if let Err(err) = session.client.write_block(block).await {
                self.session = None;
                return Err(err.into());
            }
        }
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> StorageResult<()> {
        self.finish(false).await
    }

    async fn abort(mut self: Box<Self>) -> StorageResult<()> {
        self.finish(true).await
    }
}
