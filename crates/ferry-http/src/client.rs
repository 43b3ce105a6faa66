use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use ferry_transport::{tls, RetryPolicy, TlsConnector, TransportConfig};
use ferry_types::StorageResult;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::HttpError;
use crate::request::{HttpRequest, HttpResponse};

/// Sends one request and returns the response, whatever its status.
///
/// Object-store drivers talk only to this seam, so they can be exercised
/// against an in-memory server.
#[async_trait]
pub trait HttpSend: Send + Sync + std::fmt::Debug {
    async fn send(&self, request: HttpRequest) -> StorageResult<HttpResponse>;

    /// Close idle connections. Later sends reconnect.
    async fn close(&self) {}
}

/// A keep-alive connection: the request handle plus the task driving it.
struct Pooled {
    sender: SendRequest<Full<Bytes>>,
    task: JoinHandle<()>,
}

/// HTTPS client for one endpoint with keep-alive connection reuse.
///
/// Each `send` is a single attempt, including a single connect attempt;
/// wrap it in [`Retrying`] for the transport retry policy.
pub struct HttpClient {
    host: String,
    port: u16,
    tls: TlsConnector,
    transport: TransportConfig,
    /// `transport` limited to one connect attempt.
    connect: TransportConfig,
    idle: Mutex<Vec<Pooled>>,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

const MAX_IDLE: usize = 4;

/// Time a closing connection gets to finish its TLS shutdown.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

impl HttpClient {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        tls: TlsConnector,
        transport: TransportConfig,
    ) -> Self {
        let connect = TransportConfig { retries: 1, ..transport.clone() };
        Self {
            host: host.into(),
            port,
            tls,
            transport,
            connect,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Client wrapped with the retry policy from its transport settings.
    pub fn retrying(self) -> Retrying<Self> {
        let policy = self.transport.retry_policy();
        Retrying::new(self, policy)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Value for the `Host` header.
    pub fn authority(&self) -> String {
        if self.port == 443 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    fn checkout(&self) -> Option<Pooled> {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(pooled) = idle.pop() {
            if !pooled.sender.is_closed() {
                return Some(pooled);
            }
        }
        None
    }

    fn checkin(&self, pooled: Pooled) {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < MAX_IDLE && !pooled.sender.is_closed() {
            idle.push(pooled);
        }
    }

    /// Open one connection. Once its sender is dropped the connection task
    /// ends the TLS session with close_notify.
    async fn connect(&self) -> StorageResult<Pooled> {
        let stream = self.tls.connect(&self.host, self.port, &self.connect).await?;
        let (sender, connection) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| HttpError::from_hyper(e, "HTTP handshake"))?;
        let host = self.host.clone();
        let task = tokio::spawn(async move {
            match connection.without_shutdown().await {
                Ok(parts) => tls::shutdown(parts.io.into_inner()).await,
                Err(err) => {
                    debug!(target: "ferry::http", %host, error = %err, "connection closed with error");
                }
            }
        });
        Ok(Pooled { sender, task })
    }

    /// Close every idle connection, waiting briefly for each TLS shutdown.
    pub async fn close(&self) {
        let idle = std::mem::take(&mut *self.idle.lock().unwrap_or_else(PoisonError::into_inner));
        let count = idle.len();
        for Pooled { sender, mut task } in idle {
            drop(sender);
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        debug!(target: "ferry::http", host = %self.host, connections = count, "closed idle connections");
    }

    async fn attempt(&self, request: &HttpRequest) -> StorageResult<HttpResponse> {
        let mut pooled = match self.checkout() {
            Some(pooled) => pooled,
            None => self.connect().await?,
        };
        let sender = &mut pooled.sender;
        sender
            .ready()
            .await
            .map_err(|e| HttpError::from_hyper(e, "HTTP connection"))?;

        let context = format!("{} {}", request.method, request.path);
        let mut builder = hyper::Request::builder()
            .method(request.method.as_str())
            .uri(request.target())
            .header(hyper::header::HOST, self.authority());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let outgoing = builder
            .body(Full::new(request.body.clone()))
            .map_err(|e| HttpError::Request(format!("{context}: {e}")))?;

        let response = sender
            .send_request(outgoing)
            .await
            .map_err(|e| HttpError::from_hyper(e, &context))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| HttpError::from_hyper(e, &context))?
            .to_bytes();
        self.checkin(pooled);

        trace!(target: "ferry::http", %context, status, bytes = body.len(), "response");
        Ok(HttpResponse { status, headers, body })
    }
}

#[async_trait]
impl HttpSend for HttpClient {
    async fn send(&self, request: HttpRequest) -> StorageResult<HttpResponse> {
        self.attempt(&request).await
    }

    async fn close(&self) {
        HttpClient::close(self).await
    }
}

#[async_trait]
impl<T: HttpSend + ?Sized> HttpSend for std::sync::Arc<T> {
    async fn send(&self, request: HttpRequest) -> StorageResult<HttpResponse> {
        (**self).send(request).await
    }

    async fn close(&self) {
        (**self).close().await
    }
}

/// Applies a [`RetryPolicy`] around another sender.
///
/// Connection-level failures and 5xx responses are retried; a 5xx that
/// survives every attempt becomes a provider error. 4xx responses are
/// returned on the first attempt for the driver to interpret.
#[derive(Debug)]
pub struct Retrying<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: HttpSend> Retrying<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: HttpSend> HttpSend for Retrying<S> {
    async fn send(&self, request: HttpRequest) -> StorageResult<HttpResponse> {
        let what = format!("{} {}", request.method, request.path);
        let what = what.as_str();
        let request = &request;
        let inner = &self.inner;
        self.policy
            .run(what, move |_| async move {
                let response = inner.send(request.clone()).await?;
                if response.status >= 500 {
                    return Err(response.error(what));
                }
                Ok(response)
            })
            .await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}
