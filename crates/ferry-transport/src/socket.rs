use std::future::Future;
use std::io;

use ferry_types::{StorageError, StorageResult};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::timeout::TimeoutStream;

/// Connect with a bounded timeout per attempt, retrying transient failures.
///
/// `connect` produces one attempt; it is called at most `retries` times. When
/// every attempt fails the result is a connectivity error naming `target`.
pub async fn connect_with<S, F, Fut>(
    target: &str,
    config: &TransportConfig,
    mut connect: F,
) -> StorageResult<S>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<S>>,
{
    let policy = config.retry_policy();
    let connect_timeout = config.connect_timeout();

    let result = policy
        .run(target, |attempt| {
            let attempt_fut = connect();
            async move {
                debug!(target: "ferry::transport", %target, attempt, "connecting");
                match tokio::time::timeout(connect_timeout, attempt_fut).await {
                    Ok(Ok(stream)) => Ok(stream),
                    Ok(Err(err)) => Err(StorageError::from_io(err, "connect to", target)),
                    Err(_) => Err(TransportError::Timeout(format!(
                        "connect to '{target}' after {}ms",
                        connect_timeout.as_millis()
                    ))
                    .into()),
                }
            }
        })
        .await;

    result.map_err(|err| {
        if err.is_retryable() {
            TransportError::Connect {
                target: target.to_string(),
                attempts: policy.attempts(),
                message: err.message().to_string(),
            }
            .into()
        } else {
            err
        }
    })
}

/// Open a TCP connection wrapped with the configured per-call timeout.
pub async fn connect_tcp(
    host: &str,
    port: u16,
    config: &TransportConfig,
) -> StorageResult<TimeoutStream<TcpStream>> {
    let target = format!("{host}:{port}");
    let stream = connect_with(&target, config, || TcpStream::connect((host, port))).await?;
    stream
        .set_nodelay(true)
        .map_err(|e| StorageError::from_io(e, "configure", &target))?;
    debug!(target: "ferry::transport", %target, "connected");
    Ok(TimeoutStream::new(stream, config.io_timeout()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_types::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn fast(retries: u32) -> TransportConfig {
        TransportConfig {
            connect_timeout_ms: 1_000,
            io_timeout_ms: 1_000,
            retries,
            retry_backoff_ms: 1,
            retry_backoff_max_ms: 5,
        }
    }

    #[tokio::test]
    async fn third_attempt_succeeds() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"ok").await.unwrap();
        });

        let calls = AtomicU32::new(0);
        let mut stream = connect_with("flaky", &fast(3), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(io::Error::from(io::ErrorKind::ConnectionRefused))
                } else {
                    TcpStream::connect(addr).await
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
    }

    #[tokio::test]
    async fn all_attempts_fail_is_connectivity() {
        let calls = AtomicU32::new(0);
        let err = connect_with("down:1", &fast(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<TcpStream, _>(io::Error::from(io::ErrorKind::ConnectionRefused)) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.kind(), ErrorKind::Connectivity);
        assert!(err.message().contains("down:1 after 3 attempt(s)"));
    }

    #[tokio::test]
    async fn hung_connect_times_out_then_fails() {
        let config = TransportConfig { connect_timeout_ms: 20, ..fast(2) };
        let err = connect_with("blackhole", &config, || {
            std::future::pending::<io::Result<TcpStream>>()
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connectivity);
        assert!(err.message().contains("timed out"));
    }

    #[tokio::test]
    async fn refused_port_is_connectivity() {
        // Bind then drop to get a port with nothing listening.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = connect_tcp("127.0.0.1", port, &fast(2)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connectivity);
    }

    #[tokio::test]
    async fn loopback_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });
        let mut stream = connect_tcp("127.0.0.1", port, &fast(1)).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }
}
