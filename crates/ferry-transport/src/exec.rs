use std::io;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{Context, Poll};
use std::time::Duration;

use ferry_types::StorageResult;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::error::TransportError;

/// Duplex channel over a spawned child's stdin and stdout.
///
/// The child's stderr is inherited so its diagnostics reach the operator.
/// Shutting down the channel closes the child's stdin.
#[derive(Debug)]
pub struct ExecChannel {
    command: String,
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
}

/// The process behind an [`ExecChannel`].
///
/// The child is killed if this is dropped without [`ExecProcess::wait`].
#[derive(Debug)]
pub struct ExecProcess {
    command: String,
    child: Child,
}

impl ExecChannel {
    pub fn spawn(argv: &[String]) -> StorageResult<(Self, ExecProcess)> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| TransportError::Config("exec command is empty".into()))?;
        let command = argv.join(" ");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Spawn {
                command: command.clone(),
                message: e.to_string(),
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or_else(|| TransportError::Spawn {
            command: command.clone(),
            message: "stdout not captured".into(),
        })?;
        debug!(target: "ferry::transport", %command, pid = child.id(), "spawned exec channel");
        let channel = Self { command: command.clone(), stdin, stdout };
        Ok((channel, ExecProcess { command, child }))
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

impl ExecProcess {
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Wait for the child to exit, killing it after `grace`.
    ///
    /// Call once the channel is shut down; a child still reading stdin
    /// never exits on its own.
    pub async fn wait(mut self, grace: Duration) -> StorageResult<ExitStatus> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(target: "ferry::transport", command = %self.command, %status, "exec process exited");
                Ok(status)
            }
            Ok(Err(err)) => Err(TransportError::Io(err).into()),
            Err(_) => {
                warn!(target: "ferry::transport", command = %self.command, "child did not exit, killing");
                self.child.kill().await.map_err(TransportError::Io)?;
                Ok(self.child.wait().await.map_err(TransportError::Io)?)
            }
        }
    }
}

impl AsyncRead for ExecChannel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stdout).poll_read(cx, buf)
    }
}

fn stdin_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "exec channel stdin closed")
}

impl AsyncWrite for ExecChannel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().stdin.as_mut() {
            Some(stdin) => Pin::new(stdin).poll_write(cx, buf),
            None => Poll::Ready(Err(stdin_closed())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stdin.as_mut() {
            Some(stdin) => Pin::new(stdin).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let result = match this.stdin.as_mut() {
            Some(stdin) => match Pin::new(stdin).poll_shutdown(cx) {
                Poll::Ready(result) => result,
                Poll::Pending => return Poll::Pending,
            },
            None => Ok(()),
        };
        this.stdin = None;
        Poll::Ready(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_types::ErrorKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn cat_echoes_bytes() {
        let (mut channel, process) = ExecChannel::spawn(&argv(&["cat"])).unwrap();
        channel.write_all(b"frame bytes").await.unwrap();
        channel.flush().await.unwrap();
        let mut buf = [0u8; 11];
        channel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"frame bytes");
        channel.shutdown().await.unwrap();
        let status = process.wait(Duration::from_secs(5)).await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn stubborn_child_killed_after_grace() {
        let (channel, process) = ExecChannel::spawn(&argv(&["sleep", "30"])).unwrap();
        drop(channel);
        let status = process.wait(Duration::from_millis(50)).await.unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn shutdown_gives_peer_eof() {
        let (mut channel, _process) = ExecChannel::spawn(&argv(&["cat"])).unwrap();
        channel.write_all(b"tail").await.unwrap();
        channel.shutdown().await.unwrap();
        let mut out = Vec::new();
        channel.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"tail");
        assert!(channel.write_all(b"more").await.is_err());
    }

    #[tokio::test]
    async fn missing_program_is_not_retried() {
        let err = ExecChannel::spawn(&argv(&["/nonexistent/ferry-peer"])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(!err.is_retryable());
        assert!(err.message().contains("/nonexistent/ferry-peer"));
    }

    #[test]
    fn empty_command_is_config_error() {
        let err = ExecChannel::spawn(&[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
