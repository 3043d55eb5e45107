use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

/// The three stdio pipes of a remotely spawned process, handed to a
/// [`PipeHandler`] while the process runs.
pub struct PipeStreams {
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
}

pub type PipeHandler =
    Box<dyn FnOnce(PipeStreams) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

pub type ProgressFn = Box<dyn Fn(f64) + Send + Sync>;

/// Uniform façade over a host. Implementations must be safe for concurrent
/// use; every operation runs in its own session.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Opens an interactive terminal session attached to the caller's stdio.
    /// `command` of `None` starts the login shell. `cols`/`rows` are advisory.
    async fn shell(&self, command: Option<&str>, cols: u16, rows: u16) -> anyhow::Result<()>;

    /// Runs `command` and returns its combined stdout and stderr. Fails with
    /// the output attached when the command exits nonzero.
    async fn execute_command(&self, command: &str) -> anyhow::Result<String>;

    /// Spawns `command` and hands its pipes to `handler`. Waits for both the
    /// handler and the process; the error composes the handler error, the
    /// exit status and any buffered stderr.
    async fn execute_pipe_command(&self, command: &str, handler: PipeHandler)
        -> anyhow::Result<()>;

    /// Streams exactly `length` bytes to `path` with the given mode,
    /// reporting fractional progress. `elevate` requests a privilege-elevated
    /// write.
    async fn write_file(
        &self,
        path: &str,
        mode: u32,
        length: u64,
        content: Box<dyn AsyncRead + Send + Unpin>,
        elevate: bool,
        progress: ProgressFn,
    ) -> anyhow::Result<()>;

    /// Forwards a port. Forward tunnels (`reverse == false`) listen locally
    /// on `local_port` (0 picks a free port, returned) and dial
    /// `remote_host:remote_port` from the peer; an empty `remote_host` means
    /// the peer's loopback. Reverse tunnels ask the peer to listen on
    /// `remote_port` and dial back to the local `local_port`. Tunnels live
    /// until the connection closes.
    async fn start_tunnel(
        &self,
        local_port: u16,
        remote_port: u16,
        remote_host: &str,
        reverse: bool,
    ) -> anyhow::Result<u16>;

    /// Releases all sessions and tunnels.
    async fn close(&self) -> anyhow::Result<()>;
}

/// True when `detail` looks like the remote shell could not find the program:
/// exit code 127, an explicit message, or a missing file.
pub fn is_command_not_found(detail: &str) -> bool {
    let low = detail.to_lowercase();
    low.contains("command not found")
        || low.contains("exit status: 127")
        || low.contains("exit code 127")
        || low.contains("no such file or directory")
}

pub fn is_permission_denied(detail: &str) -> bool {
    detail.to_lowercase().contains("permission denied")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_missing_command() {
        assert!(is_command_not_found("bash: convoy-agent: command not found"));
        assert!(is_command_not_found(
            "ssh command failed (exit status: 127)"
        ));
        assert!(is_command_not_found(
            "/usr/local/bin/convoy-agent: No such file or directory"
        ));
        assert!(!is_command_not_found("connection reset by peer"));
    }

    #[test]
    fn classifies_permission_denied() {
        assert!(is_permission_denied("scp: /usr/local/bin: Permission denied"));
        assert!(!is_permission_denied("operation timed out"));
    }
}
