use std::path::Path;
use std::process::Stdio;
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use schema::{Connection, PipeHandler, ProgressFn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::process::{pipe_child, shell_escape};
use crate::scp;

/// Connection to the machine convoy itself runs on. Commands go through the
/// local shell, files through the filesystem, and "tunnels" are loopback
/// proxies so port numbers behave the way callers expect.
#[derive(Default)]
pub struct LocalConnection {
    proxies: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalConnection {
    pub fn new() -> Self {
        Self::default()
    }

    fn bash(command: &str) -> Command {
        let mut cmd = Command::new("/bin/bash");
        cmd.arg("-c").arg(command);
        cmd
    }
}

#[async_trait]
impl Connection for LocalConnection {
    async fn shell(&self, command: Option<&str>, _cols: u16, _rows: u16) -> anyhow::Result<()> {
        let mut cmd = match command {
            Some(command) => Self::bash(command),
            None => {
                let mut cmd = Command::new("/bin/bash");
                cmd.arg("-i");
                cmd
            }
        };
        let status = cmd.status().await.context("spawn local shell")?;
        if !status.success() {
            anyhow::bail!("shell exited with {status}");
        }
        Ok(())
    }

    async fn execute_command(&self, command: &str) -> anyhow::Result<String> {
        let mut cmd = Self::bash(command);
        cmd.stdin(Stdio::null());
        let output = cmd.output().await.context("run local command")?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            anyhow::bail!("command failed ({}): {}", output.status, combined.trim());
        }
        Ok(combined)
    }

    async fn execute_pipe_command(
        &self,
        command: &str,
        handler: PipeHandler,
    ) -> anyhow::Result<()> {
        let mut cmd = Self::bash(command);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        let child = cmd.spawn().context("spawn local pipe command")?;
        pipe_child(child, handler, "local pipe command").await
    }

    async fn write_file(
        &self,
        path: &str,
        mode: u32,
        length: u64,
        mut content: Box<dyn AsyncRead + Send + Unpin>,
        elevate: bool,
        progress: ProgressFn,
    ) -> anyhow::Result<()> {
        if elevate {
            // same privilege path as the remote case: an elevated scp sink
            let dir = Path::new(path)
                .parent()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            let file_name = Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .with_context(|| format!("{path} has no file name"))?;
            let mut cmd = Self::bash(&format!("sudo -n /usr/bin/scp -t {}", shell_escape(&dir)));
            cmd.stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
            let child = cmd.spawn().context("spawn elevated scp")?;
            return scp::drive_sink(child, &file_name, mode, length, content, progress).await;
        }

        if let Some(parent) = Path::new(path).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create directories for {path}"))?;
        }
        let mut file = tokio::fs::File::create(path)
            .await
            .with_context(|| format!("create {path}"))?;
        let mut written: u64 = 0;
        let mut buf = [0u8; 32 * 1024];
        loop {
            let n = content.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await?;
            written += n as u64;
            if length > 0 {
                progress(written as f64 / length as f64);
            }
        }
        file.flush().await?;
        drop(file);
        if written != length {
            anyhow::bail!("content ended after {written} of {length} bytes");
        }
        if length == 0 {
            progress(1.0);
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))
                .await
                .with_context(|| format!("set mode on {path}"))?;
        }
        Ok(())
    }

    async fn start_tunnel(
        &self,
        local_port: u16,
        remote_port: u16,
        remote_host: &str,
        reverse: bool,
    ) -> anyhow::Result<u16> {
        let target_host = if remote_host.is_empty() {
            "127.0.0.1".to_string()
        } else {
            remote_host.to_string()
        };
        if reverse {
            if local_port == 0 {
                anyhow::bail!("the local port must be known for reverse tunnels");
            }
            let (port, handle) =
                spawn_proxy(remote_port, "127.0.0.1".to_string(), local_port).await?;
            self.proxies
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(handle);
            return Ok(port);
        }

        if remote_port == 0 {
            anyhow::bail!("the remote port must be known for forward tunnels");
        }
        // pre-test the target the way a real transport would
        TcpStream::connect((target_host.as_str(), remote_port))
            .await
            .with_context(|| {
                format!("could not connect to port {remote_port} when pre-testing the tunnel; perhaps nothing is listening on the port")
            })?;
        if local_port == 0 && target_host == "127.0.0.1" {
            // the "remote" port is already local; no proxy needed
            return Ok(remote_port);
        }
        let (port, handle) = spawn_proxy(local_port, target_host, remote_port).await?;
        self.proxies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handle);
        Ok(port)
    }

    async fn close(&self) -> anyhow::Result<()> {
        let proxies = std::mem::take(
            &mut *self
                .proxies
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for proxy in proxies {
            proxy.abort();
        }
        Ok(())
    }
}

/// Accept loop copying bytes both ways between `listen_port` (0 picks a free
/// one) and the dial target, one task per accepted connection. Returns the
/// bound port.
async fn spawn_proxy(
    listen_port: u16,
    dial_host: String,
    dial_port: u16,
) -> anyhow::Result<(u16, JoinHandle<()>)> {
    let listener = TcpListener::bind(("127.0.0.1", listen_port))
        .await
        .with_context(|| format!("listen on 127.0.0.1:{listen_port}"))?;
    let bound = listener.local_addr()?.port();
    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut inbound, _)) = listener.accept().await else {
                return;
            };
            let dial_host = dial_host.clone();
            tokio::spawn(async move {
                let Ok(mut outbound) = TcpStream::connect((dial_host.as_str(), dial_port)).await
                else {
                    return;
                };
                let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
            });
        }
    });
    Ok((bound, handle))
}
