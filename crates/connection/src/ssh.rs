use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use schema::{Connection, PipeHandler, ProgressFn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::process::{pipe_child, shell_escape};
use crate::scp;

const CONTROL_OP_TIMEOUT: Duration = Duration::from_secs(30);
const MASTER_POLL_INTERVAL: Duration = Duration::from_millis(250);
const TUNNEL_PROBE_TIMEOUT: Duration = Duration::from_millis(400);

const ASKPASS_SCRIPT: &str = "#!/bin/sh\nprintf '%s' \"$CONVOY_SSH_PASSWORD\"\n";

static CONTROL_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct SshSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub private_key: Option<PathBuf>,
    pub connect_timeout: Duration,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: "root".to_string(),
            password: None,
            private_key: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

struct Forward {
    flag: &'static str,
    spec: String,
}

/// SSH transport over the system `ssh` binary. One ControlMaster process is
/// held per connection; every operation opens a fresh multiplexed session, so
/// concurrent use is fine. Auth order: explicit password, explicit private
/// key, then whatever the user's agent offers.
pub struct SshConnection {
    settings: SshSettings,
    control_path: PathBuf,
    master: Mutex<Option<Child>>,
    forwards: Mutex<Vec<Forward>>,
}

impl SshConnection {
    pub async fn connect(settings: SshSettings) -> anyhow::Result<Self> {
        let control_dir = control_dir()?;
        tokio::fs::create_dir_all(&control_dir)
            .await
            .with_context(|| format!("failed to create {}", control_dir.display()))?;
        let control_path = control_dir.join(format!(
            "cm-{}-{}-{}",
            std::process::id(),
            CONTROL_COUNTER.fetch_add(1, Ordering::Relaxed),
            settings.port,
        ));

        let connection = Self {
            settings,
            control_path,
            master: Mutex::new(None),
            forwards: Mutex::new(Vec::new()),
        };
        connection.spawn_master().await?;
        Ok(connection)
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.settings.username, self.settings.host)
    }

    fn session_command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-S").arg(&self.control_path);
        cmd.arg("-o").arg("BatchMode=yes");
        cmd.arg("-p").arg(self.settings.port.to_string());
        cmd
    }

    fn control_command(&self, op: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-S").arg(&self.control_path);
        cmd.arg("-O").arg(op);
        cmd.arg("-p").arg(self.settings.port.to_string());
        cmd
    }

    /// The auth-carrying invocation. Sessions multiplex over the master and
    /// need no credentials of their own.
    async fn spawn_master(&self) -> anyhow::Result<()> {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o").arg("StrictHostKeyChecking=accept-new");
        cmd.arg("-o").arg(format!(
            "ConnectTimeout={}",
            self.settings.connect_timeout.as_secs().max(1)
        ));
        cmd.arg("-o").arg("ServerAliveInterval=30");
        cmd.arg("-p").arg(self.settings.port.to_string());
        match self.settings.password.as_deref() {
            Some(password) => {
                // no terminal to prompt on; route the password through an
                // askpass one-liner kept next to the control sockets
                let runtime_dir = self
                    .control_path
                    .parent()
                    .context("control path has no parent directory")?;
                let script = write_askpass_script(runtime_dir).await?;
                cmd.env("CONVOY_SSH_PASSWORD", password);
                cmd.env("SSH_ASKPASS", &script);
                cmd.env("SSH_ASKPASS_REQUIRE", "force");
                cmd.env("DISPLAY", "1");
            }
            None => {
                cmd.arg("-o").arg("BatchMode=yes");
                if let Some(key) = self.settings.private_key.as_deref() {
                    cmd.arg("-i").arg(key);
                    cmd.arg("-o").arg("IdentitiesOnly=yes");
                }
            }
        }
        cmd.arg("-N")
            .arg("-T")
            .arg("-o")
            .arg("ControlMaster=yes")
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg(self.destination());
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().context("spawn ssh master")?;

        let deadline = tokio::time::Instant::now() + self.settings.connect_timeout;
        loop {
            if let Some(status) = child.try_wait().context("poll ssh master")? {
                let mut stderr = Vec::new();
                if let Some(mut pipe) = child.stderr.take() {
                    let _ = pipe.read_to_end(&mut stderr).await;
                }
                anyhow::bail!(
                    "failed to connect to SSH on {}:{} ({}): {}",
                    self.settings.host,
                    self.settings.port,
                    status,
                    String::from_utf8_lossy(&stderr).trim()
                );
            }
            let mut check = self.control_command("check");
            check.arg(self.destination());
            let output = run_control(check, "ssh -O check").await?;
            if output.status.success() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                let _ = child.kill().await;
                anyhow::bail!(
                    "failed to connect to SSH on {}:{} within {:?}",
                    self.settings.host,
                    self.settings.port,
                    self.settings.connect_timeout
                );
            }
            tokio::time::sleep(MASTER_POLL_INTERVAL).await;
        }

        info!(host = %self.settings.host, "ssh master established");
        *self
            .master
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(child);
        Ok(())
    }

    async fn forward_control(&self, flag: &'static str, spec: &str) -> anyhow::Result<()> {
        let mut cmd = self.control_command("forward");
        cmd.arg(flag).arg(spec).arg(self.destination());
        let output = run_control(cmd, "ssh -O forward").await?;
        if !output.status.success() {
            anyhow::bail!(
                "ssh -O forward {flag} {spec} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    async fn cancel_forward(&self, flag: &str, spec: &str) -> anyhow::Result<()> {
        let mut cmd = self.control_command("cancel");
        cmd.arg(flag).arg(spec).arg(self.destination());
        let output = run_control(cmd, "ssh -O cancel").await?;
        if !output.status.success() {
            anyhow::bail!(
                "ssh -O cancel failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Control-channel operations are quick; anything slower means the master is
/// wedged, so the child is simply dropped (and killed) at the deadline.
async fn run_control(mut cmd: Command, label: &str) -> anyhow::Result<Output> {
    cmd.stdin(Stdio::null());
    cmd.kill_on_drop(true);
    match tokio::time::timeout(CONTROL_OP_TIMEOUT, cmd.output()).await {
        Ok(output) => output.with_context(|| format!("run {label}")),
        Err(_) => anyhow::bail!("{label} timed out after {}s", CONTROL_OP_TIMEOUT.as_secs()),
    }
}

/// The askpass script lives in the per-user connection runtime directory,
/// beside the ControlMaster sockets, and is rewritten on every connect.
async fn write_askpass_script(runtime_dir: &Path) -> anyhow::Result<PathBuf> {
    let path = runtime_dir.join("askpass.sh");
    tokio::fs::write(&path, ASKPASS_SCRIPT)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))
            .await
            .with_context(|| format!("failed to set mode on {}", path.display()))?;
    }
    Ok(path)
}

#[async_trait]
impl Connection for SshConnection {
    async fn shell(&self, command: Option<&str>, _cols: u16, _rows: u16) -> anyhow::Result<()> {
        let mut cmd = self.session_command();
        cmd.arg("-tt").arg(self.destination());
        if let Some(command) = command {
            cmd.arg(command);
        }
        let status = cmd.status().await.context("spawn interactive ssh")?;
        if !status.success() {
            anyhow::bail!("shell exited with {status}");
        }
        Ok(())
    }

    async fn execute_command(&self, command: &str) -> anyhow::Result<String> {
        let mut cmd = self.session_command();
        cmd.arg("-T").arg(self.destination()).arg(command);
        cmd.stdin(Stdio::null());
        let output = cmd.output().await.context("run ssh command")?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            anyhow::bail!(
                "remote command failed ({}): {}",
                output.status,
                combined.trim()
            );
        }
        Ok(combined)
    }

    async fn execute_pipe_command(
        &self,
        command: &str,
        handler: PipeHandler,
    ) -> anyhow::Result<()> {
        let mut cmd = self.session_command();
        cmd.arg("-T").arg(self.destination()).arg(command);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        let child = cmd.spawn().context("spawn ssh pipe command")?;
        pipe_child(child, handler, "ssh pipe command").await
    }

    async fn write_file(
        &self,
        path: &str,
        mode: u32,
        length: u64,
        content: Box<dyn AsyncRead + Send + Unpin>,
        elevate: bool,
        progress: ProgressFn,
    ) -> anyhow::Result<()> {
        let path = Path::new(path);
        let dir = path.parent().map(|p| p.display().to_string()).unwrap_or_default();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("{} has no file name", path.display()))?;

        let mut remote = format!("/usr/bin/scp -t {}", shell_escape(&dir));
        if elevate {
            remote = format!("sudo -n {remote}");
        }
        let mut cmd = self.session_command();
        cmd.arg("-T").arg(self.destination()).arg(remote);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        let child = cmd.spawn().context("spawn remote scp")?;
        scp::drive_sink(child, &file_name, mode, length, content, progress).await
    }

    async fn start_tunnel(
        &self,
        local_port: u16,
        remote_port: u16,
        remote_host: &str,
        reverse: bool,
    ) -> anyhow::Result<u16> {
        if reverse {
            if local_port == 0 {
                anyhow::bail!("the local port must be known for reverse tunnels");
            }
            probe_local_listener(local_port).await?;
            let spec = format!("127.0.0.1:{remote_port}:127.0.0.1:{local_port}");
            self.forward_control("-R", &spec).await?;
            self.forwards
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(Forward { flag: "-R", spec });
            debug!(remote_port, local_port, "reverse tunnel up");
            return Ok(remote_port);
        }

        if remote_port == 0 {
            anyhow::bail!("the remote port must be known for forward tunnels");
        }
        let host = if remote_host.is_empty() {
            "127.0.0.1"
        } else {
            remote_host
        };
        let port = if local_port == 0 {
            pick_free_port().await?
        } else {
            local_port
        };
        let spec = format!("0.0.0.0:{port}:{host}:{remote_port}");
        self.forward_control("-L", &spec).await?;
        if let Err(err) = probe_forwarded_port(port).await {
            let _ = self.cancel_forward("-L", &spec).await;
            return Err(err.context(format!(
                "could not reach {host}:{remote_port} when pre-testing the tunnel; perhaps nothing is listening on the port"
            )));
        }
        self.forwards
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Forward { flag: "-L", spec });
        debug!(local_port = port, remote_port, "forward tunnel up");
        Ok(port)
    }

    async fn close(&self) -> anyhow::Result<()> {
        let forwards = std::mem::take(
            &mut *self
                .forwards
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for forward in forwards {
            let _ = self.cancel_forward(forward.flag, &forward.spec).await;
        }
        let mut exit = self.control_command("exit");
        exit.arg(self.destination());
        let _ = run_control(exit, "ssh -O exit").await;
        let master = self
            .master
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(mut child) = master {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
        let _ = tokio::fs::remove_file(&self.control_path).await;
        Ok(())
    }
}

fn control_dir() -> anyhow::Result<PathBuf> {
    let home = std::env::var("HOME").context("failed to resolve HOME for ssh control dir")?;
    Ok(PathBuf::from(home).join(".convoy").join("control"))
}

async fn pick_free_port() -> anyhow::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .context("pick a free local port")?;
    Ok(listener.local_addr()?.port())
}

/// Forward-tunnel probe: dial the freshly forwarded port and watch for an
/// immediate close, which is how a remote connection refusal surfaces.
async fn probe_forwarded_port(port: u16) -> anyhow::Result<()> {
    let mut stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .context("dial the forwarded port")?;
    let mut byte = [0u8; 1];
    match tokio::time::timeout(TUNNEL_PROBE_TIMEOUT, stream.read(&mut byte)).await {
        Ok(Ok(0)) => anyhow::bail!("the peer closed the probe connection immediately"),
        Ok(Ok(_)) | Err(_) => Ok(()),
        Ok(Err(err)) => Err(err).context("probe read failed"),
    }
}

/// Reverse tunnels dial a local port; make sure something listens before
/// asking the peer to forward to it.
async fn probe_local_listener(port: u16) -> anyhow::Result<()> {
    TcpStream::connect(("127.0.0.1", port))
        .await
        .with_context(|| {
            format!("could not connect to local port {port} when pre-testing the tunnel; perhaps nothing is listening on the port")
        })?;
    Ok(())
}
