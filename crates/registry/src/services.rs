use std::collections::HashSet;
use std::future::Future;
use std::sync::LazyLock;

use anyhow::Context;
use tokio::process::Command;
use tokio::sync::{Mutex, OnceCell};
use tracing::info;

/// Port the forwarded image registry appears on from a managed host's point
/// of view.
pub const REGISTRY_REMOTE_PORT: u16 = 52929;

const REGISTRY_CONTAINER: &str = "convoy-registry";

static LOCAL_REGISTRY: OnceCell<u16> = OnceCell::const_new();
static PUSHED_TAGS: LazyLock<Mutex<HashSet<String>>> = LazyLock::new(|| Mutex::new(HashSet::new()));
static PULLED_IMAGES: LazyLock<Mutex<HashSet<String>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

/// Starts the process-wide image registry container on first use and returns
/// the local port it listens on. Later callers get the same port.
pub async fn local_registry_port() -> anyhow::Result<u16> {
    LOCAL_REGISTRY
        .get_or_try_init(start_local_registry)
        .await
        .copied()
}

async fn start_local_registry() -> anyhow::Result<u16> {
    // reuse a registry left over from an earlier run
    if let Some(port) = mapped_registry_port().await? {
        return Ok(port);
    }
    let output = Command::new("docker")
        .args([
            "run",
            "-d",
            "--name",
            REGISTRY_CONTAINER,
            "-p",
            "127.0.0.1:0:5000",
            "registry:2",
        ])
        .output()
        .await
        .context("start the local image registry")?;
    if !output.status.success() {
        anyhow::bail!(
            "could not start the local image registry: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let port = mapped_registry_port()
        .await?
        .context("registry container has no published port")?;
    info!(port, "local image registry started");
    Ok(port)
}

async fn mapped_registry_port() -> anyhow::Result<Option<u16>> {
    let output = Command::new("docker")
        .args(["port", REGISTRY_CONTAINER, "5000/tcp"])
        .output()
        .await
        .context("query the registry container port")?;
    if !output.status.success() {
        return Ok(None);
    }
    let text = String::from_utf8_lossy(&output.stdout);
    for line in text.lines() {
        if let Some((_, port)) = line.trim().rsplit_once(':') {
            if let Ok(port) = port.parse() {
                return Ok(Some(port));
            }
        }
    }
    Ok(None)
}

/// Runs `push` unless `tag` was already pushed by this process. The lock is
/// held across the push, so a fleet-wide deploy pushes each tag exactly once
/// and everyone else waits for it.
pub async fn push_once<F, Fut>(tag: &str, push: F) -> anyhow::Result<bool>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut pushed = PUSHED_TAGS.lock().await;
    if pushed.contains(tag) {
        return Ok(false);
    }
    push().await?;
    pushed.insert(tag.to_string());
    Ok(true)
}

/// Agent-side twin of [`push_once`] for image pulls.
pub async fn pull_once<F, Fut>(image: &str, pull: F) -> anyhow::Result<bool>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut pulled = PULLED_IMAGES.lock().await;
    if pulled.contains(image) {
        return Ok(false);
    }
    pull().await?;
    pulled.insert(image.to_string());
    Ok(true)
}
