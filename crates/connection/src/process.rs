use std::sync::{Arc, Mutex};

use anyhow::Context;
use schema::{PipeHandler, PipeStreams};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;

/// Hands a spawned child's pipes to `handler` and waits for both. stderr is
/// teed so the composed error can include whatever the process printed even
/// after the handler is done with its copy.
pub(crate) async fn pipe_child(
    mut child: Child,
    handler: PipeHandler,
    label: &str,
) -> anyhow::Result<()> {
    let stdin = child
        .stdin
        .take()
        .with_context(|| format!("{label}: stdin not piped"))?;
    let stdout = child
        .stdout
        .take()
        .with_context(|| format!("{label}: stdout not piped"))?;
    let mut stderr = child
        .stderr
        .take()
        .with_context(|| format!("{label}: stderr not piped"))?;

    let captured: Arc<Mutex<Vec<u8>>> = Arc::default();
    let (mut tee_writer, tee_reader) = tokio::io::duplex(64 * 1024);
    let capture = tokio::spawn({
        let captured = Arc::clone(&captured);
        async move {
            let mut forward = true;
            let mut buf = [0u8; 8192];
            loop {
                match stderr.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        captured
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .extend_from_slice(&buf[..n]);
                        if forward && tee_writer.write_all(&buf[..n]).await.is_err() {
                            forward = false;
                        }
                    }
                }
            }
        }
    });

    let streams = PipeStreams {
        stdout: Box::new(stdout),
        stderr: Box::new(tee_reader),
        stdin: Box::new(stdin),
    };
    let handler_result = handler(streams).await;
    let status = child
        .wait()
        .await
        .with_context(|| format!("wait for {label}"))?;
    let _ = capture.await;

    let stderr_text = {
        let captured = captured
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        String::from_utf8_lossy(&captured).trim().to_string()
    };

    if let Err(err) = handler_result {
        if stderr_text.is_empty() {
            return Err(err);
        }
        anyhow::bail!("{err:#}: {stderr_text}");
    }
    if !status.success() {
        if stderr_text.is_empty() {
            anyhow::bail!("{label} exited with {status}");
        }
        anyhow::bail!("{label} exited with {status}: {stderr_text}");
    }
    Ok(())
}

pub(crate) fn shell_escape(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-/=:@%+".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}
