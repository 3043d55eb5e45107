use anyhow::Context;
use schema::ProgressFn;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;

/// Drives the sink side of the scp protocol against an already spawned
/// `scp -t` process, streaming exactly `length` bytes with progress callbacks.
pub(crate) async fn drive_sink(
    mut child: Child,
    file_name: &str,
    mode: u32,
    length: u64,
    mut content: Box<dyn AsyncRead + Send + Unpin>,
    progress: ProgressFn,
) -> anyhow::Result<()> {
    let mut stdin = child.stdin.take().context("scp stdin not piped")?;
    let mut stdout = child.stdout.take().context("scp stdout not piped")?;
    let mut stderr = child.stderr.take().context("scp stderr not piped")?;

    let result: anyhow::Result<()> = async {
        read_ack(&mut stdout).await.context("scp did not accept the session")?;

        let header = format!("C{:04o} {} {}\n", mode & 0o7777, length, file_name);
        stdin.write_all(header.as_bytes()).await?;
        read_ack(&mut stdout).await.context("scp rejected the file header")?;

        let mut written: u64 = 0;
        let mut buf = [0u8; 32 * 1024];
        loop {
            let n = content.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            stdin.write_all(&buf[..n]).await?;
            written += n as u64;
            if length > 0 {
                progress(written as f64 / length as f64);
            }
        }
        if written != length {
            anyhow::bail!("content ended after {written} of {length} bytes");
        }
        if length == 0 {
            progress(1.0);
        }

        stdin.write_all(&[0]).await?;
        stdin.flush().await?;
        read_ack(&mut stdout).await.context("scp rejected the file content")?;
        Ok(())
    }
    .await;

    drop(stdin);
    let status = child.wait().await.context("wait for scp")?;
    let mut stderr_buf = Vec::new();
    let _ = stderr.read_to_end(&mut stderr_buf).await;
    let stderr_text = String::from_utf8_lossy(&stderr_buf).trim().to_string();

    if let Err(err) = result {
        if stderr_text.is_empty() {
            return Err(err);
        }
        anyhow::bail!("{err:#}: {stderr_text}");
    }
    if !status.success() {
        if stderr_text.is_empty() {
            anyhow::bail!("scp exited with {status}");
        }
        anyhow::bail!("scp exited with {status}: {stderr_text}");
    }
    Ok(())
}

/// One scp acknowledgement byte: 0 is success, anything else precedes an
/// error line.
async fn read_ack<R: AsyncReadExt + Unpin>(reader: &mut R) -> anyhow::Result<()> {
    let mut byte = [0u8; 1];
    reader
        .read_exact(&mut byte)
        .await
        .context("scp closed the stream")?;
    if byte[0] == 0 {
        return Ok(());
    }
    let mut message = Vec::new();
    let mut one = [0u8; 1];
    while let Ok(1) = reader.read(&mut one).await {
        if one[0] == b'\n' {
            break;
        }
        message.push(one[0]);
    }
    anyhow::bail!(
        "scp error: {}",
        String::from_utf8_lossy(&message).trim().to_string()
    )
}
