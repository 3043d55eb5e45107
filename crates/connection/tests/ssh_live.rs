//! Tests that need a disposable SSH host. Point `CONVOY_TEST_SSH` at
//! `user@host[:port]` (plus `CONVOY_TEST_SSH_KEY` or `CONVOY_TEST_SSH_PASSWORD`
//! when agent auth is not enough) and run with `--ignored`.

use std::sync::Arc;
use std::time::Duration;

use connection::{SshConnection, SshSettings};
use schema::Connection;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn test_settings() -> Option<SshSettings> {
    let target = std::env::var("CONVOY_TEST_SSH").ok()?;
    let (username, rest) = target.split_once('@')?;
    let (host, port) = match rest.split_once(':') {
        Some((host, port)) => (host, port.parse().ok()?),
        None => (rest, 22),
    };
    Some(SshSettings {
        host: host.to_string(),
        port,
        username: username.to_string(),
        password: std::env::var("CONVOY_TEST_SSH_PASSWORD").ok(),
        private_key: std::env::var("CONVOY_TEST_SSH_KEY").ok().map(Into::into),
        connect_timeout: Duration::from_secs(10),
    })
}

async fn connect() -> SshConnection {
    let settings = test_settings().expect("CONVOY_TEST_SSH must be set for live ssh tests");
    SshConnection::connect(settings).await.expect("ssh connect")
}

#[tokio::test]
#[ignore]
async fn execute_command_captures_output() {
    let conn = connect().await;
    let output = conn.execute_command("echo hi there").await.expect("exec");
    assert!(output.contains("hi there"));
    conn.close().await.expect("close");
}

#[tokio::test]
#[ignore]
async fn tunnel_echoes_through_the_host() {
    // a local echo server the tunnel should loop back to via the host
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind");
    let echo_port = listener.local_addr().expect("addr").port();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                if let Ok(n) = conn.read(&mut buf).await {
                    let _ = conn.write_all(&buf[..n]).await;
                }
            });
        }
    });

    let conn = connect().await;
    // expose the echo server on the host, then forward back to it
    let remote_port = conn
        .start_tunnel(echo_port, 0, "", true)
        .await
        .map_or(echo_port, |p| p);
    let local = conn
        .start_tunnel(0, remote_port, "", false)
        .await
        .expect("forward tunnel");
    assert_ne!(local, 0);

    let mut stream = TcpStream::connect(("127.0.0.1", local)).await.expect("dial");
    stream.write_all(b"ping").await.expect("write");
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.expect("read");
    assert_eq!(&buf, b"ping");
    conn.close().await.expect("close");
}

#[tokio::test]
#[ignore]
async fn file_upload_reports_progress_and_mode() {
    let conn = connect().await;
    let content = vec![0x5A_u8; 1024 * 1024];
    let length = content.len() as u64;

    let updates: Arc<std::sync::Mutex<Vec<f64>>> = Arc::default();
    let sink = Arc::clone(&updates);
    conn.write_file(
        "/tmp/convoy-upload-test",
        0o644,
        length,
        Box::new(std::io::Cursor::new(content)),
        false,
        Box::new(move |p| sink.lock().expect("lock").push(p)),
    )
    .await
    .expect("upload");

    let updates = updates.lock().expect("lock").clone();
    assert!(updates.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(*updates.last().expect("last"), 1.0);

    let stat = conn
        .execute_command("stat -c '%s %a' /tmp/convoy-upload-test")
        .await
        .expect("stat");
    assert!(stat.contains("1048576"));
    assert!(stat.contains("644"));
    let _ = conn.execute_command("rm -f /tmp/convoy-upload-test").await;
    conn.close().await.expect("close");
}
