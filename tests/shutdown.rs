//! Process-level tests against the built `demorelay` binary.

#![cfg(unix)]

use std::net::TcpListener;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Kills the child if the test fails before it exits.
struct Server(Child);

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn spawn_server(root: &Path, port: u16) -> Server {
    let child = Command::new(env!("CARGO_BIN_EXE_demorelay"))
        .args(["--host", "127.0.0.1", "--port", &port.to_string(), "--log", "warn"])
        .arg("--replay-root")
        .arg(root)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    Server(child)
}

async fn connect(port: u16) -> WsStream {
    let url = format!("ws://127.0.0.1:{port}/ws");
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => return ws,
            Err(e) if Instant::now() > deadline => panic!("server never came up: {e}"),
            Err(_) => sleep(Duration::from_millis(50)).await,
        }
    }
}

async fn send(ws: &mut WsStream, path: &str, task: &str) {
    let msg = json!({"path": path, "task": task}).to_string();
    ws.send(Message::text(msg)).await.unwrap();
}

async fn read_text(ws: &mut WsStream) -> String {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame");
        match msg {
            Some(Ok(Message::Text(text))) => return text.as_str().to_string(),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            other => panic!("expected text frame, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn shutdown_exits_while_another_session_is_blocked() {
    let dir = tempfile::tempdir().unwrap();
    // opening a FIFO with no writer blocks the opening thread indefinitely
    let status = Command::new("mkfifo").arg(dir.path().join("stuck.fifo")).status().unwrap();
    assert!(status.success());

    let port = free_port();
    let mut server = spawn_server(dir.path(), port);

    let mut blocked = connect(port).await;
    send(&mut blocked, "stuck.fifo", "new_parser").await;
    sleep(Duration::from_millis(200)).await;

    let mut control = connect(port).await;
    send(&mut control, "other", "shutdown").await;
    assert_eq!(read_text(&mut control).await, "Ok");

    let deadline = Instant::now() + Duration::from_secs(20);
    let status = loop {
        if let Some(status) = server.0.try_wait().unwrap() {
            break status;
        }
        assert!(Instant::now() < deadline, "process still running after shutdown");
        sleep(Duration::from_millis(100)).await;
    };
    assert!(status.success(), "exit status {status:?}");
}
