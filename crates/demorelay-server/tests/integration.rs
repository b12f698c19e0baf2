//! End-to-end tests against a running server with a real WebSocket client.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use demorelay_engine::JsonlDecoderFactory;
use demorelay_server::{ServerConfig, ServerHandle};
use demorelay_telemetry::TelemetryGuard;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(5);
const RECORDING: &str = "match.jsonl";

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// 20 frames. Frame k carries two players with health k; frame 3 has a
/// weapon fire and frame 4 a hurt event with no attacker.
fn write_recording(dir: &Path) {
    let mut file = std::fs::File::create(dir.join(RECORDING)).unwrap();
    let header = json!({
        "map_name": "de_nuke",
        "server_name": "test",
        "playback_time_secs": 10.0,
        "playback_frames": 640,
        "playback_ticks": 1280,
    });
    writeln!(file, "{header}").unwrap();

    for k in 1..=20 {
        let players: Vec<_> = [1u64, 2]
            .into_iter()
            .map(|id| {
                json!({
                    "user_id": id,
                    "name": format!("p{id}"),
                    "steam_id64": 76561198000000000u64 + id,
                    "active_weapon": {"name": "AK-47"},
                    "health": k,
                })
            })
            .collect();
        let events = match k {
            3 => json!([{"type": "WeaponFire", "shooter": {"user_id": 1}, "weapon": {"name": "AK-47"}}]),
            4 => json!([{"type": "PlayerHurt", "player": {"user_id": 2}}]),
            _ => json!([]),
        };
        let frame = json!({"tick": k * 2, "players": players, "events": events});
        writeln!(file, "{frame}").unwrap();
    }
}

async fn boot_server() -> (ServerHandle, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    write_recording(dir.path());

    let config = ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        replay_root: Some(dir.path().to_path_buf()),
        ..Default::default()
    };
    let factory = Arc::new(JsonlDecoderFactory::new(config.replay_root.clone()));
    let handle = demorelay_server::start(config, factory, &TelemetryGuard::detached())
        .await
        .unwrap();
    (handle, dir)
}

async fn connect(handle: &ServerHandle) -> WsStream {
    let url = format!("ws://127.0.0.1:{}/ws", handle.port);
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

async fn send(ws: &mut WsStream, task: &str) {
    let msg = json!({"path": RECORDING, "task": task}).to_string();
    ws.send(Message::text(msg)).await.unwrap();
}

/// Next data frame, skipping control frames. `None` once the server closes.
async fn next_frame(ws: &mut WsStream) -> Option<Message> {
    loop {
        let msg = timeout(TIMEOUT, ws.next()).await.expect("timed out waiting for frame");
        match msg {
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(other)) => return Some(other),
        }
    }
}

async fn read_text(ws: &mut WsStream) -> String {
    match next_frame(ws).await {
        Some(Message::Text(text)) => text.as_str().to_string(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

async fn request(ws: &mut WsStream, task: &str) -> String {
    send(ws, task).await;
    read_text(ws).await
}

#[tokio::test]
async fn marked_frames_end_to_end() {
    let (handle, _dir) = boot_server().await;
    let mut ws = connect(&handle).await;

    assert_eq!(request(&mut ws, "new_parser").await, "Ok");
    assert_eq!(request(&mut ws, "parse_header").await, "Ok");
    assert_eq!(request(&mut ws, "frame_rate").await, "64");
    assert_eq!(request(&mut ws, "mark_frames:5,10,15").await, "Ok");

    send(&mut ws, "parse_to_end_with_marked_frames").await;
    for (position, health) in [(5, 5), (10, 10), (15, 15)] {
        let snapshot = read_text(&mut ws).await;
        assert!(snapshot.starts_with(&format!("{position},1,0,76561198000000001,p1,")), "got: {snapshot}");
        let lines: Vec<&str> = snapshot.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(&format!(",AK-47,0,0,false,{health}")), "got: {}", lines[0]);
        assert!(lines[1].starts_with("2,0,76561198000000002,p2,"), "got: {}", lines[1]);
    }
    assert_eq!(read_text(&mut ws).await, "Ok");

    assert_eq!(request(&mut ws, "current_frame").await, "20");
    assert_eq!(request(&mut ws, "in_game_tick").await, "40");
    assert_eq!(request(&mut ws, "tick_rate").await, "128");

    handle.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn step_and_query() {
    let (handle, _dir) = boot_server().await;
    let mut ws = connect(&handle).await;

    request(&mut ws, "new_parser").await;
    assert_eq!(request(&mut ws, "playing").await, "");
    assert_eq!(request(&mut ws, "parse_next_frame").await, "true");
    assert_eq!(request(&mut ws, "current_frame").await, "1");

    let playing = request(&mut ws, "playing").await;
    assert_eq!(playing.lines().count(), 2);
    assert!(playing.ends_with(",1"), "got: {playing}");

    assert_eq!(request(&mut ws, "parse_to_end").await, "Ok");
    assert_eq!(request(&mut ws, "parse_next_frame").await, "false");

    handle.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn registered_events_are_pushed() {
    let (handle, _dir) = boot_server().await;
    let mut ws = connect(&handle).await;

    request(&mut ws, "new_parser").await;
    assert_eq!(request(&mut ws, "register_event_handler:WeaponFire").await, "Ok");
    assert_eq!(request(&mut ws, "register_event_handler:PlayerHurt").await, "Ok");
    assert_eq!(request(&mut ws, "register_event_handler:WeaponFire").await, "Ok");
    assert_eq!(request(&mut ws, "event_handlers").await, "WeaponFire:1\nPlayerHurt:2");

    send(&mut ws, "parse_to_end").await;
    assert_eq!(read_text(&mut ws).await, "event:WeaponFire, player_id:1, weapon:AK-47, frame:3");
    assert_eq!(
        read_text(&mut ws).await,
        "event:PlayerHurt, attacker_id:0, player_id:2, weapon:Unknown, frame:4"
    );
    assert_eq!(read_text(&mut ws).await, "Ok");

    assert_eq!(request(&mut ws, "unregister_event_handler:1").await, "Ok");
    assert_eq!(request(&mut ws, "event_handlers").await, "PlayerHurt:2");

    handle.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn unknown_task_keeps_connection_open() {
    let (handle, _dir) = boot_server().await;
    let mut ws = connect(&handle).await;

    request(&mut ws, "new_parser").await;
    assert_eq!(request(&mut ws, "parse_everything").await, "Error");
    assert_eq!(request(&mut ws, "register_event_handler:BombPlanted").await, "Error");
    assert_eq!(request(&mut ws, "unregister_event_handler:abc").await, "Error");
    assert_eq!(request(&mut ws, "frame_rate").await, "Error");
    assert_eq!(request(&mut ws, "current_frame").await, "0");
    assert_eq!(request(&mut ws, "test").await, "Test");

    handle.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn invalid_messages_reply_error() {
    let (handle, _dir) = boot_server().await;
    let mut ws = connect(&handle).await;

    for raw in ["{not json", r#"{"path":"x"}"#, r#"{"path":7,"task":"test"}"#] {
        ws.send(Message::text(raw)).await.unwrap();
        assert_eq!(read_text(&mut ws).await, "Error", "for {raw}");
    }
    assert_eq!(request(&mut ws, "test").await, "Test");

    handle.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn binary_requests_get_binary_replies() {
    let (handle, _dir) = boot_server().await;
    let mut ws = connect(&handle).await;

    let msg = json!({"path": RECORDING, "task": "test"}).to_string();
    ws.send(Message::binary(msg.into_bytes())).await.unwrap();
    match next_frame(&mut ws).await {
        Some(Message::Binary(bytes)) => assert_eq!(&bytes[..], b"Test"),
        other => panic!("expected binary frame, got {other:?}"),
    }

    // the marker follows the latest message for the key
    assert_eq!(request(&mut ws, "test").await, "Test");

    handle.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn binary_request_with_invalid_utf8_is_rejected() {
    let (handle, _dir) = boot_server().await;
    let mut ws = connect(&handle).await;

    let mut raw = br#"{"path":"match"#.to_vec();
    raw.extend_from_slice(&[0xff, 0xfe]);
    raw.extend_from_slice(br#".jsonl","task":"new_parser"}"#);
    ws.send(Message::binary(raw)).await.unwrap();
    match next_frame(&mut ws).await {
        Some(Message::Binary(bytes)) => assert_eq!(&bytes[..], b"Error"),
        other => panic!("expected binary frame, got {other:?}"),
    }

    // nothing was opened under a lossy key, and the connection stays usable
    let url = format!("http://127.0.0.1:{}/health", handle.port);
    let body: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
    assert_eq!(body["sessions"], 0);
    assert_eq!(body["counters"]["callerErrors"], 1);
    assert_eq!(request(&mut ws, "test").await, "Test");

    handle.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn close_is_final_and_session_recreates_cleanly() {
    let (handle, _dir) = boot_server().await;
    let mut ws = connect(&handle).await;

    request(&mut ws, "new_parser").await;
    request(&mut ws, "parse_header").await;
    request(&mut ws, "mark_frames:2").await;
    request(&mut ws, "register_event_handler:PlayerHurt").await;

    assert_eq!(request(&mut ws, "close").await, "Ok");
    assert!(next_frame(&mut ws).await.is_none(), "connection should close");

    let mut ws = connect(&handle).await;
    assert_eq!(request(&mut ws, "current_frame").await, "Error");
    assert_eq!(request(&mut ws, "new_parser").await, "Ok");
    assert_eq!(request(&mut ws, "frame_rate").await, "Error");
    assert_eq!(request(&mut ws, "event_handlers").await, "");

    send(&mut ws, "parse_to_end_with_marked_frames").await;
    assert_eq!(read_text(&mut ws).await, "Ok");

    handle.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn missing_recording_closes_connection() {
    let (handle, _dir) = boot_server().await;
    let mut ws = connect(&handle).await;

    let msg = json!({"path": "absent.jsonl", "task": "new_parser"}).to_string();
    ws.send(Message::text(msg)).await.unwrap();
    assert_eq!(read_text(&mut ws).await, "Error");
    assert!(next_frame(&mut ws).await.is_none());

    handle.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn health_reports_sessions_and_connections() {
    let (handle, _dir) = boot_server().await;
    let mut ws = connect(&handle).await;
    request(&mut ws, "new_parser").await;

    let url = format!("http://127.0.0.1:{}/health", handle.port);
    let body: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["sessions"], 1);
    assert_eq!(body["connections"], 1);
    assert_eq!(body["counters"]["commands"], 1);

    handle.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn shutdown_task_acknowledges_and_cancels() {
    let (handle, _dir) = boot_server().await;
    let mut ws = connect(&handle).await;
    let token = handle.shutdown_token();

    assert_eq!(request(&mut ws, "shutdown").await, "Ok");
    timeout(TIMEOUT, token.cancelled()).await.unwrap();
    assert!(handle.is_shutting_down());

    handle.shutdown(Duration::from_secs(2)).await;
}
