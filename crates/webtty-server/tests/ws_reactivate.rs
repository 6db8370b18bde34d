use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use webtty_server::config::TerminalConfig;
use webtty_server::manager::TerminalManager;
use webtty_server::protocol;
use webtty_server::store::TermStore;
use webtty_server::{build_router, AppState};

type Ws = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn start_server(cfg: TerminalConfig) -> (String, String, Arc<TerminalManager>) {
    let store = TermStore::open_in_memory().await.unwrap();
    let manager = TerminalManager::new(store, cfg);
    manager.cleanup_on_start().await.unwrap();

    let app = build_router(AppState::new(manager.clone()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}"), format!("ws://{addr}"), manager)
}

fn decode_output(msg: &Message) -> Option<Vec<u8>> {
    let Message::Text(text) = msg else { return None };
    let bytes = text.as_bytes();
    if bytes.first() != Some(&protocol::MSG_OUTPUT) {
        return None;
    }
    BASE64.decode(&bytes[1..]).ok()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

async fn await_output(ws: &mut Ws, needle: &[u8]) {
    tokio::time::timeout(Duration::from_secs(5), async {
        let mut seen = Vec::new();
        loop {
            let msg = ws.next().await.unwrap().unwrap();
            if let Some(out) = decode_output(&msg) {
                seen.extend_from_slice(&out);
                if contains(&seen, needle) {
                    break;
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {:?}", String::from_utf8_lossy(needle)));
}

#[tokio::test]
async fn closed_session_serves_scrollback_and_reactivates() {
    let (base, ws_base, manager) = start_server(TerminalConfig {
        shell: "/bin/sh".to_string(),
        history_flush_interval: Duration::from_millis(100),
        ..TerminalConfig::default()
    })
    .await;

    let client = Client::builder().no_proxy().build().unwrap();
    let v: serde_json::Value = client
        .post(format!("{base}/api/terminal/new"))
        .json(&json!({ "name": "persistent", "cwd": "/tmp", "cols": 80, "rows": 24 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = v["id"].as_str().unwrap().to_string();
    let url = format!("{ws_base}/api/terminal/ws/{id}");

    let (mut viewer, _) = connect_async(&url).await.unwrap();
    viewer
        .send(Message::Text(protocol::input_frame(b"echo persist-me\n")))
        .await
        .unwrap();
    await_output(&mut viewer, b"persist-me").await;
    drop(viewer);

    // Close flushes the ring to the store and retires the session.
    let resp = client
        .post(format!("{base}/api/terminal/close"))
        .json(&json!({ "id": id }))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    assert!(manager.get(&id).is_none());

    let row = manager.store().get_session(&id).await.unwrap().unwrap();
    assert_eq!(row.status, "closed");
    assert_eq!(row.pty_status, "exited");

    // Without the reactivate flag the attach is read-only: one replay
    // frame from the durable spill, then the socket closes.
    let (mut scrollback, _) = connect_async(&url).await.unwrap();
    let replay = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match scrollback.next().await {
                Some(Ok(msg)) => {
                    if let Some(out) = decode_output(&msg) {
                        return out;
                    }
                }
                Some(Err(_)) | None => panic!("socket closed before replay"),
            }
        }
    })
    .await
    .expect("no replay frame in time");
    assert!(contains(&replay, b"persist-me"));

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match scrollback.next().await {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            }
        }
    })
    .await
    .expect("read-only attach must close promptly");

    // Still closed: a read-only observation changes no state.
    assert!(manager.get(&id).is_none());

    // Reactivation spawns a fresh shell from the recorded row.
    let (mut revived, _) = connect_async(format!("{url}?reactivate=true"))
        .await
        .unwrap();
    revived
        .send(Message::Text(protocol::input_frame(b"echo revived\n")))
        .await
        .unwrap();
    await_output(&mut revived, b"revived").await;

    let info = manager.get(&id).expect("session is active again");
    assert_eq!(info.pty_status, "running");
    let row = manager.store().get_session(&id).await.unwrap().unwrap();
    assert_eq!(row.status, "active");
    assert_eq!(row.pty_status, "running");
}

#[tokio::test]
async fn reactivate_unknown_session_is_not_found() {
    let (_base, ws_base, _manager) = start_server(TerminalConfig {
        shell: "/bin/sh".to_string(),
        ..TerminalConfig::default()
    })
    .await;

    let err =
        connect_async(format!("{ws_base}/api/terminal/ws/missing?reactivate=true")).await;
    assert!(err.is_err());
}

#[tokio::test]
async fn delete_purges_history_with_the_row() {
    let (base, ws_base, manager) = start_server(TerminalConfig {
        shell: "/bin/sh".to_string(),
        history_flush_interval: Duration::from_millis(100),
        ..TerminalConfig::default()
    })
    .await;

    let client = Client::builder().no_proxy().build().unwrap();
    let v: serde_json::Value = client
        .post(format!("{base}/api/terminal/new"))
        .json(&json!({ "cwd": "/tmp" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = v["id"].as_str().unwrap().to_string();

    let (mut viewer, _) = connect_async(format!("{ws_base}/api/terminal/ws/{id}"))
        .await
        .unwrap();
    viewer
        .send(Message::Text(protocol::input_frame(b"echo doomed\n")))
        .await
        .unwrap();
    await_output(&mut viewer, b"doomed").await;
    drop(viewer);

    let resp = client
        .delete(format!("{base}/api/terminal/{id}"))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    assert!(manager.get(&id).is_none());
    assert!(manager.store().get_session(&id).await.unwrap().is_none());
    assert_eq!(manager.store().count_history(&id).await.unwrap(), 0);

    // List no longer mentions the id.
    let listed: serde_json::Value = client
        .get(format!("{base}/api/terminal/list"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let terminals = listed["terminals"].as_array().unwrap();
    assert!(terminals.iter().all(|t| t["id"] != id.as_str()));
}
