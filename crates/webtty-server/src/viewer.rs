//! One attached WebSocket client.
//!
//! A viewer runs two loops: the current task parses inbound frames and
//! drives the PTY, while a spawned task forwards broadcast output to the
//! socket. Every outbound frame goes through one async mutex around the
//! sink, so frames are never interleaved. Either loop ending cancels the
//! viewer; the session itself stays alive when the last viewer leaves.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::{self, ResizeMessage};
use crate::session::ActiveSession;

type WsSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Serve a viewer attached to a live session. Returns when the viewer
/// detaches; the caller owns session lifecycle.
pub(crate) async fn serve_live(
    session: Arc<ActiveSession>,
    socket: WebSocket,
    fallback_history: Option<Vec<u8>>,
    buffer_size: usize,
    active_conns: Arc<AtomicI64>,
) {
    let viewer_id = Uuid::new_v4();
    let cancel = CancellationToken::new();
    let (ws_tx, mut ws_rx) = socket.split();
    let ws_tx: WsSink = Arc::new(Mutex::new(ws_tx));

    {
        let mut tx = ws_tx.lock().await;
        let title = protocol::window_title_frame(&session.pty.title_variables());
        if tx.send(Message::Text(title)).await.is_err() {
            return;
        }
        if tx
            .send(Message::Text(protocol::buffer_size_frame(buffer_size)))
            .await
            .is_err()
        {
            return;
        }
    }

    // Subscribe and snapshot atomically, then fall back to the durable
    // spill when the ring has nothing (fresh reactivation).
    let (snapshot, mut output_rx) = session.subscribe_with_replay();
    let replay = if snapshot.is_empty() {
        fallback_history.unwrap_or_default()
    } else {
        snapshot
    };

    session.register_viewer(viewer_id, cancel.clone());
    active_conns.fetch_add(1, Ordering::SeqCst);
    debug!(session = %session.id, viewer = %viewer_id, "viewer attached");

    let send_cancel = cancel.clone();
    let send_sink = ws_tx.clone();
    let send_session = session.id.clone();
    let send_task = tokio::spawn(async move {
        if !replay.is_empty() {
            let frame = protocol::output_frame(&replay);
            if send_sink.lock().await.send(Message::Text(frame)).await.is_err() {
                send_cancel.cancel();
                return;
            }
        }

        loop {
            tokio::select! {
                _ = send_cancel.cancelled() => break,
                received = output_rx.recv() => match received {
                    Ok(frame) => {
                        if send_sink.lock().await.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    // Closed, or this viewer lagged too far behind the PTY.
                    Err(e) => {
                        debug!(session = %send_session, viewer = %viewer_id, error = %e,
                               "output forwarding stopped");
                        break;
                    }
                },
            }
        }
        send_cancel.cancel();
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if !handle_frame(&session, &ws_tx, text.as_bytes()).await {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if !handle_frame(&session, &ws_tx, &data).await {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session = %session.id, viewer = %viewer_id, error = %e,
                           "viewer receive error");
                    break;
                }
            },
        }
    }

    cancel.cancel();
    let _ = send_task.await;
    session.deregister_viewer(&viewer_id);
    active_conns.fetch_sub(1, Ordering::SeqCst);
    let _ = ws_tx.lock().await.send(Message::Close(None)).await;
    debug!(session = %session.id, viewer = %viewer_id, "viewer detached");
}

/// Dispatch one inbound frame. Returns false when the viewer should stop.
/// Malformed frames are dropped without ending the viewer.
async fn handle_frame(session: &ActiveSession, ws_tx: &WsSink, data: &[u8]) -> bool {
    let Some((&tag, payload)) = data.split_first() else {
        return true;
    };

    match tag {
        protocol::MSG_INPUT => {
            let input = protocol::decode_input(payload);
            if let Err(e) = session.pty.write_input(&input) {
                warn!(session = %session.id, error = %e, "pty write failed");
                return false;
            }
        }
        protocol::MSG_PING => {
            if ws_tx
                .lock()
                .await
                .send(Message::Text(protocol::pong_frame()))
                .await
                .is_err()
            {
                return false;
            }
        }
        protocol::MSG_RESIZE => {
            if let Ok(resize) = serde_json::from_slice::<ResizeMessage>(payload) {
                if session.pty.resize(resize.cols, resize.rows).is_ok() {
                    session.set_size(resize.cols, resize.rows);
                }
            }
        }
        _ => {}
    }

    true
}

/// Serve a read-only attach to an inactive session: a single replay frame
/// from the durable spill, then close.
pub(crate) async fn serve_scrollback(socket: WebSocket, history: Vec<u8>) {
    let (mut ws_tx, _ws_rx) = socket.split();
    if !history.is_empty() {
        let frame = protocol::output_frame(&history);
        let _ = ws_tx.send(Message::Text(frame)).await;
    }
    let _ = ws_tx.send(Message::Close(None)).await;
}
