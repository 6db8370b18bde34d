//! Persistent, shareable web terminal sessions.
//!
//! The manager owns PTY-backed shells that outlive any single WebSocket
//! client: output is kept in a bounded in-memory ring, spilled periodically
//! to SQLite, and replayed to every viewer on attach. The router here is
//! the thin HTTP/WS surface over [`manager::TerminalManager`].

pub mod config;
pub mod error;
pub mod history;
pub mod manager;
pub mod protocol;
pub mod pty;
pub mod session;
pub mod store;
mod viewer;

use std::sync::Arc;

use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::TermError;
use crate::manager::{CreateOptions, TerminalManager};

pub struct AppState {
    pub manager: Arc<TerminalManager>,
}

impl AppState {
    pub fn new(manager: Arc<TerminalManager>) -> Arc<Self> {
        Arc::new(Self { manager })
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/terminal/list", get(list_terminals))
        .route("/api/terminal/new", post(new_terminal))
        .route("/api/terminal/close", post(close_terminal))
        .route("/api/terminal/resize/:id", post(resize_terminal))
        .route("/api/terminal/:id", delete(delete_terminal))
        .route("/api/terminal/ws/:id", get(ws_terminal))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct NewTerminalRequest {
    pub name: String,
    pub cwd: String,
    pub cols: i64,
    pub rows: i64,
}

#[derive(Debug, Deserialize)]
pub struct CloseTerminalRequest {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct ResizeTerminalRequest {
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AttachQuery {
    pub reactivate: bool,
}

async fn list_terminals(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, TermError> {
    let terminals = state.manager.list().await?;
    Ok(Json(serde_json::json!({ "terminals": terminals })))
}

async fn new_terminal(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NewTerminalRequest>,
) -> Result<impl IntoResponse, TermError> {
    let info = state
        .manager
        .create(CreateOptions {
            name: request.name,
            cwd: request.cwd,
            cols: request.cols,
            rows: request.rows,
        })
        .await?;
    Ok(Json(serde_json::json!({ "ok": true, "id": info.id, "name": info.name })))
}

async fn close_terminal(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CloseTerminalRequest>,
) -> Result<impl IntoResponse, TermError> {
    state.manager.close(&request.id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn resize_terminal(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<ResizeTerminalRequest>,
) -> Result<impl IntoResponse, TermError> {
    state
        .manager
        .resize(&id, request.cols, request.rows)
        .await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn delete_terminal(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, TermError> {
    state.manager.delete(&id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn ws_terminal(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    Query(query): Query<AttachQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, TermError> {
    let target = state.manager.resolve_attach(&id, query.reactivate).await?;
    let manager = state.manager.clone();
    Ok(ws.on_upgrade(move |socket| async move {
        manager.serve_ws(target, socket).await;
    }))
}
