//! Owner of every live terminal session.
//!
//! The manager maps session ids to [`ActiveSession`]s, mediates the control
//! plane (create, list, resize, close, delete, startup reconciliation) and
//! starts the three long-lived tasks each session needs: the sole PTY
//! reader, the process monitor and the history flush ticker. Control-plane
//! errors surface to the caller; data-plane errors are logged and end the
//! task or wait for the next tick.

use std::env;
use std::io::Read;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use axum::extract::ws::WebSocket;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TerminalConfig;
use crate::error::{TermError, TermResult};
use crate::protocol;
use crate::pty::PtyProcess;
use crate::session::ActiveSession;
use crate::store::{now_epoch, Lifecycle, ProcessState, SessionRow, TermStore};
use crate::viewer;

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

type SessionMap = Arc<DashMap<String, Arc<ActiveSession>>>;

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub name: String,
    pub cwd: String,
    pub cols: i64,
    pub rows: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TerminalInfo {
    pub id: String,
    pub name: String,
    pub shell: String,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
    pub status: String,
    pub pty_status: String,
    pub history_size: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Resolved attach destination, decided before the WebSocket upgrade so
/// refusals still map to HTTP status codes.
#[derive(Debug)]
pub enum AttachTarget {
    /// A live session; `fallback_history` carries the durable spill when
    /// the in-memory ring is still empty.
    Live {
        session: Arc<ActiveSession>,
        fallback_history: Option<Vec<u8>>,
    },
    /// Read-only scrollback for a session without a running child.
    Scrollback(Vec<u8>),
}

pub struct TerminalManager {
    store: TermStore,
    cfg: TerminalConfig,
    sessions: SessionMap,
    active_conns: Arc<AtomicI64>,
}

impl TerminalManager {
    pub fn new(store: TermStore, cfg: TerminalConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            cfg: cfg.normalized(),
            sessions: Arc::new(DashMap::new()),
            active_conns: Arc::new(AtomicI64::new(0)),
        })
    }

    pub fn config(&self) -> &TerminalConfig {
        &self.cfg
    }

    pub fn store(&self) -> &TermStore {
        &self.store
    }

    pub fn active_viewer_count(&self) -> i64 {
        self.active_conns.load(Ordering::SeqCst)
    }

    /// Spawn a new shell and persist its session row.
    pub async fn create(&self, opts: CreateOptions) -> TermResult<TerminalInfo> {
        let cwd = resolve_cwd(&opts.cwd);
        let cols = clamp_dimension(opts.cols, DEFAULT_COLS);
        let rows = clamp_dimension(opts.rows, DEFAULT_ROWS);

        let pty = PtyProcess::spawn(
            &self.cfg.shell,
            &[],
            &cwd,
            cols,
            rows,
            self.cfg.close_timeout,
        )?;

        let now = now_epoch();
        let row = SessionRow {
            id: Uuid::new_v4().to_string(),
            name: opts.name,
            shell: self.cfg.shell.clone(),
            cwd,
            cols: cols as i64,
            rows: rows as i64,
            status: Lifecycle::Active.as_str().to_string(),
            pty_status: ProcessState::Running.as_str().to_string(),
            history_size: 0,
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = self.store.insert_session(&row).await {
            pty.close().await;
            return Err(e);
        }

        let session = self.install_session(&row, pty);
        info!(session = %session.id, shell = %session.shell, cwd = %session.cwd, "terminal created");
        Ok(self.active_info(&session))
    }

    /// Active sessions only; a `None` here with an existing durable row
    /// means "inactive".
    pub fn get(&self, id: &str) -> Option<TerminalInfo> {
        self.sessions.get(id).map(|s| self.active_info(s.value()))
    }

    pub async fn list(&self) -> TermResult<Vec<TerminalInfo>> {
        let rows = self.store.list_sessions().await?;
        Ok(rows.iter().map(row_to_info).collect())
    }

    /// Resize a live session's PTY and persist the new geometry. Never
    /// fabricates an active session for an inactive id.
    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> TermResult<()> {
        let session = self
            .sessions
            .get(id)
            .map(|s| s.value().clone())
            .ok_or_else(|| TermError::NotFound(id.to_string()))?;

        session.pty.resize(cols, rows)?;
        session.set_size(cols, rows);
        session.touch(now_epoch());

        if let Err(e) = self.store.update_size(id, cols, rows).await {
            warn!(session = %id, error = %e, "resize row update failed");
        }
        Ok(())
    }

    /// Tear down a live session. A no-op for unknown or already-closed ids.
    pub async fn close(&self, id: &str) -> TermResult<()> {
        let Some((_, session)) = self.sessions.remove(id) else {
            return Ok(());
        };

        session.cancel_viewers();
        session.shutdown.cancel();

        if let Err(e) = flush_session(&self.store, &session, self.cfg.history_max_records).await {
            warn!(session = %id, error = %e, "final history flush failed");
        }

        session.pty.close().await;

        if let Err(e) = self.store.mark_closed_exited(id).await {
            warn!(session = %id, error = %e, "close row update failed");
        }

        info!(session = %id, "terminal closed");
        Ok(())
    }

    /// Close, then purge the durable row and all of its history chunks.
    pub async fn delete(&self, id: &str) -> TermResult<()> {
        self.close(id).await?;
        self.store.delete_session(id).await?;
        info!(session = %id, "terminal deleted");
        Ok(())
    }

    /// Startup reconciliation. Must run before any viewer may attach: a
    /// stale `running` row would otherwise claim a child this process does
    /// not own.
    pub async fn cleanup_on_start(&self) -> TermResult<()> {
        let reconciled = self.store.mark_all_exited().await?;
        if reconciled > 0 {
            info!(sessions = reconciled, "reconciled stale running sessions");
        }
        Ok(())
    }

    /// Drop history chunks older than the configured max age.
    pub async fn cleanup_expired_history(&self) -> TermResult<()> {
        if self.cfg.history_max_age.is_zero() {
            return Ok(());
        }
        let cutoff = now_epoch() - self.cfg.history_max_age.as_secs() as i64;
        let dropped = self.store.prune_history_by_age(cutoff).await?;
        if dropped > 0 {
            info!(chunks = dropped, "pruned expired history");
        }
        Ok(())
    }

    /// Resolve an attach request against the three-way policy: live
    /// session, reactivation, or read-only scrollback. A dead shell still
    /// accepts attaches; without the reactivate flag it is observed
    /// read-only.
    pub async fn resolve_attach(&self, id: &str, reactivate: bool) -> TermResult<AttachTarget> {
        if let Some(session) = self.sessions.get(id).map(|s| s.value().clone()) {
            if session.process() == ProcessState::Running {
                self.check_connection_cap()?;
                return Ok(AttachTarget::Live {
                    fallback_history: self.ring_fallback(&session).await,
                    session,
                });
            }

            if !reactivate {
                let snapshot = session.ring_snapshot();
                let history = if snapshot.is_empty() {
                    self.store.load_latest_history(id).await?.unwrap_or_default()
                } else {
                    snapshot
                };
                return Ok(AttachTarget::Scrollback(history));
            }

            // The recorded shell died under this session; retire it before
            // spawning a replacement.
            self.close(id).await?;
        }

        if reactivate {
            let session = self.reactivate(id).await?;
            self.check_connection_cap()?;
            return Ok(AttachTarget::Live {
                fallback_history: self.ring_fallback(&session).await,
                session,
            });
        }

        // Read-only observation of an inactive session.
        if self.store.get_session(id).await?.is_none() {
            return Err(TermError::NotFound(id.to_string()));
        }
        let history = self.store.load_latest_history(id).await?.unwrap_or_default();
        Ok(AttachTarget::Scrollback(history))
    }

    /// Serve a resolved attach until the viewer detaches.
    pub async fn serve_ws(&self, target: AttachTarget, socket: WebSocket) {
        match target {
            AttachTarget::Live {
                session,
                fallback_history,
            } => {
                viewer::serve_live(
                    session.clone(),
                    socket,
                    fallback_history,
                    self.cfg.buffer_size,
                    self.active_conns.clone(),
                )
                .await;
                reap_if_exited(&self.sessions, &session);
            }
            AttachTarget::Scrollback(history) => {
                viewer::serve_scrollback(socket, history).await;
            }
        }
    }

    /// Rebuild an active session from its durable row: a fresh shell with
    /// the recorded program, directory and geometry. Prior in-memory shell
    /// state is gone; only the spilled scrollback gives continuity.
    async fn reactivate(&self, id: &str) -> TermResult<Arc<ActiveSession>> {
        let row = self
            .store
            .get_session(id)
            .await?
            .ok_or_else(|| TermError::NotFound(id.to_string()))?;

        let cols = clamp_dimension(row.cols, DEFAULT_COLS);
        let rows = clamp_dimension(row.rows, DEFAULT_ROWS);
        let pty = PtyProcess::spawn(
            &row.shell,
            &[],
            &row.cwd,
            cols,
            rows,
            self.cfg.close_timeout,
        )?;

        self.store.mark_active_running(id).await?;

        let row = SessionRow {
            status: Lifecycle::Active.as_str().to_string(),
            pty_status: ProcessState::Running.as_str().to_string(),
            updated_at: now_epoch(),
            ..row
        };

        let session = self.install_session(&row, pty);
        info!(session = %id, shell = %session.shell, "terminal reactivated");
        Ok(session)
    }

    /// Insert the session into the map and start its three tasks. If a
    /// racing caller installed the id first, the freshly spawned shell is
    /// discarded so at most one active session exists per id.
    fn install_session(&self, row: &SessionRow, pty: PtyProcess) -> Arc<ActiveSession> {
        let pty = Arc::new(pty);
        let session = Arc::new(ActiveSession::new(
            row,
            pty.clone(),
            self.cfg.history_buffer_size,
        ));

        match self.sessions.entry(row.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                let existing = existing.get().clone();
                tokio::spawn(async move { pty.close().await });
                return existing;
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(session.clone());
            }
        }

        tokio::spawn(read_loop(session.clone(), self.cfg.buffer_size));
        tokio::spawn(monitor_process(
            self.store.clone(),
            self.sessions.clone(),
            session.clone(),
            self.cfg.history_max_records,
        ));
        tokio::spawn(flush_loop(
            self.store.clone(),
            session.clone(),
            self.cfg.history_flush_interval,
            self.cfg.history_max_records,
        ));

        session
    }

    async fn ring_fallback(&self, session: &ActiveSession) -> Option<Vec<u8>> {
        if !session.ring_is_empty() {
            return None;
        }
        match self.store.load_latest_history(&session.id).await {
            Ok(history) => history,
            Err(e) => {
                warn!(session = %session.id, error = %e, "history load failed");
                None
            }
        }
    }

    fn check_connection_cap(&self) -> TermResult<()> {
        if self.cfg.max_connections > 0
            && self.active_conns.load(Ordering::SeqCst) >= self.cfg.max_connections
        {
            return Err(TermError::MaxConnectionsReached);
        }
        Ok(())
    }

    fn active_info(&self, session: &ActiveSession) -> TerminalInfo {
        let (cols, rows) = session.size();
        TerminalInfo {
            id: session.id.clone(),
            name: session.name.clone(),
            shell: session.shell.clone(),
            cwd: session.cwd.clone(),
            cols,
            rows,
            status: Lifecycle::Active.as_str().to_string(),
            pty_status: session.process().as_str().to_string(),
            history_size: session.history_size(),
            created_at: session.created_at,
            updated_at: session.updated_at(),
        }
    }
}

/// Sole reader of a session's PTY: read, record into the ring, fan out to
/// viewers. Any read error means the child is gone.
async fn read_loop(session: Arc<ActiveSession>, buffer_size: usize) {
    let Some(mut reader) = session.pty.take_reader() else {
        return;
    };
    let max_raw = protocol::max_raw_frame_len(buffer_size);
    let mut buf = vec![0u8; max_raw];

    loop {
        if session.shutdown.is_cancelled() {
            break;
        }

        let joined = tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            let mut buf = buf;
            let result = reader.read(&mut buf);
            (reader, buf, result)
        })
        .await;

        let Ok((returned_reader, returned_buf, result)) = joined else {
            break;
        };
        reader = returned_reader;
        buf = returned_buf;

        match result {
            Ok(0) | Err(_) => break,
            Ok(n) => session.record_output(&buf[..n]),
        }
    }

    debug!(session = %session.id, "pty read loop finished");
}

/// Wait for the child to exit, then persist the status change and spill
/// whatever the ring holds. Skipped when the session was already closed
/// through the control plane, which does its own final flush. Attached
/// viewers stay attached; the session is destroyed when the last one
/// leaves.
async fn monitor_process(
    store: TermStore,
    sessions: SessionMap,
    session: Arc<ActiveSession>,
    max_records: i64,
) {
    session.pty.wait_exited().await;
    session.set_process(ProcessState::Exited);

    if !sessions.contains_key(&session.id) {
        return;
    }

    debug!(session = %session.id, "child process exited");
    if let Err(e) = store.mark_closed_exited(&session.id).await {
        warn!(session = %session.id, error = %e, "exit row update failed");
    }
    if let Err(e) = flush_session(&store, &session, max_records).await {
        warn!(session = %session.id, error = %e, "exit history flush failed");
    }
}

/// Periodic spill of the ring to the store. A failed flush leaves the ring
/// untouched and retries on the next tick.
async fn flush_loop(
    store: TermStore,
    session: Arc<ActiveSession>,
    interval: std::time::Duration,
    max_records: i64,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = session.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = flush_session(&store, &session, max_records).await {
                    warn!(session = %session.id, error = %e, "history flush failed");
                }
            }
        }
    }
}

async fn flush_session(
    store: &TermStore,
    session: &ActiveSession,
    max_records: i64,
) -> TermResult<()> {
    let data = session.ring_snapshot();
    if data.is_empty() {
        return Ok(());
    }
    store.flush_history(&session.id, &data, max_records).await?;
    session.set_history_size(data.len() as i64);
    session.touch(now_epoch());
    Ok(())
}

/// Destroy a session whose child has exited once its last viewer is gone.
/// The durable row was already rewritten by the monitor.
fn reap_if_exited(sessions: &SessionMap, session: &Arc<ActiveSession>) {
    if session.process() == ProcessState::Exited && session.viewer_count() == 0 {
        if sessions.remove(&session.id).is_some() {
            session.shutdown.cancel();
            debug!(session = %session.id, "exited session reaped");
        }
    }
}

fn row_to_info(row: &SessionRow) -> TerminalInfo {
    TerminalInfo {
        id: row.id.clone(),
        name: row.name.clone(),
        shell: row.shell.clone(),
        cwd: row.cwd.clone(),
        cols: row.cols as u16,
        rows: row.rows as u16,
        status: row.status.clone(),
        pty_status: row.pty_status.clone(),
        history_size: row.history_size,
        created_at: row.created_at,
        updated_at: row.updated_at,
    }
}

fn clamp_dimension(value: i64, default: u16) -> u16 {
    if value <= 0 || value > u16::MAX as i64 {
        default
    } else {
        value as u16
    }
}

fn resolve_cwd(requested: &str) -> String {
    if !requested.is_empty() {
        return requested.to_string();
    }
    env::current_dir()
        .ok()
        .and_then(|p| p.to_str().map(String::from))
        .or_else(|| env::var("HOME").ok())
        .unwrap_or_else(|| "/".to_string())
}
