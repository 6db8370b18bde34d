//! In-memory half of a live terminal session.
//!
//! An `ActiveSession` exists exactly while the durable row is `active` and
//! the child shell is owned by this process. It carries the scrollback ring,
//! the broadcast channel that fans framed output out to viewers, and the
//! cancel handles of every attached viewer.
//!
//! Replay ordering: `record_output` pushes to the ring and broadcasts while
//! holding the ring lock, and `subscribe_with_replay` subscribes and
//! snapshots under the same lock. A viewer therefore observes exactly
//! snapshot-then-live-suffix, with no gap and no duplicate.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::history::HistoryRing;
use crate::protocol;
use crate::pty::PtyProcess;
use crate::store::{ProcessState, SessionRow};

const OUTPUT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
pub(crate) struct ViewerHandle {
    pub cancel: CancellationToken,
}

#[derive(Debug)]
pub struct ActiveSession {
    pub id: String,
    pub name: String,
    pub shell: String,
    pub cwd: String,
    pub created_at: i64,
    pub pty: Arc<PtyProcess>,
    size: RwLock<(u16, u16)>,
    process: RwLock<ProcessState>,
    history_size: AtomicI64,
    updated_at: AtomicI64,
    ring: Mutex<HistoryRing>,
    output_tx: broadcast::Sender<String>,
    pub(crate) viewers: DashMap<Uuid, ViewerHandle>,
    pub shutdown: CancellationToken,
}

impl ActiveSession {
    pub fn new(row: &SessionRow, pty: Arc<PtyProcess>, ring_capacity: usize) -> Self {
        let (output_tx, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        Self {
            id: row.id.clone(),
            name: row.name.clone(),
            shell: row.shell.clone(),
            cwd: row.cwd.clone(),
            created_at: row.created_at,
            pty,
            size: RwLock::new((row.cols as u16, row.rows as u16)),
            process: RwLock::new(ProcessState::Running),
            history_size: AtomicI64::new(row.history_size),
            updated_at: AtomicI64::new(row.updated_at),
            ring: Mutex::new(HistoryRing::new(ring_capacity)),
            output_tx,
            viewers: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Record one PTY read: scrollback first, then broadcast the framed
    /// bytes to every subscribed viewer. Both happen under the ring lock so
    /// attaching viewers cannot observe a gap between replay and live.
    pub fn record_output(&self, raw: &[u8]) {
        if raw.is_empty() {
            return;
        }
        let frame = protocol::output_frame(raw);
        let mut ring = self.ring.lock();
        ring.push(raw);
        let _ = self.output_tx.send(frame);
    }

    /// Subscribe to live output and snapshot the scrollback atomically.
    pub fn subscribe_with_replay(&self) -> (Vec<u8>, broadcast::Receiver<String>) {
        let ring = self.ring.lock();
        let rx = self.output_tx.subscribe();
        (ring.snapshot(), rx)
    }

    pub fn ring_snapshot(&self) -> Vec<u8> {
        self.ring.lock().snapshot()
    }

    pub fn ring_is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }

    pub fn process(&self) -> ProcessState {
        *self.process.read()
    }

    pub fn set_process(&self, state: ProcessState) {
        *self.process.write() = state;
    }

    pub fn size(&self) -> (u16, u16) {
        *self.size.read()
    }

    pub fn set_size(&self, cols: u16, rows: u16) {
        *self.size.write() = (cols, rows);
    }

    pub fn history_size(&self) -> i64 {
        self.history_size.load(Ordering::Relaxed)
    }

    pub fn set_history_size(&self, size: i64) {
        self.history_size.store(size, Ordering::Relaxed);
    }

    pub fn updated_at(&self) -> i64 {
        self.updated_at.load(Ordering::Relaxed)
    }

    pub fn touch(&self, now: i64) {
        self.updated_at.store(now, Ordering::Relaxed);
    }

    pub(crate) fn register_viewer(&self, id: Uuid, cancel: CancellationToken) {
        self.viewers.insert(id, ViewerHandle { cancel });
    }

    pub(crate) fn deregister_viewer(&self, id: &Uuid) {
        self.viewers.remove(id);
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    pub fn cancel_viewers(&self) {
        for entry in self.viewers.iter() {
            entry.value().cancel.cancel();
        }
    }
}
