//! Child shell attached to a pseudo-terminal.
//!
//! One `PtyProcess` owns the PTY master, the child's killer handle and an
//! exit signal. The manager's read loop is the sole reader; it takes the
//! reader half exactly once. Any read or write error is terminal for the
//! process: callers treat it as "child gone" and stop.

use std::io::{Read, Write};
use std::time::Duration;

use parking_lot::Mutex;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::watch;
use tracing::debug;

use crate::error::{TermError, TermResult};

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess")
            .field("command", &self.command)
            .field("argv", &self.argv)
            .field("cwd", &self.cwd)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

pub struct PtyProcess {
    command: String,
    argv: Vec<String>,
    cwd: String,
    pid: u32,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    exited: watch::Receiver<bool>,
    close_timeout: Duration,
}

impl PtyProcess {
    pub fn spawn(
        shell: &str,
        args: &[String],
        cwd: &str,
        cols: u16,
        rows: u16,
        close_timeout: Duration,
    ) -> TermResult<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TermError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(shell);
        cmd.args(args);
        cmd.cwd(cwd);
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TermError::SpawnFailed(e.to_string()))?;
        drop(pair.slave);

        let pid = child.process_id().unwrap_or(0);
        let killer = child.clone_killer();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TermError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| TermError::SpawnFailed(e.to_string()))?;

        let (exit_tx, exit_rx) = watch::channel(false);
        let wait_pid = pid;
        std::thread::spawn(move || {
            let mut child = child;
            let status = child.wait();
            debug!(pid = wait_pid, ?status, "pty child exited");
            let _ = exit_tx.send(true);
        });

        Ok(Self {
            command: shell.to_string(),
            argv: args.to_vec(),
            cwd: cwd.to_string(),
            pid,
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            reader: Mutex::new(Some(reader)),
            killer: Mutex::new(killer),
            exited: exit_rx,
            close_timeout,
        })
    }

    /// Hand out the reader half. The first caller becomes the sole reader.
    pub fn take_reader(&self) -> Option<Box<dyn Read + Send>> {
        self.reader.lock().take()
    }

    /// Forward client keystrokes unchanged. Any error means the child side
    /// of the PTY is gone and this host is finished.
    pub fn write_input(&self, data: &[u8]) -> TermResult<()> {
        let mut writer = self.writer.lock();
        writer
            .write_all(data)
            .and_then(|_| writer.flush())
            .map_err(|_| TermError::PtyClosed)
    }

    pub fn resize(&self, cols: u16, rows: u16) -> TermResult<()> {
        self.master
            .lock()
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TermError::ResizeFailed(e.to_string()))
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Resolves once the child has exited, however it died.
    pub async fn wait_exited(&self) {
        let mut rx = self.exited.clone();
        let _ = rx.wait_for(|exited| *exited).await;
    }

    /// Ask the child to terminate and wait, bounded by the close timeout.
    /// Returns regardless; the child may outlive the wait.
    pub async fn close(&self) {
        {
            let mut killer = self.killer.lock();
            let _ = killer.kill();
        }
        let _ = tokio::time::timeout(self.close_timeout, self.wait_exited()).await;
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn title_variables(&self) -> serde_json::Value {
        serde_json::json!({
            "command": self.command,
            "argv": self.argv,
            "pid": self.pid,
            "cwd": self.cwd,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_sh(script: &str) -> PtyProcess {
        PtyProcess::spawn(
            "/bin/sh",
            &["-c".to_string(), script.to_string()],
            "/tmp",
            80,
            24,
            Duration::from_secs(5),
        )
        .expect("spawn")
    }

    #[tokio::test]
    async fn exit_signal_fires_when_child_exits() {
        let pty = spawn_sh("exit 0");
        tokio::time::timeout(Duration::from_secs(5), pty.wait_exited())
            .await
            .expect("child did not exit in time");
        assert!(pty.has_exited());
    }

    #[tokio::test]
    async fn close_terminates_a_long_running_child() {
        let pty = spawn_sh("sleep 60");
        assert!(!pty.has_exited());
        pty.close().await;
        assert!(pty.has_exited());
    }

    #[tokio::test]
    async fn reader_sees_child_output() {
        let pty = spawn_sh("printf marker; sleep 60");
        let mut reader = pty.take_reader().expect("reader available once");
        assert!(pty.take_reader().is_none());

        let collected = tokio::task::spawn_blocking(move || {
            let mut collected = Vec::new();
            let mut buf = [0u8; 256];
            while !collected.windows(6).any(|w| w == b"marker") {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => collected.extend_from_slice(&buf[..n]),
                }
            }
            collected
        });
        let collected = tokio::time::timeout(Duration::from_secs(5), collected)
            .await
            .expect("no output in time")
            .unwrap();
        assert!(collected.windows(6).any(|w| w == b"marker"));
        pty.close().await;
    }

    #[tokio::test]
    async fn title_variables_describe_the_command() {
        let pty = spawn_sh("sleep 60");
        let vars = pty.title_variables();
        assert_eq!(vars["command"], "/bin/sh");
        assert_eq!(vars["cwd"], "/tmp");
        assert!(vars["pid"].as_u64().unwrap() > 0);
        pty.close().await;
    }
}
