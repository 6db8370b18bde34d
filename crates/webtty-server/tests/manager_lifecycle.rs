use std::sync::Arc;
use std::time::Duration;

use webtty_server::config::TerminalConfig;
use webtty_server::error::TermError;
use webtty_server::manager::{AttachTarget, CreateOptions, TerminalManager};
use webtty_server::store::{SessionRow, TermStore};

async fn manager_with_shell(shell: &str) -> Arc<TerminalManager> {
    let store = TermStore::open_in_memory().await.unwrap();
    let manager = TerminalManager::new(
        store,
        TerminalConfig {
            shell: shell.to_string(),
            history_flush_interval: Duration::from_millis(100),
            ..TerminalConfig::default()
        },
    );
    manager.cleanup_on_start().await.unwrap();
    manager
}

#[tokio::test]
async fn create_close_delete_roundtrip() {
    let manager = manager_with_shell("/bin/sh").await;

    let info = manager
        .create(CreateOptions {
            name: "roundtrip".to_string(),
            cwd: "/tmp".to_string(),
            cols: 0,
            rows: 0,
        })
        .await
        .unwrap();

    // Degenerate geometry falls back to 80x24.
    assert_eq!((info.cols, info.rows), (80, 24));
    assert_eq!(info.status, "active");
    assert_eq!(info.pty_status, "running");

    let id = info.id.clone();
    assert!(manager.get(&id).is_some());

    let listed = manager.list().await.unwrap();
    assert!(listed.iter().any(|t| t.id == id));

    manager.close(&id).await.unwrap();
    assert!(manager.get(&id).is_none());

    let row = manager.store().get_session(&id).await.unwrap().unwrap();
    assert_eq!(row.status, "closed");
    assert_eq!(row.pty_status, "exited");

    // Closing again is a no-op success.
    manager.close(&id).await.unwrap();

    manager.delete(&id).await.unwrap();
    assert!(manager.store().get_session(&id).await.unwrap().is_none());
    assert_eq!(manager.store().count_history(&id).await.unwrap(), 0);
    let listed = manager.list().await.unwrap();
    assert!(listed.iter().all(|t| t.id != id));

    // Deleting a deleted session is also fine.
    manager.delete(&id).await.unwrap();
}

#[tokio::test]
async fn empty_cwd_falls_back_to_process_directory() {
    let manager = manager_with_shell("/bin/sh").await;
    let info = manager.create(CreateOptions::default()).await.unwrap();

    let expected = std::env::current_dir().unwrap();
    assert_eq!(info.cwd, expected.to_str().unwrap());

    manager.close(&info.id).await.unwrap();
}

#[tokio::test]
async fn process_exit_is_observed_and_persisted() {
    // A shell that exits immediately.
    let manager = manager_with_shell("/bin/true").await;

    let info = manager
        .create(CreateOptions {
            cwd: "/tmp".to_string(),
            ..CreateOptions::default()
        })
        .await
        .unwrap();
    let id = info.id.clone();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match manager.get(&id) {
                Some(info) if info.pty_status == "exited" => break,
                _ => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
    })
    .await
    .expect("exit was not observed in time");

    let row = manager.store().get_session(&id).await.unwrap().unwrap();
    assert_eq!(row.pty_status, "exited");
    assert_eq!(row.status, "closed");

    // A dead shell still accepts attaches, read-only.
    let target = manager.resolve_attach(&id, false).await.unwrap();
    assert!(matches!(target, AttachTarget::Scrollback(_)));
}

#[tokio::test]
async fn cleanup_on_start_rewrites_stale_running_rows() {
    let store = TermStore::open_in_memory().await.unwrap();

    // A row a crashed server left behind.
    store
        .insert_session(&SessionRow {
            id: "stale".to_string(),
            name: String::new(),
            shell: "/bin/sh".to_string(),
            cwd: "/tmp".to_string(),
            cols: 80,
            rows: 24,
            status: "active".to_string(),
            pty_status: "running".to_string(),
            history_size: 0,
            created_at: 1,
            updated_at: 1,
        })
        .await
        .unwrap();

    let manager = TerminalManager::new(
        store,
        TerminalConfig {
            shell: "/bin/sh".to_string(),
            ..TerminalConfig::default()
        },
    );
    manager.cleanup_on_start().await.unwrap();

    let row = manager.store().get_session("stale").await.unwrap().unwrap();
    assert_eq!(row.status, "closed");
    assert_eq!(row.pty_status, "exited");
}

#[tokio::test]
async fn resize_refuses_inactive_sessions() {
    let manager = manager_with_shell("/bin/sh").await;

    let err = manager.resize("missing", 100, 30).await.unwrap_err();
    assert!(matches!(err, TermError::NotFound(_)));

    // A closed session is inactive too; resize never revives it.
    let info = manager
        .create(CreateOptions {
            cwd: "/tmp".to_string(),
            ..CreateOptions::default()
        })
        .await
        .unwrap();
    manager.close(&info.id).await.unwrap();

    let err = manager.resize(&info.id, 100, 30).await.unwrap_err();
    assert!(matches!(err, TermError::NotFound(_)));
}

#[tokio::test]
async fn attach_to_unknown_id_is_not_found() {
    let manager = manager_with_shell("/bin/sh").await;

    let err = manager.resolve_attach("missing", false).await.unwrap_err();
    assert!(matches!(err, TermError::NotFound(_)));

    let err = manager.resolve_attach("missing", true).await.unwrap_err();
    assert!(matches!(err, TermError::NotFound(_)));
}

#[tokio::test]
async fn periodic_flush_spills_the_ring() {
    let manager = manager_with_shell("/bin/sh").await;

    let info = manager
        .create(CreateOptions {
            cwd: "/tmp".to_string(),
            ..CreateOptions::default()
        })
        .await
        .unwrap();
    let id = info.id.clone();

    // The interactive shell prints a prompt; the ticker spills it.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if manager.store().count_history(&id).await.unwrap() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("flush ticker never spilled the ring");

    let latest = manager
        .store()
        .load_latest_history(&id)
        .await
        .unwrap()
        .unwrap();
    assert!(!latest.is_empty());

    let row = manager.store().get_session(&id).await.unwrap().unwrap();
    assert_eq!(row.history_size, latest.len() as i64);

    manager.close(&id).await.unwrap();
}
