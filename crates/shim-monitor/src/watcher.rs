//! Watches the shim socket directory for new/removed sandbox sockets and
//! feeds those changes to the sandbox cache. Retries on a timer if the
//! directory does not exist yet, rather than failing at startup — the
//! monitor is expected to start before any shim has ever run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;

const MISSING_DIR_RETRY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub enum SocketChange {
    Appeared { sandbox_id: String, path: PathBuf },
    Disappeared { sandbox_id: String },
}

/// Extracts the sandbox id from a shim socket's file name, assuming the
/// `kata-shim-<sandbox-id>` naming convention.
fn sandbox_id_from_path(path: &Path) -> Option<String> {
    path.file_name()?
        .to_str()?
        .strip_prefix("kata-shim-")
        .map(str::to_string)
}

/// Spawns the watch loop and returns a channel of socket changes. Runs
/// until the returned sender half (held internally) is dropped, i.e. for
/// the lifetime of the process.
pub fn spawn(watch_dir: PathBuf) -> mpsc::Receiver<SocketChange> {
    let (tx, rx) = mpsc::channel(64);

    tokio::spawn(async move {
        loop {
            if !watch_dir.is_dir() {
                tokio::time::sleep(MISSING_DIR_RETRY).await;
                continue;
            }
            if let Err(err) = watch_once(&watch_dir, &tx).await {
                tracing::warn!(dir = %watch_dir.display(), %err, "socket watcher failed, retrying");
                tokio::time::sleep(MISSING_DIR_RETRY).await;
            }
        }
    });

    rx
}

async fn watch_once(dir: &Path, tx: &mpsc::Sender<SocketChange>) -> notify::Result<()> {
    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();

    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = notify_tx.send(res);
    })?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;

    // Seed with whatever sockets already exist.
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            if let Some(sandbox_id) = sandbox_id_from_path(&entry.path()) {
                let _ = tx
                    .send(SocketChange::Appeared {
                        sandbox_id,
                        path: entry.path(),
                    })
                    .await;
            }
        }
    }

    while let Some(res) = notify_rx.recv().await {
        let event = res?;
        match event.kind {
            EventKind::Create(_) => {
                for path in event.paths {
                    if let Some(sandbox_id) = sandbox_id_from_path(&path) {
                        let _ = tx.send(SocketChange::Appeared { sandbox_id, path }).await;
                    }
                }
            }
            EventKind::Remove(_) => {
                for path in event.paths {
                    if let Some(sandbox_id) = sandbox_id_from_path(&path) {
                        let _ = tx.send(SocketChange::Disappeared { sandbox_id }).await;
                    }
                }
            }
            _ => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_sandbox_id_from_conventional_name() {
        let p = PathBuf::from("/run/vc/kata-shim-abc123");
        assert_eq!(sandbox_id_from_path(&p), Some("abc123".to_string()));
    }

    #[test]
    fn rejects_unrelated_file_names() {
        let p = PathBuf::from("/run/vc/other-file");
        assert_eq!(sandbox_id_from_path(&p), None);
    }
}
