//! Config file hot-reload
//!
//! The parent directory is watched instead of the file itself so editors
//! that save by renaming a temp file over `config.json` are still seen.
//! Bursts of events are collapsed into one reload after a quiet period.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{event::EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::runtime::Runtime;

/// Quiet period after the last file event before reloading
const DEBOUNCE: Duration = Duration::from_secs(1);

/// Whether `event` touches the config file
pub fn is_relevant(event: &notify::Event, config_path: &Path) -> bool {
    let kind_matches = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    );
    if !kind_matches {
        return false;
    }

    let Some(file_name) = config_path.file_name() else {
        return false;
    };
    event.paths.iter().any(|p| p.file_name() == Some(file_name))
}

/// Start watching `config_path` and reload through `runtime` on change
///
/// # Returns
/// The watcher, which must be kept alive, and the reload task.
pub fn start_config_watcher(
    config_path: PathBuf,
    runtime: Arc<Runtime>,
) -> Result<(RecommendedWatcher, JoinHandle<()>), notify::Error> {
    let dir = match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
        tracing::info!(path = %dir.display(), "Created config directory for watcher");
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let watched = config_path.clone();
    let mut watcher = RecommendedWatcher::new(
        move |res: Result<notify::Event, notify::Error>| match res {
            Ok(event) if is_relevant(&event, &watched) => {
                // Receiver gone means the daemon is shutting down
                let _ = tx.send(());
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Config watcher error"),
        },
        notify::Config::default(),
    )?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;

    tracing::info!(path = %config_path.display(), "Watching config file for changes");

    let handle = tokio::spawn(run_reload_loop(rx, runtime));
    Ok((watcher, handle))
}

async fn run_reload_loop(mut changes: mpsc::UnboundedReceiver<()>, runtime: Arc<Runtime>) {
    while changes.recv().await.is_some() {
        if !debounce(&mut changes).await {
            break;
        }

        tracing::info!("Config file change detected, reloading");
        if let Err(e) = runtime.reload().await {
            tracing::error!(error = %e, "Failed to reload configuration, keeping previous settings");
        }
    }

    tracing::debug!("Config watcher stopped");
}

/// Wait until no change arrived for `DEBOUNCE`
///
/// Returns false if the sender went away.
async fn debounce(changes: &mut mpsc::UnboundedReceiver<()>) -> bool {
    loop {
        match tokio::time::timeout(DEBOUNCE, changes.recv()).await {
            Ok(Some(())) => continue,
            Ok(None) => return false,
            Err(_) => return true,
        }
    }
}
