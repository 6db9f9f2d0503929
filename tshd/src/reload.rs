//! Configuration hot reload.
//!
//! Watches the config file and swaps in a new epoch when it changes. A
//! document that fails validation is rejected and the running epoch stays
//! untouched. Reload is whole-document; partial updates are not supported.

use crate::engine::Engine;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tsh_common::config::EngineConfig;

const DEBOUNCE: Duration = Duration::from_millis(250);

/// Watch `path` and reload the engine on changes.
///
/// The returned watcher must be kept alive for the lifetime of the daemon.
pub fn start_config_watcher(
    engine: Arc<Engine>,
    path: PathBuf,
) -> notify::Result<RecommendedWatcher> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(event) => {
                if event.kind.is_modify() || event.kind.is_create() {
                    let _ = tx.send(());
                }
            }
            Err(e) => warn!("config watcher error: {}", e),
        }
    })?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;
    info!("watching {} for configuration changes", path.display());

    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            // Editors fire bursts of events; coalesce them.
            tokio::time::sleep(DEBOUNCE).await;
            while rx.try_recv().is_ok() {}

            match EngineConfig::load_validated(&path) {
                Ok(config) => match engine.reload(config) {
                    Ok(epoch) => info!(epoch, "configuration reloaded from file"),
                    Err(e) => warn!("reload failed to start epoch tasks: {}", e),
                },
                Err(e) => warn!("config change rejected, keeping current epoch: {}", e),
            }
        }
    });

    Ok(watcher)
}
