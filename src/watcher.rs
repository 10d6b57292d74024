//! Binary-change watcher
//!
//! Watches the worker root and retires a worker as soon as its executable is
//! rewritten. Nothing is respawned here; the next request starts a fresh
//! worker. Events that arrive after a request already replaced the worker
//! leave the replacement alone.

use crate::config::WorkerConfig;
use crate::registry::Registry;
use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct BinaryWatcher {
    watcher: RecommendedWatcher,
    pump: JoinHandle<()>,
}

/// Whether an event kind can mean the file now holds a different binary
pub fn is_binary_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Modify(ModifyKind::Name(RenameMode::To))
            | EventKind::Modify(ModifyKind::Name(RenameMode::Both))
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}

impl BinaryWatcher {
    /// Start watching the worker root recursively
    pub fn start(config: &WorkerConfig, registry: Arc<Registry>) -> notify::Result<Self> {
        let root = config.root.as_path();
        let config = config.clone();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<notify::Result<notify::Event>>();

        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        info!(root = %root.display(), "Watching worker binaries for changes");

        let pump = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "Worker watch error");
                        continue;
                    }
                };
                if !is_binary_change(&event.kind) {
                    continue;
                }

                let changed: Vec<PathBuf> = event
                    .paths
                    .into_iter()
                    .filter(|p| config.is_worker_name(p))
                    .collect();
                for path in changed {
                    debug!(path = %path.display(), kind = ?event.kind, "Worker binary changed");
                    let registry = Arc::clone(&registry);
                    tokio::spawn(async move {
                        if registry.retire_if_stale(&path).await {
                            info!(identity = %path.display(), "Retired worker after binary change");
                        }
                    });
                }
            }
            debug!("Worker watch channel closed");
        });

        Ok(Self { watcher, pump })
    }

    /// Stop delivering events. Retirements already started run to completion.
    pub async fn stop(self) {
        drop(self.watcher);
        self.pump.abort();
        match self.pump.await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {}
            Err(e) => warn!(error = %e, "Watcher task ended abnormally"),
        }
    }
}
