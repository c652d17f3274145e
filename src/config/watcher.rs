use anyhow::Result;
use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::channel;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Time to let an editor finish writing before reloading
const DEBOUNCE: Duration = Duration::from_millis(200);

/// Watches configuration files and calls back once per burst of changes
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    pub fn new<F>(paths: Vec<PathBuf>, on_change: F) -> Result<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let (tx, rx) = channel();

        let mut watcher = RecommendedWatcher::new(tx, Config::default())?;

        for path in &paths {
            if path.exists() {
                watcher.watch(Path::new(path), RecursiveMode::NonRecursive)?;
                info!(path = %path.display(), "Watching configuration file");
            } else {
                warn!(path = %path.display(), "Configuration path does not exist, not watching");
            }
        }

        std::thread::spawn(move || loop {
            match rx.recv() {
                Ok(Ok(event)) => {
                    if matches!(event.kind, EventKind::Access(_)) {
                        continue;
                    }
                    std::thread::sleep(DEBOUNCE);
                    // Collapse the rest of the burst into this reload
                    let skipped = rx.try_iter().count();
                    debug!(skipped, "Coalesced configuration events");
                    info!("Configuration change detected, reloading");
                    on_change();
                }
                Ok(Err(e)) => error!(error = ?e, "Configuration watch error"),
                Err(_) => {
                    debug!("Configuration watcher stopped");
                    break;
                }
            }
        });

        Ok(Self { _watcher: watcher })
    }
}
