use crate::error::PluginError;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use tracing::{debug, error, info};

/// Watches the plugin directory and calls `on_change` for every create,
/// modify or remove. Callers debounce; the watcher stops when dropped.
pub struct PluginDirectoryWatcher {
    _watcher: RecommendedWatcher,
}

impl PluginDirectoryWatcher {
    pub fn start<F>(directory: &Path, on_change: F) -> Result<Self, PluginError>
    where
        F: Fn() + Send + 'static,
    {
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) if is_relevant(&event.kind) => {
                    debug!(paths = ?event.paths, "plugin directory changed");
                    on_change();
                }
                Ok(_) => {}
                Err(err) => error!(error = %err, "plugin directory watch error"),
            },
            Config::default(),
        )
        .map_err(|err| PluginError::Watch(err.to_string()))?;

        watcher
            .watch(directory, RecursiveMode::NonRecursive)
            .map_err(|err| PluginError::Watch(format!("{}: {err}", directory.display())))?;
        info!(directory = %directory.display(), "watching plugin directory");

        Ok(Self { _watcher: watcher })
    }
}

fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}
