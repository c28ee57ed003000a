//! Filesystem watching for the modules directory
//!
//! Wraps a notify recursive watcher and translates raw filesystem
//! notifications into add/change/remove events on a channel the lifecycle
//! manager consumes. The watcher handle must be kept alive for as long as
//! watching should continue.

use std::path::{Path, PathBuf};

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::warn;

use crate::ModuleResult;

/// Channel capacity for pending watch events
const WATCH_CHANNEL_CAPACITY: usize = 64;

/// What happened to a watched file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    /// A file appeared
    Added,
    /// A file's contents changed
    Changed,
    /// A file was removed
    Removed,
}

/// A filesystem event for one path under the modules root
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: WatchKind,
    pub path: PathBuf,
}

/// Start watching a directory tree recursively
///
/// Returns the watcher (keep it alive) and the receiving end of the event
/// channel. Only create/modify/remove notifications are forwarded.
pub fn watch(root: &Path) -> ModuleResult<(RecommendedWatcher, mpsc::Receiver<WatchEvent>)> {
    let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);

    let mut watcher = RecommendedWatcher::new(
        move |result: Result<Event, notify::Error>| {
            let event = match result {
                Ok(event) => event,
                Err(err) => {
                    warn!(%err, "module watcher error");
                    return;
                }
            };
            let kind = match event.kind {
                EventKind::Create(_) => WatchKind::Added,
                EventKind::Modify(_) => WatchKind::Changed,
                EventKind::Remove(_) => WatchKind::Removed,
                _ => return,
            };
            for path in event.paths {
                // Runs on notify's own thread, so the blocking send is fine;
                // a full channel drops the event with a warning
                if tx.blocking_send(WatchEvent { kind, path }).is_err() {
                    warn!("watch event channel closed, dropping event");
                }
            }
        },
        NotifyConfig::default(),
    )?;

    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}
