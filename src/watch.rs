//! Filesystem watcher driving whole-instance reloads.
//!
//! A single thread owns the notify watcher. Raw events are debounced with a
//! quiet period so editor save storms and multi-file writes collapse into
//! one rebuild. Reload failures keep the previous instance serving.

use crate::server::supervisor::Supervisor;
use crate::{debug, log};
use anyhow::Result;
use crossbeam::channel::{self, Receiver};
use notify::{RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Quiet period before a batch of change events triggers a rebuild.
const DEBOUNCE: Duration = Duration::from_millis(200);

/// Start the watcher thread over the given roots.
pub fn spawn_watcher(
    supervisor: Arc<Supervisor>,
    roots: Vec<PathBuf>,
    shutdown_rx: Receiver<()>,
) -> Result<JoinHandle<()>> {
    let (event_tx, event_rx) = channel::unbounded::<notify::Event>();

    // the watcher must stay alive for the thread's lifetime
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(event) => {
                if is_relevant(&event) {
                    let _ = event_tx.send(event);
                }
            }
            Err(e) => log!("watch"; "notify error: {}", e),
        }
    })?;

    for root in &roots {
        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| anyhow::anyhow!("failed to watch {}: {}", root.display(), e))?;
        debug!("watch"; "watching {}", root.display());
    }

    let handle = std::thread::spawn(move || {
        let _watcher = watcher;
        run_loop(&supervisor, &event_rx, &shutdown_rx);
    });
    Ok(handle)
}

/// Writes and removals matter; reads and metadata-only events do not.
fn is_relevant(event: &notify::Event) -> bool {
    use notify::EventKind;
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

fn run_loop(
    supervisor: &Arc<Supervisor>,
    events: &Receiver<notify::Event>,
    shutdown: &Receiver<()>,
) {
    loop {
        crossbeam::select! {
            recv(shutdown) -> _ => return,
            recv(events) -> event => {
                let Ok(event) = event else { return };
                debug!("watch"; "change detected: {:?}", event.paths);
                // drain the storm until the tree settles
                while events.recv_timeout(DEBOUNCE).is_ok() {}

                match supervisor.reload() {
                    Ok(()) => {}
                    Err(e) => log!("watch"; "reload failed, keeping previous instance: {:#}", e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, EventKind};

    #[test]
    fn test_event_relevance() {
        let create = notify::Event::new(EventKind::Create(CreateKind::File));
        assert!(is_relevant(&create));

        let access = notify::Event::new(EventKind::Access(notify::event::AccessKind::Read));
        assert!(!is_relevant(&access));
    }
}
