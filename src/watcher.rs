use std::io;
use std::path::PathBuf;
use std::sync::mpsc::channel;
use std::thread::JoinHandle;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, NoCache};

use crate::error::{CoreError, CoreResult};

/// Debounced filesystem watcher under a project root.
///
/// Events are coalesced in the debounce window; each batch is reduced to the
/// set of changed relative paths and handed to the callback, which performs
/// downstream invalidation (symbol-cache rows, call-graph rebuild flag) and
/// publishes `fileTreeChanged`. Dropping the watcher stops the stream.
pub struct TreeWatcher {
    // Held for its Drop impl; dropping unregisters the OS watches and closes
    // the channel the forwarder thread blocks on.
    _debouncer: Debouncer<RecommendedWatcher, NoCache>,
    thread: Option<JoinHandle<()>>,
}

fn watch_err(root: &PathBuf, err: notify::Error) -> CoreError {
    CoreError::io(
        "watch",
        root.clone(),
        io::Error::new(io::ErrorKind::Other, err.to_string()),
    )
}

impl TreeWatcher {
    pub fn start(
        root: PathBuf,
        debounce: Duration,
        on_batch: impl Fn(Vec<String>) + Send + 'static,
    ) -> CoreResult<Self> {
        let (tx, rx) = channel();

        let mut debouncer = new_debouncer(debounce, None, move |result: DebounceEventResult| {
            let _ = tx.send(result);
        })
        .map_err(|e| watch_err(&root, e))?;

        debouncer
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| watch_err(&root, e))?;

        let thread_root = root.clone();
        let thread = std::thread::Builder::new()
            .name("shotgun-watcher".into())
            .spawn(move || {
                while let Ok(result) = rx.recv() {
                    match result {
                        Ok(events) => {
                            let mut changed: Vec<String> = events
                                .iter()
                                .flat_map(|event| event.paths.iter())
                                .filter_map(|path| {
                                    path.strip_prefix(&thread_root)
                                        .ok()
                                        .map(|rel| rel.to_string_lossy().replace('\\', "/"))
                                })
                                .filter(|rel| !rel.is_empty())
                                .collect();
                            changed.sort();
                            changed.dedup();
                            if !changed.is_empty() {
                                on_batch(changed);
                            }
                        }
                        Err(errors) => {
                            for err in errors {
                                log::warn!("watch error under {}: {err}", thread_root.display());
                            }
                        }
                    }
                }
            })
            .map_err(|e| CoreError::io("spawn", root.clone(), e))?;

        Ok(Self {
            _debouncer: debouncer,
            thread: Some(thread),
        })
    }
}

impl Drop for TreeWatcher {
    fn drop(&mut self) {
        // Debouncer drop closes the channel; the forwarder exits on its own.
        if let Some(handle) = self.thread.take() {
            let _ = handle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn reports_changed_relative_paths_once_per_batch() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let (tx, rx) = mpsc::channel();

        let _watcher = TreeWatcher::start(root.clone(), Duration::from_millis(100), move |batch| {
            let _ = tx.send(batch);
        })
        .unwrap();

        std::fs::write(root.join("touched.rs"), "fn a() {}\n").unwrap();

        let batch = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("debounced batch");
        assert!(batch.iter().any(|p| p == "touched.rs"), "got {batch:?}");
    }

    #[test]
    fn watching_a_missing_root_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let result = TreeWatcher::start(missing, Duration::from_millis(10), |_| {});
        assert!(result.is_err());
    }
}
