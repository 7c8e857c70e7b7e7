//! Filesystem watching.
//!
//! The build root is watched recursively with a debounced `notify` watcher.
//! Reported paths are only collected, nothing is recomputed eagerly: the next
//! session resamples the facts affected by those paths and lets the usual
//! lazy cleaning take over.

use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{DebounceEventResult, Debouncer, RecommendedCache, new_debouncer};

use crate::invalidation::InvalidationLayer;

pub(crate) struct Watcher {
    _debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
}

/// Starts watching `layer`'s build root, ignoring everything under `ignored`
/// (the engine's own cache directory).
pub(crate) fn start(layer: Arc<InvalidationLayer>, ignored: Utf8PathBuf) -> notify::Result<Watcher> {
    let root = layer.root().to_path_buf();
    layer.enable_dirty_tracking();

    let handler = {
        let layer = Arc::clone(&layer);
        move |result: DebounceEventResult| match result {
            Ok(events) => {
                for event in events {
                    if matches!(event.kind, EventKind::Access(_)) {
                        continue;
                    }

                    for path in &event.paths {
                        let Some(path) = Utf8Path::from_path(path) else {
                            continue;
                        };
                        if path.starts_with(&ignored) {
                            continue;
                        }

                        tracing::trace!("{path} changed");
                        layer.mark_dirty(path.to_path_buf());
                    }
                }
            }
            Err(errors) => {
                for e in errors {
                    tracing::error!("watch error: {e:?}");
                }
            }
        }
    };

    let mut debouncer = new_debouncer(Duration::from_millis(250), None, handler)?;
    debouncer.watch(root.as_std_path(), RecursiveMode::Recursive)?;
    tracing::info!("watching {root}");

    Ok(Watcher {
        _debouncer: debouncer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changes_are_collected_as_dirty_paths() {
        let dir = std::env::temp_dir().join(format!("tsumugi-watch-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let root = Utf8PathBuf::try_from(dir.canonicalize().unwrap()).unwrap();

        std::fs::write(root.join("foo.txt"), "one").unwrap();

        let layer = Arc::new(InvalidationLayer::new(root.clone(), false));
        let fact = crate::invalidation::Fact::File("foo.txt".into());
        layer.observe(fact.clone(), layer.sample(&fact));

        let _watcher = start(Arc::clone(&layer), root.join(".tsumugi")).unwrap();

        std::fs::write(root.join("foo.txt"), "two").unwrap();
        let mut changed = 0;
        for _ in 0..40 {
            std::thread::sleep(Duration::from_millis(100));
            changed += layer.refresh();
            if changed > 0 {
                break;
            }
        }

        assert_eq!(changed, 1);
    }
}
