//! External facts and their versions.
//!
//! Rules never read the outside world directly, they go through the
//! [`Context`](crate::Context), which records every fact read together with
//! the version observed. When a new session starts the known facts are
//! sampled again; if any of them changed the global epoch moves forward and
//! every memoized node has to prove it is still clean before being reused.

#[cfg(feature = "watch")]
pub(crate) mod watch;

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::sync::{Arc, Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use crate::core::Hash32;

/// Something outside of the rule graph a rule can depend on.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Fact {
    /// Contents of a file, relative to the build root.
    File(Utf8PathBuf),
    /// The set of paths matching a glob, relative to the build root.
    Glob(String),
    /// Value of an environment variable.
    Env(String),
}

/// The observed state of a [`Fact`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum FactVersion {
    Absent,
    Digest(Hash32),
    /// Sampling failed; the message is kept so a change of error also counts
    /// as a change.
    Unreadable(String),
}

impl FactVersion {
    pub(crate) fn of_error(e: &std::io::Error) -> Self {
        match e.kind() {
            ErrorKind::NotFound => FactVersion::Absent,
            _ => FactVersion::Unreadable(e.to_string()),
        }
    }

    pub(crate) fn of_env(value: Option<&str>) -> Self {
        match value {
            Some(value) => FactVersion::Digest(Hash32::hash(value)),
            None => FactVersion::Absent,
        }
    }
}

pub(crate) struct InvalidationLayer {
    root: Utf8PathBuf,
    facts: DashMap<Fact, FactVersion>,
    epoch: AtomicU64,
    log: bool,
    /// Environment seen by the latest session.
    env: RwLock<Arc<HashMap<String, String>>>,
    /// Paths reported by the watcher since the last refresh. `None` means no
    /// watcher is running and every fact has to be sampled.
    dirty: Mutex<Option<HashSet<Utf8PathBuf>>>,
}

impl InvalidationLayer {
    pub(crate) fn new(root: Utf8PathBuf, log: bool) -> Self {
        Self {
            root,
            facts: DashMap::new(),
            epoch: AtomicU64::new(0),
            log,
            env: RwLock::new(Arc::default()),
            dirty: Mutex::new(None),
        }
    }

    pub(crate) fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub(crate) fn current(&self, fact: &Fact) -> Option<FactVersion> {
        self.facts.get(fact).map(|version| version.clone())
    }

    /// Records the version a rule just observed.
    ///
    /// A version different from the known one means the fact changed while a
    /// session was running, so the epoch moves forward right away and results
    /// computed from the old version get revalidated.
    pub(crate) fn observe(&self, fact: Fact, version: FactVersion) {
        match self.facts.entry(fact) {
            Entry::Occupied(mut known) => {
                if *known.get() != version {
                    tracing::debug!("{:?} changed mid-session", known.key());
                    known.insert(version);
                    self.epoch.fetch_add(1, Ordering::AcqRel);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(version);
            }
        }
    }

    /// Replaces the environment rules read through `env_var`.
    pub(crate) fn set_env(&self, env: HashMap<String, String>) {
        *self.env.write().unwrap() = Arc::new(env);
    }

    pub(crate) fn env_var(&self, name: &str) -> Option<String> {
        self.env.read().unwrap().get(name).cloned()
    }

    /// Forgets every fact for which `keep` returns false.
    pub(crate) fn retain(&self, keep: impl Fn(&Fact) -> bool) {
        self.facts.retain(|fact, _| keep(fact));
    }

    pub(crate) fn len(&self) -> usize {
        self.facts.len()
    }

    pub(crate) fn sample(&self, fact: &Fact) -> FactVersion {
        match fact {
            Fact::File(path) => match Hash32::hash_file(self.root.join(path)) {
                Ok(hash) => FactVersion::Digest(hash),
                Err(e) => FactVersion::of_error(&e),
            },
            Fact::Glob(pattern) => match expand_glob(&self.root, pattern) {
                Ok(paths) => FactVersion::Digest(Hash32::hash(paths.join("\n"))),
                Err(e) => FactVersion::Unreadable(e.to_string()),
            },
            Fact::Env(name) => FactVersion::of_env(self.env_var(name).as_deref()),
        }
    }

    /// Switches to watcher-driven sampling, only facts touched by a reported
    /// path are sampled from now on.
    #[cfg(feature = "watch")]
    pub(crate) fn enable_dirty_tracking(&self) {
        *self.dirty.lock().unwrap() = Some(HashSet::new());
    }

    #[cfg(feature = "watch")]
    pub(crate) fn mark_dirty(&self, path: Utf8PathBuf) {
        if let Some(dirty) = self.dirty.lock().unwrap().as_mut() {
            dirty.insert(path);
        }
    }

    /// Samples the known facts again and bumps the epoch when any of them
    /// changed. Returns the number of changed facts.
    pub(crate) fn refresh(&self) -> usize {
        let dirty = self.dirty.lock().unwrap().as_mut().map(std::mem::take);

        let facts: Vec<Fact> = self
            .facts
            .iter()
            .map(|item| item.key().clone())
            .filter(|fact| match &dirty {
                None => true,
                Some(dirty) => self.is_affected(fact, dirty),
            })
            .collect();

        let changed: Vec<(Fact, FactVersion)> = facts
            .par_iter()
            .filter_map(|fact| {
                let version = self.sample(fact);
                match self.facts.get(fact) {
                    Some(old) if *old == version => None,
                    _ => Some((fact.clone(), version)),
                }
            })
            .collect();

        for (fact, version) in &changed {
            if self.log {
                tracing::info!("{fact:?} changed to {version:?}");
            }
            self.facts.insert(fact.clone(), version.clone());
        }

        if !changed.is_empty() {
            let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
            tracing::debug!("{} facts changed, now at epoch {epoch}", changed.len());
        }

        changed.len()
    }

    fn is_affected(&self, fact: &Fact, dirty: &HashSet<Utf8PathBuf>) -> bool {
        match fact {
            Fact::File(path) => dirty.contains(&self.root.join(path)),
            Fact::Glob(pattern) => {
                let base = self.root.join(glob_root(pattern));
                dirty.iter().any(|path| path.starts_with(&base))
            }
            Fact::Env(_) => true,
        }
    }
}

/// Expands a glob relative to `root`, returning the sorted matching paths
/// relative to `root`.
pub(crate) fn expand_glob(root: &Utf8Path, pattern: &str) -> Result<Vec<String>, crate::error::StoreError> {
    let mut paths = Vec::new();

    for entry in glob::glob(root.join(pattern).as_str())? {
        let path = Utf8PathBuf::try_from(entry?)?;
        if let Ok(relative) = path.strip_prefix(root) {
            paths.push(relative.to_string());
        }
    }

    paths.sort();
    Ok(paths)
}

/// The static prefix of a glob, i.e. everything before the first component
/// containing a wildcard.
pub(crate) fn glob_root(pattern: &str) -> Utf8PathBuf {
    Utf8Path::new(pattern)
        .components()
        .take_while(|c| !c.as_str().contains(['*', '?', '[']))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(name: &str) -> Utf8PathBuf {
        let dir = std::env::temp_dir().join(format!("tsumugi-invalidation-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        Utf8PathBuf::try_from(dir).unwrap()
    }

    #[test]
    fn test_glob_root() {
        assert_eq!(glob_root("src/**/*.rs"), Utf8PathBuf::from("src"));
        assert_eq!(glob_root("*.txt"), Utf8PathBuf::from(""));
        assert_eq!(glob_root("a/b/c.txt"), Utf8PathBuf::from("a/b/c.txt"));
    }

    #[test]
    fn test_file_change_bumps_epoch() {
        let root = temp_root("file");
        std::fs::write(root.join("foo.txt"), "one").unwrap();

        let layer = InvalidationLayer::new(root.clone(), false);
        let fact = Fact::File("foo.txt".into());
        layer.observe(fact.clone(), layer.sample(&fact));

        assert_eq!(layer.refresh(), 0);
        assert_eq!(layer.epoch(), 0);

        std::fs::write(root.join("foo.txt"), "two").unwrap();
        assert_eq!(layer.refresh(), 1);
        assert_eq!(layer.epoch(), 1);
        assert_eq!(layer.current(&fact), Some(FactVersion::Digest(Hash32::hash("two"))));

        std::fs::remove_file(root.join("foo.txt")).unwrap();
        assert_eq!(layer.refresh(), 1);
        assert_eq!(layer.current(&fact), Some(FactVersion::Absent));
    }

    #[test]
    fn test_glob_tracks_membership() {
        let root = temp_root("glob");
        std::fs::write(root.join("a.txt"), "a").unwrap();

        let layer = InvalidationLayer::new(root.clone(), false);
        let fact = Fact::Glob("*.txt".into());
        layer.observe(fact.clone(), layer.sample(&fact));

        // content changes do not affect the glob itself
        std::fs::write(root.join("a.txt"), "changed").unwrap();
        assert_eq!(layer.refresh(), 0);

        std::fs::write(root.join("b.txt"), "b").unwrap();
        assert_eq!(layer.refresh(), 1);
        assert_eq!(expand_glob(&root, "*.txt").unwrap(), vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn test_env_fact() {
        let layer = InvalidationLayer::new(".".into(), false);
        let fact = Fact::Env("PROFILE".into());
        assert_eq!(layer.sample(&fact), FactVersion::Absent);

        layer.set_env(HashMap::from([("PROFILE".to_string(), "debug".to_string())]));
        layer.observe(fact.clone(), layer.sample(&fact));
        assert_eq!(layer.refresh(), 0);

        layer.set_env(HashMap::from([("PROFILE".to_string(), "release".to_string())]));
        assert_eq!(layer.refresh(), 1);
        assert_eq!(layer.current(&fact), Some(FactVersion::of_env(Some("release"))));
    }

    #[test]
    fn test_observing_a_new_version_bumps_epoch() {
        let layer = InvalidationLayer::new(".".into(), false);
        let fact = Fact::File("foo.txt".into());

        layer.observe(fact.clone(), FactVersion::Digest(Hash32::hash("X")));
        layer.observe(fact.clone(), FactVersion::Digest(Hash32::hash("X")));
        assert_eq!(layer.epoch(), 0);

        layer.observe(fact.clone(), FactVersion::Digest(Hash32::hash("Y")));
        assert_eq!(layer.epoch(), 1);
        assert_eq!(layer.current(&fact), Some(FactVersion::Digest(Hash32::hash("Y"))));
    }

    #[test]
    fn test_retain_forgets_facts() {
        let layer = InvalidationLayer::new(".".into(), false);
        layer.observe(Fact::Env("A".into()), FactVersion::Absent);
        layer.observe(Fact::Env("B".into()), FactVersion::Absent);

        layer.retain(|fact| matches!(fact, Fact::Env(name) if name == "A"));
        assert_eq!(layer.len(), 1);
        assert_eq!(layer.current(&Fact::Env("B".into())), None);
    }
}
