use std::num::NonZeroUsize;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::error::ConfigError;

/// Engine configuration.
///
/// Every field has a default, so an empty JSON object is a valid config:
///
/// ```json
/// { "build_root": ".", "cache_dir": ".tsumugi", "worker_threads": 8 }
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory every relative path seen by rules is resolved against.
    pub build_root: Utf8PathBuf,
    /// Scratch space for process sandboxes, relative to the build root
    /// unless absolute.
    pub cache_dir: Utf8PathBuf,
    /// Number of worker threads executing rules.
    pub worker_threads: usize,
    /// Watch the build root for changes so that new sessions only resample
    /// the facts that were touched. Requires the `watch` feature.
    pub watch: bool,
    /// Log every fact found changed at the start of a session.
    pub log_invalidation: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            build_root: Utf8PathBuf::from("."),
            cache_dir: Utf8PathBuf::from(".tsumugi"),
            worker_threads: std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(4),
            watch: false,
            log_invalidation: false,
        }
    }
}

impl EngineConfig {
    /// Reads the config from a JSON file.
    pub fn load(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn with_build_root(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.build_root = path.into();
        self
    }

    pub fn with_cache_dir(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.cache_dir = path.into();
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn with_watch(mut self, watch: bool) -> Self {
        self.watch = watch;
        self
    }

    pub fn with_log_invalidation(mut self, log: bool) -> Self {
        self.log_invalidation = log;
        self
    }

    /// Canonical build root and absolute cache directory.
    pub(crate) fn resolve_paths(&self) -> Result<(Utf8PathBuf, Utf8PathBuf), ConfigError> {
        if !self.build_root.is_dir() {
            return Err(ConfigError::BuildRoot(self.build_root.to_string()));
        }

        let root = self.build_root.canonicalize_utf8()?;
        let cache = if self.cache_dir.is_absolute() {
            self.cache_dir.clone()
        } else {
            root.join(&self.cache_dir)
        };

        Ok((root, cache))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{ "worker_threads": 2, "watch": true }"#).unwrap();
        assert_eq!(config.worker_threads, 2);
        assert!(config.watch);
        assert_eq!(config.build_root, Utf8PathBuf::from("."));
        assert_eq!(config.cache_dir, Utf8PathBuf::from(".tsumugi"));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("tsumugi-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "cache_dir": "/tmp/cache" }"#).unwrap();

        let config = EngineConfig::load(Utf8PathBuf::try_from(path).unwrap()).unwrap();
        assert_eq!(config.cache_dir, Utf8PathBuf::from("/tmp/cache"));
    }

    #[test]
    fn test_resolve_paths() {
        let config = EngineConfig::default().with_build_root("src");
        let (root, cache) = config.resolve_paths().unwrap();
        assert!(root.is_absolute());
        assert!(root.ends_with("src"));
        assert_eq!(cache, root.join(".tsumugi"));

        let missing = EngineConfig::default().with_build_root("does/not/exist");
        assert!(matches!(missing.resolve_paths(), Err(ConfigError::BuildRoot(_))));
    }
}
