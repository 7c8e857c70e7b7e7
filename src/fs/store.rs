//! In-memory content-addressed storage for file blobs and directory trees.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use dashmap::DashMap;
use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::error::StoreError;

/// Identity of a blob or a directory tree: the hash of its canonical bytes
/// and their length.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Digest {
    pub hash: Hash32,
    pub size: usize,
}

impl Digest {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self {
            hash: Hash32::hash(bytes),
            size: bytes.len(),
        }
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({}, {})", self.hash.short(), self.size)
    }
}

/// Flat listing of a directory tree, file path to file digest. Directories
/// are implied by the paths.
pub type Manifest = BTreeMap<String, Digest>;

#[derive(Default)]
pub struct Store {
    blobs: DashMap<Hash32, Arc<[u8]>>,
    trees: DashMap<Hash32, Arc<Manifest>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store_bytes(&self, bytes: impl Into<Arc<[u8]>>) -> Digest {
        let bytes = bytes.into();
        let digest = Digest::of_bytes(&bytes);
        self.blobs.entry(digest.hash).or_insert(bytes);
        digest
    }

    pub fn load_bytes(&self, digest: &Digest) -> Result<Arc<[u8]>, StoreError> {
        self.blobs
            .get(&digest.hash)
            .map(|blob| Arc::clone(&blob))
            .ok_or_else(|| StoreError::MissingDigest(format!("{digest:?}")))
    }

    /// Stores a directory tree. The digest is computed over the CBOR
    /// encoding of the manifest, which is canonical as the manifest is
    /// ordered.
    pub fn store_tree(&self, manifest: Manifest) -> Result<Digest, StoreError> {
        for path in manifest.keys() {
            check_relative(path)?;
        }

        let mut encoded = Vec::new();
        ciborium::into_writer(&manifest, &mut encoded)?;

        let digest = Digest::of_bytes(&encoded);
        self.trees.entry(digest.hash).or_insert_with(|| Arc::new(manifest));
        Ok(digest)
    }

    pub fn load_tree(&self, digest: &Digest) -> Result<Arc<Manifest>, StoreError> {
        self.trees
            .get(&digest.hash)
            .map(|tree| Arc::clone(&tree))
            .ok_or_else(|| StoreError::MissingDigest(format!("{digest:?}")))
    }

    pub fn empty_tree(&self) -> Digest {
        self.store_tree(Manifest::new())
            .expect("Empty manifest must always encode")
    }

    /// Stores every file and returns the tree containing them.
    pub fn create(&self, files: impl IntoIterator<Item = (String, Vec<u8>)>) -> Result<Digest, StoreError> {
        let manifest = files
            .into_iter()
            .map(|(path, content)| (normalize(&path), self.store_bytes(content)))
            .collect();

        self.store_tree(manifest)
    }

    /// Merges trees. The same path may appear in several inputs only with
    /// identical contents.
    pub fn merge(&self, digests: &[Digest]) -> Result<Digest, StoreError> {
        let mut merged = Manifest::new();

        for digest in digests {
            for (path, file) in self.load_tree(digest)?.iter() {
                match merged.get(path) {
                    Some(existing) if existing != file => {
                        return Err(StoreError::MergeConflict { path: path.clone() });
                    }
                    _ => {
                        merged.insert(path.clone(), *file);
                    }
                }
            }
        }

        self.store_tree(merged)
    }

    /// Keeps the files matching any include glob and no `!`-prefixed
    /// exclude glob.
    pub fn subset(&self, digest: &Digest, globs: &[String]) -> Result<Digest, StoreError> {
        let (includes, excludes) = compile_globs(globs)?;
        let tree = self.load_tree(digest)?;

        let manifest = tree
            .iter()
            .filter(|(path, _)| includes.iter().any(|p| p.matches(path)))
            .filter(|(path, _)| !excludes.iter().any(|p| p.matches(path)))
            .map(|(path, file)| (path.clone(), *file))
            .collect();

        self.store_tree(manifest)
    }

    pub fn add_prefix(&self, digest: &Digest, prefix: &Utf8Path) -> Result<Digest, StoreError> {
        check_relative(prefix.as_str())?;
        let tree = self.load_tree(digest)?;

        let manifest = tree
            .iter()
            .map(|(path, file)| (prefix.join(path).to_string(), *file))
            .collect();

        self.store_tree(manifest)
    }

    pub fn remove_prefix(&self, digest: &Digest, prefix: &Utf8Path) -> Result<Digest, StoreError> {
        let tree = self.load_tree(digest)?;
        let mut manifest = Manifest::new();

        for (path, file) in tree.iter() {
            let stripped = Utf8Path::new(path).strip_prefix(prefix).map_err(|_| StoreError::NotUnderPrefix {
                path: path.clone(),
                prefix: prefix.to_string(),
            })?;
            manifest.insert(stripped.to_string(), *file);
        }

        self.store_tree(manifest)
    }

    /// Files of a tree with their contents, in path order.
    pub fn contents(&self, digest: &Digest) -> Result<Vec<(String, Arc<[u8]>)>, StoreError> {
        self.load_tree(digest)?
            .iter()
            .map(|(path, file)| Ok((path.clone(), self.load_bytes(file)?)))
            .collect()
    }

    /// Writes a tree out to `dest`, creating directories as needed.
    pub async fn materialize(&self, digest: &Digest, dest: &Utf8Path) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(dest).await?;

        for (path, content) in self.contents(digest)? {
            let target = dest.join(&path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, &content).await?;
        }

        Ok(())
    }

    /// Captures files from `root` into a tree.
    pub async fn capture(&self, root: &Utf8Path, paths: &[String]) -> Result<Digest, StoreError> {
        let mut manifest = Manifest::new();

        for path in paths {
            let path = normalize(path);
            match tokio::fs::read(root.join(&path)).await {
                Ok(content) => {
                    manifest.insert(path, self.store_bytes(content));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }

        self.store_tree(manifest)
    }
}

/// Directories implied by a manifest's file paths.
pub(crate) fn implied_dirs(manifest: &Manifest) -> Vec<String> {
    let mut dirs: Vec<String> = manifest
        .keys()
        .flat_map(|path| Utf8Path::new(path).ancestors().skip(1))
        .filter(|dir| !dir.as_str().is_empty())
        .map(|dir| dir.to_string())
        .collect();

    dirs.sort();
    dirs.dedup();
    dirs
}

pub(crate) fn compile_globs(globs: &[String]) -> Result<(Vec<Pattern>, Vec<Pattern>), StoreError> {
    let mut includes = Vec::new();
    let mut excludes = Vec::new();

    for glob in globs {
        match glob.strip_prefix('!') {
            Some(exclude) => excludes.push(Pattern::new(exclude)?),
            None => includes.push(Pattern::new(glob)?),
        }
    }

    Ok((includes, excludes))
}

fn normalize(path: &str) -> String {
    Utf8Path::new(path)
        .components()
        .filter(|c| !matches!(c, Utf8Component::CurDir))
        .collect::<Utf8PathBuf>()
        .to_string()
}

fn check_relative(path: &str) -> Result<(), StoreError> {
    let valid = Utf8Path::new(path)
        .components()
        .all(|c| matches!(c, Utf8Component::Normal(_)));

    match valid && !path.is_empty() {
        true => Ok(()),
        false => Err(StoreError::PathEscape(path.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(store: &Store, entries: &[(&str, &str)]) -> Digest {
        store
            .create(entries.iter().map(|(p, c)| (p.to_string(), c.as_bytes().to_vec())))
            .unwrap()
    }

    #[test]
    fn test_tree_digest_is_order_independent() {
        let store = Store::new();
        let a = files(&store, &[("a.txt", "a"), ("b/c.txt", "c")]);
        let b = files(&store, &[("b/c.txt", "c"), ("./a.txt", "a")]);
        assert_eq!(a, b);
        assert_ne!(a, store.empty_tree());
    }

    #[test]
    fn test_merge_and_conflict() {
        let store = Store::new();
        let a = files(&store, &[("a.txt", "a")]);
        let b = files(&store, &[("b.txt", "b"), ("a.txt", "a")]);
        let merged = store.merge(&[a, b]).unwrap();
        assert_eq!(store.load_tree(&merged).unwrap().len(), 2);

        let conflicting = files(&store, &[("a.txt", "other")]);
        assert!(matches!(
            store.merge(&[a, conflicting]),
            Err(StoreError::MergeConflict { path }) if path == "a.txt"
        ));
    }

    #[test]
    fn test_subset_with_excludes() {
        let store = Store::new();
        let tree = files(&store, &[("src/a.rs", ""), ("src/b.rs", ""), ("README.md", "")]);
        let subset = store
            .subset(&tree, &["src/*.rs".to_string(), "!src/b.rs".to_string()])
            .unwrap();

        let manifest = store.load_tree(&subset).unwrap();
        assert_eq!(manifest.keys().collect::<Vec<_>>(), vec!["src/a.rs"]);
    }

    #[test]
    fn test_prefixes() {
        let store = Store::new();
        let tree = files(&store, &[("a.txt", "a")]);

        let prefixed = store.add_prefix(&tree, Utf8Path::new("out/dir")).unwrap();
        assert!(store.load_tree(&prefixed).unwrap().contains_key("out/dir/a.txt"));
        assert_eq!(
            implied_dirs(&store.load_tree(&prefixed).unwrap()),
            vec!["out".to_string(), "out/dir".to_string()]
        );

        let stripped = store.remove_prefix(&prefixed, Utf8Path::new("out")).unwrap();
        assert!(store.load_tree(&stripped).unwrap().contains_key("dir/a.txt"));

        assert!(matches!(
            store.remove_prefix(&tree, Utf8Path::new("out")),
            Err(StoreError::NotUnderPrefix { .. })
        ));
        assert!(matches!(
            store.add_prefix(&tree, Utf8Path::new("../escape")),
            Err(StoreError::PathEscape(_))
        ));
    }

    #[test]
    fn test_missing_digest() {
        let store = Store::new();
        let digest = Digest::of_bytes(b"never stored");
        assert!(matches!(store.load_bytes(&digest), Err(StoreError::MissingDigest(_))));
    }
}
