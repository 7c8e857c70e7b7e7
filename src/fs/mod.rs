//! Filesystem intrinsics.
//!
//! The types in this module are ordinary products and params: rules reach
//! the filesystem by issuing Gets against them, e.g.
//! `Get::<Snapshot>::new(PathGlobs::new(["src/**/*.rs"]))`. Register them with
//! `registry.register_rules(tsumugi::fs::rules())`.

mod store;

use std::collections::BTreeSet;

use camino::Utf8PathBuf;

use crate::rules::{Rule, rule};

pub use store::{Digest, Manifest, Store};

/// A set of globs relative to the build root. Globs starting with `!`
/// exclude matches.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PathGlobs {
    pub globs: Vec<String>,
}

impl PathGlobs {
    pub fn new<S: Into<String>>(globs: impl IntoIterator<Item = S>) -> Self {
        Self {
            globs: globs.into_iter().map(Into::into).collect(),
        }
    }
}

/// A stored tree together with its listing.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Snapshot {
    pub digest: Digest,
    pub files: Vec<String>,
    pub dirs: Vec<String>,
}

impl Snapshot {
    fn from_manifest(digest: Digest, manifest: &Manifest) -> Self {
        Self {
            digest,
            files: manifest.keys().cloned().collect(),
            dirs: store::implied_dirs(manifest),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FileContent {
    pub path: String,
    pub content: Vec<u8>,
}

impl FileContent {
    pub fn new(path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DigestContents(pub Vec<FileContent>);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CreateDigest(pub Vec<FileContent>);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MergeDigests(pub Vec<Digest>);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DigestSubset {
    pub digest: Digest,
    pub globs: PathGlobs,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AddPrefix {
    pub digest: Digest,
    pub prefix: Utf8PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RemovePrefix {
    pub digest: Digest,
    pub prefix: Utf8PathBuf,
}

/// The filesystem intrinsic rules.
pub fn rules() -> Vec<Rule> {
    vec![
        rule::<Snapshot, (PathGlobs,)>("snapshot_globs").run(|ctx, (globs,)| async move {
            let (includes, excludes) = store::compile_globs(&globs.globs)?;

            let mut paths = BTreeSet::new();
            for include in &includes {
                paths.extend(ctx.glob(include.as_str()).await?);
            }
            paths.retain(|path| !excludes.iter().any(|p| p.matches(path)));

            let mut manifest = Manifest::new();
            for path in paths {
                let is_file = tokio::fs::metadata(ctx.build_root().join(&path))
                    .await
                    .is_ok_and(|meta| meta.is_file());
                if !is_file {
                    continue;
                }
                let content = ctx.read_file(&path).await?;
                manifest.insert(path, ctx.store().store_bytes(content));
            }

            let digest = ctx.store().store_tree(manifest.clone())?;
            Ok(Snapshot::from_manifest(digest, &manifest))
        }),
        rule::<Snapshot, (Digest,)>("snapshot_digest").run(|ctx, (digest,)| async move {
            let manifest = ctx.store().load_tree(&digest)?;
            Ok(Snapshot::from_manifest(*digest, &manifest))
        }),
        rule::<DigestContents, (Digest,)>("digest_contents").run(|ctx, (digest,)| async move {
            let files = ctx
                .store()
                .contents(&digest)?
                .into_iter()
                .map(|(path, content)| FileContent::new(path, content.to_vec()))
                .collect();

            Ok(DigestContents(files))
        }),
        rule::<Digest, (CreateDigest,)>("create_digest").run(|ctx, (create,)| async move {
            let files = create.0.iter().map(|file| (file.path.clone(), file.content.clone()));
            Ok(ctx.store().create(files)?)
        }),
        rule::<Digest, (MergeDigests,)>("merge_digests")
            .run(|ctx, (merge,)| async move { Ok(ctx.store().merge(&merge.0)?) }),
        rule::<Digest, (DigestSubset,)>("digest_subset")
            .run(|ctx, (subset,)| async move { Ok(ctx.store().subset(&subset.digest, &subset.globs.globs)?) }),
        rule::<Digest, (AddPrefix,)>("add_prefix")
            .run(|ctx, (add,)| async move { Ok(ctx.store().add_prefix(&add.digest, &add.prefix)?) }),
        rule::<Digest, (RemovePrefix,)>("remove_prefix")
            .run(|ctx, (remove,)| async move { Ok(ctx.store().remove_prefix(&remove.digest, &remove.prefix)?) }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EngineConfig, Get, Query, RuleRegistry, Scheduler};

    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    struct Sources(PathGlobs);

    struct Listing(Vec<String>);

    fn temp_root(name: &str) -> Utf8PathBuf {
        let dir = std::env::temp_dir().join(format!("tsumugi-fs-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(dir.join("src")).unwrap();
        Utf8PathBuf::try_from(dir).unwrap()
    }

    fn scheduler(root: &Utf8PathBuf) -> Scheduler {
        let registry = RuleRegistry::new();
        registry.register_rules(rules()).unwrap();
        registry
            .register_rules([rule::<Listing, (Sources,)>("listing")
                .get::<Snapshot, (PathGlobs,)>()
                .get::<Digest, (CreateDigest,)>()
                .get::<Digest, (MergeDigests,)>()
                .get::<DigestContents, (Digest,)>()
                .run(|ctx, (sources,)| async move {
                    let snapshot = ctx.get(Get::<Snapshot>::new(sources.0.clone())).await?;
                    let extra = ctx
                        .get(Get::<Digest>::new(CreateDigest(vec![FileContent::new("gen/extra.txt", "x")])))
                        .await?;
                    let merged = ctx
                        .get(Get::<Digest>::new(MergeDigests(vec![snapshot.digest, *extra])))
                        .await?;
                    let contents = ctx.get(Get::<DigestContents>::new(*merged)).await?;

                    Ok(Listing(contents.0.iter().map(|f| f.path.clone()).collect()))
                })])
            .unwrap();
        registry.register_query(Query::new::<Listing, (Sources,)>()).unwrap();
        registry.register_query(Query::new::<Snapshot, (PathGlobs,)>()).unwrap();

        Scheduler::new(&registry, EngineConfig::default().with_build_root(root.clone())).unwrap()
    }

    #[test]
    fn test_snapshot_and_digest_rules() {
        let root = temp_root("snapshot");
        std::fs::write(root.join("src/a.rs"), "fn a() {}").unwrap();
        std::fs::write(root.join("src/b.rs"), "fn b() {}").unwrap();
        std::fs::write(root.join("src/skip.rs"), "").unwrap();

        let scheduler = scheduler(&root);
        let session = scheduler.session();

        let globs = PathGlobs::new(["src/*.rs", "!src/skip.rs"]);
        let listing = session.request::<Listing>((Sources(globs.clone()),)).success().unwrap();
        assert_eq!(listing.0, vec!["gen/extra.txt", "src/a.rs", "src/b.rs"]);

        let snapshot = session.request::<Snapshot>((globs,)).success().unwrap();
        assert_eq!(snapshot.files, vec!["src/a.rs", "src/b.rs"]);
        assert_eq!(snapshot.dirs, vec!["src"]);
    }

    #[test]
    fn test_new_file_invalidates_snapshot() {
        let root = temp_root("new-file");
        std::fs::write(root.join("src/a.rs"), "").unwrap();

        let scheduler = scheduler(&root);
        let globs = PathGlobs::new(["src/*.rs"]);

        let first = scheduler.session().request::<Snapshot>((globs.clone(),)).success().unwrap();
        assert_eq!(first.files.len(), 1);

        std::fs::write(root.join("src/b.rs"), "").unwrap();
        let second = scheduler.session().request::<Snapshot>((globs,)).success().unwrap();
        assert_eq!(second.files.len(), 2);
        assert_ne!(first.digest, second.digest);
    }
}
