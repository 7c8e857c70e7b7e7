use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// A failure produced while executing a node.
///
/// Failures are memoized like values and broadcast to every awaiter of the
/// failed node, so the underlying error lives behind an `Arc` and is cloned
/// rather than re-created.
#[derive(Debug, Clone)]
pub struct Failure(pub(crate) Arc<anyhow::Error>);

impl Failure {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    /// The original error, as raised by the rule body or intrinsic.
    pub fn error(&self) -> &anyhow::Error {
        &self.0
    }

    /// Attempts to view the root cause as a concrete error type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    /// Whether both failures are the very same memoized error.
    pub fn ptr_eq(&self, other: &Failure) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<anyhow::Error> for Failure {
    fn from(e: anyhow::Error) -> Self {
        Failure(Arc::new(e))
    }
}

impl From<RequestError> for Failure {
    fn from(e: RequestError) -> Self {
        Failure::new(e)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Error while registering rules:\n{0}")]
    Registry(#[from] RegistryError),

    #[error("Error while compiling the rule graph:\n{0}")]
    Graph(#[from] GraphError),

    #[error("Failed to build runtime")]
    RuntimeBuild(#[source] std::io::Error),

    #[error("Error while loading configuration:\n{0}")]
    Config(#[from] ConfigError),

    #[cfg(feature = "watch")]
    #[error("Error while watching for file changes:\n{0}")]
    Watch(#[from] notify::Error),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error(
        "Rules '{first}' and '{second}' both produce {product} from ({params}); \
         remove one of them or change the signature of one"
    )]
    DuplicateRule {
        product: String,
        params: String,
        first: String,
        second: String,
    },

    #[error("'{0}' was registered after the rule graph started compiling")]
    LateRegistration(String),

    #[error("Type {member} cannot be registered twice as a member of union {union}")]
    DuplicateUnionMember { union: String, member: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error(
        "More than one rule can compute {product} for input Params({params}):\n  {}",
        .candidates.join("\n  ")
    )]
    Ambiguous {
        product: String,
        params: String,
        candidates: Vec<String>,
    },

    #[error(
        "No rule was able to compute {product} for input Params({params}){}",
        .reasons.iter().map(|r| format!("\n  {r}")).collect::<String>()
    )]
    NoProvider {
        product: String,
        params: String,
        reasons: Vec<String>,
    },

    #[error("Rule cycle detected:\n  {}", .path.join("\n  -> "))]
    Cycle { path: Vec<String> },

    #[error("No queries were registered, there is nothing to compile")]
    NoQueries,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("No installed query can compute {product} given input Params({params}){hint}")]
    NoMatchingQuery {
        product: String,
        params: String,
        hint: String,
    },

    #[error("Rule '{rule}' requested Get({product}, {params}) but never declared it")]
    UndeclaredGet {
        rule: String,
        product: String,
        params: String,
    },

    #[error("Value of type {member} is not a registered member of union {union}")]
    NotAMember { union: String, member: String },

    #[error("No rule computes {product} for member {member} of union {union} in the scope of rule '{rule}'")]
    NoUnionProvider {
        rule: String,
        product: String,
        union: String,
        member: String,
    },

    #[error("Rule '{0}' panicked: {1}")]
    Panicked(String, String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("Build root {0} is not a directory")]
    BuildRoot(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Digest {0} is not present in the store")]
    MissingDigest(String),

    #[error("Cannot merge digests: {path} has conflicting contents")]
    MergeConflict { path: String },

    #[error("Couldn't compile glob pattern.\n{0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Couldn't run glob.\n{0}")]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error("Path {0} is not a normalized relative path")]
    PathEscape(String),

    #[error("Cannot remove prefix {prefix}: {path} is not under it")]
    NotUnderPrefix { path: String, prefix: String },

    #[error("Couldn't encode directory manifest.\n{0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Process '{description}' failed to start.\n{source}")]
    Spawn {
        description: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process '{description}' timed out after {seconds:.1}s")]
    Timeout { description: String, seconds: f64 },

    #[error("Process '{description}' exited with code {code}\n{stderr}")]
    ExitCode {
        description: String,
        code: i32,
        stderr: String,
    },

    #[error("Process has an empty argv")]
    EmptyArgv,
}
