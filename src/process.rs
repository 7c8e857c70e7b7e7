//! Process execution intrinsic.
//!
//! Running a process is just another rule: `Get::<ProcessResult>::new(process)`
//! suspends the calling rule while the child runs on the runtime, and the
//! result is memoized on the full [`Process`] description, input digest
//! included.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::process::Command;

use crate::error::ProcessError;
use crate::fs::Digest;
use crate::rules::{Rule, rule};

/// Description of a process to run in a sandbox built from `input_digest`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Process {
    pub argv: Vec<String>,
    pub description: String,
    pub env: BTreeMap<String, String>,
    /// Tree materialized into the sandbox before the process starts. `None`
    /// runs in an empty sandbox.
    pub input_digest: Option<Digest>,
    /// Working directory relative to the sandbox root.
    pub working_directory: Option<Utf8PathBuf>,
    /// Files captured into the output digest, relative to the sandbox root.
    pub output_files: Vec<String>,
    pub timeout: Option<Duration>,
}

impl Process {
    pub fn new<S: Into<String>>(argv: impl IntoIterator<Item = S>) -> Self {
        let argv: Vec<String> = argv.into_iter().map(Into::into).collect();

        Self {
            description: argv.join(" "),
            argv,
            env: BTreeMap::new(),
            input_digest: None,
            working_directory: None,
            output_files: Vec::new(),
            timeout: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn input_digest(mut self, digest: Digest) -> Self {
        self.input_digest = Some(digest);
        self
    }

    pub fn working_directory(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.working_directory = Some(path.into());
        self
    }

    pub fn output_files<S: Into<String>>(mut self, files: impl IntoIterator<Item = S>) -> Self {
        self.output_files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Result of a process, whatever its exit code.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FallibleProcessResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    pub output_digest: Digest,
}

/// Result of a process which exited successfully.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProcessResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub output_digest: Digest,
}

static SANDBOX_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Scratch directory of one process run. Removed when dropped, so a failed
/// or abandoned run does not leave it behind.
struct Sandbox {
    path: Utf8PathBuf,
    removed: bool,
}

impl Sandbox {
    fn new(cache_dir: &Utf8Path) -> Self {
        let name = format!("{}-{}", std::process::id(), SANDBOX_COUNTER.fetch_add(1, Ordering::Relaxed));

        Self {
            path: cache_dir.join("sandbox").join(name),
            removed: false,
        }
    }

    async fn remove(mut self) {
        self.removed = true;
        if let Err(e) = tokio::fs::remove_dir_all(&self.path).await {
            tracing::warn!("couldn't remove sandbox {}: {e}", self.path);
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if !self.removed {
            // the run may be aborted mid-await, there is no runtime to lean on
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}

/// The process intrinsic rules.
pub fn rules() -> Vec<Rule> {
    vec![
        rule::<FallibleProcessResult, (Process,)>("run_process").run(|ctx, (process,)| async move {
            let argv0 = process.argv.first().ok_or(ProcessError::EmptyArgv)?;

            let sandbox = Sandbox::new(ctx.cache_dir());

            match process.input_digest {
                Some(digest) => ctx.store().materialize(&digest, &sandbox.path).await?,
                None => tokio::fs::create_dir_all(&sandbox.path).await?,
            }

            let cwd = match &process.working_directory {
                Some(dir) => sandbox.path.join(dir),
                None => sandbox.path.clone(),
            };

            let mut command = Command::new(argv0);
            command
                .args(&process.argv[1..])
                .env_clear()
                .envs(&process.env)
                .current_dir(&cwd)
                .stdin(Stdio::null())
                .kill_on_drop(true);

            tracing::debug!("running '{}' in {}", process.description, sandbox.path);

            let output = command.output();
            let output = match process.timeout {
                Some(timeout) => tokio::time::timeout(timeout, output)
                    .await
                    .map_err(|_| ProcessError::Timeout {
                        description: process.description.clone(),
                        seconds: timeout.as_secs_f64(),
                    })?,
                None => output.await,
            };

            let output = output.map_err(|source| ProcessError::Spawn {
                description: process.description.clone(),
                source,
            })?;

            let output_digest = ctx.store().capture(&sandbox.path, &process.output_files).await?;
            sandbox.remove().await;

            Ok(FallibleProcessResult {
                stdout: output.stdout,
                stderr: output.stderr,
                exit_code: output.status.code().unwrap_or(-1),
                output_digest,
            })
        }),
        rule::<ProcessResult, (Process,)>("check_process")
            .get::<FallibleProcessResult, (Process,)>()
            .run(|ctx, (process,)| async move {
                let result = ctx
                    .get(crate::Get::<FallibleProcessResult>::new(Process::clone(&process)))
                    .await?;

                if result.exit_code != 0 {
                    return Err(ProcessError::ExitCode {
                        description: process.description.clone(),
                        code: result.exit_code,
                        stderr: String::from_utf8_lossy(&result.stderr).into_owned(),
                    }
                    .into());
                }

                Ok(ProcessResult {
                    stdout: result.stdout.clone(),
                    stderr: result.stderr.clone(),
                    output_digest: result.output_digest,
                })
            }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{CreateDigest, DigestContents, FileContent};
    use crate::{EngineConfig, Get, Query, RuleRegistry, Scheduler};

    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    struct Script(&'static str);

    struct Output(String);

    fn scheduler(name: &str) -> (Scheduler, Utf8PathBuf) {
        let root = std::env::temp_dir().join(format!("tsumugi-process-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(&root).unwrap();
        let root = Utf8PathBuf::try_from(root).unwrap();

        let registry = RuleRegistry::new();
        registry.register_rules(rules()).unwrap();
        registry.register_rules(crate::fs::rules()).unwrap();
        registry
            .register_rules([rule::<Output, (Script,)>("sandboxed_cat")
                .get::<Digest, (CreateDigest,)>()
                .get::<ProcessResult, (Process,)>()
                .get::<DigestContents, (Digest,)>()
                .run(|ctx, (script,)| async move {
                    let input = ctx
                        .get(Get::<Digest>::new(CreateDigest(vec![FileContent::new("in.txt", script.0)])))
                        .await?;
                    let process = Process::new(["/bin/sh", "-c", "cat in.txt > out.txt"])
                        .env("PATH", "/usr/bin:/bin")
                        .input_digest(*input)
                        .output_files(["out.txt"]);
                    let result = ctx.get(Get::<ProcessResult>::new(process)).await?;
                    let contents = ctx.get(Get::<DigestContents>::new(result.output_digest)).await?;

                    Ok(Output(String::from_utf8_lossy(&contents.0[0].content).into_owned()))
                })])
            .unwrap();
        registry.register_query(Query::new::<Output, (Script,)>()).unwrap();
        registry.register_query(Query::new::<ProcessResult, (Process,)>()).unwrap();
        registry
            .register_query(Query::new::<FallibleProcessResult, (Process,)>())
            .unwrap();

        let config = EngineConfig::default().with_build_root(root.clone());
        (Scheduler::new(&registry, config).unwrap(), root)
    }

    fn sandboxes_left(root: &Utf8Path) -> usize {
        std::fs::read_dir(root.join(".tsumugi/sandbox")).map_or(0, |dir| dir.count())
    }

    #[test]
    fn test_process_runs_in_sandbox() {
        let (scheduler, root) = scheduler("sandbox");
        let output = scheduler
            .session()
            .request::<Output>((Script("hello"),))
            .success()
            .unwrap();

        assert_eq!(output.0, "hello");
        assert_eq!(sandboxes_left(&root), 0);
    }

    #[test]
    fn test_non_zero_exit_fails() {
        let (scheduler, _) = scheduler("exit");
        let outcome = scheduler
            .session()
            .request::<ProcessResult>((Process::new(["/bin/sh", "-c", "echo oops >&2; exit 3"]).env("PATH", "/usr/bin:/bin"),));

        let failure = outcome.failure().unwrap();
        match failure.downcast_ref::<ProcessError>() {
            Some(ProcessError::ExitCode { code, stderr, .. }) => {
                assert_eq!(*code, 3);
                assert_eq!(stderr.trim(), "oops");
            }
            other => panic!("unexpected failure: {other:?}"),
        }
    }

    #[test]
    fn test_timeout_fails_the_node() {
        let (scheduler, root) = scheduler("timeout");
        let process = Process::new(["/bin/sh", "-c", "sleep 5"])
            .env("PATH", "/usr/bin:/bin")
            .timeout(Duration::from_millis(100));
        let outcome = scheduler.session().request::<ProcessResult>((process,));

        let failure = outcome.failure().unwrap();
        assert!(matches!(
            failure.downcast_ref::<ProcessError>(),
            Some(ProcessError::Timeout { .. })
        ));
        assert_eq!(sandboxes_left(&root), 0);
    }

    #[test]
    fn test_spawn_failure_removes_the_sandbox() {
        let (scheduler, root) = scheduler("spawn");
        let outcome = scheduler
            .session()
            .request::<FallibleProcessResult>((Process::new(["/definitely/not/here"]),));

        let failure = outcome.failure().unwrap();
        assert!(matches!(
            failure.downcast_ref::<ProcessError>(),
            Some(ProcessError::Spawn { .. })
        ));
        assert_eq!(sandboxes_left(&root), 0);
    }
}
