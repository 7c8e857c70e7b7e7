//! The scheduler.
//!
//! Execution is demand-driven. A root request demands one memo slot, the
//! slot spawns its rule body onto the worker pool, and every `Get` issued by
//! the body demands further slots, suspending the body until they settle.
//! Concurrent demanders of one slot all await the same run, so a rule body
//! runs at most once per key, and every demander receives the same `Arc`.
//!
//! A slot computed before the latest invalidation epoch is re-verified on its
//! next demand: if none of the facts it read changed and all of its
//! dependencies still have the generation it saw, the old value is reused,
//! otherwise the body runs again. Session scoped slots are evicted when their
//! session is dropped, cacheable slots stay for the life of the scheduler.

mod context;
mod diagnostics;
mod entry;
mod session;
mod tracking;


use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use camino::Utf8PathBuf;
use console::Style;
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use indicatif::ProgressStyle;
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tracing::Instrument;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::Dynamic;
use crate::config::EngineConfig;
use crate::error::{EngineError, Failure, RequestError};
use crate::fs::Store;
use crate::graph::{Node, RuleGraph};
use crate::invalidation::{Fact, InvalidationLayer};
use crate::params::Params;
use crate::registry::RuleRegistry;

use entry::{Completed, Entry, Interest, NodeKey, Settled, State};
use session::SessionState;
use tracking::RecordPtr;

pub use context::{Context, Get, MultiGet};
pub use diagnostics::{Diagnostics, Execution};
pub use session::{CancelHandle, ExecutionRequest, Outcome, Session};

const ANSI_BLUE: Style = Style::new().blue();

pub(crate) static PROGRESS_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .expect("Error setting progress bar template")
        .progress_chars("#>-")
});

static RULE_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_spinner()
        .template("{spinner:.green} {msg}")
        .expect("Error setting progress bar template")
});

pub(crate) fn as_overhead(s: Instant) -> impl Display {
    ANSI_BLUE.apply_to(format!("(+{}ms)", s.elapsed().as_millis()))
}

/// Outcome of polling a memo slot.
enum Demand {
    Ready(Settled),
    Waiting(watch::Receiver<Option<Settled>>, Interest),
}

/// State shared by the scheduler, its sessions and every running rule.
pub(crate) struct Inner {
    pub(crate) graph: RuleGraph,
    pub(crate) invalidation: Arc<InvalidationLayer>,
    pub(crate) store: Store,
    pub(crate) cache_dir: Utf8PathBuf,
    nodes: DashMap<NodeKey, Arc<Entry>>,
    handle: tokio::runtime::Handle,
    tokens: AtomicU64,
    log_invalidation: bool,
}

impl Inner {
    /// Demands the value of a memo slot, starting its rule if nobody did yet.
    ///
    /// The returned future holds an interest in the slot for as long as it
    /// is pending; dropping it may abandon the run.
    pub(crate) fn demand(self: &Arc<Self>, session: &Arc<SessionState>, key: NodeKey) -> BoxFuture<'static, Settled> {
        let inner = Arc::clone(self);
        let session = Arc::clone(session);

        Box::pin(async move {
            loop {
                let entry = inner
                    .nodes
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(Entry::new(inner.label(&key))))
                    .clone();

                let (mut rx, _interest) = match inner.poll_or_start(&session, &key, &entry) {
                    Demand::Ready(settled) => return settled,
                    Demand::Waiting(rx, interest) => (rx, interest),
                };

                let settled = rx.wait_for(Option::is_some).await.map(|value| value.clone());
                match settled {
                    Ok(Some(settled)) => return settled,
                    // the run was abandoned by everyone else before we got
                    // to subscribe, start over
                    _ => tracing::trace!("{} was reset, demanding again", entry.label),
                }
            }
        })
    }

    fn poll_or_start(self: &Arc<Self>, session: &Arc<SessionState>, key: &NodeKey, entry: &Arc<Entry>) -> Demand {
        let epoch = self.invalidation.epoch();
        let mut state = entry.state.lock().unwrap();

        let previous = match &mut *state {
            State::Done(completed) if completed.is_verified(epoch, session.run_id) => {
                session.record_memo_hit();
                return Demand::Ready(completed.settled.clone());
            }
            State::Done(completed) => Some(Arc::clone(completed)),
            State::Running {
                token, interest, tx, ..
            } => {
                *interest += 1;
                return Demand::Waiting(tx.subscribe(), Interest::new(Arc::clone(entry), *token));
            }
            State::NotStarted { previous } => previous.take(),
        };

        let token = self.tokens.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);

        let run = Arc::clone(self).run(
            Arc::clone(session),
            key.clone(),
            Arc::clone(entry),
            token,
            previous.clone(),
        );
        let task = self.handle.spawn(run);

        *state = State::Running {
            token,
            interest: 1,
            tx,
            abort: task.abort_handle(),
            previous,
        };

        Demand::Waiting(rx, Interest::new(Arc::clone(entry), token))
    }

    async fn run(
        self: Arc<Self>,
        session: Arc<SessionState>,
        key: NodeKey,
        entry: Arc<Entry>,
        token: u64,
        previous: Option<Arc<Completed>>,
    ) {
        let epoch = self.invalidation.epoch();

        let Node::Rule(node) = self.graph.node(key.entry) else {
            unreachable!("params never run as rules");
        };

        if let Some(previous) = &previous {
            let reusable = node.rule.cacheable && !previous.settled.session_scoped;
            if reusable && self.is_clean(&session, previous).await {
                tracing::debug!("{} is clean, reusing its previous result", entry.label);
                session.record_cleaned();

                entry.complete(
                    token,
                    Completed {
                        settled: previous.settled.clone(),
                        record: previous.record.clone(),
                        epoch,
                        run_id: session.run_id,
                    },
                );
                return;
            }

            if self.log_invalidation {
                tracing::info!("{} is dirty, running again", entry.label);
            }
        }

        let generation = previous.as_ref().map_or(0, |p| p.settled.generation + 1);
        let record = RecordPtr::default();

        let span = tracing::info_span!(
            "rule",
            name = node.rule.id.name(),
            params = %key.params.fingerprint().short()
        );
        span.pb_set_style(&RULE_STYLE);
        span.pb_set_message(&format!("Running {}", entry.label));

        let context = Context::new(
            Arc::clone(&self),
            Arc::clone(&session),
            key.clone(),
            record.clone(),
            span.clone(),
        );

        let no_params = Params::new();
        let start = Instant::now();
        let result = AssertUnwindSafe(async {
            let inputs = join_all(node.inputs.iter().map(|source| context.demand_source(*source, &no_params)))
                .await
                .into_iter()
                .collect::<Result<Vec<Dynamic>, Failure>>()?;

            node.rule
                .body
                .call(context.clone(), inputs)
                .await
                .map_err(into_failure)
        })
        .catch_unwind()
        .instrument(span)
        .await
        .unwrap_or_else(|panic| {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                String::from("unknown payload")
            };

            Err(RequestError::Panicked(node.rule.id.name().to_string(), msg).into())
        });
        let duration = start.elapsed();

        let record = record.take();
        let session_scoped = !node.rule.cacheable || record.session_scoped;

        match &result {
            Ok(_) => tracing::debug!("{} finished in {duration:.2?}", entry.label),
            Err(failure) => tracing::debug!("{} failed: {failure}", entry.label),
        }

        session.record_execution(Execution {
            rule: node.rule.id.name().to_string(),
            params: key.params.fingerprint(),
            entry: key.entry,
            start,
            duration,
        });

        entry.complete(
            token,
            Completed {
                settled: Settled {
                    result,
                    generation,
                    session_scoped,
                },
                record,
                epoch,
                run_id: session.run_id,
            },
        );
    }

    /// Whether a stale result can be reused: every fact it read still has the
    /// version it saw, and every dependency, once brought up to date, still
    /// has the generation it saw. Dependencies are checked in the order they
    /// were demanded, stopping at the first change.
    async fn is_clean(self: &Arc<Self>, session: &Arc<SessionState>, previous: &Completed) -> bool {
        for (fact, version) in &previous.record.facts {
            if self.invalidation.current(fact).as_ref() != Some(version) {
                tracing::trace!("{fact:?} changed");
                return false;
            }
        }

        for dep in &previous.record.deps {
            let settled = self.demand(session, dep.key.clone()).await;
            if settled.generation != dep.generation {
                return false;
            }
        }

        true
    }

    /// Drops the results only valid for the session `run_id`, nobody can
    /// reuse them once the session is gone.
    pub(crate) fn evict_session(&self, run_id: u64) {
        let before = self.nodes.len();
        self.nodes.retain(|_, entry| match &*entry.state.lock().unwrap() {
            State::Done(completed) => !(completed.settled.session_scoped && completed.run_id == run_id),
            _ => true,
        });

        let evicted = before.saturating_sub(self.nodes.len());
        if evicted > 0 {
            tracing::debug!("evicted {evicted} results of session {run_id}");
        }
    }

    /// Forgets facts no memoized result refers to anymore, so they are not
    /// sampled on every refresh. Skipped while anything is running, a running
    /// body may have observed a fact its record does not show yet.
    fn prune_facts(&self) {
        let mut live = HashSet::<Fact>::new();

        for entry in self.nodes.iter() {
            let state = entry.state.lock().unwrap();
            let completed = match &*state {
                State::Running { .. } => return,
                State::NotStarted { previous } => previous.as_ref(),
                State::Done(completed) => Some(completed),
            };

            if let Some(completed) = completed {
                live.extend(completed.record.facts.iter().map(|(fact, _)| fact.clone()));
            }
        }

        let before = self.invalidation.len();
        self.invalidation.retain(|fact| live.contains(fact));

        let pruned = before.saturating_sub(self.invalidation.len());
        if pruned > 0 {
            tracing::debug!("forgot {pruned} facts nothing depends on");
        }
    }

    #[cfg(test)]
    pub(crate) fn memoized(&self) -> usize {
        self.nodes.len()
    }

    fn label(&self, key: &NodeKey) -> String {
        format!("{} ({})", self.graph.label(key.entry), key.params.fingerprint().short())
    }
}

/// Keeps a dependency's failure verbatim when the body just propagated it.
fn into_failure(e: anyhow::Error) -> Failure {
    match e.downcast_ref::<Failure>() {
        Some(failure) if failure.to_string() == e.to_string() => failure.clone(),
        _ => Failure::from(e),
    }
}

/// Owns the compiled rule graph, the memo table and the worker pool.
///
/// ```rust,no_run
/// use tsumugi::{EngineConfig, Query, RuleRegistry, Scheduler, rule};
///
/// #[derive(Clone, Debug, PartialEq, Eq, Hash)]
/// struct Name(String);
/// struct Greeting(String);
///
/// let registry = RuleRegistry::new();
/// registry.register_rules([rule::<Greeting, (Name,)>("greet")
///     .run(|_, (name,)| async move { Ok(Greeting(format!("Hello, {}!", name.0))) })])?;
/// registry.register_query(Query::new::<Greeting, (Name,)>())?;
///
/// let scheduler = Scheduler::new(&registry, EngineConfig::default())?;
/// let greeting = scheduler.session().request::<Greeting>((Name("world".into()),));
/// assert_eq!(greeting.success().unwrap().0, "Hello, world!");
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct Scheduler {
    inner: Arc<Inner>,
    runtime: Arc<Runtime>,
    runs: AtomicU64,
    #[cfg(feature = "watch")]
    _watcher: Option<crate::invalidation::watch::Watcher>,
}

impl Scheduler {
    /// Freezes the registry, compiles the rule graph and starts the worker
    /// pool. Every registry or graph error surfaces here, before anything
    /// runs.
    pub fn new(registry: &RuleRegistry, config: EngineConfig) -> Result<Self, EngineError> {
        let s = Instant::now();
        let (root, cache_dir) = config.resolve_paths()?;

        let frozen = registry.freeze();
        let graph = RuleGraph::compile(&frozen)?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .thread_name("tsumugi-worker")
            .enable_all()
            .build()
            .map_err(EngineError::RuntimeBuild)?;

        let invalidation = Arc::new(InvalidationLayer::new(root, config.log_invalidation));

        #[cfg(feature = "watch")]
        let watcher = match config.watch {
            true => Some(crate::invalidation::watch::start(
                Arc::clone(&invalidation),
                cache_dir.clone(),
            )?),
            false => None,
        };

        if config.watch && cfg!(not(feature = "watch")) {
            tracing::warn!("watching was requested, but the `watch` feature is disabled");
        }

        tracing::info!(
            "compiled {} rule entries for {} queries {}",
            graph.len(),
            graph.queries().count(),
            as_overhead(s)
        );

        let inner = Inner {
            graph,
            invalidation,
            store: Store::new(),
            cache_dir,
            nodes: DashMap::new(),
            handle: runtime.handle().clone(),
            tokens: AtomicU64::new(0),
            log_invalidation: config.log_invalidation,
        };

        Ok(Self {
            inner: Arc::new(inner),
            runtime: Arc::new(runtime),
            runs: AtomicU64::new(0),
            #[cfg(feature = "watch")]
            _watcher: watcher,
        })
    }

    /// Begins a new session, resampling every known fact first. Rules see a
    /// snapshot of the process environment taken now.
    pub fn session(&self) -> Session {
        let env = std::env::vars_os()
            .filter_map(|(name, value)| Some((name.into_string().ok()?, value.into_string().ok()?)));

        self.session_with_env(env)
    }

    /// Begins a new session in which rules see `env` as their environment.
    ///
    /// The snapshot is shared by every session of the scheduler, starting a
    /// session replaces it for sessions still running too.
    pub fn session_with_env<K, V>(&self, env: impl IntoIterator<Item = (K, V)>) -> Session
    where
        K: Into<String>,
        V: Into<String>,
    {
        let run_id = self.runs.fetch_add(1, Ordering::Relaxed);

        self.inner.prune_facts();
        self.inner
            .invalidation
            .set_env(env.into_iter().map(|(k, v)| (k.into(), v.into())).collect::<HashMap<_, _>>());

        let changed = self.inner.invalidation.refresh();
        if changed > 0 {
            tracing::info!("{changed} facts changed since the last session");
        }

        Session::new(
            Arc::clone(&self.inner),
            Arc::new(SessionState::new(run_id)),
            Arc::clone(&self.runtime),
        )
    }

    pub fn graph(&self) -> &RuleGraph {
        &self.inner.graph
    }

    /// The content-addressed store backing the filesystem intrinsics.
    pub fn store(&self) -> &Store {
        &self.inner.store
    }
}
