use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::{BoxFuture, join_all};
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tracing::Instrument;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::{Dynamic, TypeKey};
use crate::engine::diagnostics::{Diagnostics, Execution};
use crate::engine::entry::NodeKey;
use crate::engine::{Inner, PROGRESS_STYLE, as_overhead};
use crate::error::Failure;
use crate::graph::Node;
use crate::params::{IntoParams, Params, Product};

/// The result of one root request.
pub enum Outcome<T: ?Sized> {
    Success(Arc<T>),
    Failure(Failure),
    /// The session was cancelled before the request completed. This is not a
    /// failure, nothing went wrong.
    Cancelled,
}

impl<T: ?Sized> Outcome<T> {
    pub fn success(self) -> Option<Arc<T>> {
        match self {
            Outcome::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn failure(self) -> Option<Failure> {
        match self {
            Outcome::Failure(failure) => Some(failure),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    /// Converts into a `Result`, treating cancellation as `None`.
    pub fn into_result(self) -> Option<Result<Arc<T>, Failure>> {
        match self {
            Outcome::Success(value) => Some(Ok(value)),
            Outcome::Failure(failure) => Some(Err(failure)),
            Outcome::Cancelled => None,
        }
    }
}

impl Outcome<dyn Any + Send + Sync> {
    /// Recovers the concrete product type of a type-erased outcome.
    ///
    /// # Panics
    /// Panics if `P` is not the product that was requested.
    pub fn downcast<P: Product>(self) -> Outcome<P> {
        match self {
            Outcome::Success(value) => {
                Outcome::Success(value.downcast::<P>().expect("Type mismatch in request outcome"))
            }
            Outcome::Failure(failure) => Outcome::Failure(failure),
            Outcome::Cancelled => Outcome::Cancelled,
        }
    }
}

impl<T: ?Sized> Clone for Outcome<T> {
    fn clone(&self) -> Self {
        match self {
            Outcome::Success(value) => Outcome::Success(Arc::clone(value)),
            Outcome::Failure(failure) => Outcome::Failure(failure.clone()),
            Outcome::Cancelled => Outcome::Cancelled,
        }
    }
}

impl<T: ?Sized> fmt::Debug for Outcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success(_) => write!(f, "Success({})", std::any::type_name::<T>()),
            Outcome::Failure(failure) => write!(f, "Failure({failure})"),
            Outcome::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// A batch of root requests executed together.
#[derive(Clone, Debug, Default)]
pub struct ExecutionRequest {
    roots: Vec<(TypeKey, Params)>,
}

impl ExecutionRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<P: Product>(&mut self, params: impl IntoParams) -> &mut Self {
        self.roots.push((TypeKey::of::<P>(), params.into_params()));
        self
    }

    pub fn with<P: Product>(mut self, params: impl IntoParams) -> Self {
        self.add::<P>(params);
        self
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

/// Per-session state shared by every node running on behalf of the session.
pub(crate) struct SessionState {
    pub(crate) run_id: u64,
    cancelled: watch::Sender<bool>,
    executions: Mutex<Vec<Execution>>,
    cleaned: AtomicUsize,
    memo_hits: AtomicUsize,
}

impl SessionState {
    pub(crate) fn new(run_id: u64) -> Self {
        Self {
            run_id,
            cancelled: watch::Sender::new(false),
            executions: Mutex::new(Vec::new()),
            cleaned: AtomicUsize::new(0),
            memo_hits: AtomicUsize::new(0),
        }
    }

    pub(crate) fn record_execution(&self, execution: Execution) {
        self.executions.lock().unwrap().push(execution);
    }

    pub(crate) fn record_cleaned(&self) {
        self.cleaned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_memo_hit(&self) {
        self.memo_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn cancel(&self) {
        if !self.cancelled.send_replace(true) {
            tracing::info!("session {} cancelled", self.run_id);
        }
    }

    /// Resolves once the session is cancelled.
    fn cancelled(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.cancelled.subscribe();

        async move {
            if rx.wait_for(|cancelled| *cancelled).await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}

/// Cancels a session from anywhere, e.g. from a signal handler or another
/// thread while the session is blocked on a request.
#[derive(Clone)]
pub struct CancelHandle(Arc<SessionState>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.cancel();
    }
}

/// One build invocation's view over the shared memo table.
///
/// Requests made through the same session share its cancellation and
/// diagnostics. Uncacheable rules run at most once per session.
pub struct Session {
    inner: Arc<Inner>,
    state: Arc<SessionState>,
    runtime: Arc<Runtime>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.inner.evict_session(self.state.run_id);
    }
}

impl Session {
    pub(crate) fn new(inner: Arc<Inner>, state: Arc<SessionState>, runtime: Arc<Runtime>) -> Self {
        Self { inner, state, runtime }
    }

    pub fn run_id(&self) -> u64 {
        self.state.run_id
    }

    /// Computes `P` for the given params, blocking the calling thread.
    ///
    /// Must not be called from within an async context, use
    /// [`request_async`](Session::request_async) there.
    pub fn request<P: Product>(&self, params: impl IntoParams) -> Outcome<P> {
        self.runtime.block_on(self.request_async::<P>(params))
    }

    pub fn request_async<P: Product>(
        &self,
        params: impl IntoParams,
    ) -> impl Future<Output = Outcome<P>> + Send + 'static {
        let root = self.run_root(TypeKey::of::<P>(), params.into_params());
        async move { root.await.downcast::<P>() }
    }

    /// Executes every root of the request concurrently, returning the
    /// outcomes in request order.
    pub fn execute(&self, request: &ExecutionRequest) -> Vec<Outcome<dyn Any + Send + Sync>> {
        self.runtime.block_on(self.execute_async(request))
    }

    pub fn execute_async(
        &self,
        request: &ExecutionRequest,
    ) -> impl Future<Output = Vec<Outcome<dyn Any + Send + Sync>>> + Send + 'static {
        let s = Instant::now();

        let span = tracing::info_span!("request", roots = request.len());
        span.pb_set_style(&PROGRESS_STYLE);
        span.pb_set_length(request.len() as u64);
        span.pb_set_message("Executing requests...");

        let roots: Vec<_> = request
            .roots
            .iter()
            .map(|(product, params)| {
                let root = self.run_root(*product, params.clone());
                let span = span.clone();
                async move {
                    let outcome = root.await;
                    span.pb_inc(1);
                    outcome
                }
            })
            .collect();

        let count = roots.len();
        async move {
            let outcomes = join_all(roots).instrument(span).await;
            tracing::info!("executed {count} requests {}", as_overhead(s));
            outcomes
        }
    }

    pub fn cancel(&self) {
        self.state.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(Arc::clone(&self.state))
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state.cancelled.borrow()
    }

    /// Snapshot of what ran in this session so far.
    pub fn diagnostics(&self) -> Diagnostics {
        let executions = self.state.executions.lock().unwrap().clone();

        Diagnostics {
            executed: executions.len(),
            executions,
            cleaned: self.state.cleaned.load(Ordering::Relaxed),
            memo_hits: self.state.memo_hits.load(Ordering::Relaxed),
        }
    }

    fn run_root(&self, product: TypeKey, params: Params) -> BoxFuture<'static, Outcome<dyn Any + Send + Sync>> {
        let inner = Arc::clone(&self.inner);
        let state = Arc::clone(&self.state);
        let cancelled = state.cancelled();

        Box::pin(async move {
            let root = match inner.graph.find_root(product, &params.type_keys()) {
                Ok(root) => root,
                Err(e) => return Outcome::Failure(e.into()),
            };

            let key = match inner.graph.node(root) {
                // the query asks for one of its own params
                Node::Param(key) => {
                    let value: Dynamic = params
                        .get(key)
                        .map(|value| value.dynamic())
                        .expect("Matched query params are a subset of the request");
                    return Outcome::Success(value);
                }
                Node::Rule(entry) => NodeKey {
                    entry: root,
                    params: params.restrict(&entry.used),
                },
            };

            let compute = inner.demand(&state, key);

            tokio::select! {
                biased;
                _ = cancelled => {
                    tracing::debug!("request for {product} cancelled");
                    Outcome::Cancelled
                }
                settled = compute => match settled.result {
                    Ok(value) => Outcome::Success(value),
                    Err(failure) => Outcome::Failure(failure),
                },
            }
        })
    }
}
