use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Context as _;
use camino::Utf8Path;
use futures::future::{BoxFuture, join_all};
use petgraph::graph::NodeIndex;

use crate::core::{Dynamic, Hash32, TypeKey};
use crate::engine::entry::NodeKey;
use crate::engine::session::SessionState;
use crate::engine::tracking::RecordPtr;
use crate::engine::Inner;
use crate::error::{Failure, RequestError};
use crate::fs::Store;
use crate::graph::{Node, RuleEntry};
use crate::invalidation::{Fact, FactVersion, expand_glob};
use crate::params::{IntoParams, Param, Params, Product, Value, params_str};
use crate::registry::UnionMembership;
use crate::rules::DependencyKey;

/// A request for the product `P`, computed from the params in scope of the
/// calling rule extended with the provided values.
pub struct Get<P> {
    pub(crate) provided: Params,
    pub(crate) union: Option<TypeKey>,
    _phantom: PhantomData<fn() -> P>,
}

impl<P: Product> Get<P> {
    /// `Get(P, T, value)`.
    pub fn new(input: impl Param) -> Self {
        Self::with((input,))
    }

    /// A Get providing several values at once, e.g. `Get::<P>::with((a, b))`.
    pub fn with(provided: impl IntoParams) -> Self {
        Self {
            provided: provided.into_params(),
            union: None,
            _phantom: PhantomData,
        }
    }

    /// A Get dispatched on the concrete type of `member`, which has to be
    /// registered as a member of the union marker `M`.
    pub fn union<M: 'static>(member: impl Param) -> Self {
        Self {
            provided: Params::new().with(member),
            union: Some(TypeKey::of::<M>()),
            _phantom: PhantomData,
        }
    }

    pub fn provided(&self) -> &Params {
        &self.provided
    }
}

impl<P> Clone for Get<P> {
    fn clone(&self) -> Self {
        Self {
            provided: self.provided.clone(),
            union: self.union,
            _phantom: PhantomData,
        }
    }
}

impl<P> std::fmt::Debug for Get<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Get({}, {:?})", std::any::type_name::<P>(), self.provided)
    }
}

/// A collection of Gets awaited together.
///
/// All Gets are demanded concurrently and every one of them is allowed to
/// settle. The result is either every value, positionally, or the first
/// failure in request order.
pub trait MultiGet: Send {
    type Output: Send;

    fn run(self, ctx: &Context) -> BoxFuture<'_, anyhow::Result<Self::Output>>;
}

impl<P: Product> MultiGet for Vec<Get<P>> {
    type Output = Vec<Arc<P>>;

    fn run(self, ctx: &Context) -> BoxFuture<'_, anyhow::Result<Self::Output>> {
        Box::pin(async move {
            join_all(self.into_iter().map(|get| ctx.get(get)))
                .await
                .into_iter()
                .collect()
        })
    }
}

macro_rules! impl_multi_get {
    ($($P:ident => $g:ident),*) => {
        impl<$($P: Product),*> MultiGet for ($(Get<$P>,)*) {
            type Output = ($(Arc<$P>,)*);

            fn run(self, ctx: &Context) -> BoxFuture<'_, anyhow::Result<Self::Output>> {
                let ($($g,)*) = self;

                Box::pin(async move {
                    let ($($g,)*) = futures::join!($(ctx.get($g)),*);
                    Ok(($($g?,)*))
                })
            }
        }
    };
}

impl_multi_get!(A => a);
impl_multi_get!(A => a, B => b);
impl_multi_get!(A => a, B => b, C => c);
impl_multi_get!(A => a, B => b, C => c, D => d);
impl_multi_get!(A => a, B => b, C => c, D => d, E => e);
impl_multi_get!(A => a, B => b, C => c, D => d, E => e, F => f);

/// Handle given to every running rule body.
///
/// This is the only way a rule reaches anything outside its inputs: other
/// products through [`get`](Context::get) and [`multi_get`](Context::multi_get),
/// and the outside world through the fact-recording helpers, so that every
/// read is known to the invalidation layer.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
    session: Arc<SessionState>,
    key: NodeKey,
    record: RecordPtr,
    span: tracing::Span,
}

impl Context {
    pub(crate) fn new(
        inner: Arc<Inner>,
        session: Arc<SessionState>,
        key: NodeKey,
        record: RecordPtr,
        span: tracing::Span,
    ) -> Self {
        Self {
            inner,
            session,
            key,
            record,
            span,
        }
    }

    /// Suspends until the requested product is available.
    ///
    /// A failure of the dependency is returned as-is, so a rule may recover
    /// from it or propagate it with `?`.
    pub async fn get<P: Product>(&self, get: Get<P>) -> anyhow::Result<Arc<P>> {
        let source = self.resolve_get(&get)?;
        let value = self.demand_source(source, &get.provided).await?;

        Ok(value
            .downcast::<P>()
            .expect("Type mismatch in dependency resolution"))
    }

    pub async fn multi_get<M: MultiGet>(&self, gets: M) -> anyhow::Result<M::Output> {
        gets.run(self).await
    }

    /// Registered union members, in registration order.
    pub fn union_membership(&self) -> &UnionMembership {
        self.inner.graph.unions()
    }

    /// Reads an environment variable, recording it as a fact.
    /// Variables come from the environment snapshot of the session.
    pub fn env_var(&self, name: &str) -> Option<String> {
        let value = self.inner.invalidation.env_var(name);
        self.observe(Fact::Env(name.to_string()), FactVersion::of_env(value.as_deref()));
        value
    }

    /// Reads a file relative to the build root, recording its content digest
    /// as a fact. A failed read is recorded too, so the node is recomputed
    /// once the file becomes readable.
    pub async fn read_file(&self, path: impl AsRef<Utf8Path>) -> anyhow::Result<Vec<u8>> {
        let path = path.as_ref().to_path_buf();
        let result = tokio::fs::read(self.build_root().join(&path)).await;

        let version = match &result {
            Ok(bytes) => FactVersion::Digest(Hash32::hash(bytes)),
            Err(e) => FactVersion::of_error(e),
        };
        self.observe(Fact::File(path.clone()), version);

        result.with_context(|| format!("Couldn't read {path}"))
    }

    /// Expands a glob relative to the build root, recording the set of
    /// matches as a fact.
    pub async fn glob(&self, pattern: &str) -> anyhow::Result<Vec<String>> {
        let root = self.build_root().to_path_buf();
        let owned = pattern.to_string();
        let result = tokio::task::spawn_blocking(move || expand_glob(&root, &owned)).await?;

        let version = match &result {
            Ok(paths) => FactVersion::Digest(Hash32::hash(paths.join("\n"))),
            Err(e) => FactVersion::Unreadable(e.to_string()),
        };
        self.observe(Fact::Glob(pattern.to_string()), version);

        Ok(result?)
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn build_root(&self) -> &Utf8Path {
        self.inner.invalidation.root()
    }

    pub fn cache_dir(&self) -> &Utf8Path {
        &self.inner.cache_dir
    }

    /// The span the rule body runs in.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    fn observe(&self, fact: Fact, version: FactVersion) {
        self.inner.invalidation.observe(fact.clone(), version.clone());
        self.record.push_fact(fact, version);
    }

    fn rule_entry(&self) -> &RuleEntry {
        match self.inner.graph.node(self.key.entry) {
            Node::Rule(entry) => entry,
            Node::Param(_) => unreachable!("params never run as rules"),
        }
    }

    fn resolve_get<P: Product>(&self, get: &Get<P>) -> Result<NodeIndex, RequestError> {
        let entry = self.rule_entry();
        let product = TypeKey::of::<P>();
        let provided = get.provided.type_keys();

        if let Some(union) = get.union {
            let unions = self.inner.graph.unions();
            for member in &provided {
                if !unions.is_member(union, *member) {
                    return Err(RequestError::NotAMember {
                        union: union.to_string(),
                        member: member.to_string(),
                    });
                }
            }
        }

        let key = DependencyKey::new(product, provided.iter().copied());
        entry.gets.get(&key).copied().ok_or_else(|| match get.union {
            // a member the graph compiler skipped for lack of a provider
            Some(union) => RequestError::NoUnionProvider {
                rule: entry.rule.id.name().to_string(),
                product: product.to_string(),
                union: union.to_string(),
                member: params_str(&provided),
            },
            None => RequestError::UndeclaredGet {
                rule: entry.rule.id.name().to_string(),
                product: product.to_string(),
                params: params_str(&provided),
            },
        })
    }

    /// Produces the value of `source` in the scope of this rule extended with
    /// `provided`, recording the dependency.
    pub(crate) async fn demand_source(&self, source: NodeIndex, provided: &Params) -> Result<Dynamic, Failure> {
        let scope = self.key.params.extend_with(provided);

        match self.inner.graph.node(source) {
            Node::Param(key) => Ok(scope
                .get(key)
                .map(Value::dynamic)
                .expect("Param missing from the scope it was resolved in")),
            Node::Rule(entry) => {
                let key = NodeKey {
                    entry: source,
                    params: scope.restrict(&entry.used),
                };

                let settled = self.inner.demand(&self.session, key.clone()).await;
                self.record.push_dep(key, &settled);
                settled.result
            }
        }
    }
}
