//! Rule declarations.
//!
//! A [`Rule`] is a plain data record: the product it computes, the types it
//! takes as positional inputs, the Gets its body may issue, and a type-erased
//! async body. Rules are declared with the [`rule`] builder:
//!
//! ```rust,no_run
//! use tsumugi::{rule, Get};
//!
//! #[derive(Clone, Debug, PartialEq, Eq, Hash)]
//! struct Addresses(Vec<String>);
//! #[derive(Clone, Debug, PartialEq, Eq, Hash)]
//! struct Target(String);
//! struct Targets(Vec<Target>);
//! struct Resolved(String);
//!
//! let resolve = rule::<Resolved, (Target,)>("resolve")
//!     .run(|_ctx, (target,)| async move { Ok(Resolved(target.0.clone())) });
//!
//! let targets = rule::<Targets, (Addresses,)>("targets")
//!     .get::<Resolved, (Target,)>()
//!     .run(|ctx, (addresses,)| async move {
//!         let gets = addresses.0.iter().map(|a| Get::<Resolved>::new(Target(a.clone())));
//!         let resolved = ctx.multi_get(gets.collect::<Vec<_>>()).await?;
//!         Ok(Targets(resolved.iter().map(|r| Target(r.0.clone())).collect()))
//!     });
//! ```

use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::panic::Location;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::core::{ArcStr, Dynamic, TypeKey};
use crate::engine::Context;
use crate::params::{ParamList, ParamTypes, Product, params_str};

/// Stable identity of a rule: its name and the source location it was
/// declared at.
#[derive(Clone)]
pub struct RuleId {
    name: ArcStr,
    location: &'static Location<'static>,
}

impl RuleId {
    pub(crate) fn new(name: impl Into<ArcStr>, location: &'static Location<'static>) -> Self {
        Self {
            name: name.into(),
            location,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn location(&self) -> String {
        format!("{}:{}", self.location.file(), self.location.line())
    }
}

impl PartialEq for RuleId {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.location.file() == other.location.file()
            && self.location.line() == other.location.line()
            && self.location.column() == other.location.column()
    }
}

impl Eq for RuleId {}

impl Hash for RuleId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.location.file().hash(state);
        self.location.line().hash(state);
        self.location.column().hash(state);
    }
}

impl fmt::Debug for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.location())
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A Get edge: "product `P` computed from the provided param types".
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DependencyKey {
    pub(crate) product: TypeKey,
    pub(crate) provided: Vec<TypeKey>,
}

impl DependencyKey {
    pub(crate) fn new(product: TypeKey, provided: impl IntoIterator<Item = TypeKey>) -> Self {
        let mut provided: Vec<_> = provided.into_iter().collect();
        provided.sort();
        provided.dedup();
        Self { product, provided }
    }

    /// Key for a positional input, which is satisfied from the params in
    /// scope rather than from provided values.
    pub(crate) fn positional(product: TypeKey) -> Self {
        Self {
            product,
            provided: vec![],
        }
    }

    pub fn product(&self) -> TypeKey {
        self.product
    }

    pub fn provided(&self) -> &[TypeKey] {
        &self.provided
    }
}

impl fmt::Debug for DependencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.provided.is_empty() {
            write!(f, "{}", self.product)
        } else {
            let provided: ParamTypes = self.provided.iter().copied().collect();
            write!(f, "Get({}, {})", self.product, params_str(&provided))
        }
    }
}

/// A Get declared by a rule body.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum GetDecl {
    /// `Get(product, provided...)` against concrete types.
    Concrete(DependencyKey),
    /// `Get(product, member)` where the member is any type registered under
    /// the `union` marker.
    Union { product: TypeKey, union: TypeKey },
}

/// A declared entry point: "the embedding process will ask for `product`
/// given values for `params`".
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Query {
    pub(crate) product: TypeKey,
    pub(crate) params: ParamTypes,
}

impl Query {
    pub fn new<P: Product, L: ParamList>() -> Self {
        Self {
            product: TypeKey::of::<P>(),
            params: L::type_keys().into_iter().collect(),
        }
    }

    pub fn product(&self) -> TypeKey {
        self.product
    }

    pub fn params(&self) -> &ParamTypes {
        &self.params
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Query({} for {})", self.product, params_str(&self.params))
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Type-level list of the positional inputs of a rule.
///
/// Implemented for `()` and tuples of products. The rule body receives each
/// input as an `Arc`, e.g. a rule over `(Addresses, Platform)` is called with
/// `(Arc<Addresses>, Arc<Platform>)`.
pub trait Inputs: 'static {
    type Values: Send + 'static;

    fn type_keys() -> Vec<TypeKey>;

    /// Resolves type-erased input values into their concrete types.
    ///
    /// # Panics
    /// Panics if the values do not match the declared types, which would
    /// mean the compiled graph wired a rule to the wrong provider.
    fn downcast(inputs: Vec<Dynamic>) -> Self::Values;
}

impl Inputs for () {
    type Values = ();

    fn type_keys() -> Vec<TypeKey> {
        vec![]
    }

    fn downcast(_: Vec<Dynamic>) -> Self::Values {}
}

macro_rules! impl_inputs {
    ($($I:ident),*) => {
        #[allow(non_snake_case)]
        impl<$($I: Product),*> Inputs for ($($I,)*) {
            type Values = ($(Arc<$I>,)*);

            fn type_keys() -> Vec<TypeKey> {
                vec![$(TypeKey::of::<$I>(),)*]
            }

            fn downcast(inputs: Vec<Dynamic>) -> Self::Values {
                let mut iter = inputs.into_iter();

                ($({
                    let value = iter.next().expect("Missing input in dependency resolution");
                    value
                        .downcast::<$I>()
                        .unwrap_or_else(|_| panic!("Type mismatch in dependency resolution"))
                },)*)
            }
        }
    };
}

impl_inputs!(A);
impl_inputs!(A, B);
impl_inputs!(A, B, C);
impl_inputs!(A, B, C, D);
impl_inputs!(A, B, C, D, E);
impl_inputs!(A, B, C, D, E, F);
impl_inputs!(A, B, C, D, E, F, G);
impl_inputs!(A, B, C, D, E, F, G, H);

/// The type-erased body of a rule. This is where the typed closure meets the
/// scheduler, which only deals in [`Dynamic`] values.
pub(crate) trait Body: Send + Sync {
    fn call(&self, context: Context, inputs: Vec<Dynamic>) -> BoxFuture<'static, anyhow::Result<Dynamic>>;
}

struct TypedBody<P, I, F> {
    callback: F,
    _phantom: PhantomData<fn() -> (P, I)>,
}

impl<P, I, F, Fut> Body for TypedBody<P, I, F>
where
    P: Product,
    I: Inputs,
    F: Fn(Context, I::Values) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<P>> + Send + 'static,
{
    fn call(&self, context: Context, inputs: Vec<Dynamic>) -> BoxFuture<'static, anyhow::Result<Dynamic>> {
        let future = (self.callback)(context, I::downcast(inputs));

        Box::pin(async move {
            let output = future.await?;
            Ok(Arc::new(output) as Dynamic)
        })
    }
}

/// A registered rule.
#[derive(Clone)]
pub struct Rule {
    pub(crate) id: RuleId,
    pub(crate) product: TypeKey,
    pub(crate) inputs: Vec<TypeKey>,
    pub(crate) gets: Vec<GetDecl>,
    pub(crate) cacheable: bool,
    pub(crate) union_rule: bool,
    pub(crate) body: Arc<dyn Body>,
}

impl Rule {
    pub fn id(&self) -> &RuleId {
        &self.id
    }

    pub fn product(&self) -> TypeKey {
        self.product
    }

    pub fn inputs(&self) -> &[TypeKey] {
        &self.inputs
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    pub fn is_union_rule(&self) -> bool {
        self.union_rule
    }

    /// The positional input types as a set, i.e. the rule's signature.
    pub(crate) fn signature(&self) -> ParamTypes {
        self.inputs.iter().copied().collect()
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "@rule({}({}) -> {})",
            self.id.name(),
            self.inputs
                .iter()
                .map(TypeKey::short_name)
                .collect::<Vec<_>>()
                .join(", "),
            self.product
        )
    }
}

/// Starts declaring a rule producing `P` from the positional inputs `I`.
#[track_caller]
pub fn rule<P: Product, I: Inputs>(name: impl Into<ArcStr>) -> RuleBuilder<P, I> {
    RuleBuilder {
        id: RuleId::new(name, Location::caller()),
        gets: vec![],
        cacheable: true,
        union_rule: false,
        _phantom: PhantomData,
    }
}

pub struct RuleBuilder<P, I> {
    id: RuleId,
    gets: Vec<GetDecl>,
    cacheable: bool,
    union_rule: bool,
    _phantom: PhantomData<fn() -> (P, I)>,
}

impl<P: Product, I: Inputs> RuleBuilder<P, I> {
    /// Declares that the body may issue `Get::<G>::with(provided)`.
    pub fn get<G: Product, L: ParamList>(mut self) -> Self {
        let key = DependencyKey::new(TypeKey::of::<G>(), L::type_keys());
        self.gets.push(GetDecl::Concrete(key));
        self
    }

    /// Declares that the body may issue `Get::<G>::union::<M>(member)` for
    /// any member registered under the union marker `M`.
    pub fn get_union<G: Product, M: 'static>(mut self) -> Self {
        self.gets.push(GetDecl::Union {
            product: TypeKey::of::<G>(),
            union: TypeKey::of::<M>(),
        });
        self
    }

    /// Marks the rule as producing a value only valid for one session, e.g.
    /// because it reads the wall clock.
    pub fn uncacheable(mut self) -> Self {
        self.cacheable = false;
        self
    }

    /// Marks the rule as one implementation of a union-dispatched Get.
    pub fn union_rule(mut self) -> Self {
        self.union_rule = true;
        self
    }

    pub fn run<F, Fut>(self, callback: F) -> Rule
    where
        F: Fn(Context, I::Values) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<P>> + Send + 'static,
    {
        Rule {
            id: self.id,
            product: TypeKey::of::<P>(),
            inputs: I::type_keys(),
            gets: self.gets,
            cacheable: self.cacheable,
            union_rule: self.union_rule,
            body: Arc::new(TypedBody::<P, I, F> {
                callback,
                _phantom: PhantomData,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Targets;
    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    struct Addresses;

    #[test]
    fn test_rule_metadata() {
        let rule = rule::<Targets, (Addresses,)>("resolve_targets")
            .get::<Targets, (u32,)>()
            .uncacheable()
            .run(|_, _| async { Ok(Targets) });

        assert_eq!(rule.id().name(), "resolve_targets");
        assert!(rule.id().location().contains("rules.rs"));
        assert_eq!(rule.inputs(), &[TypeKey::of::<Addresses>()]);
        assert_eq!(rule.product(), TypeKey::of::<Targets>());
        assert!(!rule.is_cacheable());
        assert_eq!(rule.gets.len(), 1);
        assert_eq!(format!("{rule:?}"), "@rule(resolve_targets(Addresses) -> Targets)");
    }

    #[test]
    fn test_rule_ids_differ_by_location() {
        let a = rule::<Targets, ()>("same").run(|_, _| async { Ok(Targets) });
        let b = rule::<Targets, ()>("same").run(|_, _| async { Ok(Targets) });
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), &a.clone().id);
    }

    #[test]
    fn test_dependency_key_sorts_provided() {
        let a = DependencyKey::new(TypeKey::of::<Targets>(), [TypeKey::of::<u8>(), TypeKey::of::<u16>()]);
        let b = DependencyKey::new(TypeKey::of::<Targets>(), [TypeKey::of::<u16>(), TypeKey::of::<u8>()]);
        assert_eq!(a, b);
    }
}
