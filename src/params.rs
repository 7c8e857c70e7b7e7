//! Type-erased parameter values.
//!
//! Params are the values a memoized node is keyed on. The graph only knows
//! about them through [`TypeKey`]s, while the runtime stores them as
//! [`Value`]s: an `Arc<dyn Any>` paired with a static table of functions that
//! know how to hash, compare and print the concrete type.

use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::core::{Blake3Hasher, Dynamic, Hash32, TypeKey};

/// Anything that can be used as a rule input or memoization key.
///
/// Implemented automatically for every `Clone + Debug + Hash + Eq` type which
/// is `Send + Sync + 'static`.
pub trait Param: Any + Clone + fmt::Debug + Hash + Eq + Send + Sync {}

impl<T> Param for T where T: Any + Clone + fmt::Debug + Hash + Eq + Send + Sync {}

/// Anything a rule can produce.
pub trait Product: Any + Send + Sync {}

impl<T> Product for T where T: Any + Send + Sync {}

struct ParamVTable {
    key: fn() -> TypeKey,
    eq: fn(&dyn Any, &dyn Any) -> bool,
    hash: fn(&dyn Any, &mut dyn Hasher),
    debug: fn(&dyn Any, &mut fmt::Formatter<'_>) -> fmt::Result,
}

trait VTableFor {
    const VTABLE: ParamVTable;
}

impl<T: Param> VTableFor for T {
    const VTABLE: ParamVTable = ParamVTable {
        key: TypeKey::of::<T>,
        eq: |a, b| match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        hash: |value, mut state| {
            if let Some(value) = value.downcast_ref::<T>() {
                value.hash(&mut state);
            }
        },
        debug: |value, f| match value.downcast_ref::<T>() {
            Some(value) => fmt::Debug::fmt(value, f),
            None => f.write_str("<?>"),
        },
    };
}

/// A single type-erased param value.
#[derive(Clone)]
pub struct Value {
    inner: Dynamic,
    vtable: &'static ParamVTable,
}

impl Value {
    pub fn new<T: Param>(value: T) -> Self {
        Self {
            inner: Arc::new(value),
            vtable: &<T as VTableFor>::VTABLE,
        }
    }

    pub fn type_key(&self) -> TypeKey {
        (self.vtable.key)()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    pub(crate) fn dynamic(&self) -> Dynamic {
        self.inner.clone()
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.type_key() == other.type_key() && (self.vtable.eq)(&*self.inner, &*other.inner)
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_key().hash(state);
        (self.vtable.hash)(&*self.inner, state);
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (self.vtable.debug)(&*self.inner, f)
    }
}

/// The set of param types a node or query is keyed on.
pub type ParamTypes = BTreeSet<TypeKey>;

pub(crate) fn params_str(params: &ParamTypes) -> String {
    params
        .iter()
        .map(|p| p.short_name())
        .collect::<Vec<_>>()
        .join(", ")
}

/// An ordered collection of param values, holding at most one value per type.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Params(Vec<Value>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value, replacing any existing value of the same type.
    pub fn insert(&mut self, value: Value) {
        let key = value.type_key();
        match self.0.binary_search_by(|v| v.type_key().cmp(&key)) {
            Ok(index) => self.0[index] = value,
            Err(index) => self.0.insert(index, value),
        }
    }

    pub fn with(mut self, value: impl Param) -> Self {
        self.insert(Value::new(value));
        self
    }

    pub fn get(&self, key: &TypeKey) -> Option<&Value> {
        self.0
            .binary_search_by(|v| v.type_key().cmp(key))
            .ok()
            .map(|index| &self.0[index])
    }

    pub fn type_keys(&self) -> ParamTypes {
        self.0.iter().map(Value::type_key).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.0.iter()
    }

    /// Keeps only the values whose type is part of `types`.
    pub(crate) fn restrict(&self, types: &ParamTypes) -> Params {
        Params(
            self.0
                .iter()
                .filter(|v| types.contains(&v.type_key()))
                .cloned()
                .collect(),
        )
    }

    /// Returns a copy of these params extended with `other`, where values
    /// from `other` take precedence.
    pub(crate) fn extend_with(&self, other: &Params) -> Params {
        let mut out = self.clone();
        for value in other.iter() {
            out.insert(value.clone());
        }
        out
    }

    /// Content fingerprint of the values, used in logs and diagnostics.
    pub fn fingerprint(&self) -> Hash32 {
        let mut hasher = Blake3Hasher::default();
        self.hash(&mut hasher);
        hasher.into()
    }
}

impl fmt::Debug for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Params(")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{value:?}")?;
        }
        write!(f, ")")
    }
}

impl FromIterator<Value> for Params {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        let mut params = Params::new();
        for value in iter {
            params.insert(value);
        }
        params
    }
}

/// Conversion of plain Rust values and tuples into [`Params`].
///
/// Implemented for `()`, [`Params`] and tuples of params, so that requests
/// can be written as `session.request::<P>((a, b))` or
/// `session.request::<P>((a,))`.
pub trait IntoParams {
    fn into_params(self) -> Params;
}

impl IntoParams for Params {
    fn into_params(self) -> Params {
        self
    }
}

impl IntoParams for () {
    fn into_params(self) -> Params {
        Params::new()
    }
}

macro_rules! impl_into_params {
    ($($P:ident),*) => {
        #[allow(non_snake_case)]
        impl<$($P: Param),*> IntoParams for ($($P,)*) {
            fn into_params(self) -> Params {
                let ($($P,)*) = self;
                let mut params = Params::new();
                $(params.insert(Value::new($P));)*
                params
            }
        }
    };
}

impl_into_params!(A);
impl_into_params!(A, B);
impl_into_params!(A, B, C);
impl_into_params!(A, B, C, D);
impl_into_params!(A, B, C, D, E);
impl_into_params!(A, B, C, D, E, F);

/// Type-level list of param types, used when declaring queries and Gets.
pub trait ParamList {
    fn type_keys() -> Vec<TypeKey>;
}

impl ParamList for () {
    fn type_keys() -> Vec<TypeKey> {
        vec![]
    }
}

macro_rules! impl_param_list {
    ($($P:ident),*) => {
        impl<$($P: Param),*> ParamList for ($($P,)*) {
            fn type_keys() -> Vec<TypeKey> {
                vec![$(TypeKey::of::<$P>(),)*]
            }
        }
    };
}

impl_param_list!(A);
impl_param_list!(A, B);
impl_param_list!(A, B, C);
impl_param_list!(A, B, C, D);
impl_param_list!(A, B, C, D, E);
impl_param_list!(A, B, C, D, E, F);
