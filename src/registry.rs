use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::core::TypeKey;
use crate::error::RegistryError;
use crate::params::{Param, params_str};
use crate::rules::{Query, Rule, RuleId, rule};

/// Mapping from a union marker type to the member types registered against
/// it, in registration order.
#[derive(Clone, Debug, Default)]
pub struct UnionMembership {
    unions: HashMap<TypeKey, Vec<TypeKey>>,
}

impl UnionMembership {
    /// Members of the union marker `M`, in registration order.
    pub fn members<M: 'static>(&self) -> &[TypeKey] {
        self.members_of(TypeKey::of::<M>())
    }

    pub fn members_of(&self, union: TypeKey) -> &[TypeKey] {
        self.unions.get(&union).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn is_member(&self, union: TypeKey, member: TypeKey) -> bool {
        self.members_of(union).contains(&member)
    }

    pub fn is_union(&self, key: TypeKey) -> bool {
        self.unions.contains_key(&key)
    }

    fn insert(&mut self, union: TypeKey, member: TypeKey) -> Result<(), RegistryError> {
        let members = self.unions.entry(union).or_default();

        if members.contains(&member) {
            return Err(RegistryError::DuplicateUnionMember {
                union: union.to_string(),
                member: member.to_string(),
            });
        }

        members.push(member);
        Ok(())
    }
}

#[derive(Default)]
struct RegistryState {
    rules: Vec<Rule>,
    ids: HashSet<RuleId>,
    signatures: HashMap<(TypeKey, Vec<TypeKey>), RuleId>,
    unions: UnionMembership,
    queries: Vec<Query>,
}

/// Accumulates rules, union members and queries during startup.
///
/// The registry is a cheap handle, backends can be handed a clone and
/// register into it. Once a [`Scheduler`](crate::Scheduler) has been built
/// from it, the registry is frozen and every further registration fails with
/// [`RegistryError::LateRegistration`].
#[derive(Clone, Default)]
pub struct RuleRegistry {
    state: Arc<RwLock<RegistryState>>,
    frozen: Arc<AtomicBool>,
}

/// Immutable snapshot of a registry, taken at the freeze point.
pub(crate) struct FrozenRegistry {
    pub(crate) rules: Vec<Rule>,
    pub(crate) unions: Arc<UnionMembership>,
    pub(crate) queries: Vec<Query>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a batch of rules.
    ///
    /// Registering a rule that is already present is a no-op. Two distinct
    /// rules producing the same product from the exact same input types are
    /// rejected, unless either of them is a union rule.
    pub fn register_rules(&self, rules: impl IntoIterator<Item = Rule>) -> Result<(), RegistryError> {
        let mut state = self.state.write().unwrap();

        for rule in rules {
            if self.frozen.load(Ordering::Acquire) {
                return Err(RegistryError::LateRegistration(format!("{rule:?}")));
            }

            if state.ids.contains(&rule.id) {
                continue;
            }

            if !rule.union_rule {
                let mut inputs = rule.inputs.clone();
                inputs.sort();

                let signature = (rule.product, inputs);
                if let Some(first) = state.signatures.get(&signature) {
                    return Err(RegistryError::DuplicateRule {
                        product: rule.product.to_string(),
                        params: params_str(&rule.signature()),
                        first: format!("{first:?}"),
                        second: format!("{:?}", rule.id),
                    });
                }
                state.signatures.insert(signature, rule.id.clone());
            }

            tracing::trace!("registered {rule:?}");
            state.ids.insert(rule.id.clone());
            state.rules.push(rule);
        }

        Ok(())
    }

    /// Registers `I` as a member of the union marker `M`.
    pub fn register_union<M: 'static, I: Param>(&self) -> Result<(), RegistryError> {
        let union = TypeKey::of::<M>();
        let member = TypeKey::of::<I>();

        let mut state = self.state.write().unwrap();
        if self.frozen.load(Ordering::Acquire) {
            return Err(RegistryError::LateRegistration(format!("UnionRule({union}, {member})")));
        }

        state.unions.insert(union, member)
    }

    /// Declares a root entry point the graph has to be able to answer.
    pub fn register_query(&self, query: Query) -> Result<(), RegistryError> {
        let mut state = self.state.write().unwrap();
        if self.frozen.load(Ordering::Acquire) {
            return Err(RegistryError::LateRegistration(format!("{query:?}")));
        }

        if !state.queries.contains(&query) {
            state.queries.push(query);
        }

        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Freezes the registry and takes a snapshot of its contents, adding the
    /// builtin [`UnionMembership`] rule.
    pub(crate) fn freeze(&self) -> FrozenRegistry {
        let state = self.state.write().unwrap();
        self.frozen.store(true, Ordering::Release);

        let unions = Arc::new(state.unions.clone());
        let mut rules = state.rules.clone();
        rules.push(union_membership_rule());

        FrozenRegistry {
            rules,
            unions,
            queries: state.queries.clone(),
        }
    }
}

fn union_membership_rule() -> Rule {
    rule::<UnionMembership, ()>("union_membership")
        .run(|ctx, ()| async move { Ok(UnionMembership::clone(ctx.union_membership())) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    struct Addresses;
    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    struct Platform;
    struct Targets;

    struct LintMarker;
    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    struct Flake8;
    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    struct Black;

    fn targets_rule() -> Rule {
        rule::<Targets, (Addresses, Platform)>("targets").run(|_, _| async { Ok(Targets) })
    }

    #[test]
    fn test_duplicate_signature_is_rejected() {
        let registry = RuleRegistry::new();
        registry.register_rules([targets_rule()]).unwrap();

        let other = rule::<Targets, (Platform, Addresses)>("other_targets").run(|_, _| async { Ok(Targets) });
        let err = registry.register_rules([other]).unwrap_err();

        match err {
            RegistryError::DuplicateRule { first, second, .. } => {
                assert!(first.starts_with("targets"));
                assert!(second.starts_with("other_targets"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_registering_same_rule_twice_is_idempotent() {
        let registry = RuleRegistry::new();
        let rule = targets_rule();
        registry.register_rules([rule.clone()]).unwrap();
        registry.register_rules([rule]).unwrap();

        // the builtin union membership rule is always added
        assert_eq!(registry.freeze().rules.len(), 2);
    }

    #[test]
    fn test_union_rules_may_share_a_signature() {
        let registry = RuleRegistry::new();
        let a = rule::<Targets, (Addresses,)>("a").union_rule().run(|_, _| async { Ok(Targets) });
        let b = rule::<Targets, (Addresses,)>("b").union_rule().run(|_, _| async { Ok(Targets) });
        registry.register_rules([a, b]).unwrap();
    }

    #[test]
    fn test_union_members_keep_registration_order() {
        let registry = RuleRegistry::new();
        registry.register_union::<LintMarker, Flake8>().unwrap();
        registry.register_union::<LintMarker, Black>().unwrap();

        let frozen = registry.freeze();
        assert_eq!(
            frozen.unions.members::<LintMarker>(),
            &[TypeKey::of::<Flake8>(), TypeKey::of::<Black>()]
        );
        assert!(frozen.unions.members::<Flake8>().is_empty());

        let err = RuleRegistry::new();
        err.register_union::<LintMarker, Black>().unwrap();
        assert!(matches!(
            err.register_union::<LintMarker, Black>(),
            Err(RegistryError::DuplicateUnionMember { .. })
        ));
    }

    #[test]
    fn test_registration_after_freeze_fails() {
        let registry = RuleRegistry::new();
        let _ = registry.freeze();

        assert!(registry.is_frozen());
        assert!(matches!(
            registry.register_rules([targets_rule()]),
            Err(RegistryError::LateRegistration(_))
        ));
        assert!(matches!(
            registry.register_union::<LintMarker, Flake8>(),
            Err(RegistryError::LateRegistration(_))
        ));
        assert!(matches!(
            registry.register_query(Query::new::<Targets, (Addresses,)>()),
            Err(RegistryError::LateRegistration(_))
        ));
    }
}
