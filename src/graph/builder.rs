//! Monomorphization of the registered rules into a [`RuleGraph`].
//!
//! Resolution starts at every declared query and works top-down. For each
//! `(product, params in scope)` pair every rule producing `product` is tried;
//! a rule is viable when all of its positional inputs and declared Gets can be
//! satisfied from the params in scope, either directly or through other rules.
//! Exactly one viable rule is required, anything else is a compile error.
//!
//! Every compiled entry records the params it actually consumes, and entries
//! are interned on that minimal set, so the same rule reached from different
//! contexts shares one entry whenever it resolves identically.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use petgraph::graph::{DiGraph, NodeIndex};

use crate::core::TypeKey;
use crate::error::GraphError;
use crate::graph::{Node, RuleEntry, RuleGraph};
use crate::params::{ParamTypes, params_str};
use crate::registry::FrozenRegistry;
use crate::rules::{DependencyKey, GetDecl, RuleId};

enum BuildError {
    /// The product cannot be computed in this context. Carries the reasons so
    /// that a failing query can explain itself.
    Unsatisfiable(Vec<String>),
    /// The rule set itself is broken, compilation must stop.
    Fatal(GraphError),
}

type MemoKey = (usize, ParamTypes);
type InternKey = (RuleId, ParamTypes, Vec<NodeIndex>, Vec<(DependencyKey, NodeIndex)>);

pub(crate) struct Builder<'a> {
    registry: &'a FrozenRegistry,
    by_product: HashMap<TypeKey, Vec<usize>>,
    graph: DiGraph<Node, DependencyKey>,
    params: HashMap<TypeKey, NodeIndex>,
    interned: HashMap<InternKey, NodeIndex>,
    memo: HashMap<MemoKey, Result<NodeIndex, Vec<String>>>,
    path: Vec<MemoKey>,
}

impl<'a> Builder<'a> {
    pub(crate) fn new(registry: &'a FrozenRegistry) -> Self {
        let mut by_product: HashMap<TypeKey, Vec<usize>> = HashMap::new();
        for (index, rule) in registry.rules.iter().enumerate() {
            by_product.entry(rule.product).or_default().push(index);
        }

        Self {
            registry,
            by_product,
            graph: DiGraph::new(),
            params: HashMap::new(),
            interned: HashMap::new(),
            memo: HashMap::new(),
            path: Vec::new(),
        }
    }

    pub(crate) fn build(mut self) -> Result<RuleGraph, GraphError> {
        if self.registry.queries.is_empty() {
            return Err(GraphError::NoQueries);
        }

        let mut roots = Vec::with_capacity(self.registry.queries.len());

        for query in &self.registry.queries {
            match self.resolve(query.product, &query.params) {
                Ok(index) => roots.push((query.clone(), index)),
                Err(BuildError::Unsatisfiable(reasons)) => {
                    return Err(GraphError::NoProvider {
                        product: query.product.to_string(),
                        params: params_str(&query.params),
                        reasons,
                    });
                }
                Err(BuildError::Fatal(err)) => return Err(err),
            }
        }

        tracing::debug!(
            "compiled rule graph with {} nodes for {} queries",
            self.graph.node_count(),
            roots.len()
        );

        Ok(RuleGraph {
            graph: self.graph,
            roots,
            unions: Arc::clone(&self.registry.unions),
        })
    }

    /// Finds the single source of `product` given the params in `available`.
    fn resolve(&mut self, product: TypeKey, available: &ParamTypes) -> Result<NodeIndex, BuildError> {
        // A param in scope always satisfies its own type.
        if available.contains(&product) {
            return Ok(self.param_node(product));
        }

        let candidates = self.by_product.get(&product).cloned().unwrap_or_default();
        if candidates.is_empty() {
            return Err(BuildError::Unsatisfiable(vec![format!(
                "no rule produces {product} and it is not among the params"
            )]));
        }

        let mut viable = Vec::new();
        let mut reasons = Vec::new();

        for index in candidates {
            match self.entry_for(index, available) {
                Ok(node) => viable.push((index, node)),
                Err(BuildError::Unsatisfiable(why)) => {
                    let rule = &self.registry.rules[index];
                    reasons.push(format!("{rule:?} is not satisfiable: {}", why.join("; ")));
                }
                Err(fatal) => return Err(fatal),
            }
        }

        match viable.as_slice() {
            [] => Err(BuildError::Unsatisfiable(reasons)),
            [(_, node)] => Ok(*node),
            _ => Err(BuildError::Fatal(GraphError::Ambiguous {
                product: product.to_string(),
                params: params_str(available),
                candidates: viable
                    .iter()
                    .map(|(index, _)| format!("{:?}", self.registry.rules[*index]))
                    .collect(),
            })),
        }
    }

    fn entry_for(&mut self, index: usize, available: &ParamTypes) -> Result<NodeIndex, BuildError> {
        let key = (index, available.clone());

        if let Some(memo) = self.memo.get(&key) {
            return memo.clone().map_err(BuildError::Unsatisfiable);
        }

        if let Some(start) = self.path.iter().position(|item| item == &key) {
            let path = self.path[start..]
                .iter()
                .chain(std::iter::once(&key))
                .map(|(index, available)| {
                    let rule = &self.registry.rules[*index];
                    format!("{:?} for ({})", rule.id, params_str(available))
                })
                .collect();

            return Err(BuildError::Fatal(GraphError::Cycle { path }));
        }

        self.path.push(key.clone());
        let result = self.build_entry(index, available);
        self.path.pop();

        match &result {
            Ok(node) => {
                self.memo.insert(key, Ok(*node));
            }
            Err(BuildError::Unsatisfiable(reasons)) => {
                self.memo.insert(key, Err(reasons.clone()));
            }
            Err(BuildError::Fatal(_)) => {}
        }

        result
    }

    fn build_entry(&mut self, index: usize, available: &ParamTypes) -> Result<NodeIndex, BuildError> {
        let rule = self.registry.rules[index].clone();

        let mut used = ParamTypes::new();
        let mut inputs = Vec::with_capacity(rule.inputs.len());
        let mut gets = Vec::new();

        for input in &rule.inputs {
            let node = self.resolve(*input, available).map_err(|err| match err {
                BuildError::Unsatisfiable(why) => {
                    BuildError::Unsatisfiable(vec![format!("no source for input {input} ({})", why.join("; "))])
                }
                fatal => fatal,
            })?;

            used.extend(self.used_by(node));
            inputs.push(node);
        }

        for decl in &rule.gets {
            match decl {
                GetDecl::Concrete(key) => {
                    let scope = extend(available, &key.provided);
                    let node = self.resolve(key.product, &scope).map_err(|err| match err {
                        BuildError::Unsatisfiable(why) => {
                            BuildError::Unsatisfiable(vec![format!("no source for {key:?} ({})", why.join("; "))])
                        }
                        fatal => fatal,
                    })?;

                    let mut consumed = self.used_by(node);
                    for provided in &key.provided {
                        consumed.remove(provided);
                    }
                    used.extend(consumed);
                    gets.push((key.clone(), node));
                }
                GetDecl::Union { product, union } => {
                    let members = self.registry.unions.members_of(*union).to_vec();

                    for member in members {
                        let key = DependencyKey::new(*product, [member]);
                        let scope = extend(available, &[member]);

                        match self.resolve(*product, &scope) {
                            Ok(node) => {
                                let mut consumed = self.used_by(node);
                                consumed.remove(&member);
                                used.extend(consumed);
                                gets.push((key, node));
                            }
                            Err(BuildError::Unsatisfiable(_)) => {
                                tracing::trace!("{:?} skips {member} of union {union}", rule.id);
                            }
                            Err(fatal) => return Err(fatal),
                        }
                    }
                }
            }
        }

        gets.sort_by(|a, b| a.0.cmp(&b.0));
        gets.dedup_by(|a, b| a.0 == b.0);

        Ok(self.intern(RuleEntry {
            rule,
            used,
            inputs,
            gets: gets.into_iter().collect(),
        }))
    }

    fn intern(&mut self, entry: RuleEntry) -> NodeIndex {
        let mut gets: Vec<_> = entry.gets.iter().map(|(k, v)| (k.clone(), *v)).collect();
        gets.sort_by(|a, b| a.0.cmp(&b.0));

        let key = (entry.rule.id.clone(), entry.used.clone(), entry.inputs.clone(), gets.clone());
        if let Some(node) = self.interned.get(&key) {
            return *node;
        }

        let inputs = entry.inputs.clone();
        let input_types = entry.rule.inputs.clone();
        let node = self.graph.add_node(Node::Rule(entry));

        for (input, ty) in inputs.into_iter().zip(input_types) {
            self.graph.add_edge(node, input, DependencyKey::positional(ty));
        }
        for (key, target) in gets {
            self.graph.add_edge(node, target, key);
        }

        self.interned.insert(key, node);
        node
    }

    fn param_node(&mut self, key: TypeKey) -> NodeIndex {
        if let Some(node) = self.params.get(&key) {
            return *node;
        }

        let node = self.graph.add_node(Node::Param(key));
        self.params.insert(key, node);
        node
    }

    fn used_by(&self, node: NodeIndex) -> ParamTypes {
        match &self.graph[node] {
            Node::Param(key) => BTreeSet::from([*key]),
            Node::Rule(entry) => entry.used.clone(),
        }
    }
}

fn extend(available: &ParamTypes, provided: &[TypeKey]) -> ParamTypes {
    let mut scope = available.clone();
    scope.extend(provided.iter().copied());
    scope
}
