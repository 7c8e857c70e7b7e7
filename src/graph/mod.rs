//! The compiled, immutable rule graph.

mod builder;

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::core::TypeKey;
use crate::error::{GraphError, RequestError};
use crate::params::{ParamTypes, params_str};
use crate::registry::{FrozenRegistry, UnionMembership};
use crate::rules::{DependencyKey, Query, Rule, RuleId};

pub(crate) use builder::Builder;

/// A vertex of the compiled graph.
#[derive(Clone)]
pub(crate) enum Node {
    /// The value is supplied by a param in scope.
    Param(TypeKey),
    /// A rule monomorphized for one context.
    Rule(RuleEntry),
}

#[derive(Clone)]
pub(crate) struct RuleEntry {
    pub(crate) rule: Rule,
    /// The params this entry, and everything below it, actually consumes.
    pub(crate) used: ParamTypes,
    /// Sources of the positional inputs, in declaration order.
    pub(crate) inputs: Vec<NodeIndex>,
    /// Sources of every Get the rule body may issue.
    pub(crate) gets: HashMap<DependencyKey, NodeIndex>,
}

/// Static mapping from (rule, context) to resolved dependency edges.
///
/// Built once by [`Scheduler::new`](crate::Scheduler::new) and shared
/// read-only by every session.
pub struct RuleGraph {
    graph: DiGraph<Node, DependencyKey>,
    roots: Vec<(Query, NodeIndex)>,
    unions: Arc<UnionMembership>,
}

impl RuleGraph {
    pub(crate) fn compile(registry: &FrozenRegistry) -> Result<Self, GraphError> {
        Builder::new(registry).build()
    }

    pub(crate) fn node(&self, index: NodeIndex) -> &Node {
        &self.graph[index]
    }

    pub(crate) fn unions(&self) -> &Arc<UnionMembership> {
        &self.unions
    }

    /// Finds the compiled entry answering a request for `product` given
    /// values for `params`.
    ///
    /// A query declared with exactly these params wins. Otherwise the request
    /// matches when exactly one query for `product` declares a subset of them.
    pub(crate) fn find_root(&self, product: TypeKey, params: &ParamTypes) -> Result<NodeIndex, RequestError> {
        let exact = self
            .roots
            .iter()
            .find(|(query, _)| query.product == product && &query.params == params);

        if let Some((_, index)) = exact {
            return Ok(*index);
        }

        let subset: Vec<_> = self
            .roots
            .iter()
            .filter(|(query, _)| query.product == product && query.params.is_subset(params))
            .collect();

        if let [(_, index)] = subset.as_slice() {
            return Ok(*index);
        }

        let hint = if subset.is_empty() {
            let declared: Vec<_> = self
                .roots
                .iter()
                .filter(|(query, _)| query.product == product)
                .map(|(query, _)| format!("\n  {query}"))
                .collect();

            if declared.is_empty() {
                format!("\nNo query for {product} was declared.")
            } else {
                format!("\nDeclared queries for {product}:{}", declared.concat())
            }
        } else {
            let candidates: Vec<_> = subset.iter().map(|(query, _)| format!("\n  {query}")).collect();
            format!("\nThe params match more than one query:{}", candidates.concat())
        };

        Err(RequestError::NoMatchingQuery {
            product: product.to_string(),
            params: params_str(params),
            hint,
        })
    }

    /// Declared queries, in registration order.
    pub fn queries(&self) -> impl Iterator<Item = &Query> {
        self.roots.iter().map(|(query, _)| query)
    }

    /// Every compiled rule entry, with the params it is keyed on.
    pub fn entries(&self) -> impl Iterator<Item = (&RuleId, &ParamTypes)> {
        self.graph.node_weights().filter_map(|node| match node {
            Node::Rule(entry) => Some((&entry.rule.id, &entry.used)),
            Node::Param(_) => None,
        })
    }

    /// Number of compiled rule entries.
    pub fn len(&self) -> usize {
        self.entries().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Name shown for a node in diagnostics.
    pub(crate) fn label(&self, index: NodeIndex) -> String {
        match &self.graph[index] {
            Node::Param(key) => key.to_string(),
            Node::Rule(entry) => entry.rule.id.name().to_string(),
        }
    }

    pub(crate) fn node_indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    pub(crate) fn edges(&self) -> impl Iterator<Item = (NodeIndex, NodeIndex, &DependencyKey)> {
        self.graph
            .edge_references()
            .map(|edge| (edge.source(), edge.target(), edge.weight()))
    }
}

fn escape(text: &str) -> String {
    text.replace('"', "#quot;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Renders the graph as a Mermaid flowchart, dependencies pointing at the
/// entries consuming them.
impl Display for RuleGraph {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            match &self.graph[index] {
                Node::Param(key) => {
                    writeln!(f, "    {}([\"{}\"])", index.index(), escape(&key.to_string()))?;
                }
                Node::Rule(entry) => {
                    writeln!(
                        f,
                        "    {}[\"{}\\n({})\"]",
                        index.index(),
                        escape(entry.rule.id.name()),
                        escape(&params_str(&entry.used))
                    )?;
                }
            }
        }

        for (i, (query, index)) in self.roots.iter().enumerate() {
            writeln!(f, "    Q{i}{{{{\"{}\"}}}}", escape(&query.to_string()))?;
            writeln!(f, "    {} --> Q{i}", index.index())?;
        }

        for (source, target, key) in self.edges() {
            writeln!(
                f,
                "    {} -- \"{}\" --> {}",
                target.index(),
                escape(&format!("{key:?}")),
                source.index()
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RuleRegistry;
    use crate::rules::rule;

    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    struct X;
    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    struct Y;
    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    struct Z;
    struct A;
    struct B;

    fn compile(registry: RuleRegistry) -> Result<RuleGraph, GraphError> {
        RuleGraph::compile(&registry.freeze())
    }

    #[test]
    fn test_simple_chain() {
        let registry = RuleRegistry::new();
        registry
            .register_rules([
                rule::<Y, (X,)>("y_from_x").run(|_, _| async { Ok(Y) }),
                rule::<A, (Y,)>("a_from_y").run(|_, _| async { Ok(A) }),
            ])
            .unwrap();
        registry.register_query(Query::new::<A, (X,)>()).unwrap();

        let graph = compile(registry).unwrap();
        assert_eq!(graph.len(), 2);

        let x: ParamTypes = [TypeKey::of::<X>()].into_iter().collect();
        assert!(graph.find_root(TypeKey::of::<A>(), &x).is_ok());
    }

    #[test]
    fn test_ambiguity_is_reported_with_both_candidates() {
        let registry = RuleRegistry::new();
        registry
            .register_rules([
                rule::<A, (X,)>("a_from_x").run(|_, _| async { Ok(A) }),
                rule::<A, (Y,)>("a_from_y").run(|_, _| async { Ok(A) }),
                rule::<Y, (X,)>("y_from_x").run(|_, _| async { Ok(Y) }),
            ])
            .unwrap();
        registry.register_query(Query::new::<A, (X,)>()).unwrap();

        match compile(registry) {
            Err(GraphError::Ambiguous { candidates, .. }) => {
                assert_eq!(candidates.len(), 2);
                assert!(candidates.iter().any(|c| c.contains("a_from_x")));
                assert!(candidates.iter().any(|c| c.contains("a_from_y")));
            }
            Err(err) => panic!("unexpected error: {err}"),
            Ok(_) => panic!("ambiguous graph compiled"),
        }
    }

    #[test]
    fn test_param_in_scope_shadows_rules() {
        let registry = RuleRegistry::new();
        registry
            .register_rules([
                rule::<Y, (X,)>("y_from_x").run(|_, _| async { Ok(Y) }),
                rule::<A, (Y,)>("a_from_y").run(|_, _| async { Ok(A) }),
            ])
            .unwrap();
        registry.register_query(Query::new::<A, (X, Y)>()).unwrap();

        let graph = compile(registry).unwrap();
        let names: Vec<_> = graph.entries().map(|(id, _)| id.name().to_string()).collect();
        assert_eq!(names, vec!["a_from_y"]);
    }

    #[test]
    fn test_cycle_names_participants() {
        let registry = RuleRegistry::new();
        registry
            .register_rules([
                rule::<A, (X,)>("a").get::<B, ()>().run(|_, _| async { Ok(A) }),
                rule::<B, (X,)>("b").get::<A, ()>().run(|_, _| async { Ok(B) }),
            ])
            .unwrap();
        registry.register_query(Query::new::<A, (X,)>()).unwrap();

        match compile(registry) {
            Err(GraphError::Cycle { path }) => {
                assert_eq!(path.len(), 3);
                assert!(path[0].starts_with("a "));
                assert!(path[1].starts_with("b "));
                assert!(path[2].starts_with("a "));
            }
            Err(err) => panic!("unexpected error: {err}"),
            Ok(_) => panic!("cyclic graph compiled"),
        }
    }

    #[test]
    fn test_missing_provider_explains_itself() {
        let registry = RuleRegistry::new();
        registry
            .register_rules([rule::<A, (Y,)>("a_from_y").run(|_, _| async { Ok(A) })])
            .unwrap();
        registry.register_query(Query::new::<A, (X,)>()).unwrap();

        match compile(registry) {
            Err(err @ GraphError::NoProvider { .. }) => {
                let message = err.to_string();
                assert!(message.contains("a_from_y"));
                assert!(message.contains("no source for input Y"));
            }
            Err(err) => panic!("unexpected error: {err}"),
            Ok(_) => panic!("unsatisfiable graph compiled"),
        }
    }

    #[test]
    fn test_no_queries() {
        assert!(matches!(compile(RuleRegistry::new()), Err(GraphError::NoQueries)));
    }

    #[test]
    fn test_entries_are_keyed_on_used_params_only() {
        let registry = RuleRegistry::new();
        registry
            .register_rules([
                rule::<Y, (X,)>("y_from_x").run(|_, _| async { Ok(Y) }),
                rule::<A, (Y,)>("a").run(|_, _| async { Ok(A) }),
                rule::<B, (Y, Z)>("b").run(|_, _| async { Ok(B) }),
            ])
            .unwrap();
        registry.register_query(Query::new::<A, (X,)>()).unwrap();
        registry.register_query(Query::new::<B, (X, Z)>()).unwrap();

        let graph = compile(registry).unwrap();

        // `y_from_x` is reached with {X} and {X, Z} in scope but only uses X
        let y_entries: Vec<_> = graph.entries().filter(|(id, _)| id.name() == "y_from_x").collect();
        assert_eq!(y_entries.len(), 1);
        assert_eq!(y_entries[0].1.len(), 1);
    }

    #[test]
    fn test_union_gets_skip_incompatible_members() {
        struct Marker;
        #[derive(Clone, Debug, PartialEq, Eq, Hash)]
        struct Good;
        #[derive(Clone, Debug, PartialEq, Eq, Hash)]
        struct Orphan;
        struct Report;

        let registry = RuleRegistry::new();
        registry.register_union::<Marker, Good>().unwrap();
        registry.register_union::<Marker, Orphan>().unwrap();
        registry
            .register_rules([
                rule::<B, (Good,)>("b_from_good").union_rule().run(|_, _| async { Ok(B) }),
                rule::<Report, (X,)>("report")
                    .get_union::<B, Marker>()
                    .run(|_, _| async { Ok(Report) }),
            ])
            .unwrap();
        registry.register_query(Query::new::<Report, (X,)>()).unwrap();

        let graph = compile(registry).unwrap();
        let report = graph
            .node_indices()
            .find_map(|index| match graph.node(index) {
                Node::Rule(entry) if entry.rule.id.name() == "report" => Some(entry.clone()),
                _ => None,
            })
            .unwrap();

        assert_eq!(report.gets.len(), 1);
        assert!(report.gets.contains_key(&DependencyKey::new(TypeKey::of::<B>(), [TypeKey::of::<Good>()])));
    }

    #[test]
    fn test_find_root_by_subset() {
        let registry = RuleRegistry::new();
        registry
            .register_rules([rule::<A, (X,)>("a").run(|_, _| async { Ok(A) })])
            .unwrap();
        registry.register_query(Query::new::<A, (X,)>()).unwrap();
        let graph = compile(registry).unwrap();

        let superset: ParamTypes = [TypeKey::of::<X>(), TypeKey::of::<Z>()].into_iter().collect();
        assert!(graph.find_root(TypeKey::of::<A>(), &superset).is_ok());

        let unrelated: ParamTypes = [TypeKey::of::<Z>()].into_iter().collect();
        let err = graph.find_root(TypeKey::of::<A>(), &unrelated).unwrap_err();
        assert!(err.to_string().contains("Query(A for X)"));
    }

    #[test]
    fn test_mermaid_rendering() {
        let registry = RuleRegistry::new();
        registry
            .register_rules([rule::<A, (X,)>("a_from_x").run(|_, _| async { Ok(A) })])
            .unwrap();
        registry.register_query(Query::new::<A, (X,)>()).unwrap();
        let graph = compile(registry).unwrap();

        let rendered = graph.to_string();
        assert!(rendered.starts_with("graph LR"));
        assert!(rendered.contains("a_from_x"));
        assert!(rendered.contains("Query(A for X)"));
    }
}
