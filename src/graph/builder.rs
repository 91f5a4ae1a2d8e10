//! Dependency graph construction and cycle detection.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::debug;

use crate::error::GraphError;
use crate::model::{ResourceId, ResourceNode};

/// Traversal marking used by the cycle detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// A validated, acyclic graph of desired resources.
///
/// An edge `A -> B` means `B` depends on `A`: `A` must be applied first.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: BTreeMap<ResourceId, ResourceNode>,
    upstream: BTreeMap<ResourceId, BTreeSet<ResourceId>>,
    downstream: BTreeMap<ResourceId, BTreeSet<ResourceId>>,
    order: Vec<ResourceId>,
}

impl DependencyGraph {
    /// Builds the graph from a set of nodes.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateResource` for a repeated id, `UnknownReference` when a
    /// reference or explicit dependency names an undeclared resource, and
    /// `CycleDetected` with the full cycle path when the graph is not acyclic.
    pub fn build(nodes: impl IntoIterator<Item = ResourceNode>) -> Result<Self, GraphError> {
        let mut by_id = BTreeMap::new();
        for node in nodes {
            if by_id.contains_key(&node.id) {
                return Err(GraphError::DuplicateResource(node.id));
            }
            by_id.insert(node.id.clone(), node);
        }

        let mut upstream: BTreeMap<ResourceId, BTreeSet<ResourceId>> = BTreeMap::new();
        let mut downstream: BTreeMap<ResourceId, BTreeSet<ResourceId>> = by_id
            .keys()
            .map(|id| (id.clone(), BTreeSet::new()))
            .collect();

        for (id, node) in &by_id {
            let deps = node.upstream_ids();
            for dep in &deps {
                if !by_id.contains_key(dep) {
                    return Err(GraphError::UnknownReference {
                        from: id.clone(),
                        target: dep.clone(),
                    });
                }
                downstream.entry(dep.clone()).or_default().insert(id.clone());
            }
            upstream.insert(id.clone(), deps);
        }

        let order = topological_sort(&upstream)?;
        debug!("Built dependency graph with {} resources", order.len());

        Ok(Self {
            nodes: by_id,
            upstream,
            downstream,
            order,
        })
    }

    /// Returns the node with the given id.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&ResourceNode> {
        self.nodes.get(id)
    }

    /// Returns true if the graph declares the id.
    #[must_use]
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterates over the nodes in id order.
    pub fn iter(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.values()
    }

    /// Ids in an order where every resource follows all of its dependencies.
    #[must_use]
    pub fn topological_order(&self) -> &[ResourceId] {
        &self.order
    }

    /// Direct dependencies of a resource.
    #[must_use]
    pub fn upstream(&self, id: &ResourceId) -> Option<&BTreeSet<ResourceId>> {
        self.upstream.get(id)
    }

    /// Direct dependents of a resource.
    #[must_use]
    pub fn downstream(&self, id: &ResourceId) -> Option<&BTreeSet<ResourceId>> {
        self.downstream.get(id)
    }

    /// Every resource that depends on `id`, directly or transitively.
    #[must_use]
    pub fn transitive_dependents(&self, id: &ResourceId) -> BTreeSet<ResourceId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&ResourceId> = VecDeque::from([id]);

        while let Some(current) = queue.pop_front() {
            if let Some(children) = self.downstream.get(current) {
                for child in children {
                    if seen.insert(child.clone()) {
                        queue.push_back(child);
                    }
                }
            }
        }

        seen
    }
}

/// Orders ids so that dependencies come first.
///
/// Uses a depth-first traversal over dependency edges with three-color
/// marking; a back-edge to an in-progress node is a cycle.
pub(crate) fn topological_sort(
    upstream: &BTreeMap<ResourceId, BTreeSet<ResourceId>>,
) -> Result<Vec<ResourceId>, GraphError> {
    let mut marks: BTreeMap<&ResourceId, Mark> =
        upstream.keys().map(|id| (id, Mark::Unvisited)).collect();
    let mut order = Vec::with_capacity(upstream.len());
    let mut path: Vec<&ResourceId> = Vec::new();

    for root in upstream.keys() {
        if marks.get(root) == Some(&Mark::Unvisited) {
            visit(root, upstream, &mut marks, &mut path, &mut order)?;
        }
    }

    Ok(order)
}

fn visit<'a>(
    id: &'a ResourceId,
    upstream: &'a BTreeMap<ResourceId, BTreeSet<ResourceId>>,
    marks: &mut BTreeMap<&'a ResourceId, Mark>,
    path: &mut Vec<&'a ResourceId>,
    order: &mut Vec<ResourceId>,
) -> Result<(), GraphError> {
    marks.insert(id, Mark::InProgress);
    path.push(id);

    if let Some(deps) = upstream.get(id) {
        for dep in deps {
            match marks.get(dep).copied().unwrap_or(Mark::Done) {
                Mark::Unvisited => visit(dep, upstream, marks, path, order)?,
                Mark::InProgress => {
                    let start = path.iter().position(|p| *p == dep).unwrap_or(0);
                    let mut cycle: Vec<ResourceId> =
                        path[start..].iter().map(|p| (*p).clone()).collect();
                    cycle.push(dep.clone());
                    return Err(GraphError::CycleDetected { path: cycle });
                }
                Mark::Done => {}
            }
        }
    }

    path.pop();
    marks.insert(id, Mark::Done);
    order.push(id.clone());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Value;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;

    fn node(id: &str) -> ResourceNode {
        ResourceNode::new(id, "test")
    }

    fn assert_valid_order(graph: &DependencyGraph) {
        let position: HashMap<&ResourceId, usize> = graph
            .topological_order()
            .iter()
            .enumerate()
            .map(|(i, id)| (id, i))
            .collect();

        assert_eq!(position.len(), graph.len());
        for n in graph.iter() {
            for dep in graph.upstream(&n.id).expect("node has upstream entry") {
                assert!(position[dep] < position[&n.id], "{dep} must precede {}", n.id);
            }
        }
    }

    #[test]
    fn test_reference_creates_edge() {
        let graph = DependencyGraph::build([
            node("p1").with_property("bucket_arn", Value::reference("b1", "arn")),
            node("b1").with_property("versioning", true),
        ])
        .expect("acyclic graph");

        assert_eq!(graph.topological_order(), &[ResourceId::new("b1"), ResourceId::new("p1")]);
        assert!(graph.downstream(&ResourceId::new("b1")).expect("b1 exists").contains(&ResourceId::new("p1")));
    }

    #[test]
    fn test_unknown_reference() {
        let err = DependencyGraph::build([node("p1").with_property("arn", Value::reference("b9", "arn"))])
            .expect_err("b9 is undeclared");

        assert_eq!(
            err,
            GraphError::UnknownReference {
                from: ResourceId::new("p1"),
                target: ResourceId::new("b9"),
            }
        );
    }

    #[test]
    fn test_unknown_explicit_dependency() {
        let err = DependencyGraph::build([node("svc").with_dependency("namespace")])
            .expect_err("namespace is undeclared");
        assert!(matches!(err, GraphError::UnknownReference { .. }));
    }

    #[test]
    fn test_duplicate_resource() {
        let err = DependencyGraph::build([node("a"), node("a")]).expect_err("duplicate id");
        assert_eq!(err, GraphError::DuplicateResource(ResourceId::new("a")));
    }

    #[test]
    fn test_cycle_reports_full_path() {
        let err = DependencyGraph::build([
            node("a").with_property("x", Value::reference("b", "out")),
            node("b").with_dependency("c"),
            node("c").with_property("y", Value::reference("a", "out")),
        ])
        .expect_err("a -> b -> c -> a");

        let GraphError::CycleDetected { path } = err else {
            panic!("expected a cycle, got {err:?}");
        };
        let names: Vec<_> = path.iter().map(ResourceId::as_str).collect();
        assert_eq!(names, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn test_self_reference_is_cycle() {
        let err = DependencyGraph::build([node("a").with_property("x", Value::reference("a", "out"))])
            .expect_err("self reference");
        assert_eq!(
            err,
            GraphError::CycleDetected {
                path: vec![ResourceId::new("a"), ResourceId::new("a")],
            }
        );
    }

    #[test]
    fn test_transitive_dependents() {
        let graph = DependencyGraph::build([
            node("namespace"),
            node("pvc").with_dependency("namespace"),
            node("deployment").with_dependency("pvc"),
            node("unrelated"),
        ])
        .expect("acyclic graph");

        let dependents = graph.transitive_dependents(&ResourceId::new("namespace"));
        assert_eq!(
            dependents,
            BTreeSet::from([ResourceId::new("deployment"), ResourceId::new("pvc")])
        );
    }

    #[test]
    fn test_random_dags_produce_valid_orders() {
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..200 {
            let size = rng.gen_range(1..25);
            let nodes: Vec<ResourceNode> = (0..size)
                .map(|i| {
                    // Only point at lower indices, which keeps the graph acyclic.
                    let mut n = node(&format!("n{i}"));
                    for j in 0..i {
                        if rng.gen_bool(0.2) {
                            n = n.with_dependency(format!("n{j}"));
                        }
                    }
                    n
                })
                .collect();

            let graph = DependencyGraph::build(nodes).expect("generated graph is acyclic");
            assert_valid_order(&graph);
        }
    }

    #[test]
    fn test_random_graphs_with_back_edge_detect_cycle() {
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..100 {
            let size = rng.gen_range(2..15);
            let mut nodes: Vec<ResourceNode> = (0..size)
                .map(|i| {
                    let n = node(&format!("n{i}"));
                    // A full chain guarantees the back-edge below closes a cycle.
                    if i > 0 { n.with_dependency(format!("n{}", i - 1)) } else { n }
                })
                .collect();
            let from = rng.gen_range(0..size - 1);
            let back = nodes.remove(from);
            nodes.push(back.with_dependency(format!("n{}", size - 1)));

            let err = DependencyGraph::build(nodes).expect_err("back edge closes a cycle");
            let GraphError::CycleDetected { path } = err else {
                panic!("expected a cycle, got {err:?}");
            };
            assert_eq!(path.first(), path.last());
            assert!(path.len() >= 2);
        }
    }
}
