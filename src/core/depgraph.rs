use std::collections::{BinaryHeap, HashMap};
use std::cmp::Reverse;

use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::{Error, Result};

/// Node payload of the bipartite dependency graph: component instances
/// (entities) and attribute names (constraints).
#[derive(Debug, Clone)]
enum Node {
    Entity {
        name: String,
        grouping: i64,
        handle: usize,
    },
    Constraint {
        name: String,
        grouping: i64,
    },
}

/// Sort key for the lexicographic Kahn's algorithm: `(grouping,
/// constraint-name-or-entity-id)`, so ordering is deterministic and stable
/// across runs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum TieBreak {
    Constraint(String),
    Entity(usize),
}

/// Bipartite directed dependency graph.
///
/// Edges run constraint → entity for `depends`, entity → constraint for
/// `provides`, and entity → entity for explicit ordering.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    graph: DiGraph<Node, ()>,
    constraints: HashMap<String, NodeIndex>,
    entities_by_name: HashMap<String, Vec<NodeIndex>>,
    entities_by_handle: HashMap<usize, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> DependencyGraph {
        DependencyGraph::default()
    }

    /// Insert a component instance. With `duplicate` false, a second insert
    /// of the same name is rejected and the caller reuses the first
    /// occurrence.
    pub fn insert(
        &mut self,
        name: &str,
        handle: usize,
        depends: &[String],
        provides: &[String],
        grouping: i64,
        duplicate: bool,
    ) -> bool {
        if !duplicate && self.entities_by_name.contains_key(name) {
            return false;
        }

        let entity = self.graph.add_node(Node::Entity {
            name: name.to_string(),
            grouping,
            handle,
        });
        self.entities_by_name
            .entry(name.to_string())
            .or_default()
            .push(entity);
        self.entities_by_handle.insert(handle, entity);

        for attribute in depends {
            let constraint = self.constraint_node(attribute, grouping);
            self.graph.add_edge(constraint, entity, ());
        }
        for attribute in provides {
            let constraint = self.constraint_node(attribute, grouping);
            self.graph.add_edge(entity, constraint, ());
        }
        true
    }

    fn constraint_node(&mut self, attribute: &str, grouping: i64) -> NodeIndex {
        if let Some(index) = self.constraints.get(attribute) {
            return *index;
        }
        let index = self.graph.add_node(Node::Constraint {
            name: attribute.to_string(),
            grouping,
        });
        self.constraints.insert(attribute.to_string(), index);
        index
    }

    /// Force `before` ahead of `after` in the ordered plan.
    pub fn associate(&mut self, before: usize, after: usize) {
        let (Some(&a), Some(&b)) = (
            self.entities_by_handle.get(&before),
            self.entities_by_handle.get(&after),
        ) else {
            return;
        };
        if a == b {
            // A self-association is a degenerate cycle; record it so cycle
            // detection reports it rather than silently dropping it.
            self.graph.add_edge(a, b, ());
            return;
        }
        if self.graph.find_edge(a, b).is_none() {
            self.graph.add_edge(a, b, ());
        }
    }

    /// The handle of the first inserted instance of `name`, if any.
    pub fn first_handle(&self, name: &str) -> Option<usize> {
        let index = self.entities_by_name.get(name)?.first()?;
        match &self.graph[*index] {
            Node::Entity { handle, .. } => Some(*handle),
            Node::Constraint { .. } => None,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entities_by_name.contains_key(name)
    }

    /// Constraints with no provider, paired with their grouping.
    pub fn in_degree_zero_constraints(&self) -> Vec<(String, i64)> {
        let mut unsatisfied: Vec<(String, i64)> = self
            .constraints
            .values()
            .filter_map(|&index| {
                let has_provider = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .next()
                    .is_some();
                if has_provider {
                    return None;
                }
                match &self.graph[index] {
                    Node::Constraint { name, grouping } => {
                        Some((name.clone(), *grouping))
                    }
                    Node::Entity { .. } => None,
                }
            })
            .collect();
        unsatisfied.sort();
        unsatisfied
    }

    /// Topological order of component handles using a lexicographic Kahn's
    /// algorithm keyed by `(grouping, tiebreak)`.
    pub fn ordered_entities(&self) -> Result<Vec<(usize, i64)>> {
        let mut in_degrees: HashMap<NodeIndex, usize> = HashMap::new();
        for index in self.graph.node_indices() {
            in_degrees.insert(
                index,
                self.graph
                    .neighbors_directed(index, Direction::Incoming)
                    .count(),
            );
        }

        let mut ready: BinaryHeap<Reverse<(i64, TieBreak, NodeIndex)>> = BinaryHeap::new();
        for (&index, &degree) in &in_degrees {
            if degree == 0 {
                ready.push(Reverse(self.sort_key(index)));
            }
        }

        let mut ordered = Vec::new();
        let mut emitted = 0usize;
        while let Some(Reverse((_, _, index))) = ready.pop() {
            emitted += 1;
            if let Node::Entity {
                handle, grouping, ..
            } = &self.graph[index]
            {
                ordered.push((*handle, *grouping));
            }
            for successor in self.graph.neighbors_directed(index, Direction::Outgoing) {
                let degree = in_degrees.get_mut(&successor).expect("known node");
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse(self.sort_key(successor)));
                }
            }
        }

        if emitted != self.graph.node_count() {
            return Err(Error::DependencyCycle {
                listing: render_cycles(&self.cycles()),
            });
        }
        Ok(ordered)
    }

    fn sort_key(&self, index: NodeIndex) -> (i64, TieBreak, NodeIndex) {
        match &self.graph[index] {
            Node::Entity { grouping, .. } => {
                (*grouping, TieBreak::Entity(index.index()), index)
            }
            Node::Constraint { name, grouping } => {
                (*grouping, TieBreak::Constraint(name.clone()), index)
            }
        }
    }

    pub fn has_cycles(&self) -> bool {
        petgraph::algo::is_cyclic_directed(&self.graph)
    }

    /// One representative simple cycle per strongly connected component.
    pub fn cycles(&self) -> Vec<Vec<String>> {
        let mut cycles = Vec::new();
        for scc in tarjan_scc(&self.graph) {
            let is_cycle = scc.len() > 1
                || self.graph.find_edge(scc[0], scc[0]).is_some();
            if !is_cycle {
                continue;
            }
            let members: Vec<String> = scc
                .iter()
                .map(|&index| match &self.graph[index] {
                    Node::Entity { name, .. } => name.clone(),
                    Node::Constraint { name, .. } => format!("<{name}>"),
                })
                .collect();
            cycles.push(members);
        }
        cycles
    }
}

/// Render cycles for the operator: one ring per line.
pub fn render_cycles(cycles: &[Vec<String>]) -> String {
    let mut listing = String::new();
    for cycle in cycles {
        let mut ring = cycle.join(" ► ");
        if let Some(first) = cycle.first() {
            ring.push_str(" ► ");
            ring.push_str(first);
        }
        listing.push_str(&ring);
        listing.push('\n');
    }
    listing
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn provider_orders_before_dependent() {
        let mut graph = DependencyGraph::new();
        // m1 depends on c1; m2 provides c1.
        graph.insert("m1", 0, &strings(&["c1"]), &[], 0, true);
        graph.insert("m2", 1, &[], &strings(&["c1"]), 0, false);

        let order: Vec<usize> = graph
            .ordered_entities()
            .expect("acyclic")
            .into_iter()
            .map(|(handle, _)| handle)
            .collect();
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn duplicate_insert_without_flag_is_rejected() {
        let mut graph = DependencyGraph::new();
        assert!(graph.insert("m1", 0, &[], &[], 0, true));
        assert!(!graph.insert("m1", 1, &[], &[], 0, false));
        assert!(graph.insert("m1", 2, &[], &[], 0, true));
        assert_eq!(graph.first_handle("m1"), Some(0));
    }

    #[test]
    fn unsatisfied_constraints_have_no_provider() {
        let mut graph = DependencyGraph::new();
        graph.insert("m1", 0, &strings(&["c1", "c2"]), &[], 0, true);
        graph.insert("m2", 1, &[], &strings(&["c1"]), 0, false);
        assert_eq!(
            graph.in_degree_zero_constraints(),
            vec![("c2".to_string(), 0)]
        );
    }

    #[test]
    fn grouping_breaks_ties_deterministically() {
        let mut graph = DependencyGraph::new();
        graph.insert("late", 0, &[], &[], 5, true);
        graph.insert("early", 1, &[], &[], 1, true);
        graph.insert("middle", 2, &[], &[], 3, true);

        let order: Vec<usize> = graph
            .ordered_entities()
            .expect("acyclic")
            .into_iter()
            .map(|(handle, _)| handle)
            .collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn association_forces_ordering() {
        let mut graph = DependencyGraph::new();
        graph.insert("a", 0, &[], &[], 0, true);
        graph.insert("b", 1, &[], &[], 0, true);
        // Without an association, insertion index orders a first; flip it.
        graph.associate(1, 0);

        let order: Vec<usize> = graph
            .ordered_entities()
            .expect("acyclic")
            .into_iter()
            .map(|(handle, _)| handle)
            .collect();
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn cycles_are_detected_and_listed() {
        let mut graph = DependencyGraph::new();
        // a provides c1 but also depends on c2; b provides c2, depends on c1.
        graph.insert("a", 0, &strings(&["c2"]), &strings(&["c1"]), 0, true);
        graph.insert("b", 1, &strings(&["c1"]), &strings(&["c2"]), 0, true);

        assert!(graph.has_cycles());
        let cycles = graph.cycles();
        assert_eq!(cycles.len(), 1);
        let err = graph.ordered_entities().expect_err("cycle");
        match err {
            Error::DependencyCycle { listing } => {
                assert!(listing.contains('►'));
                assert!(listing.contains('a'));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
