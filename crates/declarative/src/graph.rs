//! Dependency graph over configuration records
//!
//! Edges come from explicit references (a watchlist or custom agent naming
//! notification channels). Only references to records that exist become
//! edges; unknown references are the planner's business. Cycles are
//! reported as data, never as an error, so callers pick the severity.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::types::{ConfigRecord, ResourceKind};

/// One record in the graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    pub name: String,
    pub kind: ResourceKind,
    /// Names this node depends on (sorted)
    pub dependencies: Vec<String>,
    /// Names depending on this node (sorted)
    pub dependents: Vec<String>,
    /// 0 without dependencies, else 1 + max depth of dependencies
    pub depth: usize,
}

/// A `from` depends on `to` edge
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from: String,
    pub to: String,
}

/// Built graph with its execution order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyGraph {
    pub nodes: BTreeMap<String, GraphNode>,
    /// Dependencies before dependents; ties by depth then name
    pub execution_order: Vec<String>,
    pub has_cycles: bool,
    /// Each cycle as a path that starts and ends on the same name
    pub cycles: Vec<Vec<String>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Done,
}

impl DependencyGraph {
    /// Build the graph and its execution order from records
    pub fn build(records: &[ConfigRecord]) -> Self {
        let mut nodes: BTreeMap<String, GraphNode> = records
            .iter()
            .map(|r| {
                (
                    r.name.clone(),
                    GraphNode {
                        name: r.name.clone(),
                        kind: r.kind,
                        dependencies: Vec::new(),
                        dependents: Vec::new(),
                        depth: 0,
                    },
                )
            })
            .collect();

        for record in records {
            for target in record.reference_set() {
                if target == record.name || !nodes.contains_key(&target) {
                    continue;
                }
                if let Some(node) = nodes.get_mut(&record.name) {
                    node.dependencies.push(target.clone());
                }
                if let Some(node) = nodes.get_mut(&target) {
                    node.dependents.push(record.name.clone());
                }
            }
        }
        for node in nodes.values_mut() {
            node.dependencies.sort();
            node.dependencies.dedup();
            node.dependents.sort();
            node.dependents.dedup();
        }

        let mut graph = Self {
            nodes,
            ..Self::default()
        };
        graph.sort();
        graph
    }

    /// Depth-first walk computing depths and recording cycles
    fn sort(&mut self) {
        let mut marks: HashMap<String, Mark> = self
            .nodes
            .keys()
            .map(|name| (name.clone(), Mark::Unvisited))
            .collect();
        let mut depths: HashMap<String, usize> = HashMap::new();
        let mut stack: Vec<String> = Vec::new();
        let mut cycles = Vec::new();

        let names: Vec<String> = self.nodes.keys().cloned().collect();
        for name in &names {
            self.visit(name, &mut marks, &mut depths, &mut stack, &mut cycles);
        }

        for (name, depth) in &depths {
            if let Some(node) = self.nodes.get_mut(name) {
                node.depth = *depth;
            }
        }

        let mut order: Vec<&GraphNode> = self.nodes.values().collect();
        order.sort_by(|a, b| a.depth.cmp(&b.depth).then_with(|| a.name.cmp(&b.name)));
        self.execution_order = order.into_iter().map(|n| n.name.clone()).collect();
        self.has_cycles = !cycles.is_empty();
        self.cycles = cycles;
    }

    fn visit(
        &self,
        name: &str,
        marks: &mut HashMap<String, Mark>,
        depths: &mut HashMap<String, usize>,
        stack: &mut Vec<String>,
        cycles: &mut Vec<Vec<String>>,
    ) -> usize {
        match marks.get(name).copied().unwrap_or(Mark::Done) {
            Mark::Done => return depths.get(name).copied().unwrap_or(0),
            Mark::Visiting => {
                if let Some(start) = stack.iter().position(|n| n == name) {
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(name.to_string());
                    cycles.push(cycle);
                }
                // Back edge contributes nothing to depth
                return 0;
            }
            Mark::Unvisited => {}
        }

        marks.insert(name.to_string(), Mark::Visiting);
        stack.push(name.to_string());

        let mut depth = 0;
        if let Some(node) = self.nodes.get(name) {
            for dep in &node.dependencies {
                let dep_depth = self.visit(dep, marks, depths, stack, cycles);
                let on_cycle = marks.get(dep.as_str()) == Some(&Mark::Visiting);
                if !on_cycle {
                    depth = depth.max(dep_depth + 1);
                }
            }
        }

        stack.pop();
        marks.insert(name.to_string(), Mark::Done);
        depths.insert(name.to_string(), depth);
        depth
    }

    pub fn get(&self, name: &str) -> Option<&GraphNode> {
        self.nodes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// All edges, sorted
    pub fn edges(&self) -> Vec<DependencyEdge> {
        let mut edges: Vec<DependencyEdge> = self
            .nodes
            .values()
            .flat_map(|node| {
                node.dependencies.iter().map(|dep| DependencyEdge {
                    from: node.name.clone(),
                    to: dep.clone(),
                })
            })
            .collect();
        edges.sort();
        edges
    }

    /// Names grouped by depth; members of one layer are independent
    pub fn layers(&self) -> Vec<Vec<String>> {
        let mut layers: Vec<Vec<String>> = Vec::new();
        for name in &self.execution_order {
            let Some(node) = self.nodes.get(name) else {
                continue;
            };
            if layers.len() <= node.depth {
                layers.resize_with(node.depth + 1, Vec::new);
            }
            layers[node.depth].push(name.clone());
        }
        layers.retain(|layer| !layer.is_empty());
        layers
    }

    /// Position of each name in the execution order
    pub fn positions(&self) -> HashMap<&str, usize> {
        self.execution_order
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{agent, channel, watchlist};

    fn assert_topological(graph: &DependencyGraph) {
        let pos = graph.positions();
        for edge in graph.edges() {
            assert!(
                pos[edge.to.as_str()] < pos[edge.from.as_str()],
                "{} must come before {}",
                edge.to,
                edge.from
            );
        }
    }

    #[test]
    fn test_channel_before_watchlist() {
        let records = vec![watchlist("w1", &["c1"]), channel("c1")];
        let graph = DependencyGraph::build(&records);

        assert_eq!(graph.execution_order, vec!["c1", "w1"]);
        assert_eq!(graph.get("w1").unwrap().dependencies, vec!["c1"]);
        assert_eq!(graph.get("c1").unwrap().dependents, vec!["w1"]);
        assert_eq!(graph.get("w1").unwrap().depth, 1);
        assert!(!graph.has_cycles);
    }

    #[test]
    fn test_unknown_references_are_not_edges() {
        let records = vec![watchlist("w1", &["ghost", "c1"]), channel("c1")];
        let graph = DependencyGraph::build(&records);

        assert_eq!(graph.get("w1").unwrap().dependencies, vec!["c1"]);
        assert_eq!(graph.edges().len(), 1);
    }

    #[test]
    fn test_independent_nodes_ordered_by_depth_then_name() {
        let records = vec![
            agent("zeta", "http", &["b"]),
            watchlist("alpha", &["a"]),
            channel("b"),
            channel("a"),
        ];
        let graph = DependencyGraph::build(&records);

        assert_eq!(graph.execution_order, vec!["a", "b", "alpha", "zeta"]);
        assert_eq!(graph.layers(), vec![vec!["a", "b"], vec!["alpha", "zeta"]]);
    }

    #[test]
    fn test_order_is_deterministic_across_input_order() {
        let forward = vec![channel("a"), channel("b"), watchlist("w", &["a", "b"])];
        let mut reversed = forward.clone();
        reversed.reverse();

        assert_eq!(
            DependencyGraph::build(&forward).execution_order,
            DependencyGraph::build(&reversed).execution_order
        );
    }

    #[test]
    fn test_deep_chain_is_topological() {
        let records = vec![
            watchlist("d", &["c"]),
            watchlist("c", &["b"]),
            watchlist("b", &["a"]),
            channel("a"),
            agent("e", "http", &["a", "d"]),
        ];
        let graph = DependencyGraph::build(&records);

        assert_topological(&graph);
        assert_eq!(graph.get("e").unwrap().depth, 4);
    }

    #[test]
    fn test_cycle_is_reported_not_raised() {
        let records = vec![watchlist("x", &["y"]), watchlist("y", &["x"]), channel("c")];
        let graph = DependencyGraph::build(&records);

        assert!(graph.has_cycles);
        assert_eq!(graph.cycles.len(), 1);
        let cycle = &graph.cycles[0];
        assert_eq!(cycle.first(), cycle.last());
        assert!(cycle.contains(&"x".to_string()));
        assert!(cycle.contains(&"y".to_string()));
        assert_eq!(graph.execution_order.len(), 3);
    }

    #[test]
    fn test_self_reference_is_ignored() {
        let records = vec![watchlist("w", &["w"])];
        let graph = DependencyGraph::build(&records);
        assert!(graph.get("w").unwrap().dependencies.is_empty());
        assert!(!graph.has_cycles);
    }
}
