//! Dependency graph over declared resources.
//!
//! Both edge kinds order startup: a reference needs the producer's resolved
//! value before the consumer starts, and a wait-for needs its readiness.
//! Nodes are indexed by declaration order, which is also the tie-breaker
//! everywhere an order is produced.

use crate::{ModelError, ResourceNode, Result};
use std::collections::{HashMap, VecDeque};

/// Directed acyclic graph of resources
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependencyGraph {
    /// Node names in declaration order
    names: Vec<String>,
    /// Name -> index
    index: HashMap<String, usize>,
    /// Node -> distinct producers it depends on
    producers: Vec<Vec<usize>>,
    /// Node -> distinct consumers depending on it
    dependents: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build a graph from resources in declaration order.
    ///
    /// Edges to names outside the given set are ignored; the registry
    /// rejects them before this point.
    pub fn from_resources<'a>(resources: impl IntoIterator<Item = &'a ResourceNode>) -> Self {
        let resources: Vec<&ResourceNode> = resources.into_iter().collect();
        let names: Vec<String> = resources.iter().map(|r| r.name().to_string()).collect();
        let index: HashMap<String, usize> = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();

        let mut producers = vec![Vec::new(); names.len()];
        let mut dependents = vec![Vec::new(); names.len()];

        for (consumer, resource) in resources.iter().enumerate() {
            for producer in resource.producers() {
                let Some(&producer) = index.get(producer) else {
                    continue;
                };
                if !producers[consumer].contains(&producer) {
                    producers[consumer].push(producer);
                    dependents[producer].push(consumer);
                }
            }
        }

        for list in producers.iter_mut().chain(dependents.iter_mut()) {
            list.sort_unstable();
        }

        Self {
            names,
            index,
            producers,
            dependents,
        }
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the graph has no nodes
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Node names in declaration order
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Whether the node exists
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Direct producers of a node, in declaration order
    pub fn producers_of(&self, name: &str) -> Vec<&str> {
        self.neighbours(name, &self.producers)
    }

    /// Direct dependents of a node, in declaration order
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.neighbours(name, &self.dependents)
    }

    fn neighbours<'a>(&'a self, name: &str, adjacency: &'a [Vec<usize>]) -> Vec<&'a str> {
        self.index
            .get(name)
            .map(|&i| adjacency[i].iter().map(|&j| self.names[j].as_str()).collect())
            .unwrap_or_default()
    }

    /// Every node reachable from `name` through dependents, in declaration order
    pub fn transitive_dependents(&self, name: &str) -> Vec<&str> {
        let Some(&start) = self.index.get(name) else {
            return Vec::new();
        };

        let mut seen = vec![false; self.names.len()];
        let mut queue = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            for &dependent in &self.dependents[node] {
                if !seen[dependent] {
                    seen[dependent] = true;
                    queue.push_back(dependent);
                }
            }
        }

        seen.iter()
            .enumerate()
            .filter(|(_, reached)| **reached)
            .map(|(i, _)| self.names[i].as_str())
            .collect()
    }

    /// Group nodes into startup batches.
    ///
    /// A node's batch is the length of the longest dependency path leading
    /// to it, so every producer sits in an earlier batch than its consumers.
    /// Nodes within a batch keep declaration order.
    pub fn layers(&self) -> Result<Vec<Vec<String>>> {
        let n = self.names.len();
        let mut in_degree: Vec<usize> = self.producers.iter().map(Vec::len).collect();
        let mut level = vec![0usize; n];
        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut processed = 0;

        while let Some(node) = queue.pop_front() {
            processed += 1;
            for &dependent in &self.dependents[node] {
                level[dependent] = level[dependent].max(level[node] + 1);
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if processed != n {
            let members = self.find_cycle().unwrap_or_default();
            return Err(ModelError::Cycle { members });
        }

        let depth = level.iter().copied().max().map_or(0, |max| max + 1);
        let mut batches = vec![Vec::new(); depth];
        for (i, name) in self.names.iter().enumerate() {
            batches[level[i]].push(name.clone());
        }
        Ok(batches)
    }

    /// Find one cycle, returned as its members in dependency order.
    ///
    /// Search starts from nodes in declaration order, so the result is
    /// deterministic for a given graph.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnPath,
            Done,
        }

        fn visit(
            graph: &DependencyGraph,
            node: usize,
            marks: &mut [Mark],
            path: &mut Vec<usize>,
        ) -> Option<Vec<usize>> {
            marks[node] = Mark::OnPath;
            path.push(node);

            for &producer in &graph.producers[node] {
                match marks[producer] {
                    Mark::OnPath => {
                        let start = path.iter().position(|&n| n == producer)?;
                        return Some(path[start..].to_vec());
                    }
                    Mark::Unvisited => {
                        if let Some(cycle) = visit(graph, producer, marks, path) {
                            return Some(cycle);
                        }
                    }
                    Mark::Done => {}
                }
            }

            path.pop();
            marks[node] = Mark::Done;
            None
        }

        let mut marks = vec![Mark::Unvisited; self.names.len()];
        for start in 0..self.names.len() {
            if marks[start] != Mark::Unvisited {
                continue;
            }
            let mut path = Vec::new();
            if let Some(cycle) = visit(self, start, &mut marks, &mut path) {
                return Some(cycle.into_iter().map(|i| self.names[i].clone()).collect());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EdgeKind, Registry, ResourceConfig, ResourceKind};

    fn external() -> ResourceKind {
        ResourceKind::External {
            connection_string: "Server=example".to_string(),
        }
    }

    fn registry(names: &[&str], edges: &[(&str, &str, EdgeKind)]) -> Registry {
        let mut registry = Registry::new();
        for name in names {
            registry
                .declare(*name, external(), ResourceConfig::new())
                .unwrap();
        }
        for (consumer, producer, kind) in edges {
            registry.add_edge(*consumer, *producer, *kind).unwrap();
        }
        registry
    }

    #[test]
    fn test_layers_use_longest_path() {
        // a -> b -> c and a -> c: c must sit after b, not next to it
        let registry = registry(
            &["c", "b", "a"],
            &[
                ("b", "c", EdgeKind::WaitFor),
                ("a", "b", EdgeKind::WaitFor),
                ("a", "c", EdgeKind::Reference),
            ],
        );

        let layers = registry.graph().layers().unwrap();
        assert_eq!(layers, vec![vec!["c"], vec!["b"], vec!["a"]]);
    }

    #[test]
    fn test_layers_keep_declaration_order_within_batch() {
        let registry = registry(
            &["web", "cache", "db", "api"],
            &[
                ("api", "db", EdgeKind::WaitFor),
                ("api", "cache", EdgeKind::WaitFor),
                ("web", "api", EdgeKind::Reference),
            ],
        );

        let layers = registry.graph().layers().unwrap();
        assert_eq!(layers, vec![vec!["cache", "db"], vec!["api"], vec!["web"]]);
    }

    #[test]
    fn test_two_node_cycle_is_named() {
        let registry = registry(
            &["a", "b"],
            &[("a", "b", EdgeKind::WaitFor), ("b", "a", EdgeKind::WaitFor)],
        );

        let graph = registry.graph();
        let err = graph.layers().unwrap_err();
        match err {
            ModelError::Cycle { mut members } => {
                members.sort();
                assert_eq!(members, vec!["a", "b"]);
            }
            other => panic!("Expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_cycle_excludes_nodes_outside_it() {
        // entry -> x -> y -> z -> x
        let registry = registry(
            &["entry", "x", "y", "z"],
            &[
                ("entry", "x", EdgeKind::WaitFor),
                ("x", "y", EdgeKind::WaitFor),
                ("y", "z", EdgeKind::Reference),
                ("z", "x", EdgeKind::WaitFor),
            ],
        );

        let cycle = registry.graph().find_cycle().unwrap();
        assert_eq!(cycle, vec!["x", "y", "z"]);
    }

    #[test]
    fn test_transitive_dependents() {
        let registry = registry(
            &["db", "api", "web", "worker", "other"],
            &[
                ("api", "db", EdgeKind::WaitFor),
                ("web", "api", EdgeKind::WaitFor),
                ("worker", "db", EdgeKind::Reference),
            ],
        );

        let graph = registry.graph();
        assert_eq!(graph.transitive_dependents("db"), vec!["api", "web", "worker"]);
        assert_eq!(graph.transitive_dependents("api"), vec!["web"]);
        assert!(graph.transitive_dependents("other").is_empty());
        assert_eq!(graph.producers_of("web"), vec!["api"]);
        assert_eq!(graph.dependents_of("db"), vec!["api", "worker"]);
    }

    #[test]
    fn test_empty_graph_has_no_layers() {
        let graph = DependencyGraph::default();
        assert!(graph.is_empty());
        assert!(graph.layers().unwrap().is_empty());
    }
}
