use std::collections::{BTreeMap, BTreeSet};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use super::resolver;
use crate::config::types::Resource;
use crate::error::EngineError;

/// The type of dependency between two resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyEdge {
    /// Explicitly declared via `depends_on`.
    Explicit,
    /// Inferred from a `${ref.<id>.<attr>}` in the dependent's properties.
    Implicit,
}

/// The desired resources of one stack and the dependencies between them.
///
/// Edges point from a dependency to its dependent, so a topological walk
/// visits dependencies first. Nodes are addressed by logical ID.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    graph: DiGraph<Resource, DependencyEdge>,
    index: BTreeMap<String, NodeIndex>,
}

impl ResourceGraph {
    /// Build the graph, rejecting duplicate IDs, dangling references and cycles.
    pub fn build(resources: Vec<Resource>) -> Result<Self, EngineError> {
        let mut graph = DiGraph::new();
        let mut index = BTreeMap::new();

        for resource in resources {
            if index.contains_key(&resource.id) {
                return Err(EngineError::DuplicateResource(resource.id));
            }
            let id = resource.id.clone();
            let idx = graph.add_node(resource);
            index.insert(id, idx);
        }

        let mut edges = Vec::new();
        for (id, &idx) in &index {
            let resource: &Resource = &graph[idx];
            let implicit = resource.references();
            for dep in resource.dependencies() {
                let Some(&dep_idx) = index.get(&dep) else {
                    return Err(EngineError::UnresolvedReference {
                        resource: id.clone(),
                        target: dep,
                    });
                };
                let kind = if implicit.contains(&dep) {
                    DependencyEdge::Implicit
                } else {
                    DependencyEdge::Explicit
                };
                edges.push((dep_idx, idx, kind));
            }
        }
        for (from, to, kind) in edges {
            graph.add_edge(from, to, kind);
        }

        let built = Self { graph, index };
        if let Some(members) = built.find_cycle() {
            return Err(EngineError::Cycle { members });
        }

        tracing::debug!(
            resources = built.len(),
            edges = built.graph.edge_count(),
            "Built resource graph"
        );
        Ok(built)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Resource> {
        self.index.get(id).map(|&idx| &self.graph[idx])
    }

    /// Logical IDs in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }

    /// Resources in ascending ID order.
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.index.values().map(move |&idx| &self.graph[idx])
    }

    /// Direct dependencies of `id`, sorted.
    pub fn dependencies(&self, id: &str) -> Vec<&str> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct dependents of `id`, sorted.
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Every resource that depends on `id`, directly or not.
    pub fn transitive_dependents(&self, id: &str) -> BTreeSet<String> {
        let mut visited = BTreeSet::new();
        let Some(&start) = self.index.get(id) else {
            return visited;
        };
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if visited.insert(self.graph[next].id.clone()) {
                    stack.push(next);
                }
            }
        }
        visited
    }

    /// Dependency edges as `(dependency, dependent, kind)`, sorted.
    pub fn edges(&self) -> Vec<(&str, &str, DependencyEdge)> {
        let mut edges: Vec<_> = self
            .graph
            .edge_references()
            .map(|e| {
                (
                    self.graph[e.source()].id.as_str(),
                    self.graph[e.target()].id.as_str(),
                    *e.weight(),
                )
            })
            .collect();
        edges.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        edges
    }

    /// Dependencies-first order; ties broken by ascending logical ID.
    pub fn topological_order(&self) -> Vec<&str> {
        let ids: Vec<&str> = self.ids().collect();
        let position: BTreeMap<&str, usize> =
            ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        let edges: Vec<(usize, usize)> = self
            .edges()
            .into_iter()
            .map(|(from, to, _)| (position[from], position[to]))
            .collect();
        // Acyclic by construction, so nothing is left over.
        let (order, _) = resolver::kahn_order(ids.len(), &edges, |i| i);
        order.into_iter().map(|i| ids[i]).collect()
    }

    /// Dependencies-first levels; every resource in a level can run together.
    pub fn levels(&self) -> Vec<Vec<&str>> {
        let ids: Vec<&str> = self.ids().collect();
        let position: BTreeMap<&str, usize> =
            ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        let edges: Vec<(usize, usize)> = self
            .edges()
            .into_iter()
            .map(|(from, to, _)| (position[from], position[to]))
            .collect();
        resolver::resolve_batches(ids.len(), &edges)
            .into_iter()
            .map(|batch| batch.into_iter().map(|i| ids[i]).collect())
            .collect()
    }

    fn neighbors(&self, id: &str, direction: Direction) -> Vec<&str> {
        let Some(&idx) = self.index.get(id) else {
            return Vec::new();
        };
        let mut ids: Vec<&str> = self
            .graph
            .neighbors_directed(idx, direction)
            .map(|n| self.graph[n].id.as_str())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Depth-first search with white/grey/black colouring, following
    /// "depends on" edges. Returns the members of the first cycle found in
    /// cycle order, starting from the smallest ID.
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut colour: BTreeMap<NodeIndex, Colour> = BTreeMap::new();
        let mut path: Vec<NodeIndex> = Vec::new();

        for &start in self.index.values() {
            if colour.get(&start).copied().unwrap_or(Colour::White) == Colour::White {
                if let Some(cycle) = self.visit(start, &mut colour, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn visit(
        &self,
        node: NodeIndex,
        colour: &mut BTreeMap<NodeIndex, Colour>,
        path: &mut Vec<NodeIndex>,
    ) -> Option<Vec<String>> {
        colour.insert(node, Colour::Grey);
        path.push(node);

        let mut deps: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(node, Direction::Incoming)
            .collect();
        deps.sort_by(|a, b| self.graph[*a].id.cmp(&self.graph[*b].id));
        deps.dedup();

        for dep in deps {
            match colour.get(&dep).copied().unwrap_or(Colour::White) {
                Colour::Grey => {
                    let start = path.iter().position(|&n| n == dep).unwrap_or(0);
                    let mut members: Vec<String> = path[start..]
                        .iter()
                        .map(|&n| self.graph[n].id.clone())
                        .collect();
                    if let Some(min) = members
                        .iter()
                        .enumerate()
                        .min_by(|a, b| a.1.cmp(b.1))
                        .map(|(i, _)| i)
                    {
                        members.rotate_left(min);
                    }
                    return Some(members);
                }
                Colour::White => {
                    if let Some(cycle) = self.visit(dep, colour, path) {
                        return Some(cycle);
                    }
                }
                Colour::Black => {}
            }
        }

        path.pop();
        colour.insert(node, Colour::Black);
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Colour {
    White,
    Grey,
    Black,
}
