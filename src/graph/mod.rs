//! CV-010: Resource graph.
//!
//! A directed graph keyed by hierarchical string IDs. An edge `a -> b`
//! means "a depends on b": `b` is walked before `a`. Reverse edges
//! (dependents) are derived on demand, never stored.

pub mod id;
pub mod walk;

pub use walk::{CancelToken, Handle, WalkOptions};

use crate::core::error::{Error, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

/// Per-vertex metadata.
pub type Meta = BTreeMap<String, String>;

#[derive(Debug, Clone)]
struct Vertex<V> {
    value: V,
    meta: Meta,
}

/// Directed graph of vertex values.
#[derive(Debug, Clone)]
pub struct Graph<V> {
    vertices: BTreeMap<String, Vertex<V>>,
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl<V> Default for Graph<V> {
    fn default() -> Self {
        Self {
            vertices: BTreeMap::new(),
            edges: BTreeMap::new(),
        }
    }
}

impl<V> Graph<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a vertex. IDs must be unique.
    pub fn add(&mut self, id: impl Into<String>, value: V) -> Result<()> {
        let id = id.into();
        if self.vertices.contains_key(&id) {
            return Err(Error::Internal(format!("duplicate vertex {}", id)));
        }
        self.edges.insert(id.clone(), BTreeSet::new());
        self.vertices.insert(
            id,
            Vertex {
                value,
                meta: Meta::new(),
            },
        );
        Ok(())
    }

    /// Add an edge: `from` depends on `to`. Both endpoints must exist.
    pub fn connect(&mut self, from: &str, to: &str) -> Result<()> {
        if !self.vertices.contains_key(to) {
            return Err(Error::Internal(format!(
                "cannot connect {} -> {}: {} does not exist",
                from, to, to
            )));
        }
        match self.edges.get_mut(from) {
            Some(out) => {
                out.insert(to.to_string());
                Ok(())
            }
            None => Err(Error::Internal(format!(
                "cannot connect {} -> {}: {} does not exist",
                from, to, from
            ))),
        }
    }

    /// Whether the edge `from -> to` exists.
    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        self.edges.get(from).is_some_and(|out| out.contains(to))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.vertices.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&V> {
        self.vertices.get(id).map(|v| &v.value)
    }

    /// Replace the value of an existing vertex, returning the old one.
    pub fn replace(&mut self, id: &str, value: V) -> Option<V> {
        self.vertices
            .get_mut(id)
            .map(|v| std::mem::replace(&mut v.value, value))
    }

    pub fn meta(&self, id: &str) -> Option<&Meta> {
        self.vertices.get(id).map(|v| &v.meta)
    }

    pub fn set_meta(&mut self, id: &str, key: impl Into<String>, value: impl Into<String>) {
        if let Some(v) = self.vertices.get_mut(id) {
            v.meta.insert(key.into(), value.into());
        }
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// All vertex IDs, sorted.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.vertices.keys().map(String::as_str)
    }

    /// All edges `(from, to)`, sorted.
    pub fn edges(&self) -> impl Iterator<Item = (&str, &str)> {
        self.edges
            .iter()
            .flat_map(|(from, out)| out.iter().map(move |to| (from.as_str(), to.as_str())))
    }

    /// Direct dependencies of `id`, sorted.
    pub fn dependencies(&self, id: &str) -> Vec<String> {
        self.edges
            .get(id)
            .map(|out| out.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Direct dependents of `id` (vertices with an edge to it), sorted.
    pub fn dependents(&self, id: &str) -> Vec<String> {
        self.edges
            .iter()
            .filter(|(_, out)| out.contains(id))
            .map(|(from, _)| from.clone())
            .collect()
    }

    /// Transitive dependencies of `id`, sorted.
    pub fn descendants(&self, id: &str) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut stack = self.dependencies(id);
        while let Some(next) = stack.pop() {
            if seen.insert(next.clone()) {
                stack.extend(self.dependencies(&next));
            }
        }
        seen.into_iter().collect()
    }

    /// Build a graph with the same topology and mapped values.
    pub fn map<U>(&self, mut f: impl FnMut(&str, &V) -> U) -> Graph<U> {
        Graph {
            vertices: self
                .vertices
                .iter()
                .map(|(id, v)| {
                    (
                        id.clone(),
                        Vertex {
                            value: f(id, &v.value),
                            meta: v.meta.clone(),
                        },
                    )
                })
                .collect(),
            edges: self.edges.clone(),
        }
    }

    /// Attach `sub` at the existing vertex `at`.
    ///
    /// The subgraph's `root` collapses into `at` (keeping `at`'s value and
    /// merging metadata); every other vertex is renamed under `at`.
    pub fn adopt(&mut self, at: &str, sub: Graph<V>) -> Result<()> {
        if !self.contains(at) {
            return Err(Error::Internal(format!("cannot adopt under missing {}", at)));
        }
        let Graph { vertices, edges } = sub;
        for (sub_id, vertex) in vertices {
            let new_id = id::rebase(&sub_id, id::ROOT, at);
            if new_id == at {
                if let Some(existing) = self.vertices.get_mut(at) {
                    existing.meta.extend(vertex.meta);
                }
                continue;
            }
            self.add(new_id.clone(), vertex.value)?;
            if let Some(v) = self.vertices.get_mut(&new_id) {
                v.meta = vertex.meta;
            }
        }
        for (from, out) in edges {
            let from = id::rebase(&from, id::ROOT, at);
            for to in out {
                let to = id::rebase(&to, id::ROOT, at);
                self.connect(&from, &to)?;
            }
        }
        Ok(())
    }

    /// Check that edge endpoints exist, the root has no dependents and the graph is acyclic.
    pub fn validate(&self) -> Result<()> {
        for (from, to) in self.edges() {
            if !self.contains(from) || !self.contains(to) {
                return Err(Error::Internal(format!(
                    "edge {} -> {} has a missing endpoint",
                    from, to
                )));
            }
        }
        if self.contains(id::ROOT) {
            let incoming = self.dependents(id::ROOT);
            if !incoming.is_empty() {
                return Err(Error::Internal(format!(
                    "root has incoming edges from {}",
                    incoming.join(", ")
                )));
            }
        }
        self.check_acyclic()
    }

    /// Fail with [`Error::Cycle`] listing one cycle per strongly connected component.
    pub fn check_acyclic(&self) -> Result<()> {
        let cycles = self.cycles();
        if cycles.is_empty() {
            Ok(())
        } else {
            Err(Error::Cycle(cycles))
        }
    }

    /// One concrete cycle per cyclic component, each starting at its smallest ID.
    pub fn cycles(&self) -> Vec<Vec<String>> {
        let mut cycles = Vec::new();
        for component in self.strongly_connected() {
            let start = &component[0];
            let is_cyclic = component.len() > 1 || self.has_edge(start, start);
            if !is_cyclic {
                continue;
            }
            let members: BTreeSet<&str> = component.iter().map(String::as_str).collect();
            if let Some(path) = self.path_back(start, &members) {
                cycles.push(path);
            }
        }
        cycles.sort();
        cycles
    }

    /// Tarjan's algorithm, iterative. Components are returned with sorted members.
    fn strongly_connected(&self) -> Vec<Vec<String>> {
        let mut index = 0usize;
        let mut indices: BTreeMap<&str, usize> = BTreeMap::new();
        let mut lowlink: BTreeMap<&str, usize> = BTreeMap::new();
        let mut on_stack: BTreeSet<&str> = BTreeSet::new();
        let mut stack: Vec<&str> = Vec::new();
        let mut components = Vec::new();

        for root in self.vertices.keys().map(String::as_str) {
            if indices.contains_key(root) {
                continue;
            }
            let mut frames = vec![self.enter(root, &mut index, &mut indices, &mut lowlink)];
            stack.push(root);
            on_stack.insert(root);

            while let Some(frame) = frames.last_mut() {
                let current = frame.id;
                if let Some(next) = frame.next.pop() {
                    if !indices.contains_key(next) {
                        frames.push(self.enter(next, &mut index, &mut indices, &mut lowlink));
                        stack.push(next);
                        on_stack.insert(next);
                    } else if on_stack.contains(next) {
                        let low = lowlink[current].min(indices[next]);
                        lowlink.insert(current, low);
                    }
                    continue;
                }

                frames.pop();
                if let Some(parent) = frames.last() {
                    let low = lowlink[parent.id].min(lowlink[current]);
                    lowlink.insert(parent.id, low);
                }
                if lowlink[current] == indices[current] {
                    let mut component = Vec::new();
                    while let Some(member) = stack.pop() {
                        on_stack.remove(member);
                        component.push(member.to_string());
                        if member == current {
                            break;
                        }
                    }
                    component.sort();
                    components.push(component);
                }
            }
        }

        components
    }

    fn enter<'a>(
        &'a self,
        id: &'a str,
        index: &mut usize,
        indices: &mut BTreeMap<&'a str, usize>,
        lowlink: &mut BTreeMap<&'a str, usize>,
    ) -> Frame<'a> {
        indices.insert(id, *index);
        lowlink.insert(id, *index);
        *index += 1;
        let mut next: Vec<&str> = self
            .edges
            .get(id)
            .map(|out| out.iter().map(String::as_str).collect())
            .unwrap_or_default();
        next.reverse();
        Frame { id, next }
    }

    /// Shortest path from `start` back to itself within `members` (BFS).
    fn path_back(&self, start: &str, members: &BTreeSet<&str>) -> Option<Vec<String>> {
        let mut previous: BTreeMap<&str, &str> = BTreeMap::new();
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(start);
        while let Some(current) = queue.pop_front() {
            let Some(out) = self.edges.get(current) else {
                continue;
            };
            for next in out.iter().map(String::as_str) {
                if !members.contains(next) {
                    continue;
                }
                if next == start {
                    let mut path = vec![current.to_string()];
                    let mut cursor = current;
                    while cursor != start {
                        cursor = previous[cursor];
                        path.push(cursor.to_string());
                    }
                    path.reverse();
                    return Some(path);
                }
                if next != start && !previous.contains_key(next) {
                    previous.insert(next, current);
                    queue.push_back(next);
                }
            }
        }
        None
    }
}

/// DFS frame for the iterative Tarjan walk.
struct Frame<'a> {
    id: &'a str,
    next: Vec<&'a str>,
}

impl<V: Serialize> Graph<V> {
    /// JSONL export: one `{"id","value"}` object per vertex, then one
    /// `{"source","destination"}` object per edge.
    pub fn to_jsonl(&self) -> Result<String> {
        #[derive(Serialize)]
        struct VertexLine<'a, V> {
            id: &'a str,
            value: &'a V,
        }
        #[derive(Serialize)]
        struct EdgeLine<'a> {
            source: &'a str,
            destination: &'a str,
        }

        let mut out = String::new();
        for (id, vertex) in &self.vertices {
            let line = serde_json::to_string(&VertexLine {
                id,
                value: &vertex.value,
            })
            .map_err(|e| Error::Internal(format!("cannot encode vertex {}: {}", id, e)))?;
            out.push_str(&line);
            out.push('\n');
        }
        for (source, destination) in self.edges() {
            let line = serde_json::to_string(&EdgeLine {
                source,
                destination,
            })
            .map_err(|e| Error::Internal(format!("cannot encode edge: {}", e)))?;
            out.push_str(&line);
            out.push('\n');
        }
        Ok(out)
    }
}

impl<V> Graph<V> {
    /// Graphviz export of the topology.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph convergent {\n");
        for id in self.ids() {
            let _ = writeln!(out, "  \"{}\" [label=\"{}\"];", id, id::segment(id));
        }
        for (from, to) in self.edges() {
            let _ = writeln!(out, "  \"{}\" -> \"{}\";", from, to);
        }
        out.push_str("}\n");
        out
    }
}
