//! Dependency graph built on petgraph.
//!
//! Stores the task DAG with typed edges and answers the ordering queries the
//! scheduler needs: topological order, parallel groups, critical path, and
//! dependency impact. Nodes are opaque task ids; weights (priority, duration)
//! are supplied by the caller per query so the graph never duplicates task
//! state.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use tracing::debug;
use uuid::Uuid;

/// Kind of a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// The dependent cannot start before the dependency completes.
    Hard,
    /// Preferred ordering, never blocks dispatch.
    Soft,
    /// Scheduler hint: both tasks contend for the same resources.
    Resource,
    /// Scheduler hint: the tasks are temporally related.
    Temporal,
}

impl EdgeKind {
    /// Whether this edge participates in ordering queries
    /// (topological order, cycle detection, critical path).
    #[must_use]
    pub fn is_ordering(self) -> bool {
        matches!(self, Self::Hard | Self::Soft)
    }

    /// Whether this edge gates dispatch.
    #[must_use]
    pub fn is_blocking(self) -> bool {
        matches!(self, Self::Hard)
    }
}

/// A directed dependency between two tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    /// The task that depends on another.
    pub dependent: Uuid,
    /// The task being depended on.
    pub depends_on: Uuid,
    /// Edge kind.
    pub kind: EdgeKind,
}

impl DependencyEdge {
    /// Convenience constructor.
    #[must_use]
    pub fn new(dependent: Uuid, depends_on: Uuid, kind: EdgeKind) -> Self {
        Self {
            dependent,
            depends_on,
            kind,
        }
    }

    /// A hard (blocking) edge.
    #[must_use]
    pub fn hard(dependent: Uuid, depends_on: Uuid) -> Self {
        Self::new(dependent, depends_on, EdgeKind::Hard)
    }

    /// A soft (preference) edge.
    #[must_use]
    pub fn soft(dependent: Uuid, depends_on: Uuid) -> Self {
        Self::new(dependent, depends_on, EdgeKind::Soft)
    }
}

/// Incrementally maintained graph metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphMetadata {
    /// Number of task nodes.
    pub node_count: usize,
    /// Number of dependency edges.
    pub edge_count: usize,
    /// Whether the ordering edges (hard + soft) contain a cycle.
    pub has_cycles: bool,
    /// Number of hard dependency levels (depth of the DAG).
    pub max_depth: usize,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl Default for GraphMetadata {
    fn default() -> Self {
        Self {
            node_count: 0,
            edge_count: 0,
            has_cycles: false,
            max_depth: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Impact of a single task on the rest of the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyImpact {
    /// Tasks that directly depend on this one.
    pub direct_dependents: usize,
    /// Tasks that transitively (but not directly) depend on this one.
    pub indirect_dependents: usize,
    /// Direct + indirect dependents.
    pub total_impact: usize,
    /// Whether the task lies on the current critical path.
    pub on_critical_path: bool,
}

#[derive(Debug, Clone)]
struct NodeData {
    id: Uuid,
    /// Insertion sequence, used for deterministic tie-breaking.
    seq: u64,
}

/// Candidate entry for the priority-tiebroken Kahn queue.
///
/// Max-heap ordering: higher priority first, then earlier insertion.
#[derive(Debug, PartialEq, Eq)]
struct Candidate {
    priority: i64,
    seq: u64,
    idx: NodeIndex,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Dependency DAG over task ids.
///
/// Edges run from the dependency to the dependent, so traversal in edge
/// direction visits prerequisites first. Hard cycles are rejected at edge
/// insertion; soft cycles may be committed but poison ordering queries.
pub struct DependencyGraph {
    graph: DiGraph<NodeData, EdgeKind>,
    nodes: HashMap<Uuid, NodeIndex>,
    next_seq: u64,
    meta: GraphMetadata,
}

impl DependencyGraph {
    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            nodes: HashMap::new(),
            next_seq: 0,
            meta: GraphMetadata::default(),
        }
    }

    /// Insert a task node. Idempotent: returns `false` when the id is
    /// already present.
    pub fn add_task(&mut self, id: Uuid) -> bool {
        if self.nodes.contains_key(&id) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let idx = self.graph.add_node(NodeData { id, seq });
        self.nodes.insert(id, idx);
        debug!(task = %id, "added graph node");
        self.refresh();
        true
    }

    /// Remove a task node and every edge touching it.
    /// Returns `false` when the id is unknown.
    pub fn remove_task(&mut self, id: Uuid) -> bool {
        let Some(idx) = self.nodes.remove(&id) else {
            return false;
        };
        self.graph.remove_node(idx);
        // remove_node moves the last node into the freed slot
        self.nodes = self
            .graph
            .node_indices()
            .map(|i| (self.graph[i].id, i))
            .collect();
        debug!(task = %id, "removed graph node");
        self.refresh();
        true
    }

    /// Install a dependency edge, replacing any existing edge between the
    /// same pair.
    ///
    /// # Errors
    ///
    /// `UnknownTask` when either endpoint is missing; `CycleDetected` when a
    /// hard edge would close a hard cycle (the graph is left untouched).
    pub fn add_dependency(&mut self, edge: DependencyEdge) -> Result<()> {
        let dependent = self.index_of(edge.dependent)?;
        let depends_on = self.index_of(edge.depends_on)?;

        if edge.kind == EdgeKind::Hard {
            if edge.dependent == edge.depends_on {
                return Err(Error::CycleDetected {
                    cycle: vec![edge.dependent],
                });
            }
            // A hard path dependent -> ... -> depends_on would be closed
            // into a cycle by the new edge.
            if let Some(path) = self.hard_path(dependent, depends_on) {
                let cycle = path.into_iter().map(|i| self.graph[i].id).collect();
                return Err(Error::CycleDetected { cycle });
            }
        }

        if let Some(existing) = self.graph.find_edge(depends_on, dependent) {
            self.graph.remove_edge(existing);
        }
        self.graph.add_edge(depends_on, dependent, edge.kind);
        debug!(
            dependent = %edge.dependent,
            depends_on = %edge.depends_on,
            kind = ?edge.kind,
            "added dependency edge"
        );
        self.refresh();
        Ok(())
    }

    /// Remove the edge between a pair, if present. No-op when absent.
    pub fn remove_dependency(&mut self, dependent: Uuid, depends_on: Uuid) -> bool {
        let (Some(&dep_idx), Some(&on_idx)) =
            (self.nodes.get(&dependent), self.nodes.get(&depends_on))
        else {
            return false;
        };
        let Some(edge) = self.graph.find_edge(on_idx, dep_idx) else {
            return false;
        };
        self.graph.remove_edge(edge);
        self.refresh();
        true
    }

    /// Whether the graph contains the task.
    #[must_use]
    pub fn contains(&self, id: Uuid) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Number of task nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Whether the graph is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Current graph metadata.
    #[must_use]
    pub fn metadata(&self) -> &GraphMetadata {
        &self.meta
    }

    /// All task ids, in insertion order.
    #[must_use]
    pub fn task_ids(&self) -> Vec<Uuid> {
        let mut nodes: Vec<&NodeData> = self.graph.node_weights().collect();
        nodes.sort_by_key(|n| n.seq);
        nodes.into_iter().map(|n| n.id).collect()
    }

    /// All edges, suitable for snapshotting.
    #[must_use]
    pub fn edges(&self) -> Vec<DependencyEdge> {
        let mut edges: Vec<DependencyEdge> = self
            .graph
            .edge_references()
            .map(|e| DependencyEdge {
                dependent: self.graph[e.target()].id,
                depends_on: self.graph[e.source()].id,
                kind: *e.weight(),
            })
            .collect();
        edges.sort_by_key(|e| (e.depends_on, e.dependent));
        edges
    }

    /// Direct dependencies of a task, with edge kinds.
    #[must_use]
    pub fn dependencies_of(&self, id: Uuid) -> Vec<(Uuid, EdgeKind)> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct dependents of a task, with edge kinds.
    #[must_use]
    pub fn dependents_of(&self, id: Uuid) -> Vec<(Uuid, EdgeKind)> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Direct hard dependencies of a task.
    #[must_use]
    pub fn hard_dependencies_of(&self, id: Uuid) -> Vec<Uuid> {
        self.dependencies_of(id)
            .into_iter()
            .filter(|(_, kind)| kind.is_blocking())
            .map(|(id, _)| id)
            .collect()
    }

    /// Direct hard dependents of a task.
    #[must_use]
    pub fn hard_dependents_of(&self, id: Uuid) -> Vec<Uuid> {
        self.dependents_of(id)
            .into_iter()
            .filter(|(_, kind)| kind.is_blocking())
            .map(|(id, _)| id)
            .collect()
    }

    /// Topological order over ordering edges (hard + soft), ties broken by
    /// descending priority as supplied by `priority_of`, then insertion
    /// order for determinism.
    ///
    /// # Errors
    ///
    /// `CycleDetected` when the ordering edges contain a cycle.
    pub fn topological_order(&self, priority_of: impl Fn(Uuid) -> i64) -> Result<Vec<Uuid>> {
        let mut in_degree: HashMap<NodeIndex, usize> =
            self.graph.node_indices().map(|i| (i, 0)).collect();
        for edge in self.graph.edge_references() {
            if edge.weight().is_ordering() {
                *in_degree.entry(edge.target()).or_default() += 1;
            }
        }

        let mut heap = BinaryHeap::new();
        for (&idx, &deg) in &in_degree {
            if deg == 0 {
                heap.push(self.candidate(idx, &priority_of));
            }
        }

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(Candidate { idx, .. }) = heap.pop() {
            order.push(self.graph[idx].id);
            for edge in self.graph.edges_directed(idx, Direction::Outgoing) {
                if !edge.weight().is_ordering() {
                    continue;
                }
                let target = edge.target();
                let deg = in_degree
                    .get_mut(&target)
                    .expect("edge target is a known node");
                *deg -= 1;
                if *deg == 0 {
                    heap.push(self.candidate(target, &priority_of));
                }
            }
        }

        if order.len() < self.graph.node_count() {
            return Err(Error::CycleDetected {
                cycle: self.find_cycle().unwrap_or_default(),
            });
        }
        Ok(order)
    }

    /// Partition tasks into ordered groups where every hard dependency of a
    /// task lives in a strictly earlier group. Exposes maximum parallelism.
    #[must_use]
    pub fn parallel_groups(&self) -> Vec<Vec<Uuid>> {
        let mut in_degree: HashMap<NodeIndex, usize> =
            self.graph.node_indices().map(|i| (i, 0)).collect();
        for edge in self.graph.edge_references() {
            if edge.weight().is_blocking() {
                *in_degree.entry(edge.target()).or_default() += 1;
            }
        }

        let mut level: HashMap<NodeIndex, usize> = HashMap::new();
        let mut queue: VecDeque<NodeIndex> = VecDeque::new();
        for (&idx, &deg) in &in_degree {
            if deg == 0 {
                level.insert(idx, 0);
                queue.push_back(idx);
            }
        }

        while let Some(idx) = queue.pop_front() {
            let next_level = level[&idx] + 1;
            for edge in self.graph.edges_directed(idx, Direction::Outgoing) {
                if !edge.weight().is_blocking() {
                    continue;
                }
                let target = edge.target();
                let entry = level.entry(target).or_insert(0);
                *entry = (*entry).max(next_level);
                let deg = in_degree
                    .get_mut(&target)
                    .expect("edge target is a known node");
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(target);
                }
            }
        }

        let depth = level.values().copied().max().map_or(0, |d| d + 1);
        let mut groups: Vec<Vec<NodeIndex>> = vec![Vec::new(); depth];
        for (idx, lvl) in level {
            groups[lvl].push(idx);
        }
        groups
            .into_iter()
            .map(|mut group| {
                group.sort_by_key(|&i| self.graph[i].seq);
                group.into_iter().map(|i| self.graph[i].id).collect()
            })
            .collect()
    }

    /// Longest-duration chain over ordering edges, using `duration_of`
    /// (clamped to at least 1) as the per-task weight. Returns the chain in
    /// execution order, or an empty list when the graph is cyclic.
    #[must_use]
    pub fn critical_path(&self, duration_of: impl Fn(Uuid) -> u64) -> Vec<Uuid> {
        if self.meta.has_cycles {
            return Vec::new();
        }
        let Ok(order) = self.topological_order(|_| 0) else {
            return Vec::new();
        };

        let mut dist: HashMap<Uuid, u64> = HashMap::new();
        let mut pred: HashMap<Uuid, Uuid> = HashMap::new();
        for &id in &order {
            let own = duration_of(id).max(1);
            let mut best: Option<(u64, Uuid)> = None;
            for (dep, kind) in self.dependencies_of(id) {
                if !kind.is_ordering() {
                    continue;
                }
                let through = dist.get(&dep).copied().unwrap_or(0);
                if best.is_none_or(|(d, _)| through > d) {
                    best = Some((through, dep));
                }
            }
            match best {
                Some((through, dep)) => {
                    dist.insert(id, through + own);
                    pred.insert(id, dep);
                }
                None => {
                    dist.insert(id, own);
                }
            }
        }

        let Some(end) = dist
            .iter()
            .max_by_key(|(id, d)| (**d, std::cmp::Reverse(**id)))
            .map(|(id, _)| *id)
        else {
            return Vec::new();
        };
        let mut path = vec![end];
        let mut cursor = end;
        while let Some(&prev) = pred.get(&cursor) {
            path.push(prev);
            cursor = prev;
        }
        path.reverse();
        path
    }

    /// Direct/transitive dependents of a task and whether it lies on the
    /// critical path.
    ///
    /// # Errors
    ///
    /// `UnknownTask` when the id is not in the graph.
    pub fn dependency_impact(
        &self,
        id: Uuid,
        duration_of: impl Fn(Uuid) -> u64,
    ) -> Result<DependencyImpact> {
        let idx = self.index_of(id)?;

        let direct: HashSet<NodeIndex> = self
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .map(|e| e.target())
            .collect();

        let mut all: HashSet<NodeIndex> = HashSet::new();
        let mut stack: Vec<NodeIndex> = direct.iter().copied().collect();
        while let Some(node) = stack.pop() {
            if !all.insert(node) {
                continue;
            }
            for edge in self.graph.edges_directed(node, Direction::Outgoing) {
                stack.push(edge.target());
            }
        }

        let direct_dependents = direct.len();
        let total_impact = all.len();
        Ok(DependencyImpact {
            direct_dependents,
            indirect_dependents: total_impact - direct_dependents,
            total_impact,
            on_critical_path: self.critical_path(duration_of).contains(&id),
        })
    }

    /// Find a cycle among ordering edges by iterative DFS with
    /// white/gray/black coloring. Returns the offending chain, if any.
    #[must_use]
    pub fn find_cycle(&self) -> Option<Vec<Uuid>> {
        const WHITE: u8 = 0;
        const GRAY: u8 = 1;
        const BLACK: u8 = 2;

        let n = self.graph.node_count();
        let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];
        for edge in self.graph.edge_references() {
            if edge.weight().is_ordering() {
                adj[edge.source().index()].push(edge.target().index());
            }
        }

        let mut color = vec![WHITE; n];
        for start in 0..n {
            if color[start] != WHITE {
                continue;
            }
            // (node, cursor into its adjacency list)
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            color[start] = GRAY;
            while let Some(frame) = stack.last_mut() {
                let node = frame.0;
                let cursor = frame.1;
                if cursor < adj[node].len() {
                    frame.1 += 1;
                    let next = adj[node][cursor];
                    if color[next] == WHITE {
                        color[next] = GRAY;
                        stack.push((next, 0));
                    } else if color[next] == GRAY {
                        // Back-edge to a node on the recursion stack:
                        // the slice from it onward is the cycle.
                        let pos = stack
                            .iter()
                            .position(|&(n, _)| n == next)
                            .unwrap_or(stack.len() - 1);
                        return Some(
                            stack[pos..]
                                .iter()
                                .map(|&(n, _)| self.graph[NodeIndex::new(n)].id)
                                .collect(),
                        );
                    }
                } else {
                    color[node] = BLACK;
                    stack.pop();
                }
            }
        }
        None
    }

    fn index_of(&self, id: Uuid) -> Result<NodeIndex> {
        self.nodes
            .get(&id)
            .copied()
            .ok_or(Error::UnknownTask { task: id })
    }

    fn neighbors(&self, id: Uuid, dir: Direction) -> Vec<(Uuid, EdgeKind)> {
        let Some(&idx) = self.nodes.get(&id) else {
            return Vec::new();
        };
        let mut out: Vec<(u64, Uuid, EdgeKind)> = self
            .graph
            .edges_directed(idx, dir)
            .map(|e| {
                let other = if dir == Direction::Incoming {
                    e.source()
                } else {
                    e.target()
                };
                (self.graph[other].seq, self.graph[other].id, *e.weight())
            })
            .collect();
        out.sort_by_key(|&(seq, _, _)| seq);
        out.into_iter().map(|(_, id, kind)| (id, kind)).collect()
    }

    fn candidate(&self, idx: NodeIndex, priority_of: &impl Fn(Uuid) -> i64) -> Candidate {
        let node = &self.graph[idx];
        Candidate {
            priority: priority_of(node.id),
            seq: node.seq,
            idx,
        }
    }

    /// Search for a hard-edge path `from -> ... -> to`.
    fn hard_path(&self, from: NodeIndex, to: NodeIndex) -> Option<Vec<NodeIndex>> {
        let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut seen: HashSet<NodeIndex> = HashSet::from([from]);
        let mut stack = vec![from];
        while let Some(node) = stack.pop() {
            if node == to {
                let mut path = vec![to];
                let mut cursor = to;
                while let Some(&prev) = parent.get(&cursor) {
                    path.push(prev);
                    cursor = prev;
                }
                path.reverse();
                return Some(path);
            }
            for edge in self.graph.edges_directed(node, Direction::Outgoing) {
                if !edge.weight().is_blocking() {
                    continue;
                }
                let target = edge.target();
                if seen.insert(target) {
                    parent.insert(target, node);
                    stack.push(target);
                }
            }
        }
        None
    }

    fn refresh(&mut self) {
        self.meta.node_count = self.graph.node_count();
        self.meta.edge_count = self.graph.edge_count();
        self.meta.has_cycles = self.find_cycle().is_some();
        self.meta.max_depth = self.parallel_groups().len();
        self.meta.updated_at = Utc::now();
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    fn graph_with(n: usize) -> (DependencyGraph, Vec<Uuid>) {
        let mut graph = DependencyGraph::new();
        let ids = ids(n);
        for &id in &ids {
            graph.add_task(id);
        }
        (graph, ids)
    }

    #[test]
    fn add_task_is_idempotent() {
        let mut graph = DependencyGraph::new();
        let id = Uuid::new_v4();
        assert!(graph.add_task(id));
        assert!(!graph.add_task(id));
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn add_dependency_rejects_unknown_endpoints() {
        let (mut graph, ids) = graph_with(1);
        let missing = Uuid::new_v4();
        let err = graph
            .add_dependency(DependencyEdge::hard(ids[0], missing))
            .unwrap_err();
        assert_eq!(err, Error::UnknownTask { task: missing });
    }

    #[test]
    fn hard_cycle_is_rejected_and_graph_left_intact() {
        // A -> B -> C, then C -> A must fail; the two edges survive.
        let (mut graph, ids) = graph_with(3);
        let (a, b, c) = (ids[0], ids[1], ids[2]);
        graph.add_dependency(DependencyEdge::hard(b, a)).unwrap();
        graph.add_dependency(DependencyEdge::hard(c, b)).unwrap();

        let err = graph
            .add_dependency(DependencyEdge::hard(a, c))
            .unwrap_err();
        assert!(matches!(err, Error::CycleDetected { .. }));

        assert_eq!(graph.metadata().edge_count, 2);
        assert!(!graph.metadata().has_cycles);
        let order = graph.topological_order(|_| 0).unwrap();
        assert_eq!(order, vec![a, b, c]);
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let (mut graph, ids) = graph_with(1);
        let err = graph
            .add_dependency(DependencyEdge::hard(ids[0], ids[0]))
            .unwrap_err();
        assert_eq!(
            err,
            Error::CycleDetected {
                cycle: vec![ids[0]]
            }
        );
    }

    #[test]
    fn edge_between_same_pair_is_replaced() {
        let (mut graph, ids) = graph_with(2);
        graph
            .add_dependency(DependencyEdge::hard(ids[1], ids[0]))
            .unwrap();
        graph
            .add_dependency(DependencyEdge::soft(ids[1], ids[0]))
            .unwrap();
        assert_eq!(graph.metadata().edge_count, 1);
        assert_eq!(graph.dependencies_of(ids[1]), vec![(ids[0], EdgeKind::Soft)]);
    }

    #[test]
    fn add_then_remove_dependency_is_identity() {
        let (mut graph, ids) = graph_with(2);
        let before = graph.edges();
        graph
            .add_dependency(DependencyEdge::hard(ids[1], ids[0]))
            .unwrap();
        assert!(graph.remove_dependency(ids[1], ids[0]));
        assert_eq!(graph.edges(), before);
        assert!(!graph.remove_dependency(ids[1], ids[0]));
    }

    #[test]
    fn remove_task_drops_incident_edges() {
        let (mut graph, ids) = graph_with(3);
        graph
            .add_dependency(DependencyEdge::hard(ids[1], ids[0]))
            .unwrap();
        graph
            .add_dependency(DependencyEdge::hard(ids[2], ids[1]))
            .unwrap();
        assert!(graph.remove_task(ids[1]));
        assert_eq!(graph.metadata().edge_count, 0);
        assert_eq!(graph.len(), 2);
        assert!(graph.contains(ids[0]));
        assert!(graph.contains(ids[2]));
    }

    #[test]
    fn soft_cycle_commits_but_poisons_ordering() {
        let (mut graph, ids) = graph_with(2);
        graph
            .add_dependency(DependencyEdge::soft(ids[1], ids[0]))
            .unwrap();
        graph
            .add_dependency(DependencyEdge::soft(ids[0], ids[1]))
            .unwrap();
        assert!(graph.metadata().has_cycles);
        assert!(graph.topological_order(|_| 0).is_err());
        assert!(graph.critical_path(|_| 1).is_empty());
    }

    #[test]
    fn topological_order_breaks_ties_by_priority() {
        let (mut graph, ids) = graph_with(3);
        let priorities: HashMap<Uuid, i64> =
            [(ids[0], 100), (ids[1], 900), (ids[2], 500)].into();
        let order = graph
            .topological_order(|id| priorities[&id])
            .unwrap();
        assert_eq!(order, vec![ids[1], ids[2], ids[0]]);
    }

    #[test]
    fn parallel_groups_layer_diamond() {
        //     A
        //    / \
        //   B   C
        //    \ /
        //     D
        let (mut graph, ids) = graph_with(4);
        let (a, b, c, d) = (ids[0], ids[1], ids[2], ids[3]);
        graph.add_dependency(DependencyEdge::hard(b, a)).unwrap();
        graph.add_dependency(DependencyEdge::hard(c, a)).unwrap();
        graph.add_dependency(DependencyEdge::hard(d, b)).unwrap();
        graph.add_dependency(DependencyEdge::hard(d, c)).unwrap();

        let groups = graph.parallel_groups();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0], vec![a]);
        assert_eq!(groups[1], vec![b, c]);
        assert_eq!(groups[2], vec![d]);
        assert_eq!(graph.metadata().max_depth, 3);
    }

    #[test]
    fn soft_edges_do_not_gate_parallel_groups() {
        let (mut graph, ids) = graph_with(2);
        graph
            .add_dependency(DependencyEdge::soft(ids[1], ids[0]))
            .unwrap();
        let groups = graph.parallel_groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 2);
    }

    #[test]
    fn critical_path_follows_longest_duration_chain() {
        // A -> B -> D (durations 10 + 10 + 10)
        // C -> D      (duration 50 + 10): the heavier chain wins.
        let (mut graph, ids) = graph_with(4);
        let (a, b, c, d) = (ids[0], ids[1], ids[2], ids[3]);
        graph.add_dependency(DependencyEdge::hard(b, a)).unwrap();
        graph.add_dependency(DependencyEdge::hard(d, b)).unwrap();
        graph.add_dependency(DependencyEdge::hard(d, c)).unwrap();

        let durations: HashMap<Uuid, u64> = [(a, 10), (b, 10), (c, 50), (d, 10)].into();
        let path = graph.critical_path(|id| durations[&id]);
        assert_eq!(path, vec![c, d]);
    }

    #[test]
    fn critical_path_of_linear_chain_is_the_chain() {
        let (mut graph, ids) = graph_with(3);
        graph
            .add_dependency(DependencyEdge::hard(ids[1], ids[0]))
            .unwrap();
        graph
            .add_dependency(DependencyEdge::hard(ids[2], ids[1]))
            .unwrap();
        let path = graph.critical_path(|_| 10);
        assert_eq!(path, vec![ids[0], ids[1], ids[2]]);
    }

    #[test]
    fn dependency_impact_counts_transitive_dependents() {
        let (mut graph, ids) = graph_with(4);
        let (a, b, c, d) = (ids[0], ids[1], ids[2], ids[3]);
        graph.add_dependency(DependencyEdge::hard(b, a)).unwrap();
        graph.add_dependency(DependencyEdge::hard(c, b)).unwrap();
        graph.add_dependency(DependencyEdge::soft(d, a)).unwrap();

        let impact = graph.dependency_impact(a, |_| 1).unwrap();
        assert_eq!(impact.direct_dependents, 2);
        assert_eq!(impact.indirect_dependents, 1);
        assert_eq!(impact.total_impact, 3);
        assert!(impact.on_critical_path);

        assert!(graph.dependency_impact(Uuid::new_v4(), |_| 1).is_err());
    }

    #[test]
    fn empty_graph_queries() {
        let graph = DependencyGraph::new();
        assert!(graph.is_empty());
        assert!(graph.parallel_groups().is_empty());
        assert!(graph.critical_path(|_| 1).is_empty());
        assert!(graph.topological_order(|_| 0).unwrap().is_empty());
        assert!(!graph.metadata().has_cycles);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Random hard-edge insertion never commits a cycle: every
            /// accepted graph stays acyclic and topologically orderable.
            #[test]
            fn hard_edges_never_commit_a_cycle(
                edges in proptest::collection::vec((0usize..8, 0usize..8), 0..40)
            ) {
                let (mut graph, ids) = graph_with(8);
                for (from, to) in edges {
                    let _ = graph.add_dependency(DependencyEdge::hard(ids[from], ids[to]));
                    prop_assert!(!graph.metadata().has_cycles);
                }
                let order = graph.topological_order(|_| 0).unwrap();
                let position: HashMap<Uuid, usize> = order
                    .iter()
                    .enumerate()
                    .map(|(i, id)| (*id, i))
                    .collect();
                for edge in graph.edges() {
                    prop_assert!(position[&edge.depends_on] < position[&edge.dependent]);
                }
            }

            /// Install-then-remove is the identity on the edge set.
            #[test]
            fn add_remove_is_identity(from in 0usize..5, to in 0usize..5) {
                prop_assume!(from != to);
                let (mut graph, ids) = graph_with(5);
                let before = graph.edges();
                graph
                    .add_dependency(DependencyEdge::hard(ids[from], ids[to]))
                    .unwrap();
                graph.remove_dependency(ids[from], ids[to]);
                prop_assert_eq!(graph.edges(), before);
            }
        }
    }

    #[test]
    fn hard_edges_report_blocking_dependencies() {
        let (mut graph, ids) = graph_with(3);
        graph
            .add_dependency(DependencyEdge::hard(ids[2], ids[0]))
            .unwrap();
        graph
            .add_dependency(DependencyEdge::soft(ids[2], ids[1]))
            .unwrap();
        assert_eq!(graph.hard_dependencies_of(ids[2]), vec![ids[0]]);
        assert_eq!(graph.hard_dependents_of(ids[0]), vec![ids[2]]);
        assert!(graph.hard_dependents_of(ids[1]).is_empty());
    }
}
