//! Dependency graph
//!
//! A typed multigraph over task identifiers. Hard (`Blocks`) edges gate
//! readiness and are kept acyclic: every insertion runs a depth-first
//! reachability check and is rejected with the offending cycle path.
//! `Conflicts` edges exclude simultaneous execution of their endpoints;
//! soft edges (`Enables`, `Enhances`) only feed the priority engine.
//!
//! The graph itself stores no task state. Readiness queries take the
//! task table so the answer always reflects current statuses.

use crate::types::{
    DependencyEdge, DependencyKind, FabricError, FabricResult, Task, TaskId, TaskStatus,
};
use std::collections::{HashMap, HashSet, VecDeque};

/// Typed dependency multigraph keyed by task id
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    /// Edges indexed by their source (`from`)
    outgoing: HashMap<TaskId, Vec<DependencyEdge>>,
    /// Edges indexed by their target (`to`)
    incoming: HashMap<TaskId, Vec<DependencyEdge>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// All edges in the graph, unordered
    pub fn edges(&self) -> Vec<DependencyEdge> {
        self.outgoing.values().flatten().cloned().collect()
    }

    /// Insert a typed edge `from → to`.
    ///
    /// A `Blocks` edge that would close a cycle is rejected with
    /// `CycleDetected` and leaves the graph unchanged.
    pub fn add_edge(
        &mut self,
        from: TaskId,
        to: TaskId,
        kind: DependencyKind,
        optional: bool,
    ) -> FabricResult<()> {
        if from == to {
            return Err(FabricError::CycleDetected {
                path: vec![from, to],
            });
        }
        if kind.is_hard() {
            if let Some(mut path) = self.blocks_path(to, from) {
                // path runs to → … → from; close the loop at `to`
                path.push(to);
                return Err(FabricError::CycleDetected { path });
            }
        }
        let edge = DependencyEdge {
            from,
            to,
            kind,
            optional,
        };
        self.outgoing.entry(from).or_default().push(edge.clone());
        self.incoming.entry(to).or_default().push(edge);
        Ok(())
    }

    /// Remove every edge of the given kind between the two endpoints
    pub fn remove_edge(&mut self, from: TaskId, to: TaskId, kind: DependencyKind) {
        if let Some(edges) = self.outgoing.get_mut(&from) {
            edges.retain(|e| !(e.to == to && e.kind == kind));
        }
        if let Some(edges) = self.incoming.get_mut(&to) {
            edges.retain(|e| !(e.from == from && e.kind == kind));
        }
    }

    /// Remove a node and every edge touching it
    pub fn remove_node(&mut self, id: TaskId) {
        self.outgoing.remove(&id);
        self.incoming.remove(&id);
        for edges in self.outgoing.values_mut() {
            edges.retain(|e| e.to != id);
        }
        for edges in self.incoming.values_mut() {
            edges.retain(|e| e.from != id);
        }
    }

    /// True iff every incoming `Blocks` source is completed and no
    /// `Conflicts` sibling is currently running
    pub fn is_ready(&self, id: TaskId, tasks: &HashMap<TaskId, Task>) -> bool {
        self.blockers(id, tasks).is_empty()
    }

    /// The ids currently preventing readiness of `id`
    pub fn blockers(&self, id: TaskId, tasks: &HashMap<TaskId, Task>) -> Vec<TaskId> {
        let mut blocking = Vec::new();
        if let Some(edges) = self.incoming.get(&id) {
            for edge in edges {
                match edge.kind {
                    DependencyKind::Blocks => match tasks.get(&edge.from) {
                        Some(source) if source.status == TaskStatus::Completed => {}
                        Some(source)
                            if edge.optional && source.status == TaskStatus::Cancelled => {}
                        Some(_) => blocking.push(edge.from),
                        // Missing source: optional edges are ignored,
                        // mandatory ones keep blocking.
                        None if edge.optional => {}
                        None => blocking.push(edge.from),
                    },
                    DependencyKind::Conflicts => {
                        if let Some(other) = tasks.get(&edge.from) {
                            if other.status == TaskStatus::Running {
                                blocking.push(edge.from);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        // Conflicts are symmetric in effect: an outgoing conflict edge
        // with a running target also blocks us.
        if let Some(edges) = self.outgoing.get(&id) {
            for edge in edges {
                if edge.kind == DependencyKind::Conflicts {
                    if let Some(other) = tasks.get(&edge.to) {
                        if other.status == TaskStatus::Running {
                            blocking.push(edge.to);
                        }
                    }
                }
            }
        }
        blocking.sort();
        blocking.dedup();
        blocking
    }

    /// Length of the longest `Blocks` chain ending at `id`
    pub fn chain_length(&self, id: TaskId) -> usize {
        let mut memo = HashMap::new();
        self.chain_length_memo(id, &mut memo)
    }

    fn chain_length_memo(&self, id: TaskId, memo: &mut HashMap<TaskId, usize>) -> usize {
        if let Some(&len) = memo.get(&id) {
            return len;
        }
        // Mark in-progress to stay finite even if an inconsistent graph
        // slipped in through restored state.
        memo.insert(id, 0);
        let len = self
            .incoming
            .get(&id)
            .map(|edges| {
                edges
                    .iter()
                    .filter(|e| e.kind.is_hard())
                    .map(|e| 1 + self.chain_length_memo(e.from, memo))
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        memo.insert(id, len);
        len
    }

    /// All nodes connected to `id`, ignoring edge direction and kind
    pub fn connected_component(&self, id: TaskId) -> HashSet<TaskId> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([id]);
        while let Some(node) = queue.pop_front() {
            if !seen.insert(node) {
                continue;
            }
            if let Some(edges) = self.outgoing.get(&node) {
                queue.extend(edges.iter().map(|e| e.to));
            }
            if let Some(edges) = self.incoming.get(&node) {
                queue.extend(edges.iter().map(|e| e.from));
            }
        }
        seen
    }

    /// Dependents of `id` reachable through soft edges, with the edge
    /// kind — consumed by the priority engine on completion boosts
    pub fn soft_dependents(&self, id: TaskId) -> Vec<(TaskId, DependencyKind)> {
        self.outgoing
            .get(&id)
            .map(|edges| {
                edges
                    .iter()
                    .filter(|e| e.kind.is_soft())
                    .map(|e| (e.to, e.kind))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// DFS over `Blocks` edges from `start` towards `target`, returning
    /// the path when reachable
    fn blocks_path(&self, start: TaskId, target: TaskId) -> Option<Vec<TaskId>> {
        let mut stack = vec![(start, vec![start])];
        let mut visited = HashSet::new();
        while let Some((node, path)) = stack.pop() {
            if node == target {
                return Some(path);
            }
            if !visited.insert(node) {
                continue;
            }
            if let Some(edges) = self.outgoing.get(&node) {
                for edge in edges.iter().filter(|e| e.kind.is_hard()) {
                    let mut next_path = path.clone();
                    next_path.push(edge.to);
                    stack.push((edge.to, next_path));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Priority, PriorityFactors, TaskCategory, TaskMetrics};
    use chrono::Utc;
    use uuid::Uuid;

    fn task(id: TaskId, status: TaskStatus) -> Task {
        Task {
            id,
            title: "t".into(),
            description: "d".into(),
            category: TaskCategory::Feature,
            tags: vec![],
            base_priority: Priority::Medium,
            dynamic_priority: 500.0,
            boosted_tier: None,
            priority_factors: PriorityFactors::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            deadline: None,
            estimated_duration_ms: 1000,
            actual_duration_ms: None,
            timeout_ms: None,
            max_retries: 3,
            current_retries: 0,
            next_attempt_at: None,
            status,
            dependencies: vec![],
            dependents: vec![],
            required_resources: vec![],
            resource_constraints: Default::default(),
            pre_conditions: vec![],
            post_conditions: vec![],
            batch_compatible: false,
            batch_group: None,
            user_importance: 0.5,
            parent_task_id: None,
            last_error: None,
            retry_history: vec![],
            metrics: TaskMetrics::default(),
            metadata: Default::default(),
        }
    }

    #[test]
    fn test_cycle_rejected_and_graph_unchanged() {
        let mut graph = DependencyGraph::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        graph.add_edge(a, b, DependencyKind::Blocks, false).unwrap();
        let before = graph.edges();

        let err = graph
            .add_edge(b, a, DependencyKind::Blocks, false)
            .unwrap_err();
        match err {
            FabricError::CycleDetected { path } => {
                assert_eq!(path.first(), path.last());
                assert!(path.contains(&a) && path.contains(&b));
            }
            other => panic!("expected CycleDetected, got {other:?}"),
        }
        assert_eq!(graph.edges().len(), before.len());
    }

    #[test]
    fn test_self_edge_rejected() {
        let mut graph = DependencyGraph::new();
        let a = Uuid::new_v4();
        assert!(graph.add_edge(a, a, DependencyKind::Blocks, false).is_err());
    }

    #[test]
    fn test_soft_edges_never_cycle_check() {
        let mut graph = DependencyGraph::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        graph.add_edge(a, b, DependencyKind::Blocks, false).unwrap();
        // soft back-edge is fine
        graph
            .add_edge(b, a, DependencyKind::Enables, false)
            .unwrap();
        assert_eq!(graph.soft_dependents(b), vec![(a, DependencyKind::Enables)]);
    }

    #[test]
    fn test_readiness_follows_blocks_completion() {
        let mut graph = DependencyGraph::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        graph.add_edge(a, b, DependencyKind::Blocks, false).unwrap();

        let mut tasks = HashMap::new();
        tasks.insert(a, task(a, TaskStatus::Running));
        tasks.insert(b, task(b, TaskStatus::Pending));
        assert!(!graph.is_ready(b, &tasks));
        assert_eq!(graph.blockers(b, &tasks), vec![a]);

        tasks.get_mut(&a).unwrap().status = TaskStatus::Completed;
        assert!(graph.is_ready(b, &tasks));
    }

    #[test]
    fn test_conflicts_block_both_directions() {
        let mut graph = DependencyGraph::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        graph
            .add_edge(a, b, DependencyKind::Conflicts, false)
            .unwrap();

        let mut tasks = HashMap::new();
        tasks.insert(a, task(a, TaskStatus::Running));
        tasks.insert(b, task(b, TaskStatus::Queued));
        assert!(!graph.is_ready(b, &tasks));

        // and symmetrically
        tasks.get_mut(&a).unwrap().status = TaskStatus::Queued;
        tasks.get_mut(&b).unwrap().status = TaskStatus::Running;
        assert!(!graph.is_ready(a, &tasks));

        tasks.get_mut(&b).unwrap().status = TaskStatus::Completed;
        assert!(graph.is_ready(a, &tasks));
    }

    #[test]
    fn test_optional_edge_ignores_missing_and_cancelled_source() {
        let mut graph = DependencyGraph::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        graph.add_edge(a, b, DependencyKind::Blocks, true).unwrap();

        // source never submitted
        let mut tasks = HashMap::new();
        tasks.insert(b, task(b, TaskStatus::Pending));
        assert!(graph.is_ready(b, &tasks));

        // cancelled source also satisfies an optional edge
        tasks.insert(a, task(a, TaskStatus::Cancelled));
        assert!(graph.is_ready(b, &tasks));
    }

    #[test]
    fn test_chain_length() {
        let mut graph = DependencyGraph::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let d = Uuid::new_v4();
        graph.add_edge(a, b, DependencyKind::Blocks, false).unwrap();
        graph.add_edge(b, c, DependencyKind::Blocks, false).unwrap();
        graph.add_edge(a, c, DependencyKind::Blocks, false).unwrap();

        assert_eq!(graph.chain_length(a), 0);
        assert_eq!(graph.chain_length(b), 1);
        assert_eq!(graph.chain_length(c), 2);
        assert_eq!(graph.chain_length(d), 0);
    }

    #[test]
    fn test_connected_component() {
        let mut graph = DependencyGraph::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let lone = Uuid::new_v4();
        graph.add_edge(a, b, DependencyKind::Blocks, false).unwrap();
        graph
            .add_edge(c, b, DependencyKind::Enhances, false)
            .unwrap();

        let component = graph.connected_component(a);
        assert!(component.contains(&a) && component.contains(&b) && component.contains(&c));
        assert!(!component.contains(&lone));
    }

    #[test]
    fn test_remove_node_drops_all_edges() {
        let mut graph = DependencyGraph::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        graph.add_edge(a, b, DependencyKind::Blocks, false).unwrap();
        graph.add_edge(b, c, DependencyKind::Blocks, false).unwrap();

        graph.remove_node(b);
        assert!(graph.edges().iter().all(|e| e.from != b && e.to != b));
        // with b gone, a → c path no longer exists, so c → a is legal
        graph.add_edge(c, a, DependencyKind::Blocks, false).unwrap();
    }
}
