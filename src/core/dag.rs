//! Task graph (directed acyclic graph) for dependency management.
//!
//! An edge `from -> to` means `to` depends on `from`. Every mutation keeps
//! the edge relation acyclic: edge insertion runs a reachability check
//! before committing, and decomposition validates the replacement subgraph
//! before touching the live graph.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::DiGraph;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::Direction;
use serde_json::Value;
use tracing::{debug, info};

use crate::core::task::{CancelReason, TaskId, TaskKind, TaskNode, TaskState};
use crate::error::{Error, Result};
use crate::orchestration::Synthesizer;

/// Replacement for a single node, used by [`TaskGraph::decompose`].
///
/// External dependencies of the replaced node are rewired onto `entries`;
/// external dependents are rewired to depend on `exits`.
#[derive(Debug, Clone, Default)]
pub struct Subgraph {
    pub tasks: Vec<TaskNode>,
    pub edges: Vec<(TaskId, TaskId)>,
    pub entries: Vec<TaskId>,
    pub exits: Vec<TaskId>,
}

impl Subgraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task and return its id.
    pub fn add_task(&mut self, task: TaskNode) -> TaskId {
        let id = task.id;
        self.tasks.push(task);
        id
    }

    pub fn add_dependency(&mut self, from: TaskId, to: TaskId) {
        self.edges.push((from, to));
    }

    pub fn entry(&mut self, id: TaskId) {
        self.entries.push(id);
    }

    pub fn exit(&mut self, id: TaskId) {
        self.exits.push(id);
    }

    /// Build a linear chain where each task depends on the previous one.
    pub fn chain(tasks: Vec<TaskNode>) -> Self {
        let mut sub = Self::new();
        let ids: Vec<TaskId> = tasks.into_iter().map(|t| sub.add_task(t)).collect();
        for pair in ids.windows(2) {
            sub.add_dependency(pair[0], pair[1]);
        }
        if let (Some(first), Some(last)) = (ids.first(), ids.last()) {
            sub.entry(*first);
            sub.exit(*last);
        }
        sub
    }
}

/// Outcome of [`TaskGraph::synthesize`].
#[derive(Debug, Clone, PartialEq)]
pub enum Synthesis {
    /// Dependency results were attached and the task is ready to execute.
    Ready,
    /// A synthesis-only node folded its inputs into a result.
    Completed(Value),
    /// The synthesis function failed; the node and its dependents are done.
    Failed {
        error: String,
        cancelled: Vec<TaskId>,
    },
    /// Dependencies are not all completed, or the node is not pending.
    Waiting,
    /// Synthesis already ran for this node.
    AlreadyHandled,
}

/// Tasks whose state changed while propagating completions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Propagation {
    /// Executable tasks that became ready.
    pub ready: Vec<TaskId>,
    /// Synthesis-only nodes that completed.
    pub completed: Vec<TaskId>,
    /// Synthesis-only nodes that failed.
    pub failed: Vec<TaskId>,
    /// Tasks cancelled as a consequence of a failed synthesis.
    pub cancelled: Vec<TaskId>,
}

/// What happened after recording a failed execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The task went back to `Pending` and should be requeued after backoff.
    Retry { attempt: u32 },
    /// Retries are exhausted; these dependents were cancelled.
    Exhausted { cancelled: Vec<TaskId> },
}

/// The task dependency graph.
///
/// TaskGraph uses petgraph's `StableDiGraph` so node indices survive the
/// removals done by decomposition.
pub struct TaskGraph {
    graph: StableDiGraph<TaskNode, ()>,
    task_index: HashMap<TaskId, NodeIndex>,
    roots: Vec<TaskId>,
    synthesized: HashSet<TaskId>,
    /// Decomposed task -> its single exit.
    aliases: HashMap<TaskId, TaskId>,
    next_seq: u64,
}

impl TaskGraph {
    /// Create a new empty TaskGraph.
    pub fn new() -> Self {
        Self {
            graph: StableDiGraph::new(),
            task_index: HashMap::new(),
            roots: Vec::new(),
            synthesized: HashSet::new(),
            aliases: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Add a task to the graph.
    ///
    /// If the task already exists (same TaskId), returns the existing index.
    pub fn add_task(&mut self, mut task: TaskNode) -> NodeIndex {
        if let Some(&index) = self.task_index.get(&task.id) {
            return index;
        }

        task.seq = self.next_seq;
        self.next_seq += 1;
        let id = task.id;
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        index
    }

    /// Add a dependency: `to` depends on `from`.
    ///
    /// Rejected with [`Error::CycleDetected`] if `from` is reachable from
    /// `to`; a rejected edge leaves the graph untouched.
    pub fn add_dependency(&mut self, from: &TaskId, to: &TaskId) -> Result<()> {
        let from_index = self.index_of(from)?;
        let to_index = self.index_of(to)?;

        if from_index == to_index
            || has_path_connecting(&self.graph, to_index, from_index, None)
        {
            return Err(Error::CycleDetected {
                from: *from,
                to: *to,
            });
        }

        if self.graph.find_edge(from_index, to_index).is_none() {
            self.graph.add_edge(from_index, to_index, ());
        }
        Ok(())
    }

    /// Designate `id` as a root whose result is caller-visible.
    pub fn set_root(&mut self, id: &TaskId) -> Result<()> {
        self.index_of(id)?;
        if !self.roots.contains(id) {
            self.roots.push(*id);
        }
        Ok(())
    }

    /// The first designated root, if any.
    pub fn root(&self) -> Option<TaskId> {
        self.roots.first().copied()
    }

    pub fn roots(&self) -> &[TaskId] {
        &self.roots
    }

    /// Return the designated root, or infer it when the graph has exactly
    /// one task without dependents.
    pub fn resolve_root(&mut self) -> Result<TaskId> {
        if let Some(root) = self.root() {
            return Ok(root);
        }
        let sinks: Vec<TaskId> = self
            .all_tasks()
            .into_iter()
            .filter(|t| self.dependents(&t.id).is_empty())
            .map(|t| t.id)
            .collect();
        match sinks.as_slice() {
            [only] => {
                let only = *only;
                self.roots.push(only);
                Ok(only)
            }
            [] => Err(Error::Validation("graph is empty".to_string())),
            many => Err(Error::Validation(format!(
                "graph has {} sink tasks; designate a root",
                many.len()
            ))),
        }
    }

    /// Follow decomposition aliases to the task now standing in for `id`.
    ///
    /// A task decomposed into a subgraph with a single exit is represented
    /// by that exit.
    pub fn resolve(&self, id: &TaskId) -> TaskId {
        let mut current = *id;
        while let Some(next) = self.aliases.get(&current) {
            current = *next;
        }
        current
    }

    /// Get a reference to a task by its ID.
    pub fn get_task(&self, id: &TaskId) -> Option<&TaskNode> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    pub(crate) fn get_task_mut(&mut self, id: &TaskId) -> Option<&mut TaskNode> {
        let index = *self.task_index.get(id)?;
        self.graph.node_weight_mut(index)
    }

    fn task_mut(&mut self, id: &TaskId) -> Result<&mut TaskNode> {
        self.get_task_mut(id).ok_or(Error::TaskNotFound(*id))
    }

    fn index_of(&self, id: &TaskId) -> Result<NodeIndex> {
        self.task_index
            .get(id)
            .copied()
            .ok_or(Error::TaskNotFound(*id))
    }

    /// Get the number of tasks in the graph.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of dependencies (edges) in the graph.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn has_dependency(&self, from: &TaskId, to: &TaskId) -> bool {
        match (self.task_index.get(from), self.task_index.get(to)) {
            (Some(&f), Some(&t)) => self.graph.find_edge(f, t).is_some(),
            _ => false,
        }
    }

    /// All edges as `(from, to)` pairs, sorted.
    pub fn edges(&self) -> Vec<(TaskId, TaskId)> {
        let mut edges: Vec<(TaskId, TaskId)> = self
            .graph
            .edge_indices()
            .filter_map(|e| self.graph.edge_endpoints(e))
            .map(|(f, t)| (self.graph[f].id, self.graph[t].id))
            .collect();
        edges.sort();
        edges
    }

    /// Tasks that `id` depends on, in insertion order.
    pub fn dependencies(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Tasks that depend on `id`, in insertion order.
    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<TaskId> {
        let Some(&index) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut nodes: Vec<&TaskNode> = self
            .graph
            .neighbors_directed(index, direction)
            .filter_map(|n| self.graph.node_weight(n))
            .collect();
        nodes.sort_by_key(|t| t.seq);
        nodes.into_iter().map(|t| t.id).collect()
    }

    /// Get all tasks in insertion order.
    pub fn all_tasks(&self) -> Vec<&TaskNode> {
        let mut tasks: Vec<&TaskNode> = self.graph.node_weights().collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    /// Whether synthesis has already run for `id`.
    pub fn was_synthesized(&self, id: &TaskId) -> bool {
        self.synthesized.contains(id)
    }

    /// Move every task and edge of `other` into this graph.
    ///
    /// Fails without mutation if any task id is already present.
    pub fn absorb(&mut self, other: TaskGraph) -> Result<()> {
        if let Some(dup) = other.task_index.keys().find(|id| self.contains_task(id)) {
            return Err(Error::TaskExists(*dup));
        }

        let edges = other.edges();
        let roots = other.roots.clone();
        let mut tasks: Vec<TaskNode> = other.graph.node_weights().cloned().collect();
        tasks.sort_by_key(|t| t.seq);
        for task in tasks {
            self.add_task(task);
        }
        for (from, to) in edges {
            let f = self.index_of(&from)?;
            let t = self.index_of(&to)?;
            self.graph.add_edge(f, t, ());
        }
        for root in roots {
            if !self.roots.contains(&root) {
                self.roots.push(root);
            }
        }
        self.synthesized.extend(other.synthesized);
        self.aliases.extend(other.aliases);
        Ok(())
    }

    /// Get tasks in topological order (respecting dependencies).
    pub fn topological_order(&self) -> Result<Vec<&TaskNode>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let name = self
                .graph
                .node_weight(cycle.node_id())
                .map(|t| t.name.as_str())
                .unwrap_or("unknown");
            Error::Validation(format!("Cycle detected at task: {}", name))
        })?;

        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .collect())
    }

    // ========== Readiness ==========

    fn dependencies_completed(&self, id: &TaskId) -> bool {
        self.dependencies(id).iter().all(|dep| {
            self.get_task(dep)
                .map(|t| t.state == TaskState::Completed)
                .unwrap_or(false)
        })
    }

    /// Pending tasks whose dependencies are all completed.
    pub fn ready_tasks(&self) -> Vec<TaskId> {
        self.all_tasks()
            .into_iter()
            .filter(|t| t.state == TaskState::Pending && self.dependencies_completed(&t.id))
            .map(|t| t.id)
            .collect()
    }

    /// Results of `id`'s dependencies, in dependency insertion order.
    pub fn dependency_results(&self, id: &TaskId) -> Vec<Value> {
        self.dependencies(id)
            .iter()
            .map(|dep| {
                self.get_task(dep)
                    .and_then(|t| t.result.clone())
                    .unwrap_or(Value::Null)
            })
            .collect()
    }

    /// Check if every task has reached a terminal state.
    pub fn all_finished(&self) -> bool {
        self.graph.node_weights().all(|t| t.is_finished())
    }

    /// Count tasks that have not reached a terminal state.
    pub fn pending_count(&self) -> usize {
        self.graph.node_weights().filter(|t| !t.is_finished()).count()
    }

    // ========== Lifecycle Operations ==========

    /// Resolve a pending task whose dependencies have all completed.
    ///
    /// Synthesis-only nodes get their result from `synthesizer`; executable
    /// nodes get the dependency results attached and become `Ready`. Runs at
    /// most once per node.
    pub fn synthesize(&mut self, id: &TaskId, synthesizer: &dyn Synthesizer) -> Result<Synthesis> {
        let task = self.get_task(id).ok_or(Error::TaskNotFound(*id))?;
        if self.synthesized.contains(id) {
            return Ok(Synthesis::AlreadyHandled);
        }
        if task.state != TaskState::Pending || !self.dependencies_completed(id) {
            return Ok(Synthesis::Waiting);
        }
        let kind = task.kind;
        let inputs = self.dependency_results(id);
        self.synthesized.insert(*id);

        match kind {
            TaskKind::Execute => {
                self.task_mut(id)?.mark_ready(inputs)?;
                debug!(task_id = %id, "task ready");
                Ok(Synthesis::Ready)
            }
            TaskKind::Synthesis => match synthesizer.synthesize(*id, &inputs) {
                Ok(result) => {
                    let task = self.task_mut(id)?;
                    task.inputs = inputs;
                    task.complete(result.clone())?;
                    debug!(task_id = %id, "synthesized result");
                    Ok(Synthesis::Completed(result))
                }
                Err(error) => {
                    self.task_mut(id)?.fail(&error)?;
                    let cancelled = self.cancel_dependents(
                        id,
                        CancelReason::BlockedByFailedDependency { dependency: *id },
                    );
                    Ok(Synthesis::Failed { error, cancelled })
                }
            },
        }
    }

    /// Synthesize `seeds` and cascade through synthesis-only nodes that
    /// complete as a result.
    pub fn propagate(
        &mut self,
        seeds: Vec<TaskId>,
        synthesizer: &dyn Synthesizer,
    ) -> Result<Propagation> {
        let mut out = Propagation::default();
        let mut work: VecDeque<TaskId> = seeds.into();

        while let Some(id) = work.pop_front() {
            match self.synthesize(&id, synthesizer)? {
                Synthesis::Ready => out.ready.push(id),
                Synthesis::Completed(_) => {
                    out.completed.push(id);
                    work.extend(self.unblocked_dependents(&id));
                }
                Synthesis::Failed { cancelled, .. } => {
                    out.failed.push(id);
                    out.cancelled.extend(cancelled);
                }
                Synthesis::Waiting | Synthesis::AlreadyHandled => {}
            }
        }
        Ok(out)
    }

    /// Pending dependents of `id` whose dependencies are now all completed.
    fn unblocked_dependents(&self, id: &TaskId) -> Vec<TaskId> {
        self.dependents(id)
            .into_iter()
            .filter(|d| {
                self.get_task(d)
                    .map(|t| t.state == TaskState::Pending)
                    .unwrap_or(false)
                    && self.dependencies_completed(d)
            })
            .collect()
    }

    /// Move a task to a new lifecycle state.
    pub fn transition(&mut self, id: &TaskId, next: TaskState) -> Result<()> {
        self.task_mut(id)?.transition(next)
    }

    /// Record a successful execution.
    ///
    /// Returns the dependents that became unblocked, ready to be passed to
    /// [`TaskGraph::propagate`].
    pub fn complete_task(&mut self, id: &TaskId, result: Value) -> Result<Vec<TaskId>> {
        self.task_mut(id)?.complete(result)?;
        Ok(self.unblocked_dependents(id))
    }

    /// Record a failed execution.
    ///
    /// The task returns to `Pending` while `retry_count < max_retries`;
    /// otherwise it stays `Failed` and all unfinished dependents are
    /// cancelled with [`CancelReason::BlockedByFailedDependency`].
    pub fn fail_task(&mut self, id: &TaskId, error: &str, max_retries: u32) -> Result<FailureOutcome> {
        let task = self.task_mut(id)?;
        task.fail(error)?;
        if task.retry_count < max_retries {
            task.retry_count += 1;
            task.transition(TaskState::Pending)?;
            return Ok(FailureOutcome::Retry {
                attempt: task.retry_count,
            });
        }

        let cancelled = self.cancel_dependents(
            id,
            CancelReason::BlockedByFailedDependency { dependency: *id },
        );
        Ok(FailureOutcome::Exhausted { cancelled })
    }

    /// Make a task that is waiting out its retry backoff ready again.
    ///
    /// Returns `false` when the task was cancelled in the meantime.
    pub fn requeue(&mut self, id: &TaskId) -> Result<bool> {
        let task = self.task_mut(id)?;
        if matches!(task.state, TaskState::Cancelled { .. }) {
            return Ok(false);
        }
        task.transition(TaskState::Ready)?;
        Ok(true)
    }

    /// Cancel a task and, transitively, every unfinished dependent.
    ///
    /// Returns every task that moved to `Cancelled`, starting with `id`.
    /// Cancelling a finished task is a no-op.
    pub fn cancel(&mut self, id: &TaskId, reason: CancelReason) -> Result<Vec<TaskId>> {
        let task = self.task_mut(id)?;
        if task.is_finished() {
            return Ok(Vec::new());
        }
        task.cancel(reason)?;

        let mut cancelled = vec![*id];
        cancelled.extend(
            self.cancel_dependents(id, CancelReason::DependencyCancelled { dependency: *id }),
        );
        info!(task_id = %id, count = cancelled.len(), "cancelled tasks");
        Ok(cancelled)
    }

    fn cancel_dependents(&mut self, origin: &TaskId, reason: CancelReason) -> Vec<TaskId> {
        let mut cancelled = Vec::new();
        let mut seen = HashSet::new();
        let mut work: VecDeque<TaskId> = self.dependents(origin).into();

        while let Some(id) = work.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            let Some(task) = self.get_task_mut(&id) else {
                continue;
            };
            if task.is_finished() {
                continue;
            }
            if task.cancel(reason.clone()).is_ok() {
                cancelled.push(id);
            }
            work.extend(self.dependents(&id));
        }
        cancelled
    }

    /// Replace `id` with `sub`.
    ///
    /// Edges into `id` are rewired onto the subgraph's entries and edges out
    /// of `id` onto its exits. Everything is validated before the live graph
    /// is touched, so a rejected decomposition leaves no trace.
    pub fn decompose(&mut self, id: &TaskId, sub: Subgraph) -> Result<()> {
        let task = self.get_task(id).ok_or(Error::TaskNotFound(*id))?;
        if !matches!(
            task.state,
            TaskState::Pending | TaskState::Ready | TaskState::Scheduled
        ) {
            return Err(Error::Validation(format!(
                "cannot decompose task {} in state {}",
                id.short(),
                task.state
            )));
        }
        self.validate_subgraph(&sub)?;
        if self.roots.contains(id) && sub.exits.len() != 1 {
            return Err(Error::Validation(
                "decomposing a root requires exactly one exit".to_string(),
            ));
        }

        let dependencies = self.dependencies(id);
        let dependents = self.dependents(id);

        for task in sub.tasks {
            self.add_task(task);
        }
        // The live graph and the subgraph are both acyclic, and the
        // rewiring only routes existing paths through the subgraph, so
        // these insertions cannot close a cycle.
        for (from, to) in &sub.edges {
            self.add_dependency(from, to)?;
        }
        for dep in &dependencies {
            for entry in &sub.entries {
                self.add_dependency(dep, entry)?;
            }
        }
        for exit in &sub.exits {
            for dependent in &dependents {
                self.add_dependency(exit, dependent)?;
            }
        }

        let index = self.index_of(id)?;
        self.graph.remove_node(index);
        self.task_index.remove(id);
        self.synthesized.remove(id);
        if let [exit] = sub.exits.as_slice() {
            self.aliases.insert(*id, *exit);
        }
        for root in self.roots.iter_mut() {
            if *root == *id {
                *root = sub.exits[0];
            }
        }

        info!(task_id = %id, "decomposed task");
        Ok(())
    }

    fn validate_subgraph(&self, sub: &Subgraph) -> Result<()> {
        if sub.tasks.is_empty() || sub.entries.is_empty() || sub.exits.is_empty() {
            return Err(Error::Validation(
                "subgraph needs at least one task, entry and exit".to_string(),
            ));
        }

        let mut local: DiGraph<TaskId, ()> = DiGraph::new();
        let mut index = HashMap::new();
        for task in &sub.tasks {
            if self.contains_task(&task.id) {
                return Err(Error::TaskExists(task.id));
            }
            if task.state != TaskState::Pending {
                return Err(Error::Validation(format!(
                    "subgraph task {} must be pending",
                    task.id.short()
                )));
            }
            if index.insert(task.id, local.add_node(task.id)).is_some() {
                return Err(Error::TaskExists(task.id));
            }
        }

        for id in sub.entries.iter().chain(sub.exits.iter()) {
            if !index.contains_key(id) {
                return Err(Error::TaskNotFound(*id));
            }
        }

        for (from, to) in &sub.edges {
            let f = *index.get(from).ok_or(Error::TaskNotFound(*from))?;
            let t = *index.get(to).ok_or(Error::TaskNotFound(*to))?;
            if f == t || has_path_connecting(&local, t, f, None) {
                return Err(Error::CycleDetected {
                    from: *from,
                    to: *to,
                });
            }
            local.add_edge(f, t, ());
        }
        Ok(())
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .field("roots", &self.roots)
            .finish()
    }
}
