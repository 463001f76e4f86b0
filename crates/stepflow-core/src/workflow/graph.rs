use serde::{Deserialize, Serialize};

use super::connection::Connection;
use super::metadata::{MetadataPatch, WorkflowMetadata};
use super::step::{Step, StepPatch, StepSpec};
use crate::types::{ConnectionId, StepId, WorkflowId};

/// The editable working copy of a workflow.
///
/// Mutations never reject structurally invalid input: dangling connections,
/// cycles and blank fields are all accepted so a graph can be assembled in
/// any order. `validation::validate` reports what is wrong before a save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowGraph {
    pub id: WorkflowId,
    pub metadata: WorkflowMetadata,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

impl Default for WorkflowGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowGraph {
    /// An empty graph with a fresh workflow id.
    pub fn new() -> Self {
        Self {
            id: WorkflowId::new(),
            metadata: WorkflowMetadata::default(),
            steps: Vec::new(),
            connections: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.metadata.name = name.into();
        self
    }

    pub fn with_id(mut self, id: impl Into<WorkflowId>) -> Self {
        self.id = id.into();
        self
    }

    // --- steps ---

    /// Append a step and return its id.
    pub fn add_step(&mut self, spec: StepSpec) -> StepId {
        let step = spec.into_step(self.steps.len() as u32 + 1);
        let id = step.id.clone();
        self.steps.push(step);
        id
    }

    /// Returns false if no step has this id.
    pub fn update_step(&mut self, id: &StepId, patch: StepPatch) -> bool {
        match self.steps.iter_mut().find(|s| &s.id == id) {
            Some(step) => {
                patch.apply(step);
                true
            }
            None => false,
        }
    }

    /// Remove a step with its incident connections and checkpoint entry.
    pub fn remove_step(&mut self, id: &StepId) -> bool {
        let before = self.steps.len();
        self.steps.retain(|s| &s.id != id);
        if self.steps.len() == before {
            return false;
        }
        self.connections.retain(|c| &c.from != id && &c.to != id);
        self.metadata.hitl_checkpoints.remove(id);
        self.resequence();
        true
    }

    /// Move the step at `from_index` to `to_index`. Connections are untouched.
    pub fn reorder_steps(&mut self, from_index: usize, to_index: usize) -> bool {
        if from_index >= self.steps.len() || to_index >= self.steps.len() {
            return false;
        }
        let step = self.steps.remove(from_index);
        self.steps.insert(to_index, step);
        self.resequence();
        true
    }

    fn resequence(&mut self) {
        for (index, step) in self.steps.iter_mut().enumerate() {
            step.order = index as u32 + 1;
        }
    }

    pub fn step(&self, id: &StepId) -> Option<&Step> {
        self.steps.iter().find(|s| &s.id == id)
    }

    pub fn contains_step(&self, id: &StepId) -> bool {
        self.step(id).is_some()
    }

    // --- connections ---

    pub fn add_connection(
        &mut self,
        from: impl Into<StepId>,
        to: impl Into<StepId>,
        condition: Option<&str>,
    ) -> ConnectionId {
        self.push_connection(Connection::new(from, to, condition))
    }

    /// Add a bounded loop-back edge from `from` to an upstream step `to`.
    pub fn add_loop_connection(
        &mut self,
        from: impl Into<StepId>,
        to: impl Into<StepId>,
        condition: Option<&str>,
        max_iterations: u32,
    ) -> ConnectionId {
        self.push_connection(Connection::loop_back(from, to, condition, max_iterations))
    }

    fn push_connection(&mut self, connection: Connection) -> ConnectionId {
        let id = connection.id.clone();
        self.connections.push(connection);
        id
    }

    pub fn remove_connection(&mut self, id: &ConnectionId) -> bool {
        let before = self.connections.len();
        self.connections.retain(|c| &c.id != id);
        self.connections.len() != before
    }

    pub fn connection(&self, id: &ConnectionId) -> Option<&Connection> {
        self.connections.iter().find(|c| &c.id == id)
    }

    /// All edges leaving `step`, loop-backs included.
    pub fn outgoing<'a>(&'a self, step: &'a StepId) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections.iter().filter(move |c| &c.from == step)
    }

    /// Forward (non loop-back) edges entering `step`.
    pub fn incoming_forward<'a>(
        &'a self,
        step: &'a StepId,
    ) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections
            .iter()
            .filter(move |c| &c.to == step && !c.is_loop_back())
    }

    // --- metadata ---

    pub fn update_metadata(&mut self, patch: MetadataPatch) {
        patch.apply(&mut self.metadata);
    }

    /// Flag a step as a HITL checkpoint. Returns false for unknown steps.
    pub fn add_hitl_checkpoint(&mut self, id: &StepId) -> bool {
        if !self.contains_step(id) {
            return false;
        }
        self.metadata.hitl_checkpoints.insert(id.clone());
        true
    }

    pub fn remove_hitl_checkpoint(&mut self, id: &StepId) -> bool {
        self.metadata.hitl_checkpoints.remove(id)
    }

    /// Whether a step pauses for a human decision: listed as a checkpoint and
    /// not in fully-AI mode.
    pub fn is_checkpoint(&self, id: &StepId) -> bool {
        self.metadata.hitl_checkpoints.contains(id)
            && self.step(id).is_some_and(|s| s.hitl_mode.is_supervised())
    }

    /// Clear every step, connection and setting, keeping the workflow id.
    pub fn reset(&mut self) {
        self.steps.clear();
        self.connections.clear();
        self.metadata = WorkflowMetadata::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HitlMode;

    fn three_steps() -> (WorkflowGraph, StepId, StepId, StepId) {
        let mut g = WorkflowGraph::new().with_name("Onboarding");
        let a = g.add_step(StepSpec::new("agent-a", "Intake"));
        let b = g.add_step(StepSpec::new("agent-b", "Review"));
        let c = g.add_step(StepSpec::new("agent-c", "Archive"));
        (g, a, b, c)
    }

    #[test]
    fn add_step_assigns_sequential_order() {
        let (g, a, b, c) = three_steps();
        assert_eq!(g.step(&a).unwrap().order, 1);
        assert_eq!(g.step(&b).unwrap().order, 2);
        assert_eq!(g.step(&c).unwrap().order, 3);
    }

    #[test]
    fn remove_step_cleans_connections_and_checkpoints() {
        let (mut g, a, b, c) = three_steps();
        g.add_connection(a.clone(), b.clone(), None);
        g.add_connection(b.clone(), c.clone(), None);
        g.update_step(
            &b,
            StepPatch {
                hitl_mode: Some(HitlMode::Hitl),
                ..Default::default()
            },
        );
        assert!(g.add_hitl_checkpoint(&b));

        assert!(g.remove_step(&b));
        assert!(g.connections.is_empty());
        assert!(g.metadata.hitl_checkpoints.is_empty());
        assert_eq!(g.step(&c).unwrap().order, 2);
        assert!(!g.remove_step(&b));
    }

    #[test]
    fn reorder_only_changes_order() {
        let (mut g, a, b, c) = three_steps();
        g.add_connection(a.clone(), b.clone(), None);
        assert!(g.reorder_steps(0, 2));
        let ids: Vec<_> = g.steps.iter().map(|s| s.id.clone()).collect();
        assert_eq!(ids, vec![b.clone(), c.clone(), a.clone()]);
        assert_eq!(g.step(&a).unwrap().order, 3);
        assert_eq!(g.connections[0].from, a);
        assert!(!g.reorder_steps(0, 9));
    }

    #[test]
    fn dangling_connections_are_accepted() {
        let mut g = WorkflowGraph::new();
        let id = g.add_connection("ghost", "phantom", Some("approved"));
        assert!(g.connection(&id).is_some());
        assert!(g.remove_connection(&id));
        assert!(!g.remove_connection(&id));
    }

    #[test]
    fn checkpoint_requires_existing_step() {
        let (mut g, a, _, _) = three_steps();
        assert!(!g.add_hitl_checkpoint(&StepId::from("nope")));
        assert!(g.add_hitl_checkpoint(&a));
        // fully-ai steps never pause, even when listed
        assert!(!g.is_checkpoint(&a));
        assert!(g.remove_hitl_checkpoint(&a));
    }

    #[test]
    fn update_unknown_step() {
        let (mut g, _, _, _) = three_steps();
        assert!(!g.update_step(&StepId::from("nope"), StepPatch::default()));
    }

    #[test]
    fn reset_keeps_id() {
        let (mut g, _, _, _) = three_steps();
        let id = g.id.clone();
        g.reset();
        assert!(g.steps.is_empty());
        assert!(g.metadata.name.is_empty());
        assert_eq!(g.id, id);
    }
}
