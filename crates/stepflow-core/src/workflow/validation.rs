//! Well-formedness checks run before a workflow is saved or executed.
//!
//! Every check runs and all failures are collected. The report only depends
//! on the graph, and the graph is never modified.

use std::collections::{BTreeSet, HashSet};

use serde::Serialize;

use super::graph::WorkflowGraph;
use super::order::{find_cycle, reaches};
use crate::traits::AgentDirectory;
use crate::types::StepId;

/// Outcome of validating a graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    /// Non-blocking findings such as capability mismatches.
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
            warnings: Vec::new(),
        }
    }
}

pub fn validate(graph: &WorkflowGraph) -> ValidationReport {
    let mut errors = Vec::new();
    let step_ids: HashSet<&StepId> = graph.steps.iter().map(|s| &s.id).collect();

    // 1. name
    if graph.metadata.name.trim().is_empty() {
        errors.push("Workflow name is required".to_string());
    }

    // 2. at least one step
    if graph.steps.is_empty() {
        errors.push("Workflow must have at least one step".to_string());
    }

    // 3. agent and role assigned
    for (i, step) in graph.steps.iter().enumerate() {
        if step.agent_ref.trim().is_empty() {
            errors.push(format!("Step {} ({}): agent not assigned", i + 1, step.id));
        }
        if step.role.trim().is_empty() {
            errors.push(format!("Step {} ({}): role is required", i + 1, step.id));
        }
    }

    // 4. connection endpoints exist
    for conn in &graph.connections {
        if !step_ids.contains(&conn.from) {
            errors.push(format!(
                "Connection {}: source step {} does not exist",
                conn.id, conn.from
            ));
        }
        if !step_ids.contains(&conn.to) {
            errors.push(format!(
                "Connection {}: target step {} does not exist",
                conn.id, conn.to
            ));
        }
    }

    // 5. fan-out: one unconditional successor, or distinct labelled branches
    for step in &graph.steps {
        let mut unconditional = 0;
        let mut labels = BTreeSet::new();
        let mut duplicates = BTreeSet::new();
        for conn in graph.outgoing(&step.id) {
            match &conn.condition {
                None => unconditional += 1,
                Some(label) => {
                    if !labels.insert(label.as_str()) {
                        duplicates.insert(label.as_str());
                    }
                }
            }
        }
        if unconditional > 1 {
            errors.push(format!(
                "Step {}: has {} unconditional outgoing connections, at most one is allowed",
                step.id, unconditional
            ));
        }
        if unconditional > 0 && !labels.is_empty() {
            errors.push(format!(
                "Step {}: mixes unconditional and conditional outgoing connections",
                step.id
            ));
        }
        for label in duplicates {
            errors.push(format!(
                "Step {}: duplicate branch condition '{}'",
                step.id, label
            ));
        }
    }

    // 6. acyclic, ignoring loop-back edges
    if let Some(cycle) = find_cycle(graph) {
        let path: Vec<&str> = cycle.iter().map(StepId::as_str).collect();
        errors.push(format!("Cycle detected: {}", path.join(" -> ")));
    }

    // 7. checkpoints reference existing steps
    for id in &graph.metadata.hitl_checkpoints {
        if !step_ids.contains(id) {
            errors.push(format!(
                "HITL checkpoint {} does not reference an existing step",
                id
            ));
        }
    }

    // 8. unique step ids
    let mut seen = HashSet::new();
    for step in &graph.steps {
        if !seen.insert(&step.id) {
            errors.push(format!("Duplicate step id {}", step.id));
        }
    }

    // 9. supervised steps name a reviewer
    for (i, step) in graph.steps.iter().enumerate() {
        if step.hitl_mode.is_supervised() && step.hitl_supervisors.is_empty() {
            errors.push(format!(
                "Step {} ({}): {} mode requires at least one supervisor",
                i + 1,
                step.id,
                step.hitl_mode
            ));
        }
    }

    // 10. loop-back edges are bounded and point upstream
    for conn in graph.connections.iter().filter(|c| c.is_loop_back()) {
        if conn.max_iterations == Some(0) {
            errors.push(format!(
                "Loop connection {}: iteration bound must be at least 1",
                conn.id
            ));
        }
        if step_ids.contains(&conn.from)
            && step_ids.contains(&conn.to)
            && !reaches(graph, &conn.to, &conn.from)
        {
            errors.push(format!(
                "Loop connection {}: target {} is not upstream of {}",
                conn.id, conn.to, conn.from
            ));
        }
    }

    // 11. schedule can be evaluated
    if let Err(e) = graph.metadata.schedule.check() {
        errors.push(format!("Schedule: {}", e));
    }

    ValidationReport::from_errors(errors)
}

/// `validate` plus capability warnings from the agent directory.
///
/// A step that requires an engine its agent does not declare is flagged, but
/// the graph stays valid.
pub async fn validate_with_directory(
    graph: &WorkflowGraph,
    directory: &dyn AgentDirectory,
) -> ValidationReport {
    let mut report = validate(graph);

    for step in &graph.steps {
        if step.engines_used.is_empty() || step.agent_ref.trim().is_empty() {
            continue;
        }
        match directory.resolve_capabilities(&step.agent_ref).await {
            Ok(declared) => {
                let missing: Vec<&str> = step
                    .engines_used
                    .iter()
                    .filter(|e| !declared.contains(*e))
                    .map(String::as_str)
                    .collect();
                if !missing.is_empty() {
                    report.warnings.push(format!(
                        "Step {}: agent {} does not declare engine(s) {}",
                        step.id,
                        step.agent_ref,
                        missing.join(", ")
                    ));
                }
            }
            Err(e) => report.warnings.push(format!(
                "Step {}: could not resolve capabilities of agent {}: {}",
                step.id, step.agent_ref, e
            )),
        }
    }

    report
}
