use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::types::{HitlMode, StepId};

/// A single unit of work: one agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Unique, stable identifier.
    pub id: StepId,
    /// Advisory 1-based position. Execution order comes from connections.
    pub order: u32,
    /// Opaque reference resolved through the agent directory.
    pub agent_ref: String,
    /// Job title / label shown to reviewers.
    pub role: String,
    /// Free-text instruction for the agent.
    #[serde(default)]
    pub task: String,
    /// Capability tags the step needs from its agent.
    #[serde(default)]
    pub engines_used: BTreeSet<String>,
    #[serde(default)]
    pub hitl_mode: HitlMode,
    /// Reviewer identifiers, required when `hitl_mode` is supervised.
    #[serde(default)]
    pub hitl_supervisors: BTreeSet<String>,
}

/// Partial step used when adding to a graph. Blank fields are allowed so an
/// intermediate graph can be built; validation reports them later.
#[derive(Debug, Clone, Default)]
pub struct StepSpec {
    pub id: Option<StepId>,
    pub agent_ref: String,
    pub role: String,
    pub task: String,
    pub engines_used: BTreeSet<String>,
    pub hitl_mode: HitlMode,
    pub hitl_supervisors: BTreeSet<String>,
}

impl StepSpec {
    pub fn new(agent_ref: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            agent_ref: agent_ref.into(),
            role: role.into(),
            ..Default::default()
        }
    }

    /// Use a caller-chosen id instead of a generated one.
    pub fn with_id(mut self, id: impl Into<StepId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = task.into();
        self
    }

    pub fn with_engines<I, S>(mut self, engines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.engines_used = engines.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_hitl<I, S>(mut self, mode: HitlMode, supervisors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hitl_mode = mode;
        self.hitl_supervisors = supervisors.into_iter().map(Into::into).collect();
        self
    }

    pub(crate) fn into_step(self, order: u32) -> Step {
        Step {
            id: self.id.unwrap_or_default(),
            order,
            agent_ref: self.agent_ref,
            role: self.role,
            task: self.task,
            engines_used: self.engines_used,
            hitl_mode: self.hitl_mode,
            hitl_supervisors: self.hitl_supervisors,
        }
    }
}

/// Field-level update for an existing step. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct StepPatch {
    pub agent_ref: Option<String>,
    pub role: Option<String>,
    pub task: Option<String>,
    pub engines_used: Option<BTreeSet<String>>,
    pub hitl_mode: Option<HitlMode>,
    pub hitl_supervisors: Option<BTreeSet<String>>,
}

impl StepPatch {
    pub(crate) fn apply(self, step: &mut Step) {
        if let Some(agent_ref) = self.agent_ref {
            step.agent_ref = agent_ref;
        }
        if let Some(role) = self.role {
            step.role = role;
        }
        if let Some(task) = self.task {
            step.task = task;
        }
        if let Some(engines) = self.engines_used {
            step.engines_used = engines;
        }
        if let Some(mode) = self.hitl_mode {
            step.hitl_mode = mode;
        }
        if let Some(supervisors) = self.hitl_supervisors {
            step.hitl_supervisors = supervisors;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_builder() {
        let step = StepSpec::new("agent-ocr", "Document Reader")
            .with_id("read")
            .with_task("Extract the invoice total")
            .with_engines(["ocr", "nlp"])
            .with_hitl(HitlMode::Hybrid, ["alice"])
            .into_step(4);

        assert_eq!(step.id, StepId::from("read"));
        assert_eq!(step.order, 4);
        assert_eq!(step.engines_used.len(), 2);
        assert_eq!(step.hitl_mode, HitlMode::Hybrid);
        assert!(step.hitl_supervisors.contains("alice"));
    }

    #[test]
    fn blank_spec_gets_generated_id() {
        let step = StepSpec::default().into_step(1);
        assert!(step.id.as_str().starts_with("step-"));
        assert!(step.agent_ref.is_empty());
    }

    #[test]
    fn patch_only_touches_given_fields() {
        let mut step = StepSpec::new("a", "Analyst").with_task("t").into_step(1);
        StepPatch {
            role: Some("Senior Analyst".into()),
            ..Default::default()
        }
        .apply(&mut step);
        assert_eq!(step.role, "Senior Analyst");
        assert_eq!(step.agent_ref, "a");
        assert_eq!(step.task, "t");
    }

    #[test]
    fn step_json_uses_camel_case() {
        let step = StepSpec::new("a", "r").with_id("s1").into_step(1);
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["agentRef"], "a");
        assert_eq!(json["hitlMode"], "fully-ai");
    }
}
