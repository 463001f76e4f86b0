use serde::{Deserialize, Serialize};

use crate::types::{ConnectionId, StepId};

/// A directed link between two steps.
///
/// `condition = None` is an unconditional edge. A labelled edge is only
/// followed when the source step's result label equals the condition.
/// An edge with `max_iterations` is a loop-back edge to an upstream step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: ConnectionId,
    pub from: StepId,
    pub to: StepId,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
}

impl Connection {
    /// Create a forward edge. Blank condition labels are treated as none.
    pub fn new(from: impl Into<StepId>, to: impl Into<StepId>, condition: Option<&str>) -> Self {
        Self {
            id: ConnectionId::new(),
            from: from.into(),
            to: to.into(),
            condition: normalize_condition(condition),
            max_iterations: None,
        }
    }

    /// Create a bounded loop-back edge.
    pub fn loop_back(
        from: impl Into<StepId>,
        to: impl Into<StepId>,
        condition: Option<&str>,
        max_iterations: u32,
    ) -> Self {
        Self {
            max_iterations: Some(max_iterations),
            ..Self::new(from, to, condition)
        }
    }

    pub fn is_loop_back(&self) -> bool {
        self.max_iterations.is_some()
    }

    pub fn is_conditional(&self) -> bool {
        self.condition.is_some()
    }

    /// Whether this edge fires for a source that succeeded with `label`.
    pub fn matches(&self, label: Option<&str>) -> bool {
        match &self.condition {
            None => true,
            Some(cond) => label == Some(cond.as_str()),
        }
    }
}

fn normalize_condition(condition: Option<&str>) -> Option<String> {
    condition
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
}
