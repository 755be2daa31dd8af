//! Action types for plan previews

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Represents a planned action for a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Type of action to perform
    pub action_type: ActionType,

    /// Resource type (e.g., "vpc", "certificate")
    pub resource_type: String,

    /// Resource identifier (`stack/name`)
    pub resource_id: String,

    /// Description of the action
    pub description: String,

    /// Inputs whose recorded value differs from the declared one
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub changes: BTreeMap<String, serde_json::Value>,
}

impl Action {
    pub fn new(
        action_type: ActionType,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            action_type,
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            description: description.into(),
            changes: BTreeMap::new(),
        }
    }

    pub fn with_change(mut self, input: impl Into<String>, value: serde_json::Value) -> Self {
        self.changes.insert(input.into(), value);
        self
    }
}

/// Type of action to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Create a new resource
    Create,
    /// Update an existing resource
    Update,
    /// Delete a resource
    Delete,
    /// No changes needed
    NoOp,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionType::Create => write!(f, "create"),
            ActionType::Update => write!(f, "update"),
            ActionType::Delete => write!(f, "delete"),
            ActionType::NoOp => write!(f, "no-op"),
        }
    }
}

/// Plan containing all actions in execution order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// List of actions to perform
    pub actions: Vec<Action>,

    /// Whether the plan has any changes
    pub has_changes: bool,
}

impl Plan {
    pub fn new(actions: Vec<Action>) -> Self {
        let has_changes = actions.iter().any(|a| a.action_type != ActionType::NoOp);
        Self {
            actions,
            has_changes,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Get actions by type
    pub fn actions_by_type(&self, action_type: ActionType) -> Vec<&Action> {
        self.actions
            .iter()
            .filter(|a| a.action_type == action_type)
            .collect()
    }

    /// Summary of the plan
    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            create: self.actions_by_type(ActionType::Create).len(),
            update: self.actions_by_type(ActionType::Update).len(),
            delete: self.actions_by_type(ActionType::Delete).len(),
            no_change: self.actions_by_type(ActionType::NoOp).len(),
        }
    }
}

/// Summary of planned actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    pub no_change: usize,
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to delete, {} unchanged",
            self.create, self.update, self.delete, self.no_change
        )
    }
}
