//! Plan and apply results.

use std::fmt;

use serde::Serialize;

use super::graph::ResourceAddress;
use crate::state::Outputs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Create,
    Update,
    Tag,
    Attach,
    Delete,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Create => "create",
            ChangeAction::Update => "update",
            ChangeAction::Tag => "tag",
            ChangeAction::Attach => "attach",
            ChangeAction::Delete => "delete",
        }
    }

    /// Repeating the call converges to the same end state.
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, ChangeAction::Create | ChangeAction::Delete)
    }
}

/// One cloud call the engine would issue (plan) or did issue (apply).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedChange {
    pub address: String,
    pub action: ChangeAction,
    pub detail: String,
}

/// Per-resource summary of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "fields", rename_all = "snake_case")]
pub enum ResourceAction {
    NoOp,
    Create,
    Update(Vec<String>),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Plan {
    pub changes: Vec<PlannedChange>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn changes_for(&self, address: ResourceAddress) -> impl Iterator<Item = &PlannedChange> {
        self.changes.iter().filter(move |c| c.address == address.as_str())
    }

    pub fn action_for(&self, address: ResourceAddress) -> ResourceAction {
        let changes: Vec<_> = self.changes_for(address).collect();
        if changes.is_empty() {
            ResourceAction::NoOp
        } else if changes.iter().any(|c| c.action == ChangeAction::Create) {
            ResourceAction::Create
        } else {
            ResourceAction::Update(changes.iter().map(|c| c.detail.clone()).collect())
        }
    }

    /// Summary in dependency order.
    pub fn summary(&self, order: &[ResourceAddress]) -> Vec<(ResourceAddress, ResourceAction)> {
        order.iter().map(|a| (*a, self.action_for(*a))).collect()
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.changes.is_empty() {
            return writeln!(f, "No changes. Infrastructure matches the declared configuration.");
        }
        for change in &self.changes {
            let marker = match change.action {
                ChangeAction::Create => "+",
                ChangeAction::Delete => "-",
                _ => "~",
            };
            writeln!(f, "  {} {} ({}): {}", marker, change.address, change.action.as_str(), change.detail)?;
        }
        writeln!(f, "Plan: {} change(s).", self.changes.len())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    pub changes: Vec<PlannedChange>,
    pub outputs: Outputs,
    pub serial: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(address: ResourceAddress, action: ChangeAction, detail: &str) -> PlannedChange {
        PlannedChange { address: address.as_str().to_string(), action, detail: detail.to_string() }
    }

    #[test]
    fn summary_classifies_resources() {
        let plan = Plan {
            changes: vec![
                change(ResourceAddress::Key, ChangeAction::Create, "create key"),
                change(ResourceAddress::Key, ChangeAction::Tag, "tags"),
                change(ResourceAddress::Role, ChangeAction::Update, "trust policy"),
            ],
        };

        assert_eq!(plan.action_for(ResourceAddress::Key), ResourceAction::Create);
        assert_eq!(plan.action_for(ResourceAddress::Role), ResourceAction::Update(vec!["trust policy".to_string()]));
        assert_eq!(plan.action_for(ResourceAddress::Bucket), ResourceAction::NoOp);
        assert!(plan.to_string().contains("+ kms_key.unseal"));
    }

    #[test]
    fn idempotent_actions() {
        assert!(!ChangeAction::Create.is_idempotent());
        assert!(!ChangeAction::Delete.is_idempotent());
        assert!(ChangeAction::Update.is_idempotent());
        assert!(ChangeAction::Attach.is_idempotent());
    }

    #[test]
    fn empty_plan_renders_no_changes() {
        assert!(Plan::default().to_string().starts_with("No changes"));
    }
}
