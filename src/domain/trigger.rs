//! Change notifications that may start a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const BRANCH_PREFIX: &str = "refs/heads/";

/// An external event asking for a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Branch reference that changed (None for manual runs)
    pub reference: Option<String>,

    /// Revision identifier reported by the VCS, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,

    /// When the notification was received
    pub received_at: DateTime<Utc>,
}

impl TriggerEvent {
    /// A run requested by hand, outside of any change notification
    pub fn manual() -> Self {
        Self {
            reference: None,
            revision: None,
            received_at: Utc::now(),
        }
    }

    /// A change notification for a branch reference
    pub fn branch(reference: impl Into<String>) -> Self {
        Self {
            reference: Some(reference.into()),
            revision: None,
            received_at: Utc::now(),
        }
    }

    /// Attach the revision that triggered this event
    pub fn with_revision(mut self, revision: Option<String>) -> Self {
        self.revision = revision;
        self
    }

    pub fn is_manual(&self) -> bool {
        self.reference.is_none()
    }

    /// Branch name with any `refs/heads/` prefix removed
    pub fn short_name(&self) -> Option<&str> {
        self.reference
            .as_deref()
            .map(|r| r.strip_prefix(BRANCH_PREFIX).unwrap_or(r))
    }

    /// Human-readable description used in logs and reports
    pub fn describe(&self) -> String {
        match &self.reference {
            Some(reference) => match &self.revision {
                Some(rev) => format!("{}@{}", reference, rev),
                None => reference.clone(),
            },
            None => "manual".to_string(),
        }
    }
}
