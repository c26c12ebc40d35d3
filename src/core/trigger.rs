//! Trigger evaluation against branch filters.
//!
//! A branch filter is an ordered list of rules in the form `+:pattern`
//! (include) or `-:pattern` (exclude); a rule without a prefix includes.
//! Rules are evaluated in order and the last matching rule decides. An
//! empty filter admits every branch.

use glob::Pattern;
use tracing::info;
use uuid::Uuid;

use crate::domain::{Run, TriggerEvent};

use super::pipeline::{CompiledPipeline, DefinitionError};

/// Whether a rule admits or rejects a matching branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Include,
    Exclude,
}

/// A single filter rule
#[derive(Debug, Clone)]
pub struct BranchRule {
    pub action: FilterAction,
    pattern: Pattern,
}

impl BranchRule {
    /// Parse `+:pattern`, `-:pattern` or a bare pattern
    pub fn parse(rule: &str) -> Result<Self, DefinitionError> {
        let rule = rule.trim();
        let (action, pattern) = if let Some(p) = rule.strip_prefix("+:") {
            (FilterAction::Include, p)
        } else if let Some(p) = rule.strip_prefix("-:") {
            (FilterAction::Exclude, p)
        } else {
            (FilterAction::Include, rule)
        };

        if pattern.is_empty() {
            return Err(DefinitionError::InvalidTrigger {
                rule: rule.to_string(),
                message: "empty pattern".to_string(),
            });
        }

        let pattern = Pattern::new(pattern).map_err(|e| DefinitionError::InvalidTrigger {
            rule: rule.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self { action, pattern })
    }

    /// `*` crosses `/`, so `+:*` matches `feature/login` as well
    pub fn matches(&self, branch: &str) -> bool {
        self.pattern.matches(branch)
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }
}

/// Ordered include/exclude rules with last-match-wins semantics
#[derive(Debug, Clone, Default)]
pub struct BranchFilter {
    rules: Vec<BranchRule>,
}

impl BranchFilter {
    pub fn parse<S: AsRef<str>>(rules: &[S]) -> Result<Self, DefinitionError> {
        let rules = rules
            .iter()
            .map(|r| BranchRule::parse(r.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// Filter that admits everything
    pub fn include_all() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Decide whether a branch reference passes the filter. Both the full
    /// reference and the short branch name are tried against each rule.
    pub fn admits(&self, event: &TriggerEvent) -> bool {
        let Some(reference) = event.reference.as_deref() else {
            return true;
        };
        if self.rules.is_empty() {
            return true;
        }

        let short = event.short_name().unwrap_or(reference);
        self.rules
            .iter()
            .rev()
            .find(|rule| rule.matches(reference) || rule.matches(short))
            .map(|rule| rule.action == FilterAction::Include)
            .unwrap_or(false)
    }
}

/// Decides whether change notifications start runs
#[derive(Debug, Clone)]
pub struct TriggerEvaluator {
    filter: BranchFilter,
}

impl TriggerEvaluator {
    pub fn new(filter: BranchFilter) -> Self {
        Self { filter }
    }

    /// Admit or reject an event. Manual events always pass.
    pub fn evaluate(&self, event: &TriggerEvent) -> bool {
        event.is_manual() || self.filter.admits(event)
    }

    /// Create exactly one run for an admitted event. Rejection only logs.
    pub fn admit(&self, event: TriggerEvent, pipeline: &CompiledPipeline) -> Option<Run> {
        if !self.evaluate(&event) {
            info!(
                pipeline = %pipeline.name(),
                trigger = %event.describe(),
                "Trigger rejected by branch filter"
            );
            return None;
        }

        let run = Run::new(
            Uuid::new_v4(),
            pipeline.name().to_string(),
            event,
            pipeline.graph().stages().to_vec(),
        );
        info!(
            pipeline = %pipeline.name(),
            run_id = %run.id,
            trigger = %run.trigger.describe(),
            "Trigger admitted"
        );
        Some(run)
    }
}
