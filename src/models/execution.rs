use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome of one rule action across all of its targets.
///
/// A target id appears in at most one of the successful, failed and skipped
/// lists. Skipped is reserved for zones held back by their cooldown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub triggered: bool,
    pub action: String,
    pub successful_targets: Vec<String>,
    pub failed_targets: Vec<String>,
    pub skipped_targets: Vec<String>,
    pub details: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limited_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rate_limited: bool,
}

impl ExecutionResult {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            triggered: false,
            action: action.into(),
            successful_targets: Vec::new(),
            failed_targets: Vec::new(),
            skipped_targets: Vec::new(),
            details: BTreeMap::new(),
            rate_limited_until: None,
            rate_limited: false,
        }
    }

    pub fn record_success(&mut self, target: &str) {
        self.successful_targets.push(target.to_string());
    }

    pub fn record_failure(&mut self, target: &str, reason: impl Into<String>) {
        self.failed_targets.push(target.to_string());
        self.details.insert(target.to_string(), reason.into());
    }

    pub fn record_skip(&mut self, target: &str, reason: impl Into<String>) {
        self.skipped_targets.push(target.to_string());
        self.details.insert(target.to_string(), reason.into());
    }

    pub fn mark_rate_limited(&mut self, reset_at: Option<DateTime<Utc>>) {
        self.rate_limited = true;
        self.rate_limited_until = reset_at;
    }

    /// Any successful target counts as a trigger.
    pub fn finish(mut self) -> Self {
        self.triggered = !self.successful_targets.is_empty();
        self
    }

    pub fn attempted(&self) -> usize {
        self.successful_targets.len() + self.failed_targets.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    RuleTriggered,
    RuleFailed,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::RuleTriggered => "rule_triggered",
            AuditAction::RuleFailed => "rule_failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "rule_triggered" => Some(AuditAction::RuleTriggered),
            "rule_failed" => Some(AuditAction::RuleFailed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub rule_id: Option<i64>,
    pub rule_name: String,
    pub action: AuditAction,
    pub details: serde_json::Value,
}

impl AuditEntry {
    pub fn new(
        timestamp: DateTime<Utc>,
        rule_id: Option<i64>,
        rule_name: impl Into<String>,
        action: AuditAction,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: None,
            timestamp,
            rule_id,
            rule_name: rule_name.into(),
            action,
            details,
        }
    }
}
