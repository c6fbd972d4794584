use super::conditions;
use super::executor::{ActionExecutor, PassState};
use crate::config::EngineConfig;
use crate::controller::IrrigationController;
use crate::db::Database;
use crate::error::Result;
use crate::models::{
    AuditAction, AuditEntry, ExecutionResult, HistoricalSeries, Rule, SensorField, SensorSnapshot,
};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Why a pass stopped before evaluating any rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    NoSnapshot,
    NoRules,
    MissingCredential,
    Storage(String),
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::NoSnapshot => write!(f, "no sensor snapshot available"),
            AbortReason::NoRules => write!(f, "no enabled rules"),
            AbortReason::MissingCredential => write!(f, "controller API key not configured"),
            AbortReason::Storage(e) => write!(f, "storage unavailable: {}", e),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub rules_evaluated: usize,
    pub rules_matched: usize,
    pub rules_triggered: usize,
    pub rules_failed: usize,
    /// Matched, but every target was still cooling down.
    pub rules_held_back: usize,
    pub rate_limited: bool,
    pub aborted: Option<AbortReason>,
}

impl PassSummary {
    fn aborted(reason: AbortReason) -> Self {
        Self {
            aborted: Some(reason),
            ..Default::default()
        }
    }
}

enum RuleOutcome {
    NotMatched,
    Triggered,
    HeldBack,
    Failed,
}

/// Evaluates every enabled rule against the latest snapshot and carries out
/// the actions of those that match.
pub struct RuleEngine {
    db: Database,
    executor: Option<ActionExecutor>,
    history_days: i64,
    /// Held for a whole pass so overlapping passes see each other's watering events.
    pass_lock: Mutex<()>,
}

impl RuleEngine {
    /// `controller` is `None` when no API credential is configured; passes
    /// then stop before touching any rule.
    pub fn new(
        db: Database,
        controller: Option<Arc<dyn IrrigationController>>,
        config: &EngineConfig,
    ) -> Self {
        let executor = controller
            .map(|c| ActionExecutor::new(c, db.clone(), config.watering_source));
        Self {
            db,
            executor,
            history_days: config.history_days,
            pass_lock: Mutex::new(()),
        }
    }

    /// Entry point for the scheduler and manual triggers.
    pub async fn run_evaluation_pass(&self) {
        self.run_pass().await;
    }

    pub async fn run_pass(&self) -> PassSummary {
        self.run_pass_at(Utc::now()).await
    }

    pub async fn run_pass_at(&self, now: DateTime<Utc>) -> PassSummary {
        let summary = self.evaluate_pass(now).await;
        match summary.aborted {
            Some(ref reason) => info!("Evaluation pass skipped: {}", reason),
            None => info!(
                evaluated = summary.rules_evaluated,
                matched = summary.rules_matched,
                triggered = summary.rules_triggered,
                failed = summary.rules_failed,
                held_back = summary.rules_held_back,
                rate_limited = summary.rate_limited,
                "Evaluation pass complete"
            ),
        }
        summary
    }

    async fn evaluate_pass(&self, now: DateTime<Utc>) -> PassSummary {
        let _pass = self.pass_lock.lock().await;

        let snapshot = match self.db.get_latest_snapshot() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return PassSummary::aborted(AbortReason::NoSnapshot),
            Err(e) => {
                error!("Failed to load sensor snapshot: {}", e);
                return PassSummary::aborted(AbortReason::Storage(e.to_string()));
            }
        };

        let records = match self.db.get_enabled_rules() {
            Ok(records) if records.is_empty() => {
                return PassSummary::aborted(AbortReason::NoRules)
            }
            Ok(records) => records,
            Err(e) => {
                error!("Failed to load rules: {}", e);
                return PassSummary::aborted(AbortReason::Storage(e.to_string()));
            }
        };

        let Some(executor) = self.executor.as_ref() else {
            return PassSummary::aborted(AbortReason::MissingCredential);
        };

        let mut summary = PassSummary::default();
        let mut rules = Vec::with_capacity(records.len());
        for record in records {
            let name = record.name.clone();
            match Rule::from_record(record) {
                Ok(rule) => rules.push(rule),
                Err(e) => {
                    error!(rule = %name, "Skipping rule: {}", e);
                    summary.rules_failed += 1;
                }
            }
        }

        let history = self.load_history(&rules, now);
        let mut state = PassState::new();

        for rule in &rules {
            summary.rules_evaluated += 1;
            match self
                .process_rule(executor, rule, &snapshot, history.as_ref(), &mut state, now)
                .await
            {
                Ok(RuleOutcome::NotMatched) => {}
                Ok(RuleOutcome::Triggered) => {
                    summary.rules_matched += 1;
                    summary.rules_triggered += 1;
                }
                Ok(RuleOutcome::HeldBack) => {
                    summary.rules_matched += 1;
                    summary.rules_held_back += 1;
                }
                Ok(RuleOutcome::Failed) => {
                    summary.rules_matched += 1;
                    summary.rules_failed += 1;
                }
                Err(e) => {
                    error!(rule = %rule.name, "Rule failed: {}", e);
                    summary.rules_matched += 1;
                    summary.rules_failed += 1;
                }
            }
        }

        summary.rate_limited = state.is_rate_limited();
        summary
    }

    /// Samples for every field a trend condition refers to, or `None` when no
    /// rule needs history or it cannot be loaded.
    fn load_history(&self, rules: &[Rule], now: DateTime<Utc>) -> Option<HistoricalSeries> {
        let fields: BTreeSet<SensorField> = rules
            .iter()
            .filter(|r| r.conditions.needs_history())
            .flat_map(|r| r.conditions.trend_fields())
            .collect();
        if fields.is_empty() {
            return None;
        }

        let fields: Vec<SensorField> = fields.into_iter().collect();
        let since = now - Duration::days(self.history_days);
        match self.db.get_historical_series(&fields, since) {
            Ok(history) => {
                if history.is_empty() {
                    debug!(fields = ?fields, "No sensor history in trend window");
                }
                Some(history)
            }
            Err(e) => {
                warn!("Failed to load sensor history, trend conditions will not match: {}", e);
                None
            }
        }
    }

    async fn process_rule(
        &self,
        executor: &ActionExecutor,
        rule: &Rule,
        snapshot: &SensorSnapshot,
        history: Option<&HistoricalSeries>,
        state: &mut PassState,
        now: DateTime<Utc>,
    ) -> Result<RuleOutcome> {
        if rule.conditions.is_empty() {
            warn!(rule = %rule.name, "Rule has no conditions and matches every pass");
        }
        if !conditions::evaluate(&rule.conditions, snapshot, None, history) {
            debug!(rule = %rule.name, "Conditions not met");
            return Ok(RuleOutcome::NotMatched);
        }

        info!(rule = %rule.name, actions = rule.actions.len(), "Rule matched");

        let mut results = Vec::with_capacity(rule.actions.len());
        let mut errored = false;
        for action in &rule.actions {
            let result = match executor.execute_at(action, snapshot, state, now).await {
                Ok(result) => {
                    debug!(
                        rule = %rule.name,
                        action = %result.action,
                        attempted = result.attempted(),
                        skipped = result.skipped_targets.len(),
                        "Action finished"
                    );
                    result
                }
                Err(e) => {
                    error!(rule = %rule.name, action = %action.label(), "Action failed: {}", e);
                    let mut failed = ExecutionResult::new(action.label());
                    failed.details.insert("error".into(), e.to_string());
                    errored = true;
                    failed.finish()
                }
            };
            results.push(result);
        }

        let triggered = results.iter().any(|r| r.triggered);
        let held_back = !triggered
            && !errored
            && results.iter().all(|r| r.failed_targets.is_empty())
            && results.iter().any(|r| !r.skipped_targets.is_empty());
        let result_json = if results.len() == 1 {
            serde_json::to_value(&results[0])?
        } else {
            serde_json::to_value(&results)?
        };

        let details = json!({
            "sensors": snapshot.known_values(),
            "result": result_json,
        });

        if triggered {
            self.db.update_rule_run_result(rule.id, now, &result_json)?;
            self.db.write_audit_entry(&AuditEntry::new(
                now,
                Some(rule.id),
                &rule.name,
                AuditAction::RuleTriggered,
                details,
            ))?;
            info!(rule = %rule.name, "Rule triggered");
            Ok(RuleOutcome::Triggered)
        } else if held_back {
            info!(rule = %rule.name, "Rule matched but every target is in cooldown");
            Ok(RuleOutcome::HeldBack)
        } else {
            self.db.write_audit_entry(&AuditEntry::new(
                now,
                Some(rule.id),
                &rule.name,
                AuditAction::RuleFailed,
                details,
            ))?;
            warn!(rule = %rule.name, "Rule matched but no action succeeded");
            Ok(RuleOutcome::Failed)
        }
    }
}
