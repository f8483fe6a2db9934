//! Persistence & reward stage — five best-effort-sequential writes.
//!
//! Modeled as a saga: task insert, ledger append, plan insert, balance
//! add, usage event. Each step has its own outcome; a failure is recorded
//! and later steps still run. The five writes are not atomic and the code
//! does not pretend they are — the aggregated [`PersistenceReport`] is how
//! partial success reaches the caller.
//!
//! Retried or overlapping runs over the same message set are defused by
//! the ledger's idempotency key: when the append hits an existing
//! `(user, run_key)` row, the reward add is skipped.

use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{error, info};

use crate::pipeline::types::{ActionPlan, ActionPlanTask, InboxMessage};
use crate::store::{LedgerEntry, TriageStore, UsageEvent};

/// Ledger/usage event type for a triage run.
const TRIAGE_EVENT: &str = "inbox_triage";

/// One of the five persistence sub-writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistStep {
    Tasks,
    Ledger,
    Plan,
    Balance,
    Usage,
}

impl fmt::Display for PersistStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Tasks => "tasks",
            Self::Ledger => "ledger",
            Self::Plan => "plan",
            Self::Balance => "balance",
            Self::Usage => "usage",
        };
        write!(f, "{name}")
    }
}

/// Aggregated outcome of the persistence saga.
#[derive(Debug, Default)]
pub struct PersistenceReport {
    /// Steps that failed, with their error messages.
    pub failed: Vec<(PersistStep, String)>,
    /// True when the ledger already held an entry for this run's message
    /// set — the reward was granted by an earlier run and is not re-added.
    pub duplicate_run: bool,
}

impl PersistenceReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// Short user-facing warning when some writes failed.
    pub fn warning(&self) -> Option<String> {
        if self.failed.is_empty() {
            return None;
        }
        let steps: Vec<String> = self.failed.iter().map(|(s, _)| s.to_string()).collect();
        Some(format!(
            "Your plan is ready, but saving it partially failed ({})",
            steps.join(", ")
        ))
    }
}

/// Idempotency key for a run: digest of the sorted message-id set.
pub fn run_key(message_ids: &[String]) -> String {
    let mut sorted: Vec<&str> = message_ids.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let mut hasher = Sha256::new();
    for id in sorted {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Persistence stage.
pub struct PersistenceStage {
    store: Arc<dyn TriageStore>,
}

impl PersistenceStage {
    pub fn new(store: Arc<dyn TriageStore>) -> Self {
        Self { store }
    }

    /// Run the saga. Returns the plan with store ids merged in, plus the
    /// per-step report.
    pub async fn persist(
        &self,
        user_id: &str,
        mut plan: ActionPlan,
        messages: &[InboxMessage],
    ) -> (ActionPlan, PersistenceReport) {
        let mut report = PersistenceReport::default();

        // (1) Task rows for both buckets, ids merged back positionally.
        let mut combined: Vec<ActionPlanTask> = Vec::with_capacity(plan.tasks_created());
        combined.extend(plan.urgent_tasks.iter().cloned());
        combined.extend(plan.quick_wins.iter().cloned());
        if !combined.is_empty() {
            match self.store.insert_tasks(user_id, &combined).await {
                Ok(ids) => {
                    let urgent_count = plan.urgent_tasks.len();
                    for (task, id) in plan
                        .urgent_tasks
                        .iter_mut()
                        .chain(plan.quick_wins.iter_mut())
                        .zip(ids)
                    {
                        task.id = Some(id);
                    }
                    info!(
                        user_id,
                        urgent = urgent_count,
                        quick_wins = plan.quick_wins.len(),
                        "Tasks created"
                    );
                }
                Err(e) => {
                    error!(user_id, error = %e, "Task insert failed");
                    report.failed.push((PersistStep::Tasks, e.to_string()));
                }
            }
        }

        // (2) Ledger entry with the run's idempotency key.
        let message_ids: Vec<String> = messages.iter().map(|m| m.id.clone()).collect();
        let key = run_key(&message_ids);
        let entry = LedgerEntry::new(
            user_id,
            TRIAGE_EVENT,
            serde_json::json!({
                "messages_processed": plan.messages_processed,
                "tasks_created": plan.tasks_created(),
                "urgent_tasks": plan.urgent_tasks.len(),
                "quick_wins": plan.quick_wins.len(),
                "auto_replies": plan.auto_replies.len(),
                "reward": plan.uct_reward_estimate,
            }),
            message_ids,
            plan.uct_reward_estimate,
            key,
        );
        match self.store.append_ledger_entry(&entry).await {
            Ok(append) => {
                plan.ledger_id = Some(append.id);
                report.duplicate_run = !append.inserted;
                if report.duplicate_run {
                    info!(user_id, "Run already in ledger, reward will not be re-added");
                }
            }
            Err(e) => {
                error!(user_id, error = %e, "Ledger append failed");
                report.failed.push((PersistStep::Ledger, e.to_string()));
            }
        }

        // (3) The plan record itself.
        match self.store.insert_action_plan(user_id, &plan).await {
            Ok(id) => plan.id = Some(id),
            Err(e) => {
                error!(user_id, error = %e, "Action plan insert failed");
                report.failed.push((PersistStep::Plan, e.to_string()));
            }
        }

        // (4) Reward credit — atomic add, skipped for a duplicate run so
        // the balance matches the single ledger entry.
        if report.duplicate_run {
            info!(user_id, "Skipping balance add for duplicate run");
        } else {
            match self
                .store
                .add_to_balance(user_id, plan.uct_reward_estimate)
                .await
            {
                Ok(total) => {
                    info!(user_id, reward = %plan.uct_reward_estimate, total = %total, "Reward credited");
                }
                Err(e) => {
                    error!(user_id, error = %e, "Balance update failed");
                    report.failed.push((PersistStep::Balance, e.to_string()));
                }
            }
        }

        // (5) Usage event.
        let event = UsageEvent::new(
            user_id,
            TRIAGE_EVENT,
            plan.messages_processed as u32,
            plan.tasks_created() as u32,
        );
        if let Err(e) = self.store.record_usage_event(&event).await {
            error!(user_id, error = %e, "Usage event failed");
            report.failed.push((PersistStep::Usage, e.to_string()));
        }

        (plan, report)
    }
}
