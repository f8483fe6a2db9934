//! Unified `TriageStore` trait — single async interface for all
//! persistence the pipeline touches: messages, tasks, ledger, plans,
//! balances, and usage events.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::StoreError;
use crate::pipeline::types::{ActionPlan, ActionPlanTask, InboxMessage};

/// An immutable audit record of one triage run and its reward.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub id: String,
    pub user_id: String,
    pub event_type: String,
    /// JSON summary of the run.
    pub payload: serde_json::Value,
    /// Messages covered by the run.
    pub message_ids: Vec<String>,
    /// Reward attributed to the run.
    pub reward: Decimal,
    /// Idempotency key derived from the message-id set. Unique per user.
    pub run_key: String,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(
        user_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
        message_ids: Vec<String>,
        reward: Decimal,
        run_key: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            event_type: event_type.into(),
            payload,
            message_ids,
            reward,
            run_key: run_key.into(),
            created_at: Utc::now(),
        }
    }
}

/// Result of a ledger append: the entry id, and whether a new row was
/// actually written. `inserted == false` means the run key already existed
/// and `id` is the prior entry's.
#[derive(Debug, Clone)]
pub struct LedgerAppend {
    pub id: String,
    pub inserted: bool,
}

/// One recorded usage event.
#[derive(Debug, Clone)]
pub struct UsageEvent {
    pub id: String,
    pub user_id: String,
    pub event_type: String,
    pub messages_processed: u32,
    pub tasks_created: u32,
    pub created_at: DateTime<Utc>,
}

impl UsageEvent {
    pub fn new(
        user_id: impl Into<String>,
        event_type: impl Into<String>,
        messages_processed: u32,
        tasks_created: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            event_type: event_type.into(),
            messages_processed,
            tasks_created,
            created_at: Utc::now(),
        }
    }
}

/// Backend-agnostic persistence trait for the triage pipeline.
#[async_trait]
pub trait TriageStore: Send + Sync {
    // ── Messages ────────────────────────────────────────────────────

    /// Insert an inbound message (used by ingestion and tests).
    async fn insert_message(&self, message: &InboxMessage) -> Result<(), StoreError>;

    /// Fetch up to `limit` unread messages for a user, newest first.
    async fn fetch_unread_messages(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<InboxMessage>, StoreError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Batch-insert task rows. Returns the store-assigned ids in input
    /// order.
    async fn insert_tasks(
        &self,
        user_id: &str,
        tasks: &[ActionPlanTask],
    ) -> Result<Vec<String>, StoreError>;

    // ── Ledger ──────────────────────────────────────────────────────

    /// Append a ledger entry. If an entry with the same `(user_id,
    /// run_key)` already exists, nothing is written and the existing id is
    /// returned with `inserted == false`.
    async fn append_ledger_entry(&self, entry: &LedgerEntry) -> Result<LedgerAppend, StoreError>;

    /// Recent ledger entries for a user, newest first.
    async fn list_ledger_entries(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, StoreError>;

    // ── Action plans ────────────────────────────────────────────────

    /// Insert an action plan record. Returns the store-assigned id.
    async fn insert_action_plan(
        &self,
        user_id: &str,
        plan: &ActionPlan,
    ) -> Result<String, StoreError>;

    /// Recent action plans for a user, newest first.
    async fn list_action_plans(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ActionPlan>, StoreError>;

    // ── Token balance ───────────────────────────────────────────────

    /// Atomically add `amount` to the user's balance, creating the row if
    /// needed. Returns the new total.
    async fn add_to_balance(&self, user_id: &str, amount: Decimal) -> Result<Decimal, StoreError>;

    /// Current balance (zero for unknown users).
    async fn get_balance(&self, user_id: &str) -> Result<Decimal, StoreError>;

    // ── Usage events ────────────────────────────────────────────────

    /// Record one usage event.
    async fn record_usage_event(&self, event: &UsageEvent) -> Result<(), StoreError>;

    /// Count usage events for a user (used by tests and reporting).
    async fn count_usage_events(&self, user_id: &str) -> Result<u64, StoreError>;
}
