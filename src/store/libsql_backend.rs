//! libSQL backend — async `TriageStore` implementation.
//!
//! Supports local file and in-memory databases. All writes the pipeline
//! performs are inserts or an atomic balance add; the unique
//! `(user_id, run_key)` index on the ledger is what makes retried runs
//! idempotent.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{params, Connection, Database as LibSqlDatabase};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::pipeline::types::{ActionPlan, ActionPlanTask, InboxMessage};
use crate::store::migrations;
use crate::store::traits::{LedgerAppend, LedgerEntry, TriageStore, UsageEvent};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to open libSQL database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&backend.conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to create in-memory database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&backend.conn).await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Parse a decimal stored as TEXT.
fn parse_decimal(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap_or_default()
}

/// Convert a REAL balance column back to a 2-decimal-place Decimal.
fn decimal_from_real(v: f64) -> Decimal {
    Decimal::from_str(&format!("{v:.2}")).unwrap_or_default()
}

fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn json_ids(ids: &[String]) -> String {
    serde_json::to_string(ids).unwrap_or_else(|_| "[]".to_string())
}

fn parse_json_ids(s: &str) -> Vec<String> {
    serde_json::from_str(s).unwrap_or_default()
}

fn row_to_message(row: &libsql::Row) -> Result<InboxMessage, libsql::Error> {
    let received_str: String = row.get(7)?;
    let unread: i64 = row.get(6)?;
    Ok(InboxMessage {
        id: row.get(0)?,
        user_id: row.get(1)?,
        subject: row.get(2).ok(),
        body: row.get(3)?,
        sender_name: row.get(4).ok(),
        sender_address: row.get(5)?,
        unread: unread != 0,
        received_at: parse_datetime(&received_str),
    })
}

fn row_to_ledger_entry(row: &libsql::Row) -> Result<LedgerEntry, libsql::Error> {
    let payload_str: String = row.get(3)?;
    let message_ids_str: String = row.get(4)?;
    let reward_str: String = row.get(5)?;
    let created_str: String = row.get(7)?;
    Ok(LedgerEntry {
        id: row.get(0)?,
        user_id: row.get(1)?,
        event_type: row.get(2)?,
        payload: serde_json::from_str(&payload_str).unwrap_or(serde_json::Value::Null),
        message_ids: parse_json_ids(&message_ids_str),
        reward: parse_decimal(&reward_str),
        run_key: row.get(6)?,
        created_at: parse_datetime(&created_str),
    })
}

const MESSAGE_COLUMNS: &str =
    "id, user_id, subject, body, sender_name, sender_address, unread, received_at";
const LEDGER_COLUMNS: &str =
    "id, user_id, event_type, payload, message_ids, reward, run_key, created_at";

#[async_trait]
impl TriageStore for LibSqlBackend {
    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message(&self, message: &InboxMessage) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO messages (id, user_id, subject, body, sender_name, sender_address,
                unread, received_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                message.id.clone(),
                message.user_id.clone(),
                opt_text_owned(message.subject.clone()),
                message.body.clone(),
                opt_text_owned(message.sender_name.clone()),
                message.sender_address.clone(),
                i64::from(message.unread),
                message.received_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| StoreError::Query(format!("insert_message: {e}")))?;

        debug!(id = %message.id, "Message inserted");
        Ok(())
    }

    async fn fetch_unread_messages(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<InboxMessage>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE user_id = ?1 AND unread = 1
                     ORDER BY received_at DESC LIMIT ?2"
                ),
                params![user_id, limit as i64],
            )
            .await
            .map_err(|e| StoreError::Query(format!("fetch_unread_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_message(&row) {
                Ok(message) => messages.push(message),
                Err(e) => tracing::warn!("Skipping message row: {e}"),
            }
        }
        Ok(messages)
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_tasks(
        &self,
        user_id: &str,
        tasks: &[ActionPlanTask],
    ) -> Result<Vec<String>, StoreError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        let mut ids = Vec::with_capacity(tasks.len());

        for task in tasks {
            let id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO tasks (id, user_id, title, description, source_message_ids,
                    due_date, priority, effort_estimate, origin, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'triage', ?9)",
                params![
                    id.clone(),
                    user_id,
                    task.title.clone(),
                    task.description.clone(),
                    json_ids(&task.source_message_ids),
                    opt_text_owned(task.due_date.map(|d| d.format("%Y-%m-%d").to_string())),
                    i64::from(task.priority),
                    i64::from(task.effort_estimate),
                    now.clone(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("insert_tasks: {e}")))?;
            ids.push(id);
        }

        debug!(count = ids.len(), "Tasks inserted");
        Ok(ids)
    }

    // ── Ledger ──────────────────────────────────────────────────────

    async fn append_ledger_entry(&self, entry: &LedgerEntry) -> Result<LedgerAppend, StoreError> {
        let conn = self.conn();
        let payload = serde_json::to_string(&entry.payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let affected = conn
            .execute(
                "INSERT INTO ledger_entries (id, user_id, event_type, payload, message_ids,
                    reward, run_key, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(user_id, run_key) DO NOTHING",
                params![
                    entry.id.clone(),
                    entry.user_id.clone(),
                    entry.event_type.clone(),
                    payload,
                    json_ids(&entry.message_ids),
                    entry.reward.to_string(),
                    entry.run_key.clone(),
                    entry.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("append_ledger_entry: {e}")))?;

        if affected > 0 {
            debug!(id = %entry.id, run_key = %entry.run_key, "Ledger entry appended");
            return Ok(LedgerAppend {
                id: entry.id.clone(),
                inserted: true,
            });
        }

        // Conflict — hand back the existing entry for this run.
        let mut rows = conn
            .query(
                "SELECT id FROM ledger_entries WHERE user_id = ?1 AND run_key = ?2",
                params![entry.user_id.clone(), entry.run_key.clone()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("append_ledger_entry lookup: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let id: String = row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("append_ledger_entry parse: {e}")))?;
                debug!(id = %id, run_key = %entry.run_key, "Ledger entry already recorded for run");
                Ok(LedgerAppend {
                    id,
                    inserted: false,
                })
            }
            Ok(None) => Err(StoreError::NotFound {
                entity: "ledger_entry".to_string(),
                id: entry.run_key.clone(),
            }),
            Err(e) => Err(StoreError::Query(format!("append_ledger_entry lookup: {e}"))),
        }
    }

    async fn list_ledger_entries(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {LEDGER_COLUMNS} FROM ledger_entries
                     WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2"
                ),
                params![user_id, limit as i64],
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_ledger_entries: {e}")))?;

        let mut entries = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_ledger_entry(&row) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!("Skipping ledger row: {e}"),
            }
        }
        Ok(entries)
    }

    // ── Action plans ────────────────────────────────────────────────

    async fn insert_action_plan(
        &self,
        user_id: &str,
        plan: &ActionPlan,
    ) -> Result<String, StoreError> {
        let conn = self.conn();
        let id = Uuid::new_v4().to_string();
        let plan_json =
            serde_json::to_string(plan).map_err(|e| StoreError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT INTO action_plans (id, user_id, ledger_id, plan, messages_processed,
                reward, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id.clone(),
                user_id,
                opt_text_owned(plan.ledger_id.clone()),
                plan_json,
                plan.messages_processed as i64,
                plan.uct_reward_estimate.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| StoreError::Query(format!("insert_action_plan: {e}")))?;

        debug!(id = %id, "Action plan inserted");
        Ok(id)
    }

    async fn list_action_plans(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ActionPlan>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT id, plan FROM action_plans
                 WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2",
                params![user_id, limit as i64],
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_action_plans: {e}")))?;

        let mut plans = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id: String = match row.get(0) {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!("Skipping plan row: {e}");
                    continue;
                }
            };
            let plan_json: String = match row.get(1) {
                Ok(json) => json,
                Err(e) => {
                    tracing::warn!("Skipping plan row: {e}");
                    continue;
                }
            };
            match serde_json::from_str::<ActionPlan>(&plan_json) {
                Ok(mut plan) => {
                    plan.id = Some(id);
                    plans.push(plan);
                }
                Err(e) => tracing::warn!("Skipping undecodable plan row: {e}"),
            }
        }
        Ok(plans)
    }

    // ── Token balance ───────────────────────────────────────────────

    async fn add_to_balance(&self, user_id: &str, amount: Decimal) -> Result<Decimal, StoreError> {
        let conn = self.conn();
        let delta = amount.to_f64().unwrap_or(0.0);
        conn.execute(
            "INSERT INTO token_balances (user_id, balance, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                balance = balance + excluded.balance,
                updated_at = excluded.updated_at",
            params![user_id, delta, Utc::now().to_rfc3339()],
        )
        .await
        .map_err(|e| StoreError::Query(format!("add_to_balance: {e}")))?;

        let total = self.get_balance(user_id).await?;
        debug!(user_id, added = %amount, total = %total, "Balance updated");
        Ok(total)
    }

    async fn get_balance(&self, user_id: &str) -> Result<Decimal, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT balance FROM token_balances WHERE user_id = ?1",
                params![user_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_balance: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let balance: f64 = row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("get_balance parse: {e}")))?;
                Ok(decimal_from_real(balance))
            }
            Ok(None) => Ok(Decimal::ZERO),
            Err(e) => Err(StoreError::Query(format!("get_balance: {e}"))),
        }
    }

    // ── Usage events ────────────────────────────────────────────────

    async fn record_usage_event(&self, event: &UsageEvent) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO usage_events (id, user_id, event_type, messages_processed,
                tasks_created, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.id.clone(),
                event.user_id.clone(),
                event.event_type.clone(),
                i64::from(event.messages_processed),
                i64::from(event.tasks_created),
                event.created_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| StoreError::Query(format!("record_usage_event: {e}")))?;
        Ok(())
    }

    async fn count_usage_events(&self, user_id: &str) -> Result<u64, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM usage_events WHERE user_id = ?1",
                params![user_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("count_usage_events: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("count_usage_events parse: {e}")))?;
                Ok(count.max(0) as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(StoreError::Query(format!("count_usage_events: {e}"))),
        }
    }
}
