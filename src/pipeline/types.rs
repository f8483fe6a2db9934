//! Shared types for the triage pipeline.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ── Inbox message ───────────────────────────────────────────────────

/// An unread message as fetched from the message store.
///
/// The pipeline treats it as immutable — the unread flag in particular is
/// left untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxMessage {
    /// Store-assigned ID.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// Subject line, if the channel has one.
    pub subject: Option<String>,
    /// Message body.
    pub body: String,
    /// Human-readable sender name, if available.
    pub sender_name: Option<String>,
    /// Sender address (email address, handle).
    pub sender_address: String,
    /// Whether the message is still unread.
    pub unread: bool,
    /// When the message was received.
    pub received_at: DateTime<Utc>,
}

// ── Enrichment output ───────────────────────────────────────────────

/// What the user should do with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedAction {
    Reply,
    Schedule,
    Ignore,
    Archive,
    CreateTask,
}

impl SuggestedAction {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Reply => "reply",
            Self::Schedule => "schedule",
            Self::Ignore => "ignore",
            Self::Archive => "archive",
            Self::CreateTask => "create_task",
        }
    }
}

/// Four-axis message scores, each an integer in `[0, 10]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageScores {
    /// 0 = no rush, 10 = needs immediate attention.
    pub urgency: u8,
    /// 0 = no work, 10 = hours of work.
    pub effort: u8,
    /// 0 = trivial, 10 = critical to stated goals.
    pub impact: u8,
    /// 0 = unknown sender, 10 = VIP/family.
    pub relationship: u8,
}

impl MessageScores {
    /// Build scores from raw model output, clamping each axis into range.
    pub fn clamped(urgency: i64, effort: i64, impact: i64, relationship: i64) -> Self {
        let clamp = |v: i64| v.clamp(0, 10) as u8;
        Self {
            urgency: clamp(urgency),
            effort: clamp(effort),
            impact: clamp(impact),
            relationship: clamp(relationship),
        }
    }
}

/// A message plus everything the enrichment stage derived about it.
///
/// Transient working state for one pipeline run — never persisted directly.
#[derive(Debug, Clone)]
pub struct EnrichedMessage {
    pub message: InboxMessage,
    pub summary: String,
    pub key_points: Vec<String>,
    pub scores: MessageScores,
    /// Calendar dates mentioned in the message, ascending.
    pub extracted_dates: Vec<NaiveDate>,
    pub tags: Vec<String>,
    pub suggested_action: SuggestedAction,
    /// Tone hint for drafting a reply.
    pub tone: Option<String>,
    /// Topic label assigned by the clustering stage, when it succeeds.
    pub cluster: Option<String>,
}

impl EnrichedMessage {
    /// Degraded result for a message whose enrichment calls failed.
    ///
    /// All scores zero (never absent), no summary, action `ignore`.
    pub fn fallback(message: InboxMessage) -> Self {
        Self {
            message,
            summary: String::new(),
            key_points: Vec::new(),
            scores: MessageScores::default(),
            extracted_dates: Vec::new(),
            tags: Vec::new(),
            suggested_action: SuggestedAction::Ignore,
            tone: None,
            cluster: None,
        }
    }
}

// ── Action plan ─────────────────────────────────────────────────────

/// A task proposed by plan synthesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionPlanTask {
    /// Task-store ID, assigned at persistence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub title: String,
    pub description: String,
    /// Messages this task derives from.
    pub source_message_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    /// Priority rank, 1 (highest) to 5.
    pub priority: u8,
    /// Effort estimate, 1 to 10.
    pub effort_estimate: u8,
}

/// A drafted reply for a message whose suggested action is `reply`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoReplyDraft {
    pub message_id: String,
    pub subject: String,
    pub body: String,
    pub tone: String,
}

/// A suggested grouping of messages to clear in one pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecommendation {
    pub message_ids: Vec<String>,
    pub batch_size: usize,
    pub goal: String,
}

/// The finished triage output: prioritized buckets, drafts, batching
/// suggestions, and the reward credited for the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionPlan {
    /// Plan-store ID, assigned at persistence.
    #[serde(default)]
    pub id: Option<String>,
    /// High-urgency, high-impact tasks. At most 3.
    pub urgent_tasks: Vec<ActionPlanTask>,
    /// Low-effort tasks. At most 7.
    pub quick_wins: Vec<ActionPlanTask>,
    pub auto_replies: Vec<AutoReplyDraft>,
    pub batch_recommendations: Vec<BatchRecommendation>,
    pub uct_reward_estimate: Decimal,
    /// Count of messages fetched at ingestion, regardless of enrichment
    /// fallbacks.
    pub messages_processed: usize,
    /// Ledger entry recording this run, once persisted.
    #[serde(default)]
    pub ledger_id: Option<String>,
}

impl ActionPlan {
    /// The empty plan returned for a zero-message backlog.
    pub fn empty() -> Self {
        Self {
            id: None,
            urgent_tasks: Vec::new(),
            quick_wins: Vec::new(),
            auto_replies: Vec::new(),
            batch_recommendations: Vec::new(),
            uct_reward_estimate: Decimal::ZERO,
            messages_processed: 0,
            ledger_id: None,
        }
    }

    /// Total tasks across both buckets.
    pub fn tasks_created(&self) -> usize {
        self.urgent_tasks.len() + self.quick_wins.len()
    }

    /// Every message id referenced by a task in either bucket.
    pub fn task_message_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .urgent_tasks
            .iter()
            .chain(self.quick_wins.iter())
            .flat_map(|t| t.source_message_ids.iter().cloned())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}
