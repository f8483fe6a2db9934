//! Plan synthesis stage — one completion that turns the enriched (and
//! possibly clustered) messages into the structured action plan.
//!
//! The model's output is never trusted verbatim. After decoding, the plan
//! is sanitized: invented message ids are stripped, the bucket selection
//! rules are re-checked, caps are enforced, numeric fields are clamped,
//! and the reward estimate is recomputed from the formula.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::ai::{parser, CompletionClient, CompletionRequest};
use crate::error::AiError;
use crate::pipeline::types::{
    ActionPlan, ActionPlanTask, AutoReplyDraft, BatchRecommendation, EnrichedMessage,
    SuggestedAction,
};

/// Urgent bucket: at most 3 tasks, all sources with urgency ≥ 7 and impact ≥ 6.
const URGENT_TASK_CAP: usize = 3;
const URGENT_URGENCY_FLOOR: u8 = 7;
const URGENT_IMPACT_FLOOR: u8 = 6;

/// Quick-win bucket: at most 7 tasks, all sources with effort ≤ 2.
const QUICK_WIN_CAP: usize = 7;
const QUICK_WIN_EFFORT_CEILING: u8 = 2;

const SYNTHESIS_TEMPERATURE: f32 = 0.3;
const SYNTHESIS_MAX_TOKENS: u32 = 2000;

/// Reward credited per created task.
const REWARD_PER_TASK: Decimal = dec!(0.5);
/// Reward credited per processed message.
const REWARD_PER_MESSAGE: Decimal = dec!(0.2);
/// Flat reward for completing a run.
const REWARD_BASE: Decimal = dec!(1.0);

/// Reward formula: `tasks * 0.5 + messages * 0.2 + 1.0`, exact decimal.
pub fn compute_reward(tasks_created: usize, messages_processed: usize) -> Decimal {
    Decimal::from(tasks_created as u64) * REWARD_PER_TASK
        + Decimal::from(messages_processed as u64) * REWARD_PER_MESSAGE
        + REWARD_BASE
}

/// Plan synthesis stage. Errors here abort the run — downstream
/// persistence depends on this output.
pub struct SynthesisStage {
    client: Arc<dyn CompletionClient>,
}

impl SynthesisStage {
    pub fn new(client: Arc<dyn CompletionClient>) -> Self {
        Self { client }
    }

    /// Produce the sanitized plan draft (no persistence ids yet).
    pub async fn synthesize(&self, messages: &[EnrichedMessage]) -> Result<ActionPlan, AiError> {
        let request = CompletionRequest::new(
            build_synthesis_system_prompt(),
            build_synthesis_user_prompt(messages),
        )
        .with_temperature(SYNTHESIS_TEMPERATURE)
        .with_max_tokens(SYNTHESIS_MAX_TOKENS);

        let response = self.client.complete(request).await?;
        let decoded: PlanResponse = parser::decode_json(&response.content)?;
        let plan = sanitize_plan(decoded, messages);
        debug!(
            urgent = plan.urgent_tasks.len(),
            quick_wins = plan.quick_wins.len(),
            replies = plan.auto_replies.len(),
            reward = %plan.uct_reward_estimate,
            "Plan synthesized"
        );
        Ok(plan)
    }
}

// ── Sanitization ────────────────────────────────────────────────────

/// Rebuild the plan from the decoded response, keeping only what the
/// selection rules allow.
fn sanitize_plan(response: PlanResponse, messages: &[EnrichedMessage]) -> ActionPlan {
    let by_id: HashMap<&str, &EnrichedMessage> = messages
        .iter()
        .map(|m| (m.message.id.as_str(), m))
        .collect();

    let mut urgent_tasks: Vec<ActionPlanTask> = response
        .urgent_tasks
        .into_iter()
        .filter_map(|t| convert_task(t, &by_id))
        .filter(|t| {
            t.source_message_ids.iter().all(|id| {
                by_id.get(id.as_str()).is_some_and(|m| {
                    m.scores.urgency >= URGENT_URGENCY_FLOOR
                        && m.scores.impact >= URGENT_IMPACT_FLOOR
                })
            })
        })
        .collect();
    if urgent_tasks.len() > URGENT_TASK_CAP {
        warn!(
            dropped = urgent_tasks.len() - URGENT_TASK_CAP,
            "Urgent bucket over cap, truncating"
        );
        urgent_tasks.truncate(URGENT_TASK_CAP);
    }

    let mut quick_wins: Vec<ActionPlanTask> = response
        .quick_wins
        .into_iter()
        .filter_map(|t| convert_task(t, &by_id))
        .filter(|t| {
            t.source_message_ids.iter().all(|id| {
                by_id
                    .get(id.as_str())
                    .is_some_and(|m| m.scores.effort <= QUICK_WIN_EFFORT_CEILING)
            })
        })
        .collect();
    if quick_wins.len() > QUICK_WIN_CAP {
        warn!(
            dropped = quick_wins.len() - QUICK_WIN_CAP,
            "Quick-win bucket over cap, truncating"
        );
        quick_wins.truncate(QUICK_WIN_CAP);
    }

    let auto_replies: Vec<AutoReplyDraft> = response
        .auto_replies
        .into_iter()
        .filter(|r| {
            by_id
                .get(r.message_id.as_str())
                .is_some_and(|m| m.suggested_action == SuggestedAction::Reply)
        })
        .map(|r| AutoReplyDraft {
            message_id: r.message_id,
            subject: r.subject,
            body: r.body,
            tone: r.tone,
        })
        .collect();

    let batch_recommendations: Vec<BatchRecommendation> = response
        .batch_recommendations
        .into_iter()
        .filter_map(|b| {
            let ids: Vec<String> = b
                .message_ids
                .into_iter()
                .filter(|id| by_id.contains_key(id.as_str()))
                .collect();
            if ids.is_empty() {
                return None;
            }
            Some(BatchRecommendation {
                batch_size: ids.len(),
                message_ids: ids,
                goal: b.goal,
            })
        })
        .collect();

    let tasks_created = urgent_tasks.len() + quick_wins.len();
    let messages_processed = messages.len();

    ActionPlan {
        id: None,
        urgent_tasks,
        quick_wins,
        auto_replies,
        batch_recommendations,
        uct_reward_estimate: compute_reward(tasks_created, messages_processed),
        messages_processed,
        ledger_id: None,
    }
}

/// Convert one task item, stripping invented ids. A task left without any
/// valid source message is dropped.
fn convert_task(
    item: TaskItem,
    by_id: &HashMap<&str, &EnrichedMessage>,
) -> Option<ActionPlanTask> {
    let source_message_ids: Vec<String> = item
        .source_message_ids
        .into_iter()
        .filter(|id| by_id.contains_key(id.as_str()))
        .collect();
    if source_message_ids.is_empty() {
        return None;
    }

    let due_date = item
        .due_date
        .and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok());

    Some(ActionPlanTask {
        id: None,
        title: item.title,
        description: item.description,
        source_message_ids,
        due_date,
        priority: item.priority.clamp(1, 5) as u8,
        effort_estimate: item.effort_estimate.clamp(1, 10) as u8,
    })
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PlanResponse {
    #[serde(default)]
    urgent_tasks: Vec<TaskItem>,
    #[serde(default)]
    quick_wins: Vec<TaskItem>,
    #[serde(default)]
    auto_replies: Vec<ReplyItem>,
    #[serde(default)]
    batch_recommendations: Vec<BatchItem>,
}

#[derive(Debug, Deserialize)]
struct TaskItem {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    source_message_ids: Vec<String>,
    #[serde(default)]
    due_date: Option<String>,
    #[serde(default)]
    priority: i64,
    #[serde(default)]
    effort_estimate: i64,
}

#[derive(Debug, Deserialize)]
struct ReplyItem {
    message_id: String,
    #[serde(default)]
    subject: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    tone: String,
}

#[derive(Debug, Deserialize)]
struct BatchItem {
    #[serde(default)]
    message_ids: Vec<String>,
    #[serde(default)]
    goal: String,
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_synthesis_system_prompt() -> String {
    format!(
        "You turn a scored inbox into a prioritized action plan.\n\n\
         Respond with ONLY a JSON object:\n\
         {{\"urgent_tasks\": [{{\"title\": \"...\", \"description\": \"...\",\n\
            \"source_message_ids\": [\"...\"], \"due_date\": \"YYYY-MM-DD or null\",\n\
            \"priority\": 1, \"effort_estimate\": 1}}],\n\
           \"quick_wins\": [...same shape...],\n\
           \"auto_replies\": [{{\"message_id\": \"...\", \"subject\": \"...\", \"body\": \"...\", \"tone\": \"...\"}}],\n\
           \"batch_recommendations\": [{{\"message_ids\": [\"...\"], \"goal\": \"...\"}}]}}\n\n\
         Rules:\n\
         - urgent_tasks: only messages with urgency >= {URGENT_URGENCY_FLOOR} and impact >= {URGENT_IMPACT_FLOOR}, at most {URGENT_TASK_CAP} tasks\n\
         - quick_wins: only messages with effort <= {QUICK_WIN_EFFORT_CEILING}, at most {QUICK_WIN_CAP} tasks\n\
         - auto_replies: only messages whose suggested_action is \"reply\"\n\
         - batch_recommendations: group similar low-value messages (same cluster or tags) with a one-line goal\n\
         - priority: 1 (highest) to 5; effort_estimate: 1 to 10\n\
         - Use only message ids from the input"
    )
}

fn build_synthesis_user_prompt(messages: &[EnrichedMessage]) -> String {
    let mut prompt = String::with_capacity(messages.len() * 256);
    prompt.push_str("Inbox:\n");
    for m in messages {
        prompt.push_str(&format!(
            "- id: {}\n  subject: {}\n  summary: {}\n  scores: urgency={} effort={} impact={} relationship={}\n",
            m.message.id,
            m.message.subject.as_deref().unwrap_or("(none)"),
            m.summary,
            m.scores.urgency,
            m.scores.effort,
            m.scores.impact,
            m.scores.relationship,
        ));
        prompt.push_str(&format!(
            "  suggested_action: {}\n",
            m.suggested_action.label()
        ));
        if !m.extracted_dates.is_empty() {
            let dates: Vec<String> = m
                .extracted_dates
                .iter()
                .map(|d| d.format("%Y-%m-%d").to_string())
                .collect();
            prompt.push_str(&format!("  dates: {}\n", dates.join(", ")));
        }
        if !m.tags.is_empty() {
            prompt.push_str(&format!("  tags: {}\n", m.tags.join(", ")));
        }
        if let Some(ref cluster) = m.cluster {
            prompt.push_str(&format!("  cluster: {cluster}\n"));
        }
    }
    prompt
}
