//! Enrichment stage — derives a summary and four-axis scores per message.
//!
//! Fan-out is bounded by a worker-pool semaphore: at most `workers`
//! messages are being enriched at once, each issuing its two completions
//! in parallel. Results are reassembled positionally, so output order
//! equals input order.
//!
//! A single message's failure never escapes the stage: transport errors,
//! parse errors, and malformed structures all collapse that message to
//! [`EnrichedMessage::fallback`].

use std::sync::Arc;

use chrono::NaiveDate;
use futures::future::join_all;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::ai::{parser, CompletionClient, CompletionRequest};
use crate::error::AiError;
use crate::pipeline::types::{EnrichedMessage, InboxMessage, MessageScores, SuggestedAction};

/// Temperature for the summarize/classify call.
const SUMMARY_TEMPERATURE: f32 = 0.2;

/// Temperature for the scoring call (deterministic-ish).
const SCORE_TEMPERATURE: f32 = 0.0;

const SUMMARY_MAX_TOKENS: u32 = 700;
const SCORE_MAX_TOKENS: u32 = 200;

/// Body characters sent per message (token efficiency).
const BODY_PREVIEW_CHARS: usize = 1500;

/// Enrichment stage — two completions per message, bounded fan-out.
pub struct EnrichmentStage {
    client: Arc<dyn CompletionClient>,
    workers: Arc<Semaphore>,
}

impl EnrichmentStage {
    pub fn new(client: Arc<dyn CompletionClient>, workers: usize) -> Self {
        Self {
            client,
            workers: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Enrich every message. Always returns one item per input, in input
    /// order.
    pub async fn enrich_all(&self, messages: Vec<InboxMessage>) -> Vec<EnrichedMessage> {
        let count = messages.len();
        debug!(count, "Enriching messages");

        let futures = messages.into_iter().map(|message| {
            let client = Arc::clone(&self.client);
            let workers = Arc::clone(&self.workers);
            async move {
                let Ok(_permit) = workers.acquire().await else {
                    // Semaphore is never closed; degrade rather than panic.
                    return EnrichedMessage::fallback(message);
                };
                enrich_one(client.as_ref(), message).await
            }
        });

        let enriched = join_all(futures).await;
        let fallbacks = enriched.iter().filter(|e| e.summary.is_empty()).count();
        debug!(count, fallbacks, "Enrichment complete");
        enriched
    }
}

/// Enrich a single message: summarize and score in parallel, fall back on
/// any failure.
async fn enrich_one(client: &dyn CompletionClient, message: InboxMessage) -> EnrichedMessage {
    let (summary, scores) = tokio::join!(
        request_summary(client, &message),
        request_scores(client, &message)
    );

    match (summary, scores) {
        (Ok(summary), Ok(scores)) => {
            debug!(id = %message.id, action = summary.suggested_action.label(), "Message enriched");
            EnrichedMessage {
                message,
                summary: summary.summary,
                key_points: summary.key_points,
                scores,
                extracted_dates: summary.extracted_dates,
                tags: summary.tags,
                suggested_action: summary.suggested_action,
                tone: summary.tone,
                cluster: None,
            }
        }
        (Err(e), _) | (_, Err(e)) => {
            warn!(id = %message.id, error = %e, "Enrichment failed, using fallback");
            EnrichedMessage::fallback(message)
        }
    }
}

// ── Summarize/classify call ─────────────────────────────────────────

struct SummaryOutcome {
    summary: String,
    key_points: Vec<String>,
    extracted_dates: Vec<NaiveDate>,
    tags: Vec<String>,
    suggested_action: SuggestedAction,
    tone: Option<String>,
}

async fn request_summary(
    client: &dyn CompletionClient,
    message: &InboxMessage,
) -> Result<SummaryOutcome, AiError> {
    let request = CompletionRequest::new(
        build_summary_system_prompt(),
        build_message_prompt(message),
    )
    .with_temperature(SUMMARY_TEMPERATURE)
    .with_max_tokens(SUMMARY_MAX_TOKENS);

    let response = client.complete(request).await?;
    let decoded: SummaryResponse = parser::decode_json(&response.content)?;

    let mut dates: Vec<NaiveDate> = decoded
        .extracted_dates
        .iter()
        .filter_map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
        .collect();
    dates.sort();
    dates.dedup();

    let mut tags = Vec::new();
    for tag in decoded.tags {
        let tag = tag.trim().to_string();
        if !tag.is_empty() && !tags.contains(&tag) {
            tags.push(tag);
        }
    }

    Ok(SummaryOutcome {
        summary: decoded.summary,
        key_points: decoded.key_points,
        extracted_dates: dates,
        tags,
        suggested_action: decoded.suggested_action,
        tone: if decoded.tone.is_empty() {
            None
        } else {
            Some(decoded.tone)
        },
    })
}

/// Summarize/classify response structure.
///
/// `suggested_action` is intentionally not defaulted — a response without a
/// recognizable action is malformed and the message falls back.
#[derive(Debug, Deserialize)]
struct SummaryResponse {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    key_points: Vec<String>,
    suggested_action: SuggestedAction,
    #[serde(default)]
    tone: String,
    #[serde(default)]
    extracted_dates: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
}

fn build_summary_system_prompt() -> String {
    "You summarize and classify one inbox message.\n\n\
     Respond with ONLY a JSON object:\n\
     {\"summary\": \"...\", \"key_points\": [\"...\"], \"suggested_action\": \"...\",\n\
      \"tone\": \"...\", \"extracted_dates\": [\"YYYY-MM-DD\"], \"tags\": [\"...\"]}\n\n\
     Rules:\n\
     - summary: 1-2 sentences, plain language\n\
     - suggested_action: one of \"reply\", \"schedule\", \"ignore\", \"archive\", \"create_task\"\n\
     - tone: how a reply should sound (max 8 words), empty string if no reply is needed\n\
     - extracted_dates: every concrete calendar date the message mentions, ISO format\n\
     - tags: up to 5 short lowercase topical tags"
        .to_string()
}

// ── Scoring call ────────────────────────────────────────────────────

async fn request_scores(
    client: &dyn CompletionClient,
    message: &InboxMessage,
) -> Result<MessageScores, AiError> {
    let request = CompletionRequest::new(
        build_score_system_prompt(),
        build_message_prompt(message),
    )
    .with_temperature(SCORE_TEMPERATURE)
    .with_max_tokens(SCORE_MAX_TOKENS);

    let response = client.complete(request).await?;
    let decoded: ScoreResponse = parser::decode_json(&response.content)?;
    Ok(MessageScores::clamped(
        decoded.urgency,
        decoded.effort,
        decoded.impact,
        decoded.relationship,
    ))
}

/// Scoring response structure. Missing axes are malformed — no defaults.
#[derive(Debug, Deserialize)]
struct ScoreResponse {
    urgency: i64,
    effort: i64,
    impact: i64,
    relationship: i64,
}

fn build_score_system_prompt() -> String {
    "You score one inbox message on four axes, each an integer 0-10.\n\n\
     Axes:\n\
     - urgency: 0 = no rush, 10 = needs immediate attention\n\
     - effort: 0 = no work to handle, 10 = hours of work\n\
     - impact: 0 = trivial, 10 = critical to the user's stated goals\n\
     - relationship: 0 = unknown sender, 10 = VIP or family\n\n\
     Respond with ONLY a JSON object:\n\
     {\"urgency\": 0, \"effort\": 0, \"impact\": 0, \"relationship\": 0}"
        .to_string()
}

// ── Shared prompt construction ──────────────────────────────────────

/// Render one message for either enrichment call.
fn build_message_prompt(message: &InboxMessage) -> String {
    let mut prompt = String::with_capacity(512);

    prompt.push_str(&format!("From: {}", message.sender_address));
    if let Some(ref name) = message.sender_name {
        prompt.push_str(&format!(" ({name})"));
    }
    prompt.push('\n');

    if let Some(ref subject) = message.subject {
        prompt.push_str(&format!("Subject: {subject}\n"));
    }
    prompt.push_str(&format!(
        "Received: {}\n",
        message.received_at.format("%Y-%m-%d %H:%M UTC")
    ));

    let body_preview: String = message.body.chars().take(BODY_PREVIEW_CHARS).collect();
    prompt.push_str(&format!("\nMessage:\n{body_preview}"));

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::CompletionResponse;
    use chrono::Utc;

    fn make_message(id: &str, subject: &str) -> InboxMessage {
        InboxMessage {
            id: id.into(),
            user_id: "u-1".into(),
            subject: Some(subject.into()),
            body: "Can we sync on the launch next week?".into(),
            sender_name: Some("Alice".into()),
            sender_address: "alice@example.com".into(),
            unread: true,
            received_at: Utc::now(),
        }
    }

    /// Mock client that answers the scoring and summary calls differently,
    /// and fails outright for messages whose payload contains a marker.
    struct MockEnrichClient {
        score_response: String,
        summary_response: String,
        fail_marker: Option<String>,
    }

    impl MockEnrichClient {
        fn healthy() -> Self {
            Self {
                score_response: r#"{"urgency": 8, "effort": 2, "impact": 7, "relationship": 6}"#
                    .into(),
                summary_response: r#"{"summary": "Alice wants to sync on the launch.",
                    "key_points": ["launch timing"], "suggested_action": "reply",
                    "tone": "friendly", "extracted_dates": ["2026-08-12"],
                    "tags": ["launch", "meeting", "launch"]}"#
                    .into(),
                fail_marker: None,
            }
        }
    }

    #[async_trait::async_trait]
    impl CompletionClient for MockEnrichClient {
        fn model_name(&self) -> &str {
            "mock-enrich"
        }

        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, AiError> {
            if let Some(ref marker) = self.fail_marker
                && request.user.contains(marker)
            {
                return Err(AiError::RequestFailed {
                    reason: "injected failure".into(),
                });
            }
            let content = if request.system.contains("four axes") {
                self.score_response.clone()
            } else {
                self.summary_response.clone()
            };
            Ok(CompletionResponse {
                content,
                input_tokens: 50,
                output_tokens: 30,
            })
        }
    }

    /// Client that always errors — exercises the total-failure fallback.
    struct AlwaysFailClient;

    #[async_trait::async_trait]
    impl CompletionClient for AlwaysFailClient {
        fn model_name(&self) -> &str {
            "mock-fail"
        }

        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, AiError> {
            Err(AiError::RateLimited { retry_after: None })
        }
    }

    #[tokio::test]
    async fn enriches_message_with_scores_and_summary() {
        let stage = EnrichmentStage::new(Arc::new(MockEnrichClient::healthy()), 5);
        let enriched = stage.enrich_all(vec![make_message("m-1", "Launch")]).await;

        assert_eq!(enriched.len(), 1);
        let item = &enriched[0];
        assert_eq!(item.scores.urgency, 8);
        assert_eq!(item.scores.effort, 2);
        assert_eq!(item.suggested_action, SuggestedAction::Reply);
        assert_eq!(item.tone.as_deref(), Some("friendly"));
        assert_eq!(
            item.extracted_dates,
            vec![NaiveDate::from_ymd_opt(2026, 8, 12).unwrap()]
        );
        // Duplicate tag deduplicated
        assert_eq!(item.tags, vec!["launch", "meeting"]);
    }

    #[tokio::test]
    async fn all_failures_yield_fallbacks_same_length() {
        let stage = EnrichmentStage::new(Arc::new(AlwaysFailClient), 5);
        let messages: Vec<InboxMessage> = (0..12)
            .map(|i| make_message(&format!("m-{i}"), "subject"))
            .collect();

        let enriched = stage.enrich_all(messages).await;

        assert_eq!(enriched.len(), 12);
        for item in &enriched {
            assert_eq!(item.scores, MessageScores::default());
            assert_eq!(item.suggested_action, SuggestedAction::Ignore);
            assert!(item.summary.is_empty());
        }
    }

    #[tokio::test]
    async fn single_failure_does_not_abort_stage() {
        let client = MockEnrichClient {
            fail_marker: Some("POISON".into()),
            ..MockEnrichClient::healthy()
        };
        let stage = EnrichmentStage::new(Arc::new(client), 5);

        let mut messages: Vec<InboxMessage> = (0..12)
            .map(|i| make_message(&format!("m-{i}"), "subject"))
            .collect();
        messages[3].body = "POISON".into();
        messages[9].body = "POISON".into();

        let enriched = stage.enrich_all(messages).await;

        assert_eq!(enriched.len(), 12);
        assert_eq!(enriched[3].suggested_action, SuggestedAction::Ignore);
        assert_eq!(enriched[3].scores, MessageScores::default());
        assert_eq!(enriched[9].scores, MessageScores::default());
        // Neighbors unaffected
        assert_eq!(enriched[2].scores.urgency, 8);
        assert_eq!(enriched[10].scores.urgency, 8);
    }

    #[tokio::test]
    async fn output_order_matches_input_order() {
        let stage = EnrichmentStage::new(Arc::new(MockEnrichClient::healthy()), 2);
        let messages: Vec<InboxMessage> = (0..7)
            .map(|i| make_message(&format!("m-{i}"), "subject"))
            .collect();

        let enriched = stage.enrich_all(messages).await;
        let ids: Vec<&str> = enriched.iter().map(|e| e.message.id.as_str()).collect();
        assert_eq!(ids, vec!["m-0", "m-1", "m-2", "m-3", "m-4", "m-5", "m-6"]);
    }

    #[tokio::test]
    async fn malformed_scores_fall_back() {
        let client = MockEnrichClient {
            score_response: r#"{"urgency": "high"}"#.into(),
            ..MockEnrichClient::healthy()
        };
        let stage = EnrichmentStage::new(Arc::new(client), 5);
        let enriched = stage.enrich_all(vec![make_message("m-1", "x")]).await;
        assert_eq!(enriched[0].scores, MessageScores::default());
        assert_eq!(enriched[0].suggested_action, SuggestedAction::Ignore);
    }

    #[tokio::test]
    async fn out_of_range_scores_clamped() {
        let client = MockEnrichClient {
            score_response: r#"{"urgency": 14, "effort": -2, "impact": 10, "relationship": 3}"#
                .into(),
            ..MockEnrichClient::healthy()
        };
        let stage = EnrichmentStage::new(Arc::new(client), 5);
        let enriched = stage.enrich_all(vec![make_message("m-1", "x")]).await;
        let scores = enriched[0].scores;
        assert_eq!(scores.urgency, 10);
        assert_eq!(scores.effort, 0);
        assert!(scores.impact <= 10 && scores.relationship <= 10);
    }

    #[tokio::test]
    async fn unknown_action_falls_back() {
        let client = MockEnrichClient {
            summary_response:
                r#"{"summary": "x", "suggested_action": "escalate"}"#.into(),
            ..MockEnrichClient::healthy()
        };
        let stage = EnrichmentStage::new(Arc::new(client), 5);
        let enriched = stage.enrich_all(vec![make_message("m-1", "x")]).await;
        assert_eq!(enriched[0].suggested_action, SuggestedAction::Ignore);
    }

    /// Client that records the peak number of in-flight completion calls.
    struct ConcurrencyProbeClient {
        current: std::sync::atomic::AtomicUsize,
        peak: std::sync::atomic::AtomicUsize,
    }

    impl ConcurrencyProbeClient {
        fn new() -> Self {
            Self {
                current: std::sync::atomic::AtomicUsize::new(0),
                peak: std::sync::atomic::AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl CompletionClient for ConcurrencyProbeClient {
        fn model_name(&self) -> &str {
            "mock-probe"
        }

        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, AiError> {
            use std::sync::atomic::Ordering;
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);

            let content = if request.system.contains("four axes") {
                r#"{"urgency": 1, "effort": 1, "impact": 1, "relationship": 1}"#
            } else {
                r#"{"summary": "s", "suggested_action": "archive"}"#
            };
            Ok(CompletionResponse {
                content: content.to_string(),
                input_tokens: 10,
                output_tokens: 10,
            })
        }
    }

    #[tokio::test]
    async fn fan_out_bounded_by_worker_count() {
        let client = Arc::new(ConcurrencyProbeClient::new());
        let stage = EnrichmentStage::new(client.clone(), 5);
        let messages: Vec<InboxMessage> = (0..20)
            .map(|i| make_message(&format!("m-{i}"), "subject"))
            .collect();

        let enriched = stage.enrich_all(messages).await;
        assert_eq!(enriched.len(), 20);

        // Each in-flight message issues its two completions in parallel,
        // so 5 workers allow at most 10 concurrent outbound calls.
        let peak = client.peak.load(std::sync::atomic::Ordering::SeqCst);
        assert!(peak <= 10, "peak concurrent calls was {peak}");
    }

    #[test]
    fn message_prompt_includes_metadata() {
        let message = make_message("m-1", "Quarterly review");
        let prompt = build_message_prompt(&message);
        assert!(prompt.contains("alice@example.com"));
        assert!(prompt.contains("Alice"));
        assert!(prompt.contains("Quarterly review"));
        assert!(prompt.contains("Can we sync"));
    }

    #[test]
    fn message_prompt_truncates_body() {
        let mut message = make_message("m-1", "x");
        message.body = "y".repeat(4000);
        let prompt = build_message_prompt(&message);
        assert!(prompt.len() < 1800);
    }
}
