//! Pipeline orchestrator — sequences ingestion, enrichment, clustering,
//! synthesis, and persistence for one triage run.
//!
//! Stages run strictly in order; concurrency exists only inside the
//! enrichment stage. The per-user lock serializes overlapping runs for the
//! same user (a double-tapped "catch up" otherwise races the reward
//! write), and the ledger's run key makes the reward idempotent even
//! across processes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::ai::CompletionClient;
use crate::config::TriageConfig;
use crate::error::PipelineError;
use crate::pipeline::cluster::ClusteringStage;
use crate::pipeline::enrich::EnrichmentStage;
use crate::pipeline::persist::{PersistenceReport, PersistenceStage};
use crate::pipeline::synthesis::SynthesisStage;
use crate::pipeline::types::ActionPlan;
use crate::store::TriageStore;

/// Keyed advisory locks, one per user id.
struct UserLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl UserLocks {
    fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.inner.lock().expect("user lock map poisoned");
        Arc::clone(
            locks
                .entry(user_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}

/// The finished run: the plan, plus how persistence went.
#[derive(Debug)]
pub struct TriageOutcome {
    pub plan: ActionPlan,
    pub persistence: PersistenceReport,
}

/// Orchestrates one full triage run per invocation.
pub struct TriagePipeline {
    store: Arc<dyn TriageStore>,
    enrichment: EnrichmentStage,
    clustering: ClusteringStage,
    synthesis: SynthesisStage,
    persistence: PersistenceStage,
    locks: UserLocks,
    config: TriageConfig,
}

impl TriagePipeline {
    pub fn new(
        store: Arc<dyn TriageStore>,
        client: Arc<dyn CompletionClient>,
        config: TriageConfig,
    ) -> Self {
        Self {
            enrichment: EnrichmentStage::new(Arc::clone(&client), config.enrich_workers),
            clustering: ClusteringStage::new(Arc::clone(&client)),
            synthesis: SynthesisStage::new(client),
            persistence: PersistenceStage::new(Arc::clone(&store)),
            store,
            locks: UserLocks::new(),
            config,
        }
    }

    /// Run the whole pipeline for one user.
    ///
    /// Empty backlog is a fast, side-effect-free path. Failures before
    /// enrichment abort with no writes; a synthesis failure aborts before
    /// any write; persistence problems surface in the outcome's report
    /// rather than as an error.
    pub async fn run(&self, user_id: &str) -> Result<TriageOutcome, PipelineError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(PipelineError::Unauthorized);
        }

        let lock = self.locks.lock_for(user_id);
        let _held = lock.lock().await;

        let messages = self
            .store
            .fetch_unread_messages(user_id, self.config.fetch_limit)
            .await
            .map_err(|e| PipelineError::Fetch(e.to_string()))?;

        if messages.is_empty() {
            info!(user_id, "No unread messages, returning empty plan");
            return Ok(TriageOutcome {
                plan: ActionPlan::empty(),
                persistence: PersistenceReport::default(),
            });
        }

        info!(user_id, count = messages.len(), "Starting triage run");

        let mut enriched = self.enrichment.enrich_all(messages.clone()).await;
        self.clustering.cluster(&mut enriched).await;

        let plan = self
            .synthesis
            .synthesize(&enriched)
            .await
            .map_err(PipelineError::Synthesis)?;

        let (plan, persistence) = self.persistence.persist(user_id, plan, &messages).await;

        info!(
            user_id,
            messages = plan.messages_processed,
            tasks = plan.tasks_created(),
            reward = %plan.uct_reward_estimate,
            clean = persistence.is_clean(),
            "Triage run complete"
        );

        Ok(TriageOutcome { plan, persistence })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{CompletionRequest, CompletionResponse};
    use crate::error::AiError;
    use crate::pipeline::types::InboxMessage;
    use crate::store::LibSqlBackend;
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    /// Scripted client: answers each pipeline call type from canned JSON,
    /// optionally failing specific call types.
    struct ScriptedClient {
        fail_synthesis: bool,
    }

    impl ScriptedClient {
        fn healthy() -> Self {
            Self {
                fail_synthesis: false,
            }
        }
    }

    #[async_trait::async_trait]
    impl crate::ai::CompletionClient for ScriptedClient {
        fn model_name(&self) -> &str {
            "mock-scripted"
        }

        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, AiError> {
            let content = if request.system.contains("four axes") {
                r#"{"urgency": 8, "effort": 1, "impact": 7, "relationship": 5}"#.to_string()
            } else if request.system.contains("summarize and classify") {
                r#"{"summary": "Needs a decision on the launch date.",
                    "key_points": ["launch"], "suggested_action": "reply",
                    "tone": "direct", "extracted_dates": [], "tags": ["launch"]}"#
                    .to_string()
            } else if request.system.contains("topic clusters") {
                r#"{"clusters": [{"name": "Launch", "priority": "high", "message_ids": ["m-0"]}]}"#
                    .to_string()
            } else {
                if self.fail_synthesis {
                    return Err(AiError::RequestFailed {
                        reason: "injected synthesis failure".into(),
                    });
                }
                // Every message scores urgency 8 / impact 7 / effort 1
                r#"{"urgent_tasks": [{"title": "Decide launch date", "description": "",
                        "source_message_ids": ["m-0"], "priority": 1, "effort_estimate": 3}],
                    "quick_wins": [{"title": "Ack m-1", "description": "",
                        "source_message_ids": ["m-1"], "priority": 4, "effort_estimate": 1}],
                    "auto_replies": [{"message_id": "m-0", "subject": "Re: launch",
                        "body": "Let's ship Tuesday.", "tone": "direct"}],
                    "batch_recommendations": []}"#
                    .to_string()
            };
            Ok(CompletionResponse {
                content,
                input_tokens: 100,
                output_tokens: 100,
            })
        }
    }

    async fn seeded_store(user_id: &str, count: usize) -> Arc<LibSqlBackend> {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        for i in 0..count {
            store
                .insert_message(&InboxMessage {
                    id: format!("m-{i}"),
                    user_id: user_id.into(),
                    subject: Some(format!("subject {i}")),
                    body: "body".into(),
                    sender_name: None,
                    sender_address: "sender@example.com".into(),
                    unread: true,
                    received_at: Utc::now() - Duration::minutes(i as i64),
                })
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn missing_identity_is_unauthorized() {
        let store = seeded_store("u-1", 0).await;
        let pipeline = TriagePipeline::new(
            store,
            Arc::new(ScriptedClient::healthy()),
            TriageConfig::default(),
        );
        let result = pipeline.run("   ").await;
        assert!(matches!(result, Err(PipelineError::Unauthorized)));
    }

    #[tokio::test]
    async fn empty_backlog_returns_empty_plan_with_no_writes() {
        let store = seeded_store("u-1", 0).await;
        let pipeline = TriagePipeline::new(
            store.clone(),
            Arc::new(ScriptedClient::healthy()),
            TriageConfig::default(),
        );

        let outcome = pipeline.run("u-1").await.unwrap();

        assert_eq!(outcome.plan.messages_processed, 0);
        assert_eq!(outcome.plan.uct_reward_estimate, Decimal::ZERO);
        assert!(outcome.plan.urgent_tasks.is_empty());
        assert!(outcome.plan.ledger_id.is_none());
        assert!(outcome.plan.id.is_none());
        assert!(outcome.persistence.is_clean());

        // Zero writes of any kind
        assert_eq!(store.get_balance("u-1").await.unwrap(), Decimal::ZERO);
        assert!(store.list_ledger_entries("u-1", 10).await.unwrap().is_empty());
        assert!(store.list_action_plans("u-1", 10).await.unwrap().is_empty());
        assert_eq!(store.count_usage_events("u-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn full_run_produces_persisted_plan_and_reward() {
        let store = seeded_store("u-1", 4).await;
        let pipeline = TriagePipeline::new(
            store.clone(),
            Arc::new(ScriptedClient::healthy()),
            TriageConfig::default(),
        );

        let outcome = pipeline.run("u-1").await.unwrap();
        let plan = &outcome.plan;

        assert!(outcome.persistence.is_clean());
        assert_eq!(plan.messages_processed, 4);
        assert_eq!(plan.urgent_tasks.len(), 1);
        assert_eq!(plan.quick_wins.len(), 1);
        assert_eq!(plan.auto_replies.len(), 1);
        // 2 tasks, 4 messages: 2*0.5 + 4*0.2 + 1.0 = 2.8
        assert_eq!(plan.uct_reward_estimate, dec!(2.8));
        assert!(plan.id.is_some());
        assert!(plan.ledger_id.is_some());

        assert_eq!(store.get_balance("u-1").await.unwrap(), dec!(2.8));
        let entries = store.list_ledger_entries("u-1", 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reward, dec!(2.8));
        assert_eq!(store.count_usage_events("u-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn synthesis_failure_aborts_with_no_writes() {
        let store = seeded_store("u-1", 3).await;
        let pipeline = TriagePipeline::new(
            store.clone(),
            Arc::new(ScriptedClient {
                fail_synthesis: true,
            }),
            TriageConfig::default(),
        );

        let result = pipeline.run("u-1").await;
        assert!(matches!(result, Err(PipelineError::Synthesis(_))));

        assert_eq!(store.get_balance("u-1").await.unwrap(), Decimal::ZERO);
        assert!(store.list_ledger_entries("u-1", 10).await.unwrap().is_empty());
        assert!(store.list_action_plans("u-1", 10).await.unwrap().is_empty());
        assert_eq!(store.count_usage_events("u-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn repeated_run_over_same_backlog_rewards_once() {
        let store = seeded_store("u-1", 4).await;
        let pipeline = TriagePipeline::new(
            store.clone(),
            Arc::new(ScriptedClient::healthy()),
            TriageConfig::default(),
        );

        let first = pipeline.run("u-1").await.unwrap();
        // Messages stay unread (this pipeline never flips the flag), so a
        // second tap re-processes the identical set.
        let second = pipeline.run("u-1").await.unwrap();

        assert!(!first.persistence.duplicate_run);
        assert!(second.persistence.duplicate_run);
        assert_eq!(first.plan.ledger_id, second.plan.ledger_id);
        assert_eq!(
            store.get_balance("u-1").await.unwrap(),
            first.plan.uct_reward_estimate
        );
        assert_eq!(store.list_ledger_entries("u-1", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fetch_respects_configured_limit() {
        let store = seeded_store("u-1", 8).await;
        let pipeline = TriagePipeline::new(
            store,
            Arc::new(ScriptedClient::healthy()),
            TriageConfig {
                fetch_limit: 5,
                ..TriageConfig::default()
            },
        );

        let outcome = pipeline.run("u-1").await.unwrap();
        assert_eq!(outcome.plan.messages_processed, 5);
    }
}
