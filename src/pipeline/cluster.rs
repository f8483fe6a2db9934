//! Clustering stage — best-effort topic grouping.
//!
//! One completion call over compact representations of every enriched
//! message. The returned groupings are applied onto the items' `cluster`
//! field in place. This stage is never a pipeline gate: any failure logs
//! and leaves the items exactly as they were.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::ai::{parser, CompletionClient, CompletionRequest};
use crate::error::AiError;
use crate::pipeline::types::EnrichedMessage;

const CLUSTER_TEMPERATURE: f32 = 0.2;
const CLUSTER_MAX_TOKENS: u32 = 1000;

/// Clustering stage — one call, applied in place, never fatal.
pub struct ClusteringStage {
    client: Arc<dyn CompletionClient>,
}

impl ClusteringStage {
    pub fn new(client: Arc<dyn CompletionClient>) -> Self {
        Self { client }
    }

    /// Assign topic labels to the messages. On failure the input is left
    /// unchanged.
    pub async fn cluster(&self, messages: &mut [EnrichedMessage]) {
        if messages.is_empty() {
            return;
        }

        match self.request_clusters(messages).await {
            Ok(groups) => {
                let assigned = apply_clusters(messages, &groups);
                debug!(
                    clusters = groups.len(),
                    assigned,
                    total = messages.len(),
                    "Clusters applied"
                );
            }
            Err(e) => {
                warn!(error = %e, "Clustering failed, proceeding unclustered");
            }
        }
    }

    async fn request_clusters(
        &self,
        messages: &[EnrichedMessage],
    ) -> Result<Vec<ClusterGroup>, AiError> {
        let request = CompletionRequest::new(
            build_cluster_system_prompt(),
            build_cluster_user_prompt(messages),
        )
        .with_temperature(CLUSTER_TEMPERATURE)
        .with_max_tokens(CLUSTER_MAX_TOKENS);

        let response = self.client.complete(request).await?;
        let decoded: ClusterResponse = parser::decode_json(&response.content)?;
        Ok(decoded.clusters)
    }
}

/// Apply cluster names onto the items. Ids the model invented are skipped.
/// Returns the number of messages labeled.
fn apply_clusters(messages: &mut [EnrichedMessage], groups: &[ClusterGroup]) -> usize {
    let mut by_id: HashMap<&str, &str> = HashMap::new();
    for group in groups {
        for id in &group.message_ids {
            by_id.insert(id.as_str(), group.name.as_str());
        }
    }

    let mut known = 0;
    for m in messages.iter_mut() {
        if let Some(name) = by_id.get(m.message.id.as_str()) {
            m.cluster = Some((*name).to_string());
            known += 1;
        }
    }

    let unknown = by_id.len().saturating_sub(known);
    if unknown > 0 {
        warn!(unknown, "Cluster response referenced unknown message ids");
    }
    known
}

#[derive(Debug, Deserialize)]
struct ClusterResponse {
    #[serde(default)]
    clusters: Vec<ClusterGroup>,
}

#[derive(Debug, Deserialize)]
struct ClusterGroup {
    name: String,
    #[serde(default)]
    #[allow(dead_code)]
    priority: String,
    #[serde(default)]
    message_ids: Vec<String>,
}

fn build_cluster_system_prompt() -> String {
    "You group inbox messages into named topic clusters.\n\n\
     Respond with ONLY a JSON object:\n\
     {\"clusters\": [{\"name\": \"...\", \"priority\": \"high|medium|low\", \"message_ids\": [\"...\"]}]}\n\n\
     Rules:\n\
     - Cluster names are short (2-4 words) and describe the topic\n\
     - Every message_id must come from the input, each in at most one cluster\n\
     - A message that fits no cluster may be omitted"
        .to_string()
}

fn build_cluster_user_prompt(messages: &[EnrichedMessage]) -> String {
    let mut prompt = String::with_capacity(messages.len() * 128);
    prompt.push_str("Messages:\n");
    for m in messages {
        prompt.push_str(&format!(
            "- id: {} | subject: {} | summary: {} | tags: {}\n",
            m.message.id,
            m.message.subject.as_deref().unwrap_or("(none)"),
            m.summary,
            m.tags.join(", "),
        ));
    }
    prompt
}
