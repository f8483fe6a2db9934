//! Message triage pipeline.
//!
//! One run flows through four stages in order:
//! 1. `EnrichmentStage` — per-message summary + four-axis scores, bounded
//!    fan-out, per-item fallback
//! 2. `ClusteringStage` — best-effort topic labels, never fatal
//! 3. `SynthesisStage` — one call producing the action plan, sanitized
//!    before anything downstream trusts it
//! 4. `PersistenceStage` — five-step saga (tasks, ledger, plan, balance,
//!    usage) with per-step outcomes
//!
//! `TriagePipeline` sequences the stages and owns the per-user lock.

pub mod cluster;
pub mod enrich;
pub mod orchestrator;
pub mod persist;
pub mod synthesis;
pub mod types;

pub use orchestrator::{TriageOutcome, TriagePipeline};
pub use persist::{PersistStep, PersistenceReport};
pub use types::{
    ActionPlan, ActionPlanTask, AutoReplyDraft, BatchRecommendation, EnrichedMessage,
    InboxMessage, MessageScores, SuggestedAction,
};
