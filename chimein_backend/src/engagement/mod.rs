//! Engagement pipeline: decides whether a persona should chime into a channel
//! and, if so, delivers exactly one interjection per run.
//!
//! The pipeline talks to the outside world only through the traits in this
//! module and the store traits in the submodules, so every collaborator can be
//! swapped for a fake in tests.

pub mod config_store;
pub mod coordinator;
pub mod decision;
pub mod delivery;
pub mod generation;
pub mod knowledge;
pub mod persona;
pub mod window;

#[cfg(test)]
pub(crate) mod fakes;

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use config_store::{ConfigStore, EngagementConfig, EngagementConfigPatch, ENGAGEMENT_CONFIG_ID};
pub use coordinator::{
    ChannelOutcome, EngagementCoordinator, EngagementDeps, RunLease, RunOutcome,
};
pub use decision::{DecisionMaker, EngagementDecision, ResponseTone};
pub use delivery::{AuditStore, Delivered, PersonaChatRecord};
pub use generation::ResponseGenerator;
pub use knowledge::KnowledgeAugmenter;
pub use persona::{resolve_persona, Persona, PersonaRoster};
pub use window::{build_transcript, ConversationWindow, WindowMessage};

/// A message as reported by the chat transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    pub author: String,
    /// Bots, webhooks and other non-human senders.
    pub is_automated: bool,
    pub content: String,
    pub timestamp_ms: i64,
}

/// Display identity a persona posts under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonaIdentity {
    pub name: String,
    pub avatar: String,
    pub color: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub message_id: Option<String>,
}

/// Chat platform the pipeline reads from and posts into.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Most recent messages of a channel, newest-first or oldest-first; callers sort.
    async fn fetch_recent_messages(
        &self,
        channel_id: &str,
        limit: usize,
    ) -> Result<Vec<TransportMessage>>;

    /// Post `text` into the channel under the persona's display identity.
    async fn post_as_persona(
        &self,
        channel_id: &str,
        identity: &PersonaIdentity,
        text: &str,
    ) -> Result<DeliveryReceipt>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Opaque text-completion service. Used both for the join/no-join reasoning
/// step and for in-character generation.
#[async_trait]
pub trait CompletionOracle: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeHit {
    pub text: String,
    pub score: f64,
    #[serde(default)]
    pub source: Option<String>,
}

/// Background-knowledge search service.
#[async_trait]
pub trait RetrievalOracle: Send + Sync {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<KnowledgeHit>>;
}

/// Stage of the per-channel pipeline, used to label channel-local failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Gate,
    Fetch,
    Generate,
    Deliver,
}

impl PipelineStage {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStage::Gate => "gate",
            PipelineStage::Fetch => "fetch",
            PipelineStage::Generate => "generate",
            PipelineStage::Deliver => "deliver",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure confined to one channel; the run moves on to the next channel.
#[derive(Debug)]
pub struct ChannelFailure {
    pub stage: PipelineStage,
    pub error: anyhow::Error,
}

impl ChannelFailure {
    pub fn new(stage: PipelineStage, error: anyhow::Error) -> Self {
        Self { stage, error }
    }
}

impl fmt::Display for ChannelFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} stage failed: {:#}", self.stage, self.error)
    }
}

/// Progress notifications emitted while a run executes.
#[derive(Debug, Clone)]
pub enum EngagementEvent {
    RunStarted {
        run_id: String,
        channel_count: usize,
    },
    ChannelSkipped {
        channel_id: String,
        reason: String,
    },
    ChannelFailed {
        channel_id: String,
        stage: PipelineStage,
        error: String,
    },
    Interjected {
        channel_id: String,
        persona_name: String,
        record_id: String,
    },
    RunFinished {
        run_id: String,
        outcome: RunOutcome,
    },
    RunAborted {
        run_id: String,
        error: String,
    },
}
