use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::config_store::{ConfigStore, EngagementConfig, ENGAGEMENT_CONFIG_ID};
use super::decision::DecisionMaker;
use super::delivery::{deliver, AuditStore, Delivered};
use super::generation::ResponseGenerator;
use super::knowledge::KnowledgeAugmenter;
use super::persona::{resolve_persona, Persona, PersonaRoster};
use super::window::{build_transcript, extract_window};
use super::{
    ChannelFailure, ChatTransport, CompletionOracle, EngagementEvent, PipelineStage,
    RetrievalOracle,
};

pub const DEFAULT_RUN_LEASE: Duration = Duration::from_secs(600);

/// Exclusive, time-bounded claim on a run. Expired leases can be taken over.
pub trait RunLease: Send + Sync {
    fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Push the expiry out by `ttl` if `holder` still owns the lease. Returns
    /// `false` once another holder has taken it over.
    fn renew(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool>;

    fn release(&self, key: &str, holder: &str) -> Result<()>;
}

/// Releases the run lease when dropped, including when the run future is cancelled.
struct LeaseGuard {
    lease: Arc<dyn RunLease>,
    holder: String,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Err(e) = self.lease.release(ENGAGEMENT_CONFIG_ID, &self.holder) {
            tracing::warn!("Failed to release engagement run lease {}: {:#}", self.holder, e);
        }
    }
}

/// Everything a run talks to.
pub struct EngagementDeps {
    pub config: Arc<dyn ConfigStore>,
    pub roster: Arc<dyn PersonaRoster>,
    pub audit: Arc<dyn AuditStore>,
    pub lease: Arc<dyn RunLease>,
    pub transport: Arc<dyn ChatTransport>,
    pub reasoning: Arc<dyn CompletionOracle>,
    pub generation: Arc<dyn CompletionOracle>,
    /// `None` when no retrieval service is configured.
    pub retrieval: Option<Arc<dyn RetrievalOracle>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Disabled,
    NoChannels,
    LeaseHeld,
    NoPersonas,
    Interjected {
        channel_id: String,
        persona_name: String,
        record_id: String,
        audit_recorded: bool,
    },
    NoInterjection {
        channels_evaluated: usize,
    },
    /// Another run took the lease over before this one could deliver.
    LeaseLost {
        channels_evaluated: usize,
    },
}

/// Result of evaluating one channel.
#[derive(Debug, Clone)]
pub enum ChannelOutcome {
    GapNotElapsed { last_interjection_at: DateTime<Utc> },
    NoActivity,
    Declined { reason: String },
    PersonaNotFound { name: String },
    LeaseLost,
    Delivered(Delivered),
}

impl ChannelOutcome {
    fn describe(&self) -> String {
        match self {
            ChannelOutcome::GapNotElapsed { last_interjection_at } => format!(
                "last interjection at {} is within the minimum gap",
                last_interjection_at.to_rfc3339()
            ),
            ChannelOutcome::NoActivity => "no human messages in the lookback window".to_string(),
            ChannelOutcome::Declined { reason } if reason.is_empty() => "declined".to_string(),
            ChannelOutcome::Declined { reason } => format!("declined: {}", reason),
            ChannelOutcome::PersonaNotFound { name } => {
                format!("persona '{}' not in roster", name)
            }
            ChannelOutcome::LeaseLost => "run lease taken over by another run".to_string(),
            ChannelOutcome::Delivered(delivered) => format!("delivered {}", delivered.record.id),
        }
    }
}

pub struct EngagementCoordinator {
    config: Arc<dyn ConfigStore>,
    roster: Arc<dyn PersonaRoster>,
    audit: Arc<dyn AuditStore>,
    lease: Arc<dyn RunLease>,
    transport: Arc<dyn ChatTransport>,
    decision: DecisionMaker,
    generator: ResponseGenerator,
    knowledge: Option<KnowledgeAugmenter>,
    events: Option<flume::Sender<EngagementEvent>>,
    lease_ttl: Duration,
}

impl EngagementCoordinator {
    pub fn new(deps: EngagementDeps) -> Self {
        Self {
            config: deps.config,
            roster: deps.roster,
            audit: deps.audit,
            lease: deps.lease,
            transport: deps.transport,
            decision: DecisionMaker::new(deps.reasoning),
            generator: ResponseGenerator::new(deps.generation),
            knowledge: deps.retrieval.map(KnowledgeAugmenter::new),
            events: None,
            lease_ttl: DEFAULT_RUN_LEASE,
        }
    }

    pub fn with_events(mut self, events: flume::Sender<EngagementEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Extends the lease for this run. Fails closed: a store error counts as lost.
    fn keep_lease(&self, run_id: &str) -> bool {
        match self.lease.renew(ENGAGEMENT_CONFIG_ID, run_id, self.lease_ttl) {
            Ok(true) => true,
            Ok(false) => {
                tracing::warn!("Engagement run {} lost its lease", run_id);
                false
            }
            Err(e) => {
                tracing::warn!("Failed to renew engagement run lease {}: {:#}", run_id, e);
                false
            }
        }
    }

    fn emit(&self, event: EngagementEvent) {
        if let Some(ref events) = self.events {
            let _ = events.send(event);
        }
    }

    pub async fn run_once(&self) -> Result<RunOutcome> {
        self.run_at(Utc::now()).await
    }

    /// One engagement run evaluated at `now`. Delivers at most one interjection.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<RunOutcome> {
        let run_id = uuid::Uuid::new_v4().to_string();

        match self.guarded_run(&run_id, now).await {
            Ok(outcome) => {
                tracing::info!("Engagement run {} finished: {:?}", run_id, outcome);
                self.emit(EngagementEvent::RunFinished {
                    run_id,
                    outcome: outcome.clone(),
                });
                Ok(outcome)
            }
            Err(e) => {
                tracing::error!("Engagement run {} aborted: {:#}", run_id, e);
                self.emit(EngagementEvent::RunAborted {
                    run_id,
                    error: format!("{:#}", e),
                });
                Err(e)
            }
        }
    }

    async fn guarded_run(&self, run_id: &str, now: DateTime<Utc>) -> Result<RunOutcome> {
        let config = self
            .config
            .get_config()
            .context("Failed to read engagement config")?;

        if !config.enabled {
            tracing::debug!("Engagement disabled, skipping run");
            return Ok(RunOutcome::Disabled);
        }
        if config.channel_ids.is_empty() {
            tracing::debug!("No engagement channels configured");
            return Ok(RunOutcome::NoChannels);
        }

        let acquired = self
            .lease
            .try_acquire(ENGAGEMENT_CONFIG_ID, run_id, self.lease_ttl)
            .context("Failed to acquire engagement run lease")?;
        if !acquired {
            tracing::info!("Another engagement run holds the lease, skipping");
            return Ok(RunOutcome::LeaseHeld);
        }

        let _guard = LeaseGuard {
            lease: self.lease.clone(),
            holder: run_id.to_string(),
        };

        self.scan_channels(run_id, &config, now).await
    }

    async fn scan_channels(
        &self,
        run_id: &str,
        config: &EngagementConfig,
        now: DateTime<Utc>,
    ) -> Result<RunOutcome> {
        let roster = self
            .roster
            .list_personas()
            .context("Failed to load persona roster")?;
        if roster.is_empty() {
            tracing::warn!("Persona roster is empty, nobody can chime in");
            return Ok(RunOutcome::NoPersonas);
        }
        let persona_names: Vec<String> = roster.iter().map(|p| p.name.clone()).collect();

        self.emit(EngagementEvent::RunStarted {
            run_id: run_id.to_string(),
            channel_count: config.channel_ids.len(),
        });

        let mut channels_evaluated = 0;
        for channel_id in &config.channel_ids {
            if !self.keep_lease(run_id) {
                return Ok(RunOutcome::LeaseLost { channels_evaluated });
            }
            channels_evaluated += 1;

            match self
                .evaluate_channel(run_id, channel_id, config, &roster, &persona_names, now)
                .await
            {
                Ok(ChannelOutcome::Delivered(delivered)) => {
                    let record = delivered.record;
                    tracing::info!(
                        "{} chimed into channel {} (record {})",
                        record.persona_name,
                        channel_id,
                        record.id
                    );
                    self.emit(EngagementEvent::Interjected {
                        channel_id: channel_id.clone(),
                        persona_name: record.persona_name.clone(),
                        record_id: record.id.clone(),
                    });
                    return Ok(RunOutcome::Interjected {
                        channel_id: channel_id.clone(),
                        persona_name: record.persona_name,
                        record_id: record.id,
                        audit_recorded: delivered.audit_recorded,
                    });
                }
                Ok(ChannelOutcome::LeaseLost) => {
                    return Ok(RunOutcome::LeaseLost { channels_evaluated });
                }
                Ok(outcome) => {
                    let reason = outcome.describe();
                    tracing::debug!("Channel {} skipped: {}", channel_id, reason);
                    self.emit(EngagementEvent::ChannelSkipped {
                        channel_id: channel_id.clone(),
                        reason,
                    });
                }
                Err(failure) => {
                    tracing::warn!("Channel {}: {}", channel_id, failure);
                    self.emit(EngagementEvent::ChannelFailed {
                        channel_id: channel_id.clone(),
                        stage: failure.stage,
                        error: format!("{:#}", failure.error),
                    });
                }
            }
        }

        Ok(RunOutcome::NoInterjection { channels_evaluated })
    }

    async fn evaluate_channel(
        &self,
        run_id: &str,
        channel_id: &str,
        config: &EngagementConfig,
        roster: &[Persona],
        persona_names: &[String],
        now: DateTime<Utc>,
    ) -> Result<ChannelOutcome, ChannelFailure> {
        if let Some(gap) = config.min_message_gap() {
            let last = self
                .audit
                .last_interjection_at(channel_id)
                .context("reading last interjection time")
                .map_err(|e| ChannelFailure::new(PipelineStage::Gate, e))?;
            if let Some(last) = last {
                if now - last < gap {
                    return Ok(ChannelOutcome::GapNotElapsed {
                        last_interjection_at: last,
                    });
                }
            }
        }

        let window = extract_window(self.transport.as_ref(), channel_id, now)
            .await
            .map_err(|e| ChannelFailure::new(PipelineStage::Fetch, e))?;
        if window.is_empty() {
            return Ok(ChannelOutcome::NoActivity);
        }

        let transcript = build_transcript(&window);
        let decision = self.decision.decide(&transcript, persona_names).await;
        if !decision.should_join {
            return Ok(ChannelOutcome::Declined {
                reason: decision.reason,
            });
        }

        let Some(persona) = resolve_persona(&decision.persona, roster) else {
            tracing::warn!(
                "Decision picked unknown persona '{}' for channel {}",
                decision.persona,
                channel_id
            );
            return Ok(ChannelOutcome::PersonaNotFound {
                name: decision.persona,
            });
        };

        let knowledge = match self.knowledge {
            Some(ref augmenter) => augmenter.augment(&persona.name, &transcript).await,
            None => None,
        };

        let response = self
            .generator
            .generate(persona, &transcript, &decision, knowledge.as_deref())
            .await
            .map_err(|e| ChannelFailure::new(PipelineStage::Generate, e))?;

        // Slow oracles can outlast the lease; never post without owning it
        if !self.keep_lease(run_id) {
            return Ok(ChannelOutcome::LeaseLost);
        }

        let delivered = deliver(
            self.transport.as_ref(),
            self.audit.as_ref(),
            channel_id,
            persona,
            &response,
            &transcript,
            &decision,
            now,
        )
        .await?;

        Ok(ChannelOutcome::Delivered(delivered))
    }
}
