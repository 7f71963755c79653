use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use flume::Sender;

use crate::config::BackendConfig;
use crate::database::EngagementDatabase;
use crate::discord::DiscordTransport;
use crate::engagement::{
    ChatTransport, CompletionOracle, EngagementCoordinator, EngagementDeps, EngagementEvent,
    RetrievalOracle,
};
use crate::http_client::build_http_client_with_timeout;
use crate::llm_client::LlmClient;
use crate::retrieval::HttpRetrievalClient;
use crate::scheduler::EngagementScheduler;

/// Wired-up backend: database, collaborators and the engagement coordinator.
pub struct BackendRuntime {
    pub config: BackendConfig,
    pub database: Arc<EngagementDatabase>,
    pub coordinator: Arc<EngagementCoordinator>,
}

pub struct BackendRuntimeBuilder {
    config: BackendConfig,
    event_tx: Sender<EngagementEvent>,
    transport: Option<Arc<dyn ChatTransport>>,
    reasoning: Option<Arc<dyn CompletionOracle>>,
    generation: Option<Arc<dyn CompletionOracle>>,
}

impl BackendRuntimeBuilder {
    pub fn new(config: BackendConfig, event_tx: Sender<EngagementEvent>) -> Self {
        Self {
            config,
            event_tx,
            transport: None,
            reasoning: None,
            generation: None,
        }
    }

    /// Replace the Discord transport, e.g. with another chat platform.
    pub fn with_transport(mut self, transport: Arc<dyn ChatTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_oracles(
        mut self,
        reasoning: Arc<dyn CompletionOracle>,
        generation: Arc<dyn CompletionOracle>,
    ) -> Self {
        self.reasoning = Some(reasoning);
        self.generation = Some(generation);
        self
    }

    pub fn build(self) -> Result<BackendRuntime> {
        let config = self.config;

        let database = Arc::new(
            EngagementDatabase::new(&config.database_path)
                .context("Failed to open engagement database")?,
        );

        let http = build_http_client_with_timeout(Some(Duration::from_secs(
            config.request_timeout_secs.max(1),
        )))?;
        let api_key = config.llm_api_key.as_deref();

        let reasoning = match self.reasoning {
            Some(reasoning) => reasoning,
            None => {
                tracing::info!(
                    "Reasoning oracle: {} @ {}",
                    config.reasoning_model(),
                    config.llm_api_url
                );
                Arc::new(LlmClient::new(
                    &config.llm_api_url,
                    api_key,
                    config.reasoning_model(),
                    http.clone(),
                )) as Arc<dyn CompletionOracle>
            }
        };
        let generation = match self.generation {
            Some(generation) => generation,
            None => {
                tracing::info!(
                    "Generation oracle: {} @ {}",
                    config.generation_model(),
                    config.llm_api_url
                );
                Arc::new(LlmClient::new(
                    &config.llm_api_url,
                    api_key,
                    config.generation_model(),
                    http.clone(),
                )) as Arc<dyn CompletionOracle>
            }
        };

        let retrieval: Option<Arc<dyn RetrievalOracle>> =
            if config.retrieval_api_url.trim().is_empty() {
                tracing::info!("No retrieval service configured; knowledge augmentation disabled");
                None
            } else {
                tracing::info!("Knowledge retrieval enabled: {}", config.retrieval_api_url);
                Some(Arc::new(HttpRetrievalClient::new(
                    &config.retrieval_api_url,
                    http.clone(),
                )))
            };

        let transport = match self.transport {
            Some(transport) => transport,
            None => {
                if config.discord_bot_token.trim().is_empty() {
                    tracing::warn!("DISCORD_BOT_TOKEN is empty; channel fetches will be rejected");
                }
                Arc::new(DiscordTransport::new(
                    http,
                    &config.discord_bot_token,
                    &config.discord_webhook_name,
                )) as Arc<dyn ChatTransport>
            }
        };

        let coordinator = EngagementCoordinator::new(EngagementDeps {
            config: database.clone(),
            roster: database.clone(),
            audit: database.clone(),
            lease: database.clone(),
            transport,
            reasoning,
            generation,
            retrieval,
        })
        .with_events(self.event_tx)
        .with_lease_ttl(Duration::from_secs(config.run_lease_secs));

        Ok(BackendRuntime {
            config,
            database,
            coordinator: Arc::new(coordinator),
        })
    }
}

impl BackendRuntime {
    pub fn bootstrap(config: BackendConfig, event_tx: Sender<EngagementEvent>) -> Result<Self> {
        BackendRuntimeBuilder::new(config, event_tx).build()
    }

    /// Start the cron scheduler on the current tokio runtime, unless disabled.
    pub fn spawn_scheduler(&self) -> Option<tokio::task::JoinHandle<()>> {
        if !self.config.enable_scheduler {
            tracing::info!("Engagement scheduler disabled; runs only via POST /v1/engagement/run");
            return None;
        }
        let scheduler = EngagementScheduler::new(
            self.coordinator.clone(),
            self.database.clone(),
            Duration::from_secs(self.config.scheduler_recheck_secs),
        );
        Some(tokio::spawn(scheduler.run_loop()))
    }
}
