//! In-memory collaborators for pipeline tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::config_store::{ConfigStore, EngagementConfig, EngagementConfigPatch};
use super::coordinator::RunLease;
use super::delivery::{AuditStore, PersonaChatRecord};
use super::persona::{Persona, PersonaRoster};
use super::{
    ChatTransport, CompletionOracle, CompletionRequest, DeliveryReceipt, KnowledgeHit,
    PersonaIdentity, RetrievalOracle, TransportMessage,
};

pub fn human(author: &str, content: &str, at: DateTime<Utc>) -> TransportMessage {
    TransportMessage {
        author: author.to_string(),
        is_automated: false,
        content: content.to_string(),
        timestamp_ms: at.timestamp_millis(),
    }
}

/// Answers completions from a queue; an exhausted queue is an error.
pub struct ScriptedOracle {
    responses: Mutex<VecDeque<Result<String>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedOracle {
    pub fn new(responses: Vec<Result<String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self::new(Vec::new())
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionOracle for ScriptedOracle {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        self.requests.lock().unwrap().push(request);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("oracle unavailable")))
    }
}

#[derive(Debug, Clone)]
pub struct RecordedPost {
    pub channel_id: String,
    pub identity: PersonaIdentity,
    pub text: String,
}

#[derive(Clone, Default)]
pub struct FakeTransport {
    messages: HashMap<String, Vec<TransportMessage>>,
    failing_fetch: HashSet<String>,
    failing_posts: HashSet<String>,
    fetch_delay: Option<std::time::Duration>,
    fetched: Arc<Mutex<Vec<String>>>,
    completed_fetches: Arc<Mutex<usize>>,
    posts: Arc<Mutex<Vec<RecordedPost>>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_messages(mut self, channel_id: &str, messages: Vec<TransportMessage>) -> Self {
        self.messages.insert(channel_id.to_string(), messages);
        self
    }

    pub fn failing_fetch_in(mut self, channel_id: &str) -> Self {
        self.failing_fetch.insert(channel_id.to_string());
        self
    }

    pub fn failing_posts_in(mut self, channel_id: &str) -> Self {
        self.failing_posts.insert(channel_id.to_string());
        self
    }

    /// Every fetch sleeps this long before answering.
    pub fn with_fetch_delay(mut self, delay: std::time::Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    /// Fetches that ran to completion, as opposed to started ones.
    pub fn completed_fetches(&self) -> usize {
        *self.completed_fetches.lock().unwrap()
    }

    pub fn fetched_channels(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn posts(&self) -> Vec<RecordedPost> {
        self.posts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatTransport for FakeTransport {
    async fn fetch_recent_messages(
        &self,
        channel_id: &str,
        limit: usize,
    ) -> Result<Vec<TransportMessage>> {
        self.fetched.lock().unwrap().push(channel_id.to_string());
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        *self.completed_fetches.lock().unwrap() += 1;
        if self.failing_fetch.contains(channel_id) {
            bail!("channel {} unreachable", channel_id);
        }
        Ok(self
            .messages
            .get(channel_id)
            .map(|messages| messages.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn post_as_persona(
        &self,
        channel_id: &str,
        identity: &PersonaIdentity,
        text: &str,
    ) -> Result<DeliveryReceipt> {
        if self.failing_posts.contains(channel_id) {
            bail!("webhook rejected post in {}", channel_id);
        }
        let mut posts = self.posts.lock().unwrap();
        posts.push(RecordedPost {
            channel_id: channel_id.to_string(),
            identity: identity.clone(),
            text: text.to_string(),
        });
        Ok(DeliveryReceipt {
            message_id: Some(format!("msg-{}", posts.len())),
        })
    }
}

pub struct FakeRetrieval {
    hits: Option<Vec<KnowledgeHit>>,
    queries: Mutex<Vec<(String, usize)>>,
}

impl FakeRetrieval {
    pub fn with_hits(hits: Vec<KnowledgeHit>) -> Self {
        Self {
            hits: Some(hits),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            hits: None,
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn queries(&self) -> Vec<(String, usize)> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl RetrievalOracle for FakeRetrieval {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<KnowledgeHit>> {
        self.queries.lock().unwrap().push((query.to_string(), top_k));
        match self.hits {
            Some(ref hits) => Ok(hits.iter().take(top_k).cloned().collect()),
            None => bail!("retrieval service down"),
        }
    }
}

pub struct MemoryConfigStore {
    config: Option<Mutex<EngagementConfig>>,
}

impl MemoryConfigStore {
    pub fn new(config: EngagementConfig) -> Self {
        Self {
            config: Some(Mutex::new(config)),
        }
    }

    pub fn failing() -> Self {
        Self { config: None }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.update_config(&EngagementConfigPatch {
            enabled: Some(enabled),
            ..Default::default()
        })
        .unwrap();
    }

    pub fn set_min_gap(&self, mins: u32) {
        self.update_config(&EngagementConfigPatch {
            min_message_gap_mins: Some(mins),
            ..Default::default()
        })
        .unwrap();
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get_config(&self) -> Result<EngagementConfig> {
        match self.config {
            Some(ref config) => Ok(config.lock().unwrap().clone()),
            None => bail!("config table missing"),
        }
    }

    fn update_config(&self, patch: &EngagementConfigPatch) -> Result<EngagementConfig> {
        match self.config {
            Some(ref config) => {
                let mut config = config.lock().unwrap();
                config.apply(patch, Utc::now());
                Ok(config.clone())
            }
            None => bail!("config table missing"),
        }
    }
}

pub struct MemoryRoster {
    personas: Option<Vec<Persona>>,
}

impl MemoryRoster {
    pub fn new(personas: Vec<Persona>) -> Self {
        Self {
            personas: Some(personas),
        }
    }

    pub fn failing() -> Self {
        Self { personas: None }
    }
}

impl PersonaRoster for MemoryRoster {
    fn list_personas(&self) -> Result<Vec<Persona>> {
        self.personas
            .clone()
            .ok_or_else(|| anyhow!("persona table missing"))
    }
}

#[derive(Default)]
pub struct MemoryAudit {
    records: Mutex<Vec<PersonaChatRecord>>,
    fail_inserts: bool,
}

impl MemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_inserts() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            fail_inserts: true,
        }
    }

    /// Insert bypassing the failure switch.
    pub fn seed(&self, record: PersonaChatRecord) {
        self.records.lock().unwrap().push(record);
    }

    pub fn records(&self) -> Vec<PersonaChatRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl AuditStore for MemoryAudit {
    fn insert_record(&self, record: &PersonaChatRecord) -> Result<()> {
        if self.fail_inserts {
            bail!("disk full");
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }

    fn last_interjection_at(&self, channel_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|record| record.channel_id == channel_id)
            .map(|record| record.posted_at)
            .max())
    }

    fn list_recent_records(&self, limit: usize) -> Result<Vec<PersonaChatRecord>> {
        let mut records = self.records();
        records.sort_by(|a, b| b.posted_at.cmp(&a.posted_at));
        records.truncate(limit);
        Ok(records)
    }
}

#[derive(Default)]
pub struct MemoryLease {
    holder: Mutex<Option<String>>,
    acquisitions: Mutex<usize>,
    renewals: Mutex<usize>,
    always_held: bool,
    taken_over_after: Option<usize>,
}

impl MemoryLease {
    pub fn new() -> Self {
        Self::default()
    }

    /// Some other run owns the lease for the whole test.
    pub fn held() -> Self {
        Self {
            always_held: true,
            ..Self::default()
        }
    }

    /// Another run takes the lease over once `renewals` renewals have succeeded.
    pub fn taken_over_after(renewals: usize) -> Self {
        Self {
            taken_over_after: Some(renewals),
            ..Self::default()
        }
    }

    pub fn holder(&self) -> Option<String> {
        self.holder.lock().unwrap().clone()
    }

    pub fn renewals(&self) -> usize {
        *self.renewals.lock().unwrap()
    }

    pub fn acquisitions(&self) -> usize {
        *self.acquisitions.lock().unwrap()
    }

    pub fn is_held(&self) -> bool {
        self.holder.lock().unwrap().is_some()
    }
}

impl RunLease for MemoryLease {
    fn try_acquire(&self, _key: &str, holder: &str, _ttl: Duration) -> Result<bool> {
        let mut current = self.holder.lock().unwrap();
        if self.always_held || current.is_some() {
            return Ok(false);
        }
        *current = Some(holder.to_string());
        *self.acquisitions.lock().unwrap() += 1;
        Ok(true)
    }

    fn renew(&self, _key: &str, holder: &str, _ttl: Duration) -> Result<bool> {
        let mut current = self.holder.lock().unwrap();
        let mut renewals = self.renewals.lock().unwrap();
        if self.taken_over_after == Some(*renewals) {
            *current = Some("other-run".to_string());
        }
        if current.as_deref() != Some(holder) {
            return Ok(false);
        }
        *renewals += 1;
        Ok(true)
    }

    fn release(&self, _key: &str, holder: &str) -> Result<()> {
        let mut current = self.holder.lock().unwrap();
        if current.as_deref() == Some(holder) {
            *current = None;
        }
        Ok(())
    }
}
