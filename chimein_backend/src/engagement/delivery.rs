use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::decision::EngagementDecision;
use super::{ChannelFailure, ChatTransport, Persona, PipelineStage};

/// Append-only audit entry for one delivered interjection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaChatRecord {
    pub id: String,
    pub channel_id: String,
    pub persona_name: String,
    pub response: String,
    /// Transcript the decision was made on.
    pub context: String,
    pub decision: EngagementDecision,
    pub posted_at: DateTime<Utc>,
    pub message_id: Option<String>,
}

pub trait AuditStore: Send + Sync {
    fn insert_record(&self, record: &PersonaChatRecord) -> Result<()>;

    fn last_interjection_at(&self, channel_id: &str) -> Result<Option<DateTime<Utc>>>;

    /// Newest first.
    fn list_recent_records(&self, limit: usize) -> Result<Vec<PersonaChatRecord>>;
}

#[derive(Debug, Clone)]
pub struct Delivered {
    pub record: PersonaChatRecord,
    /// False when the post went out but the audit insert failed.
    pub audit_recorded: bool,
}

/// Post the response as the persona, then write the audit record.
///
/// A failed post is a channel failure and leaves no record. A failed insert
/// after a successful post is reported through `audit_recorded` instead: the
/// message is already visible in the channel.
pub async fn deliver(
    transport: &dyn ChatTransport,
    audit: &dyn AuditStore,
    channel_id: &str,
    persona: &Persona,
    response: &str,
    transcript: &str,
    decision: &EngagementDecision,
    now: DateTime<Utc>,
) -> Result<Delivered, ChannelFailure> {
    let receipt = transport
        .post_as_persona(channel_id, &persona.identity(), response)
        .await
        .with_context(|| format!("posting as {} into channel {}", persona.name, channel_id))
        .map_err(|e| ChannelFailure::new(PipelineStage::Deliver, e))?;

    let record = PersonaChatRecord {
        id: uuid::Uuid::new_v4().to_string(),
        channel_id: channel_id.to_string(),
        persona_name: persona.name.clone(),
        response: response.to_string(),
        context: transcript.to_string(),
        decision: decision.clone(),
        posted_at: now,
        message_id: receipt.message_id,
    };

    let audit_recorded = match audit.insert_record(&record) {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(
                "Interjection {} was posted to channel {} but the audit insert failed: {:#}",
                record.id,
                channel_id,
                e
            );
            false
        }
    };

    Ok(Delivered {
        record,
        audit_recorded,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engagement::decision::ResponseTone;
    use crate::engagement::fakes::{FakeTransport, MemoryAudit};

    fn persona() -> Persona {
        Persona {
            name: "Glordon".to_string(),
            avatar: "https://cdn.example/glordon.png".to_string(),
            color: "#7A4FD6".to_string(),
            prompt: "You are Glordon.".to_string(),
        }
    }

    fn decision() -> EngagementDecision {
        EngagementDecision {
            should_join: true,
            persona: "Glordon".to_string(),
            reason: "snacks".to_string(),
            response_tone: ResponseTone::Playful,
        }
    }

    #[tokio::test]
    async fn successful_post_writes_one_record() {
        let transport = FakeTransport::new();
        let audit = MemoryAudit::new();
        let now = Utc::now();

        let delivered = deliver(
            &transport,
            &audit,
            "c1",
            &persona(),
            "Hi friends!",
            "ana: hi",
            &decision(),
            now,
        )
        .await
        .expect("delivered");

        assert!(delivered.audit_recorded);
        let records = audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].channel_id, "c1");
        assert_eq!(records[0].persona_name, "Glordon");
        assert_eq!(records[0].context, "ana: hi");
        assert_eq!(records[0].posted_at, now);
        assert_eq!(records[0].message_id.as_deref(), Some("msg-1"));

        let posts = transport.posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].identity.color, "#7A4FD6");
        assert_eq!(posts[0].text, "Hi friends!");
    }

    #[tokio::test]
    async fn failed_post_writes_nothing() {
        let transport = FakeTransport::new().failing_posts_in("c1");
        let audit = MemoryAudit::new();

        let failure = deliver(
            &transport,
            &audit,
            "c1",
            &persona(),
            "Hi",
            "ana: hi",
            &decision(),
            Utc::now(),
        )
        .await
        .expect_err("post should fail");

        assert_eq!(failure.stage, PipelineStage::Deliver);
        assert!(audit.records().is_empty());
    }

    #[tokio::test]
    async fn failed_insert_is_reported_not_raised() {
        let transport = FakeTransport::new();
        let audit = MemoryAudit::failing_inserts();

        let delivered = deliver(
            &transport,
            &audit,
            "c1",
            &persona(),
            "Hi",
            "ana: hi",
            &decision(),
            Utc::now(),
        )
        .await
        .expect("post went out");

        assert!(!delivered.audit_recorded);
        assert_eq!(transport.posts().len(), 1);
    }
}
