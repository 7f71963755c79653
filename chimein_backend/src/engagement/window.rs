use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use super::{ChatTransport, TransportMessage};

pub const LOOKBACK_MINUTES: i64 = 60;
pub const MESSAGE_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowMessage {
    pub author: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Recent human messages of one channel, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationWindow {
    messages: Vec<WindowMessage>,
}

impl ConversationWindow {
    pub fn messages(&self) -> &[WindowMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

pub async fn extract_window(
    transport: &dyn ChatTransport,
    channel_id: &str,
    now: DateTime<Utc>,
) -> Result<ConversationWindow> {
    let raw = transport
        .fetch_recent_messages(channel_id, MESSAGE_LIMIT)
        .await?;
    let window = filter_window(raw, now);
    tracing::debug!(
        "Channel {} window: {} human message(s) in the last {} minutes",
        channel_id,
        window.len(),
        LOOKBACK_MINUTES
    );
    Ok(window)
}

/// Keep human-authored, non-blank messages inside the lookback horizon.
pub fn filter_window(raw: Vec<TransportMessage>, now: DateTime<Utc>) -> ConversationWindow {
    let cutoff = now - Duration::minutes(LOOKBACK_MINUTES);

    let mut messages: Vec<WindowMessage> = raw
        .into_iter()
        .filter(|message| !message.is_automated && !message.content.trim().is_empty())
        .filter_map(|message| {
            let timestamp = DateTime::<Utc>::from_timestamp_millis(message.timestamp_ms)?;
            (timestamp >= cutoff).then(|| WindowMessage {
                author: message.author,
                content: message.content,
                timestamp,
            })
        })
        .collect();

    messages.sort_by_key(|message| message.timestamp);
    ConversationWindow { messages }
}

/// Render the window as `author: content` lines, oldest first.
pub fn build_transcript(window: &ConversationWindow) -> String {
    window
        .messages()
        .iter()
        .map(|message| format!("{}: {}", message.author, message.content))
        .collect::<Vec<_>>()
        .join("\n")
}
