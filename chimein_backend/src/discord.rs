use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::DateTime;
use reqwest::{Method, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::engagement::{ChatTransport, DeliveryReceipt, PersonaIdentity, TransportMessage};

pub const API_BASE: &str = "https://discord.com/api/v10";

const MAX_USERNAME_CHARS: usize = 80;
const MAX_EMBED_DESCRIPTION_CHARS: usize = 4096;
const MAX_FETCH_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    content: String,
    timestamp: String,
    author: ApiAuthor,
    #[serde(default)]
    webhook_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiAuthor {
    username: String,
    #[serde(default)]
    global_name: Option<String>,
    #[serde(default)]
    bot: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiWebhook {
    id: String,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Clone)]
struct WebhookCredentials {
    id: String,
    token: String,
}

/// Reads channels with the bot token and posts through one named webhook per
/// channel so every persona shows its own name and avatar.
pub struct DiscordTransport {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
    webhook_name: String,
    webhooks: Mutex<HashMap<String, WebhookCredentials>>,
}

impl DiscordTransport {
    pub fn new(client: reqwest::Client, bot_token: &str, webhook_name: &str) -> Self {
        Self {
            client,
            api_base: API_BASE.to_string(),
            bot_token: bot_token.trim().to_string(),
            webhook_name: webhook_name.to_string(),
            webhooks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    async fn bot_request(
        &self,
        method: Method,
        url: &str,
        body: Option<Value>,
    ) -> Result<Response> {
        let mut request = self
            .client
            .request(method, url)
            .header("Authorization", format!("Bot {}", self.bot_token));
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.context("send Discord request")?;
        ensure_success(response).await
    }

    async fn webhook_for(&self, channel_id: &str) -> Result<WebhookCredentials> {
        let mut cache = self.webhooks.lock().await;
        if let Some(found) = cache.get(channel_id) {
            return Ok(found.clone());
        }

        let url = format!("{}/channels/{}/webhooks", self.api_base, channel_id);
        let existing: Vec<ApiWebhook> = self
            .bot_request(Method::GET, &url, None)
            .await
            .context("list channel webhooks")?
            .json()
            .await
            .context("parse Discord webhook list")?;

        let reusable = existing.into_iter().find_map(|hook| {
            let named = hook.name.as_deref() == Some(self.webhook_name.as_str());
            match hook.token {
                Some(token) if named => Some(WebhookCredentials { id: hook.id, token }),
                _ => None,
            }
        });

        let credentials = match reusable {
            Some(credentials) => credentials,
            None => {
                tracing::info!(
                    "Creating webhook '{}' in channel {}",
                    self.webhook_name,
                    channel_id
                );
                let created: ApiWebhook = self
                    .bot_request(Method::POST, &url, Some(json!({ "name": self.webhook_name })))
                    .await
                    .context("create channel webhook")?
                    .json()
                    .await
                    .context("parse created webhook")?;
                let token = created
                    .token
                    .context("Discord returned a webhook without a token")?;
                WebhookCredentials {
                    id: created.id,
                    token,
                }
            }
        };

        cache.insert(channel_id.to_string(), credentials.clone());
        Ok(credentials)
    }

    async fn forget_webhook(&self, channel_id: &str) {
        self.webhooks.lock().await.remove(channel_id);
    }
}

#[async_trait]
impl ChatTransport for DiscordTransport {
    async fn fetch_recent_messages(
        &self,
        channel_id: &str,
        limit: usize,
    ) -> Result<Vec<TransportMessage>> {
        let url = format!(
            "{}/channels/{}/messages?limit={}",
            self.api_base,
            channel_id,
            limit.clamp(1, MAX_FETCH_LIMIT)
        );
        let messages: Vec<ApiMessage> = self
            .bot_request(Method::GET, &url, None)
            .await
            .with_context(|| format!("fetch messages of channel {}", channel_id))?
            .json()
            .await
            .context("parse Discord messages")?;

        Ok(messages.into_iter().filter_map(to_transport_message).collect())
    }

    async fn post_as_persona(
        &self,
        channel_id: &str,
        identity: &PersonaIdentity,
        text: &str,
    ) -> Result<DeliveryReceipt> {
        let webhook = self.webhook_for(channel_id).await?;
        let url = format!(
            "{}/webhooks/{}/{}?wait=true",
            self.api_base, webhook.id, webhook.token
        );

        let response = self
            .client
            .post(&url)
            .json(&webhook_payload(identity, text))
            .send()
            .await
            .context("send Discord webhook message")?;

        // A deleted webhook must be recreated on the next post
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            self.forget_webhook(channel_id).await;
        }

        let response = ensure_success(response).await?;

        // The message is live once Discord accepted it; the body only carries the id
        let message_id = match response.json::<Value>().await {
            Ok(posted) => posted.get("id").and_then(Value::as_str).map(str::to_string),
            Err(e) => {
                tracing::warn!(
                    "Webhook post to channel {} accepted but response unreadable: {}",
                    channel_id,
                    e
                );
                None
            }
        };

        Ok(DeliveryReceipt { message_id })
    }
}

async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    bail!("Discord API error ({status}): {body}");
}

fn to_transport_message(message: ApiMessage) -> Option<TransportMessage> {
    let timestamp = match DateTime::parse_from_rfc3339(&message.timestamp) {
        Ok(timestamp) => timestamp,
        Err(e) => {
            tracing::debug!("Skipping message with bad timestamp {}: {}", message.timestamp, e);
            return None;
        }
    };
    let author = message
        .author
        .global_name
        .filter(|name| !name.trim().is_empty())
        .unwrap_or(message.author.username);

    Some(TransportMessage {
        author,
        is_automated: message.author.bot || message.webhook_id.is_some(),
        content: message.content,
        timestamp_ms: timestamp.timestamp_millis(),
    })
}

fn webhook_payload(identity: &PersonaIdentity, text: &str) -> Value {
    let mut embed = json!({ "description": truncate(text, MAX_EMBED_DESCRIPTION_CHARS) });
    if let Some(color) = parse_color(&identity.color) {
        embed["color"] = json!(color);
    }

    let mut payload = json!({
        "username": truncate(&identity.name, MAX_USERNAME_CHARS),
        "embeds": [embed],
        "allowed_mentions": { "parse": [] },
    });
    if !identity.avatar.trim().is_empty() {
        payload["avatar_url"] = json!(identity.avatar.trim());
    }
    payload
}

/// `#RRGGBB` or `RRGGBB` to Discord's integer colour.
fn parse_color(raw: &str) -> Option<u32> {
    let hex = raw.trim().trim_start_matches('#');
    if hex.len() != 6 {
        return None;
    }
    u32::from_str_radix(hex, 16).ok()
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
