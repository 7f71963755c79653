use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::engagement::{CompletionOracle, CompletionRequest};

/// OpenAI-compatible chat-completions client bound to one model.
#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl LlmClient {
    pub fn new(api_url: &str, api_key: Option<&str>, model: &str, client: reqwest::Client) -> Self {
        Self {
            api_url: chat_api_url(api_url),
            api_key: api_key.unwrap_or_default().trim().to_string(),
            model: model.to_string(),
            client,
        }
    }

    pub async fn generate(
        &self,
        messages: Vec<Message>,
        temperature: Option<f32>,
        max_tokens: Option<u32>,
    ) -> Result<String> {
        let url = format!("{}/chat/completions", self.api_url);

        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            temperature,
            max_tokens,
        };

        let mut req = self.client.post(&url).json(&request);

        // Local servers usually run without a key
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }

        let response = req
            .send()
            .await
            .with_context(|| format!("Failed to send LLM request to {}", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("LLM API returned error {}: {}", status, body);
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow::anyhow!("No response from LLM ({})", self.model))
    }
}

#[async_trait]
impl CompletionOracle for LlmClient {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        self.generate(
            build_messages(&request),
            Some(request.temperature),
            Some(request.max_tokens),
        )
        .await
    }
}

fn build_messages(request: &CompletionRequest) -> Vec<Message> {
    let mut messages = Vec::with_capacity(2);
    if let Some(ref system) = request.system {
        messages.push(Message {
            role: "system".to_string(),
            content: system.clone(),
        });
    }
    messages.push(Message {
        role: "user".to_string(),
        content: request.prompt.clone(),
    });
    messages
}

/// Base URL ending in `/v1`, accepting either form from config.
pub fn chat_api_url(base_url: &str) -> String {
    let trimmed = base_url.trim().trim_end_matches('/');
    if trimmed.ends_with("/v1") {
        trimmed.to_string()
    } else {
        format!("{}/v1", trimmed)
    }
}
