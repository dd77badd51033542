use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use koe_core::dialogue::{ChatRole, DialogueEngine, HistoryEntry};
use koe_core::errors::DialogueError;
use koe_core::settings::EngineSettings;
use koe_core::summary::SummaryRecord;

use crate::prompts;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

/// Dialogue engine backed by an Ollama-compatible `/api/chat` endpoint.
pub struct OllamaEngine {
    client: Client,
    base_url: String,
    model: String,
    timeout: Duration,
    chat_temperature: f64,
    chat_max_tokens: u32,
    summary_max_tokens: u32,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct WireOptions {
    temperature: f64,
    num_predict: u32,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    options: WireOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'static str>,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

impl OllamaEngine {
    pub fn new(settings: &EngineSettings) -> Result<Self, DialogueError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(settings.timeout())
            .build()
            .map_err(|e| DialogueError::Transient(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            timeout: settings.timeout(),
            chat_temperature: settings.chat_temperature,
            chat_max_tokens: settings.chat_max_tokens,
            summary_max_tokens: settings.summary_max_tokens,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Probe the model list endpoint. Never errors; an unreachable engine is
    /// simply reported as unavailable.
    pub async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self.client.get(&url).timeout(HEALTH_TIMEOUT).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!(status = resp.status().as_u16(), "engine health check failed");
                false
            }
            Err(e) => {
                warn!(error = %e, "engine unreachable");
                false
            }
        }
    }

    async fn chat(&self, request: &ChatRequest<'_>) -> Result<String, DialogueError> {
        let url = format!("{}/api/chat", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DialogueError::Transient(format!(
                "engine returned {}: {}",
                status.as_u16(),
                body.chars().take(200).collect::<String>()
            )));
        }

        let parsed: ChatResponse = resp.json().await.map_err(|e| self.classify(e))?;
        Ok(parsed.message.content.trim().to_string())
    }

    fn classify(&self, e: reqwest::Error) -> DialogueError {
        if e.is_timeout() {
            DialogueError::Timeout(self.timeout)
        } else {
            DialogueError::Transient(e.to_string())
        }
    }
}

fn build_chat_messages<'a>(system: &'a str, history: &'a [HistoryEntry]) -> Vec<WireMessage<'a>> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(WireMessage {
        role: "system",
        content: system,
    });
    messages.extend(history.iter().map(|entry| WireMessage {
        role: match entry.role {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        },
        content: &entry.content,
    }));
    messages
}

#[async_trait]
impl DialogueEngine for OllamaEngine {
    fn name(&self) -> &str {
        "ollama"
    }

    #[instrument(skip(self, new_message, history), fields(model = %self.model, history_len = history.len()))]
    async fn dialog_turn(
        &self,
        new_message: &str,
        history: &[HistoryEntry],
    ) -> Result<String, DialogueError> {
        debug!(chars = new_message.chars().count(), "dialog turn");
        let request = ChatRequest {
            model: &self.model,
            messages: build_chat_messages(prompts::CHAT_SYSTEM_PROMPT, history),
            stream: false,
            options: WireOptions {
                temperature: self.chat_temperature,
                num_predict: self.chat_max_tokens,
            },
            format: None,
        };
        self.chat(&request).await
    }

    #[instrument(skip(self, history), fields(model = %self.model, history_len = history.len()))]
    async fn extract_summary(
        &self,
        history: &[HistoryEntry],
    ) -> Result<SummaryRecord, DialogueError> {
        let system = prompts::summary_system_prompt();
        let transcript = prompts::transcript(history);
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                WireMessage {
                    role: "system",
                    content: &system,
                },
                WireMessage {
                    role: "user",
                    content: &transcript,
                },
            ],
            stream: false,
            options: WireOptions {
                temperature: 0.0,
                num_predict: self.summary_max_tokens,
            },
            format: Some("json"),
        };
        let raw = self.chat(&request).await?;
        SummaryRecord::parse(&raw)
    }
}
