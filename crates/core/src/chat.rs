use crate::error::{RagError, Result};
use crate::http::{endpoint, with_retry, HttpSettings};
use crate::models::ConversationTurn;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_CHAT_BASE_URL: &str = "https://api.groq.com/openai/v1";
pub const DEFAULT_CHAT_MODEL: &str = "llama-3.1-8b-instant";

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_id(&self) -> &str;

    async fn complete(&self, prompt: &str) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_CHAT_BASE_URL.to_string(),
            model: DEFAULT_CHAT_MODEL.to_string(),
            api_key: None,
            temperature: 0.0,
        }
    }
}

/// Client for OpenAI-compatible `POST {base}/chat/completions` (Groq, OpenAI, vLLM, Ollama).
pub struct OpenAiChatModel {
    client: Client,
    url: String,
    config: ChatConfig,
    settings: HttpSettings,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiChatModel {
    pub fn new(config: ChatConfig, settings: HttpSettings) -> Result<Self> {
        Ok(Self {
            client: settings.client()?,
            url: endpoint(&config.base_url, "chat/completions")?,
            config,
            settings,
        })
    }

    async fn request(&self, prompt: &str) -> Result<ChatResponse> {
        let mut request = self.client.post(&self.url).json(&ChatRequest {
            model: &self.config.model,
            temperature: self.config.temperature,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
        });
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?.error_for_status()?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    fn model_id(&self) -> &str {
        &self.config.model
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        debug!(model = %self.config.model, prompt_len = prompt.len(), "chat completion");

        let response = with_retry("chat", self.settings.retry_backoff, || self.request(prompt))
            .await
            .map_err(|error| RagError::Chat(error.to_string()))?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .ok_or_else(|| RagError::Chat("response contained no message content".to_string()))
    }
}

/// Assembles the prompt sent to the chat model.
pub fn build_prompt(context: &str, question: &str, history: &[ConversationTurn]) -> String {
    let mut prompt = String::from(
        "You answer questions using only the context below. \
         If the context does not contain the answer, say so plainly. \
         Cite the source document when you can.\n\n",
    );

    if !history.is_empty() {
        prompt.push_str("Earlier in this conversation:\n");
        for turn in history {
            prompt.push_str(&format!("Q: {}\nA: {}\n", turn.question, turn.answer));
        }
        prompt.push('\n');
    }

    prompt.push_str(&format!(
        "Context:\n{context}\n\nQuestion:\n{question}\n\nAnswer:\n"
    ));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn prompt_contains_context_question_and_history() {
        let history = vec![ConversationTurn {
            question: "What is the fee?".to_string(),
            answer: "500 birr.".to_string(),
            asked_at: Utc::now(),
        }];
        let prompt = build_prompt("Fees are 500 birr.", "Is it refundable?", &history);

        assert!(prompt.contains("Context:\nFees are 500 birr."));
        assert!(prompt.contains("Question:\nIs it refundable?"));
        assert!(prompt.contains("Q: What is the fee?\nA: 500 birr."));
    }

    #[test]
    fn prompt_without_history_has_no_history_block() {
        let prompt = build_prompt("ctx", "q", &[]);
        assert!(!prompt.contains("Earlier in this conversation"));
    }

    #[test]
    fn response_content_is_parsed() -> Result<()> {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"  Hello  "}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(raw)?;
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("  Hello  "));
        Ok(())
    }
}
