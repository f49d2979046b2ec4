use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use agmai_core::error::AgmaiError;
use agmai_core::types::{ChatRole, ProviderId};

use crate::config::Config;

#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub text: String,
    /// Total tokens as reported by the vendor, when available.
    pub total_tokens: Option<i64>,
}

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn send_chat(&self, system: &str, turns: &[ChatTurn])
        -> Result<ChatOutcome, AgmaiError>;
}

pub fn create_chat_provider(config: &Config, id: ProviderId) -> Box<dyn ChatProvider> {
    match id {
        ProviderId::GeminiStandard => Box::new(GeminiProvider::new(
            config.gemini_api_key.clone(),
            config.gemini_model.clone(),
        )),
        ProviderId::Gpt4Omni => Box::new(OpenAiCompatProvider::new(
            "https://api.openai.com/v1",
            config.openai_api_key.clone(),
            config.gpt4_model.clone(),
            Vec::new(),
        )),
        ProviderId::Gpt35Turbo => Box::new(OpenAiCompatProvider::new(
            "https://api.openai.com/v1",
            config.openai_api_key.clone(),
            config.gpt35_model.clone(),
            Vec::new(),
        )),
        ProviderId::DeepseekChat => Box::new(OpenAiCompatProvider::new(
            &config.deepseek_base_url,
            config.deepseek_api_key.clone(),
            config.deepseek_model.clone(),
            Vec::new(),
        )),
        ProviderId::OpenrouterDeepseek => Box::new(OpenAiCompatProvider::new(
            &config.openrouter_base_url,
            config.openrouter_api_key.clone(),
            config.openrouter_deepseek_model.clone(),
            openrouter_headers(config),
        )),
        ProviderId::OpenrouterGeminiFlash => Box::new(OpenAiCompatProvider::new(
            &config.openrouter_base_url,
            config.openrouter_api_key.clone(),
            config.openrouter_gemini_flash_model.clone(),
            openrouter_headers(config),
        )),
    }
}

fn openrouter_headers(config: &Config) -> Vec<(String, String)> {
    let mut headers = Vec::new();
    if let Some(url) = &config.openrouter_site_url {
        headers.push(("HTTP-Referer".to_string(), url.clone()));
    }
    if let Some(name) = &config.openrouter_app_name {
        headers.push(("X-Title".to_string(), name.clone()));
    }
    headers
}

const MAX_RETRIES: u32 = 3;

// ---------------------------------------------------------------------------
// Gemini provider
// ---------------------------------------------------------------------------

pub struct GeminiProvider {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiProvider {
    pub fn new(api_key: String, model: String) -> Self {
        GeminiProvider {
            http: reqwest::Client::new(),
            api_key,
            model,
            base_url: "https://generativelanguage.googleapis.com/v1beta".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GeminiUsage>,
    #[serde(rename = "promptFeedback")]
    prompt_feedback: Option<GeminiPromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    parts: Option<Vec<GeminiPart>>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiUsage {
    #[serde(rename = "totalTokenCount")]
    total_token_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct GeminiPromptFeedback {
    #[serde(rename = "blockReason")]
    block_reason: Option<String>,
}

fn parse_gemini_response(body: &str) -> Result<ChatOutcome, AgmaiError> {
    let parsed: GeminiResponse = serde_json::from_str(body)
        .map_err(|e| AgmaiError::LlmApi(format!("Failed to parse response: {e}\nBody: {body}")))?;

    if let Some(feedback) = &parsed.prompt_feedback {
        if let Some(reason) = &feedback.block_reason {
            return Err(AgmaiError::LlmApi(format!(
                "Prompt blocked by safety filter: {reason}"
            )));
        }
    }

    let total_tokens = parsed
        .usage_metadata
        .as_ref()
        .and_then(|u| u.total_token_count);

    let candidate = parsed
        .candidates
        .unwrap_or_default()
        .into_iter()
        .next()
        .ok_or_else(|| AgmaiError::LlmApi("Empty response: no candidates".into()))?;

    if candidate.finish_reason.as_deref() == Some("SAFETY") {
        return Err(AgmaiError::LlmApi(
            "Response blocked by safety filter".into(),
        ));
    }

    let text = candidate
        .content
        .and_then(|c| c.parts)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|p| p.text)
        .collect::<Vec<_>>()
        .join("");
    if text.is_empty() {
        return Err(AgmaiError::LlmApi("Empty response: no text parts".into()));
    }

    Ok(ChatOutcome { text, total_tokens })
}

fn gemini_role(role: ChatRole) -> &'static str {
    match role {
        ChatRole::User => "user",
        ChatRole::Model => "model",
    }
}

#[async_trait]
impl ChatProvider for GeminiProvider {
    async fn send_chat(
        &self,
        system: &str,
        turns: &[ChatTurn],
    ) -> Result<ChatOutcome, AgmaiError> {
        let contents: Vec<serde_json::Value> = turns
            .iter()
            .map(|t| {
                json!({
                    "role": gemini_role(t.role),
                    "parts": [{ "text": t.content }]
                })
            })
            .collect();

        // Permissive thresholds: only the highest-severity content is blocked.
        let safety: Vec<serde_json::Value> = [
            "HARM_CATEGORY_HARASSMENT",
            "HARM_CATEGORY_HATE_SPEECH",
            "HARM_CATEGORY_SEXUALLY_EXPLICIT",
            "HARM_CATEGORY_DANGEROUS_CONTENT",
        ]
        .iter()
        .map(|cat| json!({ "category": cat, "threshold": "BLOCK_ONLY_HIGH" }))
        .collect();

        let request = json!({
            "system_instruction": { "parts": [{ "text": system }] },
            "contents": contents,
            "safetySettings": safety,
        });

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );

        let mut retries = 0u32;
        loop {
            let response = self.http.post(&url).json(&request).send().await?;
            let status = response.status();

            if status.is_success() {
                let body = response.text().await?;
                return parse_gemini_response(&body);
            }

            if status.as_u16() == 429 && retries < MAX_RETRIES {
                retries += 1;
                let delay = std::time::Duration::from_secs(2u64.pow(retries));
                warn!(
                    "Rate limited, retrying in {:?} (attempt {retries}/{MAX_RETRIES})",
                    delay
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            return Err(AgmaiError::LlmApi(format!("HTTP {status}: {body}")));
        }
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible provider  (OpenAI, DeepSeek, OpenRouter)
// ---------------------------------------------------------------------------

pub struct OpenAiCompatProvider {
    http: reqwest::Client,
    api_key: String,
    model: String,
    chat_url: String,
    extra_headers: Vec<(String, String)>,
}

impl OpenAiCompatProvider {
    pub fn new(
        base_url: &str,
        api_key: String,
        model: String,
        extra_headers: Vec<(String, String)>,
    ) -> Self {
        let chat_url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        OpenAiCompatProvider {
            http: reqwest::Client::new(),
            api_key,
            model,
            chat_url,
            extra_headers,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OaiResponse {
    choices: Vec<OaiChoice>,
    usage: Option<OaiUsage>,
}

#[derive(Debug, Deserialize)]
struct OaiChoice {
    message: OaiMessage,
}

#[derive(Debug, Deserialize)]
struct OaiMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OaiUsage {
    total_tokens: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct OaiApiError {
    error: OaiApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct OaiApiErrorDetail {
    message: String,
}

fn openai_messages(system: &str, turns: &[ChatTurn]) -> Vec<serde_json::Value> {
    let mut messages = vec![json!({ "role": "system", "content": system })];
    for turn in turns {
        let role = match turn.role {
            ChatRole::User => "user",
            ChatRole::Model => "assistant",
        };
        messages.push(json!({ "role": role, "content": turn.content }));
    }
    messages
}

fn parse_openai_response(body: &str) -> Result<ChatOutcome, AgmaiError> {
    let parsed: OaiResponse = serde_json::from_str(body)
        .map_err(|e| AgmaiError::LlmApi(format!("Failed to parse response: {e}\nBody: {body}")))?;
    let total_tokens = parsed.usage.as_ref().and_then(|u| u.total_tokens);
    let text = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default();
    if text.is_empty() {
        return Err(AgmaiError::LlmApi("Empty response: no content".into()));
    }
    Ok(ChatOutcome { text, total_tokens })
}

#[async_trait]
impl ChatProvider for OpenAiCompatProvider {
    async fn send_chat(
        &self,
        system: &str,
        turns: &[ChatTurn],
    ) -> Result<ChatOutcome, AgmaiError> {
        let request = json!({
            "model": self.model,
            "messages": openai_messages(system, turns),
        });

        let mut retries = 0u32;
        loop {
            let mut req = self
                .http
                .post(&self.chat_url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("content-type", "application/json");
            for (name, value) in &self.extra_headers {
                req = req.header(name.as_str(), value.as_str());
            }
            let response = req.json(&request).send().await?;
            let status = response.status();

            if status.is_success() {
                let body = response.text().await?;
                return parse_openai_response(&body);
            }

            if status.as_u16() == 429 && retries < MAX_RETRIES {
                retries += 1;
                let delay = std::time::Duration::from_secs(2u64.pow(retries));
                warn!(
                    "Rate limited, retrying in {:?} (attempt {retries}/{MAX_RETRIES})",
                    delay
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            if let Ok(api_err) = serde_json::from_str::<OaiApiError>(&body) {
                return Err(AgmaiError::LlmApi(api_err.error.message));
            }
            return Err(AgmaiError::LlmApi(format!("HTTP {status}: {body}")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_messages_roles() {
        let turns = vec![
            ChatTurn {
                role: ChatRole::User,
                content: "hi".into(),
            },
            ChatTurn {
                role: ChatRole::Model,
                content: "hello".into(),
            },
        ];
        let messages = openai_messages("be brief", &turns);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[2]["role"], "assistant");
    }

    #[test]
    fn test_parse_openai_response() {
        let body = r#"{
            "choices": [{"message": {"content": "hello there"}}],
            "usage": {"total_tokens": 42}
        }"#;
        let outcome = parse_openai_response(body).unwrap();
        assert_eq!(outcome.text, "hello there");
        assert_eq!(outcome.total_tokens, Some(42));
    }

    #[test]
    fn test_parse_openai_empty_content_is_error() {
        let body = r#"{"choices": [{"message": {"content": null}}], "usage": null}"#;
        assert!(parse_openai_response(body).is_err());
    }

    #[test]
    fn test_parse_gemini_response() {
        let body = r#"{
            "candidates": [{
                "content": {"parts": [{"text": "part one "}, {"text": "part two"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"totalTokenCount": 17}
        }"#;
        let outcome = parse_gemini_response(body).unwrap();
        assert_eq!(outcome.text, "part one part two");
        assert_eq!(outcome.total_tokens, Some(17));
    }

    #[test]
    fn test_parse_gemini_safety_block() {
        let body = r#"{
            "candidates": [{"content": null, "finishReason": "SAFETY"}]
        }"#;
        let err = parse_gemini_response(body).unwrap_err();
        assert!(err.to_string().contains("safety"));
    }

    #[test]
    fn test_parse_gemini_prompt_feedback_block() {
        let body = r#"{"promptFeedback": {"blockReason": "SAFETY"}}"#;
        let err = parse_gemini_response(body).unwrap_err();
        assert!(err.to_string().contains("blocked"));
    }

    #[test]
    fn test_factory_covers_all_providers() {
        let mut config: Config = serde_yaml::from_str("telegram_bot_token: \"t\"\n").unwrap();
        config.post_deserialize().unwrap();
        for id in [
            ProviderId::GeminiStandard,
            ProviderId::Gpt4Omni,
            ProviderId::Gpt35Turbo,
            ProviderId::DeepseekChat,
            ProviderId::OpenrouterDeepseek,
            ProviderId::OpenrouterGeminiFlash,
        ] {
            let _provider = create_chat_provider(&config, id);
        }
    }
}
