use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use agmai_core::error::AgmaiError;

use crate::config::Config;

/// A generated image: either a short-lived vendor URL or raw bytes.
#[derive(Debug, Clone)]
pub enum GeneratedImage {
    Url(String),
    Bytes(Vec<u8>),
}

// ---------------------------------------------------------------------------
// DALL-E 3
// ---------------------------------------------------------------------------

pub struct DalleClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct DalleResponse {
    data: Vec<DalleImage>,
}

#[derive(Debug, Deserialize)]
struct DalleImage {
    url: Option<String>,
}

impl DalleClient {
    pub fn new(config: &Config) -> Self {
        DalleClient {
            http: reqwest::Client::new(),
            api_key: config.openai_api_key.clone(),
            model: config.dalle_model.clone(),
            base_url: "https://api.openai.com/v1".into(),
        }
    }

    pub async fn generate(
        &self,
        prompt: &str,
        resolution: &str,
    ) -> Result<GeneratedImage, AgmaiError> {
        let request = json!({
            "model": self.model,
            "prompt": prompt,
            "n": 1,
            "size": resolution,
            "response_format": "url",
        });

        let response = self
            .http
            .post(format!("{}/images/generations", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgmaiError::ImageApi(format!("HTTP {status}: {body}")));
        }

        let body = response.text().await?;
        let parsed: DalleResponse = serde_json::from_str(&body).map_err(|e| {
            AgmaiError::ImageApi(format!("Failed to parse response: {e}\nBody: {body}"))
        })?;
        let url = parsed
            .data
            .into_iter()
            .next()
            .and_then(|img| img.url)
            .ok_or_else(|| AgmaiError::ImageApi("Empty response: no image url".into()))?;
        Ok(GeneratedImage::Url(url))
    }
}

// ---------------------------------------------------------------------------
// YandexArt
// ---------------------------------------------------------------------------

const YANDEX_ART_URL: &str =
    "https://llm.api.cloud.yandex.net/foundationModels/v1/imageGenerationAsync";
const YANDEX_OPERATIONS_URL: &str = "https://llm.api.cloud.yandex.net/operations";
const POLL_INTERVAL_SECS: u64 = 2;
const MAX_POLLS: u32 = 60;

pub struct YandexArtClient {
    http: reqwest::Client,
    api_key: String,
    folder_id: String,
    prompt_limit: usize,
}

#[derive(Debug, Deserialize)]
struct YandexOperationStarted {
    id: String,
}

#[derive(Debug, Deserialize)]
struct YandexOperation {
    done: Option<bool>,
    response: Option<YandexOperationResponse>,
    error: Option<YandexOperationError>,
}

#[derive(Debug, Deserialize)]
struct YandexOperationResponse {
    image: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YandexOperationError {
    message: Option<String>,
}

impl YandexArtClient {
    pub fn new(config: &Config) -> Self {
        YandexArtClient {
            http: reqwest::Client::new(),
            api_key: config.yandex_api_key.clone(),
            folder_id: config.yandex_folder_id.clone(),
            prompt_limit: config.yandexart_prompt_limit,
        }
    }

    /// Kick off an async generation and poll the operation until the image is
    /// ready. The vendor returns the image inline as base64.
    pub async fn generate(&self, prompt: &str) -> Result<GeneratedImage, AgmaiError> {
        if prompt.chars().count() > self.prompt_limit {
            return Err(AgmaiError::ImageApi(format!(
                "Prompt too long: {} chars, limit is {}",
                prompt.chars().count(),
                self.prompt_limit
            )));
        }

        let request = json!({
            "modelUri": format!("art://{}/yandex-art/latest", self.folder_id),
            "generationOptions": {
                "aspectRatio": { "widthRatio": "1", "heightRatio": "1" }
            },
            "messages": [{ "weight": "1", "text": prompt }],
        });

        let response = self
            .http
            .post(YANDEX_ART_URL)
            .header("Authorization", format!("Api-Key {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgmaiError::ImageApi(format!("HTTP {status}: {body}")));
        }
        let started: YandexOperationStarted = response.json().await?;
        debug!("YandexArt operation started: {}", started.id);

        for _ in 0..MAX_POLLS {
            tokio::time::sleep(std::time::Duration::from_secs(POLL_INTERVAL_SECS)).await;

            let poll = self
                .http
                .get(format!("{YANDEX_OPERATIONS_URL}/{}", started.id))
                .header("Authorization", format!("Api-Key {}", self.api_key))
                .send()
                .await?;
            if !poll.status().is_success() {
                warn!("YandexArt poll failed with HTTP {}", poll.status());
                continue;
            }
            let operation: YandexOperation = poll.json().await?;
            if operation.done != Some(true) {
                continue;
            }
            if let Some(error) = operation.error {
                return Err(AgmaiError::ImageApi(
                    error.message.unwrap_or_else(|| "generation failed".into()),
                ));
            }
            let encoded = operation
                .response
                .and_then(|r| r.image)
                .ok_or_else(|| AgmaiError::ImageApi("Operation finished without image".into()))?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded.as_bytes())
                .map_err(|e| AgmaiError::ImageApi(format!("Invalid image encoding: {e}")))?;
            return Ok(GeneratedImage::Bytes(bytes));
        }

        Err(AgmaiError::ImageApi(format!(
            "Generation timed out after {} polls",
            MAX_POLLS
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let mut config: Config = serde_yaml::from_str("telegram_bot_token: \"t\"\n").unwrap();
        config.post_deserialize().unwrap();
        config
    }

    #[tokio::test]
    async fn test_yandexart_rejects_long_prompt() {
        let client = YandexArtClient::new(&test_config());
        let prompt = "x".repeat(501);
        let err = client.generate(&prompt).await.unwrap_err();
        assert!(err.to_string().contains("Prompt too long"));
    }

    #[test]
    fn test_dalle_response_parses_url() {
        let body = r#"{"data": [{"url": "https://img.example/x.png"}]}"#;
        let parsed: DalleResponse = serde_json::from_str(body).unwrap();
        assert_eq!(
            parsed.data[0].url.as_deref(),
            Some("https://img.example/x.png")
        );
    }

    #[test]
    fn test_yandex_operation_parses_inline_image() {
        let body = r#"{"done": true, "response": {"image": "aGVsbG8="}}"#;
        let operation: YandexOperation = serde_json::from_str(body).unwrap();
        assert_eq!(operation.done, Some(true));
        let encoded = operation.response.unwrap().image.unwrap();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .unwrap();
        assert_eq!(bytes, b"hello");
    }
}
