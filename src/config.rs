use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use agmai_core::error::AgmaiError;
use agmai_core::types::{ProviderId, Tier};

fn default_telegram_bot_token() -> String {
    String::new()
}
fn default_bot_username() -> String {
    String::new()
}
fn default_admin_ids() -> Vec<i64> {
    Vec::new()
}
fn default_data_dir() -> String {
    "./agmai.data".into()
}
fn default_personas_dir() -> String {
    "./personas".into()
}
fn default_api_key() -> String {
    String::new()
}
fn default_gemini_model() -> String {
    "gemini-1.5-pro".into()
}
fn default_gpt4_model() -> String {
    "gpt-4o".into()
}
fn default_gpt35_model() -> String {
    "gpt-3.5-turbo".into()
}
fn default_dalle_model() -> String {
    "dall-e-3".into()
}
fn default_deepseek_model() -> String {
    "deepseek-chat".into()
}
fn default_deepseek_base_url() -> String {
    "https://api.deepseek.com/v1".into()
}
fn default_openrouter_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_openrouter_deepseek_model() -> String {
    "deepseek/deepseek-chat".into()
}
fn default_openrouter_gemini_flash_model() -> String {
    "google/gemini-2.0-flash-exp:free".into()
}
fn default_yandexart_prompt_limit() -> usize {
    500
}
fn default_usd_to_agm_rate() -> f64 {
    100.0
}
fn default_referral_percentage() -> i64 {
    10
}
fn default_dalle_prices() -> Vec<ImagePrice> {
    vec![
        ImagePrice {
            resolution: "1024x1024".into(),
            usd: 0.04,
        },
        ImagePrice {
            resolution: "1024x1792".into(),
            usd: 0.08,
        },
        ImagePrice {
            resolution: "1792x1024".into(),
            usd: 0.08,
        },
    ]
}
fn default_yandexart_price_usd() -> f64 {
    0.02
}
fn default_summarizer_provider() -> ProviderId {
    ProviderId::GeminiStandard
}
fn default_request_timeout_secs() -> u64 {
    120
}
fn default_tiers() -> HashMap<String, TierConfig> {
    let mut tiers = HashMap::new();
    tiers.insert(
        "free".to_string(),
        TierConfig {
            daily_limit: Some(20),
            providers: vec![ProviderId::GeminiStandard, ProviderId::Gpt35Turbo],
            active_buffer: 10,
            summarize_trigger_tokens: 1500,
        },
    );
    tiers.insert(
        "lite".to_string(),
        TierConfig {
            daily_limit: Some(100),
            providers: vec![
                ProviderId::GeminiStandard,
                ProviderId::Gpt35Turbo,
                ProviderId::DeepseekChat,
                ProviderId::OpenrouterGeminiFlash,
            ],
            active_buffer: 20,
            summarize_trigger_tokens: 3000,
        },
    );
    tiers.insert(
        "pro".to_string(),
        TierConfig {
            daily_limit: None,
            providers: vec![
                ProviderId::GeminiStandard,
                ProviderId::Gpt4Omni,
                ProviderId::Gpt35Turbo,
                ProviderId::DeepseekChat,
                ProviderId::OpenrouterDeepseek,
                ProviderId::OpenrouterGeminiFlash,
            ],
            active_buffer: 30,
            summarize_trigger_tokens: 6000,
        },
    );
    tiers
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImagePrice {
    pub resolution: String,
    pub usd: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TierConfig {
    /// None means unmetered.
    pub daily_limit: Option<i64>,
    pub providers: Vec<ProviderId>,
    pub active_buffer: i64,
    pub summarize_trigger_tokens: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_telegram_bot_token")]
    pub telegram_bot_token: String,
    #[serde(default = "default_bot_username")]
    pub bot_username: String,
    #[serde(default = "default_admin_ids")]
    pub admin_ids: Vec<i64>,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_personas_dir")]
    pub personas_dir: String,

    #[serde(default = "default_api_key")]
    pub gemini_api_key: String,
    #[serde(default = "default_gemini_model")]
    pub gemini_model: String,

    #[serde(default = "default_api_key")]
    pub openai_api_key: String,
    #[serde(default = "default_gpt4_model")]
    pub gpt4_model: String,
    #[serde(default = "default_gpt35_model")]
    pub gpt35_model: String,
    #[serde(default = "default_dalle_model")]
    pub dalle_model: String,

    #[serde(default = "default_api_key")]
    pub deepseek_api_key: String,
    #[serde(default = "default_deepseek_model")]
    pub deepseek_model: String,
    #[serde(default = "default_deepseek_base_url")]
    pub deepseek_base_url: String,

    #[serde(default = "default_api_key")]
    pub openrouter_api_key: String,
    #[serde(default = "default_openrouter_base_url")]
    pub openrouter_base_url: String,
    #[serde(default)]
    pub openrouter_site_url: Option<String>,
    #[serde(default)]
    pub openrouter_app_name: Option<String>,
    #[serde(default = "default_openrouter_deepseek_model")]
    pub openrouter_deepseek_model: String,
    #[serde(default = "default_openrouter_gemini_flash_model")]
    pub openrouter_gemini_flash_model: String,

    #[serde(default = "default_api_key")]
    pub yandex_api_key: String,
    #[serde(default = "default_api_key")]
    pub yandex_folder_id: String,
    #[serde(default = "default_yandexart_prompt_limit")]
    pub yandexart_prompt_limit: usize,

    /// AGMcoin per one USD.
    #[serde(default = "default_usd_to_agm_rate")]
    pub usd_to_agm_rate: f64,
    /// One-level referral commission on top-ups, percent.
    #[serde(default = "default_referral_percentage")]
    pub referral_percentage: i64,
    #[serde(default = "default_dalle_prices")]
    pub dalle_prices: Vec<ImagePrice>,
    #[serde(default = "default_yandexart_price_usd")]
    pub yandexart_price_usd: f64,

    #[serde(default = "default_tiers")]
    pub tiers: HashMap<String, TierConfig>,
    #[serde(default = "default_summarizer_provider")]
    pub summarizer_provider: ProviderId,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Config {
    pub fn resolve_config_path() -> Result<Option<PathBuf>, AgmaiError> {
        if let Ok(custom) = std::env::var("AGMAI_CONFIG") {
            if std::path::Path::new(&custom).exists() {
                return Ok(Some(PathBuf::from(custom)));
            }
            return Err(AgmaiError::Config(format!(
                "AGMAI_CONFIG points to non-existent file: {custom}"
            )));
        }

        if std::path::Path::new("./agmai.config.yaml").exists() {
            return Ok(Some(PathBuf::from("./agmai.config.yaml")));
        }
        if std::path::Path::new("./agmai.config.yml").exists() {
            return Ok(Some(PathBuf::from("./agmai.config.yml")));
        }
        Ok(None)
    }

    /// Load config from YAML file.
    pub fn load() -> Result<Self, AgmaiError> {
        let yaml_path = Self::resolve_config_path()?;

        if let Some(path) = yaml_path {
            let path_str = path.to_string_lossy().to_string();
            let content = std::fs::read_to_string(&path)
                .map_err(|e| AgmaiError::Config(format!("Failed to read {path_str}: {e}")))?;
            let mut config: Config = serde_yaml::from_str(&content)
                .map_err(|e| AgmaiError::Config(format!("Failed to parse {path_str}: {e}")))?;
            config.post_deserialize()?;
            return Ok(config);
        }

        Err(AgmaiError::Config(
            "No agmai.config.yaml found. Create one or set AGMAI_CONFIG.".into(),
        ))
    }

    /// Apply post-deserialization normalization and validation.
    pub fn post_deserialize(&mut self) -> Result<(), AgmaiError> {
        if self.telegram_bot_token.trim().is_empty() {
            return Err(AgmaiError::Config("telegram_bot_token is required".into()));
        }
        if self.data_dir.trim().is_empty() {
            self.data_dir = default_data_dir();
        }
        if self.personas_dir.trim().is_empty() {
            self.personas_dir = default_personas_dir();
        }
        if !(0..=100).contains(&self.referral_percentage) {
            return Err(AgmaiError::Config(format!(
                "referral_percentage must be within 0..=100, got {}",
                self.referral_percentage
            )));
        }
        if self.usd_to_agm_rate <= 0.0 {
            return Err(AgmaiError::Config(
                "usd_to_agm_rate must be positive".into(),
            ));
        }
        if self.yandexart_prompt_limit == 0 {
            self.yandexart_prompt_limit = default_yandexart_prompt_limit();
        }
        if self.request_timeout_secs == 0 {
            self.request_timeout_secs = default_request_timeout_secs();
        }

        for tier in [Tier::Free, Tier::Lite, Tier::Pro] {
            let Some(tc) = self.tiers.get(tier.as_str()) else {
                return Err(AgmaiError::Config(format!(
                    "tiers must define '{}'",
                    tier.as_str()
                )));
            };
            if tc.providers.is_empty() {
                return Err(AgmaiError::Config(format!(
                    "tier '{}' must allow at least one provider",
                    tier.as_str()
                )));
            }
            if tc.active_buffer <= 0 {
                return Err(AgmaiError::Config(format!(
                    "tier '{}' active_buffer must be positive",
                    tier.as_str()
                )));
            }
            if tc.summarize_trigger_tokens <= 0 {
                return Err(AgmaiError::Config(format!(
                    "tier '{}' summarize_trigger_tokens must be positive",
                    tier.as_str()
                )));
            }
            if let Some(limit) = tc.daily_limit {
                if limit <= 0 {
                    return Err(AgmaiError::Config(format!(
                        "tier '{}' daily_limit must be positive or omitted",
                        tier.as_str()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn tier_config(&self, tier: Tier) -> &TierConfig {
        self.tiers
            .get(tier.as_str())
            .unwrap_or_else(|| panic!("tier '{}' validated at load time", tier.as_str()))
    }

    pub fn tier_allows(&self, tier: Tier, provider: ProviderId) -> bool {
        self.tier_config(tier).providers.contains(&provider)
    }

    /// First provider of the tier, used when a stored selection is no longer
    /// permitted.
    pub fn tier_fallback_provider(&self, tier: Tier) -> ProviderId {
        self.tier_config(tier).providers[0]
    }

    pub fn dalle_price_usd(&self, resolution: &str) -> Option<f64> {
        self.dalle_prices
            .iter()
            .find(|p| p.resolution == resolution)
            .map(|p| p.usd)
    }

    pub fn is_admin(&self, telegram_id: i64) -> bool {
        self.admin_ids.contains(&telegram_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        "telegram_bot_token: \"123:abc\"\nbot_username: \"agmai_bot\"\n"
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let mut config: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.post_deserialize().unwrap();

        assert_eq!(config.data_dir, "./agmai.data");
        assert_eq!(config.usd_to_agm_rate, 100.0);
        assert_eq!(config.referral_percentage, 10);
        assert_eq!(config.tier_config(Tier::Free).daily_limit, Some(20));
        assert!(config.tier_config(Tier::Pro).daily_limit.is_none());
        assert_eq!(config.summarizer_provider, ProviderId::GeminiStandard);
    }

    #[test]
    fn test_missing_token_rejected() {
        let mut config: Config = serde_yaml::from_str("{}").unwrap();
        assert!(config.post_deserialize().is_err());
    }

    #[test]
    fn test_referral_percentage_bounds() {
        let yaml = format!("{}referral_percentage: 150\n", minimal_yaml());
        let mut config: Config = serde_yaml::from_str(&yaml).unwrap();
        assert!(config.post_deserialize().is_err());
    }

    #[test]
    fn test_tier_provider_permissions() {
        let mut config: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.post_deserialize().unwrap();

        assert!(config.tier_allows(Tier::Free, ProviderId::GeminiStandard));
        assert!(!config.tier_allows(Tier::Free, ProviderId::Gpt4Omni));
        assert!(config.tier_allows(Tier::Pro, ProviderId::Gpt4Omni));
        assert_eq!(
            config.tier_fallback_provider(Tier::Free),
            ProviderId::GeminiStandard
        );
    }

    #[test]
    fn test_custom_tier_overrides() {
        let yaml = format!(
            "{}tiers:\n  free:\n    daily_limit: 5\n    providers: [gemini_standard]\n    active_buffer: 4\n    summarize_trigger_tokens: 800\n  lite:\n    daily_limit: 50\n    providers: [gemini_standard, deepseek_chat]\n    active_buffer: 10\n    summarize_trigger_tokens: 2000\n  pro:\n    daily_limit: null\n    providers: [gpt_4_omni]\n    active_buffer: 20\n    summarize_trigger_tokens: 4000\n",
            minimal_yaml()
        );
        let mut config: Config = serde_yaml::from_str(&yaml).unwrap();
        config.post_deserialize().unwrap();
        assert_eq!(config.tier_config(Tier::Free).daily_limit, Some(5));
        assert_eq!(config.tier_config(Tier::Lite).providers.len(), 2);
    }

    #[test]
    fn test_dalle_price_lookup() {
        let mut config: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.post_deserialize().unwrap();
        assert_eq!(config.dalle_price_usd("1024x1024"), Some(0.04));
        assert!(config.dalle_price_usd("640x480").is_none());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut config: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.post_deserialize().unwrap();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.telegram_bot_token, config.telegram_bot_token);
        assert_eq!(parsed.tiers.len(), 3);
    }
}
