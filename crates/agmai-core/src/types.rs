use serde::{Deserialize, Serialize};

/// Subscription level gating provider access and daily quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Lite,
    Pro,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Lite => "lite",
            Tier::Pro => "pro",
        }
    }

    pub fn parse(s: &str) -> Option<Tier> {
        match s {
            "free" => Some(Tier::Free),
            "lite" => Some(Tier::Lite),
            "pro" => Some(Tier::Pro),
            _ => None,
        }
    }
}

/// Logical chat-provider identifiers. The string forms are stored in the
/// users table and used in config tier lists, so they must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    GeminiStandard,
    #[serde(rename = "gpt_4_omni")]
    Gpt4Omni,
    #[serde(rename = "gpt_3_5_turbo")]
    Gpt35Turbo,
    DeepseekChat,
    OpenrouterDeepseek,
    OpenrouterGeminiFlash,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::GeminiStandard => "gemini_standard",
            ProviderId::Gpt4Omni => "gpt_4_omni",
            ProviderId::Gpt35Turbo => "gpt_3_5_turbo",
            ProviderId::DeepseekChat => "deepseek_chat",
            ProviderId::OpenrouterDeepseek => "openrouter_deepseek",
            ProviderId::OpenrouterGeminiFlash => "openrouter_gemini_flash",
        }
    }

    pub fn parse(s: &str) -> Option<ProviderId> {
        match s {
            "gemini_standard" => Some(ProviderId::GeminiStandard),
            "gpt_4_omni" => Some(ProviderId::Gpt4Omni),
            "gpt_3_5_turbo" => Some(ProviderId::Gpt35Turbo),
            "deepseek_chat" => Some(ProviderId::DeepseekChat),
            "openrouter_deepseek" => Some(ProviderId::OpenrouterDeepseek),
            "openrouter_gemini_flash" => Some(ProviderId::OpenrouterGeminiFlash),
            _ => None,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderId::GeminiStandard => "Gemini",
            ProviderId::Gpt4Omni => "GPT-4 Omni",
            ProviderId::Gpt35Turbo => "GPT-3.5 Turbo",
            ProviderId::DeepseekChat => "DeepSeek",
            ProviderId::OpenrouterDeepseek => "DeepSeek (OpenRouter)",
            ProviderId::OpenrouterGeminiFlash => "Gemini 2.0 Flash (OpenRouter)",
        }
    }
}

/// Image-generation backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageService {
    Dalle3,
    YandexArt,
}

impl ImageService {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageService::Dalle3 => "dalle3",
            ImageService::YandexArt => "yandexart",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ImageService::Dalle3 => "DALL-E 3",
            ImageService::YandexArt => "YandexArt",
        }
    }
}

/// Chat-history roles. Stored as TEXT with a CHECK constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    User,
    Model,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Model => "model",
        }
    }

    pub fn parse(s: &str) -> Option<ChatRole> {
        match s {
            "user" => Some(ChatRole::User),
            "model" => Some(ChatRole::Model),
            _ => None,
        }
    }
}

/// How replies are delivered back to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    TxtFile,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Text => "text",
            OutputFormat::TxtFile => "txt",
        }
    }

    pub fn parse(s: &str) -> OutputFormat {
        match s {
            "txt" => OutputFormat::TxtFile,
            _ => OutputFormat::Text,
        }
    }
}

/// Ledger entry kinds. Append-only; renaming a variant's string form would
/// orphan existing rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxKind {
    Topup,
    RequestCost,
    ReferralBonus,
    Purchase,
    ReferralCommission,
    ImageGenCost,
}

impl TxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxKind::Topup => "topup",
            TxKind::RequestCost => "request_cost",
            TxKind::ReferralBonus => "referral_bonus",
            TxKind::Purchase => "purchase",
            TxKind::ReferralCommission => "referral_commission",
            TxKind::ImageGenCost => "image_gen_cost",
        }
    }

    pub fn parse(s: &str) -> Option<TxKind> {
        match s {
            "topup" => Some(TxKind::Topup),
            "request_cost" => Some(TxKind::RequestCost),
            "referral_bonus" => Some(TxKind::ReferralBonus),
            "purchase" => Some(TxKind::Purchase),
            "referral_commission" => Some(TxKind::ReferralCommission),
            "image_gen_cost" => Some(TxKind::ImageGenCost),
            _ => None,
        }
    }
}
