use std::sync::Arc;
use std::time::SystemTime;

use teloxide::prelude::*;
use teloxide::types::{
    ChatAction, InlineKeyboardButton, InlineKeyboardMarkup, InputFile, KeyboardButton,
    KeyboardMarkup,
};
use tracing::{error, info, warn};

use agmai_core::error::AgmaiError;
use agmai_core::text::split_text;
use agmai_core::types::{ChatRole, ImageService, OutputFormat, ProviderId, Tier};
use agmai_storage::db::{call_blocking, Database, UserRecord};
use agmai_storage::ledger::build_wallet_report;

use crate::billing;
use crate::config::Config;
use crate::context;
use crate::imagegen::{DalleClient, GeneratedImage, YandexArtClient};
use crate::llm::{create_chat_provider, ChatTurn};
use crate::runtime::AppState;
use crate::session::ChatState;

const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

const BTN_CHARACTERS: &str = "🎭 Characters";
const BTN_CHOOSE_AI: &str = "🤖 Choose AI";
const BTN_PROFILE: &str = "👤 Profile";
const BTN_SETTINGS: &str = "⚙️ Settings";
const BTN_IMAGE: &str = "🎨 Generate image";

pub async fn start_bot(state: Arc<AppState>) -> anyhow::Result<()> {
    let bot = Bot::new(&state.config.telegram_bot_token);

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(handle_message))
        .branch(Update::filter_callback_query().endpoint(handle_callback));

    Dispatcher::builder(bot, handler)
        .default_handler(|_| async {})
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

fn hub_keyboard() -> KeyboardMarkup {
    KeyboardMarkup::new(vec![
        vec![
            KeyboardButton::new(BTN_CHARACTERS),
            KeyboardButton::new(BTN_CHOOSE_AI),
        ],
        vec![
            KeyboardButton::new(BTN_PROFILE),
            KeyboardButton::new(BTN_SETTINGS),
        ],
        vec![KeyboardButton::new(BTN_IMAGE)],
    ])
    .resize_keyboard()
}

/// Additive captcha from the clock's sub-second noise; no RNG dependency
/// needed for a two-digit sum. Returns the question, the answer, and four
/// answer options with the correct one at a clock-chosen position.
fn make_captcha() -> (String, u64, Vec<u64>) {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0) as u64;
    let a = nanos % 10 + 1;
    let b = (nanos / 10) % 10 + 1;
    let sum = a + b;

    let mut options = vec![sum - 1, sum, sum + 1, sum + 2];
    options.rotate_left((nanos / 100 % 4) as usize);
    (
        format!("Quick check before we start: what is {a} + {b}?"),
        sum,
        options,
    )
}

/// Commands reachable before the captcha gate. Everything else requires a
/// verified user.
fn verification_exempt(text: &str) -> bool {
    text.starts_with("/start")
}

fn parse_start_payload(text: &str) -> Option<i64> {
    let rest = text.strip_prefix("/start")?.trim();
    let id = rest.strip_prefix("ref_")?;
    id.parse::<i64>().ok()
}

/// `/setsub <telegram_id> <tier> [days]`
fn parse_setsub(text: &str) -> Option<(i64, Tier, i64)> {
    let rest = text.strip_prefix("/setsub")?.trim();
    let mut parts = rest.split_whitespace();
    let telegram_id = parts.next()?.parse::<i64>().ok()?;
    let tier = Tier::parse(parts.next()?)?;
    let days = match parts.next() {
        Some(raw) => raw.parse::<i64>().ok().filter(|d| *d > 0)?,
        None => 30,
    };
    Some((telegram_id, tier, days))
}

/// `/addbalance <telegram_id> <amount>`
fn parse_addbalance(text: &str) -> Option<(i64, i64)> {
    let rest = text.strip_prefix("/addbalance")?.trim();
    let mut parts = rest.split_whitespace();
    let telegram_id = parts.next()?.parse::<i64>().ok()?;
    let amount = parts.next()?.parse::<i64>().ok().filter(|a| *a > 0)?;
    if parts.next().is_some() {
        return None;
    }
    Some((telegram_id, amount))
}

fn today_string() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}

/// The stored provider when the tier still allows it, otherwise the tier
/// default. The flag reports whether a correction happened.
fn effective_provider(config: &Config, tier: Tier, stored: &str) -> (ProviderId, bool) {
    match ProviderId::parse(stored) {
        Some(provider) if config.tier_allows(tier, provider) => (provider, false),
        _ => (config.tier_fallback_provider(tier), true),
    }
}

/// Vendor-side prompt caps checked before any balance is touched.
fn image_prompt_too_long(config: &Config, service: ImageService, prompt: &str) -> bool {
    match service {
        ImageService::Dalle3 => false,
        ImageService::YandexArt => prompt.chars().count() > config.yandexart_prompt_limit,
    }
}

/// Effective tier with lazy expiry: a lapsed paid tier downgrades on touch.
async fn resolve_tier(
    db: Arc<Database>,
    user: &UserRecord,
) -> Result<(Tier, bool), AgmaiError> {
    let tier = Tier::parse(&user.subscription_tier).unwrap_or(Tier::Free);
    if tier == Tier::Free {
        return Ok((Tier::Free, false));
    }
    let expired = match &user.subscription_expiry {
        Some(raw) => chrono::DateTime::parse_from_rfc3339(raw)
            .map(|expiry| expiry < chrono::Utc::now())
            .unwrap_or(true),
        None => false,
    };
    if expired {
        let user_id = user.id;
        call_blocking(db, move |db| db.downgrade_to_free(user_id)).await?;
        return Ok((Tier::Free, true));
    }
    Ok((tier, false))
}

async fn handle_message(
    bot: Bot,
    msg: Message,
    state: Arc<AppState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let Some(from) = msg.from.as_ref() else {
        return Ok(());
    };
    if !msg.chat.is_private() {
        return Ok(());
    }
    let text = msg.text().unwrap_or("").to_string();
    if text.trim().is_empty() {
        return Ok(());
    }

    let telegram_id = from.id.0 as i64;
    let full_name = from.full_name();
    let username = from.username.clone();
    let user = call_blocking(state.db.clone(), move |db| {
        db.add_or_update_user(telegram_id, &full_name, username.as_deref())
    })
    .await?;

    let chat_id = msg.chat.id;

    if verification_exempt(&text) {
        handle_start(&bot, &state, &user, chat_id, &text).await?;
        return Ok(());
    }

    // Nothing past this point is reachable before the captcha is solved.
    if let ChatState::AwaitingCaptcha { answer } = state.sessions.get(chat_id.0) {
        handle_captcha_answer(&bot, &state, &user, chat_id, &text, &answer).await?;
        return Ok(());
    }
    if !user.is_verified {
        send_captcha(&bot, &state, chat_id).await?;
        return Ok(());
    }

    if text.trim() == "/reset" {
        handle_reset(&bot, &state, &user, chat_id).await?;
        return Ok(());
    }
    if text.starts_with("/setsub") {
        handle_setsub(&bot, &state, &user, chat_id, &text).await?;
        return Ok(());
    }
    if text.starts_with("/addbalance") {
        handle_addbalance(&bot, &state, &user, chat_id, &text).await?;
        return Ok(());
    }

    // Multi-step flows take precedence over hub buttons.
    match state.sessions.get(chat_id.0) {
        ChatState::AwaitingCaptcha { .. } => {}
        ChatState::AwaitingCharacterName => {
            handle_new_character_name(&bot, &state, chat_id, &text).await?;
            return Ok(());
        }
        ChatState::AwaitingCharacterPrompt { name } => {
            handle_new_character_prompt(&bot, &state, &user, chat_id, &name, &text).await?;
            return Ok(());
        }
        ChatState::AwaitingEditName { character_id } => {
            let new_name = text.trim().to_string();
            let user_id = user.id;
            let renamed = call_blocking(state.db.clone(), move |db| {
                db.rename_character(user_id, character_id, &new_name)
            })
            .await;
            state.sessions.clear(chat_id.0);
            match renamed {
                Ok(true) => bot.send_message(chat_id, "Character renamed.").await?,
                Ok(false) => bot.send_message(chat_id, "Character not found.").await?,
                Err(e) => {
                    bot.send_message(chat_id, format!("Could not rename: {e}"))
                        .await?
                }
            };
            return Ok(());
        }
        ChatState::AwaitingEditPrompt { character_id } => {
            let prompt = text.trim().to_string();
            let user_id = user.id;
            let updated = call_blocking(state.db.clone(), move |db| {
                db.update_character_prompt(user_id, character_id, &prompt)
            })
            .await?;
            state.sessions.clear(chat_id.0);
            if updated {
                bot.send_message(chat_id, "Character prompt updated.").await?;
            } else {
                bot.send_message(chat_id, "Character not found.").await?;
            }
            return Ok(());
        }
        ChatState::AwaitingImagePrompt { service } => {
            state.sessions.clear(chat_id.0);
            handle_image_request(&bot, &state, &user, chat_id, service, text.trim()).await?;
            return Ok(());
        }
        ChatState::Idle => {}
    }

    match text.as_str() {
        BTN_CHARACTERS => show_characters_menu(&bot, &state, &user, chat_id).await?,
        BTN_CHOOSE_AI => show_provider_menu(&bot, &state, &user, chat_id).await?,
        BTN_PROFILE => show_profile(&bot, &state, &user, chat_id).await?,
        BTN_SETTINGS => show_settings_menu(&bot, &user, chat_id).await?,
        BTN_IMAGE => show_image_menu(&bot, &state, chat_id).await?,
        _ => process_ai_request(&bot, &state, &user, chat_id, &text).await?,
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn handle_start(
    bot: &Bot,
    state: &Arc<AppState>,
    user: &UserRecord,
    chat_id: ChatId,
    text: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if let Some(referrer_id) = parse_start_payload(text) {
        let user_id = user.id;
        let attached = call_blocking(state.db.clone(), move |db| {
            db.set_referrer(user_id, referrer_id)
        })
        .await?;
        if attached {
            info!("User {} joined via referral from {}", user.id, referrer_id);
        }
    }

    if !user.is_verified {
        send_captcha(bot, state, chat_id).await?;
        return Ok(());
    }

    bot.send_message(chat_id, "Welcome back! Pick an action below or just type a message.")
        .reply_markup(hub_keyboard())
        .await?;
    Ok(())
}

async fn handle_reset(
    bot: &Bot,
    state: &Arc<AppState>,
    user: &UserRecord,
    chat_id: ChatId,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let persona = current_persona_name(user, state);
    let user_id = user.id;
    let persona_owned = persona.clone();
    let deleted = call_blocking(state.db.clone(), move |db| {
        db.clear_history(user_id, &persona_owned)
    })
    .await?;
    bot.send_message(
        chat_id,
        format!("Conversation with {persona} cleared ({deleted} messages)."),
    )
    .await?;
    Ok(())
}

async fn handle_setsub(
    bot: &Bot,
    state: &Arc<AppState>,
    user: &UserRecord,
    chat_id: ChatId,
    text: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if !state.config.is_admin(user.telegram_id) {
        bot.send_message(chat_id, "Unknown command.").await?;
        return Ok(());
    }
    let Some((target_telegram_id, tier, days)) = parse_setsub(text) else {
        bot.send_message(chat_id, "Usage: /setsub <telegram_id> <tier> [days]")
            .await?;
        return Ok(());
    };

    let target = call_blocking(state.db.clone(), move |db| {
        db.get_user_by_telegram_id(target_telegram_id)
    })
    .await?;
    let Some(target) = target else {
        bot.send_message(chat_id, format!("No user with telegram id {target_telegram_id}"))
            .await?;
        return Ok(());
    };

    let expiry = if tier == Tier::Free {
        None
    } else {
        Some((chrono::Utc::now() + chrono::Duration::days(days)).to_rfc3339())
    };
    let target_id = target.id;
    let tier_str = tier.as_str().to_string();
    call_blocking(state.db.clone(), move |db| {
        db.set_subscription(target_id, &tier_str, expiry.as_deref())
    })
    .await?;
    bot.send_message(
        chat_id,
        format!("Set {} to '{}' for {days} days.", target.full_name, tier.as_str()),
    )
    .await?;
    Ok(())
}

async fn handle_addbalance(
    bot: &Bot,
    state: &Arc<AppState>,
    user: &UserRecord,
    chat_id: ChatId,
    text: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if !state.config.is_admin(user.telegram_id) {
        bot.send_message(chat_id, "Unknown command.").await?;
        return Ok(());
    }
    let Some((target_telegram_id, amount)) = parse_addbalance(text) else {
        bot.send_message(chat_id, "Usage: /addbalance <telegram_id> <amount>")
            .await?;
        return Ok(());
    };

    let target = call_blocking(state.db.clone(), move |db| {
        db.get_user_by_telegram_id(target_telegram_id)
    })
    .await?;
    let Some(target) = target else {
        bot.send_message(chat_id, format!("No user with telegram id {target_telegram_id}"))
            .await?;
        return Ok(());
    };

    let (topup, commission) =
        billing::apply_topup(state.db.clone(), &state.config, target.id, amount, None).await?;
    let commission_note = commission
        .map(|c| format!(" Referral commission: {} AGMcoin.", c.amount))
        .unwrap_or_default();
    bot.send_message(
        chat_id,
        format!(
            "Credited {amount} AGMcoin to {} (balance {}).{commission_note}",
            target.full_name, topup.balance_after
        ),
    )
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Captcha
// ---------------------------------------------------------------------------

async fn send_captcha(
    bot: &Bot,
    state: &Arc<AppState>,
    chat_id: ChatId,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (question, answer, options) = make_captcha();
    state.sessions.set(
        chat_id.0,
        ChatState::AwaitingCaptcha {
            answer: answer.to_string(),
        },
    );
    let buttons: Vec<InlineKeyboardButton> = options
        .iter()
        .map(|n| InlineKeyboardButton::callback(n.to_string(), format!("captcha:{n}")))
        .collect();
    bot.send_message(chat_id, question)
        .reply_markup(InlineKeyboardMarkup::new(vec![buttons]))
        .await?;
    Ok(())
}

async fn handle_captcha_answer(
    bot: &Bot,
    state: &Arc<AppState>,
    user: &UserRecord,
    chat_id: ChatId,
    text: &str,
    expected: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if text.trim() == expected {
        let user_id = user.id;
        call_blocking(state.db.clone(), move |db| db.verify_user(user_id)).await?;
        state.sessions.clear(chat_id.0);
        bot.send_message(
            chat_id,
            "You're in! Pick an action below or just type a message.",
        )
        .reply_markup(hub_keyboard())
        .await?;
    } else {
        send_captcha(bot, state, chat_id).await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Menus
// ---------------------------------------------------------------------------

fn marked(label: &str, selected: bool) -> String {
    if selected {
        format!("✅ {label}")
    } else {
        label.to_string()
    }
}

async fn show_characters_menu(
    bot: &Bot,
    state: &Arc<AppState>,
    user: &UserRecord,
    chat_id: ChatId,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let user_id = user.id;
    let characters =
        call_blocking(state.db.clone(), move |db| db.list_characters(user_id)).await?;
    let current = current_persona_name(user, state);

    let mut rows: Vec<Vec<InlineKeyboardButton>> = Vec::new();
    for persona in state.personas.categories().iter().flat_map(|category| {
        state.personas.in_category(category)
    }) {
        rows.push(vec![InlineKeyboardButton::callback(
            marked(&persona.name, persona.name == current),
            format!("persona:{}", persona.name),
        )]);
    }
    for character in &characters {
        rows.push(vec![InlineKeyboardButton::callback(
            marked(&character.name, character.name == current),
            format!("char:{}", character.id),
        )]);
    }
    rows.push(vec![InlineKeyboardButton::callback(
        "➕ New character",
        "char_new",
    )]);

    bot.send_message(chat_id, "Personas and your characters:")
        .reply_markup(InlineKeyboardMarkup::new(rows))
        .await?;
    Ok(())
}

async fn show_provider_menu(
    bot: &Bot,
    state: &Arc<AppState>,
    user: &UserRecord,
    chat_id: ChatId,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (tier, _) = resolve_tier(state.db.clone(), user).await?;
    let current = ProviderId::parse(&user.current_provider);

    let mut rows: Vec<Vec<InlineKeyboardButton>> = state
        .config
        .tier_config(tier)
        .providers
        .iter()
        .map(|p| {
            vec![InlineKeyboardButton::callback(
                marked(p.display_name(), Some(*p) == current),
                format!("provider:{}", p.as_str()),
            )]
        })
        .collect();
    rows.push(vec![
        InlineKeyboardButton::callback("🎨 DALL-E 3", "img:dalle3"),
        InlineKeyboardButton::callback("🎨 YandexArt", "img:yandexart"),
    ]);

    bot.send_message(
        chat_id,
        format!("Models available on the '{}' tier:", tier.as_str()),
    )
    .reply_markup(InlineKeyboardMarkup::new(rows))
    .await?;
    Ok(())
}

async fn show_profile(
    bot: &Bot,
    state: &Arc<AppState>,
    user: &UserRecord,
    chat_id: ChatId,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (tier, _) = resolve_tier(state.db.clone(), user).await?;
    let wallet = build_wallet_report(state.db.clone(), user.id).await?;

    let quota = match state.config.tier_config(tier).daily_limit {
        Some(limit) => {
            let used = if user.last_request_date.as_deref() == Some(today_string().as_str()) {
                user.daily_requests_count
            } else {
                0
            };
            format!("{used}/{limit} requests today")
        }
        None => "unmetered".to_string(),
    };
    let referral_link = format!(
        "https://t.me/{}?start=ref_{}",
        state.config.bot_username, user.id
    );

    let profile = format!(
        "👤 {}\nTier: {}{}\nUsage: {}\n\n{}\n\nInvite friends: {}",
        user.full_name,
        tier.as_str(),
        user.subscription_expiry
            .as_deref()
            .map(|e| format!(" (until {e})"))
            .unwrap_or_default(),
        quota,
        wallet,
        referral_link,
    );
    let rows = vec![vec![InlineKeyboardButton::callback("💳 Top up", "topup")]];
    bot.send_message(chat_id, profile)
        .reply_markup(InlineKeyboardMarkup::new(rows))
        .await?;
    Ok(())
}

async fn show_settings_menu(
    bot: &Bot,
    user: &UserRecord,
    chat_id: ChatId,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let format = OutputFormat::parse(&user.output_format);
    let rows = vec![
        vec![
            InlineKeyboardButton::callback(
                marked("Reply as text", format == OutputFormat::Text),
                "format:text",
            ),
            InlineKeyboardButton::callback(
                marked("Reply as .txt file", format == OutputFormat::TxtFile),
                "format:txt",
            ),
        ],
        ["1024x1024", "1024x1792", "1792x1024"]
            .iter()
            .map(|r| {
                InlineKeyboardButton::callback(
                    marked(r, user.image_resolution == **r),
                    format!("res:{r}"),
                )
            })
            .collect(),
    ];
    bot.send_message(chat_id, "Settings:")
        .reply_markup(InlineKeyboardMarkup::new(rows))
        .await?;
    Ok(())
}

async fn show_image_menu(
    bot: &Bot,
    state: &Arc<AppState>,
    chat_id: ChatId,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let dalle_cost = billing::image_cost(&state.config, ImageService::Dalle3, "1024x1024")
        .unwrap_or_default();
    let yandex_cost = billing::image_cost(&state.config, ImageService::YandexArt, "")
        .unwrap_or_default();
    let rows = vec![vec![
        InlineKeyboardButton::callback(
            format!("DALL-E 3 ({dalle_cost} AGM)"),
            "img:dalle3",
        ),
        InlineKeyboardButton::callback(
            format!("YandexArt ({yandex_cost} AGM)"),
            "img:yandexart",
        ),
    ]];
    bot.send_message(chat_id, "Pick an image model:")
        .reply_markup(InlineKeyboardMarkup::new(rows))
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Character creation
// ---------------------------------------------------------------------------

async fn handle_new_character_name(
    bot: &Bot,
    state: &Arc<AppState>,
    chat_id: ChatId,
    text: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let name = text.trim();
    if name.is_empty() || name.chars().count() > 64 || name.starts_with('/') {
        bot.send_message(chat_id, "Please send a short plain-text name (max 64 chars).")
            .await?;
        return Ok(());
    }
    state.sessions.set(
        chat_id.0,
        ChatState::AwaitingCharacterPrompt {
            name: name.to_string(),
        },
    );
    bot.send_message(
        chat_id,
        format!("Now describe how {name} should behave (this becomes the system prompt)."),
    )
    .await?;
    Ok(())
}

async fn handle_new_character_prompt(
    bot: &Bot,
    state: &Arc<AppState>,
    user: &UserRecord,
    chat_id: ChatId,
    name: &str,
    text: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let prompt = text.trim().to_string();
    if prompt.is_empty() {
        bot.send_message(chat_id, "The description cannot be empty.")
            .await?;
        return Ok(());
    }
    let user_id = user.id;
    let name_owned = name.to_string();
    let created = call_blocking(state.db.clone(), move |db| {
        let character = db.create_character(user_id, &name_owned, &prompt)?;
        db.set_current_character(user_id, Some(&character.name))?;
        Ok(character)
    })
    .await;
    state.sessions.clear(chat_id.0);

    match created {
        Ok(character) => {
            bot.send_message(
                chat_id,
                format!("{} created and selected. Say hi!", character.name),
            )
            .await?;
        }
        Err(AgmaiError::Database(rusqlite::Error::SqliteFailure(e, _)))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            bot.send_message(chat_id, "You already have a character with that name.")
                .await?;
        }
        Err(e) => {
            error!("Character creation failed: {e}");
            bot.send_message(chat_id, "Could not create the character, try again later.")
                .await?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Callbacks
// ---------------------------------------------------------------------------

async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    state: Arc<AppState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let _ = bot.answer_callback_query(q.id.clone()).await;
    let Some(data) = q.data.as_deref() else {
        return Ok(());
    };
    let Some(message) = q.message.as_ref() else {
        return Ok(());
    };
    let chat_id = message.chat().id;

    let telegram_id = q.from.id.0 as i64;
    let user = call_blocking(state.db.clone(), move |db| {
        db.get_user_by_telegram_id(telegram_id)
    })
    .await?;
    let Some(user) = user else {
        return Ok(());
    };

    if let Some(picked) = data.strip_prefix("captcha:") {
        if let ChatState::AwaitingCaptcha { answer } = state.sessions.get(chat_id.0) {
            handle_captcha_answer(&bot, &state, &user, chat_id, picked, &answer).await?;
        }
    } else if let Some(name) = data.strip_prefix("persona:") {
        if state.personas.get(name).is_some() {
            let user_id = user.id;
            let name_owned = name.to_string();
            call_blocking(state.db.clone(), move |db| {
                db.set_current_character(user_id, Some(&name_owned))
            })
            .await?;
            bot.send_message(chat_id, format!("Now chatting with {name}."))
                .await?;
        }
    } else if let Some(raw_id) = data.strip_prefix("char:") {
        if let Ok(character_id) = raw_id.parse::<i64>() {
            show_character_detail(&bot, &state, &user, chat_id, character_id).await?;
        }
    } else if data == "char_new" {
        state.sessions.set(chat_id.0, ChatState::AwaitingCharacterName);
        bot.send_message(chat_id, "Send a name for the new character.")
            .await?;
    } else if let Some(raw_id) = data.strip_prefix("char_select:") {
        if let Ok(character_id) = raw_id.parse::<i64>() {
            select_character(&bot, &state, &user, chat_id, character_id).await?;
        }
    } else if let Some(raw_id) = data.strip_prefix("char_rename:") {
        if let Ok(character_id) = raw_id.parse::<i64>() {
            state
                .sessions
                .set(chat_id.0, ChatState::AwaitingEditName { character_id });
            bot.send_message(chat_id, "Send the new name.").await?;
        }
    } else if let Some(raw_id) = data.strip_prefix("char_prompt:") {
        if let Ok(character_id) = raw_id.parse::<i64>() {
            state
                .sessions
                .set(chat_id.0, ChatState::AwaitingEditPrompt { character_id });
            bot.send_message(chat_id, "Send the new behavior description.")
                .await?;
        }
    } else if let Some(raw_id) = data.strip_prefix("char_delete:") {
        if let Ok(character_id) = raw_id.parse::<i64>() {
            let user_id = user.id;
            let deleted = call_blocking(state.db.clone(), move |db| {
                db.delete_character(user_id, character_id)
            })
            .await?;
            let reply = if deleted {
                "Character and its history deleted."
            } else {
                "Character not found."
            };
            bot.send_message(chat_id, reply).await?;
        }
    } else if let Some(raw) = data.strip_prefix("provider:") {
        if let Some(provider) = ProviderId::parse(raw) {
            let (tier, _) = resolve_tier(state.db.clone(), &user).await?;
            if state.config.tier_allows(tier, provider) {
                let user_id = user.id;
                call_blocking(state.db.clone(), move |db| {
                    db.set_current_provider(user_id, provider.as_str())
                })
                .await?;
                bot.send_message(
                    chat_id,
                    format!("Switched to {}.", provider.display_name()),
                )
                .await?;
            } else {
                bot.send_message(
                    chat_id,
                    format!(
                        "{} is not available on the '{}' tier.",
                        provider.display_name(),
                        tier.as_str()
                    ),
                )
                .await?;
            }
        }
    } else if data == "topup" {
        bot.send_message(
            chat_id,
            "Card payments are not wired up yet. Ask an admin to credit your balance in the \
             meantime.",
        )
        .await?;
    } else if let Some(raw) = data.strip_prefix("format:") {
        let format = OutputFormat::parse(raw);
        let user_id = user.id;
        call_blocking(state.db.clone(), move |db| {
            db.set_output_format(user_id, format.as_str())
        })
        .await?;
        let reply = match format {
            OutputFormat::Text => "Replies will be sent as text.",
            OutputFormat::TxtFile => "Replies will be sent as .txt files.",
        };
        bot.send_message(chat_id, reply).await?;
    } else if let Some(resolution) = data.strip_prefix("res:") {
        if state.config.dalle_price_usd(resolution).is_some() {
            let user_id = user.id;
            let resolution_owned = resolution.to_string();
            call_blocking(state.db.clone(), move |db| {
                db.set_image_resolution(user_id, &resolution_owned)
            })
            .await?;
            bot.send_message(chat_id, format!("Image resolution set to {resolution}."))
                .await?;
        }
    } else if let Some(raw) = data.strip_prefix("img:") {
        let service = match raw {
            "dalle3" => Some(ImageService::Dalle3),
            "yandexart" => Some(ImageService::YandexArt),
            _ => None,
        };
        if let Some(service) = service {
            state
                .sessions
                .set(chat_id.0, ChatState::AwaitingImagePrompt { service });
            bot.send_message(
                chat_id,
                format!("Describe the image for {}.", service.display_name()),
            )
            .await?;
        }
    }
    Ok(())
}

async fn show_character_detail(
    bot: &Bot,
    state: &Arc<AppState>,
    user: &UserRecord,
    chat_id: ChatId,
    character_id: i64,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let user_id = user.id;
    let characters =
        call_blocking(state.db.clone(), move |db| db.list_characters(user_id)).await?;
    let Some(character) = characters.into_iter().find(|c| c.id == character_id) else {
        bot.send_message(chat_id, "Character not found.").await?;
        return Ok(());
    };

    let rows = vec![
        vec![InlineKeyboardButton::callback(
            "💬 Chat with them",
            format!("char_select:{character_id}"),
        )],
        vec![
            InlineKeyboardButton::callback("✏️ Rename", format!("char_rename:{character_id}")),
            InlineKeyboardButton::callback("📝 Edit prompt", format!("char_prompt:{character_id}")),
        ],
        vec![InlineKeyboardButton::callback(
            "🗑 Delete",
            format!("char_delete:{character_id}"),
        )],
    ];
    bot.send_message(
        chat_id,
        format!("{}\n\n{}", character.name, character.prompt),
    )
    .reply_markup(InlineKeyboardMarkup::new(rows))
    .await?;
    Ok(())
}

async fn select_character(
    bot: &Bot,
    state: &Arc<AppState>,
    user: &UserRecord,
    chat_id: ChatId,
    character_id: i64,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let user_id = user.id;
    let characters =
        call_blocking(state.db.clone(), move |db| db.list_characters(user_id)).await?;
    let Some(character) = characters.into_iter().find(|c| c.id == character_id) else {
        bot.send_message(chat_id, "Character not found.").await?;
        return Ok(());
    };
    let name = character.name.clone();
    call_blocking(state.db.clone(), move |db| {
        db.set_current_character(user_id, Some(&character.name))
    })
    .await?;
    bot.send_message(chat_id, format!("Now chatting with {name}."))
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Chat pipeline
// ---------------------------------------------------------------------------

fn current_persona_name(user: &UserRecord, state: &Arc<AppState>) -> String {
    user.current_character
        .clone()
        .unwrap_or_else(|| state.personas.default_persona().name.clone())
}

/// Resolve the system prompt: user-made characters shadow catalog personas of
/// the same name.
async fn resolve_system_prompt(
    state: &Arc<AppState>,
    user: &UserRecord,
    persona: &str,
) -> Result<String, AgmaiError> {
    let user_id = user.id;
    let persona_owned = persona.to_string();
    let character = call_blocking(state.db.clone(), move |db| {
        db.get_character(user_id, &persona_owned)
    })
    .await?;
    if let Some(character) = character {
        return Ok(character.prompt);
    }
    if let Some(persona) = state.personas.get(persona) {
        return Ok(persona.prompt.clone());
    }
    Ok(state.personas.default_persona().prompt.clone())
}

async fn process_ai_request(
    bot: &Bot,
    state: &Arc<AppState>,
    user: &UserRecord,
    chat_id: ChatId,
    text: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (tier, downgraded) = resolve_tier(state.db.clone(), user).await?;
    if downgraded {
        bot.send_message(
            chat_id,
            "Your subscription expired, you are back on the free tier.",
        )
        .await?;
    }
    let tier_config = state.config.tier_config(tier).clone();

    // Stored provider may no longer be allowed after a downgrade.
    let (provider_id, corrected) = effective_provider(&state.config, tier, &user.current_provider);
    if corrected {
        let user_id = user.id;
        call_blocking(state.db.clone(), move |db| {
            db.set_current_provider(user_id, provider_id.as_str())
        })
        .await?;
        let note = match ProviderId::parse(&user.current_provider) {
            Some(old) => format!(
                "{} is not available on your tier, switched to {}.",
                old.display_name(),
                provider_id.display_name()
            ),
            None => format!("Switched to {}.", provider_id.display_name()),
        };
        bot.send_message(chat_id, note).await?;
    }

    let user_id = user.id;
    let today = today_string();
    let daily_limit = tier_config.daily_limit;
    let allowed = call_blocking(state.db.clone(), move |db| {
        db.check_and_count_usage(user_id, daily_limit, &today)
    })
    .await?;
    if !allowed {
        bot.send_message(
            chat_id,
            "Daily request limit reached. It resets at midnight UTC, or upgrade your tier.",
        )
        .await?;
        return Ok(());
    }

    let persona = current_persona_name(user, state);
    let system_prompt = resolve_system_prompt(state, user, &persona).await?;

    let mut turns =
        context::assemble_context(state.db.clone(), user.id, &persona, tier_config.active_buffer)
            .await?;
    turns.push(ChatTurn {
        role: ChatRole::User,
        content: text.to_string(),
    });

    let _ = bot.send_chat_action(chat_id, ChatAction::Typing).await;

    let provider = create_chat_provider(&state.config, provider_id);
    let outcome = match tokio::time::timeout(
        std::time::Duration::from_secs(state.config.request_timeout_secs),
        provider.send_chat(&system_prompt, &turns),
    )
    .await
    {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            error!("Provider {} failed: {e}", provider_id.as_str());
            bot.send_message(chat_id, format!("⚠️ The model could not answer: {e}"))
                .await?;
            return Ok(());
        }
        Err(_) => {
            warn!("Provider {} timed out", provider_id.as_str());
            bot.send_message(chat_id, "⚠️ The model took too long, please try again.")
                .await?;
            return Ok(());
        }
    };

    context::record_exchange(
        state.db.clone(),
        user.id,
        &persona,
        text,
        &outcome.text,
        outcome.total_tokens,
    )
    .await?;

    let summarizer = create_chat_provider(&state.config, state.config.summarizer_provider);
    if let Err(e) = context::maybe_summarize(
        state.db.clone(),
        summarizer.as_ref(),
        user.id,
        &persona,
        tier_config.active_buffer,
        tier_config.summarize_trigger_tokens,
    )
    .await
    {
        warn!("Summarization pass failed: {e}");
    }

    send_reply(
        bot,
        chat_id,
        &outcome.text,
        OutputFormat::parse(&user.output_format),
    )
    .await?;
    Ok(())
}

async fn send_reply(
    bot: &Bot,
    chat_id: ChatId,
    text: &str,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    match format {
        OutputFormat::Text => {
            for chunk in split_text(text, TELEGRAM_MESSAGE_LIMIT) {
                bot.send_message(chat_id, chunk).await?;
            }
        }
        OutputFormat::TxtFile => {
            let file = InputFile::memory(text.as_bytes().to_vec()).file_name("reply.txt");
            bot.send_document(chat_id, file).await?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Image generation
// ---------------------------------------------------------------------------

async fn handle_image_request(
    bot: &Bot,
    state: &Arc<AppState>,
    user: &UserRecord,
    chat_id: ChatId,
    service: ImageService,
    prompt: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if prompt.is_empty() {
        bot.send_message(chat_id, "The image prompt cannot be empty.")
            .await?;
        return Ok(());
    }
    if image_prompt_too_long(&state.config, service, prompt) {
        bot.send_message(
            chat_id,
            format!(
                "The prompt is too long for {}: {} chars, the limit is {}.",
                service.display_name(),
                prompt.chars().count(),
                state.config.yandexart_prompt_limit
            ),
        )
        .await?;
        return Ok(());
    }
    let resolution = match service {
        ImageService::Dalle3 => user.image_resolution.clone(),
        ImageService::YandexArt => "1024x1024".to_string(),
    };

    // Pay first; refund if the vendor fails.
    let charge = match billing::charge_image_generation(
        state.db.clone(),
        &state.config,
        user.id,
        service,
        &resolution,
    )
    .await
    {
        Ok(charge) => charge,
        Err(AgmaiError::InsufficientBalance {
            required,
            available,
        }) => {
            bot.send_message(
                chat_id,
                format!("Not enough AGMcoin: this costs {required}, you have {available}."),
            )
            .await?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let _ = bot.send_chat_action(chat_id, ChatAction::UploadPhoto).await;

    let generated = match service {
        ImageService::Dalle3 => {
            DalleClient::new(&state.config)
                .generate(prompt, &resolution)
                .await
        }
        ImageService::YandexArt => YandexArtClient::new(&state.config).generate(prompt).await,
    };

    match generated {
        Ok(GeneratedImage::Url(url)) => {
            bot.send_photo(chat_id, InputFile::url(url.parse()?)).await?;
        }
        Ok(GeneratedImage::Bytes(bytes)) => {
            bot.send_photo(chat_id, InputFile::memory(bytes).file_name("image.png"))
                .await?;
        }
        Err(e) => {
            error!("Image generation failed: {e}");
            if let Err(refund_err) =
                billing::refund_image_generation(state.db.clone(), user.id, &charge).await
            {
                error!("Refund failed for user {}: {refund_err}", user.id);
            }
            bot.send_message(
                chat_id,
                format!("⚠️ Image generation failed, the charge was refunded: {e}"),
            )
            .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let mut config: Config = serde_yaml::from_str("telegram_bot_token: \"t\"\n").unwrap();
        config.post_deserialize().unwrap();
        config
    }

    fn test_db() -> (Arc<Database>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().to_str().unwrap()).unwrap();
        (Arc::new(db), dir)
    }

    #[test]
    fn test_only_start_is_verification_exempt() {
        assert!(verification_exempt("/start"));
        assert!(verification_exempt("/start ref_5"));
        assert!(!verification_exempt("/reset"));
        assert!(!verification_exempt("/setsub 1 pro"));
        assert!(!verification_exempt("/addbalance 1 10"));
        assert!(!verification_exempt("hello"));
    }

    #[test]
    fn test_effective_provider_auto_corrects() {
        let config = test_config();

        // allowed on the tier: kept as-is
        let (provider, corrected) =
            effective_provider(&config, Tier::Free, "gpt_3_5_turbo");
        assert_eq!(provider, ProviderId::Gpt35Turbo);
        assert!(!corrected);

        // paid-tier provider on the free tier: corrected to the tier default
        let (provider, corrected) = effective_provider(&config, Tier::Free, "gpt_4_omni");
        assert_eq!(provider, ProviderId::GeminiStandard);
        assert!(corrected);

        // garbage column value: corrected too
        let (provider, corrected) = effective_provider(&config, Tier::Pro, "gpt_9");
        assert_eq!(provider, ProviderId::GeminiStandard);
        assert!(corrected);
    }

    #[tokio::test]
    async fn test_resolve_tier_downgrades_lapsed_subscription() {
        let (db, _dir) = test_db();
        let user = db.add_or_update_user(1, "Lapsed", None).unwrap();
        let past = (chrono::Utc::now() - chrono::Duration::days(1)).to_rfc3339();
        db.set_subscription(user.id, "pro", Some(&past)).unwrap();
        let user = db.get_user(user.id).unwrap().unwrap();

        let (tier, downgraded) = resolve_tier(db.clone(), &user).await.unwrap();
        assert_eq!(tier, Tier::Free);
        assert!(downgraded);

        let reloaded = db.get_user(user.id).unwrap().unwrap();
        assert_eq!(reloaded.subscription_tier, "free");
        assert!(reloaded.subscription_expiry.is_none());
    }

    #[tokio::test]
    async fn test_resolve_tier_keeps_active_subscription() {
        let (db, _dir) = test_db();
        let user = db.add_or_update_user(2, "Active", None).unwrap();
        let future = (chrono::Utc::now() + chrono::Duration::days(7)).to_rfc3339();
        db.set_subscription(user.id, "pro", Some(&future)).unwrap();
        let user = db.get_user(user.id).unwrap().unwrap();

        let (tier, downgraded) = resolve_tier(db.clone(), &user).await.unwrap();
        assert_eq!(tier, Tier::Pro);
        assert!(!downgraded);
        assert_eq!(
            db.get_user(user.id).unwrap().unwrap().subscription_tier,
            "pro"
        );
    }

    #[test]
    fn test_image_prompt_length_gate() {
        let config = test_config();
        let long = "x".repeat(501);
        assert!(image_prompt_too_long(&config, ImageService::YandexArt, &long));
        assert!(!image_prompt_too_long(
            &config,
            ImageService::YandexArt,
            "a fox"
        ));
        // DALL-E has no local cap
        assert!(!image_prompt_too_long(&config, ImageService::Dalle3, &long));
    }

    #[test]
    fn test_captcha_answer_matches_question() {
        for _ in 0..20 {
            let (question, answer, options) = make_captcha();
            let digits: Vec<u64> = question
                .split(|c: char| !c.is_ascii_digit())
                .filter(|s| !s.is_empty())
                .map(|s| s.parse().unwrap())
                .collect();
            assert_eq!(digits.len(), 2);
            assert_eq!(digits[0] + digits[1], answer);
            assert!((1..=10).contains(&digits[0]));
            assert!((1..=10).contains(&digits[1]));
            assert_eq!(options.len(), 4);
            assert!(options.contains(&answer));
            let mut deduped = options.clone();
            deduped.sort_unstable();
            deduped.dedup();
            assert_eq!(deduped.len(), 4);
        }
    }

    #[test]
    fn test_parse_start_payload() {
        assert_eq!(parse_start_payload("/start ref_42"), Some(42));
        assert_eq!(parse_start_payload("/start"), None);
        assert_eq!(parse_start_payload("/start hello"), None);
        assert_eq!(parse_start_payload("/start ref_abc"), None);
        assert_eq!(parse_start_payload("hello"), None);
    }

    #[test]
    fn test_parse_setsub() {
        assert_eq!(
            parse_setsub("/setsub 123 pro 7"),
            Some((123, Tier::Pro, 7))
        );
        assert_eq!(
            parse_setsub("/setsub 123 lite"),
            Some((123, Tier::Lite, 30))
        );
        assert_eq!(parse_setsub("/setsub 123 gold"), None);
        assert_eq!(parse_setsub("/setsub abc pro"), None);
        assert_eq!(parse_setsub("/setsub 123 pro -1"), None);
    }

    #[test]
    fn test_parse_addbalance() {
        assert_eq!(parse_addbalance("/addbalance 123 50"), Some((123, 50)));
        assert_eq!(parse_addbalance("/addbalance 123"), None);
        assert_eq!(parse_addbalance("/addbalance 123 0"), None);
        assert_eq!(parse_addbalance("/addbalance 123 -5"), None);
        assert_eq!(parse_addbalance("/addbalance 123 50 extra"), None);
        assert_eq!(parse_addbalance("/setsub 123 50"), None);
    }

    #[test]
    fn test_marked_adds_checkmark() {
        assert_eq!(marked("Gemini", true), "✅ Gemini");
        assert_eq!(marked("Gemini", false), "Gemini");
    }
}
