use std::sync::Arc;

use agmai_core::error::AgmaiError;
use agmai_core::types::{ImageService, TxKind};

use agmai_storage::db::{call_blocking, Database, TransactionRecord};

use crate::config::Config;

/// Convert a vendor USD price to AGMcoin, truncating fractions.
pub fn usd_to_agm(config: &Config, usd: f64) -> i64 {
    (usd * config.usd_to_agm_rate) as i64
}

pub fn image_cost(
    config: &Config,
    service: ImageService,
    resolution: &str,
) -> Result<i64, AgmaiError> {
    let usd = match service {
        ImageService::Dalle3 => config.dalle_price_usd(resolution).ok_or_else(|| {
            AgmaiError::Config(format!("No DALL-E price for resolution {resolution}"))
        })?,
        ImageService::YandexArt => config.yandexart_price_usd,
    };
    Ok(usd_to_agm(config, usd))
}

/// Deduct the image price up front. The generation call only happens after
/// this succeeds; a vendor failure is paid back via [`refund_image_generation`].
pub async fn charge_image_generation(
    db: Arc<Database>,
    config: &Config,
    user_id: i64,
    service: ImageService,
    resolution: &str,
) -> Result<TransactionRecord, AgmaiError> {
    let cost = image_cost(config, service, resolution)?;
    let description = format!("{} {}", service.display_name(), resolution);
    call_blocking(db, move |db| {
        db.update_balance(user_id, -cost, TxKind::ImageGenCost, &description, None)
    })
    .await
}

pub async fn refund_image_generation(
    db: Arc<Database>,
    user_id: i64,
    charge: &TransactionRecord,
) -> Result<TransactionRecord, AgmaiError> {
    let amount = -charge.amount;
    let description = format!("Refund: {}", charge.description);
    call_blocking(db, move |db| {
        db.update_balance(user_id, amount, TxKind::ImageGenCost, &description, None)
    })
    .await
}

/// Credit a top-up and pay the one-level referral commission.
pub async fn apply_topup(
    db: Arc<Database>,
    config: &Config,
    user_id: i64,
    amount: i64,
    external_id: Option<String>,
) -> Result<(TransactionRecord, Option<TransactionRecord>), AgmaiError> {
    let percentage = config.referral_percentage;
    call_blocking(db, move |db| {
        db.apply_topup(user_id, amount, external_id.as_deref(), percentage)
    })
    .await
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
    fn test_image_cost_conversion() {
        let config = test_config();
        // 0.04 USD * 100 AGM/USD
        assert_eq!(
            image_cost(&config, ImageService::Dalle3, "1024x1024").unwrap(),
            4
        );
        assert_eq!(
            image_cost(&config, ImageService::Dalle3, "1792x1024").unwrap(),
            8
        );
        assert_eq!(
            image_cost(&config, ImageService::YandexArt, "ignored").unwrap(),
            2
        );
        assert!(image_cost(&config, ImageService::Dalle3, "640x480").is_err());
    }

    #[tokio::test]
    async fn test_charge_then_refund_restores_balance() {
        let config = test_config();
        let (db, _dir) = test_db();
        let user = db.add_or_update_user(1, "Artist", None).unwrap();
        db.update_balance(user.id, 10, TxKind::Topup, "Balance top-up", None)
            .unwrap();

        let charge = charge_image_generation(
            db.clone(),
            &config,
            user.id,
            ImageService::Dalle3,
            "1024x1024",
        )
        .await
        .unwrap();
        assert_eq!(charge.amount, -4);
        assert_eq!(db.get_user(user.id).unwrap().unwrap().balance, 6);

        refund_image_generation(db.clone(), user.id, &charge)
            .await
            .unwrap();
        assert_eq!(db.get_user(user.id).unwrap().unwrap().balance, 10);
    }

    #[tokio::test]
    async fn test_apply_topup_uses_configured_percentage() {
        let config = test_config();
        let (db, _dir) = test_db();
        let parent = db.add_or_update_user(3, "Parent", None).unwrap();
        let child = db.add_or_update_user(4, "Child", None).unwrap();
        db.set_referrer(child.id, parent.id).unwrap();

        // default referral_percentage is 10
        let (topup, commission) = apply_topup(db.clone(), &config, child.id, 200, None)
            .await
            .unwrap();
        assert_eq!(topup.amount, 200);
        assert_eq!(commission.unwrap().amount, 20);
        assert_eq!(db.get_user(parent.id).unwrap().unwrap().balance, 20);
    }

    #[tokio::test]
    async fn test_charge_rejected_when_broke() {
        let config = test_config();
        let (db, _dir) = test_db();
        let user = db.add_or_update_user(2, "Broke", None).unwrap();

        let err = charge_image_generation(
            db.clone(),
            &config,
            user.id,
            ImageService::Dalle3,
            "1024x1024",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AgmaiError::InsufficientBalance { .. }));
        assert!(db.recent_transactions(user.id, 10).unwrap().is_empty());
    }
}
