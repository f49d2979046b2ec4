//! AGMcoin balance ledger. Every balance change goes through one SQLite
//! transaction that updates `users.balance` and appends the matching
//! `transactions` row, so the ledger can never drift from the balance column.

use std::sync::Arc;

use rusqlite::{params, Transaction};

use agmai_core::error::AgmaiError;
use agmai_core::types::TxKind;

use crate::db::{call_blocking, Database, TransactionRecord, UserRecord};

fn apply_delta(
    tx: &Transaction<'_>,
    user_id: i64,
    amount: i64,
    kind: TxKind,
    description: &str,
    external_id: Option<&str>,
) -> Result<TransactionRecord, AgmaiError> {
    let balance_before: i64 = tx.query_row(
        "SELECT balance FROM users WHERE id = ?1",
        params![user_id],
        |row| row.get(0),
    )?;
    let balance_after = balance_before + amount;
    if balance_after < 0 {
        return Err(AgmaiError::InsufficientBalance {
            required: -amount,
            available: balance_before,
        });
    }
    tx.execute(
        "UPDATE users SET balance = ?2 WHERE id = ?1",
        params![user_id, balance_after],
    )?;
    let now = chrono::Utc::now().to_rfc3339();
    tx.execute(
        "INSERT INTO transactions (user_id, amount, kind, description, external_id, balance_before, balance_after, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            user_id,
            amount,
            kind.as_str(),
            description,
            external_id,
            balance_before,
            balance_after,
            now
        ],
    )?;
    Ok(TransactionRecord {
        id: tx.last_insert_rowid(),
        user_id,
        amount,
        kind: kind.as_str().to_string(),
        description: description.to_string(),
        external_id: external_id.map(str::to_string),
        balance_before,
        balance_after,
        created_at: now,
    })
}

impl Database {
    /// Adjust a balance and record the ledger entry atomically. Debits that
    /// would take the balance below zero fail without writing anything.
    pub fn update_balance(
        &self,
        user_id: i64,
        amount: i64,
        kind: TxKind,
        description: &str,
        external_id: Option<&str>,
    ) -> Result<TransactionRecord, AgmaiError> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;
        let record = apply_delta(&tx, user_id, amount, kind, description, external_id)?;
        tx.commit()?;
        Ok(record)
    }

    /// Credit a top-up and, when the user was referred, the one-level
    /// commission for the referrer in the same transaction. The commission is
    /// floor(amount * percentage / 100); a zero commission writes no entry.
    pub fn apply_topup(
        &self,
        user_id: i64,
        amount: i64,
        external_id: Option<&str>,
        referral_percentage: i64,
    ) -> Result<(TransactionRecord, Option<TransactionRecord>), AgmaiError> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;

        let topup = apply_delta(
            &tx,
            user_id,
            amount,
            TxKind::Topup,
            "Balance top-up",
            external_id,
        )?;

        let referrer_id: Option<i64> = tx.query_row(
            "SELECT referrer_id FROM users WHERE id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;

        let mut commission = None;
        if let Some(referrer_id) = referrer_id {
            let cut = amount * referral_percentage / 100;
            if cut > 0 {
                commission = Some(apply_delta(
                    &tx,
                    referrer_id,
                    cut,
                    TxKind::ReferralCommission,
                    &format!("Referral commission from user {user_id}"),
                    None,
                )?);
            }
        }

        tx.commit()?;
        Ok((topup, commission))
    }

    pub fn get_referrals(&self, user_id: i64) -> Result<Vec<UserRecord>, AgmaiError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, telegram_id, full_name, username, current_character,
                    current_provider, daily_requests_count, last_request_date,
                    subscription_tier, subscription_expiry, is_verified,
                    output_format, balance, referrer_id, image_resolution, created_at
             FROM users WHERE referrer_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(UserRecord {
                id: row.get(0)?,
                telegram_id: row.get(1)?,
                full_name: row.get(2)?,
                username: row.get(3)?,
                current_character: row.get(4)?,
                current_provider: row.get(5)?,
                daily_requests_count: row.get(6)?,
                last_request_date: row.get(7)?,
                subscription_tier: row.get(8)?,
                subscription_expiry: row.get(9)?,
                is_verified: row.get::<_, i64>(10)? != 0,
                output_format: row.get(11)?,
                balance: row.get(12)?,
                referrer_id: row.get(13)?,
                image_resolution: row.get(14)?,
                created_at: row.get(15)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn get_referral_earnings(&self, user_id: i64) -> Result<i64, AgmaiError> {
        let conn = self.lock_conn();
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM transactions
             WHERE user_id = ?1 AND kind = ?2",
            params![user_id, TxKind::ReferralCommission.as_str()],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    pub fn recent_transactions(
        &self,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<TransactionRecord>, AgmaiError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, amount, kind, description, external_id,
                    balance_before, balance_after, created_at
             FROM transactions WHERE user_id = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user_id, limit], |row| {
            Ok(TransactionRecord {
                id: row.get(0)?,
                user_id: row.get(1)?,
                amount: row.get(2)?,
                kind: row.get(3)?,
                description: row.get(4)?,
                external_id: row.get(5)?,
                balance_before: row.get(6)?,
                balance_after: row.get(7)?,
                created_at: row.get(8)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn fmt_amount(v: i64) -> String {
    if v > 0 {
        format!("+{v}")
    } else {
        v.to_string()
    }
}

/// Human-readable wallet summary for the profile screen.
pub async fn build_wallet_report(db: Arc<Database>, user_id: i64) -> Result<String, AgmaiError> {
    let user = call_blocking(db.clone(), move |db| db.get_user(user_id))
        .await?
        .ok_or_else(|| AgmaiError::Internal(format!("unknown user {user_id}")))?;
    let referrals = call_blocking(db.clone(), move |db| db.get_referrals(user_id)).await?;
    let earnings = call_blocking(db.clone(), move |db| db.get_referral_earnings(user_id)).await?;
    let recent = call_blocking(db, move |db| db.recent_transactions(user_id, 10)).await?;

    let mut lines = vec![
        "💰 Wallet".to_string(),
        "".to_string(),
        format!("  Balance: {} AGMcoin", user.balance),
        format!(
            "  Referrals: {} invited, {} AGMcoin earned",
            referrals.len(),
            earnings
        ),
        "".to_string(),
        "  Recent transactions".to_string(),
    ];
    if recent.is_empty() {
        lines.push("    - (no transactions yet)".to_string());
    } else {
        for (idx, t) in recent.iter().enumerate() {
            lines.push(format!(
                "    {}. {} {} — {}",
                idx + 1,
                fmt_amount(t.amount),
                t.kind,
                t.description
            ));
        }
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (Arc<Database>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().to_str().unwrap()).unwrap();
        (Arc::new(db), dir)
    }

    #[test]
    fn test_update_balance_writes_ledger_row() {
        let (db, _dir) = test_db();
        let user = db.add_or_update_user(1, "Wallet", None).unwrap();

        let credit = db
            .update_balance(user.id, 100, TxKind::Topup, "Balance top-up", None)
            .unwrap();
        assert_eq!(credit.balance_before, 0);
        assert_eq!(credit.balance_after, 100);

        let debit = db
            .update_balance(user.id, -40, TxKind::ImageGenCost, "DALL-E 3 1024x1024", None)
            .unwrap();
        assert_eq!(debit.balance_after, 60);

        let reloaded = db.get_user(user.id).unwrap().unwrap();
        assert_eq!(reloaded.balance, 60);

        // running sum in the ledger matches the balance column
        let entries = db.recent_transactions(user.id, 10).unwrap();
        let sum: i64 = entries.iter().map(|t| t.amount).sum();
        assert_eq!(sum, reloaded.balance);
    }

    #[test]
    fn test_overdraft_rejected_without_side_effects() {
        let (db, _dir) = test_db();
        let user = db.add_or_update_user(2, "Poor", None).unwrap();
        db.update_balance(user.id, 10, TxKind::Topup, "Balance top-up", None)
            .unwrap();

        let err = db
            .update_balance(user.id, -40, TxKind::ImageGenCost, "too expensive", None)
            .unwrap_err();
        assert!(matches!(
            err,
            AgmaiError::InsufficientBalance {
                required: 40,
                available: 10
            }
        ));

        let reloaded = db.get_user(user.id).unwrap().unwrap();
        assert_eq!(reloaded.balance, 10);
        assert_eq!(db.recent_transactions(user.id, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_topup_pays_one_level_commission() {
        let (db, _dir) = test_db();
        let grandparent = db.add_or_update_user(10, "Grandparent", None).unwrap();
        let parent = db.add_or_update_user(11, "Parent", None).unwrap();
        let child = db.add_or_update_user(12, "Child", None).unwrap();
        db.set_referrer(parent.id, grandparent.id).unwrap();
        db.set_referrer(child.id, parent.id).unwrap();

        let (topup, commission) = db.apply_topup(child.id, 200, Some("pay_1"), 10).unwrap();
        assert_eq!(topup.amount, 200);
        let commission = commission.unwrap();
        assert_eq!(commission.user_id, parent.id);
        assert_eq!(commission.amount, 20);

        // exactly one level: the grandparent gets nothing
        assert_eq!(db.get_user(grandparent.id).unwrap().unwrap().balance, 0);
        assert_eq!(db.get_user(parent.id).unwrap().unwrap().balance, 20);
        assert_eq!(db.get_user(child.id).unwrap().unwrap().balance, 200);
        assert_eq!(db.get_referral_earnings(parent.id).unwrap(), 20);
    }

    #[test]
    fn test_topup_commission_floors_and_skips_zero() {
        let (db, _dir) = test_db();
        let parent = db.add_or_update_user(20, "Parent", None).unwrap();
        let child = db.add_or_update_user(21, "Child", None).unwrap();
        db.set_referrer(child.id, parent.id).unwrap();

        // floor(15 * 10 / 100) = 1
        let (_, commission) = db.apply_topup(child.id, 15, None, 10).unwrap();
        assert_eq!(commission.unwrap().amount, 1);

        // floor(9 * 10 / 100) = 0, no ledger entry written
        let (_, commission) = db.apply_topup(child.id, 9, None, 10).unwrap();
        assert!(commission.is_none());
        assert_eq!(db.recent_transactions(parent.id, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_topup_without_referrer_has_no_commission() {
        let (db, _dir) = test_db();
        let user = db.add_or_update_user(30, "Solo", None).unwrap();
        let (topup, commission) = db.apply_topup(user.id, 50, None, 10).unwrap();
        assert_eq!(topup.amount, 50);
        assert!(commission.is_none());
    }

    #[tokio::test]
    async fn test_wallet_report_lists_recent_entries() {
        let (db, _dir) = test_db();
        let user = db.add_or_update_user(40, "Report", None).unwrap();
        db.update_balance(user.id, 100, TxKind::Topup, "Balance top-up", None)
            .unwrap();
        db.update_balance(user.id, -40, TxKind::ImageGenCost, "DALL-E 3", None)
            .unwrap();

        let report = build_wallet_report(db, user.id).await.unwrap();
        assert!(report.contains("Balance: 60 AGMcoin"));
        assert!(report.contains("+100 topup"));
        assert!(report.contains("-40 image_gen_cost"));
    }

    #[test]
    fn test_referral_list() {
        let (db, _dir) = test_db();
        let parent = db.add_or_update_user(50, "Parent", None).unwrap();
        for i in 0..3 {
            let child = db
                .add_or_update_user(51 + i, &format!("Child {i}"), None)
                .unwrap();
            db.set_referrer(child.id, parent.id).unwrap();
        }
        assert_eq!(db.get_referrals(parent.id).unwrap().len(), 3);
    }
}
