use rusqlite::OptionalExtension;
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use agmai_core::error::AgmaiError;
use agmai_core::types::ChatRole;

pub struct Database {
    conn: Mutex<Connection>,
}

pub async fn call_blocking<T, F>(db: std::sync::Arc<Database>, f: F) -> Result<T, AgmaiError>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> Result<T, AgmaiError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(db.as_ref()))
        .await
        .map_err(|e| AgmaiError::Internal(format!("DB task join error: {e}")))?
}

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: i64,
    pub telegram_id: i64,
    pub full_name: String,
    pub username: Option<String>,
    pub current_character: Option<String>,
    pub current_provider: String,
    pub daily_requests_count: i64,
    pub last_request_date: Option<String>,
    pub subscription_tier: String,
    pub subscription_expiry: Option<String>,
    pub is_verified: bool,
    pub output_format: String,
    pub balance: i64,
    pub referrer_id: Option<i64>,
    pub image_resolution: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct CharacterRecord {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub prompt: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct HistoryRow {
    pub id: i64,
    pub user_id: i64,
    pub character_name: String,
    pub role: String,
    pub content: String,
    pub token_count: i64,
    pub is_summary: bool,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct TransactionRecord {
    pub id: i64,
    pub user_id: i64,
    pub amount: i64,
    pub kind: String,
    pub description: String,
    pub external_id: Option<String>,
    pub balance_before: i64,
    pub balance_after: i64,
    pub created_at: String,
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserRecord> {
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
}

const USER_COLUMNS: &str = "id, telegram_id, full_name, username, current_character, \
     current_provider, daily_requests_count, last_request_date, subscription_tier, \
     subscription_expiry, is_verified, output_format, balance, referrer_id, \
     image_resolution, created_at";

fn history_from_row(row: &Row<'_>) -> rusqlite::Result<HistoryRow> {
    Ok(HistoryRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        character_name: row.get(2)?,
        role: row.get(3)?,
        content: row.get(4)?,
        token_count: row.get(5)?,
        is_summary: row.get::<_, i64>(6)? != 0,
        created_at: row.get(7)?,
    })
}

const HISTORY_COLUMNS: &str =
    "id, user_id, character_name, role, content, token_count, is_summary, created_at";

impl Database {
    pub(crate) fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn new(data_dir: &str) -> Result<Self, AgmaiError> {
        let db_path = Path::new(data_dir).join("agmai.db");
        std::fs::create_dir_all(data_dir)?;

        let conn = Connection::open(db_path)?;
        Self::init_schema(&conn)?;

        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), AgmaiError> {
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                telegram_id INTEGER NOT NULL UNIQUE,
                full_name TEXT NOT NULL,
                username TEXT,
                current_character TEXT,
                current_provider TEXT NOT NULL DEFAULT 'gemini_standard',
                daily_requests_count INTEGER NOT NULL DEFAULT 0,
                last_request_date TEXT,
                subscription_tier TEXT NOT NULL DEFAULT 'free',
                subscription_expiry TEXT,
                is_verified INTEGER NOT NULL DEFAULT 0,
                output_format TEXT NOT NULL DEFAULT 'text',
                balance INTEGER NOT NULL DEFAULT 0,
                referrer_id INTEGER,
                image_resolution TEXT NOT NULL DEFAULT '1024x1024',
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_users_referrer ON users(referrer_id);

            CREATE TABLE IF NOT EXISTS characters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                prompt TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(user_id, name)
            );

            CREATE TABLE IF NOT EXISTS chat_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                character_name TEXT NOT NULL,
                role TEXT NOT NULL CHECK(role IN ('user', 'model')),
                content TEXT NOT NULL,
                token_count INTEGER NOT NULL DEFAULT 0,
                is_summary INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_chat_history_user_character
                ON chat_history(user_id, character_name, id);

            CREATE TABLE IF NOT EXISTS transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                amount INTEGER NOT NULL,
                kind TEXT NOT NULL,
                description TEXT NOT NULL,
                external_id TEXT,
                balance_before INTEGER NOT NULL,
                balance_after INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_transactions_user_created
                ON transactions(user_id, created_at);",
        )?;
        Ok(())
    }

    /// Insert the user on first contact, otherwise refresh name and username.
    /// Returns the stored record either way.
    pub fn add_or_update_user(
        &self,
        telegram_id: i64,
        full_name: &str,
        username: Option<&str>,
    ) -> Result<UserRecord, AgmaiError> {
        let conn = self.lock_conn();
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO users (telegram_id, full_name, username, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(telegram_id) DO UPDATE SET
                full_name = ?2,
                username = COALESCE(?3, username)",
            params![telegram_id, full_name, username, now],
        )?;
        let user = conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE telegram_id = ?1"),
            params![telegram_id],
            user_from_row,
        )?;
        Ok(user)
    }

    pub fn get_user(&self, user_id: i64) -> Result<Option<UserRecord>, AgmaiError> {
        let conn = self.lock_conn();
        let user = conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![user_id],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    pub fn get_user_by_telegram_id(
        &self,
        telegram_id: i64,
    ) -> Result<Option<UserRecord>, AgmaiError> {
        let conn = self.lock_conn();
        let user = conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE telegram_id = ?1"),
                params![telegram_id],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    /// Attach a referrer once. Ignored if the user already has one, if the
    /// referrer does not exist, or if they would refer themselves.
    pub fn set_referrer(&self, user_id: i64, referrer_id: i64) -> Result<bool, AgmaiError> {
        if user_id == referrer_id {
            return Ok(false);
        }
        let conn = self.lock_conn();
        let referrer_exists = conn
            .query_row(
                "SELECT 1 FROM users WHERE id = ?1",
                params![referrer_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !referrer_exists {
            return Ok(false);
        }
        let changed = conn.execute(
            "UPDATE users SET referrer_id = ?2 WHERE id = ?1 AND referrer_id IS NULL",
            params![user_id, referrer_id],
        )?;
        Ok(changed > 0)
    }

    pub fn verify_user(&self, user_id: i64) -> Result<(), AgmaiError> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE users SET is_verified = 1 WHERE id = ?1",
            params![user_id],
        )?;
        Ok(())
    }

    pub fn set_current_character(
        &self,
        user_id: i64,
        character_name: Option<&str>,
    ) -> Result<(), AgmaiError> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE users SET current_character = ?2 WHERE id = ?1",
            params![user_id, character_name],
        )?;
        Ok(())
    }

    pub fn set_current_provider(&self, user_id: i64, provider: &str) -> Result<(), AgmaiError> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE users SET current_provider = ?2 WHERE id = ?1",
            params![user_id, provider],
        )?;
        Ok(())
    }

    pub fn set_output_format(&self, user_id: i64, format: &str) -> Result<(), AgmaiError> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE users SET output_format = ?2 WHERE id = ?1",
            params![user_id, format],
        )?;
        Ok(())
    }

    pub fn set_image_resolution(&self, user_id: i64, resolution: &str) -> Result<(), AgmaiError> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE users SET image_resolution = ?2 WHERE id = ?1",
            params![user_id, resolution],
        )?;
        Ok(())
    }

    pub fn set_subscription(
        &self,
        user_id: i64,
        tier: &str,
        expiry: Option<&str>,
    ) -> Result<(), AgmaiError> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE users SET subscription_tier = ?2, subscription_expiry = ?3 WHERE id = ?1",
            params![user_id, tier, expiry],
        )?;
        Ok(())
    }

    pub fn downgrade_to_free(&self, user_id: i64) -> Result<(), AgmaiError> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE users SET subscription_tier = 'free', subscription_expiry = NULL
             WHERE id = ?1",
            params![user_id],
        )?;
        Ok(())
    }

    /// Count one request against the daily quota. The counter resets to 1 on
    /// the first request of a new day. Returns false when the limit is already
    /// exhausted; a limit of None means unmetered.
    pub fn check_and_count_usage(
        &self,
        user_id: i64,
        daily_limit: Option<i64>,
        today: &str,
    ) -> Result<bool, AgmaiError> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;
        let (count, last_date): (i64, Option<String>) = tx.query_row(
            "SELECT daily_requests_count, last_request_date FROM users WHERE id = ?1",
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let fresh_day = last_date.as_deref() != Some(today);
        if !fresh_day {
            if let Some(limit) = daily_limit {
                if count >= limit {
                    return Ok(false);
                }
            }
        }
        let new_count = if fresh_day { 1 } else { count + 1 };
        tx.execute(
            "UPDATE users SET daily_requests_count = ?2, last_request_date = ?3 WHERE id = ?1",
            params![user_id, new_count, today],
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub fn create_character(
        &self,
        user_id: i64,
        name: &str,
        prompt: &str,
    ) -> Result<CharacterRecord, AgmaiError> {
        let conn = self.lock_conn();
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO characters (user_id, name, prompt, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![user_id, name, prompt, now],
        )?;
        Ok(CharacterRecord {
            id: conn.last_insert_rowid(),
            user_id,
            name: name.to_string(),
            prompt: prompt.to_string(),
            created_at: now,
        })
    }

    pub fn list_characters(&self, user_id: i64) -> Result<Vec<CharacterRecord>, AgmaiError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, name, prompt, created_at FROM characters
             WHERE user_id = ?1 ORDER BY name",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(CharacterRecord {
                id: row.get(0)?,
                user_id: row.get(1)?,
                name: row.get(2)?,
                prompt: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn get_character(
        &self,
        user_id: i64,
        name: &str,
    ) -> Result<Option<CharacterRecord>, AgmaiError> {
        let conn = self.lock_conn();
        let character = conn
            .query_row(
                "SELECT id, user_id, name, prompt, created_at FROM characters
                 WHERE user_id = ?1 AND name = ?2",
                params![user_id, name],
                |row| {
                    Ok(CharacterRecord {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        name: row.get(2)?,
                        prompt: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(character)
    }

    /// Rename a character, carrying its history and any active selection over
    /// to the new name in the same transaction.
    pub fn rename_character(
        &self,
        user_id: i64,
        character_id: i64,
        new_name: &str,
    ) -> Result<bool, AgmaiError> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;
        let old_name: Option<String> = tx
            .query_row(
                "SELECT name FROM characters WHERE id = ?1 AND user_id = ?2",
                params![character_id, user_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(old_name) = old_name else {
            return Ok(false);
        };
        tx.execute(
            "UPDATE characters SET name = ?3 WHERE id = ?1 AND user_id = ?2",
            params![character_id, user_id, new_name],
        )?;
        tx.execute(
            "UPDATE chat_history SET character_name = ?3
             WHERE user_id = ?1 AND character_name = ?2",
            params![user_id, old_name, new_name],
        )?;
        tx.execute(
            "UPDATE users SET current_character = ?3
             WHERE id = ?1 AND current_character = ?2",
            params![user_id, old_name, new_name],
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub fn update_character_prompt(
        &self,
        user_id: i64,
        character_id: i64,
        prompt: &str,
    ) -> Result<bool, AgmaiError> {
        let conn = self.lock_conn();
        let changed = conn.execute(
            "UPDATE characters SET prompt = ?3 WHERE id = ?1 AND user_id = ?2",
            params![character_id, user_id, prompt],
        )?;
        Ok(changed > 0)
    }

    /// Delete a character along with its history; deselect it if active.
    pub fn delete_character(&self, user_id: i64, character_id: i64) -> Result<bool, AgmaiError> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;
        let name: Option<String> = tx
            .query_row(
                "SELECT name FROM characters WHERE id = ?1 AND user_id = ?2",
                params![character_id, user_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(name) = name else {
            return Ok(false);
        };
        tx.execute(
            "DELETE FROM characters WHERE id = ?1 AND user_id = ?2",
            params![character_id, user_id],
        )?;
        tx.execute(
            "DELETE FROM chat_history WHERE user_id = ?1 AND character_name = ?2",
            params![user_id, name],
        )?;
        tx.execute(
            "UPDATE users SET current_character = NULL
             WHERE id = ?1 AND current_character = ?2",
            params![user_id, name],
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub fn append_history(
        &self,
        user_id: i64,
        character_name: &str,
        role: ChatRole,
        content: &str,
        token_count: i64,
    ) -> Result<i64, AgmaiError> {
        let conn = self.lock_conn();
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO chat_history (user_id, character_name, role, content, token_count, is_summary, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
            params![user_id, character_name, role.as_str(), content, token_count, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// The newest `limit` non-summary turns, oldest first.
    pub fn active_history(
        &self,
        user_id: i64,
        character_name: &str,
        limit: i64,
    ) -> Result<Vec<HistoryRow>, AgmaiError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {HISTORY_COLUMNS} FROM chat_history
             WHERE user_id = ?1 AND character_name = ?2 AND is_summary = 0
             ORDER BY id DESC LIMIT ?3"
        ))?;
        let rows = stmt.query_map(params![user_id, character_name, limit], history_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        out.reverse();
        Ok(out)
    }

    pub fn latest_summary(
        &self,
        user_id: i64,
        character_name: &str,
    ) -> Result<Option<HistoryRow>, AgmaiError> {
        let conn = self.lock_conn();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {HISTORY_COLUMNS} FROM chat_history
                     WHERE user_id = ?1 AND character_name = ?2 AND is_summary = 1
                     ORDER BY id DESC LIMIT 1"
                ),
                params![user_id, character_name],
                history_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Non-summary turns older than the newest `keep` turns, oldest first.
    /// These are the candidates for folding into the rolling summary.
    pub fn overflow_rows(
        &self,
        user_id: i64,
        character_name: &str,
        keep: i64,
    ) -> Result<Vec<HistoryRow>, AgmaiError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {HISTORY_COLUMNS} FROM chat_history
             WHERE user_id = ?1 AND character_name = ?2 AND is_summary = 0
               AND id NOT IN (
                   SELECT id FROM chat_history
                   WHERE user_id = ?1 AND character_name = ?2 AND is_summary = 0
                   ORDER BY id DESC LIMIT ?3
               )
             ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![user_id, character_name, keep], history_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn overflow_token_total(
        &self,
        user_id: i64,
        character_name: &str,
        keep: i64,
    ) -> Result<i64, AgmaiError> {
        let conn = self.lock_conn();
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(token_count), 0) FROM chat_history
             WHERE user_id = ?1 AND character_name = ?2 AND is_summary = 0
               AND id NOT IN (
                   SELECT id FROM chat_history
                   WHERE user_id = ?1 AND character_name = ?2 AND is_summary = 0
                   ORDER BY id DESC LIMIT ?3
               )",
            params![user_id, character_name, keep],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    /// Replace the previous summary row and the folded-in turns with one new
    /// summary row. All-or-nothing: a failure leaves the history untouched.
    pub fn replace_with_summary(
        &self,
        user_id: i64,
        character_name: &str,
        summary_text: &str,
        token_count: i64,
        folded_ids: &[i64],
    ) -> Result<(), AgmaiError> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM chat_history
             WHERE user_id = ?1 AND character_name = ?2 AND is_summary = 1",
            params![user_id, character_name],
        )?;
        for id in folded_ids {
            tx.execute(
                "DELETE FROM chat_history WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )?;
        }
        let now = chrono::Utc::now().to_rfc3339();
        tx.execute(
            "INSERT INTO chat_history (user_id, character_name, role, content, token_count, is_summary, created_at)
             VALUES (?1, ?2, 'model', ?3, ?4, 1, ?5)",
            params![user_id, character_name, summary_text, token_count, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn clear_history(&self, user_id: i64, character_name: &str) -> Result<usize, AgmaiError> {
        let conn = self.lock_conn();
        let deleted = conn.execute(
            "DELETE FROM chat_history WHERE user_id = ?1 AND character_name = ?2",
            params![user_id, character_name],
        )?;
        Ok(deleted)
    }
}
