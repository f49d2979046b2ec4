//! Conversation context assembly and rolling summarization. Each (user,
//! persona) keeps a short active buffer of verbatim turns; older turns are
//! folded into a single summary row once their token estimate crosses the
//! tier's trigger.

use std::sync::Arc;

use tracing::{debug, warn};

use agmai_core::error::AgmaiError;
use agmai_core::text::estimate_tokens;
use agmai_core::types::ChatRole;

use agmai_storage::db::{call_blocking, Database, HistoryRow};

use crate::llm::{ChatProvider, ChatTurn};

const SUMMARIZE_TIMEOUT_SECS: u64 = 60;

fn parse_role(raw: &str) -> ChatRole {
    ChatRole::parse(raw).unwrap_or(ChatRole::User)
}

fn rows_to_turns(rows: Vec<HistoryRow>) -> Vec<ChatTurn> {
    rows.into_iter()
        .map(|row| ChatTurn {
            role: parse_role(&row.role),
            content: row.content,
        })
        .collect()
}

/// Build the provider-facing context: the rolling summary (when present) as a
/// leading model turn, then the active buffer verbatim, oldest first.
pub async fn assemble_context(
    db: Arc<Database>,
    user_id: i64,
    persona: &str,
    active_buffer: i64,
) -> Result<Vec<ChatTurn>, AgmaiError> {
    let persona_owned = persona.to_string();
    let (summary, recent) = call_blocking(db, move |db| {
        let summary = db.latest_summary(user_id, &persona_owned)?;
        let recent = db.active_history(user_id, &persona_owned, active_buffer)?;
        Ok((summary, recent))
    })
    .await?;

    let mut turns = Vec::new();
    if let Some(summary) = summary {
        turns.push(ChatTurn {
            role: ChatRole::Model,
            content: format!("Summary of the earlier conversation:\n{}", summary.content),
        });
    }
    turns.extend(rows_to_turns(recent));
    Ok(turns)
}

/// Store one user/model exchange. The model row carries the vendor-reported
/// token count when the provider gives one; everything else falls back to
/// local estimates so the overflow trigger works the same for vendors that
/// report no usage.
pub async fn record_exchange(
    db: Arc<Database>,
    user_id: i64,
    persona: &str,
    user_text: &str,
    reply_text: &str,
    reported_tokens: Option<i64>,
) -> Result<(), AgmaiError> {
    let persona_owned = persona.to_string();
    let user_text = user_text.to_string();
    let reply_text = reply_text.to_string();
    let model_tokens = reported_tokens.unwrap_or_else(|| estimate_tokens(&reply_text));
    call_blocking(db, move |db| {
        db.append_history(
            user_id,
            &persona_owned,
            ChatRole::User,
            &user_text,
            estimate_tokens(&user_text),
        )?;
        db.append_history(
            user_id,
            &persona_owned,
            ChatRole::Model,
            &reply_text,
            model_tokens,
        )?;
        Ok(())
    })
    .await
}

fn summarization_input(previous_summary: Option<&HistoryRow>, overflow: &[HistoryRow]) -> String {
    let mut lines = Vec::new();
    if let Some(summary) = previous_summary {
        lines.push(format!("Earlier summary:\n{}\n", summary.content));
    }
    for row in overflow {
        let speaker = match parse_role(&row.role) {
            ChatRole::User => "User",
            ChatRole::Model => "Assistant",
        };
        lines.push(format!("{speaker}: {}", row.content));
    }
    lines.join("\n")
}

const SUMMARIZE_SYSTEM: &str = "You condense chat transcripts. Produce a compact summary that \
preserves the user's name and stated facts, ongoing topics, decisions, and unresolved questions. \
Write plain prose, no preamble, at most 200 words.";

/// Fold overflow turns into the rolling summary when their combined token
/// estimate crosses the trigger. Returns true when a fold happened. Any
/// provider failure or timeout leaves the history untouched; the next
/// exchange simply retries.
pub async fn maybe_summarize(
    db: Arc<Database>,
    provider: &dyn ChatProvider,
    user_id: i64,
    persona: &str,
    active_buffer: i64,
    trigger_tokens: i64,
) -> Result<bool, AgmaiError> {
    let persona_owned = persona.to_string();
    let (overflow_tokens, overflow, previous_summary) =
        call_blocking(db.clone(), move |db| {
            let tokens = db.overflow_token_total(user_id, &persona_owned, active_buffer)?;
            let rows = db.overflow_rows(user_id, &persona_owned, active_buffer)?;
            let summary = db.latest_summary(user_id, &persona_owned)?;
            Ok((tokens, rows, summary))
        })
        .await?;

    if overflow.is_empty() || overflow_tokens < trigger_tokens {
        return Ok(false);
    }

    let input = summarization_input(previous_summary.as_ref(), &overflow);
    let turns = vec![ChatTurn {
        role: ChatRole::User,
        content: input,
    }];

    let outcome = match tokio::time::timeout(
        std::time::Duration::from_secs(SUMMARIZE_TIMEOUT_SECS),
        provider.send_chat(SUMMARIZE_SYSTEM, &turns),
    )
    .await
    {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            warn!("Summarization failed, keeping full history: {e}");
            return Ok(false);
        }
        Err(_) => {
            warn!("Summarization timed out after {SUMMARIZE_TIMEOUT_SECS}s, keeping full history");
            return Ok(false);
        }
    };

    let summary_tokens = estimate_tokens(&outcome.text);
    let folded_ids: Vec<i64> = overflow.iter().map(|row| row.id).collect();
    debug!(
        "Folding {} turns ({} tokens) into summary for user {user_id}",
        folded_ids.len(),
        overflow_tokens
    );

    let persona_owned = persona.to_string();
    let summary_text = outcome.text;
    call_blocking(db, move |db| {
        db.replace_with_summary(
            user_id,
            &persona_owned,
            &summary_text,
            summary_tokens,
            &folded_ids,
        )
    })
    .await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatOutcome;
    use async_trait::async_trait;

    struct FixedProvider(&'static str);

    #[async_trait]
    impl ChatProvider for FixedProvider {
        async fn send_chat(
            &self,
            _system: &str,
            _turns: &[ChatTurn],
        ) -> Result<ChatOutcome, AgmaiError> {
            Ok(ChatOutcome {
                text: self.0.to_string(),
                total_tokens: None,
            })
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl ChatProvider for FailingProvider {
        async fn send_chat(
            &self,
            _system: &str,
            _turns: &[ChatTurn],
        ) -> Result<ChatOutcome, AgmaiError> {
            Err(AgmaiError::LlmApi("boom".into()))
        }
    }

    fn test_db() -> (Arc<Database>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().to_str().unwrap()).unwrap();
        (Arc::new(db), dir)
    }

    async fn seed_turns(db: &Arc<Database>, user_id: i64, persona: &str, n: usize) {
        for i in 0..n {
            // ~25 estimated tokens per row
            let text = format!("turn {i} {}", "x".repeat(96));
            db.append_history(
                user_id,
                persona,
                ChatRole::User,
                &text,
                estimate_tokens(&text),
            )
            .unwrap();
        }
    }

    #[tokio::test]
    async fn test_assemble_context_without_summary() {
        let (db, _dir) = test_db();
        let user = db.add_or_update_user(1, "Ctx", None).unwrap();
        seed_turns(&db, user.id, "Helper", 3).await;

        let turns = assemble_context(db, user.id, "Helper", 10).await.unwrap();
        assert_eq!(turns.len(), 3);
        assert!(turns[0].content.starts_with("turn 0"));
    }

    #[tokio::test]
    async fn test_assemble_context_leads_with_summary() {
        let (db, _dir) = test_db();
        let user = db.add_or_update_user(2, "Ctx", None).unwrap();
        seed_turns(&db, user.id, "Helper", 2).await;
        db.replace_with_summary(user.id, "Helper", "they talked", 3, &[])
            .unwrap();

        let turns = assemble_context(db, user.id, "Helper", 10).await.unwrap();
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].role, ChatRole::Model);
        assert!(turns[0].content.contains("they talked"));
    }

    #[tokio::test]
    async fn test_no_summarize_below_trigger() {
        let (db, _dir) = test_db();
        let user = db.add_or_update_user(3, "Ctx", None).unwrap();
        seed_turns(&db, user.id, "Helper", 6).await;

        let folded = maybe_summarize(db.clone(), &FixedProvider("s"), user.id, "Helper", 4, 10_000)
            .await
            .unwrap();
        assert!(!folded);
        assert_eq!(db.active_history(user.id, "Helper", 100).unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_summarize_folds_overflow() {
        let (db, _dir) = test_db();
        let user = db.add_or_update_user(4, "Ctx", None).unwrap();
        seed_turns(&db, user.id, "Helper", 8).await;

        let folded = maybe_summarize(
            db.clone(),
            &FixedProvider("condensed"),
            user.id,
            "Helper",
            4,
            10,
        )
        .await
        .unwrap();
        assert!(folded);

        // active buffer survives verbatim, overflow is gone
        let active = db.active_history(user.id, "Helper", 100).unwrap();
        assert_eq!(active.len(), 4);
        assert!(active[0].content.starts_with("turn 4"));

        let summary = db.latest_summary(user.id, "Helper").unwrap().unwrap();
        assert_eq!(summary.content, "condensed");
    }

    #[tokio::test]
    async fn test_summarize_failure_leaves_history_untouched() {
        let (db, _dir) = test_db();
        let user = db.add_or_update_user(5, "Ctx", None).unwrap();
        seed_turns(&db, user.id, "Helper", 8).await;

        let folded = maybe_summarize(db.clone(), &FailingProvider, user.id, "Helper", 4, 10)
            .await
            .unwrap();
        assert!(!folded);
        assert_eq!(db.active_history(user.id, "Helper", 100).unwrap().len(), 8);
        assert!(db.latest_summary(user.id, "Helper").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_exchange_appends_both_roles() {
        let (db, _dir) = test_db();
        let user = db.add_or_update_user(6, "Ctx", None).unwrap();

        record_exchange(db.clone(), user.id, "Helper", "question", "answer", None)
            .await
            .unwrap();

        let rows = db.active_history(user.id, "Helper", 10).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].role, "user");
        assert_eq!(rows[1].role, "model");
        assert!(rows[0].token_count > 0);
        assert_eq!(rows[1].token_count, estimate_tokens("answer"));
    }

    #[tokio::test]
    async fn test_record_exchange_prefers_reported_tokens() {
        let (db, _dir) = test_db();
        let user = db.add_or_update_user(7, "Ctx", None).unwrap();

        record_exchange(db.clone(), user.id, "Helper", "question", "answer", Some(77))
            .await
            .unwrap();

        let rows = db.active_history(user.id, "Helper", 10).unwrap();
        assert_eq!(rows[0].token_count, estimate_tokens("question"));
        assert_eq!(rows[1].token_count, 77);
    }
}
