use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_common::CALL_CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::security;

const TOKEN_HASH_PREFIX: &str = "h1:";

fn storage_token_for_bearer(token: &str) -> String {
    format!("{}{}", TOKEN_HASH_PREFIX, security::hash_token(token))
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AccessToken {
    pub user_id: i64,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Dm,
    Group,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Conversation {
    pub id: i64,
    pub kind: ConversationKind,
    pub last_message_seq: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Call {
    pub id: i64,
    pub conversation_id: i64,
    pub message_id: i64,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Call {
    /// A call is active until it has been ended or soft-deleted.
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none() && self.deleted_at.is_none()
    }
}

/// Read side of the access-token table, shared by the REST extractor and the
/// relay's authentication callback.
#[async_trait]
pub trait TokenStore: Send + Sync + 'static {
    async fn lookup(&self, token: &str) -> anyhow::Result<Option<AccessToken>>;
}

#[async_trait]
impl TokenStore for SqlitePool {
    async fn lookup(&self, token: &str) -> anyhow::Result<Option<AccessToken>> {
        get_access_token(self, token).await
    }
}

pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

/// Whether `err` came from the one-active-call-per-conversation index (or any
/// other uniqueness constraint).
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<sqlx::Error>() {
        Some(sqlx::Error::Database(db_err)) => db_err.is_unique_violation(),
        _ => false,
    }
}

// Access tokens

pub async fn insert_access_token(
    pool: &SqlitePool,
    token: &str,
    user_id: i64,
    expires_at: DateTime<Utc>,
) -> anyhow::Result<()> {
    sqlx::query("INSERT INTO access_tokens (token, user_id, expires_at) VALUES (?, ?, ?)")
        .bind(storage_token_for_bearer(token))
        .bind(user_id)
        .bind(expires_at)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_access_token(
    pool: &SqlitePool,
    token: &str,
) -> anyhow::Result<Option<AccessToken>> {
    let row = sqlx::query_as::<_, AccessToken>(
        "SELECT user_id, expires_at FROM access_tokens WHERE token = ?",
    )
    .bind(storage_token_for_bearer(token))
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn delete_expired_tokens(pool: &SqlitePool) -> anyhow::Result<u64> {
    let result = sqlx::query("DELETE FROM access_tokens WHERE expires_at <= ?")
        .bind(Utc::now())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

// Conversations

pub async fn get_conversation(pool: &SqlitePool, id: i64) -> anyhow::Result<Option<Conversation>> {
    let row = sqlx::query_as::<_, Conversation>(
        "SELECT id, kind, last_message_seq FROM conversations WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn is_participant(
    pool: &SqlitePool,
    conversation_id: i64,
    user_id: i64,
) -> anyhow::Result<bool> {
    let found: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM conversation_participants WHERE conversation_id = ? AND user_id = ?",
    )
    .bind(conversation_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(found.is_some())
}

// Calls

const CALL_COLUMNS: &str = "id, conversation_id, message_id, created_at, ended_at, deleted_at";

pub async fn get_active_call(pool: &SqlitePool, conversation_id: i64) -> anyhow::Result<Option<Call>> {
    let call = sqlx::query_as::<_, Call>(&format!(
        "SELECT {CALL_COLUMNS} FROM calls WHERE conversation_id = ? AND ended_at IS NULL AND deleted_at IS NULL"
    ))
    .bind(conversation_id)
    .fetch_optional(pool)
    .await?;
    Ok(call)
}

pub async fn get_call(pool: &SqlitePool, call_id: i64) -> anyhow::Result<Option<Call>> {
    let call = sqlx::query_as::<_, Call>(&format!("SELECT {CALL_COLUMNS} FROM calls WHERE id = ?"))
        .bind(call_id)
        .fetch_optional(pool)
        .await?;
    Ok(call)
}

pub async fn get_call_by_message_id(
    pool: &SqlitePool,
    message_id: i64,
) -> anyhow::Result<Option<Call>> {
    let call = sqlx::query_as::<_, Call>(&format!(
        "SELECT {CALL_COLUMNS} FROM calls WHERE message_id = ?"
    ))
    .bind(message_id)
    .fetch_optional(pool)
    .await?;
    Ok(call)
}

/// Posts the call-anchor message into the conversation and records the call,
/// atomically. Fails with a unique violation if a call is already running.
pub async fn start_call(
    pool: &SqlitePool,
    conversation_id: i64,
    sender_id: i64,
) -> anyhow::Result<Call> {
    let mut tx = pool.begin().await?;

    let seq: i64 = sqlx::query_scalar(
        "UPDATE conversations SET last_message_seq = last_message_seq + 1 WHERE id = ? RETURNING last_message_seq",
    )
    .bind(conversation_id)
    .fetch_one(&mut *tx)
    .await?;

    let message_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO messages (conversation_id, seq, sender_id, content_type)
        VALUES (?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(conversation_id)
    .bind(seq)
    .bind(sender_id)
    .bind(CALL_CONTENT_TYPE)
    .fetch_one(&mut *tx)
    .await?;

    let call = sqlx::query_as::<_, Call>(&format!(
        "INSERT INTO calls (conversation_id, message_id) VALUES (?, ?) RETURNING {CALL_COLUMNS}"
    ))
    .bind(conversation_id)
    .bind(message_id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(call)
}

/// Stamps `ended_at` once. Returns false when the call was already ended.
pub async fn end_call(pool: &SqlitePool, call_id: i64) -> anyhow::Result<bool> {
    let result = sqlx::query("UPDATE calls SET ended_at = ? WHERE id = ? AND ended_at IS NULL")
        .bind(Utc::now())
        .bind(call_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn count_active_calls(pool: &SqlitePool) -> anyhow::Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM calls WHERE ended_at IS NULL AND deleted_at IS NULL",
    )
    .fetch_one(pool)
    .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded_pool() -> SqlitePool {
        let pool = connect("sqlite::memory:", 1).await.unwrap();
        sqlx::query("INSERT INTO users (id, username) VALUES (1, 'alice'), (2, 'bob')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO conversations (id, kind) VALUES (42, 'dm')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO conversation_participants (conversation_id, user_id) VALUES (42, 1), (42, 2)")
            .execute(&pool)
            .await
            .unwrap();
        pool
    }

    #[tokio::test]
    async fn test_access_token_lookup_hashes_token() {
        let pool = seeded_pool().await;
        let expires = Utc::now() + chrono::Duration::hours(1);
        insert_access_token(&pool, "tok-alice-0000000000", 1, expires)
            .await
            .unwrap();

        let stored: String = sqlx::query_scalar("SELECT token FROM access_tokens")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert!(stored.starts_with(TOKEN_HASH_PREFIX));
        assert!(!stored.contains("tok-alice"));

        let found = get_access_token(&pool, "tok-alice-0000000000")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.user_id, 1);
        assert!(!found.is_expired());
        assert!(get_access_token(&pool, "unknown-token-000000").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_expired_tokens() {
        let pool = seeded_pool().await;
        insert_access_token(&pool, "expired-token-000000", 1, Utc::now() - chrono::Duration::minutes(5))
            .await
            .unwrap();
        insert_access_token(&pool, "current-token-000000", 2, Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(delete_expired_tokens(&pool).await.unwrap(), 1);
        assert!(get_access_token(&pool, "expired-token-000000").await.unwrap().is_none());
        assert!(get_access_token(&pool, "current-token-000000").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_start_call_posts_anchor_message() {
        let pool = seeded_pool().await;
        let call = start_call(&pool, 42, 1).await.unwrap();
        assert!(call.is_active());
        assert_eq!(call.conversation_id, 42);

        let (content_type, seq): (String, i64) =
            sqlx::query_as("SELECT content_type, seq FROM messages WHERE id = ?")
                .bind(call.message_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(content_type, CALL_CONTENT_TYPE);
        assert_eq!(seq, 1);

        let conversation = get_conversation(&pool, 42).await.unwrap().unwrap();
        assert_eq!(conversation.last_message_seq, 1);
        assert_eq!(conversation.kind, ConversationKind::Dm);
    }

    #[tokio::test]
    async fn test_second_active_call_is_unique_violation() {
        let pool = seeded_pool().await;
        start_call(&pool, 42, 1).await.unwrap();

        let err = start_call(&pool, 42, 2).await.unwrap_err();
        assert!(is_unique_violation(&err));

        // The failed attempt must not leave a message behind.
        let messages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(messages, 1);
    }

    #[tokio::test]
    async fn test_end_call_is_idempotent() {
        let pool = seeded_pool().await;
        let call = start_call(&pool, 42, 1).await.unwrap();

        assert!(end_call(&pool, call.id).await.unwrap());
        assert!(!end_call(&pool, call.id).await.unwrap());

        let call = get_call_by_message_id(&pool, call.message_id)
            .await
            .unwrap()
            .unwrap();
        assert!(!call.is_active());
        assert!(get_active_call(&pool, 42).await.unwrap().is_none());

        // A new call may start once the previous one has ended.
        start_call(&pool, 42, 2).await.unwrap();
        assert_eq!(count_active_calls(&pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_soft_deleted_call_does_not_block_new_call() {
        let pool = seeded_pool().await;
        let call = start_call(&pool, 42, 1).await.unwrap();
        sqlx::query("UPDATE calls SET deleted_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(call.id)
            .execute(&pool)
            .await
            .unwrap();

        assert!(!get_call(&pool, call.id).await.unwrap().unwrap().is_active());
        assert!(get_active_call(&pool, 42).await.unwrap().is_none());

        let next = start_call(&pool, 42, 2).await.unwrap();
        assert!(next.is_active());
        assert_eq!(count_active_calls(&pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_participant_lookup() {
        let pool = seeded_pool().await;
        assert!(is_participant(&pool, 42, 1).await.unwrap());
        assert!(!is_participant(&pool, 42, 3).await.unwrap());
        assert!(!is_participant(&pool, 7, 1).await.unwrap());
    }
}
