use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Pool, Row, Sqlite, SqliteConnection};

use super::row_helpers::none_if_empty;
use crate::models::*;

fn map_outbox_row(row: &SqliteRow) -> Result<OutboxMessage> {
    Ok(OutboxMessage {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        subject: row.try_get("subject")?,
        payload: row.try_get("payload")?,
        attempts: row.try_get("attempts")?,
        last_error: none_if_empty(row.try_get("last_error")?),
        created_at: row.try_get("created_at")?,
        delivered_at: row.try_get("delivered_at")?,
    })
}

/// A message to enqueue alongside a task write
#[derive(Debug, Clone)]
pub struct NewOutboxMessage {
    pub task_id: String,
    pub subject: String,
    pub payload: String,
}

pub struct OutboxRepo;

impl OutboxRepo {
    pub async fn insert(conn: &mut SqliteConnection, msg: &NewOutboxMessage, now: DateTime<Utc>) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO outbox_messages (task_id, subject, payload, attempts, created_at) VALUES (?, ?, ?, 0, ?)",
        )
        .bind(&msg.task_id)
        .bind(&msg.subject)
        .bind(&msg.payload)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Oldest undelivered first
    pub async fn list_pending(pool: &Pool<Sqlite>, limit: i64) -> Result<Vec<OutboxMessage>> {
        let rows = sqlx::query("SELECT * FROM outbox_messages WHERE delivered_at IS NULL ORDER BY id LIMIT ?")
            .bind(limit)
            .fetch_all(pool)
            .await?;
        rows.iter().map(map_outbox_row).collect()
    }

    pub async fn list_by_task(pool: &Pool<Sqlite>, task_id: &str) -> Result<Vec<OutboxMessage>> {
        let rows = sqlx::query("SELECT * FROM outbox_messages WHERE task_id = ? ORDER BY id")
            .bind(task_id)
            .fetch_all(pool)
            .await?;
        rows.iter().map(map_outbox_row).collect()
    }

    pub async fn mark_delivered(pool: &Pool<Sqlite>, id: i64) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE outbox_messages SET attempts = attempts + 1, last_attempt_at = ?, delivered_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn record_failure(pool: &Pool<Sqlite>, id: i64, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE outbox_messages SET attempts = attempts + 1, last_attempt_at = ?, last_error = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(error)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Retire a message that must no longer be sent (its task moved on)
    pub async fn discard(pool: &Pool<Sqlite>, id: i64, reason: &str) -> Result<()> {
        sqlx::query("UPDATE outbox_messages SET delivered_at = ?, last_error = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(reason)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }
}
