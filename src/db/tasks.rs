use anyhow::Result;
use sqlx::{sqlite::SqliteRow, Pool, Row, Sqlite, SqliteConnection};

use super::row_helpers::{enum_column, json_column, none_if_empty, to_json};
use crate::models::*;

fn map_task_row(row: &SqliteRow) -> Result<ProvisionTask> {
    let steps: Vec<String> = json_column(row, "steps_completed")?;
    Ok(ProvisionTask {
        task_id: row.try_get("task_id")?,
        tenant_instance_id: row.try_get("tenant_instance_id")?,
        task_type: enum_column(row, "task_type")?,
        status: enum_column(row, "status")?,
        progress: row.try_get("progress")?,
        current_step: none_if_empty(row.try_get("current_step")?),
        steps_completed: StepSet::from(steps),
        error_message: none_if_empty(row.try_get("error_message")?),
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        payload: json_column(row, "payload")?,
        initiated_by: row.try_get("initiated_by")?,
        worker_id: none_if_empty(row.try_get("worker_id")?),
        correlation_id: row.try_get("correlation_id")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        estimated_completion: row.try_get("estimated_completion")?,
    })
}

pub struct TaskRepo;

impl TaskRepo {
    pub async fn get(pool: &Pool<Sqlite>, task_id: &str) -> Result<Option<ProvisionTask>> {
        let row = sqlx::query("SELECT * FROM provision_tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(pool)
            .await?;
        row.as_ref().map(map_task_row).transpose()
    }

    /// Newest first
    pub async fn list_by_instance(pool: &Pool<Sqlite>, instance_id: &str) -> Result<Vec<ProvisionTask>> {
        let rows = sqlx::query("SELECT * FROM provision_tasks WHERE tenant_instance_id = ? ORDER BY created_at DESC")
            .bind(instance_id)
            .fetch_all(pool)
            .await?;
        rows.iter().map(map_task_row).collect()
    }

    /// The queued or processing task for an instance, if any
    pub async fn find_live(conn: &mut SqliteConnection, instance_id: &str) -> Result<Option<ProvisionTask>> {
        let row = sqlx::query(
            "SELECT * FROM provision_tasks WHERE tenant_instance_id = ? AND status IN ('queued', 'processing')",
        )
        .bind(instance_id)
        .fetch_optional(&mut *conn)
        .await?;
        row.as_ref().map(map_task_row).transpose()
    }

    pub async fn insert(conn: &mut SqliteConnection, task: &ProvisionTask) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO provision_tasks (task_id, tenant_instance_id, task_type, status, progress, current_step,
                                         steps_completed, error_message, retry_count, max_retries, payload,
                                         initiated_by, worker_id, correlation_id, version, created_at, updated_at,
                                         started_at, completed_at, estimated_completion)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.task_id)
        .bind(&task.tenant_instance_id)
        .bind(task.task_type.as_str())
        .bind(task.status.as_str())
        .bind(task.progress)
        .bind(&task.current_step)
        .bind(to_json(task.steps_completed.as_slice())?)
        .bind(&task.error_message)
        .bind(task.retry_count)
        .bind(task.max_retries)
        .bind(to_json(&task.payload)?)
        .bind(&task.initiated_by)
        .bind(&task.worker_id)
        .bind(&task.correlation_id)
        .bind(task.version)
        .bind(task.created_at)
        .bind(task.updated_at)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(task.estimated_completion)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Write the task's mutable columns if the stored version still matches.
    /// Returns false when another writer got there first.
    pub async fn update_versioned(
        conn: &mut SqliteConnection,
        task: &ProvisionTask,
        expected_version: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE provision_tasks
            SET status = ?, progress = ?, current_step = ?, steps_completed = ?, error_message = ?,
                retry_count = ?, worker_id = ?, updated_at = ?, started_at = ?, completed_at = ?,
                version = version + 1
            WHERE task_id = ? AND version = ?
            "#,
        )
        .bind(task.status.as_str())
        .bind(task.progress)
        .bind(&task.current_step)
        .bind(to_json(task.steps_completed.as_slice())?)
        .bind(&task.error_message)
        .bind(task.retry_count)
        .bind(&task.worker_id)
        .bind(task.updated_at)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(&task.task_id)
        .bind(expected_version)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn count_by_status(pool: &Pool<Sqlite>, instance_id: &str) -> Result<Vec<(TaskStatus, i64)>> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM provision_tasks WHERE tenant_instance_id = ? GROUP BY status",
        )
        .bind(instance_id)
        .fetch_all(pool)
        .await?;

        rows.iter()
            .map(|row| Ok((enum_column(row, "status")?, row.try_get("n")?)))
            .collect()
    }

    pub async fn recent_failures(pool: &Pool<Sqlite>, instance_id: &str, limit: i64) -> Result<Vec<ProvisionTask>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM provision_tasks
            WHERE tenant_instance_id = ? AND status = 'failed'
            ORDER BY completed_at DESC
            LIMIT ?
            "#,
        )
        .bind(instance_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;
        rows.iter().map(map_task_row).collect()
    }
}
