use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Pool, Row, Sqlite, SqliteConnection};

use super::row_helpers::{enum_column, json_column, none_if_empty, to_json};
use crate::models::*;

fn map_tenant_row(row: &SqliteRow) -> Result<TenantInstance> {
    Ok(TenantInstance {
        id: row.try_get("id")?,
        customer_id: row.try_get("customer_id")?,
        product_id: row.try_get("product_id")?,
        subscription_plan_id: row.try_get("subscription_plan_id")?,
        tenant_code: row.try_get("tenant_code")?,
        code: none_if_empty(row.try_get("code")?),
        name: row.try_get("name")?,
        deployment_type: enum_column(row, "deployment_type")?,
        status: enum_column(row, "status")?,
        active_features: json_column(row, "active_features")?,
        feature_overrides: json_column(row, "feature_overrides")?,
        api_base_url: none_if_empty(row.try_get("api_base_url")?),
        is_deleted: row.try_get("is_deleted")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub struct TenantRepo;

impl TenantRepo {
    pub async fn get(pool: &Pool<Sqlite>, id: &str) -> Result<Option<TenantInstance>> {
        let row = sqlx::query("SELECT * FROM tenant_instances WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        row.as_ref().map(map_tenant_row).transpose()
    }

    pub async fn find_by_customer_and_code(
        pool: &Pool<Sqlite>,
        customer_id: &str,
        code: &str,
    ) -> Result<Option<TenantInstance>> {
        let row = sqlx::query("SELECT * FROM tenant_instances WHERE customer_id = ? AND code = ?")
            .bind(customer_id)
            .bind(code)
            .fetch_optional(pool)
            .await?;
        row.as_ref().map(map_tenant_row).transpose()
    }

    /// All instances carrying a user code, across customers
    pub async fn list_by_user_code(pool: &Pool<Sqlite>, code: &str) -> Result<Vec<TenantInstance>> {
        let rows = sqlx::query("SELECT * FROM tenant_instances WHERE code = ? COLLATE NOCASE ORDER BY created_at")
            .bind(code)
            .fetch_all(pool)
            .await?;
        rows.iter().map(map_tenant_row).collect()
    }

    pub async fn get_by_tenant_code(pool: &Pool<Sqlite>, tenant_code: &str) -> Result<Option<TenantInstance>> {
        let row = sqlx::query("SELECT * FROM tenant_instances WHERE tenant_code = ? COLLATE NOCASE")
            .bind(tenant_code)
            .fetch_optional(pool)
            .await?;
        row.as_ref().map(map_tenant_row).transpose()
    }

    pub async fn insert(conn: &mut SqliteConnection, inst: &TenantInstance) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tenant_instances (id, customer_id, product_id, subscription_plan_id, tenant_code, code, name,
                                          deployment_type, status, active_features, feature_overrides, api_base_url,
                                          is_deleted, created_by, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&inst.id)
        .bind(&inst.customer_id)
        .bind(&inst.product_id)
        .bind(&inst.subscription_plan_id)
        .bind(&inst.tenant_code)
        .bind(&inst.code)
        .bind(&inst.name)
        .bind(inst.deployment_type.as_str())
        .bind(inst.status.as_str())
        .bind(to_json(&inst.active_features)?)
        .bind(to_json(&inst.feature_overrides)?)
        .bind(&inst.api_base_url)
        .bind(inst.is_deleted)
        .bind(&inst.created_by)
        .bind(inst.created_at)
        .bind(inst.updated_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn update_status(
        conn: &mut SqliteConnection,
        id: &str,
        status: InstanceStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE tenant_instances SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now)
            .bind(id)
            .execute(&mut *conn)
            .await?;

        if result.rows_affected() == 0 {
            return Err(super::NotFoundError::new("Tenant instance", id).into());
        }
        Ok(())
    }

    /// Status change requested outside the task pipeline. Applies only while
    /// the row still holds `from` and no queued or processing task exists.
    pub async fn change_status_if_idle(
        pool: &Pool<Sqlite>,
        id: &str,
        from: InstanceStatus,
        to: InstanceStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tenant_instances SET status = ?, updated_at = ?
            WHERE id = ? AND status = ? AND is_deleted = 0
              AND NOT EXISTS (
                  SELECT 1 FROM provision_tasks
                  WHERE tenant_instance_id = tenant_instances.id AND status IN ('queued', 'processing')
              )
            "#,
        )
        .bind(to.as_str())
        .bind(now)
        .bind(id)
        .bind(from.as_str())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn update_features(
        conn: &mut SqliteConnection,
        id: &str,
        active: &FeatureMap,
        overrides: &FeatureMap,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE tenant_instances SET active_features = ?, feature_overrides = ?, updated_at = ? WHERE id = ?",
        )
        .bind(to_json(active)?)
        .bind(to_json(overrides)?)
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(super::NotFoundError::new("Tenant instance", id).into());
        }
        Ok(())
    }
}
