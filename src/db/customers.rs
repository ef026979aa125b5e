use anyhow::{Context, Result};
use sqlx::{sqlite::SqliteRow, Pool, Row, Sqlite};

use super::row_helpers::{enum_column, json_column, to_json};
use crate::models::*;

fn map_customer_row(row: &SqliteRow) -> Result<Customer> {
    Ok(Customer {
        id: row.try_get("id")?,
        code: row.try_get("code")?,
        company_name: row.try_get("company_name")?,
        tax_id: row.try_get("tax_id")?,
        email: row.try_get("email")?,
        is_active: row.try_get("is_active")?,
        is_deleted: row.try_get("is_deleted")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_subscription_row(row: &SqliteRow) -> Result<Subscription> {
    Ok(Subscription {
        id: row.try_get("id")?,
        customer_id: row.try_get("customer_id")?,
        product_id: row.try_get("product_id")?,
        subscription_type: enum_column(row, "subscription_type")?,
        status: enum_column(row, "status")?,
        max_users: row.try_get("max_users")?,
        subscribed_modules: json_column(row, "subscribed_modules")?,
        custom_features: json_column(row, "custom_features")?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
    })
}

pub struct CustomerRepo;

impl CustomerRepo {
    pub async fn get(pool: &Pool<Sqlite>, id: &str) -> Result<Option<Customer>> {
        let row = sqlx::query("SELECT * FROM customers WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        row.as_ref().map(map_customer_row).transpose()
    }

    pub async fn create(pool: &Pool<Sqlite>, customer: &Customer) -> Result<Customer> {
        sqlx::query(
            r#"
            INSERT INTO customers (id, code, company_name, tax_id, email, is_active, is_deleted, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&customer.id)
        .bind(&customer.code)
        .bind(&customer.company_name)
        .bind(&customer.tax_id)
        .bind(&customer.email)
        .bind(customer.is_active)
        .bind(customer.is_deleted)
        .bind(customer.created_at)
        .bind(customer.updated_at)
        .execute(pool)
        .await?;

        Self::get(pool, &customer.id)
            .await?
            .context("Customer not found after creation")
    }
}

pub struct SubscriptionRepo;

impl SubscriptionRepo {
    /// The subscription driving entitlements for a customer's product:
    /// active ones first, then newest.
    pub async fn find_for_product(
        pool: &Pool<Sqlite>,
        customer_id: &str,
        product_id: &str,
    ) -> Result<Option<Subscription>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM subscriptions
            WHERE customer_id = ? AND product_id = ? AND is_deleted = 0
            ORDER BY CASE status WHEN 'active' THEN 0 ELSE 1 END, start_date DESC
            LIMIT 1
            "#,
        )
        .bind(customer_id)
        .bind(product_id)
        .fetch_optional(pool)
        .await?;
        row.as_ref().map(map_subscription_row).transpose()
    }

    pub async fn create(pool: &Pool<Sqlite>, sub: &Subscription) -> Result<()> {
        if let Some(end) = sub.end_date {
            if end < sub.start_date {
                anyhow::bail!("Subscription end date precedes start date");
            }
        }

        let now = chrono::Utc::now();
        sqlx::query(
            r#"
            INSERT INTO subscriptions (id, customer_id, product_id, subscription_type, status, max_users,
                                       subscribed_modules, custom_features, start_date, end_date, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&sub.id)
        .bind(&sub.customer_id)
        .bind(&sub.product_id)
        .bind(sub.subscription_type.as_str())
        .bind(sub.status.as_str())
        .bind(sub.max_users)
        .bind(to_json(&sub.subscribed_modules)?)
        .bind(to_json(&sub.custom_features)?)
        .bind(sub.start_date)
        .bind(sub.end_date)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;
        Ok(())
    }
}
