use anyhow::Result;
use sqlx::{sqlite::SqliteRow, Pool, Row, Sqlite};

use super::row_helpers::{json_column, to_json};
use crate::models::*;

fn map_product_row(row: &SqliteRow) -> Result<Product> {
    Ok(Product {
        id: row.try_get("id")?,
        code: row.try_get("code")?,
        name: row.try_get("name")?,
        is_active: row.try_get("is_active")?,
    })
}

fn map_plan_row(row: &SqliteRow) -> Result<SubscriptionPlan> {
    Ok(SubscriptionPlan {
        id: row.try_get("id")?,
        product_id: row.try_get("product_id")?,
        code: row.try_get("code")?,
        name: row.try_get("name")?,
        is_active: row.try_get("is_active")?,
        modules: json_column(row, "modules")?,
    })
}

fn map_module_row(row: &SqliteRow) -> Result<CatalogModule> {
    Ok(CatalogModule {
        id: row.try_get("id")?,
        product_id: row.try_get("product_id")?,
        code: row.try_get("code")?,
        name: row.try_get("name")?,
    })
}

fn map_feature_row(row: &SqliteRow) -> Result<FeatureDefinition> {
    Ok(FeatureDefinition {
        id: row.try_get("id")?,
        module_id: row.try_get("module_id")?,
        code: row.try_get("code")?,
        name: row.try_get("name")?,
        requires_license: row.try_get("requires_license")?,
        additional_cost: row.try_get("additional_cost")?,
        default_value: json_column(row, "default_value")?,
        is_active: row.try_get("is_active")?,
    })
}

pub struct CatalogRepo;

impl CatalogRepo {
    pub async fn get_product(pool: &Pool<Sqlite>, id: &str) -> Result<Option<Product>> {
        let row = sqlx::query("SELECT * FROM products WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        row.as_ref().map(map_product_row).transpose()
    }

    pub async fn get_plan(pool: &Pool<Sqlite>, id: &str) -> Result<Option<SubscriptionPlan>> {
        let row = sqlx::query("SELECT * FROM subscription_plans WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        row.as_ref().map(map_plan_row).transpose()
    }

    pub async fn list_modules(pool: &Pool<Sqlite>) -> Result<Vec<CatalogModule>> {
        let rows = sqlx::query("SELECT * FROM modules ORDER BY product_id, code")
            .fetch_all(pool)
            .await?;
        rows.iter().map(map_module_row).collect()
    }

    pub async fn list_features(pool: &Pool<Sqlite>) -> Result<Vec<FeatureDefinition>> {
        let rows = sqlx::query("SELECT * FROM features ORDER BY module_id, code")
            .fetch_all(pool)
            .await?;
        rows.iter().map(map_feature_row).collect()
    }

    pub async fn create_product(pool: &Pool<Sqlite>, product: &Product) -> Result<()> {
        sqlx::query("INSERT INTO products (id, code, name, is_active) VALUES (?, ?, ?, ?)")
            .bind(&product.id)
            .bind(&product.code)
            .bind(&product.name)
            .bind(product.is_active)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn create_plan(pool: &Pool<Sqlite>, plan: &SubscriptionPlan) -> Result<()> {
        sqlx::query(
            "INSERT INTO subscription_plans (id, product_id, code, name, is_active, modules) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&plan.id)
        .bind(&plan.product_id)
        .bind(&plan.code)
        .bind(&plan.name)
        .bind(plan.is_active)
        .bind(to_json(&plan.modules)?)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn create_module(pool: &Pool<Sqlite>, module: &CatalogModule) -> Result<()> {
        sqlx::query("INSERT INTO modules (id, product_id, code, name) VALUES (?, ?, ?, ?)")
            .bind(&module.id)
            .bind(&module.product_id)
            .bind(&module.code)
            .bind(&module.name)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn create_feature(pool: &Pool<Sqlite>, feature: &FeatureDefinition) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO features (id, module_id, code, name, requires_license, additional_cost, default_value, is_active)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&feature.id)
        .bind(&feature.module_id)
        .bind(&feature.code)
        .bind(&feature.name)
        .bind(feature.requires_license)
        .bind(feature.additional_cost)
        .bind(to_json(&feature.default_value)?)
        .bind(feature.is_active)
        .execute(pool)
        .await?;
        Ok(())
    }
}
