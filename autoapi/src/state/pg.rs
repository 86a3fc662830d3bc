use async_trait::async_trait;
use serde::de::DeserializeOwned;
use sqlx::PgPool;
use sqlx::types::Json;

use super::model::{GenerationState, GenerationStatus, TableKey, TableSelection};
use super::repository::StateRepository;
use crate::conf::DatasourceId;
use crate::db::DbError;
use crate::errors::ApiError;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS autoapi_table_selection (
        datasource_id BIGINT NOT NULL,
        table_name TEXT NOT NULL,
        payload JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (datasource_id, table_name)
    )",
    "CREATE TABLE IF NOT EXISTS autoapi_generation_status (
        datasource_id BIGINT NOT NULL,
        table_name TEXT NOT NULL,
        status TEXT NOT NULL,
        payload JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (datasource_id, table_name)
    )",
    "CREATE INDEX IF NOT EXISTS autoapi_generation_status_status_idx
        ON autoapi_generation_status (status)",
];

/// Selection and status records stored as JSONB documents in Postgres.
pub struct PgStateRepository {
    pool: PgPool,
}

impl PgStateRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the backing tables if they are missing.
    pub async fn migrate(&self) -> Result<(), ApiError> {
        for ddl in SCHEMA {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .map_err(DbError::from)?;
        }
        tracing::info!("State tables ready");
        Ok(())
    }
}

fn documents<T: DeserializeOwned>(rows: Vec<Json<T>>) -> Vec<T> {
    rows.into_iter().map(|Json(doc)| doc).collect()
}

#[async_trait]
impl StateRepository for PgStateRepository {
    async fn selection(&self, key: &TableKey) -> Result<Option<TableSelection>, ApiError> {
        let row: Option<Json<TableSelection>> = sqlx::query_scalar(
            "SELECT payload FROM autoapi_table_selection WHERE datasource_id = $1 AND table_name = $2",
        )
        .bind(key.datasource_id)
        .bind(&key.table_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(row.map(|Json(doc)| doc))
    }

    async fn selections(&self, ds: DatasourceId) -> Result<Vec<TableSelection>, ApiError> {
        let rows: Vec<Json<TableSelection>> = sqlx::query_scalar(
            "SELECT payload FROM autoapi_table_selection WHERE datasource_id = $1 ORDER BY table_name",
        )
        .bind(ds)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(documents(rows))
    }

    async fn upsert_selection(&self, selection: &TableSelection) -> Result<(), ApiError> {
        sqlx::query(
            "INSERT INTO autoapi_table_selection (datasource_id, table_name, payload, updated_at)
             VALUES ($1, $2, $3, now())
             ON CONFLICT (datasource_id, table_name)
             DO UPDATE SET payload = EXCLUDED.payload, updated_at = now()",
        )
        .bind(selection.key.datasource_id)
        .bind(&selection.key.table_name)
        .bind(Json(selection))
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(())
    }

    async fn status(&self, key: &TableKey) -> Result<Option<GenerationStatus>, ApiError> {
        let row: Option<Json<GenerationStatus>> = sqlx::query_scalar(
            "SELECT payload FROM autoapi_generation_status WHERE datasource_id = $1 AND table_name = $2",
        )
        .bind(key.datasource_id)
        .bind(&key.table_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(row.map(|Json(doc)| doc))
    }

    async fn statuses(&self, ds: Option<DatasourceId>) -> Result<Vec<GenerationStatus>, ApiError> {
        let rows: Vec<Json<GenerationStatus>> = sqlx::query_scalar(
            "SELECT payload FROM autoapi_generation_status
             WHERE ($1::bigint IS NULL OR datasource_id = $1)
             ORDER BY datasource_id, table_name",
        )
        .bind(ds)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(documents(rows))
    }

    async fn statuses_with(
        &self,
        ds: Option<DatasourceId>,
        state: GenerationState,
    ) -> Result<Vec<GenerationStatus>, ApiError> {
        let rows: Vec<Json<GenerationStatus>> = sqlx::query_scalar(
            "SELECT payload FROM autoapi_generation_status
             WHERE ($1::bigint IS NULL OR datasource_id = $1) AND status = $2
             ORDER BY datasource_id, table_name",
        )
        .bind(ds)
        .bind(state.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(documents(rows))
    }

    async fn upsert_status(&self, status: &GenerationStatus) -> Result<(), ApiError> {
        sqlx::query(
            "INSERT INTO autoapi_generation_status (datasource_id, table_name, status, payload, updated_at)
             VALUES ($1, $2, $3, $4, now())
             ON CONFLICT (datasource_id, table_name)
             DO UPDATE SET status = EXCLUDED.status, payload = EXCLUDED.payload, updated_at = now()",
        )
        .bind(status.key.datasource_id)
        .bind(&status.key.table_name)
        .bind(status.status.to_string())
        .bind(Json(status))
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(())
    }
}
