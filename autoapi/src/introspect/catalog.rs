use async_trait::async_trait;
use sqlx::{MySqlPool, PgPool};

use super::{MetadataProvider, RawColumn, RawForeignKey, RawIndexColumn, RawTable};
use crate::db::DbError;
use crate::dialect::Dialect;
use crate::errors::ApiError;

fn catalog_error(e: sqlx::Error) -> ApiError {
    match DbError::from(e) {
        DbError::Temporary(msg) => ApiError::Connection(msg),
        other => {
            tracing::error!("Catalog query failed: {}", other);
            ApiError::Connection(format!("Catalog query failed: {}", other))
        }
    }
}

const PG_TABLES: &str = r#"
SELECT c.relname::text AS table_name,
       obj_description(c.oid, 'pg_class') AS table_comment
FROM pg_catalog.pg_class c
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
WHERE n.nspname = $1 AND c.relkind IN ('r', 'p')
ORDER BY c.relname"#;

const PG_COLUMNS: &str = r#"
SELECT c.column_name::text,
       CASE WHEN c.data_type IN ('USER-DEFINED', 'ARRAY') THEN c.udt_name::text
            ELSE c.data_type::text END AS native_type,
       (c.is_nullable = 'YES') AS nullable,
       c.ordinal_position::int4,
       c.column_default::text,
       c.is_identity::text,
       col_description(format('%I.%I', c.table_schema, c.table_name)::regclass,
                       c.ordinal_position::int4) AS column_comment
FROM information_schema.columns c
WHERE c.table_schema = $1 AND c.table_name = $2
ORDER BY c.ordinal_position"#;

const PG_PRIMARY_KEYS: &str = r#"
SELECT kcu.column_name::text
FROM information_schema.table_constraints tc
JOIN information_schema.key_column_usage kcu
  ON tc.constraint_name = kcu.constraint_name
 AND tc.table_schema = kcu.table_schema
 AND tc.table_name = kcu.table_name
WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_schema = $1 AND tc.table_name = $2
ORDER BY kcu.ordinal_position"#;

const PG_INDEXES: &str = r#"
SELECT i.relname::text AS index_name, ix.indisunique, a.attname::text AS column_name
FROM pg_catalog.pg_class t
JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
JOIN pg_catalog.pg_index ix ON ix.indrelid = t.oid
JOIN pg_catalog.pg_class i ON i.oid = ix.indexrelid
JOIN LATERAL unnest(ix.indkey) WITH ORDINALITY AS k(attnum, ord) ON true
JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum
WHERE n.nspname = $1 AND t.relname = $2
ORDER BY i.relname, k.ord"#;

const PG_FOREIGN_KEYS: &str = r#"
SELECT con.conname::text, src.attname::text, tgt_t.relname::text, tgt.attname::text,
       con.confdeltype::text, con.confupdtype::text
FROM pg_catalog.pg_constraint con
JOIN pg_catalog.pg_class t ON t.oid = con.conrelid
JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
JOIN pg_catalog.pg_class tgt_t ON tgt_t.oid = con.confrelid
JOIN LATERAL unnest(con.conkey, con.confkey) AS k(src_num, tgt_num) ON true
JOIN pg_catalog.pg_attribute src ON src.attrelid = con.conrelid AND src.attnum = k.src_num
JOIN pg_catalog.pg_attribute tgt ON tgt.attrelid = con.confrelid AND tgt.attnum = k.tgt_num
WHERE con.contype = 'f' AND n.nspname = $1 AND t.relname = $2
ORDER BY con.conname"#;

/// Postgres catalog reader over `pg_catalog` and `information_schema`.
pub struct PgCatalog {
    pool: PgPool,
    schema: String,
}

impl PgCatalog {
    pub fn new(pool: PgPool, schema: Option<&str>) -> Self {
        Self {
            pool,
            schema: schema.unwrap_or("public").to_string(),
        }
    }
}

#[async_trait]
impl MetadataProvider for PgCatalog {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn tables(&self) -> Result<Vec<RawTable>, ApiError> {
        let rows: Vec<(String, Option<String>)> = sqlx::query_as(PG_TABLES)
            .bind(&self.schema)
            .fetch_all(&self.pool)
            .await
            .map_err(catalog_error)?;
        Ok(rows
            .into_iter()
            .map(|(name, comment)| RawTable { name, comment })
            .collect())
    }

    async fn columns(&self, table: &str) -> Result<Vec<RawColumn>, ApiError> {
        type Row = (String, String, bool, i32, Option<String>, Option<String>, Option<String>);
        let rows: Vec<Row> = sqlx::query_as(PG_COLUMNS)
            .bind(&self.schema)
            .bind(table)
            .fetch_all(&self.pool)
            .await
            .map_err(catalog_error)?;
        Ok(rows
            .into_iter()
            .map(|(name, native_type, nullable, pos, default_value, identity, comment)| RawColumn {
                name,
                native_type,
                nullable,
                ordinal_position: pos.max(0) as u32,
                default_value,
                extra: identity,
                comment,
            })
            .collect())
    }

    async fn primary_keys(&self, table: &str) -> Result<Vec<String>, ApiError> {
        sqlx::query_scalar(PG_PRIMARY_KEYS)
            .bind(&self.schema)
            .bind(table)
            .fetch_all(&self.pool)
            .await
            .map_err(catalog_error)
    }

    async fn indexes(&self, table: &str) -> Result<Vec<RawIndexColumn>, ApiError> {
        let rows: Vec<(String, bool, String)> = sqlx::query_as(PG_INDEXES)
            .bind(&self.schema)
            .bind(table)
            .fetch_all(&self.pool)
            .await
            .map_err(catalog_error)?;
        Ok(rows
            .into_iter()
            .map(|(index_name, unique, column_name)| RawIndexColumn {
                index_name,
                unique,
                column_name,
            })
            .collect())
    }

    async fn foreign_keys(&self, table: &str) -> Result<Vec<RawForeignKey>, ApiError> {
        let rows: Vec<(String, String, String, String, String, String)> = sqlx::query_as(PG_FOREIGN_KEYS)
            .bind(&self.schema)
            .bind(table)
            .fetch_all(&self.pool)
            .await
            .map_err(catalog_error)?;
        Ok(rows
            .into_iter()
            .map(|(name, source_column, target_table, target_column, on_delete, on_update)| RawForeignKey {
                name,
                source_column,
                target_table,
                target_column,
                on_delete,
                on_update,
            })
            .collect())
    }
}

const MYSQL_TABLES: &str = r#"
SELECT CAST(TABLE_NAME AS CHAR), CAST(TABLE_COMMENT AS CHAR)
FROM information_schema.TABLES
WHERE TABLE_SCHEMA = COALESCE(?, DATABASE()) AND TABLE_TYPE = 'BASE TABLE'
ORDER BY TABLE_NAME"#;

const MYSQL_COLUMNS: &str = r#"
SELECT CAST(COLUMN_NAME AS CHAR), CAST(COLUMN_TYPE AS CHAR),
       CAST(IS_NULLABLE = 'YES' AS SIGNED), CAST(ORDINAL_POSITION AS SIGNED),
       CAST(COLUMN_DEFAULT AS CHAR), CAST(EXTRA AS CHAR), CAST(COLUMN_COMMENT AS CHAR)
FROM information_schema.COLUMNS
WHERE TABLE_SCHEMA = COALESCE(?, DATABASE()) AND TABLE_NAME = ?
ORDER BY ORDINAL_POSITION"#;

const MYSQL_PRIMARY_KEYS: &str = r#"
SELECT CAST(COLUMN_NAME AS CHAR)
FROM information_schema.KEY_COLUMN_USAGE
WHERE TABLE_SCHEMA = COALESCE(?, DATABASE()) AND TABLE_NAME = ? AND CONSTRAINT_NAME = 'PRIMARY'
ORDER BY ORDINAL_POSITION"#;

const MYSQL_INDEXES: &str = r#"
SELECT CAST(INDEX_NAME AS CHAR), CAST(NON_UNIQUE = 0 AS SIGNED), CAST(COLUMN_NAME AS CHAR)
FROM information_schema.STATISTICS
WHERE TABLE_SCHEMA = COALESCE(?, DATABASE()) AND TABLE_NAME = ?
ORDER BY INDEX_NAME, SEQ_IN_INDEX"#;

const MYSQL_FOREIGN_KEYS: &str = r#"
SELECT CAST(kcu.CONSTRAINT_NAME AS CHAR), CAST(kcu.COLUMN_NAME AS CHAR),
       CAST(kcu.REFERENCED_TABLE_NAME AS CHAR), CAST(kcu.REFERENCED_COLUMN_NAME AS CHAR),
       CAST(rc.DELETE_RULE AS CHAR), CAST(rc.UPDATE_RULE AS CHAR)
FROM information_schema.KEY_COLUMN_USAGE kcu
JOIN information_schema.REFERENTIAL_CONSTRAINTS rc
  ON rc.CONSTRAINT_SCHEMA = kcu.CONSTRAINT_SCHEMA AND rc.CONSTRAINT_NAME = kcu.CONSTRAINT_NAME
WHERE kcu.TABLE_SCHEMA = COALESCE(?, DATABASE()) AND kcu.TABLE_NAME = ?
  AND kcu.REFERENCED_TABLE_NAME IS NOT NULL
ORDER BY kcu.CONSTRAINT_NAME, kcu.ORDINAL_POSITION"#;

/// MySQL/MariaDB catalog reader over `information_schema`.
pub struct MySqlCatalog {
    pool: MySqlPool,
    schema: Option<String>,
}

impl MySqlCatalog {
    pub fn new(pool: MySqlPool, schema: Option<&str>) -> Self {
        Self {
            pool,
            schema: schema.map(str::to_string),
        }
    }
}

#[async_trait]
impl MetadataProvider for MySqlCatalog {
    fn dialect(&self) -> Dialect {
        Dialect::MySql
    }

    async fn tables(&self) -> Result<Vec<RawTable>, ApiError> {
        let rows: Vec<(String, Option<String>)> = sqlx::query_as(MYSQL_TABLES)
            .bind(&self.schema)
            .fetch_all(&self.pool)
            .await
            .map_err(catalog_error)?;
        Ok(rows
            .into_iter()
            .map(|(name, comment)| RawTable { name, comment })
            .collect())
    }

    async fn columns(&self, table: &str) -> Result<Vec<RawColumn>, ApiError> {
        type Row = (String, String, i64, i64, Option<String>, Option<String>, Option<String>);
        let rows: Vec<Row> = sqlx::query_as(MYSQL_COLUMNS)
            .bind(&self.schema)
            .bind(table)
            .fetch_all(&self.pool)
            .await
            .map_err(catalog_error)?;
        Ok(rows
            .into_iter()
            .map(|(name, native_type, nullable, pos, default_value, extra, comment)| RawColumn {
                name,
                native_type,
                nullable: nullable != 0,
                ordinal_position: pos.max(0) as u32,
                default_value,
                extra,
                comment,
            })
            .collect())
    }

    async fn primary_keys(&self, table: &str) -> Result<Vec<String>, ApiError> {
        sqlx::query_scalar(MYSQL_PRIMARY_KEYS)
            .bind(&self.schema)
            .bind(table)
            .fetch_all(&self.pool)
            .await
            .map_err(catalog_error)
    }

    async fn indexes(&self, table: &str) -> Result<Vec<RawIndexColumn>, ApiError> {
        let rows: Vec<(String, i64, String)> = sqlx::query_as(MYSQL_INDEXES)
            .bind(&self.schema)
            .bind(table)
            .fetch_all(&self.pool)
            .await
            .map_err(catalog_error)?;
        Ok(rows
            .into_iter()
            .map(|(index_name, unique, column_name)| RawIndexColumn {
                index_name,
                unique: unique != 0,
                column_name,
            })
            .collect())
    }

    async fn foreign_keys(&self, table: &str) -> Result<Vec<RawForeignKey>, ApiError> {
        let rows: Vec<(String, String, String, String, String, String)> = sqlx::query_as(MYSQL_FOREIGN_KEYS)
            .bind(&self.schema)
            .bind(table)
            .fetch_all(&self.pool)
            .await
            .map_err(catalog_error)?;
        Ok(rows
            .into_iter()
            .map(|(name, source_column, target_table, target_column, on_delete, on_update)| RawForeignKey {
                name,
                source_column,
                target_table,
                target_column,
                on_delete,
                on_update,
            })
            .collect())
    }
}
