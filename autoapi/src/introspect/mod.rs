//! Schema introspection.
//!
//! A [`MetadataProvider`] answers raw catalog questions for one datasource;
//! the [`Introspector`] turns those answers into [`TableDescriptor`]s and
//! enforces the caller's timeout.

mod catalog;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use catalog::{MySqlCatalog, PgCatalog};

use crate::conf::DatasourceId;
use crate::datasource::Connector;
use crate::dialect::Dialect;
use crate::errors::ApiError;
use crate::meta::{
    ColumnDescriptor, ForeignKeyDescriptor, IndexDescriptor, ReferentialAction, TableDescriptor,
};

#[derive(Debug, Clone, PartialEq)]
pub struct RawTable {
    pub name: String,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawColumn {
    pub name: String,
    pub native_type: String,
    pub nullable: bool,
    pub ordinal_position: u32,
    pub default_value: Option<String>,
    /// Dialect-specific auto-increment marker (identity flag or `EXTRA`).
    pub extra: Option<String>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawIndexColumn {
    pub index_name: String,
    pub unique: bool,
    pub column_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawForeignKey {
    pub name: String,
    pub source_column: String,
    pub target_table: String,
    pub target_column: String,
    pub on_delete: String,
    pub on_update: String,
}

/// Catalog access for a single datasource.
///
/// Providers that cannot report indexes or foreign keys keep the default
/// implementations, which report none.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    fn dialect(&self) -> Dialect;

    async fn tables(&self) -> Result<Vec<RawTable>, ApiError>;

    async fn columns(&self, table: &str) -> Result<Vec<RawColumn>, ApiError>;

    async fn primary_keys(&self, table: &str) -> Result<Vec<String>, ApiError>;

    async fn indexes(&self, _table: &str) -> Result<Vec<RawIndexColumn>, ApiError> {
        Ok(Vec::new())
    }

    async fn foreign_keys(&self, _table: &str) -> Result<Vec<RawForeignKey>, ApiError> {
        Ok(Vec::new())
    }
}

#[derive(Clone)]
pub struct Introspector {
    connector: Arc<dyn Connector>,
    timeout: Duration,
}

impl Introspector {
    pub fn new(connector: Arc<dyn Connector>, timeout: Duration) -> Self {
        Self { connector, timeout }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            connector: self.connector.clone(),
            timeout,
        }
    }

    pub fn dialect(&self, ds: DatasourceId) -> Result<Dialect, ApiError> {
        self.connector.dialect(ds)
    }

    async fn bounded<T, F>(&self, what: String, fut: F) -> Result<T, ApiError>
    where
        F: std::future::Future<Output = Result<T, ApiError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(res) => res,
            Err(_) => {
                tracing::warn!("Introspection timed out after {:?}: {}", self.timeout, what);
                Err(ApiError::Timeout(format!("Timed out reading metadata for {}", what)))
            }
        }
    }

    /// Shallow listing: names and comments only.
    pub async fn list_tables(&self, ds: DatasourceId) -> Result<Vec<TableDescriptor>, ApiError> {
        self.bounded(format!("datasource {}", ds), async {
            let provider = self.connector.metadata(ds).await?;
            let tables = provider.tables().await?;
            Ok(tables
                .into_iter()
                .map(|t| TableDescriptor::shallow(ds, &t.name, t.comment))
                .collect())
        })
        .await
    }

    /// Full descriptor. Unknown tables are `NotFound`.
    pub async fn describe_table(&self, ds: DatasourceId, table: &str) -> Result<TableDescriptor, ApiError> {
        self.bounded(format!("{}.{}", ds, table), async {
            let provider = self.connector.metadata(ds).await?;
            let raw = provider
                .tables()
                .await?
                .into_iter()
                .find(|t| t.name == table)
                .ok_or_else(|| {
                    ApiError::NotFound(format!("Table '{}' not found in datasource {}", table, ds))
                })?;

            let (columns, primary_keys, indexes, foreign_keys) = tokio::try_join!(
                provider.columns(table),
                provider.primary_keys(table),
                provider.indexes(table),
                provider.foreign_keys(table),
            )?;

            Ok(assemble(ds, provider.dialect(), raw, columns, primary_keys, indexes, foreign_keys))
        })
        .await
    }
}

fn assemble(
    ds: DatasourceId,
    dialect: Dialect,
    raw: RawTable,
    mut columns: Vec<RawColumn>,
    primary_keys: Vec<String>,
    indexes: Vec<RawIndexColumn>,
    foreign_keys: Vec<RawForeignKey>,
) -> TableDescriptor {
    columns.sort_by_key(|c| c.ordinal_position);
    columns.dedup_by_key(|c| c.ordinal_position);

    let primary_keys: Vec<String> = primary_keys
        .into_iter()
        .filter(|pk| columns.iter().any(|c| &c.name == pk))
        .collect();

    let columns = columns
        .into_iter()
        .map(|c| ColumnDescriptor {
            canonical_type: dialect.map_type(&c.native_type),
            is_primary_key: primary_keys.contains(&c.name),
            is_auto_increment: dialect.is_auto_increment(c.default_value.as_deref(), c.extra.as_deref()),
            name: c.name,
            native_type: c.native_type,
            nullable: c.nullable,
            ordinal_position: c.ordinal_position,
            comment: c.comment.filter(|s| !s.is_empty()),
            default_value: c.default_value,
        })
        .collect();

    // Rows arrive ordered by index then position; keep that order per index.
    let mut grouped: BTreeMap<String, IndexDescriptor> = BTreeMap::new();
    for row in indexes {
        grouped
            .entry(row.index_name.clone())
            .or_insert_with(|| IndexDescriptor {
                name: row.index_name,
                unique: row.unique,
                columns: Vec::new(),
            })
            .columns
            .push(row.column_name);
    }

    TableDescriptor {
        datasource_id: ds,
        name: raw.name,
        comment: raw.comment.filter(|s| !s.is_empty()),
        columns,
        primary_keys,
        indexes: grouped.into_values().collect(),
        foreign_keys: foreign_keys
            .into_iter()
            .map(|fk| ForeignKeyDescriptor {
                name: fk.name,
                source_column: fk.source_column,
                target_table: fk.target_table,
                target_column: fk.target_column,
                on_delete: ReferentialAction::parse(&fk.on_delete),
                on_update: ReferentialAction::parse(&fk.on_update),
            })
            .collect(),
    }
}
