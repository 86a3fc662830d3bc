use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::conf::DatasourceId;
use crate::datasource::Connector;
use crate::db::{JsonRow, Operation, QueryBuilder, QueryResult, Record};
use crate::errors::ApiError;
use crate::meta::TableDescriptor;

/// Runs generic operations against a table. Shared by the REST dispatcher and
/// the GraphQL resolvers.
#[derive(Clone)]
pub struct DataService {
    connector: Arc<dyn Connector>,
    query_timeout: Duration,
}

impl DataService {
    pub fn new(connector: Arc<dyn Connector>, query_timeout: Duration) -> Self {
        Self {
            connector,
            query_timeout,
        }
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub async fn run(&self, ds: DatasourceId, table: &TableDescriptor, op: Operation) -> Result<QueryResult, ApiError> {
        let dialect = self.connector.dialect(ds)?;
        let plan = QueryBuilder::new(dialect).build(table, &op)?;
        let executor = self.connector.executor(ds).await?;
        let started = Instant::now();
        let result = tokio::time::timeout(self.query_timeout, executor.run(&plan))
            .await
            .map_err(|_| {
                tracing::warn!("{} on {}:{} timed out after {:?}", plan.kind, ds, table.name, self.query_timeout);
                ApiError::Timeout(format!("Query on '{}' timed out", table.name))
            })??;
        tracing::debug!(
            "{} on {}:{} took {}ms",
            plan.kind,
            ds,
            table.name,
            started.elapsed().as_millis()
        );
        Ok(result)
    }

    /// Inserts one row and returns it. Without `RETURNING` the row is re-read
    /// through the generated id when the key is a single auto column, and the
    /// input is echoed otherwise.
    pub async fn create(&self, ds: DatasourceId, table: &TableDescriptor, values: Record) -> Result<JsonRow, ApiError> {
        let op = Operation::Create { values: values.clone() };
        match self.run(ds, table, op).await? {
            QueryResult::Row(row) => Ok(row.unwrap_or(values)),
            QueryResult::Affected(outcome) => {
                let generated = match table.key_columns().as_slice() {
                    [key] if key.is_auto_increment => outcome.last_insert_id,
                    _ => None,
                };
                if let Some(id) = generated {
                    let key = serde_json::Value::from(id);
                    if let QueryResult::Row(Some(row)) = self.run(ds, table, Operation::GetById { key }).await? {
                        return Ok(row);
                    }
                }
                Ok(values)
            }
            other => Err(unexpected(other)),
        }
    }
}

pub(crate) fn unexpected(result: QueryResult) -> ApiError {
    ApiError::Internal(format!("Unexpected query result {:?}", std::mem::discriminant(&result)))
}
