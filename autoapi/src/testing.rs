//! In-memory collaborators for tests: a static catalog, a recording row
//! executor and a connector handing both out per datasource.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::conf::{DatasourceConf, DatasourceId};
use crate::datasource::{Connector, DatasourceInfo, check_name, unknown_datasource};
use crate::db::{DbError, ExecOutcome, JsonRow, RowExecutor, Statement};
use crate::dialect::Dialect;
use crate::errors::ApiError;
use crate::introspect::{MetadataProvider, RawColumn, RawForeignKey, RawIndexColumn, RawTable};

#[derive(Debug, Clone, Default)]
struct StaticTable {
    comment: Option<String>,
    columns: Vec<RawColumn>,
    primary_keys: Vec<String>,
    indexes: Vec<RawIndexColumn>,
    foreign_keys: Vec<RawForeignKey>,
}

/// Catalog built up in code. Table order is insertion order.
#[derive(Debug, Clone)]
pub struct StaticCatalog {
    dialect: Dialect,
    order: Vec<String>,
    tables: BTreeMap<String, StaticTable>,
    report_indexes: bool,
    reachable: bool,
    delay: Option<Duration>,
}

impl StaticCatalog {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            order: Vec::new(),
            tables: BTreeMap::new(),
            report_indexes: true,
            reachable: true,
            delay: None,
        }
    }

    fn entry(&mut self, table: &str) -> &mut StaticTable {
        if !self.tables.contains_key(table) {
            self.order.push(table.to_string());
        }
        self.tables.entry(table.to_string()).or_default()
    }

    pub fn table(mut self, name: &str, comment: Option<&str>) -> Self {
        self.entry(name).comment = comment.map(str::to_string);
        self
    }

    #[allow(clippy::too_many_arguments)]
    pub fn column(
        mut self,
        table: &str,
        name: &str,
        native: &str,
        nullable: bool,
        position: u32,
        default: Option<&str>,
        extra: Option<&str>,
    ) -> Self {
        self.entry(table).columns.push(RawColumn {
            name: name.to_string(),
            native_type: native.to_string(),
            nullable,
            ordinal_position: position,
            default_value: default.map(str::to_string),
            extra: extra.map(str::to_string),
            comment: None,
        });
        self
    }

    pub fn primary_key(mut self, table: &str, columns: &[&str]) -> Self {
        self.entry(table).primary_keys = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn index(mut self, table: &str, name: &str, unique: bool, columns: &[&str]) -> Self {
        let t = self.entry(table);
        for c in columns {
            t.indexes.push(RawIndexColumn {
                index_name: name.to_string(),
                unique,
                column_name: c.to_string(),
            });
        }
        self
    }

    #[allow(clippy::too_many_arguments)]
    pub fn foreign_key(
        mut self,
        table: &str,
        name: &str,
        source: &str,
        target_table: &str,
        target_column: &str,
        on_delete: &str,
        on_update: &str,
    ) -> Self {
        self.entry(table).foreign_keys.push(RawForeignKey {
            name: name.to_string(),
            source_column: source.to_string(),
            target_table: target_table.to_string(),
            target_column: target_column.to_string(),
            on_delete: on_delete.to_string(),
            on_update: on_update.to_string(),
        });
        self
    }

    pub fn drop_table(mut self, name: &str) -> Self {
        self.tables.remove(name);
        self.order.retain(|t| t != name);
        self
    }

    /// Behaves like a provider that cannot report indexes or foreign keys.
    pub fn without_indexes(mut self) -> Self {
        self.report_indexes = false;
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn ready(&self) -> Result<(), ApiError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if !self.reachable {
            return Err(ApiError::Connection("catalog unreachable".into()));
        }
        Ok(())
    }

    fn get(&self, table: &str) -> Result<&StaticTable, ApiError> {
        self.tables
            .get(table)
            .ok_or_else(|| ApiError::NotFound(format!("Table '{}' not found", table)))
    }
}

#[async_trait]
impl MetadataProvider for StaticCatalog {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn tables(&self) -> Result<Vec<RawTable>, ApiError> {
        self.ready().await?;
        Ok(self
            .order
            .iter()
            .filter_map(|name| {
                self.tables.get(name).map(|t| RawTable {
                    name: name.clone(),
                    comment: t.comment.clone(),
                })
            })
            .collect())
    }

    async fn columns(&self, table: &str) -> Result<Vec<RawColumn>, ApiError> {
        self.ready().await?;
        Ok(self.get(table)?.columns.clone())
    }

    async fn primary_keys(&self, table: &str) -> Result<Vec<String>, ApiError> {
        self.ready().await?;
        Ok(self.get(table)?.primary_keys.clone())
    }

    async fn indexes(&self, table: &str) -> Result<Vec<RawIndexColumn>, ApiError> {
        self.ready().await?;
        if !self.report_indexes {
            return Ok(Vec::new());
        }
        Ok(self.get(table)?.indexes.clone())
    }

    async fn foreign_keys(&self, table: &str) -> Result<Vec<RawForeignKey>, ApiError> {
        self.ready().await?;
        if !self.report_indexes {
            return Ok(Vec::new());
        }
        Ok(self.get(table)?.foreign_keys.clone())
    }
}

/// Row executor that records every statement and answers from queues.
///
/// `fetch` pops the next queued answer, falling back to the default rows.
/// `execute` reports one affected row per statement unless an outcome is queued.
pub struct RecordingExecutor {
    dialect: Dialect,
    statements: Mutex<Vec<Statement>>,
    fetches: Mutex<VecDeque<Result<Vec<JsonRow>, DbError>>>,
    outcomes: Mutex<VecDeque<Result<ExecOutcome, DbError>>>,
    default_rows: RwLock<Vec<JsonRow>>,
    delay: Option<Duration>,
}

impl RecordingExecutor {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            statements: Mutex::new(Vec::new()),
            fetches: Mutex::new(VecDeque::new()),
            outcomes: Mutex::new(VecDeque::new()),
            default_rows: RwLock::new(Vec::new()),
            delay: None,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_default_rows(&self, rows: Vec<JsonRow>) {
        *self.default_rows.write() = rows;
    }

    pub fn push_rows(&self, rows: Vec<JsonRow>) {
        self.fetches.lock().push_back(Ok(rows));
    }

    pub fn push_fetch_error(&self, err: DbError) {
        self.fetches.lock().push_back(Err(err));
    }

    pub fn push_outcome(&self, outcome: ExecOutcome) {
        self.outcomes.lock().push_back(Ok(outcome));
    }

    pub fn push_execute_error(&self, err: DbError) {
        self.outcomes.lock().push_back(Err(err));
    }

    pub fn statements(&self) -> Vec<Statement> {
        self.statements.lock().clone()
    }

    pub fn last_sql(&self) -> Option<String> {
        self.statements.lock().last().map(|s| s.sql.clone())
    }

    pub fn clear(&self) {
        self.statements.lock().clear();
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl RowExecutor for RecordingExecutor {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn fetch(&self, stmt: &Statement) -> Result<Vec<JsonRow>, DbError> {
        self.pause().await;
        self.statements.lock().push(stmt.clone());
        let queued = self.fetches.lock().pop_front();
        match queued {
            Some(answer) => answer,
            None => Ok(self.default_rows.read().clone()),
        }
    }

    async fn execute(&self, stmts: &[Statement]) -> Result<ExecOutcome, DbError> {
        self.pause().await;
        self.statements.lock().extend(stmts.iter().cloned());
        let queued = self.outcomes.lock().pop_front();
        match queued {
            Some(answer) => answer,
            None => Ok(ExecOutcome {
                rows_affected: stmts.len() as u64,
                last_insert_id: None,
            }),
        }
    }
}

struct StaticSource {
    name: String,
    catalog: Arc<StaticCatalog>,
    executor: Arc<RecordingExecutor>,
}

impl StaticSource {
    fn new(ds: DatasourceId, catalog: StaticCatalog) -> Self {
        Self {
            name: format!("static-{}", ds),
            executor: Arc::new(RecordingExecutor::new(catalog.dialect())),
            catalog: Arc::new(catalog),
        }
    }

    fn info(&self, id: DatasourceId) -> DatasourceInfo {
        DatasourceInfo {
            id,
            name: self.name.clone(),
            dialect: self.catalog.dialect(),
            schema: self.catalog.dialect().default_schema().map(str::to_string),
        }
    }
}

/// Connector over static catalogs. Catalogs can be swapped at runtime to
/// simulate schema drift. Added datasources start with an empty catalog; a
/// config whose host is `unreachable` fails its connection test.
#[derive(Default)]
pub struct StaticConnector {
    sources: RwLock<HashMap<DatasourceId, StaticSource>>,
}

impl StaticConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a catalog with a fresh [`RecordingExecutor`] of the same dialect.
    pub fn with_catalog(self, ds: DatasourceId, catalog: StaticCatalog) -> Self {
        self.sources.write().insert(ds, StaticSource::new(ds, catalog));
        self
    }

    pub fn with_executor(self, ds: DatasourceId, executor: Arc<RecordingExecutor>) -> Self {
        if let Some(source) = self.sources.write().get_mut(&ds) {
            source.executor = executor;
        }
        self
    }

    pub fn set_catalog(&self, ds: DatasourceId, catalog: StaticCatalog) {
        let mut sources = self.sources.write();
        match sources.get_mut(&ds) {
            Some(source) => source.catalog = Arc::new(catalog),
            None => {
                sources.insert(ds, StaticSource::new(ds, catalog));
            }
        }
    }

    pub fn recorder(&self, ds: DatasourceId) -> Option<Arc<RecordingExecutor>> {
        self.sources.read().get(&ds).map(|s| s.executor.clone())
    }
}

#[async_trait]
impl Connector for StaticConnector {
    fn datasources(&self) -> Vec<DatasourceInfo> {
        let mut out: Vec<DatasourceInfo> = self.sources.read().iter().map(|(id, s)| s.info(*id)).collect();
        out.sort_by_key(|d| d.id);
        out
    }

    async fn metadata(&self, ds: DatasourceId) -> Result<Arc<dyn MetadataProvider>, ApiError> {
        let sources = self.sources.read();
        let source = sources.get(&ds).ok_or_else(|| unknown_datasource(ds))?;
        Ok(source.catalog.clone())
    }

    async fn executor(&self, ds: DatasourceId) -> Result<Arc<dyn RowExecutor>, ApiError> {
        let sources = self.sources.read();
        let source = sources.get(&ds).ok_or_else(|| unknown_datasource(ds))?;
        Ok(source.executor.clone())
    }

    async fn test_config(&self, conf: &DatasourceConf) -> Result<(), ApiError> {
        if conf.host.as_deref() == Some("unreachable") {
            return Err(ApiError::Connection(format!("Datasource '{}' is unreachable", conf.name)));
        }
        conf.dialect.connection_target(conf).map(|_| ())
    }

    async fn add_datasource(&self, conf: DatasourceConf) -> Result<DatasourceInfo, ApiError> {
        check_name(&self.datasources(), &conf, None)?;
        self.test_config(&conf).await?;
        let mut sources = self.sources.write();
        let id = sources.keys().max().map_or(1, |id| id + 1);
        let mut source = StaticSource::new(id, StaticCatalog::new(conf.dialect));
        source.name = conf.name.trim().to_string();
        let info = source.info(id);
        sources.insert(id, source);
        Ok(info)
    }

    async fn update_datasource(&self, ds: DatasourceId, conf: DatasourceConf) -> Result<DatasourceInfo, ApiError> {
        self.datasource(ds)?;
        check_name(&self.datasources(), &conf, Some(ds))?;
        self.test_config(&conf).await?;
        let mut sources = self.sources.write();
        let source = sources.get_mut(&ds).ok_or_else(|| unknown_datasource(ds))?;
        source.name = conf.name.trim().to_string();
        Ok(source.info(ds))
    }

    async fn remove_datasource(&self, ds: DatasourceId) -> Result<DatasourceInfo, ApiError> {
        let mut sources = self.sources.write();
        let source = sources.remove(&ds).ok_or_else(|| unknown_datasource(ds))?;
        Ok(source.info(ds))
    }
}

/// A Postgres catalog with `user_info`, `order_line` (composite key),
/// `audit_log` (no key) and `orders` referencing `user_info`.
pub fn sample_catalog() -> StaticCatalog {
    StaticCatalog::new(Dialect::Postgres)
        .table("user_info", Some("registered users"))
        .column("user_info", "id", "bigint", false, 1, Some("nextval('user_info_id_seq'::regclass)"), None)
        .column("user_info", "user_name", "character varying(64)", false, 2, None, None)
        .column("user_info", "created_at", "timestamp without time zone", true, 3, None, None)
        .primary_key("user_info", &["id"])
        .index("user_info", "user_info_user_name_key", true, &["user_name"])
        .table("order_line", None)
        .column("order_line", "order_id", "integer", false, 1, None, None)
        .column("order_line", "line_no", "integer", false, 2, None, None)
        .column("order_line", "sku", "text", true, 3, None, None)
        .column("order_line", "qty", "integer", true, 4, None, None)
        .primary_key("order_line", &["order_id", "line_no"])
        .table("audit_log", Some("append only"))
        .column("audit_log", "message", "text", true, 1, None, None)
        .table("orders", None)
        .column("orders", "id", "integer", false, 1, None, Some("YES"))
        .column("orders", "user_id", "bigint", false, 2, None, None)
        .column("orders", "total", "numeric(10,2)", true, 3, None, None)
        .primary_key("orders", &["id"])
        .foreign_key("orders", "orders_user_id_fkey", "user_id", "user_info", "id", "a", "a")
}

pub fn row(value: serde_json::Value) -> JsonRow {
    match value {
        serde_json::Value::Object(map) => map,
        _ => JsonRow::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn recorder_answers_from_queue_then_default() {
        let exec = RecordingExecutor::new(Dialect::Postgres);
        exec.set_default_rows(vec![row(json!({"id": 1}))]);
        exec.push_rows(vec![]);
        let stmt = Statement {
            sql: "SELECT 1".into(),
            params: vec![],
            columns: vec![],
        };
        assert!(exec.fetch(&stmt).await.unwrap().is_empty());
        assert_eq!(exec.fetch(&stmt).await.unwrap().len(), 1);
        assert_eq!(exec.execute(&[stmt.clone(), stmt]).await.unwrap().rows_affected, 2);
        assert_eq!(exec.statements().len(), 4);
    }

    #[tokio::test]
    async fn catalog_swap_is_visible() {
        let connector = StaticConnector::new().with_catalog(1, sample_catalog());
        assert_eq!(connector.metadata(1).await.unwrap().tables().await.unwrap().len(), 4);
        connector.set_catalog(1, sample_catalog().drop_table("audit_log"));
        assert_eq!(connector.metadata(1).await.unwrap().tables().await.unwrap().len(), 3);
        assert_eq!(connector.dialect(1).unwrap(), Dialect::Postgres);
    }
}
