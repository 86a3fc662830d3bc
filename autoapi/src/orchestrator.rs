//! Generation state machine.
//!
//! The orchestrator is the only writer of [`GenerationStatus`]. Transitions
//! for one table never overlap: a second request for a table that is already
//! being generated is refused with a conflict.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::conf::{DatasourceId, GatewayConf};
use crate::db::QueryBuilder;
use crate::errors::ApiError;
use crate::graphql::SchemaBuilder;
use crate::introspect::Introspector;
use crate::meta::TableDescriptor;
use crate::naming;
use crate::routes::{RouteBinding, RouteRegistry, TableHandler};
use crate::state::{
    GenerationState, GenerationStatus, ScanReport, SelectionRegistry, SkipReason, StateRepository, TableKey,
};

#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub api_prefix: String,
    pub enable_rest: bool,
    pub enable_graphql: bool,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            api_prefix: "/api".to_string(),
            enable_rest: true,
            enable_graphql: true,
        }
    }
}

impl From<&GatewayConf> for GenerationSettings {
    fn from(conf: &GatewayConf) -> Self {
        Self {
            api_prefix: conf.api_prefix.clone(),
            enable_rest: conf.enable_rest,
            enable_graphql: conf.enable_graphql,
        }
    }
}

/// Status of one table as reported to callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiStatus {
    #[serde(flatten)]
    pub status: GenerationStatus,
    pub available: bool,
    pub conflict: bool,
}

impl From<GenerationStatus> for ApiStatus {
    fn from(status: GenerationStatus) -> Self {
        Self {
            available: status.is_available(),
            conflict: status.is_conflict(),
            status,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableOutcome {
    pub datasource_id: DatasourceId,
    pub table_name: String,
    pub status: Option<GenerationState>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub generated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub unchanged: usize,
    pub tables: Vec<TableOutcome>,
}

impl BatchReport {
    fn record(&mut self, key: &TableKey, result: Result<GenerationStatus, ApiError>) {
        let (status, message) = match result {
            Ok(st) => {
                match st.status {
                    GenerationState::Generated => self.generated += 1,
                    GenerationState::Skipped => self.skipped += 1,
                    _ => self.failed += 1,
                }
                (Some(st.status), st.error_message)
            }
            Err(e) => {
                self.failed += 1;
                (None, Some(e.to_string()))
            }
        };
        self.tables.push(TableOutcome {
            datasource_id: key.datasource_id,
            table_name: key.table_name.clone(),
            status,
            message,
        });
    }
}

/// Marks a table as in flight for as long as it lives.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<TableKey>>,
    key: TableKey,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

/// How a generation attempt ended before it was persisted.
enum Attempt {
    Generated {
        rest_path: Option<String>,
        graphql_type: Option<String>,
        hash: String,
        version: u64,
    },
    Skipped(String),
    Failed(String),
}

pub struct Orchestrator {
    repo: Arc<dyn StateRepository>,
    selections: SelectionRegistry,
    introspector: Introspector,
    routes: Arc<RouteRegistry>,
    schemas: Arc<SchemaBuilder>,
    settings: GenerationSettings,
    in_flight: Mutex<HashSet<TableKey>>,
}

impl Orchestrator {
    pub fn new(
        selections: SelectionRegistry,
        introspector: Introspector,
        routes: Arc<RouteRegistry>,
        schemas: Arc<SchemaBuilder>,
        settings: GenerationSettings,
    ) -> Self {
        Self {
            repo: selections.repository().clone(),
            selections,
            introspector,
            routes,
            schemas,
            settings,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn selections(&self) -> &SelectionRegistry {
        &self.selections
    }

    pub fn introspector(&self) -> &Introspector {
        &self.introspector
    }

    pub fn routes(&self) -> &Arc<RouteRegistry> {
        &self.routes
    }

    pub fn schemas(&self) -> &Arc<SchemaBuilder> {
        &self.schemas
    }

    pub fn settings(&self) -> &GenerationSettings {
        &self.settings
    }

    fn begin(&self, key: &TableKey) -> Result<InFlight<'_>, ApiError> {
        if !self.in_flight.lock().insert(key.clone()) {
            return Err(ApiError::Conflict(format!("Table {} is already generating", key)));
        }
        Ok(InFlight {
            set: &self.in_flight,
            key: key.clone(),
        })
    }

    pub fn is_generating(&self, key: &TableKey) -> bool {
        self.in_flight.lock().contains(key)
    }

    async fn transition(&self, status: &mut GenerationStatus, next: GenerationState) -> Result<(), ApiError> {
        if !status.status.can_transition_to(next) {
            return Err(ApiError::Conflict(format!(
                "Table {} cannot move from {} to {}",
                status.key, status.status, next
            )));
        }
        tracing::info!("{}: {} -> {}", status.key, status.status, next);
        status.status = next;
        status.updated_at = Utc::now();
        self.repo.upsert_status(status).await
    }

    /// Creates or resets the status of a newly selected table to Pending.
    async fn ensure_pending(&self, key: &TableKey) -> Result<(), ApiError> {
        match self.repo.status(key).await? {
            None => self.repo.upsert_status(&GenerationStatus::pending(key.clone())).await,
            Some(mut st) if st.status == GenerationState::Removed => {
                self.transition(&mut st, GenerationState::Pending).await
            }
            Some(_) => Ok(()),
        }
    }

    async fn sync_selected(&self, ds: DatasourceId) -> Result<(), ApiError> {
        for sel in self.selections.selected(ds).await? {
            self.ensure_pending(&sel.key).await?;
        }
        Ok(())
    }

    pub async fn select(&self, ds: DatasourceId, tables: &[String], selected: bool) -> Result<usize, ApiError> {
        let changed = self.selections.select(ds, tables, selected).await?;
        if selected {
            for table in tables {
                self.ensure_pending(&TableKey::new(ds, table)).await?;
            }
        }
        Ok(changed)
    }

    pub async fn select_all(&self, ds: DatasourceId, selected: bool, skip_generated: bool) -> Result<usize, ApiError> {
        let changed = self.selections.select_all(ds, selected, skip_generated).await?;
        if selected {
            self.sync_selected(ds).await?;
        }
        Ok(changed)
    }

    pub async fn status(&self, ds: DatasourceId, table: &str) -> Result<ApiStatus, ApiError> {
        let key = TableKey::new(ds, table);
        self.repo
            .status(&key)
            .await?
            .map(ApiStatus::from)
            .ok_or_else(|| ApiError::NotFound(format!("No API has been requested for {}", key)))
    }

    pub async fn statuses(&self, ds: Option<DatasourceId>) -> Result<Vec<ApiStatus>, ApiError> {
        Ok(self.repo.statuses(ds).await?.into_iter().map(ApiStatus::from).collect())
    }

    /// Generates a table that is not yet generated. Unselected tables are
    /// selected first. A generated table is a conflict; use [`regenerate`].
    ///
    /// [`regenerate`]: Orchestrator::regenerate
    pub async fn generate(&self, ds: DatasourceId, table: &str) -> Result<GenerationStatus, ApiError> {
        let key = TableKey::new(ds, table);
        let _guard = self.begin(&key)?;

        let selected = self
            .selections
            .selection(ds, table)
            .await?
            .is_some_and(|s| s.selected);
        if !selected {
            self.selections.select(ds, std::slice::from_ref(&key.table_name), true).await?;
        }
        self.ensure_pending(&key).await?;

        let status = self
            .repo
            .status(&key)
            .await?
            .unwrap_or_else(|| GenerationStatus::pending(key.clone()));
        if status.status == GenerationState::Generated {
            return Err(ApiError::Conflict(format!(
                "Table {} already has a generated API; regenerate it instead",
                key
            )));
        }
        self.run(status).await
    }

    /// Refreshes a generated table or retries a failed or skipped one.
    pub async fn regenerate(&self, ds: DatasourceId, table: &str) -> Result<GenerationStatus, ApiError> {
        let key = TableKey::new(ds, table);
        let _guard = self.begin(&key)?;
        let status = self
            .repo
            .status(&key)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("No API has been requested for {}", key)))?;
        if status.status == GenerationState::Removed {
            return Err(ApiError::Validation(format!(
                "API for {} was removed; select the table again",
                key
            )));
        }
        self.run(status).await
    }

    /// Unregisters both surfaces and marks the table Removed.
    pub async fn remove(&self, ds: DatasourceId, table: &str) -> Result<GenerationStatus, ApiError> {
        let key = TableKey::new(ds, table);
        let _guard = self.begin(&key)?;
        let mut status = self
            .repo
            .status(&key)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("No API has been requested for {}", key)))?;
        if status.status == GenerationState::Removed {
            return Ok(status);
        }
        self.unpublish(&key);
        status.rest_registered = false;
        status.graph_registered = false;
        self.transition(&mut status, GenerationState::Removed).await?;
        Ok(status)
    }

    fn unpublish(&self, key: &TableKey) {
        self.routes.unregister(key);
        self.schemas.unregister_table(key.datasource_id, &key.table_name);
    }

    /// Drives one table through Generating to its outcome. The caller holds
    /// the in-flight guard.
    async fn run(&self, mut status: GenerationStatus) -> Result<GenerationStatus, ApiError> {
        let refresh = status.status == GenerationState::Generated;
        if status.status == GenerationState::Generating {
            // the caller holds the guard, so this record was left behind by a failed write
            tracing::warn!("{}: resuming stale generating status", status.key);
        } else {
            self.transition(&mut status, GenerationState::Generating).await?;
        }
        let started = Instant::now();

        let attempt = self.attempt(&status).await;
        let outcome = match attempt {
            Attempt::Generated {
                rest_path,
                graphql_type,
                hash,
                version,
            } => {
                status.rest_registered = rest_path.is_some();
                status.graph_registered = graphql_type.is_some();
                status.rest_path = rest_path;
                status.graphql_type = graphql_type;
                status.error_message = None;
                status.metadata_hash = Some(hash);
                status.metadata_version = version;
                GenerationState::Generated
            }
            Attempt::Skipped(reason) => {
                status.error_message = Some(reason);
                GenerationState::Skipped
            }
            Attempt::Failed(reason) => {
                status.error_message = Some(reason);
                GenerationState::Error
            }
        };

        if outcome != GenerationState::Generated {
            self.unpublish(&status.key);
            status.rest_registered = false;
            status.graph_registered = false;
        }
        let now = Utc::now();
        status.generation_duration_ms = Some(started.elapsed().as_millis() as u64);
        if outcome == GenerationState::Generated {
            status.generated_at = Some(now);
            if refresh {
                status.last_refreshed_at = Some(now);
            }
        }

        match outcome {
            GenerationState::Skipped => {
                self.selections.mark_skipped(&status.key, SkipReason::AlreadyExists).await?;
                tracing::warn!("{} skipped: {}", status.key, status.error_message.as_deref().unwrap_or(""));
            }
            GenerationState::Error => {
                tracing::error!("{} failed: {}", status.key, status.error_message.as_deref().unwrap_or(""));
            }
            _ => {
                self.selections.clear_skip(&status.key).await?;
            }
        }
        self.transition(&mut status, outcome).await?;
        Ok(status)
    }

    /// Introspects, validates and registers. Anything registered here is
    /// undone by the caller unless the result is `Generated`.
    async fn attempt(&self, status: &GenerationStatus) -> Attempt {
        let key = &status.key;
        let ds = key.datasource_id;
        let descriptor = match self.introspector.describe_table(ds, &key.table_name).await {
            Ok(d) => d,
            Err(e) => return Attempt::Failed(e.to_string()),
        };
        if let Err(e) = descriptor.check_invariants() {
            return Attempt::Failed(e.to_string());
        }
        if !descriptor.has_primary_key() {
            return Attempt::Failed("no primary key".to_string());
        }

        let selection = match self.selections.selection(ds, &key.table_name).await {
            Ok(s) => s,
            Err(e) => return Attempt::Failed(e.to_string()),
        };
        let (include, exclude, prefix) = match &selection {
            Some(s) => (s.include_columns.as_ref(), s.exclude_columns.as_ref(), s.api_prefix.clone()),
            None => (None, None, None),
        };
        let projected = descriptor.project(include, exclude);
        let validated = self
            .introspector
            .dialect(ds)
            .and_then(|dialect| QueryBuilder::new(dialect).validate(&projected));
        if let Err(e) = validated {
            return Attempt::Failed(e.to_string());
        }

        let hash = hash_hex(&descriptor);
        let path = naming::to_api_path(prefix.as_deref().unwrap_or(&self.settings.api_prefix), &key.table_name);
        let type_name = projected.type_name();

        if self.settings.enable_rest {
            if let Some(owner) = self.routes.path_owner(&path).filter(|o| o != key) {
                return Attempt::Skipped(format!("Path '{}' is already served by {}", path, owner));
            }
        }
        if self.settings.enable_graphql {
            if let Some(owner) = self.schemas.type_owner(ds, &type_name).filter(|o| *o != key.table_name) {
                return Attempt::Skipped(format!("GraphQL type '{}' already belongs to table '{}'", type_name, owner));
            }
        }

        // The version only moves when the structure does.
        let version = if status.metadata_hash.as_deref() == Some(hash.as_str()) {
            status.metadata_version.max(1)
        } else {
            status.metadata_version + 1
        };
        let rest_path = if self.settings.enable_rest {
            match self.publish_route(key, &path, &projected, version) {
                Ok(()) => Some(path),
                Err(ApiError::Conflict(m)) => return Attempt::Skipped(m),
                Err(e) => return Attempt::Failed(e.to_string()),
            }
        } else {
            None
        };
        let graphql_type = if self.settings.enable_graphql {
            match self.schemas.register_table(&projected) {
                Ok(types) => Some(types.type_name().to_string()),
                Err(ApiError::Conflict(m)) => return Attempt::Skipped(m),
                Err(e) => return Attempt::Failed(e.to_string()),
            }
        } else {
            None
        };

        Attempt::Generated {
            rest_path,
            graphql_type,
            hash,
            version,
        }
    }

    fn publish_route(&self, key: &TableKey, path: &str, table: &TableDescriptor, version: u64) -> Result<(), ApiError> {
        let binding = RouteBinding::new(
            path.to_string(),
            TableHandler {
                datasource_id: key.datasource_id,
                descriptor: table.clone(),
                metadata_version: version,
            },
        );
        if self.routes.is_registered(key) {
            self.routes.reregister(binding)?;
        } else {
            self.routes.register(binding)?;
        }
        Ok(())
    }

    /// Generates every pending selected table of a datasource, highest
    /// priority first.
    pub async fn generate_pending(&self, ds: DatasourceId) -> Result<BatchReport, ApiError> {
        self.sync_selected(ds).await?;
        let mut report = BatchReport::default();
        for sel in self.selections.pending(ds).await? {
            let result = self.generate(ds, &sel.key.table_name).await;
            report.record(&sel.key, result);
        }
        tracing::info!(
            "Datasource {}: {} generated, {} skipped, {} failed",
            ds,
            report.generated,
            report.skipped,
            report.failed
        );
        Ok(report)
    }

    /// Scans, selects (the named tables, or every table not yet generated)
    /// and generates in one pass.
    pub async fn scan_and_generate(
        &self,
        ds: DatasourceId,
        tables: Option<&[String]>,
    ) -> Result<(ScanReport, BatchReport), ApiError> {
        self.selections.scan(ds).await?;
        match tables {
            Some(names) if !names.is_empty() => {
                self.select(ds, names, true).await?;
            }
            _ => {
                self.select_all(ds, true, true).await?;
            }
        }
        let report = self.generate_pending(ds).await?;
        let scan = self.selections.scan(ds).await?;
        Ok((scan, report))
    }

    /// Regenerates every generated table. With `only_changed`, tables whose
    /// structure hash is unchanged are left alone.
    pub async fn refresh_all(&self, only_changed: bool) -> Result<BatchReport, ApiError> {
        let mut report = BatchReport::default();
        for status in self.repo.statuses_with(None, GenerationState::Generated).await? {
            let key = status.key.clone();
            let Ok(_guard) = self.begin(&key) else {
                tracing::debug!("Refresh of {} skipped, generation in flight", key);
                continue;
            };
            // Re-read under the guard; the table may have moved on.
            let current = match self.repo.status(&key).await? {
                Some(st) if st.status == GenerationState::Generated => st,
                _ => continue,
            };
            let live = self.routes.is_registered(&key) || !self.settings.enable_rest;
            if only_changed && live {
                match self.introspector.describe_table(key.datasource_id, &key.table_name).await {
                    Ok(d) if current.metadata_hash.as_deref() == Some(hash_hex(&d).as_str()) => {
                        report.unchanged += 1;
                        continue;
                    }
                    _ => {}
                }
            }
            let result = self.run(current).await;
            report.record(&key, result);
        }
        tracing::info!(
            "Refresh: {} regenerated, {} unchanged, {} failed",
            report.generated,
            report.unchanged,
            report.failed
        );
        Ok(report)
    }

    /// Runs [`refresh_all`] with `only_changed` every `interval` until
    /// `shutdown` flips to true.
    ///
    /// [`refresh_all`]: Orchestrator::refresh_all
    pub fn spawn_refresh_loop(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.refresh_all(true).await {
                            tracing::error!("Periodic refresh failed: {}", e);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::info!("Refresh loop stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}

fn hash_hex(table: &TableDescriptor) -> String {
    format!("{:016x}", table.content_hash())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::state::MemoryRepository;
    use crate::testing::{StaticConnector, sample_catalog};

    fn orchestrator_with(connector: Arc<StaticConnector>, settings: GenerationSettings) -> Orchestrator {
        let introspector = Introspector::new(connector, Duration::from_secs(5));
        let selections = SelectionRegistry::new(Arc::new(MemoryRepository::new()), introspector.clone());
        Orchestrator::new(
            selections,
            introspector,
            Arc::new(RouteRegistry::new()),
            Arc::new(SchemaBuilder::new()),
            settings,
        )
    }

    /// Delegates to memory and fails the next write of a `Generated` status once armed.
    #[derive(Default)]
    struct FlakyRepository {
        inner: MemoryRepository,
        fail_generated: AtomicBool,
    }

    #[async_trait::async_trait]
    impl StateRepository for FlakyRepository {
        async fn selection(&self, key: &TableKey) -> Result<Option<crate::state::TableSelection>, ApiError> {
            self.inner.selection(key).await
        }

        async fn selections(&self, ds: DatasourceId) -> Result<Vec<crate::state::TableSelection>, ApiError> {
            self.inner.selections(ds).await
        }

        async fn upsert_selection(&self, selection: &crate::state::TableSelection) -> Result<(), ApiError> {
            self.inner.upsert_selection(selection).await
        }

        async fn status(&self, key: &TableKey) -> Result<Option<GenerationStatus>, ApiError> {
            self.inner.status(key).await
        }

        async fn statuses(&self, ds: Option<DatasourceId>) -> Result<Vec<GenerationStatus>, ApiError> {
            self.inner.statuses(ds).await
        }

        async fn upsert_status(&self, status: &GenerationStatus) -> Result<(), ApiError> {
            if status.status == GenerationState::Generated && self.fail_generated.swap(false, Ordering::SeqCst) {
                return Err(ApiError::Internal("status store unavailable".to_string()));
            }
            self.inner.upsert_status(status).await
        }
    }

    fn flaky_orchestrator() -> (Arc<FlakyRepository>, Orchestrator) {
        let connector = Arc::new(StaticConnector::new().with_catalog(1, sample_catalog()));
        let repo = Arc::new(FlakyRepository::default());
        let introspector = Introspector::new(connector, Duration::from_secs(5));
        let selections = SelectionRegistry::new(repo.clone(), introspector.clone());
        let orch = Orchestrator::new(
            selections,
            introspector,
            Arc::new(RouteRegistry::new()),
            Arc::new(SchemaBuilder::new()),
            GenerationSettings::default(),
        );
        (repo, orch)
    }

    fn orchestrator() -> (Arc<StaticConnector>, Orchestrator) {
        let connector = Arc::new(StaticConnector::new().with_catalog(1, sample_catalog()));
        let orch = orchestrator_with(connector.clone(), GenerationSettings::default());
        (connector, orch)
    }

    #[tokio::test]
    async fn generate_registers_both_surfaces() {
        let (_, orch) = orchestrator();
        let st = orch.generate(1, "user_info").await.unwrap();
        assert_eq!(st.status, GenerationState::Generated);
        assert!(st.is_available());
        assert_eq!(st.rest_path.as_deref(), Some("/api/user-info"));
        assert_eq!(st.graphql_type.as_deref(), Some("UserInfo"));
        assert_eq!(st.metadata_version, 1);

        let key = TableKey::new(1, "user_info");
        assert!(orch.routes().is_registered(&key));
        let binding = orch.routes().find_by_table_name("user_info").unwrap();
        assert!(Arc::ptr_eq(&binding, &orch.routes().get(&key).unwrap()));
        assert!(orch.schemas().contains_type(1, "UserInfo"));
        assert!(orch.selections().selection(1, "user_info").await.unwrap().unwrap().selected);
    }

    #[tokio::test]
    async fn keyless_table_errors_without_registration() {
        let (_, orch) = orchestrator();
        let st = orch.generate(1, "audit_log").await.unwrap();
        assert_eq!(st.status, GenerationState::Error);
        assert_eq!(st.error_message.as_deref(), Some("no primary key"));
        assert!(orch.routes().is_empty());
        assert!(!orch.schemas().contains_type(1, "AuditLog"));
    }

    #[tokio::test]
    async fn generated_table_needs_explicit_regenerate() {
        let (_, orch) = orchestrator();
        orch.generate(1, "orders").await.unwrap();
        assert!(matches!(orch.generate(1, "orders").await, Err(ApiError::Conflict(_))));
        let again = orch.regenerate(1, "orders").await.unwrap();
        assert_eq!(again.status, GenerationState::Generated);
        assert_eq!(again.metadata_version, 1);
        assert!(again.last_refreshed_at.is_some());
        assert_eq!(orch.routes().len(), 1);
    }

    #[tokio::test]
    async fn schema_drift_bumps_version_and_replaces_types() {
        let (connector, orch) = orchestrator();
        orch.generate(1, "user_info").await.unwrap();
        let drifted = sample_catalog()
            .column("user_info", "email", "text", true, 4, None, None);
        connector.set_catalog(1, drifted);

        let report = orch.refresh_all(true).await.unwrap();
        assert_eq!(report.generated, 1);
        let st = orch.status(1, "user_info").await.unwrap();
        assert_eq!(st.status.metadata_version, 2);
        let types = orch.schemas().type_for_table(1, "user_info").unwrap();
        assert!(types.object.field("email").is_some());
        let binding = orch.routes().get(&TableKey::new(1, "user_info")).unwrap();
        assert_eq!(binding.handler.metadata_version, 2);

        let report = orch.refresh_all(true).await.unwrap();
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.generated, 0);
    }

    #[tokio::test]
    async fn dropped_table_fails_refresh_and_unpublishes() {
        let (connector, orch) = orchestrator();
        orch.generate(1, "orders").await.unwrap();
        connector.set_catalog(1, sample_catalog().drop_table("orders"));
        let report = orch.refresh_all(false).await.unwrap();
        assert_eq!(report.failed, 1);
        let st = orch.status(1, "orders").await.unwrap();
        assert_eq!(st.status.status, GenerationState::Error);
        assert!(!st.available);
        assert!(orch.routes().is_empty());
        assert!(!orch.schemas().contains_type(1, "Orders"));
    }

    #[tokio::test]
    async fn remove_then_reselect_resets_to_pending() {
        let (_, orch) = orchestrator();
        orch.generate(1, "orders").await.unwrap();
        let removed = orch.remove(1, "orders").await.unwrap();
        assert_eq!(removed.status, GenerationState::Removed);
        assert!(orch.routes().is_empty());
        assert!(matches!(orch.regenerate(1, "orders").await, Err(ApiError::Validation(_))));

        orch.select(1, &["orders".to_string()], true).await.unwrap();
        assert_eq!(orch.status(1, "orders").await.unwrap().status.status, GenerationState::Pending);
        assert_eq!(orch.generate(1, "orders").await.unwrap().status, GenerationState::Generated);
    }

    #[tokio::test]
    async fn failed_status_write_can_still_be_removed() {
        let (repo, orch) = flaky_orchestrator();
        repo.fail_generated.store(true, Ordering::SeqCst);
        assert!(matches!(orch.generate(1, "orders").await, Err(ApiError::Internal(_))));
        assert_eq!(orch.status(1, "orders").await.unwrap().status.status, GenerationState::Generating);
        assert!(!orch.is_generating(&TableKey::new(1, "orders")));

        let removed = orch.remove(1, "orders").await.unwrap();
        assert_eq!(removed.status, GenerationState::Removed);
        assert!(orch.routes().is_empty());
        assert!(!orch.schemas().contains_type(1, "Orders"));

        orch.select(1, &["orders".to_string()], true).await.unwrap();
        assert_eq!(orch.generate(1, "orders").await.unwrap().status, GenerationState::Generated);
    }

    #[tokio::test]
    async fn stale_generating_status_is_retried() {
        let (repo, orch) = flaky_orchestrator();
        repo.fail_generated.store(true, Ordering::SeqCst);
        assert!(orch.generate(1, "user_info").await.is_err());

        let st = orch.regenerate(1, "user_info").await.unwrap();
        assert_eq!(st.status, GenerationState::Generated);
        assert!(st.is_available());
        assert_eq!(orch.routes().len(), 1);
    }

    #[tokio::test]
    async fn path_collision_is_skipped() {
        let catalog = sample_catalog()
            .table("UserInfo", None)
            .column("UserInfo", "id", "integer", false, 1, None, None)
            .primary_key("UserInfo", &["id"]);
        let connector = Arc::new(StaticConnector::new().with_catalog(1, catalog));
        let orch = orchestrator_with(connector, GenerationSettings::default());
        orch.generate(1, "user_info").await.unwrap();
        let st = orch.generate(1, "UserInfo").await.unwrap();
        assert_eq!(st.status, GenerationState::Skipped);
        assert_eq!(orch.routes().len(), 1);
        let sel = orch.selections().selection(1, "UserInfo").await.unwrap().unwrap();
        assert_eq!(sel.skip_reason, SkipReason::AlreadyExists);
    }

    #[tokio::test]
    async fn disabled_rest_needs_only_graphql() {
        let connector = Arc::new(StaticConnector::new().with_catalog(1, sample_catalog()));
        let settings = GenerationSettings {
            enable_rest: false,
            ..Default::default()
        };
        let orch = orchestrator_with(connector, settings);
        let st = orch.generate(1, "user_info").await.unwrap();
        assert_eq!(st.status, GenerationState::Generated);
        assert!(!st.rest_registered);
        assert!(st.graph_registered);
        assert!(st.is_available());
        assert!(orch.routes().is_empty());
    }

    #[tokio::test]
    async fn generate_pending_follows_priority() {
        let (_, orch) = orchestrator();
        orch.select_all(1, true, true).await.unwrap();
        let report = orch.generate_pending(1).await.unwrap();
        assert_eq!(report.generated, 3);
        assert_eq!(report.failed, 1);
        assert!(orch.generate_pending(1).await.unwrap().tables.iter().all(|t| t.table_name == "audit_log"));
    }

    #[tokio::test]
    async fn projection_keeps_keys() {
        let (_, orch) = orchestrator();
        orch.select(1, &["user_info".to_string()], true).await.unwrap();
        let patch = crate::state::SelectionPatch {
            include_columns: Some(["user_name".to_string()].into()),
            ..Default::default()
        };
        orch.selections().configure(1, "user_info", patch).await.unwrap();
        orch.generate(1, "user_info").await.unwrap();
        let binding = orch.routes().get(&TableKey::new(1, "user_info")).unwrap();
        let names: Vec<&str> = binding.handler.descriptor.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "user_name"]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_generate_admits_one() {
        let catalog = sample_catalog().delayed(Duration::from_millis(100));
        let connector = Arc::new(StaticConnector::new().with_catalog(1, catalog));
        let orch = Arc::new(orchestrator_with(connector, GenerationSettings::default()));
        orch.select(1, &["user_info".to_string()], true).await.unwrap();

        let a = tokio::spawn({
            let orch = orch.clone();
            async move { orch.generate(1, "user_info").await }
        });
        let b = tokio::spawn({
            let orch = orch.clone();
            async move { orch.generate(1, "user_info").await }
        });
        let results = [a.await.unwrap(), b.await.unwrap()];
        let ok = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(ok, 1);
        assert!(results.iter().any(|r| matches!(r, Err(ApiError::Conflict(_)))));
        assert_eq!(orch.routes().len(), 1);
        assert_eq!(orch.status(1, "user_info").await.unwrap().status.metadata_version, 1);
    }
}
