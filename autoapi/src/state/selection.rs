use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::model::{GenerationState, GenerationStatus, SelectionMode, SkipReason, TableKey, TableSelection};
use super::repository::StateRepository;
use crate::conf::DatasourceId;
use crate::errors::ApiError;
use crate::introspect::Introspector;
use crate::meta::TableDescriptor;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannedTable {
    pub name: String,
    pub comment: Option<String>,
    pub selected: bool,
    pub generated: bool,
    pub conflict: bool,
    pub status: Option<GenerationState>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    pub datasource_id: DatasourceId,
    pub tables: Vec<ScannedTable>,
    pub total: usize,
    pub selected: usize,
    pub generated: usize,
    pub conflict: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionStats {
    pub total: usize,
    pub selected: usize,
    pub pending: usize,
    pub generated: usize,
    pub skipped: usize,
    pub error: usize,
    pub conflict: usize,
}

/// Partial update of a selection's generation settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SelectionPatch {
    pub mode: Option<SelectionMode>,
    pub priority: Option<i32>,
    pub include_columns: Option<BTreeSet<String>>,
    pub exclude_columns: Option<BTreeSet<String>>,
    pub api_prefix: Option<String>,
}

/// Owns [`TableSelection`] records and answers conflict questions.
#[derive(Clone)]
pub struct SelectionRegistry {
    repo: Arc<dyn StateRepository>,
    introspector: Introspector,
}

impl SelectionRegistry {
    pub fn new(repo: Arc<dyn StateRepository>, introspector: Introspector) -> Self {
        Self { repo, introspector }
    }

    pub fn repository(&self) -> &Arc<dyn StateRepository> {
        &self.repo
    }

    async fn live_tables(&self, ds: DatasourceId) -> Result<Vec<TableDescriptor>, ApiError> {
        self.introspector.list_tables(ds).await
    }

    async fn statuses(&self, ds: DatasourceId) -> Result<HashMap<String, GenerationStatus>, ApiError> {
        Ok(self
            .repo
            .statuses(Some(ds))
            .await?
            .into_iter()
            .map(|s| (s.key.table_name.clone(), s))
            .collect())
    }

    /// Writes one selection flag. Returns whether anything besides the
    /// timestamp changed.
    async fn apply(
        &self,
        key: TableKey,
        comment: Option<String>,
        selected: bool,
        mode: SelectionMode,
    ) -> Result<bool, ApiError> {
        let mut sel = match self.repo.selection(&key).await? {
            Some(existing) => existing,
            None => TableSelection::new(key, comment.clone()),
        };
        let changed = sel.selected != selected || sel.deleted;
        sel.selected = selected;
        sel.deleted = false;
        if comment.is_some() {
            sel.comment = comment;
        }
        if changed {
            sel.mode = mode;
            if selected && sel.skip_reason == SkipReason::Manual {
                sel.skip_reason = SkipReason::None;
            }
            if !selected && mode == SelectionMode::Manual {
                sel.skip_reason = SkipReason::Manual;
            }
        }
        sel.updated_at = Utc::now();
        self.repo.upsert_selection(&sel).await?;
        Ok(changed)
    }

    /// Flags `tables` as selected or not. Unknown table names are rejected
    /// before anything is written.
    pub async fn select(&self, ds: DatasourceId, tables: &[String], selected: bool) -> Result<usize, ApiError> {
        let live = self.live_tables(ds).await?;
        let mut resolved = Vec::with_capacity(tables.len());
        for name in tables {
            let table = live.iter().find(|t| &t.name == name).ok_or_else(|| {
                ApiError::NotFound(format!("Table '{}' not found in datasource {}", name, ds))
            })?;
            resolved.push(table);
        }

        let statuses = self.statuses(ds).await?;
        let mut changed = 0;
        for table in resolved {
            if selected && statuses.get(&table.name).is_some_and(GenerationStatus::is_conflict) {
                tracing::warn!("Table {}:{} is selected while already generated", ds, table.name);
            }
            let key = TableKey::new(ds, &table.name);
            if self.apply(key, table.comment.clone(), selected, SelectionMode::Manual).await? {
                changed += 1;
            }
        }
        tracing::info!("Selection of {} table(s) in datasource {} set to {}, {} changed", tables.len(), ds, selected, changed);
        Ok(changed)
    }

    /// Applies `selected` to every table of the datasource. With
    /// `skip_generated`, generated tables are left untouched.
    pub async fn select_all(&self, ds: DatasourceId, selected: bool, skip_generated: bool) -> Result<usize, ApiError> {
        let live = self.live_tables(ds).await?;
        let statuses = self.statuses(ds).await?;
        let mut changed = 0;
        for table in live {
            let generated = statuses.get(&table.name).is_some_and(GenerationStatus::is_conflict);
            if skip_generated && generated {
                continue;
            }
            let key = TableKey::new(ds, &table.name);
            if self.apply(key, table.comment, selected, SelectionMode::Auto).await? {
                changed += 1;
            }
        }
        tracing::info!("Select-all on datasource {} set to {}, {} changed", ds, selected, changed);
        Ok(changed)
    }

    pub async fn is_conflict(&self, ds: DatasourceId, table: &str) -> Result<bool, ApiError> {
        let key = TableKey::new(ds, table);
        Ok(self
            .repo
            .status(&key)
            .await?
            .is_some_and(|s| s.is_conflict()))
    }

    /// Lists live tables, creating unselected records for new ones.
    pub async fn scan(&self, ds: DatasourceId) -> Result<ScanReport, ApiError> {
        let live = self.live_tables(ds).await?;
        let statuses = self.statuses(ds).await?;
        let mut tables = Vec::with_capacity(live.len());
        for table in live {
            let key = TableKey::new(ds, &table.name);
            let sel = match self.repo.selection(&key).await? {
                Some(existing) => existing,
                None => {
                    let fresh = TableSelection::new(key, table.comment.clone());
                    self.repo.upsert_selection(&fresh).await?;
                    fresh
                }
            };
            let status = statuses.get(&table.name);
            let generated = status.is_some_and(GenerationStatus::is_conflict);
            let selected = sel.selected && !sel.deleted;
            tables.push(ScannedTable {
                name: table.name,
                comment: table.comment,
                selected,
                generated,
                conflict: selected && generated,
                status: status.map(|s| s.status),
            });
        }
        let report = ScanReport {
            datasource_id: ds,
            total: tables.len(),
            selected: tables.iter().filter(|t| t.selected).count(),
            generated: tables.iter().filter(|t| t.generated).count(),
            conflict: tables.iter().filter(|t| t.conflict).count(),
            tables,
        };
        tracing::info!(
            "Scanned datasource {}: {} tables, {} selected, {} generated",
            ds,
            report.total,
            report.selected,
            report.generated
        );
        Ok(report)
    }

    pub async fn selection(&self, ds: DatasourceId, table: &str) -> Result<Option<TableSelection>, ApiError> {
        Ok(self
            .repo
            .selection(&TableKey::new(ds, table))
            .await?
            .filter(|s| !s.deleted))
    }

    pub async fn selected(&self, ds: DatasourceId) -> Result<Vec<TableSelection>, ApiError> {
        let mut out: Vec<TableSelection> = self
            .repo
            .selections(ds)
            .await?
            .into_iter()
            .filter(|s| s.selected && !s.deleted)
            .collect();
        out.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.key.cmp(&b.key)));
        Ok(out)
    }

    /// Selected tables still waiting for a successful generation, highest
    /// priority first.
    pub async fn pending(&self, ds: DatasourceId) -> Result<Vec<TableSelection>, ApiError> {
        let statuses = self.statuses(ds).await?;
        Ok(self
            .selected(ds)
            .await?
            .into_iter()
            .filter(|s| {
                !statuses.get(&s.key.table_name).is_some_and(|st| {
                    matches!(st.status, GenerationState::Generated | GenerationState::Generating)
                })
            })
            .collect())
    }

    pub async fn configure(&self, ds: DatasourceId, table: &str, patch: SelectionPatch) -> Result<TableSelection, ApiError> {
        let key = TableKey::new(ds, table);
        let mut sel = match self.repo.selection(&key).await? {
            Some(existing) if !existing.deleted => existing,
            _ => {
                return Err(ApiError::NotFound(format!(
                    "Table '{}' has no selection in datasource {}",
                    table, ds
                )));
            }
        };
        if let Some(prefix) = &patch.api_prefix {
            validate_prefix(prefix)?;
            sel.api_prefix = Some(prefix.trim_end_matches('/').to_string());
        }
        for set in [&patch.include_columns, &patch.exclude_columns].into_iter().flatten() {
            if let Some(bad) = set.iter().find(|c| !crate::naming::is_plain_identifier(c)) {
                return Err(ApiError::Security(format!("Illegal column name '{}'", bad)));
            }
        }
        if let Some(mode) = patch.mode {
            sel.mode = mode;
        }
        if let Some(priority) = patch.priority {
            sel.priority = priority;
        }
        let reprojected = patch.include_columns.is_some() || patch.exclude_columns.is_some();
        if patch.include_columns.is_some() {
            sel.include_columns = patch.include_columns;
        }
        if patch.exclude_columns.is_some() {
            sel.exclude_columns = patch.exclude_columns;
        }
        if reprojected {
            let descriptor = self.introspector.describe_table(ds, table).await?;
            let hidden = descriptor.hidden_required_columns(sel.include_columns.as_ref(), sel.exclude_columns.as_ref());
            if !hidden.is_empty() {
                return Err(ApiError::Validation(format!(
                    "Columns {} are NOT NULL without a default and cannot be hidden",
                    hidden.join(", ")
                )));
            }
        }
        sel.updated_at = Utc::now();
        self.repo.upsert_selection(&sel).await?;
        Ok(sel)
    }

    /// Soft delete. Returns false when there was nothing to delete.
    pub async fn delete(&self, ds: DatasourceId, table: &str) -> Result<bool, ApiError> {
        let key = TableKey::new(ds, table);
        match self.repo.selection(&key).await? {
            Some(mut sel) if !sel.deleted => {
                sel.deleted = true;
                sel.selected = false;
                sel.updated_at = Utc::now();
                self.repo.upsert_selection(&sel).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub async fn clear(&self, ds: DatasourceId) -> Result<usize, ApiError> {
        let mut cleared = 0;
        for mut sel in self.repo.selections(ds).await? {
            if sel.deleted {
                continue;
            }
            sel.deleted = true;
            sel.selected = false;
            sel.updated_at = Utc::now();
            self.repo.upsert_selection(&sel).await?;
            cleared += 1;
        }
        tracing::info!("Cleared {} selection(s) of datasource {}", cleared, ds);
        Ok(cleared)
    }

    pub async fn statistics(&self, ds: DatasourceId) -> Result<SelectionStats, ApiError> {
        let statuses = self.statuses(ds).await?;
        let mut stats = SelectionStats::default();
        for sel in self.repo.selections(ds).await?.into_iter().filter(|s| !s.deleted) {
            stats.total += 1;
            let status = statuses.get(&sel.key.table_name).map(|s| s.status);
            if sel.selected {
                stats.selected += 1;
                if status == Some(GenerationState::Generated) {
                    stats.conflict += 1;
                }
            }
            match status {
                Some(GenerationState::Generated) => stats.generated += 1,
                Some(GenerationState::Skipped) => stats.skipped += 1,
                Some(GenerationState::Error) => stats.error += 1,
                Some(GenerationState::Generating) => {}
                _ if sel.selected => stats.pending += 1,
                _ => {}
            }
        }
        Ok(stats)
    }

    pub async fn mark_skipped(&self, key: &TableKey, reason: SkipReason) -> Result<(), ApiError> {
        let mut sel = match self.repo.selection(key).await? {
            Some(existing) => existing,
            None => TableSelection::new(key.clone(), None),
        };
        sel.skip_reason = reason;
        sel.updated_at = Utc::now();
        self.repo.upsert_selection(&sel).await
    }

    /// Clears a skip reason left by an earlier attempt.
    pub async fn clear_skip(&self, key: &TableKey) -> Result<(), ApiError> {
        if let Some(mut sel) = self.repo.selection(key).await? {
            if sel.skip_reason != SkipReason::None {
                sel.skip_reason = SkipReason::None;
                sel.updated_at = Utc::now();
                self.repo.upsert_selection(&sel).await?;
            }
        }
        Ok(())
    }
}

fn validate_prefix(prefix: &str) -> Result<(), ApiError> {
    let trimmed = prefix.trim_end_matches('/');
    if !trimmed.starts_with('/') {
        return Err(ApiError::Validation(format!("API prefix '{}' must start with '/'", prefix)));
    }
    let ok = trimmed[1..]
        .split('/')
        .all(|seg| !seg.is_empty() && seg.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    if !ok {
        return Err(ApiError::Validation(format!("Invalid API prefix '{}'", prefix)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryRepository;
    use crate::testing::{StaticConnector, sample_catalog};
    use std::time::Duration;

    fn registry() -> SelectionRegistry {
        let connector = StaticConnector::new().with_catalog(1, sample_catalog());
        let introspector = Introspector::new(Arc::new(connector), Duration::from_secs(5));
        SelectionRegistry::new(Arc::new(MemoryRepository::new()), introspector)
    }

    async fn mark_generated(reg: &SelectionRegistry, table: &str) {
        let mut st = GenerationStatus::pending(TableKey::new(1, table));
        st.status = GenerationState::Generated;
        reg.repository().upsert_status(&st).await.unwrap();
    }

    #[tokio::test]
    async fn select_is_idempotent() {
        let reg = registry();
        let names = vec!["user_info".to_string(), "orders".to_string()];
        assert_eq!(reg.select(1, &names, true).await.unwrap(), 2);
        assert_eq!(reg.select(1, &names, true).await.unwrap(), 0);
        assert_eq!(reg.selected(1).await.unwrap().len(), 2);
        assert_eq!(reg.select(1, &names[..1], false).await.unwrap(), 1);
        assert_eq!(reg.selected(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn required_columns_cannot_be_hidden() {
        let reg = registry();
        reg.select(1, &["user_info".to_string()], true).await.unwrap();
        let patch = SelectionPatch {
            exclude_columns: Some(["user_name".to_string()].into()),
            ..Default::default()
        };
        let err = reg.configure(1, "user_info", patch).await.unwrap_err();
        assert!(matches!(err, ApiError::Validation(ref m) if m.contains("user_name")));
        let stored = reg.selection(1, "user_info").await.unwrap().unwrap();
        assert!(stored.exclude_columns.is_none());

        let patch = SelectionPatch {
            include_columns: Some(["user_name".to_string()].into()),
            ..Default::default()
        };
        let sel = reg.configure(1, "user_info", patch).await.unwrap();
        assert_eq!(sel.include_columns.map(|c| c.len()), Some(1));
    }

    #[tokio::test]
    async fn unknown_table_is_rejected_before_writing() {
        let reg = registry();
        let names = vec!["user_info".to_string(), "ghost".to_string()];
        assert!(matches!(reg.select(1, &names, true).await, Err(ApiError::NotFound(_))));
        assert!(reg.selected(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn select_all_skips_generated_tables() {
        let reg = registry();
        mark_generated(&reg, "orders").await;
        assert_eq!(reg.select_all(1, true, true).await.unwrap(), 3);
        assert_eq!(reg.select_all(1, true, true).await.unwrap(), 0);
        let selected: Vec<String> = reg.selected(1).await.unwrap().into_iter().map(|s| s.key.table_name).collect();
        assert!(!selected.contains(&"orders".to_string()));
        assert!(reg.selection(1, "orders").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn conflict_means_generated() {
        let reg = registry();
        assert!(!reg.is_conflict(1, "orders").await.unwrap());
        mark_generated(&reg, "orders").await;
        assert!(reg.is_conflict(1, "orders").await.unwrap());
        reg.select(1, &["orders".to_string()], true).await.unwrap();
        let report = reg.scan(1).await.unwrap();
        assert_eq!(report.total, 4);
        assert_eq!(report.conflict, 1);
        assert_eq!(report.generated, 1);
        assert_eq!(reg.statistics(1).await.unwrap().conflict, 1);
    }

    #[tokio::test]
    async fn scan_creates_unselected_records() {
        let reg = registry();
        let report = reg.scan(1).await.unwrap();
        assert_eq!(report.selected, 0);
        let stats = reg.statistics(1).await.unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.selected, 0);
    }

    #[tokio::test]
    async fn pending_orders_by_priority() {
        let reg = registry();
        reg.select_all(1, true, false).await.unwrap();
        reg.configure(1, "orders", SelectionPatch { priority: Some(10), ..Default::default() })
            .await
            .unwrap();
        mark_generated(&reg, "user_info").await;
        let pending: Vec<String> = reg.pending(1).await.unwrap().into_iter().map(|s| s.key.table_name).collect();
        assert_eq!(pending, vec!["orders", "audit_log", "order_line"]);
    }

    #[tokio::test]
    async fn configure_validates_input() {
        let reg = registry();
        reg.select(1, &["orders".to_string()], true).await.unwrap();
        let bad_prefix = SelectionPatch { api_prefix: Some("v2".into()), ..Default::default() };
        assert!(matches!(reg.configure(1, "orders", bad_prefix).await, Err(ApiError::Validation(_))));
        let hostile = SelectionPatch {
            exclude_columns: Some(["total; drop".to_string()].into()),
            ..Default::default()
        };
        assert!(matches!(reg.configure(1, "orders", hostile).await, Err(ApiError::Security(_))));
        let ok = SelectionPatch { api_prefix: Some("/v2/".into()), ..Default::default() };
        assert_eq!(reg.configure(1, "orders", ok).await.unwrap().api_prefix.as_deref(), Some("/v2"));
        assert!(matches!(
            reg.configure(1, "user_info", SelectionPatch::default()).await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_and_clear_are_soft() {
        let reg = registry();
        reg.select_all(1, true, false).await.unwrap();
        assert!(reg.delete(1, "orders").await.unwrap());
        assert!(!reg.delete(1, "orders").await.unwrap());
        assert_eq!(reg.clear(1).await.unwrap(), 3);
        assert!(reg.selected(1).await.unwrap().is_empty());
        assert_eq!(reg.repository().selections(1).await.unwrap().len(), 4);
        assert_eq!(reg.select(1, &["orders".to_string()], true).await.unwrap(), 1);
    }
}
