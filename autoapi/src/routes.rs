//! Live REST bindings.
//!
//! Every mutation happens under one write lock covering both the key map and
//! the path index, so a reader never sees two bindings for the same path.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::conf::DatasourceId;
use crate::errors::ApiError;
use crate::meta::TableDescriptor;
use crate::state::TableKey;

pub const TABLE_METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE"];

/// What the generic dispatcher needs to serve a table.
#[derive(Debug, Clone)]
pub struct TableHandler {
    pub datasource_id: DatasourceId,
    /// Descriptor after column projection.
    pub descriptor: TableDescriptor,
    pub metadata_version: u64,
}

#[derive(Debug, Clone)]
pub struct RouteBinding {
    pub path: String,
    pub methods: Vec<&'static str>,
    pub handler: Arc<TableHandler>,
    pub table_name: String,
    pub datasource_id: DatasourceId,
    pub registered_at: DateTime<Utc>,
}

impl RouteBinding {
    pub fn new(path: String, handler: TableHandler) -> Self {
        Self {
            path: normalize(&path),
            methods: TABLE_METHODS.to_vec(),
            table_name: handler.descriptor.name.clone(),
            datasource_id: handler.datasource_id,
            handler: Arc::new(handler),
            registered_at: Utc::now(),
        }
    }

    pub fn key(&self) -> TableKey {
        TableKey::new(self.datasource_id, &self.table_name)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSummary {
    pub path: String,
    pub methods: Vec<&'static str>,
    pub datasource_id: DatasourceId,
    pub table_name: String,
    pub metadata_version: u64,
    pub registered_at: DateTime<Utc>,
}

impl From<&RouteBinding> for RouteSummary {
    fn from(b: &RouteBinding) -> Self {
        Self {
            path: b.path.clone(),
            methods: b.methods.clone(),
            datasource_id: b.datasource_id,
            table_name: b.table_name.clone(),
            metadata_version: b.handler.metadata_version,
            registered_at: b.registered_at,
        }
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() { "/".to_string() } else { trimmed.to_string() }
}

#[derive(Default)]
struct Tables {
    by_key: BTreeMap<TableKey, Arc<RouteBinding>>,
    by_path: HashMap<String, TableKey>,
}

impl Tables {
    fn check_free(&self, binding: &RouteBinding) -> Result<(), ApiError> {
        if let Some(owner) = self.by_path.get(&binding.path) {
            if *owner != binding.key() {
                return Err(ApiError::Conflict(format!(
                    "Path '{}' is already bound to {}",
                    binding.path, owner
                )));
            }
        }
        Ok(())
    }

    fn insert(&mut self, binding: RouteBinding) {
        let key = binding.key();
        self.by_path.insert(binding.path.clone(), key.clone());
        self.by_key.insert(key, Arc::new(binding));
    }

    fn remove(&mut self, key: &TableKey) -> Option<Arc<RouteBinding>> {
        let old = self.by_key.remove(key)?;
        self.by_path.remove(&old.path);
        Some(old)
    }
}

#[derive(Default)]
pub struct RouteRegistry {
    inner: RwLock<Tables>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclusive: fails if the table or the path is already bound.
    pub fn register(&self, binding: RouteBinding) -> Result<Arc<RouteBinding>, ApiError> {
        let mut tables = self.inner.write();
        let key = binding.key();
        if tables.by_key.contains_key(&key) {
            return Err(ApiError::Conflict(format!("Table {} already has a route", key)));
        }
        tables.check_free(&binding)?;
        tables.insert(binding);
        tracing::info!("Registered route for {}", key);
        tables
            .by_key
            .get(&key)
            .cloned()
            .ok_or_else(|| ApiError::Internal(format!("Route for {} vanished during registration", key)))
    }

    pub fn unregister(&self, key: &TableKey) -> Option<Arc<RouteBinding>> {
        let removed = self.inner.write().remove(key);
        if let Some(b) = &removed {
            tracing::info!("Unregistered route {} for {}", b.path, key);
        }
        removed
    }

    /// Unregister-then-register under a single lock. On a path collision the
    /// previous binding is put back and the error returned.
    pub fn reregister(&self, binding: RouteBinding) -> Result<Arc<RouteBinding>, ApiError> {
        let mut tables = self.inner.write();
        let key = binding.key();
        let previous = tables.remove(&key);
        if let Err(e) = tables.check_free(&binding) {
            if let Some(prev) = previous {
                tables.by_path.insert(prev.path.clone(), key.clone());
                tables.by_key.insert(key, prev);
            }
            return Err(e);
        }
        tables.insert(binding);
        tracing::info!("Re-registered route for {}", key);
        tables
            .by_key
            .get(&key)
            .cloned()
            .ok_or_else(|| ApiError::Internal(format!("Route for {} vanished during registration", key)))
    }

    pub fn is_registered(&self, key: &TableKey) -> bool {
        self.inner.read().by_key.contains_key(key)
    }

    pub fn get(&self, key: &TableKey) -> Option<Arc<RouteBinding>> {
        self.inner.read().by_key.get(key).cloned()
    }

    /// First binding for a table name, in datasource order.
    pub fn find_by_table_name(&self, table: &str) -> Option<Arc<RouteBinding>> {
        self.inner
            .read()
            .by_key
            .values()
            .find(|b| b.table_name == table)
            .cloned()
    }

    /// Binding serving `path`, if any.
    pub fn resolve(&self, path: &str) -> Option<Arc<RouteBinding>> {
        let tables = self.inner.read();
        let key = tables.by_path.get(&normalize(path))?;
        tables.by_key.get(key).cloned()
    }

    /// Table currently bound to `path`.
    pub fn path_owner(&self, path: &str) -> Option<TableKey> {
        self.inner.read().by_path.get(&normalize(path)).cloned()
    }

    pub fn list(&self) -> Vec<RouteSummary> {
        self.inner
            .read()
            .by_key
            .values()
            .map(|b| RouteSummary::from(b.as_ref()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
