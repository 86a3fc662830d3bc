use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::model::{GenerationState, GenerationStatus, TableKey, TableSelection};
use crate::conf::DatasourceId;
use crate::errors::ApiError;

/// Storage for selection and generation records, keyed by [`TableKey`].
#[async_trait]
pub trait StateRepository: Send + Sync {
    async fn selection(&self, key: &TableKey) -> Result<Option<TableSelection>, ApiError>;

    /// Every selection of a datasource, soft-deleted ones included.
    async fn selections(&self, ds: DatasourceId) -> Result<Vec<TableSelection>, ApiError>;

    async fn upsert_selection(&self, selection: &TableSelection) -> Result<(), ApiError>;

    async fn status(&self, key: &TableKey) -> Result<Option<GenerationStatus>, ApiError>;

    async fn statuses(&self, ds: Option<DatasourceId>) -> Result<Vec<GenerationStatus>, ApiError>;

    async fn upsert_status(&self, status: &GenerationStatus) -> Result<(), ApiError>;

    async fn statuses_with(
        &self,
        ds: Option<DatasourceId>,
        state: GenerationState,
    ) -> Result<Vec<GenerationStatus>, ApiError> {
        Ok(self
            .statuses(ds)
            .await?
            .into_iter()
            .filter(|s| s.status == state)
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryRepository {
    selections: RwLock<BTreeMap<TableKey, TableSelection>>,
    statuses: RwLock<BTreeMap<TableKey, GenerationStatus>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateRepository for MemoryRepository {
    async fn selection(&self, key: &TableKey) -> Result<Option<TableSelection>, ApiError> {
        Ok(self.selections.read().get(key).cloned())
    }

    async fn selections(&self, ds: DatasourceId) -> Result<Vec<TableSelection>, ApiError> {
        Ok(self
            .selections
            .read()
            .values()
            .filter(|s| s.key.datasource_id == ds)
            .cloned()
            .collect())
    }

    async fn upsert_selection(&self, selection: &TableSelection) -> Result<(), ApiError> {
        self.selections
            .write()
            .insert(selection.key.clone(), selection.clone());
        Ok(())
    }

    async fn status(&self, key: &TableKey) -> Result<Option<GenerationStatus>, ApiError> {
        Ok(self.statuses.read().get(key).cloned())
    }

    async fn statuses(&self, ds: Option<DatasourceId>) -> Result<Vec<GenerationStatus>, ApiError> {
        Ok(self
            .statuses
            .read()
            .values()
            .filter(|s| ds.is_none_or(|id| s.key.datasource_id == id))
            .cloned()
            .collect())
    }

    async fn upsert_status(&self, status: &GenerationStatus) -> Result<(), ApiError> {
        self.statuses.write().insert(status.key.clone(), status.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_and_lookup_by_datasource_and_state() {
        let repo = MemoryRepository::new();
        let a = TableKey::new(1, "a");
        let b = TableKey::new(2, "b");
        repo.upsert_status(&GenerationStatus::pending(a.clone())).await.unwrap();
        let mut done = GenerationStatus::pending(b.clone());
        done.status = GenerationState::Generated;
        repo.upsert_status(&done).await.unwrap();

        assert_eq!(repo.statuses(None).await.unwrap().len(), 2);
        assert_eq!(repo.statuses(Some(1)).await.unwrap().len(), 1);
        let generated = repo.statuses_with(None, GenerationState::Generated).await.unwrap();
        assert_eq!(generated.len(), 1);
        assert_eq!(generated[0].key, b);

        let mut sel = TableSelection::new(a.clone(), None);
        repo.upsert_selection(&sel).await.unwrap();
        sel.selected = true;
        repo.upsert_selection(&sel).await.unwrap();
        assert_eq!(repo.selections(1).await.unwrap().len(), 1);
        assert!(repo.selection(&a).await.unwrap().unwrap().selected);
        assert!(repo.selection(&b).await.unwrap().is_none());
    }
}
