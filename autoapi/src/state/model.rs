use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::conf::DatasourceId;

/// Identity of a table across the engine.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableKey {
    pub datasource_id: DatasourceId,
    pub table_name: String,
}

impl TableKey {
    pub fn new(datasource_id: DatasourceId, table_name: impl Into<String>) -> Self {
        Self {
            datasource_id,
            table_name: table_name.into(),
        }
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.datasource_id, self.table_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SelectionMode {
    #[default]
    Auto,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SkipReason {
    #[default]
    None,
    AlreadyExists,
    Filtered,
    Manual,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSelection {
    #[serde(flatten)]
    pub key: TableKey,
    pub comment: Option<String>,
    pub selected: bool,
    pub mode: SelectionMode,
    pub skip_reason: SkipReason,
    pub include_columns: Option<BTreeSet<String>>,
    pub exclude_columns: Option<BTreeSet<String>>,
    pub priority: i32,
    /// Overrides the gateway's REST prefix for this table.
    pub api_prefix: Option<String>,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TableSelection {
    pub fn new(key: TableKey, comment: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            key,
            comment,
            selected: false,
            mode: SelectionMode::Auto,
            skip_reason: SkipReason::None,
            include_columns: None,
            exclude_columns: None,
            priority: 0,
            api_prefix: None,
            deleted: false,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum GenerationState {
    Pending,
    Generating,
    Generated,
    Skipped,
    Error,
    Removed,
}

impl GenerationState {
    /// The lifecycle graph. Every edge not listed here is refused.
    pub fn can_transition_to(self, next: GenerationState) -> bool {
        use GenerationState::*;
        matches!(
            (self, next),
            (Pending, Generating)
                | (Generating, Generated)
                | (Generating, Skipped)
                | (Generating, Error)
                | (Generated, Generating)
                | (Error, Generating)
                | (Skipped, Generating)
                | (Pending, Removed)
                | (Generated, Removed)
                | (Error, Removed)
                | (Skipped, Removed)
                | (Generating, Removed)
                | (Removed, Pending)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationStatus {
    #[serde(flatten)]
    pub key: TableKey,
    pub status: GenerationState,
    pub rest_path: Option<String>,
    pub graphql_type: Option<String>,
    pub rest_registered: bool,
    pub graph_registered: bool,
    pub error_message: Option<String>,
    pub metadata_version: u64,
    /// Hex of the descriptor content hash the version was stamped from.
    pub metadata_hash: Option<String>,
    pub generated_at: Option<DateTime<Utc>>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub generation_duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GenerationStatus {
    pub fn pending(key: TableKey) -> Self {
        let now = Utc::now();
        Self {
            key,
            status: GenerationState::Pending,
            rest_path: None,
            graphql_type: None,
            rest_registered: false,
            graph_registered: false,
            error_message: None,
            metadata_version: 0,
            metadata_hash: None,
            generated_at: None,
            last_refreshed_at: None,
            generation_duration_ms: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Live iff generated and at least one surface is registered.
    pub fn is_available(&self) -> bool {
        self.status == GenerationState::Generated && (self.rest_registered || self.graph_registered)
    }

    /// A selected table conflicts with an existing API iff it is generated.
    pub fn is_conflict(&self) -> bool {
        self.status == GenerationState::Generated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use GenerationState::*;

    #[test]
    fn lifecycle_edges() {
        assert!(Pending.can_transition_to(Generating));
        assert!(Generating.can_transition_to(Error));
        assert!(Generated.can_transition_to(Generating));
        assert!(Removed.can_transition_to(Pending));
        assert!(!Removed.can_transition_to(Generating));
        assert!(!Generating.can_transition_to(Pending));
        assert!(!Generating.can_transition_to(Generating));
        assert!(!Pending.can_transition_to(Generated));
    }

    #[test]
    fn every_state_can_be_removed() {
        for state in [Pending, Generating, Generated, Skipped, Error] {
            assert!(state.can_transition_to(Removed), "{state} -> removed");
        }
        assert!(!Removed.can_transition_to(Removed));
    }

    #[test]
    fn availability_rule() {
        let mut s = GenerationStatus::pending(TableKey::new(1, "t"));
        assert!(!s.is_available());
        s.status = Generated;
        assert!(!s.is_available());
        assert!(s.is_conflict());
        s.graph_registered = true;
        assert!(s.is_available());
    }

    #[test]
    fn serialized_shape_is_flat() {
        let s = GenerationStatus::pending(TableKey::new(3, "orders"));
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["datasourceId"], 3);
        assert_eq!(v["tableName"], "orders");
        assert_eq!(v["status"], "pending");
        let sel = TableSelection::new(TableKey::new(3, "orders"), None);
        let v = serde_json::to_value(&sel).unwrap();
        assert_eq!(v["skipReason"], "none");
        assert_eq!(v["mode"], "auto");
    }
}
