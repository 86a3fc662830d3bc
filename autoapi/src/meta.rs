//! Immutable schema snapshots produced by the introspector.

use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use twox_hash::XxHash64;

use crate::conf::DatasourceId;
use crate::dialect::CanonicalType;
use crate::errors::ApiError;
use crate::naming;

pub struct StableHasher(XxHash64);

impl StableHasher {
    const DEFAULT_SEED: u64 = 27;

    pub fn new() -> Self {
        Self(XxHash64::with_seed(Self::DEFAULT_SEED))
    }
}

impl Default for StableHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for StableHasher {
    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        self.0.write(bytes);
    }

    #[inline]
    fn finish(&self) -> u64 {
        self.0.finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum ReferentialAction {
    Cascade,
    SetNull,
    Restrict,
    NoAction,
    SetDefault,
}

impl ReferentialAction {
    /// Accepts catalog spellings: `SET NULL`, `NO ACTION`, and Postgres
    /// single-letter codes.
    pub fn parse(raw: &str) -> ReferentialAction {
        match raw.trim().to_ascii_uppercase().replace(' ', "_").as_str() {
            "CASCADE" | "C" => ReferentialAction::Cascade,
            "SET_NULL" | "N" => ReferentialAction::SetNull,
            "RESTRICT" | "R" => ReferentialAction::Restrict,
            "SET_DEFAULT" | "D" => ReferentialAction::SetDefault,
            _ => ReferentialAction::NoAction,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDescriptor {
    pub name: String,
    pub native_type: String,
    pub canonical_type: CanonicalType,
    pub nullable: bool,
    pub is_primary_key: bool,
    pub is_auto_increment: bool,
    pub ordinal_position: u32,
    pub comment: Option<String>,
    pub default_value: Option<String>,
}

impl ColumnDescriptor {
    pub fn field_name(&self) -> String {
        naming::to_field_name(&self.name)
    }

    /// Must be supplied on insert.
    pub fn is_required_on_create(&self) -> bool {
        !self.nullable && !self.is_auto_increment && self.default_value.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDescriptor {
    pub name: String,
    pub unique: bool,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKeyDescriptor {
    pub name: String,
    pub source_column: String,
    pub target_table: String,
    pub target_column: String,
    pub on_delete: ReferentialAction,
    pub on_update: ReferentialAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDescriptor {
    pub datasource_id: DatasourceId,
    pub name: String,
    pub comment: Option<String>,
    pub columns: Vec<ColumnDescriptor>,
    pub primary_keys: Vec<String>,
    pub indexes: Vec<IndexDescriptor>,
    pub foreign_keys: Vec<ForeignKeyDescriptor>,
}

impl TableDescriptor {
    /// Shallow descriptor as returned by table listings.
    pub fn shallow(datasource_id: DatasourceId, name: &str, comment: Option<String>) -> Self {
        Self {
            datasource_id,
            name: name.to_string(),
            comment,
            columns: Vec::new(),
            primary_keys: Vec::new(),
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Looks a caller-supplied key up by column name or by field name.
    /// Keys that are not plain identifiers are rejected as hostile.
    pub fn resolve_column(&self, key: &str) -> Result<&ColumnDescriptor, ApiError> {
        if !naming::is_plain_identifier(key) {
            return Err(ApiError::Security(format!("Illegal identifier '{}'", key)));
        }
        self.columns
            .iter()
            .find(|c| c.name == key)
            .or_else(|| self.columns.iter().find(|c| c.field_name() == key))
            .ok_or_else(|| {
                ApiError::Validation(format!("Unknown field '{}' on table '{}'", key, self.name))
            })
    }

    pub fn key_columns(&self) -> Vec<&ColumnDescriptor> {
        self.primary_keys
            .iter()
            .filter_map(|pk| self.column(pk))
            .collect()
    }

    pub fn has_primary_key(&self) -> bool {
        !self.primary_keys.is_empty()
    }

    pub fn type_name(&self) -> String {
        naming::to_type_name(&self.name)
    }

    /// Columns flagged as keys match `primary_keys` exactly and ordinals are
    /// strictly increasing.
    pub fn check_invariants(&self) -> Result<(), ApiError> {
        let flagged: BTreeSet<&str> = self
            .columns
            .iter()
            .filter(|c| c.is_primary_key)
            .map(|c| c.name.as_str())
            .collect();
        let declared: BTreeSet<&str> = self.primary_keys.iter().map(String::as_str).collect();
        if flagged != declared {
            return Err(ApiError::Generation(format!(
                "Primary key flags of '{}' disagree with its key list",
                self.name
            )));
        }
        let ordered = self
            .columns
            .windows(2)
            .all(|w| w[0].ordinal_position < w[1].ordinal_position);
        if !ordered {
            return Err(ApiError::Generation(format!(
                "Column ordinals of '{}' are not strictly increasing",
                self.name
            )));
        }
        Ok(())
    }

    /// Stable structural hash used to detect schema drift. Comments are
    /// excluded so documentation edits do not force regeneration.
    pub fn content_hash(&self) -> u64 {
        let mut hasher = StableHasher::new();
        self.name.hash(&mut hasher);
        for c in &self.columns {
            c.name.hash(&mut hasher);
            c.native_type.hash(&mut hasher);
            c.canonical_type.hash(&mut hasher);
            c.nullable.hash(&mut hasher);
            c.is_primary_key.hash(&mut hasher);
            c.is_auto_increment.hash(&mut hasher);
            c.ordinal_position.hash(&mut hasher);
            c.default_value.hash(&mut hasher);
        }
        "|pk|".hash(&mut hasher);
        self.primary_keys.hash(&mut hasher);
        "|ix|".hash(&mut hasher);
        self.indexes.hash(&mut hasher);
        "|fk|".hash(&mut hasher);
        self.foreign_keys.hash(&mut hasher);
        hasher.finish()
    }

    /// Restricts the visible columns. Key columns always survive.
    pub fn project(&self, include: Option<&BTreeSet<String>>, exclude: Option<&BTreeSet<String>>) -> Self {
        let mut projected = self.clone();
        projected.columns.retain(|c| {
            if c.is_primary_key {
                return true;
            }
            let included = include.is_none_or(|set| set.is_empty() || set.contains(&c.name));
            let excluded = exclude.is_some_and(|set| set.contains(&c.name));
            included && !excluded
        });
        let kept: BTreeSet<&str> = projected.columns.iter().map(|c| c.name.as_str()).collect();
        projected
            .foreign_keys
            .retain(|fk| kept.contains(fk.source_column.as_str()));
        projected
            .indexes
            .retain(|ix| ix.columns.iter().all(|c| kept.contains(c.as_str())));
        projected
    }

    /// Columns an insert must supply that the projection would hide.
    pub fn hidden_required_columns(
        &self,
        include: Option<&BTreeSet<String>>,
        exclude: Option<&BTreeSet<String>>,
    ) -> Vec<&str> {
        let visible = self.project(include, exclude);
        self.columns
            .iter()
            .filter(|c| c.is_required_on_create() && visible.column(&c.name).is_none())
            .map(|c| c.name.as_str())
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn hash_is_stable_and_ignores_comments() {
        let a = user_info();
        let mut b = user_info();
        assert_eq!(a.content_hash(), b.content_hash());
        b.comment = Some("changed".into());
        b.columns[1].comment = Some("login".into());
        assert_eq!(a.content_hash(), b.content_hash());
        b.columns[1].nullable = true;
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn resolve_by_field_or_column() {
        let t = user_info();
        assert_eq!(t.resolve_column("userName").unwrap().name, "user_name");
        assert_eq!(t.resolve_column("user_name").unwrap().name, "user_name");
        assert!(matches!(t.resolve_column("nope"), Err(ApiError::Validation(_))));
        assert!(matches!(t.resolve_column("x;--"), Err(ApiError::Security(_))));
    }

    #[test]
    fn invariants() {
        let t = user_info();
        assert!(t.check_invariants().is_ok());
        let mut bad = user_info();
        bad.columns[1].is_primary_key = true;
        assert!(bad.check_invariants().is_err());
        let mut unordered = user_info();
        unordered.columns[2].ordinal_position = 2;
        assert!(unordered.check_invariants().is_err());
    }

    #[test]
    fn projection_keeps_keys() {
        let t = user_info();
        let include: BTreeSet<String> = ["user_name".to_string()].into();
        let p = t.project(Some(&include), None);
        let names: Vec<_> = p.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "user_name"]);

        let exclude: BTreeSet<String> = ["created_at".to_string(), "id".to_string()].into();
        let p = t.project(None, Some(&exclude));
        assert_eq!(p.columns.len(), 2);
        assert!(p.column("id").is_some());
    }

    #[test]
    fn hiding_required_columns_is_detected() {
        let t = user_info();
        let exclude: BTreeSet<String> = ["user_name".to_string()].into();
        assert_eq!(t.hidden_required_columns(None, Some(&exclude)), vec!["user_name"]);
        let include: BTreeSet<String> = ["created_at".to_string()].into();
        assert_eq!(t.hidden_required_columns(Some(&include), None), vec!["user_name"]);

        let exclude: BTreeSet<String> = ["created_at".to_string()].into();
        assert!(t.hidden_required_columns(None, Some(&exclude)).is_empty());

        let mut defaulted = t.clone();
        defaulted.columns[1].default_value = Some("'anon'".to_string());
        let exclude: BTreeSet<String> = ["user_name".to_string()].into();
        assert!(defaulted.hidden_required_columns(None, Some(&exclude)).is_empty());
    }

    #[test]
    fn referential_actions() {
        assert_eq!(ReferentialAction::parse("SET NULL"), ReferentialAction::SetNull);
        assert_eq!(ReferentialAction::parse("c"), ReferentialAction::Cascade);
        assert_eq!(ReferentialAction::parse("a"), ReferentialAction::NoAction);
        assert_eq!(ReferentialAction::parse("RESTRICT"), ReferentialAction::Restrict);
    }
}
