use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Write as _};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use strum::Display;

use crate::conf::DatasourceId;
use crate::dialect::CanonicalType;
use crate::errors::ApiError;
use crate::meta::{ColumnDescriptor, TableDescriptor};
use crate::naming;

/// Names the generated schema may never produce for a table.
const RESERVED_TYPES: &[&str] = &["Query", "Mutation", "Subscription", "Long", "Int", "Float", "String", "Boolean", "ID"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
pub enum GraphQlScalar {
    Int,
    Long,
    Float,
    Boolean,
    String,
    ID,
}

impl GraphQlScalar {
    pub fn for_column(col: &ColumnDescriptor) -> GraphQlScalar {
        match col.canonical_type {
            CanonicalType::Int => GraphQlScalar::Int,
            CanonicalType::Long => GraphQlScalar::Long,
            CanonicalType::Float => GraphQlScalar::Float,
            CanonicalType::Bool => GraphQlScalar::Boolean,
            CanonicalType::Decimal
            | CanonicalType::String
            | CanonicalType::Date
            | CanonicalType::DateTime
            | CanonicalType::Time
            | CanonicalType::Bytes => GraphQlScalar::String,
        }
    }
}

/// A type reference: `Name`, `Name!`, `[Name!]` or `[Name!]!`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeExpr {
    pub name: String,
    pub non_null: bool,
    pub list: bool,
}

impl TypeExpr {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            non_null: false,
            list: false,
        }
    }

    pub fn named_nn(name: impl Into<String>) -> Self {
        Self {
            non_null: true,
            ..Self::named(name)
        }
    }

    /// Non-null list of non-null items.
    pub fn list_nn(name: impl Into<String>) -> Self {
        Self {
            non_null: true,
            list: true,
            ..Self::named(name)
        }
    }
}

impl fmt::Display for TypeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bang = if self.non_null { "!" } else { "" };
        if self.list {
            write!(f, "[{}!]{}", self.name, bang)
        } else {
            write!(f, "{}{}", self.name, bang)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDefinition {
    pub name: String,
    /// Backing column.
    pub column: String,
    pub scalar: GraphQlScalar,
    pub ty: TypeExpr,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectTypeDefinition {
    pub name: String,
    pub table_name: String,
    pub description: Option<String>,
    pub fields: Vec<FieldDefinition>,
}

impl ObjectTypeDefinition {
    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InputTypeDefinition {
    pub name: String,
    pub fields: Vec<FieldDefinition>,
}

impl InputTypeDefinition {
    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
pub enum RootKind {
    List,
    Get,
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArgumentDefinition {
    pub name: String,
    pub ty: TypeExpr,
    /// Key column the argument addresses, if any.
    pub column: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RootFieldDefinition {
    pub name: String,
    pub kind: RootKind,
    pub arguments: Vec<ArgumentDefinition>,
    pub returns: TypeExpr,
}

/// Everything generated for one table.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableTypes {
    #[serde(skip)]
    pub descriptor: TableDescriptor,
    pub object: ObjectTypeDefinition,
    pub create_input: InputTypeDefinition,
    /// Absent when every column is a key or auto-generated.
    pub update_input: Option<InputTypeDefinition>,
    pub queries: Vec<RootFieldDefinition>,
    pub mutations: Vec<RootFieldDefinition>,
}

impl TableTypes {
    pub fn type_name(&self) -> &str {
        &self.object.name
    }

    pub fn root(&self, kind: RootKind) -> Option<&RootFieldDefinition> {
        self.queries.iter().chain(&self.mutations).find(|f| f.kind == kind)
    }
}

fn field_for(col: &ColumnDescriptor, non_null: bool) -> FieldDefinition {
    let scalar = GraphQlScalar::for_column(col);
    FieldDefinition {
        name: col.field_name(),
        column: col.name.clone(),
        scalar,
        ty: if non_null {
            TypeExpr::named_nn(scalar.to_string())
        } else {
            TypeExpr::named(scalar.to_string())
        },
        description: col.comment.clone(),
    }
}

fn key_arguments(table: &TableDescriptor) -> Vec<ArgumentDefinition> {
    let keys = table.key_columns();
    if let [only] = keys.as_slice() {
        return vec![ArgumentDefinition {
            name: "id".to_string(),
            ty: TypeExpr::named_nn(GraphQlScalar::ID.to_string()),
            column: Some(only.name.clone()),
        }];
    }
    keys.iter()
        .map(|c| ArgumentDefinition {
            name: c.field_name(),
            ty: TypeExpr::named_nn(GraphQlScalar::for_column(c).to_string()),
            column: Some(c.name.clone()),
        })
        .collect()
}

fn plain_argument(name: &str, ty: TypeExpr) -> ArgumentDefinition {
    ArgumentDefinition {
        name: name.to_string(),
        ty,
        column: None,
    }
}

/// Derives the object, input and root field definitions for a table.
///
/// Input nullability:
/// - `Create<T>Input` omits auto-increment columns. A field is non-null only when
///   the column is NOT NULL with no default value.
/// - `Update<T>Input` omits key and auto-increment columns. Every field is
///   nullable so callers send only the columns they change. It is not emitted
///   when no such column remains.
pub fn table_types(table: &TableDescriptor) -> Result<TableTypes, ApiError> {
    if !table.has_primary_key() {
        return Err(ApiError::Validation(format!("Table '{}' has no primary key", table.name)));
    }
    let type_name = table.type_name();
    if type_name.is_empty() || RESERVED_TYPES.contains(&type_name.as_str()) || type_name.starts_with("__") {
        return Err(ApiError::Conflict(format!(
            "Table '{}' maps to reserved GraphQL type '{}'",
            table.name, type_name
        )));
    }
    let lower = naming::uncapitalize(&type_name);

    let object = ObjectTypeDefinition {
        name: type_name.clone(),
        table_name: table.name.clone(),
        description: table.comment.clone(),
        fields: table.columns.iter().map(|c| field_for(c, !c.nullable)).collect(),
    };

    let create_input = InputTypeDefinition {
        name: format!("Create{}Input", type_name),
        fields: table
            .columns
            .iter()
            .filter(|c| !c.is_auto_increment)
            // non-null iff NOT NULL without a default
            .map(|c| field_for(c, c.is_required_on_create()))
            .collect(),
    };

    let update_fields: Vec<FieldDefinition> = table
        .columns
        .iter()
        .filter(|c| !c.is_auto_increment && !c.is_primary_key)
        // partial updates: always nullable
        .map(|c| field_for(c, false))
        .collect();
    let update_input = (!update_fields.is_empty()).then(|| InputTypeDefinition {
        name: format!("Update{}Input", type_name),
        fields: update_fields,
    });

    let keys = key_arguments(table);
    let queries = vec![
        RootFieldDefinition {
            name: format!("{}List", lower),
            kind: RootKind::List,
            arguments: vec![
                plain_argument("page", TypeExpr::named("Int")),
                plain_argument("size", TypeExpr::named("Int")),
                plain_argument("orderBy", TypeExpr::named("String")),
                plain_argument("order", TypeExpr::named("String")),
            ],
            returns: TypeExpr::list_nn(&type_name),
        },
        RootFieldDefinition {
            name: lower.clone(),
            kind: RootKind::Get,
            arguments: keys.clone(),
            returns: TypeExpr::named(&type_name),
        },
    ];

    let mut mutations = vec![RootFieldDefinition {
        name: format!("create{}", type_name),
        kind: RootKind::Create,
        arguments: vec![plain_argument("input", TypeExpr::named_nn(&create_input.name))],
        returns: TypeExpr::named(&type_name),
    }];
    if let Some(update) = &update_input {
        let mut arguments = keys.clone();
        arguments.push(plain_argument("input", TypeExpr::named_nn(&update.name)));
        mutations.push(RootFieldDefinition {
            name: format!("update{}", type_name),
            kind: RootKind::Update,
            arguments,
            returns: TypeExpr::named_nn("Boolean"),
        });
    }
    mutations.push(RootFieldDefinition {
        name: format!("delete{}", type_name),
        kind: RootKind::Delete,
        arguments: keys,
        returns: TypeExpr::named_nn("Boolean"),
    });

    Ok(TableTypes {
        descriptor: table.clone(),
        object,
        create_input,
        update_input,
        queries,
        mutations,
    })
}

#[derive(Default)]
struct DatasourceTypes {
    /// Keyed by type name.
    tables: BTreeMap<String, Arc<TableTypes>>,
    sdl: Option<Arc<String>>,
    executable: Option<async_graphql::dynamic::Schema>,
}

/// Per-datasource registry of generated GraphQL definitions.
///
/// Rendered SDL and the compiled executable schema are derived caches; any
/// registration change for a datasource drops them before returning.
#[derive(Default)]
pub struct SchemaBuilder {
    inner: RwLock<HashMap<DatasourceId, DatasourceTypes>>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the types for `table`. A type name already owned by
    /// another table of the datasource is a conflict.
    pub fn register_table(&self, table: &TableDescriptor) -> Result<Arc<TableTypes>, ApiError> {
        let types = Arc::new(table_types(table)?);
        let ds = table.datasource_id;
        let mut inner = self.inner.write();
        let entry = inner.entry(ds).or_default();
        if let Some(existing) = entry.tables.get(types.type_name()) {
            if existing.object.table_name != table.name {
                return Err(ApiError::Conflict(format!(
                    "GraphQL type '{}' is already generated for table '{}'",
                    types.type_name(),
                    existing.object.table_name
                )));
            }
        }
        entry.tables.insert(types.type_name().to_string(), types.clone());
        Self::invalidate(entry, ds);
        tracing::info!("Registered GraphQL type {} for {}:{}", types.type_name(), ds, table.name);
        Ok(types)
    }

    pub fn unregister_table(&self, ds: DatasourceId, table: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(entry) = inner.get_mut(&ds) else {
            return false;
        };
        let before = entry.tables.len();
        entry.tables.retain(|_, t| t.object.table_name != table);
        let removed = entry.tables.len() != before;
        if removed {
            Self::invalidate(entry, ds);
            tracing::info!("Unregistered GraphQL type for {}:{}", ds, table);
        }
        removed
    }

    fn invalidate(entry: &mut DatasourceTypes, ds: DatasourceId) {
        if entry.sdl.take().is_some() | entry.executable.take().is_some() {
            tracing::debug!("Dropped cached GraphQL schema of datasource {}", ds);
        }
    }

    /// Drops the derived caches of a datasource.
    pub fn clear_cache(&self, ds: DatasourceId) {
        if let Some(entry) = self.inner.write().get_mut(&ds) {
            Self::invalidate(entry, ds);
        }
    }

    pub fn contains_type(&self, ds: DatasourceId, type_name: &str) -> bool {
        self.inner
            .read()
            .get(&ds)
            .is_some_and(|e| e.tables.contains_key(type_name))
    }

    pub fn type_for_table(&self, ds: DatasourceId, table: &str) -> Option<Arc<TableTypes>> {
        self.inner
            .read()
            .get(&ds)
            .and_then(|e| e.tables.values().find(|t| t.object.table_name == table).cloned())
    }

    /// Owner of `type_name` in a datasource.
    pub fn type_owner(&self, ds: DatasourceId, type_name: &str) -> Option<String> {
        self.inner
            .read()
            .get(&ds)
            .and_then(|e| e.tables.get(type_name).map(|t| t.object.table_name.clone()))
    }

    pub fn tables(&self, ds: DatasourceId) -> Vec<Arc<TableTypes>> {
        self.inner
            .read()
            .get(&ds)
            .map(|e| e.tables.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn sdl(&self, ds: DatasourceId) -> Arc<String> {
        if let Some(cached) = self.inner.read().get(&ds).and_then(|e| e.sdl.clone()) {
            return cached;
        }
        let tables = self.tables(ds);
        let rendered = Arc::new(render_sdl(&tables));
        let mut inner = self.inner.write();
        let entry = inner.entry(ds).or_default();
        // A registration may have landed since the read; only cache a render
        // that still matches.
        if entry.tables.values().map(Arc::as_ptr).eq(tables.iter().map(Arc::as_ptr)) {
            entry.sdl = Some(rendered.clone());
        }
        rendered
    }

    /// Returns the compiled schema, building it with `compile` on a miss.
    pub fn executable<F>(&self, ds: DatasourceId, compile: F) -> Result<async_graphql::dynamic::Schema, ApiError>
    where
        F: FnOnce(&[Arc<TableTypes>]) -> Result<async_graphql::dynamic::Schema, ApiError>,
    {
        if let Some(cached) = self.inner.read().get(&ds).and_then(|e| e.executable.clone()) {
            return Ok(cached);
        }
        let tables = self.tables(ds);
        let schema = compile(&tables)?;
        let mut inner = self.inner.write();
        let entry = inner.entry(ds).or_default();
        if entry.tables.values().map(Arc::as_ptr).eq(tables.iter().map(Arc::as_ptr)) {
            entry.executable = Some(schema.clone());
        }
        Ok(schema)
    }

    pub fn is_cached(&self, ds: DatasourceId) -> bool {
        self.inner
            .read()
            .get(&ds)
            .is_some_and(|e| e.sdl.is_some() || e.executable.is_some())
    }
}

fn description(out: &mut String, indent: &str, text: &Option<String>) {
    if let Some(text) = text.as_deref().filter(|t| !t.is_empty()) {
        let _ = writeln!(out, "{}\"\"\"{}\"\"\"", indent, text.replace("\"\"\"", "\\\"\"\""));
    }
}

fn root_field(out: &mut String, f: &RootFieldDefinition) {
    let args: Vec<String> = f.arguments.iter().map(|a| format!("{}: {}", a.name, a.ty)).collect();
    if args.is_empty() {
        let _ = writeln!(out, "  {}: {}", f.name, f.returns);
    } else {
        let _ = writeln!(out, "  {}({}): {}", f.name, args.join(", "), f.returns);
    }
}

/// Renders the schema for a datasource in GraphQL SDL.
pub fn render_sdl(tables: &[Arc<TableTypes>]) -> String {
    let mut out = String::new();
    out.push_str("scalar Long\n\n");
    for t in tables {
        description(&mut out, "", &t.object.description);
        let _ = writeln!(out, "type {} {{", t.object.name);
        for f in &t.object.fields {
            description(&mut out, "  ", &f.description);
            let _ = writeln!(out, "  {}: {}", f.name, f.ty);
        }
        out.push_str("}\n\n");
        for input in std::iter::once(&t.create_input).chain(t.update_input.as_ref()) {
            let _ = writeln!(out, "input {} {{", input.name);
            for f in &input.fields {
                let _ = writeln!(out, "  {}: {}", f.name, f.ty);
            }
            out.push_str("}\n\n");
        }
    }
    out.push_str("type Query {\n  tables: [String!]!\n");
    for t in tables {
        for q in &t.queries {
            root_field(&mut out, q);
        }
    }
    out.push_str("}\n");
    if !tables.is_empty() {
        out.push_str("\ntype Mutation {\n");
        for t in tables {
            for m in &t.mutations {
                root_field(&mut out, m);
            }
        }
        out.push_str("}\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::fixtures::{order_line, user_info};

    #[test]
    fn user_info_types() {
        let t = table_types(&user_info()).unwrap();
        assert_eq!(t.type_name(), "UserInfo");
        assert_eq!(t.object.field("id").unwrap().ty.to_string(), "Long!");
        assert_eq!(t.object.field("userName").unwrap().ty.to_string(), "String!");
        assert_eq!(t.object.field("createdAt").unwrap().ty.to_string(), "String");

        assert_eq!(t.create_input.name, "CreateUserInfoInput");
        assert!(t.create_input.field("id").is_none());
        assert_eq!(t.create_input.field("userName").unwrap().ty.to_string(), "String!");
        assert!(t.create_input.field("createdAt").is_some());

        let update = t.update_input.as_ref().unwrap();
        assert_eq!(update.name, "UpdateUserInfoInput");
        assert!(update.field("id").is_none());
        assert!(update.fields.iter().all(|f| !f.ty.non_null));

        let names: Vec<&str> = t.queries.iter().chain(&t.mutations).map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["userInfoList", "userInfo", "createUserInfo", "updateUserInfo", "deleteUserInfo"]);
        assert_eq!(t.root(RootKind::Get).unwrap().arguments[0].name, "id");
        assert_eq!(t.root(RootKind::List).unwrap().returns.to_string(), "[UserInfo!]!");
    }

    #[test]
    fn defaulted_not_null_columns_are_optional_on_create() {
        let mut t = user_info();
        t.columns[2].nullable = false;
        t.columns[2].default_value = Some("now()".to_string());
        let types = table_types(&t).unwrap();
        assert_eq!(types.object.field("createdAt").unwrap().ty.to_string(), "String!");
        assert_eq!(types.create_input.field("createdAt").unwrap().ty.to_string(), "String");
        assert_eq!(types.create_input.field("userName").unwrap().ty.to_string(), "String!");
        let update = types.update_input.unwrap();
        assert_eq!(update.field("userName").unwrap().ty.to_string(), "String");
    }

    #[test]
    fn composite_keys_get_one_argument_each() {
        let t = table_types(&order_line()).unwrap();
        let args: Vec<String> = t
            .root(RootKind::Delete)
            .unwrap()
            .arguments
            .iter()
            .map(|a| format!("{}: {}", a.name, a.ty))
            .collect();
        assert_eq!(args, vec!["orderId: Int!", "lineNo: Int!"]);
    }

    #[test]
    fn key_only_table_has_no_update() {
        let mut t = order_line();
        t.columns.truncate(2);
        let types = table_types(&t).unwrap();
        assert!(types.update_input.is_none());
        assert!(types.root(RootKind::Update).is_none());
    }

    #[test]
    fn keyless_and_reserved_tables_are_refused() {
        let mut keyless = user_info();
        keyless.primary_keys.clear();
        keyless.columns[0].is_primary_key = false;
        assert!(matches!(table_types(&keyless), Err(ApiError::Validation(_))));

        let mut reserved = user_info();
        reserved.name = "query".into();
        assert!(matches!(table_types(&reserved), Err(ApiError::Conflict(_))));
    }

    #[test]
    fn registration_invalidates_cached_sdl() {
        let builder = SchemaBuilder::new();
        builder.register_table(&user_info()).unwrap();
        let first = builder.sdl(1);
        assert!(first.contains("type UserInfo {"));
        assert!(builder.is_cached(1));

        let mut changed = user_info();
        changed.columns.pop();
        builder.register_table(&changed).unwrap();
        assert!(!builder.is_cached(1));
        let second = builder.sdl(1);
        assert!(!second.contains("createdAt"));

        builder.register_table(&order_line()).unwrap();
        assert!(builder.sdl(1).contains("orderLineList(page: Int, size: Int, orderBy: String, order: String): [OrderLine!]!"));
        assert!(builder.unregister_table(1, "order_line"));
        assert!(!builder.contains_type(1, "OrderLine"));
        assert!(!builder.unregister_table(1, "order_line"));
    }

    #[test]
    fn type_name_collision_is_conflict() {
        let builder = SchemaBuilder::new();
        builder.register_table(&user_info()).unwrap();
        let mut twin = user_info();
        twin.name = "UserInfo".into();
        assert!(matches!(builder.register_table(&twin), Err(ApiError::Conflict(_))));
        assert_eq!(builder.type_owner(1, "UserInfo").as_deref(), Some("user_info"));
    }

    #[test]
    fn digit_suffixed_columns_stay_distinct() {
        let mut t = user_info();
        t.columns.push(crate::meta::fixtures::column("address_1", "text", CanonicalType::String, 4));
        t.columns.push(crate::meta::fixtures::column("address1", "text", CanonicalType::String, 5));
        let types = table_types(&t).unwrap();
        assert_eq!(types.object.field("address_1").unwrap().column, "address_1");
        assert_eq!(types.object.field("address1").unwrap().column, "address1");
        let names: std::collections::HashSet<&str> = types.object.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names.len(), types.object.fields.len());
    }

    #[test]
    fn empty_datasource_sdl_has_query_root() {
        let builder = SchemaBuilder::new();
        let sdl = builder.sdl(7);
        assert!(sdl.contains("type Query {\n  tables: [String!]!\n}"));
        assert!(!sdl.contains("Mutation"));
    }
}
