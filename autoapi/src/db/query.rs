//! Table-agnostic statement builder.
//!
//! Identifiers are read from the [`TableDescriptor`] and quoted; caller input
//! only ever selects among them. Every value is a bound parameter.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::Display;

use super::value::SqlValue;
use crate::dialect::Dialect;
use crate::errors::ApiError;
use crate::meta::{ColumnDescriptor, TableDescriptor};

pub type Record = Map<String, Value>;

pub const DEFAULT_ROW_CAP: u32 = 100;
pub const MAX_BATCH_ROWS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn parse(raw: &str) -> Result<SortOrder, ApiError> {
        match raw.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            _ => Err(ApiError::Validation(format!("Invalid sort order '{}'", raw))),
        }
    }

    fn keyword(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    List { filters: Record, limit: Option<u32> },
    PaginatedList {
        filters: Record,
        page: u32,
        size: u32,
        order_by: Option<String>,
        order: SortOrder,
    },
    CountByFilter { filters: Record },
    /// `key` is a scalar for single-column keys or an object naming every key column.
    GetById { key: Value },
    Create { values: Record },
    Update { key: Value, values: Record },
    Delete { key: Value },
    BatchCreate { rows: Vec<Record> },
    /// Each row carries its key fields alongside the new values.
    BatchUpdate { rows: Vec<Record> },
    BatchDelete { keys: Vec<Value> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum OperationKind {
    List,
    PaginatedList,
    CountByFilter,
    GetById,
    Create,
    Update,
    Delete,
    BatchCreate,
    BatchUpdate,
    BatchDelete,
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::List { .. } => OperationKind::List,
            Operation::PaginatedList { .. } => OperationKind::PaginatedList,
            Operation::CountByFilter { .. } => OperationKind::CountByFilter,
            Operation::GetById { .. } => OperationKind::GetById,
            Operation::Create { .. } => OperationKind::Create,
            Operation::Update { .. } => OperationKind::Update,
            Operation::Delete { .. } => OperationKind::Delete,
            Operation::BatchCreate { .. } => OperationKind::BatchCreate,
            Operation::BatchUpdate { .. } => OperationKind::BatchUpdate,
            Operation::BatchDelete { .. } => OperationKind::BatchDelete,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
    /// Output column names, in select order. Empty for plain DML.
    pub columns: Vec<String>,
}

/// How the executor should surface a plan's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
    Rows,
    Row,
    Count,
    Affected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub kind: OperationKind,
    pub statements: Vec<Statement>,
    pub output: Output,
}

struct SqlWriter {
    dialect: Dialect,
    sql: String,
    params: Vec<SqlValue>,
}

impl SqlWriter {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            sql: String::with_capacity(128),
            params: Vec::new(),
        }
    }

    fn push(&mut self, s: &str) -> &mut Self {
        self.sql.push_str(s);
        self
    }

    fn ident(&mut self, name: &str) -> &mut Self {
        let quoted = self.dialect.quote_ident(name);
        self.sql.push_str(&quoted);
        self
    }

    fn bind(&mut self, col: &ColumnDescriptor, value: SqlValue) -> &mut Self {
        self.params.push(value);
        let ph = self.dialect.placeholder(self.params.len(), Some(&col.native_type));
        self.sql.push_str(&ph);
        self
    }

    fn column_list(&mut self, cols: &[&ColumnDescriptor]) -> &mut Self {
        for (i, c) in cols.iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            self.ident(&c.name);
        }
        self
    }

    fn predicates(&mut self, preds: Vec<(&ColumnDescriptor, SqlValue)>) -> &mut Self {
        for (i, (col, value)) in preds.into_iter().enumerate() {
            if i > 0 {
                self.push(" AND ");
            }
            self.ident(&col.name);
            if matches!(value, SqlValue::Null(_)) {
                self.push(" IS NULL");
            } else {
                self.push(" = ").bind(col, value);
            }
        }
        self
    }

    fn finish(self, columns: Vec<String>) -> Statement {
        Statement {
            sql: self.sql,
            params: self.params,
            columns,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueryBuilder {
    dialect: Dialect,
    row_cap: u32,
}

impl QueryBuilder {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            row_cap: DEFAULT_ROW_CAP,
        }
    }

    pub fn with_row_cap(mut self, cap: u32) -> Self {
        self.row_cap = cap.max(1);
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Rejects tables the builder cannot address by key.
    pub fn validate(&self, table: &TableDescriptor) -> Result<(), ApiError> {
        if !table.has_primary_key() {
            return Err(ApiError::Validation(format!(
                "Table '{}' has no primary key",
                table.name
            )));
        }
        if table.key_columns().len() != table.primary_keys.len() {
            return Err(ApiError::Validation(format!(
                "Table '{}' hides part of its primary key",
                table.name
            )));
        }
        Ok(())
    }

    pub fn build(&self, table: &TableDescriptor, op: &Operation) -> Result<QueryPlan, ApiError> {
        let kind = op.kind();
        let (statements, output) = match op {
            Operation::List { filters, limit } => {
                let limit = limit.unwrap_or(self.row_cap).clamp(1, self.row_cap);
                (vec![self.select(table, filters, None, SortOrder::Asc, limit, 0)?], Output::Rows)
            }
            Operation::PaginatedList {
                filters,
                page,
                size,
                order_by,
                order,
            } => {
                if *page < 1 {
                    return Err(ApiError::Validation("page must be >= 1".into()));
                }
                if *size < 1 || *size > self.row_cap {
                    return Err(ApiError::Validation(format!(
                        "size must be between 1 and {}",
                        self.row_cap
                    )));
                }
                let order_col = match order_by {
                    Some(key) => Some(table.resolve_column(key)?),
                    None => None,
                };
                let offset = u64::from(*page - 1) * u64::from(*size);
                (
                    vec![self.select(table, filters, order_col, *order, *size, offset)?],
                    Output::Rows,
                )
            }
            Operation::CountByFilter { filters } => {
                let preds = self.filters(table, filters)?;
                let mut w = SqlWriter::new(self.dialect);
                w.push("SELECT COUNT(*) AS ").ident("total").push(" FROM ").ident(&table.name);
                if !preds.is_empty() {
                    w.push(" WHERE ").predicates(preds);
                }
                (vec![w.finish(vec!["total".to_string()])], Output::Count)
            }
            Operation::GetById { key } => {
                self.validate(table)?;
                let preds = self.key_predicates(table, key)?;
                let cols: Vec<&ColumnDescriptor> = table.columns.iter().collect();
                let mut w = SqlWriter::new(self.dialect);
                w.push("SELECT ").column_list(&cols).push(" FROM ").ident(&table.name);
                w.push(" WHERE ").predicates(preds).push(" LIMIT 1");
                (vec![w.finish(column_names(&cols))], Output::Row)
            }
            Operation::Create { values } => {
                let stmt = self.insert(table, std::slice::from_ref(values))?;
                let output = if self.dialect.supports_returning() {
                    Output::Row
                } else {
                    Output::Affected
                };
                (vec![stmt], output)
            }
            Operation::BatchCreate { rows } => {
                check_batch(rows.len())?;
                let stmt = self.insert(table, rows)?;
                let output = if self.dialect.supports_returning() {
                    Output::Rows
                } else {
                    Output::Affected
                };
                (vec![stmt], output)
            }
            Operation::Update { key, values } => {
                (vec![self.update(table, key, values)?], Output::Affected)
            }
            Operation::BatchUpdate { rows } => {
                check_batch(rows.len())?;
                let mut statements = Vec::with_capacity(rows.len());
                for row in rows {
                    let (key, values) = split_key(table, row)?;
                    statements.push(self.update(table, &key, &values)?);
                }
                (statements, Output::Affected)
            }
            Operation::Delete { key } => {
                self.validate(table)?;
                let preds = self.key_predicates(table, key)?;
                let mut w = SqlWriter::new(self.dialect);
                w.push("DELETE FROM ").ident(&table.name).push(" WHERE ").predicates(preds);
                (vec![w.finish(Vec::new())], Output::Affected)
            }
            Operation::BatchDelete { keys } => {
                check_batch(keys.len())?;
                (vec![self.delete_many(table, keys)?], Output::Affected)
            }
        };
        Ok(QueryPlan {
            kind,
            statements,
            output,
        })
    }

    fn select(
        &self,
        table: &TableDescriptor,
        filters: &Record,
        order_col: Option<&ColumnDescriptor>,
        order: SortOrder,
        limit: u32,
        offset: u64,
    ) -> Result<Statement, ApiError> {
        let preds = self.filters(table, filters)?;
        let cols: Vec<&ColumnDescriptor> = table.columns.iter().collect();
        let mut w = SqlWriter::new(self.dialect);
        w.push("SELECT ").column_list(&cols).push(" FROM ").ident(&table.name);
        if !preds.is_empty() {
            w.push(" WHERE ").predicates(preds);
        }
        let order_cols: Vec<&ColumnDescriptor> = match order_col {
            Some(c) => vec![c],
            None => table.key_columns(),
        };
        if !order_cols.is_empty() {
            w.push(" ORDER BY ");
            for (i, c) in order_cols.iter().enumerate() {
                if i > 0 {
                    w.push(", ");
                }
                w.ident(&c.name).push(" ").push(order.keyword());
            }
        }
        w.push(&format!(" LIMIT {}", limit));
        if offset > 0 {
            w.push(&format!(" OFFSET {}", offset));
        }
        Ok(w.finish(column_names(&cols)))
    }

    fn filters<'t>(
        &self,
        table: &'t TableDescriptor,
        filters: &Record,
    ) -> Result<Vec<(&'t ColumnDescriptor, SqlValue)>, ApiError> {
        filters
            .iter()
            .map(|(key, value)| {
                let col = table.resolve_column(key)?;
                let value = if value.is_null() {
                    SqlValue::Null(col.canonical_type)
                } else {
                    SqlValue::from_json(self.dialect, col, value)?
                };
                Ok((col, value))
            })
            .collect()
    }

    fn key_predicates<'t>(
        &self,
        table: &'t TableDescriptor,
        key: &Value,
    ) -> Result<Vec<(&'t ColumnDescriptor, SqlValue)>, ApiError> {
        let key_cols = table.key_columns();
        let mut preds = Vec::with_capacity(key_cols.len());
        match key {
            Value::Object(map) => {
                for col in key_cols {
                    let value = map
                        .get(&col.field_name())
                        .or_else(|| map.get(&col.name))
                        .filter(|v| !v.is_null())
                        .ok_or_else(|| {
                            ApiError::Validation(format!("Missing key field '{}'", col.field_name()))
                        })?;
                    preds.push((col, SqlValue::from_json(self.dialect, col, value)?));
                }
            }
            Value::Null => return Err(ApiError::Validation("Missing id".into())),
            scalar => {
                if key_cols.len() != 1 {
                    let names: Vec<String> = key_cols.iter().map(|c| c.field_name()).collect();
                    return Err(ApiError::Validation(format!(
                        "Table '{}' has a composite key; supply {}",
                        table.name,
                        names.join(", ")
                    )));
                }
                preds.push((key_cols[0], SqlValue::from_json(self.dialect, key_cols[0], scalar)?));
            }
        }
        Ok(preds)
    }

    fn insert(&self, table: &TableDescriptor, rows: &[Record]) -> Result<Statement, ApiError> {
        // Union of supplied writable columns, in table order.
        let mut resolved: Vec<Vec<(&ColumnDescriptor, &Value)>> = Vec::with_capacity(rows.len());
        for row in rows {
            let mut fields = Vec::with_capacity(row.len());
            for (key, value) in row {
                let col = table.resolve_column(key)?;
                if col.is_auto_increment {
                    continue;
                }
                fields.push((col, value));
            }
            for col in table.columns.iter().filter(|c| c.is_required_on_create()) {
                if !fields.iter().any(|(c, _)| c.name == col.name) {
                    return Err(ApiError::Validation(format!(
                        "Missing required field '{}'",
                        col.field_name()
                    )));
                }
            }
            resolved.push(fields);
        }
        let cols: Vec<&ColumnDescriptor> = table
            .columns
            .iter()
            .filter(|c| resolved.iter().any(|row| row.iter().any(|(rc, _)| rc.name == c.name)))
            .collect();

        let mut w = SqlWriter::new(self.dialect);
        w.push("INSERT INTO ").ident(&table.name);
        if cols.is_empty() {
            if rows.len() > 1 {
                return Err(ApiError::Validation("Batch rows carry no writable fields".into()));
            }
            match self.dialect {
                Dialect::Postgres => w.push(" DEFAULT VALUES"),
                Dialect::MySql => w.push(" () VALUES ()"),
            };
        } else {
            w.push(" (").column_list(&cols).push(") VALUES ");
            for (i, row) in resolved.iter().enumerate() {
                if i > 0 {
                    w.push(", ");
                }
                w.push("(");
                for (j, col) in cols.iter().enumerate() {
                    if j > 0 {
                        w.push(", ");
                    }
                    match row.iter().find(|(rc, _)| rc.name == col.name) {
                        Some((_, value)) => {
                            let v = SqlValue::from_json(self.dialect, col, value)?;
                            w.bind(col, v);
                        }
                        None => {
                            w.push("DEFAULT");
                        }
                    }
                }
                w.push(")");
            }
        }

        let returning: Vec<&ColumnDescriptor> = table.columns.iter().collect();
        if self.dialect.supports_returning() {
            w.push(" RETURNING ").column_list(&returning);
            Ok(w.finish(column_names(&returning)))
        } else {
            Ok(w.finish(Vec::new()))
        }
    }

    fn update(&self, table: &TableDescriptor, key: &Value, values: &Record) -> Result<Statement, ApiError> {
        self.validate(table)?;
        let preds = self.key_predicates(table, key)?;
        let mut sets = Vec::with_capacity(values.len());
        for (k, v) in values {
            let col = table.resolve_column(k)?;
            if col.is_primary_key || col.is_auto_increment {
                continue;
            }
            sets.push((col, SqlValue::from_json(self.dialect, col, v)?));
        }
        if sets.is_empty() {
            return Err(ApiError::Validation("No updatable fields supplied".into()));
        }
        let mut w = SqlWriter::new(self.dialect);
        w.push("UPDATE ").ident(&table.name).push(" SET ");
        for (i, (col, value)) in sets.into_iter().enumerate() {
            if i > 0 {
                w.push(", ");
            }
            w.ident(&col.name).push(" = ").bind(col, value);
        }
        w.push(" WHERE ").predicates(preds);
        Ok(w.finish(Vec::new()))
    }

    fn delete_many(&self, table: &TableDescriptor, keys: &[Value]) -> Result<Statement, ApiError> {
        self.validate(table)?;
        let key_cols = table.key_columns();
        let mut w = SqlWriter::new(self.dialect);
        w.push("DELETE FROM ").ident(&table.name).push(" WHERE ");
        if key_cols.len() == 1 {
            let col = key_cols[0];
            w.ident(&col.name).push(" IN (");
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    w.push(", ");
                }
                let mut preds = self.key_predicates(table, key)?;
                let (_, value) = preds.remove(0);
                w.bind(col, value);
            }
            w.push(")");
        } else {
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    w.push(" OR ");
                }
                let preds = self.key_predicates(table, key)?;
                w.push("(").predicates(preds).push(")");
            }
        }
        Ok(w.finish(Vec::new()))
    }
}

fn column_names(cols: &[&ColumnDescriptor]) -> Vec<String> {
    cols.iter().map(|c| c.name.clone()).collect()
}

fn check_batch(len: usize) -> Result<(), ApiError> {
    if len == 0 {
        return Err(ApiError::Validation("Batch is empty".into()));
    }
    if len > MAX_BATCH_ROWS {
        return Err(ApiError::Validation(format!(
            "Batch exceeds {} rows",
            MAX_BATCH_ROWS
        )));
    }
    Ok(())
}

/// Splits a batch-update row into its key object and the remaining values.
fn split_key(table: &TableDescriptor, row: &Record) -> Result<(Value, Record), ApiError> {
    let mut key = Map::new();
    let mut values = Map::new();
    for (k, v) in row {
        let col = table.resolve_column(k)?;
        if col.is_primary_key {
            key.insert(col.field_name(), v.clone());
        } else {
            values.insert(k.clone(), v.clone());
        }
    }
    Ok((Value::Object(key), values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::fixtures::{order_line, user_info};
    use serde_json::json;

    fn record(v: Value) -> Record {
        match v {
            Value::Object(m) => m,
            _ => Map::new(),
        }
    }

    #[test]
    fn list_is_capped_and_filtered() {
        let qb = QueryBuilder::new(Dialect::Postgres);
        let plan = qb
            .build(
                &user_info(),
                &Operation::List {
                    filters: record(json!({"userName": "ann"})),
                    limit: Some(5000),
                },
            )
            .unwrap();
        let stmt = &plan.statements[0];
        assert_eq!(
            stmt.sql,
            "SELECT \"id\", \"user_name\", \"created_at\" FROM \"user_info\" WHERE \"user_name\" = $1::character varying ORDER BY \"id\" ASC LIMIT 100"
        );
        assert_eq!(stmt.params, vec![SqlValue::Text("ann".into())]);
        assert_eq!(plan.output, Output::Rows);
    }

    #[test]
    fn injected_filter_keys_are_refused() {
        let qb = QueryBuilder::new(Dialect::MySql);
        let op = Operation::List {
            filters: record(json!({"id = 1 OR 1=1 --": "x"})),
            limit: None,
        };
        assert!(matches!(qb.build(&user_info(), &op), Err(ApiError::Security(_))));
        let op = Operation::List {
            filters: record(json!({"password": "x"})),
            limit: None,
        };
        assert!(matches!(qb.build(&user_info(), &op), Err(ApiError::Validation(_))));
    }

    #[test]
    fn paginated_list_validates_bounds_and_order() {
        let qb = QueryBuilder::new(Dialect::MySql);
        let page = |page, size, order_by: Option<&str>| Operation::PaginatedList {
            filters: Map::new(),
            page,
            size,
            order_by: order_by.map(str::to_string),
            order: SortOrder::Desc,
        };
        assert!(qb.build(&user_info(), &page(0, 10, None)).is_err());
        assert!(qb.build(&user_info(), &page(1, 0, None)).is_err());
        assert!(qb.build(&user_info(), &page(1, 101, None)).is_err());
        assert!(matches!(
            qb.build(&user_info(), &page(1, 10, Some("salary"))),
            Err(ApiError::Validation(_))
        ));
        let plan = qb.build(&user_info(), &page(3, 20, Some("createdAt"))).unwrap();
        assert_eq!(
            plan.statements[0].sql,
            "SELECT `id`, `user_name`, `created_at` FROM `user_info` ORDER BY `created_at` DESC LIMIT 20 OFFSET 40"
        );
    }

    #[test]
    fn create_skips_auto_increment_and_requires_fields() {
        let qb = QueryBuilder::new(Dialect::Postgres);
        let plan = qb
            .build(
                &user_info(),
                &Operation::Create {
                    values: record(json!({"id": 99, "userName": "ann"})),
                },
            )
            .unwrap();
        let stmt = &plan.statements[0];
        assert_eq!(
            stmt.sql,
            "INSERT INTO \"user_info\" (\"user_name\") VALUES ($1::character varying) RETURNING \"id\", \"user_name\", \"created_at\""
        );
        assert_eq!(plan.output, Output::Row);

        let missing = Operation::Create {
            values: record(json!({"createdAt": "2024-01-01 00:00:00"})),
        };
        assert!(matches!(qb.build(&user_info(), &missing), Err(ApiError::Validation(_))));
    }

    #[test]
    fn mysql_create_reports_affected() {
        let qb = QueryBuilder::new(Dialect::MySql);
        let plan = qb
            .build(
                &user_info(),
                &Operation::Create {
                    values: record(json!({"userName": "ann"})),
                },
            )
            .unwrap();
        assert_eq!(plan.statements[0].sql, "INSERT INTO `user_info` (`user_name`) VALUES (?)");
        assert_eq!(plan.output, Output::Affected);
    }

    #[test]
    fn update_excludes_keys_from_set() {
        let qb = QueryBuilder::new(Dialect::MySql);
        let plan = qb
            .build(
                &user_info(),
                &Operation::Update {
                    key: json!(7),
                    values: record(json!({"id": 8, "userName": "bob"})),
                },
            )
            .unwrap();
        let stmt = &plan.statements[0];
        assert_eq!(stmt.sql, "UPDATE `user_info` SET `user_name` = ? WHERE `id` = ?");
        assert_eq!(stmt.params, vec![SqlValue::Text("bob".into()), SqlValue::Int(7)]);

        let only_key = Operation::Update {
            key: json!(7),
            values: record(json!({"id": 8})),
        };
        assert!(qb.build(&user_info(), &only_key).is_err());
    }

    #[test]
    fn composite_keys_are_conjunctions() {
        let qb = QueryBuilder::new(Dialect::MySql);
        let plan = qb
            .build(
                &order_line(),
                &Operation::GetById {
                    key: json!({"orderId": 1, "lineNo": 2}),
                },
            )
            .unwrap();
        assert_eq!(
            plan.statements[0].sql,
            "SELECT `order_id`, `line_no`, `sku`, `qty` FROM `order_line` WHERE `order_id` = ? AND `line_no` = ? LIMIT 1"
        );
        assert!(qb
            .build(&order_line(), &Operation::Delete { key: json!(1) })
            .is_err());

        let plan = qb
            .build(
                &order_line(),
                &Operation::BatchDelete {
                    keys: vec![json!({"orderId": 1, "lineNo": 1}), json!({"order_id": 1, "line_no": 2})],
                },
            )
            .unwrap();
        assert_eq!(
            plan.statements[0].sql,
            "DELETE FROM `order_line` WHERE (`order_id` = ? AND `line_no` = ?) OR (`order_id` = ? AND `line_no` = ?)"
        );
        assert_eq!(plan.statements[0].params.len(), 4);
    }

    #[test]
    fn batch_operations() {
        let qb = QueryBuilder::new(Dialect::Postgres);
        let plan = qb
            .build(
                &user_info(),
                &Operation::BatchCreate {
                    rows: vec![
                        record(json!({"userName": "a"})),
                        record(json!({"userName": "b", "createdAt": "2024-01-01T00:00:00Z"})),
                    ],
                },
            )
            .unwrap();
        assert_eq!(
            plan.statements[0].sql,
            "INSERT INTO \"user_info\" (\"user_name\", \"created_at\") VALUES ($1::character varying, DEFAULT), ($2::character varying, $3::timestamp without time zone) RETURNING \"id\", \"user_name\", \"created_at\""
        );

        let plan = qb
            .build(
                &user_info(),
                &Operation::BatchUpdate {
                    rows: vec![record(json!({"id": 1, "userName": "a"})), record(json!({"id": 2, "userName": "b"}))],
                },
            )
            .unwrap();
        assert_eq!(plan.statements.len(), 2);
        assert_eq!(plan.output, Output::Affected);

        let plan = qb
            .build(&user_info(), &Operation::BatchDelete { keys: vec![json!(1), json!(2)] })
            .unwrap();
        assert_eq!(
            plan.statements[0].sql,
            "DELETE FROM \"user_info\" WHERE \"id\" IN ($1::bigint, $2::bigint)"
        );
        assert!(qb.build(&user_info(), &Operation::BatchDelete { keys: vec![] }).is_err());
    }

    #[test]
    fn count_and_null_filters() {
        let qb = QueryBuilder::new(Dialect::Postgres);
        let plan = qb
            .build(
                &user_info(),
                &Operation::CountByFilter {
                    filters: record(json!({"createdAt": null})),
                },
            )
            .unwrap();
        assert_eq!(
            plan.statements[0].sql,
            "SELECT COUNT(*) AS \"total\" FROM \"user_info\" WHERE \"created_at\" IS NULL"
        );
        assert_eq!(plan.output, Output::Count);
        assert!(plan.statements[0].params.is_empty());
    }

    #[test]
    fn tables_without_keys_are_rejected() {
        let mut t = user_info();
        t.primary_keys.clear();
        t.columns[0].is_primary_key = false;
        let qb = QueryBuilder::new(Dialect::Postgres);
        assert!(qb.validate(&t).is_err());
        assert!(qb.build(&t, &Operation::GetById { key: json!(1) }).is_err());
    }
}
