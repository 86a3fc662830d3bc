//! Generic dispatcher behind every generated REST path.
//!
//! Paths are looked up in the route registry on each request:
//!
//! | path                   | methods                       |
//! |------------------------|-------------------------------|
//! | `{resource}`           | GET (list, `?id=`), POST, PUT, DELETE |
//! | `{resource}/{id}`      | GET, PUT, DELETE              |
//! | `{resource}/schema`    | GET                           |
//! | `{resource}/count`     | GET                           |
//! | `{resource}/batch`     | POST                          |

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{RawQuery, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::conf::DatasourceId;
use crate::db::{JsonRow, Operation, QueryResult, Record, SortOrder};
use crate::errors::ApiError;
use crate::gateway::Gateway;
use crate::graphql::exec::DEFAULT_PAGE_SIZE;
use crate::meta::{ColumnDescriptor, TableDescriptor};
use crate::naming;
use crate::response::Envelope;
use crate::routes::{RouteBinding, TABLE_METHODS};
use crate::service::unexpected;
use crate::state::TableKey;

enum Target {
    Collection,
    Item(String),
    Schema,
    Count,
    Batch,
}

#[derive(Debug, Default)]
struct Params {
    id: Option<String>,
    page: Option<u32>,
    size: Option<u32>,
    limit: Option<u32>,
    order_by: Option<String>,
    order: Option<String>,
    expand: Vec<String>,
    filters: Record,
}

impl Params {
    fn parse(query: Option<&str>) -> Result<Params, ApiError> {
        let mut params = Params::default();
        for (k, v) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
            match k.as_ref() {
                "id" => params.id = Some(v.into_owned()),
                "page" => params.page = Some(number(&k, &v)?),
                "size" => params.size = Some(number(&k, &v)?),
                "limit" => params.limit = Some(number(&k, &v)?),
                "orderBy" | "order_by" => params.order_by = Some(v.into_owned()),
                "order" => params.order = Some(v.into_owned()),
                "expand" => params.expand.extend(
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string),
                ),
                _ => {
                    params.filters.insert(k.into_owned(), Value::String(v.into_owned()));
                }
            }
        }
        Ok(params)
    }

    fn is_paginated(&self) -> bool {
        self.page.is_some() || self.size.is_some() || self.order_by.is_some()
    }
}

fn number(key: &str, raw: &str) -> Result<u32, ApiError> {
    raw.trim()
        .parse()
        .map_err(|_| ApiError::Validation(format!("'{}' must be a non-negative integer", key)))
}

/// Decodes one percent-encoded path segment. `+` is literal in a path.
fn decode_segment(segment: &str) -> String {
    percent_encoding::percent_decode_str(segment)
        .decode_utf8_lossy()
        .into_owned()
}

fn locate(gw: &Gateway, path: &str) -> Option<(Arc<RouteBinding>, Target)> {
    let routes = gw.orchestrator().routes();
    if let Some(binding) = routes.resolve(path) {
        return Some((binding, Target::Collection));
    }
    let (parent, last) = path.trim_end_matches('/').rsplit_once('/')?;
    let binding = routes.resolve(parent)?;
    let target = match last {
        "schema" => Target::Schema,
        "count" => Target::Count,
        "batch" => Target::Batch,
        id => Target::Item(decode_segment(id)),
    };
    Some((binding, target))
}

fn json_body(body: &Bytes) -> Result<Value, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_slice(body)?)
}

fn object_body(body: &Bytes) -> Result<Record, ApiError> {
    match json_body(body)? {
        Value::Object(map) => Ok(map),
        _ => Err(ApiError::Validation("Request body must be a JSON object".into())),
    }
}

fn method_not_allowed(method: &Method, path: &str) -> Response {
    Envelope::<()>::failure(
        StatusCode::METHOD_NOT_ALLOWED,
        format!("{} is not supported on {}", method, path),
    )
    .into_response()
}

pub async fn dispatch(
    State(gw): State<Gateway>,
    method: Method,
    uri: Uri,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Response, ApiError> {
    let path = uri.path();
    let Some((binding, target)) = locate(&gw, path) else {
        return Err(ApiError::NotFound(format!("No API at {}", path)));
    };
    if !TABLE_METHODS.contains(&method.as_str()) {
        return Ok(method_not_allowed(&method, path));
    }

    let table = &binding.handler.descriptor;
    let ds = binding.handler.datasource_id;
    let params = Params::parse(query.as_deref())?;
    let rest = Rest { gw: &gw, ds, table };

    match (target, &method) {
        (Target::Collection, &Method::GET) => match params.id.clone() {
            Some(id) => rest.get_one(Value::String(id), &params.expand).await,
            None => rest.list(params).await,
        },
        (Target::Item(id), &Method::GET) => rest.get_one(Value::String(id), &params.expand).await,
        (Target::Collection, &Method::POST) => rest.create(object_body(&body)?).await,
        (Target::Collection, &Method::PUT) => rest.update(params.id.map(Value::String), object_body(&body)?).await,
        (Target::Item(id), &Method::PUT) => rest.update(Some(Value::String(id)), object_body(&body)?).await,
        (Target::Collection, &Method::DELETE) => rest.delete(params.id.map(Value::String), json_body(&body)?).await,
        (Target::Item(id), &Method::DELETE) => rest.delete(Some(Value::String(id)), Value::Null).await,
        (Target::Schema, &Method::GET) => Ok(Envelope::ok(table.clone()).into_response()),
        (Target::Count, &Method::GET) => rest.count(params.filters).await,
        (Target::Batch, &Method::POST) => rest.batch(serde_json::from_value(json_body(&body)?)?).await,
        _ => Ok(method_not_allowed(&method, path)),
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum BatchOperation {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    operation: BatchOperation,
    #[serde(default)]
    data: Vec<Value>,
}

/// Renames column keys to field names.
fn to_fields(table: &TableDescriptor, row: JsonRow) -> JsonRow {
    row.into_iter()
        .map(|(k, v)| {
            let name = table
                .column(&k)
                .map(ColumnDescriptor::field_name)
                .unwrap_or_else(|| naming::to_field_name(&k));
            (name, v)
        })
        .collect()
}

/// Field an expanded reference is attached under: `userId` -> `user`.
fn expansion_field(col: &ColumnDescriptor) -> String {
    let field = col.field_name();
    match field.strip_suffix("Id") {
        Some(stem) if !stem.is_empty() => stem.to_string(),
        _ => format!("{}Ref", field),
    }
}

/// Pulls the key fields out of `values`. A single-column key comes back as a
/// scalar, a composite key as an object.
fn take_key(table: &TableDescriptor, values: &mut Record) -> Option<Value> {
    let mut key = Map::new();
    for col in table.key_columns() {
        let found = values
            .remove(&col.field_name())
            .or_else(|| values.remove(&col.name));
        if let Some(v) = found {
            key.insert(col.field_name(), v);
        }
    }
    if key.is_empty() {
        return None;
    }
    if table.primary_keys.len() == 1 {
        return key.into_iter().next().map(|(_, v)| v);
    }
    Some(Value::Object(key))
}

fn key_of(table: &TableDescriptor, item: Value) -> Value {
    match item {
        Value::Object(mut map) => {
            let key = take_key(table, &mut map);
            match key {
                Some(k) => k,
                None => map.remove("id").unwrap_or(Value::Null),
            }
        }
        scalar => scalar,
    }
}

struct Rest<'a> {
    gw: &'a Gateway,
    ds: DatasourceId,
    table: &'a TableDescriptor,
}

impl Rest<'_> {
    async fn run(&self, op: Operation) -> Result<QueryResult, ApiError> {
        self.gw.service().run(self.ds, self.table, op).await
    }

    async fn rows(&self, op: Operation) -> Result<Vec<JsonRow>, ApiError> {
        match self.run(op).await? {
            QueryResult::Rows(rows) => Ok(rows),
            other => Err(unexpected(other)),
        }
    }

    async fn total(&self, filters: Record) -> Result<u64, ApiError> {
        match self.run(Operation::CountByFilter { filters }).await? {
            QueryResult::Count(n) => Ok(n),
            other => Err(unexpected(other)),
        }
    }

    async fn affected(&self, op: Operation) -> Result<u64, ApiError> {
        match self.run(op).await? {
            QueryResult::Affected(outcome) => Ok(outcome.rows_affected),
            other => Err(unexpected(other)),
        }
    }

    /// Single-hop expansion of foreign keys whose target table is served.
    async fn expand(&self, rows: &mut [JsonRow], names: &[String]) -> Result<(), ApiError> {
        for name in names {
            let col = self.table.resolve_column(name)?;
            let fk = self
                .table
                .foreign_keys
                .iter()
                .find(|fk| fk.source_column == col.name)
                .ok_or_else(|| ApiError::Validation(format!("'{}' is not a foreign key", name)))?;
            let target = self
                .gw
                .orchestrator()
                .routes()
                .get(&TableKey::new(self.ds, &fk.target_table))
                .ok_or_else(|| {
                    ApiError::Validation(format!("Table '{}' has no generated API to expand into", fk.target_table))
                })?;
            let target_table = &target.handler.descriptor;
            let slot = expansion_field(col);

            let mut seen: HashMap<String, Value> = HashMap::new();
            for row in rows.iter_mut() {
                let Some(value) = row.get(&col.name).filter(|v| !v.is_null()).cloned() else {
                    row.insert(slot.clone(), Value::Null);
                    continue;
                };
                let cache_key = value.to_string();
                if !seen.contains_key(&cache_key) {
                    let mut filters = Record::new();
                    filters.insert(fk.target_column.clone(), value);
                    let op = Operation::List {
                        filters,
                        limit: Some(1),
                    };
                    let found = match self.gw.service().run(self.ds, target_table, op).await? {
                        QueryResult::Rows(mut found) => found.pop(),
                        other => return Err(unexpected(other)),
                    };
                    let found = found
                        .map(|r| Value::Object(to_fields(target_table, r)))
                        .unwrap_or(Value::Null);
                    seen.insert(cache_key.clone(), found);
                }
                let expanded = seen.get(&cache_key).cloned().unwrap_or(Value::Null);
                row.insert(slot.clone(), expanded);
            }
        }
        Ok(())
    }

    async fn present(&self, mut rows: Vec<JsonRow>, expand: &[String]) -> Result<Vec<JsonRow>, ApiError> {
        if !expand.is_empty() {
            self.expand(&mut rows, expand).await?;
        }
        Ok(rows.into_iter().map(|r| to_fields(self.table, r)).collect())
    }

    async fn list(&self, params: Params) -> Result<Response, ApiError> {
        if !params.is_paginated() {
            let rows = self
                .rows(Operation::List {
                    filters: params.filters,
                    limit: params.limit,
                })
                .await?;
            return Ok(Envelope::ok(self.present(rows, &params.expand).await?).into_response());
        }

        let page = params.page.unwrap_or(1);
        let size = params.size.unwrap_or(DEFAULT_PAGE_SIZE);
        let order = params.order.as_deref().map(SortOrder::parse).transpose()?.unwrap_or_default();
        let op = Operation::PaginatedList {
            filters: params.filters.clone(),
            page,
            size,
            order_by: params.order_by,
            order,
        };
        let rows = self.rows(op).await?;
        let total = self.total(params.filters).await?;
        let records = self.present(rows, &params.expand).await?;
        Ok(Envelope::ok(json!({
            "records": records,
            "total": total,
            "page": page,
            "size": size,
        }))
        .into_response())
    }

    async fn get_one(&self, key: Value, expand: &[String]) -> Result<Response, ApiError> {
        let row = match self.run(Operation::GetById { key: key.clone() }).await? {
            QueryResult::Row(row) => row,
            other => return Err(unexpected(other)),
        };
        let Some(row) = row else {
            return Err(ApiError::NotFound(format!(
                "No row in '{}' with key {}",
                self.table.name, key
            )));
        };
        let mut rows = self.present(vec![row], expand).await?;
        Ok(Envelope::ok(rows.pop()).into_response())
    }

    async fn create(&self, values: Record) -> Result<Response, ApiError> {
        let row = self.gw.service().create(self.ds, self.table, values).await?;
        tracing::debug!("Created row in {}:{}", self.ds, self.table.name);
        Ok(Envelope::created(to_fields(self.table, row)).into_response())
    }

    async fn update(&self, key: Option<Value>, mut values: Record) -> Result<Response, ApiError> {
        let from_body = take_key(self.table, &mut values);
        let key = key
            .or(from_body)
            .ok_or_else(|| ApiError::Validation("Missing id".into()))?;
        let changed = self
            .affected(Operation::Update {
                key: key.clone(),
                values,
            })
            .await?;
        if changed == 0 {
            return Err(ApiError::NotFound(format!(
                "No row in '{}' with key {}",
                self.table.name, key
            )));
        }
        self.get_one(key, &[]).await
    }

    async fn delete(&self, key: Option<Value>, body: Value) -> Result<Response, ApiError> {
        let key = match key {
            Some(k) => k,
            None => key_of(self.table, body),
        };
        let removed = self.affected(Operation::Delete { key: key.clone() }).await?;
        if removed == 0 {
            return Err(ApiError::NotFound(format!(
                "No row in '{}' with key {}",
                self.table.name, key
            )));
        }
        Ok(Envelope::ok(json!({ "deleted": removed })).into_response())
    }

    async fn count(&self, filters: Record) -> Result<Response, ApiError> {
        let total = self.total(filters).await?;
        Ok(Envelope::ok(json!({ "total": total })).into_response())
    }

    async fn batch(&self, req: BatchRequest) -> Result<Response, ApiError> {
        let objects = |data: Vec<Value>| -> Result<Vec<Record>, ApiError> {
            data.into_iter()
                .map(|v| match v {
                    Value::Object(map) => Ok(map),
                    _ => Err(ApiError::Validation("Batch items must be JSON objects".into())),
                })
                .collect()
        };
        match req.operation {
            BatchOperation::Create => match self.run(Operation::BatchCreate { rows: objects(req.data)? }).await? {
                QueryResult::Rows(rows) => {
                    let affected = rows.len();
                    let records: Vec<JsonRow> = rows.into_iter().map(|r| to_fields(self.table, r)).collect();
                    Ok(Envelope::created(json!({
                        "operation": "create",
                        "affected": affected,
                        "records": records,
                    }))
                    .into_response())
                }
                QueryResult::Affected(outcome) => Ok(Envelope::created(json!({
                    "operation": "create",
                    "affected": outcome.rows_affected,
                }))
                .into_response()),
                other => Err(unexpected(other)),
            },
            BatchOperation::Update => {
                let affected = self.affected(Operation::BatchUpdate { rows: objects(req.data)? }).await?;
                Ok(Envelope::ok(json!({ "operation": "update", "affected": affected })).into_response())
            }
            BatchOperation::Delete => {
                let keys = req.data.into_iter().map(|item| key_of(self.table, item)).collect();
                let affected = self.affected(Operation::BatchDelete { keys }).await?;
                Ok(Envelope::ok(json!({ "operation": "delete", "affected": affected })).into_response())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::fixtures;

    #[test]
    fn query_params_split_reserved_keys() {
        let p = Params::parse(Some("page=2&size=5&orderBy=userName&userName=bob&expand=a,%20b")).unwrap();
        assert_eq!(p.page, Some(2));
        assert_eq!(p.size, Some(5));
        assert_eq!(p.order_by.as_deref(), Some("userName"));
        assert_eq!(p.expand, vec!["a", "b"]);
        assert_eq!(p.filters.get("userName"), Some(&Value::String("bob".into())));
        assert!(p.is_paginated());
        assert!(matches!(Params::parse(Some("page=x")), Err(ApiError::Validation(_))));
        assert!(!Params::parse(None).unwrap().is_paginated());
    }

    #[test]
    fn keys_come_out_of_bodies() {
        let t = fixtures::user_info();
        let mut values = serde_json::from_value::<Record>(json!({"id": 3, "userName": "x"})).unwrap();
        assert_eq!(take_key(&t, &mut values), Some(json!(3)));
        assert!(!values.contains_key("id"));

        let lines = fixtures::order_line();
        let key = key_of(&lines, json!({"orderId": 1, "lineNo": 2, "sku": "a"}));
        assert_eq!(key, json!({"orderId": 1, "lineNo": 2}));
        assert_eq!(key_of(&t, json!(9)), json!(9));
    }

    #[test]
    fn rows_use_field_names() {
        let t = fixtures::user_info();
        let row = to_fields(&t, crate::testing::row(json!({"user_name": "a", "created_at": null})));
        assert!(row.contains_key("userName"));
        assert!(row.contains_key("createdAt"));
    }

    #[test]
    fn path_segments_decode() {
        assert_eq!(decode_segment("a%20b"), "a b");
        assert_eq!(decode_segment("42"), "42");
        assert_eq!(decode_segment("a+b"), "a+b");
        assert_eq!(decode_segment("a%2Bb"), "a+b");
        assert_eq!(decode_segment("k=v&x"), "k=v&x");
    }
}
