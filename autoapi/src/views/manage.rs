//! Static management endpoints: datasources, scanning, selection and
//! generation control.

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::conf::{DatasourceConf, DatasourceId};
use crate::dialect::Dialect;
use crate::errors::ApiError;
use crate::gateway::Gateway;
use crate::orchestrator::ApiStatus;
use crate::response::Envelope;
use crate::state::{GenerationState, GenerationStatus, SelectionPatch};

type Handled = Result<Response, ApiError>;

pub fn router() -> Router<Gateway> {
    Router::new()
        .route("/datasources", get(datasources).post(create_datasource))
        .route("/datasources/check-name", get(check_name))
        .route("/datasources/test", post(test_config))
        .route(
            "/datasources/{ds}",
            get(datasource).put(update_datasource).delete(remove_datasource),
        )
        .route("/datasources/{ds}/test", post(test_connection))
        .route("/datasources/{ds}/refresh", post(refresh_pool))
        .route("/datasources/{ds}/close", post(close_pool))
        .route("/datasources/{ds}/status", get(pool_status))
        .route("/tables/{ds}/scan", get(scan))
        .route("/tables/{ds}/selected", get(selected))
        .route("/tables/{ds}/pending", get(pending))
        .route("/tables/{ds}/statistics", get(statistics))
        .route("/tables/{ds}/select", post(select))
        .route("/tables/{ds}/select-all", post(select_all))
        .route("/tables/{ds}/selections", delete(clear_selections))
        .route("/tables/{ds}/{table}", get(describe))
        .route("/tables/{ds}/{table}/conflict", get(conflict))
        .route("/tables/{ds}/{table}/selection", delete(delete_selection).put(configure))
        .route("/apis/status", get(statuses))
        .route("/apis/routes", get(routes))
        .route("/apis/refresh", post(refresh))
        .route("/apis/{ds}/generate-pending", post(generate_pending))
        .route("/apis/{ds}/scan-and-generate", post(scan_and_generate))
        .route("/apis/{ds}/{table}", get(api_status).delete(remove))
        .route("/apis/{ds}/{table}/generate", post(generate))
        .route("/apis/{ds}/{table}/regenerate", post(regenerate))
}

/// Empty bodies fall back to the default value.
fn body<T: DeserializeOwned + Default>(raw: &Bytes) -> Result<T, ApiError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    Ok(serde_json::from_slice(raw)?)
}

fn ok<T: serde::Serialize>(data: T) -> Handled {
    Ok(Envelope::ok(data).into_response())
}

/// Generation outcomes are data, not failures: a skipped or failed table
/// still answers with its status, under a non-2xx code.
fn outcome(status: GenerationStatus) -> Handled {
    let (code, message) = match status.status {
        GenerationState::Generated => (StatusCode::OK, "generated".to_string()),
        GenerationState::Removed => (StatusCode::OK, "removed".to_string()),
        GenerationState::Skipped => (
            StatusCode::CONFLICT,
            status.error_message.clone().unwrap_or_else(|| "skipped".into()),
        ),
        GenerationState::Error => (
            StatusCode::UNPROCESSABLE_ENTITY,
            status.error_message.clone().unwrap_or_else(|| "generation failed".into()),
        ),
        _ => (StatusCode::ACCEPTED, status.status.to_string()),
    };
    Ok(Envelope::new(code, message, Some(ApiStatus::from(status))).into_response())
}

async fn datasources(State(gw): State<Gateway>) -> Handled {
    ok(gw.connector().datasources())
}

/// A config body is required. The URL scheme, when present, decides the dialect.
fn datasource_conf(raw: &Bytes) -> Result<DatasourceConf, ApiError> {
    let mut conf: DatasourceConf = serde_json::from_slice(raw)?;
    if let Some(dialect) = conf.url.as_deref().and_then(Dialect::from_url) {
        conf.dialect = dialect;
    }
    Ok(conf)
}

async fn datasource(State(gw): State<Gateway>, Path(ds): Path<DatasourceId>) -> Handled {
    ok(gw.connector().datasource(ds)?)
}

async fn create_datasource(State(gw): State<Gateway>, raw: Bytes) -> Handled {
    let conf = datasource_conf(&raw)?;
    let info = gw.connector().add_datasource(conf).await?;
    Ok(Envelope::new(StatusCode::CREATED, "created".to_string(), Some(info)).into_response())
}

async fn update_datasource(State(gw): State<Gateway>, Path(ds): Path<DatasourceId>, raw: Bytes) -> Handled {
    let conf = datasource_conf(&raw)?;
    ok(gw.connector().update_datasource(ds, conf).await?)
}

/// Refused while the datasource still serves generated APIs.
async fn remove_datasource(State(gw): State<Gateway>, Path(ds): Path<DatasourceId>) -> Handled {
    gw.connector().datasource(ds)?;
    let live = gw
        .orchestrator()
        .statuses(Some(ds))
        .await?
        .iter()
        .filter(|s| s.available)
        .count();
    if live > 0 {
        return Err(ApiError::Conflict(format!(
            "Datasource {} still serves {} API(s); remove them first",
            ds, live
        )));
    }
    ok(gw.connector().remove_datasource(ds).await?)
}

async fn test_config(State(gw): State<Gateway>, raw: Bytes) -> Handled {
    let conf = datasource_conf(&raw)?;
    gw.connector().test_config(&conf).await?;
    ok(json!({ "connected": true }))
}

async fn test_connection(State(gw): State<Gateway>, Path(ds): Path<DatasourceId>) -> Handled {
    gw.connector().test_connection(ds).await?;
    ok(json!({ "connected": true }))
}

async fn refresh_pool(State(gw): State<Gateway>, Path(ds): Path<DatasourceId>) -> Handled {
    gw.connector().refresh(ds).await?;
    ok(gw.connector().pool_status(ds)?)
}

async fn close_pool(State(gw): State<Gateway>, Path(ds): Path<DatasourceId>) -> Handled {
    let closed = gw.connector().close_pool(ds).await?;
    ok(json!({ "closed": closed }))
}

async fn pool_status(State(gw): State<Gateway>, Path(ds): Path<DatasourceId>) -> Handled {
    ok(gw.connector().pool_status(ds)?)
}

#[derive(Debug, Deserialize)]
struct NameQuery {
    name: String,
}

async fn check_name(State(gw): State<Gateway>, Query(q): Query<NameQuery>) -> Handled {
    let available = !q.name.trim().is_empty() && !gw.connector().name_taken(&q.name);
    ok(json!({ "name": q.name, "available": available }))
}

async fn scan(State(gw): State<Gateway>, Path(ds): Path<DatasourceId>) -> Handled {
    ok(gw.orchestrator().selections().scan(ds).await?)
}

async fn selected(State(gw): State<Gateway>, Path(ds): Path<DatasourceId>) -> Handled {
    ok(gw.orchestrator().selections().selected(ds).await?)
}

async fn pending(State(gw): State<Gateway>, Path(ds): Path<DatasourceId>) -> Handled {
    ok(gw.orchestrator().selections().pending(ds).await?)
}

async fn statistics(State(gw): State<Gateway>, Path(ds): Path<DatasourceId>) -> Handled {
    ok(gw.orchestrator().selections().statistics(ds).await?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SelectRequest {
    #[serde(default)]
    table_names: Vec<String>,
    #[serde(default = "yes")]
    selected: bool,
}

impl Default for SelectRequest {
    fn default() -> Self {
        Self {
            table_names: Vec::new(),
            selected: true,
        }
    }
}

fn yes() -> bool {
    true
}

async fn select(State(gw): State<Gateway>, Path(ds): Path<DatasourceId>, raw: Bytes) -> Handled {
    let req: SelectRequest = body(&raw)?;
    if req.table_names.is_empty() {
        return Err(ApiError::Validation("tableNames must not be empty".into()));
    }
    let changed = gw.orchestrator().select(ds, &req.table_names, req.selected).await?;
    ok(json!({ "changed": changed }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SelectAllRequest {
    #[serde(default = "yes")]
    selected: bool,
    #[serde(default = "yes")]
    skip_generated: bool,
}

impl Default for SelectAllRequest {
    fn default() -> Self {
        Self {
            selected: true,
            skip_generated: true,
        }
    }
}

async fn select_all(State(gw): State<Gateway>, Path(ds): Path<DatasourceId>, raw: Bytes) -> Handled {
    let req: SelectAllRequest = body(&raw)?;
    let changed = gw
        .orchestrator()
        .select_all(ds, req.selected, req.skip_generated)
        .await?;
    ok(json!({ "changed": changed }))
}

async fn clear_selections(State(gw): State<Gateway>, Path(ds): Path<DatasourceId>) -> Handled {
    let cleared = gw.orchestrator().selections().clear(ds).await?;
    ok(json!({ "cleared": cleared }))
}

async fn describe(State(gw): State<Gateway>, Path((ds, table)): Path<(DatasourceId, String)>) -> Handled {
    ok(gw.orchestrator().introspector().describe_table(ds, &table).await?)
}

async fn conflict(State(gw): State<Gateway>, Path((ds, table)): Path<(DatasourceId, String)>) -> Handled {
    let conflict = gw.orchestrator().selections().is_conflict(ds, &table).await?;
    ok(json!({ "datasourceId": ds, "tableName": table, "conflict": conflict }))
}

async fn configure(
    State(gw): State<Gateway>,
    Path((ds, table)): Path<(DatasourceId, String)>,
    raw: Bytes,
) -> Handled {
    let patch: SelectionPatch = body(&raw)?;
    ok(gw.orchestrator().selections().configure(ds, &table, patch).await?)
}

async fn delete_selection(State(gw): State<Gateway>, Path((ds, table)): Path<(DatasourceId, String)>) -> Handled {
    if !gw.orchestrator().selections().delete(ds, &table).await? {
        return Err(ApiError::NotFound(format!("No selection for {}:{}", ds, table)));
    }
    ok(json!({ "deleted": true }))
}

async fn generate(State(gw): State<Gateway>, Path((ds, table)): Path<(DatasourceId, String)>) -> Handled {
    outcome(gw.orchestrator().generate(ds, &table).await?)
}

async fn regenerate(State(gw): State<Gateway>, Path((ds, table)): Path<(DatasourceId, String)>) -> Handled {
    outcome(gw.orchestrator().regenerate(ds, &table).await?)
}

async fn remove(State(gw): State<Gateway>, Path((ds, table)): Path<(DatasourceId, String)>) -> Handled {
    outcome(gw.orchestrator().remove(ds, &table).await?)
}

async fn api_status(State(gw): State<Gateway>, Path((ds, table)): Path<(DatasourceId, String)>) -> Handled {
    ok(gw.orchestrator().status(ds, &table).await?)
}

async fn generate_pending(State(gw): State<Gateway>, Path(ds): Path<DatasourceId>) -> Handled {
    ok(gw.orchestrator().generate_pending(ds).await?)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScanAndGenerateRequest {
    table_names: Option<Vec<String>>,
}

async fn scan_and_generate(State(gw): State<Gateway>, Path(ds): Path<DatasourceId>, raw: Bytes) -> Handled {
    let req: ScanAndGenerateRequest = body(&raw)?;
    let (scan, report) = gw
        .orchestrator()
        .scan_and_generate(ds, req.table_names.as_deref())
        .await?;
    ok(json!({ "scan": scan, "generation": report }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest {
    #[serde(default)]
    only_changed: bool,
}

async fn refresh(State(gw): State<Gateway>, raw: Bytes) -> Handled {
    let req: RefreshRequest = body(&raw)?;
    ok(gw.orchestrator().refresh_all(req.only_changed).await?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusQuery {
    datasource_id: Option<DatasourceId>,
}

async fn statuses(State(gw): State<Gateway>, Query(q): Query<StatusQuery>) -> Handled {
    ok(gw.orchestrator().statuses(q.datasource_id).await?)
}

async fn routes(State(gw): State<Gateway>) -> Handled {
    ok(gw.orchestrator().routes().list())
}
