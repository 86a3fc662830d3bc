use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};

use crate::conf::DatasourceId;
use crate::errors::ApiError;
use crate::gateway::Gateway;
use crate::graphql::exec;
use crate::response::Envelope;

pub fn router() -> Router<Gateway> {
    Router::new()
        .route("/{ds}", post(execute))
        .route("/{ds}/sdl", get(sdl))
}

fn executable(gw: &Gateway, ds: DatasourceId) -> Result<async_graphql::dynamic::Schema, ApiError> {
    gw.connector().dialect(ds)?;
    gw.orchestrator()
        .schemas()
        .executable(ds, |tables| exec::compile(gw.service(), ds, tables))
}

/// Runs one GraphQL request. Field errors are part of the GraphQL result and
/// do not change the HTTP status.
async fn execute(State(gw): State<Gateway>, Path(ds): Path<DatasourceId>, raw: Bytes) -> Result<Response, ApiError> {
    let request: async_graphql::Request = serde_json::from_slice(&raw)?;
    let schema = executable(&gw, ds)?;
    let response = schema.execute(request).await;
    let message = match response.errors.first() {
        Some(e) => e.message.clone(),
        None => "success".to_string(),
    };
    Ok(Envelope::new(StatusCode::OK, message, Some(response)).into_response())
}

async fn sdl(State(gw): State<Gateway>, Path(ds): Path<DatasourceId>) -> Result<Response, ApiError> {
    gw.connector().dialect(ds)?;
    let sdl = gw.orchestrator().schemas().sdl(ds);
    Ok(Envelope::ok(sdl.as_str().to_string()).into_response())
}
