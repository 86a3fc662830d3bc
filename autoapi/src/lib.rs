mod cmd;
mod conf;
mod errors;
mod gateway;
mod layers;
mod response;
mod service;

pub mod datasource;
pub mod db;
pub mod dialect;
pub mod graphql;
pub mod introspect;
pub mod meta;
pub mod naming;
pub mod orchestrator;
pub mod routes;
pub mod state;
pub mod testing;
pub mod views;

pub use cmd::{GatewayCommand, NestedCommand};
pub use conf::{DatasourceConf, DatasourceId, GatewayConf};
pub use errors::{ApiError, ApiResult};
pub use gateway::{Gateway, GatewayBuilder, init_tracing};
pub use layers::{REQUEST_ID_HEADER, current_trace_id};
pub use orchestrator::{ApiStatus, BatchReport, GenerationSettings, Orchestrator};
pub use response::Envelope;
pub use service::DataService;
