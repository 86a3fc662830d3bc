use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dialect::Dialect;

pub type DatasourceId = i64;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DatasourceConf {
    pub id: DatasourceId,
    pub name: String,
    pub dialect: Dialect,
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub schema: Option<String>,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_ms: u64,
}

impl Default for DatasourceConf {
    fn default() -> Self {
        Self {
            id: 1,
            name: "primary".to_string(),
            dialect: Dialect::Postgres,
            url: None,
            host: None,
            port: None,
            database: None,
            schema: None,
            username: None,
            password: None,
            max_connections: 20,
            min_connections: 5,
            acquire_timeout_ms: 60_000,
        }
    }
}

impl DatasourceConf {
    pub fn from_url(id: DatasourceId, name: &str, url: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            dialect: Dialect::from_url(url).unwrap_or(Dialect::Postgres),
            url: Some(url.to_string()),
            ..Default::default()
        }
    }

    /// Schema the introspector should read, honouring the dialect default.
    pub fn schema_name(&self) -> Option<&str> {
        self.schema.as_deref().or(self.dialect.default_schema())
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Splits pool sizing (`?max=`/`?min=`) off a connection URL. Returns the
    /// URL without those keys plus the parsed sizes, falling back to the conf.
    pub fn pool_sizes(&self, target: &str) -> (String, u32, u32) {
        let Ok(mut parts) = target.parse::<url::Url>() else {
            return (target.to_string(), self.max_connections, self.min_connections);
        };
        let mut query: HashMap<String, String> = HashMap::new();
        let mut rest: Vec<(String, String)> = Vec::new();
        for (key, value) in parts.query_pairs() {
            match key.as_ref() {
                "max" | "min" => {
                    query.insert(key.to_string(), value.to_string());
                }
                _ => rest.push((key.to_string(), value.to_string())),
            }
        }
        let max_connections = query
            .remove("max")
            .and_then(|s| s.parse().ok())
            .unwrap_or(self.max_connections);
        let min_connections = query
            .remove("min")
            .and_then(|s| s.parse().ok())
            .unwrap_or(self.min_connections);

        if rest.is_empty() {
            parts.set_query(None);
        } else {
            parts.query_pairs_mut().clear().extend_pairs(rest);
        }
        (parts.to_string(), max_connections, min_connections)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GatewayConf {
    pub host: String,

    pub port: u16,

    pub api_prefix: String,

    pub manage_prefix: String,

    pub graphql_path: String,

    pub enable_rest: bool,

    pub enable_graphql: bool,

    pub datasources: Vec<DatasourceConf>,

    pub state_database: Option<String>,

    pub introspect_timeout_ms: u64,

    pub query_timeout_ms: u64,

    pub refresh_interval_secs: Option<u64>,

    pub generate_on_start: bool,

    pub log_init: bool,
}

impl Default for GatewayConf {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8080,
            api_prefix: "/api".to_string(),
            manage_prefix: "/manage".to_string(),
            graphql_path: "/graphql".to_string(),
            enable_rest: true,
            enable_graphql: true,
            datasources: vec![],
            state_database: None,
            introspect_timeout_ms: 30_000,
            query_timeout_ms: 30_000,
            refresh_interval_secs: None,
            generate_on_start: false,
            log_init: true,
        }
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl GatewayConf {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        #[cfg(test)]
        {
            dotenvy::from_filename_override(".env.test").ok();
        }

        #[cfg(all(debug_assertions, not(test)))]
        {
            dotenvy::from_filename_override(".env.dev").ok();
        }

        #[cfg(not(any(debug_assertions, test)))]
        {
            dotenvy::from_filename_override(".env.prod").ok();
        }

        let defaults = Self::default();

        let mut datasources: Vec<DatasourceConf> = Vec::new();
        if let Ok(url) = std::env::var("DATABASE_URL") {
            datasources.push(DatasourceConf::from_url(1, "primary", &url));
        }
        if let Ok(raw) = std::env::var("DATASOURCES") {
            match serde_json::from_str::<Vec<DatasourceConf>>(&raw) {
                Ok(extra) => {
                    for ds in extra {
                        datasources.retain(|d| d.id != ds.id);
                        datasources.push(ds);
                    }
                }
                Err(e) => tracing::warn!("Ignoring malformed DATASOURCES: {}", e),
            }
        }

        Self {
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port: env_parse("PORT").unwrap_or(defaults.port),
            api_prefix: std::env::var("API_PREFIX").unwrap_or(defaults.api_prefix),
            manage_prefix: std::env::var("MANAGE_PREFIX").unwrap_or(defaults.manage_prefix),
            graphql_path: std::env::var("GRAPHQL_PATH").unwrap_or(defaults.graphql_path),
            enable_rest: env_flag("ENABLE_REST", defaults.enable_rest),
            enable_graphql: env_flag("ENABLE_GRAPHQL", defaults.enable_graphql),
            datasources,
            state_database: std::env::var("STATE_DATABASE_URL").ok(),
            introspect_timeout_ms: env_parse("INTROSPECT_TIMEOUT_MS")
                .unwrap_or(defaults.introspect_timeout_ms),
            query_timeout_ms: env_parse("QUERY_TIMEOUT_MS").unwrap_or(defaults.query_timeout_ms),
            refresh_interval_secs: env_parse("REFRESH_INTERVAL_SECS"),
            generate_on_start: env_flag("GENERATE_ON_START", defaults.generate_on_start),
            log_init: env_flag("LOG_INIT", defaults.log_init),
        }
    }

    pub fn introspect_timeout(&self) -> Duration {
        Duration::from_millis(self.introspect_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn datasource(&self, id: DatasourceId) -> Option<&DatasourceConf> {
        self.datasources.iter().find(|d| d.id == id)
    }
}
