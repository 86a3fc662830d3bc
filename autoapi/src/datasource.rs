use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::OnceCell;

use crate::conf::{DatasourceConf, DatasourceId};
use crate::db::{MySqlExecutor, PgExecutor, RowExecutor};
use crate::dialect::Dialect;
use crate::errors::ApiError;
use crate::introspect::{MetadataProvider, MySqlCatalog, PgCatalog};

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatasourceInfo {
    pub id: DatasourceId,
    pub name: String,
    pub dialect: Dialect,
    pub schema: Option<String>,
}

impl From<&DatasourceConf> for DatasourceInfo {
    fn from(conf: &DatasourceConf) -> Self {
        Self {
            id: conf.id,
            name: conf.name.clone(),
            dialect: conf.dialect,
            schema: conf.schema_name().map(str::to_string),
        }
    }
}

/// Pool statistics. A datasource that was never used, or was closed, reports
/// `connected: false` and zero connections.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub id: DatasourceId,
    pub connected: bool,
    pub size: u32,
    pub idle: usize,
    pub max_connections: u32,
}

/// Hands out catalog readers and row executors per datasource.
///
/// Pool lifecycle and config management have defaults for connectors whose
/// datasources are fixed.
#[async_trait]
pub trait Connector: Send + Sync {
    fn datasources(&self) -> Vec<DatasourceInfo>;

    fn datasource(&self, ds: DatasourceId) -> Result<DatasourceInfo, ApiError> {
        self.datasources()
            .into_iter()
            .find(|d| d.id == ds)
            .ok_or_else(|| unknown_datasource(ds))
    }

    fn dialect(&self, ds: DatasourceId) -> Result<Dialect, ApiError> {
        self.datasource(ds).map(|d| d.dialect)
    }

    fn name_taken(&self, name: &str) -> bool {
        self.datasources().iter().any(|d| d.name.eq_ignore_ascii_case(name.trim()))
    }

    async fn metadata(&self, ds: DatasourceId) -> Result<Arc<dyn MetadataProvider>, ApiError>;

    async fn executor(&self, ds: DatasourceId) -> Result<Arc<dyn RowExecutor>, ApiError>;

    /// Round-trips the datasource. Unreachable databases give `Connection`.
    async fn test_connection(&self, ds: DatasourceId) -> Result<(), ApiError> {
        self.metadata(ds).await?.tables().await.map(|_| ())
    }

    /// Drops the pool and opens a fresh one.
    async fn refresh(&self, ds: DatasourceId) -> Result<(), ApiError> {
        self.test_connection(ds).await
    }

    /// Closes the pool. The next use reopens it. Returns whether a pool was open.
    async fn close_pool(&self, ds: DatasourceId) -> Result<bool, ApiError> {
        self.datasource(ds).map(|_| false)
    }

    fn pool_status(&self, ds: DatasourceId) -> Result<PoolStatus, ApiError> {
        self.datasource(ds)?;
        Ok(PoolStatus {
            id: ds,
            ..Default::default()
        })
    }

    /// Checks that an unsaved config can connect.
    async fn test_config(&self, conf: &DatasourceConf) -> Result<(), ApiError> {
        Err(read_only(&conf.name))
    }

    /// Registers a new datasource under the next free id.
    async fn add_datasource(&self, conf: DatasourceConf) -> Result<DatasourceInfo, ApiError> {
        Err(read_only(&conf.name))
    }

    /// Replaces a datasource's config. An empty password keeps the old one.
    async fn update_datasource(&self, ds: DatasourceId, conf: DatasourceConf) -> Result<DatasourceInfo, ApiError> {
        self.datasource(ds)?;
        Err(read_only(&conf.name))
    }

    async fn remove_datasource(&self, ds: DatasourceId) -> Result<DatasourceInfo, ApiError> {
        let info = self.datasource(ds)?;
        Err(read_only(&info.name))
    }
}

pub fn unknown_datasource(ds: DatasourceId) -> ApiError {
    ApiError::NotFound(format!("Datasource {} is not configured", ds))
}

fn read_only(name: &str) -> ApiError {
    ApiError::Validation(format!("Datasource '{}' cannot be changed: configs are fixed", name))
}

/// Rejects nameless configs and names held by another datasource.
pub fn check_name(
    existing: &[DatasourceInfo],
    conf: &DatasourceConf,
    except: Option<DatasourceId>,
) -> Result<(), ApiError> {
    let name = conf.name.trim();
    if name.is_empty() {
        return Err(ApiError::Validation("Datasource name is required".to_string()));
    }
    let clash = existing
        .iter()
        .any(|d| Some(d.id) != except && d.name.eq_ignore_ascii_case(name));
    if clash {
        return Err(ApiError::Conflict(format!("Datasource name '{}' is already taken", name)));
    }
    Ok(())
}

#[derive(Clone)]
pub enum Pool {
    Postgres(sqlx::PgPool),
    MySql(sqlx::MySqlPool),
}

impl Pool {
    pub async fn close(&self) {
        match self {
            Pool::Postgres(p) => p.close().await,
            Pool::MySql(p) => p.close().await,
        }
    }

    async fn ping(&self) -> Result<(), sqlx::Error> {
        match self {
            Pool::Postgres(p) => sqlx::query("SELECT 1").execute(p).await.map(|_| ()),
            Pool::MySql(p) => sqlx::query("SELECT 1").execute(p).await.map(|_| ()),
        }
    }

    fn size(&self) -> u32 {
        match self {
            Pool::Postgres(p) => p.size(),
            Pool::MySql(p) => p.size(),
        }
    }

    fn idle(&self) -> usize {
        match self {
            Pool::Postgres(p) => p.num_idle(),
            Pool::MySql(p) => p.num_idle(),
        }
    }

    fn is_closed(&self) -> bool {
        match self {
            Pool::Postgres(p) => p.is_closed(),
            Pool::MySql(p) => p.is_closed(),
        }
    }
}

#[derive(Clone)]
struct Live {
    pool: Pool,
    max_connections: u32,
    catalog: Arc<dyn MetadataProvider>,
    executor: Arc<dyn RowExecutor>,
}

struct Slot {
    conf: DatasourceConf,
    live: OnceCell<Live>,
}

impl Slot {
    fn new(conf: DatasourceConf) -> Arc<Self> {
        Arc::new(Self {
            conf,
            live: OnceCell::new(),
        })
    }
}

/// Pools are opened on first use and shared by every caller afterwards.
/// Closing or refreshing a datasource swaps in a fresh slot, so callers
/// holding the old pool finish against it while new callers reconnect.
pub struct DatasourceHub {
    slots: RwLock<HashMap<DatasourceId, Arc<Slot>>>,
}

impl DatasourceHub {
    pub fn new(confs: Vec<DatasourceConf>) -> Self {
        let slots = confs.into_iter().map(|conf| (conf.id, Slot::new(conf))).collect();
        Self {
            slots: RwLock::new(slots),
        }
    }

    fn slot(&self, ds: DatasourceId) -> Result<Arc<Slot>, ApiError> {
        self.slots.read().get(&ds).cloned().ok_or_else(|| unknown_datasource(ds))
    }

    async fn live(&self, ds: DatasourceId) -> Result<Live, ApiError> {
        let slot = self.slot(ds)?;
        slot.live.get_or_try_init(|| connect(&slot.conf)).await.cloned()
    }

    pub async fn pool(&self, ds: DatasourceId) -> Result<Pool, ApiError> {
        Ok(self.live(ds).await?.pool)
    }

    /// Puts `conf` in a fresh slot and returns the pool of the slot it replaced.
    fn swap(&self, conf: DatasourceConf) -> Option<Pool> {
        let old = self.slots.write().insert(conf.id, Slot::new(conf));
        old.and_then(|slot| slot.live.get().map(|live| live.pool.clone()))
    }

    pub async fn close(&self) {
        let slots: Vec<(DatasourceId, Arc<Slot>)> =
            self.slots.read().iter().map(|(id, slot)| (*id, slot.clone())).collect();
        for (id, slot) in slots {
            if let Some(live) = slot.live.get() {
                live.pool.close().await;
                tracing::info!("Closed pool for datasource {}", id);
            }
        }
    }
}

async fn connect(conf: &DatasourceConf) -> Result<Live, ApiError> {
    let target = conf.dialect.connection_target(conf)?;
    let (url, max_connections, min_connections) = conf.pool_sizes(&target);
    let unreachable = |e: sqlx::Error| {
        tracing::error!("Datasource {} ({}) unreachable: {}", conf.id, conf.name, e);
        ApiError::Connection(format!("Datasource '{}' is unreachable", conf.name))
    };

    let live = match conf.dialect {
        Dialect::Postgres => {
            let pool = PgPoolOptions::new()
                .max_connections(max_connections)
                .min_connections(min_connections)
                .acquire_timeout(conf.acquire_timeout())
                .test_before_acquire(true)
                .connect(&url)
                .await
                .map_err(unreachable)?;
            Live {
                catalog: Arc::new(PgCatalog::new(pool.clone(), conf.schema_name())),
                executor: Arc::new(PgExecutor::new(pool.clone())),
                pool: Pool::Postgres(pool),
                max_connections,
            }
        }
        Dialect::MySql => {
            let pool = MySqlPoolOptions::new()
                .max_connections(max_connections)
                .min_connections(min_connections)
                .acquire_timeout(conf.acquire_timeout())
                .test_before_acquire(true)
                .connect(&url)
                .await
                .map_err(unreachable)?;
            Live {
                catalog: Arc::new(MySqlCatalog::new(pool.clone(), conf.schema_name())),
                executor: Arc::new(MySqlExecutor::new(pool.clone())),
                pool: Pool::MySql(pool),
                max_connections,
            }
        }
    };
    tracing::info!(
        "Connected datasource {} ({}, {}) with pool {}..{}",
        conf.id,
        conf.name,
        conf.dialect,
        min_connections,
        max_connections
    );
    Ok(live)
}

/// Opens a single-connection pool for `conf`, runs `SELECT 1` and closes it.
async fn verify(conf: &DatasourceConf) -> Result<(), ApiError> {
    let trial = DatasourceConf {
        max_connections: 1,
        min_connections: 0,
        ..conf.clone()
    };
    let live = connect(&trial).await?;
    let pinged = live.pool.ping().await;
    live.pool.close().await;
    pinged.map_err(|e| {
        tracing::error!("Datasource '{}' failed its test query: {}", conf.name, e);
        ApiError::Connection(format!("Datasource '{}' failed its test query", conf.name))
    })
}

#[async_trait]
impl Connector for DatasourceHub {
    fn datasources(&self) -> Vec<DatasourceInfo> {
        let mut out: Vec<DatasourceInfo> = self
            .slots
            .read()
            .values()
            .map(|s| DatasourceInfo::from(&s.conf))
            .collect();
        out.sort_by_key(|d| d.id);
        out
    }

    async fn metadata(&self, ds: DatasourceId) -> Result<Arc<dyn MetadataProvider>, ApiError> {
        Ok(self.live(ds).await?.catalog)
    }

    async fn executor(&self, ds: DatasourceId) -> Result<Arc<dyn RowExecutor>, ApiError> {
        Ok(self.live(ds).await?.executor)
    }

    async fn test_connection(&self, ds: DatasourceId) -> Result<(), ApiError> {
        let live = self.live(ds).await?;
        live.pool.ping().await.map_err(|e| {
            tracing::error!("Datasource {} failed its test query: {}", ds, e);
            ApiError::Connection(format!("Datasource {} failed its test query", ds))
        })
    }

    async fn refresh(&self, ds: DatasourceId) -> Result<(), ApiError> {
        let conf = self.slot(ds)?.conf.clone();
        if let Some(old) = self.swap(conf) {
            old.close().await;
        }
        self.live(ds).await?;
        tracing::info!("Refreshed pool for datasource {}", ds);
        Ok(())
    }

    async fn close_pool(&self, ds: DatasourceId) -> Result<bool, ApiError> {
        let conf = self.slot(ds)?.conf.clone();
        match self.swap(conf) {
            Some(old) => {
                old.close().await;
                tracing::info!("Closed pool for datasource {}", ds);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn pool_status(&self, ds: DatasourceId) -> Result<PoolStatus, ApiError> {
        let slot = self.slot(ds)?;
        Ok(match slot.live.get().filter(|live| !live.pool.is_closed()) {
            Some(live) => PoolStatus {
                id: ds,
                connected: true,
                size: live.pool.size(),
                idle: live.pool.idle(),
                max_connections: live.max_connections,
            },
            None => PoolStatus {
                id: ds,
                connected: false,
                max_connections: slot.conf.max_connections,
                ..Default::default()
            },
        })
    }

    async fn test_config(&self, conf: &DatasourceConf) -> Result<(), ApiError> {
        verify(conf).await
    }

    async fn add_datasource(&self, mut conf: DatasourceConf) -> Result<DatasourceInfo, ApiError> {
        check_name(&self.datasources(), &conf, None)?;
        verify(&conf).await?;

        let mut slots = self.slots.write();
        let infos: Vec<DatasourceInfo> = slots.values().map(|s| DatasourceInfo::from(&s.conf)).collect();
        check_name(&infos, &conf, None)?;
        conf.id = slots.keys().max().map_or(1, |id| id + 1);
        let info = DatasourceInfo::from(&conf);
        slots.insert(conf.id, Slot::new(conf));
        tracing::info!("Added datasource {} ({})", info.id, info.name);
        Ok(info)
    }

    async fn update_datasource(&self, ds: DatasourceId, mut conf: DatasourceConf) -> Result<DatasourceInfo, ApiError> {
        let old = self.slot(ds)?.conf.clone();
        conf.id = ds;
        if conf.password.as_deref().is_none_or(str::is_empty) {
            conf.password = old.password;
        }
        check_name(&self.datasources(), &conf, Some(ds))?;
        verify(&conf).await?;

        let info = DatasourceInfo::from(&conf);
        if let Some(pool) = self.swap(conf) {
            pool.close().await;
        }
        tracing::info!("Updated datasource {} ({})", ds, info.name);
        Ok(info)
    }

    async fn remove_datasource(&self, ds: DatasourceId) -> Result<DatasourceInfo, ApiError> {
        let slot = self.slots.write().remove(&ds).ok_or_else(|| unknown_datasource(ds))?;
        if let Some(live) = slot.live.get() {
            live.pool.close().await;
        }
        tracing::info!("Removed datasource {} ({})", ds, slot.conf.name);
        Ok(DatasourceInfo::from(&slot.conf))
    }
}
