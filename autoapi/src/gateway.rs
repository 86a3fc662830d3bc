use std::net::{SocketAddr, ToSocketAddrs as _};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{Router, ServiceExt};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::watch;
use tower::Layer as _;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::normalize_path::NormalizePathLayer;

use crate::conf::GatewayConf;
use crate::datasource::{Connector, DatasourceHub};
use crate::errors::ApiError;
use crate::graphql::SchemaBuilder;
use crate::introspect::Introspector;
use crate::layers::{not_found, trace_requests};
use crate::orchestrator::{GenerationSettings, Orchestrator};
use crate::routes::RouteRegistry;
use crate::service::DataService;
use crate::state::{MemoryRepository, PgStateRepository, SelectionRegistry, StateRepository};
use crate::views;

pub struct GatewayBuilder {
    conf: GatewayConf,
    connector: Option<Arc<dyn Connector>>,
    repository: Option<Arc<dyn StateRepository>>,
}

impl GatewayBuilder {
    fn new(conf: GatewayConf) -> Self {
        Self {
            conf,
            connector: None,
            repository: None,
        }
    }

    /// Replaces the pooled datasource hub built from the configuration.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_repository(mut self, repository: Arc<dyn StateRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    async fn repository(&mut self) -> Result<Arc<dyn StateRepository>, ApiError> {
        if let Some(repo) = self.repository.take() {
            return Ok(repo);
        }
        let Some(url) = &self.conf.state_database else {
            tracing::info!("No state database configured, keeping generation state in memory");
            return Ok(Arc::new(MemoryRepository::new()));
        };
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(url)
            .await
            .map_err(|e| ApiError::Connection(format!("State database is unreachable: {}", e)))?;
        let repo = PgStateRepository::new(pool);
        repo.migrate().await?;
        Ok(Arc::new(repo))
    }

    pub async fn build(mut self) -> Result<Gateway, ApiError> {
        let repository = self.repository().await?;
        let (connector, hub) = match self.connector.take() {
            Some(c) => (c, None),
            None => {
                let hub = Arc::new(DatasourceHub::new(self.conf.datasources.clone()));
                (hub.clone() as Arc<dyn Connector>, Some(hub))
            }
        };

        let introspector = Introspector::new(connector.clone(), self.conf.introspect_timeout());
        let selections = SelectionRegistry::new(repository, introspector.clone());
        let orchestrator = Orchestrator::new(
            selections,
            introspector,
            Arc::new(RouteRegistry::new()),
            Arc::new(SchemaBuilder::new()),
            GenerationSettings::from(&self.conf),
        );
        let service = DataService::new(connector.clone(), self.conf.query_timeout());

        Ok(Gateway {
            inner: Arc::new(GatewayInner {
                started: Instant::now(),
                conf: self.conf,
                connector,
                hub,
                orchestrator: Arc::new(orchestrator),
                service,
            }),
        })
    }
}

struct GatewayInner {
    started: Instant,
    conf: GatewayConf,
    connector: Arc<dyn Connector>,
    hub: Option<Arc<DatasourceHub>>,
    orchestrator: Arc<Orchestrator>,
    service: DataService,
}

/// Shared state behind every handler.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    pub fn builder(conf: GatewayConf) -> GatewayBuilder {
        GatewayBuilder::new(conf)
    }

    pub fn conf(&self) -> &GatewayConf {
        &self.inner.conf
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.inner.connector
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.inner.orchestrator
    }

    pub fn service(&self) -> &DataService {
        &self.inner.service
    }

    pub fn uptime(&self) -> Duration {
        self.inner.started.elapsed()
    }

    /// Management, GraphQL and the generated REST surface in one router.
    /// Generated routes are resolved at request time, so the router itself
    /// never changes after startup.
    pub fn router(&self) -> Router {
        let conf = self.conf();
        let mut router: Router<Gateway> = Router::new().nest(&conf.manage_prefix, views::manage::router());
        if conf.enable_graphql {
            router = router.nest(&conf.graphql_path, views::graphql::router());
        }
        router = if conf.enable_rest {
            router.fallback(views::rest::dispatch)
        } else {
            router.fallback(not_found)
        };
        router
            .layer(axum::middleware::from_fn(trace_requests))
            .layer(CatchPanicLayer::new())
            .with_state(self.clone())
    }

    /// Republishes tables that a previous run left Generated, then generates
    /// pending selections when configured to.
    pub async fn restore(&self) -> Result<(), ApiError> {
        let orchestrator = self.orchestrator();
        let report = orchestrator.refresh_all(false).await?;
        if report.generated + report.failed > 0 {
            tracing::info!("Restored {} tables ({} failed)", report.generated, report.failed);
        }
        if self.conf().generate_on_start {
            for ds in self.connector().datasources() {
                if let Err(e) = orchestrator.generate_pending(ds.id).await {
                    tracing::error!("Generating pending tables of datasource {} failed: {}", ds.id, e);
                }
            }
        }
        Ok(())
    }

    pub async fn serve(self) -> Result<(), ApiError> {
        let conf = self.conf();
        let addr: SocketAddr = format!("{}:{}", conf.host, conf.port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut iter| iter.next())
            .ok_or_else(|| ApiError::Validation(format!("Cannot resolve {}:{}", conf.host, conf.port)))?;

        self.restore().await?;

        let (stop, stopped) = watch::channel(false);
        let refresher = conf.refresh_interval_secs.filter(|s| *s > 0).map(|secs| {
            tracing::info!("Refreshing generated APIs every {}s", secs);
            self.orchestrator()
                .clone()
                .spawn_refresh_loop(Duration::from_secs(secs), stopped)
        });

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ApiError::Internal(format!("Cannot bind {}: {}", addr, e)))?;
        tracing::info!("Gateway listening on http://{}", addr);

        let service = NormalizePathLayer::trim_trailing_slash().layer(self.router());
        axum::serve(listener, ServiceExt::<axum::extract::Request>::into_make_service(service))
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| ApiError::Internal(format!("Server error: {}", e)))?;

        stop.send(true).ok();
        if let Some(handle) = refresher {
            handle.await.ok();
        }
        if let Some(hub) = &self.inner.hub {
            hub.close().await;
        }
        Ok(())
    }
}

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => tracing::info!("Ctrl+C received, shutting down gracefully"),
        Err(e) => tracing::error!("Cannot listen for Ctrl+C: {}", e),
    }
}

/// Installs the global subscriber. `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
