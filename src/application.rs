//! Application wiring
//!
//! Builds one pool per configured target, the routing source over them and
//! the transaction managers on top. The application-level entry point is
//! [`Application::begin`], which takes only a read-only flag.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::pool::{Connector, Pool, PoolSettings, PoolStats};
use crate::postgres::PgConnector;
use crate::routing::{RoutingConnectionSource, TargetKey};
use crate::transaction::{Transaction, TransactionDefinition, TransactionManagers};

/// The replica-router application instance
pub struct Application<C: Connector> {
    pub config: Config,
    pub routing: Arc<RoutingConnectionSource<C>>,
    pub managers: TransactionManagers<C>,
}

pub type PgApplication = Application<PgConnector>;

impl<C: Connector> Application<C> {
    /// Create pools and managers (no I/O; connections are opened on demand
    /// or by [`Application::warm_up`])
    pub fn new<F>(config: Config, mut connector_for: F) -> Result<Self>
    where
        F: FnMut(TargetKey, &PoolSettings) -> Result<C>,
    {
        let mut builder = RoutingConnectionSource::builder()
            .default_target(config.routing.default_target)
            .lenient_fallback(config.routing.lenient_fallback);

        let mut targets = config.routing.targets.clone();
        targets.sort_by_key(|target| target.as_str());
        targets.dedup();

        for target in targets {
            let settings = config.datasource.settings(target).clone();
            let connector = connector_for(target, &settings)?;
            builder = builder.target(target, Pool::new(settings, connector)?);
        }

        let routing = Arc::new(builder.build()?);
        let managers = TransactionManagers::new(Arc::clone(&routing))?;

        info!(
            default_target = %routing.default_target(),
            lenient_fallback = routing.lenient_fallback(),
            "replica router ready"
        );

        Ok(Self {
            config,
            routing,
            managers,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start a transaction routed by its read-only flag
    pub fn begin(&self, read_only: bool) -> Transaction<C> {
        self.managers.default_manager().begin(TransactionDefinition {
            read_only,
            name: None,
        })
    }

    /// Run `work` in a routed transaction, committing on success
    pub async fn transactional<T, F>(&self, read_only: bool, work: F) -> Result<T>
    where
        F: for<'t> FnOnce(&'t mut Transaction<C>) -> futures::future::BoxFuture<'t, Result<T>>,
    {
        let definition = TransactionDefinition {
            read_only,
            name: None,
        };
        self.managers
            .default_manager()
            .transactional(definition, work)
            .await
    }

    pub fn stats(&self) -> Vec<(TargetKey, PoolStats)> {
        self.routing.stats()
    }

    /// Open `initial_size` connections in every pool
    pub async fn warm_up(&self) -> Result<()> {
        self.routing.warm_up().await
    }

    pub async fn shutdown(&self) {
        info!("shutting down connection pools");
        self.routing.close().await;
    }
}

/// Options for initializing the router
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Config file path (overrides default search)
    pub config_path: Option<String>,

    /// Individual keys set above every other configuration source
    pub overrides: Vec<(String, String)>,

    /// Whether to open `initial_size` connections before returning
    pub warm_up: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            config_path: None,
            overrides: Vec::new(),
            warm_up: true,
        }
    }
}

/// Builder for constructing InitOptions
pub struct InitBuilder {
    options: InitOptions,
}

impl InitBuilder {
    pub fn new() -> Self {
        Self {
            options: InitOptions::default(),
        }
    }

    pub fn config_path(mut self, path: impl Into<String>) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    /// Set a configuration key, e.g. `datasource.read.host`
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.overrides.push((key.into(), value.into()));
        self
    }

    pub fn warm_up(mut self, warm_up: bool) -> Self {
        self.options.warm_up = warm_up;
        self
    }

    pub async fn init(self) -> anyhow::Result<PgApplication> {
        initialize(self.options).await
    }
}

impl Default for InitBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Load configuration and build a PostgreSQL-backed application
pub async fn initialize(options: InitOptions) -> anyhow::Result<PgApplication> {
    let mut builder =
        Config::builder().config_path(options.config_path.map(std::path::PathBuf::from));
    for (key, value) in options.overrides {
        builder = builder.set(key, value);
    }
    let config = builder.build().context("Failed to load configuration")?;

    let app = Application::new(config, |_, settings| PgConnector::from_settings(settings))
        .context("Failed to build connection pools")?;

    if options.warm_up {
        app.warm_up().await.context("Failed to warm up connection pools")?;
    }

    Ok(app)
}
