//! PostgreSQL connector backed by sqlx

use std::ops::{Deref, DerefMut};

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::{Connection, Executor};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::pool::{AccessMode, Connector, PoolSettings, Session};

const SUPPORTED_DRIVER: &str = "pool";
const SUPPORTED_PROTOCOLS: [&str; 2] = ["postgres", "postgresql"];

/// Opens PostgreSQL connections described by one [`PoolSettings`]
#[derive(Debug, Clone)]
pub struct PgConnector {
    options: PgConnectOptions,
    settings: PoolSettings,
}

impl PgConnector {
    pub fn from_settings(settings: &PoolSettings) -> Result<Self> {
        if settings.driver != SUPPORTED_DRIVER {
            return Err(Error::Configuration(format!(
                "unsupported driver '{}' for pool '{}', expected '{}'",
                settings.driver, settings.pool_name, SUPPORTED_DRIVER
            )));
        }
        if !SUPPORTED_PROTOCOLS.contains(&settings.protocol.as_str()) {
            return Err(Error::Configuration(format!(
                "unsupported protocol '{}' for pool '{}'",
                settings.protocol, settings.pool_name
            )));
        }

        let ssl_mode = if settings.ssl {
            PgSslMode::Require
        } else {
            PgSslMode::Disable
        };

        let options = PgConnectOptions::new()
            .host(&settings.host)
            .port(settings.port)
            .username(&settings.username)
            .password(&settings.password)
            .database(&settings.database)
            .ssl_mode(ssl_mode)
            .application_name(&settings.pool_name);

        Ok(Self {
            options,
            settings: settings.clone(),
        })
    }

    pub fn options(&self) -> &PgConnectOptions {
        &self.options
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Connection = PgSession;

    async fn connect(&self) -> Result<PgSession> {
        let timeout = self.settings.connect_timeout;
        let conn = tokio::time::timeout(timeout, PgConnection::connect_with(&self.options))
            .await
            .map_err(|_| Error::ConnectTimeout { timeout })??;

        debug!(
            pool = %self.settings.pool_name,
            url = %self.settings.redacted_url(),
            "opened postgres connection"
        );

        Ok(PgSession {
            conn,
            broken: false,
            validation_query: self.settings.validation_query.clone(),
        })
    }
}

/// A single PostgreSQL connection owned by a pool
///
/// Derefs to [`PgConnection`] so sqlx queries can run on it directly.
#[derive(Debug)]
pub struct PgSession {
    conn: PgConnection,
    broken: bool,
    validation_query: Option<String>,
}

impl PgSession {
    async fn run(&mut self, statement: &str) -> Result<u64> {
        match Executor::execute(&mut self.conn, statement).await {
            Ok(done) => Ok(done.rows_affected()),
            Err(err) => {
                let err = Error::from(err);
                if err.is_connection_broken() {
                    self.broken = true;
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl Session for PgSession {
    async fn begin(&mut self, mode: AccessMode) -> Result<()> {
        self.run(mode.begin_statement()).await.map(|_| ())
    }

    async fn commit(&mut self) -> Result<()> {
        self.run("COMMIT").await.map(|_| ())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.run("ROLLBACK").await.map(|_| ())
    }

    async fn execute(&mut self, statement: &str) -> Result<u64> {
        self.run(statement).await
    }

    fn is_healthy(&self) -> bool {
        !self.broken
    }

    async fn ping(&mut self) -> Result<()> {
        let result = match self.validation_query.clone() {
            Some(query) => self.run(&query).await.map(|_| ()),
            None => self.conn.ping().await.map_err(Error::from),
        };
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    async fn close(self) -> Result<()> {
        if self.broken {
            // nothing to say goodbye to
            return Ok(());
        }
        self.conn.close().await.map_err(|err| {
            warn!(error = %err, "error closing postgres connection");
            Error::from(err)
        })
    }
}

impl Deref for PgSession {
    type Target = PgConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for PgSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}
