//! Transaction management
//!
//! A [`TransactionManager`] hands out [`Transaction`]s on top of any
//! [`ConnectionSource`]. The connection is acquired lazily: the first
//! statement resolves the target, checks out a connection and issues
//! `BEGIN`, and every later statement in the same transaction reuses that
//! connection. Commit or rollback ends the transaction on that connection
//! and returns it to the pool it came from.

#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::pool::{AccessMode, Connector, PooledConnection, Session};
use crate::routing::{ConnectionSource, RoutingConnectionSource, TargetKey, TransactionContext};

/// How a transaction should be started
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionDefinition {
    pub read_only: bool,
    pub name: Option<String>,
}

impl TransactionDefinition {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            name: None,
        }
    }

    pub fn read_write() -> Self {
        Self::default()
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Decorates a connection source so that connections requested for an
/// active transaction come back with that transaction already begun.
///
/// Requests outside a transaction pass straight through.
pub struct TransactionAwareSource<C: Connector> {
    target: Arc<dyn ConnectionSource<C>>,
}

impl<C: Connector> TransactionAwareSource<C> {
    pub fn new(target: Arc<dyn ConnectionSource<C>>) -> Self {
        Self { target }
    }
}

impl<C: Connector> Clone for TransactionAwareSource<C> {
    fn clone(&self) -> Self {
        Self {
            target: Arc::clone(&self.target),
        }
    }
}

#[async_trait]
impl<C: Connector> ConnectionSource<C> for TransactionAwareSource<C> {
    async fn get_connection(&self, context: &TransactionContext) -> Result<PooledConnection<C>> {
        let mut conn = self.target.get_connection(context).await?;
        if !context.active {
            return Ok(conn);
        }

        // an abandoned handle must not go back to the pool mid-transaction
        conn.set_reusable(false);

        let mode = AccessMode::from_read_only(context.read_only);
        if let Err(err) = conn.begin(mode).await {
            warn!(
                transaction = context.display_name(),
                pool = %conn.pool_name(),
                error = %err,
                "failed to begin transaction"
            );
            conn.discard().await;
            return Err(err);
        }

        debug!(
            transaction = context.display_name(),
            read_only = context.read_only,
            pool = %conn.pool_name(),
            connection = conn.id(),
            "transaction bound to connection"
        );
        Ok(conn)
    }
}

/// Starts transactions against one connection source
pub struct TransactionManager<C: Connector> {
    name: String,
    source: TransactionAwareSource<C>,
    enforce_read_only: bool,
}

impl<C: Connector> TransactionManager<C> {
    pub fn new(name: impl Into<String>, source: Arc<dyn ConnectionSource<C>>) -> Self {
        Self {
            name: name.into(),
            source: TransactionAwareSource::new(source),
            enforce_read_only: false,
        }
    }

    /// Start every transaction in read-only access mode, whatever its
    /// definition says. Writes are then rejected by the database itself.
    pub fn with_enforce_read_only(mut self, enforce: bool) -> Self {
        self.enforce_read_only = enforce;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn enforces_read_only(&self) -> bool {
        self.enforce_read_only
    }

    /// Start a transaction. No connection is acquired until it is first used.
    pub fn begin(&self, definition: TransactionDefinition) -> Transaction<C> {
        let read_only = definition.read_only || self.enforce_read_only;
        let context = TransactionContext::active(read_only, definition.name);

        debug!(
            manager = %self.name,
            transaction = context.display_name(),
            read_only,
            "transaction started"
        );

        Transaction {
            context,
            source: self.source.clone(),
            bound: None,
            rollback_only: false,
        }
    }

    /// Run `work` in a transaction, committing on `Ok` and rolling back on `Err`.
    ///
    /// ```ignore
    /// let count = manager
    ///     .transactional(TransactionDefinition::read_only(), |tx| {
    ///         Box::pin(async move { tx.execute("SELECT 1").await })
    ///     })
    ///     .await?;
    /// ```
    pub async fn transactional<T, F>(&self, definition: TransactionDefinition, work: F) -> Result<T>
    where
        F: for<'t> FnOnce(&'t mut Transaction<C>) -> BoxFuture<'t, Result<T>>,
    {
        let mut tx = self.begin(definition);

        match work(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                let name = tx.context.display_name().to_string();
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(transaction = %name, error = %rollback_err, "rollback after failed work also failed");
                }
                Err(err)
            }
        }
    }
}

impl<C: Connector> fmt::Debug for TransactionManager<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("name", &self.name)
            .field("enforce_read_only", &self.enforce_read_only)
            .finish()
    }
}

/// One logical unit of work pinned to a single physical connection
pub struct Transaction<C: Connector> {
    context: TransactionContext,
    source: TransactionAwareSource<C>,
    bound: Option<PooledConnection<C>>,
    rollback_only: bool,
}

impl<C: Connector> Transaction<C> {
    pub fn context(&self) -> &TransactionContext {
        &self.context
    }

    pub fn is_read_only(&self) -> bool {
        self.context.read_only
    }

    /// Whether a connection has been acquired for this transaction yet
    pub fn is_bound(&self) -> bool {
        self.bound.is_some()
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    /// Make a later `commit` roll back instead
    pub fn set_rollback_only(&mut self) {
        self.rollback_only = true;
    }

    /// The connection this transaction runs on.
    ///
    /// The first call acquires it and begins the transaction; later calls
    /// return the same connection.
    pub async fn connection(&mut self) -> Result<&mut C::Connection> {
        let conn = match self.bound.take() {
            Some(conn) => conn,
            None => self.source.get_connection(&self.context).await?,
        };
        Ok(&mut **self.bound.insert(conn))
    }

    /// Execute a statement inside the transaction.
    ///
    /// A failed statement marks the transaction rollback-only.
    pub async fn execute(&mut self, statement: &str) -> Result<u64> {
        let result = self.connection().await?.execute(statement).await;

        if let Err(err) = &result {
            self.rollback_only = true;
            debug!(
                transaction = self.context.display_name(),
                error = %err,
                "statement failed, transaction marked rollback-only"
            );
        }
        result
    }

    pub async fn commit(mut self) -> Result<()> {
        let Some(mut conn) = self.bound.take() else {
            return Ok(());
        };
        let name = self.context.display_name().to_string();

        if self.rollback_only {
            rollback_and_release(conn).await?;
            debug!(transaction = %name, "rollback-only transaction rolled back");
            return Err(Error::UnexpectedRollback { name });
        }

        match conn.commit().await {
            Ok(()) => {
                debug!(transaction = %name, pool = %conn.pool_name(), "transaction committed");
                conn.set_reusable(true);
                conn.release().await;
                Ok(())
            }
            Err(err) => {
                warn!(transaction = %name, error = %err, "commit failed, rolling back");
                if let Err(rollback_err) = rollback_and_release(conn).await {
                    debug!(transaction = %name, error = %rollback_err, "rollback after failed commit failed");
                }
                Err(err)
            }
        }
    }

    pub async fn rollback(mut self) -> Result<()> {
        match self.bound.take() {
            Some(conn) => {
                rollback_and_release(conn).await?;
                debug!(transaction = self.context.display_name(), "transaction rolled back");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// Roll back and hand the connection back to its pool, closing it if the
/// rollback itself failed.
async fn rollback_and_release<C: Connector>(mut conn: PooledConnection<C>) -> Result<()> {
    match conn.rollback().await {
        Ok(()) => {
            conn.set_reusable(true);
            conn.release().await;
            Ok(())
        }
        Err(err) => {
            conn.discard().await;
            Err(err)
        }
    }
}

impl<C: Connector> Drop for Transaction<C> {
    fn drop(&mut self) {
        let Some(conn) = self.bound.take() else {
            return;
        };
        let name = self.context.display_name().to_string();
        warn!(transaction = %name, "transaction dropped before commit or rollback, rolling back");

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = rollback_and_release(conn).await {
                        warn!(transaction = %name, error = %err, "rollback of abandoned transaction failed");
                    }
                });
            }
            // still marked non-reusable, so the pool closes it
            Err(_) => drop(conn),
        }
    }
}

impl<C: Connector> fmt::Debug for Transaction<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("context", &self.context)
            .field("bound", &self.bound.is_some())
            .field("rollback_only", &self.rollback_only)
            .finish()
    }
}

/// The write, read and routing transaction managers
pub struct TransactionManagers<C: Connector> {
    write: TransactionManager<C>,
    read: TransactionManager<C>,
    routing: TransactionManager<C>,
}

impl<C: Connector> TransactionManagers<C> {
    /// Build the three managers over one routing source.
    ///
    /// The write manager is bound to the pool WRITE resolves to, the read
    /// manager to the pool READ resolves to (with read-only enforcement), and
    /// the default manager routes each transaction by its read-only flag.
    pub fn new(routing: Arc<RoutingConnectionSource<C>>) -> Result<Self> {
        let (write_target, write_pool) =
            routing.resolve(&TransactionContext::active(false, None))?;
        let (read_target, read_pool) = routing.resolve(&TransactionContext::active(true, None))?;

        if read_target != TargetKey::Read {
            warn!(target = %read_target, "read transaction manager is bound to the fallback pool");
        }
        debug!(write = %write_target, read = %read_target, "transaction managers configured");

        let write = TransactionManager::new("write", Arc::new(write_pool.clone()));
        let read =
            TransactionManager::new("read", Arc::new(read_pool.clone())).with_enforce_read_only(true);
        let routing = TransactionManager::new("default", routing);

        Ok(Self {
            write,
            read,
            routing,
        })
    }

    pub fn write(&self) -> &TransactionManager<C> {
        &self.write
    }

    pub fn read(&self) -> &TransactionManager<C> {
        &self.read
    }

    /// The routing manager used for application-level transactions
    pub fn default_manager(&self) -> &TransactionManager<C> {
        &self.routing
    }
}
