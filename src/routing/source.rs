use std::fmt;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::selector::{select_target, TargetKey, TransactionContext};
use crate::error::{Error, Result};
use crate::pool::{Connector, Pool, PoolStats, PooledConnection};

/// Something that hands out pooled connections for a unit of work
#[async_trait]
pub trait ConnectionSource<C: Connector>: Send + Sync {
    async fn get_connection(&self, context: &TransactionContext) -> Result<PooledConnection<C>>;
}

#[async_trait]
impl<C: Connector> ConnectionSource<C> for Pool<C> {
    async fn get_connection(&self, _context: &TransactionContext) -> Result<PooledConnection<C>> {
        self.acquire().await
    }
}

/// Routes connection requests to the read or write pool
pub struct RoutingConnectionSource<C: Connector> {
    read: Option<Pool<C>>,
    write: Option<Pool<C>>,
    default_target: TargetKey,
    lenient_fallback: bool,
}

impl<C: Connector> RoutingConnectionSource<C> {
    pub fn builder() -> RoutingConnectionSourceBuilder<C> {
        RoutingConnectionSourceBuilder::new()
    }

    pub fn pool(&self, target: TargetKey) -> Option<&Pool<C>> {
        match target {
            TargetKey::Read => self.read.as_ref(),
            TargetKey::Write => self.write.as_ref(),
        }
    }

    pub fn default_target(&self) -> TargetKey {
        self.default_target
    }

    pub fn lenient_fallback(&self) -> bool {
        self.lenient_fallback
    }

    /// Decide which pool serves `context`.
    ///
    /// An unmapped target falls back to the default target when lenient
    /// fallback is enabled and fails with [`Error::RoutingLookupFailure`]
    /// otherwise.
    pub fn resolve(&self, context: &TransactionContext) -> Result<(TargetKey, &Pool<C>)> {
        let selected = select_target(context);

        let (target, pool) = match self.pool(selected) {
            Some(pool) => (selected, pool),
            None if self.lenient_fallback => {
                let fallback = self.default_target;
                let pool = self
                    .pool(fallback)
                    .ok_or(Error::RoutingLookupFailure { target: fallback })?;
                debug!(selected = %selected, fallback = %fallback, "no pool for routing target, using default");
                (fallback, pool)
            }
            None => return Err(Error::RoutingLookupFailure { target: selected }),
        };

        debug!(
            transaction = context.display_name(),
            active = context.active,
            read_only = context.read_only,
            target = %target,
            pool = %pool.name(),
            "resolved routing target"
        );

        Ok((target, pool))
    }

    /// Stats for every configured target
    pub fn stats(&self) -> Vec<(TargetKey, PoolStats)> {
        [TargetKey::Write, TargetKey::Read]
            .into_iter()
            .filter_map(|target| self.pool(target).map(|pool| (target, pool.stats())))
            .collect()
    }

    pub async fn warm_up(&self) -> Result<()> {
        for (target, pool) in self.pools() {
            let created = pool.warm_up().await?;
            debug!(target = %target, pool = %pool.name(), created, "pool warmed up");
        }
        Ok(())
    }

    pub async fn close(&self) {
        for (target, pool) in self.pools() {
            debug!(target = %target, pool = %pool.name(), "closing pool");
            pool.close().await;
        }
    }

    fn pools(&self) -> impl Iterator<Item = (TargetKey, &Pool<C>)> + '_ {
        [TargetKey::Write, TargetKey::Read]
            .into_iter()
            .filter_map(|target| self.pool(target).map(|pool| (target, pool)))
    }
}

impl<C: Connector> fmt::Debug for RoutingConnectionSource<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingConnectionSource")
            .field("read", &self.read)
            .field("write", &self.write)
            .field("default_target", &self.default_target)
            .field("lenient_fallback", &self.lenient_fallback)
            .finish()
    }
}

#[async_trait]
impl<C: Connector> ConnectionSource<C> for RoutingConnectionSource<C> {
    async fn get_connection(&self, context: &TransactionContext) -> Result<PooledConnection<C>> {
        let (_, pool) = self.resolve(context)?;
        pool.acquire().await
    }
}

pub struct RoutingConnectionSourceBuilder<C: Connector> {
    read: Option<Pool<C>>,
    write: Option<Pool<C>>,
    default_target: TargetKey,
    lenient_fallback: bool,
}

impl<C: Connector> RoutingConnectionSourceBuilder<C> {
    pub fn new() -> Self {
        Self {
            read: None,
            write: None,
            default_target: TargetKey::Write,
            lenient_fallback: false,
        }
    }

    pub fn target(mut self, target: TargetKey, pool: Pool<C>) -> Self {
        match target {
            TargetKey::Read => self.read = Some(pool),
            TargetKey::Write => self.write = Some(pool),
        }
        self
    }

    pub fn read(self, pool: Pool<C>) -> Self {
        self.target(TargetKey::Read, pool)
    }

    pub fn write(self, pool: Pool<C>) -> Self {
        self.target(TargetKey::Write, pool)
    }

    pub fn default_target(mut self, target: TargetKey) -> Self {
        self.default_target = target;
        self
    }

    pub fn lenient_fallback(mut self, lenient: bool) -> Self {
        self.lenient_fallback = lenient;
        self
    }

    /// Validate the routing table and build the source.
    ///
    /// The default target must always be mapped. Any other unmapped target
    /// is only accepted with lenient fallback enabled.
    pub fn build(self) -> Result<RoutingConnectionSource<C>> {
        let source = RoutingConnectionSource {
            read: self.read,
            write: self.write,
            default_target: self.default_target,
            lenient_fallback: self.lenient_fallback,
        };

        if source.pool(source.default_target).is_none() {
            return Err(Error::RoutingLookupFailure {
                target: source.default_target,
            });
        }

        for target in [TargetKey::Read, TargetKey::Write] {
            if source.pool(target).is_none() {
                if !source.lenient_fallback {
                    return Err(Error::RoutingLookupFailure { target });
                }
                warn!(
                    target = %target,
                    fallback = %source.default_target,
                    "no pool configured for routing target, requests will use the default target"
                );
            }
        }

        Ok(source)
    }
}

impl<C: Connector> Default for RoutingConnectionSourceBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}
