pub mod application;
pub mod cli;
pub mod config;
pub mod error;
pub mod pool;
pub mod postgres;
pub mod routing;
pub mod transaction;

#[cfg(test)]
mod test_helpers;

pub use application::{initialize, Application, InitBuilder, InitOptions, PgApplication};
pub use config::Config;
pub use error::{Error, Result};
pub use pool::{Pool, PoolSettings, PoolStats, PooledConnection};
pub use routing::{RoutingConnectionSource, TargetKey, TransactionContext};
pub use transaction::{Transaction, TransactionDefinition, TransactionManager, TransactionManagers};
