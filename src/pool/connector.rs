use async_trait::async_trait;

use crate::error::Result;

/// Access mode a transaction is started with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadWrite,
    ReadOnly,
}

impl AccessMode {
    pub fn from_read_only(read_only: bool) -> Self {
        if read_only {
            AccessMode::ReadOnly
        } else {
            AccessMode::ReadWrite
        }
    }

    pub fn begin_statement(self) -> &'static str {
        match self {
            AccessMode::ReadWrite => "BEGIN",
            AccessMode::ReadOnly => "BEGIN READ ONLY",
        }
    }
}

/// A live physical connection as seen by the pool and transaction managers
#[async_trait]
pub trait Session: Send + Sized + 'static {
    async fn begin(&mut self, mode: AccessMode) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    /// Execute a statement, returning the number of rows affected
    async fn execute(&mut self, statement: &str) -> Result<u64>;

    /// Client-side liveness check; must not perform I/O
    fn is_healthy(&self) -> bool;

    /// Server round trip used for remote validation
    async fn ping(&mut self) -> Result<()>;

    async fn close(self) -> Result<()>;
}

/// Creates physical connections for a pool
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Session;

    async fn connect(&self) -> Result<Self::Connection>;
}
