//! In-memory database used by unit tests
//!
//! `FakeServer` stands in for one database server. Connections it hands out
//! record the statements they run and reject mutating statements inside a
//! read-only transaction with the same error the real engine produces.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::pool::{AccessMode, Connector, PoolSettings, Session};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Begin(u64, AccessMode),
    Execute(u64, String),
    Commit(u64),
    Rollback(u64),
    Close(u64),
}

#[derive(Debug, Default)]
pub struct FakeServer {
    pub label: &'static str,
    next_id: AtomicU64,
    connects: AtomicU64,
    fail_connects: AtomicU32,
    connect_delay: Mutex<Option<Duration>>,
    broken: Mutex<HashSet<u64>>,
    events: Mutex<Vec<Event>>,
}

impl FakeServer {
    pub fn new(label: &'static str) -> Arc<Self> {
        Arc::new(Self {
            label,
            next_id: AtomicU64::new(1),
            ..Default::default()
        })
    }

    /// Make the next `n` connection attempts fail with an I/O error
    pub fn fail_next_connects(&self, n: u32) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = Some(delay);
    }

    /// Simulate the client noticing a dead socket on a connection
    pub fn break_connection(&self, id: u64) {
        self.broken.lock().insert(id);
    }

    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn closed(&self) -> Vec<u64> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Close(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    /// Statements run on this server, in order
    pub fn statements(&self) -> Vec<(u64, String)> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Execute(id, sql) => Some((*id, sql.clone())),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: Event) {
        self.events.lock().push(event);
    }
}

pub struct FakeConnector {
    pub server: Arc<FakeServer>,
}

impl FakeConnector {
    pub fn new(server: &Arc<FakeServer>) -> Self {
        Self {
            server: Arc::clone(server),
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Connection = FakeConnection;

    async fn connect(&self) -> Result<FakeConnection> {
        self.server.connects.fetch_add(1, Ordering::SeqCst);

        let delay = *self.server.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let should_fail = self
            .server
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(Error::Database(sqlx::Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            ))));
        }

        Ok(FakeConnection {
            id: self.server.next_id.fetch_add(1, Ordering::SeqCst),
            server: Arc::clone(&self.server),
            transaction: None,
        })
    }
}

#[derive(Debug)]
pub struct FakeConnection {
    pub id: u64,
    pub server: Arc<FakeServer>,
    transaction: Option<AccessMode>,
}

impl FakeConnection {
    pub fn label(&self) -> &'static str {
        self.server.label
    }

    pub fn in_transaction(&self) -> Option<AccessMode> {
        self.transaction
    }
}

fn is_mutating(statement: &str) -> bool {
    let verb = statement
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    matches!(
        verb.as_str(),
        "INSERT" | "UPDATE" | "DELETE" | "CREATE" | "DROP" | "ALTER" | "TRUNCATE"
    )
}

#[async_trait]
impl Session for FakeConnection {
    async fn begin(&mut self, mode: AccessMode) -> Result<()> {
        self.transaction = Some(mode);
        self.server.record(Event::Begin(self.id, mode));
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.transaction = None;
        self.server.record(Event::Commit(self.id));
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.transaction = None;
        self.server.record(Event::Rollback(self.id));
        Ok(())
    }

    async fn execute(&mut self, statement: &str) -> Result<u64> {
        if self.transaction == Some(AccessMode::ReadOnly) && is_mutating(statement) {
            return Err(Error::ReadOnlyViolation {
                message: format!(
                    "cannot execute {} in a read-only transaction",
                    statement.split_whitespace().next().unwrap_or_default()
                ),
            });
        }
        self.server.record(Event::Execute(self.id, statement.to_string()));
        Ok(if is_mutating(statement) { 1 } else { 0 })
    }

    fn is_healthy(&self) -> bool {
        !self.server.broken.lock().contains(&self.id)
    }

    async fn ping(&mut self) -> Result<()> {
        if self.is_healthy() {
            Ok(())
        } else {
            Err(Error::Database(sqlx::Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "broken pipe",
            ))))
        }
    }

    async fn close(self) -> Result<()> {
        self.server.record(Event::Close(self.id));
        Ok(())
    }
}

/// Small, fast settings for tests; no warm-up, short timeouts
pub fn test_settings(name: &str, max_size: u32) -> PoolSettings {
    PoolSettings::default()
        .with_pool_name(name)
        .with_sizes(0, max_size)
        .with_max_acquire_time(Duration::from_millis(200))
        .with_max_idle_time(Duration::from_secs(60))
        .with_max_life_time(Duration::from_secs(600))
}
