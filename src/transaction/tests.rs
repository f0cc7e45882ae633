use std::sync::Arc;

use super::*;
use crate::pool::{AccessMode, Pool};
use crate::routing::{ConnectionSource, RoutingConnectionSource, TransactionContext};
use crate::test_helpers::{test_settings, Event, FakeConnector, FakeServer};

struct Fixture {
    read_server: Arc<FakeServer>,
    write_server: Arc<FakeServer>,
    routing: Arc<RoutingConnectionSource<FakeConnector>>,
    managers: TransactionManagers<FakeConnector>,
}

fn fixture_with_sizes(read_size: u32, write_size: u32) -> Fixture {
    let read_server = FakeServer::new("read");
    let write_server = FakeServer::new("write");
    let read = Pool::new(test_settings("read", read_size), FakeConnector::new(&read_server)).unwrap();
    let write =
        Pool::new(test_settings("write", write_size), FakeConnector::new(&write_server)).unwrap();

    let routing = Arc::new(
        RoutingConnectionSource::builder()
            .read(read)
            .write(write)
            .build()
            .unwrap(),
    );
    let managers = TransactionManagers::new(Arc::clone(&routing)).unwrap();

    Fixture {
        read_server,
        write_server,
        routing,
        managers,
    }
}

fn fixture() -> Fixture {
    fixture_with_sizes(2, 2)
}

async fn settle() {
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_read_only_transaction_runs_on_read_pool() {
    let f = fixture();
    let mut tx = f
        .managers
        .default_manager()
        .begin(TransactionDefinition::read_only().named("report"));

    tx.execute("SELECT * FROM orders").await.unwrap();
    assert_eq!(tx.connection().await.unwrap().label(), "read");
    tx.commit().await.unwrap();

    assert_eq!(
        f.read_server.events(),
        vec![
            Event::Begin(1, AccessMode::ReadOnly),
            Event::Execute(1, "SELECT * FROM orders".into()),
            Event::Commit(1),
        ]
    );
    assert_eq!(f.write_server.connects(), 0);
}

#[tokio::test]
async fn test_write_in_read_only_transaction_is_rejected_and_rolled_back() {
    let f = fixture();
    let mut tx = f
        .managers
        .default_manager()
        .begin(TransactionDefinition::read_only());

    tx.execute("SELECT 1").await.unwrap();
    let err = tx
        .execute("INSERT INTO orders VALUES (1)")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ReadOnlyViolation { .. }));
    assert!(tx.is_rollback_only());

    tx.rollback().await.unwrap();

    assert_eq!(
        f.read_server.events(),
        vec![
            Event::Begin(1, AccessMode::ReadOnly),
            Event::Execute(1, "SELECT 1".into()),
            Event::Rollback(1),
        ]
    );
    // nothing leaked to the primary
    assert!(f.write_server.statements().is_empty());

    let stats = f.routing.pool(TargetKey::Read).unwrap().stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.idle, 1);
}

#[tokio::test]
async fn test_read_write_transaction_keeps_one_connection() {
    let f = fixture();
    let mut tx = f
        .managers
        .default_manager()
        .begin(TransactionDefinition::read_write().named("checkout"));

    tx.execute("INSERT INTO orders VALUES (1)").await.unwrap();
    tx.execute("SELECT * FROM orders").await.unwrap();
    assert_eq!(tx.connection().await.unwrap().label(), "write");
    tx.commit().await.unwrap();

    assert_eq!(
        f.write_server.events(),
        vec![
            Event::Begin(1, AccessMode::ReadWrite),
            Event::Execute(1, "INSERT INTO orders VALUES (1)".into()),
            Event::Execute(1, "SELECT * FROM orders".into()),
            Event::Commit(1),
        ]
    );
    assert_eq!(f.read_server.connects(), 0);

    let stats = f.routing.pool(TargetKey::Write).unwrap().stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.idle, 1);
}

#[tokio::test]
async fn test_repeated_connection_requests_return_same_connection() {
    let f = fixture();
    let mut tx = f
        .managers
        .default_manager()
        .begin(TransactionDefinition::read_only());

    let first = tx.connection().await.unwrap().id;
    let second = tx.connection().await.unwrap().id;
    assert_eq!(first, second);
    assert_eq!(f.read_server.connects(), 1);
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn test_connection_is_acquired_lazily() {
    let f = fixture();
    let tx = f
        .managers
        .default_manager()
        .begin(TransactionDefinition::read_write());

    assert!(!tx.is_bound());
    tx.commit().await.unwrap();

    assert_eq!(f.read_server.connects(), 0);
    assert_eq!(f.write_server.connects(), 0);
}

#[tokio::test]
async fn test_no_transaction_passes_through_to_write() {
    let f = fixture();
    let source = TransactionAwareSource::new(f.routing.clone());

    let conn = source
        .get_connection(&TransactionContext::none())
        .await
        .unwrap();
    assert_eq!(conn.label(), "write");
    assert_eq!(conn.in_transaction(), None);
    drop(conn);

    assert!(f.write_server.events().is_empty());
    assert_eq!(f.read_server.connects(), 0);
}

#[tokio::test]
async fn test_transaction_aware_source_begins_transaction() {
    let f = fixture();
    let source = TransactionAwareSource::new(f.routing.clone());

    let conn = source
        .get_connection(&TransactionContext::active(true, None))
        .await
        .unwrap();
    assert_eq!(conn.label(), "read");
    assert_eq!(conn.in_transaction(), Some(AccessMode::ReadOnly));
}

#[tokio::test]
async fn test_rollback_only_commit_fails() {
    let f = fixture();
    let mut tx = f
        .managers
        .default_manager()
        .begin(TransactionDefinition::read_write().named("transfer"));

    tx.execute("UPDATE accounts SET balance = 0").await.unwrap();
    tx.set_rollback_only();

    let err = tx.commit().await.unwrap_err();
    assert!(matches!(err, Error::UnexpectedRollback { ref name } if name == "transfer"));

    let events = f.write_server.events();
    assert_eq!(events.last(), Some(&Event::Rollback(1)));
    assert!(!events.contains(&Event::Commit(1)));
}

#[tokio::test]
async fn test_dropped_transaction_rolls_back() {
    let f = fixture();
    {
        let mut tx = f
            .managers
            .default_manager()
            .begin(TransactionDefinition::read_write());
        tx.execute("DELETE FROM sessions").await.unwrap();
    }
    settle().await;

    let events = f.write_server.events();
    assert_eq!(events.last(), Some(&Event::Rollback(1)));

    // the connection went back to the pool after rolling back
    let stats = f.routing.pool(TargetKey::Write).unwrap().stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.idle, 1);
    assert!(f.write_server.closed().is_empty());
}

#[tokio::test]
async fn test_transactional_commits_on_success() {
    let f = fixture();

    let rows = f
        .managers
        .default_manager()
        .transactional(TransactionDefinition::read_write(), |tx| {
            Box::pin(async move { tx.execute("INSERT INTO audit VALUES (1)").await })
        })
        .await
        .unwrap();
    assert_eq!(rows, 1);

    assert_eq!(f.write_server.events().last(), Some(&Event::Commit(1)));
}

#[tokio::test]
async fn test_transactional_rolls_back_on_error() {
    let f = fixture();

    let err = f
        .managers
        .default_manager()
        .transactional(TransactionDefinition::read_only(), |tx| {
            Box::pin(async move {
                tx.execute("SELECT 1").await?;
                tx.execute("UPDATE accounts SET balance = 0").await
            })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ReadOnlyViolation { .. }));

    let events = f.read_server.events();
    assert_eq!(events.last(), Some(&Event::Rollback(1)));
    assert!(!events.contains(&Event::Commit(1)));
}

#[tokio::test]
async fn test_read_manager_enforces_read_only() {
    let f = fixture();
    let mut tx = f.managers.read().begin(TransactionDefinition::read_write());
    assert!(tx.is_read_only());

    let err = tx.execute("INSERT INTO t VALUES (1)").await.unwrap_err();
    assert!(matches!(err, Error::ReadOnlyViolation { .. }));
    tx.rollback().await.unwrap();

    assert_eq!(f.read_server.connects(), 1);
    assert_eq!(f.write_server.connects(), 0);
}

#[tokio::test]
async fn test_write_manager_always_uses_primary() {
    let f = fixture();
    let mut tx = f.managers.write().begin(TransactionDefinition::read_only());
    tx.execute("SELECT 1").await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(
        f.write_server.events().first(),
        Some(&Event::Begin(1, AccessMode::ReadOnly))
    );
    assert_eq!(f.read_server.connects(), 0);
}

#[tokio::test]
async fn test_read_manager_falls_back_with_lenient_routing() {
    let write_server = FakeServer::new("write");
    let write = Pool::new(test_settings("write", 1), FakeConnector::new(&write_server)).unwrap();
    let routing = Arc::new(
        RoutingConnectionSource::builder()
            .write(write)
            .lenient_fallback(true)
            .build()
            .unwrap(),
    );
    let managers = TransactionManagers::new(routing).unwrap();

    let mut tx = managers.read().begin(TransactionDefinition::read_only());
    assert_eq!(tx.connection().await.unwrap().label(), "write");
    tx.commit().await.unwrap();

    assert_eq!(
        write_server.events().first(),
        Some(&Event::Begin(1, AccessMode::ReadOnly))
    );
}

#[tokio::test(start_paused = true)]
async fn test_acquire_timeout_surfaces_from_transaction() {
    let f = fixture_with_sizes(1, 1);
    let manager = f.managers.default_manager();

    let mut held = manager.begin(TransactionDefinition::read_write());
    held.execute("SELECT 1").await.unwrap();

    let mut blocked = manager.begin(TransactionDefinition::read_write());
    let err = blocked.execute("SELECT 2").await.unwrap_err();
    assert!(matches!(err, Error::AcquireTimeout { ref pool, .. } if pool == "write"));
    // the failed acquire never bound a connection, so nothing to roll back
    assert!(!blocked.is_bound());

    held.commit().await.unwrap();
    blocked.execute("SELECT 2").await.unwrap();
    blocked.commit().await.unwrap();
}
