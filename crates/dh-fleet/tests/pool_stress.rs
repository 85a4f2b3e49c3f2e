//! Concurrency properties of the link pool under contention

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use dh_core::config::PoolConfig;
use dh_core::error::ConnectionError;
use dh_fleet::ConnectionPool;

fn stress_pool_config(max: usize) -> PoolConfig {
    PoolConfig {
        max_connections: max,
        min_connections: 0,
        connection_timeout: Duration::from_secs(2),
        idle_timeout: Duration::from_secs(300),
        health_check_interval: Duration::from_secs(600),
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_leases_never_exceed_the_cap() {
    let host = FakeHost::new();
    // every command takes a while, so leases overlap heavily
    host.set_delay(Duration::from_millis(50));

    let pool = Arc::new(ConnectionPool::new(FakeConnector::new(&host)));
    let node = identity("stress-1");
    pool.register(node.clone(), stress_pool_config(3));
    let id = node.id.clone();

    let mut workers = Vec::new();
    for worker in 0..20 {
        let pool = Arc::clone(&pool);
        let id = id.clone();
        workers.push(tokio::spawn(async move {
            let mut lease = pool.acquire(&id).await?;
            lease.execute(&format!("echo {worker}")).await?;
            Ok::<(), dh_core::DhError>(())
        }));
    }
    for worker in workers {
        worker.await.unwrap().unwrap();
    }

    assert!(
        host.max_in_flight() <= 3,
        "saw {} concurrent commands with a cap of 3",
        host.max_in_flight()
    );
    let stats = pool.stats(&id).unwrap();
    assert_eq!(stats.active, 0);
    assert!(stats.total <= 3);
    assert_eq!(host.open_count(), stats.total);
}

#[tokio::test(start_paused = true)]
async fn test_capped_pool_blocks_then_fails_with_pool_exhausted() {
    let host = FakeHost::new();
    let pool = Arc::new(ConnectionPool::new(FakeConnector::new(&host)));
    let node = identity("stress-2");
    pool.register(node.clone(), stress_pool_config(2));
    let id = node.id.clone();

    let first = pool.acquire(&id).await.unwrap();
    let second = pool.acquire(&id).await.unwrap();

    // a third acquire blocks until a release arrives
    let waiter = {
        let pool = Arc::clone(&pool);
        let id = id.clone();
        tokio::spawn(async move { pool.acquire(&id).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!waiter.is_finished(), "third acquire must wait");

    drop(first);
    let third = waiter.await.unwrap().unwrap();

    // with the pool exhausted again and no release, the wait times out
    let err = pool.acquire(&id).await.unwrap_err();
    assert!(matches!(err, ConnectionError::PoolExhausted(_)));

    drop(second);
    drop(third);
    let stats = pool.stats(&id).unwrap();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.idle, 2);
}
