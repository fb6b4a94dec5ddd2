use crate::{
    auth::{Authenticator, StoreAuthenticator},
    cell::Cell,
    config::CellConfig,
    adapter::LeaseStoreAdapter,
    store::{MemoryStore, Store, VersionedValue, WatchEvent},
    Error, LeaseId, Result,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Store wrapper that injects failures: outage windows during which every
/// call fails with `StoreUnavailable`, and optional per-call latency.
/// Used to drive sessions through jeopardy and expiry in tests.
#[derive(Debug)]
pub struct FlakyStore {
    inner: MemoryStore,
    outage_until: Mutex<Option<Instant>>,
    latency: Mutex<Option<Duration>>,
}

impl FlakyStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            outage_until: Mutex::new(None),
            latency: Mutex::new(None),
        }
    }

    /// Fail every store call for the given window, starting now.
    pub fn begin_outage(&self, duration: Duration) {
        *self.outage_until.lock() = Some(Instant::now() + duration);
    }

    pub fn end_outage(&self) {
        *self.outage_until.lock() = None;
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    fn outage_active(&self) -> bool {
        let mut guard = self.outage_until.lock();
        match *guard {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                *guard = None;
                false
            }
            None => false,
        }
    }

    async fn gate(&self) -> Result<()> {
        if self.outage_active() {
            return Err(Error::StoreUnavailable {
                reason: "simulated outage".to_string(),
            });
        }
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>> {
        self.gate().await?;
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Bytes, lease: Option<LeaseId>) -> Result<u64> {
        self.gate().await?;
        self.inner.put(key, value, lease).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Bytes,
    ) -> Result<bool> {
        self.gate().await?;
        self.inner.compare_and_swap(key, expected, value).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.gate().await?;
        self.inner.delete(key).await
    }

    async fn create_lease(&self, ttl: Duration) -> Result<LeaseId> {
        self.gate().await?;
        self.inner.create_lease(ttl).await
    }

    async fn keep_alive_lease(&self, lease: LeaseId) -> Result<Duration> {
        self.gate().await?;
        self.inner.keep_alive_lease(lease).await
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.gate().await?;
        self.inner.revoke_lease(lease).await
    }

    fn watch(&self, prefix: &str) -> mpsc::UnboundedReceiver<WatchEvent> {
        self.inner.watch(prefix)
    }
}

/// Config with timings compressed enough that jeopardy and expiry play
/// out inside a test run.
pub fn fast_config(name: &str) -> CellConfig {
    CellConfig {
        name: name.to_string(),
        session_ttl_ms: 300,
        jeopardy_margin_ms: 100,
        grace_period_ms: 600,
        keep_alive_timeout_ms: 80,
        sweep_interval_ms: 10,
        lock_quiescence_ms: 2_000,
        event_queue_depth: 64,
    }
}

/// Users every test cell knows about.
pub const TEST_USERS: [(&str, &str); 3] = [
    ("alice", "alice-pw"),
    ("bob", "bob-pw"),
    ("carol", "carol-pw"),
];

/// Build a started cell over a fault-injecting store, with the standard
/// test users provisioned.
pub async fn test_cell(config: CellConfig) -> (Arc<Cell>, Arc<FlakyStore>) {
    let store = Arc::new(FlakyStore::new(MemoryStore::new()));
    let adapter = Arc::new(LeaseStoreAdapter::new(store.clone() as Arc<dyn Store>));
    let auth = StoreAuthenticator::new(
        config.name.clone(),
        adapter,
        config.keep_alive_timeout(),
    );
    for (user, password) in TEST_USERS {
        auth.provision(user, password).await.expect("provisioning");
    }

    let cell = Cell::new(
        config,
        store.clone() as Arc<dyn Store>,
        Arc::new(auth) as Arc<dyn Authenticator>,
    );
    cell.start();
    (cell, store)
}
