use crate::{
    store::{Store, VersionedValue, WatchEvent},
    Error, LeaseId, Result,
};
use bytes::Bytes;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{trace, warn};

const BACKOFF_BASE: Duration = Duration::from_millis(25);
const BACKOFF_MAX: Duration = Duration::from_millis(500);
const BACKOFF_JITTER_MS: u64 = 20;

/// Thin retrying layer over the consensus-backed store. Transient
/// `StoreUnavailable` errors are absorbed here with bounded exponential
/// backoff; every call carries a deadline, so an outage surfaces as a
/// deadline miss instead of an indefinite hang. Logical errors (lease
/// expired, version mismatch) are never retried.
#[derive(Debug)]
pub struct LeaseStoreAdapter {
    store: Arc<dyn Store>,
}

impl LeaseStoreAdapter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    async fn retry<T, F, Fut>(&self, deadline: Instant, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut backoff = BACKOFF_BASE;
        loop {
            match op().await {
                Err(Error::StoreUnavailable { reason }) => {
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..BACKOFF_JITTER_MS));
                    let delay = backoff + jitter;
                    if Instant::now() + delay >= deadline {
                        warn!(%reason, "store retries exhausted before deadline");
                        return Err(Error::StoreUnavailable { reason });
                    }
                    trace!(%reason, ?delay, "store unavailable, backing off");
                    tokio::time::sleep(delay).await;
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
                other => return other,
            }
        }
    }

    pub async fn get(&self, key: &str, deadline: Instant) -> Result<Option<VersionedValue>> {
        self.retry(deadline, || self.store.get(key)).await
    }

    pub async fn put(
        &self,
        key: &str,
        value: Bytes,
        lease: Option<LeaseId>,
        deadline: Instant,
    ) -> Result<u64> {
        self.retry(deadline, || self.store.put(key, value.clone(), lease))
            .await
    }

    pub async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Bytes,
        deadline: Instant,
    ) -> Result<bool> {
        self.retry(deadline, || {
            self.store.compare_and_swap(key, expected, value.clone())
        })
        .await
    }

    pub async fn delete(&self, key: &str, deadline: Instant) -> Result<bool> {
        self.retry(deadline, || self.store.delete(key)).await
    }

    pub async fn create_lease(&self, ttl: Duration, deadline: Instant) -> Result<LeaseId> {
        self.retry(deadline, || self.store.create_lease(ttl)).await
    }

    pub async fn keep_alive_lease(&self, lease: LeaseId, deadline: Instant) -> Result<Duration> {
        self.retry(deadline, || self.store.keep_alive_lease(lease)).await
    }

    pub async fn revoke_lease(&self, lease: LeaseId, deadline: Instant) -> Result<()> {
        self.retry(deadline, || self.store.revoke_lease(lease)).await
    }

    pub fn watch(&self, prefix: &str) -> mpsc::UnboundedReceiver<WatchEvent> {
        self.store.watch(prefix)
    }
}
