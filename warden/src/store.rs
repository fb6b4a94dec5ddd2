use crate::{Error, LeaseId, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// A value read back from the store together with its per-key version.
/// Versions start at 1 and increase by 1 on every put to the same key.
#[derive(Debug, Clone)]
pub struct VersionedValue {
    pub value: Bytes,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub key: String,
    pub kind: WatchEventKind,
    pub value: Option<Bytes>,
}

/// Interface to the consensus-backed store. Everything above this trait
/// treats the store as a black box offering linearizable key-value access,
/// server-side leases, and prefix watches. Keys written with a lease id
/// attached are deleted in one step when that lease is revoked or expires.
#[async_trait]
pub trait Store: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>>;

    /// Write a key, optionally attaching it to a lease. Returns the new
    /// version of the key.
    async fn put(&self, key: &str, value: Bytes, lease: Option<LeaseId>) -> Result<u64>;

    /// Atomic compare-and-swap on the key's version. `expected` of `None`
    /// requires the key to be absent. Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Bytes,
    ) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<bool>;

    async fn create_lease(&self, ttl: Duration) -> Result<LeaseId>;

    /// Refresh a lease's expiry. Returns the lease TTL on success.
    async fn keep_alive_lease(&self, lease: LeaseId) -> Result<Duration>;

    /// Drop a lease and delete every key attached to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    /// Subscribe to mutations under a key prefix. The receiver observes
    /// puts and deletes in the order the store applied them.
    fn watch(&self, prefix: &str) -> mpsc::UnboundedReceiver<WatchEvent>;
}

#[derive(Debug)]
struct StoredEntry {
    value: Bytes,
    version: u64,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct LeaseRecord {
    ttl: Duration,
    expires_at: Instant,
}

/// In-memory reference implementation of [`Store`]. Single-process, so
/// linearizability comes for free from the per-key map entry; lease expiry
/// is enforced on access and on revocation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: DashMap<String, StoredEntry>,
    leases: DashMap<LeaseId, LeaseRecord>,
    watchers: RwLock<Vec<(String, mpsc::UnboundedSender<WatchEvent>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(&self, event: WatchEvent) {
        let mut watchers = self.watchers.write();
        watchers.retain(|(prefix, tx)| {
            if !event.key.starts_with(prefix.as_str()) {
                return !tx.is_closed();
            }
            tx.send(event.clone()).is_ok()
        });
    }

    fn lease_live(&self, lease: LeaseId) -> bool {
        self.leases
            .get(&lease)
            .map(|rec| rec.expires_at > Instant::now())
            .unwrap_or(false)
    }

    /// Delete every key attached to `lease`, emitting delete events.
    fn drop_attached_keys(&self, lease: LeaseId) {
        let doomed: Vec<String> = self
            .data
            .iter()
            .filter(|entry| entry.value().lease == Some(lease))
            .map(|entry| entry.key().clone())
            .collect();
        for key in doomed {
            if self.data.remove(&key).is_some() {
                self.notify(WatchEvent {
                    key,
                    kind: WatchEventKind::Delete,
                    value: None,
                });
            }
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>> {
        match self.data.get(key) {
            Some(entry) => {
                if let Some(lease) = entry.lease {
                    if !self.lease_live(lease) {
                        drop(entry);
                        self.drop_attached_keys(lease);
                        return Ok(None);
                    }
                }
                Ok(Some(VersionedValue {
                    value: entry.value.clone(),
                    version: entry.version,
                }))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: Bytes, lease: Option<LeaseId>) -> Result<u64> {
        if let Some(lease) = lease {
            if !self.lease_live(lease) {
                return Err(Error::LeaseNotFound { lease });
            }
        }
        let version = {
            let mut entry = self.data.entry(key.to_string()).or_insert(StoredEntry {
                value: Bytes::new(),
                version: 0,
                lease: None,
            });
            entry.version += 1;
            entry.value = value.clone();
            entry.lease = lease;
            entry.version
        };
        self.notify(WatchEvent {
            key: key.to_string(),
            kind: WatchEventKind::Put,
            value: Some(value),
        });
        Ok(version)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Bytes,
    ) -> Result<bool> {
        let swapped = match self.data.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if expected == Some(occupied.get().version) {
                    let entry = occupied.get_mut();
                    entry.version += 1;
                    entry.value = value.clone();
                    true
                } else {
                    false
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                if expected.is_none() {
                    vacant.insert(StoredEntry {
                        value: value.clone(),
                        version: 1,
                        lease: None,
                    });
                    true
                } else {
                    false
                }
            }
        };
        if swapped {
            self.notify(WatchEvent {
                key: key.to_string(),
                kind: WatchEventKind::Put,
                value: Some(value),
            });
        }
        Ok(swapped)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed = self.data.remove(key).is_some();
        if removed {
            self.notify(WatchEvent {
                key: key.to_string(),
                kind: WatchEventKind::Delete,
                value: None,
            });
        }
        Ok(removed)
    }

    async fn create_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let lease = LeaseId::new();
        self.leases.insert(
            lease,
            LeaseRecord {
                ttl,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(lease)
    }

    async fn keep_alive_lease(&self, lease: LeaseId) -> Result<Duration> {
        let expired = match self.leases.get_mut(&lease) {
            Some(mut rec) => {
                if rec.expires_at > Instant::now() {
                    let ttl = rec.ttl;
                    rec.expires_at = Instant::now() + ttl;
                    return Ok(ttl);
                }
                true
            }
            None => false,
        };
        if expired {
            self.leases.remove(&lease);
            self.drop_attached_keys(lease);
            return Err(Error::LeaseExpired { lease });
        }
        Err(Error::LeaseNotFound { lease })
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        if self.leases.remove(&lease).is_some() {
            self.drop_attached_keys(lease);
        }
        Ok(())
    }

    fn watch(&self, prefix: &str) -> mpsc::UnboundedReceiver<WatchEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.write().push((prefix.to_string(), tx));
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_bumps_version() {
        let store = MemoryStore::new();
        let v1 = store.put("k", Bytes::from_static(b"a"), None).await.unwrap();
        let v2 = store.put("k", Bytes::from_static(b"b"), None).await.unwrap();
        assert_eq!(v1, 1);
        assert_eq!(v2, 2);

        let read = store.get("k").await.unwrap().unwrap();
        assert_eq!(read.value, Bytes::from_static(b"b"));
        assert_eq!(read.version, 2);
    }

    #[tokio::test]
    async fn cas_requires_matching_version() {
        let store = MemoryStore::new();
        assert!(store
            .compare_and_swap("k", None, Bytes::from_static(b"a"))
            .await
            .unwrap());
        assert!(!store
            .compare_and_swap("k", None, Bytes::from_static(b"b"))
            .await
            .unwrap());
        assert!(store
            .compare_and_swap("k", Some(1), Bytes::from_static(b"b"))
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn revoking_lease_drops_attached_keys() {
        let store = MemoryStore::new();
        let lease = store.create_lease(Duration::from_secs(5)).await.unwrap();
        store
            .put("leased", Bytes::from_static(b"x"), Some(lease))
            .await
            .unwrap();
        store.put("bare", Bytes::from_static(b"y"), None).await.unwrap();

        store.revoke_lease(lease).await.unwrap();

        assert!(store.get("leased").await.unwrap().is_none());
        assert!(store.get("bare").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_lease_refuses_keep_alive() {
        tokio::time::pause();
        let store = MemoryStore::new();
        let lease = store.create_lease(Duration::from_millis(50)).await.unwrap();
        tokio::time::advance(Duration::from_millis(100)).await;
        let err = store.keep_alive_lease(lease).await.unwrap_err();
        assert!(matches!(err, Error::LeaseExpired { .. }));
    }

    #[tokio::test]
    async fn watch_sees_puts_and_deletes_in_order() {
        let store = MemoryStore::new();
        let mut rx = store.watch("pre/");

        store.put("pre/a", Bytes::from_static(b"1"), None).await.unwrap();
        store.put("other/b", Bytes::from_static(b"2"), None).await.unwrap();
        store.delete("pre/a").await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.key, "pre/a");
        assert_eq!(first.kind, WatchEventKind::Put);

        let second = rx.recv().await.unwrap();
        assert_eq!(second.key, "pre/a");
        assert_eq!(second.kind, WatchEventKind::Delete);
    }
}
