use crate::{adapter::LeaseStoreAdapter, Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Opaque credential check. The coordination layer never inspects how
/// credentials are stored; it only learns the authenticated principal.
#[async_trait]
pub trait Authenticator: Send + Sync + std::fmt::Debug {
    async fn authenticate(&self, username: &str, password: &str) -> Result<String>;
}

/// Authenticator backed by credential digests held under the cell's auth
/// namespace in the store.
#[derive(Debug)]
pub struct StoreAuthenticator {
    cell: String,
    adapter: Arc<LeaseStoreAdapter>,
    op_timeout: Duration,
}

impl StoreAuthenticator {
    pub fn new(cell: impl Into<String>, adapter: Arc<LeaseStoreAdapter>, op_timeout: Duration) -> Self {
        Self {
            cell: cell.into(),
            adapter,
            op_timeout,
        }
    }

    fn credential_key(&self, username: &str) -> String {
        format!("ls/{}/auth/{}", self.cell, username)
    }

    /// Write (or overwrite) a user's credential digest. Used by cell
    /// setup and tests; the digest never leaves the store.
    pub async fn provision(&self, username: &str, password: &str) -> Result<()> {
        let digest = blake3::hash(password.as_bytes());
        let deadline = Instant::now() + self.op_timeout;
        self.adapter
            .put(
                &self.credential_key(username),
                digest.as_bytes().to_vec().into(),
                None,
                deadline,
            )
            .await?;
        debug!(%username, "credentials provisioned");
        Ok(())
    }
}

#[async_trait]
impl Authenticator for StoreAuthenticator {
    async fn authenticate(&self, username: &str, password: &str) -> Result<String> {
        let deadline = Instant::now() + self.op_timeout;
        let stored = self
            .adapter
            .get(&self.credential_key(username), deadline)
            .await?;
        let Some(stored) = stored else {
            trace!(%username, "unknown user");
            return Err(Error::Unauthorized {
                username: username.to_string(),
            });
        };
        let digest = blake3::hash(password.as_bytes());
        if stored.value.as_ref() != digest.as_bytes().as_slice() {
            trace!(%username, "credential digest mismatch");
            return Err(Error::Unauthorized {
                username: username.to_string(),
            });
        }
        Ok(username.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn provisioned_user_authenticates() {
        let adapter = Arc::new(LeaseStoreAdapter::new(Arc::new(MemoryStore::new())));
        let auth = StoreAuthenticator::new("test", adapter, Duration::from_millis(200));

        auth.provision("alice", "hunter2").await.unwrap();

        let principal = auth.authenticate("alice", "hunter2").await.unwrap();
        assert_eq!(principal, "alice");

        let err = auth.authenticate("alice", "wrong").await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized { .. }));

        let err = auth.authenticate("bob", "hunter2").await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized { .. }));
    }
}
