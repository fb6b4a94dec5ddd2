use crate::{
    adapter::LeaseStoreAdapter,
    auth::Authenticator,
    config::CellConfig,
    event::{EventDispatcher, EventKind, EventTarget},
    lock::{LockTable, PurgeReason},
    Error, LeaseId, Result, SessionId,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Active,
    Jeopardy,
    Expired,
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    ttl: Duration,
    renewed_at: Instant,
    jeopardy_since: Option<Instant>,
    held_locks: HashSet<String>,
    subscriptions: HashSet<String>,
}

/// One client's leased connection to the cell: the unit of lock ownership
/// and liveness. State transitions are serialized by the inner mutex.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub identity: String,
    pub lease: LeaseId,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn ttl(&self) -> Duration {
        self.inner.lock().ttl
    }

    pub fn held_locks(&self) -> Vec<String> {
        self.inner.lock().held_locks.iter().cloned().collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.lock().subscriptions.iter().cloned().collect()
    }

    pub(crate) fn note_acquired(&self, name: &str) {
        self.inner.lock().held_locks.insert(name.to_string());
    }

    pub(crate) fn note_released(&self, name: &str) {
        self.inner.lock().held_locks.remove(name);
    }

    pub(crate) fn note_subscribed(&self, name: &str) {
        self.inner.lock().subscriptions.insert(name.to_string());
    }

    pub(crate) fn note_unsubscribed(&self, name: &str) {
        self.inner.lock().subscriptions.remove(name);
    }
}

/// What a keep-alive observed: the session's state after the renewal
/// attempt and how long it remains valid. Jeopardy is reported as data
/// rather than an error, so a client can distinguish "renewed" from
/// "renewal pending, suspend lock-dependent work" without special-casing
/// transport failures.
#[derive(Debug, Clone, Copy)]
pub struct KeepAlive {
    pub state: SessionState,
    pub ttl_remaining: Duration,
}

/// Record persisted under the cell namespace for visibility; attached to
/// the session's lease so store-side expiry erases it.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionRecord {
    session: SessionId,
    identity: String,
}

/// Owns every session in the cell: creation, keep-alive, jeopardy
/// detection, and expiry. The store lease backing each session carries
/// all of the session's lock-ownership keys, so revoking it on expiry
/// releases everything in one logical step.
#[derive(Debug)]
pub struct SessionManager {
    cell: String,
    config: CellConfig,
    adapter: Arc<LeaseStoreAdapter>,
    locks: Arc<LockTable>,
    dispatcher: Arc<EventDispatcher>,
    authenticator: Arc<dyn Authenticator>,
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl SessionManager {
    pub fn new(
        config: CellConfig,
        adapter: Arc<LeaseStoreAdapter>,
        locks: Arc<LockTable>,
        dispatcher: Arc<EventDispatcher>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            cell: config.name.clone(),
            config,
            adapter,
            locks,
            dispatcher,
            authenticator,
            sessions: DashMap::new(),
        }
    }

    fn session_key(&self, session: SessionId) -> String {
        format!("ls/{}/session/{}", self.cell, session)
    }

    /// Authenticate and create a new `ACTIVE` session wrapping a fresh
    /// store lease. The store lease TTL covers the session TTL plus the
    /// grace window: the coordination layer decides expiry, the store
    /// lease is the backstop that erases ownership keys if the cell dies.
    pub async fn open_session(&self, username: &str, password: &str) -> Result<Arc<Session>> {
        let identity = self.authenticator.authenticate(username, password).await?;

        let deadline = Instant::now() + self.config.keep_alive_timeout();
        let store_ttl = self.config.session_ttl() + self.config.grace_period();
        let lease = self.adapter.create_lease(store_ttl, deadline).await?;

        let session = Arc::new(Session {
            id: SessionId::new(),
            identity: identity.clone(),
            lease,
            inner: Mutex::new(SessionInner {
                state: SessionState::Active,
                ttl: self.config.session_ttl(),
                renewed_at: Instant::now(),
                jeopardy_since: None,
                held_locks: HashSet::new(),
                subscriptions: HashSet::new(),
            }),
        });

        self.dispatcher.register(session.id);

        let record = SessionRecord {
            session: session.id,
            identity,
        };
        let value = bincode::serialize(&record)?;
        if let Err(err) = self
            .adapter
            .put(&self.session_key(session.id), value.into(), Some(lease), deadline)
            .await
        {
            self.dispatcher.unregister(session.id);
            let _ = self.adapter.revoke_lease(lease, deadline).await;
            return Err(err);
        }

        info!(session = %session.id, identity = %session.identity, "session opened");
        self.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    /// Look up a live session. `Expired` sessions are indistinguishable
    /// from garbage-collected ones to callers: both are `SessionExpired`
    /// if recently known, `SessionNotFound` otherwise.
    pub fn get(&self, session: SessionId) -> Result<Arc<Session>> {
        let found = self
            .sessions
            .get(&session)
            .map(|entry| entry.value().clone())
            .ok_or(Error::SessionNotFound { session })?;
        if found.state() == SessionState::Expired {
            return Err(Error::SessionExpired { session });
        }
        Ok(found)
    }

    /// Renew the session's lease. Returns the post-renewal state: a
    /// successful round-trip re-activates a jeopardized session; retry
    /// exhaustion inside the keep-alive window transitions it to
    /// jeopardy instead of hanging.
    pub async fn keep_alive(&self, session: SessionId) -> Result<KeepAlive> {
        let found = self.get(session)?;
        let deadline = Instant::now() + self.config.keep_alive_timeout();

        match self.adapter.keep_alive_lease(found.lease, deadline).await {
            Ok(_) => {
                let mut inner = found.inner.lock();
                if inner.state == SessionState::Expired {
                    return Err(Error::SessionExpired { session });
                }
                if inner.state == SessionState::Jeopardy {
                    debug!(%session, "jeopardy cleared by successful keep-alive");
                }
                inner.state = SessionState::Active;
                inner.jeopardy_since = None;
                inner.renewed_at = Instant::now();
                Ok(KeepAlive {
                    state: SessionState::Active,
                    ttl_remaining: inner.ttl,
                })
            }
            Err(Error::StoreUnavailable { reason }) => {
                warn!(%session, %reason, "keep-alive could not reach the store");
                let state = self.enter_jeopardy(&found);
                if state == SessionState::Expired {
                    return Err(Error::SessionExpired { session });
                }
                let remaining = {
                    let inner = found.inner.lock();
                    let grace_end = inner
                        .jeopardy_since
                        .map(|at| at + self.config.grace_period())
                        .unwrap_or_else(|| Instant::now() + self.config.grace_period());
                    grace_end.saturating_duration_since(Instant::now())
                };
                Ok(KeepAlive {
                    state,
                    ttl_remaining: remaining,
                })
            }
            Err(Error::LeaseExpired { .. }) | Err(Error::LeaseNotFound { .. }) => {
                warn!(%session, "backing lease is gone, expiring session");
                self.expire_session(session).await;
                Err(Error::SessionExpired { session })
            }
            Err(other) => Err(other),
        }
    }

    /// Voluntary termination. Idempotent: closing an unknown or already
    /// expired session is a no-op.
    pub async fn close_session(&self, session: SessionId) -> Result<()> {
        let Some((_, found)) = self.sessions.remove(&session) else {
            trace!(%session, "close of unknown session ignored");
            return Ok(());
        };
        {
            let mut inner = found.inner.lock();
            if inner.state == SessionState::Expired {
                return Ok(());
            }
            inner.state = SessionState::Expired;
        }
        info!(%session, "session closed");

        self.locks.purge_session(session, PurgeReason::Closed).await;
        self.dispatcher.unregister(session);

        let deadline = Instant::now() + self.config.keep_alive_timeout();
        if let Err(err) = self.adapter.revoke_lease(found.lease, deadline).await {
            warn!(%session, %err, "failed to revoke lease on close");
        }
        if let Err(err) = self.adapter.delete(&self.session_key(session), deadline).await {
            trace!(%session, %err, "session record delete skipped");
        }
        Ok(())
    }

    fn enter_jeopardy(&self, session: &Arc<Session>) -> SessionState {
        let mut inner = session.inner.lock();
        match inner.state {
            SessionState::Active => {
                inner.state = SessionState::Jeopardy;
                inner.jeopardy_since = Some(Instant::now());
                drop(inner);
                warn!(session = %session.id, "session entered jeopardy");
                self.dispatcher.publish_to(
                    EventKind::LeaseJeopardy,
                    EventTarget::Session(session.id),
                    [session.id],
                );
                SessionState::Jeopardy
            }
            state => state,
        }
    }

    /// Periodic scan driven by the cell sweeper: misses the renewal
    /// deadline into jeopardy, and jeopardy past the grace window into
    /// expiry.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let mut to_jeopardy = Vec::new();
        let mut to_expire = Vec::new();

        for entry in self.sessions.iter() {
            let session = entry.value();
            let inner = session.inner.lock();
            match inner.state {
                SessionState::Active => {
                    let margin = self.config.jeopardy_margin();
                    let deadline = inner.renewed_at + inner.ttl.saturating_sub(margin);
                    if now >= deadline {
                        to_jeopardy.push(session.clone());
                    }
                }
                SessionState::Jeopardy => {
                    if let Some(since) = inner.jeopardy_since {
                        if now.duration_since(since) >= self.config.grace_period() {
                            to_expire.push(session.id);
                        }
                    }
                }
                SessionState::Expired => {}
            }
        }

        for session in to_jeopardy {
            self.enter_jeopardy(&session);
        }
        futures::future::join_all(
            to_expire
                .into_iter()
                .map(|session| self.expire_session(session)),
        )
        .await;
    }

    /// Terminal transition: revoke the lease (the store erases every
    /// attached ownership key in one step), release and re-arbitrate all
    /// held locks, notify subscribers of those locks, and discard the
    /// session's event queue.
    pub async fn expire_session(&self, session: SessionId) {
        let Some((_, found)) = self.sessions.remove(&session) else {
            return;
        };
        {
            let mut inner = found.inner.lock();
            if inner.state == SessionState::Expired {
                return;
            }
            inner.state = SessionState::Expired;
        }
        info!(%session, identity = %found.identity, "session expired");

        let deadline = Instant::now() + self.config.keep_alive_timeout();
        if let Err(err) = self.adapter.revoke_lease(found.lease, deadline).await {
            warn!(%session, %err, "failed to revoke lease on expiry");
        }

        let released = self.locks.purge_session(session, PurgeReason::Expired).await;
        for name in &released {
            let recipients: Vec<SessionId> = self
                .dispatcher
                .subscribers_of(name)
                .into_iter()
                .filter(|id| *id != session)
                .collect();
            self.dispatcher.publish_to(
                EventKind::SessionExpired,
                EventTarget::Session(session),
                recipients,
            );
        }

        self.dispatcher.unregister(session);
        if let Err(err) = self.adapter.delete(&self.session_key(session), deadline).await {
            trace!(%session, %err, "session record delete skipped");
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
