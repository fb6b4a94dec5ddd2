use crate::{
    adapter::LeaseStoreAdapter,
    auth::Authenticator,
    config::CellConfig,
    event::{Event, EventDispatcher, EventKind},
    lock::{LockInfo, LockTable},
    session::{KeepAlive, SessionManager},
    store::{Store, WatchEventKind},
    Error, LockMode, Result, SessionId,
};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, trace, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ContentRecord {
    data: Vec<u8>,
    generation: u64,
}

/// Result of opening a session: the id the client uses on every
/// subsequent call and the TTL it must renew within.
#[derive(Debug, Clone, Copy)]
pub struct OpenSession {
    pub session: SessionId,
    pub ttl: Duration,
}

/// One cell of the lock service: an explicitly constructed context
/// wiring the store adapter, session manager, lock table, and event
/// dispatcher together. Several cells can coexist in one process; they
/// share nothing.
#[derive(Debug)]
pub struct Cell {
    config: CellConfig,
    adapter: Arc<LeaseStoreAdapter>,
    sessions: Arc<SessionManager>,
    locks: Arc<LockTable>,
    dispatcher: Arc<EventDispatcher>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Cell {
    pub fn new(
        config: CellConfig,
        store: Arc<dyn Store>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Arc<Self> {
        let adapter = Arc::new(LeaseStoreAdapter::new(store));
        let dispatcher = Arc::new(EventDispatcher::new(config.event_queue_depth));
        let locks = Arc::new(LockTable::new(
            config.name.clone(),
            adapter.clone(),
            dispatcher.clone(),
            config.lock_quiescence(),
            config.keep_alive_timeout(),
        ));
        let sessions = Arc::new(SessionManager::new(
            config.clone(),
            adapter.clone(),
            locks.clone(),
            dispatcher.clone(),
            authenticator,
        ));
        Arc::new(Self {
            config,
            adapter,
            sessions,
            locks,
            dispatcher,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &CellConfig {
        &self.config
    }

    fn content_prefix(&self) -> String {
        format!("ls/{}/content/", self.config.name)
    }

    fn content_key(&self, name: &str) -> String {
        format!("{}{}", self.content_prefix(), name)
    }

    /// Spawn the cell's background work: the session/lock sweeper and
    /// the store watch consumer that turns content mutations into
    /// `CONTENT_INVALIDATED` notifications. Call once after construction.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();

        let sessions = self.sessions.clone();
        let locks = self.locks.clone();
        let interval = self.config.sweep_interval();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                sessions.sweep().await;
                locks.gc_idle();
            }
        }));

        let dispatcher = self.dispatcher.clone();
        let prefix = self.content_prefix();
        let mut watch = self.adapter.watch(&prefix);
        tasks.push(tokio::spawn(async move {
            while let Some(event) = watch.recv().await {
                if event.kind != WatchEventKind::Put {
                    continue;
                }
                let Some(name) = event.key.strip_prefix(&prefix) else {
                    continue;
                };
                trace!(name, "content changed, invalidating subscribers");
                dispatcher.publish_lock_event(EventKind::ContentInvalidated, name);
            }
        }));

        info!(cell = %self.config.name, "cell started");
    }

    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!(cell = %self.config.name, "cell shut down");
    }

    pub async fn open_session(&self, username: &str, password: &str) -> Result<OpenSession> {
        let session = self.sessions.open_session(username, password).await?;
        Ok(OpenSession {
            session: session.id,
            ttl: session.ttl(),
        })
    }

    pub async fn keep_alive(&self, session: SessionId) -> Result<KeepAlive> {
        self.sessions.keep_alive(session).await
    }

    pub async fn close_session(&self, session: SessionId) -> Result<()> {
        self.sessions.close_session(session).await
    }

    /// Acquire a named lock. See [`LockTable::acquire`] for the grant,
    /// queueing, and self-conflict rules.
    pub async fn acquire_lock(
        &self,
        session: SessionId,
        name: &str,
        mode: LockMode,
        blocking: bool,
    ) -> Result<u64> {
        let found = self.sessions.get(session)?;
        let sequencer = self
            .locks
            .acquire(session, found.lease, name, mode, blocking)
            .await?;
        found.note_acquired(name);
        Ok(sequencer)
    }

    pub async fn release_lock(&self, session: SessionId, name: &str) -> Result<()> {
        let found = self.sessions.get(session)?;
        self.locks.release(session, name).await?;
        found.note_released(name);
        Ok(())
    }

    /// Withdraw a blocking acquire that has not been granted yet.
    pub async fn cancel_acquire(&self, session: SessionId, name: &str) -> Result<()> {
        self.sessions.get(session)?;
        self.locks.cancel_acquire(session, name).await;
        Ok(())
    }

    pub fn current_sequencer(&self, name: &str) -> Result<u64> {
        self.locks.current_sequencer(name)
    }

    pub fn lock_info(&self, name: &str) -> Result<LockInfo> {
        self.locks.lock_info(name)
    }

    pub fn subscribe(&self, session: SessionId, name: &str) -> Result<()> {
        let found = self.sessions.get(session)?;
        self.dispatcher.subscribe(session, name);
        found.note_subscribed(name);
        Ok(())
    }

    pub fn unsubscribe(&self, session: SessionId, name: &str) -> Result<()> {
        let found = self.sessions.get(session)?;
        self.dispatcher.unsubscribe(session, name);
        found.note_unsubscribed(name);
        Ok(())
    }

    /// Next undelivered event for the session; blocks until one arrives.
    pub async fn poll_event(&self, session: SessionId) -> Result<Event> {
        self.dispatcher.poll(session).await
    }

    /// Read a content node's bytes and generation number.
    pub async fn read_content(&self, name: &str) -> Result<(Bytes, u64)> {
        let deadline = Instant::now() + self.config.keep_alive_timeout();
        let stored = self
            .adapter
            .get(&self.content_key(name), deadline)
            .await?
            .ok_or_else(|| Error::NoSuchLock {
                name: name.to_string(),
            })?;
        let record: ContentRecord = bincode::deserialize(&stored.value)?;
        Ok((Bytes::from(record.data), record.generation))
    }

    /// Overwrite a content node. The caller must hold the exclusive lock
    /// on `name` and present its current sequencer; a stale sequencer is
    /// refused, which is the whole point of sequencers.
    pub async fn write_content(
        &self,
        session: SessionId,
        name: &str,
        data: Bytes,
        sequencer: u64,
    ) -> Result<u64> {
        self.sessions.get(session)?;
        self.locks.validate_sequencer(session, name, sequencer)?;

        let key = self.content_key(name);
        let deadline = Instant::now() + self.config.keep_alive_timeout();
        for _ in 0..3 {
            let current = self.adapter.get(&key, deadline).await?;
            let (expected, generation) = match &current {
                Some(v) => {
                    let record: ContentRecord = bincode::deserialize(&v.value)?;
                    (Some(v.version), record.generation + 1)
                }
                None => (None, 1),
            };
            let record = ContentRecord {
                data: data.to_vec(),
                generation,
            };
            let value = bincode::serialize(&record)?;
            if self
                .adapter
                .compare_and_swap(&key, expected, value.into(), deadline)
                .await?
            {
                return Ok(generation);
            }
            warn!(name, "content version raced, retrying");
        }
        Err(Error::StoreUnavailable {
            reason: format!("content write on {name:?} kept racing"),
        })
    }
}
