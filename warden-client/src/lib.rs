#![forbid(unsafe_code)]
#![warn(clippy::all)]

//! Client-side counterpart to a `warden` cell: session establishment,
//! periodic keep-alive, push-invalidated caching, and jeopardy handling.
//!
//! The client tracks the session's health in a small state machine
//! (`DISCONNECTED → CONNECTING → ACTIVE ↔ JEOPARDY → EXPIRED`). While the
//! session is in jeopardy, lock-dependent calls park until the cell either
//! confirms the lease again (held locks were never lost) or expires the
//! session (parked calls fail and all cached held-lock state is dropped).

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use warden::{
    cell::Cell,
    event::{Event, EventKind, EventTarget},
    session::SessionState,
    Error, LockMode, Result, SessionId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Active,
    Jeopardy,
    Expired,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    content: Bytes,
    generation: u64,
}

/// A client's coordination handle onto one cell.
///
/// Transport framing is out of scope, so the handle speaks to the cell
/// in-process through the same operation contracts an RPC shim would use.
#[derive(Debug)]
pub struct CoordinationClient {
    cell: Arc<Cell>,
    username: String,
    password: String,
    session: Mutex<Option<SessionId>>,
    last_session: Mutex<SessionId>,
    state: watch::Sender<ClientState>,
    cache: DashMap<String, CacheEntry>,
    held: DashMap<String, u64>,
    events: mpsc::UnboundedSender<Event>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CoordinationClient {
    /// Open a session on the cell and start the keep-alive and event-pump
    /// loops. Returns the handle and the feed of events the cell pushes.
    pub async fn connect(
        cell: Arc<Cell>,
        username: &str,
        password: &str,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<Event>)> {
        let (state, _) = watch::channel(ClientState::Connecting);
        let (events, events_rx) = mpsc::unbounded_channel();

        let opened = cell.open_session(username, password).await?;
        info!(session = %opened.session, %username, "session established");

        let client = Arc::new(Self {
            cell,
            username: username.to_string(),
            password: password.to_string(),
            session: Mutex::new(Some(opened.session)),
            last_session: Mutex::new(opened.session),
            state,
            cache: DashMap::new(),
            held: DashMap::new(),
            events,
            tasks: Mutex::new(Vec::new()),
        });
        client.state.send_replace(ClientState::Active);
        client.spawn_loops(opened.session, opened.ttl);
        Ok((client, events_rx))
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        *self.session.lock()
    }

    fn spawn_loops(self: &Arc<Self>, session: SessionId, ttl: Duration) {
        let mut tasks = self.tasks.lock();

        let keep_alive = {
            let client = self.clone();
            tokio::spawn(async move {
                let period = ttl / 3;
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if client.session_id() != Some(session) {
                        break;
                    }
                    match client.cell.keep_alive(session).await {
                        Ok(renewed) => {
                            let next = match renewed.state {
                                SessionState::Active => ClientState::Active,
                                SessionState::Jeopardy => ClientState::Jeopardy,
                                SessionState::Expired => ClientState::Expired,
                            };
                            if next == ClientState::Jeopardy {
                                warn!(%session, "lease in jeopardy, suspending lock-dependent calls");
                            }
                            if next == ClientState::Expired {
                                client.expire_locally(session);
                                break;
                            }
                            client.state.send_replace(next);
                        }
                        Err(Error::SessionExpired { .. }) | Err(Error::SessionNotFound { .. }) => {
                            client.expire_locally(session);
                            break;
                        }
                        Err(err) => {
                            warn!(%session, %err, "keep-alive attempt failed");
                        }
                    }
                }
            })
        };
        tasks.push(keep_alive);

        let pump = {
            let client = self.clone();
            tokio::spawn(async move {
                loop {
                    match client.cell.poll_event(session).await {
                        Ok(event) => {
                            client.apply_event(&event);
                            if client.events.send(event).is_err() {
                                // Nobody is listening; keep applying cache
                                // invalidations anyway.
                                trace!(%session, "event receiver dropped");
                            }
                        }
                        Err(_) => {
                            client.expire_locally(session);
                            break;
                        }
                    }
                }
            })
        };
        tasks.push(pump);
    }

    /// Server-push handling: drop cache entries the push invalidates and
    /// track jeopardy signals. Entries are refreshed lazily on the next
    /// read, never eagerly here.
    fn apply_event(&self, event: &Event) {
        match event.kind {
            EventKind::ContentInvalidated
            | EventKind::LockReleased
            | EventKind::LockConflict => {
                if let EventTarget::Lock(name) = &event.target {
                    if self.cache.remove(name).is_some() {
                        debug!(name = %name, kind = ?event.kind, "cache entry invalidated");
                    }
                }
            }
            EventKind::LeaseJeopardy => {
                self.state.send_replace(ClientState::Jeopardy);
            }
            EventKind::LockAcquired | EventKind::SessionExpired => {}
        }
    }

    fn expire_locally(&self, session: SessionId) {
        let mut current = self.session.lock();
        if *current != Some(session) {
            return;
        }
        *current = None;
        drop(current);
        warn!(%session, "session expired, discarding cached state");
        self.held.clear();
        self.cache.clear();
        self.state.send_replace(ClientState::Expired);
    }

    fn expired_error(&self) -> Error {
        Error::SessionExpired {
            session: *self.last_session.lock(),
        }
    }

    /// Park until the session is usable for lock-dependent work. Returns
    /// immediately when `ACTIVE`; waits out `JEOPARDY`; fails once the
    /// session is `EXPIRED` or the client disconnected.
    async fn gate(&self) -> Result<SessionId> {
        let mut rx = self.state.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            match current {
                ClientState::Active => {
                    return self.session_id().ok_or_else(|| self.expired_error());
                }
                ClientState::Connecting | ClientState::Jeopardy => {
                    if rx.changed().await.is_err() {
                        return Err(self.expired_error());
                    }
                }
                ClientState::Expired | ClientState::Disconnected => {
                    return Err(self.expired_error());
                }
            }
        }
    }

    /// Acquire a lock through the cell. Suspends while the session is in
    /// jeopardy; the grant's sequencer is remembered for later writes.
    pub async fn acquire(&self, name: &str, mode: LockMode, blocking: bool) -> Result<u64> {
        let session = self.gate().await?;
        match self.cell.acquire_lock(session, name, mode, blocking).await {
            Ok(sequencer) => {
                self.held.insert(name.to_string(), sequencer);
                Ok(sequencer)
            }
            Err(Error::SessionExpired { session }) => {
                self.expire_locally(session);
                Err(self.expired_error())
            }
            Err(err) => Err(err),
        }
    }

    pub async fn release(&self, name: &str) -> Result<()> {
        let session = self.gate().await?;
        self.cell.release_lock(session, name).await?;
        self.held.remove(name);
        self.cache.remove(name);
        Ok(())
    }

    /// Sequencer of a lock this client believes it holds.
    pub fn held_sequencer(&self, name: &str) -> Option<u64> {
        self.held.get(name).map(|entry| *entry.value())
    }

    pub fn subscribe(&self, name: &str) -> Result<()> {
        let session = self.session_id().ok_or_else(|| self.expired_error())?;
        self.cell.subscribe(session, name)
    }

    /// Read a content node, from cache when the cell has not invalidated
    /// it, otherwise from the cell (refilling the cache).
    pub async fn read(&self, name: &str) -> Result<(Bytes, u64)> {
        if let Some(entry) = self.cache.get(name) {
            trace!(name, "cache hit");
            return Ok((entry.content.clone(), entry.generation));
        }
        let (content, generation) = self.cell.read_content(name).await?;
        self.cache.insert(
            name.to_string(),
            CacheEntry {
                content: content.clone(),
                generation,
            },
        );
        Ok((content, generation))
    }

    /// Write a content node under the exclusive lock this client holds on
    /// it, presenting the remembered sequencer as proof of freshness.
    pub async fn write(&self, name: &str, data: Bytes) -> Result<u64> {
        let session = self.gate().await?;
        let sequencer = self
            .held_sequencer(name)
            .ok_or_else(|| Error::ModeConflict {
                name: name.to_string(),
            })?;
        let generation = self
            .cell
            .write_content(session, name, data, sequencer)
            .await?;
        self.cache.remove(name);
        Ok(generation)
    }

    /// Re-establish a fresh session after expiry. Held locks are gone by
    /// definition; the caller reacquires what it needs.
    pub async fn reconnect(&self) -> Result<Duration> {
        match self.state() {
            ClientState::Expired | ClientState::Disconnected => {}
            _ => {
                return Err(Error::Other(anyhow::anyhow!(
                    "reconnect only applies to an expired or disconnected client"
                )))
            }
        }
        let opened = self
            .cell
            .open_session(&self.username, &self.password)
            .await?;
        info!(session = %opened.session, "session re-established");
        *self.session.lock() = Some(opened.session);
        *self.last_session.lock() = opened.session;
        self.state.send_replace(ClientState::Active);
        Ok(opened.ttl)
    }

    /// Respawn background loops for the session created by `reconnect`.
    /// Split from `reconnect` so callers without an `Arc` can still
    /// re-establish; most callers use [`CoordinationClient::resume`].
    pub fn restart_loops(self: &Arc<Self>) -> Result<()> {
        let session = self.session_id().ok_or_else(|| self.expired_error())?;
        let ttl = Duration::from_millis(self.cell.config().session_ttl_ms);
        self.spawn_loops(session, ttl);
        Ok(())
    }

    /// `reconnect` plus loop restart.
    pub async fn resume(self: &Arc<Self>) -> Result<()> {
        let _ttl = self.reconnect().await?;
        self.restart_loops()
    }

    /// Voluntarily end the session and stop background work.
    pub async fn close(&self) -> Result<()> {
        let session = { self.session.lock().take() };
        if let Some(session) = session {
            self.cell.close_session(session).await?;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.held.clear();
        self.cache.clear();
        self.state.send_replace(ClientState::Disconnected);
        Ok(())
    }
}
