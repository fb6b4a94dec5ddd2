use crate::{
    adapter::LeaseStoreAdapter,
    event::{EventDispatcher, EventKind, EventTarget},
    Error, LeaseId, LockMode, Result, SessionId,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Durable record of one session's hold on a lock, written with the
/// holder's lease attached so store-side lease expiry cascades to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct HolderRecord {
    session: SessionId,
    mode: LockMode,
    sequencer: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockMeta {
    sequencer: u64,
}

/// Introspection snapshot of one lock's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub name: String,
    pub mode: Option<LockMode>,
    pub holders: Vec<SessionId>,
    pub sequencer: u64,
    pub conflicts: u64,
    pub waiters: usize,
}

#[derive(Debug)]
struct Waiter {
    session: SessionId,
    lease: LeaseId,
    mode: LockMode,
    tx: oneshot::Sender<Result<u64>>,
}

#[derive(Debug)]
struct LockRecord {
    mode: LockMode,
    holders: HashSet<SessionId>,
    sequencer: u64,
    conflicts: u64,
    wait_queue: VecDeque<Waiter>,
    freed_at: Option<Instant>,
}

impl LockRecord {
    fn new() -> Self {
        Self {
            mode: LockMode::Shared,
            holders: HashSet::new(),
            sequencer: 0,
            conflicts: 0,
            wait_queue: VecDeque::new(),
            freed_at: None,
        }
    }

    fn mark_if_idle(&mut self, now: Instant) {
        if self.holders.is_empty() && self.wait_queue.is_empty() {
            self.freed_at.get_or_insert(now);
        }
    }

    /// Pop every waiter grantable right now, FIFO. An exclusive grant
    /// stops the scan; a run of shared waiters at the head is granted
    /// together. Caller finalizes (persists and notifies) the grants.
    fn take_grants(&mut self) -> Vec<Grant> {
        let mut grants = Vec::new();
        while let Some(head) = self.wait_queue.front() {
            let grantable = if self.holders.is_empty() {
                true
            } else {
                head.mode.compatible_with(self.mode)
            };
            if !grantable {
                break;
            }
            let waiter = self.wait_queue.pop_front().unwrap();
            let exclusive = waiter.mode == LockMode::Exclusive;
            if exclusive {
                self.sequencer += 1;
            }
            self.holders.insert(waiter.session);
            self.mode = waiter.mode;
            self.freed_at = None;
            grants.push(Grant {
                session: waiter.session,
                lease: waiter.lease,
                mode: waiter.mode,
                sequencer: self.sequencer,
                tx: waiter.tx,
            });
            if exclusive {
                break;
            }
        }
        grants
    }
}

#[derive(Debug)]
struct Grant {
    session: SessionId,
    lease: LeaseId,
    mode: LockMode,
    sequencer: u64,
    tx: oneshot::Sender<Result<u64>>,
}

/// Why a session's holds and queued requests are being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeReason {
    Expired,
    Closed,
}

/// Arbitration for named advisory locks: holder sets, modes, sequencers,
/// and FIFO wait queues. Each lock name has its own critical section; no
/// mutex is held across an await. Ownership is persisted through the store
/// adapter with the holder's lease attached, and arbitration fails closed
/// when that write fails.
#[derive(Debug)]
pub struct LockTable {
    cell: String,
    locks: DashMap<String, Arc<Mutex<LockRecord>>>,
    adapter: Arc<LeaseStoreAdapter>,
    dispatcher: Arc<EventDispatcher>,
    quiescence: Duration,
    op_timeout: Duration,
}

enum AcquireDecision {
    Granted(u64),
    AlreadyHeld(u64),
    Conflict,
    Queued(oneshot::Receiver<Result<u64>>),
}

impl LockTable {
    pub fn new(
        cell: impl Into<String>,
        adapter: Arc<LeaseStoreAdapter>,
        dispatcher: Arc<EventDispatcher>,
        quiescence: Duration,
        op_timeout: Duration,
    ) -> Self {
        Self {
            cell: cell.into(),
            locks: DashMap::new(),
            adapter,
            dispatcher,
            quiescence,
            op_timeout,
        }
    }

    fn holder_key(&self, name: &str, session: SessionId) -> String {
        format!("ls/{}/lock/{}/holder/{}", self.cell, name, session)
    }

    fn meta_key(&self, name: &str) -> String {
        format!("ls/{}/lock/{}/meta", self.cell, name)
    }

    fn record(&self, name: &str) -> Arc<Mutex<LockRecord>> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(LockRecord::new())))
            .clone()
    }

    /// Acquire `name` in `mode` for `session`.
    ///
    /// Grants immediately when the wait queue is empty and the mode is
    /// compatible with the current holders; otherwise fails with
    /// `ModeConflict` when `blocking` is false, or suspends FIFO in the
    /// wait queue until granted, cancelled, or the session expires.
    /// Re-acquiring an already held lock in the same mode returns the
    /// current sequencer; requesting an incompatible mode against one's
    /// own hold fails immediately with `ModeConflict` rather than
    /// self-deadlocking.
    pub async fn acquire(
        &self,
        session: SessionId,
        lease: LeaseId,
        name: &str,
        mode: LockMode,
        blocking: bool,
    ) -> Result<u64> {
        let record = self.record(name);
        let decision = {
            let mut rec = record.lock();
            if rec.holders.contains(&session) {
                if mode == rec.mode {
                    AcquireDecision::AlreadyHeld(rec.sequencer)
                } else {
                    rec.conflicts += 1;
                    AcquireDecision::Conflict
                }
            } else if rec.wait_queue.is_empty()
                && (rec.holders.is_empty() || mode.compatible_with(rec.mode))
            {
                if mode == LockMode::Exclusive {
                    rec.sequencer += 1;
                }
                rec.holders.insert(session);
                rec.mode = mode;
                rec.freed_at = None;
                AcquireDecision::Granted(rec.sequencer)
            } else if !blocking {
                rec.conflicts += 1;
                AcquireDecision::Conflict
            } else {
                rec.conflicts += 1;
                let (tx, rx) = oneshot::channel();
                rec.wait_queue.push_back(Waiter {
                    session,
                    lease,
                    mode,
                    tx,
                });
                AcquireDecision::Queued(rx)
            }
        };

        match decision {
            AcquireDecision::AlreadyHeld(seq) => Ok(seq),
            AcquireDecision::Granted(seq) => {
                if let Err(err) = self.persist_hold(name, session, lease, mode, seq).await {
                    // Fail closed: withdraw the grant we just made.
                    let grants = {
                        let mut rec = record.lock();
                        rec.holders.remove(&session);
                        let grants = rec.take_grants();
                        rec.mark_if_idle(Instant::now());
                        grants
                    };
                    self.finalize_grants(name, grants).await;
                    return Err(err);
                }
                debug!(%session, name, ?mode, seq, "lock granted");
                self.notify_granted(name, session);
                Ok(seq)
            }
            AcquireDecision::Conflict => {
                trace!(%session, name, ?mode, "acquire refused, conflicting hold");
                self.dispatcher.publish_lock_event(EventKind::LockConflict, name);
                Err(Error::ModeConflict {
                    name: name.to_string(),
                })
            }
            AcquireDecision::Queued(rx) => {
                trace!(%session, name, ?mode, "acquire queued");
                self.dispatcher.publish_lock_event(EventKind::LockConflict, name);
                match rx.await {
                    Ok(result) => result,
                    Err(_) => Err(Error::AcquireCancelled {
                        name: name.to_string(),
                    }),
                }
            }
        }
    }

    /// Release `session`'s hold on `name`. A no-op for non-holders, so
    /// teardown paths can call it unconditionally. Emits `LOCK_RELEASED`
    /// and grants the next compatible waiter(s) FIFO.
    pub async fn release(&self, session: SessionId, name: &str) -> Result<()> {
        let Some(record) = self.locks.get(name).map(|e| e.value().clone()) else {
            return Ok(());
        };
        let grants = {
            let mut rec = record.lock();
            if !rec.holders.remove(&session) {
                trace!(%session, name, "release by non-holder ignored");
                return Ok(());
            }
            let grants = rec.take_grants();
            rec.mark_if_idle(Instant::now());
            grants
        };

        let deadline = Instant::now() + self.op_timeout;
        if let Err(err) = self
            .adapter
            .delete(&self.holder_key(name, session), deadline)
            .await
        {
            warn!(%session, name, %err, "failed to delete holder key");
        }
        debug!(%session, name, "lock released");
        self.notify_released(name, session);
        self.finalize_grants(name, grants).await;
        Ok(())
    }

    /// Tear down every hold and queued request owned by `session`,
    /// re-arbitrating each affected lock. Returns the names the session
    /// actually held. Queued requests fail with `SessionExpired` on
    /// expiry and `AcquireCancelled` on voluntary close.
    pub async fn purge_session(&self, session: SessionId, reason: PurgeReason) -> Vec<String> {
        let records: Vec<(String, Arc<Mutex<LockRecord>>)> = self
            .locks
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut released = Vec::new();
        for (name, record) in records {
            let (held, dropped_waiters, grants) = {
                let mut rec = record.lock();
                let held = rec.holders.remove(&session);
                let mut dropped = Vec::new();
                rec.wait_queue.retain_mut(|waiter| {
                    if waiter.session == session {
                        // tx is consumed outside the retain closure.
                        let (tx, _) = oneshot::channel();
                        dropped.push(std::mem::replace(&mut waiter.tx, tx));
                        false
                    } else {
                        true
                    }
                });
                let grants = if held || !dropped.is_empty() {
                    rec.take_grants()
                } else {
                    Vec::new()
                };
                rec.mark_if_idle(Instant::now());
                (held, dropped, grants)
            };

            for tx in dropped_waiters {
                let err = match reason {
                    PurgeReason::Expired => Error::SessionExpired { session },
                    PurgeReason::Closed => Error::AcquireCancelled { name: name.clone() },
                };
                let _ = tx.send(Err(err));
            }

            if held {
                if reason == PurgeReason::Closed {
                    // On expiry the lease revocation cascade removes the
                    // holder key in the store's single logical step.
                    let deadline = Instant::now() + self.op_timeout;
                    if let Err(err) = self
                        .adapter
                        .delete(&self.holder_key(&name, session), deadline)
                        .await
                    {
                        warn!(%session, name = %name, %err, "failed to delete holder key");
                    }
                }
                self.notify_released(&name, session);
                released.push(name.clone());
            }
            self.finalize_grants(&name, grants).await;
        }
        released
    }

    /// Withdraw a queued (not yet granted) acquire. The suspended call
    /// fails with `AcquireCancelled`.
    pub async fn cancel_acquire(&self, session: SessionId, name: &str) {
        let Some(record) = self.locks.get(name).map(|e| e.value().clone()) else {
            return;
        };
        let (cancelled, grants) = {
            let mut rec = record.lock();
            let mut cancelled = Vec::new();
            rec.wait_queue.retain_mut(|waiter| {
                if waiter.session == session {
                    let (tx, _) = oneshot::channel();
                    cancelled.push(std::mem::replace(&mut waiter.tx, tx));
                    false
                } else {
                    true
                }
            });
            let grants = rec.take_grants();
            rec.mark_if_idle(Instant::now());
            (cancelled, grants)
        };
        for tx in cancelled {
            let _ = tx.send(Err(Error::AcquireCancelled {
                name: name.to_string(),
            }));
        }
        self.finalize_grants(name, grants).await;
    }

    /// Read-only freshness check: the sequencer a holder would need to
    /// present to prove its exclusive grant is still current.
    pub fn current_sequencer(&self, name: &str) -> Result<u64> {
        match self.locks.get(name) {
            Some(record) => Ok(record.value().lock().sequencer),
            None => Err(Error::NoSuchLock {
                name: name.to_string(),
            }),
        }
    }

    pub fn lock_info(&self, name: &str) -> Result<LockInfo> {
        let record = self.locks.get(name).ok_or_else(|| Error::NoSuchLock {
            name: name.to_string(),
        })?;
        let rec = record.value().lock();
        Ok(LockInfo {
            name: name.to_string(),
            mode: if rec.holders.is_empty() {
                None
            } else {
                Some(rec.mode)
            },
            holders: rec.holders.iter().copied().collect(),
            sequencer: rec.sequencer,
            conflicts: rec.conflicts,
            waiters: rec.wait_queue.len(),
        })
    }

    /// True when `session` holds `name` exclusively with this sequencer.
    pub fn validate_sequencer(&self, session: SessionId, name: &str, sequencer: u64) -> Result<()> {
        let record = self.locks.get(name).ok_or_else(|| Error::NoSuchLock {
            name: name.to_string(),
        })?;
        let rec = record.value().lock();
        if !rec.holders.contains(&session) || rec.mode != LockMode::Exclusive {
            return Err(Error::ModeConflict {
                name: name.to_string(),
            });
        }
        if rec.sequencer != sequencer {
            return Err(Error::StaleSequencer {
                name: name.to_string(),
                presented: sequencer,
                current: rec.sequencer,
            });
        }
        Ok(())
    }

    /// Drop lock records that have been idle past the quiescence window.
    /// The delay keeps sequencer state stable long enough for in-flight
    /// freshness checks to complete against the record that issued them.
    pub fn gc_idle(&self) {
        let now = Instant::now();
        self.locks.retain(|name, record| {
            let rec = record.lock();
            let idle = rec.holders.is_empty() && rec.wait_queue.is_empty();
            let expired = idle
                && rec
                    .freed_at
                    .map(|at| now.duration_since(at) >= self.quiescence)
                    .unwrap_or(false);
            if expired {
                trace!(name = %name, "reclaiming idle lock record");
            }
            !expired
        });
    }

    async fn persist_hold(
        &self,
        name: &str,
        session: SessionId,
        lease: LeaseId,
        mode: LockMode,
        sequencer: u64,
    ) -> Result<()> {
        let deadline = Instant::now() + self.op_timeout;
        let holder = HolderRecord {
            session,
            mode,
            sequencer,
        };
        let value = bincode::serialize(&holder)?;
        self.adapter
            .put(
                &self.holder_key(name, session),
                value.into(),
                Some(lease),
                deadline,
            )
            .await?;
        if mode == LockMode::Exclusive {
            let meta = bincode::serialize(&LockMeta { sequencer })?;
            if let Err(err) = self
                .adapter
                .put(&self.meta_key(name), meta.into(), None, deadline)
                .await
            {
                warn!(name, %err, "failed to persist lock meta");
            }
        }
        Ok(())
    }

    fn notify_granted(&self, name: &str, session: SessionId) {
        let mut recipients = self.dispatcher.subscribers_of(name);
        recipients.push(session);
        self.dispatcher
            .publish_to(EventKind::LockAcquired, EventTarget::Lock(name.to_string()), recipients);
    }

    fn notify_released(&self, name: &str, session: SessionId) {
        let mut recipients = self.dispatcher.subscribers_of(name);
        recipients.push(session);
        self.dispatcher
            .publish_to(EventKind::LockReleased, EventTarget::Lock(name.to_string()), recipients);
    }

    /// Persist and announce grants decided during arbitration. A grant
    /// whose waiter vanished or whose store write fails is withdrawn and
    /// arbitration re-runs, so the queue never stalls behind a dead entry.
    async fn finalize_grants(&self, name: &str, grants: Vec<Grant>) {
        let mut pending = grants;
        while !pending.is_empty() {
            let mut withdrawn = Vec::new();
            for grant in pending.drain(..) {
                let persisted = self
                    .persist_hold(name, grant.session, grant.lease, grant.mode, grant.sequencer)
                    .await;
                match persisted {
                    Ok(()) => {
                        if grant.tx.send(Ok(grant.sequencer)).is_ok() {
                            debug!(session = %grant.session, name, seq = grant.sequencer, "queued waiter granted");
                            self.notify_granted(name, grant.session);
                        } else {
                            trace!(session = %grant.session, name, "waiter gone, withdrawing grant");
                            withdrawn.push(grant.session);
                        }
                    }
                    Err(err) => {
                        warn!(session = %grant.session, name, %err, "failed to persist grant, withdrawing");
                        let _ = grant.tx.send(Err(err));
                        withdrawn.push(grant.session);
                    }
                }
            }
            if withdrawn.is_empty() {
                break;
            }
            let Some(record) = self.locks.get(name).map(|e| e.value().clone()) else {
                break;
            };
            pending = {
                let mut rec = record.lock();
                for session in withdrawn {
                    rec.holders.remove(&session);
                }
                let grants = rec.take_grants();
                rec.mark_if_idle(Instant::now());
                grants
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn table() -> (LockTable, Arc<LeaseStoreAdapter>) {
        let store = Arc::new(MemoryStore::new());
        let adapter = Arc::new(LeaseStoreAdapter::new(store));
        let dispatcher = Arc::new(EventDispatcher::new(64));
        let table = LockTable::new(
            "test",
            adapter.clone(),
            dispatcher,
            Duration::from_secs(5),
            Duration::from_millis(200),
        );
        (table, adapter)
    }

    async fn lease(adapter: &LeaseStoreAdapter) -> LeaseId {
        let deadline = Instant::now() + Duration::from_millis(200);
        adapter
            .create_lease(Duration::from_secs(60), deadline)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn exclusive_grant_bumps_sequencer() {
        let (table, adapter) = table();
        let s1 = SessionId::new();
        let seq = table
            .acquire(s1, lease(&adapter).await, "l", LockMode::Exclusive, false)
            .await
            .unwrap();
        assert_eq!(seq, 1);
        assert_eq!(table.current_sequencer("l").unwrap(), 1);
    }

    #[tokio::test]
    async fn shared_holders_coexist() {
        let (table, adapter) = table();
        let s1 = SessionId::new();
        let s2 = SessionId::new();
        table
            .acquire(s1, lease(&adapter).await, "l", LockMode::Shared, false)
            .await
            .unwrap();
        table
            .acquire(s2, lease(&adapter).await, "l", LockMode::Shared, false)
            .await
            .unwrap();
        let info = table.lock_info("l").unwrap();
        assert_eq!(info.holders.len(), 2);
        assert_eq!(info.mode, Some(LockMode::Shared));
    }

    #[tokio::test]
    async fn self_upgrade_is_refused() {
        let (table, adapter) = table();
        let s1 = SessionId::new();
        let held = lease(&adapter).await;
        table
            .acquire(s1, held, "l", LockMode::Shared, false)
            .await
            .unwrap();
        let err = table
            .acquire(s1, held, "l", LockMode::Exclusive, true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ModeConflict { .. }));
    }

    #[tokio::test]
    async fn dead_lease_fails_closed() {
        let (table, _adapter) = table();
        let s1 = SessionId::new();
        let err = table
            .acquire(s1, LeaseId::new(), "l", LockMode::Exclusive, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LeaseNotFound { .. }));
        assert!(table.lock_info("l").unwrap().holders.is_empty());
    }

    #[tokio::test]
    async fn gc_respects_quiescence() {
        let (table, adapter) = table();
        let s1 = SessionId::new();
        table
            .acquire(s1, lease(&adapter).await, "l", LockMode::Exclusive, false)
            .await
            .unwrap();
        table.release(s1, "l").await.unwrap();

        table.gc_idle();
        assert!(table.current_sequencer("l").is_ok(), "still in quiescence");
    }
}
