// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Session registry, the single source of truth for live sessions.
//
// Every entry owns its expiry timer: a tokio task sleeping until the deadline.
// Timers carry the entry's generation at scheduling time and act only if it
// is still current, so an extend or terminate can never be followed by a
// stale expiry. Lookups check the deadline too; an expired session is never
// handed out, even if its timer has not run yet.
//
// Callers only ever receive copies of `Session`. Expiry is published as a
// `SessionEvent::Expired` for the cleanup orchestrator to act on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use kioskwerk_core::error::{KioskError, Result};
use kioskwerk_core::types::{FileRecord, PaymentStatus, Session, SessionId, SessionStatus};
use kioskwerk_security::{AuditEvent, AuditEventKind, AuditSink, SecureStorage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::audit;

/// Shortest timeout the registry will schedule.
const MIN_TIMEOUT: Duration = Duration::from_millis(1);

/// Outbound notifications from the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Created(SessionId),
    StatusChanged {
        session_id: SessionId,
        from: SessionStatus,
        to: SessionStatus,
    },
    /// The session passed its deadline. It is hidden from lookups but stays
    /// enumerable until its workspace has been destroyed.
    Expired(SessionId),
}

struct Entry {
    session: Session,
    deadline: Instant,
    generation: u64,
    timer: Option<JoinHandle<()>>,
    /// Expired or handed to cleanup. Invisible to lookups and mutations.
    terminating: bool,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        !self.terminating && now < self.deadline
    }
}

struct RegistryInner {
    sessions: Mutex<HashMap<SessionId, Entry>>,
    storage: Arc<SecureStorage>,
    audit: Arc<dyn AuditSink>,
    events: mpsc::Sender<SessionEvent>,
    timeout: Duration,
}

/// Cloneable handle to the registry.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    /// Build a registry and the receiving end of its event channel.
    pub fn new(
        storage: Arc<SecureStorage>,
        audit: Arc<dyn AuditSink>,
        timeout: Duration,
        event_buffer: usize,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (events, rx) = mpsc::channel(event_buffer.max(1));
        let registry = Self {
            inner: Arc::new(RegistryInner {
                sessions: Mutex::new(HashMap::new()),
                storage,
                audit,
                events,
                timeout: timeout.max(MIN_TIMEOUT),
            }),
        };
        (registry, rx)
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, Entry>> {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    // -- Creation -------------------------------------------------------------

    /// Create a session, materialise its workspace and start its timer.
    ///
    /// If the workspace cannot be created no entry is left behind.
    #[instrument(skip(self))]
    pub async fn create(&self, shop_id: &str) -> Result<SessionId> {
        let timeout = self.inner.timeout;
        let session = Session::new(shop_id, timeout);
        let id = session.id.clone();

        let storage = Arc::clone(&self.inner.storage);
        let workspace_id = id.clone();
        tokio::task::spawn_blocking(move || storage.create_workspace(&workspace_id))
            .await
            .map_err(|e| KioskError::Workspace(format!("workspace task failed: {e}")))?
            .map_err(|e| KioskError::Workspace(e.to_string()))?;

        let deadline = Instant::now() + timeout;
        {
            let mut sessions = self.sessions();
            let timer = self.schedule(id.clone(), 0, deadline);
            sessions.insert(
                id.clone(),
                Entry {
                    session,
                    deadline,
                    generation: 0,
                    timer: Some(timer),
                    terminating: false,
                },
            );
        }

        info!(session_id = %id, timeout_secs = timeout.as_secs(), "session created");
        audit(
            self.inner.audit.as_ref(),
            AuditEvent::new(AuditEventKind::SessionCreated, Some(&id))
                .detail("shop_id", shop_id)
                .detail("timeout_secs", timeout.as_secs()),
        );
        self.publish(SessionEvent::Created(id.clone()));
        Ok(id)
    }

    fn schedule(&self, id: SessionId, generation: u64, deadline: Instant) -> JoinHandle<()> {
        let registry = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = registry.upgrade() {
                SessionRegistry { inner }.expire(&id, Some(generation));
            }
        })
    }

    // -- Queries --------------------------------------------------------------

    /// Copy of the session, or `None` if it is unknown, terminating or past
    /// its deadline.
    ///
    /// An expired session found here is expired on the spot.
    pub fn get_status(&self, id: &SessionId) -> Option<Session> {
        {
            let sessions = self.sessions();
            let entry = sessions.get(id)?;
            if entry.terminating {
                return None;
            }
            if Instant::now() < entry.deadline {
                return Some(entry.session.clone());
            }
        }
        debug!(session_id = %id, "lookup found an expired session");
        self.expire(id, None);
        None
    }

    /// True if the session is live and `Active`.
    ///
    /// Pure read: an expired session is reported inactive but not expired
    /// here, so this is safe to call while holding a storage session lock.
    pub fn is_active(&self, id: &SessionId) -> bool {
        self.sessions()
            .get(id)
            .is_some_and(|e| e.is_live(Instant::now()) && e.session.status == SessionStatus::Active)
    }

    /// True if the registry holds an entry for `id`, including one that has
    /// expired or is being cleaned up.
    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions().contains_key(id)
    }

    /// Every entry whose workspace has not yet been destroyed, live or not.
    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Sessions still within their deadline and not being cleaned up.
    pub fn active_count(&self) -> usize {
        let now = Instant::now();
        self.sessions().values().filter(|e| e.is_live(now)).count()
    }

    // -- Mutation -------------------------------------------------------------

    /// Run `f` against a live entry. Absent or terminating → `SessionNotFound`;
    /// past its deadline → expired now and `SessionExpired`.
    fn with_live<T>(&self, id: &SessionId, f: impl FnOnce(&mut Entry) -> Result<T>) -> Result<T> {
        let outcome = {
            let mut sessions = self.sessions();
            match sessions.get_mut(id) {
                None => return Err(KioskError::SessionNotFound(id.to_string())),
                Some(entry) if entry.terminating => {
                    return Err(KioskError::SessionNotFound(id.to_string()));
                }
                Some(entry) if Instant::now() >= entry.deadline => None,
                Some(entry) => Some(f(entry)),
            }
        };
        match outcome {
            Some(result) => result,
            None => {
                self.expire(id, None);
                Err(KioskError::SessionExpired(id.to_string()))
            }
        }
    }

    /// Move the session along the state machine.
    ///
    /// `Terminated` cannot be reached this way; use [`terminate`](Self::terminate)
    /// or the cleanup orchestrator so the workspace is destroyed with it.
    #[instrument(skip(self, id), fields(session_id = %id))]
    pub fn update_status(&self, id: &SessionId, status: SessionStatus) -> Result<Session> {
        let (from, session) = self.with_live(id, |entry| {
            let from = entry.session.status;
            if status.is_terminal() || !from.can_transition_to(status) {
                return Err(KioskError::InvalidTransition { from, to: status });
            }
            entry.session.status = status;
            Ok((from, entry.session.clone()))
        })?;

        if from != status {
            info!(?from, to = ?status, "session status changed");
            self.publish(SessionEvent::StatusChanged {
                session_id: id.clone(),
                from,
                to: status,
            });
        }
        Ok(session)
    }

    /// Push the deadline to now + timeout and reschedule the timer.
    #[instrument(skip(self, id), fields(session_id = %id))]
    pub fn extend(&self, id: &SessionId) -> Result<DateTime<Utc>> {
        let timeout = self.inner.timeout;
        let chrono_timeout = chrono::Duration::from_std(timeout)
            .map_err(|e| KioskError::Configuration(format!("session timeout: {e}")))?;

        let expires_at = self.with_live(id, |entry| {
            entry.session.expires_at = Utc::now() + chrono_timeout;
            entry.deadline = Instant::now() + timeout;
            entry.generation += 1;
            let timer = self.schedule(id.clone(), entry.generation, entry.deadline);
            if let Some(old) = entry.timer.replace(timer) {
                old.abort();
            }
            Ok(entry.session.expires_at)
        })?;

        debug!(%expires_at, "session extended");
        Ok(expires_at)
    }

    pub fn update_payment(&self, id: &SessionId, status: PaymentStatus) -> Result<()> {
        self.with_live(id, |entry| {
            entry.session.payment_status = status;
            Ok(())
        })?;
        debug!(session_id = %id, ?status, "payment status updated");
        Ok(())
    }

    /// Append a received file. Only an `Active` session accepts files.
    pub fn attach_file(&self, id: &SessionId, record: FileRecord) -> Result<()> {
        self.with_live(id, |entry| {
            if entry.session.status != SessionStatus::Active {
                return Err(KioskError::SessionNotActive(id.to_string()));
            }
            entry.session.files.push(record);
            Ok(())
        })
    }

    // -- Termination ----------------------------------------------------------

    /// Terminate and destroy the session. Idempotent.
    ///
    /// The entry is removed only once its workspace is gone; on failure it
    /// stays enumerable so a later sweep can retry.
    #[instrument(skip(self, id), fields(session_id = %id))]
    pub async fn terminate(&self, id: &SessionId) -> Result<()> {
        let was_registered = self.begin_termination(id).is_some();
        let registry = self.clone();
        let id = id.clone();
        tokio::task::spawn_blocking(move || {
            registry.destroy_workspace(&id, "terminate", was_registered)?;
            registry.finish_termination(&id);
            Ok(())
        })
        .await
        .map_err(|e| KioskError::Cleanup(format!("destroy task failed: {e}")))?
    }

    /// Cancel the timer and hide the entry from lookups and mutations without
    /// removing it. Returns a copy marked `Terminated`, or `None` if the
    /// registry holds no entry. Repeatable.
    pub(crate) fn begin_termination(&self, id: &SessionId) -> Option<Session> {
        let mut sessions = self.sessions();
        let entry = sessions.get_mut(id)?;
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }
        entry.terminating = true;
        debug!(session_id = %id, "session terminating");
        let mut session = entry.session.clone();
        session.status = SessionStatus::Terminated;
        Some(session)
    }

    /// Drop the entry after its workspace has been destroyed and verified.
    pub(crate) fn finish_termination(&self, id: &SessionId) -> bool {
        let removed = self.sessions().remove(id).is_some();
        if removed {
            debug!(session_id = %id, "session removed");
        }
        removed
    }

    /// Abort every pending expiry timer. Entries stay in place.
    pub fn shutdown(&self) {
        let mut sessions = self.sessions();
        let mut aborted = 0usize;
        for entry in sessions.values_mut() {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
                aborted += 1;
            }
        }
        info!(timers = aborted, "registry timers stopped");
    }

    /// Mark an expired entry as terminating. `generation` is `Some` when called
    /// from the entry's own timer and must match the entry's current generation.
    fn expire(&self, id: &SessionId, generation: Option<u64>) -> bool {
        {
            let mut sessions = self.sessions();
            let Some(entry) = sessions.get_mut(id) else {
                return false;
            };
            if entry.terminating || generation.is_some_and(|g| g != entry.generation) {
                return false;
            }
            entry.terminating = true;
            if let (Some(timer), None) = (entry.timer.take(), generation) {
                timer.abort();
            }
        }

        info!(session_id = %id, "session expired");
        if let Err(e) = self.inner.events.try_send(SessionEvent::Expired(id.clone())) {
            warn!(session_id = %id, error = %e, "event channel unavailable, destroying expired session directly");
            self.destroy_in_background(id.clone());
        }
        true
    }

    /// Destroy an expired workspace off the calling thread. The caller may be
    /// holding the storage lock for this very session.
    fn destroy_in_background(&self, id: SessionId) {
        let registry = self.clone();
        let job = move || match registry.destroy_workspace(&id, "timeout", true) {
            Ok(()) => {
                registry.finish_termination(&id);
            }
            Err(e) => {
                error!(session_id = %id, error = %e, "destruction of expired session failed");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(job);
            }
            Err(_) => {
                std::thread::spawn(job);
            }
        }
    }

    fn destroy_workspace(&self, id: &SessionId, reason: &str, was_registered: bool) -> Result<()> {
        let storage = &self.inner.storage;
        if !was_registered && storage.verify(id) {
            debug!(session_id = %id, "nothing left to terminate");
            return Ok(());
        }

        let file_count = storage.read_metadata(id).map(|m| m.files.len()).unwrap_or(0);
        let result = storage.destroy(id).and_then(|()| {
            if storage.verify(id) {
                Ok(())
            } else {
                Err(KioskError::Cleanup("workspace still present after destroy".into()))
            }
        });

        audit(
            self.inner.audit.as_ref(),
            AuditEvent::new(AuditEventKind::SessionTerminated, Some(id)).detail("reason", reason),
        );
        let mut destroyed = AuditEvent::new(AuditEventKind::DataDestroyed, Some(id))
            .success(result.is_ok())
            .detail("reason", reason)
            .detail("file_count", file_count);
        if let Err(e) = &result {
            destroyed = destroyed.detail("error", e.to_string());
        }
        audit(self.inner.audit.as_ref(), destroyed);
        result
    }

    fn publish(&self, event: SessionEvent) {
        if let Err(e) = self.inner.events.try_send(event) {
            warn!(error = %e, "session event dropped");
        }
    }
}
