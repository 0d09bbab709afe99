// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Cleanup orchestrator: verified destruction of session data.
//
// Every trigger (expiry, operator action, crash recovery, fail-closed) runs
// the same routine:
//
//   1. collect the paths about to be destroyed (for the audit trail)
//   2. hide the session in the registry; it stays enumerable
//   3. destroy + verify, up to `max_attempts`, backing off between attempts
//   4. on success, drop the registry entry and verify again independently:
//      the registry no longer knows the session and nothing named after it
//      remains under the root
//
// Runs are serialized per workspace. A caller arriving while a cleanup of
// the same workspace is in flight waits for that run and shares its result.
//
// A failed cleanup is reported, not retried forever. Callers decide what a
// failure means; the escalation authority turns it into a new error.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use kioskwerk_core::config::CleanupConfig;
use kioskwerk_core::error::KioskError;
use kioskwerk_core::types::{CleanupResult, SessionId};
use kioskwerk_security::{AuditEvent, AuditEventKind, AuditSink, OrphanWorkspace, SecureStorage};
use tokio::sync::OnceCell;
use tokio::task::JoinError;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::audit;
use crate::registry::SessionRegistry;
use crate::retry::{Backoff, RetryDecision};

/// What started a cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupTrigger {
    Automatic,
    Manual,
    CrashRecovery,
}

impl CleanupTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Manual => "manual",
            Self::CrashRecovery => "crash_recovery",
        }
    }
}

/// Outcome of the startup sweep.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub total_found: usize,
    pub total_recovered: usize,
    pub results: Vec<CleanupResult>,
    pub errors: Vec<String>,
}

/// A workspace about to be destroyed.
struct Target {
    name: String,
    path: PathBuf,
    session_id: Option<SessionId>,
}

impl From<OrphanWorkspace> for Target {
    fn from(orphan: OrphanWorkspace) -> Self {
        Self {
            name: orphan.name,
            path: orphan.path,
            session_id: orphan.session_id,
        }
    }
}

type SharedRun = Arc<OnceCell<CleanupResult>>;

/// Drives destruction through the storage engine.
pub struct CleanupOrchestrator {
    registry: SessionRegistry,
    storage: Arc<SecureStorage>,
    audit: Arc<dyn AuditSink>,
    backoff: Backoff,
    in_flight: Mutex<HashMap<String, SharedRun>>,
}

impl CleanupOrchestrator {
    pub fn new(
        registry: SessionRegistry,
        storage: Arc<SecureStorage>,
        audit: Arc<dyn AuditSink>,
        config: &CleanupConfig,
    ) -> Self {
        Self {
            registry,
            storage,
            audit,
            backoff: Backoff::from(config),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<String, SharedRun>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn target(&self, id: &SessionId) -> Target {
        Target {
            name: id.to_string(),
            path: self.storage.workspace_path(id),
            session_id: Some(id.clone()),
        }
    }

    /// Normal end of a session (expiry or completion).
    pub async fn automatic(&self, id: &SessionId) -> CleanupResult {
        self.run(self.target(id), CleanupTrigger::Automatic, "timeout")
            .await
    }

    /// Operator-initiated termination. A session that is already gone is a
    /// success with an explanatory note.
    pub async fn manual(&self, id: &SessionId, reason: &str) -> CleanupResult {
        self.run(self.target(id), CleanupTrigger::Manual, reason)
            .await
    }

    /// Destroy every directory under the session root. Run once at startup,
    /// before any session is created.
    #[instrument(skip_all)]
    pub async fn crash_recovery(&self) -> RecoveryReport {
        let storage = Arc::clone(&self.storage);
        let found = match tokio::task::spawn_blocking(move || storage.list_workspaces()).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                error!(error = %e, "crash recovery could not scan the session root");
                return self.recovery_failed(e.to_string());
            }
            Err(e) => {
                error!(error = %e, "crash recovery scan task failed");
                return self.recovery_failed(e.to_string());
            }
        };

        let mut report = RecoveryReport {
            total_found: found.len(),
            ..RecoveryReport::default()
        };
        if found.is_empty() {
            info!("no orphaned workspaces found");
        } else {
            warn!(count = found.len(), "orphaned workspaces found, destroying");
        }

        for orphan in found {
            let result = self
                .run(orphan.into(), CleanupTrigger::CrashRecovery, "crash_recovery")
                .await;
            if result.success {
                report.total_recovered += 1;
            } else {
                report
                    .errors
                    .push(format!("{}: {}", result.workspace, result.errors.join("; ")));
            }
            report.results.push(result);
        }

        info!(
            found = report.total_found,
            recovered = report.total_recovered,
            "crash recovery finished"
        );
        audit(
            self.audit.as_ref(),
            AuditEvent::new(AuditEventKind::CrashRecovery, None)
                .success(report.errors.is_empty())
                .detail("total_found", report.total_found)
                .detail("total_recovered", report.total_recovered),
        );
        report
    }

    fn recovery_failed(&self, error: String) -> RecoveryReport {
        audit(
            self.audit.as_ref(),
            AuditEvent::new(AuditEventKind::CrashRecovery, None)
                .success(false)
                .detail("error", error.clone()),
        );
        RecoveryReport {
            errors: vec![error],
            ..RecoveryReport::default()
        }
    }

    /// Run a cleanup of `target`, or join the one already running for the
    /// same workspace.
    async fn run(&self, target: Target, trigger: CleanupTrigger, reason: &str) -> CleanupResult {
        let name = target.name.clone();
        let cell = match self.in_flight().entry(name.clone()) {
            Entry::Occupied(running) => {
                debug!(workspace = %name, "cleanup already running, waiting for its result");
                Arc::clone(running.get())
            }
            Entry::Vacant(slot) => Arc::clone(slot.insert(SharedRun::default())),
        };

        let result = cell
            .get_or_init(|| self.execute(target, trigger, reason))
            .await
            .clone();

        let mut in_flight = self.in_flight();
        if in_flight.get(&name).is_some_and(|c| Arc::ptr_eq(c, &cell)) {
            in_flight.remove(&name);
        }
        result
    }

    #[instrument(skip_all, fields(workspace = %target.name, trigger = trigger.as_str()))]
    async fn execute(&self, target: Target, trigger: CleanupTrigger, reason: &str) -> CleanupResult {
        let started = Instant::now();
        let mut errors = Vec::new();

        // 1. Inventory, before anything is gone.
        let storage = Arc::clone(&self.storage);
        let (path, id) = (target.path.clone(), target.session_id.clone());
        let inventory = joined(
            tokio::task::spawn_blocking(move || {
                let paths = storage.artifacts_under(&path);
                let files = id
                    .as_ref()
                    .and_then(|id| storage.read_metadata(id).ok())
                    .map_or(0, |m| m.files.len());
                (paths, files)
            })
            .await,
            "inventory",
            &mut errors,
        );
        let inventory_taken = inventory.is_some();
        let (destroyed_paths, file_count) = inventory.unwrap_or_default();

        // 2. Hide. The entry is removed only after verified destruction.
        let registered = target
            .session_id
            .as_ref()
            .and_then(|id| self.registry.begin_termination(id));
        let note = match (trigger, &registered, inventory_taken, destroyed_paths.is_empty()) {
            (CleanupTrigger::Manual, None, true, true) => {
                Some("session already removed".to_owned())
            }
            (CleanupTrigger::Manual, None, _, _) => {
                Some("session not registered, destroying workspace".to_owned())
            }
            _ => None,
        };

        // 3. Destroy and verify.
        let mut attempts = 0u32;
        let mut destroyed = false;
        loop {
            attempts += 1;
            match self.destroy_once(&target).await {
                Ok(true) => {
                    destroyed = true;
                    break;
                }
                Ok(false) => errors.push(format!(
                    "attempt {attempts}: workspace still present after destroy"
                )),
                Err(e) => errors.push(format!("attempt {attempts}: {e}")),
            }
            match self.backoff.next(attempts - 1) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(attempt = attempts, delay_ms = delay.as_millis() as u64, "cleanup attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::Exhausted => break,
            }
        }

        // 4. Drop the entry, then verify independently.
        let mut verification_passed = false;
        if destroyed {
            if let Some(id) = &target.session_id {
                self.registry.finish_termination(id);
            }
            let still_registered = target
                .session_id
                .as_ref()
                .is_some_and(|id| self.registry.contains(id));
            let storage = Arc::clone(&self.storage);
            let name = target.name.clone();
            let strays = joined(
                tokio::task::spawn_blocking(move || storage.stray_artifacts(&name)).await,
                "stray scan",
                &mut errors,
            );

            if still_registered {
                errors.push("session is still registered after destruction".into());
            }
            let no_strays = match strays {
                Some(strays) if strays.is_empty() => true,
                Some(strays) => {
                    errors.push(format!("{} stray artifact(s) remain", strays.len()));
                    false
                }
                None => false,
            };
            verification_passed = !still_registered && no_strays;
        }

        let success = destroyed && verification_passed;
        let result = CleanupResult {
            workspace: target.name.clone(),
            session_id: target.session_id.clone(),
            success,
            destroyed_paths,
            errors,
            verification_passed,
            elapsed: started.elapsed(),
            attempts,
            note,
        };

        if success {
            info!(attempts, elapsed_ms = result.elapsed.as_millis() as u64, "session data destroyed");
        } else {
            error!(attempts, errors = result.errors.len(), "session data destruction failed");
        }
        self.record(&result, trigger, reason, file_count);
        result
    }

    /// One destroy + verify attempt. `Ok(false)` means destroy returned but
    /// the workspace is still there.
    async fn destroy_once(&self, target: &Target) -> Result<bool, KioskError> {
        let storage = Arc::clone(&self.storage);
        let path = target.path.clone();
        let id = target.session_id.clone();
        tokio::task::spawn_blocking(move || {
            match &id {
                Some(id) => {
                    storage.destroy(id)?;
                    Ok(storage.verify(id))
                }
                None => {
                    storage.destroy_path(&path)?;
                    Ok(storage.verify_path(&path))
                }
            }
        })
        .await
        .map_err(|e| KioskError::Cleanup(format!("destroy task failed: {e}")))?
    }

    fn record(&self, result: &CleanupResult, trigger: CleanupTrigger, reason: &str, file_count: usize) {
        let id = result.session_id.as_ref();
        if id.is_some() && result.note.as_deref() != Some("session already removed") {
            audit(
                self.audit.as_ref(),
                AuditEvent::new(AuditEventKind::SessionTerminated, id)
                    .detail("reason", reason)
                    .detail("trigger", trigger.as_str()),
            );
        }

        let mut event = AuditEvent::new(AuditEventKind::DataDestroyed, id)
            .success(result.success)
            .detail("reason", reason)
            .detail("trigger", trigger.as_str())
            .detail("file_count", file_count)
            .detail("attempts", result.attempts)
            .detail("elapsed_ms", result.elapsed.as_millis() as u64)
            .detail("verification_passed", result.verification_passed);
        if id.is_none() {
            event = event.detail("workspace", result.workspace.clone());
        }
        if !result.errors.is_empty() {
            event = event.detail("errors", result.errors.clone());
        }
        audit(self.audit.as_ref(), event);
    }
}

/// Unwrap a blocking task's output, recording a failed join in `errors`.
fn joined<T>(outcome: Result<T, JoinError>, task: &str, errors: &mut Vec<String>) -> Option<T> {
    match outcome {
        Ok(value) => Some(value),
        Err(e) => {
            error!(task, error = %e, "cleanup task failed");
            errors.push(format!("{task} task failed: {e}"));
            None
        }
    }
}
