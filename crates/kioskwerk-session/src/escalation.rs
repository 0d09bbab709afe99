// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Error escalation authority, the only component that can fail closed.
//
// Every fault is recorded and audited, then dispatched by severity:
//
//   Critical       terminate every session, block admission until an operator
//                  resumes it
//   High           Resource/Printer faults block admission; retry if possible
//   Medium / Low   retry if possible, otherwise record
//
// A retry re-runs the category's recovery probe with exponential backoff.
// Categories without a probe are recorded only.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use kioskwerk_core::config::EscalationConfig;
use kioskwerk_core::error::KioskError;
use kioskwerk_core::types::{CleanupResult, ErrorCategory, ErrorSeverity, SessionId, SystemError};
use kioskwerk_security::{AuditEvent, AuditEventKind, AuditSink};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::audit;
use crate::cleanup::CleanupOrchestrator;
use crate::probes::{Probe, Probes};
use crate::registry::SessionRegistry;
use crate::resources::ResourceGate;
use crate::retry::{Backoff, RetryDecision};

/// Outcome of a fail-closed sweep.
#[derive(Debug, Clone, Default)]
pub struct FailClosedReport {
    pub sessions_found: usize,
    pub sessions_terminated: usize,
    /// Cleanups that did not succeed. Each was also recorded as a new error.
    pub failures: Vec<CleanupResult>,
}

/// What the authority did with a report.
#[derive(Debug, Clone)]
pub enum EscalationAction {
    FailClosed(FailClosedReport),
    /// A recovery attempt is scheduled after `delay`.
    RetryScheduled { delay: Duration },
    /// New sessions are refused until the fault clears.
    AdmissionBlocked { retry: Option<Duration> },
    Recorded,
}

#[derive(Debug, Clone)]
pub struct Escalation {
    pub error: SystemError,
    pub action: EscalationAction,
}

/// Map a typed error onto an escalation category.
pub fn classify(err: &KioskError) -> ErrorCategory {
    match err {
        KioskError::Workspace(_)
        | KioskError::Filesystem(_)
        | KioskError::IntegrityMismatch { .. }
        | KioskError::Cleanup(_)
        | KioskError::Io(_) => ErrorCategory::Filesystem,
        KioskError::Notification(_) => ErrorCategory::Network,
        KioskError::AdmissionRefused(_) => ErrorCategory::Resource,
        KioskError::Configuration(_) => ErrorCategory::Configuration,
        KioskError::Database(_) | KioskError::PlatformUnavailable | KioskError::Serialization(_) => {
            ErrorCategory::System
        }
        KioskError::SessionNotFound(_)
        | KioskError::SessionExpired(_)
        | KioskError::SessionNotActive(_)
        | KioskError::InvalidTransition { .. } => ErrorCategory::Session,
        e if e.is_validation() => ErrorCategory::Session,
        _ => ErrorCategory::System,
    }
}

fn blocks_admission(error: &SystemError) -> bool {
    error.severity == ErrorSeverity::High
        && matches!(error.category, ErrorCategory::Resource | ErrorCategory::Printer)
}

fn has_recovery(category: ErrorCategory) -> bool {
    matches!(
        category,
        ErrorCategory::Network
            | ErrorCategory::Printer
            | ErrorCategory::Resource
            | ErrorCategory::Filesystem
    )
}

#[derive(Default)]
struct AuthorityState {
    errors: VecDeque<SystemError>,
    /// Unresolved errors currently blocking admission.
    blocking: HashSet<Uuid>,
    fail_closed: bool,
    retries: Vec<JoinHandle<()>>,
}

struct AuthorityInner {
    registry: SessionRegistry,
    cleanup: Arc<CleanupOrchestrator>,
    gate: Arc<ResourceGate>,
    audit: Arc<dyn AuditSink>,
    probes: Probes,
    config: EscalationConfig,
    state: Mutex<AuthorityState>,
}

/// Cloneable handle to the escalation authority.
#[derive(Clone)]
pub struct EscalationAuthority {
    inner: Arc<AuthorityInner>,
}

impl EscalationAuthority {
    pub fn new(
        registry: SessionRegistry,
        cleanup: Arc<CleanupOrchestrator>,
        gate: Arc<ResourceGate>,
        audit: Arc<dyn AuditSink>,
        probes: Probes,
        config: EscalationConfig,
    ) -> Self {
        Self {
            inner: Arc::new(AuthorityInner {
                registry,
                cleanup,
                gate,
                audit,
                probes,
                config,
                state: Mutex::new(AuthorityState::default()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, AuthorityState> {
        self.inner.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    // -- Reporting ------------------------------------------------------------

    /// Record a fault and act on it.
    #[instrument(skip_all, fields(category = category.as_str(), severity = severity.as_str()))]
    pub async fn report(
        &self,
        category: ErrorCategory,
        severity: ErrorSeverity,
        message: impl Into<String>,
        session_id: Option<SessionId>,
    ) -> Escalation {
        let error = SystemError::new(category, severity, message, session_id);
        self.record(&error);

        let action = if severity == ErrorSeverity::Critical {
            EscalationAction::FailClosed(self.fail_closed(&error).await)
        } else {
            self.dispatch(&error)
        };
        Escalation { error, action }
    }

    /// Report a typed error, classifying it first.
    pub async fn report_error(
        &self,
        err: &KioskError,
        severity: ErrorSeverity,
        session_id: Option<SessionId>,
    ) -> Escalation {
        self.report(classify(err), severity, err.to_string(), session_id)
            .await
    }

    fn record(&self, error: &SystemError) {
        match error.severity {
            ErrorSeverity::Critical | ErrorSeverity::High => {
                error!(id = %error.id, category = error.category.as_str(), message = %error.message, "system error")
            }
            ErrorSeverity::Medium => {
                warn!(id = %error.id, category = error.category.as_str(), message = %error.message, "system error")
            }
            ErrorSeverity::Low => {
                info!(id = %error.id, category = error.category.as_str(), message = %error.message, "system error")
            }
        }

        {
            let mut state = self.state();
            state.errors.push_back(error.clone());
            let retention = chrono::Duration::from_std(self.inner.config.error_retention())
                .unwrap_or(chrono::Duration::hours(24));
            let cutoff = Utc::now() - retention;
            while state.errors.front().is_some_and(|e| e.timestamp < cutoff) {
                state.errors.pop_front();
            }
            while state.errors.len() > self.inner.config.max_errors.max(1) {
                state.errors.pop_front();
            }
        }

        audit(
            self.inner.audit.as_ref(),
            AuditEvent::new(AuditEventKind::ErrorOccurred, error.session_id.as_ref())
                .success(false)
                .detail("error_id", error.id.to_string())
                .detail("category", error.category.as_str())
                .detail("severity", error.severity.as_str())
                .detail("message", error.message.clone())
                .detail("retryable", error.retryable),
        );
    }

    fn dispatch(&self, error: &SystemError) -> EscalationAction {
        let blocks = blocks_admission(error);
        if blocks {
            self.state().blocking.insert(error.id);
            warn!(id = %error.id, "new sessions blocked");
        }

        let retry = (error.retryable
            && has_recovery(error.category)
            && self.inner.config.max_retry_attempts > 0)
            .then(|| self.schedule_retry(error.clone()));

        match (blocks, retry) {
            (true, retry) => EscalationAction::AdmissionBlocked { retry },
            (false, Some(delay)) => EscalationAction::RetryScheduled { delay },
            (false, None) => EscalationAction::Recorded,
        }
    }

    // -- Fail closed ----------------------------------------------------------

    async fn fail_closed(&self, trigger: &SystemError) -> FailClosedReport {
        // Close the door before sweeping so nothing new slips in.
        self.state().fail_closed = true;
        error!(id = %trigger.id, message = %trigger.message, "critical fault, failing closed");

        let ids = self.inner.registry.session_ids();
        let mut report = FailClosedReport {
            sessions_found: ids.len(),
            ..FailClosedReport::default()
        };

        for id in ids {
            let result = self.inner.cleanup.manual(&id, "fail_closed").await;
            if result.success {
                report.sessions_terminated += 1;
                continue;
            }
            let follow_up = SystemError::new(
                ErrorCategory::Session,
                ErrorSeverity::High,
                format!("fail-closed cleanup failed: {}", result.errors.join("; ")),
                Some(id.clone()),
            );
            self.record(&follow_up);
            report.failures.push(result);
        }

        error!(
            found = report.sessions_found,
            terminated = report.sessions_terminated,
            "fail-closed sweep finished"
        );
        audit(
            self.inner.audit.as_ref(),
            AuditEvent::new(AuditEventKind::FailClosedTriggered, None)
                .success(report.failures.is_empty())
                .detail("error_id", trigger.id.to_string())
                .detail("category", trigger.category.as_str())
                .detail("sessions_found", report.sessions_found)
                .detail("sessions_terminated", report.sessions_terminated),
        );
        report
    }

    /// Operator action: admit sessions again after a fail-closed sweep.
    pub fn resume_admission(&self) {
        let was_closed = std::mem::replace(&mut self.state().fail_closed, false);
        if was_closed {
            info!("admission resumed by operator");
            audit(
                self.inner.audit.as_ref(),
                AuditEvent::new(AuditEventKind::ErrorResolved, None)
                    .detail("action", "admission_resumed"),
            );
        }
    }

    // -- Recovery -------------------------------------------------------------

    fn schedule_retry(&self, error: SystemError) -> Duration {
        let backoff = Backoff::from(&self.inner.config);
        let first = backoff.delay(0);
        let weak: Weak<AuthorityInner> = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                tokio::time::sleep(backoff.delay(attempt)).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let authority = EscalationAuthority { inner };
                if authority.is_resolved(error.id) {
                    return;
                }
                if authority.attempt_recovery(error.category).await {
                    authority.resolve(error.id);
                    return;
                }
                match backoff.next(attempt) {
                    RetryDecision::RetryAfter(_) => attempt += 1,
                    RetryDecision::Exhausted => {
                        warn!(id = %error.id, category = error.category.as_str(), "recovery gave up");
                        return;
                    }
                }
            }
        });

        let mut state = self.state();
        state.retries.retain(|h| !h.is_finished());
        state.retries.push(handle);
        first
    }

    async fn attempt_recovery(&self, category: ErrorCategory) -> bool {
        let probes = &self.inner.probes;
        match category {
            ErrorCategory::Network => run_probe(Arc::clone(&probes.connectivity)).await,
            ErrorCategory::Printer => run_probe(Arc::clone(&probes.printer)).await,
            ErrorCategory::Filesystem => run_probe(Arc::clone(&probes.filesystem)).await,
            ErrorCategory::Resource => self.inner.gate.would_admit_now().await.unwrap_or(false),
            ErrorCategory::Session | ErrorCategory::Configuration | ErrorCategory::System => false,
        }
    }

    fn is_resolved(&self, id: Uuid) -> bool {
        let state = self.state();
        !state.blocking.contains(&id)
            && state.errors.iter().any(|e| e.id == id && e.resolved)
    }

    /// Mark an error resolved. Returns false if it is unknown or already resolved.
    pub fn resolve(&self, id: Uuid) -> bool {
        let (resolved, lifted) = {
            let mut state = self.state();
            let was_blocking = state.blocking.remove(&id);
            let resolved = state
                .errors
                .iter_mut()
                .find(|e| e.id == id && !e.resolved)
                .map(|e| {
                    e.resolved = true;
                    e.clone()
                });
            let lifted = was_blocking && state.blocking.is_empty() && !state.fail_closed;
            (resolved, lifted)
        };

        let Some(error) = resolved else {
            return false;
        };
        info!(id = %id, category = error.category.as_str(), "error resolved");
        if lifted {
            info!("admission block lifted");
        }
        audit(
            self.inner.audit.as_ref(),
            AuditEvent::new(AuditEventKind::ErrorResolved, error.session_id.as_ref())
                .detail("error_id", id.to_string())
                .detail("category", error.category.as_str()),
        );
        true
    }

    /// Resolve every unresolved error of `category`.
    pub fn resolve_category(&self, category: ErrorCategory) -> usize {
        let ids: Vec<Uuid> = self
            .state()
            .errors
            .iter()
            .filter(|e| e.category == category && !e.resolved)
            .map(|e| e.id)
            .collect();
        ids.into_iter().filter(|id| self.resolve(*id)).count()
    }

    // -- Queries --------------------------------------------------------------

    pub fn is_admission_blocked(&self) -> bool {
        let state = self.state();
        state.fail_closed || !state.blocking.is_empty()
    }

    pub fn is_failed_closed(&self) -> bool {
        self.state().fail_closed
    }

    /// Retained errors, oldest first.
    pub fn errors(&self) -> Vec<SystemError> {
        self.state().errors.iter().cloned().collect()
    }

    pub fn unresolved(&self) -> Vec<SystemError> {
        self.state()
            .errors
            .iter()
            .filter(|e| !e.resolved)
            .cloned()
            .collect()
    }

    /// Stop pending recovery attempts.
    pub fn shutdown(&self) {
        let retries = std::mem::take(&mut self.state().retries);
        for handle in &retries {
            handle.abort();
        }
        info!(pending = retries.len(), "escalation retries stopped");
    }
}

async fn run_probe(probe: Arc<dyn Probe>) -> bool {
    let name = probe.name();
    match tokio::task::spawn_blocking(move || probe.check()).await {
        Ok(ok) => ok,
        Err(e) => {
            warn!(probe = name, error = %e, "probe task failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kioskwerk_core::config::{CleanupConfig, ProbeConfig, ResourceConfig};
    use kioskwerk_core::types::DeclaredFile;
    use kioskwerk_security::{
        AuditLog, IntakeLimits, MultiPassShredder, SecureStorage, Shredder, fixtures,
    };
    use tempfile::TempDir;

    use crate::resources::FixedSampler;

    struct Fixture {
        _root: TempDir,
        registry: SessionRegistry,
        storage: Arc<SecureStorage>,
        sampler: Arc<FixedSampler>,
        audit: Arc<AuditLog>,
        authority: EscalationAuthority,
    }

    struct AlwaysFails;

    impl Shredder for AlwaysFails {
        fn name(&self) -> &'static str {
            "always-fails"
        }
        fn shred_file(&self, _path: &std::path::Path) -> kioskwerk_core::error::Result<()> {
            Err(KioskError::Filesystem("injected failure".into()))
        }
    }

    fn fixture_with(shredder: Arc<dyn Shredder>, config: EscalationConfig) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let storage = Arc::new(
            SecureStorage::new(root.path().join("sessions"), IntakeLimits::default(), shredder)
                .unwrap(),
        );
        let audit = Arc::new(AuditLog::open_in_memory().unwrap());
        let (registry, _events) =
            SessionRegistry::new(Arc::clone(&storage), audit.clone(), Duration::from_secs(1800), 64);
        let cleanup = Arc::new(CleanupOrchestrator::new(
            registry.clone(),
            Arc::clone(&storage),
            audit.clone(),
            &CleanupConfig {
                retry_delay_ms: 1,
                ..CleanupConfig::default()
            },
        ));
        let sampler = Arc::new(FixedSampler::idle());
        let gate = Arc::new(ResourceGate::new(sampler.clone(), ResourceConfig::default()));
        let probes = Probes::from_config(&ProbeConfig::default(), storage.root());
        let authority = EscalationAuthority::new(
            registry.clone(),
            cleanup,
            gate,
            audit.clone(),
            probes,
            config,
        );
        Fixture {
            _root: root,
            registry,
            storage,
            sampler,
            audit,
            authority,
        }
    }

    fn fast_config() -> EscalationConfig {
        EscalationConfig {
            retry_base_delay_ms: 10,
            max_retry_attempts: 3,
            ..EscalationConfig::default()
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(MultiPassShredder::new()), fast_config())
    }

    #[tokio::test]
    async fn critical_fails_closed_and_terminates_everything() {
        let f = fixture();
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(f.registry.create("shop-1").await.unwrap());
        }
        let bytes = fixtures::pdf_document(1, 0);
        let declared = DeclaredFile {
            name: "a.pdf".into(),
            mime_type: "application/pdf".into(),
            size: bytes.len() as u64,
        };
        f.storage.receive(&ids[0], &bytes, &declared).unwrap();

        let escalation = f
            .authority
            .report(ErrorCategory::System, ErrorSeverity::Critical, "tamper switch", None)
            .await;

        let EscalationAction::FailClosed(report) = escalation.action else {
            panic!("expected fail-closed, got {:?}", escalation.action);
        };
        assert_eq!(report.sessions_found, 3);
        assert_eq!(report.sessions_terminated, 3);
        assert!(!escalation.error.retryable);
        for id in &ids {
            assert!(f.registry.get_status(id).is_none());
            assert!(f.storage.verify(id));
        }

        let entries = f.audit.recent_entries(50).unwrap();
        let fact = entries
            .iter()
            .find(|e| e.event == "fail_closed_triggered")
            .unwrap();
        assert_eq!(fact.details["sessions_terminated"], 3);

        assert!(f.authority.is_admission_blocked());
        f.authority.resume_admission();
        assert!(!f.authority.is_admission_blocked());
    }

    #[tokio::test]
    async fn failed_fail_closed_cleanup_becomes_high_session_error() {
        let f = fixture_with(Arc::new(AlwaysFails), fast_config());
        let id = f.registry.create("shop-1").await.unwrap();
        // metadata.json is non-empty, so every attempt fails.
        let escalation = f
            .authority
            .report(ErrorCategory::System, ErrorSeverity::Critical, "fault", None)
            .await;

        let EscalationAction::FailClosed(report) = escalation.action else {
            panic!("expected fail-closed");
        };
        assert_eq!(report.sessions_terminated, 0);
        assert_eq!(report.failures.len(), 1);

        let follow_up = f
            .authority
            .unresolved()
            .into_iter()
            .find(|e| e.category == ErrorCategory::Session)
            .unwrap();
        assert_eq!(follow_up.severity, ErrorSeverity::High);
        assert_eq!(follow_up.session_id, Some(id));
    }

    #[tokio::test]
    async fn session_left_by_failed_cleanup_is_found_by_next_fail_closed() {
        let f = fixture_with(Arc::new(AlwaysFails), fast_config());
        let id = f.registry.create("shop-1").await.unwrap();

        for _ in 0..2 {
            let escalation = f
                .authority
                .report(ErrorCategory::System, ErrorSeverity::Critical, "fault", None)
                .await;
            let EscalationAction::FailClosed(report) = escalation.action else {
                panic!("expected fail-closed");
            };
            assert_eq!(report.sessions_found, 1);
            assert_eq!(report.sessions_terminated, 0);
        }
        assert_eq!(f.registry.session_ids(), vec![id.clone()]);
        assert!(f.storage.workspace_path(&id).exists());
        assert!(f.registry.get_status(&id).is_none());
    }

    #[tokio::test]
    async fn high_resource_blocks_until_recovered() {
        let f = fixture();
        f.sampler.set(|s| s.disk_free_bytes = 100_000_000);

        let escalation = f
            .authority
            .report(ErrorCategory::Resource, ErrorSeverity::High, "disk nearly full", None)
            .await;
        assert!(matches!(
            escalation.action,
            EscalationAction::AdmissionBlocked { retry: Some(_) }
        ));
        assert!(f.authority.is_admission_blocked());

        f.sampler.set(|s| s.disk_free_bytes = 100_000_000_000);
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(!f.authority.is_admission_blocked());
        assert!(f.authority.unresolved().is_empty());
        assert_eq!(f.audit.count_kind(AuditEventKind::ErrorResolved).unwrap(), 1);
    }

    #[tokio::test]
    async fn printer_without_address_stays_blocked() {
        let f = fixture();
        f.authority
            .report(ErrorCategory::Printer, ErrorSeverity::High, "printer offline", None)
            .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(f.authority.is_admission_blocked());
        assert_eq!(f.authority.unresolved().len(), 1);
    }

    #[tokio::test]
    async fn medium_filesystem_fault_recovers() {
        let f = fixture();
        let escalation = f
            .authority
            .report(ErrorCategory::Filesystem, ErrorSeverity::Medium, "write stalled", None)
            .await;
        assert!(matches!(escalation.action, EscalationAction::RetryScheduled { delay } if delay == Duration::from_millis(10)));
        assert!(!f.authority.is_admission_blocked());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(f.authority.unresolved().is_empty());
    }

    #[tokio::test]
    async fn categories_without_recovery_are_recorded() {
        let f = fixture();
        let escalation = f
            .authority
            .report(ErrorCategory::Configuration, ErrorSeverity::Low, "unknown key", None)
            .await;
        assert!(matches!(escalation.action, EscalationAction::Recorded));
        assert_eq!(f.authority.errors().len(), 1);
        assert_eq!(f.audit.count_kind(AuditEventKind::ErrorOccurred).unwrap(), 1);
    }

    #[tokio::test]
    async fn errors_age_out_by_count() {
        let f = fixture_with(
            Arc::new(MultiPassShredder::new()),
            EscalationConfig {
                max_errors: 3,
                ..fast_config()
            },
        );
        for i in 0..5 {
            f.authority
                .report(ErrorCategory::Session, ErrorSeverity::Low, format!("e{i}"), None)
                .await;
        }
        let messages: Vec<_> = f.authority.errors().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["e2", "e3", "e4"]);
    }

    #[tokio::test]
    async fn resolve_category_lifts_block() {
        let f = fixture_with(
            Arc::new(MultiPassShredder::new()),
            EscalationConfig {
                max_retry_attempts: 0,
                ..fast_config()
            },
        );
        let escalation = f
            .authority
            .report(ErrorCategory::Resource, ErrorSeverity::High, "memory", None)
            .await;
        assert!(matches!(
            escalation.action,
            EscalationAction::AdmissionBlocked { retry: None }
        ));
        assert_eq!(f.authority.resolve_category(ErrorCategory::Resource), 1);
        assert!(!f.authority.is_admission_blocked());
        assert!(!f.authority.resolve(escalation.error.id), "already resolved");
    }

    #[test]
    fn classification() {
        assert_eq!(classify(&KioskError::Filesystem("x".into())), ErrorCategory::Filesystem);
        assert_eq!(classify(&KioskError::Notification("x".into())), ErrorCategory::Network);
        assert_eq!(classify(&KioskError::Database("x".into())), ErrorCategory::System);
        assert_eq!(classify(&KioskError::EmptyFile), ErrorCategory::Session);
        assert_eq!(
            classify(&KioskError::AdmissionRefused("x".into())),
            ErrorCategory::Resource
        );
    }
}
