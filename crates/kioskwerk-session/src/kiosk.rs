// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Composition root.
//
// Built leaf-first: audit, storage, registry, cleanup, gate, authority.
// Torn down in reverse: background tasks stop, every remaining session is
// destroyed, then the registry timers are aborted.

use std::path::Path;
use std::sync::{Arc, Mutex};

use kioskwerk_core::config::AgentConfig;
use kioskwerk_core::error::{KioskError, Result};
use kioskwerk_core::types::{
    CleanupResult, DeclaredFile, ErrorCategory, ErrorSeverity, FileRecord, PrintOptions,
    PrintSnapshot, SessionId,
};
use kioskwerk_security::{
    AuditEvent, AuditEventKind, AuditLog, AuditSink, IntakeLimits, SecureStorage, Shredder,
    probe_shredder,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::audit;
use crate::cleanup::{CleanupOrchestrator, RecoveryReport};
use crate::escalation::{EscalationAuthority, classify};
use crate::intake::Intake;
use crate::notify::{LogNotifier, Notifier};
use crate::probes::Probes;
use crate::registry::{SessionEvent, SessionRegistry};
use crate::resources::{AlertKind, ResourceAlert, ResourceGate, ResourceSampler, SystemSampler};

/// The pluggable collaborators of a kiosk.
pub struct KioskParts {
    pub audit: Arc<dyn AuditSink>,
    pub shredder: Arc<dyn Shredder>,
    pub sampler: Arc<dyn ResourceSampler>,
    pub notifier: Arc<dyn Notifier>,
    /// `None` builds the probes from the configuration.
    pub probes: Option<Probes>,
}

pub struct Kiosk {
    config: AgentConfig,
    audit: Arc<dyn AuditSink>,
    storage: Arc<SecureStorage>,
    registry: SessionRegistry,
    cleanup: Arc<CleanupOrchestrator>,
    gate: Arc<ResourceGate>,
    authority: EscalationAuthority,
    intake: Intake,
    notifier: Arc<dyn Notifier>,
    events: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Kiosk {
    /// Production wiring: SQLite audit log in `data_dir`, probed shredder,
    /// host sampler, log notifier.
    pub fn open(config: AgentConfig, data_dir: &Path) -> Result<Self> {
        config.validate()?;

        let audit_path = if config.storage.audit_db.is_absolute() {
            config.storage.audit_db.clone()
        } else {
            data_dir.join(&config.storage.audit_db)
        };
        let audit = Arc::new(AuditLog::open(&audit_path)?);
        info!(path = %audit_path.display(), "audit log opened");

        let parts = KioskParts {
            audit,
            shredder: probe_shredder(config.storage.prefer_system_shred),
            sampler: Arc::new(SystemSampler::new(&config.storage.session_root)),
            notifier: Arc::new(LogNotifier),
            probes: None,
        };
        Self::assemble(config, parts)
    }

    /// Wire the components together. Nothing is spawned until
    /// [`spawn_background`](Self::spawn_background).
    pub fn assemble(config: AgentConfig, parts: KioskParts) -> Result<Self> {
        let storage = Arc::new(SecureStorage::new(
            &config.storage.session_root,
            IntakeLimits::from(&config.storage),
            parts.shredder,
        )?);
        info!(
            root = %storage.root().display(),
            shredder = storage.shredder_name(),
            "secure storage ready"
        );

        let (registry, events) = SessionRegistry::new(
            Arc::clone(&storage),
            Arc::clone(&parts.audit),
            config.sessions.timeout(),
            config.sessions.event_buffer,
        );
        let cleanup = Arc::new(CleanupOrchestrator::new(
            registry.clone(),
            Arc::clone(&storage),
            Arc::clone(&parts.audit),
            &config.cleanup,
        ));
        let gate = Arc::new(ResourceGate::new(parts.sampler, config.resources.clone()));
        let probes = parts
            .probes
            .unwrap_or_else(|| Probes::from_config(&config.probes, storage.root()));
        let authority = EscalationAuthority::new(
            registry.clone(),
            Arc::clone(&cleanup),
            Arc::clone(&gate),
            Arc::clone(&parts.audit),
            probes,
            config.escalation.clone(),
        );
        let intake = Intake::new(registry.clone(), Arc::clone(&storage));

        Ok(Self {
            config,
            audit: parts.audit,
            storage,
            registry,
            cleanup,
            gate,
            authority,
            intake,
            notifier: parts.notifier,
            events: Mutex::new(Some(events)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn storage(&self) -> &Arc<SecureStorage> {
        &self.storage
    }

    pub fn cleanup(&self) -> &Arc<CleanupOrchestrator> {
        &self.cleanup
    }

    pub fn gate(&self) -> &Arc<ResourceGate> {
        &self.gate
    }

    pub fn authority(&self) -> &EscalationAuthority {
        &self.authority
    }

    // -- Sessions -------------------------------------------------------------

    /// Admit a new customer session. A workspace that cannot be created is
    /// escalated as a high-severity filesystem fault.
    #[instrument(skip(self))]
    pub async fn open_session(&self, shop_id: &str) -> Result<SessionId> {
        let Some(reason) = self.admission_block() else {
            return match self.registry.create(shop_id).await {
                Ok(id) => Ok(id),
                Err(e) => {
                    if classify(&e) == ErrorCategory::Filesystem {
                        self.authority
                            .report_error(&e, ErrorSeverity::High, None)
                            .await;
                    }
                    Err(e)
                }
            };
        };

        warn!(%reason, "session refused");
        audit(
            self.audit.as_ref(),
            AuditEvent::new(AuditEventKind::AdmissionRefused, None)
                .success(false)
                .detail("reason", reason.clone()),
        );

        let resource_fault_known = self.authority.unresolved().iter().any(|e| {
            e.category == ErrorCategory::Resource && e.severity >= ErrorSeverity::High
        });
        if !self.gate.should_admit_new_sessions() && !resource_fault_known {
            self.authority
                .report(
                    ErrorCategory::Resource,
                    ErrorSeverity::High,
                    format!("admission refused: {reason}"),
                    None,
                )
                .await;
        }
        Err(KioskError::AdmissionRefused(reason))
    }

    fn admission_block(&self) -> Option<String> {
        if self.authority.is_failed_closed() {
            return Some("kiosk failed closed".into());
        }
        if !self.gate.should_admit_new_sessions() {
            return Some("host resources constrained".into());
        }
        if self.authority.is_admission_blocked() {
            return Some("unresolved fault".into());
        }
        None
    }

    /// Accept an upload into an active session.
    pub async fn receive_file(
        &self,
        id: &SessionId,
        bytes: Vec<u8>,
        declared: DeclaredFile,
    ) -> Result<FileRecord> {
        match self.intake.receive(id, bytes, declared).await {
            Ok(record) => Ok(record),
            Err(e) => {
                if classify(&e) == ErrorCategory::Filesystem {
                    self.authority
                        .report_error(&e, ErrorSeverity::Medium, Some(id.clone()))
                        .await;
                }
                Err(e)
            }
        }
    }

    pub fn print_snapshot(&self, id: &SessionId, options: PrintOptions) -> Result<PrintSnapshot> {
        self.intake.print_snapshot(id, options)
    }

    /// Operator or customer ends a session. A failed destruction returns the
    /// accumulated errors and is escalated.
    pub async fn terminate_session(&self, id: &SessionId, reason: &str) -> Result<CleanupResult> {
        let result = self.cleanup.manual(id, reason).await;
        if result.success {
            return Ok(result);
        }
        let errors = result.errors.join("; ");
        self.authority
            .report(
                ErrorCategory::Session,
                ErrorSeverity::High,
                format!("manual cleanup failed: {errors}"),
                Some(id.clone()),
            )
            .await;
        Err(KioskError::Cleanup(errors))
    }

    /// Destroy every workspace left over from a previous run.
    pub async fn recover_from_crash(&self) -> RecoveryReport {
        let report = self.cleanup.crash_recovery().await;
        if !report.errors.is_empty() {
            self.authority
                .report(
                    ErrorCategory::Filesystem,
                    ErrorSeverity::High,
                    format!(
                        "crash recovery left {} workspace(s): {}",
                        report.total_found - report.total_recovered,
                        report.errors.join("; ")
                    ),
                    None,
                )
                .await;
        }
        report
    }

    // -- Resources ------------------------------------------------------------

    /// Take a resource sample now and escalate any alerts.
    pub async fn sample_resources(&self) -> Result<Vec<ResourceAlert>> {
        let (_, alerts) = self.gate.sample_now().await?;
        forward_alerts(&self.authority, &self.gate, &alerts).await;
        Ok(alerts)
    }

    // -- Background work ------------------------------------------------------

    /// Start the session-event dispatcher and the resource monitor. Calling
    /// this twice starts only the monitor a second time, so don't.
    pub fn spawn_background(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());

        let events = self.events.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(events) = events {
            tasks.push(tokio::spawn(dispatch_events(
                events,
                Arc::clone(&self.cleanup),
                self.authority.clone(),
                Arc::clone(&self.notifier),
                self.cancel.clone(),
            )));
        }

        let authority = self.authority.clone();
        let gate = Arc::clone(&self.gate);
        tasks.push(tokio::spawn(Arc::clone(&self.gate).run(
            self.config.resources.sample_interval(),
            self.cancel.clone(),
            move |_snapshot, alerts| {
                let authority = authority.clone();
                let gate = Arc::clone(&gate);
                async move { forward_alerts(&authority, &gate, &alerts).await }
            },
        )));
        info!(tasks = tasks.len(), "background tasks started");
    }

    /// Stop background work and destroy every session still registered.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.cancel.cancel();
        self.authority.shutdown();

        let ids = self.registry.session_ids();
        let mut failed = 0usize;
        for id in &ids {
            let result = self.cleanup.manual(id, "shutdown").await;
            if !result.success {
                failed += 1;
                error!(session_id = %id, errors = ?result.errors, "shutdown cleanup failed");
            }
        }
        self.registry.shutdown();

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|p| p.into_inner()));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        info!(sessions = ids.len(), failed, "shutdown complete");
    }
}

/// Turn resource alerts into escalation reports.
async fn forward_alerts(authority: &EscalationAuthority, gate: &ResourceGate, alerts: &[ResourceAlert]) {
    for alert in alerts {
        match alert.kind {
            AlertKind::Warning => {
                authority
                    .report(ErrorCategory::Resource, ErrorSeverity::Medium, alert.describe(), None)
                    .await;
            }
            AlertKind::Critical => {
                authority
                    .report(ErrorCategory::Resource, ErrorSeverity::High, alert.describe(), None)
                    .await;
            }
            AlertKind::Resolved => {
                if gate.should_admit_new_sessions() {
                    let resolved = authority.resolve_category(ErrorCategory::Resource);
                    info!(resolved, "resource pressure cleared");
                }
            }
        }
    }
}

async fn dispatch_events(
    mut events: mpsc::Receiver<SessionEvent>,
    cleanup: Arc<CleanupOrchestrator>,
    authority: EscalationAuthority,
    notifier: Arc<dyn Notifier>,
    cancel: CancellationToken,
) {
    info!("session event dispatcher started");
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        handle_event(event, &cleanup, &authority, notifier.as_ref()).await;
    }

    // Expiries already queued still owe a destruction.
    events.close();
    while let Some(event) = events.recv().await {
        handle_event(event, &cleanup, &authority, notifier.as_ref()).await;
    }
    info!("session event dispatcher stopped");
}

async fn handle_event(
    event: SessionEvent,
    cleanup: &CleanupOrchestrator,
    authority: &EscalationAuthority,
    notifier: &dyn Notifier,
) {
    let session_id = match &event {
        SessionEvent::Created(id) | SessionEvent::Expired(id) => id.clone(),
        SessionEvent::StatusChanged { session_id, .. } => session_id.clone(),
    };

    if let Err(e) = notifier.notify(&event) {
        authority
            .report(
                ErrorCategory::Network,
                ErrorSeverity::Medium,
                format!("notification failed: {e}"),
                Some(session_id.clone()),
            )
            .await;
    }

    if let SessionEvent::Expired(id) = event {
        let result = cleanup.automatic(&id).await;
        if !result.success {
            authority
                .report(
                    ErrorCategory::Session,
                    ErrorSeverity::High,
                    format!("expiry cleanup failed: {}", result.errors.join("; ")),
                    Some(id),
                )
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use kioskwerk_core::types::{SessionStatus, SystemError};
    use kioskwerk_security::{MultiPassShredder, fixtures};
    use tempfile::TempDir;

    use crate::escalation::EscalationAction;
    use crate::resources::{FixedSampler, Metric};

    struct Fixture {
        _root: TempDir,
        kiosk: Kiosk,
        audit: Arc<AuditLog>,
        sampler: Arc<FixedSampler>,
    }

    struct FailingNotifier;

    impl Notifier for FailingNotifier {
        fn notify(&self, _event: &SessionEvent) -> Result<()> {
            Err(KioskError::Notification("dashboard unreachable".into()))
        }
    }

    fn fixture_with(mut config: AgentConfig, notifier: Arc<dyn Notifier>) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        config.storage.session_root = root.path().join("sessions");
        config.cleanup.retry_delay_ms = 1;
        let audit = Arc::new(AuditLog::open_in_memory().unwrap());
        let sampler = Arc::new(FixedSampler::idle());
        let parts = KioskParts {
            audit: audit.clone(),
            shredder: Arc::new(MultiPassShredder::new()),
            sampler: sampler.clone(),
            notifier,
            probes: None,
        };
        let kiosk = Kiosk::assemble(config, parts).unwrap();
        Fixture {
            _root: root,
            kiosk,
            audit,
            sampler,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(AgentConfig::default(), Arc::new(LogNotifier))
    }

    fn pdf_upload(min_bytes: usize) -> (Vec<u8>, DeclaredFile) {
        let bytes = fixtures::pdf_document(1, min_bytes);
        let declared = DeclaredFile {
            name: "boarding-pass.pdf".into(),
            mime_type: "application/pdf".into(),
            size: bytes.len() as u64,
        };
        (bytes, declared)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    fn unresolved(kiosk: &Kiosk, category: ErrorCategory) -> Vec<SystemError> {
        kiosk
            .authority()
            .unresolved()
            .into_iter()
            .filter(|e| e.category == category)
            .collect()
    }

    #[tokio::test]
    async fn unusable_session_root_is_escalated_on_open() {
        let f = fixture();
        let root = f.kiosk.storage().root().to_path_buf();
        std::fs::remove_dir_all(&root).unwrap();
        std::fs::write(&root, b"not a directory").unwrap();

        let err = f.kiosk.open_session("shop-1").await.unwrap_err();
        assert!(matches!(err, KioskError::Workspace(_)));
        assert!(f.kiosk.registry().session_ids().is_empty());

        let faults = unresolved(&f.kiosk, ErrorCategory::Filesystem);
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].severity, ErrorSeverity::High);
        assert!(faults[0].session_id.is_none());
        assert_eq!(f.audit.count_kind(AuditEventKind::ErrorOccurred).unwrap(), 1);
    }

    #[tokio::test]
    async fn manual_termination_destroys_exactly_once() {
        let f = fixture();
        let id = f.kiosk.open_session("shop-1").await.unwrap();
        let (bytes, declared) = pdf_upload(12 * 1024);
        f.kiosk.receive_file(&id, bytes, declared).await.unwrap();

        let result = f.kiosk.terminate_session(&id, "user_request").await.unwrap();
        assert!(result.success);
        assert!(result.verification_passed);
        assert!(f.kiosk.storage().verify(&id));
        assert!(f.kiosk.registry().get_status(&id).is_none());

        let destroyed = f
            .audit
            .entries_for_session(&id)
            .unwrap()
            .into_iter()
            .filter(|e| e.event == "data_destroyed")
            .count();
        assert_eq!(destroyed, 1);
    }

    #[tokio::test]
    async fn disk_pressure_refuses_admission_and_escalates() {
        let f = fixture();
        f.sampler.set(|s| s.disk_free_bytes = 100 * 1024 * 1024);

        let alerts = f.kiosk.sample_resources().await.unwrap();
        assert!(alerts
            .iter()
            .any(|a| a.metric == Metric::Disk && a.kind == AlertKind::Critical));

        let err = f.kiosk.open_session("shop-1").await.unwrap_err();
        assert!(matches!(err, KioskError::AdmissionRefused(_)));

        let faults = unresolved(&f.kiosk, ErrorCategory::Resource);
        assert!(faults.iter().any(|e| e.severity == ErrorSeverity::High));
        assert_eq!(f.audit.count_kind(AuditEventKind::AdmissionRefused).unwrap(), 1);
        assert!(f.kiosk.registry().session_ids().is_empty());
    }

    #[tokio::test]
    async fn refusal_without_prior_sample_records_resource_fault() {
        let f = fixture();
        f.sampler.set(|s| s.disk_free_bytes = 100 * 1024 * 1024);
        f.kiosk.gate().observe(f.sampler.sample().unwrap());

        assert!(f.kiosk.open_session("shop-1").await.is_err());
        assert!(f.kiosk.open_session("shop-1").await.is_err());

        let faults = unresolved(&f.kiosk, ErrorCategory::Resource);
        assert_eq!(faults.len(), 1, "one fault per episode, not per refusal");
        assert_eq!(faults[0].severity, ErrorSeverity::High);
    }

    #[tokio::test]
    async fn resolved_pressure_reopens_admission() {
        let f = fixture();
        f.sampler.set(|s| s.disk_free_bytes = 100 * 1024 * 1024);
        f.kiosk.sample_resources().await.unwrap();
        assert!(f.kiosk.open_session("shop-1").await.is_err());

        f.sampler.set(|s| s.disk_free_bytes = 100_000_000_000);
        let alerts = f.kiosk.sample_resources().await.unwrap();
        assert!(alerts.iter().any(|a| a.kind == AlertKind::Resolved));
        assert!(unresolved(&f.kiosk, ErrorCategory::Resource).is_empty());

        f.kiosk.open_session("shop-1").await.unwrap();
    }

    #[tokio::test]
    async fn critical_fault_closes_the_kiosk_until_resumed() {
        let f = fixture();
        let a = f.kiosk.open_session("shop-1").await.unwrap();
        let b = f.kiosk.open_session("shop-1").await.unwrap();

        let escalation = f
            .kiosk
            .authority()
            .report(ErrorCategory::System, ErrorSeverity::Critical, "tamper", None)
            .await;
        assert!(matches!(escalation.action, EscalationAction::FailClosed(ref r) if r.sessions_terminated == 2));
        assert!(f.kiosk.registry().get_status(&a).is_none());
        assert!(f.kiosk.registry().get_status(&b).is_none());

        assert!(matches!(
            f.kiosk.open_session("shop-1").await,
            Err(KioskError::AdmissionRefused(_))
        ));
        assert!(unresolved(&f.kiosk, ErrorCategory::Resource).is_empty());

        f.kiosk.authority().resume_admission();
        f.kiosk.open_session("shop-1").await.unwrap();
    }

    #[tokio::test]
    async fn failed_notification_is_a_medium_network_fault() {
        let f = fixture_with(AgentConfig::default(), Arc::new(FailingNotifier));
        f.kiosk.spawn_background();

        let id = f.kiosk.open_session("shop-1").await.unwrap();
        assert!(wait_for(|| !unresolved(&f.kiosk, ErrorCategory::Network).is_empty()).await);

        let fault = &unresolved(&f.kiosk, ErrorCategory::Network)[0];
        assert_eq!(fault.severity, ErrorSeverity::Medium);
        assert_eq!(fault.session_id.as_ref(), Some(&id));
        assert!(f.kiosk.registry().is_active(&id), "session is unaffected");
        f.kiosk.shutdown().await;
    }

    #[tokio::test]
    async fn expiry_is_destroyed_by_the_dispatcher() {
        let mut config = AgentConfig::default();
        // Shortest timeout the registry schedules.
        config.sessions.timeout_minutes = 0;
        let f = fixture_with(config, Arc::new(LogNotifier));
        f.kiosk.spawn_background();

        let id = f.kiosk.open_session("shop-1").await.unwrap();
        let storage = Arc::clone(f.kiosk.storage());
        assert!(wait_for(|| storage.verify(&id)).await);
        assert!(f.kiosk.registry().get_status(&id).is_none());

        let audit = Arc::clone(&f.audit);
        assert!(
            wait_for(|| audit.count_kind(AuditEventKind::DataDestroyed).unwrap() == 1).await
        );
        f.kiosk.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_destroys_remaining_sessions() {
        let f = fixture();
        f.kiosk.spawn_background();
        let a = f.kiosk.open_session("shop-1").await.unwrap();
        let b = f.kiosk.open_session("shop-1").await.unwrap();
        f.kiosk.registry().update_status(&b, SessionStatus::Printing).unwrap();

        f.kiosk.shutdown().await;

        assert!(f.kiosk.registry().session_ids().is_empty());
        assert!(f.kiosk.storage().verify(&a));
        assert!(f.kiosk.storage().verify(&b));
    }

    #[tokio::test]
    async fn crash_recovery_sweeps_leftovers() {
        let f = fixture();
        for _ in 0..3 {
            f.kiosk.storage().create_workspace(&SessionId::new()).unwrap();
        }
        let report = f.kiosk.recover_from_crash().await;
        assert_eq!(report.total_found, 3);
        assert_eq!(report.total_recovered, 3);
        assert!(f.kiosk.authority().errors().is_empty());
    }

    #[tokio::test]
    async fn print_snapshot_goes_through_intake() {
        let f = fixture();
        let id = f.kiosk.open_session("shop-1").await.unwrap();
        let (bytes, declared) = pdf_upload(0);
        f.kiosk.receive_file(&id, bytes, declared).await.unwrap();

        let snapshot = f.kiosk.print_snapshot(&id, PrintOptions::default()).unwrap();
        assert_eq!(snapshot.session_id, id);
        assert_eq!(snapshot.files.len(), 1);
    }
}
