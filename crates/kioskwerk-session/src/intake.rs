// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// File intake and print hand-off for live sessions.
//
// A file becomes part of a session only after storage has committed it and
// the registry has attached it. If the session ends anywhere in between, the
// bytes are rolled back and the caller sees `SessionNotActive`.

use std::sync::Arc;

use kioskwerk_core::error::{KioskError, Result};
use kioskwerk_core::types::{
    DeclaredFile, FileRecord, PrintOptions, PrintSnapshot, PrintableFile, SessionId, SessionStatus,
};
use kioskwerk_security::SecureStorage;
use tracing::{info, instrument, warn};

use crate::registry::SessionRegistry;

#[derive(Clone)]
pub struct Intake {
    registry: SessionRegistry,
    storage: Arc<SecureStorage>,
}

impl Intake {
    pub fn new(registry: SessionRegistry, storage: Arc<SecureStorage>) -> Self {
        Self { registry, storage }
    }

    /// Validate, persist and attach an uploaded file.
    #[instrument(skip_all, fields(session_id = %id, size = bytes.len()))]
    pub async fn receive(
        &self,
        id: &SessionId,
        bytes: Vec<u8>,
        declared: DeclaredFile,
    ) -> Result<FileRecord> {
        self.require_status(id, &[SessionStatus::Active])?;

        let registry = self.registry.clone();
        let storage = Arc::clone(&self.storage);
        let session = id.clone();
        let record = tokio::task::spawn_blocking(move || {
            storage.receive_guarded(&session, &bytes, &declared, &|| registry.is_active(&session))
        })
        .await
        .map_err(|e| KioskError::Filesystem(format!("intake task failed: {e}")))??;

        if let Err(e) = self.registry.attach_file(id, record.clone()) {
            warn!(file_id = %record.id, error = %e, "session changed during intake, rolling back");
            let storage = Arc::clone(&self.storage);
            let session = id.clone();
            let file_id = record.id;
            match tokio::task::spawn_blocking(move || storage.discard_file(&session, &file_id)).await {
                Ok(Ok(())) => {}
                Ok(Err(rollback)) => warn!(error = %rollback, "rollback failed"),
                Err(join) => warn!(error = %join, "rollback task failed"),
            }
            return Err(match e {
                KioskError::SessionNotFound(_) | KioskError::SessionExpired(_) => {
                    KioskError::SessionNotActive(id.to_string())
                }
                other => other,
            });
        }

        info!(file_id = %record.id, "file attached");
        Ok(record)
    }

    /// Everything the print subsystem needs, copied out of the registry.
    ///
    /// Only an `Active` or `Printing` session can be printed.
    pub fn print_snapshot(&self, id: &SessionId, options: PrintOptions) -> Result<PrintSnapshot> {
        let session = self.require_status(id, &[SessionStatus::Active, SessionStatus::Printing])?;
        let files = session
            .files
            .iter()
            .map(|f| PrintableFile {
                file_id: f.id,
                path: f.path.clone(),
                document_type: f.document_type,
                page_count: f.page_count,
            })
            .collect();
        Ok(PrintSnapshot {
            session_id: session.id,
            files,
            options,
        })
    }

    fn require_status(
        &self,
        id: &SessionId,
        allowed: &[SessionStatus],
    ) -> Result<kioskwerk_core::types::Session> {
        let session = self
            .registry
            .get_status(id)
            .ok_or_else(|| KioskError::SessionNotFound(id.to_string()))?;
        if !allowed.contains(&session.status) {
            return Err(KioskError::SessionNotActive(id.to_string()));
        }
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use kioskwerk_security::{AuditLog, IntakeLimits, MultiPassShredder, fixtures};
    use tempfile::TempDir;

    struct Fixture {
        _root: TempDir,
        registry: SessionRegistry,
        storage: Arc<SecureStorage>,
        intake: Intake,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let storage = Arc::new(
            SecureStorage::new(
                root.path().join("sessions"),
                IntakeLimits::default(),
                Arc::new(MultiPassShredder::new()),
            )
            .unwrap(),
        );
        let audit = Arc::new(AuditLog::open_in_memory().unwrap());
        let (registry, _events) =
            SessionRegistry::new(Arc::clone(&storage), audit, Duration::from_secs(1800), 64);
        let intake = Intake::new(registry.clone(), Arc::clone(&storage));
        Fixture {
            _root: root,
            registry,
            storage,
            intake,
        }
    }

    fn pdf(pages: u32) -> (Vec<u8>, DeclaredFile) {
        let bytes = fixtures::pdf_document(pages, 0);
        let declared = DeclaredFile {
            name: "thesis.pdf".into(),
            mime_type: "application/pdf".into(),
            size: bytes.len() as u64,
        };
        (bytes, declared)
    }

    #[tokio::test]
    async fn receive_attaches_to_session() {
        let f = fixture();
        let id = f.registry.create("shop-1").await.unwrap();
        let (bytes, declared) = pdf(3);

        let record = f.intake.receive(&id, bytes, declared).await.unwrap();
        assert_eq!(record.page_count, 3);

        let session = f.registry.get_status(&id).unwrap();
        assert_eq!(session.files.len(), 1);
        assert_eq!(session.files[0].id, record.id);
        assert_eq!(f.storage.read_metadata(&id).unwrap().files.len(), 1);
    }

    #[tokio::test]
    async fn receive_into_terminated_session_is_refused() {
        let f = fixture();
        let id = f.registry.create("shop-1").await.unwrap();
        f.registry.terminate(&id).await.unwrap();

        let (bytes, declared) = pdf(1);
        let err = f.intake.receive(&id, bytes, declared).await.unwrap_err();
        assert!(matches!(err, KioskError::SessionNotFound(_)));
        assert!(f.storage.verify(&id));
    }

    #[tokio::test]
    async fn receive_while_printing_is_refused() {
        let f = fixture();
        let id = f.registry.create("shop-1").await.unwrap();
        f.registry.update_status(&id, SessionStatus::Printing).unwrap();

        let (bytes, declared) = pdf(1);
        let err = f.intake.receive(&id, bytes, declared).await.unwrap_err();
        assert!(matches!(err, KioskError::SessionNotActive(_)));
        assert!(f.storage.read_metadata(&id).unwrap().files.is_empty());
    }

    #[tokio::test]
    async fn invalid_upload_leaves_session_untouched() {
        let f = fixture();
        let id = f.registry.create("shop-1").await.unwrap();
        let declared = DeclaredFile {
            name: "x.pdf".into(),
            mime_type: "application/pdf".into(),
            size: 0,
        };
        let err = f.intake.receive(&id, Vec::new(), declared).await.unwrap_err();
        assert!(err.is_validation());
        assert!(f.registry.get_status(&id).unwrap().files.is_empty());
    }

    #[tokio::test]
    async fn print_snapshot_follows_status() {
        let f = fixture();
        let id = f.registry.create("shop-1").await.unwrap();
        let (bytes, declared) = pdf(2);
        let record = f.intake.receive(&id, bytes, declared).await.unwrap();

        let snapshot = f.intake.print_snapshot(&id, PrintOptions::default()).unwrap();
        assert_eq!(snapshot.files.len(), 1);
        assert_eq!(snapshot.files[0].file_id, record.id);
        assert_eq!(snapshot.files[0].page_count, 2);

        f.registry.update_status(&id, SessionStatus::Printing).unwrap();
        assert!(f.intake.print_snapshot(&id, PrintOptions::default()).is_ok());

        f.registry.update_status(&id, SessionStatus::Completed).unwrap();
        assert!(matches!(
            f.intake.print_snapshot(&id, PrintOptions::default()),
            Err(KioskError::SessionNotActive(_))
        ));
    }
}
