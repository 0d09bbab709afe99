// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// kioskwerk-security — everything that touches customer bytes at rest.
//
// Session workspaces on disk, intake validation, multi-pass destructive
// overwrite, content hashing, and the append-only audit trail. Nothing in
// this crate knows about session lifetimes; that lives in kioskwerk-session.

pub mod audit;
#[cfg(any(test, feature = "test-fixtures"))]
pub mod fixtures;
pub mod integrity;
pub mod shred;
pub mod storage;
pub mod validation;

pub use audit::{AuditEntry, AuditEvent, AuditEventKind, AuditLog, AuditSink};
pub use integrity::{hash_bytes, verify_hash};
pub use shred::{MultiPassShredder, Shredder, SystemShredder, probe_shredder};
pub use storage::{OrphanWorkspace, SecureStorage, WorkspaceMetadata};
pub use validation::IntakeLimits;
