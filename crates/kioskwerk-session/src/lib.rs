// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// kioskwerk-session — session lifetimes and what happens when they end.
//
// The registry owns every live session and its expiry timer. The cleanup
// orchestrator turns "this session is over" into verified destruction. The
// resource gate and escalation authority decide when the kiosk stops taking
// customers, and `Kiosk` wires them together.

pub mod cleanup;
pub mod escalation;
pub mod intake;
pub mod kiosk;
pub mod notify;
pub mod probes;
pub mod registry;
pub mod resources;
pub mod retry;

pub use cleanup::{CleanupOrchestrator, CleanupTrigger, RecoveryReport};
pub use escalation::{Escalation, EscalationAction, EscalationAuthority, FailClosedReport, classify};
pub use intake::Intake;
pub use kiosk::{Kiosk, KioskParts};
pub use notify::{LogNotifier, Notifier};
pub use probes::{Probe, Probes};
pub use registry::{SessionEvent, SessionRegistry};
pub use resources::{
    AlertKind, Metric, ResourceAlert, ResourceGate, ResourceLevel, ResourceSampler, SystemSampler,
};

use kioskwerk_security::{AuditEvent, AuditSink};
use tracing::warn;

/// Record an audit event. Audit failures are logged, never propagated.
pub(crate) fn audit(sink: &dyn AuditSink, event: AuditEvent) {
    if let Err(e) = sink.record(&event) {
        warn!(event = event.kind.as_str(), error = %e, "failed to write audit entry");
    }
}
