// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Outbound session notifications (the shop dashboard, a websocket relay...).

use kioskwerk_core::error::Result;
use tracing::info;

use crate::registry::SessionEvent;

/// Receives session lifecycle events. Delivery failures are reported to the
/// escalation authority as network faults; they never affect the session.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &SessionEvent) -> Result<()>;
}

/// Writes events to the log. Used when no remote endpoint is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &SessionEvent) -> Result<()> {
        match event {
            SessionEvent::Created(id) => info!(session_id = %id, "notify: session created"),
            SessionEvent::StatusChanged {
                session_id,
                from,
                to,
            } => info!(%session_id, ?from, ?to, "notify: status changed"),
            SessionEvent::Expired(id) => info!(session_id = %id, "notify: session expired"),
        }
        Ok(())
    }
}
