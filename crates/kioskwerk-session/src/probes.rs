// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Recovery probes used by the escalation authority to decide whether a
// reported fault has cleared. Probes are blocking and cheap; callers run them
// on the blocking pool.

use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kioskwerk_core::config::ProbeConfig;
use tracing::debug;

/// A yes/no health check.
pub trait Probe: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self) -> bool;
}

/// Online if the OS can route a UDP socket to the target. Nothing is sent.
pub struct ConnectivityProbe {
    target: String,
}

impl ConnectivityProbe {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

impl Probe for ConnectivityProbe {
    fn name(&self) -> &'static str {
        "connectivity"
    }

    fn check(&self) -> bool {
        let online = UdpSocket::bind("0.0.0.0:0")
            .and_then(|s| {
                s.connect(self.target.as_str())?;
                s.local_addr()
            })
            .map(|addr| !addr.ip().is_loopback())
            .unwrap_or(false);
        debug!(target = %self.target, online, "connectivity probe");
        online
    }
}

/// Re-detects the printer with a TCP connect to its configured endpoint.
pub struct PrinterProbe {
    address: Option<SocketAddr>,
    timeout: Duration,
}

impl PrinterProbe {
    pub fn new(address: Option<SocketAddr>, timeout: Duration) -> Self {
        Self { address, timeout }
    }
}

impl Probe for PrinterProbe {
    fn name(&self) -> &'static str {
        "printer"
    }

    fn check(&self) -> bool {
        let Some(address) = self.address else {
            debug!("no printer address configured");
            return false;
        };
        let reachable = TcpStream::connect_timeout(&address, self.timeout).is_ok();
        debug!(%address, reachable, "printer probe");
        reachable
    }
}

/// The session root accepts a new file.
pub struct WritableDirProbe {
    dir: PathBuf,
}

impl WritableDirProbe {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl Probe for WritableDirProbe {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    fn check(&self) -> bool {
        let marker = self.dir.join(format!(".probe-{}", uuid::Uuid::new_v4()));
        let writable = std::fs::write(&marker, b"ok").is_ok();
        if writable {
            let _ = std::fs::remove_file(&marker);
        }
        debug!(dir = %self.dir.display(), writable, "filesystem probe");
        writable
    }
}

/// The probe set consulted during recovery.
#[derive(Clone)]
pub struct Probes {
    pub connectivity: Arc<dyn Probe>,
    pub printer: Arc<dyn Probe>,
    pub filesystem: Arc<dyn Probe>,
}

impl Probes {
    pub fn from_config(config: &ProbeConfig, session_root: impl Into<PathBuf>) -> Self {
        Self {
            connectivity: Arc::new(ConnectivityProbe::new(config.connectivity_target.clone())),
            printer: Arc::new(PrinterProbe::new(config.printer_address, config.probe_timeout())),
            filesystem: Arc::new(WritableDirProbe::new(session_root)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn printer_probe_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let probe = PrinterProbe::new(Some(listener.local_addr().unwrap()), Duration::from_secs(1));
        assert!(probe.check());
    }

    #[test]
    fn printer_probe_without_address_fails() {
        assert!(!PrinterProbe::new(None, Duration::from_millis(10)).check());
    }

    #[test]
    fn filesystem_probe_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        assert!(WritableDirProbe::new(dir.path()).check());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn filesystem_probe_fails_on_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!WritableDirProbe::new(dir.path().join("gone")).check());
    }
}
