// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Agent configuration. Persisted as `config.json` in the data directory.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KioskError, Result};

const MIB: u64 = 1024 * 1024;
const GB: u64 = 1_000_000_000;

/// File name of the persisted configuration inside the data directory.
pub const CONFIG_FILE: &str = "config.json";

/// Complete agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub storage: StorageConfig,
    pub sessions: SessionConfig,
    pub cleanup: CleanupConfig,
    pub resources: ResourceConfig,
    pub escalation: EscalationConfig,
    pub probes: ProbeConfig,
}

/// On-disk layout and intake limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory holding one subdirectory per session.
    pub session_root: PathBuf,
    /// SQLite audit database path. Relative paths resolve against the data dir.
    pub audit_db: PathBuf,
    pub max_file_bytes: u64,
    pub max_files_per_session: usize,
    pub max_session_bytes: u64,
    /// Use the platform `shred` utility when the startup probe finds it.
    pub prefer_system_shred: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub timeout_minutes: u64,
    /// Capacity of the session event channel.
    pub event_buffer: usize,
}

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `delay * (n + 1)` before retry `n`
    Linear,
    /// `delay * 2^n` before retry `n`
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub backoff: BackoffStrategy,
}

/// Warning / critical thresholds. Disk thresholds are minimum free bytes.
///
/// Threshold blocks must be complete when present in `config.json`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceThresholds {
    pub memory_percent: f64,
    pub disk_free_bytes: u64,
    pub cpu_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub sample_interval_secs: u64,
    pub warning: ResourceThresholds,
    pub critical: ResourceThresholds,
    pub history_window_secs: u64,
    pub max_history: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    pub retry_base_delay_ms: u64,
    pub max_retry_attempts: u32,
    pub error_retention_secs: u64,
    pub max_errors: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Printer endpoint used to re-detect the printer after a fault.
    pub printer_address: Option<SocketAddr>,
    /// Target for the connectivity probe.
    pub connectivity_target: String,
    pub probe_timeout_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            sessions: SessionConfig::default(),
            cleanup: CleanupConfig::default(),
            resources: ResourceConfig::default(),
            escalation: EscalationConfig::default(),
            probes: ProbeConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            session_root: std::env::temp_dir().join("kioskwerk").join("sessions"),
            audit_db: PathBuf::from("audit.db"),
            max_file_bytes: 10 * MIB,
            max_files_per_session: 20,
            max_session_bytes: 50 * MIB,
            prefer_system_shred: true,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: 30,
            event_buffer: 256,
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 1_000,
            backoff: BackoffStrategy::Exponential,
        }
    }
}

impl ResourceThresholds {
    pub fn warning() -> Self {
        Self {
            memory_percent: 75.0,
            disk_free_bytes: 2 * GB,
            cpu_percent: 80.0,
        }
    }

    pub fn critical() -> Self {
        Self {
            memory_percent: 90.0,
            disk_free_bytes: GB / 2,
            cpu_percent: 95.0,
        }
    }
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 30,
            warning: ResourceThresholds::warning(),
            critical: ResourceThresholds::critical(),
            history_window_secs: 3_600,
            max_history: 720,
        }
    }
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            retry_base_delay_ms: 1_000,
            max_retry_attempts: 5,
            error_retention_secs: 24 * 3_600,
            max_errors: 1_000,
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            printer_address: None,
            connectivity_target: "8.8.8.8:53".into(),
            probe_timeout_ms: 2_000,
        }
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes * 60)
    }
}

impl CleanupConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl ResourceConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }

    pub fn history_window(&self) -> Duration {
        Duration::from_secs(self.history_window_secs)
    }
}

impl EscalationConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn error_retention(&self) -> Duration {
        Duration::from_secs(self.error_retention_secs)
    }
}

impl ProbeConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl AgentConfig {
    /// Load `config.json` from `data_dir`, falling back to defaults when the
    /// file does not exist. A file that exists but does not parse is an error.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CONFIG_FILE);
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        let config: Self = serde_json::from_str(&data)
            .map_err(|e| KioskError::Configuration(format!("{}: {e}", path.display())))?;
        Ok(config)
    }

    /// Write the configuration back as pretty JSON.
    pub fn persist(&self, data_dir: &Path) -> Result<()> {
        let path = data_dir.join(CONFIG_FILE);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;
        Ok(())
    }

    /// Reject configurations the core cannot honour.
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: &str| Err(KioskError::Configuration(msg.to_owned()));

        if self.sessions.timeout_minutes == 0 {
            return bad("sessions.timeout_minutes must be at least 1");
        }
        if self.sessions.event_buffer == 0 {
            return bad("sessions.event_buffer must be at least 1");
        }
        if self.storage.max_file_bytes == 0 {
            return bad("storage.max_file_bytes must be positive");
        }
        if self.storage.max_session_bytes < self.storage.max_file_bytes {
            return bad("storage.max_session_bytes must be >= storage.max_file_bytes");
        }
        if self.storage.max_files_per_session == 0 {
            return bad("storage.max_files_per_session must be at least 1");
        }
        if self.cleanup.max_attempts == 0 {
            return bad("cleanup.max_attempts must be at least 1");
        }
        if self.resources.sample_interval_secs == 0 {
            return bad("resources.sample_interval_secs must be at least 1");
        }

        let (w, c) = (&self.resources.warning, &self.resources.critical);
        if w.memory_percent > c.memory_percent || w.cpu_percent > c.cpu_percent {
            return bad("resource warning thresholds must not exceed critical thresholds");
        }
        // Disk thresholds are minimum free space, so the ordering is inverted.
        if w.disk_free_bytes < c.disk_free_bytes {
            return bad("disk warning threshold must be at least the critical threshold");
        }
        Ok(())
    }
}
