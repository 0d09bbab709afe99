// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Resource gate. Host pressure decides whether new sessions are admitted.
//
// Each sample is graded per metric (memory, disk free, CPU) against the
// warning and critical thresholds. Alerts are edge-triggered: a metric only
// raises `Warning`, `Critical` or `Resolved` when its level changes. The gate
// itself never escalates; alerts are returned to the caller.

use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use kioskwerk_core::config::{ResourceConfig, ResourceThresholds};
use kioskwerk_core::error::{KioskError, Result};
use kioskwerk_core::types::ResourceSnapshot;
use sysinfo::{Disks, System};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Source of resource samples.
pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> Result<ResourceSnapshot>;
}

/// Samples the local host through `sysinfo`.
///
/// Disk figures are for the filesystem holding `disk_path` (the session root).
pub struct SystemSampler {
    system: Mutex<System>,
    disk_path: PathBuf,
}

impl SystemSampler {
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu();
        Self {
            system: Mutex::new(system),
            disk_path: disk_path.into(),
        }
    }

    /// `(total, available)` bytes for the disk whose mount point is the
    /// longest prefix of `path`.
    fn disk_space(path: &Path) -> Option<(u64, u64)> {
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let disks = Disks::new_with_refreshed_list();
        disks
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| (disk.total_space(), disk.available_space()))
    }
}

impl ResourceSampler for SystemSampler {
    fn sample(&self) -> Result<ResourceSnapshot> {
        let mut system = self.system.lock().unwrap_or_else(|p| p.into_inner());
        system.refresh_memory();
        system.refresh_cpu();

        let total_memory = system.total_memory();
        let memory_percent = if total_memory == 0 {
            0.0
        } else {
            system.used_memory() as f64 / total_memory as f64 * 100.0
        };

        let cpus = system.cpus();
        let cpu_percent = if cpus.is_empty() {
            0.0
        } else {
            cpus.iter().map(|cpu| cpu.cpu_usage() as f64).sum::<f64>() / cpus.len() as f64
        };
        drop(system);

        let (total_disk, free_disk) = Self::disk_space(&self.disk_path).ok_or_else(|| {
            KioskError::Filesystem(format!(
                "no disk found for {}",
                self.disk_path.display()
            ))
        })?;
        let disk_percent = if total_disk == 0 {
            0.0
        } else {
            total_disk.saturating_sub(free_disk) as f64 / total_disk as f64 * 100.0
        };

        Ok(ResourceSnapshot {
            memory_percent,
            disk_percent,
            cpu_percent,
            disk_free_bytes: free_disk,
            load_average: System::load_average().one,
            timestamp: Utc::now(),
        })
    }
}

/// A monitored metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    Memory,
    Disk,
    Cpu,
}

impl Metric {
    pub const ALL: [Metric; 3] = [Metric::Memory, Metric::Disk, Metric::Cpu];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Disk => "disk",
            Self::Cpu => "cpu",
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Memory => 0,
            Self::Disk => 1,
            Self::Cpu => 2,
        }
    }
}

/// Pressure level of one metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResourceLevel {
    Normal,
    Warning,
    Critical,
}

/// Level change of one metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    Warning,
    Critical,
    Resolved,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceAlert {
    pub metric: Metric,
    pub kind: AlertKind,
    pub level: ResourceLevel,
    /// Percent for memory/CPU, free bytes for disk.
    pub value: f64,
}

impl ResourceAlert {
    pub fn describe(&self) -> String {
        match self.metric {
            Metric::Disk => format!(
                "disk free {:.2} GB ({:?})",
                self.value / 1e9,
                self.level
            ),
            metric => format!("{} at {:.1}% ({:?})", metric.as_str(), self.value, self.level),
        }
    }
}

#[derive(Default)]
struct GateState {
    levels: [Option<ResourceLevel>; 3],
    history: VecDeque<ResourceSnapshot>,
}

/// Admission gate driven by resource samples.
pub struct ResourceGate {
    sampler: Arc<dyn ResourceSampler>,
    config: ResourceConfig,
    state: Mutex<GateState>,
}

impl ResourceGate {
    pub fn new(sampler: Arc<dyn ResourceSampler>, config: ResourceConfig) -> Self {
        Self {
            sampler,
            config,
            state: Mutex::new(GateState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    /// Take a sample now. Returns the snapshot and any level changes.
    pub async fn sample_now(&self) -> Result<(ResourceSnapshot, Vec<ResourceAlert>)> {
        let sampler = Arc::clone(&self.sampler);
        let snapshot = tokio::task::spawn_blocking(move || sampler.sample())
            .await
            .map_err(|e| KioskError::Configuration(format!("sampler task failed: {e}")))??;
        let alerts = self.observe(snapshot);
        Ok((snapshot, alerts))
    }

    /// Sample and report whether admission would be allowed, without touching
    /// alert state or history.
    pub async fn would_admit_now(&self) -> Result<bool> {
        let sampler = Arc::clone(&self.sampler);
        let snapshot = tokio::task::spawn_blocking(move || sampler.sample())
            .await
            .map_err(|e| KioskError::Configuration(format!("sampler task failed: {e}")))??;
        Ok(Metric::ALL
            .into_iter()
            .all(|metric| self.grade(metric, &snapshot).0 == ResourceLevel::Normal))
    }

    /// Grade a snapshot, append it to the history and return the edges.
    pub fn observe(&self, snapshot: ResourceSnapshot) -> Vec<ResourceAlert> {
        let mut state = self.state();
        let mut alerts = Vec::new();

        for metric in Metric::ALL {
            let (level, value) = self.grade(metric, &snapshot);
            let previous = state.levels[metric.index()].replace(level);
            // The first sample only raises alerts for levels above normal.
            let previous = previous.unwrap_or(ResourceLevel::Normal);
            if previous == level {
                continue;
            }
            let kind = match level {
                ResourceLevel::Normal => AlertKind::Resolved,
                ResourceLevel::Warning => AlertKind::Warning,
                ResourceLevel::Critical => AlertKind::Critical,
            };
            let alert = ResourceAlert {
                metric,
                kind,
                level,
                value,
            };
            match kind {
                AlertKind::Critical => error!(alert = %alert.describe(), "resource critical"),
                AlertKind::Warning => warn!(alert = %alert.describe(), "resource warning"),
                AlertKind::Resolved => info!(metric = metric.as_str(), "resource pressure resolved"),
            }
            alerts.push(alert);
        }

        state.history.push_back(snapshot);
        let window = chrono::Duration::from_std(self.config.history_window())
            .unwrap_or(chrono::Duration::hours(1));
        let cutoff = snapshot.timestamp - window;
        while state
            .history
            .front()
            .is_some_and(|s| s.timestamp < cutoff)
        {
            state.history.pop_front();
        }
        while state.history.len() > self.config.max_history.max(1) {
            state.history.pop_front();
        }

        debug!(
            memory = snapshot.memory_percent,
            cpu = snapshot.cpu_percent,
            disk_free = snapshot.disk_free_bytes,
            "resource sample"
        );
        alerts
    }

    fn grade(&self, metric: Metric, s: &ResourceSnapshot) -> (ResourceLevel, f64) {
        let exceeds = |t: &ResourceThresholds| match metric {
            Metric::Memory => s.memory_percent >= t.memory_percent,
            Metric::Disk => s.disk_free_bytes <= t.disk_free_bytes,
            Metric::Cpu => s.cpu_percent >= t.cpu_percent,
        };
        let level = if exceeds(&self.config.critical) {
            ResourceLevel::Critical
        } else if exceeds(&self.config.warning) {
            ResourceLevel::Warning
        } else {
            ResourceLevel::Normal
        };
        let value = match metric {
            Metric::Memory => s.memory_percent,
            Metric::Disk => s.disk_free_bytes as f64,
            Metric::Cpu => s.cpu_percent,
        };
        (level, value)
    }

    fn worst_level(&self) -> ResourceLevel {
        self.state()
            .levels
            .iter()
            .flatten()
            .copied()
            .max()
            .unwrap_or(ResourceLevel::Normal)
    }

    /// False once any metric is at warning or worse. True before the first sample.
    pub fn should_admit_new_sessions(&self) -> bool {
        self.worst_level() == ResourceLevel::Normal
    }

    /// True once any metric is critical.
    pub fn is_constrained(&self) -> bool {
        self.worst_level() == ResourceLevel::Critical
    }

    pub fn level(&self, metric: Metric) -> ResourceLevel {
        self.state().levels[metric.index()].unwrap_or(ResourceLevel::Normal)
    }

    pub fn latest(&self) -> Option<ResourceSnapshot> {
        self.state().history.back().copied()
    }

    /// Retained samples, oldest first.
    pub fn history(&self) -> Vec<ResourceSnapshot> {
        self.state().history.iter().copied().collect()
    }

    /// Sample every `interval` until `cancel` fires, handing each result to
    /// `handler`. Sampling errors are logged and the loop carries on.
    pub async fn run<H, Fut>(self: Arc<Self>, interval: Duration, cancel: CancellationToken, mut handler: H)
    where
        H: FnMut(ResourceSnapshot, Vec<ResourceAlert>) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "resource monitor started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match self.sample_now().await {
                    Ok((snapshot, alerts)) => handler(snapshot, alerts).await,
                    Err(e) => warn!(error = %e, "resource sample failed"),
                },
            }
        }
        info!("resource monitor stopped");
    }
}

/// Returns a fixed, adjustable snapshot instead of sampling the host.
#[cfg(test)]
pub(crate) struct FixedSampler {
    snapshot: Mutex<ResourceSnapshot>,
}

#[cfg(test)]
impl FixedSampler {
    pub fn new(snapshot: ResourceSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
        }
    }

    /// A comfortably idle host.
    pub fn idle() -> Self {
        Self::new(ResourceSnapshot {
            memory_percent: 20.0,
            disk_percent: 30.0,
            cpu_percent: 5.0,
            disk_free_bytes: 100_000_000_000,
            load_average: 0.1,
            timestamp: Utc::now(),
        })
    }

    pub fn set(&self, update: impl FnOnce(&mut ResourceSnapshot)) {
        let mut snapshot = self.snapshot.lock().unwrap_or_else(|p| p.into_inner());
        update(&mut snapshot);
    }
}

#[cfg(test)]
impl ResourceSampler for FixedSampler {
    fn sample(&self) -> Result<ResourceSnapshot> {
        let mut snapshot = *self.snapshot.lock().unwrap_or_else(|p| p.into_inner());
        snapshot.timestamp = Utc::now();
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> (Arc<FixedSampler>, Arc<ResourceGate>) {
        let sampler = Arc::new(FixedSampler::idle());
        let gate = Arc::new(ResourceGate::new(sampler.clone(), ResourceConfig::default()));
        (sampler, gate)
    }

    #[tokio::test]
    async fn idle_host_admits() {
        let (_, gate) = gate();
        assert!(gate.should_admit_new_sessions(), "admit before first sample");
        let (_, alerts) = gate.sample_now().await.unwrap();
        assert!(alerts.is_empty());
        assert!(gate.should_admit_new_sessions());
        assert!(!gate.is_constrained());
    }

    #[tokio::test]
    async fn warning_blocks_admission_without_constraint() {
        let (sampler, gate) = gate();
        sampler.set(|s| s.memory_percent = 80.0);
        let (_, alerts) = gate.sample_now().await.unwrap();

        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].metric, Metric::Memory);
        assert_eq!(alerts[0].kind, AlertKind::Warning);
        assert!(!gate.should_admit_new_sessions());
        assert!(!gate.is_constrained());
    }

    #[tokio::test]
    async fn low_disk_is_critical() {
        let (sampler, gate) = gate();
        sampler.set(|s| s.disk_free_bytes = 400_000_000);
        let (_, alerts) = gate.sample_now().await.unwrap();

        assert_eq!(alerts[0].metric, Metric::Disk);
        assert_eq!(alerts[0].kind, AlertKind::Critical);
        assert!(gate.is_constrained());
        assert!(!gate.should_admit_new_sessions());
    }

    #[tokio::test]
    async fn alerts_are_edge_triggered() {
        let (sampler, gate) = gate();
        sampler.set(|s| s.cpu_percent = 85.0);
        assert_eq!(gate.sample_now().await.unwrap().1.len(), 1);
        assert!(gate.sample_now().await.unwrap().1.is_empty(), "same level, no alert");

        sampler.set(|s| s.cpu_percent = 97.0);
        let (_, alerts) = gate.sample_now().await.unwrap();
        assert_eq!(alerts[0].kind, AlertKind::Critical);

        sampler.set(|s| s.cpu_percent = 10.0);
        let (_, alerts) = gate.sample_now().await.unwrap();
        assert_eq!(alerts[0].kind, AlertKind::Resolved);
        assert!(gate.should_admit_new_sessions());
    }

    #[test]
    fn history_is_bounded() {
        let sampler = Arc::new(FixedSampler::idle());
        let config = ResourceConfig {
            max_history: 3,
            ..ResourceConfig::default()
        };
        let gate = ResourceGate::new(sampler.clone(), config);
        for _ in 0..5 {
            gate.observe(sampler.sample().unwrap());
        }
        assert_eq!(gate.history().len(), 3);
    }

    #[test]
    fn history_drops_samples_outside_window() {
        let sampler = FixedSampler::idle();
        let gate = ResourceGate::new(Arc::new(FixedSampler::idle()), ResourceConfig::default());
        let mut old = sampler.sample().unwrap();
        old.timestamp -= chrono::Duration::hours(2);
        gate.observe(old);
        gate.observe(sampler.sample().unwrap());
        assert_eq!(gate.history().len(), 1);
    }

    #[tokio::test]
    async fn monitor_stops_on_cancel() {
        let (_, gate) = gate();
        let cancel = CancellationToken::new();
        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let counter = Arc::clone(&seen);
        let task = tokio::spawn(Arc::clone(&gate).run(
            Duration::from_millis(10),
            cancel.clone(),
            move |_, _| {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async {}
            },
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        task.await.unwrap();
        assert!(seen.load(std::sync::atomic::Ordering::SeqCst) >= 2);
        assert!(gate.latest().is_some());
    }

    #[test]
    fn system_sampler_reads_host() {
        let dir = tempfile::tempdir().unwrap();
        let sample = SystemSampler::new(dir.path()).sample();
        // Containers without a visible mount table are allowed to fail.
        if let Ok(s) = sample {
            assert!((0.0..=100.0).contains(&s.memory_percent));
            assert!(s.disk_free_bytes > 0);
        }
    }
}
