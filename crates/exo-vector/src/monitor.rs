//! Host and accelerator memory monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use exo_core::error::{ExoError, Result};
use exo_core::types::{DeviceId, HostMemory, PressureThresholds, ResourceSnapshot};
use sysinfo::System;
use tracing::{debug, info, warn};

use crate::device::DeviceProfiler;

/// Source of host memory readings.
pub trait HostMemorySource: Send + Sync {
    fn read(&self) -> Result<HostMemory>;

    /// CPU brand string used as the host device name.
    fn cpu_name(&self) -> String;

    /// Drop internal caches so the next read starts fresh.
    fn refresh(&self) {}
}

/// Host memory read through `sysinfo`.
pub struct SysinfoMemory {
    system: Mutex<System>,
}

impl std::fmt::Debug for SysinfoMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysinfoMemory").finish()
    }
}

impl SysinfoMemory {
    pub fn new() -> Self {
        let mut system = System::new_all();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl HostMemorySource for SysinfoMemory {
    fn read(&self) -> Result<HostMemory> {
        let mut sys = self
            .system
            .lock()
            .map_err(|e| ExoError::InvalidInput(format!("Lock poisoned: {}", e)))?;
        sys.refresh_memory();
        let total = sys.total_memory();
        let available = sys.available_memory();
        Ok(HostMemory {
            used_bytes: total.saturating_sub(available),
            available_bytes: available,
            total_bytes: total,
        })
    }

    fn cpu_name(&self) -> String {
        self.system
            .lock()
            .ok()
            .and_then(|sys| sys.cpus().first().map(|cpu| cpu.brand().trim().to_string()))
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "host cpu".to_string())
    }

    fn refresh(&self) {
        if let Ok(mut sys) = self.system.lock() {
            sys.refresh_memory();
        }
    }
}

/// A host memory reading that only changes when told to.
#[derive(Debug)]
pub struct FixedMemory {
    reading: Mutex<HostMemory>,
    refreshes: AtomicU64,
}

impl FixedMemory {
    pub fn new(total_bytes: u64, used_bytes: u64) -> Self {
        Self {
            reading: Mutex::new(host_memory(total_bytes, used_bytes)),
            refreshes: AtomicU64::new(0),
        }
    }

    pub fn set_used(&self, used_bytes: u64) {
        if let Ok(mut reading) = self.reading.lock() {
            *reading = host_memory(reading.total_bytes, used_bytes);
        }
    }

    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }
}

fn host_memory(total_bytes: u64, used_bytes: u64) -> HostMemory {
    let used_bytes = used_bytes.min(total_bytes);
    HostMemory {
        used_bytes,
        available_bytes: total_bytes - used_bytes,
        total_bytes,
    }
}

impl HostMemorySource for FixedMemory {
    fn read(&self) -> Result<HostMemory> {
        self.reading
            .lock()
            .map(|r| *r)
            .map_err(|e| ExoError::InvalidInput(format!("Lock poisoned: {}", e)))
    }

    fn cpu_name(&self) -> String {
        "fixed host".to_string()
    }

    fn refresh(&self) {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
    }
}

/// Reads memory use across all usable devices and releases caches under pressure.
pub struct ResourceMonitor {
    profiler: Arc<DeviceProfiler>,
    latest: RwLock<Option<(Instant, ResourceSnapshot)>>,
    max_age: Duration,
    releases: AtomicU64,
}

impl ResourceMonitor {
    pub fn new(profiler: Arc<DeviceProfiler>) -> Self {
        Self {
            profiler,
            latest: RwLock::new(None),
            max_age: Duration::from_millis(500),
            releases: AtomicU64::new(0),
        }
    }

    /// How long `current()` may reuse the last snapshot.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Take a fresh reading and store it as the latest snapshot.
    ///
    /// Read failures are logged; a failed host read reports zero usage and a
    /// failed accelerator read omits that device.
    pub fn snapshot(&self) -> ResourceSnapshot {
        let host = self.profiler.host_source().read().unwrap_or_else(|e| {
            warn!(error = %e, "Host memory read failed");
            HostMemory::default()
        });

        let runtime = self.profiler.runtime();
        let accelerators = self
            .profiler
            .usable_devices()
            .into_iter()
            .filter_map(|d| match d.id {
                DeviceId::Accelerator(n) => match runtime.memory_usage(n) {
                    Ok(mem) => Some(mem),
                    Err(e) => {
                        warn!(device = %d.id, error = %e, "Accelerator memory read failed");
                        None
                    }
                },
                DeviceId::Cpu => None,
            })
            .collect();

        let snapshot = ResourceSnapshot {
            taken_at: Utc::now(),
            host,
            accelerators,
        };
        if let Ok(mut latest) = self.latest.write() {
            *latest = Some((Instant::now(), snapshot.clone()));
        }
        snapshot
    }

    /// The last stored snapshot, if any.
    pub fn latest(&self) -> Option<ResourceSnapshot> {
        self.latest
            .read()
            .ok()
            .and_then(|l| l.as_ref().map(|(_, s)| s.clone()))
    }

    /// The latest snapshot if it is recent enough, otherwise a fresh one.
    pub fn current(&self) -> ResourceSnapshot {
        let cached = self.latest.read().ok().and_then(|l| {
            l.as_ref()
                .filter(|(at, _)| at.elapsed() < self.max_age)
                .map(|(_, s)| s.clone())
        });
        cached.unwrap_or_else(|| self.snapshot())
    }

    /// Fresh check of every device against its threshold.
    pub fn should_release_pressure(&self, thresholds: &PressureThresholds) -> bool {
        let snapshot = self.snapshot();
        let exceeded = thresholds.exceeded(&snapshot);
        if exceeded {
            debug!(
                host = snapshot.host_percent(),
                accelerators = snapshot.accelerators.len(),
                "Memory pressure above threshold"
            );
        }
        exceeded
    }

    /// Memory pressure of one device in `[0, 1]`, from a recent snapshot.
    pub fn device_pressure(&self, device: DeviceId) -> f64 {
        self.current().pressure_of(device)
    }

    /// Used host memory, for per-task deltas.
    pub fn host_used_bytes(&self) -> u64 {
        self.profiler
            .host_source()
            .read()
            .map(|m| m.used_bytes)
            .unwrap_or(0)
    }

    /// Release accelerator caches and refresh host tables. Never fails.
    pub fn release_pressure(&self) {
        let runtime = self.profiler.runtime();
        for device in self.profiler.usable_devices() {
            if let DeviceId::Accelerator(n) = device.id {
                if let Err(e) = runtime.release_cache(n) {
                    warn!(device = %device.id, error = %e, "Cache release failed");
                }
            }
        }
        self.profiler.host_source().refresh();
        if let Ok(mut latest) = self.latest.write() {
            *latest = None;
        }
        let count = self.releases.fetch_add(1, Ordering::Relaxed) + 1;
        info!(releases = count, "Released memory pressure");
    }

    pub fn release_count(&self) -> u64 {
        self.releases.load(Ordering::Relaxed)
    }

    // -- Async callers --
    //
    // Readings can shell out to the accelerator runtime, so async code goes
    // through these, which run the synchronous call on the blocking pool.

    async fn off_executor<T, F>(self: &Arc<Self>, what: &'static str, f: F) -> Option<T>
    where
        F: FnOnce(&ResourceMonitor) -> T + Send + 'static,
        T: Send + 'static,
    {
        let monitor = Arc::clone(self);
        match tokio::task::spawn_blocking(move || f(&monitor)).await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, what, "Monitor task failed");
                None
            }
        }
    }

    /// `current()` on the blocking pool.
    pub async fn current_async(self: &Arc<Self>) -> ResourceSnapshot {
        self.off_executor("snapshot", |m| m.current())
            .await
            .unwrap_or_else(|| ResourceSnapshot {
                taken_at: Utc::now(),
                host: HostMemory::default(),
                accelerators: Vec::new(),
            })
    }

    /// `should_release_pressure()` on the blocking pool.
    pub async fn should_release_pressure_async(
        self: &Arc<Self>,
        thresholds: PressureThresholds,
    ) -> bool {
        self.off_executor("pressure check", move |m| m.should_release_pressure(&thresholds))
            .await
            .unwrap_or(false)
    }

    /// `host_used_bytes()` on the blocking pool.
    pub async fn host_used_bytes_async(self: &Arc<Self>) -> u64 {
        self.off_executor("host read", |m| m.host_used_bytes())
            .await
            .unwrap_or(0)
    }

    /// `release_pressure()` on the blocking pool.
    pub async fn release_pressure_async(self: &Arc<Self>) {
        self.off_executor("release", |m| m.release_pressure()).await;
    }

    pub fn profiler(&self) -> &Arc<DeviceProfiler> {
        &self.profiler
    }
}
