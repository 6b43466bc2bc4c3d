//! Compute device discovery.
//!
//! `DeviceProfiler` inspects the host CPU and whatever accelerators the configured
//! `AcceleratorRuntime` reports, caches the resulting profiles, and hands out the
//! usable subset. A device that fails to enumerate or initialize is logged and
//! marked unusable; only an empty usable set is fatal.

use std::collections::HashMap;
use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use exo_core::config::{DevicesConfig, GIB, MIB};
use exo_core::error::{ExoError, Result};
use exo_core::types::{AcceleratorMemory, DeviceId, DeviceProfile};
use tracing::{debug, info, warn};

use crate::monitor::HostMemorySource;

/// An accelerator as reported by its runtime, before initialization.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceleratorInfo {
    pub ordinal: u32,
    pub name: String,
    pub total_bytes: u64,
}

/// Pluggable access to an accelerator runtime.
///
/// Implementations must be cheap to call repeatedly; the resource monitor queries
/// `memory_usage` on every snapshot.
pub trait AcceleratorRuntime: Send + Sync {
    /// Short runtime name for logs.
    fn name(&self) -> &str;

    /// List the accelerators visible to this runtime.
    fn enumerate(&self) -> Result<Vec<AcceleratorInfo>>;

    /// Prepare a device for use. An error marks the device unusable.
    fn initialize(&self, ordinal: u32) -> Result<()>;

    /// Current memory reading for one device.
    fn memory_usage(&self, ordinal: u32) -> Result<AcceleratorMemory>;

    /// Ask the runtime to return cached allocations on a device.
    fn release_cache(&self, ordinal: u32) -> Result<()>;
}

/// Compute tier for an accelerator: 10 plus its memory in whole GiB.
pub fn accelerator_tier(total_bytes: u64) -> u32 {
    10 + u32::try_from(total_bytes / GIB).unwrap_or(u32::MAX - 10)
}

pub const HOST_TIER: u32 = 1;

/// Discovers compute devices and caches their profiles.
pub struct DeviceProfiler {
    runtime: Arc<dyn AcceleratorRuntime>,
    host: Arc<dyn HostMemorySource>,
    options: DevicesConfig,
    devices: RwLock<Arc<[DeviceProfile]>>,
}

impl std::fmt::Debug for DeviceProfiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceProfiler")
            .field("runtime", &self.runtime.name())
            .field("devices", &self.list_devices())
            .finish()
    }
}

impl DeviceProfiler {
    /// Detect all devices once and cache the result.
    ///
    /// Returns `DeviceUnavailable` when no device ends up usable.
    pub fn new(
        runtime: Arc<dyn AcceleratorRuntime>,
        host: Arc<dyn HostMemorySource>,
        options: DevicesConfig,
    ) -> Result<Self> {
        let profiler = Self {
            runtime,
            host,
            options,
            devices: RwLock::new(Arc::from(Vec::new())),
        };
        let devices = profiler.detect();
        ensure_usable(&devices)?;
        info!(
            runtime = profiler.runtime.name(),
            devices = devices.len(),
            usable = devices.iter().filter(|d| d.usable).count(),
            "Device profiling complete"
        );
        profiler.store(devices)?;
        Ok(profiler)
    }

    fn detect(&self) -> Vec<DeviceProfile> {
        let mut devices = Vec::new();

        let host_total = match self.host.read() {
            Ok(mem) => mem.total_bytes,
            Err(e) => {
                warn!(error = %e, "Failed to read host memory while profiling");
                0
            }
        };
        devices.push(DeviceProfile {
            id: DeviceId::Cpu,
            name: self.host.cpu_name(),
            total_bytes: host_total,
            compute_tier: HOST_TIER,
            usable: self.options.host_enabled,
        });

        if !self.options.enable_accelerators {
            debug!("Accelerator probing disabled");
            return devices;
        }

        let found = match self.runtime.enumerate() {
            Ok(found) => found,
            Err(e) => {
                warn!(runtime = self.runtime.name(), error = %e, "Accelerator enumeration failed");
                Vec::new()
            }
        };

        for info in found {
            let usable = match self.runtime.initialize(info.ordinal) {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        device = %DeviceId::Accelerator(info.ordinal),
                        error = %e,
                        "Accelerator failed to initialize; marking unusable"
                    );
                    false
                }
            };
            devices.push(DeviceProfile {
                id: DeviceId::Accelerator(info.ordinal),
                name: info.name,
                total_bytes: info.total_bytes,
                compute_tier: accelerator_tier(info.total_bytes),
                usable,
            });
        }

        devices
    }

    fn store(&self, devices: Vec<DeviceProfile>) -> Result<()> {
        let mut guard = self
            .devices
            .write()
            .map_err(|e| ExoError::DeviceUnavailable(format!("Lock poisoned: {}", e)))?;
        *guard = Arc::from(devices);
        Ok(())
    }

    /// Re-detect every device. The cached list is replaced only if the new pass
    /// still has a usable device.
    pub fn refresh(&self) -> Result<()> {
        let devices = self.detect();
        ensure_usable(&devices)?;
        self.store(devices)
    }

    /// Snapshot of the cached profiles.
    pub fn devices(&self) -> Arc<[DeviceProfile]> {
        self.devices
            .read()
            .map(|d| Arc::clone(&d))
            .unwrap_or_else(|_| Arc::from(Vec::new()))
    }

    pub fn list_devices(&self) -> Vec<DeviceProfile> {
        self.devices().to_vec()
    }

    pub fn usable_devices(&self) -> Vec<DeviceProfile> {
        self.devices().iter().filter(|d| d.usable).cloned().collect()
    }

    pub fn get(&self, id: DeviceId) -> Option<DeviceProfile> {
        self.devices().iter().find(|d| d.id == id).cloned()
    }

    /// The host CPU profile, if it is usable.
    pub fn usable_host(&self) -> Option<DeviceProfile> {
        self.get(DeviceId::Cpu).filter(|d| d.usable)
    }

    pub fn runtime(&self) -> &Arc<dyn AcceleratorRuntime> {
        &self.runtime
    }

    pub fn host_source(&self) -> &Arc<dyn HostMemorySource> {
        &self.host
    }
}

fn ensure_usable(devices: &[DeviceProfile]) -> Result<()> {
    if devices.iter().any(|d| d.usable) {
        Ok(())
    } else {
        Err(ExoError::DeviceUnavailable(format!(
            "{} device(s) found, none usable",
            devices.len()
        )))
    }
}

// ---------------------------------------------------------------------------
// NoAccelerators
// ---------------------------------------------------------------------------

/// Runtime for hosts without accelerators.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAccelerators;

impl AcceleratorRuntime for NoAccelerators {
    fn name(&self) -> &str {
        "none"
    }

    fn enumerate(&self) -> Result<Vec<AcceleratorInfo>> {
        Ok(Vec::new())
    }

    fn initialize(&self, ordinal: u32) -> Result<()> {
        Err(ExoError::DeviceUnavailable(format!("no accelerator {}", ordinal)))
    }

    fn memory_usage(&self, ordinal: u32) -> Result<AcceleratorMemory> {
        Err(ExoError::DeviceUnavailable(format!("no accelerator {}", ordinal)))
    }

    fn release_cache(&self, _ordinal: u32) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// NvidiaSmiRuntime
// ---------------------------------------------------------------------------

/// Reads NVIDIA accelerators through the `nvidia-smi` CLI.
///
/// Every call is a subprocess bounded by `timeout`. `nvidia-smi` cannot free
/// another process's allocator cache, so `release_cache` only logs.
#[derive(Debug, Clone)]
pub struct NvidiaSmiRuntime {
    binary: String,
    timeout: Duration,
}

impl Default for NvidiaSmiRuntime {
    fn default() -> Self {
        Self {
            binary: "nvidia-smi".to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

impl NvidiaSmiRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn query(&self, fields: &str) -> Result<String> {
        run_bounded(
            &self.binary,
            &[
                &format!("--query-gpu={}", fields),
                "--format=csv,noheader,nounits",
            ],
            self.timeout,
        )
    }

    fn memory_table(&self) -> Result<HashMap<u32, AcceleratorMemory>> {
        let out = self.query("index,memory.used,memory.reserved,memory.total")?;
        Ok(parse_memory_csv(&out)
            .into_iter()
            .filter_map(|m| match m.device {
                DeviceId::Accelerator(n) => Some((n, m)),
                DeviceId::Cpu => None,
            })
            .collect())
    }
}

impl AcceleratorRuntime for NvidiaSmiRuntime {
    fn name(&self) -> &str {
        "nvidia-smi"
    }

    fn enumerate(&self) -> Result<Vec<AcceleratorInfo>> {
        let out = self.query("index,name,memory.total")?;
        Ok(parse_enumeration_csv(&out))
    }

    fn initialize(&self, ordinal: u32) -> Result<()> {
        let table = self.memory_table()?;
        match table.get(&ordinal) {
            Some(mem) if mem.total_bytes > 0 => Ok(()),
            Some(_) => Err(ExoError::DeviceUnavailable(format!(
                "accelerator {} reports no memory",
                ordinal
            ))),
            None => Err(ExoError::DeviceUnavailable(format!(
                "accelerator {} not reported by nvidia-smi",
                ordinal
            ))),
        }
    }

    fn memory_usage(&self, ordinal: u32) -> Result<AcceleratorMemory> {
        self.memory_table()?.remove(&ordinal).ok_or_else(|| {
            ExoError::DeviceUnavailable(format!("accelerator {} not reported", ordinal))
        })
    }

    fn release_cache(&self, ordinal: u32) -> Result<()> {
        debug!(ordinal, "nvidia-smi cannot release allocator caches; skipping");
        Ok(())
    }
}

/// Parse `index, name, memory.total` rows (MiB, no units).
pub fn parse_enumeration_csv(output: &str) -> Vec<AcceleratorInfo> {
    output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
            if parts.len() < 3 {
                return None;
            }
            let ordinal = parts[0].parse::<u32>().ok()?;
            let total_mib = parts[2].parse::<u64>().ok()?;
            Some(AcceleratorInfo {
                ordinal,
                name: parts[1].to_string(),
                total_bytes: total_mib * MIB,
            })
        })
        .collect()
}

/// Parse `index, memory.used, memory.reserved, memory.total` rows (MiB, no units).
///
/// Drivers without a `memory.reserved` field print `[N/A]`; reserved then falls back to used.
pub fn parse_memory_csv(output: &str) -> Vec<AcceleratorMemory> {
    output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
            if parts.len() < 4 {
                return None;
            }
            let ordinal = parts[0].parse::<u32>().ok()?;
            let used = parts[1].parse::<u64>().ok()? * MIB;
            let reserved = parts[2]
                .parse::<u64>()
                .map(|r| r * MIB + used)
                .unwrap_or(used);
            let total = parts[3].parse::<u64>().ok()? * MIB;
            Some(AcceleratorMemory {
                device: DeviceId::Accelerator(ordinal),
                allocated_bytes: used,
                reserved_bytes: reserved,
                total_bytes: total,
            })
        })
        .collect()
}

/// Run a command, killing it if it outlives `timeout`. Returns stdout on success.
///
/// Stdout is drained on its own thread while waiting so a chatty child cannot
/// block on a full pipe. Callers in async code reach this through the blocking
/// pool (see `ResourceMonitor::current_async`).
fn run_bounded(program: &str, args: &[&str], timeout: Duration) -> Result<String> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| ExoError::DeviceUnavailable(format!("{}: {}", program, e)))?;

    let reader = child.stdout.take().map(|mut pipe| {
        std::thread::spawn(move || {
            let mut out = String::new();
            pipe.read_to_string(&mut out).map(|_| out)
        })
    });

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait()? {
            Some(status) => break status,
            None if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ExoError::DeviceUnavailable(format!(
                    "{} timed out after {:?}",
                    program, timeout
                )));
            }
            None => std::thread::sleep(Duration::from_millis(20)),
        }
    };

    let stdout = match reader {
        Some(handle) => handle
            .join()
            .map_err(|_| ExoError::DeviceUnavailable(format!("{} output reader panicked", program)))??,
        None => String::new(),
    };
    if !status.success() {
        return Err(ExoError::DeviceUnavailable(format!(
            "{} exited with {}",
            program, status
        )));
    }
    Ok(stdout)
}

// ---------------------------------------------------------------------------
// MockAccelerators - scriptable runtime for tests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct MockDevice {
    name: String,
    total_bytes: u64,
    allocated_bytes: u64,
    fail_init: bool,
    releases: u64,
}

/// In-memory accelerator runtime with scriptable memory readings and failures.
#[derive(Debug, Default)]
pub struct MockAccelerators {
    devices: Mutex<Vec<MockDevice>>,
    fail_enumeration: bool,
    fail_release: bool,
}

impl MockAccelerators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device; ordinals are assigned in insertion order.
    pub fn with_device(self, name: &str, total_bytes: u64) -> Self {
        if let Ok(mut devices) = self.devices.lock() {
            devices.push(MockDevice {
                name: name.to_string(),
                total_bytes,
                allocated_bytes: 0,
                fail_init: false,
                releases: 0,
            });
        }
        self
    }

    /// Add a device that fails initialization.
    pub fn with_broken_device(self, name: &str, total_bytes: u64) -> Self {
        let this = self.with_device(name, total_bytes);
        if let Ok(mut devices) = this.devices.lock() {
            if let Some(last) = devices.last_mut() {
                last.fail_init = true;
            }
        }
        this
    }

    pub fn failing_enumeration(mut self) -> Self {
        self.fail_enumeration = true;
        self
    }

    pub fn failing_release(mut self) -> Self {
        self.fail_release = true;
        self
    }

    pub fn set_allocated(&self, ordinal: u32, bytes: u64) {
        if let Ok(mut devices) = self.devices.lock() {
            if let Some(d) = devices.get_mut(ordinal as usize) {
                d.allocated_bytes = bytes;
            }
        }
    }

    /// Number of `release_cache` calls seen by a device.
    pub fn release_count(&self, ordinal: u32) -> u64 {
        self.devices
            .lock()
            .ok()
            .and_then(|d| d.get(ordinal as usize).map(|d| d.releases))
            .unwrap_or(0)
    }

    fn with_entry<T>(&self, ordinal: u32, f: impl FnOnce(&mut MockDevice) -> Result<T>) -> Result<T> {
        let mut devices = self
            .devices
            .lock()
            .map_err(|e| ExoError::DeviceUnavailable(format!("Lock poisoned: {}", e)))?;
        let device = devices
            .get_mut(ordinal as usize)
            .ok_or_else(|| ExoError::DeviceUnavailable(format!("no mock accelerator {}", ordinal)))?;
        f(device)
    }
}

impl AcceleratorRuntime for MockAccelerators {
    fn name(&self) -> &str {
        "mock"
    }

    fn enumerate(&self) -> Result<Vec<AcceleratorInfo>> {
        if self.fail_enumeration {
            return Err(ExoError::DeviceUnavailable("mock enumeration failure".into()));
        }
        let devices = self
            .devices
            .lock()
            .map_err(|e| ExoError::DeviceUnavailable(format!("Lock poisoned: {}", e)))?;
        Ok(devices
            .iter()
            .enumerate()
            .map(|(i, d)| AcceleratorInfo {
                ordinal: i as u32,
                name: d.name.clone(),
                total_bytes: d.total_bytes,
            })
            .collect())
    }

    fn initialize(&self, ordinal: u32) -> Result<()> {
        self.with_entry(ordinal, |d| {
            if d.fail_init {
                Err(ExoError::DeviceUnavailable(format!("{} failed to initialize", d.name)))
            } else {
                Ok(())
            }
        })
    }

    fn memory_usage(&self, ordinal: u32) -> Result<AcceleratorMemory> {
        self.with_entry(ordinal, |d| {
            Ok(AcceleratorMemory {
                device: DeviceId::Accelerator(ordinal),
                allocated_bytes: d.allocated_bytes,
                reserved_bytes: d.allocated_bytes,
                total_bytes: d.total_bytes,
            })
        })
    }

    fn release_cache(&self, ordinal: u32) -> Result<()> {
        let fail = self.fail_release;
        self.with_entry(ordinal, |d| {
            d.releases += 1;
            if fail {
                Err(ExoError::DeviceUnavailable("mock release failure".into()))
            } else {
                Ok(())
            }
        })
    }
}
