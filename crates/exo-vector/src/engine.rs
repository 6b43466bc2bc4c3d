//! Device-aware batch embedding.
//!
//! `EmbeddingEngine::embed_batch` picks a device, splits the input into
//! sub-batches, and encodes each on the blocking pool. A sub-batch that fails
//! on an accelerator gets exactly one retry on the host CPU; if that fails too,
//! its items come back as zero vectors with matching failure entries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use exo_core::config::EmbeddingConfig;
use exo_core::error::{ExoError, Result};
use exo_core::types::{DeviceId, DeviceProfile, PressureThresholds, ResourceSnapshot};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::device::DeviceProfiler;
use crate::embedding::{EmbeddingModel, EncodeError};
use crate::monitor::ResourceMonitor;

/// One input item that could not be encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedFailure {
    /// Position in the `texts` passed to `embed_batch`.
    pub index: usize,
    /// Last device tried.
    pub device: DeviceId,
    pub error: String,
}

/// Per-call statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedStats {
    /// Device selected for the call.
    pub device: DeviceId,
    pub elapsed: Duration,
    pub items: usize,
    pub sub_batches: usize,
    /// Sub-batches retried on the host CPU.
    pub fallbacks: usize,
    pub failed_items: usize,
}

/// Output of `embed_batch`. `vectors.len()` always equals the input length.
#[derive(Debug, Clone)]
pub struct BatchEmbedding {
    /// One vector per input; failed items hold a zero vector.
    pub vectors: Vec<Vec<f32>>,
    /// Device that produced (or last attempted) each item.
    pub devices: Vec<DeviceId>,
    pub failures: Vec<EmbedFailure>,
    pub stats: EmbedStats,
}

impl BatchEmbedding {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failure_for(&self, index: usize) -> Option<&EmbedFailure> {
        self.failures.iter().find(|f| f.index == index)
    }
}

/// Cumulative counters across all calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub calls: u64,
    pub items: u64,
    pub fallbacks: u64,
    pub failed_items: u64,
}

#[derive(Debug, Default)]
struct Counters {
    calls: AtomicU64,
    items: AtomicU64,
    fallbacks: AtomicU64,
    failed_items: AtomicU64,
}

/// Embeds text on the best available device.
pub struct EmbeddingEngine {
    model: Arc<dyn EmbeddingModel>,
    profiler: Arc<DeviceProfiler>,
    monitor: Arc<ResourceMonitor>,
    thresholds: PressureThresholds,
    batch_size: usize,
    device_locks: Mutex<HashMap<DeviceId, Arc<tokio::sync::Mutex<()>>>>,
    counters: Counters,
}

impl std::fmt::Debug for EmbeddingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingEngine")
            .field("model", &self.model.name())
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl EmbeddingEngine {
    pub fn new(
        model: Arc<dyn EmbeddingModel>,
        profiler: Arc<DeviceProfiler>,
        monitor: Arc<ResourceMonitor>,
        thresholds: PressureThresholds,
        config: &EmbeddingConfig,
    ) -> Self {
        Self {
            model,
            profiler,
            monitor,
            thresholds,
            batch_size: config.batch_size.max(1),
            device_locks: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.model.dimensions()
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub fn profiler(&self) -> &Arc<DeviceProfiler> {
        &self.profiler
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            calls: self.counters.calls.load(Ordering::Relaxed),
            items: self.counters.items.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
            failed_items: self.counters.failed_items.load(Ordering::Relaxed),
        }
    }

    /// Pick the device for a call.
    ///
    /// The preference wins when it is usable and under its pressure threshold.
    pub async fn select_device(&self, preferred: Option<DeviceId>) -> Result<DeviceProfile> {
        if self.profiler.usable_devices().is_empty() {
            return Err(ExoError::DeviceUnavailable(
                "no usable device for encoding".into(),
            ));
        }
        let snapshot = self.monitor.current_async().await;
        self.choose_device(preferred, &snapshot)
    }

    /// Device choice against a given snapshot.
    pub fn choose_device(
        &self,
        preferred: Option<DeviceId>,
        snapshot: &ResourceSnapshot,
    ) -> Result<DeviceProfile> {
        let usable = self.profiler.usable_devices();
        if let Some(id) = preferred {
            if let Some(device) = usable.iter().find(|d| d.id == id) {
                if !self.thresholds.exceeded_by(id, snapshot) {
                    return Ok(device.clone());
                }
                debug!(device = %id, "Preferred device under pressure; ranking alternatives");
            }
        }

        rank_devices(usable, snapshot, &self.thresholds)
            .into_iter()
            .next()
            .ok_or_else(|| ExoError::DeviceUnavailable("no usable device for encoding".into()))
    }

    /// Encode `texts`, returning one vector per input in input order.
    ///
    /// Only a missing usable device is an error; encode failures are reported
    /// in `failures`.
    pub async fn embed_batch(
        &self,
        texts: &[String],
        preferred: Option<DeviceId>,
    ) -> Result<BatchEmbedding> {
        let started = Instant::now();
        let device = self.select_device(preferred).await?;
        let dims = self.model.dimensions();

        let mut vectors = Vec::with_capacity(texts.len());
        let mut devices = Vec::with_capacity(texts.len());
        let mut failures = Vec::new();
        let mut fallbacks = 0;
        let mut sub_batches = 0;

        for (batch_idx, batch) in texts.chunks(self.batch_size).enumerate() {
            sub_batches += 1;
            let offset = batch_idx * self.batch_size;
            let (outcome, used) = match self.encode_on(&device, batch).await {
                Ok(v) => (Ok(v), device.id),
                Err(e) if !device.is_host() => {
                    warn!(
                        device = %device.id,
                        error = %e,
                        items = batch.len(),
                        "Encode failed; falling back to host CPU"
                    );
                    match self.profiler.usable_host() {
                        Some(host) => {
                            fallbacks += 1;
                            (self.encode_on(&host, batch).await, host.id)
                        }
                        None => (Err(e), device.id),
                    }
                }
                Err(e) => (Err(e), device.id),
            };

            match outcome {
                Ok(batch_vectors) => {
                    vectors.extend(batch_vectors);
                    devices.extend(std::iter::repeat(used).take(batch.len()));
                }
                Err(e) => {
                    warn!(device = %used, error = %e, items = batch.len(), "Sub-batch failed");
                    for i in 0..batch.len() {
                        vectors.push(vec![0.0; dims]);
                        devices.push(used);
                        failures.push(EmbedFailure {
                            index: offset + i,
                            device: used,
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        let stats = EmbedStats {
            device: device.id,
            elapsed: started.elapsed(),
            items: texts.len(),
            sub_batches,
            fallbacks,
            failed_items: failures.len(),
        };
        self.counters.calls.fetch_add(1, Ordering::Relaxed);
        self.counters
            .items
            .fetch_add(texts.len() as u64, Ordering::Relaxed);
        self.counters
            .fallbacks
            .fetch_add(fallbacks as u64, Ordering::Relaxed);
        self.counters
            .failed_items
            .fetch_add(failures.len() as u64, Ordering::Relaxed);
        debug!(
            device = %stats.device,
            items = stats.items,
            fallbacks = stats.fallbacks,
            failed = stats.failed_items,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "Batch embedded"
        );

        Ok(BatchEmbedding {
            vectors,
            devices,
            failures,
            stats,
        })
    }

    /// Encode one string. A failed encode becomes `ExoError::Encode`.
    pub async fn embed_one(&self, text: &str, preferred: Option<DeviceId>) -> Result<Vec<f32>> {
        let mut out = self.embed_batch(&[text.to_string()], preferred).await?;
        if let Some(failure) = out.failures.pop() {
            return Err(ExoError::Encode(failure.error));
        }
        out.vectors
            .pop()
            .ok_or_else(|| ExoError::Encode("model returned no vector".into()))
    }

    fn lock_for(&self, device: DeviceId) -> Option<Arc<tokio::sync::Mutex<()>>> {
        if device.is_host() {
            return None;
        }
        // The map only ever gains entries, so a poisoned guard is still consistent.
        let mut locks = self.device_locks.lock().unwrap_or_else(|e| {
            warn!(device = %device, "Device lock table poisoned; recovering");
            e.into_inner()
        });
        Some(Arc::clone(locks.entry(device).or_default()))
    }

    async fn encode_on(
        &self,
        device: &DeviceProfile,
        batch: &[String],
    ) -> std::result::Result<Vec<Vec<f32>>, EncodeError> {
        // Held across the blocking call: one encode per accelerator at a time.
        let lock = self.lock_for(device.id);
        let _guard = match &lock {
            Some(l) => Some(l.lock().await),
            None => None,
        };

        let model = Arc::clone(&self.model);
        let owned: Vec<String> = batch.to_vec();
        let profile = device.clone();
        let output = tokio::task::spawn_blocking(move || model.encode(&owned, &profile))
            .await
            .map_err(|e| EncodeError::Panicked(e.to_string()))??;

        validate_shape(&output, batch.len(), self.model.dimensions())?;
        Ok(output)
    }
}

fn validate_shape(
    output: &[Vec<f32>],
    expected_items: usize,
    dims: usize,
) -> std::result::Result<(), EncodeError> {
    if output.len() != expected_items {
        return Err(EncodeError::Malformed(format!(
            "expected {} vectors, got {}",
            expected_items,
            output.len()
        )));
    }
    if let Some(bad) = output.iter().find(|v| v.len() != dims) {
        return Err(EncodeError::Malformed(format!(
            "expected dimension {}, got {}",
            dims,
            bad.len()
        )));
    }
    Ok(())
}

/// Order devices best first: under threshold, then higher tier, then lower pressure.
pub fn rank_devices(
    mut devices: Vec<DeviceProfile>,
    snapshot: &ResourceSnapshot,
    thresholds: &PressureThresholds,
) -> Vec<DeviceProfile> {
    devices.sort_by(|a, b| {
        let a_over = thresholds.exceeded_by(a.id, snapshot);
        let b_over = thresholds.exceeded_by(b.id, snapshot);
        a_over
            .cmp(&b_over)
            .then(b.compute_tier.cmp(&a.compute_tier))
            .then(
                snapshot
                    .pressure_of(a.id)
                    .total_cmp(&snapshot.pressure_of(b.id)),
            )
            .then(a.id.cmp(&b.id))
    });
    devices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{AcceleratorInfo, AcceleratorRuntime, MockAccelerators, NoAccelerators};
    use crate::embedding::HashEmbedding;
    use crate::monitor::{FixedMemory, HostMemorySource};
    use chrono::Utc;
    use exo_core::config::{DevicesConfig, GIB};
    use exo_core::types::{AcceleratorMemory, HostMemory};
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    /// Mock runtime whose memory reads take a while, like a real subprocess.
    struct SlowMemoryRuntime {
        inner: MockAccelerators,
        delay: Duration,
    }

    impl AcceleratorRuntime for SlowMemoryRuntime {
        fn name(&self) -> &str {
            "slow"
        }

        fn enumerate(&self) -> Result<Vec<AcceleratorInfo>> {
            self.inner.enumerate()
        }

        fn initialize(&self, ordinal: u32) -> Result<()> {
            self.inner.initialize(ordinal)
        }

        fn memory_usage(&self, ordinal: u32) -> Result<AcceleratorMemory> {
            std::thread::sleep(self.delay);
            self.inner.memory_usage(ordinal)
        }

        fn release_cache(&self, ordinal: u32) -> Result<()> {
            self.inner.release_cache(ordinal)
        }
    }

    /// Fails every call on accelerators; delegates to a hash model on the host.
    struct AcceleratorHostile {
        inner: HashEmbedding,
        accelerator_calls: AtomicUsize,
        host_calls: AtomicUsize,
        fail_host: bool,
    }

    impl AcceleratorHostile {
        fn new(fail_host: bool) -> Self {
            Self {
                inner: HashEmbedding::new(16),
                accelerator_calls: AtomicUsize::new(0),
                host_calls: AtomicUsize::new(0),
                fail_host,
            }
        }
    }

    impl EmbeddingModel for AcceleratorHostile {
        fn encode(
            &self,
            batch: &[String],
            device: &DeviceProfile,
        ) -> std::result::Result<Vec<Vec<f32>>, EncodeError> {
            if device.is_host() {
                self.host_calls.fetch_add(1, Ordering::SeqCst);
                if self.fail_host {
                    return Err(EncodeError::Device("host exploded".into()));
                }
                self.inner.encode(batch, device)
            } else {
                self.accelerator_calls.fetch_add(1, Ordering::SeqCst);
                Err(EncodeError::OutOfMemory {
                    device: device.id.to_string(),
                    detail: "simulated".into(),
                })
            }
        }

        fn dimensions(&self) -> usize {
            16
        }

        fn name(&self) -> &str {
            "hostile"
        }
    }

    struct ShortOutput;

    impl EmbeddingModel for ShortOutput {
        fn encode(
            &self,
            batch: &[String],
            _device: &DeviceProfile,
        ) -> std::result::Result<Vec<Vec<f32>>, EncodeError> {
            Ok(batch.iter().skip(1).map(|_| vec![1.0; 4]).collect())
        }

        fn dimensions(&self) -> usize {
            4
        }

        fn name(&self) -> &str {
            "short"
        }
    }

    fn engine_with(
        model: Arc<dyn EmbeddingModel>,
        runtime: Arc<dyn AcceleratorRuntime>,
        devices: DevicesConfig,
        batch_size: usize,
    ) -> EmbeddingEngine {
        let host: Arc<dyn HostMemorySource> = Arc::new(FixedMemory::new(100, 10));
        let profiler = Arc::new(DeviceProfiler::new(runtime, host, devices).unwrap());
        let monitor = Arc::new(ResourceMonitor::new(Arc::clone(&profiler)));
        let config = EmbeddingConfig {
            batch_size,
            ..EmbeddingConfig::default()
        };
        EmbeddingEngine::new(
            model,
            profiler,
            monitor,
            PressureThresholds::default(),
            &config,
        )
    }

    fn texts(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("item {}", i)).collect()
    }

    fn profile(id: DeviceId, tier: u32) -> DeviceProfile {
        DeviceProfile {
            id,
            name: id.to_string(),
            total_bytes: 100,
            compute_tier: tier,
            usable: true,
        }
    }

    #[tokio::test]
    async fn test_embed_batch_on_host() {
        let engine = engine_with(
            Arc::new(HashEmbedding::new(32)),
            Arc::new(NoAccelerators),
            DevicesConfig::default(),
            4,
        );
        let out = engine.embed_batch(&texts(10), None).await.unwrap();
        assert_eq!(out.vectors.len(), 10);
        assert!(out.is_complete());
        assert_eq!(out.stats.sub_batches, 3);
        assert_eq!(out.stats.device, DeviceId::Cpu);
        assert!(out.devices.iter().all(|d| *d == DeviceId::Cpu));
        assert_eq!(out.vectors[3], HashEmbedding::new(32).hash_to_vector("item 3"));
    }

    #[tokio::test]
    async fn test_empty_input() {
        let engine = engine_with(
            Arc::new(HashEmbedding::new(8)),
            Arc::new(NoAccelerators),
            DevicesConfig::default(),
            4,
        );
        let out = engine.embed_batch(&[], None).await.unwrap();
        assert!(out.vectors.is_empty());
        assert_eq!(out.stats.sub_batches, 0);
    }

    #[tokio::test]
    async fn test_accelerator_failure_falls_back_once_per_sub_batch() {
        let model = Arc::new(AcceleratorHostile::new(false));
        let runtime = Arc::new(MockAccelerators::new().with_device("A", 16 * GIB));
        let engine = engine_with(
            Arc::clone(&model) as Arc<dyn EmbeddingModel>,
            runtime,
            DevicesConfig::default(),
            4,
        );

        let out = engine.embed_batch(&texts(10), None).await.unwrap();
        assert_eq!(out.vectors.len(), 10);
        assert!(out.is_complete());
        assert_eq!(out.stats.device, DeviceId::Accelerator(0));
        assert_eq!(out.stats.fallbacks, 3);
        assert!(out.devices.iter().all(|d| *d == DeviceId::Cpu));
        assert_eq!(model.accelerator_calls.load(Ordering::SeqCst), 3);
        assert_eq!(model.host_calls.load(Ordering::SeqCst), 3);
        assert_eq!(engine.stats().fallbacks, 3);
    }

    #[tokio::test]
    async fn test_double_failure_yields_zero_vectors_and_failures() {
        let model = Arc::new(AcceleratorHostile::new(true));
        let runtime = Arc::new(MockAccelerators::new().with_device("A", 16 * GIB));
        let engine = engine_with(
            Arc::clone(&model) as Arc<dyn EmbeddingModel>,
            runtime,
            DevicesConfig::default(),
            32,
        );

        let out = engine.embed_batch(&texts(5), None).await.unwrap();
        assert_eq!(out.vectors.len(), 5);
        assert_eq!(out.failures.len(), 5);
        assert!(out.vectors.iter().all(|v| v.len() == 16 && v.iter().all(|x| *x == 0.0)));
        assert_eq!(out.failure_for(2).unwrap().device, DeviceId::Cpu);
        // Exactly one hop: one accelerator call, one host call.
        assert_eq!(model.accelerator_calls.load(Ordering::SeqCst), 1);
        assert_eq!(model.host_calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.stats().failed_items, 5);
    }

    #[tokio::test]
    async fn test_no_fallback_when_host_disabled() {
        let model = Arc::new(AcceleratorHostile::new(false));
        let runtime = Arc::new(MockAccelerators::new().with_device("A", 16 * GIB));
        let engine = engine_with(
            Arc::clone(&model) as Arc<dyn EmbeddingModel>,
            runtime,
            DevicesConfig {
                enable_accelerators: true,
                host_enabled: false,
                ..DevicesConfig::default()
            },
            8,
        );

        let out = engine.embed_batch(&texts(3), None).await.unwrap();
        assert_eq!(out.failures.len(), 3);
        assert_eq!(out.stats.fallbacks, 0);
        assert_eq!(model.host_calls.load(Ordering::SeqCst), 0);
        assert!(out.devices.iter().all(|d| *d == DeviceId::Accelerator(0)));
    }

    #[tokio::test]
    async fn test_malformed_output_is_failure() {
        let engine = engine_with(
            Arc::new(ShortOutput),
            Arc::new(NoAccelerators),
            DevicesConfig::default(),
            8,
        );
        let out = engine.embed_batch(&texts(3), None).await.unwrap();
        assert_eq!(out.vectors.len(), 3);
        assert_eq!(out.failures.len(), 3);
        assert!(out.failures[0].error.contains("expected 3 vectors"));
    }

    #[tokio::test]
    async fn test_embed_one_surfaces_encode_error() {
        let engine = engine_with(
            Arc::new(AcceleratorHostile::new(true)),
            Arc::new(NoAccelerators),
            DevicesConfig::default(),
            8,
        );
        let err = engine.embed_one("query", None).await.unwrap_err();
        assert!(matches!(err, ExoError::Encode(_)));
    }

    #[tokio::test]
    async fn test_preference_honored_when_under_threshold() {
        let runtime = Arc::new(
            MockAccelerators::new()
                .with_device("Big", 40 * GIB)
                .with_device("Small", 8 * GIB),
        );
        let engine = engine_with(
            Arc::new(HashEmbedding::new(8)),
            Arc::clone(&runtime) as Arc<dyn AcceleratorRuntime>,
            DevicesConfig::default(),
            8,
        );

        let best = engine.select_device(None).await.unwrap();
        assert_eq!(best.id, DeviceId::Accelerator(0));
        let preferred = engine.select_device(Some(DeviceId::Accelerator(1))).await.unwrap();
        assert_eq!(preferred.id, DeviceId::Accelerator(1));
        let cpu = engine.select_device(Some(DeviceId::Cpu)).await.unwrap();
        assert_eq!(cpu.id, DeviceId::Cpu);
    }

    #[tokio::test]
    async fn test_preference_under_pressure_is_ignored() {
        let runtime = Arc::new(
            MockAccelerators::new()
                .with_device("Big", 40 * GIB)
                .with_device("Small", 8 * GIB),
        );
        runtime.set_allocated(1, 8 * GIB);
        let engine = engine_with(
            Arc::new(HashEmbedding::new(8)),
            Arc::clone(&runtime) as Arc<dyn AcceleratorRuntime>,
            DevicesConfig::default(),
            8,
        );
        let chosen = engine.select_device(Some(DeviceId::Accelerator(1))).await.unwrap();
        assert_eq!(chosen.id, DeviceId::Accelerator(0));
    }

    #[tokio::test]
    async fn test_slow_memory_reads_leave_executor_free() {
        let runtime = Arc::new(SlowMemoryRuntime {
            inner: MockAccelerators::new().with_device("Slow", 8 * GIB),
            delay: Duration::from_millis(300),
        });
        let engine = engine_with(
            Arc::new(HashEmbedding::new(8)),
            runtime as Arc<dyn AcceleratorRuntime>,
            DevicesConfig::default(),
            8,
        );

        let done = Arc::new(AtomicBool::new(false));
        let ticker = {
            let done = Arc::clone(&done);
            tokio::spawn(async move {
                let mut last = Instant::now();
                let mut worst = Duration::ZERO;
                while !done.load(Ordering::Relaxed) {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    worst = worst.max(last.elapsed());
                    last = Instant::now();
                }
                worst
            })
        };

        let out = engine.embed_batch(&texts(4), None).await.unwrap();
        done.store(true, Ordering::Relaxed);
        let worst = ticker.await.unwrap();

        assert_eq!(out.vectors.len(), 4);
        assert!(worst < Duration::from_millis(150), "executor stalled for {:?}", worst);
    }

    #[tokio::test]
    async fn test_poisoned_lock_table_still_serializes() {
        let engine = Arc::new(engine_with(
            Arc::new(HashEmbedding::new(8)),
            Arc::new(MockAccelerators::new().with_device("A", 8 * GIB)) as Arc<dyn AcceleratorRuntime>,
            DevicesConfig::default(),
            8,
        ));
        let before = engine.lock_for(DeviceId::Accelerator(0)).unwrap();

        let poisoner = Arc::clone(&engine);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.device_locks.lock().unwrap();
            panic!("poison the lock table");
        })
        .join();
        assert!(engine.device_locks.is_poisoned());

        let after = engine.lock_for(DeviceId::Accelerator(0)).unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert!(engine.lock_for(DeviceId::Cpu).is_none());
    }

    #[test]
    fn test_rank_devices_orders_by_pressure_then_tier() {
        let snapshot = ResourceSnapshot {
            taken_at: Utc::now(),
            host: HostMemory {
                used_bytes: 10,
                available_bytes: 90,
                total_bytes: 100,
            },
            accelerators: vec![
                AcceleratorMemory {
                    device: DeviceId::Accelerator(0),
                    allocated_bytes: 95,
                    reserved_bytes: 95,
                    total_bytes: 100,
                },
                AcceleratorMemory {
                    device: DeviceId::Accelerator(1),
                    allocated_bytes: 50,
                    reserved_bytes: 50,
                    total_bytes: 100,
                },
                AcceleratorMemory {
                    device: DeviceId::Accelerator(2),
                    allocated_bytes: 20,
                    reserved_bytes: 20,
                    total_bytes: 100,
                },
            ],
        };
        let ranked = rank_devices(
            vec![
                profile(DeviceId::Cpu, 1),
                profile(DeviceId::Accelerator(0), 50),
                profile(DeviceId::Accelerator(1), 20),
                profile(DeviceId::Accelerator(2), 20),
            ],
            &snapshot,
            &PressureThresholds::default(),
        );
        let order: Vec<DeviceId> = ranked.iter().map(|d| d.id).collect();
        assert_eq!(
            order,
            vec![
                DeviceId::Accelerator(2),
                DeviceId::Accelerator(1),
                DeviceId::Cpu,
                DeviceId::Accelerator(0),
            ]
        );
    }

    #[tokio::test]
    async fn test_concurrent_calls_on_one_accelerator() {
        let runtime = Arc::new(MockAccelerators::new().with_device("A", 16 * GIB));
        let engine = Arc::new(engine_with(
            Arc::new(HashEmbedding::new(8)),
            runtime,
            DevicesConfig::default(),
            2,
        ));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    engine
                        .embed_batch(&[format!("t{}", i), format!("u{}", i)], None)
                        .await
                        .unwrap()
                })
            })
            .collect();
        for h in handles {
            let out = h.await.unwrap();
            assert!(out.is_complete());
            assert_eq!(out.devices, vec![DeviceId::Accelerator(0); 2]);
        }
        assert_eq!(engine.stats().calls, 8);
    }
}
