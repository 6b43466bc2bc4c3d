use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ExoError;

// =============================================================================
// Devices
// =============================================================================

/// Identifier of a compute backend.
///
/// Serialized as `"cpu"` or `"accelerator:<ordinal>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum DeviceId {
    Cpu,
    Accelerator(u32),
}

impl DeviceId {
    pub fn is_host(&self) -> bool {
        matches!(self, DeviceId::Cpu)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Cpu => write!(f, "cpu"),
            DeviceId::Accelerator(n) => write!(f, "accelerator:{}", n),
        }
    }
}

impl FromStr for DeviceId {
    type Err = ExoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "cpu" {
            return Ok(DeviceId::Cpu);
        }
        if let Some(ordinal) = s.strip_prefix("accelerator:") {
            return ordinal
                .parse::<u32>()
                .map(DeviceId::Accelerator)
                .map_err(|e| ExoError::InvalidInput(format!("bad device ordinal '{}': {}", ordinal, e)));
        }
        Err(ExoError::InvalidInput(format!("unknown device '{}'", s)))
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for DeviceId {
    type Error = ExoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Capacity and usability of one compute backend, as seen at profiling time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub id: DeviceId,
    /// Human-readable name (CPU brand or accelerator model).
    pub name: String,
    /// Total memory capacity in bytes.
    pub total_bytes: u64,
    /// Relative throughput score; higher is faster.
    pub compute_tier: u32,
    /// False when the device was found but could not be initialized (or was disabled).
    pub usable: bool,
}

impl DeviceProfile {
    pub fn is_host(&self) -> bool {
        self.id.is_host()
    }
}

// =============================================================================
// Resource readings
// =============================================================================

/// Host memory reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HostMemory {
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub total_bytes: u64,
}

impl HostMemory {
    /// Fraction of host memory in use, in `[0, 1]`.
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.used_bytes as f64 / self.total_bytes as f64).clamp(0.0, 1.0)
    }
}

/// Memory reading for one accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AcceleratorMemory {
    pub device: DeviceId,
    /// Bytes actively allocated by kernels and tensors.
    pub allocated_bytes: u64,
    /// Bytes held by the runtime's caching allocator (allocated + cached).
    pub reserved_bytes: u64,
    pub total_bytes: u64,
}

impl AcceleratorMemory {
    /// Fraction of accelerator memory allocated, in `[0, 1]`.
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.allocated_bytes as f64 / self.total_bytes as f64).clamp(0.0, 1.0)
    }

    pub fn available_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.allocated_bytes)
    }
}

/// Point-in-time reading of host and accelerator memory. Never mutated, only superseded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub taken_at: DateTime<Utc>,
    pub host: HostMemory,
    pub accelerators: Vec<AcceleratorMemory>,
}

impl ResourceSnapshot {
    pub fn host_percent(&self) -> f64 {
        self.host.percent()
    }

    pub fn accelerator(&self, device: DeviceId) -> Option<&AcceleratorMemory> {
        self.accelerators.iter().find(|a| a.device == device)
    }

    /// Pressure on a given device: host percent for the CPU, allocation percent for an
    /// accelerator, 0.0 for an accelerator with no reading.
    pub fn pressure_of(&self, device: DeviceId) -> f64 {
        match device {
            DeviceId::Cpu => self.host_percent(),
            other => self.accelerator(other).map(|a| a.percent()).unwrap_or(0.0),
        }
    }
}

/// Memory fractions above which cleanup is requested.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PressureThresholds {
    pub host: f64,
    pub accelerator: f64,
}

impl Default for PressureThresholds {
    fn default() -> Self {
        Self {
            host: 0.80,
            accelerator: 0.85,
        }
    }
}

impl PressureThresholds {
    pub fn limit_for(&self, device: DeviceId) -> f64 {
        if device.is_host() {
            self.host
        } else {
            self.accelerator
        }
    }

    /// True when `device` is above its threshold in `snapshot`.
    pub fn exceeded_by(&self, device: DeviceId, snapshot: &ResourceSnapshot) -> bool {
        snapshot.pressure_of(device) > self.limit_for(device)
    }

    /// True when the host or any accelerator is above its threshold.
    pub fn exceeded(&self, snapshot: &ResourceSnapshot) -> bool {
        snapshot.host_percent() > self.host
            || snapshot
                .accelerators
                .iter()
                .any(|a| a.percent() > self.accelerator)
    }
}

// =============================================================================
// Chunks
// =============================================================================

/// Classification of a chunk's source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentTag {
    Code,
    Doc,
    Config,
    Other,
}

const CODE_EXTENSIONS: &[&str] = &[
    "py", "js", "ts", "jsx", "tsx", "html", "css", "scss", "less", "java", "cpp", "c", "h",
    "hpp", "cs", "php", "rb", "go", "rs", "swift", "kt", "scala", "ps1", "sh", "bash", "zsh",
    "fish",
];
const DOC_EXTENSIONS: &[&str] = &["md", "txt", "rst", "tex", "adoc", "wiki"];
const CONFIG_EXTENSIONS: &[&str] = &[
    "json", "yaml", "yml", "xml", "ini", "cfg", "conf", "toml",
];

impl ContentTag {
    /// Classify by file extension, with or without the leading dot.
    pub fn from_extension(ext: &str) -> Self {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        if CODE_EXTENSIONS.contains(&ext.as_str()) {
            ContentTag::Code
        } else if DOC_EXTENSIONS.contains(&ext.as_str()) {
            ContentTag::Doc
        } else if CONFIG_EXTENSIONS.contains(&ext.as_str()) {
            ContentTag::Config
        } else {
            ContentTag::Other
        }
    }
}

impl fmt::Display for ContentTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContentTag::Code => "code",
            ContentTag::Doc => "doc",
            ContentTag::Config => "config",
            ContentTag::Other => "other",
        };
        write!(f, "{}", s)
    }
}

/// An overlap-aware slice of cleaned source text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub source_id: String,
    /// Position of this chunk within its source, starting at 0.
    pub sequence_index: usize,
    pub text: String,
    /// UTF-8 length of `text`.
    pub byte_len: usize,
    pub tag: ContentTag,
    /// Char offset of the chunk's first character in the cleaned source.
    pub char_start: usize,
    /// Char offset one past the chunk's last character in the cleaned source.
    pub char_end: usize,
}

impl Chunk {
    pub fn metadata(&self) -> ChunkMetadata {
        ChunkMetadata {
            source_id: self.source_id.clone(),
            sequence_index: self.sequence_index,
            text: self.text.clone(),
            tag: self.tag,
        }
    }
}

/// Chunk metadata kept in the index sidecar, one record per vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub source_id: String,
    pub sequence_index: usize,
    pub text: String,
    pub tag: ContentTag,
}

// =============================================================================
// Tasks
// =============================================================================

/// Lifecycle state of a processing task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Assigned,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Queued => "queued",
            TaskState::Assigned => "assigned",
            TaskState::Processing => "processing",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// One chunk to embed. Owned by the scheduler until a worker dequeues it.
#[derive(Debug, Clone)]
pub struct ProcessingTask {
    pub id: Uuid,
    pub source_id: String,
    /// Position of the source in the batch input, used to restore ordering.
    pub source_ordinal: usize,
    pub chunk: Chunk,
    /// Higher runs first within a batch.
    pub priority: u8,
    pub device_preference: Option<DeviceId>,
    pub state: TaskState,
}

impl ProcessingTask {
    pub fn new(source_ordinal: usize, chunk: Chunk) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_id: chunk.source_id.clone(),
            source_ordinal,
            chunk,
            priority: 1,
            device_preference: None,
            state: TaskState::Queued,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_device_preference(mut self, device: DeviceId) -> Self {
        self.device_preference = Some(device);
        self
    }
}

/// Outcome of one processing task. Produced exactly once per task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub task_id: Uuid,
    pub source_id: String,
    pub source_ordinal: usize,
    pub sequence_index: usize,
    pub chunk: Chunk,
    /// Empty unless `success`.
    pub vector: Vec<f32>,
    pub device_used: DeviceId,
    pub duration: Duration,
    /// Change in host memory use across the task, in bytes.
    pub memory_delta_bytes: i64,
    pub success: bool,
    pub error: Option<String>,
    /// Terminal state: completed, failed or cancelled.
    pub state: TaskState,
}

/// A file the batch never turned into tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedFile {
    pub path: String,
    pub reason: String,
}

/// Aggregated outcome of a drained batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    /// Sorted by source ordinal, then chunk sequence index.
    pub results: Vec<ProcessingResult>,
    pub total_time: Duration,
    pub success_count: usize,
    pub failure_count: usize,
    pub cancelled_count: usize,
    pub pressure_releases: u64,
    pub skipped_files: Vec<SkippedFile>,
}

impl BatchReport {
    pub fn from_results(
        mut results: Vec<ProcessingResult>,
        total_time: Duration,
        pressure_releases: u64,
    ) -> Self {
        results.sort_by_key(|r| (r.source_ordinal, r.sequence_index));
        let success_count = results.iter().filter(|r| r.success).count();
        let cancelled_count = results
            .iter()
            .filter(|r| r.state == TaskState::Cancelled)
            .count();
        let failure_count = results.len() - success_count - cancelled_count;
        Self {
            results,
            total_time,
            success_count,
            failure_count,
            cancelled_count,
            pressure_releases,
            skipped_files: Vec::new(),
        }
    }

    pub fn with_skipped(mut self, skipped: Vec<SkippedFile>) -> Self {
        self.skipped_files = skipped;
        self
    }

    pub fn failures(&self) -> impl Iterator<Item = &ProcessingResult> {
        self.results.iter().filter(|r| r.state == TaskState::Failed)
    }

    /// Number of processed tasks per device, keyed by device name.
    pub fn device_usage(&self) -> BTreeMap<String, usize> {
        let mut usage = BTreeMap::new();
        for r in self.results.iter().filter(|r| r.state != TaskState::Cancelled) {
            *usage.entry(r.device_used.to_string()).or_insert(0) += 1;
        }
        usage
    }

    /// Mean duration of successful tasks.
    pub fn average_processing_time(&self) -> Option<Duration> {
        let successful: Vec<Duration> = self
            .results
            .iter()
            .filter(|r| r.success)
            .map(|r| r.duration)
            .collect();
        if successful.is_empty() {
            return None;
        }
        Some(successful.iter().sum::<Duration>() / successful.len() as u32)
    }

    pub fn total_memory_delta(&self) -> i64 {
        self.results.iter().map(|r| r.memory_delta_bytes).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(source: &str, seq: usize) -> Chunk {
        Chunk {
            source_id: source.to_string(),
            sequence_index: seq,
            text: format!("chunk {}", seq),
            byte_len: 7,
            tag: ContentTag::Doc,
            char_start: 0,
            char_end: 7,
        }
    }

    fn result(ordinal: usize, seq: usize, state: TaskState, device: DeviceId) -> ProcessingResult {
        let c = chunk("a.md", seq);
        ProcessingResult {
            task_id: Uuid::new_v4(),
            source_id: c.source_id.clone(),
            source_ordinal: ordinal,
            sequence_index: seq,
            chunk: c,
            vector: if state == TaskState::Completed { vec![1.0] } else { vec![] },
            device_used: device,
            duration: Duration::from_millis(10),
            memory_delta_bytes: 100,
            success: state == TaskState::Completed,
            error: None,
            state,
        }
    }

    #[test]
    fn test_device_id_display_and_parse() {
        assert_eq!(DeviceId::Cpu.to_string(), "cpu");
        assert_eq!(DeviceId::Accelerator(2).to_string(), "accelerator:2");
        assert_eq!("cpu".parse::<DeviceId>().unwrap(), DeviceId::Cpu);
        assert_eq!(
            "accelerator:3".parse::<DeviceId>().unwrap(),
            DeviceId::Accelerator(3)
        );
        assert!("tpu:0".parse::<DeviceId>().is_err());
        assert!("accelerator:x".parse::<DeviceId>().is_err());
    }

    #[test]
    fn test_device_id_serde_as_string() {
        let json = serde_json::to_string(&DeviceId::Accelerator(1)).unwrap();
        assert_eq!(json, "\"accelerator:1\"");
        let back: DeviceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, DeviceId::Accelerator(1));
    }

    #[test]
    fn test_host_memory_percent() {
        let mem = HostMemory {
            used_bytes: 8,
            available_bytes: 2,
            total_bytes: 10,
        };
        assert!((mem.percent() - 0.8).abs() < 1e-9);
        assert_eq!(HostMemory::default().percent(), 0.0);
    }

    #[test]
    fn test_thresholds_exceeded() {
        let thresholds = PressureThresholds::default();
        let snapshot = ResourceSnapshot {
            taken_at: Utc::now(),
            host: HostMemory {
                used_bytes: 50,
                available_bytes: 50,
                total_bytes: 100,
            },
            accelerators: vec![AcceleratorMemory {
                device: DeviceId::Accelerator(0),
                allocated_bytes: 90,
                reserved_bytes: 95,
                total_bytes: 100,
            }],
        };
        assert!(thresholds.exceeded(&snapshot));
        assert!(thresholds.exceeded_by(DeviceId::Accelerator(0), &snapshot));
        assert!(!thresholds.exceeded_by(DeviceId::Cpu, &snapshot));
        assert_eq!(snapshot.pressure_of(DeviceId::Accelerator(7)), 0.0);
    }

    #[test]
    fn test_content_tag_from_extension() {
        assert_eq!(ContentTag::from_extension(".rs"), ContentTag::Code);
        assert_eq!(ContentTag::from_extension("MD"), ContentTag::Doc);
        assert_eq!(ContentTag::from_extension("toml"), ContentTag::Config);
        assert_eq!(ContentTag::from_extension("bin"), ContentTag::Other);
        assert_eq!(ContentTag::from_extension(""), ContentTag::Other);
    }

    #[test]
    fn test_task_state_terminal() {
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::Processing.is_terminal());
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
    }

    #[test]
    fn test_processing_task_builder() {
        let task = ProcessingTask::new(3, chunk("notes.md", 0))
            .with_priority(5)
            .with_device_preference(DeviceId::Accelerator(0));
        assert_eq!(task.source_id, "notes.md");
        assert_eq!(task.source_ordinal, 3);
        assert_eq!(task.priority, 5);
        assert_eq!(task.state, TaskState::Queued);
        assert_eq!(task.device_preference, Some(DeviceId::Accelerator(0)));
    }

    #[test]
    fn test_batch_report_counts_and_order() {
        let results = vec![
            result(1, 0, TaskState::Completed, DeviceId::Cpu),
            result(0, 1, TaskState::Failed, DeviceId::Accelerator(0)),
            result(0, 0, TaskState::Completed, DeviceId::Accelerator(0)),
            result(1, 1, TaskState::Cancelled, DeviceId::Cpu),
        ];
        let report = BatchReport::from_results(results, Duration::from_secs(1), 2);

        assert_eq!(report.success_count, 2);
        assert_eq!(report.failure_count, 1);
        assert_eq!(report.cancelled_count, 1);
        assert_eq!(report.pressure_releases, 2);

        let order: Vec<(usize, usize)> = report
            .results
            .iter()
            .map(|r| (r.source_ordinal, r.sequence_index))
            .collect();
        assert_eq!(order, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);

        let usage = report.device_usage();
        assert_eq!(usage.get("accelerator:0"), Some(&2));
        assert_eq!(usage.get("cpu"), Some(&1));
        assert_eq!(report.failures().count(), 1);
        assert_eq!(
            report.average_processing_time(),
            Some(Duration::from_millis(10))
        );
        assert_eq!(report.total_memory_delta(), 400);
    }

    #[test]
    fn test_empty_report_average_is_none() {
        let report = BatchReport::from_results(vec![], Duration::ZERO, 0);
        assert!(report.average_processing_time().is_none());
        assert_eq!(report.success_count, 0);
    }
}
