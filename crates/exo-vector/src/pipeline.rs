//! End-to-end indexing pipeline.
//!
//! `HybridPipeline` wires the device profiler, resource monitor, embedding
//! engine, staging area, chunker and scheduler together. Files go in, a
//! `BatchReport` comes out; `index_files` also builds and persists the index.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use exo_core::config::ExoConfig;
use exo_core::error::{ExoError, Result};
use exo_core::types::{BatchReport, ProcessingTask, SkippedFile};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::chunker::Chunker;
use crate::device::{AcceleratorRuntime, DeviceProfiler};
use crate::embedding::EmbeddingModel;
use crate::engine::EmbeddingEngine;
use crate::index::{IndexEntry, IndexStore, Topology};
use crate::monitor::{HostMemorySource, ResourceMonitor};
use crate::scheduler::Scheduler;
use crate::search::Retriever;
use crate::staging::StagingArea;

/// Extensions picked up when indexing a directory.
pub const INPUT_EXTENSIONS: &[&str] = &[
    "txt", "md", "py", "js", "ts", "html", "css", "json", "xml", "yaml", "yml",
];

/// Name of the build summary written next to the index pair.
pub const INFO_FILE: &str = "index.info.json";

/// What a build produced, written to `index.info.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSummary {
    pub model_name: String,
    pub devices_used: BTreeMap<String, usize>,
    pub total_files: usize,
    pub skipped_files: usize,
    pub total_chunks: usize,
    pub indexed_chunks: usize,
    pub failed_chunks: usize,
    pub embedding_dimension: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub topology: Topology,
    pub pressure_releases: u64,
    pub build_time_secs: f64,
    pub index_size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Composition root for indexing and retrieval.
pub struct HybridPipeline {
    config: ExoConfig,
    profiler: Arc<DeviceProfiler>,
    monitor: Arc<ResourceMonitor>,
    engine: Arc<EmbeddingEngine>,
    staging: StagingArea,
    chunker: Chunker,
    scheduler: Scheduler,
}

impl std::fmt::Debug for HybridPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridPipeline")
            .field("engine", &self.engine)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl HybridPipeline {
    /// Detect devices and start the worker pool. Must be called from within a
    /// tokio runtime.
    pub fn new(
        config: ExoConfig,
        model: Arc<dyn EmbeddingModel>,
        runtime: Arc<dyn AcceleratorRuntime>,
        memory: Arc<dyn HostMemorySource>,
    ) -> Result<Self> {
        config.validate()?;
        if model.dimensions() != config.embedding.dimensions {
            warn!(
                model = model.name(),
                model_dimensions = model.dimensions(),
                configured = config.embedding.dimensions,
                "Model dimension differs from configuration; using the model's"
            );
        }

        let profiler = Arc::new(DeviceProfiler::new(
            runtime,
            memory,
            config.devices.clone(),
        )?);
        let monitor = Arc::new(ResourceMonitor::new(Arc::clone(&profiler)));
        let thresholds = config.resources.thresholds();
        let engine = Arc::new(EmbeddingEngine::new(
            model,
            Arc::clone(&profiler),
            Arc::clone(&monitor),
            thresholds,
            &config.embedding,
        ));
        let staging = StagingArea::new(&config.staging)?;
        let chunker = Chunker::from_config(&config.chunking);
        let scheduler = Scheduler::new(Arc::clone(&engine), &config.scheduler, thresholds);

        info!(
            model = engine.model_name(),
            dimensions = engine.dimensions(),
            usable_devices = profiler.usable_devices().len(),
            "Pipeline ready"
        );
        Ok(Self {
            config,
            profiler,
            monitor,
            engine,
            staging,
            chunker,
            scheduler,
        })
    }

    pub fn config(&self) -> &ExoConfig {
        &self.config
    }

    pub fn profiler(&self) -> &Arc<DeviceProfiler> {
        &self.profiler
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    pub fn engine(&self) -> &Arc<EmbeddingEngine> {
        &self.engine
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Chunk every readable file and embed the chunks.
    ///
    /// Files that cannot be read or exceed `chunking.max_file_size` are listed in
    /// `skipped_files` rather than failing the batch.
    pub async fn process_files(&self, paths: &[PathBuf]) -> Result<BatchReport> {
        let started = Instant::now();
        let mut tasks = Vec::new();
        let mut skipped = Vec::new();

        for (ordinal, path) in paths.iter().enumerate() {
            let source_id = path.display().to_string();
            let bytes = match self.read_source(path) {
                Ok(bytes) => bytes,
                Err(reason) => {
                    warn!(path = %source_id, reason = %reason, "Skipping file");
                    skipped.push(SkippedFile {
                        path: source_id,
                        reason,
                    });
                    continue;
                }
            };

            let text = String::from_utf8_lossy(&bytes);
            let extension = path.extension().and_then(|e| e.to_str());
            let chunks = self.chunker.chunk(&source_id, &text, extension);
            debug!(path = %source_id, bytes = bytes.len(), chunks = chunks.len(), "File chunked");
            tasks.extend(chunks.into_iter().map(|chunk| {
                let task = ProcessingTask::new(ordinal, chunk);
                match self.config.devices.preferred {
                    Some(device) => task.with_device_preference(device),
                    None => task,
                }
            }));
        }

        info!(
            files = paths.len(),
            skipped = skipped.len(),
            tasks = tasks.len(),
            "Files chunked"
        );
        let mut report = self.scheduler.run_batch(tasks).await?.with_skipped(skipped);
        report.total_time = started.elapsed();
        Ok(report)
    }

    /// Read a file, through a staging region when one fits.
    fn read_source(&self, path: &Path) -> std::result::Result<Vec<u8>, String> {
        let meta = fs::metadata(path).map_err(|e| format!("unreadable: {}", e))?;
        if !meta.is_file() {
            return Err("not a regular file".to_string());
        }
        let size = meta.len();
        let limit = self.config.chunking.max_file_size;
        if size > limit {
            return Err(format!("{} bytes exceeds the {} byte limit", size, limit));
        }

        if self.staging.can_fit(size) {
            let staged = self
                .staging
                .acquire(size)
                .and_then(|mut region| fs::read(region.copy_in(path)?).map_err(ExoError::from));
            match staged {
                Ok(bytes) => return Ok(bytes),
                Err(e) => debug!(path = %path.display(), error = %e, "Staging failed; reading directly"),
            }
        }
        fs::read(path).map_err(|e| format!("unreadable: {}", e))
    }

    /// Build an index from the successful results of a batch.
    pub fn build_index(&self, report: &BatchReport) -> Result<IndexStore> {
        let entries: Vec<IndexEntry> = report
            .results
            .iter()
            .filter(|r| r.success && !r.vector.is_empty())
            .map(|r| IndexEntry {
                vector: r.vector.clone(),
                metadata: r.chunk.metadata(),
            })
            .collect();
        IndexStore::build(entries, &self.config.index)
    }

    /// Process files, build the index, and persist it with a summary in `out_dir`.
    pub async fn index_files(&self, paths: &[PathBuf], out_dir: &Path) -> Result<IndexSummary> {
        let started = Instant::now();
        let report = self.process_files(paths).await?;
        let store = self.build_index(&report)?;
        store.persist(out_dir)?;

        let index_size_bytes = fs::metadata(crate::index::persist::vector_path(out_dir))
            .map(|m| m.len())
            .unwrap_or(0);
        let summary = IndexSummary {
            model_name: self.engine.model_name().to_string(),
            devices_used: report.device_usage(),
            total_files: paths.len(),
            skipped_files: report.skipped_files.len(),
            total_chunks: report.results.len(),
            indexed_chunks: store.len(),
            failed_chunks: report.failure_count,
            embedding_dimension: self.engine.dimensions(),
            chunk_size: self.chunker.window_size(),
            chunk_overlap: self.chunker.overlap(),
            topology: store.topology(),
            pressure_releases: report.pressure_releases,
            build_time_secs: started.elapsed().as_secs_f64(),
            index_size_bytes,
            created_at: Utc::now(),
        };
        let info_path = out_dir.join(INFO_FILE);
        fs::write(&info_path, serde_json::to_string_pretty(&summary)?)?;

        info!(
            dir = %out_dir.display(),
            files = summary.total_files,
            chunks = summary.indexed_chunks,
            failed = summary.failed_chunks,
            build_time_secs = summary.build_time_secs,
            "Index build complete"
        );
        Ok(summary)
    }

    /// Load a persisted index with this pipeline's index settings.
    pub fn load_index(&self, dir: &Path) -> Result<IndexStore> {
        IndexStore::load(dir, &self.config.index)
    }

    pub fn retriever(&self, store: IndexStore) -> Retriever {
        Retriever::new(Arc::clone(&self.engine), Arc::new(store))
            .with_device_preference(self.config.devices.preferred)
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}

/// Expand an input path into the files to index.
///
/// A directory is walked recursively for `INPUT_EXTENSIONS`; any other file is
/// read as a newline-separated list of paths.
pub fn collect_input_files(input: &Path) -> Result<Vec<PathBuf>> {
    let meta = fs::metadata(input).map_err(|e| {
        ExoError::InvalidInput(format!("cannot read input {}: {}", input.display(), e))
    })?;

    let files = if meta.is_dir() {
        let mut files = Vec::new();
        walk(input, &mut files)?;
        files.sort();
        files
    } else {
        fs::read_to_string(input)?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(PathBuf::from)
            .collect()
    };
    debug!(input = %input.display(), files = files.len(), "Input files collected");
    Ok(files)
}

fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(&path, out)?;
        } else if file_type.is_file() && has_input_extension(&path) {
            out.push(path);
        }
    }
    Ok(())
}

fn has_input_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| INPUT_EXTENSIONS.contains(&e))
        .unwrap_or(false)
}
