//! Exo application binary - composition root.
//!
//! 1. Parse CLI arguments and load configuration from TOML
//! 2. Install the tracing subscriber
//! 3. Build the embedding model, accelerator runtime and host memory source
//! 4. Run the requested command (index, search, devices, config)

mod cli;

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use exo_core::config::{expand_home, ExoConfig};
use exo_core::error::ExoError;
use exo_vector::device::{AcceleratorRuntime, DeviceProfiler, NoAccelerators, NvidiaSmiRuntime};
use exo_vector::embedding::{EmbeddingModel, HashEmbedding};
use exo_vector::monitor::{HostMemorySource, ResourceMonitor, SysinfoMemory};
use exo_vector::pipeline::{collect_input_files, HybridPipeline};
use exo_vector::search::{save_results, summarize};

use cli::{CliArgs, Command};

/// Load the config file if present. A broken file falls back to defaults.
fn load_config(path: &Path) -> (ExoConfig, Option<ExoError>) {
    if !path.exists() {
        return (ExoConfig::default(), None);
    }
    match ExoConfig::load(path) {
        Ok(config) => (config, None),
        Err(e) => (ExoConfig::default(), Some(e)),
    }
}

fn build_model(config: &ExoConfig) -> Result<Arc<dyn EmbeddingModel>, ExoError> {
    #[cfg(feature = "onnx")]
    if let Some(dir) = &config.embedding.model_dir {
        let model = exo_vector::embedding::OnnxEmbeddingModel::from_directory(&expand_home(dir))?;
        return Ok(Arc::new(model));
    }
    #[cfg(not(feature = "onnx"))]
    if let Some(dir) = &config.embedding.model_dir {
        tracing::warn!(
            model_dir = %expand_home(dir).display(),
            "Built without the onnx feature; using the hash model"
        );
    }
    Ok(Arc::new(HashEmbedding::new(config.embedding.dimensions)))
}

fn build_runtime(config: &ExoConfig) -> Arc<dyn AcceleratorRuntime> {
    if config.devices.enable_accelerators {
        Arc::new(NvidiaSmiRuntime::new())
    } else {
        Arc::new(NoAccelerators)
    }
}

fn build_pipeline(config: &ExoConfig) -> Result<HybridPipeline, ExoError> {
    let memory: Arc<dyn HostMemorySource> = Arc::new(SysinfoMemory::new());
    HybridPipeline::new(
        config.clone(),
        build_model(config)?,
        build_runtime(config),
        memory,
    )
}

async fn run_index(
    config: &ExoConfig,
    input: &Path,
    out_dir: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let files = collect_input_files(input)?;
    if files.is_empty() {
        return Err(ExoError::InvalidInput(format!("no files to index under {}", input.display())).into());
    }
    tracing::info!(files = files.len(), input = %input.display(), "Indexing");

    let pipeline = build_pipeline(config)?;
    let result = pipeline.index_files(&files, out_dir).await;
    pipeline.shutdown().await;
    let summary = result?;

    println!("Index written to {}", out_dir.display());
    println!("  model:       {}", summary.model_name);
    println!("  files:       {} ({} skipped)", summary.total_files, summary.skipped_files);
    println!(
        "  chunks:      {} indexed, {} failed",
        summary.indexed_chunks, summary.failed_chunks
    );
    println!("  dimension:   {}", summary.embedding_dimension);
    for (device, count) in &summary.devices_used {
        println!("  device:      {} ({} chunks)", device, count);
    }
    println!("  build time:  {:.2}s", summary.build_time_secs);
    Ok(())
}

async fn run_search(
    config: &ExoConfig,
    index_dir: &Path,
    query: &str,
    top_k: usize,
    min_score: f64,
    save: Option<&Path>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let pipeline = build_pipeline(config)?;
    let store = pipeline.load_index(index_dir)?;
    let retriever = pipeline.retriever(store);
    let results = retriever.search(query, top_k, min_score).await;
    pipeline.shutdown().await;
    let results = results?;

    if let Some(path) = save {
        save_results(path, &results)?;
    }
    if json {
        for r in &results {
            println!("{}", serde_json::to_string(r)?);
        }
        return Ok(());
    }

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for r in &results {
        println!(
            "{}. [{:.4} {}] {} #{} ({})",
            r.rank, r.score, r.relevance, r.metadata.source_id, r.metadata.sequence_index, r.metadata.tag
        );
        let preview: String = r.metadata.text.chars().take(200).collect();
        println!("   {}", preview.replace('\n', " "));
    }
    let summary = summarize(&results);
    println!(
        "{} results, score {:.4}..{:.4} (mean {:.4})",
        summary.total, summary.min_score, summary.max_score, summary.mean_score
    );
    Ok(())
}

fn run_devices(config: &ExoConfig) -> Result<(), Box<dyn std::error::Error>> {
    let memory: Arc<dyn HostMemorySource> = Arc::new(SysinfoMemory::new());
    let profiler = Arc::new(DeviceProfiler::new(
        build_runtime(config),
        memory,
        config.devices.clone(),
    )?);
    let monitor = ResourceMonitor::new(Arc::clone(&profiler));
    let snapshot = monitor.snapshot();
    let thresholds = config.resources.thresholds();

    for device in profiler.list_devices() {
        let pressure = snapshot.pressure_of(device.id);
        println!(
            "{:<16} {:<40} tier {:>3}  {:>8.1} GiB  {:>5.1}% used{}{}{}",
            device.id.to_string(),
            device.name,
            device.compute_tier,
            device.total_bytes as f64 / exo_core::config::GIB as f64,
            pressure * 100.0,
            if device.usable { "" } else { "  (unusable)" },
            if thresholds.exceeded_by(device.id, &snapshot) {
                "  (over threshold)"
            } else {
                ""
            },
            if config.devices.preferred == Some(device.id) {
                "  (preferred)"
            } else {
                ""
            },
        );
    }
    Ok(())
}

fn run_config(config: &ExoConfig, write: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    match write {
        Some(path) => {
            config.save(path)?;
            println!("Configuration written to {}", path.display());
        }
        None => print!("{}", toml::to_string_pretty(config)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();
    let config_file = args.resolve_config_path();
    let (mut config, load_error) = load_config(&config_file);

    // Tracing.
    exo_core::logging::init_tracing(&args.resolve_log_level(&config.general.log_level));
    tracing::info!("Starting exo v{}", env!("CARGO_PKG_VERSION"));

    match load_error {
        Some(e) => tracing::warn!(path = %config_file.display(), error = %e, "Invalid config; using defaults"),
        None => tracing::info!(path = %config_file.display(), "Configuration loaded"),
    }

    args.apply_overrides(&mut config);
    config.validate()?;

    match &args.command {
        Command::Index { input, .. } => {
            let out_dir = args.resolve_index_dir(&config);
            run_index(&config, input, &out_dir).await
        }
        Command::Search {
            query,
            top_k,
            min_score,
            save,
            json,
            ..
        } => {
            let index_dir = args.resolve_index_dir(&config);
            run_search(
                &config,
                &index_dir,
                query,
                *top_k,
                *min_score,
                save.as_deref(),
                *json,
            )
            .await
        }
        Command::Devices => run_devices(&config),
        Command::Config { write } => run_config(&config, write.as_deref()),
    }
}
