//! CLI argument definitions for the exo binary.
//!
//! Uses `clap` with derive macros for ergonomic argument parsing.
//! Priority resolution: CLI args > env vars > config file > defaults.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use exo_core::config::{expand_home, ExoConfig};
use exo_core::types::DeviceId;

/// Exo - device-aware document embedding, indexing and retrieval.
#[derive(Parser, Debug)]
#[command(name = "exo", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    /// Skip accelerator probing and run on the host CPU only.
    #[arg(long = "cpu-only", global = true)]
    pub cpu_only: bool,

    /// Device to run encodes on: auto, cpu, accelerator, or accelerator:<n>.
    #[arg(long = "device", global = true, value_parser = parse_device)]
    pub device: Option<DeviceChoice>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Chunk, embed and index files.
    Index {
        /// Input directory, or a file listing one path per line.
        #[arg(short = 'i', long = "input")]
        input: PathBuf,

        /// Output directory for the index pair.
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,

        /// Chunk window size in characters.
        #[arg(long = "chunk-size")]
        chunk_size: Option<usize>,

        /// Chunk overlap in characters.
        #[arg(long = "chunk-overlap")]
        chunk_overlap: Option<usize>,

        /// Skip files larger than this many bytes.
        #[arg(long = "max-file-size")]
        max_file_size: Option<u64>,
    },

    /// Query a persisted index.
    Search {
        /// Query text.
        query: String,

        /// Number of results.
        #[arg(short = 'k', long = "top-k", default_value_t = 5)]
        top_k: usize,

        /// Drop results scoring below this.
        #[arg(long = "min-score", default_value_t = 0.0)]
        min_score: f64,

        /// Index directory.
        #[arg(short = 'i', long = "index")]
        index: Option<PathBuf>,

        /// Also write the results to this JSON lines file.
        #[arg(long = "save")]
        save: Option<PathBuf>,

        /// Print results as JSON lines instead of text.
        #[arg(long = "json")]
        json: bool,
    },

    /// List compute devices and their memory pressure.
    Devices,

    /// Print the effective configuration, or write it to a file.
    Config {
        #[arg(long = "write")]
        write: Option<PathBuf>,
    },
}

/// Value of `--device`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceChoice {
    /// Let the engine rank devices.
    Auto,
    Device(DeviceId),
}

fn parse_device(value: &str) -> Result<DeviceChoice, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "auto" => Ok(DeviceChoice::Auto),
        "accelerator" | "gpu" => Ok(DeviceChoice::Device(DeviceId::Accelerator(0))),
        other => other
            .parse::<DeviceId>()
            .map(DeviceChoice::Device)
            .map_err(|e| e.to_string()),
    }
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > EXO_CONFIG env var > ~/.exo/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("EXO_CONFIG") {
            return PathBuf::from(p);
        }
        ExoConfig::default_path()
    }

    /// Resolve the log level.
    ///
    /// Priority: --log-level flag > config file value.
    pub fn resolve_log_level(&self, config_level: &str) -> String {
        self.log_level
            .clone()
            .unwrap_or_else(|| config_level.to_string())
    }

    /// Resolve the index directory.
    ///
    /// Priority: command flag > EXO_INDEX_DIR env var > config file value.
    pub fn resolve_index_dir(&self, config: &ExoConfig) -> PathBuf {
        let flag = match &self.command {
            Command::Index { output, .. } => output.as_ref(),
            Command::Search { index, .. } => index.as_ref(),
            _ => None,
        };
        if let Some(p) = flag {
            return p.clone();
        }
        if let Ok(p) = std::env::var("EXO_INDEX_DIR") {
            return PathBuf::from(p);
        }
        expand_home(&config.general.index_dir)
    }

    /// Apply flag overrides to a loaded configuration.
    pub fn apply_overrides(&self, config: &mut ExoConfig) {
        if self.cpu_only {
            config.devices.enable_accelerators = false;
            config.devices.host_enabled = true;
        }
        match self.device {
            Some(DeviceChoice::Auto) => config.devices.preferred = None,
            Some(DeviceChoice::Device(id)) => {
                if id.is_host() {
                    config.devices.host_enabled = true;
                }
                config.devices.preferred = Some(id);
            }
            None => {}
        }
        if let Command::Index {
            chunk_size,
            chunk_overlap,
            max_file_size,
            ..
        } = &self.command
        {
            if let Some(v) = chunk_size {
                config.chunking.window_size = *v;
            }
            if let Some(v) = chunk_overlap {
                config.chunking.overlap = *v;
            }
            if let Some(v) = max_file_size {
                config.chunking.max_file_size = *v;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_parse_index_command() {
        let args = parse(&[
            "exo", "index", "-i", "docs", "-o", "out", "--chunk-size", "256", "--chunk-overlap",
            "32",
        ]);
        match &args.command {
            Command::Index {
                input,
                output,
                chunk_size,
                chunk_overlap,
                max_file_size,
            } => {
                assert_eq!(input, &PathBuf::from("docs"));
                assert_eq!(output.as_deref(), Some(std::path::Path::new("out")));
                assert_eq!(*chunk_size, Some(256));
                assert_eq!(*chunk_overlap, Some(32));
                assert_eq!(*max_file_size, None);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_search_defaults() {
        let args = parse(&["exo", "search", "where is the config"]);
        match args.command {
            Command::Search {
                query,
                top_k,
                min_score,
                json,
                ..
            } => {
                assert_eq!(query, "where is the config");
                assert_eq!(top_k, 5);
                assert_eq!(min_score, 0.0);
                assert!(!json);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = parse(&["exo", "devices", "--cpu-only", "-l", "debug"]);
        assert!(args.cpu_only);
        assert_eq!(args.resolve_log_level("info"), "debug");
    }

    #[test]
    fn test_config_flag_wins() {
        let args = parse(&["exo", "-c", "/tmp/exo.toml", "devices"]);
        assert_eq!(args.resolve_config_path(), PathBuf::from("/tmp/exo.toml"));
    }

    #[test]
    fn test_log_level_falls_back_to_config() {
        let args = parse(&["exo", "devices"]);
        assert_eq!(args.resolve_log_level("warn"), "warn");
    }

    #[test]
    fn test_index_dir_flag_wins() {
        let args = parse(&["exo", "search", "q", "-i", "/data/idx"]);
        assert_eq!(
            args.resolve_index_dir(&ExoConfig::default()),
            PathBuf::from("/data/idx")
        );
    }

    #[test]
    fn test_apply_overrides() {
        let args = parse(&[
            "exo",
            "--cpu-only",
            "index",
            "-i",
            "docs",
            "--chunk-size",
            "300",
            "--max-file-size",
            "1024",
        ]);
        let mut config = ExoConfig::default();
        args.apply_overrides(&mut config);
        assert!(!config.devices.enable_accelerators);
        assert_eq!(config.chunking.window_size, 300);
        assert_eq!(config.chunking.overlap, 50);
        assert_eq!(config.chunking.max_file_size, 1024);
    }

    #[test]
    fn test_device_flag_sets_preference() {
        let args = parse(&["exo", "index", "-i", "docs", "--device", "accelerator:1"]);
        assert_eq!(args.device, Some(DeviceChoice::Device(DeviceId::Accelerator(1))));
        let mut config = ExoConfig::default();
        args.apply_overrides(&mut config);
        assert_eq!(config.devices.preferred, Some(DeviceId::Accelerator(1)));

        let args = parse(&["exo", "--device", "cpu", "search", "q"]);
        let mut config = ExoConfig::default();
        config.devices.host_enabled = false;
        args.apply_overrides(&mut config);
        assert_eq!(config.devices.preferred, Some(DeviceId::Cpu));
        assert!(config.devices.host_enabled);
    }

    #[test]
    fn test_device_flag_auto_clears_config_preference() {
        let args = parse(&["exo", "index", "-i", "docs", "--device", "auto"]);
        let mut config = ExoConfig::default();
        config.devices.preferred = Some(DeviceId::Accelerator(0));
        args.apply_overrides(&mut config);
        assert_eq!(config.devices.preferred, None);

        let args = parse(&["exo", "index", "-i", "docs", "--device", "GPU"]);
        assert_eq!(args.device, Some(DeviceChoice::Device(DeviceId::Accelerator(0))));
    }

    #[test]
    fn test_device_flag_rejects_unknown_device() {
        assert!(CliArgs::try_parse_from(["exo", "devices", "--device", "tpu"]).is_err());
    }

    #[test]
    fn test_missing_subcommand_is_error() {
        assert!(CliArgs::try_parse_from(["exo"]).is_err());
    }
}
