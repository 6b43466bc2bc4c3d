//! Vector index with exact search for small corpora and clustered search above
//! a size threshold.
//!
//! The store owns vectors and metadata as parallel arrays, so the entry at
//! position `i` always pairs `vectors[i]` with `metadata[i]`. Insertion needs
//! `&mut self`; a built store can be shared behind an `Arc` for searching.

pub mod cluster;
pub mod persist;

use std::path::Path;

use exo_core::config::IndexConfig;
use exo_core::error::{ExoError, Result};
use exo_core::types::ChunkMetadata;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use cluster::{cluster_count, ClusterIndex};

/// A vector with the chunk it was computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub vector: Vec<f32>,
    pub metadata: ChunkMetadata,
}

/// A single hit returned from a vector search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    /// Insertion position of the matching entry.
    pub position: usize,
    /// Cosine similarity score.
    pub score: f64,
    pub metadata: ChunkMetadata,
}

/// Current index shape, for summaries and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    Flat,
    Clustered { lists: usize },
}

/// Owner of the vector corpus and its metadata sidecar.
#[derive(Debug, Clone)]
pub struct IndexStore {
    config: IndexConfig,
    dimension: usize,
    vectors: Vec<Vec<f32>>,
    metadata: Vec<ChunkMetadata>,
    clusters: Option<ClusterIndex>,
    /// Corpus size at the last cluster training.
    trained_size: usize,
}

impl IndexStore {
    /// An empty flat index. Its dimension is fixed by the first insert.
    pub fn new(config: IndexConfig) -> Self {
        Self {
            config,
            dimension: 0,
            vectors: Vec::new(),
            metadata: Vec::new(),
            clusters: None,
            trained_size: 0,
        }
    }

    /// Build an index from entries, choosing the topology by corpus size.
    pub fn build(entries: Vec<IndexEntry>, config: &IndexConfig) -> Result<Self> {
        let mut store = Self::new(config.clone());
        store.append(entries)?;
        if store.len() >= store.config.flat_threshold {
            store.retrain();
        }
        info!(
            entries = store.len(),
            dimension = store.dimension,
            topology = ?store.topology(),
            "Index built"
        );
        Ok(store)
    }

    /// Append entries, retraining clusters once growth passes the configured ratio.
    pub fn add(&mut self, entries: Vec<IndexEntry>) -> Result<()> {
        let first_new = self.len();
        self.append(entries)?;

        let n = self.len();
        let growth_limit =
            self.trained_size as f64 * (1.0 + self.config.rebuild_growth_ratio);
        let retrain = match &self.clusters {
            Some(_) => n as f64 > growth_limit,
            None => n >= self.config.flat_threshold,
        };
        if retrain {
            self.retrain();
        } else if let Some(clusters) = self.clusters.as_mut() {
            for pos in first_new..n {
                clusters.assign(pos, &self.vectors[pos]);
            }
        }
        Ok(())
    }

    fn append(&mut self, entries: Vec<IndexEntry>) -> Result<()> {
        // Validate the whole batch before mutating anything.
        let mut dimension = self.dimension;
        for (i, entry) in entries.iter().enumerate() {
            let len = entry.vector.len();
            if len == 0 {
                return Err(ExoError::Index(format!("entry {} has an empty vector", i)));
            }
            if dimension == 0 {
                dimension = len;
            } else if len != dimension {
                return Err(ExoError::Index(format!(
                    "entry {} has dimension {}, index expects {}",
                    i, len, dimension
                )));
            }
        }
        self.dimension = dimension;
        for entry in entries {
            self.vectors.push(entry.vector);
            self.metadata.push(entry.metadata);
        }
        Ok(())
    }

    fn retrain(&mut self) {
        let k = cluster_count(self.len(), self.config.max_clusters);
        self.clusters = Some(ClusterIndex::train(&self.vectors, k));
        self.trained_size = self.len();
        debug!(entries = self.len(), lists = k, "Clusters trained");
    }

    /// The `k` most similar entries to `query`, best first.
    ///
    /// Equal scores are ordered by lower sequence index, then insertion position.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        if self.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if query.len() != self.dimension {
            return Err(ExoError::InvalidInput(format!(
                "query has dimension {}, index has {}",
                query.len(),
                self.dimension
            )));
        }

        let candidates: Vec<usize> = match &self.clusters {
            Some(clusters) if k < self.len() => {
                clusters.candidates(query, self.config.scan_clusters, k)
            }
            _ => (0..self.len()).collect(),
        };

        let mut scored: Vec<(usize, f64)> = candidates
            .into_iter()
            .map(|pos| (pos, cosine_similarity(query, &self.vectors[pos])))
            .collect();
        scored.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then(
                    self.metadata[a.0]
                        .sequence_index
                        .cmp(&self.metadata[b.0].sequence_index),
                )
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(position, score)| SearchHit {
                position,
                score,
                metadata: self.metadata[position].clone(),
            })
            .collect())
    }

    /// Write the index pair into `dir`.
    pub fn persist(&self, dir: &Path) -> Result<()> {
        persist::write_pair(dir, self.dimension, &self.vectors, &self.metadata)
    }

    /// Load and validate an index pair, rebuilding clusters when the corpus is large.
    pub fn load(dir: &Path, config: &IndexConfig) -> Result<Self> {
        let pair = persist::read_pair(dir)?;
        let mut store = Self::new(config.clone());
        store.dimension = pair.dimension;
        store.vectors = pair.vectors;
        store.metadata = pair.metadata;
        if store.len() >= store.config.flat_threshold {
            store.retrain();
        }
        info!(
            dir = %dir.display(),
            entries = store.len(),
            topology = ?store.topology(),
            "Index loaded"
        );
        Ok(store)
    }

    pub fn vector_count(&self) -> usize {
        self.vectors.len()
    }

    pub fn metadata_count(&self) -> usize {
        self.metadata.len()
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Vector dimension, or 0 for an index that has never held an entry.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn metadata(&self) -> &[ChunkMetadata] {
        &self.metadata
    }

    pub fn topology(&self) -> Topology {
        match &self.clusters {
            Some(c) => Topology::Clustered { lists: c.len() },
            None => Topology::Flat,
        }
    }
}

/// Compute cosine similarity between two vectors.
///
/// Returns 0.0 if either vector has zero magnitude or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (*x as f64) * (*y as f64))
        .sum();

    let mag_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let mag_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    dot / (mag_a * mag_b)
}
