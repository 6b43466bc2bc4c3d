//! Query-time retrieval.
//!
//! `Retriever` embeds the query through the `EmbeddingEngine`, runs k-NN on the
//! `IndexStore`, and joins the sidecar metadata into ranked results.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use exo_core::error::{ExoError, Result};
use exo_core::types::{ChunkMetadata, DeviceId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::engine::EmbeddingEngine;
use crate::index::IndexStore;

pub const DEFAULT_TOP_K: usize = 5;

/// A ranked hit with its chunk metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    /// 1-based rank.
    pub rank: usize,
    /// Cosine similarity score.
    pub score: f64,
    pub relevance: String,
    #[serde(flatten)]
    pub metadata: ChunkMetadata,
}

/// Human-readable relevance bucket for a similarity score.
pub fn relevance_label(score: f64) -> &'static str {
    if score >= 0.8 {
        "Very High"
    } else if score >= 0.6 {
        "High"
    } else if score >= 0.4 {
        "Medium"
    } else if score >= 0.2 {
        "Low"
    } else {
        "Very Low"
    }
}

/// Score statistics over one result set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub total: usize,
    pub max_score: f64,
    pub min_score: f64,
    pub mean_score: f64,
    /// Result count per content tag.
    pub tags: BTreeMap<String, usize>,
    /// Result count per source.
    pub sources: BTreeMap<String, usize>,
}

/// Embeds queries and searches a shared index.
pub struct Retriever {
    engine: Arc<EmbeddingEngine>,
    index: Arc<IndexStore>,
    device_preference: Option<DeviceId>,
}

impl Retriever {
    pub fn new(engine: Arc<EmbeddingEngine>, index: Arc<IndexStore>) -> Self {
        Self {
            engine,
            index,
            device_preference: None,
        }
    }

    /// Device to encode queries on when it is usable and not under pressure.
    pub fn with_device_preference(mut self, device: Option<DeviceId>) -> Self {
        self.device_preference = device;
        self
    }

    /// Return up to `top_k` results scoring at least `min_score`, best first.
    ///
    /// A query the model cannot encode is an `ExoError::Encode`.
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        min_score: f64,
    ) -> Result<Vec<RetrievalResult>> {
        if query.trim().is_empty() {
            return Err(ExoError::InvalidInput("empty query".into()));
        }
        if self.index.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let query_vec = self.engine.embed_one(query, self.device_preference).await?;
        let hits = self.index.search(&query_vec, top_k)?;

        let results: Vec<RetrievalResult> = hits
            .into_iter()
            .filter(|hit| hit.score >= min_score)
            .enumerate()
            .map(|(i, hit)| RetrievalResult {
                rank: i + 1,
                score: hit.score,
                relevance: relevance_label(hit.score).to_string(),
                metadata: hit.metadata,
            })
            .collect();

        debug!(
            query_len = query.len(),
            top_k,
            min_score,
            returned = results.len(),
            "Retrieval complete"
        );
        Ok(results)
    }

    pub fn index(&self) -> &IndexStore {
        &self.index
    }
}

/// Write results as JSON lines.
pub fn save_results(path: &Path, results: &[RetrievalResult]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut w = BufWriter::new(File::create(path)?);
    for result in results {
        serde_json::to_writer(&mut w, result)?;
        w.write_all(b"\n")?;
    }
    w.flush()?;
    info!(path = %path.display(), results = results.len(), "Results saved");
    Ok(())
}

pub fn summarize(results: &[RetrievalResult]) -> ResultSummary {
    if results.is_empty() {
        return ResultSummary::default();
    }
    let mut summary = ResultSummary {
        total: results.len(),
        max_score: f64::NEG_INFINITY,
        min_score: f64::INFINITY,
        ..Default::default()
    };
    let mut sum = 0.0;
    for r in results {
        summary.max_score = summary.max_score.max(r.score);
        summary.min_score = summary.min_score.min(r.score);
        sum += r.score;
        *summary.tags.entry(r.metadata.tag.to_string()).or_insert(0) += 1;
        *summary
            .sources
            .entry(r.metadata.source_id.clone())
            .or_insert(0) += 1;
    }
    summary.mean_score = sum / results.len() as f64;
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceProfiler, NoAccelerators};
    use crate::embedding::{EmbeddingModel, EncodeError, HashEmbedding};
    use crate::index::IndexEntry;
    use crate::monitor::{FixedMemory, ResourceMonitor};
    use exo_core::config::{DevicesConfig, EmbeddingConfig, IndexConfig, GIB};
    use exo_core::types::{ContentTag, DeviceProfile, PressureThresholds};

    struct Broken;

    impl EmbeddingModel for Broken {
        fn encode(
            &self,
            _batch: &[String],
            _device: &DeviceProfile,
        ) -> std::result::Result<Vec<Vec<f32>>, EncodeError> {
            Err(EncodeError::Device("model offline".into()))
        }

        fn dimensions(&self) -> usize {
            8
        }

        fn name(&self) -> &str {
            "broken"
        }
    }

    fn engine(model: Arc<dyn EmbeddingModel>) -> Arc<EmbeddingEngine> {
        let profiler = Arc::new(
            DeviceProfiler::new(
                Arc::new(NoAccelerators),
                Arc::new(FixedMemory::new(16 * GIB, GIB)),
                DevicesConfig::default(),
            )
            .unwrap(),
        );
        let monitor = Arc::new(ResourceMonitor::new(Arc::clone(&profiler)));
        Arc::new(EmbeddingEngine::new(
            model,
            profiler,
            monitor,
            PressureThresholds::default(),
            &EmbeddingConfig::default(),
        ))
    }

    fn meta(source: &str, seq: usize, text: &str, tag: ContentTag) -> ChunkMetadata {
        ChunkMetadata {
            source_id: source.into(),
            sequence_index: seq,
            text: text.into(),
            tag,
        }
    }

    fn indexed(texts: &[(&str, ContentTag)]) -> Arc<IndexStore> {
        let model = HashEmbedding::default();
        let entries = texts
            .iter()
            .enumerate()
            .map(|(i, (text, tag))| IndexEntry {
                vector: model.hash_to_vector(text),
                metadata: meta("corpus.txt", i, text, *tag),
            })
            .collect();
        Arc::new(IndexStore::build(entries, &IndexConfig::default()).unwrap())
    }

    #[tokio::test]
    async fn test_search_finds_exact_text() {
        let index = indexed(&[
            ("rust ownership rules", ContentTag::Doc),
            ("fn main() {}", ContentTag::Code),
            ("[server] port = 80", ContentTag::Config),
        ]);
        let retriever = Retriever::new(engine(Arc::new(HashEmbedding::default())), index);

        let results = retriever.search("fn main() {}", 2, 0.0).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].rank, 1);
        assert_eq!(results[1].rank, 2);
        assert_eq!(results[0].metadata.text, "fn main() {}");
        assert!((results[0].score - 1.0).abs() < 1e-6);
        assert_eq!(results[0].relevance, "Very High");
    }

    #[tokio::test]
    async fn test_top_k_above_corpus_returns_all() {
        let index = indexed(&[("a", ContentTag::Doc), ("b", ContentTag::Doc)]);
        let retriever = Retriever::new(engine(Arc::new(HashEmbedding::default())), index);
        let results = retriever.search("a", 50, -1.0).await.unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn test_min_score_filters_hits() {
        let index = indexed(&[("alpha", ContentTag::Doc), ("beta", ContentTag::Doc)]);
        let retriever = Retriever::new(engine(Arc::new(HashEmbedding::default())), index);
        let results = retriever.search("alpha", 5, 0.99).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].metadata.text, "alpha");
    }

    #[tokio::test]
    async fn test_failed_query_encode_is_error() {
        let index = indexed(&[("alpha", ContentTag::Doc)]);
        let retriever = Retriever::new(engine(Arc::new(Broken)), index);
        let err = retriever.search("alpha", 5, 0.0).await.unwrap_err();
        assert!(matches!(err, ExoError::Encode(_)));
    }

    #[tokio::test]
    async fn test_empty_query_and_empty_index() {
        let retriever = Retriever::new(
            engine(Arc::new(HashEmbedding::default())),
            Arc::new(IndexStore::new(IndexConfig::default())),
        );
        assert!(retriever.search("anything", 5, 0.0).await.unwrap().is_empty());
        assert!(matches!(
            retriever.search("   ", 5, 0.0).await,
            Err(ExoError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_relevance_labels() {
        assert_eq!(relevance_label(0.95), "Very High");
        assert_eq!(relevance_label(0.8), "Very High");
        assert_eq!(relevance_label(0.6), "High");
        assert_eq!(relevance_label(0.45), "Medium");
        assert_eq!(relevance_label(0.2), "Low");
        assert_eq!(relevance_label(0.0), "Very Low");
        assert_eq!(relevance_label(-0.3), "Very Low");
    }

    fn result(rank: usize, score: f64, tag: ContentTag, source: &str) -> RetrievalResult {
        RetrievalResult {
            rank,
            score,
            relevance: relevance_label(score).to_string(),
            metadata: meta(source, rank, "t", tag),
        }
    }

    #[test]
    fn test_summarize() {
        let results = vec![
            result(1, 0.9, ContentTag::Code, "a.rs"),
            result(2, 0.5, ContentTag::Doc, "b.md"),
            result(3, 0.1, ContentTag::Code, "a.rs"),
        ];
        let summary = summarize(&results);
        assert_eq!(summary.total, 3);
        assert!((summary.max_score - 0.9).abs() < 1e-9);
        assert!((summary.min_score - 0.1).abs() < 1e-9);
        assert!((summary.mean_score - 0.5).abs() < 1e-9);
        assert_eq!(summary.tags["code"], 2);
        assert_eq!(summary.tags["doc"], 1);
        assert_eq!(summary.sources["a.rs"], 2);

        assert_eq!(summarize(&[]), ResultSummary::default());
    }

    #[test]
    fn test_save_results_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("results.jsonl");
        let results = vec![
            result(1, 0.9, ContentTag::Code, "a.rs"),
            result(2, 0.3, ContentTag::Doc, "b.md"),
        ];
        save_results(&path, &results).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["rank"], 1);
        assert_eq!(first["source_id"], "a.rs");
        assert_eq!(first["relevance"], "Very High");
        let back: RetrievalResult = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(back, results[1]);
    }
}
