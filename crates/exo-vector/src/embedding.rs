//! Embedding model capability and implementations.
//!
//! - `HashEmbedding` provides deterministic hash-based vectors. It needs no model
//!   files and backs tests and model-less runs.
//! - `OnnxEmbeddingModel` (feature `onnx`) loads a sentence-transformer ONNX model
//!   (e.g. all-MiniLM-L6-v2) via ort and tokenizes with the HuggingFace tokenizers
//!   crate. It runs on the host CPU only.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use exo_core::types::DeviceProfile;
use thiserror::Error;

/// Failure of a single model call. Absorbed by the engine into failure entries.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EncodeError {
    #[error("out of memory on {device}: {detail}")]
    OutOfMemory { device: String, detail: String },

    #[error("device error: {0}")]
    Device(String),

    #[error("unsupported device: {0}")]
    Unsupported(String),

    #[error("malformed model output: {0}")]
    Malformed(String),

    #[error("encode task panicked: {0}")]
    Panicked(String),
}

/// Black-box text to vector model.
///
/// `encode` is synchronous and may block; the engine runs it on the blocking pool.
/// Output dimensionality must be fixed for a given instance.
pub trait EmbeddingModel: Send + Sync {
    /// Encode a batch, returning one vector per input in order.
    fn encode(&self, batch: &[String], device: &DeviceProfile)
        -> Result<Vec<Vec<f32>>, EncodeError>;

    fn dimensions(&self) -> usize;

    fn name(&self) -> &str;
}

/// Scale a vector to unit length in place. Zero vectors are left as they are.
pub fn l2_normalize(values: &mut [f32]) {
    let norm: f32 = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for val in values.iter_mut() {
            *val /= norm;
        }
    }
}

// ---------------------------------------------------------------------------
// HashEmbedding - deterministic hash-based vectors
// ---------------------------------------------------------------------------

/// Embedding model that derives each component from a hash of the text.
///
/// Identical inputs always produce identical unit vectors on every device.
#[derive(Debug, Clone)]
pub struct HashEmbedding {
    dimensions: usize,
}

impl Default for HashEmbedding {
    fn default() -> Self {
        Self::new(384)
    }
}

impl HashEmbedding {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn hash_to_vector(&self, text: &str) -> Vec<f32> {
        let mut result = Vec::with_capacity(self.dimensions);
        for i in 0..self.dimensions {
            let mut hasher = DefaultHasher::new();
            text.hash(&mut hasher);
            i.hash(&mut hasher);
            let h = hasher.finish();
            let val = ((h as f64) / (u64::MAX as f64)) * 2.0 - 1.0;
            result.push(val as f32);
        }
        l2_normalize(&mut result);
        result
    }
}

impl EmbeddingModel for HashEmbedding {
    fn encode(
        &self,
        batch: &[String],
        _device: &DeviceProfile,
    ) -> Result<Vec<Vec<f32>>, EncodeError> {
        batch
            .iter()
            .map(|text| {
                if text.is_empty() {
                    Err(EncodeError::Malformed("cannot embed empty text".to_string()))
                } else {
                    Ok(self.hash_to_vector(text))
                }
            })
            .collect()
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        "hash"
    }
}

// ---------------------------------------------------------------------------
// OnnxEmbeddingModel - ONNX Runtime inference
// ---------------------------------------------------------------------------

#[cfg(feature = "onnx")]
pub use onnx::OnnxEmbeddingModel;

#[cfg(feature = "onnx")]
mod onnx {
    use std::path::Path;
    use std::sync::Mutex;

    use exo_core::error::{ExoError, Result};
    use exo_core::types::DeviceProfile;
    use ort::session::Session;
    use ort::value::TensorRef;
    use tokenizers::Tokenizer;
    use tracing::info;

    use super::{l2_normalize, EmbeddingModel, EncodeError};

    /// ONNX Runtime-backed sentence-transformer.
    ///
    /// Expects a model directory containing:
    /// - `model.onnx`: the sentence-transformer ONNX export
    /// - `tokenizer.json`: the HuggingFace fast-tokenizer file
    ///
    /// Inputs are `input_ids`, `attention_mask`, `token_type_ids` (i64); output
    /// token embeddings are mean-pooled under the attention mask and L2-normalized.
    pub struct OnnxEmbeddingModel {
        session: Mutex<Session>,
        tokenizer: Tokenizer,
        dimensions: usize,
        name: String,
    }

    impl std::fmt::Debug for OnnxEmbeddingModel {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("OnnxEmbeddingModel")
                .field("name", &self.name)
                .field("dimensions", &self.dimensions)
                .finish()
        }
    }

    impl OnnxEmbeddingModel {
        /// Load `model.onnx` and `tokenizer.json` from a directory.
        pub fn from_directory(model_dir: &Path) -> Result<Self> {
            let model_path = model_dir.join("model.onnx");
            let tokenizer_path = model_dir.join("tokenizer.json");
            if !model_path.exists() {
                return Err(ExoError::Config(format!(
                    "ONNX model not found at {}",
                    model_path.display()
                )));
            }
            if !tokenizer_path.exists() {
                return Err(ExoError::Config(format!(
                    "Tokenizer not found at {}",
                    tokenizer_path.display()
                )));
            }

            let session = Session::builder()
                .map_err(|e| ExoError::Config(format!("ONNX session builder: {}", e)))?
                .with_intra_threads(1)
                .map_err(|e| ExoError::Config(format!("ONNX set threads: {}", e)))?
                .commit_from_file(&model_path)
                .map_err(|e| ExoError::Config(format!("ONNX load model: {}", e)))?;

            // Sentence-transformer output is [batch, seq_len, hidden_dim].
            let dimensions = session
                .outputs()
                .first()
                .and_then(|out| out.dtype().tensor_shape())
                .and_then(|shape| shape.last().copied())
                .map(|d| if d > 0 { d as usize } else { 384 })
                .unwrap_or(384);

            let tokenizer = Tokenizer::from_file(&tokenizer_path)
                .map_err(|e| ExoError::Config(format!("Failed to load tokenizer: {}", e)))?;

            let name = model_dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "onnx".to_string());

            info!(
                model = %model_path.display(),
                dimensions,
                "Loaded ONNX embedding model"
            );

            Ok(Self {
                session: Mutex::new(session),
                tokenizer,
                dimensions,
                name,
            })
        }

        fn embed_one(&self, text: &str) -> std::result::Result<Vec<f32>, EncodeError> {
            if text.is_empty() {
                return Err(EncodeError::Malformed("cannot embed empty text".to_string()));
            }

            let encoding = self
                .tokenizer
                .encode(text, true)
                .map_err(|e| EncodeError::Malformed(format!("tokenization failed: {}", e)))?;

            let input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
            let attention_mask: Vec<i64> = encoding
                .get_attention_mask()
                .iter()
                .map(|&m| m as i64)
                .collect();
            let token_type_ids: Vec<i64> =
                encoding.get_type_ids().iter().map(|&t| t as i64).collect();
            let seq_len = input_ids.len();

            let device_err = |what: &str, e: &dyn std::fmt::Display| {
                EncodeError::Device(format!("{}: {}", what, e))
            };

            let ids_array = ndarray::Array2::from_shape_vec((1, seq_len), input_ids)
                .map_err(|e| device_err("input_ids array", &e))?;
            let mask_array = ndarray::Array2::from_shape_vec((1, seq_len), attention_mask.clone())
                .map_err(|e| device_err("attention_mask array", &e))?;
            let type_array = ndarray::Array2::from_shape_vec((1, seq_len), token_type_ids)
                .map_err(|e| device_err("token_type_ids array", &e))?;

            let ids_ref = TensorRef::from_array_view(&ids_array)
                .map_err(|e| device_err("TensorRef input_ids", &e))?;
            let mask_ref = TensorRef::from_array_view(&mask_array)
                .map_err(|e| device_err("TensorRef attention_mask", &e))?;
            let type_ref = TensorRef::from_array_view(&type_array)
                .map_err(|e| device_err("TensorRef token_type_ids", &e))?;

            let mut session = self
                .session
                .lock()
                .map_err(|e| EncodeError::Device(format!("session lock poisoned: {}", e)))?;
            let outputs = session
                .run(ort::inputs![ids_ref, mask_ref, type_ref])
                .map_err(|e| device_err("ONNX inference failed", &e))?;

            let (shape, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| EncodeError::Malformed(format!("extract embeddings: {}", e)))?;

            let shape_dims: Vec<i64> = shape.iter().copied().collect();
            let hidden_dim = match shape_dims.as_slice() {
                [.., _, last] if *last > 0 => *last as usize,
                _ => {
                    return Err(EncodeError::Malformed(format!(
                        "unexpected output shape: {:?}",
                        shape_dims
                    )))
                }
            };

            let mut pooled = vec![0.0f32; hidden_dim];
            let mut count = 0.0f32;
            for (tok_idx, &mask_val) in attention_mask.iter().enumerate() {
                if mask_val > 0 {
                    let offset = tok_idx * hidden_dim;
                    for (dim, slot) in pooled.iter_mut().enumerate() {
                        *slot += data[offset + dim];
                    }
                    count += 1.0;
                }
            }
            if count > 0.0 {
                for val in &mut pooled {
                    *val /= count;
                }
            }
            l2_normalize(&mut pooled);
            Ok(pooled)
        }
    }

    impl EmbeddingModel for OnnxEmbeddingModel {
        fn encode(
            &self,
            batch: &[String],
            device: &DeviceProfile,
        ) -> std::result::Result<Vec<Vec<f32>>, EncodeError> {
            if !device.is_host() {
                return Err(EncodeError::Unsupported(format!(
                    "{} runs on the host CPU only, not {}",
                    self.name, device.id
                )));
            }
            batch.iter().map(|text| self.embed_one(text)).collect()
        }

        fn dimensions(&self) -> usize {
            self.dimensions
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_onnx_missing_model() {
            let result = OnnxEmbeddingModel::from_directory(Path::new("/nonexistent"));
            assert!(matches!(result, Err(ExoError::Config(_))));
        }
    }
}
