//! Exo Vector crate - device-aware embedding, indexing and retrieval.
//!
//! Provides compute device discovery and memory monitoring, a bounded staging
//! area, the text chunker, a batch embedding engine with one-hop CPU fallback,
//! a vector index with exact and clustered search, a retriever, the worker-pool
//! scheduler, and the `HybridPipeline` that ties them together.

pub mod chunker;
pub mod device;
pub mod embedding;
pub mod engine;
pub mod index;
pub mod monitor;
pub mod pipeline;
pub mod scheduler;
pub mod search;
pub mod staging;

pub use chunker::{clean_text, Chunker};
pub use device::{
    AcceleratorInfo, AcceleratorRuntime, DeviceProfiler, MockAccelerators, NoAccelerators,
    NvidiaSmiRuntime,
};
#[cfg(feature = "onnx")]
pub use embedding::OnnxEmbeddingModel;
pub use embedding::{EmbeddingModel, EncodeError, HashEmbedding};
pub use engine::{BatchEmbedding, EmbedFailure, EmbedStats, EmbeddingEngine, EngineStats};
pub use index::{IndexEntry, IndexStore, SearchHit, Topology};
pub use monitor::{FixedMemory, HostMemorySource, ResourceMonitor, SysinfoMemory};
pub use pipeline::{collect_input_files, HybridPipeline, IndexSummary};
pub use scheduler::{Scheduler, TaskHandle};
pub use search::{RetrievalResult, ResultSummary, Retriever};
pub use staging::{ScopedRegion, StagingArea};
