// src/lib.rs
pub mod artifact;
pub mod clustering;
pub mod completion;
pub mod config;
pub mod errors;
pub mod models;
pub mod pipeline;
pub mod store;
pub mod utils;

// Re-export common types for easier access
pub use clustering::{Clusterer, LocalFingerprintClusterer, RefineClusterer};
pub use config::PipelineConfig;
pub use models::{ClusterAssignment, ClusterGroup, ClusterMember, CodeAuditRecord, InsertionMode};
pub use pipeline::NcmClusteringPipeline;
pub use store::{ClusterSink, MemoryStore, NameSource, PgStore};
