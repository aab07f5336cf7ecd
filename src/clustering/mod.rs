// src/clustering/mod.rs

pub mod fingerprint;
pub mod refine;

use async_trait::async_trait;

use crate::artifact::WorkingArtifact;
use crate::errors::ClusteringError;
use crate::models::ClusterGroup;

pub use fingerprint::LocalFingerprintClusterer;
pub use refine::RefineClusterer;

/// Near-duplicate clustering over one working artifact.
///
/// Implementations group values whose n-gram fingerprint matches and return
/// only groups of two or more distinct values; values alone in their bin are
/// left out and picked up later by the completion step.
#[async_trait]
pub trait Clusterer: Send + Sync {
    async fn cluster(
        &self,
        artifact: &WorkingArtifact,
        column_name: &str,
    ) -> Result<Vec<ClusterGroup>, ClusteringError>;

    fn name(&self) -> &'static str;
}
