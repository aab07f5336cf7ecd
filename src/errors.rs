// src/errors.rs

use std::fmt;
use thiserror::Error;

use crate::models::ClassificationCode;

/// Read query that failed. Picks both the message and the error-log tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStage {
    ListCodes,
    ListNames,
    CheckAudit,
}

impl QueryStage {
    pub fn log_tag(&self) -> &'static str {
        match self {
            QueryStage::ListCodes => "list_codes_fail",
            QueryStage::ListNames => "list_names_fail",
            QueryStage::CheckAudit => "check_audit_fail",
        }
    }
}

impl fmt::Display for QueryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QueryStage::ListCodes => "listing NCM codes",
            QueryStage::ListNames => "listing product names",
            QueryStage::CheckAudit => "checking earlier runs",
        })
    }
}

/// Failures raised by a clustering backend for one working artifact.
#[derive(Debug, Error)]
pub enum ClusteringError {
    /// The backend was unreachable or rejected the artifact.
    #[error("failed to create clustering project for {artifact}: {cause:#}")]
    ProjectCreation {
        artifact: String,
        cause: anyhow::Error,
    },
    /// The project existed but clustering itself failed.
    #[error("failed to compute clusters for {artifact}: {cause:#}")]
    Compute {
        artifact: String,
        cause: anyhow::Error,
    },
}

/// Stage-tagged failures seen by the orchestrator. The variant decides
/// whether the run aborts or only the current code is skipped.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("query failed while {stage}: {cause:#}")]
    Query {
        stage: QueryStage,
        cause: anyhow::Error,
    },
    #[error("could not build artifact for NCM {code}: {cause:#}")]
    Artifact {
        code: ClassificationCode,
        cause: anyhow::Error,
    },
    #[error(transparent)]
    Clustering(#[from] ClusteringError),
    #[error("persistence failed for NCM {code} executing `{statement}`: {cause:#}")]
    Persistence {
        code: ClassificationCode,
        statement: String,
        cause: anyhow::Error,
    },
}

impl PipelineError {
    /// Tag written to the run error log for this failure.
    pub fn log_tag(&self) -> &'static str {
        match self {
            PipelineError::Query { stage, .. } => stage.log_tag(),
            PipelineError::Artifact { .. } => "artifact_fail",
            PipelineError::Clustering(ClusteringError::ProjectCreation { .. }) => "create_project_fail",
            PipelineError::Clustering(ClusteringError::Compute { .. }) => "cluster_fail",
            PipelineError::Persistence { .. } => "persist_fail",
        }
    }
}
