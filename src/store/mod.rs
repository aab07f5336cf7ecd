// src/store/mod.rs
//
// Seams between the orchestrator and the relational store: one trait for
// extraction, one for persistence.

pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;

use crate::errors::PipelineError;
use crate::models::{ClassificationCode, ClusterAssignment, CodeAuditRecord};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait NameSource: Send + Sync {
    /// Every classification code present in the source.
    async fn list_codes(&self) -> Result<Vec<ClassificationCode>>;

    /// Raw names for `code`, in extraction order. May be empty.
    async fn list_names(&self, code: &str) -> Result<Vec<String>>;
}

#[async_trait]
pub trait ClusterSink: Send + Sync {
    /// Persists one code's assignments together with its audit record.
    /// Either every row commits or none does.
    async fn write_code(
        &self,
        run_id: &str,
        code: &str,
        assignments: &[ClusterAssignment],
        audit: &CodeAuditRecord,
    ) -> Result<(), PipelineError>;

    /// Whether an earlier run already left an audit row for `code`.
    async fn has_audit(&self, code: &str) -> Result<bool>;
}
