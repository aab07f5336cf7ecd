// src/store/memory.rs
//
// In-process store. Serves as the sink for dry runs and as a full
// source + sink in tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{ClusterSink, NameSource};
use crate::errors::PipelineError;
use crate::models::{ClassificationCode, ClusterAssignment, CodeAuditRecord, InsertionMode};

/// Assignment row as the relational table would hold it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredAssignment {
    /// Surrogate cluster id, assigned like a sequence would.
    pub id: i64,
    pub run_id: String,
    pub code: ClassificationCode,
    pub parent: String,
    pub child: String,
    pub mode: InsertionMode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredAudit {
    pub run_id: String,
    pub record: CodeAuditRecord,
}

#[derive(Debug, Default)]
struct Tables {
    next_id: i64,
    assignments: Vec<StoredAssignment>,
    audits: Vec<StoredAudit>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    codes: Vec<ClassificationCode>,
    names: HashMap<ClassificationCode, Vec<String>>,
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a code and its names, keeping insertion order for `list_codes`.
    pub fn with_code(mut self, code: &str, names: &[&str]) -> Self {
        if !self.names.contains_key(code) {
            self.codes.push(code.to_string());
        }
        self.names
            .insert(code.to_string(), names.iter().map(|s| s.to_string()).collect());
        self
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))
    }

    pub fn assignments(&self) -> Vec<StoredAssignment> {
        self.tables().map(|t| t.assignments.clone()).unwrap_or_default()
    }

    pub fn assignments_for(&self, code: &str) -> Vec<StoredAssignment> {
        self.assignments()
            .into_iter()
            .filter(|a| a.code == code)
            .collect()
    }

    pub fn audits(&self) -> Vec<StoredAudit> {
        self.tables().map(|t| t.audits.clone()).unwrap_or_default()
    }

    pub fn audit_for(&self, code: &str) -> Option<CodeAuditRecord> {
        self.audits()
            .into_iter()
            .find(|a| a.record.code == code)
            .map(|a| a.record)
    }
}

#[async_trait]
impl NameSource for MemoryStore {
    async fn list_codes(&self) -> Result<Vec<ClassificationCode>> {
        Ok(self.codes.clone())
    }

    async fn list_names(&self, code: &str) -> Result<Vec<String>> {
        Ok(self.names.get(code).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl ClusterSink for MemoryStore {
    async fn write_code(
        &self,
        run_id: &str,
        code: &str,
        assignments: &[ClusterAssignment],
        audit: &CodeAuditRecord,
    ) -> Result<(), PipelineError> {
        // Checked before touching the tables so a rejected write leaves no rows.
        if audit.code != code {
            return Err(PipelineError::Persistence {
                code: code.to_string(),
                statement: "insert audit".to_string(),
                cause: anyhow!("audit record belongs to NCM {}", audit.code),
            });
        }

        let mut tables = self.tables().map_err(|e| PipelineError::Persistence {
            code: code.to_string(),
            statement: "insert assignments".to_string(),
            cause: e,
        })?;
        for assignment in assignments {
            tables.next_id += 1;
            let id = tables.next_id;
            tables.assignments.push(StoredAssignment {
                id,
                run_id: run_id.to_string(),
                code: code.to_string(),
                parent: assignment.parent.clone(),
                child: assignment.child.clone(),
                mode: assignment.mode,
            });
        }
        tables.audits.push(StoredAudit {
            run_id: run_id.to_string(),
            record: audit.clone(),
        });
        Ok(())
    }

    async fn has_audit(&self, code: &str) -> Result<bool> {
        Ok(self.tables()?.audits.iter().any(|a| a.record.code == code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_source_preserves_order() {
        let store = MemoryStore::new()
            .with_code("2002", &[])
            .with_code("1001", &["b", "a", "b"]);
        assert_eq!(store.list_codes().await.unwrap(), vec!["2002", "1001"]);
        assert_eq!(store.list_names("1001").await.unwrap(), vec!["b", "a", "b"]);
        assert!(store.list_names("9999").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sink_assigns_sequential_ids() {
        let store = MemoryStore::new();
        let rows = vec![
            ClusterAssignment::new("a", "a", InsertionMode::FallbackSingleton),
            ClusterAssignment::new("b", "b", InsertionMode::FallbackSingleton),
        ];
        assert!(!store.has_audit("1").await.unwrap());

        let audit = CodeAuditRecord::new("1", 2, 2);
        store.write_code("run", "1", &rows, &audit).await.unwrap();
        store.write_code("run", "1", &rows, &audit).await.unwrap();

        let ids: Vec<i64> = store.assignments().iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert!(store.has_audit("1").await.unwrap());
        assert_eq!(store.audit_for("1").unwrap().delta, 0);
    }

    #[tokio::test]
    async fn test_rejected_write_leaves_no_rows() {
        let store = MemoryStore::new();
        let rows = vec![ClusterAssignment::new("a", "a", InsertionMode::FallbackSingleton)];
        let err = store
            .write_code("run", "1", &rows, &CodeAuditRecord::new("2", 1, 1))
            .await
            .unwrap_err();

        assert_eq!(err.log_tag(), "persist_fail");
        assert!(store.assignments().is_empty());
        assert!(store.audits().is_empty());
    }
}
