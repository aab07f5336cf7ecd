// src/models.rs

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque NCM classification code. Kept as text so both numeric and
/// zero-padded codes survive the round trip through the store.
pub type ClassificationCode = String;

/// Insertion mode written alongside every cluster assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InsertionMode {
    /// Membership reported by the clustering backend.
    ServiceDerived,
    /// Name the backend did not place in any group; clustered with itself.
    FallbackSingleton,
}

impl InsertionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InsertionMode::ServiceDerived => "CLUSTER INICIAL",
            InsertionMode::FallbackSingleton => "CLUSTER UNITARIO",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "CLUSTER INICIAL" => Some(InsertionMode::ServiceDerived),
            "CLUSTER UNITARIO" => Some(InsertionMode::FallbackSingleton),
            _ => None,
        }
    }
}

impl fmt::Display for InsertionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One distinct value inside a cluster and how many rows carried it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub value: String,
    pub count: u64,
}

impl ClusterMember {
    pub fn new(value: impl Into<String>, count: u64) -> Self {
        Self {
            value: value.into(),
            count,
        }
    }
}

/// Ordered members of one cluster; the first member is the representative.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterGroup {
    pub members: Vec<ClusterMember>,
}

impl ClusterGroup {
    pub fn new(members: Vec<ClusterMember>) -> Self {
        Self { members }
    }

    pub fn representative(&self) -> Option<&ClusterMember> {
        self.members.first()
    }

    pub fn total_count(&self) -> u64 {
        self.members.iter().map(|m| m.count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterAssignment {
    pub parent: String,
    pub child: String,
    pub mode: InsertionMode,
}

impl ClusterAssignment {
    pub fn new(parent: impl Into<String>, child: impl Into<String>, mode: InsertionMode) -> Self {
        Self {
            parent: parent.into(),
            child: child.into(),
            mode,
        }
    }
}

/// Per-code reconciliation row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeAuditRecord {
    pub code: ClassificationCode,
    pub total_names: i64,
    pub clustered_occurrences: i64,
    pub delta: i64,
}

impl CodeAuditRecord {
    pub fn new(code: impl Into<String>, total_names: i64, clustered_occurrences: i64) -> Self {
        Self {
            code: code.into(),
            total_names,
            clustered_occurrences,
            delta: total_names - clustered_occurrences,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.delta == 0
    }
}

/// Stage a code reached before it finished or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeStage {
    Extracted,
    ArtifactBuilt,
    Clustered,
    Assigned,
    Audited,
}

impl CodeStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodeStage::Extracted => "EXTRACTED",
            CodeStage::ArtifactBuilt => "ARTIFACT_BUILT",
            CodeStage::Clustered => "CLUSTERED",
            CodeStage::Assigned => "ASSIGNED",
            CodeStage::Audited => "AUDITED",
        }
    }
}

impl fmt::Display for CodeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal state of one code's iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum CodeOutcome {
    /// No names for the code; nothing built or written.
    Empty,
    /// Skipped because an earlier run already audited it.
    AlreadyProcessed,
    /// Clustering backend refused or could not create the project.
    ProjectFailed,
    /// Any other skip-class failure, tagged with the last stage reached.
    Failed { stage: CodeStage, reason: String },
    Done(CodeReport),
}

/// Timings and counts for a code that made it to DONE.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeReport {
    pub audit: CodeAuditRecord,
    pub groups: usize,
    pub assignments: usize,
    pub fallback_singletons: usize,
    pub artifact_secs: f64,
    pub cluster_secs: f64,
    pub persist_secs: f64,
    pub total_secs: f64,
}

/// Run-level counters printed at the end of the pipeline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStats {
    pub run_id: String,
    pub codes_seen: usize,
    pub codes_done: usize,
    pub codes_empty: usize,
    pub codes_project_failed: usize,
    pub codes_failed: usize,
    pub codes_skipped: usize,
    pub total_names: i64,
    pub total_assignments: usize,
    pub fallback_singletons: usize,
    pub codes_with_delta: usize,
    pub total_processing_time: f64,
}

impl RunStats {
    pub fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            ..Default::default()
        }
    }

    pub fn record(&mut self, outcome: &CodeOutcome) {
        self.codes_seen += 1;
        match outcome {
            CodeOutcome::Empty => self.codes_empty += 1,
            CodeOutcome::AlreadyProcessed => self.codes_skipped += 1,
            CodeOutcome::ProjectFailed => self.codes_project_failed += 1,
            CodeOutcome::Failed { .. } => self.codes_failed += 1,
            CodeOutcome::Done(report) => {
                self.codes_done += 1;
                self.total_names += report.audit.total_names;
                self.total_assignments += report.assignments;
                self.fallback_singletons += report.fallback_singletons;
                if !report.audit.is_consistent() {
                    self.codes_with_delta += 1;
                }
            }
        }
    }
}
