// src/pipeline.rs
//
// Run orchestrator. Codes are processed strictly one after another:
// extract -> artifact -> cluster -> complete -> persist. Only a failure to
// list the codes aborts the run; everything else skips the current code.

use anyhow::Result;
use chrono::Local;
use log::{debug, error, info, warn};
use std::time::Instant;

use crate::artifact::build_artifact;
use crate::clustering::Clusterer;
use crate::completion::complete;
use crate::config::{PipelineConfig, RerunPolicy};
use crate::errors::{ClusteringError, PipelineError, QueryStage};
use crate::models::{CodeAuditRecord, CodeOutcome, CodeReport, CodeStage, RunStats};
use crate::store::{ClusterSink, NameSource};
use crate::utils::error_log::RunErrorLog;
use crate::utils::progress_config::ProgressConfig;

type StageResult<T> = std::result::Result<T, (CodeStage, PipelineError)>;

pub struct NcmClusteringPipeline<'a, S: ?Sized, W: ?Sized, C: ?Sized> {
    source: &'a S,
    sink: &'a W,
    clusterer: &'a C,
    config: &'a PipelineConfig,
    error_log: RunErrorLog,
    progress: ProgressConfig,
    run_id: String,
}

impl<'a, S, W, C> NcmClusteringPipeline<'a, S, W, C>
where
    S: NameSource + ?Sized,
    W: ClusterSink + ?Sized,
    C: Clusterer + ?Sized,
{
    pub fn new(
        source: &'a S,
        sink: &'a W,
        clusterer: &'a C,
        config: &'a PipelineConfig,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            source,
            sink,
            clusterer,
            config,
            error_log: RunErrorLog::new(config.error_log_path.clone()),
            progress: ProgressConfig {
                enabled: false,
                show_db_connection_stats: false,
            },
            run_id: run_id.into(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressConfig) -> Self {
        self.progress = progress;
        self
    }

    /// Processes every code. Returns an error only when the code list
    /// itself cannot be read.
    pub async fn run(&self) -> Result<RunStats> {
        let start = Instant::now();
        let mut stats = RunStats::new(&self.run_id);

        let mut codes = self
            .source
            .list_codes()
            .await
            .map_err(|e| PipelineError::Query {
                stage: QueryStage::ListCodes,
                cause: e,
            })?;

        if !self.config.only_codes.is_empty() {
            codes.retain(|c| self.config.only_codes.contains(c));
        }
        info!(
            "Found {} NCM codes to cluster with backend '{}' (run ID: {})",
            codes.len(),
            self.clusterer.name(),
            self.run_id
        );

        let pb = self.progress.create_code_bar(codes.len() as u64);

        for code in &codes {
            if let Some(pb) = &pb {
                pb.set_message(format!("NCM {}", code));
            }

            let outcome = self.process_code(code).await;
            stats.record(&outcome);

            if let Some(pb) = &pb {
                pb.inc(1);
            }
        }

        stats.total_processing_time = start.elapsed().as_secs_f64();
        if let Some(pb) = &pb {
            pb.finish_with_message(format!(
                "{} NCM codes processed in {:.2}s",
                stats.codes_seen, stats.total_processing_time
            ));
        }

        log_summary(&stats);
        Ok(stats)
    }

    /// Runs one code to a terminal state. Never fails: errors are logged,
    /// written to the run error log and reported in the outcome.
    pub async fn process_code(&self, code: &str) -> CodeOutcome {
        let start = Instant::now();
        info!("ncm: {} - {}", code, Local::now().to_rfc3339());

        if self.config.rerun_policy == RerunPolicy::SkipProcessed {
            match self.sink.has_audit(code).await {
                Ok(true) => {
                    info!("NCM {} already has an audit record; skipping", code);
                    return CodeOutcome::AlreadyProcessed;
                }
                Ok(false) => {}
                Err(e) => {
                    let err = PipelineError::Query {
                        stage: QueryStage::CheckAudit,
                        cause: e,
                    };
                    return self.handle_failure(code, CodeStage::Extracted, err);
                }
            }
        }

        let outcome = match self.run_stages(code, start).await {
            Ok(outcome) => outcome,
            Err((stage, err)) => self.handle_failure(code, stage, err),
        };

        info!(
            "tempo total do ncm {}: {:.3}s - {}",
            code,
            start.elapsed().as_secs_f64(),
            Local::now().to_rfc3339()
        );
        outcome
    }

    async fn run_stages(&self, code: &str, start: Instant) -> StageResult<CodeOutcome> {
        let names = self.source.list_names(code).await.map_err(|e| {
            (
                CodeStage::Extracted,
                PipelineError::Query {
                    stage: QueryStage::ListNames,
                    cause: e,
                },
            )
        })?;

        enter_stage(code, CodeStage::Extracted);

        if names.is_empty() {
            info!("NCM {} has no product names; nothing to cluster", code);
            return Ok(CodeOutcome::Empty);
        }

        let artifact_start = Instant::now();
        let artifact = build_artifact(&self.config.data_dir, code, &self.config.column_name, &names)
            .map_err(|e| {
                (
                    CodeStage::Extracted,
                    PipelineError::Artifact {
                        code: code.to_string(),
                        cause: e,
                    },
                )
            })?;
        let artifact_secs = artifact_start.elapsed().as_secs_f64();
        enter_stage(code, CodeStage::ArtifactBuilt);

        let cluster_start = Instant::now();
        let clustered = self.clusterer.cluster(&artifact, &self.config.column_name).await;
        // The working file goes away as soon as the backend is done with it.
        drop(artifact);
        let groups = clustered.map_err(|e| (CodeStage::ArtifactBuilt, PipelineError::from(e)))?;
        let cluster_secs = cluster_start.elapsed().as_secs_f64();
        enter_stage(code, CodeStage::Clustered);

        let completion = complete(&groups, &names);
        enter_stage(code, CodeStage::Assigned);
        let audit = CodeAuditRecord::new(
            code,
            names.len() as i64,
            completion.clustered_occurrences as i64,
        );
        if !audit.is_consistent() {
            warn!(
                "NCM {} does not reconcile: {} names extracted, {} occurrences clustered (delta {})",
                code, audit.total_names, audit.clustered_occurrences, audit.delta
            );
        }

        let persist_start = Instant::now();
        self.sink
            .write_code(&self.run_id, code, &completion.assignments, &audit)
            .await
            .map_err(|e| (CodeStage::Assigned, e))?;
        let persist_secs = persist_start.elapsed().as_secs_f64();
        enter_stage(code, CodeStage::Audited);

        info!(
            "NCM {}: {} names, {} groups, {} assignments ({} singletons) [artifact {:.3}s, cluster {:.3}s, insert {:.3}s]",
            code,
            names.len(),
            groups.len(),
            completion.assignments.len(),
            completion.fallback_singletons,
            artifact_secs,
            cluster_secs,
            persist_secs
        );

        Ok(CodeOutcome::Done(CodeReport {
            audit,
            groups: groups.len(),
            assignments: completion.assignments.len(),
            fallback_singletons: completion.fallback_singletons,
            artifact_secs,
            cluster_secs,
            persist_secs,
            total_secs: start.elapsed().as_secs_f64(),
        }))
    }

    fn handle_failure(&self, code: &str, stage: CodeStage, err: PipelineError) -> CodeOutcome {
        let subject = match &err {
            PipelineError::Clustering(ClusteringError::ProjectCreation { artifact, .. })
            | PipelineError::Clustering(ClusteringError::Compute { artifact, .. }) => artifact.clone(),
            _ => code.to_string(),
        };

        error!(
            "NCM {} failed after {}: {} - {}",
            code,
            stage,
            err,
            Local::now().to_rfc3339()
        );
        if let Err(log_err) = self.error_log.append(&subject, err.log_tag()) {
            error!("Could not write run error log: {:#}", log_err);
        }

        match err {
            PipelineError::Clustering(ClusteringError::ProjectCreation { .. }) => CodeOutcome::ProjectFailed,
            other => CodeOutcome::Failed {
                stage,
                reason: other.to_string(),
            },
        }
    }
}

fn enter_stage(code: &str, stage: CodeStage) {
    debug!("NCM {} -> {}", code, stage);
}

fn log_summary(stats: &RunStats) {
    info!("NCM clustering run {} finished", stats.run_id);
    info!(
        "   Codes: {} seen, {} done, {} empty, {} skipped, {} project failures, {} other failures",
        stats.codes_seen,
        stats.codes_done,
        stats.codes_empty,
        stats.codes_skipped,
        stats.codes_project_failed,
        stats.codes_failed
    );
    info!(
        "   Names: {} clustered into {} assignments ({} fallback singletons)",
        stats.total_names, stats.total_assignments, stats.fallback_singletons
    );
    if stats.codes_with_delta > 0 {
        warn!("   {} codes did not reconcile (nonzero delta)", stats.codes_with_delta);
    }
    info!(
        "tempo total: {:.3}s - {}",
        stats.total_processing_time,
        Local::now().to_rfc3339()
    );
}
