// src/store/postgres.rs

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use tokio_postgres::types::ToSql;

use super::{ClusterSink, NameSource};
use crate::errors::PipelineError;
use crate::models::{ClassificationCode, ClusterAssignment, CodeAuditRecord};
use crate::utils::db_connect::{get_pool_status, PgPool};

// Configuration
const BATCH_SIZE_DB_OPS: usize = 500;

const INSERT_ASSIGNMENTS_PREFIX: &str = "INSERT INTO ncm_clustering.product_name_cluster \
    (pipeline_run_id, cod_ncm, cluster_parent, cluster_child, insertion_mode) VALUES";

const INSERT_AUDIT_SQL: &str = "
    INSERT INTO ncm_clustering.cluster_run_log
        (pipeline_run_id, cod_ncm, total_rows, clustered_rows, difference_rows)
    VALUES ($1, $2, $3, $4, $5)";

const AUDIT_EXISTS_SQL: &str = "
    SELECT EXISTS (SELECT 1 FROM ncm_clustering.cluster_run_log WHERE cod_ncm = $1)";

/// Store backed by the run's single PostgreSQL connection.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    codes_query: String,
    names_query: String,
}

impl PgStore {
    pub fn new(pool: PgPool, codes_query: impl Into<String>, names_query: impl Into<String>) -> Self {
        Self {
            pool,
            codes_query: codes_query.into(),
            names_query: names_query.into(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Releases the connection. Consuming `self` makes a second close
    /// impossible.
    pub fn close(self) {
        let (connections, idle) = get_pool_status(&self.pool);
        drop(self.pool);
        info!(
            "Database connection closed ({} open, {} idle at shutdown)",
            connections, idle
        );
    }
}

fn persistence_error(code: &str, statement: &str, cause: anyhow::Error) -> PipelineError {
    PipelineError::Persistence {
        code: code.to_string(),
        statement: statement.trim().to_string(),
        cause,
    }
}

/// Builds one multi-row INSERT for `rows`, numbering placeholders from $1.
fn build_assignment_insert(
    run_id: &str,
    code: &str,
    rows: &[ClusterAssignment],
) -> (String, Vec<Box<dyn ToSql + Sync + Send>>) {
    let mut values_clause_parts = Vec::with_capacity(rows.len());
    let mut params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::with_capacity(rows.len() * 5);
    let mut i = 1;

    for row in rows {
        values_clause_parts.push(format!("(${}, ${}, ${}, ${}, ${})", i, i + 1, i + 2, i + 3, i + 4));
        params.push(Box::new(run_id.to_string()));
        params.push(Box::new(code.to_string()));
        params.push(Box::new(row.parent.clone()));
        params.push(Box::new(row.child.clone()));
        params.push(Box::new(row.mode.as_str()));
        i += 5;
    }

    (
        format!("{} {}", INSERT_ASSIGNMENTS_PREFIX, values_clause_parts.join(", ")),
        params,
    )
}

#[async_trait]
impl NameSource for PgStore {
    async fn list_codes(&self) -> Result<Vec<ClassificationCode>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for list_codes")?;
        let rows = conn
            .query(self.codes_query.as_str(), &[])
            .await
            .with_context(|| format!("Failed to execute: {}", self.codes_query.trim()))?;

        let mut codes = Vec::with_capacity(rows.len());
        for row in rows {
            let code: String = row.try_get(0).context("NCM code column is not text")?;
            codes.push(code);
        }
        Ok(codes)
    }

    async fn list_names(&self, code: &str) -> Result<Vec<String>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for list_names")?;
        let rows = conn
            .query(self.names_query.as_str(), &[&code])
            .await
            .with_context(|| format!("Failed to execute names query for NCM {}", code))?;

        let mut names = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get(0).context("Product name column is not text")?;
            names.push(name);
        }
        debug!("Fetched {} names for NCM {}", names.len(), code);
        Ok(names)
    }
}

#[async_trait]
impl ClusterSink for PgStore {
    async fn write_code(
        &self,
        run_id: &str,
        code: &str,
        assignments: &[ClusterAssignment],
        audit: &CodeAuditRecord,
    ) -> Result<(), PipelineError> {
        let mut client = self
            .pool
            .get()
            .await
            .map_err(|e| persistence_error(code, "BEGIN", e.into()))?;
        let transaction = client
            .transaction()
            .await
            .map_err(|e| persistence_error(code, "BEGIN", e.into()))?;

        // Any early return drops the transaction uncommitted, which rolls
        // back every chunk written so far.
        for chunk in assignments.chunks(BATCH_SIZE_DB_OPS) {
            let (sql, params) = build_assignment_insert(run_id, code, chunk);
            let params_slice: Vec<&(dyn ToSql + Sync)> = params
                .iter()
                .map(|p| p.as_ref() as &(dyn ToSql + Sync))
                .collect();
            transaction
                .execute(sql.as_str(), &params_slice[..])
                .await
                .map_err(|e| persistence_error(code, INSERT_ASSIGNMENTS_PREFIX, e.into()))?;
        }

        transaction
            .execute(
                INSERT_AUDIT_SQL,
                &[
                    &run_id,
                    &audit.code,
                    &audit.total_names,
                    &audit.clustered_occurrences,
                    &audit.delta,
                ],
            )
            .await
            .map_err(|e| persistence_error(code, INSERT_AUDIT_SQL, e.into()))?;

        transaction
            .commit()
            .await
            .map_err(|e| persistence_error(code, "COMMIT", e.into()))?;

        debug!(
            "Inserted {} cluster assignments and audit record for NCM {}",
            assignments.len(),
            code
        );
        Ok(())
    }

    async fn has_audit(&self, code: &str) -> Result<bool> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for has_audit")?;
        let row = conn
            .query_one(AUDIT_EXISTS_SQL, &[&code])
            .await
            .with_context(|| format!("Failed to check audit rows for NCM {}", code))?;
        Ok(row.get(0))
    }
}
