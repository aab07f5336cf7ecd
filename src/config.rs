// src/config.rs

use log::{info, warn};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_COLUMN_NAME: &str = "NOME";
pub const DEFAULT_REFINE_URL: &str = "http://127.0.0.1:3333";

pub const DEFAULT_CODES_QUERY: &str = "
    SELECT DISTINCT cod_ncm::text AS cod_ncm
    FROM public.product_item
    WHERE cod_ncm IS NOT NULL
    ORDER BY 1";

pub const DEFAULT_NAMES_QUERY: &str = "
    SELECT product_name
    FROM public.product_item
    WHERE cod_ncm::text = $1 AND product_name IS NOT NULL
    ORDER BY id";

/// Which clustering implementation serves the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterBackend {
    OpenRefine,
    Local,
}

impl ClusterBackend {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "openrefine" | "refine" => Some(ClusterBackend::OpenRefine),
            "local" => Some(ClusterBackend::Local),
            _ => None,
        }
    }
}

/// What to do with a code that already has an audit row from an earlier run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RerunPolicy {
    /// Process it again; assignment rows are inserted a second time.
    Append,
    SkipProcessed,
}

impl RerunPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "append" => Some(RerunPolicy::Append),
            "skip-processed" | "skip_processed" | "skip" => Some(RerunPolicy::SkipProcessed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub error_log_path: PathBuf,
    pub column_name: String,
    pub codes_query: String,
    pub names_query: String,
    pub backend: ClusterBackend,
    pub refine_url: String,
    /// `None` leaves backend requests unbounded.
    pub refine_timeout: Option<Duration>,
    pub ngram_size: usize,
    pub rerun_policy: RerunPolicy,
    /// Restricts the run to these codes when non-empty.
    pub only_codes: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            error_log_path: PathBuf::from("log/log.txt"),
            column_name: DEFAULT_COLUMN_NAME.to_string(),
            codes_query: DEFAULT_CODES_QUERY.to_string(),
            names_query: DEFAULT_NAMES_QUERY.to_string(),
            backend: ClusterBackend::OpenRefine,
            refine_url: DEFAULT_REFINE_URL.to_string(),
            refine_timeout: Some(Duration::from_secs(600)),
            ngram_size: 1,
            rerun_policy: RerunPolicy::Append,
            only_codes: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let backend = match env::var("CLUSTER_BACKEND") {
            Ok(raw) => ClusterBackend::parse(&raw).unwrap_or_else(|| {
                warn!("Unknown CLUSTER_BACKEND '{}', using openrefine", raw);
                ClusterBackend::OpenRefine
            }),
            Err(_) => defaults.backend,
        };

        let rerun_policy = match env::var("RERUN_POLICY") {
            Ok(raw) => RerunPolicy::parse(&raw).unwrap_or_else(|| {
                warn!("Unknown RERUN_POLICY '{}', using append", raw);
                RerunPolicy::Append
            }),
            Err(_) => defaults.rerun_policy,
        };

        let timeout_secs = env::var("OPENREFINE_TIMEOUT_SECS")
            .unwrap_or_else(|_| "600".to_string())
            .parse::<u64>()
            .unwrap_or(600);

        let ngram_size = env::var("NGRAM_SIZE")
            .unwrap_or_else(|_| "1".to_string())
            .parse::<usize>()
            .unwrap_or(1)
            .max(1);

        Self {
            data_dir: env::var("NCM_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            error_log_path: env::var("NCM_ERROR_LOG")
                .map(PathBuf::from)
                .unwrap_or(defaults.error_log_path),
            column_name: env::var("NCM_COLUMN_NAME").unwrap_or(defaults.column_name),
            codes_query: env::var("NCM_CODES_QUERY").unwrap_or(defaults.codes_query),
            names_query: env::var("NCM_NAMES_QUERY").unwrap_or(defaults.names_query),
            backend,
            refine_url: env::var("OPENREFINE_URL").unwrap_or(defaults.refine_url),
            refine_timeout: if timeout_secs == 0 {
                None
            } else {
                Some(Duration::from_secs(timeout_secs))
            },
            ngram_size,
            rerun_policy,
            only_codes: Vec::new(),
        }
    }

    /// Log the current configuration
    pub fn log_config(&self) {
        info!("Clustering backend: {:?} (ngram-size={})", self.backend, self.ngram_size);
        if self.backend == ClusterBackend::OpenRefine {
            info!(
                "   OpenRefine at {} (timeout: {})",
                self.refine_url,
                self.refine_timeout
                    .map(|t| format!("{}s", t.as_secs()))
                    .unwrap_or_else(|| "none".to_string())
            );
        }
        info!("   Artifacts dir: {}", self.data_dir.display());
        info!("   Error log: {}", self.error_log_path.display());
        info!("   Column: {}", self.column_name);
        info!("   Re-run policy: {:?}", self.rerun_policy);
        if !self.only_codes.is_empty() {
            info!("   Restricted to NCM codes: {:?}", self.only_codes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.column_name, "NOME");
        assert_eq!(config.backend, ClusterBackend::OpenRefine);
        assert_eq!(config.ngram_size, 1);
        assert_eq!(config.rerun_policy, RerunPolicy::Append);
        assert_eq!(config.refine_timeout, Some(Duration::from_secs(600)));
        assert!(config.names_query.contains("$1"));
    }

    #[test]
    fn test_env_config() {
        env::set_var("CLUSTER_BACKEND", "local");
        env::set_var("RERUN_POLICY", "skip-processed");
        env::set_var("OPENREFINE_TIMEOUT_SECS", "0");
        env::set_var("NGRAM_SIZE", "2");
        env::set_var("NCM_DATA_DIR", "/tmp/ncm-artifacts");

        let config = PipelineConfig::from_env();
        assert_eq!(config.backend, ClusterBackend::Local);
        assert_eq!(config.rerun_policy, RerunPolicy::SkipProcessed);
        assert_eq!(config.refine_timeout, None);
        assert_eq!(config.ngram_size, 2);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/ncm-artifacts"));

        // Clean up
        env::remove_var("CLUSTER_BACKEND");
        env::remove_var("RERUN_POLICY");
        env::remove_var("OPENREFINE_TIMEOUT_SECS");
        env::remove_var("NGRAM_SIZE");
        env::remove_var("NCM_DATA_DIR");
    }

    #[test]
    fn test_parse_enums() {
        assert_eq!(ClusterBackend::parse(" OpenRefine "), Some(ClusterBackend::OpenRefine));
        assert_eq!(ClusterBackend::parse("cloud"), None);
        assert_eq!(RerunPolicy::parse("skip"), Some(RerunPolicy::SkipProcessed));
        assert_eq!(RerunPolicy::parse("upsert"), None);
    }
}
