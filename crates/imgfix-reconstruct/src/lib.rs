//! Recovery pipeline for truncated `primary_image` cells: analyze the target
//! store, plan replacements from the authoritative store, then execute the
//! plan behind a dry-run and a confirmation gate, or emit it as an offline
//! SQL batch.

use std::path::PathBuf;

use anyhow::Context;
use imgfix_core::{UrlRules, DEFAULT_NARROW_WIDTH};
use imgfix_storage::{SqlTargetStore, SqliteAuthoritativeStore, StoreError, TableSpec};
use thiserror::Error;

pub mod analyzer;
pub mod executor;
pub mod offline;
pub mod planner;
pub mod report;

pub use analyzer::{
    analyze_authoritative, analyze_rows, AnalysisReport, AuthoritativeSummary, ClassCounts,
    TruncatedSample,
};
pub use executor::{
    verify_target, AutoConfirm, CommitReport, ConfirmationGate, DeclineConfirm, DryRunPreview,
    ExecutionReport, ExecutionState, Executor, PreviewSample, RowWriteError, ShortWrite,
    StdinConfirm, VerificationReport, VerificationSample,
};
pub use offline::{emit_plan_sql, parse_plan_sql, write_plan_file, OfflinePlan};
pub use planner::{build_plan, plan_from_stores, validate_replacement, Plan, RejectReason, Rejection};
pub use report::{render_analysis, render_preview, render_verification, write_run_report};

pub const CRATE_NAME: &str = "imgfix-reconstruct";

/// Knobs for a single reconstruction run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconstructConfig {
    pub narrow_width: usize,
    pub progress_interval: usize,
    pub sample_size: usize,
    pub verify_sample_size: usize,
    pub batch_size: usize,
}

impl Default for ReconstructConfig {
    fn default() -> Self {
        Self {
            narrow_width: DEFAULT_NARROW_WIDTH,
            progress_interval: 100,
            sample_size: 3,
            verify_sample_size: 5,
            batch_size: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImgfixConfig {
    pub target_database_url: String,
    pub authoritative_db_path: PathBuf,
    pub table: TableSpec,
    pub reconstruct: ReconstructConfig,
    pub rules_path: PathBuf,
    pub reports_dir: PathBuf,
    pub web_port: u16,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl ImgfixConfig {
    pub fn from_env() -> Self {
        let defaults = ReconstructConfig::default();
        let table = TableSpec::default();
        Self {
            target_database_url: env_or(
                "TARGET_DATABASE_URL",
                "mysql://root@localhost:3306/crm",
            ),
            authoritative_db_path: PathBuf::from(env_or("AUTHORITATIVE_DB_PATH", "./db.sqlite3")),
            table: TableSpec {
                table: env_or("IMGFIX_TABLE", &table.table),
                id_column: env_or("IMGFIX_ID_COLUMN", &table.id_column),
                image_column: env_or("IMGFIX_IMAGE_COLUMN", &table.image_column),
            },
            reconstruct: ReconstructConfig {
                narrow_width: env_parse("IMGFIX_NARROW_WIDTH", defaults.narrow_width),
                // Zero would stall progress logging and batching alike.
                progress_interval: env_parse("IMGFIX_PROGRESS_INTERVAL", defaults.progress_interval)
                    .max(1),
                sample_size: env_parse("IMGFIX_SAMPLE_SIZE", defaults.sample_size),
                verify_sample_size: env_parse(
                    "IMGFIX_VERIFY_SAMPLE_SIZE",
                    defaults.verify_sample_size,
                ),
                batch_size: env_parse("IMGFIX_BATCH_SIZE", defaults.batch_size).max(1),
            },
            rules_path: PathBuf::from(env_or("IMGFIX_RULES_PATH", "rules/image_urls.yaml")),
            reports_dir: PathBuf::from(env_or("IMGFIX_REPORTS_DIR", "./reports")),
            web_port: env_parse("IMGFIX_WEB_PORT", 8000),
        }
    }

    pub fn load_rules(&self) -> anyhow::Result<UrlRules> {
        UrlRules::load_or_default(&self.rules_path)
            .with_context(|| format!("loading url rules from {}", self.rules_path.display()))
    }

    pub async fn connect_target(&self) -> Result<SqlTargetStore, ReconstructError> {
        SqlTargetStore::connect(&self.target_database_url, self.table.clone(), 4)
            .await
            .map_err(|err| match err {
                StoreError::InvalidIdentifier(_) => ReconstructError::Store(err),
                other => ReconstructError::Environment(format!(
                    "cannot reach target store: {other}"
                )),
            })
    }

    pub async fn open_authoritative(&self) -> Result<SqliteAuthoritativeStore, ReconstructError> {
        SqliteAuthoritativeStore::open(&self.authoritative_db_path, self.table.clone())
            .await
            .map_err(|err| {
                ReconstructError::Environment(format!("cannot open authoritative store: {err}"))
            })
    }
}

#[derive(Debug, Error)]
pub enum ReconstructError {
    #[error("environment error: {0}")]
    Environment(String),
    #[error(
        "target column keeps {observed:?} of {requested} probe characters; widen the column before committing"
    )]
    Schema {
        requested: usize,
        observed: Option<usize>,
    },
    #[error("confirmation declined; no rows were written")]
    ConfirmationDeclined,
    #[error("cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        from: ExecutionState,
        to: ExecutionState,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("offline plan line {line}: {message}")]
    PlanFormat { line: usize, message: String },
}

impl ReconstructError {
    /// Process exit status for a run that stopped on this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::ConfirmationDeclined => 0,
            _ => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_narrow_column() {
        let cfg = ReconstructConfig::default();
        assert_eq!(cfg.narrow_width, 191);
        assert_eq!(cfg.progress_interval, 100);
        assert_eq!(cfg.sample_size, 3);
        assert_eq!(cfg.batch_size, 1);
    }

    #[test]
    fn exit_codes() {
        assert_eq!(ReconstructError::ConfirmationDeclined.exit_code(), 0);
        assert_eq!(
            ReconstructError::Schema {
                requested: 764,
                observed: Some(191)
            }
            .exit_code(),
            2
        );
        assert_eq!(ReconstructError::Environment("x".into()).exit_code(), 2);
    }
}
