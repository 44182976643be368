//! Store contracts for the authoritative and target `primary_image` columns,
//! plus SQL-backed, in-memory and plan-file implementations.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

pub mod memory;
pub mod plan_file;
pub mod sql;

pub use memory::MemoryStore;
pub use plan_file::{sha256_hex, write_atomic};
pub use sql::{Dialect, SqlTargetStore, SqliteAuthoritativeStore};

pub const CRATE_NAME: &str = "imgfix-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sql error: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("authoritative database not found: {}", .0.display())]
    MissingDatabase(PathBuf),
    #[error("unsupported database url: {0}")]
    UnsupportedUrl(String),
    #[error("invalid sql identifier: {0:?}")]
    InvalidIdentifier(String),
}

/// A `(property_id, primary_image)` pair as read from either store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageRow {
    pub property_id: String,
    pub primary_image: Option<String>,
}

impl ImageRow {
    pub fn new(property_id: impl Into<String>, primary_image: Option<&str>) -> Self {
        Self {
            property_id: property_id.into(),
            primary_image: primary_image.map(ToString::to_string),
        }
    }
}

/// Table and column names the stores address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSpec {
    pub table: String,
    pub id_column: String,
    pub image_column: String,
}

impl Default for TableSpec {
    fn default() -> Self {
        Self {
            table: "properties_property".to_string(),
            id_column: "property_id".to_string(),
            image_column: "primary_image".to_string(),
        }
    }
}

impl TableSpec {
    /// Identifiers are spliced into SQL text, so only `[A-Za-z0-9_]` is accepted.
    pub fn validate(&self) -> Result<(), StoreError> {
        for ident in [&self.table, &self.id_column, &self.image_column] {
            let ok = !ident.is_empty()
                && ident
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !ok {
                return Err(StoreError::InvalidIdentifier(ident.clone()));
            }
        }
        Ok(())
    }
}

/// One conditional replacement: applied only while the stored value is still
/// exactly at the narrow width.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowUpdate {
    pub property_id: String,
    pub replacement: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum WriteOutcome {
    Updated,
    /// The length guard matched nothing: the row changed or vanished since planning.
    Unchanged,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LengthCensus {
    pub total_rows: u64,
    pub at_width: u64,
    pub over_width: u64,
}

/// Result of writing a known-long value and reading its length back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnProbe {
    pub requested: usize,
    pub observed: Option<usize>,
    pub write_error: Option<String>,
}

impl ColumnProbe {
    pub fn truncates(&self) -> bool {
        self.write_error.is_some() || self.observed.map_or(true, |len| len < self.requested)
    }
}

/// Read-only source of complete cells.
#[async_trait]
pub trait AuthoritativeStore: Send + Sync {
    async fn get(&self, property_id: &str) -> Result<Option<ImageRow>, StoreError>;

    /// Every row, ordered by property id.
    async fn scan(&self) -> Result<Vec<ImageRow>, StoreError>;
}

/// The store whose image column may hold truncated cells.
#[async_trait]
pub trait TargetStore: Send + Sync {
    async fn get(&self, property_id: &str) -> Result<Option<ImageRow>, StoreError>;

    /// Every row, ordered by property id.
    async fn scan(&self) -> Result<Vec<ImageRow>, StoreError>;

    /// Character length of the stored cell; `None` when the row is missing or null.
    async fn image_length(&self, property_id: &str) -> Result<Option<usize>, StoreError>;

    /// Apply a batch under one commit boundary. Each update is guarded by
    /// `length(image) = width`. Statement failures are reported per row; an
    /// `Err` means the batch as a whole did not commit.
    async fn apply_guarded(
        &self,
        batch: &[RowUpdate],
        width: usize,
    ) -> Result<Vec<WriteOutcome>, StoreError>;

    async fn length_census(&self, width: usize) -> Result<LengthCensus, StoreError>;

    /// Up to `limit` rows longer than `width`, longest first.
    async fn longest_over(&self, width: usize, limit: usize) -> Result<Vec<ImageRow>, StoreError>;

    /// Write a `probe_len`-character value to an existing row, read it back and
    /// roll back. `None` when the table has no row to probe.
    async fn probe_column_width(&self, probe_len: usize) -> Result<Option<ColumnProbe>, StoreError>;

    /// Alter the image column to an unbounded text type.
    async fn widen_column(&self) -> Result<(), StoreError>;
}

/// Probe payload: a JSON array literal of exactly `len` characters (min 4).
pub fn probe_value(len: usize) -> String {
    format!("[\"{}\"]", "p".repeat(len.saturating_sub(4)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_spec_rejects_injection() {
        assert!(TableSpec::default().validate().is_ok());
        let bad = TableSpec {
            table: "properties; DROP TABLE x".into(),
            ..TableSpec::default()
        };
        assert!(matches!(bad.validate(), Err(StoreError::InvalidIdentifier(_))));
    }

    #[test]
    fn probe_detects_short_readback_and_write_errors() {
        let ok = ColumnProbe {
            requested: 764,
            observed: Some(764),
            write_error: None,
        };
        assert!(!ok.truncates());
        let cut = ColumnProbe {
            observed: Some(191),
            ..ok.clone()
        };
        assert!(cut.truncates());
        let rejected = ColumnProbe {
            observed: None,
            write_error: Some("Data too long".into()),
            ..ok
        };
        assert!(rejected.truncates());
        assert_eq!(probe_value(764).chars().count(), 764);
    }
}
