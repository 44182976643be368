//! sqlx-backed stores: the target column lives in MySQL/MariaDB (or SQLite for
//! rehearsal), the authoritative copy in a local SQLite file.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{install_default_drivers, AnyPoolOptions, AnyRow};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{AnyPool, Row, SqlitePool};
use tracing::{debug, info, instrument, warn};

use crate::{
    probe_value, AuthoritativeStore, ColumnProbe, ImageRow, LengthCensus, RowUpdate, StoreError,
    TableSpec, TargetStore, WriteOutcome,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    MySql,
    Sqlite,
}

impl Dialect {
    pub fn from_url(url: &str) -> Result<Self, StoreError> {
        let scheme = url.split(':').next().unwrap_or_default();
        match scheme {
            "mysql" | "mariadb" => Ok(Self::MySql),
            "sqlite" => Ok(Self::Sqlite),
            _ => Err(StoreError::UnsupportedUrl(scheme.to_string())),
        }
    }

    /// Character-length function; both count characters, not bytes, on text.
    pub fn length_fn(self) -> &'static str {
        match self {
            Self::MySql => "CHAR_LENGTH",
            Self::Sqlite => "LENGTH",
        }
    }
}

/// SQL text for one table, built once after identifier validation.
#[derive(Debug, Clone)]
struct Statements {
    get: String,
    scan: String,
    length: String,
    guarded_update: String,
    overwrite: String,
    first_id: String,
    census: String,
    longest_over: String,
    widen: Option<String>,
}

impl Statements {
    fn new(spec: &TableSpec, dialect: Dialect) -> Self {
        let TableSpec {
            table: t,
            id_column: id,
            image_column: img,
        } = spec;
        let len = dialect.length_fn();
        Self {
            get: format!("SELECT {id} AS property_id, {img} AS primary_image FROM {t} WHERE {id} = ?"),
            scan: format!("SELECT {id} AS property_id, {img} AS primary_image FROM {t} ORDER BY {id}"),
            length: format!("SELECT {len}({img}) AS len FROM {t} WHERE {id} = ?"),
            guarded_update: format!("UPDATE {t} SET {img} = ? WHERE {id} = ? AND {len}({img}) = ?"),
            overwrite: format!("UPDATE {t} SET {img} = ? WHERE {id} = ?"),
            first_id: format!("SELECT {id} AS property_id FROM {t} ORDER BY {id} LIMIT 1"),
            census: format!(
                "SELECT COUNT(*) AS total_rows, \
                 COUNT(CASE WHEN {len}({img}) = ? THEN 1 END) AS at_width, \
                 COUNT(CASE WHEN {len}({img}) > ? THEN 1 END) AS over_width \
                 FROM {t}"
            ),
            longest_over: format!(
                "SELECT {id} AS property_id, {img} AS primary_image FROM {t} \
                 WHERE {len}({img}) > ? ORDER BY {len}({img}) DESC, {id} LIMIT ?"
            ),
            widen: match dialect {
                Dialect::MySql => Some(format!("ALTER TABLE {t} MODIFY {img} LONGTEXT NULL")),
                Dialect::Sqlite => None,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqlTargetStore {
    pool: AnyPool,
    dialect: Dialect,
    sql: Statements,
}

impl SqlTargetStore {
    // Never record the DSN: it carries credentials.
    #[instrument(skip(database_url, spec))]
    pub async fn connect(
        database_url: &str,
        spec: TableSpec,
        max_connections: u32,
    ) -> Result<Self, StoreError> {
        let dialect = Dialect::from_url(database_url)?;
        spec.validate()?;
        install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        info!(?dialect, table = %spec.table, "connected to target store");
        Ok(Self::from_pool(pool, dialect, &spec))
    }

    pub fn from_pool(pool: AnyPool, dialect: Dialect, spec: &TableSpec) -> Self {
        Self {
            pool,
            dialect,
            sql: Statements::new(spec, dialect),
        }
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }
}

fn any_image_row(row: &AnyRow) -> Result<ImageRow, StoreError> {
    Ok(ImageRow {
        property_id: row.try_get("property_id")?,
        primary_image: row.try_get("primary_image")?,
    })
}

fn any_count(row: &AnyRow, column: &str) -> Result<u64, StoreError> {
    let value: i64 = row.try_get(column)?;
    Ok(value.max(0) as u64)
}

#[async_trait]
impl TargetStore for SqlTargetStore {
    async fn get(&self, property_id: &str) -> Result<Option<ImageRow>, StoreError> {
        sqlx::query(&self.sql.get)
            .bind(property_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(any_image_row)
            .transpose()
    }

    async fn scan(&self) -> Result<Vec<ImageRow>, StoreError> {
        let rows = sqlx::query(&self.sql.scan).fetch_all(&self.pool).await?;
        debug!(rows = rows.len(), "scanned target store");
        rows.iter().map(any_image_row).collect()
    }

    async fn image_length(&self, property_id: &str) -> Result<Option<usize>, StoreError> {
        let row = sqlx::query(&self.sql.length)
            .bind(property_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let len: Option<i64> = row.try_get("len")?;
        Ok(len.map(|l| l.max(0) as usize))
    }

    async fn apply_guarded(
        &self,
        batch: &[RowUpdate],
        width: usize,
    ) -> Result<Vec<WriteOutcome>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut outcomes = Vec::with_capacity(batch.len());
        for update in batch {
            let result = sqlx::query(&self.sql.guarded_update)
                .bind(update.replacement.as_str())
                .bind(update.property_id.as_str())
                .bind(width as i64)
                .execute(&mut *tx)
                .await;
            outcomes.push(match result {
                Ok(done) if done.rows_affected() > 0 => WriteOutcome::Updated,
                Ok(_) => WriteOutcome::Unchanged,
                Err(err) => {
                    warn!(property_id = %update.property_id, %err, "guarded update failed");
                    WriteOutcome::Failed(err.to_string())
                }
            });
        }
        tx.commit().await?;
        Ok(outcomes)
    }

    async fn length_census(&self, width: usize) -> Result<LengthCensus, StoreError> {
        let row = sqlx::query(&self.sql.census)
            .bind(width as i64)
            .bind(width as i64)
            .fetch_one(&self.pool)
            .await?;
        Ok(LengthCensus {
            total_rows: any_count(&row, "total_rows")?,
            at_width: any_count(&row, "at_width")?,
            over_width: any_count(&row, "over_width")?,
        })
    }

    async fn longest_over(&self, width: usize, limit: usize) -> Result<Vec<ImageRow>, StoreError> {
        let rows = sqlx::query(&self.sql.longest_over)
            .bind(width as i64)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(any_image_row).collect()
    }

    async fn probe_column_width(&self, probe_len: usize) -> Result<Option<ColumnProbe>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let first = sqlx::query(&self.sql.first_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(first) = first else {
            tx.rollback().await?;
            return Ok(None);
        };
        let property_id: String = first.try_get("property_id")?;

        let value = probe_value(probe_len);
        let write = sqlx::query(&self.sql.overwrite)
            .bind(value.as_str())
            .bind(property_id.as_str())
            .execute(&mut *tx)
            .await;

        let probe = match write {
            Ok(_) => {
                let row = sqlx::query(&self.sql.length)
                    .bind(property_id.as_str())
                    .fetch_one(&mut *tx)
                    .await?;
                let observed: Option<i64> = row.try_get("len")?;
                ColumnProbe {
                    requested: probe_len,
                    observed: observed.map(|l| l.max(0) as usize),
                    write_error: None,
                }
            }
            Err(err) => ColumnProbe {
                requested: probe_len,
                observed: None,
                write_error: Some(err.to_string()),
            },
        };
        tx.rollback().await?;
        debug!(%property_id, ?probe, "column width probe rolled back");
        Ok(Some(probe))
    }

    async fn widen_column(&self) -> Result<(), StoreError> {
        match &self.sql.widen {
            Some(sql) => {
                sqlx::query(sql).execute(&self.pool).await?;
                info!("image column widened to LONGTEXT");
            }
            None => info!("sqlite text columns are unbounded; nothing to widen"),
        }
        Ok(())
    }
}

/// Read-only view of the local SQLite copy holding complete cells.
#[derive(Debug, Clone)]
pub struct SqliteAuthoritativeStore {
    pool: SqlitePool,
    get_sql: String,
    scan_sql: String,
}

impl SqliteAuthoritativeStore {
    pub async fn open(path: &Path, spec: TableSpec) -> Result<Self, StoreError> {
        if !path.exists() {
            return Err(StoreError::MissingDatabase(path.to_path_buf()));
        }
        spec.validate()?;
        let options = SqliteConnectOptions::new().filename(path).read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        info!(path = %path.display(), "opened authoritative store");
        Ok(Self::from_pool(pool, &spec))
    }

    pub fn from_pool(pool: SqlitePool, spec: &TableSpec) -> Self {
        let TableSpec {
            table: t,
            id_column: id,
            image_column: img,
        } = spec;
        Self {
            pool,
            get_sql: format!(
                "SELECT {id} AS property_id, {img} AS primary_image FROM {t} WHERE {id} = ?"
            ),
            scan_sql: format!(
                "SELECT {id} AS property_id, {img} AS primary_image FROM {t} ORDER BY {id}"
            ),
        }
    }
}

fn sqlite_image_row(row: &SqliteRow) -> Result<ImageRow, StoreError> {
    Ok(ImageRow {
        property_id: row.try_get("property_id")?,
        primary_image: row.try_get("primary_image")?,
    })
}

#[async_trait]
impl AuthoritativeStore for SqliteAuthoritativeStore {
    async fn get(&self, property_id: &str) -> Result<Option<ImageRow>, StoreError> {
        sqlx::query(&self.get_sql)
            .bind(property_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(sqlite_image_row)
            .transpose()
    }

    async fn scan(&self) -> Result<Vec<ImageRow>, StoreError> {
        let rows = sqlx::query(&self.scan_sql).fetch_all(&self.pool).await?;
        debug!(rows = rows.len(), "scanned authoritative store");
        rows.iter().map(sqlite_image_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CREATE: &str =
        "CREATE TABLE properties_property (property_id TEXT PRIMARY KEY, primary_image TEXT)";

    async fn sqlite_target(rows: &[(&str, Option<&str>)]) -> SqlTargetStore {
        let store = SqlTargetStore::connect("sqlite::memory:", TableSpec::default(), 1)
            .await
            .expect("connect");
        sqlx::query(CREATE).execute(store.pool()).await.expect("create");
        for (id, cell) in rows {
            sqlx::query("INSERT INTO properties_property (property_id, primary_image) VALUES (?, ?)")
                .bind(*id)
                .bind(*cell)
                .execute(store.pool())
                .await
                .expect("insert");
        }
        store
    }

    #[test]
    fn dialect_from_url_scheme() {
        assert_eq!(Dialect::from_url("mysql://u:p@h/db").unwrap(), Dialect::MySql);
        assert_eq!(Dialect::from_url("mariadb://h/db").unwrap(), Dialect::MySql);
        assert_eq!(Dialect::from_url("sqlite::memory:").unwrap(), Dialect::Sqlite);
        assert!(matches!(
            Dialect::from_url("postgres://h/db"),
            Err(StoreError::UnsupportedUrl(_))
        ));
    }

    #[tokio::test]
    async fn guarded_update_and_census_on_sqlite() {
        let at_width = "a".repeat(12);
        let store = sqlite_target(&[
            ("P1", Some(at_width.as_str())),
            ("P2", Some("short")),
            ("P3", None),
        ])
        .await;

        let census = store.length_census(12).await.expect("census");
        assert_eq!(census.total_rows, 3);
        assert_eq!(census.at_width, 1);
        assert_eq!(census.over_width, 0);

        let batch = vec![
            RowUpdate {
                property_id: "P1".into(),
                replacement: "b".repeat(30),
            },
            RowUpdate {
                property_id: "P2".into(),
                replacement: "c".repeat(30),
            },
        ];
        let outcomes = store.apply_guarded(&batch, 12).await.expect("apply");
        assert_eq!(outcomes, vec![WriteOutcome::Updated, WriteOutcome::Unchanged]);
        assert_eq!(store.image_length("P1").await.expect("len"), Some(30));
        assert_eq!(store.image_length("P3").await.expect("len"), None);
        assert_eq!(store.image_length("missing").await.expect("len"), None);

        let rerun = store.apply_guarded(&batch, 12).await.expect("apply");
        assert_eq!(rerun, vec![WriteOutcome::Unchanged, WriteOutcome::Unchanged]);

        let longest = store.longest_over(12, 5).await.expect("longest");
        assert_eq!(longest.len(), 1);
        assert_eq!(longest[0].property_id, "P1");
    }

    #[tokio::test]
    async fn probe_rolls_back_and_sqlite_never_truncates() {
        let store = sqlite_target(&[("P1", Some("[]"))]).await;
        let probe = store.probe_column_width(764).await.expect("probe").expect("row");
        assert!(!probe.truncates());
        assert_eq!(
            TargetStore::get(&store, "P1").await.expect("get").expect("row").primary_image.as_deref(),
            Some("[]")
        );

        let empty = sqlite_target(&[]).await;
        assert!(empty.probe_column_width(764).await.expect("probe").is_none());
    }

    #[tokio::test]
    async fn scan_is_ordered_by_id() {
        let store = sqlite_target(&[("B", Some("[]")), ("A", None), ("C", Some("x"))]).await;
        let ids = TargetStore::scan(&store)
            .await
            .expect("scan")
            .into_iter()
            .map(|r| r.property_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn authoritative_store_reads_sqlite() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("pool");
        sqlx::query(CREATE).execute(&pool).await.expect("create");
        sqlx::query("INSERT INTO properties_property VALUES ('P9', '[{\"fileUrl\":\"/x.jpg\"}]')")
            .execute(&pool)
            .await
            .expect("insert");

        let store = SqliteAuthoritativeStore::from_pool(pool, &TableSpec::default());
        let row = store.get("P9").await.expect("get").expect("row");
        assert_eq!(row.primary_image.as_deref(), Some("[{\"fileUrl\":\"/x.jpg\"}]"));
        assert!(store.get("nope").await.expect("get").is_none());
        assert_eq!(store.scan().await.expect("scan").len(), 1);
    }

    #[tokio::test]
    async fn missing_authoritative_file_is_an_environment_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = SqliteAuthoritativeStore::open(&dir.path().join("db.sqlite3"), TableSpec::default())
            .await
            .expect_err("missing");
        assert!(matches!(err, StoreError::MissingDatabase(_)));
    }
}
