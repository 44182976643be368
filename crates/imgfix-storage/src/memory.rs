//! In-process store used for offline rehearsal and tests. Optionally emulates
//! a narrow column by cutting every write to a fixed character width.

use std::collections::{BTreeMap, BTreeSet};
use std::io;

use async_trait::async_trait;
use imgfix_core::char_len;
use tokio::sync::Mutex;

use crate::{
    probe_value, AuthoritativeStore, ColumnProbe, ImageRow, LengthCensus, RowUpdate, StoreError,
    TargetStore, WriteOutcome,
};

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: BTreeMap<String, Option<String>>,
    column_width: Option<usize>,
    failing_ids: BTreeSet<String>,
    failing_batches: usize,
    census_fails: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows<I, K, V>(rows: I) -> Self
    where
        I: IntoIterator<Item = (K, Option<V>)>,
        K: Into<String>,
        V: Into<String>,
    {
        let rows = rows
            .into_iter()
            .map(|(k, v)| (k.into(), v.map(Into::into)))
            .collect();
        Self {
            state: Mutex::new(MemoryState {
                rows,
                ..MemoryState::default()
            }),
        }
    }

    /// Emulate a variable-width column: later writes are silently cut.
    pub fn with_column_width(mut self, width: usize) -> Self {
        self.state.get_mut().column_width = Some(width);
        self
    }

    pub async fn insert(&self, property_id: &str, cell: Option<&str>) {
        let mut state = self.state.lock().await;
        let value = cell.map(|c| cut(c, state.column_width));
        state.rows.insert(property_id.to_string(), value);
    }

    /// Make writes to `property_id` fail, as a lost connection or a lock timeout would.
    pub async fn fail_writes_for(&self, property_id: &str) {
        self.state
            .lock()
            .await
            .failing_ids
            .insert(property_id.to_string());
    }

    /// Reject the next `apply_guarded` call outright, as a dropped connection would.
    pub async fn fail_next_batch(&self) {
        self.state.lock().await.failing_batches += 1;
    }

    /// Make every later `length_census` call fail.
    pub async fn fail_census(&self) {
        self.state.lock().await.census_fails = true;
    }

    pub async fn snapshot(&self) -> BTreeMap<String, Option<String>> {
        self.state.lock().await.rows.clone()
    }
}

fn cut(value: &str, width: Option<usize>) -> String {
    match width {
        Some(w) => value.chars().take(w).collect(),
        None => value.to_string(),
    }
}

fn to_row((id, cell): (&String, &Option<String>)) -> ImageRow {
    ImageRow {
        property_id: id.clone(),
        primary_image: cell.clone(),
    }
}

#[async_trait]
impl AuthoritativeStore for MemoryStore {
    async fn get(&self, property_id: &str) -> Result<Option<ImageRow>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.rows.get_key_value(property_id).map(to_row))
    }

    async fn scan(&self) -> Result<Vec<ImageRow>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.rows.iter().map(to_row).collect())
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn get(&self, property_id: &str) -> Result<Option<ImageRow>, StoreError> {
        AuthoritativeStore::get(self, property_id).await
    }

    async fn scan(&self) -> Result<Vec<ImageRow>, StoreError> {
        AuthoritativeStore::scan(self).await
    }

    async fn image_length(&self, property_id: &str) -> Result<Option<usize>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .rows
            .get(property_id)
            .and_then(|cell| cell.as_deref())
            .map(char_len))
    }

    async fn apply_guarded(
        &self,
        batch: &[RowUpdate],
        width: usize,
    ) -> Result<Vec<WriteOutcome>, StoreError> {
        let mut state = self.state.lock().await;
        if state.failing_batches > 0 {
            state.failing_batches -= 1;
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "simulated lost connection",
            )));
        }
        let column_width = state.column_width;
        let mut outcomes = Vec::with_capacity(batch.len());
        for update in batch {
            if state.failing_ids.contains(&update.property_id) {
                outcomes.push(WriteOutcome::Failed(format!(
                    "simulated write failure for {}",
                    update.property_id
                )));
                continue;
            }
            match state.rows.get_mut(&update.property_id) {
                Some(Some(current)) if char_len(current) == width => {
                    *current = cut(&update.replacement, column_width);
                    outcomes.push(WriteOutcome::Updated);
                }
                _ => outcomes.push(WriteOutcome::Unchanged),
            }
        }
        Ok(outcomes)
    }

    async fn length_census(&self, width: usize) -> Result<LengthCensus, StoreError> {
        let state = self.state.lock().await;
        if state.census_fails {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "simulated lost connection",
            )));
        }
        let mut census = LengthCensus {
            total_rows: state.rows.len() as u64,
            ..LengthCensus::default()
        };
        for len in state.rows.values().flatten().map(|c| char_len(c)) {
            if len == width {
                census.at_width += 1;
            } else if len > width {
                census.over_width += 1;
            }
        }
        Ok(census)
    }

    async fn longest_over(&self, width: usize, limit: usize) -> Result<Vec<ImageRow>, StoreError> {
        let state = self.state.lock().await;
        let mut rows = state
            .rows
            .iter()
            .filter(|(_, cell)| cell.as_deref().is_some_and(|c| char_len(c) > width))
            .map(to_row)
            .collect::<Vec<_>>();
        rows.sort_by_key(|r| {
            std::cmp::Reverse(r.primary_image.as_deref().map(char_len).unwrap_or(0))
        });
        rows.truncate(limit);
        Ok(rows)
    }

    async fn probe_column_width(&self, probe_len: usize) -> Result<Option<ColumnProbe>, StoreError> {
        let state = self.state.lock().await;
        if state.rows.is_empty() {
            return Ok(None);
        }
        // Nothing is written: the read-back is what the column would keep.
        let observed = char_len(&cut(&probe_value(probe_len), state.column_width));
        Ok(Some(ColumnProbe {
            requested: probe_len,
            observed: Some(observed),
            write_error: None,
        }))
    }

    async fn widen_column(&self) -> Result<(), StoreError> {
        self.state.lock().await.column_width = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at_width(width: usize) -> String {
        "x".repeat(width)
    }

    #[tokio::test]
    async fn guarded_update_only_touches_rows_at_width() {
        let store = MemoryStore::from_rows([
            ("P1", Some(at_width(10))),
            ("P2", Some("short".to_string())),
            ("P3", None),
        ]);
        let batch = ["P1", "P2", "P3", "P4"]
            .into_iter()
            .map(|id| RowUpdate {
                property_id: id.to_string(),
                replacement: "y".repeat(25),
            })
            .collect::<Vec<_>>();

        let outcomes = store.apply_guarded(&batch, 10).await.expect("apply");
        assert_eq!(
            outcomes,
            vec![
                WriteOutcome::Updated,
                WriteOutcome::Unchanged,
                WriteOutcome::Unchanged,
                WriteOutcome::Unchanged
            ]
        );
        assert_eq!(store.image_length("P1").await.expect("len"), Some(25));

        let again = store.apply_guarded(&batch[..1], 10).await.expect("apply");
        assert_eq!(again, vec![WriteOutcome::Unchanged]);
    }

    #[tokio::test]
    async fn narrow_column_cuts_writes_and_probe_reports_it() {
        let store = MemoryStore::from_rows([("P1", Some(at_width(10)))]).with_column_width(10);
        let probe = store.probe_column_width(40).await.expect("probe").expect("row");
        assert!(probe.truncates());

        store
            .apply_guarded(
                &[RowUpdate {
                    property_id: "P1".into(),
                    replacement: "z".repeat(40),
                }],
                10,
            )
            .await
            .expect("apply");
        assert_eq!(store.image_length("P1").await.expect("len"), Some(10));

        store.widen_column().await.expect("widen");
        let probe = store.probe_column_width(40).await.expect("probe").expect("row");
        assert!(!probe.truncates());
    }

    #[tokio::test]
    async fn injected_failures_surface_as_errors() {
        let store = MemoryStore::from_rows([("P1", Some(at_width(10)))]);
        let batch = [RowUpdate {
            property_id: "P1".into(),
            replacement: "z".repeat(20),
        }];
        store.fail_next_batch().await;
        assert!(matches!(
            store.apply_guarded(&batch, 10).await,
            Err(StoreError::Io(_))
        ));
        assert_eq!(store.image_length("P1").await.expect("len"), Some(10));
        assert_eq!(
            store.apply_guarded(&batch, 10).await.expect("apply"),
            vec![WriteOutcome::Updated]
        );

        store.fail_census().await;
        assert!(store.length_census(10).await.is_err());
    }

    #[tokio::test]
    async fn census_and_longest_over() {
        let store = MemoryStore::from_rows([
            ("A", Some(at_width(5))),
            ("B", Some(at_width(9))),
            ("C", Some(at_width(7))),
            ("D", None),
        ]);
        let census = store.length_census(5).await.expect("census");
        assert_eq!(
            census,
            LengthCensus {
                total_rows: 4,
                at_width: 1,
                over_width: 2
            }
        );
        let longest = store.longest_over(5, 1).await.expect("longest");
        assert_eq!(longest.len(), 1);
        assert_eq!(longest[0].property_id, "B");
    }
}
