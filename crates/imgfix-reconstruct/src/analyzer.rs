//! Read-only census of a store's image column.

use imgfix_core::{char_len, classify_cell, descriptor_count, CellClass};
use imgfix_storage::ImageRow;
use serde::Serialize;

use crate::planner::validate_replacement;

/// Characters of a truncated cell kept in a sample.
const SAMPLE_HEAD_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ClassCounts {
    pub empty: u64,
    pub intact: u64,
    pub truncated: u64,
    pub malformed: u64,
}

impl ClassCounts {
    fn record(&mut self, class: CellClass) {
        match class {
            CellClass::Empty => self.empty += 1,
            CellClass::Intact => self.intact += 1,
            CellClass::Truncated => self.truncated += 1,
            CellClass::Malformed => self.malformed += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TruncatedSample {
    pub property_id: String,
    pub length: usize,
    pub head: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub width: usize,
    pub total_rows: u64,
    /// Rows whose cell is neither null, empty nor `[]`.
    pub with_images: u64,
    pub at_width: u64,
    pub average_length: f64,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub classes: ClassCounts,
    /// Rows holding more than one image descriptor.
    pub multi_image: u64,
    pub samples: Vec<TruncatedSample>,
}

impl AnalysisReport {
    /// Every stored cell stops at the limit: the column itself is cutting writes.
    pub fn systemic_truncation(&self) -> bool {
        self.at_width > 0 && self.max_length == Some(self.width)
    }
}

pub fn analyze_rows(rows: &[ImageRow], width: usize, sample_size: usize) -> AnalysisReport {
    let mut classes = ClassCounts::default();
    let mut lengths = Vec::new();
    let mut multi_image = 0u64;
    let mut samples = Vec::new();

    for row in rows {
        let cell = row.primary_image.as_deref();
        let class = classify_cell(cell, width);
        classes.record(class);
        if class == CellClass::Empty {
            continue;
        }
        let len = cell.map(char_len).unwrap_or(0);
        lengths.push(len);
        if descriptor_count(cell).is_some_and(|n| n > 1) {
            multi_image += 1;
        }
        if class == CellClass::Truncated && samples.len() < sample_size {
            samples.push(TruncatedSample {
                property_id: row.property_id.clone(),
                length: len,
                head: cell
                    .map(|c| c.chars().take(SAMPLE_HEAD_CHARS).collect())
                    .unwrap_or_default(),
            });
        }
    }

    let average_length = if lengths.is_empty() {
        0.0
    } else {
        lengths.iter().sum::<usize>() as f64 / lengths.len() as f64
    };

    AnalysisReport {
        width,
        total_rows: rows.len() as u64,
        with_images: lengths.len() as u64,
        at_width: lengths.iter().filter(|&&len| len == width).count() as u64,
        average_length,
        min_length: lengths.iter().copied().min(),
        max_length: lengths.iter().copied().max(),
        classes,
        multi_image,
        samples,
    }
}

/// What the authoritative store can offer as replacements.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthoritativeSummary {
    pub total_rows: u64,
    pub with_images: u64,
    pub longer_than_width: u64,
    /// Rows that would pass replacement validation.
    pub valid_candidates: u64,
    pub average_length: f64,
    pub max_length: Option<usize>,
}

pub fn analyze_authoritative(rows: &[ImageRow], width: usize) -> AuthoritativeSummary {
    let lengths = rows
        .iter()
        .filter_map(|r| r.primary_image.as_deref())
        .filter(|c| !c.is_empty() && *c != "[]")
        .map(char_len)
        .collect::<Vec<_>>();
    let valid_candidates = rows
        .iter()
        .filter(|r| validate_replacement(r.primary_image.as_deref(), width).is_ok())
        .count();

    AuthoritativeSummary {
        total_rows: rows.len() as u64,
        with_images: lengths.len() as u64,
        longer_than_width: lengths.iter().filter(|&&len| len > width).count() as u64,
        valid_candidates: valid_candidates as u64,
        average_length: if lengths.is_empty() {
            0.0
        } else {
            lengths.iter().sum::<usize>() as f64 / lengths.len() as f64
        },
        max_length: lengths.iter().copied().max(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: usize = 40;

    fn cut_array() -> String {
        let full = r#"[{"fileUrl":"/properties/a.jpg"},{"fileUrl":"/properties/b.jpg"}]"#;
        full.chars().take(W).collect()
    }

    #[test]
    fn counts_classes_and_samples_truncated_rows() {
        let rows = vec![
            ImageRow::new("P1", Some(&cut_array())),
            ImageRow::new("P2", Some(r#"[{"fileUrl":"/a.jpg"}]"#)),
            ImageRow::new("P3", Some("[]")),
            ImageRow::new("P4", None),
            ImageRow::new(
                "P5",
                Some(r#"[{"fileUrl":"/a.jpg"},{"fileUrl":"/b.jpg"},{"fileUrl":"/c.jpg"}]"#),
            ),
        ];
        let report = analyze_rows(&rows, W, 3);

        assert_eq!(report.total_rows, 5);
        assert_eq!(report.with_images, 3);
        assert_eq!(report.at_width, 1);
        assert_eq!(
            report.classes,
            ClassCounts {
                empty: 2,
                intact: 2,
                truncated: 1,
                malformed: 0
            }
        );
        assert_eq!(report.multi_image, 1);
        assert_eq!(report.samples.len(), 1);
        assert_eq!(report.samples[0].property_id, "P1");
        assert_eq!(report.samples[0].length, W);
        assert!(!report.systemic_truncation());
    }

    #[test]
    fn all_rows_at_width_signal_systemic_truncation() {
        let rows = vec![
            ImageRow::new("P1", Some(&cut_array())),
            ImageRow::new("P2", Some(&cut_array())),
        ];
        let report = analyze_rows(&rows, W, 1);
        assert!(report.systemic_truncation());
        assert_eq!(report.samples.len(), 1);
        assert_eq!(report.average_length, W as f64);
    }

    #[test]
    fn authoritative_summary_counts_valid_candidates() {
        let long = format!(r#"[{{"fileUrl":"/properties/{}.jpg"}}]"#, "z".repeat(W));
        let rows = vec![
            ImageRow::new("P1", Some(&long)),
            ImageRow::new("P2", Some("[]")),
            ImageRow::new("P3", Some(&format!("[{}", "x".repeat(W)))),
        ];
        let summary = analyze_authoritative(&rows, W);
        assert_eq!(summary.total_rows, 3);
        assert_eq!(summary.with_images, 2);
        assert_eq!(summary.longer_than_width, 2);
        assert_eq!(summary.valid_candidates, 1);
    }
}
