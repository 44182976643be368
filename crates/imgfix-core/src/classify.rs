//! Truncation classification of a single `primary_image` cell.

use serde::{Deserialize, Serialize};

use crate::deriver::file_url_tokens;
use crate::descriptor::parse_descriptors;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellClass {
    Empty,
    Intact,
    Truncated,
    Malformed,
}

impl CellClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Intact => "intact",
            Self::Truncated => "truncated",
            Self::Malformed => "malformed",
        }
    }
}

/// Length in characters, matching `CHAR_LENGTH` on the target column.
pub fn char_len(cell: &str) -> usize {
    cell.chars().count()
}

/// Classify a cell against the narrow-width limit `width`.
///
/// A cell of exactly `width` characters that does not end in `]` is truncated
/// by definition. Shorter cells are intact whatever their content; a cell at
/// or over the limit must be an absolute URL or valid JSON to count as intact.
pub fn classify_cell(cell: Option<&str>, width: usize) -> CellClass {
    let cell = match cell {
        None | Some("") | Some("[]") => return CellClass::Empty,
        Some(c) => c,
    };

    let len = char_len(cell);
    if len < width {
        return CellClass::Intact;
    }
    if len == width && !cell.ends_with(']') {
        return CellClass::Truncated;
    }
    if (len > width && cell.starts_with("http"))
        || serde_json::from_str::<serde_json::Value>(cell).is_ok()
    {
        CellClass::Intact
    } else {
        CellClass::Malformed
    }
}

/// Number of descriptors a cell holds: the structured count when it parses,
/// otherwise the count of recoverable `fileUrl` tokens. `None` for empty cells
/// and non-array content.
pub fn descriptor_count(cell: Option<&str>) -> Option<usize> {
    let cell = cell.filter(|c| c.starts_with('['))?;
    match parse_descriptors(cell) {
        Ok(items) => Some(items.len()),
        Err(_) => Some(file_url_tokens(cell).count()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: usize = 191;

    fn padded_array(len: usize) -> String {
        // `[{"fileUrl":"/x/<pad>"}]` with total length `len`.
        let frame = r#"[{"fileUrl":"/x/"}]"#.len();
        format!(r#"[{{"fileUrl":"/x/{}"}}]"#, "a".repeat(len - frame))
    }

    #[test]
    fn empty_variants() {
        assert_eq!(classify_cell(None, W), CellClass::Empty);
        assert_eq!(classify_cell(Some(""), W), CellClass::Empty);
        assert_eq!(classify_cell(Some("[]"), W), CellClass::Empty);
    }

    #[test]
    fn exactly_width_without_closing_bracket_is_truncated() {
        let cut: String = padded_array(300).chars().take(W).collect();
        assert_eq!(classify_cell(Some(&cut), W), CellClass::Truncated);
    }

    #[test]
    fn exactly_width_valid_json_is_intact() {
        let cell = padded_array(W);
        assert_eq!(char_len(&cell), W);
        assert_eq!(classify_cell(Some(&cell), W), CellClass::Intact);
    }

    #[test]
    fn exactly_width_with_bracket_but_invalid_is_malformed() {
        let mut cell = padded_array(W);
        cell.replace_range(0..1, "{");
        assert_eq!(classify_cell(Some(&cell), W), CellClass::Malformed);
    }

    #[test]
    fn one_below_width_is_intact_whatever_the_content() {
        let cut: String = padded_array(300).chars().take(W - 1).collect();
        assert_eq!(classify_cell(Some(&cut), W), CellClass::Intact);
    }

    #[test]
    fn one_over_width_parse_failure_is_malformed() {
        let cut: String = padded_array(300).chars().take(W + 1).collect();
        assert_eq!(classify_cell(Some(&cut), W), CellClass::Malformed);
        let long = padded_array(W + 1);
        assert_eq!(classify_cell(Some(&long), W), CellClass::Intact);
    }

    #[test]
    fn long_direct_url_is_intact() {
        let url = format!("https://cdn.example/{}.jpg", "p".repeat(W));
        assert_eq!(classify_cell(Some(&url), W), CellClass::Intact);
    }

    #[test]
    fn width_counts_characters_not_bytes() {
        let cell = format!(r#"[{{"fileUrl":"/x/{}"#, "é".repeat(W));
        let cut: String = cell.chars().take(W).collect();
        assert!(cut.len() > W);
        assert_eq!(classify_cell(Some(&cut), W), CellClass::Truncated);
    }

    #[test]
    fn descriptor_count_uses_fallback_for_truncated_cells() {
        let cell = r#"[{"fileUrl":"/a.jpg"},{"fileUrl":"/b.jpg"},{"fileUrl":"/c"#;
        assert_eq!(descriptor_count(Some(cell)), Some(2));
        assert_eq!(descriptor_count(Some(r#"[{"id":"1"},{"id":"2"},{"id":"3"}]"#)), Some(3));
        assert_eq!(descriptor_count(Some("https://x")), None);
        assert_eq!(descriptor_count(None), None);
    }
}
