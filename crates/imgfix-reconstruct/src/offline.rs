//! Offline mode: render a [`Plan`] as a MySQL batch an operator can review and
//! apply by hand, and read such a batch back.
//!
//! The file starts with `-- key: value` header lines. The `sha256` header is
//! the digest of everything after the header, so an edited batch is refused.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use imgfix_storage::{sha256_hex, write_atomic, RowUpdate, TableSpec};
use tracing::info;

use crate::planner::Plan;
use crate::ReconstructError;

const TITLE: &str = "-- imgfix offline reconstruction batch";
const STATEMENT: &str = "imgfix_update";
const ROW_PREFIX: &str = "SET @imgfix_id = ";
const VALUE_SEPARATOR: &str = ", @imgfix_value = ";
const ROW_SUFFIX: &str = "; EXECUTE imgfix_update USING @imgfix_value, @imgfix_id;";

/// Rows recovered from a batch file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflinePlan {
    pub width: usize,
    pub generated_at: Option<DateTime<Utc>>,
    pub updates: Vec<RowUpdate>,
}

/// Quote `value` as a MySQL string literal.
fn sql_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            '\x1a' => out.push_str("\\Z"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Parse a literal at the start of `input`; returns it and the remainder.
fn parse_literal(input: &str) -> Result<(String, &str), String> {
    let mut chars = input.char_indices();
    match chars.next() {
        Some((_, '\'')) => {}
        _ => return Err("expected a quoted literal".to_string()),
    }
    let mut out = String::new();
    while let Some((idx, c)) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 'r')) => out.push('\r'),
                Some((_, '0')) => out.push('\0'),
                Some((_, 'Z')) => out.push('\x1a'),
                Some((_, other)) => out.push(other),
                None => return Err("dangling escape".to_string()),
            },
            '\'' => {
                let rest = &input[idx + 1..];
                if !rest.starts_with('\'') {
                    return Ok((out, rest));
                }
                // `''` is an escaped quote.
                chars.next();
                out.push('\'');
            }
            c => out.push(c),
        }
    }
    Err("unterminated literal".to_string())
}

fn census_query(spec: &TableSpec, width: usize) -> String {
    let TableSpec {
        table: t,
        image_column: img,
        ..
    } = spec;
    format!(
        "SELECT COUNT(*) AS total_rows, \
         COUNT(CASE WHEN CHAR_LENGTH({img}) = {width} THEN 1 END) AS still_truncated, \
         COUNT(CASE WHEN CHAR_LENGTH({img}) > {width} THEN 1 END) AS now_complete, \
         MAX(CHAR_LENGTH({img})) AS max_length FROM {t};"
    )
}

/// Render `plan` as a self-verifying batch. Progress comments are placed
/// every `progress_interval` rows.
pub fn emit_plan_sql(
    plan: &Plan,
    spec: &TableSpec,
    progress_interval: usize,
    generated_at: DateTime<Utc>,
) -> String {
    let TableSpec {
        table: t,
        id_column: id,
        image_column: img,
    } = spec;
    let width = plan.width;
    let total = plan.updates.len();
    let interval = progress_interval.max(1);

    let mut body = String::new();
    let _ = writeln!(body, "{}", census_query(spec, width));
    let _ = writeln!(
        body,
        "PREPARE {STATEMENT} FROM 'UPDATE {t} SET {img} = ? WHERE {id} = ? AND CHAR_LENGTH({img}) = {width}';"
    );
    for (idx, update) in plan.updates.iter().enumerate() {
        let _ = writeln!(
            body,
            "{ROW_PREFIX}{}{VALUE_SEPARATOR}{}{ROW_SUFFIX}",
            sql_literal(&update.property_id),
            sql_literal(&update.replacement)
        );
        if (idx + 1) % interval == 0 && idx + 1 < total {
            let _ = writeln!(body, "-- progress: {}/{}", idx + 1, total);
        }
    }
    let _ = writeln!(body, "DEALLOCATE PREPARE {STATEMENT};");
    let _ = writeln!(body, "-- verification");
    let _ = writeln!(body, "{}", census_query(spec, width));
    let _ = writeln!(
        body,
        "SELECT {id}, CHAR_LENGTH({img}) AS length FROM {t} \
         WHERE CHAR_LENGTH({img}) > {width} ORDER BY length DESC LIMIT 10;"
    );

    let mut out = String::new();
    let _ = writeln!(out, "{TITLE}");
    let _ = writeln!(out, "-- generated_at: {}", generated_at.to_rfc3339());
    let _ = writeln!(out, "-- table: {t}");
    let _ = writeln!(out, "-- width: {width}");
    let _ = writeln!(out, "-- rows: {total}");
    let _ = writeln!(out, "-- sha256: {}", sha256_hex(body.as_bytes()));
    out.push_str(&body);
    out
}

fn format_error(line: usize, message: impl Into<String>) -> ReconstructError {
    ReconstructError::PlanFormat {
        line,
        message: message.into(),
    }
}

/// Read a batch produced by [`emit_plan_sql`], checking its digest and row count.
pub fn parse_plan_sql(text: &str) -> Result<OfflinePlan, ReconstructError> {
    let mut headers = BTreeMap::new();
    let mut body_start = text.len();
    let mut body_line = 1;
    let mut offset = 0;
    for (idx, line) in text.split_inclusive('\n').enumerate() {
        let Some(comment) = line.strip_prefix("-- ") else {
            body_start = offset;
            body_line = idx + 1;
            break;
        };
        if let Some((key, value)) = comment.trim_end().split_once(": ") {
            headers.insert(key.to_string(), value.to_string());
        }
        offset += line.len();
    }
    let body = &text[body_start..];

    let header = |key: &str| {
        headers
            .get(key)
            .ok_or_else(|| format_error(1, format!("missing `{key}` header")))
    };
    let width = header("width")?
        .parse::<usize>()
        .map_err(|err| format_error(1, format!("bad width: {err}")))?;
    let rows = header("rows")?
        .parse::<usize>()
        .map_err(|err| format_error(1, format!("bad row count: {err}")))?;
    let digest = header("sha256")?;
    if *digest != sha256_hex(body.as_bytes()) {
        return Err(format_error(1, "sha256 does not match the batch body"));
    }
    let generated_at = headers
        .get("generated_at")
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|v| v.with_timezone(&Utc));

    let mut updates = Vec::new();
    for (idx, line) in body.lines().enumerate() {
        let Some(rest) = line.strip_prefix(ROW_PREFIX) else {
            continue;
        };
        let line_no = body_line + idx;
        let (property_id, rest) = parse_literal(rest).map_err(|m| format_error(line_no, m))?;
        let rest = rest
            .strip_prefix(VALUE_SEPARATOR)
            .ok_or_else(|| format_error(line_no, "expected the value assignment"))?;
        let (replacement, rest) = parse_literal(rest).map_err(|m| format_error(line_no, m))?;
        if rest != ROW_SUFFIX {
            return Err(format_error(line_no, "unexpected statement tail"));
        }
        updates.push(RowUpdate {
            property_id,
            replacement,
        });
    }
    if updates.len() != rows {
        return Err(format_error(
            1,
            format!("header announces {rows} rows, batch holds {}", updates.len()),
        ));
    }

    Ok(OfflinePlan {
        width,
        generated_at,
        updates,
    })
}

/// Emit `plan` and write it atomically to `path`.
pub async fn write_plan_file(
    path: &Path,
    plan: &Plan,
    spec: &TableSpec,
    progress_interval: usize,
) -> anyhow::Result<()> {
    let sql = emit_plan_sql(plan, spec, progress_interval, Utc::now());
    write_atomic(path, sql.as_bytes())
        .await
        .with_context(|| format!("writing offline batch {}", path.display()))?;
    info!(path = %path.display(), rows = plan.updates.len(), "wrote offline batch");
    Ok(())
}
