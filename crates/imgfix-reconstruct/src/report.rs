//! Console rendering and on-disk run reports under `reports/<run_id>/`.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::fs;

use crate::analyzer::{AnalysisReport, AuthoritativeSummary};
use crate::executor::{DryRunPreview, ExecutionReport, VerificationReport};

pub fn render_analysis(target: &AnalysisReport, authoritative: Option<&AuthoritativeSummary>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Target column (W = {})", target.width);
    let _ = writeln!(out, "  total rows:        {}", target.total_rows);
    let _ = writeln!(out, "  with images:       {}", target.with_images);
    let _ = writeln!(out, "  exactly W chars:   {}", target.at_width);
    let _ = writeln!(out, "  average length:    {:.1}", target.average_length);
    let _ = writeln!(
        out,
        "  min / max length:  {} / {}",
        opt(target.min_length),
        opt(target.max_length)
    );
    let _ = writeln!(out, "  multi-image rows:  {}", target.multi_image);
    let c = &target.classes;
    let _ = writeln!(
        out,
        "  classes:           empty {} / intact {} / truncated {} / malformed {}",
        c.empty, c.intact, c.truncated, c.malformed
    );
    if target.systemic_truncation() {
        let _ = writeln!(out, "  every stored cell stops at W: the column is cutting writes");
    }
    for sample in &target.samples {
        let _ = writeln!(out, "  - {} ({} chars): {}...", sample.property_id, sample.length, sample.head);
    }
    if let Some(auth) = authoritative {
        let _ = writeln!(out, "Authoritative column");
        let _ = writeln!(out, "  total rows:        {}", auth.total_rows);
        let _ = writeln!(out, "  with images:       {}", auth.with_images);
        let _ = writeln!(out, "  longer than W:     {}", auth.longer_than_width);
        let _ = writeln!(out, "  valid candidates:  {}", auth.valid_candidates);
        let _ = writeln!(out, "  average length:    {:.1}", auth.average_length);
        let _ = writeln!(out, "  max length:        {}", opt(auth.max_length));
    }
    out
}

pub fn render_preview(preview: &DryRunPreview) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Dry run (W = {})", preview.width);
    let _ = writeln!(out, "  authoritative candidates: {}", preview.candidates);
    let _ = writeln!(out, "  rows to update:           {}", preview.accepted);
    let _ = writeln!(out, "  rejected:                 {}", preview.rejected);
    let _ = writeln!(out, "  already complete:         {}", preview.already_complete);
    if preview.accepted == 0 {
        let _ = writeln!(out, "  no properties need reconstruction");
    }
    for sample in &preview.samples {
        let _ = writeln!(
            out,
            "  - {}: {} chars, {} images",
            sample.property_id, sample.length, sample.descriptor_count
        );
        for (idx, url) in sample.file_urls.iter().enumerate() {
            let _ = writeln!(out, "      image {}: {}", idx + 1, url);
        }
    }
    out
}

pub fn render_verification(report: &VerificationReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Verification (W = {})", report.width);
    let _ = writeln!(out, "  total rows:        {}", report.total_rows);
    let _ = writeln!(out, "  still at W:        {}", report.still_truncated);
    let _ = writeln!(out, "  longer than W:     {}", report.now_complete);
    for sample in &report.samples {
        let _ = writeln!(
            out,
            "  - {}: {} chars, {} images, {}",
            sample.property_id,
            sample.length,
            opt(sample.image_count),
            if sample.valid_json { "valid JSON" } else { "invalid JSON" }
        );
    }
    if !report.short_writes.is_empty() {
        let _ = writeln!(out, "  cut on write:      {}", report.short_writes.len());
        for short in &report.short_writes {
            let _ = writeln!(
                out,
                "  ! {}: wrote {} chars, stored {}",
                short.property_id,
                short.expected,
                opt(short.stored)
            );
        }
    }
    out
}

fn opt(value: Option<usize>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

/// Write `reconstruction.json` and `summary.md` for one run; returns the run directory.
pub async fn write_run_report(
    reports_root: &Path,
    report: &ExecutionReport,
    analysis: Option<&AnalysisReport>,
) -> anyhow::Result<PathBuf> {
    let run_dir = reports_root.join(report.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(&serde_json::json!({
        "analysis": analysis,
        "execution": report,
    }))
    .context("serializing reconstruction report")?;
    fs::write(run_dir.join("reconstruction.json"), json)
        .await
        .context("writing reconstruction.json")?;

    let mut summary = format!(
        "# Image Reconstruction\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- State: {:?}\n",
        report.run_id, report.started_at, report.finished_at, report.state
    );
    if let Some(commit) = &report.commit {
        let _ = write!(
            summary,
            "- Committed: {}\n- Unchanged: {}\n- Write errors: {}\n",
            commit.committed,
            commit.unchanged.len(),
            commit.errors.len()
        );
    }
    if !report.rejections.is_empty() {
        summary.push_str("\n## Rejected Rows\n");
        for rejection in &report.rejections {
            let _ = writeln!(summary, "- {}: {}", rejection.property_id, rejection.reason);
        }
    }
    if let Some(errors) = report.commit.as_ref().map(|c| &c.errors).filter(|e| !e.is_empty()) {
        summary.push_str("\n## Write Errors\n");
        for error in errors {
            let _ = writeln!(summary, "- {}: {}", error.property_id, error.message);
        }
    }
    if let Some(error) = &report.verification_error {
        let _ = write!(summary, "\n## Verification\n\nNot completed: {error}\n");
    }
    if let Some(verification) = &report.verification {
        summary.push_str("\n## Verification\n```\n");
        summary.push_str(&render_verification(verification));
        summary.push_str("```\n");
    }
    fs::write(run_dir.join("summary.md"), summary)
        .await
        .context("writing summary.md")?;

    Ok(run_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{AutoConfirm, Executor};
    use crate::planner::build_plan;
    use crate::ReconstructConfig;
    use imgfix_storage::{ImageRow, MemoryStore};

    #[tokio::test]
    async fn run_report_lands_under_run_id() {
        let width = 20;
        let full = r#"[{"fileUrl":"/properties/long-name.jpg"}]"#;
        let cut = full.chars().take(width).collect::<String>();
        let store = MemoryStore::from_rows([("P1", Some(cut.clone())), ("P2", Some(cut))]);
        let plan = build_plan(
            &[ImageRow::new("P1", Some(full))],
            &[
                ImageRow::new("P1", Some(&full[..width])),
                ImageRow::new("P2", Some(&full[..width])),
            ],
            width,
        );
        let config = ReconstructConfig {
            narrow_width: width,
            ..ReconstructConfig::default()
        };
        let report = Executor::new(&store, plan, config)
            .run(&mut AutoConfirm)
            .await
            .expect("run");

        let dir = tempfile::tempdir().expect("tempdir");
        let run_dir = write_run_report(dir.path(), &report, None)
            .await
            .expect("write report");
        assert!(run_dir.ends_with(report.run_id.to_string()));

        let json: serde_json::Value = serde_json::from_slice(
            &std::fs::read(run_dir.join("reconstruction.json")).expect("read json"),
        )
        .expect("json");
        assert_eq!(json["execution"]["state"], "verified");
        assert_eq!(json["execution"]["commit"]["committed"], 1);

        let summary = std::fs::read_to_string(run_dir.join("summary.md")).expect("summary");
        assert!(summary.contains("- Committed: 1"));
        assert!(summary.contains("P2: authoritative row missing"));
    }

    #[tokio::test]
    async fn report_is_written_when_verification_fails() {
        let width = 20;
        let full = r#"[{"fileUrl":"/properties/long-name.jpg"}]"#;
        let store = MemoryStore::from_rows([("P1", Some(&full[..width]))]);
        let plan = build_plan(
            &[ImageRow::new("P1", Some(full))],
            &[ImageRow::new("P1", Some(&full[..width]))],
            width,
        );
        let mut executor = Executor::new(&store, plan, ReconstructConfig::default());
        executor.dry_run().expect("dry run");
        executor.confirm(&mut AutoConfirm).expect("confirm");
        executor.commit().await.expect("commit");
        store.fail_census().await;
        executor.verify().await.expect_err("census fails");

        let dir = tempfile::tempdir().expect("tempdir");
        let report = executor.into_report();
        let run_dir = write_run_report(dir.path(), &report, None)
            .await
            .expect("write report");

        let json: serde_json::Value = serde_json::from_slice(
            &std::fs::read(run_dir.join("reconstruction.json")).expect("read json"),
        )
        .expect("json");
        assert_eq!(json["execution"]["state"], "failed");
        assert_eq!(json["execution"]["commit"]["committed"], 1);
        let summary = std::fs::read_to_string(run_dir.join("summary.md")).expect("summary");
        assert!(summary.contains("- Committed: 1"));
        assert!(summary.contains("Not completed: "));
    }

    #[test]
    fn preview_mentions_empty_plans() {
        let preview = DryRunPreview {
            width: 191,
            candidates: 0,
            accepted: 0,
            rejected: 0,
            already_complete: 4,
            samples: Vec::new(),
        };
        assert!(render_preview(&preview).contains("no properties need reconstruction"));
    }
}
