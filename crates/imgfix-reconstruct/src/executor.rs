//! Applies a [`Plan`] to the target store.
//!
//! A run moves `Built -> DryRun -> AwaitingConfirm -> Committing` and ends in
//! `Verified` or `Failed`. Nothing is written before the confirmation gate
//! accepts the dry-run preview and the schema probe shows the column can hold
//! the replacements.

use std::collections::HashSet;
use std::io::{self, BufRead, Write};

use chrono::{DateTime, Utc};
use imgfix_core::{char_len, descriptor_count, parse_descriptors};
use imgfix_storage::{StoreError, TargetStore, WriteOutcome};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::planner::{validate_replacement, Plan, Rejection};
use crate::{ReconstructConfig, ReconstructError};

/// Placeholder shown in previews for a descriptor without a `fileUrl`.
const MISSING_FILE_URL: &str = "N/A";
/// Descriptors listed per preview sample.
const PREVIEW_URLS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Built,
    DryRun,
    AwaitingConfirm,
    Committing,
    Verified,
    Failed,
}

impl ExecutionState {
    fn can_move_to(self, next: Self) -> bool {
        use ExecutionState::*;
        matches!(
            (self, next),
            (Built, DryRun)
                | (DryRun, AwaitingConfirm)
                | (AwaitingConfirm, DryRun)
                | (AwaitingConfirm, Committing)
                | (AwaitingConfirm, Failed)
                | (Committing, Verified)
                | (Committing, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Verified | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewSample {
    pub property_id: String,
    pub length: usize,
    pub descriptor_count: usize,
    pub file_urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DryRunPreview {
    pub width: usize,
    pub candidates: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub already_complete: usize,
    pub samples: Vec<PreviewSample>,
}

impl DryRunPreview {
    fn from_plan(plan: &Plan, sample_size: usize) -> Self {
        let samples = plan
            .updates
            .iter()
            .take(sample_size)
            .map(|update| {
                let descriptors = parse_descriptors(&update.replacement).unwrap_or_default();
                PreviewSample {
                    property_id: update.property_id.clone(),
                    length: char_len(&update.replacement),
                    descriptor_count: descriptors.len(),
                    file_urls: descriptors
                        .iter()
                        .take(PREVIEW_URLS)
                        .map(|d| {
                            d.file_url
                                .clone()
                                .unwrap_or_else(|| MISSING_FILE_URL.to_string())
                        })
                        .collect(),
                }
            })
            .collect();
        Self {
            width: plan.width,
            candidates: plan.candidates,
            accepted: plan.updates.len(),
            rejected: plan.rejections.len(),
            already_complete: plan.already_complete,
            samples,
        }
    }
}

/// Decides whether a destructive step may proceed.
pub trait ConfirmationGate {
    /// Answer a yes/no `question`.
    fn approve(&mut self, question: &str) -> bool;

    /// Accept or decline a previewed plan.
    fn confirm(&mut self, preview: &DryRunPreview) -> bool {
        self.approve(&format!(
            "Proceed with updating {} rows?",
            preview.accepted
        ))
    }
}

/// Accepts every plan; backs `--yes`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoConfirm;

impl ConfirmationGate for AutoConfirm {
    fn approve(&mut self, _question: &str) -> bool {
        true
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DeclineConfirm;

impl ConfirmationGate for DeclineConfirm {
    fn approve(&mut self, _question: &str) -> bool {
        false
    }
}

/// Interactive `(y/N)` prompt. Anything but `y`/`yes` declines.
pub struct StdinConfirm<R, W> {
    input: R,
    output: W,
}

impl StdinConfirm<io::StdinLock<'static>, io::Stderr> {
    pub fn new() -> Self {
        Self {
            input: io::stdin().lock(),
            output: io::stderr(),
        }
    }
}

impl Default for StdinConfirm<io::StdinLock<'static>, io::Stderr> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: BufRead, W: Write> StdinConfirm<R, W> {
    pub fn with_io(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl<R: BufRead, W: Write> ConfirmationGate for StdinConfirm<R, W> {
    fn approve(&mut self, question: &str) -> bool {
        let prompt =
            write!(self.output, "{question} (y/N): ").and_then(|_| self.output.flush());
        if let Err(err) = prompt {
            warn!(error = %err, "could not write confirmation prompt");
            return false;
        }
        let mut answer = String::new();
        match self.input.read_line(&mut answer) {
            Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            Err(err) => {
                warn!(error = %err, "could not read confirmation answer");
                false
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowWriteError {
    pub property_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct CommitReport {
    pub attempted: usize,
    pub committed: usize,
    /// Rows the length guard left alone: already repaired or changed since planning.
    pub unchanged: Vec<String>,
    /// Rows that failed revalidation right before the write.
    pub skipped_invalid: Vec<Rejection>,
    pub errors: Vec<RowWriteError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationSample {
    pub property_id: String,
    pub length: usize,
    pub valid_json: bool,
    pub image_count: Option<usize>,
}

/// A committed row whose stored cell is shorter than the replacement written to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShortWrite {
    pub property_id: String,
    pub expected: usize,
    pub stored: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub width: usize,
    pub total_rows: u64,
    pub still_truncated: u64,
    pub now_complete: u64,
    pub samples: Vec<VerificationSample>,
    pub short_writes: Vec<ShortWrite>,
}

/// Length census of the target plus its longest cells.
pub async fn verify_target(
    target: &dyn TargetStore,
    width: usize,
    sample_size: usize,
) -> Result<VerificationReport, StoreError> {
    let census = target.length_census(width).await?;
    let samples = target
        .longest_over(width, sample_size)
        .await?
        .into_iter()
        .map(|row| {
            let cell = row.primary_image.as_deref().unwrap_or("");
            VerificationSample {
                length: char_len(cell),
                valid_json: serde_json::from_str::<serde_json::Value>(cell).is_ok(),
                image_count: descriptor_count(Some(cell)),
                property_id: row.property_id,
            }
        })
        .collect();
    Ok(VerificationReport {
        width,
        total_rows: census.total_rows,
        still_truncated: census.at_width,
        now_complete: census.over_width,
        samples,
        short_writes: Vec::new(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: ExecutionState,
    pub preview: Option<DryRunPreview>,
    pub rejections: Vec<Rejection>,
    pub commit: Option<CommitReport>,
    pub verification: Option<VerificationReport>,
    /// Set when the post-commit census could not be taken.
    pub verification_error: Option<String>,
}

impl ExecutionReport {
    /// 0 for a clean dry-run or a verified commit, 1 when the run failed.
    pub fn exit_code(&self) -> u8 {
        match self.state {
            ExecutionState::Failed => 1,
            _ => 0,
        }
    }
}

pub struct Executor<'a> {
    target: &'a dyn TargetStore,
    plan: Plan,
    config: ReconstructConfig,
    state: ExecutionState,
    run_id: Uuid,
    started_at: DateTime<Utc>,
    preview: Option<DryRunPreview>,
    commit: Option<CommitReport>,
    /// `(property_id, replacement length)` for every row the store reported updated.
    written: Vec<(String, usize)>,
    verification: Option<VerificationReport>,
    verification_error: Option<String>,
}

impl<'a> Executor<'a> {
    pub fn new(target: &'a dyn TargetStore, plan: Plan, config: ReconstructConfig) -> Self {
        Self {
            target,
            plan,
            config,
            state: ExecutionState::Built,
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            preview: None,
            commit: None,
            written: Vec::new(),
            verification: None,
            verification_error: None,
        }
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    fn transition(&mut self, next: ExecutionState) -> Result<(), ReconstructError> {
        if !self.state.can_move_to(next) {
            return Err(ReconstructError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!(run_id = %self.run_id, from = ?self.state, to = ?next, "state transition");
        self.state = next;
        Ok(())
    }

    /// Build the preview. Performs no writes.
    pub fn dry_run(&mut self) -> Result<&DryRunPreview, ReconstructError> {
        self.transition(ExecutionState::DryRun)?;
        let preview = DryRunPreview::from_plan(&self.plan, self.config.sample_size);
        info!(
            run_id = %self.run_id,
            candidates = preview.candidates,
            accepted = preview.accepted,
            rejected = preview.rejected,
            "dry run complete"
        );
        Ok(self.preview.insert(preview))
    }

    /// Ask `gate` to accept the preview. A decline returns to `DryRun`.
    pub fn confirm(&mut self, gate: &mut dyn ConfirmationGate) -> Result<(), ReconstructError> {
        self.transition(ExecutionState::AwaitingConfirm)?;
        let accepted = match &self.preview {
            Some(preview) => gate.confirm(preview),
            None => false,
        };
        if accepted {
            info!(run_id = %self.run_id, "confirmation accepted");
            Ok(())
        } else {
            self.transition(ExecutionState::DryRun)?;
            info!(run_id = %self.run_id, "confirmation declined; no rows written");
            Err(ReconstructError::ConfirmationDeclined)
        }
    }

    /// The probe must be at least as long as the longest replacement.
    fn probe_length(&self) -> usize {
        self.plan
            .updates
            .iter()
            .map(|update| char_len(&update.replacement))
            .max()
            .unwrap_or(0)
            .max(self.plan.width.saturating_mul(4))
            .max(4)
    }

    async fn check_schema(&mut self) -> Result<(), ReconstructError> {
        let requested = self.probe_length();
        match self.target.probe_column_width(requested).await? {
            Some(probe) if probe.truncates() => {
                warn!(
                    requested,
                    observed = ?probe.observed,
                    write_error = ?probe.write_error,
                    "target column truncates writes"
                );
                self.transition(ExecutionState::Failed)?;
                Err(ReconstructError::Schema {
                    requested,
                    observed: probe.observed,
                })
            }
            Some(_) => Ok(()),
            None => {
                warn!("target table is empty; skipping schema probe");
                Ok(())
            }
        }
    }

    /// Probe the column, then write the plan in batches. Row failures are
    /// recorded and do not stop the run.
    pub async fn commit(&mut self) -> Result<&CommitReport, ReconstructError> {
        if self.state != ExecutionState::AwaitingConfirm {
            return Err(ReconstructError::InvalidTransition {
                from: self.state,
                to: ExecutionState::Committing,
            });
        }
        self.check_schema().await?;
        self.transition(ExecutionState::Committing)?;

        let width = self.plan.width;
        let interval = self.config.progress_interval.max(1);
        let total = self.plan.updates.len();
        let mut report = CommitReport::default();
        let mut written = Vec::new();
        let mut processed = 0usize;

        for chunk in self.plan.updates.chunks(self.config.batch_size.max(1)) {
            let mut batch = Vec::with_capacity(chunk.len());
            for update in chunk {
                match validate_replacement(Some(&update.replacement), width) {
                    Ok(_) => batch.push(update.clone()),
                    Err(reason) => {
                        warn!(property_id = %update.property_id, %reason, "replacement failed revalidation");
                        report.skipped_invalid.push(Rejection {
                            property_id: update.property_id.clone(),
                            reason,
                        });
                    }
                }
            }

            if !batch.is_empty() {
                report.attempted += batch.len();
                match self.target.apply_guarded(&batch, width).await {
                    Ok(outcomes) => {
                        for (update, outcome) in batch.iter().zip(outcomes) {
                            match outcome {
                                WriteOutcome::Updated => {
                                    report.committed += 1;
                                    written.push((
                                        update.property_id.clone(),
                                        char_len(&update.replacement),
                                    ));
                                }
                                WriteOutcome::Unchanged => {
                                    report.unchanged.push(update.property_id.clone())
                                }
                                WriteOutcome::Failed(message) => {
                                    warn!(property_id = %update.property_id, %message, "row write failed");
                                    report.errors.push(RowWriteError {
                                        property_id: update.property_id.clone(),
                                        message,
                                    });
                                }
                            }
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, rows = batch.len(), "batch did not commit");
                        report.errors.extend(batch.iter().map(|u| RowWriteError {
                            property_id: u.property_id.clone(),
                            message: err.to_string(),
                        }));
                    }
                }
            }

            let before = processed / interval;
            processed += chunk.len();
            if processed / interval > before {
                info!(processed, total, "reconstruction progress");
            }
        }

        info!(
            run_id = %self.run_id,
            committed = report.committed,
            unchanged = report.unchanged.len(),
            errors = report.errors.len(),
            "commit finished"
        );
        self.written = written;
        Ok(self.commit.insert(report))
    }

    /// Census the target and settle the run as `Verified` or `Failed`.
    pub async fn verify(&mut self) -> Result<&VerificationReport, ReconstructError> {
        if self.state != ExecutionState::Committing {
            return Err(ReconstructError::InvalidTransition {
                from: self.state,
                to: ExecutionState::Verified,
            });
        }
        let verification = match self.check_written().await {
            Ok(verification) => verification,
            Err(err) => {
                warn!(run_id = %self.run_id, error = %err, "verification failed after commit");
                self.verification_error = Some(err.to_string());
                self.transition(ExecutionState::Failed)?;
                return Err(err.into());
            }
        };
        let written_ids = self
            .written
            .iter()
            .map(|(id, _)| id.as_str())
            .collect::<HashSet<_>>();
        let corrupt_sample = verification
            .samples
            .iter()
            .any(|s| !s.valid_json && written_ids.contains(s.property_id.as_str()));
        let clean = !corrupt_sample
            && verification.short_writes.is_empty()
            && self.commit.as_ref().is_some_and(|c| c.errors.is_empty());
        self.transition(if clean {
            ExecutionState::Verified
        } else {
            ExecutionState::Failed
        })?;
        info!(
            run_id = %self.run_id,
            state = ?self.state,
            still_truncated = verification.still_truncated,
            now_complete = verification.now_complete,
            "verification finished"
        );
        Ok(self.verification.insert(verification))
    }

    /// Census the target and compare each written row's stored length with
    /// what was written.
    async fn check_written(&self) -> Result<VerificationReport, StoreError> {
        let mut verification = verify_target(
            self.target,
            self.plan.width,
            self.config.verify_sample_size,
        )
        .await?;
        for (property_id, expected) in &self.written {
            let stored = self.target.image_length(property_id).await?;
            if stored.map_or(true, |len| len < *expected) {
                warn!(%property_id, expected, ?stored, "stored cell is shorter than the replacement");
                verification.short_writes.push(ShortWrite {
                    property_id: property_id.clone(),
                    expected: *expected,
                    stored,
                });
            }
        }
        Ok(verification)
    }

    pub fn into_report(self) -> ExecutionReport {
        ExecutionReport {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            state: self.state,
            preview: self.preview,
            rejections: self.plan.rejections,
            commit: self.commit,
            verification: self.verification,
            verification_error: self.verification_error,
        }
    }

    /// Dry run, confirm, commit and verify. An empty plan stops after the
    /// dry run without consulting the gate.
    pub async fn run(
        mut self,
        gate: &mut dyn ConfirmationGate,
    ) -> Result<ExecutionReport, ReconstructError> {
        self.dry_run()?;
        if self.plan.is_empty() {
            info!(run_id = %self.run_id, "no rows to reconstruct");
            return Ok(self.into_report());
        }
        self.confirm(gate)?;
        self.commit().await?;
        self.verify().await?;
        Ok(self.into_report())
    }
}
