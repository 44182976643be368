//! Joins the truncated target rows with authoritative cells and decides, row
//! by row, what may be written.

use std::collections::BTreeMap;
use std::fmt;

use imgfix_core::{char_len, classify_cell, parse_descriptors, CellClass};
use imgfix_storage::{AuthoritativeStore, ImageRow, RowUpdate, StoreError, TargetStore};
use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    AuthoritativeMissing,
    AuthoritativeNotLonger { length: usize, width: usize },
    AuthoritativeInvalidJson { error: String },
    AuthoritativeEmptyArray,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthoritativeMissing => write!(f, "authoritative row missing"),
            Self::AuthoritativeNotLonger { length, width } => write!(
                f,
                "authoritative not longer than W ({length} chars, W = {width})"
            ),
            Self::AuthoritativeInvalidJson { error } => {
                write!(f, "authoritative cell is not a descriptor array: {error}")
            }
            Self::AuthoritativeEmptyArray => write!(f, "authoritative array is empty"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub property_id: String,
    pub reason: RejectReason,
}

/// Ordered, validated replacements for the truncated rows of one target.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Plan {
    pub width: usize,
    pub updates: Vec<RowUpdate>,
    pub rejections: Vec<Rejection>,
    /// Authoritative rows that would pass validation.
    pub candidates: usize,
    /// Valid candidates whose target row is not truncated.
    pub already_complete: usize,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

/// A replacement is usable when it is longer than `width` and parses to a
/// non-empty descriptor array. Returns the descriptor count.
pub fn validate_replacement(cell: Option<&str>, width: usize) -> Result<usize, RejectReason> {
    let cell = cell.unwrap_or("");
    let length = char_len(cell);
    if length <= width {
        return Err(RejectReason::AuthoritativeNotLonger { length, width });
    }
    match parse_descriptors(cell) {
        Ok(items) if items.is_empty() => Err(RejectReason::AuthoritativeEmptyArray),
        Ok(items) => Ok(items.len()),
        Err(err) => Err(RejectReason::AuthoritativeInvalidJson {
            error: err.to_string(),
        }),
    }
}

/// Pure planning step; both inputs are full snapshots.
pub fn build_plan(authoritative: &[ImageRow], target: &[ImageRow], width: usize) -> Plan {
    let auth = authoritative
        .iter()
        .map(|r| (r.property_id.as_str(), r.primary_image.as_deref()))
        .collect::<BTreeMap<_, _>>();
    let target = target
        .iter()
        .map(|r| (r.property_id.as_str(), r.primary_image.as_deref()))
        .collect::<BTreeMap<_, _>>();

    let mut plan = Plan {
        width,
        ..Plan::default()
    };

    for (&id, &cell) in &auth {
        if validate_replacement(cell, width).is_err() {
            continue;
        }
        plan.candidates += 1;
        if target
            .get(id)
            .is_some_and(|&t| classify_cell(t, width) != CellClass::Truncated)
        {
            plan.already_complete += 1;
        }
    }

    for (&id, &cell) in &target {
        if classify_cell(cell, width) != CellClass::Truncated {
            continue;
        }
        let verdict = match auth.get(id) {
            None => Err(RejectReason::AuthoritativeMissing),
            Some(&replacement) => validate_replacement(replacement, width)
                .map(|_| replacement.unwrap_or_default()),
        };
        match verdict {
            Ok(replacement) => plan.updates.push(RowUpdate {
                property_id: id.to_string(),
                replacement: replacement.to_string(),
            }),
            Err(reason) => {
                debug!(property_id = id, %reason, "rejected row");
                plan.rejections.push(Rejection {
                    property_id: id.to_string(),
                    reason,
                });
            }
        }
    }

    plan
}

pub async fn plan_from_stores(
    authoritative: &dyn AuthoritativeStore,
    target: &dyn TargetStore,
    width: usize,
) -> Result<Plan, StoreError> {
    let auth_rows = authoritative.scan().await?;
    let target_rows = target.scan().await?;
    let plan = build_plan(&auth_rows, &target_rows, width);
    info!(
        candidates = plan.candidates,
        accepted = plan.updates.len(),
        rejected = plan.rejections.len(),
        already_complete = plan.already_complete,
        "built reconstruction plan"
    );
    Ok(plan)
}
