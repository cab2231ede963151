use anyhow::{Context, Result};
use serde::Serialize;

use fieldsync_core::models::ProductRef;
use fieldsync_core::sync::{SkipReason, SyncOutcome};

pub(crate) fn parse_item_code(s: &str) -> Result<ProductRef> {
    ProductRef::new(s).with_context(|| format!("Invalid item code '{s}'"))
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub(crate) fn format_weight(weight: Option<f64>) -> String {
    weight.map_or_else(|| "-".to_string(), |w| format!("{:.2}", no_neg_zero(w)))
}

/// One line describing a finished or skipped run, for terminal output.
pub(crate) fn describe_outcome(outcome: &SyncOutcome) -> String {
    match outcome {
        SyncOutcome::Skipped {
            reason: SkipReason::Offline,
        } => "Offline: changes stay queued until the remote is reachable.".to_string(),
        SyncOutcome::Skipped {
            reason: SkipReason::AlreadyRunning,
        } => "A sync is already running.".to_string(),
        SyncOutcome::Completed(report) => {
            let applied = report.field_updates.applied + report.photos.applied;
            let mut line = format!("Synced {applied} change(s)");
            if report.failed() > 0 {
                line.push_str(&format!(
                    ", {} failed and will be retried",
                    report.failed()
                ));
            }
            if let Some(ref err) = report.refresh_error {
                line.push_str(&format!("; product refresh failed: {err}"));
            }
            line.push('.');
            line
        }
    }
}

pub(crate) fn no_neg_zero(v: f64) -> f64 {
    if v == 0.0 { 0.0 } else { v }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}
