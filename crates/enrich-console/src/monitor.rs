//! Stuck-batch detection and threshold health alerts. Both are pure and recomputed on demand.

use std::time::Duration;

use chrono::{DateTime, Utc};
use enrich_core::{lookup, Alert, Batch, Severity, TaskId, WorkStatus};

/// A processing batch older than this is presumed to have lost its worker.
pub const STUCK_BATCH_THRESHOLD: Duration = Duration::from_secs(270);

pub fn detect_stuck<'a>(batches: &'a [Batch], now: DateTime<Utc>, threshold: Duration) -> Vec<&'a Batch> {
    let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
    batches
        .iter()
        .filter(|b| b.status == WorkStatus::Processing)
        .filter(|b| b.running_for(now).is_some_and(|age| age > threshold))
        .collect()
}

pub fn evaluate_health(source_total: u64, facets_created: u64, task_id: TaskId) -> Vec<Alert> {
    let Some(thresholds) = lookup(task_id).health else {
        return Vec::new();
    };

    let mut alerts = Vec::new();
    if source_total < thresholds.min_sources {
        alerts.push(Alert::new(
            Severity::Error,
            format!(
                "Only {source_total} source records (expected at least {}): possible data loss.",
                thresholds.min_sources
            ),
        ));
    }
    if facets_created < thresholds.min_facets {
        alerts.push(Alert::new(
            Severity::Warning,
            format!(
                "Only {facets_created} facets (expected at least {}): re-enrichment may be needed.",
                thresholds.min_facets
            ),
        ));
    }
    if source_total > 0 {
        let average = facets_created as f64 / source_total as f64;
        if average < thresholds.target_avg_facets {
            alerts.push(Alert::new(
                Severity::Warning,
                format!(
                    "Average {average:.1} facets per source (target {:.1}): quality may be degraded.",
                    thresholds.target_avg_facets
                ),
            ));
        }
    }
    alerts
}
