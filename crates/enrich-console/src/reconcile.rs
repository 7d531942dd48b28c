//! Reconciliation of source ids against enriched rows, integrity verification and facet pruning.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use enrich_core::{
    json_identity, MissingId, ReconciliationRecord, TaskDefinition, VerificationSnapshot, VerifyIdentity,
};
use enrich_progress::distinct_keys;
use enrich_store::{fetch_paged, first_row, Row, Store, StoreError, TableQuery, DEFAULT_PAGE_SIZE};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, info_span, warn, Instrument};

use crate::gateway::{require_confirmation, ConsoleAction, Confirm, GatewayError};

pub const RECONCILIATION_TABLE: &str = "enrichment_reconciliation";

/// Row cap for each side of a verification sample.
pub const VERIFY_SAMPLE_CAP: usize = 5000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    /// First populated candidate column, in resolution order.
    pub source_id: Option<String>,
    /// How many candidate columns were populated on the row.
    pub populated: usize,
}

/// Resolves which source row an enriched row refers to. Missing columns count as unpopulated.
pub fn resolve_identity(row: &Row, candidates: &[&str]) -> ResolvedIdentity {
    let mut values = candidates.iter().filter_map(|c| row.get(*c).and_then(json_identity));
    let source_id = values.next();
    let populated = usize::from(source_id.is_some()) + values.count();
    ResolvedIdentity { source_id, populated }
}

/// Source ids with no referencing target row, in source order.
pub fn missing_ids(source_ids: &[String], referenced: &HashSet<String>) -> Vec<String> {
    source_ids
        .iter()
        .filter(|id| !referenced.contains(*id))
        .cloned()
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationReport {
    pub record: ReconciliationRecord,
    /// Target rows where more than one candidate foreign key was populated.
    pub ambiguous_rows: u64,
    pub persisted: bool,
}

pub async fn reconcile(store: &dyn Store, task: &TaskDefinition) -> Result<ReconciliationReport, StoreError> {
    let span = info_span!("reconcile", task = %task.task_id);
    async {
        let source_rows = fetch_paged(
            store,
            &TableQuery::new(task.source_table)
                .select(&["id"])
                .source_filter(task.source_filter.as_ref())
                .order("id", true),
            DEFAULT_PAGE_SIZE,
        )
        .await?;
        // Full rows so candidate columns absent from this table's schema are simply missing.
        let target_rows = fetch_paged(
            store,
            &TableQuery::new(task.target_table).order("id", true),
            DEFAULT_PAGE_SIZE,
        )
        .await?;

        let source_ids: Vec<String> = source_rows
            .iter()
            .filter_map(|row| row.get("id").and_then(json_identity))
            .collect();

        let mut referenced = HashSet::new();
        let mut ambiguous_rows = 0u64;
        for row in &target_rows {
            let resolved = resolve_identity(row, task.identity_columns);
            if resolved.populated > 1 {
                ambiguous_rows += 1;
            }
            if let Some(id) = resolved.source_id {
                referenced.insert(id);
            }
        }
        if ambiguous_rows > 0 {
            warn!(ambiguous_rows, "target rows populate more than one source reference; using the first");
        }

        let missing = missing_ids(&source_ids, &referenced);
        let record = ReconciliationRecord {
            job_type: task.job_type.to_string(),
            source_table: task.source_table.to_string(),
            target_table: task.target_table.to_string(),
            total_source_items: source_ids.len() as u64,
            total_enriched_items: target_rows.len() as u64,
            missing_items: missing.len() as u64,
            missing_ids: missing.into_iter().map(|id| MissingId { id }).collect(),
        };

        let persisted = record.missing_items > 0;
        if persisted {
            let row = serde_json::to_value(&record).map_err(|e| StoreError::Decode(e.to_string()))?;
            store.insert(RECONCILIATION_TABLE, row).await?;
        }
        info!(
            sources = record.total_source_items,
            enriched = record.total_enriched_items,
            missing = record.missing_items,
            persisted,
            "reconciliation finished"
        );
        Ok::<_, StoreError>(ReconciliationReport {
            record,
            ambiguous_rows,
            persisted,
        })
    }
    .instrument(span)
    .await
}

/// Reads one column per sampled row; row-count checks read `id`.
fn sample_query(table: &str, column: Option<&str>, task: Option<&TaskDefinition>) -> TableQuery {
    let query = TableQuery::new(table)
        .limit(VERIFY_SAMPLE_CAP)
        .select(&[column.unwrap_or("id")]);
    match task {
        Some(task) => query.source_filter(task.source_filter.as_ref()),
        None => query,
    }
}

/// Task-typed integrity check used to gate the missing-item job.
pub async fn verify(store: &dyn Store, task: &TaskDefinition, now: DateTime<Utc>) -> Result<VerificationSnapshot, StoreError> {
    let span = info_span!("verify", task = %task.task_id);
    async {
        let baseline_count = store.count(task.target_table, &[]).await?.unwrap_or(0);

        let (source_column, target_column) = match task.verify {
            VerifyIdentity::RegulationNumber {
                source_column,
                target_column,
            } => (Some(source_column), Some(target_column)),
            VerifyIdentity::SourceId { target_column } => (Some("id"), Some(target_column)),
            VerifyIdentity::RowCount => (None, None),
        };

        let source_rows = store
            .rows(&sample_query(task.source_table, source_column, Some(task)))
            .await?;
        let target_rows = store
            .rows(&sample_query(task.target_table, target_column, None))
            .await?;

        let (total_unique, baseline_unique_count, enriched_unique) = match (source_column, target_column) {
            (Some(source_column), Some(target_column)) => {
                let sources = distinct_keys(&source_rows, source_column);
                let targets = distinct_keys(&target_rows, target_column);
                let enriched = sources.intersection(&targets).count() as u64;
                (sources.len() as u64, targets.len() as u64, enriched)
            }
            _ => {
                let targets = target_rows.len() as u64;
                (source_rows.len() as u64, targets, targets)
            }
        };

        let snapshot = VerificationSnapshot {
            task_id: task.task_id,
            baseline_count,
            baseline_unique_count,
            timestamp: now,
            total_unique,
            enriched_unique,
        };
        info!(
            baseline = baseline_count,
            total_unique,
            enriched_unique,
            "verification snapshot taken"
        );
        Ok::<_, StoreError>(snapshot)
    }
    .instrument(span)
    .await
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    #[serde(default)]
    pub facets_archived: u64,
    #[serde(default)]
    pub sources_affected: u64,
    #[serde(default)]
    pub total_facets_before: u64,
    #[serde(default)]
    pub total_facets_after: u64,
}

/// Archives facets beyond the per-source target through the task's prune RPC.
pub async fn prune_facets(
    store: &dyn Store,
    task: &TaskDefinition,
    confirm: &dyn Confirm,
) -> Result<PruneReport, GatewayError> {
    let Some(rpc) = task.prune_rpc else {
        return Err(GatewayError::Precondition {
            action: ConsoleAction::Prune,
            reason: format!("{} has no prune operation", task.task_id),
        });
    };
    require_confirmation(
        confirm,
        ConsoleAction::Prune,
        task,
        format!(
            "Archive {} facets beyond {} per source?",
            task.label, task.target_multiplier
        ),
    )?;

    let value = store
        .rpc(rpc, json!({}))
        .instrument(info_span!("prune", task = %task.task_id, rpc))
        .await
        .map_err(|source| GatewayError::Store {
            action: ConsoleAction::Prune,
            source,
        })?;
    let report: PruneReport = first_row(value)
        .map(|row| serde_json::from_value(serde_json::Value::Object(row)))
        .transpose()
        .map_err(|e| GatewayError::Store {
            action: ConsoleAction::Prune,
            source: StoreError::Decode(e.to_string()),
        })?
        .unwrap_or_default();
    info!(
        task = %task.task_id,
        archived = report.facets_archived,
        before = report.total_facets_before,
        after = report.total_facets_after,
        "facets pruned"
    );
    Ok(report)
}
