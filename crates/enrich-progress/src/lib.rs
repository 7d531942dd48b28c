//! Progress accounting: one strategy per progress rule, selected through the task registry.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::Utc;
use enrich_core::{
    json_identity, ComplianceMetrics, EnrichmentModel, FacetStage, ProgressRule, ProgressSnapshot, ScalarValue,
    StageInput, TaskDefinition, TaskId,
};
use enrich_store::{scalar_count, Predicate, Row, Store, TableQuery};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "enrich-progress";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressContext {
    /// Pipeline stage key for staged tasks. Ignored elsewhere.
    pub stage: Option<String>,
}

impl ProgressContext {
    pub fn stage(stage: impl Into<String>) -> Self {
        Self {
            stage: Some(stage.into()),
        }
    }
}

/// Counts gathered by a strategy plus everything derived from them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Figures {
    pub source_total: u64,
    pub source_enriched: u64,
    pub facets_created: u64,
    pub target_facets: u64,
    pub remaining: u64,
    pub progress: u8,
}

impl Figures {
    fn into_snapshot(self, task_id: TaskId, stage: Option<&str>, warnings: Vec<String>) -> ProgressSnapshot {
        ProgressSnapshot {
            task_id,
            stage: stage.map(str::to_string),
            source_total: self.source_total,
            source_enriched: self.source_enriched,
            facets_created: self.facets_created,
            target_facets: self.target_facets,
            remaining: self.remaining,
            progress: self.progress,
            compliance: None,
            warnings,
            computed_at: Utc::now(),
        }
    }
}

/// `round(100 × numerator / denominator)` clamped to `0..=100`; zero when the denominator is zero.
pub fn percent(numerator: u64, denominator: u64) -> u8 {
    if denominator == 0 {
        return 0;
    }
    let ratio = (numerator as f64 * 100.0 / denominator as f64).round();
    ratio.clamp(0.0, 100.0) as u8
}

pub fn fixed_ratio_target(source_total: u64, multiplier: f64) -> u64 {
    (source_total as f64 * multiplier).round().max(0.0) as u64
}

fn estimate_enriched(source_total: u64, facets_created: u64, multiplier: f64) -> u64 {
    if multiplier <= 0.0 {
        return 0;
    }
    ((facets_created as f64 / multiplier).floor() as u64).min(source_total)
}

pub fn distinct_key_figures(source_total: u64, source_enriched: u64, facets_created: u64, multiplier: f64) -> Figures {
    Figures {
        source_total,
        source_enriched,
        facets_created,
        target_facets: facets_created.max(fixed_ratio_target(source_total, multiplier)),
        remaining: source_total.saturating_sub(source_enriched),
        progress: percent(source_enriched, source_total),
    }
}

pub fn staged_figures(source_total: u64, facets_created: u64, multiplier: f64) -> Figures {
    let target_facets = fixed_ratio_target(source_total, multiplier);
    Figures {
        source_total,
        source_enriched: estimate_enriched(source_total, facets_created, multiplier),
        facets_created,
        target_facets,
        remaining: target_facets.saturating_sub(facets_created),
        progress: percent(facets_created, target_facets),
    }
}

pub fn banded_figures(source_total: u64, source_enriched: u64, facets_created: u64, multiplier: f64) -> Figures {
    Figures {
        source_total,
        source_enriched,
        facets_created,
        target_facets: facets_created.max(fixed_ratio_target(source_total, multiplier)),
        remaining: source_total.saturating_sub(source_enriched),
        progress: percent(source_enriched, source_total),
    }
}

pub fn one_to_one_figures(source_total: u64, facets_created: u64) -> Figures {
    Figures {
        source_total,
        source_enriched: facets_created,
        facets_created,
        target_facets: source_total,
        remaining: source_total.saturating_sub(facets_created),
        progress: percent(facets_created, source_total),
    }
}

pub fn fixed_ratio_figures(source_total: u64, facets_created: u64, multiplier: f64) -> Figures {
    let target_facets = facets_created.max(fixed_ratio_target(source_total, multiplier));
    Figures {
        source_total,
        source_enriched: estimate_enriched(source_total, facets_created, multiplier),
        facets_created,
        target_facets,
        remaining: target_facets.saturating_sub(facets_created),
        progress: percent(facets_created, target_facets),
    }
}

/// Trimmed, non-empty identity of every row's `column`, deduplicated.
pub fn distinct_keys(rows: &[Row], column: &str) -> HashSet<String> {
    rows.iter()
        .filter_map(|row| row.get(column).and_then(json_identity))
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
        .collect()
}

/// Exact count, or zero with a logged diagnostic when the store fails or has no count.
pub async fn count_or_zero(store: &dyn Store, table: &str, predicates: &[Predicate]) -> u64 {
    match store.count(table, predicates).await {
        Ok(Some(count)) => count,
        Ok(None) => {
            warn!(table, "count returned no value; treating as zero");
            0
        }
        Err(err) => {
            warn!(table, error = %err, "count failed; treating as zero");
            0
        }
    }
}

async fn rows_or_empty(store: &dyn Store, query: &TableQuery) -> Vec<Row> {
    match store.rows(query).await {
        Ok(rows) => rows,
        Err(err) => {
            warn!(table = %query.table, error = %err, "row sample failed; treating as empty");
            Vec::new()
        }
    }
}

fn source_predicates(task: &TaskDefinition) -> Vec<Predicate> {
    task.source_filter
        .as_ref()
        .map(Predicate::from_source_filter)
        .into_iter()
        .collect()
}

#[async_trait]
pub trait ProgressStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn compute(&self, store: &dyn Store, task: &TaskDefinition, ctx: &ProgressContext) -> ProgressSnapshot;
}

/// Key-level completeness: many target rows share one source key.
#[derive(Debug, Clone, Copy)]
pub struct DistinctKeyStrategy;

#[async_trait]
impl ProgressStrategy for DistinctKeyStrategy {
    fn name(&self) -> &'static str {
        "distinct_key"
    }

    async fn compute(&self, store: &dyn Store, task: &TaskDefinition, ctx: &ProgressContext) -> ProgressSnapshot {
        let ProgressRule::DistinctKey {
            source_key,
            target_key,
            source_sample,
            target_sample,
        } = task.progress
        else {
            return FixedRatioStrategy.compute(store, task, ctx).await;
        };

        let source_rows = rows_or_empty(
            store,
            &TableQuery::new(task.source_table)
                .select(&[source_key])
                .source_filter(task.source_filter.as_ref())
                .limit(source_sample),
        )
        .await;
        let target_rows = rows_or_empty(
            store,
            &TableQuery::new(task.target_table)
                .select(&[target_key])
                .filter(Predicate::NotNull(target_key.to_string()))
                .limit(target_sample),
        )
        .await;
        let facets_created = count_or_zero(store, task.target_table, &[]).await;

        let source_total = distinct_keys(&source_rows, source_key).len() as u64;
        let source_enriched = distinct_keys(&target_rows, target_key).len() as u64;
        debug!(
            source_rows = source_rows.len(),
            target_rows = target_rows.len(),
            source_total,
            source_enriched,
            "distinct key sample"
        );

        distinct_key_figures(source_total, source_enriched, facets_created, task.target_multiplier)
            .into_snapshot(task.task_id, None, Vec::new())
    }
}

/// Multi-phase facet pipeline where each stage consumes the previous stage's output.
#[derive(Debug, Clone, Copy)]
pub struct StagedFacetStrategy;

impl StagedFacetStrategy {
    async fn stage_input_total(store: &dyn Store, task: &TaskDefinition, facet_column: &str, stage: &FacetStage) -> u64 {
        match stage.input {
            StageInput::SourceRows => count_or_zero(store, task.source_table, &source_predicates(task)).await,
            StageInput::FacetsOfType(facet_type) => {
                count_or_zero(
                    store,
                    task.target_table,
                    &[Predicate::eq(facet_column, ScalarValue::text(facet_type))],
                )
                .await
            }
        }
    }
}

#[async_trait]
impl ProgressStrategy for StagedFacetStrategy {
    fn name(&self) -> &'static str {
        "staged_facet"
    }

    async fn compute(&self, store: &dyn Store, task: &TaskDefinition, ctx: &ProgressContext) -> ProgressSnapshot {
        let (ProgressRule::StagedFacets { facet_column, .. }, Some(stage)) = (&task.progress, task.stage(ctx.stage.as_deref()))
        else {
            return FixedRatioStrategy.compute(store, task, ctx).await;
        };

        let source_total = Self::stage_input_total(store, task, facet_column, stage).await;
        let mut warnings = Vec::new();
        let mut facets_created = count_or_zero(
            store,
            task.target_table,
            &[Predicate::eq(facet_column, ScalarValue::text(stage.facet_type))],
        )
        .await;

        if facets_created == 0 {
            if let Some(legacy) = stage.legacy_facet_type {
                let legacy_count = count_or_zero(
                    store,
                    task.target_table,
                    &[Predicate::eq(facet_column, ScalarValue::text(legacy))],
                )
                .await;
                if legacy_count > 0 {
                    warn!(
                        task = %task.task_id,
                        stage = stage.key,
                        legacy,
                        legacy_count,
                        "no facets under current tag; counting legacy tag"
                    );
                    warnings.push(format!(
                        "no `{}` facets found; counted {legacy_count} facets tagged `{legacy}` instead",
                        stage.facet_type
                    ));
                    facets_created = legacy_count;
                }
            }
        }

        staged_figures(source_total, facets_created, stage.multiplier).into_snapshot(
            task.task_id,
            Some(stage.key),
            warnings,
        )
    }
}

/// "Fully enriched" means a facet count inside an inclusive band, counted server-side.
#[derive(Debug, Clone, Copy)]
pub struct BandedFacetStrategy;

#[async_trait]
impl ProgressStrategy for BandedFacetStrategy {
    fn name(&self) -> &'static str {
        "banded_facet"
    }

    async fn compute(&self, store: &dyn Store, task: &TaskDefinition, ctx: &ProgressContext) -> ProgressSnapshot {
        let ProgressRule::BandedFacets {
            rpc,
            min_facets,
            max_facets,
        } = task.progress
        else {
            return FixedRatioStrategy.compute(store, task, ctx).await;
        };

        let source_total = count_or_zero(store, task.source_table, &source_predicates(task)).await;
        let facets_created = count_or_zero(store, task.target_table, &[]).await;
        let source_enriched = match store
            .rpc(rpc, json!({ "min_facets": min_facets, "max_facets": max_facets }))
            .await
        {
            Ok(value) => scalar_count(&value).unwrap_or_else(|| {
                warn!(rpc, "banded count returned no value; treating as zero");
                0
            }),
            Err(err) => {
                warn!(rpc, error = %err, "banded count failed; treating as zero");
                0
            }
        };

        banded_figures(source_total, source_enriched, facets_created, task.target_multiplier)
            .into_snapshot(task.task_id, None, Vec::new())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OneToOneStrategy;

#[async_trait]
impl ProgressStrategy for OneToOneStrategy {
    fn name(&self) -> &'static str {
        "one_to_one"
    }

    async fn compute(&self, store: &dyn Store, task: &TaskDefinition, _ctx: &ProgressContext) -> ProgressSnapshot {
        let source_total = count_or_zero(store, task.source_table, &source_predicates(task)).await;
        let facets_created = count_or_zero(store, task.target_table, &[]).await;
        one_to_one_figures(source_total, facets_created).into_snapshot(task.task_id, None, Vec::new())
    }
}

/// Default for faceted tasks without a more specific rule.
#[derive(Debug, Clone, Copy)]
pub struct FixedRatioStrategy;

#[async_trait]
impl ProgressStrategy for FixedRatioStrategy {
    fn name(&self) -> &'static str {
        "fixed_ratio"
    }

    async fn compute(&self, store: &dyn Store, task: &TaskDefinition, _ctx: &ProgressContext) -> ProgressSnapshot {
        let source_total = count_or_zero(store, task.source_table, &source_predicates(task)).await;
        let facets_created = count_or_zero(store, task.target_table, &[]).await;
        fixed_ratio_figures(source_total, facets_created, task.target_multiplier)
            .into_snapshot(task.task_id, None, Vec::new())
    }
}

pub fn strategy_for_task(task: &TaskDefinition) -> Box<dyn ProgressStrategy> {
    match (&task.progress, task.enrichment_model) {
        (ProgressRule::DistinctKey { .. }, _) => Box::new(DistinctKeyStrategy),
        (ProgressRule::StagedFacets { .. }, _) => Box::new(StagedFacetStrategy),
        (ProgressRule::BandedFacets { .. }, _) => Box::new(BandedFacetStrategy),
        (_, EnrichmentModel::Simple) => Box::new(OneToOneStrategy),
        (ProgressRule::OneToOne, EnrichmentModel::Faceted) | (ProgressRule::FixedRatio, EnrichmentModel::Faceted) => {
            Box::new(FixedRatioStrategy)
        }
    }
}

fn number(row: &Row, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| match row.get(*key)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

pub fn compliance_from_row(row: &Row) -> ComplianceMetrics {
    let whole = |keys: &[&str]| number(row, keys).map(|v| v.max(0.0).round() as u64);
    ComplianceMetrics {
        avg_facets_recent: number(row, &["avg_facets_per_source", "avg_facets_recent"]),
        avg_facets_all_time: number(row, &["avg_facets_all_time"]),
        compliance_percentage: number(row, &["compliance_percentage"]),
        sources_enriched: whole(&["sources_enriched"]),
        total_sources: whole(&["total_sources_all_time", "total_gold_sources", "total_sources"]),
        total_facets: whole(&["total_facets"]),
    }
}

/// Reads the task's compliance view. Failure is logged and yields `None`.
pub async fn fetch_compliance(store: &dyn Store, task: &TaskDefinition) -> Option<ComplianceMetrics> {
    let view = task.compliance_view?;
    match store.rows(&TableQuery::new(view).limit(1)).await {
        Ok(rows) => {
            let row = rows.into_iter().next();
            if row.is_none() {
                debug!(view, "compliance view returned no rows");
            }
            row.as_ref().map(compliance_from_row)
        }
        Err(err) => {
            warn!(view, error = %err, "compliance metrics unavailable");
            None
        }
    }
}

pub async fn compute_snapshot(store: &dyn Store, task: &TaskDefinition, ctx: &ProgressContext) -> ProgressSnapshot {
    let strategy = strategy_for_task(task);
    let span = info_span!("progress_snapshot", task = %task.task_id, strategy = strategy.name());
    async {
        let mut snapshot = strategy.compute(store, task, ctx).await;
        snapshot.compliance = fetch_compliance(store, task).await;
        debug!(
            progress = snapshot.progress,
            remaining = snapshot.remaining,
            "snapshot computed"
        );
        snapshot
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use enrich_core::lookup;
    use enrich_store::MemoryStore;

    fn rows(n: usize, f: impl Fn(usize) -> JsonValue) -> Vec<JsonValue> {
        (0..n).map(f).collect()
    }

    #[test]
    fn percent_is_bounded_and_rounded() {
        assert_eq!(percent(0, 0), 0);
        assert_eq!(percent(5, 0), 0);
        assert_eq!(percent(2, 3), 67);
        assert_eq!(percent(900, 100), 100);
    }

    #[test]
    fn figures_stay_in_range_for_degenerate_inputs() {
        let cases = [(0, 0, 0), (0, 10, 10), (10, 0, 0), (10, 20, 500), (3, 3, 1)];
        for (total, enriched, facets) in cases {
            for figures in [
                distinct_key_figures(total, enriched, facets, 30.0),
                staged_figures(total, facets, 8.0),
                banded_figures(total, enriched, facets, 8.0),
                one_to_one_figures(total, facets),
                fixed_ratio_figures(total, facets, 8.0),
            ] {
                assert!(figures.progress <= 100, "{figures:?}");
                assert!(figures.remaining <= figures.target_facets.max(figures.source_total));
            }
        }
    }

    #[test]
    fn simple_model_matches_ratio() {
        let f = one_to_one_figures(400, 100);
        assert_eq!(f.progress, 25);
        assert_eq!(f.remaining, 300);
        assert_eq!(f.target_facets, 400);
        assert_eq!(one_to_one_figures(0, 7).progress, 0);
        assert_eq!(one_to_one_figures(5, 9).remaining, 0);
    }

    #[test]
    fn fixed_ratio_target_is_monotonic_in_multiplier() {
        let mut previous = 0;
        for multiplier in [1.0, 2.5, 8.0, 30.0, 31.0] {
            let f = distinct_key_figures(250, 200, 6000, multiplier);
            assert!(f.target_facets >= previous);
            assert_eq!(f.target_facets, 6000u64.max(fixed_ratio_target(250, multiplier)));
            previous = f.target_facets;
        }
    }

    #[test]
    fn staged_scenario_matches_expected_numbers() {
        let f = staged_figures(100, 640, 8.0);
        assert_eq!(f.target_facets, 800);
        assert_eq!(f.progress, 80);
        assert_eq!(f.remaining, 160);
        assert_eq!(f.source_enriched, 80);
    }

    #[tokio::test]
    async fn distinct_key_strategy_counts_keys_not_rows() {
        // 3 source rows per regulation number; 250 distinct numbers, 200 of them enriched.
        let store = MemoryStore::new()
            .with_rows(
                "bs7671_embeddings",
                rows(750, |i| json!({ "regulation_number": format!(" 411.{} ", i % 250) })),
            )
            .with_rows(
                "regulations_intelligence",
                rows(6000, |i| {
                    if i < 2000 {
                        json!({ "regulation_number": format!("411.{}", i % 200) })
                    } else {
                        json!({ "regulation_number": null })
                    }
                }),
            );

        let snapshot = compute_snapshot(&store, lookup(TaskId::Bs7671), &ProgressContext::default()).await;
        assert_eq!(snapshot.source_total, 250);
        assert_eq!(snapshot.source_enriched, 200);
        assert_eq!(snapshot.facets_created, 6000);
        assert_eq!(snapshot.target_facets, 7500);
        assert_eq!(snapshot.remaining, 50);
        assert_eq!(snapshot.progress, 80);
    }

    #[tokio::test]
    async fn staged_strategy_counts_canonical_sources_and_primary_facets() {
        let store = MemoryStore::new()
            .with_rows(
                "practical_work",
                rows(130, |i| json!({ "id": format!("pw{i}"), "is_canonical": i < 100 })),
            )
            .with_rows(
                "practical_work_intelligence",
                rows(700, |i| {
                    json!({ "practical_work_id": format!("pw{}", i % 100), "facet_type": if i < 640 { "primary" } else { "deep" } })
                }),
            );

        let snapshot = compute_snapshot(&store, lookup(TaskId::PracticalWork), &ProgressContext::default()).await;
        assert_eq!(snapshot.stage.as_deref(), Some("primary"));
        assert_eq!(snapshot.source_total, 100);
        assert_eq!(snapshot.facets_created, 640);
        assert_eq!(snapshot.target_facets, 800);
        assert_eq!(snapshot.progress, 80);
        assert_eq!(snapshot.remaining, 160);
        assert!(snapshot.warnings.is_empty());

        let deep = compute_snapshot(&store, lookup(TaskId::PracticalWork), &ProgressContext::stage("deep")).await;
        assert_eq!(deep.source_total, 640);
        assert_eq!(deep.facets_created, 60);
        assert_eq!(deep.target_facets, 640);
    }

    #[tokio::test]
    async fn staged_strategy_falls_back_to_legacy_tag_with_warning() {
        let store = MemoryStore::new()
            .with_rows("practical_work", rows(10, |_| json!({ "is_canonical": true })))
            .with_rows(
                "practical_work_intelligence",
                rows(40, |_| json!({ "facet_type": "scenario" })),
            );

        let snapshot = compute_snapshot(&store, lookup(TaskId::PracticalWork), &ProgressContext::default()).await;
        assert_eq!(snapshot.facets_created, 40);
        assert_eq!(snapshot.progress, 50);
        assert_eq!(snapshot.warnings.len(), 1);
        assert!(snapshot.warnings[0].contains("scenario"));
    }

    #[tokio::test]
    async fn banded_strategy_uses_server_side_count() {
        let store = MemoryStore::new()
            .with_rows("design_knowledge", rows(10, |i| json!({ "is_active": i != 0 })))
            .with_rows("design_knowledge_intelligence", rows(50, |_| json!({})))
            .with_rpc("count_fully_enriched_design_sources", json!(6));

        let snapshot = compute_snapshot(&store, lookup(TaskId::DesignKnowledge), &ProgressContext::default()).await;
        assert_eq!(snapshot.source_total, 9);
        assert_eq!(snapshot.source_enriched, 6);
        assert_eq!(snapshot.remaining, 3);
        assert_eq!(snapshot.progress, 67);
        assert_eq!(
            store.rpc_calls(),
            vec![(
                "count_fully_enriched_design_sources".to_string(),
                json!({ "min_facets": 6, "max_facets": 8 })
            )]
        );
    }

    #[tokio::test]
    async fn failed_counts_degrade_to_zero_without_blocking_snapshot() {
        let store = MemoryStore::new().with_rows("pricing_intelligence", rows(5, |_| json!({})));
        store.fail("pricing_embeddings");

        let snapshot = compute_snapshot(&store, lookup(TaskId::Pricing), &ProgressContext::default()).await;
        assert_eq!(snapshot.source_total, 0);
        assert_eq!(snapshot.facets_created, 5);
        assert_eq!(snapshot.progress, 0);
        assert_eq!(snapshot.remaining, 0);
    }

    #[tokio::test]
    async fn compliance_is_optional_and_mapped_per_view() {
        let store = MemoryStore::new().with_rows(
            "practical_work_facet_compliance",
            vec![json!({
                "avg_facets_per_source": "7.6",
                "compliance_percentage": 91.5,
                "sources_enriched": 80,
                "total_facets": 640,
                "total_gold_sources": 100
            })],
        );
        let metrics = fetch_compliance(&store, lookup(TaskId::PracticalWork))
            .await
            .expect("metrics");
        assert_eq!(metrics.avg_facets_recent, Some(7.6));
        assert_eq!(metrics.total_sources, Some(100));

        store.fail("design_knowledge_facet_compliance");
        assert!(fetch_compliance(&store, lookup(TaskId::DesignKnowledge)).await.is_none());
        assert!(fetch_compliance(&store, lookup(TaskId::Pricing)).await.is_none());
    }

    #[test]
    fn strategy_selection_follows_registry() {
        assert_eq!(strategy_for_task(lookup(TaskId::Bs7671)).name(), "distinct_key");
        assert_eq!(strategy_for_task(lookup(TaskId::PracticalWork)).name(), "staged_facet");
        assert_eq!(strategy_for_task(lookup(TaskId::DesignKnowledge)).name(), "banded_facet");
        assert_eq!(strategy_for_task(lookup(TaskId::HealthSafety)).name(), "one_to_one");

        let mut faceted = lookup(TaskId::Pricing).clone();
        faceted.enrichment_model = EnrichmentModel::Faceted;
        faceted.target_multiplier = 4.0;
        faceted.progress = ProgressRule::FixedRatio;
        assert_eq!(strategy_for_task(&faceted).name(), "fixed_ratio");
    }
}
