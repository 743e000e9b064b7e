use crate::comparison::binning::{
    categorical_distribution, category_label, confusion_matrix, heatmap, histogram_values,
    numeric_distribution, validate_n_bins, BinSpec,
};
use crate::comparison::buckets::{range_from_filters, TimeBucketPlan};
use crate::comparison::sampling::{decide, extrapolate, ReadMode, SamplingPredicate};
use crate::comparison::series::{
    categorical_series, gap_filled_series, matched_categorical_series, matched_series,
};
use crate::comparison::stats::{agreement, compute_statistics};
use crate::comparison::types::{
    AnalyticsResult, ComparisonRequest, DistributionBin, IntervalUnit, ResultWarning,
    ScoreCounts, TimeInterval,
};
use crate::config::{AnalyticsConfig, EmptyRangePolicy};
use crate::error::{AppError, AppResult};
use crate::store::{
    Cancellation, CategoryCount, ComparisonQuery, HistogramBin, MatchedPair, ScoreStore, StoreError,
    StoreResult, ValueBounds,
};
use crate::types::{ScoreDataType, Side};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Runs score comparisons against a store.
#[derive(Clone)]
pub struct ComparisonEngine {
    store: Arc<dyn ScoreStore>,
    config: AnalyticsConfig,
}

/// Cancels the request scope when the owning request future is dropped.
/// Queued sub-queries skip the store and running ones are interrupted.
struct CancelGuard(Cancellation);

impl CancelGuard {
    fn new() -> Self {
        Self(Cancellation::new())
    }

    fn scope(&self) -> Cancellation {
        self.0.clone()
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Executes blocking store calls on the blocking pool under a timeout.
struct SubQueryRunner {
    store: Arc<dyn ScoreStore>,
    query: ComparisonQuery,
    timeout: Duration,
    scope: Cancellation,
}

impl SubQueryRunner {
    async fn run<T, F>(&self, name: &'static str, f: F) -> StoreResult<T>
    where
        F: FnOnce(&dyn ScoreStore, &ComparisonQuery) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        let cancel = self.scope.child();
        let query = ComparisonQuery {
            cancel: cancel.clone(),
            ..self.query.clone()
        };
        let handle = tokio::task::spawn_blocking(move || {
            query.cancel.check()?;
            f(store.as_ref(), &query)
        });
        match tokio::time::timeout(self.timeout, handle).await {
            Err(_) => {
                cancel.cancel();
                Err(StoreError::Timeout {
                    sub_query: name,
                    after_secs: self.timeout.as_secs(),
                })
            }
            Ok(Err(e)) => Err(StoreError::Join(e.to_string())),
            Ok(Ok(result)) => result,
        }
    }

    /// Like `run`, but resolves to an empty value without touching the
    /// store when the sub-query does not apply.
    async fn run_if<T, F>(&self, enabled: bool, name: &'static str, f: F) -> StoreResult<T>
    where
        F: FnOnce(&dyn ScoreStore, &ComparisonQuery) -> StoreResult<T> + Send + 'static,
        T: Send + Default + 'static,
    {
        if !enabled {
            return Ok(T::default());
        }
        self.run(name, f).await
    }
}

/// Non-critical sub-query outcome: errors become an empty value plus a
/// `degraded` warning.
fn degrade<T: Default>(
    result: StoreResult<T>,
    sub_query: &'static str,
    warnings: &mut Vec<ResultWarning>,
) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(sub_query, error = %e, "sub-query degraded to empty result");
            warnings.push(ResultWarning::Degraded {
                sub_query: sub_query.to_string(),
            });
            T::default()
        }
    }
}

/// Request after validation and range resolution.
struct ResolvedRequest {
    query: ComparisonQuery,
    plan: TimeBucketPlan,
    boundaries: Vec<i64>,
    n_bins: u32,
    pair_limit: u64,
}

impl ComparisonEngine {
    pub fn new(store: Arc<dyn ScoreStore>, config: AnalyticsConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &AnalyticsConfig {
        &self.config
    }

    pub async fn compare(&self, req: ComparisonRequest) -> AppResult<AnalyticsResult> {
        self.compare_at(req, Utc::now()).await
    }

    /// `compare` with an explicit "now" for the default window.
    pub async fn compare_at(
        &self,
        req: ComparisonRequest,
        now: DateTime<Utc>,
    ) -> AppResult<AnalyticsResult> {
        let started = Instant::now();
        let resolved = self.resolve(&req, now)?;
        let guard = CancelGuard::new();

        tracing::info!(
            project_id = %req.project_id,
            score1 = %req.score1.name,
            score2 = %req.score2.name,
            object_type = ?req.object_type,
            from_ms = resolved.query.from_ms,
            to_ms = resolved.query.to_ms,
            "score comparison requested"
        );

        // Preflight: counts under a small deterministic sample.
        let pct = self.config.preflight_sample_percent;
        let preflight_runner = SubQueryRunner {
            store: self.store.clone(),
            query: resolved.query.clone(),
            timeout: Duration::from_secs(self.config.preflight_timeout_secs),
            scope: guard.scope(),
        };
        let estimates = match preflight_runner
            .run("preflight", move |store, q| {
                let mut sampled = q.with_sampling(SamplingPredicate::from_percent(pct));
                sampled.read_mode = ReadMode::Fast;
                store.counts(&sampled)
            })
            .await
        {
            Ok(counts) => Some(extrapolate(counts, pct)),
            Err(StoreError::Cancelled) => return Err(StoreError::Cancelled.into()),
            Err(e) => {
                tracing::warn!(error = %e, "preflight failed; using FINAL without sampling");
                None
            }
        };
        let decision = decide(estimates, &self.config.sampling_thresholds());
        tracing::info!(
            is_sampled = decision.is_sampled(),
            sampling_rate = decision.predicate.rate(),
            used_final = decision.adaptive_final.used_final,
            reason = %decision.adaptive_final.reason,
            "sampling decision"
        );

        let mut query = resolved.query.clone();
        query.sampling = decision.predicate;
        query.read_mode = decision.read_mode;
        let runner = SubQueryRunner {
            store: self.store.clone(),
            query,
            timeout: Duration::from_secs(self.config.query_timeout_secs),
            scope: guard.scope(),
        };

        let type1 = req.score1.data_type;
        let type2 = req.score2.data_type;
        let numeric1 = type1.is_numeric();
        let numeric2 = type2.is_numeric();
        let plan = resolved.plan;
        let limit = resolved.pair_limit;

        // Wave 1: everything that does not depend on value bounds.
        let (counts, pairs, bounds1, bounds2, ts1, ts2, cat_ts1, cat_ts2, cats1, cats2) = tokio::join!(
            runner.run("counts", |s, q| s.counts(q)),
            runner.run("matched_pairs", move |s, q| s.matched_pairs(q, limit)),
            runner.run_if(numeric1, "value_bounds1", |s, q| s.value_bounds(q, Side::Score1)),
            runner.run_if(numeric2, "value_bounds2", |s, q| s.value_bounds(q, Side::Score2)),
            runner.run("time_series1", move |s, q| s.time_series(q, Side::Score1, &plan)),
            runner.run("time_series2", move |s, q| s.time_series(q, Side::Score2, &plan)),
            runner.run_if(!numeric1, "time_series_categorical1", move |s, q| {
                s.categorical_time_series(q, Side::Score1, &plan)
            }),
            runner.run_if(!numeric2, "time_series_categorical2", move |s, q| {
                s.categorical_time_series(q, Side::Score2, &plan)
            }),
            runner.run_if(!numeric1, "category_counts1", |s, q| s.category_counts(q, Side::Score1)),
            runner.run_if(!numeric2, "category_counts2", |s, q| s.category_counts(q, Side::Score2)),
        );

        let counts: ScoreCounts = counts?;
        let pairs: Vec<MatchedPair> = pairs?;

        let mut warnings = Vec::new();
        let bounds1: Option<ValueBounds> = degrade(bounds1, "value_bounds1", &mut warnings);
        let bounds2: Option<ValueBounds> = degrade(bounds2, "value_bounds2", &mut warnings);
        let ts1 = degrade(ts1, "time_series1", &mut warnings);
        let ts2 = degrade(ts2, "time_series2", &mut warnings);
        let cat_ts1 = degrade(cat_ts1, "time_series_categorical1", &mut warnings);
        let cat_ts2 = degrade(cat_ts2, "time_series_categorical2", &mut warnings);
        let cats1: Vec<CategoryCount> = degrade(cats1, "category_counts1", &mut warnings);
        let cats2: Vec<CategoryCount> = degrade(cats2, "category_counts2", &mut warnings);

        // Wave 2: histograms over shared and individual bounds.
        let n_bins = resolved.n_bins;
        let own1 = bounds1.map(|b| b.bins(n_bins));
        let own2 = bounds2.map(|b| b.bins(n_bins));
        let shared = match (own1, own2) {
            (Some(a), Some(b)) => Some(a.union(&b)),
            (a, b) => a.or(b),
        };
        let (hist1, hist2, hist1_own, hist2_own) = tokio::join!(
            histogram(&runner, shared.filter(|_| numeric1), Side::Score1, "distribution1"),
            histogram(&runner, shared.filter(|_| numeric2), Side::Score2, "distribution2"),
            histogram(&runner, own1, Side::Score1, "distribution1_individual"),
            histogram(&runner, own2, Side::Score2, "distribution2_individual"),
        );
        let hist1 = degrade(hist1, "distribution1", &mut warnings);
        let hist2 = degrade(hist2, "distribution2", &mut warnings);
        let hist1_own = degrade(hist1_own, "distribution1_individual", &mut warnings);
        let hist2_own = degrade(hist2_own, "distribution2_individual", &mut warnings);

        // In-process aggregation of the matched set.
        let identical = req.score1 == req.score2;
        let matched_count = pairs.len() as u64;
        let both_numeric = numeric1 && numeric2;
        let numeric_pairs: Vec<(f64, f64)> = if both_numeric {
            pairs
                .iter()
                .filter_map(|p| p.value1.zip(p.value2))
                .collect()
        } else {
            Vec::new()
        };

        let heatmap = if both_numeric {
            heatmap(&numeric_pairs, n_bins)
        } else {
            Vec::new()
        };
        let confusion = if both_numeric {
            Vec::new()
        } else {
            let labels: Vec<(String, String)> = pairs
                .iter()
                .map(|p| {
                    (
                        category_label(type1, p.value1, p.string_value1.as_deref()),
                        category_label(type2, p.value2, p.string_value2.as_deref()),
                    )
                })
                .collect();
            confusion_matrix(&labels)
        };
        let statistics = if both_numeric {
            compute_statistics(&numeric_pairs, identical)
        } else {
            None
        };
        let agreement = if both_numeric { None } else { agreement(&confusion) };

        let (distribution1, distribution1_matched, distribution1_individual) = distributions(
            type1,
            shared,
            own1,
            hist1,
            hist1_own,
            cats1,
            &pairs,
            Side::Score1,
        );
        let (distribution2, distribution2_matched, distribution2_individual) = distributions(
            type2,
            shared,
            own2,
            hist2,
            hist2_own,
            cats2,
            &pairs,
            Side::Score2,
        );

        let time_series = gap_filled_series(&resolved.boundaries, &ts1, &ts2);
        let time_series_matched = matched_series(&plan, &pairs);
        let time_series_categorical1 = categorical_series(&cat_ts1, type1);
        let time_series_categorical2 = categorical_series(&cat_ts2, type2);
        let time_series_categorical1_matched = if numeric1 {
            Vec::new()
        } else {
            matched_categorical_series(&plan, &pairs, Side::Score1, type1)
        };
        let time_series_categorical2_matched = if numeric2 {
            Vec::new()
        } else {
            matched_categorical_series(&plan, &pairs, Side::Score2, type2)
        };

        // Degenerate input notes.
        let mut notes = Vec::new();
        if matched_count == 0 {
            notes.push(ResultWarning::ZeroMatches);
        }
        if identical {
            notes.push(ResultWarning::IdenticalSelectors);
        }
        if own1.is_some_and(|s| s.is_degenerate()) {
            notes.push(ResultWarning::SingleBin { score: 1 });
        }
        if own2.is_some_and(|s| s.is_degenerate()) {
            notes.push(ResultWarning::SingleBin { score: 2 });
        }
        if counts.matched_count > matched_count && matched_count >= limit {
            notes.push(ResultWarning::LimitApplied {
                limit,
                available: counts.matched_count,
            });
        }
        for note in &notes {
            tracing::info!(project_id = %req.project_id, warning = ?note, "degenerate comparison input");
        }
        notes.extend(warnings);

        let result = AnalyticsResult {
            counts: ScoreCounts {
                score1_total: counts.score1_total,
                score2_total: counts.score2_total,
                matched_count,
            },
            heatmap,
            confusion_matrix: confusion,
            statistics,
            agreement,
            time_series,
            time_series_matched,
            time_series_categorical1,
            time_series_categorical2,
            time_series_categorical1_matched,
            time_series_categorical2_matched,
            distribution1,
            distribution2,
            distribution1_matched,
            distribution2_matched,
            distribution1_individual,
            distribution2_individual,
            sampling_metadata: decision.metadata(matched_count),
            bucket: plan.info(),
            warnings: notes,
        };

        tracing::info!(
            project_id = %req.project_id,
            score1_total = result.counts.score1_total,
            score2_total = result.counts.score2_total,
            matched_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "score comparison completed"
        );
        Ok(result)
    }

    /// Validation and time range resolution. Nothing here touches the store.
    fn resolve(&self, req: &ComparisonRequest, now: DateTime<Utc>) -> AppResult<ResolvedRequest> {
        if req.project_id.trim().is_empty() {
            return Err(AppError::Validation("projectId must not be empty".to_string()));
        }
        req.score1.validate("score1")?;
        req.score2.validate("score2")?;
        let n_bins = validate_n_bins(req.n_bins, self.config.default_n_bins)?;
        if req.max_matched_scores_limit == Some(0) {
            return Err(AppError::Validation(
                "maxMatchedScoresLimit must be greater than 0".to_string(),
            ));
        }
        let pair_limit = req
            .max_matched_scores_limit
            .map_or(self.config.max_matched_pairs, |l| {
                l.min(self.config.max_matched_pairs)
            });

        let days = ChronoDuration::days(self.config.default_range_days);
        let mut interval = req.interval;
        let (from, to) = match &req.filter {
            Some(filters) => range_from_filters(filters)?,
            None => match (req.from_timestamp, req.to_timestamp) {
                (Some(from), Some(to)) => {
                    if from >= to {
                        return Err(AppError::Validation(
                            "fromTimestamp must be before toTimestamp".to_string(),
                        ));
                    }
                    (from, to)
                }
                (Some(from), None) => (from, now),
                (None, Some(to)) => (to - days, to),
                (None, None) => match self.config.empty_range_policy {
                    EmptyRangePolicy::Reject => {
                        return Err(AppError::InvalidFilter(
                            "a time range is required".to_string(),
                        ))
                    }
                    EmptyRangePolicy::DefaultWindow => {
                        interval = interval.or(Some(TimeInterval::new(1, IntervalUnit::Week)));
                        (now - days, now)
                    }
                },
            },
        };
        if from >= to {
            return Err(AppError::Validation(
                "time range must not be empty".to_string(),
            ));
        }

        let from_ms = from.timestamp_millis();
        let to_ms = to.timestamp_millis();
        let plan = TimeBucketPlan::for_range(interval, from_ms, to_ms)?;
        let boundaries = plan.boundaries(from_ms, to_ms)?;

        Ok(ResolvedRequest {
            query: ComparisonQuery {
                project_id: req.project_id.clone(),
                score1: req.score1.clone(),
                score2: req.score2.clone(),
                object_type: req.object_type,
                from_ms,
                to_ms,
                sampling: SamplingPredicate::all(),
                read_mode: ReadMode::Final,
                cancel: Cancellation::new(),
            },
            plan,
            boundaries,
            n_bins,
            pair_limit,
        })
    }
}

async fn histogram(
    runner: &SubQueryRunner,
    spec: Option<BinSpec>,
    side: Side,
    name: &'static str,
) -> StoreResult<Vec<HistogramBin>> {
    match spec {
        Some(spec) => runner.run(name, move |s, q| s.histogram(q, side, &spec)).await,
        None => Ok(Vec::new()),
    }
}

/// Plain, matched and individual distributions for one side.
#[allow(clippy::too_many_arguments)]
fn distributions(
    data_type: ScoreDataType,
    shared: Option<BinSpec>,
    own: Option<BinSpec>,
    hist: Vec<HistogramBin>,
    hist_own: Vec<HistogramBin>,
    categories: Vec<CategoryCount>,
    pairs: &[MatchedPair],
    side: Side,
) -> (Vec<DistributionBin>, Vec<DistributionBin>, Vec<DistributionBin>) {
    let side_value = |p: &MatchedPair| match side {
        Side::Score1 => (p.value1, p.string_value1.clone()),
        Side::Score2 => (p.value2, p.string_value2.clone()),
    };

    if data_type.is_numeric() {
        let plain = shared
            .map(|spec| numeric_distribution(hist.iter().map(|h| (h.bin, h.count)), &spec))
            .unwrap_or_default();
        let matched = shared
            .map(|spec| histogram_values(pairs.iter().filter_map(|p| side_value(p).0), &spec))
            .unwrap_or_default();
        let individual = own
            .map(|spec| numeric_distribution(hist_own.iter().map(|h| (h.bin, h.count)), &spec))
            .unwrap_or_default();
        (plain, matched, individual)
    } else {
        let plain = categorical_distribution(categories.into_iter().map(|c| {
            (
                category_label(data_type, c.value, c.string_value.as_deref()),
                c.count,
            )
        }));
        let matched = categorical_distribution(pairs.iter().map(|p| {
            let (value, string_value) = side_value(p);
            (category_label(data_type, value, string_value.as_deref()), 1)
        }));
        let individual = plain.clone();
        (plain, matched, individual)
    }
}
