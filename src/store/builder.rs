//! SQL rendering for the DuckDB store. Values travel as positional
//! parameters; only integers computed here (limits, bin counts, bucket
//! widths, the sampling threshold) are inlined.

use crate::comparison::binning::BinSpec;
use crate::comparison::buckets::TimeBucketPlan;
use crate::comparison::sampling::ReadMode;
use crate::comparison::types::IntervalUnit;
use crate::store::ComparisonQuery;
use crate::types::{ScoreDataType, Side};

/// Scope-prefixed parent key. Precedence matches `MatchKey::for_record`.
pub const MATCH_KEY_SQL: &str = "CASE \
    WHEN trace_id IS NOT NULL AND observation_id IS NOT NULL THEN 'o:' || trace_id || ':' || observation_id \
    WHEN trace_id IS NOT NULL THEN 't:' || trace_id \
    WHEN session_id IS NOT NULL THEN 's:' || session_id \
    WHEN dataset_run_id IS NOT NULL THEN 'd:' || dataset_run_id \
    END";

pub const SCOPE_SQL: &str = "CASE \
    WHEN trace_id IS NOT NULL AND observation_id IS NOT NULL THEN 'observation' \
    WHEN trace_id IS NOT NULL THEN 'trace' \
    WHEN session_id IS NOT NULL THEN 'session' \
    WHEN dataset_run_id IS NOT NULL THEN 'dataset_run' \
    END";

/// 1970-01-05 00:00 UTC minus the epoch, so week buckets start on Monday.
const WEEK_ANCHOR_MS: i64 = 345_600_000;

#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Int(i64),
    Real(f64),
}

#[derive(Debug, Default)]
pub struct SqlBuilder {
    params: Vec<SqlParam>,
}

impl SqlBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parameter and return its `$n` placeholder.
    pub fn bind(&mut self, param: SqlParam) -> String {
        self.params.push(param);
        format!("${}", self.params.len())
    }

    pub fn into_params(self) -> Vec<SqlParam> {
        self.params
    }
}

#[derive(Debug, Clone)]
pub struct RenderedQuery {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

/// Renders the sub-queries of one comparison against `table`.
pub struct QueryRenderer<'a> {
    table: &'a str,
    q: &'a ComparisonQuery,
    builder: SqlBuilder,
    project: String,
    from: String,
    to: String,
    scope: Option<String>,
}

impl<'a> QueryRenderer<'a> {
    pub fn new(table: &'a str, q: &'a ComparisonQuery) -> Self {
        let mut builder = SqlBuilder::new();
        let project = builder.bind(SqlParam::Text(q.project_id.clone()));
        let from = builder.bind(SqlParam::Int(q.from_ms));
        let to = builder.bind(SqlParam::Int(q.to_ms));
        let scope = q
            .object_type
            .scope()
            .map(|s| builder.bind(SqlParam::Text(s.as_str().to_string())));
        Self {
            table,
            q,
            builder,
            project,
            from,
            to,
            scope,
        }
    }

    fn stream_cte(&mut self, alias: &str, side: Side) -> String {
        let selector = self.q.selector(side);
        let name = self.builder.bind(SqlParam::Text(selector.name.clone()));
        let source = self.builder.bind(SqlParam::Text(selector.source.clone()));
        let data_type = self
            .builder
            .bind(SqlParam::Text(selector.data_type.as_str().to_string()));

        let value_filter = if selector.data_type == ScoreDataType::Numeric {
            "\n            AND \"value\" IS NOT NULL"
        } else {
            ""
        };
        let scope_filter = self
            .scope
            .as_ref()
            .map(|p| format!("\n        AND scope = {p}"))
            .unwrap_or_default();
        let sampling_filter = self
            .q
            .sampling
            .sql("match_key")
            .map(|p| format!("\n        AND {p}"))
            .unwrap_or_default();
        let dedupe = match self.q.read_mode {
            ReadMode::Final => "\n    QUALIFY ROW_NUMBER() OVER (PARTITION BY match_key ORDER BY created_at DESC, id DESC) = 1",
            ReadMode::Fast => "",
        };

        format!(
            r#"{alias} AS (
    SELECT match_key, val, sval, ts FROM (
        SELECT
            {MATCH_KEY_SQL} AS match_key,
            {SCOPE_SQL} AS scope,
            "value" AS val,
            string_value AS sval,
            "timestamp" AS ts,
            created_at,
            id
        FROM {table}
        WHERE project_id = {project}
            AND "timestamp" >= {from} AND "timestamp" <= {to}
            AND name = {name} AND source = {source} AND data_type = {data_type}{value_filter}
    ) base
    WHERE match_key IS NOT NULL{scope_filter}{sampling_filter}{dedupe}
)"#,
            table = self.table,
            project = self.project,
            from = self.from,
            to = self.to,
        )
    }

    fn finish(self, sql: String) -> RenderedQuery {
        RenderedQuery {
            sql,
            params: self.builder.into_params(),
        }
    }

    pub fn counts(mut self) -> RenderedQuery {
        let s1 = self.stream_cte("s1", Side::Score1);
        let s2 = self.stream_cte("s2", Side::Score2);
        let sql = format!(
            r#"WITH {s1},
{s2}
SELECT
    (SELECT COUNT(*) FROM s1) AS score1_total,
    (SELECT COUNT(*) FROM s2) AS score2_total,
    (SELECT COUNT(*) FROM s1 JOIN s2 ON s1.match_key = s2.match_key) AS matched_count"#
        );
        self.finish(sql)
    }

    pub fn matched_pairs(mut self, limit: u64) -> RenderedQuery {
        let s1 = self.stream_cte("s1", Side::Score1);
        let s2 = self.stream_cte("s2", Side::Score2);
        let sql = format!(
            r#"WITH {s1},
{s2}
SELECT s1.match_key, s1.val, s1.sval, s1.ts, s2.val, s2.sval, s2.ts
FROM s1
JOIN s2 ON s1.match_key = s2.match_key
ORDER BY s1.ts, s1.match_key
LIMIT {limit}"#
        );
        self.finish(sql)
    }

    pub fn value_bounds(mut self, side: Side) -> RenderedQuery {
        let s = self.stream_cte("s", side);
        let sql = format!(
            "WITH {s}\nSELECT MIN(val), MAX(val), COUNT(val) FROM s WHERE val IS NOT NULL"
        );
        self.finish(sql)
    }

    pub fn histogram(mut self, side: Side, spec: &BinSpec) -> RenderedQuery {
        let s = self.stream_cte("s", side);
        let min = self.builder.bind(SqlParam::Real(spec.min));
        let width = self.builder.bind(SqlParam::Real(spec.width()));
        let last = spec.n_bins.saturating_sub(1);
        let sql = format!(
            r#"WITH {s}
SELECT GREATEST(0, LEAST({last}, CAST(floor((val - {min}) / {width}) AS BIGINT))) AS bin, COUNT(*)
FROM s
WHERE val IS NOT NULL
GROUP BY bin
ORDER BY bin"#
        );
        self.finish(sql)
    }

    pub fn category_counts(mut self, side: Side) -> RenderedQuery {
        let s = self.stream_cte("s", side);
        let sql = format!(
            "WITH {s}\nSELECT sval, val, COUNT(*) FROM s GROUP BY sval, val ORDER BY sval, val"
        );
        self.finish(sql)
    }

    pub fn time_series(mut self, side: Side, plan: &TimeBucketPlan) -> RenderedQuery {
        let s = self.stream_cte("s", side);
        let bucket = bucket_expr(plan, "ts");
        let sql = format!(
            "WITH {s}\nSELECT {bucket} AS bucket, AVG(val), COUNT(*) FROM s GROUP BY bucket ORDER BY bucket"
        );
        self.finish(sql)
    }

    pub fn categorical_time_series(mut self, side: Side, plan: &TimeBucketPlan) -> RenderedQuery {
        let s = self.stream_cte("s", side);
        let bucket = bucket_expr(plan, "ts");
        let sql = format!(
            "WITH {s}\nSELECT {bucket} AS bucket, sval, val, COUNT(*) FROM s GROUP BY bucket, sval, val ORDER BY bucket, sval, val"
        );
        self.finish(sql)
    }
}

fn floor_to(col: &str, width_ms: i64) -> String {
    format!("(CAST(floor({col} / {width_ms}.0) AS BIGINT) * {width_ms})")
}

/// Bucket start (epoch ms) for the millisecond column `col`. Mirrors
/// `TimeBucketPlan::bucket_start`.
pub fn bucket_expr(plan: &TimeBucketPlan, col: &str) -> String {
    match *plan {
        TimeBucketPlan::Fixed { seconds } => floor_to(col, seconds.max(1) * 1000),
        TimeBucketPlan::Calendar(interval) => {
            let count = i64::from(interval.count.max(1));
            match interval.unit {
                IntervalUnit::Hour => floor_to(col, count * 3_600_000),
                IntervalUnit::Day => floor_to(col, count * 86_400_000),
                IntervalUnit::Week => {
                    let width = count * 604_800_000;
                    format!(
                        "(CAST(floor(({col} - {WEEK_ANCHOR_MS}) / {width}.0) AS BIGINT) * {width} + {WEEK_ANCHOR_MS})"
                    )
                }
                IntervalUnit::Month => {
                    let month_index =
                        format!("(year(epoch_ms({col})) * 12 + month(epoch_ms({col})) - 1)");
                    let aligned = format!("(CAST(floor({month_index} / {count}.0) AS BIGINT) * {count})");
                    format!(
                        "epoch_ms(make_timestamp(CAST(floor({aligned} / 12.0) AS BIGINT), \
                         {aligned} - CAST(floor({aligned} / 12.0) AS BIGINT) * 12 + 1, 1, 0, 0, 0.0))"
                    )
                }
            }
        }
    }
}
