//! Read side of the analytics engine. A `ScoreStore` answers the per-stream
//! sub-queries of a comparison; aggregation of the matched set happens in
//! the engine.

pub mod builder;
pub mod cancel;
pub mod duckdb_store;
pub mod memory;

use crate::comparison::binning::BinSpec;
use crate::comparison::buckets::TimeBucketPlan;
use crate::comparison::sampling::{ReadMode, SamplingPredicate};
use crate::comparison::types::ScoreCounts;
use crate::types::{ObjectType, ScoreSelector, Side};

pub use self::cancel::Cancellation;
pub use self::duckdb_store::DuckDbStore;
pub use self::memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{sub_query} timed out after {after_secs}s")]
    Timeout {
        sub_query: &'static str,
        after_secs: u64,
    },

    #[error("query failed: {0}")]
    Query(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("spawn_blocking join error: {0}")]
    Join(String),
}

impl From<duckdb::Error> for StoreError {
    fn from(e: duckdb::Error) -> Self {
        StoreError::Query(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Everything a store needs to select the two score streams of one
/// request. The sampling predicate and read mode are shared by every
/// sub-query so all of them see the same entities.
#[derive(Debug, Clone)]
pub struct ComparisonQuery {
    pub project_id: String,
    pub score1: ScoreSelector,
    pub score2: ScoreSelector,
    pub object_type: ObjectType,
    /// Inclusive event-time range, epoch milliseconds.
    pub from_ms: i64,
    pub to_ms: i64,
    pub sampling: SamplingPredicate,
    pub read_mode: ReadMode,
    /// Scope of the running sub-query. Stores register interrupt hooks on
    /// it and stop early once it is cancelled.
    pub cancel: Cancellation,
}

impl ComparisonQuery {
    pub fn selector(&self, side: Side) -> &ScoreSelector {
        match side {
            Side::Score1 => &self.score1,
            Side::Score2 => &self.score2,
        }
    }

    pub fn with_sampling(&self, sampling: SamplingPredicate) -> Self {
        Self {
            sampling,
            ..self.clone()
        }
    }
}

/// One score1/score2 pair sharing a match key.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedPair {
    pub match_key: String,
    pub value1: Option<f64>,
    pub string_value1: Option<String>,
    pub timestamp1: i64,
    pub value2: Option<f64>,
    pub string_value2: Option<String>,
    pub timestamp2: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueBounds {
    pub min: f64,
    pub max: f64,
    pub count: u64,
}

impl ValueBounds {
    pub fn bins(&self, n_bins: u32) -> BinSpec {
        BinSpec::new(self.min, self.max, n_bins)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistogramBin {
    pub bin: u32,
    pub count: u64,
}

/// Raw category group; the engine turns it into a display label.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryCount {
    pub string_value: Option<String>,
    pub value: Option<f64>,
    pub count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketAverage {
    pub bucket_start: i64,
    pub avg: Option<f64>,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CategoryBucketCount {
    pub bucket_start: i64,
    pub string_value: Option<String>,
    pub value: Option<f64>,
    pub count: u64,
}

/// Columnar score store. Methods are blocking; the engine runs each call
/// on the blocking pool under a timeout.
pub trait ScoreStore: Send + Sync + 'static {
    /// Per-stream totals and the number of joined pairs.
    fn counts(&self, q: &ComparisonQuery) -> StoreResult<ScoreCounts>;

    /// Joined pairs ordered by score1 timestamp, at most `limit` rows.
    fn matched_pairs(&self, q: &ComparisonQuery, limit: u64) -> StoreResult<Vec<MatchedPair>>;

    /// Numeric range of one stream, `None` when it has no values.
    fn value_bounds(&self, q: &ComparisonQuery, side: Side) -> StoreResult<Option<ValueBounds>>;

    /// Sparse equal-width histogram of one stream.
    fn histogram(
        &self,
        q: &ComparisonQuery,
        side: Side,
        spec: &BinSpec,
    ) -> StoreResult<Vec<HistogramBin>>;

    fn category_counts(&self, q: &ComparisonQuery, side: Side) -> StoreResult<Vec<CategoryCount>>;

    /// Non-empty time buckets of one stream.
    fn time_series(
        &self,
        q: &ComparisonQuery,
        side: Side,
        plan: &TimeBucketPlan,
    ) -> StoreResult<Vec<BucketAverage>>;

    fn categorical_time_series(
        &self,
        q: &ComparisonQuery,
        side: Side,
        plan: &TimeBucketPlan,
    ) -> StoreResult<Vec<CategoryBucketCount>>;
}
