use crate::comparison::buckets::FilterCondition;
use crate::error::{AppError, AppResult};
use crate::types::{ObjectType, ScoreSelector};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Request ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalUnit {
    Hour,
    Day,
    Week,
    Month,
}

impl IntervalUnit {
    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "hour" => Ok(IntervalUnit::Hour),
            "day" => Ok(IntervalUnit::Day),
            "week" => Ok(IntervalUnit::Week),
            "month" => Ok(IntervalUnit::Month),
            other => Err(AppError::Validation(format!(
                "unknown interval unit: {other:?}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalUnit::Hour => "hour",
            IntervalUnit::Day => "day",
            IntervalUnit::Week => "week",
            IntervalUnit::Month => "month",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeInterval {
    pub count: u32,
    pub unit: IntervalUnit,
}

impl TimeInterval {
    pub fn new(count: u32, unit: IntervalUnit) -> Self {
        Self { count, unit }
    }

    /// Day counts that are whole weeks become week intervals so they land
    /// on Monday boundaries.
    pub fn normalized(self) -> Self {
        match self.unit {
            IntervalUnit::Day if self.count > 0 && self.count % 7 == 0 => {
                TimeInterval::new(self.count / 7, IntervalUnit::Week)
            }
            _ => self,
        }
    }
}

/// Input of a score comparison.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonRequest {
    pub project_id: String,
    pub score1: ScoreSelector,
    pub score2: ScoreSelector,
    #[serde(default)]
    pub from_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to_timestamp: Option<DateTime<Utc>>,
    /// When present the time range is taken from this filter list instead.
    #[serde(default)]
    pub filter: Option<Vec<FilterCondition>>,
    #[serde(default)]
    pub interval: Option<TimeInterval>,
    #[serde(default)]
    pub n_bins: Option<u32>,
    #[serde(default)]
    pub object_type: ObjectType,
    #[serde(default)]
    pub max_matched_scores_limit: Option<u64>,
}

impl ComparisonRequest {
    pub fn new(project_id: impl Into<String>, score1: ScoreSelector, score2: ScoreSelector) -> Self {
        Self {
            project_id: project_id.into(),
            score1,
            score2,
            from_timestamp: None,
            to_timestamp: None,
            filter: None,
            interval: None,
            n_bins: None,
            object_type: ObjectType::All,
            max_matched_scores_limit: None,
        }
    }

    pub fn with_range(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from_timestamp = Some(from);
        self.to_timestamp = Some(to);
        self
    }

    pub fn with_interval(mut self, interval: TimeInterval) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn with_n_bins(mut self, n_bins: u32) -> Self {
        self.n_bins = Some(n_bins);
        self
    }

    pub fn with_object_type(mut self, object_type: ObjectType) -> Self {
        self.object_type = object_type;
        self
    }
}

// ── Result ──

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreCounts {
    pub score1_total: u64,
    pub score2_total: u64,
    pub matched_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeatmapCell {
    pub bin_x: u32,
    pub bin_y: u32,
    pub count: u64,
    pub min1: f64,
    pub max1: f64,
    pub min2: f64,
    pub max2: f64,
    pub global_min: f64,
    pub global_max: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfusionCell {
    pub row_category: String,
    pub col_category: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub avg1: Option<f64>,
    pub avg2: Option<f64>,
    pub count1: u64,
    pub count2: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoricalPoint {
    pub timestamp: DateTime<Utc>,
    pub category: String,
    pub count: u64,
}

/// One histogram bin. Numeric bins carry `lower`/`upper`, categorical bins
/// carry `category`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionBin {
    pub bin_index: u32,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    pub category: Option<String>,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub count: u64,
    pub pearson_correlation: Option<f64>,
    pub spearman_correlation: Option<f64>,
    pub mae: f64,
    pub rmse: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agreement {
    pub count: u64,
    pub agreement_rate: f64,
    pub cohens_kappa: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightEstimates {
    pub score1_count: u64,
    pub score2_count: u64,
    pub estimated_matched_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveFinal {
    pub used_final: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingMethod {
    None,
    Hash,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplingMetadata {
    pub is_sampled: bool,
    pub sampling_method: SamplingMethod,
    pub sampling_rate: f64,
    pub sampling_expression: Option<String>,
    pub estimated_total_matches: u64,
    pub actual_sample_size: u64,
    pub preflight_estimates: PreflightEstimates,
    pub adaptive_final: AdaptiveFinal,
}

/// Time bucketing applied to the time series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketInfo {
    /// `second` for planner-chosen fixed buckets, otherwise the calendar unit.
    pub unit: String,
    pub count: u32,
    pub seconds: Option<i64>,
}

/// Notes about degenerate inputs or degraded sub-queries. Never errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultWarning {
    ZeroMatches,
    IdenticalSelectors,
    SingleBin {
        score: u8,
    },
    LimitApplied {
        limit: u64,
        available: u64,
    },
    Degraded {
        #[serde(rename = "subQuery")]
        sub_query: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsResult {
    pub counts: ScoreCounts,
    pub heatmap: Vec<HeatmapCell>,
    pub confusion_matrix: Vec<ConfusionCell>,
    pub statistics: Option<Statistics>,
    pub agreement: Option<Agreement>,
    pub time_series: Vec<TimeSeriesPoint>,
    pub time_series_matched: Vec<TimeSeriesPoint>,
    pub time_series_categorical1: Vec<CategoricalPoint>,
    pub time_series_categorical2: Vec<CategoricalPoint>,
    pub time_series_categorical1_matched: Vec<CategoricalPoint>,
    pub time_series_categorical2_matched: Vec<CategoricalPoint>,
    pub distribution1: Vec<DistributionBin>,
    pub distribution2: Vec<DistributionBin>,
    pub distribution1_matched: Vec<DistributionBin>,
    pub distribution2_matched: Vec<DistributionBin>,
    pub distribution1_individual: Vec<DistributionBin>,
    pub distribution2_individual: Vec<DistributionBin>,
    pub sampling_metadata: SamplingMetadata,
    pub bucket: BucketInfo,
    pub warnings: Vec<ResultWarning>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ScoreDataType;

    #[test]
    fn test_seven_day_interval_normalizes_to_week() {
        let interval = TimeInterval::new(7, IntervalUnit::Day).normalized();
        assert_eq!(interval, TimeInterval::new(1, IntervalUnit::Week));
        let interval = TimeInterval::new(14, IntervalUnit::Day).normalized();
        assert_eq!(interval, TimeInterval::new(2, IntervalUnit::Week));
        let interval = TimeInterval::new(3, IntervalUnit::Day).normalized();
        assert_eq!(interval, TimeInterval::new(3, IntervalUnit::Day));
    }

    #[test]
    fn test_request_deserializes_camel_case() {
        let json = r#"{
            "projectId": "p1",
            "score1": {"name": "accuracy", "dataType": "NUMERIC", "source": "API"},
            "score2": {"name": "helpfulness", "dataType": "NUMERIC", "source": "EVAL"},
            "fromTimestamp": "2024-01-01T00:00:00Z",
            "toTimestamp": "2024-01-08T00:00:00Z",
            "interval": {"count": 1, "unit": "day"},
            "nBins": 20,
            "objectType": "dataset_run"
        }"#;
        let req: ComparisonRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.project_id, "p1");
        assert_eq!(req.score1.data_type, ScoreDataType::Numeric);
        assert_eq!(req.object_type, ObjectType::DatasetRun);
        assert_eq!(req.n_bins, Some(20));
        assert_eq!(req.interval, Some(TimeInterval::new(1, IntervalUnit::Day)));
        assert!(req.max_matched_scores_limit.is_none());
    }

    #[test]
    fn test_unknown_data_type_is_rejected() {
        let json = r#"{
            "projectId": "p1",
            "score1": {"name": "a", "dataType": "TEXT", "source": "API"},
            "score2": {"name": "b", "dataType": "NUMERIC", "source": "API"}
        }"#;
        assert!(serde_json::from_str::<ComparisonRequest>(json).is_err());
    }

    #[test]
    fn test_warning_serializes_with_kind_tag() {
        let json = serde_json::to_value(ResultWarning::Degraded {
            sub_query: "time_series_categorical1".to_string(),
        })
        .unwrap();
        assert_eq!(json["kind"], "degraded");
        assert_eq!(json["subQuery"], "time_series_categorical1");
        let json = serde_json::to_value(ResultWarning::ZeroMatches).unwrap();
        assert_eq!(json["kind"], "zero_matches");
    }
}
