use crate::comparison::types::{AnalyticsResult, ComparisonRequest, IntervalUnit, TimeInterval};
use crate::comparison::ComparisonEngine;
use crate::error::{AppError, AppResult, LoggedJson};
use crate::types::{ObjectType, ScoreDataType, ScoreSelector};
use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;

/// Flattened query-string form of a comparison request.
#[derive(Debug, Deserialize)]
pub struct ComparisonQueryParams {
    pub project_id: String,
    pub score1_name: String,
    pub score1_data_type: String,
    pub score1_source: String,
    pub score2_name: String,
    pub score2_data_type: String,
    pub score2_source: String,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub interval_count: Option<u32>,
    pub interval_unit: Option<String>,
    pub n_bins: Option<u32>,
    pub object_type: Option<String>,
    pub max_matched_scores_limit: Option<u64>,
}

impl ComparisonQueryParams {
    pub fn into_request(self) -> AppResult<ComparisonRequest> {
        let score1 = ScoreSelector::new(
            self.score1_name,
            ScoreDataType::parse(&self.score1_data_type)?,
            self.score1_source,
        );
        let score2 = ScoreSelector::new(
            self.score2_name,
            ScoreDataType::parse(&self.score2_data_type)?,
            self.score2_source,
        );
        let interval = match (self.interval_count, self.interval_unit) {
            (None, None) => None,
            (count, Some(unit)) => Some(TimeInterval::new(
                count.unwrap_or(1),
                IntervalUnit::parse(&unit)?,
            )),
            (Some(_), None) => {
                return Err(AppError::Validation(
                    "interval_count requires interval_unit".to_string(),
                ))
            }
        };
        let object_type = match self.object_type {
            Some(raw) => ObjectType::parse(&raw)?,
            None => ObjectType::All,
        };

        Ok(ComparisonRequest {
            project_id: self.project_id,
            score1,
            score2,
            from_timestamp: self.from,
            to_timestamp: self.to,
            filter: None,
            interval,
            n_bins: self.n_bins,
            object_type,
            max_matched_scores_limit: self.max_matched_scores_limit,
        })
    }
}

/// POST /v1/scores/comparison
pub async fn compare_scores(
    State(engine): State<Arc<ComparisonEngine>>,
    LoggedJson(req): LoggedJson<ComparisonRequest>,
) -> AppResult<Json<AnalyticsResult>> {
    Ok(Json(engine.compare(req).await?))
}

/// GET /v1/scores/comparison
pub async fn compare_scores_query(
    State(engine): State<Arc<ComparisonEngine>>,
    Query(params): Query<ComparisonQueryParams>,
) -> AppResult<Json<AnalyticsResult>> {
    let req = params.into_request()?;
    Ok(Json(engine.compare(req).await?))
}
