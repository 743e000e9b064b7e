use crate::error::{AppError, AppResult, LoggedJson};
use crate::ingest::IngestState;
use crate::storage::writer::write_scores;
use crate::types::{ScoreDataType, ScoreRecord};
use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const DEFAULT_SOURCE: &str = "API";

/// A score as submitted by a client.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreInput {
    #[serde(default)]
    pub id: Option<String>,
    pub project_id: String,
    pub name: String,
    #[serde(default)]
    pub source: Option<String>,
    pub data_type: ScoreDataType,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub string_value: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub observation_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub dataset_run_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

fn validate_name(field: &str, value: &str) -> AppResult<()> {
    if value.is_empty() || value.len() > 64 {
        return Err(AppError::Validation(format!("{field} must be 1-64 characters")));
    }
    if !value
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    {
        return Err(AppError::Validation(format!(
            "{field} must be alphanumeric, underscore, or hyphen"
        )));
    }
    Ok(())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Validate a submitted score and turn it into a stored record.
pub fn process_score(input: ScoreInput, now_ms: i64) -> AppResult<ScoreRecord> {
    if input.project_id.trim().is_empty() {
        return Err(AppError::Validation("projectId is required".to_string()));
    }
    validate_name("name", &input.name)?;
    let source = input.source.unwrap_or_else(|| DEFAULT_SOURCE.to_string());
    validate_name("source", &source)?;

    if input.value.is_some_and(|v| !v.is_finite()) {
        return Err(AppError::Validation("value must be a finite number".to_string()));
    }
    let string_value = non_empty(input.string_value);
    let (value, string_value) = match input.data_type {
        ScoreDataType::Numeric => match input.value {
            Some(v) => (Some(v), string_value),
            None => {
                return Err(AppError::Validation(
                    "NUMERIC scores require a value".to_string(),
                ))
            }
        },
        ScoreDataType::Boolean => match input.value {
            Some(v) if v == 0.0 || v == 1.0 => {
                let label = if v == 1.0 { "True" } else { "False" };
                (Some(v), Some(string_value.unwrap_or_else(|| label.to_string())))
            }
            _ => {
                return Err(AppError::Validation(
                    "BOOLEAN scores require a value of 0 or 1".to_string(),
                ))
            }
        },
        ScoreDataType::Categorical => match string_value {
            Some(s) => (input.value, Some(s)),
            None => {
                return Err(AppError::Validation(
                    "CATEGORICAL scores require a stringValue".to_string(),
                ))
            }
        },
    };

    let trace_id = non_empty(input.trace_id);
    let observation_id = non_empty(input.observation_id);
    let session_id = non_empty(input.session_id);
    let dataset_run_id = non_empty(input.dataset_run_id);
    if observation_id.is_some() && trace_id.is_none() {
        return Err(AppError::Validation(
            "observationId requires traceId".to_string(),
        ));
    }
    if trace_id.is_none() && session_id.is_none() && dataset_run_id.is_none() {
        return Err(AppError::Validation(
            "one of traceId, sessionId or datasetRunId is required".to_string(),
        ));
    }

    Ok(ScoreRecord {
        id: non_empty(input.id).unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        project_id: input.project_id,
        name: input.name,
        source,
        data_type: input.data_type,
        value,
        string_value,
        trace_id,
        observation_id,
        session_id,
        dataset_run_id,
        timestamp: input.timestamp.map_or(now_ms, |t| t.timestamp_millis()),
        created_at: now_ms,
    })
}

/// POST /v1/scores - Store a single score.
pub async fn ingest_score(
    State(state): State<Arc<IngestState>>,
    LoggedJson(input): LoggedJson<ScoreInput>,
) -> AppResult<Json<serde_json::Value>> {
    let record = process_score(input, Utc::now().timestamp_millis())?;
    let id = record.id.clone();
    write_scores(&state.pool, vec![record]).await?;
    Ok(Json(serde_json::json!({ "status": "accepted", "id": id })))
}

#[derive(Deserialize)]
pub struct BatchPayload {
    pub scores: Vec<ScoreInput>,
}

/// POST /v1/scores/batch - Store a batch of scores. Invalid entries are
/// reported by index; valid ones are written together.
pub async fn ingest_batch(
    State(state): State<Arc<IngestState>>,
    LoggedJson(payload): LoggedJson<BatchPayload>,
) -> AppResult<Json<serde_json::Value>> {
    if payload.scores.len() > state.config.max_batch_size {
        return Err(AppError::Validation(format!(
            "batch exceeds max size of {}",
            state.config.max_batch_size
        )));
    }

    let now_ms = Utc::now().timestamp_millis();
    let mut records = Vec::with_capacity(payload.scores.len());
    let mut errors = Vec::new();
    for (i, input) in payload.scores.into_iter().enumerate() {
        match process_score(input, now_ms) {
            Ok(record) => records.push(record),
            Err(e) => errors.push(serde_json::json!({
                "index": i,
                "error": e.to_string(),
            })),
        }
    }

    let accepted = write_scores(&state.pool, records).await?;
    if !errors.is_empty() {
        tracing::warn!(rejected = errors.len(), accepted, "score batch partially rejected");
    }

    Ok(Json(serde_json::json!({
        "accepted": accepted,
        "errors": errors,
    })))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub db_ok: bool,
}

/// GET /health
pub async fn health(State(state): State<Arc<IngestState>>) -> Json<HealthResponse> {
    let db_ok = match state.pool.get().await {
        Ok(conn) => conn
            .interact(|conn| conn.execute_batch("SELECT 1"))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false),
        Err(_) => false,
    };

    Json(HealthResponse {
        status: if db_ok { "ok" } else { "degraded" }.to_string(),
        db_ok,
    })
}
