use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};

/// Data type of a score stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScoreDataType {
    Numeric,
    Boolean,
    Categorical,
}

impl ScoreDataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreDataType::Numeric => "NUMERIC",
            ScoreDataType::Boolean => "BOOLEAN",
            ScoreDataType::Categorical => "CATEGORICAL",
        }
    }

    /// Parse a data type name, case-insensitively.
    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "NUMERIC" => Ok(ScoreDataType::Numeric),
            "BOOLEAN" => Ok(ScoreDataType::Boolean),
            "CATEGORICAL" => Ok(ScoreDataType::Categorical),
            other => Err(AppError::Validation(format!(
                "unknown score data type: {other:?} (expected NUMERIC, BOOLEAN or CATEGORICAL)"
            ))),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ScoreDataType::Numeric)
    }
}

/// Identifies one logical score stream within a project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreSelector {
    pub name: String,
    pub data_type: ScoreDataType,
    pub source: String,
}

impl ScoreSelector {
    pub fn new(name: impl Into<String>, data_type: ScoreDataType, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type,
            source: source.into(),
        }
    }

    pub fn validate(&self, label: &str) -> AppResult<()> {
        if self.name.trim().is_empty() {
            return Err(AppError::Validation(format!("{label}.name must not be empty")));
        }
        if self.source.trim().is_empty() {
            return Err(AppError::Validation(format!(
                "{label}.source must not be empty"
            )));
        }
        Ok(())
    }
}

/// Which parent entity kinds a comparison covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    #[default]
    All,
    Trace,
    Observation,
    Session,
    DatasetRun,
}

impl ObjectType {
    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim() {
            "all" => Ok(ObjectType::All),
            "trace" => Ok(ObjectType::Trace),
            "observation" => Ok(ObjectType::Observation),
            "session" => Ok(ObjectType::Session),
            "dataset_run" => Ok(ObjectType::DatasetRun),
            other => Err(AppError::Validation(format!(
                "unknown object type: {other:?}"
            ))),
        }
    }

    /// The single scope this filter selects, or `None` for `all`.
    pub fn scope(&self) -> Option<ScopeKind> {
        match self {
            ObjectType::All => None,
            ObjectType::Trace => Some(ScopeKind::Trace),
            ObjectType::Observation => Some(ScopeKind::Observation),
            ObjectType::Session => Some(ScopeKind::Session),
            ObjectType::DatasetRun => Some(ScopeKind::DatasetRun),
        }
    }

    pub fn includes(&self, scope: ScopeKind) -> bool {
        self.scope().map_or(true, |s| s == scope)
    }
}

/// Parent entity kind a score record is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    Trace,
    Observation,
    Session,
    DatasetRun,
}

impl ScopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeKind::Trace => "trace",
            ScopeKind::Observation => "observation",
            ScopeKind::Session => "session",
            ScopeKind::DatasetRun => "dataset_run",
        }
    }
}

/// Which of the two compared streams a sub-query targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Score1,
    Score2,
}

/// A stored score as read by the analytics engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreRecord {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub source: String,
    pub data_type: ScoreDataType,
    pub value: Option<f64>,
    pub string_value: Option<String>,
    pub trace_id: Option<String>,
    pub observation_id: Option<String>,
    pub session_id: Option<String>,
    pub dataset_run_id: Option<String>,
    /// Event time, epoch milliseconds.
    pub timestamp: i64,
    /// Ingestion time, epoch milliseconds. Later writes win on dedupe.
    pub created_at: i64,
}

impl ScoreRecord {
    pub fn selects(&self, selector: &ScoreSelector) -> bool {
        self.name == selector.name
            && self.source == selector.source
            && self.data_type == selector.data_type
    }
}
