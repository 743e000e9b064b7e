use crate::types::{ScopeKind, ScoreRecord};

/// Parent entity two scores must share to form a matched pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MatchKey {
    Trace(String),
    Observation { trace_id: String, observation_id: String },
    Session(String),
    DatasetRun(String),
}

impl MatchKey {
    /// Derive the key from a record. Observation beats trace, then session,
    /// then dataset run. Records without any parent id have no key.
    pub fn for_record(record: &ScoreRecord) -> Option<MatchKey> {
        match (
            record.trace_id.as_deref(),
            record.observation_id.as_deref(),
            record.session_id.as_deref(),
            record.dataset_run_id.as_deref(),
        ) {
            (Some(trace), Some(obs), _, _) => Some(MatchKey::Observation {
                trace_id: trace.to_string(),
                observation_id: obs.to_string(),
            }),
            (Some(trace), None, _, _) => Some(MatchKey::Trace(trace.to_string())),
            (None, _, Some(session), _) => Some(MatchKey::Session(session.to_string())),
            (None, _, None, Some(run)) => Some(MatchKey::DatasetRun(run.to_string())),
            _ => None,
        }
    }

    pub fn scope(&self) -> ScopeKind {
        match self {
            MatchKey::Trace(_) => ScopeKind::Trace,
            MatchKey::Observation { .. } => ScopeKind::Observation,
            MatchKey::Session(_) => ScopeKind::Session,
            MatchKey::DatasetRun(_) => ScopeKind::DatasetRun,
        }
    }

    /// Scope-prefixed string form, identical to the key the SQL stores
    /// compute, so sampling hashes agree across stores.
    pub fn render(&self) -> String {
        match self {
            MatchKey::Trace(t) => format!("t:{t}"),
            MatchKey::Observation {
                trace_id,
                observation_id,
            } => format!("o:{trace_id}:{observation_id}"),
            MatchKey::Session(s) => format!("s:{s}"),
            MatchKey::DatasetRun(d) => format!("d:{d}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ScoreDataType;

    fn record(trace: Option<&str>, obs: Option<&str>, session: Option<&str>) -> ScoreRecord {
        ScoreRecord {
            id: "id".to_string(),
            project_id: "p".to_string(),
            name: "accuracy".to_string(),
            source: "API".to_string(),
            data_type: ScoreDataType::Numeric,
            value: Some(1.0),
            string_value: None,
            trace_id: trace.map(String::from),
            observation_id: obs.map(String::from),
            session_id: session.map(String::from),
            dataset_run_id: None,
            timestamp: 0,
            created_at: 0,
        }
    }

    #[test]
    fn test_trace_and_observation_keys_differ() {
        let trace_level = MatchKey::for_record(&record(Some("t1"), None, None)).unwrap();
        let obs_level = MatchKey::for_record(&record(Some("t1"), Some("o1"), None)).unwrap();
        assert_ne!(trace_level, obs_level);
        assert_eq!(trace_level.render(), "t:t1");
        assert_eq!(obs_level.render(), "o:t1:o1");
        assert_eq!(obs_level.scope(), ScopeKind::Observation);
    }

    #[test]
    fn test_trace_wins_over_session() {
        let key = MatchKey::for_record(&record(Some("t1"), None, Some("s1"))).unwrap();
        assert_eq!(key, MatchKey::Trace("t1".to_string()));
        let key = MatchKey::for_record(&record(None, None, Some("s1"))).unwrap();
        assert_eq!(key.render(), "s:s1");
    }

    #[test]
    fn test_orphan_record_has_no_key() {
        assert!(MatchKey::for_record(&record(None, None, None)).is_none());
        // observation id without a trace is not an observation scope
        assert!(MatchKey::for_record(&record(None, Some("o1"), None)).is_none());
    }
}
