use crate::error::{AppError, AppResult};
use crate::types::ScoreRecord;
use deadpool_sqlite::Pool;
use rusqlite::params;

/// Write score records in a single transaction. A record whose id already
/// exists replaces the stored row.
pub async fn write_scores(pool: &Pool, scores: Vec<ScoreRecord>) -> AppResult<usize> {
    if scores.is_empty() {
        return Ok(0);
    }

    let conn = pool
        .get()
        .await
        .map_err(|e| AppError::Internal(format!("pool checkout: {e}")))?;
    let written = conn
        .interact(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut insert = tx.prepare_cached(
                    "INSERT OR REPLACE INTO scores (
                        id, project_id, name, source, data_type, value, string_value,
                        trace_id, observation_id, session_id, dataset_run_id,
                        \"timestamp\", created_at
                    ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
                )?;
                for s in &scores {
                    insert.execute(params![
                        s.id,
                        s.project_id,
                        s.name,
                        s.source,
                        s.data_type.as_str(),
                        s.value,
                        s.string_value,
                        s.trace_id,
                        s.observation_id,
                        s.session_id,
                        s.dataset_run_id,
                        s.timestamp,
                        s.created_at,
                    ])?;
                }
            }
            tx.commit()?;
            tracing::debug!(count = scores.len(), "wrote score batch to sqlite");
            Ok::<_, rusqlite::Error>(scores.len())
        })
        .await??;

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::storage::sqlite::{create_pool, init_pool};
    use crate::types::ScoreDataType;

    fn record(id: &str, value: f64, created_at: i64) -> ScoreRecord {
        ScoreRecord {
            id: id.to_string(),
            project_id: "p1".to_string(),
            name: "accuracy".to_string(),
            source: "API".to_string(),
            data_type: ScoreDataType::Numeric,
            value: Some(value),
            string_value: None,
            trace_id: Some("t1".to_string()),
            observation_id: None,
            session_id: None,
            dataset_run_id: None,
            timestamp: 1_000,
            created_at,
        }
    }

    #[tokio::test]
    async fn test_rewrite_with_same_id_replaces_row() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(&DatabaseConfig {
            path: dir.path().join("scores.db"),
            pool_size: 1,
        })
        .unwrap();
        init_pool(&pool).await.unwrap();

        let written = write_scores(&pool, vec![record("s1", 0.2, 1), record("s2", 0.4, 1)])
            .await
            .unwrap();
        assert_eq!(written, 2);
        write_scores(&pool, vec![record("s1", 0.9, 2)]).await.unwrap();
        assert_eq!(write_scores(&pool, Vec::new()).await.unwrap(), 0);

        let conn = pool.get().await.unwrap();
        let rows: Vec<(String, f64, i64)> = conn
            .interact(|conn| {
                let mut stmt = conn
                    .prepare("SELECT id, value, created_at FROM scores ORDER BY id")
                    .unwrap();
                stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
                    .unwrap()
                    .collect::<Result<Vec<_>, _>>()
                    .unwrap()
            })
            .await
            .unwrap();
        assert_eq!(
            rows,
            vec![("s1".to_string(), 0.9, 2), ("s2".to_string(), 0.4, 1)]
        );
    }
}
