use crate::comparison::binning::BinSpec;
use crate::comparison::buckets::TimeBucketPlan;
use crate::comparison::types::ScoreCounts;
use crate::store::builder::{QueryRenderer, RenderedQuery, SqlParam};
use crate::store::{
    BucketAverage, Cancellation, CategoryBucketCount, CategoryCount, ComparisonQuery, HistogramBin,
    MatchedPair, ScoreStore, StoreError, StoreResult, ValueBounds,
};
use crate::types::Side;
use duckdb::types::Value;
use duckdb::{Connection, Row};
use std::path::Path;
use std::sync::Mutex;

const ATTACH_ALIAS: &str = "scorecmp";

/// DuckDB-backed store. In production the connection is an in-memory
/// database with the SQLite score table attached read-only through
/// `sqlite_scanner`; each sub-query runs on its own cloned connection.
pub struct DuckDbStore {
    conn: Mutex<Connection>,
    table: String,
}

impl DuckDbStore {
    /// Open an in-memory DuckDB and attach the SQLite database at `db_path`.
    pub fn attach_sqlite(db_path: &Path) -> StoreResult<Self> {
        let db_path_str = db_path
            .to_str()
            .ok_or_else(|| StoreError::Connection("invalid database path".to_string()))?;

        let conn = Connection::open_in_memory().map_err(|e| {
            StoreError::Connection(format!("failed to open DuckDB in-memory: {e}"))
        })?;

        // The home directory may not exist in containers, so INSTALL needs
        // an explicit writable extension directory.
        let ext_dir = std::env::var("DUCKDB_EXTENSION_DIR").unwrap_or_else(|_| {
            std::env::temp_dir()
                .join("duckdb_ext")
                .to_string_lossy()
                .into_owned()
        });
        conn.execute_batch(&format!(
            "SET extension_directory = '{}'",
            ext_dir.replace('\'', "''")
        ))
        .map_err(|e| StoreError::Connection(format!("failed to set extension_directory: {e}")))?;

        conn.execute_batch("INSTALL sqlite_scanner; LOAD sqlite_scanner;")
            .map_err(|e| StoreError::Connection(format!("failed to load sqlite_scanner: {e}")))?;

        conn.execute_batch(&format!(
            "ATTACH '{}' AS {ATTACH_ALIAS} (TYPE SQLITE, READ_ONLY)",
            db_path_str.replace('\'', "''")
        ))
        .map_err(|e| StoreError::Connection(format!("failed to attach SQLite database: {e}")))?;

        Self::from_connection(conn, &format!("{ATTACH_ALIAS}.scores"))
    }

    /// Use an existing connection whose `table` holds score rows.
    pub fn from_connection(conn: Connection, table: &str) -> StoreResult<Self> {
        let valid = !table.is_empty()
            && table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
        if !valid {
            return Err(StoreError::Connection(format!(
                "invalid table identifier: {table:?}"
            )));
        }
        Ok(Self {
            conn: Mutex::new(conn),
            table: table.to_string(),
        })
    }

    fn connection(&self) -> StoreResult<Connection> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| StoreError::Connection("connection mutex poisoned".to_string()))?;
        guard
            .try_clone()
            .map_err(|e| StoreError::Connection(format!("failed to clone connection: {e}")))
    }

    fn renderer<'a>(&'a self, q: &'a ComparisonQuery) -> QueryRenderer<'a> {
        QueryRenderer::new(&self.table, q)
    }

    /// Run one statement on a fresh connection clone. Cancelling `cancel`
    /// interrupts the statement mid-flight.
    fn query_rows<T, F>(
        &self,
        cancel: &Cancellation,
        rendered: RenderedQuery,
        map: F,
    ) -> StoreResult<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> duckdb::Result<T>,
    {
        cancel.check()?;
        let conn = self.connection()?;
        let interrupt = conn.interrupt_handle();
        cancel.on_cancel(move || interrupt.interrupt());

        let result = Self::collect_rows(&conn, rendered, map);
        match result {
            Err(_) if cancel.is_cancelled() => Err(StoreError::Cancelled),
            other => other,
        }
    }

    fn collect_rows<T, F>(conn: &Connection, rendered: RenderedQuery, map: F) -> StoreResult<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> duckdb::Result<T>,
    {
        let mut stmt = conn.prepare(&rendered.sql)?;
        let params: Vec<Value> = rendered.params.into_iter().map(to_value).collect();
        let rows = stmt.query_map(duckdb::params_from_iter(params), map)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }
}

fn to_value(param: SqlParam) -> Value {
    match param {
        SqlParam::Text(s) => Value::Text(s),
        SqlParam::Int(i) => Value::BigInt(i),
        SqlParam::Real(f) => Value::Double(f),
    }
}

fn count(raw: i64) -> u64 {
    u64::try_from(raw).unwrap_or(0)
}

impl ScoreStore for DuckDbStore {
    fn counts(&self, q: &ComparisonQuery) -> StoreResult<ScoreCounts> {
        let rows = self.query_rows(&q.cancel, self.renderer(q).counts(), |row| {
            Ok(ScoreCounts {
                score1_total: count(row.get(0)?),
                score2_total: count(row.get(1)?),
                matched_count: count(row.get(2)?),
            })
        })?;
        Ok(rows.into_iter().next().unwrap_or_default())
    }

    fn matched_pairs(&self, q: &ComparisonQuery, limit: u64) -> StoreResult<Vec<MatchedPair>> {
        self.query_rows(&q.cancel, self.renderer(q).matched_pairs(limit), |row| {
            Ok(MatchedPair {
                match_key: row.get(0)?,
                value1: row.get(1)?,
                string_value1: row.get(2)?,
                timestamp1: row.get(3)?,
                value2: row.get(4)?,
                string_value2: row.get(5)?,
                timestamp2: row.get(6)?,
            })
        })
    }

    fn value_bounds(&self, q: &ComparisonQuery, side: Side) -> StoreResult<Option<ValueBounds>> {
        let rows = self.query_rows(&q.cancel, self.renderer(q).value_bounds(side), |row| {
            let min: Option<f64> = row.get(0)?;
            let max: Option<f64> = row.get(1)?;
            let n: i64 = row.get(2)?;
            Ok(min.zip(max).map(|(min, max)| ValueBounds {
                min,
                max,
                count: count(n),
            }))
        })?;
        Ok(rows.into_iter().next().flatten().filter(|b| b.count > 0))
    }

    fn histogram(
        &self,
        q: &ComparisonQuery,
        side: Side,
        spec: &BinSpec,
    ) -> StoreResult<Vec<HistogramBin>> {
        self.query_rows(&q.cancel, self.renderer(q).histogram(side, spec), |row| {
            let bin: i64 = row.get(0)?;
            Ok(HistogramBin {
                bin: u32::try_from(bin).unwrap_or(0),
                count: count(row.get(1)?),
            })
        })
    }

    fn category_counts(&self, q: &ComparisonQuery, side: Side) -> StoreResult<Vec<CategoryCount>> {
        self.query_rows(&q.cancel, self.renderer(q).category_counts(side), |row| {
            Ok(CategoryCount {
                string_value: row.get(0)?,
                value: row.get(1)?,
                count: count(row.get(2)?),
            })
        })
    }

    fn time_series(
        &self,
        q: &ComparisonQuery,
        side: Side,
        plan: &TimeBucketPlan,
    ) -> StoreResult<Vec<BucketAverage>> {
        self.query_rows(&q.cancel, self.renderer(q).time_series(side, plan), |row| {
            Ok(BucketAverage {
                bucket_start: row.get(0)?,
                avg: row.get(1)?,
                count: count(row.get(2)?),
            })
        })
    }

    fn categorical_time_series(
        &self,
        q: &ComparisonQuery,
        side: Side,
        plan: &TimeBucketPlan,
    ) -> StoreResult<Vec<CategoryBucketCount>> {
        self.query_rows(&q.cancel, self.renderer(q).categorical_time_series(side, plan), |row| {
            Ok(CategoryBucketCount {
                bucket_start: row.get(0)?,
                string_value: row.get(1)?,
                value: row.get(2)?,
                count: count(row.get(3)?),
            })
        })
    }
}
