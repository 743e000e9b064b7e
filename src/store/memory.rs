use crate::comparison::binning::BinSpec;
use crate::comparison::buckets::TimeBucketPlan;
use crate::comparison::matching::MatchKey;
use crate::comparison::sampling::{key_hash, ReadMode};
use crate::comparison::types::ScoreCounts;
use crate::store::{
    BucketAverage, CategoryBucketCount, CategoryCount, ComparisonQuery, HistogramBin,
    MatchedPair, ScoreStore, StoreError, StoreResult, ValueBounds,
};
use crate::types::{ScopeKind, ScoreDataType, ScoreRecord, Side};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

struct IndexedRecord {
    record: ScoreRecord,
    key: String,
    scope: ScopeKind,
    hash: u64,
}

/// In-process store over a vector of records. Answers every sub-query with
/// the same semantics as the SQL store: dedupe to the latest write per key
/// in FINAL mode, hash sampling on the rendered match key.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<Vec<IndexedRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = ScoreRecord>) -> Self {
        let store = Self::new();
        store.insert_all(records);
        store
    }

    /// Add records. Records without any parent id are ignored.
    pub fn insert_all(&self, records: impl IntoIterator<Item = ScoreRecord>) {
        let indexed: Vec<IndexedRecord> = records
            .into_iter()
            .filter_map(|record| {
                let key = MatchKey::for_record(&record)?;
                let rendered = key.render();
                Some(IndexedRecord {
                    hash: key_hash(&rendered),
                    scope: key.scope(),
                    key: rendered,
                    record,
                })
            })
            .collect();
        if let Ok(mut guard) = self.records.write() {
            guard.extend(indexed);
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` over the qualifying rows of one stream.
    fn with_stream<T>(
        &self,
        q: &ComparisonQuery,
        side: Side,
        f: impl FnOnce(Vec<&IndexedRecord>) -> T,
    ) -> StoreResult<T> {
        q.cancel.check()?;
        let guard = self
            .records
            .read()
            .map_err(|_| StoreError::Connection("record lock poisoned".to_string()))?;
        Ok(f(stream(&guard, q, side)))
    }
}

fn stream<'a>(records: &'a [IndexedRecord], q: &ComparisonQuery, side: Side) -> Vec<&'a IndexedRecord> {
    let selector = q.selector(side);
    let rows = records.iter().filter(|r| {
        let rec = &r.record;
        rec.project_id == q.project_id
            && rec.timestamp >= q.from_ms
            && rec.timestamp <= q.to_ms
            && rec.selects(selector)
            && (selector.data_type != ScoreDataType::Numeric || rec.value.is_some())
            && q.object_type.includes(r.scope)
            && q.sampling.keeps_hash(r.hash)
    });

    match q.read_mode {
        ReadMode::Fast => rows.collect(),
        ReadMode::Final => {
            let mut latest: HashMap<&str, &IndexedRecord> = HashMap::new();
            for row in rows {
                latest
                    .entry(row.key.as_str())
                    .and_modify(|cur| {
                        let newer = (row.record.created_at, row.record.id.as_str())
                            > (cur.record.created_at, cur.record.id.as_str());
                        if newer {
                            *cur = row;
                        }
                    })
                    .or_insert(row);
            }
            latest.into_values().collect()
        }
    }
}

fn join<'a>(
    left: &[&'a IndexedRecord],
    right: &[&'a IndexedRecord],
) -> Vec<(&'a IndexedRecord, &'a IndexedRecord)> {
    let mut by_key: HashMap<&str, Vec<&IndexedRecord>> = HashMap::new();
    for r in right {
        by_key.entry(r.key.as_str()).or_default().push(r);
    }
    let mut out = Vec::new();
    for l in left {
        if let Some(matches) = by_key.get(l.key.as_str()) {
            out.extend(matches.iter().map(|r| (*l, *r)));
        }
    }
    out
}

impl ScoreStore for MemoryStore {
    fn counts(&self, q: &ComparisonQuery) -> StoreResult<ScoreCounts> {
        let guard = self
            .records
            .read()
            .map_err(|_| StoreError::Connection("record lock poisoned".to_string()))?;
        let s1 = stream(&guard, q, Side::Score1);
        let s2 = stream(&guard, q, Side::Score2);
        Ok(ScoreCounts {
            score1_total: s1.len() as u64,
            score2_total: s2.len() as u64,
            matched_count: join(&s1, &s2).len() as u64,
        })
    }

    fn matched_pairs(&self, q: &ComparisonQuery, limit: u64) -> StoreResult<Vec<MatchedPair>> {
        let guard = self
            .records
            .read()
            .map_err(|_| StoreError::Connection("record lock poisoned".to_string()))?;
        let s1 = stream(&guard, q, Side::Score1);
        let s2 = stream(&guard, q, Side::Score2);
        let mut pairs = join(&s1, &s2);
        pairs.sort_by(|a, b| {
            (a.0.record.timestamp, a.0.key.as_str()).cmp(&(b.0.record.timestamp, b.0.key.as_str()))
        });
        Ok(pairs
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .map(|(l, r)| MatchedPair {
                match_key: l.key.clone(),
                value1: l.record.value,
                string_value1: l.record.string_value.clone(),
                timestamp1: l.record.timestamp,
                value2: r.record.value,
                string_value2: r.record.string_value.clone(),
                timestamp2: r.record.timestamp,
            })
            .collect())
    }

    fn value_bounds(&self, q: &ComparisonQuery, side: Side) -> StoreResult<Option<ValueBounds>> {
        self.with_stream(q, side, |rows| {
            let mut bounds: Option<ValueBounds> = None;
            for v in rows.iter().filter_map(|r| r.record.value) {
                bounds = Some(match bounds {
                    Some(b) => ValueBounds {
                        min: b.min.min(v),
                        max: b.max.max(v),
                        count: b.count + 1,
                    },
                    None => ValueBounds {
                        min: v,
                        max: v,
                        count: 1,
                    },
                });
            }
            bounds
        })
    }

    fn histogram(
        &self,
        q: &ComparisonQuery,
        side: Side,
        spec: &BinSpec,
    ) -> StoreResult<Vec<HistogramBin>> {
        self.with_stream(q, side, |rows| {
            let mut bins: BTreeMap<u32, u64> = BTreeMap::new();
            for v in rows.iter().filter_map(|r| r.record.value) {
                *bins.entry(spec.index(v)).or_default() += 1;
            }
            bins.into_iter()
                .map(|(bin, count)| HistogramBin { bin, count })
                .collect()
        })
    }

    fn category_counts(&self, q: &ComparisonQuery, side: Side) -> StoreResult<Vec<CategoryCount>> {
        self.with_stream(q, side, |rows| {
            let mut groups: BTreeMap<(Option<String>, Option<u64>), u64> = BTreeMap::new();
            for r in rows {
                let key = (r.record.string_value.clone(), r.record.value.map(f64::to_bits));
                *groups.entry(key).or_default() += 1;
            }
            groups
                .into_iter()
                .map(|((string_value, bits), count)| CategoryCount {
                    string_value,
                    value: bits.map(f64::from_bits),
                    count,
                })
                .collect()
        })
    }

    fn time_series(
        &self,
        q: &ComparisonQuery,
        side: Side,
        plan: &TimeBucketPlan,
    ) -> StoreResult<Vec<BucketAverage>> {
        self.with_stream(q, side, |rows| {
            let mut buckets: BTreeMap<i64, (f64, u64, u64)> = BTreeMap::new();
            for r in rows {
                let acc = buckets
                    .entry(plan.bucket_start(r.record.timestamp))
                    .or_default();
                if let Some(v) = r.record.value {
                    acc.0 += v;
                    acc.1 += 1;
                }
                acc.2 += 1;
            }
            buckets
                .into_iter()
                .map(|(bucket_start, (sum, valued, count))| BucketAverage {
                    bucket_start,
                    avg: (valued > 0).then(|| sum / valued as f64),
                    count,
                })
                .collect()
        })
    }

    fn categorical_time_series(
        &self,
        q: &ComparisonQuery,
        side: Side,
        plan: &TimeBucketPlan,
    ) -> StoreResult<Vec<CategoryBucketCount>> {
        self.with_stream(q, side, |rows| {
            let mut groups: BTreeMap<(i64, Option<String>, Option<u64>), u64> = BTreeMap::new();
            for r in rows {
                let key = (
                    plan.bucket_start(r.record.timestamp),
                    r.record.string_value.clone(),
                    r.record.value.map(f64::to_bits),
                );
                *groups.entry(key).or_default() += 1;
            }
            groups
                .into_iter()
                .map(|((bucket_start, string_value, bits), count)| CategoryBucketCount {
                    bucket_start,
                    string_value,
                    value: bits.map(f64::from_bits),
                    count,
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparison::sampling::SamplingPredicate;
    use crate::store::Cancellation;
    use crate::types::{ObjectType, ScoreSelector};

    fn score(id: &str, name: &str, trace: &str, value: f64, created_at: i64) -> ScoreRecord {
        ScoreRecord {
            id: id.to_string(),
            project_id: "p1".to_string(),
            name: name.to_string(),
            source: "API".to_string(),
            data_type: ScoreDataType::Numeric,
            value: Some(value),
            string_value: None,
            trace_id: Some(trace.to_string()),
            observation_id: None,
            session_id: None,
            dataset_run_id: None,
            timestamp: 1_000,
            created_at,
        }
    }

    fn query(read_mode: ReadMode) -> ComparisonQuery {
        ComparisonQuery {
            project_id: "p1".to_string(),
            score1: ScoreSelector::new("a", ScoreDataType::Numeric, "API"),
            score2: ScoreSelector::new("b", ScoreDataType::Numeric, "API"),
            object_type: ObjectType::All,
            from_ms: 0,
            to_ms: 10_000,
            sampling: SamplingPredicate::all(),
            read_mode,
            cancel: Cancellation::new(),
        }
    }

    #[test]
    fn test_final_keeps_latest_write_per_key() {
        let store = MemoryStore::with_records(vec![
            score("1", "a", "t1", 0.1, 10),
            score("2", "a", "t1", 0.9, 20),
            score("3", "b", "t1", 0.5, 10),
        ]);
        let pairs = store.matched_pairs(&query(ReadMode::Final), 100).unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].value1, Some(0.9));

        let counts = store.counts(&query(ReadMode::Fast)).unwrap();
        assert_eq!(counts.score1_total, 2);
        assert_eq!(counts.matched_count, 2);
    }

    #[test]
    fn test_limit_truncates_pairs() {
        let store = MemoryStore::with_records((0..10).flat_map(|i| {
            let trace = format!("t{i}");
            vec![
                score(&format!("a{i}"), "a", &trace, 0.1, 0),
                score(&format!("b{i}"), "b", &trace, 0.2, 0),
            ]
        }));
        let pairs = store.matched_pairs(&query(ReadMode::Final), 3).unwrap();
        assert_eq!(pairs.len(), 3);
    }

    #[test]
    fn test_orphans_are_not_indexed() {
        let mut orphan = score("1", "a", "t1", 0.1, 0);
        orphan.trace_id = None;
        let store = MemoryStore::with_records(vec![orphan]);
        assert!(store.is_empty());
    }
}
