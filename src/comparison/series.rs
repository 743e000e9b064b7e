use crate::comparison::binning::category_label;
use crate::comparison::buckets::{to_second_precision, TimeBucketPlan};
use crate::comparison::types::{CategoricalPoint, TimeSeriesPoint};
use crate::store::{BucketAverage, CategoryBucketCount, MatchedPair};
use crate::types::{ScoreDataType, Side};
use std::collections::{BTreeMap, HashMap};

/// One point per boundary. Buckets without data for a side get a null
/// average and a zero count.
pub fn gap_filled_series(
    boundaries: &[i64],
    score1: &[BucketAverage],
    score2: &[BucketAverage],
) -> Vec<TimeSeriesPoint> {
    let s1: HashMap<i64, &BucketAverage> = score1.iter().map(|b| (b.bucket_start, b)).collect();
    let s2: HashMap<i64, &BucketAverage> = score2.iter().map(|b| (b.bucket_start, b)).collect();
    boundaries
        .iter()
        .map(|start| {
            let a = s1.get(start);
            let b = s2.get(start);
            TimeSeriesPoint {
                timestamp: to_second_precision(*start),
                avg1: a.and_then(|x| x.avg),
                avg2: b.and_then(|x| x.avg),
                count1: a.map_or(0, |x| x.count),
                count2: b.map_or(0, |x| x.count),
            }
        })
        .collect()
}

#[derive(Default)]
struct PairAcc {
    sum1: f64,
    sum2: f64,
    valued1: u64,
    valued2: u64,
    count: u64,
}

/// Averages of matched pairs bucketed by the score1 timestamp. Only
/// buckets holding pairs are returned.
pub fn matched_series(plan: &TimeBucketPlan, pairs: &[MatchedPair]) -> Vec<TimeSeriesPoint> {
    let mut buckets: BTreeMap<i64, PairAcc> = BTreeMap::new();
    for pair in pairs {
        let acc = buckets.entry(plan.bucket_start(pair.timestamp1)).or_default();
        acc.count += 1;
        if let Some(v) = pair.value1 {
            acc.sum1 += v;
            acc.valued1 += 1;
        }
        if let Some(v) = pair.value2 {
            acc.sum2 += v;
            acc.valued2 += 1;
        }
    }
    buckets
        .into_iter()
        .map(|(start, acc)| TimeSeriesPoint {
            timestamp: to_second_precision(start),
            avg1: (acc.valued1 > 0).then(|| acc.sum1 / acc.valued1 as f64),
            avg2: (acc.valued2 > 0).then(|| acc.sum2 / acc.valued2 as f64),
            count1: acc.count,
            count2: acc.count,
        })
        .collect()
}

fn into_points(groups: BTreeMap<(i64, String), u64>) -> Vec<CategoricalPoint> {
    groups
        .into_iter()
        .map(|((start, category), count)| CategoricalPoint {
            timestamp: to_second_precision(start),
            category,
            count,
        })
        .collect()
}

/// Per-bucket category counts of one stream, merged by display label.
pub fn categorical_series(
    rows: &[CategoryBucketCount],
    data_type: ScoreDataType,
) -> Vec<CategoricalPoint> {
    let mut groups: BTreeMap<(i64, String), u64> = BTreeMap::new();
    for row in rows {
        let label = category_label(data_type, row.value, row.string_value.as_deref());
        *groups.entry((row.bucket_start, label)).or_default() += row.count;
    }
    into_points(groups)
}

/// Category counts of one side of the matched pairs, bucketed by the
/// score1 timestamp.
pub fn matched_categorical_series(
    plan: &TimeBucketPlan,
    pairs: &[MatchedPair],
    side: Side,
    data_type: ScoreDataType,
) -> Vec<CategoricalPoint> {
    let mut groups: BTreeMap<(i64, String), u64> = BTreeMap::new();
    for pair in pairs {
        let label = match side {
            Side::Score1 => category_label(data_type, pair.value1, pair.string_value1.as_deref()),
            Side::Score2 => category_label(data_type, pair.value2, pair.string_value2.as_deref()),
        };
        *groups
            .entry((plan.bucket_start(pair.timestamp1), label))
            .or_default() += 1;
    }
    into_points(groups)
}
