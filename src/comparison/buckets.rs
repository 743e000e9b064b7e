//! Time-bucket planning: bucket size selection and calendar-aligned
//! bucket boundaries.

use crate::comparison::types::{BucketInfo, IntervalUnit, TimeInterval};
use crate::error::{AppError, AppResult};
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, TimeZone, Utc};
use serde::Deserialize;

pub const TARGET_BUCKETS: i64 = 60;
pub const MIN_BUCKETS: i64 = 40;
pub const MAX_BUCKETS: i64 = 100;

/// Upper bound on emitted buckets for one series.
pub const MAX_SERIES_BUCKETS: usize = 5_000;

const HOUR_MS: i64 = 3_600_000;
const DAY_MS: i64 = 86_400_000;
const WEEK_MS: i64 = 7 * DAY_MS;

/// Candidate fixed bucket sizes in seconds. Consecutive sizes differ by at
/// most 2.5x, so some size always lands in [MIN_BUCKETS, MAX_BUCKETS].
const BUCKET_SIZES_SECS: &[i64] = &[
    1, 2, 5, 10, 15, 30, 60, 120, 300, 600, 900, 1_800, 3_600, 7_200, 10_800, 21_600, 43_200,
    86_400, 172_800, 345_600, 604_800, 1_209_600, 2_592_000, 5_184_000, 7_776_000, 15_552_000,
    31_536_000,
];

/// Pick a fixed bucket size for the range, aiming for about 60 buckets.
pub fn bucket_size_for_range(from_ms: i64, to_ms: i64) -> i64 {
    let duration_secs = ((to_ms - from_ms) / 1000).max(0);
    if duration_secs < MIN_BUCKETS {
        return 1;
    }

    let mut best: Option<(i64, i64)> = None;
    for &size in BUCKET_SIZES_SECS {
        let buckets = ceil_div(duration_secs, size);
        if !(MIN_BUCKETS..=MAX_BUCKETS).contains(&buckets) {
            continue;
        }
        let distance = (buckets - TARGET_BUCKETS).abs();
        if best.map_or(true, |(d, _)| distance < d) {
            best = Some((distance, size));
        }
    }

    best.map(|(_, size)| size)
        .unwrap_or_else(|| ceil_div(duration_secs, TARGET_BUCKETS).max(1))
}

/// A filter condition as sent by dashboard clients.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FilterCondition {
    Datetime {
        column: String,
        operator: String,
        value: DateTime<Utc>,
    },
    String {
        column: String,
        operator: String,
        value: String,
    },
    Number {
        column: String,
        operator: String,
        value: f64,
    },
}

/// Extract the `timestamp >= from` / `timestamp <= to` pair from a filter list.
pub fn range_from_filters(filters: &[FilterCondition]) -> AppResult<(DateTime<Utc>, DateTime<Utc>)> {
    let mut from = None;
    let mut to = None;
    for filter in filters {
        if let FilterCondition::Datetime {
            column,
            operator,
            value,
        } = filter
        {
            if column != "timestamp" {
                continue;
            }
            match operator.as_str() {
                ">=" => from = Some(*value),
                "<=" => to = Some(*value),
                ">" | "<" => {
                    return Err(AppError::InvalidFilter(format!(
                        "timestamp filter operator {operator} is not supported, use >= and <="
                    )))
                }
                _ => {}
            }
        }
    }

    match (from, to) {
        (Some(from), Some(to)) if from <= to => Ok((from, to)),
        (Some(_), Some(_)) => Err(AppError::InvalidFilter(
            "timestamp lower bound is after the upper bound".to_string(),
        )),
        _ => Err(AppError::InvalidFilter(
            "filter must contain a timestamp >= and <= pair".to_string(),
        )),
    }
}

/// Bucket size for a filter list. Fails when the timestamp pair is missing.
pub fn bucket_size_for_filters(filters: &[FilterCondition]) -> AppResult<i64> {
    let (from, to) = range_from_filters(filters)?;
    Ok(bucket_size_for_range(
        from.timestamp_millis(),
        to.timestamp_millis(),
    ))
}

/// How timestamps are grouped into buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBucketPlan {
    Fixed { seconds: i64 },
    Calendar(TimeInterval),
}

impl TimeBucketPlan {
    /// Calendar buckets for an explicit interval. Without one the planner
    /// picks a size, and day-or-larger sizes still get calendar buckets.
    pub fn for_range(interval: Option<TimeInterval>, from_ms: i64, to_ms: i64) -> AppResult<Self> {
        match interval {
            Some(interval) => {
                if interval.count == 0 {
                    return Err(AppError::Validation(
                        "interval.count must be a positive integer".to_string(),
                    ));
                }
                Ok(TimeBucketPlan::Calendar(interval.normalized()))
            }
            None => Ok(Self::for_bucket_size(bucket_size_for_range(from_ms, to_ms))),
        }
    }

    /// Plan for a planner-chosen size. Sizes under a day are epoch-floored;
    /// longer sizes map to days, weeks or roughly-equal months so bucket
    /// starts stay on midnight, Monday or the first of the month.
    pub fn for_bucket_size(seconds: i64) -> Self {
        let day = DAY_MS / 1000;
        let week = WEEK_MS / 1000;
        let month = 30 * day;
        let calendar = |count: i64, unit| {
            TimeBucketPlan::Calendar(TimeInterval::new(
                u32::try_from(count.max(1)).unwrap_or(u32::MAX),
                unit,
            ))
        };
        if seconds >= month {
            calendar((seconds + month / 2) / month, IntervalUnit::Month)
        } else if seconds >= week && seconds % week == 0 {
            calendar(seconds / week, IntervalUnit::Week)
        } else if seconds >= day {
            calendar(seconds / day, IntervalUnit::Day)
        } else {
            TimeBucketPlan::Fixed { seconds }
        }
    }

    /// Start of the bucket containing `ts_ms`.
    pub fn bucket_start(&self, ts_ms: i64) -> i64 {
        match *self {
            TimeBucketPlan::Fixed { seconds } => {
                let width = seconds.max(1) * 1000;
                ts_ms.div_euclid(width) * width
            }
            TimeBucketPlan::Calendar(interval) => calendar_start(ts_ms, interval),
        }
    }

    /// Start of the bucket following the one that starts at `start_ms`.
    pub fn next_bucket(&self, start_ms: i64) -> i64 {
        match *self {
            TimeBucketPlan::Fixed { seconds } => start_ms + seconds.max(1) * 1000,
            TimeBucketPlan::Calendar(interval) => {
                let count = i64::from(interval.count.max(1));
                match interval.unit {
                    IntervalUnit::Hour => start_ms + count * HOUR_MS,
                    IntervalUnit::Day => start_ms + count * DAY_MS,
                    IntervalUnit::Week => start_ms + count * WEEK_MS,
                    IntervalUnit::Month => add_months(start_ms, interval.count.max(1)),
                }
            }
        }
    }

    /// Every bucket start touching `[from_ms, to_ms]`, for gap filling.
    pub fn boundaries(&self, from_ms: i64, to_ms: i64) -> AppResult<Vec<i64>> {
        let mut out = Vec::new();
        let mut start = self.bucket_start(from_ms);
        while start <= to_ms {
            if out.len() >= MAX_SERIES_BUCKETS {
                return Err(AppError::Validation(format!(
                    "interval is too fine for the time range (more than {MAX_SERIES_BUCKETS} buckets)"
                )));
            }
            out.push(start);
            start = self.next_bucket(start);
        }
        Ok(out)
    }

    pub fn info(&self) -> BucketInfo {
        match *self {
            TimeBucketPlan::Fixed { seconds } => BucketInfo {
                unit: "second".to_string(),
                count: u32::try_from(seconds).unwrap_or(u32::MAX),
                seconds: Some(seconds),
            },
            TimeBucketPlan::Calendar(interval) => BucketInfo {
                unit: interval.unit.as_str().to_string(),
                count: interval.count,
                seconds: match interval.unit {
                    IntervalUnit::Month => None,
                    IntervalUnit::Hour => Some(i64::from(interval.count) * 3_600),
                    IntervalUnit::Day => Some(i64::from(interval.count) * 86_400),
                    IntervalUnit::Week => Some(i64::from(interval.count) * 604_800),
                },
            },
        }
    }
}

fn epoch_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

/// 1970-01-05, the first ISO Monday after the epoch.
fn anchor_monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 5).unwrap_or_default()
}

fn utc(ts_ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts_ms).unwrap_or_default()
}

fn midnight_ms(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or_default()
}

fn calendar_start(ts_ms: i64, interval: TimeInterval) -> i64 {
    let count = i64::from(interval.count.max(1));
    let dt = utc(ts_ms);
    match interval.unit {
        IntervalUnit::Hour => {
            let width = count * HOUR_MS;
            ts_ms.div_euclid(width) * width
        }
        IntervalUnit::Day => {
            let days = (dt.date_naive() - epoch_date()).num_days();
            let aligned = days.div_euclid(count) * count;
            midnight_ms(epoch_date() + Duration::days(aligned))
        }
        IntervalUnit::Week => {
            let date = dt.date_naive();
            let monday = date - Duration::days(i64::from(date.weekday().num_days_from_monday()));
            let weeks = (monday - anchor_monday()).num_days() / 7;
            let aligned = weeks.div_euclid(count) * count;
            midnight_ms(anchor_monday() + Duration::weeks(aligned))
        }
        IntervalUnit::Month => {
            let month_index = i64::from(dt.year()) * 12 + i64::from(dt.month0());
            let aligned = month_index.div_euclid(count) * count;
            let year = i32::try_from(aligned.div_euclid(12)).unwrap_or(1970);
            let month = u32::try_from(aligned.rem_euclid(12)).unwrap_or(0) + 1;
            Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
                .single()
                .map(|d| d.timestamp_millis())
                .unwrap_or_default()
        }
    }
}

fn add_months(start_ms: i64, months: u32) -> i64 {
    utc(start_ms)
        .checked_add_months(Months::new(months))
        .map(|d| d.timestamp_millis())
        .unwrap_or(i64::MAX)
}

/// Truncate epoch milliseconds to a whole-second UTC timestamp.
pub fn to_second_precision(ts_ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts_ms.div_euclid(1000), 0).unwrap_or_default()
}

fn ceil_div(a: i64, b: i64) -> i64 {
    (a + b - 1) / b
}
