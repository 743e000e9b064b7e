use crate::comparison::types::{ConfusionCell, DistributionBin, HeatmapCell};
use crate::error::{AppError, AppResult};
use crate::types::ScoreDataType;
use std::collections::BTreeMap;

pub const MIN_BINS: u32 = 5;
pub const MAX_BINS: u32 = 50;
pub const DEFAULT_BINS: u32 = 10;

pub fn validate_n_bins(n_bins: Option<u32>, default: u32) -> AppResult<u32> {
    let n = n_bins.unwrap_or(default);
    if !(MIN_BINS..=MAX_BINS).contains(&n) {
        return Err(AppError::Validation(format!(
            "nBins must be between {MIN_BINS} and {MAX_BINS}, got {n}"
        )));
    }
    Ok(n)
}

/// Equal-width bins over `[min, max]`. The last bin is closed on the right.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinSpec {
    pub min: f64,
    pub max: f64,
    pub n_bins: u32,
}

impl BinSpec {
    pub fn new(min: f64, max: f64, n_bins: u32) -> Self {
        Self {
            min,
            max,
            n_bins: n_bins.max(1),
        }
    }

    pub fn from_values(values: impl IntoIterator<Item = f64>, n_bins: u32) -> Option<Self> {
        let mut bounds: Option<(f64, f64)> = None;
        for v in values.into_iter().filter(|v| v.is_finite()) {
            bounds = Some(match bounds {
                Some((lo, hi)) => (lo.min(v), hi.max(v)),
                None => (v, v),
            });
        }
        bounds.map(|(lo, hi)| Self::new(lo, hi, n_bins))
    }

    /// Smallest spec covering both ranges.
    pub fn union(&self, other: &BinSpec) -> Self {
        Self::new(
            self.min.min(other.min),
            self.max.max(other.max),
            self.n_bins,
        )
    }

    /// Bin width. A degenerate range uses width 1 so every value lands in
    /// bin 0.
    pub fn width(&self) -> f64 {
        if self.max > self.min {
            (self.max - self.min) / f64::from(self.n_bins)
        } else {
            1.0
        }
    }

    pub fn index(&self, value: f64) -> u32 {
        let raw = ((value - self.min) / self.width()).floor();
        if raw.is_nan() || raw < 0.0 {
            0
        } else {
            (raw as u64).min(u64::from(self.n_bins - 1)) as u32
        }
    }

    pub fn lower(&self, index: u32) -> f64 {
        self.min + self.width() * f64::from(index)
    }

    pub fn upper(&self, index: u32) -> f64 {
        if index + 1 >= self.n_bins {
            self.max.max(self.lower(index))
        } else {
            self.min + self.width() * f64::from(index + 1)
        }
    }

    pub fn is_degenerate(&self) -> bool {
        self.max <= self.min
    }
}

#[derive(Default)]
struct CellAcc {
    count: u64,
    min1: f64,
    max1: f64,
    min2: f64,
    max2: f64,
}

/// Two-dimensional histogram of matched numeric pairs. Each axis is binned
/// over its own observed range; only non-empty cells are returned, ordered
/// by `(binX, binY)`.
pub fn heatmap(pairs: &[(f64, f64)], n_bins: u32) -> Vec<HeatmapCell> {
    let Some(spec_x) = BinSpec::from_values(pairs.iter().map(|p| p.0), n_bins) else {
        return Vec::new();
    };
    let Some(spec_y) = BinSpec::from_values(pairs.iter().map(|p| p.1), n_bins) else {
        return Vec::new();
    };
    let global_min = spec_x.min.min(spec_y.min);
    let global_max = spec_x.max.max(spec_y.max);

    let mut cells: BTreeMap<(u32, u32), CellAcc> = BTreeMap::new();
    for &(v1, v2) in pairs {
        let key = (spec_x.index(v1), spec_y.index(v2));
        let acc = cells.entry(key).or_insert_with(|| CellAcc {
            count: 0,
            min1: v1,
            max1: v1,
            min2: v2,
            max2: v2,
        });
        acc.count += 1;
        acc.min1 = acc.min1.min(v1);
        acc.max1 = acc.max1.max(v1);
        acc.min2 = acc.min2.min(v2);
        acc.max2 = acc.max2.max(v2);
    }

    cells
        .into_iter()
        .map(|((bin_x, bin_y), acc)| HeatmapCell {
            bin_x,
            bin_y,
            count: acc.count,
            min1: acc.min1,
            max1: acc.max1,
            min2: acc.min2,
            max2: acc.max2,
            global_min,
            global_max,
        })
        .collect()
}

/// Category-by-category counts of matched pairs, rows from score1.
pub fn confusion_matrix(pairs: &[(String, String)]) -> Vec<ConfusionCell> {
    let mut cells: BTreeMap<(&str, &str), u64> = BTreeMap::new();
    for (row, col) in pairs {
        *cells.entry((row.as_str(), col.as_str())).or_default() += 1;
    }
    cells
        .into_iter()
        .map(|((row, col), count)| ConfusionCell {
            row_category: row.to_string(),
            col_category: col.to_string(),
            count,
        })
        .collect()
}

/// Dense numeric histogram from `(bin index, count)` rows produced by a
/// store. Missing bins are zero.
pub fn numeric_distribution(
    rows: impl IntoIterator<Item = (u32, u64)>,
    spec: &BinSpec,
) -> Vec<DistributionBin> {
    let mut counts = vec![0u64; spec.n_bins as usize];
    for (index, count) in rows {
        let i = (index.min(spec.n_bins - 1)) as usize;
        counts[i] += count;
    }
    counts
        .into_iter()
        .enumerate()
        .map(|(i, count)| {
            let i = i as u32;
            DistributionBin {
                bin_index: i,
                lower: Some(spec.lower(i)),
                upper: Some(spec.upper(i)),
                category: None,
                count,
            }
        })
        .collect()
}

/// Dense numeric histogram over in-memory values.
pub fn histogram_values(
    values: impl IntoIterator<Item = f64>,
    spec: &BinSpec,
) -> Vec<DistributionBin> {
    numeric_distribution(values.into_iter().map(|v| (spec.index(v), 1)), spec)
}

/// One bin per category, sorted by category label.
pub fn categorical_distribution(
    counts: impl IntoIterator<Item = (String, u64)>,
) -> Vec<DistributionBin> {
    let mut merged: BTreeMap<String, u64> = BTreeMap::new();
    for (category, count) in counts {
        *merged.entry(category).or_default() += count;
    }
    merged
        .into_iter()
        .enumerate()
        .map(|(i, (category, count))| DistributionBin {
            bin_index: i as u32,
            lower: None,
            upper: None,
            category: Some(category),
            count,
        })
        .collect()
}

/// Label a score value for categorical aggregations. Numeric values use
/// their shortest float form (`1`, `0.5`).
pub fn category_label(
    data_type: ScoreDataType,
    value: Option<f64>,
    string_value: Option<&str>,
) -> String {
    match (data_type, string_value, value) {
        (ScoreDataType::Numeric, _, Some(v)) => format_value(v),
        (_, Some(s), _) => s.to_string(),
        (ScoreDataType::Boolean, None, Some(v)) => {
            if v != 0.0 { "True" } else { "False" }.to_string()
        }
        (_, None, Some(v)) => format_value(v),
        (_, None, None) => String::new(),
    }
}

fn format_value(v: f64) -> String {
    format!("{v}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_n_bins_range() {
        assert_eq!(validate_n_bins(None, DEFAULT_BINS).unwrap(), 10);
        assert_eq!(validate_n_bins(Some(5), DEFAULT_BINS).unwrap(), 5);
        assert_eq!(validate_n_bins(Some(50), DEFAULT_BINS).unwrap(), 50);
        assert!(matches!(
            validate_n_bins(Some(3), DEFAULT_BINS),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            validate_n_bins(Some(100), DEFAULT_BINS),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_bin_index_clamps_max_into_last_bin() {
        let spec = BinSpec::new(0.0, 1.0, 10);
        assert_eq!(spec.index(0.0), 0);
        assert_eq!(spec.index(0.05), 0);
        assert_eq!(spec.index(0.1), 1);
        assert_eq!(spec.index(1.0), 9);
        assert_eq!(spec.index(-3.0), 0);
        assert_eq!(spec.index(7.0), 9);
        assert_eq!(spec.upper(9), 1.0);
    }

    #[test]
    fn test_degenerate_range_uses_first_bin() {
        let spec = BinSpec::new(0.4, 0.4, 10);
        assert!(spec.is_degenerate());
        assert_eq!(spec.width(), 1.0);
        assert_eq!(spec.index(0.4), 0);
    }

    #[test]
    fn test_diagonal_heatmap() {
        let pairs = [(0.1, 0.1), (0.5, 0.5), (0.9, 0.9), (0.2, 0.2)];
        let cells = heatmap(&pairs, 10);
        assert_eq!(cells.iter().map(|c| c.count).sum::<u64>(), 4);
        assert!(cells.iter().all(|c| c.bin_x == c.bin_y));
        let first = &cells[0];
        assert_eq!((first.bin_x, first.bin_y), (0, 0));
        assert_eq!(first.min1, 0.1);
        assert_eq!(first.global_min, 0.1);
        assert_eq!(first.global_max, 0.9);
        let last = cells.last().unwrap();
        assert_eq!((last.bin_x, last.bin_y), (9, 9));
    }

    #[test]
    fn test_heatmap_of_nothing_is_empty() {
        assert!(heatmap(&[], 10).is_empty());
    }

    #[test]
    fn test_confusion_matrix_sums_to_pairs() {
        let pairs = vec![
            ("True".to_string(), "True".to_string()),
            ("True".to_string(), "False".to_string()),
            ("False".to_string(), "False".to_string()),
            ("True".to_string(), "True".to_string()),
        ];
        let cells = confusion_matrix(&pairs);
        assert_eq!(cells.iter().map(|c| c.count).sum::<u64>(), 4);
        let tt = cells
            .iter()
            .find(|c| c.row_category == "True" && c.col_category == "True")
            .unwrap();
        assert_eq!(tt.count, 2);
    }

    #[test]
    fn test_histogram_is_dense() {
        let spec = BinSpec::new(0.0, 10.0, 5);
        let bins = histogram_values([0.0, 1.0, 9.0, 10.0], &spec);
        assert_eq!(bins.len(), 5);
        assert_eq!(bins.iter().map(|b| b.count).sum::<u64>(), 4);
        assert_eq!(bins[0].count, 2);
        assert_eq!(bins[2].count, 0);
        assert_eq!(bins[4].count, 2);
        assert_eq!(bins[1].lower, Some(2.0));
    }

    #[test]
    fn test_categorical_distribution_sorts_categories() {
        let bins = categorical_distribution(vec![
            ("good".to_string(), 3),
            ("bad".to_string(), 1),
            ("good".to_string(), 2),
        ]);
        assert_eq!(bins.len(), 2);
        assert_eq!(bins[0].category.as_deref(), Some("bad"));
        assert_eq!(bins[1].count, 5);
    }

    #[test]
    fn test_category_labels() {
        assert_eq!(category_label(ScoreDataType::Numeric, Some(1.0), None), "1");
        assert_eq!(category_label(ScoreDataType::Numeric, Some(0.5), None), "0.5");
        assert_eq!(
            category_label(ScoreDataType::Boolean, Some(1.0), None),
            "True"
        );
        assert_eq!(
            category_label(ScoreDataType::Categorical, None, Some("neutral")),
            "neutral"
        );
    }
}
