//! Correlation and error statistics over matched score pairs.

use crate::comparison::types::{Agreement, ConfusionCell, Statistics};
use std::collections::HashMap;

/// Pearson correlation. `None` below two pairs or when either side has no
/// variance.
pub fn pearson(pairs: &[(f64, f64)]) -> Option<f64> {
    if pairs.len() < 2 {
        return None;
    }
    let n = pairs.len() as f64;
    let mean_x = pairs.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = pairs.iter().map(|p| p.1).sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for &(x, y) in pairs {
        let dx = x - mean_x;
        let dy = y - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x <= 0.0 || var_y <= 0.0 {
        return None;
    }
    let r = cov / (var_x * var_y).sqrt();
    if !r.is_finite() {
        return None;
    }
    Some(r.clamp(-1.0, 1.0))
}

/// 1-based ranks; tied values share the average of their positions.
pub fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = vec![0.0; values.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        let rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = rank;
        }
        i = j + 1;
    }
    ranks
}

/// Spearman rank correlation: Pearson over average ranks.
pub fn spearman(pairs: &[(f64, f64)]) -> Option<f64> {
    if pairs.len() < 2 {
        return None;
    }
    let xs: Vec<f64> = pairs.iter().map(|p| p.0).collect();
    let ys: Vec<f64> = pairs.iter().map(|p| p.1).collect();
    let ranked: Vec<(f64, f64)> = average_ranks(&xs)
        .into_iter()
        .zip(average_ranks(&ys))
        .collect();
    pearson(&ranked)
}

pub fn mae(pairs: &[(f64, f64)]) -> f64 {
    if pairs.is_empty() {
        return 0.0;
    }
    pairs.iter().map(|(x, y)| (x - y).abs()).sum::<f64>() / pairs.len() as f64
}

pub fn rmse(pairs: &[(f64, f64)]) -> f64 {
    if pairs.is_empty() {
        return 0.0;
    }
    let mse = pairs.iter().map(|(x, y)| (x - y).powi(2)).sum::<f64>() / pairs.len() as f64;
    mse.sqrt()
}

/// Statistics for matched numeric pairs, `None` when there are none.
/// Comparing a score against itself yields no correlations.
pub fn compute_statistics(pairs: &[(f64, f64)], self_comparison: bool) -> Option<Statistics> {
    if pairs.is_empty() {
        return None;
    }
    let (pearson_correlation, spearman_correlation) = if self_comparison {
        (None, None)
    } else {
        (pearson(pairs), spearman(pairs))
    };
    Some(Statistics {
        count: pairs.len() as u64,
        pearson_correlation,
        spearman_correlation,
        mae: mae(pairs),
        rmse: rmse(pairs),
    })
}

/// Observed agreement and Cohen's kappa over a confusion matrix.
pub fn agreement(cells: &[ConfusionCell]) -> Option<Agreement> {
    let total: u64 = cells.iter().map(|c| c.count).sum();
    if total == 0 {
        return None;
    }
    let mut rows: HashMap<&str, u64> = HashMap::new();
    let mut cols: HashMap<&str, u64> = HashMap::new();
    let mut agreed = 0u64;
    for cell in cells {
        *rows.entry(cell.row_category.as_str()).or_default() += cell.count;
        *cols.entry(cell.col_category.as_str()).or_default() += cell.count;
        if cell.row_category == cell.col_category {
            agreed += cell.count;
        }
    }

    let n = total as f64;
    let observed = agreed as f64 / n;
    let expected: f64 = rows
        .iter()
        .map(|(category, row_total)| {
            let col_total = cols.get(category).copied().unwrap_or(0);
            (*row_total as f64 / n) * (col_total as f64 / n)
        })
        .sum();
    let cohens_kappa = if (1.0 - expected).abs() < f64::EPSILON {
        None
    } else {
        Some((observed - expected) / (1.0 - expected))
    };

    Some(Agreement {
        count: total,
        agreement_rate: observed,
        cohens_kappa,
    })
}
