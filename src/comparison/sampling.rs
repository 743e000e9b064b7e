//! Adaptive sampling: preflight extrapolation, hash sampling plan and the
//! consistency read mode decision.

use crate::comparison::types::{
    AdaptiveFinal, PreflightEstimates, SamplingMetadata, SamplingMethod, ScoreCounts,
};
use xxhash_rust::xxh3::xxh3_64;

/// Estimated row count above which the dedupe (FINAL) read is skipped.
pub const ADAPTIVE_FINAL_THRESHOLD: u64 = 100_000;
/// Matched-row working set the hash sample is sized to.
pub const TARGET_SAMPLE_SIZE: u64 = 100_000;
/// Share of entities the preflight estimate reads.
pub const PREFLIGHT_SAMPLE_PERCENT: u64 = 1;
/// Hash space the sampling threshold is expressed in.
pub const SAMPLING_MODULUS: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingThresholds {
    pub adaptive_final_threshold: u64,
    pub target_sample_size: u64,
    pub preflight_sample_percent: u64,
}

impl Default for SamplingThresholds {
    fn default() -> Self {
        Self {
            adaptive_final_threshold: ADAPTIVE_FINAL_THRESHOLD,
            target_sample_size: TARGET_SAMPLE_SIZE,
            preflight_sample_percent: PREFLIGHT_SAMPLE_PERCENT,
        }
    }
}

/// Deterministic entity sample: keep a match key when
/// `hash(key) % SAMPLING_MODULUS < threshold`.
///
/// One value is shared by every sub-query of a request so both score
/// streams keep exactly the same entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingPredicate {
    threshold: u64,
}

impl SamplingPredicate {
    pub fn all() -> Self {
        Self {
            threshold: SAMPLING_MODULUS,
        }
    }

    pub fn from_rate(rate: f64) -> Self {
        if !rate.is_finite() || rate >= 1.0 {
            return Self::all();
        }
        let threshold = (rate.max(0.0) * SAMPLING_MODULUS as f64).ceil() as u64;
        Self {
            threshold: threshold.clamp(1, SAMPLING_MODULUS),
        }
    }

    pub fn from_percent(percent: u64) -> Self {
        Self::from_rate(percent.clamp(1, 100) as f64 / 100.0)
    }

    pub fn is_full(&self) -> bool {
        self.threshold >= SAMPLING_MODULUS
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn rate(&self) -> f64 {
        self.threshold as f64 / SAMPLING_MODULUS as f64
    }

    /// In-process evaluation against a precomputed key hash.
    pub fn keeps_hash(&self, key_hash: u64) -> bool {
        self.is_full() || key_hash % SAMPLING_MODULUS < self.threshold
    }

    pub fn keeps(&self, match_key: &str) -> bool {
        self.keeps_hash(key_hash(match_key))
    }

    /// SQL predicate over `key_expr`, or `None` when nothing is filtered.
    pub fn sql(&self, key_expr: &str) -> Option<String> {
        if self.is_full() {
            return None;
        }
        Some(format!(
            "CAST(hash({key_expr}) % {SAMPLING_MODULUS} AS BIGINT) < {}",
            self.threshold
        ))
    }

    /// Human-readable form reported in sampling metadata.
    pub fn expression(&self) -> Option<String> {
        self.sql("match_key")
    }
}

/// Hash used by in-process stores for entity sampling.
pub fn key_hash(match_key: &str) -> u64 {
    xxh3_64(match_key.as_bytes())
}

/// Scale sampled preflight counts up to full-population estimates.
pub fn extrapolate(sampled: ScoreCounts, percent: u64) -> PreflightEstimates {
    let factor = 100.0 / percent.clamp(1, 100) as f64;
    let scale = |count: u64| (count as f64 * factor).round() as u64;
    PreflightEstimates {
        score1_count: scale(sampled.score1_total),
        score2_count: scale(sampled.score2_total),
        estimated_matched_count: scale(sampled.matched_count),
    }
}

/// Read mode for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Deduplicate to the latest write per match key and stream.
    Final,
    /// Read rows as stored; duplicates may be counted more than once.
    Fast,
}

/// Outcome of the sampling controller for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingDecision {
    pub predicate: SamplingPredicate,
    pub read_mode: ReadMode,
    pub estimates: PreflightEstimates,
    pub adaptive_final: AdaptiveFinal,
}

impl SamplingDecision {
    pub fn is_sampled(&self) -> bool {
        !self.predicate.is_full()
    }

    pub fn metadata(&self, actual_sample_size: u64) -> SamplingMetadata {
        let sampled = self.is_sampled();
        SamplingMetadata {
            is_sampled: sampled,
            sampling_method: if sampled {
                SamplingMethod::Hash
            } else {
                SamplingMethod::None
            },
            sampling_rate: if sampled { self.predicate.rate() } else { 1.0 },
            sampling_expression: self.predicate.expression(),
            estimated_total_matches: self.estimates.estimated_matched_count,
            actual_sample_size,
            preflight_estimates: self.estimates,
            adaptive_final: self.adaptive_final.clone(),
        }
    }
}

/// Decide sampling and read mode from preflight estimates. `None` means
/// the preflight failed and the conservative path is taken.
pub fn decide(estimates: Option<PreflightEstimates>, thresholds: &SamplingThresholds) -> SamplingDecision {
    let Some(estimates) = estimates else {
        return SamplingDecision {
            predicate: SamplingPredicate::all(),
            read_mode: ReadMode::Final,
            estimates: PreflightEstimates::default(),
            adaptive_final: AdaptiveFinal {
                used_final: true,
                reason: "preflight estimate unavailable; using FINAL without sampling".to_string(),
            },
        };
    };

    let estimated_rows = estimates.score1_count.saturating_add(estimates.score2_count);
    let adaptive_final = if estimated_rows <= thresholds.adaptive_final_threshold {
        AdaptiveFinal {
            used_final: true,
            reason: format!(
                "small dataset: ~{estimated_rows} estimated rows <= {} threshold; using FINAL for consistent reads",
                thresholds.adaptive_final_threshold
            ),
        }
    } else {
        AdaptiveFinal {
            used_final: false,
            reason: format!(
                "large dataset: ~{estimated_rows} estimated rows > {} threshold; skipping FINAL for performance",
                thresholds.adaptive_final_threshold
            ),
        }
    };

    let predicate = if estimates.estimated_matched_count > thresholds.target_sample_size {
        SamplingPredicate::from_rate(
            thresholds.target_sample_size as f64 / estimates.estimated_matched_count as f64,
        )
    } else {
        SamplingPredicate::all()
    };

    SamplingDecision {
        predicate,
        read_mode: if adaptive_final.used_final {
            ReadMode::Final
        } else {
            ReadMode::Fast
        },
        estimates,
        adaptive_final,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimates(s1: u64, s2: u64, matched: u64) -> PreflightEstimates {
        PreflightEstimates {
            score1_count: s1,
            score2_count: s2,
            estimated_matched_count: matched,
        }
    }

    #[test]
    fn test_small_dataset_uses_final_without_sampling() {
        let d = decide(Some(estimates(500, 400, 300)), &SamplingThresholds::default());
        assert!(d.adaptive_final.used_final);
        assert!(d.adaptive_final.reason.starts_with("small dataset"));
        assert_eq!(d.read_mode, ReadMode::Final);
        assert!(!d.is_sampled());
        let meta = d.metadata(300);
        assert_eq!(meta.sampling_rate, 1.0);
        assert_eq!(meta.sampling_method, SamplingMethod::None);
        assert!(meta.sampling_expression.is_none());
    }

    #[test]
    fn test_large_dataset_skips_final_and_samples() {
        let d = decide(
            Some(estimates(400_000, 400_000, 400_000)),
            &SamplingThresholds::default(),
        );
        assert!(!d.adaptive_final.used_final);
        assert!(d.adaptive_final.reason.starts_with("large dataset"));
        assert_eq!(d.read_mode, ReadMode::Fast);
        assert!(d.is_sampled());
        assert!((d.predicate.rate() - 0.25).abs() < 1e-9);
        let meta = d.metadata(99_000);
        assert_eq!(meta.sampling_method, SamplingMethod::Hash);
        assert!(meta.sampling_rate < 1.0);
        assert_eq!(meta.estimated_total_matches, 400_000);
        assert_eq!(
            meta.sampling_expression.as_deref(),
            Some("CAST(hash(match_key) % 1000000 AS BIGINT) < 250000")
        );
    }

    #[test]
    fn test_large_rows_but_few_matches_is_not_sampled() {
        let d = decide(
            Some(estimates(300_000, 300_000, 10_000)),
            &SamplingThresholds::default(),
        );
        assert!(!d.adaptive_final.used_final);
        assert!(!d.is_sampled());
    }

    #[test]
    fn test_failed_preflight_falls_back_to_final() {
        let d = decide(None, &SamplingThresholds::default());
        assert!(d.adaptive_final.used_final);
        assert!(!d.is_sampled());
        assert_eq!(d.read_mode, ReadMode::Final);
    }

    #[test]
    fn test_extrapolate_scales_by_percent() {
        let sampled = ScoreCounts {
            score1_total: 12,
            score2_total: 10,
            matched_count: 7,
        };
        let e = extrapolate(sampled, 1);
        assert_eq!(e, estimates(1_200, 1_000, 700));
        let e = extrapolate(sampled, 10);
        assert_eq!(e, estimates(120, 100, 70));
    }

    #[test]
    fn test_extrapolate_non_divisor_percent_rounds() {
        let sampled = ScoreCounts {
            score1_total: 10,
            score2_total: 300,
            matched_count: 1,
        };
        // 10 / 0.3 = 33.3, not the 30 an integer factor of 3 would give
        let e = extrapolate(sampled, 30);
        assert_eq!(e, estimates(33, 1_000, 3));
        let e = extrapolate(sampled, 40);
        assert_eq!(e, estimates(25, 750, 3));
    }

    #[test]
    fn test_predicate_is_shared_and_deterministic() {
        let p = SamplingPredicate::from_rate(0.3);
        let keys: Vec<String> = (0..10_000).map(|i| format!("t:trace-{i}")).collect();
        let first: Vec<bool> = keys.iter().map(|k| p.keeps(k)).collect();
        let second: Vec<bool> = keys.iter().map(|k| p.keeps(k)).collect();
        assert_eq!(first, second);
        let kept = first.iter().filter(|k| **k).count();
        assert!((2_500..3_500).contains(&kept), "kept {kept}");
    }

    #[test]
    fn test_predicate_bounds() {
        assert!(SamplingPredicate::from_rate(1.5).is_full());
        assert!(SamplingPredicate::from_rate(f64::NAN).is_full());
        assert_eq!(SamplingPredicate::from_rate(0.0).threshold(), 1);
        assert_eq!(SamplingPredicate::from_percent(1).threshold(), 10_000);
        assert!(SamplingPredicate::all().sql("k").is_none());
    }
}
