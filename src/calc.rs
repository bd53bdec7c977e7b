use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Half-up 2-decimal rounding: `Int(100*x + 0.5) / 100`.
///
/// Every user-visible average in the system goes through this one rule so that
/// re-running a report card reproduces the exact same numbers.
pub fn round2(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

/// Re-express a raw score on the 0-20 scale. Scores already out of 20 pass
/// through untouched.
pub fn normalize_to_20(score: f64, out_of: f64) -> f64 {
    if (out_of - 20.0).abs() < 1e-9 || out_of <= 0.0 {
        score
    } else {
        score * 20.0 / out_of
    }
}

/// Coefficient validity policy. The institutional standard requires strictly
/// positive integer subject coefficients; a separate rational policy exists
/// for annex programmes that weight with fractions. Exactly one policy is
/// active per workspace and both the resolver and the average validate
/// through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CoefficientPolicy {
    #[default]
    StrictInteger,
    Rational,
}

impl CoefficientPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            CoefficientPolicy::StrictInteger => "strict_integer",
            CoefficientPolicy::Rational => "rational",
        }
    }

    pub fn parse(raw: &str) -> Option<CoefficientPolicy> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "strict_integer" => Some(CoefficientPolicy::StrictInteger),
            "rational" => Some(CoefficientPolicy::Rational),
            _ => None,
        }
    }

    /// Validate a coefficient. Rejection is a configuration error surfaced to
    /// the caller, never a silent coercion.
    pub fn validate(self, coefficient: f64) -> Result<(), CalcError> {
        let reject = match self {
            CoefficientPolicy::StrictInteger => {
                coefficient <= 0.0 || !coefficient.is_finite() || coefficient.fract() != 0.0
            }
            CoefficientPolicy::Rational => coefficient <= 0.0 || !coefficient.is_finite(),
        };
        if reject {
            let message = match self {
                CoefficientPolicy::StrictInteger => {
                    "coefficient must be a strictly positive integer"
                }
                CoefficientPolicy::Rational => "coefficient must be strictly positive",
            };
            return Err(CalcError::new("invalid_coefficient", message).with_details(
                serde_json::json!({
                    "coefficient": coefficient,
                    "policy": self.as_str(),
                }),
            ));
        }
        Ok(())
    }
}

/// Coefficient-weighted mean, rounded with `round2`.
///
/// A zero weight sum means "no data yet" and yields 0.0 by policy rather than
/// a divide-by-zero fault.
pub fn weighted_average(
    values: &[f64],
    weights: &[f64],
    policy: CoefficientPolicy,
) -> Result<f64, CalcError> {
    if values.len() != weights.len() {
        return Err(
            CalcError::new("bad_params", "values and weights differ in length").with_details(
                serde_json::json!({ "values": values.len(), "weights": weights.len() }),
            ),
        );
    }
    let mut sum = 0.0_f64;
    let mut denom = 0.0_f64;
    for (value, weight) in values.iter().zip(weights.iter()) {
        policy.validate(*weight)?;
        sum += value * weight;
        denom += weight;
    }
    if denom <= 0.0 {
        return Ok(0.0);
    }
    Ok(round2(sum / denom))
}

/// Qualitative mention thresholds: lower bound (inclusive) -> label, checked
/// from the highest bound down. The table is workspace configuration; this
/// struct only carries the institutional default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MentionBand {
    pub min_average: f64,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MentionScale {
    pub bands: Vec<MentionBand>,
    pub fallback: String,
}

impl Default for MentionScale {
    fn default() -> Self {
        let band = |min_average: f64, label: &str| MentionBand {
            min_average,
            label: label.to_string(),
        };
        MentionScale {
            bands: vec![
                band(18.0, "Excellent"),
                band(16.0, "Very Good"),
                band(14.0, "Good"),
                band(12.0, "Fairly Good"),
                band(10.0, "Passing"),
            ],
            fallback: "Insufficient".to_string(),
        }
    }
}

impl MentionScale {
    pub fn mention_for(&self, general_average: f64) -> &str {
        let mut bands: Vec<&MentionBand> = self.bands.iter().collect();
        bands.sort_by(|a, b| {
            b.min_average
                .partial_cmp(&a.min_average)
                .unwrap_or(Ordering::Equal)
        });
        for band in bands {
            if general_average >= band.min_average {
                return &band.label;
            }
        }
        &self.fallback
    }

    pub fn is_valid(&self) -> bool {
        !self.bands.is_empty()
            && self.bands.iter().all(|b| b.min_average.is_finite())
            && !self.fallback.trim().is_empty()
    }
}

/// Year-end promotion thresholds, both lower bounds inclusive. Only consulted
/// for the year-end term.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionThresholds {
    pub promote: f64,
    pub conditional: f64,
}

impl Default for DecisionThresholds {
    fn default() -> Self {
        DecisionThresholds {
            promote: 10.0,
            conditional: 8.0,
        }
    }
}

impl DecisionThresholds {
    pub fn decision_for(&self, general_average: f64) -> &'static str {
        if general_average >= self.promote {
            "promoted"
        } else if general_average >= self.conditional {
            "conditional"
        } else {
            "repeat"
        }
    }

    pub fn is_valid(&self) -> bool {
        self.promote.is_finite()
            && self.conditional.is_finite()
            && self.promote >= self.conditional
    }
}

/// Standard competition ranking over averages already sorted descending.
///
/// Rank 1 goes to the first entry; an entry equal to its predecessor shares
/// the predecessor's rank; the next distinct value resumes at its 1-based
/// position in the sequence. `[15, 15, 12, 10]` ranks as `[1, 1, 3, 4]`.
pub fn assign_competition_ranks(averages_desc: &[f64]) -> Vec<i64> {
    let mut ranks: Vec<i64> = Vec::with_capacity(averages_desc.len());
    for (i, avg) in averages_desc.iter().enumerate() {
        if i > 0 && (avg - averages_desc[i - 1]).abs() < 1e-9 {
            let shared = ranks[i - 1];
            ranks.push(shared);
        } else {
            ranks.push(i as i64 + 1);
        }
    }
    ranks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round2_is_half_up() {
        assert_eq!(round2(13.333333), 13.33);
        assert_eq!(round2(13.335), 13.34);
        assert_eq!(round2(15.994999), 15.99);
        assert_eq!(round2(15.995), 16.0);
        assert_eq!(round2(0.0), 0.0);
    }

    #[test]
    fn weighted_average_matches_hand_computation() {
        // (15*2 + 10*1) / 3 = 13.333... -> 13.33
        let avg = weighted_average(&[15.0, 10.0], &[2.0, 1.0], CoefficientPolicy::StrictInteger)
            .expect("average");
        assert_eq!(avg, 13.33);
    }

    #[test]
    fn empty_input_yields_zero_not_an_error() {
        let avg =
            weighted_average(&[], &[], CoefficientPolicy::StrictInteger).expect("empty average");
        assert_eq!(avg, 0.0);
    }

    #[test]
    fn strict_policy_rejects_fractional_and_non_positive_weights() {
        for bad in [0.0, -1.0, 2.5] {
            let err = weighted_average(&[10.0], &[bad], CoefficientPolicy::StrictInteger)
                .expect_err("must reject");
            assert_eq!(err.code, "invalid_coefficient", "weight {bad}");
        }
    }

    #[test]
    fn rational_policy_accepts_fractions_but_not_zero() {
        let avg = weighted_average(&[10.0, 16.0], &[0.5, 1.5], CoefficientPolicy::Rational)
            .expect("rational average");
        assert_eq!(avg, 14.5);
        let err = weighted_average(&[10.0], &[0.0], CoefficientPolicy::Rational)
            .expect_err("zero weight");
        assert_eq!(err.code, "invalid_coefficient");
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let err = weighted_average(&[10.0], &[1.0, 2.0], CoefficientPolicy::StrictInteger)
            .expect_err("mismatch");
        assert_eq!(err.code, "bad_params");
    }

    #[test]
    fn normalize_rescales_only_when_out_of_differs_from_20() {
        assert_eq!(normalize_to_20(15.0, 20.0), 15.0);
        assert_eq!(normalize_to_20(45.0, 60.0), 15.0);
        assert_eq!(normalize_to_20(8.0, 10.0), 16.0);
    }

    #[test]
    fn competition_ranks_share_on_ties_and_resume_at_position() {
        assert_eq!(
            assign_competition_ranks(&[15.0, 15.0, 12.0, 10.0]),
            vec![1, 1, 3, 4]
        );
        assert_eq!(
            assign_competition_ranks(&[18.5, 14.0, 14.0, 9.5]),
            vec![1, 2, 2, 4]
        );
        assert_eq!(assign_competition_ranks(&[12.0]), vec![1]);
        assert_eq!(assign_competition_ranks(&[]), Vec::<i64>::new());
    }

    #[test]
    fn deduplicated_ranks_are_exactly_the_group_start_positions() {
        let averages = [17.0, 17.0, 17.0, 15.5, 15.5, 12.0, 12.0, 12.0, 9.0];
        let ranks = assign_competition_ranks(&averages);
        let mut distinct: Vec<i64> = ranks.clone();
        distinct.dedup();
        assert_eq!(distinct, vec![1, 4, 6, 9]);
        assert!(ranks.iter().all(|r| *r >= 1 && *r <= averages.len() as i64));
    }

    #[test]
    fn mention_bounds_are_inclusive_on_the_lower_edge() {
        let scale = MentionScale::default();
        assert_eq!(scale.mention_for(18.0), "Excellent");
        assert_eq!(scale.mention_for(16.0), "Very Good");
        assert_eq!(scale.mention_for(15.99), "Good");
        assert_eq!(scale.mention_for(14.0), "Good");
        assert_eq!(scale.mention_for(12.0), "Fairly Good");
        assert_eq!(scale.mention_for(10.0), "Passing");
        assert_eq!(scale.mention_for(9.99), "Insufficient");
    }

    #[test]
    fn decision_uses_both_thresholds() {
        let t = DecisionThresholds::default();
        assert_eq!(t.decision_for(10.0), "promoted");
        assert_eq!(t.decision_for(9.99), "conditional");
        assert_eq!(t.decision_for(8.0), "conditional");
        assert_eq!(t.decision_for(7.99), "repeat");
    }
}
