use rust_decimal::Decimal;
use serde::Deserialize;

/// How a reported amount relates to the trade it was matched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchVerdict {
    /// Reported amount equals the requested amount.
    Exact,
    /// Close enough to match, but the amounts differ; the trade is
    /// flagged for review.
    Flagged,
}

/// Strategy seam for pairing a staff-reported amount with one of
/// their unpaid trades.
pub trait MatchStrategy: Send + Sync {
    fn evaluate(&self, requested: Decimal, reported: Decimal) -> Option<MatchVerdict>;
}

/// Which matching strategy the reconciler runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    LeadingDigits,
    ExactAmount,
}

impl MatchMode {
    pub fn strategy(&self) -> Box<dyn MatchStrategy> {
        match self {
            MatchMode::LeadingDigits => Box::new(LeadingDigitMatch),
            MatchMode::ExactAmount => Box::new(ExactAmountMatch),
        }
    }
}

/// Matches on the first two digits of the amounts' digit strings,
/// scale and separators ignored. Tolerates the fat-fingered and
/// truncated amounts staff type into chat ("5000" for 5000.00, or
/// "5050" against a 5000.00 trade, which matches but gets flagged).
pub struct LeadingDigitMatch;

fn leading_digits(amount: Decimal) -> String {
    amount
        .normalize()
        .to_string()
        .chars()
        .filter(|c| c.is_ascii_digit())
        .take(2)
        .collect()
}

impl MatchStrategy for LeadingDigitMatch {
    fn evaluate(&self, requested: Decimal, reported: Decimal) -> Option<MatchVerdict> {
        if leading_digits(requested) != leading_digits(reported) {
            return None;
        }
        if requested == reported {
            Some(MatchVerdict::Exact)
        } else {
            Some(MatchVerdict::Flagged)
        }
    }
}

/// Strict alternative: only a numerically equal amount matches.
pub struct ExactAmountMatch;

impl MatchStrategy for ExactAmountMatch {
    fn evaluate(&self, requested: Decimal, reported: Decimal) -> Option<MatchVerdict> {
        if requested == reported {
            Some(MatchVerdict::Exact)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn test_leading_digits_exact_amount_matches_clean() {
        let verdict = LeadingDigitMatch.evaluate(dec!(5000.00), dec!(5000));
        assert_eq!(verdict, Some(MatchVerdict::Exact));
    }

    #[test]
    fn test_leading_digits_near_amount_matches_flagged() {
        let verdict = LeadingDigitMatch.evaluate(dec!(5000.00), dec!(5050));
        assert_eq!(verdict, Some(MatchVerdict::Flagged));
    }

    #[test]
    fn test_leading_digits_rejects_different_prefix() {
        assert_eq!(LeadingDigitMatch.evaluate(dec!(5000.00), dec!(6100)), None);
        assert_eq!(LeadingDigitMatch.evaluate(dec!(5000.00), dec!(4999)), None);
    }

    #[test]
    fn test_leading_digits_ignores_scale_and_sign_of_magnitude() {
        // 50.25 and 5025 share the "50" prefix; the heuristic accepts
        // them as a flagged pair rather than rejecting on magnitude.
        assert_eq!(
            LeadingDigitMatch.evaluate(dec!(50.25), dec!(5025)),
            Some(MatchVerdict::Flagged)
        );
    }

    #[test]
    fn test_single_digit_amounts() {
        assert_eq!(
            LeadingDigitMatch.evaluate(dec!(5.00), dec!(5)),
            Some(MatchVerdict::Exact)
        );
        assert_eq!(LeadingDigitMatch.evaluate(dec!(5.00), dec!(50)), None);
    }

    #[test]
    fn test_exact_amount_mode() {
        assert_eq!(
            ExactAmountMatch.evaluate(dec!(5000.00), dec!(5000)),
            Some(MatchVerdict::Exact)
        );
        assert_eq!(ExactAmountMatch.evaluate(dec!(5000.00), dec!(5050)), None);
    }

    #[test]
    fn test_mode_deserializes_snake_case() {
        let mode: MatchMode = serde_json::from_str("\"leading_digits\"").unwrap();
        assert_eq!(mode, MatchMode::LeadingDigits);
        let mode: MatchMode = serde_json::from_str("\"exact_amount\"").unwrap();
        assert_eq!(mode, MatchMode::ExactAmount);
    }
}
