//! Heuristic quality and confidence scoring of an implementation.

use serde::{Deserialize, Serialize};

use super::stage::ValidationReport;

const ERROR_HANDLING_MARKERS: &[&str] = &[
    "Result<", "Err(", "?;", "error", "Error", "try", "catch", "except", "throw", "raise", "panic",
];
const CONDITIONAL_MARKERS: &[&str] = &["if ", "else", "match ", "switch", "case ", "when ", "?:"];
const COMMENT_MARKERS: &[&str] = &["//", "/*", "# ", "\"\"\"", "--"];

/// Minimum length expected at complexity 7 and above before penalizing.
const SHORT_FOR_COMPLEX: usize = 400;

/// Scores in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct QualityAssessment {
    pub quality_score: f64,
    pub confidence_score: f64,
}

fn contains_any(code: &str, markers: &[&str]) -> bool {
    markers.iter().any(|m| code.contains(m))
}

/// Characters of code expected for a function of `complexity`.
fn expected_length(complexity: u8) -> usize {
    200 + usize::from(complexity) * 150
}

/// Scores an implementation from its size, structure and the review.
///
/// Longer and more structured code scores higher for complex functions;
/// very short output for a complex function is penalized.
pub fn assess(implementation: &str, complexity: u8, validation: Option<&ValidationReport>) -> QualityAssessment {
    let code = implementation.trim();
    if code.is_empty() {
        return QualityAssessment::default();
    }

    let length = code.chars().count();
    let length_score = (length as f64 / expected_length(complexity) as f64).min(1.0);

    let markers = [
        contains_any(code, ERROR_HANDLING_MARKERS),
        contains_any(code, CONDITIONAL_MARKERS),
        contains_any(code, COMMENT_MARKERS),
    ];
    let structure_score = markers.iter().filter(|m| **m).count() as f64 / markers.len() as f64;

    // Simple functions need less structure to be complete.
    let structure_weight = if complexity <= 3 { 0.3 } else { 0.5 };
    let mut quality = (1.0 - structure_weight) * length_score + structure_weight * structure_score;

    if complexity >= 7 && length < SHORT_FOR_COMPLEX {
        quality *= 0.5;
    }

    let review_factor = match validation {
        Some(report) if report.passed => 1.0,
        Some(report) => (0.7 - 0.05 * report.issues.len() as f64).max(0.4),
        None => 0.6,
    };
    quality = (quality * (0.8 + 0.2 * review_factor)).clamp(0.0, 1.0);

    let confidence = (0.5 * quality + 0.3 * review_factor + 0.2 * structure_score).clamp(0.0, 1.0);

    QualityAssessment {
        quality_score: quality,
        confidence_score: confidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RICH: &str = r#"
/// Divides two numbers.
pub fn divide(a: f64, b: f64) -> Result<f64, CalcError> {
    // Reject division by zero up front.
    if b == 0.0 {
        return Err(CalcError::DivisionByZero);
    }
    let result = a / b;
    if !result.is_finite() {
        return Err(CalcError::Overflow);
    }
    Ok(result)
}
"#;

    fn passed() -> ValidationReport {
        ValidationReport {
            passed: true,
            ..ValidationReport::default()
        }
    }

    #[test]
    fn test_empty_scores_zero() {
        let score = assess("   ", 5, None);
        assert_eq!(score.quality_score, 0.0);
        assert_eq!(score.confidence_score, 0.0);
    }

    #[test]
    fn test_structure_raises_score() {
        let bare = "pub fn divide(a: f64, b: f64) -> f64 { a / b }";
        let rich = assess(RICH, 4, Some(&passed()));
        let plain = assess(bare, 4, Some(&passed()));
        assert!(rich.quality_score > plain.quality_score);
        assert!(rich.confidence_score > plain.confidence_score);
    }

    #[test]
    fn test_short_output_penalized_for_high_complexity() {
        let low = assess(RICH, 3, Some(&passed()));
        let high = assess(RICH, 9, Some(&passed()));
        assert!(RICH.trim().chars().count() < SHORT_FOR_COMPLEX);
        assert!(high.quality_score < low.quality_score * 0.75);
    }

    #[test]
    fn test_failed_review_lowers_confidence() {
        let failed = ValidationReport {
            passed: false,
            issues: vec!["a".into(), "b".into()],
            suggested_tests: vec![],
        };
        let good = assess(RICH, 4, Some(&passed()));
        let bad = assess(RICH, 4, Some(&failed));
        assert!(bad.confidence_score < good.confidence_score);
        assert!(bad.quality_score <= good.quality_score);
        assert!((0.0..=1.0).contains(&bad.quality_score));
    }
}
