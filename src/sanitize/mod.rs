//! Numeric hygiene helpers.
//!
//! Bad catalog data or extreme ability estimates must never poison a
//! selection; everything that feeds a ranking goes through these guards.

use crate::types::EPSILON;

/// Check whether a slice contains NaN or infinite values.
pub fn has_invalid_values(arr: &[f64]) -> bool {
    arr.iter().any(|&x| x.is_nan() || x.is_infinite())
}

/// Replace a non-finite value with a fallback.
pub fn finite_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

/// Clamp to [0, 1], mapping non-finite input to the lower bound.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Positive, finite divisor for rate computations.
pub fn safe_divisor(value: f64) -> f64 {
    if value.is_finite() {
        value.max(EPSILON)
    } else {
        EPSILON
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_invalid_values() {
        assert!(!has_invalid_values(&[1.0, 2.0, 3.0]));
        assert!(has_invalid_values(&[1.0, f64::NAN, 3.0]));
        assert!(has_invalid_values(&[1.0, f64::INFINITY, 3.0]));
    }

    #[test]
    fn test_clamp_unit() {
        assert_eq!(clamp_unit(0.5), 0.5);
        assert_eq!(clamp_unit(-0.1), 0.0);
        assert_eq!(clamp_unit(1.7), 1.0);
        assert_eq!(clamp_unit(f64::NAN), 0.0);
    }

    #[test]
    fn test_safe_divisor() {
        assert_eq!(safe_divisor(2.0), 2.0);
        assert_eq!(safe_divisor(0.0), EPSILON);
        assert_eq!(safe_divisor(f64::NAN), EPSILON);
    }
}
