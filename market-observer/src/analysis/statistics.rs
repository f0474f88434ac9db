//! Statistical primitives for the aggregation engine.

/// Mean and population standard deviation (N denominator).
/// A single element yields sigma = 0.
pub fn mean_std(data: &[f64]) -> (f64, f64) {
    if data.is_empty() {
        return (0.0, 0.0);
    }

    let mean = data.iter().sum::<f64>() / data.len() as f64;

    if data.len() == 1 {
        return (mean, 0.0);
    }

    let variance_sum: f64 = data.iter().map(|v| (v - mean) * (v - mean)).sum();
    let std = (variance_sum / data.len() as f64).sqrt();
    (mean, std)
}

/// Pearson correlation coefficient between two series.
///
/// Returns 0 when fewer than two points, when either input has zero
/// variance, when the denominator is zero, or when the result is NaN.
pub fn correlation(x: &[f64], y: &[f64]) -> f64 {
    if x.len() != y.len() || x.len() < 2 {
        return 0.0;
    }

    let n = x.len() as f64;

    let (_, std_x) = mean_std(x);
    let (_, std_y) = mean_std(y);
    if std_x == 0.0 || std_y == 0.0 {
        return 0.0;
    }

    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_x2, mut sum_y2) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for i in 0..x.len() {
        sum_x += x[i];
        sum_y += y[i];
        sum_xy += x[i] * y[i];
        sum_x2 += x[i] * x[i];
        sum_y2 += y[i] * y[i];
    }

    let numerator = n * sum_xy - sum_x * sum_y;
    let denominator = ((n * sum_x2 - sum_x * sum_x) * (n * sum_y2 - sum_y * sum_y)).sqrt();

    if denominator == 0.0 {
        return 0.0;
    }

    let result = numerator / denominator;
    if result.is_nan() {
        return 0.0;
    }
    result
}

/// Standard score of `value` against a mean/sigma pair; 0 when sigma is 0.
pub fn z_score(value: f64, mean: f64, std: f64) -> f64 {
    if std == 0.0 {
        return 0.0;
    }
    (value - mean) / std
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_std_basic() {
        let (mean, std) = mean_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((mean - 5.0).abs() < 1e-9);
        assert!((std - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_mean_std_single_element() {
        let (mean, std) = mean_std(&[42.0]);
        assert_eq!(mean, 42.0);
        assert_eq!(std, 0.0);
    }

    #[test]
    fn test_mean_std_empty() {
        assert_eq!(mean_std(&[]), (0.0, 0.0));
    }

    #[test]
    fn test_correlation_perfect_positive() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [2.0, 4.0, 6.0, 8.0];
        assert!((correlation(&x, &y) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_correlation_perfect_negative() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [8.0, 6.0, 4.0, 2.0];
        assert!((correlation(&x, &y) + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_correlation_zero_variance() {
        // Flat prices against rising volumes
        let x = [5.0, 5.0, 5.0, 5.0];
        let y = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(correlation(&x, &y), 0.0);
        assert_eq!(correlation(&y, &x), 0.0);
    }

    #[test]
    fn test_correlation_too_few_points() {
        assert_eq!(correlation(&[1.0], &[2.0]), 0.0);
        assert_eq!(correlation(&[], &[]), 0.0);
    }

    #[test]
    fn test_correlation_length_mismatch() {
        assert_eq!(correlation(&[1.0, 2.0], &[1.0, 2.0, 3.0]), 0.0);
    }

    #[test]
    fn test_correlation_in_range() {
        let x = [1.0, 3.0, 2.0, 5.0, 4.0, 7.0];
        let y = [2.0, 1.0, 4.0, 3.0, 6.0, 5.0];
        let r = correlation(&x, &y);
        assert!((-1.0..=1.0).contains(&r));
    }

    #[test]
    fn test_z_score() {
        assert_eq!(z_score(7.0, 5.0, 2.0), 1.0);
        assert_eq!(z_score(7.0, 5.0, 0.0), 0.0);
    }
}
