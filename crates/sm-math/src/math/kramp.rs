//! Log rising factorial with step (Kramp's generalized factorial).

use crate::math::stable::log_gamma;

/// `log prod_{k=0..n-1} (a + k*s)`.
///
/// The empty product (`n <= 0`) is 0. For `s == 0` the product collapses to
/// `a^n`. Otherwise the product is rewritten through the Gamma function as
/// `s^n * Gamma(a/s + n) / Gamma(a/s)`.
pub fn log_kramp(a: f64, s: f64, n: i64) -> f64 {
    if n <= 0 {
        return 0.0;
    }
    let n_f = n as f64;
    if s == 0.0 {
        return n_f * a.ln();
    }
    n_f * s.ln() + log_gamma(a / s + n_f) - log_gamma(a / s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol
    }

    fn log_kramp_naive(a: f64, s: f64, n: i64) -> f64 {
        (0..n).map(|k| (a + k as f64 * s).ln()).sum()
    }

    #[test]
    fn empty_product_is_zero() {
        assert_eq!(log_kramp(2.0, 0.5, 0), 0.0);
        assert_eq!(log_kramp(2.0, 0.5, -3), 0.0);
    }

    #[test]
    fn unit_step_is_rising_factorial() {
        // 2 * 3 * 4 * 5 = 120
        assert!(approx_eq(log_kramp(2.0, 1.0, 4), 120.0f64.ln(), 1e-10));
    }

    #[test]
    fn zero_step_is_power() {
        assert!(approx_eq(log_kramp(3.0, 0.0, 4), 4.0 * 3.0f64.ln(), 1e-12));
    }

    #[test]
    fn matches_naive_product() {
        for &(a, s, n) in &[(0.5, 0.7, 5), (1.25, 0.1, 12), (0.9, 0.9, 1)] {
            assert!(approx_eq(log_kramp(a, s, n), log_kramp_naive(a, s, n), 1e-9));
        }
    }

    #[test]
    fn pitman_yor_table_prior_shape() {
        // logKramp(alpha + d, d, t - 1) for a single table is the empty product.
        assert_eq!(log_kramp(0.5 + 0.3, 0.3, 0), 0.0);
    }
}
