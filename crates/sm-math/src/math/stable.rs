//! Numerically stable primitives for log-domain probability arithmetic.

const LOG_SQRT_2PI: f64 = 0.918_938_533_204_672_8; // 0.5 * ln(2*pi)
const LANCZOS_G: f64 = 7.0;
#[allow(clippy::excessive_precision)] // These are published numerical constants
const LANCZOS_COEFFS: [f64; 9] = [
    0.999_999_999_999_809_93,
    676.520_368_121_885_1,
    -1_259.139_216_722_402_8,
    771.323_428_777_653_1,
    -176.615_029_162_140_59,
    12.507_343_278_686_905,
    -0.138_571_095_265_720_12,
    9.984_369_578_019_571_6e-6,
    1.505_632_735_149_311_6e-7,
];

/// Stable log(sum(exp(values))).
///
/// Returns NEG_INFINITY for empty input or all -inf inputs.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NEG_INFINITY;
    }
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    let mut sum = 0.0;
    for v in values {
        sum += (*v - max).exp();
    }
    max + sum.ln()
}

/// Stable log(exp(a) + exp(b)).
pub fn log_add_exp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let m = a.max(b);
    let diff = (a - b).abs();
    m + (-diff).exp().ln_1p()
}

/// Subtract the maximum from every entry in place and return it.
///
/// An all-`-inf` slice is left untouched (the max is returned as `-inf`);
/// subtracting it would turn the entries into NaN.
pub fn sub_max_in_place(values: &mut [f64]) -> f64 {
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max.is_finite() {
        for v in values.iter_mut() {
            *v -= max;
        }
    }
    max
}

/// Exponentiate every entry in place.
pub fn exp_in_place(values: &mut [f64]) {
    for v in values.iter_mut() {
        *v = v.exp();
    }
}

/// Elementwise `dst[i] += src[i]`.
///
/// The slices must have equal length.
pub fn add_assign(dst: &mut [f64], src: &[f64]) {
    assert_eq!(dst.len(), src.len());
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d += s;
    }
}

/// Natural log of the Gamma function (log |Gamma(z)|).
///
/// Lanczos approximation (g = 7, 9 terms). Arguments left of 0.5 go
/// through the reflection formula `Gamma(z) Gamma(1-z) = pi / sin(pi z)`.
/// The poles at non-positive integers yield NaN.
pub fn log_gamma(z: f64) -> f64 {
    if !z.is_finite() {
        // +inf carries through; NaN and -inf have no gamma
        return if z == f64::INFINITY { z } else { f64::NAN };
    }
    if z <= 0.0 && z == z.floor() {
        return f64::NAN;
    }
    if z < 0.5 {
        let log_sin = (std::f64::consts::PI * z).sin().abs().ln();
        return std::f64::consts::PI.ln() - log_sin - log_gamma(1.0 - z);
    }

    let shifted = z - 1.0;
    let mut series = LANCZOS_COEFFS[0];
    for (i, coeff) in LANCZOS_COEFFS.iter().enumerate().skip(1) {
        series += coeff / (shifted + i as f64);
    }
    let tail = shifted + LANCZOS_G + 0.5;
    (shifted + 0.5) * tail.ln() - tail + series.ln() + LOG_SQRT_2PI
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
        if a.is_nan() || b.is_nan() {
            return false;
        }
        (a - b).abs() <= tol
    }

    #[test]
    fn log_sum_exp_basic() {
        let v = [0.0, 0.0];
        assert!(approx_eq(log_sum_exp(&v), 2.0f64.ln(), 1e-12));
    }

    #[test]
    fn log_sum_exp_dominance() {
        let v = [-1000.0, 0.0];
        assert!(approx_eq(log_sum_exp(&v), 0.0, 1e-12));
    }

    #[test]
    fn log_sum_exp_all_neg_inf() {
        let v = [f64::NEG_INFINITY, f64::NEG_INFINITY];
        let out = log_sum_exp(&v);
        assert!(out.is_infinite() && out.is_sign_negative());
    }

    #[test]
    fn log_add_exp_matches_lse() {
        let a = 1.234;
        let b = -0.75;
        assert!(approx_eq(log_add_exp(a, b), log_sum_exp(&[a, b]), 1e-12));
    }

    #[test]
    fn log_add_exp_neg_inf_identity() {
        assert!(approx_eq(log_add_exp(f64::NEG_INFINITY, 2.0), 2.0, 1e-12));
        assert!(approx_eq(log_add_exp(2.0, f64::NEG_INFINITY), 2.0, 1e-12));
    }

    #[test]
    fn sub_max_centers_at_zero() {
        let mut v = [1.0, 3.0, 2.0];
        let max = sub_max_in_place(&mut v);
        assert!(approx_eq(max, 3.0, 1e-12));
        assert!(approx_eq(v[1], 0.0, 1e-12));
        assert!(approx_eq(v[0], -2.0, 1e-12));
    }

    #[test]
    fn sub_max_leaves_all_neg_inf() {
        let mut v = [f64::NEG_INFINITY, f64::NEG_INFINITY];
        let max = sub_max_in_place(&mut v);
        assert!(max.is_infinite() && max.is_sign_negative());
        assert!(v.iter().all(|x| x.is_infinite()));
    }

    #[test]
    fn exp_in_place_basic() {
        let mut v = [0.0, f64::NEG_INFINITY];
        exp_in_place(&mut v);
        assert!(approx_eq(v[0], 1.0, 1e-12));
        assert!(approx_eq(v[1], 0.0, 1e-12));
    }

    #[test]
    fn add_assign_elementwise() {
        let mut a = [1.0, 2.0];
        add_assign(&mut a, &[0.5, -2.0]);
        assert!(approx_eq(a[0], 1.5, 1e-12));
        assert!(approx_eq(a[1], 0.0, 1e-12));
    }

    #[test]
    fn log_gamma_known_values() {
        assert!(approx_eq(log_gamma(1.0), 0.0, 1e-12));
        let expected = 0.5 * std::f64::consts::PI.ln();
        assert!(approx_eq(log_gamma(0.5), expected, 1e-10));
        assert!(approx_eq(log_gamma(5.0), 24.0f64.ln(), 1e-10));
        // Reflection: Gamma(-0.5) = -2 sqrt(pi), so log |.| = ln(2 sqrt(pi)).
        let neg_half = (2.0 * std::f64::consts::PI.sqrt()).ln();
        assert!(approx_eq(log_gamma(-0.5), neg_half, 1e-10));
    }

    #[test]
    fn log_gamma_poles_and_infinities() {
        assert!(log_gamma(0.0).is_nan());
        assert!(log_gamma(-3.0).is_nan());
        assert!(log_gamma(f64::NEG_INFINITY).is_nan());
        assert_eq!(log_gamma(f64::INFINITY), f64::INFINITY);
    }
}
