//! Categorical sampling from unnormalized weights.

use rand::Rng;

use crate::math::stable::{exp_in_place, sub_max_in_place};

/// Draw an index proportional to non-negative unnormalized weights.
///
/// The total weight must be positive and finite.
pub fn sample_unnormalized<R: Rng>(weights: &[f64], rng: &mut R) -> usize {
    let total: f64 = weights.iter().sum();
    assert!(
        total > 0.0 && total.is_finite(),
        "unnormalized weights must have positive finite mass, got {total}"
    );
    let mut u = rng.gen::<f64>() * total;
    for (i, w) in weights.iter().enumerate() {
        u -= w;
        if u <= 0.0 {
            return i;
        }
    }
    // Floating-point slack: fall back to the last positively weighted index.
    weights
        .iter()
        .rposition(|&w| w > 0.0)
        .expect("positive total implies a positive weight")
}

/// Draw an index proportional to `exp(log_weights)`, max-subtracting first.
///
/// The slice is consumed as scratch space. At least one entry must be
/// finite.
pub fn sample_log_unnormalized<R: Rng>(log_weights: &mut [f64], rng: &mut R) -> usize {
    sub_max_in_place(log_weights);
    exp_in_place(log_weights);
    sample_unnormalized(log_weights, rng)
}
