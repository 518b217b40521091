//! Discount and concentration schedules over context-length pairs.
//!
//! Discounts follow the per-position scheme of power-law smoothing: one
//! discount per context position (positions past the schedule reuse the
//! last entry, the root restaurant is position 0), and the discount of an
//! edge is the product over the positions it spans:
//!
//! ```text
//! d(l1, l2) = prod_{p = l1+1 ..= l2} theta[min(p, D-1)]
//! ```
//!
//! Products telescope, so edge discounts stay consistent when a split
//! inserts an intermediate node: `d(A, B) = d(A, C) * d(C, B)`.
//!
//! Concentrations decay with the same products, `a(child) = alpha0 *
//! d(0, child_len)`, which keeps them self-consistent across splits
//! (`a_C = a_A * d(A, C)`). The default `alpha0` is 0.
//!
//! The provider also accumulates the gradient of the predictive
//! log-probability with respect to the per-position discounts (forward
//! mode through the smoothing recursion) and applies projected
//! gradient-ascent steps; the model steps it once per observation at a
//! fixed rate.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tree::NodePath;

const DISCOUNT_FLOOR: f64 = 1e-4;

/// Configuration for the parameter provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamsConfig {
    /// Per-position discounts; the last entry covers all deeper positions.
    #[serde(default = "default_discounts")]
    pub discounts: Vec<f64>,

    /// Base concentration `alpha0`.
    #[serde(default)]
    pub concentration: f64,
}

fn default_discounts() -> Vec<f64> {
    vec![0.62, 0.69, 0.74, 0.80, 0.95]
}

impl Default for ParamsConfig {
    fn default() -> Self {
        Self {
            discounts: default_discounts(),
            concentration: 0.0,
        }
    }
}

impl ParamsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.discounts.is_empty() {
            return Err(Error::EmptyDiscounts);
        }
        for &d in &self.discounts {
            if !(d > 0.0 && d < 1.0) {
                return Err(Error::InvalidDiscount(d));
            }
        }
        if !(self.concentration >= 0.0 && self.concentration.is_finite()) {
            return Err(Error::InvalidConcentration(self.concentration));
        }
        Ok(())
    }
}

/// Per-node sufficient statistics of one path edge, as the gradient
/// accumulator consumes them.
#[derive(Debug, Clone, Copy)]
pub struct EdgeStats {
    /// Parent context length; `None` for the root restaurant.
    pub parent_len: Option<usize>,
    pub child_len: usize,
    pub cw: f64,
    pub tw: f64,
    pub c: f64,
    pub t: f64,
}

/// The parameter provider: discounts, concentrations, and their gradient
/// state.
#[derive(Debug, Clone)]
pub struct PyParams {
    discounts: Vec<f64>,
    alpha0: f64,
    grad: Vec<f64>,
}

impl PyParams {
    pub fn new(config: ParamsConfig) -> Result<Self> {
        config.validate()?;
        let dim = config.discounts.len();
        Ok(Self {
            discounts: config.discounts,
            alpha0: config.concentration,
            grad: vec![0.0; dim],
        })
    }

    pub fn discount_schedule(&self) -> &[f64] {
        &self.discounts
    }

    fn position_index(&self, p: usize) -> usize {
        p.min(self.discounts.len() - 1)
    }

    /// Product of per-position discounts over `lo..=hi`; empty when
    /// `lo > hi`.
    fn discount_over(&self, lo: usize, hi: usize) -> f64 {
        if lo > hi {
            return 1.0;
        }
        (lo..=hi)
            .map(|p| self.discounts[self.position_index(p)])
            .product()
    }

    /// Discount for the edge from a context of length `parent_len` to a
    /// deeper context of length `child_len`.
    pub fn discount(&self, parent_len: usize, child_len: usize) -> f64 {
        assert!(parent_len < child_len);
        self.discount_over(parent_len + 1, child_len)
    }

    /// Concentration for the same edge. The edge discount is accepted for
    /// interface symmetry with `discount` but the schedule depends only on
    /// the child length.
    pub fn concentration(&self, _edge_discount: f64, _parent_len: usize, child_len: usize) -> f64 {
        self.alpha0 * self.discount_over(1, child_len)
    }

    /// Discount path aligned with a root-to-node path.
    pub fn discounts(&self, path: &NodePath) -> Vec<f64> {
        let mut out = Vec::with_capacity(path.len());
        self.extend_discounts(path, &mut out);
        out
    }

    /// Extend a discount path to cover all of `path`.
    pub fn extend_discounts(&self, path: &NodePath, d: &mut Vec<f64>) {
        for j in d.len()..path.len() {
            let entry = if j == 0 {
                debug_assert_eq!(path[0].len(), 0, "paths start at the root");
                self.discount_over(0, 0)
            } else {
                self.discount(path[j - 1].len(), path[j].len())
            };
            d.push(entry);
        }
    }

    /// Concentration path aligned with a root-to-node path.
    pub fn concentrations(&self, path: &NodePath, d: &[f64]) -> Vec<f64> {
        let mut out = Vec::with_capacity(path.len());
        self.extend_concentrations(path, d, &mut out);
        out
    }

    /// Extend a concentration path to cover all of `path`.
    pub fn extend_concentrations(&self, path: &NodePath, d: &[f64], a: &mut Vec<f64>) {
        debug_assert!(d.len() == path.len());
        for j in a.len()..path.len() {
            let parent_len = if j == 0 { 0 } else { path[j - 1].len() };
            a.push(self.concentration(d[j], parent_len, path[j].len()));
        }
    }

    /// Accumulate `d log p / d theta` for one observation, forward-mode
    /// through the smoothing recursion
    /// `p_j = [(cw - d_j tw) + (a_j + d_j t) p_{j-1}] / (a_j + c)`.
    ///
    /// `probs` is the probability path (length `edges.len() + 1`), `d` and
    /// `a` the aligned parameter paths. Concentrations are treated as
    /// constants; with the default `alpha0 = 0` the dropped term is zero.
    pub fn accumulate_gradient(
        &mut self,
        edges: &[EdgeStats],
        probs: &[f64],
        d: &[f64],
        a: &[f64],
    ) {
        assert_eq!(edges.len() + 1, probs.len());
        assert_eq!(edges.len(), d.len());
        assert_eq!(edges.len(), a.len());

        let dim = self.discounts.len();
        let mut g = vec![0.0; dim];
        for (j, e) in edges.iter().enumerate() {
            if e.c == 0.0 {
                continue; // empty restaurant passes p (and its gradient) through
            }
            let p_prev = probs[j];
            let denom = a[j] + e.c;
            let carry = (a[j] + d[j] * e.t) / denom;
            for gi in g.iter_mut() {
                *gi *= carry;
            }
            let coeff = (e.t * p_prev - e.tw) / denom;
            let lo = e.parent_len.map(|l| l + 1).unwrap_or(0);
            for p in lo..=e.child_len {
                let i = self.position_index(p);
                g[i] += coeff * d[j] / self.discounts[i];
            }
        }

        let p_last = *probs.last().unwrap();
        if p_last > 0.0 {
            for (acc, gi) in self.grad.iter_mut().zip(g.iter()) {
                *acc += gi / p_last;
            }
        }
    }

    /// One projected gradient-ascent step; resets the accumulator.
    pub fn step_gradient(&mut self, rate: f64) {
        for (theta, gi) in self.discounts.iter_mut().zip(self.grad.iter()) {
            *theta = (*theta + rate * gi).clamp(DISCOUNT_FLOOR, 1.0 - DISCOUNT_FLOOR);
        }
        self.grad.iter_mut().for_each(|gi| *gi = 0.0);
    }
}
