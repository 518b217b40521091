//! The predictive kernel: per-node Chinese restaurant state.
//!
//! Every context-tree node owns one restaurant representing its predictive
//! distribution, smoothed against the parent's distribution through the
//! Pitman–Yor rule
//!
//! ```text
//! p(y) = [ (c_y - d*t_y) + (a + d*t) * parent_p ] / (a + c)
//! ```
//!
//! where `c`/`t` are customer and table counts. Two concrete seatings
//! implement the protocol:
//!
//! - [`FullSeating`] tracks per-table occupancies and supports exact
//!   add/remove-customer resampling;
//! - [`CompactSeating`] tracks only per-type `(c, t)` counts; removal uses
//!   Stirling-ratio probabilities and the direct Gibbs sampler mutates its
//!   table counts in place.
//!
//! Dispatch is a tagged sum stored inline in node records.

mod compact;
mod full;

pub use compact::CompactSeating;
pub use full::FullSeating;

use rand::Rng;
use serde::{Deserialize, Serialize};
use sm_math::StirlingTable;

use crate::seq::Symbol;

/// Which seating implementation a model's nodes use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeatingKind {
    /// Per-table occupancy vectors; exact add/remove resampling.
    #[default]
    Full,
    /// Per-type counts only; supports direct table-count Gibbs.
    Compact,
}

/// A node's restaurant payload.
#[derive(Debug, Clone)]
pub enum Seating {
    Full(FullSeating),
    Compact(CompactSeating),
}

/// The shared Pitman–Yor predictive rule.
///
/// An empty restaurant passes the parent probability through unchanged.
pub(crate) fn predictive_from_counts(
    cw: usize,
    tw: usize,
    c: usize,
    t: usize,
    parent_p: f64,
    d: f64,
    a: f64,
) -> f64 {
    if c == 0 {
        return parent_p;
    }
    ((cw as f64 - d * tw as f64) + (a + d * t as f64) * parent_p) / (a + c as f64)
}

/// Seat `n` customers by a CRP with discount `d` and concentration `gamma`,
/// returning the table sizes.
///
/// This is the fragmentation kernel used when an edge split inserts an
/// intermediate restaurant: each existing table fragments by a CRP with
/// discount `d_after` and concentration `-d_before` (Pitman's
/// fragmentation law), which is well defined because the post-split edge
/// discount always exceeds the pre-split product discount.
pub(crate) fn crp_fragment<R: Rng>(n: u32, d: f64, gamma: f64, rng: &mut R) -> Vec<u32> {
    debug_assert!(n >= 1);
    let mut sizes: Vec<u32> = vec![1];
    for k in 1..n {
        let t = sizes.len() as f64;
        let w_new = gamma + d * t;
        debug_assert!(w_new >= 0.0, "invalid fragmentation weights: {w_new}");
        let w_old: f64 = k as f64 - d * t;
        let u = rng.gen::<f64>() * (w_new + w_old);
        if u < w_new {
            sizes.push(1);
        } else {
            // Join an existing table proportional to (size - d).
            let mut v = u - w_new;
            let mut joined = sizes.len() - 1;
            for (i, s) in sizes.iter().enumerate() {
                v -= *s as f64 - d;
                if v <= 0.0 {
                    joined = i;
                    break;
                }
            }
            sizes[joined] += 1;
        }
    }
    sizes
}

impl Seating {
    pub fn new(kind: SeatingKind) -> Self {
        match kind {
            SeatingKind::Full => Seating::Full(FullSeating::default()),
            SeatingKind::Compact => Seating::Compact(CompactSeating::default()),
        }
    }

    pub fn kind(&self) -> SeatingKind {
        match self {
            Seating::Full(_) => SeatingKind::Full,
            Seating::Compact(_) => SeatingKind::Compact,
        }
    }

    /// Total customer count `c`.
    pub fn c(&self) -> usize {
        match self {
            Seating::Full(s) => s.c(),
            Seating::Compact(s) => s.c(),
        }
    }

    /// Total table count `t`.
    pub fn t(&self) -> usize {
        match self {
            Seating::Full(s) => s.t(),
            Seating::Compact(s) => s.t(),
        }
    }

    /// Customer count for one type, `c(y)`.
    pub fn c_of(&self, y: Symbol) -> usize {
        match self {
            Seating::Full(s) => s.c_of(y),
            Seating::Compact(s) => s.c_of(y),
        }
    }

    /// Table count for one type, `t(y)`.
    pub fn t_of(&self, y: Symbol) -> usize {
        match self {
            Seating::Full(s) => s.t_of(y),
            Seating::Compact(s) => s.t_of(y),
        }
    }

    /// Observed types, in increasing symbol order.
    pub fn types(&self) -> Vec<Symbol> {
        match self {
            Seating::Full(s) => s.types(),
            Seating::Compact(s) => s.types(),
        }
    }

    /// Predictive probability of `y` given the parent's probability.
    pub fn predictive(&self, y: Symbol, parent_p: f64, d: f64, a: f64) -> f64 {
        predictive_from_counts(self.c_of(y), self.t_of(y), self.c(), self.t(), parent_p, d, a)
    }

    /// Seat one customer of type `y`.
    ///
    /// Returns the fraction by which a new table was opened (`1.0` or
    /// `0.0` for these seatings); the caller propagates it upward as the
    /// parent's customer weight. `weight` is the fraction propagated from
    /// below.
    pub fn add_customer<R: Rng>(
        &mut self,
        y: Symbol,
        parent_p: f64,
        d: f64,
        a: f64,
        weight: f64,
        rng: &mut R,
    ) -> f64 {
        debug_assert!(weight > 0.0);
        match self {
            Seating::Full(s) => s.add_customer(y, parent_p, d, a, rng),
            Seating::Compact(s) => s.add_customer(y, parent_p, d, a, rng),
        }
    }

    /// Unseat one customer of type `y`.
    ///
    /// Returns the fraction by which a table closed; the caller propagates
    /// it upward as a removal weight, stopping at `0.0`. Compact seatings
    /// consult `scratch` (a Stirling table for this node's discount) and
    /// build a temporary one when the caller has none.
    pub fn remove_customer<R: Rng>(
        &mut self,
        y: Symbol,
        d: f64,
        scratch: Option<&mut StirlingTable>,
        weight: f64,
        rng: &mut R,
    ) -> f64 {
        debug_assert!(weight > 0.0);
        match self {
            Seating::Full(s) => s.remove_customer(y, rng),
            Seating::Compact(s) => s.remove_customer(y, d, scratch, rng),
        }
    }

    /// Re-seat tables after an edge split placed a new restaurant between
    /// this one and its former parent.
    ///
    /// `d_before` is the pre-split edge discount, `d_after` the post-split
    /// one. Every table of `self` fragments by a CRP with discount
    /// `d_after` and concentration `-d_before`; `fresh` (the intermediate
    /// restaurant) receives one table per original table, sized by the
    /// fragment count. With `only_new` the fragmentation is simulated and
    /// only `fresh` is materialized; `self` is left untouched.
    pub fn update_after_split<R: Rng>(
        &mut self,
        fresh: &mut Seating,
        d_before: f64,
        d_after: f64,
        only_new: bool,
        rng: &mut R,
    ) {
        assert!(d_after > d_before, "split must increase the edge discount");
        assert_eq!(fresh.c(), 0, "split target must start empty");
        let gamma = -d_before;
        match (self, fresh) {
            (Seating::Full(old), Seating::Full(new)) => {
                old.split_reseat(new, d_after, gamma, only_new, rng);
            }
            (Seating::Compact(old), Seating::Compact(new)) => {
                old.split_reseat(new, d_after, gamma, only_new, rng);
            }
            _ => panic!("split across seating kinds"),
        }
    }

    /// Overwrite the table count for one type. Compact seating only.
    pub fn set_t(&mut self, y: Symbol, t: usize) {
        match self {
            Seating::Compact(s) => s.set_t(y, t),
            Seating::Full(_) => panic!("direct table-count assignment requires compact seating"),
        }
    }

    /// Overwrite the customer count for one type. Compact seating only.
    pub fn set_c(&mut self, y: Symbol, c: usize) {
        match self {
            Seating::Compact(s) => s.set_c(y, c),
            Seating::Full(_) => panic!("direct customer-count assignment requires compact seating"),
        }
    }

    /// Verify the per-restaurant invariants.
    pub fn check_consistency(&self) -> bool {
        match self {
            Seating::Full(s) => s.check_consistency(),
            Seating::Compact(s) => s.check_consistency(),
        }
    }

    /// One-line diagnostic summary.
    pub fn summary(&self) -> String {
        let per_type: Vec<String> = self
            .types()
            .iter()
            .map(|&y| format!("{}:{}/{}", y, self.c_of(y), self.t_of(y)))
            .collect();
        format!("[c={} t={} {}]", self.c(), self.t(), per_type.join(" "))
    }
}
