//! Seating with per-type counts only.
//!
//! Dropping the table occupancies shrinks a node to two integers per
//! observed type. The price is paid on removal: without occupancies the
//! probability that unseating a customer closes a table is the Stirling
//! ratio `S_d(c-1, t-1) / S_d(c, t)`, answered by the node's scratch
//! table (or a temporary one when the caller holds none). In exchange the
//! direct Gibbs sampler can rewrite table counts in place via
//! `set_t`/`set_c`.

use std::collections::BTreeMap;

use rand::Rng;
use sm_math::StirlingTable;

use crate::restaurant::crp_fragment;
use crate::seq::Symbol;

#[derive(Debug, Clone, Copy)]
struct TypeCounts {
    c: usize,
    t: usize,
}

/// Compact restaurant state: `(c, t)` per observed type.
#[derive(Debug, Clone, Default)]
pub struct CompactSeating {
    counts: BTreeMap<Symbol, TypeCounts>,
    customers: usize,
    table_count: usize,
}

impl CompactSeating {
    pub fn c(&self) -> usize {
        self.customers
    }

    pub fn t(&self) -> usize {
        self.table_count
    }

    pub fn c_of(&self, y: Symbol) -> usize {
        self.counts.get(&y).map(|tc| tc.c).unwrap_or(0)
    }

    pub fn t_of(&self, y: Symbol) -> usize {
        self.counts.get(&y).map(|tc| tc.t).unwrap_or(0)
    }

    pub fn types(&self) -> Vec<Symbol> {
        self.counts.keys().copied().collect()
    }

    pub fn add_customer<R: Rng>(
        &mut self,
        y: Symbol,
        parent_p: f64,
        d: f64,
        a: f64,
        rng: &mut R,
    ) -> f64 {
        let w_new = (a + d * self.table_count as f64) * parent_p;
        let entry = self.counts.entry(y).or_insert(TypeCounts { c: 0, t: 0 });
        self.customers += 1;

        if entry.c == 0 {
            entry.c = 1;
            entry.t = 1;
            self.table_count += 1;
            return 1.0;
        }

        let w_old = entry.c as f64 - d * entry.t as f64;
        let u = rng.gen::<f64>() * (w_new + w_old);
        entry.c += 1;
        if u < w_new || w_old <= 0.0 {
            entry.t += 1;
            self.table_count += 1;
            1.0
        } else {
            0.0
        }
    }

    pub fn remove_customer<R: Rng>(
        &mut self,
        y: Symbol,
        d: f64,
        scratch: Option<&mut StirlingTable>,
        rng: &mut R,
    ) -> f64 {
        let entry = self.counts.get_mut(&y).expect("removing unseen symbol");
        let (c, t) = (entry.c, entry.t);
        debug_assert!(c >= 1 && t >= 1);

        let p_close = match scratch {
            Some(table) => {
                debug_assert!((table.discount() - d).abs() < 1e-12);
                table.remove_closes_table_prob(c, t)
            }
            None => StirlingTable::new(d).remove_closes_table_prob(c, t),
        };

        entry.c -= 1;
        self.customers -= 1;
        let closes = rng.gen::<f64>() < p_close;
        if closes {
            entry.t -= 1;
            self.table_count -= 1;
        }
        if entry.c == 0 {
            debug_assert_eq!(entry.t, 0);
            self.counts.remove(&y);
        }
        if closes {
            1.0
        } else {
            0.0
        }
    }

    /// Fragment every table into `fresh`; see `Seating::update_after_split`.
    ///
    /// Without occupancies the pre-split table sizes are reinstantiated
    /// first: each of the `t` tables starts with one customer and the
    /// remaining `c - t` join tables proportional to `size - d_frag`.
    pub fn split_reseat<R: Rng>(
        &mut self,
        fresh: &mut CompactSeating,
        d_frag: f64,
        gamma: f64,
        only_new: bool,
        rng: &mut R,
    ) {
        let mut new_totals: BTreeMap<Symbol, TypeCounts> = BTreeMap::new();
        for (&y, tc) in &self.counts {
            let sizes = reinstantiate_sizes(tc.c, tc.t, d_frag, rng);
            let mut fragments_total = 0usize;
            for size in sizes {
                fragments_total += crp_fragment(size, d_frag, gamma, rng).len();
            }
            fresh.counts.insert(
                y,
                TypeCounts {
                    c: fragments_total,
                    t: tc.t,
                },
            );
            fresh.customers += fragments_total;
            fresh.table_count += tc.t;
            new_totals.insert(y, TypeCounts { c: tc.c, t: fragments_total });
        }
        if !only_new {
            self.table_count = new_totals.values().map(|tc| tc.t).sum();
            self.counts = new_totals;
        }
    }

    pub fn set_t(&mut self, y: Symbol, t: usize) {
        let entry = self.counts.get_mut(&y).expect("assigning unseen symbol");
        assert!(t >= 1 && t <= entry.c);
        self.table_count = self.table_count - entry.t + t;
        entry.t = t;
    }

    pub fn set_c(&mut self, y: Symbol, c: usize) {
        let entry = self.counts.get_mut(&y).expect("assigning unseen symbol");
        assert!(c >= entry.t);
        self.customers = self.customers - entry.c + c;
        entry.c = c;
    }

    pub fn check_consistency(&self) -> bool {
        let mut customers = 0usize;
        let mut table_count = 0usize;
        let mut ok = true;
        for tc in self.counts.values() {
            ok &= tc.t >= 1 && tc.t <= tc.c;
            customers += tc.c;
            table_count += tc.t;
        }
        ok && customers == self.customers && table_count == self.table_count
    }
}

/// Draw plausible table sizes for a `(c, t)` restaurant: one founding
/// customer per table, the rest joining proportional to `size - d`.
fn reinstantiate_sizes<R: Rng>(c: usize, t: usize, d: f64, rng: &mut R) -> Vec<u32> {
    debug_assert!(t >= 1 && t <= c);
    let mut sizes = vec![1u32; t];
    for _ in t..c {
        let total: f64 = sizes.iter().map(|&s| s as f64 - d).sum();
        let mut u = rng.gen::<f64>() * total;
        let mut chosen = sizes.len() - 1;
        for (i, s) in sizes.iter().enumerate() {
            u -= *s as f64 - d;
            if u <= 0.0 {
                chosen = i;
                break;
            }
        }
        sizes[chosen] += 1;
    }
    sizes
}
