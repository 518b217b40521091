//! Seating with per-table occupancy vectors.

use std::collections::BTreeMap;

use rand::Rng;

use crate::restaurant::crp_fragment;
use crate::seq::Symbol;

/// Exact restaurant state: for every observed type, the occupancy of each
/// of its tables. Supports unbiased customer removal (pick a table
/// proportional to its size) and is therefore the seating used for online
/// training with deletion and for add/remove Gibbs.
#[derive(Debug, Clone, Default)]
pub struct FullSeating {
    tables: BTreeMap<Symbol, Vec<u32>>,
    customers: usize,
    table_count: usize,
}

impl FullSeating {
    pub fn c(&self) -> usize {
        self.customers
    }

    pub fn t(&self) -> usize {
        self.table_count
    }

    pub fn c_of(&self, y: Symbol) -> usize {
        self.tables
            .get(&y)
            .map(|v| v.iter().map(|&s| s as usize).sum())
            .unwrap_or(0)
    }

    pub fn t_of(&self, y: Symbol) -> usize {
        self.tables.get(&y).map(|v| v.len()).unwrap_or(0)
    }

    pub fn types(&self) -> Vec<Symbol> {
        self.tables.keys().copied().collect()
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
        let tables = self.tables.entry(y).or_default();
        self.customers += 1;

        if tables.is_empty() {
            tables.push(1);
            self.table_count += 1;
            return 1.0;
        }

        let w_old: f64 = tables.iter().map(|&s| s as f64 - d).sum();
        let u = rng.gen::<f64>() * (w_new + w_old);
        if u < w_new || w_old <= 0.0 {
            tables.push(1);
            self.table_count += 1;
            1.0
        } else {
            let mut v = u - w_new;
            let mut chosen = tables.len() - 1;
            for (i, s) in tables.iter().enumerate() {
                v -= *s as f64 - d;
                if v <= 0.0 {
                    chosen = i;
                    break;
                }
            }
            tables[chosen] += 1;
            0.0
        }
    }

    pub fn remove_customer<R: Rng>(&mut self, y: Symbol, rng: &mut R) -> f64 {
        let tables = self.tables.get_mut(&y).expect("removing unseen symbol");
        let total: u32 = tables.iter().sum();
        debug_assert!(total >= 1);

        // Pick the seated customer uniformly, i.e. a table by occupancy.
        let mut u = rng.gen::<f64>() * total as f64;
        let mut chosen = tables.len() - 1;
        for (i, s) in tables.iter().enumerate() {
            u -= *s as f64;
            if u <= 0.0 {
                chosen = i;
                break;
            }
        }

        tables[chosen] -= 1;
        self.customers -= 1;
        if tables[chosen] == 0 {
            tables.swap_remove(chosen);
            self.table_count -= 1;
            if tables.is_empty() {
                self.tables.remove(&y);
            }
            1.0
        } else {
            0.0
        }
    }

    /// Fragment every table into `fresh`; see `Seating::update_after_split`.
    pub fn split_reseat<R: Rng>(
        &mut self,
        fresh: &mut FullSeating,
        d_frag: f64,
        gamma: f64,
        only_new: bool,
        rng: &mut R,
    ) {
        let mut reseated: BTreeMap<Symbol, Vec<u32>> = BTreeMap::new();
        for (&y, tables) in &self.tables {
            let fresh_tables = fresh.tables.entry(y).or_default();
            let new_tables = reseated.entry(y).or_default();
            for &size in tables {
                let fragments = crp_fragment(size, d_frag, gamma, rng);
                fresh_tables.push(fragments.len() as u32);
                fresh.customers += fragments.len();
                fresh.table_count += 1;
                new_tables.extend_from_slice(&fragments);
            }
        }
        if !only_new {
            self.table_count = reseated.values().map(|v| v.len()).sum();
            self.tables = reseated;
        }
    }

    pub fn check_consistency(&self) -> bool {
        let mut customers = 0usize;
        let mut table_count = 0usize;
        let mut ok = true;
        for tables in self.tables.values() {
            ok &= !tables.is_empty();
            ok &= tables.iter().all(|&s| s >= 1);
            customers += tables.iter().map(|&s| s as usize).sum::<usize>();
            table_count += tables.len();
        }
        ok && customers == self.customers && table_count == self.table_count
    }
}
