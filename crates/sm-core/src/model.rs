//! The HPYP model core.
//!
//! Orchestrates the context tree, restaurants, and parameter provider
//! into an online nonparametric sequence model. The central primitive is
//! a root-to-node path with three aligned vectors (discounts,
//! concentrations, probabilities):
//!
//! - predictive probabilities are computed root-to-deepest, each level
//!   smoothing against the previous one;
//! - seating updates and removals run deepest-to-root, carrying the
//!   fraction by which a table opened or closed and stopping as soon as
//!   the propagation dies out;
//! - both Gibbs sweeps drive a post-order DFS over all root-to-node
//!   paths, maintaining the aligned vectors incrementally across
//!   sibling / ascent / ascent-then-descent transitions.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use sm_math::{
    add_assign, exp_in_place, log_kramp, sample_unnormalized, sub_max_in_place, StirlingTable,
};

use crate::error::{Error, Result};
use crate::params::{EdgeStats, ParamsConfig, PyParams};
use crate::restaurant::{Seating, SeatingKind};
use crate::seq::{Sequence, Symbol};
use crate::tree::{ContextTree, InsertAction, NodeId, NodePath, PathNode};

/// Rate of the parameter gradient step applied on every observation.
const GRADIENT_RATE: f64 = 1e-3;

/// Prediction modes for a context that may end inside an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictMode {
    /// Predict from the deepest real node above the match point.
    Above,
    /// Predict from the node below the match point, using its full
    /// context restaurant as-is.
    Below,
    /// Simulate the split the context would cause and predict through the
    /// hypothetical intermediate restaurant.
    Fragment,
}

/// Model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Alphabet size; symbols live in `[0, num_types)`.
    pub num_types: usize,

    /// Seating implementation for every node.
    #[serde(default)]
    pub seating: SeatingKind,

    /// Discount/concentration schedule.
    #[serde(default)]
    pub params: ParamsConfig,
}

impl ModelConfig {
    pub fn new(num_types: usize) -> Self {
        Self {
            num_types,
            seating: SeatingKind::default(),
            params: ParamsConfig::default(),
        }
    }

    /// Compact seating: required for the direct Gibbs sampler.
    pub fn compact(num_types: usize) -> Self {
        Self {
            num_types,
            seating: SeatingKind::Compact,
            params: ParamsConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_types < 2 {
            return Err(Error::InvalidAlphabetSize(self.num_types));
        }
        self.params.validate()
    }
}

/// Summary of a training run, in bits.
#[derive(Debug, Clone, Serialize)]
pub struct LossReport {
    pub losses_bits: Vec<f64>,
    pub total_bits: f64,
    pub avg_bits: f64,
    pub symbols: usize,
}

impl LossReport {
    pub fn from_losses(losses: Vec<f64>) -> Self {
        let total: f64 = losses.iter().sum();
        let n = losses.len();
        Self {
            total_bits: total,
            avg_bits: if n > 0 { total / n as f64 } else { 0.0 },
            symbols: n,
            losses_bits: losses,
        }
    }
}

/// The synchronized per-path vectors a DFS sweep maintains: discounts,
/// concentrations, and per-node Stirling scratch tables.
struct PathVectors {
    d: Vec<f64>,
    a: Vec<f64>,
    scratch: Vec<StirlingTable>,
}

impl PathVectors {
    fn init(params: &PyParams, tree: &ContextTree, path: &NodePath) -> Self {
        let d = params.discounts(path);
        let a = params.concentrations(path, &d);
        let scratch = path
            .iter()
            .zip(d.iter())
            .map(|(n, &dj)| make_scratch(tree, n.id, dj))
            .collect();
        let pv = Self { d, a, scratch };
        pv.assert_aligned(path.len());
        pv
    }

    /// Carry the vectors from the previous path to `path`, exploiting the
    /// post-order successor relation.
    fn transition(&mut self, params: &PyParams, tree: &ContextTree, prev_len: usize, path: &NodePath) {
        let n = path.len();
        if n == prev_len {
            // sibling: replace the last entry
            self.d.pop();
            params.extend_discounts(path, &mut self.d);
            self.a.pop();
            params.extend_concentrations(path, &self.d, &mut self.a);
            self.scratch.pop();
            let last = path[n - 1];
            self.scratch.push(make_scratch(tree, last.id, self.d[n - 1]));
        } else if n + 1 == prev_len {
            // ascent: drop the last entry
            self.d.pop();
            self.a.pop();
            self.scratch.pop();
        } else {
            // ascent followed by a descent: drop one, re-extend
            self.d.pop();
            self.a.pop();
            params.extend_discounts(path, &mut self.d);
            params.extend_concentrations(path, &self.d, &mut self.a);
            self.scratch.pop();
            for j in self.scratch.len()..n {
                self.scratch.push(make_scratch(tree, path[j].id, self.d[j]));
            }
        }
        self.assert_aligned(n);
    }

    fn assert_aligned(&self, n: usize) {
        assert_eq!(self.d.len(), n);
        assert_eq!(self.a.len(), n);
        assert_eq!(self.scratch.len(), n);
    }
}

fn make_scratch(tree: &ContextTree, id: NodeId, d: f64) -> StirlingTable {
    let mut table = StirlingTable::new(d);
    table.ensure(tree.arena().seating(id).c());
    table
}

/// Online HPYP sequence model over a borrowed symbol sequence.
pub struct HpypModel<'s, S: Sequence + ?Sized, R: Rng> {
    seq: &'s S,
    tree: ContextTree,
    params: PyParams,
    num_types: usize,
    base_prob: f64,
    rng: R,
}

impl<'s, S: Sequence + ?Sized, R: Rng> HpypModel<'s, S, R> {
    pub fn new(seq: &'s S, config: ModelConfig, rng: R) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            seq,
            tree: ContextTree::new(config.seating),
            params: PyParams::new(config.params)?,
            num_types: config.num_types,
            base_prob: 1.0 / config.num_types as f64,
            rng,
        })
    }

    pub fn tree(&self) -> &ContextTree {
        &self.tree
    }

    pub fn params(&self) -> &PyParams {
        &self.params
    }

    pub fn num_types(&self) -> usize {
        self.num_types
    }

    /// Validate a context range and its symbols against the model.
    pub fn validate_range(&self, start: usize, stop: usize) -> Result<()> {
        if stop > self.seq.len() || start > stop {
            return Err(Error::ContextOutOfBounds {
                start,
                stop,
                len: self.seq.len(),
            });
        }
        for i in start..stop {
            let symbol = self.seq.get(i);
            if symbol as usize >= self.num_types {
                return Err(Error::SymbolOutOfRange {
                    symbol,
                    num_types: self.num_types,
                });
            }
        }
        Ok(())
    }

    fn assert_symbol(&self, y: Symbol) {
        assert!(
            (y as usize) < self.num_types,
            "symbol {y} out of range for alphabet of {}",
            self.num_types
        );
    }

    // ------------------------------------------------------------------
    // Path primitives
    // ------------------------------------------------------------------

    /// Predictive probabilities along a path: `out[0]` is the base
    /// probability, `out[j + 1]` the predictive at depth `j + 1`.
    pub fn compute_probability_path(
        &self,
        path: &NodePath,
        d: &[f64],
        a: &[f64],
        y: Symbol,
    ) -> Vec<f64> {
        assert_eq!(path.len(), d.len());
        assert_eq!(path.len(), a.len());
        let mut out = Vec::with_capacity(path.len() + 1);
        let mut prob = self.base_prob;
        out.push(prob);
        for (j, n) in path.iter().enumerate() {
            prob = self.tree.arena().seating(n.id).predictive(y, prob, d[j], a[j]);
            out.push(prob);
        }
        out
    }

    /// Seat one observation along the path, deepest restaurant first.
    /// Each opened table propagates one customer to the level above; the
    /// walk stops as soon as no table opens.
    fn update_path(&mut self, path: &NodePath, probs: &[f64], d: &[f64], a: &[f64], y: Symbol) {
        assert!(!path.is_empty());
        assert_eq!(probs.len(), path.len() + 1);
        let mut weight = 1.0;
        for j in (0..path.len()).rev() {
            weight = self
                .tree
                .arena_mut()
                .seating_mut(path[j].id)
                .add_customer(y, probs[j], d[j], a[j], weight, &mut self.rng);
            if weight == 0.0 {
                break;
            }
        }
    }

    /// Unseat one observation along the path, deepest restaurant first,
    /// propagating closed tables upward until the propagation dies out.
    fn remove_observation_from_path(
        &mut self,
        path: &NodePath,
        d: &[f64],
        y: Symbol,
        mut scratch: Option<&mut [StirlingTable]>,
    ) {
        assert!(!path.is_empty());
        assert_eq!(path.len(), d.len());
        let mut weight = 1.0;
        for j in (0..path.len()).rev() {
            let entry = scratch.as_deref_mut().map(|s| &mut s[j]);
            weight = self
                .tree
                .arena_mut()
                .seating_mut(path[j].id)
                .remove_customer(y, d[j], entry, weight, &mut self.rng);
            if weight == 0.0 {
                break;
            }
        }
    }

    // ------------------------------------------------------------------
    // Context insertion
    // ------------------------------------------------------------------

    /// Insert a context into the tree and re-seat the split child's
    /// restaurant if an edge split occurred.
    pub fn insert_context(&mut self, start: usize, stop: usize) -> NodePath {
        let insertion = self.tree.insert(self.seq, start, stop);
        if insertion.action != InsertAction::NoSplit {
            // The split node is last on the path when the inserted context
            // is itself the suffix, second-to-last otherwise.
            let mid_idx = match insertion.action {
                InsertAction::Split => insertion.path.len() - 2,
                InsertAction::SplitSuffix => insertion.path.len() - 1,
                InsertAction::NoSplit => unreachable!(),
            };
            let mid = insertion.path[mid_idx];
            let parent = insertion.path[mid_idx - 1];
            let split_child = insertion
                .split_child
                .expect("split actions carry the split child");
            self.handle_split(parent, split_child, mid);
        }
        insertion.path
    }

    /// Re-parameterize the split child's seating for its new, deeper
    /// parent.
    fn handle_split(&mut self, parent: PathNode, split_child: NodeId, mid: PathNode) {
        let len_parent = parent.len();
        let len_child = self.tree.arena().node(split_child).len();
        let len_mid = mid.len();

        // The parent context is shorter than both; the split child longer
        // than the intermediate it now hangs below.
        assert!(len_parent < len_child && len_parent < len_mid);
        assert!(len_mid < len_child);

        let d_before = self.params.discount(len_parent, len_child);
        let d_after = self.params.discount(len_mid, len_child);
        trace!(
            len_parent,
            len_mid,
            len_child,
            d_before,
            d_after,
            "edge split"
        );
        let (child_seat, mid_seat) = self.tree.seating_pair_mut(split_child, mid.id);
        child_seat.update_after_split(mid_seat, d_before, d_after, false, &mut self.rng);
    }

    // ------------------------------------------------------------------
    // Online training
    // ------------------------------------------------------------------

    /// Seat the very first observation at the root (empty context).
    pub fn insert_root(&mut self, y: Symbol) {
        self.assert_symbol(y);
        let path = self.tree.find_longest_suffix(self.seq, 0, 0);
        let d = self.params.discounts(&path);
        let a = self.params.concentrations(&path, &d);
        let probs = self.compute_probability_path(&path, &d, &a, y);
        self.update_path(&path, &probs, &d, &a, y);
    }

    /// Insert the context, seat the observation, and apply one parameter
    /// gradient step. Returns the probability path computed before the
    /// update.
    pub fn insert_context_and_observation(
        &mut self,
        start: usize,
        stop: usize,
        y: Symbol,
    ) -> Vec<f64> {
        self.assert_symbol(y);
        let path = self.insert_context(start, stop);
        let d = self.params.discounts(&path);
        let a = self.params.concentrations(&path, &d);
        let probs = self.compute_probability_path(&path, &d, &a, y);

        let edges = self.edge_stats(&path, y);
        self.params.accumulate_gradient(&edges, &probs, &d, &a);

        self.update_path(&path, &probs, &d, &a, y);
        self.params.step_gradient(GRADIENT_RATE);
        probs
    }

    /// Seat an observation at an already-present context. A cached path
    /// skips the longest-suffix lookup.
    pub fn insert_observation(
        &mut self,
        start: usize,
        stop: usize,
        y: Symbol,
        cached_path: Option<&NodePath>,
    ) -> Vec<f64> {
        self.assert_symbol(y);
        trace!(start, stop, y, "insert observation");
        let path = match cached_path {
            Some(p) => p.clone(),
            None => self.tree.find_longest_suffix(self.seq, start, stop),
        };
        let d = self.params.discounts(&path);
        let a = self.params.concentrations(&path, &d);
        let probs = self.compute_probability_path(&path, &d, &a, y);
        self.update_path(&path, &probs, &d, &a, y);
        probs
    }

    /// Unseat an observation. A cached path skips the lookup; its
    /// terminal node is checked against a fresh lookup in debug builds.
    pub fn remove_observation(
        &mut self,
        start: usize,
        stop: usize,
        y: Symbol,
        cached_path: Option<&NodePath>,
    ) {
        self.assert_symbol(y);
        trace!(start, stop, y, "remove observation");
        let path = match cached_path {
            Some(p) => {
                debug_assert_eq!(
                    p.last().map(|n| n.end),
                    self.tree
                        .find_longest_suffix(self.seq, start, stop)
                        .last()
                        .map(|n| n.end),
                    "cached path disagrees with the tree"
                );
                p.clone()
            }
            None => self.tree.find_longest_suffix(self.seq, start, stop),
        };
        let d = self.params.discounts(&path);
        self.remove_observation_from_path(&path, &d, y, None);
    }

    /// Remove and immediately re-seat every observation in the range; a
    /// cheap non-Gibbs resampling of the seating arrangement.
    pub fn remove_add_sweep(&mut self, start: usize, stop: usize) {
        debug!(start, stop, "remove/add sweep");
        for i in start..stop {
            let path = self.tree.find_node(self.seq, start, i);
            let y = self.seq.get(i);
            self.remove_observation(start, i, y, Some(&path));
            self.insert_observation(start, i, y, Some(&path));
        }
    }

    /// Online training over `seq[start..stop)`, returning per-symbol
    /// losses in bits.
    ///
    /// The first symbol costs `log2(num_types)` and is seated at the
    /// root. Each later loss is taken one level above the freshly
    /// inserted context node (the last probability on the path reflects
    /// the new node itself, whose restaurant was empty when predicting).
    pub fn compute_losses(&mut self, start: usize, stop: usize) -> Vec<f64> {
        assert!(start < stop && stop <= self.seq.len());
        let mut losses = Vec::with_capacity(stop - start);
        losses.push((self.num_types as f64).log2());
        self.insert_root(self.seq.get(start));

        for i in start + 1..stop {
            let probs = self.insert_context_and_observation(start, i, self.seq.get(i));
            let prob = probs[probs.len() - 2];
            losses.push(-prob.log2());
        }
        losses
    }

    /// Like `compute_losses`, but once `lag` symbols behind, observations
    /// are removed again: a sliding-window online model.
    pub fn compute_losses_with_deletion(
        &mut self,
        start: usize,
        stop: usize,
        lag: usize,
    ) -> Vec<f64> {
        assert!(start < stop && stop <= self.seq.len());
        assert!(lag >= 1);
        let mut losses = Vec::with_capacity(stop - start);
        losses.push((self.num_types as f64).log2());
        self.insert_root(self.seq.get(start));

        for i in start + 1..stop {
            let probs = self.insert_context_and_observation(start, i, self.seq.get(i));
            let prob = probs[probs.len() - 2];
            losses.push(-prob.log2());

            if i >= start + lag {
                let behind = i - lag;
                let path = self.tree.find_node(self.seq, start, behind);
                self.remove_observation(start, behind, self.seq.get(behind), Some(&path));
            }
        }
        losses
    }

    /// Insert contexts and observations for `seq[0..stop)`.
    pub fn build_tree(&mut self, stop: usize) {
        debug!(stop, "build tree");
        self.insert_root(self.seq.get(0));
        for i in 1..stop {
            self.insert_context_and_observation(0, i, self.seq.get(i));
        }
    }

    /// Continue building over `seq[start..stop)` with full-history
    /// contexts.
    pub fn update_tree(&mut self, start: usize, stop: usize) {
        for i in start..stop {
            self.insert_context_and_observation(0, i, self.seq.get(i));
        }
    }

    // ------------------------------------------------------------------
    // Prediction
    // ------------------------------------------------------------------

    /// Predictive probability of `y` from the deepest real node whose
    /// context suffixes `seq[start..stop)`.
    pub fn predict(&self, start: usize, stop: usize, y: Symbol) -> f64 {
        let path = self.tree.find_longest_suffix(self.seq, start, stop);
        let d = self.params.discounts(&path);
        let a = self.params.concentrations(&path, &d);
        let probs = self.compute_probability_path(&path, &d, &a, y);
        *probs.last().unwrap()
    }

    /// Predictive probability from below the would-be split point: the
    /// virtual path ends at the node whose context extends the query.
    pub fn predict_below(&self, start: usize, stop: usize, y: Symbol) -> f64 {
        let (_, path) = self.tree.find_longest_suffix_virtual(self.seq, start, stop);
        let d = self.params.discounts(&path);
        let a = self.params.concentrations(&path, &d);
        let probs = self.compute_probability_path(&path, &d, &a, y);
        *probs.last().unwrap()
    }

    /// Predictive probability through the restaurant a fragmentation
    /// would create. When the context matches a node exactly this equals
    /// `predict_below`.
    pub fn predict_with_fragmentation(&mut self, start: usize, stop: usize, y: Symbol) -> f64 {
        let (frag_len, path) = self.tree.find_longest_suffix_virtual(self.seq, start, stop);
        let d = self.params.discounts(&path);
        let a = self.params.concentrations(&path, &d);
        let probs = self.compute_probability_path(&path, &d, &a, y);

        if frag_len == 0 {
            return *probs.last().unwrap();
        }

        assert!(path.len() >= 2);
        let parent = path[path.len() - 2];
        let deep = path[path.len() - 1];
        let d_frag = self.params.discount(parent.len(), frag_len);
        let a_frag = self.params.concentration(d_frag, parent.len(), frag_len);
        let d_deep = *d.last().unwrap();

        // Transient restaurant for the hypothetical intermediate node;
        // dropped on every exit path below.
        let mut transient = Seating::new(self.tree.arena().kind());
        self.tree
            .arena_mut()
            .seating_mut(deep.id)
            .update_after_split(&mut transient, d_deep, d_frag, true, &mut self.rng);
        transient.predictive(y, probs[probs.len() - 2], d_frag, a_frag)
    }

    /// Sequential predictive probabilities for `seq[start..stop)` under
    /// the chosen mode.
    pub fn predict_sequence(&mut self, start: usize, stop: usize, mode: PredictMode) -> Vec<f64> {
        (start..stop)
            .map(|i| {
                let y = self.seq.get(i);
                match mode {
                    PredictMode::Above => self.predict(start, i, y),
                    PredictMode::Below => self.predict_below(start, i, y),
                    PredictMode::Fragment => self.predict_with_fragmentation(start, i, y),
                }
            })
            .collect()
    }

    /// Predictive distribution over the whole alphabet, sharing one
    /// lookup and parameter path.
    pub fn predictive_distribution(&self, start: usize, stop: usize) -> Vec<f64> {
        let path = self.tree.find_longest_suffix(self.seq, start, stop);
        let d = self.params.discounts(&path);
        let a = self.params.concentrations(&path, &d);
        (0..self.num_types)
            .map(|y| {
                *self
                    .compute_probability_path(&path, &d, &a, y as Symbol)
                    .last()
                    .unwrap()
            })
            .collect()
    }

    /// Predictive distribution interpolated across depths: weight `w[j]`
    /// goes to the depth-`j` predictive, the remainder to the deepest.
    pub fn predictive_distribution_with_mixing(
        &self,
        start: usize,
        stop: usize,
        weights: &[f64],
    ) -> Vec<f64> {
        let path = self.tree.find_longest_suffix(self.seq, start, stop);
        let d = self.params.discounts(&path);
        let a = self.params.concentrations(&path, &d);
        (0..self.num_types)
            .map(|y| {
                let probs = self.compute_probability_path(&path, &d, &a, y as Symbol);
                let shared = weights.len().min(probs.len());
                let mut mixed = 0.0;
                let mut used = 0.0;
                for j in 0..shared {
                    mixed += weights[j] * probs[j];
                    used += weights[j];
                }
                mixed + (1.0 - used) * probs.last().unwrap()
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Gibbs sampling
    // ------------------------------------------------------------------

    fn collect_paths(&self) -> Vec<NodePath> {
        let mut out = Vec::with_capacity(self.tree.node_count());
        let mut it = self.tree.dfs_paths();
        loop {
            out.push(it.current());
            if !it.advance() {
                break;
            }
        }
        out
    }

    fn edge_stats(&self, path: &NodePath, y: Symbol) -> Vec<EdgeStats> {
        let mut prev: Option<usize> = None;
        path.iter()
            .map(|n| {
                let s = self.tree.arena().seating(n.id);
                let e = EdgeStats {
                    parent_len: prev,
                    child_len: n.len(),
                    cw: s.c_of(y) as f64,
                    tw: s.t_of(y) as f64,
                    c: s.c() as f64,
                    t: s.t() as f64,
                };
                prev = Some(n.len());
                e
            })
            .collect()
    }

    /// Resample the terminal node's seating by repeatedly unseating and
    /// re-seating each customer, propagating along the path as tables
    /// close and open.
    fn add_remove_sample_path(
        &mut self,
        path: &NodePath,
        d: &[f64],
        a: &[f64],
        scratch: &mut [StirlingTable],
    ) {
        assert!(!path.is_empty());
        assert_eq!(path.len(), d.len());
        assert_eq!(path.len(), a.len());

        let main = path.last().unwrap().id;
        for y in self.tree.arena().seating(main).types() {
            let cw = self.tree.arena().seating(main).c_of(y);
            if cw < 2 {
                continue; // nothing to reseat in a one-customer restaurant
            }

            let mut probs = self.compute_probability_path(path, d, a, y);
            for _ in 0..cw {
                // Unseat upward while tables actually close.
                let mut level: isize = path.len() as isize - 1;
                while level >= 0 {
                    let j = level as usize;
                    let closed = self
                        .tree
                        .arena_mut()
                        .seating_mut(path[j].id)
                        .remove_customer(y, d[j], Some(&mut scratch[j]), 1.0, &mut self.rng);
                    if closed == 0.0 {
                        break;
                    }
                    level -= 1;
                }

                // Recompute predictives from the shallowest touched level
                // downward; everything above is unchanged.
                let from = level.max(0) as usize;
                for j in from..path.len() {
                    probs[j + 1] =
                        self.tree.arena().seating(path[j].id).predictive(y, probs[j], d[j], a[j]);
                }

                // Re-seat upward while tables open.
                let mut level: isize = path.len() as isize - 1;
                while level >= 0 {
                    let j = level as usize;
                    let opened = self
                        .tree
                        .arena_mut()
                        .seating_mut(path[j].id)
                        .add_customer(y, probs[j], d[j], a[j], 1.0, &mut self.rng);
                    if opened == 0.0 {
                        break;
                    }
                    level -= 1;
                }
            }
        }
    }

    /// Resample the terminal node's per-type table counts directly from
    /// their conditional, walking upward while the sampled count changes.
    /// Requires compact seating.
    fn direct_gibbs_sample_path(
        &mut self,
        path: &NodePath,
        d: &[f64],
        a: &[f64],
        scratch: &mut [StirlingTable],
    ) {
        assert!(!path.is_empty());
        assert_eq!(path.len(), d.len());
        assert_eq!(path.len(), a.len());

        let main = path.last().unwrap().id;
        for y in self.tree.arena().seating(main).types() {
            if self.tree.arena().seating(main).c_of(y) < 2 {
                continue;
            }

            let mut j = path.len() - 1;
            loop {
                let cur = path[j].id;
                let (cur_cw, cur_tw, other_t) = {
                    let s = self.tree.arena().seating(cur);
                    (s.c_of(y), s.t_of(y), s.t() - s.t_of(y))
                };
                debug_assert!(cur_cw >= 1);

                let mut weights = vec![0.0; cur_cw];
                let mut lp1 = vec![0.0; cur_cw];
                let mut lp2 = vec![0.0; cur_cw];
                let mut lp3 = vec![0.0; cur_cw];
                let mut lp4 = vec![0.0; cur_cw];
                let mut parent_tw = 0usize;

                if j > 0 {
                    let parent = path[j - 1].id;
                    let (p_cw, p_tw, p_other_c) = {
                        let s = self.tree.arena().seating(parent);
                        (s.c_of(y), s.t_of(y), s.c() - cur_tw)
                    };
                    parent_tw = p_tw;

                    let (left, right) = scratch.split_at_mut(j);
                    let stirling_parent = &mut left[j - 1];
                    let stirling_cur = &mut right[0];
                    stirling_cur.ensure(cur_cw);
                    stirling_parent.ensure(p_cw - cur_tw + cur_cw);

                    for tw in 1..=cur_cw {
                        let new_parent_cw = p_cw - cur_tw + tw;
                        if new_parent_cw < p_tw {
                            lp4[tw - 1] = f64::NEG_INFINITY;
                        } else {
                            lp1[tw - 1] =
                                log_kramp(a[j] + d[j], d[j], (other_t + tw) as i64 - 1);
                            lp2[tw - 1] =
                                -log_kramp(a[j - 1] + 1.0, 1.0, (p_other_c + tw) as i64 - 1);
                            lp3[tw - 1] = stirling_cur.log_at(cur_cw, tw);
                            lp4[tw - 1] = stirling_parent.log_at(new_parent_cw, p_tw);
                        }
                    }
                } else {
                    // At the root the parent terms collapse to the base
                    // distribution.
                    let stirling_cur = &mut scratch[0];
                    stirling_cur.ensure(cur_cw);
                    for tw in 1..=cur_cw {
                        lp1[tw - 1] = log_kramp(a[0] + d[0], d[0], (other_t + tw) as i64 - 1);
                        lp2[tw - 1] = stirling_cur.log_at(cur_cw, tw);
                        lp3[tw - 1] = tw as f64 * self.base_prob.ln();
                    }
                }

                // Each addend is max-subtracted on its own before summing;
                // the sum is max-subtracted again and exponentiated.
                for v in [&mut lp1, &mut lp2, &mut lp3, &mut lp4] {
                    sub_max_in_place(v);
                }
                add_assign(&mut weights, &lp1);
                add_assign(&mut weights, &lp2);
                add_assign(&mut weights, &lp3);
                add_assign(&mut weights, &lp4);
                sub_max_in_place(&mut weights);
                exp_in_place(&mut weights);

                let sampled_tw = sample_unnormalized(&weights, &mut self.rng) + 1;

                self.tree.arena_mut().seating_mut(cur).set_t(y, sampled_tw);
                if j > 0 {
                    let parent = path[j - 1].id;
                    let new_cw =
                        self.tree.arena().seating(parent).c_of(y) - cur_tw + sampled_tw;
                    assert!(new_cw >= parent_tw);
                    self.tree.arena_mut().seating_mut(parent).set_c(y, new_cw);
                }

                if sampled_tw == cur_tw || j == 0 {
                    break;
                }
                j -= 1;
            }
        }
    }

    /// One full Gibbs sweep over every root-to-node path.
    pub fn run_gibbs_sampler(&mut self, direct: bool) {
        debug!(direct, nodes = self.tree.node_count(), "gibbs sweep");
        let paths = self.collect_paths();
        let mut pv = PathVectors::init(&self.params, &self.tree, &paths[0]);
        self.sample_path(direct, &paths[0], &mut pv);
        for i in 1..paths.len() {
            pv.transition(&self.params, &self.tree, paths[i - 1].len(), &paths[i]);
            self.sample_path(direct, &paths[i], &mut pv);
        }
    }

    fn sample_path(&mut self, direct: bool, path: &NodePath, pv: &mut PathVectors) {
        if direct {
            self.direct_gibbs_sample_path(path, &pv.d, &pv.a, &mut pv.scratch);
        } else {
            self.add_remove_sample_path(path, &pv.d, &pv.a, &mut pv.scratch);
        }
    }

    // ------------------------------------------------------------------
    // Joint probability and consistency
    // ------------------------------------------------------------------

    /// Log-probability of the terminal node's seating arrangement.
    /// Deterministic restaurants (at most one customer) contribute 0.
    fn compute_log_restaurant_prob(
        &self,
        path: &NodePath,
        d: &[f64],
        a: &[f64],
        scratch: &mut [StirlingTable],
    ) -> f64 {
        assert!(!path.is_empty());
        assert_eq!(path.len(), d.len());
        assert_eq!(path.len(), a.len());

        let seating = self.tree.arena().seating(path.last().unwrap().id);
        let c = seating.c();
        if c <= 1 {
            return 0.0;
        }
        let t = seating.t();
        let j = path.len() - 1;

        let mut lp = log_kramp(a[j] + d[j], d[j], t as i64 - 1)
            - log_kramp(a[j] + 1.0, 1.0, c as i64 - 1);

        let table = &mut scratch[j];
        table.ensure(c);
        for y in seating.types() {
            lp += table.log_at(seating.c_of(y), seating.t_of(y));
            if j == 0 {
                lp += seating.t_of(y) as f64 * self.base_prob.ln();
            }
        }
        lp
    }

    /// Joint log-probability of the whole restaurant configuration.
    pub fn compute_log_joint(&self) -> f64 {
        let paths = self.collect_paths();
        let mut pv = PathVectors::init(&self.params, &self.tree, &paths[0]);
        let mut total = self.compute_log_restaurant_prob(&paths[0], &pv.d, &pv.a, &mut pv.scratch);
        for i in 1..paths.len() {
            pv.transition(&self.params, &self.tree, paths[i - 1].len(), &paths[i]);
            total += self.compute_log_restaurant_prob(&paths[i], &pv.d, &pv.a, &mut pv.scratch);
        }
        total
    }

    /// Verify every per-node invariant and the hierarchical invariant:
    /// a parent holds at least as many customers of each type as its
    /// children hold tables of that type.
    pub fn check_consistency(&self) -> bool {
        let mut consistent = true;
        self.tree.visit_dfs_with_children(|id, children| {
            let arena = self.tree.arena();
            let seating = arena.seating(id);
            let mut node_ok = seating.check_consistency();

            let mut child_tables: BTreeMap<Symbol, usize> = BTreeMap::new();
            for &child in children {
                let cs = arena.seating(child);
                for y in cs.types() {
                    *child_tables.entry(y).or_default() += cs.t_of(y);
                }
            }
            for (&y, &tables) in &child_tables {
                if seating.c_of(y) < tables {
                    warn!(
                        node = ?id,
                        symbol = y,
                        child_tables = tables,
                        customers = seating.c_of(y),
                        "hierarchical consistency violated"
                    );
                    node_ok = false;
                }
            }
            consistent &= node_ok;
        });
        consistent
    }

    /// Indented dump of the tree with per-node seating summaries.
    pub fn render(&self) -> String {
        self.tree.render(self.seq)
    }
}
