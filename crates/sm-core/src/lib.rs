//! Online hierarchical Pitman–Yor sequence prediction.
//!
//! `sm-core` builds a nonparametric Bayesian language model over a stream
//! of discrete symbols: a compacted suffix tree of observed contexts
//! where every node owns a Chinese-restaurant seating representing its
//! predictive distribution, hierarchically smoothed against its parent's.
//!
//! The engine is online: observations are seated (and can be unseated)
//! one at a time, contexts are inserted incrementally with edge-split
//! handling, and two Gibbs sweeps (add/remove and direct table-count)
//! resample the latent seating. All probability bookkeeping that risks
//! underflow runs in log space.
//!
//! # Usage
//!
//! ```
//! use rand::rngs::StdRng;
//! use rand::SeedableRng;
//! use sm_core::{HpypModel, ModelConfig, Symbol};
//!
//! let seq: Vec<Symbol> = vec![0, 1, 0, 1, 0, 1, 0];
//! let mut model = HpypModel::new(&seq, ModelConfig::new(2), StdRng::seed_from_u64(7)).unwrap();
//!
//! // Online training: per-symbol losses in bits.
//! let losses = model.compute_losses(0, 7);
//! assert!(losses.iter().all(|l| l.is_finite()));
//!
//! // The model now predicts the continuation of the alternating pattern.
//! let dist = model.predictive_distribution(0, 7);
//! assert!((dist.iter().sum::<f64>() - 1.0).abs() < 1e-9);
//! ```
//!
//! The symbol sequence is an external collaborator (see [`Sequence`]):
//! the model borrows it read-only and the owner may append between
//! calls.

pub mod error;
pub mod model;
pub mod params;
pub mod restaurant;
pub mod seq;
pub mod tree;

pub use error::{Error, Result};
pub use model::{HpypModel, LossReport, ModelConfig, PredictMode};
pub use params::{EdgeStats, ParamsConfig, PyParams};
pub use restaurant::{CompactSeating, FullSeating, Seating, SeatingKind};
pub use seq::{Sequence, Symbol};
pub use tree::{
    ContextTree, DfsPathIterator, InsertAction, Insertion, Node, NodeArena, NodeId, NodePath,
    PathNode,
};
