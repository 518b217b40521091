//! Error types for the seqmem engine.
//!
//! Recoverable errors exist only at the configuration boundary: alphabet
//! size, hyperparameter ranges, symbol and context-range validation.
//! Violated invariants inside the engine are programmer errors and are
//! surfaced via assertions, not this enum.

use thiserror::Error;

/// Result type alias for seqmem operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the seqmem engine.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid alphabet size: {0} (must be at least 2)")]
    InvalidAlphabetSize(usize),

    #[error("symbol out of range: {symbol} (alphabet size is {num_types})")]
    SymbolOutOfRange { symbol: u16, num_types: usize },

    #[error("invalid discount: {0} (must be in (0, 1))")]
    InvalidDiscount(f64),

    #[error("invalid concentration: {0} (must be non-negative)")]
    InvalidConcentration(f64),

    #[error("empty discount schedule")]
    EmptyDiscounts,

    #[error("context range {start}..{stop} exceeds sequence length {len}")]
    ContextOutOfBounds {
        start: usize,
        stop: usize,
        len: usize,
    },
}
