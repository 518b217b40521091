//! Seqmem math utilities.

pub mod math;

pub use math::kramp::*;
pub use math::sample::*;
pub use math::stable::*;
pub use math::stirling::*;
