//! CLI command implementations.

pub mod inspect;
pub mod pending;
pub mod serve;
pub mod sync;
