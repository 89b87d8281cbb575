//! CLI command implementations.

pub mod identity;
pub mod replay;
