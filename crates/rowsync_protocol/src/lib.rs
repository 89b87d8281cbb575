//! # RowSync Protocol
//!
//! Row, identity, predicate and change-event types for RowSync.
//!
//! This crate provides:
//! - `Value` and `Row` for dynamically shaped table rows
//! - `TableRow` for statically typed rows
//! - `KeySchema` and `RowId` for collision-free row identity
//! - `Condition` / `ConditionSet` for relevance evaluation
//! - `ChangeEvent` and the JSON push payload codec
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod condition;
mod error;
mod identity;
mod row;
mod value;

pub use change::{ChangeEvent, ChangeKind};
pub use condition::{evaluate, Condition, ConditionSet, Operator, Prefilter};
pub use error::{ProtocolError, ProtocolResult};
pub use identity::{generate_id, KeyEncoder, RowId};
pub use row::{KeyMatch, KeySchema, Row, TableRow};
pub use value::Value;
