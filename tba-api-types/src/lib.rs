//! Shared data types for the tapebackarr backup/restore core.
//!
//! Everything in here is plain data: identifiers, status enums and the
//! records persisted by the registry and catalog stores. Behavior lives in
//! the `tapebackarr` crate.

mod tape;
pub use tape::*;

mod job;
pub use job::*;

mod catalog;
pub use catalog::*;

mod execution;
pub use execution::*;

mod progress;
pub use progress::*;

/// Identifier of a persisted row (pools, tapes, jobs, sets, ...).
pub type Id = i64;
