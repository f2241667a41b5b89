//! Filechain Types
//!
//! Shared data model for the file-registration ledger: sealed [`Block`]s,
//! the [`RegistrationEvent`] each block carries, and the canonical hashing
//! that every node must agree on byte-for-byte.

pub mod block;
pub mod event;
pub mod time;

pub use block::*;
pub use event::*;
pub use time::*;
