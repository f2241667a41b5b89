//! Filechain Ledger Engine
//!
//! Owns the authoritative local chain of file-registration blocks. The
//! engine seals new events with a small proof-of-work, validates blocks and
//! whole chains by hash linkage, resolves forks with a strict longest-valid-
//! chain rule, and keeps a derived file-id index for O(1) lookups.
//!
//! ## Modules
//! - `config`: difficulty and mining limits
//! - `mining`: nonce search over a fixed block template
//! - `validation`: link and whole-chain checks
//! - `ledger`: the stateful engine persisted through a [`ChainStore`]
//!
//! The engine has no networking dependencies. Callers share it behind a
//! [`SharedLedger`] so `append` and `replace` stay single-writer.

pub mod config;
pub mod error;
pub mod ledger;
pub mod mining;
pub mod validation;

pub use config::LedgerConfig;
pub use error::{ChainError, LedgerError};
pub use ledger::{Ledger, SharedLedger};
pub use mining::BlockTemplate;
pub use validation::{check_chain, check_link, genesis, validate_chain, validate_link};

pub use filechain_storage::ChainStore;

pub type Result<T> = std::result::Result<T, LedgerError>;
