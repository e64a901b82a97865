//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Connection pool management for the primary and replica
//! - Transaction begin/commit/rollback bound to a context
//! - Statement execution that follows the context's transaction
//! - Named parameter rewriting
//! - Type mappings

pub mod executor;
pub mod named;
pub mod params;
pub mod pool;
pub mod transaction;
pub mod types;

pub use executor::MainDb;
pub use named::{adapt_placeholders, rewrite};
pub use pool::{ConnectionSet, DbPool};
pub use transaction::{DbTransaction, Transactor, Tx, TxRef};
