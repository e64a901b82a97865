//! Data models for txscope.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod row;
pub mod value;

// Re-export commonly used types
pub use connection::{ConnectionConfig, DatabaseType, PoolKind};
pub use row::{ExecResult, FromRow, Row};
pub use value::{FromValue, Params, Value, ValueTypeError};
