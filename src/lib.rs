//! txscope
//!
//! Transaction propagation for SQL databases (SQLite, PostgreSQL, MySQL).
//!
//! A transaction is begun once, bound into a [`Context`], and found again by every
//! query path that receives the context:
//!
//! ```no_run
//! use txscope::{ConnectionSet, Context, params};
//!
//! # async fn run() -> txscope::DbResult<()> {
//! let set = ConnectionSet::open("sqlite:app.db", "sqlite:replica.db", "orders").await?;
//! let db = set.main();
//!
//! let mut ctx = Context::background();
//! let tx = set.transactor().begin(&mut ctx).await?;
//! db.execute_must_tx(&ctx, "INSERT INTO orders (id) VALUES (:id)", &params! { "id" => 1 })
//!     .await?;
//! tx.commit().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod models;

pub use config::Config;
pub use context::Context;
pub use db::{ConnectionSet, DbPool, MainDb, Transactor, Tx, TxRef};
pub use error::{DbError, DbResult};
pub use models::{ExecResult, FromRow, FromValue, Params, Row, Value};
