//! Query execution engine.
//!
//! [`MainDb`] runs statements against the primary pool, or against the transaction
//! bound to the caller's [`Context`] when there is one. The `_must_tx` variants refuse
//! to run without a bound transaction instead of falling back to the pool.
//!
//! # Architecture
//!
//! The executor uses database-specific implementations organized in submodules:
//! - `mysql`: MySQL-specific statement and row operations
//! - `postgres`: PostgreSQL-specific statement and row operations
//! - `sqlite`: SQLite-specific statement and row operations
//!
//! The MySQL and SQLite submodules are generic over the sqlx executor, so the same
//! code serves a pool and a transaction connection. The PostgreSQL one works on a
//! single connection, because it prepares a statement to learn its parameter types
//! before running it there.

use crate::context::Context;
use crate::db::named;
use crate::db::params::{bind_mysql_param, bind_postgres_param, bind_sqlite_param};
use crate::db::pool::DbPool;
use crate::db::transaction::{DbTransaction, TxRef};
use crate::db::types::DecodeRow;
use crate::error::{DbError, DbResult};
use crate::models::{ExecResult, FromRow, Params, Row, Value};
use futures_util::StreamExt;
use tracing::debug;

/// Executor for the primary database.
#[derive(Debug, Clone)]
pub struct MainDb {
    pool: DbPool,
}

/// Where a statement runs.
#[derive(Clone, Copy)]
enum Target<'a> {
    Pool(&'a DbPool),
    Tx(&'a TxRef),
}

impl MainDb {
    pub(crate) fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Raw access to the primary pool, bypassing context lookup.
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Execute a statement in the transaction bound to `ctx`.
    ///
    /// Returns [`DbError::MissingTransaction`] without contacting the database when
    /// `ctx` carries no transaction.
    pub async fn execute_must_tx(
        &self,
        ctx: &Context,
        query: &str,
        params: &Params,
    ) -> DbResult<ExecResult> {
        let tx = ctx.transaction().ok_or(DbError::MissingTransaction)?;
        self.execute_on(ctx, Target::Tx(tx), "execute_must_tx", query, params)
            .await
    }

    /// Execute a statement in the transaction bound to `ctx`, or on the pool.
    pub async fn execute(
        &self,
        ctx: &Context,
        query: &str,
        params: &Params,
    ) -> DbResult<ExecResult> {
        let target = self.resolve(ctx);
        self.execute_on(ctx, target, "execute", query, params).await
    }

    /// Fetch exactly one row from the transaction bound to `ctx`.
    ///
    /// Returns [`DbError::MissingTransaction`] without contacting the database when
    /// `ctx` carries no transaction.
    pub async fn query_row_must_tx<T: FromRow>(
        &self,
        ctx: &Context,
        query: &str,
        params: &Params,
    ) -> DbResult<T> {
        let tx = ctx.transaction().ok_or(DbError::MissingTransaction)?;
        self.query_row_on(ctx, Target::Tx(tx), "query_row_must_tx", query, params)
            .await
    }

    /// Fetch exactly one row, from the transaction bound to `ctx` or from the pool.
    ///
    /// Zero rows, more than one row, or a row that does not fit `T` is a
    /// [`DbError::Scan`] error; the statement has run by then.
    pub async fn query_row<T: FromRow>(
        &self,
        ctx: &Context,
        query: &str,
        params: &Params,
    ) -> DbResult<T> {
        let target = self.resolve(ctx);
        self.query_row_on(ctx, target, "query_row", query, params)
            .await
    }

    fn resolve<'a>(&'a self, ctx: &'a Context) -> Target<'a> {
        match ctx.transaction() {
            Some(tx) => Target::Tx(tx),
            None => Target::Pool(&self.pool),
        }
    }

    async fn execute_on(
        &self,
        ctx: &Context,
        target: Target<'_>,
        operation: &str,
        query: &str,
        params: &Params,
    ) -> DbResult<ExecResult> {
        let (sql, args) = named::prepare(query, params, self.pool.db_type())?;

        debug!(
            sql = %sql,
            params = args.len(),
            transaction_id = ?transaction_id(target),
            "Executing statement"
        );

        let result = ctx.bound(operation, run_execute(target, &sql, &args)).await?;

        debug!(
            rows_affected = result.rows_affected,
            transaction_id = ?transaction_id(target),
            "Statement executed"
        );
        Ok(result)
    }

    async fn query_row_on<T: FromRow>(
        &self,
        ctx: &Context,
        target: Target<'_>,
        operation: &str,
        query: &str,
        params: &Params,
    ) -> DbResult<T> {
        let (sql, args) = named::prepare(query, params, self.pool.db_type())?;

        debug!(
            sql = %sql,
            params = args.len(),
            transaction_id = ?transaction_id(target),
            "Querying single row"
        );

        let row = ctx.bound(operation, run_fetch_row(target, &sql, &args)).await?;
        T::from_row(row)
    }
}

fn transaction_id(target: Target<'_>) -> Option<&str> {
    match target {
        Target::Pool(_) => None,
        Target::Tx(tx) => Some(tx.id()),
    }
}

async fn run_execute(target: Target<'_>, sql: &str, args: &[Value]) -> DbResult<ExecResult> {
    match target {
        Target::Pool(DbPool::MySql(p)) => mysql::execute(p, sql, args).await,
        Target::Pool(DbPool::Postgres(p)) => {
            let mut conn = p.acquire().await?;
            postgres::execute(&mut conn, sql, args).await
        }
        Target::Pool(DbPool::SQLite(p)) => sqlite::execute(p, sql, args).await,
        Target::Tx(tx) => {
            let mut guard = tx.lock().await;
            let open = guard
                .as_mut()
                .ok_or_else(|| DbError::transaction_closed(tx.id()))?;
            match open {
                DbTransaction::MySql(t) => mysql::execute(&mut **t, sql, args).await,
                DbTransaction::Postgres(t) => postgres::execute(&mut **t, sql, args).await,
                DbTransaction::SQLite(t) => sqlite::execute(&mut **t, sql, args).await,
            }
        }
    }
}

async fn run_fetch_row(target: Target<'_>, sql: &str, args: &[Value]) -> DbResult<Row> {
    match target {
        Target::Pool(DbPool::MySql(p)) => mysql::fetch_row(p, sql, args).await,
        Target::Pool(DbPool::Postgres(p)) => {
            let mut conn = p.acquire().await?;
            postgres::fetch_row(&mut conn, sql, args).await
        }
        Target::Pool(DbPool::SQLite(p)) => sqlite::fetch_row(p, sql, args).await,
        Target::Tx(tx) => {
            let mut guard = tx.lock().await;
            let open = guard
                .as_mut()
                .ok_or_else(|| DbError::transaction_closed(tx.id()))?;
            match open {
                DbTransaction::MySql(t) => mysql::fetch_row(&mut **t, sql, args).await,
                DbTransaction::Postgres(t) => postgres::fetch_row(&mut **t, sql, args).await,
                DbTransaction::SQLite(t) => sqlite::fetch_row(&mut **t, sql, args).await,
            }
        }
    }
}

// =============================================================================
// Common Helper Functions
// =============================================================================

/// Rows to pull from a single-row query: one more than needed, to detect extras.
const SINGLE_ROW_PROBE: usize = 2;

fn collect_rows<R>(results: Vec<Result<R, sqlx::Error>>) -> DbResult<Vec<R>> {
    let mut rows = Vec::with_capacity(results.len());
    for result in results {
        rows.push(result.map_err(DbError::from)?);
    }
    Ok(rows)
}

fn single_row<R: DecodeRow>(rows: Vec<R>) -> DbResult<Row> {
    match rows.as_slice() {
        [] => Err(DbError::scan("no rows in result set")),
        [row] => row.decode_row(),
        _ => Err(DbError::scan("query returned more than one row")),
    }
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================
//
// Each module below provides the same interface adapted to its database type.
// The code structure is intentionally parallel to make differences obvious.

mod mysql {
    use super::*;
    use sqlx::MySql;
    use sqlx::mysql::MySqlRow;

    pub async fn execute<'c, E>(executor: E, sql: &str, args: &[Value]) -> DbResult<ExecResult>
    where
        E: sqlx::Executor<'c, Database = MySql>,
    {
        // When args is empty, execute raw SQL directly to avoid prepared statement issues
        // (some SQL like CREATE PROCEDURE doesn't support prepared statements)
        let result = if args.is_empty() {
            sqlx::Executor::execute(executor, sql).await?
        } else {
            let mut query = sqlx::query(sql);
            for arg in args {
                query = bind_mysql_param(query, arg);
            }
            query.execute(executor).await?
        };

        Ok(ExecResult {
            rows_affected: result.rows_affected(),
            last_insert_id: i64::try_from(result.last_insert_id())
                .ok()
                .filter(|id| *id != 0),
        })
    }

    pub async fn fetch_row<'c, E>(executor: E, sql: &str, args: &[Value]) -> DbResult<Row>
    where
        E: sqlx::Executor<'c, Database = MySql>,
    {
        let results: Vec<Result<MySqlRow, sqlx::Error>> = if args.is_empty() {
            sqlx::Executor::fetch(executor, sql)
                .take(SINGLE_ROW_PROBE)
                .collect()
                .await
        } else {
            let mut query = sqlx::query(sql);
            for arg in args {
                query = bind_mysql_param(query, arg);
            }
            query.fetch(executor).take(SINGLE_ROW_PROBE).collect().await
        };
        single_row(collect_rows(results)?)
    }
}

mod postgres {
    use super::*;
    use crate::db::params::{INDETERMINATE_DATATYPE, declared_postgres_type};
    use sqlx::postgres::{PgRow, PgTypeInfo};
    use sqlx::{Either, PgConnection, Statement};

    // Unlike the other backends these take a connection: the parameter types are
    // resolved with a prepare on the same connection that then runs the statement.

    pub async fn execute(
        conn: &mut PgConnection,
        sql: &str,
        args: &[Value],
    ) -> DbResult<ExecResult> {
        let result = if args.is_empty() {
            sqlx::Executor::execute(&mut *conn, sql).await?
        } else {
            let types = parameter_types(conn, sql, args).await?;
            let mut query = sqlx::query(sql);
            for (arg, ty) in args.iter().zip(types) {
                query = bind_postgres_param(query, arg, ty);
            }
            query.execute(&mut *conn).await?
        };

        // PostgreSQL reports generated keys through RETURNING only
        Ok(ExecResult {
            rows_affected: result.rows_affected(),
            last_insert_id: None,
        })
    }

    pub async fn fetch_row(conn: &mut PgConnection, sql: &str, args: &[Value]) -> DbResult<Row> {
        let results: Vec<Result<PgRow, sqlx::Error>> = if args.is_empty() {
            sqlx::Executor::fetch(&mut *conn, sql)
                .take(SINGLE_ROW_PROBE)
                .collect()
                .await
        } else {
            let types = parameter_types(conn, sql, args).await?;
            let mut query = sqlx::query(sql);
            for (arg, ty) in args.iter().zip(types) {
                query = bind_postgres_param(query, arg, ty);
            }
            query.fetch(&mut *conn).take(SINGLE_ROW_PROBE).collect().await
        };
        single_row(collect_rows(results)?)
    }

    /// Prepare `sql` and return the parameter types the server settled on.
    ///
    /// Strings and NULLs are first left untyped so the server infers them from
    /// context. Where it cannot (`SELECT :x`), they fall back to TEXT.
    async fn parameter_types(
        conn: &mut PgConnection,
        sql: &str,
        args: &[Value],
    ) -> DbResult<Vec<PgTypeInfo>> {
        let declared: Vec<PgTypeInfo> = args
            .iter()
            .map(|a| declared_postgres_type(a, true))
            .collect();

        let statement = match sqlx::Executor::prepare_with(&mut *conn, sql, &declared).await {
            Ok(statement) => statement,
            Err(sqlx::Error::Database(e))
                if e.code().as_deref() == Some(INDETERMINATE_DATATYPE) =>
            {
                debug!(error = %e, "Parameter types not inferable, declaring them as text");
                let declared: Vec<PgTypeInfo> =
                    args.iter().map(|a| declared_postgres_type(a, false)).collect();
                sqlx::Executor::prepare_with(&mut *conn, sql, &declared).await?
            }
            Err(e) => return Err(e.into()),
        };

        match statement.parameters() {
            Some(Either::Left(types)) if types.len() == args.len() => Ok(types.to_vec()),
            _ => Ok(declared),
        }
    }
}

mod sqlite {
    use super::*;
    use sqlx::Sqlite;
    use sqlx::sqlite::SqliteRow;

    pub async fn execute<'c, E>(executor: E, sql: &str, args: &[Value]) -> DbResult<ExecResult>
    where
        E: sqlx::Executor<'c, Database = Sqlite>,
    {
        let result = if args.is_empty() {
            sqlx::Executor::execute(executor, sql).await?
        } else {
            let mut query = sqlx::query(sql);
            for arg in args {
                query = bind_sqlite_param(query, arg);
            }
            query.execute(executor).await?
        };

        Ok(ExecResult {
            rows_affected: result.rows_affected(),
            last_insert_id: Some(result.last_insert_rowid()).filter(|id| *id != 0),
        })
    }

    pub async fn fetch_row<'c, E>(executor: E, sql: &str, args: &[Value]) -> DbResult<Row>
    where
        E: sqlx::Executor<'c, Database = Sqlite>,
    {
        let results: Vec<Result<SqliteRow, sqlx::Error>> = if args.is_empty() {
            sqlx::Executor::fetch(executor, sql)
                .take(SINGLE_ROW_PROBE)
                .collect()
                .await
        } else {
            let mut query = sqlx::query(sql);
            for arg in args {
                query = bind_sqlite_param(query, arg);
            }
            query.fetch(executor).take(SINGLE_ROW_PROBE).collect().await
        };
        single_row(collect_rows(results)?)
    }
}
