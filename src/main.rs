//! txscope - command-line entry point.
//!
//! Opens the primary/replica connection set and optionally runs one statement,
//! either on its own or inside a transaction.

use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use txscope::{Config, ConnectionSet, Context, DbResult, ExecResult, Row};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

enum Outcome {
    Exec(ExecResult),
    Row(Row),
}

async fn run_statement(config: &Config, set: &ConnectionSet, sql: &str) -> DbResult<Outcome> {
    let db = set.main();
    let params = config.param_map();

    let mut ctx = Context::background();
    if let Some(deadline) = config.deadline() {
        ctx = ctx.with_timeout(deadline);
    }

    if !config.use_transaction() {
        return if config.row {
            db.query_row(&ctx, sql, &params).await.map(Outcome::Row)
        } else {
            db.execute(&ctx, sql, &params).await.map(Outcome::Exec)
        };
    }

    let tx = set.transactor().begin(&mut ctx).await?;
    let outcome = if config.row {
        db.query_row_must_tx(&ctx, sql, &params).await.map(Outcome::Row)
    } else {
        db.execute_must_tx(&ctx, sql, &params).await.map(Outcome::Exec)
    };

    match outcome {
        Ok(outcome) if !config.rollback => {
            tx.commit().await?;
            Ok(outcome)
        }
        Ok(outcome) => {
            tx.rollback().await?;
            Ok(outcome)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(
                    transaction_id = %tx.id(),
                    error = %rollback_err,
                    "Rollback after failed statement did not succeed"
                );
            }
            Err(e)
        }
    }
}

fn print_outcome(outcome: &Outcome) -> Result<(), serde_json::Error> {
    let text = match outcome {
        Outcome::Exec(result) => serde_json::to_string_pretty(result)?,
        Outcome::Row(row) => {
            let map: serde_json::Map<String, serde_json::Value> = row
                .columns()
                .iter()
                .cloned()
                .zip(row.values().iter().map(serde_json::to_value))
                .map(|(k, v)| v.map(|v| (k, v)))
                .collect::<Result<_, _>>()?;
            serde_json::to_string_pretty(&map)?
        }
    };
    println!("{}", text);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse_args();

    // Initialize logging
    init_tracing(&config);

    info!(
        domain = %config.domain,
        "Starting txscope v{}",
        env!("CARGO_PKG_VERSION")
    );

    let set = match ConnectionSet::open(&config.primary_url, &config.replica_url, &config.domain)
        .await
    {
        Ok(set) => set,
        Err(e) => {
            error!(domain = %config.domain, error = %e, "fatal: cannot open connection set");
            std::process::exit(1);
        }
    };

    let result = match config.sql.as_deref() {
        Some(sql) => run_statement(&config, &set, sql).await,
        None => {
            info!("No statement given; connection check passed");
            set.close().await;
            return Ok(());
        }
    };

    set.close().await;

    match result {
        Ok(outcome) => {
            print_outcome(&outcome)?;
            Ok(())
        }
        Err(e) => {
            error!(
                error = %e,
                sent = e.sent_statement(),
                sql_state = ?e.sql_state(),
                "Statement failed"
            );
            Err(e.into())
        }
    }
}
