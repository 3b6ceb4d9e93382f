use std::time::Duration;

use duckdb::{AccessMode, Config, Connection};
use log::{info, warn};

use crate::{config::DbLocation, error::EtlError};

/// Use this function to open a DuckDB connection to a file another process
/// may be holding.  Suggested `max_attempts = 8`,
/// `initial_wait = Duration::from_millis(25)`.
pub fn open_with_retry(
    duckdb_path: &str,
    max_attempts: u32,
    initial_wait: Duration,
    access_mode: AccessMode,
) -> Result<Connection, duckdb::Error> {
    let mut attempts = 0;
    let mut wait_duration = initial_wait;

    loop {
        let config = Config::default().access_mode(access_mode.clone())?;
        match Connection::open_with_flags(duckdb_path, config) {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                attempts += 1;
                if attempts >= max_attempts {
                    return Err(e);
                }
                warn!(
                    "Retrying DuckDB open after error: {} (attempt {}/{})",
                    e, attempts, max_attempts
                );
                std::thread::sleep(wait_duration);
                wait_duration *= 2;
            }
        }
    }
}

/// Open a read-write connection to the store.  The connection is closed when
/// it's dropped, at the end of the run.
pub fn open_store(location: &DbLocation) -> Result<Connection, EtlError> {
    match location {
        DbLocation::DuckDb(path) => {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let conn = open_with_retry(
                &path.to_string_lossy(),
                8,
                Duration::from_millis(25),
                AccessMode::ReadWrite,
            )
            .map_err(|e| {
                EtlError::State(format!("cannot open {}: {}", path.display(), e))
            })?;
            info!("opened duckdb store {}", path.display());
            Ok(conn)
        }
        DbLocation::MySql {
            host,
            port,
            user,
            password,
            database,
        } => {
            // mysql errors may echo the connection parameters
            let redact = |e: duckdb::Error| e.to_string().replace(password.as_str(), "***");
            let conn = Connection::open_in_memory()?;
            conn.execute_batch("INSTALL mysql; LOAD mysql;")
                .map_err(|e| EtlError::State(format!("cannot load the mysql extension: {}", e)))?;
            // parser errors quote the statement, keep them out of the message
            conn.execute_batch(&mysql_secret_sql(host, *port, user, password, database))
                .map_err(|_| {
                    EtlError::State(format!(
                        "cannot create the mysql secret for {}@{}:{}/{}",
                        user, host, port, database
                    ))
                })?;
            conn.execute_batch(&format!(
                "ATTACH '' AS store (TYPE mysql, SECRET {}); USE store;",
                MYSQL_SECRET
            ))
            .map_err(|e| {
                EtlError::State(format!(
                    "cannot attach mysql database {} on {}:{}: {}",
                    database,
                    host,
                    port,
                    redact(e)
                ))
            })?;
            info!("attached mysql store {}@{}:{}/{}", user, host, port, database);
            Ok(conn)
        }
    }
}

const MYSQL_SECRET: &str = "vocational_jobs_store";

/// Quote a value as a SQL string literal.
pub fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// The connection parameters go in a secret instead of a libmysql
/// `key=value` string, so values with spaces or quotes are passed as is.
fn mysql_secret_sql(host: &str, port: u16, user: &str, password: &str, database: &str) -> String {
    format!(
        "CREATE OR REPLACE TEMPORARY SECRET {} (TYPE mysql, HOST {}, PORT {}, USER {}, PASSWORD {}, DATABASE {});",
        MYSQL_SECRET,
        sql_literal(host),
        port,
        sql_literal(user),
        sql_literal(password),
        sql_literal(database)
    )
}
