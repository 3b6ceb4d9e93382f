//! The `jobs_log` table records which periods each job has fully ingested.
//! Rows are written once, in the same transaction as the period's data, and
//! never updated.

use std::collections::BTreeSet;

use duckdb::{params, Connection};
use jiff::Zoned;
use log::info;

use crate::{error::EtlError, etl::period::SourcePeriod};

pub fn setup(conn: &Connection) -> Result<(), EtlError> {
    conn.execute_batch(
        r"
CREATE TABLE IF NOT EXISTS jobs_log (
    job_name VARCHAR(64) NOT NULL,
    period INTEGER NOT NULL,
    file_name VARCHAR(255) NOT NULL,
    processed_at TIMESTAMP NOT NULL,
    PRIMARY KEY (job_name, period)
);",
    )?;
    Ok(())
}

/// All the periods already ingested by `job_name`.
pub fn processed_periods(conn: &Connection, job_name: &str) -> Result<BTreeSet<i32>, EtlError> {
    let mut stmt = conn.prepare("SELECT period FROM jobs_log WHERE job_name = ? ORDER BY period")?;
    let periods = stmt
        .query_map(params![job_name], |row| row.get::<usize, i32>(0))?
        .collect::<Result<BTreeSet<i32>, _>>()?;
    Ok(periods)
}

pub fn is_processed(conn: &Connection, job_name: &str, period: i32) -> Result<bool, EtlError> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM jobs_log WHERE job_name = ? AND period = ?",
        params![job_name, period],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

/// Insert the processed marker.  Fails if the period is already marked.
pub fn mark_processed(
    conn: &Connection,
    job_name: &str,
    period: &SourcePeriod,
) -> Result<(), EtlError> {
    conn.execute(
        "INSERT INTO jobs_log (job_name, period, file_name, processed_at) VALUES (?, ?, ?, ?::TIMESTAMP)",
        params![
            job_name,
            period.year,
            period.file_name,
            Zoned::now().strftime("%Y-%m-%d %H:%M:%S").to_string()
        ],
    )
    .map_err(|e| {
        EtlError::State(format!(
            "cannot mark period {} of {} as processed: {}",
            period.year, job_name, e
        ))
    })?;
    info!("marked period {} of {} as processed", period.year, job_name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use url::Url;

    use super::*;

    fn period(year: i32) -> SourcePeriod {
        let url = Url::parse(&format!(
            "https://datosabiertos.mineduc.cl/wp-content/uploads/Matricula_{}.rar",
            year
        ))
        .unwrap();
        SourcePeriod::new(year, url)
    }

    #[test]
    fn mark_and_read_back() -> Result<(), Box<dyn Error>> {
        let conn = Connection::open_in_memory()?;
        setup(&conn)?;
        assert!(processed_periods(&conn, "enrolled_job")?.is_empty());

        mark_processed(&conn, "enrolled_job", &period(2023))?;
        mark_processed(&conn, "enrolled_job", &period(2021))?;
        mark_processed(&conn, "graduated_job", &period(2024))?;

        assert_eq!(
            processed_periods(&conn, "enrolled_job")?,
            BTreeSet::from([2021, 2023])
        );
        assert!(is_processed(&conn, "graduated_job", 2024)?);
        assert!(!is_processed(&conn, "enrolled_job", 2024)?);
        Ok(())
    }

    #[test]
    fn period_is_marked_at_most_once() -> Result<(), Box<dyn Error>> {
        let conn = Connection::open_in_memory()?;
        setup(&conn)?;
        mark_processed(&conn, "enrolled_job", &period(2023))?;
        let err = mark_processed(&conn, "enrolled_job", &period(2023)).unwrap_err();
        assert!(matches!(err, EtlError::State(_)));
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM jobs_log", [], |row| row.get(0))?;
        assert_eq!(n, 1);
        Ok(())
    }

    #[test]
    fn missing_table_fails_closed() -> Result<(), Box<dyn Error>> {
        let conn = Connection::open_in_memory()?;
        let err = processed_periods(&conn, "enrolled_job").unwrap_err();
        assert!(matches!(err, EtlError::State(_)));
        Ok(())
    }
}
