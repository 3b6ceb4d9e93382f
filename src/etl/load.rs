use std::path::PathBuf;

use duckdb::Connection;
use log::info;

use crate::{
    db::jobs_log,
    error::EtlError,
    etl::{period::SourcePeriod, Dataset},
};

/// Insert the rows of a period from its files, then its processed marker,
/// in one transaction.  Nothing is kept if either write fails.
pub fn load_period<D: Dataset + ?Sized>(
    conn: &mut Connection,
    dataset: &D,
    files: &[PathBuf],
    period: &SourcePeriod,
) -> Result<usize, EtlError> {
    let job_name = dataset.job_name();
    info!(
        "loading {} file(s) of period {} for {} ...",
        files.len(),
        period.year,
        job_name
    );
    // rolled back on drop if not committed
    let tx = conn.transaction()?;
    if jobs_log::is_processed(&tx, job_name, period.year)? {
        return Err(EtlError::State(format!(
            "period {} of {} was marked processed by another run",
            period.year, job_name
        )));
    }
    let n = dataset.insert(&tx, files, period)?;
    jobs_log::mark_processed(&tx, job_name, period)?;
    tx.commit()?;
    info!("committed {} rows for period {}", n, period.year);
    Ok(n)
}
