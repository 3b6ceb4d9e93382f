use std::collections::BTreeSet;

use duckdb::Connection;
use log::info;

use crate::{db::jobs_log, error::EtlError, etl::period::SourcePeriod};

/// Whether a period should be ingested, given the periods already processed.
pub fn should_ingest(period: &SourcePeriod, processed: &BTreeSet<i32>) -> bool {
    !processed.contains(&period.year)
}

/// Decides which periods a run ingests, from the markers in `jobs_log`.
/// The database is the only state shared between runs, so a marker read
/// that fails aborts the run instead of guessing.
pub struct IngestGate<'a> {
    job_name: &'a str,
}

impl<'a> IngestGate<'a> {
    pub fn new(job_name: &'a str) -> IngestGate<'a> {
        IngestGate { job_name }
    }

    pub fn processed(&self, conn: &Connection) -> Result<BTreeSet<i32>, EtlError> {
        let processed = jobs_log::processed_periods(conn, self.job_name).map_err(|e| {
            EtlError::State(format!(
                "cannot read processed periods of {}: {}",
                self.job_name,
                e.kind()
            ))
        })?;
        info!("periods already processed by {}: {:?}", self.job_name, processed);
        Ok(processed)
    }

    /// The first `limit` candidates not processed yet, in candidate order.
    pub fn select(
        &self,
        candidates: Vec<SourcePeriod>,
        processed: &BTreeSet<i32>,
        limit: usize,
    ) -> Vec<SourcePeriod> {
        let (pending, done): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|p| should_ingest(p, processed));
        for period in &done {
            info!("period {} already processed, skipping", period);
        }
        if limit > pending.len() {
            info!(
                "{} period(s) requested, only {} pending",
                limit,
                pending.len()
            );
        }
        pending.into_iter().take(limit).collect()
    }

    /// Re-read the marker right before the period's first side effect, in
    /// case an overlapping run ingested it since the run started.
    pub fn check(&self, conn: &Connection, period: &SourcePeriod) -> Result<bool, EtlError> {
        let done = jobs_log::is_processed(conn, self.job_name, period.year).map_err(|e| {
            EtlError::State(format!(
                "cannot read marker of period {}: {}",
                period.year,
                e.kind()
            ))
        })?;
        Ok(!done)
    }
}
