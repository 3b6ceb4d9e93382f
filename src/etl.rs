//! The download → extract → parse → gate → load sequence shared by the jobs.

pub mod extract;
pub mod fetch;
pub mod gate;
pub mod load;
pub mod parse;
pub mod period;
pub mod pipeline;

use std::path::PathBuf;

use duckdb::Connection;
use url::Url;

use crate::error::EtlError;

use self::{parse::RecordParser, period::SourcePeriod};

/// What a job ingests: where its archives are listed, how their rows look,
/// and how they are stored.
pub trait Dataset {
    /// Name used for the processed markers, e.g. `enrolled_job`.
    fn job_name(&self) -> &str;

    /// Page linking to one archive per period.
    fn listing_url(&self) -> &Url;

    fn parser(&self) -> RecordParser;

    /// Create the tables if they don't exist.
    fn setup(&self, conn: &Connection) -> Result<(), EtlError>;

    /// Insert the rows of one period from its CSV files, already checked by
    /// the parser.  Called inside the load transaction, returns the number
    /// of rows inserted.
    fn insert(
        &self,
        conn: &Connection,
        files: &[PathBuf],
        period: &SourcePeriod,
    ) -> Result<usize, EtlError>;

    /// Write a report of the period next to the database load, if the job
    /// produces one.
    fn write_summary(
        &self,
        _files: &[PathBuf],
        _period: &SourcePeriod,
    ) -> Result<Option<PathBuf>, EtlError> {
        Ok(None)
    }
}
