use std::{
    collections::{hash_map::DefaultHasher, HashMap, HashSet},
    fmt::Display,
    fs::File,
    hash::{Hash, Hasher},
    io::BufReader,
    path::Path,
    sync::Arc,
};

use csv::ByteRecord;
use log::{error, info, warn};

use crate::error::EtlError;

/// Column names of a file, shared by all of its records.
#[derive(Debug, PartialEq, Eq)]
pub struct Header {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl Header {
    pub fn new(names: Vec<String>) -> Header {
        let index = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Header { names, index }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn position(&self, column: &str) -> Option<usize> {
        self.index.get(column).copied()
    }

    /// Required columns absent from the header, in the order given.
    pub fn missing<'a>(&self, required: &[&'a str]) -> Vec<&'a str> {
        required
            .iter()
            .filter(|c| !self.index.contains_key(**c))
            .copied()
            .collect()
    }
}

/// One row of a source file, as a mapping from column name to raw value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    header: Arc<Header>,
    values: Vec<String>,
}

impl RawRecord {
    pub fn new(header: Arc<Header>, values: Vec<String>) -> RawRecord {
        RawRecord { header, values }
    }

    /// Value of a column, `None` if the file has no such column.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.header
            .position(column)
            .and_then(|i| self.values.get(i))
            .map(|v| v.as_str())
    }

    pub fn header(&self) -> &Header {
        &self.header
    }
}

/// Counters reported for each file parsed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParseStats {
    pub rows: usize,
    pub blank_rows: usize,
    pub malformed_rows: usize,
    /// Rows equal to an earlier row of the same file.  Rows are compared by
    /// a 64 bit hash, so the count can be low in case of a collision.
    pub duplicate_rows: usize,
}

impl ParseStats {
    pub fn add(&mut self, other: &ParseStats) {
        self.rows += other.rows;
        self.blank_rows += other.blank_rows;
        self.malformed_rows += other.malformed_rows;
        self.duplicate_rows += other.duplicate_rows;
    }
}

impl Display for ParseStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} rows, {} blank, {} malformed, ~{} duplicated (by row hash)",
            self.rows, self.blank_rows, self.malformed_rows, self.duplicate_rows
        )
    }
}

/// Reads the `;` separated files published by the data provider.  Rows are
/// handed out one at a time, a file is never held in memory.
#[derive(Debug, Clone)]
pub struct RecordParser {
    pub delimiter: u8,
    pub required_columns: Vec<String>,
}

impl RecordParser {
    pub fn new(delimiter: u8, required_columns: &[&str]) -> RecordParser {
        RecordParser {
            delimiter,
            required_columns: required_columns.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// Call `f` on each record of a file.  Fails with a schema error if a
    /// required column is missing from the header, before any record is
    /// read.  Rows with the wrong number of fields are skipped and counted.
    pub fn for_each_record<F>(&self, path: &Path, mut f: F) -> Result<ParseStats, EtlError>
    where
        F: FnMut(&RawRecord) -> Result<(), EtlError>,
    {
        info!("parsing CSV file {}", path.display());
        let file = File::open(path)?;
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .flexible(true)
            .has_headers(true)
            .from_reader(BufReader::new(file));

        let names: Vec<String> = rdr
            .byte_headers()?
            .iter()
            .enumerate()
            .map(|(i, h)| {
                let name = String::from_utf8_lossy(h);
                if i == 0 {
                    name.trim_start_matches('\u{feff}').trim().to_string()
                } else {
                    name.trim().to_string()
                }
            })
            .collect();
        let header = Arc::new(Header::new(names));

        let required: Vec<&str> = self.required_columns.iter().map(|c| c.as_str()).collect();
        let missing = header.missing(&required);
        if !missing.is_empty() {
            let msg = format!(
                "columns {:?} missing from {}, the data provider changed the file layout",
                missing,
                path.display()
            );
            error!("{}", msg);
            return Err(EtlError::Schema(msg));
        }

        let n_columns = header.names().len();
        let mut stats = ParseStats::default();
        // row hashes, only used for the duplicate count
        let mut seen: HashSet<u64> = HashSet::new();
        let mut raw = ByteRecord::new();
        while rdr.read_byte_record(&mut raw)? {
            if raw.iter().all(|field| field.iter().all(u8::is_ascii_whitespace)) {
                stats.blank_rows += 1;
                continue;
            }
            if raw.len() != n_columns {
                stats.malformed_rows += 1;
                let line = raw.position().map(|p| p.line()).unwrap_or_default();
                warn!(
                    "line {} has {} fields instead of {}, skipping",
                    line,
                    raw.len(),
                    n_columns
                );
                continue;
            }
            let values: Vec<String> = raw
                .iter()
                .map(|field| String::from_utf8_lossy(field).trim().to_string())
                .collect();
            let mut hasher = DefaultHasher::new();
            values.hash(&mut hasher);
            if !seen.insert(hasher.finish()) {
                stats.duplicate_rows += 1;
            }
            f(&RawRecord::new(header.clone(), values))?;
            stats.rows += 1;
        }

        info!(
            "{}: {}",
            path.file_name().unwrap_or_default().to_string_lossy(),
            stats
        );
        Ok(stats)
    }

    /// Check the files of a period and add up their counters.
    pub fn scan_files(&self, paths: &[impl AsRef<Path>]) -> Result<ParseStats, EtlError> {
        let mut stats = ParseStats::default();
        for path in paths {
            stats.add(&self.for_each_record(path.as_ref(), |_| Ok(()))?);
        }
        Ok(stats)
    }
}
