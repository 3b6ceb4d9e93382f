use std::{
    collections::HashMap,
    fmt, fs,
    path::{Path, PathBuf},
};

use duckdb::{params, Connection, OptionalExt};
use itertools::Itertools;
use jiff::Zoned;
use lazy_static::lazy_static;
use log::info;
use regex::Regex;
use serde::Serialize;
use url::Url;

use crate::{
    error::EtlError,
    etl::{
        fetch::write_atomically,
        parse::RecordParser,
        period::SourcePeriod,
        Dataset,
    },
};

pub const LISTING_URL: &str = "https://datosabiertos.mineduc.cl/titulados-en-educacion-superior/";

/// Generic career name of each graduate.
pub const CAREER_COLUMN: &str = "area_carrera_generica_n";

lazy_static! {
    static ref TECHNICAL: Regex = Regex::new(r"(?i)\b(?:técnico|analista)\b").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CareerKind {
    #[serde(rename = "Técnica")]
    Tecnica,
    #[serde(rename = "Profesional")]
    Profesional,
}

impl CareerKind {
    pub fn classify(career: &str) -> CareerKind {
        if TECHNICAL.is_match(career) {
            CareerKind::Tecnica
        } else {
            CareerKind::Profesional
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CareerKind::Tecnica => "Técnica",
            CareerKind::Profesional => "Profesional",
        }
    }
}

impl fmt::Display for CareerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Number of graduates of one career in a year.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CareerCount {
    #[serde(rename = "Carrera")]
    pub career: String,
    #[serde(rename = "Cantidad")]
    pub count: usize,
    #[serde(rename = "Tipo")]
    pub kind: CareerKind,
}

/// Graduates per career in the files of a period, sorted by career name.
/// Rows without a career are not counted.
pub fn count_by_career(
    parser: &RecordParser,
    files: &[impl AsRef<Path>],
) -> Result<Vec<CareerCount>, EtlError> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for file in files {
        parser.for_each_record(file.as_ref(), |record| {
            match record.get(CAREER_COLUMN) {
                Some(career) if !career.is_empty() => match counts.get_mut(career) {
                    Some(n) => *n += 1,
                    None => {
                        counts.insert(career.to_string(), 1);
                    }
                },
                _ => {}
            }
            Ok(())
        })?;
    }
    let out = counts
        .into_iter()
        .sorted_by(|a, b| a.0.cmp(&b.0))
        .map(|(career, count)| CareerCount {
            kind: CareerKind::classify(&career),
            career,
            count,
        })
        .collect();
    Ok(out)
}

/// Graduates of higher education, stored as yearly counts per career.
#[derive(Debug, Clone)]
pub struct GraduatedStudentsArchive {
    pub listing_url: Url,
    pub output_dir: PathBuf,
}

impl GraduatedStudentsArchive {
    pub fn new(output_dir: impl Into<PathBuf>) -> Result<GraduatedStudentsArchive, EtlError> {
        let listing_url = Url::parse(LISTING_URL)
            .map_err(|e| EtlError::Config(format!("bad listing url {}: {}", LISTING_URL, e)))?;
        Ok(GraduatedStudentsArchive {
            listing_url,
            output_dir: output_dir.into(),
        })
    }

    /// Path of the summary file of a year.
    pub fn filename(&self, year: i32) -> PathBuf {
        self.output_dir.join(format!("graduated_{}.csv", year))
    }

    /// Id of the career, inserting it if it's new.
    fn career_id(&self, conn: &Connection, career: &CareerCount) -> Result<i64, EtlError> {
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM carreras WHERE nombre = ?",
                params![career.career],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(id);
        }
        let id: i64 = conn.query_row("SELECT COALESCE(MAX(id), 0) + 1 FROM carreras", [], |row| {
            row.get(0)
        })?;
        conn.execute(
            "INSERT INTO carreras (id, nombre, tipo) VALUES (?, ?, ?)",
            params![id, career.career, career.kind.as_str()],
        )?;
        info!("new career {} ({})", career.career, career.kind);
        Ok(id)
    }
}

impl Dataset for GraduatedStudentsArchive {
    fn job_name(&self) -> &str {
        "graduated_job"
    }

    fn listing_url(&self) -> &Url {
        &self.listing_url
    }

    fn parser(&self) -> RecordParser {
        RecordParser::new(b';', &[CAREER_COLUMN])
    }

    fn setup(&self, conn: &Connection) -> Result<(), EtlError> {
        conn.execute_batch(
            r"
CREATE TABLE IF NOT EXISTS carreras (
    id INTEGER PRIMARY KEY,
    nombre VARCHAR(255) NOT NULL UNIQUE,
    tipo VARCHAR(50) NOT NULL
);
CREATE TABLE IF NOT EXISTS titulados_carrera (
    id INTEGER PRIMARY KEY,
    id_carrera INTEGER NOT NULL REFERENCES carreras(id),
    cantidad_titulados INTEGER NOT NULL,
    fecha_ejecucion TIMESTAMP NOT NULL,
    anno INTEGER NOT NULL
);",
        )?;
        Ok(())
    }

    fn insert(
        &self,
        conn: &Connection,
        files: &[PathBuf],
        period: &SourcePeriod,
    ) -> Result<usize, EtlError> {
        let counts = count_by_career(&self.parser(), files)?;
        let executed_at = Zoned::now().strftime("%Y-%m-%d %H:%M:%S").to_string();
        let mut n = 0;
        for career in &counts {
            let id_career = self.career_id(conn, career)?;
            n += conn.execute(
                r"
INSERT INTO titulados_carrera (id, id_carrera, cantidad_titulados, fecha_ejecucion, anno)
SELECT COALESCE(MAX(id), 0) + 1, ?, ?, ?::TIMESTAMP, ? FROM titulados_carrera",
                params![id_career, career.count as i64, executed_at, period.year],
            )?;
            info!(
                "{} graduates in {} ({}) for {}",
                career.count, career.career, career.kind, period.year
            );
        }
        info!("inserted {} rows into titulados_carrera", n);
        Ok(n)
    }

    fn write_summary(
        &self,
        files: &[PathBuf],
        period: &SourcePeriod,
    ) -> Result<Option<PathBuf>, EtlError> {
        fs::create_dir_all(&self.output_dir)?;
        let path = self.filename(period.year);
        let counts = count_by_career(&self.parser(), files)?;
        write_atomically(&path, |out| {
            let mut wtr = csv::Writer::from_writer(out);
            for career in &counts {
                wtr.serialize(career)?;
            }
            wtr.flush()?;
            Ok(counts.len() as u64)
        })?;
        info!("wrote summary of {} careers to {}", counts.len(), path.display());
        Ok(Some(path))
    }
}
