use std::{
    fs,
    path::{Path, PathBuf},
};

use duckdb::Connection;
use log::{error, info, warn};

use crate::{
    config::JobConfig,
    db::jobs_log,
    error::{EtlError, Stage},
    etl::{
        extract::ArchiveExtractor,
        fetch::Fetcher,
        gate::IngestGate,
        load::load_period,
        period::{discover_periods, SourcePeriod},
        Dataset,
    },
    utils::lib_duckdb::open_store,
};

/// What a run did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// (year, rows inserted) of each period ingested, in order.
    pub ingested: Vec<(i32, usize)>,
    /// Years found on the listing page that were already processed.
    pub skipped: Vec<i32>,
}

/// One invocation of a job: discover the periods, then ingest at most
/// `num_periods` of the pending ones, one after the other.
pub struct Pipeline<'a, F: Fetcher, D: Dataset> {
    config: &'a JobConfig,
    fetcher: F,
    dataset: D,
    extractor: ArchiveExtractor,
}

impl<'a, F: Fetcher, D: Dataset> Pipeline<'a, F, D> {
    pub fn new(config: &'a JobConfig, fetcher: F, dataset: D) -> Pipeline<'a, F, D> {
        Pipeline {
            config,
            fetcher,
            dataset,
            extractor: ArchiveExtractor::new(&config.extract_tool),
        }
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }

    pub fn run(&self, num_periods: usize) -> Result<RunSummary, EtlError> {
        let job_name = self.dataset.job_name();
        info!("starting {}, up to {} period(s)", job_name, num_periods);
        let mut conn = open_store(&self.config.db)?;
        self.dataset.setup(&conn)?;
        jobs_log::setup(&conn)?;

        let gate = IngestGate::new(job_name);
        let processed = gate.processed(&conn)?;

        let listing_url = self.dataset.listing_url();
        let html = self.fetcher.get_text(listing_url)?;
        let candidates = discover_periods(&html, listing_url)?;
        info!("found {} period(s) on {}", candidates.len(), listing_url);

        let skipped: Vec<i32> = candidates
            .iter()
            .map(|p| p.year)
            .filter(|year| processed.contains(year))
            .collect();
        let pending = gate.select(candidates, &processed, num_periods);
        if pending.is_empty() {
            info!("nothing to do for {}", job_name);
        }
        let ingested = self.ingest(&mut conn, pending)?;
        info!("{} done, ingested {:?}", job_name, ingested);
        Ok(RunSummary { ingested, skipped })
    }

    /// Ingest the given periods in order, stopping at the first failure.
    /// Each one is checked against the database right before it's fetched.
    pub fn ingest(
        &self,
        conn: &mut Connection,
        periods: Vec<SourcePeriod>,
    ) -> Result<Vec<(i32, usize)>, EtlError> {
        let gate = IngestGate::new(self.dataset.job_name());
        let mut out: Vec<(i32, usize)> = Vec::new();
        for period in periods {
            let pending = gate
                .check(conn, &period)
                .map_err(|e| self.failed(e.at(period.year, Stage::Gate)))?;
            if !pending {
                info!("period {} was processed by another run, skipping", period);
                continue;
            }
            let n = self
                .ingest_period(conn, &period)
                .map_err(|e| self.failed(e))?;
            out.push((period.year, n));
        }
        Ok(out)
    }

    fn ingest_period(&self, conn: &mut Connection, period: &SourcePeriod) -> Result<usize, EtlError> {
        let year = period.year;
        info!("ingesting period {}", period);
        let staging = Staging {
            archive: self.config.download_dir.join(&period.file_name),
            extract_dir: self
                .config
                .extract_dir
                .join(format!("{}_{}", self.dataset.job_name(), year)),
        };

        self.fetcher
            .download(&period.url, &staging.archive)
            .map_err(|e| e.at(year, Stage::Fetch))?;

        let files = self
            .extractor
            .extract(&staging.archive, &staging.extract_dir)
            .map_err(|e| e.at(year, Stage::Extract))?;

        let stats = self
            .dataset
            .parser()
            .scan_files(&files)
            .map_err(|e| e.at(year, Stage::Parse))?;
        if stats.rows == 0 {
            return Err(EtlError::Format(format!("no records in {}", period.file_name))
                .at(year, Stage::Parse));
        }
        info!("period {}: {}", year, stats);

        if let Some(path) = self
            .dataset
            .write_summary(&files, period)
            .map_err(|e| e.at(year, Stage::Load))?
        {
            info!("summary of period {} written to {}", year, path.display());
        }
        load_period(conn, &self.dataset, &files, period).map_err(|e| e.at(year, Stage::Load))
    }

    fn failed(&self, e: EtlError) -> EtlError {
        error!("{} failed: {}", self.dataset.job_name(), e);
        e
    }
}

/// The files of one period.  Removed when the period is done, whether it
/// succeeded or not.
struct Staging {
    archive: PathBuf,
    extract_dir: PathBuf,
}

impl Drop for Staging {
    fn drop(&mut self) {
        remove(&self.archive, fs::remove_file(&self.archive));
        remove(&self.extract_dir, fs::remove_dir_all(&self.extract_dir));
    }
}

fn remove(path: &Path, result: std::io::Result<()>) {
    match result {
        Ok(()) => info!("removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("could not remove {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, error::Error};

    use url::Url;

    use super::*;
    use crate::{
        config::DbLocation,
        db::mineduc::{
            enrolled_archive::{tests::enrolled_csv, EnrolledStudentsArchive},
            graduated_archive::GraduatedStudentsArchive,
        },
        etl::{extract::tests::write_zip, fetch::write_atomically},
    };

    /// Serves a listing page and copies local archives in place of downloads.
    struct FakeFetcher {
        html: String,
        archives: Vec<(Url, PathBuf)>,
        pages: Cell<usize>,
        downloads: Cell<usize>,
    }

    impl FakeFetcher {
        fn new(archives: Vec<(Url, PathBuf)>) -> FakeFetcher {
            let links: String = archives
                .iter()
                .map(|(url, _)| format!("<li><a href=\"{}\">descargar</a></li>\n", url))
                .collect();
            FakeFetcher {
                html: format!("<html><body><ul>\n{}</ul></body></html>", links),
                archives,
                pages: Cell::new(0),
                downloads: Cell::new(0),
            }
        }
    }

    impl Fetcher for FakeFetcher {
        fn get_text(&self, _url: &Url) -> Result<String, EtlError> {
            self.pages.set(self.pages.get() + 1);
            Ok(self.html.clone())
        }

        fn download(&self, url: &Url, dest: &Path) -> Result<u64, EtlError> {
            self.downloads.set(self.downloads.get() + 1);
            let (_, source) = self
                .archives
                .iter()
                .find(|(u, _)| u == url)
                .ok_or_else(|| EtlError::Network(format!("GET {} returned 404 Not Found", url)))?;
            write_atomically(dest, |out| {
                let mut file = fs::File::open(source)?;
                Ok(std::io::copy(&mut file, out)?)
            })
        }
    }

    fn config(root: &Path) -> JobConfig {
        JobConfig {
            db: DbLocation::DuckDb(root.join("db").join("jobs.duckdb")),
            extract_tool: PathBuf::from("/nonexistent/unrar"),
            download_dir: root.join("downloads"),
            extract_dir: root.join("extracted"),
            output_dir: root.join("output"),
            log_dir: root.join("logs"),
            log_filename: "jobs.log".to_string(),
        }
    }

    fn url(year: i32) -> Url {
        Url::parse(&format!(
            "https://datosabiertos.mineduc.cl/wp-content/uploads/2024/07/Matricula_Ed_Superior_{}.zip",
            year
        ))
        .unwrap()
    }

    fn count(config: &JobConfig, sql: &str) -> Result<i64, Box<dyn Error>> {
        let conn = open_store(&config.db)?;
        let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
        Ok(n)
    }

    #[test]
    fn ingest_new_period_then_repeat() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let config = config(dir.path());
        let archive = dir.path().join("Matricula_2024.zip");
        let csv = enrolled_csv(100);
        write_zip(&archive, &[("Matricula_2024/matricula_2024.csv", csv.as_str())])?;
        let fetcher = FakeFetcher::new(vec![(url(2024), archive)]);

        let pipeline = Pipeline::new(&config, &fetcher, EnrolledStudentsArchive::new()?);
        let summary = pipeline.run(1)?;
        assert_eq!(summary.ingested, vec![(2024, 100)]);
        assert_eq!(fetcher.downloads.get(), 1);
        assert_eq!(count(&config, "SELECT COUNT(*) FROM registro_matriculas")?, 100);
        assert_eq!(
            count(&config, "SELECT COUNT(*) FROM jobs_log WHERE job_name = 'enrolled_job' AND period = 2024")?,
            1
        );

        // the same invocation again
        let summary = pipeline.run(1)?;
        assert!(summary.ingested.is_empty());
        assert_eq!(summary.skipped, vec![2024]);
        assert_eq!(fetcher.downloads.get(), 1);
        assert_eq!(count(&config, "SELECT COUNT(*) FROM registro_matriculas")?, 100);
        assert_eq!(count(&config, "SELECT COUNT(*) FROM jobs_log")?, 1);
        Ok(())
    }

    #[test]
    fn period_split_over_several_files() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let config = config(dir.path());
        let archive = dir.path().join("Matricula_2024.zip");
        let first = enrolled_csv(60);
        let second = enrolled_csv(40);
        write_zip(
            &archive,
            &[
                ("Matricula_2024/matricula_2024_1.csv", first.as_str()),
                ("Matricula_2024/resto/matricula_2024_2.csv", second.as_str()),
                ("Matricula_2024/LEEME.txt", "not data"),
            ],
        )?;
        let fetcher = FakeFetcher::new(vec![(url(2024), archive)]);

        let pipeline = Pipeline::new(&config, &fetcher, EnrolledStudentsArchive::new()?);
        let summary = pipeline.run(1)?;
        assert_eq!(summary.ingested, vec![(2024, 100)]);
        assert_eq!(count(&config, "SELECT COUNT(*) FROM registro_matriculas WHERE year = 2024")?, 100);
        assert_eq!(count(&config, "SELECT COUNT(DISTINCT mrun) FROM registro_matriculas")?, 60);
        assert_eq!(count(&config, "SELECT COUNT(*) FROM jobs_log")?, 1);
        Ok(())
    }

    #[test]
    fn processed_period_is_not_fetched() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let config = config(dir.path());
        let fetcher = FakeFetcher::new(vec![]);
        let pipeline = Pipeline::new(&config, &fetcher, EnrolledStudentsArchive::new()?);

        let mut conn = open_store(&config.db)?;
        pipeline.dataset().setup(&conn)?;
        jobs_log::setup(&conn)?;
        let period = SourcePeriod::new(2024, url(2024));
        jobs_log::mark_processed(&conn, "enrolled_job", &period)?;

        let ingested = pipeline.ingest(&mut conn, vec![period])?;
        assert!(ingested.is_empty());
        assert_eq!(fetcher.downloads.get(), 0);
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM registro_matriculas", [], |row| row.get(0))?;
        assert_eq!(n, 0);
        Ok(())
    }

    #[test]
    fn renamed_column_stops_at_the_parser() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let config = config(dir.path());
        let archive = dir.path().join("Matricula_2024.zip");
        let csv = enrolled_csv(10).replacen("nomb_carrera", "nombre_carrera", 1);
        write_zip(&archive, &[("matricula_2024.csv", csv.as_str())])?;
        let fetcher = FakeFetcher::new(vec![(url(2024), archive)]);

        let pipeline = Pipeline::new(&config, &fetcher, EnrolledStudentsArchive::new()?);
        let err = pipeline.run(1).unwrap_err();
        assert!(matches!(
            err,
            EtlError::Stage {
                period: 2024,
                stage: Stage::Parse,
                ..
            }
        ));
        assert!(matches!(err.kind(), EtlError::Schema(_)));
        assert_eq!(count(&config, "SELECT COUNT(*) FROM registro_matriculas")?, 0);
        assert_eq!(count(&config, "SELECT COUNT(*) FROM jobs_log")?, 0);
        Ok(())
    }

    #[test]
    fn corrupt_archive_writes_nothing() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let config = config(dir.path());
        let archive = dir.path().join("Matricula_2024.zip");
        fs::write(&archive, b"PK\x03\x04 truncated")?;
        let fetcher = FakeFetcher::new(vec![(url(2024), archive)]);

        let pipeline = Pipeline::new(&config, &fetcher, EnrolledStudentsArchive::new()?);
        let err = pipeline.run(1).unwrap_err();
        assert!(matches!(err.kind(), EtlError::Format(_)));
        assert_eq!(count(&config, "SELECT COUNT(*) FROM registro_matriculas")?, 0);
        assert_eq!(count(&config, "SELECT COUNT(*) FROM jobs_log")?, 0);
        // staging is cleaned up
        assert!(!config.download_dir.join("Matricula_Ed_Superior_2024.zip").exists());
        assert!(!config.extract_dir.join("enrolled_job_2024").exists());
        Ok(())
    }

    #[test]
    fn failed_download_stops_the_run() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let config = config(dir.path());
        let archive = dir.path().join("Matricula_2023.zip");
        let csv = enrolled_csv(5);
        write_zip(&archive, &[("matricula_2023.csv", csv.as_str())])?;
        // 2024 is listed first but can't be downloaded
        let mut fetcher = FakeFetcher::new(vec![(url(2023), archive)]);
        fetcher.html = format!(
            "<a href=\"{}\">2024</a><a href=\"{}\">2023</a>",
            url(2024),
            url(2023)
        );

        let pipeline = Pipeline::new(&config, &fetcher, EnrolledStudentsArchive::new()?);
        let err = pipeline.run(2).unwrap_err();
        assert!(matches!(
            err,
            EtlError::Stage {
                period: 2024,
                stage: Stage::Fetch,
                ..
            }
        ));
        assert_eq!(fetcher.downloads.get(), 1);
        assert_eq!(count(&config, "SELECT COUNT(*) FROM jobs_log")?, 0);
        Ok(())
    }

    #[test]
    fn graduated_periods_oldest_last() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let config = config(dir.path());
        let mut archives = Vec::new();
        for (year, careers) in [(2023, "Derecho\nDerecho\nAnalista Programador\n"), (2022, "Derecho\n")] {
            let path = dir.path().join(format!("Titulados_{}.zip", year));
            let csv = format!("area_carrera_generica_n\n{}", careers);
            let name = format!("titulados_{}.csv", year);
            write_zip(&path, &[(name.as_str(), csv.as_str())])?;
            let url = Url::parse(&format!("https://example.org/Titulados_Ed_Superior_{}_WEB.zip", year))?;
            archives.push((url, path));
        }
        let fetcher = FakeFetcher::new(archives);
        let pipeline = Pipeline::new(
            &config,
            &fetcher,
            GraduatedStudentsArchive::new(&config.output_dir)?,
        );

        let summary = pipeline.run(5)?;
        assert_eq!(summary.ingested, vec![(2023, 2), (2022, 1)]);
        assert_eq!(fetcher.pages.get(), 1);
        assert_eq!(count(&config, "SELECT COUNT(*) FROM carreras")?, 2);
        assert_eq!(count(&config, "SELECT COUNT(*) FROM titulados_carrera")?, 3);
        assert!(config.output_dir.join("graduated_2023.csv").exists());
        assert!(fs::read_dir(&config.download_dir)?.next().is_none());
        Ok(())
    }
}
