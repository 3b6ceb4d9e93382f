//! Startup shared by the job binaries.

use std::{error::Error, path::Path, time::Duration};

use log::{error, info};

use crate::{
    config::JobConfig,
    error::EtlError,
    etl::{
        fetch::HttpFetcher,
        pipeline::{Pipeline, RunSummary},
        Dataset,
    },
    utils::logging,
};

/// Load `.env/{env}.env` if an environment name is given, `.env` otherwise.
/// Variables already set in the process win.
pub fn load_env(env: Option<&str>) -> Result<(), Box<dyn Error>> {
    match env {
        Some(env) => load_env_file(Path::new(&format!(".env/{}.env", env)), true),
        // cron may set the variables instead
        None => load_env_file(Path::new(".env"), false),
    }
}

/// Load an env file.  A missing file is only an error if `required`, a file
/// that can't be parsed always is.
pub fn load_env_file(path: &Path, required: bool) -> Result<(), Box<dyn Error>> {
    match dotenvy::from_path(path) {
        Ok(()) => Ok(()),
        Err(e) if e.not_found() && !required => Ok(()),
        Err(e) => Err(format!("cannot load {}: {}", path.display(), e).into()),
    }
}

/// Read the configuration, start logging and run the pipeline of the
/// dataset built by `make_dataset`, over HTTP.
pub fn run<D, M>(make_dataset: M, num_files: usize) -> Result<RunSummary, Box<dyn Error>>
where
    D: Dataset,
    M: FnOnce(&JobConfig) -> Result<D, EtlError>,
{
    let config = match JobConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            logging::init_console();
            error!("{}", e);
            return Err(e.into());
        }
    };
    logging::init(&config.log_dir, &config.log_filename)?;
    info!("configuration: {:?}", config);

    let dataset = make_dataset(&config)?;
    let fetcher = HttpFetcher::new(Duration::from_secs(600))?;
    let summary = Pipeline::new(&config, fetcher, dataset).run(num_files)?;
    info!(
        "ingested {} period(s), {} already processed",
        summary.ingested.len(),
        summary.skipped.len()
    );
    Ok(summary)
}
