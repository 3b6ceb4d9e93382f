use std::error::Error;

use clap::Parser;
use vocational_jobs::{db::mineduc::graduated_archive::GraduatedStudentsArchive, jobs};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Environment name, e.g., test, prod.  Reads `.env` if not given.
    #[arg(short, long)]
    env: Option<String>,

    /// Number of yearly files to ingest in this run
    #[arg(long, default_value_t = 1)]
    num_files: usize,
}

/// Run this job every day at 3:30AM
fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    jobs::load_env(args.env.as_deref())?;
    jobs::run(
        |config| GraduatedStudentsArchive::new(&config.output_dir),
        args.num_files,
    )?;
    Ok(())
}
