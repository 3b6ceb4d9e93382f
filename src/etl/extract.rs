use std::{
    fs::{self, File},
    io::BufReader,
    path::{Path, PathBuf},
    process::Command,
};

use glob::glob;
use log::{error, info, warn};

use crate::error::EtlError;

/// Unpacks the downloaded archives.  Zip files are read in process, anything
/// else (the published `.rar` files) goes through the external tool, called
/// as `<tool> x -o+ -y <archive> <dest>/` (unrar/WinRAR syntax).
pub struct ArchiveExtractor {
    pub tool: PathBuf,
}

impl ArchiveExtractor {
    pub fn new(tool: impl Into<PathBuf>) -> ArchiveExtractor {
        ArchiveExtractor { tool: tool.into() }
    }

    /// Extract `archive` into `dest` and return the CSV files found, sorted.
    /// `dest` is emptied first.  On failure `dest` is removed so nothing
    /// partially extracted is left behind.
    pub fn extract(&self, archive: &Path, dest: &Path) -> Result<Vec<PathBuf>, EtlError> {
        if !archive.is_file() {
            return Err(EtlError::Format(format!(
                "archive {} does not exist",
                archive.display()
            )));
        }
        if dest.exists() {
            fs::remove_dir_all(dest)?;
        }
        fs::create_dir_all(dest)?;

        info!("extracting {} to {}", archive.display(), dest.display());
        let result = self
            .unpack(archive, dest)
            .and_then(|_| find_csv_files(dest))
            .and_then(|files| {
                if files.is_empty() {
                    Err(EtlError::Format(format!(
                        "no CSV files in {}",
                        archive.display()
                    )))
                } else {
                    Ok(files)
                }
            });
        match result {
            Ok(files) => {
                info!("extracted {} CSV file(s) from {}", files.len(), archive.display());
                Ok(files)
            }
            Err(e) => {
                error!("extraction of {} failed: {}", archive.display(), e);
                if let Err(e) = fs::remove_dir_all(dest) {
                    warn!("could not clean up {}: {}", dest.display(), e);
                }
                Err(e)
            }
        }
    }

    fn unpack(&self, archive: &Path, dest: &Path) -> Result<(), EtlError> {
        let is_zip = archive
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("zip"))
            .unwrap_or(false);
        if is_zip {
            unzip(archive, dest)
        } else {
            self.run_tool(archive, dest)
        }
    }

    fn run_tool(&self, archive: &Path, dest: &Path) -> Result<(), EtlError> {
        if !is_executable(&self.tool) {
            return Err(EtlError::Format(format!(
                "extraction tool {} does not exist or is not executable",
                self.tool.display()
            )));
        }
        // unrar wants a trailing separator on the destination directory
        let mut dest_arg = dest.as_os_str().to_owned();
        dest_arg.push(std::path::MAIN_SEPARATOR_STR);
        let output = Command::new(&self.tool)
            .arg("x")
            .arg("-o+")
            .arg("-y")
            .arg(archive)
            .arg(&dest_arg)
            .output()
            .map_err(|e| {
                EtlError::Format(format!("failed to invoke {}: {}", self.tool.display(), e))
            })?;
        if !output.status.success() {
            return Err(EtlError::Format(format!(
                "{} exited with {}: {}",
                self.tool.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

fn unzip(archive: &Path, dest: &Path) -> Result<(), EtlError> {
    let reader = BufReader::new(File::open(archive)?);
    let mut zip = zip::ZipArchive::new(reader)?;
    for i in 0..zip.len() {
        let mut file = zip.by_index(i)?;
        let out_path = match file.enclosed_name() {
            Some(path) => dest.join(path),
            None => {
                warn!("skipping unsafe path {} in {}", file.name(), archive.display());
                continue;
            }
        };
        if file.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(dir) = out_path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut outfile = File::create(&out_path)?;
        std::io::copy(&mut file, &mut outfile)
            .map_err(|e| EtlError::Format(format!("corrupt entry {}: {}", file.name(), e)))?;
    }
    Ok(())
}

/// All the `.csv` files under `dir`, at any depth.
pub fn find_csv_files(dir: &Path) -> Result<Vec<PathBuf>, EtlError> {
    let pattern = format!("{}/**/*", glob::Pattern::escape(&dir.to_string_lossy()));
    let mut files: Vec<PathBuf> = glob(&pattern)
        .map_err(|e| EtlError::Format(e.to_string()))?
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .filter(|p| {
            p.extension()
                .map(|ext| ext.eq_ignore_ascii_case("csv"))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    for file in &files {
        info!("found CSV file {}", file.display());
    }
    Ok(files)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
