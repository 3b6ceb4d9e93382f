use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use log::info;
use reqwest::{
    blocking::Client,
    header::{UPGRADE_INSECURE_REQUESTS, USER_AGENT},
};
use url::Url;

use crate::error::EtlError;

/// Retrieves remote resources.  Implemented over HTTP for the jobs, and by
/// fakes in the tests.
pub trait Fetcher {
    /// Get a page as text, e.g. the listing page with the archive links.
    fn get_text(&self, url: &Url) -> Result<String, EtlError>;

    /// Download `url` into `dest`, returning the number of bytes written.
    /// `dest` only exists once the download is complete.
    fn download(&self, url: &Url, dest: &Path) -> Result<u64, EtlError>;
}

impl<T: Fetcher + ?Sized> Fetcher for &T {
    fn get_text(&self, url: &Url) -> Result<String, EtlError> {
        (**self).get_text(url)
    }

    fn download(&self, url: &Url, dest: &Path) -> Result<u64, EtlError> {
        (**self).download(url, dest)
    }
}

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<HttpFetcher, EtlError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(HttpFetcher { client })
    }

    fn get(&self, url: &Url) -> Result<reqwest::blocking::Response, EtlError> {
        let response = self
            .client
            .get(url.as_str())
            .header(USER_AGENT, "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36")
            .header(UPGRADE_INSECURE_REQUESTS, "1")
            .send()
            .map_err(|e| EtlError::Network(format!("GET {} failed: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(EtlError::Network(format!(
                "GET {} returned {}",
                url,
                response.status()
            )));
        }
        Ok(response)
    }
}

impl Fetcher for HttpFetcher {
    fn get_text(&self, url: &Url) -> Result<String, EtlError> {
        info!("accessing url {}", url);
        let body = self.get(url)?.text()?;
        Ok(body)
    }

    fn download(&self, url: &Url, dest: &Path) -> Result<u64, EtlError> {
        info!("downloading {} ...", url);
        let mut response = self.get(url)?;
        let bytes = write_atomically(dest, |out| {
            io::copy(&mut response, out)
                .map_err(|e| EtlError::Network(format!("reading body of {} failed: {}", url, e)))
        })?;
        info!("downloaded {} bytes to {}", bytes, dest.display());
        Ok(bytes)
    }
}

/// Write to `dest.part` and rename it to `dest` when `write` succeeds.  The
/// partial file is removed on failure.
pub fn write_atomically<F>(dest: &Path, write: F) -> Result<u64, EtlError>
where
    F: FnOnce(&mut File) -> Result<u64, EtlError>,
{
    if let Some(dir) = dest.parent() {
        fs::create_dir_all(dir)?;
    }
    let part = part_path(dest);
    let mut out = File::create(&part)?;
    let result = write(&mut out).and_then(|n| {
        out.sync_all()?;
        Ok(n)
    });
    drop(out);
    match result {
        Ok(n) => {
            fs::rename(&part, dest)?;
            Ok(n)
        }
        Err(e) => {
            let _ = fs::remove_file(&part);
            Err(e)
        }
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}
