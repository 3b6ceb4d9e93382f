use std::{collections::BTreeSet, fmt::Display};

use jiff::Zoned;
use lazy_static::lazy_static;
use log::{info, warn};
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

use crate::error::EtlError;

/// Archive extensions published on the listing pages.
const ARCHIVE_EXTENSIONS: [&str; 2] = [".rar", ".zip"];

lazy_static! {
    // A standalone year, e.g. the 2023 in `20240628_Titulados_Ed_Superior_2023_WEB.rar`.
    static ref YEAR_TOKEN: Regex =
        Regex::new(r"(?:^|[^0-9])((?:19|20)[0-9]{2})(?:[^0-9]|$)").unwrap();
    static ref FOUR_DIGITS: Regex = Regex::new(r"[0-9]{4}").unwrap();
}

/// One unit of remote data: the archive published for a given year.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePeriod {
    pub year: i32,
    pub url: Url,
    pub file_name: String,
    /// When the archive link was found on the listing page.
    pub discovered_at: Zoned,
}

impl SourcePeriod {
    pub fn new(year: i32, url: Url) -> SourcePeriod {
        let file_name = file_name(&url);
        SourcePeriod {
            year,
            url,
            file_name,
            discovered_at: Zoned::now(),
        }
    }
}

impl Display for SourcePeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.year, self.file_name)
    }
}

/// Last path segment of the url, percent-decoding not applied.
pub fn file_name(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .unwrap_or("download")
        .to_string()
}

/// Get the year of the data from an archive file name.  Prefer a standalone
/// four digit year, otherwise use the first four digits in the name.
pub fn year_from_file_name(name: &str) -> Option<i32> {
    if let Some(caps) = YEAR_TOKEN.captures(name) {
        return caps[1].parse().ok();
    }
    FOUR_DIGITS.find(name).and_then(|m| m.as_str().parse().ok())
}

/// Find the archives linked from a listing page.  Relative links are resolved
/// against `page_url`.  Only the first link for each year is kept, in page
/// order.
pub fn discover_periods(html: &str, page_url: &Url) -> Result<Vec<SourcePeriod>, EtlError> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("a[href]")
        .map_err(|e| EtlError::Format(format!("bad selector: {:?}", e)))?;
    let hrefs: Vec<&str> = document
        .select(&selector)
        .filter_map(|a| a.value().attr("href"))
        .collect();
    info!("found {} links on {}", hrefs.len(), page_url);

    let mut seen: BTreeSet<i32> = BTreeSet::new();
    let mut out: Vec<SourcePeriod> = Vec::new();
    for href in hrefs {
        let href = href.trim();
        let lower = href.to_lowercase();
        if !ARCHIVE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
            continue;
        }
        let url = match page_url.join(href) {
            Ok(url) => url,
            Err(e) => {
                warn!("skipping link {}: {}", href, e);
                continue;
            }
        };
        let name = file_name(&url);
        let Some(year) = year_from_file_name(&name) else {
            warn!("could not get the year from file name {}, skipping", name);
            continue;
        };
        if seen.insert(year) {
            out.push(SourcePeriod::new(year, url));
        } else {
            warn!("another archive for year {} already listed, skipping {}", year, name);
        }
    }
    info!("found {} archives on {}", out.len(), page_url);
    Ok(out)
}
