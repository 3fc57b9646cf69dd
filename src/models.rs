use std::fmt;

use serde::Serialize;
use url::Url;

use crate::error::{DownloadError, QueryError};

/// Inventory page that lists the bulk data product links for one radar day.
pub const INVENTORY_URL: &str = "https://www.ncdc.noaa.gov/nexradinv/bdp-download.jsp";

/// Level II archive product code.
pub const DEFAULT_PRODUCT: &str = "AAL2";

/// Absolute URL of one file to retrieve.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DownloadLink(String);

impl DownloadLink {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name the file is saved under: the URL's final path segment.
    ///
    /// The segment is kept percent-encoded, so it never contains a path
    /// separator. A URL ending in `/` has no file name.
    pub fn file_name(&self) -> Result<String, DownloadError> {
        let no_name = || DownloadError::NoFileName {
            url: self.0.clone(),
        };

        let url = Url::parse(&self.0).map_err(|_| no_name())?;
        let segment = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|s| !s.is_empty() && *s != "." && *s != "..")
            .ok_or_else(no_name)?;

        Ok(segment.to_string())
    }
}

impl fmt::Display for DownloadLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for DownloadLink {
    fn from(url: String) -> Self {
        Self(url)
    }
}

impl From<&str> for DownloadLink {
    fn from(url: &str) -> Self {
        Self(url.to_string())
    }
}

/// Outcome of one download task. Exactly one is produced per link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DownloadResult {
    Saved {
        url: String,
        file_name: String,
        bytes: u64,
    },
    Failed {
        url: String,
        error: String,
    },
}

impl DownloadResult {
    pub fn failed(link: &DownloadLink, error: &DownloadError) -> Self {
        Self::Failed {
            url: link.as_str().to_string(),
            error: error.to_string(),
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Self::Saved { url, .. } | Self::Failed { url, .. } => url,
        }
    }

    pub fn file_name(&self) -> Option<&str> {
        match self {
            Self::Saved { file_name, .. } => Some(file_name),
            Self::Failed { .. } => None,
        }
    }

    pub fn is_saved(&self) -> bool {
        matches!(self, Self::Saved { .. })
    }
}

/// Every result of one batch, in no particular order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    results: Vec<DownloadResult>,
}

impl BatchOutcome {
    pub fn new(results: Vec<DownloadResult>) -> Self {
        Self { results }
    }

    pub fn into_results(self) -> Vec<DownloadResult> {
        self.results
    }

    /// Number of links attempted.
    pub fn total(&self) -> usize {
        self.results.len()
    }

    /// Names of the files that were saved. Duplicated links appear once per
    /// occurrence.
    pub fn file_names(&self) -> Vec<&str> {
        self.results.iter().filter_map(DownloadResult::file_name).collect()
    }

    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_saved()).count()
    }

    pub fn failure_count(&self) -> usize {
        self.total() - self.success_count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &DownloadResult> {
        self.results.iter().filter(|r| !r.is_saved())
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Final report printed by `--json`.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub source_url: String,
    pub output_dir: String,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<DownloadResult>,
}

impl BatchReport {
    pub fn new(source_url: impl Into<String>, output_dir: impl Into<String>, outcome: BatchOutcome) -> Self {
        Self {
            source_url: source_url.into(),
            output_dir: output_dir.into(),
            attempted: outcome.total(),
            succeeded: outcome.success_count(),
            failed: outcome.failure_count(),
            results: outcome.into_results(),
        }
    }
}

/// One radar site and day on the inventory page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceQuery {
    pub radar: String,
    pub year: String,
    pub month: String,
    pub day: String,
    pub product: String,
}

impl SourceQuery {
    /// Validates and normalizes the fields: the radar id is uppercased, month
    /// and day are zero-padded to two digits.
    pub fn new(radar: &str, year: &str, month: &str, day: &str) -> Result<Self, QueryError> {
        let radar = radar.trim();
        if radar.is_empty() || !radar.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(QueryError::Radar(radar.to_string()));
        }

        let year = year.trim();
        if year.len() != 4 || !year.chars().all(|c| c.is_ascii_digit()) {
            return Err(QueryError::Year(year.to_string()));
        }

        let month = two_digit(month, 12).ok_or_else(|| QueryError::Month(month.trim().to_string()))?;
        let day = two_digit(day, 31).ok_or_else(|| QueryError::Day(day.trim().to_string()))?;

        Ok(Self {
            radar: radar.to_ascii_uppercase(),
            year: year.to_string(),
            month,
            day,
            product: DEFAULT_PRODUCT.to_string(),
        })
    }

    pub fn with_product(mut self, product: impl Into<String>) -> Self {
        self.product = product.into();
        self
    }

    pub fn build_source_url(&self) -> String {
        format!(
            "{INVENTORY_URL}?id={}&yyyy={}&mm={}&dd={}&product={}",
            self.radar, self.year, self.month, self.day, self.product
        )
    }

    pub fn output_dir_name(&self) -> String {
        format!("{}_{}_{}_{}", self.radar, self.year, self.month, self.day)
    }
}

fn two_digit(value: &str, max: u8) -> Option<String> {
    let value = value.trim();
    if value.is_empty() || value.len() > 2 || !value.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let n: u8 = value.parse().ok()?;
    (1..=max).contains(&n).then(|| format!("{n:02}"))
}
