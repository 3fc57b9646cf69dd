use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use nexrad_dl::models::DEFAULT_PRODUCT;
use nexrad_dl::{DEFAULT_CONCURRENCY, FetcherConfig, SourceQuery};

/// Output directory used with `--url` when none is given.
const DEFAULT_URL_OUTPUT: &str = "downloads";

#[derive(Parser, Debug)]
#[command(name = "nexrad-dl")]
#[command(author, version, about = "Download a day of NEXRAD archive files", long_about = None)]
pub struct Args {
    /// Radar site id (e.g., KHTX); prompted for when missing
    #[arg(long)]
    pub radar: Option<String>,

    /// Year (e.g., 2025); prompted for when missing
    #[arg(long)]
    pub year: Option<String>,

    /// Month (e.g., 03); prompted for when missing
    #[arg(long)]
    pub month: Option<String>,

    /// Day of month (e.g., 15); prompted for when missing
    #[arg(long)]
    pub day: Option<String>,

    /// Product code on the inventory page
    #[arg(long, default_value = DEFAULT_PRODUCT)]
    pub product: String,

    /// Inventory page URL to scrape instead of building one from the query
    #[arg(long, conflicts_with_all = ["radar", "year", "month", "day"])]
    pub url: Option<String>,

    /// Output directory (default: RADAR_YYYY_MM_DD)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Number of parallel downloads
    #[arg(short, long, default_value_t = DEFAULT_CONCURRENCY as u16, value_parser = clap::value_parser!(u16).range(1..))]
    pub concurrency: u16,

    /// Per-request timeout in seconds
    #[arg(long, default_value = "300")]
    pub timeout: u64,

    /// HTTP proxy (e.g., http://127.0.0.1:7890)
    #[arg(long)]
    pub proxy: Option<String>,

    /// Download each distinct link once
    #[arg(long)]
    pub dedup: bool,

    /// Print the final report as JSON
    #[arg(long)]
    pub json: bool,

    /// Increase log verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only print errors and hide the progress bar
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

/// Where to scrape links from and where to put the files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub source_url: String,
    pub output_dir: PathBuf,
}

impl Args {
    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            "error"
        } else {
            match self.verbose {
                0 => "info",
                1 => "debug",
                _ => "trace",
            }
        }
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            timeout: Duration::from_secs(self.timeout),
            proxy: self.proxy.clone(),
            ..FetcherConfig::default()
        }
    }

    /// Prompts go to stderr when stdout carries the JSON report.
    pub fn prompts_to_stderr(&self) -> bool {
        self.json
    }

    /// Resolves the page URL and output directory, prompting on `input` for
    /// any query field not given on the command line.
    pub fn resolve_target<R: BufRead, W: Write>(&self, input: &mut R, output: &mut W) -> Result<Target> {
        if let Some(url) = &self.url {
            return Ok(Target {
                source_url: url.clone(),
                output_dir: self
                    .output
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_URL_OUTPUT)),
            });
        }

        let radar = field(&self.radar, "Enter radar site (KHTX): ", input, output)?;
        let month = field(&self.month, "Enter month (03): ", input, output)?;
        let day = field(&self.day, "Enter day (15): ", input, output)?;
        let year = field(&self.year, "Enter year (2025): ", input, output)?;

        let query = SourceQuery::new(&radar, &year, &month, &day)?.with_product(self.product.as_str());

        Ok(Target {
            source_url: query.build_source_url(),
            output_dir: self
                .output
                .clone()
                .unwrap_or_else(|| PathBuf::from(query.output_dir_name())),
        })
    }
}

fn field<R: BufRead, W: Write>(
    given: &Option<String>,
    prompt: &str,
    input: &mut R,
    output: &mut W,
) -> Result<String> {
    if let Some(value) = given {
        return Ok(value.clone());
    }

    write!(output, "{prompt}")?;
    output.flush()?;

    let mut line = String::new();
    let read = input.read_line(&mut line).context("Failed to read from stdin")?;
    if read == 0 {
        return Err(anyhow!("Input ended before all query fields were given"));
    }
    Ok(line.trim().to_string())
}
