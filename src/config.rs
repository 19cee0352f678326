//! Run configuration: command line flags, an optional TOML file, defaults.
//!
//! Flags win over the file, the file wins over the defaults.

use crate::activity::FIRST_FISCAL_YEAR;
use crate::api::RetryPolicy;
use crate::data::Error;
use crate::download::DownloadConfig;
use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "https://api.usaspending.gov";

#[derive(Parser, Debug, Default)]
#[command(
    name = "usaspending-tas",
    version,
    about = "Award level spending of a Treasury Account Symbol, reconciled against its summary"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// TOML file with any of the settings below
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Treasury Account Symbol, e.g. 072-019-2024/2025-1031-000
    #[arg(long, env = "USASPENDING_TAS", global = true)]
    pub tas: Option<String>,

    /// Only look at these awards (repeatable)
    #[arg(long = "award-id", global = true)]
    pub award_ids: Vec<String>,

    /// Header-less CSV file whose first column lists award ids
    #[arg(long, global = true)]
    pub award_ids_file: Option<PathBuf>,

    /// Prefix of the combined tables and reports
    #[arg(long, global = true)]
    pub summary_name: Option<String>,

    #[arg(long, env = "USASPENDING_OUTPUT_DIR", global = true)]
    pub output_dir: Option<PathBuf>,

    #[arg(long, env = "USASPENDING_API_BASE", global = true)]
    pub api_base: Option<String>,

    /// Download awards again when extracted before this date (RFC 3339 or YYYY-MM-DD)
    #[arg(long, global = true)]
    pub refresh_before: Option<String>,

    #[arg(long, global = true)]
    pub first_fiscal_year: Option<i32>,

    #[arg(long, global = true)]
    pub poll_interval_secs: Option<u64>,

    #[arg(long, global = true)]
    pub rate_limit_cooldown_secs: Option<u64>,

    #[arg(long, global = true)]
    pub award_timeout_secs: Option<u64>,

    #[arg(long, global = true)]
    pub request_timeout_secs: Option<u64>,

    #[arg(long, global = true)]
    pub max_outstanding_jobs: Option<usize>,

    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Fetch the summary and search awards again even when cached
    #[arg(long, global = true)]
    pub force: bool,

    /// Debug logging for this crate
    #[arg(long, short, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Every stage, in order (the default)
    Run,
    /// Fetch the program activity summary of each fiscal year
    Activity,
    /// Search the awards booked on the TAS
    Search,
    /// Download and extract every award found
    Download,
    /// Build the combined tables from the extracted awards
    Combine,
    /// Compare the combined funding rows against the summary
    Reconcile,
}

/// Same settings as the command line, all optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub tas: Option<String>,
    #[serde(default)]
    pub award_ids: Vec<String>,
    pub award_ids_file: Option<PathBuf>,
    pub summary_name: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub api_base: Option<String>,
    pub refresh_before: Option<String>,
    pub first_fiscal_year: Option<i32>,
    pub poll_interval_secs: Option<u64>,
    pub rate_limit_cooldown_secs: Option<u64>,
    pub award_timeout_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub max_outstanding_jobs: Option<usize>,
    pub max_retries: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub force: Option<bool>,
}

impl FileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub tas: String,
    pub award_ids: Vec<String>,
    pub summary_name: Option<String>,
    pub output_dir: PathBuf,
    pub api_base: String,
    pub first_fiscal_year: i32,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub download: DownloadConfig,
    pub force: bool,
}

impl Config {
    /// Defaults for a TAS.
    pub fn new(tas: &str, output_dir: &Path) -> Self {
        let download = DownloadConfig::default();
        Self {
            tas: tas.to_string(),
            award_ids: Vec::new(),
            summary_name: None,
            output_dir: output_dir.to_path_buf(),
            api_base: DEFAULT_API_BASE.to_string(),
            first_fiscal_year: FIRST_FISCAL_YEAR,
            request_timeout: Duration::from_secs(60),
            retry: download.retry,
            download,
            force: false,
        }
    }

    pub fn resolve(cli: &Cli) -> anyhow::Result<Self> {
        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        let tas = cli
            .tas
            .clone()
            .or(file.tas)
            .context("no TAS given (--tas, USASPENDING_TAS or `tas` in the config file)")?;
        let output_dir = cli
            .output_dir
            .clone()
            .or(file.output_dir)
            .unwrap_or_else(|| PathBuf::from("data"));
        let mut config = Self::new(&tas, &output_dir);

        config.award_ids = if cli.award_ids.is_empty() {
            file.award_ids
        } else {
            cli.award_ids.clone()
        };
        if let Some(path) = cli.award_ids_file.clone().or(file.award_ids_file) {
            let file = std::fs::File::open(&path)
                .with_context(|| format!("opening award id list {}", path.display()))?;
            config.award_ids.extend(read_award_ids(file)?);
        }
        config.summary_name = cli.summary_name.clone().or(file.summary_name);
        if let Some(api_base) = cli.api_base.clone().or(file.api_base) {
            config.api_base = api_base;
        }
        if let Some(threshold) = cli.refresh_before.as_deref().or(file.refresh_before.as_deref()) {
            config.download.refresh_before = Some(parse_threshold(threshold)?);
        }
        if let Some(year) = cli.first_fiscal_year.or(file.first_fiscal_year) {
            config.first_fiscal_year = year;
        }
        let secs = |cli: Option<u64>, file: Option<u64>| cli.or(file).map(Duration::from_secs);
        if let Some(d) = secs(cli.poll_interval_secs, file.poll_interval_secs) {
            config.download.poll_interval = d;
        }
        if let Some(d) = secs(cli.rate_limit_cooldown_secs, file.rate_limit_cooldown_secs) {
            config.download.rate_limit_cooldown = d;
        }
        if let Some(d) = secs(cli.award_timeout_secs, file.award_timeout_secs) {
            config.download.award_timeout = d;
        }
        if let Some(d) = secs(cli.request_timeout_secs, file.request_timeout_secs) {
            config.request_timeout = d;
        }
        if let Some(n) = cli.max_outstanding_jobs.or(file.max_outstanding_jobs) {
            anyhow::ensure!(n > 0, "max_outstanding_jobs must be at least 1");
            config.download.max_outstanding = n;
        }
        if let Some(n) = cli.max_retries.or(file.max_retries) {
            config.retry.max_retries = n;
        }
        if let Some(ms) = file.retry_base_delay_ms {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        config.download.retry = config.retry;
        config.force = cli.force || file.force.unwrap_or(false);
        Ok(config)
    }
}

/// Freshness threshold, either a full RFC 3339 timestamp or a day (midnight UTC).
pub fn parse_threshold(text: &str) -> Result<DateTime<Utc>, Error> {
    let text = text.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Ok(at.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .map(|at| at.and_utc())
        .ok_or_else(|| Error::Format(format!("date {text:?}")))
}

/// Award ids from a one column CSV file without a header.
pub fn read_award_ids<R: std::io::Read>(reader: R) -> Result<Vec<String>, Error> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let mut ids = Vec::new();
    for record in rdr.records() {
        if let Some(id) = record?.get(0).filter(|id| !id.is_empty()) {
            ids.push(id.to_string());
        }
    }
    Ok(ids)
}
