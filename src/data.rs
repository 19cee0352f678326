use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Key of every award in the API: the "generated internal id"
/// (`ASST_NON_...`, `CONT_AWD_...`), not the human facing award id.
pub type AwardId = String;

/// Program activity summaries keyed by fiscal year (`"2023"`).
pub type ProgramActivity = BTreeMap<String, YearActivity>;

/// Award records as persisted by the search stage, sorted by id.
pub type AwardStore = BTreeMap<AwardId, AwardRecord>;

/// Crate-wide error type. The first variants follow the way failures are
/// handled by the pipeline: transport errors are retried, a rate limit
/// triggers a cooldown, everything else is fatal for the request that
/// produced it (but never for the whole run).
#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Rate limited by provider")]
    RateLimited,
    #[error("Malformed value: {0}")]
    Format(String),
    #[error("Unexpected response shape: {0}")]
    Schema(String),
    #[error("Unknown program activity category {0}")]
    UnknownCategory(u8),
    #[error("Cannot map program activity category named {0:?}")]
    UnknownCategoryName(String),
    #[error("Download of {award_id} timed out after {elapsed:?}")]
    Timeout { award_id: AwardId, elapsed: Duration },
    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Only network level failures are worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

/// A partial result: something identified by `key` (a fiscal year, an award
/// id) failed while the rest of the stage went on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub key: String,
    pub message: String,
}

impl Warning {
    pub fn new(key: impl Into<String>, message: impl ToString) -> Self {
        Self {
            key: key.into(),
            message: message.to_string(),
        }
    }
}

/// The award type groups of the search API. Every group is searched with its
/// own type codes and its own field list since some fields only exist for
/// some award types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AwardTypeGroup {
    Contracts,
    Idvs,
    Loans,
    Grants,
    DirectPayments,
    Other,
}

const BASE_FIELDS: &[&str] = &[
    "generated_internal_id",
    "prime_award_recipient_id",
    "def_codes",
    "Award ID",
    "Recipient Name",
    "Recipient DUNS Number",
    "recipient_id",
    "Base Obligation Date",
    "Recipient Location",
    "Awarding Agency",
    "Awarding Agency Code",
    "Awarding Sub Agency",
    "Awarding Sub Agency Code",
    "Award Type",
    "Funding Agency",
    "Funding Agency Code",
    "Funding Sub Agency",
    "Funding Sub Agency Code",
    "Description",
];

const ASSISTANCE_FIELDS: &[&str] = &[
    "Start Date",
    "End Date",
    "Award Amount",
    "Total Outlays",
    "SAI Number",
    "CFDA Number",
    "Assistance Listings",
    "primary_assistance_listing",
];

impl AwardTypeGroup {
    pub const ALL: [AwardTypeGroup; 6] = [
        AwardTypeGroup::Contracts,
        AwardTypeGroup::Idvs,
        AwardTypeGroup::Loans,
        AwardTypeGroup::Grants,
        AwardTypeGroup::DirectPayments,
        AwardTypeGroup::Other,
    ];

    pub fn label(self) -> &'static str {
        match self {
            AwardTypeGroup::Contracts => "contracts",
            AwardTypeGroup::Idvs => "idvs",
            AwardTypeGroup::Loans => "loans",
            AwardTypeGroup::Grants => "grants",
            AwardTypeGroup::DirectPayments => "direct_payments",
            AwardTypeGroup::Other => "other",
        }
    }

    pub fn award_type_codes(self) -> &'static [&'static str] {
        match self {
            AwardTypeGroup::Contracts => &["A", "B", "C", "D"],
            AwardTypeGroup::Idvs => &[
                "IDV_A", "IDV_B", "IDV_B_A", "IDV_B_B", "IDV_B_C", "IDV_C", "IDV_D", "IDV_E",
            ],
            AwardTypeGroup::Loans => &["07", "08"],
            AwardTypeGroup::Grants => &["02", "03", "04", "05"],
            AwardTypeGroup::DirectPayments => &["06", "10"],
            AwardTypeGroup::Other => &["09", "11", "-1"],
        }
    }

    /// Requested search fields: the shared base list followed by the group extras.
    pub fn fields(self) -> Vec<&'static str> {
        let extras: &[&str] = match self {
            AwardTypeGroup::Contracts => &[
                "Start Date",
                "End Date",
                "Award Amount",
                "Total Outlays",
                "Contract Award Type",
            ],
            AwardTypeGroup::Idvs => &[
                "Start Date",
                "Award Amount",
                "Total Outlays",
                "Contract Award Type",
                "Last Date to Order",
                "NAICS",
                "PSC",
            ],
            AwardTypeGroup::Loans => &[
                "Issued Date",
                "Loan Value",
                "Subsidy Cost",
                "SAI Number",
                "CFDA Number",
                "Assistance Listings",
                "primary_assistance_listing",
            ],
            AwardTypeGroup::Grants | AwardTypeGroup::DirectPayments | AwardTypeGroup::Other => {
                ASSISTANCE_FIELDS
            }
        };
        BASE_FIELDS.iter().chain(extras).copied().collect()
    }

    /// Path segment of the bulk download endpoint serving this group.
    pub fn download_kind(self) -> &'static str {
        match self {
            AwardTypeGroup::Contracts => "contract",
            AwardTypeGroup::Idvs => "idv",
            _ => "assistance",
        }
    }
}

/// One award as returned by the search API. The id and the group are always
/// present; the other fields depend on the group and are kept as returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwardRecord {
    pub generated_internal_id: AwardId,
    pub award_type_group: AwardTypeGroup,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl AwardRecord {
    /// Build a record from a raw search row; the row must carry a string
    /// `generated_internal_id`.
    pub fn from_row(group: AwardTypeGroup, mut row: Map<String, Value>) -> Result<Self, Error> {
        let id = match row.remove("generated_internal_id") {
            Some(Value::String(id)) if !id.is_empty() => id,
            other => {
                return Err(Error::Schema(format!(
                    "search row without generated_internal_id (got {other:?})"
                )))
            }
        };
        row.remove("award_type_group");
        Ok(Self {
            generated_internal_id: id,
            award_type_group: group,
            fields: row,
        })
    }

    /// Headline amount: loans report a loan value instead of an award amount.
    pub fn amount(&self) -> Option<Decimal> {
        let key = match self.award_type_group {
            AwardTypeGroup::Loans => "Loan Value",
            _ => "Award Amount",
        };
        match self.fields.get(key)? {
            Value::Number(n) => n.to_string().parse().ok(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn start_date(&self) -> Option<&str> {
        let key = match self.award_type_group {
            AwardTypeGroup::Loans => "Issued Date",
            _ => "Start Date",
        };
        self.fields.get(key)?.as_str()
    }
}

/// A category of the program activity summary, with its sub categories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryEntry {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(with = "rust_decimal::serde::float")]
    pub obligated_amount: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub gross_outlay_amount: Decimal,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<CategoryChild>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryChild {
    pub name: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub obligated_amount: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub gross_outlay_amount: Decimal,
}

/// Summary of one fiscal year. The API answers a year without data either
/// with an empty list or with an empty object; both are kept as they came.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum YearActivity {
    Entries(Vec<CategoryEntry>),
    NoData(NoData),
}

/// The `{}` answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NoData {}

impl YearActivity {
    pub fn entries(&self) -> &[CategoryEntry] {
        match self {
            YearActivity::Entries(entries) => entries,
            YearActivity::NoData(_) => &[],
        }
    }
}

/// A delimited table: a header row and string cells, one `Vec` per row.
/// Award extracts are wide (around 80 columns) and their schema drifts
/// between files, so cells are kept verbatim and looked up by header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn column(&self, name: &str) -> Result<usize, Error> {
        self.headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| Error::Schema(format!("missing column {name:?}")))
    }
}

/// The amounts of one combined funding row the reconciliation needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerEntry {
    pub fiscal_year: i32,
    pub pa_code: u8,
    pub obligated: Decimal,
    pub outlay: Decimal,
}

/// Where an award ended up after the download stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AwardOutcome {
    /// Extracted during this run.
    Extracted { at: DateTime<Utc> },
    /// Extraction from an earlier run is still fresh.
    Fresh { at: DateTime<Utc> },
    Failed { reason: String },
}

impl AwardOutcome {
    pub fn is_available(&self) -> bool {
        !matches!(self, AwardOutcome::Failed { .. })
    }
}
