use crate::data::Error;
use std::fmt;

/// Major object class buckets, indexed by the first digit of an object class code.
const CATEGORY_TITLES: &[(u8, &str)] = &[
    (0, "Unknown"),
    (1, "Personnel compensation and benefits"),
    (2, "Contractual services and supplies"),
    (3, "Acquisition of assets"),
    (4, "Grants and fixed charges"),
    (9, "Other"),
];

/// A fiscal reporting period, `P1` to `P12`. Ordering is numeric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiscalPeriod(u8);

impl FiscalPeriod {
    pub fn new(period: u8) -> Result<Self, Error> {
        if (1..=12).contains(&period) {
            Ok(Self(period))
        } else {
            Err(Error::Format(format!("fiscal period {period} out of range")))
        }
    }

    pub fn number(self) -> u8 {
        self.0
    }
}

impl fmt::Display for FiscalPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// A parsed `FYyyyyPn` submission period label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubmissionPeriod {
    pub fiscal_year: i32,
    pub fiscal_period: FiscalPeriod,
}

impl fmt::Display for SubmissionPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FY{}P{:02}", self.fiscal_year, self.fiscal_period.0)
    }
}

/// Parse a submission period label such as `FY2023P06` (or `FY2023P6`).
pub fn parse_submission_period(label: &str) -> Result<SubmissionPeriod, Error> {
    let bad = || Error::Format(format!("submission period {label:?} is not FYyyyyPn"));
    let rest = label.trim().strip_prefix("FY").ok_or_else(bad)?;
    let (year, period) = rest.split_once('P').ok_or_else(bad)?;
    if year.len() != 4 || !year.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }
    if period.is_empty() || period.len() > 2 || !period.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }
    let fiscal_year = year.parse().map_err(|_| bad())?;
    let period: u8 = period.parse().map_err(|_| bad())?;
    Ok(SubmissionPeriod {
        fiscal_year,
        fiscal_period: FiscalPeriod::new(period).map_err(|_| bad())?,
    })
}

/// The coarse category of an object class code is its leading digit; codes
/// that do not start with a digit land in bucket 0.
pub fn object_class_to_category(code: &str) -> u8 {
    code.trim()
        .chars()
        .next()
        .and_then(|c| c.to_digit(10))
        .map_or(0, |d| d as u8)
}

pub fn category_title(code: u8) -> Result<&'static str, Error> {
    CATEGORY_TITLES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, title)| *title)
        .ok_or(Error::UnknownCategory(code))
}

/// Category code of a program activity summary entry, from its name: either
/// one of the category titles, or an object class style name (`"25.2"`).
pub fn category_of_name(name: &str) -> Result<u8, Error> {
    let name = name.trim();
    if let Some((code, _)) = CATEGORY_TITLES
        .iter()
        .find(|(_, title)| title.eq_ignore_ascii_case(name))
    {
        return Ok(*code);
    }
    match name.chars().next().and_then(|c| c.to_digit(10)) {
        Some(d) => {
            category_title(d as u8)?;
            Ok(d as u8)
        }
        None => Err(Error::UnknownCategoryName(name.to_string())),
    }
}
