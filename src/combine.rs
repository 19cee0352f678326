//! Combine every extracted award into TAS-wide tables.
//!
//! The funding tables are filtered to the TAS of the run and get derived
//! columns; the sub-award and transaction history tables carry no TAS and
//! are only concatenated.

use crate::data::{AwardId, Error, LedgerEntry, Table, Warning};
use crate::layout::Layout;
use crate::period::{category_title, object_class_to_category, parse_submission_period, SubmissionPeriod};
use crate::read::{parse_amount, read_table};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const FUNDING: &str = "FederalAccountFunding";
pub const SUB_AWARDS: &str = "Sub-Awards";
pub const TRANSACTIONS: &str = "TransactionHistory";

const TAS_COLUMN: &str = "treasury_account_symbol";
const PERIOD_COLUMN: &str = "submission_period";
const OBJECT_CLASS_COLUMN: &str = "object_class_code";
const OBLIGATED_COLUMN: &str = "transaction_obligated_amount";
const CUMULATIVE_OUTLAY_COLUMN: &str = "gross_outlay_amount_FYB_to_period_end";

pub const DERIVED_COLUMNS: [&str; 5] = [
    "fiscal_year",
    "fiscal_period",
    "pa_code",
    "pa_title",
    "transaction_outlay_amount",
];

/// A funding row of one award, filtered and derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundingRow {
    pub period: SubmissionPeriod,
    pub entry: LedgerEntry,
    /// Source cells followed by the derived ones.
    pub cells: Vec<String>,
}

#[derive(Debug, Default)]
pub struct CombineOutcome {
    pub funding: Table,
    pub ledger: Vec<LedgerEntry>,
    pub sub_awards: Table,
    pub transactions: Table,
    pub warnings: Vec<Warning>,
}

/// Keep the rows of `table` booked on `tas`, ordered by fiscal year and
/// period, and derive the per-period outlay from the cumulative one.
///
/// `table` holds every funding row of one award. The cumulative column
/// (`gross_outlay_amount_FYB_to_period_end`) runs from the beginning of the
/// fiscal year, so the first period of a year keeps it as is. In a later
/// period the first row subtracts the cumulative total of the period before,
/// and any further row of the same period keeps its own value; the period
/// then sums to its total minus the previous one.
pub fn derive_funding(table: &Table, tas: &str) -> Result<Vec<FundingRow>, Error> {
    let tas_col = table.column(TAS_COLUMN)?;
    let period_col = table.column(PERIOD_COLUMN)?;
    let class_col = table.column(OBJECT_CLASS_COLUMN)?;
    let obligated_col = table.column(OBLIGATED_COLUMN)?;
    let outlay_col = table.column(CUMULATIVE_OUTLAY_COLUMN)?;

    let mut rows = Vec::new();
    for cells in table.rows.iter().filter(|row| row[tas_col] == tas) {
        let period = parse_submission_period(&cells[period_col])?;
        let pa_code = object_class_to_category(&cells[class_col]);
        category_title(pa_code)?;
        let cumulative = parse_amount(&cells[outlay_col])?;
        rows.push((period, pa_code, cumulative, cells));
    }
    rows.sort_by_key(|(period, _, _, _)| *period);

    // (fiscal year, cumulative total) of the last period seen
    let mut before: Option<(i32, Decimal)> = None;
    let mut current: Option<(SubmissionPeriod, Decimal)> = None;
    let mut out = Vec::with_capacity(rows.len());
    for (period, pa_code, cumulative, cells) in rows {
        let first_of_period = match current {
            Some((seen, total)) if seen == period => {
                current = Some((seen, total + cumulative));
                false
            }
            _ => {
                if let Some((seen, total)) = current {
                    before = Some((seen.fiscal_year, total));
                }
                current = Some((period, cumulative));
                true
            }
        };
        let outlay = match before {
            Some((year, total)) if first_of_period && year == period.fiscal_year => cumulative - total,
            _ => cumulative,
        };
        let entry = LedgerEntry {
            fiscal_year: period.fiscal_year,
            pa_code,
            obligated: parse_amount(&cells[obligated_col])?,
            outlay,
        };
        let mut cells = cells.clone();
        cells.extend([
            period.fiscal_year.to_string(),
            period.fiscal_period.to_string(),
            pa_code.to_string(),
            category_title(pa_code)?.to_string(),
            outlay.to_string(),
        ]);
        out.push(FundingRow {
            period,
            entry,
            cells,
        });
    }
    Ok(out)
}

/// Files of one kind in an extracted award, e.g. `..._FederalAccountFunding_1.csv`.
pub fn find_tables(dir: &Path, tag: &str) -> Vec<PathBuf> {
    let suffix = format!("{tag}_");
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            let name = entry.file_name().to_string_lossy();
            name.strip_suffix(".csv")
                .and_then(|stem| stem.rsplit_once(&suffix))
                .map_or(false, |(_, n)| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        })
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

fn read_tables(dir: &Path, tag: &str) -> Result<Vec<Table>, Error> {
    find_tables(dir, tag)
        .into_iter()
        .map(|path| read_table(File::open(path)?))
        .collect()
}

/// Union of headers in first-seen order; a table lacking a column gets
/// empty cells for it.
struct Concat {
    headers: Vec<String>,
    index: HashMap<String, usize>,
}

impl Concat {
    fn new() -> Self {
        Self {
            headers: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn layout(&mut self, headers: &[String]) -> Vec<usize> {
        headers
            .iter()
            .map(|h| {
                *self.index.entry(h.clone()).or_insert_with(|| {
                    self.headers.push(h.clone());
                    self.headers.len() - 1
                })
            })
            .collect()
    }

    fn finish(&self, rows: impl IntoIterator<Item = (Vec<usize>, Vec<String>)>) -> Table {
        let width = self.headers.len();
        let rows = rows
            .into_iter()
            .map(|(positions, cells)| {
                let mut row = vec![String::new(); width];
                for (pos, cell) in positions.into_iter().zip(cells) {
                    row[pos] = cell;
                }
                row
            })
            .collect();
        Table {
            headers: self.headers.clone(),
            rows,
        }
    }
}

fn concat_all(tables: &[Table]) -> Table {
    let mut concat = Concat::new();
    let mut rows = Vec::new();
    for table in tables {
        let positions = concat.layout(&table.headers);
        rows.extend(table.rows.iter().map(|row| (positions.clone(), row.clone())));
    }
    concat.finish(rows)
}

/// Concatenate tables and drop exact duplicate rows, keeping the first.
pub fn concat_distinct(tables: &[Table]) -> Table {
    let mut table = concat_all(tables);
    let mut seen = HashSet::new();
    table.rows.retain(|row| seen.insert(row.clone()));
    table
}

/// Build the combined tables from the extracted awards. An award whose
/// tables cannot be used is left out and reported.
pub fn combine_awards(layout: &Layout, tas: &str, award_ids: &[AwardId]) -> CombineOutcome {
    let mut out = CombineOutcome::default();
    let mut concat = Concat::new();
    let mut funding = Vec::new();
    let mut sub_awards = Vec::new();
    let mut transactions = Vec::new();

    let mut award_ids = award_ids.to_vec();
    award_ids.sort();
    for award_id in &award_ids {
        let dir = layout.award_dir(award_id);
        let derived = read_tables(&dir, FUNDING).and_then(|tables| {
            if tables.is_empty() {
                return Err(Error::Schema(format!("no {FUNDING} table in {}", dir.display())));
            }
            // numbered files of one award are one table
            let table = concat_all(&tables);
            let mut headers = table.headers.clone();
            headers.extend(DERIVED_COLUMNS.iter().map(|c| c.to_string()));
            Ok((headers, derive_funding(&table, tas)?))
        });
        match derived {
            Ok((headers, rows)) => {
                debug!(award_id = %award_id, rows = rows.len(), "Funding rows on TAS");
                let positions = concat.layout(&headers);
                funding.extend(rows.into_iter().map(|row| (positions.clone(), row)));
            }
            Err(e) => {
                warn!(award_id = %award_id, error = %e, "Award left out of the funding table");
                out.warnings.push(Warning::new(award_id.as_str(), &e));
            }
        }
        match read_tables(&dir, SUB_AWARDS) {
            Ok(tables) => sub_awards.extend(tables),
            Err(e) => out.warnings.push(Warning::new(award_id.as_str(), &e)),
        }
        match read_tables(&dir, TRANSACTIONS) {
            Ok(tables) => transactions.extend(tables),
            Err(e) => out.warnings.push(Warning::new(award_id.as_str(), &e)),
        }
    }

    // stable: awards keep their id order within a period
    funding.sort_by_key(|(_, row): &(Vec<usize>, FundingRow)| row.period);
    out.ledger = funding.iter().map(|(_, row)| row.entry).collect();
    out.funding = concat.finish(funding.into_iter().map(|(positions, row)| (positions, row.cells)));
    out.sub_awards = concat_distinct(&sub_awards);
    out.transactions = concat_distinct(&transactions);
    info!(
        awards = award_ids.len(),
        funding_rows = out.funding.rows.len(),
        sub_awards = out.sub_awards.rows.len(),
        transactions = out.transactions.rows.len(),
        "Awards combined"
    );
    out
}
