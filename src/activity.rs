use crate::api::{Clock, RetryPolicy, SpendingApi};
use crate::data::{ProgramActivity, Warning};
use chrono::{DateTime, Datelike, Utc};
use std::ops::Range;
use tracing::{info, warn};

/// The first fiscal year the summary endpoint has data for.
pub const FIRST_FISCAL_YEAR: i32 = 2017;

/// Federal fiscal years start on October 1st of the previous calendar year.
pub fn current_fiscal_year(at: DateTime<Utc>) -> i32 {
    if at.month() >= 10 {
        at.year() + 1
    } else {
        at.year()
    }
}

/// `first` up to and including the fiscal year running at `at`.
pub fn fiscal_years(first: i32, at: DateTime<Utc>) -> Range<i32> {
    first..current_fiscal_year(at) + 1
}

#[derive(Debug, Default)]
pub struct ActivityOutcome {
    pub activity: ProgramActivity,
    pub warnings: Vec<Warning>,
}

/// One summary request per fiscal year. A year that fails is left out of the
/// document and reported; the other years go on.
pub async fn fetch_program_activity(
    api: &dyn SpendingApi,
    clock: &dyn Clock,
    retry: RetryPolicy,
    tas: &str,
    years: Range<i32>,
) -> ActivityOutcome {
    let mut out = ActivityOutcome::default();
    for fiscal_year in years {
        let result = retry
            .run(clock, "program activity", move || api.program_activity(tas, fiscal_year))
            .await;
        match result {
            Ok(year) => {
                info!(fiscal_year, categories = year.entries().len(), "Program activity fetched");
                out.activity.insert(fiscal_year.to_string(), year);
            }
            Err(e) => {
                warn!(tas = %tas, fiscal_year, error = %e, "Program activity fetch failed");
                out.warnings.push(Warning::new(fiscal_year.to_string(), &e));
            }
        }
    }
    out
}
