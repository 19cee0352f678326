use crate::{
    data::{AwardId, Error, LedgerEntry, ProgramActivity, Warning},
    period::{category_of_name, category_title},
    read::LedgerUser,
};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Obligated and outlay sums per fiscal year and category. Both sides of the
/// reconciliation are reduced to this before being compared.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Totals {
    amounts: BTreeMap<(i32, u8), (Decimal, Decimal)>,
    years: BTreeSet<i32>,
    /// Years of the summary that could not be mapped; left out of the comparison.
    excluded: BTreeSet<i32>,
}

impl Totals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum the top level categories of every fiscal year of the summary; a
    /// year without data still takes part, with zero amounts. A year with an
    /// entry that maps to no category is excluded and reported.
    pub fn from_program_activity(activity: &ProgramActivity) -> (Self, Vec<Warning>) {
        let mut totals = Self::new();
        let mut warnings = Vec::new();
        for (key, summary) in activity {
            let Ok(year) = key.parse::<i32>() else {
                warnings.push(Warning::new(key.as_str(), Error::Format(format!("fiscal year key {key:?}"))));
                continue;
            };
            let codes: Result<Vec<u8>, Error> = summary
                .entries()
                .iter()
                .map(|entry| category_of_name(&entry.name))
                .collect();
            match codes {
                Ok(codes) => {
                    totals.years.insert(year);
                    for (code, entry) in codes.into_iter().zip(summary.entries()) {
                        totals.add(year, code, entry.obligated_amount, entry.gross_outlay_amount);
                    }
                }
                Err(e) => {
                    warn!(fiscal_year = year, error = %e, "Fiscal year left out of the reconciliation");
                    totals.excluded.insert(year);
                    warnings.push(Warning::new(key.as_str(), e));
                }
            }
        }
        (totals, warnings)
    }

    pub fn add(&mut self, year: i32, code: u8, obligated: Decimal, outlay: Decimal) {
        self.years.insert(year);
        let sums = self.amounts.entry((year, code)).or_default();
        sums.0 += obligated;
        sums.1 += outlay;
    }

    fn codes(&self, year: i32) -> impl Iterator<Item = u8> + '_ {
        self.amounts
            .range((year, u8::MIN)..=(year, u8::MAX))
            .map(|((_, code), _)| *code)
    }

    fn get(&self, year: i32, code: Option<u8>) -> (Decimal, Decimal) {
        match code {
            Some(code) => self.amounts.get(&(year, code)).copied().unwrap_or_default(),
            None => self
                .amounts
                .range((year, u8::MIN)..=(year, u8::MAX))
                .fold((Decimal::ZERO, Decimal::ZERO), |acc, (_, sums)| {
                    (acc.0 + sums.0, acc.1 + sums.1)
                }),
        }
    }
}

impl LedgerUser for Totals {
    fn use_entry(&mut self, entry: LedgerEntry) -> Result<(), Error> {
        self.add(entry.fiscal_year, entry.pa_code, entry.obligated, entry.outlay);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Obligated,
    Outlay,
}

/// One line of the reconciliation: the summary amount against the sum of
/// the combined award rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Comparison {
    pub fiscal_year: i32,
    /// `None` for the "Total" line.
    pub pa_code: Option<u8>,
    pub category: String,
    pub metric: Metric,
    #[serde(with = "rust_decimal::serde::float")]
    pub program_activity: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub awards: Decimal,
    /// `program_activity - awards`; positive when awards fall short.
    #[serde(with = "rust_decimal::serde::float")]
    pub missing: Decimal,
    /// `missing / program_activity` in percent, none when the summary is zero.
    #[serde(with = "rust_decimal::serde::float_option")]
    pub percent: Option<Decimal>,
}

impl Comparison {
    fn new(
        fiscal_year: i32,
        pa_code: Option<u8>,
        metric: Metric,
        program_activity: Decimal,
        awards: Decimal,
    ) -> Result<Self, Error> {
        let category = match pa_code {
            Some(code) => category_title(code)?.to_string(),
            None => "Total".to_string(),
        };
        let missing = program_activity - awards;
        let percent = if program_activity.is_zero() {
            None
        } else {
            Some(missing / program_activity * Decimal::ONE_HUNDRED)
        };
        Ok(Self {
            fiscal_year,
            pa_code,
            category,
            metric,
            program_activity,
            awards,
            missing,
            percent,
        })
    }
}

/// The structured reconciliation; `write::render_report` turns it into text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub tas: String,
    pub comparisons: Vec<Comparison>,
    /// Awards that could not be downloaded, with the reason.
    pub failed_awards: BTreeMap<AwardId, String>,
    pub warnings: Vec<Warning>,
}

impl Reconciliation {
    pub fn get(&self, fiscal_year: i32, pa_code: Option<u8>, metric: Metric) -> Option<&Comparison> {
        self.comparisons
            .iter()
            .find(|c| c.fiscal_year == fiscal_year && c.pa_code == pa_code && c.metric == metric)
    }
}

/// Compare the summary against the awards for every fiscal year present on
/// either side: first the total, then each category found on either side.
pub(crate) fn reconcile(
    tas: &str,
    program_activity: &Totals,
    awards: &Totals,
) -> Result<Reconciliation, Error> {
    let mut comparisons = Vec::new();
    let years = program_activity
        .years
        .union(&awards.years)
        .filter(|year| !program_activity.excluded.contains(year));
    for &year in years {
        let codes: BTreeSet<u8> = program_activity.codes(year).chain(awards.codes(year)).collect();
        for code in std::iter::once(None).chain(codes.into_iter().map(Some)) {
            let reference = program_activity.get(year, code);
            let combined = awards.get(year, code);
            comparisons.push(Comparison::new(year, code, Metric::Obligated, reference.0, combined.0)?);
            comparisons.push(Comparison::new(year, code, Metric::Outlay, reference.1, combined.1)?);
        }
    }
    Ok(Reconciliation {
        tas: tas.to_string(),
        comparisons,
        ..Reconciliation::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{CategoryEntry, NoData, YearActivity};
    use rust_decimal_macros::dec;

    fn entry(name: &str, obligated: Decimal, outlay: Decimal) -> CategoryEntry {
        CategoryEntry {
            name: name.into(),
            kind: None,
            obligated_amount: obligated,
            gross_outlay_amount: outlay,
            children: vec![],
        }
    }

    fn fy2023() -> ProgramActivity {
        ProgramActivity::from([(
            "2023".to_string(),
            YearActivity::Entries(vec![
                entry("Personnel compensation and benefits", dec!(120000), dec!(100000)),
                entry("Grants and fixed charges", dec!(290000000), dec!(250000000)),
            ]),
        )])
    }

    #[test]
    fn matching_sums_leave_nothing_missing() {
        let (reference, _) = Totals::from_program_activity(&fy2023());
        let mut awards = Totals::new();
        awards.add(2023, 1, dec!(20000), dec!(100000));
        awards.add(2023, 1, dec!(100000), dec!(0));
        awards.add(2023, 4, dec!(290000000), dec!(250000000));
        let report = reconcile("TAS", &reference, &awards).unwrap();

        let total = report.get(2023, None, Metric::Obligated).unwrap();
        assert_eq!(total.program_activity, dec!(290120000));
        assert_eq!(total.awards, dec!(290120000));
        assert_eq!(total.missing, dec!(0));
        assert_eq!(total.percent, Some(dec!(0)));
        for code in [Some(1), Some(4)] {
            for metric in [Metric::Obligated, Metric::Outlay] {
                let c = report.get(2023, code, metric).unwrap();
                assert_eq!(c.missing, dec!(0));
                assert_eq!(c.percent, Some(dec!(0)));
            }
        }
        assert_eq!(report.comparisons.len(), 6);
        assert_eq!(report.get(2023, Some(4), Metric::Outlay).unwrap().category, "Grants and fixed charges");
    }

    #[test]
    fn shortfall_and_extra_categories() {
        let (reference, _) = Totals::from_program_activity(&fy2023());
        let mut awards = Totals::new();
        awards.add(2023, 4, dec!(145000000), dec!(0));
        awards.add(2023, 2, dec!(50), dec!(5));
        awards.add(2024, 3, dec!(7), dec!(7));
        let report = reconcile("TAS", &reference, &awards).unwrap();

        let grants = report.get(2023, Some(4), Metric::Obligated).unwrap();
        assert_eq!(grants.missing, dec!(145000000));
        assert_eq!(grants.percent, Some(dec!(50)));
        let personnel = report.get(2023, Some(1), Metric::Obligated).unwrap();
        assert_eq!(personnel.awards, dec!(0));
        assert_eq!(personnel.percent, Some(dec!(100)));
        // categories only the awards know about have no reference amount
        let contractual = report.get(2023, Some(2), Metric::Obligated).unwrap();
        assert_eq!(contractual.missing, dec!(-50));
        assert_eq!(contractual.percent, None);
        // years only the awards know about
        let next = report.get(2024, None, Metric::Outlay).unwrap();
        assert_eq!(next.program_activity, dec!(0));
        assert_eq!(next.percent, None);
    }

    #[test]
    fn zero_reference_has_no_percentage() {
        for awards_amount in [dec!(0), dec!(1), dec!(-3)] {
            let c = Comparison::new(2023, None, Metric::Obligated, dec!(0), awards_amount).unwrap();
            assert_eq!(c.percent, None);
        }
        let c = Comparison::new(2023, None, Metric::Obligated, dec!(0.01), dec!(0)).unwrap();
        assert_eq!(c.percent, Some(dec!(100)));
    }

    #[test]
    fn empty_years_take_part() {
        let activity = ProgramActivity::from([
            ("2021".to_string(), YearActivity::NoData(NoData {})),
            ("2022".to_string(), YearActivity::Entries(vec![])),
        ]);
        let (reference, warnings) = Totals::from_program_activity(&activity);
        assert!(warnings.is_empty());
        let report = reconcile("TAS", &reference, &Totals::new()).unwrap();
        let years: BTreeSet<_> = report.comparisons.iter().map(|c| c.fiscal_year).collect();
        assert_eq!(years, BTreeSet::from([2021, 2022]));
        assert!(report.comparisons.iter().all(|c| c.pa_code.is_none()));
    }

    #[test]
    fn unmapped_summary_year_is_left_out() {
        let mut activity = fy2023();
        activity.insert(
            "2022".to_string(),
            YearActivity::Entries(vec![
                entry("Grants and fixed charges", dec!(5), dec!(5)),
                entry("Refunds", dec!(1), dec!(1)),
            ]),
        );
        let (reference, warnings) = Totals::from_program_activity(&activity);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].key, "2022");
        assert!(warnings[0].message.contains("Refunds"));

        let mut awards = Totals::new();
        awards.add(2022, 4, dec!(5), dec!(5));
        awards.add(2023, 4, dec!(290000000), dec!(0));
        let report = reconcile("TAS", &reference, &awards).unwrap();
        assert!(report.comparisons.iter().all(|c| c.fiscal_year == 2023));
        assert_eq!(
            report.get(2023, None, Metric::Obligated).unwrap().program_activity,
            dec!(290120000)
        );
    }

    #[test]
    fn unmapped_ledger_category_fails() {
        let mut awards = Totals::new();
        awards.add(2023, 6, dec!(1), dec!(1));
        assert!(matches!(
            reconcile("TAS", &Totals::new(), &awards),
            Err(Error::UnknownCategory(6))
        ));
    }
}
