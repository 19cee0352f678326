use crate::compute::{Comparison, Metric, Reconciliation};
use crate::data::{Error, Table};
use rust_decimal::{Decimal, RoundingStrategy};
use std::fmt;

/// Basic CSV exporter for `Table`s
pub(crate) fn write_table<W: std::io::Write>(writer: W, table: &Table) -> Result<(), Error> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(&table.headers)?;
    for row in &table.rows {
        wtr.write_record(row)?;
    }
    wtr.flush()?;
    Ok(())
}

/// `$1,234,567`, cents only when there are some.
pub(crate) fn format_money(amount: Decimal) -> String {
    let rounded = amount
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
        .normalize();
    let text = rounded.abs().to_string();
    let (units, cents) = match text.split_once('.') {
        Some((units, cents)) => (units, format!(".{cents:0<2}")),
        None => (text.as_str(), String::new()),
    };
    let mut grouped = String::new();
    for (i, digit) in units.chars().enumerate() {
        if i > 0 && (units.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    let sign = if rounded.is_sign_negative() && !rounded.is_zero() {
        "-"
    } else {
        ""
    };
    format!("{sign}${grouped}{cents}")
}

/// Two decimals at most, `--%` when there is nothing to divide by.
pub(crate) fn format_percent(percent: Option<Decimal>) -> String {
    match percent {
        Some(p) => format!(
            "{}%",
            p.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
                .normalize()
        ),
        None => "--%".to_string(),
    }
}

fn metric_label(metric: Metric) -> &'static str {
    match metric {
        Metric::Obligated => "Obligated",
        Metric::Outlay => "Outlay",
    }
}

fn write_comparison(f: &mut fmt::Formatter<'_>, c: &Comparison) -> fmt::Result {
    writeln!(
        f,
        "    {:<10} program activity {:>18}   awards {:>18}   Missing {:>18} ({})",
        metric_label(c.metric),
        format_money(c.program_activity),
        format_money(c.awards),
        format_money(c.missing),
        format_percent(c.percent),
    )
}

/// Human readable reconciliation: one block per fiscal year, the total first,
/// then the failed awards and any other warning of the run.
impl fmt::Display for Reconciliation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Reconciliation of TAS {}", self.tas)?;
        writeln!(f, "Program activity summary vs. combined award funding rows")?;
        let mut year = None;
        let mut category = None;
        for c in &self.comparisons {
            if year != Some(c.fiscal_year) {
                writeln!(f, "\n -------- FY{}", c.fiscal_year)?;
                year = Some(c.fiscal_year);
                category = None;
            }
            if category != Some(c.pa_code) {
                match c.pa_code {
                    Some(code) => writeln!(f, "  {code} {}", c.category)?,
                    None => writeln!(f, "  {}", c.category)?,
                }
                category = Some(c.pa_code);
            }
            write_comparison(f, c)?;
        }
        if self.comparisons.is_empty() {
            writeln!(f, "\nNo fiscal year to compare.")?;
        }
        if !self.failed_awards.is_empty() {
            writeln!(
                f,
                "\nAwards missing from the combined table ({}):",
                self.failed_awards.len()
            )?;
            for (award_id, reason) in &self.failed_awards {
                writeln!(f, "  - {award_id}: {reason}")?;
            }
        }
        if !self.warnings.is_empty() {
            writeln!(f, "\nWarnings ({}):", self.warnings.len())?;
            for warning in &self.warnings {
                writeln!(f, "  - {}: {}", warning.key, warning.message)?;
            }
        }
        Ok(())
    }
}

pub(crate) fn render_report(report: &Reconciliation) -> String {
    report.to_string()
}
