use crate::data::{Error, LedgerEntry, Table};
use rust_decimal::Decimal;
use std::str::FromStr;

/// Trait for doing something with a `LedgerEntry` read from a combined
/// funding table (or built in memory by the combiner). Used by the
/// reconciliation to sum amounts, and by tests to check what was read.
pub(crate) trait LedgerUser {
    fn use_entry(&mut self, entry: LedgerEntry) -> Result<(), Error>;
}

/// Simple CSV importer for `Table`s; every row must have as many cells as
/// the header.
pub(crate) fn read_table<R: std::io::Read>(reader: R) -> Result<Table, Error> {
    let mut rdr = csv::ReaderBuilder::new().from_reader(reader);
    let headers = rdr.headers()?.iter().map(str::to_string).collect();
    let mut rows = Vec::new();
    for result in rdr.records() {
        rows.push(result?.iter().map(str::to_string).collect());
    }
    Ok(Table { headers, rows })
}

/// Money cell of an extract; blank cells are zero.
pub(crate) fn parse_amount(cell: &str) -> Result<Decimal, Error> {
    let cell = cell.trim();
    if cell.is_empty() {
        return Ok(Decimal::ZERO);
    }
    Decimal::from_str(cell)
        .or_else(|_| Decimal::from_scientific(cell))
        .map_err(|_| Error::Format(format!("amount {cell:?}")))
}

/// Feed the reconciliation columns of a combined funding table to `user`.
pub(crate) fn read_ledger<R: std::io::Read, U: LedgerUser>(
    reader: R,
    user: &mut U,
) -> Result<usize, Error> {
    let table = read_table(reader)?;
    let year = table.column("fiscal_year")?;
    let code = table.column("pa_code")?;
    let obligated = table.column("transaction_obligated_amount")?;
    let outlay = table.column("transaction_outlay_amount")?;
    for row in &table.rows {
        let entry = LedgerEntry {
            fiscal_year: row[year]
                .parse()
                .map_err(|_| Error::Format(format!("fiscal year {:?}", row[year])))?,
            pa_code: row[code]
                .parse()
                .map_err(|_| Error::Format(format!("pa_code {:?}", row[code])))?,
            obligated: parse_amount(&row[obligated])?,
            outlay: parse_amount(&row[outlay])?,
        };
        user.use_entry(entry)?;
    }
    Ok(table.rows.len())
}
