//! Parsing and normalization of raw source files into transaction records.

use std::path::Path;

use anyhow::Context;
use chrono::NaiveDate;
use csv::{ReaderBuilder, WriterBuilder};
use thiserror::Error;
use ttsync_core::{RawTable, TransactionRecord};

pub const CRATE_NAME: &str = "ttsync-extract";

/// Substituted for absent or empty `operation`/`channel`/`entity` values.
pub const UNKNOWN_DIMENSION: &str = "Unknown";

/// Columns the transformer requires to compose the event timestamp.
pub const REQUIRED_DATE_COLUMNS: [&str; 4] = ["year", "month", "day", "hour"];

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("content is not valid delimited text: {0}")]
    Malformed(#[from] csv::Error),
}

#[derive(Debug, Error)]
pub enum TransformError {
    /// The file's header row lacks one or more of the required date columns.
    #[error("missing required date columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
    /// A date component cell did not parse as a number.
    #[error("row {row}: column {column} has non-numeric value {value:?}")]
    BadDateComponent {
        row: usize,
        column: &'static str,
        value: String,
    },
    /// The numeric components do not form a real timestamp (day 32, hour 24).
    #[error("row {row}: no such timestamp {year}-{month:02}-{day:02} {hour:02}h")]
    InvalidDate {
        row: usize,
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
    },
}

/// Parse delimited bytes into a raw table. The delimiter is a deployment
/// setting, not a constant; observed feeds use both `,` and `;`.
pub fn parse_delimited(bytes: &[u8], delimiter: u8) -> Result<RawTable, ParseError> {
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .from_reader(bytes);

    let headers = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(|v| v.to_string()).collect());
    }

    Ok(RawTable { headers, rows })
}

/// Normalize a raw table into transaction records.
///
/// Missing `operation`/`channel`/`entity` become `"Unknown"`. A non-numeric
/// `terminal_id` becomes null rather than a default: an unattributed
/// transaction is still a transaction. Non-numeric counts and amounts fall
/// back to 0, matching the upstream feed's behavior; zero activity and
/// unparseable input are indistinguishable downstream.
pub fn transform(table: &RawTable) -> Result<Vec<TransactionRecord>, TransformError> {
    let missing: Vec<String> = REQUIRED_DATE_COLUMNS
        .iter()
        .filter(|column| table.column_index(column).is_none())
        .map(|column| column.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(TransformError::MissingColumns(missing));
    }

    let year_idx = table.column_index("year").expect("checked above");
    let month_idx = table.column_index("month").expect("checked above");
    let day_idx = table.column_index("day").expect("checked above");
    let hour_idx = table.column_index("hour").expect("checked above");
    let terminal_idx = table.column_index("terminal_id");
    let operation_idx = table.column_index("operation");
    let channel_idx = table.column_index("channel");
    let entity_idx = table.column_index("entity");
    let count_idx = table.column_index("transaction_count");
    let amount_idx = table.column_index("transaction_amount");

    let mut records = Vec::with_capacity(table.row_count());
    for (row_idx, row) in table.rows.iter().enumerate() {
        let cell = |idx: Option<usize>| {
            idx.and_then(|i| row.get(i))
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };

        let year: i32 = parse_component(row_idx, "year", cell(Some(year_idx)))?;
        let month: u32 = parse_component(row_idx, "month", cell(Some(month_idx)))?;
        let day: u32 = parse_component(row_idx, "day", cell(Some(day_idx)))?;
        let hour: u32 = parse_component(row_idx, "hour", cell(Some(hour_idx)))?;

        let invalid = TransformError::InvalidDate {
            row: row_idx,
            year,
            month,
            day,
            hour,
        };
        let Some(date) = NaiveDate::from_ymd_opt(year, month, day) else {
            return Err(invalid);
        };
        let Some(datetime) = date.and_hms_opt(hour, 0, 0) else {
            return Err(invalid);
        };

        records.push(TransactionRecord {
            terminal_id: cell(terminal_idx).and_then(|v| v.parse::<i32>().ok()),
            operation: dimension(cell(operation_idx)),
            channel: dimension(cell(channel_idx)),
            entity: dimension(cell(entity_idx)),
            year,
            month: month as i32,
            day: day as i32,
            hour: hour as i32,
            transaction_count: numeric(cell(count_idx)),
            transaction_amount: numeric(cell(amount_idx)),
            transaction_datetime: datetime,
            transaction_date: date,
        });
    }

    Ok(records)
}

/// Write a parsed-but-untransformed table back out as delimited text.
/// Used by sample mode to capture one file for inspection.
pub fn write_raw_table(table: &RawTable, path: &Path, delimiter: u8) -> anyhow::Result<()> {
    let mut writer = WriterBuilder::new()
        .delimiter(delimiter)
        .from_path(path)
        .with_context(|| format!("creating {}", path.display()))?;
    writer
        .write_record(&table.headers)
        .context("writing header row")?;
    for row in &table.rows {
        writer.write_record(row).context("writing data row")?;
    }
    writer.flush().context("flushing sample file")?;
    Ok(())
}

fn parse_component<T: std::str::FromStr>(
    row: usize,
    column: &'static str,
    value: Option<&str>,
) -> Result<T, TransformError> {
    let value = value.unwrap_or("");
    value.parse().map_err(|_| TransformError::BadDateComponent {
        row,
        column,
        value: value.to_string(),
    })
}

fn dimension(value: Option<&str>) -> String {
    value.unwrap_or(UNKNOWN_DIMENSION).to_string()
}

fn numeric(value: Option<&str>) -> f64 {
    value.and_then(|v| v.parse::<f64>().ok()).unwrap_or(0.0)
}
