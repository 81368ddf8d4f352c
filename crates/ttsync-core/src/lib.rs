//! Core domain model for the terminal transaction sync pipeline.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "ttsync-core";

/// One candidate object in the source store, as reported by a listing call.
/// Lives only for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub key: String,
    pub last_modified: DateTime<Utc>,
    pub byte_size: u64,
}

/// Raw tabular content of one source file, before any normalization.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// One normalized transaction row, ready for loading.
///
/// `source_file` is stamped by the loader and `loaded_at` is assigned by the
/// database server, so neither appears here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub terminal_id: Option<i32>,
    pub operation: String,
    pub channel: String,
    pub entity: String,
    pub year: i32,
    pub month: i32,
    pub day: i32,
    pub hour: i32,
    pub transaction_count: f64,
    pub transaction_amount: f64,
    pub transaction_datetime: NaiveDateTime,
    pub transaction_date: NaiveDate,
}

impl TransactionRecord {
    /// The tuple that uniquely identifies a record in the destination store.
    /// Two records sharing it are the same logical transaction; the
    /// later-loaded one wins for the mutable fields.
    pub fn natural_key(&self) -> (Option<i32>, NaiveDateTime, &str, &str) {
        (
            self.terminal_id,
            self.transaction_datetime,
            self.operation.as_str(),
            self.channel.as_str(),
        )
    }
}

/// Outcome of one sync run as recorded in the run log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(RunStatus::Success),
            "failure" => Some(RunStatus::Failure),
            _ => None,
        }
    }
}

/// One row of the append-only sync-run log. The most recent `success` row's
/// `last_sync_time` is the watermark for the next run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub last_sync_time: DateTime<Utc>,
    pub status: RunStatus,
    pub files_processed: i32,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(terminal_id: Option<i32>, operation: &str, channel: &str) -> TransactionRecord {
        let date = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        TransactionRecord {
            terminal_id,
            operation: operation.to_string(),
            channel: channel.to_string(),
            entity: "Branch A".to_string(),
            year: 2026,
            month: 3,
            day: 14,
            hour: 9,
            transaction_count: 4.0,
            transaction_amount: 1200.0,
            transaction_datetime: date.and_hms_opt(9, 0, 0).unwrap(),
            transaction_date: date,
        }
    }

    #[test]
    fn natural_key_ignores_mutable_fields() {
        let mut a = record(Some(7), "Withdrawal", "ATM");
        let mut b = record(Some(7), "Withdrawal", "ATM");
        a.transaction_amount = 10.0;
        b.transaction_amount = 99.0;
        b.entity = "Branch B".to_string();
        assert_eq!(a.natural_key(), b.natural_key());
    }

    #[test]
    fn natural_key_treats_null_terminal_as_a_value() {
        let a = record(None, "Deposit", "Mobile");
        let b = record(None, "Deposit", "Mobile");
        let c = record(Some(1), "Deposit", "Mobile");
        assert_eq!(a.natural_key(), b.natural_key());
        assert_ne!(a.natural_key(), c.natural_key());
    }

    #[test]
    fn run_status_round_trips_through_strings() {
        assert_eq!(RunStatus::parse("success"), Some(RunStatus::Success));
        assert_eq!(RunStatus::parse("failure"), Some(RunStatus::Failure));
        assert_eq!(RunStatus::parse("bogus"), None);
        assert_eq!(RunStatus::Success.as_str(), "success");
    }
}
