use chrono::NaiveDate;

use crate::model::{ReservationId, SlotTime};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    Validation { field: &'static str, reason: String },
    /// Another active reservation already holds (date, time).
    SlotConflict { date: NaiveDate, time: SlotTime },
    NotFound(ReservationId),
    WalError(String),
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::Validation { field, reason } => write!(f, "invalid {field}: {reason}"),
            LedgerError::SlotConflict { date, time } => {
                write!(f, "slot {date} {time} is already reserved")
            }
            LedgerError::NotFound(id) => write!(f, "reservation not found: {id}"),
            LedgerError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for LedgerError {}
