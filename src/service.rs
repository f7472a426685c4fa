//! Request-level scheduling rules on top of the ledger.
//!
//! `Scheduler` takes raw client strings, validates them in a fixed order and
//! only then touches the ledger. The capacity check here is a fast, advisory
//! rejection; slot uniqueness is decided by `Ledger::insert` alone.

use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::ScheduleConfig;
use crate::ledger::{Ledger, LedgerError};
use crate::limits::MIN_PHONE_LEN;
use crate::model::*;
use crate::observability;
use crate::schedule;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Raw creation input as received from a client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationRequest {
    pub name: String,
    pub phone: String,
    pub service: String,
    pub date: String,
    pub time: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulingError {
    Validation { field: &'static str, reason: String },
    PastDate(NaiveDate),
    OutOfHours {
        time: SlotTime,
        opening_hour: u32,
        closing_hour: u32,
    },
    /// Same-day slot whose start is not after the current minute.
    SlotElapsed { date: NaiveDate, time: SlotTime },
    CapacityExceeded { date: NaiveDate, capacity: u32 },
    SlotConflict { date: NaiveDate, time: SlotTime },
    NotFound(ReservationId),
    InvalidStatus(String),
    Storage(String),
}

impl SchedulingError {
    /// Stable snake_case name, used for metric labels and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulingError::Validation { .. } => "validation",
            SchedulingError::PastDate(_) => "past_date",
            SchedulingError::OutOfHours { .. } => "out_of_hours",
            SchedulingError::SlotElapsed { .. } => "slot_elapsed",
            SchedulingError::CapacityExceeded { .. } => "capacity_exceeded",
            SchedulingError::SlotConflict { .. } => "slot_conflict",
            SchedulingError::NotFound(_) => "not_found",
            SchedulingError::InvalidStatus(_) => "invalid_status",
            SchedulingError::Storage(_) => "storage",
        }
    }

    fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        SchedulingError::Validation {
            field,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for SchedulingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulingError::Validation { field, reason } => write!(f, "invalid {field}: {reason}"),
            SchedulingError::PastDate(date) => write!(f, "date {date} is in the past"),
            SchedulingError::OutOfHours {
                time,
                opening_hour,
                closing_hour,
            } => write!(
                f,
                "time {time} is outside business hours {opening_hour:02}:00-{closing_hour:02}:00"
            ),
            SchedulingError::SlotElapsed { date, time } => {
                write!(f, "slot {date} {time} has already started")
            }
            SchedulingError::CapacityExceeded { date, capacity } => {
                write!(f, "daily capacity of {capacity} reached for {date}")
            }
            SchedulingError::SlotConflict { date, time } => {
                write!(f, "slot {date} {time} is already reserved")
            }
            SchedulingError::NotFound(id) => write!(f, "reservation not found: {id}"),
            SchedulingError::InvalidStatus(s) => {
                write!(f, "invalid status '{s}': expected active, cancelled or completed")
            }
            SchedulingError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for SchedulingError {}

impl From<LedgerError> for SchedulingError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Validation { field, reason } => SchedulingError::Validation { field, reason },
            LedgerError::SlotConflict { date, time } => SchedulingError::SlotConflict { date, time },
            LedgerError::NotFound(id) => SchedulingError::NotFound(id),
            LedgerError::WalError(e) => SchedulingError::Storage(e),
        }
    }
}

pub fn parse_date(raw: &str) -> Result<NaiveDate, SchedulingError> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT)
        .map_err(|_| SchedulingError::validation("date", format!("'{raw}' is not a YYYY-MM-DD date")))
}

pub fn parse_status(raw: &str) -> Result<ReservationStatus, SchedulingError> {
    ReservationStatus::parse(raw).ok_or_else(|| SchedulingError::InvalidStatus(raw.to_string()))
}

fn required(field: &'static str, raw: &str) -> Result<String, SchedulingError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(SchedulingError::validation(field, "is required"));
    }
    Ok(value.to_string())
}

pub struct Scheduler {
    ledger: Arc<Ledger>,
    config: ScheduleConfig,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    pub fn new(ledger: Arc<Ledger>, config: ScheduleConfig, clock: Arc<dyn Clock>) -> Self {
        Self { ledger, config, clock }
    }

    pub fn slot_grid(&self) -> Vec<SlotTime> {
        schedule::slot_grid(&self.config)
    }

    pub async fn available_slots(&self, date: &str) -> Result<Vec<SlotAvailability>, SchedulingError> {
        let date = parse_date(date)?;
        let taken = self.ledger.active_times(date).await;
        Ok(schedule::classify_slots(
            date,
            &self.slot_grid(),
            &taken,
            self.clock.now(),
        ))
    }

    pub async fn daily_capacity(&self, date: &str) -> Result<DayCapacity, SchedulingError> {
        let date = parse_date(date)?;
        let active = self.ledger.count_active(date).await;
        Ok(schedule::day_capacity(date, active, self.config.daily_capacity))
    }

    /// Validate and store a new reservation. Checks run in order and the
    /// first failure is returned: required fields, phone length, date, time,
    /// capacity, then the slot itself.
    pub async fn create_reservation(&self, req: ReservationRequest) -> Result<Reservation, SchedulingError> {
        let name = required("name", &req.name)?;
        let phone = required("phone", &req.phone)?;
        let service = required("service", &req.service)?;
        let raw_date = required("date", &req.date)?;
        let raw_time = required("time", &req.time)?;

        if phone.chars().count() < MIN_PHONE_LEN {
            return Err(SchedulingError::validation(
                "phone",
                format!("must be at least {MIN_PHONE_LEN} characters"),
            ));
        }

        let now = self.clock.now();
        let date = parse_date(&raw_date)?;
        if date < now.date() {
            return Err(SchedulingError::PastDate(date));
        }

        let time: SlotTime = raw_time
            .parse()
            .map_err(|e: ParseSlotTimeError| SchedulingError::validation("time", e.to_string()))?;
        if time.hour() < self.config.opening_hour || time.hour() >= self.config.closing_hour {
            return Err(SchedulingError::OutOfHours {
                time,
                opening_hour: self.config.opening_hour,
                closing_hour: self.config.closing_hour,
            });
        }
        if !schedule::is_on_grid(&self.config, time) {
            return Err(SchedulingError::validation(
                "time",
                format!("{time} is not a slot start"),
            ));
        }
        if date == now.date() && time <= SlotTime::from_time(now.time()) {
            return Err(SchedulingError::SlotElapsed { date, time });
        }

        let active = self.ledger.count_active(date).await;
        if schedule::is_at_capacity(active, self.config.daily_capacity) {
            metrics::counter!(observability::CAPACITY_REJECTIONS_TOTAL).increment(1);
            debug!(%date, active, "daily capacity reached");
            return Err(SchedulingError::CapacityExceeded {
                date,
                capacity: self.config.daily_capacity,
            });
        }

        let new = NewReservation {
            name,
            phone,
            service,
            date,
            time,
        };
        match self.ledger.insert(new, now).await {
            Ok(reservation) => {
                metrics::counter!(observability::RESERVATIONS_CREATED_TOTAL).increment(1);
                info!(id = %reservation.id, %date, %time, service = %reservation.service, "reservation created");
                Ok(reservation)
            }
            Err(e) => {
                if let LedgerError::SlotConflict { .. } = e {
                    metrics::counter!(observability::SLOT_CONFLICTS_TOTAL).increment(1);
                    debug!(%date, %time, "slot conflict");
                }
                Err(e.into())
            }
        }
    }

    pub async fn list_reservations(
        &self,
        date: Option<&str>,
        status: Option<&str>,
    ) -> Result<Vec<Reservation>, SchedulingError> {
        let filter = ReservationFilter {
            date: date.map(parse_date).transpose()?,
            status: status.map(parse_status).transpose()?,
        };
        Ok(self.ledger.list(filter).await)
    }

    pub async fn cancel_reservation(&self, id: ReservationId) -> Result<Reservation, SchedulingError> {
        let reservation = self.ledger.cancel(id).await?;
        info!(%id, date = %reservation.date, time = %reservation.time, "reservation cancelled");
        Ok(reservation)
    }

    pub async fn update_status(&self, id: ReservationId, status: &str) -> Result<Reservation, SchedulingError> {
        let status = parse_status(status)?;
        let reservation = self.ledger.set_status(id, status).await?;
        info!(%id, %status, "reservation status updated");
        Ok(reservation)
    }

    pub async fn stats(&self) -> Stats {
        self.ledger.stats(self.clock.today()).await
    }
}
