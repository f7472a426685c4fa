use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub type ReservationId = Ulid;

pub const MINUTES_PER_DAY: u32 = 24 * 60;

/// Time of day at minute precision, stored as minutes since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotTime(u16);

impl SlotTime {
    pub fn from_minutes(minutes: u32) -> Option<Self> {
        (minutes < MINUTES_PER_DAY).then_some(Self(minutes as u16))
    }

    pub fn from_hm(hour: u32, minute: u32) -> Option<Self> {
        if hour >= 24 || minute >= 60 {
            return None;
        }
        Self::from_minutes(hour * 60 + minute)
    }

    /// Seconds are dropped: 10:00:59 is 10:00.
    pub fn from_time(t: NaiveTime) -> Self {
        Self((t.hour() * 60 + t.minute()) as u16)
    }

    pub fn minutes(self) -> u32 {
        u32::from(self.0)
    }

    pub fn hour(self) -> u32 {
        self.minutes() / 60
    }

    pub fn minute(self) -> u32 {
        self.minutes() % 60
    }
}

impl fmt::Display for SlotTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseSlotTimeError(String);

impl fmt::Display for ParseSlotTimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid time '{}': expected HH:MM", self.0)
    }
}

impl std::error::Error for ParseSlotTimeError {}

/// Accepts `H:MM` and `HH:MM`.
impl FromStr for SlotTime {
    type Err = ParseSlotTimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseSlotTimeError(s.to_string());
        let (h, m) = s.split_once(':').ok_or_else(err)?;
        let digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if h.is_empty() || h.len() > 2 || m.len() != 2 || !digits(h) || !digits(m) {
            return Err(err());
        }
        let hour: u32 = h.parse().map_err(|_| err())?;
        let minute: u32 = m.parse().map_err(|_| err())?;
        Self::from_hm(hour, minute).ok_or_else(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    /// Occupies its slot and counts toward the daily capacity.
    Active,
    Cancelled,
    Completed,
}

impl ReservationStatus {
    pub const ALL: [ReservationStatus; 3] = [Self::Active, Self::Cancelled, Self::Completed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub name: String,
    pub phone: String,
    /// Free text; not checked against any catalog.
    pub service: String,
    pub date: NaiveDate,
    pub time: SlotTime,
    pub status: ReservationStatus,
    pub created_at: NaiveDateTime,
}

/// Already-validated input for a ledger insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub name: String,
    pub phone: String,
    pub service: String,
    pub date: NaiveDate,
    pub time: SlotTime,
}

/// All reservations of one calendar day plus the active-slot index.
#[derive(Debug, Clone)]
pub struct DayState {
    pub date: NaiveDate,
    /// Sorted by `time`; equal times keep insertion order.
    pub reservations: Vec<Reservation>,
    /// Slot → holder, `active` reservations only.
    active: BTreeMap<SlotTime, ReservationId>,
}

impl DayState {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            reservations: Vec::new(),
            active: BTreeMap::new(),
        }
    }

    pub fn insert_reservation(&mut self, reservation: Reservation) {
        if reservation.status == ReservationStatus::Active {
            self.active.insert(reservation.time, reservation.id);
        }
        let pos = self
            .reservations
            .partition_point(|r| r.time <= reservation.time);
        self.reservations.insert(pos, reservation);
    }

    pub fn get(&self, id: &ReservationId) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn active_holder(&self, time: SlotTime) -> Option<ReservationId> {
        self.active.get(&time).copied()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn active_times(&self) -> BTreeSet<SlotTime> {
        self.active.keys().copied().collect()
    }

    /// Returns the previous status, or `None` if `id` is not in this day.
    pub fn set_status(&mut self, id: ReservationId, status: ReservationStatus) -> Option<ReservationStatus> {
        let reservation = self.reservations.iter_mut().find(|r| r.id == id)?;
        let previous = reservation.status;
        match (previous, status) {
            (ReservationStatus::Active, next) if next != ReservationStatus::Active => {
                if self.active.get(&reservation.time) == Some(&id) {
                    self.active.remove(&reservation.time);
                }
            }
            (prev, ReservationStatus::Active) if prev != ReservationStatus::Active => {
                self.active.insert(reservation.time, id);
            }
            _ => {}
        }
        reservation.status = status;
        Some(previous)
    }
}

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ReservationCreated {
        id: ReservationId,
        name: String,
        phone: String,
        service: String,
        date: NaiveDate,
        time: SlotTime,
        created_at: NaiveDateTime,
    },
    StatusChanged {
        id: ReservationId,
        date: NaiveDate,
        status: ReservationStatus,
    },
}

impl Event {
    pub fn date(&self) -> NaiveDate {
        match self {
            Event::ReservationCreated { date, .. } | Event::StatusChanged { date, .. } => *date,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Available,
    Taken,
    /// Today and not later than the current minute.
    Elapsed,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Taken => "taken",
            Self::Elapsed => "elapsed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotAvailability {
    pub time: SlotTime,
    pub status: SlotStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayCapacity {
    pub date: NaiveDate,
    pub current: u32,
    pub capacity: u32,
    pub is_full: bool,
}

/// Both filters are optional and combine with AND.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub date: Option<NaiveDate>,
    pub status: Option<ReservationStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    /// Active reservations dated today.
    pub today: usize,
    pub total: usize,
    pub active: usize,
    pub cancelled: usize,
    pub completed: usize,
    /// Service with the most reservations of any status.
    pub top_service: Option<String>,
}
