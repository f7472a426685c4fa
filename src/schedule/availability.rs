use std::collections::BTreeSet;

use chrono::{NaiveDate, NaiveDateTime};

use crate::model::{SlotAvailability, SlotStatus, SlotTime};

/// Classify every grid slot of `date`, keeping grid order.
///
/// `taken` wins over `elapsed`. A slot is elapsed only on `now`'s own date and
/// only when it starts at or before the current minute.
pub fn classify_slots(
    date: NaiveDate,
    grid: &[SlotTime],
    taken: &BTreeSet<SlotTime>,
    now: NaiveDateTime,
) -> Vec<SlotAvailability> {
    let is_today = date == now.date();
    let current = SlotTime::from_time(now.time());
    grid.iter()
        .map(|&time| {
            let status = if taken.contains(&time) {
                SlotStatus::Taken
            } else if is_today && time <= current {
                SlotStatus::Elapsed
            } else {
                SlotStatus::Available
            };
            SlotAvailability { time, status }
        })
        .collect()
}
