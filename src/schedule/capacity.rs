use chrono::NaiveDate;

use crate::model::DayCapacity;

/// Advisory: the ledger's slot uniqueness is what actually prevents double-booking.
pub fn is_at_capacity(active: usize, daily_capacity: u32) -> bool {
    active >= daily_capacity as usize
}

pub fn day_capacity(date: NaiveDate, active: usize, daily_capacity: u32) -> DayCapacity {
    DayCapacity {
        date,
        current: u32::try_from(active).unwrap_or(u32::MAX),
        capacity: daily_capacity,
        is_full: is_at_capacity(active, daily_capacity),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_and_over_capacity() {
        assert!(!is_at_capacity(0, 20));
        assert!(!is_at_capacity(19, 20));
        assert!(is_at_capacity(20, 20));
        assert!(is_at_capacity(21, 20));
    }

    #[test]
    fn day_capacity_report() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let cap = day_capacity(date, 3, 20);
        assert_eq!(
            cap,
            DayCapacity {
                date,
                current: 3,
                capacity: 20,
                is_full: false
            }
        );
        assert!(day_capacity(date, 20, 20).is_full);
    }
}
