use crate::config::ScheduleConfig;
use crate::model::SlotTime;

/// Every slot start in `[opening, closing)`, spaced by the slot duration.
///
/// The last slot only has to *start* before closing; a duration that does not
/// divide the working window evenly simply yields fewer slots.
pub fn slot_grid(config: &ScheduleConfig) -> Vec<SlotTime> {
    let step = config.slot_minutes.max(1);
    let end = config.closing_hour * 60;
    (config.opening_hour * 60..end)
        .step_by(step as usize)
        .filter_map(SlotTime::from_minutes)
        .collect()
}

/// True if `time` is one of the grid's slot starts.
pub fn is_on_grid(config: &ScheduleConfig, time: SlotTime) -> bool {
    let open = config.opening_hour * 60;
    let m = time.minutes();
    m >= open && m < config.closing_hour * 60 && (m - open) % config.slot_minutes.max(1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(opening: u32, closing: u32, minutes: u32) -> ScheduleConfig {
        ScheduleConfig::new(opening, closing, minutes, 20).unwrap()
    }

    fn render(grid: &[SlotTime]) -> Vec<String> {
        grid.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn default_business_day() {
        let grid = slot_grid(&cfg(9, 19, 30));
        assert_eq!(grid.len(), 20);
        assert_eq!(grid.first().unwrap().to_string(), "09:00");
        assert_eq!(grid.last().unwrap().to_string(), "18:30");
    }

    #[test]
    fn minutes_carry_into_hour() {
        let grid = slot_grid(&cfg(9, 11, 45));
        assert_eq!(render(&grid), vec!["09:00", "09:45", "10:30"]);
    }

    #[test]
    fn uneven_duration_stops_before_closing() {
        // 10:40 would start inside the window, 11:20 would not.
        let grid = slot_grid(&cfg(9, 11, 50));
        assert_eq!(render(&grid), vec!["09:00", "09:50", "10:40"]);
    }

    #[test]
    fn duration_longer_than_window() {
        let grid = slot_grid(&cfg(9, 10, 90));
        assert_eq!(render(&grid), vec!["09:00"]);
    }

    #[test]
    fn full_day_window() {
        let grid = slot_grid(&cfg(0, 24, 60));
        assert_eq!(grid.len(), 24);
        assert_eq!(grid.last().unwrap().to_string(), "23:00");
    }

    #[test]
    fn deterministic() {
        let c = cfg(8, 18, 20);
        assert_eq!(slot_grid(&c), slot_grid(&c));
    }

    #[test]
    fn strictly_increasing_and_within_window() {
        for opening in 0..23 {
            for closing in (opening + 1)..=24 {
                for minutes in [1, 7, 15, 20, 25, 30, 45, 60, 90, 120] {
                    let c = cfg(opening, closing, minutes);
                    let grid = slot_grid(&c);
                    assert!(!grid.is_empty());
                    assert!(grid.windows(2).all(|w| w[0] < w[1]));
                    for t in &grid {
                        assert!(t.minutes() >= opening * 60);
                        assert!(t.minutes() < closing * 60);
                        assert!(is_on_grid(&c, *t));
                    }
                }
            }
        }
    }

    #[test]
    fn on_grid_membership() {
        let c = cfg(9, 19, 30);
        assert!(is_on_grid(&c, "09:00".parse().unwrap()));
        assert!(is_on_grid(&c, "18:30".parse().unwrap()));
        assert!(!is_on_grid(&c, "10:15".parse().unwrap()));
        assert!(!is_on_grid(&c, "08:30".parse().unwrap()));
        assert!(!is_on_grid(&c, "19:00".parse().unwrap()));
    }
}
