use std::collections::{BTreeSet, HashMap};

use chrono::NaiveDate;

use crate::model::*;

use super::Ledger;

impl Ledger {
    pub async fn get(&self, id: &ReservationId) -> Option<Reservation> {
        let date = *self.id_to_date.get(id)?.value();
        let day = self.get_day(&date)?;
        let guard = day.read().await;
        guard.get(id).cloned()
    }

    /// Reservations matching `filter`, ordered by (date, time).
    pub async fn list(&self, filter: ReservationFilter) -> Vec<Reservation> {
        let days = match filter.date {
            Some(date) => self.get_day(&date).into_iter().collect(),
            None => self.sorted_days(),
        };

        let mut out = Vec::new();
        for day in days {
            let guard = day.read().await;
            out.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| filter.status.is_none_or(|s| r.status == s))
                    .cloned(),
            );
        }
        out
    }

    pub async fn count_active(&self, date: NaiveDate) -> usize {
        match self.get_day(&date) {
            Some(day) => day.read().await.active_count(),
            None => 0,
        }
    }

    pub async fn active_times(&self, date: NaiveDate) -> BTreeSet<SlotTime> {
        match self.get_day(&date) {
            Some(day) => day.read().await.active_times(),
            None => BTreeSet::new(),
        }
    }

    pub async fn stats(&self, today: NaiveDate) -> Stats {
        let mut stats = Stats::default();
        let mut per_service: HashMap<String, usize> = HashMap::new();

        for day in self.sorted_days() {
            let guard = day.read().await;
            for r in &guard.reservations {
                stats.total += 1;
                match r.status {
                    ReservationStatus::Active => {
                        stats.active += 1;
                        if r.date == today {
                            stats.today += 1;
                        }
                    }
                    ReservationStatus::Cancelled => stats.cancelled += 1,
                    ReservationStatus::Completed => stats.completed += 1,
                }
                *per_service.entry(r.service.clone()).or_default() += 1;
            }
        }

        // Highest count wins; on a tie the smallest name.
        stats.top_service = per_service
            .into_iter()
            .min_by(|(a_name, a_count), (b_name, b_count)| {
                b_count.cmp(a_count).then_with(|| a_name.cmp(b_name))
            })
            .map(|(name, _)| name);
        stats
    }
}
