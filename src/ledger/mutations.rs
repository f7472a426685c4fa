use chrono::NaiveDateTime;
use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Ledger, LedgerError, WalCommand};

fn check_field(field: &'static str, value: &str, max_len: usize) -> Result<(), LedgerError> {
    if value.trim().is_empty() {
        return Err(LedgerError::Validation {
            field,
            reason: "must not be empty".into(),
        });
    }
    if value.chars().count() > max_len {
        return Err(LedgerError::Validation {
            field,
            reason: format!("longer than {max_len} characters"),
        });
    }
    Ok(())
}

fn validate_new(new: &NewReservation) -> Result<(), LedgerError> {
    check_field("name", &new.name, MAX_NAME_LEN)?;
    check_field("phone", &new.phone, MAX_PHONE_LEN)?;
    check_field("service", &new.service, MAX_SERVICE_LEN)
}

impl Ledger {
    /// Store a new `active` reservation and return it with its assigned id.
    ///
    /// Fails with `SlotConflict` if an active reservation already holds
    /// (date, time). The check and the write happen under the day's write lock.
    pub async fn insert(
        &self,
        new: NewReservation,
        created_at: NaiveDateTime,
    ) -> Result<Reservation, LedgerError> {
        validate_new(&new)?;
        let day = self.day_state(new.date);
        let mut guard = day.write().await;

        if guard.active_holder(new.time).is_some() {
            return Err(LedgerError::SlotConflict {
                date: new.date,
                time: new.time,
            });
        }

        let reservation = Reservation {
            id: Ulid::new(),
            name: new.name,
            phone: new.phone,
            service: new.service,
            date: new.date,
            time: new.time,
            status: ReservationStatus::Active,
            created_at,
        };
        let event = Event::ReservationCreated {
            id: reservation.id,
            name: reservation.name.clone(),
            phone: reservation.phone.clone(),
            service: reservation.service.clone(),
            date: reservation.date,
            time: reservation.time,
            created_at,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(reservation)
    }

    /// `active` → `cancelled`. Anything not currently active is `NotFound`,
    /// including a reservation that was already cancelled.
    pub async fn cancel(&self, id: ReservationId) -> Result<Reservation, LedgerError> {
        let (date, mut guard) = self.resolve_write(&id).await?;
        if guard.get(&id).map(|r| r.status) != Some(ReservationStatus::Active) {
            return Err(LedgerError::NotFound(id));
        }

        let event = Event::StatusChanged {
            id,
            date,
            status: ReservationStatus::Cancelled,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        guard.get(&id).cloned().ok_or(LedgerError::NotFound(id))
    }

    /// Set any valid status. Setting the current status again is a no-op.
    /// Reactivating fails with `SlotConflict` if someone else holds the slot now.
    pub async fn set_status(
        &self,
        id: ReservationId,
        status: ReservationStatus,
    ) -> Result<Reservation, LedgerError> {
        let (date, mut guard) = self.resolve_write(&id).await?;
        let (current, time) = match guard.get(&id) {
            Some(r) => (r.status, r.time),
            None => return Err(LedgerError::NotFound(id)),
        };
        if current != status {
            if status == ReservationStatus::Active
                && let Some(holder) = guard.active_holder(time)
                && holder != id
            {
                return Err(LedgerError::SlotConflict { date, time });
            }
            let event = Event::StatusChanged { id, date, status };
            self.persist_and_apply(&mut guard, &event).await?;
        }
        guard.get(&id).cloned().ok_or(LedgerError::NotFound(id))
    }

    /// Rewrite the WAL with only the events needed to rebuild the current state.
    ///
    /// Run it while no writes are in flight (at startup): a write that lands
    /// between the snapshot and the file swap would be dropped.
    pub async fn compact_wal(&self) -> Result<usize, LedgerError> {
        let mut events = Vec::new();

        for day in self.sorted_days() {
            let guard = day.read().await;
            // Inactive reservations first so that replaying an inactive one
            // never evicts the active holder of the same slot from the index.
            let (active, inactive): (Vec<&Reservation>, Vec<&Reservation>) = guard
                .reservations
                .iter()
                .partition(|r| r.status == ReservationStatus::Active);
            for r in inactive.into_iter().chain(active) {
                events.push(Event::ReservationCreated {
                    id: r.id,
                    name: r.name.clone(),
                    phone: r.phone.clone(),
                    service: r.service.clone(),
                    date: r.date,
                    time: r.time,
                    created_at: r.created_at,
                });
                if r.status != ReservationStatus::Active {
                    events.push(Event::StatusChanged {
                        id: r.id,
                        date: r.date,
                        status: r.status,
                    });
                }
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| LedgerError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| LedgerError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| LedgerError::WalError(e.to_string()))?;
        Ok(count)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
