//! Authoritative reservation store.
//!
//! State is partitioned by calendar day. Each partition sits behind its own
//! `RwLock`, and every mutation of a day (slot check, log append, apply) runs
//! while holding that day's write lock. Two inserts racing for the same
//! (date, time) therefore serialize, and the second one sees the first one's
//! slot as taken.

mod error;
mod mutations;
mod queries;

pub use error::LedgerError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};

use crate::model::*;
use crate::wal::Wal;

pub type SharedDayState = Arc<RwLock<DayState>>;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain all immediately available Appends (the batch window).
/// 3. Commit the whole batch with a single fsync.
/// 4. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut events = vec![event];
                let mut waiters = vec![response];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            events.push(event);
                            waiters.push(response);
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(events.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = wal.commit(&events);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(waiters, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn respond_batch(waiters: Vec<oneshot::Sender<io::Result<()>>>, result: &io::Result<()>) {
    for tx in waiters {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.records_since_compact());
        }
        WalCommand::Append { event, response } => {
            let _ = response.send(wal.commit(std::slice::from_ref(&event)));
        }
    }
}

pub struct Ledger {
    days: DashMap<NaiveDate, SharedDayState>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: reservation id → day partition.
    id_to_date: DashMap<ReservationId, NaiveDate>,
}

/// Apply an event to a day (no locking — caller holds the lock).
fn apply_to_day(day: &mut DayState, event: &Event, id_to_date: &DashMap<ReservationId, NaiveDate>) {
    match event {
        Event::ReservationCreated {
            id,
            name,
            phone,
            service,
            date,
            time,
            created_at,
        } => {
            day.insert_reservation(Reservation {
                id: *id,
                name: name.clone(),
                phone: phone.clone(),
                service: service.clone(),
                date: *date,
                time: *time,
                status: ReservationStatus::Active,
                created_at: *created_at,
            });
            id_to_date.insert(*id, *date);
        }
        Event::StatusChanged { id, status, .. } => {
            day.set_status(*id, *status);
        }
    }
}

impl Ledger {
    /// Replay the log at `wal_path` and start the writer task. Must be called
    /// inside a tokio runtime.
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        let (wal, events) = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let ledger = Self {
            days: DashMap::new(),
            wal_tx,
            id_to_date: DashMap::new(),
        };

        // Nobody else holds these Arcs yet, so try_write never contends. Never
        // blocking_write here: we may already be inside the runtime.
        for event in &events {
            let day = ledger.day_state(event.date());
            let mut guard = day
                .try_write()
                .map_err(|_| io::Error::other("replay: contended day partition"))?;
            apply_to_day(&mut guard, event, &ledger.id_to_date);
        }

        Ok(ledger)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), LedgerError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| LedgerError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| LedgerError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| LedgerError::WalError(e.to_string()))
    }

    /// Partition for `date`, created empty on first use.
    fn day_state(&self, date: NaiveDate) -> SharedDayState {
        self.days
            .entry(date)
            .or_insert_with(|| Arc::new(RwLock::new(DayState::new(date))))
            .value()
            .clone()
    }

    fn get_day(&self, date: &NaiveDate) -> Option<SharedDayState> {
        self.days.get(date).map(|e| e.value().clone())
    }

    /// All partitions, ordered by date.
    fn sorted_days(&self) -> Vec<SharedDayState> {
        let mut days: Vec<(NaiveDate, SharedDayState)> = self
            .days
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        days.sort_by_key(|(date, _)| *date);
        days.into_iter().map(|(_, day)| day).collect()
    }

    /// WAL-append then apply, under the caller's write lock.
    async fn persist_and_apply(&self, day: &mut DayState, event: &Event) -> Result<(), LedgerError> {
        self.wal_append(event).await?;
        apply_to_day(day, event, &self.id_to_date);
        Ok(())
    }

    /// Lookup reservation → day, acquire that day's write lock.
    async fn resolve_write(
        &self,
        id: &ReservationId,
    ) -> Result<(NaiveDate, OwnedRwLockWriteGuard<DayState>), LedgerError> {
        let date = self
            .id_to_date
            .get(id)
            .map(|e| *e.value())
            .ok_or(LedgerError::NotFound(*id))?;
        let day = self.get_day(&date).ok_or(LedgerError::NotFound(*id))?;
        Ok((date, day.write_owned().await))
    }
}
