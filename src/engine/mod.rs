mod capacity;
mod catalog;
mod conflict;
mod error;
mod lifecycle;
mod queries;
mod store;
mod sweeps;

pub use conflict::now_ms;
pub use error::EngineError;
pub use queries::SlotAudit;
pub use store::Store;
pub use sweeps::SweepReport;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::warn;
use ulid::Ulid;

use crate::limits::MAX_RESERVE_ATTEMPTS;
use crate::model::*;
use crate::notify::NotificationSink;
use crate::wal::Wal;

pub type SharedSlotState = Arc<RwLock<SlotState>>;

/// Tunables for the optimistic write path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Attempts per reservation / transition before giving up with `Conflict`.
    pub reserve_max_attempts: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self { reserve_max_attempts: 3 }
    }
}

impl EngineSettings {
    pub(crate) fn attempts(&self) -> u32 {
        self.reserve_max_attempts.clamp(1, MAX_RESERVE_ATTEMPTS)
    }
}

/// Outcome of a conditional write: either it landed, or the version the
/// caller read is gone and the whole read-check-write cycle must restart.
pub(super) enum Commit<T> {
    Done(T),
    Stale,
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
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

type Pending = Vec<(Event, oneshot::Sender<io::Result<()>>)>;

/// Background task that owns the WAL. Appends that queue up while one fsync
/// is in flight are written and synced together.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch: Pending = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    // Commit what we have before compaction can observe the file.
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Pending) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes do not leak into
    // the next batch; the whole batch is reported failed either way.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Slot capacity and booking lifecycle engine for one tenant.
pub struct Engine {
    pub(super) store: Store,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) notify: Arc<dyn NotificationSink>,
    pub(super) settings: EngineSettings,
    /// Serializes catalog writes (tasks, slot creation) so their WAL order
    /// matches their apply order. Never taken by the booking path.
    pub(super) catalog_lock: Mutex<()>,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<dyn NotificationSink>,
        settings: EngineSettings,
    ) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: Store::new(),
            wal_tx,
            notify,
            settings,
            catalog_lock: Mutex::new(()),
        };

        // We're the sole owner of every slot handle during replay, so try_write
        // always succeeds. Never block here: this may run inside a runtime
        // (lazy tenant creation).
        let mut skipped = 0usize;
        for event in &events {
            if engine.store.apply_catalog(event) {
                continue;
            }
            let Some(rs) = event_slot_id(event).and_then(|id| engine.store.slot(&id)) else {
                skipped += 1;
                continue;
            };
            let mut guard = rs.try_write().expect("replay: uncontended write");
            engine.store.apply_to_slot(&mut guard, event);
        }
        if skipped > 0 {
            warn!("replay skipped {skipped} events for slots that no longer exist");
        }

        Ok(engine)
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply to a slot the caller holds the write lock on.
    pub(super) async fn persist_to_slot(&self, rs: &mut SlotState, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_to_slot(rs, event);
        Ok(())
    }

    /// WAL-append then apply a catalog event. Caller holds `catalog_lock`.
    pub(super) async fn persist_catalog(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_catalog(event);
        Ok(())
    }

    /// Compact the WAL down to the events needed to recreate the current state.
    ///
    /// Holds the catalog lock and a read lock on every slot until the writer
    /// has swapped files, so no append can land in the old file after its slot
    /// was snapshotted.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;

        let mut events = Vec::new();
        let mut task_ids = self.store.task_ids();
        task_ids.sort();
        for id in &task_ids {
            let Some(task) = self.store.task(id) else { continue };
            events.push(Event::TaskCreated {
                id: task.id,
                merchant_id: task.merchant_id,
                cancel_deadline_ms: task.cancel_deadline_ms,
            });
            if task.status != TaskStatus::Active {
                events.push(Event::TaskStatusChanged {
                    id: task.id,
                    status: task.status,
                });
            }
        }

        let mut slots = self.store.all_slots();
        let mut guards = Vec::with_capacity(slots.len());
        for rs in slots.drain(..) {
            guards.push(rs.read_owned().await);
        }
        guards.sort_by_key(|g| g.id);
        for guard in &guards {
            events.push(Event::SlotCreated {
                id: guard.id,
                task_id: guard.task_id,
                span: guard.span,
                capacity: guard.capacity,
            });
            for booking in &guard.bookings {
                events.push(Event::BookingReserved {
                    booking: booking.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(guards);
        result
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

/// The slot a slot-level event applies to.
fn event_slot_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::BookingReserved { booking } => Some(booking.slot_id),
        Event::BookingTransitioned { slot_id, .. }
        | Event::ReminderSent { slot_id, .. }
        | Event::BookingArchived { slot_id, .. }
        | Event::BookingPurged { slot_id, .. } => Some(*slot_id),
        Event::TaskCreated { .. }
        | Event::TaskStatusChanged { .. }
        | Event::TaskDeadlineChanged { .. }
        | Event::TaskDeleted { .. }
        | Event::SlotCreated { .. } => None,
    }
}
