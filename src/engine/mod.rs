mod availability;
mod catalog;
mod error;
mod ledger;
mod mutations;
mod queries;
mod store;

pub use availability::{check_capacity, check_guests, nightly_availability, nightly_deltas, validate_request};
pub use catalog::ListingCatalog;
pub use error::EngineError;
pub use ledger::BookingLedger;
pub use store::{AvailabilityStore, Occupancy, SharedOccupancy, Version};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

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

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                if let Err(ref e) = result {
                    tracing::error!("WAL flush of {} events failed: {e}", batch.len());
                }
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if result.is_err() {
        // Every caller in the batch hears about the failure, so none of its
        // records may survive into a later replay.
        if let Err(e) = wal.rollback() {
            tracing::error!("WAL rollback failed, refusing further appends: {e}");
        }
    }
    result
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
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
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// Write one event through the group-commit writer and wait for the fsync.
async fn wal_append(wal_tx: &mpsc::Sender<WalCommand>, event: &Event) -> Result<(), EngineError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
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

/// The per-tenant reservation engine.
///
/// Occupancy, ledger and catalog are in-memory projections of the WAL. Every
/// mutation is one WAL record applied under the affected listing's write
/// guard, so occupancy and the confirmed-booking set never drift apart.
pub struct Engine {
    pub catalog: Arc<ListingCatalog>,
    pub store: Arc<AvailabilityStore>,
    pub ledger: Arc<BookingLedger>,
    /// Serializes listing create/delete and compaction.
    pub(super) catalog_lock: Arc<Mutex<()>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
}

/// Apply a booking-level event to a listing's occupancy and the ledger.
/// No locking: the caller holds the listing's write guard.
fn apply_to_listing(occ: &mut Occupancy, ledger: &BookingLedger, event: &Event) {
    match event {
        Event::BookingConfirmed { booking } => {
            occ.apply_unchecked(&nightly_deltas(&booking.range, 1));
            ledger.insert(booking.clone());
        }
        Event::BookingCancelled { id, range, at, .. } => {
            occ.apply_unchecked(&nightly_deltas(range, -1));
            ledger.set_status(id, BookingStatus::Cancelled, *at);
        }
        Event::NightsReleased { range, .. } => {
            occ.apply_unchecked(&nightly_deltas(range, -1));
        }
        Event::OccupancyRestored { counts, .. } => occ.restore(counts),
        // Catalog-level and ledger-only events are handled by the caller.
        Event::ListingCreated { .. }
        | Event::ListingDeleted { .. }
        | Event::BookingRecorded { .. } => {}
    }
}

/// Listing whose occupancy an event touches, if any.
fn event_listing_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::BookingConfirmed { booking } => Some(booking.listing_id),
        Event::BookingCancelled { listing_id, .. }
        | Event::NightsReleased { listing_id, .. }
        | Event::OccupancyRestored { listing_id, .. } => Some(*listing_id),
        Event::ListingCreated { .. }
        | Event::ListingDeleted { .. }
        | Event::BookingRecorded { .. } => None,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            catalog: Arc::new(ListingCatalog::new()),
            store: Arc::new(AvailabilityStore::new()),
            ledger: Arc::new(BookingLedger::new()),
            catalog_lock: Arc::new(Mutex::new(())),
            wal_tx,
        };

        // Replay runs before anyone else holds these Arcs, so try_write never
        // contends. Never block_on here: this may run inside an async context
        // (lazy tenant creation).
        for event in &events {
            engine.replay_event(event)?;
        }
        if !events.is_empty() {
            tracing::info!(
                "replayed {} WAL events: {} listings, {} bookings",
                events.len(),
                engine.catalog.len(),
                engine.ledger.len()
            );
        }

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) -> io::Result<()> {
        match event {
            Event::ListingCreated { listing } => {
                self.store.register(listing.id);
                self.catalog.insert(listing.clone());
            }
            Event::ListingDeleted { id } => {
                if let Some(occ) = self.store.get(id) {
                    let mut guard = occ
                        .try_write_owned()
                        .map_err(|_| io::Error::other("replay: contended listing"))?;
                    self.store.retire(&mut guard);
                }
                self.catalog.remove(id);
            }
            Event::BookingRecorded { booking } => self.ledger.insert(booking.clone()),
            other => {
                let Some(listing_id) = event_listing_id(other) else {
                    return Ok(());
                };
                match self.store.get(&listing_id) {
                    Some(occ) => {
                        let mut guard = occ
                            .try_write()
                            .map_err(|_| io::Error::other("replay: contended listing"))?;
                        apply_to_listing(&mut guard, &self.ledger, other);
                    }
                    None => {
                        tracing::warn!("replay: event for unknown listing {listing_id} skipped");
                    }
                }
            }
        }
        Ok(())
    }

    /// Make `event` durable, then run `apply`.
    ///
    /// Runs as its own task: once the event is handed to the WAL writer the
    /// in-memory apply happens even if the requesting connection goes away, so
    /// the log and the projections cannot split. Whatever `apply` captures
    /// (typically the listing's owned write guard) is held until it finishes.
    pub(super) async fn commit<T, F>(&self, event: Event, apply: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Event) -> T + Send + 'static,
        T: Send + 'static,
    {
        let wal_tx = self.wal_tx.clone();
        tokio::spawn(async move {
            wal_append(&wal_tx, &event).await?;
            Ok(apply(&event))
        })
        .await
        .map_err(|e| EngineError::WalError(format!("commit task aborted: {e}")))?
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
