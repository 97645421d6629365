use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::availability::{check_capacity, check_guests, validate_request};
use super::{apply_to_listing, Engine, EngineError, WalCommand};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

fn outcome_label(result: &Result<Booking, EngineError>) -> &'static str {
    match result {
        Ok(_) => "confirmed",
        Err(EngineError::CapacityExceeded(_)) => "capacity_exceeded",
        Err(EngineError::GuestLimitExceeded { .. }) => "guest_limit_exceeded",
        Err(EngineError::Conflict(_)) => "conflict",
        Err(EngineError::ListingNotFound(_)) => "listing_not_found",
        Err(EngineError::Validation(_)) => "invalid",
        Err(_) => "error",
    }
}

impl Engine {
    pub async fn create_listing(&self, listing: ListingInfo) -> Result<(), EngineError> {
        let admin = self.catalog_lock.clone().lock_owned().await;
        self.catalog.validate(&listing)?;

        let catalog = self.catalog.clone();
        let store = self.store.clone();
        let name = listing.name.clone();
        let id = listing.id;
        self.commit(Event::ListingCreated { listing }, move |event| {
            let _admin = admin;
            if let Event::ListingCreated { listing } = event {
                store.register(listing.id);
                catalog.insert(listing.clone());
            }
        })
        .await?;
        tracing::info!("listing {id} created ({name})");
        Ok(())
    }

    /// Only the listing's host can delete it, and only once it has neither a
    /// confirmed booking nor an occupied night. Its cancelled bookings stay in
    /// the ledger.
    pub async fn delete_listing(&self, id: Ulid, requester: &str) -> Result<(), EngineError> {
        let admin = self.catalog_lock.clone().lock_owned().await;
        let mut guard = self.store.lock(id).await?;
        if guard.is_retired() {
            return Err(EngineError::ListingNotFound(id));
        }
        if self.catalog.require(&id)?.host != requester {
            return Err(EngineError::NotHost(id));
        }
        // Bookings only change status under this guard.
        if !guard.is_empty() || self.ledger.has_confirmed(&id) {
            return Err(EngineError::HasBookings(id));
        }

        let catalog = self.catalog.clone();
        let store = self.store.clone();
        self.commit(Event::ListingDeleted { id }, move |_| {
            let _admin = admin;
            store.retire(&mut guard);
            catalog.remove(&id);
        })
        .await?;
        tracing::info!("listing {id} deleted");
        Ok(())
    }

    /// Reserve every night of `request.range` for a new confirmed booking.
    ///
    /// Validation runs against a snapshot; the commit only lands if the
    /// listing's version is unchanged, otherwise the whole attempt is redone
    /// (at most `MAX_COMMIT_ATTEMPTS` times).
    pub async fn reserve(&self, request: BookingRequest) -> Result<Booking, EngineError> {
        let result = self.reserve_with_retry(&request).await;
        metrics::counter!(observability::RESERVATIONS_TOTAL, "outcome" => outcome_label(&result))
            .increment(1);
        result
    }

    async fn reserve_with_retry(&self, request: &BookingRequest) -> Result<Booking, EngineError> {
        validate_request(&request.range, request.guests)?;
        let mut attempt = 1;
        loop {
            match self.try_reserve(request).await {
                Err(EngineError::Conflict(listing_id)) if attempt < MAX_COMMIT_ATTEMPTS => {
                    metrics::counter!(observability::COMMIT_CONFLICTS_TOTAL).increment(1);
                    tracing::debug!(
                        "reserve on listing {listing_id} lost a commit race (attempt {attempt})"
                    );
                    attempt += 1;
                    tokio::task::yield_now().await;
                }
                Err(EngineError::Conflict(listing_id)) => {
                    metrics::counter!(observability::COMMIT_CONFLICTS_TOTAL).increment(1);
                    tracing::warn!(
                        "reserve on listing {listing_id} gave up after {attempt} conflicting attempts"
                    );
                    return Err(EngineError::Conflict(listing_id));
                }
                other => return other,
            }
        }
    }

    async fn try_reserve(&self, request: &BookingRequest) -> Result<Booking, EngineError> {
        let listing = self.catalog.require(&request.listing_id)?;
        check_guests(&listing, request.guests)?;

        let (counts, version) = self.store.snapshot(listing.id, &request.range).await?;
        check_capacity(&counts, &request.range, listing.total_spots)?;

        let booking = Booking {
            id: Ulid::new(),
            listing_id: listing.id,
            user_id: request.user_id.clone(),
            range: request.range,
            guests: request.guests,
            total_price: request.total_price,
            status: BookingStatus::Confirmed,
            created_at: now_ms(),
            cancelled_at: None,
        };
        self.ledger.validate(&booking)?;

        let mut guard = self.store.lock(listing.id).await?;
        guard.check_version(version)?;

        let ledger = self.ledger.clone();
        self.commit(Event::BookingConfirmed { booking: booking.clone() }, move |event| {
            apply_to_listing(&mut guard, &ledger, event);
        })
        .await?;

        tracing::debug!(
            "booking {} confirmed on listing {} for {}",
            booking.id,
            listing.id,
            booking.range
        );
        Ok(booking)
    }

    /// Give back one spot on every night of `range`. Nights already at zero
    /// are left alone.
    ///
    /// Not tied to a booking: calling this twice for the same stay releases
    /// twice. Cancellation goes through [`Engine::cancel`], which cannot.
    pub async fn release(&self, listing_id: Ulid, range: DayRange) -> Result<(), EngineError> {
        validate_request(&range, 1)?;
        let mut guard = self.store.lock(listing_id).await?;
        if guard.is_retired() {
            return Err(EngineError::ListingNotFound(listing_id));
        }

        let ledger = self.ledger.clone();
        self.commit(Event::NightsReleased { listing_id, range }, move |event| {
            apply_to_listing(&mut guard, &ledger, event);
        })
        .await
    }

    /// Cancel a confirmed booking owned by `requester`, returning it with its
    /// nights released.
    pub async fn cancel(&self, booking_id: Ulid, requester: &str) -> Result<Booking, EngineError> {
        let booking = self.ledger.find_by_id(&booking_id)?;
        if booking.user_id != requester {
            return Err(EngineError::Unauthorized(booking_id));
        }
        if !booking.is_confirmed() {
            return Err(EngineError::AlreadyCancelled(booking_id));
        }

        let mut guard = self.store.lock(booking.listing_id).await?;
        if guard.is_retired() {
            return Err(EngineError::ListingNotFound(booking.listing_id));
        }
        // Status only changes under this guard, so this is the authoritative check.
        self.ledger
            .check_transition(&booking_id, BookingStatus::Cancelled)?;

        let event = Event::BookingCancelled {
            id: booking_id,
            listing_id: booking.listing_id,
            range: booking.range,
            at: now_ms(),
        };
        let ledger = self.ledger.clone();
        self.commit(event, move |event| {
            apply_to_listing(&mut guard, &ledger, event);
        })
        .await?;

        tracing::debug!("booking {booking_id} cancelled by {requester}");
        self.ledger.find_by_id(&booking_id)
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate
    /// the current state: listings, every booking as recorded, and each
    /// listing's occupancy.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Holding every listing guard means no commit is in flight, and every
        // earlier commit has been both flushed and applied.
        let _admin = self.catalog_lock.clone().lock_owned().await;
        let mut listing_ids = self.store.listing_ids();
        listing_ids.sort();
        let mut guards = Vec::with_capacity(listing_ids.len());
        for id in &listing_ids {
            if let Some(occ) = self.store.get(id) {
                guards.push(occ.write_owned().await);
            }
        }

        let mut events = Vec::new();
        for listing in self.catalog.list() {
            events.push(Event::ListingCreated { listing });
        }
        for booking in self.ledger.all() {
            events.push(Event::BookingRecorded { booking });
        }
        for guard in &guards {
            if !guard.is_empty() {
                events.push(Event::OccupancyRestored {
                    listing_id: guard.listing_id,
                    counts: guard.iter().collect(),
                });
            }
        }
        let count = events.len();

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!("WAL compacted to {count} events");
        Ok(())
    }
}
