use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{check_capacity, check_guests, nightly_availability, validate_request};
use super::{Engine, EngineError};

impl Engine {
    /// Would a booking for `guests` over `range` fit right now? Read-only.
    pub async fn check_availability(
        &self,
        listing_id: Ulid,
        range: DayRange,
        guests: u32,
    ) -> Result<(), EngineError> {
        validate_request(&range, guests)?;
        let listing = self.catalog.require(&listing_id)?;
        check_guests(&listing, guests)?;
        let (counts, _) = self.store.snapshot(listing_id, &range).await?;
        check_capacity(&counts, &range, listing.total_spots)
    }

    /// Booked and remaining spots for each night of `range`.
    pub async fn nightly_availability(
        &self,
        listing_id: Ulid,
        range: DayRange,
    ) -> Result<Vec<NightAvailability>, EngineError> {
        if range.nights() > MAX_QUERY_DAYS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let listing = self.catalog.require(&listing_id)?;
        let (counts, _) = self.store.snapshot(listing_id, &range).await?;
        Ok(nightly_availability(&counts, &range, listing.total_spots))
    }

    /// Every occupied night of a listing, in day order.
    pub async fn occupancy(&self, listing_id: Ulid) -> Result<Vec<(Day, u32)>, EngineError> {
        let occ = self
            .store
            .get(&listing_id)
            .ok_or(EngineError::ListingNotFound(listing_id))?;
        let guard = occ.read().await;
        Ok(guard.iter().collect())
    }

    pub fn list_listings(&self) -> Vec<ListingInfo> {
        self.catalog.list()
    }

    pub fn booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.ledger.find_by_id(&id)
    }

    /// A user's bookings, newest first, each with its listing if it still exists.
    pub fn bookings_for_user(&self, user_id: &str) -> Vec<BookingView> {
        self.ledger
            .find_by_user(user_id)
            .into_iter()
            .map(|booking| {
                let listing = self.catalog.get(&booking.listing_id);
                BookingView { booking, listing }
            })
            .collect()
    }
}
