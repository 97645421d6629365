use dashmap::DashMap;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Booking records and their lifecycle. Bookings are never removed.
pub struct BookingLedger {
    bookings: DashMap<Ulid, Booking>,
    /// user id → booking ids, insertion order
    by_user: DashMap<String, Vec<Ulid>>,
}

impl Default for BookingLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl BookingLedger {
    pub fn new() -> Self {
        Self {
            bookings: DashMap::new(),
            by_user: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.bookings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bookings.is_empty()
    }

    /// Required fields and range order. Runs before anything is written.
    pub fn validate(&self, booking: &Booking) -> Result<(), EngineError> {
        if booking.user_id.is_empty() {
            return Err(EngineError::Validation("user id is required".into()));
        }
        if booking.user_id.len() > MAX_USER_ID_LEN {
            return Err(EngineError::LimitExceeded("user id too long"));
        }
        if booking.guests == 0 {
            return Err(EngineError::Validation("number of guests must be positive".into()));
        }
        if booking.range.check_in > booking.range.check_out {
            return Err(EngineError::Validation("check-in is after check-out".into()));
        }
        if self.bookings.contains_key(&booking.id) {
            return Err(EngineError::AlreadyExists(booking.id));
        }
        Ok(())
    }

    pub fn create(&self, booking: Booking) -> Result<Ulid, EngineError> {
        self.validate(&booking)?;
        let id = booking.id;
        self.insert(booking);
        Ok(id)
    }

    /// Unvalidated insert, for WAL replay.
    pub(super) fn insert(&self, booking: Booking) {
        let id = booking.id;
        self.by_user
            .entry(booking.user_id.clone())
            .or_default()
            .push(id);
        self.bookings.insert(id, booking);
    }

    pub fn find_by_id(&self, id: &Ulid) -> Result<Booking, EngineError> {
        self.bookings
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(*id))
    }

    /// Newest first.
    pub fn find_by_user(&self, user_id: &str) -> Vec<Booking> {
        let ids = self
            .by_user
            .get(user_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut out: Vec<Booking> = ids
            .iter()
            .filter_map(|id| self.bookings.get(id).map(|e| e.value().clone()))
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        out
    }

    /// Only `Confirmed → Cancelled` exists.
    pub fn check_transition(&self, id: &Ulid, to: BookingStatus) -> Result<(), EngineError> {
        let current = self.find_by_id(id)?.status;
        match (current, to) {
            (BookingStatus::Confirmed, BookingStatus::Cancelled) => Ok(()),
            (BookingStatus::Cancelled, _) => Err(EngineError::AlreadyCancelled(*id)),
            (BookingStatus::Confirmed, BookingStatus::Confirmed) => Err(EngineError::Validation(
                format!("booking {id} is already confirmed"),
            )),
        }
    }

    pub fn update_status(&self, id: &Ulid, to: BookingStatus, at: Ms) -> Result<(), EngineError> {
        self.check_transition(id, to)?;
        self.set_status(id, to, at);
        Ok(())
    }

    /// Unchecked transition, for WAL replay.
    pub(super) fn set_status(&self, id: &Ulid, to: BookingStatus, at: Ms) {
        if let Some(mut b) = self.bookings.get_mut(id) {
            b.status = to;
            if to == BookingStatus::Cancelled {
                b.cancelled_at = Some(at);
            }
        }
    }

    pub fn all(&self) -> Vec<Booking> {
        let mut out: Vec<Booking> = self.bookings.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|b| b.id);
        out
    }

    /// Whether any booking on the listing is still confirmed.
    pub fn has_confirmed(&self, listing_id: &Ulid) -> bool {
        self.bookings
            .iter()
            .any(|e| e.value().listing_id == *listing_id && e.value().is_confirmed())
    }

    /// Confirmed bookings on a listing covering `day`.
    #[cfg(test)]
    pub fn confirmed_on(&self, listing_id: &Ulid, day: Day) -> usize {
        self.bookings
            .iter()
            .filter(|e| {
                let b = e.value();
                b.listing_id == *listing_id && b.is_confirmed() && b.range.contains(day)
            })
            .count()
    }
}
