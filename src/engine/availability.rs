use std::collections::BTreeMap;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Stay length and guest count sanity, before any listing is consulted.
pub fn validate_request(range: &DayRange, guests: u32) -> Result<(), EngineError> {
    if range.check_in > range.check_out {
        return Err(EngineError::Validation("check-in is after check-out".into()));
    }
    if range.nights() > MAX_STAY_NIGHTS {
        return Err(EngineError::Validation(format!(
            "stay of {} nights exceeds {MAX_STAY_NIGHTS}",
            range.nights()
        )));
    }
    if guests == 0 {
        return Err(EngineError::Validation("number of guests must be positive".into()));
    }
    Ok(())
}

pub fn check_guests(listing: &ListingInfo, guests: u32) -> Result<(), EngineError> {
    if guests > listing.max_guests {
        return Err(EngineError::GuestLimitExceeded {
            requested: guests,
            max: listing.max_guests,
        });
    }
    Ok(())
}

/// Every night in `range` must have at least one free spot. Reports the
/// earliest full night.
pub fn check_capacity(
    counts: &BTreeMap<Day, u32>,
    range: &DayRange,
    total_spots: u32,
) -> Result<(), EngineError> {
    for day in range.days() {
        let booked = counts.get(&day).copied().unwrap_or(0);
        if total_spots.saturating_sub(booked) < 1 {
            return Err(EngineError::CapacityExceeded(day));
        }
    }
    Ok(())
}

/// One signed delta per night of `range`.
pub fn nightly_deltas(range: &DayRange, delta: i64) -> BTreeMap<Day, i64> {
    range.days().map(|d| (d, delta)).collect()
}

/// Dense per-night view of a sparse snapshot.
pub fn nightly_availability(
    counts: &BTreeMap<Day, u32>,
    range: &DayRange,
    total_spots: u32,
) -> Vec<NightAvailability> {
    range
        .days()
        .map(|day| {
            let booked = counts.get(&day).copied().unwrap_or(0);
            NightAvailability {
                day,
                booked,
                remaining: total_spots.saturating_sub(booked),
            }
        })
        .collect()
}
