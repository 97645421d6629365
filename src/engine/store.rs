use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Optimistic concurrency token for one listing's occupancy.
pub type Version = u64;

pub type SharedOccupancy = Arc<RwLock<Occupancy>>;

/// Sparse per-night counters for one listing. Absent day means zero booked.
#[derive(Debug, Clone)]
pub struct Occupancy {
    pub listing_id: Ulid,
    counts: BTreeMap<Day, u32>,
    version: Version,
    /// Set once the listing is deleted; every later commit conflicts.
    retired: bool,
}

impl Occupancy {
    pub fn new(listing_id: Ulid) -> Self {
        Self {
            listing_id,
            counts: BTreeMap::new(),
            version: 0,
            retired: false,
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    pub fn count(&self, day: Day) -> u32 {
        self.counts.get(&day).copied().unwrap_or(0)
    }

    /// Occupied nights inside `range`. Still sparse.
    pub fn counts_in(&self, range: &DayRange) -> BTreeMap<Day, u32> {
        self.counts
            .range(range.check_in..=range.check_out)
            .map(|(d, c)| (*d, *c))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Day, u32)> + '_ {
        self.counts.iter().map(|(d, c)| (*d, *c))
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Reject the commit unless nobody else committed since `expected` was read.
    pub fn check_version(&self, expected: Version) -> Result<(), EngineError> {
        if self.retired || self.version != expected {
            return Err(EngineError::Conflict(self.listing_id));
        }
        Ok(())
    }

    /// Apply every delta or none. Returns the new version.
    pub fn apply_delta(
        &mut self,
        deltas: &BTreeMap<Day, i64>,
        expected: Version,
    ) -> Result<Version, EngineError> {
        self.check_version(expected)?;
        Ok(self.apply_unchecked(deltas))
    }

    /// Version-blind apply, for WAL replay and for callers that already ran
    /// `check_version` under the same write guard.
    pub fn apply_unchecked(&mut self, deltas: &BTreeMap<Day, i64>) -> Version {
        for (day, delta) in deltas {
            let cur = i64::from(self.count(*day));
            let next = (cur + delta).clamp(0, i64::from(u32::MAX)) as u32;
            if next == 0 {
                self.counts.remove(day);
            } else {
                self.counts.insert(*day, next);
            }
        }
        self.version += 1;
        self.version
    }

    /// Replace all counters. Compaction replay only.
    pub fn restore(&mut self, counts: &[(Day, u32)]) {
        self.counts = counts
            .iter()
            .filter(|(_, c)| *c > 0)
            .copied()
            .collect();
        self.version += 1;
    }

    fn retire(&mut self) {
        self.retired = true;
        self.version += 1;
    }
}

/// Per-listing occupancy counters.
pub struct AvailabilityStore {
    listings: DashMap<Ulid, SharedOccupancy>,
}

impl Default for AvailabilityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AvailabilityStore {
    pub fn new() -> Self {
        Self {
            listings: DashMap::new(),
        }
    }

    pub fn register(&self, listing_id: Ulid) {
        self.listings
            .entry(listing_id)
            .or_insert_with(|| Arc::new(RwLock::new(Occupancy::new(listing_id))));
    }

    pub fn get(&self, listing_id: &Ulid) -> Option<SharedOccupancy> {
        self.listings.get(listing_id).map(|e| e.value().clone())
    }

    pub fn listing_ids(&self) -> Vec<Ulid> {
        self.listings.iter().map(|e| *e.key()).collect()
    }

    /// Consistent read of the nights in `range` plus the version they belong to.
    pub async fn snapshot(
        &self,
        listing_id: Ulid,
        range: &DayRange,
    ) -> Result<(BTreeMap<Day, u32>, Version), EngineError> {
        let occ = self
            .get(&listing_id)
            .ok_or(EngineError::ListingNotFound(listing_id))?;
        let guard = occ.read().await;
        if guard.is_retired() {
            return Err(EngineError::ListingNotFound(listing_id));
        }
        Ok((guard.counts_in(range), guard.version()))
    }

    /// Write guard for a commit section. The caller still has to check the version.
    pub async fn lock(
        &self,
        listing_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<Occupancy>, EngineError> {
        let occ = self
            .get(&listing_id)
            .ok_or(EngineError::ListingNotFound(listing_id))?;
        Ok(occ.write_owned().await)
    }

    pub async fn apply_delta(
        &self,
        listing_id: Ulid,
        deltas: &BTreeMap<Day, i64>,
        expected: Version,
    ) -> Result<Version, EngineError> {
        let mut guard = self.lock(listing_id).await?;
        guard.apply_delta(deltas, expected)
    }

    /// Mark retired (bumping the version) and drop from the index.
    pub fn retire(&self, guard: &mut OwnedRwLockWriteGuard<Occupancy>) {
        guard.retire();
        self.listings.remove(&guard.listing_id);
    }
}
