use dashmap::DashMap;
use ulid::Ulid;

use crate::limits::*;
use crate::model::ListingInfo;

use super::EngineError;

/// Listing attributes the engine reads but never changes.
pub struct ListingCatalog {
    listings: DashMap<Ulid, ListingInfo>,
}

impl Default for ListingCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl ListingCatalog {
    pub fn new() -> Self {
        Self {
            listings: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.listings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listings.is_empty()
    }

    pub fn get(&self, id: &Ulid) -> Option<ListingInfo> {
        self.listings.get(id).map(|e| e.value().clone())
    }

    pub fn require(&self, id: &Ulid) -> Result<ListingInfo, EngineError> {
        self.get(id).ok_or(EngineError::ListingNotFound(*id))
    }

    pub fn validate(&self, listing: &ListingInfo) -> Result<(), EngineError> {
        if self.listings.len() >= MAX_LISTINGS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many listings"));
        }
        if listing.host.is_empty() {
            return Err(EngineError::Validation("listing host is required".into()));
        }
        if listing.host.len() > MAX_USER_ID_LEN {
            return Err(EngineError::LimitExceeded("host id too long"));
        }
        if listing.name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("listing name too long"));
        }
        if listing.total_spots == 0 {
            return Err(EngineError::Validation("total_spots must be positive".into()));
        }
        if listing.max_guests == 0 {
            return Err(EngineError::Validation("max_guests must be positive".into()));
        }
        if listing.price_per_night < 0 {
            return Err(EngineError::Validation("price_per_night must not be negative".into()));
        }
        if self.listings.contains_key(&listing.id) {
            return Err(EngineError::AlreadyExists(listing.id));
        }
        Ok(())
    }

    pub(super) fn insert(&self, listing: ListingInfo) {
        self.listings.insert(listing.id, listing);
    }

    pub(super) fn remove(&self, id: &Ulid) -> Option<ListingInfo> {
        self.listings.remove(id).map(|(_, l)| l)
    }

    /// Sorted by id, i.e. creation order for engine-minted ids.
    pub fn list(&self) -> Vec<ListingInfo> {
        let mut out: Vec<ListingInfo> = self.listings.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|l| l.id);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(spots: u32, guests: u32, price: i64) -> ListingInfo {
        ListingInfo {
            id: Ulid::new(),
            name: "Aspen".into(),
            total_spots: spots,
            max_guests: guests,
            price_per_night: price,
            host: "host".into(),
        }
    }

    #[test]
    fn validate_rejects_degenerate_listings() {
        let catalog = ListingCatalog::new();
        assert!(matches!(catalog.validate(&info(0, 2, 0)), Err(EngineError::Validation(_))));
        assert!(matches!(catalog.validate(&info(2, 0, 0)), Err(EngineError::Validation(_))));
        assert!(matches!(catalog.validate(&info(2, 2, -1)), Err(EngineError::Validation(_))));
        assert!(catalog.validate(&info(1, 1, 0)).is_ok());
    }

    #[test]
    fn validate_requires_a_host() {
        let catalog = ListingCatalog::new();
        let mut l = info(1, 1, 0);
        l.host = String::new();
        assert!(matches!(catalog.validate(&l), Err(EngineError::Validation(_))));
        l.host = "h".repeat(MAX_USER_ID_LEN + 1);
        assert_eq!(catalog.validate(&l), Err(EngineError::LimitExceeded("host id too long")));
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let catalog = ListingCatalog::new();
        let l = info(2, 2, 100);
        catalog.insert(l.clone());
        assert_eq!(catalog.validate(&l), Err(EngineError::AlreadyExists(l.id)));
    }

    #[test]
    fn require_and_remove() {
        let catalog = ListingCatalog::new();
        let l = info(2, 2, 100);
        catalog.insert(l.clone());
        assert_eq!(catalog.require(&l.id), Ok(l.clone()));
        assert_eq!(catalog.remove(&l.id), Some(l.clone()));
        assert_eq!(catalog.require(&l.id), Err(EngineError::ListingNotFound(l.id)));
        assert!(catalog.is_empty());
    }

    #[test]
    fn list_is_sorted_by_id() {
        let catalog = ListingCatalog::new();
        let mut ids = Vec::new();
        for _ in 0..5 {
            let l = info(1, 1, 0);
            ids.push(l.id);
            catalog.insert(l);
        }
        ids.sort();
        let listed: Vec<Ulid> = catalog.list().into_iter().map(|l| l.id).collect();
        assert_eq!(listed, ids);
        assert_eq!(catalog.len(), 5);
    }
}
