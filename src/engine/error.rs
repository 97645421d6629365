use ulid::Ulid;

use crate::model::Day;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    Validation(String),
    ListingNotFound(Ulid),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    GuestLimitExceeded { requested: u32, max: u32 },
    CapacityExceeded(Day),
    Unauthorized(Ulid),
    NotHost(Ulid),
    AlreadyCancelled(Ulid),
    /// Lost the optimistic commit race on a listing. Safe to retry.
    Conflict(Ulid),
    HasBookings(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Conflict(_))
    }

    /// SQLSTATE reported to wire clients.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "22023",
            EngineError::ListingNotFound(_) | EngineError::NotFound(_) => "P0002",
            EngineError::AlreadyExists(_) => "23505",
            EngineError::GuestLimitExceeded { .. } => "23514",
            EngineError::CapacityExceeded(_) => "23P01",
            EngineError::Unauthorized(_) | EngineError::NotHost(_) => "42501",
            EngineError::AlreadyCancelled(_) => "55000",
            EngineError::Conflict(_) => "40001",
            EngineError::HasBookings(_) => "2BP01",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::WalError(_) => "XX000",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::ListingNotFound(id) => write!(f, "listing not found: {id}"),
            EngineError::NotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::GuestLimitExceeded { requested, max } => {
                write!(f, "maximum {max} guests allowed, requested {requested}")
            }
            EngineError::CapacityExceeded(day) => write!(f, "no spots available for {day}"),
            EngineError::Unauthorized(id) => write!(f, "not the owner of booking {id}"),
            EngineError::NotHost(id) => write!(f, "only the host may delete listing {id}"),
            EngineError::AlreadyCancelled(id) => write!(f, "booking {id} is already cancelled"),
            EngineError::Conflict(id) => {
                write!(f, "concurrent update on listing {id}, retry the request")
            }
            EngineError::HasBookings(id) => {
                write!(f, "cannot delete listing {id}: it has confirmed bookings")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
