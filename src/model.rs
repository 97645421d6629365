use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Used for audit timestamps only; nights are [`Day`]s.
pub type Ms = i64;

/// Calendar-day key: a date with the time of day discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Day(NaiveDate);

impl Day {
    pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(Day)
    }

    /// Parse `YYYY-MM-DD`, or a full timestamp truncated to its UTC date.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            return Some(Day(d));
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(Day(dt.with_timezone(&Utc).date_naive()));
        }
        for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
                return Some(Day(dt.date()));
            }
        }
        None
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    pub fn next(&self) -> Option<Day> {
        self.0.succ_opt().map(Day)
    }
}

impl fmt::Display for Day {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

impl From<NaiveDate> for Day {
    fn from(d: NaiveDate) -> Self {
        Day(d)
    }
}

/// Closed interval `[check_in, check_out]` of nights. The departure night is
/// booked too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayRange {
    pub check_in: Day,
    pub check_out: Day,
}

impl DayRange {
    /// Returns `None` when `check_in > check_out`.
    pub fn new(check_in: Day, check_out: Day) -> Option<Self> {
        (check_in <= check_out).then_some(Self { check_in, check_out })
    }

    /// Single-night range.
    pub fn single(day: Day) -> Self {
        Self { check_in: day, check_out: day }
    }

    pub fn nights(&self) -> u32 {
        let n = (self.check_out.0 - self.check_in.0).num_days() + 1;
        u32::try_from(n.max(0)).unwrap_or(u32::MAX)
    }

    pub fn contains(&self, day: Day) -> bool {
        self.check_in <= day && day <= self.check_out
    }

    pub fn days(&self) -> DayIter {
        DayIter {
            next: Some(self.check_in),
            last: self.check_out,
        }
    }
}

impl fmt::Display for DayRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.check_in, self.check_out)
    }
}

/// Yields every calendar day of a [`DayRange`] in order, both ends included.
#[derive(Debug, Clone)]
pub struct DayIter {
    next: Option<Day>,
    last: Day,
}

impl Iterator for DayIter {
    type Item = Day;

    fn next(&mut self) -> Option<Day> {
        let cur = self.next?;
        if cur > self.last {
            self.next = None;
            return None;
        }
        self.next = if cur == self.last { None } else { cur.next() };
        Some(cur)
    }
}

/// Catalog attributes of a listing. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingInfo {
    pub id: Ulid,
    pub name: String,
    /// Spots available per calendar night.
    pub total_spots: u32,
    pub max_guests: u32,
    /// Minor currency units. Informational; never used to price a booking.
    pub price_per_night: i64,
    /// Login user that created the listing. Only they may delete it.
    pub host: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub listing_id: Ulid,
    pub user_id: String,
    pub range: DayRange,
    pub guests: u32,
    /// Caller-supplied, stored as received.
    pub total_price: Option<i64>,
    pub status: BookingStatus,
    pub created_at: Ms,
    pub cancelled_at: Option<Ms>,
}

impl Booking {
    pub fn is_confirmed(&self) -> bool {
        self.status == BookingStatus::Confirmed
    }
}

/// What a guest asks for. The engine assigns id, status and timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub listing_id: Ulid,
    pub user_id: String,
    pub range: DayRange,
    pub guests: u32,
    pub total_price: Option<i64>,
}

/// The event types, flat with no nesting. This is the WAL record format.
///
/// Each record is one commit: a booking event carries both the ledger change
/// and the nights it moves, so replay rebuilds occupancy and ledger together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ListingCreated {
        listing: ListingInfo,
    },
    ListingDeleted {
        id: Ulid,
    },
    BookingConfirmed {
        booking: Booking,
    },
    BookingCancelled {
        id: Ulid,
        listing_id: Ulid,
        range: DayRange,
        at: Ms,
    },
    NightsReleased {
        listing_id: Ulid,
        range: DayRange,
    },
    /// Compaction only: ledger entry without an occupancy effect.
    BookingRecorded {
        booking: Booking,
    },
    /// Compaction only: occupancy of a listing as of the compaction point.
    OccupancyRestored {
        listing_id: Ulid,
        counts: Vec<(Day, u32)>,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NightAvailability {
    pub day: Day,
    pub booked: u32,
    pub remaining: u32,
}

/// A booking resolved against its listing (absent once the listing is deleted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingView {
    pub booking: Booking,
    pub listing: Option<ListingInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Day {
        Day::parse(s).unwrap()
    }

    #[test]
    fn parse_plain_date() {
        assert_eq!(d("2024-01-01"), Day::from_ymd(2024, 1, 1).unwrap());
    }

    #[test]
    fn parse_truncates_time_of_day() {
        assert_eq!(d("2024-01-01T23:30:00Z"), Day::from_ymd(2024, 1, 1).unwrap());
        assert_eq!(d("2024-03-05T10:00:00"), Day::from_ymd(2024, 3, 5).unwrap());
        assert_eq!(d("2024-03-05 10:00:00"), Day::from_ymd(2024, 3, 5).unwrap());
    }

    #[test]
    fn parse_offset_converts_to_utc_first() {
        // 01:00 at +02:00 is still the previous day in UTC.
        assert_eq!(d("2024-06-10T01:00:00+02:00"), Day::from_ymd(2024, 6, 9).unwrap());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Day::parse("tomorrow").is_none());
        assert!(Day::parse("2024-02-30").is_none());
    }

    #[test]
    fn range_rejects_reversed_dates() {
        assert!(DayRange::new(d("2024-01-02"), d("2024-01-01")).is_none());
    }

    #[test]
    fn range_is_inclusive() {
        let r = DayRange::new(d("2024-01-01"), d("2024-01-03")).unwrap();
        let days: Vec<String> = r.days().map(|d| d.to_string()).collect();
        assert_eq!(days, vec!["2024-01-01", "2024-01-02", "2024-01-03"]);
        assert_eq!(r.nights(), 3);
        assert!(r.contains(d("2024-01-03")));
        assert!(!r.contains(d("2024-01-04")));
    }

    #[test]
    fn single_night_range() {
        let r = DayRange::single(d("2024-01-01"));
        assert_eq!(r.days().count(), 1);
        assert_eq!(r.nights(), 1);
    }

    #[test]
    fn range_crosses_month_and_leap_day() {
        let r = DayRange::new(d("2024-02-28"), d("2024-03-01")).unwrap();
        let days: Vec<String> = r.days().map(|d| d.to_string()).collect();
        assert_eq!(days, vec!["2024-02-28", "2024-02-29", "2024-03-01"]);
    }
}
