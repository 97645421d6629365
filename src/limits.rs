//! Hard limits. Everything a client can grow is bounded here.

pub const MAX_LISTINGS_PER_TENANT: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_USER_ID_LEN: usize = 128;

/// Longest stay a single booking may cover, in nights.
pub const MAX_STAY_NIGHTS: u32 = 366;
/// Widest per-night availability query, in days.
pub const MAX_QUERY_DAYS: u32 = 731;

/// Optimistic commit attempts before a reservation surfaces `Conflict`.
pub const MAX_COMMIT_ATTEMPTS: usize = 8;

pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 64;
