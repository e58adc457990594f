// Hard caps that keep a single request from doing unbounded work.

pub const MAX_BRANCHES: usize = 256;
pub const MAX_VENUES: usize = 1024;
pub const MAX_BOOKINGS_PER_VENUE: usize = 200_000;
pub const MAX_WAITLIST_ENTRIES: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_STATUS_ID_LEN: usize = 64;

/// Occurrences a single repeat request may project.
pub const MAX_RECURRENCE_COUNT: u32 = 104;

pub const MIN_MATCH_PLAYERS: u32 = 2;
pub const MAX_MATCH_PLAYERS: u32 = 16;

/// Widest date range accepted by the dashboard (the baseline doubles it).
pub const MAX_STATS_RANGE_DAYS: i64 = 366;

/// Rows in the top-users / top-venues tables.
pub const TOP_N: usize = 10;
