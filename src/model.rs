use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Weekday};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for creation and audit timestamps.
pub type Ms = i64;

pub const MINUTES_PER_DAY: i64 = 24 * 60;

/// Minutes between two times of day. A range whose end lies before its start
/// crosses midnight and gets a full day added. Every duration in the crate
/// goes through here.
pub fn duration_minutes(start: NaiveTime, end: NaiveTime) -> i64 {
    let raw = minute_of_day(end) - minute_of_day(start);
    if raw < 0 { raw + MINUTES_PER_DAY } else { raw }
}

pub fn minute_of_day(t: NaiveTime) -> i64 {
    i64::from(t.hour()) * 60 + i64::from(t.minute())
}

/// Half-open time-of-day range `[start, end)` within a single day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
}

impl TimeRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "TimeRange start must be before end");
        Self { start, end }
    }

    pub fn try_new(start: NaiveTime, end: NaiveTime) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_minutes(&self) -> i64 {
        duration_minutes(self.start, self.end)
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Touching end-to-start without sharing any minute.
    pub fn is_adjacent(&self, other: &TimeRange) -> bool {
        self.end == other.start || other.end == self.start
    }

    pub fn contains_range(&self, other: &TimeRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// A calendar date plus a time-of-day range. Cross-midnight bookings are two
/// slots on adjacent days, never one wrapping slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub date: NaiveDate,
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
}

impl Slot {
    pub fn new(date: NaiveDate, start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "Slot start must be before end");
        Self { date, start, end }
    }

    pub fn range(&self) -> TimeRange {
        TimeRange { start: self.start, end: self.end }
    }

    pub fn overlaps(&self, other: &Slot) -> bool {
        self.date == other.date && self.range().overlaps(&other.range())
    }

    pub fn is_adjacent(&self, other: &Slot) -> bool {
        self.date == other.date && self.range().is_adjacent(&other.range())
    }

    pub fn starts_at(&self) -> NaiveDateTime {
        self.date.and_time(self.start)
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    NoShow,
}

impl BookingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BookingStatus::Cancelled | BookingStatus::NoShow)
    }

    /// `pending → confirmed`, `confirmed → cancelled`, `confirmed → no_show`.
    /// A pending booking may also be cancelled before it is ever confirmed.
    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Cancelled) | (Confirmed, NoShow)
        )
    }

    /// Cancelled rows no longer hold their slot.
    pub fn occupies_slot(self) -> bool {
        self != BookingStatus::Cancelled
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::NoShow => "no_show",
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BookingType {
    #[default]
    Standard,
    Academy,
}

/// Roster of a booking that has been opened up for other players to join.
/// `players[0]` is whoever opened the match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenMatch {
    pub max_players: u32,
    pub players: Vec<Ulid>,
}

impl OpenMatch {
    pub fn is_full(&self) -> bool {
        self.players.len() >= self.max_players as usize
    }

    pub fn contains(&self, user_id: &Ulid) -> bool {
        self.players.contains(user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub venue_id: Ulid,
    /// `None` only for rows imported by an admin without a customer.
    pub user_id: Option<Ulid>,
    pub date: NaiveDate,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
    pub status: BookingStatus,
    /// Reference into the admin-defined color/label taxonomy.
    pub status_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: BookingType,
    pub total_price: Decimal,
    pub recurrence_id: Option<Ulid>,
    pub open_match: Option<OpenMatch>,
    pub created_at: Ms,
}

impl Booking {
    pub fn slot(&self) -> Slot {
        Slot::new(self.date, self.start_time, self.end_time)
    }

    pub fn range(&self) -> TimeRange {
        TimeRange::new(self.start_time, self.end_time)
    }

    pub fn is_open_match(&self) -> bool {
        self.open_match.is_some()
    }

    pub fn duration_minutes(&self) -> i64 {
        duration_minutes(self.start_time, self.end_time)
    }

    pub fn to_ref(&self) -> BookingRef {
        BookingRef {
            id: self.id,
            venue_id: self.venue_id,
            date: self.date,
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }
}

/// Minimal pointer to a booking, carried by conflict errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRef {
    pub id: Ulid,
    pub venue_id: Ulid,
    pub date: NaiveDate,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
}

// ── Waitlist & audit ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: Ulid,
    pub user_id: Ulid,
    pub venue_id: Ulid,
    pub date: NaiveDate,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
    pub created_at: Ms,
}

impl WaitlistEntry {
    pub fn slot(&self) -> Slot {
        Slot::new(self.date, self.start_time, self.end_time)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingAction {
    Created,
    Updated,
    StatusChanged,
    Deleted,
    OpenMatchConverted,
    PlayerJoined,
    PlayerLeft,
}

/// Write-once audit record with before/after snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingLog {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub action: BookingAction,
    pub actor_id: Ulid,
    pub timestamp: Ms,
    pub before: Option<Booking>,
    pub after: Option<Booking>,
}

// ── Venues ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Venue {
    pub id: Ulid,
    pub branch_id: Ulid,
    pub name: String,
}

/// A venue plus all of its bookings, sorted by `(date, start_time)`.
#[derive(Debug, Clone)]
pub struct VenueState {
    pub venue: Venue,
    pub bookings: Vec<Booking>,
}

impl VenueState {
    pub fn new(venue: Venue) -> Self {
        Self { venue, bookings: Vec::new() }
    }

    /// Insert keeping the `(date, start_time)` order.
    pub fn insert_booking(&mut self, booking: Booking) {
        let key = (booking.date, booking.start_time);
        let pos = self
            .bookings
            .partition_point(|b| (b.date, b.start_time) <= key);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    /// All bookings on `date`, in start order.
    pub fn on_date(&self, date: NaiveDate) -> &[Booking] {
        let lo = self.bookings.partition_point(|b| b.date < date);
        let hi = self.bookings.partition_point(|b| b.date <= date);
        &self.bookings[lo..hi]
    }

    /// Bookings on `date` that still hold their slot.
    pub fn occupying(&self, date: NaiveDate) -> impl Iterator<Item = &Booking> {
        self.on_date(date).iter().filter(|b| b.status.occupies_slot())
    }
}

// ── Actors ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Customer,
}

/// Who is making a request, as supplied by the identity collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Ulid,
    pub role: Role,
}

impl Actor {
    pub fn admin(user_id: Ulid) -> Self {
        Self { user_id, role: Role::Admin }
    }

    pub fn customer(user_id: Ulid) -> Self {
        Self { user_id, role: Role::Customer }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn may_act_for(&self, owner: Option<Ulid>) -> bool {
        self.is_admin() || owner == Some(self.user_id)
    }
}

/// WAL record format. Flat variants, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BranchCreated { id: Ulid, name: String },
    VenueCreated { id: Ulid, branch_id: Ulid, name: String },
    BookingCreated { booking: Booking },
    /// Full after-snapshot; may move the booking to another venue.
    BookingUpdated { booking: Booking },
    BookingDeleted { id: Ulid, venue_id: Ulid },
    WaitlistJoined { entry: WaitlistEntry },
    WaitlistLeft { id: Ulid },
    AuditRecorded { log: BookingLog },
}

pub fn weekday_index(date: NaiveDate) -> usize {
    date.weekday().num_days_from_monday() as usize
}

pub const WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// `HH:MM` on the way out; `HH:MM` or `HH:MM:SS` on the way in.
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn parse(s: &str) -> Result<NaiveTime, chrono::ParseError> {
        NaiveTime::parse_from_str(s, FORMAT).or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
    }

    pub fn serialize<S: Serializer>(t: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&t.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use chrono::NaiveTime;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(t: &Option<NaiveTime>, serializer: S) -> Result<S::Ok, S::Error> {
            match t {
                Some(t) => super::serialize(t, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<NaiveTime>, D::Error> {
            let s: Option<String> = Option::deserialize(deserializer)?;
            s.map(|s| super::parse(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn booking(date: &str, start: NaiveTime, end: NaiveTime) -> Booking {
        Booking {
            id: Ulid::new(),
            venue_id: Ulid::new(),
            user_id: None,
            date: d(date),
            start_time: start,
            end_time: end,
            status: BookingStatus::Confirmed,
            status_id: None,
            kind: BookingType::Standard,
            total_price: Decimal::ZERO,
            recurrence_id: None,
            open_match: None,
            created_at: 0,
        }
    }

    #[test]
    fn range_overlap_is_half_open() {
        let a = TimeRange::new(t(8, 0), t(9, 0));
        let b = TimeRange::new(t(8, 59), t(10, 0));
        let c = TimeRange::new(t(9, 0), t(10, 0));
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(a.is_adjacent(&c));
        assert!(!a.is_adjacent(&b));
    }

    #[test]
    fn range_try_new_rejects_empty_and_inverted() {
        assert!(TimeRange::try_new(t(9, 0), t(9, 0)).is_none());
        assert!(TimeRange::try_new(t(10, 0), t(9, 0)).is_none());
        assert!(TimeRange::try_new(t(9, 0), t(10, 0)).is_some());
    }

    #[test]
    fn range_contains_range() {
        let outer = TimeRange::new(t(8, 0), t(12, 0));
        assert!(outer.contains_range(&TimeRange::new(t(9, 0), t(10, 0))));
        assert!(outer.contains_range(&outer));
        assert!(!outer.contains_range(&TimeRange::new(t(7, 0), t(9, 0))));
    }

    #[test]
    fn slots_on_different_days_never_overlap() {
        let a = Slot::new(d("2024-01-01"), t(8, 0), t(9, 0));
        let b = Slot::new(d("2024-01-02"), t(8, 0), t(9, 0));
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&a));
    }

    #[test]
    fn duration_handles_midnight_crossing() {
        assert_eq!(duration_minutes(t(8, 0), t(9, 30)), 90);
        assert_eq!(duration_minutes(t(23, 0), t(1, 0)), 120);
        assert_eq!(duration_minutes(t(10, 0), t(10, 0)), 0);
    }

    #[test]
    fn status_transitions() {
        use BookingStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Confirmed.can_transition_to(Cancelled));
        assert!(Confirmed.can_transition_to(NoShow));
        assert!(!Cancelled.can_transition_to(Confirmed));
        assert!(!NoShow.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(NoShow));
        assert!(Cancelled.is_terminal() && NoShow.is_terminal());
        assert!(!Cancelled.occupies_slot());
        assert!(NoShow.occupies_slot());
    }

    #[test]
    fn venue_state_keeps_date_start_order() {
        let mut vs = VenueState::new(Venue { id: Ulid::new(), branch_id: Ulid::new(), name: "Court 1".into() });
        vs.insert_booking(booking("2024-01-02", t(8, 0), t(9, 0)));
        vs.insert_booking(booking("2024-01-01", t(18, 0), t(19, 0)));
        vs.insert_booking(booking("2024-01-01", t(10, 0), t(11, 0)));
        let keys: Vec<_> = vs.bookings.iter().map(|b| (b.date, b.start_time)).collect();
        assert_eq!(
            keys,
            vec![
                (d("2024-01-01"), t(10, 0)),
                (d("2024-01-01"), t(18, 0)),
                (d("2024-01-02"), t(8, 0)),
            ]
        );
        assert_eq!(vs.on_date(d("2024-01-01")).len(), 2);
        assert!(vs.on_date(d("2024-01-03")).is_empty());
    }

    #[test]
    fn occupying_skips_cancelled() {
        let mut vs = VenueState::new(Venue { id: Ulid::new(), branch_id: Ulid::new(), name: "Court 1".into() });
        let mut cancelled = booking("2024-01-01", t(8, 0), t(9, 0));
        cancelled.status = BookingStatus::Cancelled;
        vs.insert_booking(cancelled);
        vs.insert_booking(booking("2024-01-01", t(9, 0), t(10, 0)));
        assert_eq!(vs.occupying(d("2024-01-01")).count(), 1);
    }

    #[test]
    fn remove_nonexistent_returns_none() {
        let mut vs = VenueState::new(Venue { id: Ulid::new(), branch_id: Ulid::new(), name: "Court 1".into() });
        vs.insert_booking(booking("2024-01-01", t(8, 0), t(9, 0)));
        assert!(vs.remove_booking(Ulid::new()).is_none());
        assert_eq!(vs.bookings.len(), 1);
    }

    #[test]
    fn hhmm_accepts_both_forms() {
        assert_eq!(hhmm::parse("08:30").unwrap(), t(8, 30));
        assert_eq!(hhmm::parse("08:30:00").unwrap(), t(8, 30));
        assert!(hhmm::parse("8h30").is_err());
    }

    #[test]
    fn booking_json_uses_short_times() {
        let b = booking("2024-01-01", t(8, 0), t(9, 30));
        let json = serde_json::to_value(&b).unwrap();
        assert_eq!(json["start_time"], "08:00");
        assert_eq!(json["end_time"], "09:30");
        assert_eq!(json["type"], "standard");
        assert_eq!(json["status"], "confirmed");
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingCreated { booking: booking("2024-01-01", t(8, 0), t(9, 0)) };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
