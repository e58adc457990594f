//! Dashboard aggregation over confirmed bookings. Everything here is pure:
//! the engine collects the rows under its locks and hands them over.

use std::collections::HashMap;

use chrono::{Datelike, Duration, NaiveDate};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use ulid::Ulid;

use crate::limits::TOP_N;
use crate::model::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Inclusive day count.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// The range of equal length ending the day before this one starts.
    pub fn preceding(&self) -> DateRange {
        let end = self.start - Duration::days(1);
        DateRange { start: end - Duration::days(self.days() - 1), end }
    }

    /// How many times each weekday (Mon..Sun) occurs in the range.
    pub fn weekday_occurrences(&self) -> [i64; 7] {
        let mut counts = [self.days() / 7; 7];
        let first = weekday_index(self.start);
        for offset in 0..(self.days() % 7) as usize {
            counts[(first + offset) % 7] += 1;
        }
        counts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DurationHistogram {
    pub up_to_60: usize,
    pub up_to_90: usize,
    pub over_90: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeekdayUtilization {
    pub weekday: String,
    pub bookings: usize,
    pub hours: f64,
    pub utilization: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ranked {
    pub id: Ulid,
    pub name: Option<String>,
    pub bookings: usize,
    pub revenue: Decimal,
    pub hours: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Trends {
    pub bookings: String,
    pub hours: String,
    pub revenue: String,
    pub utilization: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsReport {
    pub range: DateRange,
    pub total_bookings: usize,
    pub booked_hours: f64,
    pub capacity_hours: f64,
    pub utilization: f64,
    pub revenue: Decimal,
    /// Hour of day (0-23) spanned by the most bookings.
    pub busiest_hour: Option<u32>,
    pub hourly: Vec<usize>,
    pub weekdays: Vec<WeekdayUtilization>,
    pub durations: DurationHistogram,
    pub top_users: Vec<Ranked>,
    pub top_venues: Vec<Ranked>,
    pub trends: Trends,
}

/// Headline numbers for one period, used for both sides of a trend.
#[derive(Debug, Clone, Copy, PartialEq)]
struct PeriodSummary {
    bookings: usize,
    hours: f64,
    revenue: Decimal,
    utilization: f64,
}

/// Capacity hours for `venue_count` venues open `hours_per_day` for `days`.
pub fn capacity_hours(venue_count: usize, hours_per_day: f64, days: i64) -> f64 {
    venue_count as f64 * hours_per_day * days as f64
}

fn booked_hours<'a>(bookings: impl IntoIterator<Item = &'a Booking>) -> f64 {
    bookings
        .into_iter()
        .map(|b| b.duration_minutes() as f64 / 60.0)
        .sum()
}

fn percent(part: f64, whole: f64) -> f64 {
    if whole <= 0.0 { 0.0 } else { round1(part / whole * 100.0) }
}

fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn summarize(bookings: &[&Booking], venue_count: usize, hours_per_day: f64, range: DateRange) -> PeriodSummary {
    let hours = booked_hours(bookings.iter().copied());
    PeriodSummary {
        bookings: bookings.len(),
        hours,
        revenue: bookings.iter().map(|b| b.total_price).sum(),
        utilization: percent(hours, capacity_hours(venue_count, hours_per_day, range.days())),
    }
}

/// Signed change from `previous` to `current`, rounded to one decimal.
/// A zero baseline reads `∞%` if anything happened and `0%` if nothing did.
pub fn trend(current: f64, previous: f64) -> String {
    if previous == 0.0 {
        return if current > 0.0 { "∞%".to_string() } else { "0%".to_string() };
    }
    let pct = round1((current - previous) / previous * 100.0);
    if pct == 0.0 {
        "0%".to_string()
    } else if pct.fract() == 0.0 {
        format!("{:+}%", pct as i64)
    } else {
        format!("{pct:+.1}%")
    }
}

/// Every whole hour of day a booking touches, starting with its first.
/// A booking past midnight wraps back to hour 0.
fn hours_spanned(booking: &Booking) -> impl Iterator<Item = usize> {
    let start = minute_of_day(booking.start_time);
    let end = start + booking.duration_minutes();
    let first = start / 60;
    let last = if end > start { (end - 1) / 60 } else { first - 1 };
    (first..=last).map(|h| (h % 24) as usize)
}

/// Bookings per hour of day, 24 buckets.
pub fn hourly_histogram<'a>(bookings: impl IntoIterator<Item = &'a Booking>) -> Vec<usize> {
    let mut buckets = vec![0usize; 24];
    for booking in bookings {
        for h in hours_spanned(booking) {
            buckets[h] += 1;
        }
    }
    buckets
}

/// Earliest hour with the highest count, or `None` when nothing was booked.
pub fn busiest_hour(hourly: &[usize]) -> Option<u32> {
    let (hour, count) = hourly
        .iter()
        .enumerate()
        .max_by(|(ha, a), (hb, b)| a.cmp(b).then(hb.cmp(ha)))?;
    (*count > 0).then_some(hour as u32)
}

pub fn duration_histogram<'a>(bookings: impl IntoIterator<Item = &'a Booking>) -> DurationHistogram {
    let mut hist = DurationHistogram::default();
    for booking in bookings {
        match booking.duration_minutes() {
            m if m <= 60 => hist.up_to_60 += 1,
            m if m <= 90 => hist.up_to_90 += 1,
            _ => hist.over_90 += 1,
        }
    }
    hist
}

/// Booked hours per weekday, normalized by how often that weekday occurs in
/// the range rather than by the total number of days.
pub fn weekday_utilization(
    bookings: &[&Booking],
    range: DateRange,
    venue_count: usize,
    hours_per_day: f64,
) -> Vec<WeekdayUtilization> {
    let occurrences = range.weekday_occurrences();
    let mut counts = [0usize; 7];
    let mut hours = [0f64; 7];
    for booking in bookings {
        let idx = weekday_index(booking.date);
        counts[idx] += 1;
        hours[idx] += booking.duration_minutes() as f64 / 60.0;
    }
    WEEKDAYS
        .iter()
        .enumerate()
        .map(|(i, day)| WeekdayUtilization {
            weekday: day.to_string(),
            bookings: counts[i],
            hours: round2(hours[i]),
            utilization: percent(hours[i], capacity_hours(venue_count, hours_per_day, occurrences[i])),
        })
        .collect()
}

fn rank(mut rows: Vec<Ranked>) -> Vec<Ranked> {
    rows.sort_by(|a, b| {
        b.bookings
            .cmp(&a.bookings)
            .then(b.revenue.cmp(&a.revenue))
            .then(a.id.cmp(&b.id))
    });
    rows.truncate(TOP_N);
    for row in &mut rows {
        row.hours = round2(row.hours);
    }
    rows
}

fn tally(rows: &mut HashMap<Ulid, Ranked>, id: Ulid, name: Option<String>, booking: &Booking) {
    let row = rows.entry(id).or_insert_with(|| Ranked {
        id,
        name,
        bookings: 0,
        revenue: Decimal::ZERO,
        hours: 0.0,
    });
    row.bookings += 1;
    row.revenue += booking.total_price;
    row.hours += booking.duration_minutes() as f64 / 60.0;
}

pub fn top_users(bookings: &[&Booking]) -> Vec<Ranked> {
    let mut rows = HashMap::new();
    for booking in bookings {
        if let Some(user) = booking.user_id {
            tally(&mut rows, user, None, booking);
        }
    }
    rank(rows.into_values().collect())
}

pub fn top_venues(bookings: &[&Booking], venues: &[Venue]) -> Vec<Ranked> {
    let names: HashMap<Ulid, &str> = venues.iter().map(|v| (v.id, v.name.as_str())).collect();
    let mut rows = HashMap::new();
    for booking in bookings {
        let name = names.get(&booking.venue_id).map(|n| n.to_string());
        tally(&mut rows, booking.venue_id, name, booking);
    }
    rank(rows.into_values().collect())
}

/// Full dashboard for `range`. `bookings` may hold rows of any status from
/// both `range` and the preceding period; only confirmed rows count.
pub fn dashboard(bookings: &[Booking], venues: &[Venue], hours_per_day: f64, range: DateRange) -> StatsReport {
    let confirmed = bookings.iter().filter(|b| b.status == BookingStatus::Confirmed);
    let current: Vec<&Booking> = confirmed.clone().filter(|b| range.contains(b.date)).collect();
    let previous_range = range.preceding();
    let previous: Vec<&Booking> = confirmed.filter(|b| previous_range.contains(b.date)).collect();

    let now = summarize(&current, venues.len(), hours_per_day, range);
    let before = summarize(&previous, venues.len(), hours_per_day, previous_range);
    let hourly = hourly_histogram(current.iter().copied());

    StatsReport {
        range,
        total_bookings: now.bookings,
        booked_hours: round2(now.hours),
        capacity_hours: round2(capacity_hours(venues.len(), hours_per_day, range.days())),
        utilization: now.utilization,
        revenue: now.revenue,
        busiest_hour: busiest_hour(&hourly),
        weekdays: weekday_utilization(&current, range, venues.len(), hours_per_day),
        durations: duration_histogram(current.iter().copied()),
        top_users: top_users(&current),
        top_venues: top_venues(&current, venues),
        trends: Trends {
            bookings: trend(now.bookings as f64, before.bookings as f64),
            hours: trend(now.hours, before.hours),
            revenue: trend(
                now.revenue.to_f64().unwrap_or(0.0),
                before.revenue.to_f64().unwrap_or(0.0),
            ),
            utilization: trend(now.utilization, before.utilization),
        },
        hourly,
    }
}
