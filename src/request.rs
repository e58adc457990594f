//! Typed request bodies, one per operation. Each validates its own shape
//! before the engine sees it, so a rejected request never has side effects.

use chrono::{Duration, NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::limits::*;
use crate::model::{hhmm, BookingStatus, BookingType, Slot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly,
}

impl Frequency {
    pub fn step(self) -> Duration {
        match self {
            Frequency::Daily => Duration::days(1),
            Frequency::Weekly => Duration::weeks(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repeat {
    pub frequency: Frequency,
    pub count: u32,
}

impl Repeat {
    /// Dates of every occurrence, the first being `start` itself.
    pub fn dates(&self, start: NaiveDate) -> Vec<NaiveDate> {
        let step = self.frequency.step();
        (0..self.count)
            .filter_map(|i| start.checked_add_signed(step * i as i32))
            .collect()
    }
}

/// Which rows of a recurrence group an update or delete touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesOption {
    #[default]
    Single,
    All,
    /// The named booking and every sibling dated on or after it.
    Future,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBookingRequest {
    pub venue_id: Ulid,
    /// Customers always book for themselves. Admins may name any user or
    /// leave it empty.
    #[serde(default)]
    pub user_id: Option<Ulid>,
    pub date: NaiveDate,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
    #[serde(default, rename = "type")]
    pub kind: BookingType,
    #[serde(default)]
    pub total_price: Decimal,
    /// Only `pending` (default) or `confirmed` at creation.
    #[serde(default)]
    pub status: Option<BookingStatus>,
    #[serde(default)]
    pub status_id: Option<String>,
    #[serde(default)]
    pub repeat: Option<Repeat>,
}

impl CreateBookingRequest {
    pub fn validate(&self) -> Result<(), EngineError> {
        validate_range(self.start_time, self.end_time)?;
        validate_price(self.total_price)?;
        validate_status_id(self.status_id.as_deref())?;
        if let Some(status) = self.status.filter(|s| s.is_terminal()) {
            return Err(EngineError::Validation(format!(
                "a booking cannot be created as {status}"
            )));
        }
        if let Some(repeat) = self.repeat {
            if repeat.count == 0 {
                return Err(EngineError::Validation("repeat count must be at least 1".into()));
            }
            if repeat.count > MAX_RECURRENCE_COUNT {
                return Err(EngineError::LimitExceeded("too many repeat occurrences"));
            }
            let last = repeat.frequency.step() * (repeat.count - 1) as i32;
            if self.date.checked_add_signed(last).is_none() {
                return Err(EngineError::Validation("repeat runs past the last supported date".into()));
            }
        }
        Ok(())
    }

    pub fn slot(&self) -> Slot {
        Slot::new(self.date, self.start_time, self.end_time)
    }
}

/// Partial update. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookingPatch {
    #[serde(default)]
    pub venue_id: Option<Ulid>,
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default, with = "hhmm::option")]
    pub start_time: Option<NaiveTime>,
    #[serde(default, with = "hhmm::option")]
    pub end_time: Option<NaiveTime>,
    #[serde(default)]
    pub status: Option<BookingStatus>,
    #[serde(default)]
    pub status_id: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<BookingType>,
    #[serde(default)]
    pub total_price: Option<Decimal>,
}

impl BookingPatch {
    pub fn validate(&self) -> Result<(), EngineError> {
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            validate_range(start, end)?;
        }
        if let Some(price) = self.total_price {
            validate_price(price)?;
        }
        validate_status_id(self.status_id.as_deref())?;
        if self.is_empty() {
            return Err(EngineError::Validation("patch changes nothing".into()));
        }
        Ok(())
    }

    /// Whether the patch moves the booking (venue, date or time).
    pub fn touches_slot(&self) -> bool {
        self.venue_id.is_some() || self.date.is_some() || self.start_time.is_some() || self.end_time.is_some()
    }

    /// Fields other than status that only an admin may edit.
    pub fn touches_admin_fields(&self) -> bool {
        self.status_id.is_some() || self.kind.is_some() || self.total_price.is_some()
    }

    fn is_empty(&self) -> bool {
        !self.touches_slot() && !self.touches_admin_fields() && self.status.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinWaitlistRequest {
    pub venue_id: Ulid,
    /// Defaults to the acting user; only admins may register someone else.
    #[serde(default)]
    pub user_id: Option<Ulid>,
    pub date: NaiveDate,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
}

impl JoinWaitlistRequest {
    pub fn validate(&self) -> Result<(), EngineError> {
        validate_range(self.start_time, self.end_time)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConvertToOpenMatchRequest {
    pub max_players: u32,
}

impl ConvertToOpenMatchRequest {
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(MIN_MATCH_PLAYERS..=MAX_MATCH_PLAYERS).contains(&self.max_players) {
            return Err(EngineError::Validation(format!(
                "max_players must be between {MIN_MATCH_PLAYERS} and {MAX_MATCH_PLAYERS}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBranchRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVenueRequest {
    pub branch_id: Ulid,
    pub name: String,
}

pub(crate) fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::Validation("name must not be empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

pub(crate) fn validate_range(start: NaiveTime, end: NaiveTime) -> Result<(), EngineError> {
    if start >= end {
        return Err(EngineError::Validation(format!(
            "start time {} must be before end time {}",
            start.format("%H:%M"),
            end.format("%H:%M")
        )));
    }
    Ok(())
}

fn validate_price(price: Decimal) -> Result<(), EngineError> {
    if price.is_sign_negative() && !price.is_zero() {
        return Err(EngineError::Validation("total_price must not be negative".into()));
    }
    Ok(())
}

fn validate_status_id(status_id: Option<&str>) -> Result<(), EngineError> {
    if status_id.is_some_and(|s| s.len() > MAX_STATUS_ID_LEN) {
        return Err(EngineError::LimitExceeded("status_id too long"));
    }
    Ok(())
}
