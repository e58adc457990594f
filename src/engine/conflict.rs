use chrono::NaiveDateTime;
use ulid::Ulid;

use crate::model::*;

use super::availability::find_conflict;
use super::{BookingPolicy, EngineError};

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn local_now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

/// The single gate before any write that changes a booking's venue, date or
/// time. Caller holds the venue's write lock.
pub(crate) fn check_slot_free(vs: &VenueState, slot: &Slot, exclude: Option<Ulid>) -> Result<(), EngineError> {
    match find_conflict(vs.on_date(slot.date), slot, exclude) {
        Some(existing) => {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            tracing::debug!(
                venue_id = %vs.venue.id,
                conflicting = %existing.id,
                "slot {} {}-{} taken",
                slot.date,
                slot.start.format("%H:%M"),
                slot.end.format("%H:%M")
            );
            Err(EngineError::Conflict { booking: existing.to_ref() })
        }
        None => Ok(()),
    }
}

/// Customers may not cancel a confirmed booking once it is closer to its
/// start than the configured lead time. Admins are never limited.
pub(crate) fn check_cancellation_lead(
    policy: &BookingPolicy,
    booking: &Booking,
    actor: &Actor,
    now: NaiveDateTime,
) -> Result<(), EngineError> {
    if actor.is_admin() || booking.status != BookingStatus::Confirmed {
        return Ok(());
    }
    if booking.slot().starts_at() - now < policy.cancel_lead {
        return Err(EngineError::Forbidden("cancellation lead time has passed"));
    }
    Ok(())
}

pub(crate) fn check_owner(booking: &Booking, actor: &Actor) -> Result<(), EngineError> {
    if actor.may_act_for(booking.user_id) {
        Ok(())
    } else {
        Err(EngineError::Forbidden("booking belongs to another user"))
    }
}

pub(crate) fn require_admin(actor: &Actor) -> Result<(), EngineError> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(EngineError::Forbidden("admin role required"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, NaiveTime};
    use rust_decimal::Decimal;

    fn booking_at(date: NaiveDate, start: NaiveTime, owner: Ulid) -> Booking {
        Booking {
            id: Ulid::new(),
            venue_id: Ulid::new(),
            user_id: Some(owner),
            date,
            start_time: start,
            end_time: start + Duration::hours(1),
            status: BookingStatus::Confirmed,
            status_id: None,
            kind: BookingType::Standard,
            total_price: Decimal::ZERO,
            recurrence_id: None,
            open_match: None,
            created_at: 0,
        }
    }

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 10).unwrap().and_hms_opt(12, 0, 0).unwrap()
    }

    #[test]
    fn customer_cannot_cancel_inside_lead_time() {
        let owner = Ulid::new();
        let policy = BookingPolicy::default();
        let soon = booking_at(now().date(), NaiveTime::from_hms_opt(13, 0, 0).unwrap(), owner);
        let later = booking_at(now().date(), NaiveTime::from_hms_opt(15, 0, 0).unwrap(), owner);

        let customer = Actor::customer(owner);
        assert!(matches!(
            check_cancellation_lead(&policy, &soon, &customer, now()),
            Err(EngineError::Forbidden(_))
        ));
        assert!(check_cancellation_lead(&policy, &later, &customer, now()).is_ok());
        assert!(check_cancellation_lead(&policy, &soon, &Actor::admin(Ulid::new()), now()).is_ok());
    }

    #[test]
    fn pending_bookings_are_not_lead_limited() {
        let owner = Ulid::new();
        let mut soon = booking_at(now().date(), NaiveTime::from_hms_opt(12, 30, 0).unwrap(), owner);
        soon.status = BookingStatus::Pending;
        assert!(check_cancellation_lead(&BookingPolicy::default(), &soon, &Actor::customer(owner), now()).is_ok());
    }

    #[test]
    fn ownership_rules() {
        let owner = Ulid::new();
        let b = booking_at(now().date(), NaiveTime::from_hms_opt(9, 0, 0).unwrap(), owner);
        assert!(check_owner(&b, &Actor::customer(owner)).is_ok());
        assert!(check_owner(&b, &Actor::customer(Ulid::new())).is_err());
        assert!(check_owner(&b, &Actor::admin(Ulid::new())).is_ok());
        assert!(require_admin(&Actor::customer(owner)).is_err());
    }
}
