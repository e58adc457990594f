use serde::Serialize;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::request::{validate_range, BookingPatch, CreateBookingRequest, SeriesOption};

use super::conflict::{check_cancellation_lead, check_owner, check_slot_free, local_now, now_ms};
use super::{Engine, EngineError, OccurrenceFailure, VenueLocks};

/// What a create call produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Created {
    Single(Booking),
    Series { recurrence_id: Ulid, bookings: Vec<Booking> },
}

impl Created {
    pub fn bookings(&self) -> &[Booking] {
        match self {
            Created::Single(b) => std::slice::from_ref(b),
            Created::Series { bookings, .. } => bookings,
        }
    }
}

/// Whether `candidate` falls under a series-wide operation started on `named`.
fn in_series_scope(series: SeriesOption, named: &Booking, candidate: &Booking) -> bool {
    match series {
        SeriesOption::Single => candidate.id == named.id,
        SeriesOption::All => true,
        SeriesOption::Future => candidate.id == named.id || candidate.date >= named.date,
    }
}

/// Capacity and conflict gate for a row that changes venue, date or time.
/// Rows planned earlier in the same call are not applied yet, so they are
/// checked here as well.
fn check_planned_slot(
    locks: &VenueLocks,
    planned: &[(Booking, Booking)],
    before: &Booking,
    after: &Booking,
) -> Result<(), EngineError> {
    let vs = locks
        .get(&after.venue_id)
        .ok_or(EngineError::NotFound(after.venue_id))?;
    if after.venue_id != before.venue_id {
        let arriving = planned
            .iter()
            .filter(|(b, a)| a.venue_id == after.venue_id && b.venue_id != after.venue_id)
            .count();
        if vs.bookings.len() + arriving >= MAX_BOOKINGS_PER_VENUE {
            return Err(EngineError::LimitExceeded("too many bookings on venue"));
        }
    }
    check_slot_free(vs, &after.slot(), Some(after.id))?;
    let clash = planned.iter().map(|(_, a)| a).find(|a| {
        a.venue_id == after.venue_id && a.status.occupies_slot() && a.slot().overlaps(&after.slot())
    });
    match clash {
        Some(other) => Err(EngineError::Conflict { booking: other.to_ref() }),
        None => Ok(()),
    }
}

/// A storage failure after some rows of a multi-row write already landed.
fn interrupted_after(applied: Vec<Ulid>, cause: EngineError) -> EngineError {
    if applied.is_empty() {
        return cause;
    }
    warn!("write interrupted after {} row(s): {cause}", applied.len());
    EngineError::Interrupted { applied, cause: Box::new(cause) }
}

impl Engine {
    pub async fn create_booking(
        &self,
        req: CreateBookingRequest,
        actor: &Actor,
    ) -> Result<Created, EngineError> {
        req.validate()?;
        let user_id = if actor.is_admin() {
            req.user_id
        } else {
            if req.user_id.is_some_and(|u| u != actor.user_id) {
                return Err(EngineError::Forbidden("customers may only book for themselves"));
            }
            if req.status == Some(BookingStatus::Confirmed) || req.status_id.is_some() {
                return Err(EngineError::Forbidden("only admins may confirm or label bookings"));
            }
            Some(actor.user_id)
        };

        let mut locks = self.lock_venues(&[req.venue_id]).await?;
        let template = Booking {
            id: Ulid::nil(),
            venue_id: req.venue_id,
            user_id,
            date: req.date,
            start_time: req.start_time,
            end_time: req.end_time,
            status: req.status.unwrap_or(BookingStatus::Pending),
            status_id: req.status_id.clone(),
            kind: req.kind,
            total_price: req.total_price,
            recurrence_id: None,
            open_match: None,
            created_at: 0,
        };

        let Some(repeat) = req.repeat else {
            let booking = self.insert_occurrence(&mut locks, template, req.date, actor).await?;
            metrics::counter!(observability::BOOKINGS_CREATED_TOTAL, "kind" => "single").increment(1);
            info!(booking_id = %booking.id, venue_id = %booking.venue_id, "booking created for {}", booking.date);
            return Ok(Created::Single(booking));
        };

        let recurrence_id = Ulid::new();
        let dates = repeat.dates(req.date);
        let mut created = Vec::new();
        let mut failures = Vec::new();
        for (i, &date) in dates.iter().enumerate() {
            let occurrence = Booking { recurrence_id: Some(recurrence_id), ..template.clone() };
            match self.insert_occurrence(&mut locks, occurrence, date, actor).await {
                Ok(booking) => created.push(booking),
                Err(EngineError::Conflict { booking }) => failures.push(OccurrenceFailure {
                    date,
                    reason: format!("slot conflicts with booking {}", booking.id),
                    conflict: Some(booking),
                }),
                Err(EngineError::LimitExceeded(reason)) => failures.push(OccurrenceFailure {
                    date,
                    reason: reason.to_string(),
                    conflict: None,
                }),
                Err(e) if created.is_empty() => return Err(e),
                Err(e) => {
                    // Rows already written stay; report this date and the rest.
                    warn!(%recurrence_id, %date, "series create interrupted: {e}");
                    failures.push(OccurrenceFailure { date, reason: e.to_string(), conflict: None });
                    failures.extend(dates[i + 1..].iter().map(|&date| OccurrenceFailure {
                        date,
                        reason: format!("not attempted: {e}"),
                        conflict: None,
                    }));
                    break;
                }
            }
        }

        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL, "kind" => "series")
            .increment(created.len() as u64);
        info!(
            %recurrence_id,
            venue_id = %req.venue_id,
            "series created: {} of {} occurrences",
            created.len(),
            created.len() + failures.len()
        );

        if failures.is_empty() {
            Ok(Created::Series { recurrence_id, bookings: created })
        } else {
            Err(EngineError::PartialFailure { recurrence_id, created, failures })
        }
    }

    /// Conflict-check and write one booking on `date`. Caller holds the lock.
    async fn insert_occurrence(
        &self,
        locks: &mut VenueLocks,
        template: Booking,
        date: chrono::NaiveDate,
        actor: &Actor,
    ) -> Result<Booking, EngineError> {
        let vs = locks
            .get(&template.venue_id)
            .ok_or(EngineError::NotFound(template.venue_id))?;
        if vs.bookings.len() >= MAX_BOOKINGS_PER_VENUE {
            return Err(EngineError::LimitExceeded("too many bookings on venue"));
        }
        let booking = Booking { id: Ulid::new(), date, created_at: now_ms(), ..template };
        check_slot_free(vs, &booking.slot(), None)?;

        self.persist_and_apply(locks, Event::BookingCreated { booking: booking.clone() })
            .await?;
        self.record_audit(BookingAction::Created, actor, None, Some(&booking))
            .await;
        self.consume_waitlist(&booking).await;
        Ok(booking)
    }

    /// Members of `named`'s recurrence group an operation may touch. Rows
    /// outside the series scope are filtered again once the venues are locked.
    fn series_targets(&self, named: &Booking, series: SeriesOption) -> Vec<Ulid> {
        match (series, named.recurrence_id) {
            (SeriesOption::Single, _) | (_, None) => vec![named.id],
            (_, Some(rid)) => {
                let members = self.store.recurrence_members(&rid);
                if members.is_empty() { vec![named.id] } else { members }
            }
        }
    }

    pub async fn update_booking(
        &self,
        id: Ulid,
        patch: BookingPatch,
        actor: &Actor,
        series: SeriesOption,
    ) -> Result<Vec<Booking>, EngineError> {
        patch.validate()?;
        if !actor.is_admin() {
            if patch.touches_admin_fields() {
                return Err(EngineError::Forbidden("only admins may change price, label or type"));
            }
            if matches!(patch.status, Some(BookingStatus::Confirmed | BookingStatus::NoShow)) {
                return Err(EngineError::Forbidden("only admins may confirm or mark no-show"));
            }
        }

        let snapshot = self.find_booking(id).await?;
        check_owner(&snapshot, actor)?;
        let targets = self.series_targets(&snapshot, series);
        let mut locks = self.lock_bookings(&targets, patch.venue_id).await?;
        let named = locks.booking(&id).cloned().ok_or(EngineError::NotFound(id))?;

        // Plan every row first so an invalid sibling aborts before any write.
        let now = local_now();
        let mut planned: Vec<(Booking, Booking)> = Vec::new();
        for target in &targets {
            let Some(before) = locks.booking(target).cloned() else { continue };
            if !in_series_scope(series, &named, &before) {
                continue;
            }
            let is_named = before.id == named.id;
            let mut after = before.clone();

            if let Some(status) = patch.status.filter(|s| *s != before.status) {
                if !before.status.can_transition_to(status) {
                    if !is_named && before.status.is_terminal() {
                        debug!(booking_id = %before.id, "skipping terminal sibling");
                        continue;
                    }
                    return Err(EngineError::InvalidTransition { from: before.status, to: status });
                }
                if status == BookingStatus::Cancelled {
                    check_cancellation_lead(&self.policy, &before, actor, now)?;
                }
                after.status = status;
            }
            if let Some(label) = &patch.status_id {
                after.status_id = Some(label.clone());
            }
            if let Some(kind) = patch.kind {
                after.kind = kind;
            }
            if let Some(price) = patch.total_price {
                after.total_price = price;
            }

            // Date and time change only on the named row; the venue moves
            // with every live row in scope.
            if is_named && patch.touches_slot() {
                if before.status.is_terminal() {
                    return Err(EngineError::Validation(format!(
                        "a {} booking cannot be rescheduled",
                        before.status
                    )));
                }
                after.venue_id = patch.venue_id.unwrap_or(before.venue_id);
                after.date = patch.date.unwrap_or(before.date);
                after.start_time = patch.start_time.unwrap_or(before.start_time);
                after.end_time = patch.end_time.unwrap_or(before.end_time);
                validate_range(after.start_time, after.end_time)?;
            } else if let Some(venue_id) = patch.venue_id.filter(|v| *v != before.venue_id) {
                if before.status.is_terminal() {
                    debug!(booking_id = %before.id, "terminal sibling stays on its venue");
                } else {
                    after.venue_id = venue_id;
                }
            }
            if after.venue_id != before.venue_id || after.slot() != before.slot() {
                check_planned_slot(&locks, &planned, &before, &after)?;
            }

            if after != before {
                planned.push((before, after));
            }
        }

        let mut updated = Vec::with_capacity(planned.len());
        let mut freed = Vec::new();
        let mut interrupted = None;
        for (before, after) in planned {
            if let Err(e) = self
                .persist_and_apply(&mut locks, Event::BookingUpdated { booking: after.clone() })
                .await
            {
                interrupted = Some(e);
                break;
            }
            let action = if before.status != after.status {
                BookingAction::StatusChanged
            } else {
                BookingAction::Updated
            };
            self.record_audit(action, actor, Some(&before), Some(&after))
                .await;

            let released = before.status.occupies_slot()
                && (!after.status.occupies_slot()
                    || before.slot() != after.slot()
                    || before.venue_id != after.venue_id);
            if after.status.occupies_slot()
                && (before.slot() != after.slot() || before.venue_id != after.venue_id)
            {
                self.consume_waitlist(&after).await;
            }
            if released {
                freed.push(before);
            }
            updated.push(after);
        }
        drop(locks);

        info!(booking_id = %id, ?series, "updated {} booking(s)", updated.len());
        for booking in &freed {
            self.surface_candidates(booking).await;
        }
        if let Some(cause) = interrupted {
            return Err(interrupted_after(updated.iter().map(|b| b.id).collect(), cause));
        }
        if updated.is_empty() {
            updated.push(named);
        }
        Ok(updated)
    }

    /// Hard delete. Returns every removed id so callers can fan out one
    /// notification per row.
    pub async fn delete_booking(
        &self,
        id: Ulid,
        actor: &Actor,
        series: SeriesOption,
    ) -> Result<Vec<Ulid>, EngineError> {
        let snapshot = self.find_booking(id).await?;
        check_owner(&snapshot, actor)?;
        let targets = self.series_targets(&snapshot, series);
        let mut locks = self.lock_bookings(&targets, None).await?;
        let named = locks.booking(&id).cloned().ok_or(EngineError::NotFound(id))?;

        let now = local_now();
        let mut doomed = Vec::new();
        for target in &targets {
            let Some(booking) = locks.booking(target) else { continue };
            if !in_series_scope(series, &named, booking) {
                continue;
            }
            check_cancellation_lead(&self.policy, booking, actor, now)?;
            doomed.push(booking.clone());
        }

        let mut removed = Vec::with_capacity(doomed.len());
        let mut interrupted = None;
        for booking in &doomed {
            let event = Event::BookingDeleted { id: booking.id, venue_id: booking.venue_id };
            if let Err(e) = self.persist_and_apply(&mut locks, event).await {
                interrupted = Some(e);
                break;
            }
            self.record_audit(BookingAction::Deleted, actor, Some(booking), None)
                .await;
            removed.push(booking.id);
        }
        drop(locks);

        metrics::counter!(observability::BOOKINGS_DELETED_TOTAL).increment(removed.len() as u64);
        info!(booking_id = %id, ?series, "deleted {} booking(s)", removed.len());
        for booking in doomed
            .iter()
            .filter(|b| b.status.occupies_slot() && removed.contains(&b.id))
        {
            self.surface_candidates(booking).await;
        }
        match interrupted {
            Some(cause) => Err(interrupted_after(removed, cause)),
            None => Ok(removed),
        }
    }
}
