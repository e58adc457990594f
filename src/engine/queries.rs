use chrono::NaiveDate;
use serde::Serialize;
use ulid::Ulid;

use crate::analytics::{self, DateRange, StatsReport};
use crate::limits::*;
use crate::model::*;
use crate::report::AvailableSlotsReport;

use super::availability::{find_conflict, free_gaps, Availability};
use super::conflict::{check_owner, require_admin};
use super::{Engine, EngineError};

/// Which venues a free-slot query covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotScope {
    Venue(Ulid),
    Branch(Ulid),
    All,
}

/// Free gaps for one venue on one date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VenueGaps {
    pub venue_id: Ulid,
    pub venue_name: String,
    pub branch_id: Ulid,
    pub gaps: Vec<TimeRange>,
}

impl Engine {
    /// Current copy of a booking, without any authorization check.
    pub(super) async fn find_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let venue_id = self.venue_of(&id)?;
        let vs = self
            .store
            .get_venue(&venue_id)
            .ok_or(EngineError::NotFound(venue_id))?;
        let guard = vs.read().await;
        guard.booking(id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn get_booking(&self, id: Ulid, actor: &Actor) -> Result<Booking, EngineError> {
        let booking = self.find_booking(id).await?;
        check_owner(&booking, actor)?;
        Ok(booking)
    }

    /// Every booking on a venue's calendar for `date`, cancelled rows included.
    pub async fn list_bookings(&self, venue_id: Ulid, date: NaiveDate) -> Result<Vec<Booking>, EngineError> {
        let vs = self
            .store
            .get_venue(&venue_id)
            .ok_or(EngineError::NotFound(venue_id))?;
        let guard = vs.read().await;
        Ok(guard.on_date(date).to_vec())
    }

    /// Pre-flight check. The authoritative check runs again under the write
    /// lock when the booking is actually written.
    pub async fn check_conflict(
        &self,
        venue_id: Ulid,
        slot: &Slot,
        exclude: Option<Ulid>,
    ) -> Result<Availability, EngineError> {
        let vs = self
            .store
            .get_venue(&venue_id)
            .ok_or(EngineError::NotFound(venue_id))?;
        let guard = vs.read().await;
        Ok(match find_conflict(guard.on_date(slot.date), slot, exclude) {
            Some(b) => Availability::Conflict { booking: b.to_ref() },
            None => Availability::Free,
        })
    }

    pub async fn free_slots(
        &self,
        scope: SlotScope,
        date: NaiveDate,
        window: TimeRange,
    ) -> Result<Vec<VenueGaps>, EngineError> {
        let venue_ids = match scope {
            SlotScope::Venue(id) => vec![id],
            SlotScope::Branch(id) => {
                self.store.get_branch(&id).ok_or(EngineError::NotFound(id))?;
                self.venues_in(Some(id)).await
            }
            SlotScope::All => self.venues_in(None).await,
        };

        let mut out = Vec::with_capacity(venue_ids.len());
        for id in venue_ids {
            let vs = self.store.get_venue(&id).ok_or(EngineError::NotFound(id))?;
            let guard = vs.read().await;
            out.push(VenueGaps {
                venue_id: id,
                venue_name: guard.venue.name.clone(),
                branch_id: guard.venue.branch_id,
                gaps: free_gaps(guard.on_date(date), window),
            });
        }
        out.sort_by(|a, b| a.venue_name.cmp(&b.venue_name).then(a.venue_id.cmp(&b.venue_id)));
        Ok(out)
    }

    async fn venues_in(&self, branch: Option<Ulid>) -> Vec<Ulid> {
        let mut ids = Vec::new();
        for id in self.store.venue_ids() {
            let Some(vs) = self.store.get_venue(&id) else { continue };
            let in_branch = match branch {
                Some(b) => vs.read().await.venue.branch_id == b,
                None => true,
            };
            if in_branch {
                ids.push(id);
            }
        }
        ids
    }

    pub async fn list_venues(&self, branch: Option<Ulid>) -> Vec<Venue> {
        let mut venues = Vec::new();
        for id in self.venues_in(branch).await {
            if let Some(vs) = self.store.get_venue(&id) {
                venues.push(vs.read().await.venue.clone());
            }
        }
        venues.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        venues
    }

    pub fn list_branches(&self) -> Vec<Branch> {
        self.store.branches()
    }

    /// Audit trail of one booking, oldest first. Admin only.
    pub async fn booking_logs(&self, id: Ulid, actor: &Actor) -> Result<Vec<BookingLog>, EngineError> {
        require_admin(actor)?;
        let logs = self.store.logs_for(&id);
        if logs.is_empty() && self.store.venue_for_booking(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        Ok(logs)
    }

    pub async fn dashboard_stats(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        actor: &Actor,
    ) -> Result<StatsReport, EngineError> {
        require_admin(actor)?;
        if end < start {
            return Err(EngineError::Validation("end_date must not be before start_date".into()));
        }
        let range = DateRange { start, end };
        if range.days() > MAX_STATS_RANGE_DAYS {
            return Err(EngineError::LimitExceeded("stats range too wide"));
        }
        let window = DateRange { start: range.preceding().start, end };

        let mut venues = Vec::new();
        let mut rows = Vec::new();
        for id in self.store.venue_ids() {
            let Some(vs) = self.store.get_venue(&id) else { continue };
            let guard = vs.read().await;
            venues.push(guard.venue.clone());
            rows.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| b.status == BookingStatus::Confirmed && window.contains(b.date))
                    .cloned(),
            );
        }
        Ok(analytics::dashboard(
            &rows,
            &venues,
            self.policy.business_hours_per_day(),
            range,
        ))
    }

    pub async fn available_slots_report(
        &self,
        date: NaiveDate,
        window: TimeRange,
        branch: Option<Ulid>,
    ) -> Result<AvailableSlotsReport, EngineError> {
        let scope = branch.map_or(SlotScope::All, SlotScope::Branch);
        let gaps = self.free_slots(scope, date, window).await?;
        let branches: Vec<Branch> = match branch {
            Some(id) => self.store.get_branch(&id).into_iter().collect(),
            None => self.store.branches(),
        };
        Ok(AvailableSlotsReport::build(date, window, &branches, gaps))
    }
}
