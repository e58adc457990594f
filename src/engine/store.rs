use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::SharedVenueState;

/// In-memory state rebuilt from the WAL. Venues carry their own lock; the
/// indexes and the side tables are lock-free maps.
pub struct BookingStore {
    venues: DashMap<Ulid, SharedVenueState>,
    branches: DashMap<Ulid, Branch>,
    booking_to_venue: DashMap<Ulid, Ulid>,
    recurrences: DashMap<Ulid, Vec<Ulid>>,
    /// Insertion ordered, so ties on `created_at` stay first-come-first-served.
    pub(super) waitlist: RwLock<Vec<WaitlistEntry>>,
    logs: DashMap<Ulid, Vec<BookingLog>>,
}

impl Default for BookingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BookingStore {
    pub fn new() -> Self {
        Self {
            venues: DashMap::new(),
            branches: DashMap::new(),
            booking_to_venue: DashMap::new(),
            recurrences: DashMap::new(),
            waitlist: RwLock::new(Vec::new()),
            logs: DashMap::new(),
        }
    }

    // ── Branches & venues ────────────────────────────────────

    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    pub fn get_branch(&self, id: &Ulid) -> Option<Branch> {
        self.branches.get(id).map(|e| e.value().clone())
    }

    pub fn insert_branch(&self, branch: Branch) {
        self.branches.insert(branch.id, branch);
    }

    /// All branches, by name.
    pub fn branches(&self) -> Vec<Branch> {
        let mut out: Vec<Branch> = self.branches.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        out
    }

    pub fn venue_count(&self) -> usize {
        self.venues.len()
    }

    pub fn get_venue(&self, id: &Ulid) -> Option<SharedVenueState> {
        self.venues.get(id).map(|e| e.value().clone())
    }

    pub fn insert_venue(&self, venue: Venue) {
        self.venues
            .insert(venue.id, Arc::new(RwLock::new(VenueState::new(venue))));
    }

    pub fn venue_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.venues.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    // ── Booking indexes ──────────────────────────────────────

    pub fn venue_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_venue.get(booking_id).map(|e| *e.value())
    }

    /// Every member of a recurrence group, in creation order.
    pub fn recurrence_members(&self, recurrence_id: &Ulid) -> Vec<Ulid> {
        self.recurrences
            .get(recurrence_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    fn index_booking(&self, booking: &Booking) {
        self.booking_to_venue.insert(booking.id, booking.venue_id);
        if let Some(rid) = booking.recurrence_id {
            let mut members = self.recurrences.entry(rid).or_default();
            if !members.contains(&booking.id) {
                members.push(booking.id);
            }
        }
    }

    fn unindex_booking(&self, booking: &Booking) {
        self.booking_to_venue.remove(&booking.id);
        if let Some(rid) = booking.recurrence_id {
            let now_empty = match self.recurrences.get_mut(&rid) {
                Some(mut members) => {
                    members.retain(|id| *id != booking.id);
                    members.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.recurrences.remove(&rid);
            }
        }
    }

    // ── Audit ────────────────────────────────────────────────

    pub fn push_log(&self, log: BookingLog) {
        self.logs.entry(log.booking_id).or_default().push(log);
    }

    pub fn logs_for(&self, booking_id: &Ulid) -> Vec<BookingLog> {
        self.logs
            .get(booking_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Every audit record, oldest first. Records of one booking that share a
    /// timestamp keep the order they were written in.
    pub fn all_logs(&self) -> Vec<BookingLog> {
        let mut out: Vec<BookingLog> = self
            .logs
            .iter()
            .flat_map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|l| l.timestamp);
        out
    }

    // ── Event application ────────────────────────────────────

    /// Apply a booking event to one venue. An update that moves a booking is
    /// applied twice: once to the venue it leaves, once to the venue it joins.
    pub fn apply_to_venue(&self, vs: &mut VenueState, event: &Event) {
        match event {
            Event::BookingCreated { booking } => {
                vs.insert_booking(booking.clone());
                self.index_booking(booking);
            }
            Event::BookingUpdated { booking } => {
                vs.remove_booking(booking.id);
                if booking.venue_id == vs.venue.id {
                    vs.insert_booking(booking.clone());
                    self.index_booking(booking);
                }
            }
            Event::BookingDeleted { id, .. } => {
                if let Some(removed) = vs.remove_booking(*id) {
                    self.unindex_booking(&removed);
                }
            }
            Event::BranchCreated { .. }
            | Event::VenueCreated { .. }
            | Event::WaitlistJoined { .. }
            | Event::WaitlistLeft { .. }
            | Event::AuditRecorded { .. } => {}
        }
    }

    /// Apply an event that does not touch a venue's bookings.
    /// Caller holds the waitlist write guard when the event is a waitlist one.
    pub fn apply_global(&self, waitlist: &mut Vec<WaitlistEntry>, event: &Event) {
        match event {
            Event::BranchCreated { id, name } => {
                self.insert_branch(Branch { id: *id, name: name.clone() });
            }
            Event::VenueCreated { id, branch_id, name } => {
                self.insert_venue(Venue { id: *id, branch_id: *branch_id, name: name.clone() });
            }
            Event::WaitlistJoined { entry } => waitlist.push(entry.clone()),
            Event::WaitlistLeft { id } => waitlist.retain(|e| e.id != *id),
            Event::AuditRecorded { log } => self.push_log(log.clone()),
            Event::BookingCreated { .. } | Event::BookingUpdated { .. } | Event::BookingDeleted { .. } => {}
        }
    }
}
