mod availability;
mod bookings;
mod conflict;
mod error;
mod open_match;
mod queries;
mod registry;
mod store;
mod waitlist;

pub use availability::{find_conflict, free_gaps, total_minutes, Availability};
pub use bookings::Created;
pub use error::{EngineError, OccurrenceFailure};
pub use queries::{SlotScope, VenueGaps};
pub use store::BookingStore;
pub use waitlist::promotion_candidates;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration, NaiveTime};
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::{BookingEvent, BookingNotifier};
use crate::wal::Wal;

pub type SharedVenueState = Arc<RwLock<VenueState>>;

/// Business rules the engine is configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingPolicy {
    /// Daily opening time, the start of the capacity and report window.
    pub open: NaiveTime,
    pub close: NaiveTime,
    /// How long before its start a customer may still cancel a confirmed booking.
    pub cancel_lead: Duration,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            open: NaiveTime::from_hms_opt(8, 0, 0).unwrap_or(NaiveTime::MIN),
            close: NaiveTime::from_hms_opt(23, 0, 0).unwrap_or(NaiveTime::MIN),
            cancel_lead: Duration::minutes(120),
        }
    }
}

impl BookingPolicy {
    pub fn business_window(&self) -> TimeRange {
        TimeRange { start: self.open, end: self.close }
    }

    pub fn business_hours_per_day(&self) -> f64 {
        self.business_window().duration_minutes() as f64 / 60.0
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    #[cfg(test)]
    FailAppendsAfter { appends: u64 },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL. Appends that queue up while a flush is
/// in progress are written together and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} events: {e}", batch.len());
    }
    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so no half-written batch lingers in
    // the buffer for the next one.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
        #[cfg(test)]
        WalCommand::FailAppendsAfter { appends } => wal.fail_appends_after(appends),
    }
}

// ── Venue locks ──────────────────────────────────────────

/// Write guards over one or more venues, taken in ascending id order.
pub(super) struct VenueLocks {
    guards: Vec<(Ulid, OwnedRwLockWriteGuard<VenueState>)>,
}

impl VenueLocks {
    pub(super) fn get(&self, id: &Ulid) -> Option<&VenueState> {
        self.guards.iter().find(|(vid, _)| vid == id).map(|(_, g)| &**g)
    }

    pub(super) fn get_mut(&mut self, id: &Ulid) -> Option<&mut VenueState> {
        self.guards
            .iter_mut()
            .find(|(vid, _)| vid == id)
            .map(|(_, g)| &mut **g)
    }

    /// Two distinct venues, both mutable.
    fn pair_mut(&mut self, a: &Ulid, b: &Ulid) -> Option<(&mut VenueState, &mut VenueState)> {
        let i = self.guards.iter().position(|(id, _)| id == a)?;
        let j = self.guards.iter().position(|(id, _)| id == b)?;
        if i == j {
            return None;
        }
        let (lo, hi) = (i.min(j), i.max(j));
        let (left, right) = self.guards.split_at_mut(hi);
        let (first, second) = (&mut *left[lo].1, &mut *right[0].1);
        Some(if i < j { (first, second) } else { (second, first) })
    }

    /// Booking with `id`, looked up across every locked venue.
    pub(super) fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.guards.iter().find_map(|(_, g)| g.booking(*id))
    }
}

pub struct Engine {
    pub store: BookingStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notifier: Arc<dyn BookingNotifier>,
    pub policy: BookingPolicy,
    /// Serializes branch/venue creation against compaction.
    pub(super) registry_lock: Mutex<()>,
}

fn replay_lock(vs: &SharedVenueState) -> io::Result<tokio::sync::RwLockWriteGuard<'_, VenueState>> {
    vs.try_write()
        .map_err(|_| io::Error::other("venue state locked during replay"))
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notifier: Arc<dyn BookingNotifier>,
        policy: BookingPolicy,
    ) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut store = BookingStore::new();
        let mut waitlist = Vec::new();

        // Nothing else holds these locks yet, so try_write always succeeds.
        // blocking_write would panic inside the runtime.
        for event in &events {
            match event {
                Event::BookingCreated { booking } => {
                    if let Some(vs) = store.get_venue(&booking.venue_id) {
                        store.apply_to_venue(&mut *replay_lock(&vs)?, event);
                    }
                }
                Event::BookingUpdated { booking } => {
                    let previous = store.venue_for_booking(&booking.id);
                    let left = previous
                        .filter(|p| *p != booking.venue_id)
                        .and_then(|p| store.get_venue(&p));
                    if let Some(vs) = left {
                        store.apply_to_venue(&mut *replay_lock(&vs)?, event);
                    }
                    if let Some(vs) = store.get_venue(&booking.venue_id) {
                        store.apply_to_venue(&mut *replay_lock(&vs)?, event);
                    }
                }
                Event::BookingDeleted { venue_id, .. } => {
                    if let Some(vs) = store.get_venue(venue_id) {
                        store.apply_to_venue(&mut *replay_lock(&vs)?, event);
                    }
                }
                other => store.apply_global(&mut waitlist, other),
            }
        }
        *store.waitlist.get_mut() = waitlist;

        tracing::info!(
            "replayed {} events: {} branches, {} venues",
            events.len(),
            store.branch_count(),
            store.venue_count()
        );

        Ok(Self { store, wal_tx, notifier, policy, registry_lock: Mutex::new(()) })
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(super) fn venue_of(&self, booking_id: &Ulid) -> Result<Ulid, EngineError> {
        self.store
            .venue_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))
    }

    /// Write-lock every venue in `ids`, in sorted order so that concurrent
    /// multi-venue operations cannot deadlock.
    pub(super) async fn lock_venues(&self, ids: &[Ulid]) -> Result<VenueLocks, EngineError> {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let vs = self.store.get_venue(&id).ok_or(EngineError::NotFound(id))?;
            guards.push((id, vs.write_owned().await));
        }
        Ok(VenueLocks { guards })
    }

    /// Lock the venues currently holding `bookings`, plus `extra`. Retries if a
    /// booking moved to an unlocked venue while the locks were being taken.
    pub(super) async fn lock_bookings(
        &self,
        bookings: &[Ulid],
        extra: Option<Ulid>,
    ) -> Result<VenueLocks, EngineError> {
        loop {
            let mut venues: Vec<Ulid> = bookings
                .iter()
                .filter_map(|id| self.store.venue_for_booking(id))
                .collect();
            venues.extend(extra);
            let locks = self.lock_venues(&venues).await?;
            let settled = bookings.iter().all(|id| {
                self.store
                    .venue_for_booking(id)
                    .is_none_or(|v| locks.get(&v).is_some())
            });
            if settled {
                return Ok(locks);
            }
        }
    }

    /// WAL-append, apply to the locked venue(s), then publish the row event.
    pub(super) async fn persist_and_apply(
        &self,
        locks: &mut VenueLocks,
        event: Event,
    ) -> Result<(), EngineError> {
        let (target, previous) = match &event {
            Event::BookingCreated { booking } => (booking.venue_id, None),
            Event::BookingUpdated { booking } => (
                booking.venue_id,
                self.store
                    .venue_for_booking(&booking.id)
                    .filter(|p| *p != booking.venue_id),
            ),
            Event::BookingDeleted { venue_id, .. } => (*venue_id, None),
            _ => return Err(EngineError::WalError("not a booking event".into())),
        };

        self.wal_append(&event).await?;
        match previous {
            Some(prev) => {
                let (from, to) = locks
                    .pair_mut(&prev, &target)
                    .ok_or(EngineError::NotFound(prev))?;
                self.store.apply_to_venue(from, &event);
                self.store.apply_to_venue(to, &event);
            }
            None => {
                let vs = locks.get_mut(&target).ok_or(EngineError::NotFound(target))?;
                self.store.apply_to_venue(vs, &event);
            }
        }

        let notification = match event {
            Event::BookingCreated { booking } => BookingEvent::Create { data: booking },
            Event::BookingUpdated { booking } => BookingEvent::Update { data: booking },
            Event::BookingDeleted { id, .. } => BookingEvent::Delete { id },
            _ => return Ok(()),
        };
        self.notifier.publish(notification);
        Ok(())
    }

    /// Append an audit record. Failures are logged and counted but never
    /// fail the mutation that produced them.
    pub(super) async fn record_audit(
        &self,
        action: BookingAction,
        actor: &Actor,
        before: Option<&Booking>,
        after: Option<&Booking>,
    ) {
        let Some(booking_id) = after.or(before).map(|b| b.id) else { return };
        let log = BookingLog {
            id: Ulid::new(),
            booking_id,
            action,
            actor_id: actor.user_id,
            timestamp: conflict::now_ms(),
            before: before.cloned(),
            after: after.cloned(),
        };
        let event = Event::AuditRecorded { log };
        match self.wal_append(&event).await {
            Ok(()) => {
                if let Event::AuditRecorded { log } = event {
                    self.store.push_log(log);
                }
            }
            Err(e) => {
                metrics::counter!(crate::observability::AUDIT_FAILURES_TOTAL).increment(1);
                tracing::warn!(%booking_id, ?action, "audit record dropped: {e}");
            }
        }
    }

    /// Rewrite the WAL with only the events needed to recreate current state.
    ///
    /// Every writer is held off until the swap completes: the registry lock,
    /// all venue locks and the waitlist lock are taken before the snapshot.
    /// Waitlist entries for past dates are dropped along the way.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _registry = self.registry_lock.lock().await;
        let locks = self.lock_venues(&self.store.venue_ids()).await?;
        let mut waitlist = self.store.waitlist.write().await;

        let today = conflict::local_now().date();
        let waiting = waitlist.len();
        waitlist.retain(|e| e.date >= today);
        if waitlist.len() < waiting {
            tracing::info!("dropped {} expired waitlist entries", waiting - waitlist.len());
        }

        let mut events = Vec::new();
        for branch in self.store.branches() {
            events.push(Event::BranchCreated { id: branch.id, name: branch.name });
        }
        let mut bookings = Vec::new();
        for (_, guard) in &locks.guards {
            events.push(Event::VenueCreated {
                id: guard.venue.id,
                branch_id: guard.venue.branch_id,
                name: guard.venue.name.clone(),
            });
            bookings.extend(guard.bookings.iter().cloned());
        }
        // Creation order keeps recurrence member lists stable across restarts.
        bookings.sort_by_key(|b| b.created_at);
        events.extend(bookings.into_iter().map(|booking| Event::BookingCreated { booking }));
        events.extend(waitlist.iter().cloned().map(|entry| Event::WaitlistJoined { entry }));
        events.extend(
            self.store
                .all_logs()
                .into_iter()
                .map(|log| Event::AuditRecorded { log }),
        );

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!("WAL compacted to {count} events");
        Ok(())
    }

    /// Let `appends` more WAL records through, then fail every append.
    #[cfg(test)]
    pub(super) async fn fail_wal_after(&self, appends: u64) {
        let _ = self.wal_tx.send(WalCommand::FailAppendsAfter { appends }).await;
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
