use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::observability;
use crate::request::ConvertToOpenMatchRequest;

use super::conflict::check_owner;
use super::{Engine, EngineError};

fn ensure_joinable(booking: &Booking) -> Result<&OpenMatch, EngineError> {
    if booking.status.is_terminal() {
        return Err(EngineError::Validation(format!("booking is {}", booking.status)));
    }
    booking
        .open_match
        .as_ref()
        .ok_or_else(|| EngineError::Validation("booking is not an open match".into()))
}

impl Engine {
    /// Open a booking up for other players. The owner (or, for a booking
    /// without one, the acting admin) becomes roster member 0.
    pub async fn convert_to_open_match(
        &self,
        booking_id: Ulid,
        req: ConvertToOpenMatchRequest,
        actor: &Actor,
    ) -> Result<Booking, EngineError> {
        req.validate()?;
        let mut locks = self.lock_bookings(&[booking_id], None).await?;
        let before = locks
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        check_owner(&before, actor)?;
        if before.status.is_terminal() {
            return Err(EngineError::Validation(format!(
                "a {} booking cannot become an open match",
                before.status
            )));
        }
        if before.is_open_match() {
            return Err(EngineError::Validation("booking is already an open match".into()));
        }

        let owner = before.user_id.unwrap_or(actor.user_id);
        let after = Booking {
            open_match: Some(OpenMatch { max_players: req.max_players, players: vec![owner] }),
            ..before.clone()
        };
        self.persist_and_apply(&mut locks, Event::BookingUpdated { booking: after.clone() })
            .await?;
        self.record_audit(BookingAction::OpenMatchConverted, actor, Some(&before), Some(&after))
            .await;
        info!(%booking_id, max_players = req.max_players, "converted to open match");
        Ok(after)
    }

    /// Add a player. Customers join as themselves; admins may add anyone.
    /// The venue write lock serializes joins, so the roster never exceeds
    /// `max_players`.
    pub async fn join_open_match(
        &self,
        booking_id: Ulid,
        user_id: Option<Ulid>,
        actor: &Actor,
    ) -> Result<Booking, EngineError> {
        let user_id = match user_id {
            Some(u) if u != actor.user_id && !actor.is_admin() => {
                return Err(EngineError::Forbidden("customers may only join as themselves"));
            }
            Some(u) => u,
            None => actor.user_id,
        };
        let mut locks = self.lock_bookings(&[booking_id], None).await?;
        let before = locks
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        let roster = ensure_joinable(&before)?;
        if roster.contains(&user_id) {
            return Err(EngineError::AlreadyJoined(user_id));
        }
        if roster.is_full() {
            return Err(EngineError::CapacityExceeded { max_players: roster.max_players });
        }

        let mut after = before.clone();
        if let Some(m) = after.open_match.as_mut() {
            m.players.push(user_id);
        }
        self.persist_and_apply(&mut locks, Event::BookingUpdated { booking: after.clone() })
            .await?;
        self.record_audit(BookingAction::PlayerJoined, actor, Some(&before), Some(&after))
            .await;
        metrics::counter!(observability::OPEN_MATCH_JOINS_TOTAL).increment(1);
        info!(%booking_id, %user_id, "player joined open match");
        Ok(after)
    }

    /// Remove a player. Players remove themselves; the booking owner and
    /// admins may remove anyone. An emptied roster turns the booking back
    /// into a standard one.
    pub async fn leave_open_match(
        &self,
        booking_id: Ulid,
        user_id: Ulid,
        actor: &Actor,
    ) -> Result<Booking, EngineError> {
        let mut locks = self.lock_bookings(&[booking_id], None).await?;
        let before = locks
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        if user_id != actor.user_id && !actor.may_act_for(before.user_id) {
            return Err(EngineError::Forbidden("cannot remove another player"));
        }
        let roster = ensure_joinable(&before)?;
        if !roster.contains(&user_id) {
            return Err(EngineError::NotInRoster(user_id));
        }

        let mut after = before.clone();
        if let Some(m) = after.open_match.as_mut() {
            m.players.retain(|p| *p != user_id);
            if m.players.is_empty() {
                after.open_match = None;
            }
        }
        self.persist_and_apply(&mut locks, Event::BookingUpdated { booking: after.clone() })
            .await?;
        self.record_audit(BookingAction::PlayerLeft, actor, Some(&before), Some(&after))
            .await;
        info!(%booking_id, %user_id, reverted = !after.is_open_match(), "player left open match");
        Ok(after)
    }
}
