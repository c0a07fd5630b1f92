use dashmap::mapref::entry::Entry;
use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::allocator::allocate;
use super::billing::CostBreakdown;
use super::{require_admin, require_user, Engine, EngineError, ReservationRef};

fn clean_vehicle_number(raw: &str) -> Result<String, EngineError> {
    let number = raw.trim();
    if number.is_empty() {
        return Err(EngineError::Invalid("vehicle number is required"));
    }
    if number.chars().count() > MAX_VEHICLE_NUMBER_LEN {
        return Err(EngineError::LimitExceeded("vehicle number too long"));
    }
    Ok(number.to_string())
}

fn clean_vehicle_model(raw: Option<String>) -> Result<Option<String>, EngineError> {
    let Some(model) = raw else { return Ok(None) };
    let model = model.trim();
    if model.chars().count() > MAX_VEHICLE_MODEL_LEN {
        return Err(EngineError::LimitExceeded("vehicle model too long"));
    }
    Ok((!model.is_empty()).then(|| model.to_string()))
}

fn not_active(r: &Reservation) -> EngineError {
    EngineError::ReservationNotActive {
        id: r.id,
        status: r.status,
    }
}

impl Engine {
    /// Open a reservation on the first free spot of a lot.
    ///
    /// The holder's lock is taken before the lot's, so two reserves by the same
    /// user serialise on the first and two reserves for one lot on the second.
    pub async fn reserve(
        &self,
        caller: &Caller,
        req: ReserveRequest,
    ) -> Result<ReservationTicket, EngineError> {
        let user_id = require_user(caller)?;
        let vehicle_number = clean_vehicle_number(&req.vehicle_number)?;
        let vehicle_model = clean_vehicle_model(req.vehicle_model)?;

        match self.reservation_index.entry(req.id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(req.id)),
            Entry::Vacant(slot) => {
                slot.insert(ReservationRef {
                    lot_id: req.lot_id,
                    user_id,
                });
            }
        }

        let result = self
            .open_reservation(req.id, req.lot_id, user_id, vehicle_number, vehicle_model)
            .await;
        match &result {
            Ok(ticket) => {
                metrics::counter!(observability::RESERVATIONS_OPENED_TOTAL).increment(1);
                debug!(reservation = %ticket.id, lot = %ticket.lot_id, spot = %ticket.spot_label, "reservation opened");
            }
            Err(e) => {
                self.reservation_index.remove(&req.id);
                metrics::counter!(
                    observability::RESERVE_REJECTED_TOTAL,
                    "reason" => observability::reject_reason(e)
                )
                .increment(1);
            }
        }
        result
    }

    async fn open_reservation(
        &self,
        id: Ulid,
        lot_id: Ulid,
        user_id: Ulid,
        vehicle_number: String,
        vehicle_model: Option<String>,
    ) -> Result<ReservationTicket, EngineError> {
        let user_arc = self.user(&user_id).ok_or(EngineError::UserNotFound(user_id))?;
        let mut user = user_arc.lock().await;
        if !user.active {
            return Err(EngineError::UserInactive(user_id));
        }
        if let Some(reservation_id) = user.active_reservation {
            return Err(EngineError::UserHasActiveReservation {
                user_id,
                reservation_id,
            });
        }

        let lot_arc = self.lot(&lot_id).ok_or(EngineError::LotNotFound(lot_id))?;
        let mut lot = lot_arc.write().await;
        let spot = allocate(&lot)?;
        let (spot_id, spot_label) = (spot.id, spot.label.clone());
        let entry = self.clock.now_ms();

        let event = Event::ReservationOpened {
            id,
            lot_id,
            spot_id,
            spot_label: spot_label.clone(),
            user_id,
            vehicle_number,
            vehicle_model,
            entry,
        };
        self.commit_reservation(&mut user, &mut lot, &event).await?;

        Ok(ReservationTicket {
            id,
            lot_id,
            spot_id,
            spot_label,
            entry,
            hourly_rate: lot.hourly_rate,
        })
    }

    /// The holder has physically parked: restart the clock on their stay.
    pub async fn occupy(&self, caller: &Caller, id: Ulid) -> Result<Reservation, EngineError> {
        let user_id = require_user(caller)?;
        let (mut user, mut lot) = self.lock_reservation(id).await?;
        let r = lot
            .reservations
            .get(&id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        if r.user_id != user_id {
            return Err(EngineError::NotOwner(id));
        }
        if !r.is_active() {
            return Err(not_active(r));
        }
        debug_assert!(lot.spots.iter().any(|s| s.occupant == Some(id)));

        let event = Event::ReservationOccupied {
            id,
            lot_id: lot.id,
            entry: self.clock.now_ms(),
        };
        self.commit_reservation(&mut user, &mut lot, &event).await?;
        debug!(reservation = %id, "reservation occupied");
        lot.reservations
            .get(&id)
            .cloned()
            .ok_or(EngineError::ReservationNotFound(id))
    }

    /// End a stay and bill it. Holders release their own; admins may release any.
    pub async fn release(&self, caller: &Caller, id: Ulid) -> Result<Receipt, EngineError> {
        self.complete(caller, id, caller.is_admin()).await
    }

    /// Admin-only release that ignores who holds the reservation.
    pub async fn force_release(&self, caller: &Caller, id: Ulid) -> Result<Receipt, EngineError> {
        require_admin(caller)?;
        self.complete(caller, id, true).await
    }

    async fn complete(&self, caller: &Caller, id: Ulid, forced: bool) -> Result<Receipt, EngineError> {
        let (mut user, mut lot) = self.lock_reservation(id).await?;
        let r = lot
            .reservations
            .get(&id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        if !caller.is_admin() && r.user_id != caller.id {
            return Err(EngineError::NotOwner(id));
        }
        if !r.is_active() {
            return Err(not_active(r));
        }

        let exit = self.clock.now_ms();
        let rate = lot.hourly_rate;
        let bill = CostBreakdown::finalize(r.entry, exit, rate);
        let (entry, spot_label) = (r.entry, r.spot_label.clone());

        let event = Event::ReservationCompleted {
            id,
            lot_id: lot.id,
            exit,
            hourly_rate: rate,
            final_cost: bill.cost,
            forced,
        };
        self.commit_reservation(&mut user, &mut lot, &event).await?;

        let outcome = if forced { "forced" } else { "completed" };
        metrics::counter!(observability::RESERVATIONS_CLOSED_TOTAL, "outcome" => outcome)
            .increment(1);
        debug!(reservation = %id, cost = %bill.cost, forced, "reservation completed");

        Ok(Receipt {
            id,
            lot_id: lot.id,
            spot_label,
            entry,
            exit,
            duration_minutes: bill.duration_minutes,
            billing_hours: bill.billing_hours.unwrap_or(1),
            hourly_rate: rate,
            final_cost: bill.cost,
            forced,
        })
    }

    /// Administrative cancellation: frees the spot, bills nothing.
    pub async fn cancel(&self, caller: &Caller, id: Ulid) -> Result<Reservation, EngineError> {
        require_admin(caller)?;
        let (mut user, mut lot) = self.lock_reservation(id).await?;
        let r = lot
            .reservations
            .get(&id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        if !r.is_active() {
            return Err(not_active(r));
        }
        let event = Event::ReservationCancelled { id, lot_id: lot.id };
        self.commit_reservation(&mut user, &mut lot, &event).await?;

        metrics::counter!(observability::RESERVATIONS_CLOSED_TOTAL, "outcome" => "cancelled")
            .increment(1);
        debug!(reservation = %id, "reservation cancelled");
        lot.reservations
            .get(&id)
            .cloned()
            .ok_or(EngineError::ReservationNotFound(id))
    }
}
