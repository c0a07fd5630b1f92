use rust_decimal::Decimal;
use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::{Engine, EngineError, SharedLot, SharedUser, WalCommand};

/// The shortest event sequence that replays to exactly this state.
///
/// Users first, so reservations can find their holder. Within a lot,
/// finished reservations precede open ones: replaying a finished stay briefly
/// marks its spot occupied and then frees it, which must happen before the
/// current occupant is placed.
pub(super) fn snapshot_events(users: &[&UserState], lots: &[&LotState]) -> Vec<Event> {
    let mut events = Vec::new();

    for user in users {
        events.push(Event::UserRegistered {
            id: user.id,
            username: user.username.clone(),
            full_name: user.full_name.clone(),
        });
        if !user.active {
            events.push(Event::UserStatusChanged {
                id: user.id,
                active: false,
            });
        }
    }

    for lot in lots {
        events.push(Event::LotCreated {
            id: lot.id,
            name: lot.name.clone(),
            address: lot.address.clone(),
            pin_code: lot.pin_code.clone(),
            hourly_rate: lot.hourly_rate,
            active: lot.active,
            spots: lot.spots.iter().map(Spot::seed).collect(),
        });

        let (open, closed): (Vec<&Reservation>, Vec<&Reservation>) =
            lot.reservations.values().partition(|r| r.is_active());
        for r in closed {
            events.push(opened(r));
            match r.status {
                ReservationStatus::Completed => events.push(Event::ReservationCompleted {
                    id: r.id,
                    lot_id: r.lot_id,
                    exit: r.exit.unwrap_or(r.entry),
                    hourly_rate: r.billed_rate.unwrap_or(lot.hourly_rate),
                    final_cost: r.final_cost.unwrap_or(Decimal::ZERO),
                    forced: r.forced,
                }),
                ReservationStatus::Cancelled => events.push(Event::ReservationCancelled {
                    id: r.id,
                    lot_id: r.lot_id,
                }),
                ReservationStatus::Active => {}
            }
        }
        events.extend(open.into_iter().map(opened));

        if lot.retired {
            events.push(Event::LotDeleted { id: lot.id });
        }
    }
    events
}

fn opened(r: &Reservation) -> Event {
    Event::ReservationOpened {
        id: r.id,
        lot_id: r.lot_id,
        spot_id: r.spot_id,
        spot_label: r.spot_label.clone(),
        user_id: r.user_id,
        vehicle_number: r.vehicle_number.clone(),
        vehicle_model: r.vehicle_model.clone(),
        entry: r.entry,
    }
}

impl Engine {
    /// Rewrite the WAL as a snapshot of the current state.
    ///
    /// Every mutation appends while holding the lock of what it changes, so
    /// holding all of them until the rewrite lands means no append can fall
    /// between the snapshot and the file swap. Lock order matches the
    /// mutations: catalog, then users, then lots, each in id order.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;

        let mut user_arcs: Vec<(Ulid, SharedUser)> = self
            .users
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        user_arcs.sort_unstable_by_key(|(id, _)| *id);
        let mut lot_arcs: Vec<(Ulid, SharedLot)> = self
            .lots
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        lot_arcs.sort_unstable_by_key(|(id, _)| *id);

        let mut user_guards = Vec::with_capacity(user_arcs.len());
        for (_, user) in &user_arcs {
            user_guards.push(user.lock().await);
        }
        let mut lot_guards = Vec::with_capacity(lot_arcs.len());
        for (_, lot) in &lot_arcs {
            lot_guards.push(lot.read().await);
        }

        let users: Vec<&UserState> = user_guards.iter().map(|g| &**g).collect();
        let lots: Vec<&LotState> = lot_guards.iter().map(|g| &**g).collect();
        let events = snapshot_events(&users, &lots);
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;

        metrics::counter!(observability::WAL_COMPACTIONS_TOTAL).increment(1);
        info!(events = count, lots = lots.len(), users = users.len(), "wal compacted");
        Ok(())
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

#[cfg(test)]
mod tests {
    use super::super::Replayed;
    use super::*;
    use crate::engine::capacity::seed_spots;

    fn lot_with_history() -> (LotState, UserState) {
        let user_id = Ulid::new();
        let mut lot = LotState {
            id: Ulid::new(),
            name: "Harbour".into(),
            address: "2 Quay Street, Dock".into(),
            pin_code: "400001".into(),
            hourly_rate: Decimal::from(30),
            active: true,
            retired: false,
            spots: seed_spots(0, 3).iter().map(Spot::from_seed).collect(),
            reservations: Default::default(),
        };
        let spot = lot.spots[0].clone();
        let done = Reservation {
            id: Ulid::new(),
            lot_id: lot.id,
            spot_id: spot.id,
            spot_label: spot.label.clone(),
            user_id,
            vehicle_number: "MH12AB0001".into(),
            vehicle_model: None,
            entry: 0,
            exit: Some(1_800_000),
            final_cost: Some(Decimal::from(30)),
            billed_rate: Some(Decimal::from(30)),
            status: ReservationStatus::Completed,
            forced: false,
        };
        let live = Reservation {
            id: Ulid::new(),
            exit: None,
            final_cost: None,
            billed_rate: None,
            status: ReservationStatus::Active,
            entry: 2_000_000,
            ..done.clone()
        };
        lot.spots[0].occupant = Some(live.id);
        lot.reservations.insert(done.id, done);
        lot.reservations.insert(live.id, live.clone());
        let user = UserState {
            id: user_id,
            username: "harbour.user".into(),
            full_name: None,
            active: true,
            active_reservation: Some(live.id),
        };
        (lot, user)
    }

    #[test]
    fn snapshot_replays_to_same_state() {
        let (lot, user) = lot_with_history();
        let events = snapshot_events(&[&user], &[&lot]);

        let mut replayed = Replayed::default();
        for e in &events {
            replayed.apply(e);
        }
        let back = &replayed.lots[&lot.id];
        assert_eq!(back.spots, lot.spots);
        assert_eq!(back.reservations, lot.reservations);
        assert_eq!(replayed.users[&user.id].active_reservation, user.active_reservation);
        assert_eq!(replayed.index.len(), 2);
    }

    #[test]
    fn retired_lot_snapshot_ends_with_delete() {
        let (mut lot, user) = lot_with_history();
        lot.reservations.retain(|_, r| !r.is_active());
        lot.spots.clear();
        lot.retired = true;
        lot.active = false;
        let events = snapshot_events(&[&user], &[&lot]);
        assert_eq!(events.last(), Some(&Event::LotDeleted { id: lot.id }));
    }
}
