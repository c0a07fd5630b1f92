use ulid::Ulid;

use crate::model::*;

use super::billing::CostBreakdown;
use super::{require_admin, Engine, EngineError, SharedLot};

impl Engine {
    /// Map a login name onto a caller. Admins are configured, not registered.
    pub fn resolve_caller(&self, username: &str, admin_username: &str) -> Option<Caller> {
        if username == admin_username {
            return Some(Caller::admin());
        }
        self.usernames
            .get(username)
            .map(|e| Caller::user(*e.value()))
    }

    fn lot_arcs(&self) -> Vec<SharedLot> {
        self.lots.iter().map(|e| e.value().clone()).collect()
    }

    pub async fn list_lots(&self, caller: &Caller) -> Vec<LotInfo> {
        let mut out = Vec::new();
        for lot in self.lot_arcs() {
            let lot = lot.read().await;
            if lot.retired || (!caller.is_admin() && !lot.active) {
                continue;
            }
            out.push(lot.info());
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub async fn get_lot(&self, caller: &Caller, id: Ulid) -> Result<LotInfo, EngineError> {
        let lot = self.lot(&id).ok_or(EngineError::LotNotFound(id))?;
        let lot = lot.read().await;
        if lot.retired {
            return Err(EngineError::LotNotFound(id));
        }
        if !caller.is_admin() && !lot.active {
            return Err(EngineError::LotInactive(id));
        }
        Ok(lot.info())
    }

    /// Spots in label order. Users only see the reservation id on a spot
    /// they hold themselves.
    pub async fn list_spots(&self, caller: &Caller, lot_id: Ulid) -> Result<Vec<SpotInfo>, EngineError> {
        let lot = self.lot(&lot_id).ok_or(EngineError::LotNotFound(lot_id))?;
        let lot = lot.read().await;
        if lot.retired {
            return Err(EngineError::LotNotFound(lot_id));
        }
        if !caller.is_admin() && !lot.active {
            return Err(EngineError::LotInactive(lot_id));
        }
        let visible = |rid: Ulid| {
            caller.is_admin()
                || lot
                    .reservations
                    .get(&rid)
                    .is_some_and(|r| r.user_id == caller.id)
        };
        Ok(lot
            .spots
            .iter()
            .map(|s| SpotInfo {
                id: s.id,
                lot_id,
                label: s.label.clone(),
                status: s.status(),
                reservation_id: s.occupant.filter(|rid| visible(*rid)),
            })
            .collect())
    }

    pub async fn list_users(&self, caller: &Caller) -> Result<Vec<UserInfo>, EngineError> {
        require_admin(caller)?;
        let users: Vec<_> = self.users.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(users.len());
        for user in users {
            out.push(user.lock().await.info());
        }
        out.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(out)
    }

    /// Reservations matching `filter`, in reservation id order. A user's filter is
    /// always narrowed to their own reservations.
    pub async fn list_reservations(
        &self,
        caller: &Caller,
        mut filter: ReservationFilter,
    ) -> Result<Vec<Reservation>, EngineError> {
        if !caller.is_admin() {
            if filter.user_id.is_some_and(|u| u != caller.id) {
                return Ok(Vec::new());
            }
            filter.user_id = Some(caller.id);
        }

        let lot_id = match filter.id {
            Some(id) => match self.reservation_index.get(&id) {
                Some(r) => Some(r.value().lot_id),
                None => return Ok(Vec::new()),
            },
            None => filter.lot_id,
        };
        let lots = match lot_id {
            Some(id) => self.lot(&id).into_iter().collect(),
            None => self.lot_arcs(),
        };

        let mut out = Vec::new();
        for lot in lots {
            let lot = lot.read().await;
            out.extend(
                lot.reservations
                    .values()
                    .filter(|r| filter.matches(r))
                    .cloned(),
            );
        }
        out.sort_by_key(|r| r.id);
        Ok(out)
    }

    /// Live estimate for an Active reservation, the billed figures for a
    /// Completed one.
    pub async fn estimate(&self, caller: &Caller, id: Ulid) -> Result<CostBreakdown, EngineError> {
        let lot_id = self
            .reservation_index
            .get(&id)
            .map(|e| e.value().lot_id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        let lot = self.lot(&lot_id).ok_or(EngineError::ReservationNotFound(id))?;
        let lot = lot.read().await;
        let r = lot
            .reservations
            .get(&id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        if !caller.is_admin() && r.user_id != caller.id {
            return Err(EngineError::NotOwner(id));
        }

        match (r.status, r.exit) {
            (ReservationStatus::Active, _) => {
                Ok(CostBreakdown::estimate(r.entry, self.clock.now_ms(), lot.hourly_rate))
            }
            (ReservationStatus::Completed, Some(exit)) => {
                let rate = r.billed_rate.unwrap_or(lot.hourly_rate);
                let mut bill = CostBreakdown::finalize(r.entry, exit, rate);
                if let Some(cost) = r.final_cost {
                    bill.cost = cost;
                }
                Ok(bill)
            }
            _ => Err(EngineError::ReservationNotActive {
                id,
                status: r.status,
            }),
        }
    }
}
