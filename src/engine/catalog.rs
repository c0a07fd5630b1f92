use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::{Mutex, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::capacity::{plan_resize, seed_spots, validate_capacity, ResizePlan};
use super::{lot_from_event, require_admin, user_from_event, Engine, EngineError};

fn clean_text(
    raw: &str,
    min: usize,
    max: usize,
    short: &'static str,
    long: &'static str,
) -> Result<String, EngineError> {
    let text = raw.trim();
    let len = text.chars().count();
    if len < min {
        return Err(EngineError::Invalid(short));
    }
    if len > max {
        return Err(EngineError::LimitExceeded(long));
    }
    Ok(text.to_string())
}

fn clean_lot_name(raw: &str) -> Result<String, EngineError> {
    clean_text(
        raw,
        MIN_LOT_NAME_LEN,
        MAX_LOT_NAME_LEN,
        "lot name too short",
        "lot name too long",
    )
}

fn clean_address(raw: &str) -> Result<String, EngineError> {
    clean_text(
        raw,
        MIN_ADDRESS_LEN,
        MAX_ADDRESS_LEN,
        "address too short",
        "address too long",
    )
}

fn clean_pin_code(raw: &str) -> Result<String, EngineError> {
    let pin = raw.trim();
    if pin.len() != PIN_CODE_LEN || !pin.bytes().all(|b| b.is_ascii_digit()) {
        return Err(EngineError::Invalid("pin code must be 6 digits"));
    }
    Ok(pin.to_string())
}

fn check_rate(rate: Decimal) -> Result<Decimal, EngineError> {
    if rate <= Decimal::ZERO {
        return Err(EngineError::Invalid("hourly rate must be positive"));
    }
    if rate > Decimal::from(MAX_HOURLY_RATE) {
        return Err(EngineError::LimitExceeded("hourly rate too high"));
    }
    Ok(rate.normalize())
}

fn clean_username(raw: &str) -> Result<String, EngineError> {
    let name = clean_text(
        raw,
        MIN_USERNAME_LEN,
        MAX_USERNAME_LEN,
        "username too short",
        "username too long",
    )?;
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(EngineError::Invalid(
            "username may only contain letters, digits, '_', '.', '-'",
        ));
    }
    Ok(name)
}

impl Engine {
    /// Fails if a live lot other than `except` already uses `name`.
    async fn ensure_lot_name_free(&self, name: &str, except: Option<Ulid>) -> Result<(), EngineError> {
        let others: Vec<_> = self
            .lots
            .iter()
            .filter(|e| Some(*e.key()) != except)
            .map(|e| e.value().clone())
            .collect();
        for lot in others {
            let lot = lot.read().await;
            if !lot.retired && lot.name.eq_ignore_ascii_case(name) {
                return Err(EngineError::AlreadyExists(lot.id));
            }
        }
        Ok(())
    }

    /// Create a lot together with its spots, in a single WAL event.
    pub async fn create_lot(&self, caller: &Caller, spec: LotSpec) -> Result<LotInfo, EngineError> {
        require_admin(caller)?;
        let name = clean_lot_name(&spec.name)?;
        let address = clean_address(&spec.address)?;
        let pin_code = clean_pin_code(&spec.pin_code)?;
        let hourly_rate = check_rate(spec.hourly_rate)?;
        validate_capacity(spec.capacity)?;

        let _catalog = self.catalog_lock.lock().await;
        if self.lots.contains_key(&spec.id) {
            return Err(EngineError::AlreadyExists(spec.id));
        }
        if self.lots.len() >= MAX_LOTS {
            return Err(EngineError::LimitExceeded("too many lots"));
        }
        self.ensure_lot_name_free(&name, None).await?;

        let event = Event::LotCreated {
            id: spec.id,
            name,
            address,
            pin_code,
            hourly_rate,
            active: true,
            spots: seed_spots(0, spec.capacity),
        };
        self.wal_append(&event).await?;
        let lot = lot_from_event(&event).ok_or(EngineError::Invalid("not a lot event"))?;
        let info = lot.info();
        self.lots.insert(spec.id, Arc::new(RwLock::new(lot)));

        info!(lot = %info.id, name = %info.name, capacity = info.capacity, "lot created");
        Ok(info)
    }

    /// Change any subset of a lot's attributes. A capacity change is applied
    /// as a spot delta in the same event.
    pub async fn update_lot(
        &self,
        caller: &Caller,
        id: Ulid,
        patch: LotPatch,
    ) -> Result<LotInfo, EngineError> {
        require_admin(caller)?;
        let name = patch.name.as_deref().map(clean_lot_name).transpose()?;
        let address = patch.address.as_deref().map(clean_address).transpose()?;
        let pin_code = patch.pin_code.as_deref().map(clean_pin_code).transpose()?;
        let hourly_rate = patch.hourly_rate.map(check_rate).transpose()?;

        let _catalog = self.catalog_lock.lock().await;
        let lot_arc = self.lot(&id).ok_or(EngineError::LotNotFound(id))?;
        if let Some(name) = &name {
            self.ensure_lot_name_free(name, Some(id)).await?;
        }
        let mut lot = lot_arc.write().await;
        if lot.retired {
            return Err(EngineError::LotNotFound(id));
        }

        let plan = match patch.capacity {
            Some(capacity) => plan_resize(&lot, capacity)?,
            None => ResizePlan::default(),
        };
        let resized = !plan.is_empty();
        let event = Event::LotUpdated {
            id,
            name: name.unwrap_or_else(|| lot.name.clone()),
            address: address.unwrap_or_else(|| lot.address.clone()),
            pin_code: pin_code.unwrap_or_else(|| lot.pin_code.clone()),
            hourly_rate: hourly_rate.unwrap_or(lot.hourly_rate),
            active: patch.active.unwrap_or(lot.active),
            added: plan.added,
            removed: plan.removed,
        };
        self.commit_lot(&mut lot, &event).await?;

        if resized {
            info!(lot = %id, capacity = lot.capacity(), "lot resized");
        }
        Ok(lot.info())
    }

    /// Retire a lot. Refused while any spot is occupied or any stay is open.
    pub async fn delete_lot(&self, caller: &Caller, id: Ulid) -> Result<(), EngineError> {
        require_admin(caller)?;
        let _catalog = self.catalog_lock.lock().await;
        let lot_arc = self.lot(&id).ok_or(EngineError::LotNotFound(id))?;
        let mut lot = lot_arc.write().await;
        if lot.retired {
            return Err(EngineError::LotNotFound(id));
        }
        let occupied = lot.occupied_count();
        let active = lot.active_reservations().count() as u32;
        if occupied > 0 || active > 0 {
            return Err(EngineError::SpotOccupiedCannotDelete {
                lot_id: id,
                occupied,
                active,
            });
        }
        self.commit_lot(&mut lot, &Event::LotDeleted { id }).await?;
        info!(lot = %id, "lot retired");
        Ok(())
    }

    pub async fn register_user(
        &self,
        caller: &Caller,
        id: Ulid,
        username: &str,
        full_name: Option<String>,
    ) -> Result<UserInfo, EngineError> {
        require_admin(caller)?;
        let username = clean_username(username)?;
        let full_name = match full_name {
            Some(n) if n.trim().chars().count() > MAX_FULL_NAME_LEN => {
                return Err(EngineError::LimitExceeded("full name too long"));
            }
            Some(n) if !n.trim().is_empty() => Some(n.trim().to_string()),
            _ => None,
        };

        let _catalog = self.catalog_lock.lock().await;
        if self.users.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if let Some(existing) = self.usernames.get(&username) {
            return Err(EngineError::AlreadyExists(*existing.value()));
        }
        if self.users.len() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }

        let event = Event::UserRegistered {
            id,
            username,
            full_name,
        };
        self.wal_append(&event).await?;
        let user = user_from_event(&event).ok_or(EngineError::Invalid("not a user event"))?;
        let info = user.info();
        self.usernames.insert(user.username.clone(), id);
        self.users.insert(id, Arc::new(Mutex::new(user)));

        info!(user = %id, username = %info.username, "user registered");
        Ok(info)
    }

    /// Activate or deactivate a user. An open stay blocks deactivation.
    pub async fn set_user_active(
        &self,
        caller: &Caller,
        id: Ulid,
        active: bool,
    ) -> Result<UserInfo, EngineError> {
        require_admin(caller)?;
        let user_arc = self.user(&id).ok_or(EngineError::UserNotFound(id))?;
        let mut user = user_arc.lock().await;
        if !active && let Some(reservation_id) = user.active_reservation {
            return Err(EngineError::UserHasActiveReservation {
                user_id: id,
                reservation_id,
            });
        }
        if user.active != active {
            self.commit_user(&mut user, &Event::UserStatusChanged { id, active })
                .await?;
            info!(user = %id, active, "user status changed");
        }
        Ok(user.info())
    }
}
