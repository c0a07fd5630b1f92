use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds.
pub type Ms = i64;

// ── Callers ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Admin,
}

/// The authenticated party behind a ledger operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub role: Role,
    pub id: Ulid,
}

impl Caller {
    pub fn user(id: Ulid) -> Self {
        Self { role: Role::User, id }
    }

    /// Admins are not ledger users and carry no user id.
    pub fn admin() -> Self {
        Self {
            role: Role::Admin,
            id: Ulid::nil(),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

// ── Spots ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpotStatus {
    Available,
    Occupied,
}

impl SpotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpotStatus::Available => "available",
            SpotStatus::Occupied => "occupied",
        }
    }
}

/// Identity of a spot as written to the WAL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpotSeed {
    pub id: Ulid,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spot {
    pub id: Ulid,
    pub label: String,
    /// The Active reservation parked here. Status is derived from this,
    /// so a spot can never be Occupied without exactly one holder.
    pub occupant: Option<Ulid>,
}

impl Spot {
    pub fn from_seed(seed: &SpotSeed) -> Self {
        Self {
            id: seed.id,
            label: seed.label.clone(),
            occupant: None,
        }
    }

    pub fn status(&self) -> SpotStatus {
        if self.occupant.is_some() {
            SpotStatus::Occupied
        } else {
            SpotStatus::Available
        }
    }

    pub fn seed(&self) -> SpotSeed {
        SpotSeed {
            id: self.id,
            label: self.label.clone(),
        }
    }
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Active,
    Completed,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "active",
            ReservationStatus::Completed => "completed",
            ReservationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Some(ReservationStatus::Active),
            "completed" => Some(ReservationStatus::Completed),
            "cancelled" | "canceled" => Some(ReservationStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: Ulid,
    pub lot_id: Ulid,
    pub spot_id: Ulid,
    /// Copied at reservation time; survives removal of the spot.
    pub spot_label: String,
    pub user_id: Ulid,
    pub vehicle_number: String,
    pub vehicle_model: Option<String>,
    pub entry: Ms,
    pub exit: Option<Ms>,
    pub final_cost: Option<Decimal>,
    pub billed_rate: Option<Decimal>,
    pub status: ReservationStatus,
    pub forced: bool,
}

impl Reservation {
    pub fn is_active(&self) -> bool {
        self.status == ReservationStatus::Active
    }
}

// ── Lots & users ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LotState {
    pub id: Ulid,
    pub name: String,
    pub address: String,
    pub pin_code: String,
    pub hourly_rate: Decimal,
    pub active: bool,
    /// Set by delete. A retired lot keeps its reservation history but no spots.
    pub retired: bool,
    /// Always in label order.
    pub spots: Vec<Spot>,
    /// Keyed by reservation id. Ids come from the client, so this order
    /// says nothing about when a reservation was made.
    pub reservations: BTreeMap<Ulid, Reservation>,
}

impl LotState {
    pub fn capacity(&self) -> u32 {
        self.spots.len() as u32
    }

    pub fn occupied_count(&self) -> u32 {
        self.spots.iter().filter(|s| s.occupant.is_some()).count() as u32
    }

    pub fn available_count(&self) -> u32 {
        self.capacity() - self.occupied_count()
    }

    pub fn active_reservations(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.values().filter(|r| r.is_active())
    }

    pub fn spot_mut(&mut self, id: Ulid) -> Option<&mut Spot> {
        self.spots.iter_mut().find(|s| s.id == id)
    }

    pub fn info(&self) -> LotInfo {
        LotInfo {
            id: self.id,
            name: self.name.clone(),
            address: self.address.clone(),
            pin_code: self.pin_code.clone(),
            hourly_rate: self.hourly_rate,
            capacity: self.capacity(),
            available: self.available_count(),
            occupied: self.occupied_count(),
            active: self.active,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UserState {
    pub id: Ulid,
    pub username: String,
    pub full_name: Option<String>,
    pub active: bool,
    pub active_reservation: Option<Ulid>,
}

impl UserState {
    pub fn info(&self) -> UserInfo {
        UserInfo {
            id: self.id,
            username: self.username.clone(),
            full_name: self.full_name.clone(),
            active: self.active,
            active_reservation: self.active_reservation,
        }
    }
}

// ── WAL events ───────────────────────────────────────────────────

/// One committed state transition. The WAL is a sequence of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        id: Ulid,
        username: String,
        full_name: Option<String>,
    },
    UserStatusChanged {
        id: Ulid,
        active: bool,
    },
    LotCreated {
        id: Ulid,
        name: String,
        address: String,
        pin_code: String,
        hourly_rate: Decimal,
        active: bool,
        spots: Vec<SpotSeed>,
    },
    /// Carries the full post-update attributes plus the spot delta.
    LotUpdated {
        id: Ulid,
        name: String,
        address: String,
        pin_code: String,
        hourly_rate: Decimal,
        active: bool,
        added: Vec<SpotSeed>,
        removed: Vec<Ulid>,
    },
    LotDeleted {
        id: Ulid,
    },
    ReservationOpened {
        id: Ulid,
        lot_id: Ulid,
        spot_id: Ulid,
        spot_label: String,
        user_id: Ulid,
        vehicle_number: String,
        vehicle_model: Option<String>,
        entry: Ms,
    },
    ReservationOccupied {
        id: Ulid,
        lot_id: Ulid,
        entry: Ms,
    },
    ReservationCompleted {
        id: Ulid,
        lot_id: Ulid,
        exit: Ms,
        hourly_rate: Decimal,
        final_cost: Decimal,
        forced: bool,
    },
    ReservationCancelled {
        id: Ulid,
        lot_id: Ulid,
    },
}

// ── Operation inputs & results ───────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LotSpec {
    pub id: Ulid,
    pub name: String,
    pub address: String,
    pub pin_code: String,
    pub hourly_rate: Decimal,
    pub capacity: u32,
}

/// Fields left as `None` keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LotPatch {
    pub name: Option<String>,
    pub address: Option<String>,
    pub pin_code: Option<String>,
    pub hourly_rate: Option<Decimal>,
    pub capacity: Option<u32>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveRequest {
    pub id: Ulid,
    pub lot_id: Ulid,
    pub vehicle_number: String,
    pub vehicle_model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationTicket {
    pub id: Ulid,
    pub lot_id: Ulid,
    pub spot_id: Ulid,
    pub spot_label: String,
    pub entry: Ms,
    pub hourly_rate: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub id: Ulid,
    pub lot_id: Ulid,
    pub spot_label: String,
    pub entry: Ms,
    pub exit: Ms,
    pub duration_minutes: i64,
    pub billing_hours: i64,
    pub hourly_rate: Decimal,
    pub final_cost: Decimal,
    pub forced: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub id: Option<Ulid>,
    pub lot_id: Option<Ulid>,
    pub user_id: Option<Ulid>,
    pub status: Option<ReservationStatus>,
}

impl ReservationFilter {
    pub fn matches(&self, r: &Reservation) -> bool {
        self.id.is_none_or(|id| r.id == id)
            && self.lot_id.is_none_or(|id| r.lot_id == id)
            && self.user_id.is_none_or(|id| r.user_id == id)
            && self.status.is_none_or(|s| r.status == s)
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LotInfo {
    pub id: Ulid,
    pub name: String,
    pub address: String,
    pub pin_code: String,
    pub hourly_rate: Decimal,
    pub capacity: u32,
    pub available: u32,
    pub occupied: u32,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpotInfo {
    pub id: Ulid,
    pub lot_id: Ulid,
    pub label: String,
    pub status: SpotStatus,
    pub reservation_id: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub id: Ulid,
    pub username: String,
    pub full_name: Option<String>,
    pub active: bool,
    pub active_reservation: Option<Ulid>,
}
