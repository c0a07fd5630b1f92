use ulid::Ulid;

use crate::model::ReservationStatus;

/// Coarse grouping used for SQLSTATE mapping and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    Conflict,
    Authorization,
    NotFound,
    Infrastructure,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Validation => "validation",
            ErrorClass::Conflict => "conflict",
            ErrorClass::Authorization => "authorization",
            ErrorClass::NotFound => "not_found",
            ErrorClass::Infrastructure => "infrastructure",
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    LotNotFound(Ulid),
    LotInactive(Ulid),
    NoAvailableSpot(Ulid),
    UserNotFound(Ulid),
    UserInactive(Ulid),
    UserHasActiveReservation { user_id: Ulid, reservation_id: Ulid },
    ReservationNotFound(Ulid),
    ReservationNotActive { id: Ulid, status: ReservationStatus },
    NotOwner(Ulid),
    AdminRequired,
    UserRequired,
    AlreadyExists(Ulid),
    SpotOccupiedCannotDelete { lot_id: Ulid, occupied: u32, active: u32 },
    CapacityBlocked { lot_id: Ulid, occupied: u32 },
    Invalid(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::Invalid(_) | EngineError::LimitExceeded(_) => ErrorClass::Validation,
            EngineError::NoAvailableSpot(_)
            | EngineError::UserHasActiveReservation { .. }
            | EngineError::ReservationNotActive { .. }
            | EngineError::SpotOccupiedCannotDelete { .. }
            | EngineError::CapacityBlocked { .. }
            | EngineError::AlreadyExists(_) => ErrorClass::Conflict,
            EngineError::LotInactive(_)
            | EngineError::UserInactive(_)
            | EngineError::NotOwner(_)
            | EngineError::AdminRequired
            | EngineError::UserRequired => ErrorClass::Authorization,
            EngineError::LotNotFound(_)
            | EngineError::UserNotFound(_)
            | EngineError::ReservationNotFound(_) => ErrorClass::NotFound,
            EngineError::WalError(_) => ErrorClass::Infrastructure,
        }
    }

    /// SQLSTATE reported to wire clients.
    pub fn sqlstate(&self) -> &'static str {
        if let EngineError::AlreadyExists(_) = self {
            return "23505";
        }
        match self.class() {
            ErrorClass::Validation => "22023",
            ErrorClass::Conflict => "55000",
            ErrorClass::Authorization => "42501",
            ErrorClass::NotFound => "P0002",
            ErrorClass::Infrastructure => "58000",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::LotNotFound(id) => write!(f, "lot not found: {id}"),
            EngineError::LotInactive(id) => write!(f, "lot {id} is not accepting reservations"),
            EngineError::NoAvailableSpot(id) => write!(f, "no available spot in lot {id}"),
            EngineError::UserNotFound(id) => write!(f, "user not found: {id}"),
            EngineError::UserInactive(id) => write!(f, "user {id} is deactivated"),
            EngineError::UserHasActiveReservation {
                user_id,
                reservation_id,
            } => write!(
                f,
                "user {user_id} already holds active reservation {reservation_id}"
            ),
            EngineError::ReservationNotFound(id) => write!(f, "reservation not found: {id}"),
            EngineError::ReservationNotActive { id, status } => {
                write!(f, "reservation {id} is {}, not active", status.as_str())
            }
            EngineError::NotOwner(id) => write!(f, "reservation {id} belongs to another user"),
            EngineError::AdminRequired => write!(f, "operation requires an admin"),
            EngineError::UserRequired => write!(f, "operation requires a registered user"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::SpotOccupiedCannotDelete {
                lot_id,
                occupied,
                active,
            } => write!(
                f,
                "cannot delete lot {lot_id}: {occupied} occupied spots, {active} active reservations"
            ),
            EngineError::CapacityBlocked { lot_id, occupied } => write!(
                f,
                "cannot shrink lot {lot_id} while {occupied} spots are occupied"
            ),
            EngineError::Invalid(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
