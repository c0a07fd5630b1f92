//! Hard limits enforced at the engine boundary.

pub const MAX_LOTS: usize = 10_000;
pub const MAX_USERS: usize = 100_000;

pub const MIN_LOT_NAME_LEN: usize = 3;
pub const MAX_LOT_NAME_LEN: usize = 100;
pub const MIN_ADDRESS_LEN: usize = 10;
pub const MAX_ADDRESS_LEN: usize = 500;
pub const PIN_CODE_LEN: usize = 6;

/// Upper bound on a lot's hourly rate, in currency units.
pub const MAX_HOURLY_RATE: i64 = 10_000;

pub const MIN_USERNAME_LEN: usize = 3;
pub const MAX_USERNAME_LEN: usize = 80;
pub const MAX_FULL_NAME_LEN: usize = 100;

pub const MAX_VEHICLE_NUMBER_LEN: usize = 20;
pub const MAX_VEHICLE_MODEL_LEN: usize = 50;

/// Row letters used for spot labels, in allocation order.
pub const ROW_LETTERS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
pub const SPOTS_PER_ROW: usize = 10;
pub const MAX_SPOTS_PER_LOT: u32 = (ROW_LETTERS.len() * SPOTS_PER_ROW) as u32;
