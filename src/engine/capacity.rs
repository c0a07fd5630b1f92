use ulid::Ulid;

use crate::limits::MAX_SPOTS_PER_LOT;
use crate::model::{LotState, SpotSeed};

use super::allocator::spot_label;
use super::EngineError;

/// Spot changes needed to move a lot to a new capacity.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResizePlan {
    pub added: Vec<SpotSeed>,
    pub removed: Vec<Ulid>,
}

impl ResizePlan {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub fn validate_capacity(capacity: u32) -> Result<(), EngineError> {
    if capacity == 0 {
        return Err(EngineError::Invalid("capacity must be at least 1"));
    }
    if capacity > MAX_SPOTS_PER_LOT {
        return Err(EngineError::LimitExceeded("capacity above spot label range"));
    }
    Ok(())
}

/// Fresh spots for the label indices `from..to`.
pub fn seed_spots(from: u32, to: u32) -> Vec<SpotSeed> {
    (from..to)
        .map(|i| SpotSeed {
            id: Ulid::new(),
            label: spot_label(i as usize),
        })
        .collect()
}

/// Plan a capacity change as a delta on the existing spot rows.
///
/// Existing spots keep their ids and labels. Growth appends the next labels.
/// Shrinking drops the highest labels and is refused while any spot in the
/// lot is occupied.
pub fn plan_resize(lot: &LotState, new_capacity: u32) -> Result<ResizePlan, EngineError> {
    validate_capacity(new_capacity)?;
    let current = lot.capacity();

    if new_capacity >= current {
        return Ok(ResizePlan {
            added: seed_spots(current, new_capacity),
            removed: Vec::new(),
        });
    }

    let occupied = lot.occupied_count();
    if occupied > 0 {
        return Err(EngineError::CapacityBlocked {
            lot_id: lot.id,
            occupied,
        });
    }
    Ok(ResizePlan {
        added: Vec::new(),
        removed: lot.spots[new_capacity as usize..]
            .iter()
            .map(|s| s.id)
            .collect(),
    })
}
