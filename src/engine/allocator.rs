use crate::limits::{ROW_LETTERS, SPOTS_PER_ROW};
use crate::model::{LotState, Spot};

use super::EngineError;

/// Row-major label for the spot at `index`: 0 → `A01`, 9 → `A10`, 10 → `B01`.
///
/// Callers keep `index` below `MAX_SPOTS_PER_LOT`; past the last row the
/// letter saturates at `Z` rather than panicking.
pub fn spot_label(index: usize) -> String {
    let row = (index / SPOTS_PER_ROW).min(ROW_LETTERS.len() - 1);
    let position = index % SPOTS_PER_ROW + 1;
    format!("{}{:02}", ROW_LETTERS[row] as char, position)
}

/// Pick the Available spot with the smallest label.
///
/// Pure selection: the caller flips the spot inside the same lot-locked
/// transaction that opens the reservation.
pub fn allocate(lot: &LotState) -> Result<&Spot, EngineError> {
    if lot.retired {
        return Err(EngineError::LotNotFound(lot.id));
    }
    if !lot.active {
        return Err(EngineError::LotInactive(lot.id));
    }
    lot.spots
        .iter()
        .filter(|s| s.occupant.is_none())
        .min_by(|a, b| a.label.cmp(&b.label))
        .ok_or(EngineError::NoAvailableSpot(lot.id))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use rust_decimal::Decimal;
    use ulid::Ulid;

    use super::*;
    use crate::limits::MAX_SPOTS_PER_LOT;

    fn lot(capacity: usize) -> LotState {
        LotState {
            id: Ulid::new(),
            name: "Test Lot".into(),
            address: "42 Example Avenue".into(),
            pin_code: "110001".into(),
            hourly_rate: Decimal::from(10),
            active: true,
            retired: false,
            spots: (0..capacity)
                .map(|i| Spot {
                    id: Ulid::new(),
                    label: spot_label(i),
                    occupant: None,
                })
                .collect(),
            reservations: BTreeMap::new(),
        }
    }

    // ── labels ──────────────────────────────────────────────

    #[test]
    fn labels_are_row_major() {
        assert_eq!(spot_label(0), "A01");
        assert_eq!(spot_label(9), "A10");
        assert_eq!(spot_label(10), "B01");
        assert_eq!(spot_label(19), "B10");
        assert_eq!(spot_label(MAX_SPOTS_PER_LOT as usize - 1), "Z10");
    }

    #[test]
    fn label_order_matches_creation_order() {
        let labels: Vec<String> = (0..MAX_SPOTS_PER_LOT as usize).map(spot_label).collect();
        let mut sorted = labels.clone();
        sorted.sort();
        assert_eq!(labels, sorted);
    }

    // ── allocation ──────────────────────────────────────────

    #[test]
    fn picks_smallest_available_label() {
        let mut lot = lot(12);
        for i in [0, 1, 2] {
            lot.spots[i].occupant = Some(Ulid::new());
        }
        assert_eq!(allocate(&lot).unwrap().label, "A04");
    }

    #[test]
    fn a10_comes_before_b01() {
        let mut lot = lot(11);
        for spot in lot.spots.iter_mut().take(9) {
            spot.occupant = Some(Ulid::new());
        }
        assert_eq!(allocate(&lot).unwrap().label, "A10");
    }

    #[test]
    fn allocation_is_deterministic() {
        let lot = lot(5);
        let first = allocate(&lot).unwrap().id;
        assert_eq!(allocate(&lot).unwrap().id, first);
    }

    #[test]
    fn full_lot_has_no_spot() {
        let mut lot = lot(2);
        for spot in &mut lot.spots {
            spot.occupant = Some(Ulid::new());
        }
        assert!(matches!(allocate(&lot), Err(EngineError::NoAvailableSpot(_))));
    }

    #[test]
    fn inactive_and_retired_lots_refuse() {
        let mut lot = lot(3);
        lot.active = false;
        assert!(matches!(allocate(&lot), Err(EngineError::LotInactive(_))));
        lot.retired = true;
        assert!(matches!(allocate(&lot), Err(EngineError::LotNotFound(_))));
    }
}
