//! Duration and cost rules.
//!
//! Two distinct rules apply. A finished stay is billed in whole hours,
//! rounded up, with a one hour minimum. A stay still in progress shows a
//! smooth estimate on the exact elapsed time. Money is rounded half-up to
//! two decimal places.

use rust_decimal::{Decimal, RoundingStrategy};

use crate::model::Ms;

const SECS_PER_HOUR: i64 = 3_600;

/// Currency rounding: two places, halves away from zero. The result always
/// carries exactly two places, so `100` prints as `100.00`.
pub fn round_money(amount: Decimal) -> Decimal {
    let mut rounded = amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(2);
    rounded
}

/// Whole seconds between `entry` and `until`. Clock skew yields 0.
pub fn elapsed_seconds(entry: Ms, until: Ms) -> i64 {
    (until - entry).div_euclid(1_000).max(0)
}

pub fn elapsed_minutes(seconds: i64) -> i64 {
    seconds.max(0) / 60
}

/// Exact elapsed hours.
pub fn elapsed_hours(seconds: i64) -> Decimal {
    Decimal::from(seconds.max(0)) / Decimal::from(SECS_PER_HOUR)
}

/// Hours billed for a finished stay: any part hour counts, minimum one.
pub fn billing_hours(seconds: i64) -> i64 {
    let seconds = seconds.max(0);
    let whole = seconds / SECS_PER_HOUR;
    let part = i64::from(seconds % SECS_PER_HOUR > 0);
    (whole + part).max(1)
}

pub fn final_cost(seconds: i64, hourly_rate: Decimal) -> Decimal {
    round_money(Decimal::from(billing_hours(seconds)) * hourly_rate)
}

pub fn estimated_cost(seconds: i64, hourly_rate: Decimal) -> Decimal {
    round_money(elapsed_hours(seconds) * hourly_rate)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CostBreakdown {
    pub hourly_rate: Decimal,
    pub elapsed_seconds: i64,
    pub duration_minutes: i64,
    /// Exact hours, rounded to two places for display.
    pub elapsed_hours: Decimal,
    /// Only set once the stay is finalized.
    pub billing_hours: Option<i64>,
    pub cost: Decimal,
    pub is_final: bool,
}

impl CostBreakdown {
    pub fn estimate(entry: Ms, now: Ms, hourly_rate: Decimal) -> Self {
        let secs = elapsed_seconds(entry, now);
        Self {
            hourly_rate,
            elapsed_seconds: secs,
            duration_minutes: elapsed_minutes(secs),
            elapsed_hours: round_money(elapsed_hours(secs)),
            billing_hours: None,
            cost: estimated_cost(secs, hourly_rate),
            is_final: false,
        }
    }

    pub fn finalize(entry: Ms, exit: Ms, hourly_rate: Decimal) -> Self {
        let secs = elapsed_seconds(entry, exit);
        Self {
            hourly_rate,
            elapsed_seconds: secs,
            duration_minutes: elapsed_minutes(secs),
            elapsed_hours: round_money(elapsed_hours(secs)),
            billing_hours: Some(billing_hours(secs)),
            cost: final_cost(secs, hourly_rate),
            is_final: true,
        }
    }
}
