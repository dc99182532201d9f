//! Derived metrics: elapsed days, calendar breakdowns and status flags
//!
//! Everything here is a pure projection of a record. "Now" is always the
//! caller-supplied reference date (normally the latest bar), never the wall clock.

use chrono::{Datelike, NaiveDate};
use serde::Serialize;

use crate::pattern::{Mark, PatternStages};
use crate::BASIS_POINTS;

/// Read-only projection of an active or completed pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DerivedMetrics {
    pub anchor_to_threshold_days: Option<i64>,
    pub anchor_to_extreme_days: Option<i64>,
    pub anchor_to_recovery_days: Option<i64>,
    pub anchor_to_close_days: Option<i64>,
    pub threshold_to_extreme_days: Option<i64>,
    pub threshold_to_recovery_days: Option<i64>,
    pub threshold_to_close_days: Option<i64>,
    pub extreme_to_recovery_days: Option<i64>,
    pub extreme_to_close_days: Option<i64>,
    pub recovery_to_close_days: Option<i64>,
    /// Days from the threshold crossing to the reference date; still-active only
    pub threshold_to_now_days: Option<i64>,

    pub threshold_year: Option<i32>,
    pub threshold_month: Option<u32>,
    pub close_year: Option<i32>,
    pub close_month: Option<u32>,

    /// Size of the move from anchor to extreme, in basis points of the anchor
    pub depth_bp: Option<i64>,

    /// Open, unexpired decline (High → Low)
    pub is_high: bool,
    /// Open, unexpired rise (Low → High)
    pub is_low: bool,
    pub is_rebound: bool,
    pub is_reversal: bool,
    pub still_active: bool,
    pub expired: bool,
}

impl DerivedMetrics {
    pub fn compute<P: PatternStages + ?Sized>(pattern: &P, as_of: NaiveDate) -> Self {
        let anchor = Some(pattern.anchor());
        let threshold = pattern.threshold_mark();
        let extreme = pattern.extreme();
        let recovery = pattern.recovery();
        let closing = pattern.closing();

        let direction = pattern.direction();
        let completed = pattern.is_completed();
        let expired = pattern.is_expired();
        let still_active = !completed && !expired;

        let threshold_to_now_days = match threshold {
            Some(t) if still_active => Some(as_of.signed_duration_since(t.date).num_days().max(0)),
            _ => None,
        };

        Self {
            anchor_to_threshold_days: days_between(anchor, threshold),
            anchor_to_extreme_days: days_between(anchor, extreme),
            anchor_to_recovery_days: days_between(anchor, recovery),
            anchor_to_close_days: days_between(anchor, closing),
            threshold_to_extreme_days: days_between(threshold, extreme),
            threshold_to_recovery_days: days_between(threshold, recovery),
            threshold_to_close_days: days_between(threshold, closing),
            extreme_to_recovery_days: days_between(extreme, recovery),
            extreme_to_close_days: days_between(extreme, closing),
            recovery_to_close_days: days_between(recovery, closing),
            threshold_to_now_days,

            threshold_year: threshold.map(|m| m.date.year()),
            threshold_month: threshold.map(|m| m.date.month()),
            close_year: closing.map(|m| m.date.year()),
            close_month: closing.map(|m| m.date.month()),

            depth_bp: extreme.map(|e| depth_bp(pattern.anchor(), e)),

            is_high: still_active && direction.is_down(),
            is_low: still_active && direction.is_up(),
            is_rebound: completed && direction.is_down(),
            is_reversal: completed && direction.is_up(),
            still_active,
            expired,
        }
    }
}

fn days_between(from: Option<Mark>, to: Option<Mark>) -> Option<i64> {
    let (from, to) = (from?, to?);
    Some(to.date.signed_duration_since(from.date).num_days().max(0))
}

fn depth_bp(anchor: Mark, extreme: Mark) -> i64 {
    let delta = (i128::from(extreme.price.raw()) - i128::from(anchor.price.raw())).abs();
    let bp = delta * i128::from(BASIS_POINTS) / i128::from(anchor.price.raw());
    i64::try_from(bp).unwrap_or(i64::MAX)
}
