//! Expiration of patterns that stay open too long
//!
//! A live pattern expires when its anchor date falls more than the horizon
//! behind the latest bar processed for its series, whatever progress it made
//! since. The scanner applies [`ExpirationPolicy::is_stale`] before every bar.
//! [`sweep_series`] and [`sweep`] apply it to series that stopped receiving bars.

use std::collections::HashMap;

use chrono::{Days, NaiveDate};
use rayon::prelude::*;

use crate::params::{get_days, ParamMeta, Parameterized, EXPIRATION_DAYS};
use crate::pattern::{PatternId, PatternStages};
use crate::registry::{ActiveRegistry, SeriesSlot};
use crate::{PatternError, Result};

/// Calendar days after its anchor before an open pattern expires
pub const DEFAULT_EXPIRATION_DAYS: u32 = 1200;

/// Expiration horizon (must be > 0 days)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExpirationPolicy(u32);

impl Default for ExpirationPolicy {
    fn default() -> Self {
        Self(DEFAULT_EXPIRATION_DAYS)
    }
}

impl ExpirationPolicy {
    pub fn new(horizon_days: u32) -> Result<Self> {
        if horizon_days == 0 {
            return Err(PatternError::InvalidValue("Expiration horizon must be > 0 days"));
        }
        Ok(Self(horizon_days))
    }

    #[doc(hidden)]
    pub const fn new_const(horizon_days: u32) -> Self {
        Self(horizon_days)
    }

    #[inline]
    pub fn horizon_days(self) -> u32 {
        self.0
    }

    /// More than `horizon_days` separate `anchored` from `as_of`
    #[inline]
    pub fn is_stale(self, anchored: NaiveDate, as_of: NaiveDate) -> bool {
        as_of.signed_duration_since(anchored).num_days() > i64::from(self.0)
    }

    /// Last date on which a pattern anchored at `anchored` is still live
    pub fn live_until(self, anchored: NaiveDate) -> Option<NaiveDate> {
        anchored.checked_add_days(Days::new(u64::from(self.0)))
    }
}

impl serde::Serialize for ExpirationPolicy {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        self.0.serialize(s)
    }
}

impl<'de> serde::Deserialize<'de> for ExpirationPolicy {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let days = u32::deserialize(d)?;
        ExpirationPolicy::new(days).map_err(serde::de::Error::custom)
    }
}

static EXPIRATION_PARAMS: &[ParamMeta] = &[EXPIRATION_DAYS];

impl Parameterized for ExpirationPolicy {
    fn param_meta() -> &'static [ParamMeta] {
        EXPIRATION_PARAMS
    }

    fn with_params(params: &HashMap<&str, f64>) -> Result<Self> {
        let days = get_days(params, EXPIRATION_DAYS.name, DEFAULT_EXPIRATION_DAYS)?;
        Self::new(days)
    }
}

// ============================================================
// SWEEPER
// ============================================================

/// What a sweep looked at and what it expired
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Live patterns checked
    pub examined: usize,
    pub expired: Vec<PatternId>,
}

impl SweepReport {
    fn merge(&mut self, other: SweepReport) {
        self.examined += other.examined;
        self.expired.extend(other.expired);
    }
}

/// Expire stale live patterns of one series.
///
/// `as_of` defaults to the latest bar processed for the series; a series with no
/// processed bars is left untouched. Already expired records are not revisited.
pub fn sweep_series(
    slot: &mut SeriesSlot,
    policy: &ExpirationPolicy,
    as_of: Option<NaiveDate>,
) -> SweepReport {
    let mut report = SweepReport::default();
    let Some(as_of) = as_of.or_else(|| slot.latest_bar_date()) else {
        return report;
    };

    for tracker in slot.trackers.values_mut() {
        let Some(pattern) = tracker.live.as_ref() else {
            continue;
        };
        report.examined += 1;
        if !policy.is_stale(pattern.anchor.date, as_of) {
            continue;
        }
        if let Some(mut pattern) = tracker.live.take() {
            pattern.mark_expired();
            tracing::debug!(
                pattern = %pattern.id(),
                last_observed = %pattern.last_observed_date,
                %as_of,
                "pattern expired by sweep"
            );
            report.expired.push(pattern.id());
            slot.expired.push(pattern);
        }
    }

    report
}

/// Sweep every series of the registry, one rayon task per series
pub fn sweep(registry: &mut ActiveRegistry, policy: &ExpirationPolicy) -> SweepReport {
    let reports: Vec<SweepReport> = registry
        .series
        .par_iter_mut()
        .map(|(_, slot)| sweep_series(slot, policy, None))
        .collect();

    let mut total = SweepReport::default();
    for report in reports {
        total.merge(report);
    }
    total.expired.sort();

    tracing::info!(
        examined = total.examined,
        expired = total.expired.len(),
        horizon_days = policy.horizon_days(),
        "expiration sweep finished"
    );
    total
}
