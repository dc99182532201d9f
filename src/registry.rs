//! Live pattern registry
//!
//! Each series owns a [`SeriesSlot`]: one [`Tracker`] per (threshold, direction)
//! plus the list of patterns that expired in it. Slots never share state, so the
//! scanner and the sweeper hand each one to a separate rayon task.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::expiration::ExpirationPolicy;
use crate::pattern::{ActivePattern, CompletedPattern, PatternId, PatternKey, PatternStages};
use crate::transition::apply_bar;
use crate::{Direction, PatternError, PriceBar, Result, SeriesId, Threshold};

// ============================================================
// TRACKER
// ============================================================

/// State machine driver for one pattern key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tracker {
    /// At most one live pattern per key
    pub live: Option<ActivePattern>,
    /// Date of the last bar fed to this tracker
    pub cursor: Option<NaiveDate>,
}

/// What a single bar did to a tracker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BarOutcome {
    pub completed: Option<CompletedPattern>,
    /// Live pattern retired because it went stale before this bar
    pub expired: Option<ActivePattern>,
    /// Id the live pattern carried before this bar re-anchored it
    pub superseded: Option<PatternId>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one bar.
    ///
    /// Order: reject bars at or before the cursor, seed when idle, expire a pattern
    /// anchored more than the horizon ago and seed a fresh one from this bar,
    /// otherwise run the state machine.
    /// On error the tracker is left as it was before the call.
    pub fn advance<B: PriceBar + ?Sized>(
        &mut self,
        key: PatternKey,
        bar: &B,
        policy: &ExpirationPolicy,
    ) -> Result<BarOutcome> {
        let date = bar.date();
        if let Some(previous) = self.cursor {
            if date <= previous {
                return Err(PatternError::OutOfOrder { previous, got: date });
            }
        }

        let outcome = match self.live.take() {
            None => {
                self.live = Some(ActivePattern::seed(key, bar));
                BarOutcome::default()
            }
            Some(mut stale) if policy.is_stale(stale.anchor.date, date) => {
                stale.mark_expired();
                tracing::debug!(
                    pattern = %stale.id(),
                    last_observed = %stale.last_observed_date,
                    %date,
                    "pattern expired"
                );
                self.live = Some(ActivePattern::seed(key, bar));
                BarOutcome { expired: Some(stale), ..BarOutcome::default() }
            }
            Some(pattern) => {
                // no heap data, so the rollback copy is a plain memcpy
                let fallback = pattern.clone();
                match apply_bar(pattern, bar) {
                    Ok(transition) => {
                        self.live = Some(transition.active);
                        BarOutcome {
                            completed: transition.completed,
                            expired: None,
                            superseded: transition.superseded,
                        }
                    }
                    Err(e) => {
                        self.live = Some(fallback);
                        return Err(e);
                    }
                }
            }
        };

        self.cursor = Some(date);
        Ok(outcome)
    }
}

// ============================================================
// SERIES SLOT
// ============================================================

/// All pattern state of one series
///
/// Expired records accumulate until [`drain_expired`](Self::drain_expired) hands
/// them over, and [`restore`](Self::restore) deduplicates them with a linear
/// scan. Callers that persist expired records should drain after each commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesSlot {
    series_id: SeriesId,
    pub(crate) trackers: BTreeMap<(Threshold, Direction), Tracker>,
    pub(crate) expired: Vec<ActivePattern>,
}

impl SeriesSlot {
    pub fn new(series_id: SeriesId) -> Self {
        Self {
            series_id,
            trackers: BTreeMap::new(),
            expired: Vec::new(),
        }
    }

    #[inline]
    pub fn series_id(&self) -> SeriesId {
        self.series_id
    }

    pub fn tracker(&self, threshold: Threshold, direction: Direction) -> Option<&Tracker> {
        self.trackers.get(&(threshold, direction))
    }

    /// Tracker for the pair, created empty on first use
    pub fn tracker_mut(&mut self, threshold: Threshold, direction: Direction) -> &mut Tracker {
        self.trackers.entry((threshold, direction)).or_default()
    }

    pub fn live(&self, threshold: Threshold, direction: Direction) -> Option<&ActivePattern> {
        self.tracker(threshold, direction).and_then(|t| t.live.as_ref())
    }

    pub fn live_patterns(&self) -> impl Iterator<Item = &ActivePattern> {
        self.trackers.values().filter_map(|t| t.live.as_ref())
    }

    pub fn expired_patterns(&self) -> &[ActivePattern] {
        &self.expired
    }

    /// Hand expired records to the caller (e.g. after persisting them)
    pub fn drain_expired(&mut self) -> Vec<ActivePattern> {
        std::mem::take(&mut self.expired)
    }

    /// Latest bar date processed by any tracker of the series
    pub fn latest_bar_date(&self) -> Option<NaiveDate> {
        self.trackers.values().filter_map(|t| t.cursor).max()
    }

    /// Re-insert a persisted record.
    ///
    /// Expired records join the expired list; a live record becomes the tracker's
    /// pattern. Restoring the same record twice is a no-op; a different live
    /// record for an occupied key is a conflict.
    pub fn restore(&mut self, pattern: ActivePattern) -> Result<()> {
        if pattern.series_id != self.series_id {
            return Err(PatternError::InvalidRecord("pattern belongs to another series"));
        }
        let id = pattern.id();

        if pattern.expired {
            if !self.expired.iter().any(|p| p.id() == id) {
                self.expired.push(pattern);
            }
            return Ok(());
        }

        let tracker = self.tracker_mut(pattern.threshold_bp, pattern.direction);
        if let Some(existing) = tracker.live.as_ref() {
            if existing.id() != id {
                return Err(PatternError::Conflict(existing.id()));
            }
        }
        tracker.cursor = tracker.cursor.max(Some(pattern.last_observed_date));
        tracker.live = Some(pattern);
        Ok(())
    }

    /// Remove a record, live or expired
    pub fn take(&mut self, id: &PatternId) -> Result<ActivePattern> {
        if let Some(tracker) = self.trackers.get_mut(&(id.threshold_bp, id.direction)) {
            if tracker.live.as_ref().is_some_and(|p| p.id() == *id) {
                if let Some(pattern) = tracker.live.take() {
                    return Ok(pattern);
                }
            }
        }
        match self.expired.iter().position(|p| p.id() == *id) {
            Some(pos) => Ok(self.expired.remove(pos)),
            None => Err(PatternError::MissingPattern(*id)),
        }
    }
}

// ============================================================
// REGISTRY
// ============================================================

/// Live and expired patterns across all series
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveRegistry {
    pub(crate) series: BTreeMap<SeriesId, SeriesSlot>,
}

impl ActiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot(&self, series_id: SeriesId) -> Option<&SeriesSlot> {
        self.series.get(&series_id)
    }

    /// Slot for the series, created empty on first use
    pub fn slot_mut(&mut self, series_id: SeriesId) -> &mut SeriesSlot {
        self.series
            .entry(series_id)
            .or_insert_with(|| SeriesSlot::new(series_id))
    }

    pub fn series_ids(&self) -> impl Iterator<Item = SeriesId> + '_ {
        self.series.keys().copied()
    }

    /// Look up a record, live or expired
    pub fn get(&self, id: &PatternId) -> Option<&ActivePattern> {
        let slot = self.series.get(&id.series_id)?;
        slot.live(id.threshold_bp, id.direction)
            .filter(|p| p.id() == *id)
            .or_else(|| slot.expired.iter().find(|p| p.id() == *id))
    }

    /// The live pattern for a key, if any
    pub fn live(&self, key: &PatternKey) -> Option<&ActivePattern> {
        self.series
            .get(&key.series_id)?
            .live(key.threshold_bp, key.direction)
    }

    pub fn restore(&mut self, pattern: ActivePattern) -> Result<()> {
        self.slot_mut(pattern.series_id).restore(pattern)
    }

    /// Restore many records; stops at the first failure
    pub fn restore_all<I>(&mut self, patterns: I) -> Result<usize>
    where
        I: IntoIterator<Item = ActivePattern>,
    {
        let mut restored = 0;
        for pattern in patterns {
            self.restore(pattern)?;
            restored += 1;
        }
        Ok(restored)
    }

    pub fn take(&mut self, id: &PatternId) -> Result<ActivePattern> {
        match self.series.get_mut(&id.series_id) {
            Some(slot) => slot.take(id),
            None => Err(PatternError::MissingPattern(*id)),
        }
    }

    /// Expire a live pattern by id.
    ///
    /// Returns false when nothing changed: the record is already expired, or it
    /// does not exist (logged as a warning).
    pub fn expire(&mut self, id: &PatternId) -> bool {
        if self.get(id).is_some_and(|p| p.expired) {
            return false;
        }
        match self.take(id) {
            Ok(mut pattern) => {
                pattern.mark_expired();
                tracing::debug!(pattern = %id, "pattern expired on request");
                self.slot_mut(id.series_id).expired.push(pattern);
                true
            }
            Err(error) => {
                tracing::warn!(pattern = %id, %error, "expiration skipped");
                false
            }
        }
    }

    pub fn live_patterns(&self) -> impl Iterator<Item = &ActivePattern> {
        self.series.values().flat_map(|s| s.live_patterns())
    }

    pub fn expired_patterns(&self) -> impl Iterator<Item = &ActivePattern> {
        self.series.values().flat_map(|s| s.expired.iter())
    }

    pub fn drain_expired(&mut self) -> Vec<ActivePattern> {
        self.series
            .values_mut()
            .flat_map(SeriesSlot::drain_expired)
            .collect()
    }

    /// Number of live patterns
    pub fn len(&self) -> usize {
        self.live_patterns().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
