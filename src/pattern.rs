//! Pattern records
//!
//! An [`ActivePattern`] is the in-flight state of one pattern. Its stages are an
//! enum ([`Progress`]), so a record cannot hold an extreme without a threshold
//! crossing or a recovery without an extreme. A [`CompletedPattern`] is the
//! immutable snapshot taken when price returns to the anchor.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{Direction, Price, PriceBar, Result, SeriesId, Threshold};

// ============================================================
// KEYS
// ============================================================

/// A price observed on a given date
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mark {
    pub price: Price,
    pub date: NaiveDate,
}

impl Mark {
    #[inline]
    pub fn new(price: Price, date: NaiveDate) -> Self {
        Self { price, date }
    }
}

/// Identifies one independent state machine: a series scanned at one threshold in one direction
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PatternKey {
    pub series_id: SeriesId,
    pub threshold_bp: Threshold,
    pub direction: Direction,
}

impl PatternKey {
    pub fn new(series_id: SeriesId, threshold_bp: Threshold, direction: Direction) -> Self {
        Self { series_id, threshold_bp, direction }
    }

    #[inline]
    pub fn with_anchor(self, anchor_date: NaiveDate) -> PatternId {
        PatternId {
            series_id: self.series_id,
            threshold_bp: self.threshold_bp,
            direction: self.direction,
            anchor_date,
        }
    }
}

impl std::fmt::Display for PatternKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}bp/{}", self.series_id, self.threshold_bp.bp(), self.direction)
    }
}

/// Identity of a single pattern record
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PatternId {
    pub series_id: SeriesId,
    pub threshold_bp: Threshold,
    pub direction: Direction,
    pub anchor_date: NaiveDate,
}

impl PatternId {
    #[inline]
    pub fn key(&self) -> PatternKey {
        PatternKey::new(self.series_id, self.threshold_bp, self.direction)
    }
}

impl std::fmt::Display for PatternId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.key(), self.anchor_date)
    }
}

// ============================================================
// STAGES
// ============================================================

/// Recovery-side state, present once the recovery level has been crossed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recovery {
    /// First crossing of the recovery level since the current extreme
    pub mark: Mark,
    /// Crossings of the recovery level in either direction, starting at 1
    pub crossings: u32,
    /// Price currently sits on the recovery side of the level
    pub recovered: bool,
}

impl Recovery {
    pub fn first(mark: Mark) -> Self {
        Self { mark, crossings: 1, recovered: true }
    }
}

/// How far an active pattern has progressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum Progress {
    /// Waiting for the threshold crossing; the anchor may still move
    Seeking,
    /// Threshold crossed, following the extreme
    Tracking { threshold: Mark, extreme: Mark },
    /// Recovery level crossed at least once, waiting for the return to the anchor
    Recovering {
        threshold: Mark,
        extreme: Mark,
        recovery: Recovery,
    },
}

impl Progress {
    pub fn threshold(&self) -> Option<Mark> {
        match self {
            Progress::Seeking => None,
            Progress::Tracking { threshold, .. } | Progress::Recovering { threshold, .. } => {
                Some(*threshold)
            }
        }
    }

    pub fn extreme(&self) -> Option<Mark> {
        match self {
            Progress::Seeking => None,
            Progress::Tracking { extreme, .. } | Progress::Recovering { extreme, .. } => {
                Some(*extreme)
            }
        }
    }

    pub fn recovery(&self) -> Option<Recovery> {
        match self {
            Progress::Recovering { recovery, .. } => Some(*recovery),
            _ => None,
        }
    }

    pub fn stage_name(&self) -> &'static str {
        match self {
            Progress::Seeking => "seeking",
            Progress::Tracking { .. } => "tracking",
            Progress::Recovering { .. } => "recovering",
        }
    }
}

/// Read access shared by active and completed records
pub trait PatternStages {
    fn id(&self) -> PatternId;
    fn direction(&self) -> Direction;
    fn anchor(&self) -> Mark;
    fn threshold_mark(&self) -> Option<Mark>;
    fn extreme(&self) -> Option<Mark>;
    fn recovery(&self) -> Option<Mark>;
    fn closing(&self) -> Option<Mark>;
    fn crossing_count(&self) -> u32;
    fn is_completed(&self) -> bool;
    fn is_expired(&self) -> bool;
}

// ============================================================
// ACTIVE PATTERN
// ============================================================

/// In-flight pattern, mutated bar by bar until it closes or expires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivePattern {
    pub series_id: SeriesId,
    pub direction: Direction,
    pub threshold_bp: Threshold,
    pub anchor: Mark,
    pub progress: Progress,
    /// Date of the last bar fed to this record
    pub last_observed_date: NaiveDate,
    /// Seeded from a predecessor's closing bar rather than a cold start
    pub spawned: bool,
    pub expired: bool,
}

impl ActivePattern {
    /// Cold start anchored at the bar's away extreme (high for `Down`)
    pub fn seed<B: PriceBar + ?Sized>(key: PatternKey, bar: &B) -> Self {
        let anchor = Mark::new(key.direction.away(bar), bar.date());
        Self::anchored(key, anchor, false)
    }

    /// Successor of a completed pattern, anchored at its closing mark
    pub fn spawn(key: PatternKey, anchor: Mark) -> Self {
        Self::anchored(key, anchor, true)
    }

    fn anchored(key: PatternKey, anchor: Mark, spawned: bool) -> Self {
        Self {
            series_id: key.series_id,
            direction: key.direction,
            threshold_bp: key.threshold_bp,
            anchor,
            progress: Progress::Seeking,
            last_observed_date: anchor.date,
            spawned,
            expired: false,
        }
    }

    #[inline]
    pub fn key(&self) -> PatternKey {
        PatternKey::new(self.series_id, self.threshold_bp, self.direction)
    }

    pub fn recovery_state(&self) -> Option<Recovery> {
        self.progress.recovery()
    }

    /// Price the toward side must reach to open the pattern
    pub fn threshold_level(&self) -> Result<Price> {
        self.direction.level(self.anchor.price, self.threshold_bp)
    }

    /// Price the away side must reach to count as recovering, once an extreme exists
    pub fn recovery_level(&self) -> Result<Option<Price>> {
        self.progress
            .extreme()
            .map(|e| self.direction.opposite().level(e.price, self.threshold_bp))
            .transpose()
    }

    /// Set the terminal flag. Returns false when it was already set.
    pub fn mark_expired(&mut self) -> bool {
        if self.expired {
            return false;
        }
        self.expired = true;
        true
    }
}

impl PatternStages for ActivePattern {
    fn id(&self) -> PatternId {
        self.key().with_anchor(self.anchor.date)
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn anchor(&self) -> Mark {
        self.anchor
    }

    fn threshold_mark(&self) -> Option<Mark> {
        self.progress.threshold()
    }

    fn extreme(&self) -> Option<Mark> {
        self.progress.extreme()
    }

    fn recovery(&self) -> Option<Mark> {
        self.progress.recovery().map(|r| r.mark)
    }

    fn closing(&self) -> Option<Mark> {
        None
    }

    fn crossing_count(&self) -> u32 {
        self.progress.recovery().map_or(0, |r| r.crossings)
    }

    fn is_completed(&self) -> bool {
        false
    }

    fn is_expired(&self) -> bool {
        self.expired
    }
}

// ============================================================
// COMPLETED PATTERN
// ============================================================

/// Archived pattern. Every stage is present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPattern {
    pub series_id: SeriesId,
    pub direction: Direction,
    pub threshold_bp: Threshold,
    pub anchor: Mark,
    pub threshold: Mark,
    pub extreme: Mark,
    pub recovery: Mark,
    pub closing: Mark,
    pub crossing_count: u32,
    pub spawned: bool,
}

impl CompletedPattern {
    #[inline]
    pub fn key(&self) -> PatternKey {
        PatternKey::new(self.series_id, self.threshold_bp, self.direction)
    }

    /// Completed High → Low → Rebound
    #[inline]
    pub fn is_rebound(&self) -> bool {
        self.direction.is_down()
    }

    /// Completed Low → High → Reversal
    #[inline]
    pub fn is_reversal(&self) -> bool {
        self.direction.is_up()
    }
}

impl PatternStages for CompletedPattern {
    fn id(&self) -> PatternId {
        self.key().with_anchor(self.anchor.date)
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn anchor(&self) -> Mark {
        self.anchor
    }

    fn threshold_mark(&self) -> Option<Mark> {
        Some(self.threshold)
    }

    fn extreme(&self) -> Option<Mark> {
        Some(self.extreme)
    }

    fn recovery(&self) -> Option<Mark> {
        Some(self.recovery)
    }

    fn closing(&self) -> Option<Mark> {
        Some(self.closing)
    }

    fn crossing_count(&self) -> u32 {
        self.crossing_count
    }

    fn is_completed(&self) -> bool {
        true
    }

    fn is_expired(&self) -> bool {
        false
    }
}
