//! Scanner engine
//!
//! [`PatternScanner`] feeds bars to every (threshold, direction) tracker of a
//! series. [`scan_parallel`] runs many series at once, one rayon task per
//! [`SeriesSlot`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::NaiveDate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::archive::CompletedArchive;
use crate::expiration::ExpirationPolicy;
use crate::params::{get_threshold, ParamMeta, ParamType, Parameterized, EXPIRATION_DAYS, THRESHOLD_BP};
use crate::pattern::{CompletedPattern, PatternId, PatternKey, PatternStages};
use crate::registry::{ActiveRegistry, SeriesSlot};
use crate::{Direction, PatternError, PriceBar, PriceBarExt, Result, SeriesId, Threshold};

/// Thresholds scanned when none are configured: 10% to 30% in 5% steps
pub const DEFAULT_THRESHOLDS_BP: [u32; 5] = [1000, 1500, 2000, 2500, 3000];

// ============================================================
// CONFIG
// ============================================================

/// Scanner configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub thresholds: Vec<Threshold>,
    pub directions: Vec<Direction>,
    pub expiration: ExpirationPolicy,
    pub validate_data: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            thresholds: DEFAULT_THRESHOLDS_BP.map(Threshold::new_const).to_vec(),
            directions: Direction::ALL.to_vec(),
            expiration: ExpirationPolicy::default(),
            validate_data: true,
        }
    }
}

impl ScanConfig {
    pub fn validate(&self) -> Result<()> {
        if self.thresholds.is_empty() {
            return Err(PatternError::InvalidConfig("no thresholds configured".into()));
        }
        if self.directions.is_empty() {
            return Err(PatternError::InvalidConfig("no directions configured".into()));
        }
        let mut seen = BTreeSet::new();
        for t in &self.thresholds {
            if !seen.insert(*t) {
                return Err(PatternError::InvalidConfig(format!("duplicate threshold {} bp", t.bp())));
            }
        }
        let mut seen = BTreeSet::new();
        for d in &self.directions {
            if !seen.insert(*d) {
                return Err(PatternError::InvalidConfig(format!("duplicate direction {d}")));
            }
        }
        Ok(())
    }

    /// Every key this configuration tracks for a series
    pub fn keys(&self, series_id: SeriesId) -> impl Iterator<Item = PatternKey> + '_ {
        self.thresholds.iter().flat_map(move |&t| {
            self.directions
                .iter()
                .map(move |&d| PatternKey::new(series_id, t, d))
        })
    }
}

static SCAN_PARAMS: &[ParamMeta] = &[THRESHOLD_BP, EXPIRATION_DAYS];

impl Parameterized for ScanConfig {
    fn param_meta() -> &'static [ParamMeta] {
        SCAN_PARAMS
    }

    /// A single `threshold_bp` replaces the default threshold set
    fn with_params(params: &HashMap<&str, f64>) -> Result<Self> {
        let mut config = Self::default();
        if params.contains_key(THRESHOLD_BP.name) {
            config.thresholds = vec![get_threshold(params, THRESHOLD_BP.name, 2000)?];
        }
        config.expiration = ExpirationPolicy::with_params(params)?;
        Ok(config)
    }
}

// ============================================================
// RESULTS
// ============================================================

/// Outcome of feeding a batch of bars to one series
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesScan {
    pub series_id: SeriesId,
    /// Patterns closed by this batch, in bar order
    pub completed: Vec<CompletedPattern>,
    /// Patterns that went stale during this batch
    pub expired: Vec<PatternId>,
    /// Seeking patterns whose id changed when a bar moved their anchor; stored
    /// rows under these ids are obsolete
    pub superseded: Vec<PatternId>,
    /// Pairs that stopped on an error; other pairs kept going
    pub failures: Vec<ScanError>,
    pub bars_processed: usize,
    pub cancelled: bool,
}

impl SeriesScan {
    fn new(series_id: SeriesId) -> Self {
        Self {
            series_id,
            completed: Vec::new(),
            expired: Vec::new(),
            superseded: Vec::new(),
            failures: Vec::new(),
            bars_processed: 0,
            cancelled: false,
        }
    }
}

/// Error from scanning one series, or one pair of it when `key` is set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanError {
    pub series_id: SeriesId,
    pub key: Option<PatternKey>,
    pub error: PatternError,
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.key {
            Some(key) => write!(f, "{key}: {}", self.error),
            None => write!(f, "{}: {}", self.series_id, self.error),
        }
    }
}

// ============================================================
// PATTERN SCANNER
// ============================================================

/// Drives the per-key state machines of a series
#[derive(Debug, Clone)]
pub struct PatternScanner {
    config: ScanConfig,
}

impl PatternScanner {
    pub fn new(config: ScanConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    #[inline]
    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Feed `bars` (strictly increasing dates) to every tracker of the slot.
    pub fn scan_series<T: PriceBar>(&self, slot: &mut SeriesSlot, bars: &[T]) -> Result<SeriesScan> {
        self.scan_series_cancellable(slot, bars, &AtomicBool::new(false))
    }

    /// Like [`scan_series`](Self::scan_series), checking `cancel` before each bar.
    ///
    /// On cancellation every tracker has seen the same prefix of `bars`.
    pub fn scan_series_cancellable<T: PriceBar>(
        &self,
        slot: &mut SeriesSlot,
        bars: &[T],
        cancel: &AtomicBool,
    ) -> Result<SeriesScan> {
        if self.config.validate_data {
            validate_bars(bars)?;
        }
        check_order(bars)?;

        let series_id = slot.series_id();
        let mut scan = SeriesScan::new(series_id);
        let mut halted: BTreeSet<(Threshold, Direction)> = BTreeSet::new();

        for bar in bars {
            if cancel.load(Ordering::Relaxed) {
                tracing::debug!(series = %series_id, processed = scan.bars_processed, "scan cancelled");
                scan.cancelled = true;
                break;
            }
            tracing::trace!(series = %series_id, date = %bar.date(), "bar");

            for key in self.config.keys(series_id) {
                let pair = (key.threshold_bp, key.direction);
                if halted.contains(&pair) {
                    continue;
                }
                let tracker = slot.tracker_mut(key.threshold_bp, key.direction);
                match tracker.advance(key, bar, &self.config.expiration) {
                    Ok(outcome) => {
                        if let Some(expired) = outcome.expired {
                            scan.expired.push(expired.id());
                            slot.expired.push(expired);
                        }
                        scan.completed.extend(outcome.completed);
                        scan.superseded.extend(outcome.superseded);
                    }
                    Err(error) => {
                        tracing::warn!(%key, %error, "pair scan stopped");
                        halted.insert(pair);
                        scan.failures.push(ScanError { series_id, key: Some(key), error });
                    }
                }
            }
            scan.bars_processed += 1;
        }

        tracing::debug!(
            series = %series_id,
            bars = scan.bars_processed,
            completed = scan.completed.len(),
            expired = scan.expired.len(),
            failures = scan.failures.len(),
            "series scanned"
        );
        Ok(scan)
    }

    /// Scan one series against the registry and archive its completed patterns
    pub fn scan<T: PriceBar>(
        &self,
        registry: &mut ActiveRegistry,
        archive: &mut CompletedArchive,
        series_id: SeriesId,
        bars: &[T],
    ) -> Result<SeriesScan> {
        let scan = self.scan_series(registry.slot_mut(series_id), bars)?;
        archive.extend(scan.completed.iter().cloned());
        Ok(scan)
    }
}

fn validate_bars<T: PriceBar>(bars: &[T]) -> Result<()> {
    for (i, bar) in bars.iter().enumerate() {
        bar.validate().map_err(|e| match e {
            PatternError::InvalidBar { reason, .. } => PatternError::InvalidBar { index: i, reason },
            other => other,
        })?;
    }
    Ok(())
}

fn check_order<T: PriceBar>(bars: &[T]) -> Result<()> {
    let mut previous: Option<NaiveDate> = None;
    for bar in bars {
        let got = bar.date();
        if let Some(previous) = previous {
            if got <= previous {
                return Err(PatternError::OutOfOrder { previous, got });
            }
        }
        previous = Some(got);
    }
    Ok(())
}

// ============================================================
// BUILDER
// ============================================================

/// Builder for creating PatternScanner instances
#[derive(Debug, Clone)]
pub struct ScannerBuilder {
    config: ScanConfig,
}

impl Default for ScannerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ScannerBuilder {
    /// Empty threshold set, both directions, default expiration
    pub fn new() -> Self {
        Self {
            config: ScanConfig {
                thresholds: Vec::new(),
                ..ScanConfig::default()
            },
        }
    }

    /// Start from an existing configuration
    pub fn from_config(config: ScanConfig) -> Self {
        Self { config }
    }

    /// Add the default threshold set
    pub fn with_default_thresholds(mut self) -> Self {
        self.config
            .thresholds
            .extend(DEFAULT_THRESHOLDS_BP.map(Threshold::new_const));
        self
    }

    pub fn threshold(mut self, threshold: Threshold) -> Self {
        self.config.thresholds.push(threshold);
        self
    }

    pub fn thresholds(mut self, thresholds: impl IntoIterator<Item = Threshold>) -> Self {
        self.config.thresholds.extend(thresholds);
        self
    }

    /// Add every value of a basis-point parameter grid
    pub fn threshold_grid(mut self, meta: &ParamMeta) -> Result<Self> {
        if meta.param_type != ParamType::BasisPoints {
            return Err(PatternError::InvalidConfig(format!(
                "{} is not a basis point parameter",
                meta.name
            )));
        }
        for value in meta.generate_grid() {
            meta.validate(value)?;
            self.config.thresholds.push(Threshold::new(value as u32)?);
        }
        Ok(self)
    }

    /// Replace the direction set
    pub fn directions(mut self, directions: impl IntoIterator<Item = Direction>) -> Self {
        self.config.directions = directions.into_iter().collect();
        self
    }

    pub fn expiration(mut self, policy: ExpirationPolicy) -> Self {
        self.config.expiration = policy;
        self
    }

    /// Enable/disable bar shape validation
    pub fn validate_data(mut self, enable: bool) -> Self {
        self.config.validate_data = enable;
        self
    }

    /// Apply `threshold_bp` / `expiration_days` from loose parameters
    pub fn with_params(mut self, params: &HashMap<&str, f64>) -> Result<Self> {
        if params.contains_key(THRESHOLD_BP.name) {
            self.config
                .thresholds
                .push(get_threshold(params, THRESHOLD_BP.name, 2000)?);
        }
        if params.contains_key(EXPIRATION_DAYS.name) {
            self.config.expiration = ExpirationPolicy::with_params(params)?;
        }
        Ok(self)
    }

    pub fn build(self) -> Result<PatternScanner> {
        PatternScanner::new(self.config)
    }
}

// ============================================================
// PARALLEL SCANNING
// ============================================================

/// Parallel scanning of multiple series.
///
/// Each series is scanned by its own rayon task against its own registry slot.
/// Completed patterns are archived in series order once all tasks finish.
/// A series listed twice keeps its last batch.
pub fn scan_parallel<'a, T, I>(
    scanner: &PatternScanner,
    registry: &mut ActiveRegistry,
    archive: &mut CompletedArchive,
    instruments: I,
) -> (Vec<SeriesScan>, Vec<ScanError>)
where
    T: PriceBar + Sync + 'a,
    I: IntoIterator<Item = (SeriesId, &'a [T])>,
{
    let mut batches: BTreeMap<SeriesId, &'a [T]> = BTreeMap::new();
    for (series_id, bars) in instruments {
        if batches.insert(series_id, bars).is_some() {
            tracing::warn!(series = %series_id, "series listed twice, keeping last batch");
        }
    }
    for series_id in batches.keys() {
        registry.slot_mut(*series_id);
    }

    let results: Vec<_> = registry
        .series
        .par_iter_mut()
        .filter_map(|(series_id, slot)| batches.get(series_id).map(|bars| (*series_id, slot, *bars)))
        .map(|(series_id, slot, bars)| {
            scanner
                .scan_series(slot, bars)
                .map_err(|error| ScanError { series_id, key: None, error })
        })
        .collect();

    let mut successes = Vec::new();
    let mut errors = Vec::new();

    for result in results {
        match result {
            Ok(scan) => {
                archive.extend(scan.completed.iter().cloned());
                errors.extend(scan.failures.iter().cloned());
                successes.push(scan);
            }
            Err(e) => errors.push(e),
        }
    }

    tracing::info!(
        series = successes.len(),
        completed = successes.iter().map(|s| s.completed.len()).sum::<usize>(),
        errors = errors.len(),
        "parallel scan finished"
    );
    (successes, errors)
}
