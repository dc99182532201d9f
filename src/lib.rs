//! # retrace - drawdown/rally lifecycle tracking
//!
//! Detects two mirrored price patterns over end-of-day series and tracks each one
//! from its anchor to completion:
//!
//! - **High → Low → Rebound** ([`Direction::Down`]): price falls a threshold
//!   percentage from a local high, bottoms out, retraces the same percentage off
//!   the low and finally returns to the high.
//! - **Low → High → Reversal** ([`Direction::Up`]): the mirror image.
//!
//! Prices are fixed-point integers ([`Price`], 1,000,000 units per currency unit)
//! and thresholds are basis points ([`Threshold`]), so scans are exact and
//! reproducible.
//!
//! ## Quick Start
//!
//! ```rust
//! use chrono::NaiveDate;
//! use retrace::prelude::*;
//!
//! let day = |d: u32| NaiveDate::from_ymd_opt(2024, 1, d).unwrap();
//! let bar = |d, low: f64, high: f64| DailyBar::from_f64(day(d), high, high, low, low).unwrap();
//!
//! let scanner = ScannerBuilder::new()
//!     .threshold(Threshold::new(2000).unwrap())
//!     .build()
//!     .unwrap();
//!
//! let mut registry = ActiveRegistry::new();
//! let mut archive = CompletedArchive::new();
//!
//! let bars = vec![
//!     bar(1, 99.0, 100.0),
//!     bar(2, 79.0, 85.0),
//!     bar(3, 78.0, 95.0),
//!     bar(4, 96.0, 101.0),
//! ];
//! scanner.scan(&mut registry, &mut archive, SeriesId(1), &bars).unwrap();
//!
//! // the decline from 100 closed on day 4
//! assert_eq!(archive.len(), 1);
//! ```

use chrono::NaiveDate;

pub mod archive;
pub mod expiration;
pub mod metrics;
pub mod params;
pub mod pattern;
pub mod registry;
pub mod row;
pub mod scanner;
pub mod transition;

pub mod prelude {
    pub use crate::{
        // Archive
        archive::CompletedArchive,
        // Expiration
        expiration::{sweep, sweep_series, ExpirationPolicy, SweepReport, DEFAULT_EXPIRATION_DAYS},
        // Metrics
        metrics::DerivedMetrics,
        // Parameters
        params::{get_days, get_threshold, ParamMeta, ParamType, Parameterized},
        // Records
        pattern::{ActivePattern, CompletedPattern, Mark, PatternId, PatternKey, PatternStages, Progress, Recovery},
        // Registry
        registry::{ActiveRegistry, SeriesSlot, Tracker},
        // Persistence rows
        row::{ActiveRow, CompletedRow},
        // Scanner
        scanner::{scan_parallel, PatternScanner, ScanConfig, ScanError, ScannerBuilder, SeriesScan},
        // State machine
        transition::{apply_bar, Transition},
        // Types
        DailyBar,
        Direction,
        PatternError,
        Price,
        PriceBar,
        PriceBarExt,
        Result,
        SeriesId,
        Threshold,
    };
}

// ============================================================
// ERRORS
// ============================================================

pub type Result<T> = std::result::Result<T, PatternError>;

/// Errors raised by the engine
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("Invalid value: {0}")]
    InvalidValue(&'static str),

    #[error("{field} = {value} out of range [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Invalid bar at index {index}: {reason}")]
    InvalidBar { index: usize, reason: &'static str },

    /// A bar arrived at or before the date of the previously processed bar.
    #[error("Bar dated {got} does not follow previous bar dated {previous}")]
    OutOfOrder { previous: NaiveDate, got: NaiveDate },

    #[error("Numeric overflow: {context}")]
    Overflow { context: &'static str },

    #[error("Pattern {0} not found")]
    MissingPattern(pattern::PatternId),

    #[error("A live pattern already exists for {0}")]
    Conflict(pattern::PatternId),

    #[error("Invalid record: {0}")]
    InvalidRecord(&'static str),
}

// ============================================================
// FIXED-POINT TYPES
// ============================================================

/// Basis points in one whole (100%).
pub const BASIS_POINTS: i64 = 10_000;

/// Price scaled to 1,000,000 units per currency unit. Always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Price(i64);

impl Price {
    /// Units per currency unit
    pub const SCALE: i64 = 1_000_000;

    /// Create a Price from its raw scaled representation
    pub fn new(raw: i64) -> Result<Self> {
        if raw <= 0 {
            return Err(PatternError::InvalidValue("Price must be positive"));
        }
        Ok(Self(raw))
    }

    /// Create a Price from a compile-time constant (library internal use)
    #[doc(hidden)]
    pub const fn new_const(raw: i64) -> Self {
        Self(raw)
    }

    /// Whole currency units, e.g. `from_units(100)` is 100.000000
    pub fn from_units(units: i64) -> Result<Self> {
        let raw = units
            .checked_mul(Self::SCALE)
            .ok_or(PatternError::Overflow { context: "price units exceed i64 range" })?;
        Self::new(raw)
    }

    /// Convert a floating point quote, rounding to the nearest scaled unit
    pub fn from_f64(value: f64) -> Result<Self> {
        if value.is_nan() || value.is_infinite() {
            return Err(PatternError::InvalidValue(
                "Price cannot be NaN or infinite",
            ));
        }
        let scaled = (value * Self::SCALE as f64).round();
        if scaled >= i64::MAX as f64 {
            return Err(PatternError::Overflow { context: "price exceeds i64 range" });
        }
        Self::new(scaled as i64)
    }

    #[inline]
    pub fn raw(self) -> i64 {
        self.0
    }

    #[inline]
    pub fn to_f64(self) -> f64 {
        self.0 as f64 / Self::SCALE as f64
    }

    /// `self * (10000 + delta_bp) / 10000`, truncated toward zero.
    pub fn shifted(self, delta_bp: i64) -> Result<Self> {
        let scaled = self.0 as i128 * (BASIS_POINTS as i128 + delta_bp as i128)
            / BASIS_POINTS as i128;
        let raw = i64::try_from(scaled)
            .map_err(|_| PatternError::Overflow { context: "shifted price exceeds i64 range" })?;
        Self::new(raw)
    }
}

impl std::fmt::Display for Price {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:06}", self.0 / Self::SCALE, self.0 % Self::SCALE)
    }
}

impl serde::Serialize for Price {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        self.0.serialize(s)
    }
}

impl<'de> serde::Deserialize<'de> for Price {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let raw = i64::deserialize(d)?;
        Price::new(raw).map_err(serde::de::Error::custom)
    }
}

/// Detection sensitivity in basis points (1 bp = 0.01%), in `1..=9999`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Threshold(u32);

impl Threshold {
    /// A decline of 100% or more would put the level at zero
    pub const MAX_BP: u32 = 9_999;

    pub fn new(bp: u32) -> Result<Self> {
        if bp == 0 {
            return Err(PatternError::InvalidValue("Threshold must be > 0 bp"));
        }
        if bp > Self::MAX_BP {
            return Err(PatternError::OutOfRange {
                field: "Threshold",
                value: bp as i64,
                min: 1,
                max: Self::MAX_BP as i64,
            });
        }
        Ok(Self(bp))
    }

    #[doc(hidden)]
    pub const fn new_const(bp: u32) -> Self {
        Self(bp)
    }

    /// `from_percent(20.0)` is 2000 bp
    pub fn from_percent(percent: f64) -> Result<Self> {
        if percent.is_nan() || percent.is_infinite() || percent <= 0.0 {
            return Err(PatternError::InvalidValue(
                "Threshold percent must be finite and positive",
            ));
        }
        let bp = (percent * 100.0).round();
        if bp > Self::MAX_BP as f64 {
            return Err(PatternError::OutOfRange {
                field: "Threshold",
                value: bp as i64,
                min: 1,
                max: Self::MAX_BP as i64,
            });
        }
        Self::new(bp as u32)
    }

    #[inline]
    pub fn bp(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn as_percent(self) -> f64 {
        self.0 as f64 / 100.0
    }
}

impl std::fmt::Display for Threshold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:02}%", self.0 / 100, self.0 % 100)
    }
}

impl serde::Serialize for Threshold {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        self.0.serialize(s)
    }
}

impl<'de> serde::Deserialize<'de> for Threshold {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let bp = u32::deserialize(d)?;
        Threshold::new(bp).map_err(serde::de::Error::custom)
    }
}

/// Opaque identifier of a price series (ticker-period), owned by the caller
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct SeriesId(pub u64);

impl std::fmt::Display for SeriesId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "series:{}", self.0)
    }
}

// ============================================================
// BAR TRAITS
// ============================================================

/// Core end-of-day bar trait
pub trait PriceBar {
    fn date(&self) -> NaiveDate;
    fn open(&self) -> Price;
    fn high(&self) -> Price;
    fn low(&self) -> Price;
    fn close(&self) -> Price;
}

impl<T: PriceBar + ?Sized> PriceBar for &T {
    fn date(&self) -> NaiveDate {
        (**self).date()
    }

    fn open(&self) -> Price {
        (**self).open()
    }

    fn high(&self) -> Price {
        (**self).high()
    }

    fn low(&self) -> Price {
        (**self).low()
    }

    fn close(&self) -> Price {
        (**self).close()
    }
}

/// Extension trait with computed properties for bars
pub trait PriceBarExt: PriceBar {
    /// High minus low in scaled units
    #[inline]
    fn range(&self) -> i64 {
        self.high().raw() - self.low().raw()
    }

    /// Validate bar shape consistency
    fn validate(&self) -> Result<()> {
        if self.high() < self.low() {
            return Err(PatternError::InvalidBar {
                index: 0,
                reason: "high < low",
            });
        }
        if self.open() > self.high() || self.open() < self.low() {
            return Err(PatternError::InvalidBar {
                index: 0,
                reason: "open outside [low, high]",
            });
        }
        if self.close() > self.high() || self.close() < self.low() {
            return Err(PatternError::InvalidBar {
                index: 0,
                reason: "close outside [low, high]",
            });
        }
        Ok(())
    }
}

impl<T: PriceBar + ?Sized> PriceBarExt for T {}

/// Plain daily OHLC bar
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DailyBar {
    pub date: NaiveDate,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
}

impl DailyBar {
    pub fn new(date: NaiveDate, open: Price, high: Price, low: Price, close: Price) -> Self {
        Self { date, open, high, low, close }
    }

    /// Build from floating point quotes
    pub fn from_f64(date: NaiveDate, open: f64, high: f64, low: f64, close: f64) -> Result<Self> {
        Ok(Self {
            date,
            open: Price::from_f64(open)?,
            high: Price::from_f64(high)?,
            low: Price::from_f64(low)?,
            close: Price::from_f64(close)?,
        })
    }
}

impl PriceBar for DailyBar {
    fn date(&self) -> NaiveDate {
        self.date
    }

    fn open(&self) -> Price {
        self.open
    }

    fn high(&self) -> Price {
        self.high
    }

    fn low(&self) -> Price {
        self.low
    }

    fn close(&self) -> Price {
        self.close
    }
}

// ============================================================
// DIRECTION
// ============================================================

/// Which way the pattern's initial move goes
///
/// - `Down`: anchored at a high, falls, rebounds (High → Low → Rebound)
/// - `Up`: anchored at a low, rises, reverses (Low → High → Reversal)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Down,
    Up,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Down, Direction::Up];

    #[inline]
    pub fn opposite(self) -> Self {
        match self {
            Direction::Down => Direction::Up,
            Direction::Up => Direction::Down,
        }
    }

    #[inline]
    pub fn is_down(self) -> bool {
        matches!(self, Direction::Down)
    }

    #[inline]
    pub fn is_up(self) -> bool {
        matches!(self, Direction::Up)
    }

    /// Bar extreme in the direction of the initial move (low for `Down`)
    #[inline]
    pub fn toward<B: PriceBar + ?Sized>(self, bar: &B) -> Price {
        match self {
            Direction::Down => bar.low(),
            Direction::Up => bar.high(),
        }
    }

    /// Bar extreme against the initial move (high for `Down`)
    #[inline]
    pub fn away<B: PriceBar + ?Sized>(self, bar: &B) -> Price {
        match self {
            Direction::Down => bar.high(),
            Direction::Up => bar.low(),
        }
    }

    /// `a` is strictly further along the move than `b`
    #[inline]
    pub fn beyond(self, a: Price, b: Price) -> bool {
        match self {
            Direction::Down => a < b,
            Direction::Up => a > b,
        }
    }

    /// `price` is at or through `reference` shifted by `threshold` along this direction.
    ///
    /// Exact: compares `price * 10000` against `reference * (10000 -/+ bp)` in i128.
    #[inline]
    pub fn crossed(self, price: Price, reference: Price, threshold: Threshold) -> bool {
        let lhs = price.raw() as i128 * BASIS_POINTS as i128;
        let bp = threshold.bp() as i128;
        match self {
            Direction::Down => lhs <= reference.raw() as i128 * (BASIS_POINTS as i128 - bp),
            Direction::Up => lhs >= reference.raw() as i128 * (BASIS_POINTS as i128 + bp),
        }
    }

    /// Level `reference` must reach along this direction, for reporting
    pub fn level(self, reference: Price, threshold: Threshold) -> Result<Price> {
        let bp = threshold.bp() as i64;
        match self {
            Direction::Down => reference.shifted(-bp),
            Direction::Up => reference.shifted(bp),
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Direction::Down => "down",
            Direction::Up => "up",
        })
    }
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn p(v: f64) -> Price {
        Price::from_f64(v).unwrap()
    }

    #[test]
    fn test_price_validation() {
        assert!(Price::new(1).is_ok());
        assert!(Price::new(0).is_err());
        assert!(Price::new(-5).is_err());
        assert!(Price::from_f64(f64::NAN).is_err());
        assert!(Price::from_f64(f64::INFINITY).is_err());
        assert!(Price::from_f64(-1.0).is_err());
        assert_eq!(
            Price::from_f64(1e300),
            Err(PatternError::Overflow { context: "price exceeds i64 range" })
        );
        assert!(matches!(
            Price::from_units(i64::MAX / 10),
            Err(PatternError::Overflow { .. })
        ));
    }

    #[test]
    fn test_price_scaling() {
        assert_eq!(p(100.0).raw(), 100_000_000);
        assert_eq!(p(79.99).raw(), 79_990_000);
        assert_eq!(Price::from_units(84).unwrap(), p(84.0));
        assert_eq!(p(100.5).to_string(), "100.500000");
        assert!((p(12.345678).to_f64() - 12.345678).abs() < 1e-9);
    }

    #[test]
    fn test_price_shifted() {
        assert_eq!(p(100.0).shifted(-2000).unwrap(), p(80.0));
        assert_eq!(p(70.0).shifted(2000).unwrap(), p(84.0));
        assert!(p(100.0).shifted(-10_000).is_err());
        assert!(matches!(
            Price::new(i64::MAX).unwrap().shifted(5000),
            Err(PatternError::Overflow { .. })
        ));
    }

    #[test]
    fn test_threshold_validation() {
        assert!(Threshold::new(1).is_ok());
        assert!(Threshold::new(9_999).is_ok());
        assert!(Threshold::new(0).is_err());
        assert!(Threshold::new(10_000).is_err());
        assert_eq!(Threshold::from_percent(20.0).unwrap().bp(), 2000);
        assert!(Threshold::from_percent(-1.0).is_err());
        assert!(Threshold::from_percent(100.0).is_err());
        assert_eq!(Threshold::new(2050).unwrap().to_string(), "20.50%");
    }

    #[test]
    fn test_threshold_deserialize_rejects_zero() {
        let parsed: std::result::Result<Threshold, _> = serde_json::from_str("0");
        assert!(parsed.is_err());
        let parsed: Threshold = serde_json::from_str("1500").unwrap();
        assert_eq!(parsed.bp(), 1500);
    }

    #[test]
    fn test_direction_sides() {
        let bar = DailyBar::new(day(1), p(10.0), p(12.0), p(9.0), p(11.0));
        assert_eq!(Direction::Down.toward(&bar), p(9.0));
        assert_eq!(Direction::Down.away(&bar), p(12.0));
        assert_eq!(Direction::Up.toward(&bar), p(12.0));
        assert_eq!(Direction::Up.away(&bar), p(9.0));
        assert_eq!(Direction::Down.opposite(), Direction::Up);
    }

    #[test]
    fn test_direction_crossed_is_inclusive() {
        let t = Threshold::new(2000).unwrap();
        assert!(Direction::Down.crossed(p(80.0), p(100.0), t));
        assert!(Direction::Down.crossed(p(79.99), p(100.0), t));
        assert!(!Direction::Down.crossed(p(80.000001), p(100.0), t));
        assert!(Direction::Up.crossed(p(84.0), p(70.0), t));
        assert!(!Direction::Up.crossed(p(83.999999), p(70.0), t));
    }

    #[test]
    fn test_direction_level() {
        let t = Threshold::new(2000).unwrap();
        assert_eq!(Direction::Down.level(p(100.0), t).unwrap(), p(80.0));
        assert_eq!(Direction::Up.level(p(70.0), t).unwrap(), p(84.0));
    }

    #[test]
    fn test_bar_validation() {
        let ok = DailyBar::new(day(1), p(10.0), p(12.0), p(9.0), p(11.0));
        assert!(ok.validate().is_ok());
        assert_eq!(ok.range(), 3_000_000);

        let inverted = DailyBar::new(day(1), p(10.0), p(9.0), p(12.0), p(11.0));
        assert!(matches!(
            inverted.validate(),
            Err(PatternError::InvalidBar { reason: "high < low", .. })
        ));

        let bad_close = DailyBar::new(day(1), p(10.0), p(12.0), p(9.0), p(13.0));
        assert!(bad_close.validate().is_err());
    }

    #[test]
    fn test_daily_bar_serde() {
        let bar = DailyBar::new(day(2), p(10.0), p(12.0), p(9.0), p(11.0));
        let json = serde_json::to_string(&bar).unwrap();
        let back: DailyBar = serde_json::from_str(&json).unwrap();
        assert_eq!(bar, back);
    }
}
