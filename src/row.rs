//! Flat persistence rows
//!
//! [`ActiveRow`] and [`CompletedRow`] mirror the storage columns one to one: raw
//! scaled prices, nullable stage columns, plain integers. Converting a row back
//! into a record checks what a schema cannot: paired price/date columns, stage
//! order, counter consistency.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::pattern::{ActivePattern, CompletedPattern, Mark, Progress, Recovery};
use crate::{Direction, PatternError, Price, Result, SeriesId, Threshold};

/// Index hints for the active table: (index name, columns)
pub const ACTIVE_INDEXES: &[(&str, &[&str])] = &[
    ("active_pattern_key", &["series_id", "threshold_bp", "direction", "anchor_date"]),
    ("active_threshold_bp", &["threshold_bp"]),
    ("active_expired", &["expired"]),
    ("active_last_observed_date", &["last_observed_date"]),
];

/// Index hints for the completed table: (index name, columns)
pub const COMPLETED_INDEXES: &[(&str, &[&str])] = &[
    ("completed_pattern_key", &["series_id", "threshold_bp", "direction", "anchor_date"]),
    ("completed_threshold_bp", &["threshold_bp"]),
    ("completed_closing_date", &["closing_date"]),
];

// ============================================================
// ACTIVE
// ============================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveRow {
    pub series_id: u64,
    pub threshold_bp: u32,
    pub direction: Direction,
    pub anchor_price: i64,
    pub anchor_date: NaiveDate,
    pub threshold_price: Option<i64>,
    pub threshold_date: Option<NaiveDate>,
    pub extreme_price: Option<i64>,
    pub extreme_date: Option<NaiveDate>,
    pub recovery_threshold_price: Option<i64>,
    pub recovery_threshold_date: Option<NaiveDate>,
    pub threshold_crossing_count: u32,
    pub recovered: bool,
    pub last_observed_date: NaiveDate,
    pub spawned: bool,
    pub expired: bool,
}

impl From<&ActivePattern> for ActiveRow {
    fn from(p: &ActivePattern) -> Self {
        let threshold = p.progress.threshold();
        let extreme = p.progress.extreme();
        let recovery = p.progress.recovery();
        Self {
            series_id: p.series_id.0,
            threshold_bp: p.threshold_bp.bp(),
            direction: p.direction,
            anchor_price: p.anchor.price.raw(),
            anchor_date: p.anchor.date,
            threshold_price: threshold.map(|m| m.price.raw()),
            threshold_date: threshold.map(|m| m.date),
            extreme_price: extreme.map(|m| m.price.raw()),
            extreme_date: extreme.map(|m| m.date),
            recovery_threshold_price: recovery.map(|r| r.mark.price.raw()),
            recovery_threshold_date: recovery.map(|r| r.mark.date),
            threshold_crossing_count: recovery.map_or(0, |r| r.crossings),
            recovered: recovery.is_some_and(|r| r.recovered),
            last_observed_date: p.last_observed_date,
            spawned: p.spawned,
            expired: p.expired,
        }
    }
}

impl TryFrom<ActiveRow> for ActivePattern {
    type Error = PatternError;

    fn try_from(row: ActiveRow) -> Result<Self> {
        let anchor = Mark::new(Price::new(row.anchor_price)?, row.anchor_date);
        let threshold = column_pair(row.threshold_price, row.threshold_date)?;
        let extreme = column_pair(row.extreme_price, row.extreme_date)?;
        let recovery = column_pair(row.recovery_threshold_price, row.recovery_threshold_date)?;

        let progress = match (threshold, extreme, recovery) {
            (None, None, None) => {
                if row.threshold_crossing_count != 0 || row.recovered {
                    return Err(PatternError::InvalidRecord("crossing state without a recovery mark"));
                }
                Progress::Seeking
            }
            (Some(threshold), Some(extreme), None) => {
                if row.threshold_crossing_count != 0 || row.recovered {
                    return Err(PatternError::InvalidRecord("crossing state without a recovery mark"));
                }
                ordered(&[anchor, threshold, extreme])?;
                Progress::Tracking { threshold, extreme }
            }
            (Some(threshold), Some(extreme), Some(mark)) => {
                if row.threshold_crossing_count == 0 {
                    return Err(PatternError::InvalidRecord("recovery mark with zero crossings"));
                }
                ordered(&[anchor, threshold, extreme])?;
                ordered(&[threshold, mark])?;
                Progress::Recovering {
                    threshold,
                    extreme,
                    recovery: Recovery {
                        mark,
                        crossings: row.threshold_crossing_count,
                        recovered: row.recovered,
                    },
                }
            }
            _ => return Err(PatternError::InvalidRecord("stage columns set out of order")),
        };

        let latest = [progress.threshold(), progress.extreme(), progress.recovery().map(|r| r.mark)]
            .into_iter()
            .flatten()
            .fold(anchor.date, |acc, m| acc.max(m.date));
        if row.last_observed_date < latest {
            return Err(PatternError::InvalidRecord("last_observed_date precedes a stage date"));
        }

        Ok(ActivePattern {
            series_id: SeriesId(row.series_id),
            direction: row.direction,
            threshold_bp: Threshold::new(row.threshold_bp)?,
            anchor,
            progress,
            last_observed_date: row.last_observed_date,
            spawned: row.spawned,
            expired: row.expired,
        })
    }
}

// ============================================================
// COMPLETED
// ============================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedRow {
    pub series_id: u64,
    pub threshold_bp: u32,
    pub direction: Direction,
    pub anchor_price: i64,
    pub anchor_date: NaiveDate,
    pub threshold_price: i64,
    pub threshold_date: NaiveDate,
    pub extreme_price: i64,
    pub extreme_date: NaiveDate,
    pub recovery_threshold_price: i64,
    pub recovery_threshold_date: NaiveDate,
    pub closing_price: i64,
    pub closing_date: NaiveDate,
    pub threshold_crossing_count: u32,
    pub spawned: bool,
}

impl From<&CompletedPattern> for CompletedRow {
    fn from(p: &CompletedPattern) -> Self {
        Self {
            series_id: p.series_id.0,
            threshold_bp: p.threshold_bp.bp(),
            direction: p.direction,
            anchor_price: p.anchor.price.raw(),
            anchor_date: p.anchor.date,
            threshold_price: p.threshold.price.raw(),
            threshold_date: p.threshold.date,
            extreme_price: p.extreme.price.raw(),
            extreme_date: p.extreme.date,
            recovery_threshold_price: p.recovery.price.raw(),
            recovery_threshold_date: p.recovery.date,
            closing_price: p.closing.price.raw(),
            closing_date: p.closing.date,
            threshold_crossing_count: p.crossing_count,
            spawned: p.spawned,
        }
    }
}

impl TryFrom<CompletedRow> for CompletedPattern {
    type Error = PatternError;

    fn try_from(row: CompletedRow) -> Result<Self> {
        let anchor = Mark::new(Price::new(row.anchor_price)?, row.anchor_date);
        let threshold = Mark::new(Price::new(row.threshold_price)?, row.threshold_date);
        let extreme = Mark::new(Price::new(row.extreme_price)?, row.extreme_date);
        let recovery = Mark::new(Price::new(row.recovery_threshold_price)?, row.recovery_threshold_date);
        let closing = Mark::new(Price::new(row.closing_price)?, row.closing_date);

        ordered(&[anchor, threshold, extreme, recovery, closing])?;
        if row.threshold_crossing_count == 0 {
            return Err(PatternError::InvalidRecord("completed pattern with zero crossings"));
        }

        Ok(CompletedPattern {
            series_id: SeriesId(row.series_id),
            direction: row.direction,
            threshold_bp: Threshold::new(row.threshold_bp)?,
            anchor,
            threshold,
            extreme,
            recovery,
            closing,
            crossing_count: row.threshold_crossing_count,
            spawned: row.spawned,
        })
    }
}

// ============================================================
// HELPERS
// ============================================================

fn column_pair(price: Option<i64>, date: Option<NaiveDate>) -> Result<Option<Mark>> {
    match (price, date) {
        (Some(price), Some(date)) => Ok(Some(Mark::new(Price::new(price)?, date))),
        (None, None) => Ok(None),
        _ => Err(PatternError::InvalidRecord("price and date columns must be set together")),
    }
}

fn ordered(marks: &[Mark]) -> Result<()> {
    if marks.windows(2).all(|w| w[0].date <= w[1].date) {
        Ok(())
    } else {
        Err(PatternError::InvalidRecord("stage dates out of order"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::PatternKey;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 5, d).unwrap()
    }

    fn mark(units: i64, d: u32) -> Mark {
        Mark::new(Price::from_units(units).unwrap(), day(d))
    }

    fn recovering() -> ActivePattern {
        let key = PatternKey::new(SeriesId(9), Threshold::new(1500).unwrap(), Direction::Down);
        let mut p = ActivePattern::spawn(key, mark(200, 1));
        p.progress = Progress::Recovering {
            threshold: mark(170, 3),
            extreme: mark(150, 6),
            recovery: Recovery { mark: mark(173, 8), crossings: 3, recovered: false },
        };
        p.last_observed_date = day(12);
        p
    }

    #[test]
    fn test_active_row_roundtrip() {
        let pattern = recovering();
        let row = ActiveRow::from(&pattern);
        assert_eq!(row.threshold_price, Some(170_000_000));
        assert_eq!(row.threshold_crossing_count, 3);
        assert!(!row.recovered);

        let json = serde_json::to_string(&row).unwrap();
        let back: ActiveRow = serde_json::from_str(&json).unwrap();
        assert_eq!(ActivePattern::try_from(back).unwrap(), pattern);
    }

    #[test]
    fn test_seeking_row_has_null_stages() {
        let key = PatternKey::new(SeriesId(1), Threshold::new(1000).unwrap(), Direction::Up);
        let row = ActiveRow::from(&ActivePattern::spawn(key, mark(10, 2)));
        assert_eq!(row.threshold_date, None);
        assert_eq!(row.recovery_threshold_price, None);
        assert_eq!(row.threshold_crossing_count, 0);
    }

    #[test]
    fn test_active_row_rejects_half_set_pair() {
        let mut row = ActiveRow::from(&recovering());
        row.extreme_date = None;
        assert_eq!(
            ActivePattern::try_from(row),
            Err(PatternError::InvalidRecord("price and date columns must be set together"))
        );
    }

    #[test]
    fn test_active_row_rejects_recovery_without_extreme() {
        let mut row = ActiveRow::from(&recovering());
        row.extreme_price = None;
        row.extreme_date = None;
        assert!(matches!(ActivePattern::try_from(row), Err(PatternError::InvalidRecord(_))));
    }

    #[test]
    fn test_active_row_rejects_bad_values() {
        let mut row = ActiveRow::from(&recovering());
        row.threshold_date = Some(day(7));
        assert!(ActivePattern::try_from(row).is_err());

        let mut row = ActiveRow::from(&recovering());
        row.threshold_crossing_count = 0;
        assert!(ActivePattern::try_from(row).is_err());

        let mut row = ActiveRow::from(&recovering());
        row.threshold_bp = 0;
        assert!(ActivePattern::try_from(row).is_err());

        let mut row = ActiveRow::from(&recovering());
        row.anchor_price = -1;
        assert!(ActivePattern::try_from(row).is_err());

        let mut row = ActiveRow::from(&recovering());
        row.last_observed_date = day(5);
        assert!(ActivePattern::try_from(row).is_err());
    }

    #[test]
    fn test_completed_row_roundtrip_and_order() {
        let record = CompletedPattern {
            series_id: SeriesId(2),
            direction: Direction::Up,
            threshold_bp: Threshold::new(2000).unwrap(),
            anchor: mark(50, 1),
            threshold: mark(60, 2),
            extreme: mark(70, 4),
            recovery: mark(56, 6),
            closing: mark(49, 9),
            crossing_count: 1,
            spawned: true,
        };
        let row = CompletedRow::from(&record);
        assert_eq!(CompletedPattern::try_from(row.clone()).unwrap(), record);

        let mut bad = row;
        bad.closing_date = day(5);
        assert!(CompletedPattern::try_from(bad).is_err());
    }

    #[test]
    fn test_index_hints_name_existing_columns() {
        let active = serde_json::to_value(ActiveRow::from(&recovering())).unwrap();
        for (_, columns) in ACTIVE_INDEXES {
            for column in *columns {
                assert!(active.get(column).is_some(), "{column}");
            }
        }
    }
}
