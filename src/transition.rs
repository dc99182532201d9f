//! Bar-by-bar state machine
//!
//! [`apply_bar`] takes an [`ActivePattern`] by value and returns its next state,
//! plus the completed record when the bar closes it. Both directions share this
//! code and differ only through the [`Direction`] comparators.
//!
//! Within one bar the stages run in a fixed order:
//!
//! 1. seeking: re-anchor on a new away extreme, else test the threshold
//! 2. extreme update (toward side)
//! 3. fall back through the recovery level (toward side)
//! 4. cross the recovery level (away side)
//! 5. close on a return to the anchor (away side)
//!
//! A bar that re-anchors is not evaluated further, so no bar can both open and
//! close a pattern. For `Up` the recovery level can sit below the anchor; a bar
//! that reaches the anchor without crossing it records the crossing itself
//! before closing.
//!
//! Every bar fed to a live pattern moves its `last_observed_date`.

use crate::pattern::{ActivePattern, CompletedPattern, Mark, PatternId, PatternStages, Progress, Recovery};
use crate::{PatternError, PriceBar, Result};

/// Outcome of applying one bar
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// The pattern that stays live after this bar: the updated input, or its successor
    pub active: ActivePattern,
    /// Set when the bar closed the input pattern
    pub completed: Option<CompletedPattern>,
    /// The bar changed a stage of the input record
    pub changed: bool,
    /// Set when the bar re-anchored a seeking pattern, retiring this id
    pub superseded: Option<PatternId>,
}

impl Transition {
    fn idle(active: ActivePattern) -> Self {
        Self { active, completed: None, changed: false, superseded: None }
    }
}

/// Advance `pattern` by one bar. Expired patterns are returned unchanged.
pub fn apply_bar<B: PriceBar + ?Sized>(pattern: ActivePattern, bar: &B) -> Result<Transition> {
    if pattern.expired {
        return Ok(Transition::idle(pattern));
    }

    let direction = pattern.direction;
    let threshold_bp = pattern.threshold_bp;
    let date = bar.date();
    let toward = Mark::new(direction.toward(bar), date);
    let away = Mark::new(direction.away(bar), date);

    let mut next = pattern;
    next.last_observed_date = date;
    let mut changed = false;

    let (threshold, mut extreme, mut recovery) = match next.progress {
        Progress::Seeking => {
            if !direction.beyond(away.price, next.anchor.price) {
                let superseded = next.id();
                tracing::trace!(key = %next.key(), anchor = %away.price, %date, "re-anchored");
                next.anchor = away;
                return Ok(Transition {
                    active: next,
                    completed: None,
                    changed: true,
                    superseded: Some(superseded),
                });
            }
            if !direction.crossed(toward.price, next.anchor.price, threshold_bp) {
                return Ok(Transition::idle(next));
            }
            tracing::debug!(pattern = %next.id(), price = %toward.price, %date, "threshold crossed");
            changed = true;
            (toward, toward, None)
        }
        Progress::Tracking { threshold, extreme } => (threshold, extreme, None),
        Progress::Recovering { threshold, extreme, recovery } => (threshold, extreme, Some(recovery)),
    };

    if direction.beyond(toward.price, extreme.price) {
        extreme = toward;
        changed = true;
    }

    let back = direction.opposite();

    if let Some(rec) = recovery.as_mut() {
        if rec.recovered && !back.crossed(toward.price, extreme.price, threshold_bp) {
            rec.recovered = false;
            rec.crossings = bump(rec.crossings)?;
            changed = true;
        }
    }

    if back.crossed(away.price, extreme.price, threshold_bp) {
        changed |= recover(&mut recovery, away, extreme)?;
    }

    if !direction.beyond(away.price, next.anchor.price) {
        // back at the anchor counts as recovered even short of the recovery level
        recover(&mut recovery, away, extreme)?;
        if let Some(rec) = recovery {
            let completed = CompletedPattern {
                series_id: next.series_id,
                direction,
                threshold_bp,
                anchor: next.anchor,
                threshold,
                extreme,
                recovery: rec.mark,
                closing: away,
                crossing_count: rec.crossings,
                spawned: next.spawned,
            };
            let successor = ActivePattern::spawn(next.key(), away);
            tracing::debug!(
                pattern = %completed.id(),
                closing = %away.price,
                crossings = rec.crossings,
                "pattern closed"
            );
            return Ok(Transition {
                active: successor,
                completed: Some(completed),
                changed: true,
                superseded: None,
            });
        }
    }

    next.progress = match recovery {
        None => Progress::Tracking { threshold, extreme },
        Some(recovery) => Progress::Recovering { threshold, extreme, recovery },
    };
    Ok(Transition { active: next, completed: None, changed, superseded: None })
}

/// Record an away-side crossing of the recovery level. Returns false when the
/// pattern was already on the recovered side.
fn recover(recovery: &mut Option<Recovery>, away: Mark, extreme: Mark) -> Result<bool> {
    match recovery.as_mut() {
        None => {
            *recovery = Some(Recovery::first(away));
            Ok(true)
        }
        Some(rec) if !rec.recovered => {
            rec.recovered = true;
            rec.crossings = bump(rec.crossings)?;
            // the extreme moved on since the mark was taken
            if rec.mark.date < extreme.date {
                rec.mark = away;
            }
            Ok(true)
        }
        Some(_) => Ok(false),
    }
}

#[inline]
fn bump(crossings: u32) -> Result<u32> {
    crossings
        .checked_add(1)
        .ok_or(PatternError::Overflow { context: "threshold crossing count" })
}

#[cfg(test)]
mod tests {
    use chrono::{Days, NaiveDate};

    use super::*;
    use crate::pattern::PatternKey;
    use crate::{DailyBar, Direction, Price, SeriesId, Threshold};

    fn day(n: u64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, 1, 1).unwrap() + Days::new(n)
    }

    fn p(v: f64) -> Price {
        Price::from_f64(v).unwrap()
    }

    /// Bar with the given range; open at high, close at low
    fn bar(n: u64, low: f64, high: f64) -> DailyBar {
        DailyBar::new(day(n), p(high), p(high), p(low), p(low))
    }

    fn key(direction: Direction) -> PatternKey {
        PatternKey::new(SeriesId(1), Threshold::new(2000).unwrap(), direction)
    }

    fn run(mut pattern: ActivePattern, bars: &[DailyBar]) -> (ActivePattern, Vec<CompletedPattern>) {
        let mut done = Vec::new();
        for b in bars {
            let t = apply_bar(pattern, b).unwrap();
            done.extend(t.completed);
            pattern = t.active;
        }
        (pattern, done)
    }

    #[test]
    fn test_rebound_example() {
        let seed = ActivePattern::seed(key(Direction::Down), &bar(0, 99.0, 100.0));
        let bars = [
            bar(10, 79.99, 95.0),
            bar(20, 70.0, 75.0),
            bar(25, 80.0, 84.0),
            bar(40, 90.0, 100.5),
        ];
        let (active, done) = run(seed, &bars);

        assert_eq!(done.len(), 1);
        let c = &done[0];
        assert_eq!(c.anchor, Mark::new(p(100.0), day(0)));
        assert_eq!(c.threshold, Mark::new(p(79.99), day(10)));
        assert_eq!(c.extreme, Mark::new(p(70.0), day(20)));
        assert_eq!(c.recovery, Mark::new(p(84.0), day(25)));
        assert_eq!(c.closing, Mark::new(p(100.5), day(40)));
        assert_eq!(c.crossing_count, 1);
        assert!(c.is_rebound());

        assert!(active.spawned);
        assert_eq!(active.anchor, Mark::new(p(100.5), day(40)));
        assert_eq!(active.progress, Progress::Seeking);
    }

    #[test]
    fn test_reversal_mirror() {
        let seed = ActivePattern::seed(key(Direction::Up), &bar(0, 100.0, 101.0));
        let bars = [
            bar(5, 105.0, 120.0),
            bar(6, 125.0, 130.0),
            bar(7, 104.0, 110.0),
            bar(9, 99.0, 103.0),
        ];
        let (active, done) = run(seed, &bars);

        assert_eq!(done.len(), 1);
        let c = &done[0];
        assert!(c.is_reversal());
        assert_eq!(c.threshold.price, p(120.0));
        assert_eq!(c.extreme, Mark::new(p(130.0), day(6)));
        assert_eq!(c.recovery, Mark::new(p(104.0), day(7)));
        assert_eq!(c.closing, Mark::new(p(99.0), day(9)));
        assert_eq!(active.anchor.price, p(99.0));
    }

    #[test]
    fn test_seeking_reanchors_on_new_high() {
        let seed = ActivePattern::seed(key(Direction::Down), &bar(0, 99.0, 100.0));
        let t = apply_bar(seed, &bar(1, 100.0, 110.0)).unwrap();
        assert!(t.changed);
        assert_eq!(t.active.anchor, Mark::new(p(110.0), day(1)));
        assert_eq!(t.active.last_observed_date, day(1));
        let retired = t.superseded.unwrap();
        assert_eq!(retired.anchor_date, day(0));
        assert_ne!(retired, t.active.id());

        // 90 is not 20% below 110
        let t = apply_bar(t.active, &bar(2, 90.0, 95.0)).unwrap();
        assert!(!t.changed);
        assert!(t.superseded.is_none());
        assert_eq!(t.active.progress, Progress::Seeking);
        assert_eq!(t.active.last_observed_date, day(2));
    }

    #[test]
    fn test_reanchor_bar_is_not_evaluated_further() {
        let seed = ActivePattern::seed(key(Direction::Down), &bar(0, 99.0, 100.0));
        // new high and a low far below the old threshold level in one bar
        let t = apply_bar(seed, &bar(1, 50.0, 100.0)).unwrap();
        assert_eq!(t.active.anchor.date, day(1));
        assert_eq!(t.active.progress, Progress::Seeking);
        assert!(t.completed.is_none());
    }

    #[test]
    fn test_threshold_bar_sets_extreme_and_may_recover() {
        let seed = ActivePattern::seed(key(Direction::Down), &bar(0, 99.0, 100.0));
        // 79 crosses 80; 95 >= 79 * 1.2 = 94.8
        let t = apply_bar(seed, &bar(1, 79.0, 95.0)).unwrap();
        let a = &t.active;
        assert_eq!(a.threshold_mark(), Some(Mark::new(p(79.0), day(1))));
        assert_eq!(a.extreme(), Some(Mark::new(p(79.0), day(1))));
        assert_eq!(PatternStages::recovery(a), Some(Mark::new(p(95.0), day(1))));
        assert_eq!(a.crossing_count(), 1);
        assert!(t.completed.is_none());
    }

    #[test]
    fn test_extreme_is_strict() {
        let seed = ActivePattern::seed(key(Direction::Down), &bar(0, 99.0, 100.0));
        let (a, _) = run(seed, &[bar(1, 70.0, 75.0), bar(2, 70.0, 74.0)]);
        assert_eq!(a.extreme(), Some(Mark::new(p(70.0), day(1))));
        assert_eq!(a.last_observed_date, day(2));
    }

    #[test]
    fn test_up_closes_at_anchor_below_recovery_level() {
        // anchor 100, extreme 120; recovery level 96 sits below the anchor
        let seed = ActivePattern::seed(key(Direction::Up), &bar(0, 100.0, 101.0));
        let t = apply_bar(seed, &bar(1, 110.0, 120.0)).unwrap();
        assert_eq!(t.active.recovery_level().unwrap(), Some(p(96.0)));

        let t = apply_bar(t.active, &bar(2, 99.0, 110.0)).unwrap();
        let c = t.completed.unwrap();
        assert!(c.is_reversal());
        assert_eq!(c.extreme, Mark::new(p(120.0), day(1)));
        assert_eq!(c.recovery, Mark::new(p(99.0), day(2)));
        assert_eq!(c.closing, Mark::new(p(99.0), day(2)));
        assert_eq!(c.crossing_count, 1);
        assert!(t.active.spawned);
        assert_eq!(t.active.anchor, Mark::new(p(99.0), day(2)));

        // the successor re-anchors on the next lower low
        let t = apply_bar(t.active, &bar(3, 97.0, 105.0)).unwrap();
        assert!(t.completed.is_none());
        assert_eq!(t.active.anchor, Mark::new(p(97.0), day(3)));
    }

    #[test]
    fn test_up_recross_then_close_keeps_first_mark() {
        let seed = ActivePattern::seed(key(Direction::Up), &bar(0, 100.0, 101.0));
        let bars = [
            bar(1, 110.0, 130.0), // extreme 130, level 104
            bar(2, 103.0, 110.0), // recovered, count 1
            bar(3, 106.0, 112.0), // back above 104, count 2
        ];
        let (a, done) = run(seed, &bars);
        assert!(done.is_empty());
        assert_eq!(a.crossing_count(), 2);

        let t = apply_bar(a, &bar(4, 100.0, 107.0)).unwrap();
        let c = t.completed.unwrap();
        assert_eq!(c.crossing_count, 3);
        assert_eq!(c.recovery, Mark::new(p(103.0), day(2)));
        assert_eq!(c.closing, Mark::new(p(100.0), day(4)));
    }

    #[test]
    fn test_recrossing_counts_without_reset() {
        let seed = ActivePattern::seed(key(Direction::Down), &bar(0, 99.0, 100.0));
        let bars = [
            bar(1, 70.0, 75.0), // threshold + extreme 70, level 84
            bar(2, 80.0, 85.0), // recovery, count 1
            bar(3, 82.0, 83.0), // back below 84, count 2
            bar(4, 83.0, 86.0), // above again, count 3
        ];
        let (a, done) = run(seed, &bars);
        assert!(done.is_empty());
        let rec = a.recovery_state().unwrap();
        assert_eq!(rec.crossings, 3);
        assert!(rec.recovered);
        // first crossing mark is kept while the extreme stays put
        assert_eq!(rec.mark, Mark::new(p(85.0), day(2)));
        assert_eq!(a.extreme(), Some(Mark::new(p(70.0), day(1))));
    }

    #[test]
    fn test_new_extreme_after_recovery_rerecords_mark() {
        let seed = ActivePattern::seed(key(Direction::Down), &bar(0, 99.0, 100.0));
        let bars = [
            bar(1, 70.0, 75.0),
            bar(2, 80.0, 85.0),  // recovery at 85, count 1
            bar(3, 60.0, 65.0),  // new extreme 60, falls back, count 2
            bar(4, 70.0, 72.0),  // above 72 = 60 * 1.2, count 3, mark moves
            bar(5, 90.0, 100.0), // close
        ];
        let (_, done) = run(seed, &bars);
        assert_eq!(done.len(), 1);
        let c = &done[0];
        assert_eq!(c.extreme, Mark::new(p(60.0), day(3)));
        assert_eq!(c.recovery, Mark::new(p(72.0), day(4)));
        assert_eq!(c.crossing_count, 3);
        assert!(c.extreme.date <= c.recovery.date);
    }

    #[test]
    fn test_threshold_bar_below_anchor_does_not_close() {
        let seed = ActivePattern::seed(key(Direction::Down), &bar(0, 99.0, 100.0));
        // recovers on the threshold bar but stays below the anchor
        let (a, done) = run(seed, &[bar(1, 79.0, 99.0)]);
        assert!(done.is_empty());
        assert_eq!(a.crossing_count(), 1);
    }

    #[test]
    fn test_close_and_new_extreme_same_bar() {
        let seed = ActivePattern::seed(key(Direction::Down), &bar(0, 99.0, 100.0));
        let bars = [bar(1, 70.0, 75.0), bar(2, 80.0, 85.0), bar(3, 65.0, 101.0)];
        let (a, done) = run(seed, &bars);
        assert_eq!(done.len(), 1);
        let c = &done[0];
        assert_eq!(c.extreme, Mark::new(p(65.0), day(3)));
        assert_eq!(c.recovery.date, day(3));
        assert_eq!(c.closing, Mark::new(p(101.0), day(3)));
        assert_eq!(c.crossing_count, 3);
        assert_eq!(a.anchor, Mark::new(p(101.0), day(3)));
    }

    #[test]
    fn test_expired_pattern_is_inert() {
        let mut seed = ActivePattern::seed(key(Direction::Down), &bar(0, 99.0, 100.0));
        seed.mark_expired();
        let t = apply_bar(seed.clone(), &bar(1, 50.0, 60.0)).unwrap();
        assert!(!t.changed);
        assert_eq!(t.active, seed);
    }

    #[test]
    fn test_crossing_overflow_is_surfaced() {
        let seed = ActivePattern::seed(key(Direction::Down), &bar(0, 99.0, 100.0));
        let (mut a, _) = run(seed, &[bar(1, 70.0, 75.0), bar(2, 80.0, 85.0)]);
        if let Progress::Recovering { recovery, .. } = &mut a.progress {
            recovery.crossings = u32::MAX;
        }
        let err = apply_bar(a, &bar(3, 80.0, 83.0)).unwrap_err();
        assert!(matches!(err, PatternError::Overflow { .. }));
    }
}
