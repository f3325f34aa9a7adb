//! Deterministic post-filter over normalized places.
//!
//! Each axis evaluates to pass/fail/unknown. A failing axis removes the
//! item; unknowns are kept by default (tunable) and counted either way.
//! Dietary hints only annotate. Hard constraints (kosher, meat/dairy) are
//! not filter axes at all; they cap the cuisine enforcer's policy instead.

use serde::{Deserialize, Serialize};

use crate::search::{OpenNow, OpenStateFilter, OpeningPeriod, Place, SharedFilters};

const MINUTES_PER_DAY: u32 = 24 * 60;
const MINUTES_PER_WEEK: u32 = 7 * MINUTES_PER_DAY;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterCounters {
    pub before: usize,
    pub after: usize,
    pub removed: usize,
    pub unknown_kept: usize,
    pub unknown_removed: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct FilterOptions {
    /// Keep items whose open state cannot be determined.
    pub keep_unknown: bool,
}

impl Default for FilterOptions {
    fn default() -> Self {
        Self { keep_unknown: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Pass,
    Fail,
    Unknown,
}

/// Apply all filter axes. Returns survivors and the counter set; the
/// invariant `before == after + removed` always holds.
pub fn post_filter(
    items: Vec<Place>,
    filters: &SharedFilters,
    opts: &FilterOptions,
) -> (Vec<Place>, FilterCounters) {
    let mut counters = FilterCounters {
        before: items.len(),
        ..Default::default()
    };
    let mut kept = Vec::with_capacity(items.len());

    for mut item in items {
        annotate_dietary(&mut item, filters);

        let verdicts = [
            eval_open_state(&item, filters.open_state),
            eval_rating(&item, filters),
            eval_price(&item, filters),
        ];

        if verdicts.contains(&Verdict::Fail) {
            counters.removed += 1;
            continue;
        }
        if verdicts.contains(&Verdict::Unknown) {
            if opts.keep_unknown {
                counters.unknown_kept += 1;
            } else {
                counters.unknown_removed += 1;
                counters.removed += 1;
                continue;
            }
        }
        kept.push(item);
    }

    counters.after = kept.len();
    (kept, counters)
}

fn eval_open_state(item: &Place, filter: Option<OpenStateFilter>) -> Verdict {
    let Some(filter) = filter else {
        return Verdict::Pass;
    };
    match filter {
        OpenStateFilter::OpenNow => match item.open_now {
            OpenNow::Open => Verdict::Pass,
            OpenNow::Closed => Verdict::Fail,
            OpenNow::Unknown => Verdict::Unknown,
        },
        OpenStateFilter::ClosedNow => match item.open_now {
            OpenNow::Closed => Verdict::Pass,
            OpenNow::Open => Verdict::Fail,
            OpenNow::Unknown => Verdict::Unknown,
        },
        OpenStateFilter::OpenAt { day, minute } => {
            if item.opening_periods.is_empty() {
                return Verdict::Unknown;
            }
            if is_open_at(&item.opening_periods, day, minute) {
                Verdict::Pass
            } else {
                Verdict::Fail
            }
        }
        OpenStateFilter::OpenBetween { day, start, end } => {
            if item.opening_periods.is_empty() || start > end {
                return Verdict::Unknown;
            }
            // Two-endpoint check: open at both ends of the range.
            let open_at_start = is_open_at(&item.opening_periods, day, start);
            let open_at_end = is_open_at(&item.opening_periods, day, end);
            if open_at_start && open_at_end {
                Verdict::Pass
            } else {
                Verdict::Fail
            }
        }
    }
}

fn eval_rating(item: &Place, filters: &SharedFilters) -> Verdict {
    let Some(bucket) = filters.min_rating_bucket else {
        return Verdict::Pass;
    };
    match item.rating {
        // Unrated places are unknowns, kept by default.
        None => Verdict::Unknown,
        Some(r) if r >= bucket.threshold() => Verdict::Pass,
        Some(_) => Verdict::Fail,
    }
}

fn eval_price(item: &Place, filters: &SharedFilters) -> Verdict {
    let Some(intent) = filters.price_intent else {
        return Verdict::Pass;
    };
    match item.price_level {
        None => Verdict::Unknown,
        Some(level) if intent.admits(level) => Verdict::Pass,
        Some(_) => Verdict::Fail,
    }
}

/// Dietary hints annotate matching places; they never remove anything.
fn annotate_dietary(item: &mut Place, filters: &SharedFilters) {
    if filters.is_gluten_free && !item.dietary_hints.iter().any(|h| h == "gluten_free") {
        let matches = item.name.to_lowercase().contains("gluten")
            || item.types.iter().any(|t| t.contains("gluten"));
        if matches {
            item.dietary_hints.push("gluten_free".to_string());
        }
    }
}

/// Whether any period covers the given weekly instant. Periods crossing
/// midnight (and the week boundary) are handled by unrolling onto a weekly
/// minute axis; `close == open` encodes always-open.
fn is_open_at(periods: &[OpeningPeriod], day: u8, minute: u16) -> bool {
    let t = u32::from(day) * MINUTES_PER_DAY + u32::from(minute);
    periods.iter().any(|p| {
        let open = u32::from(p.open_day) * MINUTES_PER_DAY + u32::from(p.open_minute);
        let close = u32::from(p.close_day) * MINUTES_PER_DAY + u32::from(p.close_minute);
        if open == close {
            return true; // 24/7
        }
        if open < close {
            (open..close).contains(&t)
        } else {
            // Wraps past the end of the week.
            t >= open || t < close % MINUTES_PER_WEEK
        }
    })
}
