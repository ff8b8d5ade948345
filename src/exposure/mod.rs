//! Exposure and blueprint controller.
//!
//! Exposure caps are hard exclusions, not soft preferences: an item at its
//! daily or weekly cap, or inside its cooldown, gets multiplier 0 and drops
//! out of the candidate set entirely. Blueprint drift only scales utilities.
//!
//! Counters reset exactly at the day/week boundaries supplied by the caller
//! through [`ClockContext`]; this module never looks at a wall clock.

use std::collections::BTreeMap;

use crate::config::EngineConfig;
use crate::types::{BlueprintTarget, ClockContext, ExposureRecord, ItemRecord};

/// Daily serve cap per (learner, item). At the cap, the item is excluded.
pub const DAILY_CAP: u32 = 1;

/// Weekly serve cap per (learner, item).
pub const WEEKLY_CAP: u32 = 2;

/// Record one serve: `(exposure, now) -> exposure'`. Rolls the day/week
/// windows first, then counts the serve and arms the cooldown.
pub fn record_serve(
    record: &ExposureRecord,
    clock: &ClockContext,
    config: &EngineConfig,
) -> ExposureRecord {
    let mut next = record.clone();
    roll_windows(&mut next, clock);
    next.count_today += 1;
    next.count_this_week += 1;
    next.last_served_ts = Some(clock.now);
    next.cooldown_until_ts = clock.now + config.item_cooldown_secs;
    next
}

/// Exposure multiplier for a candidate item. Zero means hard exclusion.
///
/// `lo_se` is the learner's current SE on the item's LO; together with the
/// item's running mean score it identifies already-mastered material, which
/// is down-weighted everywhere except the retention lane.
pub fn multiplier(
    record: Option<&ExposureRecord>,
    item: &ItemRecord,
    lo_se: f64,
    retention_lane: bool,
    clock: &ClockContext,
    config: &EngineConfig,
) -> f64 {
    let mut m = match record {
        None => 1.0,
        Some(rec) => {
            let (today, this_week) = effective_counts(rec, clock);
            if today >= DAILY_CAP || this_week >= WEEKLY_CAP || clock.now < rec.cooldown_until_ts {
                return 0.0;
            }
            // Post-cooldown damping only applies to items that have actually
            // been served before.
            if rec.last_served_ts.is_some()
                && clock.now < rec.cooldown_until_ts + config.post_cooldown_damp_secs
            {
                config.post_cooldown_multiplier
            } else {
                1.0
            }
        }
    };

    if !retention_lane && item.mean_score > config.mastered_mean_score && lo_se < config.mastered_se
    {
        m *= config.mastered_down_weight;
    }
    m
}

/// Blueprint multiplier from target vs. delivered share.
///
/// Over-delivered systems are squeezed down to a floor of 0.2; under-delivered
/// systems are boosted up to a ceiling of 1.5, growing with the deficit.
pub fn blueprint_multiplier(target_share: f64, delivered_share: f64) -> f64 {
    let drift = delivered_share - target_share;
    if drift > 0.0 {
        (1.0 - drift * 2.0).max(0.2)
    } else {
        (1.0 - drift * 3.0).min(1.5)
    }
}

/// Whether serving one more item of `system_id` keeps delivery inside the
/// rail. `total_served` is the all-system serve count backing
/// `delivered_share`.
pub fn within_rail(
    target: &BlueprintTarget,
    total_served: u64,
    config: &EngineConfig,
) -> bool {
    let projected = projected_share(target.delivered_share, total_served);
    projected - target.target_share <= config.rail_tolerance
        || target.deficit() > config.deficit_override
}

/// Delivered share of a system after one more serve of that system.
pub fn projected_share(delivered_share: f64, total_served: u64) -> f64 {
    (delivered_share * total_served as f64 + 1.0) / (total_served as f64 + 1.0)
}

/// Recompute `delivered_share` for every target from the full serve history.
/// Idempotent: the same history always yields the same shares, with no
/// incremental drift.
pub fn recompute_delivered(targets: &mut [BlueprintTarget], served_systems: &[String]) {
    let total = served_systems.len() as f64;
    let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
    for system in served_systems {
        *counts.entry(system.as_str()).or_insert(0) += 1;
    }
    for target in targets.iter_mut() {
        let count = counts.get(target.system_id.as_str()).copied().unwrap_or(0);
        target.delivered_share = if total > 0.0 { count as f64 / total } else { 0.0 };
    }
}

/// Roll counters forward when the clock has crossed a window boundary.
fn roll_windows(record: &mut ExposureRecord, clock: &ClockContext) {
    if record.day_anchor != clock.day_start {
        record.count_today = 0;
        record.day_anchor = clock.day_start;
    }
    if record.week_anchor != clock.week_start {
        record.count_this_week = 0;
        record.week_anchor = clock.week_start;
    }
}

/// Counts as they stand in the current windows, without mutating the record.
fn effective_counts(record: &ExposureRecord, clock: &ClockContext) -> (u32, u32) {
    let today = if record.day_anchor == clock.day_start {
        record.count_today
    } else {
        0
    };
    let this_week = if record.week_anchor == clock.week_start {
        record.count_this_week
    } else {
        0
    };
    (today, this_week)
}
