//! In-session item selector.
//!
//! Ranks the active LO's eligible items by information rate and picks one at
//! random from the top K (randomesque exposure control). Stop rules run
//! before any ranking: a LO that has hit its precision target, plateaued, or
//! confirmed mastery yields a [`Selection::Stop`] instead of an item.
//!
//! Utility of an item at the learner's current ability:
//!
//!   U = I(theta_hat) / median_minutes
//!       * blueprint_multiplier * exposure_multiplier * fatigue_scalar
//!
//! All ordering is total: utility descending, then item_id ascending, so two
//! runs with the same state and seed pick the same item.

use rand::Rng;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::estimator::fisher_information;
use crate::exposure;
use crate::sanitize::safe_divisor;
use crate::types::{
    ClockContext, ExposureRecord, ItemRecord, LearnerLoState, Selection, StopReason,
    SE_HISTORY_LEN,
};

/// One item under consideration, with its exposure record (if any) and the
/// blueprint multiplier of its system.
#[derive(Debug, Clone, Copy)]
pub struct CandidateItem<'a> {
    pub item: &'a ItemRecord,
    pub exposure: Option<&'a ExposureRecord>,
    pub blueprint_multiplier: f64,
}

/// A ranked candidate ready for the randomesque draw.
#[derive(Debug, Clone)]
struct RankedItem {
    item_id: String,
    utility: f64,
}

/// Check the three stop rules against the LO state. Precision is checked
/// first, then plateau, then confirmed mastery; the first match wins.
pub fn check_stop(state: &LearnerLoState, config: &EngineConfig) -> Option<StopReason> {
    if state.se <= config.stop_se && state.items_attempted >= config.stop_min_attempts {
        return Some(StopReason::PrecisionReached);
    }
    if state.last_se_history.len() == SE_HISTORY_LEN {
        let plateaued = state
            .last_se_history
            .windows(2)
            .all(|pair| (pair[1] - pair[0]).abs() < config.plateau_delta);
        if plateaued {
            return Some(StopReason::SePlateaued);
        }
    }
    if state.mastery_prob >= config.mastery_threshold && state.probe_confirmed {
        return Some(StopReason::MasteryConfirmed);
    }
    None
}

/// Select the next item for the active LO, or a stop signal.
///
/// `fatigue_scalar` scales every utility identically and so never changes the
/// ranking; it is carried so the reported utility matches what the session
/// planner compared against other lanes. `retention_lane` suppresses both the
/// mastered-item down-weight and the stop rules, which govern active
/// training only.
pub fn select<R: Rng>(
    state: &LearnerLoState,
    candidates: &[CandidateItem<'_>],
    fatigue_scalar: f64,
    retention_lane: bool,
    clock: &ClockContext,
    config: &EngineConfig,
    rng: &mut R,
) -> Result<Selection, EngineError> {
    if !retention_lane {
        if let Some(reason) = check_stop(state, config) {
            return Ok(Selection::Stop(reason));
        }
    }

    let mut ranked = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let item = candidate.item;
        let exposure_mult = exposure::multiplier(
            candidate.exposure,
            item,
            state.se,
            retention_lane,
            clock,
            config,
        );
        if exposure_mult == 0.0 {
            continue;
        }

        let info = fisher_information(item, state.theta_hat)?;
        let minutes = safe_divisor(item.median_time_seconds / 60.0);
        let utility = info / minutes
            * candidate.blueprint_multiplier
            * exposure_mult
            * fatigue_scalar;

        ranked.push(RankedItem {
            item_id: item.item_id.clone(),
            utility,
        });
    }

    if ranked.is_empty() {
        return Err(EngineError::EmptyCandidateSet);
    }

    // Utility descending, item_id ascending. Utilities are finite here
    // (fisher_information rejects degenerate items), so total_cmp is a
    // genuine total order.
    ranked.sort_by(|a, b| {
        b.utility
            .total_cmp(&a.utility)
            .then_with(|| a.item_id.cmp(&b.item_id))
    });

    let k = config.top_k.min(ranked.len());
    let picked = &ranked[rng.gen_range(0..k)];

    tracing::debug!(
        lo_id = %state.lo_id,
        item_id = %picked.item_id,
        utility = picked.utility,
        pool = k,
        "selected item"
    );

    Ok(Selection::Item {
        item_id: picked.item_id.clone(),
        utility: picked.utility,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn item(id: &str, b: f64, median_secs: f64) -> ItemRecord {
        ItemRecord {
            item_id: id.to_string(),
            lo_id: "lo-1".to_string(),
            system_id: "sys-a".to_string(),
            b,
            tau: vec![0.0],
            median_time_seconds: median_secs,
            mean_score: 0.5,
        }
    }

    fn state() -> LearnerLoState {
        let mut s = LearnerLoState::new("lo-1");
        s.theta_hat = 0.0;
        s.se = 0.6;
        s
    }

    fn clock() -> ClockContext {
        ClockContext::from_utc_timestamp(1_704_276_000)
    }

    #[test]
    fn test_stop_precision() {
        let cfg = EngineConfig::default();
        let mut s = state();
        s.se = 0.19;
        s.items_attempted = 12;
        assert_eq!(check_stop(&s, &cfg), Some(StopReason::PrecisionReached));

        // Not enough attempts yet.
        s.items_attempted = 11;
        assert_eq!(check_stop(&s, &cfg), None);
    }

    #[test]
    fn test_stop_plateau_needs_full_history() {
        let cfg = EngineConfig::default();
        let mut s = state();
        s.last_se_history = vec![0.50, 0.495, 0.49, 0.488];
        assert_eq!(check_stop(&s, &cfg), None);

        s.push_se(0.487);
        assert_eq!(check_stop(&s, &cfg), Some(StopReason::SePlateaued));

        // A real drop anywhere in the window keeps the session going.
        s.last_se_history = vec![0.50, 0.45, 0.44, 0.435, 0.43];
        assert_eq!(check_stop(&s, &cfg), None);
    }

    #[test]
    fn test_stop_mastery_requires_probe() {
        let cfg = EngineConfig::default();
        let mut s = state();
        s.mastery_prob = 0.9;
        assert_eq!(check_stop(&s, &cfg), None);

        s.probe_confirmed = true;
        assert_eq!(check_stop(&s, &cfg), Some(StopReason::MasteryConfirmed));
    }

    #[test]
    fn test_select_is_deterministic_under_seed() {
        let cfg = EngineConfig::default();
        let s = state();
        let items: Vec<ItemRecord> = (0..8)
            .map(|i| item(&format!("it-{}", i), -0.6 + 0.2 * i as f64, 60.0))
            .collect();
        let candidates: Vec<CandidateItem<'_>> = items
            .iter()
            .map(|it| CandidateItem {
                item: it,
                exposure: None,
                blueprint_multiplier: 1.0,
            })
            .collect();

        let mut a = ChaCha8Rng::seed_from_u64(7);
        let mut b = ChaCha8Rng::seed_from_u64(7);
        let first = select(&s, &candidates, 1.0, false, &clock(), &cfg, &mut a).unwrap();
        let second = select(&s, &candidates, 1.0, false, &clock(), &cfg, &mut b).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_single_dominant_item_wins_any_seed() {
        let cfg = EngineConfig::default();
        let s = state();
        // One fast, well-targeted item against slow off-target ones; with
        // K > pool the draw still lands inside the ranked pool.
        let fast = item("it-fast", 0.0, 30.0);
        let slow = item("it-slow", 3.0, 300.0);
        let candidates = vec![
            CandidateItem {
                item: &slow,
                exposure: None,
                blueprint_multiplier: 1.0,
            },
            CandidateItem {
                item: &fast,
                exposure: None,
                blueprint_multiplier: 1.0,
            },
        ];

        for seed in 0..16 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            match select(&s, &candidates, 1.0, false, &clock(), &cfg, &mut rng).unwrap() {
                Selection::Item { item_id, .. } => {
                    assert!(item_id == "it-fast" || item_id == "it-slow")
                }
                other => panic!("unexpected selection {:?}", other),
            }
        }
    }

    #[test]
    fn test_ties_rank_by_item_id() {
        let mut cfg = EngineConfig::default();
        cfg.top_k = 1;
        let s = state();
        // Identical parameters: identical utility, lowest id must win.
        let x = item("it-b", 0.0, 60.0);
        let y = item("it-a", 0.0, 60.0);
        let candidates = vec![
            CandidateItem {
                item: &x,
                exposure: None,
                blueprint_multiplier: 1.0,
            },
            CandidateItem {
                item: &y,
                exposure: None,
                blueprint_multiplier: 1.0,
            },
        ];

        let mut rng = ChaCha8Rng::seed_from_u64(0);
        match select(&s, &candidates, 1.0, false, &clock(), &cfg, &mut rng).unwrap() {
            Selection::Item { item_id, .. } => assert_eq!(item_id, "it-a"),
            other => panic!("unexpected selection {:?}", other),
        }
    }

    #[test]
    fn test_all_excluded_is_an_error() {
        let cfg = EngineConfig::default();
        let s = state();
        let it = item("it-1", 0.0, 60.0);
        let clk = clock();
        let exposed = exposure::record_serve(&ExposureRecord::new("it-1"), &clk, &cfg);
        let candidates = vec![CandidateItem {
            item: &it,
            exposure: Some(&exposed),
            blueprint_multiplier: 1.0,
        }];

        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let err = select(&s, &candidates, 1.0, false, &clk, &cfg, &mut rng).unwrap_err();
        assert!(matches!(err, EngineError::EmptyCandidateSet));
    }

    #[test]
    fn test_stop_checked_before_candidates() {
        let cfg = EngineConfig::default();
        let mut s = state();
        s.se = 0.15;
        s.items_attempted = 20;

        // Empty candidate list would otherwise error.
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let out = select(&s, &[], 1.0, false, &clock(), &cfg, &mut rng).unwrap();
        assert_eq!(out, Selection::Stop(StopReason::PrecisionReached));
    }
}
