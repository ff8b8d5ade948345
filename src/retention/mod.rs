//! Spaced-retention lane (FSRS).
//!
//! LOs that finish active training get handed off to a retention card. Each
//! review updates the card's memory stability and difficulty with the FSRS-4.5
//! update rules and reschedules the next review at the interval where recall
//! probability decays to the configured target.
//!
//! Review ratings are derived deterministically from the graded score and the
//! response-time ratio; no caller-supplied rating enters the model.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::types::{ClockContext, LearnerLoState, RetentionCard, Timestamp, SECS_PER_DAY, SE_HISTORY_LEN};

const DECAY: f64 = -0.5;
const FACTOR: f64 = 19.0 / 81.0;

/// Per-overdue-day boost applied to review priority and urgency.
const OVERDUE_BOOST_PER_DAY: f64 = 0.1;

// ==================== Parameters ====================

/// FSRS-4.5 weight vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionParams {
    pub w: [f64; 17],
}

impl Default for RetentionParams {
    fn default() -> Self {
        Self {
            w: [
                0.4, 0.6, 2.4, 5.8, // w0-w3: initial stability per rating
                4.93, 0.94, 0.86, 0.01, 1.49, // w4-w8
                0.14, 0.94, 2.18, 0.05, 0.34, // w9-w13
                1.26, 0.29, 2.61, // w14-w16
            ],
        }
    }
}

// ==================== Ratings ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rating {
    Again = 1,
    Hard = 2,
    Good = 3,
    Easy = 4,
}

impl Rating {
    /// Derive a rating from a graded review outcome.
    ///
    /// `score_fraction` is category / max_category; `time_ratio` is response
    /// time over the item's median time. Below half credit is a lapse; a
    /// passing score grades on speed.
    pub fn from_review(score_fraction: f64, time_ratio: f64) -> Self {
        if score_fraction < 0.5 {
            return Self::Again;
        }
        if time_ratio < 0.75 && score_fraction >= 1.0 {
            Self::Easy
        } else if time_ratio < 1.5 {
            Self::Good
        } else {
            Self::Hard
        }
    }
}

// ==================== Memory model ====================

/// Recall probability after `elapsed_days` at the given stability.
pub fn retrievability(stability: f64, elapsed_days: f64) -> f64 {
    if stability <= 0.0 {
        return 0.0;
    }
    (1.0 + FACTOR * elapsed_days.max(0.0) / stability).powf(DECAY)
}

/// Interval (days) at which retrievability decays to `desired_retention`.
fn next_interval(stability: f64, desired_retention: f64) -> f64 {
    let safe_retention = desired_retention.clamp(0.0001, 0.9999);
    let interval = stability / FACTOR * (safe_retention.powf(1.0 / DECAY) - 1.0);
    interval.clamp(1.0, 36_500.0)
}

fn initial_difficulty(w: &[f64; 17], rating: i32) -> f64 {
    let d = w[4] - (rating - 3) as f64 * w[5];
    d.clamp(1.0, 10.0) / 10.0
}

fn next_difficulty(w: &[f64; 17], d: f64, rating: i32) -> f64 {
    let d_10 = d * 10.0;
    let delta = -(rating - 3) as f64;
    let d_new = d_10 + w[6] * delta;
    let d_mean = w[7] * (w[4] - 3.0 * w[5]) + (1.0 - w[7]) * d_new;
    d_mean.clamp(1.0, 10.0) / 10.0
}

fn next_recall_stability(w: &[f64; 17], d: f64, s: f64, r: f64, rating: i32) -> f64 {
    let d_10 = d * 10.0;
    let hard_penalty = if rating == 2 { w[15] } else { 1.0 };
    let easy_bonus = if rating == 4 { w[16] } else { 1.0 };

    let new_s = s
        * (1.0
            + w[8].exp()
                * (11.0 - d_10)
                * s.powf(-w[9])
                * ((1.0 - r) * w[10]).exp_m1()
                * hard_penalty
                * easy_bonus);
    new_s.max(0.1)
}

fn next_forget_stability(w: &[f64; 17], d: f64, s: f64, r: f64) -> f64 {
    let d_10 = d * 10.0;
    let new_s =
        w[11] * d_10.powf(-w[12]) * ((s + 1.0).powf(w[13]) - 1.0) * (1.0 - r).powf(w[14]).exp();
    new_s.clamp(0.1, s)
}

// ==================== Handoff ====================

/// Whether a LO is ready to leave active training for the retention lane:
/// confirmed mastery with a full, non-increasing SE history.
pub fn handoff_ready(state: &LearnerLoState, config: &EngineConfig) -> bool {
    state.mastery_prob >= config.mastery_threshold
        && state.probe_confirmed
        && state.last_se_history.len() == SE_HISTORY_LEN
        && state
            .last_se_history
            .windows(2)
            .all(|pair| pair[1] <= pair[0] + f64::EPSILON)
}

/// Create the initial card for a LO entering the retention lane, seeded as a
/// first Good review at `now`.
pub fn handoff_card(
    lo_id: impl Into<String>,
    now: Timestamp,
    params: &RetentionParams,
    config: &EngineConfig,
) -> RetentionCard {
    let rating = Rating::Good as i32;
    let stability = params.w[(rating - 1) as usize].max(0.1);
    let difficulty = initial_difficulty(&params.w, rating);
    let interval = next_interval(stability, config.desired_retention);

    RetentionCard {
        lo_id: lo_id.into(),
        stability,
        difficulty,
        due_ts: now + (interval * SECS_PER_DAY as f64) as Timestamp,
        last_reviewed_ts: now,
        reps: 1,
        lapses: 0,
    }
}

// ==================== Review ====================

/// Apply one review: `(card, rating, now) -> card'`.
pub fn review(
    card: &RetentionCard,
    rating: Rating,
    now: Timestamp,
    params: &RetentionParams,
    config: &EngineConfig,
) -> RetentionCard {
    let w = &params.w;
    let rating_val = rating as i32;
    let elapsed_days = ((now - card.last_reviewed_ts) as f64 / SECS_PER_DAY as f64).max(0.0);
    let r = retrievability(card.stability, elapsed_days);

    let difficulty = next_difficulty(w, card.difficulty, rating_val);
    let (stability, lapses) = if rating == Rating::Again {
        (
            next_forget_stability(w, card.difficulty, card.stability, r),
            card.lapses + 1,
        )
    } else {
        (
            next_recall_stability(w, card.difficulty, card.stability, r, rating_val),
            card.lapses,
        )
    };

    let interval = next_interval(stability, config.desired_retention);

    tracing::debug!(
        lo_id = %card.lo_id,
        rating = rating_val,
        stability,
        interval,
        "retention review"
    );

    RetentionCard {
        lo_id: card.lo_id.clone(),
        stability,
        difficulty,
        due_ts: now + (interval * SECS_PER_DAY as f64) as Timestamp,
        last_reviewed_ts: now,
        reps: card.reps + 1,
        lapses,
    }
}

// ==================== Due queue ====================

/// One due card with its priority boost.
#[derive(Debug, Clone)]
pub struct DueEntry {
    pub lo_id: String,
    pub overdue_days: f64,
    /// Urgency boost, 1 + 0.1 per overdue day
    pub boost: f64,
}

/// Due cards ordered most-overdue first, ties toward the lower lo_id.
#[derive(Debug, Clone)]
pub struct DueQueue {
    entries: Vec<DueEntry>,
    cursor: usize,
}

impl DueQueue {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_overdue_days(&self) -> f64 {
        self.entries.first().map_or(0.0, |e| e.overdue_days)
    }

    pub fn restart(&mut self) {
        self.cursor = 0;
    }

    pub fn peek(&self) -> Option<&DueEntry> {
        self.entries.get(self.cursor)
    }
}

impl Iterator for DueQueue {
    type Item = DueEntry;

    fn next(&mut self) -> Option<DueEntry> {
        let entry = self.entries.get(self.cursor).cloned()?;
        self.cursor += 1;
        Some(entry)
    }
}

/// Build the review queue for this session.
pub fn due_queue(cards: &[RetentionCard], clock: &ClockContext) -> Result<DueQueue, EngineError> {
    let mut entries: Vec<DueEntry> = cards
        .iter()
        .filter(|card| card.due_ts <= clock.now)
        .map(|card| {
            let overdue = card.overdue_days(clock.now);
            DueEntry {
                lo_id: card.lo_id.clone(),
                overdue_days: overdue,
                boost: 1.0 + OVERDUE_BOOST_PER_DAY * overdue,
            }
        })
        .collect();

    if entries.is_empty() {
        return Err(EngineError::NoDueCards);
    }

    entries.sort_by(|a, b| {
        b.overdue_days
            .total_cmp(&a.overdue_days)
            .then_with(|| a.lo_id.cmp(&b.lo_id))
    });

    Ok(DueQueue { entries, cursor: 0 })
}

/// Minutes of the session the retention lane may consume. The cap escalates
/// when any card is badly overdue.
pub fn allocate_minutes(session_minutes: f64, max_overdue_days: f64, config: &EngineConfig) -> f64 {
    let cap = if max_overdue_days > config.overdue_escalation_days {
        config.retention_cap_overdue
    } else {
        config.retention_cap
    };
    session_minutes * cap
}

/// Current recall probability for every card, in input order.
pub fn batch_retrievability(cards: &[RetentionCard], now: Timestamp) -> Vec<f64> {
    cards
        .par_iter()
        .map(|card| {
            let elapsed = (now - card.last_reviewed_ts) as f64 / SECS_PER_DAY as f64;
            retrievability(card.stability, elapsed)
        })
        .collect()
}
