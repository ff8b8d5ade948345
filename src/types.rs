//! Common types and constants.
//!
//! Shared data structures used across all engine modules. Every persistable
//! type derives `Serialize`/`Deserialize`; the caller owns storage and hands
//! reconstructed snapshots back to the engine.

use serde::{Deserialize, Serialize};

// ==================== Constants ====================

/// Numerical stability epsilon
pub const EPSILON: f64 = 1e-10;

/// Floor for standard errors (the invariant is `se > 0`)
pub const MIN_SE: f64 = 1e-3;

/// Seconds per hour
pub const SECS_PER_HOUR: i64 = 3_600;

/// Seconds per day
pub const SECS_PER_DAY: i64 = 86_400;

/// Length of the rolling SE history kept for plateau detection
pub const SE_HISTORY_LEN: usize = 5;

/// Unix timestamp in seconds. Always supplied by the caller; the engine never
/// reads a system clock.
pub type Timestamp = i64;

// ==================== Time context ====================

/// Caller-supplied clock. `day_start` and `week_start` are the local-midnight
/// and local-week boundaries for `now`; exposure windows reset exactly there.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClockContext {
    pub now: Timestamp,
    pub day_start: Timestamp,
    pub week_start: Timestamp,
}

impl ClockContext {
    /// Convenience constructor for replay from a raw event log: UTC midnight
    /// and Monday-start weeks derived from the event timestamp.
    pub fn from_utc_timestamp(now: Timestamp) -> Self {
        let day_start = now - now.rem_euclid(SECS_PER_DAY);
        // 1970-01-01 was a Thursday; shift by 3 days for Monday-start weeks.
        let days = day_start.div_euclid(SECS_PER_DAY);
        let week_start = day_start - (days + 3).rem_euclid(7) * SECS_PER_DAY;
        Self {
            now,
            day_start,
            week_start,
        }
    }
}

// ==================== Catalog ====================

/// One calibrated item. Core fields (`b`, `tau`) are refreshed only by the
/// weekly EM re-fit job; this engine never fits item parameters itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemRecord {
    pub item_id: String,
    pub lo_id: String,
    /// Blueprint category
    pub system_id: String,
    /// Rasch difficulty
    pub b: f64,
    /// Ordered GPCM thresholds, length = categories - 1
    pub tau: Vec<f64>,
    pub median_time_seconds: f64,
    pub mean_score: f64,
}

impl ItemRecord {
    /// Number of response categories (at least 2 for a usable item).
    pub fn categories(&self) -> usize {
        self.tau.len() + 1
    }

    /// Highest valid response category.
    pub fn max_category(&self) -> u32 {
        self.tau.len() as u32
    }
}

// ==================== Learner state ====================

/// Per-(learner, LO) ability state. Created on first attempt, mutated only by
/// the ability estimator, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnerLoState {
    pub lo_id: String,
    /// Ability point estimate
    pub theta_hat: f64,
    /// Standard error, always > 0
    pub se: f64,
    /// Elo cold-start rating, bridged to theta via (R - 1500) / 400
    pub rating: f64,
    pub items_attempted: u32,
    /// P(theta > theta_cut) under the current posterior
    pub mastery_prob: f64,
    /// Last 5 SE values, oldest first, for plateau detection
    pub last_se_history: Vec<f64>,
    /// Difficulty of the most recent confirmatory probe, if any
    pub last_probe_b: Option<f64>,
    /// Attempt index at which mastery_prob first crossed the threshold
    pub mastery_crossed_at: Option<u32>,
    /// True once a confirmatory probe landed inside the mastery window
    pub probe_confirmed: bool,
}

impl LearnerLoState {
    pub fn new(lo_id: impl Into<String>) -> Self {
        Self {
            lo_id: lo_id.into(),
            theta_hat: 0.0,
            se: 1.0,
            rating: 1500.0,
            items_attempted: 0,
            mastery_prob: 0.5,
            last_se_history: Vec::new(),
            last_probe_b: None,
            mastery_crossed_at: None,
            probe_confirmed: false,
        }
    }

    /// Appends to the rolling SE history, dropping the oldest entry.
    pub fn push_se(&mut self, se: f64) {
        if self.last_se_history.len() == SE_HISTORY_LEN {
            self.last_se_history.remove(0);
        }
        self.last_se_history.push(se);
    }
}

// ==================== Exposure ====================

/// Per-(learner, item) exposure counters. Counters reset exactly at the
/// window boundaries supplied through [`ClockContext`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExposureRecord {
    pub item_id: String,
    pub last_served_ts: Option<Timestamp>,
    pub count_today: u32,
    pub count_this_week: u32,
    pub cooldown_until_ts: Timestamp,
    /// Day window the `count_today` counter belongs to
    pub day_anchor: Timestamp,
    /// Week window the `count_this_week` counter belongs to
    pub week_anchor: Timestamp,
}

impl ExposureRecord {
    pub fn new(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            last_served_ts: None,
            count_today: 0,
            count_this_week: 0,
            cooldown_until_ts: 0,
            day_anchor: 0,
            week_anchor: 0,
        }
    }
}

// ==================== Blueprint ====================

/// Target vs. delivered share for one blueprint system. `delivered_share` is
/// always recomputed from the full serve history, never drifted incrementally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlueprintTarget {
    pub system_id: String,
    pub target_share: f64,
    pub delivered_share: f64,
}

impl BlueprintTarget {
    pub fn new(system_id: impl Into<String>, target_share: f64) -> Self {
        Self {
            system_id: system_id.into(),
            target_share,
            delivered_share: 0.0,
        }
    }

    /// delivered - target; positive means over-delivered.
    pub fn drift(&self) -> f64 {
        self.delivered_share - self.target_share
    }

    /// target - delivered, clamped at zero; positive means under-delivered.
    pub fn deficit(&self) -> f64 {
        (self.target_share - self.delivered_share).max(0.0)
    }
}

// ==================== Retention ====================

/// Per-(learner, LO) spaced-retention card with FSRS memory parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionCard {
    pub lo_id: String,
    pub stability: f64,
    pub difficulty: f64,
    pub due_ts: Timestamp,
    pub last_reviewed_ts: Timestamp,
    pub reps: u32,
    pub lapses: u32,
}

impl RetentionCard {
    /// Days past due at `now`; zero when not yet due.
    pub fn overdue_days(&self, now: Timestamp) -> f64 {
        ((now - self.due_ts) as f64 / SECS_PER_DAY as f64).max(0.0)
    }
}

// ==================== Scheduler ====================

/// Ephemeral arm snapshot, one per LO under consideration by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateArm {
    pub lo_id: String,
    pub expected_delta_se_per_min: f64,
    pub urgency_multiplier: f64,
    pub blueprint_multiplier: f64,
}

// ==================== Events & explanations ====================

/// One item response, replayed in timestamp order to reconstruct all learner
/// state deterministically from empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEvent {
    pub learner_id: String,
    pub item_id: String,
    pub lo_id: String,
    pub category: u32,
    pub timestamp: Timestamp,
    /// Observed response time; None when the client did not report one.
    #[serde(default)]
    pub response_time_seconds: Option<f64>,
}

/// What kind of thing a decision chose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChosenKind {
    Item,
    Lo,
}

/// Structured "why this next" record for the transparency UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Explanation {
    pub chosen_id: String,
    pub kind: ChosenKind,
    pub se: f64,
    pub blueprint_drift: f64,
    pub exposure_multiplier: f64,
    pub estimated_minutes: f64,
}

/// Telemetry record compatible with an external append-only log. Returned,
/// never persisted here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    pub kind: String,
    pub learner_id: String,
    pub lo_id: String,
    pub item_id: Option<String>,
    pub timestamp: Timestamp,
    pub payload: serde_json::Value,
}

// ==================== Selection ====================

/// Why the selector stopped serving the active LO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// SE at or under the precision target with enough attempts
    PrecisionReached,
    /// The last 5 SE values moved less than the plateau delta
    SePlateaued,
    /// Mastery threshold crossed and a confirmatory probe served
    MasteryConfirmed,
}

/// Outcome of in-session selection for the active LO.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Selection {
    Item { item_id: String, utility: f64 },
    Stop(StopReason),
}
