//! Engine configuration.
//!
//! Every tunable constant lives here with the defaults the rest of the crate
//! is tested against. Callers construct one `EngineConfig` per deployment and
//! pass it to the engine; there is no environment or file loading in this
//! crate.

use serde::{Deserialize, Serialize};

use crate::types::{Timestamp, SECS_PER_DAY, SECS_PER_HOUR};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // ---- Ability estimator ----
    /// Elo K-factor during cold start
    pub elo_k: f64,
    /// Elo base rating (maps to theta = 0)
    pub elo_base_rating: f64,
    /// Elo logistic scale (rating points per theta unit)
    pub elo_scale: f64,
    /// Attempts served purely by the Elo bridge
    pub cold_start_attempts: u32,
    /// Attempt index at which the full estimator carries 100% weight
    pub full_weight_attempt: u32,
    /// Cold-start weight at the first blended attempt
    pub cold_start_blend: f64,
    /// Mastery cut point on the theta scale
    pub theta_cut: f64,
    /// Number of Gauss-Hermite quadrature points for EAP
    pub quadrature_points: usize,

    // ---- Mastery & stop rules ----
    pub mastery_threshold: f64,
    /// Half-width of the confirmatory probe window around theta_hat
    pub probe_window: f64,
    /// SE target for the precision stop rule
    pub stop_se: f64,
    /// Minimum attempts before the precision stop rule can fire
    pub stop_min_attempts: u32,
    /// Plateau threshold on consecutive SE deltas
    pub plateau_delta: f64,

    // ---- Selector ----
    /// Randomesque pool size
    pub top_k: usize,

    // ---- Exposure ----
    /// Item-level cooldown after a serve
    pub item_cooldown_secs: Timestamp,
    /// Dampened window after cooldown lapses
    pub post_cooldown_damp_secs: Timestamp,
    pub post_cooldown_multiplier: f64,
    /// Down-weight for already-mastered items outside the retention lane
    pub mastered_down_weight: f64,
    pub mastered_mean_score: f64,
    pub mastered_se: f64,

    // ---- Blueprint ----
    /// Allowed distance (share points) from the blueprint target
    pub rail_tolerance: f64,
    /// Deficit above which cooldowns and rails yield to catch-up
    pub deficit_override: f64,
    /// Deficit-to-urgency gain for scheduler arms
    pub urgency_deficit_gain: f64,

    // ---- Scheduler ----
    /// Minimum number of live arms the scheduler keeps materialized
    pub min_queue: usize,
    /// Prior belief spread for unobserved arms (delta-SE per minute)
    pub arm_prior_sd: f64,
    /// Floor on the posterior spread so arms never collapse to a point
    pub arm_min_sd: f64,

    // ---- Retention lane ----
    /// Ceiling on retention minutes as a share of the session
    pub retention_cap: f64,
    /// Raised ceiling when any card is badly overdue
    pub retention_cap_overdue: f64,
    /// Overdue days that trigger the raised ceiling
    pub overdue_escalation_days: f64,
    /// Target recall probability for FSRS scheduling
    pub desired_retention: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            elo_k: 16.0,
            elo_base_rating: 1500.0,
            elo_scale: 400.0,
            cold_start_attempts: 5,
            full_weight_attempt: 9,
            cold_start_blend: 0.7,
            theta_cut: 0.0,
            quadrature_points: 41,

            mastery_threshold: 0.85,
            probe_window: 0.3,
            stop_se: 0.20,
            stop_min_attempts: 12,
            plateau_delta: 0.02,

            top_k: 5,

            item_cooldown_secs: 96 * SECS_PER_HOUR,
            post_cooldown_damp_secs: 7 * SECS_PER_DAY,
            post_cooldown_multiplier: 0.5,
            mastered_down_weight: 0.6,
            mastered_mean_score: 0.9,
            mastered_se: 0.15,

            rail_tolerance: 0.05,
            deficit_override: 0.08,
            urgency_deficit_gain: 3.0,

            min_queue: 2,
            arm_prior_sd: 0.5,
            arm_min_sd: 0.01,

            retention_cap: 0.4,
            retention_cap_overdue: 0.6,
            overdue_escalation_days: 7.0,
            desired_retention: 0.9,
        }
    }
}

impl EngineConfig {
    /// Cold-start weight for the given attempt count. 1.0 through the pure
    /// Elo phase, then a linear slide from `cold_start_blend` down to zero at
    /// `full_weight_attempt`.
    pub fn cold_weight(&self, attempts: u32) -> f64 {
        if attempts < self.cold_start_attempts {
            return 1.0;
        }
        if attempts >= self.full_weight_attempt {
            return 0.0;
        }
        let span = (self.full_weight_attempt - self.cold_start_attempts) as f64;
        self.cold_start_blend * (self.full_weight_attempt - attempts) as f64 / span
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cold_weight_schedule() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.cold_weight(1), 1.0);
        assert_eq!(cfg.cold_weight(4), 1.0);
        assert!((cfg.cold_weight(5) - 0.7).abs() < 1e-12);
        assert!((cfg.cold_weight(6) - 0.525).abs() < 1e-12);
        assert!((cfg.cold_weight(8) - 0.175).abs() < 1e-12);
        assert_eq!(cfg.cold_weight(9), 0.0);
        assert_eq!(cfg.cold_weight(40), 0.0);
    }

    #[test]
    fn test_defaults_match_contract() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.item_cooldown_secs, 96 * 3600);
        assert_eq!(cfg.quadrature_points, 41);
        assert!((cfg.rail_tolerance - 0.05).abs() < 1e-12);
    }
}
