//! Ability estimator.
//!
//! Maintains the per-LO ability posterior from graded item responses.
//!
//! Three regimes by attempt count:
//! - Cold start (attempts < 5): Elo-style rating update with fixed K,
//!   bridged to the ability scale via theta = (R - 1500) / 400.
//! - Warm transition (attempts 5..=8): cold-start and full-estimator outputs
//!   blended, 70/30 in favor of cold start at attempt 5, sliding linearly to
//!   100% full estimator at attempt 9.
//! - Full estimator (attempts >= 9): slope-1 Rasch model extended to graded
//!   responses with a partial-credit (GPCM) likelihood. The ability point
//!   estimate is refreshed by EAP integration on a fixed 41-point
//!   Gauss-Hermite grid centred on the previous posterior; the standard
//!   error accumulates Fisher information, adding each item's information
//!   at the estimate it was administered at.
//!
//! Every path is a pure function of (state, item, response); identical input
//! produces bit-identical output.

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::numeric::{normal_cdf, GaussHermite, SCALING_D};
use crate::types::{ItemRecord, LearnerLoState, MIN_SE};

/// Point estimate triple exposed to selectors and schedulers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AbilityEstimate {
    pub theta_hat: f64,
    pub se: f64,
    pub mastery_prob: f64,
}

/// GPCM category probabilities at `theta` for a calibrated item.
///
/// Cumulative logits s_k = sum_{v<=k} D * (theta - b - tau_v), softmaxed with
/// max-subtraction. A 2-category item reduces exactly to the Rasch model.
pub fn category_probs(item: &ItemRecord, theta: f64) -> Result<Vec<f64>, EngineError> {
    if item.categories() < 2 {
        return Err(EngineError::DegenerateItem {
            item_id: item.item_id.clone(),
        });
    }

    let mut logits = Vec::with_capacity(item.categories());
    let mut acc = 0.0;
    logits.push(0.0);
    for &t in &item.tau {
        acc += SCALING_D * (theta - item.b - t);
        logits.push(acc);
    }

    let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let mut probs: Vec<f64> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f64 = probs.iter().sum();
    for p in probs.iter_mut() {
        *p /= sum;
    }
    Ok(probs)
}

/// Fisher information of the slope-1 GPCM at `theta`: D^2 times the variance
/// of the category score.
pub fn fisher_information(item: &ItemRecord, theta: f64) -> Result<f64, EngineError> {
    let probs = category_probs(item, theta)?;
    let mean: f64 = probs.iter().enumerate().map(|(k, p)| k as f64 * p).sum();
    let second: f64 = probs
        .iter()
        .enumerate()
        .map(|(k, p)| (k as f64) * (k as f64) * p)
        .sum();
    Ok(SCALING_D * SCALING_D * (second - mean * mean).max(0.0))
}

pub struct AbilityEstimator {
    config: EngineConfig,
    quad: GaussHermite,
}

impl AbilityEstimator {
    pub fn new(config: EngineConfig) -> Self {
        let quad = GaussHermite::new(config.quadrature_points);
        Self { config, quad }
    }

    /// Apply one graded response: `(state, item, category) -> state'`.
    ///
    /// Fails with `InvalidResponse` when the category is outside
    /// `[0, len(tau)]` and `DegenerateItem` for items with fewer than two
    /// categories. The input state is never mutated.
    pub fn update(
        &self,
        state: &LearnerLoState,
        item: &ItemRecord,
        category: u32,
    ) -> Result<LearnerLoState, EngineError> {
        if item.categories() < 2 {
            return Err(EngineError::DegenerateItem {
                item_id: item.item_id.clone(),
            });
        }
        if category > item.max_category() {
            return Err(EngineError::InvalidResponse {
                item_id: item.item_id.clone(),
                category,
                max_category: item.max_category(),
            });
        }

        let mut next = state.clone();
        let attempts = state.items_attempted + 1;
        next.items_attempted = attempts;

        // Elo bridge runs on every attempt so the blend always has a live
        // cold-start opinion.
        let score = category as f64 / item.max_category() as f64;
        next.rating = self.elo_update(state.rating, item.b, score);
        let theta_cold = (next.rating - self.config.elo_base_rating) / self.config.elo_scale;
        let se_cold = (1.0 / (attempts as f64).sqrt()).clamp(0.25, 1.0);

        // Full estimator: EAP refresh of the point estimate; the standard
        // error accrues the item's Fisher information at the pre-update
        // estimate, the ability the item was administered at.
        let theta_full = self.eap_update(state, item, category)?;
        let prior_se = state.se.max(MIN_SE);
        let info = fisher_information(item, state.theta_hat)?;
        let se_full = (1.0 / (1.0 / (prior_se * prior_se) + info))
            .sqrt()
            .max(MIN_SE);

        let w = self.config.cold_weight(attempts);
        next.theta_hat = w * theta_cold + (1.0 - w) * theta_full;
        next.se = (w * se_cold + (1.0 - w) * se_full).max(MIN_SE);

        let crossed_before = state.mastery_crossed_at.is_some();
        next.mastery_prob = normal_cdf((next.theta_hat - self.config.theta_cut) / next.se);
        next.push_se(next.se);

        if next.mastery_prob >= self.config.mastery_threshold {
            if next.mastery_crossed_at.is_none() {
                next.mastery_crossed_at = Some(attempts);
            }
            // A probe only confirms mastery if it was served after the
            // threshold was first crossed.
            if crossed_before && (item.b - next.theta_hat).abs() <= self.config.probe_window {
                next.last_probe_b = Some(item.b);
                next.probe_confirmed = true;
            }
        } else {
            next.mastery_crossed_at = None;
            next.probe_confirmed = false;
            next.last_probe_b = None;
        }

        Ok(next)
    }

    /// Current point estimates for a state.
    pub fn estimate(&self, state: &LearnerLoState) -> AbilityEstimate {
        AbilityEstimate {
            theta_hat: state.theta_hat,
            se: state.se,
            mastery_prob: normal_cdf((state.theta_hat - self.config.theta_cut) / state.se.max(MIN_SE)),
        }
    }

    fn elo_update(&self, rating: f64, item_b: f64, score: f64) -> f64 {
        let item_rating = self.config.elo_base_rating + self.config.elo_scale * item_b;
        let expected =
            1.0 / (1.0 + 10.0_f64.powf((item_rating - rating) / self.config.elo_scale));
        rating + self.config.elo_k * (score - expected)
    }

    /// One EAP mean refresh: previous posterior N(theta_hat, se) as prior,
    /// GPCM likelihood of the observed category, fixed grid, fixed summation
    /// order.
    fn eap_update(
        &self,
        state: &LearnerLoState,
        item: &ItemRecord,
        category: u32,
    ) -> Result<f64, EngineError> {
        let points = self.quad.prior_points(state.theta_hat, state.se.max(MIN_SE));

        let mut mass = 0.0;
        let mut mean_acc = 0.0;
        for &(theta, w) in &points {
            let like = category_probs(item, theta)?[category as usize];
            let p = w * like;
            mass += p;
            mean_acc += p * theta;
        }

        if mass <= f64::MIN_POSITIVE {
            // Likelihood underflowed everywhere on the grid; keep the prior.
            tracing::warn!(
                item_id = %item.item_id,
                lo_id = %state.lo_id,
                "EAP mass underflow, keeping prior mean"
            );
            return Ok(state.theta_hat);
        }

        Ok(mean_acc / mass)
    }
}
