//! Cross-topic scheduler.
//!
//! Thompson sampling over LOs: each LO is an arm whose reward is the observed
//! SE reduction per minute of study. Arms keep a running mean and variance
//! (Welford); a draw from each posterior, scaled by urgency and blueprint
//! pressure, decides which LO the session works on next.
//!
//! Unobserved arms draw from a wide prior centered on the caller's expected
//! reward, so new LOs get explored instead of starved. All candidate lists
//! are sorted by lo_id before sampling and all ties break toward the lower
//! lo_id, keeping the draw sequence identical across runs with the same seed.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::exposure;
use crate::types::{BlueprintTarget, CandidateArm, ClockContext, Timestamp};

// ==================== Arm posterior ====================

/// Running reward statistics for one LO arm.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArmPosterior {
    pub n: u64,
    pub mean: f64,
    m2: f64,
}

impl ArmPosterior {
    /// Welford online update with one reward observation.
    pub fn observe(&mut self, reward: f64) {
        self.n += 1;
        let delta = reward - self.mean;
        self.mean += delta / self.n as f64;
        self.m2 += delta * (reward - self.mean);
    }

    /// Sample variance; undefined below two observations.
    pub fn variance(&self) -> f64 {
        if self.n < 2 {
            return 0.0;
        }
        self.m2 / (self.n - 1) as f64
    }

    /// One posterior draw. Unobserved arms use a wide prior around
    /// `prior_mean`; observed arms draw from the mean with the standard error
    /// of the mean, floored so the arm never collapses to a point mass.
    fn sample<R: Rng>(&self, prior_mean: f64, config: &EngineConfig, rng: &mut R) -> f64 {
        let z = standard_normal(rng);
        if self.n == 0 {
            return prior_mean + config.arm_prior_sd * z;
        }
        let sd = self.variance().sqrt().max(config.arm_min_sd);
        self.mean + sd / (self.n as f64).sqrt() * z
    }
}

/// Standard normal draw via Box-Muller. Two uniform draws per call, always
/// consumed in the same order.
fn standard_normal<R: Rng>(rng: &mut R) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

// ==================== Candidate context ====================

/// Everything the scheduler needs to know about one LO arm this cycle.
#[derive(Debug, Clone)]
pub struct ArmContext {
    pub arm: CandidateArm,
    /// Blueprint system of the LO's items
    pub system_id: String,
    /// LO-level cooldown; the arm is ineligible until then unless its system
    /// is in deep blueprint deficit
    pub cooldown_until_ts: Timestamp,
    pub blueprint: BlueprintTarget,
    /// Times this LO was scheduled in the current session
    pub session_served: u32,
}

impl ArmContext {
    fn eligible(&self, clock: &ClockContext, config: &EngineConfig) -> bool {
        clock.now >= self.cooldown_until_ts || self.blueprint.deficit() > config.deficit_override
    }
}

/// Scheduler lifecycle for one scheduling cycle:
/// Idle -> Sampling -> Selected -> (Served | Excluded) -> Idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerPhase {
    Idle,
    Sampling,
    Selected,
    Served,
    Excluded,
}

// ==================== Scheduler ====================

/// Per-learner scheduler state. Posteriors persist across sessions through
/// serde; the phase is per cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicScheduler {
    posteriors: BTreeMap<String, ArmPosterior>,
    phase: SchedulerPhase,
    selected_lo: Option<String>,
}

impl Default for TopicScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicScheduler {
    pub fn new() -> Self {
        Self {
            posteriors: BTreeMap::new(),
            phase: SchedulerPhase::Idle,
            selected_lo: None,
        }
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.phase
    }

    pub fn posterior(&self, lo_id: &str) -> Option<&ArmPosterior> {
        self.posteriors.get(lo_id)
    }

    /// Record an observed reward (SE reduction per minute) for a LO.
    pub fn observe(&mut self, lo_id: &str, delta_se_per_min: f64) {
        self.posteriors
            .entry(lo_id.to_string())
            .or_default()
            .observe(delta_se_per_min);
    }

    /// Pick the next LO to work on.
    ///
    /// `total_served` is the all-system serve count behind the blueprint
    /// shares; it anchors the rail projection for the top pick.
    pub fn next_lo<R: Rng>(
        &mut self,
        arms: &[ArmContext],
        total_served: u64,
        clock: &ClockContext,
        config: &EngineConfig,
        rng: &mut R,
    ) -> Result<String, EngineError> {
        if arms.is_empty() {
            return Err(EngineError::EmptyCandidateSet);
        }
        self.phase = SchedulerPhase::Sampling;

        let mut ordered: Vec<&ArmContext> = arms.iter().collect();
        ordered.sort_by(|a, b| a.arm.lo_id.cmp(&b.arm.lo_id));

        let mut pool: Vec<&ArmContext> = ordered
            .iter()
            .copied()
            .filter(|ctx| ctx.eligible(clock, config))
            .collect();

        // Keep the queue from running dry: top up with the least-served
        // cooled-down arms until the minimum pool size is met.
        if pool.len() < config.min_queue {
            let mut benched: Vec<&ArmContext> = ordered
                .iter()
                .copied()
                .filter(|ctx| !ctx.eligible(clock, config))
                .collect();
            benched.sort_by(|a, b| {
                a.session_served
                    .cmp(&b.session_served)
                    .then_with(|| a.blueprint.delivered_share.total_cmp(&b.blueprint.delivered_share))
                    .then_with(|| a.arm.lo_id.cmp(&b.arm.lo_id))
            });
            for ctx in benched {
                if pool.len() >= config.min_queue {
                    break;
                }
                pool.push(ctx);
            }
            pool.sort_by(|a, b| a.arm.lo_id.cmp(&b.arm.lo_id));
        }

        let mut scored: Vec<(&ArmContext, f64)> = pool
            .iter()
            .map(|ctx| {
                let draw = self
                    .posteriors
                    .get(&ctx.arm.lo_id)
                    .cloned()
                    .unwrap_or_default()
                    .sample(ctx.arm.expected_delta_se_per_min, config, rng);
                let score = draw * ctx.arm.urgency_multiplier * ctx.arm.blueprint_multiplier;
                (*ctx, score)
            })
            .collect();
        scored.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then_with(|| a.0.arm.lo_id.cmp(&b.0.arm.lo_id))
        });

        // Rail check down the ranking: refuse any pick that would push its
        // system past the tolerance while the system is not in deficit.
        for (ctx, score) in &scored {
            if exposure::within_rail(&ctx.blueprint, total_served, config) {
                self.phase = SchedulerPhase::Selected;
                self.selected_lo = Some(ctx.arm.lo_id.clone());
                tracing::debug!(
                    lo_id = %ctx.arm.lo_id,
                    score,
                    system_id = %ctx.system_id,
                    "scheduled LO"
                );
                return Ok(ctx.arm.lo_id.clone());
            }
            tracing::warn!(
                lo_id = %ctx.arm.lo_id,
                system_id = %ctx.system_id,
                delivered = ctx.blueprint.delivered_share,
                target = ctx.blueprint.target_share,
                "blueprint rail refused LO"
            );
        }

        self.phase = SchedulerPhase::Idle;
        Err(EngineError::RailViolation {
            system_id: scored[0].0.system_id.clone(),
        })
    }

    /// Confirm that the selected LO actually got an item served.
    pub fn mark_served(&mut self) {
        if self.phase == SchedulerPhase::Selected {
            self.phase = SchedulerPhase::Served;
        }
    }

    /// Record that the selected LO could not be served (its items were all
    /// excluded by the time selection ran).
    pub fn mark_excluded(&mut self) {
        if self.phase == SchedulerPhase::Selected {
            self.phase = SchedulerPhase::Excluded;
        }
    }

    /// Close out the cycle, whether or not a serve happened.
    pub fn finish_cycle(&mut self) {
        self.phase = SchedulerPhase::Idle;
        self.selected_lo = None;
    }

    pub fn selected_lo(&self) -> Option<&str> {
        self.selected_lo.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn arm(lo_id: &str, expected: f64) -> CandidateArm {
        CandidateArm {
            lo_id: lo_id.to_string(),
            expected_delta_se_per_min: expected,
            urgency_multiplier: 1.0,
            blueprint_multiplier: 1.0,
        }
    }

    fn ctx(lo_id: &str, expected: f64) -> ArmContext {
        ArmContext {
            arm: arm(lo_id, expected),
            system_id: "sys-a".to_string(),
            cooldown_until_ts: 0,
            blueprint: BlueprintTarget::new("sys-a", 0.5),
            session_served: 0,
        }
    }

    fn clock() -> ClockContext {
        ClockContext::from_utc_timestamp(1_704_276_000)
    }

    #[test]
    fn test_welford_mean_and_variance() {
        let mut post = ArmPosterior::default();
        for reward in [0.02, 0.04, 0.06] {
            post.observe(reward);
        }
        assert_eq!(post.n, 3);
        assert!((post.mean - 0.04).abs() < 1e-12);
        assert!((post.variance() - 0.0004).abs() < 1e-12);
    }

    #[test]
    fn test_next_lo_deterministic_under_seed() {
        let cfg = EngineConfig::default();
        let arms = vec![ctx("lo-a", 0.05), ctx("lo-b", 0.05), ctx("lo-c", 0.05)];

        let mut sched_a = TopicScheduler::new();
        let mut sched_b = TopicScheduler::new();
        let mut rng_a = ChaCha8Rng::seed_from_u64(11);
        let mut rng_b = ChaCha8Rng::seed_from_u64(11);

        let pick_a = sched_a.next_lo(&arms, 10, &clock(), &cfg, &mut rng_a).unwrap();
        let pick_b = sched_b.next_lo(&arms, 10, &clock(), &cfg, &mut rng_b).unwrap();
        assert_eq!(pick_a, pick_b);
    }

    #[test]
    fn test_input_order_does_not_change_pick() {
        let cfg = EngineConfig::default();
        let forward = vec![ctx("lo-a", 0.05), ctx("lo-b", 0.05), ctx("lo-c", 0.05)];
        let reversed: Vec<ArmContext> = forward.iter().rev().cloned().collect();

        let mut sched_a = TopicScheduler::new();
        let mut sched_b = TopicScheduler::new();
        let mut rng_a = ChaCha8Rng::seed_from_u64(3);
        let mut rng_b = ChaCha8Rng::seed_from_u64(3);

        let pick_a = sched_a
            .next_lo(&forward, 10, &clock(), &cfg, &mut rng_a)
            .unwrap();
        let pick_b = sched_b
            .next_lo(&reversed, 10, &clock(), &cfg, &mut rng_b)
            .unwrap();
        assert_eq!(pick_a, pick_b);
    }

    #[test]
    fn test_rewarded_arm_wins_in_the_long_run() {
        let cfg = EngineConfig::default();
        let mut sched = TopicScheduler::new();
        // lo-a reliably reduces SE fast, lo-b barely moves it.
        for _ in 0..30 {
            sched.observe("lo-a", 0.08);
            sched.observe("lo-b", 0.005);
        }
        let arms = vec![ctx("lo-a", 0.05), ctx("lo-b", 0.05)];

        let mut wins_a = 0;
        for seed in 0..50 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mut fresh = sched.clone();
            if fresh.next_lo(&arms, 10, &clock(), &cfg, &mut rng).unwrap() == "lo-a" {
                wins_a += 1;
            }
            fresh.finish_cycle();
        }
        assert!(wins_a > 45, "lo-a won only {}/50", wins_a);
    }

    #[test]
    fn test_cooldown_excludes_unless_deficit() {
        let cfg = EngineConfig::default();
        let clk = clock();

        let mut cooling = ctx("lo-a", 0.5);
        cooling.cooldown_until_ts = clk.now + 3_600;
        let open = ctx("lo-b", 0.01);

        // min_queue is 2, so the cooled arm is topped up into the pool, but
        // a third open arm keeps it benched.
        let third = ctx("lo-c", 0.01);
        let mut sched = TopicScheduler::new();
        // Pin posteriors tight so the draw ordering is forced.
        for _ in 0..50 {
            sched.observe("lo-a", 0.5);
            sched.observe("lo-b", 0.01);
            sched.observe("lo-c", 0.01);
        }
        let arms = vec![cooling.clone(), open, third];
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let pick = sched.next_lo(&arms, 10, &clk, &cfg, &mut rng).unwrap();
        assert_ne!(pick, "lo-a");

        // Deep blueprint deficit overrides the cooldown.
        let mut starved = cooling;
        starved.blueprint = BlueprintTarget::new("sys-a", 0.5);
        starved.blueprint.delivered_share = 0.1;
        let arms = vec![starved, ctx("lo-b", 0.01), ctx("lo-c", 0.01)];
        sched.finish_cycle();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let pick = sched.next_lo(&arms, 10, &clk, &cfg, &mut rng).unwrap();
        assert_eq!(pick, "lo-a");
    }

    #[test]
    fn test_queue_refill_when_everything_cooling() {
        let cfg = EngineConfig::default();
        let clk = clock();

        let mut a = ctx("lo-a", 0.05);
        a.cooldown_until_ts = clk.now + 3_600;
        a.session_served = 4;
        let mut b = ctx("lo-b", 0.05);
        b.cooldown_until_ts = clk.now + 3_600;
        b.session_served = 1;
        let mut c = ctx("lo-c", 0.05);
        c.cooldown_until_ts = clk.now + 3_600;
        c.session_served = 2;

        // All cooling: the two least-served arms (lo-b, lo-c) form the pool.
        let mut sched = TopicScheduler::new();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let pick = sched
            .next_lo(&[a, b, c], 10, &clk, &cfg, &mut rng)
            .unwrap();
        assert_ne!(pick, "lo-a");
    }

    #[test]
    fn test_rail_refusal_falls_through_and_errors() {
        let cfg = EngineConfig::default();
        let clk = clock();

        // Both arms sit in a system already far over target.
        let mut over = ctx("lo-a", 0.05);
        over.blueprint = BlueprintTarget::new("sys-a", 0.10);
        over.blueprint.delivered_share = 0.30;
        let mut over2 = ctx("lo-b", 0.05);
        over2.blueprint = over.blueprint.clone();

        let mut sched = TopicScheduler::new();
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let err = sched
            .next_lo(&[over, over2], 100, &clk, &cfg, &mut rng)
            .unwrap_err();
        assert!(matches!(err, EngineError::RailViolation { ref system_id } if system_id == "sys-a"));

        // A within-rail arm further down the ranking still gets picked.
        let mut hot_but_blocked = ctx("lo-a", 0.9);
        hot_but_blocked.blueprint = BlueprintTarget::new("sys-a", 0.10);
        hot_but_blocked.blueprint.delivered_share = 0.30;
        let mut modest = ctx("lo-b", 0.01);
        modest.system_id = "sys-b".to_string();
        modest.blueprint = BlueprintTarget::new("sys-b", 0.50);
        modest.blueprint.delivered_share = 0.45;

        sched.finish_cycle();
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let pick = sched
            .next_lo(&[hot_but_blocked, modest], 100, &clk, &cfg, &mut rng)
            .unwrap();
        assert_eq!(pick, "lo-b");
    }

    #[test]
    fn test_phase_transitions() {
        let cfg = EngineConfig::default();
        let mut sched = TopicScheduler::new();
        assert_eq!(sched.phase(), SchedulerPhase::Idle);

        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let arms = vec![ctx("lo-a", 0.05)];
        sched.next_lo(&arms, 10, &clock(), &cfg, &mut rng).unwrap();
        assert_eq!(sched.phase(), SchedulerPhase::Selected);
        assert_eq!(sched.selected_lo(), Some("lo-a"));

        sched.mark_served();
        assert_eq!(sched.phase(), SchedulerPhase::Served);

        sched.finish_cycle();
        assert_eq!(sched.phase(), SchedulerPhase::Idle);
        assert_eq!(sched.selected_lo(), None);

        // The excluded branch of the cycle.
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        sched.next_lo(&arms, 10, &clock(), &cfg, &mut rng).unwrap();
        sched.mark_excluded();
        assert_eq!(sched.phase(), SchedulerPhase::Excluded);
        sched.finish_cycle();
        assert_eq!(sched.phase(), SchedulerPhase::Idle);
    }

    #[test]
    fn test_posterior_survives_serde_round_trip() {
        let mut sched = TopicScheduler::new();
        sched.observe("lo-a", 0.03);
        sched.observe("lo-a", 0.05);

        let json = serde_json::to_string(&sched).unwrap();
        let restored: TopicScheduler = serde_json::from_str(&json).unwrap();
        let post = restored.posterior("lo-a").unwrap();
        assert_eq!(post.n, 2);
        assert!((post.mean - 0.04).abs() < 1e-12);
    }
}
