//! Engine facade.
//!
//! One [`StudyEngine`] per learner. The engine owns all mutable learner state
//! (ability posteriors, exposure counters, retention cards, scheduler
//! posteriors) and exposes two entry points:
//!
//! - [`StudyEngine::apply_response`]: fold one graded response into state.
//! - [`StudyEngine::next_step`]: decide what the learner should do next,
//!   returning a structured [`Explanation`].
//!
//! Everything is deterministic given the event stream, the clock values the
//! caller supplies, and the RNG seed: replaying the same log reconstructs
//! bit-identical state. The engine never reads a system clock and never
//! persists anything itself; [`StudyEngine::snapshot`] hands the caller a
//! serializable copy of all durable state.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::estimator::AbilityEstimator;
use crate::exposure;
use crate::retention::{self, Rating, RetentionParams};
use crate::sanitize::{finite_or, has_invalid_values};
use crate::scheduler::{ArmContext, TopicScheduler};
use crate::selector::{self, CandidateItem};
use crate::types::{
    BlueprintTarget, CandidateArm, ChosenKind, ClockContext, Explanation, ExposureRecord,
    ItemRecord, LearnerLoState, ResponseEvent, RetentionCard, Selection, Timestamp,
    TelemetryEvent,
};

// ==================== Session ====================

/// Per-session planning state, owned by the caller and threaded through
/// [`StudyEngine::next_step`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    /// Total session length in minutes
    pub session_minutes: f64,
    /// Minutes already spent in the retention lane
    pub retention_minutes_used: f64,
    /// Global utility scalar for fatigue; 1.0 when fresh
    pub fatigue_scalar: f64,
    /// LO currently in active training, if any
    pub active_lo: Option<String>,
}

impl SessionContext {
    pub fn new(session_minutes: f64) -> Self {
        Self {
            session_minutes,
            retention_minutes_used: 0.0,
            fatigue_scalar: 1.0,
            active_lo: None,
        }
    }
}

// ==================== Snapshot ====================

/// All durable engine state, serializable as one document. Restoring a
/// snapshot and replaying nothing yields the exact pre-snapshot engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub learner_id: String,
    pub lo_states: BTreeMap<String, LearnerLoState>,
    pub exposures: BTreeMap<String, ExposureRecord>,
    pub cards: BTreeMap<String, RetentionCard>,
    pub scheduler: TopicScheduler,
    pub serve_log: Vec<(String, Timestamp)>,
}

// ==================== Engine ====================

pub struct StudyEngine {
    config: EngineConfig,
    learner_id: String,
    estimator: AbilityEstimator,
    retention_params: RetentionParams,

    catalog: BTreeMap<String, ItemRecord>,
    blueprint: Vec<BlueprintTarget>,

    lo_states: BTreeMap<String, LearnerLoState>,
    exposures: BTreeMap<String, ExposureRecord>,
    cards: BTreeMap<String, RetentionCard>,
    scheduler: TopicScheduler,
    /// (system_id, timestamp) per serve; the sole source for delivered shares
    serve_log: Vec<(String, Timestamp)>,
    /// Serves per LO in the current session, for the scheduler's refill order
    session_served: BTreeMap<String, u32>,
}

impl StudyEngine {
    pub fn new(config: EngineConfig, learner_id: impl Into<String>) -> Self {
        let estimator = AbilityEstimator::new(config.clone());
        Self {
            config,
            learner_id: learner_id.into(),
            estimator,
            retention_params: RetentionParams::default(),
            catalog: BTreeMap::new(),
            blueprint: Vec::new(),
            lo_states: BTreeMap::new(),
            exposures: BTreeMap::new(),
            cards: BTreeMap::new(),
            scheduler: TopicScheduler::new(),
            serve_log: Vec::new(),
            session_served: BTreeMap::new(),
        }
    }

    // ==================== Loading ====================

    /// Load (or refresh) the item catalog. Bad rows are rejected and
    /// returned; good rows replace any previous record with the same id.
    pub fn load_catalog(&mut self, items: Vec<ItemRecord>) -> Vec<EngineError> {
        let mut rejected = Vec::new();
        for item in items {
            match validate_item(&item) {
                Ok(()) => {
                    self.catalog.insert(item.item_id.clone(), item);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "rejected catalog row");
                    rejected.push(err);
                }
            }
        }
        rejected
    }

    pub fn load_blueprint(&mut self, mut targets: Vec<BlueprintTarget>) {
        targets.sort_by(|a, b| a.system_id.cmp(&b.system_id));
        self.blueprint = targets;
        self.refresh_delivered();
    }

    pub fn lo_state(&self, lo_id: &str) -> Option<&LearnerLoState> {
        self.lo_states.get(lo_id)
    }

    pub fn card(&self, lo_id: &str) -> Option<&RetentionCard> {
        self.cards.get(lo_id)
    }

    pub fn blueprint(&self) -> &[BlueprintTarget] {
        &self.blueprint
    }

    // ==================== Responses ====================

    /// Fold one graded response into learner state.
    ///
    /// Updates the ability posterior, exposure counters, blueprint delivery,
    /// the scheduler's reward posterior, and the retention card (review if
    /// the LO already has a card, handoff if it just earned one).
    pub fn apply_response(
        &mut self,
        event: &ResponseEvent,
        clock: &ClockContext,
    ) -> Result<TelemetryEvent, EngineError> {
        let item = self
            .catalog
            .get(&event.item_id)
            .ok_or_else(|| EngineError::CatalogInconsistency {
                item_id: event.item_id.clone(),
                reason: "item not in catalog".to_string(),
            })?
            .clone();
        if item.lo_id != event.lo_id {
            return Err(EngineError::CatalogInconsistency {
                item_id: event.item_id.clone(),
                reason: format!("item belongs to {}, event says {}", item.lo_id, event.lo_id),
            });
        }

        let state = self
            .lo_states
            .entry(event.lo_id.clone())
            .or_insert_with(|| LearnerLoState::new(event.lo_id.clone()))
            .clone();
        let prev_se = state.se;

        let next = self.estimator.update(&state, &item, event.category)?;

        let exposure_rec = self
            .exposures
            .get(&event.item_id)
            .cloned()
            .unwrap_or_else(|| ExposureRecord::new(event.item_id.clone()));
        self.exposures.insert(
            event.item_id.clone(),
            exposure::record_serve(&exposure_rec, clock, &self.config),
        );

        self.serve_log.push((item.system_id.clone(), clock.now));
        self.refresh_delivered();
        *self.session_served.entry(event.lo_id.clone()).or_insert(0) += 1;

        let minutes = (item.median_time_seconds / 60.0).max(1.0 / 60.0);
        self.scheduler
            .observe(&event.lo_id, (prev_se - next.se) / minutes);
        self.scheduler.mark_served();
        self.scheduler.finish_cycle();

        // Retention lane bookkeeping: a carded LO treats every response as a
        // review; an uncarded LO that just confirmed mastery gets a card.
        if let Some(card) = self.cards.get(&event.lo_id).cloned() {
            let score = event.category as f64 / item.max_category() as f64;
            let time_ratio = event
                .response_time_seconds
                .map_or(1.0, |t| finite_or(t / item.median_time_seconds, 1.0).max(0.0));
            let rating = Rating::from_review(score, time_ratio);
            let reviewed = retention::review(&card, rating, clock.now, &self.retention_params, &self.config);
            self.cards.insert(event.lo_id.clone(), reviewed);
        } else if retention::handoff_ready(&next, &self.config) {
            let card = retention::handoff_card(
                event.lo_id.clone(),
                clock.now,
                &self.retention_params,
                &self.config,
            );
            tracing::info!(lo_id = %event.lo_id, due_ts = card.due_ts, "LO handed off to retention");
            self.cards.insert(event.lo_id.clone(), card);
        }

        let payload = serde_json::json!({
            "thetaHat": next.theta_hat,
            "se": next.se,
            "masteryProb": next.mastery_prob,
            "itemsAttempted": next.items_attempted,
        });
        self.lo_states.insert(event.lo_id.clone(), next);

        Ok(TelemetryEvent {
            kind: "response_applied".to_string(),
            learner_id: self.learner_id.clone(),
            lo_id: event.lo_id.clone(),
            item_id: Some(event.item_id.clone()),
            timestamp: clock.now,
            payload,
        })
    }

    /// Rebuild state from a raw event log. Events are applied in (timestamp,
    /// item_id) order regardless of input order; malformed events are dropped
    /// with a warning, exactly as live ingestion drops them.
    pub fn replay(&mut self, events: &[ResponseEvent]) -> Vec<TelemetryEvent> {
        let mut ordered: Vec<&ResponseEvent> = events.iter().collect();
        ordered.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.item_id.cmp(&b.item_id))
        });

        let mut telemetry = Vec::with_capacity(ordered.len());
        for event in ordered {
            let clock = ClockContext::from_utc_timestamp(event.timestamp);
            match self.apply_response(event, &clock) {
                Ok(t) => telemetry.push(t),
                Err(err) => {
                    tracing::warn!(item_id = %event.item_id, error = %err, "dropped event in replay");
                }
            }
        }
        telemetry
    }

    /// Reset per-session counters at the start of a new sitting.
    pub fn begin_session(&mut self) {
        self.session_served.clear();
        self.scheduler.finish_cycle();
    }

    // ==================== Planning ====================

    /// Decide the learner's next activity.
    ///
    /// The retention lane runs first while due cards and its minute
    /// allocation remain; otherwise the active LO keeps serving until a stop
    /// rule fires or its items run out. When the scheduler has to pick a new
    /// LO, that pick is returned as an LO-level [`Explanation`] and the
    /// following call serves an item inside it.
    pub fn next_step<R: Rng>(
        &mut self,
        session: &mut SessionContext,
        clock: &ClockContext,
        rng: &mut R,
    ) -> Result<Explanation, EngineError> {
        if let Some(explanation) = self.retention_step(session, clock, rng)? {
            return Ok(explanation);
        }

        // Active training: stay on the current LO while it still has signal.
        if let Some(lo_id) = session.active_lo.clone() {
            match self.select_for_lo(&lo_id, session.fatigue_scalar, false, 1.0, clock, rng) {
                Ok(Selection::Item { item_id, .. }) => {
                    return Ok(self.explain_item(&lo_id, &item_id, false, clock));
                }
                Ok(Selection::Stop(reason)) => {
                    tracing::info!(lo_id = %lo_id, ?reason, "active LO stopped");
                    self.scheduler.mark_excluded();
                    self.scheduler.finish_cycle();
                    session.active_lo = None;
                }
                Err(EngineError::EmptyCandidateSet) => {
                    self.scheduler.mark_excluded();
                    self.scheduler.finish_cycle();
                    session.active_lo = None;
                }
                Err(err) => return Err(err),
            }
        }

        let lo_id = self.schedule_lo(clock, rng)?;
        session.active_lo = Some(lo_id.clone());
        Ok(self.explain_lo(&lo_id))
    }

    /// Try to produce a retention review, honoring the lane's minute budget.
    fn retention_step<R: Rng>(
        &mut self,
        session: &mut SessionContext,
        clock: &ClockContext,
        rng: &mut R,
    ) -> Result<Option<Explanation>, EngineError> {
        let cards: Vec<RetentionCard> = self.cards.values().cloned().collect();
        let mut queue = match retention::due_queue(&cards, clock) {
            Ok(q) => q,
            Err(EngineError::NoDueCards) => return Ok(None),
            Err(err) => return Err(err),
        };

        let budget = retention::allocate_minutes(
            session.session_minutes,
            queue.max_overdue_days(),
            &self.config,
        );
        if session.retention_minutes_used >= budget {
            return Ok(None);
        }

        while let Some(entry) = queue.next() {
            // The boost carries the card's overdue priority into the utility
            // scale so reported utilities stay comparable with the active
            // lane; ordering inside the lane is already overdue-descending.
            match self.select_for_lo(
                &entry.lo_id,
                session.fatigue_scalar,
                true,
                entry.boost,
                clock,
                rng,
            ) {
                Ok(Selection::Item { item_id, .. }) => {
                    let explanation = self.explain_item(&entry.lo_id, &item_id, true, clock);
                    session.retention_minutes_used += explanation.estimated_minutes;
                    return Ok(Some(explanation));
                }
                // A stopped or fully-excluded LO just falls to the next card.
                Ok(Selection::Stop(_)) | Err(EngineError::EmptyCandidateSet) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    /// Run the cross-topic scheduler over every LO with selectable items.
    fn schedule_lo<R: Rng>(
        &mut self,
        clock: &ClockContext,
        rng: &mut R,
    ) -> Result<String, EngineError> {
        let mut arms: BTreeMap<String, ArmContext> = BTreeMap::new();
        for item in self.catalog.values() {
            let state = self
                .lo_states
                .get(&item.lo_id)
                .cloned()
                .unwrap_or_else(|| LearnerLoState::new(item.lo_id.clone()));

            // Stopped LOs live in the retention lane now, not here.
            if selector::check_stop(&state, &self.config).is_some() {
                continue;
            }

            let target = self.target_for(&item.system_id);
            let item_cooldown = self
                .exposures
                .get(&item.item_id)
                .map_or(0, |rec| rec.cooldown_until_ts);

            let entry = arms.entry(item.lo_id.clone()).or_insert_with(|| ArmContext {
                arm: CandidateArm {
                    lo_id: item.lo_id.clone(),
                    // Prior guess: an uncertain LO has more SE to give.
                    expected_delta_se_per_min: state.se * 0.1,
                    urgency_multiplier: 1.0
                        + self.config.urgency_deficit_gain * target.deficit(),
                    blueprint_multiplier: exposure::blueprint_multiplier(
                        target.target_share,
                        target.delivered_share,
                    ),
                },
                system_id: item.system_id.clone(),
                cooldown_until_ts: item_cooldown,
                blueprint: target.clone(),
                session_served: self.session_served.get(&item.lo_id).copied().unwrap_or(0),
            });
            // The LO frees up as soon as any of its items does.
            entry.cooldown_until_ts = entry.cooldown_until_ts.min(item_cooldown);
        }

        if arms.is_empty() {
            return Err(EngineError::EmptyCandidateSet);
        }

        let contexts: Vec<ArmContext> = arms.into_values().collect();
        self.scheduler
            .next_lo(&contexts, self.serve_log.len() as u64, clock, &self.config, rng)
    }

    /// Run the in-session selector for one LO's items.
    fn select_for_lo<R: Rng>(
        &self,
        lo_id: &str,
        fatigue_scalar: f64,
        retention_lane: bool,
        lane_boost: f64,
        clock: &ClockContext,
        rng: &mut R,
    ) -> Result<Selection, EngineError> {
        let state = self
            .lo_states
            .get(lo_id)
            .cloned()
            .unwrap_or_else(|| LearnerLoState::new(lo_id));

        let candidates: Vec<CandidateItem<'_>> = self
            .catalog
            .values()
            .filter(|item| item.lo_id == lo_id)
            .map(|item| CandidateItem {
                item,
                exposure: self.exposures.get(&item.item_id),
                blueprint_multiplier: {
                    let target = self.target_for(&item.system_id);
                    exposure::blueprint_multiplier(target.target_share, target.delivered_share)
                },
            })
            .collect();

        selector::select(
            &state,
            &candidates,
            fatigue_scalar * lane_boost,
            retention_lane,
            clock,
            &self.config,
            rng,
        )
    }

    fn explain_item(
        &self,
        lo_id: &str,
        item_id: &str,
        retention_lane: bool,
        clock: &ClockContext,
    ) -> Explanation {
        let item = &self.catalog[item_id];
        let target = self.target_for(&item.system_id);
        let state = self.lo_states.get(lo_id);
        let se = state.map_or(1.0, |s| s.se);
        Explanation {
            chosen_id: item_id.to_string(),
            kind: ChosenKind::Item,
            se,
            blueprint_drift: target.drift(),
            exposure_multiplier: exposure::multiplier(
                self.exposures.get(item_id),
                item,
                se,
                retention_lane,
                clock,
                &self.config,
            ),
            estimated_minutes: item.median_time_seconds / 60.0,
        }
    }

    /// LO-level explanation for a scheduler pick.
    fn explain_lo(&self, lo_id: &str) -> Explanation {
        let items: Vec<&ItemRecord> = self
            .catalog
            .values()
            .filter(|item| item.lo_id == lo_id)
            .collect();
        let system_id = items.first().map_or("", |item| item.system_id.as_str());
        let target = self.target_for(system_id);
        let estimated_minutes = if items.is_empty() {
            0.0
        } else {
            items.iter().map(|item| item.median_time_seconds).sum::<f64>()
                / items.len() as f64
                / 60.0
        };
        Explanation {
            chosen_id: lo_id.to_string(),
            kind: ChosenKind::Lo,
            se: self.lo_states.get(lo_id).map_or(1.0, |s| s.se),
            blueprint_drift: target.drift(),
            exposure_multiplier: 1.0,
            estimated_minutes,
        }
    }

    fn target_for(&self, system_id: &str) -> BlueprintTarget {
        self.blueprint
            .iter()
            .find(|t| t.system_id == system_id)
            .cloned()
            .unwrap_or_else(|| BlueprintTarget::new(system_id, 0.0))
    }

    fn refresh_delivered(&mut self) {
        let systems: Vec<String> = self.serve_log.iter().map(|(s, _)| s.clone()).collect();
        exposure::recompute_delivered(&mut self.blueprint, &systems);
    }

    // ==================== Persistence ====================

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            learner_id: self.learner_id.clone(),
            lo_states: self.lo_states.clone(),
            exposures: self.exposures.clone(),
            cards: self.cards.clone(),
            scheduler: self.scheduler.clone(),
            serve_log: self.serve_log.clone(),
        }
    }

    /// Rebuild an engine from a snapshot. The catalog and blueprint are
    /// loaded separately, as on a fresh engine.
    pub fn restore(config: EngineConfig, snapshot: EngineSnapshot) -> Self {
        let mut engine = Self::new(config, snapshot.learner_id.clone());
        engine.lo_states = snapshot.lo_states;
        engine.exposures = snapshot.exposures;
        engine.cards = snapshot.cards;
        engine.scheduler = snapshot.scheduler;
        engine.serve_log = snapshot.serve_log;
        engine
    }
}

fn validate_item(item: &ItemRecord) -> Result<(), EngineError> {
    if item.categories() < 2 {
        return Err(EngineError::DegenerateItem {
            item_id: item.item_id.clone(),
        });
    }
    if has_invalid_values(&item.tau) || !item.b.is_finite() {
        return Err(EngineError::CatalogInconsistency {
            item_id: item.item_id.clone(),
            reason: "non-finite parameters".to_string(),
        });
    }
    if item.tau.windows(2).any(|pair| pair[1] < pair[0]) {
        return Err(EngineError::CatalogInconsistency {
            item_id: item.item_id.clone(),
            reason: "thresholds not ascending".to_string(),
        });
    }
    if !(item.median_time_seconds.is_finite() && item.median_time_seconds > 0.0) {
        return Err(EngineError::CatalogInconsistency {
            item_id: item.item_id.clone(),
            reason: "median time must be positive".to_string(),
        });
    }
    Ok(())
}
