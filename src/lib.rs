//! Deterministic adaptive study engine.
//!
//! Decides, for one learner at a time, what to study next: which learning
//! objective (LO), which item, and when to stop drilling and move material
//! into spaced review. Five cooperating parts:
//!
//! - [`estimator`]: per-LO ability posterior from graded responses. Elo
//!   cold start, then an EAP-updated Rasch/partial-credit model.
//! - [`exposure`]: item exposure caps, cooldowns, and blueprint drift
//!   control.
//! - [`selector`]: randomesque in-session item choice by information rate,
//!   plus the stop rules.
//! - [`scheduler`]: Thompson sampling across LOs on observed SE reduction
//!   per minute.
//! - [`retention`]: FSRS spaced-review lane for mastered LOs.
//!
//! [`engine::StudyEngine`] ties them together behind two calls:
//! `apply_response` folds a graded response into state, `next_step` returns
//! the next activity with a structured explanation.
//!
//! The crate is a pure library: no clocks, no I/O, no storage. Callers
//! supply every timestamp through [`types::ClockContext`] and every random
//! draw through a seeded RNG, so identical inputs reproduce identical
//! decisions bit for bit, and a raw event log can be replayed into the exact
//! same state on any machine.

pub mod config;
pub mod engine;
pub mod error;
pub mod estimator;
pub mod exposure;
pub mod numeric;
pub mod retention;
pub mod sanitize;
pub mod scheduler;
pub mod selector;
pub mod types;

pub use config::EngineConfig;
pub use engine::{EngineSnapshot, SessionContext, StudyEngine};
pub use error::EngineError;
pub use estimator::{AbilityEstimate, AbilityEstimator};
pub use scheduler::TopicScheduler;
pub use types::{
    BlueprintTarget, ClockContext, Explanation, ItemRecord, LearnerLoState, ResponseEvent,
    RetentionCard, Selection, StopReason,
};
