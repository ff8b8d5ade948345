//! Error taxonomy.
//!
//! Nothing in this crate is fatal to a host process: every condition below is
//! returned as a value and the caller decides how to recover. `EmptyCandidateSet`
//! and `NoDueCards` are expected steady-state signals rather than failures.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// Malformed response event. Recoverable: drop the event and alert.
    #[error("response category {category} outside [0, {max_category}] for item {item_id}")]
    InvalidResponse {
        item_id: String,
        category: u32,
        max_category: u32,
    },

    /// Item with fewer than 2 response categories cannot be scored.
    #[error("item {item_id} has fewer than 2 response categories")]
    DegenerateItem { item_id: String },

    /// Bad catalog row. The item is excluded from candidate sets until the
    /// external re-fit job delivers a fixed record.
    #[error("catalog entry {item_id} is inconsistent: {reason}")]
    CatalogInconsistency { item_id: String, reason: String },

    /// No items remain after exposure exclusion. The caller should fall back
    /// to the scheduler and pick a different learning objective.
    #[error("no eligible items remain after exposure exclusion")]
    EmptyCandidateSet,

    /// The retention queue is empty for this session. Non-fatal: skip the
    /// retention lane entirely.
    #[error("retention queue has no due cards")]
    NoDueCards,

    /// Every candidate would breach a blueprint rail or hard cap. The engine
    /// refuses rather than over-deliver.
    #[error("selection would breach the blueprint rail for system {system_id}")]
    RailViolation { system_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_subject() {
        let err = EngineError::InvalidResponse {
            item_id: "it-1".to_string(),
            category: 7,
            max_category: 3,
        };
        assert!(err.to_string().contains("it-1"));
        assert!(err.to_string().contains('7'));

        let err = EngineError::RailViolation {
            system_id: "cardio".to_string(),
        };
        assert!(err.to_string().contains("cardio"));
    }
}
