//! Review model: findings, the phase state machine, and persistence.

pub mod finding;
pub mod persistence;
pub mod state;

pub use finding::{Conflict, ConflictEntry, Finding, FindingKey, OutcomeStatus, Severity, TaskOutcome};
pub use persistence::{
    InMemoryStatePersistence, JsonFileStatePersistence, PersistedReview, PersistenceError,
    StatePersistence,
};
pub use state::{
    Checkpoint, ConsolidationStats, DiffFile, DiffStats, ErrorEntry, FindingSet, ReviewContext,
    ReviewKey, ReviewPhase, ReviewState, TransitionError,
};

#[cfg(feature = "heavy-state")]
pub use persistence::RocksDbStatePersistence;
