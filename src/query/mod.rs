// ============================================================================
// Query Model & Condition Evaluator
// ============================================================================

pub mod evaluator;
pub mod model;

pub use evaluator::{evaluate, JoinedContainers};
pub use model::{
    Condition, ConditionOperator, Join, JoinKind, JoinSelect, OrderBy, OrderDirection, Query,
    ID_FIELD, LAST_PERSISTED_FIELD,
};
